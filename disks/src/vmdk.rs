// VMDK monolithic sparse disk images.
//
// Little-endian 512-byte sparse header (magic "KDMV"), embedded text
// descriptor, then a redundant and a primary grain directory, each
// followed by its grain-table array (512 entries per table). A grain
// table entry is the sector offset of a grain; 0 means unallocated
// (reads zero), 1 means allocated-but-zeroed. Grains are appended at
// end of file in write order.

use std::collections::HashMap;

use log::{debug, info};
use rand::random;

use fathom_core::{
    check_aligned, checked_range, Backend, BlockContainer, Error, OpenMode, Result,
};

pub const SECTOR_SIZE: u32 = 512;
const VMDK_MAGIC: u32 = 0x564D_444B; // "KDMV" little-endian
const GTES_PER_GT: u32 = 512;
const DEFAULT_GRAIN_SECTORS: u64 = 128; // 64 KiB
const DESCRIPTOR_SECTORS: u64 = 20;

#[derive(Debug, Clone)]
struct SparseHeader {
    capacity_sectors: u64,
    grain_sectors: u64,
    descriptor_offset: u64,
    descriptor_sectors: u64,
    rgd_offset: u64,
    gd_offset: u64,
    overhead_sectors: u64,
}

impl SparseHeader {
    fn parse(buf: &[u8]) -> Result<Self> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != VMDK_MAGIC {
            return Err(Error::BadFormat("VMDK magic missing".into()));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != 1 && version != 3 {
            return Err(Error::BadFormat(format!("unsupported VMDK version {}", version)));
        }
        // Newline detection bytes betray text-mode transfer damage.
        if buf[0x49] != 0x0A || buf[0x4A] != 0x20 || buf[0x4B] != 0x0D || buf[0x4C] != 0x0A {
            return Err(Error::BadFormat("VMDK newline check bytes corrupted".into()));
        }
        let gtes_per_gt = u32::from_le_bytes(buf[0x2C..0x30].try_into().unwrap());
        if gtes_per_gt != GTES_PER_GT {
            return Err(Error::BadFormat("VMDK grain tables must hold 512 entries".into()));
        }
        let header = Self {
            capacity_sectors: u64::from_le_bytes(buf[0x0C..0x14].try_into().unwrap()),
            grain_sectors: u64::from_le_bytes(buf[0x14..0x1C].try_into().unwrap()),
            descriptor_offset: u64::from_le_bytes(buf[0x1C..0x24].try_into().unwrap()),
            descriptor_sectors: u64::from_le_bytes(buf[0x24..0x2C].try_into().unwrap()),
            rgd_offset: u64::from_le_bytes(buf[0x30..0x38].try_into().unwrap()),
            gd_offset: u64::from_le_bytes(buf[0x38..0x40].try_into().unwrap()),
            overhead_sectors: u64::from_le_bytes(buf[0x40..0x48].try_into().unwrap()),
        };
        let grain_bytes = header.grain_sectors * 512;
        if grain_bytes < (4 << 10) || !grain_bytes.is_power_of_two() {
            return Err(Error::BadFormat("VMDK grain size must be a power of two >= 4 KiB".into()));
        }
        Ok(header)
    }

    fn pack(&self) -> [u8; 512] {
        let mut b = [0u8; 512];
        b[0..4].copy_from_slice(&VMDK_MAGIC.to_le_bytes());
        b[4..8].copy_from_slice(&1u32.to_le_bytes());
        b[8..12].copy_from_slice(&3u32.to_le_bytes()); // valid NL test + redundant GT
        b[0x0C..0x14].copy_from_slice(&self.capacity_sectors.to_le_bytes());
        b[0x14..0x1C].copy_from_slice(&self.grain_sectors.to_le_bytes());
        b[0x1C..0x24].copy_from_slice(&self.descriptor_offset.to_le_bytes());
        b[0x24..0x2C].copy_from_slice(&self.descriptor_sectors.to_le_bytes());
        b[0x2C..0x30].copy_from_slice(&GTES_PER_GT.to_le_bytes());
        b[0x30..0x38].copy_from_slice(&self.rgd_offset.to_le_bytes());
        b[0x38..0x40].copy_from_slice(&self.gd_offset.to_le_bytes());
        b[0x40..0x48].copy_from_slice(&self.overhead_sectors.to_le_bytes());
        b[0x49] = 0x0A;
        b[0x4A] = 0x20;
        b[0x4B] = 0x0D;
        b[0x4C] = 0x0A;
        b
    }
}

pub struct VmdkDisk<B> {
    backend: B,
    header: SparseHeader,
    /// Grain directory entries: sector of each grain table, both copies.
    gd: Vec<u32>,
    rgd: Vec<u32>,
    /// Lazily loaded grain tables, keyed by table index.
    gt_cache: HashMap<usize, Vec<u32>>,
    read_only: bool,
}

impl<B: Backend> VmdkDisk<B> {
    pub fn open_backend(mut backend: B, mode: OpenMode) -> Result<Self> {
        let mut raw = [0u8; 512];
        backend.read_at(0, &mut raw)?;
        let header = SparseHeader::parse(&raw)?;
        let grains = header.capacity_sectors.div_ceil(header.grain_sectors);
        let tables = grains.div_ceil(GTES_PER_GT as u64) as usize;
        let read_gd = |backend: &mut B, offset: u64| -> Result<Vec<u32>> {
            let mut raw = vec![0u8; tables * 4];
            backend.read_at(offset * 512, &mut raw)?;
            Ok(raw
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                .collect())
        };
        let rgd = read_gd(&mut backend, header.rgd_offset)?;
        let gd = read_gd(&mut backend, header.gd_offset)?;
        info!(
            "opened VMDK ({} sectors, {} sector grains, {} grain tables)",
            header.capacity_sectors, header.grain_sectors, tables
        );
        Ok(Self {
            backend,
            header,
            gd,
            rgd,
            gt_cache: HashMap::new(),
            read_only: !mode.writable(),
        })
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    fn grain_bytes(&self) -> u64 {
        self.header.grain_sectors * 512
    }

    fn load_gt(&mut self, table: usize) -> Result<&mut Vec<u32>> {
        if !self.gt_cache.contains_key(&table) {
            let sector = self.gd[table] as u64;
            let mut raw = vec![0u8; GTES_PER_GT as usize * 4];
            self.backend.read_at(sector * 512, &mut raw)?;
            let gt = raw
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                .collect();
            self.gt_cache.insert(table, gt);
        }
        Ok(self.gt_cache.get_mut(&table).expect("just inserted"))
    }

    fn gte(&mut self, grain: u64) -> Result<u32> {
        let table = (grain / GTES_PER_GT as u64) as usize;
        let slot = (grain % GTES_PER_GT as u64) as usize;
        Ok(self.load_gt(table)?[slot])
    }

    /// Writes a grain-table entry to both directory copies.
    fn set_gte(&mut self, grain: u64, value: u32) -> Result<()> {
        let table = (grain / GTES_PER_GT as u64) as usize;
        let slot = (grain % GTES_PER_GT as u64) as usize;
        self.load_gt(table)?[slot] = value;
        let primary = self.gd[table] as u64 * 512 + slot as u64 * 4;
        let redundant = self.rgd[table] as u64 * 512 + slot as u64 * 4;
        self.backend.write_at(primary, &value.to_le_bytes())?;
        self.backend.write_at(redundant, &value.to_le_bytes())
    }

    fn allocate_grain(&mut self, grain: u64) -> Result<u32> {
        let file_len = self.backend.len()?;
        let sector = file_len.div_ceil(512);
        let zeros = vec![0u8; self.grain_bytes() as usize];
        self.backend.write_at(sector * 512, &zeros)?;
        self.set_gte(grain, sector as u32)?;
        debug!("allocated VMDK grain {} at sector {:#x}", grain, sector);
        Ok(sector as u32)
    }
}

impl<B: Backend> BlockContainer for VmdkDisk<B> {
    fn size(&self) -> u64 {
        self.header.capacity_sectors * 512
    }

    fn sector_size(&self) -> u32 {
        SECTOR_SIZE
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_aligned(offset, buf.len(), SECTOR_SIZE)?;
        checked_range(offset, buf.len(), self.size())?;
        let grain_bytes = self.grain_bytes();
        let mut pos = 0usize;
        while pos < buf.len() {
            let voff = offset + pos as u64;
            let grain = voff / grain_bytes;
            let in_grain = voff % grain_bytes;
            let take = ((grain_bytes - in_grain) as usize).min(buf.len() - pos);
            let gte = self.gte(grain)?;
            let span = &mut buf[pos..pos + take];
            if gte <= 1 {
                span.fill(0);
            } else {
                self.backend.read_at(gte as u64 * 512 + in_grain, span)?;
            }
            pos += take;
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        check_aligned(offset, buf.len(), SECTOR_SIZE)?;
        checked_range(offset, buf.len(), self.size())?;
        let grain_bytes = self.grain_bytes();
        let mut pos = 0usize;
        while pos < buf.len() {
            let voff = offset + pos as u64;
            let grain = voff / grain_bytes;
            let in_grain = voff % grain_bytes;
            let take = ((grain_bytes - in_grain) as usize).min(buf.len() - pos);
            let payload = &buf[pos..pos + take];
            let mut gte = self.gte(grain)?;
            if gte <= 1 {
                if payload.iter().all(|&b| b == 0) {
                    pos += take;
                    continue;
                }
                gte = self.allocate_grain(grain)?;
            }
            self.backend.write_at(gte as u64 * 512 + in_grain, payload)?;
            pos += take;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.backend.flush()
    }
}

// ============================================================================
// Creation
// ============================================================================

fn descriptor_text(capacity_sectors: u64) -> String {
    format!(
        "# Disk DescriptorFile\n\
         version=1\n\
         encoding=\"windows-1252\"\n\
         CID={:08x}\n\
         parentCID=ffffffff\n\
         createType=\"monolithicSparse\"\n\
         \n\
         # Extent description\n\
         RW {} SPARSE \"self\"\n\
         \n\
         # The Disk Data Base\n\
         #DDB\n\
         \n\
         ddb.geometry.cylinders = \"{}\"\n\
         ddb.geometry.heads = \"255\"\n\
         ddb.geometry.sectors = \"63\"\n",
        random::<u32>(),
        capacity_sectors,
        capacity_sectors / (255 * 63)
    )
}

/// Creates an empty monolithic sparse VMDK.
pub fn create_dynamic<B: Backend>(
    mut backend: B,
    size: u64,
    grain_size: Option<u32>,
) -> Result<VmdkDisk<B>> {
    if size == 0 || size % 512 != 0 {
        return Err(Error::BadFormat("VMDK size must be a nonzero sector multiple".into()));
    }
    let grain_bytes = grain_size.unwrap_or((DEFAULT_GRAIN_SECTORS * 512) as u32) as u64;
    if grain_bytes < (4 << 10) || !grain_bytes.is_power_of_two() {
        return Err(Error::BadFormat("VMDK grain size must be a power of two >= 4 KiB".into()));
    }
    let grain_sectors = grain_bytes / 512;
    let capacity_sectors = size / 512;
    let grains = capacity_sectors.div_ceil(grain_sectors);
    let tables = grains.div_ceil(GTES_PER_GT as u64);
    let gt_sectors = tables * 4; // each 512-entry table is 2 KiB = 4 sectors
    let gd_sectors = (tables * 4).div_ceil(512);

    let rgd_offset = 1 + DESCRIPTOR_SECTORS;
    let gd_offset = rgd_offset + gd_sectors + gt_sectors;
    let metadata_end = gd_offset + gd_sectors + gt_sectors;
    let overhead_sectors = metadata_end.div_ceil(grain_sectors) * grain_sectors;

    let header = SparseHeader {
        capacity_sectors,
        grain_sectors,
        descriptor_offset: 1,
        descriptor_sectors: DESCRIPTOR_SECTORS,
        rgd_offset,
        gd_offset,
        overhead_sectors,
    };

    backend.set_len(0)?;
    backend.write_at(0, &header.pack())?;

    let text = descriptor_text(capacity_sectors);
    let mut descriptor = vec![0u8; (DESCRIPTOR_SECTORS * 512) as usize];
    descriptor[..text.len()].copy_from_slice(text.as_bytes());
    backend.write_at(512, &descriptor)?;

    // Both grain directories point at their preallocated (zeroed) grain
    // table arrays.
    for (dir_offset, gts_start) in [
        (rgd_offset, rgd_offset + gd_sectors),
        (gd_offset, gd_offset + gd_sectors),
    ] {
        let gd: Vec<u8> = (0..tables)
            .flat_map(|i| ((gts_start + i * 4) as u32).to_le_bytes())
            .collect();
        let mut gd_area = vec![0u8; (gd_sectors * 512) as usize];
        gd_area[..gd.len()].copy_from_slice(&gd);
        backend.write_at(dir_offset * 512, &gd_area)?;
        backend.write_at(
            gts_start * 512,
            &vec![0u8; (gt_sectors * 512) as usize],
        )?;
    }
    backend.set_len(overhead_sectors * 512)?;
    backend.flush()?;
    info!(
        "created monolithic sparse VMDK ({} bytes, {} byte grains)",
        size, grain_bytes
    );
    VmdkDisk::open_backend(backend, OpenMode::ReadWrite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fathom_core::MemBackend;

    #[test]
    fn test_sparse_reads_zero() {
        let mut vmdk = create_dynamic(MemBackend::new(), 8 << 20, None).unwrap();
        let mut buf = [0x55u8; 1024];
        vmdk.read_at(1 << 20, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut vmdk = create_dynamic(MemBackend::new(), 8 << 20, None).unwrap();
        let payload = vec![0x77u8; 4096];
        vmdk.write_at(2 << 20, &payload).unwrap();
        let mut got = vec![0u8; 4096];
        vmdk.read_at(2 << 20, &mut got).unwrap();
        assert_eq!(got, payload);
    }

    #[test]
    fn test_reopen_uses_both_directories() {
        let mut vmdk = create_dynamic(MemBackend::new(), 8 << 20, None).unwrap();
        vmdk.write_at(0, &[9u8; 512]).unwrap();
        vmdk.flush().unwrap();
        let raw = vmdk.into_backend().into_vec();
        // Redundant and primary GT arrays must agree on the allocation.
        let mut again =
            VmdkDisk::open_backend(MemBackend::from_vec(raw), OpenMode::ReadOnly).unwrap();
        let grain0_primary = again.gte(0).unwrap();
        assert!(grain0_primary > 1);
        let table = again.rgd[0] as u64;
        let mut raw_gte = [0u8; 4];
        again.backend.read_at(table * 512, &mut raw_gte).unwrap();
        assert_eq!(u32::from_le_bytes(raw_gte), grain0_primary);
        let mut got = [0u8; 512];
        again.read_at(0, &mut got).unwrap();
        assert_eq!(got, [9u8; 512]);
    }

    #[test]
    fn test_zero_write_stays_sparse() {
        let mut vmdk = create_dynamic(MemBackend::new(), 8 << 20, None).unwrap();
        let before = vmdk.backend.len().unwrap();
        vmdk.write_at(4 << 20, &vec![0u8; 64 << 10]).unwrap();
        assert_eq!(vmdk.backend.len().unwrap(), before);
    }

    #[test]
    fn test_descriptor_embedded() {
        let vmdk = create_dynamic(MemBackend::new(), 8 << 20, None).unwrap();
        let raw = vmdk.into_backend().into_vec();
        let text = String::from_utf8_lossy(&raw[512..512 + 256]);
        assert!(text.contains("monolithicSparse"));
        assert!(text.contains("parentCID=ffffffff"));
    }
}
