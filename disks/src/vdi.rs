// VDI disk images (VirtualBox), version 1.1.
//
// Little-endian header at offset 0, block map at `bat_offset` (1 MiB
// aligned), payload blocks from `blocks_offset`. Map entries are block
// indexes into the data area: 0xFFFFFFFF = unallocated (reads zero),
// 0xFFFFFFFE = virtually allocated and zeroed.

use log::{debug, info};
use uuid::Uuid;

use fathom_core::{
    check_aligned, checked_range, Backend, BlockContainer, Error, OpenMode, Result,
};

pub const SECTOR_SIZE: u32 = 512;
const VDI_SIGNATURE: u32 = 0xBEDA_107F;
const VDI_VERSION: u32 = 0x0001_0001;
const DESCRIPTOR: &[u8] = b"<<< fathom VDI Disk Image >>>\n";
const ENTRY_UNALLOCATED: u32 = 0xFFFF_FFFF;
const ENTRY_ZERO: u32 = 0xFFFF_FFFE;
const DEFAULT_BLOCK_SIZE: u32 = 1 << 20;

const IMAGE_TYPE_DYNAMIC: u32 = 1;
const IMAGE_TYPE_FIXED: u32 = 2;

#[derive(Debug, Clone)]
struct VdiHeader {
    image_type: u32,
    bat_offset: u32,
    blocks_offset: u32,
    disk_size: u64,
    block_size: u32,
    total_blocks: u32,
    allocated_blocks: u32,
}

impl VdiHeader {
    fn parse(buf: &[u8]) -> Result<Self> {
        let signature = u32::from_le_bytes(buf[0x40..0x44].try_into().unwrap());
        if signature != VDI_SIGNATURE {
            return Err(Error::BadFormat("VDI signature missing".into()));
        }
        let version = u32::from_le_bytes(buf[0x44..0x48].try_into().unwrap());
        if version != VDI_VERSION {
            return Err(Error::BadFormat(format!(
                "unsupported VDI version {:#x}",
                version
            )));
        }
        let header = Self {
            image_type: u32::from_le_bytes(buf[0x4C..0x50].try_into().unwrap()),
            bat_offset: u32::from_le_bytes(buf[0x154..0x158].try_into().unwrap()),
            blocks_offset: u32::from_le_bytes(buf[0x158..0x15C].try_into().unwrap()),
            disk_size: u64::from_le_bytes(buf[0x170..0x178].try_into().unwrap()),
            block_size: u32::from_le_bytes(buf[0x178..0x17C].try_into().unwrap()),
            total_blocks: u32::from_le_bytes(buf[0x180..0x184].try_into().unwrap()),
            allocated_blocks: u32::from_le_bytes(buf[0x184..0x188].try_into().unwrap()),
        };
        if header.block_size < (1 << 20) || !header.block_size.is_power_of_two() {
            return Err(Error::BadFormat("VDI block size must be 1 MiB or a power-of-two multiple".into()));
        }
        if header.disk_size.div_ceil(header.block_size as u64) != header.total_blocks as u64 {
            return Err(Error::BadFormat("VDI block count disagrees with disk size".into()));
        }
        Ok(header)
    }

    fn pack(&self) -> [u8; 512] {
        let mut b = [0u8; 512];
        b[..DESCRIPTOR.len()].copy_from_slice(DESCRIPTOR);
        b[0x40..0x44].copy_from_slice(&VDI_SIGNATURE.to_le_bytes());
        b[0x44..0x48].copy_from_slice(&VDI_VERSION.to_le_bytes());
        b[0x48..0x4C].copy_from_slice(&0x200u32.to_le_bytes());
        b[0x4C..0x50].copy_from_slice(&self.image_type.to_le_bytes());
        b[0x154..0x158].copy_from_slice(&self.bat_offset.to_le_bytes());
        b[0x158..0x15C].copy_from_slice(&self.blocks_offset.to_le_bytes());
        b[0x170..0x178].copy_from_slice(&self.disk_size.to_le_bytes());
        b[0x178..0x17C].copy_from_slice(&self.block_size.to_le_bytes());
        b[0x180..0x184].copy_from_slice(&self.total_blocks.to_le_bytes());
        b[0x184..0x188].copy_from_slice(&self.allocated_blocks.to_le_bytes());
        b[0x188..0x198].copy_from_slice(Uuid::new_v4().as_bytes());
        b[0x198..0x1A8].copy_from_slice(Uuid::new_v4().as_bytes());
        b[0x1D4..0x1D8].copy_from_slice(&512u32.to_le_bytes());
        b
    }
}

pub struct VdiDisk<B> {
    backend: B,
    header: VdiHeader,
    bat: Vec<u32>,
    read_only: bool,
}

impl<B: Backend> VdiDisk<B> {
    pub fn open_backend(mut backend: B, mode: OpenMode) -> Result<Self> {
        let mut raw = [0u8; 512];
        backend.read_at(0, &mut raw)?;
        let header = VdiHeader::parse(&raw)?;
        let mut bat_raw = vec![0u8; header.total_blocks as usize * 4];
        backend.read_at(header.bat_offset as u64, &mut bat_raw)?;
        let bat = bat_raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        info!(
            "opened VDI ({} bytes, {} byte blocks, {} allocated)",
            header.disk_size, header.block_size, header.allocated_blocks
        );
        Ok(Self {
            backend,
            header,
            bat,
            read_only: !mode.writable(),
        })
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    fn set_bat_entry(&mut self, index: usize, value: u32) -> Result<()> {
        self.bat[index] = value;
        self.backend.write_at(
            self.header.bat_offset as u64 + index as u64 * 4,
            &value.to_le_bytes(),
        )
    }

    fn payload_offset(&self, entry: u32, in_block: u64) -> u64 {
        self.header.blocks_offset as u64 + entry as u64 * self.header.block_size as u64 + in_block
    }

    /// Appends a zeroed block to the data area and points the map at it.
    fn allocate_block(&mut self, index: usize) -> Result<u32> {
        let file_len = self.backend.len()?;
        let data_start = self.header.blocks_offset as u64;
        let entry = ((file_len.max(data_start) - data_start)
            / self.header.block_size as u64) as u32;
        let zeros = vec![0u8; self.header.block_size as usize];
        self.backend
            .write_at(self.payload_offset(entry, 0), &zeros)?;
        self.set_bat_entry(index, entry)?;
        self.header.allocated_blocks += 1;
        self.backend.write_at(
            0x184,
            &self.header.allocated_blocks.to_le_bytes(),
        )?;
        debug!("allocated VDI block {} -> data index {}", index, entry);
        Ok(entry)
    }
}

impl<B: Backend> BlockContainer for VdiDisk<B> {
    fn size(&self) -> u64 {
        self.header.disk_size
    }

    fn sector_size(&self) -> u32 {
        SECTOR_SIZE
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_aligned(offset, buf.len(), SECTOR_SIZE)?;
        checked_range(offset, buf.len(), self.header.disk_size)?;
        let block_size = self.header.block_size as u64;
        let mut pos = 0usize;
        while pos < buf.len() {
            let voff = offset + pos as u64;
            let index = (voff / block_size) as usize;
            let in_block = voff % block_size;
            let take = ((block_size - in_block) as usize).min(buf.len() - pos);
            let entry = self.bat[index];
            let span = &mut buf[pos..pos + take];
            if entry == ENTRY_UNALLOCATED || entry == ENTRY_ZERO {
                span.fill(0);
            } else {
                let at = self.payload_offset(entry, in_block);
                self.backend.read_at(at, span)?;
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
        checked_range(offset, buf.len(), self.header.disk_size)?;
        let block_size = self.header.block_size as u64;
        let mut pos = 0usize;
        while pos < buf.len() {
            let voff = offset + pos as u64;
            let index = (voff / block_size) as usize;
            let in_block = voff % block_size;
            let take = ((block_size - in_block) as usize).min(buf.len() - pos);
            let payload = &buf[pos..pos + take];
            let mut entry = self.bat[index];
            if entry == ENTRY_UNALLOCATED || entry == ENTRY_ZERO {
                if payload.iter().all(|&b| b == 0) {
                    pos += take;
                    continue;
                }
                entry = self.allocate_block(index)?;
            }
            self.backend
                .write_at(self.payload_offset(entry, in_block), payload)?;
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

fn make_header(size: u64, block_size: u32, image_type: u32) -> Result<VdiHeader> {
    if size == 0 || size % 512 != 0 {
        return Err(Error::BadFormat("VDI size must be a nonzero sector multiple".into()));
    }
    if block_size < (1 << 20) || !block_size.is_power_of_two() {
        return Err(Error::BadFormat("VDI block size must be 1 MiB or a power-of-two multiple".into()));
    }
    let total_blocks = size.div_ceil(block_size as u64) as u32;
    let bat_bytes = (total_blocks as u64 * 4).div_ceil(1 << 20) * (1 << 20);
    Ok(VdiHeader {
        image_type,
        bat_offset: 1 << 20,
        blocks_offset: ((1 << 20) + bat_bytes) as u32,
        disk_size: size,
        block_size,
        total_blocks,
        allocated_blocks: 0,
    })
}

/// Creates an empty dynamic VDI.
pub fn create_dynamic<B: Backend>(
    mut backend: B,
    size: u64,
    block_size: Option<u32>,
) -> Result<VdiDisk<B>> {
    let header = make_header(size, block_size.unwrap_or(DEFAULT_BLOCK_SIZE), IMAGE_TYPE_DYNAMIC)?;
    backend.set_len(0)?;
    backend.write_at(0, &header.pack())?;
    let bat = vec![0xFFu8; header.total_blocks as usize * 4];
    backend.write_at(header.bat_offset as u64, &bat)?;
    // Pad the metadata area so the data area starts 1 MiB aligned.
    backend.set_len(header.blocks_offset as u64)?;
    backend.flush()?;
    info!("created dynamic VDI ({} bytes)", size);
    VdiDisk::open_backend(backend, OpenMode::ReadWrite)
}

/// Creates a fixed VDI with every block preallocated in order.
pub fn create_fixed<B: Backend>(mut backend: B, size: u64) -> Result<VdiDisk<B>> {
    let mut header = make_header(size, DEFAULT_BLOCK_SIZE, IMAGE_TYPE_FIXED)?;
    header.allocated_blocks = header.total_blocks;
    backend.set_len(0)?;
    backend.write_at(0, &header.pack())?;
    let bat: Vec<u8> = (0..header.total_blocks)
        .flat_map(|i| i.to_le_bytes())
        .collect();
    backend.write_at(header.bat_offset as u64, &bat)?;
    backend.set_len(
        header.blocks_offset as u64 + header.total_blocks as u64 * header.block_size as u64,
    )?;
    backend.flush()?;
    info!("created fixed VDI ({} bytes)", size);
    VdiDisk::open_backend(backend, OpenMode::ReadWrite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fathom_core::MemBackend;

    #[test]
    fn test_dynamic_zero_until_written() {
        let mut vdi = create_dynamic(MemBackend::new(), 8 << 20, None).unwrap();
        let mut buf = [0xAAu8; 512];
        vdi.read_at(5 << 20, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        vdi.write_at(5 << 20, &[0x99u8; 512]).unwrap();
        vdi.read_at(5 << 20, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x99));
        assert_eq!(vdi.header.allocated_blocks, 1);
    }

    #[test]
    fn test_reopen_preserves_contents() {
        let mut vdi = create_dynamic(MemBackend::new(), 8 << 20, None).unwrap();
        vdi.write_at(0, &[0x31u8; 1024]).unwrap();
        vdi.write_at(7 << 20, &[0x32u8; 512]).unwrap();
        vdi.flush().unwrap();
        let mut again = VdiDisk::open_backend(vdi.into_backend(), OpenMode::ReadOnly).unwrap();
        let mut buf = [0u8; 512];
        again.read_at(512, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x31));
        again.read_at(7 << 20, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x32));
    }

    #[test]
    fn test_fixed_preallocated() {
        let mut vdi = create_fixed(MemBackend::new(), 4 << 20).unwrap();
        assert_eq!(vdi.header.allocated_blocks, 4);
        vdi.write_at((4 << 20) - 512, &[0x01u8; 512]).unwrap();
        let mut buf = [0u8; 512];
        vdi.read_at((4 << 20) - 512, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x01));
    }

    #[test]
    fn test_bad_signature_rejected() {
        let backend = MemBackend::with_len(2 << 20);
        assert!(VdiDisk::open_backend(backend, OpenMode::ReadOnly).is_err());
    }
}
