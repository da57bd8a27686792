// VHD disk images: fixed, dynamic, and differencing.
//
// All multi-byte footer/header fields are big-endian. A dynamic image is
// footer copy + dynamic header + BAT + blocks + footer; every block is
// preceded by a sector bitmap (LSB-first bit order within each byte).
// Differencing images consult the bitmap per sector and fall through to
// the parent for clear bits; writes always allocate in the child.

use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, info};
use uuid::Uuid;

use fathom_core::{
    check_aligned, checked_range, Backend, BlockContainer, Error, FileBackend, OpenMode, Result,
};

pub const SECTOR_SIZE: u32 = 512;
const FOOTER_COOKIE: &[u8; 8] = b"conectix";
const HEADER_COOKIE: &[u8; 8] = b"cxsparse";
const CREATOR_APP: &[u8; 4] = b"fthm";
const CREATOR_HOST: &[u8; 4] = b"Wi2k";
const BAT_UNALLOCATED: u32 = 0xFFFF_FFFF;
const DEFAULT_BLOCK_SIZE: u32 = 2 << 20;
const MAX_VHD_SIZE: u64 = 2040 << 30;
const MAX_CHAIN_DEPTH: usize = 64;

/// Seconds between the Unix epoch and the VHD epoch (2000-01-01 UTC).
const VHD_EPOCH_OFFSET: i64 = 946_684_800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VhdKind {
    Fixed,
    Dynamic,
    Differencing,
}

fn vhd_timestamp() -> u32 {
    (Utc::now().timestamp() - VHD_EPOCH_OFFSET).max(0) as u32
}

/// One's-complement sum over the structure with its checksum field zeroed.
fn structure_checksum(buf: &[u8]) -> u32 {
    let sum: u32 = buf.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32));
    !sum
}

/// Pseudo-CHS geometry for the footer, clamped the way the format requires.
fn encode_chs(size: u64) -> [u8; 4] {
    let mut sectors = size / 512;
    if sectors > 65535 * 16 * 255 {
        sectors = 65535 * 16 * 255;
    }
    let (cylinders, heads, spt);
    if sectors >= 65535 * 16 * 63 {
        spt = 255u64;
        heads = 16u64;
        cylinders = sectors / spt / heads;
    } else {
        let mut s = 17u64;
        let mut cth = sectors / s;
        let mut h = (cth + 1023) / 1024;
        if h < 4 {
            h = 4;
        }
        if cth >= h * 1024 || h > 16 {
            s = 31;
            h = 16;
            cth = sectors / s;
        }
        if cth >= h * 1024 {
            s = 63;
            h = 16;
            cth = sectors / s;
        }
        spt = s;
        heads = h;
        cylinders = cth / heads;
    }
    let mut out = [0u8; 4];
    out[0..2].copy_from_slice(&(cylinders as u16).to_be_bytes());
    out[2] = heads as u8;
    out[3] = spt as u8;
    out
}

// ============================================================================
// Footer and dynamic header
// ============================================================================

#[derive(Debug, Clone)]
struct Footer {
    data_offset: u64,
    timestamp: u32,
    current_size: u64,
    disk_type: u32,
    unique_id: [u8; 16],
}

impl Footer {
    fn parse(buf: &[u8]) -> Result<Self> {
        if &buf[0..8] != FOOTER_COOKIE {
            return Err(Error::BadFormat("VHD footer cookie missing".into()));
        }
        let stored = u32::from_be_bytes(buf[64..68].try_into().unwrap());
        let mut scratch = buf.to_vec();
        scratch[64..68].fill(0);
        if structure_checksum(&scratch) != stored {
            return Err(Error::BadFormat("VHD footer checksum mismatch".into()));
        }
        Ok(Self {
            data_offset: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
            timestamp: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
            current_size: u64::from_be_bytes(buf[48..56].try_into().unwrap()),
            disk_type: u32::from_be_bytes(buf[60..64].try_into().unwrap()),
            unique_id: buf[68..84].try_into().unwrap(),
        })
    }

    fn pack(&self) -> [u8; 512] {
        let mut b = [0u8; 512];
        b[0..8].copy_from_slice(FOOTER_COOKIE);
        b[8..12].copy_from_slice(&2u32.to_be_bytes()); // features: reserved
        b[12..16].copy_from_slice(&0x0001_0000u32.to_be_bytes());
        b[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        b[24..28].copy_from_slice(&self.timestamp.to_be_bytes());
        b[28..32].copy_from_slice(CREATOR_APP);
        b[32..36].copy_from_slice(&0x0004_0001u32.to_be_bytes());
        b[36..40].copy_from_slice(CREATOR_HOST);
        b[40..48].copy_from_slice(&self.current_size.to_be_bytes());
        b[48..56].copy_from_slice(&self.current_size.to_be_bytes());
        b[56..60].copy_from_slice(&encode_chs(self.current_size));
        b[60..64].copy_from_slice(&self.disk_type.to_be_bytes());
        b[68..84].copy_from_slice(&self.unique_id);
        let crc = structure_checksum(&b);
        b[64..68].copy_from_slice(&crc.to_be_bytes());
        b
    }
}

#[derive(Debug, Clone)]
struct DynamicHeader {
    table_offset: u64,
    max_table_entries: u32,
    block_size: u32,
    parent_unique_id: [u8; 16],
    locators: [RawLocator; 8],
}

#[derive(Debug, Clone, Copy, Default)]
struct RawLocator {
    platform_code: [u8; 4],
    data_space: u32,
    data_length: u32,
    data_offset: u64,
}

impl DynamicHeader {
    fn parse(buf: &[u8]) -> Result<Self> {
        if &buf[0..8] != HEADER_COOKIE {
            return Err(Error::BadFormat("VHD dynamic header cookie missing".into()));
        }
        let stored = u32::from_be_bytes(buf[0x24..0x28].try_into().unwrap());
        let mut scratch = buf.to_vec();
        scratch[0x24..0x28].fill(0);
        if structure_checksum(&scratch) != stored {
            return Err(Error::BadFormat("VHD dynamic header checksum mismatch".into()));
        }
        let mut locators = [RawLocator::default(); 8];
        for (i, loc) in locators.iter_mut().enumerate() {
            let at = 0x240 + i * 24;
            loc.platform_code = buf[at..at + 4].try_into().unwrap();
            loc.data_space = u32::from_be_bytes(buf[at + 4..at + 8].try_into().unwrap());
            loc.data_length = u32::from_be_bytes(buf[at + 8..at + 12].try_into().unwrap());
            loc.data_offset = u64::from_be_bytes(buf[at + 16..at + 24].try_into().unwrap());
        }
        Ok(Self {
            table_offset: u64::from_be_bytes(buf[0x10..0x18].try_into().unwrap()),
            max_table_entries: u32::from_be_bytes(buf[0x1C..0x20].try_into().unwrap()),
            block_size: u32::from_be_bytes(buf[0x20..0x24].try_into().unwrap()),
            parent_unique_id: buf[0x28..0x38].try_into().unwrap(),
            locators,
        })
    }

    fn pack(&self, parent_unicode_name: &[u8]) -> [u8; 1024] {
        let mut b = [0u8; 1024];
        b[0..8].copy_from_slice(HEADER_COOKIE);
        b[8..16].copy_from_slice(&u64::MAX.to_be_bytes());
        b[0x10..0x18].copy_from_slice(&self.table_offset.to_be_bytes());
        b[0x18..0x1C].copy_from_slice(&0x0001_0000u32.to_be_bytes());
        b[0x1C..0x20].copy_from_slice(&self.max_table_entries.to_be_bytes());
        b[0x20..0x24].copy_from_slice(&self.block_size.to_be_bytes());
        b[0x28..0x38].copy_from_slice(&self.parent_unique_id);
        let name_len = parent_unicode_name.len().min(512);
        b[0x40..0x40 + name_len].copy_from_slice(&parent_unicode_name[..name_len]);
        for (i, loc) in self.locators.iter().enumerate() {
            let at = 0x240 + i * 24;
            b[at..at + 4].copy_from_slice(&loc.platform_code);
            b[at + 4..at + 8].copy_from_slice(&loc.data_space.to_be_bytes());
            b[at + 8..at + 12].copy_from_slice(&loc.data_length.to_be_bytes());
            b[at + 16..at + 24].copy_from_slice(&loc.data_offset.to_be_bytes());
        }
        let crc = structure_checksum(&b);
        b[0x24..0x28].copy_from_slice(&crc.to_be_bytes());
        b
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct VhdDisk<B> {
    backend: B,
    kind: VhdKind,
    size: u64,
    read_only: bool,
    footer: Footer,
    // Dynamic/differencing state.
    block_size: u32,
    bitmap_size: u32,
    bat_offset: u64,
    bat: Vec<u32>,
    parent: Option<Box<VhdDisk<FileBackend>>>,
    path: Option<PathBuf>,
    parent_path: Option<PathBuf>,
}

impl VhdDisk<FileBackend> {
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self> {
        let mut chain = Vec::new();
        Self::open_guarded(path.as_ref(), mode, &mut chain)
    }

    fn open_guarded(path: &Path, mode: OpenMode, chain: &mut Vec<PathBuf>) -> Result<Self> {
        let canonical = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf());
        if chain.iter().any(|p| p == &canonical) {
            return Err(Error::BadFormat(format!(
                "VHD differencing chain contains a cycle through {}",
                canonical.display()
            )));
        }
        if chain.len() >= MAX_CHAIN_DEPTH {
            return Err(Error::BadFormat("VHD differencing chain too deep".into()));
        }
        chain.push(canonical);
        let backend = FileBackend::open(path, mode)?;
        let base_dir = path.parent().map(Path::to_path_buf);
        let mut disk = VhdDisk::from_backend(backend, mode, base_dir, chain)?;
        disk.path = Some(path.to_path_buf());
        Ok(disk)
    }
}

impl<B: Backend> VhdDisk<B> {
    /// Opens an image over an arbitrary backend. `base_dir` anchors
    /// relative parent locators of differencing images.
    pub fn open_backend(backend: B, mode: OpenMode) -> Result<Self> {
        let mut chain = Vec::new();
        Self::from_backend(backend, mode, None, &mut chain)
    }

    fn from_backend(
        mut backend: B,
        mode: OpenMode,
        base_dir: Option<PathBuf>,
        chain: &mut Vec<PathBuf>,
    ) -> Result<Self> {
        let file_len = backend.len()?;
        if file_len < 512 {
            return Err(Error::BadFormat("file too small for a VHD footer".into()));
        }
        let mut raw = [0u8; 512];
        backend.read_at(file_len - 512, &mut raw)?;
        let footer = Footer::parse(&raw)?;
        let kind = match footer.disk_type {
            2 => VhdKind::Fixed,
            3 => VhdKind::Dynamic,
            4 => VhdKind::Differencing,
            t => return Err(Error::BadFormat(format!("unknown VHD disk type {}", t))),
        };
        let mut disk = Self {
            backend,
            kind,
            size: footer.current_size,
            read_only: !mode.writable(),
            footer,
            block_size: 0,
            bitmap_size: 0,
            bat_offset: 0,
            bat: Vec::new(),
            parent: None,
            path: None,
            parent_path: None,
        };
        if kind == VhdKind::Fixed {
            if file_len != disk.size + 512 {
                return Err(Error::BadFormat(
                    "fixed VHD length does not match footer size".into(),
                ));
            }
            info!("opened fixed VHD ({} bytes)", disk.size);
            return Ok(disk);
        }
        // Sparse kinds: footer copy at 0 must agree, then the header.
        let mut copy = [0u8; 512];
        disk.backend.read_at(0, &mut copy)?;
        Footer::parse(&copy)?;
        let mut hraw = [0u8; 1024];
        disk.backend.read_at(512, &mut hraw)?;
        let header = DynamicHeader::parse(&hraw)?;
        if header.block_size == 0 || !header.block_size.is_power_of_two() {
            return Err(Error::BadFormat("VHD block size must be a power of two".into()));
        }
        disk.block_size = header.block_size;
        disk.bitmap_size = ((header.block_size / 512) / 8).max(512);
        disk.bat_offset = header.table_offset;
        disk.bat = disk.read_bat(header.table_offset, header.max_table_entries)?;
        if kind == VhdKind::Differencing {
            let parent_path = disk.resolve_parent_locator(&header, base_dir.as_deref())?;
            let parent = VhdDisk::<FileBackend>::open_guarded(&parent_path, OpenMode::ReadOnly, chain)?;
            if parent.footer.unique_id != header.parent_unique_id {
                return Err(Error::BadFormat(
                    "differencing VHD parent UUID does not match".into(),
                ));
            }
            if parent.size != disk.size {
                return Err(Error::BadFormat(
                    "differencing VHD size differs from parent".into(),
                ));
            }
            disk.parent_path = Some(parent_path);
            disk.parent = Some(Box::new(parent));
        }
        info!(
            "opened {:?} VHD ({} bytes, {} byte blocks, {} BAT entries)",
            kind,
            disk.size,
            disk.block_size,
            disk.bat.len()
        );
        Ok(disk)
    }

    fn read_bat(&mut self, offset: u64, entries: u32) -> Result<Vec<u32>> {
        let mut raw = vec![0u8; entries as usize * 4];
        self.backend.read_at(offset, &mut raw)?;
        Ok(raw
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
            .collect())
    }

    fn resolve_parent_locator(
        &mut self,
        header: &DynamicHeader,
        base_dir: Option<&Path>,
    ) -> Result<PathBuf> {
        // Prefer the absolute W2ku locator, then the relative W2ru.
        for code in [b"W2ku", b"W2ru"] {
            for loc in header.locators.iter() {
                if &loc.platform_code != code || loc.data_length == 0 {
                    continue;
                }
                let mut raw = vec![0u8; loc.data_length as usize];
                self.backend.read_at(loc.data_offset, &mut raw)?;
                let utf16: Vec<u16> = raw
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                let text = String::from_utf16_lossy(&utf16);
                let text = text.trim_end_matches('\0').replace('\\', "/");
                let text = text.trim_start_matches("./");
                let candidate = if code == b"W2ru" {
                    match base_dir {
                        Some(dir) => dir.join(text),
                        None => PathBuf::from(text),
                    }
                } else {
                    PathBuf::from(text)
                };
                if candidate.exists() {
                    debug!("resolved VHD parent locator: {}", candidate.display());
                    return Ok(candidate);
                }
            }
        }
        Err(Error::BadFormat(
            "differencing VHD parent could not be located".into(),
        ))
    }

    fn bat_index(&self, offset: u64) -> usize {
        (offset / self.block_size as u64) as usize
    }

    /// Raw block stride in the file: bitmap sectors + payload.
    fn raw_block_size(&self) -> u64 {
        self.bitmap_size as u64 + self.block_size as u64
    }

    fn set_bat_entry(&mut self, index: usize, sector: u32) -> Result<()> {
        self.bat[index] = sector;
        self.backend
            .write_at(self.bat_offset + index as u64 * 4, &sector.to_be_bytes())
    }

    /// Appends a block where the footer currently sits, rewrites the
    /// footer past it, and records the BAT entry before any payload write.
    fn allocate_block(&mut self, index: usize, bitmap_fill: u8) -> Result<u32> {
        let file_len = self.backend.len()?;
        let block_start = file_len - 512;
        let sector = (block_start / 512) as u32;
        let bitmap = vec![bitmap_fill; self.bitmap_size as usize];
        self.backend.write_at(block_start, &bitmap)?;
        let zeros = vec![0u8; self.block_size as usize];
        self.backend
            .write_at(block_start + self.bitmap_size as u64, &zeros)?;
        let footer = self.footer.pack();
        self.backend
            .write_at(block_start + self.raw_block_size(), &footer)?;
        self.set_bat_entry(index, sector)?;
        debug!("allocated VHD block {} at sector {:#x}", index, sector);
        Ok(sector)
    }

    fn has_block(&self, index: usize) -> bool {
        if self.bat.get(index).copied().unwrap_or(BAT_UNALLOCATED) != BAT_UNALLOCATED {
            return true;
        }
        match &self.parent {
            Some(p) => p.has_block(index),
            None => false,
        }
    }

    fn bitmap_offset(&self, block_sector: u32) -> u64 {
        block_sector as u64 * 512
    }

    fn payload_offset(&self, block_sector: u32, offset_in_block: u64) -> u64 {
        block_sector as u64 * 512 + self.bitmap_size as u64 + offset_in_block
    }

    fn read_bitmap(&mut self, block_sector: u32) -> Result<Vec<u8>> {
        let mut bmp = vec![0u8; self.bitmap_size as usize];
        self.backend.read_at(self.bitmap_offset(block_sector), &mut bmp)?;
        Ok(bmp)
    }

    fn bitmap_bit(bmp: &[u8], sector: usize) -> bool {
        bmp[sector / 8] & (128 >> (sector % 8)) != 0
    }

    fn set_bitmap_bits(bmp: &mut [u8], first: usize, count: usize) {
        for s in first..first + count {
            bmp[s / 8] |= 128 >> (s % 8);
        }
    }

    pub fn kind(&self) -> VhdKind {
        self.kind
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    fn read_sparse(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut pos = 0usize;
        while pos < buf.len() {
            let voff = offset + pos as u64;
            let index = self.bat_index(voff);
            let in_block = voff % self.block_size as u64;
            let take = ((self.block_size as u64 - in_block) as usize).min(buf.len() - pos);
            let entry = self.bat[index];
            let out = &mut buf[pos..pos + take];
            if self.kind == VhdKind::Differencing {
                self.read_diff_span(entry, voff, in_block, out)?;
            } else if entry == BAT_UNALLOCATED {
                out.fill(0);
            } else {
                let at = self.payload_offset(entry, in_block);
                self.backend.read_at(at, out)?;
            }
            pos += take;
        }
        Ok(())
    }

    /// Differencing read of a span inside one block: each sector comes
    /// from the child when its bitmap bit is set, from the parent chain
    /// otherwise.
    fn read_diff_span(
        &mut self,
        entry: u32,
        voff: u64,
        in_block: u64,
        out: &mut [u8],
    ) -> Result<()> {
        let parent = self.parent.as_mut().expect("differencing without parent");
        if entry == BAT_UNALLOCATED {
            return parent.read_at(voff, out);
        }
        let bmp = {
            let mut bmp = vec![0u8; self.bitmap_size as usize];
            self.backend.read_at(entry as u64 * 512, &mut bmp)?;
            bmp
        };
        let mut done = 0usize;
        while done < out.len() {
            let sector = ((in_block + done as u64) / 512) as usize;
            let run_here = Self::bitmap_bit(&bmp, sector);
            let mut run_len = 512usize;
            while done + run_len < out.len() {
                let next = ((in_block + (done + run_len) as u64) / 512) as usize;
                if Self::bitmap_bit(&bmp, next) != run_here {
                    break;
                }
                run_len += 512;
            }
            run_len = run_len.min(out.len() - done);
            let span = &mut out[done..done + run_len];
            if run_here {
                let at = entry as u64 * 512 + self.bitmap_size as u64 + in_block + done as u64;
                self.backend.read_at(at, span)?;
            } else {
                let parent = self.parent.as_mut().unwrap();
                parent.read_at(voff + done as u64, span)?;
            }
            done += run_len;
        }
        Ok(())
    }

    fn write_sparse(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut pos = 0usize;
        while pos < buf.len() {
            let voff = offset + pos as u64;
            let index = self.bat_index(voff);
            let in_block = voff % self.block_size as u64;
            let take = ((self.block_size as u64 - in_block) as usize).min(buf.len() - pos);
            let payload = &buf[pos..pos + take];
            let mut entry = self.bat[index];
            if entry == BAT_UNALLOCATED {
                let zero_write = payload.iter().all(|&b| b == 0);
                let covered_by_parent =
                    self.kind == VhdKind::Differencing && self.has_block(index);
                if zero_write && !covered_by_parent {
                    // Keep the block virtual: reads return zeros anyway.
                    pos += take;
                    continue;
                }
                let fill = if self.kind == VhdKind::Differencing { 0x00 } else { 0xFF };
                entry = self.allocate_block(index, fill)?;
            }
            self.backend
                .write_at(self.payload_offset(entry, in_block), payload)?;
            if self.kind == VhdKind::Differencing {
                let mut bmp = self.read_bitmap(entry)?;
                Self::set_bitmap_bits(
                    &mut bmp,
                    (in_block / 512) as usize,
                    take / 512,
                );
                self.backend.write_at(self.bitmap_offset(entry), &bmp)?;
            }
            pos += take;
        }
        Ok(())
    }
}

/// Outcome of merging a differencing image into its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    pub sectors_merged: u64,
    pub blocks_merged: u64,
}

impl VhdDisk<FileBackend> {
    /// Copies every bitmap-set sector of this differencing image into its
    /// parent, then invalidates this image (both footer cookies zeroed).
    pub fn merge_into_parent(mut self) -> Result<MergeStats> {
        if self.kind != VhdKind::Differencing {
            return Err(Error::NotSupported("merge requires a differencing VHD".into()));
        }
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let parent_path = self.parent_path.clone().expect("differencing without parent path");
        // The read-only chain parent stays as the fall-through source;
        // writes go to a separate read-write handle.
        let mut target = VhdDisk::open(&parent_path, OpenMode::ReadWrite)?;
        let mut stats = MergeStats {
            sectors_merged: 0,
            blocks_merged: 0,
        };
        let mut sector_buf = [0u8; 512];
        for index in 0..self.bat.len() {
            let entry = self.bat[index];
            if entry == BAT_UNALLOCATED {
                continue;
            }
            let bmp = self.read_bitmap(entry)?;
            let sectors_per_block = (self.block_size / 512) as usize;
            let mut copied = false;
            for s in 0..sectors_per_block {
                if !Self::bitmap_bit(&bmp, s) {
                    continue;
                }
                let at = entry as u64 * 512 + self.bitmap_size as u64 + s as u64 * 512;
                self.backend.read_at(at, &mut sector_buf)?;
                let voff = index as u64 * self.block_size as u64 + s as u64 * 512;
                target.write_at(voff, &sector_buf)?;
                stats.sectors_merged += 1;
                copied = true;
            }
            if copied {
                stats.blocks_merged += 1;
            }
        }
        target.flush()?;
        // Invalidate the child so it can no longer be opened.
        let len = self.backend.len()?;
        self.backend.write_at(0, &[0u8; 8])?;
        self.backend.write_at(len - 512, &[0u8; 8])?;
        self.backend.flush()?;
        info!(
            "merged {} sectors in {} blocks into {}",
            stats.sectors_merged,
            stats.blocks_merged,
            parent_path.display()
        );
        Ok(stats)
    }
}

impl<B: Backend> BlockContainer for VhdDisk<B> {
    fn size(&self) -> u64 {
        self.size
    }

    fn sector_size(&self) -> u32 {
        SECTOR_SIZE
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_aligned(offset, buf.len(), SECTOR_SIZE)?;
        checked_range(offset, buf.len(), self.size)?;
        match self.kind {
            VhdKind::Fixed => self.backend.read_at(offset, buf),
            _ => self.read_sparse(offset, buf),
        }
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        check_aligned(offset, buf.len(), SECTOR_SIZE)?;
        checked_range(offset, buf.len(), self.size)?;
        match self.kind {
            VhdKind::Fixed => self.backend.write_at(offset, buf),
            _ => self.write_sparse(offset, buf),
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.backend.flush()
    }
}

// ============================================================================
// Creation
// ============================================================================

fn check_size(size: u64) -> Result<()> {
    if size == 0 || size % 512 != 0 {
        return Err(Error::BadFormat("VHD size must be a nonzero sector multiple".into()));
    }
    if size > MAX_VHD_SIZE {
        return Err(Error::BadFormat("VHD size exceeds 2040 GiB".into()));
    }
    Ok(())
}

/// Creates a fixed VHD: raw payload plus a footer.
pub fn create_fixed<B: Backend>(mut backend: B, size: u64) -> Result<VhdDisk<B>> {
    check_size(size)?;
    let footer = Footer {
        data_offset: u64::MAX,
        timestamp: vhd_timestamp(),
        current_size: size,
        disk_type: 2,
        unique_id: *Uuid::new_v4().as_bytes(),
    };
    backend.set_len(size + 512)?;
    backend.write_at(size, &footer.pack())?;
    backend.flush()?;
    info!("created fixed VHD ({} bytes)", size);
    VhdDisk::open_backend(backend, OpenMode::ReadWrite)
}

/// Creates an empty dynamic VHD with the given block size.
pub fn create_dynamic<B: Backend>(
    mut backend: B,
    size: u64,
    block_size: Option<u32>,
) -> Result<VhdDisk<B>> {
    check_size(size)?;
    let block = block_size.unwrap_or(DEFAULT_BLOCK_SIZE);
    if !block.is_power_of_two() || block < 512 {
        return Err(Error::BadFormat("VHD block size must be a power of two".into()));
    }
    let entries = size.div_ceil(block as u64) as u32;
    let bat_bytes = (entries as u64 * 4).div_ceil(512) * 512;
    let footer = Footer {
        data_offset: 512,
        timestamp: vhd_timestamp(),
        current_size: size,
        disk_type: 3,
        unique_id: *Uuid::new_v4().as_bytes(),
    };
    let header = DynamicHeader {
        table_offset: 1536,
        max_table_entries: entries,
        block_size: block,
        parent_unique_id: [0u8; 16],
        locators: [RawLocator::default(); 8],
    };
    backend.set_len(0)?;
    backend.write_at(0, &footer.pack())?;
    backend.write_at(512, &header.pack(&[]))?;
    backend.write_at(1536, &vec![0xFFu8; bat_bytes as usize])?;
    backend.write_at(1536 + bat_bytes, &footer.pack())?;
    backend.flush()?;
    info!("created dynamic VHD ({} bytes, {} byte blocks)", size, block);
    VhdDisk::open_backend(backend, OpenMode::ReadWrite)
}

/// Creates an empty differencing VHD linked to `parent`.
pub fn create_diff<P: AsRef<Path>, Q: AsRef<Path>>(path: P, parent: Q) -> Result<VhdDisk<FileBackend>> {
    let parent = parent.as_ref();
    let base = VhdDisk::open(parent, OpenMode::ReadOnly)?;
    let (block, entries) = match base.kind {
        VhdKind::Fixed => {
            let block = DEFAULT_BLOCK_SIZE;
            (block, base.size.div_ceil(block as u64) as u32)
        }
        _ => (base.block_size, base.size.div_ceil(base.block_size as u64) as u32),
    };
    let parent_uuid = base.footer.unique_id;
    let size = base.size;
    drop(base);

    let abs_parent = parent
        .canonicalize()
        .unwrap_or_else(|_| parent.to_path_buf());
    let abs_utf16: Vec<u8> = abs_parent
        .to_string_lossy()
        .encode_utf16()
        .flat_map(|c| c.to_le_bytes())
        .collect();
    let rel_name = parent
        .file_name()
        .map(|n| format!("./{}", n.to_string_lossy()))
        .unwrap_or_else(|| parent.to_string_lossy().into_owned());
    let rel_utf16: Vec<u8> = rel_name
        .encode_utf16()
        .flat_map(|c| c.to_le_bytes())
        .collect();
    let name_be: Vec<u8> = abs_parent
        .to_string_lossy()
        .encode_utf16()
        .flat_map(|c| c.to_be_bytes())
        .collect();

    let bat_bytes = (entries as u64 * 4).div_ceil(512) * 512;
    let rel_space = (rel_utf16.len() as u64).div_ceil(512) * 512;
    let abs_space = (abs_utf16.len() as u64).div_ceil(512) * 512;

    let mut locators = [RawLocator::default(); 8];
    locators[0] = RawLocator {
        platform_code: *b"W2ru",
        data_space: rel_space as u32,
        data_length: rel_utf16.len() as u32,
        data_offset: 1536 + bat_bytes,
    };
    locators[1] = RawLocator {
        platform_code: *b"W2ku",
        data_space: abs_space as u32,
        data_length: abs_utf16.len() as u32,
        data_offset: 1536 + bat_bytes + rel_space,
    };

    let footer = Footer {
        data_offset: 512,
        timestamp: vhd_timestamp(),
        current_size: size,
        disk_type: 4,
        unique_id: *Uuid::new_v4().as_bytes(),
    };
    let header = DynamicHeader {
        table_offset: 1536,
        max_table_entries: entries,
        block_size: block,
        parent_unique_id: parent_uuid,
        locators,
    };

    let mut backend = FileBackend::create(path.as_ref(), 0)?;
    backend.write_at(0, &footer.pack())?;
    backend.write_at(512, &header.pack(&name_be))?;
    backend.write_at(1536, &vec![0xFFu8; bat_bytes as usize])?;
    let mut rel_sector = vec![0u8; rel_space as usize];
    rel_sector[..rel_utf16.len()].copy_from_slice(&rel_utf16);
    backend.write_at(1536 + bat_bytes, &rel_sector)?;
    let mut abs_sector = vec![0u8; abs_space as usize];
    abs_sector[..abs_utf16.len()].copy_from_slice(&abs_utf16);
    backend.write_at(1536 + bat_bytes + rel_space, &abs_sector)?;
    backend.write_at(1536 + bat_bytes + rel_space + abs_space, &footer.pack())?;
    backend.flush()?;
    drop(backend);
    info!(
        "created differencing VHD {} over {}",
        path.as_ref().display(),
        parent.display()
    );
    VhdDisk::open(path.as_ref(), OpenMode::ReadWrite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fathom_core::MemBackend;

    #[test]
    fn test_fixed_roundtrip() {
        let mut vhd = create_fixed(MemBackend::new(), 4 << 20).unwrap();
        assert_eq!(vhd.kind(), VhdKind::Fixed);
        assert_eq!(vhd.size(), 4 << 20);
        vhd.write_at(512, &[0x77u8; 512]).unwrap();
        let mut got = [0u8; 512];
        vhd.read_at(512, &mut got).unwrap();
        assert_eq!(got, [0x77u8; 512]);
    }

    #[test]
    fn test_dynamic_unallocated_reads_zero() {
        let mut vhd = create_dynamic(MemBackend::new(), 16 << 20, None).unwrap();
        let mut buf = [0xAAu8; 1024];
        vhd.read_at(2 << 20, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_dynamic_write_allocates_and_reads_back() {
        let mut vhd = create_dynamic(MemBackend::new(), 16 << 20, None).unwrap();
        let payload = vec![0x5Au8; 4096];
        vhd.write_at(3 << 20, &payload).unwrap();
        let mut got = vec![0u8; 4096];
        vhd.read_at(3 << 20, &mut got).unwrap();
        assert_eq!(got, payload);
        // Neighboring sectors in the same block still read zero.
        let mut next = [0u8; 512];
        vhd.read_at((3 << 20) + 4096, &mut next).unwrap();
        assert!(next.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_dynamic_zero_write_stays_virtual() {
        let mut vhd = create_dynamic(MemBackend::new(), 16 << 20, None).unwrap();
        let before = vhd.backend.len().unwrap();
        vhd.write_at(1 << 20, &vec![0u8; 4096]).unwrap();
        assert_eq!(vhd.backend.len().unwrap(), before);
        assert!(vhd.bat.iter().all(|&e| e == BAT_UNALLOCATED));
    }

    #[test]
    fn test_dynamic_reopen() {
        let mut vhd = create_dynamic(MemBackend::new(), 16 << 20, None).unwrap();
        vhd.write_at(0, &[1u8; 512]).unwrap();
        vhd.write_at(8 << 20, &[2u8; 512]).unwrap();
        vhd.flush().unwrap();
        let backend = vhd.into_backend();
        let mut again = VhdDisk::open_backend(backend, OpenMode::ReadOnly).unwrap();
        let mut got = [0u8; 512];
        again.read_at(0, &mut got).unwrap();
        assert_eq!(got, [1u8; 512]);
        again.read_at(8 << 20, &mut got).unwrap();
        assert_eq!(got, [2u8; 512]);
    }

    #[test]
    fn test_footer_checksum_rejected_when_corrupt() {
        let mut vhd = create_fixed(MemBackend::new(), 1 << 20).unwrap();
        vhd.flush().unwrap();
        let mut raw = vhd.into_backend().into_vec();
        let len = raw.len();
        raw[len - 512 + 48] ^= 0x01; // corrupt current_size inside the footer
        let backend = MemBackend::from_vec(raw);
        assert!(VhdDisk::open_backend(backend, OpenMode::ReadOnly).is_err());
    }

    #[test]
    fn test_diff_chain_and_merge() {
        let dir = tempfile::tempdir().unwrap();
        let parent_path = dir.path().join("base.vhd");
        let child_path = dir.path().join("delta.vhd");
        {
            let backend = FileBackend::create(&parent_path, 0).unwrap();
            let mut parent = create_dynamic(backend, 8 << 20, None).unwrap();
            parent.write_at(1 << 20, &[0x41u8; 512]).unwrap();
            parent.flush().unwrap();
        }
        {
            let mut child = create_diff(&child_path, &parent_path).unwrap();
            // Unwritten regions fall through to the parent.
            let mut got = [0u8; 512];
            child.read_at(1 << 20, &mut got).unwrap();
            assert_eq!(got, [0x41u8; 512]);
            child.write_at(1 << 20, &[0x42u8; 512]).unwrap();
            child.read_at(1 << 20, &mut got).unwrap();
            assert_eq!(got, [0x42u8; 512]);
            child.flush().unwrap();
        }
        {
            // Parent unmodified by child writes.
            let mut parent = VhdDisk::open(&parent_path, OpenMode::ReadOnly).unwrap();
            let mut got = [0u8; 512];
            parent.read_at(1 << 20, &mut got).unwrap();
            assert_eq!(got, [0x41u8; 512]);
        }
        let child = VhdDisk::open(&child_path, OpenMode::ReadWrite).unwrap();
        let stats = child.merge_into_parent().unwrap();
        assert_eq!(stats.blocks_merged, 1);
        assert!(stats.sectors_merged >= 1);
        let mut parent = VhdDisk::open(&parent_path, OpenMode::ReadOnly).unwrap();
        let mut got = [0u8; 512];
        parent.read_at(1 << 20, &mut got).unwrap();
        assert_eq!(got, [0x42u8; 512]);
        // The merged child is invalid now.
        assert!(VhdDisk::open(&child_path, OpenMode::ReadOnly).is_err());
    }

    #[test]
    fn test_diff_partial_block_mixes_child_and_parent() {
        let dir = tempfile::tempdir().unwrap();
        let parent_path = dir.path().join("base.vhd");
        let child_path = dir.path().join("delta.vhd");
        {
            let backend = FileBackend::create(&parent_path, 0).unwrap();
            let mut parent = create_dynamic(backend, 8 << 20, None).unwrap();
            parent.write_at(0, &[0x11u8; 2048]).unwrap();
            parent.flush().unwrap();
        }
        let mut child = create_diff(&child_path, &parent_path).unwrap();
        child.write_at(512, &[0x22u8; 512]).unwrap();
        let mut got = vec![0u8; 2048];
        child.read_at(0, &mut got).unwrap();
        assert!(got[..512].iter().all(|&b| b == 0x11));
        assert!(got[512..1024].iter().all(|&b| b == 0x22));
        assert!(got[1024..].iter().all(|&b| b == 0x11));
    }
}
