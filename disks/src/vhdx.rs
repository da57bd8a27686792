// VHDX disk images.
//
// Little-endian throughout, CRC-32C checksums. Layout: 64 KiB file type
// identifier, two 4 KiB headers at 64/128 KiB (greatest sequence number
// wins), region table at 192 KiB with a copy at 256 KiB, then the log,
// metadata, and BAT regions wherever the region table puts them.
//
// BAT entries pack a 3-bit state with a MiB-granular file offset. Payload
// entries are interleaved with one sector-bitmap entry after every
// `chunk_ratio` payload entries; the bitmap blocks themselves are only
// populated in differencing images.
//
// A nonzero LogGuid means a log sequence must be replayed before the
// image can be trusted; replay is strict and refuses on any anomaly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use uuid::Uuid;

use fathom_core::{
    check_aligned, checked_range, Backend, BlockContainer, Error, FileBackend, OpenMode, Result,
};

const SIGNATURE_FILE: &[u8; 8] = b"vhdxfile";
const SIGNATURE_HEAD: &[u8; 4] = b"head";
const SIGNATURE_REGION: &[u8; 4] = b"regi";
const SIGNATURE_METADATA: &[u8; 8] = b"metadata";
const SIGNATURE_LOG_ENTRY: &[u8; 4] = b"loge";
const SIGNATURE_LOG_ZERO: &[u8; 4] = b"zero";
const SIGNATURE_LOG_DESC: &[u8; 4] = b"desc";
const SIGNATURE_LOG_DATA: &[u8; 4] = b"data";

const HEADER1_OFFSET: u64 = 64 << 10;
const HEADER2_OFFSET: u64 = 128 << 10;
const REGION1_OFFSET: u64 = 192 << 10;
const REGION2_OFFSET: u64 = 256 << 10;
const LOG_RECORD: u64 = 4096;
const MIB: u64 = 1 << 20;

const GUID_REGION_METADATA: Uuid = Uuid::from_u128(0x8B7CA206_4790_4B9A_B8FE_575F050F886E);
const GUID_REGION_BAT: Uuid = Uuid::from_u128(0x2DC27766_F623_4200_9D64_115E9BFD4A08);

const GUID_META_FILE_PARAMS: Uuid = Uuid::from_u128(0xCAA16737_FA36_4D43_B3B6_33F0AA44E76B);
const GUID_META_DISK_SIZE: Uuid = Uuid::from_u128(0x2FA54224_CD1B_4876_B211_5DBED83BF4B8);
const GUID_META_LOGICAL_SS: Uuid = Uuid::from_u128(0x8141BF1D_A96F_4709_BA47_F233A8FAAB5F);
const GUID_META_PHYSICAL_SS: Uuid = Uuid::from_u128(0xCDA348C7_445D_4471_9CC9_E9885251C556);
const GUID_META_DISK_ID: Uuid = Uuid::from_u128(0xBECA12AB_B2E6_4523_93EF_C309E000C746);
const GUID_META_PARENT_LOCATOR: Uuid = Uuid::from_u128(0xA8D35F2D_B30B_454D_ABF7_D3D84834AB0C);

// Payload block states (low 3 bits of a BAT entry).
const PAYLOAD_BLOCK_NOT_PRESENT: u64 = 0;
const PAYLOAD_BLOCK_UNDEFINED: u64 = 1;
const PAYLOAD_BLOCK_ZERO: u64 = 2;
const PAYLOAD_BLOCK_UNMAPPED: u64 = 3;
const PAYLOAD_BLOCK_FULLY_PRESENT: u64 = 6;
const PAYLOAD_BLOCK_PARTIALLY_PRESENT: u64 = 7;
const SB_BLOCK_PRESENT: u64 = 6;

// File-parameter flags (bit 1 is LeaveBlockAllocated, for fixed images).
const FPARAM_HAS_PARENT: u32 = 2;

fn crc32c_of(buf: &[u8]) -> u32 {
    crc32c::crc32c(buf)
}

/// CRC-32C with the 4-byte checksum field at `at` treated as zero.
fn crc_with_hole(buf: &[u8], at: usize) -> u32 {
    let mut scratch = buf.to_vec();
    scratch[at..at + 4].fill(0);
    crc32c_of(&scratch)
}

#[derive(Debug, Clone)]
struct VhdxHeader {
    sequence_number: u64,
    log_guid: [u8; 16],
    log_length: u32,
    log_offset: u64,
}

impl VhdxHeader {
    fn parse(buf: &[u8]) -> Result<Self> {
        if &buf[0..4] != SIGNATURE_HEAD {
            return Err(Error::BadFormat("VHDX header signature missing".into()));
        }
        let stored = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if crc_with_hole(&buf[..4096], 4) != stored {
            return Err(Error::BadFormat("VHDX header checksum mismatch".into()));
        }
        let version = u16::from_le_bytes(buf[0x42..0x44].try_into().unwrap());
        if version != 1 {
            return Err(Error::BadFormat(format!("unsupported VHDX version {}", version)));
        }
        Ok(Self {
            sequence_number: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            log_guid: buf[0x30..0x40].try_into().unwrap(),
            log_length: u32::from_le_bytes(buf[0x44..0x48].try_into().unwrap()),
            log_offset: u64::from_le_bytes(buf[0x48..0x50].try_into().unwrap()),
        })
    }

    fn pack(&self, file_write_guid: &[u8; 16], data_write_guid: &[u8; 16]) -> [u8; 4096] {
        let mut b = [0u8; 4096];
        b[0..4].copy_from_slice(SIGNATURE_HEAD);
        b[8..16].copy_from_slice(&self.sequence_number.to_le_bytes());
        b[0x10..0x20].copy_from_slice(file_write_guid);
        b[0x20..0x30].copy_from_slice(data_write_guid);
        b[0x30..0x40].copy_from_slice(&self.log_guid);
        b[0x42..0x44].copy_from_slice(&1u16.to_le_bytes());
        b[0x44..0x48].copy_from_slice(&self.log_length.to_le_bytes());
        b[0x48..0x50].copy_from_slice(&self.log_offset.to_le_bytes());
        let crc = crc_with_hole(&b, 4);
        b[4..8].copy_from_slice(&crc.to_le_bytes());
        b
    }
}

#[derive(Debug, Clone, Default)]
struct Metadata {
    block_size: u32,
    file_params: u32,
    disk_size: u64,
    logical_sector_size: u32,
    physical_sector_size: u32,
    parent_locator: HashMap<String, String>,
}

pub struct VhdxDisk<B> {
    backend: B,
    header: VhdxHeader,
    metadata: Metadata,
    bat_offset: u64,
    bat: Vec<u64>,
    chunk_ratio: u64,
    read_only: bool,
    guids_refreshed: bool,
    parent: Option<Box<VhdxDisk<FileBackend>>>,
}

impl VhdxDisk<FileBackend> {
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self> {
        let mut chain = Vec::new();
        Self::open_guarded(path.as_ref(), mode, &mut chain)
    }

    fn open_guarded(path: &Path, mode: OpenMode, chain: &mut Vec<PathBuf>) -> Result<Self> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if chain.iter().any(|p| p == &canonical) {
            return Err(Error::BadFormat(format!(
                "VHDX differencing chain contains a cycle through {}",
                canonical.display()
            )));
        }
        chain.push(canonical);
        let backend = FileBackend::open(path, mode)?;
        let base_dir = path.parent().map(Path::to_path_buf);
        Self::from_backend(backend, mode, base_dir, chain)
    }
}

impl<B: Backend> VhdxDisk<B> {
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
        let mut fti = [0u8; 8];
        backend.read_at(0, &mut fti)?;
        if &fti != SIGNATURE_FILE {
            return Err(Error::BadFormat("VHDX file signature missing".into()));
        }
        // Active header: the valid one with the greatest sequence number.
        let mut raw = vec![0u8; 4096];
        backend.read_at(HEADER1_OFFSET, &mut raw)?;
        let h1 = VhdxHeader::parse(&raw);
        backend.read_at(HEADER2_OFFSET, &mut raw)?;
        let h2 = VhdxHeader::parse(&raw);
        let header = match (h1, h2) {
            (Ok(a), Ok(b)) => {
                if a.sequence_number >= b.sequence_number {
                    a
                } else {
                    b
                }
            }
            (Ok(a), Err(_)) => a,
            (Err(_), Ok(b)) => b,
            (Err(e), Err(_)) => return Err(e),
        };

        let mut disk = Self {
            backend,
            header,
            metadata: Metadata::default(),
            bat_offset: 0,
            bat: Vec::new(),
            chunk_ratio: 0,
            read_only: !mode.writable(),
            guids_refreshed: false,
            parent: None,
        };

        if disk.header.log_guid != [0u8; 16] {
            if disk.read_only {
                return Err(Error::BadFormat(
                    "VHDX has a log to replay but was opened read-only".into(),
                ));
            }
            disk.replay_log()?;
            disk.header.log_guid = [0u8; 16];
            disk.rewrite_headers()?;
        }

        let (bat_offset, bat_length, metadata_offset) = disk.parse_region_table()?;
        disk.parse_metadata(metadata_offset)?;
        disk.bat_offset = bat_offset;
        let meta = &disk.metadata;
        if meta.logical_sector_size != 512 && meta.logical_sector_size != 4096 {
            return Err(Error::BadFormat("VHDX logical sector size must be 512 or 4096".into()));
        }
        disk.chunk_ratio = ((1u64 << 23) * meta.logical_sector_size as u64) / meta.block_size as u64;
        let mut raw_bat = vec![0u8; bat_length as usize];
        disk.backend.read_at(bat_offset, &mut raw_bat)?;
        disk.bat = raw_bat
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();

        if disk.metadata.file_params & FPARAM_HAS_PARENT != 0 {
            let parent_path = disk.resolve_parent(base_dir.as_deref())?;
            let parent =
                VhdxDisk::<FileBackend>::open_guarded(&parent_path, OpenMode::ReadOnly, chain)?;
            if parent.metadata.disk_size != disk.metadata.disk_size {
                return Err(Error::BadFormat(
                    "differencing VHDX size differs from parent".into(),
                ));
            }
            disk.parent = Some(Box::new(parent));
        }
        info!(
            "opened VHDX ({} bytes, {} byte blocks, {} B logical sectors, chunk ratio {})",
            disk.metadata.disk_size,
            disk.metadata.block_size,
            disk.metadata.logical_sector_size,
            disk.chunk_ratio
        );
        Ok(disk)
    }

    fn parse_region_table(&mut self) -> Result<(u64, u32, u64)> {
        for offset in [REGION1_OFFSET, REGION2_OFFSET] {
            let mut raw = vec![0u8; 64 << 10];
            self.backend.read_at(offset, &mut raw)?;
            if &raw[0..4] != SIGNATURE_REGION {
                continue;
            }
            let stored = u32::from_le_bytes(raw[4..8].try_into().unwrap());
            if crc_with_hole(&raw, 4) != stored {
                warn!("VHDX region table at {:#x} has a bad checksum", offset);
                continue;
            }
            let count = u32::from_le_bytes(raw[8..12].try_into().unwrap());
            if count > 2047 {
                continue;
            }
            let mut bat = None;
            let mut metadata = None;
            for i in 0..count as usize {
                let e = &raw[16 + i * 32..16 + (i + 1) * 32];
                let guid = Uuid::from_bytes_le(e[0..16].try_into().unwrap());
                let file_offset = u64::from_le_bytes(e[16..24].try_into().unwrap());
                let length = u32::from_le_bytes(e[24..28].try_into().unwrap());
                let required = u32::from_le_bytes(e[28..32].try_into().unwrap());
                if guid == GUID_REGION_BAT {
                    bat = Some((file_offset, length));
                } else if guid == GUID_REGION_METADATA {
                    metadata = Some(file_offset);
                } else if required != 0 {
                    return Err(Error::BadFormat(format!(
                        "VHDX has an unknown required region {}",
                        guid
                    )));
                }
            }
            if let (Some((bo, bl)), Some(mo)) = (bat, metadata) {
                return Ok((bo, bl, mo));
            }
        }
        Err(Error::BadFormat("no valid VHDX region table found".into()))
    }

    fn parse_metadata(&mut self, region_offset: u64) -> Result<()> {
        let mut raw = vec![0u8; 64 << 10];
        self.backend.read_at(region_offset, &mut raw)?;
        if &raw[0..8] != SIGNATURE_METADATA {
            return Err(Error::BadFormat("VHDX metadata table signature missing".into()));
        }
        let count = u16::from_le_bytes(raw[0x0A..0x0C].try_into().unwrap());
        if count > 2047 {
            return Err(Error::BadFormat("implausible VHDX metadata entry count".into()));
        }
        let mut meta = Metadata::default();
        for i in 0..count as usize {
            let e = &raw[32 + i * 32..32 + (i + 1) * 32];
            let item = Uuid::from_bytes_le(e[0..16].try_into().unwrap());
            let offset = u32::from_le_bytes(e[16..20].try_into().unwrap());
            let length = u32::from_le_bytes(e[20..24].try_into().unwrap());
            if offset == 0 && length == 0 {
                continue;
            }
            if offset < 0x10000 || (offset + length) as u64 > MIB {
                return Err(Error::BadFormat("VHDX metadata item out of bounds".into()));
            }
            let mut item_raw = vec![0u8; length as usize];
            self.backend
                .read_at(region_offset + offset as u64, &mut item_raw)?;
            if item == GUID_META_FILE_PARAMS {
                meta.block_size = u32::from_le_bytes(item_raw[0..4].try_into().unwrap());
                meta.file_params = u32::from_le_bytes(item_raw[4..8].try_into().unwrap());
            } else if item == GUID_META_DISK_SIZE {
                meta.disk_size = u64::from_le_bytes(item_raw[0..8].try_into().unwrap());
            } else if item == GUID_META_LOGICAL_SS {
                meta.logical_sector_size = u32::from_le_bytes(item_raw[0..4].try_into().unwrap());
            } else if item == GUID_META_PHYSICAL_SS {
                meta.physical_sector_size = u32::from_le_bytes(item_raw[0..4].try_into().unwrap());
            } else if item == GUID_META_DISK_ID {
                // Identity only; nothing to keep.
            } else if item == GUID_META_PARENT_LOCATOR {
                meta.parent_locator = parse_parent_locator(&item_raw)?;
            } else {
                debug!("ignoring unknown VHDX metadata item {}", item);
            }
        }
        if meta.block_size < MIB as u32
            || meta.block_size > (256 << 20)
            || !meta.block_size.is_power_of_two()
        {
            return Err(Error::BadFormat("VHDX block size out of range".into()));
        }
        if meta.disk_size == 0 {
            return Err(Error::BadFormat("VHDX virtual disk size missing".into()));
        }
        self.metadata = meta;
        Ok(())
    }

    fn resolve_parent(&self, base_dir: Option<&Path>) -> Result<PathBuf> {
        for key in ["relative_path", "absolute_win32_path", "volume_path"] {
            let Some(value) = self.metadata.parent_locator.get(key) else {
                continue;
            };
            let cleaned = value.replace('\\', "/");
            let cleaned = cleaned.trim_start_matches("./");
            let candidate = if key == "relative_path" {
                match base_dir {
                    Some(dir) => dir.join(cleaned),
                    None => PathBuf::from(cleaned),
                }
            } else {
                PathBuf::from(cleaned)
            };
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(Error::BadFormat("VHDX parent image could not be located".into()))
    }

    // ------------------------------------------------------------------
    // Log replay
    // ------------------------------------------------------------------

    /// Replays the committed log sequence. Validation is strict: any
    /// malformed entry, checksum failure, or sequence irregularity aborts
    /// the open instead of guessing.
    fn replay_log(&mut self) -> Result<()> {
        let log_offset = self.header.log_offset;
        let log_length = self.header.log_length as u64;
        if log_length == 0 || log_offset == 0 {
            return Err(Error::BadFormat("VHDX log region missing but LogGuid set".into()));
        }
        let mut log = vec![0u8; log_length as usize];
        self.backend.read_at(log_offset, &mut log)?;

        // Locate the active sequence head: the valid self-pointing entry
        // with the greatest sequence number.
        let mut head: Option<(u64, u64)> = None; // (offset_in_log, sequence)
        let mut at = 0u64;
        while at < log_length {
            if let Some(entry) = self.parse_log_entry(&log, at)? {
                if entry.tail == at as u32 {
                    match head {
                        Some((_, seq)) if seq >= entry.sequence => {}
                        _ => head = Some((at, entry.sequence)),
                    }
                }
            }
            at += LOG_RECORD;
        }
        let Some((tail_offset, tail_seq)) = head else {
            return Err(Error::BadFormat("VHDX log has no active sequence".into()));
        };

        // Collect the consecutive entries of the sequence, wrapping at
        // the log end, validating sequence-number monotonicity.
        let mut entries = Vec::new();
        let mut at = tail_offset;
        let mut expect_seq = tail_seq;
        loop {
            let entry = self
                .parse_log_entry(&log, at)?
                .ok_or_else(|| Error::BadFormat("VHDX log sequence interrupted".into()))?;
            if entry.sequence != expect_seq {
                break;
            }
            let next = (at + entry.length as u64) % log_length;
            entries.push(entry);
            expect_seq += 1;
            at = next;
            if at == tail_offset {
                break;
            }
            // A non-entry or an entry of another sequence ends the scan.
            match self.parse_log_entry(&log, at)? {
                Some(e) if e.tail == tail_offset as u32 => {}
                _ => break,
            }
        }

        // Grow the container if the log says structures extend past EOF.
        let needed = entries.last().map(|e| e.flushed_file_offset).unwrap_or(0);
        if self.backend.len()? < needed {
            self.backend.set_len(needed)?;
        }
        let mut replayed = 0usize;
        for entry in &entries {
            for (file_offset, payload) in &entry.writes {
                self.backend.write_at(*file_offset, payload)?;
                replayed += 1;
            }
        }
        info!(
            "replayed VHDX log: {} entries, {} pages",
            entries.len(),
            replayed
        );
        Ok(())
    }

    /// Parses and fully validates one log entry at `at`; Ok(None) means
    /// "no entry here", an Err means a structurally broken entry.
    fn parse_log_entry(&self, log: &[u8], at: u64) -> Result<Option<ParsedLogEntry>> {
        let head = &log[at as usize..];
        if head.len() < LOG_RECORD as usize || &head[0..4] != SIGNATURE_LOG_ENTRY {
            return Ok(None);
        }
        let length = u32::from_le_bytes(head[8..12].try_into().unwrap());
        let tail = u32::from_le_bytes(head[12..16].try_into().unwrap());
        if length as u64 % LOG_RECORD != 0 || tail as u64 % LOG_RECORD != 0 {
            return Ok(None);
        }
        if at + length as u64 > log.len() as u64 {
            return Ok(None);
        }
        let entry = &log[at as usize..(at + length as u64) as usize];
        if entry[0x20..0x30] != self.header.log_guid {
            return Ok(None);
        }
        let stored = u32::from_le_bytes(entry[4..8].try_into().unwrap());
        if crc_with_hole(entry, 4) != stored {
            return Ok(None);
        }
        let sequence = u64::from_le_bytes(entry[0x10..0x18].try_into().unwrap());
        let descriptor_count = u64::from_le_bytes(entry[0x18..0x20].try_into().unwrap());
        let flushed_file_offset = u64::from_le_bytes(entry[0x30..0x38].try_into().unwrap());
        let desc_pages = (64 + 32 * descriptor_count).div_ceil(LOG_RECORD) * LOG_RECORD;
        let mut writes = Vec::new();
        let mut data_index = 0u64;
        for j in 0..descriptor_count {
            let o = (64 + j * 32) as usize;
            let d = &entry[o..o + 32];
            let d_seq = u64::from_le_bytes(d[0x18..0x20].try_into().unwrap());
            if d_seq != sequence {
                return Err(Error::BadFormat(
                    "VHDX log descriptor sequence number mismatch".into(),
                ));
            }
            let file_offset = u64::from_le_bytes(d[0x10..0x18].try_into().unwrap());
            if file_offset % LOG_RECORD != 0 {
                return Err(Error::BadFormat("VHDX log descriptor misaligned target".into()));
            }
            if &d[0..4] == SIGNATURE_LOG_ZERO {
                let zero_len = u64::from_le_bytes(d[8..16].try_into().unwrap());
                if zero_len % LOG_RECORD != 0 {
                    return Err(Error::BadFormat("VHDX log zero descriptor misaligned".into()));
                }
                writes.push((file_offset, vec![0u8; zero_len as usize]));
            } else if &d[0..4] == SIGNATURE_LOG_DESC {
                let sec_at = (desc_pages + data_index * LOG_RECORD) as usize;
                data_index += 1;
                let sector = &entry[sec_at..sec_at + LOG_RECORD as usize];
                if &sector[0..4] != SIGNATURE_LOG_DATA {
                    return Err(Error::BadFormat("VHDX log data sector signature missing".into()));
                }
                let seq_high = u32::from_le_bytes(sector[4..8].try_into().unwrap());
                let seq_low = u32::from_le_bytes(sector[4092..4096].try_into().unwrap());
                if ((seq_high as u64) << 32 | seq_low as u64) != sequence {
                    return Err(Error::BadFormat(
                        "VHDX log data sector sequence number mismatch".into(),
                    ));
                }
                // The first 8 and last 4 raw bytes live in the descriptor.
                let mut page = vec![0u8; LOG_RECORD as usize];
                page.copy_from_slice(sector);
                page[0..8].copy_from_slice(&d[8..16]);
                page[4092..4096].copy_from_slice(&d[4..8]);
                writes.push((file_offset, page));
            } else {
                return Err(Error::BadFormat("unknown VHDX log descriptor".into()));
            }
        }
        Ok(Some(ParsedLogEntry {
            sequence,
            length,
            tail,
            flushed_file_offset,
            writes,
        }))
    }

    // ------------------------------------------------------------------
    // BAT geometry
    // ------------------------------------------------------------------

    fn block_index(&self, offset: u64) -> u64 {
        offset / self.metadata.block_size as u64
    }

    /// Payload entries are interleaved with a bitmap entry after every
    /// chunk_ratio of them.
    fn payload_bat_index(&self, block: u64) -> usize {
        (block + block / self.chunk_ratio) as usize
    }

    fn bitmap_bat_index(&self, block: u64) -> usize {
        let cr = self.chunk_ratio;
        (((block + cr) / cr) * cr + block / cr) as usize
    }

    fn bat_entry(&self, index: usize) -> (u64, u64) {
        let e = self.bat.get(index).copied().unwrap_or(0);
        (e & 0xFFFFF, (e >> 20) << 20)
    }

    fn set_bat_entry(&mut self, index: usize, offset: u64, state: u64) -> Result<()> {
        let value = offset | state;
        self.bat[index] = value;
        self.backend
            .write_at(self.bat_offset + index as u64 * 8, &value.to_le_bytes())
    }

    /// Appends a MiB-aligned block at EOF; the BAT points at it before
    /// any payload lands there.
    fn allocate_block(&mut self, block: u64) -> Result<u64> {
        let file_len = self.backend.len()?;
        let at = file_len.div_ceil(MIB) * MIB;
        self.backend
            .set_len(at + self.metadata.block_size as u64)?;
        let index = self.payload_bat_index(block);
        self.set_bat_entry(index, at, PAYLOAD_BLOCK_FULLY_PRESENT)?;
        debug!("allocated VHDX block {} at {:#x}", block, at);
        Ok(at)
    }

    fn rewrite_headers(&mut self) -> Result<()> {
        let file_guid = *Uuid::new_v4().as_bytes();
        let data_guid = *Uuid::new_v4().as_bytes();
        self.header.sequence_number = self.header.sequence_number.wrapping_add(1);
        let packed = self.header.pack(&file_guid, &data_guid);
        self.backend.write_at(HEADER1_OFFSET, &packed)?;
        self.header.sequence_number = self.header.sequence_number.wrapping_add(1);
        let packed = self.header.pack(&file_guid, &data_guid);
        self.backend.write_at(HEADER2_OFFSET, &packed)?;
        Ok(())
    }

    /// First mutation after open refreshes the write GUIDs, as consumers
    /// use them to detect parent modification under a child.
    fn touch_for_write(&mut self) -> Result<()> {
        if self.guids_refreshed {
            return Ok(());
        }
        self.guids_refreshed = true;
        self.rewrite_headers()
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    fn read_block_span(
        &mut self,
        block: u64,
        in_block: u64,
        voff: u64,
        out: &mut [u8],
    ) -> Result<()> {
        let (state, at) = self.bat_entry(self.payload_bat_index(block));
        match state {
            PAYLOAD_BLOCK_NOT_PRESENT => match self.parent.as_mut() {
                Some(parent) => parent.read_at(voff, out),
                None => {
                    out.fill(0);
                    Ok(())
                }
            },
            PAYLOAD_BLOCK_UNDEFINED | PAYLOAD_BLOCK_ZERO | PAYLOAD_BLOCK_UNMAPPED => {
                out.fill(0);
                Ok(())
            }
            PAYLOAD_BLOCK_FULLY_PRESENT => self.backend.read_at(at + in_block, out),
            PAYLOAD_BLOCK_PARTIALLY_PRESENT => self.read_partial_span(block, in_block, voff, at, out),
            s => Err(Error::BadFormat(format!("invalid VHDX payload state {}", s))),
        }
    }

    /// PARTIALLY_PRESENT: per-sector arbitration between this image and
    /// its parent via the chunk's sector bitmap block.
    fn read_partial_span(
        &mut self,
        block: u64,
        in_block: u64,
        voff: u64,
        payload_at: u64,
        out: &mut [u8],
    ) -> Result<()> {
        if self.parent.is_none() {
            return Err(Error::BadFormat(
                "PARTIALLY_PRESENT block in a VHDX without a parent".into(),
            ));
        }
        let (bmp_state, bmp_at) = self.bat_entry(self.bitmap_bat_index(block));
        if bmp_state != SB_BLOCK_PRESENT || bmp_at == 0 {
            return Err(Error::BadFormat(
                "PARTIALLY_PRESENT block without a present sector bitmap".into(),
            ));
        }
        let lss = self.metadata.logical_sector_size as u64;
        let mut bmp = vec![0u8; MIB as usize];
        self.backend.read_at(bmp_at, &mut bmp)?;
        let mut done = 0u64;
        while done < out.len() as u64 {
            // Bitmap indexes sectors within the whole 2^23-sector chunk.
            let sector_in_chunk = ((voff + done) / lss) % (1 << 23);
            let in_child = bmp[(sector_in_chunk / 8) as usize] & (1 << (sector_in_chunk % 8)) != 0;
            let take = lss.min(out.len() as u64 - done);
            let span = &mut out[done as usize..(done + take) as usize];
            if in_child {
                self.backend.read_at(payload_at + in_block + done, span)?;
            } else {
                let parent = self.parent.as_mut().expect("checked above");
                parent.read_at(voff + done, span)?;
            }
            done += take;
        }
        Ok(())
    }

    fn write_block_span(&mut self, block: u64, in_block: u64, payload: &[u8]) -> Result<()> {
        let index = self.payload_bat_index(block);
        let (state, mut at) = self.bat_entry(index);
        match state {
            PAYLOAD_BLOCK_FULLY_PRESENT => {}
            PAYLOAD_BLOCK_NOT_PRESENT
            | PAYLOAD_BLOCK_UNDEFINED
            | PAYLOAD_BLOCK_ZERO
            | PAYLOAD_BLOCK_UNMAPPED => {
                let parent_holds =
                    self.parent.is_some() && state == PAYLOAD_BLOCK_NOT_PRESENT;
                if payload.iter().all(|&b| b == 0) && !parent_holds {
                    // Stays virtual; reads yield zeros either way.
                    return Ok(());
                }
                at = self.allocate_block(block)?;
                if parent_holds {
                    // Writes allocate in the child only; the rest of the
                    // block keeps the parent's view by copying it whole.
                    let bs = self.metadata.block_size as u64;
                    let block_base = block * bs;
                    let mut copy = vec![0u8; bs as usize];
                    let parent = self.parent.as_mut().expect("parent_holds");
                    parent.read_at(block_base, &mut copy)?;
                    self.backend.write_at(at, &copy)?;
                }
            }
            PAYLOAD_BLOCK_PARTIALLY_PRESENT => {
                // Promote to fully-present by merging with the parent view.
                let bs = self.metadata.block_size as u64;
                let block_base = block * bs;
                let mut copy = vec![0u8; bs as usize];
                self.read_block_span(block, 0, block_base, &mut copy)?;
                at = self.allocate_block(block)?;
                self.backend.write_at(at, &copy)?;
            }
            s => return Err(Error::BadFormat(format!("invalid VHDX payload state {}", s))),
        }
        self.backend.write_at(at + in_block, payload)
    }
}

struct ParsedLogEntry {
    sequence: u64,
    length: u32,
    tail: u32,
    flushed_file_offset: u64,
    writes: Vec<(u64, Vec<u8>)>,
}

fn parse_parent_locator(raw: &[u8]) -> Result<HashMap<String, String>> {
    if raw.len() < 20 {
        return Err(Error::BadFormat("VHDX parent locator too short".into()));
    }
    let count = u16::from_le_bytes(raw[18..20].try_into().unwrap()) as usize;
    let mut entries = HashMap::new();
    for i in 0..count {
        let e = 20 + i * 12;
        if raw.len() < e + 12 {
            return Err(Error::BadFormat("VHDX parent locator truncated".into()));
        }
        let key_off = u32::from_le_bytes(raw[e..e + 4].try_into().unwrap()) as usize;
        let val_off = u32::from_le_bytes(raw[e + 4..e + 8].try_into().unwrap()) as usize;
        let key_len = u16::from_le_bytes(raw[e + 8..e + 10].try_into().unwrap()) as usize;
        let val_len = u16::from_le_bytes(raw[e + 10..e + 12].try_into().unwrap()) as usize;
        if key_off + key_len > raw.len() || val_off + val_len > raw.len() {
            return Err(Error::BadFormat("VHDX parent locator entry out of bounds".into()));
        }
        let utf16 = |bytes: &[u8]| -> String {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        };
        entries.insert(utf16(&raw[key_off..key_off + key_len]), utf16(&raw[val_off..val_off + val_len]));
    }
    Ok(entries)
}

impl<B: Backend> BlockContainer for VhdxDisk<B> {
    fn size(&self) -> u64 {
        self.metadata.disk_size
    }

    fn sector_size(&self) -> u32 {
        self.metadata.logical_sector_size
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_aligned(offset, buf.len(), self.metadata.logical_sector_size)?;
        checked_range(offset, buf.len(), self.metadata.disk_size)?;
        let bs = self.metadata.block_size as u64;
        let mut pos = 0usize;
        while pos < buf.len() {
            let voff = offset + pos as u64;
            let block = self.block_index(voff);
            let in_block = voff % bs;
            let take = ((bs - in_block) as usize).min(buf.len() - pos);
            let span = &mut buf[pos..pos + take];
            self.read_block_span(block, in_block, voff, span)?;
            pos += take;
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        check_aligned(offset, buf.len(), self.metadata.logical_sector_size)?;
        checked_range(offset, buf.len(), self.metadata.disk_size)?;
        self.touch_for_write()?;
        let bs = self.metadata.block_size as u64;
        let mut pos = 0usize;
        while pos < buf.len() {
            let voff = offset + pos as u64;
            let block = self.block_index(voff);
            let in_block = voff % bs;
            let take = ((bs - in_block) as usize).min(buf.len() - pos);
            self.write_block_span(block, in_block, &buf[pos..pos + take])?;
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

/// BAT length in bytes (MiB-rounded) and entry count for a dynamic image.
fn bat_facts(disk_size: u64, block_size: u32, logical_sector_size: u32) -> (u64, u64, u64) {
    let chunk_ratio = ((1u64 << 23) * logical_sector_size as u64) / block_size as u64;
    let data_blocks = disk_size.div_ceil(block_size as u64);
    let entries = data_blocks + (data_blocks.saturating_sub(1)) / chunk_ratio;
    let bat_bytes = (entries * 8).div_ceil(MIB) * MIB;
    (bat_bytes, entries, chunk_ratio)
}

/// Creates an empty dynamic VHDX.
pub fn create_dynamic<B: Backend>(
    mut backend: B,
    size: u64,
    block_size: Option<u32>,
    sector_size: u32,
) -> Result<VhdxDisk<B>> {
    if size == 0 || size % sector_size as u64 != 0 {
        return Err(Error::BadFormat("VHDX size must be a nonzero sector multiple".into()));
    }
    if sector_size != 512 && sector_size != 4096 {
        return Err(Error::BadFormat("VHDX logical sector size must be 512 or 4096".into()));
    }
    let block = block_size.unwrap_or(32 << 20);
    if block < (1 << 20) || block > (256 << 20) || !block.is_power_of_two() {
        return Err(Error::BadFormat(
            "VHDX block size must be a power of two between 1 MiB and 256 MiB".into(),
        ));
    }
    let (bat_bytes, _, _) = bat_facts(size, block, sector_size);

    backend.set_len(0)?;
    // File type identifier block.
    let mut fti = vec![0u8; 64 << 10];
    fti[0..8].copy_from_slice(SIGNATURE_FILE);
    for (i, c) in "fathom".encode_utf16().enumerate() {
        fti[8 + i * 2..10 + i * 2].copy_from_slice(&c.to_le_bytes());
    }
    backend.write_at(0, &fti)?;

    // Two headers; the second carries the greater sequence number.
    let header = VhdxHeader {
        sequence_number: 0,
        log_guid: [0u8; 16],
        log_length: MIB as u32,
        log_offset: MIB,
    };
    let file_guid = *Uuid::new_v4().as_bytes();
    let data_guid = *Uuid::new_v4().as_bytes();
    backend.write_at(HEADER1_OFFSET, &header.pack(&file_guid, &data_guid))?;
    let header2 = VhdxHeader {
        sequence_number: 1,
        ..header.clone()
    };
    backend.write_at(HEADER2_OFFSET, &header2.pack(&file_guid, &data_guid))?;

    // Region table and copy: metadata at 2 MiB, BAT at 3 MiB.
    let mut region = vec![0u8; 64 << 10];
    region[0..4].copy_from_slice(SIGNATURE_REGION);
    region[8..12].copy_from_slice(&2u32.to_le_bytes());
    let mut entry = |at: usize, guid: Uuid, offset: u64, length: u32| {
        region[at..at + 16].copy_from_slice(&guid.to_bytes_le());
        region[at + 16..at + 24].copy_from_slice(&offset.to_le_bytes());
        region[at + 24..at + 28].copy_from_slice(&length.to_le_bytes());
        region[at + 28..at + 32].copy_from_slice(&1u32.to_le_bytes());
    };
    entry(16, GUID_REGION_METADATA, 2 * MIB, MIB as u32);
    entry(48, GUID_REGION_BAT, 3 * MIB, bat_bytes as u32);
    let crc = crc_with_hole(&region, 4);
    region[4..8].copy_from_slice(&crc.to_le_bytes());
    backend.write_at(REGION1_OFFSET, &region)?;
    backend.write_at(REGION2_OFFSET, &region)?;

    // Metadata region: table header + five items, payloads from +64 KiB.
    let mut meta = vec![0u8; 128 << 10];
    meta[0..8].copy_from_slice(SIGNATURE_METADATA);
    meta[0x0A..0x0C].copy_from_slice(&5u16.to_le_bytes());
    let mut meta_entry = |slot: usize, guid: Uuid, offset: u32, length: u32, flags: u32| {
        let at = 32 + slot * 32;
        meta[at..at + 16].copy_from_slice(&guid.to_bytes_le());
        meta[at + 16..at + 20].copy_from_slice(&offset.to_le_bytes());
        meta[at + 20..at + 24].copy_from_slice(&length.to_le_bytes());
        meta[at + 24..at + 28].copy_from_slice(&flags.to_le_bytes());
    };
    meta_entry(0, GUID_META_FILE_PARAMS, 0x10000, 8, 4);
    meta_entry(1, GUID_META_DISK_SIZE, 0x10008, 8, 6);
    meta_entry(2, GUID_META_LOGICAL_SS, 0x10010, 4, 4);
    meta_entry(3, GUID_META_PHYSICAL_SS, 0x10014, 4, 4);
    meta_entry(4, GUID_META_DISK_ID, 0x10018, 16, 4);
    meta[0x10000..0x10004].copy_from_slice(&block.to_le_bytes());
    meta[0x10004..0x10008].copy_from_slice(&0u32.to_le_bytes());
    meta[0x10008..0x10010].copy_from_slice(&size.to_le_bytes());
    meta[0x10010..0x10014].copy_from_slice(&sector_size.to_le_bytes());
    meta[0x10014..0x10018].copy_from_slice(&sector_size.to_le_bytes());
    meta[0x10018..0x10028].copy_from_slice(&Uuid::new_v4().to_bytes_le());
    backend.write_at(2 * MIB, &meta)?;

    // Zeroed log and BAT regions.
    backend.set_len(3 * MIB + bat_bytes)?;
    backend.flush()?;
    info!(
        "created dynamic VHDX ({} bytes, {} byte blocks, {} B sectors)",
        size, block, sector_size
    );
    VhdxDisk::open_backend(backend, OpenMode::ReadWrite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fathom_core::MemBackend;

    #[test]
    fn test_create_open_roundtrip() {
        let disk = create_dynamic(MemBackend::new(), 64 << 20, Some(1 << 20), 512).unwrap();
        assert_eq!(disk.size(), 64 << 20);
        assert_eq!(disk.sector_size(), 512);
        assert_eq!(disk.metadata.block_size, 1 << 20);
        assert_eq!(disk.chunk_ratio, (1 << 23) * 512 / (1 << 20));
    }

    #[test]
    fn test_unallocated_reads_zero() {
        let mut disk = create_dynamic(MemBackend::new(), 64 << 20, Some(1 << 20), 512).unwrap();
        let mut buf = [0x13u8; 4096];
        disk.read_at(10 << 20, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut disk = create_dynamic(MemBackend::new(), 64 << 20, Some(1 << 20), 512).unwrap();
        let payload = vec![0xC3u8; 8192];
        disk.write_at(33 << 20, &payload).unwrap();
        let mut got = vec![0u8; 8192];
        disk.read_at(33 << 20, &mut got).unwrap();
        assert_eq!(got, payload);
    }

    #[test]
    fn test_4k_sector_image() {
        let mut disk = create_dynamic(MemBackend::new(), 64 << 20, Some(1 << 20), 4096).unwrap();
        assert_eq!(disk.sector_size(), 4096);
        // Sub-sector alignment is rejected.
        assert!(matches!(
            disk.read_at(512, &mut [0u8; 512]),
            Err(Error::Unaligned { .. })
        ));
        disk.write_at(4096, &[7u8; 4096]).unwrap();
        let mut got = [0u8; 4096];
        disk.read_at(4096, &mut got).unwrap();
        assert_eq!(got, [7u8; 4096]);
    }

    #[test]
    fn test_reopen_after_write() {
        let mut disk = create_dynamic(MemBackend::new(), 32 << 20, Some(1 << 20), 512).unwrap();
        disk.write_at(0, &[0xABu8; 512]).unwrap();
        disk.flush().unwrap();
        let mut again =
            VhdxDisk::open_backend(disk.into_backend(), OpenMode::ReadOnly).unwrap();
        let mut got = [0u8; 512];
        again.read_at(0, &mut got).unwrap();
        assert_eq!(got, [0xABu8; 512]);
    }

    #[test]
    fn test_write_bumps_header_sequence() {
        let mut disk = create_dynamic(MemBackend::new(), 32 << 20, Some(1 << 20), 512).unwrap();
        let seq_before = disk.header.sequence_number;
        disk.write_at(0, &[1u8; 512]).unwrap();
        assert!(disk.header.sequence_number > seq_before);
        // Both headers on disk must still validate.
        let mut raw = vec![0u8; 4096];
        disk.backend.read_at(HEADER1_OFFSET, &mut raw).unwrap();
        VhdxHeader::parse(&raw).unwrap();
        disk.backend.read_at(HEADER2_OFFSET, &mut raw).unwrap();
        VhdxHeader::parse(&raw).unwrap();
    }

    #[test]
    fn test_nonzero_log_guid_read_only_refused() {
        let disk = create_dynamic(MemBackend::new(), 32 << 20, Some(1 << 20), 512).unwrap();
        let mut raw = disk.into_backend().into_vec();
        // Forge a LogGuid into header 1 with a fixed-up checksum and a
        // higher sequence number so it is the active header.
        raw[(HEADER1_OFFSET + 8) as usize] = 9;
        raw[(HEADER1_OFFSET + 0x30) as usize] = 0xAA;
        let crc = crc_with_hole(
            &raw[HEADER1_OFFSET as usize..(HEADER1_OFFSET + 4096) as usize],
            4,
        );
        raw[(HEADER1_OFFSET + 4) as usize..(HEADER1_OFFSET + 8) as usize]
            .copy_from_slice(&crc.to_le_bytes());
        let res = VhdxDisk::open_backend(MemBackend::from_vec(raw), OpenMode::ReadOnly);
        assert!(res.is_err());
    }

    #[test]
    fn test_corrupt_region_tables_rejected() {
        let disk = create_dynamic(MemBackend::new(), 32 << 20, Some(1 << 20), 512).unwrap();
        let mut raw = disk.into_backend().into_vec();
        raw[REGION1_OFFSET as usize] ^= 0xFF;
        raw[REGION2_OFFSET as usize] ^= 0xFF;
        assert!(VhdxDisk::open_backend(MemBackend::from_vec(raw), OpenMode::ReadOnly).is_err());
    }

    #[test]
    fn test_zero_write_stays_virtual() {
        let mut disk = create_dynamic(MemBackend::new(), 32 << 20, Some(1 << 20), 512).unwrap();
        let before = disk.backend.len().unwrap();
        disk.write_at(5 << 20, &vec![0u8; 1 << 20]).unwrap();
        assert_eq!(disk.backend.len().unwrap(), before);
    }
}
