// MBR and GPT partition tables: parsing, creation, and sub-container
// views clamped to partition bounds.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fathom_core::{checked_range, BlockContainer, Error, Result};

const MBR_SIGNATURE: u16 = 0xAA55;
const MBR_TABLE_OFFSET: usize = 0x1BE;
const MBR_TYPE_EXTENDED_CHS: u8 = 0x05;
const MBR_TYPE_EXTENDED_LBA: u8 = 0x0F;
const MBR_TYPE_GPT_PROTECTIVE: u8 = 0xEE;

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_HEADER_SIZE: u32 = 92;
const GPT_ENTRY_SIZE: u32 = 128;
const GPT_ENTRY_COUNT: u32 = 128;

/// Basic data partition, the type Windows assigns to FAT/exFAT/NTFS.
pub const GUID_BASIC_DATA: Uuid = Uuid::from_u128(0xEBD0A0A2_B9E5_4433_87C0_68B6B72699C7);

/// First partition start: 1 MiB alignment, the modern convention.
const FIRST_USABLE_LBA_MBR: u64 = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionScheme {
    Mbr,
    Gpt,
}

/// One partition as parsed from an MBR, EBR chain, or GPT entry array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub index: usize,
    pub start_lba: u64,
    pub total_lba: u64,
    /// MBR partition type byte; 0 for GPT entries.
    pub mbr_type: u8,
    /// GPT partition type GUID; None for MBR entries.
    pub type_guid: Option<Uuid>,
    pub bootable: bool,
    pub name: Option<String>,
}

impl PartitionEntry {
    pub fn byte_offset(&self, sector_size: u32) -> u64 {
        self.start_lba * sector_size as u64
    }

    pub fn byte_len(&self, sector_size: u32) -> u64 {
        self.total_lba * sector_size as u64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionTable {
    pub scheme: PartitionScheme,
    pub entries: Vec<PartitionEntry>,
}

/// Requested partition for table creation.
#[derive(Debug, Clone)]
pub struct PartitionSpec {
    /// Size in bytes; 0 means "rest of the disk".
    pub size: u64,
    pub mbr_type: u8,
    pub name: String,
}

impl PartitionSpec {
    pub fn whole_disk(mbr_type: u8) -> Self {
        Self {
            size: 0,
            mbr_type,
            name: "Basic data partition".into(),
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

impl PartitionTable {
    /// Reads the partition table from sector 0 (and the GPT header/entries
    /// or EBR chain it points to).
    pub fn read<C: BlockContainer>(disk: &mut C) -> Result<Self> {
        let ss = disk.sector_size() as usize;
        let mut sector0 = vec![0u8; ss];
        disk.read_at(0, &mut sector0)?;
        if u16::from_le_bytes([sector0[510], sector0[511]]) != MBR_SIGNATURE {
            return Err(Error::BadFormat("missing MBR signature 0xAA55".into()));
        }
        let first_type = sector0[MBR_TABLE_OFFSET + 4];
        if first_type == MBR_TYPE_GPT_PROTECTIVE {
            return Self::read_gpt(disk);
        }
        Self::read_mbr(disk, &sector0)
    }

    fn read_mbr<C: BlockContainer>(disk: &mut C, sector0: &[u8]) -> Result<Self> {
        let ss = disk.sector_size() as u64;
        let disk_sectors = disk.size() / ss;
        let mut entries = Vec::new();
        let mut extended_start = None;
        for i in 0..4 {
            let raw = &sector0[MBR_TABLE_OFFSET + i * 16..MBR_TABLE_OFFSET + (i + 1) * 16];
            let ptype = raw[4];
            if ptype == 0 {
                continue;
            }
            let start_lba = u32::from_le_bytes(raw[8..12].try_into().unwrap()) as u64;
            let total_lba = u32::from_le_bytes(raw[12..16].try_into().unwrap()) as u64;
            if total_lba == 0 || start_lba + total_lba > disk_sectors {
                warn!(
                    "MBR entry {} out of range (start {}, {} sectors), skipping",
                    i, start_lba, total_lba
                );
                continue;
            }
            if ptype == MBR_TYPE_EXTENDED_CHS || ptype == MBR_TYPE_EXTENDED_LBA {
                extended_start = Some(start_lba);
                continue;
            }
            entries.push(PartitionEntry {
                index: entries.len(),
                start_lba,
                total_lba,
                mbr_type: ptype,
                type_guid: None,
                bootable: raw[0] == 0x80,
                name: None,
            });
        }
        if let Some(ext) = extended_start {
            Self::walk_ebr_chain(disk, ext, &mut entries)?;
        }
        debug!("parsed MBR with {} partition(s)", entries.len());
        Ok(Self {
            scheme: PartitionScheme::Mbr,
            entries,
        })
    }

    /// Logical partitions: each EBR holds one logical entry (relative to
    /// that EBR) and a link to the next EBR (relative to the extended
    /// partition start).
    fn walk_ebr_chain<C: BlockContainer>(
        disk: &mut C,
        extended_start: u64,
        entries: &mut Vec<PartitionEntry>,
    ) -> Result<()> {
        let ss = disk.sector_size() as u64;
        let disk_sectors = disk.size() / ss;
        let mut ebr_lba = extended_start;
        let mut hops = 0;
        loop {
            if hops > 128 {
                return Err(Error::BadFormat("EBR chain too long (cycle?)".into()));
            }
            hops += 1;
            let mut sector = vec![0u8; ss as usize];
            disk.read_at(ebr_lba * ss, &mut sector)?;
            if u16::from_le_bytes([sector[510], sector[511]]) != MBR_SIGNATURE {
                return Err(Error::BadFormat("EBR missing 0xAA55 signature".into()));
            }
            let first = &sector[MBR_TABLE_OFFSET..MBR_TABLE_OFFSET + 16];
            let ptype = first[4];
            if ptype != 0 {
                let rel = u32::from_le_bytes(first[8..12].try_into().unwrap()) as u64;
                let total = u32::from_le_bytes(first[12..16].try_into().unwrap()) as u64;
                let start = ebr_lba + rel;
                if total != 0 && start + total <= disk_sectors {
                    entries.push(PartitionEntry {
                        index: entries.len(),
                        start_lba: start,
                        total_lba: total,
                        mbr_type: ptype,
                        type_guid: None,
                        bootable: first[0] == 0x80,
                        name: None,
                    });
                }
            }
            let next = &sector[MBR_TABLE_OFFSET + 16..MBR_TABLE_OFFSET + 32];
            let next_rel = u32::from_le_bytes(next[8..12].try_into().unwrap()) as u64;
            let next_total = u32::from_le_bytes(next[12..16].try_into().unwrap()) as u64;
            if next[4] == 0 || next_rel == 0 || next_total == 0 {
                break;
            }
            ebr_lba = extended_start + next_rel;
        }
        Ok(())
    }

    fn read_gpt<C: BlockContainer>(disk: &mut C) -> Result<Self> {
        let ss = disk.sector_size() as u64;
        let mut header = vec![0u8; ss as usize];
        disk.read_at(ss, &mut header)?;
        let entries = match Self::parse_gpt_header(disk, &header, ss) {
            Ok(e) => e,
            Err(primary_err) => {
                // Primary damaged: try the backup header at the last LBA.
                warn!("primary GPT header invalid ({}), trying backup", primary_err);
                let backup_lba = disk.size() / ss - 1;
                disk.read_at(backup_lba * ss, &mut header)?;
                Self::parse_gpt_header(disk, &header, ss)?
            }
        };
        debug!("parsed GPT with {} partition(s)", entries.len());
        Ok(Self {
            scheme: PartitionScheme::Gpt,
            entries,
        })
    }

    fn parse_gpt_header<C: BlockContainer>(
        disk: &mut C,
        header: &[u8],
        ss: u64,
    ) -> Result<Vec<PartitionEntry>> {
        if &header[0..8] != GPT_SIGNATURE {
            return Err(Error::BadFormat("missing GPT signature".into()));
        }
        let header_size = u32::from_le_bytes(header[12..16].try_into().unwrap());
        if !(GPT_HEADER_SIZE..=ss as u32).contains(&header_size) {
            return Err(Error::BadFormat(format!(
                "implausible GPT header size {}",
                header_size
            )));
        }
        let stored_crc = u32::from_le_bytes(header[16..20].try_into().unwrap());
        let mut scratch = header[..header_size as usize].to_vec();
        scratch[16..20].fill(0);
        if crc32fast::hash(&scratch) != stored_crc {
            return Err(Error::BadFormat("GPT header CRC32 mismatch".into()));
        }
        let entries_lba = u64::from_le_bytes(header[72..80].try_into().unwrap());
        let num_entries = u32::from_le_bytes(header[80..84].try_into().unwrap());
        let entry_size = u32::from_le_bytes(header[84..88].try_into().unwrap());
        let entries_crc = u32::from_le_bytes(header[88..92].try_into().unwrap());
        if entry_size < 128 || num_entries == 0 || num_entries > 4096 {
            return Err(Error::BadFormat("implausible GPT entry geometry".into()));
        }
        let table_len = (num_entries as u64 * entry_size as u64) as usize;
        let read_len = table_len.div_ceil(ss as usize) * ss as usize;
        let mut table = vec![0u8; read_len];
        disk.read_at(entries_lba * ss, &mut table)?;
        if crc32fast::hash(&table[..table_len]) != entries_crc {
            return Err(Error::BadFormat("GPT entry array CRC32 mismatch".into()));
        }
        let mut entries = Vec::new();
        for i in 0..num_entries as usize {
            let raw = &table[i * entry_size as usize..(i + 1) * entry_size as usize];
            let type_guid = Uuid::from_bytes_le(raw[0..16].try_into().unwrap());
            if type_guid.is_nil() {
                continue;
            }
            let first = u64::from_le_bytes(raw[32..40].try_into().unwrap());
            let last = u64::from_le_bytes(raw[40..48].try_into().unwrap());
            if last < first {
                warn!("GPT entry {} has end before start, skipping", i);
                continue;
            }
            let name_utf16: Vec<u16> = raw[56..128]
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .take_while(|&c| c != 0)
                .collect();
            entries.push(PartitionEntry {
                index: entries.len(),
                start_lba: first,
                total_lba: last - first + 1,
                mbr_type: 0,
                type_guid: Some(type_guid),
                bootable: false,
                name: Some(String::from_utf16_lossy(&name_utf16)),
            });
        }
        Ok(entries)
    }
}

// ============================================================================
// Creation
// ============================================================================

/// CHS tuple for an LBA, clamped at (1023, 254, 63) when out of range.
fn encode_chs(lba: u64) -> [u8; 3] {
    const HEADS: u64 = 255;
    const SPT: u64 = 63;
    let cylinder = lba / (HEADS * SPT);
    if cylinder > 1023 {
        let (c, h, s) = (1023u64, 254u64, 63u64);
        return [h as u8, ((s & 0x3F) | ((c >> 2) & 0xC0)) as u8, (c & 0xFF) as u8];
    }
    let head = (lba / SPT) % HEADS;
    let sector = lba % SPT + 1;
    [
        head as u8,
        ((sector & 0x3F) | ((cylinder >> 2) & 0xC0)) as u8,
        (cylinder & 0xFF) as u8,
    ]
}

fn layout_specs(
    specs: &[PartitionSpec],
    first_usable: u64,
    last_usable: u64,
    ss: u64,
) -> Result<Vec<(u64, u64)>> {
    if specs.is_empty() {
        return Err(Error::NotSupported("no partitions requested".into()));
    }
    let align = (1 << 20) / ss; // keep every start 1 MiB aligned
    let mut next = first_usable;
    let mut out = Vec::new();
    for (i, spec) in specs.iter().enumerate() {
        let start = next.div_ceil(align) * align;
        if start > last_usable {
            return Err(Error::NoSpace {
                requested: specs.len() as u32,
                available: i as u32,
            });
        }
        let sectors = if spec.size == 0 {
            if i != specs.len() - 1 {
                return Err(Error::NotSupported(
                    "only the last partition may take the remaining space".into(),
                ));
            }
            last_usable - start + 1
        } else {
            spec.size.div_ceil(ss)
        };
        if sectors == 0 || start + sectors - 1 > last_usable {
            return Err(Error::NoSpace {
                requested: specs.len() as u32,
                available: i as u32,
            });
        }
        // Starts are assigned in increasing order, so overlap can only
        // come from a bad size computation; check anyway.
        if let Some(&(pstart, psectors)) = out.last() {
            if start < pstart + psectors {
                return Err(Error::BadFormat("overlapping partitions".into()));
            }
        }
        out.push((start, sectors));
        next = start + sectors;
    }
    Ok(out)
}

/// Writes an MBR with up to four primary partitions. Returns the parsed
/// table for the freshly written sector.
pub fn create_mbr<C: BlockContainer>(
    disk: &mut C,
    specs: &[PartitionSpec],
) -> Result<PartitionTable> {
    if specs.len() > 4 {
        return Err(Error::NotSupported(
            "MBR creation supports at most 4 primary partitions".into(),
        ));
    }
    let ss = disk.sector_size() as u64;
    let disk_sectors = disk.size() / ss;
    let layout = layout_specs(specs, FIRST_USABLE_LBA_MBR, disk_sectors - 1, ss)?;

    let mut mbr = vec![0u8; ss as usize];
    // Minimal jump so naive BIOSes see plausible boot code.
    mbr[0] = 0xEB;
    mbr[1] = 0x3C;
    mbr[2] = 0x90;

    // Windows requires a nonzero disk signature.
    let mut disk_sig = rand::random::<u32>();
    if disk_sig == 0 {
        disk_sig = 0x1234_5678;
    }
    mbr[440..444].copy_from_slice(&disk_sig.to_le_bytes());

    for (i, (&(start, sectors), spec)) in layout.iter().zip(specs).enumerate() {
        let e = MBR_TABLE_OFFSET + i * 16;
        mbr[e] = if i == 0 { 0x80 } else { 0x00 };
        mbr[e + 1..e + 4].copy_from_slice(&encode_chs(start));
        mbr[e + 4] = spec.mbr_type;
        mbr[e + 5..e + 8].copy_from_slice(&encode_chs(start + sectors - 1));
        mbr[e + 8..e + 12].copy_from_slice(&(start as u32).to_le_bytes());
        mbr[e + 12..e + 16].copy_from_slice(&(sectors.min(u32::MAX as u64) as u32).to_le_bytes());
    }
    mbr[510] = 0x55;
    mbr[511] = 0xAA;
    disk.write_at(0, &mbr)?;
    info!(
        "created MBR with {} partition(s), disk signature {:08X}",
        specs.len(),
        disk_sig
    );
    PartitionTable::read(disk)
}

fn build_gpt_header(
    current_lba: u64,
    backup_lba: u64,
    first_usable: u64,
    last_usable: u64,
    disk_guid: Uuid,
    entries_lba: u64,
    entries_crc: u32,
    ss: usize,
) -> Vec<u8> {
    let mut h = vec![0u8; ss];
    h[0..8].copy_from_slice(GPT_SIGNATURE);
    h[8..12].copy_from_slice(&[0x00, 0x00, 0x01, 0x00]); // revision 1.0
    h[12..16].copy_from_slice(&GPT_HEADER_SIZE.to_le_bytes());
    h[24..32].copy_from_slice(&current_lba.to_le_bytes());
    h[32..40].copy_from_slice(&backup_lba.to_le_bytes());
    h[40..48].copy_from_slice(&first_usable.to_le_bytes());
    h[48..56].copy_from_slice(&last_usable.to_le_bytes());
    h[56..72].copy_from_slice(&disk_guid.to_bytes_le());
    h[72..80].copy_from_slice(&entries_lba.to_le_bytes());
    h[80..84].copy_from_slice(&GPT_ENTRY_COUNT.to_le_bytes());
    h[84..88].copy_from_slice(&GPT_ENTRY_SIZE.to_le_bytes());
    h[88..92].copy_from_slice(&entries_crc.to_le_bytes());
    let crc = crc32fast::hash(&h[..GPT_HEADER_SIZE as usize]);
    h[16..20].copy_from_slice(&crc.to_le_bytes());
    h
}

/// Writes a protective MBR, primary GPT, and backup GPT.
pub fn create_gpt<C: BlockContainer>(
    disk: &mut C,
    specs: &[PartitionSpec],
) -> Result<PartitionTable> {
    if specs.len() as u32 > GPT_ENTRY_COUNT {
        return Err(Error::NotSupported("too many GPT partitions".into()));
    }
    let ss = disk.sector_size() as u64;
    let disk_sectors = disk.size() / ss;
    let table_sectors = (GPT_ENTRY_COUNT * GPT_ENTRY_SIZE) as u64 / ss;
    let first_usable = (2 + table_sectors).max((1 << 20) / ss);
    let backup_lba = disk_sectors - 1;
    let backup_entries_lba = backup_lba - table_sectors;
    let last_usable = backup_entries_lba - 1;
    let layout = layout_specs(specs, first_usable, last_usable, ss)?;

    // Protective MBR covering the whole disk with one 0xEE entry.
    let mut pmbr = vec![0u8; ss as usize];
    pmbr[0] = 0xEB;
    pmbr[1] = 0x3C;
    pmbr[2] = 0x90;
    let e = MBR_TABLE_OFFSET;
    pmbr[e + 1] = 0x00;
    pmbr[e + 2] = 0x01;
    pmbr[e + 3] = 0x00;
    pmbr[e + 4] = MBR_TYPE_GPT_PROTECTIVE;
    pmbr[e + 5] = 0xFE;
    pmbr[e + 6] = 0xFF;
    pmbr[e + 7] = 0xFF;
    pmbr[e + 8..e + 12].copy_from_slice(&1u32.to_le_bytes());
    let protective = (disk_sectors - 1).min(u32::MAX as u64) as u32;
    pmbr[e + 12..e + 16].copy_from_slice(&protective.to_le_bytes());
    pmbr[510] = 0x55;
    pmbr[511] = 0xAA;

    // Entry array, shared verbatim by primary and backup.
    let mut table = vec![0u8; (GPT_ENTRY_COUNT * GPT_ENTRY_SIZE) as usize];
    for (i, (&(start, sectors), spec)) in layout.iter().zip(specs).enumerate() {
        let raw = &mut table[i * GPT_ENTRY_SIZE as usize..(i + 1) * GPT_ENTRY_SIZE as usize];
        raw[0..16].copy_from_slice(&GUID_BASIC_DATA.to_bytes_le());
        raw[16..32].copy_from_slice(&Uuid::new_v4().to_bytes_le());
        raw[32..40].copy_from_slice(&start.to_le_bytes());
        raw[40..48].copy_from_slice(&(start + sectors - 1).to_le_bytes());
        for (j, ch) in spec.name.encode_utf16().take(36).enumerate() {
            raw[56 + j * 2..58 + j * 2].copy_from_slice(&ch.to_le_bytes());
        }
    }
    let entries_crc = crc32fast::hash(&table);
    let disk_guid = Uuid::new_v4();

    let primary = build_gpt_header(
        1,
        backup_lba,
        first_usable,
        last_usable,
        disk_guid,
        2,
        entries_crc,
        ss as usize,
    );
    let backup = build_gpt_header(
        backup_lba,
        1,
        first_usable,
        last_usable,
        disk_guid,
        backup_entries_lba,
        entries_crc,
        ss as usize,
    );

    disk.write_at(0, &pmbr)?;
    disk.write_at(ss, &primary)?;
    disk.write_at(2 * ss, &table)?;
    disk.write_at(backup_entries_lba * ss, &table)?;
    disk.write_at(backup_lba * ss, &backup)?;
    info!("created GPT with {} partition(s)", specs.len());
    PartitionTable::read(disk)
}

// ============================================================================
// Sub-container view
// ============================================================================

/// A partition as a container: all I/O is clamped to the partition's
/// byte range and offset by its start.
pub struct PartitionView<C> {
    inner: C,
    start: u64,
    len: u64,
}

impl<C: BlockContainer> PartitionView<C> {
    pub fn new(inner: C, entry: &PartitionEntry) -> Self {
        let ss = inner.sector_size();
        Self {
            inner,
            start: entry.byte_offset(ss),
            len: entry.byte_len(ss),
        }
    }

    /// Reads the table and opens partition `index`.
    pub fn open(mut inner: C, index: usize) -> Result<Self> {
        let table = PartitionTable::read(&mut inner)?;
        let entry = table
            .entries
            .get(index)
            .ok_or_else(|| Error::NotFound(format!("partition {}", index)))?
            .clone();
        Ok(Self::new(inner, &entry))
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C: BlockContainer> BlockContainer for PartitionView<C> {
    fn size(&self) -> u64 {
        self.len
    }

    fn sector_size(&self) -> u32 {
        self.inner.sector_size()
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.len)?;
        self.inner.read_at(self.start + offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.len)?;
        self.inner.write_at(self.start + offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fathom_core::MemContainer;

    fn disk(mib: u64) -> MemContainer {
        MemContainer::with_size(mib << 20, 512).unwrap()
    }

    #[test]
    fn test_mbr_roundtrip() {
        let mut d = disk(64);
        let created = create_mbr(&mut d, &[PartitionSpec::whole_disk(0x06)]).unwrap();
        assert_eq!(created.scheme, PartitionScheme::Mbr);
        assert_eq!(created.entries.len(), 1);
        let e = &created.entries[0];
        assert_eq!(e.start_lba, 2048);
        assert_eq!(e.mbr_type, 0x06);
        assert!(e.bootable);
        assert_eq!(e.start_lba + e.total_lba, (64 << 20) / 512);
    }

    #[test]
    fn test_mbr_two_partitions() {
        let mut d = disk(64);
        let specs = [
            PartitionSpec {
                size: 16 << 20,
                mbr_type: 0x06,
                name: String::new(),
            },
            PartitionSpec::whole_disk(0x0C),
        ];
        let t = create_mbr(&mut d, &specs).unwrap();
        assert_eq!(t.entries.len(), 2);
        assert_eq!(t.entries[0].total_lba, (16 << 20) / 512);
        // Second starts on the next 1 MiB boundary after the first.
        assert_eq!(t.entries[1].start_lba, 2048 + (16 << 20) / 512);
        assert!(t.entries[1].start_lba % 2048 == 0);
    }

    #[test]
    fn test_gpt_roundtrip() {
        let mut d = disk(64);
        let t = create_gpt(&mut d, &[PartitionSpec::whole_disk(0x07)]).unwrap();
        assert_eq!(t.scheme, PartitionScheme::Gpt);
        assert_eq!(t.entries.len(), 1);
        assert_eq!(t.entries[0].type_guid, Some(GUID_BASIC_DATA));
        assert_eq!(
            t.entries[0].name.as_deref(),
            Some("Basic data partition")
        );
    }

    #[test]
    fn test_gpt_backup_header_survives_primary_damage() {
        let mut d = disk(64);
        create_gpt(&mut d, &[PartitionSpec::whole_disk(0x07)]).unwrap();
        // Trash the primary header.
        d.write_at(512, &vec![0u8; 512]).unwrap();
        let t = PartitionTable::read(&mut d).unwrap();
        assert_eq!(t.entries.len(), 1);
    }

    #[test]
    fn test_gpt_header_crc_validated() {
        let mut d = disk(64);
        create_gpt(&mut d, &[PartitionSpec::whole_disk(0x07)]).unwrap();
        // Flip a byte in both headers: parsing must fail.
        let mut sector = vec![0u8; 512];
        d.read_at(512, &mut sector).unwrap();
        sector[40] ^= 0xFF;
        d.write_at(512, &sector).unwrap();
        let backup_lba = d.size() / 512 - 1;
        d.read_at(backup_lba * 512, &mut sector).unwrap();
        sector[40] ^= 0xFF;
        d.write_at(backup_lba * 512, &sector).unwrap();
        assert!(PartitionTable::read(&mut d).is_err());
    }

    #[test]
    fn test_partition_view_clamps() {
        let mut d = disk(64);
        create_mbr(&mut d, &[PartitionSpec::whole_disk(0x06)]).unwrap();
        let mut view = PartitionView::open(d, 0).unwrap();
        let size = view.size();
        view.write_at(0, &[0xAAu8; 512]).unwrap();
        assert!(matches!(
            view.write_at(size, &[0u8; 512]),
            Err(Error::OutOfBounds { .. })
        ));
        // The view's sector 0 is the partition start, not the MBR.
        let mut back = view.into_inner();
        let mut probe = vec![0u8; 512];
        back.read_at(2048 * 512, &mut probe).unwrap();
        assert_eq!(probe[0], 0xAA);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let mut d = disk(4);
        let specs = [PartitionSpec {
            size: 64 << 20,
            mbr_type: 0x06,
            name: String::new(),
        }];
        assert!(create_mbr(&mut d, &specs).is_err());
    }
}
