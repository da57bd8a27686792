// Volume formatting: lays down FAT12/16/32 or exFAT structures on a
// container. The CLI front-end that drives this is external; the tests
// and the end-to-end scenarios use it directly.

use log::info;

use fathom_core::{BlockContainer, Error, Result};
use fathom_disks::SectorCache;

use crate::fat::boot_sector::{build_fsinfo, exfat_boot_checksum, FatGeometry};
use crate::fat::dir::{EXFAT_TYPE_BITMAP, EXFAT_TYPE_UPCASE};
use crate::fat::names::UpcaseTable;
use crate::fat::{FatKind, MAX_CLUSTER_BYTES};

#[derive(Debug, Clone, Default)]
pub struct FormatParams {
    /// Forced variant; auto-selected from the volume size when None.
    pub kind: Option<FatKind>,
    /// Forced cluster size in bytes (power of two up to 256 KiB).
    pub cluster_bytes: Option<u32>,
    pub fat_copies: Option<u32>,
    /// FAT12/16 fixed root slots.
    pub root_entries: Option<u32>,
    pub label: Option<String>,
}

fn check_cluster_param(cluster_bytes: u32, sector: u32) -> Result<()> {
    if cluster_bytes < sector
        || cluster_bytes > MAX_CLUSTER_BYTES
        || !cluster_bytes.is_power_of_two()
    {
        return Err(Error::BadFormat(format!(
            "cluster size {} invalid for {} byte sectors",
            cluster_bytes, sector
        )));
    }
    Ok(())
}

fn auto_kind(size: u64) -> FatKind {
    if size < (16 << 20) {
        FatKind::Fat12
    } else if size < (512 << 20) {
        FatKind::Fat16
    } else {
        FatKind::Fat32
    }
}

fn auto_cluster(kind: FatKind, size: u64, sector: u32) -> u32 {
    let target = match kind {
        FatKind::Fat12 => 1 << 10,
        FatKind::Fat16 => match size {
            s if s <= (128 << 20) => 2 << 10,
            s if s <= (256 << 20) => 4 << 10,
            s if s <= (512 << 20) => 8 << 10,
            s if s <= (1 << 30) => 16 << 10,
            _ => 32 << 10,
        },
        FatKind::Fat32 => match size {
            s if s <= (8 << 30) => 4 << 10,
            s if s <= (16 << 30) => 8 << 10,
            s if s <= (32 << 30) => 16 << 10,
            _ => 32 << 10,
        },
        FatKind::ExFat => match size {
            s if s <= (256 << 20) => 4 << 10,
            s if s <= (32 << 30) => 32 << 10,
            _ => 128 << 10,
        },
    };
    target.max(sector)
}

/// Formats a classic FAT volume. Returns the resulting geometry.
pub fn format_fat<D: BlockContainer>(raw: &mut D, params: &FormatParams) -> Result<FatGeometry> {
    // Sub-sector structure writes go through a scratch sector cache.
    let mut disk = SectorCache::new(&mut *raw);
    let disk = &mut disk;
    let sector = disk.sector_size();
    let size = disk.size();
    let total_sectors = size / sector as u64;
    if total_sectors > u32::MAX as u64 {
        return Err(Error::BadFormat("volume too large for a FAT sector count".into()));
    }
    let kind = params.kind.unwrap_or_else(|| auto_kind(size));
    if kind == FatKind::ExFat {
        return Err(Error::BadFormat("use format_exfat for exFAT volumes".into()));
    }
    let cluster_bytes = params.cluster_bytes.unwrap_or_else(|| auto_cluster(kind, size, sector));
    check_cluster_param(cluster_bytes, sector)?;
    let spc = cluster_bytes / sector;
    let fat_copies = params.fat_copies.unwrap_or(2);
    let reserved: u32 = if kind == FatKind::Fat32 { 32 } else { 1 };
    let root_entries = if kind == FatKind::Fat32 {
        0
    } else {
        let n = params
            .root_entries
            .unwrap_or(if kind == FatKind::Fat12 { 224 } else { 512 });
        if (n * 32) % sector != 0 {
            return Err(Error::BadFormat(
                "root entry count must fill whole sectors".into(),
            ));
        }
        n
    };
    let root_sectors = root_entries * 32 / sector;

    // FAT size and cluster count are mutually dependent; iterate to a
    // fixed point.
    let bits = kind.bits();
    let mut fat_sectors = 1u32;
    let mut clusters;
    loop {
        let overhead = reserved as u64 + (fat_copies * fat_sectors) as u64 + root_sectors as u64;
        if overhead >= total_sectors {
            return Err(Error::BadFormat("volume too small for its metadata".into()));
        }
        clusters = ((total_sectors - overhead) / spc as u64) as u32;
        let needed_bytes = ((clusters as u64 + 2) * bits as u64).div_ceil(8);
        let needed = needed_bytes.div_ceil(sector as u64) as u32;
        if needed <= fat_sectors {
            break;
        }
        fat_sectors = needed;
    }
    match kind {
        FatKind::Fat12 if clusters >= 4085 => {
            return Err(Error::BadFormat(format!(
                "{} clusters is too many for FAT12",
                clusters
            )))
        }
        FatKind::Fat16 if !(4085..65525).contains(&clusters) => {
            return Err(Error::BadFormat(format!(
                "{} clusters is outside the FAT16 range",
                clusters
            )))
        }
        FatKind::Fat32 if clusters < 65525 => {
            return Err(Error::BadFormat(format!(
                "{} clusters is too few for FAT32",
                clusters
            )))
        }
        _ => {}
    }

    // Boot sector.
    let mut bs = vec![0u8; sector as usize];
    bs[0] = 0xEB;
    bs[1] = 0x3C;
    bs[2] = 0x90;
    bs[3..11].copy_from_slice(if kind == FatKind::Fat32 {
        b"MSWIN4.1"
    } else {
        b"MSDOS5.0"
    });
    bs[11..13].copy_from_slice(&(sector as u16).to_le_bytes());
    bs[13] = spc as u8;
    bs[14..16].copy_from_slice(&(reserved as u16).to_le_bytes());
    bs[16] = fat_copies as u8;
    bs[17..19].copy_from_slice(&(root_entries as u16).to_le_bytes());
    if total_sectors <= 0xFFFF && kind != FatKind::Fat32 {
        bs[19..21].copy_from_slice(&(total_sectors as u16).to_le_bytes());
    } else {
        bs[32..36].copy_from_slice(&(total_sectors as u32).to_le_bytes());
    }
    bs[21] = 0xF8;
    if kind != FatKind::Fat32 {
        bs[22..24].copy_from_slice(&(fat_sectors as u16).to_le_bytes());
    }
    bs[24..26].copy_from_slice(&63u16.to_le_bytes());
    bs[26..28].copy_from_slice(&255u16.to_le_bytes());
    let serial = rand::random::<u32>();
    let label_text = params.label.clone().unwrap_or_default();
    let mut label_raw = [0x20u8; 11];
    for (i, b) in label_text.to_uppercase().bytes().take(11).enumerate() {
        label_raw[i] = b;
    }
    if label_text.is_empty() {
        label_raw[..7].copy_from_slice(b"NO NAME");
    }
    if kind == FatKind::Fat32 {
        bs[36..40].copy_from_slice(&fat_sectors.to_le_bytes());
        bs[44..48].copy_from_slice(&2u32.to_le_bytes()); // root cluster
        bs[48..50].copy_from_slice(&1u16.to_le_bytes()); // FSInfo sector
        bs[50..52].copy_from_slice(&6u16.to_le_bytes()); // backup boot
        bs[64] = 0x80;
        bs[66] = 0x29;
        bs[67..71].copy_from_slice(&serial.to_le_bytes());
        bs[71..82].copy_from_slice(&label_raw);
        bs[82..90].copy_from_slice(b"FAT32   ");
    } else {
        bs[36] = 0x80;
        bs[38] = 0x29;
        bs[39..43].copy_from_slice(&serial.to_le_bytes());
        bs[43..54].copy_from_slice(&label_raw);
        bs[54..62].copy_from_slice(if kind == FatKind::Fat12 {
            b"FAT12   "
        } else {
            b"FAT16   "
        });
    }
    bs[510] = 0x55;
    bs[511] = 0xAA;
    disk.write_at(0, &bs)?;

    // Zero the FAT area and seed the reserved entries.
    let fat_offset = reserved as u64 * sector as u64;
    let fat_bytes = fat_sectors as u64 * sector as u64;
    zero_region(disk, fat_offset, fat_copies as u64 * fat_bytes)?;
    let mut seed = Vec::new();
    match kind {
        FatKind::Fat12 => seed.extend_from_slice(&[0xF8, 0xFF, 0xFF]),
        FatKind::Fat16 => seed.extend_from_slice(&[0xF8, 0xFF, 0xFF, 0xFF]),
        FatKind::Fat32 => {
            seed.extend_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
            seed.extend_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
            seed.extend_from_slice(&0x0FFF_FFFFu32.to_le_bytes()); // root chain EOC
        }
        FatKind::ExFat => unreachable!(),
    }
    for copy in 0..fat_copies as u64 {
        disk.write_at(fat_offset + copy * fat_bytes, &seed)?;
    }

    // Root directory region (or cluster) arrives zeroed.
    let root_offset = fat_offset + fat_copies as u64 * fat_bytes;
    if kind == FatKind::Fat32 {
        let data_offset = root_offset; // no fixed root region
        zero_region(disk, data_offset, cluster_bytes as u64)?;
        let fsinfo = build_fsinfo(clusters - 1, 3, sector);
        disk.write_at(sector as u64, &fsinfo)?;
        // Backup boot sector and FSInfo at sector 6.
        disk.write_at(6 * sector as u64, &bs)?;
        disk.write_at(7 * sector as u64, &fsinfo)?;
    } else {
        zero_region(disk, root_offset, (root_sectors * sector) as u64)?;
    }
    disk.flush()?;
    info!(
        "formatted {}: {} clusters of {} bytes, {} FAT sectors x{}",
        kind.name(),
        clusters,
        cluster_bytes,
        fat_sectors,
        fat_copies
    );
    let mut sector0 = vec![0u8; sector as usize];
    disk.read_at(0, &mut sector0)?;
    crate::fat::boot_sector::parse_bpb(&sector0, size)
}

/// Formats an exFAT volume: boot regions, FAT, allocation bitmap, upcase
/// table, and an empty root directory.
pub fn format_exfat<D: BlockContainer>(raw: &mut D, params: &FormatParams) -> Result<FatGeometry> {
    let mut disk = SectorCache::new(&mut *raw);
    let disk = &mut disk;
    let sector = disk.sector_size();
    let size = disk.size();
    let cluster_bytes = params
        .cluster_bytes
        .unwrap_or_else(|| auto_cluster(FatKind::ExFat, size, sector));
    check_cluster_param(cluster_bytes, sector)?;
    let fat_copies = params.fat_copies.unwrap_or(1);
    if fat_copies != 1 {
        return Err(Error::NotSupported("exFAT with mirrored FATs".into()));
    }
    let reserved_sectors = 128u32.max(24);
    let reserved_bytes = reserved_sectors as u64 * sector as u64;

    // Cluster count and FAT length converge like the classic variants.
    let mut clusters = ((size - reserved_bytes) / cluster_bytes as u64) as u64;
    let mut fat_bytes;
    loop {
        fat_bytes = (4 * (clusters + 2)).div_ceil(sector as u64) * sector as u64;
        let required = reserved_bytes + fat_bytes + clusters * cluster_bytes as u64;
        if required <= size {
            break;
        }
        clusters -= (required - size).div_ceil(cluster_bytes as u64);
    }
    if clusters == 0 || clusters > 0xFFFF_FFF6 {
        return Err(Error::BadFormat(format!(
            "{} clusters is outside the exFAT range",
            clusters
        )));
    }
    let clusters = clusters as u32;
    let fat_offset = reserved_bytes;
    let heap_offset_sector = (reserved_bytes + fat_bytes) / sector as u64;

    // System areas at the head of the heap: allocation bitmap, upcase
    // table, root directory.
    let bitmap_bytes = (clusters as u64).div_ceil(8);
    let bitmap_clusters = bitmap_bytes.div_ceil(cluster_bytes as u64) as u32;
    let upcase_raw = UpcaseTable::compressed_ascii();
    let upcase_clusters = (upcase_raw.len() as u64).div_ceil(cluster_bytes as u64) as u32;
    let bitmap_first = 2u32;
    let upcase_first = bitmap_first + bitmap_clusters;
    let root_cluster = upcase_first + upcase_clusters;
    if root_cluster >= clusters + 2 {
        return Err(Error::BadFormat("volume too small for exFAT system areas".into()));
    }

    // Volume boot record.
    let mut vbr = vec![0u8; sector as usize];
    vbr[0] = 0xEB;
    vbr[1] = 0x76;
    vbr[2] = 0x90;
    vbr[3..11].copy_from_slice(b"EXFAT   ");
    vbr[64..72].copy_from_slice(&0u64.to_le_bytes()); // partition offset unknown
    vbr[72..80].copy_from_slice(&(size / sector as u64).to_le_bytes());
    vbr[80..84].copy_from_slice(&((fat_offset / sector as u64) as u32).to_le_bytes());
    vbr[84..88].copy_from_slice(&((fat_bytes / sector as u64) as u32).to_le_bytes());
    vbr[88..92].copy_from_slice(&(heap_offset_sector as u32).to_le_bytes());
    vbr[92..96].copy_from_slice(&clusters.to_le_bytes());
    vbr[96..100].copy_from_slice(&root_cluster.to_le_bytes());
    vbr[100..104].copy_from_slice(&rand::random::<u32>().to_le_bytes());
    vbr[104..106].copy_from_slice(&0x0100u16.to_le_bytes());
    vbr[108] = sector.trailing_zeros() as u8;
    vbr[109] = (cluster_bytes / sector).trailing_zeros() as u8;
    vbr[110] = 1; // FAT copies
    vbr[111] = 0x80;
    vbr[510] = 0x55;
    vbr[511] = 0xAA;

    // Boot region: VBR + 8 extended sectors + OEM + reserved, then the
    // checksum sector; the whole dozen is mirrored at sector 12.
    let mut region = Vec::with_capacity(sector as usize * 11);
    region.extend_from_slice(&vbr);
    let mut empty_signed = vec![0u8; sector as usize];
    empty_signed[510] = 0x55;
    empty_signed[511] = 0xAA;
    for _ in 0..8 {
        region.extend_from_slice(&empty_signed);
    }
    region.extend_from_slice(&vec![0u8; sector as usize * 2]);
    let checksum = exfat_boot_checksum(&region);
    let checksum_sector: Vec<u8> = checksum
        .to_le_bytes()
        .iter()
        .copied()
        .cycle()
        .take(sector as usize)
        .collect();
    disk.write_at(0, &region)?;
    disk.write_at(sector as u64 * 11, &checksum_sector)?;
    disk.write_at(sector as u64 * 12, &region)?;
    disk.write_at(sector as u64 * 23, &checksum_sector)?;

    // FAT: zeroed, then media entries and the system chains.
    zero_region(disk, fat_offset, fat_bytes)?;
    let mut head = Vec::new();
    head.extend_from_slice(&0xFFFF_FFF8u32.to_le_bytes());
    head.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
    disk.write_at(fat_offset, &head)?;
    let mut write_chain = |disk: &mut SectorCache<&mut D>, first: u32, count: u32| -> Result<()> {
        for i in 0..count {
            let cl = first + i;
            let next: u32 = if i + 1 == count { 0xFFFF_FFFF } else { cl + 1 };
            disk.write_at(fat_offset + cl as u64 * 4, &next.to_le_bytes())?;
        }
        Ok(())
    };
    write_chain(disk, bitmap_first, bitmap_clusters)?;
    write_chain(disk, upcase_first, upcase_clusters)?;
    write_chain(disk, root_cluster, 1)?;

    // Cluster heap system areas.
    let heap_offset = heap_offset_sector * sector as u64;
    let cluster_at = |cl: u32| heap_offset + (cl as u64 - 2) * cluster_bytes as u64;
    zero_region(disk, cluster_at(bitmap_first), bitmap_clusters as u64 * cluster_bytes as u64)?;
    let mut bitmap_head = vec![0u8; (bitmap_clusters + upcase_clusters + 1).div_ceil(8) as usize];
    for cl in 2..root_cluster + 1 {
        let index = cl - 2;
        bitmap_head[(index / 8) as usize] |= 1 << (index % 8);
    }
    disk.write_at(cluster_at(bitmap_first), &bitmap_head)?;
    zero_region(disk, cluster_at(upcase_first), upcase_clusters as u64 * cluster_bytes as u64)?;
    disk.write_at(cluster_at(upcase_first), &upcase_raw)?;
    zero_region(disk, cluster_at(root_cluster), cluster_bytes as u64)?;

    // Root directory: bitmap and upcase table entries.
    let mut bitmap_slot = [0u8; 32];
    bitmap_slot[0] = EXFAT_TYPE_BITMAP;
    bitmap_slot[20..24].copy_from_slice(&bitmap_first.to_le_bytes());
    bitmap_slot[24..32].copy_from_slice(&bitmap_bytes.to_le_bytes());
    let mut upcase_slot = [0u8; 32];
    upcase_slot[0] = EXFAT_TYPE_UPCASE;
    upcase_slot[4..8]
        .copy_from_slice(&UpcaseTable::checksum_of(&upcase_raw).to_le_bytes());
    upcase_slot[20..24].copy_from_slice(&upcase_first.to_le_bytes());
    upcase_slot[24..32].copy_from_slice(&(upcase_raw.len() as u64).to_le_bytes());
    disk.write_at(cluster_at(root_cluster), &bitmap_slot)?;
    disk.write_at(cluster_at(root_cluster) + 32, &upcase_slot)?;

    disk.flush()?;
    info!(
        "formatted exFAT: {} clusters of {} bytes, root at cluster {}",
        clusters, cluster_bytes, root_cluster
    );
    let mut sector0 = vec![0u8; sector as usize];
    disk.read_at(0, &mut sector0)?;
    crate::fat::boot_sector::parse_exfat_vbr(&sector0, size)
}

fn zero_region<D: BlockContainer>(disk: &mut D, offset: u64, len: u64) -> Result<()> {
    let chunk = vec![0u8; 1 << 20];
    let mut done = 0u64;
    while done < len {
        let take = ((len - done) as usize).min(chunk.len());
        disk.write_at(offset + done, &chunk[..take])?;
        done += take as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::detect_filesystem;
    use fathom_core::MemContainer;

    #[test]
    fn test_format_fat16_recognized() {
        let mut disk = MemContainer::with_size(64 << 20, 512).unwrap();
        let geo = format_fat(
            &mut disk,
            &FormatParams {
                kind: Some(FatKind::Fat16),
                cluster_bytes: Some(2048),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(geo.kind, FatKind::Fat16);
        assert_eq!(geo.cluster_bytes, 2048);
        let again = detect_filesystem(&mut disk).unwrap();
        assert_eq!(again.kind, FatKind::Fat16);
        assert_eq!(again.cluster_count, geo.cluster_count);
    }

    #[test]
    fn test_format_fat32_recognized() {
        let mut disk = MemContainer::with_size(600 << 20, 512).unwrap();
        let geo = format_fat(&mut disk, &FormatParams::default()).unwrap();
        assert_eq!(geo.kind, FatKind::Fat32);
        assert_eq!(geo.root_cluster, 2);
        assert!(geo.cluster_count >= 65525);
    }

    #[test]
    fn test_format_exfat_checksum_valid() {
        let mut disk = MemContainer::with_size(256 << 20, 512).unwrap();
        let geo = format_exfat(
            &mut disk,
            &FormatParams {
                cluster_bytes: Some(32 << 10),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(geo.kind, FatKind::ExFat);
        crate::fat::boot_sector::check_exfat_boot_region(&mut disk, &geo).unwrap();
    }

    #[test]
    fn test_format_exfat_4k_sectors_256k_clusters() {
        let mut disk = MemContainer::with_size(1 << 30, 4096).unwrap();
        let geo = format_exfat(
            &mut disk,
            &FormatParams {
                cluster_bytes: Some(256 << 10),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(geo.bytes_per_sector, 4096);
        assert_eq!(geo.cluster_bytes, 256 << 10);
    }

    #[test]
    fn test_fat12_rejects_too_many_clusters() {
        let mut disk = MemContainer::with_size(64 << 20, 512).unwrap();
        let res = format_fat(
            &mut disk,
            &FormatParams {
                kind: Some(FatKind::Fat12),
                cluster_bytes: Some(512),
                ..Default::default()
            },
        );
        assert!(res.is_err());
    }
}
