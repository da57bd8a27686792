// Boot sector / VBR parsing for the FAT family.
//
// FAT12/16/32 share the first 36 BPB bytes; the extended BPB differs.
// exFAT has its own VBR with shift-encoded geometry and a rotate-add
// checksum over the first 11 boot sectors.

use fathom_core::{BlockContainer, Error, Result};

use super::{FatKind, FIRST_DATA_CLUSTER, MAX_CLUSTER_BYTES};

pub const EXFAT_OEM_ID: &[u8; 8] = b"EXFAT   ";
pub const BOOT_SIGNATURE: u16 = 0xAA55;

// Cluster-count thresholds separating the classic FAT variants.
pub const FAT12_MAX_CLUSTERS: u32 = 4085;
pub const FAT16_MAX_CLUSTERS: u32 = 65525;

/// Common BPB, identical for FAT12/16/32 (first 36 bytes).
#[repr(C, packed(1))]
#[derive(Debug, Clone, Copy)]
pub struct CommonBpb {
    pub jump_boot: [u8; 3],
    pub oem_name: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub root_entries: u16,
    pub total_sectors_16: u16,
    pub media_descriptor: u8,
    pub sectors_per_fat_16: u16,
    pub sectors_per_track: u16,
    pub num_heads: u16,
    pub hidden_sectors: u32,
    pub total_sectors_32: u32,
}

/// FAT32 extension (offsets 0x24..0x5A).
#[repr(C, packed(1))]
#[derive(Debug, Clone, Copy)]
pub struct Fat32Ext {
    pub sectors_per_fat_32: u32,
    pub ext_flags: u16,
    pub fs_version: u16,
    pub root_cluster: u32,
    pub fs_info: u16,
    pub backup_boot_sector: u16,
    pub reserved: [u8; 12],
    pub drive_number: u8,
    pub reserved1: u8,
    pub boot_signature: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub fs_type: [u8; 8],
}

/// exFAT VBR (fixed 512-byte layout regardless of sector size).
#[repr(C, packed(1))]
#[derive(Debug, Clone, Copy)]
pub struct ExFatVbr {
    pub jump_boot: [u8; 3],
    pub fs_name: [u8; 8],
    pub must_be_zero: [u8; 53],
    pub partition_offset: u64,
    pub volume_length: u64,
    pub fat_offset: u32,
    pub fat_length: u32,
    pub cluster_heap_offset: u32,
    pub cluster_count: u32,
    pub first_cluster_of_root: u32,
    pub volume_serial: u32,
    pub fs_revision: u16,
    pub volume_flags: u16,
    pub bytes_per_sector_shift: u8,
    pub sectors_per_cluster_shift: u8,
    pub number_of_fats: u8,
    pub drive_select: u8,
    pub percent_in_use: u8,
}

/// Resolved volume geometry, one variant record for all four kinds.
#[derive(Debug, Clone)]
pub struct FatGeometry {
    pub kind: FatKind,
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub cluster_bytes: u32,
    pub reserved_sectors: u32,
    pub num_fats: u32,
    pub fat_size_sectors: u32,
    pub total_sectors: u64,
    /// Fixed root slots (FAT12/16); 0 otherwise.
    pub root_entries: u32,
    /// Root directory cluster (FAT32/exFAT); 0 otherwise.
    pub root_cluster: u32,
    pub cluster_count: u32,
    pub fat_offset: u64,
    pub root_dir_offset: u64,
    pub root_dir_bytes: u32,
    pub data_offset: u64,
    /// FAT32 only.
    pub fs_info_sector: u32,
    pub backup_boot_sector: u32,
    /// exFAT only.
    pub volume_flags: u16,
    pub volume_serial: u32,
}

impl FatGeometry {
    /// Byte offset of a data cluster.
    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_offset + (cluster - FIRST_DATA_CLUSTER) as u64 * self.cluster_bytes as u64
    }

    /// Byte offset of FAT copy `copy`.
    pub fn fat_copy_offset(&self, copy: u32) -> u64 {
        self.fat_offset + copy as u64 * self.fat_size_sectors as u64 * self.bytes_per_sector as u64
    }

    /// Highest valid data cluster number.
    pub fn max_cluster(&self) -> u32 {
        self.cluster_count + FIRST_DATA_CLUSTER - 1
    }

    pub fn is_valid_cluster(&self, cluster: u32) -> bool {
        (FIRST_DATA_CLUSTER..=self.max_cluster()).contains(&cluster)
    }
}

fn check_geometry_common(bytes_per_sector: u32, sectors_per_cluster: u32) -> Result<()> {
    if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
        return Err(Error::BadFormat(format!(
            "implausible bytes/sector {}",
            bytes_per_sector
        )));
    }
    if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
        return Err(Error::BadFormat(
            "sectors per cluster must be a power of two".into(),
        ));
    }
    let cluster_bytes = bytes_per_sector * sectors_per_cluster;
    if cluster_bytes > MAX_CLUSTER_BYTES {
        return Err(Error::BadFormat(format!(
            "cluster size {} exceeds {} bytes",
            cluster_bytes, MAX_CLUSTER_BYTES
        )));
    }
    Ok(())
}

/// Parses a classic FAT BPB, deciding FAT12/16/32 from the cluster count.
pub fn parse_bpb(sector: &[u8], container_size: u64) -> Result<FatGeometry> {
    if sector.len() < 512 {
        return Err(Error::BadFormat("boot sector too short".into()));
    }
    if u16::from_le_bytes([sector[510], sector[511]]) != BOOT_SIGNATURE {
        return Err(Error::BadFormat("missing boot signature 0xAA55".into()));
    }
    let bpb = unsafe { std::ptr::read_unaligned(sector.as_ptr() as *const CommonBpb) };
    if bpb.jump_boot[0] != 0xEB && bpb.jump_boot[0] != 0xE9 {
        return Err(Error::BadFormat("missing x86 jump in boot sector".into()));
    }
    let bytes_per_sector = bpb.bytes_per_sector as u32;
    let sectors_per_cluster = bpb.sectors_per_cluster as u32;
    check_geometry_common(bytes_per_sector, sectors_per_cluster)?;
    if bpb.reserved_sectors == 0 || bpb.num_fats == 0 {
        return Err(Error::BadFormat("zero reserved sectors or FAT count".into()));
    }

    let total_sectors = if bpb.total_sectors_16 != 0 {
        bpb.total_sectors_16 as u64
    } else {
        bpb.total_sectors_32 as u64
    };
    if total_sectors == 0 || total_sectors * bytes_per_sector as u64 > container_size {
        return Err(Error::BadFormat(
            "total sector count missing or beyond the container".into(),
        ));
    }

    let fat32 = bpb.sectors_per_fat_16 == 0;
    let fat_size_sectors = if fat32 {
        let ext = unsafe {
            std::ptr::read_unaligned(sector[36..].as_ptr() as *const Fat32Ext)
        };
        ext.sectors_per_fat_32
    } else {
        bpb.sectors_per_fat_16 as u32
    };
    if fat_size_sectors == 0 {
        return Err(Error::BadFormat("zero FAT size".into()));
    }

    let root_entries = bpb.root_entries as u32;
    let root_dir_sectors =
        (root_entries * 32).div_ceil(bytes_per_sector);
    let reserved = bpb.reserved_sectors as u32;
    let num_fats = bpb.num_fats as u32;
    let first_data_sector = reserved + num_fats * fat_size_sectors + root_dir_sectors;
    if first_data_sector as u64 >= total_sectors {
        return Err(Error::BadFormat("no room left for a data region".into()));
    }
    let data_sectors = total_sectors - first_data_sector as u64;
    let cluster_count = (data_sectors / sectors_per_cluster as u64) as u32;

    let kind = if fat32 {
        if cluster_count < FAT16_MAX_CLUSTERS {
            return Err(Error::BadFormat(
                "FAT32 BPB with a FAT12/16-sized cluster count".into(),
            ));
        }
        FatKind::Fat32
    } else if cluster_count < FAT12_MAX_CLUSTERS {
        FatKind::Fat12
    } else if cluster_count < FAT16_MAX_CLUSTERS {
        FatKind::Fat16
    } else {
        return Err(Error::BadFormat(
            "16-bit FAT BPB with a FAT32-sized cluster count".into(),
        ));
    };

    if kind != FatKind::Fat32 && root_entries == 0 {
        return Err(Error::BadFormat("FAT12/16 requires a fixed root directory".into()));
    }
    if (root_entries * 32) % bytes_per_sector != 0 {
        return Err(Error::BadFormat(
            "root directory must fill whole sectors".into(),
        ));
    }

    let (root_cluster, fs_info_sector, backup_boot_sector) = if fat32 {
        let ext = unsafe {
            std::ptr::read_unaligned(sector[36..].as_ptr() as *const Fat32Ext)
        };
        (ext.root_cluster, ext.fs_info as u32, ext.backup_boot_sector as u32)
    } else {
        (0, 0, 0)
    };

    let bps = bytes_per_sector as u64;
    Ok(FatGeometry {
        kind,
        bytes_per_sector,
        sectors_per_cluster,
        cluster_bytes: bytes_per_sector * sectors_per_cluster,
        reserved_sectors: reserved,
        num_fats,
        fat_size_sectors,
        total_sectors,
        root_entries: if fat32 { 0 } else { root_entries },
        root_cluster,
        cluster_count,
        fat_offset: reserved as u64 * bps,
        root_dir_offset: (reserved + num_fats * fat_size_sectors) as u64 * bps,
        root_dir_bytes: root_dir_sectors * bytes_per_sector,
        data_offset: first_data_sector as u64 * bps,
        fs_info_sector,
        backup_boot_sector,
        volume_flags: 0,
        volume_serial: if fat32 {
            let ext = unsafe {
                std::ptr::read_unaligned(sector[36..].as_ptr() as *const Fat32Ext)
            };
            ext.volume_id
        } else if sector[38] == 0x29 {
            u32::from_le_bytes(sector[39..43].try_into().unwrap())
        } else {
            0
        },
    })
}

/// Parses an exFAT VBR.
pub fn parse_exfat_vbr(sector: &[u8], container_size: u64) -> Result<FatGeometry> {
    if sector.len() < 512 {
        return Err(Error::BadFormat("boot sector too short".into()));
    }
    let vbr = unsafe { std::ptr::read_unaligned(sector.as_ptr() as *const ExFatVbr) };
    if vbr.fs_name != *EXFAT_OEM_ID {
        return Err(Error::BadFormat("exFAT signature missing".into()));
    }
    if u16::from_le_bytes([sector[510], sector[511]]) != BOOT_SIGNATURE {
        return Err(Error::BadFormat("missing boot signature 0xAA55".into()));
    }
    if vbr.must_be_zero.iter().any(|&b| b != 0) {
        return Err(Error::BadFormat("exFAT MustBeZero region is not zero".into()));
    }
    let bytes_per_sector = 1u32
        .checked_shl(vbr.bytes_per_sector_shift as u32)
        .ok_or_else(|| Error::BadFormat("absurd exFAT sector shift".into()))?;
    let sectors_per_cluster = 1u32
        .checked_shl(vbr.sectors_per_cluster_shift as u32)
        .ok_or_else(|| Error::BadFormat("absurd exFAT cluster shift".into()))?;
    check_geometry_common(bytes_per_sector, sectors_per_cluster)?;
    if vbr.number_of_fats == 0 || vbr.number_of_fats > 2 {
        return Err(Error::BadFormat("exFAT FAT count must be 1 or 2".into()));
    }
    let bps = bytes_per_sector as u64;
    if vbr.volume_length * bps > container_size {
        return Err(Error::BadFormat("exFAT volume length beyond the container".into()));
    }
    if vbr.cluster_count == 0 {
        return Err(Error::BadFormat("exFAT with zero clusters".into()));
    }

    Ok(FatGeometry {
        kind: FatKind::ExFat,
        bytes_per_sector,
        sectors_per_cluster,
        cluster_bytes: bytes_per_sector * sectors_per_cluster,
        reserved_sectors: vbr.fat_offset,
        num_fats: vbr.number_of_fats as u32,
        fat_size_sectors: vbr.fat_length,
        total_sectors: vbr.volume_length,
        root_entries: 0,
        root_cluster: vbr.first_cluster_of_root,
        cluster_count: vbr.cluster_count,
        fat_offset: vbr.fat_offset as u64 * bps,
        root_dir_offset: 0,
        root_dir_bytes: 0,
        data_offset: vbr.cluster_heap_offset as u64 * bps,
        fs_info_sector: 0,
        backup_boot_sector: 0,
        volume_flags: vbr.volume_flags,
        volume_serial: vbr.volume_serial,
    })
}

/// Rotate-right-add checksum over the exFAT boot region (sectors 0-10).
/// Bytes 106, 107 and 112 (VolumeFlags and PercentInUse) are excluded.
pub fn exfat_boot_checksum(region: &[u8]) -> u32 {
    let mut hash = 0u32;
    for (i, &b) in region.iter().enumerate() {
        if matches!(i, 106 | 107 | 112) {
            continue;
        }
        hash = (hash << 31 | hash >> 1).wrapping_add(b as u32);
    }
    hash
}

/// Same rotation, no excluded bytes: used for the upcase table checksum.
pub fn exfat_table_checksum(data: &[u8]) -> u32 {
    let mut hash = 0u32;
    for &b in data {
        hash = (hash << 31 | hash >> 1).wrapping_add(b as u32);
    }
    hash
}

/// Validates the boot-region checksum of a mounted exFAT volume.
pub fn check_exfat_boot_region<C: BlockContainer>(disk: &mut C, geo: &FatGeometry) -> Result<()> {
    let bps = geo.bytes_per_sector as usize;
    let mut region = vec![0u8; bps * 11];
    disk.read_at(0, &mut region)?;
    let mut checksum_sector = vec![0u8; bps];
    disk.read_at(bps as u64 * 11, &mut checksum_sector)?;
    let stored = u32::from_le_bytes(checksum_sector[0..4].try_into().unwrap());
    let calc = exfat_boot_checksum(&region);
    if stored != calc {
        return Err(Error::BadFormat(format!(
            "exFAT boot region checksum mismatch (stored {:#x}, calculated {:#x})",
            stored, calc
        )));
    }
    Ok(())
}

/// FAT32 FSInfo sector accessors (advisory free-count hints).
pub const FSINFO_LEAD_SIG: u32 = 0x41615252;
pub const FSINFO_STRUC_SIG: u32 = 0x61417272;
pub const FSINFO_TRAIL_SIG: u32 = 0xAA550000;

pub fn build_fsinfo(free_count: u32, next_free: u32, bytes_per_sector: u32) -> Vec<u8> {
    let mut s = vec![0u8; bytes_per_sector as usize];
    s[0..4].copy_from_slice(&FSINFO_LEAD_SIG.to_le_bytes());
    s[484..488].copy_from_slice(&FSINFO_STRUC_SIG.to_le_bytes());
    s[488..492].copy_from_slice(&free_count.to_le_bytes());
    s[492..496].copy_from_slice(&next_free.to_le_bytes());
    s[508..512].copy_from_slice(&FSINFO_TRAIL_SIG.to_le_bytes());
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_fat16_sector(total_sectors: u32, spc: u8) -> Vec<u8> {
        let mut s = vec![0u8; 512];
        s[0] = 0xEB;
        s[1] = 0x3C;
        s[2] = 0x90;
        s[3..11].copy_from_slice(b"MSDOS5.0");
        s[11..13].copy_from_slice(&512u16.to_le_bytes());
        s[13] = spc;
        s[14..16].copy_from_slice(&1u16.to_le_bytes()); // reserved
        s[16] = 2; // num fats
        s[17..19].copy_from_slice(&512u16.to_le_bytes()); // root entries
        if total_sectors <= 0xFFFF {
            s[19..21].copy_from_slice(&(total_sectors as u16).to_le_bytes());
        } else {
            s[32..36].copy_from_slice(&total_sectors.to_le_bytes());
        }
        s[21] = 0xF8;
        s[22..24].copy_from_slice(&64u16.to_le_bytes()); // sectors per fat
        s[510] = 0x55;
        s[511] = 0xAA;
        s
    }

    #[test]
    fn test_fat16_parse() {
        let s = minimal_fat16_sector(65000, 4);
        let geo = parse_bpb(&s, 65000 * 512).unwrap();
        assert_eq!(geo.kind, FatKind::Fat16);
        assert_eq!(geo.cluster_bytes, 2048);
        assert_eq!(geo.fat_offset, 512);
        assert_eq!(geo.root_dir_offset, (1 + 2 * 64) as u64 * 512);
    }

    #[test]
    fn test_small_volume_is_fat12() {
        let s = minimal_fat16_sector(4096, 1);
        let geo = parse_bpb(&s, 4096 * 512).unwrap();
        assert_eq!(geo.kind, FatKind::Fat12);
    }

    #[test]
    fn test_non_power_of_two_cluster_rejected() {
        let mut s = minimal_fat16_sector(65000, 3);
        s[13] = 3;
        assert!(parse_bpb(&s, 65000 * 512).is_err());
    }

    #[test]
    fn test_missing_signature_rejected() {
        let mut s = minimal_fat16_sector(65000, 4);
        s[510] = 0;
        assert!(parse_bpb(&s, 65000 * 512).is_err());
    }

    #[test]
    fn test_boot_checksum_skips_volatile_bytes() {
        let mut region = vec![0u8; 512 * 11];
        region[0] = 0xEB;
        let base = exfat_boot_checksum(&region);
        region[106] = 0xFF; // volume flags low byte
        region[112] = 0x55; // percent in use
        assert_eq!(base, exfat_boot_checksum(&region));
        region[200] = 1;
        assert_ne!(base, exfat_boot_checksum(&region));
    }
}
