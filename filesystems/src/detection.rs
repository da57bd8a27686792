// Filesystem recognizer: identifies the FAT variant from the first
// sector of a (sub-)container and resolves its geometry.

use log::info;

use fathom_core::{BlockContainer, Result};

use crate::fat::boot_sector::{self, FatGeometry, EXFAT_OEM_ID};
use crate::fat::FatKind;

/// Cheap signature probe over a boot sector; `None` when the sector is
/// not a FAT-family VBR at all.
pub fn probe(sector0: &[u8]) -> Option<FatKind> {
    if sector0.len() < 512 {
        return None;
    }
    if &sector0[3..11] == EXFAT_OEM_ID {
        return Some(FatKind::ExFat);
    }
    // Classic FAT needs the full BPB to disambiguate; report the family
    // when the sector is plausible and let the parser pick the variant.
    if sector0[510] == 0x55
        && sector0[511] == 0xAA
        && (sector0[0] == 0xEB || sector0[0] == 0xE9)
    {
        let bps = u16::from_le_bytes([sector0[11], sector0[12]]);
        if matches!(bps, 512 | 1024 | 2048 | 4096) {
            return Some(FatKind::Fat16); // placeholder variant, refined by parse
        }
    }
    None
}

/// Reads the VBR and resolves the full geometry, rejecting volumes with
/// inconsistent or unsupported layouts.
pub fn detect_filesystem<D: BlockContainer>(disk: &mut D) -> Result<FatGeometry> {
    let ss = disk.sector_size().max(512) as usize;
    let mut sector0 = vec![0u8; ss];
    disk.read_at(0, &mut sector0)?;
    let geo = if &sector0[3..11] == EXFAT_OEM_ID {
        boot_sector::parse_exfat_vbr(&sector0, disk.size())?
    } else {
        boot_sector::parse_bpb(&sector0, disk.size())?
    };
    info!(
        "recognized {} volume: {} clusters of {} bytes",
        geo.kind.name(),
        geo.cluster_count,
        geo.cluster_bytes
    );
    Ok(geo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_exfat_signature() {
        let mut s = vec![0u8; 512];
        s[3..11].copy_from_slice(EXFAT_OEM_ID);
        assert_eq!(probe(&s), Some(FatKind::ExFat));
    }

    #[test]
    fn test_probe_rejects_garbage() {
        let s = vec![0u8; 512];
        assert_eq!(probe(&s), None);
    }
}
