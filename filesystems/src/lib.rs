// FAT family filesystems: FAT12, FAT16, FAT32, and exFAT.

pub mod detection;
pub mod fat;
pub mod mkfs;
pub mod volume;

pub use detection::detect_filesystem;
pub use fat::boot_sector::FatGeometry;
pub use fat::FatKind;
pub use mkfs::{format_exfat, format_fat, FormatParams};
pub use volume::{
    DirEntryInfo, FileMode, FragmentationReport, MountOptions, Volume, VolumeInfo,
};
