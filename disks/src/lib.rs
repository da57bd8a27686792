// Container-level plumbing: the write-back sector cache, MBR/GPT
// partition tables, and the sparse virtual-disk image engines.

pub mod cache;
pub mod clone;
pub mod detect;
pub mod partition;
pub mod vdi;
pub mod vhd;
pub mod vhdx;
pub mod vmdk;

pub use cache::SectorCache;
pub use clone::clone_container;
pub use detect::{detect_image_format, open_image, ImageFormat};
pub use partition::{
    PartitionEntry, PartitionScheme, PartitionSpec, PartitionTable, PartitionView,
};
pub use vdi::VdiDisk;
pub use vhd::VhdDisk;
pub use vhdx::VhdxDisk;
pub use vmdk::VmdkDisk;
