// Shared abstractions for the fathom FAT/exFAT toolkit.

pub mod container;
pub mod error;
pub mod progress;

pub use container::{
    check_aligned, check_sector_size, Backend, BlockContainer, FileBackend, MemBackend,
    MemContainer, OpenMode, RawContainer, SECTOR_SIZES,
};
pub use error::{checked_range, Error, Result};
pub use progress::{Control, NoProgress, ProgressSink};
