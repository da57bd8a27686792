use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad format: {0}")]
    BadFormat(String),

    #[error("inconsistent filesystem: {0}")]
    InconsistentFs(String),

    #[error("no space: requested {requested} clusters, {available} free")]
    NoSpace { requested: u32, available: u32 },

    #[error("directory is full")]
    DirFull,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("container is read-only")]
    ReadOnly,

    #[error("operation cancelled")]
    Cancelled,

    #[error("unaligned access: offset={offset} len={len} (sector size {sector_size})")]
    Unaligned {
        offset: u64,
        len: usize,
        sector_size: u32,
    },

    #[error("out of bounds: offset={offset} len={len} size={size}")]
    OutOfBounds { offset: u64, len: usize, size: u64 },

    #[error("not supported: {0}")]
    NotSupported(String),
}

impl Error {
    /// True for structural errors a caller may downgrade to a read-only mount.
    pub fn is_recoverable_at_mount(&self) -> bool {
        matches!(self, Error::InconsistentFs(_))
    }
}

/// Bounds check shared by every container implementation.
pub fn checked_range(offset: u64, len: usize, size: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(Error::OutOfBounds { offset, len, size })?;
    if end > size {
        return Err(Error::OutOfBounds { offset, len, size });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_range() {
        assert!(checked_range(0, 512, 512).is_ok());
        assert!(checked_range(512, 1, 512).is_err());
        assert!(checked_range(u64::MAX, 2, u64::MAX).is_err());
    }

    #[test]
    fn test_recoverable() {
        assert!(Error::InconsistentFs("FAT mirrors differ".into()).is_recoverable_at_mount());
        assert!(!Error::ReadOnly.is_recoverable_at_mount());
    }
}
