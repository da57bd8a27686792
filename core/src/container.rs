// Byte- and sector-addressed storage abstractions.
//
// `Backend` is the raw byte store an image engine builds on (a file on the
// host, or a memory buffer). `BlockContainer` is the guest-facing view: a
// linear, sector-addressed store with a fixed size. Raw images are
// containers directly; virtual-disk engines translate between the two.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, info};

use crate::error::{checked_range, Error, Result};

/// Sector sizes accepted by the stack.
pub const SECTOR_SIZES: [u32; 2] = [512, 4096];

/// How a container or backend is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

impl OpenMode {
    pub fn writable(self) -> bool {
        self == OpenMode::ReadWrite
    }
}

/// A raw byte store: random-access reads and writes at arbitrary offsets,
/// resizable. Image engines keep their headers, tables and payload blocks
/// here; nothing above this layer assumes alignment.
pub trait Backend {
    fn len(&mut self) -> Result<u64>;
    fn set_len(&mut self, len: u64) -> Result<()>;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// A linear, sector-addressed byte store of known size. Offsets and
/// lengths must be multiples of `sector_size`; the sector cache is the
/// layer that grants byte-level access on top of this.
pub trait BlockContainer {
    fn size(&self) -> u64;
    fn sector_size(&self) -> u32;
    fn is_read_only(&self) -> bool;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

impl<T: BlockContainer + ?Sized> BlockContainer for &mut T {
    fn size(&self) -> u64 {
        (**self).size()
    }
    fn sector_size(&self) -> u32 {
        (**self).sector_size()
    }
    fn is_read_only(&self) -> bool {
        (**self).is_read_only()
    }
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_at(offset, buf)
    }
    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

impl BlockContainer for Box<dyn BlockContainer> {
    fn size(&self) -> u64 {
        (**self).size()
    }
    fn sector_size(&self) -> u32 {
        (**self).sector_size()
    }
    fn is_read_only(&self) -> bool {
        (**self).is_read_only()
    }
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_at(offset, buf)
    }
    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// Rejects I/O that is not sector-aligned.
pub fn check_aligned(offset: u64, len: usize, sector_size: u32) -> Result<()> {
    if offset % sector_size as u64 != 0 || len % sector_size as usize != 0 {
        return Err(Error::Unaligned {
            offset,
            len,
            sector_size,
        });
    }
    Ok(())
}

pub fn check_sector_size(sector_size: u32) -> Result<()> {
    if !SECTOR_SIZES.contains(&sector_size) {
        return Err(Error::BadFormat(format!(
            "unsupported sector size {}",
            sector_size
        )));
    }
    Ok(())
}

// ============================================================================
// File backend
// ============================================================================

/// A host file or block device as a raw byte store.
pub struct FileBackend {
    file: File,
    writable: bool,
}

impl FileBackend {
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(mode.writable())
            .open(path.as_ref())?;
        debug!(
            "opened backend {} ({:?})",
            path.as_ref().display(),
            mode
        );
        Ok(Self {
            file,
            writable: mode.writable(),
        })
    }

    pub fn create<P: AsRef<Path>>(path: P, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file,
            writable: true,
        })
    }
}

impl Backend for FileBackend {
    fn len(&mut self) -> Result<u64> {
        Ok(self.file.seek(SeekFrom::End(0))?)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        self.file.set_len(len)?;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

// ============================================================================
// Memory backend
// ============================================================================

/// A growable in-memory byte store, for ramdisks and tests.
#[derive(Default)]
pub struct MemBackend {
    buf: Vec<u8>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_len(len: usize) -> Self {
        Self { buf: vec![0; len] }
    }

    pub fn from_vec(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl Backend for MemBackend {
    fn len(&mut self) -> Result<u64> {
        Ok(self.buf.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.buf.resize(len as usize, 0);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.buf.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&self.buf[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let end = offset as usize + buf.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Raw containers
// ============================================================================

/// A raw disk image or device: the backend bytes are the guest bytes.
pub struct RawContainer<B> {
    backend: B,
    size: u64,
    sector_size: u32,
    read_only: bool,
}

impl<B: Backend> RawContainer<B> {
    pub fn new(mut backend: B, sector_size: u32, read_only: bool) -> Result<Self> {
        check_sector_size(sector_size)?;
        let size = backend.len()?;
        if size % sector_size as u64 != 0 {
            return Err(Error::BadFormat(format!(
                "container size {} is not a multiple of sector size {}",
                size, sector_size
            )));
        }
        Ok(Self {
            backend,
            size,
            sector_size,
            read_only,
        })
    }

    pub fn create(mut backend: B, size: u64, sector_size: u32) -> Result<Self> {
        check_sector_size(sector_size)?;
        check_aligned(size, 0, sector_size)?;
        backend.set_len(size)?;
        Ok(Self {
            backend,
            size,
            sector_size,
            read_only: false,
        })
    }

    pub fn into_backend(self) -> B {
        self.backend
    }
}

impl RawContainer<FileBackend> {
    /// Opens a raw image file or block device.
    pub fn open_path<P: AsRef<Path>>(path: P, mode: OpenMode, sector_size: u32) -> Result<Self> {
        let backend = FileBackend::open(&path, mode)?;
        let this = Self::new(backend, sector_size, !mode.writable())?;
        info!(
            "opened raw container {} ({} bytes, {} B/sector)",
            path.as_ref().display(),
            this.size,
            sector_size
        );
        Ok(this)
    }

    /// Creates a zero-filled raw image file.
    pub fn create_path<P: AsRef<Path>>(path: P, size: u64, sector_size: u32) -> Result<Self> {
        check_sector_size(sector_size)?;
        check_aligned(size, 0, sector_size)?;
        let backend = FileBackend::create(&path, size)?;
        info!(
            "created raw container {} ({} bytes)",
            path.as_ref().display(),
            size
        );
        Self::new(backend, sector_size, false)
    }
}

impl<B: Backend> BlockContainer for RawContainer<B> {
    fn size(&self) -> u64 {
        self.size
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_aligned(offset, buf.len(), self.sector_size)?;
        checked_range(offset, buf.len(), self.size)?;
        self.backend.read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        check_aligned(offset, buf.len(), self.sector_size)?;
        checked_range(offset, buf.len(), self.size)?;
        self.backend.write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.backend.flush()
    }
}

/// Convenience alias for an in-memory container (ramdisk).
pub type MemContainer = RawContainer<MemBackend>;

impl MemContainer {
    pub fn with_size(size: u64, sector_size: u32) -> Result<Self> {
        Self::create(MemBackend::new(), size, sector_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_container_roundtrip() {
        let mut c = MemContainer::with_size(4096, 512).unwrap();
        let payload = vec![0xA5u8; 512];
        c.write_at(1024, &payload).unwrap();
        let mut got = vec![0u8; 512];
        c.read_at(1024, &mut got).unwrap();
        assert_eq!(got, payload);
    }

    #[test]
    fn test_alignment_enforced() {
        let mut c = MemContainer::with_size(4096, 512).unwrap();
        let mut buf = [0u8; 100];
        assert!(matches!(
            c.read_at(0, &mut buf),
            Err(Error::Unaligned { .. })
        ));
        assert!(matches!(
            c.read_at(100, &mut [0u8; 512]),
            Err(Error::Unaligned { .. })
        ));
    }

    #[test]
    fn test_bounds_enforced() {
        let mut c = MemContainer::with_size(4096, 512).unwrap();
        let buf = [0u8; 512];
        assert!(matches!(
            c.write_at(4096, &buf),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_read_only() {
        let backend = MemBackend::with_len(4096);
        let mut c = RawContainer::new(backend, 512, true).unwrap();
        assert!(matches!(
            c.write_at(0, &[0u8; 512]),
            Err(Error::ReadOnly)
        ));
    }

    #[test]
    fn test_file_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        {
            let mut c = RawContainer::create_path(&path, 8192, 512).unwrap();
            c.write_at(512, &[0x42u8; 512]).unwrap();
            c.flush().unwrap();
        }
        let mut c = RawContainer::open_path(&path, OpenMode::ReadOnly, 512).unwrap();
        let mut buf = [0u8; 512];
        c.read_at(512, &mut buf).unwrap();
        assert_eq!(buf[0], 0x42);
    }

    #[test]
    fn test_bad_sector_size() {
        assert!(MemContainer::with_size(4096, 1024).is_err());
    }
}
