// Disk image format detection and the one-call opener.

use std::path::Path;

use log::info;

use fathom_core::{
    Backend, BlockContainer, FileBackend, OpenMode, RawContainer, Result,
};

use crate::{VdiDisk, VhdDisk, VhdxDisk, VmdkDisk};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Raw,
    Vhd,
    Vhdx,
    Vdi,
    Vmdk,
}

/// Probes magic values; unknown images fall back to raw.
pub fn detect_image_format<B: Backend>(backend: &mut B) -> Result<ImageFormat> {
    let len = backend.len()?;

    if len >= 8 {
        let mut magic = [0u8; 8];
        backend.read_at(0, &mut magic)?;
        if &magic == b"vhdxfile" {
            return Ok(ImageFormat::Vhdx);
        }
        if &magic[0..4] == b"KDMV" {
            return Ok(ImageFormat::Vmdk);
        }
    }

    if len >= 0x44 {
        let mut sig = [0u8; 4];
        backend.read_at(0x40, &mut sig)?;
        if u32::from_le_bytes(sig) == 0xBEDA_107F {
            return Ok(ImageFormat::Vdi);
        }
    }

    // Fixed VHDs only carry the trailing footer; sparse ones also start
    // with a footer copy. Check both spots.
    if len >= 512 {
        let mut cookie = [0u8; 8];
        backend.read_at(len - 512, &mut cookie)?;
        if &cookie == b"conectix" {
            return Ok(ImageFormat::Vhd);
        }
        backend.read_at(0, &mut cookie)?;
        if &cookie == b"conectix" {
            return Ok(ImageFormat::Vhd);
        }
    }

    Ok(ImageFormat::Raw)
}

/// Opens a disk image file of any supported format as a container.
/// `sector_size` applies to raw images only; the sparse formats carry
/// their own geometry.
pub fn open_image<P: AsRef<Path>>(
    path: P,
    mode: OpenMode,
    sector_size: u32,
) -> Result<Box<dyn BlockContainer>> {
    let path = path.as_ref();
    let format = {
        let mut probe = FileBackend::open(path, OpenMode::ReadOnly)?;
        detect_image_format(&mut probe)?
    };
    info!("detected {:?} image at {}", format, path.display());
    Ok(match format {
        ImageFormat::Raw => Box::new(RawContainer::open_path(path, mode, sector_size)?),
        ImageFormat::Vhd => Box::new(VhdDisk::open(path, mode)?),
        ImageFormat::Vhdx => Box::new(VhdxDisk::open(path, mode)?),
        ImageFormat::Vdi => Box::new(VdiDisk::open_backend(FileBackend::open(path, mode)?, mode)?),
        ImageFormat::Vmdk => Box::new(VmdkDisk::open_backend(FileBackend::open(path, mode)?, mode)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fathom_core::MemBackend;

    #[test]
    fn test_detects_each_format() {
        let vhd = crate::vhd::create_fixed(MemBackend::new(), 1 << 20).unwrap();
        let mut b = vhd.into_backend();
        assert_eq!(detect_image_format(&mut b).unwrap(), ImageFormat::Vhd);

        let vhdx =
            crate::vhdx::create_dynamic(MemBackend::new(), 16 << 20, Some(1 << 20), 512).unwrap();
        let mut b = vhdx.into_backend();
        assert_eq!(detect_image_format(&mut b).unwrap(), ImageFormat::Vhdx);

        let vdi = crate::vdi::create_dynamic(MemBackend::new(), 16 << 20, None).unwrap();
        let mut b = vdi.into_backend();
        assert_eq!(detect_image_format(&mut b).unwrap(), ImageFormat::Vdi);

        let vmdk = crate::vmdk::create_dynamic(MemBackend::new(), 16 << 20, None).unwrap();
        let mut b = vmdk.into_backend();
        assert_eq!(detect_image_format(&mut b).unwrap(), ImageFormat::Vmdk);

        let mut plain = MemBackend::with_len(1 << 20);
        assert_eq!(detect_image_format(&mut plain).unwrap(), ImageFormat::Raw);
    }
}
