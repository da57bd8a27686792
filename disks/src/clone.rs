// Container-to-container cloning (the `imgclone` operation).

use log::info;

use fathom_core::{BlockContainer, Control, Error, ProgressSink, Result};

const CHUNK: usize = 1 << 20;

/// Copies the full guest byte range of `src` into `dst`. The destination
/// must be at least as large as the source and freshly created (sparse
/// targets keep all-zero chunks unallocated on their own; raw targets
/// are zero-filled at creation).
pub fn clone_container<P: ProgressSink + ?Sized>(
    src: &mut dyn BlockContainer,
    dst: &mut dyn BlockContainer,
    progress: &mut P,
) -> Result<u64> {
    let total = src.size();
    if dst.size() < total {
        return Err(Error::OutOfBounds {
            offset: total,
            len: 0,
            size: dst.size(),
        });
    }
    let step = CHUNK
        .max(src.sector_size() as usize)
        .max(dst.sector_size() as usize);
    let mut buf = vec![0u8; step];
    let mut done = 0u64;
    while done < total {
        let take = ((total - done) as usize).min(step);
        src.read_at(done, &mut buf[..take])?;
        dst.write_at(done, &buf[..take])?;
        done += take as u64;
        if progress.tick(done, total) == Control::Cancel {
            dst.flush()?;
            return Err(Error::Cancelled);
        }
    }
    dst.flush()?;
    info!("cloned {} bytes", done);
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vhd;
    use fathom_core::{MemBackend, MemContainer, NoProgress};

    #[test]
    fn test_raw_to_vhd_to_raw_is_identity() {
        let size = 8u64 << 20;
        let mut original = MemContainer::with_size(size, 512).unwrap();
        original.write_at(512, &[0xA1u8; 512]).unwrap();
        original.write_at(5 << 20, &[0xB2u8; 1024]).unwrap();

        let mut dynamic = vhd::create_dynamic(MemBackend::new(), size, None).unwrap();
        clone_container(&mut original, &mut dynamic, &mut NoProgress).unwrap();

        let mut back = MemContainer::with_size(size, 512).unwrap();
        clone_container(&mut dynamic, &mut back, &mut NoProgress).unwrap();

        let mut a = vec![0u8; size as usize];
        let mut b = vec![0u8; size as usize];
        original.read_at(0, &mut a).unwrap();
        back.read_at(0, &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_cancel_mid_clone() {
        let size = 4u64 << 20;
        let mut src = MemContainer::with_size(size, 512).unwrap();
        let mut dst = MemContainer::with_size(size, 512).unwrap();
        let mut cancel_after_first = |done: u64, _total: u64| {
            if done > 0 {
                Control::Cancel
            } else {
                Control::Continue
            }
        };
        let err = clone_container(&mut src, &mut dst, &mut cancel_after_first).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_too_small_destination_rejected() {
        let mut src = MemContainer::with_size(4 << 20, 512).unwrap();
        let mut dst = MemContainer::with_size(2 << 20, 512).unwrap();
        assert!(clone_container(&mut src, &mut dst, &mut NoProgress).is_err());
    }
}
