// End-to-end container stack tests: image engines under partitions and
// the sector cache, format detection from files, differencing chains.

use fathom_core::{BlockContainer, FileBackend, MemBackend, NoProgress, OpenMode};
use fathom_disks::{
    clone_container, open_image, partition, vhd, SectorCache, PartitionSpec, PartitionView,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_open_image_detects_vhd_file() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.vhd");
    {
        let backend = FileBackend::create(&path, 0).unwrap();
        let mut vhd = vhd::create_dynamic(backend, 16 << 20, None).unwrap();
        vhd.write_at(1 << 20, &[0x66u8; 512]).unwrap();
        vhd.flush().unwrap();
    }
    let mut image = open_image(&path, OpenMode::ReadOnly, 512).unwrap();
    assert_eq!(image.size(), 16 << 20);
    let mut got = [0u8; 512];
    image.read_at(1 << 20, &mut got).unwrap();
    assert_eq!(got, [0x66u8; 512]);
}

#[test]
fn test_partitioned_vhd_behind_cache() {
    init_logging();
    let mut disk = vhd::create_dynamic(MemBackend::new(), 64 << 20, None).unwrap();
    partition::create_mbr(&mut disk, &[PartitionSpec::whole_disk(0x0C)]).unwrap();
    let view = PartitionView::open(disk, 0).unwrap();
    let mut cache = SectorCache::new(view);
    // Byte-granular writes through the whole stack.
    cache.write_at(100, b"through the stack").unwrap();
    cache.flush().unwrap();
    let mut got = vec![0u8; 17];
    cache.read_at(100, &mut got).unwrap();
    assert_eq!(&got, b"through the stack");
}

#[test]
fn test_differencing_chain_of_two() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("base.vhd");
    let mid = dir.path().join("mid.vhd");
    let top = dir.path().join("top.vhd");
    {
        let backend = FileBackend::create(&base, 0).unwrap();
        let mut disk = vhd::create_dynamic(backend, 8 << 20, None).unwrap();
        disk.write_at(0, &[1u8; 512]).unwrap();
        disk.write_at(1 << 20, &[2u8; 512]).unwrap();
        disk.flush().unwrap();
    }
    {
        let mut disk = vhd::create_diff(&mid, &base).unwrap();
        disk.write_at(1 << 20, &[3u8; 512]).unwrap();
        disk.flush().unwrap();
    }
    let mut disk = vhd::create_diff(&top, &mid).unwrap();
    let mut got = [0u8; 512];
    // Base data through two levels.
    disk.read_at(0, &mut got).unwrap();
    assert_eq!(got, [1u8; 512]);
    // Middle layer overrides the base.
    disk.read_at(1 << 20, &mut got).unwrap();
    assert_eq!(got, [3u8; 512]);
}

#[test]
fn test_raw_to_dynamic_vhd_file_conversion_roundtrip() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let raw_path = dir.path().join("plain.img");
    let vhd_path = dir.path().join("converted.vhd");
    let size = 8u64 << 20;
    {
        let mut raw =
            fathom_core::RawContainer::create_path(&raw_path, size, 512).unwrap();
        raw.write_at(4096, &[0xDDu8; 4096]).unwrap();
        raw.write_at(size - 512, &[0xEEu8; 512]).unwrap();
        raw.flush().unwrap();
    }
    {
        let mut raw =
            fathom_core::RawContainer::open_path(&raw_path, OpenMode::ReadOnly, 512).unwrap();
        let backend = FileBackend::create(&vhd_path, 0).unwrap();
        let mut vhd = vhd::create_dynamic(backend, size, None).unwrap();
        clone_container(&mut raw, &mut vhd, &mut NoProgress).unwrap();
    }
    let mut vhd = open_image(&vhd_path, OpenMode::ReadOnly, 512).unwrap();
    let mut raw =
        fathom_core::RawContainer::open_path(&raw_path, OpenMode::ReadOnly, 512).unwrap();
    let mut a = vec![0u8; size as usize];
    let mut b = vec![0u8; size as usize];
    raw.read_at(0, &mut a).unwrap();
    vhd.read_at(0, &mut b).unwrap();
    assert_eq!(a, b);
}
