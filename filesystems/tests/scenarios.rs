// End-to-end scenarios over the full stack: containers, images,
// partitions, and mounted volumes.

use fathom_core::{BlockContainer, FileBackend, MemContainer, OpenMode, RawContainer};
use fathom_disks::{partition, vhd, vhdx, PartitionSpec, PartitionView};
use fathom_filesystems::{
    format_exfat, format_fat, FatKind, FileMode, FormatParams, Volume,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fat16_params() -> FormatParams {
    FormatParams {
        kind: Some(FatKind::Fat16),
        cluster_bytes: Some(2048),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------
// S1: raw image, FAT16, write/close/reopen/read
// ---------------------------------------------------------------------

#[test]
fn test_s1_fat16_write_then_reopen_read_only() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s1.img");
    {
        let mut raw = RawContainer::create_path(&path, 64 << 20, 512).unwrap();
        format_fat(&mut raw, &fat16_params()).unwrap();
        let mut vol = Volume::mount(Box::new(raw)).unwrap();
        let mut file = vol.create("/a.txt").unwrap();
        file.write(b"hello\n").unwrap();
        file.close().unwrap();
        vol.close().unwrap();
    }
    let raw = RawContainer::open_path(&path, OpenMode::ReadOnly, 512).unwrap();
    let mut vol = Volume::mount(Box::new(raw)).unwrap();
    assert!(vol.is_read_only());
    let listing = vol.ls("/").unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, "a.txt");
    assert_eq!(listing[0].size, 6);
    assert_eq!(vol.read_file("/a.txt").unwrap(), b"hello\n");
}

// ---------------------------------------------------------------------
// S2: dynamic VHDX with 4 KiB sectors, GPT, exFAT, sort order
// ---------------------------------------------------------------------

#[test]
fn test_s2_vhdx_gpt_exfat_sort_order() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s2.vhdx");
    let backend = FileBackend::create(&path, 0).unwrap();
    let mut image = vhdx::create_dynamic(backend, 1 << 30, Some(1 << 20), 4096).unwrap();
    assert_eq!(image.sector_size(), 4096);
    partition::create_gpt(&mut image, &[PartitionSpec::whole_disk(0x07)]).unwrap();
    let mut part = PartitionView::open(image, 0).unwrap();
    format_exfat(
        &mut part,
        &FormatParams {
            cluster_bytes: Some(128 << 10),
            ..Default::default()
        },
    )
    .unwrap();
    let mut vol = Volume::mount(Box::new(part)).unwrap();
    assert_eq!(vol.geometry().kind, FatKind::ExFat);
    assert_eq!(vol.geometry().cluster_bytes, 128 << 10);
    for name in ["a.txt", "b.txt", "c.txt", "d.txt"] {
        let f = vol.create(&format!("/{}", name)).unwrap();
        f.close().unwrap();
    }
    vol.sort("/").unwrap();
    let names: Vec<String> = vol.ls("/").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["a.txt", "b.txt", "c.txt", "d.txt"]);
    // Sort is idempotent.
    vol.sort("/").unwrap();
    let again: Vec<String> = vol.ls("/").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(again, names);
}

// ---------------------------------------------------------------------
// S4: VHD differencing chain over a FAT16 volume, then merge
// ---------------------------------------------------------------------

#[test]
fn test_s4_vhd_differencing_write_and_merge() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let parent_path = dir.path().join("base.vhd");
    let child_path = dir.path().join("delta.vhd");
    {
        let backend = FileBackend::create(&parent_path, 0).unwrap();
        let mut image = vhd::create_dynamic(backend, 64 << 20, None).unwrap();
        format_fat(&mut image, &fat16_params()).unwrap();
        let mut vol = Volume::mount(Box::new(image)).unwrap();
        vol.write_file("/x.txt", b"A").unwrap();
        vol.close().unwrap();
    }
    {
        let child = vhd::create_diff(&child_path, &parent_path).unwrap();
        let mut vol = Volume::mount(Box::new(child)).unwrap();
        vol.write_file("/x.txt", b"B").unwrap();
        assert_eq!(vol.read_file("/x.txt").unwrap(), b"B");
        vol.close().unwrap();
    }
    {
        // The parent is untouched by child writes.
        let parent = vhd::VhdDisk::open(&parent_path, OpenMode::ReadOnly).unwrap();
        let mut vol = Volume::mount(Box::new(parent)).unwrap();
        assert_eq!(vol.read_file("/x.txt").unwrap(), b"A");
    }
    let child = vhd::VhdDisk::open(&child_path, OpenMode::ReadWrite).unwrap();
    child.merge_into_parent().unwrap();
    let parent = vhd::VhdDisk::open(&parent_path, OpenMode::ReadOnly).unwrap();
    let mut vol = Volume::mount(Box::new(parent)).unwrap();
    assert_eq!(vol.read_file("/x.txt").unwrap(), b"B");
    assert!(vhd::VhdDisk::open(&child_path, OpenMode::ReadOnly).is_err());
}

// ---------------------------------------------------------------------
// S5: LFN group layout for a long name
// ---------------------------------------------------------------------

#[test]
fn test_s5_lfn_group_layout_on_disk() {
    init_logging();
    let mut raw = MemContainer::with_size(64 << 20, 512).unwrap();
    let geo = format_fat(&mut raw, &fat16_params()).unwrap();
    let root_offset = geo.root_dir_offset;
    let mut vol = Volume::mount(Box::new(raw)).unwrap();
    let f = vol.create("/long file name with spaces.dat").unwrap();
    f.close().unwrap();
    vol.flush().unwrap();

    // Inspect the raw root region: three LFN slots then the 8.3 entry.
    let mut region = vec![0u8; 512];
    vol.read_raw(root_offset, &mut region).unwrap();
    let slots: Vec<&[u8]> = region.chunks(32).collect();
    assert_eq!(slots[0][11], 0x0F);
    assert_eq!(slots[0][0], 0x40 | 3);
    assert_eq!(slots[1][0], 2);
    assert_eq!(slots[2][0], 1);
    let short = slots[3];
    assert_eq!(&short[0..11], b"LONGFI~1DAT");
    // Every LFN slot repeats the 8.3 checksum.
    let mut sum = 0u8;
    for &b in &short[0..11] {
        sum = (sum >> 1 | sum << 7).wrapping_add(b);
    }
    assert!(slots[..3].iter().all(|s| s[13] == sum));
}

// ---------------------------------------------------------------------
// S6: wipe zeroes free clusters and leaves allocations alone
// ---------------------------------------------------------------------

#[test]
fn test_s6_wipe_free_clusters() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s6.img");
    let geo;
    {
        let mut raw = RawContainer::create_path(&path, 16 << 20, 512).unwrap();
        geo = format_fat(&mut raw, &fat16_params()).unwrap();
        // Strew garbage across the data region before mounting.
        let garbage = vec![0xDDu8; geo.cluster_bytes as usize];
        for cluster in 2..200u32 {
            raw.write_at(geo.cluster_offset(cluster), &garbage).unwrap();
        }
        raw.flush().unwrap();
    }
    {
        let raw = RawContainer::open_path(&path, OpenMode::ReadWrite, 512).unwrap();
        let mut vol = Volume::mount(Box::new(raw)).unwrap();
        vol.write_file("/keep.bin", &vec![0xAAu8; 3 * geo.cluster_bytes as usize])
            .unwrap();
        vol.wipe_all().unwrap();
        // Allocated data survives.
        assert_eq!(
            vol.read_file("/keep.bin").unwrap(),
            vec![0xAAu8; 3 * geo.cluster_bytes as usize]
        );
        vol.close().unwrap();
    }
    // Every free cluster's data region is zero now.
    let raw = RawContainer::open_path(&path, OpenMode::ReadOnly, 512).unwrap();
    let mut vol = Volume::mount(Box::new(raw)).unwrap();
    let keep = vol.ls("/").unwrap();
    let first = keep[0].first_cluster;
    let mut buf = vec![0u8; geo.cluster_bytes as usize];
    for cluster in 2..200u32 {
        if (first..first + 3).contains(&cluster) {
            continue;
        }
        vol.read_raw(geo.cluster_offset(cluster), &mut buf).unwrap();
        assert!(
            buf.iter().all(|&b| b == 0),
            "cluster {} was not wiped",
            cluster
        );
    }
}

// ---------------------------------------------------------------------
// Boundary behaviors
// ---------------------------------------------------------------------

#[test]
fn test_exact_cluster_fill_allocates_no_extra() {
    init_logging();
    let mut raw = MemContainer::with_size(64 << 20, 512).unwrap();
    let geo = format_fat(&mut raw, &fat16_params()).unwrap();
    let mut vol = Volume::mount(Box::new(raw)).unwrap();
    let free_before = vol.info().unwrap().free_bytes;
    let cb = geo.cluster_bytes as u64;
    vol.write_file("/exact.bin", &vec![1u8; cb as usize]).unwrap();
    let free_after = vol.info().unwrap().free_bytes;
    assert_eq!(free_before - free_after, cb);
    // Growing past the boundary takes exactly one more cluster.
    let mut f = vol.open("/exact.bin", FileMode::ReadWrite).unwrap();
    f.seek(cb);
    f.write(b"x").unwrap();
    f.close().unwrap();
    let free_grown = vol.info().unwrap().free_bytes;
    assert_eq!(free_after - free_grown, cb);
}

#[test]
fn test_lfn_numeric_tails_escalate() {
    init_logging();
    let mut raw = MemContainer::with_size(64 << 20, 512).unwrap();
    format_fat(&mut raw, &fat16_params()).unwrap();
    let mut vol = Volume::mount(Box::new(raw)).unwrap();
    vol.create("/long file name one.txt").unwrap().close().unwrap();
    vol.create("/long file name two.txt").unwrap().close().unwrap();
    vol.create("/long file name six.txt").unwrap().close().unwrap();
    // All three collapse to the same 8.3 stem, so the tails escalate.
    let listing = vol.ls("/").unwrap();
    assert_eq!(listing.len(), 3);
    // The long names resolve independently.
    assert!(vol.read_file("/long file name two.txt").unwrap().is_empty());
}

#[test]
fn test_fixed_root_dir_full() {
    init_logging();
    let mut raw = MemContainer::with_size(32 << 20, 512).unwrap();
    format_fat(
        &mut raw,
        &FormatParams {
            kind: Some(FatKind::Fat16),
            cluster_bytes: Some(2048),
            root_entries: Some(16),
            ..Default::default()
        },
    )
    .unwrap();
    let mut vol = Volume::mount(Box::new(raw)).unwrap();
    // 8.3 names occupy one slot each; the 17th must fail.
    for i in 0..16 {
        let f = vol.create(&format!("/F{:03}.TXT", i)).unwrap();
        f.close().unwrap();
    }
    let err = match vol.create("/F999.TXT") {
        Err(e) => e,
        Ok(_) => panic!("created an entry past the fixed root capacity"),
    };
    assert!(matches!(err, fathom_core::Error::DirFull));
}

#[test]
fn test_write_then_read_roundtrip_with_seek() {
    init_logging();
    let mut raw = MemContainer::with_size(64 << 20, 512).unwrap();
    format_fat(&mut raw, &fat16_params()).unwrap();
    let mut vol = Volume::mount(Box::new(raw)).unwrap();
    let payload = b"payload across clusters".repeat(500);
    {
        let mut f = vol.create("/data.bin").unwrap();
        f.seek(4096);
        f.write(&payload).unwrap();
        f.close().unwrap();
    }
    let mut f = vol.open("/data.bin", FileMode::Read).unwrap();
    assert_eq!(f.size(), 4096 + payload.len() as u64);
    f.seek(4096);
    let mut got = vec![0u8; payload.len()];
    assert_eq!(f.read(&mut got).unwrap(), payload.len());
    assert_eq!(got, payload);
    f.close().unwrap();
}

#[test]
fn test_subdirectories_and_remove() {
    init_logging();
    let mut raw = MemContainer::with_size(64 << 20, 512).unwrap();
    format_fat(&mut raw, &fat16_params()).unwrap();
    let mut vol = Volume::mount(Box::new(raw)).unwrap();
    vol.mkdir("/docs").unwrap();
    vol.mkdir("/docs/old").unwrap();
    vol.write_file("/docs/old/note.txt", b"n").unwrap();
    assert_eq!(vol.ls("/docs/old").unwrap().len(), 1);
    // Non-empty directories refuse to go.
    assert!(vol.remove("/docs/old").is_err());
    vol.remove("/docs/old/note.txt").unwrap();
    vol.remove("/docs/old").unwrap();
    assert_eq!(vol.ls("/docs").unwrap().len(), 0);
    // The freed clusters return to the map.
    let report = vol.fragmentation_report().unwrap();
    assert_eq!(report.total_files, 0);
}

#[test]
fn test_rename_and_sort_fat() {
    init_logging();
    let mut raw = MemContainer::with_size(64 << 20, 512).unwrap();
    format_fat(&mut raw, &fat16_params()).unwrap();
    let mut vol = Volume::mount(Box::new(raw)).unwrap();
    for name in ["zebra.txt", "apple.txt", "mango.txt"] {
        vol.write_file(&format!("/{}", name), name.as_bytes()).unwrap();
    }
    vol.rename("/mango.txt", "banana.txt").unwrap();
    vol.sort("/").unwrap();
    let names: Vec<String> = vol.ls("/").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["apple.txt", "banana.txt", "zebra.txt"]);
    // Contents follow their entries through rename and sort.
    assert_eq!(vol.read_file("/banana.txt").unwrap(), b"mango.txt");
    // Explicit order lists work too.
    vol.sort_names("/", &["zebra.txt", "apple.txt"]).unwrap();
    let names: Vec<String> = vol.ls("/").unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["zebra.txt", "apple.txt", "banana.txt"]);
}

// ---------------------------------------------------------------------
// exFAT specifics
// ---------------------------------------------------------------------

#[test]
fn test_exfat_roundtrip_and_nofatchain_invariant() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ex.img");
    let geo;
    {
        let mut raw = RawContainer::create_path(&path, 256 << 20, 512).unwrap();
        geo = format_exfat(
            &mut raw,
            &FormatParams {
                cluster_bytes: Some(32 << 10),
                ..Default::default()
            },
        )
        .unwrap();
        let mut vol = Volume::mount(Box::new(raw)).unwrap();
        vol.write_file("/doc.bin", &vec![7u8; 3 * (32 << 10)]).unwrap();
        assert_eq!(vol.read_file("/doc.bin").unwrap(), vec![7u8; 3 * (32 << 10)]);
        vol.close().unwrap();
    }
    // Contiguous allocations carry NoFatChain: the FAT region for those
    // clusters stays zero (never written, never read).
    let mut raw = RawContainer::open_path(&path, OpenMode::ReadOnly, 512).unwrap();
    let mut vol = Volume::mount(Box::new(raw)).unwrap();
    let listing = vol.ls("/").unwrap();
    assert_eq!(listing.len(), 1);
    let first = listing[0].first_cluster;
    let mut entry_raw = [0u8; 4];
    for i in 0..3 {
        vol.read_raw(geo.fat_offset + (first + i) as u64 * 4, &mut entry_raw)
            .unwrap();
        assert_eq!(u32::from_le_bytes(entry_raw), 0, "FAT written for NoFatChain file");
    }
    assert_eq!(vol.read_file("/doc.bin").unwrap(), vec![7u8; 3 * (32 << 10)]);
}

#[test]
fn test_exfat_truncate_ragged_materializes_chain() {
    init_logging();
    let mut raw = MemContainer::with_size(256 << 20, 512).unwrap();
    format_exfat(
        &mut raw,
        &FormatParams {
            cluster_bytes: Some(32 << 10),
            ..Default::default()
        },
    )
    .unwrap();
    let mut vol = Volume::mount(Box::new(raw)).unwrap();
    let cb = 32 << 10;
    vol.write_file("/t.bin", &vec![1u8; 4 * cb]).unwrap();
    {
        let mut f = vol.open("/t.bin", FileMode::ReadWrite).unwrap();
        f.truncate(cb as u64 + 7).unwrap();
        f.close().unwrap();
    }
    let listing = vol.ls("/").unwrap();
    assert_eq!(listing[0].size, cb as u64 + 7);
    let data = vol.read_file("/t.bin").unwrap();
    assert_eq!(data.len(), cb + 7);
    assert!(data.iter().all(|&b| b == 1));
}

#[test]
fn test_mirrors_identical_after_flush() {
    init_logging();
    let mut raw = MemContainer::with_size(64 << 20, 512).unwrap();
    let geo = format_fat(&mut raw, &fat16_params()).unwrap();
    let mut vol = Volume::mount(Box::new(raw)).unwrap();
    vol.write_file("/a.bin", &vec![9u8; 10000]).unwrap();
    vol.mkdir("/d").unwrap();
    vol.flush().unwrap();
    let fat_bytes = geo.fat_size_sectors as usize * geo.bytes_per_sector as usize;
    let mut fat0 = vec![0u8; fat_bytes];
    let mut fat1 = vec![0u8; fat_bytes];
    vol.read_raw(geo.fat_copy_offset(0), &mut fat0).unwrap();
    vol.read_raw(geo.fat_copy_offset(1), &mut fat1).unwrap();
    assert_eq!(fat0, fat1);
}

#[test]
fn test_free_map_and_chains_partition_the_heap() {
    init_logging();
    let mut raw = MemContainer::with_size(64 << 20, 512).unwrap();
    let geo = format_fat(&mut raw, &fat16_params()).unwrap();
    let mut vol = Volume::mount(Box::new(raw)).unwrap();
    vol.write_file("/one.bin", &vec![1u8; 5000]).unwrap();
    vol.write_file("/two.bin", &vec![2u8; 50000]).unwrap();
    vol.remove("/one.bin").unwrap();
    let info = vol.info().unwrap();
    let report = vol.fragmentation_report().unwrap();
    let used_clusters: u64 = report
        .files
        .iter()
        .map(|f| f.clusters as u64)
        .sum::<u64>()
        // one cluster is held by the /two.bin chain only; directories
        // with no subdir clusters add nothing here
        ;
    let free_clusters = info.free_bytes / geo.cluster_bytes as u64;
    assert_eq!(
        used_clusters + free_clusters,
        geo.cluster_count as u64,
        "free map and chains must partition the data clusters"
    );
}
