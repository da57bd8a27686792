// Cluster allocation table: encoded links, the free-space RLE map, and
// chain management. exFAT volumes track free space in the allocation
// bitmap instead of FAT entry values; files flagged NoFatChain never
// touch the FAT at all.

use std::collections::{HashMap, HashSet};

use log::{debug, info, warn};

use fathom_core::{BlockContainer, Error, Result};

use super::boot_sector::FatGeometry;
use super::free_map::FreeMap;
use super::{FatKind, FIRST_DATA_CLUSTER};

pub const FREE: u32 = 0;

pub struct FatTable {
    kind: FatKind,
    fat_offset: u64,
    fat_bytes: u64,
    num_fats: u32,
    cluster_count: u32,
    free: FreeMap,
    cache: HashMap<u32, u32>,
    /// exFAT allocation bitmap (byte offset and length on disk).
    bitmap_offset: u64,
    bitmap_bytes: u64,
}

impl FatTable {
    pub fn new(geo: &FatGeometry) -> Self {
        Self {
            kind: geo.kind,
            fat_offset: geo.fat_offset,
            fat_bytes: geo.fat_size_sectors as u64 * geo.bytes_per_sector as u64,
            num_fats: geo.num_fats,
            cluster_count: geo.cluster_count,
            free: FreeMap::new(),
            cache: HashMap::new(),
            bitmap_offset: 0,
            bitmap_bytes: 0,
        }
    }

    pub fn kind(&self) -> FatKind {
        self.kind
    }

    pub fn free_clusters(&self) -> u64 {
        self.free.total_free()
    }

    pub fn free_map(&self) -> &FreeMap {
        &self.free
    }

    fn max_cluster(&self) -> u32 {
        self.cluster_count + FIRST_DATA_CLUSTER - 1
    }

    fn check_cluster(&self, cluster: u32) -> Result<()> {
        if cluster < FIRST_DATA_CLUSTER || cluster > self.max_cluster() {
            return Err(Error::InconsistentFs(format!(
                "cluster {} outside the data region",
                cluster
            )));
        }
        Ok(())
    }

    fn entry_location(&self, cluster: u32) -> (u64, usize) {
        match self.kind {
            FatKind::Fat12 => (self.fat_offset + cluster as u64 * 3 / 2, 2),
            FatKind::Fat16 => (self.fat_offset + cluster as u64 * 2, 2),
            FatKind::Fat32 | FatKind::ExFat => (self.fat_offset + cluster as u64 * 4, 4),
        }
    }

    /// Raw FAT entry for a cluster.
    pub fn get<D: BlockContainer>(&mut self, disk: &mut D, cluster: u32) -> Result<u32> {
        self.check_cluster(cluster)?;
        if let Some(&v) = self.cache.get(&cluster) {
            return Ok(v);
        }
        let (offset, len) = self.entry_location(cluster);
        let mut raw = [0u8; 4];
        disk.read_at(offset, &mut raw[..len])?;
        let value = match self.kind {
            FatKind::Fat12 => {
                let v = u16::from_le_bytes([raw[0], raw[1]]);
                if cluster & 1 == 1 {
                    (v >> 4) as u32
                } else {
                    (v & 0x0FFF) as u32
                }
            }
            FatKind::Fat16 => u16::from_le_bytes([raw[0], raw[1]]) as u32,
            FatKind::Fat32 => u32::from_le_bytes(raw) & 0x0FFF_FFFF,
            FatKind::ExFat => u32::from_le_bytes(raw),
        };
        self.cache.insert(cluster, value);
        Ok(value)
    }

    /// Writes an entry through to every FAT copy, #0 first, and keeps the
    /// free map and (exFAT) allocation bitmap in step.
    pub fn set<D: BlockContainer>(&mut self, disk: &mut D, cluster: u32, value: u32) -> Result<()> {
        self.check_cluster(cluster)?;
        let (offset, len) = self.entry_location(cluster);
        let mut raw = [0u8; 4];
        match self.kind {
            FatKind::Fat12 => {
                disk.read_at(offset, &mut raw[..2])?;
                let old = u16::from_le_bytes([raw[0], raw[1]]);
                let packed = if cluster & 1 == 1 {
                    (old & 0x000F) | ((value as u16 & 0x0FFF) << 4)
                } else {
                    (old & 0xF000) | (value as u16 & 0x0FFF)
                };
                raw[..2].copy_from_slice(&packed.to_le_bytes());
            }
            FatKind::Fat16 => raw[..2].copy_from_slice(&(value as u16).to_le_bytes()),
            FatKind::Fat32 => {
                disk.read_at(offset, &mut raw)?;
                let old = u32::from_le_bytes(raw);
                let packed = (old & 0xF000_0000) | (value & 0x0FFF_FFFF);
                raw.copy_from_slice(&packed.to_le_bytes());
            }
            FatKind::ExFat => raw.copy_from_slice(&value.to_le_bytes()),
        }
        let stride = self.fat_bytes;
        for copy in 0..self.num_fats as u64 {
            disk.write_at(offset + copy * stride, &raw[..len])?;
        }
        self.cache.insert(
            cluster,
            if self.kind == FatKind::Fat32 {
                value & 0x0FFF_FFFF
            } else {
                value
            },
        );
        // Transitions to and from FREE move the cluster between the map
        // and the allocated set. exFAT free space lives in the bitmap
        // only, so its FAT writes leave the map alone.
        if self.kind != FatKind::ExFat {
            if value == FREE {
                if !self.free.contains(cluster) {
                    self.free.insert(cluster, 1);
                }
            } else if self.free.contains(cluster) {
                self.free.remove(cluster, 1);
            }
        }
        Ok(())
    }

    /// Next cluster in a chain, or None at end of chain.
    pub fn next<D: BlockContainer>(&mut self, disk: &mut D, cluster: u32) -> Result<Option<u32>> {
        let value = self.get(disk, cluster)?;
        if self.kind.is_eoc(value) {
            return Ok(None);
        }
        if value == FREE {
            return Err(Error::InconsistentFs(format!(
                "chain runs into free cluster after {}",
                cluster
            )));
        }
        if value == self.kind.bad() {
            return Err(Error::InconsistentFs(format!(
                "chain runs into bad cluster after {}",
                cluster
            )));
        }
        Ok(Some(value))
    }

    /// Walks a whole chain with cycle detection.
    pub fn chain<D: BlockContainer>(&mut self, disk: &mut D, start: u32) -> Result<Vec<u32>> {
        let mut clusters = Vec::new();
        let mut seen = HashSet::new();
        let mut current = start;
        loop {
            self.check_cluster(current)?;
            if !seen.insert(current) {
                return Err(Error::InconsistentFs(format!(
                    "circular cluster chain through {}",
                    current
                )));
            }
            clusters.push(current);
            match self.next(disk, current)? {
                Some(next) => current = next,
                None => break,
            }
        }
        Ok(clusters)
    }

    // ------------------------------------------------------------------
    // Free-space construction
    // ------------------------------------------------------------------

    /// Builds the free map by scanning the FAT in sector-sized reads.
    /// FSInfo hints are deliberately ignored; the scan is the truth.
    pub fn scan_free<D: BlockContainer>(&mut self, disk: &mut D, geo: &FatGeometry) -> Result<()> {
        assert_ne!(self.kind, FatKind::ExFat, "exFAT free space comes from the bitmap");
        self.free = FreeMap::new();
        let bps = geo.bytes_per_sector as usize;
        let mut page = vec![0u8; bps.max(4096)];
        let mut run_start = 0u32;
        let mut run_len = 0u32;
        let max = self.max_cluster();
        let mut cluster = FIRST_DATA_CLUSTER;
        while cluster <= max {
            let (offset, entry_len) = self.entry_location(cluster);
            // Anchor each page at the sector holding the current entry so
            // an entry straddling the previous page is always covered.
            let page_base = offset / bps as u64 * bps as u64;
            let take = page.len().min((self.fat_offset + self.fat_bytes - page_base) as usize);
            disk.read_at(page_base, &mut page[..take])?;
            // Decode every entry that falls wholly inside this page.
            while cluster <= max {
                let (at, _) = self.entry_location(cluster);
                if at + entry_len as u64 > page_base + take as u64 {
                    break;
                }
                let rel = (at - page_base) as usize;
                let value = match self.kind {
                    FatKind::Fat12 => {
                        let v = u16::from_le_bytes([page[rel], page[rel + 1]]);
                        if cluster & 1 == 1 {
                            (v >> 4) as u32
                        } else {
                            (v & 0x0FFF) as u32
                        }
                    }
                    FatKind::Fat16 => u16::from_le_bytes([page[rel], page[rel + 1]]) as u32,
                    FatKind::Fat32 => {
                        u32::from_le_bytes(page[rel..rel + 4].try_into().unwrap()) & 0x0FFF_FFFF
                    }
                    FatKind::ExFat => unreachable!(),
                };
                if value == FREE {
                    if run_len == 0 {
                        run_start = cluster;
                    }
                    run_len += 1;
                } else if run_len > 0 {
                    self.free.insert(run_start, run_len);
                    run_len = 0;
                }
                cluster += 1;
            }
        }
        if run_len > 0 {
            self.free.insert(run_start, run_len);
        }
        info!(
            "free map: {} clusters free in {} runs",
            self.free.total_free(),
            self.free.run_count()
        );
        Ok(())
    }

    /// Points the table at the exFAT allocation bitmap and loads the free
    /// map from it (bit clear = cluster free).
    pub fn load_exfat_bitmap<D: BlockContainer>(
        &mut self,
        disk: &mut D,
        geo: &FatGeometry,
        bitmap_cluster: u32,
        bitmap_bytes: u64,
    ) -> Result<()> {
        assert_eq!(self.kind, FatKind::ExFat);
        self.bitmap_offset = geo.cluster_offset(bitmap_cluster);
        self.bitmap_bytes = bitmap_bytes;
        self.free = FreeMap::new();
        let mut raw = vec![0u8; bitmap_bytes as usize];
        disk.read_at(self.bitmap_offset, &mut raw)?;
        let mut run_start = 0u32;
        let mut run_len = 0u32;
        for index in 0..self.cluster_count {
            let free = raw[(index / 8) as usize] & (1 << (index % 8)) == 0;
            if free {
                if run_len == 0 {
                    run_start = index + FIRST_DATA_CLUSTER;
                }
                run_len += 1;
            } else if run_len > 0 {
                self.free.insert(run_start, run_len);
                run_len = 0;
            }
        }
        if run_len > 0 {
            self.free.insert(run_start, run_len);
        }
        info!(
            "allocation bitmap: {} clusters free in {} runs",
            self.free.total_free(),
            self.free.run_count()
        );
        Ok(())
    }

    fn set_bitmap_run<D: BlockContainer>(
        &mut self,
        disk: &mut D,
        start: u32,
        count: u32,
        allocated: bool,
    ) -> Result<()> {
        if self.kind != FatKind::ExFat || self.bitmap_bytes == 0 {
            return Ok(());
        }
        // Read-modify-write the touched bitmap byte range.
        let first = (start - FIRST_DATA_CLUSTER) as u64;
        let last = first + count as u64 - 1;
        let byte_lo = first / 8;
        let byte_hi = last / 8;
        let mut raw = vec![0u8; (byte_hi - byte_lo + 1) as usize];
        disk.read_at(self.bitmap_offset + byte_lo, &mut raw)?;
        for index in first..=last {
            let bit = 1u8 << (index % 8);
            let byte = &mut raw[(index / 8 - byte_lo) as usize];
            if allocated {
                *byte |= bit;
            } else {
                *byte &= !bit;
            }
        }
        disk.write_at(self.bitmap_offset + byte_lo, &raw)
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocates `count` clusters: contiguous when a single best-fit run
    /// suffices, otherwise chained across the longest available runs.
    /// With `link`, FAT entries are written (chain links, EOC last);
    /// without, only the free map and bitmap change, for exFAT NoFatChain
    /// extents. Returns the clusters in chain order.
    pub fn alloc<D: BlockContainer>(
        &mut self,
        disk: &mut D,
        count: u32,
        near: Option<u32>,
        link: bool,
    ) -> Result<Vec<u32>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let available = self.free.total_free();
        if (count as u64) > available {
            return Err(Error::NoSpace {
                requested: count,
                available: available.min(u32::MAX as u64) as u32,
            });
        }
        let mut runs: Vec<(u32, u32)> = Vec::new();
        let mut remaining = count;
        while remaining > 0 {
            let (start, len) = self
                .free
                .take(remaining, near)
                .expect("free total said enough clusters");
            runs.push((start, len));
            remaining -= len;
        }
        let clusters: Vec<u32> = runs
            .iter()
            .flat_map(|&(s, l)| s..s + l)
            .collect();

        let attempt = |table: &mut Self, disk: &mut D| -> Result<()> {
            for &(s, l) in &runs {
                table.set_bitmap_run(disk, s, l, true)?;
            }
            if link {
                for pair in clusters.windows(2) {
                    table.set(disk, pair[0], pair[1])?;
                }
                // The EOC transition lands last, committing the chain.
                table.set(disk, *clusters.last().unwrap(), table.kind.eoc())?;
            }
            Ok(())
        };
        if let Err(e) = attempt(self, disk) {
            // Roll the partial allocation back before surfacing.
            warn!("allocation failed mid-write, rolling back: {}", e);
            for &(s, l) in &runs {
                if self.kind == FatKind::ExFat {
                    let _ = self.set_bitmap_run(disk, s, l, false);
                    self.free.insert(s, l);
                } else {
                    for c in s..s + l {
                        // Re-zeroes the entry and returns it to the map.
                        let _ = self.set(disk, c, FREE);
                    }
                }
            }
            return Err(e);
        }
        debug!(
            "allocated {} cluster(s) in {} run(s) starting at {}",
            count,
            runs.len(),
            clusters[0]
        );
        Ok(clusters)
    }

    /// Appends `count` clusters to the chain ending at `last`.
    pub fn extend_chain<D: BlockContainer>(
        &mut self,
        disk: &mut D,
        last: u32,
        count: u32,
    ) -> Result<Vec<u32>> {
        let new = self.alloc(disk, count, Some(last + 1), true)?;
        self.set(disk, last, new[0])?;
        Ok(new)
    }

    /// Frees a linked chain, returning every cluster to the free map and
    /// consolidating runs.
    pub fn free_chain<D: BlockContainer>(&mut self, disk: &mut D, start: u32) -> Result<u32> {
        let clusters = self.chain(disk, start)?;
        for &c in &clusters {
            self.set(disk, c, FREE)?;
        }
        if self.kind == FatKind::ExFat {
            for &c in &clusters {
                self.set_bitmap_run(disk, c, 1, false)?;
                self.free.insert(c, 1);
            }
        }
        debug!("freed chain of {} cluster(s) from {}", clusters.len(), start);
        Ok(clusters.len() as u32)
    }

    /// Frees a contiguous NoFatChain extent: bitmap and free map only,
    /// the FAT bytes for these clusters are never read or written.
    pub fn free_run<D: BlockContainer>(
        &mut self,
        disk: &mut D,
        start: u32,
        count: u32,
    ) -> Result<()> {
        assert_eq!(self.kind, FatKind::ExFat);
        if count == 0 {
            return Ok(());
        }
        self.check_cluster(start)?;
        self.check_cluster(start + count - 1)?;
        self.set_bitmap_run(disk, start, count, false)?;
        self.free.insert(start, count);
        Ok(())
    }

    /// Compares all FAT copies; a mismatch is the recoverable mount
    /// inconsistency the caller may downgrade to read-only.
    pub fn verify_mirrors<D: BlockContainer>(&self, disk: &mut D) -> Result<()> {
        if self.num_fats < 2 {
            return Ok(());
        }
        let mut first = vec![0u8; 64 << 10];
        let mut other = vec![0u8; 64 << 10];
        let mut at = 0u64;
        while at < self.fat_bytes {
            let take = ((self.fat_bytes - at) as usize).min(first.len());
            disk.read_at(self.fat_offset + at, &mut first[..take])?;
            for copy in 1..self.num_fats as u64 {
                disk.read_at(self.fat_offset + copy * self.fat_bytes + at, &mut other[..take])?;
                if first[..take] != other[..take] {
                    return Err(Error::InconsistentFs(format!(
                        "FAT copy {} differs from copy 0 near byte {}",
                        copy, at
                    )));
                }
            }
            at += take as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fat::boot_sector::parse_bpb;
    use crate::mkfs::{self, FormatParams};
    use fathom_core::{BlockContainer, MemContainer};
    use fathom_disks::SectorCache;

    // FAT entries are 2-4 bytes; like the volume layer, the tests talk
    // to the container through a sector cache.
    fn fat16_volume() -> (SectorCache<MemContainer>, FatGeometry) {
        let mut mem = MemContainer::with_size(64 << 20, 512).unwrap();
        mkfs::format_fat(
            &mut mem,
            &FormatParams {
                kind: Some(FatKind::Fat16),
                cluster_bytes: Some(2048),
                ..Default::default()
            },
        )
        .unwrap();
        let mut disk = SectorCache::new(mem);
        let mut sector = vec![0u8; 512];
        disk.read_at(0, &mut sector).unwrap();
        let geo = parse_bpb(&sector, disk.size()).unwrap();
        (disk, geo)
    }

    #[test]
    fn test_set_get_roundtrip() {
        let (mut disk, geo) = fat16_volume();
        let mut fat = FatTable::new(&geo);
        fat.set(&mut disk, 5, 6).unwrap();
        fat.set(&mut disk, 6, 0xFFF8).unwrap();
        fat.cache.clear();
        assert_eq!(fat.get(&mut disk, 5).unwrap(), 6);
        assert!(fat.kind().is_eoc(fat.get(&mut disk, 6).unwrap()));
    }

    #[test]
    fn test_mirrors_updated_together() {
        let (mut disk, geo) = fat16_volume();
        let mut fat = FatTable::new(&geo);
        fat.set(&mut disk, 9, 0xFFFF).unwrap();
        disk.flush().unwrap();
        fat.verify_mirrors(&mut disk).unwrap();
    }

    #[test]
    fn test_mirror_mismatch_detected() {
        let (mut disk, geo) = fat16_volume();
        let fat = FatTable::new(&geo);
        // Scribble on FAT #1 only.
        let fat1 = geo.fat_copy_offset(1);
        disk.write_at(fat1 + 512, &[0xAB; 512]).unwrap();
        assert!(matches!(
            fat.verify_mirrors(&mut disk),
            Err(Error::InconsistentFs(_))
        ));
    }

    #[test]
    fn test_scan_free_and_alloc_best_fit() {
        let (mut disk, geo) = fat16_volume();
        let mut fat = FatTable::new(&geo);
        fat.scan_free(&mut disk, &geo).unwrap();
        let before = fat.free_clusters();
        assert_eq!(before, geo.cluster_count as u64);

        // Carve the free space into runs {2:5, 10:3, 20:20} by marking
        // everything else allocated.
        let max = geo.max_cluster();
        for c in [7u32, 8, 9, 13, 14, 15, 16, 17, 18, 19] {
            fat.set(&mut disk, c, 0xFFFF).unwrap();
        }
        for c in 40..=max {
            fat.set(&mut disk, c, 0xFFFF).unwrap();
        }
        let runs: Vec<_> = fat.free_map().iter().collect();
        assert_eq!(runs, vec![(2, 5), (10, 3), (20, 20)]);

        let got = fat.alloc(&mut disk, 12, None, true).unwrap();
        assert_eq!(got, (20..32).collect::<Vec<_>>());
        let runs: Vec<_> = fat.free_map().iter().collect();
        assert_eq!(runs, vec![(2, 5), (10, 3), (32, 8)]);
        // Chain is linked and terminated.
        assert_eq!(fat.chain(&mut disk, 20).unwrap(), got);
    }

    #[test]
    fn test_alloc_spills_across_runs() {
        let (mut disk, geo) = fat16_volume();
        let mut fat = FatTable::new(&geo);
        fat.scan_free(&mut disk, &geo).unwrap();
        let max = geo.max_cluster();
        // Leave only {2:4} and {10:4} free.
        for c in 6..10u32 {
            fat.set(&mut disk, c, 0xFFFF).unwrap();
        }
        for c in 14..=max {
            fat.set(&mut disk, c, 0xFFFF).unwrap();
        }
        let got = fat.alloc(&mut disk, 6, None, true).unwrap();
        assert_eq!(got.len(), 6);
        assert_eq!(fat.chain(&mut disk, got[0]).unwrap(), got);
        assert_eq!(fat.free_clusters(), 2);
    }

    #[test]
    fn test_alloc_no_space() {
        let (mut disk, geo) = fat16_volume();
        let mut fat = FatTable::new(&geo);
        fat.scan_free(&mut disk, &geo).unwrap();
        let total = fat.free_clusters() as u32;
        assert!(matches!(
            fat.alloc(&mut disk, total + 1, None, true),
            Err(Error::NoSpace { .. })
        ));
        // Nothing was taken.
        assert_eq!(fat.free_clusters() as u32, total);
    }

    #[test]
    fn test_free_chain_consolidates() {
        let (mut disk, geo) = fat16_volume();
        let mut fat = FatTable::new(&geo);
        fat.scan_free(&mut disk, &geo).unwrap();
        let total = fat.free_clusters();
        let got = fat.alloc(&mut disk, 8, None, true).unwrap();
        assert_eq!(fat.free_clusters(), total - 8);
        let freed = fat.free_chain(&mut disk, got[0]).unwrap();
        assert_eq!(freed, 8);
        assert_eq!(fat.free_clusters(), total);
        // Runs merged back into one.
        assert_eq!(fat.free_map().run_count(), 1);
    }

    #[test]
    fn test_chain_cycle_detected() {
        let (mut disk, geo) = fat16_volume();
        let mut fat = FatTable::new(&geo);
        fat.set(&mut disk, 5, 6).unwrap();
        fat.set(&mut disk, 6, 5).unwrap();
        assert!(matches!(
            fat.chain(&mut disk, 5),
            Err(Error::InconsistentFs(_))
        ));
    }

    #[test]
    fn test_fat12_packing() {
        let mut mem = MemContainer::with_size(2 << 20, 512).unwrap();
        mkfs::format_fat(
            &mut mem,
            &FormatParams {
                kind: Some(FatKind::Fat12),
                cluster_bytes: Some(1024),
                ..Default::default()
            },
        )
        .unwrap();
        let mut disk = SectorCache::new(mem);
        let mut sector = vec![0u8; 512];
        disk.read_at(0, &mut sector).unwrap();
        let geo = parse_bpb(&sector, disk.size()).unwrap();
        assert_eq!(geo.kind, FatKind::Fat12);
        let mut fat = FatTable::new(&geo);
        // Adjacent 12-bit entries share a byte; they must not clobber
        // each other.
        fat.set(&mut disk, 4, 0xABC).unwrap();
        fat.set(&mut disk, 5, 0x123).unwrap();
        fat.cache.clear();
        assert_eq!(fat.get(&mut disk, 4).unwrap(), 0xABC);
        assert_eq!(fat.get(&mut disk, 5).unwrap(), 0x123);
    }
}
