// Directory table engine.
//
// A directory is an ordered array of 32-byte slots backed by either the
// fixed FAT12/16 root region or a cluster chain. The whole table is
// buffered at open; two in-memory name indices (short and upcased long)
// and a free-slot RLE map are maintained for the table's lifetime and
// rebuilt on reopen.
//
// FAT logical entries are LFN-slot groups (last-first) closing with one
// 8.3 entry; exFAT logical entries are File + Stream Extension + k File
// Name slots bound by a set checksum.

use std::collections::HashMap;

use log::{debug, warn};

use fathom_core::{BlockContainer, Error, Result};

use super::boot_sector::FatGeometry;
use super::free_map::FreeMap;
use super::names::{
    self, assemble_lfn, build_lfn_slots, exfat_name_hash, exfat_set_checksum, lfn_checksum,
    lfn_slot_chars, unpack_83, UpcaseTable, ATTR_LFN, EXFAT_CHARS_PER_SLOT, LFN_LAST_FLAG,
};
use super::table::FatTable;
use super::timestamps::{now_exfat_datetime, now_fat_datetime};
use super::FatKind;

pub const SLOT_SIZE: usize = 32;

// FAT attribute bits.
pub const ATTR_READ_ONLY: u8 = 0x01;
pub const ATTR_HIDDEN: u8 = 0x02;
pub const ATTR_SYSTEM: u8 = 0x04;
pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_ARCHIVE: u8 = 0x20;

// exFAT entry types (with the InUse bit 0x80 set).
pub const EXFAT_TYPE_BITMAP: u8 = 0x81;
pub const EXFAT_TYPE_UPCASE: u8 = 0x82;
pub const EXFAT_TYPE_LABEL: u8 = 0x83;
pub const EXFAT_TYPE_FILE: u8 = 0x85;
pub const EXFAT_TYPE_STREAM: u8 = 0xC0;
pub const EXFAT_TYPE_NAME: u8 = 0xC1;

pub const EXFAT_FLAG_ALLOC_POSSIBLE: u8 = 0x01;
pub const EXFAT_FLAG_NO_FAT_CHAIN: u8 = 0x02;

const SLOT_FREE: u8 = 0xE5;
const SLOT_END: u8 = 0x00;

/// Where a directory's slots live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirLocation {
    /// The fixed FAT12/16 root region: cannot grow.
    FixedRoot,
    /// A FAT-linked cluster chain.
    Chain { first_cluster: u32 },
    /// An exFAT NoFatChain extent: contiguous clusters, FAT untouched.
    Extent { first_cluster: u32, clusters: u32 },
}

/// Borrowed volume state a directory operation needs.
pub struct DirCtx<'a, D> {
    pub disk: &'a mut D,
    pub fat: &'a mut FatTable,
    pub geo: &'a FatGeometry,
    pub upcase: &'a UpcaseTable,
    pub read_only: bool,
}

impl<'a, D: BlockContainer> DirCtx<'a, D> {
    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }
}

/// One logical directory entry, as parsed from its slot group.
#[derive(Debug, Clone)]
pub struct ParsedEntry {
    pub name: String,
    pub short_raw: [u8; 11],
    pub attrs: u8,
    pub is_dir: bool,
    pub first_cluster: u32,
    pub size: u64,
    pub valid_data_len: u64,
    pub no_fat_chain: bool,
    pub mdate: u16,
    pub mtime: u16,
    /// First slot of the group and the number of slots it spans.
    pub slot_start: usize,
    pub slot_count: usize,
}

/// System entries found while scanning an exFAT root.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExFatSystemEntries {
    pub bitmap_cluster: u32,
    pub bitmap_bytes: u64,
    pub upcase_cluster: u32,
    pub upcase_bytes: u64,
}

pub struct DirTable {
    pub location: DirLocation,
    kind: FatKind,
    slots: Vec<[u8; SLOT_SIZE]>,
    clusters: Vec<u32>,
    entries: Vec<ParsedEntry>,
    by_long: HashMap<String, usize>,
    by_short: HashMap<[u8; 11], usize>,
    free_slots: FreeMap,
    /// Volume label, if a label entry exists (slot index, text).
    label: Option<(usize, String)>,
    system: ExFatSystemEntries,
    /// Slots reserved at the front (dot entries, exFAT system entries)
    /// that sort must not move.
    pinned_prefix: usize,
}

impl DirTable {
    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    pub fn load<D: BlockContainer>(ctx: &mut DirCtx<'_, D>, location: DirLocation) -> Result<Self> {
        let (raw, clusters) = match location {
            DirLocation::FixedRoot => {
                let mut raw = vec![0u8; ctx.geo.root_dir_bytes as usize];
                ctx.disk.read_at(ctx.geo.root_dir_offset, &mut raw)?;
                (raw, Vec::new())
            }
            DirLocation::Chain { first_cluster } => {
                let clusters = ctx.fat.chain(ctx.disk, first_cluster)?;
                let cb = ctx.geo.cluster_bytes as usize;
                let mut raw = vec![0u8; clusters.len() * cb];
                for (i, &cl) in clusters.iter().enumerate() {
                    ctx.disk
                        .read_at(ctx.geo.cluster_offset(cl), &mut raw[i * cb..(i + 1) * cb])?;
                }
                (raw, clusters)
            }
            DirLocation::Extent {
                first_cluster,
                clusters: count,
            } => {
                let clusters: Vec<u32> = (first_cluster..first_cluster + count).collect();
                let cb = ctx.geo.cluster_bytes as usize;
                let mut raw = vec![0u8; clusters.len() * cb];
                for (i, &cl) in clusters.iter().enumerate() {
                    ctx.disk
                        .read_at(ctx.geo.cluster_offset(cl), &mut raw[i * cb..(i + 1) * cb])?;
                }
                (raw, clusters)
            }
        };
        let slots: Vec<[u8; SLOT_SIZE]> = raw
            .chunks_exact(SLOT_SIZE)
            .map(|c| c.try_into().unwrap())
            .collect();
        let mut table = Self {
            location,
            kind: ctx.geo.kind,
            slots,
            clusters,
            entries: Vec::new(),
            by_long: HashMap::new(),
            by_short: HashMap::new(),
            free_slots: FreeMap::new(),
            label: None,
            system: ExFatSystemEntries::default(),
            pinned_prefix: 0,
        };
        table.rebuild(ctx.upcase);
        Ok(table)
    }

    /// Reparses the slot array, refreshing entries, indices, and the
    /// free-slot map.
    fn rebuild(&mut self, upcase: &UpcaseTable) {
        self.entries.clear();
        self.by_long.clear();
        self.by_short.clear();
        self.free_slots = FreeMap::new();
        self.label = None;
        self.system = ExFatSystemEntries::default();
        self.pinned_prefix = 0;
        if self.kind == FatKind::ExFat {
            self.rebuild_exfat();
        } else {
            self.rebuild_fat();
        }
        for (i, e) in self.entries.iter().enumerate() {
            self.by_long.insert(upcase.upcase_str(&e.name), i);
            if self.kind != FatKind::ExFat {
                self.by_short.insert(e.short_raw, i);
            }
        }
    }

    fn rebuild_fat(&mut self) {
        let mut i = 0usize;
        let mut pending_lfn: Vec<(usize, [u8; 32])> = Vec::new();
        let mut end_seen = false;
        while i < self.slots.len() {
            let slot = self.slots[i];
            if end_seen || slot[0] == SLOT_END {
                end_seen = true;
                self.free_slots.insert(i as u32, 1);
                pending_lfn.clear();
                i += 1;
                continue;
            }
            if slot[0] == SLOT_FREE {
                self.free_slots.insert(i as u32, 1);
                pending_lfn.clear();
                i += 1;
                continue;
            }
            if slot[11] == ATTR_LFN {
                if slot[0] & LFN_LAST_FLAG != 0 {
                    pending_lfn.clear();
                }
                pending_lfn.push((i, slot));
                i += 1;
                continue;
            }
            // Short entry: close any LFN group in flight.
            let attrs = slot[11];
            let short_raw: [u8; 11] = slot[0..11].try_into().unwrap();
            let checksum = lfn_checksum(&short_raw);
            let mut name = String::new();
            let mut slot_start = i;
            if !pending_lfn.is_empty() {
                let complete = pending_lfn.last().map(|(at, _)| *at + 1 == i).unwrap_or(false)
                    && pending_lfn[0].1[0] & LFN_LAST_FLAG != 0
                    && pending_lfn.iter().all(|(_, s)| s[13] == checksum)
                    && pending_lfn
                        .iter()
                        .rev()
                        .enumerate()
                        .all(|(n, (_, s))| (s[0] & 0x3F) as usize == n + 1);
                if complete {
                    let mut units = Vec::new();
                    for (_, s) in pending_lfn.iter().rev() {
                        units.extend_from_slice(&lfn_slot_chars(s));
                    }
                    name = assemble_lfn(&units);
                    slot_start = pending_lfn[0].0;
                } else {
                    // Checksum or sequence mismatch: the group is orphan
                    // garbage and the short entry stands alone.
                    warn!("orphan LFN group before slot {}", i);
                }
                pending_lfn.clear();
            }
            if attrs & ATTR_VOLUME_ID != 0 {
                let text = String::from_utf8_lossy(&slot[0..11]).trim_end().to_string();
                self.label = Some((i, text));
                i += 1;
                continue;
            }
            if name.is_empty() {
                name = unpack_83(&short_raw);
            }
            let first_cluster =
                (u16::from_le_bytes([slot[20], slot[21]]) as u32) << 16
                    | u16::from_le_bytes([slot[26], slot[27]]) as u32;
            let entry = ParsedEntry {
                name,
                short_raw,
                attrs,
                is_dir: attrs & ATTR_DIRECTORY != 0,
                first_cluster,
                size: u32::from_le_bytes(slot[28..32].try_into().unwrap()) as u64,
                valid_data_len: 0,
                no_fat_chain: false,
                mdate: u16::from_le_bytes([slot[24], slot[25]]),
                mtime: u16::from_le_bytes([slot[22], slot[23]]),
                slot_start,
                slot_count: i - slot_start + 1,
            };
            if entry.name == "." || entry.name == ".." {
                // Dot entries stay pinned at the head of a subdirectory.
                self.pinned_prefix = self.pinned_prefix.max(i + 1);
            } else {
                self.entries.push(entry);
            }
            i += 1;
        }
    }

    fn rebuild_exfat(&mut self) {
        let mut i = 0usize;
        let mut end_seen = false;
        while i < self.slots.len() {
            let slot = self.slots[i];
            let etype = slot[0];
            if end_seen || etype == SLOT_END {
                end_seen = true;
                self.free_slots.insert(i as u32, 1);
                i += 1;
                continue;
            }
            if etype & 0x80 == 0 {
                // InUse bit clear: a deleted entry, reusable.
                self.free_slots.insert(i as u32, 1);
                i += 1;
                continue;
            }
            match etype {
                EXFAT_TYPE_BITMAP => {
                    self.system.bitmap_cluster =
                        u32::from_le_bytes(slot[20..24].try_into().unwrap());
                    self.system.bitmap_bytes =
                        u64::from_le_bytes(slot[24..32].try_into().unwrap());
                    self.pinned_prefix = self.pinned_prefix.max(i + 1);
                    i += 1;
                }
                EXFAT_TYPE_UPCASE => {
                    self.system.upcase_cluster =
                        u32::from_le_bytes(slot[20..24].try_into().unwrap());
                    self.system.upcase_bytes =
                        u64::from_le_bytes(slot[24..32].try_into().unwrap());
                    self.pinned_prefix = self.pinned_prefix.max(i + 1);
                    i += 1;
                }
                EXFAT_TYPE_LABEL => {
                    let len = (slot[1] as usize).min(11);
                    let units: Vec<u16> = slot[2..2 + len * 2]
                        .chunks_exact(2)
                        .map(|c| u16::from_le_bytes([c[0], c[1]]))
                        .collect();
                    self.label = Some((i, String::from_utf16_lossy(&units)));
                    self.pinned_prefix = self.pinned_prefix.max(i + 1);
                    i += 1;
                }
                EXFAT_TYPE_FILE => {
                    let secondary = slot[1] as usize;
                    if i + secondary >= self.slots.len() {
                        warn!("truncated exFAT entry set at slot {}", i);
                        break;
                    }
                    let set: Vec<u8> = self.slots[i..=i + secondary].concat();
                    let stored = u16::from_le_bytes([set[2], set[3]]);
                    if exfat_set_checksum(&set) != stored {
                        warn!("exFAT set checksum mismatch at slot {}, skipping", i);
                        i += 1;
                        continue;
                    }
                    let stream = &set[32..64];
                    if stream[0] != EXFAT_TYPE_STREAM {
                        warn!("exFAT set at slot {} lacks a stream extension", i);
                        i += secondary + 1;
                        continue;
                    }
                    let name_len = stream[3] as usize;
                    let mut units = Vec::with_capacity(name_len);
                    for k in 0..secondary - 1 {
                        let ne = &set[64 + k * 32..96 + k * 32];
                        if ne[0] != EXFAT_TYPE_NAME {
                            break;
                        }
                        for c in ne[2..32].chunks_exact(2) {
                            units.push(u16::from_le_bytes([c[0], c[1]]));
                        }
                    }
                    units.truncate(name_len);
                    let attrs16 = u16::from_le_bytes([set[4], set[5]]);
                    let flags = stream[1];
                    let mdatetime = u32::from_le_bytes(set[12..16].try_into().unwrap());
                    let entry = ParsedEntry {
                        name: String::from_utf16_lossy(&units),
                        short_raw: [0u8; 11],
                        attrs: (attrs16 & 0x37) as u8,
                        is_dir: attrs16 & ATTR_DIRECTORY as u16 != 0,
                        first_cluster: u32::from_le_bytes(stream[20..24].try_into().unwrap()),
                        size: u64::from_le_bytes(stream[24..32].try_into().unwrap()),
                        valid_data_len: u64::from_le_bytes(stream[8..16].try_into().unwrap()),
                        no_fat_chain: flags & EXFAT_FLAG_NO_FAT_CHAIN != 0,
                        mdate: (mdatetime >> 16) as u16,
                        mtime: mdatetime as u16,
                        slot_start: i,
                        slot_count: secondary + 1,
                    };
                    self.entries.push(entry);
                    i += secondary + 1;
                }
                _ => {
                    debug!("unknown exFAT entry type {:#x} at slot {}", etype, i);
                    i += 1;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn entries(&self) -> &[ParsedEntry] {
        &self.entries
    }

    pub fn system_entries(&self) -> ExFatSystemEntries {
        self.system
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_ref().map(|(_, s)| s.as_str())
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn cluster_len(&self) -> usize {
        self.clusters.len()
    }

    /// Case-insensitive lookup through the long-name index, with the
    /// short-name index as the FAT fallback.
    pub fn find(&self, upcase: &UpcaseTable, name: &str) -> Option<&ParsedEntry> {
        let key = upcase.upcase_str(name);
        if let Some(&i) = self.by_long.get(&key) {
            return self.entries.get(i);
        }
        if self.kind != FatKind::ExFat {
            if let Ok(raw) = names::gen_short_name(&key, |_| false) {
                if let Some(&i) = self.by_short.get(&raw) {
                    return self.entries.get(i);
                }
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Slot I/O
    // ------------------------------------------------------------------

    /// Byte location of a slot on disk.
    fn slot_offset(&self, geo: &FatGeometry, index: usize) -> u64 {
        match self.location {
            DirLocation::FixedRoot => geo.root_dir_offset + (index * SLOT_SIZE) as u64,
            DirLocation::Chain { .. } | DirLocation::Extent { .. } => {
                let per_cluster = geo.cluster_bytes as usize / SLOT_SIZE;
                let cluster = self.clusters[index / per_cluster];
                geo.cluster_offset(cluster) + ((index % per_cluster) * SLOT_SIZE) as u64
            }
        }
    }

    fn write_slot<D: BlockContainer>(
        &mut self,
        ctx: &mut DirCtx<'_, D>,
        index: usize,
        data: [u8; SLOT_SIZE],
    ) -> Result<()> {
        self.slots[index] = data;
        let at = self.slot_offset(ctx.geo, index);
        ctx.disk.write_at(at, &data)
    }

    /// Claims `count` contiguous free slots, growing chain-backed tables
    /// by one zeroed cluster when no run fits.
    fn alloc_slots<D: BlockContainer>(
        &mut self,
        ctx: &mut DirCtx<'_, D>,
        count: usize,
    ) -> Result<usize> {
        if let Some((start, len)) = self.free_slots.best_fit(count as u32, None) {
            if len >= count as u32 {
                self.free_slots.remove(start, count as u32);
                return Ok(start as usize);
            }
        }
        // Grow by one cluster; it arrives zeroed so the end-of-directory
        // marker convention holds.
        let cl = match self.location {
            DirLocation::FixedRoot => return Err(Error::DirFull),
            DirLocation::Chain { first_cluster } => {
                let last = *self.clusters.last().unwrap_or(&first_cluster);
                ctx.fat.extend_chain(ctx.disk, last, 1)?[0]
            }
            DirLocation::Extent {
                first_cluster,
                clusters,
            } => {
                // A NoFatChain table can only grow in place; the FAT for
                // its clusters must stay unread.
                let last = first_cluster + clusters - 1;
                let got = ctx.fat.alloc(ctx.disk, 1, Some(last + 1), false)?;
                if got[0] != last + 1 {
                    ctx.fat.free_run(ctx.disk, got[0], 1)?;
                    return Err(Error::NoSpace {
                        requested: 1,
                        available: 0,
                    });
                }
                self.location = DirLocation::Extent {
                    first_cluster,
                    clusters: clusters + 1,
                };
                got[0]
            }
        };
        let zeros = vec![0u8; ctx.geo.cluster_bytes as usize];
        ctx.disk.write_at(ctx.geo.cluster_offset(cl), &zeros)?;
        let old_len = self.slots.len();
        let per_cluster = ctx.geo.cluster_bytes as usize / SLOT_SIZE;
        self.clusters.push(cl);
        self.slots.extend(std::iter::repeat([0u8; SLOT_SIZE]).take(per_cluster));
        self.free_slots.insert(old_len as u32, per_cluster as u32);
        debug!("grew directory by cluster {} ({} slots)", cl, per_cluster);
        self.alloc_slots(ctx, count)
    }

    // ------------------------------------------------------------------
    // Entry construction
    // ------------------------------------------------------------------

    fn build_fat_short_entry(
        short_raw: &[u8; 11],
        attrs: u8,
        first_cluster: u32,
        size: u32,
    ) -> [u8; SLOT_SIZE] {
        let mut slot = [0u8; SLOT_SIZE];
        slot[0..11].copy_from_slice(short_raw);
        slot[11] = attrs;
        let (date, time) = now_fat_datetime();
        slot[14..16].copy_from_slice(&time.to_le_bytes());
        slot[16..18].copy_from_slice(&date.to_le_bytes());
        slot[18..20].copy_from_slice(&date.to_le_bytes());
        slot[22..24].copy_from_slice(&time.to_le_bytes());
        slot[24..26].copy_from_slice(&date.to_le_bytes());
        slot[20..22].copy_from_slice(&((first_cluster >> 16) as u16).to_le_bytes());
        slot[26..28].copy_from_slice(&(first_cluster as u16).to_le_bytes());
        slot[28..32].copy_from_slice(&size.to_le_bytes());
        slot
    }

    fn build_exfat_set(
        upcase: &UpcaseTable,
        name: &str,
        attrs16: u16,
        first_cluster: u32,
        size: u64,
        no_fat_chain: bool,
    ) -> Vec<[u8; SLOT_SIZE]> {
        let units: Vec<u16> = name.encode_utf16().collect();
        let name_slots = units.len().div_ceil(EXFAT_CHARS_PER_SLOT);
        let secondary = 1 + name_slots;

        let mut file = [0u8; SLOT_SIZE];
        file[0] = EXFAT_TYPE_FILE;
        file[1] = secondary as u8;
        file[4..6].copy_from_slice(&attrs16.to_le_bytes());
        let ts = now_exfat_datetime();
        file[8..12].copy_from_slice(&ts.to_le_bytes());
        file[12..16].copy_from_slice(&ts.to_le_bytes());
        file[16..20].copy_from_slice(&ts.to_le_bytes());

        let mut stream = [0u8; SLOT_SIZE];
        stream[0] = EXFAT_TYPE_STREAM;
        stream[1] = EXFAT_FLAG_ALLOC_POSSIBLE
            | if no_fat_chain { EXFAT_FLAG_NO_FAT_CHAIN } else { 0 };
        stream[3] = units.len() as u8;
        let hash = exfat_name_hash(&upcase.upcase_utf16(&units));
        stream[4..6].copy_from_slice(&hash.to_le_bytes());
        stream[8..16].copy_from_slice(&size.to_le_bytes());
        stream[20..24].copy_from_slice(&first_cluster.to_le_bytes());
        stream[24..32].copy_from_slice(&size.to_le_bytes());

        let mut set = vec![file, stream];
        for chunk in units.chunks(EXFAT_CHARS_PER_SLOT) {
            let mut ne = [0u8; SLOT_SIZE];
            ne[0] = EXFAT_TYPE_NAME;
            for (j, &u) in chunk.iter().enumerate() {
                ne[2 + j * 2..4 + j * 2].copy_from_slice(&u.to_le_bytes());
            }
            set.push(ne);
        }
        // Seal the set with its checksum.
        let flat: Vec<u8> = set.concat();
        let checksum = exfat_set_checksum(&flat);
        set[0][2..4].copy_from_slice(&checksum.to_le_bytes());
        set
    }

    /// Creates a new entry. The caller passes the already-allocated first
    /// cluster (or 0 for an empty file).
    pub fn create<D: BlockContainer>(
        &mut self,
        ctx: &mut DirCtx<'_, D>,
        name: &str,
        attrs: u8,
        first_cluster: u32,
        size: u64,
        no_fat_chain: bool,
    ) -> Result<ParsedEntry> {
        ctx.check_writable()?;
        names::validate_long_name(name)?;
        if self.find(ctx.upcase, name).is_some() {
            return Err(Error::AlreadyExists(name.into()));
        }
        let group: Vec<[u8; SLOT_SIZE]> = if self.kind == FatKind::ExFat {
            Self::build_exfat_set(ctx.upcase, name, attrs as u16, first_cluster, size, no_fat_chain)
        } else {
            let upper = ctx.upcase.upcase_str(name);
            let short_raw = names::gen_short_name(name, |c| self.by_short.contains_key(c))?;
            let mut group = if names::fits_short_name(&upper) && upper == name {
                Vec::new()
            } else {
                build_lfn_slots(name, &short_raw)
            };
            group.push(Self::build_fat_short_entry(
                &short_raw,
                attrs,
                first_cluster,
                size as u32,
            ));
            group
        };
        let start = self.alloc_slots(ctx, group.len())?;
        for (k, slot) in group.iter().enumerate() {
            self.write_slot(ctx, start + k, *slot)?;
        }
        self.rebuild(ctx.upcase);
        debug!("created '{}' in {} slot(s) at {}", name, group.len(), start);
        Ok(self
            .find(ctx.upcase, name)
            .expect("entry just created")
            .clone())
    }

    /// Marks an entry's slots free and releases its cluster chain.
    pub fn remove<D: BlockContainer>(&mut self, ctx: &mut DirCtx<'_, D>, name: &str) -> Result<()> {
        ctx.check_writable()?;
        let entry = self
            .find(ctx.upcase, name)
            .ok_or_else(|| Error::NotFound(name.into()))?
            .clone();
        self.erase_group(ctx, &entry)?;
        if entry.first_cluster != 0 {
            if entry.no_fat_chain {
                let cb = ctx.geo.cluster_bytes as u64;
                let count = entry.size.max(1).div_ceil(cb) as u32;
                ctx.fat.free_run(ctx.disk, entry.first_cluster, count)?;
            } else {
                ctx.fat.free_chain(ctx.disk, entry.first_cluster)?;
            }
        }
        self.rebuild(ctx.upcase);
        Ok(())
    }

    fn erase_group<D: BlockContainer>(
        &mut self,
        ctx: &mut DirCtx<'_, D>,
        entry: &ParsedEntry,
    ) -> Result<()> {
        for k in entry.slot_start..entry.slot_start + entry.slot_count {
            let mut slot = self.slots[k];
            if self.kind == FatKind::ExFat {
                slot[0] &= 0x7F; // clear InUse
            } else {
                slot[0] = SLOT_FREE;
            }
            self.write_slot(ctx, k, slot)?;
        }
        Ok(())
    }

    /// Renames in place when the new name needs no more slots than the
    /// old; otherwise writes a new group and erases the old one.
    pub fn rename<D: BlockContainer>(
        &mut self,
        ctx: &mut DirCtx<'_, D>,
        old: &str,
        new: &str,
    ) -> Result<()> {
        ctx.check_writable()?;
        names::validate_long_name(new)?;
        let entry = self
            .find(ctx.upcase, old)
            .ok_or_else(|| Error::NotFound(old.into()))?
            .clone();
        if self.find(ctx.upcase, new).is_some() {
            return Err(Error::AlreadyExists(new.into()));
        }
        let group: Vec<[u8; SLOT_SIZE]> = if self.kind == FatKind::ExFat {
            let attrs16 = entry.attrs as u16;
            let mut set = Self::build_exfat_set(
                ctx.upcase,
                new,
                attrs16,
                entry.first_cluster,
                entry.size,
                entry.no_fat_chain,
            );
            // Carry the stream flags and valid data length over.
            set[1][8..16].copy_from_slice(&entry.valid_data_len.to_le_bytes());
            let flat: Vec<u8> = set.concat();
            let checksum = exfat_set_checksum(&flat);
            set[0][2..4].copy_from_slice(&checksum.to_le_bytes());
            set
        } else {
            let short_raw = names::gen_short_name(new, |c| {
                self.by_short.contains_key(c) && c != &entry.short_raw
            })?;
            let upper = ctx.upcase.upcase_str(new);
            let mut group = if names::fits_short_name(&upper) && upper == new {
                Vec::new()
            } else {
                build_lfn_slots(new, &short_raw)
            };
            let mut short = self.slots[entry.slot_start + entry.slot_count - 1];
            short[0..11].copy_from_slice(&short_raw);
            group.push(short);
            group
        };
        if group.len() <= entry.slot_count {
            // In-place: overwrite the head of the old group, erase the rest.
            for (k, slot) in group.iter().enumerate() {
                self.write_slot(ctx, entry.slot_start + k, *slot)?;
            }
            for k in entry.slot_start + group.len()..entry.slot_start + entry.slot_count {
                let mut slot = self.slots[k];
                if self.kind == FatKind::ExFat {
                    slot[0] &= 0x7F;
                } else {
                    slot[0] = SLOT_FREE;
                }
                self.write_slot(ctx, k, slot)?;
            }
        } else {
            let start = self.alloc_slots(ctx, group.len())?;
            for (k, slot) in group.iter().enumerate() {
                self.write_slot(ctx, start + k, *slot)?;
            }
            self.erase_group(ctx, &entry)?;
        }
        self.rebuild(ctx.upcase);
        Ok(())
    }

    /// Updates the metadata of an existing entry's group (size, first
    /// cluster, timestamps, exFAT stream fields) after file I/O.
    pub fn update_entry<D: BlockContainer>(
        &mut self,
        ctx: &mut DirCtx<'_, D>,
        name: &str,
        first_cluster: u32,
        size: u64,
        valid_data_len: u64,
        no_fat_chain: bool,
    ) -> Result<()> {
        ctx.check_writable()?;
        let entry = self
            .find(ctx.upcase, name)
            .ok_or_else(|| Error::NotFound(name.into()))?
            .clone();
        if self.kind == FatKind::ExFat {
            let start = entry.slot_start;
            let count = entry.slot_count;
            let mut file = self.slots[start];
            let ts = now_exfat_datetime();
            file[12..16].copy_from_slice(&ts.to_le_bytes());
            self.slots[start] = file;
            let mut stream = self.slots[start + 1];
            stream[1] = EXFAT_FLAG_ALLOC_POSSIBLE
                | if no_fat_chain { EXFAT_FLAG_NO_FAT_CHAIN } else { 0 };
            stream[8..16].copy_from_slice(&valid_data_len.to_le_bytes());
            stream[20..24].copy_from_slice(&first_cluster.to_le_bytes());
            stream[24..32].copy_from_slice(&size.to_le_bytes());
            self.slots[start + 1] = stream;
            let flat: Vec<u8> = self.slots[start..start + count].concat();
            let checksum = exfat_set_checksum(&flat);
            let mut file = self.slots[start];
            file[2..4].copy_from_slice(&checksum.to_le_bytes());
            for k in start..start + count {
                let slot = self.slots[k];
                let fixed = if k == start { file } else { slot };
                self.write_slot(ctx, k, fixed)?;
            }
        } else {
            let at = entry.slot_start + entry.slot_count - 1;
            let mut slot = self.slots[at];
            let (date, time) = now_fat_datetime();
            slot[22..24].copy_from_slice(&time.to_le_bytes());
            slot[24..26].copy_from_slice(&date.to_le_bytes());
            slot[20..22].copy_from_slice(&((first_cluster >> 16) as u16).to_le_bytes());
            slot[26..28].copy_from_slice(&(first_cluster as u16).to_le_bytes());
            slot[28..32].copy_from_slice(&(size as u32).to_le_bytes());
            self.write_slot(ctx, at, slot)?;
        }
        self.rebuild(ctx.upcase);
        Ok(())
    }

    /// Writes or replaces the volume label entry (root table only).
    pub fn set_label<D: BlockContainer>(
        &mut self,
        ctx: &mut DirCtx<'_, D>,
        text: &str,
    ) -> Result<()> {
        ctx.check_writable()?;
        let slot_index = match self.label {
            Some((at, _)) => at,
            None => self.alloc_slots(ctx, 1)?,
        };
        let mut slot = [0u8; SLOT_SIZE];
        if self.kind == FatKind::ExFat {
            let units: Vec<u16> = text.encode_utf16().take(11).collect();
            slot[0] = EXFAT_TYPE_LABEL;
            slot[1] = units.len() as u8;
            for (i, u) in units.iter().enumerate() {
                slot[2 + i * 2..4 + i * 2].copy_from_slice(&u.to_le_bytes());
            }
        } else {
            let mut raw = [0x20u8; 11];
            for (i, b) in text.to_uppercase().bytes().take(11).enumerate() {
                raw[i] = b;
            }
            slot[0..11].copy_from_slice(&raw);
            slot[11] = ATTR_VOLUME_ID;
            let (date, time) = now_fat_datetime();
            slot[22..24].copy_from_slice(&time.to_le_bytes());
            slot[24..26].copy_from_slice(&date.to_le_bytes());
        }
        self.write_slot(ctx, slot_index, slot)?;
        self.rebuild(ctx.upcase);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sort and shrink
    // ------------------------------------------------------------------

    /// Stable in-place sort of the live entries. Orphan and deleted
    /// slots are dropped; pinned system/dot slots keep their positions.
    /// The table is buffered, reordered in memory, and rewritten to the
    /// same clusters; the tail is zeroed.
    pub fn sort<D, K>(&mut self, ctx: &mut DirCtx<'_, D>, mut key: K) -> Result<()>
    where
        D: BlockContainer,
        K: FnMut(&ParsedEntry) -> String,
    {
        ctx.check_writable()?;
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        order.sort_by_key(|&i| key(&self.entries[i]));
        self.write_in_order(ctx, &order)
    }

    /// Rewrites entries in the order given by an explicit name list;
    /// names absent from the list keep their relative order at the end.
    pub fn sort_by_names<D: BlockContainer>(
        &mut self,
        ctx: &mut DirCtx<'_, D>,
        names_first: &[&str],
    ) -> Result<()> {
        ctx.check_writable()?;
        let rank = |e: &ParsedEntry| {
            let upper = ctx.upcase.upcase_str(&e.name);
            names_first
                .iter()
                .position(|n| ctx.upcase.upcase_str(n) == upper)
                .unwrap_or(usize::MAX)
        };
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        order.sort_by_key(|&i| (rank(&self.entries[i]), i));
        self.write_in_order(ctx, &order)
    }

    fn write_in_order<D: BlockContainer>(
        &mut self,
        ctx: &mut DirCtx<'_, D>,
        order: &[usize],
    ) -> Result<()> {
        // Gather the label slot (FAT keeps it at the front by custom)
        // and every live group, then lay them out after the pinned
        // prefix.
        let mut rewritten: Vec<[u8; SLOT_SIZE]> =
            self.slots[..self.pinned_prefix].to_vec();
        if let Some((at, _)) = self.label {
            if at >= self.pinned_prefix {
                rewritten.push(self.slots[at]);
            }
        }
        for &i in order {
            let e = &self.entries[i];
            rewritten.extend_from_slice(&self.slots[e.slot_start..e.slot_start + e.slot_count]);
        }
        if rewritten.len() > self.slots.len() {
            return Err(Error::InconsistentFs(
                "directory rewrite grew beyond its table".into(),
            ));
        }
        for k in 0..self.slots.len() {
            let data = rewritten.get(k).copied().unwrap_or([0u8; SLOT_SIZE]);
            if data != self.slots[k] {
                self.write_slot(ctx, k, data)?;
            }
        }
        self.rebuild(ctx.upcase);
        Ok(())
    }

    /// Releases trailing all-free clusters back to the FAT.
    pub fn shrink<D: BlockContainer>(&mut self, ctx: &mut DirCtx<'_, D>) -> Result<u32> {
        ctx.check_writable()?;
        let DirLocation::Chain { .. } = self.location else {
            return Ok(0);
        };
        let per_cluster = ctx.geo.cluster_bytes as usize / SLOT_SIZE;
        let used = |slot: &[u8; SLOT_SIZE]| {
            slot[0] != SLOT_END
                && slot[0] != SLOT_FREE
                && !(self.kind == FatKind::ExFat && slot[0] & 0x80 == 0)
        };
        let mut keep_clusters = self.clusters.len();
        while keep_clusters > 1 {
            let start = (keep_clusters - 1) * per_cluster;
            if self.slots[start..start + per_cluster].iter().any(used) {
                break;
            }
            keep_clusters -= 1;
        }
        let drop = self.clusters.len() - keep_clusters;
        if drop == 0 {
            return Ok(0);
        }
        let tail_start = self.clusters[keep_clusters];
        ctx.fat.set(
            ctx.disk,
            self.clusters[keep_clusters - 1],
            ctx.geo.kind.eoc(),
        )?;
        // The tail is a valid chain of its own now; release it.
        ctx.fat.free_chain(ctx.disk, tail_start)?;
        self.clusters.truncate(keep_clusters);
        self.slots.truncate(keep_clusters * per_cluster);
        self.rebuild(ctx.upcase);
        debug!("shrank directory by {} cluster(s)", drop);
        Ok(drop as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fat_short_entry_layout() {
        let slot = DirTable::build_fat_short_entry(b"HELLO   TXT", ATTR_ARCHIVE, 0x12345, 6);
        assert_eq!(&slot[0..11], b"HELLO   TXT");
        assert_eq!(slot[11], ATTR_ARCHIVE);
        assert_eq!(u16::from_le_bytes([slot[20], slot[21]]), 0x0001);
        assert_eq!(u16::from_le_bytes([slot[26], slot[27]]), 0x2345);
        assert_eq!(u32::from_le_bytes(slot[28..32].try_into().unwrap()), 6);
    }

    #[test]
    fn test_exfat_set_shape() {
        let upcase = UpcaseTable::default_ascii();
        let set = DirTable::build_exfat_set(&upcase, "a.txt", 0x20, 5, 100, true);
        assert_eq!(set.len(), 3); // file + stream + 1 name slot
        assert_eq!(set[0][0], EXFAT_TYPE_FILE);
        assert_eq!(set[0][1], 2);
        assert_eq!(set[1][0], EXFAT_TYPE_STREAM);
        assert_ne!(set[1][1] & EXFAT_FLAG_NO_FAT_CHAIN, 0);
        assert_eq!(set[2][0], EXFAT_TYPE_NAME);
        // Checksum must verify over the flattened set.
        let flat: Vec<u8> = set.concat();
        let stored = u16::from_le_bytes([flat[2], flat[3]]);
        assert_eq!(stored, exfat_set_checksum(&flat));
    }

    #[test]
    fn test_exfat_set_name_slots() {
        let upcase = UpcaseTable::default_ascii();
        let name = "a name exactly 16";
        assert_eq!(name.encode_utf16().count(), 17);
        let set = DirTable::build_exfat_set(&upcase, name, 0x20, 0, 0, false);
        assert_eq!(set.len(), 4); // 17 chars -> 2 name slots
    }
}
