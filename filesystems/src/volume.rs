// Volume composition: mounts a recognized FAT/exFAT filesystem over a
// container stack and exposes path-level operations.
//
// The volume owns the sector cache and the FAT state; directory tables
// and file handles borrow them for the duration of an operation. All
// paths are '/'-separated and resolved from the root.

use std::path::Path;

use log::{info, warn};
use serde::Serialize;

use fathom_core::{
    BlockContainer, Control, Error, NoProgress, OpenMode, ProgressSink, Result,
};
use fathom_disks::{open_image, PartitionTable, PartitionView, SectorCache};

use crate::detection::detect_filesystem;
use crate::fat::boot_sector::{build_fsinfo, check_exfat_boot_region, FatGeometry};
use crate::fat::dir::{
    DirCtx, DirLocation, DirTable, ParsedEntry, ATTR_ARCHIVE, ATTR_DIRECTORY,
};
use crate::fat::file::File;
use crate::fat::names::UpcaseTable;
use crate::fat::table::FatTable;
use crate::fat::FatKind;

pub(crate) type Disk = SectorCache<Box<dyn BlockContainer>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
    ReadWrite,
}

#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    /// Mount read-only even on a writable container.
    pub read_only: bool,
    /// Downgrade recoverable inconsistencies (FAT mirror mismatch) to a
    /// read-only mount instead of failing.
    pub allow_inconsistent: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct VolumeInfo {
    pub fs_type: String,
    pub label: Option<String>,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub cluster_bytes: u32,
    pub serial: u32,
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub first_cluster: u32,
    pub attrs: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileFragmentation {
    pub path: String,
    pub clusters: u32,
    pub extents: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct FragmentationReport {
    pub files: Vec<FileFragmentation>,
    pub total_files: u32,
    pub total_extents: u32,
    /// Average extra extents per file; 0.0 means fully contiguous.
    pub ratio: f64,
}

pub struct Volume {
    pub(crate) disk: Disk,
    pub(crate) geo: FatGeometry,
    pub(crate) fat: FatTable,
    pub(crate) upcase: UpcaseTable,
    pub(crate) read_only: bool,
}

impl Volume {
    // ------------------------------------------------------------------
    // Mounting
    // ------------------------------------------------------------------

    pub fn mount(container: Box<dyn BlockContainer>) -> Result<Self> {
        Self::mount_with(container, &MountOptions::default())
    }

    pub fn mount_with(
        container: Box<dyn BlockContainer>,
        options: &MountOptions,
    ) -> Result<Self> {
        let mut read_only = options.read_only || container.is_read_only();
        let mut disk = SectorCache::new(container);
        let geo = detect_filesystem(&mut disk)?;
        let mut fat = FatTable::new(&geo);
        let mut upcase = UpcaseTable::default_ascii();

        if geo.kind == FatKind::ExFat {
            check_exfat_boot_region(&mut disk, &geo)?;
            // The bitmap and upcase table are root-directory entries, so
            // the root is scanned before free space exists.
            let mut ctx = DirCtx {
                disk: &mut disk,
                fat: &mut fat,
                geo: &geo,
                upcase: &upcase,
                read_only: true,
            };
            let root = DirTable::load(
                &mut ctx,
                DirLocation::Chain {
                    first_cluster: geo.root_cluster,
                },
            )?;
            let system = root.system_entries();
            if system.bitmap_cluster == 0 {
                return Err(Error::InconsistentFs(
                    "exFAT volume has no allocation bitmap entry".into(),
                ));
            }
            fat.load_exfat_bitmap(&mut disk, &geo, system.bitmap_cluster, system.bitmap_bytes)?;
            if system.upcase_cluster != 0 {
                let mut raw = vec![0u8; system.upcase_bytes as usize];
                disk.read_at(geo.cluster_offset(system.upcase_cluster), &mut raw)?;
                upcase = UpcaseTable::from_disk(&raw)?;
            }
        } else {
            if let Err(e) = fat.verify_mirrors(&mut disk) {
                if options.allow_inconsistent {
                    warn!("mounting read-only: {}", e);
                    read_only = true;
                } else {
                    return Err(e);
                }
            }
            // FSInfo is advisory; the scan is authoritative.
            fat.scan_free(&mut disk, &geo)?;
        }
        info!(
            "mounted {} volume ({} bytes free of {})",
            geo.kind.name(),
            fat.free_clusters() * geo.cluster_bytes as u64,
            geo.cluster_count as u64 * geo.cluster_bytes as u64
        );
        Ok(Self {
            disk,
            geo,
            fat,
            upcase,
            read_only,
        })
    }

    /// Opens a disk image file (any supported format), finds the first
    /// partition if the container is partitioned, and mounts the volume.
    pub fn open_path<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self> {
        let mut image = open_image(&path, mode, 512)?;
        // A bare filesystem wins over whatever the boot-code area of its
        // VBR happens to look like as an MBR.
        let mut sector0 = vec![0u8; image.sector_size() as usize];
        image.read_at(0, &mut sector0)?;
        if crate::detection::probe(&sector0).is_some() {
            return Self::mount(image);
        }
        let container: Box<dyn BlockContainer> = match PartitionTable::read(&mut image) {
            Ok(table) if !table.entries.is_empty() => {
                Box::new(PartitionView::new(image, &table.entries[0]))
            }
            _ => image,
        };
        Self::mount(container)
    }

    pub fn geometry(&self) -> &FatGeometry {
        &self.geo
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Raw byte access to the mounted container through the cache; meant
    /// for consistency checks and diagnostics, not file I/O.
    pub fn read_raw(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.disk.read_at(offset, buf)
    }

    // ------------------------------------------------------------------
    // Path plumbing
    // ------------------------------------------------------------------

    fn root_location(&self) -> DirLocation {
        match self.geo.kind {
            FatKind::Fat12 | FatKind::Fat16 => DirLocation::FixedRoot,
            _ => DirLocation::Chain {
                first_cluster: self.geo.root_cluster,
            },
        }
    }

    fn entry_dir_location(&self, entry: &ParsedEntry) -> DirLocation {
        if entry.no_fat_chain {
            let cb = self.geo.cluster_bytes as u64;
            DirLocation::Extent {
                first_cluster: entry.first_cluster,
                clusters: entry.size.max(cb).div_ceil(cb) as u32,
            }
        } else {
            DirLocation::Chain {
                first_cluster: entry.first_cluster,
            }
        }
    }

    fn components(path: &str) -> Vec<&str> {
        path.split('/').filter(|c| !c.is_empty()).collect()
    }

    fn ctx(&mut self) -> DirCtx<'_, Disk> {
        DirCtx {
            disk: &mut self.disk,
            fat: &mut self.fat,
            geo: &self.geo,
            upcase: &self.upcase,
            read_only: self.read_only,
        }
    }

    /// Resolves a directory path, returning its location and its parent
    /// (location, entry name) when it is not the root.
    fn resolve_dir(&mut self, path: &str) -> Result<(DirLocation, Option<(DirLocation, String)>)> {
        let mut location = self.root_location();
        let mut parent = None;
        for part in Self::components(path) {
            let entry = {
                let loc = location;
                let mut ctx = self.ctx();
                let table = DirTable::load(&mut ctx, loc)?;
                table
                    .find(ctx.upcase, part)
                    .ok_or_else(|| Error::NotFound(path.into()))?
                    .clone()
            };
            if !entry.is_dir {
                return Err(Error::NotFound(format!("{}: not a directory", path)));
            }
            parent = Some((location, entry.name.clone()));
            location = self.entry_dir_location(&entry);
        }
        Ok((location, parent))
    }

    /// Splits a file path into its parent directory location and leaf
    /// name.
    fn resolve_parent(&mut self, path: &str) -> Result<(DirLocation, String)> {
        let mut parts = Self::components(path);
        let leaf = parts
            .pop()
            .ok_or_else(|| Error::InvalidName("empty path".into()))?
            .to_string();
        let dir_path = parts.join("/");
        let (location, _) = self.resolve_dir(&dir_path)?;
        Ok((location, leaf))
    }

    /// Runs an operation against a directory table, then propagates any
    /// table growth or relocation into the parent's entry (exFAT records
    /// directory sizes in the Stream Extension; FAT does not).
    fn with_dir<R>(
        &mut self,
        path: &str,
        op: impl FnOnce(&mut DirTable, &mut DirCtx<'_, Disk>) -> Result<R>,
    ) -> Result<R> {
        let (location, parent) = self.resolve_dir(path)?;
        let mut ctx = self.ctx();
        let mut table = DirTable::load(&mut ctx, location)?;
        let clusters_before = table.cluster_len();
        let out = op(&mut table, &mut ctx)?;
        let clusters_after = table.cluster_len();
        let location_after = table.location;
        drop(table);
        drop(ctx);
        if self.geo.kind == FatKind::ExFat && clusters_after != clusters_before {
            if let Some((parent_loc, dir_name)) = parent {
                let cb = self.geo.cluster_bytes as u64;
                let size = clusters_after as u64 * cb;
                let (first, no_chain) = match location_after {
                    DirLocation::Extent { first_cluster, .. } => (first_cluster, true),
                    DirLocation::Chain { first_cluster } => (first_cluster, false),
                    DirLocation::FixedRoot => unreachable!("exFAT has no fixed root"),
                };
                let mut ctx = self.ctx();
                let mut parent_table = DirTable::load(&mut ctx, parent_loc)?;
                parent_table.update_entry(&mut ctx, &dir_name, first, size, size, no_chain)?;
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Listing and file I/O
    // ------------------------------------------------------------------

    pub fn ls(&mut self, path: &str) -> Result<Vec<DirEntryInfo>> {
        let (location, _) = self.resolve_dir(path)?;
        let mut ctx = self.ctx();
        let table = DirTable::load(&mut ctx, location)?;
        Ok(table
            .entries()
            .iter()
            .map(|e| DirEntryInfo {
                name: e.name.clone(),
                is_dir: e.is_dir,
                size: e.size,
                first_cluster: e.first_cluster,
                attrs: e.attrs,
            })
            .collect())
    }

    pub fn open(&mut self, path: &str, mode: FileMode) -> Result<File<'_>> {
        if mode != FileMode::Read && self.read_only {
            return Err(Error::ReadOnly);
        }
        let (parent_loc, leaf) = self.resolve_parent(path)?;
        let entry = {
            let mut ctx = DirCtx {
                disk: &mut self.disk,
                fat: &mut self.fat,
                geo: &self.geo,
                upcase: &self.upcase,
                read_only: self.read_only,
            };
            let table = DirTable::load(&mut ctx, parent_loc)?;
            table
                .find(ctx.upcase, &leaf)
                .ok_or_else(|| Error::NotFound(path.into()))?
                .clone()
        };
        if entry.is_dir {
            return Err(Error::NotFound(format!("{}: is a directory", path)));
        }
        let chain = if entry.first_cluster == 0 {
            Vec::new()
        } else if entry.no_fat_chain {
            let cb = self.geo.cluster_bytes as u64;
            let count = entry.size.max(1).div_ceil(cb) as u32;
            (entry.first_cluster..entry.first_cluster + count).collect()
        } else {
            self.fat.chain(&mut self.disk, entry.first_cluster)?
        };
        Ok(File {
            vol: self,
            parent: parent_loc,
            name: entry.name.clone(),
            mode,
            first_cluster: entry.first_cluster,
            size: entry.size,
            pos: 0,
            dirty: false,
            no_fat_chain: entry.no_fat_chain,
            chain,
            closed: false,
        })
    }

    /// Creates an empty file and returns a writable handle. Fails when
    /// the name exists.
    pub fn create(&mut self, path: &str) -> Result<File<'_>> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let mut parts = Self::components(path);
        let leaf = parts
            .pop()
            .ok_or_else(|| Error::InvalidName("empty path".into()))?
            .to_string();
        let dir_path = parts.join("/");
        self.with_dir(&dir_path, |table, ctx| {
            table.create(ctx, &leaf, ATTR_ARCHIVE, 0, 0, false)?;
            Ok(())
        })?;
        self.open(path, FileMode::ReadWrite)
    }

    /// Reads a whole file (the `cat` operation).
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let mut file = self.open(path, FileMode::Read)?;
        let mut data = vec![0u8; file.size() as usize];
        let got = file.read(&mut data)?;
        data.truncate(got);
        file.close()?;
        Ok(data)
    }

    /// Creates or replaces a file with the given contents.
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        let exists = {
            let (parent_loc, leaf) = self.resolve_parent(path)?;
            let mut ctx = self.ctx();
            let table = DirTable::load(&mut ctx, parent_loc)?;
            table.find(ctx.upcase, &leaf).is_some()
        };
        let mut file = if exists {
            let mut f = self.open(path, FileMode::ReadWrite)?;
            f.truncate(0)?;
            f
        } else {
            self.create(path)?
        };
        file.write(data)?;
        file.close()
    }

    pub fn remove(&mut self, path: &str) -> Result<()> {
        let (_, leaf) = self.resolve_parent(path)?;
        let dir_path = {
            let mut parts = Self::components(path);
            parts.pop();
            parts.join("/")
        };
        // Directories must be empty before their entry goes away.
        let (parent_loc, _) = self.resolve_dir(&dir_path)?;
        let entry_is_dir = {
            let mut ctx = self.ctx();
            let table = DirTable::load(&mut ctx, parent_loc)?;
            let entry = table
                .find(ctx.upcase, &leaf)
                .ok_or_else(|| Error::NotFound(path.into()))?;
            entry.is_dir
        };
        if entry_is_dir {
            let children = self.ls(path)?;
            if !children.is_empty() {
                return Err(Error::NotSupported(format!(
                    "{}: directory not empty",
                    path
                )));
            }
        }
        self.with_dir(&dir_path, |table, ctx| table.remove(ctx, &leaf))
    }

    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let (_, leaf) = self.resolve_parent(path)?;
        let dir_path = {
            let mut parts = Self::components(path);
            parts.pop();
            parts.join("/")
        };
        let (parent_loc, _) = self.resolve_dir(&dir_path)?;
        // One zeroed cluster holds the new table.
        let clusters = self.fat.alloc(&mut self.disk, 1, None, true)?;
        let first = clusters[0];
        let zeros = vec![0u8; self.geo.cluster_bytes as usize];
        self.disk.write_at(self.geo.cluster_offset(first), &zeros)?;
        if self.geo.kind != FatKind::ExFat {
            // Classic FAT subdirectories start with the dot entries.
            let parent_cluster = match parent_loc {
                DirLocation::FixedRoot => 0,
                DirLocation::Chain { first_cluster } => first_cluster,
                DirLocation::Extent { first_cluster, .. } => first_cluster,
            };
            let mut dot = [0u8; 32];
            dot[0..11].copy_from_slice(b".          ");
            dot[11] = ATTR_DIRECTORY;
            dot[26..28].copy_from_slice(&(first as u16).to_le_bytes());
            dot[20..22].copy_from_slice(&((first >> 16) as u16).to_le_bytes());
            let mut dotdot = [0u8; 32];
            dotdot[0..11].copy_from_slice(b"..         ");
            dotdot[11] = ATTR_DIRECTORY;
            dotdot[26..28].copy_from_slice(&(parent_cluster as u16).to_le_bytes());
            dotdot[20..22].copy_from_slice(&((parent_cluster >> 16) as u16).to_le_bytes());
            let base = self.geo.cluster_offset(first);
            self.disk.write_at(base, &dot)?;
            self.disk.write_at(base + 32, &dotdot)?;
        }
        let dir_size = if self.geo.kind == FatKind::ExFat {
            self.geo.cluster_bytes as u64
        } else {
            0
        };
        let created = self.with_dir(&dir_path, |table, ctx| {
            table.create(ctx, &leaf, ATTR_DIRECTORY, first, dir_size, false)?;
            Ok(())
        });
        if let Err(e) = created {
            // Roll the cluster back so no orphan chain survives.
            let _ = self.fat.free_chain(&mut self.disk, first);
            return Err(e);
        }
        Ok(())
    }

    pub fn rename(&mut self, path: &str, new_name: &str) -> Result<()> {
        let (_, leaf) = self.resolve_parent(path)?;
        let dir_path = {
            let mut parts = Self::components(path);
            parts.pop();
            parts.join("/")
        };
        self.with_dir(&dir_path, |table, ctx| table.rename(ctx, &leaf, new_name))
    }

    // ------------------------------------------------------------------
    // Bulk operations
    // ------------------------------------------------------------------

    /// Stable sort of a directory by uppercased name (the default key).
    pub fn sort(&mut self, path: &str) -> Result<()> {
        self.with_dir(path, |table, ctx| {
            let upcase = ctx.upcase;
            table.sort(ctx, |e| upcase.upcase_str(&e.name))
        })
    }

    /// Sort with a caller-supplied key over entry metadata.
    pub fn sort_by<K>(&mut self, path: &str, key: K) -> Result<()>
    where
        K: FnMut(&ParsedEntry) -> String,
    {
        self.with_dir(path, |table, ctx| table.sort(ctx, key))
    }

    /// Reorders a directory to match an explicit name list.
    pub fn sort_names(&mut self, path: &str, names_first: &[&str]) -> Result<()> {
        self.with_dir(path, |table, ctx| table.sort_by_names(ctx, names_first))
    }

    /// Releases trailing all-free directory clusters.
    pub fn shrink_dir(&mut self, path: &str) -> Result<u32> {
        self.with_dir(path, |table, ctx| table.shrink(ctx))
    }

    /// Overwrites every free cluster with zeros, walking the free-map
    /// runs so allocated data is never touched.
    pub fn wipe<P: ProgressSink + ?Sized>(&mut self, progress: &mut P) -> Result<u64> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let runs: Vec<(u32, u32)> = self.fat.free_map().iter().collect();
        let total: u64 = runs.iter().map(|&(_, l)| l as u64).sum();
        let zeros = vec![0u8; self.geo.cluster_bytes as usize];
        let mut done = 0u64;
        for (start, len) in runs {
            for cluster in start..start + len {
                self.disk
                    .write_at(self.geo.cluster_offset(cluster), &zeros)?;
                done += 1;
                if progress.tick(done, total) == Control::Cancel {
                    self.disk.flush()?;
                    return Err(Error::Cancelled);
                }
            }
        }
        self.disk.flush()?;
        info!("wiped {} free cluster(s)", done);
        Ok(done)
    }

    /// Per-file extent counts plus an overall ratio (average extra
    /// extents per file; 0.0 = fully contiguous).
    pub fn fragmentation_report(&mut self) -> Result<FragmentationReport> {
        let mut files = Vec::new();
        self.walk_fragmentation("", &mut files)?;
        let total_files = files.len() as u32;
        let total_extents: u32 = files.iter().map(|f| f.extents).sum();
        let ratio = if total_files == 0 {
            0.0
        } else {
            (total_extents - total_files) as f64 / total_files as f64
        };
        Ok(FragmentationReport {
            files,
            total_files,
            total_extents,
            ratio,
        })
    }

    fn walk_fragmentation(
        &mut self,
        path: &str,
        out: &mut Vec<FileFragmentation>,
    ) -> Result<()> {
        for entry in self.ls(path)? {
            let child = if path.is_empty() {
                format!("/{}", entry.name)
            } else {
                format!("{}/{}", path, entry.name)
            };
            if entry.is_dir {
                self.walk_fragmentation(&child, out)?;
                continue;
            }
            if entry.first_cluster == 0 {
                continue;
            }
            // NoFatChain files are contiguous by definition.
            let parsed = {
                let (parent_loc, leaf) = self.resolve_parent(&child)?;
                let mut ctx = self.ctx();
                let table = DirTable::load(&mut ctx, parent_loc)?;
                table
                    .find(ctx.upcase, &leaf)
                    .ok_or_else(|| Error::NotFound(child.clone()))?
                    .clone()
            };
            let (clusters, extents) = if parsed.no_fat_chain {
                let cb = self.geo.cluster_bytes as u64;
                (parsed.size.max(1).div_ceil(cb) as u32, 1)
            } else {
                let chain = self.fat.chain(&mut self.disk, parsed.first_cluster)?;
                let extents = 1 + chain.windows(2).filter(|w| w[1] != w[0] + 1).count();
                (chain.len() as u32, extents as u32)
            };
            out.push(FileFragmentation {
                path: child,
                clusters,
                extents,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Host copy helpers
    // ------------------------------------------------------------------

    /// Copies a host file into the volume.
    pub fn cp_in<P: AsRef<Path>>(&mut self, host: P, vol_path: &str) -> Result<()> {
        let data = std::fs::read(host)?;
        self.write_file(vol_path, &data)
    }

    /// Copies a volume file out to the host.
    pub fn cp_out<P: AsRef<Path>>(&mut self, vol_path: &str, host: P) -> Result<()> {
        let data = self.read_file(vol_path)?;
        std::fs::write(host, data)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    pub fn label(&mut self) -> Result<Option<String>> {
        let root = self.root_location();
        let mut ctx = self.ctx();
        let table = DirTable::load(&mut ctx, root)?;
        Ok(table.label().map(str::to_string))
    }

    pub fn set_label(&mut self, text: &str) -> Result<()> {
        let root = self.root_location();
        let mut ctx = self.ctx();
        let mut table = DirTable::load(&mut ctx, root)?;
        table.set_label(&mut ctx, text)
    }

    pub fn info(&mut self) -> Result<VolumeInfo> {
        let label = self.label()?;
        Ok(VolumeInfo {
            fs_type: self.geo.kind.name().to_string(),
            label,
            total_bytes: self.geo.cluster_count as u64 * self.geo.cluster_bytes as u64,
            free_bytes: self.fat.free_clusters() * self.geo.cluster_bytes as u64,
            cluster_bytes: self.geo.cluster_bytes,
            serial: self.geo.volume_serial,
            read_only: self.read_only,
        })
    }

    /// Flushes the cache and, for FAT32, rewrites the advisory FSInfo
    /// sector with the rebuilt free count.
    pub fn flush(&mut self) -> Result<()> {
        if self.geo.kind == FatKind::Fat32 && !self.read_only && self.geo.fs_info_sector != 0 {
            let next_free = self
                .fat
                .free_map()
                .iter()
                .next()
                .map(|(s, _)| s)
                .unwrap_or(2);
            let fsinfo = build_fsinfo(
                self.fat.free_clusters() as u32,
                next_free,
                self.geo.bytes_per_sector,
            );
            let at = self.geo.fs_info_sector as u64 * self.geo.bytes_per_sector as u64;
            self.disk.write_at(at, &fsinfo)?;
        }
        self.disk.flush()
    }

    /// Flushes and consumes the volume; the container is released.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    /// Scoped use: mounts, runs `op`, and closes on every path out.
    pub fn with_volume<R>(
        container: Box<dyn BlockContainer>,
        op: impl FnOnce(&mut Volume) -> Result<R>,
    ) -> Result<R> {
        let mut vol = Self::mount(container)?;
        let out = op(&mut vol);
        let closed = vol.close();
        let value = out?;
        closed?;
        Ok(value)
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Convenience wipe without a progress sink.
impl Volume {
    pub fn wipe_all(&mut self) -> Result<u64> {
        self.wipe(&mut NoProgress)
    }
}
