// File handles: a stream positioned over a cluster chain.
//
// Writes past the declared size extend the chain lazily; reads past it
// return nothing. Extension does not zero new clusters, but the unused
// tail of the last cluster is zeroed on close so stale disk content
// never leaks into a later grow. The whole chain is memoized in the
// handle, so sequential I/O costs O(1) FAT lookups per cluster.

use log::debug;

use fathom_core::{BlockContainer, Error, Result};

use crate::fat::dir::{DirCtx, DirLocation, DirTable};
use crate::fat::FatKind;
use crate::volume::{FileMode, Volume};

pub struct File<'v> {
    pub(crate) vol: &'v mut Volume,
    pub(crate) parent: DirLocation,
    pub(crate) name: String,
    pub(crate) mode: FileMode,
    pub(crate) first_cluster: u32,
    pub(crate) size: u64,
    pub(crate) pos: u64,
    pub(crate) dirty: bool,
    pub(crate) no_fat_chain: bool,
    /// Memoized cluster chain in stream order.
    pub(crate) chain: Vec<u32>,
    pub(crate) closed: bool,
}

impl<'v> File<'v> {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    fn cluster_bytes(&self) -> u64 {
        self.vol.geo.cluster_bytes as u64
    }

    fn writable(&self) -> bool {
        matches!(self.mode, FileMode::Write | FileMode::ReadWrite)
    }

    /// Cluster backing stream offset `at`, None when past the chain.
    fn cluster_at(&self, at: u64) -> Option<u32> {
        let index = (at / self.cluster_bytes()) as usize;
        self.chain.get(index).copied()
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pos >= self.size {
            return Ok(0);
        }
        let want = buf.len().min((self.size - self.pos) as usize);
        let cb = self.cluster_bytes();
        let mut done = 0usize;
        while done < want {
            let at = self.pos + done as u64;
            let in_cluster = at % cb;
            let take = ((cb - in_cluster) as usize).min(want - done);
            let cluster = self.cluster_at(at).ok_or_else(|| {
                Error::InconsistentFs(format!(
                    "file '{}' chain shorter than its size",
                    self.name
                ))
            })?;
            let offset = self.vol.geo.cluster_offset(cluster) + in_cluster;
            self.vol.disk.read_at(offset, &mut buf[done..done + take])?;
            done += take;
        }
        self.pos += done as u64;
        Ok(done)
    }

    /// Converts a NoFatChain extent into a real FAT chain.
    fn materialize_chain(&mut self) -> Result<()> {
        if !self.no_fat_chain {
            return Ok(());
        }
        for pair in self.chain.windows(2) {
            self.vol.fat.set(&mut self.vol.disk, pair[0], pair[1])?;
        }
        if let Some(&last) = self.chain.last() {
            self.vol
                .fat
                .set(&mut self.vol.disk, last, FatKind::ExFat.eoc())?;
        }
        self.no_fat_chain = false;
        debug!("materialized FAT chain for '{}'", self.name);
        Ok(())
    }

    /// Ensures the chain covers `total` bytes, allocating lazily.
    fn ensure_clusters(&mut self, total: u64) -> Result<()> {
        let cb = self.cluster_bytes();
        let needed = total.div_ceil(cb) as usize;
        if needed <= self.chain.len() {
            return Ok(());
        }
        let grow = (needed - self.chain.len()) as u32;
        let exfat = self.vol.geo.kind == FatKind::ExFat;
        if self.chain.is_empty() {
            // Fresh allocation. exFAT prefers a contiguous NoFatChain
            // extent and only materializes the FAT when fragmented.
            let clusters = self
                .vol
                .fat
                .alloc(&mut self.vol.disk, grow, None, !exfat)?;
            let contiguous = clusters
                .windows(2)
                .all(|w| w[1] == w[0] + 1);
            if exfat {
                if contiguous {
                    self.no_fat_chain = true;
                } else {
                    // alloc left the FAT untouched; link it now.
                    for pair in clusters.windows(2) {
                        self.vol.fat.set(&mut self.vol.disk, pair[0], pair[1])?;
                    }
                    self.vol.fat.set(
                        &mut self.vol.disk,
                        *clusters.last().unwrap(),
                        FatKind::ExFat.eoc(),
                    )?;
                    self.no_fat_chain = false;
                }
            }
            self.first_cluster = clusters[0];
            self.chain = clusters;
            return Ok(());
        }
        let last = *self.chain.last().unwrap();
        if self.no_fat_chain {
            // Contiguous extension keeps the flag; anything else clears
            // it and materializes the chain.
            let clusters =
                self.vol
                    .fat
                    .alloc(&mut self.vol.disk, grow, Some(last + 1), false)?;
            let contiguous = clusters.first() == Some(&(last + 1))
                && clusters.windows(2).all(|w| w[1] == w[0] + 1);
            if !contiguous {
                self.materialize_chain()?;
                for (prev, &next) in
                    std::iter::once(last).chain(clusters.iter().copied()).zip(clusters.iter())
                {
                    self.vol.fat.set(&mut self.vol.disk, prev, next)?;
                }
                self.vol.fat.set(
                    &mut self.vol.disk,
                    *clusters.last().unwrap(),
                    FatKind::ExFat.eoc(),
                )?;
            }
            self.chain.extend_from_slice(&clusters);
            return Ok(());
        }
        let clusters = self
            .vol
            .fat
            .extend_chain(&mut self.vol.disk, last, grow)?;
        self.chain.extend_from_slice(&clusters);
        Ok(())
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.writable() {
            return Err(Error::ReadOnly);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let end = self.pos + buf.len() as u64;
        self.ensure_clusters(end)?;
        let cb = self.cluster_bytes();
        let mut done = 0usize;
        while done < buf.len() {
            let at = self.pos + done as u64;
            let in_cluster = at % cb;
            let take = ((cb - in_cluster) as usize).min(buf.len() - done);
            let cluster = self.cluster_at(at).expect("chain was just extended");
            let offset = self.vol.geo.cluster_offset(cluster) + in_cluster;
            self.vol.disk.write_at(offset, &buf[done..done + take])?;
            done += take;
        }
        self.pos = end;
        self.size = self.size.max(end);
        self.dirty = true;
        Ok(done)
    }

    /// Truncates or extends to `len` bytes. Extension allocates but does
    /// not zero; shrinking frees the chain tail.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        if !self.writable() {
            return Err(Error::ReadOnly);
        }
        if len == self.size {
            return Ok(());
        }
        let cb = self.cluster_bytes();
        if len > self.size {
            self.ensure_clusters(len)?;
            self.size = len;
            self.dirty = true;
            return Ok(());
        }
        // A NoFatChain extent cut to a ragged length gets a real chain.
        if self.no_fat_chain && len % cb != 0 {
            self.materialize_chain()?;
        }
        let keep = len.div_ceil(cb) as usize;
        if keep < self.chain.len() {
            let dropped: Vec<u32> = self.chain.split_off(keep);
            if self.no_fat_chain {
                self.vol.fat.free_run(
                    &mut self.vol.disk,
                    dropped[0],
                    dropped.len() as u32,
                )?;
            } else {
                if let Some(&last) = self.chain.last() {
                    self.vol
                        .fat
                        .set(&mut self.vol.disk, last, self.vol.geo.kind.eoc())?;
                }
                // The dropped tail still ends in EOC, so it frees as a
                // normal chain.
                self.vol.fat.free_chain(&mut self.vol.disk, dropped[0])?;
            }
        }
        if keep == 0 {
            self.first_cluster = 0;
            self.no_fat_chain = false;
        }
        self.size = len;
        self.dirty = true;
        Ok(())
    }

    /// Zeroes the slack between EOF and the end of the last cluster so
    /// truncate-then-grow cannot resurrect old bytes.
    fn zero_tail(&mut self) -> Result<()> {
        let cb = self.cluster_bytes();
        if self.size == 0 || self.size % cb == 0 {
            return Ok(());
        }
        let Some(&last) = self.chain.last() else {
            return Ok(());
        };
        let used = (self.size % cb) as usize;
        let zeros = vec![0u8; cb as usize - used];
        let offset = self.vol.geo.cluster_offset(last) + used as u64;
        self.vol.disk.write_at(offset, &zeros)
    }

    fn do_close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.dirty && self.writable() {
            self.zero_tail()?;
            let parent = self.parent;
            let mut ctx = DirCtx {
                disk: &mut self.vol.disk,
                fat: &mut self.vol.fat,
                geo: &self.vol.geo,
                upcase: &self.vol.upcase,
                read_only: self.vol.read_only,
            };
            let mut table = DirTable::load(&mut ctx, parent)?;
            table.update_entry(
                &mut ctx,
                &self.name,
                self.first_cluster,
                self.size,
                self.size,
                self.no_fat_chain,
            )?;
        }
        self.vol.disk.flush()
    }

    /// Flushes and writes back the directory entry (size, timestamps,
    /// first cluster, exFAT stream fields).
    pub fn close(mut self) -> Result<()> {
        self.do_close()
    }
}

impl Drop for File<'_> {
    fn drop(&mut self) {
        let _ = self.do_close();
    }
}
