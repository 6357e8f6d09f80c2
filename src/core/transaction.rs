//! Transaction manager and superblock commit
//!
//! A transaction owns the right to mutate the current generation; exactly
//! one may be live per filesystem. It accumulates dirty tree blocks, pending
//! frees, touched roots and freshly allocated chunks, then commits in the
//! fixed order: extent accounting, dirty blocks, barrier, secondary supers,
//! barrier, primary super, barrier. Anything short of the primary write
//! leaves the previous generation intact on disk.

use super::alloc::{self, ExtentRecord};
use super::chunk::{self, ChunkMapping};
use super::ebcache::ExtentBuffer;
use super::roots::{self, Root, RootItem};
use super::superblock;
use super::{FsError, FsInfo, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Rounds the commit fixpoint loop may take before giving up
const MAX_FINALIZE_ROUNDS: usize = 32;

/// A live write transaction
pub struct Transaction {
    fs: Arc<FsInfo>,
    /// Generation every block written by this transaction carries
    pub transid: u64,
    dirty: Mutex<Vec<Arc<ExtentBuffer>>>,
    new_extents: Mutex<Vec<ExtentRecord>>,
    pending_free: Mutex<Vec<(u64, u64)>>,
    touched_roots: Mutex<HashMap<u64, (Arc<Root>, RootItem)>>,
    new_chunks: Mutex<Vec<ChunkMapping>>,
    in_chunk_alloc: AtomicBool,
    done: AtomicBool,
}

impl Transaction {
    /// Starts a transaction; fails with `Invariant` when one is already live
    pub(crate) fn start(fs: Arc<FsInfo>) -> Result<Self> {
        if !fs.is_writable() {
            return Err(FsError::Invariant(
                "filesystem opened read-only".to_string(),
            ));
        }
        if !fs.space.read().is_loaded() {
            return Err(FsError::Invariant(
                "space manager not loaded".to_string(),
            ));
        }
        if fs
            .writer_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(FsError::Invariant(
                "a write transaction is already running".to_string(),
            ));
        }

        let transid = fs.generation() + 1;
        tracing::debug!(transid, "transaction started");
        Ok(Self {
            fs,
            transid,
            dirty: Mutex::new(Vec::new()),
            new_extents: Mutex::new(Vec::new()),
            pending_free: Mutex::new(Vec::new()),
            touched_roots: Mutex::new(HashMap::new()),
            new_chunks: Mutex::new(Vec::new()),
            in_chunk_alloc: AtomicBool::new(false),
            done: AtomicBool::new(false),
        })
    }

    pub fn fs(&self) -> &Arc<FsInfo> {
        &self.fs
    }

    pub(crate) fn track_dirty(&self, eb: Arc<ExtentBuffer>) {
        self.dirty.lock().push(eb);
    }

    pub(crate) fn untrack_dirty(&self, bytenr: u64) {
        self.dirty.lock().retain(|eb| eb.bytenr() != bytenr);
    }

    pub(crate) fn record_new_extent(&self, record: ExtentRecord) {
        self.new_extents.lock().push(record);
    }

    pub(crate) fn take_new_extents(&self) -> Vec<ExtentRecord> {
        std::mem::take(&mut self.new_extents.lock())
    }

    pub(crate) fn record_pending_free(&self, bytenr: u64, len: u64) {
        self.pending_free.lock().push((bytenr, len));
    }

    pub(crate) fn take_pending_frees(&self) -> Vec<(u64, u64)> {
        std::mem::take(&mut self.pending_free.lock())
    }

    pub(crate) fn record_new_chunk(&self, chunk: ChunkMapping) {
        self.new_chunks.lock().push(chunk);
    }

    fn has_pending_accounting(&self) -> bool {
        !self.new_extents.lock().is_empty() || !self.pending_free.lock().is_empty()
    }

    /// Remembers a root whose item changed, keeping the pre-transaction
    /// item for rollback on abort.
    pub(crate) fn track_root(&self, root: &Arc<Root>) -> Result<()> {
        self.touched_roots
            .lock()
            .entry(root.objectid())
            .or_insert_with(|| (root.clone(), root.item()));
        Ok(())
    }

    /// Guards chunk allocation against recursing into itself
    pub(crate) fn enter_chunk_alloc(&self) -> bool {
        self.in_chunk_alloc
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn leave_chunk_alloc(&self) {
        self.in_chunk_alloc.store(false, Ordering::SeqCst);
    }

    pub(crate) fn touched_roots_list(&self) -> Vec<Arc<Root>> {
        self.touched_roots
            .lock()
            .values()
            .map(|(root, _)| root.clone())
            .collect()
    }

    /// Commits the transaction.
    pub fn commit(self) -> Result<()> {
        let fs = self.fs.clone();

        // A transaction that never touched anything leaves no trace; the
        // generation only moves when something reached the trees.
        if self.dirty.lock().is_empty()
            && !self.has_pending_accounting()
            && self.touched_roots.lock().is_empty()
            && self.new_chunks.lock().is_empty()
        {
            self.done.store(true, Ordering::SeqCst);
            fs.writer_active.store(false, Ordering::SeqCst);
            return Ok(());
        }

        // 1. Settle extent accounting, root items and block group counters.
        //    Each round may dirty more blocks; iterate to a fixpoint.
        let mut settled = false;
        for round in 0..MAX_FINALIZE_ROUNDS {
            if !self.new_chunks.lock().is_empty() && round == 0 {
                self.flush_device_items()?;
            }

            alloc::finalize_extents(&self)?;
            roots::flush_root_items(&self)?;

            if self.has_pending_accounting() {
                continue;
            }

            alloc::flush_block_groups(&self)?;
            if !self.has_pending_accounting() {
                settled = true;
                break;
            }
        }
        if !settled {
            return Err(FsError::Invariant(
                "extent accounting did not converge".to_string(),
            ));
        }

        // 2. Write out every dirty tree block; each is self-verifying, so
        //    order does not matter.
        let dirty = std::mem::take(&mut *self.dirty.lock());
        let mut written = 0usize;
        for eb in &dirty {
            if !eb.is_dirty() {
                continue;
            }
            fs.write_tree_block(eb)?;
            eb.clear_dirty();
            written += 1;
        }

        // 3. Barrier before touching any superblock.
        for device in fs.devices() {
            device.dev.sync_device()?;
        }

        // 4. Refresh the in-memory super: roots, generation, accounting,
        //    system chunk array.
        {
            let tree_root = fs.tree_root();
            let chunk_root = fs.chunk_root();
            let mut sb = fs.superblock_mut();

            let (bytenr, level, _) = tree_root.location();
            sb.set_root(bytenr, level);
            // The chunk tree may be untouched this transaction; its stored
            // generation must keep matching the root block on disk.
            let (bytenr, level, generation) = chunk_root.location();
            sb.set_chunk_root(bytenr, level, generation);
            sb.set_generation(self.transid);
            sb.set_bytes_used(fs.space.read().bytes_used());

            let sys_array = fs.chunks().build_sys_array(fs.sectorsize())?;
            sb.set_sys_chunk_array(&sys_array)?;

            let mut dev_item = sb.dev_item();
            dev_item.generation = 0;
            dev_item.bytes_used = device_bytes_used(&fs, dev_item.devid);
            sb.set_dev_item(&dev_item);
        }

        // 5.-7. Secondary mirrors, barrier, primary, barrier.
        let sb = fs.superblock().clone();
        superblock::write_all_supers(&fs.devices(), &sb, fs.super_bytenr())?;

        // 8. The new generation is durable; unpin freed space.
        fs.set_generation(self.transid);
        fs.space.write().unpin_all();
        self.done.store(true, Ordering::SeqCst);
        fs.writer_active.store(false, Ordering::SeqCst);

        tracing::debug!(transid = self.transid, blocks = written, "transaction committed");
        Ok(())
    }

    /// Rewrites device items after chunk allocation changed usage
    fn flush_device_items(&self) -> Result<()> {
        let fs = &self.fs;
        for device in fs.devices() {
            let mut item = {
                let sb = fs.superblock();
                let mut item = sb.dev_item();
                if item.devid != device.devid {
                    continue;
                }
                item.bytes_used = device_bytes_used(fs, device.devid);
                item
            };
            item.generation = 0;
            chunk::update_device_item(self, &item)?;
            fs.superblock_mut().set_dev_item(&item);
        }
        Ok(())
    }

    /// Discards everything this transaction changed in memory
    fn abort(&self) {
        let fs = &self.fs;
        tracing::warn!(transid = self.transid, "transaction aborted");

        for eb in self.dirty.lock().drain(..) {
            eb.clear_dirty();
            fs.cache.remove(eb.bytenr());
        }

        for (_, (root, original)) in self.touched_roots.lock().drain() {
            root.restore_item(original);
        }

        // The on-disk state never moved; rebuild the in-memory maps from it.
        let sb = fs.superblock().clone();
        match super::ChunkMap::from_sys_array(&sb) {
            Ok(map) => *fs.chunks_mut() = map,
            Err(e) => tracing::warn!("chunk map rebuild failed during abort: {}", e),
        }
        if let Err(e) = chunk::read_chunk_tree(fs) {
            tracing::warn!("chunk tree walk failed during abort: {}", e);
        }
        if let Err(e) = alloc::SpaceManager::load(fs) {
            tracing::warn!("space manager reload failed during abort: {}", e);
        }

        fs.writer_active.store(false, Ordering::SeqCst);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.done.load(Ordering::SeqCst) {
            self.abort();
        }
    }
}

/// Bytes of a device consumed by chunk stripes
fn device_bytes_used(fs: &FsInfo, devid: u64) -> u64 {
    fs.chunks()
        .iter()
        .map(|c| {
            c.stripes
                .iter()
                .filter(|s| s.devid == devid)
                .map(|_| c.length)
                .sum::<u64>()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    // The transaction lifecycle needs a full filesystem underneath it; the
    // end-to-end coverage lives in tests/pipeline.rs next to mkfs. What can
    // be tested in isolation is the single-writer rule, exercised there as
    // well since constructing an FsInfo requires a valid image.
}
