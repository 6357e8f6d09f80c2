//! Free-space tracking and the extent allocator
//!
//! Free space is an interval set per block group plus one per device for
//! chunk placement. Reservations come out of the in-memory sets immediately;
//! the matching extent items and backrefs reach the extent tree when the
//! transaction finalises, so a re-open derives identical accounting.

use super::transaction::Transaction;
use super::tree::{self, Key, KEY_SIZE};
use super::{chunk, item_type, objectid, FsError, FsInfo, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Extent item flags
pub const EXTENT_FLAG_DATA: u64 = 1 << 0;
pub const EXTENT_FLAG_TREE_BLOCK: u64 = 1 << 1;

/// Serialised size of a block group item
pub const BLOCK_GROUP_ITEM_SIZE: usize = 24;

/// A set of disjoint byte intervals, coalesced on insert
#[derive(Debug, Clone, Default)]
pub struct IntervalSet {
    // start -> length
    map: BTreeMap<u64, u64>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set holding one interval
    pub fn with_range(start: u64, len: u64) -> Self {
        let mut set = Self::new();
        set.insert(start, len);
        set
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Total bytes covered
    pub fn total(&self) -> u64 {
        self.map.values().sum()
    }

    /// Adds `[start, start+len)`, merging with neighbours and overlaps
    pub fn insert(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut new_start = start;
        let mut new_end = start + len;

        // Swallow any interval that touches or overlaps the new one.
        let mut doomed = Vec::new();
        for (&s, &l) in self.map.range(..=new_end) {
            if s + l >= new_start {
                doomed.push(s);
                new_start = new_start.min(s);
                new_end = new_end.max(s + l);
            }
        }
        for s in doomed {
            self.map.remove(&s);
        }
        self.map.insert(new_start, new_end - new_start);
    }

    /// Removes `[start, start+len)`; the range must be fully covered
    pub fn remove(&mut self, start: u64, len: u64) -> bool {
        if len == 0 {
            return true;
        }
        let (&s, &l) = match self.map.range(..=start).next_back() {
            Some(e) => e,
            None => return false,
        };
        if start < s || start + len > s + l {
            return false;
        }
        self.map.remove(&s);
        if start > s {
            self.map.insert(s, start - s);
        }
        if s + l > start + len {
            self.map.insert(start + len, s + l - (start + len));
        }
        true
    }

    /// Whether the whole range is covered
    pub fn contains(&self, start: u64, len: u64) -> bool {
        match self.map.range(..=start).next_back() {
            Some((&s, &l)) => start >= s && start + len <= s + l,
            None => false,
        }
    }

    /// Removes whatever part of `[start, start+len)` is present
    pub fn remove_overlap(&mut self, start: u64, len: u64) {
        let mut doomed = Vec::new();
        for (s, l) in self.iter() {
            let lo = s.max(start);
            let hi = (s + l).min(start + len);
            if lo < hi {
                doomed.push((lo, hi - lo));
            }
        }
        for (s, l) in doomed {
            self.remove(s, l);
        }
    }

    /// Whether any byte of the range is covered
    pub fn intersects(&self, start: u64, len: u64) -> bool {
        if len == 0 {
            return false;
        }
        if let Some((&s, &l)) = self.map.range(..start + len).next_back() {
            if s + l > start {
                return true;
            }
        }
        false
    }

    /// First-fit allocation of `len` bytes at `align`ment
    pub fn alloc(&mut self, len: u64, align: u64) -> Option<u64> {
        let mut found = None;
        for (&s, &l) in self.map.iter() {
            let aligned = (s + align - 1) / align * align;
            if aligned + len <= s + l {
                found = Some(aligned);
                break;
            }
        }
        let start = found?;
        self.remove(start, len);
        Some(start)
    }

    /// Largest contiguous interval
    pub fn largest(&self) -> Option<(u64, u64)> {
        self.map
            .iter()
            .max_by_key(|(_, &l)| l)
            .map(|(&s, &l)| (s, l))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.map.iter().map(|(&s, &l)| (s, l))
    }
}

/// Per-chunk allocation state
#[derive(Debug, Clone)]
pub struct BlockGroup {
    pub start: u64,
    pub length: u64,
    pub flags: u64,
    pub free: IntervalSet,
    pub used: u64,
}

impl BlockGroup {
    fn new(start: u64, length: u64, flags: u64) -> Self {
        Self {
            start,
            length,
            flags,
            free: IntervalSet::with_range(start, length),
            used: 0,
        }
    }
}

/// Pending-free entry: returned to the free sets at commit completion
#[derive(Debug, Clone, Copy)]
struct Pinned {
    start: u64,
    len: u64,
}

/// Tracks free space per block group and per device
pub struct SpaceManager {
    device_free: BTreeMap<u64, IntervalSet>,
    groups: BTreeMap<u64, BlockGroup>,
    pinned: Vec<Pinned>,
    loaded: bool,
}

impl SpaceManager {
    pub fn new() -> Self {
        Self {
            device_free: BTreeMap::new(),
            groups: BTreeMap::new(),
            pinned: Vec::new(),
            loaded: false,
        }
    }

    /// Derives the full allocation state of an open filesystem: device free
    /// space from the chunk stripes, block group usage from the extent tree.
    pub fn load(fs: &Arc<FsInfo>) -> Result<()> {
        let mut mgr = SpaceManager::new();

        for device in fs.devices() {
            let mut free = IntervalSet::with_range(0, device.total_bytes);
            for (start, len) in super::reserved_ranges() {
                if start < device.total_bytes {
                    free.remove(start, len.min(device.total_bytes - start));
                }
            }
            mgr.device_free.insert(device.devid, free);
        }

        {
            let chunks = fs.chunks();
            for chunk in chunks.iter() {
                for stripe in &chunk.stripes {
                    if let Some(free) = mgr.device_free.get_mut(&stripe.devid) {
                        // Bootstrap chunks may begin inside the reserved MiB
                        // on converted filesystems; removal is best effort.
                        if !free.remove(stripe.offset, chunk.length) {
                            tracing::debug!(
                                devid = stripe.devid,
                                offset = stripe.offset,
                                "stripe partially outside tracked free space"
                            );
                        }
                    }
                }
                mgr.groups
                    .insert(chunk.logical, BlockGroup::new(chunk.logical, chunk.length, chunk.type_flags));
            }
        }

        // Walk the extent tree to carve out what is already allocated.
        let extent_root = fs.read_root(objectid::EXTENT_TREE)?;
        let mut path = tree::Path::new();
        let first = Key::new(0, 0, 0);
        tree::search_slot(None, fs, &extent_root, &first, 0, false, &mut path)?;
        loop {
            let leaf = match path.leaf() {
                Ok(l) => l.clone(),
                Err(_) => break,
            };
            if path.slots[0] >= leaf.nritems() as usize {
                if !tree::next_leaf(fs, &extent_root, &mut path)? {
                    break;
                }
                continue;
            }
            let key = leaf.item_key(path.slots[0]);
            match key.item_type {
                item_type::EXTENT_ITEM => {
                    mgr.carve_used(key.objectid, key.offset);
                }
                item_type::BLOCK_GROUP_ITEM => {
                    let data = leaf.item_data(path.slots[0]);
                    if data.len() >= BLOCK_GROUP_ITEM_SIZE {
                        let used = LittleEndian::read_u64(&data[0..8]);
                        // Copy the packed key field before borrowing it.
                        let start = { key.objectid };
                        if let Some(group) = mgr.groups.get_mut(&start) {
                            group.used = used;
                        }
                    }
                }
                _ => {}
            }
            path.slots[0] += 1;
        }

        mgr.loaded = true;
        *fs.space.write() = mgr;
        Ok(())
    }

    fn carve_used(&mut self, start: u64, len: u64) {
        if let Some((_, group)) = self.groups.range_mut(..=start).next_back() {
            if start + len <= group.start + group.length {
                group.free.remove(start, len);
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Registers a fresh, fully-free block group
    pub fn add_group(&mut self, chunk: &chunk::ChunkMapping) {
        self.groups.insert(
            chunk.logical,
            BlockGroup::new(chunk.logical, chunk.length, chunk.type_flags),
        );
    }

    pub fn group_of(&self, logical: u64) -> Option<&BlockGroup> {
        let (_, g) = self.groups.range(..=logical).next_back()?;
        if logical < g.start + g.length {
            Some(g)
        } else {
            None
        }
    }

    /// Allocates from any group matching `flags`
    fn alloc_from_groups(&mut self, flags: u64, len: u64, align: u64) -> Option<u64> {
        for group in self.groups.values_mut() {
            if group.flags & flags == 0 {
                continue;
            }
            if let Some(start) = group.free.alloc(len, align) {
                group.used += len;
                return Some(start);
            }
        }
        None
    }

    /// Sum of used bytes across all groups
    pub fn bytes_used(&self) -> u64 {
        self.groups.values().map(|g| g.used).sum()
    }

    /// Free bytes across groups matching `flags`
    pub fn free_bytes(&self, flags: u64) -> u64 {
        self.groups
            .values()
            .filter(|g| g.flags & flags != 0)
            .map(|g| g.free.total())
            .sum()
    }

    /// Allocates a physical device extent for a new chunk stripe
    pub fn alloc_device_extent(&mut self, devid: u64, len: u64, align: u64) -> Option<u64> {
        self.device_free.get_mut(&devid)?.alloc(len, align)
    }

    /// Returns a device extent (failed allocation attempt)
    pub fn release_device_extent(&mut self, devid: u64, start: u64, len: u64) {
        if let Some(free) = self.device_free.get_mut(&devid) {
            free.insert(start, len);
        }
    }

    /// Claims an exact physical range, for identity-mapped chunks
    pub fn claim_device_range(&mut self, devid: u64, start: u64, len: u64) -> Result<()> {
        let free = self
            .device_free
            .get_mut(&devid)
            .ok_or_else(|| FsError::NotFound(format!("device {}", devid)))?;
        if !free.remove(start, len) {
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    /// Free device intervals, for layout planning
    pub fn device_free_ranges(&self, devid: u64) -> Vec<(u64, u64)> {
        self.device_free
            .get(&devid)
            .map(|s| s.iter().collect())
            .unwrap_or_default()
    }

    /// Marks a range of a block group allocated without going through a
    /// reservation; the convert pipeline claims the pre-existing foreign
    /// bytes inside its identity chunks this way.
    pub fn claim_group_range(&mut self, start: u64, len: u64) -> Result<()> {
        self.mark_used_at(start, len)
    }

    fn mark_used_at(&mut self, start: u64, len: u64) -> Result<()> {
        let group = self
            .groups
            .range_mut(..=start)
            .next_back()
            .map(|(_, g)| g)
            .filter(|g| start + len <= g.start + g.length)
            .ok_or_else(|| FsError::Invariant(format!("no block group covers {}", start)))?;
        if !group.free.remove(start, len) {
            return Err(FsError::Invariant(format!(
                "extent [{}, +{}) is not free",
                start, len
            )));
        }
        group.used += len;
        Ok(())
    }

    fn pin_freed(&mut self, start: u64, len: u64) {
        if let Some((_, group)) = self.groups.range_mut(..=start).next_back() {
            if start + len <= group.start + group.length {
                group.used = group.used.saturating_sub(len);
            }
        }
        self.pinned.push(Pinned { start, len });
    }

    /// Returns pinned ranges to the free sets; called once the commit's
    /// primary super is durable.
    pub fn unpin_all(&mut self) {
        let pinned = std::mem::take(&mut self.pinned);
        for p in pinned {
            if let Some((_, group)) = self.groups.range_mut(..=p.start).next_back() {
                if p.start + p.len <= group.start + group.length {
                    group.free.insert(p.start, p.len);
                }
            }
        }
    }
}

impl Default for SpaceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// What a new extent is for; determines the inline backref written
#[derive(Debug, Clone)]
pub enum ExtentKind {
    TreeBlock { level: u8, first_key: Key },
    Data { root: u64, ino: u64, file_offset: u64 },
}

/// A reservation made this transaction, not yet in the extent tree
#[derive(Debug, Clone)]
pub struct ExtentRecord {
    pub bytenr: u64,
    pub num_bytes: u64,
    pub owner: u64,
    pub kind: ExtentKind,
}

/// Reserves one tree block worth of metadata space.
///
/// Prefers existing metadata block groups; falls back to allocating a new
/// chunk when they are exhausted.
pub fn reserve_metadata(trans: &Transaction, owner: u64) -> Result<u64> {
    let fs = trans.fs();
    let nodesize = fs.nodesize() as u64;

    // Chunk tree blocks live in SYSTEM chunks, everything else in METADATA.
    let flags = if owner == objectid::CHUNK_TREE {
        chunk::chunk_type::SYSTEM
    } else {
        chunk::chunk_type::METADATA
    };

    let got = fs.space.write().alloc_from_groups(flags, nodesize, nodesize);
    let bytenr = match got {
        Some(b) => b,
        None => {
            if trans.enter_chunk_alloc() {
                let res = chunk::alloc_chunk(trans, flags);
                trans.leave_chunk_alloc();
                res?;
                fs.space
                    .write()
                    .alloc_from_groups(flags, nodesize, nodesize)
                    .ok_or(FsError::NoSpace)?
            } else {
                return Err(FsError::NoSpace);
            }
        }
    };

    Ok(bytenr)
}

/// Reserves a data extent. `hint` biases placement to the group containing
/// it when possible.
pub fn reserve_data(trans: &Transaction, bytes: u64, hint: u64) -> Result<u64> {
    let fs = trans.fs();
    let sectorsize = fs.sectorsize() as u64;
    let len = (bytes + sectorsize - 1) / sectorsize * sectorsize;

    {
        let mut space = fs.space.write();
        if let Some(group_start) = space.group_of(hint).map(|g| g.start) {
            if let Some(group) = space.groups.get_mut(&group_start) {
                if group.flags & chunk::chunk_type::DATA != 0 {
                    if let Some(start) = group.free.alloc(len, sectorsize) {
                        group.used += len;
                        return Ok(start);
                    }
                }
            }
        }
        if let Some(start) = space.alloc_from_groups(chunk::chunk_type::DATA, len, sectorsize) {
            return Ok(start);
        }
    }

    if trans.enter_chunk_alloc() {
        let res = chunk::alloc_chunk(trans, chunk::chunk_type::DATA);
        trans.leave_chunk_alloc();
        res?;
        fs.space
            .write()
            .alloc_from_groups(chunk::chunk_type::DATA, len, sectorsize)
            .ok_or(FsError::NoSpace)
    } else {
        Err(FsError::NoSpace)
    }
}

/// Marks an extent free. Whether any space actually returns is decided at
/// finalise time (a shared extent only drops a reference); either way the
/// range stays pinned until the commit completes.
pub fn free_extent(trans: &Transaction, bytenr: u64, len: u64) {
    trans.record_pending_free(bytenr, len);
}

/// Registers the block group item for a new chunk
pub fn add_block_group(trans: &Transaction, chunk: &chunk::ChunkMapping) -> Result<()> {
    let fs = trans.fs();
    fs.space.write().add_group(chunk);

    let extent_root = fs.read_root(objectid::EXTENT_TREE)?;
    let key = Key::new(chunk.logical, item_type::BLOCK_GROUP_ITEM, chunk.length);
    let item = block_group_item(0, chunk.type_flags);
    tree::insert_item(trans, &extent_root, &key, &item)?;
    Ok(())
}

/// Serialises a block group item
pub fn block_group_item(used: u64, flags: u64) -> [u8; BLOCK_GROUP_ITEM_SIZE] {
    let mut out = [0u8; BLOCK_GROUP_ITEM_SIZE];
    LittleEndian::write_u64(&mut out[0..8], used);
    LittleEndian::write_u64(&mut out[8..16], objectid::FIRST_CHUNK_TREE);
    LittleEndian::write_u64(&mut out[16..24], flags);
    out
}

/// Serialises an extent item with one inline backref
pub fn extent_item_bytes(refs: u64, generation: u64, kind: &ExtentKind) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf8 = [0u8; 8];

    let flags = match kind {
        ExtentKind::TreeBlock { .. } => EXTENT_FLAG_TREE_BLOCK,
        ExtentKind::Data { .. } => EXTENT_FLAG_DATA,
    };

    LittleEndian::write_u64(&mut buf8, refs);
    out.extend_from_slice(&buf8);
    LittleEndian::write_u64(&mut buf8, generation);
    out.extend_from_slice(&buf8);
    LittleEndian::write_u64(&mut buf8, flags);
    out.extend_from_slice(&buf8);

    match kind {
        ExtentKind::TreeBlock { level, first_key } => {
            out.extend_from_slice(&first_key.to_bytes());
            out.push(*level);
            out.push(item_type::TREE_BLOCK_REF);
            // Tree block ref offset is the owning tree.
            LittleEndian::write_u64(&mut buf8, 0);
            out.extend_from_slice(&buf8);
        }
        ExtentKind::Data { root, ino, file_offset } => {
            out.push(item_type::EXTENT_DATA_REF);
            LittleEndian::write_u64(&mut buf8, *root);
            out.extend_from_slice(&buf8);
            LittleEndian::write_u64(&mut buf8, *ino);
            out.extend_from_slice(&buf8);
            LittleEndian::write_u64(&mut buf8, *file_offset);
            out.extend_from_slice(&buf8);
            let mut buf4 = [0u8; 4];
            LittleEndian::write_u32(&mut buf4, 1);
            out.extend_from_slice(&buf4);
        }
    }
    out
}

fn tree_block_ref_offset(out: &mut [u8], owner: u64) {
    let len = out.len();
    LittleEndian::write_u64(&mut out[len - 8..], owner);
}

/// Writes the extent items for everything reserved this transaction, and
/// drops the items for everything freed. Runs inside the commit fixpoint
/// loop: the inserts themselves consume metadata and produce more records.
pub(crate) fn finalize_extents(trans: &Transaction) -> Result<()> {
    let fs = trans.fs();
    let extent_root = fs.read_root(objectid::EXTENT_TREE)?;

    for mut record in trans.take_new_extents() {
        // Tree blocks gained their items after allocation; refresh the
        // recorded level and first key from the live buffer.
        if let ExtentKind::TreeBlock { level, first_key } = &mut record.kind {
            if let Some(eb) = fs.cache.get(record.bytenr) {
                *level = eb.level();
                if let Some(k) = eb.first_key() {
                    *first_key = k;
                }
            }
        }

        let key = Key::new(record.bytenr, item_type::EXTENT_ITEM, record.num_bytes);
        let mut path = tree::Path::new();
        let found = tree::search_slot(Some(trans), fs, &extent_root, &key, 0, true, &mut path)?;
        if found {
            // Shared extent (reflink or snapshot): bump the refcount and
            // append the new inline backref.
            let mut data = path.leaf()?.item_data(path.slots[0]);
            let refs = LittleEndian::read_u64(&data[0..8]) + 1;
            LittleEndian::write_u64(&mut data[0..8], refs);
            match &record.kind {
                ExtentKind::TreeBlock { .. } => {
                    data.push(item_type::TREE_BLOCK_REF);
                    let mut buf = [0u8; 8];
                    LittleEndian::write_u64(&mut buf, record.owner);
                    data.extend_from_slice(&buf);
                }
                ExtentKind::Data { root, ino, file_offset } => {
                    data.push(item_type::EXTENT_DATA_REF);
                    let mut buf = [0u8; 8];
                    LittleEndian::write_u64(&mut buf, *root);
                    data.extend_from_slice(&buf);
                    LittleEndian::write_u64(&mut buf, *ino);
                    data.extend_from_slice(&buf);
                    LittleEndian::write_u64(&mut buf, *file_offset);
                    data.extend_from_slice(&buf);
                    data.extend_from_slice(&1u32.to_le_bytes());
                }
            }
            tree::del_item(trans, &extent_root, &mut path)?;
            tree::insert_item(trans, &extent_root, &key, &data)?;
            continue;
        }
        drop(path);

        let mut item = extent_item_bytes(1, trans.transid, &record.kind);
        if let ExtentKind::TreeBlock { .. } = record.kind {
            tree_block_ref_offset(&mut item, record.owner);
        }
        tree::insert_item(trans, &extent_root, &key, &item)?;
    }

    for (bytenr, len) in trans.take_pending_frees() {
        let key = Key::new(bytenr, item_type::EXTENT_ITEM, len);
        let mut path = tree::Path::new();
        let found = tree::search_slot(Some(trans), fs, &extent_root, &key, 0, true, &mut path)?;
        if !found {
            // Freed before its extent item was ever written.
            fs.space.write().pin_freed(bytenr, len);
            continue;
        }
        let leaf = path.leaf()?.clone();
        let mut data = leaf.item_data(path.slots[0]);
        let refs = LittleEndian::read_u64(&data[0..8]);
        if refs > 1 {
            LittleEndian::write_u64(&mut data[0..8], refs - 1);
            leaf.set_item_payload(path.slots[0], &data);
        } else {
            tree::del_item(trans, &extent_root, &mut path)?;
            fs.space.write().pin_freed(bytenr, len);
        }
    }

    Ok(())
}

/// Rewrites every block group item from the in-memory usage counters
pub(crate) fn flush_block_groups(trans: &Transaction) -> Result<()> {
    let fs = trans.fs();
    let extent_root = fs.read_root(objectid::EXTENT_TREE)?;

    let groups: Vec<(u64, u64, u64, u64)> = fs
        .space
        .read()
        .groups
        .values()
        .map(|g| (g.start, g.length, g.used, g.flags))
        .collect();

    for (start, length, used, flags) in groups {
        let key = Key::new(start, item_type::BLOCK_GROUP_ITEM, length);
        let mut path = tree::Path::new();
        let found = tree::search_slot(Some(trans), fs, &extent_root, &key, 0, true, &mut path)?;
        if !found {
            return Err(FsError::Invariant(format!(
                "missing block group item for chunk at {}",
                start
            )));
        }
        let leaf = path.leaf()?;
        leaf.set_item_payload(path.slots[0], &block_group_item(used, flags));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_insert_coalesce() {
        let mut set = IntervalSet::new();
        set.insert(0, 100);
        set.insert(200, 100);
        assert_eq!(set.iter().count(), 2);

        // Bridging interval merges everything into one.
        set.insert(100, 100);
        let all: Vec<_> = set.iter().collect();
        assert_eq!(all, vec![(0, 300)]);
        assert_eq!(set.total(), 300);
    }

    #[test]
    fn test_interval_insert_overlap() {
        let mut set = IntervalSet::new();
        set.insert(50, 100);
        set.insert(100, 200);
        let all: Vec<_> = set.iter().collect();
        assert_eq!(all, vec![(50, 250)]);
    }

    #[test]
    fn test_interval_remove_splits() {
        let mut set = IntervalSet::with_range(0, 1000);
        assert!(set.remove(100, 100));
        let all: Vec<_> = set.iter().collect();
        assert_eq!(all, vec![(0, 100), (200, 800)]);

        // Removing a range that is not fully free fails and changes nothing.
        assert!(!set.remove(150, 100));
        assert_eq!(set.total(), 900);
    }

    #[test]
    fn test_interval_contains_and_intersects() {
        let mut set = IntervalSet::new();
        set.insert(1000, 500);

        assert!(set.contains(1000, 500));
        assert!(set.contains(1100, 100));
        assert!(!set.contains(900, 200));
        assert!(!set.contains(1400, 200));

        assert!(set.intersects(900, 200));
        assert!(set.intersects(1499, 10));
        assert!(!set.intersects(1500, 100));
        assert!(!set.intersects(0, 1000));
    }

    #[test]
    fn test_interval_alloc_alignment() {
        let mut set = IntervalSet::new();
        set.insert(100, 10000);

        let got = set.alloc(4096, 4096).unwrap();
        assert_eq!(got % 4096, 0);
        assert!(got >= 100);
        assert!(!set.contains(got, 4096));
    }

    #[test]
    fn test_interval_alloc_exhaustion() {
        let mut set = IntervalSet::with_range(0, 8192);
        assert!(set.alloc(4096, 4096).is_some());
        assert!(set.alloc(4096, 4096).is_some());
        assert!(set.alloc(4096, 4096).is_none());
    }

    #[test]
    fn test_interval_largest() {
        let mut set = IntervalSet::new();
        set.insert(0, 100);
        set.insert(1000, 5000);
        set.insert(10000, 200);
        assert_eq!(set.largest(), Some((1000, 5000)));
    }

    #[test]
    fn test_block_group_item_layout() {
        let item = block_group_item(0x1234, chunk::chunk_type::DATA);
        assert_eq!(LittleEndian::read_u64(&item[0..8]), 0x1234);
        assert_eq!(LittleEndian::read_u64(&item[8..16]), objectid::FIRST_CHUNK_TREE);
        assert_eq!(LittleEndian::read_u64(&item[16..24]), chunk::chunk_type::DATA);
    }

    #[test]
    fn test_extent_item_tree_block() {
        let kind = ExtentKind::TreeBlock {
            level: 1,
            first_key: Key::new(256, item_type::INODE_ITEM, 0),
        };
        let mut item = extent_item_bytes(1, 7, &kind);
        tree_block_ref_offset(&mut item, objectid::FS_TREE);

        // refs, generation, flags, tree_block_info(18), ref type + offset
        assert_eq!(item.len(), 24 + KEY_SIZE + 1 + 1 + 8);
        assert_eq!(LittleEndian::read_u64(&item[0..8]), 1);
        assert_eq!(LittleEndian::read_u64(&item[8..16]), 7);
        assert_eq!(LittleEndian::read_u64(&item[16..24]), EXTENT_FLAG_TREE_BLOCK);
        assert_eq!(item[24 + KEY_SIZE], 1); // level
        assert_eq!(item[24 + KEY_SIZE + 1], item_type::TREE_BLOCK_REF);
        let len = item.len();
        assert_eq!(LittleEndian::read_u64(&item[len - 8..]), objectid::FS_TREE);
    }

    #[test]
    fn test_extent_item_data() {
        let kind = ExtentKind::Data {
            root: objectid::FS_TREE,
            ino: 257,
            file_offset: 0x10000,
        };
        let item = extent_item_bytes(1, 3, &kind);
        assert_eq!(LittleEndian::read_u64(&item[16..24]), EXTENT_FLAG_DATA);
        assert_eq!(item[24], item_type::EXTENT_DATA_REF);
        assert_eq!(LittleEndian::read_u64(&item[25..33]), objectid::FS_TREE);
        assert_eq!(LittleEndian::read_u64(&item[33..41]), 257);
        assert_eq!(LittleEndian::read_u64(&item[41..49]), 0x10000);
        assert_eq!(LittleEndian::read_u32(&item[49..53]), 1);
    }

    #[test]
    fn test_space_manager_groups() {
        let mut mgr = SpaceManager::new();
        let c = chunk::ChunkMapping {
            logical: 0x100000,
            length: 0x800000,
            stripe_len: chunk::STRIPE_LEN,
            type_flags: chunk::chunk_type::METADATA,
            num_stripes: 1,
            sub_stripes: 0,
            stripes: vec![chunk::Stripe {
                devid: 1,
                offset: 0x100000,
                dev_uuid: [0; 16],
            }],
        };
        mgr.add_group(&c);

        let got = mgr
            .alloc_from_groups(chunk::chunk_type::METADATA, 16384, 16384)
            .unwrap();
        assert!(got >= 0x100000);
        assert_eq!(got % 16384, 0);
        assert_eq!(mgr.bytes_used(), 16384);

        // Pin and unpin round-trips the space.
        mgr.pin_freed(got, 16384);
        assert_eq!(mgr.bytes_used(), 0);
        assert!(!mgr.group_of(got).unwrap().free.contains(got, 16384));
        mgr.unpin_all();
        assert!(mgr.group_of(got).unwrap().free.contains(got, 16384));
    }

    #[test]
    fn test_device_extent_claim() {
        let mut mgr = SpaceManager::new();
        mgr.device_free
            .insert(1, IntervalSet::with_range(0x100000, 0x10000000));

        mgr.claim_device_range(1, 0x200000, 0x100000).unwrap();
        assert!(mgr.claim_device_range(1, 0x200000, 0x100000).is_err());

        let got = mgr.alloc_device_extent(1, 0x100000, chunk::STRIPE_LEN).unwrap();
        assert_eq!(got % chunk::STRIPE_LEN, 0);
        mgr.release_device_extent(1, got, 0x100000);
        assert!(mgr.device_free[&1].contains(got, 0x100000));
    }
}
