//! Copy-on-write B-tree engine
//!
//! One shape fits every tree: a 101-byte header, then either leaf items
//! (fixed descriptors growing from the front, payloads packed from the back)
//! or node pointer entries. Operations are parameterised by a root handle;
//! mutation requires a transaction and copies every touched block up to the
//! root before changing a byte.

use super::alloc::{self, ExtentKind, ExtentRecord};
use super::ebcache::{ExtentBuffer, BACKREF_REV_MIXED, HEADER_FLAG_WRITTEN, HEADER_SIZE};
use super::roots::Root;
use super::transaction::Transaction;
use super::{FsError, FsInfo, Result, MAX_LEVEL};
use std::sync::Arc;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Size of a key on disk
pub const KEY_SIZE: usize = 17;

/// Size of a leaf item descriptor
pub const ITEM_SIZE: usize = 25;

/// Size of a node pointer entry
pub const KEY_PTR_SIZE: usize = 33;

/// A tree key: compared lexicographically as (objectid, type, offset).
/// The field order is the on-disk order, so the struct doubles as the
/// serialised form.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
)]
#[repr(C, packed)]
pub struct Key {
    pub objectid: u64,
    pub item_type: u8,
    pub offset: u64,
}

impl Key {
    #[inline]
    pub const fn new(objectid: u64, item_type: u8, offset: u64) -> Self {
        Self {
            objectid,
            item_type,
            offset,
        }
    }

    /// Parses a key from its 17-byte on-disk form
    #[inline]
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut raw = [0u8; KEY_SIZE];
        raw.copy_from_slice(&data[..KEY_SIZE]);
        zerocopy::transmute!(raw)
    }

    #[inline]
    pub fn to_bytes(&self) -> [u8; KEY_SIZE] {
        zerocopy::transmute!(*self)
    }

    #[inline]
    pub const fn min() -> Self {
        Self::new(0, 0, 0)
    }

    #[inline]
    pub const fn max() -> Self {
        Self::new(u64::MAX, u8::MAX, u64::MAX)
    }
}

// Leaf and node accessors over the raw block bytes.
impl ExtentBuffer {
    /// Usable bytes after the header
    pub fn capacity(&self) -> usize {
        self.len() - HEADER_SIZE
    }

    fn item_desc_offset(slot: usize) -> usize {
        HEADER_SIZE + slot * ITEM_SIZE
    }

    pub fn item_key(&self, slot: usize) -> Key {
        let mut buf = [0u8; KEY_SIZE];
        self.read_bytes(Self::item_desc_offset(slot), &mut buf);
        Key::from_bytes(&buf)
    }

    pub fn set_item_key(&self, slot: usize, key: &Key) {
        self.write_bytes(Self::item_desc_offset(slot), &key.to_bytes());
    }

    /// Payload offset, relative to the end of the header
    pub fn item_offset(&self, slot: usize) -> u32 {
        self.get_u32(Self::item_desc_offset(slot) + KEY_SIZE)
    }

    pub fn set_item_offset(&self, slot: usize, offset: u32) {
        self.set_u32(Self::item_desc_offset(slot) + KEY_SIZE, offset)
    }

    pub fn item_size(&self, slot: usize) -> u32 {
        self.get_u32(Self::item_desc_offset(slot) + KEY_SIZE + 4)
    }

    pub fn set_item_size(&self, slot: usize, size: u32) {
        self.set_u32(Self::item_desc_offset(slot) + KEY_SIZE + 4, size)
    }

    /// Copies out one item payload
    pub fn item_data(&self, slot: usize) -> Vec<u8> {
        let start = HEADER_SIZE + self.item_offset(slot) as usize;
        let len = self.item_size(slot) as usize;
        let mut out = vec![0u8; len];
        self.read_bytes(start, &mut out);
        out
    }

    /// Overwrites an item payload in place; the length must match
    pub fn set_item_payload(&self, slot: usize, data: &[u8]) {
        assert_eq!(
            data.len(),
            self.item_size(slot) as usize,
            "payload resize requires delete and re-insert"
        );
        let start = HEADER_SIZE + self.item_offset(slot) as usize;
        self.write_bytes(start, data);
    }

    /// Relative offset of the lowest payload byte
    pub fn leaf_data_end(&self) -> usize {
        let nritems = self.nritems() as usize;
        if nritems == 0 {
            self.capacity()
        } else {
            self.item_offset(nritems - 1) as usize
        }
    }

    /// Free bytes between the descriptor array and the payload region
    pub fn leaf_free_space(&self) -> usize {
        self.leaf_data_end() - self.nritems() as usize * ITEM_SIZE
    }

    /// Bytes in use: descriptors plus payloads
    pub fn leaf_used(&self) -> usize {
        self.capacity() - self.leaf_free_space()
    }

    fn ptr_desc_offset(slot: usize) -> usize {
        HEADER_SIZE + slot * KEY_PTR_SIZE
    }

    pub fn node_key(&self, slot: usize) -> Key {
        let mut buf = [0u8; KEY_SIZE];
        self.read_bytes(Self::ptr_desc_offset(slot), &mut buf);
        Key::from_bytes(&buf)
    }

    pub fn set_node_key(&self, slot: usize, key: &Key) {
        self.write_bytes(Self::ptr_desc_offset(slot), &key.to_bytes());
    }

    pub fn node_blockptr(&self, slot: usize) -> u64 {
        self.get_u64(Self::ptr_desc_offset(slot) + KEY_SIZE)
    }

    pub fn node_ptr_generation(&self, slot: usize) -> u64 {
        self.get_u64(Self::ptr_desc_offset(slot) + KEY_SIZE + 8)
    }

    pub fn set_node_ptr(&self, slot: usize, key: &Key, blockptr: u64, generation: u64) {
        self.write_bytes(Self::ptr_desc_offset(slot), &key.to_bytes());
        self.set_u64(Self::ptr_desc_offset(slot) + KEY_SIZE, blockptr);
        self.set_u64(Self::ptr_desc_offset(slot) + KEY_SIZE + 8, generation);
    }

    /// Pointer entries a node can hold
    pub fn node_capacity(&self) -> usize {
        self.capacity() / KEY_PTR_SIZE
    }

    /// First key of a leaf or node; `None` when empty
    pub fn first_key(&self) -> Option<Key> {
        if self.nritems() == 0 {
            return None;
        }
        Some(if self.is_leaf() {
            self.item_key(0)
        } else {
            self.node_key(0)
        })
    }
}

/// A search path: one `{block, slot}` per level, leaf at index 0
pub struct Path {
    pub nodes: [Option<Arc<ExtentBuffer>>; MAX_LEVEL],
    pub slots: [usize; MAX_LEVEL],
}

impl Path {
    pub fn new() -> Self {
        Self {
            nodes: Default::default(),
            slots: [0; MAX_LEVEL],
        }
    }

    pub fn leaf(&self) -> Result<&Arc<ExtentBuffer>> {
        self.nodes[0]
            .as_ref()
            .ok_or_else(|| FsError::Invariant("path has no leaf".to_string()))
    }

    /// Key at the current leaf slot
    pub fn current_key(&self) -> Result<Key> {
        let leaf = self.leaf()?;
        if self.slots[0] >= leaf.nritems() as usize {
            return Err(FsError::Invariant("path slot past leaf end".to_string()));
        }
        Ok(leaf.item_key(self.slots[0]))
    }
}

impl Default for Path {
    fn default() -> Self {
        Self::new()
    }
}

/// Binary search inside one block. Returns `(exact, slot)`; for nodes the
/// slot is the child to descend into, for leaves the match or insertion
/// point.
fn bin_search(eb: &ExtentBuffer, key: &Key) -> (bool, usize) {
    let nritems = eb.nritems() as usize;
    let get = |i: usize| {
        if eb.is_leaf() {
            eb.item_key(i)
        } else {
            eb.node_key(i)
        }
    };

    let mut lo = 0usize;
    let mut hi = nritems;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let k = get(mid);
        if k < *key {
            lo = mid + 1;
        } else if k > *key {
            hi = mid;
        } else {
            return (true, mid);
        }
    }

    if eb.is_leaf() {
        (false, lo)
    } else {
        // Descend into the last entry whose key is <= the target.
        (false, lo.saturating_sub(1))
    }
}

/// Allocates and initialises a fresh dirty tree block
pub(crate) fn alloc_tree_block(trans: &Transaction, root: &Arc<Root>, level: u8) -> Result<Arc<ExtentBuffer>> {
    let fs = trans.fs();
    let bytenr = alloc::reserve_metadata(trans, root.objectid())?;

    let eb = Arc::new(ExtentBuffer::new(bytenr, fs.nodesize() as usize));
    let sb = fs.superblock();
    eb.set_fsid(&sb.fsid());
    eb.set_chunk_tree_uuid(&sb.chunk_tree_uuid());
    drop(sb);
    eb.set_header_bytenr(bytenr);
    eb.set_generation(trans.transid);
    eb.set_owner(root.objectid());
    eb.set_level(level);
    eb.set_nritems(0);
    eb.set_backref_rev(BACKREF_REV_MIXED);
    eb.set_header_flags(HEADER_FLAG_WRITTEN);
    eb.set_uptodate();
    eb.mark_dirty();

    fs.cache.insert(eb.clone());
    trans.track_dirty(eb.clone());
    trans.record_new_extent(ExtentRecord {
        bytenr,
        num_bytes: fs.nodesize() as u64,
        owner: root.objectid(),
        kind: ExtentKind::TreeBlock {
            level,
            first_key: Key::min(),
        },
    });

    Ok(eb)
}

/// Copies a block for write under the current transaction.
///
/// A block already created by this transaction is returned unchanged. The
/// parent pointer (or the root item, at the top) is rewritten to the copy
/// and the old block is deferred-freed.
pub fn cow_block(
    trans: &Transaction,
    root: &Arc<Root>,
    eb: &Arc<ExtentBuffer>,
    parent: Option<(&Arc<ExtentBuffer>, usize)>,
) -> Result<Arc<ExtentBuffer>> {
    if eb.generation() == trans.transid && eb.is_dirty() {
        return Ok(eb.clone());
    }

    let fs = trans.fs();
    let new = alloc_tree_block(trans, root, eb.level())?;

    // Bulk copy, then restamp the identity fields.
    let bytes = eb.copy_to_vec();
    new.with_data_mut(|data| data.copy_from_slice(&bytes));
    new.set_header_bytenr(new.bytenr());
    new.set_generation(trans.transid);
    new.set_owner(root.objectid());
    new.set_header_flags(HEADER_FLAG_WRITTEN);

    match parent {
        Some((parent_eb, slot)) => {
            parent_eb.set_node_ptr(slot, &new.first_key().unwrap_or(Key::min()), new.bytenr(), trans.transid);
        }
        None => {
            root.set_location(new.bytenr(), new.level(), trans.transid);
            trans.track_root(root)?;
        }
    }

    alloc::free_extent(trans, eb.bytenr(), fs.nodesize() as u64);
    fs.cache.remove(eb.bytenr());

    Ok(new)
}

/// Ensures the node at `level` of the path can take one more pointer,
/// splitting upward (and growing the tree) as needed.
fn ensure_node_room(trans: &Transaction, root: &Arc<Root>, path: &mut Path, level: usize) -> Result<()> {
    if level >= MAX_LEVEL {
        return Err(FsError::Invariant("tree too tall".to_string()));
    }

    if path.nodes[level].is_none() {
        // The current top becomes a child of a fresh root node.
        let child = path.nodes[level - 1]
            .as_ref()
            .ok_or_else(|| FsError::Invariant("missing child during root growth".to_string()))?
            .clone();
        let new_root = alloc_tree_block(trans, root, level as u8)?;
        new_root.set_nritems(1);
        new_root.set_node_ptr(
            0,
            &child.first_key().unwrap_or(Key::min()),
            child.bytenr(),
            trans.transid,
        );
        root.set_location(new_root.bytenr(), level as u8, trans.transid);
        trans.track_root(root)?;
        path.nodes[level] = Some(new_root);
        path.slots[level] = 0;
        return Ok(());
    }

    let node = path.nodes[level]
        .as_ref()
        .ok_or_else(|| FsError::Invariant("missing node during split".to_string()))?
        .clone();
    if (node.nritems() as usize) < node.node_capacity() {
        return Ok(());
    }

    // Split the full node down the middle.
    ensure_node_room(trans, root, path, level + 1)?;

    let nritems = node.nritems() as usize;
    let mid = nritems / 2;
    let right = alloc_tree_block(trans, root, level as u8)?;

    node.with_data(|src| {
        right.with_data_mut(|dst| {
            let from = HEADER_SIZE + mid * KEY_PTR_SIZE;
            let len = (nritems - mid) * KEY_PTR_SIZE;
            dst[HEADER_SIZE..HEADER_SIZE + len].copy_from_slice(&src[from..from + len]);
        })
    });
    right.set_nritems((nritems - mid) as u32);
    node.set_nritems(mid as u32);

    let right_key = right.node_key(0);
    let parent = path.nodes[level + 1]
        .as_ref()
        .ok_or_else(|| FsError::Invariant("split without a parent".to_string()))?
        .clone();
    insert_ptr(&parent, path.slots[level + 1] + 1, &right_key, right.bytenr(), trans.transid);

    // Re-aim the path at whichever half the descent slot landed in.
    if path.slots[level] >= mid {
        path.slots[level] -= mid;
        path.nodes[level] = Some(right);
        path.slots[level + 1] += 1;
    }

    Ok(())
}

/// Inserts a pointer entry into a node that has room
fn insert_ptr(node: &ExtentBuffer, slot: usize, key: &Key, blockptr: u64, generation: u64) {
    let nritems = node.nritems() as usize;
    debug_assert!(slot <= nritems);
    node.with_data_mut(|data| {
        let start = HEADER_SIZE + slot * KEY_PTR_SIZE;
        let end = HEADER_SIZE + nritems * KEY_PTR_SIZE;
        data.copy_within(start..end, start + KEY_PTR_SIZE);
    });
    node.set_node_ptr(slot, key, blockptr, generation);
    node.set_nritems(nritems as u32 + 1);
}

/// Removes a pointer entry from a node
fn remove_ptr(node: &ExtentBuffer, slot: usize) {
    let nritems = node.nritems() as usize;
    debug_assert!(slot < nritems);
    node.with_data_mut(|data| {
        let start = HEADER_SIZE + (slot + 1) * KEY_PTR_SIZE;
        let end = HEADER_SIZE + nritems * KEY_PTR_SIZE;
        data.copy_within(start..end, start - KEY_PTR_SIZE);
    });
    node.set_nritems(nritems as u32 - 1);
}

/// Splits the leaf at the bottom of `path` so at least `ins_len` bytes are
/// free in the half the pending key belongs to.
fn split_leaf(trans: &Transaction, root: &Arc<Root>, path: &mut Path, key: &Key, ins_len: usize) -> Result<()> {
    ensure_node_room(trans, root, path, 1)?;

    let leaf = path.leaf()?.clone();
    let nritems = leaf.nritems() as usize;
    if nritems < 2 {
        return Err(FsError::Invariant(format!(
            "cannot split leaf {} with {} items for {} byte insert",
            leaf.bytenr(),
            nritems,
            ins_len
        )));
    }

    // Split at the byte midpoint, keeping at least one item per side.
    let total: usize = (0..nritems)
        .map(|i| leaf.item_size(i) as usize + ITEM_SIZE)
        .sum();
    let mut acc = 0usize;
    let mut mid = nritems - 1;
    for i in 0..nritems {
        acc += leaf.item_size(i) as usize + ITEM_SIZE;
        if acc >= total / 2 && i + 1 < nritems {
            mid = i + 1;
            break;
        }
    }

    let right = alloc_tree_block(trans, root, 0)?;
    let move_count = nritems - mid;

    // Payloads of the moved items sit lowest in the leaf; rebase them to the
    // top of the new leaf.
    let old_data_end = leaf.leaf_data_end();
    let move_bound = leaf.item_offset(mid - 1) as usize;
    let shift = right.capacity() - move_bound;

    leaf.with_data(|src| {
        right.with_data_mut(|dst| {
            for i in 0..move_count {
                let from = HEADER_SIZE + (mid + i) * ITEM_SIZE;
                let to = HEADER_SIZE + i * ITEM_SIZE;
                dst[to..to + ITEM_SIZE].copy_from_slice(&src[from..from + ITEM_SIZE]);
            }
            dst[HEADER_SIZE + old_data_end + shift..HEADER_SIZE + move_bound + shift]
                .copy_from_slice(&src[HEADER_SIZE + old_data_end..HEADER_SIZE + move_bound]);
        })
    });
    right.set_nritems(move_count as u32);
    for i in 0..move_count {
        let off = right.item_offset(i);
        right.set_item_offset(i, off + shift as u32);
    }
    leaf.set_nritems(mid as u32);

    let right_key = right.item_key(0);
    let parent = path.nodes[1]
        .as_ref()
        .ok_or_else(|| FsError::Invariant("leaf split without a parent".to_string()))?
        .clone();
    insert_ptr(&parent, path.slots[1] + 1, &right_key, right.bytenr(), trans.transid);

    if *key >= right_key {
        path.nodes[0] = Some(right);
        path.slots[1] += 1;
    }
    let (_, slot) = bin_search(path.leaf()?, key);
    path.slots[0] = slot;

    Ok(())
}

/// Searches the tree for `key`.
///
/// With `cow` set every traversed block is copied into the transaction;
/// with `ins_len > 0` leaves are split on the way so the final leaf can take
/// that many bytes. Returns whether the key was found; on a miss the path
/// points at the insertion slot.
pub fn search_slot(
    trans: Option<&Transaction>,
    fs: &FsInfo,
    root: &Arc<Root>,
    key: &Key,
    ins_len: usize,
    cow: bool,
    path: &mut Path,
) -> Result<bool> {
    if cow != trans.is_some() {
        return Err(FsError::Invariant(
            "copy-on-write requires a transaction".to_string(),
        ));
    }

    *path = Path::new();

    let (root_bytenr, root_level, root_gen) = root.location();
    let mut eb = fs.read_tree_block(root_bytenr, Some(root_gen))?;
    if eb.level() != root_level {
        return Err(FsError::CorruptRead(format!(
            "root block at bytenr {} has level {}, root item says {}",
            root_bytenr,
            eb.level(),
            root_level
        )));
    }
    if let Some(trans) = trans {
        eb = cow_block(trans, root, &eb, None)?;
    }

    let mut level = eb.level() as usize;
    loop {
        path.nodes[level] = Some(eb.clone());

        if level == 0 {
            let (found, slot) = bin_search(&eb, key);
            path.slots[0] = slot;

            if let Some(trans) = trans {
                if ins_len > 0 && !found && eb.leaf_free_space() < ins_len {
                    split_leaf(trans, root, path, key, ins_len)?;
                }
            }
            return Ok(found);
        }

        let (_, slot) = bin_search(&eb, key);
        path.slots[level] = slot;

        let child_bytenr = eb.node_blockptr(slot);
        let child_gen = eb.node_ptr_generation(slot);
        let mut child = fs.read_tree_block(child_bytenr, Some(child_gen))?;
        if child.level() as usize != level - 1 {
            return Err(FsError::CorruptRead(format!(
                "tree block at bytenr {} has level {}, parent expects {}",
                child_bytenr,
                child.level(),
                level - 1
            )));
        }
        if let Some(trans) = trans {
            child = cow_block(trans, root, &child, Some((&eb, slot)))?;
        }

        level -= 1;
        eb = child;
    }
}

/// Propagates a changed slot-0 key up the path
fn fixup_low_keys(path: &Path, key: &Key) {
    for level in 1..MAX_LEVEL {
        let node = match &path.nodes[level] {
            Some(n) => n,
            None => break,
        };
        node.set_node_key(path.slots[level], key);
        if path.slots[level] != 0 {
            break;
        }
    }
}

/// Inserts an item with a zeroed payload at the path's insertion slot.
/// `search_slot` with `ins_len` must have positioned the path.
pub fn insert_empty_item(
    _trans: &Transaction,
    _root: &Arc<Root>,
    path: &mut Path,
    key: &Key,
    size: usize,
) -> Result<()> {
    let leaf = path.leaf()?.clone();
    let slot = path.slots[0];
    let nritems = leaf.nritems() as usize;

    if leaf.leaf_free_space() < size + ITEM_SIZE {
        return Err(FsError::Invariant(format!(
            "leaf {} has {} free bytes, need {}",
            leaf.bytenr(),
            leaf.leaf_free_space(),
            size + ITEM_SIZE
        )));
    }

    let data_end = leaf.leaf_data_end();
    // Boundary of payloads belonging to items below `slot`.
    let bound = if slot == 0 {
        leaf.capacity()
    } else {
        leaf.item_offset(slot - 1) as usize
    };

    leaf.with_data_mut(|data| {
        // Make room for the descriptor.
        let dstart = HEADER_SIZE + slot * ITEM_SIZE;
        let dend = HEADER_SIZE + nritems * ITEM_SIZE;
        data.copy_within(dstart..dend, dstart + ITEM_SIZE);

        // Slide lower payloads down by `size`.
        if bound > data_end {
            data.copy_within(HEADER_SIZE + data_end..HEADER_SIZE + bound, HEADER_SIZE + data_end - size);
        }
        // Zero the new payload.
        for b in &mut data[HEADER_SIZE + bound - size..HEADER_SIZE + bound] {
            *b = 0;
        }
    });

    for i in slot..nritems {
        let off = leaf.item_offset(i + 1);
        leaf.set_item_offset(i + 1, off - size as u32);
    }

    leaf.set_item_key(slot, key);
    leaf.set_item_offset(slot, (bound - size) as u32);
    leaf.set_item_size(slot, size as u32);
    leaf.set_nritems(nritems as u32 + 1);

    if slot == 0 {
        fixup_low_keys(path, key);
    }
    Ok(())
}

/// Inserts a complete item into the tree
pub fn insert_item(trans: &Transaction, root: &Arc<Root>, key: &Key, data: &[u8]) -> Result<()> {
    let fs = trans.fs();
    let mut path = Path::new();
    let found = search_slot(Some(trans), fs, root, key, data.len() + ITEM_SIZE, true, &mut path)?;
    if found {
        // Copy the packed fields before formatting borrows them.
        return Err(FsError::Exists(format!(
            "item ({}, {}, {})",
            { key.objectid },
            { key.item_type },
            { key.offset }
        )));
    }
    insert_empty_item(trans, root, &mut path, key, data.len())?;
    path.leaf()?.set_item_payload(path.slots[0], data);
    Ok(())
}

/// Removes the item the path points at and rebalances.
pub fn del_item(trans: &Transaction, root: &Arc<Root>, path: &mut Path) -> Result<()> {
    let leaf = path.leaf()?.clone();
    let slot = path.slots[0];
    let nritems = leaf.nritems() as usize;
    if slot >= nritems {
        return Err(FsError::Invariant("delete past leaf end".to_string()));
    }

    let size = leaf.item_size(slot) as usize;
    let data_end = leaf.leaf_data_end();
    let victim_off = leaf.item_offset(slot) as usize;

    leaf.with_data_mut(|data| {
        // Slide lower payloads up over the hole.
        data.copy_within(HEADER_SIZE + data_end..HEADER_SIZE + victim_off, HEADER_SIZE + data_end + size);
        // Close the descriptor gap.
        let dstart = HEADER_SIZE + (slot + 1) * ITEM_SIZE;
        let dend = HEADER_SIZE + nritems * ITEM_SIZE;
        data.copy_within(dstart..dend, dstart - ITEM_SIZE);
    });

    for i in slot..nritems - 1 {
        let off = leaf.item_offset(i);
        leaf.set_item_offset(i, off + size as u32);
    }
    leaf.set_nritems(nritems as u32 - 1);
    let nritems = nritems - 1;

    let is_root_leaf = path.nodes[1].is_none();

    if nritems == 0 {
        if !is_root_leaf {
            del_leaf(trans, root, path)?;
        }
        return Ok(());
    }

    if slot == 0 {
        fixup_low_keys(path, &leaf.item_key(0));
    }

    // Keep leaves at least a third full by merging with or pulling from a
    // sibling under the same parent.
    if !is_root_leaf && leaf.leaf_used() < leaf.capacity() / 3 {
        rebalance_leaf(trans, root, path)?;
    }
    Ok(())
}

/// Unlinks an empty leaf from its parent and frees it
fn del_leaf(trans: &Transaction, root: &Arc<Root>, path: &mut Path) -> Result<()> {
    let fs = trans.fs();
    let leaf = path.leaf()?.clone();
    del_node_ptr(trans, root, path, 1)?;
    alloc::free_extent(trans, leaf.bytenr(), fs.nodesize() as u64);
    fs.cache.remove(leaf.bytenr());
    trans.untrack_dirty(leaf.bytenr());
    path.nodes[0] = None;
    Ok(())
}

/// Removes the pointer at `path.slots[level]`, collapsing thin roots
fn del_node_ptr(trans: &Transaction, root: &Arc<Root>, path: &mut Path, level: usize) -> Result<()> {
    let fs = trans.fs();
    let node = path.nodes[level]
        .as_ref()
        .ok_or_else(|| FsError::Invariant("missing node in delete path".to_string()))?
        .clone();

    remove_ptr(&node, path.slots[level]);

    let nritems = node.nritems() as usize;
    let is_root_node = path.nodes[level + 1].is_none();

    if nritems == 0 {
        if is_root_node {
            return Err(FsError::Invariant(format!(
                "tree {} lost every block",
                root.objectid()
            )));
        }
        del_node_ptr(trans, root, path, level + 1)?;
        alloc::free_extent(trans, node.bytenr(), fs.nodesize() as u64);
        fs.cache.remove(node.bytenr());
        trans.untrack_dirty(node.bytenr());
        path.nodes[level] = None;
        return Ok(());
    }

    if path.slots[level] == 0 && path.slots[level] < nritems {
        let key = node.node_key(0);
        for upper in level + 1..MAX_LEVEL {
            let parent = match &path.nodes[upper] {
                Some(n) => n,
                None => break,
            };
            parent.set_node_key(path.slots[upper], &key);
            if path.slots[upper] != 0 {
                break;
            }
        }
    }

    // A root node holding a single pointer is replaced by its child. The
    // child gets copied into the transaction so the root item's generation
    // stays in step with the block it points at.
    if is_root_node && nritems == 1 {
        let child_bytenr = node.node_blockptr(0);
        let child_gen = node.node_ptr_generation(0);
        let child = fs.read_tree_block(child_bytenr, Some(child_gen))?;
        let child = cow_block(trans, root, &child, None)?;
        root.set_location(child.bytenr(), child.level(), trans.transid);
        trans.track_root(root)?;
        alloc::free_extent(trans, node.bytenr(), fs.nodesize() as u64);
        fs.cache.remove(node.bytenr());
        trans.untrack_dirty(node.bytenr());
        path.nodes[level] = None;
    }

    Ok(())
}

/// Merges a thin leaf with a sibling, or pulls items across, so every
/// non-root leaf stays at least a third full.
fn rebalance_leaf(trans: &Transaction, root: &Arc<Root>, path: &mut Path) -> Result<()> {
    let fs = trans.fs();
    let leaf = path.leaf()?.clone();
    let parent = match &path.nodes[1] {
        Some(p) => p.clone(),
        None => return Ok(()),
    };
    let parent_slot = path.slots[1];
    let parent_items = parent.nritems() as usize;

    // Prefer the right sibling; fall back to the left.
    let sibling_slot = if parent_slot + 1 < parent_items {
        parent_slot + 1
    } else if parent_slot > 0 {
        parent_slot - 1
    } else {
        return Ok(());
    };

    let sib_bytenr = parent.node_blockptr(sibling_slot);
    let sib_gen = parent.node_ptr_generation(sibling_slot);
    let sibling = fs.read_tree_block(sib_bytenr, Some(sib_gen))?;
    let sibling = cow_block(trans, root, &sibling, Some((&parent, sibling_slot)))?;

    let (left, right, right_parent_slot) = if sibling_slot > parent_slot {
        (leaf.clone(), sibling.clone(), sibling_slot)
    } else {
        (sibling.clone(), leaf.clone(), parent_slot)
    };

    if left.leaf_used() + right.leaf_used() <= left.capacity() {
        // Everything fits in the left leaf: merge and drop the right one.
        move_leaf_items(&right, &left, right.nritems() as usize)?;
        path.nodes[0] = Some(left);
        path.slots[1] = right_parent_slot;
        let right_bytenr = right.bytenr();
        del_node_ptr(trans, root, path, 1)?;
        alloc::free_extent(trans, right_bytenr, fs.nodesize() as u64);
        fs.cache.remove(right_bytenr);
        trans.untrack_dirty(right_bytenr);
        if sibling_slot > parent_slot {
            path.slots[1] = parent_slot;
        }
        return Ok(());
    }

    // Pull items from the fuller sibling until this leaf reaches a third.
    let target = leaf.capacity() / 3;
    if sibling_slot > parent_slot {
        let mut moved = 0;
        while leaf.leaf_used() < target && sibling.nritems() > 1 {
            move_leaf_items(&sibling, &leaf, 1)?;
            moved += 1;
        }
        if moved > 0 {
            parent.set_node_key(sibling_slot, &sibling.item_key(0));
        }
    } else {
        let mut moved = 0;
        while leaf.leaf_used() < target && sibling.nritems() > 1 {
            move_leaf_tail(&sibling, &leaf)?;
            moved += 1;
        }
        if moved > 0 {
            // The leaf's first key changed; ancestors may reference it.
            let key = leaf.item_key(0);
            fixup_low_keys(path, &key);
            path.slots[0] += moved;
        }
    }
    Ok(())
}

/// Moves the first `count` items of `src` onto the end of `dst`
fn move_leaf_items(src: &ExtentBuffer, dst: &ExtentBuffer, count: usize) -> Result<()> {
    for _ in 0..count {
        if src.nritems() == 0 {
            return Err(FsError::Invariant("moving items from empty leaf".to_string()));
        }
        let key = src.item_key(0);
        let data = src.item_data(0);
        append_leaf_item(dst, &key, &data)?;
        remove_leaf_item(src, 0);
    }
    Ok(())
}

/// Moves the last item of `src` to the front of `dst`
fn move_leaf_tail(src: &ExtentBuffer, dst: &ExtentBuffer) -> Result<()> {
    let last = src.nritems() as usize - 1;
    let key = src.item_key(last);
    let data = src.item_data(last);
    prepend_leaf_item(dst, &key, &data)?;
    remove_leaf_item(src, last);
    Ok(())
}

fn append_leaf_item(leaf: &ExtentBuffer, key: &Key, data: &[u8]) -> Result<()> {
    let nritems = leaf.nritems() as usize;
    if leaf.leaf_free_space() < data.len() + ITEM_SIZE {
        return Err(FsError::Invariant("append overflows leaf".to_string()));
    }
    let offset = leaf.leaf_data_end() - data.len();
    leaf.set_nritems(nritems as u32 + 1);
    leaf.set_item_key(nritems, key);
    leaf.set_item_offset(nritems, offset as u32);
    leaf.set_item_size(nritems, data.len() as u32);
    leaf.write_bytes(HEADER_SIZE + offset, data);
    Ok(())
}

fn prepend_leaf_item(leaf: &ExtentBuffer, key: &Key, data: &[u8]) -> Result<()> {
    let nritems = leaf.nritems() as usize;
    if leaf.leaf_free_space() < data.len() + ITEM_SIZE {
        return Err(FsError::Invariant("prepend overflows leaf".to_string()));
    }
    let data_end = leaf.leaf_data_end();
    let bound = leaf.capacity();
    leaf.with_data_mut(|bytes| {
        let dstart = HEADER_SIZE;
        let dend = HEADER_SIZE + nritems * ITEM_SIZE;
        bytes.copy_within(dstart..dend, dstart + ITEM_SIZE);
        bytes.copy_within(HEADER_SIZE + data_end..HEADER_SIZE + bound, HEADER_SIZE + data_end - data.len());
    });
    for i in 1..=nritems {
        let off = leaf.item_offset(i);
        leaf.set_item_offset(i, off - data.len() as u32);
    }
    leaf.set_item_key(0, key);
    leaf.set_item_offset(0, (bound - data.len()) as u32);
    leaf.set_item_size(0, data.len() as u32);
    leaf.set_nritems(nritems as u32 + 1);
    leaf.write_bytes(HEADER_SIZE + bound - data.len(), data);
    Ok(())
}

fn remove_leaf_item(leaf: &ExtentBuffer, slot: usize) {
    let nritems = leaf.nritems() as usize;
    let size = leaf.item_size(slot) as usize;
    let data_end = leaf.leaf_data_end();
    let victim_off = leaf.item_offset(slot) as usize;

    leaf.with_data_mut(|data| {
        data.copy_within(HEADER_SIZE + data_end..HEADER_SIZE + victim_off, HEADER_SIZE + data_end + size);
        let dstart = HEADER_SIZE + (slot + 1) * ITEM_SIZE;
        let dend = HEADER_SIZE + nritems * ITEM_SIZE;
        data.copy_within(dstart..dend, dstart - ITEM_SIZE);
    });
    for i in slot..nritems - 1 {
        let off = leaf.item_offset(i);
        leaf.set_item_offset(i, off + size as u32);
    }
    leaf.set_nritems(nritems as u32 - 1);
}

/// Advances the path to the first item of the next leaf.
/// Returns false at the end of the tree.
pub fn next_leaf(fs: &FsInfo, root: &Arc<Root>, path: &mut Path) -> Result<bool> {
    let (_, root_level, _) = root.location();
    let top = root_level as usize;

    let mut level = 1;
    loop {
        if level > top {
            return Ok(false);
        }
        let node = match &path.nodes[level] {
            Some(n) => n.clone(),
            None => return Ok(false),
        };
        if path.slots[level] + 1 < node.nritems() as usize {
            path.slots[level] += 1;
            break;
        }
        level += 1;
    }

    // Descend leftmost from the advanced slot.
    while level > 0 {
        let node = path.nodes[level]
            .as_ref()
            .ok_or_else(|| FsError::Invariant("broken path while iterating".to_string()))?
            .clone();
        let slot = path.slots[level];
        let child = fs.read_tree_block(node.node_blockptr(slot), Some(node.node_ptr_generation(slot)))?;
        level -= 1;
        path.nodes[level] = Some(child);
        path.slots[level] = 0;
    }
    Ok(true)
}

/// Advances the path one item, crossing leaves as needed
pub fn next_item(fs: &FsInfo, root: &Arc<Root>, path: &mut Path) -> Result<bool> {
    let leaf = path.leaf()?;
    if path.slots[0] + 1 < leaf.nritems() as usize {
        path.slots[0] += 1;
        return Ok(true);
    }
    next_leaf(fs, root, path)
}

/// Steps the path back one item. Returns false at the start of the tree.
pub fn prev_item(fs: &FsInfo, root: &Arc<Root>, path: &mut Path) -> Result<bool> {
    if path.slots[0] > 0 {
        path.slots[0] -= 1;
        return Ok(true);
    }

    let (_, root_level, _) = root.location();
    let top = root_level as usize;

    let mut level = 1;
    loop {
        if level > top {
            return Ok(false);
        }
        let node = match &path.nodes[level] {
            Some(n) => n.clone(),
            None => return Ok(false),
        };
        if path.slots[level] > 0 {
            path.slots[level] -= 1;
            break;
        }
        level += 1;
    }

    while level > 0 {
        let node = path.nodes[level]
            .as_ref()
            .ok_or_else(|| FsError::Invariant("broken path while iterating".to_string()))?
            .clone();
        let slot = path.slots[level];
        let child = fs.read_tree_block(node.node_blockptr(slot), Some(node.node_ptr_generation(slot)))?;
        let child_nritems = child.nritems();
        level -= 1;
        path.nodes[level] = Some(child);
        path.slots[level] = if child_nritems == 0 {
            0
        } else if level == 0 {
            child_nritems as usize - 1
        } else {
            child_nritems as usize - 1
        };
    }
    Ok(true)
}

/// Builds a raw leaf image from pre-sorted items; the bootstrap writer and
/// the restore path use this to fabricate blocks outside a transaction.
pub struct LeafBuilder {
    bytenr: u64,
    size: usize,
    owner: u64,
    generation: u64,
    items: Vec<(Key, Vec<u8>)>,
}

impl LeafBuilder {
    pub fn new(bytenr: u64, size: usize, owner: u64, generation: u64) -> Self {
        Self {
            bytenr,
            size,
            owner,
            generation,
            items: Vec::new(),
        }
    }

    /// Adds an item; keys must arrive in strictly ascending order
    pub fn add(&mut self, key: Key, data: Vec<u8>) -> Result<&mut Self> {
        if let Some((last, _)) = self.items.last() {
            if *last >= key {
                return Err(FsError::Invariant(format!(
                    "leaf items out of order at ({}, {}, {})",
                    { key.objectid },
                    { key.item_type },
                    { key.offset }
                )));
            }
        }
        self.items.push((key, data));
        Ok(self)
    }

    /// Produces the leaf bytes, header complete except for the checksum
    pub fn build(self, fsid: &[u8; 16], chunk_tree_uuid: &[u8; 16]) -> Result<Vec<u8>> {
        let eb = ExtentBuffer::new(self.bytenr, self.size);
        eb.set_fsid(fsid);
        eb.set_chunk_tree_uuid(chunk_tree_uuid);
        eb.set_header_bytenr(self.bytenr);
        eb.set_generation(self.generation);
        eb.set_owner(self.owner);
        eb.set_level(0);
        eb.set_backref_rev(BACKREF_REV_MIXED);
        eb.set_header_flags(HEADER_FLAG_WRITTEN);

        let needed: usize = self.items.iter().map(|(_, d)| d.len() + ITEM_SIZE).sum();
        if needed > eb.capacity() {
            return Err(FsError::Invariant(format!(
                "{} bytes of items overflow a {} byte leaf",
                needed,
                eb.capacity()
            )));
        }

        for (key, data) in &self.items {
            append_leaf_item(&eb, key, data)?;
        }
        Ok(eb.copy_to_vec())
    }
}
