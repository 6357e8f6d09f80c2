//! Root forest: named trees, subvolumes and snapshots
//!
//! Every tree hangs off a root item in the tree of trees (the superblock
//! locates that one, plus the chunk tree). Subvolume creation copies a root
//! node under a new owner and links it into the namespace; snapshots do the
//! same from a live root and record the parent UUID.

use super::checksum::name_hash;
use super::inode::{self, InodeItem};
use super::transaction::Transaction;
use super::tree::{self, Key};
use super::{item_type, objectid, FsError, FsInfo, Result};
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::RwLock;
use std::sync::Arc;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

/// Serialised size of a root item (v2 layout)
pub const ROOT_ITEM_SIZE: usize = 439;

/// Bytes of the pre-v2 layout, up to and including `level`
const ROOT_ITEM_SIZE_V0: usize = 239;

/// Root item flags
pub mod root_flags {
    /// Subvolume is read-only
    pub const RDONLY: u64 = 1 << 0;
}

/// Timestamp pair used across root and inode items
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
#[repr(C, packed)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: u32,
}

/// Per-tree root item, laid out field for field as it is on disk
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
#[repr(C, packed)]
pub struct RootItem {
    /// Embedded inode item
    pub inode: InodeItem,
    pub generation: u64,
    pub root_dirid: u64,
    pub bytenr: u64,
    pub byte_limit: u64,
    pub bytes_used: u64,
    pub last_snapshot: u64,
    pub flags: u64,
    pub refs: u32,
    pub drop_progress: Key,
    pub drop_level: u8,
    pub level: u8,
    pub generation_v2: u64,
    pub uuid: [u8; 16],
    pub parent_uuid: [u8; 16],
    pub received_uuid: [u8; 16],
    pub ctransid: u64,
    pub otransid: u64,
    pub stransid: u64,
    pub rtransid: u64,
    pub ctime: TimeSpec,
    pub otime: TimeSpec,
    pub stime: TimeSpec,
    pub rtime: TimeSpec,
    /// Future expansion
    pub reserved: [u64; 8],
}

impl RootItem {
    /// A fresh root item pointing at `bytenr`
    pub fn new(bytenr: u64, level: u8, generation: u64) -> Self {
        let mut inode = InodeItem::default();
        inode.generation = 1;
        inode.size = 3;
        inode.nlink = 1;
        inode.nbytes = 16384;
        inode.mode = 0o40755;
        Self {
            inode,
            generation,
            root_dirid: inode::FIRST_FREE_OBJECTID,
            bytenr,
            refs: 1,
            level,
            generation_v2: generation,
            ..Default::default()
        }
    }

    /// Parses a root item; tolerates the short pre-v2 layout
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() >= ROOT_ITEM_SIZE {
            return Self::read_from_bytes(&data[..ROOT_ITEM_SIZE])
                .map_err(|_| FsError::CorruptRead("root item layout mismatch".to_string()));
        }
        if data.len() < ROOT_ITEM_SIZE_V0 {
            return Err(FsError::CorruptRead(format!(
                "root item too small: {} bytes",
                data.len()
            )));
        }

        // Pre-v2 items stop after `level`; the tail stays zero and the
        // generation carries over.
        let mut item = Self::new_zeroed();
        item.as_mut_bytes()[..ROOT_ITEM_SIZE_V0].copy_from_slice(&data[..ROOT_ITEM_SIZE_V0]);
        item.generation_v2 = item.generation;
        Ok(item)
    }

    /// Serialises the full v2 layout
    pub fn to_bytes(&self) -> [u8; ROOT_ITEM_SIZE] {
        let mut out = [0u8; ROOT_ITEM_SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }

    pub fn is_readonly(&self) -> bool {
        self.flags & root_flags::RDONLY != 0
    }
}

/// A handle on one tree of the forest
pub struct Root {
    objectid: u64,
    item: RwLock<RootItem>,
}

impl Root {
    /// A root located by the superblock rather than a root item
    pub fn pinned(objectid: u64, bytenr: u64, level: u8, generation: u64) -> Self {
        Self {
            objectid,
            item: RwLock::new(RootItem::new(bytenr, level, generation)),
        }
    }

    pub fn from_item(objectid: u64, item: RootItem) -> Self {
        Self {
            objectid,
            item: RwLock::new(item),
        }
    }

    pub fn objectid(&self) -> u64 {
        self.objectid
    }

    /// `(bytenr, level, generation)` of the current root block
    pub fn location(&self) -> (u64, u8, u64) {
        let item = self.item.read();
        (item.bytenr, item.level, item.generation)
    }

    /// Repoints the root after a copy-on-write of its top block
    pub fn set_location(&self, bytenr: u64, level: u8, generation: u64) {
        let mut item = self.item.write();
        item.bytenr = bytenr;
        item.level = level;
        item.generation = generation;
        item.generation_v2 = generation;
    }

    pub fn item(&self) -> RootItem {
        self.item.read().clone()
    }

    pub fn restore_item(&self, item: RootItem) {
        *self.item.write() = item;
    }

    pub fn update_item(&self, f: impl FnOnce(&mut RootItem)) {
        f(&mut self.item.write())
    }
}

/// Locates the root item for `objectid` in the tree of trees
fn search_root_item(fs: &FsInfo, objectid: u64) -> Result<RootItem> {
    let tree_root = fs.tree_root();
    let key = Key::new(objectid, item_type::ROOT_ITEM, 0);
    let mut path = tree::Path::new();
    let found = tree::search_slot(None, fs, &tree_root, &key, 0, false, &mut path)?;

    let leaf = path.leaf()?;
    let slot = path.slots[0];
    let data = if found {
        leaf.item_data(slot)
    } else if slot < leaf.nritems() as usize {
        // Snapshot root items carry a transid offset; any entry with the
        // right objectid and type will do.
        let k = leaf.item_key(slot);
        if k.objectid == objectid && k.item_type == item_type::ROOT_ITEM {
            leaf.item_data(slot)
        } else {
            return Err(FsError::NotFound(format!("root {}", objectid)));
        }
    } else {
        return Err(FsError::NotFound(format!("root {}", objectid)));
    };

    RootItem::from_bytes(&data)
}

/// Loads a root handle from the tree of trees
pub fn find_root(fs: &FsInfo, objectid: u64) -> Result<Root> {
    let item = search_root_item(fs, objectid)?;
    Ok(Root::from_item(objectid, item))
}

/// Writes the root items of every touched tree back into the tree of trees.
/// The tree root and chunk root are superblock-located and skipped.
pub(crate) fn flush_root_items(trans: &Transaction) -> Result<()> {
    let fs = trans.fs();
    let tree_root = fs.tree_root();

    for root in trans.touched_roots_list() {
        if root.objectid() == objectid::ROOT_TREE || root.objectid() == objectid::CHUNK_TREE {
            continue;
        }
        // The item's generation was stamped when the root block was copied;
        // a root whose item changed without a copy (last_snapshot, received
        // uuid) keeps the generation of its on-disk block.
        let item = root.item();

        let key = Key::new(root.objectid(), item_type::ROOT_ITEM, 0);
        let mut path = tree::Path::new();
        let found = tree::search_slot(
            Some(trans),
            fs,
            &tree_root,
            &key,
            ROOT_ITEM_SIZE + tree::ITEM_SIZE,
            true,
            &mut path,
        )?;
        if found {
            path.leaf()?.set_item_payload(path.slots[0], &item.to_bytes());
        } else {
            tree::insert_empty_item(trans, &tree_root, &mut path, &key, ROOT_ITEM_SIZE)?;
            path.leaf()?.set_item_payload(path.slots[0], &item.to_bytes());
        }
    }
    Ok(())
}

/// Root ref / backref payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootRef {
    pub dirid: u64,
    pub sequence: u64,
    pub name: Vec<u8>,
}

impl RootRef {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 18 {
            return Err(FsError::CorruptRead("root ref too small".to_string()));
        }
        let name_len = LittleEndian::read_u16(&data[16..18]) as usize;
        if data.len() < 18 + name_len {
            return Err(FsError::CorruptRead("root ref name truncated".to_string()));
        }
        Ok(Self {
            dirid: LittleEndian::read_u64(&data[0..8]),
            sequence: LittleEndian::read_u64(&data[8..16]),
            name: data[18..18 + name_len].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; 18 + self.name.len()];
        LittleEndian::write_u64(&mut out[0..8], self.dirid);
        LittleEndian::write_u64(&mut out[8..16], self.sequence);
        LittleEndian::write_u16(&mut out[16..18], self.name.len() as u16);
        out[18..].copy_from_slice(&self.name);
        out
    }
}

/// Splits a 16-byte UUID into the two u64 halves used as uuid-tree keys
fn uuid_key_halves(uuid: &[u8; 16]) -> (u64, u64) {
    (
        LittleEndian::read_u64(&uuid[0..8]),
        LittleEndian::read_u64(&uuid[8..16]),
    )
}

/// Inserts a uuid-tree entry mapping `uuid` to `subvol_id`
pub fn insert_uuid_entry(trans: &Transaction, key_type: u8, uuid: &[u8; 16], subvol_id: u64) -> Result<()> {
    let fs = trans.fs();
    let uuid_root = fs.read_root(objectid::UUID_TREE)?;
    let (hi, lo) = uuid_key_halves(uuid);
    let key = Key::new(hi, key_type, lo);
    let mut id = [0u8; 8];
    LittleEndian::write_u64(&mut id, subvol_id);
    match tree::insert_item(trans, &uuid_root, &key, &id) {
        // An entry may already exist when a subvolume is received twice;
        // the id list format appends, and the latest wins on lookup.
        Err(FsError::Exists(_)) => {
            let mut path = tree::Path::new();
            tree::search_slot(Some(trans), fs, &uuid_root, &key, 0, true, &mut path)?;
            path.leaf()?.set_item_payload(path.slots[0], &id);
            Ok(())
        }
        other => other,
    }
}

/// Looks up a subvolume id by UUID
pub fn lookup_uuid_entry(fs: &FsInfo, key_type: u8, uuid: &[u8; 16]) -> Result<u64> {
    let uuid_root = fs.read_root(objectid::UUID_TREE)?;
    let (hi, lo) = uuid_key_halves(uuid);
    let key = Key::new(hi, key_type, lo);
    let mut path = tree::Path::new();
    let found = tree::search_slot(None, fs, &uuid_root, &key, 0, false, &mut path)?;
    if !found {
        return Err(FsError::NotFound(format!(
            "uuid {}",
            uuid::Uuid::from_bytes(*uuid)
        )));
    }
    let data = path.leaf()?.item_data(path.slots[0]);
    if data.len() < 8 {
        return Err(FsError::CorruptRead("short uuid tree entry".to_string()));
    }
    Ok(LittleEndian::read_u64(&data[0..8]))
}

/// First unused subvolume objectid
fn find_free_root_objectid(fs: &FsInfo) -> Result<u64> {
    let tree_root = fs.tree_root();
    let mut path = tree::Path::new();
    let key = Key::new(objectid::LAST_FREE, u8::MAX, u64::MAX);
    tree::search_slot(None, fs, &tree_root, &key, 0, false, &mut path)?;

    let mut max_id = objectid::FIRST_FREE - 1;
    loop {
        let leaf = path.leaf()?.clone();
        let nritems = leaf.nritems() as usize;
        if nritems == 0 {
            break;
        }
        if path.slots[0] >= nritems {
            path.slots[0] = nritems - 1;
        }
        let k = leaf.item_key(path.slots[0]);
        // Copy the packed key field before borrowing it for the range test.
        let k_objectid = { k.objectid };
        if k.item_type == item_type::ROOT_ITEM
            && (objectid::FIRST_FREE..objectid::LAST_FREE).contains(&k_objectid)
        {
            max_id = k_objectid;
            break;
        }
        if k.objectid < objectid::FIRST_FREE {
            break;
        }
        if !tree::prev_item(fs, &tree_root, &mut path)? {
            break;
        }
    }
    Ok(max_id + 1)
}

/// Options for creating a subvolume
pub struct SubvolOptions {
    /// Link the new root under this directory inode of the parent subvol
    pub parent_dir: u64,
    /// Mark the subvolume read-only
    pub readonly: bool,
}

impl Default for SubvolOptions {
    fn default() -> Self {
        Self {
            parent_dir: inode::FIRST_FREE_OBJECTID,
            readonly: false,
        }
    }
}

/// Creates an empty subvolume linked into `parent_root` under `name`
pub fn create_subvolume(
    trans: &Transaction,
    parent_root: &Arc<Root>,
    name: &[u8],
    opts: &SubvolOptions,
) -> Result<Arc<Root>> {
    let fs = trans.fs();
    let new_id = find_free_root_objectid(fs)?;

    // Root node: a leaf holding the subvolume's root directory inode.
    let root = Arc::new(Root::pinned(new_id, 0, 0, trans.transid));
    let leaf = tree::alloc_tree_block(trans, &root, 0)?;
    root.set_location(leaf.bytenr(), 0, trans.transid);

    let mut item = RootItem::new(leaf.bytenr(), 0, trans.transid);
    item.uuid = *uuid::Uuid::new_v4().as_bytes();
    item.otransid = trans.transid;
    if opts.readonly {
        item.flags |= root_flags::RDONLY;
    }
    root.restore_item(item);
    trans.track_root(&root)?;

    let root = register_subvolume(trans, parent_root, root, name, opts)?;

    // Root directory inode of the new tree.
    let dir = InodeItem::directory(trans.transid);
    inode::insert_inode(trans, &root, inode::FIRST_FREE_OBJECTID, &dir)?;
    inode::insert_inode_ref(trans, &root, inode::FIRST_FREE_OBJECTID, inode::FIRST_FREE_OBJECTID, b"..", 0)?;

    Ok(root)
}

/// Snapshots `source` under `name` in `parent_root`.
///
/// The source root node is copied under the new objectid; children become
/// shared and gain a reference each.
pub fn create_snapshot(
    trans: &Transaction,
    parent_root: &Arc<Root>,
    source: &Arc<Root>,
    name: &[u8],
    opts: &SubvolOptions,
) -> Result<Arc<Root>> {
    let fs = trans.fs();
    let new_id = find_free_root_objectid(fs)?;

    let (src_bytenr, src_level, src_gen) = source.location();
    let src_eb = fs.read_tree_block(src_bytenr, Some(src_gen))?;

    let root = Arc::new(Root::pinned(new_id, 0, src_level, trans.transid));
    let copy = tree::alloc_tree_block(trans, &root, src_level)?;
    let bytes = src_eb.copy_to_vec();
    copy.with_data_mut(|data| data.copy_from_slice(&bytes));
    copy.set_header_bytenr(copy.bytenr());
    copy.set_generation(trans.transid);
    copy.set_owner(new_id);

    // Children are now referenced from both trees.
    if src_level > 0 {
        for slot in 0..copy.nritems() as usize {
            trans.record_new_extent(super::alloc::ExtentRecord {
                bytenr: copy.node_blockptr(slot),
                num_bytes: fs.nodesize() as u64,
                owner: new_id,
                kind: super::alloc::ExtentKind::TreeBlock {
                    level: src_level - 1,
                    first_key: copy.node_key(slot),
                },
            });
        }
    }

    let source_item = source.item();
    let mut item = RootItem::new(copy.bytenr(), src_level, trans.transid);
    item.inode = source_item.inode;
    item.bytes_used = source_item.bytes_used;
    item.uuid = *uuid::Uuid::new_v4().as_bytes();
    item.parent_uuid = source_item.uuid;
    item.otransid = trans.transid;
    item.ctransid = source_item.ctransid;
    if opts.readonly {
        item.flags |= root_flags::RDONLY;
    }
    root.restore_item(item);
    trans.track_root(&root)?;

    source.update_item(|i| i.last_snapshot = trans.transid);
    trans.track_root(source)?;

    register_subvolume(trans, parent_root, root, name, opts)
}

/// Inserts the naming triplet for a new root: dir entry in the parent
/// subvolume, ROOT_REF / ROOT_BACKREF pair, uuid tree entry.
fn register_subvolume(
    trans: &Transaction,
    parent_root: &Arc<Root>,
    root: Arc<Root>,
    name: &[u8],
    opts: &SubvolOptions,
) -> Result<Arc<Root>> {
    let fs = trans.fs();
    let tree_root = fs.tree_root();
    let new_id = root.objectid();

    let location = Key::new(new_id, item_type::ROOT_ITEM, u64::MAX);
    let index = inode::next_dir_index(fs, parent_root, opts.parent_dir)?;
    inode::insert_dir_entry(
        trans,
        parent_root,
        opts.parent_dir,
        name,
        &location,
        inode::FileType::Directory,
        index,
        &[],
    )?;

    let root_ref = RootRef {
        dirid: opts.parent_dir,
        sequence: index,
        name: name.to_vec(),
    };
    tree::insert_item(
        trans,
        &tree_root,
        &Key::new(parent_root.objectid(), item_type::ROOT_REF, new_id),
        &root_ref.to_bytes(),
    )?;
    tree::insert_item(
        trans,
        &tree_root,
        &Key::new(new_id, item_type::ROOT_BACKREF, parent_root.objectid()),
        &root_ref.to_bytes(),
    )?;

    let uuid = root.item().uuid;
    insert_uuid_entry(trans, item_type::UUID_SUBVOL, &uuid, new_id)?;

    tracing::info!(
        subvol = new_id,
        name = %String::from_utf8_lossy(name),
        "created subvolume"
    );
    Ok(root)
}

/// Records the received-UUID binding after a receive completes, so the next
/// incremental stream can locate this subvolume as its parent.
pub fn set_received(
    trans: &Transaction,
    root: &Arc<Root>,
    received_uuid: [u8; 16],
    stransid: u64,
    rtransid: u64,
) -> Result<()> {
    root.update_item(|item| {
        item.received_uuid = received_uuid;
        item.stransid = stransid;
        item.rtransid = rtransid;
    });
    trans.track_root(root)?;
    insert_uuid_entry(
        trans,
        item_type::UUID_RECEIVED_SUBVOL,
        &received_uuid,
        root.objectid(),
    )?;
    Ok(())
}

/// Resolves a subvolume name in a parent subvolume to its root objectid
pub fn lookup_subvolume(fs: &FsInfo, parent_root: &Arc<Root>, dir: u64, name: &[u8]) -> Result<u64> {
    let key = Key::new(dir, item_type::DIR_ITEM, name_hash(name));
    let mut path = tree::Path::new();
    let found = tree::search_slot(None, fs, parent_root, &key, 0, false, &mut path)?;
    if !found {
        return Err(FsError::NotFound(format!(
            "subvolume {}",
            String::from_utf8_lossy(name)
        )));
    }
    let data = path.leaf()?.item_data(path.slots[0]);
    for entry in inode::DirEntry::parse_all(&data)? {
        if entry.name == name && entry.location.item_type == item_type::ROOT_ITEM {
            return Ok(entry.location.objectid);
        }
    }
    Err(FsError::NotFound(format!(
        "subvolume {}",
        String::from_utf8_lossy(name)
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item() -> RootItem {
        let mut item = RootItem::new(0x1000000, 1, 200);
        item.bytes_used = 4096;
        item.last_snapshot = 150;
        item.refs = 1;
        item.uuid = [1u8; 16];
        item.parent_uuid = [2u8; 16];
        item.received_uuid = [3u8; 16];
        item.ctransid = 100;
        item.otransid = 101;
        item.ctime = TimeSpec { sec: 1700000000, nsec: 123456 };
        item
    }

    #[test]
    fn test_root_item_size() {
        assert_eq!(std::mem::size_of::<RootItem>(), ROOT_ITEM_SIZE);
        assert_eq!(std::mem::size_of::<TimeSpec>(), 12);
        assert_eq!(sample_item().to_bytes().len(), ROOT_ITEM_SIZE);
    }

    #[test]
    fn test_root_item_field_offsets() {
        // The struct is the on-disk layout; pin the documented offsets.
        let mut item = RootItem::new(0x1000000, 1, 200);
        item.rtransid = 0x1122_3344;
        let bytes = item.to_bytes();
        assert_eq!(&bytes[176..184], &0x1000000u64.to_le_bytes());
        assert_eq!(bytes[238], 1);
        assert_eq!(&bytes[319..327], &0x1122_3344u64.to_le_bytes());
    }

    #[test]
    fn test_root_item_roundtrip() {
        let item = sample_item();
        let parsed = RootItem::from_bytes(&item.to_bytes()).unwrap();
        assert_eq!(parsed, item);
    }

    #[test]
    fn test_root_item_short_layout() {
        let item = sample_item();
        let bytes = item.to_bytes();
        // Pre-v2 tools wrote only the first 239 bytes.
        let parsed = RootItem::from_bytes(&bytes[..239]).unwrap();
        // Copy packed fields before comparing.
        assert_eq!({ parsed.bytenr }, { item.bytenr });
        assert_eq!({ parsed.level }, { item.level });
        assert_eq!({ parsed.generation_v2 }, { parsed.generation });
        assert_eq!({ parsed.uuid }, [0u8; 16]);
    }

    #[test]
    fn test_root_item_too_small() {
        assert!(RootItem::from_bytes(&[0u8; 100]).is_err());
    }

    #[test]
    fn test_root_item_readonly_flag() {
        let mut item = sample_item();
        assert!(!item.is_readonly());
        item.flags |= root_flags::RDONLY;
        let parsed = RootItem::from_bytes(&item.to_bytes()).unwrap();
        assert!(parsed.is_readonly());
    }

    #[test]
    fn test_root_handle_location() {
        let root = Root::pinned(objectid::FS_TREE, 0x2000000, 1, 10);
        assert_eq!(root.objectid(), objectid::FS_TREE);
        assert_eq!(root.location(), (0x2000000, 1, 10));

        root.set_location(0x3000000, 2, 11);
        assert_eq!(root.location(), (0x3000000, 2, 11));
        assert_eq!({ root.item().generation_v2 }, 11);

        let saved = root.item();
        root.set_location(0x4000000, 2, 12);
        root.restore_item(saved);
        assert_eq!(root.location(), (0x3000000, 2, 11));
    }

    #[test]
    fn test_root_ref_roundtrip() {
        let r = RootRef {
            dirid: 256,
            sequence: 3,
            name: b"ext2_saved".to_vec(),
        };
        let parsed = RootRef::from_bytes(&r.to_bytes()).unwrap();
        assert_eq!(parsed, r);
    }

    #[test]
    fn test_root_ref_truncated_name() {
        let r = RootRef {
            dirid: 256,
            sequence: 3,
            name: b"snap".to_vec(),
        };
        let bytes = r.to_bytes();
        assert!(RootRef::from_bytes(&bytes[..20]).is_err());
    }

    #[test]
    fn test_uuid_key_halves() {
        let uuid: [u8; 16] = [
            1, 0, 0, 0, 0, 0, 0, 0, //
            2, 0, 0, 0, 0, 0, 0, 0,
        ];
        assert_eq!(uuid_key_halves(&uuid), (1, 2));
    }
}
