//! Inode, directory and file-extent items
//!
//! Inodes are ordinary items in a subvolume tree: the inode item itself,
//! name back-references, directory entries indexed twice (by name hash and
//! by insertion order) and file extents describing where content lives.

use super::checksum::name_hash;
use super::roots::{Root, TimeSpec};
use super::transaction::Transaction;
use super::tree::{self, Key, ITEM_SIZE, KEY_SIZE};
use super::{item_type, FsError, FsInfo, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::sync::Arc;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// First objectid available for inodes inside a subvolume
pub const FIRST_FREE_OBJECTID: u64 = 256;

/// Serialised size of an inode item
pub const INODE_ITEM_SIZE: usize = 160;

/// Serialised size of a regular file extent item
pub const FILE_EXTENT_ITEM_SIZE: usize = 53;

/// Offset of inline data inside an inline file extent item
pub const FILE_EXTENT_INLINE_DATA_OFFSET: usize = 21;

/// Directory entries start their index numbering here
pub const FIRST_DIR_INDEX: u64 = 2;

/// Inode flags
pub mod inode_flags {
    pub const NODATASUM: u64 = 1 << 0;
    pub const NODATACOW: u64 = 1 << 1;
    pub const READONLY: u64 = 1 << 2;
    pub const NOCOMPRESS: u64 = 1 << 3;
    pub const PREALLOC: u64 = 1 << 4;
    pub const IMMUTABLE: u64 = 1 << 6;
}

/// File types as stored in directory entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Unknown,
    RegularFile,
    Directory,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Symlink,
    /// Extended attributes reuse the directory entry layout
    Xattr,
}

impl FileType {
    /// Creates a file type from a directory entry type byte
    #[inline]
    pub const fn from_dir_type(t: u8) -> Self {
        match t {
            1 => Self::RegularFile,
            2 => Self::Directory,
            3 => Self::CharDevice,
            4 => Self::BlockDevice,
            5 => Self::Fifo,
            6 => Self::Socket,
            7 => Self::Symlink,
            8 => Self::Xattr,
            _ => Self::Unknown,
        }
    }

    /// The directory entry type byte
    #[inline]
    pub const fn to_dir_type(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::RegularFile => 1,
            Self::Directory => 2,
            Self::CharDevice => 3,
            Self::BlockDevice => 4,
            Self::Fifo => 5,
            Self::Socket => 6,
            Self::Symlink => 7,
            Self::Xattr => 8,
        }
    }

    /// Creates a file type from mode bits
    #[inline]
    pub const fn from_mode(mode: u32) -> Self {
        match mode & 0o170000 {
            0o100000 => Self::RegularFile,
            0o040000 => Self::Directory,
            0o120000 => Self::Symlink,
            0o060000 => Self::BlockDevice,
            0o020000 => Self::CharDevice,
            0o010000 => Self::Fifo,
            0o140000 => Self::Socket,
            _ => Self::Unknown,
        }
    }
}

/// On-disk inode item, laid out field for field as it is on disk
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
#[repr(C, packed)]
pub struct InodeItem {
    pub generation: u64,
    pub transid: u64,
    pub size: u64,
    pub nbytes: u64,
    pub block_group: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub rdev: u64,
    pub flags: u64,
    pub sequence: u64,
    /// Future expansion
    pub reserved: [u8; 32],
    pub atime: TimeSpec,
    pub ctime: TimeSpec,
    pub mtime: TimeSpec,
    pub otime: TimeSpec,
}

impl InodeItem {
    /// A fresh directory inode
    pub fn directory(transid: u64) -> Self {
        Self {
            generation: transid,
            transid,
            size: 0,
            nlink: 1,
            mode: 0o40755,
            ..Default::default()
        }
    }

    /// A fresh regular file inode
    pub fn regular(transid: u64, size: u64) -> Self {
        Self {
            generation: transid,
            transid,
            size,
            nbytes: size,
            nlink: 1,
            mode: 0o100644,
            ..Default::default()
        }
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < INODE_ITEM_SIZE {
            return Err(FsError::CorruptRead(format!(
                "inode item too small: {} bytes",
                data.len()
            )));
        }
        Self::read_from_bytes(&data[..INODE_ITEM_SIZE])
            .map_err(|_| FsError::CorruptRead("inode item layout mismatch".to_string()))
    }

    pub fn to_bytes(&self) -> [u8; INODE_ITEM_SIZE] {
        zerocopy::transmute!(*self)
    }
}

/// One parsed directory entry; several can share a DIR_ITEM on hash
/// collision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub location: Key,
    pub transid: u64,
    pub file_type: FileType,
    pub name: Vec<u8>,
    /// Xattr items reuse the layout with a value payload
    pub data: Vec<u8>,
}

impl DirEntry {
    /// Fixed prefix before name and data
    pub const HEADER_SIZE: usize = KEY_SIZE + 8 + 2 + 2 + 1;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::HEADER_SIZE + self.name.len() + self.data.len()];
        out[0..KEY_SIZE].copy_from_slice(&self.location.to_bytes());
        LittleEndian::write_u64(&mut out[KEY_SIZE..KEY_SIZE + 8], self.transid);
        LittleEndian::write_u16(&mut out[KEY_SIZE + 8..KEY_SIZE + 10], self.data.len() as u16);
        LittleEndian::write_u16(&mut out[KEY_SIZE + 10..KEY_SIZE + 12], self.name.len() as u16);
        out[KEY_SIZE + 12] = self.file_type.to_dir_type();
        out[Self::HEADER_SIZE..Self::HEADER_SIZE + self.name.len()].copy_from_slice(&self.name);
        out[Self::HEADER_SIZE + self.name.len()..].copy_from_slice(&self.data);
        out
    }

    /// Parses every entry packed into one item payload
    pub fn parse_all(data: &[u8]) -> Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            if offset + Self::HEADER_SIZE > data.len() {
                return Err(FsError::CorruptRead("truncated directory entry".to_string()));
            }
            let location = Key::from_bytes(&data[offset..offset + KEY_SIZE]);
            let transid = LittleEndian::read_u64(&data[offset + KEY_SIZE..offset + KEY_SIZE + 8]);
            let data_len =
                LittleEndian::read_u16(&data[offset + KEY_SIZE + 8..offset + KEY_SIZE + 10]) as usize;
            let name_len =
                LittleEndian::read_u16(&data[offset + KEY_SIZE + 10..offset + KEY_SIZE + 12]) as usize;
            let file_type = FileType::from_dir_type(data[offset + KEY_SIZE + 12]);
            let body = offset + Self::HEADER_SIZE;
            if body + name_len + data_len > data.len() {
                return Err(FsError::CorruptRead("directory entry name overflow".to_string()));
            }
            out.push(DirEntry {
                location,
                transid,
                file_type,
                name: data[body..body + name_len].to_vec(),
                data: data[body + name_len..body + name_len + data_len].to_vec(),
            });
            offset = body + name_len + data_len;
        }
        Ok(out)
    }
}

/// File extent types
pub mod file_extent_type {
    pub const INLINE: u8 = 0;
    pub const REGULAR: u8 = 1;
    pub const PREALLOC: u8 = 2;
}

/// On-disk file extent item (regular and prealloc forms)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileExtentItem {
    pub generation: u64,
    pub ram_bytes: u64,
    pub compression: u8,
    pub extent_type: u8,
    /// 0 encodes a hole
    pub disk_bytenr: u64,
    pub disk_num_bytes: u64,
    /// Offset into the on-disk extent
    pub offset: u64,
    pub num_bytes: u64,
}

impl FileExtentItem {
    /// A plain uncompressed extent mapping
    pub fn regular(generation: u64, disk_bytenr: u64, num_bytes: u64) -> Self {
        Self {
            generation,
            ram_bytes: num_bytes,
            compression: 0,
            extent_type: file_extent_type::REGULAR,
            disk_bytenr,
            disk_num_bytes: num_bytes,
            offset: 0,
            num_bytes,
        }
    }

    /// A hole of `num_bytes`
    pub fn hole(generation: u64, num_bytes: u64) -> Self {
        Self {
            generation,
            ram_bytes: num_bytes,
            compression: 0,
            extent_type: file_extent_type::REGULAR,
            disk_bytenr: 0,
            disk_num_bytes: 0,
            offset: 0,
            num_bytes,
        }
    }

    pub fn is_hole(&self) -> bool {
        self.extent_type != file_extent_type::INLINE && self.disk_bytenr == 0
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < FILE_EXTENT_INLINE_DATA_OFFSET {
            return Err(FsError::CorruptRead("file extent item too small".to_string()));
        }
        let extent_type = data[20];
        let mut item = Self {
            generation: LittleEndian::read_u64(&data[0..8]),
            ram_bytes: LittleEndian::read_u64(&data[8..16]),
            compression: data[16],
            extent_type,
            ..Default::default()
        };
        if extent_type == file_extent_type::INLINE {
            item.num_bytes = item.ram_bytes;
            return Ok(item);
        }
        if data.len() < FILE_EXTENT_ITEM_SIZE {
            return Err(FsError::CorruptRead("file extent item truncated".to_string()));
        }
        item.disk_bytenr = LittleEndian::read_u64(&data[21..29]);
        item.disk_num_bytes = LittleEndian::read_u64(&data[29..37]);
        item.offset = LittleEndian::read_u64(&data[37..45]);
        item.num_bytes = LittleEndian::read_u64(&data[45..53]);
        Ok(item)
    }

    pub fn to_bytes(&self) -> [u8; FILE_EXTENT_ITEM_SIZE] {
        let mut out = [0u8; FILE_EXTENT_ITEM_SIZE];
        LittleEndian::write_u64(&mut out[0..8], self.generation);
        LittleEndian::write_u64(&mut out[8..16], self.ram_bytes);
        out[16] = self.compression;
        out[20] = self.extent_type;
        LittleEndian::write_u64(&mut out[21..29], self.disk_bytenr);
        LittleEndian::write_u64(&mut out[29..37], self.disk_num_bytes);
        LittleEndian::write_u64(&mut out[37..45], self.offset);
        LittleEndian::write_u64(&mut out[45..53], self.num_bytes);
        out
    }

    /// Serialises an inline extent wrapping `data`
    pub fn inline_bytes(generation: u64, compression: u8, ram_bytes: u64, data: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; FILE_EXTENT_INLINE_DATA_OFFSET + data.len()];
        LittleEndian::write_u64(&mut out[0..8], generation);
        LittleEndian::write_u64(&mut out[8..16], ram_bytes);
        out[16] = compression;
        out[20] = file_extent_type::INLINE;
        out[FILE_EXTENT_INLINE_DATA_OFFSET..].copy_from_slice(data);
        out
    }
}

/// Inserts a new inode item
pub fn insert_inode(trans: &Transaction, root: &Arc<Root>, ino: u64, item: &InodeItem) -> Result<()> {
    let key = Key::new(ino, item_type::INODE_ITEM, 0);
    tree::insert_item(trans, root, &key, &item.to_bytes())
}

/// Rewrites an existing inode item
pub fn update_inode(trans: &Transaction, root: &Arc<Root>, ino: u64, item: &InodeItem) -> Result<()> {
    let fs = trans.fs();
    let key = Key::new(ino, item_type::INODE_ITEM, 0);
    let mut path = tree::Path::new();
    let found = tree::search_slot(Some(trans), fs, root, &key, 0, true, &mut path)?;
    if !found {
        return Err(FsError::NotFound(format!("inode {}", ino)));
    }
    path.leaf()?.set_item_payload(path.slots[0], &item.to_bytes());
    Ok(())
}

/// Reads an inode item
pub fn lookup_inode(fs: &FsInfo, root: &Arc<Root>, ino: u64) -> Result<InodeItem> {
    let key = Key::new(ino, item_type::INODE_ITEM, 0);
    let mut path = tree::Path::new();
    let found = tree::search_slot(None, fs, root, &key, 0, false, &mut path)?;
    if !found {
        return Err(FsError::NotFound(format!("inode {}", ino)));
    }
    InodeItem::from_bytes(&path.leaf()?.item_data(path.slots[0]))
}

/// Adds a name back-reference for an inode
pub fn insert_inode_ref(
    trans: &Transaction,
    root: &Arc<Root>,
    ino: u64,
    parent_ino: u64,
    name: &[u8],
    index: u64,
) -> Result<()> {
    let fs = trans.fs();
    let key = Key::new(ino, item_type::INODE_REF, parent_ino);

    let mut entry = vec![0u8; 10 + name.len()];
    LittleEndian::write_u64(&mut entry[0..8], index);
    LittleEndian::write_u16(&mut entry[8..10], name.len() as u16);
    entry[10..].copy_from_slice(name);

    let mut path = tree::Path::new();
    let found = tree::search_slot(
        Some(trans),
        fs,
        root,
        &key,
        entry.len() + ITEM_SIZE,
        true,
        &mut path,
    )?;
    if found {
        // Another link from the same directory: extend the existing item.
        let mut data = path.leaf()?.item_data(path.slots[0]);
        data.extend_from_slice(&entry);
        tree::del_item(trans, root, &mut path)?;
        tree::insert_item(trans, root, &key, &data)?;
    } else {
        tree::insert_empty_item(trans, root, &mut path, &key, entry.len())?;
        path.leaf()?.set_item_payload(path.slots[0], &entry);
    }
    Ok(())
}

/// Next free directory index for `dir`
pub fn next_dir_index(fs: &FsInfo, root: &Arc<Root>, dir: u64) -> Result<u64> {
    let key = Key::new(dir, item_type::DIR_INDEX, u64::MAX);
    let mut path = tree::Path::new();
    tree::search_slot(None, fs, root, &key, 0, false, &mut path)?;

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
        if k.objectid == dir && k.item_type == item_type::DIR_INDEX {
            return Ok(k.offset + 1);
        }
        if k < Key::new(dir, item_type::DIR_INDEX, 0) {
            break;
        }
        if !tree::prev_item(fs, root, &mut path)? {
            break;
        }
    }
    Ok(FIRST_DIR_INDEX)
}

/// Inserts a directory entry: the hash-keyed DIR_ITEM (appending on
/// collision) plus the order-keyed DIR_INDEX.
pub fn insert_dir_entry(
    trans: &Transaction,
    root: &Arc<Root>,
    dir: u64,
    name: &[u8],
    location: &Key,
    file_type: FileType,
    index: u64,
    data: &[u8],
) -> Result<()> {
    let fs = trans.fs();
    let entry = DirEntry {
        location: *location,
        transid: trans.transid,
        file_type,
        name: name.to_vec(),
        data: data.to_vec(),
    };
    let entry_bytes = entry.to_bytes();

    let item_key = Key::new(dir, item_type::DIR_ITEM, name_hash(name));
    let mut path = tree::Path::new();
    let found = tree::search_slot(
        Some(trans),
        fs,
        root,
        &item_key,
        entry_bytes.len() + ITEM_SIZE,
        true,
        &mut path,
    )?;
    if found {
        let existing = path.leaf()?.item_data(path.slots[0]);
        for e in DirEntry::parse_all(&existing)? {
            if e.name == entry.name {
                return Err(FsError::Exists(format!(
                    "directory entry {}",
                    String::from_utf8_lossy(name)
                )));
            }
        }
        // Hash collision: pack the new entry behind the old ones.
        let mut combined = existing;
        combined.extend_from_slice(&entry_bytes);
        tree::del_item(trans, root, &mut path)?;
        tree::insert_item(trans, root, &item_key, &combined)?;
    } else {
        tree::insert_empty_item(trans, root, &mut path, &item_key, entry_bytes.len())?;
        path.leaf()?.set_item_payload(path.slots[0], &entry_bytes);
    }

    let index_key = Key::new(dir, item_type::DIR_INDEX, index);
    tree::insert_item(trans, root, &index_key, &entry_bytes)?;
    Ok(())
}

/// Sets an extended attribute; the value rides in a directory-entry shaped
/// item keyed by the attribute name hash.
pub fn insert_xattr(
    trans: &Transaction,
    root: &Arc<Root>,
    ino: u64,
    name: &[u8],
    value: &[u8],
) -> Result<()> {
    let fs = trans.fs();
    let entry = DirEntry {
        location: Key::min(),
        transid: trans.transid,
        file_type: FileType::Xattr,
        name: name.to_vec(),
        data: value.to_vec(),
    };
    let entry_bytes = entry.to_bytes();

    let key = Key::new(ino, item_type::XATTR_ITEM, name_hash(name));
    let mut path = tree::Path::new();
    let found = tree::search_slot(
        Some(trans),
        fs,
        root,
        &key,
        entry_bytes.len() + ITEM_SIZE,
        true,
        &mut path,
    )?;
    if found {
        // Replace an existing value for the same name, keep collided names.
        let existing = path.leaf()?.item_data(path.slots[0]);
        let mut combined = Vec::new();
        for e in DirEntry::parse_all(&existing)? {
            if e.name != entry.name {
                combined.extend_from_slice(&e.to_bytes());
            }
        }
        combined.extend_from_slice(&entry_bytes);
        tree::del_item(trans, root, &mut path)?;
        tree::insert_item(trans, root, &key, &combined)?;
    } else {
        tree::insert_empty_item(trans, root, &mut path, &key, entry_bytes.len())?;
        path.leaf()?.set_item_payload(path.slots[0], &entry_bytes);
    }
    Ok(())
}

/// Finds a directory entry by name
pub fn lookup_dir_entry(fs: &FsInfo, root: &Arc<Root>, dir: u64, name: &[u8]) -> Result<Option<DirEntry>> {
    let key = Key::new(dir, item_type::DIR_ITEM, name_hash(name));
    let mut path = tree::Path::new();
    let found = tree::search_slot(None, fs, root, &key, 0, false, &mut path)?;
    if !found {
        return Ok(None);
    }
    let data = path.leaf()?.item_data(path.slots[0]);
    Ok(DirEntry::parse_all(&data)?.into_iter().find(|e| e.name == name))
}

/// First unused inode number in a subvolume
pub fn find_free_ino(fs: &FsInfo, root: &Arc<Root>) -> Result<u64> {
    let key = Key::new(u64::MAX - 256, u8::MAX, u64::MAX);
    let mut path = tree::Path::new();
    tree::search_slot(None, fs, root, &key, 0, false, &mut path)?;

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
        if k.objectid >= FIRST_FREE_OBJECTID && k.objectid < u64::MAX - 256 {
            return Ok(k.objectid + 1);
        }
        if !tree::prev_item(fs, root, &mut path)? {
            break;
        }
    }
    Ok(FIRST_FREE_OBJECTID + 1)
}

/// Inserts a file extent item at `(ino, EXTENT_DATA, file_offset)`
pub fn insert_file_extent(
    trans: &Transaction,
    root: &Arc<Root>,
    ino: u64,
    file_offset: u64,
    extent: &FileExtentItem,
) -> Result<()> {
    let key = Key::new(ino, item_type::EXTENT_DATA, file_offset);
    tree::insert_item(trans, root, &key, &extent.to_bytes())
}

/// Collects every file extent of an inode in file order
pub fn file_extents(fs: &FsInfo, root: &Arc<Root>, ino: u64) -> Result<Vec<(u64, FileExtentItem)>> {
    let mut out = Vec::new();
    let key = Key::new(ino, item_type::EXTENT_DATA, 0);
    let mut path = tree::Path::new();
    tree::search_slot(None, fs, root, &key, 0, false, &mut path)?;

    loop {
        let leaf = match path.leaf() {
            Ok(l) => l.clone(),
            Err(_) => break,
        };
        if path.slots[0] >= leaf.nritems() as usize {
            if !tree::next_leaf(fs, root, &mut path)? {
                break;
            }
            continue;
        }
        let k = leaf.item_key(path.slots[0]);
        if k.objectid != ino || k.item_type != item_type::EXTENT_DATA {
            if k > Key::new(ino, item_type::EXTENT_DATA, u64::MAX) {
                break;
            }
            path.slots[0] += 1;
            continue;
        }
        out.push((k.offset, FileExtentItem::from_bytes(&leaf.item_data(path.slots[0]))?));
        path.slots[0] += 1;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_mappings() {
        assert_eq!(FileType::from_dir_type(1), FileType::RegularFile);
        assert_eq!(FileType::from_dir_type(2), FileType::Directory);
        assert_eq!(FileType::from_dir_type(7), FileType::Symlink);
        assert_eq!(FileType::from_dir_type(99), FileType::Unknown);

        assert_eq!(FileType::from_mode(0o100644), FileType::RegularFile);
        assert_eq!(FileType::from_mode(0o40755), FileType::Directory);
        assert_eq!(FileType::from_mode(0o120777), FileType::Symlink);
        assert_eq!(FileType::from_mode(0o10644), FileType::Fifo);

        for t in 0..=7u8 {
            assert_eq!(FileType::from_dir_type(t).to_dir_type(), t);
        }
    }

    #[test]
    fn test_inode_item_roundtrip() {
        let item = InodeItem {
            generation: 5,
            transid: 6,
            size: 12345,
            nbytes: 16384,
            nlink: 2,
            uid: 1000,
            gid: 1000,
            mode: 0o100644,
            flags: inode_flags::NODATASUM,
            atime: TimeSpec { sec: 1700000000, nsec: 1 },
            mtime: TimeSpec { sec: 1700000001, nsec: 2 },
            ctime: TimeSpec { sec: 1700000002, nsec: 3 },
            otime: TimeSpec { sec: 1700000003, nsec: 4 },
            ..Default::default()
        };
        let bytes = item.to_bytes();
        assert_eq!(std::mem::size_of::<InodeItem>(), INODE_ITEM_SIZE);
        // Spot-check documented offsets: mode at 52, atime at 112.
        assert_eq!(&bytes[52..56], &0o100644u32.to_le_bytes());
        assert_eq!(&bytes[112..120], &1700000000i64.to_le_bytes());
        let parsed = InodeItem::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, item);
    }

    #[test]
    fn test_inode_item_too_small() {
        assert!(InodeItem::from_bytes(&[0u8; 100]).is_err());
    }

    #[test]
    fn test_inode_constructors() {
        let dir = InodeItem::directory(7);
        assert_eq!(dir.file_type(), FileType::Directory);
        // Copy packed fields before comparing.
        assert_eq!({ dir.nlink }, 1);

        let file = InodeItem::regular(7, 4096);
        assert_eq!(file.file_type(), FileType::RegularFile);
        assert_eq!({ file.size }, 4096);
        assert_eq!({ file.nbytes }, 4096);
    }

    #[test]
    fn test_dir_entry_roundtrip() {
        let entry = DirEntry {
            location: Key::new(257, item_type::INODE_ITEM, 0),
            transid: 9,
            file_type: FileType::RegularFile,
            name: b"hello.txt".to_vec(),
            data: Vec::new(),
        };
        let bytes = entry.to_bytes();
        let parsed = DirEntry::parse_all(&bytes).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0], entry);
    }

    #[test]
    fn test_dir_entry_collision_packing() {
        let a = DirEntry {
            location: Key::new(257, item_type::INODE_ITEM, 0),
            transid: 1,
            file_type: FileType::RegularFile,
            name: b"first".to_vec(),
            data: Vec::new(),
        };
        let b = DirEntry {
            location: Key::new(258, item_type::INODE_ITEM, 0),
            transid: 2,
            file_type: FileType::Directory,
            name: b"second".to_vec(),
            data: Vec::new(),
        };
        let mut packed = a.to_bytes();
        packed.extend_from_slice(&b.to_bytes());

        let parsed = DirEntry::parse_all(&packed).unwrap();
        assert_eq!(parsed, vec![a, b]);
    }

    #[test]
    fn test_dir_entry_xattr_payload() {
        let entry = DirEntry {
            location: Key::new(0, 0, 0),
            transid: 1,
            file_type: FileType::Unknown,
            name: b"user.comment".to_vec(),
            data: b"some value".to_vec(),
        };
        let parsed = DirEntry::parse_all(&entry.to_bytes()).unwrap();
        assert_eq!(parsed[0].data, b"some value");
    }

    #[test]
    fn test_dir_entry_truncated() {
        let entry = DirEntry {
            location: Key::new(257, item_type::INODE_ITEM, 0),
            transid: 1,
            file_type: FileType::RegularFile,
            name: b"x".to_vec(),
            data: Vec::new(),
        };
        let bytes = entry.to_bytes();
        assert!(DirEntry::parse_all(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_file_extent_roundtrip() {
        let fe = FileExtentItem {
            generation: 4,
            ram_bytes: 8192,
            compression: 0,
            extent_type: file_extent_type::REGULAR,
            disk_bytenr: 0x2000000,
            disk_num_bytes: 8192,
            offset: 4096,
            num_bytes: 4096,
        };
        let parsed = FileExtentItem::from_bytes(&fe.to_bytes()).unwrap();
        assert_eq!(parsed, fe);
        assert!(!parsed.is_hole());
    }

    #[test]
    fn test_file_extent_hole() {
        let hole = FileExtentItem::hole(3, 65536);
        assert!(hole.is_hole());
        let parsed = FileExtentItem::from_bytes(&hole.to_bytes()).unwrap();
        assert!(parsed.is_hole());
        assert_eq!(parsed.num_bytes, 65536);
    }

    #[test]
    fn test_file_extent_inline() {
        let data = b"tiny file contents";
        let bytes = FileExtentItem::inline_bytes(2, 0, data.len() as u64, data);
        assert_eq!(bytes.len(), FILE_EXTENT_INLINE_DATA_OFFSET + data.len());

        let parsed = FileExtentItem::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.extent_type, file_extent_type::INLINE);
        assert_eq!(parsed.ram_bytes, data.len() as u64);
        assert_eq!(&bytes[FILE_EXTENT_INLINE_DATA_OFFSET..], data);
    }
}
