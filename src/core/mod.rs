//! Filesystem core
//!
//! Userspace implementation of the on-disk engine: block cache, chunk
//! mapping, copy-on-write B-trees, transactions and the superblock set.
//! Everything is bundled in an [`FsInfo`] value passed explicitly; there are
//! no module-level singletons.

pub mod alloc;
pub mod checksum;
pub mod chunk;
pub mod compress;
pub mod ebcache;
pub mod inode;
pub mod roots;
pub mod superblock;
pub mod transaction;
pub mod tree;

use crate::blockdev::{self, BlockDevice, BlockDeviceError};
use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub use checksum::ChecksumType;
pub use chunk::{ChunkMap, ChunkMapping, Stripe};
pub use ebcache::ExtentBuffer;
pub use roots::{Root, RootItem};
pub use superblock::Superblock;
pub use transaction::Transaction;
pub use tree::{Key, Path as TreePath};

/// Filesystem magic: `_BHRfS_M`
pub const MAGIC: [u8; 8] = *b"_BHRfS_M";

/// Primary superblock offset (64 KiB)
pub const SUPER_INFO_OFFSET: u64 = 0x10000;

/// First superblock mirror offset (64 MiB)
pub const SUPER_MIRROR1_OFFSET: u64 = 0x400_0000;

/// Second superblock mirror offset (256 GiB)
pub const SUPER_MIRROR2_OFFSET: u64 = 0x40_0000_0000;

/// Size of the superblock structure
pub const SUPER_INFO_SIZE: usize = 4096;

/// The first MiB of every device is never allocated
pub const RESERVED_1M: u64 = 0x100000;

/// Width of the exclusion zone around each backup super
pub const SUPER_RESERVED_LEN: u64 = 64 * 1024;

/// Default node size
pub const DEFAULT_NODE_SIZE: u32 = 16384;

/// Default sector size
pub const DEFAULT_SECTOR_SIZE: u32 = 4096;

/// Maximum tree height
pub const MAX_LEVEL: usize = 8;

/// Byte ranges the filesystem must never hand out to extents.
///
/// `[0, 1M)` plus 64 KiB at each backup-super offset. The primary super at
/// 64 KiB lives inside the first range.
pub fn reserved_ranges() -> [(u64, u64); 3] {
    [
        (0, RESERVED_1M),
        (SUPER_MIRROR1_OFFSET, SUPER_RESERVED_LEN),
        (SUPER_MIRROR2_OFFSET, SUPER_RESERVED_LEN),
    ]
}

/// Errors that can occur during filesystem operations
#[derive(Error, Debug)]
pub enum FsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt read: {0}")]
    CorruptRead(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Exists(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("No space left")]
    NoSpace,

    #[error("Unsupported feature: {0}")]
    FeatureUnsupported(String),

    #[error("Device busy: {0}")]
    Busy(String),

    #[error("Bad stream: {0}")]
    BadStream(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<BlockDeviceError> for FsError {
    fn from(e: BlockDeviceError) -> Self {
        match e {
            BlockDeviceError::Mounted(dev) => FsError::Busy(dev),
            BlockDeviceError::Io(e) => FsError::Io(e),
            other => FsError::Io(std::io::Error::other(other.to_string())),
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Cooperative cancellation token.
///
/// Long operations check it at I/O and transaction boundaries and bail out
/// with [`FsError::Cancelled`]; partial work committed so far stays on disk.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FsError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// One open device of a filesystem
pub struct Device {
    pub dev: Box<dyn BlockDevice>,
    pub devid: u64,
    pub uuid: [u8; 16],
    pub total_bytes: u64,
}

/// Options for opening a filesystem
pub struct OpenOptions {
    /// Open for writing; loads the space manager and allows transactions
    pub write: bool,
    /// Read/write the primary superblock at this offset instead of 64 KiB.
    /// Used while a converted filesystem is being bootstrapped.
    pub super_bytenr: Option<u64>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            write: false,
            super_bytenr: None,
        }
    }
}

/// A filesystem instance: device set, cache, chunk map and root forest
pub struct FsInfo {
    devices: RwLock<Vec<Arc<Device>>>,
    sb: RwLock<Superblock>,
    chunks: RwLock<ChunkMap>,
    pub(crate) cache: ebcache::EbCache,
    pub(crate) space: RwLock<alloc::SpaceManager>,
    roots: RwLock<HashMap<u64, Arc<Root>>>,
    generation: AtomicU64,
    pub(crate) writer_active: AtomicBool,
    super_bytenr: u64,
    nodesize: u32,
    sectorsize: u32,
    csum_type: ChecksumType,
    writable: bool,
    cancel: CancelToken,
}

impl FsInfo {
    /// Opens a filesystem from a path
    pub fn open<P: AsRef<Path>>(path: P, opts: OpenOptions) -> Result<Arc<Self>> {
        if opts.write {
            blockdev::ensure_unmounted(path.as_ref())?;
        }
        let dev = blockdev::open(path, !opts.write)?;
        Self::open_device(dev, opts)
    }

    /// Opens a filesystem from an already-open block device
    pub fn open_device(dev: Box<dyn BlockDevice>, opts: OpenOptions) -> Result<Arc<Self>> {
        let super_bytenr = opts.super_bytenr.unwrap_or(SUPER_INFO_OFFSET);

        let sb = if opts.super_bytenr.is_some() {
            Superblock::read_one(dev.as_ref(), super_bytenr)?
        } else {
            Superblock::read_primary_or_best(dev.as_ref())?
        };

        sb.check_features()?;

        let csum_type = ChecksumType::from_disk(sb.csum_type())?;
        let nodesize = sb.node_size();
        let sectorsize = sb.sector_size();
        let dev_item = sb.dev_item();

        let device = Arc::new(Device {
            total_bytes: dev.size(),
            dev,
            devid: dev_item.devid,
            uuid: dev_item.uuid,
        });

        let fs = Arc::new(Self {
            devices: RwLock::new(vec![device]),
            chunks: RwLock::new(ChunkMap::from_sys_array(&sb)?),
            generation: AtomicU64::new(sb.generation()),
            sb: RwLock::new(sb),
            cache: ebcache::EbCache::new(),
            space: RwLock::new(alloc::SpaceManager::new()),
            roots: RwLock::new(HashMap::new()),
            writer_active: AtomicBool::new(false),
            super_bytenr,
            nodesize,
            sectorsize,
            csum_type,
            writable: opts.write,
            cancel: CancelToken::new(),
        });

        // The system-chunk array only locates the chunk tree; walk it for the
        // rest of the mapping.
        chunk::read_chunk_tree(&fs)?;

        if opts.write {
            alloc::SpaceManager::load(&fs)?;
        }

        tracing::debug!(
            generation = fs.generation(),
            nodesize = fs.nodesize(),
            "opened filesystem"
        );

        Ok(fs)
    }

    pub fn nodesize(&self) -> u32 {
        self.nodesize
    }

    pub fn sectorsize(&self) -> u32 {
        self.sectorsize
    }

    pub fn csum_type(&self) -> ChecksumType {
        self.csum_type
    }

    /// Last committed generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn set_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::SeqCst);
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Offset the primary superblock is read from and written to
    pub fn super_bytenr(&self) -> u64 {
        self.super_bytenr
    }

    pub fn fsid(&self) -> [u8; 16] {
        self.sb.read().fsid()
    }

    pub fn label(&self) -> String {
        self.sb.read().label().to_string()
    }

    pub fn superblock(&self) -> RwLockReadGuard<'_, Superblock> {
        self.sb.read()
    }

    pub(crate) fn superblock_mut(&self) -> parking_lot::RwLockWriteGuard<'_, Superblock> {
        self.sb.write()
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().clone()
    }

    pub fn device(&self, devid: u64) -> Result<Arc<Device>> {
        self.devices
            .read()
            .iter()
            .find(|d| d.devid == devid)
            .cloned()
            .ok_or_else(|| FsError::NotFound(format!("device {}", devid)))
    }

    pub fn chunks(&self) -> RwLockReadGuard<'_, ChunkMap> {
        self.chunks.read()
    }

    pub(crate) fn chunks_mut(&self) -> parking_lot::RwLockWriteGuard<'_, ChunkMap> {
        self.chunks.write()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Reads a tree block through the cache, falling back across mirrors.
    ///
    /// `parent_gen` is the generation recorded in the parent pointer; a block
    /// whose header disagrees is treated as a corrupt copy.
    pub fn read_tree_block(&self, bytenr: u64, parent_gen: Option<u64>) -> Result<Arc<ExtentBuffer>> {
        ebcache::read_tree_block(self, bytenr, parent_gen)
    }

    /// Writes a tree block to every mirror, recomputing its checksum
    pub fn write_tree_block(&self, eb: &ExtentBuffer) -> Result<()> {
        ebcache::write_tree_block(self, eb)
    }

    /// Reads raw data bytes at a logical address, falling back across
    /// mirrors on I/O failure. No checksum is applied; data integrity is
    /// the checksum tree's business.
    pub fn read_data(&self, logical: u64, len: u64) -> Result<Vec<u8>> {
        let mirrors = self.chunks().map_read(logical, len)?;
        let mut buf = vec![0u8; len as usize];
        let mut last_err = None;
        for mirror in &mirrors {
            let device = self.device(mirror.devid)?;
            match crate::blockdev::read_exact_at(device.dev.as_ref(), mirror.physical, &mut buf) {
                Ok(()) => return Ok(buf),
                Err(e) => last_err = Some(e.into()),
            }
        }
        Err(last_err.unwrap_or_else(|| FsError::NotFound(format!("logical {}", logical))))
    }

    /// Writes raw data bytes at a logical address to every mirror
    pub fn write_data(&self, logical: u64, data: &[u8]) -> Result<()> {
        let stripes = self.chunks().map_write(logical, data.len() as u64)?;
        for stripe in &stripes {
            let device = self.device(stripe.devid)?;
            crate::blockdev::write_all_at(device.dev.as_ref(), stripe.physical, data)?;
        }
        Ok(())
    }

    /// Handle for the tree of trees
    pub fn tree_root(&self) -> Arc<Root> {
        let mut roots = self.roots.write();
        roots
            .entry(objectid::ROOT_TREE)
            .or_insert_with(|| {
                let sb = self.sb.read();
                Arc::new(Root::pinned(
                    objectid::ROOT_TREE,
                    sb.root(),
                    sb.root_level(),
                    sb.generation(),
                ))
            })
            .clone()
    }

    /// Handle for the chunk tree
    pub fn chunk_root(&self) -> Arc<Root> {
        let mut roots = self.roots.write();
        roots
            .entry(objectid::CHUNK_TREE)
            .or_insert_with(|| {
                let sb = self.sb.read();
                Arc::new(Root::pinned(
                    objectid::CHUNK_TREE,
                    sb.chunk_root(),
                    sb.chunk_root_level(),
                    sb.chunk_root_generation(),
                ))
            })
            .clone()
    }

    /// Looks up a named tree in the root forest, caching the handle
    pub fn read_root(&self, objectid: u64) -> Result<Arc<Root>> {
        if objectid == objectid::ROOT_TREE {
            return Ok(self.tree_root());
        }
        if objectid == objectid::CHUNK_TREE {
            return Ok(self.chunk_root());
        }
        if let Some(root) = self.roots.read().get(&objectid) {
            return Ok(root.clone());
        }
        let root = Arc::new(roots::find_root(self, objectid)?);
        self.roots.write().insert(objectid, root.clone());
        Ok(root)
    }

    /// Drops a cached root handle (after subvolume deletion or root rewrite)
    pub(crate) fn forget_root(&self, objectid: u64) {
        self.roots.write().remove(&objectid);
    }

    /// Starts a write transaction; at most one may be live per filesystem
    pub fn begin_transaction(self: &Arc<Self>) -> Result<Transaction> {
        Transaction::start(self.clone())
    }
}

/// Object IDs for well-known trees
pub mod objectid {
    /// Tree of tree roots
    pub const ROOT_TREE: u64 = 1;
    /// Extent allocation tree
    pub const EXTENT_TREE: u64 = 2;
    /// Logical to physical mapping
    pub const CHUNK_TREE: u64 = 3;
    /// Device extent reverse map
    pub const DEV_TREE: u64 = 4;
    /// Top-level subvolume
    pub const FS_TREE: u64 = 5;
    /// Directory objectid inside the root tree
    pub const ROOT_TREE_DIR: u64 = 6;
    /// Data checksums
    pub const CSUM_TREE: u64 = 7;
    /// Quota accounting
    pub const QUOTA_TREE: u64 = 8;
    /// Subvolume UUID index
    pub const UUID_TREE: u64 = 9;
    /// Free space index
    pub const FREE_SPACE_TREE: u64 = 10;
    /// Relocation trees during balance
    pub const DATA_RELOC_TREE: u64 = u64::MAX - 8;
    /// Device items in the chunk tree live under this objectid
    pub const DEV_ITEMS: u64 = 1;
    /// Chunk items live under this objectid
    pub const FIRST_CHUNK_TREE: u64 = 256;
    /// First objectid available for user inodes and subvolumes
    pub const FIRST_FREE: u64 = 256;
    /// Last objectid available for user inodes and subvolumes
    pub const LAST_FREE: u64 = u64::MAX - 256;
}

/// Item types, ordered as they sort inside a tree
pub mod item_type {
    pub const INODE_ITEM: u8 = 0x01;
    pub const INODE_REF: u8 = 0x0C;
    pub const INODE_EXTREF: u8 = 0x0D;
    pub const XATTR_ITEM: u8 = 0x18;
    pub const ORPHAN_ITEM: u8 = 0x30;
    pub const DIR_LOG_ITEM: u8 = 0x3C;
    pub const DIR_LOG_INDEX: u8 = 0x48;
    pub const DIR_ITEM: u8 = 0x54;
    pub const DIR_INDEX: u8 = 0x60;
    pub const EXTENT_DATA: u8 = 0x6C;
    pub const EXTENT_CSUM: u8 = 0x80;
    pub const ROOT_ITEM: u8 = 0x84;
    pub const ROOT_BACKREF: u8 = 0x90;
    pub const ROOT_REF: u8 = 0x9C;
    pub const EXTENT_ITEM: u8 = 0xA8;
    pub const METADATA_ITEM: u8 = 0xA9;
    pub const TREE_BLOCK_REF: u8 = 0xB0;
    pub const EXTENT_DATA_REF: u8 = 0xB2;
    pub const SHARED_BLOCK_REF: u8 = 0xB6;
    pub const SHARED_DATA_REF: u8 = 0xB8;
    pub const BLOCK_GROUP_ITEM: u8 = 0xC0;
    pub const FREE_SPACE_INFO: u8 = 0xC6;
    pub const FREE_SPACE_EXTENT: u8 = 0xC7;
    pub const DEV_EXTENT: u8 = 0xCC;
    pub const DEV_ITEM: u8 = 0xD8;
    pub const CHUNK_ITEM: u8 = 0xE4;
    pub const UUID_SUBVOL: u8 = 0xFB;
    pub const UUID_RECEIVED_SUBVOL: u8 = 0xFC;
    pub const STRING_ITEM: u8 = 0xFD;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(MAGIC, *b"_BHRfS_M");
        assert_eq!(SUPER_INFO_OFFSET, 0x10000);
        assert_eq!(SUPER_MIRROR1_OFFSET, 0x4000000);
        assert_eq!(SUPER_MIRROR2_OFFSET, 0x4000000000);
        assert_eq!(DEFAULT_NODE_SIZE, 16384);
    }

    #[test]
    fn test_reserved_ranges() {
        let ranges = reserved_ranges();
        assert_eq!(ranges[0], (0, 0x100000));
        assert_eq!(ranges[1], (0x4000000, 0x10000));
        assert_eq!(ranges[2], (0x4000000000, 0x10000));
        // The primary super is inside the first reserved MiB.
        assert!(SUPER_INFO_OFFSET < ranges[0].1);
    }

    #[test]
    fn test_objectid_constants() {
        assert_eq!(objectid::ROOT_TREE, 1);
        assert_eq!(objectid::EXTENT_TREE, 2);
        assert_eq!(objectid::CHUNK_TREE, 3);
        assert_eq!(objectid::DEV_TREE, 4);
        assert_eq!(objectid::FS_TREE, 5);
        assert_eq!(objectid::CSUM_TREE, 7);
        assert_eq!(objectid::UUID_TREE, 9);
        assert_eq!(objectid::DATA_RELOC_TREE, 0xFFFF_FFFF_FFFF_FFF7);
        assert_eq!(objectid::FIRST_FREE, 256);
    }

    #[test]
    fn test_item_type_ordering() {
        // Types must sort the way items sort on disk.
        assert!(item_type::INODE_ITEM < item_type::INODE_REF);
        assert!(item_type::DIR_ITEM < item_type::DIR_INDEX);
        assert!(item_type::EXTENT_DATA < item_type::EXTENT_CSUM);
        assert!(item_type::ROOT_ITEM < item_type::ROOT_REF);
        assert!(item_type::EXTENT_ITEM < item_type::BLOCK_GROUP_ITEM);
        assert!(item_type::DEV_EXTENT < item_type::DEV_ITEM);
        assert!(item_type::DEV_ITEM < item_type::CHUNK_ITEM);
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        match token.check() {
            Err(FsError::Cancelled) => (),
            _ => panic!("expected Cancelled"),
        }
    }

    #[test]
    fn test_fs_error_display() {
        let err = FsError::CorruptRead("bad header at bytenr 131072".to_string());
        assert!(format!("{}", err).contains("131072"));

        let err = FsError::Busy("/dev/loop0".to_string());
        assert!(format!("{}", err).contains("/dev/loop0"));

        let err = FsError::NoSpace;
        assert!(format!("{}", err).contains("space"));

        let err = FsError::BadStream("crc mismatch in command 7".to_string());
        assert!(format!("{}", err).contains("command 7"));
    }

    #[test]
    fn test_busy_from_mounted() {
        let err: FsError = BlockDeviceError::Mounted("/dev/sda2".to_string()).into();
        match err {
            FsError::Busy(d) => assert_eq!(d, "/dev/sda2"),
            _ => panic!("expected Busy"),
        }
    }
}
