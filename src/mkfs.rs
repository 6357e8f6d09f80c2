//! Filesystem bootstrap
//!
//! Writes a minimal valid image into a device: one SYSTEM, one METADATA and
//! one DATA chunk, all identity-mapped, the empty well-known trees as
//! single checksummed leaves, and the mirrored superblock set. The convert
//! pipeline reuses the same bootstrap with its own chunk placement and a
//! temporary superblock offset.

use crate::blockdev::{self, BlockDevice};
use crate::core::checksum::ChecksumType;
use crate::core::chunk::{chunk_type, ChunkMapping, DevExtent, Stripe, STRIPE_LEN};
use crate::core::inode::{DirEntry, FileType, InodeItem, FIRST_FREE_OBJECTID};
use crate::core::roots::RootItem;
use crate::core::superblock::{self, incompat, DevItem, Superblock};
use crate::core::tree::{Key, LeafBuilder};
use crate::core::{
    alloc, checksum, item_type, objectid, FsError, Result, RESERVED_1M, SUPER_INFO_OFFSET,
    SUPER_INFO_SIZE, SUPER_MIRROR1_OFFSET,
};
use byteorder::{ByteOrder, LittleEndian};
use std::path::Path;

/// Smallest device the default layout fits on
pub const MIN_DEVICE_SIZE: u64 = 16 * 1024 * 1024;

/// Default bootstrap chunk sizes
pub const DEFAULT_SYSTEM_CHUNK: u64 = 4 * 1024 * 1024;
pub const DEFAULT_METADATA_CHUNK: u64 = 8 * 1024 * 1024;

/// Configuration for a new filesystem
pub struct MkfsConfig {
    pub label: String,
    pub nodesize: u32,
    pub sectorsize: u32,
    pub csum_type: ChecksumType,
    /// Filesystem size; defaults to the device size
    pub byte_count: Option<u64>,
    /// Incompat feature bits stamped into the super
    pub features: u64,
    /// Write the primary super here instead of 64 KiB (convert bootstrap)
    pub super_bytenr: Option<u64>,
    /// Placement override `(physical, length)`; identity mapped
    pub system_chunk: Option<(u64, u64)>,
    pub metadata_chunk: Option<(u64, u64)>,
    /// `None` picks a data chunk automatically; `Some((0, 0))` skips it
    pub data_chunk: Option<(u64, u64)>,
    /// Zero the reserved ranges first; convert must keep the foreign bytes
    pub zero_reserved: bool,
}

impl Default for MkfsConfig {
    fn default() -> Self {
        Self {
            label: String::new(),
            nodesize: crate::core::DEFAULT_NODE_SIZE,
            sectorsize: page_size(),
            csum_type: ChecksumType::Crc32c,
            byte_count: None,
            features: incompat::MIXED_BACKREF | incompat::BIG_METADATA | incompat::EXTENDED_IREF,
            super_bytenr: None,
            system_chunk: None,
            metadata_chunk: None,
            data_chunk: None,
            zero_reserved: true,
        }
    }
}

/// System page size; the smallest sector size the kernel will mount
pub fn page_size() -> u32 {
    #[cfg(unix)]
    {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            return sz as u32;
        }
    }
    crate::core::DEFAULT_SECTOR_SIZE
}

/// Formats the device at `path`
pub fn mkfs<P: AsRef<Path>>(path: P, cfg: &MkfsConfig) -> Result<[u8; 16]> {
    blockdev::ensure_unmounted(path.as_ref())?;
    let dev = blockdev::open(path.as_ref(), false)?;
    let fsid = format_device(dev.as_ref(), cfg)?;
    tracing::info!(
        path = %path.as_ref().display(),
        fsid = %uuid::Uuid::from_bytes(fsid),
        "filesystem created"
    );
    Ok(fsid)
}

struct TreeBlock {
    bytenr: u64,
    owner: u64,
    bytes: Vec<u8>,
}

/// Writes the bootstrap image onto an open device and returns the fsid
pub fn format_device(dev: &dyn BlockDevice, cfg: &MkfsConfig) -> Result<[u8; 16]> {
    let nodesize = cfg.nodesize as u64;
    let total_bytes = cfg.byte_count.unwrap_or(dev.size());

    if total_bytes > dev.size() {
        return Err(FsError::Invariant(format!(
            "filesystem size {} exceeds device size {}",
            total_bytes,
            dev.size()
        )));
    }
    if cfg.nodesize < cfg.sectorsize || cfg.nodesize % cfg.sectorsize != 0 {
        return Err(FsError::Invariant(format!(
            "node size {} incompatible with sector size {}",
            cfg.nodesize, cfg.sectorsize
        )));
    }

    // Plan the initial chunks: identity mapped, packed after the first MiB
    // unless the caller placed them.
    let (sys_start, sys_len) = cfg.system_chunk.unwrap_or((RESERVED_1M, DEFAULT_SYSTEM_CHUNK));
    let (meta_start, meta_len) = cfg
        .metadata_chunk
        .unwrap_or((sys_start + sys_len, DEFAULT_METADATA_CHUNK));
    let (data_start, data_len) = match cfg.data_chunk {
        Some(placement) => placement,
        None => {
            let start = meta_start + meta_len;
            let target = crate::core::chunk::DATA_CHUNK_SIZE.min(total_bytes / 10).max(nodesize);
            // Chunks must not straddle the 64 MiB backup super.
            let boundary = if total_bytes > SUPER_MIRROR1_OFFSET && start < SUPER_MIRROR1_OFFSET {
                SUPER_MIRROR1_OFFSET
            } else {
                total_bytes
            };
            let len = target.min(boundary.saturating_sub(start)) / STRIPE_LEN * STRIPE_LEN;
            if len == 0 {
                return Err(FsError::NoSpace);
            }
            (start, len)
        }
    };
    let have_data = data_len != 0;

    let highest = if have_data { data_start + data_len } else { meta_start + meta_len };
    if highest > total_bytes {
        return Err(FsError::NoSpace);
    }

    if cfg.zero_reserved {
        zero_reserved_ranges(dev, total_bytes)?;
    }

    let fsid = *uuid::Uuid::new_v4().as_bytes();
    let chunk_tree_uuid = *uuid::Uuid::new_v4().as_bytes();
    let dev_uuid = *uuid::Uuid::new_v4().as_bytes();
    let fs_uuid = *uuid::Uuid::new_v4().as_bytes();

    // Leaf placement inside the bootstrap chunks.
    let chunk_root = sys_start;
    let roots_at = |i: u64| meta_start + i * nodesize;
    let (root_leaf, extent_leaf, dev_leaf, fs_leaf, csum_leaf, uuid_leaf, reloc_leaf) = (
        roots_at(0),
        roots_at(1),
        roots_at(2),
        roots_at(3),
        roots_at(4),
        roots_at(5),
        roots_at(6),
    );
    let meta_blocks = [
        (chunk_root, objectid::CHUNK_TREE),
        (root_leaf, objectid::ROOT_TREE),
        (extent_leaf, objectid::EXTENT_TREE),
        (dev_leaf, objectid::DEV_TREE),
        (fs_leaf, objectid::FS_TREE),
        (csum_leaf, objectid::CSUM_TREE),
        (uuid_leaf, objectid::UUID_TREE),
        (reloc_leaf, objectid::DATA_RELOC_TREE),
    ];
    let bytes_used = meta_blocks.len() as u64 * nodesize;

    let stripe = |offset| Stripe {
        devid: 1,
        offset,
        dev_uuid,
    };
    let sys_chunk = ChunkMapping {
        logical: sys_start,
        length: sys_len,
        stripe_len: STRIPE_LEN,
        type_flags: chunk_type::SYSTEM,
        num_stripes: 1,
        sub_stripes: 0,
        stripes: vec![stripe(sys_start)],
    };
    let meta_chunk = ChunkMapping {
        logical: meta_start,
        length: meta_len,
        stripe_len: STRIPE_LEN,
        type_flags: chunk_type::METADATA,
        num_stripes: 1,
        sub_stripes: 0,
        stripes: vec![stripe(meta_start)],
    };
    let data_chunk = ChunkMapping {
        logical: data_start,
        length: data_len,
        stripe_len: STRIPE_LEN,
        type_flags: chunk_type::DATA,
        num_stripes: 1,
        sub_stripes: 0,
        stripes: vec![stripe(data_start)],
    };

    let dev_item = DevItem {
        devid: 1,
        total_bytes,
        bytes_used: sys_len + meta_len + if have_data { data_len } else { 0 },
        io_align: cfg.sectorsize,
        io_width: cfg.sectorsize,
        sector_size: cfg.sectorsize,
        uuid: dev_uuid,
        fsid,
        ..Default::default()
    };

    let mut blocks: Vec<TreeBlock> = Vec::new();

    // Chunk tree: the device item then every chunk.
    {
        let mut builder = LeafBuilder::new(chunk_root, cfg.nodesize as usize, objectid::CHUNK_TREE, 1);
        builder.add(
            Key::new(objectid::DEV_ITEMS, item_type::DEV_ITEM, 1),
            dev_item.to_bytes().to_vec(),
        )?;
        for chunk in [&sys_chunk, &meta_chunk]
            .into_iter()
            .chain(have_data.then_some(&data_chunk))
        {
            builder.add(
                Key::new(objectid::FIRST_CHUNK_TREE, item_type::CHUNK_ITEM, chunk.logical),
                chunk.to_bytes(cfg.sectorsize),
            )?;
        }
        blocks.push(TreeBlock {
            bytenr: chunk_root,
            owner: objectid::CHUNK_TREE,
            bytes: builder.build(&fsid, &chunk_tree_uuid)?,
        });
    }

    // Root tree: root items for every other tree plus the default-subvolume
    // directory.
    {
        let root_item = |bytenr: u64, uuid: [u8; 16]| {
            let mut item = RootItem::new(bytenr, 0, 1);
            item.bytes_used = nodesize;
            item.uuid = uuid;
            item.to_bytes().to_vec()
        };
        let dir_inode = {
            let mut inode = InodeItem::directory(1);
            inode.generation = 1;
            inode.transid = 0;
            inode
        };
        let default_entry = DirEntry {
            location: Key::new(objectid::FS_TREE, item_type::ROOT_ITEM, u64::MAX),
            transid: 1,
            file_type: FileType::Directory,
            name: b"default".to_vec(),
            data: Vec::new(),
        };
        let inode_ref = {
            let name = b"..";
            let mut buf = vec![0u8; 10 + name.len()];
            LittleEndian::write_u64(&mut buf[0..8], 0);
            LittleEndian::write_u16(&mut buf[8..10], name.len() as u16);
            buf[10..].copy_from_slice(name);
            buf
        };

        let mut builder = LeafBuilder::new(root_leaf, cfg.nodesize as usize, objectid::ROOT_TREE, 1);
        builder.add(
            Key::new(objectid::EXTENT_TREE, item_type::ROOT_ITEM, 0),
            root_item(extent_leaf, [0; 16]),
        )?;
        builder.add(
            Key::new(objectid::DEV_TREE, item_type::ROOT_ITEM, 0),
            root_item(dev_leaf, [0; 16]),
        )?;
        builder.add(
            Key::new(objectid::FS_TREE, item_type::ROOT_ITEM, 0),
            root_item(fs_leaf, fs_uuid),
        )?;
        builder.add(
            Key::new(objectid::ROOT_TREE_DIR, item_type::INODE_ITEM, 0),
            dir_inode.to_bytes().to_vec(),
        )?;
        builder.add(
            Key::new(objectid::ROOT_TREE_DIR, item_type::INODE_REF, objectid::ROOT_TREE_DIR),
            inode_ref,
        )?;
        builder.add(
            Key::new(
                objectid::ROOT_TREE_DIR,
                item_type::DIR_ITEM,
                checksum::name_hash(b"default"),
            ),
            default_entry.to_bytes(),
        )?;
        builder.add(
            Key::new(objectid::CSUM_TREE, item_type::ROOT_ITEM, 0),
            root_item(csum_leaf, [0; 16]),
        )?;
        builder.add(
            Key::new(objectid::UUID_TREE, item_type::ROOT_ITEM, 0),
            root_item(uuid_leaf, [0; 16]),
        )?;
        builder.add(
            Key::new(objectid::DATA_RELOC_TREE, item_type::ROOT_ITEM, 0),
            root_item(reloc_leaf, [0; 16]),
        )?;
        blocks.push(TreeBlock {
            bytenr: root_leaf,
            owner: objectid::ROOT_TREE,
            bytes: builder.build(&fsid, &chunk_tree_uuid)?,
        });
    }

    // Extent tree: one extent item per bootstrap block, one block group per
    // chunk, ordered by bytenr.
    {
        let mut entries: Vec<(Key, Vec<u8>)> = Vec::new();
        for (bytenr, owner) in meta_blocks {
            let kind = alloc::ExtentKind::TreeBlock {
                level: 0,
                first_key: Key::min(),
            };
            let mut item = alloc::extent_item_bytes(1, 1, &kind);
            let len = item.len();
            LittleEndian::write_u64(&mut item[len - 8..], owner);
            entries.push((Key::new(bytenr, item_type::EXTENT_ITEM, nodesize), item));
        }
        entries.push((
            Key::new(sys_start, item_type::BLOCK_GROUP_ITEM, sys_len),
            alloc::block_group_item(nodesize, chunk_type::SYSTEM).to_vec(),
        ));
        entries.push((
            Key::new(meta_start, item_type::BLOCK_GROUP_ITEM, meta_len),
            alloc::block_group_item(bytes_used - nodesize, chunk_type::METADATA).to_vec(),
        ));
        if have_data {
            entries.push((
                Key::new(data_start, item_type::BLOCK_GROUP_ITEM, data_len),
                alloc::block_group_item(0, chunk_type::DATA).to_vec(),
            ));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut builder = LeafBuilder::new(extent_leaf, cfg.nodesize as usize, objectid::EXTENT_TREE, 1);
        for (key, data) in entries {
            builder.add(key, data)?;
        }
        blocks.push(TreeBlock {
            bytenr: extent_leaf,
            owner: objectid::EXTENT_TREE,
            bytes: builder.build(&fsid, &chunk_tree_uuid)?,
        });
    }

    // Device tree: reverse map of every chunk stripe.
    {
        let mut builder = LeafBuilder::new(dev_leaf, cfg.nodesize as usize, objectid::DEV_TREE, 1);
        for chunk in [&sys_chunk, &meta_chunk]
            .into_iter()
            .chain(have_data.then_some(&data_chunk))
        {
            let extent = DevExtent {
                chunk_tree: objectid::CHUNK_TREE,
                chunk_objectid: objectid::FIRST_CHUNK_TREE,
                chunk_offset: chunk.logical,
                length: chunk.length,
                chunk_tree_uuid,
            };
            builder.add(
                Key::new(1, item_type::DEV_EXTENT, chunk.stripes[0].offset),
                extent.to_bytes().to_vec(),
            )?;
        }
        blocks.push(TreeBlock {
            bytenr: dev_leaf,
            owner: objectid::DEV_TREE,
            bytes: builder.build(&fsid, &chunk_tree_uuid)?,
        });
    }

    // Top-level subvolume: an empty root directory.
    blocks.push(TreeBlock {
        bytenr: fs_leaf,
        owner: objectid::FS_TREE,
        bytes: empty_subvol_leaf(fs_leaf, objectid::FS_TREE, cfg, &fsid, &chunk_tree_uuid)?,
    });

    // Checksum tree starts empty.
    blocks.push(TreeBlock {
        bytenr: csum_leaf,
        owner: objectid::CSUM_TREE,
        bytes: LeafBuilder::new(csum_leaf, cfg.nodesize as usize, objectid::CSUM_TREE, 1)
            .build(&fsid, &chunk_tree_uuid)?,
    });

    // UUID tree: maps the top-level subvolume's UUID to its objectid.
    {
        let mut builder = LeafBuilder::new(uuid_leaf, cfg.nodesize as usize, objectid::UUID_TREE, 1);
        let hi = LittleEndian::read_u64(&fs_uuid[0..8]);
        let lo = LittleEndian::read_u64(&fs_uuid[8..16]);
        let mut id = [0u8; 8];
        LittleEndian::write_u64(&mut id, objectid::FS_TREE);
        builder.add(Key::new(hi, item_type::UUID_SUBVOL, lo), id.to_vec())?;
        blocks.push(TreeBlock {
            bytenr: uuid_leaf,
            owner: objectid::UUID_TREE,
            bytes: builder.build(&fsid, &chunk_tree_uuid)?,
        });
    }

    // Data relocation tree: same empty-directory shape as the fs tree.
    blocks.push(TreeBlock {
        bytenr: reloc_leaf,
        owner: objectid::DATA_RELOC_TREE,
        bytes: empty_subvol_leaf(reloc_leaf, objectid::DATA_RELOC_TREE, cfg, &fsid, &chunk_tree_uuid)?,
    });

    // Checksum and write every block at its identity placement.
    for block in &mut blocks {
        checksum::stamp_block_csum(cfg.csum_type, &mut block.bytes);
        blockdev::write_all_at(dev, block.bytenr, &block.bytes)?;
        tracing::debug!(bytenr = block.bytenr, owner = block.owner, "wrote bootstrap block");
    }

    // Superblock set.
    let mut sb = Superblock::new_empty();
    sb.set_fsid(fsid);
    sb.set_chunk_tree_uuid(chunk_tree_uuid);
    sb.set_generation(1);
    sb.set_root(root_leaf, 0);
    sb.set_chunk_root(chunk_root, 0, 1);
    sb.set_total_bytes(total_bytes);
    sb.set_bytes_used(bytes_used);
    sb.set_root_dir_objectid(objectid::ROOT_TREE_DIR);
    sb.set_num_devices(1);
    sb.set_sizes(cfg.sectorsize, cfg.nodesize, cfg.sectorsize);
    sb.set_csum_type(cfg.csum_type);
    sb.set_incompat_flags(cfg.features);
    sb.set_label(&cfg.label);
    sb.set_dev_item(&dev_item);

    let mut sys_array = Vec::new();
    sys_array.extend_from_slice(
        &Key::new(objectid::FIRST_CHUNK_TREE, item_type::CHUNK_ITEM, sys_start).to_bytes(),
    );
    sys_array.extend_from_slice(&sys_chunk.to_bytes(cfg.sectorsize));
    sb.set_sys_chunk_array(&sys_array)?;

    write_bootstrap_supers(dev, &sb, cfg.super_bytenr)?;
    dev.sync_device()?;

    Ok(fsid)
}

/// Builds the one-leaf tree of an empty subvolume
fn empty_subvol_leaf(
    bytenr: u64,
    owner: u64,
    cfg: &MkfsConfig,
    fsid: &[u8; 16],
    chunk_tree_uuid: &[u8; 16],
) -> Result<Vec<u8>> {
    let mut builder = LeafBuilder::new(bytenr, cfg.nodesize as usize, owner, 1);
    builder.add(
        Key::new(FIRST_FREE_OBJECTID, item_type::INODE_ITEM, 0),
        InodeItem::directory(1).to_bytes().to_vec(),
    )?;
    let name = b"..";
    let mut inode_ref = vec![0u8; 10 + name.len()];
    LittleEndian::write_u64(&mut inode_ref[0..8], 0);
    LittleEndian::write_u16(&mut inode_ref[8..10], name.len() as u16);
    inode_ref[10..].copy_from_slice(name);
    builder.add(
        Key::new(FIRST_FREE_OBJECTID, item_type::INODE_REF, FIRST_FREE_OBJECTID),
        inode_ref,
    )?;
    builder.build(fsid, chunk_tree_uuid)
}

/// Zeroes the reserved MiB and the backup super areas that fit the device
fn zero_reserved_ranges(dev: &dyn BlockDevice, total_bytes: u64) -> Result<()> {
    let zeroes = vec![0u8; 64 * 1024];
    let mut off = 0u64;
    while off < RESERVED_1M {
        blockdev::write_all_at(dev, off, &zeroes)?;
        off += zeroes.len() as u64;
    }
    for (start, len) in crate::core::reserved_ranges().into_iter().skip(1) {
        if start + len <= total_bytes {
            blockdev::write_all_at(dev, start, &zeroes[..len as usize])?;
        }
    }
    Ok(())
}

/// Mirrors first, then the primary; a lone temporary super for convert
fn write_bootstrap_supers(dev: &dyn BlockDevice, sb: &Superblock, super_bytenr: Option<u64>) -> Result<()> {
    if let Some(bytenr) = super_bytenr {
        let buf = sb.serialize_for(bytenr)?;
        blockdev::write_all_at(dev, bytenr, &buf)?;
        dev.sync_device()?;
        return Ok(());
    }

    for mirror in 1..superblock::SUPER_MIRROR_MAX {
        let offset = superblock::super_offset(mirror);
        if offset + SUPER_INFO_SIZE as u64 > dev.size() {
            continue;
        }
        blockdev::write_all_at(dev, offset, &sb.serialize_for(offset)?)?;
    }
    dev.sync_device()?;
    blockdev::write_all_at(dev, SUPER_INFO_OFFSET, &sb.serialize_for(SUPER_INFO_OFFSET)?)?;
    dev.sync_device()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::ImageFile;
    use crate::core::{FsInfo, OpenOptions};

    fn mkfs_image(size: u64) -> (tempfile::NamedTempFile, [u8; 16]) {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let dev = ImageFile::create(temp.path(), size).unwrap();
        let cfg = MkfsConfig {
            label: "testfs".to_string(),
            sectorsize: 4096,
            ..Default::default()
        };
        let fsid = format_device(&dev, &cfg).unwrap();
        (temp, fsid)
    }

    #[test]
    fn test_format_refuses_oversized_fs() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let dev = ImageFile::create(temp.path(), MIN_DEVICE_SIZE).unwrap();
        let cfg = MkfsConfig {
            byte_count: Some(MIN_DEVICE_SIZE * 2),
            sectorsize: 4096,
            ..Default::default()
        };
        assert!(format_device(&dev, &cfg).is_err());
    }

    #[test]
    fn test_format_refuses_bad_nodesize() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let dev = ImageFile::create(temp.path(), MIN_DEVICE_SIZE).unwrap();
        let cfg = MkfsConfig {
            nodesize: 1000,
            sectorsize: 4096,
            ..Default::default()
        };
        assert!(format_device(&dev, &cfg).is_err());
    }

    #[test]
    fn test_fresh_image_opens() {
        let (temp, fsid) = mkfs_image(64 * 1024 * 1024);

        let fs = FsInfo::open(temp.path(), OpenOptions::default()).unwrap();
        assert_eq!(fs.fsid(), fsid);
        assert_eq!(fs.generation(), 1);
        assert_eq!(fs.nodesize(), 16384);
        assert_eq!(fs.label(), "testfs");

        // One chunk of each type.
        let chunks = fs.chunks();
        let mut flags: Vec<u64> = chunks.iter().map(|c| c.type_flags).collect();
        flags.sort();
        assert_eq!(
            flags,
            vec![chunk_type::DATA, chunk_type::SYSTEM, chunk_type::METADATA]
        );
        for c in chunks.iter() {
            assert_eq!(c.num_stripes, 1);
            assert_eq!(c.logical, c.stripes[0].offset);
        }
    }

    #[test]
    fn test_well_known_roots_present() {
        let (temp, _) = mkfs_image(64 * 1024 * 1024);
        let fs = FsInfo::open(temp.path(), OpenOptions::default()).unwrap();

        for id in [
            objectid::EXTENT_TREE,
            objectid::DEV_TREE,
            objectid::FS_TREE,
            objectid::CSUM_TREE,
            objectid::UUID_TREE,
            objectid::DATA_RELOC_TREE,
        ] {
            assert!(fs.read_root(id).is_ok(), "missing root {}", id);
        }
    }

    #[test]
    fn test_reserved_range_purity() {
        let (temp, _) = mkfs_image(128 * 1024 * 1024);
        let fs = FsInfo::open(temp.path(), OpenOptions::default()).unwrap();

        for chunk in fs.chunks().iter() {
            for stripe in &chunk.stripes {
                for (start, len) in crate::core::reserved_ranges() {
                    let overlap =
                        stripe.offset < start + len && start < stripe.offset + chunk.length;
                    assert!(
                        !overlap,
                        "chunk stripe [{:#x}, +{:#x}) overlaps reserved [{:#x}, +{:#x})",
                        stripe.offset, chunk.length, start, len
                    );
                }
            }
        }
    }

    #[test]
    fn test_super_mirror_written() {
        let (temp, fsid) = mkfs_image(128 * 1024 * 1024);
        let dev = ImageFile::open(temp.path(), true).unwrap();

        let primary = Superblock::read_one(&dev, SUPER_INFO_OFFSET).unwrap();
        let mirror = Superblock::read_one(&dev, SUPER_MIRROR1_OFFSET).unwrap();
        assert_eq!(primary.fsid(), fsid);
        assert_eq!(mirror.fsid(), fsid);
        assert_eq!(primary.generation(), mirror.generation());
    }

    #[test]
    fn test_temporary_super_placement() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let dev = ImageFile::create(temp.path(), 64 * 1024 * 1024).unwrap();
        let cfg = MkfsConfig {
            sectorsize: 4096,
            super_bytenr: Some(0x2000000),
            zero_reserved: false,
            system_chunk: Some((0x2010000, DEFAULT_SYSTEM_CHUNK)),
            metadata_chunk: Some((0x2410000, DEFAULT_METADATA_CHUNK)),
            data_chunk: Some((0, 0)),
            ..Default::default()
        };
        format_device(&dev, &cfg).unwrap();

        // Nothing at the canonical offset, a valid super at the override.
        assert!(Superblock::read_one(&dev, SUPER_INFO_OFFSET).is_err());
        assert!(Superblock::read_one(&dev, 0x2000000).is_ok());
    }
}
