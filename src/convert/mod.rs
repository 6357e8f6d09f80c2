//! In-place conversion of a foreign filesystem
//!
//! No file data is copied: data chunks are created identity-mapped over the
//! foreign filesystem's used space, user files reference the old byte
//! positions, and a read-only `<fs>_saved/image` inode preserves the
//! complete foreign layout so the conversion can be rolled back. Only bytes
//! inside the reserved ranges are physically moved.
//!
//! The temporary superblock is written at an alternate offset while the
//! trees are built; the canonical superblock set appears in one final
//! migration step. Up to that step the foreign filesystem is still intact.

pub mod ext2;

use crate::blockdev::{self, BlockDevice};
use crate::core::alloc::{self, ExtentKind, ExtentRecord, IntervalSet};
use crate::core::checksum::{self, ChecksumType};
use crate::core::chunk::{self, chunk_type, STRIPE_LEN};
use crate::core::inode::{
    self, inode_flags, FileExtentItem, FileType, InodeItem, FIRST_FREE_OBJECTID,
};
use crate::core::roots::{self, SubvolOptions, TimeSpec};
use crate::core::superblock::{self, incompat, Superblock};
use crate::core::transaction::Transaction;
use crate::core::tree::Key;
use crate::core::{
    item_type, objectid, CancelToken, FsError, FsInfo, OpenOptions, Result, Root,
    RESERVED_1M, SUPER_INFO_OFFSET, SUPER_INFO_SIZE,
};
use crate::mkfs::{self, MkfsConfig};
use ext2::Ext2Fs;
use std::path::Path;
use std::sync::Arc;

/// Name of the image file inside the saved subvolume
pub const IMAGE_FILE_NAME: &[u8] = b"image";

/// Smallest identity data chunk the planner aims for
pub const MIN_DATA_CHUNK: u64 = 32 * 1024 * 1024;

/// Largest single data extent
const MAX_EXTENT_SIZE: u64 = 128 * 1024 * 1024;

/// Inode number the image file receives in its subvolume
const IMAGE_INO: u64 = FIRST_FREE_OBJECTID + 1;

/// The csum tree keys data checksums under this objectid
const EXTENT_CSUM_OBJECTID: u64 = u64::MAX - 9;

/// Foreign filesystem drivers, dispatched as a tagged variant
pub enum ForeignFs {
    Ext2(Ext2Fs),
}

impl ForeignFs {
    /// Probes the device and opens the matching driver
    pub fn detect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let dev = blockdev::open(path, true)?;
        let fs = Ext2Fs::open(dev)?;
        Ok(Self::Ext2(fs))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ext2(_) => "ext2",
        }
    }

    /// Name of the subvolume that preserves the foreign image
    pub fn saved_subvol_name(&self) -> &'static [u8] {
        match self {
            Self::Ext2(_) => b"ext2_saved",
        }
    }

    pub fn total_bytes(&self) -> u64 {
        match self {
            Self::Ext2(fs) => fs.total_bytes(),
        }
    }

    pub fn blocksize(&self) -> u32 {
        match self {
            Self::Ext2(fs) => fs.blocksize(),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Ext2(fs) => fs.label().to_string(),
        }
    }

    pub fn fs_uuid(&self) -> [u8; 16] {
        match self {
            Self::Ext2(fs) => fs.fs_uuid(),
        }
    }

    pub fn used_extents(&self) -> Result<IntervalSet> {
        match self {
            Self::Ext2(fs) => fs.used_extents(),
        }
    }
}

/// Conversion options
pub struct ConvertOptions {
    /// Compute data checksums for copied files; `false` sets NODATASUM
    pub datacsum: bool,
    /// Copy extended attributes
    pub copy_xattrs: bool,
    /// Override the new filesystem's label; default keeps the foreign one
    pub label: Option<String>,
    pub nodesize: u32,
    pub csum_type: ChecksumType,
    pub cancel: CancelToken,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            datacsum: true,
            copy_xattrs: true,
            label: None,
            nodesize: crate::core::DEFAULT_NODE_SIZE,
            csum_type: ChecksumType::Crc32c,
            cancel: CancelToken::new(),
        }
    }
}

/// Conversion outcome
pub struct ConvertSummary {
    /// Non-fatal oddities (skipped inode kinds, unreadable xattrs)
    pub warnings: usize,
}

/// Converts the foreign filesystem on `path` in place
pub fn convert<P: AsRef<Path>>(path: P, opts: &ConvertOptions) -> Result<ConvertSummary> {
    let path = path.as_ref();
    blockdev::ensure_unmounted(path)?;

    let foreign = ForeignFs::detect(path)?;
    let total_bytes = foreign.total_bytes();
    let sectorsize = foreign.blocksize();
    if opts.nodesize % sectorsize != 0 {
        return Err(FsError::Invariant(format!(
            "node size {} incompatible with foreign block size {}",
            opts.nodesize, sectorsize
        )));
    }

    tracing::info!(
        kind = foreign.name(),
        total_bytes,
        blocksize = sectorsize,
        "starting conversion"
    );

    let used = foreign.used_extents()?;
    let reserved = clipped_reserved(total_bytes);

    // Used bytes net of the reserved ranges stay in place; the rest moves.
    let mut keep = used.clone();
    let mut relocate = IntervalSet::new();
    for (start, len) in reserved.iter() {
        for (s, l) in used.iter() {
            let lo = s.max(start);
            let hi = (s + l).min(start + len);
            if lo < hi {
                relocate.insert(lo, hi - lo);
            }
        }
        keep.remove_overlap(start, len);
    }

    // Carve the bootstrap out of foreign-free, non-reserved space.
    let mut free = IntervalSet::with_range(0, total_bytes);
    for (s, l) in used.iter() {
        free.remove_overlap(s, l);
    }
    for (s, l) in reserved.iter() {
        free.remove_overlap(s, l);
    }

    let sys_len = mkfs::DEFAULT_SYSTEM_CHUNK;
    let meta_len = if total_bytes >= 64 * 1024 * 1024 {
        mkfs::DEFAULT_METADATA_CHUNK
    } else {
        mkfs::DEFAULT_SYSTEM_CHUNK
    };
    let sys_start = free
        .alloc(sys_len, STRIPE_LEN)
        .ok_or(FsError::NoSpace)?;
    let meta_start = free
        .alloc(meta_len, STRIPE_LEN)
        .ok_or(FsError::NoSpace)?;
    let super_bytenr = free
        .alloc(SUPER_INFO_SIZE as u64, STRIPE_LEN)
        .ok_or(FsError::NoSpace)?;

    opts.cancel.check()?;

    // Bootstrap the new filesystem around the foreign data.
    {
        let dev = blockdev::open(path, false)?;
        let cfg = MkfsConfig {
            label: opts.label.clone().unwrap_or_else(|| foreign.label()),
            nodesize: opts.nodesize,
            sectorsize,
            csum_type: opts.csum_type,
            byte_count: Some(total_bytes),
            features: incompat::MIXED_BACKREF
                | incompat::BIG_METADATA
                | incompat::EXTENDED_IREF
                | incompat::NO_HOLES,
            super_bytenr: Some(super_bytenr),
            system_chunk: Some((sys_start, sys_len)),
            metadata_chunk: Some((meta_start, meta_len)),
            data_chunk: Some((0, 0)),
            zero_reserved: false,
        };
        mkfs::format_device(dev.as_ref(), &cfg)?;
    }

    let fs = FsInfo::open(
        path,
        OpenOptions {
            write: true,
            super_bytenr: Some(super_bytenr),
        },
    )?;

    let mut warnings = 0usize;
    {
        // The temporary super is invisible to the chunk map; keep the
        // allocator away from it.
        fs.space
            .write()
            .claim_device_range(1, super_bytenr, SUPER_INFO_SIZE as u64)?;

        let trans = fs.begin_transaction()?;

        // Identity data chunks covering every kept byte.
        let forbidden = {
            let mut f = IntervalSet::new();
            for (s, l) in reserved.iter() {
                f.insert(s, l);
            }
            f.insert(sys_start, sys_len);
            f.insert(meta_start, meta_len);
            f.insert(super_bytenr, SUPER_INFO_SIZE as u64);
            f
        };
        let covers = plan_data_chunks(&keep, &forbidden, total_bytes);
        for &(start, len) in &covers {
            fs.space.write().claim_device_range(1, start, len)?;
            chunk::alloc_chunk_identity(&trans, chunk_type::DATA, start, len)?;
        }
        for (s, l) in keep.iter() {
            fs.space.write().claim_group_range(s, l)?;
        }

        opts.cancel.check()?;

        // The saved subvolume and its image inode.
        let fs_root = fs.read_root(objectid::FS_TREE)?;
        let image_root = roots::create_subvolume(
            &trans,
            &fs_root,
            foreign.saved_subvol_name(),
            &SubvolOptions::default(),
        )?;
        let relocations =
            create_image_inode(&trans, &fs, &image_root, &foreign, &keep, &relocate, total_bytes)?;

        opts.cancel.check()?;

        // Mirror the foreign namespace into the top-level subvolume.
        let runs: Vec<(u64, u64)> = keep.iter().collect();
        match &foreign {
            ForeignFs::Ext2(e2) => {
                warnings += copy_inodes_ext2(&trans, &fs, &fs_root, e2, &runs, &relocations, opts)?;
            }
        }

        opts.cancel.check()?;
        trans.commit()?;
    }
    drop(fs);

    // Point of no return: move the superblock to its canonical offset.
    migrate_super_block(path, super_bytenr, total_bytes)?;

    tracing::info!(kind = foreign.name(), warnings, "conversion finished");
    Ok(ConvertSummary { warnings })
}

/// Reserved ranges clipped to the device
fn clipped_reserved(total_bytes: u64) -> IntervalSet {
    let mut set = IntervalSet::new();
    for (start, len) in crate::core::reserved_ranges() {
        if start < total_bytes {
            set.insert(start, len.min(total_bytes - start));
        }
    }
    set
}

/// Plans the identity data chunks: every kept interval is covered, chunks
/// are stripe aligned, grown toward [`MIN_DATA_CHUNK`] where neighbouring
/// forbidden ranges allow, and never overlap each other.
fn plan_data_chunks(keep: &IntervalSet, forbidden: &IntervalSet, total_bytes: u64) -> Vec<(u64, u64)> {
    let mut aligned = IntervalSet::new();
    for (s, l) in keep.iter() {
        let start = s / STRIPE_LEN * STRIPE_LEN;
        let end = (s + l + STRIPE_LEN - 1) / STRIPE_LEN * STRIPE_LEN;
        aligned.insert(start, end - start);
    }

    let covers: Vec<(u64, u64)> = aligned.iter().collect();
    let mut out: Vec<(u64, u64)> = Vec::with_capacity(covers.len());

    for (i, &(start, len)) in covers.iter().enumerate() {
        let mut end = start + len;
        if end - start < MIN_DATA_CHUNK {
            // Grow forward up to the next obstacle.
            let limit = forbidden
                .iter()
                .map(|(s, _)| s)
                .filter(|&s| s >= end)
                .min()
                .unwrap_or(total_bytes)
                .min(covers.get(i + 1).map(|&(s, _)| s).unwrap_or(total_bytes))
                .min(total_bytes);
            end = (start + MIN_DATA_CHUNK).min(limit) / STRIPE_LEN * STRIPE_LEN;
            end = end.max(start + len);
        }
        let mut new_start = start;
        if end - new_start < MIN_DATA_CHUNK {
            // Grow backward as well.
            let floor = forbidden
                .iter()
                .map(|(s, l)| s + l)
                .filter(|&e| e <= new_start)
                .max()
                .unwrap_or(0)
                .max(out.last().map(|&(s, l)| s + l).unwrap_or(0));
            new_start = new_start
                .saturating_sub(MIN_DATA_CHUNK - (end - new_start))
                .max(floor);
            new_start = (new_start + STRIPE_LEN - 1) / STRIPE_LEN * STRIPE_LEN;
        }
        out.push((new_start, end - new_start));
    }
    out
}

/// Builds the image inode: file extents that are exactly the foreign byte
/// layout, except for reserved-range bytes which are copied out and
/// referenced at their new location.
fn create_image_inode(
    trans: &Transaction,
    fs: &Arc<FsInfo>,
    image_root: &Arc<Root>,
    foreign: &ForeignFs,
    keep: &IntervalSet,
    relocate: &IntervalSet,
    total_bytes: u64,
) -> Result<Vec<Relocation>> {
    let mut item = InodeItem::regular(trans.transid, total_bytes);
    item.nbytes = keep.total() + relocate.total();
    item.flags = inode_flags::NODATASUM | inode_flags::NODATACOW | inode_flags::READONLY;
    inode::insert_inode(trans, image_root, IMAGE_INO, &item)?;
    inode::insert_inode_ref(
        trans,
        image_root,
        IMAGE_INO,
        FIRST_FREE_OBJECTID,
        IMAGE_FILE_NAME,
        inode::FIRST_DIR_INDEX,
    )?;
    inode::insert_dir_entry(
        trans,
        image_root,
        FIRST_FREE_OBJECTID,
        IMAGE_FILE_NAME,
        &Key::new(IMAGE_INO, item_type::INODE_ITEM, 0),
        FileType::RegularFile,
        inode::FIRST_DIR_INDEX,
        &[],
    )?;

    // The 1:1 body.
    for (start, len) in keep.iter() {
        let mut s = start;
        let mut remaining = len;
        while remaining > 0 {
            let piece = remaining.min(MAX_EXTENT_SIZE);
            let fe = FileExtentItem::regular(trans.transid, s, piece);
            inode::insert_file_extent(trans, image_root, IMAGE_INO, s, &fe)?;
            trans.record_new_extent(ExtentRecord {
                bytenr: s,
                num_bytes: piece,
                owner: image_root.objectid(),
                kind: ExtentKind::Data {
                    root: image_root.objectid(),
                    ino: IMAGE_INO,
                    file_offset: s,
                },
            });
            s += piece;
            remaining -= piece;
        }
    }

    // Reserved-range bytes move to freshly reserved data space.
    let mut relocations = Vec::new();
    let ForeignFs::Ext2(e2) = foreign;
    for (start, len) in relocate.iter() {
        let data = e2.read_bytes(start, len as usize)?;
        let logical = alloc::reserve_data(trans, len, 0)?;
        fs.write_data(logical, &data)?;

        let fe = FileExtentItem::regular(trans.transid, logical, len);
        inode::insert_file_extent(trans, image_root, IMAGE_INO, start, &fe)?;
        trans.record_new_extent(ExtentRecord {
            bytenr: logical,
            num_bytes: len,
            owner: image_root.objectid(),
            kind: ExtentKind::Data {
                root: image_root.objectid(),
                ino: IMAGE_INO,
                file_offset: start,
            },
        });
        relocations.push(Relocation {
            orig: start,
            len,
            logical,
        });
        tracing::debug!(from = start, to = logical, len, "relocated reserved range");
    }

    Ok(relocations)
}

/// One reserved-range byte run that was moved, and where it went
pub struct Relocation {
    pub orig: u64,
    pub len: u64,
    pub logical: u64,
}

/// Resolves a foreign physical position to the data extent holding it:
/// `(extent_start, extent_len, logical_position, bytes_available)`.
/// Kept bytes resolve to the identity extents the image file declared
/// (split at [`MAX_EXTENT_SIZE`]); reserved bytes resolve to their
/// relocated extent.
fn resolve_extent(
    runs: &[(u64, u64)],
    relocations: &[Relocation],
    phys: u64,
) -> Result<(u64, u64, u64, u64)> {
    for r in relocations {
        if phys >= r.orig && phys < r.orig + r.len {
            let pos = r.logical + (phys - r.orig);
            return Ok((r.logical, r.len, pos, r.orig + r.len - phys));
        }
    }

    let idx = runs.partition_point(|&(s, _)| s <= phys);
    if idx == 0 {
        return Err(FsError::Invariant(format!(
            "no data extent covers foreign byte {}",
            phys
        )));
    }
    let (s, l) = runs[idx - 1];
    if phys >= s + l {
        return Err(FsError::Invariant(format!(
            "no data extent covers foreign byte {}",
            phys
        )));
    }
    let piece_idx = (phys - s) / MAX_EXTENT_SIZE;
    let piece_start = s + piece_idx * MAX_EXTENT_SIZE;
    let piece_len = MAX_EXTENT_SIZE.min(s + l - piece_start);
    Ok((piece_start, piece_len, phys, piece_start + piece_len - phys))
}

/// Walks the ext2 namespace and recreates it in the top-level subvolume.
/// File content is referenced, never copied. Returns the warning count.
#[allow(clippy::too_many_arguments)]
fn copy_inodes_ext2(
    trans: &Transaction,
    fs: &Arc<FsInfo>,
    fs_root: &Arc<Root>,
    e2: &Ext2Fs,
    runs: &[(u64, u64)],
    relocations: &[Relocation],
    opts: &ConvertOptions,
) -> Result<usize> {
    // Foreign inode numbers map into the btrfs namespace with the root
    // directory pinned at the first free objectid.
    let map_ino = |ino: u64| -> u64 {
        if ino == ext2::EXT2_ROOT_INO {
            FIRST_FREE_OBJECTID
        } else {
            ino + FIRST_FREE_OBJECTID - ext2::EXT2_ROOT_INO
        }
    };

    let mut warnings = 0usize;

    // The root directory itself: refresh the bootstrap inode's metadata.
    let root_inode = e2.read_inode(ext2::EXT2_ROOT_INO)?;
    let mut item = inode::lookup_inode(fs, fs_root, FIRST_FREE_OBJECTID)?;
    fill_inode_item(&mut item, &root_inode, trans.transid);
    inode::update_inode(trans, fs_root, FIRST_FREE_OBJECTID, &item)?;

    let mut stack: Vec<(u64, ext2::Ext2Inode)> = vec![(FIRST_FREE_OBJECTID, root_inode)];

    while let Some((dir_objectid, dir_inode)) = stack.pop() {
        opts.cancel.check()?;
        let mut index = inode::next_dir_index(fs, fs_root, dir_objectid)?;

        for entry in e2.read_dir(&dir_inode)? {
            let child = e2.read_inode(entry.ino)?;
            let child_objectid = map_ino(entry.ino);

            let file_type = FileType::from_mode(child.mode as u32);
            if matches!(file_type, FileType::Unknown) {
                tracing::warn!(ino = entry.ino, mode = child.mode, "skipping inode of unknown type");
                warnings += 1;
                continue;
            }

            // A hard link to an inode copied earlier only needs the name.
            let already_copied = inode::lookup_inode(fs, fs_root, child_objectid).is_ok()
                && child_objectid != FIRST_FREE_OBJECTID;

            if !already_copied {
                let mut item = InodeItem::default();
                fill_inode_item(&mut item, &child, trans.transid);

                if child.is_regular() {
                    let (nbytes, csum_warnings) = copy_file_extents(
                        trans,
                        fs,
                        fs_root,
                        e2,
                        &child,
                        child_objectid,
                        runs,
                        relocations,
                        opts,
                    )?;
                    item.nbytes = nbytes;
                    warnings += csum_warnings;
                    if !opts.datacsum {
                        item.flags |= inode_flags::NODATASUM | inode_flags::NODATACOW;
                    }
                } else if child.is_symlink() {
                    let target = e2.read_symlink(&child)?;
                    let inline =
                        FileExtentItem::inline_bytes(trans.transid, 0, target.len() as u64, &target);
                    let key = Key::new(child_objectid, item_type::EXTENT_DATA, 0);
                    crate::core::tree::insert_item(trans, fs_root, &key, &inline)?;
                    item.size = target.len() as u64;
                    item.nbytes = target.len() as u64;
                } else if matches!(file_type, FileType::CharDevice | FileType::BlockDevice) {
                    item.rdev = child.rdev();
                }

                inode::insert_inode(trans, fs_root, child_objectid, &item)?;

                if opts.copy_xattrs {
                    match e2.read_xattrs(&child) {
                        Ok(xattrs) => {
                            for (name, value) in xattrs {
                                inode::insert_xattr(trans, fs_root, child_objectid, &name, &value)?;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(ino = entry.ino, "unreadable xattr block: {}", e);
                            warnings += 1;
                        }
                    }
                }

                if child.is_dir() {
                    stack.push((child_objectid, child));
                }
            }

            inode::insert_dir_entry(
                trans,
                fs_root,
                dir_objectid,
                &entry.name,
                &Key::new(child_objectid, item_type::INODE_ITEM, 0),
                file_type,
                index,
                &[],
            )?;
            inode::insert_inode_ref(trans, fs_root, child_objectid, dir_objectid, &entry.name, index)?;
            index += 1;
        }
    }

    Ok(warnings)
}

/// Translates ext2 metadata into an inode item
fn fill_inode_item(item: &mut InodeItem, inode: &ext2::Ext2Inode, transid: u64) {
    item.generation = transid;
    item.transid = transid;
    item.size = inode.size;
    item.nlink = inode.links_count as u32;
    item.uid = inode.uid;
    item.gid = inode.gid;
    item.mode = inode.mode as u32;
    item.atime = TimeSpec { sec: inode.atime as i64, nsec: 0 };
    item.ctime = TimeSpec { sec: inode.ctime as i64, nsec: 0 };
    item.mtime = TimeSpec { sec: inode.mtime as i64, nsec: 0 };
}

/// Emits the file extents of one regular file, pointing into the identity
/// runs (or the relocated copies for reserved-range bytes); no data moves.
/// Returns the byte total and csum warning count.
#[allow(clippy::too_many_arguments)]
fn copy_file_extents(
    trans: &Transaction,
    fs: &Arc<FsInfo>,
    fs_root: &Arc<Root>,
    e2: &Ext2Fs,
    inode: &ext2::Ext2Inode,
    objectid: u64,
    runs: &[(u64, u64)],
    relocations: &[Relocation],
    opts: &ConvertOptions,
) -> Result<(u64, usize)> {
    let bs = e2.blocksize() as u64;
    let blocks = e2.file_blocks(inode)?;
    let mut warnings = 0usize;
    let mut nbytes = 0u64;

    let mut flush = |file_off: u64, phys: u64, nblocks: u64, warnings: &mut usize| -> Result<u64> {
        let mut fo = file_off;
        let mut ph = phys;
        let mut remaining = nblocks * bs;
        while remaining > 0 {
            let (ext_start, ext_len, pos, avail) = resolve_extent(runs, relocations, ph)?;
            let take = remaining.min(avail);
            let fe = FileExtentItem {
                generation: trans.transid,
                ram_bytes: take,
                extent_type: inode::file_extent_type::REGULAR,
                disk_bytenr: ext_start,
                disk_num_bytes: ext_len,
                offset: pos - ext_start,
                num_bytes: take,
                ..Default::default()
            };
            inode::insert_file_extent(trans, fs_root, objectid, fo, &fe)?;
            trans.record_new_extent(ExtentRecord {
                bytenr: ext_start,
                num_bytes: ext_len,
                owner: fs_root.objectid(),
                kind: ExtentKind::Data {
                    root: fs_root.objectid(),
                    ino: objectid,
                    file_offset: fo,
                },
            });
            if opts.datacsum {
                match e2.read_bytes(ph, take as usize) {
                    Ok(data) => insert_data_csums(trans, fs, pos, &data)?,
                    Err(e) => {
                        tracing::warn!(ino = inode.ino, "checksum read failed: {}", e);
                        *warnings += 1;
                    }
                }
            }
            fo += take;
            ph += take;
            remaining -= take;
        }
        Ok(nblocks * bs)
    };

    // Coalesce physically consecutive blocks into single extents.
    let mut file_block = 0u64;
    let mut run_start: Option<(u64, u64, u64)> = None; // (file_off, phys, blocks)

    for block in blocks {
        match (&mut run_start, block) {
            (Some((_, phys, n)), b) if b != 0 && *phys + *n * bs == b as u64 * bs => {
                *n += 1;
            }
            (run, b) => {
                if let Some((off, phys, n)) = run.take() {
                    nbytes += flush(off, phys, n, &mut warnings)?;
                }
                if b != 0 {
                    *run = Some((file_block * bs, b as u64 * bs, 1));
                }
            }
        }
        file_block += 1;
    }
    if let Some((off, phys, n)) = run_start.take() {
        nbytes += flush(off, phys, n, &mut warnings)?;
    }

    Ok((nbytes, warnings))
}

/// Inserts checksum items for a data range, splitting payloads so they fit
/// comfortably in a leaf.
fn insert_data_csums(trans: &Transaction, fs: &Arc<FsInfo>, logical: u64, data: &[u8]) -> Result<()> {
    const MAX_CSUMS_PER_ITEM: usize = 2048;

    let sectorsize = fs.sectorsize() as usize;
    let csum_root = fs.read_root(objectid::CSUM_TREE)?;

    let mut offset = 0usize;
    while offset < data.len() {
        let sectors = ((data.len() - offset) / sectorsize).min(MAX_CSUMS_PER_ITEM);
        if sectors == 0 {
            break;
        }
        let mut payload = Vec::with_capacity(sectors * 4);
        for s in 0..sectors {
            let sector = &data[offset + s * sectorsize..offset + (s + 1) * sectorsize];
            payload.extend_from_slice(&checksum::crc32c(sector).to_le_bytes());
        }
        let key = Key::new(
            EXTENT_CSUM_OBJECTID,
            item_type::EXTENT_CSUM,
            logical + offset as u64,
        );
        crate::core::tree::insert_item(trans, &csum_root, &key, &payload)?;
        offset += sectors * sectorsize;
    }
    Ok(())
}

/// Moves the temporary superblock to the canonical offset.
///
/// Clears the reserved first MiB (the foreign superblock included; its
/// bytes live on in the image file), writes the backup mirrors, then the
/// primary, then retires the temporary copy.
fn migrate_super_block<P: AsRef<Path>>(path: P, super_bytenr: u64, total_bytes: u64) -> Result<()> {
    let dev = blockdev::open(path, false)?;

    let mut buf = vec![0u8; SUPER_INFO_SIZE];
    blockdev::read_exact_at(dev.as_ref(), super_bytenr, &mut buf)?;
    let sb = Superblock::parse(&buf, super_bytenr)?;

    // Wipe the reserved MiB; the primary super gets written right after.
    let zeroes = vec![0u8; 64 * 1024];
    let mut off = 0u64;
    while off < RESERVED_1M {
        blockdev::write_all_at(dev.as_ref(), off, &zeroes)?;
        off += zeroes.len() as u64;
    }

    for mirror in 1..superblock::SUPER_MIRROR_MAX {
        let offset = superblock::super_offset(mirror);
        if offset + SUPER_INFO_SIZE as u64 > total_bytes {
            continue;
        }
        blockdev::write_all_at(dev.as_ref(), offset, &sb.serialize_for(offset)?)?;
    }
    dev.sync_device()?;

    blockdev::write_all_at(
        dev.as_ref(),
        SUPER_INFO_OFFSET,
        &sb.serialize_for(SUPER_INFO_OFFSET)?,
    )?;
    dev.sync_device()?;

    // The temporary super must not shadow the real one on a rescue scan.
    blockdev::write_all_at(dev.as_ref(), super_bytenr, &vec![0u8; SUPER_INFO_SIZE])?;
    dev.sync_device()?;
    Ok(())
}

/// One relocated byte range collected during the rollback check
struct RelocatedRange {
    file_offset: u64,
    bytes: Vec<u8>,
}

/// Rolls a converted filesystem back to the foreign one.
///
/// Verifies the bit-exact invariant on every image extent, reads the
/// relocated reserved-range bytes out, then rewrites the reserved ranges;
/// the range holding the foreign superblock goes last.
pub fn rollback<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    blockdev::ensure_unmounted(path)?;

    let fs = FsInfo::open(path, OpenOptions::default())?;
    let total_bytes = fs.superblock().total_bytes();
    let reserved = clipped_reserved(total_bytes);

    // Locate <foreign>_saved/image.
    let fs_root = fs.read_root(objectid::FS_TREE)?;
    let saved_id = [&b"ext2_saved"[..], &b"reiserfs_saved"[..]]
        .iter()
        .find_map(|name| roots::lookup_subvolume(&fs, &fs_root, FIRST_FREE_OBJECTID, name).ok())
        .ok_or_else(|| {
            FsError::NotFound("saved image subvolume (was it deleted?)".to_string())
        })?;
    let image_root = fs.read_root(saved_id)?;
    let image_entry = inode::lookup_dir_entry(&fs, &image_root, FIRST_FREE_OBJECTID, IMAGE_FILE_NAME)?
        .ok_or_else(|| FsError::NotFound("image file in saved subvolume".to_string()))?;
    let image_ino = image_entry.location.objectid;
    let image_item = inode::lookup_inode(&fs, &image_root, image_ino)?;

    if image_item.size > total_bytes {
        // Copy the packed field before formatting borrows it.
        return Err(FsError::Invariant(format!(
            "image claims {} bytes on a {} byte filesystem",
            { image_item.size },
            total_bytes
        )));
    }

    // Check every extent and read the relocated ones out.
    let mut relocated: Vec<RelocatedRange> = Vec::new();
    for (file_offset, fe) in inode::file_extents(&fs, &image_root, image_ino)? {
        if fe.is_hole() {
            continue;
        }
        if fe.extent_type == inode::file_extent_type::INLINE {
            return Err(FsError::Invariant(
                "image inode carries an inline extent".to_string(),
            ));
        }

        let in_reserved = reserved.contains(file_offset, fe.num_bytes);
        if in_reserved {
            let bytes = fs.read_data(fe.disk_bytenr + fe.offset, fe.num_bytes)?;
            relocated.push(RelocatedRange { file_offset, bytes });
            continue;
        }

        if reserved.intersects(file_offset, fe.num_bytes) {
            return Err(FsError::Invariant(format!(
                "image extent at offset {} straddles a reserved range",
                file_offset
            )));
        }

        // The bit-exact contract: file offset == disk bytenr, and the
        // covering chunk maps 1:1 on a SINGLE profile. A chunk lookup that
        // lands past the extent is corruption, not absence.
        if fe.disk_bytenr + fe.offset != file_offset {
            return Err(FsError::Invariant(format!(
                "image extent at offset {} points at bytenr {}",
                file_offset,
                fe.disk_bytenr + fe.offset
            )));
        }
        let chunks = fs.chunks();
        let chunk = chunks.lookup(fe.disk_bytenr).map_err(|_| {
            FsError::Invariant(format!(
                "no chunk covers image extent at offset {}",
                file_offset
            ))
        })?;
        let is_single = chunk.type_flags & chunk_type::PROFILE_MASK == 0;
        if !is_single || chunk.logical != chunk.stripes[0].offset {
            return Err(FsError::Invariant(format!(
                "chunk at logical {} is not identity mapped",
                chunk.logical
            )));
        }
    }

    tracing::info!(
        extents = relocated.len(),
        "image verified, restoring foreign filesystem"
    );
    drop(fs);

    // All checks passed; start writing. The buffer holding the foreign
    // primary superblock goes last so a torn rollback stays recoverable.
    let dev = blockdev::open(path, false)?;

    // Retire the backup supers so only the foreign filesystem remains.
    for mirror in 1..superblock::SUPER_MIRROR_MAX {
        let offset = superblock::super_offset(mirror);
        if offset + SUPER_INFO_SIZE as u64 <= total_bytes {
            blockdev::write_all_at(dev.as_ref(), offset, &vec![0u8; SUPER_INFO_SIZE])?;
        }
    }

    // Clear the reserved MiB, dropping the primary super with it.
    let zeroes = vec![0u8; 64 * 1024];
    let mut off = 0u64;
    while off < RESERVED_1M.min(total_bytes) {
        blockdev::write_all_at(dev.as_ref(), off, &zeroes)?;
        off += zeroes.len() as u64;
    }
    dev.sync_device()?;

    let holds_foreign_super = |r: &RelocatedRange| {
        r.file_offset <= ext2::EXT2_SUPER_OFFSET
            && ext2::EXT2_SUPER_OFFSET < r.file_offset + r.bytes.len() as u64
    };
    relocated.sort_by_key(|r| (holds_foreign_super(r), r.file_offset));

    for range in &relocated {
        blockdev::write_all_at(dev.as_ref(), range.file_offset, &range.bytes)?;
    }
    dev.sync_device()?;

    tracing::info!("rollback complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::ImageFile;

    fn convert_sample(content: &[u8], datacsum: bool) -> tempfile::NamedTempFile {
        let img = ext2::test_image::build(content);
        let temp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), &img).unwrap();

        let opts = ConvertOptions {
            datacsum,
            ..Default::default()
        };
        convert(temp.path(), &opts).unwrap();
        temp
    }

    #[test]
    fn test_plan_data_chunks_covers_and_aligns() {
        let mut keep = IntervalSet::new();
        keep.insert(0x200000, 0x3000);
        keep.insert(0x900000, 0x1000);
        let forbidden = clipped_reserved(1 << 30);

        let covers = plan_data_chunks(&keep, &forbidden, 1 << 30);
        for &(s, l) in &covers {
            assert_eq!(s % STRIPE_LEN, 0);
            assert_eq!(l % STRIPE_LEN, 0);
            assert!(s >= RESERVED_1M);
        }
        for (s, l) in keep.iter() {
            assert!(
                covers.iter().any(|&(cs, cl)| cs <= s && s + l <= cs + cl),
                "kept range [{:#x}, +{:#x}) uncovered",
                s,
                l
            );
        }
        // Non-overlapping, sorted.
        for pair in covers.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }
    }

    #[test]
    fn test_convert_produces_valid_filesystem() {
        let temp = convert_sample(b"hi\n", false);

        let fs = FsInfo::open(temp.path(), OpenOptions::default()).unwrap();
        assert_eq!(fs.label(), "oldfs");
        assert_eq!(fs.sectorsize(), ext2::test_image::BLOCK_SIZE);

        // The saved subvolume with the image inode exists.
        let fs_root = fs.read_root(objectid::FS_TREE).unwrap();
        let saved = roots::lookup_subvolume(&fs, &fs_root, FIRST_FREE_OBJECTID, b"ext2_saved").unwrap();
        let image_root = fs.read_root(saved).unwrap();
        let item = inode::lookup_inode(&fs, &image_root, IMAGE_INO).unwrap();
        assert_eq!({ item.size }, 16 * 1024 * 1024);
        assert!(item.flags & inode_flags::NODATASUM != 0);
    }

    #[test]
    fn test_convert_bit_exact_invariant() {
        let temp = convert_sample(b"hi\n", false);
        let fs = FsInfo::open(temp.path(), OpenOptions::default()).unwrap();
        let total = fs.superblock().total_bytes();
        let reserved = clipped_reserved(total);

        let fs_root = fs.read_root(objectid::FS_TREE).unwrap();
        let saved = roots::lookup_subvolume(&fs, &fs_root, FIRST_FREE_OBJECTID, b"ext2_saved").unwrap();
        let image_root = fs.read_root(saved).unwrap();

        for (off, fe) in inode::file_extents(&fs, &image_root, IMAGE_INO).unwrap() {
            if fe.is_hole() {
                continue;
            }
            if reserved.contains(off, fe.num_bytes) {
                // Relocated extents must not be identity mapped.
                continue;
            }
            assert_eq!(fe.disk_bytenr + fe.offset, off);
            let chunks = fs.chunks();
            let chunk = chunks.lookup(fe.disk_bytenr).unwrap();
            assert_eq!(chunk.type_flags & chunk_type::PROFILE_MASK, 0);
            assert_eq!(chunk.logical, chunk.stripes[0].offset);
        }
    }

    #[test]
    fn test_convert_reflinks_file_content() {
        let temp = convert_sample(b"hi\n", false);
        let fs = FsInfo::open(temp.path(), OpenOptions::default()).unwrap();
        let fs_root = fs.read_root(objectid::FS_TREE).unwrap();

        let entry = inode::lookup_dir_entry(&fs, &fs_root, FIRST_FREE_OBJECTID, b"hello.txt")
            .unwrap()
            .unwrap();
        let ino = entry.location.objectid;
        let item = inode::lookup_inode(&fs, &fs_root, ino).unwrap();
        assert_eq!({ item.size }, 3);
        assert_eq!({ item.mtime.sec }, 1_600_000_002);

        let extents = inode::file_extents(&fs, &fs_root, ino).unwrap();
        assert_eq!(extents.len(), 1);
        let (off, fe) = extents[0];
        assert_eq!(off, 0);

        // The extent's physical address is the original ext2 block.
        assert_eq!(fe.disk_bytenr + fe.offset, ext2::test_image::content_offset());

        let data = fs.read_data(fe.disk_bytenr + fe.offset, fe.num_bytes).unwrap();
        assert_eq!(&data[..3], b"hi\n");
    }

    #[test]
    fn test_convert_with_datacsum() {
        let temp = convert_sample(b"checksummed content\n", true);
        let fs = FsInfo::open(temp.path(), OpenOptions::default()).unwrap();
        let fs_root = fs.read_root(objectid::FS_TREE).unwrap();

        let entry = inode::lookup_dir_entry(&fs, &fs_root, FIRST_FREE_OBJECTID, b"hello.txt")
            .unwrap()
            .unwrap();
        let item = inode::lookup_inode(&fs, &fs_root, entry.location.objectid).unwrap();
        assert_eq!(item.flags & inode_flags::NODATASUM, 0);

        // A csum item exists for the file's extent.
        let csum_root = fs.read_root(objectid::CSUM_TREE).unwrap();
        let key = Key::new(
            EXTENT_CSUM_OBJECTID,
            item_type::EXTENT_CSUM,
            ext2::test_image::content_offset(),
        );
        let mut path = crate::core::tree::Path::new();
        let found =
            crate::core::tree::search_slot(None, &fs, &csum_root, &key, 0, false, &mut path).unwrap();
        assert!(found);
    }

    #[test]
    fn test_rollback_restores_foreign_fs() {
        let original = ext2::test_image::build(b"hi\n");
        let temp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), &original).unwrap();

        let used = {
            let dev = Box::new(ImageFile::open(temp.path(), true).unwrap());
            Ext2Fs::open(dev).unwrap().used_extents().unwrap()
        };

        convert(temp.path(), &ConvertOptions { datacsum: false, ..Default::default() }).unwrap();
        rollback(temp.path()).unwrap();

        // Every byte the foreign filesystem owned is back, bit for bit.
        let restored = std::fs::read(temp.path()).unwrap();
        assert_eq!(restored.len(), original.len());
        for (s, l) in used.iter() {
            let (s, l) = (s as usize, l as usize);
            assert_eq!(
                &restored[s..s + l],
                &original[s..s + l],
                "used range at {:#x} differs after rollback",
                s
            );
        }

        // And it opens as ext2 again.
        let dev = Box::new(ImageFile::open(temp.path(), true).unwrap());
        let e2 = Ext2Fs::open(dev).unwrap();
        let root = e2.read_inode(ext2::EXT2_ROOT_INO).unwrap();
        let entries = e2.read_dir(&root).unwrap();
        assert_eq!(entries[0].name, b"hello.txt");
    }

    #[test]
    fn test_rollback_refuses_tampered_image() {
        let temp = convert_sample(b"hi\n", false);

        // Rewrite one image extent so it is no longer identity mapped.
        {
            let fs = FsInfo::open(
                temp.path(),
                OpenOptions {
                    write: true,
                    super_bytenr: None,
                },
            )
            .unwrap();
            let fs_root = fs.read_root(objectid::FS_TREE).unwrap();
            let saved =
                roots::lookup_subvolume(&fs, &fs_root, FIRST_FREE_OBJECTID, b"ext2_saved").unwrap();
            let image_root = fs.read_root(saved).unwrap();

            let (off, mut fe) = inode::file_extents(&fs, &image_root, IMAGE_INO)
                .unwrap()
                .into_iter()
                .find(|(off, fe)| !fe.is_hole() && *off == fe.disk_bytenr)
                .unwrap();

            let trans = fs.begin_transaction().unwrap();
            let key = Key::new(IMAGE_INO, item_type::EXTENT_DATA, off);
            let mut path = crate::core::tree::Path::new();
            let found = crate::core::tree::search_slot(
                Some(&trans),
                &fs,
                &image_root,
                &key,
                0,
                true,
                &mut path,
            )
            .unwrap();
            assert!(found);
            fe.offset += fs.sectorsize() as u64;
            path.leaf().unwrap().set_item_payload(path.slots[0], &fe.to_bytes());
            trans.commit().unwrap();
        }

        match rollback(temp.path()) {
            Err(FsError::Invariant(_)) => (),
            other => panic!("expected Invariant refusal, got {:?}", other.map(|_| ())),
        }
    }
}
