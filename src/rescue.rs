//! Chunk tree recovery
//!
//! When the chunk tree is unreadable the logical address space cannot be
//! resolved and nothing else can be repaired. Recovery scans the device
//! for blocks owned by the chunk tree, collects the freshest chunk items,
//! rebuilds the mapping, rewrites the chunk tree root and the system chunk
//! array, and finishes with the superblock set, primary last.

use crate::blockdev::{self, BlockDevice};
use crate::core::checksum::{self, ChecksumType};
use crate::core::chunk::{ChunkMap, ChunkMapping};
use crate::core::ebcache::ExtentBuffer;
use crate::core::superblock::{self, DevItem, Superblock};
use crate::core::tree::{Key, LeafBuilder};
use crate::core::{item_type, objectid, CancelToken, FsError, Result, SUPER_INFO_SIZE};
use std::collections::HashMap;
use std::path::Path;

/// Options for chunk recovery
#[derive(Default)]
pub struct RescueOptions {
    pub cancel: CancelToken,
}

/// Outcome of a recovery run
pub struct RescueReport {
    pub chunks_recovered: usize,
    pub scanned_blocks: u64,
    /// The chunk tree itself had to be rewritten
    pub rebuilt_chunk_root: bool,
}

/// Scans the device and rebuilds the chunk tree
pub fn chunk_recover<P: AsRef<Path>>(path: P, opts: &RescueOptions) -> Result<RescueReport> {
    blockdev::ensure_unmounted(path.as_ref())?;
    let dev = blockdev::open(path.as_ref(), false)?;

    let sb = Superblock::read_best(dev.as_ref())?;
    let csum_type = ChecksumType::from_disk(sb.csum_type())?;
    let fsid = sb.fsid();
    let nodesize = sb.node_size() as usize;
    let dev_item = sb.dev_item();

    // Full device sweep for chunk-tree blocks. Headers carry the logical
    // address; the physical position is where we found them.
    let mut best: HashMap<Key, (u64, ChunkMapping)> = HashMap::new();
    let mut chunk_root_candidate: Option<(u64, u64, u64)> = None; // (gen, logical, physical)
    let mut scanned = 0u64;
    let mut buf = vec![0u8; nodesize];

    let mut offset = 0u64;
    while offset + nodesize as u64 <= dev.size() {
        opts.cancel.check()?;
        scanned += 1;
        if blockdev::read_exact_at(dev.as_ref(), offset, &mut buf).is_err() {
            offset += nodesize as u64;
            continue;
        }
        if buf[crate::core::ebcache::HEADER_FSID..crate::core::ebcache::HEADER_FSID + 16] != fsid
            || checksum::verify_block_csum(csum_type, &buf, 0).is_err()
        {
            offset += nodesize as u64;
            continue;
        }

        let eb = ExtentBuffer::from_bytes(0, buf.clone());
        if eb.owner() == objectid::CHUNK_TREE && eb.is_leaf() {
            let generation = eb.generation();
            for slot in 0..eb.nritems() as usize {
                let key = eb.item_key(slot);
                if key.item_type != item_type::CHUNK_ITEM {
                    continue;
                }
                let chunk = match ChunkMapping::parse(&eb.item_data(slot), key.offset) {
                    Ok(c) => c,
                    Err(_) => continue,
                };
                let stale = best
                    .get(&key)
                    .map(|(g, _)| *g >= generation)
                    .unwrap_or(false);
                if !stale {
                    best.insert(key, (generation, chunk));
                }
            }
            let root_is_newer = chunk_root_candidate
                .map(|(g, _, _)| g < generation)
                .unwrap_or(true);
            if root_is_newer {
                chunk_root_candidate = Some((generation, eb.header_bytenr(), offset));
            }
        }
        offset += nodesize as u64;
    }

    if best.is_empty() {
        return Err(FsError::NotFound(
            "no chunk items found on the device".to_string(),
        ));
    }

    let mut map = ChunkMap::new();
    for (_, (_, chunk)) in best.iter() {
        // Overlaps between generations resolve toward the freshest copy
        // already, so a second overlap is real corruption.
        map.insert(chunk.clone())?;
    }

    tracing::info!(
        chunks = map.len(),
        scanned,
        "device scan complete"
    );

    // If the current chunk root still checks out under the recovered map,
    // only the system array and supers need refreshing.
    let mut rebuilt = false;
    let chunk_root_ok = map
        .map_read(sb.chunk_root(), sb.node_size() as u64)
        .ok()
        .and_then(|mirrors| {
            mirrors.iter().find_map(|m| {
                let mut block = vec![0u8; nodesize];
                blockdev::read_exact_at(dev.as_ref(), m.physical, &mut block).ok()?;
                checksum::verify_block_csum(csum_type, &block, sb.chunk_root()).ok()?;
                Some(())
            })
        })
        .is_some();

    let mut sb = sb.clone();
    if !chunk_root_ok {
        // Rebuild the chunk tree as one leaf at the freshest copy's home.
        let (_, logical, physical) = chunk_root_candidate.ok_or_else(|| {
            FsError::CorruptRead("chunk tree root unreadable and no leaf found".to_string())
        })?;

        let generation = sb.generation();
        let mut builder = LeafBuilder::new(logical, nodesize, objectid::CHUNK_TREE, generation);
        builder.add(
            Key::new(objectid::DEV_ITEMS, item_type::DEV_ITEM, dev_item.devid),
            dev_item.to_bytes().to_vec(),
        )?;
        let mut items: Vec<(Key, Vec<u8>)> = best
            .iter()
            .map(|(key, (_, chunk))| (*key, chunk.to_bytes(sb.sector_size())))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, data) in items {
            builder.add(key, data)?;
        }
        let mut bytes = builder.build(&fsid, &sb.chunk_tree_uuid())?;
        checksum::stamp_block_csum(csum_type, &mut bytes);
        blockdev::write_all_at(dev.as_ref(), physical, &bytes)?;

        sb.set_chunk_root(logical, 0, generation);
        rebuilt = true;
        tracing::warn!(logical, physical, "chunk tree root rebuilt");
    }

    let sys_array = map.build_sys_array(sb.sector_size())?;
    sb.set_sys_chunk_array(&sys_array)?;

    // Secondaries first, barrier, primary, barrier.
    for mirror in 1..superblock::SUPER_MIRROR_MAX {
        let mirror_offset = superblock::super_offset(mirror);
        if mirror_offset + SUPER_INFO_SIZE as u64 > dev.size() {
            continue;
        }
        blockdev::write_all_at(dev.as_ref(), mirror_offset, &sb.serialize_for(mirror_offset)?)?;
    }
    dev.sync_device()?;
    blockdev::write_all_at(
        dev.as_ref(),
        crate::core::SUPER_INFO_OFFSET,
        &sb.serialize_for(crate::core::SUPER_INFO_OFFSET)?,
    )?;
    dev.sync_device()?;

    Ok(RescueReport {
        chunks_recovered: map.len(),
        scanned_blocks: scanned,
        rebuilt_chunk_root: rebuilt,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::ImageFile;
    use crate::core::{FsInfo, OpenOptions};
    use crate::mkfs::{self, MkfsConfig};

    fn mkfs_image() -> tempfile::NamedTempFile {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let dev = ImageFile::create(temp.path(), 64 * 1024 * 1024).unwrap();
        mkfs::format_device(
            &dev,
            &MkfsConfig {
                sectorsize: 4096,
                ..Default::default()
            },
        )
        .unwrap();
        temp
    }

    #[test]
    fn test_recover_intact_filesystem() {
        let temp = mkfs_image();
        let report = chunk_recover(temp.path(), &RescueOptions::default()).unwrap();

        assert_eq!(report.chunks_recovered, 3);
        assert!(!report.rebuilt_chunk_root);

        let fs = FsInfo::open(temp.path(), OpenOptions::default()).unwrap();
        assert_eq!(fs.chunks().len(), 3);
    }

    #[test]
    fn test_recover_after_metadata_corruption() {
        // Damage a non-chunk tree block; recovery must still succeed.
        let temp = mkfs_image();
        let target = {
            let fs = FsInfo::open(temp.path(), OpenOptions::default()).unwrap();
            let root = fs.read_root(crate::core::objectid::CSUM_TREE).unwrap();
            root.location().0
        };
        let dev = ImageFile::open(temp.path(), false).unwrap();
        blockdev::write_all_at(&dev, target + 0x100, &[0xFF; 64]).unwrap();
        drop(dev);

        let report = chunk_recover(temp.path(), &RescueOptions::default()).unwrap();
        assert_eq!(report.chunks_recovered, 3);
        assert!(FsInfo::open(temp.path(), OpenOptions::default()).is_ok());
    }

    #[test]
    fn test_recover_rebuilds_destroyed_sys_array() {
        // Wipe the primary super's system chunk array by rewriting all
        // supers with an empty one; recovery restores it from the scan.
        let temp = mkfs_image();
        {
            let dev = ImageFile::open(temp.path(), false).unwrap();
            let mut sb = Superblock::read_best(&dev).unwrap();
            sb.set_sys_chunk_array(&[]).unwrap();
            for mirror in 0..superblock::SUPER_MIRROR_MAX {
                let off = superblock::super_offset(mirror);
                if off + SUPER_INFO_SIZE as u64 <= dev.size() {
                    blockdev::write_all_at(&dev, off, &sb.serialize_for(off).unwrap()).unwrap();
                }
            }
        }

        // The filesystem no longer opens: the chunk tree cannot be found.
        assert!(FsInfo::open(temp.path(), OpenOptions::default()).is_err());

        let report = chunk_recover(temp.path(), &RescueOptions::default()).unwrap();
        assert_eq!(report.chunks_recovered, 3);

        let fs = FsInfo::open(temp.path(), OpenOptions::default()).unwrap();
        assert_eq!(fs.chunks().len(), 3);
    }
}
