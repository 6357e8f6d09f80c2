//! Chunk tree: logical to physical mapping and chunk allocation
//!
//! The map is bootstrapped from the superblock's system-chunk array (enough
//! to find the chunk tree) and then extended by walking the chunk tree
//! proper. Allocation picks device extents per the RAID profile and records
//! the chunk in the chunk tree, the device tree and the extent tree.

use super::superblock::{DevItem, Superblock, SYS_CHUNK_ARRAY_SIZE};
use super::transaction::Transaction;
use super::tree::{self, Key, KEY_SIZE};
use super::{item_type, objectid, FsError, FsInfo, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Stripe length all chunks use
pub const STRIPE_LEN: u64 = 64 * 1024;

/// Fixed header size of a chunk item, before the stripe array
pub const CHUNK_ITEM_SIZE: usize = 0x30;

/// Size of one stripe entry
pub const STRIPE_SIZE: usize = 0x20;

/// Serialised size of a device extent item
pub const DEV_EXTENT_SIZE: usize = 0x30;

/// Target chunk sizes by type
pub const SYSTEM_CHUNK_SIZE: u64 = 4 * 1024 * 1024;
pub const METADATA_CHUNK_SIZE: u64 = 256 * 1024 * 1024;
pub const DATA_CHUNK_SIZE: u64 = 1024 * 1024 * 1024;

/// Smallest chunk worth creating
pub const MIN_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Chunk type flags
pub mod chunk_type {
    pub const DATA: u64 = 1 << 0;
    pub const SYSTEM: u64 = 1 << 1;
    pub const METADATA: u64 = 1 << 2;
    pub const RAID0: u64 = 1 << 3;
    pub const RAID1: u64 = 1 << 4;
    pub const DUP: u64 = 1 << 5;
    pub const RAID10: u64 = 1 << 6;
    pub const RAID5: u64 = 1 << 7;
    pub const RAID6: u64 = 1 << 8;
    pub const RAID1C3: u64 = 1 << 9;
    pub const RAID1C4: u64 = 1 << 10;

    pub const PROFILE_MASK: u64 =
        RAID0 | RAID1 | DUP | RAID10 | RAID5 | RAID6 | RAID1C3 | RAID1C4;
}

/// Placement requirements of a RAID profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaidProfile {
    /// Devices required to create the chunk
    pub min_devices: usize,
    /// Complete copies of every byte
    pub copies: usize,
    /// Stripes placed per device (DUP puts both on one)
    pub stripes_per_device: usize,
    /// Device losses survivable
    pub tolerance: usize,
}

/// Looks up the profile table for a chunk type
pub fn profile_info(type_flags: u64) -> RaidProfile {
    use chunk_type::*;
    match type_flags & PROFILE_MASK {
        0 => RaidProfile { min_devices: 1, copies: 1, stripes_per_device: 1, tolerance: 0 },
        DUP => RaidProfile { min_devices: 1, copies: 2, stripes_per_device: 2, tolerance: 0 },
        RAID0 => RaidProfile { min_devices: 2, copies: 1, stripes_per_device: 1, tolerance: 0 },
        RAID1 => RaidProfile { min_devices: 2, copies: 2, stripes_per_device: 1, tolerance: 1 },
        RAID1C3 => RaidProfile { min_devices: 3, copies: 3, stripes_per_device: 1, tolerance: 2 },
        RAID1C4 => RaidProfile { min_devices: 4, copies: 4, stripes_per_device: 1, tolerance: 3 },
        RAID10 => RaidProfile { min_devices: 4, copies: 2, stripes_per_device: 1, tolerance: 1 },
        RAID5 => RaidProfile { min_devices: 2, copies: 1, stripes_per_device: 1, tolerance: 1 },
        RAID6 => RaidProfile { min_devices: 3, copies: 1, stripes_per_device: 1, tolerance: 2 },
        // Multiple profile bits set is corrupt input; fail closed as SINGLE.
        _ => RaidProfile { min_devices: 1, copies: 1, stripes_per_device: 1, tolerance: 0 },
    }
}

/// A stripe within a chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stripe {
    pub devid: u64,
    pub offset: u64,
    pub dev_uuid: [u8; 16],
}

/// One physical copy of a logical range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mirror {
    pub devid: u64,
    pub physical: u64,
}

/// A chunk mapping entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMapping {
    /// Logical address start
    pub logical: u64,
    /// Size of the chunk
    pub length: u64,
    /// Stripe length
    pub stripe_len: u64,
    /// Type flags
    pub type_flags: u64,
    /// Number of stripes
    pub num_stripes: u16,
    /// Sub stripes (RAID10)
    pub sub_stripes: u16,
    /// Stripe placements
    pub stripes: Vec<Stripe>,
}

impl ChunkMapping {
    pub fn end(&self) -> u64 {
        self.logical + self.length
    }

    pub fn is_system(&self) -> bool {
        self.type_flags & chunk_type::SYSTEM != 0
    }

    /// Parses a chunk item payload; `logical` comes from the item key offset
    pub fn parse(data: &[u8], logical: u64) -> Result<Self> {
        if data.len() < CHUNK_ITEM_SIZE {
            return Err(FsError::CorruptRead("chunk item too small".to_string()));
        }

        let length = LittleEndian::read_u64(&data[0..8]);
        let _owner = LittleEndian::read_u64(&data[8..16]);
        let stripe_len = LittleEndian::read_u64(&data[16..24]);
        let type_flags = LittleEndian::read_u64(&data[24..32]);
        let num_stripes = LittleEndian::read_u16(&data[44..46]);
        let sub_stripes = LittleEndian::read_u16(&data[46..48]);

        if num_stripes == 0 {
            return Err(FsError::CorruptRead(format!(
                "chunk at logical {} has zero stripes",
                logical
            )));
        }

        let mut stripes = Vec::with_capacity(num_stripes as usize);
        let mut offset = CHUNK_ITEM_SIZE;
        for _ in 0..num_stripes {
            if offset + STRIPE_SIZE > data.len() {
                return Err(FsError::CorruptRead(format!(
                    "chunk at logical {} has truncated stripe array",
                    logical
                )));
            }
            let devid = LittleEndian::read_u64(&data[offset..offset + 8]);
            let stripe_offset = LittleEndian::read_u64(&data[offset + 8..offset + 16]);
            let mut dev_uuid = [0u8; 16];
            dev_uuid.copy_from_slice(&data[offset + 16..offset + 32]);
            stripes.push(Stripe {
                devid,
                offset: stripe_offset,
                dev_uuid,
            });
            offset += STRIPE_SIZE;
        }

        Ok(Self {
            logical,
            length,
            stripe_len,
            type_flags,
            num_stripes,
            sub_stripes,
            stripes,
        })
    }

    /// Serialises the chunk item payload (without the key)
    pub fn to_bytes(&self, sectorsize: u32) -> Vec<u8> {
        let mut out = vec![0u8; CHUNK_ITEM_SIZE + self.stripes.len() * STRIPE_SIZE];
        LittleEndian::write_u64(&mut out[0..8], self.length);
        LittleEndian::write_u64(&mut out[8..16], objectid::EXTENT_TREE);
        LittleEndian::write_u64(&mut out[16..24], self.stripe_len);
        LittleEndian::write_u64(&mut out[24..32], self.type_flags);
        LittleEndian::write_u32(&mut out[32..36], STRIPE_LEN as u32);
        LittleEndian::write_u32(&mut out[36..40], STRIPE_LEN as u32);
        LittleEndian::write_u32(&mut out[40..44], sectorsize);
        LittleEndian::write_u16(&mut out[44..46], self.stripes.len() as u16);
        LittleEndian::write_u16(&mut out[46..48], self.sub_stripes);

        let mut offset = CHUNK_ITEM_SIZE;
        for stripe in &self.stripes {
            LittleEndian::write_u64(&mut out[offset..offset + 8], stripe.devid);
            LittleEndian::write_u64(&mut out[offset + 8..offset + 16], stripe.offset);
            out[offset + 16..offset + 32].copy_from_slice(&stripe.dev_uuid);
            offset += STRIPE_SIZE;
        }
        out
    }

    /// Size of the serialised item
    pub fn item_size(&self) -> usize {
        CHUNK_ITEM_SIZE + self.stripes.len() * STRIPE_SIZE
    }
}

/// A device extent item: reverse map from a physical range to its chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevExtent {
    pub chunk_tree: u64,
    pub chunk_objectid: u64,
    pub chunk_offset: u64,
    pub length: u64,
    pub chunk_tree_uuid: [u8; 16],
}

impl DevExtent {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < DEV_EXTENT_SIZE {
            return Err(FsError::CorruptRead("device extent too small".to_string()));
        }
        let mut chunk_tree_uuid = [0u8; 16];
        chunk_tree_uuid.copy_from_slice(&data[32..48]);
        Ok(Self {
            chunk_tree: LittleEndian::read_u64(&data[0..8]),
            chunk_objectid: LittleEndian::read_u64(&data[8..16]),
            chunk_offset: LittleEndian::read_u64(&data[16..24]),
            length: LittleEndian::read_u64(&data[24..32]),
            chunk_tree_uuid,
        })
    }

    pub fn to_bytes(&self) -> [u8; DEV_EXTENT_SIZE] {
        let mut out = [0u8; DEV_EXTENT_SIZE];
        LittleEndian::write_u64(&mut out[0..8], self.chunk_tree);
        LittleEndian::write_u64(&mut out[8..16], self.chunk_objectid);
        LittleEndian::write_u64(&mut out[16..24], self.chunk_offset);
        LittleEndian::write_u64(&mut out[24..32], self.length);
        out[32..48].copy_from_slice(&self.chunk_tree_uuid);
        out
    }
}

/// The in-memory chunk map: ordered by logical start
pub struct ChunkMap {
    chunks: BTreeMap<u64, ChunkMapping>,
}

impl ChunkMap {
    pub fn new() -> Self {
        Self {
            chunks: BTreeMap::new(),
        }
    }

    /// Bootstraps the map from the superblock's system chunk array
    pub fn from_sys_array(sb: &Superblock) -> Result<Self> {
        let mut map = Self::new();
        let array = sb.sys_chunk_array();
        let mut offset = 0;

        while offset < array.len() {
            if offset + KEY_SIZE > array.len() {
                return Err(FsError::CorruptRead(
                    "truncated key in system chunk array".to_string(),
                ));
            }
            let key = Key::from_bytes(&array[offset..offset + KEY_SIZE]);
            offset += KEY_SIZE;

            if key.item_type != item_type::CHUNK_ITEM {
                // Copy the packed field before formatting borrows it.
                return Err(FsError::CorruptRead(format!(
                    "unexpected item type {} in system chunk array",
                    { key.item_type }
                )));
            }

            let chunk = ChunkMapping::parse(&array[offset..], key.offset)?;
            offset += chunk.item_size();
            map.insert(chunk)?;
        }

        Ok(map)
    }

    /// Rebuilds the system chunk array payload from the SYSTEM chunks
    pub fn build_sys_array(&self, sectorsize: u32) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for chunk in self.chunks.values().filter(|c| c.is_system()) {
            let key = Key::new(objectid::FIRST_CHUNK_TREE, item_type::CHUNK_ITEM, chunk.logical);
            out.extend_from_slice(&key.to_bytes());
            out.extend_from_slice(&chunk.to_bytes(sectorsize));
        }
        if out.len() > SYS_CHUNK_ARRAY_SIZE {
            return Err(FsError::Invariant(format!(
                "system chunk array overflow: {} bytes",
                out.len()
            )));
        }
        Ok(out)
    }

    /// Inserts a chunk, rejecting overlap with existing chunks
    pub fn insert(&mut self, chunk: ChunkMapping) -> Result<()> {
        if let Some((_, prev)) = self.chunks.range(..=chunk.logical).next_back() {
            if prev.end() > chunk.logical && prev.logical != chunk.logical {
                return Err(FsError::Invariant(format!(
                    "chunk at logical {} overlaps chunk at {}",
                    chunk.logical, prev.logical
                )));
            }
        }
        if let Some((_, next)) = self.chunks.range(chunk.logical + 1..).next() {
            if chunk.end() > next.logical {
                return Err(FsError::Invariant(format!(
                    "chunk at logical {} overlaps chunk at {}",
                    chunk.logical, next.logical
                )));
            }
        }
        self.chunks.insert(chunk.logical, chunk);
        Ok(())
    }

    /// Finds the chunk containing `logical`.
    ///
    /// A candidate starting above `logical` is a miss, never a match; the
    /// rollback safety check depends on that strictness.
    pub fn lookup(&self, logical: u64) -> Result<&ChunkMapping> {
        let (_, chunk) = self
            .chunks
            .range(..=logical)
            .next_back()
            .ok_or_else(|| FsError::NotFound(format!("no chunk for logical {}", logical)))?;
        if logical >= chunk.end() {
            return Err(FsError::NotFound(format!(
                "logical {} is past chunk at {}",
                logical, chunk.logical
            )));
        }
        Ok(chunk)
    }

    /// First logical address past every existing chunk, stripe aligned
    pub fn next_logical(&self) -> u64 {
        let end = self
            .chunks
            .values()
            .map(|c| c.end())
            .max()
            .unwrap_or(super::RESERVED_1M);
        (end + STRIPE_LEN - 1) & !(STRIPE_LEN - 1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChunkMapping> {
        self.chunks.values()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn mirrors_for(&self, chunk: &ChunkMapping, offset_in_chunk: u64, len: u64) -> Result<Vec<Mirror>> {
        use chunk_type::*;

        if offset_in_chunk + len > chunk.length {
            return Err(FsError::Invariant(format!(
                "range [{}, +{}) straddles chunk at logical {}",
                chunk.logical + offset_in_chunk,
                len,
                chunk.logical
            )));
        }

        let profile = chunk.type_flags & PROFILE_MASK;
        let mut out = Vec::new();

        match profile {
            0 => {
                let stripe = &chunk.stripes[0];
                out.push(Mirror {
                    devid: stripe.devid,
                    physical: stripe.offset + offset_in_chunk,
                });
            }
            DUP | RAID1 | RAID1C3 | RAID1C4 => {
                for stripe in &chunk.stripes {
                    out.push(Mirror {
                        devid: stripe.devid,
                        physical: stripe.offset + offset_in_chunk,
                    });
                }
            }
            RAID0 => {
                let stripe_nr = offset_in_chunk / chunk.stripe_len;
                let stripe_off = offset_in_chunk % chunk.stripe_len;
                if stripe_off + len > chunk.stripe_len {
                    return Err(FsError::Invariant(format!(
                        "range crosses a stripe boundary in chunk at logical {}",
                        chunk.logical
                    )));
                }
                let index = (stripe_nr % chunk.num_stripes as u64) as usize;
                let stripe = &chunk.stripes[index];
                out.push(Mirror {
                    devid: stripe.devid,
                    physical: stripe.offset
                        + (stripe_nr / chunk.num_stripes as u64) * chunk.stripe_len
                        + stripe_off,
                });
            }
            RAID10 => {
                let groups = (chunk.num_stripes / chunk.sub_stripes.max(1)) as u64;
                let stripe_nr = offset_in_chunk / chunk.stripe_len;
                let stripe_off = offset_in_chunk % chunk.stripe_len;
                if stripe_off + len > chunk.stripe_len {
                    return Err(FsError::Invariant(format!(
                        "range crosses a stripe boundary in chunk at logical {}",
                        chunk.logical
                    )));
                }
                let group = (stripe_nr % groups) as usize;
                let physical_off =
                    (stripe_nr / groups) * chunk.stripe_len + stripe_off;
                for sub in 0..chunk.sub_stripes as usize {
                    let stripe = &chunk.stripes[group * chunk.sub_stripes as usize + sub];
                    out.push(Mirror {
                        devid: stripe.devid,
                        physical: stripe.offset + physical_off,
                    });
                }
            }
            RAID5 | RAID6 => {
                // Parity reconstruction belongs to the kernel; the toolkit
                // only ever allocates such chunks.
                return Err(FsError::FeatureUnsupported(format!(
                    "reading parity chunk at logical {}",
                    chunk.logical
                )));
            }
            _ => {
                return Err(FsError::CorruptRead(format!(
                    "chunk at logical {} has conflicting profile bits {:#x}",
                    chunk.logical, profile
                )));
            }
        }

        Ok(out)
    }

    /// Maps a logical range to every mirror copy, for reads
    pub fn map_read(&self, logical: u64, len: u64) -> Result<Vec<Mirror>> {
        let chunk = self.lookup(logical)?;
        self.mirrors_for(chunk, logical - chunk.logical, len)
    }

    /// Maps a logical range to the full writer set
    pub fn map_write(&self, logical: u64, len: u64) -> Result<Vec<Mirror>> {
        // Every copy gets written; the read set already is the full set for
        // the mirrored profiles and the single placement otherwise.
        self.map_read(logical, len)
    }
}

impl Default for ChunkMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Extends the bootstrap map by walking the chunk tree
pub fn read_chunk_tree(fs: &Arc<FsInfo>) -> Result<()> {
    let sb = fs.superblock().clone();
    if sb.chunk_root() == 0 {
        return Ok(());
    }

    let mut pending = vec![(sb.chunk_root(), sb.chunk_root_generation())];
    let mut items: Vec<(Key, Vec<u8>)> = Vec::new();

    while let Some((bytenr, generation)) = pending.pop() {
        let eb = fs.read_tree_block(bytenr, Some(generation))?;
        if eb.is_leaf() {
            for slot in 0..eb.nritems() as usize {
                let key = eb.item_key(slot);
                if key.item_type == item_type::CHUNK_ITEM {
                    items.push((key, eb.item_data(slot)));
                }
            }
        } else {
            for slot in 0..eb.nritems() as usize {
                pending.push((eb.node_blockptr(slot), eb.node_ptr_generation(slot)));
            }
        }
    }

    let mut chunks = fs.chunks_mut();
    for (key, data) in items {
        let chunk = ChunkMapping::parse(&data, key.offset)?;
        // System chunks are already present from the bootstrap array.
        if chunks.lookup(chunk.logical).is_err() {
            chunks.insert(chunk)?;
        }
    }
    Ok(())
}

/// Picks the target size for a new chunk of `type_flags`
pub fn chunk_target_size(fs: &FsInfo, type_flags: u64) -> u64 {
    if type_flags & chunk_type::SYSTEM != 0 {
        SYSTEM_CHUNK_SIZE
    } else if type_flags & chunk_type::METADATA != 0 {
        METADATA_CHUNK_SIZE
    } else {
        let target = DATA_CHUNK_SIZE.min(fs.superblock().total_bytes() / 10);
        (target / STRIPE_LEN * STRIPE_LEN).max(STRIPE_LEN)
    }
}

/// Allocates a new chunk and records it in the chunk, device and extent
/// trees. Returns the mapping, already live for address translation.
pub fn alloc_chunk(trans: &Transaction, type_flags: u64) -> Result<ChunkMapping> {
    let fs = trans.fs();
    let devices = fs.devices();
    let profile = profile_info(type_flags);

    if devices.len() < profile.min_devices {
        return Err(FsError::NoSpace);
    }

    let target = chunk_target_size(fs, type_flags);
    let num_stripes = profile.copies.max(profile.min_devices);

    // Single-device layouts place every stripe on the one device; mirrored
    // multi-device layouts place one stripe per device.
    let mut stripes = Vec::new();
    let mut length = target;
    {
        let mut space = fs.space.write();
        'shrink: loop {
            stripes.clear();
            let mut per_device: BTreeMap<u64, usize> = BTreeMap::new();
            for i in 0..num_stripes {
                let device = &devices[i % devices.len()];
                *per_device.entry(device.devid).or_default() += 1;
            }
            for (devid, count) in per_device {
                for _ in 0..count {
                    match space.alloc_device_extent(devid, length, STRIPE_LEN) {
                        Some(physical) => {
                            let device = fs.device(devid)?;
                            stripes.push(Stripe {
                                devid,
                                offset: physical,
                                dev_uuid: device.uuid,
                            });
                        }
                        None => {
                            // Roll back this attempt and retry at half size.
                            for s in stripes.drain(..) {
                                space.release_device_extent(s.devid, s.offset, length);
                            }
                            length /= 2;
                            if length < MIN_CHUNK_SIZE.min(target) {
                                return Err(FsError::NoSpace);
                            }
                            continue 'shrink;
                        }
                    }
                }
            }
            break;
        }
    }

    let logical = fs.chunks().next_logical();
    let chunk = ChunkMapping {
        logical,
        length,
        stripe_len: STRIPE_LEN,
        type_flags,
        num_stripes: stripes.len() as u16,
        sub_stripes: if type_flags & chunk_type::RAID10 != 0 { 2 } else { 0 },
        stripes,
    };

    register_chunk(trans, &chunk)?;
    Ok(chunk)
}

/// Allocates a chunk at a fixed logical == physical placement.
///
/// The convert pipeline uses this for its 1:1 data chunks; the device range
/// must already be claimed by the caller.
pub fn alloc_chunk_identity(trans: &Transaction, type_flags: u64, start: u64, length: u64) -> Result<ChunkMapping> {
    let fs = trans.fs();
    let devices = fs.devices();
    let device = devices
        .first()
        .ok_or_else(|| FsError::Invariant("no devices".to_string()))?;

    for (res_start, res_len) in super::reserved_ranges() {
        if start < res_start + res_len && res_start < start + length {
            return Err(FsError::Invariant(format!(
                "identity chunk [{}, +{}) straddles a reserved range",
                start, length
            )));
        }
    }

    let chunk = ChunkMapping {
        logical: start,
        length,
        stripe_len: STRIPE_LEN,
        type_flags,
        num_stripes: 1,
        sub_stripes: 0,
        stripes: vec![Stripe {
            devid: device.devid,
            offset: start,
            dev_uuid: device.uuid,
        }],
    };

    register_chunk(trans, &chunk)?;
    Ok(chunk)
}

/// Inserts the chunk item, device extents and block group for a new chunk
fn register_chunk(trans: &Transaction, chunk: &ChunkMapping) -> Result<()> {
    let fs = trans.fs();

    fs.chunks_mut().insert(chunk.clone())?;

    let chunk_root = fs.chunk_root();
    let key = Key::new(objectid::FIRST_CHUNK_TREE, item_type::CHUNK_ITEM, chunk.logical);
    tree::insert_item(trans, &chunk_root, &key, &chunk.to_bytes(fs.sectorsize()))?;

    let dev_root = fs.read_root(objectid::DEV_TREE)?;
    let chunk_tree_uuid = fs.superblock().chunk_tree_uuid();
    for stripe in &chunk.stripes {
        let dev_extent = DevExtent {
            chunk_tree: objectid::CHUNK_TREE,
            chunk_objectid: objectid::FIRST_CHUNK_TREE,
            chunk_offset: chunk.logical,
            length: chunk.length,
            chunk_tree_uuid,
        };
        let key = Key::new(stripe.devid, item_type::DEV_EXTENT, stripe.offset);
        tree::insert_item(trans, &dev_root, &key, &dev_extent.to_bytes())?;
    }

    super::alloc::add_block_group(trans, chunk)?;
    trans.record_new_chunk(chunk.clone());

    tracing::debug!(
        logical = chunk.logical,
        length = chunk.length,
        type_flags = format_args!("{:#x}", chunk.type_flags),
        "allocated chunk"
    );
    Ok(())
}

/// Updates the device item in the chunk tree after allocations
pub fn update_device_item(trans: &Transaction, item: &DevItem) -> Result<()> {
    let fs = trans.fs();
    let chunk_root = fs.chunk_root();
    let key = Key::new(objectid::DEV_ITEMS, item_type::DEV_ITEM, item.devid);
    let mut path = tree::Path::new();
    let found = tree::search_slot(Some(trans), fs, &chunk_root, &key, 0, true, &mut path)?;
    if !found {
        let devid = item.devid;
        return Err(FsError::NotFound(format!("device item {}", devid)));
    }
    let leaf = path.leaf()?;
    leaf.set_item_payload(path.slots[0], &item.to_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::checksum::ChecksumType;

    fn mock_chunk(logical: u64, length: u64, type_flags: u64, stripes: Vec<Stripe>) -> ChunkMapping {
        ChunkMapping {
            logical,
            length,
            stripe_len: STRIPE_LEN,
            type_flags,
            num_stripes: stripes.len() as u16,
            sub_stripes: 0,
            stripes,
        }
    }

    fn single(devid: u64, offset: u64) -> Vec<Stripe> {
        vec![Stripe {
            devid,
            offset,
            dev_uuid: [0xAA; 16],
        }]
    }

    #[test]
    fn test_profile_table() {
        assert_eq!(profile_info(chunk_type::DATA).min_devices, 1);
        assert_eq!(profile_info(chunk_type::DUP).copies, 2);
        assert_eq!(profile_info(chunk_type::RAID0).min_devices, 2);
        assert_eq!(profile_info(chunk_type::RAID1).tolerance, 1);
        assert_eq!(profile_info(chunk_type::RAID1C3).min_devices, 3);
        assert_eq!(profile_info(chunk_type::RAID1C4).copies, 4);
        assert_eq!(profile_info(chunk_type::RAID10).min_devices, 4);
        assert_eq!(profile_info(chunk_type::RAID5).tolerance, 1);
        assert_eq!(profile_info(chunk_type::RAID6).tolerance, 2);
    }

    #[test]
    fn test_chunk_item_roundtrip() {
        let chunk = mock_chunk(
            0x100000,
            0x400000,
            chunk_type::SYSTEM,
            single(1, 0x100000),
        );
        let bytes = chunk.to_bytes(4096);
        assert_eq!(bytes.len(), chunk.item_size());

        let parsed = ChunkMapping::parse(&bytes, 0x100000).unwrap();
        assert_eq!(parsed, chunk);
    }

    #[test]
    fn test_parse_rejects_truncated_stripes() {
        let chunk = mock_chunk(0, 0x400000, chunk_type::DATA, single(1, 0x100000));
        let mut bytes = chunk.to_bytes(4096);
        // Claim five stripes with storage for one.
        LittleEndian::write_u16(&mut bytes[44..46], 5);
        assert!(ChunkMapping::parse(&bytes, 0).is_err());
    }

    #[test]
    fn test_parse_rejects_zero_stripes() {
        let chunk = mock_chunk(0, 0x400000, chunk_type::DATA, single(1, 0x100000));
        let mut bytes = chunk.to_bytes(4096);
        LittleEndian::write_u16(&mut bytes[44..46], 0);
        assert!(ChunkMapping::parse(&bytes, 0).is_err());
    }

    #[test]
    fn test_dev_extent_roundtrip() {
        let de = DevExtent {
            chunk_tree: objectid::CHUNK_TREE,
            chunk_objectid: objectid::FIRST_CHUNK_TREE,
            chunk_offset: 0x2000000,
            length: 0x800000,
            chunk_tree_uuid: [0x5A; 16],
        };
        let parsed = DevExtent::from_bytes(&de.to_bytes()).unwrap();
        assert_eq!(parsed, de);
    }

    #[test]
    fn test_map_insert_rejects_overlap() {
        let mut map = ChunkMap::new();
        map.insert(mock_chunk(0x100000, 0x400000, chunk_type::SYSTEM, single(1, 0x100000)))
            .unwrap();

        let overlapping = mock_chunk(0x200000, 0x400000, chunk_type::DATA, single(1, 0x900000));
        assert!(map.insert(overlapping).is_err());

        let adjacent = mock_chunk(0x500000, 0x400000, chunk_type::DATA, single(1, 0x900000));
        map.insert(adjacent).unwrap();
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_lookup_is_strict_about_start() {
        let mut map = ChunkMap::new();
        map.insert(mock_chunk(0x500000, 0x100000, chunk_type::DATA, single(1, 0x500000)))
            .unwrap();

        // Below the first chunk start: a miss, not the chunk above.
        assert!(map.lookup(0x400000).is_err());
        assert!(map.lookup(0x500000).is_ok());
        assert!(map.lookup(0x5FFFFF).is_ok());
        assert!(map.lookup(0x600000).is_err());
    }

    #[test]
    fn test_map_read_single() {
        let mut map = ChunkMap::new();
        map.insert(mock_chunk(0x1000000, 0x400000, chunk_type::DATA, single(1, 0x2000000)))
            .unwrap();

        let mirrors = map.map_read(0x1004000, 0x4000).unwrap();
        assert_eq!(mirrors.len(), 1);
        assert_eq!(mirrors[0].devid, 1);
        assert_eq!(mirrors[0].physical, 0x2004000);
    }

    #[test]
    fn test_map_read_dup_returns_both_copies() {
        let stripes = vec![
            Stripe { devid: 1, offset: 0x2000000, dev_uuid: [0; 16] },
            Stripe { devid: 1, offset: 0x3000000, dev_uuid: [0; 16] },
        ];
        let mut map = ChunkMap::new();
        map.insert(mock_chunk(
            0x1000000,
            0x400000,
            chunk_type::METADATA | chunk_type::DUP,
            stripes,
        ))
        .unwrap();

        let mirrors = map.map_read(0x1000000, 0x4000).unwrap();
        assert_eq!(mirrors.len(), 2);
        assert_eq!(mirrors[0].physical, 0x2000000);
        assert_eq!(mirrors[1].physical, 0x3000000);
    }

    #[test]
    fn test_map_read_raid0_striping() {
        let stripes = vec![
            Stripe { devid: 1, offset: 0x2000000, dev_uuid: [0; 16] },
            Stripe { devid: 2, offset: 0x5000000, dev_uuid: [0; 16] },
        ];
        let mut map = ChunkMap::new();
        map.insert(mock_chunk(
            0,
            0x400000,
            chunk_type::DATA | chunk_type::RAID0,
            stripes,
        ))
        .unwrap();

        // First stripe lands on device 1.
        let m = map.map_read(0, 0x4000).unwrap();
        assert_eq!(m[0].devid, 1);
        assert_eq!(m[0].physical, 0x2000000);

        // Second stripe unit lands on device 2.
        let m = map.map_read(STRIPE_LEN, 0x4000).unwrap();
        assert_eq!(m[0].devid, 2);
        assert_eq!(m[0].physical, 0x5000000);

        // Third wraps back to device 1, one stripe in.
        let m = map.map_read(2 * STRIPE_LEN, 0x4000).unwrap();
        assert_eq!(m[0].devid, 1);
        assert_eq!(m[0].physical, 0x2000000 + STRIPE_LEN);
    }

    #[test]
    fn test_map_read_rejects_chunk_straddle() {
        let mut map = ChunkMap::new();
        map.insert(mock_chunk(0, 0x400000, chunk_type::DATA, single(1, 0x1000000)))
            .unwrap();
        assert!(map.map_read(0x3FC000, 0x8000).is_err());
    }

    #[test]
    fn test_map_read_raid56_unsupported() {
        let stripes = vec![
            Stripe { devid: 1, offset: 0x2000000, dev_uuid: [0; 16] },
            Stripe { devid: 2, offset: 0x5000000, dev_uuid: [0; 16] },
        ];
        let mut map = ChunkMap::new();
        map.insert(mock_chunk(0, 0x400000, chunk_type::DATA | chunk_type::RAID5, stripes))
            .unwrap();
        match map.map_read(0, 0x4000) {
            Err(FsError::FeatureUnsupported(_)) => (),
            other => panic!("expected FeatureUnsupported, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_sys_array_roundtrip() {
        let mut map = ChunkMap::new();
        map.insert(mock_chunk(0x100000, 0x400000, chunk_type::SYSTEM, single(1, 0x100000)))
            .unwrap();
        map.insert(mock_chunk(0x500000, 0x800000, chunk_type::METADATA, single(1, 0x500000)))
            .unwrap();

        let array = map.build_sys_array(4096);
        let array = array.unwrap();

        let mut sb = Superblock::new_empty();
        sb.set_csum_type(ChecksumType::Crc32c);
        sb.set_sys_chunk_array(&array).unwrap();

        let restored = ChunkMap::from_sys_array(&sb).unwrap();
        // Only the SYSTEM chunk travels in the array.
        assert_eq!(restored.len(), 1);
        assert!(restored.lookup(0x100000).is_ok());
        assert!(restored.lookup(0x500000).is_err());
    }

    #[test]
    fn test_next_logical() {
        let mut map = ChunkMap::new();
        assert_eq!(map.next_logical(), super::super::RESERVED_1M);

        map.insert(mock_chunk(0x100000, 0x400000 + 0x1000, chunk_type::SYSTEM, single(1, 0x100000)))
            .unwrap();
        let next = map.next_logical();
        assert_eq!(next % STRIPE_LEN, 0);
        assert!(next >= 0x501000);
    }
}
