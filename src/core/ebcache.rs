//! Extent-buffer cache
//!
//! In-memory, reference-counted copies of tree blocks keyed by logical
//! bytenr. The cache exclusively owns each in-memory block; paths and
//! transactions pin extra references. A dirty flag marks blocks pending
//! write, an up-to-date flag marks verified reads.

use super::checksum;
use super::{FsError, FsInfo, Result};
use crate::blockdev;
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Size of a tree block header
pub const HEADER_SIZE: usize = 101;

/// Header field offsets
pub const HEADER_CSUM: usize = 0;
pub const HEADER_FSID: usize = 32;
pub const HEADER_BYTENR: usize = 48;
pub const HEADER_FLAGS: usize = 56;
pub const HEADER_CHUNK_TREE_UUID: usize = 64;
pub const HEADER_GENERATION: usize = 80;
pub const HEADER_OWNER: usize = 88;
pub const HEADER_NRITEMS: usize = 96;
pub const HEADER_LEVEL: usize = 100;

/// Header flag: block has been written out
pub const HEADER_FLAG_WRITTEN: u64 = 1 << 0;
/// Backref revision stored in the top byte of the flags field
pub const BACKREF_REV_MIXED: u8 = 2;

const FLAG_UPTODATE: u8 = 1 << 0;
const FLAG_DIRTY: u8 = 1 << 1;

/// One cached tree block
pub struct ExtentBuffer {
    bytenr: u64,
    data: RwLock<Vec<u8>>,
    flags: AtomicU8,
}

impl ExtentBuffer {
    /// A zeroed buffer, not yet up to date
    pub fn new(bytenr: u64, size: usize) -> Self {
        Self {
            bytenr,
            data: RwLock::new(vec![0u8; size]),
            flags: AtomicU8::new(0),
        }
    }

    /// Wraps bytes already read or built elsewhere
    pub fn from_bytes(bytenr: u64, data: Vec<u8>) -> Self {
        Self {
            bytenr,
            data: RwLock::new(data),
            flags: AtomicU8::new(0),
        }
    }

    pub fn bytenr(&self) -> u64 {
        self.bytenr
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` over the block bytes
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.read())
    }

    /// Runs `f` over the mutable block bytes
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.write())
    }

    pub fn copy_to_vec(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        let data = self.data.read();
        out.copy_from_slice(&data[offset..offset + out.len()]);
    }

    pub fn write_bytes(&self, offset: usize, src: &[u8]) {
        let mut data = self.data.write();
        data[offset..offset + src.len()].copy_from_slice(src);
    }

    pub fn get_u8(&self, offset: usize) -> u8 {
        self.data.read()[offset]
    }

    pub fn set_u8(&self, offset: usize, v: u8) {
        self.data.write()[offset] = v;
    }

    pub fn get_u16(&self, offset: usize) -> u16 {
        LittleEndian::read_u16(&self.data.read()[offset..offset + 2])
    }

    pub fn set_u16(&self, offset: usize, v: u16) {
        LittleEndian::write_u16(&mut self.data.write()[offset..offset + 2], v)
    }

    pub fn get_u32(&self, offset: usize) -> u32 {
        LittleEndian::read_u32(&self.data.read()[offset..offset + 4])
    }

    pub fn set_u32(&self, offset: usize, v: u32) {
        LittleEndian::write_u32(&mut self.data.write()[offset..offset + 4], v)
    }

    pub fn get_u64(&self, offset: usize) -> u64 {
        LittleEndian::read_u64(&self.data.read()[offset..offset + 8])
    }

    pub fn set_u64(&self, offset: usize, v: u64) {
        LittleEndian::write_u64(&mut self.data.write()[offset..offset + 8], v)
    }

    // Header accessors

    /// Logical address recorded in the header (verified against the cache key)
    pub fn header_bytenr(&self) -> u64 {
        self.get_u64(HEADER_BYTENR)
    }

    pub fn set_header_bytenr(&self, bytenr: u64) {
        self.set_u64(HEADER_BYTENR, bytenr)
    }

    pub fn generation(&self) -> u64 {
        self.get_u64(HEADER_GENERATION)
    }

    pub fn set_generation(&self, generation: u64) {
        self.set_u64(HEADER_GENERATION, generation)
    }

    pub fn owner(&self) -> u64 {
        self.get_u64(HEADER_OWNER)
    }

    pub fn set_owner(&self, owner: u64) {
        self.set_u64(HEADER_OWNER, owner)
    }

    pub fn nritems(&self) -> u32 {
        self.get_u32(HEADER_NRITEMS)
    }

    pub fn set_nritems(&self, nritems: u32) {
        self.set_u32(HEADER_NRITEMS, nritems)
    }

    pub fn level(&self) -> u8 {
        self.get_u8(HEADER_LEVEL)
    }

    pub fn set_level(&self, level: u8) {
        self.set_u8(HEADER_LEVEL, level)
    }

    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    pub fn header_flags(&self) -> u64 {
        self.get_u64(HEADER_FLAGS) & 0x00FF_FFFF_FFFF_FFFF
    }

    pub fn set_header_flags(&self, flags: u64) {
        let rev = self.get_u8(HEADER_FLAGS + 7);
        self.set_u64(HEADER_FLAGS, flags & 0x00FF_FFFF_FFFF_FFFF);
        self.set_u8(HEADER_FLAGS + 7, rev);
    }

    pub fn backref_rev(&self) -> u8 {
        self.get_u8(HEADER_FLAGS + 7)
    }

    pub fn set_backref_rev(&self, rev: u8) {
        self.set_u8(HEADER_FLAGS + 7, rev)
    }

    pub fn fsid(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        self.read_bytes(HEADER_FSID, &mut out);
        out
    }

    pub fn set_fsid(&self, fsid: &[u8; 16]) {
        self.write_bytes(HEADER_FSID, fsid)
    }

    pub fn chunk_tree_uuid(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        self.read_bytes(HEADER_CHUNK_TREE_UUID, &mut out);
        out
    }

    pub fn set_chunk_tree_uuid(&self, uuid: &[u8; 16]) {
        self.write_bytes(HEADER_CHUNK_TREE_UUID, uuid)
    }

    // State flags

    pub fn is_uptodate(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & FLAG_UPTODATE != 0
    }

    pub fn set_uptodate(&self) {
        self.flags.fetch_or(FLAG_UPTODATE, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & FLAG_DIRTY != 0
    }

    pub fn mark_dirty(&self) {
        self.flags.fetch_or(FLAG_DIRTY, Ordering::SeqCst);
    }

    pub fn clear_dirty(&self) {
        self.flags.fetch_and(!FLAG_DIRTY, Ordering::SeqCst);
    }
}

/// The cache proper
pub struct EbCache {
    map: RwLock<HashMap<u64, Arc<ExtentBuffer>>>,
}

impl EbCache {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, bytenr: u64) -> Option<Arc<ExtentBuffer>> {
        self.map.read().get(&bytenr).cloned()
    }

    pub fn insert(&self, eb: Arc<ExtentBuffer>) {
        self.map.write().insert(eb.bytenr(), eb);
    }

    pub fn remove(&self, bytenr: u64) {
        self.map.write().remove(&bytenr);
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl Default for EbCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads and verifies one physical copy of a tree block
fn read_one_copy(
    fs: &FsInfo,
    bytenr: u64,
    devid: u64,
    physical: u64,
    parent_gen: Option<u64>,
) -> Result<Vec<u8>> {
    let device = fs.device(devid)?;
    let mut buf = vec![0u8; fs.nodesize() as usize];
    blockdev::read_exact_at(device.dev.as_ref(), physical, &mut buf)?;

    checksum::verify_block_csum(fs.csum_type(), &buf, bytenr)?;

    let stored_bytenr = LittleEndian::read_u64(&buf[HEADER_BYTENR..HEADER_BYTENR + 8]);
    if stored_bytenr != bytenr {
        return Err(FsError::CorruptRead(format!(
            "tree block at bytenr {} claims bytenr {}",
            bytenr, stored_bytenr
        )));
    }

    if buf[HEADER_FSID..HEADER_FSID + 16] != fs.fsid() {
        return Err(FsError::CorruptRead(format!(
            "tree block at bytenr {} belongs to a different filesystem",
            bytenr
        )));
    }

    let generation = LittleEndian::read_u64(&buf[HEADER_GENERATION..HEADER_GENERATION + 8]);
    if let Some(expected) = parent_gen {
        if generation != expected {
            return Err(FsError::CorruptRead(format!(
                "tree block at bytenr {} has generation {}, parent expects {}",
                bytenr, generation, expected
            )));
        }
    }

    let level = buf[HEADER_LEVEL];
    if level as usize >= super::MAX_LEVEL {
        return Err(FsError::CorruptRead(format!(
            "tree block at bytenr {} has level {}",
            bytenr, level
        )));
    }

    Ok(buf)
}

/// Reads a tree block through the cache with mirror fallback.
///
/// `CorruptRead` propagates only when every mirror disagrees with the
/// expected checksum or header identity.
pub fn read_tree_block(
    fs: &FsInfo,
    bytenr: u64,
    parent_gen: Option<u64>,
) -> Result<Arc<ExtentBuffer>> {
    if bytenr % fs.sectorsize() as u64 != 0 {
        return Err(FsError::CorruptRead(format!(
            "unaligned tree block bytenr {}",
            bytenr
        )));
    }

    if let Some(eb) = fs.cache.get(bytenr) {
        if eb.is_uptodate() {
            if let Some(expected) = parent_gen {
                let generation = eb.generation();
                if generation != expected {
                    return Err(FsError::CorruptRead(format!(
                        "cached tree block at bytenr {} has generation {}, parent expects {}",
                        bytenr, generation, expected
                    )));
                }
            }
            return Ok(eb);
        }
    }

    let mirrors = fs
        .chunks()
        .map_read(bytenr, fs.nodesize() as u64)?;

    let mut last_err = None;
    for mirror in &mirrors {
        match read_one_copy(fs, bytenr, mirror.devid, mirror.physical, parent_gen) {
            Ok(buf) => {
                let eb = Arc::new(ExtentBuffer::from_bytes(bytenr, buf));
                eb.set_uptodate();
                fs.cache.insert(eb.clone());
                return Ok(eb);
            }
            Err(e) => {
                if mirrors.len() > 1 {
                    tracing::warn!(bytenr, devid = mirror.devid, "mirror read failed: {}", e);
                }
                last_err = Some(e);
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| FsError::CorruptRead(format!("no mirrors for bytenr {}", bytenr))))
}

/// Checksums a tree block and writes it to every mirror
pub fn write_tree_block(fs: &FsInfo, eb: &ExtentBuffer) -> Result<()> {
    let stripes = fs.chunks().map_write(eb.bytenr(), fs.nodesize() as u64)?;

    let bytes = {
        let mut data = eb.copy_to_vec();
        checksum::stamp_block_csum(fs.csum_type(), &mut data);
        // Keep the in-memory copy identical to what lands on disk.
        eb.write_bytes(0, &data[..checksum::CSUM_AREA_SIZE]);
        data
    };

    for stripe in &stripes {
        let device = fs.device(stripe.devid)?;
        blockdev::write_all_at(device.dev.as_ref(), stripe.physical, &bytes)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_accessors() {
        let eb = ExtentBuffer::new(0x400000, 16384);
        eb.set_header_bytenr(0x400000);
        eb.set_generation(7);
        eb.set_owner(5);
        eb.set_nritems(3);
        eb.set_level(1);
        eb.set_backref_rev(BACKREF_REV_MIXED);
        eb.set_header_flags(HEADER_FLAG_WRITTEN);

        assert_eq!(eb.header_bytenr(), 0x400000);
        assert_eq!(eb.generation(), 7);
        assert_eq!(eb.owner(), 5);
        assert_eq!(eb.nritems(), 3);
        assert_eq!(eb.level(), 1);
        assert!(!eb.is_leaf());
        assert_eq!(eb.header_flags(), HEADER_FLAG_WRITTEN);
        // Flag writes must not clobber the backref revision byte.
        assert_eq!(eb.backref_rev(), BACKREF_REV_MIXED);
    }

    #[test]
    fn test_uuid_fields() {
        let eb = ExtentBuffer::new(0, 4096);
        let fsid = [3u8; 16];
        let ct = [5u8; 16];
        eb.set_fsid(&fsid);
        eb.set_chunk_tree_uuid(&ct);
        assert_eq!(eb.fsid(), fsid);
        assert_eq!(eb.chunk_tree_uuid(), ct);
    }

    #[test]
    fn test_dirty_and_uptodate_flags() {
        let eb = ExtentBuffer::new(0, 4096);
        assert!(!eb.is_dirty());
        assert!(!eb.is_uptodate());

        eb.mark_dirty();
        eb.set_uptodate();
        assert!(eb.is_dirty());
        assert!(eb.is_uptodate());

        eb.clear_dirty();
        assert!(!eb.is_dirty());
        assert!(eb.is_uptodate());
    }

    #[test]
    fn test_cache_insert_get_remove() {
        let cache = EbCache::new();
        assert!(cache.is_empty());

        let eb = Arc::new(ExtentBuffer::new(0x100000, 4096));
        cache.insert(eb.clone());
        assert_eq!(cache.len(), 1);

        let hit = cache.get(0x100000).unwrap();
        assert_eq!(hit.bytenr(), 0x100000);
        assert!(cache.get(0x200000).is_none());

        cache.remove(0x100000);
        assert!(cache.get(0x100000).is_none());
    }

    #[test]
    fn test_typed_accessors() {
        let eb = ExtentBuffer::new(0, 256);
        eb.set_u16(10, 0xBEEF);
        eb.set_u32(12, 0xDEAD_BEEF);
        eb.set_u64(16, 0x0123_4567_89AB_CDEF);
        assert_eq!(eb.get_u16(10), 0xBEEF);
        assert_eq!(eb.get_u32(12), 0xDEAD_BEEF);
        assert_eq!(eb.get_u64(16), 0x0123_4567_89AB_CDEF);
    }
}
