//! Superblock parsing, construction and the mirrored write discipline
//!
//! The primary superblock is located at offset 0x10000 (64 KiB) with mirrors
//! at 0x4000000 (64 MiB) and 0x4000000000 (256 GiB). Mirrors outside the
//! device are skipped. On read, the highest-generation valid copy wins; on
//! write, secondaries go out first and the primary last, so a torn commit
//! always leaves recoverable copies behind.

use super::checksum::{self, ChecksumType};
use super::{FsError, Result, MAGIC, SUPER_INFO_OFFSET, SUPER_INFO_SIZE};
use crate::blockdev::{self, BlockDevice};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

/// Number of superblock copies, primary included
pub const SUPER_MIRROR_MAX: usize = 3;

/// Size of the embedded system chunk array
pub const SYS_CHUNK_ARRAY_SIZE: usize = 0x800;

/// Byte offset of each super copy; index 0 is the primary
pub fn super_offset(mirror: usize) -> u64 {
    match mirror {
        0 => SUPER_INFO_OFFSET,
        1 => super::SUPER_MIRROR1_OFFSET,
        2 => super::SUPER_MIRROR2_OFFSET,
        _ => unreachable!("mirror index out of range"),
    }
}

/// On-disk superblock layout
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct SuperblockRaw {
    /// Checksum of everything from offset 0x20 to 0x1000
    pub csum: [u8; 32],
    /// Filesystem UUID
    pub fsid: [u8; 16],
    /// Physical address of this copy
    pub bytenr: u64,
    /// Flags
    pub flags: u64,
    /// Magic number: `_BHRfS_M`
    pub magic: [u8; 8],
    /// Generation number
    pub generation: u64,
    /// Logical address of the root tree root
    pub root: u64,
    /// Logical address of the chunk tree root
    pub chunk_root: u64,
    /// Logical address of the log tree root
    pub log_root: u64,
    /// Log root transaction ID
    pub log_root_transid: u64,
    /// Total bytes in filesystem
    pub total_bytes: u64,
    /// Bytes used
    pub bytes_used: u64,
    /// Root directory object ID
    pub root_dir_objectid: u64,
    /// Number of devices
    pub num_devices: u64,
    /// Sector size
    pub sector_size: u32,
    /// Node size
    pub node_size: u32,
    /// Leaf size (legacy, same as node_size)
    pub leaf_size: u32,
    /// Stripe size
    pub stripe_size: u32,
    /// Used bytes of sys_chunk_array
    pub sys_chunk_array_size: u32,
    /// Chunk root generation
    pub chunk_root_generation: u64,
    /// Compatible feature flags
    pub compat_flags: u64,
    /// Compatible read-only feature flags
    pub compat_ro_flags: u64,
    /// Incompatible feature flags
    pub incompat_flags: u64,
    /// Checksum type
    pub csum_type: u16,
    /// Root level
    pub root_level: u8,
    /// Chunk root level
    pub chunk_root_level: u8,
    /// Log root level
    pub log_root_level: u8,
    /// Device item for this device
    pub dev_item: [u8; 0x62],
    /// Label (up to 256 bytes, NUL padded)
    pub label: [u8; 256],
    /// Cache generation
    pub cache_generation: u64,
    /// UUID tree generation
    pub uuid_tree_generation: u64,
    /// Reserved for future expansion
    pub reserved: [u8; 0xF0],
    /// System chunk array (bootstrap chunks)
    pub sys_chunk_array: [u8; SYS_CHUNK_ARRAY_SIZE],
    /// Root backups
    pub super_roots: [u8; 0x2A0],
    /// Unused
    pub unused: [u8; 0x235],
}

/// Device item (as embedded in the superblock and the chunk tree), laid
/// out field for field as it is on disk
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable,
)]
#[repr(C, packed)]
pub struct DevItem {
    pub devid: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub io_align: u32,
    pub io_width: u32,
    pub sector_size: u32,
    pub dev_type: u64,
    pub generation: u64,
    pub start_offset: u64,
    pub dev_group: u32,
    pub seek_speed: u8,
    pub bandwidth: u8,
    pub uuid: [u8; 16],
    pub fsid: [u8; 16],
}

/// Serialised size of a device item
pub const DEV_ITEM_SIZE: usize = 0x62;

impl DevItem {
    /// Parses a device item from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < DEV_ITEM_SIZE {
            return Err(FsError::CorruptRead("device item too small".to_string()));
        }
        Self::read_from_bytes(&data[..DEV_ITEM_SIZE])
            .map_err(|_| FsError::CorruptRead("device item layout mismatch".to_string()))
    }

    /// Serialises the device item
    pub fn to_bytes(&self) -> [u8; DEV_ITEM_SIZE] {
        zerocopy::transmute!(*self)
    }
}

/// In-memory superblock with accessors over the raw layout
#[derive(Clone)]
pub struct Superblock {
    raw: SuperblockRaw,
}

impl Superblock {
    /// A zeroed superblock carrying only the magic; mkfs fills the rest
    pub fn new_empty() -> Self {
        let mut raw = SuperblockRaw::new_zeroed();
        raw.magic = MAGIC;
        Self { raw }
    }

    /// Parses a superblock copy read from `bytenr`, verifying magic,
    /// checksum and the stored bytenr.
    pub fn parse(data: &[u8], bytenr: u64) -> Result<Self> {
        if data.len() < SUPER_INFO_SIZE {
            return Err(FsError::CorruptRead(format!(
                "superblock too small: {} bytes",
                data.len()
            )));
        }

        let raw = SuperblockRaw::read_from_bytes(&data[..SUPER_INFO_SIZE])
            .map_err(|_| FsError::CorruptRead("failed to parse superblock".to_string()))?;

        if raw.magic != MAGIC {
            return Err(FsError::CorruptRead(format!(
                "bad superblock magic at bytenr {}",
                bytenr
            )));
        }

        let csum_type = ChecksumType::from_disk({ raw.csum_type })?;
        checksum::verify_block_csum(csum_type, &data[..SUPER_INFO_SIZE], bytenr)?;

        if { raw.bytenr } != bytenr {
            return Err(FsError::CorruptRead(format!(
                "superblock bytenr {} does not match read offset {}",
                { raw.bytenr },
                bytenr
            )));
        }

        Ok(Self { raw })
    }

    /// Reads one specific super copy
    pub fn read_one(device: &dyn BlockDevice, bytenr: u64) -> Result<Self> {
        let mut buf = vec![0u8; SUPER_INFO_SIZE];
        blockdev::read_exact_at(device, bytenr, &mut buf)?;
        Self::parse(&buf, bytenr)
    }

    /// Reads the super the filesystem's state is defined by: the primary
    /// when it is valid, otherwise the best surviving mirror. A commit is
    /// complete exactly when its primary is durable, so mirrors must not
    /// outvote an older but valid primary.
    pub fn read_primary_or_best(device: &dyn BlockDevice) -> Result<Self> {
        match Self::read_one(device, SUPER_INFO_OFFSET) {
            Ok(sb) => Ok(sb),
            Err(primary_err) => {
                tracing::warn!("primary superblock unusable: {}", primary_err);
                Self::read_best(device)
            }
        }
    }

    /// Reads all super copies that fit the device and returns the one with
    /// the highest generation.
    pub fn read_best(device: &dyn BlockDevice) -> Result<Self> {
        let mut best: Option<Self> = None;
        let mut last_err = None;

        for mirror in 0..SUPER_MIRROR_MAX {
            let offset = super_offset(mirror);
            if offset + SUPER_INFO_SIZE as u64 > device.size() {
                continue;
            }
            match Self::read_one(device, offset) {
                Ok(sb) => {
                    let better = match &best {
                        Some(b) => sb.generation() > b.generation(),
                        None => true,
                    };
                    if better {
                        best = Some(sb);
                    }
                }
                Err(e) => {
                    tracing::warn!(mirror, "unreadable superblock copy: {}", e);
                    last_err = Some(e);
                }
            }
        }

        best.ok_or_else(|| {
            last_err.unwrap_or_else(|| FsError::CorruptRead("no valid superblock".to_string()))
        })
    }

    /// Serialises this super for one copy: stamps the copy's bytenr and
    /// recomputes the checksum.
    pub fn serialize_for(&self, bytenr: u64) -> Result<Vec<u8>> {
        let mut copy = self.raw;
        copy.bytenr = bytenr;
        let mut out = copy.as_bytes().to_vec();
        let csum_type = ChecksumType::from_disk({ self.raw.csum_type })?;
        checksum::stamp_block_csum(csum_type, &mut out);
        Ok(out)
    }

    /// Rejects filesystems carrying incompat bits this implementation does
    /// not understand.
    pub fn check_features(&self) -> Result<()> {
        let unknown = self.incompat_flags() & !incompat::SUPPORTED;
        if unknown != 0 {
            return Err(FsError::FeatureUnsupported(format!(
                "unknown incompat feature bits: {:#x}",
                unknown
            )));
        }
        Ok(())
    }

    pub fn fsid(&self) -> [u8; 16] {
        self.raw.fsid
    }

    pub fn set_fsid(&mut self, fsid: [u8; 16]) {
        self.raw.fsid = fsid;
    }

    pub fn label(&self) -> &str {
        let label = &self.raw.label;
        let end = label.iter().position(|&b| b == 0).unwrap_or(label.len());
        std::str::from_utf8(&label[..end]).unwrap_or("")
    }

    pub fn set_label(&mut self, label: &str) {
        self.raw.label = [0u8; 256];
        let bytes = label.as_bytes();
        let len = bytes.len().min(255);
        self.raw.label[..len].copy_from_slice(&bytes[..len]);
    }

    pub fn generation(&self) -> u64 {
        self.raw.generation
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.raw.generation = generation;
    }

    pub fn flags(&self) -> u64 {
        self.raw.flags
    }

    pub fn set_flags(&mut self, flags: u64) {
        self.raw.flags = flags;
    }

    pub fn root(&self) -> u64 {
        self.raw.root
    }

    pub fn root_level(&self) -> u8 {
        self.raw.root_level
    }

    pub fn set_root(&mut self, bytenr: u64, level: u8) {
        self.raw.root = bytenr;
        self.raw.root_level = level;
    }

    pub fn chunk_root(&self) -> u64 {
        self.raw.chunk_root
    }

    pub fn chunk_root_level(&self) -> u8 {
        self.raw.chunk_root_level
    }

    pub fn chunk_root_generation(&self) -> u64 {
        self.raw.chunk_root_generation
    }

    pub fn set_chunk_root(&mut self, bytenr: u64, level: u8, generation: u64) {
        self.raw.chunk_root = bytenr;
        self.raw.chunk_root_level = level;
        self.raw.chunk_root_generation = generation;
    }

    pub fn log_root(&self) -> u64 {
        self.raw.log_root
    }

    pub fn total_bytes(&self) -> u64 {
        self.raw.total_bytes
    }

    pub fn set_total_bytes(&mut self, total: u64) {
        self.raw.total_bytes = total;
    }

    pub fn bytes_used(&self) -> u64 {
        self.raw.bytes_used
    }

    pub fn set_bytes_used(&mut self, used: u64) {
        self.raw.bytes_used = used;
    }

    pub fn root_dir_objectid(&self) -> u64 {
        self.raw.root_dir_objectid
    }

    pub fn set_root_dir_objectid(&mut self, objectid: u64) {
        self.raw.root_dir_objectid = objectid;
    }

    pub fn num_devices(&self) -> u64 {
        self.raw.num_devices
    }

    pub fn set_num_devices(&mut self, n: u64) {
        self.raw.num_devices = n;
    }

    pub fn sector_size(&self) -> u32 {
        self.raw.sector_size
    }

    pub fn node_size(&self) -> u32 {
        self.raw.node_size
    }

    pub fn set_sizes(&mut self, sectorsize: u32, nodesize: u32, stripesize: u32) {
        self.raw.sector_size = sectorsize;
        self.raw.node_size = nodesize;
        self.raw.leaf_size = nodesize;
        self.raw.stripe_size = stripesize;
    }

    pub fn csum_type(&self) -> u16 {
        self.raw.csum_type
    }

    pub fn set_csum_type(&mut self, csum_type: ChecksumType) {
        self.raw.csum_type = csum_type.to_disk();
    }

    pub fn compat_flags(&self) -> u64 {
        self.raw.compat_flags
    }

    pub fn compat_ro_flags(&self) -> u64 {
        self.raw.compat_ro_flags
    }

    pub fn incompat_flags(&self) -> u64 {
        self.raw.incompat_flags
    }

    pub fn set_incompat_flags(&mut self, flags: u64) {
        self.raw.incompat_flags = flags;
    }

    pub fn chunk_tree_uuid(&self) -> [u8; 16] {
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&self.raw.reserved[0..16]);
        uuid
    }

    pub fn set_chunk_tree_uuid(&mut self, uuid: [u8; 16]) {
        self.raw.reserved[0..16].copy_from_slice(&uuid);
    }

    pub fn dev_item(&self) -> DevItem {
        DevItem::from_bytes(&self.raw.dev_item).unwrap_or_default()
    }

    pub fn set_dev_item(&mut self, item: &DevItem) {
        self.raw.dev_item = item.to_bytes();
    }

    pub fn sys_chunk_array(&self) -> &[u8] {
        let len = (self.raw.sys_chunk_array_size as usize).min(SYS_CHUNK_ARRAY_SIZE);
        &self.raw.sys_chunk_array[..len]
    }

    pub fn set_sys_chunk_array(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > SYS_CHUNK_ARRAY_SIZE {
            return Err(FsError::Invariant(format!(
                "system chunk array overflow: {} bytes",
                data.len()
            )));
        }
        self.raw.sys_chunk_array = [0u8; SYS_CHUNK_ARRAY_SIZE];
        self.raw.sys_chunk_array[..data.len()].copy_from_slice(data);
        self.raw.sys_chunk_array_size = data.len() as u32;
        Ok(())
    }
}

/// Writes every superblock copy on every device.
///
/// Secondary mirrors first, a barrier, then the primary, then a final
/// barrier: the presence of a valid primary implies the commit completed.
/// When `primary_bytenr` is not the canonical offset (convert bootstrap),
/// only that temporary copy is written; the canonical set appears at
/// migration time.
pub fn write_all_supers(
    devices: &[std::sync::Arc<super::Device>],
    sb: &Superblock,
    primary_bytenr: u64,
) -> Result<()> {
    if primary_bytenr != SUPER_INFO_OFFSET {
        for device in devices {
            let buf = sb.serialize_for(primary_bytenr)?;
            blockdev::write_all_at(device.dev.as_ref(), primary_bytenr, &buf)?;
            device.dev.sync_device()?;
        }
        return Ok(());
    }

    for device in devices {
        for mirror in 1..SUPER_MIRROR_MAX {
            let offset = super_offset(mirror);
            if offset + SUPER_INFO_SIZE as u64 > device.dev.size() {
                continue;
            }
            let buf = sb.serialize_for(offset)?;
            blockdev::write_all_at(device.dev.as_ref(), offset, &buf)?;
        }
        device.dev.sync_device()?;

        let buf = sb.serialize_for(SUPER_INFO_OFFSET)?;
        blockdev::write_all_at(device.dev.as_ref(), SUPER_INFO_OFFSET, &buf)?;
        device.dev.sync_device()?;
    }
    Ok(())
}

/// Incompatible feature flags
pub mod incompat {
    pub const MIXED_BACKREF: u64 = 1 << 0;
    pub const DEFAULT_SUBVOL: u64 = 1 << 1;
    pub const MIXED_GROUPS: u64 = 1 << 2;
    pub const COMPRESS_LZO: u64 = 1 << 3;
    pub const COMPRESS_ZSTD: u64 = 1 << 4;
    pub const BIG_METADATA: u64 = 1 << 5;
    pub const EXTENDED_IREF: u64 = 1 << 6;
    pub const RAID56: u64 = 1 << 7;
    pub const SKINNY_METADATA: u64 = 1 << 8;
    pub const NO_HOLES: u64 = 1 << 9;
    pub const METADATA_UUID: u64 = 1 << 10;
    pub const RAID1C34: u64 = 1 << 11;

    /// Bits this implementation understands
    pub const SUPPORTED: u64 = MIXED_BACKREF
        | DEFAULT_SUBVOL
        | MIXED_GROUPS
        | COMPRESS_LZO
        | COMPRESS_ZSTD
        | BIG_METADATA
        | EXTENDED_IREF
        | RAID56
        | SKINNY_METADATA
        | NO_HOLES
        | METADATA_UUID
        | RAID1C34;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::ImageFile;

    #[test]
    fn test_superblock_raw_size() {
        assert_eq!(std::mem::size_of::<SuperblockRaw>(), SUPER_INFO_SIZE);
    }

    #[test]
    fn test_dev_item_size() {
        assert_eq!(DEV_ITEM_SIZE, 0x62);
        assert_eq!(std::mem::size_of::<DevItem>(), DEV_ITEM_SIZE);
    }

    #[test]
    fn test_dev_item_roundtrip() {
        let item = DevItem {
            devid: 1,
            total_bytes: 1 << 30,
            bytes_used: 1 << 20,
            io_align: 4096,
            io_width: 4096,
            sector_size: 4096,
            uuid: [7u8; 16],
            fsid: [9u8; 16],
            ..Default::default()
        };
        let bytes = item.to_bytes();
        // uuid at 66, fsid at 82, per the documented layout.
        assert_eq!(&bytes[0..8], &1u64.to_le_bytes());
        assert_eq!(&bytes[66..82], &[7u8; 16]);
        let parsed = DevItem::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, item);
    }

    fn build_super(generation: u64) -> Superblock {
        let mut sb = Superblock::new_empty();
        sb.set_csum_type(ChecksumType::Crc32c);
        sb.set_generation(generation);
        sb.set_sizes(4096, 16384, 65536);
        sb.set_total_bytes(256 * 1024 * 1024);
        sb.set_num_devices(1);
        sb.set_label("testvol");
        sb
    }

    #[test]
    fn test_parse_roundtrip() {
        let sb = build_super(42);
        let buf = sb.serialize_for(SUPER_INFO_OFFSET).unwrap();
        let parsed = Superblock::parse(&buf, SUPER_INFO_OFFSET).unwrap();
        assert_eq!(parsed.generation(), 42);
        assert_eq!(parsed.node_size(), 16384);
        assert_eq!(parsed.label(), "testvol");
    }

    #[test]
    fn test_parse_rejects_wrong_bytenr() {
        let sb = build_super(1);
        let buf = sb.serialize_for(SUPER_INFO_OFFSET).unwrap();
        // Valid csum, but claims to live at the primary offset.
        assert!(Superblock::parse(&buf, super_offset(1)).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let sb = build_super(1);
        let mut buf = sb.serialize_for(SUPER_INFO_OFFSET).unwrap();
        buf[0x40] = b'X';
        assert!(Superblock::parse(&buf, SUPER_INFO_OFFSET).is_err());
    }

    #[test]
    fn test_parse_rejects_bit_flip() {
        let sb = build_super(1);
        let mut buf = sb.serialize_for(SUPER_INFO_OFFSET).unwrap();
        buf[0x200] ^= 1;
        assert!(Superblock::parse(&buf, SUPER_INFO_OFFSET).is_err());
    }

    #[test]
    fn test_check_features() {
        let mut sb = build_super(1);
        sb.set_incompat_flags(incompat::SKINNY_METADATA | incompat::NO_HOLES);
        assert!(sb.check_features().is_ok());

        sb.set_incompat_flags(1 << 40);
        match sb.check_features() {
            Err(FsError::FeatureUnsupported(_)) => (),
            _ => panic!("expected FeatureUnsupported"),
        }
    }

    #[test]
    fn test_read_best_prefers_highest_generation() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        // Large enough for the primary and the 64 MiB mirror.
        let dev = ImageFile::create(temp.path(), 65 * 1024 * 1024).unwrap();

        let old = build_super(5);
        let newer = build_super(9);
        blockdev::write_all_at(
            &dev,
            SUPER_INFO_OFFSET,
            &old.serialize_for(SUPER_INFO_OFFSET).unwrap(),
        )
        .unwrap();
        blockdev::write_all_at(
            &dev,
            super_offset(1),
            &newer.serialize_for(super_offset(1)).unwrap(),
        )
        .unwrap();

        let best = Superblock::read_best(&dev).unwrap();
        assert_eq!(best.generation(), 9);
    }

    #[test]
    fn test_sys_chunk_array_bounds() {
        let mut sb = build_super(1);
        assert!(sb.set_sys_chunk_array(&[0u8; SYS_CHUNK_ARRAY_SIZE + 1]).is_err());
        sb.set_sys_chunk_array(&[1u8; 80]).unwrap();
        assert_eq!(sb.sys_chunk_array().len(), 80);
    }
}
