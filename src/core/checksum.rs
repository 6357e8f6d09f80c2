//! Checksum dispatch
//!
//! The superblock selects one of four algorithms; the first N bytes of every
//! tree block and superblock hold the digest, zero-padded to 32 bytes. Bytes
//! `[0x20..]` of the block feed the algorithm.

use super::{FsError, Result};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use sha2::Sha256;

/// Size of the on-disk checksum area
pub const CSUM_AREA_SIZE: usize = 32;

/// Offset at which checksummed content starts
pub const CSUM_CONTENT_OFFSET: usize = 0x20;

/// Checksum algorithms selectable in the superblock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumType {
    /// CRC32c (Castagnoli)
    Crc32c,
    /// XXHash64
    XxHash64,
    /// SHA-256
    Sha256,
    /// BLAKE2b-256
    Blake2b,
}

impl ChecksumType {
    /// Decodes the superblock `csum_type` field
    #[inline]
    pub fn from_disk(csum_type: u16) -> Result<Self> {
        match csum_type {
            0 => Ok(Self::Crc32c),
            1 => Ok(Self::XxHash64),
            2 => Ok(Self::Sha256),
            3 => Ok(Self::Blake2b),
            _ => Err(FsError::FeatureUnsupported(format!(
                "unknown checksum type: {}",
                csum_type
            ))),
        }
    }

    /// On-disk value for this algorithm
    #[inline]
    pub const fn to_disk(self) -> u16 {
        match self {
            Self::Crc32c => 0,
            Self::XxHash64 => 1,
            Self::Sha256 => 2,
            Self::Blake2b => 3,
        }
    }

    /// Digest size in bytes; the remainder of the 32-byte area is zero
    #[inline]
    pub const fn size(&self) -> usize {
        match self {
            Self::Crc32c => 4,
            Self::XxHash64 => 8,
            Self::Sha256 => 32,
            Self::Blake2b => 32,
        }
    }

    /// Computes the digest of `data` into a zero-padded 32-byte area
    pub fn digest(&self, data: &[u8]) -> [u8; CSUM_AREA_SIZE] {
        let mut out = [0u8; CSUM_AREA_SIZE];
        match self {
            Self::Crc32c => {
                out[..4].copy_from_slice(&crc32c(data).to_le_bytes());
            }
            Self::XxHash64 => {
                let h = xxhash_rust::xxh64::xxh64(data, 0);
                out[..8].copy_from_slice(&h.to_le_bytes());
            }
            Self::Sha256 => {
                let h = Sha256::digest(data);
                out.copy_from_slice(&h);
            }
            Self::Blake2b => {
                let h = Blake2b::<U32>::digest(data);
                out.copy_from_slice(&h);
            }
        }
        out
    }
}

/// Computes a CRC32c checksum
#[inline]
pub fn crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Continues a CRC32c checksum (for streaming)
#[inline]
pub fn crc32c_append(crc: u32, data: &[u8]) -> u32 {
    crc32c::crc32c_append(crc, data)
}

/// Directory-entry name hash.
///
/// CRC32c over the name with the seed the on-disk format fixes at `!1`;
/// an empty name hashes to `0xFFFF_FFFE`.
#[inline]
pub fn name_hash(name: &[u8]) -> u64 {
    // crc32c_append folds the standard init/xor-out in; undo both to get the
    // raw seeded variant the directory index keys use.
    (!crc32c::crc32c_append(1, name)) as u64
}

/// Computes the checksum area for a tree block or superblock
pub fn compute_block_csum(csum_type: ChecksumType, block: &[u8]) -> [u8; CSUM_AREA_SIZE] {
    csum_type.digest(&block[CSUM_CONTENT_OFFSET..])
}

/// Writes the checksum of `block` into its leading csum area
pub fn stamp_block_csum(csum_type: ChecksumType, block: &mut [u8]) {
    let csum = compute_block_csum(csum_type, block);
    block[..CSUM_AREA_SIZE].copy_from_slice(&csum);
}

/// Verifies the leading checksum of a tree block or superblock.
///
/// The caller owns mirror fallback; a mismatch here is one corrupt copy.
pub fn verify_block_csum(csum_type: ChecksumType, block: &[u8], bytenr: u64) -> Result<()> {
    if block.len() <= CSUM_CONTENT_OFFSET {
        return Err(FsError::CorruptRead(format!(
            "block at bytenr {} too small for checksum",
            bytenr
        )));
    }
    let expected = &block[..CSUM_AREA_SIZE];
    let actual = compute_block_csum(csum_type, block);
    if expected != actual {
        return Err(FsError::CorruptRead(format!(
            "checksum mismatch at bytenr {}",
            bytenr
        )));
    }
    Ok(())
}
