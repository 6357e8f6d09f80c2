//! Compression support
//!
//! File data is decompressed when the restore pipeline reads it back out of
//! an image; the toolkit never compresses file data on write. The metadata
//! dump uses plain zlib streams for its cluster payloads.

use super::{FsError, Result};
use flate2::read::ZlibDecoder;
use std::io::Read;

/// Compression types as stored in file extent items
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    /// No compression
    None,
    /// Zlib
    Zlib,
    /// LZO segmented format
    Lzo,
    /// Zstd
    Zstd,
}

impl CompressionType {
    /// Creates a compression type from the on-disk value
    #[inline]
    pub fn from_disk(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Zlib),
            2 => Ok(Self::Lzo),
            3 => Ok(Self::Zstd),
            _ => Err(FsError::FeatureUnsupported(format!(
                "compression type {}",
                value
            ))),
        }
    }

    /// Returns the on-disk value for this compression type
    #[inline]
    pub const fn to_disk(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Zlib => 1,
            Self::Lzo => 2,
            Self::Zstd => 3,
        }
    }
}

/// Decompresses an extent payload
pub fn decompress(
    compression: CompressionType,
    compressed: &[u8],
    uncompressed_size: usize,
) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(compressed.to_vec()),
        CompressionType::Zlib => decompress_zlib(compressed, uncompressed_size),
        CompressionType::Lzo => decompress_lzo(compressed, uncompressed_size),
        CompressionType::Zstd => decompress_zstd(compressed),
    }
}

/// Decompresses zlib-compressed data
pub fn decompress_zlib(compressed: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(compressed);
    let mut decompressed = Vec::with_capacity(uncompressed_size);
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| FsError::CorruptRead(format!("zlib stream: {}", e)))?;
    Ok(decompressed)
}

/// Decompresses the segmented LZO extent format: a total length word, then
/// length-prefixed segments.
pub fn decompress_lzo(compressed: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
    if compressed.len() < 4 {
        return Err(FsError::CorruptRead("LZO extent too small".to_string()));
    }

    let mut decompressed = Vec::with_capacity(uncompressed_size);
    let mut offset = 4;

    while offset + 4 <= compressed.len() && decompressed.len() < uncompressed_size {
        let segment_size = u32::from_le_bytes([
            compressed[offset],
            compressed[offset + 1],
            compressed[offset + 2],
            compressed[offset + 3],
        ]) as usize;
        offset += 4;

        if segment_size == 0 || offset + segment_size > compressed.len() {
            break;
        }

        let segment = &compressed[offset..offset + segment_size];
        offset += segment_size;

        let out = lz4::block::decompress(segment, Some(uncompressed_size as i32))
            .map_err(|e| FsError::CorruptRead(format!("LZO segment: {}", e)))?;
        decompressed.extend_from_slice(&out);
    }

    Ok(decompressed)
}

/// Decompresses zstd-compressed data
pub fn decompress_zstd(compressed: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(compressed).map_err(|e| FsError::CorruptRead(format!("zstd stream: {}", e)))
}

/// Compresses a metadata-dump cluster payload with zlib
pub fn compress_zlib(data: &[u8], level: u32) -> Result<Vec<u8>> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
    encoder
        .write_all(data)
        .map_err(|e| FsError::Io(e))?;
    encoder.finish().map_err(FsError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_type_roundtrip() {
        for t in [
            CompressionType::None,
            CompressionType::Zlib,
            CompressionType::Lzo,
            CompressionType::Zstd,
        ] {
            assert_eq!(CompressionType::from_disk(t.to_disk()).unwrap(), t);
        }
        assert!(CompressionType::from_disk(4).is_err());
    }

    #[test]
    fn test_zlib_roundtrip() {
        let data = b"compressible compressible compressible compressible".repeat(20);
        let compressed = compress_zlib(&data, 6).unwrap();
        assert!(compressed.len() < data.len());

        let restored = decompress_zlib(&compressed, data.len()).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_zlib_garbage() {
        assert!(decompress_zlib(b"not a zlib stream", 64).is_err());
    }

    #[test]
    fn test_zstd_roundtrip() {
        let data = vec![42u8; 4096];
        let compressed = zstd::encode_all(&data[..], 3).unwrap();
        let restored = decompress_zstd(&compressed).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_lzo_too_small() {
        assert!(decompress_lzo(&[0, 1], 64).is_err());
    }

    #[test]
    fn test_none_passthrough() {
        let data = b"plain bytes";
        let out = decompress(CompressionType::None, data, data.len()).unwrap();
        assert_eq!(out, data);
    }
}
