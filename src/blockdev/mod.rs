//! Block device abstraction layer
//!
//! Every byte the toolkit reads or writes goes through this module. Backends
//! are regular files and raw block devices; both are driven with positional
//! I/O so a single open handle can serve many readers.

pub mod image;

use std::path::Path;
use thiserror::Error;

pub use image::ImageFile;

/// Errors that can occur during block device operations
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Invalid offset: {offset} (device size: {size})")]
    InvalidOffset { offset: u64, size: u64 },

    #[error("Short {op} at offset {offset}: {got}/{wanted} bytes")]
    ShortIo {
        op: &'static str,
        offset: u64,
        got: usize,
        wanted: usize,
    },

    #[error("Device is read-only")]
    ReadOnly,

    #[error("Device is mounted: {0}")]
    Mounted(String),
}

pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// Trait for block device access
pub trait BlockDevice: Send + Sync {
    /// Returns the total size of the device in bytes
    fn size(&self) -> u64;

    /// Returns the sector size of the device
    fn sector_size(&self) -> u32;

    /// Returns true if the device is read-only
    fn is_read_only(&self) -> bool;

    /// Reads data at the specified offset
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Writes data at the specified offset
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize>;

    /// Flushes buffered data to the device
    fn flush_device(&self) -> Result<()>;

    /// Durability barrier: everything written before this call is on stable
    /// storage when it returns.
    fn sync_device(&self) -> Result<()>;
}

/// Reads exactly `buf.len()` bytes or fails
pub fn read_exact_at(dev: &dyn BlockDevice, offset: u64, buf: &mut [u8]) -> Result<()> {
    let n = dev.read_at(offset, buf)?;
    if n != buf.len() {
        return Err(BlockDeviceError::ShortIo {
            op: "read",
            offset,
            got: n,
            wanted: buf.len(),
        });
    }
    Ok(())
}

/// Writes exactly `buf.len()` bytes or fails
pub fn write_all_at(dev: &dyn BlockDevice, offset: u64, buf: &[u8]) -> Result<()> {
    let n = dev.write_at(offset, buf)?;
    if n != buf.len() {
        return Err(BlockDeviceError::ShortIo {
            op: "write",
            offset,
            got: n,
            wanted: buf.len(),
        });
    }
    Ok(())
}

/// Opens a block device from the given path
pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Box<dyn BlockDevice>> {
    Ok(Box::new(ImageFile::open(path, read_only)?))
}

/// Refuses to touch a device that appears in the OS mount table.
///
/// Loop devices are resolved to their backing file so that `losetup`d images
/// are caught as well. Write entry points call this before opening.
#[cfg(target_os = "linux")]
pub fn ensure_unmounted<P: AsRef<Path>>(path: P) -> Result<()> {
    use std::fs;

    let target = fs::canonicalize(path.as_ref())?;

    let mounts = match fs::read_to_string("/proc/self/mounts") {
        Ok(m) => m,
        // No mount table (odd chroot); nothing to check against.
        Err(_) => return Ok(()),
    };

    for line in mounts.lines() {
        let source = match line.split_whitespace().next() {
            Some(s) => s,
            None => continue,
        };
        if !source.starts_with('/') {
            continue;
        }
        let source_path = match fs::canonicalize(source) {
            Ok(p) => p,
            Err(_) => continue,
        };
        if source_path == target {
            return Err(BlockDeviceError::Mounted(
                target.to_string_lossy().into_owned(),
            ));
        }
        // A mounted loop device whose backing file is our target counts too.
        if let Some(name) = source_path.file_name().and_then(|n| n.to_str()) {
            if name.starts_with("loop") {
                let backing = format!("/sys/block/{}/loop/backing_file", name);
                if let Ok(b) = fs::read_to_string(&backing) {
                    if let Ok(b) = fs::canonicalize(b.trim()) {
                        if b == target {
                            return Err(BlockDeviceError::Mounted(
                                target.to_string_lossy().into_owned(),
                            ));
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn ensure_unmounted<P: AsRef<Path>>(_path: P) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_device_error_display() {
        let err = BlockDeviceError::NotFound("test".to_string());
        assert_eq!(format!("{}", err), "Device not found: test");

        let err = BlockDeviceError::InvalidOffset {
            offset: 1000,
            size: 500,
        };
        assert!(format!("{}", err).contains("1000"));
        assert!(format!("{}", err).contains("500"));

        let err = BlockDeviceError::ReadOnly;
        assert!(format!("{}", err).contains("read-only"));

        let err = BlockDeviceError::Mounted("/dev/sda1".to_string());
        assert!(format!("{}", err).contains("/dev/sda1"));
    }

    #[test]
    fn test_open_image_file() {
        use tempfile::NamedTempFile;

        let temp = NamedTempFile::new().unwrap();
        let path = temp.path().to_str().unwrap();

        std::fs::write(path, vec![0u8; 1024]).unwrap();

        let device = open(path, true).unwrap();
        assert_eq!(device.size(), 1024);
        assert!(device.is_read_only());
    }

    #[test]
    fn test_open_nonexistent_file() {
        let result = open("/nonexistent/path/to/file.img", true);
        assert!(result.is_err());
    }

    #[test]
    fn test_read_write_exact() {
        use tempfile::NamedTempFile;

        let temp = NamedTempFile::new().unwrap();
        let img = ImageFile::create(temp.path(), 4096).unwrap();

        write_all_at(&img, 100, b"exact").unwrap();
        let mut buf = [0u8; 5];
        read_exact_at(&img, 100, &mut buf).unwrap();
        assert_eq!(&buf, b"exact");

        // A read straddling the end of the device is short and must error.
        let mut buf = [0u8; 16];
        assert!(read_exact_at(&img, 4090, &mut buf).is_err());
    }

    #[test]
    fn test_ensure_unmounted_plain_file() {
        use tempfile::NamedTempFile;

        let temp = NamedTempFile::new().unwrap();
        assert!(ensure_unmounted(temp.path()).is_ok());
    }
}
