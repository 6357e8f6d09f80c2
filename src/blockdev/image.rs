//! Image file access
//!
//! Provides access to filesystem images stored in regular files. Reads go
//! through a shared memory map when one could be established; writes always
//! take the file descriptor path so they are visible to `sync_device`.

use super::{BlockDevice, BlockDeviceError, Result};
use memmap2::{Mmap, MmapOptions};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Default sector size for image files
const DEFAULT_SECTOR_SIZE: u32 = 4096;

/// An image file backed block device
pub struct ImageFile {
    file: RwLock<File>,
    mmap: RwLock<Option<Mmap>>,
    size: u64,
    read_only: bool,
}

impl ImageFile {
    /// Opens an image file
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path.as_ref())
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    BlockDeviceError::NotFound(path.as_ref().to_string_lossy().into_owned())
                }
                _ => BlockDeviceError::Io(e),
            })?;

        let size = file.metadata()?.len();

        let mmap = if size > 0 && read_only {
            // Shared read mapping; harmless to fall back to pread on failure.
            unsafe { MmapOptions::new().map(&file) }.ok()
        } else {
            None
        };

        Ok(Self {
            file: RwLock::new(file),
            mmap: RwLock::new(mmap),
            size,
            read_only,
        })
    }

    /// Creates a new zeroed image file with the specified size
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;

        file.set_len(size)?;

        Ok(Self {
            file: RwLock::new(file),
            mmap: RwLock::new(None),
            size,
            read_only: false,
        })
    }
}

impl BlockDevice for ImageFile {
    fn size(&self) -> u64 {
        self.size
    }

    fn sector_size(&self) -> u32 {
        DEFAULT_SECTOR_SIZE
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size {
            return Err(BlockDeviceError::InvalidOffset {
                offset,
                size: self.size,
            });
        }

        let bytes_to_read = std::cmp::min(buf.len() as u64, self.size - offset) as usize;

        if let Some(ref mmap) = *self.mmap.read() {
            let src = &mmap[offset as usize..offset as usize + bytes_to_read];
            buf[..bytes_to_read].copy_from_slice(src);
            return Ok(bytes_to_read);
        }

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        let mut done = 0;
        while done < bytes_to_read {
            let n = file.read(&mut buf[done..bytes_to_read])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }

        if offset >= self.size {
            return Err(BlockDeviceError::InvalidOffset {
                offset,
                size: self.size,
            });
        }

        let bytes_to_write = std::cmp::min(buf.len() as u64, self.size - offset) as usize;

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&buf[..bytes_to_write])?;
        Ok(bytes_to_write)
    }

    fn flush_device(&self) -> Result<()> {
        self.file.write().flush()?;
        Ok(())
    }

    fn sync_device(&self) -> Result<()> {
        let mut file = self.file.write();
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_create_and_read() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path();

        let size = 1024 * 1024;
        let img = ImageFile::create(path, size).unwrap();

        assert_eq!(img.size(), size);
        assert!(!img.is_read_only());

        let data = b"Hello, toolkit!";
        img.write_at(0, data).unwrap();

        let mut buf = vec![0u8; data.len()];
        img.read_at(0, &mut buf).unwrap();

        assert_eq!(&buf, data);
    }

    #[test]
    fn test_read_only() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path();

        let _img = ImageFile::create(path, 1024).unwrap();

        let img = ImageFile::open(path, true).unwrap();
        assert!(img.is_read_only());

        let result = img.write_at(0, b"test");
        assert!(result.is_err());
    }

    #[test]
    fn test_mmap_read_matches_file_read() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path();

        let img = ImageFile::create(path, 8192).unwrap();
        img.write_at(4000, b"straddle").unwrap();
        img.sync_device().unwrap();
        drop(img);

        // Read-only open maps the file; contents must match what was written.
        let ro = ImageFile::open(path, true).unwrap();
        let mut buf = [0u8; 8];
        ro.read_at(4000, &mut buf).unwrap();
        assert_eq!(&buf, b"straddle");
    }

    #[test]
    fn test_offset_past_end() {
        let temp = NamedTempFile::new().unwrap();
        let img = ImageFile::create(temp.path(), 512).unwrap();

        let mut buf = [0u8; 8];
        assert!(img.read_at(512, &mut buf).is_err());
        assert!(img.write_at(513, &buf).is_err());
    }
}
