//! Minimal ext2/3/4 (as ext2) reader
//!
//! Enough of the format to drive a conversion: superblock and group
//! descriptors, block bitmaps for the used-space map, the inode table,
//! directory walks, the full indirect block chain and the xattr block.
//! Strictly read-only.

use crate::blockdev::{self, BlockDevice};
use crate::core::alloc::IntervalSet;
use crate::core::{FsError, Result};
use byteorder::{ByteOrder, LittleEndian};

/// ext2 superblock magic
pub const EXT2_MAGIC: u16 = 0xEF53;

/// Byte offset of the primary ext2 superblock
pub const EXT2_SUPER_OFFSET: u64 = 1024;

/// Root directory inode
pub const EXT2_ROOT_INO: u64 = 2;

/// First non-reserved inode in ext2
pub const EXT2_FIRST_USER_INO: u64 = 11;

/// Direct block pointers per inode
const EXT2_NDIR_BLOCKS: usize = 12;

/// Incompat features we refuse (extents, 64bit: that is ext4 territory)
const EXT2_INCOMPAT_SUPPORTED: u32 = 0x0002; // FILETYPE

/// Parsed superblock fields the conversion needs
#[derive(Debug, Clone)]
pub struct Ext2Super {
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub first_data_block: u32,
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u32,
    pub label: String,
    pub uuid: [u8; 16],
}

/// One block group descriptor
#[derive(Debug, Clone, Copy)]
struct GroupDesc {
    block_bitmap: u32,
    inode_table: u32,
}

/// A parsed ext2 inode
#[derive(Debug, Clone)]
pub struct Ext2Inode {
    pub ino: u64,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub links_count: u16,
    pub flags: u32,
    pub block: [u32; 15],
    pub file_acl: u32,
    /// Raw bytes 40..100, the symlink fast path
    pub inline_target: [u8; 60],
}

impl Ext2Inode {
    pub fn is_dir(&self) -> bool {
        self.mode & 0o170000 == 0o040000
    }

    pub fn is_regular(&self) -> bool {
        self.mode & 0o170000 == 0o100000
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & 0o170000 == 0o120000
    }

    /// Device number for char/block nodes, encoded in the block array
    pub fn rdev(&self) -> u64 {
        let raw = self.block[0];
        if raw != 0 {
            // Old encoding: 8-bit major/minor.
            let major = (raw >> 8) & 0xFF;
            let minor = raw & 0xFF;
            ((major as u64) << 20) | minor as u64
        } else {
            let raw = self.block[1];
            let major = (raw & 0xFFF00) >> 8;
            let minor = (raw & 0xFF) | ((raw >> 12) & 0xFFF00);
            ((major as u64) << 20) | minor as u64
        }
    }
}

/// One directory entry
#[derive(Debug, Clone)]
pub struct Ext2DirEntry {
    pub ino: u64,
    pub file_type: u8,
    pub name: Vec<u8>,
}

/// An open ext2 filesystem
pub struct Ext2Fs {
    dev: Box<dyn BlockDevice>,
    pub sb: Ext2Super,
    groups: Vec<GroupDesc>,
}

impl Ext2Fs {
    /// Opens and validates an ext2 filesystem on `dev`
    pub fn open(dev: Box<dyn BlockDevice>) -> Result<Self> {
        let mut raw = vec![0u8; 1024];
        blockdev::read_exact_at(dev.as_ref(), EXT2_SUPER_OFFSET, &mut raw)?;

        let magic = LittleEndian::read_u16(&raw[56..58]);
        if magic != EXT2_MAGIC {
            return Err(FsError::CorruptRead(format!(
                "not an ext2 filesystem (magic {:#06x})",
                magic
            )));
        }

        let log_block_size = LittleEndian::read_u32(&raw[24..28]);
        let block_size = 1024u32 << log_block_size;
        let rev_level = LittleEndian::read_u32(&raw[76..80]);
        let inode_size = if rev_level >= 1 {
            LittleEndian::read_u16(&raw[88..90]) as u32
        } else {
            128
        };
        let feature_incompat = LittleEndian::read_u32(&raw[96..100]);
        if feature_incompat & !EXT2_INCOMPAT_SUPPORTED != 0 {
            return Err(FsError::FeatureUnsupported(format!(
                "ext2 incompat features {:#x}",
                feature_incompat & !EXT2_INCOMPAT_SUPPORTED
            )));
        }

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&raw[104..120]);
        let label_end = raw[120..136].iter().position(|&b| b == 0).unwrap_or(16);
        let label = String::from_utf8_lossy(&raw[120..120 + label_end]).into_owned();

        let sb = Ext2Super {
            inodes_count: LittleEndian::read_u32(&raw[0..4]),
            blocks_count: LittleEndian::read_u32(&raw[4..8]) as u64,
            first_data_block: LittleEndian::read_u32(&raw[20..24]),
            block_size,
            blocks_per_group: LittleEndian::read_u32(&raw[32..36]),
            inodes_per_group: LittleEndian::read_u32(&raw[40..44]),
            inode_size,
            label,
            uuid,
        };

        if sb.blocks_per_group == 0 || sb.inodes_per_group == 0 {
            return Err(FsError::CorruptRead("ext2 superblock has zero group geometry".to_string()));
        }

        let group_count =
            (sb.blocks_count + sb.blocks_per_group as u64 - 1) / sb.blocks_per_group as u64;

        // Group descriptors follow the superblock's block.
        let desc_block = sb.first_data_block as u64 + 1;
        let mut desc_bytes = vec![0u8; (group_count as usize * 32).next_multiple_of(block_size as usize)];
        blockdev::read_exact_at(dev.as_ref(), desc_block * block_size as u64, &mut desc_bytes)?;

        let mut groups = Vec::with_capacity(group_count as usize);
        for g in 0..group_count as usize {
            let d = &desc_bytes[g * 32..g * 32 + 32];
            groups.push(GroupDesc {
                block_bitmap: LittleEndian::read_u32(&d[0..4]),
                inode_table: LittleEndian::read_u32(&d[8..12]),
            });
        }

        tracing::debug!(
            blocks = sb.blocks_count,
            block_size = sb.block_size,
            groups = groups.len(),
            "opened ext2 filesystem"
        );

        Ok(Self { dev, sb, groups })
    }

    pub fn total_bytes(&self) -> u64 {
        self.sb.blocks_count * self.sb.block_size as u64
    }

    pub fn blocksize(&self) -> u32 {
        self.sb.block_size
    }

    pub fn label(&self) -> &str {
        &self.sb.label
    }

    pub fn fs_uuid(&self) -> [u8; 16] {
        self.sb.uuid
    }

    /// Reads one filesystem block
    pub fn read_block(&self, block: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.sb.block_size as usize];
        blockdev::read_exact_at(self.dev.as_ref(), block * self.sb.block_size as u64, &mut buf)?;
        Ok(buf)
    }

    /// Reads an arbitrary byte range
    pub fn read_bytes(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        blockdev::read_exact_at(self.dev.as_ref(), offset, &mut buf)?;
        Ok(buf)
    }

    /// Byte ranges holding anything: every block set in a block bitmap,
    /// plus the boot block region before the first data block.
    pub fn used_extents(&self) -> Result<IntervalSet> {
        let bs = self.sb.block_size as u64;
        let mut used = IntervalSet::new();

        // Boot block and superblock always count.
        used.insert(0, (self.sb.first_data_block as u64 + 1) * bs);

        for (gi, group) in self.groups.iter().enumerate() {
            let bitmap = self.read_block(group.block_bitmap as u64)?;
            let group_first =
                self.sb.first_data_block as u64 + gi as u64 * self.sb.blocks_per_group as u64;
            let blocks_here = (self.sb.blocks_count - group_first)
                .min(self.sb.blocks_per_group as u64) as usize;

            for b in 0..blocks_here {
                if bitmap[b / 8] & (1 << (b % 8)) != 0 {
                    used.insert((group_first + b as u64) * bs, bs);
                }
            }
        }
        Ok(used)
    }

    /// Reads one inode from its table
    pub fn read_inode(&self, ino: u64) -> Result<Ext2Inode> {
        if ino == 0 || ino > self.sb.inodes_count as u64 {
            return Err(FsError::NotFound(format!("ext2 inode {}", ino)));
        }
        let index = ino - 1;
        let group = (index / self.sb.inodes_per_group as u64) as usize;
        let offset_in_group = index % self.sb.inodes_per_group as u64;
        let desc = self
            .groups
            .get(group)
            .ok_or_else(|| FsError::CorruptRead(format!("ext2 inode {} beyond last group", ino)))?;

        let byte = desc.inode_table as u64 * self.sb.block_size as u64
            + offset_in_group * self.sb.inode_size as u64;
        let raw = self.read_bytes(byte, 128)?;

        let mode = LittleEndian::read_u16(&raw[0..2]);
        let size_low = LittleEndian::read_u32(&raw[4..8]) as u64;
        let size_high = LittleEndian::read_u32(&raw[108..112]) as u64;
        let size = if mode & 0o170000 == 0o100000 {
            size_low | (size_high << 32)
        } else {
            size_low
        };

        let mut block = [0u32; 15];
        for (i, b) in block.iter_mut().enumerate() {
            *b = LittleEndian::read_u32(&raw[40 + i * 4..44 + i * 4]);
        }
        let mut inline_target = [0u8; 60];
        inline_target.copy_from_slice(&raw[40..100]);

        Ok(Ext2Inode {
            ino,
            mode,
            uid: LittleEndian::read_u16(&raw[2..4]) as u32,
            gid: LittleEndian::read_u16(&raw[24..26]) as u32,
            size,
            atime: LittleEndian::read_u32(&raw[8..12]),
            ctime: LittleEndian::read_u32(&raw[12..16]),
            mtime: LittleEndian::read_u32(&raw[16..20]),
            links_count: LittleEndian::read_u16(&raw[26..28]),
            flags: LittleEndian::read_u32(&raw[32..36]),
            block,
            file_acl: LittleEndian::read_u32(&raw[104..108]),
            inline_target,
        })
    }

    fn walk_indirect(&self, block: u32, depth: u32, out: &mut Vec<u32>, remaining: &mut u64) -> Result<()> {
        if *remaining == 0 {
            return Ok(());
        }
        if block == 0 {
            // A hole spanning this whole subtree.
            let mut span = self.sb.block_size as u64 / 4;
            for _ in 1..depth {
                span *= self.sb.block_size as u64 / 4;
            }
            let holes = span.min(*remaining);
            out.extend(std::iter::repeat(0).take(holes as usize));
            *remaining -= holes;
            return Ok(());
        }
        if depth == 0 {
            out.push(block);
            *remaining -= 1;
            return Ok(());
        }
        let table = self.read_block(block as u64)?;
        for i in 0..(self.sb.block_size as usize / 4) {
            if *remaining == 0 {
                break;
            }
            let child = LittleEndian::read_u32(&table[i * 4..i * 4 + 4]);
            self.walk_indirect(child, depth - 1, out, remaining)?;
        }
        Ok(())
    }

    /// Every data block of a file in order; 0 marks a hole block
    pub fn file_blocks(&self, inode: &Ext2Inode) -> Result<Vec<u32>> {
        let bs = self.sb.block_size as u64;
        let mut remaining = (inode.size + bs - 1) / bs;
        let mut out = Vec::with_capacity(remaining as usize);

        for i in 0..EXT2_NDIR_BLOCKS {
            if remaining == 0 {
                break;
            }
            if inode.block[i] == 0 {
                out.push(0);
            } else {
                out.push(inode.block[i]);
            }
            remaining -= 1;
        }
        self.walk_indirect(inode.block[12], 1, &mut out, &mut remaining)?;
        self.walk_indirect(inode.block[13], 2, &mut out, &mut remaining)?;
        self.walk_indirect(inode.block[14], 3, &mut out, &mut remaining)?;

        if remaining > 0 {
            return Err(FsError::CorruptRead(format!(
                "ext2 inode {} misses {} blocks",
                inode.ino, remaining
            )));
        }
        Ok(out)
    }

    /// Lists a directory, skipping `.` and `..`
    pub fn read_dir(&self, inode: &Ext2Inode) -> Result<Vec<Ext2DirEntry>> {
        if !inode.is_dir() {
            return Err(FsError::Invariant(format!(
                "ext2 inode {} is not a directory",
                inode.ino
            )));
        }

        let mut entries = Vec::new();
        for block in self.file_blocks(inode)? {
            if block == 0 {
                continue;
            }
            let data = self.read_block(block as u64)?;
            let mut offset = 0usize;
            while offset + 8 <= data.len() {
                let ino = LittleEndian::read_u32(&data[offset..offset + 4]) as u64;
                let rec_len = LittleEndian::read_u16(&data[offset + 4..offset + 6]) as usize;
                let name_len = data[offset + 6] as usize;
                let file_type = data[offset + 7];
                if rec_len < 8 || offset + rec_len > data.len() {
                    return Err(FsError::CorruptRead(format!(
                        "ext2 directory {} has a bad record at byte {}",
                        inode.ino, offset
                    )));
                }
                if ino != 0 && name_len > 0 {
                    let name = data[offset + 8..offset + 8 + name_len].to_vec();
                    if name != b"." && name != b".." {
                        entries.push(Ext2DirEntry {
                            ino,
                            file_type,
                            name,
                        });
                    }
                }
                offset += rec_len;
            }
        }
        Ok(entries)
    }

    /// Resolves a symlink target
    pub fn read_symlink(&self, inode: &Ext2Inode) -> Result<Vec<u8>> {
        if !inode.is_symlink() {
            return Err(FsError::Invariant(format!(
                "ext2 inode {} is not a symlink",
                inode.ino
            )));
        }
        let len = inode.size as usize;
        // Fast symlinks keep the target inline in the block array.
        if len <= 60 {
            return Ok(inode.inline_target[..len].to_vec());
        }
        let data = self.read_block(inode.block[0] as u64)?;
        Ok(data[..len.min(data.len())].to_vec())
    }

    /// Extended attributes from the xattr block, as (name, value) pairs
    pub fn read_xattrs(&self, inode: &Ext2Inode) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        const XATTR_MAGIC: u32 = 0xEA02_0000;
        const PREFIXES: [&str; 5] = ["", "user.", "system.posix_acl_access", "system.posix_acl_default", "trusted."];

        if inode.file_acl == 0 {
            return Ok(Vec::new());
        }
        let data = self.read_block(inode.file_acl as u64)?;
        if LittleEndian::read_u32(&data[0..4]) != XATTR_MAGIC {
            return Err(FsError::CorruptRead(format!(
                "ext2 inode {} has a bad xattr block",
                inode.ino
            )));
        }

        let mut out = Vec::new();
        let mut offset = 32;
        loop {
            if offset + 16 > data.len() {
                break;
            }
            let name_len = data[offset] as usize;
            let name_index = data[offset + 1] as usize;
            if name_len == 0 && name_index == 0 {
                break;
            }
            let value_offs = LittleEndian::read_u16(&data[offset + 2..offset + 4]) as usize;
            let value_size = LittleEndian::read_u32(&data[offset + 8..offset + 12]) as usize;
            if offset + 16 + name_len > data.len() || value_offs + value_size > data.len() {
                return Err(FsError::CorruptRead(format!(
                    "ext2 inode {} has a truncated xattr entry",
                    inode.ino
                )));
            }
            let prefix = PREFIXES.get(name_index).copied().unwrap_or("");
            let mut name = prefix.as_bytes().to_vec();
            name.extend_from_slice(&data[offset + 16..offset + 16 + name_len]);
            out.push((name, data[value_offs..value_offs + value_size].to_vec()));
            // Entries are 4-byte aligned.
            offset += (16 + name_len + 3) & !3;
        }
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod test_image {
    //! Fabricates a tiny valid ext2 image for the conversion tests.

    use super::*;

    pub const BLOCK_SIZE: u32 = 2048;

    /// Builds a 16 MiB single-group ext2 image with `/hello.txt`
    /// containing `content`.
    pub fn build(content: &[u8]) -> Vec<u8> {
        let total_blocks = 8192u32; // 16 MiB of 2 KiB blocks
        let mut img = vec![0u8; (total_blocks * BLOCK_SIZE) as usize];

        let block_bitmap_block = 2u32;
        let inode_bitmap_block = 3u32;
        let inode_table_block = 4u32; // 16 blocks of 16 inodes (128B each)
        let inode_table_blocks = 16u32;
        let root_dir_block = 600u32;
        let file_block = 601u32;
        let inodes_count = 256u32;

        // Superblock at byte 1024, inside block 0 for 2 KiB blocks.
        let sb = &mut img[1024..2048];
        LittleEndian::write_u32(&mut sb[0..4], inodes_count);
        LittleEndian::write_u32(&mut sb[4..8], total_blocks);
        LittleEndian::write_u32(&mut sb[20..24], 0); // first_data_block
        LittleEndian::write_u32(&mut sb[24..28], 1); // log_block_size -> 2048
        LittleEndian::write_u32(&mut sb[32..36], total_blocks); // blocks_per_group
        LittleEndian::write_u32(&mut sb[40..44], inodes_count); // inodes_per_group
        LittleEndian::write_u16(&mut sb[56..58], EXT2_MAGIC);
        LittleEndian::write_u32(&mut sb[76..80], 1); // rev_level
        LittleEndian::write_u16(&mut sb[88..90], 128); // inode_size
        LittleEndian::write_u32(&mut sb[96..100], 0x0002); // FILETYPE
        sb[104..120].copy_from_slice(&[0x42; 16]); // uuid
        sb[120..126].copy_from_slice(b"oldfs\0");

        // One group descriptor in block 1.
        let gd = &mut img[2048..2080];
        LittleEndian::write_u32(&mut gd[0..4], block_bitmap_block);
        LittleEndian::write_u32(&mut gd[4..8], inode_bitmap_block);
        LittleEndian::write_u32(&mut gd[8..12], inode_table_block);

        // Block bitmap: metadata blocks plus the two data blocks.
        {
            let used: Vec<u32> = (0..inode_table_block + inode_table_blocks)
                .chain([root_dir_block, file_block])
                .collect();
            let base = (block_bitmap_block * BLOCK_SIZE) as usize;
            for block in used {
                // Bitmap bit 0 is first_data_block (block 0).
                let bit = block as usize;
                img[base + bit / 8] |= 1 << (bit % 8);
            }
        }

        // Inode bitmap: reserved inodes 1..=10, lost+found slot 11 unused
        // here, root (2) and the file (12).
        {
            let base = (inode_bitmap_block * BLOCK_SIZE) as usize;
            for ino in 1..=12u32 {
                let bit = (ino - 1) as usize;
                img[base + bit / 8] |= 1 << (bit % 8);
            }
        }

        let write_inode = |img: &mut [u8], ino: u32, f: &dyn Fn(&mut [u8])| {
            let base = (inode_table_block * BLOCK_SIZE) as usize + ((ino - 1) * 128) as usize;
            f(&mut img[base..base + 128]);
        };

        // Root directory inode.
        write_inode(&mut img, 2, &|raw| {
            LittleEndian::write_u16(&mut raw[0..2], 0o040755);
            LittleEndian::write_u32(&mut raw[4..8], BLOCK_SIZE);
            LittleEndian::write_u16(&mut raw[26..28], 2);
            LittleEndian::write_u32(&mut raw[40..44], root_dir_block);
        });

        // hello.txt at inode 12.
        let content_len = content.len() as u32;
        write_inode(&mut img, 12, &|raw| {
            LittleEndian::write_u16(&mut raw[0..2], 0o100644);
            LittleEndian::write_u32(&mut raw[4..8], content_len);
            LittleEndian::write_u32(&mut raw[8..12], 1_600_000_000);
            LittleEndian::write_u32(&mut raw[12..16], 1_600_000_001);
            LittleEndian::write_u32(&mut raw[16..20], 1_600_000_002);
            LittleEndian::write_u16(&mut raw[26..28], 1);
            LittleEndian::write_u32(&mut raw[40..44], file_block);
        });

        // Root directory data: ., .., hello.txt.
        {
            let base = (root_dir_block * BLOCK_SIZE) as usize;
            let dir = &mut img[base..base + BLOCK_SIZE as usize];
            // "."
            LittleEndian::write_u32(&mut dir[0..4], 2);
            LittleEndian::write_u16(&mut dir[4..6], 12);
            dir[6] = 1;
            dir[7] = 2;
            dir[8] = b'.';
            // ".."
            LittleEndian::write_u32(&mut dir[12..16], 2);
            LittleEndian::write_u16(&mut dir[16..18], 12);
            dir[18] = 2;
            dir[19] = 2;
            dir[20] = b'.';
            dir[21] = b'.';
            // "hello.txt"
            LittleEndian::write_u32(&mut dir[24..28], 12);
            LittleEndian::write_u16(&mut dir[28..30], (BLOCK_SIZE - 24) as u16);
            dir[30] = 9;
            dir[31] = 1;
            dir[32..41].copy_from_slice(b"hello.txt");
        }

        // File content.
        let base = (file_block * BLOCK_SIZE) as usize;
        img[base..base + content.len()].copy_from_slice(content);

        img
    }

    /// Byte offset of the file content inside the built image
    pub fn content_offset() -> u64 {
        601 * BLOCK_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::ImageFile;

    fn open_sample(content: &[u8]) -> (tempfile::NamedTempFile, Ext2Fs) {
        let img = test_image::build(content);
        let temp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), &img).unwrap();
        let dev = Box::new(ImageFile::open(temp.path(), true).unwrap());
        let fs = Ext2Fs::open(dev).unwrap();
        (temp, fs)
    }

    #[test]
    fn test_open_sample_image() {
        let (_t, fs) = open_sample(b"hi\n");
        assert_eq!(fs.blocksize(), 2048);
        assert_eq!(fs.total_bytes(), 16 * 1024 * 1024);
        assert_eq!(fs.label(), "oldfs");
        assert_eq!(fs.fs_uuid(), [0x42; 16]);
    }

    #[test]
    fn test_open_rejects_garbage() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), vec![0u8; 1 << 20]).unwrap();
        let dev = Box::new(ImageFile::open(temp.path(), true).unwrap());
        assert!(Ext2Fs::open(dev).is_err());
    }

    #[test]
    fn test_used_extents_cover_metadata_and_data() {
        let (_t, fs) = open_sample(b"hi\n");
        let used = fs.used_extents().unwrap();

        // Superblock and file content are used; the tail of the image free.
        assert!(used.contains(1024, 1024));
        assert!(used.contains(test_image::content_offset(), 1024));
        assert!(!used.contains(10 * 1024 * 1024, 1024));
    }

    #[test]
    fn test_read_root_dir() {
        let (_t, fs) = open_sample(b"hi\n");
        let root = fs.read_inode(EXT2_ROOT_INO).unwrap();
        assert!(root.is_dir());

        let entries = fs.read_dir(&root).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, b"hello.txt");
        assert_eq!(entries[0].ino, 12);
    }

    #[test]
    fn test_read_file_blocks_and_content() {
        let (_t, fs) = open_sample(b"hi\n");
        let inode = fs.read_inode(12).unwrap();
        assert!(inode.is_regular());
        assert_eq!(inode.size, 3);
        assert_eq!(inode.uid, 0);
        assert_eq!(inode.mtime, 1_600_000_002);

        let blocks = fs.file_blocks(&inode).unwrap();
        assert_eq!(blocks, vec![601]);

        let data = fs.read_block(601).unwrap();
        assert_eq!(&data[..3], b"hi\n");
    }

    #[test]
    fn test_read_inode_out_of_range() {
        let (_t, fs) = open_sample(b"hi\n");
        assert!(fs.read_inode(0).is_err());
        assert!(fs.read_inode(100_000).is_err());
    }
}
