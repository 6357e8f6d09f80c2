//! Privileged ioctl bindings the receive side needs
//!
//! Only the calls receive actually issues are bound: subvolume and snapshot
//! creation, range clone, the received-subvol stamp, subvolume flags, tree
//! search and inode path lookup. Argument structs mirror the kernel UAPI
//! layouts byte for byte.

use crate::core::{FsError, Result};
use std::os::unix::io::RawFd;

const IOCTL_MAGIC: u64 = 0x94;

const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const fn ioc(dir: u64, nr: u64, size: usize) -> u64 {
    (dir << 30) | ((size as u64) << 16) | (IOCTL_MAGIC << 8) | nr
}

/// `struct btrfs_ioctl_vol_args`
#[repr(C)]
pub struct VolArgs {
    pub fd: i64,
    pub name: [u8; 4088],
}

impl VolArgs {
    pub fn new(fd: RawFd, name: &[u8]) -> Result<Self> {
        if name.len() >= 4088 {
            return Err(FsError::BadStream("subvolume name too long".to_string()));
        }
        let mut args = Self {
            fd: fd as i64,
            name: [0; 4088],
        };
        args.name[..name.len()].copy_from_slice(name);
        Ok(args)
    }
}

/// `struct btrfs_ioctl_vol_args_v2`
#[repr(C)]
pub struct VolArgsV2 {
    pub fd: i64,
    pub transid: u64,
    pub flags: u64,
    pub unused: [u64; 4],
    pub name: [u8; 4040],
}

impl VolArgsV2 {
    pub fn new(fd: RawFd, name: &[u8]) -> Result<Self> {
        if name.len() >= 4040 {
            return Err(FsError::BadStream("subvolume name too long".to_string()));
        }
        let mut args = Self {
            fd: fd as i64,
            transid: 0,
            flags: 0,
            unused: [0; 4],
            name: [0; 4040],
        };
        args.name[..name.len()].copy_from_slice(name);
        Ok(args)
    }
}

/// `struct btrfs_ioctl_clone_range_args`
#[repr(C)]
pub struct CloneRangeArgs {
    pub src_fd: i64,
    pub src_offset: u64,
    pub src_length: u64,
    pub dest_offset: u64,
}

/// `struct btrfs_ioctl_timespec`
#[repr(C)]
#[derive(Default, Clone, Copy)]
pub struct IoctlTimespec {
    pub sec: u64,
    pub nsec: u32,
}

/// `struct btrfs_ioctl_received_subvol_args`
#[repr(C)]
pub struct ReceivedSubvolArgs {
    pub uuid: [u8; 16],
    pub stransid: u64,
    pub rtransid: u64,
    pub stime: IoctlTimespec,
    pub rtime: IoctlTimespec,
    pub flags: u64,
    pub reserved: [u64; 16],
}

/// `struct btrfs_ioctl_search_key`
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SearchKey {
    pub tree_id: u64,
    pub min_objectid: u64,
    pub max_objectid: u64,
    pub min_offset: u64,
    pub max_offset: u64,
    pub min_transid: u64,
    pub max_transid: u64,
    pub min_type: u32,
    pub max_type: u32,
    pub nr_items: u32,
    pub unused: u32,
    pub unused1: u64,
    pub unused2: u64,
    pub unused3: u64,
    pub unused4: u64,
}

/// `struct btrfs_ioctl_search_header`
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SearchHeader {
    pub transid: u64,
    pub objectid: u64,
    pub offset: u64,
    pub item_type: u32,
    pub len: u32,
}

pub const SEARCH_BUF_SIZE: usize = 4096 - std::mem::size_of::<SearchKey>();

/// `struct btrfs_ioctl_search_args`
#[repr(C)]
pub struct SearchArgs {
    pub key: SearchKey,
    pub buf: [u8; SEARCH_BUF_SIZE],
}

/// `struct btrfs_ioctl_ino_lookup_args`
#[repr(C)]
pub struct InoLookupArgs {
    pub treeid: u64,
    pub objectid: u64,
    pub name: [u8; 4080],
}

/// Subvolume read-only flag for SUBVOL_SETFLAGS
pub const SUBVOL_RDONLY: u64 = 1 << 1;

pub fn ioc_subvol_create() -> u64 {
    ioc(IOC_WRITE, 14, std::mem::size_of::<VolArgs>())
}

pub fn ioc_snap_create_v2() -> u64 {
    ioc(IOC_WRITE, 23, std::mem::size_of::<VolArgsV2>())
}

pub fn ioc_clone_range() -> u64 {
    ioc(IOC_WRITE, 13, std::mem::size_of::<CloneRangeArgs>())
}

pub fn ioc_set_received_subvol() -> u64 {
    ioc(
        IOC_READ | IOC_WRITE,
        37,
        std::mem::size_of::<ReceivedSubvolArgs>(),
    )
}

pub fn ioc_subvol_getflags() -> u64 {
    ioc(IOC_READ, 25, std::mem::size_of::<u64>())
}

pub fn ioc_subvol_setflags() -> u64 {
    ioc(IOC_WRITE, 26, std::mem::size_of::<u64>())
}

pub fn ioc_tree_search() -> u64 {
    ioc(IOC_READ | IOC_WRITE, 17, std::mem::size_of::<SearchArgs>())
}

pub fn ioc_ino_lookup() -> u64 {
    ioc(IOC_READ | IOC_WRITE, 18, std::mem::size_of::<InoLookupArgs>())
}

/// Issues an ioctl, translating errno into an I/O error
pub fn issue<T>(fd: RawFd, request: u64, args: &mut T) -> Result<()> {
    let ret = unsafe { libc::ioctl(fd, request as libc::c_ulong, args as *mut T) };
    if ret < 0 {
        return Err(FsError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes_match_uapi() {
        assert_eq!(std::mem::size_of::<VolArgs>(), 4096);
        assert_eq!(std::mem::size_of::<VolArgsV2>(), 4096);
        assert_eq!(std::mem::size_of::<CloneRangeArgs>(), 32);
        assert_eq!(std::mem::size_of::<SearchKey>(), 104);
        assert_eq!(std::mem::size_of::<SearchHeader>(), 32);
        assert_eq!(std::mem::size_of::<SearchArgs>(), 4096);
        assert_eq!(std::mem::size_of::<InoLookupArgs>(), 4096);
        assert_eq!(std::mem::size_of::<ReceivedSubvolArgs>(), 200);
    }

    #[test]
    fn test_request_numbers() {
        // dir | size | magic | nr, little pieces in the right bit positions
        let req = ioc_clone_range();
        assert_eq!(req & 0xFF, 13);
        assert_eq!((req >> 8) & 0xFF, 0x94);
        assert_eq!((req >> 16) & 0x3FFF, 32);
        assert_eq!(req >> 30, IOC_WRITE);

        let req = ioc_set_received_subvol();
        assert_eq!(req & 0xFF, 37);
        assert_eq!(req >> 30, IOC_READ | IOC_WRITE);
    }

    #[test]
    fn test_vol_args_name_bound() {
        assert!(VolArgs::new(0, &[b'x'; 4088]).is_err());
        let args = VolArgs::new(0, b"snap").unwrap();
        assert_eq!(&args.name[..5], b"snap\0");
    }
}
