//! Userspace BTRFS toolkit
//!
//! Reads, modifies and writes complete filesystem images without the
//! running kernel: the engine behind mkfs, in-place conversion from ext2,
//! the send-stream receiver, metadata dump/restore and offline repair.
//!
//! # Architecture
//!
//! - [`blockdev`]: positional I/O over image files and raw devices
//! - [`core`]: the on-disk engine (cache, chunk map, COW B-trees,
//!   transactions, superblocks)
//! - [`mkfs`]: bootstrap of a minimal valid image
//! - [`convert`]: in-place conversion of a foreign filesystem, reversible
//! - [`send`]: send-stream parsing and the receive side
//! - [`image`]: metadata dump and restore
//! - [`check`]: read-only verification walker
//! - [`rescue`]: chunk tree recovery from a device scan
//! - [`restore`]: file extraction from unmountable images

pub mod blockdev;
pub mod check;
pub mod convert;
pub mod core;
pub mod image;
pub mod mkfs;
pub mod rescue;
pub mod restore;
pub mod send;

pub use crate::core::{CancelToken, FsError, FsInfo, OpenOptions};
pub use blockdev::{BlockDevice, BlockDeviceError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes shared by the binaries
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const USAGE: i32 = 1;
    pub const WARNINGS: i32 = 2;
    pub const FAILURE: i32 = 3;
    pub const CANCELLED: i32 = 4;

    /// Maps an error to its documented exit code
    pub fn for_error(err: &crate::core::FsError) -> i32 {
        match err {
            crate::core::FsError::Cancelled => CANCELLED,
            _ => FAILURE,
        }
    }

    /// Maps a binary's error report to its exit code: the engine error is
    /// fished back out of the context chain, anything else is a plain
    /// failure.
    pub fn for_report(err: &anyhow::Error) -> i32 {
        match err.downcast_ref::<crate::core::FsError>() {
            Some(e) => for_error(e),
            None => FAILURE,
        }
    }
}
