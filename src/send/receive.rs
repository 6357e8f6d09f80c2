//! Receive side of the replication stream
//!
//! Parses commands and reproduces the sender's tree in a mounted
//! destination through ordinary syscalls plus the privileged subvolume
//! ioctls. The engine never touches the destination's block device.

use super::ioctl::{self, ReceivedSubvolArgs, SearchArgs, SearchKey};
use super::{attr, cmd, join_stream_path, Command, StreamReader};
use crate::core::roots::RootItem;
use crate::core::{item_type, objectid, CancelToken, FsError, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// The capability xattr cleared by chown on most kernels
const CAPABILITY_XATTR: &[u8] = b"security.capability";

/// Options for a receive run
pub struct ReceiveOptions {
    /// Commands allowed to fail before the stream is abandoned
    pub max_errors: usize,
    /// Chroot into the destination before applying commands. An isolation
    /// convenience, not a security boundary.
    pub chroot: bool,
    pub cancel: CancelToken,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_errors: 1,
            chroot: false,
            cancel: CancelToken::new(),
        }
    }
}

/// Outcome of a receive run
pub struct ReceiveStats {
    pub commands: u64,
    pub errors: u64,
    pub subvols: Vec<PathBuf>,
}

/// Locates the mount root of the filesystem holding `path`
fn find_mount_root(path: &Path) -> Result<PathBuf> {
    let path = std::fs::canonicalize(path)?;
    let dev = std::fs::metadata(&path)?.dev();
    let mut root = path.clone();
    while let Some(parent) = root.parent() {
        if std::fs::metadata(parent)?.dev() != dev {
            break;
        }
        root = parent.to_path_buf();
    }
    Ok(root)
}

/// Subvolume lookup over the mounted filesystem's UUID and root trees
struct SubvolSearch {
    mount: File,
    mount_root: PathBuf,
}

impl SubvolSearch {
    fn new(mount_root: &Path) -> Result<Self> {
        Ok(Self {
            mount: File::open(mount_root)?,
            mount_root: mount_root.to_path_buf(),
        })
    }

    fn tree_search_one(&self, tree_id: u64, objectid: u64, item_type: u8, offset: u64) -> Result<Option<Vec<u8>>> {
        let mut args = SearchArgs {
            key: SearchKey {
                tree_id,
                min_objectid: objectid,
                max_objectid: objectid,
                min_offset: offset,
                max_offset: offset,
                min_transid: 0,
                max_transid: u64::MAX,
                min_type: item_type as u32,
                max_type: item_type as u32,
                nr_items: 1,
                unused: 0,
                unused1: 0,
                unused2: 0,
                unused3: 0,
                unused4: 0,
            },
            buf: [0u8; ioctl::SEARCH_BUF_SIZE],
        };
        ioctl::issue(self.mount.as_raw_fd(), ioctl::ioc_tree_search(), &mut args)?;
        if args.key.nr_items == 0 {
            return Ok(None);
        }
        let hdr_size = std::mem::size_of::<ioctl::SearchHeader>();
        let len = LittleEndian::read_u32(&args.buf[28..32]) as usize;
        Ok(Some(args.buf[hdr_size..hdr_size + len].to_vec()))
    }

    /// Resolves a received UUID to a local subvolume id. The plain-UUID
    /// fallback is deliberately refused: a local subvolume can share a UUID
    /// without being the stream's parent.
    fn subvol_by_received_uuid(&self, uuid: &[u8; 16], ctransid: u64) -> Result<u64> {
        let hi = LittleEndian::read_u64(&uuid[0..8]);
        let lo = LittleEndian::read_u64(&uuid[8..16]);
        let data = self
            .tree_search_one(objectid::UUID_TREE, hi, item_type::UUID_RECEIVED_SUBVOL, lo)?
            .ok_or_else(|| {
                FsError::NotFound(format!(
                    "no subvolume with received uuid {}",
                    uuid::Uuid::from_bytes(*uuid)
                ))
            })?;
        if data.len() < 8 {
            return Err(FsError::CorruptRead("short uuid tree entry".to_string()));
        }
        let subvol_id = LittleEndian::read_u64(&data[0..8]);

        // Cross-check the generation the sender pinned.
        let item = self
            .tree_search_one(objectid::ROOT_TREE, subvol_id, item_type::ROOT_ITEM, 0)?
            .ok_or_else(|| FsError::NotFound(format!("root item for subvol {}", subvol_id)))?;
        let root_item = RootItem::from_bytes(&item)?;
        if root_item.stransid != ctransid {
            // Copy the packed field before formatting borrows it.
            return Err(FsError::NotFound(format!(
                "subvol {} has stransid {}, stream expects {}",
                subvol_id,
                { root_item.stransid },
                ctransid
            )));
        }
        Ok(subvol_id)
    }

    /// Builds the path of a subvolume relative to the mount root by
    /// walking its root backrefs.
    fn subvol_path(&self, mut subvol_id: u64) -> Result<PathBuf> {
        let mut parts: Vec<Vec<u8>> = Vec::new();
        while subvol_id != objectid::FS_TREE {
            let backref = self
                .search_backref(subvol_id)?
                .ok_or_else(|| FsError::NotFound(format!("root backref for subvol {}", subvol_id)))?;
            let (parent_id, root_ref) = backref;
            // Directory path of the anchor inside the parent subvolume.
            let dir_path = self.ino_lookup(parent_id, root_ref.0)?;
            let mut name = dir_path;
            name.extend_from_slice(&root_ref.1);
            parts.push(name);
            subvol_id = parent_id;
        }

        let mut out = self.mount_root.clone();
        for part in parts.iter().rev() {
            out.push(std::ffi::OsStr::from_bytes(part));
        }
        Ok(out)
    }

    /// Returns `(parent_id, (dirid, name))` for the subvolume
    fn search_backref(&self, subvol_id: u64) -> Result<Option<(u64, (u64, Vec<u8>))>> {
        let mut args = SearchArgs {
            key: SearchKey {
                tree_id: objectid::ROOT_TREE,
                min_objectid: subvol_id,
                max_objectid: subvol_id,
                min_offset: 0,
                max_offset: u64::MAX,
                min_transid: 0,
                max_transid: u64::MAX,
                min_type: item_type::ROOT_BACKREF as u32,
                max_type: item_type::ROOT_BACKREF as u32,
                nr_items: 1,
                unused: 0,
                unused1: 0,
                unused2: 0,
                unused3: 0,
                unused4: 0,
            },
            buf: [0u8; ioctl::SEARCH_BUF_SIZE],
        };
        ioctl::issue(self.mount.as_raw_fd(), ioctl::ioc_tree_search(), &mut args)?;
        if args.key.nr_items == 0 {
            return Ok(None);
        }
        // The backref key is (subvol, ROOT_BACKREF, parent); the parent
        // rides in the header's offset field.
        let parent_id = LittleEndian::read_u64(&args.buf[16..24]);
        let len = LittleEndian::read_u32(&args.buf[28..32]) as usize;
        let hdr = std::mem::size_of::<ioctl::SearchHeader>();
        let payload = &args.buf[hdr..hdr + len];
        let root_ref = crate::core::roots::RootRef::from_bytes(payload)?;
        Ok(Some((parent_id, (root_ref.dirid, root_ref.name))))
    }

    /// Path of a directory inode inside a subvolume, trailing slash kept
    fn ino_lookup(&self, treeid: u64, dirid: u64) -> Result<Vec<u8>> {
        let mut args = ioctl::InoLookupArgs {
            treeid,
            objectid: dirid,
            name: [0u8; 4080],
        };
        ioctl::issue(self.mount.as_raw_fd(), ioctl::ioc_ino_lookup(), &mut args)?;
        let end = args.name.iter().position(|&b| b == 0).unwrap_or(0);
        Ok(args.name[..end].to_vec())
    }
}

/// State carried across the commands of one receive run
pub struct Receiver {
    dest: PathBuf,
    mount_root: PathBuf,
    search: SubvolSearch,
    cur_subvol: Option<CurrentSubvol>,
    /// `security.capability` queued for replay after the next chown
    cached_capability: Option<(PathBuf, Vec<u8>)>,
    opts: ReceiveOptions,
    stats: ReceiveStats,
}

struct CurrentSubvol {
    path: PathBuf,
    uuid: [u8; 16],
    ctransid: u64,
}

impl Receiver {
    pub fn new(dest: &Path, opts: ReceiveOptions) -> Result<Self> {
        let mut dest = std::fs::canonicalize(dest)?;
        let mut mount_root = find_mount_root(&dest)?;
        // The search handle is opened before any chroot; the fd stays
        // valid afterwards.
        let search = SubvolSearch::new(&mount_root)?;

        if opts.chroot {
            std::os::unix::fs::chroot(&dest)?;
            std::env::set_current_dir("/")?;
            dest = PathBuf::from("/");
            mount_root = PathBuf::from("/");
        }

        Ok(Self {
            dest,
            mount_root,
            search,
            cur_subvol: None,
            cached_capability: None,
            opts,
            stats: ReceiveStats {
                commands: 0,
                errors: 0,
                subvols: Vec::new(),
            },
        })
    }

    /// Applies a whole stream
    pub fn apply<R: Read>(mut self, input: R) -> Result<ReceiveStats> {
        let mut reader = StreamReader::new(input)?;

        while let Some(command) = reader.next_command()? {
            self.opts.cancel.check()?;
            self.stats.commands += 1;

            match self.apply_command(&command) {
                Ok(()) => {}
                // Malformed input is fatal regardless of the error budget.
                Err(e @ FsError::BadStream(_)) | Err(e @ FsError::Cancelled) => return Err(e),
                Err(e) => {
                    self.stats.errors += 1;
                    tracing::warn!(cmd = command.cmd, "command failed: {}", e);
                    if self.stats.errors >= self.opts.max_errors as u64 {
                        return Err(e);
                    }
                }
            }
        }

        Ok(self.stats)
    }

    /// Resolves a stream path inside the current subvolume
    fn subvol_path(&self, stream_path: &[u8]) -> Result<PathBuf> {
        let subvol = self
            .cur_subvol
            .as_ref()
            .ok_or_else(|| FsError::BadStream("command before subvol/snapshot".to_string()))?;
        join_stream_path(&subvol.path, stream_path)
    }

    fn apply_command(&mut self, command: &Command) -> Result<()> {
        match command.cmd {
            cmd::SUBVOL => self.process_subvol(command),
            cmd::SNAPSHOT => self.process_snapshot(command),
            cmd::MKFILE => {
                let path = self.subvol_path(command.get_path(attr::PATH)?)?;
                File::create(&path)?;
                Ok(())
            }
            cmd::MKDIR => {
                let path = self.subvol_path(command.get_path(attr::PATH)?)?;
                std::fs::create_dir(&path)?;
                Ok(())
            }
            cmd::MKNOD => {
                let path = self.subvol_path(command.get_path(attr::PATH)?)?;
                let mode = command.get_u64(attr::MODE)?;
                let rdev = command.get_u64(attr::RDEV)?;
                mknod(&path, mode as libc::mode_t, rdev as libc::dev_t)
            }
            cmd::MKFIFO => {
                let path = self.subvol_path(command.get_path(attr::PATH)?)?;
                mknod(&path, libc::S_IFIFO | 0o600, 0)
            }
            cmd::MKSOCK => {
                let path = self.subvol_path(command.get_path(attr::PATH)?)?;
                mknod(&path, libc::S_IFSOCK | 0o600, 0)
            }
            cmd::SYMLINK => {
                let path = self.subvol_path(command.get_path(attr::PATH)?)?;
                let target = command.get_path(attr::PATH_LINK)?;
                std::os::unix::fs::symlink(std::ffi::OsStr::from_bytes(target), &path)?;
                Ok(())
            }
            cmd::RENAME => {
                let from = self.subvol_path(command.get_path(attr::PATH)?)?;
                let to = self.subvol_path(command.get_path(attr::PATH_TO)?)?;
                std::fs::rename(from, to)?;
                Ok(())
            }
            cmd::LINK => {
                let path = self.subvol_path(command.get_path(attr::PATH)?)?;
                let target = self.subvol_path(command.get_path(attr::PATH_LINK)?)?;
                std::fs::hard_link(target, path)?;
                Ok(())
            }
            cmd::UNLINK => {
                let path = self.subvol_path(command.get_path(attr::PATH)?)?;
                std::fs::remove_file(path)?;
                Ok(())
            }
            cmd::RMDIR => {
                let path = self.subvol_path(command.get_path(attr::PATH)?)?;
                std::fs::remove_dir(path)?;
                Ok(())
            }
            cmd::WRITE => {
                let path = self.subvol_path(command.get_path(attr::PATH)?)?;
                let offset = command.get_u64(attr::FILE_OFFSET)?;
                let data = command.require(attr::DATA)?;
                let file = OpenOptions::new().write(true).open(&path)?;
                file.write_all_at(data, offset)?;
                Ok(())
            }
            cmd::CLONE => self.process_clone(command),
            cmd::SET_XATTR => {
                let path = self.subvol_path(command.get_path(attr::PATH)?)?;
                let name = command.require(attr::XATTR_NAME)?;
                let data = command.require(attr::XATTR_DATA)?;
                if name == CAPABILITY_XATTR {
                    // Chown clears capabilities; queue it for replay.
                    self.cached_capability = Some((path.clone(), data.to_vec()));
                }
                set_xattr(&path, name, data)
            }
            cmd::REMOVE_XATTR => {
                let path = self.subvol_path(command.get_path(attr::PATH)?)?;
                let name = command.require(attr::XATTR_NAME)?;
                remove_xattr(&path, name)
            }
            cmd::TRUNCATE => {
                let path = self.subvol_path(command.get_path(attr::PATH)?)?;
                let size = command.get_u64(attr::SIZE)?;
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(size)?;
                Ok(())
            }
            cmd::CHMOD => {
                let path = self.subvol_path(command.get_path(attr::PATH)?)?;
                let mode = command.get_u64(attr::MODE)?;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode as u32))?;
                Ok(())
            }
            cmd::CHOWN => {
                let path = self.subvol_path(command.get_path(attr::PATH)?)?;
                let uid = command.get_u64(attr::UID)?;
                let gid = command.get_u64(attr::GID)?;
                lchown(&path, uid as libc::uid_t, gid as libc::gid_t)?;

                // Re-apply a capability the chown just clobbered.
                if let Some((cap_path, data)) = self.cached_capability.take() {
                    if cap_path == path {
                        set_xattr(&path, CAPABILITY_XATTR, &data)?;
                    } else {
                        self.cached_capability = Some((cap_path, data));
                    }
                }
                Ok(())
            }
            cmd::UTIMES => {
                let path = self.subvol_path(command.get_path(attr::PATH)?)?;
                let atime = command.get_timespec(attr::ATIME)?;
                let mtime = command.get_timespec(attr::MTIME)?;
                // ctime travels in the stream but cannot be set from
                // userspace; applying mtime updates it implicitly.
                let _ctime = command.get_timespec(attr::CTIME)?;
                utimes_nofollow(&path, atime, mtime)
            }
            cmd::UPDATE_EXTENT => {
                // Metadata-only streams announce extents without data.
                Ok(())
            }
            cmd::END => self.process_end(),
            other => Err(FsError::BadStream(format!("unknown command {}", other))),
        }
    }

    fn process_subvol(&mut self, command: &Command) -> Result<()> {
        let rel = command.get_path(attr::PATH)?;
        let uuid = command.get_uuid(attr::UUID)?;
        let ctransid = command.get_u64(attr::CTRANSID)?;

        let path = join_stream_path(&self.dest, rel)?;
        let name = path
            .file_name()
            .ok_or_else(|| FsError::BadStream("empty subvolume name".to_string()))?;
        let parent = File::open(path.parent().unwrap_or(self.dest.as_path()))?;

        let mut args = ioctl::VolArgs::new(parent.as_raw_fd(), name.as_bytes())?;
        ioctl::issue(parent.as_raw_fd(), ioctl::ioc_subvol_create(), &mut args)?;

        tracing::info!(path = %path.display(), "created subvolume");
        self.stats.subvols.push(path.clone());
        self.cur_subvol = Some(CurrentSubvol {
            path,
            uuid,
            ctransid,
        });
        Ok(())
    }

    fn process_snapshot(&mut self, command: &Command) -> Result<()> {
        let rel = command.get_path(attr::PATH)?;
        let uuid = command.get_uuid(attr::UUID)?;
        let ctransid = command.get_u64(attr::CTRANSID)?;
        let parent_uuid = command.get_uuid(attr::CLONE_UUID)?;
        let parent_ctransid = command.get_u64(attr::CLONE_CTRANSID)?;

        let path = join_stream_path(&self.dest, rel)?;
        let name = path
            .file_name()
            .ok_or_else(|| FsError::BadStream("empty snapshot name".to_string()))?;

        // The incremental parent is located strictly by received UUID.
        let parent_id = self
            .search
            .subvol_by_received_uuid(&parent_uuid, parent_ctransid)?;
        let parent_path = self.search.subvol_path(parent_id)?;
        if !parent_path.starts_with(&self.mount_root) {
            return Err(FsError::NotFound(format!(
                "parent subvolume {} is outside the destination filesystem",
                parent_path.display()
            )));
        }

        let src = File::open(&parent_path)?;
        let dst_dir = File::open(path.parent().unwrap_or(self.dest.as_path()))?;
        let mut args = ioctl::VolArgsV2::new(src.as_raw_fd(), name.as_bytes())?;
        ioctl::issue(dst_dir.as_raw_fd(), ioctl::ioc_snap_create_v2(), &mut args)?;

        tracing::info!(
            path = %path.display(),
            parent = %parent_path.display(),
            "created snapshot"
        );
        self.stats.subvols.push(path.clone());
        self.cur_subvol = Some(CurrentSubvol {
            path,
            uuid,
            ctransid,
        });
        Ok(())
    }

    fn process_clone(&mut self, command: &Command) -> Result<()> {
        let path = self.subvol_path(command.get_path(attr::PATH)?)?;
        let offset = command.get_u64(attr::FILE_OFFSET)?;
        let len = command.get_u64(attr::CLONE_LEN)?;
        let clone_uuid = command.get_uuid(attr::CLONE_UUID)?;
        let clone_ctransid = command.get_u64(attr::CLONE_CTRANSID)?;
        let clone_rel = command.get_path(attr::CLONE_PATH)?;
        let clone_offset = command.get_u64(attr::CLONE_OFFSET)?;

        let subvol = self
            .cur_subvol
            .as_ref()
            .ok_or_else(|| FsError::BadStream("clone before subvol".to_string()))?;

        // Clone from the subvolume being received, or resolve the source.
        let src_path = if clone_uuid == subvol.uuid && clone_ctransid == subvol.ctransid {
            join_stream_path(&subvol.path, clone_rel)?
        } else {
            let src_id = self
                .search
                .subvol_by_received_uuid(&clone_uuid, clone_ctransid)?;
            let src_subvol = self.search.subvol_path(src_id)?;
            join_stream_path(&src_subvol, clone_rel)?
        };

        let src = File::open(&src_path)?;
        let dst = OpenOptions::new().write(true).open(&path)?;
        let mut args = ioctl::CloneRangeArgs {
            src_fd: src.as_raw_fd() as i64,
            src_offset: clone_offset,
            src_length: len,
            dest_offset: offset,
        };
        ioctl::issue(dst.as_raw_fd(), ioctl::ioc_clone_range(), &mut args)?;
        Ok(())
    }

    fn process_end(&mut self) -> Result<()> {
        let subvol = match self.cur_subvol.take() {
            Some(s) => s,
            None => return Ok(()),
        };

        let dir = File::open(&subvol.path)?;

        // Bind the sender's identity so the next incremental stream can
        // find this subvolume as its parent.
        let mut args = ReceivedSubvolArgs {
            uuid: subvol.uuid,
            stransid: subvol.ctransid,
            rtransid: 0,
            stime: Default::default(),
            rtime: Default::default(),
            flags: 0,
            reserved: [0; 16],
        };
        ioctl::issue(dir.as_raw_fd(), ioctl::ioc_set_received_subvol(), &mut args)?;

        let mut flags: u64 = 0;
        ioctl::issue(dir.as_raw_fd(), ioctl::ioc_subvol_getflags(), &mut flags)?;
        flags |= ioctl::SUBVOL_RDONLY;
        ioctl::issue(dir.as_raw_fd(), ioctl::ioc_subvol_setflags(), &mut flags)?;

        tracing::info!(path = %subvol.path.display(), "subvolume received");
        Ok(())
    }
}

/// Runs a receive: parse `input`, materialise into `dest`
pub fn receive<R: Read, P: AsRef<Path>>(input: R, dest: P, opts: ReceiveOptions) -> Result<ReceiveStats> {
    let receiver = Receiver::new(dest.as_ref(), opts)?;
    receiver.apply(input)
}

fn cpath(path: &Path) -> Result<std::ffi::CString> {
    std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| FsError::BadStream("path contains a NUL byte".to_string()))
}

fn mknod(path: &Path, mode: libc::mode_t, dev: libc::dev_t) -> Result<()> {
    let c = cpath(path)?;
    let ret = unsafe { libc::mknod(c.as_ptr(), mode, dev) };
    if ret < 0 {
        return Err(FsError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn lchown(path: &Path, uid: libc::uid_t, gid: libc::gid_t) -> Result<()> {
    let c = cpath(path)?;
    let ret = unsafe { libc::lchown(c.as_ptr(), uid, gid) };
    if ret < 0 {
        return Err(FsError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn set_xattr(path: &Path, name: &[u8], value: &[u8]) -> Result<()> {
    let c = cpath(path)?;
    let cname = std::ffi::CString::new(name)
        .map_err(|_| FsError::BadStream("xattr name contains a NUL byte".to_string()))?;
    let ret = unsafe {
        libc::lsetxattr(
            c.as_ptr(),
            cname.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            0,
        )
    };
    if ret < 0 {
        return Err(FsError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn remove_xattr(path: &Path, name: &[u8]) -> Result<()> {
    let c = cpath(path)?;
    let cname = std::ffi::CString::new(name)
        .map_err(|_| FsError::BadStream("xattr name contains a NUL byte".to_string()))?;
    let ret = unsafe { libc::lremovexattr(c.as_ptr(), cname.as_ptr()) };
    if ret < 0 {
        return Err(FsError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Sets atime and mtime with nanosecond precision, symlinks included
fn utimes_nofollow(path: &Path, atime: (i64, u32), mtime: (i64, u32)) -> Result<()> {
    let c = cpath(path)?;
    let times = [
        libc::timespec {
            tv_sec: atime.0 as libc::time_t,
            tv_nsec: atime.1 as libc::c_long,
        },
        libc::timespec {
            tv_sec: mtime.0 as libc::time_t,
            tv_nsec: mtime.1 as libc::c_long,
        },
    ];
    let ret = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if ret < 0 {
        return Err(FsError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_mount_root_of_tmp() {
        // The returned root must be a prefix of the query.
        let dir = tempfile::tempdir().unwrap();
        let root = find_mount_root(dir.path()).unwrap();
        assert!(std::fs::canonicalize(dir.path()).unwrap().starts_with(&root));
    }

    #[test]
    fn test_receiver_requires_subvol_first() {
        // A stream whose first command is a write must fail as BadStream
        // without touching the destination.
        let dir = tempfile::tempdir().unwrap();

        let mut stream = Vec::new();
        super::super::write_stream_header(&mut stream, 1);
        let mut write = Command::new(cmd::WRITE);
        write.push_attr(attr::PATH, b"file".to_vec());
        write.push_attr(attr::FILE_OFFSET, 0u64.to_le_bytes().to_vec());
        write.push_attr(attr::DATA, b"x".to_vec());
        stream.extend_from_slice(&write.to_bytes());
        stream.extend_from_slice(&Command::new(cmd::END).to_bytes());

        let result = receive(&stream[..], dir.path(), ReceiveOptions::default());
        match result {
            Err(FsError::BadStream(_)) => (),
            other => panic!("expected BadStream, got {:?}", other.map(|_| ())),
        }
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_receiver_rejects_escaping_stream() {
        // Path escape attempts are fatal and leave the destination alone.
        let dir = tempfile::tempdir().unwrap();

        let mut stream = Vec::new();
        super::super::write_stream_header(&mut stream, 1);
        let mut subvol = Command::new(cmd::SUBVOL);
        subvol.push_attr(attr::PATH, b"../escape".to_vec());
        subvol.push_attr(attr::UUID, vec![1u8; 16]);
        subvol.push_attr(attr::CTRANSID, 1u64.to_le_bytes().to_vec());
        stream.extend_from_slice(&subvol.to_bytes());

        let result = receive(&stream[..], dir.path(), ReceiveOptions::default());
        match result {
            Err(FsError::BadStream(_)) => (),
            other => panic!("expected BadStream, got {:?}", other.map(|_| ())),
        }
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }
}
