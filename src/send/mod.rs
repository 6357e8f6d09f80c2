//! Send-stream wire format
//!
//! Magic `btrfs-stream\0`, a version word, then commands. Each command is
//! `{ len: u32, cmd: u16, crc32c: u32, body }` where the CRC covers the
//! whole command with the CRC field zeroed, and the body is a sequence of
//! `{ type: u16, len: u16, value }` attributes.

#[cfg(target_os = "linux")]
pub mod ioctl;
#[cfg(target_os = "linux")]
pub mod receive;

use crate::core::{FsError, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::io::Read;

/// Stream magic, NUL included
pub const STREAM_MAGIC: &[u8; 13] = b"btrfs-stream\0";

/// Highest stream version understood
pub const STREAM_VERSION_MAX: u32 = 2;

/// Command header: len + cmd + crc
pub const CMD_HEADER_SIZE: usize = 10;

/// Attribute header: type + len
pub const TLV_HEADER_SIZE: usize = 4;

/// Longest path accepted from a stream
pub const PATH_MAX: usize = 4096;

/// Command codes
pub mod cmd {
    pub const SUBVOL: u16 = 1;
    pub const SNAPSHOT: u16 = 2;
    pub const MKFILE: u16 = 3;
    pub const MKDIR: u16 = 4;
    pub const MKNOD: u16 = 5;
    pub const MKFIFO: u16 = 6;
    pub const MKSOCK: u16 = 7;
    pub const SYMLINK: u16 = 8;
    pub const RENAME: u16 = 9;
    pub const LINK: u16 = 10;
    pub const UNLINK: u16 = 11;
    pub const RMDIR: u16 = 12;
    pub const SET_XATTR: u16 = 13;
    pub const REMOVE_XATTR: u16 = 14;
    pub const WRITE: u16 = 15;
    pub const CLONE: u16 = 16;
    pub const TRUNCATE: u16 = 17;
    pub const CHMOD: u16 = 18;
    pub const CHOWN: u16 = 19;
    pub const UTIMES: u16 = 20;
    pub const END: u16 = 21;
    pub const UPDATE_EXTENT: u16 = 22;
}

/// Attribute codes
pub mod attr {
    pub const UUID: u16 = 1;
    pub const CTRANSID: u16 = 2;
    pub const INO: u16 = 3;
    pub const SIZE: u16 = 4;
    pub const MODE: u16 = 5;
    pub const UID: u16 = 6;
    pub const GID: u16 = 7;
    pub const RDEV: u16 = 8;
    pub const CTIME: u16 = 9;
    pub const MTIME: u16 = 10;
    pub const ATIME: u16 = 11;
    pub const OTIME: u16 = 12;
    pub const XATTR_NAME: u16 = 13;
    pub const XATTR_DATA: u16 = 14;
    pub const PATH: u16 = 15;
    pub const PATH_TO: u16 = 16;
    pub const PATH_LINK: u16 = 17;
    pub const FILE_OFFSET: u16 = 18;
    pub const DATA: u16 = 19;
    pub const CLONE_UUID: u16 = 20;
    pub const CLONE_CTRANSID: u16 = 21;
    pub const CLONE_PATH: u16 = 22;
    pub const CLONE_OFFSET: u16 = 23;
    pub const CLONE_LEN: u16 = 24;
}

/// CRC of a command buffer, computed the way the stream defines it
pub fn stream_crc(buf: &[u8]) -> u32 {
    // The wire format uses the raw Castagnoli variant seeded with zero.
    !crc32c::crc32c_append(u32::MAX, buf)
}

/// One parsed command with its attributes
#[derive(Debug, Clone)]
pub struct Command {
    pub cmd: u16,
    attrs: Vec<(u16, Vec<u8>)>,
}

impl Command {
    pub fn new(cmd: u16) -> Self {
        Self {
            cmd,
            attrs: Vec::new(),
        }
    }

    pub fn push_attr(&mut self, attr_type: u16, value: Vec<u8>) {
        self.attrs.push((attr_type, value));
    }

    pub fn get(&self, attr_type: u16) -> Option<&[u8]> {
        self.attrs
            .iter()
            .find(|(t, _)| *t == attr_type)
            .map(|(_, v)| v.as_slice())
    }

    /// Fetches a mandatory attribute
    pub fn require(&self, attr_type: u16) -> Result<&[u8]> {
        self.get(attr_type).ok_or_else(|| {
            FsError::BadStream(format!(
                "command {} is missing attribute {}",
                self.cmd, attr_type
            ))
        })
    }

    pub fn get_u64(&self, attr_type: u16) -> Result<u64> {
        let v = self.require(attr_type)?;
        if v.len() != 8 {
            return Err(FsError::BadStream(format!(
                "attribute {} has length {}, expected 8",
                attr_type,
                v.len()
            )));
        }
        Ok(LittleEndian::read_u64(v))
    }

    pub fn get_uuid(&self, attr_type: u16) -> Result<[u8; 16]> {
        let v = self.require(attr_type)?;
        if v.len() != 16 {
            return Err(FsError::BadStream(format!(
                "attribute {} has length {}, expected 16",
                attr_type,
                v.len()
            )));
        }
        let mut out = [0u8; 16];
        out.copy_from_slice(v);
        Ok(out)
    }

    /// Timestamps travel as seconds plus nanoseconds
    pub fn get_timespec(&self, attr_type: u16) -> Result<(i64, u32)> {
        let v = self.require(attr_type)?;
        if v.len() != 12 {
            return Err(FsError::BadStream(format!(
                "attribute {} has length {}, expected 12",
                attr_type,
                v.len()
            )));
        }
        Ok((
            LittleEndian::read_i64(&v[0..8]),
            LittleEndian::read_u32(&v[8..12]),
        ))
    }

    /// Paths are byte strings; they never touch a native path type until
    /// joined under the destination root.
    pub fn get_path(&self, attr_type: u16) -> Result<&[u8]> {
        let v = self.require(attr_type)?;
        if v.len() >= PATH_MAX {
            return Err(FsError::BadStream(format!(
                "path attribute {} exceeds PATH_MAX",
                attr_type
            )));
        }
        Ok(v)
    }

    /// Serialises the command for the wire (used by the test senders)
    pub fn to_bytes(&self) -> Vec<u8> {
        let body_len: usize = self
            .attrs
            .iter()
            .map(|(_, v)| TLV_HEADER_SIZE + v.len())
            .sum();
        let mut out = vec![0u8; CMD_HEADER_SIZE + body_len];
        LittleEndian::write_u32(&mut out[0..4], body_len as u32);
        LittleEndian::write_u16(&mut out[4..6], self.cmd);
        // CRC field stays zero while the digest is taken.
        let mut offset = CMD_HEADER_SIZE;
        for (t, v) in &self.attrs {
            LittleEndian::write_u16(&mut out[offset..offset + 2], *t);
            LittleEndian::write_u16(&mut out[offset + 2..offset + 4], v.len() as u16);
            out[offset + 4..offset + 4 + v.len()].copy_from_slice(v);
            offset += TLV_HEADER_SIZE + v.len();
        }
        let crc = stream_crc(&out);
        LittleEndian::write_u32(&mut out[6..10], crc);
        out
    }
}

/// Reads commands off a send stream
pub struct StreamReader<R: Read> {
    input: R,
    version: u32,
    ended: bool,
}

impl<R: Read> StreamReader<R> {
    /// Consumes and validates the stream header
    pub fn new(mut input: R) -> Result<Self> {
        let mut magic = [0u8; 13];
        input
            .read_exact(&mut magic)
            .map_err(|e| FsError::BadStream(format!("short stream header: {}", e)))?;
        if &magic != STREAM_MAGIC {
            return Err(FsError::BadStream("bad stream magic".to_string()));
        }

        let mut version_buf = [0u8; 4];
        input
            .read_exact(&mut version_buf)
            .map_err(|e| FsError::BadStream(format!("short stream header: {}", e)))?;
        let version = LittleEndian::read_u32(&version_buf);
        if version == 0 || version > STREAM_VERSION_MAX {
            return Err(FsError::BadStream(format!(
                "unsupported stream version {}",
                version
            )));
        }

        Ok(Self {
            input,
            version,
            ended: false,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Next command, or `None` at a clean end of stream
    pub fn next_command(&mut self) -> Result<Option<Command>> {
        if self.ended {
            return Ok(None);
        }

        let mut header = [0u8; CMD_HEADER_SIZE];
        match self.input.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.ended = true;
                return Ok(None);
            }
            Err(e) => return Err(FsError::BadStream(format!("short command header: {}", e))),
        }

        let body_len = LittleEndian::read_u32(&header[0..4]) as usize;
        let cmd_code = LittleEndian::read_u16(&header[4..6]);
        let wire_crc = LittleEndian::read_u32(&header[6..10]);

        let mut body = vec![0u8; body_len];
        self.input
            .read_exact(&mut body)
            .map_err(|e| FsError::BadStream(format!("short command {} body: {}", cmd_code, e)))?;

        // Recompute with the CRC field zeroed.
        let mut whole = header.to_vec();
        whole[6..10].fill(0);
        whole.extend_from_slice(&body);
        let computed = stream_crc(&whole);
        if computed != wire_crc {
            return Err(FsError::BadStream(format!(
                "crc mismatch in command {}: stream says {:#010x}, computed {:#010x}",
                cmd_code, wire_crc, computed
            )));
        }

        let mut command = Command::new(cmd_code);
        let mut offset = 0usize;
        while offset < body.len() {
            if offset + TLV_HEADER_SIZE > body.len() {
                return Err(FsError::BadStream(format!(
                    "truncated attribute header in command {}",
                    cmd_code
                )));
            }
            let attr_type = LittleEndian::read_u16(&body[offset..offset + 2]);
            let attr_len = LittleEndian::read_u16(&body[offset + 2..offset + 4]) as usize;
            offset += TLV_HEADER_SIZE;
            if offset + attr_len > body.len() {
                return Err(FsError::BadStream(format!(
                    "attribute {} overruns command {}",
                    attr_type, cmd_code
                )));
            }
            command.push_attr(attr_type, body[offset..offset + attr_len].to_vec());
            offset += attr_len;
        }

        if command.cmd == cmd::END {
            self.ended = true;
        }
        Ok(Some(command))
    }
}

/// Joins a stream path under a base directory, refusing any escape.
///
/// Stream paths are forward-slash byte strings. Absolute paths, `..`
/// segments and NUL bytes are rejected outright.
pub fn join_stream_path(base: &std::path::Path, stream_path: &[u8]) -> Result<std::path::PathBuf> {
    if stream_path.contains(&0) {
        return Err(FsError::BadStream("path contains a NUL byte".to_string()));
    }
    if stream_path.first() == Some(&b'/') {
        return Err(FsError::BadStream(format!(
            "absolute path in stream: {}",
            String::from_utf8_lossy(stream_path)
        )));
    }

    let mut out = base.to_path_buf();
    for part in stream_path.split(|&b| b == b'/') {
        match part {
            b"" | b"." => continue,
            b".." => {
                return Err(FsError::BadStream(format!(
                    "path escapes the destination: {}",
                    String::from_utf8_lossy(stream_path)
                )))
            }
            _ => {
                #[cfg(unix)]
                {
                    use std::os::unix::ffi::OsStrExt;
                    out.push(std::ffi::OsStr::from_bytes(part));
                }
                #[cfg(not(unix))]
                {
                    out.push(String::from_utf8_lossy(part).as_ref());
                }
            }
        }
    }

    if out.as_os_str().len() >= PATH_MAX {
        return Err(FsError::BadStream("resolved path exceeds PATH_MAX".to_string()));
    }
    Ok(out)
}

/// Writes a stream header (for the test senders)
pub fn write_stream_header(out: &mut Vec<u8>, version: u32) {
    out.extend_from_slice(STREAM_MAGIC);
    let mut v = [0u8; 4];
    LittleEndian::write_u32(&mut v, version);
    out.extend_from_slice(&v);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn sample_stream() -> Vec<u8> {
        let mut out = Vec::new();
        write_stream_header(&mut out, 1);

        let mut subvol = Command::new(cmd::SUBVOL);
        subvol.push_attr(attr::PATH, b"snap0".to_vec());
        subvol.push_attr(attr::UUID, vec![7u8; 16]);
        subvol.push_attr(attr::CTRANSID, 9u64.to_le_bytes().to_vec());
        out.extend_from_slice(&subvol.to_bytes());

        let mut write = Command::new(cmd::WRITE);
        write.push_attr(attr::PATH, b"snap0/file".to_vec());
        write.push_attr(attr::FILE_OFFSET, 4096u64.to_le_bytes().to_vec());
        write.push_attr(attr::DATA, b"payload".to_vec());
        out.extend_from_slice(&write.to_bytes());

        out.extend_from_slice(&Command::new(cmd::END).to_bytes());
        out
    }

    #[test]
    fn test_stream_roundtrip() {
        let bytes = sample_stream();
        let mut reader = StreamReader::new(&bytes[..]).unwrap();
        assert_eq!(reader.version(), 1);

        let subvol = reader.next_command().unwrap().unwrap();
        assert_eq!(subvol.cmd, cmd::SUBVOL);
        assert_eq!(subvol.get(attr::PATH).unwrap(), b"snap0");
        assert_eq!(subvol.get_uuid(attr::UUID).unwrap(), [7u8; 16]);
        assert_eq!(subvol.get_u64(attr::CTRANSID).unwrap(), 9);

        let write = reader.next_command().unwrap().unwrap();
        assert_eq!(write.cmd, cmd::WRITE);
        assert_eq!(write.get_u64(attr::FILE_OFFSET).unwrap(), 4096);
        assert_eq!(write.get(attr::DATA).unwrap(), b"payload");

        let end = reader.next_command().unwrap().unwrap();
        assert_eq!(end.cmd, cmd::END);
        assert!(reader.next_command().unwrap().is_none());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = sample_stream();
        bytes[0] = b'X';
        match StreamReader::new(&bytes[..]) {
            Err(FsError::BadStream(_)) => (),
            _ => panic!("expected BadStream"),
        }
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut out = Vec::new();
        write_stream_header(&mut out, 99);
        assert!(StreamReader::new(&out[..]).is_err());
    }

    #[test]
    fn test_crc_flip_rejected() {
        let mut bytes = sample_stream();
        // Flip a byte inside the first command's body.
        let flip_at = STREAM_MAGIC.len() + 4 + CMD_HEADER_SIZE + 5;
        bytes[flip_at] ^= 0x20;

        let mut reader = StreamReader::new(&bytes[..]).unwrap();
        match reader.next_command() {
            Err(FsError::BadStream(msg)) => assert!(msg.contains("crc")),
            _ => panic!("expected crc failure"),
        }
    }

    #[test]
    fn test_truncated_body_rejected() {
        let bytes = sample_stream();
        let cut = bytes.len() - 4;
        let mut reader = StreamReader::new(&bytes[..cut]).unwrap();
        reader.next_command().unwrap();
        reader.next_command().unwrap();
        assert!(reader.next_command().is_err());
    }

    #[test]
    fn test_missing_attribute() {
        let command = Command::new(cmd::WRITE);
        match command.require(attr::PATH) {
            Err(FsError::BadStream(_)) => (),
            _ => panic!("expected BadStream"),
        }
    }

    #[test]
    fn test_stream_crc_empty_is_zero() {
        assert_eq!(stream_crc(&[]), 0);
    }

    #[test]
    fn test_join_stream_path_normal() {
        let base = Path::new("/mnt/dest");
        let joined = join_stream_path(base, b"dir/sub/file.txt").unwrap();
        assert_eq!(joined, Path::new("/mnt/dest/dir/sub/file.txt"));
    }

    #[test]
    fn test_join_stream_path_rejects_escape() {
        let base = Path::new("/mnt/dest");
        for bad in [
            b"../outside".as_slice(),
            b"dir/../../outside",
            b"/etc/passwd",
            b"dir/\0byte",
        ] {
            match join_stream_path(base, bad) {
                Err(FsError::BadStream(_)) => (),
                other => panic!(
                    "path {:?} should be rejected, got {:?}",
                    String::from_utf8_lossy(bad),
                    other.map(|p| p.display().to_string())
                ),
            }
        }
    }

    #[test]
    fn test_join_stream_path_length_limit() {
        let base = Path::new("/mnt/dest");
        let long = vec![b'a'; PATH_MAX];
        assert!(join_stream_path(base, &long).is_err());
    }
}
