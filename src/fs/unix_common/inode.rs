//! Unix inode mode helpers shared by the filesystem decoders.
//!
//! Provides file type detection from mode bits, `ls`-style permission
//! strings, device number splitting and timestamp formatting.

use chrono::DateTime;
use serde::Serialize;

const S_IFMT: u32 = 0o170000;
const S_IFSOCK: u32 = 0o140000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;
const S_IFBLK: u32 = 0o060000;
const S_IFDIR: u32 = 0o040000;
const S_IFCHR: u32 = 0o020000;
const S_IFIFO: u32 = 0o010000;

const S_ISUID: u32 = 0o4000;
const S_ISGID: u32 = 0o2000;
const S_ISVTX: u32 = 0o1000;

/// Unix file type extracted from mode bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnixFileType {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
    Unknown,
}

impl UnixFileType {
    pub fn name(&self) -> &'static str {
        match self {
            UnixFileType::Regular => "regular file",
            UnixFileType::Directory => "directory",
            UnixFileType::Symlink => "symlink",
            UnixFileType::BlockDevice => "block device",
            UnixFileType::CharDevice => "char device",
            UnixFileType::Fifo => "fifo",
            UnixFileType::Socket => "socket",
            UnixFileType::Unknown => "unknown",
        }
    }
}

/// Extract the file type from raw Unix mode bits.
pub fn unix_file_type(mode: u32) -> UnixFileType {
    match mode & S_IFMT {
        S_IFREG => UnixFileType::Regular,
        S_IFDIR => UnixFileType::Directory,
        S_IFLNK => UnixFileType::Symlink,
        S_IFBLK => UnixFileType::BlockDevice,
        S_IFCHR => UnixFileType::CharDevice,
        S_IFIFO => UnixFileType::Fifo,
        S_IFSOCK => UnixFileType::Socket,
        _ => UnixFileType::Unknown,
    }
}

/// Render raw Unix mode bits as a 10-character permission string (e.g. `drwxr-xr-x`).
pub fn unix_mode_string(mode: u32) -> String {
    let type_char = match unix_file_type(mode) {
        UnixFileType::Directory => 'd',
        UnixFileType::Symlink => 'l',
        UnixFileType::BlockDevice => 'b',
        UnixFileType::CharDevice => 'c',
        UnixFileType::Fifo => 'p',
        UnixFileType::Socket => 's',
        UnixFileType::Regular | UnixFileType::Unknown => '-',
    };

    // (shift of the rwx triplet, special bit, char when x set, char when x clear)
    let triplets = [
        (6, S_ISUID, 's', 'S'),
        (3, S_ISGID, 's', 'S'),
        (0, S_ISVTX, 't', 'T'),
    ];

    let mut out = String::with_capacity(10);
    out.push(type_char);
    for (shift, special, with_x, without_x) in triplets {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        let exec = bits & 0o1 != 0;
        out.push(match (exec, mode & special != 0) {
            (true, true) => with_x,
            (false, true) => without_x,
            (true, false) => 'x',
            (false, false) => '-',
        });
    }
    out
}

/// Extract major and minor device numbers from a raw Linux device number.
pub fn device_major_minor(dev: u32) -> (u32, u32) {
    let major = (dev >> 8) & 0xFFF;
    let minor = (dev & 0xFF) | ((dev >> 12) & 0xFFF00);
    (major, minor)
}

/// Convert Unix epoch seconds to `YYYY-MM-DD HH:MM:SS` (UTC).
pub fn format_unix_timestamp(epoch: i64) -> String {
    match DateTime::from_timestamp(epoch, 0) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => format!("<invalid time {epoch}>"),
    }
}
