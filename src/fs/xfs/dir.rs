//! Short-form (inline) directories stored in an inode's data fork.
//!
//! Layout:
//!
//! ```text
//! header: count u8 | i8count u8 | parent (4 or 8 bytes)
//! entry:  namelen u8 | offset u16 | name[namelen] | [ftype u8] | inumber (4 or 8 bytes)
//! ```
//!
//! A non-zero `i8count` switches the parent and every entry's inode number
//! to 8 bytes. Entries are packed with no padding.

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;
use std::fmt::Write;

use crate::error::ProbeError;

/// Directory entry file types (`XFS_DIR3_FT_*`).
const FTYPE_NAMES: [&str; 8] = [
    "unknown", "file", "dir", "chrdev", "blkdev", "fifo", "sock", "symlink",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShortformDirEntry {
    pub name: String,
    /// Logical offset the entry would have in a block directory.
    pub offset: u16,
    pub ftype: Option<u8>,
    pub inumber: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShortformDir {
    pub count: u8,
    pub i8count: u8,
    pub parent: u64,
    pub entries: Vec<ShortformDirEntry>,
}

/// Read a 4- or 8-byte big-endian inode number.
fn read_ino(data: &[u8], pos: usize, wide: bool) -> Result<u64, ProbeError> {
    let width = if wide { 8 } else { 4 };
    ProbeError::check_len("short-form directory", data, pos + width)?;
    Ok(if wide {
        BigEndian::read_u64(&data[pos..])
    } else {
        BigEndian::read_u32(&data[pos..]) as u64
    })
}

impl ShortformDir {
    /// Decode a short-form directory from the raw data fork.
    ///
    /// `has_ftype` says whether each entry carries a file-type byte after
    /// its name; it comes from the superblock feature bits.
    pub fn parse(fork: &[u8], has_ftype: bool) -> Result<Self, ProbeError> {
        ProbeError::check_len("short-form directory", fork, 2)?;
        let count = fork[0];
        let i8count = fork[1];
        let wide = i8count != 0;
        let ino_len = if wide { 8 } else { 4 };

        let parent = read_ino(fork, 2, wide)?;
        let mut pos = 2 + ino_len;

        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ProbeError::check_len("short-form directory", fork, pos + 3)?;
            let namelen = fork[pos] as usize;
            let offset = BigEndian::read_u16(&fork[pos + 1..]);
            pos += 3;

            ProbeError::check_len("short-form directory", fork, pos + namelen)?;
            let name = String::from_utf8_lossy(&fork[pos..pos + namelen]).into_owned();
            pos += namelen;

            let ftype = if has_ftype {
                ProbeError::check_len("short-form directory", fork, pos + 1)?;
                pos += 1;
                Some(fork[pos - 1])
            } else {
                None
            };

            let inumber = read_ino(fork, pos, wide)?;
            pos += ino_len;

            entries.push(ShortformDirEntry {
                name,
                offset,
                ftype,
                inumber,
            });
        }

        Ok(ShortformDir {
            count,
            i8count,
            parent,
            entries,
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "short-form directory: {} entries, i8count {}, parent {}",
            self.count, self.i8count, self.parent
        );
        for e in &self.entries {
            let ftype = match e.ftype {
                Some(t) => FTYPE_NAMES.get(t as usize).copied().unwrap_or("?"),
                None => "-",
            };
            let _ = writeln!(
                out,
                "  {:>12}  {:#06x}  {:<8} {}",
                e.inumber, e.offset, ftype, e.name
            );
        }
        out
    }
}
