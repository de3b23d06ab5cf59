//! Inode fetch and data-fork decoding.

use byteorder::{BigEndian, ByteOrder};
use log::debug;
use serde::Serialize;
use std::fmt::Write;
use std::io::{Read, Seek};

use super::dir::ShortformDir;
use super::extent::{parse_extent_list, Extent};
use super::format::*;
use super::superblock::Superblock;
use crate::blockdev::BlockReader;
use crate::error::ProbeError;
use crate::fs::fields::{format_uuid, hexdump};
use crate::fs::unix_common::inode::{
    device_major_minor, format_unix_timestamp, unix_file_type, unix_mode_string, UnixFileType,
};

/// Seconds between the bigtime epoch and the Unix epoch.
const BIGTIME_EPOCH_OFFSET: i64 = 1 << 31;

/// Data fork format (`di_format`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InodeFormat {
    Dev,
    Local,
    Extents,
    Btree,
    Uuid,
    Unknown(u8),
}

impl From<u8> for InodeFormat {
    fn from(v: u8) -> Self {
        match v {
            0 => InodeFormat::Dev,
            1 => InodeFormat::Local,
            2 => InodeFormat::Extents,
            3 => InodeFormat::Btree,
            4 => InodeFormat::Uuid,
            other => InodeFormat::Unknown(other),
        }
    }
}

/// Decoded data fork.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ForkData {
    Device { major: u32, minor: u32 },
    Extents(Vec<Extent>),
    /// In-inode bmbt root. Only the header is decoded.
    BtreeRoot { level: u16, numrecs: u16, raw: Vec<u8> },
    Directory(ShortformDir),
    Symlink { target: String },
    /// A format/type combination this decoder does not interpret.
    Unhandled { raw: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: u32,
}

impl Timestamp {
    fn decode(raw: &[u8], bigtime: bool) -> Self {
        if bigtime {
            let ns = BigEndian::read_u64(raw);
            Timestamp {
                sec: (ns / 1_000_000_000) as i64 - BIGTIME_EPOCH_OFFSET,
                nsec: (ns % 1_000_000_000) as u32,
            }
        } else {
            Timestamp {
                sec: BigEndian::read_i32(raw) as i64,
                nsec: BigEndian::read_u32(&raw[4..]),
            }
        }
    }

    fn display(&self) -> String {
        format!("{}.{:09}", format_unix_timestamp(self.sec), self.nsec)
    }
}

/// Version 3 trailer fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InodeV3 {
    pub crc: u32,
    pub changecount: u64,
    pub lsn: u64,
    pub flags2: u64,
    pub cowextsize: u32,
    pub crtime: Timestamp,
    pub ino: u64,
    pub uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedInode {
    pub ino: u64,
    pub version: u8,
    pub mode: u16,
    pub file_type: UnixFileType,
    pub format: InodeFormat,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub nblocks: u64,
    pub extsize: u32,
    pub nextents: u32,
    pub anextents: u16,
    pub forkoff: u8,
    pub aformat: u8,
    pub flags: u16,
    pub gen: u32,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    pub v3: Option<InodeV3>,
    pub fork: ForkData,
}

/// Length of the inode core for a given `di_version`.
pub fn core_len(version: u8) -> usize {
    if version >= 3 {
        DINODE_V3_SIZE
    } else {
        DI_CRC
    }
}

/// Disk block and byte offset within it holding inode `ino`.
///
/// `ino / inopblock` is a filesystem block number. When `agblklog` can hold
/// every AG-relative block, the AG sits in the high bits and is turned into
/// a linear block number here. Otherwise the quotient is used as a linear
/// block number directly.
pub fn inode_location(sb: &Superblock, ino: u64) -> (u64, usize) {
    let inopblock = (sb.inodes_per_block as u64).max(1);
    let fsb = ino / inopblock;
    let offset = (ino % inopblock) as usize * sb.inode_size as usize;
    let agblklog = sb.ag_blk_log as u32;
    if agblklog == 0 || agblklog >= 64 || (1u64 << agblklog) < sb.ag_blocks as u64 {
        return (fsb, offset);
    }
    let agno = fsb >> agblklog;
    let agbno = fsb & ((1u64 << agblklog) - 1);
    (agno * sb.ag_blocks as u64 + agbno, offset)
}

/// Read and decode inode `ino`.
pub fn fetch_inode<R: Read + Seek>(
    reader: &mut BlockReader<R>,
    sb: &Superblock,
    ino: u64,
) -> Result<DecodedInode, ProbeError> {
    if ino < sb.root_ino {
        return Err(ProbeError::BelowRootIno {
            ino,
            root: sb.root_ino,
        });
    }
    let (blockno, offset) = inode_location(sb, ino);
    debug!("inode {ino}: block {blockno} offset {offset}");
    let byte = blockno * sb.block_size as u64 + offset as u64;
    let data = reader.read_raw(byte, sb.inode_size as usize)?;
    decode_inode(&data, ino, sb.has_ftype())
}

/// Decode a raw inode buffer that was read for inode number `ino`.
pub fn decode_inode(data: &[u8], ino: u64, has_ftype: bool) -> Result<DecodedInode, ProbeError> {
    ProbeError::check_len("inode", data, DI_CRC)?;
    let magic = BigEndian::read_u16(&data[DI_MAGIC..]);
    if magic != XFS_DINODE_MAGIC {
        return Err(ProbeError::bad_magic(
            "inode",
            format!("inode {ino}"),
            XFS_DINODE_MAGIC as u64,
            magic as u64,
        ));
    }

    let version = data[DI_VERSION];
    let core = core_len(version);
    ProbeError::check_len("inode", data, core)?;

    let v3 = if version >= 3 {
        let on_disk = BigEndian::read_u64(&data[DI_INO..]);
        if on_disk != ino {
            return Err(ProbeError::InoMismatch {
                expected: ino,
                actual: on_disk,
            });
        }
        let flags2 = BigEndian::read_u64(&data[DI_FLAGS2..]);
        Some(InodeV3 {
            crc: BigEndian::read_u32(&data[DI_CRC..]),
            changecount: BigEndian::read_u64(&data[DI_CHANGECOUNT..]),
            lsn: BigEndian::read_u64(&data[DI_LSN..]),
            flags2,
            cowextsize: BigEndian::read_u32(&data[0x80..]),
            crtime: Timestamp::decode(&data[DI_CRTIME..], flags2 & XFS_DIFLAG2_BIGTIME != 0),
            ino: on_disk,
            uuid: format_uuid(&data[DI_UUID..DI_UUID + 16]),
        })
    } else {
        None
    };
    let bigtime = v3
        .as_ref()
        .is_some_and(|t| t.flags2 & XFS_DIFLAG2_BIGTIME != 0);

    let mode = BigEndian::read_u16(&data[DI_MODE..]);
    let file_type = unix_file_type(mode as u32);
    let format = InodeFormat::from(data[DI_FORMAT]);
    let forkoff = data[DI_FORKOFF];
    let nextents = BigEndian::read_u32(&data[DI_NEXTENTS..]);
    let size = BigEndian::read_u64(&data[DI_SIZE..]);

    let fork_len = if forkoff != 0 {
        forkoff as usize * 8
    } else {
        data.len() - core
    };
    let fork_end = (core + fork_len).min(data.len());
    let fork = decode_fork(&data[core..fork_end], format, file_type, nextents, size, has_ftype)?;

    Ok(DecodedInode {
        ino,
        version,
        mode,
        file_type,
        format,
        uid: BigEndian::read_u32(&data[DI_UID..]),
        gid: BigEndian::read_u32(&data[DI_GID..]),
        nlink: if version == 1 {
            BigEndian::read_u16(&data[DI_ONLINK..]) as u32
        } else {
            BigEndian::read_u32(&data[DI_NLINK..])
        },
        size,
        nblocks: BigEndian::read_u64(&data[DI_NBLOCKS..]),
        extsize: BigEndian::read_u32(&data[DI_EXTSIZE..]),
        nextents,
        anextents: BigEndian::read_u16(&data[DI_ANEXTENTS..]),
        forkoff,
        aformat: data[DI_AFORMAT],
        flags: BigEndian::read_u16(&data[DI_FLAGS..]),
        gen: BigEndian::read_u32(&data[DI_GEN..]),
        atime: Timestamp::decode(&data[DI_ATIME..], bigtime),
        mtime: Timestamp::decode(&data[DI_MTIME..], bigtime),
        ctime: Timestamp::decode(&data[DI_CTIME..], bigtime),
        v3,
        fork,
    })
}

fn decode_fork(
    fork: &[u8],
    format: InodeFormat,
    file_type: UnixFileType,
    nextents: u32,
    size: u64,
    has_ftype: bool,
) -> Result<ForkData, ProbeError> {
    use UnixFileType::*;

    Ok(match (format, file_type) {
        (InodeFormat::Extents, Regular | Directory | Symlink) => {
            ProbeError::check_len("extent list", fork, 16)?;
            ForkData::Extents(parse_extent_list(fork, nextents as usize))
        }
        (InodeFormat::Btree, Regular | Directory) => {
            ProbeError::check_len("bmbt root", fork, 4)?;
            ForkData::BtreeRoot {
                level: BigEndian::read_u16(&fork[0..]),
                numrecs: BigEndian::read_u16(&fork[2..]),
                raw: fork.to_vec(),
            }
        }
        (InodeFormat::Local, Directory) => ForkData::Directory(ShortformDir::parse(fork, has_ftype)?),
        (InodeFormat::Local, Symlink) => {
            let len = (size as usize).min(fork.len());
            ForkData::Symlink {
                target: String::from_utf8_lossy(&fork[..len]).into_owned(),
            }
        }
        (InodeFormat::Dev, CharDevice | BlockDevice) => {
            ProbeError::check_len("device fork", fork, 4)?;
            let (major, minor) = device_major_minor(BigEndian::read_u32(fork));
            ForkData::Device { major, minor }
        }
        _ => ForkData::Unhandled { raw: fork.to_vec() },
    })
}

impl DecodedInode {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "inode {} (v{}):", self.ino, self.version);
        let _ = writeln!(
            out,
            "  mode      = {:#o} {} ({})",
            self.mode,
            unix_mode_string(self.mode as u32),
            self.file_type.name()
        );
        let _ = writeln!(out, "  format    = {:?}", self.format);
        let _ = writeln!(out, "  uid/gid   = {}/{}", self.uid, self.gid);
        let _ = writeln!(out, "  nlink     = {}", self.nlink);
        let _ = writeln!(out, "  size      = {}", self.size);
        let _ = writeln!(out, "  nblocks   = {}", self.nblocks);
        let _ = writeln!(out, "  extsize   = {}", self.extsize);
        let _ = writeln!(out, "  nextents  = {}", self.nextents);
        let _ = writeln!(out, "  anextents = {}", self.anextents);
        let _ = writeln!(out, "  forkoff   = {}", self.forkoff);
        let _ = writeln!(out, "  aformat   = {}", self.aformat);
        let _ = writeln!(out, "  flags     = {:#06x}", self.flags);
        let _ = writeln!(out, "  gen       = {}", self.gen);
        let _ = writeln!(out, "  atime     = {}", self.atime.display());
        let _ = writeln!(out, "  mtime     = {}", self.mtime.display());
        let _ = writeln!(out, "  ctime     = {}", self.ctime.display());
        if let Some(v3) = &self.v3 {
            let _ = writeln!(out, "  crc       = {:#010x}", v3.crc);
            let _ = writeln!(out, "  changecnt = {}", v3.changecount);
            let _ = writeln!(out, "  lsn       = {:#018x}", v3.lsn);
            let _ = writeln!(out, "  flags2    = {:#x}", v3.flags2);
            let _ = writeln!(out, "  cowextsz  = {}", v3.cowextsize);
            let _ = writeln!(out, "  crtime    = {}", v3.crtime.display());
            let _ = writeln!(out, "  uuid      = {}", v3.uuid);
        }

        match &self.fork {
            ForkData::Device { major, minor } => {
                let _ = writeln!(out, "device {major}:{minor}");
            }
            ForkData::Extents(extents) => {
                let _ = writeln!(out, "extents:");
                for (i, e) in extents.iter().enumerate() {
                    let _ = writeln!(
                        out,
                        "  [{i}] startoff {} startblock {} count {}{}",
                        e.startoff,
                        e.startblock,
                        e.blockcount,
                        if e.flag { " unwritten" } else { "" }
                    );
                }
            }
            ForkData::BtreeRoot { level, numrecs, raw } => {
                let _ = writeln!(out, "bmbt root: level {level}, {numrecs} records");
                out.push_str(&hexdump(raw, 0));
            }
            ForkData::Directory(dir) => out.push_str(&dir.render()),
            ForkData::Symlink { target } => {
                let _ = writeln!(out, "symlink -> {target}");
            }
            ForkData::Unhandled { raw } => {
                let _ = writeln!(out, "unhandled fork ({:?}, {}):", self.format, self.file_type.name());
                out.push_str(&hexdump(raw, 0));
            }
        }
        out
    }
}
