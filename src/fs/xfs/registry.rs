//! Known XFS structures, keyed by name and by leading magic.
//!
//! Entries are listed in priority order: [`identify`] returns the first
//! entry whose magic matches, so all 32-bit magics are tried before the
//! 16-bit inode and dquot magics.

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;
use std::fmt::Write;

use super::btree::BtreeBlock;
use super::format::*;
use super::inode::decode_inode;
use super::superblock::Superblock;
use crate::error::ProbeError;
use crate::fs::fields::{hexdump, render_fields};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StructureKind {
    Superblock,
    Agf,
    Agi,
    Agfl,
    FreeByBlock,
    FreeByBlockCrc,
    FreeBySize,
    FreeBySizeCrc,
    InodeBtree,
    InodeBtreeCrc,
    FreeInodeBtree,
    FreeInodeBtreeCrc,
    RefcountBtree,
    RmapBtree,
    BmapBtree,
    BmapBtreeCrc,
    Inode,
    Dquot,
    LogRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    U32(u32),
    U16(u16),
}

#[derive(Debug)]
pub struct StructureDef {
    pub kind: StructureKind,
    pub name: &'static str,
    pub magic: Magic,
    pub description: &'static str,
}

const fn def(
    kind: StructureKind,
    name: &'static str,
    magic: Magic,
    description: &'static str,
) -> StructureDef {
    StructureDef {
        kind,
        name,
        magic,
        description,
    }
}

pub static REGISTRY: &[StructureDef] = &[
    def(StructureKind::Superblock, "sb", Magic::U32(XFS_SB_MAGIC), "superblock"),
    def(StructureKind::Agf, "agf", Magic::U32(XFS_AGF_MAGIC), "AG free-space header"),
    def(StructureKind::Agi, "agi", Magic::U32(XFS_AGI_MAGIC), "AG inode header"),
    def(StructureKind::Agfl, "agfl", Magic::U32(XFS_AGFL_MAGIC), "AG free list"),
    def(StructureKind::FreeByBlock, "abtb", Magic::U32(XFS_ABTB_MAGIC), "free space by block btree"),
    def(StructureKind::FreeByBlockCrc, "ab3b", Magic::U32(XFS_ABTB_CRC_MAGIC), "free space by block btree (crc)"),
    def(StructureKind::FreeBySize, "abtc", Magic::U32(XFS_ABTC_MAGIC), "free space by size btree"),
    def(StructureKind::FreeBySizeCrc, "ab3c", Magic::U32(XFS_ABTC_CRC_MAGIC), "free space by size btree (crc)"),
    def(StructureKind::InodeBtree, "iabt", Magic::U32(XFS_IBT_MAGIC), "inode btree"),
    def(StructureKind::InodeBtreeCrc, "iab3", Magic::U32(XFS_IBT_CRC_MAGIC), "inode btree (crc)"),
    def(StructureKind::FreeInodeBtree, "fibt", Magic::U32(XFS_FIBT_MAGIC), "free inode btree"),
    def(StructureKind::FreeInodeBtreeCrc, "fib3", Magic::U32(XFS_FIBT_CRC_MAGIC), "free inode btree (crc)"),
    def(StructureKind::RefcountBtree, "refc", Magic::U32(XFS_REFC_CRC_MAGIC), "reference count btree"),
    def(StructureKind::RmapBtree, "rmap", Magic::U32(XFS_RMAP_CRC_MAGIC), "reverse mapping btree"),
    def(StructureKind::BmapBtree, "bmap", Magic::U32(XFS_BMAP_MAGIC), "extent map btree"),
    def(StructureKind::BmapBtreeCrc, "bma3", Magic::U32(XFS_BMAP_CRC_MAGIC), "extent map btree (crc)"),
    def(StructureKind::LogRecord, "log", Magic::U32(XLOG_HEADER_MAGIC), "log record header"),
    def(StructureKind::Inode, "inode", Magic::U16(XFS_DINODE_MAGIC), "inode"),
    def(StructureKind::Dquot, "dquot", Magic::U16(XFS_DQUOT_MAGIC), "quota record"),
];

impl StructureKind {
    pub fn def(self) -> &'static StructureDef {
        // Every variant has exactly one entry; the fallback is unreachable.
        REGISTRY
            .iter()
            .find(|d| d.kind == self)
            .unwrap_or(&REGISTRY[0])
    }

    pub fn name(self) -> &'static str {
        self.def().name
    }

    /// Exact-match lookup by short name.
    pub fn by_name(name: &str) -> Option<StructureKind> {
        REGISTRY.iter().find(|d| d.name == name).map(|d| d.kind)
    }

    fn is_btree(self) -> bool {
        use StructureKind::*;
        matches!(
            self,
            FreeByBlock
                | FreeByBlockCrc
                | FreeBySize
                | FreeBySizeCrc
                | InodeBtree
                | InodeBtreeCrc
                | FreeInodeBtree
                | FreeInodeBtreeCrc
                | RefcountBtree
                | RmapBtree
                | BmapBtree
                | BmapBtreeCrc
        )
    }
}

/// Identify a buffer by its leading magic, without copying it.
pub fn identify(buf: &[u8]) -> Option<StructureKind> {
    let m32 = buf.get(..4).map(BigEndian::read_u32);
    let m16 = buf.get(..2).map(BigEndian::read_u16)?;
    REGISTRY
        .iter()
        .find(|d| match d.magic {
            Magic::U32(v) => m32 == Some(v),
            Magic::U16(v) => m16 == v,
        })
        .map(|d| d.kind)
}

/// Render `buf` as `kind`.
///
/// `sb` supplies the feature bits some layouts depend on; without it the
/// v4 layout is assumed. Anything that fails to decode is reported and
/// followed by a hex dump instead of an error.
pub fn render(kind: StructureKind, buf: &[u8], sb: Option<&Superblock>) -> String {
    match render_checked(kind, buf, sb) {
        Ok(text) => text,
        Err(e) => {
            let mut out = String::new();
            let _ = writeln!(out, "cannot decode as {}: {e}", kind.name());
            out.push_str(&hexdump(buf, 0));
            out
        }
    }
}

fn render_checked(
    kind: StructureKind,
    buf: &[u8],
    sb: Option<&Superblock>,
) -> Result<String, ProbeError> {
    let v5 = sb.is_some_and(|s| s.is_v5());
    Ok(match kind {
        StructureKind::Superblock => Superblock::parse(buf)?.render(),
        StructureKind::Agf => render_fields("AGF", AGF_FIELDS, buf),
        StructureKind::Agi => render_fields("AGI", AGI_FIELDS, buf),
        StructureKind::Agfl => {
            let mut out = String::new();
            let start = if v5 {
                out.push_str(&render_fields("AGFL", AGFL_FIELDS, buf));
                AGFL_V5_BNO_OFFSET
            } else {
                0
            };
            let used: Vec<u32> = buf
                .get(start..)
                .unwrap_or(&[])
                .chunks_exact(4)
                .map(BigEndian::read_u32)
                .filter(|&b| b != u32::MAX)
                .collect();
            let _ = writeln!(out, "free list slots in use: {used:?}");
            out
        }
        k if k.is_btree() => {
            let sparse = sb.is_some_and(|s| s.has_sparse_inodes());
            BtreeBlock::parse(buf)?.render(buf, sparse)
        }
        StructureKind::Inode => {
            // Without a requested number, check the inode against itself.
            let ino = if buf.len() >= DI_INO + 8 && buf.get(DI_VERSION).is_some_and(|&v| v >= 3) {
                BigEndian::read_u64(&buf[DI_INO..])
            } else {
                0
            };
            let has_ftype = sb.is_some_and(|s| s.has_ftype());
            decode_inode(buf, ino, has_ftype)?.render()
        }
        StructureKind::Dquot => render_fields("dquot", DQUOT_FIELDS, buf),
        StructureKind::LogRecord => render_fields("log record header", LOG_RECORD_FIELDS, buf),
        _ => return Err(ProbeError::UnknownStructure(kind.name().to_string())),
    })
}

/// One line per registered structure, for listing.
pub fn describe_all() -> String {
    let mut out = String::new();
    for d in REGISTRY {
        let magic = match d.magic {
            Magic::U32(v) => format!("{v:#010x}"),
            Magic::U16(v) => format!("{v:#06x}"),
        };
        let _ = writeln!(out, "{:<6} {magic:<10} {}", d.name, d.description);
    }
    out
}
