//! XFS B+tree blocks: header and leaf records.
//!
//! Header kind is chosen from the magic alone. Every tree is decoded with
//! the short-form header (32-bit sibling pointers); the bmbt trees really
//! use the long form, so their blocks come back with `verified == false`
//! and their records should be treated as a best guess.

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;
use std::fmt::Write;

use super::extent::{parse_extent_list, BMBT_REC_LEN};
use super::format::*;
use crate::error::ProbeError;
use crate::fs::fields::render_fields;

const RMAP_REC_LEN: usize = 24;
/// Short-form internal node pointer width.
const SHORT_PTR_LEN: usize = 4;

/// Which record layout a tree's leaves carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordKind {
    Alloc,
    Inode,
    Refcount,
    Rmap,
    Bmap,
}

impl RecordKind {
    fn from_magic(magic: u32) -> Option<Self> {
        Some(match magic {
            XFS_ABTB_MAGIC | XFS_ABTB_CRC_MAGIC | XFS_ABTC_MAGIC | XFS_ABTC_CRC_MAGIC => {
                RecordKind::Alloc
            }
            XFS_IBT_MAGIC | XFS_IBT_CRC_MAGIC | XFS_FIBT_MAGIC | XFS_FIBT_CRC_MAGIC => {
                RecordKind::Inode
            }
            XFS_REFC_CRC_MAGIC => RecordKind::Refcount,
            XFS_RMAP_CRC_MAGIC => RecordKind::Rmap,
            XFS_BMAP_MAGIC | XFS_BMAP_CRC_MAGIC => RecordKind::Bmap,
            _ => return None,
        })
    }

    /// Size of one internal-node key.
    fn key_len(self) -> usize {
        match self {
            RecordKind::Alloc => 8,
            RecordKind::Inode => 4,
            RecordKind::Refcount => 4,
            RecordKind::Rmap => 40,
            RecordKind::Bmap => 8,
        }
    }
}

fn is_crc_magic(magic: u32) -> bool {
    matches!(
        magic,
        XFS_ABTB_CRC_MAGIC
            | XFS_ABTC_CRC_MAGIC
            | XFS_IBT_CRC_MAGIC
            | XFS_FIBT_CRC_MAGIC
            | XFS_REFC_CRC_MAGIC
            | XFS_RMAP_CRC_MAGIC
            | XFS_BMAP_CRC_MAGIC
    )
}

/// A free-space extent: AG-relative start and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocRec {
    pub startblock: u32,
    pub blockcount: u32,
}

/// Inode chunk record. The sparse layout replaces the 32-bit free count
/// with a hole mask and an 8-bit inode count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InobtRec {
    Full {
        startino: u32,
        freecount: u32,
        free: u64,
    },
    Sparse {
        startino: u32,
        holemask: u16,
        count: u8,
        freecount: u8,
        free: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefcountRec {
    pub startblock: u32,
    pub blockcount: u32,
    pub refcount: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RmapRec {
    pub startblock: u32,
    pub blockcount: u32,
    pub owner: u64,
    pub offset: u64,
}

/// Header of one short-form B+tree block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BtreeBlock {
    pub magic: u32,
    pub level: u16,
    pub numrecs: u16,
    pub leftsib: u32,
    pub rightsib: u32,
    pub crc: bool,
    /// False when the magic belongs to a long-form tree that was decoded
    /// through the short-form header anyway.
    pub verified: bool,
}

impl BtreeBlock {
    pub fn parse(data: &[u8]) -> Result<Self, ProbeError> {
        ProbeError::check_len("btree block", data, BTREE_SBLOCK_LEN)?;
        let magic = BigEndian::read_u32(&data[0..]);
        let crc = is_crc_magic(magic);
        let block = BtreeBlock {
            magic,
            level: BigEndian::read_u16(&data[4..]),
            numrecs: BigEndian::read_u16(&data[6..]),
            leftsib: BigEndian::read_u32(&data[8..]),
            rightsib: BigEndian::read_u32(&data[12..]),
            crc,
            verified: RecordKind::from_magic(magic) != Some(RecordKind::Bmap),
        };
        ProbeError::check_len("btree block", data, block.header_len())?;
        Ok(block)
    }

    pub fn header_len(&self) -> usize {
        if self.crc {
            BTREE_SBLOCK_CRC_LEN
        } else {
            BTREE_SBLOCK_LEN
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    /// Slice holding `numrecs` records of `rec_len` bytes after the header.
    fn records<'a>(&self, data: &'a [u8], rec_len: usize) -> Result<&'a [u8], ProbeError> {
        let start = self.header_len();
        let end = start + self.numrecs as usize * rec_len;
        ProbeError::check_len("btree records", data, end)?;
        Ok(&data[start..end])
    }

    pub fn alloc_records(&self, data: &[u8]) -> Result<Vec<AllocRec>, ProbeError> {
        let raw = self.records(data, ALLOC_REC_LEN)?;
        Ok(raw
            .chunks_exact(ALLOC_REC_LEN)
            .map(|r| AllocRec {
                startblock: BigEndian::read_u32(&r[0..]),
                blockcount: BigEndian::read_u32(&r[4..]),
            })
            .collect())
    }

    pub fn inode_records(&self, data: &[u8], sparse: bool) -> Result<Vec<InobtRec>, ProbeError> {
        let raw = self.records(data, INOBT_REC_LEN)?;
        Ok(raw
            .chunks_exact(INOBT_REC_LEN)
            .map(|r| {
                let startino = BigEndian::read_u32(&r[0..]);
                let free = BigEndian::read_u64(&r[8..]);
                if sparse {
                    InobtRec::Sparse {
                        startino,
                        holemask: BigEndian::read_u16(&r[4..]),
                        count: r[6],
                        freecount: r[7],
                        free,
                    }
                } else {
                    InobtRec::Full {
                        startino,
                        freecount: BigEndian::read_u32(&r[4..]),
                        free,
                    }
                }
            })
            .collect())
    }

    pub fn refcount_records(&self, data: &[u8]) -> Result<Vec<RefcountRec>, ProbeError> {
        let raw = self.records(data, REFCOUNT_REC_LEN)?;
        Ok(raw
            .chunks_exact(REFCOUNT_REC_LEN)
            .map(|r| RefcountRec {
                startblock: BigEndian::read_u32(&r[0..]),
                blockcount: BigEndian::read_u32(&r[4..]),
                refcount: BigEndian::read_u32(&r[8..]),
            })
            .collect())
    }

    pub fn rmap_records(&self, data: &[u8]) -> Result<Vec<RmapRec>, ProbeError> {
        let raw = self.records(data, RMAP_REC_LEN)?;
        Ok(raw
            .chunks_exact(RMAP_REC_LEN)
            .map(|r| RmapRec {
                startblock: BigEndian::read_u32(&r[0..]),
                blockcount: BigEndian::read_u32(&r[4..]),
                owner: BigEndian::read_u64(&r[8..]),
                offset: BigEndian::read_u64(&r[16..]),
            })
            .collect())
    }

    /// AG-relative child block numbers of an internal node.
    ///
    /// Keys fill the space after the header up to the node's maximum record
    /// count; the pointer array starts right after that.
    pub fn child_pointers(&self, data: &[u8], key_len: usize) -> Result<Vec<u32>, ProbeError> {
        let hdr = self.header_len();
        let maxrecs = (data.len().saturating_sub(hdr)) / (key_len + SHORT_PTR_LEN);
        let start = hdr + maxrecs * key_len;
        let end = start + self.numrecs as usize * SHORT_PTR_LEN;
        if self.numrecs as usize > maxrecs {
            return Err(ProbeError::Truncated {
                structure: "btree node pointers",
                needed: end,
                actual: data.len(),
            });
        }
        Ok(data[start..end]
            .chunks_exact(SHORT_PTR_LEN)
            .map(BigEndian::read_u32)
            .collect())
    }

    /// Header dump followed by the leaf records (or child pointers).
    pub fn render(&self, data: &[u8], sparse_inodes: bool) -> String {
        let name = String::from_utf8_lossy(&self.magic.to_be_bytes()).into_owned();
        let mut fields = BTREE_SBLOCK_FIELDS.to_vec();
        if self.crc {
            fields.extend_from_slice(BTREE_SBLOCK_CRC_FIELDS);
        }
        let mut out = render_fields(&format!("btree block {name}"), &fields, data);
        if !self.verified {
            let _ = writeln!(
                out,
                "  warning: long-form tree read with a short-form header, records unverified"
            );
        }

        let Some(kind) = RecordKind::from_magic(self.magic) else {
            return out;
        };

        if !self.is_leaf() {
            match self.child_pointers(data, kind.key_len()) {
                Ok(ptrs) => {
                    for (i, p) in ptrs.iter().enumerate() {
                        let _ = writeln!(out, "  ptr[{i}] = {p}");
                    }
                }
                Err(e) => {
                    let _ = writeln!(out, "  {e}");
                }
            }
            return out;
        }

        let result: Result<Vec<String>, ProbeError> = match kind {
            RecordKind::Alloc => self.alloc_records(data).map(|recs| {
                recs.iter()
                    .map(|r| format!("start {} count {}", r.startblock, r.blockcount))
                    .collect()
            }),
            RecordKind::Inode => self.inode_records(data, sparse_inodes).map(|recs| {
                recs.iter()
                    .map(|r| match r {
                        InobtRec::Full { startino, freecount, free } => {
                            format!("startino {startino} freecount {freecount} free {free:#018x}")
                        }
                        InobtRec::Sparse { startino, holemask, count, freecount, free } => format!(
                            "startino {startino} holemask {holemask:#06x} count {count} \
                             freecount {freecount} free {free:#018x}"
                        ),
                    })
                    .collect()
            }),
            RecordKind::Refcount => self.refcount_records(data).map(|recs| {
                recs.iter()
                    .map(|r| {
                        format!("start {} count {} refcount {}", r.startblock, r.blockcount, r.refcount)
                    })
                    .collect()
            }),
            RecordKind::Rmap => self.rmap_records(data).map(|recs| {
                recs.iter()
                    .map(|r| {
                        format!(
                            "start {} count {} owner {:#x} offset {}",
                            r.startblock, r.blockcount, r.owner, r.offset
                        )
                    })
                    .collect()
            }),
            RecordKind::Bmap => self.records(data, BMBT_REC_LEN).map(|raw| {
                parse_extent_list(raw, self.numrecs as usize)
                    .iter()
                    .map(|e| {
                        format!(
                            "startoff {} startblock {} count {}{}",
                            e.startoff,
                            e.startblock,
                            e.blockcount,
                            if e.flag { " unwritten" } else { "" }
                        )
                    })
                    .collect()
            }),
        };

        match result {
            Ok(lines) => {
                for (i, line) in lines.iter().enumerate() {
                    let _ = writeln!(out, "  rec[{i}] {line}");
                }
            }
            Err(e) => {
                let _ = writeln!(out, "  {e}");
            }
        }
        out
    }
}
