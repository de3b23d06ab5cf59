//! Allocation-group loading.
//!
//! Each AG starts with four sector-sized headers (superblock copy, AGF, AGI,
//! AGFL). The AGF and AGI point at up to five B+tree roots; each non-zero
//! root is read and kept only if its magic is one the tree accepts.

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, warn};
use std::fmt::Write;
use std::io::{Read, Seek};

use super::format::*;
use super::superblock::Superblock;
use crate::blockdev::BlockReader;
use crate::error::ProbeError;
use crate::fs::fields::render_fields;
use crate::fs::DecodeMode;

/// The five per-AG trees the loader knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TreeKind {
    FreeByBlock,
    FreeBySize,
    Inode,
    FreeInode,
    Refcount,
}

impl TreeKind {
    pub const ALL: [TreeKind; 5] = [
        TreeKind::FreeByBlock,
        TreeKind::FreeBySize,
        TreeKind::Inode,
        TreeKind::FreeInode,
        TreeKind::Refcount,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            TreeKind::FreeByBlock => "free-space-by-block btree",
            TreeKind::FreeBySize => "free-space-by-size btree",
            TreeKind::Inode => "inode btree",
            TreeKind::FreeInode => "free-inode btree",
            TreeKind::Refcount => "refcount btree",
        }
    }

    /// Plain and CRC magics this tree's blocks may carry.
    pub fn accepted_magics(self) -> &'static [u32] {
        match self {
            TreeKind::FreeByBlock => &[XFS_ABTB_MAGIC, XFS_ABTB_CRC_MAGIC],
            TreeKind::FreeBySize => &[XFS_ABTC_MAGIC, XFS_ABTC_CRC_MAGIC],
            TreeKind::Inode => &[XFS_IBT_MAGIC, XFS_IBT_CRC_MAGIC],
            TreeKind::FreeInode => &[XFS_FIBT_MAGIC, XFS_FIBT_CRC_MAGIC],
            TreeKind::Refcount => &[XFS_REFC_CRC_MAGIC],
        }
    }
}

/// Decoded AGF (free-space header).
#[derive(Debug, Clone, Default)]
pub struct Agf {
    pub magic: u32,
    pub seqno: u32,
    pub length: u32,
    pub bno_root: u32,
    pub cnt_root: u32,
    pub rmap_root: u32,
    pub bno_level: u32,
    pub cnt_level: u32,
    pub flfirst: u32,
    pub fllast: u32,
    pub flcount: u32,
    pub freeblks: u32,
    pub longest: u32,
    pub refcount_root: u32,
}

impl Agf {
    pub fn parse(data: &[u8]) -> Result<Self, ProbeError> {
        ProbeError::check_len("AGF", data, AGF_REFCOUNT_ROOT + 8)?;
        let r = |off: usize| BigEndian::read_u32(&data[off..]);
        Ok(Agf {
            magic: r(0x00),
            seqno: r(AGF_SEQNO),
            length: r(0x0C),
            bno_root: r(AGF_BNO_ROOT),
            cnt_root: r(AGF_CNT_ROOT),
            rmap_root: r(0x18),
            bno_level: r(0x1C),
            cnt_level: r(0x20),
            flfirst: r(0x28),
            fllast: r(0x2C),
            flcount: r(0x30),
            freeblks: r(AGF_FREEBLKS),
            longest: r(0x38),
            refcount_root: r(AGF_REFCOUNT_ROOT),
        })
    }
}

/// Decoded AGI (inode header).
#[derive(Debug, Clone, Default)]
pub struct Agi {
    pub magic: u32,
    pub seqno: u32,
    pub length: u32,
    pub count: u32,
    pub root: u32,
    pub level: u32,
    pub freecount: u32,
    pub newino: u32,
    pub dirino: u32,
    /// Zero on filesystems without the free-inode btree.
    pub free_root: u32,
}

impl Agi {
    pub fn parse(data: &[u8], v5: bool) -> Result<Self, ProbeError> {
        ProbeError::check_len("AGI", data, 0x28)?;
        let r = |off: usize| BigEndian::read_u32(&data[off..]);
        let free_root = if v5 && data.len() >= AGI_FREE_ROOT + 4 {
            r(AGI_FREE_ROOT)
        } else {
            0
        };
        Ok(Agi {
            magic: r(0x00),
            seqno: r(AGI_SEQNO),
            length: r(0x0C),
            count: r(0x10),
            root: r(AGI_ROOT),
            level: r(0x18),
            freecount: r(0x1C),
            newino: r(0x20),
            dirino: r(0x24),
            free_root,
        })
    }
}

/// One loaded allocation group. Owns every buffer it read.
#[derive(Debug)]
pub struct AllocGroup {
    pub index: u32,
    pub sb: Superblock,
    pub agf: Agf,
    pub agi: Agi,
    /// Raw header sectors, kept for display.
    pub sb_raw: Vec<u8>,
    pub agf_raw: Vec<u8>,
    pub agi_raw: Vec<u8>,
    pub agfl_raw: Vec<u8>,
    trees: [Option<Vec<u8>>; 5],
    roots: [u32; 5],
}

impl AllocGroup {
    /// Root block buffer of `kind`, if the tree was present and valid.
    pub fn tree(&self, kind: TreeKind) -> Option<&[u8]> {
        self.trees[kind.index()].as_deref()
    }

    /// AG-relative root block recorded for `kind` (zero when absent).
    pub fn root(&self, kind: TreeKind) -> u32 {
        self.roots[kind.index()]
    }

    /// First filesystem block of this AG.
    pub fn base_block(&self, ag_blocks: u32) -> u64 {
        self.index as u64 * ag_blocks as u64
    }

    /// Block numbers on the active part of the free list.
    pub fn agfl_blocks(&self, v5: bool) -> Vec<u32> {
        let start = if v5 { AGFL_V5_BNO_OFFSET } else { 0 };
        let slots: Vec<u32> = self
            .agfl_raw
            .get(start..)
            .unwrap_or(&[])
            .chunks_exact(4)
            .map(BigEndian::read_u32)
            .collect();
        if slots.is_empty() || self.agf.flcount == 0 {
            return Vec::new();
        }
        let n = slots.len();
        (0..self.agf.flcount as usize)
            .map(|i| slots[(self.agf.flfirst as usize + i) % n])
            .collect()
    }

    pub fn render(&self, v5: bool) -> String {
        let mut out = format!("allocation group {}\n", self.index);
        out.push_str(&render_fields("AGF", AGF_FIELDS, &self.agf_raw));
        out.push_str(&render_fields("AGI", AGI_FIELDS, &self.agi_raw));
        if v5 {
            out.push_str(&render_fields("AGFL", AGFL_FIELDS, &self.agfl_raw));
        }
        let _ = writeln!(out, "free list: {:?}", self.agfl_blocks(v5));
        let _ = writeln!(out, "trees:");
        for kind in TreeKind::ALL {
            let state = match (self.root(kind), self.tree(kind)) {
                (0, _) => "absent".to_string(),
                (root, Some(_)) => format!("root {root}, loaded"),
                (root, None) => format!("root {root}, rejected"),
            };
            let _ = writeln!(out, "  {:<26} {state}", kind.name());
        }
        out
    }
}

fn check_magic(structure: &str, location: &str, expected: u32, data: &[u8]) -> Result<(), ProbeError> {
    ProbeError::check_len("AG header", data, 4)?;
    let actual = BigEndian::read_u32(data);
    if actual != expected {
        return Err(ProbeError::bad_magic(structure, location, expected as u64, actual as u64));
    }
    Ok(())
}

/// Load every allocation group described by the primary superblock.
///
/// I/O errors abort the whole load. Magic and geometry mismatches go
/// through `mode`; a tolerated mismatch on a tree root leaves that tree
/// absent, and a tolerated mismatch on the AGF or AGI skips the roots it
/// would have supplied.
pub fn load_allocation_groups<R: Read + Seek>(
    reader: &mut BlockReader<R>,
    sb: &Superblock,
    mode: DecodeMode,
) -> Result<Vec<AllocGroup>, ProbeError> {
    let mut groups = Vec::new();
    for agno in 0..sb.ag_count {
        groups.push(load_one(reader, sb, agno, mode)?);
    }
    info!(
        "loaded {} allocation groups ({} blocks each)",
        groups.len(),
        sb.ag_blocks
    );
    Ok(groups)
}

fn load_one<R: Read + Seek>(
    reader: &mut BlockReader<R>,
    sb: &Superblock,
    agno: u32,
    mode: DecodeMode,
) -> Result<AllocGroup, ProbeError> {
    let location = format!("AG {agno}");
    let sect = sb.sect_size as usize;
    let base = sb.ag_byte_offset(agno);
    debug!("{location}: reading headers at byte {base}");

    let headers = reader.read_raw(base, 4 * sect)?;
    let sb_raw = headers[..sect].to_vec();
    let agf_raw = headers[sect..2 * sect].to_vec();
    let agi_raw = headers[2 * sect..3 * sect].to_vec();
    let agfl_raw = headers[3 * sect..].to_vec();

    // Slot 0: superblock copy, held to the same checks as the primary.
    let sb_location = format!("{location} superblock");
    let sb_copy = match Superblock::parse(&sb_raw) {
        Ok(copy) => {
            mode.tolerate(copy.validate(&sb_location, mode))?;
            copy
        }
        Err(e) => {
            mode.tolerate(Err(e))?;
            sb.clone()
        }
    };

    // Slots 1-3: compare leading magics.
    let slot = |n: u32| format!("{location} sector {n}");
    let agf_ok = mode.tolerate(check_magic("AGF", &slot(1), XFS_AGF_MAGIC, &agf_raw))?;
    let agi_ok = mode.tolerate(check_magic("AGI", &slot(2), XFS_AGI_MAGIC, &agi_raw))?;
    // v4 AGFLs are a bare block-number array with no header.
    if sb.is_v5() {
        mode.tolerate(check_magic("AGFL", &slot(3), XFS_AGFL_MAGIC, &agfl_raw))?;
    }

    let agf = if agf_ok { Agf::parse(&agf_raw)? } else { Agf::default() };
    let agi = if agi_ok { Agi::parse(&agi_raw, sb.is_v5())? } else { Agi::default() };
    if agf_ok && agf.seqno != agno {
        warn!("{location}: AGF sequence number is {}", agf.seqno);
    }
    if agi_ok && agi.seqno != agno {
        warn!("{location}: AGI sequence number is {}", agi.seqno);
    }

    let mut roots = [0u32; 5];
    roots[TreeKind::FreeByBlock.index()] = agf.bno_root;
    roots[TreeKind::FreeBySize.index()] = agf.cnt_root;
    roots[TreeKind::Inode.index()] = agi.root;
    if sb.has_finobt() {
        roots[TreeKind::FreeInode.index()] = agi.free_root;
    }
    if sb.has_reflink() {
        roots[TreeKind::Refcount.index()] = agf.refcount_root;
    }

    let mut trees: [Option<Vec<u8>>; 5] = Default::default();
    for kind in TreeKind::ALL {
        let root = roots[kind.index()];
        if root == 0 {
            debug!("{location}: {} absent", kind.name());
            continue;
        }
        trees[kind.index()] = load_tree(reader, sb, agno, kind, root, mode)?;
    }

    Ok(AllocGroup {
        index: agno,
        sb: sb_copy,
        agf,
        agi,
        sb_raw,
        agf_raw,
        agi_raw,
        agfl_raw,
        trees,
        roots,
    })
}

fn load_tree<R: Read + Seek>(
    reader: &mut BlockReader<R>,
    sb: &Superblock,
    agno: u32,
    kind: TreeKind,
    root: u32,
    mode: DecodeMode,
) -> Result<Option<Vec<u8>>, ProbeError> {
    let blockno = agno as u64 * sb.ag_blocks as u64 + root as u64;
    let block = reader.read_blocks(blockno, 1)?;
    ProbeError::check_len("btree block", &block, 4)?;
    let magic = BigEndian::read_u32(&block);
    let accepted = kind.accepted_magics();
    if accepted.contains(&magic) {
        debug!("AG {agno}: {} root at block {blockno}", kind.name());
        return Ok(Some(block));
    }
    let err = ProbeError::bad_magic(
        kind.name(),
        format!("AG {agno} block {blockno}"),
        accepted[0] as u64,
        magic as u64,
    );
    mode.tolerate(Err(err))?;
    Ok(None)
}
