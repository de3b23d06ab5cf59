//! XFS on-disk constants and field layouts.
//!
//! Every multi-byte XFS field is big-endian. Offsets below are byte offsets
//! from the start of the structure.

use crate::fs::fields::{Field, FieldKind::*};

// ---- Magic numbers ----

pub const XFS_SB_MAGIC: u32 = 0x5846_5342; // "XFSB"
pub const XFS_AGF_MAGIC: u32 = 0x5841_4746; // "XAGF"
pub const XFS_AGI_MAGIC: u32 = 0x5841_4749; // "XAGI"
pub const XFS_AGFL_MAGIC: u32 = 0x5841_464C; // "XAFL"

pub const XFS_ABTB_MAGIC: u32 = 0x4142_5442; // "ABTB"
pub const XFS_ABTB_CRC_MAGIC: u32 = 0x4142_3342; // "AB3B"
pub const XFS_ABTC_MAGIC: u32 = 0x4142_5443; // "ABTC"
pub const XFS_ABTC_CRC_MAGIC: u32 = 0x4142_3343; // "AB3C"
pub const XFS_IBT_MAGIC: u32 = 0x4941_4254; // "IABT"
pub const XFS_IBT_CRC_MAGIC: u32 = 0x4941_4233; // "IAB3"
pub const XFS_FIBT_MAGIC: u32 = 0x4649_4254; // "FIBT"
pub const XFS_FIBT_CRC_MAGIC: u32 = 0x4649_4233; // "FIB3"
pub const XFS_REFC_CRC_MAGIC: u32 = 0x5233_4643; // "R3FC"
pub const XFS_RMAP_CRC_MAGIC: u32 = 0x524D_4233; // "RMB3"
pub const XFS_BMAP_MAGIC: u32 = 0x424D_4150; // "BMAP"
pub const XFS_BMAP_CRC_MAGIC: u32 = 0x424D_4133; // "BMA3"

pub const XFS_DINODE_MAGIC: u16 = 0x494E; // "IN"
pub const XFS_DQUOT_MAGIC: u16 = 0x4451; // "DQ"
pub const XLOG_HEADER_MAGIC: u32 = 0xFEED_BABE;

// ---- Superblock version / feature bits ----

pub const XFS_SB_VERSION_NUMBITS: u16 = 0x000F;
pub const XFS_SB_VERSION_5: u16 = 5;
pub const XFS_SB_VERSION_MOREBITSBIT: u16 = 0x8000;

pub const VERSION_BIT_NAMES: &[(u16, &str)] = &[
    (0x0010, "ATTR"),
    (0x0020, "NLINK"),
    (0x0040, "QUOTA"),
    (0x0080, "ALIGN"),
    (0x0100, "DALIGN"),
    (0x0200, "SHARED"),
    (0x0400, "LOGV2"),
    (0x0800, "SECTOR"),
    (0x1000, "EXTFLG"),
    (0x2000, "DIRV2"),
    (0x4000, "BORG"),
    (0x8000, "MOREBITS"),
];

pub const XFS_SB_VERSION2_FTYPE: u32 = 0x0000_0200;

pub const FEATURES2_NAMES: &[(u32, &str)] = &[
    (0x0000_0002, "LAZYSBCOUNT"),
    (0x0000_0008, "ATTR2"),
    (0x0000_0010, "PARENT"),
    (0x0000_0080, "PROJID32"),
    (0x0000_0100, "CRC"),
    (XFS_SB_VERSION2_FTYPE, "FTYPE"),
];

pub const XFS_SB_FEAT_RO_COMPAT_FINOBT: u32 = 1 << 0;
pub const XFS_SB_FEAT_RO_COMPAT_RMAPBT: u32 = 1 << 1;
pub const XFS_SB_FEAT_RO_COMPAT_REFLINK: u32 = 1 << 2;

pub const RO_COMPAT_NAMES: &[(u32, &str)] = &[
    (XFS_SB_FEAT_RO_COMPAT_FINOBT, "FINOBT"),
    (XFS_SB_FEAT_RO_COMPAT_RMAPBT, "RMAPBT"),
    (XFS_SB_FEAT_RO_COMPAT_REFLINK, "REFLINK"),
    (1 << 3, "INOBTCNT"),
];

pub const XFS_SB_FEAT_INCOMPAT_FTYPE: u32 = 1 << 0;
pub const XFS_SB_FEAT_INCOMPAT_SPINODES: u32 = 1 << 1;

pub const INCOMPAT_NAMES: &[(u32, &str)] = &[
    (XFS_SB_FEAT_INCOMPAT_FTYPE, "FTYPE"),
    (XFS_SB_FEAT_INCOMPAT_SPINODES, "SPINODES"),
    (1 << 2, "META_UUID"),
    (1 << 3, "BIGTIME"),
    (1 << 4, "NEEDSREPAIR"),
    (1 << 5, "NREXT64"),
];

pub const LOG_INCOMPAT_NAMES: &[(u32, &str)] = &[(1 << 0, "XATTRS")];

/// Names of the bits set in `value`, plus any unnamed leftovers in hex.
pub fn flag_names<T>(value: T, table: &[(T, &str)]) -> String
where
    T: Copy + Into<u64>,
{
    let value: u64 = value.into();
    let mut known = 0u64;
    let mut names: Vec<String> = Vec::new();
    for &(bit, name) in table {
        let bit: u64 = bit.into();
        known |= bit;
        if value & bit != 0 {
            names.push(name.to_string());
        }
    }
    let unknown = value & !known;
    if unknown != 0 {
        names.push(format!("{unknown:#x}"));
    }
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join("|")
    }
}

// ---- Superblock layout ----

pub const SB_MAGICNUM: usize = 0x00;
pub const SB_BLOCKSIZE: usize = 0x04;
pub const SB_DBLOCKS: usize = 0x08;
pub const SB_UUID: usize = 0x20;
pub const SB_ROOTINO: usize = 0x38;
pub const SB_AGBLOCKS: usize = 0x54;
pub const SB_AGCOUNT: usize = 0x58;
pub const SB_VERSIONNUM: usize = 0x64;
pub const SB_SECTSIZE: usize = 0x66;
pub const SB_INODESIZE: usize = 0x68;
pub const SB_INOPBLOCK: usize = 0x6A;
pub const SB_FNAME: usize = 0x6C;
pub const SB_BLOCKLOG: usize = 0x78;
pub const SB_SECTLOG: usize = 0x79;
pub const SB_INODELOG: usize = 0x7A;
pub const SB_INOPBLOG: usize = 0x7B;
pub const SB_AGBLKLOG: usize = 0x7C;
pub const SB_ICOUNT: usize = 0x80;
pub const SB_IFREE: usize = 0x88;
pub const SB_FDBLOCKS: usize = 0x90;
pub const SB_FEATURES2: usize = 0xC8;
pub const SB_FEATURES_COMPAT: usize = 0xD0;
pub const SB_FEATURES_RO_COMPAT: usize = 0xD4;
pub const SB_FEATURES_INCOMPAT: usize = 0xD8;
pub const SB_FEATURES_LOG_INCOMPAT: usize = 0xDC;
/// End of the v4 fields.
pub const SB_V4_SIZE: usize = 0xD0;
/// End of the v5 fields (`sb_meta_uuid` included).
pub const SB_V5_SIZE: usize = 0x108;

pub static SUPERBLOCK_FIELDS: &[Field] = &[
    Field::new("magicnum", 0x00, Hex32),
    Field::new("blocksize", 0x04, U32),
    Field::new("dblocks", 0x08, U64),
    Field::new("rblocks", 0x10, U64),
    Field::new("rextents", 0x18, U64),
    Field::new("uuid", 0x20, Uuid),
    Field::new("logstart", 0x30, U64),
    Field::new("rootino", 0x38, U64),
    Field::new("rbmino", 0x40, U64),
    Field::new("rsumino", 0x48, U64),
    Field::new("rextsize", 0x50, U32),
    Field::new("agblocks", 0x54, U32),
    Field::new("agcount", 0x58, U32),
    Field::new("rbmblocks", 0x5C, U32),
    Field::new("logblocks", 0x60, U32),
    Field::new("versionnum", 0x64, Hex16),
    Field::new("sectsize", 0x66, U16),
    Field::new("inodesize", 0x68, U16),
    Field::new("inopblock", 0x6A, U16),
    Field::new("fname", 0x6C, Text(12)),
    Field::new("blocklog", 0x78, U8),
    Field::new("sectlog", 0x79, U8),
    Field::new("inodelog", 0x7A, U8),
    Field::new("inopblog", 0x7B, U8),
    Field::new("agblklog", 0x7C, U8),
    Field::new("rextslog", 0x7D, U8),
    Field::new("inprogress", 0x7E, U8),
    Field::new("imax_pct", 0x7F, U8),
    Field::new("icount", 0x80, U64),
    Field::new("ifree", 0x88, U64),
    Field::new("fdblocks", 0x90, U64),
    Field::new("frextents", 0x98, U64),
    Field::new("uquotino", 0xA0, U64),
    Field::new("gquotino", 0xA8, U64),
    Field::new("qflags", 0xB0, Hex16),
    Field::new("flags", 0xB2, U8),
    Field::new("shared_vn", 0xB3, U8),
    Field::new("inoalignmt", 0xB4, U32),
    Field::new("unit", 0xB8, U32),
    Field::new("width", 0xBC, U32),
    Field::new("dirblklog", 0xC0, U8),
    Field::new("logsectlog", 0xC1, U8),
    Field::new("logsectsize", 0xC2, U16),
    Field::new("logsunit", 0xC4, U32),
    Field::new("features2", 0xC8, Hex32),
    Field::new("bad_features2", 0xCC, Hex32),
];

pub static SUPERBLOCK_V5_FIELDS: &[Field] = &[
    Field::new("features_compat", 0xD0, Hex32),
    Field::new("features_ro_compat", 0xD4, Hex32),
    Field::new("features_incompat", 0xD8, Hex32),
    Field::new("features_log_incompat", 0xDC, Hex32),
    Field::new("crc", 0xE0, Hex32),
    Field::new("spino_align", 0xE4, U32),
    Field::new("pquotino", 0xE8, U64),
    Field::new("lsn", 0xF0, Hex64),
    Field::new("meta_uuid", 0xF8, Uuid),
];

// ---- AG header layouts ----

pub const AGF_SEQNO: usize = 0x08;
pub const AGF_BNO_ROOT: usize = 0x10;
pub const AGF_CNT_ROOT: usize = 0x14;
pub const AGF_FREEBLKS: usize = 0x34;
pub const AGF_REFCOUNT_ROOT: usize = 0x58;

pub static AGF_FIELDS: &[Field] = &[
    Field::new("magicnum", 0x00, Hex32),
    Field::new("versionnum", 0x04, U32),
    Field::new("seqno", 0x08, U32),
    Field::new("length", 0x0C, U32),
    Field::new("bno_root", 0x10, U32),
    Field::new("cnt_root", 0x14, U32),
    Field::new("rmap_root", 0x18, U32),
    Field::new("bno_level", 0x1C, U32),
    Field::new("cnt_level", 0x20, U32),
    Field::new("rmap_level", 0x24, U32),
    Field::new("flfirst", 0x28, U32),
    Field::new("fllast", 0x2C, U32),
    Field::new("flcount", 0x30, U32),
    Field::new("freeblks", 0x34, U32),
    Field::new("longest", 0x38, U32),
    Field::new("btreeblks", 0x3C, U32),
    Field::new("uuid", 0x40, Uuid),
    Field::new("rmap_blocks", 0x50, U32),
    Field::new("refcount_blocks", 0x54, U32),
    Field::new("refcount_root", 0x58, U32),
    Field::new("refcount_level", 0x5C, U32),
    Field::new("lsn", 0xD0, Hex64),
    Field::new("crc", 0xD8, Hex32),
];

pub const AGI_SEQNO: usize = 0x08;
pub const AGI_ROOT: usize = 0x14;
pub const AGI_FREE_ROOT: usize = 0x148;

pub static AGI_FIELDS: &[Field] = &[
    Field::new("magicnum", 0x00, Hex32),
    Field::new("versionnum", 0x04, U32),
    Field::new("seqno", 0x08, U32),
    Field::new("length", 0x0C, U32),
    Field::new("count", 0x10, U32),
    Field::new("root", 0x14, U32),
    Field::new("level", 0x18, U32),
    Field::new("freecount", 0x1C, U32),
    Field::new("newino", 0x20, U32),
    Field::new("dirino", 0x24, U32),
    Field::new("uuid", 0x128, Uuid),
    Field::new("crc", 0x138, Hex32),
    Field::new("lsn", 0x140, Hex64),
    Field::new("free_root", 0x148, U32),
    Field::new("free_level", 0x14C, U32),
    Field::new("iblocks", 0x150, U32),
    Field::new("fblocks", 0x154, U32),
];

/// Start of the AGFL block-number array on v5 (CRC) filesystems.
pub const AGFL_V5_BNO_OFFSET: usize = 0x24;

pub static AGFL_FIELDS: &[Field] = &[
    Field::new("magicnum", 0x00, Hex32),
    Field::new("seqno", 0x04, U32),
    Field::new("uuid", 0x08, Uuid),
    Field::new("lsn", 0x18, Hex64),
    Field::new("crc", 0x20, Hex32),
];

// ---- B+tree block headers ----

/// magic + level + numrecs + 32-bit sibling pointers.
pub const BTREE_SBLOCK_LEN: usize = 16;
/// Short form plus blkno, lsn, uuid, owner and crc.
pub const BTREE_SBLOCK_CRC_LEN: usize = 56;

pub static BTREE_SBLOCK_FIELDS: &[Field] = &[
    Field::new("magic", 0x00, Hex32),
    Field::new("level", 0x04, U16),
    Field::new("numrecs", 0x06, U16),
    Field::new("leftsib", 0x08, Hex32),
    Field::new("rightsib", 0x0C, Hex32),
];

pub static BTREE_SBLOCK_CRC_FIELDS: &[Field] = &[
    Field::new("blkno", 0x10, U64),
    Field::new("lsn", 0x18, Hex64),
    Field::new("uuid", 0x20, Uuid),
    Field::new("owner", 0x30, U32),
    Field::new("crc", 0x34, Hex32),
];

/// Free-space record: startblock + blockcount.
pub const ALLOC_REC_LEN: usize = 8;
/// Inode btree record: startino, counts, free mask.
pub const INOBT_REC_LEN: usize = 16;
/// Refcount record: startblock + blockcount + refcount.
pub const REFCOUNT_REC_LEN: usize = 12;

// ---- Inode layout ----

pub const DI_MAGIC: usize = 0x00;
pub const DI_MODE: usize = 0x02;
pub const DI_VERSION: usize = 0x04;
pub const DI_FORMAT: usize = 0x05;
pub const DI_ONLINK: usize = 0x06;
pub const DI_UID: usize = 0x08;
pub const DI_GID: usize = 0x0C;
pub const DI_NLINK: usize = 0x10;
pub const DI_ATIME: usize = 0x20;
pub const DI_MTIME: usize = 0x28;
pub const DI_CTIME: usize = 0x30;
pub const DI_SIZE: usize = 0x38;
pub const DI_NBLOCKS: usize = 0x40;
pub const DI_EXTSIZE: usize = 0x48;
pub const DI_NEXTENTS: usize = 0x4C;
pub const DI_ANEXTENTS: usize = 0x50;
pub const DI_FORKOFF: usize = 0x52;
pub const DI_AFORMAT: usize = 0x53;
pub const DI_FLAGS: usize = 0x5A;
pub const DI_GEN: usize = 0x5C;
/// `di_crc` starts the v3 extension; v1/v2 cores end here.
pub const DI_CRC: usize = 0x64;
pub const DI_CHANGECOUNT: usize = 0x68;
pub const DI_LSN: usize = 0x70;
pub const DI_FLAGS2: usize = 0x78;
pub const DI_CRTIME: usize = 0x90;
pub const DI_INO: usize = 0x98;
pub const DI_UUID: usize = 0xA0;
/// Full v3 core size.
pub const DINODE_V3_SIZE: usize = 0xB0;

pub const XFS_DIFLAG2_BIGTIME: u64 = 1 << 3;

// ---- Dquot and log record header (display only) ----

pub static DQUOT_FIELDS: &[Field] = &[
    Field::new("magic", 0x00, Hex16),
    Field::new("version", 0x02, U8),
    Field::new("type", 0x03, U8),
    Field::new("id", 0x04, U32),
    Field::new("blk_hardlimit", 0x08, U64),
    Field::new("blk_softlimit", 0x10, U64),
    Field::new("ino_hardlimit", 0x18, U64),
    Field::new("ino_softlimit", 0x20, U64),
    Field::new("bcount", 0x28, U64),
    Field::new("icount", 0x30, U64),
    Field::new("itimer", 0x38, U32),
    Field::new("btimer", 0x3C, U32),
    Field::new("iwarns", 0x40, U16),
    Field::new("bwarns", 0x42, U16),
    Field::new("rtb_hardlimit", 0x48, U64),
    Field::new("rtb_softlimit", 0x50, U64),
    Field::new("rtbcount", 0x58, U64),
    Field::new("rtbtimer", 0x60, U32),
    Field::new("rtbwarns", 0x64, U16),
];

pub static LOG_RECORD_FIELDS: &[Field] = &[
    Field::new("magicno", 0x00, Hex32),
    Field::new("cycle", 0x04, U32),
    Field::new("version", 0x08, U32),
    Field::new("len", 0x0C, U32),
    Field::new("lsn", 0x10, Hex64),
    Field::new("tail_lsn", 0x18, Hex64),
    Field::new("crc", 0x20, Hex32),
    Field::new("prev_block", 0x24, U32),
    Field::new("num_logops", 0x28, U32),
    Field::new("fmt", 0x12C, U32),
    Field::new("fs_uuid", 0x130, Uuid),
    Field::new("size", 0x140, U32),
];
