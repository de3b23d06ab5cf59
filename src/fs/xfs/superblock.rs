//! XFS superblock parsing and geometry validation.

use byteorder::{BigEndian, ByteOrder};
use log::warn;
use std::fmt::Write;

use super::format::*;
use crate::error::ProbeError;
use crate::fs::fields::{format_uuid, render_fields};
use crate::fs::DecodeMode;

/// Decoded XFS superblock.
///
/// Only [`Superblock::fit_device`] changes it after parsing.
#[derive(Debug, Clone)]
pub struct Superblock {
    pub magic: u32,
    pub block_size: u32,
    pub dblocks: u64,
    pub uuid: [u8; 16],
    pub root_ino: u64,
    pub ag_blocks: u32,
    pub ag_count: u32,
    pub versionnum: u16,
    pub sect_size: u16,
    pub inode_size: u16,
    pub inodes_per_block: u16,
    pub fname: String,
    pub block_log: u8,
    pub sect_log: u8,
    pub inode_log: u8,
    pub inop_blog: u8,
    pub ag_blk_log: u8,
    pub icount: u64,
    pub ifree: u64,
    pub fdblocks: u64,
    pub features2: u32,
    pub features_compat: u32,
    pub features_ro_compat: u32,
    pub features_incompat: u32,
    pub features_log_incompat: u32,
    raw: Vec<u8>,
}

impl Superblock {
    /// Parse the superblock fields from `data`.
    ///
    /// Only the layout is decoded here; call [`Superblock::validate`] to
    /// check the magic and geometry. The v5 feature words are read only when
    /// the version nibble says they exist.
    pub fn parse(data: &[u8]) -> Result<Self, ProbeError> {
        ProbeError::check_len("superblock", data, SB_V4_SIZE)?;

        let versionnum = BigEndian::read_u16(&data[SB_VERSIONNUM..]);
        let v5 = versionnum & XFS_SB_VERSION_NUMBITS == XFS_SB_VERSION_5;
        if v5 {
            ProbeError::check_len("v5 superblock", data, SB_V5_SIZE)?;
        }
        let v5_word = |off: usize| if v5 { BigEndian::read_u32(&data[off..]) } else { 0 };

        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&data[SB_UUID..SB_UUID + 16]);
        let fname_raw = &data[SB_FNAME..SB_FNAME + 12];
        let fname_end = fname_raw.iter().position(|&b| b == 0).unwrap_or(12);

        Ok(Superblock {
            magic: BigEndian::read_u32(&data[SB_MAGICNUM..]),
            block_size: BigEndian::read_u32(&data[SB_BLOCKSIZE..]),
            dblocks: BigEndian::read_u64(&data[SB_DBLOCKS..]),
            uuid,
            root_ino: BigEndian::read_u64(&data[SB_ROOTINO..]),
            ag_blocks: BigEndian::read_u32(&data[SB_AGBLOCKS..]),
            ag_count: BigEndian::read_u32(&data[SB_AGCOUNT..]),
            versionnum,
            sect_size: BigEndian::read_u16(&data[SB_SECTSIZE..]),
            inode_size: BigEndian::read_u16(&data[SB_INODESIZE..]),
            inodes_per_block: BigEndian::read_u16(&data[SB_INOPBLOCK..]),
            fname: String::from_utf8_lossy(&fname_raw[..fname_end]).into_owned(),
            block_log: data[SB_BLOCKLOG],
            sect_log: data[SB_SECTLOG],
            inode_log: data[SB_INODELOG],
            inop_blog: data[SB_INOPBLOG],
            ag_blk_log: data[SB_AGBLKLOG],
            icount: BigEndian::read_u64(&data[SB_ICOUNT..]),
            ifree: BigEndian::read_u64(&data[SB_IFREE..]),
            fdblocks: BigEndian::read_u64(&data[SB_FDBLOCKS..]),
            features2: BigEndian::read_u32(&data[SB_FEATURES2..]),
            features_compat: v5_word(SB_FEATURES_COMPAT),
            features_ro_compat: v5_word(SB_FEATURES_RO_COMPAT),
            features_incompat: v5_word(SB_FEATURES_INCOMPAT),
            features_log_incompat: v5_word(SB_FEATURES_LOG_INCOMPAT),
            raw: data[..data.len().min(SB_V5_SIZE)].to_vec(),
        })
    }

    pub fn version(&self) -> u16 {
        self.versionnum & XFS_SB_VERSION_NUMBITS
    }

    pub fn is_v5(&self) -> bool {
        self.version() == XFS_SB_VERSION_5
    }

    pub fn has_finobt(&self) -> bool {
        self.is_v5() && self.features_ro_compat & XFS_SB_FEAT_RO_COMPAT_FINOBT != 0
    }

    pub fn has_reflink(&self) -> bool {
        self.is_v5() && self.features_ro_compat & XFS_SB_FEAT_RO_COMPAT_REFLINK != 0
    }

    pub fn has_rmapbt(&self) -> bool {
        self.is_v5() && self.features_ro_compat & XFS_SB_FEAT_RO_COMPAT_RMAPBT != 0
    }

    pub fn has_sparse_inodes(&self) -> bool {
        self.is_v5() && self.features_incompat & XFS_SB_FEAT_INCOMPAT_SPINODES != 0
    }

    /// Whether directory entries carry a file-type byte.
    pub fn has_ftype(&self) -> bool {
        if self.is_v5() {
            return self.features_incompat & XFS_SB_FEAT_INCOMPAT_FTYPE != 0;
        }
        self.versionnum & XFS_SB_VERSION_MOREBITSBIT != 0
            && self.features2 & XFS_SB_VERSION2_FTYPE != 0
    }

    pub fn uuid_string(&self) -> String {
        format_uuid(&self.uuid)
    }

    /// Byte offset of allocation group `agno` from the start of the image.
    pub fn ag_byte_offset(&self, agno: u32) -> u64 {
        agno as u64 * self.ag_blocks as u64 * self.block_size as u64
    }

    /// Check the magic and every size/log2 pair.
    ///
    /// A magic mismatch is always returned as an error. Each geometry
    /// mismatch is passed through `mode`, so best-effort callers get a
    /// warning per bad pair and the remaining pairs are still checked.
    /// `agblocks` is not compared with `agblklog`: real images
    /// round the log up.
    pub fn validate(&self, location: &str, mode: DecodeMode) -> Result<(), ProbeError> {
        if self.magic != XFS_SB_MAGIC {
            return Err(ProbeError::bad_magic(
                "superblock",
                location,
                XFS_SB_MAGIC as u64,
                self.magic as u64,
            ));
        }

        let pairs: [(&'static str, u64, u8); 4] = [
            ("blocksize", self.block_size as u64, self.block_log),
            ("sectsize", self.sect_size as u64, self.sect_log),
            ("inodesize", self.inode_size as u64, self.inode_log),
            ("inopblock", self.inodes_per_block as u64, self.inop_blog),
        ];
        for (field, size, log2) in pairs {
            mode.tolerate(check_log2(location, field, size, log2))?;
        }
        Ok(())
    }

    /// Check `agblocks`, `agcount` and `dblocks` against each other and the
    /// image length.
    ///
    /// Zero AG sizes or counts, and AG counts that the device cannot hold,
    /// always fail. A `dblocks` past the AGs or the image goes through
    /// `mode`; when tolerated it is clamped so later allocations are sized
    /// by what is really there.
    pub fn fit_device(&mut self, location: &str, image_len: u64, mode: DecodeMode) -> Result<(), ProbeError> {
        let out_of_range = |field, value, min, max| ProbeError::GeometryOutOfRange {
            location: location.to_string(),
            field,
            value,
            min,
            max,
        };
        if self.ag_blocks == 0 {
            return Err(out_of_range("agblocks", 0, 1, u32::MAX as u64));
        }
        if self.ag_count == 0 {
            return Err(out_of_range("agcount", 0, 1, u32::MAX as u64));
        }

        let image_blocks = image_len / (self.block_size as u64).max(1);
        let limit = (self.ag_count as u64 * self.ag_blocks as u64).min(image_blocks);
        if self.dblocks == 0 || self.dblocks > limit {
            mode.tolerate(Err(out_of_range("dblocks", self.dblocks, 1, limit)))?;
            warn!("{location}: using {limit} blocks instead of {}", self.dblocks);
            self.dblocks = limit;
        }

        let max_ags = self.dblocks.div_ceil(self.ag_blocks as u64);
        if self.ag_count as u64 > max_ags {
            return Err(out_of_range("agcount", self.ag_count as u64, 1, max_ags));
        }
        Ok(())
    }

    /// Human-readable dump: the field table plus decoded feature names.
    pub fn render(&self) -> String {
        let mut out = render_fields("superblock", SUPERBLOCK_FIELDS, &self.raw);
        if self.is_v5() {
            let v5 = render_fields("v5 fields", SUPERBLOCK_V5_FIELDS, &self.raw);
            out.push_str(&v5);
        }
        let _ = writeln!(out, "features:");
        let _ = writeln!(out, "  version     = {}", self.version());
        let _ = writeln!(
            out,
            "  versionnum  = {}",
            flag_names(self.versionnum & !XFS_SB_VERSION_NUMBITS, VERSION_BIT_NAMES)
        );
        let _ = writeln!(out, "  features2   = {}", flag_names(self.features2, FEATURES2_NAMES));
        if self.is_v5() {
            let _ = writeln!(out, "  compat      = {}", flag_names(self.features_compat, &[]));
            let _ = writeln!(
                out,
                "  ro_compat   = {}",
                flag_names(self.features_ro_compat, RO_COMPAT_NAMES)
            );
            let _ = writeln!(
                out,
                "  incompat    = {}",
                flag_names(self.features_incompat, INCOMPAT_NAMES)
            );
            let _ = writeln!(
                out,
                "  log_incompat = {}",
                flag_names(self.features_log_incompat, LOG_INCOMPAT_NAMES)
            );
        }
        out
    }
}

fn check_log2(location: &str, field: &'static str, size: u64, log2: u8) -> Result<(), ProbeError> {
    if log2 >= 64 || size != 1u64 << log2 {
        return Err(ProbeError::InconsistentGeometry {
            location: location.to_string(),
            field,
            size,
            log2,
        });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A minimal valid v4 superblock: 4 KiB blocks, 512-byte sectors and
    /// inodes, one AG of 16 blocks.
    pub(crate) fn make_superblock() -> Vec<u8> {
        let mut sb = vec![0u8; 512];
        BigEndian::write_u32(&mut sb[SB_MAGICNUM..], XFS_SB_MAGIC);
        BigEndian::write_u32(&mut sb[SB_BLOCKSIZE..], 4096);
        BigEndian::write_u64(&mut sb[SB_DBLOCKS..], 16);
        BigEndian::write_u64(&mut sb[SB_ROOTINO..], 128);
        BigEndian::write_u32(&mut sb[SB_AGBLOCKS..], 16);
        BigEndian::write_u32(&mut sb[SB_AGCOUNT..], 1);
        BigEndian::write_u16(&mut sb[SB_VERSIONNUM..], 0xB4A4);
        BigEndian::write_u16(&mut sb[SB_SECTSIZE..], 512);
        BigEndian::write_u16(&mut sb[SB_INODESIZE..], 512);
        BigEndian::write_u16(&mut sb[SB_INOPBLOCK..], 8);
        sb[SB_FNAME..SB_FNAME + 4].copy_from_slice(b"test");
        sb[SB_BLOCKLOG] = 12;
        sb[SB_SECTLOG] = 9;
        sb[SB_INODELOG] = 9;
        sb[SB_INOPBLOG] = 3;
        sb[SB_AGBLKLOG] = 4;
        sb
    }

    #[test]
    fn test_parse_valid() {
        let sb = Superblock::parse(&make_superblock()).unwrap();
        assert_eq!(sb.block_size, 4096);
        assert_eq!(sb.root_ino, 128);
        assert_eq!(sb.fname, "test");
        assert_eq!(sb.version(), 4);
        assert!(!sb.is_v5());
        assert!(sb.validate("primary", DecodeMode::STRICT).is_ok());
    }

    #[test]
    fn test_bad_magic() {
        let mut raw = make_superblock();
        raw[0] = b'Y';
        let sb = Superblock::parse(&raw).unwrap();
        let err = sb.validate("primary", DecodeMode::BEST_EFFORT).unwrap_err();
        assert!(matches!(err, ProbeError::BadMagic { .. }));
    }

    #[test]
    fn test_each_geometry_pair_rejected() {
        for (off, field) in [
            (SB_BLOCKLOG, "blocksize"),
            (SB_SECTLOG, "sectsize"),
            (SB_INODELOG, "inodesize"),
            (SB_INOPBLOG, "inopblock"),
        ] {
            let mut raw = make_superblock();
            raw[off] += 1;
            let sb = Superblock::parse(&raw).unwrap();
            match sb.validate("primary", DecodeMode::STRICT) {
                Err(ProbeError::InconsistentGeometry { field: f, .. }) => assert_eq!(f, field),
                other => panic!("expected geometry error for {field}, got {other:?}"),
            }
            assert!(sb.validate("primary", DecodeMode::BEST_EFFORT).is_ok());
        }
    }

    #[test]
    fn test_agblklog_not_checked() {
        let mut raw = make_superblock();
        BigEndian::write_u32(&mut raw[SB_AGBLOCKS..], 15);
        let sb = Superblock::parse(&raw).unwrap();
        assert!(sb.validate("primary", DecodeMode::STRICT).is_ok());
    }

    #[test]
    fn test_fit_device_rejects_impossible_agcount() {
        let mut raw = make_superblock();
        BigEndian::write_u32(&mut raw[SB_AGCOUNT..], u32::MAX);
        let mut sb = Superblock::parse(&raw).unwrap();
        // dblocks (16) is within agcount * agblocks, so only agcount is wrong.
        match sb.fit_device("primary", 16 * 4096, DecodeMode::BEST_EFFORT) {
            Err(ProbeError::GeometryOutOfRange { field, value, max, .. }) => {
                assert_eq!((field, value, max), ("agcount", u32::MAX as u64, 1));
            }
            other => panic!("expected agcount error, got {other:?}"),
        }

        BigEndian::write_u32(&mut raw[SB_AGCOUNT..], 0);
        let mut sb = Superblock::parse(&raw).unwrap();
        assert!(matches!(
            sb.fit_device("primary", 16 * 4096, DecodeMode::BEST_EFFORT),
            Err(ProbeError::GeometryOutOfRange { field: "agcount", .. })
        ));
    }

    #[test]
    fn test_fit_device_dblocks_strict_and_clamped() {
        let mut raw = make_superblock();
        BigEndian::write_u64(&mut raw[SB_DBLOCKS..], 1 << 52);
        let mut sb = Superblock::parse(&raw).unwrap();
        assert!(matches!(
            sb.fit_device("primary", 16 * 4096, DecodeMode::STRICT),
            Err(ProbeError::GeometryOutOfRange { field: "dblocks", max: 16, .. })
        ));

        let mut sb = Superblock::parse(&raw).unwrap();
        sb.fit_device("primary", 12 * 4096, DecodeMode::BEST_EFFORT).unwrap();
        assert_eq!(sb.dblocks, 12);
    }

    #[test]
    fn test_fit_device_accepts_short_last_ag() {
        let mut raw = make_superblock();
        BigEndian::write_u64(&mut raw[SB_DBLOCKS..], 20);
        BigEndian::write_u32(&mut raw[SB_AGCOUNT..], 2);
        let mut sb = Superblock::parse(&raw).unwrap();
        sb.fit_device("primary", 20 * 4096, DecodeMode::STRICT).unwrap();
        assert_eq!(sb.dblocks, 20);
    }

    #[test]
    fn test_truncated() {
        let raw = make_superblock();
        assert!(matches!(
            Superblock::parse(&raw[..100]),
            Err(ProbeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_v5_features() {
        let mut raw = make_superblock();
        BigEndian::write_u16(&mut raw[SB_VERSIONNUM..], 0xB4A5);
        BigEndian::write_u32(
            &mut raw[SB_FEATURES_RO_COMPAT..],
            XFS_SB_FEAT_RO_COMPAT_FINOBT | XFS_SB_FEAT_RO_COMPAT_REFLINK,
        );
        BigEndian::write_u32(
            &mut raw[SB_FEATURES_INCOMPAT..],
            XFS_SB_FEAT_INCOMPAT_FTYPE | XFS_SB_FEAT_INCOMPAT_SPINODES,
        );
        let sb = Superblock::parse(&raw).unwrap();
        assert!(sb.is_v5());
        assert!(sb.has_finobt());
        assert!(sb.has_reflink());
        assert!(!sb.has_rmapbt());
        assert!(sb.has_sparse_inodes());
        assert!(sb.has_ftype());
        let text = sb.render();
        assert!(text.contains("ro_compat   = FINOBT|REFLINK"));
        assert!(text.contains("incompat    = FTYPE|SPINODES"));
    }

    #[test]
    fn test_v4_ftype_via_features2() {
        let mut raw = make_superblock();
        let sb = Superblock::parse(&raw).unwrap();
        assert!(!sb.has_ftype());
        BigEndian::write_u32(&mut raw[SB_FEATURES2..], XFS_SB_VERSION2_FTYPE);
        let sb = Superblock::parse(&raw).unwrap();
        assert!(sb.has_ftype());
    }

    #[test]
    fn test_v4_ignores_v5_words() {
        let mut raw = make_superblock();
        BigEndian::write_u32(&mut raw[SB_FEATURES_RO_COMPAT..], XFS_SB_FEAT_RO_COMPAT_FINOBT);
        let sb = Superblock::parse(&raw).unwrap();
        assert_eq!(sb.features_ro_compat, 0);
        assert!(!sb.has_finobt());
    }
}
