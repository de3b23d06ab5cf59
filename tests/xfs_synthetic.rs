use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::io::{Cursor, Read, Seek};

use rusty_probe::blockdev::BlockReader;
use rusty_probe::fs::xfs::ag::TreeKind;
use rusty_probe::fs::xfs::format::*;
use rusty_probe::fs::xfs::freespace::ChunkSink;
use rusty_probe::fs::xfs::inode::ForkData;
use rusty_probe::fs::xfs::registry::StructureKind;
use rusty_probe::fs::xfs::scan::{ScanHit, ScanOptions};
use rusty_probe::fs::xfs::XfsDecoder;
use rusty_probe::{DecodeMode, ProbeError};

const BS: usize = 4096;
const SECT: usize = 512;
const INODE: usize = 512;
const AG_BLOCKS: usize = 16;
const ROOT_INO: u64 = 64;

/// Synthetic v4 filesystem: 4096-byte blocks, 16-block AGs, eight 512-byte
/// inodes per block. Each AG keeps its headers in block 0 and a one-leaf
/// free-space-by-block tree in block 1. Inodes 64-71 live in block 8.
struct ImageBuilder {
    data: Vec<u8>,
    ag_count: usize,
}

impl ImageBuilder {
    fn new(ag_count: usize, free: &[&[(u32, u32)]]) -> Self {
        let mut b = ImageBuilder {
            data: vec![0u8; ag_count * AG_BLOCKS * BS],
            ag_count,
        };
        for agno in 0..ag_count {
            b.write_ag(agno, free[agno]);
        }
        b
    }

    fn superblock(&self) -> Vec<u8> {
        let mut sb = vec![0u8; SECT];
        BigEndian::write_u32(&mut sb[SB_MAGICNUM..], XFS_SB_MAGIC);
        BigEndian::write_u32(&mut sb[SB_BLOCKSIZE..], BS as u32);
        BigEndian::write_u64(&mut sb[SB_DBLOCKS..], (self.ag_count * AG_BLOCKS) as u64);
        BigEndian::write_u64(&mut sb[SB_ROOTINO..], ROOT_INO);
        BigEndian::write_u32(&mut sb[SB_AGBLOCKS..], AG_BLOCKS as u32);
        BigEndian::write_u32(&mut sb[SB_AGCOUNT..], self.ag_count as u32);
        BigEndian::write_u16(&mut sb[SB_VERSIONNUM..], 0xB4A4);
        BigEndian::write_u16(&mut sb[SB_SECTSIZE..], SECT as u16);
        BigEndian::write_u16(&mut sb[SB_INODESIZE..], INODE as u16);
        BigEndian::write_u16(&mut sb[SB_INOPBLOCK..], (BS / INODE) as u16);
        sb[SB_FNAME..SB_FNAME + 5].copy_from_slice(b"synth");
        sb[SB_BLOCKLOG] = 12;
        sb[SB_SECTLOG] = 9;
        sb[SB_INODELOG] = 9;
        sb[SB_INOPBLOG] = 3;
        sb[SB_AGBLKLOG] = 4;
        sb
    }

    fn write_ag(&mut self, agno: usize, free: &[(u32, u32)]) {
        let base = agno * AG_BLOCKS * BS;
        let sb = self.superblock();
        self.data[base..base + SECT].copy_from_slice(&sb);

        let agf = &mut self.data[base + SECT..base + 2 * SECT];
        BigEndian::write_u32(&mut agf[0..], XFS_AGF_MAGIC);
        BigEndian::write_u32(&mut agf[AGF_SEQNO..], agno as u32);
        BigEndian::write_u32(&mut agf[AGF_BNO_ROOT..], 1);
        let total: u32 = free.iter().map(|&(_, n)| n).sum();
        BigEndian::write_u32(&mut agf[AGF_FREEBLKS..], total);

        let agi = &mut self.data[base + 2 * SECT..base + 3 * SECT];
        BigEndian::write_u32(&mut agi[0..], XFS_AGI_MAGIC);
        BigEndian::write_u32(&mut agi[AGI_SEQNO..], agno as u32);

        let leaf = &mut self.data[base + BS..base + 2 * BS];
        BigEndian::write_u32(&mut leaf[0..], XFS_ABTB_MAGIC);
        BigEndian::write_u16(&mut leaf[6..], free.len() as u16);
        BigEndian::write_u32(&mut leaf[8..], u32::MAX);
        BigEndian::write_u32(&mut leaf[12..], u32::MAX);
        for (i, &(start, count)) in free.iter().enumerate() {
            let off = 16 + i * 8;
            BigEndian::write_u32(&mut leaf[off..], start);
            BigEndian::write_u32(&mut leaf[off + 4..], count);
        }
    }

    fn primary_sb(&mut self) -> &mut [u8] {
        &mut self.data[..SECT]
    }

    fn agf(&mut self, agno: usize) -> &mut [u8] {
        let base = agno * AG_BLOCKS * BS + SECT;
        &mut self.data[base..base + SECT]
    }

    /// Write a v3 inode core for `ino` and return the slot for further edits.
    fn inode(&mut self, ino: u64, mode: u16, format: u8, fork: &[u8]) -> &mut [u8] {
        let at = 8 * BS + (ino - ROOT_INO) as usize * INODE;
        let slot = &mut self.data[at..at + INODE];
        slot.fill(0);
        BigEndian::write_u16(&mut slot[DI_MAGIC..], XFS_DINODE_MAGIC);
        BigEndian::write_u16(&mut slot[DI_MODE..], mode);
        slot[DI_VERSION] = 3;
        slot[DI_FORMAT] = format;
        BigEndian::write_u32(&mut slot[DI_NLINK..], 1);
        BigEndian::write_u64(&mut slot[DI_INO..], ino);
        slot[DINODE_V3_SIZE..DINODE_V3_SIZE + fork.len()].copy_from_slice(fork);
        slot
    }

    fn open(self, mode: DecodeMode) -> Result<XfsDecoder<Cursor<Vec<u8>>>, ProbeError> {
        XfsDecoder::detect(Cursor::new(self.data), mode)
    }
}

fn two_ag_image() -> ImageBuilder {
    ImageBuilder::new(2, &[&[(2, 3)], &[(3, 13)]])
}

struct Runs(Vec<(u64, u64)>);

impl ChunkSink for Runs {
    fn write_chunk<R: Read + Seek>(
        &mut self,
        _source: &mut BlockReader<R>,
        start: u64,
        count: u64,
    ) -> Result<(), ProbeError> {
        self.0.push((start, count));
        Ok(())
    }
}

#[test]
fn test_detect_two_groups() {
    let dec = two_ag_image().open(DecodeMode::STRICT).unwrap();
    let sb = dec.superblock();
    assert_eq!(sb.block_size, 4096);
    assert_eq!(sb.dblocks, 32);
    assert_eq!(sb.fname, "synth");
    assert_eq!(dec.allocation_groups().len(), 2);
    for ag in dec.allocation_groups() {
        assert!(ag.tree(TreeKind::FreeByBlock).is_some());
        assert!(ag.tree(TreeKind::Refcount).is_none());
    }
    assert!(dec.allocation_group(2).is_none());
}

#[test]
fn test_geometry_mismatch_per_pair() {
    let pairs = [
        ("blocksize", SB_BLOCKLOG, 11u8),
        ("sectsize", SB_SECTLOG, 10),
        ("inodesize", SB_INODELOG, 8),
        ("inopblock", SB_INOPBLOG, 4),
    ];
    for (name, offset, bad_log) in pairs {
        let mut img = two_ag_image();
        img.primary_sb()[offset] = bad_log;
        match img.open(DecodeMode::STRICT) {
            Err(ProbeError::InconsistentGeometry { field, log2, .. }) => {
                assert_eq!(field, name);
                assert_eq!(log2, bad_log);
            }
            Err(other) => panic!("{name}: unexpected error {other}"),
            Ok(_) => panic!("{name}: mismatch accepted in strict mode"),
        }

        let mut img = two_ag_image();
        img.primary_sb()[offset] = bad_log;
        assert!(img.open(DecodeMode::BEST_EFFORT).is_ok(), "{name}");
    }
}

#[test]
fn test_bad_primary_magic_fails_in_any_mode() {
    for mode in [DecodeMode::STRICT, DecodeMode::BEST_EFFORT] {
        let mut img = two_ag_image();
        img.primary_sb()[0] = b'Y';
        assert!(matches!(img.open(mode), Err(ProbeError::BadMagic { .. })));
    }
}

#[test]
fn test_bad_agf_magic_strict_and_best_effort() {
    let mut img = two_ag_image();
    img.agf(1)[0] = 0;
    match img.open(DecodeMode::STRICT) {
        Err(ProbeError::BadMagic { structure, location, .. }) => {
            assert_eq!(structure, "AGF");
            assert_eq!(location, "AG 1 sector 1");
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("bad AGF accepted in strict mode"),
    }

    let mut img = two_ag_image();
    img.agf(1)[0] = 0;
    let mut dec = img.open(DecodeMode::BEST_EFFORT).unwrap();
    assert!(dec.allocation_group(1).unwrap().tree(TreeKind::FreeByBlock).is_none());

    // AG 1 has no free tree, so every one of its blocks counts as used.
    let mut runs = Runs(Vec::new());
    assert_eq!(dec.export_to(&mut runs).unwrap(), 29);
    assert_eq!(runs.0, vec![(0, 2), (5, 27)]);
}

#[test]
fn test_ten_block_device_runs() {
    let mut img = ImageBuilder::new(1, &[&[(2, 3)]]);
    img.data.truncate(10 * BS);
    BigEndian::write_u64(&mut img.primary_sb()[SB_DBLOCKS..], 10);
    BigEndian::write_u32(&mut img.primary_sb()[SB_AGBLOCKS..], 10);

    let mut dec = img.open(DecodeMode::STRICT).unwrap();
    let mut runs = Runs(Vec::new());
    assert_eq!(dec.export_to(&mut runs).unwrap(), 7);
    assert_eq!(runs.0, vec![(0, 2), (5, 5)]);
}

#[test]
fn test_garbage_agcount_rejected_before_loading() {
    for mode in [DecodeMode::STRICT, DecodeMode::BEST_EFFORT] {
        let mut img = ImageBuilder::new(1, &[&[(2, 3)]]);
        BigEndian::write_u32(&mut img.primary_sb()[SB_AGCOUNT..], u32::MAX);
        assert!(matches!(
            img.open(mode),
            Err(ProbeError::GeometryOutOfRange { field: "agcount", max: 1, .. })
        ));
    }
}

#[test]
fn test_garbage_dblocks_strict_fails_best_effort_clamps() {
    let broken = || {
        let mut img = two_ag_image();
        BigEndian::write_u64(&mut img.primary_sb()[SB_DBLOCKS..], 1 << 52);
        img
    };
    assert!(matches!(
        broken().open(DecodeMode::STRICT),
        Err(ProbeError::GeometryOutOfRange { field: "dblocks", max: 32, .. })
    ));

    let mut dec = broken().open(DecodeMode::BEST_EFFORT).unwrap();
    assert_eq!(dec.superblock().dblocks, 32);
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("clamped.simg");
    assert_eq!(dec.export_sparse(&dest).unwrap(), 16);
    let out = std::fs::read(&dest).unwrap();
    assert_eq!(LittleEndian::read_u32(&out[16..]), 32);
}

#[test]
fn test_free_count_matches_or_not() {
    let mut dec = two_ag_image().open(DecodeMode::STRICT).unwrap();
    let mut runs = Runs(Vec::new());
    dec.export_to(&mut runs).unwrap();
    assert_eq!(runs.0, vec![(0, 2), (5, 14)]);

    // AGF claims one block more than the tree holds.
    let mut img = two_ag_image();
    BigEndian::write_u32(&mut img.agf(0)[AGF_FREEBLKS..], 4);
    let mut dec = img.open(DecodeMode::STRICT).unwrap();
    match dec.export_to(&mut Runs(Vec::new())) {
        Err(ProbeError::FreeCountMismatch { ag, expected, actual }) => {
            assert_eq!((ag, expected, actual), (0, 4, 3));
        }
        other => panic!("unexpected {other:?}"),
    }

    let mut img = two_ag_image();
    BigEndian::write_u32(&mut img.agf(0)[AGF_FREEBLKS..], 4);
    let mut dec = img.open(DecodeMode::BEST_EFFORT).unwrap();
    let mut runs = Runs(Vec::new());
    dec.export_to(&mut runs).unwrap();
    assert_eq!(runs.0, vec![(0, 2), (5, 14)]);
}

fn shortform(parent: u64, entries: &[(&str, u64)], wide: bool) -> Vec<u8> {
    let mut fork = vec![entries.len() as u8, wide as u8];
    let put = |fork: &mut Vec<u8>, ino: u64| {
        if wide {
            fork.extend_from_slice(&ino.to_be_bytes());
        } else {
            fork.extend_from_slice(&(ino as u32).to_be_bytes());
        }
    };
    put(&mut fork, parent);
    for (i, (name, ino)) in entries.iter().enumerate() {
        fork.push(name.len() as u8);
        fork.extend_from_slice(&(0x60 + 0x10 * i as u16).to_be_bytes());
        fork.extend_from_slice(name.as_bytes());
        put(&mut fork, *ino);
    }
    fork
}

#[test]
fn test_shortform_directory_narrow_and_wide() {
    let narrow = [("etc", 70u64), ("home", 71)];
    let wide = [("big", 0x1_0000_0040u64), ("small", 65)];

    let mut img = two_ag_image();
    img.inode(65, 0o040755, 1, &shortform(ROOT_INO, &narrow, false));
    img.inode(66, 0o040755, 1, &shortform(ROOT_INO, &wide, true));
    let mut dec = img.open(DecodeMode::STRICT).unwrap();

    for (ino, expected, i8count) in [(65, &narrow, 0u8), (66, &wide, 1)] {
        let inode = dec.fetch_inode(ino).unwrap();
        let ForkData::Directory(dir) = inode.fork else {
            panic!("inode {ino}: expected a short-form directory");
        };
        assert_eq!(dir.i8count, i8count);
        assert_eq!(dir.parent, ROOT_INO);
        assert_eq!(dir.entries.len(), 2);
        for (entry, (name, target)) in dir.entries.iter().zip(expected.iter()) {
            assert_eq!(entry.name, *name);
            assert_eq!(entry.inumber, *target);
            assert_eq!(entry.ftype, None);
        }
    }
}

#[test]
fn test_extent_field_limits() {
    let startoff = (1u64 << 54) - 1;
    let startblock = (1u64 << 52) - 1;
    let blockcount = (1u64 << 21) - 1;
    let l0 = (1u64 << 63) | (startoff << 9) | (startblock >> 43);
    let l1 = (startblock << 21) | blockcount;
    let mut fork = Vec::new();
    fork.extend_from_slice(&l0.to_be_bytes());
    fork.extend_from_slice(&l1.to_be_bytes());
    // Second extent: all zero except a one-block count.
    fork.extend_from_slice(&0u64.to_be_bytes());
    fork.extend_from_slice(&1u64.to_be_bytes());

    let mut img = two_ag_image();
    let slot = img.inode(67, 0o100644, 2, &fork);
    BigEndian::write_u32(&mut slot[DI_NEXTENTS..], 2);
    let mut dec = img.open(DecodeMode::STRICT).unwrap();

    let inode = dec.fetch_inode(67).unwrap();
    let ForkData::Extents(extents) = inode.fork else {
        panic!("expected an extent list");
    };
    assert_eq!(extents.len(), 2);
    assert!(extents[0].flag);
    assert_eq!(extents[0].startoff, startoff);
    assert_eq!(extents[0].startblock, startblock);
    assert_eq!(extents[0].blockcount as u64, blockcount);
    assert!(!extents[1].flag);
    assert_eq!(
        (extents[1].startoff, extents[1].startblock, extents[1].blockcount),
        (0, 0, 1)
    );
}

#[test]
fn test_inode_addressing_errors() {
    let mut img = two_ag_image();
    img.inode(ROOT_INO, 0o040755, 1, &shortform(ROOT_INO, &[], false));
    let slot = img.inode(68, 0o100644, 2, &[]);
    BigEndian::write_u64(&mut slot[DI_INO..], 99);
    let mut dec = img.open(DecodeMode::STRICT).unwrap();

    assert_eq!(dec.fetch_inode(ROOT_INO).unwrap().ino, ROOT_INO);
    assert!(matches!(
        dec.fetch_inode(ROOT_INO - 1),
        Err(ProbeError::BelowRootIno { ino: 63, root: 64 })
    ));
    assert!(matches!(
        dec.fetch_inode(68),
        Err(ProbeError::InoMismatch { expected: 68, actual: 99 })
    ));
    // Slot 69 was never written.
    assert!(matches!(dec.fetch_inode(69), Err(ProbeError::BadMagic { .. })));
}

#[test]
fn test_inode_fetch_without_ag_bits() {
    for agblklog in [4u8, 0] {
        let mut img = two_ag_image();
        img.inode(72, 0o100644, 2, &[]);
        img.primary_sb()[SB_AGBLKLOG] = agblklog;
        let mut dec = img.open(DecodeMode::STRICT).unwrap();
        assert_eq!(dec.fetch_inode(72).unwrap().ino, 72, "agblklog {agblklog}");
    }
}

#[test]
fn test_scan_finds_headers_in_every_ag() {
    let mut img = two_ag_image();
    img.inode(ROOT_INO, 0o040755, 1, &shortform(ROOT_INO, &[], false));
    let mut dec = img.open(DecodeMode::STRICT).unwrap();

    let hits: Vec<ScanHit> = dec
        .scan(ScanOptions::default())
        .unwrap()
        .map(Result::unwrap)
        .collect();
    let at = |block: u64, offset: u32, kind: StructureKind| ScanHit::Structure {
        block,
        offset,
        kind,
    };
    assert_eq!(
        hits,
        vec![
            at(0, 0, StructureKind::Superblock),
            at(0, 512, StructureKind::Agf),
            at(0, 1024, StructureKind::Agi),
            at(1, 0, StructureKind::FreeByBlock),
            at(8, 0, StructureKind::Inode),
            at(16, 0, StructureKind::Superblock),
            at(16, 512, StructureKind::Agf),
            at(16, 1024, StructureKind::Agi),
            at(17, 0, StructureKind::FreeByBlock),
        ]
    );
}

#[test]
fn test_block_decode_by_name_and_magic() {
    let mut dec = two_ag_image().open(DecodeMode::STRICT).unwrap();
    let agf = dec.read_block(16, Some(1)).unwrap();
    assert_eq!(XfsDecoder::<Cursor<Vec<u8>>>::identify(&agf), Some(StructureKind::Agf));
    let text = dec.decode_and_print(StructureKind::Agf, &agf);
    assert!(text.contains("AGF"));

    let leaf = dec.read_block(1, None).unwrap();
    let kind = StructureKind::by_name("abtb").unwrap();
    assert_eq!(XfsDecoder::<Cursor<Vec<u8>>>::identify(&leaf), Some(kind));
    assert!(!dec.decode_and_print(kind, &leaf).starts_with("cannot decode"));
}

#[test]
fn test_export_sparse_file() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("out.simg");
    let mut dec = two_ag_image().open(DecodeMode::STRICT).unwrap();
    assert_eq!(dec.export_sparse(&dest).unwrap(), 16);

    let out = std::fs::read(&dest).unwrap();
    assert_eq!(LittleEndian::read_u32(&out[0..]), 0xED26_FF3A);
    assert_eq!(LittleEndian::read_u32(&out[12..]), BS as u32);
    assert_eq!(LittleEndian::read_u32(&out[16..]), 32);
    assert_eq!(LittleEndian::read_u32(&out[20..]), 4);

    // RAW 2, DONT_CARE 3, RAW 14, DONT_CARE 13
    let mut pos = 28;
    for (chunk_type, blocks) in [(0xCAC1u16, 2u32), (0xCAC3, 3), (0xCAC1, 14), (0xCAC3, 13)] {
        assert_eq!(LittleEndian::read_u16(&out[pos..]), chunk_type);
        assert_eq!(LittleEndian::read_u32(&out[pos + 4..]), blocks);
        let data = if chunk_type == 0xCAC1 { blocks as usize * BS } else { 0 };
        assert_eq!(LittleEndian::read_u32(&out[pos + 8..]) as usize, 12 + data);
        if chunk_type == 0xCAC1 && pos == 28 {
            assert_eq!(&out[pos + 12..pos + 16], b"XFSB");
        }
        pos += 12 + data;
    }
    assert_eq!(pos, out.len());
}
