//! XFS metadata decoder.
//!
//! [`XfsDecoder::detect`] validates the primary superblock and loads every
//! allocation group up front; all later queries (block dumps, inode fetch,
//! scans, export) work from that loaded state. The decoder never writes to
//! the image.

pub mod ag;
pub mod btree;
pub mod dir;
pub mod extent;
pub mod format;
pub mod freespace;
pub mod inode;
pub mod registry;
pub mod scan;
pub mod superblock;

use log::info;
use std::fs::File;
use std::io::{BufWriter, Read, Seek};
use std::path::Path;

use crate::blockdev::BlockReader;
use crate::error::ProbeError;
use crate::formats::sparse::SparseWriter;
use crate::fs::DecodeMode;

use ag::{load_allocation_groups, AllocGroup};
use freespace::{export_used, ChunkSink};
use inode::DecodedInode;
use registry::StructureKind;
use scan::{ScanOptions, Scanner};
use superblock::Superblock;

/// The primary superblock fits in the first sector.
const PRIMARY_SB_READ: usize = 512;

pub struct XfsDecoder<R> {
    reader: BlockReader<R>,
    sb: Superblock,
    groups: Vec<AllocGroup>,
    mode: DecodeMode,
}

impl<R: Read + Seek> XfsDecoder<R> {
    /// Validate the primary superblock and load every allocation group.
    ///
    /// A bad primary magic always fails. Geometry and AG mismatches follow
    /// `mode`. Anything loaded before a failure is dropped with the error.
    pub fn detect(image: R, mode: DecodeMode) -> Result<Self, ProbeError> {
        let mut reader = BlockReader::new(image, PRIMARY_SB_READ as u64);
        let raw = reader.read_raw(0, PRIMARY_SB_READ)?;
        let mut sb = Superblock::parse(&raw)?;
        sb.validate("primary superblock", mode)?;

        // Nothing can be addressed without these, whatever the mode.
        for (field, size, log2) in [
            ("blocksize", sb.block_size as u64, sb.block_log),
            ("sectsize", sb.sect_size as u64, sb.sect_log),
        ] {
            if size == 0 {
                return Err(ProbeError::InconsistentGeometry {
                    location: "primary superblock".to_string(),
                    field,
                    size,
                    log2,
                });
            }
        }

        let image_len = reader.image_len()?;
        sb.fit_device("primary superblock", image_len, mode)?;

        info!(
            "XFS v{} \"{}\" {}: {} blocks of {} bytes, {} AGs",
            sb.version(),
            sb.fname,
            sb.uuid_string(),
            sb.dblocks,
            sb.block_size,
            sb.ag_count
        );
        reader.set_block_size(sb.block_size as u64);
        let groups = load_allocation_groups(&mut reader, &sb, mode)?;
        Ok(XfsDecoder {
            reader,
            sb,
            groups,
            mode,
        })
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    pub fn allocation_groups(&self) -> &[AllocGroup] {
        &self.groups
    }

    pub fn allocation_group(&self, agno: u32) -> Option<&AllocGroup> {
        self.groups.get(agno as usize)
    }

    pub fn mode(&self) -> DecodeMode {
        self.mode
    }

    /// Raw contents of one block, or of one sector within it.
    pub fn read_block(&mut self, blockno: u64, sector: Option<u32>) -> Result<Vec<u8>, ProbeError> {
        let Some(sector) = sector else {
            return self.reader.read_blocks(blockno, 1);
        };
        let bs = self.sb.block_size as usize;
        let sect = self.sb.sect_size as usize;
        let start = sector as usize * sect;
        if start + sect > bs {
            return Err(ProbeError::Truncated {
                structure: "block",
                needed: start + sect,
                actual: bs,
            });
        }
        let offset = blockno * bs as u64 + start as u64;
        self.reader.read_raw(offset, sect)
    }

    pub fn identify(buf: &[u8]) -> Option<StructureKind> {
        registry::identify(buf)
    }

    /// Render `buf` as `kind`, using this filesystem's feature bits.
    pub fn decode_and_print(&self, kind: StructureKind, buf: &[u8]) -> String {
        registry::render(kind, buf, Some(&self.sb))
    }

    /// Start a fresh scan over every block of the image.
    pub fn scan(&mut self, options: ScanOptions) -> Result<Scanner<'_, R>, ProbeError> {
        let block_size = self.sb.block_size as u64;
        let total_blocks = self.reader.image_len()? / block_size;
        let stride = match options.stride {
            Some(s) if s != 0 => s as u64,
            _ => self.sb.sect_size as u64,
        };
        Ok(Scanner::new(&mut self.reader, block_size, total_blocks, stride))
    }

    pub fn fetch_inode(&mut self, ino: u64) -> Result<DecodedInode, ProbeError> {
        inode::fetch_inode(&mut self.reader, &self.sb, ino)
    }

    /// Reconcile free space and stream the used runs into `sink`.
    /// Returns the number of used blocks emitted.
    pub fn export_to<S: ChunkSink>(&mut self, sink: &mut S) -> Result<u64, ProbeError> {
        export_used(&mut self.reader, &self.sb, &self.groups, self.mode, sink)
    }

    /// Write the used blocks of the filesystem to an Android sparse image.
    ///
    /// The destination file is created here and closed on every return path.
    pub fn export_sparse(&mut self, dest: &Path) -> Result<u64, ProbeError> {
        let file = File::create(dest)?;
        let mut writer = SparseWriter::new(
            BufWriter::new(file),
            self.sb.block_size,
            self.sb.dblocks,
        )?;
        let used = self.export_to(&mut writer)?;
        let chunks = writer.finish()?;
        info!(
            "exported {used} used blocks as {chunks} chunks to {}",
            dest.display()
        );
        Ok(used)
    }

    /// Drop every loaded AG buffer and hand back the image.
    pub fn release(mut self) -> R {
        self.groups.clear();
        self.reader.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, ByteOrder};
    use format::*;
    use std::io::Cursor;

    const BS: usize = 4096;

    /// One 16-block AG: headers in block 0, a free-space leaf in block 1
    /// recording blocks 2..5 free, and inode 64 at the start of block 8.
    fn make_image() -> Vec<u8> {
        let mut img = vec![0u8; 16 * BS];
        let mut sb = superblock::tests::make_superblock();
        BigEndian::write_u64(&mut sb[SB_ROOTINO..], 64);
        img[..512].copy_from_slice(&sb);

        let agf = &mut img[512..1024];
        BigEndian::write_u32(&mut agf[0..], XFS_AGF_MAGIC);
        BigEndian::write_u32(&mut agf[0x0C..], 16);
        BigEndian::write_u32(&mut agf[AGF_BNO_ROOT..], 1);
        BigEndian::write_u32(&mut agf[AGF_FREEBLKS..], 3);

        let agi = &mut img[1024..1536];
        BigEndian::write_u32(&mut agi[0..], XFS_AGI_MAGIC);

        let leaf = btree::tests::make_alloc_leaf(XFS_ABTB_MAGIC, BS, &[(2, 3)]);
        img[BS..2 * BS].copy_from_slice(&leaf);

        let ino = inode::tests::make_inode(64, 0o100644, 2);
        img[8 * BS..8 * BS + 512].copy_from_slice(&ino);
        img
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
    fn test_detect_loads_groups() {
        let dec = XfsDecoder::detect(Cursor::new(make_image()), DecodeMode::STRICT).unwrap();
        assert_eq!(dec.allocation_groups().len(), 1);
        let ag = dec.allocation_group(0).unwrap();
        assert!(ag.tree(ag::TreeKind::FreeByBlock).is_some());
        assert!(ag.tree(ag::TreeKind::Inode).is_none());
    }

    #[test]
    fn test_read_block_and_sector() {
        let mut dec = XfsDecoder::detect(Cursor::new(make_image()), DecodeMode::STRICT).unwrap();
        assert_eq!(dec.read_block(1, None).unwrap().len(), BS);
        let agi = dec.read_block(0, Some(2)).unwrap();
        assert_eq!(XfsDecoder::<Cursor<Vec<u8>>>::identify(&agi), Some(StructureKind::Agi));
        assert!(dec.read_block(0, Some(8)).is_err());
    }

    #[test]
    fn test_export_runs() {
        let mut dec = XfsDecoder::detect(Cursor::new(make_image()), DecodeMode::STRICT).unwrap();
        let mut runs = Runs(Vec::new());
        assert_eq!(dec.export_to(&mut runs).unwrap(), 13);
        assert_eq!(runs.0, vec![(0, 2), (5, 11)]);
    }

    #[test]
    fn test_fetch_inode() {
        let mut dec = XfsDecoder::detect(Cursor::new(make_image()), DecodeMode::STRICT).unwrap();
        assert_eq!(dec.fetch_inode(64).unwrap().ino, 64);
        assert!(matches!(
            dec.fetch_inode(63),
            Err(ProbeError::BelowRootIno { ino: 63, root: 64 })
        ));
    }

    #[test]
    fn test_release_returns_image() {
        let image = make_image();
        let len = image.len();
        let dec = XfsDecoder::detect(Cursor::new(image), DecodeMode::STRICT).unwrap();
        assert_eq!(dec.release().into_inner().len(), len);
    }
}
