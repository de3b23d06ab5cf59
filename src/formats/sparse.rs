//! Android sparse image writer.
//!
//! A sparse image is a 28-byte file header followed by chunks. Each chunk
//! has a 12-byte header; `RAW` chunks carry block data, `DONT_CARE` chunks
//! carry nothing and stand for blocks whose contents do not matter. All
//! fields are little-endian.

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom, Write};

use crate::blockdev::BlockReader;
use crate::error::ProbeError;
use crate::fs::xfs::freespace::ChunkSink;

pub const SPARSE_HEADER_MAGIC: u32 = 0xED26_FF3A;
pub const SPARSE_MAJOR_VERSION: u16 = 1;
pub const SPARSE_MINOR_VERSION: u16 = 0;
pub const FILE_HEADER_LEN: u16 = 28;
pub const CHUNK_HEADER_LEN: u16 = 12;

pub const CHUNK_TYPE_RAW: u16 = 0xCAC1;
pub const CHUNK_TYPE_DONT_CARE: u16 = 0xCAC3;

/// Blocks copied per read while filling a `RAW` chunk.
const COPY_BATCH_BLOCKS: u64 = 256;

/// Streams used-block runs into a sparse image.
///
/// The file header is written as a placeholder on creation and rewritten by
/// [`SparseWriter::finish`] once the chunk count is known.
pub struct SparseWriter<W: Write + Seek> {
    out: W,
    block_size: u32,
    total_blocks: u64,
    next_block: u64,
    chunks: u32,
}

impl<W: Write + Seek> SparseWriter<W> {
    /// `total_blocks` must fit the 32-bit `total_blks` header field.
    pub fn new(mut out: W, block_size: u32, total_blocks: u64) -> Result<Self, ProbeError> {
        if total_blocks > u32::MAX as u64 {
            return Err(ProbeError::GeometryOutOfRange {
                location: "sparse header".to_string(),
                field: "total_blks",
                value: total_blocks,
                min: 0,
                max: u32::MAX as u64,
            });
        }
        write_file_header(&mut out, block_size, total_blocks as u32, 0)?;
        Ok(SparseWriter {
            out,
            block_size,
            total_blocks,
            next_block: 0,
            chunks: 0,
        })
    }

    /// Largest block count one chunk can describe: `total_sz` is 32 bits.
    fn max_chunk_blocks(&self) -> u64 {
        ((u32::MAX - CHUNK_HEADER_LEN as u32) / self.block_size.max(1)) as u64
    }

    fn write_chunk_header(&mut self, chunk_type: u16, blocks: u64, data_len: u64) -> Result<(), ProbeError> {
        // chunk_type (0, 2) | reserved (2, 2) | chunk_sz (4, 4) | total_sz (8, 4)
        self.out.write_u16::<LittleEndian>(chunk_type)?;
        self.out.write_u16::<LittleEndian>(0)?;
        self.out.write_u32::<LittleEndian>(blocks as u32)?;
        self.out
            .write_u32::<LittleEndian>(CHUNK_HEADER_LEN as u32 + data_len as u32)?;
        self.chunks += 1;
        Ok(())
    }

    fn skip_blocks(&mut self, mut count: u64) -> Result<(), ProbeError> {
        let max = self.max_chunk_blocks();
        while count > 0 {
            let n = count.min(max);
            self.write_chunk_header(CHUNK_TYPE_DONT_CARE, n, 0)?;
            self.next_block += n;
            count -= n;
        }
        Ok(())
    }

    /// Pad to the end of the device, rewrite the file header and return the
    /// number of chunks written.
    pub fn finish(mut self) -> Result<u32, ProbeError> {
        if self.next_block < self.total_blocks {
            self.skip_blocks(self.total_blocks - self.next_block)?;
        }
        self.out.seek(SeekFrom::Start(0))?;
        write_file_header(&mut self.out, self.block_size, self.total_blocks as u32, self.chunks)?;
        self.out.flush()?;
        Ok(self.chunks)
    }
}

impl<W: Write + Seek> ChunkSink for SparseWriter<W> {
    fn write_chunk<R: Read + Seek>(
        &mut self,
        source: &mut BlockReader<R>,
        source_block_start: u64,
        block_count: u64,
    ) -> Result<(), ProbeError> {
        if source_block_start > self.next_block {
            self.skip_blocks(source_block_start - self.next_block)?;
        }

        let max = self.max_chunk_blocks();
        let mut block = source_block_start;
        let end = source_block_start + block_count;
        while block < end {
            let n = (end - block).min(max);
            self.write_chunk_header(CHUNK_TYPE_RAW, n, n * self.block_size as u64)?;
            let chunk_end = block + n;
            while block < chunk_end {
                let batch = (chunk_end - block).min(COPY_BATCH_BLOCKS);
                let data = source.read_blocks(block, batch)?;
                self.out.write_all(&data)?;
                block += batch;
            }
        }
        self.next_block = end;
        Ok(())
    }
}

fn write_file_header<W: Write>(
    out: &mut W,
    block_size: u32,
    total_blocks: u32,
    total_chunks: u32,
) -> Result<(), ProbeError> {
    // magic (0, 4)
    out.write_u32::<LittleEndian>(SPARSE_HEADER_MAGIC)?;
    // major / minor version (4, 2) (6, 2)
    out.write_u16::<LittleEndian>(SPARSE_MAJOR_VERSION)?;
    out.write_u16::<LittleEndian>(SPARSE_MINOR_VERSION)?;
    // file header size (8, 2), chunk header size (10, 2)
    out.write_u16::<LittleEndian>(FILE_HEADER_LEN)?;
    out.write_u16::<LittleEndian>(CHUNK_HEADER_LEN)?;
    // block size (12, 4), total blocks (16, 4), total chunks (20, 4)
    out.write_u32::<LittleEndian>(block_size)?;
    out.write_u32::<LittleEndian>(total_blocks)?;
    out.write_u32::<LittleEndian>(total_chunks)?;
    // image checksum (24, 4), unused
    out.write_u32::<LittleEndian>(0)?;
    Ok(())
}
