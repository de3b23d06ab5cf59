//! Positioned block and sector reads over a seekable image.
//!
//! Every read seeks first, so callers never depend on the cursor position
//! left behind by an earlier call.

use std::io::{Read, Seek, SeekFrom};

use crate::error::ProbeError;

/// Reads fixed-size blocks from a backing image.
///
/// The reader borrows nothing: it owns `R`, which is typically a `File` or an
/// in-memory `Cursor<Vec<u8>>`.
pub struct BlockReader<R> {
    inner: R,
    block_size: u64,
}

impl<R: Read + Seek> BlockReader<R> {
    pub fn new(inner: R, block_size: u64) -> Self {
        Self { inner, block_size }
    }

    /// Change the block size once the real geometry is known (detection
    /// starts out reading sector-sized buffers).
    pub fn set_block_size(&mut self, block_size: u64) {
        self.block_size = block_size;
    }

    /// Read `count` whole blocks starting at `blockno`.
    pub fn read_blocks(&mut self, blockno: u64, count: u64) -> Result<Vec<u8>, ProbeError> {
        let len = (count * self.block_size) as usize;
        self.read_raw(blockno * self.block_size, len)
    }

    /// Read `len` bytes at an absolute byte offset.
    ///
    /// A short read is an error; no partial buffer is ever returned.
    pub fn read_raw(&mut self, offset: u64, len: usize) -> Result<Vec<u8>, ProbeError> {
        self.inner.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Total length of the backing image in bytes.
    pub fn image_len(&mut self) -> Result<u64, ProbeError> {
        Ok(self.inner.seek(SeekFrom::End(0))?)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}
