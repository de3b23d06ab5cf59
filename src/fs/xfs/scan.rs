//! Whole-device magic scan.
//!
//! [`Scanner`] is a lazy iterator: it reads one block per step and tests
//! every stride-aligned position in it against the registry. Log record
//! headers repeat in every block of the log, so runs of them in adjacent
//! blocks are folded into a single [`ScanHit::LogRange`].

use log::debug;
use serde::Serialize;
use std::collections::VecDeque;
use std::io::{Read, Seek};

use super::registry::{identify, StructureKind};
use crate::blockdev::BlockReader;
use crate::error::ProbeError;

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    /// Byte alignment of candidate positions. `None` (or zero) means the
    /// sector size.
    pub stride: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "hit", rename_all = "snake_case")]
pub enum ScanHit {
    Structure {
        block: u64,
        offset: u32,
        kind: StructureKind,
    },
    LogRange {
        first_block: u64,
        last_block: u64,
    },
}

pub struct Scanner<'a, R> {
    reader: &'a mut BlockReader<R>,
    block_size: u64,
    stride: u64,
    end: u64,
    next_pos: u64,
    log_run: Option<(u64, u64)>,
    /// Hits from blocks inside the open log run, released after it.
    held: Vec<ScanHit>,
    queue: VecDeque<ScanHit>,
    done: bool,
}

impl<'a, R: Read + Seek> Scanner<'a, R> {
    /// Scan `total_blocks` blocks of `block_size` bytes from the start of
    /// the image.
    pub fn new(
        reader: &'a mut BlockReader<R>,
        block_size: u64,
        total_blocks: u64,
        stride: u64,
    ) -> Self {
        let block_size = block_size.max(1);
        debug!("scanning {total_blocks} blocks, stride {stride}");
        Scanner {
            reader,
            block_size,
            stride: stride.max(1),
            end: total_blocks * block_size,
            next_pos: 0,
            log_run: None,
            held: Vec::new(),
            queue: VecDeque::new(),
            done: false,
        }
    }

    fn flush_log_run(&mut self) {
        if let Some((first_block, last_block)) = self.log_run.take() {
            self.queue.push_back(ScanHit::LogRange {
                first_block,
                last_block,
            });
        }
        self.queue.extend(self.held.drain(..));
    }

    fn scan_block(&mut self) -> Result<(), ProbeError> {
        let block = self.next_pos / self.block_size;
        let block_start = block * self.block_size;
        let buf = self.reader.read_raw(block_start, self.block_size as usize)?;

        let mut hits = Vec::new();
        let mut saw_log = false;
        let mut pos = self.next_pos;
        while pos < block_start + self.block_size {
            let offset = (pos - block_start) as usize;
            match identify(&buf[offset..]) {
                Some(StructureKind::LogRecord) => saw_log = true,
                Some(kind) => hits.push(ScanHit::Structure {
                    block,
                    offset: offset as u32,
                    kind,
                }),
                None => {}
            }
            pos += self.stride;
        }
        self.next_pos = pos;

        match self.log_run {
            Some((first, last)) if saw_log && block == last + 1 => {
                self.log_run = Some((first, block));
            }
            _ if saw_log => {
                self.flush_log_run();
                self.log_run = Some((block, block));
            }
            _ => {
                self.flush_log_run();
                self.queue.extend(hits);
                return Ok(());
            }
        }
        self.held.extend(hits);
        Ok(())
    }
}

impl<R: Read + Seek> Iterator for Scanner<'_, R> {
    type Item = Result<ScanHit, ProbeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(hit) = self.queue.pop_front() {
                return Some(Ok(hit));
            }
            if self.done {
                return None;
            }
            if self.next_pos >= self.end {
                self.done = true;
                self.flush_log_run();
                continue;
            }
            if let Err(e) = self.scan_block() {
                self.done = true;
                self.queue.clear();
                return Some(Err(e));
            }
        }
    }
}
