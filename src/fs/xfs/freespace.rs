//! Free-space reconciliation and used-block export.
//!
//! Every AG's free-space-by-block tree is walked into a device-wide bitmap
//! of free blocks, and the per-AG total is checked against the AGF. The map
//! is then inverted and each maximal run of used blocks is handed to a
//! [`ChunkSink`].

use log::{debug, info, warn};
use std::io::{Read, Seek};

use super::ag::{AllocGroup, TreeKind};
use super::btree::{AllocRec, BtreeBlock};
use super::superblock::Superblock;
use crate::blockdev::BlockReader;
use crate::error::ProbeError;
use crate::fs::unix_common::bitmap::Bitmap;
use crate::fs::DecodeMode;

/// Receives runs of used blocks, in ascending order.
pub trait ChunkSink {
    /// Copy `block_count` blocks starting at `source_block_start` from
    /// `source` into the sink's output.
    fn write_chunk<R: Read + Seek>(
        &mut self,
        source: &mut BlockReader<R>,
        source_block_start: u64,
        block_count: u64,
    ) -> Result<(), ProbeError>;
}

/// Mark one AG's free records and compare their total with the AGF.
///
/// `ag_base` is the AG's first filesystem block; record starts are
/// AG-relative.
pub fn reconcile_ag(
    free: &mut Bitmap,
    ag: u32,
    ag_base: u64,
    records: &[AllocRec],
    recorded_free: u64,
) -> Result<u64, ProbeError> {
    let mut counted = 0u64;
    for rec in records {
        free.set_range(ag_base + rec.startblock as u64, rec.blockcount as u64);
        counted += rec.blockcount as u64;
    }
    if counted != recorded_free {
        return Err(ProbeError::FreeCountMismatch {
            ag,
            expected: recorded_free,
            actual: counted,
        });
    }
    Ok(counted)
}

/// Invert a free map in place and list the runs of used blocks.
pub fn used_runs(mut free: Bitmap) -> Vec<(u64, u64)> {
    free.invert();
    free.set_runs().collect()
}

/// Collect the leaf records of one AG's free-space-by-block tree.
///
/// The root is already loaded; deeper levels are read on demand. A child
/// with the wrong magic or level is passed through `mode` and skipped when
/// tolerated. The walk visits at most `agblocks` nodes, which bounds
/// pointer cycles.
fn collect_free_records<R: Read + Seek>(
    reader: &mut BlockReader<R>,
    sb: &Superblock,
    group: &AllocGroup,
    root: &[u8],
    mode: DecodeMode,
) -> Result<Vec<AllocRec>, ProbeError> {
    let accepted = TreeKind::FreeByBlock.accepted_magics();
    let ag_base = group.base_block(sb.ag_blocks);
    let mut records = Vec::new();
    let mut stack: Vec<(Vec<u8>, Option<u16>)> = vec![(root.to_vec(), None)];
    let mut visited = 0u64;

    while let Some((block, expected_level)) = stack.pop() {
        visited += 1;
        if visited > sb.ag_blocks as u64 {
            warn!(
                "AG {}: free-space btree walk stopped after {} nodes",
                group.index, sb.ag_blocks
            );
            break;
        }

        let hdr = BtreeBlock::parse(&block)?;
        if let Some(level) = expected_level {
            if !accepted.contains(&hdr.magic) || hdr.level != level {
                mode.tolerate(Err(ProbeError::bad_magic(
                    TreeKind::FreeByBlock.name(),
                    format!("AG {} level {level}", group.index),
                    accepted[0] as u64,
                    hdr.magic as u64,
                )))?;
                continue;
            }
        }

        if hdr.is_leaf() {
            records.extend(hdr.alloc_records(&block)?);
            continue;
        }
        // Push right to left so leaves come out in key order.
        for ptr in hdr.child_pointers(&block, 8)?.into_iter().rev() {
            let child = reader.read_blocks(ag_base + ptr as u64, 1)?;
            stack.push((child, Some(hdr.level - 1)));
        }
    }
    Ok(records)
}

/// Build the device-wide free map from every AG and return the used runs.
pub fn reconcile<R: Read + Seek>(
    reader: &mut BlockReader<R>,
    sb: &Superblock,
    groups: &[AllocGroup],
    mode: DecodeMode,
) -> Result<Vec<(u64, u64)>, ProbeError> {
    let mut free = Bitmap::new(sb.dblocks);
    for group in groups {
        let Some(root) = group.tree(TreeKind::FreeByBlock) else {
            mode.tolerate(Err(ProbeError::MissingFreeTree { ag: group.index }))?;
            warn!("AG {}: treating every block as used", group.index);
            continue;
        };
        let records = collect_free_records(reader, sb, group, root, mode)?;
        let ag_base = group.base_block(sb.ag_blocks);
        let matches = mode.tolerate(
            reconcile_ag(&mut free, group.index, ag_base, &records, group.agf.freeblks as u64)
                .map(|_| ()),
        )?;
        debug!(
            "AG {}: {} free records, count {}",
            group.index,
            records.len(),
            if matches { "matches AGF" } else { "differs from AGF" }
        );
    }
    let free_blocks = free.count_set_bits();
    info!("{free_blocks} of {} blocks free", sb.dblocks);
    Ok(used_runs(free))
}

/// Reconcile, then hand every used run to `sink`.
pub fn export_used<R: Read + Seek, S: ChunkSink>(
    reader: &mut BlockReader<R>,
    sb: &Superblock,
    groups: &[AllocGroup],
    mode: DecodeMode,
    sink: &mut S,
) -> Result<u64, ProbeError> {
    let runs = reconcile(reader, sb, groups, mode)?;
    let mut used = 0;
    for (start, count) in runs {
        debug!("used run: block {start}, {count} blocks");
        sink.write_chunk(reader, start, count)?;
        used += count;
    }
    Ok(used)
}
