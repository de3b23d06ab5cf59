//! Packed bmbt extent records.
//!
//! An on-disk extent is two big-endian 64-bit words:
//!
//! ```text
//! l0: [63] flag | [62..9] startoff (54 bits) | [8..0] startblock high 9 bits
//! l1: [63..21] startblock low 43 bits | [20..0] blockcount (21 bits)
//! ```

use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;

use crate::error::ProbeError;

pub const BMBT_REC_LEN: usize = 16;

const MASK_54: u64 = (1u64 << 54) - 1;
const MASK_52: u64 = (1u64 << 52) - 1;
const MASK_21: u64 = (1u64 << 21) - 1;
const MASK_9: u64 = (1u64 << 9) - 1;

/// One unpacked extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Extent {
    /// Set for unwritten (preallocated) extents.
    pub flag: bool,
    /// Logical file offset, in blocks.
    pub startoff: u64,
    /// Filesystem block number (AG number in the high bits).
    pub startblock: u64,
    pub blockcount: u32,
}

impl Extent {
    pub fn unpack(l0: u64, l1: u64) -> Self {
        Extent {
            flag: l0 >> 63 != 0,
            startoff: (l0 >> 9) & MASK_54,
            startblock: ((l0 & MASK_9) << 43) | (l1 >> 21),
            blockcount: (l1 & MASK_21) as u32,
        }
    }

    /// Inverse of [`Extent::unpack`]; out-of-range fields are truncated to
    /// their on-disk width.
    pub fn pack(&self) -> (u64, u64) {
        let startblock = self.startblock & MASK_52;
        let l0 = ((self.flag as u64) << 63) | ((self.startoff & MASK_54) << 9) | (startblock >> 43);
        let l1 = (startblock << 21) | (self.blockcount as u64 & MASK_21);
        (l0, l1)
    }

    /// Decode the 16-byte record at the start of `data`.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProbeError> {
        ProbeError::check_len("extent record", data, BMBT_REC_LEN)?;
        Ok(Extent::read_record(data))
    }

    /// `rec` must hold at least [`BMBT_REC_LEN`] bytes.
    fn read_record(rec: &[u8]) -> Self {
        Extent::unpack(BigEndian::read_u64(&rec[0..8]), BigEndian::read_u64(&rec[8..16]))
    }

    pub fn to_bytes(&self) -> [u8; BMBT_REC_LEN] {
        let (l0, l1) = self.pack();
        let mut out = [0u8; BMBT_REC_LEN];
        BigEndian::write_u64(&mut out[0..8], l0);
        BigEndian::write_u64(&mut out[8..16], l1);
        out
    }
}

/// Decode up to `count` consecutive records from a fork, stopping early if
/// the fork runs out.
pub fn parse_extent_list(fork: &[u8], count: usize) -> Vec<Extent> {
    fork.chunks_exact(BMBT_REC_LEN)
        .take(count)
        .map(Extent::read_record)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(ext: Extent) {
        let (l0, l1) = ext.pack();
        assert_eq!(Extent::unpack(l0, l1), ext);
        assert_eq!(Extent::from_bytes(&ext.to_bytes()).unwrap(), ext);
    }

    #[test]
    fn test_edge_values() {
        for flag in [false, true] {
            for startblock in [0, MASK_52] {
                for blockcount in [0, MASK_21 as u32] {
                    for startoff in [0, 1, MASK_54] {
                        roundtrip(Extent {
                            flag,
                            startoff,
                            startblock,
                            blockcount,
                        });
                    }
                }
            }
        }
    }

    #[test]
    fn test_startblock_straddles_words() {
        // Bit 43 of startblock is the lowest bit held in l0.
        let ext = Extent {
            flag: false,
            startoff: 0,
            startblock: 1u64 << 43,
            blockcount: 0,
        };
        let (l0, l1) = ext.pack();
        assert_eq!(l0, 1);
        assert_eq!(l1, 0);
    }

    #[test]
    fn test_known_encoding() {
        // startoff 0, startblock 12, blockcount 1
        let l1 = (12u64 << 21) | 1;
        let ext = Extent::unpack(0, l1);
        assert_eq!(ext.startblock, 12);
        assert_eq!(ext.blockcount, 1);
        assert!(!ext.flag);

        let ext = Extent::unpack((1u64 << 63) | (5 << 9), 0);
        assert!(ext.flag);
        assert_eq!(ext.startoff, 5);
    }

    #[test]
    fn test_parse_list_stops_at_fork_end() {
        let a = Extent { flag: false, startoff: 0, startblock: 10, blockcount: 4 };
        let b = Extent { flag: true, startoff: 4, startblock: 20, blockcount: 2 };
        let mut fork = Vec::new();
        fork.extend_from_slice(&a.to_bytes());
        fork.extend_from_slice(&b.to_bytes());
        fork.extend_from_slice(&[0u8; 8]);
        assert_eq!(parse_extent_list(&fork, 5), vec![a, b]);
        assert_eq!(parse_extent_list(&fork, 1), vec![a]);
    }

    #[test]
    fn test_list_and_single_record_agree() {
        let ext = Extent { flag: true, startoff: 77, startblock: (1 << 43) | 5, blockcount: 3 };
        let raw = ext.to_bytes();
        assert_eq!(parse_extent_list(&raw, 1), vec![Extent::from_bytes(&raw).unwrap()]);
        assert_eq!(parse_extent_list(&raw, 1)[0], ext);
    }

    #[test]
    fn test_short_record() {
        assert!(Extent::from_bytes(&[0u8; 15]).is_err());
    }
}
