use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic in {structure} at {location}: expected {expected:#x}, got {actual:#x}")]
    BadMagic {
        structure: String,
        location: String,
        expected: u64,
        actual: u64,
    },

    #[error("inconsistent geometry in {location}: {field} is {size}, but its log2 field is {log2}")]
    InconsistentGeometry {
        location: String,
        field: &'static str,
        size: u64,
        log2: u8,
    },

    #[error("{location}: {field} is {value}, valid range is {min}..={max}")]
    GeometryOutOfRange {
        location: String,
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("inode {expected}: on-disk inode number is {actual}")]
    InoMismatch { expected: u64, actual: u64 },

    #[error("inode {ino} is below the root inode {root}")]
    BelowRootIno { ino: u64, root: u64 },

    #[error("AG {ag}: free-space tree accounts {actual} free blocks, AGF records {expected}")]
    FreeCountMismatch { ag: u32, expected: u64, actual: u64 },

    #[error("AG {ag}: no free-space-by-block tree loaded")]
    MissingFreeTree { ag: u32 },

    #[error("invalid boot signature at sector {sector}: expected 0xAA55, got {actual:#06X}")]
    BadSignature { sector: u64, actual: u16 },

    #[error("extended partition chain exceeds {limit} logical partitions")]
    ChainTooLong { limit: usize },

    #[error("{structure} truncated: need {needed} bytes, have {actual}")]
    Truncated {
        structure: &'static str,
        needed: usize,
        actual: usize,
    },

    #[error("unknown structure type: {0}")]
    UnknownStructure(String),
}

impl ProbeError {
    pub(crate) fn bad_magic(
        structure: impl Into<String>,
        location: impl Into<String>,
        expected: u64,
        actual: u64,
    ) -> Self {
        ProbeError::BadMagic {
            structure: structure.into(),
            location: location.into(),
            expected,
            actual,
        }
    }

    pub(crate) fn check_len(
        structure: &'static str,
        data: &[u8],
        needed: usize,
    ) -> Result<(), ProbeError> {
        if data.len() < needed {
            return Err(ProbeError::Truncated {
                structure,
                needed,
                actual: data.len(),
            });
        }
        Ok(())
    }
}
