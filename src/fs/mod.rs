pub mod fields;
pub mod unix_common;
pub mod xfs;

use log::warn;

use crate::error::ProbeError;

/// How validating decoders react to structural anomalies.
///
/// Strict mode turns the first mismatch into an error. Best-effort mode
/// (`--force` on the command line) logs the mismatch and keeps going, so a
/// damaged image can still be inspected. I/O errors are never tolerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeMode {
    pub strict: bool,
}

impl DecodeMode {
    pub const STRICT: DecodeMode = DecodeMode { strict: true };
    pub const BEST_EFFORT: DecodeMode = DecodeMode { strict: false };

    /// Pass a validation result through this mode's failure policy.
    ///
    /// Returns `Ok(true)` when the check passed, `Ok(false)` when it failed
    /// but was tolerated, and `Err` when the failure must abort.
    pub fn tolerate(self, result: Result<(), ProbeError>) -> Result<bool, ProbeError> {
        match result {
            Ok(()) => Ok(true),
            Err(e @ ProbeError::Io(_)) => Err(e),
            Err(e) if self.strict => Err(e),
            Err(e) => {
                warn!("{e} (continuing in best-effort mode)");
                Ok(false)
            }
        }
    }
}

impl Default for DecodeMode {
    fn default() -> Self {
        DecodeMode::STRICT
    }
}
