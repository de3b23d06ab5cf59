pub mod blockdev;
pub mod error;
pub mod formats;
pub mod fs;
pub mod partition;

pub use error::ProbeError;
pub use fs::DecodeMode;
