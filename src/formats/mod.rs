//! Output image formats.

pub mod sparse;
