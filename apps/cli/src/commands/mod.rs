//! Command implementations for rad-train.

pub mod progress;
pub mod train;
