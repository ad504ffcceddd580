//! # Maprace
//!
//! Facade over the maprace crates. The engine lives in [`maprace_core`] and is re-exported at
//! the top level; pluggable components are enabled with cargo features:
//!
//! - `pipe` - [`pipe::PipeCopyout`], a pipe based copy-out operation (Linux)
//! - `pattern-scan` - [`pattern_scan::PatternScan`], a consumer scanning captures for a word
//!   pattern

pub use maprace_core::*;

#[cfg(feature = "pipe")]
pub use maprace_pipe as pipe;

#[cfg(feature = "pattern-scan")]
pub use maprace_pattern_scan as pattern_scan;
