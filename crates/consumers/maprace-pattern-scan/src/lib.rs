//! Pattern scanning leak consumer for maprace.
//!
//! [`PatternScan`] implements [`maprace_core::LeakConsumer`] by searching every capture for a
//! 64-bit word matching a mask. With the default mask it looks for words whose top 16 bits are
//! all set, which is what canonical kernel addresses look like on x86_64 and arm64.

#![warn(missing_docs)]

mod scan;

pub use scan::*;
