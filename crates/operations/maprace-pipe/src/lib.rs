//! Pipe copy-out operation for maprace.
//!
//! This crate provides [`PipeCopyout`], an [`ExternalOperation`](maprace_core::ExternalOperation)
//! that reads staged bytes from a pipe into the raced window. The kernel copies the bytes out
//! with its user-copy routines, so reading into an unmapped window fails with `EFAULT` instead
//! of crashing the process. This makes it a self-contained target for exercising the race
//! engine against a real system call.
//!
//! # Platform Requirements
//!
//! - Linux (`pipe2(2)`)

#![warn(missing_docs)]

#[cfg(target_os = "linux")]
mod pipe;

#[cfg(target_os = "linux")]
pub use pipe::*;
