//! # Maprace Core
//!
//! `maprace-core` is the race-window synchronization engine of the maprace framework. It forces
//! a memory window to become mapped exactly while a foreign, timing-sensitive operation accesses
//! it, by racing a dedicated thread's unmap/map cycle against that operation.
//!
//! ## Architecture Overview
//!
//! The engine is built around three traits that define its seams:
//!
//! - [`window::MappingBackend`] - Maps and unmaps the raw address range behind a
//!   [`window::MemoryWindow`]. [`window::MmapBackend`] is the Linux implementation.
//!
//! - [`operation::ExternalOperation`] - The operation raced against, e.g. a system call that
//!   copies data out to the window address and fails cleanly when it is unmapped.
//!
//! - [`consumer::LeakConsumer`] - Receives every captured buffer and decides whether the
//!   session is done.
//!
//! ## Main Components
//!
//! - [`RaceSession`] - Owns the whole lifecycle: setup, racer thread, attempt loop, teardown.
//!
//! - [`racer`] module - The racer thread toggling the window between unmapped and mapped.
//!
//! - [`driver`] module - Drives single attempts and classifies their outcome.
//!
//! - [`handshake`] module - The busy-wait rendezvous shared by racer and driver.
//!
//! - [`retry`] module - Attempt ceilings deciding when a session gives up.
//!
//! - [`event`] module - Structured session events and the sinks that receive them.
//!
//! ## Platform Support
//!
//! The mmap backend targets Linux. The engine itself is platform independent and can be driven
//! by any [`window::MappingBackend`].

#![warn(missing_docs)]

pub mod config;
pub mod consumer;
pub mod driver;
pub mod event;
pub mod handshake;
pub mod operation;
pub mod racer;
pub mod retry;
mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod util;
pub mod window;

pub use crate::config::{ConfigError, EvidencePolicy, RaceConfig};
pub use crate::consumer::{Capture, LeakConsumer, Verdict};
pub use crate::event::{EventSink, LogSink, RaceEvent, RecordingSink};
pub use crate::operation::ExternalOperation;

#[cfg(target_os = "linux")]
pub use session::leak;
pub use session::{BuildError, LeakError, LeakReport, RaceSession, RaceSessionBuilder};
