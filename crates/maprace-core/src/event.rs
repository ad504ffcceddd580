//! Structured session events.
//!
//! The engine never prints. Everything worth observing is emitted as a [`RaceEvent`] into an
//! [`EventSink`] injected into the session. [`LogSink`] forwards events to the `log` facade,
//! [`RecordingSink`] keeps them for assertions.

use crate::driver::OutcomeKind;
use log::{debug, info, trace, warn};
use serde::Serialize;
use std::sync::Mutex;

/// Something that happened during a leak session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RaceEvent {
    /// The window was mapped for the first time and its address fixed.
    WindowMapped {
        /// Window address
        address: usize,
        /// Window length in bytes
        size: usize,
    },
    /// The racer thread was started.
    RacerStarted,
    /// The racer thread could not be pinned to the requested core.
    PinFailed {
        /// Requested core
        core: usize,
    },
    /// One attempt finished.
    AttemptFinished {
        /// Attempt number, counting from 1
        attempt: u64,
        /// Classification of the attempt
        outcome: OutcomeKind,
    },
    /// An attempt captured data.
    Captured {
        /// Attempt number, counting from 1
        attempt: u64,
        /// Attempts since the previous capture, including this one
        tries: u64,
    },
    /// The consumer rejected a capture.
    CaptureRejected {
        /// Attempt number, counting from 1
        attempt: u64,
    },
    /// The consumer accepted a capture and the session is done.
    CaptureAccepted {
        /// Attempt number, counting from 1
        attempt: u64,
    },
    /// The racer failed to remap the window.
    RemapFailed {
        /// Error description
        error: String,
    },
    /// The session gave up.
    GaveUp {
        /// Error description
        reason: String,
    },
    /// The racer thread was joined.
    RacerJoined,
    /// The window was unmapped for the last time.
    WindowReleased,
}

/// Receiver of [`RaceEvent`]s.
///
/// Sinks are shared between the driver and the racer thread. Emission happens on the hot path
/// of the race, so implementations should return quickly.
pub trait EventSink: Send + Sync {
    /// Handles one event.
    fn emit(&self, event: &RaceEvent);
}

impl<F: Fn(&RaceEvent) + Send + Sync> EventSink for F {
    fn emit(&self, event: &RaceEvent) {
        self(event)
    }
}

/// Forwards events to the `log` facade.
///
/// Per-attempt events are logged at `trace` level, so they cost nothing unless enabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &RaceEvent) {
        match event {
            RaceEvent::WindowMapped { address, size } => {
                debug!("Mapped window at 0x{:x} ({} bytes)", address, size)
            }
            RaceEvent::RacerStarted => debug!("Racer thread started"),
            RaceEvent::PinFailed { core } => warn!("Could not pin racer to core {}", core),
            RaceEvent::AttemptFinished { attempt, outcome } => match outcome {
                OutcomeKind::NoMapping => trace!("Attempt {}: did not allocate in time", attempt),
                OutcomeKind::MappedButEmpty => trace!("Attempt {}: mapped too early", attempt),
                OutcomeKind::Captured => trace!("Attempt {}: captured", attempt),
            },
            RaceEvent::Captured { attempt, tries } => info!(
                "Triggered the leak after {} {} (attempt {})",
                tries,
                if *tries == 1 { "try" } else { "tries" },
                attempt
            ),
            RaceEvent::CaptureRejected { attempt } => {
                debug!("Capture of attempt {} rejected", attempt)
            }
            RaceEvent::CaptureAccepted { attempt } => {
                info!("Capture of attempt {} accepted", attempt)
            }
            RaceEvent::RemapFailed { error } => warn!("Racer failed to remap window: {}", error),
            RaceEvent::GaveUp { reason } => warn!("Giving up: {}", reason),
            RaceEvent::RacerJoined => debug!("Racer thread joined"),
            RaceEvent::WindowReleased => debug!("Window released"),
        }
    }
}

/// Collects every event, for tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RaceEvent>>,
}

impl RecordingSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of the events emitted so far.
    pub fn events(&self) -> Vec<RaceEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Number of attempts with the given outcome.
    pub fn count_outcomes(&self, kind: OutcomeKind) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, RaceEvent::AttemptFinished { outcome, .. } if *outcome == kind))
            .count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &RaceEvent) {
        let mut events = match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push(event.clone());
    }
}
