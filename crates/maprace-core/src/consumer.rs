//! Consumers of captured data.
//!
//! Deciding whether a capture is "interesting" is target specific, so the engine delegates it to
//! a [`LeakConsumer`]. Closures of type `FnMut(&Capture) -> bool` are consumers too; returning
//! `true` ends the session.

/// What the session should do after a capture was handed to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The capture is final; tear down and return success.
    Done,
    /// Discard the capture and race again.
    Retry,
}

impl From<bool> for Verdict {
    fn from(done: bool) -> Self {
        if done { Verdict::Done } else { Verdict::Retry }
    }
}

/// Bytes observed through the window after a won race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    bytes: Vec<u8>,
    reported_len: usize,
    attempt: u64,
}

impl Capture {
    /// Creates a capture.
    ///
    /// # Arguments
    ///
    /// * `bytes` - Copy of the whole window
    /// * `reported_len` - Number of bytes the external operation reported as written
    /// * `attempt` - Attempt number, counting from 1
    pub fn new(bytes: Vec<u8>, reported_len: usize, attempt: u64) -> Self {
        Capture {
            bytes,
            reported_len,
            attempt,
        }
    }

    /// The captured window contents.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length of the captured window in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the capture holds no bytes. Never true for captures produced by the engine.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of bytes the external operation claims to have written.
    pub fn reported_len(&self) -> usize {
        self.reported_len
    }

    /// Attempt that produced this capture.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Consumes the capture, returning the bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Trait for deciding what to do with captured data.
///
/// # Examples
///
/// ```
/// use maprace_core::{Capture, LeakConsumer, Verdict};
///
/// let mut seen = 0;
/// let mut consumer = |capture: &Capture| {
///     seen += 1;
///     capture.bytes().iter().any(|b| *b == 0xff)
/// };
/// let capture = Capture::new(vec![0xff; 16], 16, 1);
/// assert_eq!(consumer.on_capture(&capture), Verdict::Done);
/// ```
pub trait LeakConsumer {
    /// Inspects a capture.
    ///
    /// Returns [`Verdict::Done`] to end the session successfully, [`Verdict::Retry`] to request
    /// another attempt.
    fn on_capture(&mut self, capture: &Capture) -> Verdict;
}

impl<F: FnMut(&Capture) -> bool> LeakConsumer for F {
    fn on_capture(&mut self, capture: &Capture) -> Verdict {
        self(capture).into()
    }
}
