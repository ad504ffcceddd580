use log::{debug, info, warn};
use maprace_core::util::hexdump;
use maprace_core::{Capture, LeakConsumer, Verdict};
use serde::Serialize;

/// Mask and value matching words whose top 16 bits are all set.
pub const KERNEL_POINTER_MASK: u64 = 0xffff << 48;

/// Captures inspected before [`PatternScan`] gives up by default.
pub const DEFAULT_MAX_CAPTURES: u64 = 50_000;

/// A matching word found in a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Finding {
    /// Attempt that produced the capture
    pub attempt: u64,
    /// Byte offset of the word in the window
    pub offset: usize,
    /// The matching word
    pub word: u64,
}

/// Consumer that accepts the first capture containing a matching 64-bit word.
///
/// The window is read as native-endian, 8-byte aligned words; a word matches if
/// `word & mask == value`. Captures without a match are rejected until `max_captures` captures
/// have been inspected. The consumer then accepts the last capture anyway, so the session ends,
/// and [`finding()`](PatternScan::finding) stays `None`.
#[derive(Debug, Clone)]
pub struct PatternScan {
    mask: u64,
    value: u64,
    max_captures: u64,
    captures: u64,
    finding: Option<Finding>,
}

impl Default for PatternScan {
    fn default() -> Self {
        Self::new(KERNEL_POINTER_MASK, KERNEL_POINTER_MASK)
    }
}

impl PatternScan {
    /// Creates a scanner matching `word & mask == value`.
    pub fn new(mask: u64, value: u64) -> Self {
        PatternScan {
            mask,
            value,
            max_captures: DEFAULT_MAX_CAPTURES,
            captures: 0,
            finding: None,
        }
    }

    /// Sets the number of captures inspected before giving up.
    pub fn with_max_captures(mut self, max_captures: u64) -> Self {
        self.max_captures = max_captures;
        self
    }

    /// The match, if one was found.
    pub fn finding(&self) -> Option<Finding> {
        self.finding
    }

    /// Number of captures inspected so far.
    pub fn captures(&self) -> u64 {
        self.captures
    }

    /// Finds the first matching word in `bytes`, returning its offset and value.
    pub fn scan(&self, bytes: &[u8]) -> Option<(usize, u64)> {
        bytes
            .chunks_exact(8)
            .enumerate()
            .filter_map(|(i, chunk)| {
                let word = u64::from_ne_bytes(chunk.try_into().ok()?);
                Some((i * 8, word))
            })
            .find(|(_, word)| word & self.mask == self.value)
    }
}

impl LeakConsumer for PatternScan {
    fn on_capture(&mut self, capture: &Capture) -> Verdict {
        self.captures += 1;
        if let Some((offset, word)) = self.scan(capture.bytes()) {
            info!(
                "Found 0x{:016x} at offset 0x{:x}:\n{}",
                word,
                offset,
                hexdump(capture.bytes())
            );
            self.finding = Some(Finding {
                attempt: capture.attempt(),
                offset,
                word,
            });
            return Verdict::Done;
        }
        debug!("Boring leak:\n{}", hexdump(capture.bytes()));
        if self.captures >= self.max_captures {
            warn!(
                "Could not leak interesting data after {} captures",
                self.captures
            );
            return Verdict::Done;
        }
        Verdict::Retry
    }
}
