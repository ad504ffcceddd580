/// Smallest window that can be leaked. A capture is only recognized by its leading bytes, so the
/// window must hold at least one full evidence prefix.
pub const MIN_LEAK_SIZE: usize = 16;
/// Default number of leading bytes inspected to tell an empty mapping from a capture
pub const EVIDENCE_LEN: usize = 16;

/// Default ceiling on attempts while the race has never been won
pub const MAX_TRIES_WITHOUT_CAPTURE: u64 = 10_000_000;
/// Default ceiling on attempts since the last capture
pub const MAX_TRIES_SINCE_CAPTURE: u64 = 10_000_000;
/// Default ceiling on captures rejected by the consumer
pub const MAX_REJECTED_CAPTURES: u64 = 50_000;
