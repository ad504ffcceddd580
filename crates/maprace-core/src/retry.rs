//! Attempt bookkeeping and the ceilings that end a session.
//!
//! A race is *won* when the external operation succeeds, i.e. the window was mapped when it was
//! accessed, even if the copied bytes turn out to be empty. Until the first win, attempts count
//! against `max_total_attempts_without_capture`; reaching it means the race cannot be won in
//! this environment. After a win, attempts count against `max_attempts_since_last_capture`, and
//! captures the consumer rejects count against `max_rejected_captures`.

use crate::config::RaceConfig;
use serde::Serialize;

/// Attempt counters of one session. Mutated only by the driver.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryCounters {
    /// Attempts made in total
    pub total_attempts: u64,
    /// Attempts since the last capture, reset to 0 on every capture
    pub attempts_since_last_capture: u64,
    /// Attempts that ran before the window was mapped
    pub lost_races: u64,
    /// Attempts that won the race but captured nothing
    pub empty_mappings: u64,
    /// Attempts that captured data
    pub captures: u64,
    /// Captures rejected by the consumer
    pub rejected_captures: u64,
}

impl RetryCounters {
    /// Whether the race was won at least once.
    pub fn won(&self) -> bool {
        self.empty_mappings > 0 || self.captures > 0
    }

    /// Records an attempt that lost the race.
    pub fn record_lost(&mut self) {
        self.total_attempts += 1;
        self.attempts_since_last_capture += 1;
        self.lost_races += 1;
    }

    /// Records an attempt that mapped in time but captured nothing.
    pub fn record_empty(&mut self) {
        self.total_attempts += 1;
        self.attempts_since_last_capture += 1;
        self.empty_mappings += 1;
    }

    /// Records a capture. Returns the number of tries it took since the previous capture,
    /// including this one.
    pub fn record_capture(&mut self) -> u64 {
        self.total_attempts += 1;
        self.captures += 1;
        let tries = self.attempts_since_last_capture + 1;
        self.attempts_since_last_capture = 0;
        tries
    }

    /// Records that the consumer rejected the last capture.
    pub fn record_rejection(&mut self) {
        self.rejected_captures += 1;
    }
}

/// Why a session gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUp {
    /// The race was never won within the ceiling.
    NeverWon {
        /// Attempts made
        attempts: u64,
    },
    /// The race was won, but no capture was accepted within the ceilings.
    Exhausted {
        /// Attempts made
        attempts: u64,
        /// Captures seen
        captures: u64,
    },
}

/// Attempt ceilings of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_total_attempts_without_capture: u64,
    max_attempts_since_last_capture: u64,
    max_rejected_captures: u64,
}

impl RetryPolicy {
    /// Creates a policy from explicit ceilings.
    pub fn new(
        max_total_attempts_without_capture: u64,
        max_attempts_since_last_capture: u64,
        max_rejected_captures: u64,
    ) -> Self {
        RetryPolicy {
            max_total_attempts_without_capture,
            max_attempts_since_last_capture,
            max_rejected_captures,
        }
    }

    /// Checks the counters after an attempt that did not end the session.
    ///
    /// Returns `Some` if the session must give up.
    pub fn check(&self, counters: &RetryCounters) -> Option<GiveUp> {
        if !counters.won() {
            if counters.total_attempts >= self.max_total_attempts_without_capture {
                return Some(GiveUp::NeverWon {
                    attempts: counters.total_attempts,
                });
            }
            return None;
        }
        if counters.attempts_since_last_capture >= self.max_attempts_since_last_capture
            || counters.rejected_captures >= self.max_rejected_captures
        {
            return Some(GiveUp::Exhausted {
                attempts: counters.total_attempts,
                captures: counters.captures,
            });
        }
        None
    }
}

impl From<&RaceConfig> for RetryPolicy {
    fn from(config: &RaceConfig) -> Self {
        RetryPolicy::new(
            config.max_total_attempts_without_capture,
            config.max_attempts_since_last_capture,
            config.max_rejected_captures,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_won_at_ceiling() {
        let policy = RetryPolicy::new(3, 100, 100);
        let mut counters = RetryCounters::default();
        counters.record_lost();
        assert_eq!(policy.check(&counters), None);
        counters.record_lost();
        assert_eq!(policy.check(&counters), None);
        counters.record_lost();
        assert_eq!(
            policy.check(&counters),
            Some(GiveUp::NeverWon { attempts: 3 })
        );
    }

    #[test]
    fn test_empty_mapping_counts_as_won() {
        let policy = RetryPolicy::new(2, 5, 100);
        let mut counters = RetryCounters::default();
        counters.record_lost();
        counters.record_empty();
        assert!(counters.won());
        // past the never-won ceiling, but the race has been won
        assert_eq!(policy.check(&counters), None);
        for _ in 0..3 {
            counters.record_empty();
        }
        assert_eq!(
            policy.check(&counters),
            Some(GiveUp::Exhausted {
                attempts: 5,
                captures: 0
            })
        );
    }

    #[test]
    fn test_capture_resets_since_counter() {
        let policy = RetryPolicy::new(10, 3, 100);
        let mut counters = RetryCounters::default();
        counters.record_lost();
        counters.record_lost();
        assert_eq!(counters.record_capture(), 3);
        counters.record_rejection();
        assert_eq!(counters.attempts_since_last_capture, 0);
        assert_eq!(policy.check(&counters), None);

        counters.record_lost();
        counters.record_empty();
        assert_eq!(policy.check(&counters), None);
        counters.record_lost();
        assert_eq!(
            policy.check(&counters),
            Some(GiveUp::Exhausted {
                attempts: 6,
                captures: 1
            })
        );
    }

    #[test]
    fn test_rejection_ceiling() {
        let policy = RetryPolicy::new(10, 10, 2);
        let mut counters = RetryCounters::default();
        assert_eq!(counters.record_capture(), 1);
        counters.record_rejection();
        assert_eq!(policy.check(&counters), None);
        assert_eq!(counters.record_capture(), 1);
        counters.record_rejection();
        assert_eq!(
            policy.check(&counters),
            Some(GiveUp::Exhausted {
                attempts: 2,
                captures: 2
            })
        );
    }

    #[test]
    fn test_policy_from_config() {
        let config = RaceConfig {
            max_total_attempts_without_capture: 1,
            max_attempts_since_last_capture: 2,
            max_rejected_captures: 3,
            ..Default::default()
        };
        assert_eq!(RetryPolicy::from(&config), RetryPolicy::new(1, 2, 3));
    }
}
