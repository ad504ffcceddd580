//! Session configuration.

use crate::util::{
    EVIDENCE_LEN, MAX_REJECTED_CAPTURES, MAX_TRIES_SINCE_CAPTURE, MAX_TRIES_WITHOUT_CAPTURE,
};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur when loading a [`RaceConfig`].
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ConfigError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}

/// Result type for the [`RaceConfig`] constructor.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// How an empty mapping is told apart from a capture.
///
/// A freshly mapped window is filled with `empty_byte`. If the operation wrote into it but the
/// first `prefix_len` bytes still all equal `empty_byte`, the mapping most likely landed too
/// early and the operation copied nothing of interest. This is a guess about the target data;
/// targets whose data may legitimately start with such bytes should shorten the prefix or
/// change the byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidencePolicy {
    /// Number of leading bytes inspected
    pub prefix_len: usize,
    /// Byte value a fresh mapping is filled with
    pub empty_byte: u8,
}

impl Default for EvidencePolicy {
    fn default() -> Self {
        Self {
            prefix_len: EVIDENCE_LEN,
            empty_byte: 0,
        }
    }
}

impl EvidencePolicy {
    /// Whether `window` carries evidence of a capture.
    ///
    /// Only the first `prefix_len` bytes are inspected; a shorter window is inspected whole.
    pub fn is_evidence(&self, window: &[u8]) -> bool {
        let prefix = &window[..self.prefix_len.min(window.len())];
        prefix.iter().any(|b| *b != self.empty_byte)
    }
}

/// Configuration parameters for leak sessions.
///
/// Controls the attempt ceilings, the capture classification and racer placement. All fields
/// have defaults, so a JSON file only needs to name the fields it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceConfig {
    /// Attempts allowed while the race has never been won. Reaching it is fatal.
    pub max_total_attempts_without_capture: u64,
    /// Attempts allowed since the last capture, once the race has been won.
    pub max_attempts_since_last_capture: u64,
    /// Captures the consumer may reject before the session gives up.
    pub max_rejected_captures: u64,
    /// Capture classification
    pub evidence: EvidencePolicy,
    /// CPU core to pin the racer thread to (None = no pinning)
    pub racer_core: Option<usize>,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            max_total_attempts_without_capture: MAX_TRIES_WITHOUT_CAPTURE,
            max_attempts_since_last_capture: MAX_TRIES_SINCE_CAPTURE,
            max_rejected_captures: MAX_REJECTED_CAPTURES,
            evidence: EvidencePolicy::default(),
            racer_core: None,
        }
    }
}

impl RaceConfig {
    /// Loads configuration from a JSON file.
    ///
    /// # Arguments
    ///
    /// * `filepath` - Path to the JSON configuration file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_jsonfile(filepath: impl AsRef<Path>) -> Result<RaceConfig> {
        let mut file = File::open(filepath.as_ref())?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: RaceConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Checks the configuration against a window size.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found: a zero ceiling, or an evidence prefix
    /// that is empty or longer than the window.
    pub fn validate(&self, window_size: usize) -> std::result::Result<(), String> {
        if self.max_total_attempts_without_capture == 0 {
            return Err("max_total_attempts_without_capture must be at least 1".into());
        }
        if self.max_attempts_since_last_capture == 0 {
            return Err("max_attempts_since_last_capture must be at least 1".into());
        }
        if self.max_rejected_captures == 0 {
            return Err("max_rejected_captures must be at least 1".into());
        }
        if self.evidence.prefix_len == 0 || self.evidence.prefix_len > window_size {
            return Err(format!(
                "evidence prefix of {} bytes must be within 1..={}",
                self.evidence.prefix_len, window_size
            ));
        }
        Ok(())
    }
}
