//! # Maprace
//!
//! Maprace forces a memory window to become mapped exactly while a foreign operation copies
//! data out to it. Racing an unmap/map cycle against a copy-out that skips an "is this address
//! mapped" recheck can reveal data the operation should never have written.
//!
//! ## Quickstart guide
//!
//! ```sh
//! cargo build --release
//! RUST_LOG=debug target/release/leak 0x100
//! ```
//!
//! The `leak` binary races a pipe copy-out against a window of the given size and scans the
//! captured bytes for a word matching `--mask`. Use `target/release/leak --help` to see
//! available options.
//!
//! This crate holds what the binaries share: logging setup and a progress reporting
//! [`EventSink`].

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use maprace_core::util::NamedProgress;
use maprace_core::{EventSink, LogSink, RaceEvent};

/// Attempts between two progress bar updates.
const PROGRESS_INTERVAL: u64 = 256;

/// Initializes `env_logger` (default level `info`) behind a progress bar aware bridge.
pub fn init_logging_with_progress() -> anyhow::Result<MultiProgress> {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}

/// Shows the attempt count in a spinner and forwards every event to [`LogSink`].
pub struct ProgressSink {
    bar: ProgressBar,
    log: LogSink,
}

impl ProgressSink {
    /// Adds an attempts spinner to `progress`.
    pub fn new(progress: &MultiProgress) -> Self {
        let bar = progress.add(ProgressBar::new_spinner());
        bar.set_style(ProgressStyle::named_spinner("Attempts"));
        ProgressSink { bar, log: LogSink }
    }

    /// The attempt count last shown.
    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    /// Removes the spinner.
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl EventSink for ProgressSink {
    fn emit(&self, event: &RaceEvent) {
        match event {
            RaceEvent::AttemptFinished { attempt, .. } if attempt % PROGRESS_INTERVAL == 0 => {
                self.bar.set_position(*attempt)
            }
            RaceEvent::Captured { attempt, .. } => {
                self.bar.set_position(*attempt);
                self.bar.set_message(format!("last capture at attempt {}", attempt));
            }
            RaceEvent::GaveUp { .. } | RaceEvent::CaptureAccepted { .. } => self.finish(),
            _ => {}
        }
        self.log.emit(event);
    }
}
