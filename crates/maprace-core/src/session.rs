use crate::config::RaceConfig;
use crate::consumer::{Capture, LeakConsumer};
use crate::driver::RaceDriver;
use crate::event::{EventSink, LogSink, RaceEvent};
use crate::operation::ExternalOperation;
use crate::racer::RaceSynchronizer;
use crate::retry::{GiveUp, RetryCounters, RetryPolicy};
use crate::util::MIN_LEAK_SIZE;
use crate::window::{MappingBackend, MemoryWindow};
use log::{debug, info, warn};
use serde::{Serialize, Serializer};
use std::sync::Arc;
use thiserror::Error;

/// Reasons a leak session ends without an accepted capture.
#[derive(Debug, Error)]
pub enum LeakError {
    /// The window is too small to hold the evidence prefix.
    #[error("Window size {size} is below the minimum of {min} bytes")]
    SizeTooSmall {
        /// Requested window size
        size: usize,
        /// Minimum window size
        min: usize,
    },
    /// The configuration was rejected before any setup.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    /// Preparing the operation or mapping the window for the first time failed.
    #[error("Setup failed: {0}")]
    SetupFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The racer failed to remap the window mid-race.
    #[error("Racer failed to remap the window")]
    AllocationFailed,
    /// The race was never won within the attempt ceiling.
    #[error("Race never won in {attempts} attempts")]
    NeverWon {
        /// Attempts made
        attempts: u64,
    },
    /// The race was won, but no capture was accepted within the ceilings.
    #[error("Gave up after {attempts} attempts and {captures} captures")]
    ExhaustedAfterCapture {
        /// Attempts made
        attempts: u64,
        /// Captures seen
        captures: u64,
    },
    /// The racer thread could not be spawned.
    #[error("Could not spawn racer thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
    /// The racer thread panicked.
    #[error("Racer thread panicked")]
    RacerPanicked,
}

impl Serialize for LeakError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl From<GiveUp> for LeakError {
    fn from(give_up: GiveUp) -> Self {
        match give_up {
            GiveUp::NeverWon { attempts } => LeakError::NeverWon { attempts },
            GiveUp::Exhausted { attempts, captures } => {
                LeakError::ExhaustedAfterCapture { attempts, captures }
            }
        }
    }
}

/// Summary of a successful leak session.
#[derive(Debug, Clone, Serialize)]
pub struct LeakReport {
    /// RFC 3339 timestamp of when the session ended
    pub date: String,
    /// Window length in bytes
    pub window_size: usize,
    /// Window address
    pub address: usize,
    /// Attempt counters at the end of the session
    #[serde(flatten)]
    pub counters: RetryCounters,
    /// Attempt that produced the accepted capture
    pub won_at: u64,
    /// The accepted capture
    #[serde(skip)]
    pub capture: Capture,
}

impl LeakReport {
    fn new(window_size: usize, address: usize, counters: RetryCounters, capture: Capture) -> Self {
        LeakReport {
            date: chrono::Local::now().to_rfc3339(),
            window_size,
            address,
            counters,
            won_at: capture.attempt(),
            capture,
        }
    }
}

/// A configured leak session.
///
/// Combines a [`MappingBackend`] for the window, the [`ExternalOperation`] raced against it, an
/// [`EventSink`] and a [`RaceConfig`]. [`leak`](RaceSession::leak) runs the whole lifecycle:
///
/// 1. Check window size and configuration
/// 2. Prepare the operation
/// 3. Map the window once to fix its address
/// 4. Spawn the racer and drive attempts until the consumer accepts a capture or a ceiling is hit
/// 5. Tear down: stop and join the racer, unmap the window, release the operation
///
/// Step 5 runs on every exit path once step 2 succeeded.
///
/// Use [`RaceSession::builder()`] to construct a session.
pub struct RaceSession<B, O> {
    backend: B,
    operation: O,
    sink: Arc<dyn EventSink>,
    config: RaceConfig,
}

impl RaceSession<(), ()> {
    /// Creates a new session builder.
    pub fn builder() -> RaceSessionBuilder<(), ()> {
        RaceSessionBuilder::default()
    }
}

impl<B, O> RaceSession<B, O>
where
    B: MappingBackend + Send + 'static,
    O: ExternalOperation,
{
    /// Races the operation against a window of `window_size` bytes.
    ///
    /// Every capture is handed to `consumer`; the session ends as soon as it returns
    /// [`Verdict::Done`](crate::Verdict::Done).
    ///
    /// # Returns
    ///
    /// A report carrying the accepted capture.
    ///
    /// # Errors
    ///
    /// * [`LeakError::SizeTooSmall`] or [`LeakError::InvalidConfig`] before any setup
    /// * [`LeakError::SetupFailed`] if the operation or the initial mapping could not be prepared
    /// * [`LeakError::AllocationFailed`] if the racer failed to remap the window
    /// * [`LeakError::NeverWon`] or [`LeakError::ExhaustedAfterCapture`] when a ceiling is hit
    /// * [`LeakError::ThreadSpawn`] or [`LeakError::RacerPanicked`] on racer thread failures
    pub fn leak<C: LeakConsumer + ?Sized>(
        self,
        window_size: usize,
        consumer: &mut C,
    ) -> Result<LeakReport, LeakError> {
        let RaceSession {
            backend,
            mut operation,
            sink,
            config,
        } = self;
        if window_size < MIN_LEAK_SIZE {
            return Err(LeakError::SizeTooSmall {
                size: window_size,
                min: MIN_LEAK_SIZE,
            });
        }
        config
            .validate(window_size)
            .map_err(LeakError::InvalidConfig)?;
        operation
            .prepare()
            .map_err(|e| LeakError::SetupFailed(Box::new(e)))?;

        let result = race(backend, &mut operation, &sink, &config, window_size, consumer);
        operation.release();
        match &result {
            Ok(report) => info!(
                "Leaked {} bytes after {} attempts",
                report.capture.len(),
                report.counters.total_attempts
            ),
            Err(e) => sink.emit(&RaceEvent::GaveUp {
                reason: e.to_string(),
            }),
        }
        result
    }
}

/// Runs steps 3 to 5 of a session, minus the operation release.
fn race<B, O, C>(
    backend: B,
    operation: &mut O,
    sink: &Arc<dyn EventSink>,
    config: &RaceConfig,
    window_size: usize,
    consumer: &mut C,
) -> Result<LeakReport, LeakError>
where
    B: MappingBackend + Send + 'static,
    O: ExternalOperation + ?Sized,
    C: LeakConsumer + ?Sized,
{
    let mut window = MemoryWindow::new(backend, window_size);
    let address = window
        .map()
        .map_err(|e| LeakError::SetupFailed(Box::new(e)))?;
    sink.emit(&RaceEvent::WindowMapped {
        address,
        size: window_size,
    });

    let racer = RaceSynchronizer::spawn(window, config.racer_core, Arc::clone(sink))
        .map_err(LeakError::ThreadSpawn)?;
    sink.emit(&RaceEvent::RacerStarted);

    let policy = RetryPolicy::from(config);
    let (result, counters) = {
        let mut driver = RaceDriver::new(&racer, operation, config.evidence);
        let result = driver.run(consumer, &policy, sink.as_ref());
        (result, *driver.counters())
    };
    debug!("Race finished: {:?}", counters);

    let mut window = racer.stop().map_err(|_| LeakError::RacerPanicked)?;
    sink.emit(&RaceEvent::RacerJoined);
    if let Err(e) = window.unmap() {
        warn!("Failed to unmap window: {}", e);
    }
    drop(window);
    sink.emit(&RaceEvent::WindowReleased);

    let capture = result?;
    Ok(LeakReport::new(window_size, address, counters, capture))
}

/// Races `operation` against an anonymous memory window of `window_size` bytes.
///
/// Shorthand for a [`RaceSession`] with the [`MmapBackend`](crate::window::MmapBackend) and
/// [`LogSink`].
///
/// # Errors
///
/// See [`RaceSession::leak`].
#[cfg(target_os = "linux")]
pub fn leak<O: ExternalOperation, C: LeakConsumer + ?Sized>(
    window_size: usize,
    operation: O,
    consumer: &mut C,
    config: RaceConfig,
) -> Result<LeakReport, LeakError> {
    RaceSession {
        backend: crate::window::MmapBackend,
        operation,
        sink: Arc::new(LogSink),
        config,
    }
    .leak(window_size, consumer)
}

/// Builder for [`RaceSession`].
pub struct RaceSessionBuilder<B, O> {
    backend: Option<B>,
    operation: Option<O>,
    sink: Arc<dyn EventSink>,
    config: RaceConfig,
}

impl Default for RaceSessionBuilder<(), ()> {
    fn default() -> Self {
        RaceSessionBuilder {
            backend: None,
            operation: None,
            sink: Arc::new(LogSink),
            config: RaceConfig::default(),
        }
    }
}

impl<B, O> RaceSessionBuilder<B, O> {
    /// Sets the backend mapping the window.
    pub fn backend<B1: MappingBackend + Send + 'static>(
        self,
        backend: B1,
    ) -> RaceSessionBuilder<B1, O> {
        RaceSessionBuilder {
            backend: Some(backend),
            operation: self.operation,
            sink: self.sink,
            config: self.config,
        }
    }

    /// Sets the operation raced against the window.
    pub fn operation<O1: ExternalOperation>(self, operation: O1) -> RaceSessionBuilder<B, O1> {
        RaceSessionBuilder {
            backend: self.backend,
            operation: Some(operation),
            sink: self.sink,
            config: self.config,
        }
    }

    /// Sets the event sink. Defaults to [`LogSink`].
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the configuration. Defaults to [`RaceConfig::default()`].
    pub fn config(mut self, config: RaceConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend or the operation was not set.
    pub fn build(self) -> Result<RaceSession<B, O>, BuildError> {
        Ok(RaceSession {
            backend: self.backend.ok_or(BuildError::Backend)?,
            operation: self.operation.ok_or(BuildError::Operation)?,
            sink: self.sink,
            config: self.config,
        })
    }
}

/// Missing parts of a [`RaceSessionBuilder`].
#[derive(Debug, Error)]
pub enum BuildError {
    /// No backend was set.
    #[error("No mapping backend specified")]
    Backend,
    /// No operation was set.
    #[error("No operation specified")]
    Operation,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::OutcomeKind;
    use crate::event::RecordingSink;
    use crate::testing::{BackendCall, CopyoutWhenMapped, Jitter, RecordingBackend, ScriptError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    const SIZE: usize = 32;

    fn config(without_capture: u64, since_capture: u64) -> RaceConfig {
        RaceConfig {
            max_total_attempts_without_capture: without_capture,
            max_attempts_since_last_capture: since_capture,
            ..Default::default()
        }
    }

    fn write(address: usize, bytes: &[u8]) {
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len()) };
    }

    /// Counts `prepare` and `release` calls.
    struct Tracked {
        prepared: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
        fail_prepare: bool,
    }

    impl Tracked {
        fn new(fail_prepare: bool) -> (Self, Arc<AtomicUsize>, Arc<AtomicUsize>) {
            let prepared = Arc::new(AtomicUsize::new(0));
            let released = Arc::new(AtomicUsize::new(0));
            let op = Tracked {
                prepared: prepared.clone(),
                released: released.clone(),
                fail_prepare,
            };
            (op, prepared, released)
        }
    }

    impl ExternalOperation for Tracked {
        type Error = ScriptError;

        fn prepare(&mut self) -> Result<(), ScriptError> {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            if self.fail_prepare {
                return Err(ScriptError);
            }
            Ok(())
        }

        fn invoke(&mut self, _: usize, _: usize) -> Result<usize, ScriptError> {
            Err(ScriptError)
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_size_too_small() {
        let backend = RecordingBackend::new(SIZE);
        let probe = backend.probe();
        let (op, prepared, _) = Tracked::new(false);
        let session = RaceSession::builder()
            .backend(backend)
            .operation(op)
            .build()
            .expect("build");

        let mut consumer = |_: &Capture| true;
        match session.leak(15, &mut consumer) {
            Err(LeakError::SizeTooSmall { size, min }) => {
                assert_eq!(size, 15);
                assert_eq!(min, 16);
            }
            other => panic!("Expected SizeTooSmall, got {:?}", other.map(|r| r.won_at)),
        }
        assert!(probe.calls().is_empty());
        assert_eq!(prepared.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalid_config() {
        let mut config = RaceConfig::default();
        config.evidence.prefix_len = SIZE + 1;
        let backend = RecordingBackend::new(SIZE);
        let probe = backend.probe();
        let session = RaceSession::builder()
            .backend(backend)
            .operation(|_: usize, _: usize| Err::<usize, _>(ScriptError))
            .config(config)
            .build()
            .expect("build");

        let mut consumer = |_: &Capture| true;
        assert!(matches!(
            session.leak(SIZE, &mut consumer),
            Err(LeakError::InvalidConfig(_))
        ));
        assert!(probe.calls().is_empty());
    }

    #[test]
    fn test_never_won_after_exactly_three_attempts() {
        let backend = RecordingBackend::new(SIZE);
        let probe = backend.probe();
        let sink = Arc::new(RecordingSink::new());
        let (op, prepared, released) = Tracked::new(false);
        let session = RaceSession::builder()
            .backend(backend)
            .operation(op)
            .sink(sink.clone())
            .config(config(3, 100))
            .build()
            .expect("build");

        let mut consumer = |_: &Capture| true;
        match session.leak(SIZE, &mut consumer) {
            Err(LeakError::NeverWon { attempts }) => assert_eq!(attempts, 3),
            other => panic!("Expected NeverWon, got {:?}", other.map(|r| r.won_at)),
        }
        assert_eq!(sink.count_outcomes(OutcomeKind::NoMapping), 3);
        assert_eq!(sink.count_outcomes(OutcomeKind::MappedButEmpty), 0);
        assert_eq!(prepared.load(Ordering::SeqCst), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(!probe.is_mapped());
    }

    #[test]
    fn test_always_empty_exhausts() {
        let sink = Arc::new(RecordingSink::new());
        let session = RaceSession::builder()
            .backend(RecordingBackend::new(SIZE))
            .operation(|address: usize, capacity: usize| {
                write(address, &vec![0u8; capacity]);
                Ok::<_, ScriptError>(capacity)
            })
            .sink(sink.clone())
            .config(config(100, 5))
            .build()
            .expect("build");

        let mut consumer = |_: &Capture| true;
        match session.leak(SIZE, &mut consumer) {
            Err(LeakError::ExhaustedAfterCapture { attempts, captures }) => {
                assert_eq!(attempts, 5);
                assert_eq!(captures, 0);
            }
            other => panic!("Expected ExhaustedAfterCapture, got {:?}", other.map(|r| r.won_at)),
        }
        assert_eq!(sink.count_outcomes(OutcomeKind::MappedButEmpty), 5);
        assert_eq!(sink.count_outcomes(OutcomeKind::Captured), 0);
    }

    #[test]
    fn test_capture_on_third_attempt() {
        let sink = Arc::new(RecordingSink::new());
        let mut calls = 0u64;
        let session = RaceSession::builder()
            .backend(RecordingBackend::new(SIZE))
            .operation(move |address: usize, capacity: usize| {
                calls += 1;
                if calls < 3 {
                    return Err(ScriptError);
                }
                write(address, &[0x41; 8]);
                Ok(capacity)
            })
            .sink(sink.clone())
            .config(config(10, 10))
            .build()
            .expect("build");

        let mut seen = 0;
        let mut consumer = |capture: &Capture| {
            seen += 1;
            capture.bytes()[0] == 0x41
        };
        let report = session.leak(SIZE, &mut consumer).expect("leak failed");
        assert_eq!(seen, 1);
        assert_eq!(report.won_at, 3);
        assert_eq!(report.counters.total_attempts, 3);
        assert_eq!(report.counters.captures, 1);
        assert_eq!(report.counters.lost_races, 2);
        assert_eq!(report.capture.len(), SIZE);
        assert_eq!(&report.capture.bytes()[..8], &[0x41; 8]);
        assert_eq!(sink.count_outcomes(OutcomeKind::Captured), 1);
        assert!(
            sink.events()
                .contains(&RaceEvent::CaptureAccepted { attempt: 3 })
        );
    }

    #[test]
    fn test_rejecting_consumer_terminates() {
        let session = RaceSession::builder()
            .backend(RecordingBackend::new(SIZE))
            .operation(|address: usize, capacity: usize| {
                write(address, &[0xff; 16]);
                Ok::<_, ScriptError>(capacity)
            })
            .config(RaceConfig {
                max_rejected_captures: 4,
                ..config(100, 100)
            })
            .build()
            .expect("build");

        let mut consumer = |_: &Capture| false;
        match session.leak(SIZE, &mut consumer) {
            Err(LeakError::ExhaustedAfterCapture { attempts, captures }) => {
                assert_eq!(attempts, 4);
                assert_eq!(captures, 4);
            }
            other => panic!("Expected ExhaustedAfterCapture, got {:?}", other.map(|r| r.won_at)),
        }
    }

    #[test]
    fn test_teardown_after_success() {
        let backend = RecordingBackend::new(SIZE);
        let probe = backend.probe();
        let sink = Arc::new(RecordingSink::new());
        let session = RaceSession::builder()
            .backend(backend)
            .operation(CopyoutWhenMapped::new(probe.clone(), vec![0x5a; SIZE]))
            .sink(sink.clone())
            .config(config(1000, 1000))
            .build()
            .expect("build");

        let mut consumer = |_: &Capture| true;
        let result = session.leak(SIZE, &mut consumer);
        assert!(matches!(result, Ok(_) | Err(LeakError::NeverWon { .. })));

        assert!(!probe.is_mapped());
        assert_eq!(probe.calls().last(), Some(&BackendCall::Deallocate));
        let events = sink.events();
        let joined = events.iter().position(|e| *e == RaceEvent::RacerJoined);
        let released = events.iter().position(|e| *e == RaceEvent::WindowReleased);
        assert!(joined.is_some());
        assert!(joined < released);
        assert_eq!(
            events.first(),
            Some(&RaceEvent::WindowMapped {
                address: probe.address(),
                size: SIZE
            })
        );
    }

    #[test]
    fn test_remap_failure_is_allocation_failed() {
        let backend = RecordingBackend::new(SIZE).fail_allocation(2);
        let probe = backend.probe();
        let sink = Arc::new(RecordingSink::new());
        let (op, _, released) = Tracked::new(false);
        let session = RaceSession::builder()
            .backend(backend)
            .operation(op)
            .sink(sink.clone())
            .config(config(100, 100))
            .build()
            .expect("build");

        let mut consumer = |_: &Capture| true;
        assert!(matches!(
            session.leak(SIZE, &mut consumer),
            Err(LeakError::AllocationFailed)
        ));
        assert!(!probe.is_mapped());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        let events = sink.events();
        assert!(events.contains(&RaceEvent::RacerJoined));
        assert!(events.contains(&RaceEvent::WindowReleased));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, RaceEvent::RemapFailed { .. }))
        );
    }

    #[test]
    fn test_racer_panic_ends_session() {
        let backend = RecordingBackend::new(SIZE);
        let probe = backend.probe();
        let (op, _, released) = Tracked::new(false);
        let sink = Arc::new(|event: &RaceEvent| {
            if matches!(event, RaceEvent::PinFailed { .. }) {
                panic!("sink failed");
            }
        });
        let session = RaceSession::builder()
            .backend(backend)
            .operation(op)
            .sink(sink)
            .config(RaceConfig {
                racer_core: Some(usize::MAX),
                ..config(100, 100)
            })
            .build()
            .expect("build");

        let mut consumer = |_: &Capture| true;
        assert!(matches!(
            session.leak(SIZE, &mut consumer),
            Err(LeakError::RacerPanicked)
        ));
        assert!(!probe.is_mapped());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_initial_map_failure_is_setup_failed() {
        let backend = RecordingBackend::new(SIZE).occupied();
        let probe = backend.probe();
        let (op, prepared, released) = Tracked::new(false);
        let session = RaceSession::builder()
            .backend(backend)
            .operation(op)
            .build()
            .expect("build");

        let mut consumer = |_: &Capture| true;
        assert!(matches!(
            session.leak(SIZE, &mut consumer),
            Err(LeakError::SetupFailed(_))
        ));
        assert_eq!(probe.allocations(), 1);
        assert_eq!(prepared.load(Ordering::SeqCst), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_prepare_failure_is_setup_failed() {
        let backend = RecordingBackend::new(SIZE);
        let probe = backend.probe();
        let (op, _, released) = Tracked::new(true);
        let session = RaceSession::builder()
            .backend(backend)
            .operation(op)
            .build()
            .expect("build");

        let mut consumer = |_: &Capture| true;
        assert!(matches!(
            session.leak(SIZE, &mut consumer),
            Err(LeakError::SetupFailed(_))
        ));
        assert!(probe.calls().is_empty());
        assert_eq!(released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_build_requires_parts() {
        let builder = RaceSession::builder().backend(RecordingBackend::new(SIZE));
        assert!(matches!(builder.build(), Err(BuildError::Operation)));
    }

    #[test]
    fn test_error_serializes_as_message() {
        let json = serde_json::to_string(&LeakError::NeverWon { attempts: 3 }).expect("json");
        assert_eq!(json, r#""Race never won in 3 attempts""#);
    }

    #[test]
    fn test_no_livelock_under_jitter() {
        for seed in 0..8u64 {
            let (tx, rx) = mpsc::channel();
            std::thread::spawn(move || {
                let backend = RecordingBackend::new(SIZE)
                    .with_jitter(Jitter::new(seed, Duration::from_micros(200)));
                let op = CopyoutWhenMapped::new(backend.probe(), vec![0x77; SIZE])
                    .with_jitter(Jitter::new(seed ^ 0xdead_beef, Duration::from_micros(200)));
                let session = RaceSession::builder()
                    .backend(backend)
                    .operation(op)
                    .sink(Arc::new(RecordingSink::new()))
                    .config(config(200, 200))
                    .build()
                    .expect("build");
                let mut consumer = |_: &Capture| true;
                let _ = tx.send(session.leak(SIZE, &mut consumer));
            });
            let result = rx
                .recv_timeout(Duration::from_secs(60))
                .unwrap_or_else(|_| panic!("Session with seed {} did not finish", seed));
            assert!(
                matches!(result, Ok(_) | Err(LeakError::NeverWon { .. })),
                "seed {}: {:?}",
                seed,
                result.map(|r| r.won_at)
            );
        }
    }
}
