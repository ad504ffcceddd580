//! Busy-wait rendezvous between the racer thread and the driver.
//!
//! The handshake is five atomic signals plus one state flag. Each has exactly one producer and
//! one consumer:
//!
//! | flag          | set by | consumed by | meaning                                       |
//! |---------------|--------|-------------|-----------------------------------------------|
//! | `running`     | driver | racer       | cleared once to request shutdown              |
//! | `deallocated` | racer  | driver      | the window is unmapped, ready for an attempt  |
//! | `do_map`      | driver | racer       | map the window now                            |
//! | `restart`     | driver | racer       | attempt over, unmap and go again              |
//! | `success`     | racer  | driver      | cleared once if remapping failed or the racer panicked |
//! | `mapped`      | racer  | driver      | the window is mapped; only read by the driver |
//!
//! Consuming a signal is an atomic `true -> false` exchange by its consumer, so neither side
//! ever read-modify-writes a flag the other side is writing. `mapped` is not consumed: the racer
//! sets it after each remap and clears it before each unmap, and the driver only reads it. All waits are spin-polls: the race
//! is lost if crossing the handshake costs a scheduler wake-up, so no blocking primitive is used.
//! A wait only ends through progress of the other side, or through [`Handshake::stop`].

use std::hint::spin_loop;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared signal block of one racer/driver pair.
///
/// Racer-side methods are crate private and only called from [`crate::racer`]; the driver side
/// is public so custom drivers can be built on top of [`crate::racer::RaceSynchronizer`].
#[derive(Debug)]
pub struct Handshake {
    running: AtomicBool,
    deallocated: AtomicBool,
    do_map: AtomicBool,
    restart: AtomicBool,
    success: AtomicBool,
    mapped: AtomicBool,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Atomically consumes a signal. Returns whether it was set.
fn consume(signal: &AtomicBool) -> bool {
    signal
        .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

impl Handshake {
    /// Creates a handshake in the `Running` state with no pending signals.
    pub fn new() -> Self {
        Handshake {
            running: AtomicBool::new(true),
            deallocated: AtomicBool::new(false),
            do_map: AtomicBool::new(false),
            restart: AtomicBool::new(false),
            success: AtomicBool::new(true),
            mapped: AtomicBool::new(false),
        }
    }

    // ---- racer side ----

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn announce_unmapped(&self) {
        self.deallocated.store(true, Ordering::Release);
    }

    /// Spins until the driver requests a mapping, and consumes the request.
    pub(crate) fn await_map_request(&self) {
        while !consume(&self.do_map) {
            spin_loop();
        }
    }

    /// Spins until the driver requests a restart or a shutdown.
    ///
    /// Returns `true` for a restart (consumed), `false` for a shutdown.
    pub(crate) fn await_restart(&self) -> bool {
        loop {
            if !self.running.load(Ordering::Acquire) {
                return false;
            }
            if consume(&self.restart) {
                return true;
            }
            spin_loop();
        }
    }

    pub(crate) fn announce_mapped(&self) {
        self.mapped.store(true, Ordering::Release);
    }

    pub(crate) fn withdraw_mapped(&self) {
        self.mapped.store(false, Ordering::Release);
    }

    pub(crate) fn report_failure(&self) {
        self.success.store(false, Ordering::Release);
    }

    // ---- driver side ----

    /// Spins until the racer announces an unmapped window, and consumes the announcement.
    ///
    /// Returns `false` without consuming anything if the racer reported a failure, since it
    /// will never announce again.
    pub fn await_unmapped(&self) -> bool {
        loop {
            if consume(&self.deallocated) {
                return true;
            }
            if !self.success.load(Ordering::Acquire) {
                return false;
            }
            spin_loop();
        }
    }

    /// Spins until the racer has mapped the window for the current attempt.
    ///
    /// Only meaningful after [`request_map`](Self::request_map). Once this returns `true`, the
    /// window stays mapped until [`request_restart`](Self::request_restart) or
    /// [`stop`](Self::stop). Returns `false` if the racer failed and the window will not be
    /// mapped.
    pub fn await_mapped(&self) -> bool {
        loop {
            if self.mapped.load(Ordering::Acquire) {
                return true;
            }
            if !self.success.load(Ordering::Acquire) {
                return false;
            }
            spin_loop();
        }
    }

    /// Asks the racer to map the window.
    pub fn request_map(&self) {
        self.do_map.store(true, Ordering::Release);
    }

    /// Ends the current attempt; the racer unmaps the window and announces it again.
    pub fn request_restart(&self) {
        self.restart.store(true, Ordering::Release);
    }

    /// Requests racer shutdown.
    ///
    /// Clears `running` and pulses `do_map`, so a racer parked waiting for a map request is
    /// released too. The caller must still join the racer thread.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.do_map.store(true, Ordering::Release);
    }

    /// Whether the racer reported a remap failure.
    pub fn racer_failed(&self) -> bool {
        !self.success.load(Ordering::Acquire)
    }
}
