//! The racer thread.
//!
//! [`RaceSynchronizer`] owns the [`MemoryWindow`] for the duration of a session and cycles it
//! through the following states until the driver stops it:
//!
//! 1. `Running -> Unmapped`: unmap the window and announce it.
//! 2. `Unmapped -> MapRequested`: spin until the driver asks for a mapping.
//! 3. `MapRequested -> Mapped`: do a little unrelated work, then remap at the fixed address
//!    and publish the mapping. A failed remap is fatal: it is reported through the handshake and
//!    the thread exits. So is a panic on the racer thread.
//! 4. `Mapped -> Unmapped | Stopped`: spin until the driver restarts or stops the racer.
//!
//! The thread hands the window back when joined, so the driver performs the final unmap.

use crate::event::{EventSink, RaceEvent};
use crate::handshake::Handshake;
use crate::util::pin_thread_to_core;
use crate::window::{MappingBackend, MemoryWindow};
use log::{debug, warn};
use std::sync::Arc;
use std::thread;

/// Handle of a running racer thread.
///
/// Dropping the handle stops and joins the thread; the window returned by the thread is dropped
/// and thereby unmapped. Use [`stop`](RaceSynchronizer::stop) to get the window back instead.
pub struct RaceSynchronizer<B: MappingBackend + Send + 'static> {
    handle: Option<thread::JoinHandle<MemoryWindow<B>>>,
    handshake: Arc<Handshake>,
    address: usize,
    size: usize,
}

impl<B: MappingBackend + Send + 'static> RaceSynchronizer<B> {
    /// Spawns the racer thread for a window that has already been mapped once.
    ///
    /// # Arguments
    ///
    /// * `window` - The window to race; moves into the racer thread
    /// * `core` - Optional CPU core to pin the racer thread to
    /// * `sink` - Receives racer events
    ///
    /// # Errors
    ///
    /// Returns an [`InvalidInput`](std::io::ErrorKind::InvalidInput) error if the window was
    /// never mapped, or the I/O error if the thread could not be created. The window is dropped
    /// (and thereby unmapped) in both cases.
    pub fn spawn(
        window: MemoryWindow<B>,
        core: Option<usize>,
        sink: Arc<dyn EventSink>,
    ) -> std::io::Result<Self> {
        let Some(address) = window.address() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "window has no address yet",
            ));
        };
        let size = window.size();
        let handshake = Arc::new(Handshake::new());
        let hs = Arc::clone(&handshake);
        let handle = thread::Builder::new()
            .name("maprace-racer".into())
            .spawn(move || {
                let _guard = FailOnPanic(&hs);
                if let Some(core) = core {
                    match pin_thread_to_core(core) {
                        Ok(()) => debug!("Racer pinned to core {}", core),
                        Err(e) => {
                            warn!("Could not pin racer to core {}: {}", core, e);
                            sink.emit(&RaceEvent::PinFailed { core });
                        }
                    }
                }
                race(window, &hs, sink.as_ref())
            })?;
        Ok(RaceSynchronizer {
            handle: Some(handle),
            handshake,
            address,
            size,
        })
    }

    /// The handshake shared with the racer thread.
    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    /// The fixed window address.
    pub fn address(&self) -> usize {
        self.address
    }

    /// The window length in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Stops the racer and joins it, returning the window.
    ///
    /// The window may still be mapped; unmapping it is up to the caller.
    ///
    /// # Errors
    ///
    /// Returns the panic payload if the racer thread panicked.
    pub fn stop(mut self) -> thread::Result<MemoryWindow<B>> {
        self.handshake.stop();
        match self.handle.take() {
            Some(handle) => handle.join(),
            // only Drop takes the handle, and it cannot run before this
            None => unreachable!("racer joined twice"),
        }
    }
}

impl<B: MappingBackend + Send + 'static> Drop for RaceSynchronizer<B> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.handshake.stop();
            // the joined window unmaps itself on drop
            let _ = handle.join();
        }
    }
}

/// Reports a racer failure if the racer thread unwinds, so the driver stops waiting for it.
struct FailOnPanic<'a>(&'a Handshake);

impl Drop for FailOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.report_failure();
        }
    }
}

/// Cheap, non-blocking work between the map request and the remap, biasing the remap towards
/// the moment the foreign operation reaches its access.
fn nudge_scheduler() {
    #[cfg(unix)]
    unsafe {
        libc::close(-1);
    }
    #[cfg(not(unix))]
    std::hint::spin_loop();
}

/// The racer loop. Returns the window once stopped or after a fatal remap failure.
fn race<B: MappingBackend>(
    mut window: MemoryWindow<B>,
    handshake: &Handshake,
    sink: &dyn EventSink,
) -> MemoryWindow<B> {
    while handshake.is_running() {
        handshake.withdraw_mapped();
        if let Err(e) = window.unmap() {
            // the window counts as unmapped either way
            warn!("Racer failed to unmap window: {}", e);
        }
        handshake.announce_unmapped();

        handshake.await_map_request();
        if !handshake.is_running() {
            break;
        }
        nudge_scheduler();
        if let Err(e) = window.map() {
            sink.emit(&RaceEvent::RemapFailed {
                error: e.to_string(),
            });
            handshake.report_failure();
            break;
        }
        handshake.announce_mapped();

        if !handshake.await_restart() {
            break;
        }
    }
    window
}
