//! Test doubles for the engine's seams.
//!
//! - [`RecordingBackend`] - a heap-backed [`MappingBackend`] recording every call
//! - [`CopyoutWhenMapped`] - an [`ExternalOperation`] that behaves like a kernel copy-out: it
//!   writes only while the recording backend reports the window as mapped
//! - [`Jitter`] - deterministic, seeded delays to shake up thread interleavings
//!
//! The recording backend never unmaps real memory. Its "mapping" is a flag, so an operation that
//! writes regardless of the flag cannot crash the process.

use crate::operation::ExternalOperation;
use crate::window::{MappingBackend, WindowError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// A call made to a [`RecordingBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    /// `allocate` with the given hint
    Allocate {
        /// Requested fixed address
        hint: Option<usize>,
    },
    /// `deallocate`
    Deallocate,
}

/// Failure of a scripted operation.
#[derive(Debug, Error)]
#[error("scripted operation failure")]
pub struct ScriptError;

/// Seeded random delays.
///
/// Short delays are spun, longer ones slept, so both sides of the handshake get preempted at
/// varying points.
#[derive(Debug)]
pub struct Jitter {
    rng: Mutex<StdRng>,
    max_micros: u64,
}

impl Jitter {
    /// Creates a jitter source producing delays in `0..=max`.
    pub fn new(seed: u64, max: Duration) -> Self {
        Jitter {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            max_micros: max.as_micros() as u64,
        }
    }

    /// Waits for the next random delay.
    pub fn pause(&self) {
        let micros = match self.rng.lock() {
            Ok(mut rng) => rng.random_range(0..=self.max_micros),
            Err(_) => 0,
        };
        let delay = Duration::from_micros(micros);
        if micros < 50 {
            let start = Instant::now();
            while start.elapsed() < delay {
                std::hint::spin_loop();
            }
        } else {
            std::thread::sleep(delay);
        }
    }
}

struct Region {
    ptr: *mut u8,
    len: usize,
    mapped: AtomicBool,
    calls: Mutex<Vec<BackendCall>>,
}

// The region is only written through raw pointers by one thread at a time, see RecordingBackend.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Drop for Region {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr, self.len);
        drop(unsafe { Box::from_raw(slice) });
    }
}

impl Region {
    fn record(&self, call: BackendCall) {
        match self.calls.lock() {
            Ok(mut calls) => calls.push(call),
            Err(poisoned) => poisoned.into_inner().push(call),
        }
    }
}

/// Heap-backed mapping backend that records its calls.
///
/// All "mappings" share one zero-initialised heap buffer, so the window address never changes
/// and stays readable and writable even while "unmapped". Inspect the backend through a
/// [`BackendProbe`], which stays valid after the backend moved into the racer thread.
pub struct RecordingBackend {
    region: Arc<Region>,
    allocations: usize,
    fail_on: Option<usize>,
    occupied: bool,
    jitter: Option<Jitter>,
}

impl RecordingBackend {
    /// Creates a backend able to serve windows of up to `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        let buffer = vec![0u8; capacity].into_boxed_slice();
        let len = buffer.len();
        let ptr = Box::into_raw(buffer) as *mut u8;
        RecordingBackend {
            region: Arc::new(Region {
                ptr,
                len,
                mapped: AtomicBool::new(false),
                calls: Mutex::new(vec![]),
            }),
            allocations: 0,
            fail_on: None,
            occupied: false,
            jitter: None,
        }
    }

    /// Makes the `nth` allocation (counting from 1) fail.
    pub fn fail_allocation(mut self, nth: usize) -> Self {
        self.fail_on = Some(nth);
        self
    }

    /// Makes every allocation fail.
    pub fn occupied(mut self) -> Self {
        self.occupied = true;
        self
    }

    /// Delays every call by a random amount.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// A handle for inspecting the backend.
    pub fn probe(&self) -> BackendProbe {
        BackendProbe {
            region: Arc::clone(&self.region),
        }
    }

    fn pause(&self) {
        if let Some(jitter) = &self.jitter {
            jitter.pause();
        }
    }
}

// The heap buffer outlives every allocation and is never freed while the backend exists.
unsafe impl MappingBackend for RecordingBackend {
    fn allocate(&mut self, hint: Option<usize>, size: usize) -> Result<usize, WindowError> {
        self.pause();
        self.allocations += 1;
        self.region.record(BackendCall::Allocate { hint });
        if self.occupied || self.fail_on == Some(self.allocations) {
            return Err(WindowError::Map(std::io::Error::from(
                std::io::ErrorKind::OutOfMemory,
            )));
        }
        if size > self.region.len {
            return Err(WindowError::Map(std::io::Error::from(
                std::io::ErrorKind::InvalidInput,
            )));
        }
        let address = self.region.ptr as usize;
        if let Some(hint) = hint
            && hint != address
        {
            return Err(WindowError::FixedAddressUnavailable { address: hint });
        }
        self.region.mapped.store(true, Ordering::SeqCst);
        Ok(address)
    }

    fn deallocate(&mut self, _address: usize, _size: usize) -> Result<(), WindowError> {
        self.pause();
        self.region.record(BackendCall::Deallocate);
        self.region.mapped.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Read access to a [`RecordingBackend`].
#[derive(Clone)]
pub struct BackendProbe {
    region: Arc<Region>,
}

impl BackendProbe {
    /// Address every allocation returns.
    pub fn address(&self) -> usize {
        self.region.ptr as usize
    }

    /// Whether the backend currently considers the window mapped.
    pub fn is_mapped(&self) -> bool {
        self.region.mapped.load(Ordering::SeqCst)
    }

    /// All calls so far, in order.
    pub fn calls(&self) -> Vec<BackendCall> {
        match self.region.calls.lock() {
            Ok(calls) => calls.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Number of `allocate` calls so far.
    pub fn allocations(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, BackendCall::Allocate { .. }))
            .count()
    }
}

/// Operation that copies a payload into the window, but only while it is mapped.
///
/// Mimics a kernel copy-out against a [`RecordingBackend`]: the write happens if the backend
/// reports the window as mapped at the moment of access, otherwise the call fails.
pub struct CopyoutWhenMapped {
    probe: BackendProbe,
    payload: Vec<u8>,
    jitter: Option<Jitter>,
    invocations: u64,
}

impl CopyoutWhenMapped {
    /// Creates the operation.
    ///
    /// # Arguments
    ///
    /// * `probe` - Probe of the backend behind the raced window
    /// * `payload` - Bytes copied on success; truncated to the window
    pub fn new(probe: BackendProbe, payload: Vec<u8>) -> Self {
        CopyoutWhenMapped {
            probe,
            payload,
            jitter: None,
            invocations: 0,
        }
    }

    /// Delays every invocation by a random amount before the access.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Number of invocations so far.
    pub fn invocations(&self) -> u64 {
        self.invocations
    }
}

impl ExternalOperation for CopyoutWhenMapped {
    type Error = ScriptError;

    fn invoke(&mut self, address: usize, capacity: usize) -> Result<usize, ScriptError> {
        self.invocations += 1;
        if let Some(jitter) = &self.jitter {
            jitter.pause();
        }
        if !self.probe.is_mapped() {
            return Err(ScriptError);
        }
        let len = self.payload.len().min(capacity);
        unsafe { std::ptr::copy_nonoverlapping(self.payload.as_ptr(), address as *mut u8, len) };
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_records_calls() {
        let mut backend = RecordingBackend::new(16);
        let probe = backend.probe();
        let address = backend.allocate(None, 16).expect("allocate");
        assert_eq!(address, probe.address());
        assert!(probe.is_mapped());
        backend.deallocate(address, 16).expect("deallocate");
        assert!(!probe.is_mapped());
        assert_eq!(
            probe.calls(),
            vec![BackendCall::Allocate { hint: None }, BackendCall::Deallocate]
        );
        assert_eq!(probe.allocations(), 1);
    }

    #[test]
    fn test_backend_scripted_failure() {
        let mut backend = RecordingBackend::new(16).fail_allocation(2);
        let address = backend.allocate(None, 16).expect("first allocate");
        assert!(matches!(
            backend.allocate(Some(address), 16),
            Err(WindowError::Map(_))
        ));
        assert!(backend.allocate(Some(address), 16).is_ok());
    }

    #[test]
    fn test_backend_rejects_oversized() {
        let mut backend = RecordingBackend::new(16);
        assert!(backend.allocate(None, 17).is_err());
    }

    #[test]
    fn test_copyout_when_mapped() {
        let mut backend = RecordingBackend::new(16);
        let probe = backend.probe();
        let mut op = CopyoutWhenMapped::new(probe.clone(), vec![0xaa; 32]);

        assert!(op.invoke(probe.address(), 16).is_err());
        let address = backend.allocate(None, 16).expect("allocate");
        assert_eq!(op.invoke(address, 16).expect("invoke"), 16);
        let byte = unsafe { std::ptr::read((address + 15) as *const u8) };
        assert_eq!(byte, 0xaa);
        assert_eq!(op.invocations(), 2);
    }

    #[test]
    fn test_jitter_is_deterministic() {
        let a = Jitter::new(7, Duration::from_micros(10));
        let b = Jitter::new(7, Duration::from_micros(10));
        let xs: Vec<u64> = (0..8)
            .map(|_| a.rng.lock().expect("lock").random_range(0..=a.max_micros))
            .collect();
        let ys: Vec<u64> = (0..8)
            .map(|_| b.rng.lock().expect("lock").random_range(0..=b.max_micros))
            .collect();
        assert_eq!(xs, ys);
        a.pause();
    }
}
