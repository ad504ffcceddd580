use libc::{O_CLOEXEC, O_NONBLOCK};
use log::{debug, trace};
use maprace_core::ExternalOperation;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use thiserror::Error;

/// Errors of the [`PipeCopyout`] operation.
#[derive(Debug, Error)]
pub enum PipeError {
    /// The payload is empty, so nothing can be staged.
    #[error("Payload must not be empty")]
    EmptyPayload,
    /// `invoke` was called without a successful `prepare`.
    #[error("Pipe not prepared")]
    NotPrepared,
    /// The pipe could not be created.
    #[error("Could not create pipe: {0}")]
    Create(#[source] io::Error),
    /// Writing the payload into the pipe failed.
    #[error("Could not stage payload: {0}")]
    Stage(#[source] io::Error),
    /// Reading into the window failed, e.g. with `EFAULT` if it was unmapped.
    #[error("Copy-out failed: {0}")]
    Copyout(#[source] io::Error),
}

/// Copies bytes out of a pipe into the window with `read(2)`.
///
/// Before each read the payload is repeated into the pipe until one window's worth of bytes is
/// pending. A read into an unmapped window fails with `EFAULT` and leaves the pending bytes in
/// the pipe for the next attempt.
///
/// # Lifecycle
///
/// * `prepare` opens a non-blocking pipe
/// * `invoke` stages bytes if needed and reads them into the window
/// * `release` closes both ends
pub struct PipeCopyout {
    payload: Vec<u8>,
    fds: Option<(OwnedFd, OwnedFd)>,
    pending: usize,
}

impl PipeCopyout {
    /// Creates the operation. `payload` is repeated to fill the window.
    pub fn new(payload: Vec<u8>) -> Self {
        PipeCopyout {
            payload,
            fds: None,
            pending: 0,
        }
    }

    /// Bytes staged in the pipe and not yet read.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Whether the pipe is open.
    pub fn is_prepared(&self) -> bool {
        self.fds.is_some()
    }

    fn stage(&mut self, capacity: usize) -> Result<(), PipeError> {
        let (_, write_end) = self.fds.as_ref().ok_or(PipeError::NotPrepared)?;
        let chunk: Vec<u8> = self.payload.iter().copied().cycle().take(capacity).collect();
        let n = unsafe {
            libc::write(
                write_end.as_raw_fd(),
                chunk.as_ptr() as *const libc::c_void,
                chunk.len(),
            )
        };
        if n < 0 {
            return Err(PipeError::Stage(io::Error::last_os_error()));
        }
        // a window larger than the pipe buffer is only partially staged
        self.pending += n as usize;
        trace!("Staged {} bytes", n);
        Ok(())
    }
}

impl ExternalOperation for PipeCopyout {
    type Error = PipeError;

    fn prepare(&mut self) -> Result<(), PipeError> {
        if self.payload.is_empty() {
            return Err(PipeError::EmptyPayload);
        }
        let mut fds = [0 as libc::c_int; 2];
        let r = unsafe { libc::pipe2(fds.as_mut_ptr(), O_CLOEXEC | O_NONBLOCK) };
        if r != 0 {
            return Err(PipeError::Create(io::Error::last_os_error()));
        }
        let (read_end, write_end) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        debug!(
            "Opened pipe ({}, {})",
            read_end.as_raw_fd(),
            write_end.as_raw_fd()
        );
        self.fds = Some((read_end, write_end));
        self.pending = 0;
        Ok(())
    }

    fn invoke(&mut self, address: usize, capacity: usize) -> Result<usize, PipeError> {
        if self.pending == 0 {
            self.stage(capacity)?;
        }
        let (read_end, _) = self.fds.as_ref().ok_or(PipeError::NotPrepared)?;
        let n = unsafe {
            libc::read(
                read_end.as_raw_fd(),
                address as *mut libc::c_void,
                capacity,
            )
        };
        if n < 0 {
            return Err(PipeError::Copyout(io::Error::last_os_error()));
        }
        self.pending -= n as usize;
        Ok(n as usize)
    }

    fn release(&mut self) {
        if self.fds.take().is_some() {
            debug!("Closed pipe");
        }
        self.pending = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copyout_into_buffer() {
        let mut op = PipeCopyout::new(vec![1, 2, 3]);
        op.prepare().expect("prepare");
        let mut buf = vec![0u8; 8];
        let n = op
            .invoke(buf.as_mut_ptr() as usize, buf.len())
            .expect("invoke");
        assert_eq!(n, 8);
        assert_eq!(buf, vec![1, 2, 3, 1, 2, 3, 1, 2]);
        assert_eq!(op.pending(), 0);
        op.release();
        assert!(!op.is_prepared());
    }

    #[test]
    fn test_copyout_into_unmapped_fails() {
        let size = 4096;
        let address = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(address, libc::MAP_FAILED);
        assert_eq!(unsafe { libc::munmap(address, size) }, 0);

        let mut op = PipeCopyout::new(vec![0xaa]);
        op.prepare().expect("prepare");
        match op.invoke(address as usize, 64) {
            Err(PipeError::Copyout(e)) => assert_eq!(e.raw_os_error(), Some(libc::EFAULT)),
            other => panic!("Expected EFAULT, got {:?}", other),
        }
        // the staged bytes stay in the pipe
        assert_eq!(op.pending(), 64);

        let mut buf = vec![0u8; 64];
        assert_eq!(op.invoke(buf.as_mut_ptr() as usize, 64).expect("invoke"), 64);
        assert!(buf.iter().all(|b| *b == 0xaa));
        op.release();
    }

    #[test]
    fn test_invoke_without_prepare() {
        let mut op = PipeCopyout::new(vec![1]);
        let mut buf = [0u8; 16];
        assert!(matches!(
            op.invoke(buf.as_mut_ptr() as usize, buf.len()),
            Err(PipeError::NotPrepared)
        ));
    }

    #[test]
    fn test_empty_payload() {
        let mut op = PipeCopyout::new(vec![]);
        assert!(matches!(op.prepare(), Err(PipeError::EmptyPayload)));
        assert!(!op.is_prepared());
    }

    #[test]
    fn test_large_window_is_partially_staged() {
        let mut op = PipeCopyout::new(vec![7]);
        op.prepare().expect("prepare");
        let mut buf = vec![0u8; 1 << 20];
        let n = op
            .invoke(buf.as_mut_ptr() as usize, buf.len())
            .expect("invoke");
        assert!(n > 0 && n < buf.len());
        assert!(buf[..n].iter().all(|b| *b == 7));
        op.release();
    }
}
