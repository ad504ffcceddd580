//! The external operation raced against.
//!
//! An [`ExternalOperation`] models the foreign, timing-sensitive call whose access to the window
//! is raced: typically a system call that copies data out to a user address. The engine invokes
//! it right after asking the racer to map the window and judges the race only by the result.

/// Trait for the operation raced against the window mapping.
///
/// # Lifecycle
///
/// 1. [`prepare()`](ExternalOperation::prepare) - Acquire endpoints (called once, before the
///    window is mapped)
/// 2. [`invoke()`](ExternalOperation::invoke) - Called once per attempt
/// 3. [`release()`](ExternalOperation::release) - Release endpoints (called once on every exit
///    path after a successful `prepare`)
///
/// # Contract
///
/// `invoke` must only write to `address` if the address is backed by a valid mapping at the time
/// of access, and must fail cleanly, without crashing the process, if it is not. Kernel copy
/// routines behave this way: they return `EFAULT` instead of faulting the caller.
pub trait ExternalOperation {
    /// The error type returned by the operation.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Acquires whatever the operation needs, e.g. opens the endpoint.
    ///
    /// # Errors
    ///
    /// A failure here aborts the session before any racing begins.
    fn prepare(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Performs the operation against the window.
    ///
    /// # Arguments
    ///
    /// * `address` - Window address
    /// * `capacity` - Window length; the operation must not write past it
    ///
    /// # Returns
    ///
    /// The number of bytes the operation considers written.
    ///
    /// # Errors
    ///
    /// Any error is read as "the window was not mapped in time".
    fn invoke(&mut self, address: usize, capacity: usize) -> Result<usize, Self::Error>;

    /// Releases what [`prepare()`](ExternalOperation::prepare) acquired.
    fn release(&mut self) {}
}

impl<E, F> ExternalOperation for F
where
    E: std::error::Error + Send + Sync + 'static,
    F: FnMut(usize, usize) -> Result<usize, E>,
{
    type Error = E;

    fn invoke(&mut self, address: usize, capacity: usize) -> Result<usize, E> {
        self(address, capacity)
    }
}
