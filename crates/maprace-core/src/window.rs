//! The raced memory window.
//!
//! A [`MemoryWindow`] owns one virtual address range of fixed size. Its address is chosen by the
//! system on the first successful [`map`](MemoryWindow::map) and reused for every remap, so the
//! external operation always targets the same address. The actual mapping calls go through a
//! [`MappingBackend`], which lets tests substitute a recording double for the real
//! [`MmapBackend`].

use log::{trace, warn};
use thiserror::Error;

/// Errors that can occur while mapping or unmapping a window.
#[derive(Debug, Error)]
pub enum WindowError {
    /// A fixed placement was requested, but the address range is not available.
    #[error("Fixed address 0x{address:x} is unavailable")]
    FixedAddressUnavailable {
        /// The requested address
        address: usize,
    },
    /// The backend failed to create the mapping.
    #[error("Could not allocate virtual memory: {0}")]
    Map(#[source] std::io::Error),
    /// The backend failed to remove the mapping.
    #[error("Could not deallocate virtual memory: {0}")]
    Unmap(#[source] std::io::Error),
}

/// Trait for the primitive that maps and unmaps a raw address range.
///
/// Implementors are not required to be thread safe. During a race the racer thread is the only
/// caller, and the driver only touches the backend again after the racer was joined.
///
/// # Required Methods
///
/// * [`allocate()`](MappingBackend::allocate) - Creates a read/write mapping
/// * [`deallocate()`](MappingBackend::deallocate) - Removes a mapping
///
/// # Safety
///
/// The driver reads the window after the racer has mapped it. A successful `allocate` must
/// return the start of `size` readable bytes that stay readable until the matching
/// `deallocate`.
pub unsafe trait MappingBackend {
    /// Creates a mapping of `size` bytes.
    ///
    /// With `hint == None` the backend picks the address and returns it. With a hint, the
    /// mapping must be placed at exactly that address.
    ///
    /// # Errors
    ///
    /// * [`WindowError::FixedAddressUnavailable`] if the hinted range cannot be used
    /// * [`WindowError::Map`] for any other failure
    fn allocate(&mut self, hint: Option<usize>, size: usize) -> Result<usize, WindowError>;

    /// Removes the mapping at `address`.
    ///
    /// Removing a range that is not mapped must succeed.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError::Unmap`] if the arguments are rejected.
    fn deallocate(&mut self, address: usize, size: usize) -> Result<(), WindowError>;
}

/// Anonymous private memory mapped with `mmap(2)`.
///
/// Fixed placements use `MAP_FIXED_NOREPLACE`, so a range that was taken over by another
/// mapping while the window was unmapped is reported instead of silently clobbered.
#[cfg(target_os = "linux")]
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapBackend;

#[cfg(target_os = "linux")]
unsafe impl MappingBackend for MmapBackend {
    fn allocate(&mut self, hint: Option<usize>, size: usize) -> Result<usize, WindowError> {
        use libc::{MAP_ANONYMOUS, MAP_FIXED_NOREPLACE, MAP_PRIVATE, PROT_READ, PROT_WRITE};

        let (addr, flags) = match hint {
            Some(address) => (
                address as *mut libc::c_void,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_FIXED_NOREPLACE,
            ),
            None => (std::ptr::null_mut(), MAP_PRIVATE | MAP_ANONYMOUS),
        };
        let p = unsafe { libc::mmap(addr, size, PROT_READ | PROT_WRITE, flags, -1, 0) };
        if p == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            return match (hint, err.raw_os_error()) {
                (Some(address), Some(libc::EEXIST)) => {
                    Err(WindowError::FixedAddressUnavailable { address })
                }
                _ => Err(WindowError::Map(err)),
            };
        }
        // kernels before 4.17 treat MAP_FIXED_NOREPLACE as a plain hint
        if let Some(address) = hint
            && p as usize != address
        {
            unsafe { libc::munmap(p, size) };
            return Err(WindowError::FixedAddressUnavailable { address });
        }
        Ok(p as usize)
    }

    fn deallocate(&mut self, address: usize, size: usize) -> Result<(), WindowError> {
        let r = unsafe { libc::munmap(address as *mut libc::c_void, size) };
        if r != 0 {
            return Err(WindowError::Unmap(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

/// A fixed-size memory window that is repeatedly mapped and unmapped at one address.
///
/// Dropping a mapped window unmaps it.
#[derive(Debug)]
pub struct MemoryWindow<B: MappingBackend> {
    backend: B,
    address: Option<usize>,
    size: usize,
    mapped: bool,
}

impl<B: MappingBackend> MemoryWindow<B> {
    /// Creates an unmapped window whose address is chosen on the first [`map`](Self::map).
    pub fn new(backend: B, size: usize) -> Self {
        MemoryWindow {
            backend,
            address: None,
            size,
            mapped: false,
        }
    }

    /// Creates an unmapped window that must be placed at `address`.
    pub fn with_address(backend: B, address: usize, size: usize) -> Self {
        MemoryWindow {
            backend,
            address: Some(address),
            size,
            mapped: false,
        }
    }

    /// The window address, once assigned.
    pub fn address(&self) -> Option<usize> {
        self.address
    }

    /// The window length in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the window is currently mapped.
    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    /// Maps the window, assigning its address on first use.
    ///
    /// Mapping an already mapped window returns its address without touching the backend.
    ///
    /// # Errors
    ///
    /// Propagates the backend error. On failure the window stays unmapped.
    pub fn map(&mut self) -> Result<usize, WindowError> {
        if self.mapped
            && let Some(address) = self.address
        {
            return Ok(address);
        }
        let address = self.backend.allocate(self.address, self.size)?;
        trace!("Mapped window 0x{:x} ({} bytes)", address, self.size);
        self.address = Some(address);
        self.mapped = true;
        Ok(address)
    }

    /// Unmaps the window.
    ///
    /// Unmapping an unmapped window is a successful no-op. The backend is not called in that
    /// case, since the range may meanwhile belong to someone else.
    ///
    /// # Errors
    ///
    /// Propagates the backend error. The window is considered unmapped afterwards either way.
    pub fn unmap(&mut self) -> Result<(), WindowError> {
        let address = match (self.mapped, self.address) {
            (true, Some(address)) => address,
            _ => return Ok(()),
        };
        self.mapped = false;
        self.backend.deallocate(address, self.size)
    }

    /// Access to the backend, e.g. for inspecting a test double.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: MappingBackend> Drop for MemoryWindow<B> {
    fn drop(&mut self) {
        if let Err(e) = self.unmap() {
            warn!("Failed to unmap window on drop: {}", e);
        }
    }
}
