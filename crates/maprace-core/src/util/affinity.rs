/// Pins the calling thread to a single CPU core.
///
/// Returns the OS error if the affinity mask could not be applied, e.g. because the core does
/// not exist or is outside the allowed cpuset.
#[cfg(target_os = "linux")]
pub fn pin_thread_to_core(core: usize) -> Result<(), std::io::Error> {
    if core >= libc::CPU_SETSIZE as usize {
        return Err(std::io::Error::from_raw_os_error(libc::EINVAL));
    }
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        // 0 selects the calling thread
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Pins the calling thread to a single CPU core.
///
/// Thread affinity is not supported on this platform; always fails with
/// [`std::io::ErrorKind::Unsupported`].
#[cfg(not(target_os = "linux"))]
pub fn pin_thread_to_core(_core: usize) -> Result<(), std::io::Error> {
    Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
}
