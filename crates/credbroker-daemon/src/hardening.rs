//! Process-level hardening applied before any key material is loaded.

#![cfg_attr(unix, allow(unsafe_code))]

#[cfg(unix)]
pub fn disable_core_dumps() -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: setrlimit is called with a valid, fully-initialized rlimit
    // struct for this process's own RLIMIT_CORE.
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn disable_core_dumps() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
pub fn lock_memory() -> std::io::Result<()> {
    // SAFETY: mlockall takes no pointers; it only affects this process's
    // own page tables.
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn lock_memory() -> std::io::Result<()> {
    Ok(())
}

/// Runs before the tracing subscriber is initialized, so failures here go
/// straight to stderr rather than through a structured log line.
#[allow(clippy::print_stderr)]
pub fn apply(disable_mlock: bool) {
    if let Err(err) = disable_core_dumps() {
        eprintln!("warning: failed to disable core dumps: {err}");
    }
    if !disable_mlock
        && let Err(err) = lock_memory()
    {
        eprintln!("warning: failed to lock process memory: {err}");
    }
}
