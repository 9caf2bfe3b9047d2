//! Process liveness checks used to reclaim stale lock files

/// PID of the current orchestrator process.
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Whether `pid` refers to a live process.
///
/// Unix: `kill(pid, 0)` delivers no signal but still runs the permission and
/// existence checks. `EPERM` means the process exists under another user.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    // 0 and negative values address process groups, never a single holder.
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    // SAFETY: signal 0 performs error checking only and has no side effects.
    let ret = unsafe { libc::kill(raw, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Without a portable probe every holder is assumed alive, so locks are
/// only released explicitly or by a forced removal.
#[cfg(not(unix))]
pub fn is_alive(pid: u32) -> bool {
    pid != 0
}
