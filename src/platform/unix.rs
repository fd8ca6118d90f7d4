//! Unix signal delivery for supervised stage processes

use anyhow::Result;

/// Send `signal` to a single process
fn signal_process(pid: u32, signal: libc::c_int, action: &str) -> Result<()> {
    let pid = i32::try_from(pid).map_err(|_| anyhow::anyhow!("PID {} out of range", pid))?;
    // SAFETY: kill(2) has no memory-safety preconditions
    let result = unsafe { libc::kill(pid, signal) };
    if result == 0 {
        Ok(())
    } else {
        anyhow::bail!(
            "Failed to {} process {}: {}",
            action,
            pid,
            std::io::Error::last_os_error()
        )
    }
}

/// Send `signal` to every member of the process group led by `pgid`
fn signal_group(pgid: u32, signal: libc::c_int, action: &str) -> Result<()> {
    let pgid = i32::try_from(pgid).map_err(|_| anyhow::anyhow!("PGID {} out of range", pgid))?;
    // SAFETY: kill(2) has no memory-safety preconditions
    let result = unsafe { libc::kill(-pgid, signal) };
    if result == 0 {
        Ok(())
    } else {
        anyhow::bail!(
            "Failed to {} process group {}: {}",
            action,
            pgid,
            std::io::Error::last_os_error()
        )
    }
}

/// Terminate a process gracefully (SIGTERM)
pub fn terminate_process(pid: u32) -> Result<()> {
    signal_process(pid, libc::SIGTERM, "terminate")
}

/// Force kill a process (SIGKILL)
pub fn kill_process(pid: u32) -> Result<()> {
    signal_process(pid, libc::SIGKILL, "kill")
}

/// SIGTERM a whole process group
pub fn terminate_group(pgid: u32) -> Result<()> {
    signal_group(pgid, libc::SIGTERM, "terminate")
}

/// SIGKILL a whole process group
pub fn kill_group(pgid: u32) -> Result<()> {
    signal_group(pgid, libc::SIGKILL, "kill")
}

/// Check if a process is running
pub fn is_process_running(pid: u32) -> bool {
    match i32::try_from(pid) {
        // kill with signal 0 checks if process exists without sending a signal
        Ok(pid) => unsafe { libc::kill(pid, 0) == 0 },
        Err(_) => false,
    }
}
