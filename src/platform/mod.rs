//! Platform-specific process signalling

#[cfg(unix)]
pub mod unix;

use anyhow::Result;

/// Terminate a process gracefully, together with its process group
pub fn terminate_process(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        // Stage processes lead their own group; reach forked children too
        unix::terminate_group(pid).or_else(|_| unix::terminate_process(pid))
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        anyhow::bail!("Unsupported platform")
    }
}

/// Force kill a process, together with its process group
pub fn kill_process(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        unix::kill_group(pid).or_else(|_| unix::kill_process(pid))
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        anyhow::bail!("Unsupported platform")
    }
}

/// Check if a process is running
pub fn is_process_running(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unix::is_process_running(pid)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}
