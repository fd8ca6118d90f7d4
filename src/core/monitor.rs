//! Host monitoring - CPU capacity, process table scans and per-process usage

use std::sync::{Arc, RwLock};

use serde::Serialize;
use sysinfo::{
    CpuRefreshKind, Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System, UpdateKind,
};
use tracing::{debug, trace, warn};

use super::process::ProcessPattern;

/// Host-side resource usage of one process
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessUsage {
    /// CPU usage percentage (may exceed 100 on multi-core hosts)
    pub cpu_percent: f32,
    /// Resident memory in bytes
    pub memory_bytes: u64,
    /// Virtual memory in bytes
    pub virtual_memory_bytes: u64,
}

/// Wraps a sysinfo [`System`] for the queries the orchestrator needs
pub struct HostMonitor {
    system: System,
}

impl HostMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new_with_specifics(
                RefreshKind::new().with_cpu(CpuRefreshKind::everything()),
            ),
        }
    }

    /// Get the number of CPUs/cores
    pub fn cpu_count(&self) -> usize {
        self.system.cpus().len()
    }

    /// Refresh the process table including command lines
    pub fn refresh_processes(&mut self) {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new()
                .with_cmd(UpdateKind::OnlyIfNotSet)
                .with_cpu()
                .with_memory(),
        );
        trace!("Process table refreshed");
    }

    /// PIDs of processes whose command line matches `pattern`
    pub fn find_matching(&self, pattern: &ProcessPattern) -> Vec<u32> {
        let own_pid = sysinfo::get_current_pid().ok();
        self.system
            .processes()
            .iter()
            .filter(|(pid, _)| Some(**pid) != own_pid)
            .filter(|(_, process)| {
                let cmd: Vec<String> = process
                    .cmd()
                    .iter()
                    .map(|s| s.to_string_lossy().to_string())
                    .collect();
                pattern.matches(&cmd)
            })
            .map(|(pid, _)| pid.as_u32())
            .collect()
    }

    /// SIGKILL every process matching `pattern`; returns how many were signalled
    pub fn kill_matching(&mut self, pattern: &ProcessPattern) -> usize {
        self.refresh_processes();
        let mut killed = 0;
        for pid in self.find_matching(pattern) {
            match self.system.process(Pid::from_u32(pid)) {
                Some(process) if process.kill() => {
                    debug!("Force-killed PID {} matching {}", pid, pattern);
                    killed += 1;
                }
                Some(_) => warn!("Could not kill PID {} matching {}", pid, pattern),
                None => {}
            }
        }
        killed
    }

    /// Get resource usage for a specific process
    pub fn process_usage(&mut self, pid: u32) -> Option<ProcessUsage> {
        let pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );
        let process = self.system.process(pid)?;
        Some(ProcessUsage {
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
            virtual_memory_bytes: process.virtual_memory(),
        })
    }
}

impl Default for HostMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper for HostMonitor
pub struct SharedHostMonitor {
    inner: Arc<RwLock<HostMonitor>>,
}

impl SharedHostMonitor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HostMonitor::new())),
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.inner.read().map(|m| m.cpu_count()).unwrap_or(1)
    }

    pub fn kill_matching(&self, pattern: &ProcessPattern) -> usize {
        self.inner
            .write()
            .map(|mut m| m.kill_matching(pattern))
            .unwrap_or(0)
    }

    pub fn process_usage(&self, pid: u32) -> Option<ProcessUsage> {
        self.inner.write().ok()?.process_usage(pid)
    }
}

impl Default for SharedHostMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SharedHostMonitor {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
