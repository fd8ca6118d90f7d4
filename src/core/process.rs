//! Process management - Spawning and stopping the per-stage OS processes

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::error::{PhoneError, PhoneResult};
use super::monitor::SharedHostMonitor;
use crate::platform;

/// The four processes that make up a running phone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessKind {
    /// Virtual X display
    Display,
    /// Android emulator
    Emulator,
    /// VNC server on the display
    Framebuffer,
    /// WebSocket bridge in front of the VNC server
    Bridge,
}

impl ProcessKind {
    pub const STARTUP_ORDER: [ProcessKind; 4] = [
        ProcessKind::Display,
        ProcessKind::Emulator,
        ProcessKind::Framebuffer,
        ProcessKind::Bridge,
    ];

    pub const TEARDOWN_ORDER: [ProcessKind; 4] = [
        ProcessKind::Bridge,
        ProcessKind::Framebuffer,
        ProcessKind::Emulator,
        ProcessKind::Display,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Display => "display",
            Self::Emulator => "emulator",
            Self::Framebuffer => "framebuffer",
            Self::Bridge => "bridge",
        }
    }
}

impl std::fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Everything needed to launch one stage process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub kind: ProcessKind,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Where stdout and stderr go; discarded when `None`
    pub log_file: Option<PathBuf>,
}

/// Identifies leftover processes of one stage by their command line.
///
/// A process matches when some argument contains `program` and some argument
/// is exactly `token` (a port or display name unique to the instance).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessPattern {
    pub program: String,
    pub token: String,
}

impl ProcessPattern {
    pub fn new(program: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            token: token.into(),
        }
    }

    pub fn matches(&self, cmd: &[String]) -> bool {
        let program = self
            .program
            .rsplit('/')
            .next()
            .unwrap_or(self.program.as_str());
        cmd.iter().any(|arg| arg.contains(program)) && cmd.iter().any(|arg| *arg == self.token)
    }
}

impl std::fmt::Display for ProcessPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.*{}", self.program, self.token)
    }
}

/// Handle to a spawned stage process
#[derive(Debug)]
pub struct ProcessHandle {
    kind: ProcessKind,
    pid: Option<u32>,
    child: Option<Child>,
}

impl ProcessHandle {
    pub fn new(kind: ProcessKind, child: Child) -> Self {
        Self {
            kind,
            pid: child.id(),
            child: Some(child),
        }
    }

    /// A handle known only by PID (or not at all)
    pub fn detached(kind: ProcessKind, pid: Option<u32>) -> Self {
        Self {
            kind,
            pid,
            child: None,
        }
    }

    pub fn kind(&self) -> ProcessKind {
        self.kind
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Starts and stops stage processes
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start the process and return immediately
    async fn spawn(&self, spec: &ProcessSpec) -> PhoneResult<ProcessHandle>;

    /// Request termination; succeeds if the process is already gone
    async fn kill(&self, handle: ProcessHandle) -> PhoneResult<()>;

    /// Kill every host process matching `pattern`; returns how many were hit
    async fn force_kill_matching(&self, pattern: &ProcessPattern) -> usize;
}

/// [`ProcessLauncher`] backed by real OS processes
#[derive(Clone)]
pub struct SystemLauncher {
    /// Time between SIGTERM and SIGKILL
    grace: Duration,
    monitor: SharedHostMonitor,
}

impl SystemLauncher {
    pub fn new(grace: Duration, monitor: SharedHostMonitor) -> Self {
        Self { grace, monitor }
    }

    fn output_target(spec: &ProcessSpec) -> PhoneResult<(Stdio, Stdio)> {
        let Some(path) = spec.log_file.as_ref() else {
            return Ok((Stdio::null(), Stdio::null()));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let err = file.try_clone()?;
        Ok((Stdio::from(file), Stdio::from(err)))
    }
}

#[async_trait]
impl ProcessLauncher for SystemLauncher {
    async fn spawn(&self, spec: &ProcessSpec) -> PhoneResult<ProcessHandle> {
        info!("Spawning {} process: {} {}", spec.kind, spec.program, spec.args.join(" "));

        let (stdout, stderr) = Self::output_target(spec).map_err(|e| PhoneError::ProcessSpawn {
            kind: spec.kind,
            message: format!("cannot open log file: {}", e),
        })?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(false);

        // Own process group so teardown reaches anything the stage forks
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|e| PhoneError::ProcessSpawn {
            kind: spec.kind,
            message: format!("{}: {}", spec.program, e),
        })?;

        let handle = ProcessHandle::new(spec.kind, child);
        debug!("Spawned {} with PID {:?}", spec.kind, handle.pid());
        Ok(handle)
    }

    async fn kill(&self, handle: ProcessHandle) -> PhoneResult<()> {
        let ProcessHandle { kind, pid, child } = handle;

        let Some(mut child) = child else {
            // Only a PID to go on
            if let Some(pid) = pid.filter(|pid| platform::is_process_running(*pid)) {
                platform::kill_process(pid).map_err(|e| PhoneError::Io(std::io::Error::other(e)))?;
            }
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!("{} process already exited ({})", kind, status);
            return Ok(());
        }

        if let Some(pid) = pid {
            if let Err(e) = platform::terminate_process(pid) {
                debug!("SIGTERM to {} process {} failed: {}", kind, pid, e);
            }
        }

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("{} process exited ({})", kind, status);
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!("{} process ignored SIGTERM, killing", kind);
                if let Some(pid) = pid {
                    let _ = platform::kill_process(pid);
                }
                child.start_kill()?;
                // Reap in the background so no zombie is left behind
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                Ok(())
            }
        }
    }

    async fn force_kill_matching(&self, pattern: &ProcessPattern) -> usize {
        let monitor = self.monitor.clone();
        let pattern = pattern.clone();
        tokio::task::spawn_blocking(move || monitor.kill_matching(&pattern))
            .await
            .unwrap_or_else(|e| {
                warn!("Process sweep task failed: {}", e);
                0
            })
    }
}
