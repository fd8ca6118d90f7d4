//! Error types for the phone orchestrator

use serde::Serialize;
use thiserror::Error;

use super::instance::{InstanceId, InstanceState};
use super::process::ProcessKind;

/// Result alias used by the core
pub type PhoneResult<T> = Result<T, PhoneError>;

/// Everything that can go wrong while managing phone instances
#[derive(Debug, Error)]
pub enum PhoneError {
    /// Bad configuration at creation
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// Two instances would share a port or display; indicates a broken allocator
    #[error("resource conflict: {resource} {value} is already held by instance {holder}")]
    PortConflict {
        resource: &'static str,
        value: u32,
        holder: InstanceId,
    },

    /// The guest image could not be prepared
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// A stage process could not be spawned
    #[error("failed to spawn {kind} process: {message}")]
    ProcessSpawn { kind: ProcessKind, message: String },

    /// The guest did not report boot completion in time (informational)
    #[error("boot completion not observed within {secs}s")]
    BootTimeout { secs: u64 },

    /// A device command was issued to an instance that is not running
    #[error("instance {id} is not running (state: {state})")]
    NotRunning { id: InstanceId, state: InstanceState },

    /// Another lifecycle operation is in flight
    #[error("instance {id} is busy (state: {state})")]
    Busy { id: InstanceId, state: InstanceState },

    /// No instance with this id exists
    #[error("instance {0} not found")]
    NotFound(InstanceId),

    /// The device bridge command returned a failure
    #[error("device command `{command}` failed with code {code:?}: {stderr}")]
    ShellCommand {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// A start was cancelled by a concurrent stop
    #[error("start of instance {0} was aborted by stop")]
    Aborted(InstanceId),

    /// A state change outside the lifecycle graph was attempted
    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition {
        from: InstanceState,
        to: InstanceState,
    },

    /// Saving or loading registry records failed
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Structured error kind for API-layer callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    PortConflict,
    Provisioning,
    ProcessSpawn,
    BootTimeout,
    NotRunning,
    Busy,
    NotFound,
    ShellCommand,
    Aborted,
    Internal,
}

impl PhoneError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::PortConflict { .. } => ErrorKind::PortConflict,
            Self::Provisioning(_) => ErrorKind::Provisioning,
            Self::ProcessSpawn { .. } => ErrorKind::ProcessSpawn,
            Self::BootTimeout { .. } => ErrorKind::BootTimeout,
            Self::NotRunning { .. } => ErrorKind::NotRunning,
            Self::Busy { .. } => ErrorKind::Busy,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::ShellCommand { .. } => ErrorKind::ShellCommand,
            Self::Aborted(_) => ErrorKind::Aborted,
            Self::InvalidTransition { .. } | Self::Persistence(_) | Self::Io(_) => {
                ErrorKind::Internal
            }
        }
    }
}
