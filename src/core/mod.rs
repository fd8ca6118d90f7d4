//! Core module - Instance lifecycle, process supervision and device access

mod boot;
mod bridge;
mod commands;
mod error;
mod instance;
mod monitor;
mod ports;
mod process;
mod provision;
mod registry;
mod services;
pub mod settings;

pub use boot::{BootMonitor, BootOutcome};
pub use bridge::{
    shell_quote, CommandOutput, CommandRunner, DeviceBridge, DeviceMetrics, ScreenshotRef,
    SystemRunner, DEVICE_DOWNLOAD_DIR,
};
pub use commands::StageCommands;
pub use error::{ErrorKind, PhoneError, PhoneResult};
pub use instance::{
    Instance, InstanceId, InstanceRecord, InstanceState, InstanceStatus, LastError, PhoneConfig,
};
pub use monitor::{HostMonitor, ProcessUsage, SharedHostMonitor};
pub use ports::{PortAssignment, PortLayout};
pub use process::{
    ProcessHandle, ProcessKind, ProcessLauncher, ProcessPattern, ProcessSpec, SystemLauncher,
};
pub use provision::{AvdProvisioner, Provisioner};
pub use registry::InstanceRegistry;
pub use services::Services;
pub use settings::{Settings, ToolPaths};
