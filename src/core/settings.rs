//! Orchestrator settings management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use super::ports::PortLayout;

/// Longest boot-wait ceiling accepted from stored settings
pub const MAX_BOOT_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Longest delay, poll interval, settle pause or kill grace (ms)
pub const MAX_STEP_MS: u64 = 10 * 60 * 1000;

/// Executables the orchestrator launches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPaths {
    /// Virtual X display server
    pub xvfb: String,
    /// Android emulator
    pub emulator: String,
    /// VNC server for the virtual display
    pub x11vnc: String,
    /// WebSocket to TCP bridge
    pub websockify: String,
    /// Static noVNC client served by the bridge
    pub novnc_web_dir: PathBuf,
    /// Android debug bridge
    pub adb: String,
    /// AVD creation tool
    pub avdmanager: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            xvfb: "Xvfb".to_string(),
            emulator: "emulator".to_string(),
            x11vnc: "x11vnc".to_string(),
            websockify: "websockify".to_string(),
            novnc_web_dir: PathBuf::from("/usr/share/novnc/"),
            adb: "adb".to_string(),
            avdmanager: "avdmanager".to_string(),
        }
    }
}

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Resources
    /// Port and display bases/strides
    pub port_layout: PortLayout,
    /// Maximum instances allowed (0 = as many as the port layout holds)
    pub max_instances: u32,
    /// Upper bound on emulator CPU cores, further capped by the host
    pub max_cpu_cores: u32,

    // Tooling
    /// Paths of the launched executables
    pub tools: ToolPaths,
    /// Emulator GPU mode
    pub emulator_gpu: String,
    /// Emulator acceleration mode
    pub emulator_accel: String,
    /// System image tag used when creating AVDs
    pub system_image_tag: String,
    /// System image ABI used when creating AVDs
    pub system_image_abi: String,
    /// Hardware profile passed to avdmanager
    pub device_profile: String,

    // Timing
    /// Delay before the first boot-completion probe (ms)
    pub boot_initial_delay_ms: u64,
    /// Interval between boot-completion probes (ms)
    pub boot_poll_interval_ms: u64,
    /// Boot-wait ceiling in seconds; after it the guest is assumed ready
    pub boot_timeout_secs: u64,
    /// Pause after spawning display, framebuffer and bridge (ms)
    pub stage_settle_ms: u64,
    /// Grace period between SIGTERM and SIGKILL (ms)
    pub kill_grace_ms: u64,

    // Advanced
    /// Custom data directory
    pub data_directory: Option<PathBuf>,
    /// Custom AVD home (defaults to ~/.android/avd)
    pub avd_home: Option<PathBuf>,
    /// Host name used in VNC URLs
    pub public_host: String,
    /// Enable debug logging
    pub debug_logging: bool,
    /// Days of lifecycle history kept (0 = keep forever)
    pub history_retention_days: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            // Resources
            port_layout: PortLayout::default(),
            max_instances: 0,
            max_cpu_cores: 8,

            // Tooling
            tools: ToolPaths::default(),
            emulator_gpu: "swiftshader_indirect".to_string(),
            emulator_accel: "auto".to_string(),
            system_image_tag: "google_apis".to_string(),
            system_image_abi: "x86_64".to_string(),
            device_profile: "pixel".to_string(),

            // Timing
            boot_initial_delay_ms: 10_000,
            boot_poll_interval_ms: 5_000,
            boot_timeout_secs: 300,
            stage_settle_ms: 2_000,
            kill_grace_ms: 3_000,

            // Advanced
            data_directory: None,
            avd_home: None,
            public_host: "localhost".to_string(),
            debug_logging: false,
            history_retention_days: 30,
        }
    }
}

impl Settings {
    /// Get the data directory, using default if not set
    pub fn get_data_directory(&self) -> PathBuf {
        self.data_directory.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("OpenPhone")
        })
    }

    /// Get the directory holding per-instance process logs
    pub fn get_logs_directory(&self) -> PathBuf {
        self.get_data_directory().join("logs")
    }

    /// Get the directory transient screenshots are written to
    pub fn get_screenshots_directory(&self) -> PathBuf {
        self.get_data_directory().join("screenshots")
    }

    /// Get the AVD home directory
    pub fn get_avd_home(&self) -> PathBuf {
        self.avd_home.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".android")
                .join("avd")
        })
    }

    /// Instance limit after applying the port layout's capacity
    pub fn effective_max_instances(&self) -> u32 {
        let capacity = self.port_layout.capacity();
        if self.max_instances == 0 {
            capacity
        } else {
            self.max_instances.min(capacity)
        }
    }

    pub fn boot_initial_delay(&self) -> Duration {
        Duration::from_millis(self.boot_initial_delay_ms)
    }

    pub fn boot_poll_interval(&self) -> Duration {
        Duration::from_millis(self.boot_poll_interval_ms)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    pub fn stage_settle(&self) -> Duration {
        Duration::from_millis(self.stage_settle_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        if let Err(e) = self.port_layout.validate() {
            warn!("Invalid port layout ({}), falling back to defaults", e);
            self.port_layout = PortLayout::default();
        }
        self.max_cpu_cores = self.max_cpu_cores.clamp(1, 64);
        self.boot_initial_delay_ms = self.boot_initial_delay_ms.min(MAX_STEP_MS);
        self.boot_poll_interval_ms = self.boot_poll_interval_ms.clamp(1, MAX_STEP_MS);
        self.boot_timeout_secs = self.boot_timeout_secs.clamp(1, MAX_BOOT_TIMEOUT_SECS);
        self.stage_settle_ms = self.stage_settle_ms.min(MAX_STEP_MS);
        self.kill_grace_ms = self.kill_grace_ms.min(MAX_STEP_MS);
        if self.public_host.trim().is_empty() {
            self.public_host = "localhost".to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_repairs_broken_values() {
        let mut settings = Settings {
            max_cpu_cores: 0,
            boot_poll_interval_ms: 0,
            public_host: "  ".to_string(),
            port_layout: PortLayout {
                control_stride: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        settings.validate();

        assert_eq!(settings.max_cpu_cores, 1);
        assert_eq!(settings.boot_poll_interval_ms, 1);
        assert_eq!(settings.public_host, "localhost");
        assert_eq!(settings.port_layout, PortLayout::default());
    }

    #[test]
    fn validate_caps_oversized_timings() {
        let mut settings = Settings {
            boot_initial_delay_ms: u64::MAX,
            boot_poll_interval_ms: u64::MAX,
            boot_timeout_secs: u64::MAX,
            stage_settle_ms: u64::MAX,
            kill_grace_ms: u64::MAX,
            ..Default::default()
        };
        settings.validate();

        assert_eq!(settings.boot_timeout_secs, MAX_BOOT_TIMEOUT_SECS);
        assert_eq!(settings.boot_initial_delay_ms, MAX_STEP_MS);
        assert_eq!(settings.boot_poll_interval_ms, MAX_STEP_MS);
        assert_eq!(settings.stage_settle_ms, MAX_STEP_MS);
        assert_eq!(settings.kill_grace_ms, MAX_STEP_MS);
        // The ceiling must be addable to the current instant
        assert!(std::time::Instant::now()
            .checked_add(settings.boot_timeout())
            .is_some());

        let mut sane = Settings::default();
        sane.validate();
        assert_eq!(sane.boot_timeout_secs, 300);
        assert_eq!(sane.kill_grace_ms, 3_000);
    }

    #[test]
    fn max_instances_is_bounded_by_layout() {
        let mut settings = Settings::default();
        assert_eq!(settings.effective_max_instances(), 173);

        settings.max_instances = 4;
        assert_eq!(settings.effective_max_instances(), 4);

        settings.max_instances = 10_000;
        assert_eq!(settings.effective_max_instances(), 173);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"boot_timeout_secs": 42}"#).unwrap();
        assert_eq!(settings.boot_timeout_secs, 42);
        assert_eq!(settings.tools.adb, "adb");
        assert_eq!(settings.port_layout.control_base, 5554);
        assert_eq!(settings.history_retention_days, 30);
    }
}
