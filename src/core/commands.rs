//! Stage commands - Command lines and leftover-process patterns per stage

use std::path::PathBuf;

use super::instance::Instance;
use super::ports::PortAssignment;
use super::process::{ProcessKind, ProcessPattern, ProcessSpec};
use super::settings::{Settings, ToolPaths};

/// Builds the command line for each stage of an instance
#[derive(Debug, Clone)]
pub struct StageCommands {
    tools: ToolPaths,
    gpu: String,
    accel: String,
    avd_home: PathBuf,
    logs_dir: PathBuf,
}

impl StageCommands {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            tools: settings.tools.clone(),
            gpu: settings.emulator_gpu.clone(),
            accel: settings.emulator_accel.clone(),
            avd_home: settings.get_avd_home(),
            logs_dir: settings.get_logs_directory(),
        }
    }

    /// Launch description for `kind` on `instance`
    pub fn spec(&self, kind: ProcessKind, instance: &Instance, avd_name: &str) -> ProcessSpec {
        let ports = instance.ports();
        let config = instance.config();
        let display = ports.display_name();

        let (program, args, env) = match kind {
            ProcessKind::Display => (
                &self.tools.xvfb,
                vec![
                    display.clone(),
                    "-screen".to_string(),
                    "0".to_string(),
                    format!("{}x{}x24", config.screen_width, config.screen_height),
                    "-ac".to_string(),
                    "+extension".to_string(),
                    "GLX".to_string(),
                    "+render".to_string(),
                    "-noreset".to_string(),
                ],
                Vec::new(),
            ),
            ProcessKind::Emulator => (
                &self.tools.emulator,
                vec![
                    "-avd".to_string(),
                    avd_name.to_string(),
                    "-no-window".to_string(),
                    "-no-audio".to_string(),
                    "-no-boot-anim".to_string(),
                    "-gpu".to_string(),
                    self.gpu.clone(),
                    "-camera-back".to_string(),
                    "none".to_string(),
                    "-camera-front".to_string(),
                    "none".to_string(),
                    "-memory".to_string(),
                    config.ram_mb.to_string(),
                    "-partition-size".to_string(),
                    config.storage_mb.to_string(),
                    "-cores".to_string(),
                    config.cpu_cores.to_string(),
                    "-accel".to_string(),
                    self.accel.clone(),
                    "-netdelay".to_string(),
                    "none".to_string(),
                    "-netspeed".to_string(),
                    "full".to_string(),
                    "-port".to_string(),
                    ports.control_port.to_string(),
                ],
                vec![
                    ("DISPLAY".to_string(), display.clone()),
                    (
                        "ANDROID_AVD_HOME".to_string(),
                        self.avd_home.to_string_lossy().into_owned(),
                    ),
                ],
            ),
            ProcessKind::Framebuffer => (
                &self.tools.x11vnc,
                vec![
                    "-display".to_string(),
                    display.clone(),
                    "-nopw".to_string(),
                    "-listen".to_string(),
                    "0.0.0.0".to_string(),
                    "-xkb".to_string(),
                    "-rfbport".to_string(),
                    ports.framebuffer_port.to_string(),
                    "-shared".to_string(),
                    "-forever".to_string(),
                ],
                Vec::new(),
            ),
            ProcessKind::Bridge => (
                &self.tools.websockify,
                vec![
                    format!("--web={}", self.tools.novnc_web_dir.display()),
                    ports.bridge_port.to_string(),
                    format!("localhost:{}", ports.framebuffer_port),
                ],
                Vec::new(),
            ),
        };

        ProcessSpec {
            kind,
            program: program.clone(),
            args,
            env,
            log_file: Some(
                self.logs_dir
                    .join(instance.id().to_string())
                    .join(format!("{}.log", kind)),
            ),
        }
    }

    /// Pattern that finds a stage's processes for these ports even without a handle
    pub fn pattern(&self, kind: ProcessKind, ports: &PortAssignment) -> ProcessPattern {
        match kind {
            ProcessKind::Display => ProcessPattern::new(&self.tools.xvfb, ports.display_name()),
            ProcessKind::Emulator => {
                ProcessPattern::new(&self.tools.emulator, ports.control_port.to_string())
            }
            ProcessKind::Framebuffer => {
                ProcessPattern::new(&self.tools.x11vnc, ports.display_name())
            }
            ProcessKind::Bridge => {
                ProcessPattern::new(&self.tools.websockify, ports.bridge_port.to_string())
            }
        }
    }
}
