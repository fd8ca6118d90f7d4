//! Device bridge - Input injection and queries through adb
//!
//! Every command is an argument vector handed straight to the executable; no
//! local shell is involved. `adb shell` joins its arguments into a single
//! command line for the guest's `sh`, so each forwarded word is single-quoted
//! with [`shell_quote`] first.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use super::error::{PhoneError, PhoneResult};
use super::instance::Instance;
use super::monitor::ProcessUsage;

/// Directory on the guest that pushed files land in
pub const DEVICE_DOWNLOAD_DIR: &str = "/sdcard/Download";

/// Captured result of one command invocation
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was killed by a signal
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Runs a program to completion and captures its output
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

/// [`CommandRunner`] backed by real OS processes
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// A screenshot written to the host; the caller deletes it when done
#[derive(Debug, Clone, Serialize)]
pub struct ScreenshotRef {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub captured_at: DateTime<Utc>,
}

/// Best-effort guest metrics; a probe that fails reports zero
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceMetrics {
    pub timestamp: DateTime<Utc>,
    /// Guest CPU load percentage
    pub cpu_percent: f32,
    /// Total guest RAM in MB
    pub memory_mb: u64,
    /// Used share of `/data` in percent
    pub storage_percent: u32,
    /// Usage of the emulator process on the host
    pub host: Option<ProcessUsage>,
}

/// Thin, stateless command interface to running guests
#[derive(Clone)]
pub struct DeviceBridge {
    runner: Arc<dyn CommandRunner>,
    adb: String,
    screenshot_dir: PathBuf,
}

impl std::fmt::Debug for DeviceBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBridge")
            .field("adb", &self.adb)
            .field("screenshot_dir", &self.screenshot_dir)
            .finish()
    }
}

impl DeviceBridge {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        adb: impl Into<String>,
        screenshot_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            adb: adb.into(),
            screenshot_dir: screenshot_dir.into(),
        }
    }

    /// Type `text` into the focused field
    pub async fn send_text(&self, instance: &Instance, text: &str) -> PhoneResult<()> {
        instance.require_running()?;
        if text.is_empty() {
            debug!("Ignoring empty text input for {}", instance.id());
            return Ok(());
        }
        let encoded = encode_input_text(text);
        self.shell(
            &instance.ports().adb_serial(),
            &["input", "text", encoded.as_str()],
        )
        .await?;
        Ok(())
    }

    /// Tap at screen coordinates; bounds are the caller's concern
    pub async fn send_tap(&self, instance: &Instance, x: u32, y: u32) -> PhoneResult<()> {
        instance.require_running()?;
        let (x, y) = (x.to_string(), y.to_string());
        self.shell(
            &instance.ports().adb_serial(),
            &["input", "tap", x.as_str(), y.as_str()],
        )
        .await?;
        Ok(())
    }

    /// Send an Android key event code
    pub async fn send_key(&self, instance: &Instance, keycode: u32) -> PhoneResult<()> {
        instance.require_running()?;
        let keycode = keycode.to_string();
        self.shell(
            &instance.ports().adb_serial(),
            &["input", "keyevent", keycode.as_str()],
        )
        .await?;
        Ok(())
    }

    /// Capture the screen as a PNG file under the screenshot directory
    pub async fn screenshot(&self, instance: &Instance) -> PhoneResult<ScreenshotRef> {
        instance.require_running()?;
        let serial = instance.ports().adb_serial();
        let output = self
            .adb(
                &serial,
                vec!["exec-out".into(), "screencap".into(), "-p".into()],
            )
            .await?;
        if output.stdout.is_empty() {
            return Err(PhoneError::ShellCommand {
                command: "screencap -p".to_string(),
                code: output.code,
                stderr: "empty screenshot".to_string(),
            });
        }

        tokio::fs::create_dir_all(&self.screenshot_dir).await?;
        let path = self
            .screenshot_dir
            .join(format!("screenshot_{}.png", Uuid::new_v4()));
        tokio::fs::write(&path, &output.stdout).await?;
        debug!("Screenshot of {} written to {:?}", instance.id(), path);

        Ok(ScreenshotRef {
            path,
            size_bytes: output.stdout.len() as u64,
            captured_at: Utc::now(),
        })
    }

    /// Collect CPU, memory and storage figures from the guest
    pub async fn metrics(&self, instance: &Instance) -> PhoneResult<DeviceMetrics> {
        instance.require_running()?;
        let serial = instance.ports().adb_serial();

        let cpu_percent = self
            .shell(&serial, &["dumpsys", "cpuinfo"])
            .await
            .ok()
            .and_then(|out| parse_cpu_percent(&out))
            .unwrap_or_default();
        let memory_mb = self
            .shell(&serial, &["dumpsys", "meminfo"])
            .await
            .ok()
            .and_then(|out| parse_total_ram_mb(&out))
            .unwrap_or_default();
        let storage_percent = self
            .shell(&serial, &["df", "/data"])
            .await
            .ok()
            .and_then(|out| parse_storage_percent(&out))
            .unwrap_or_default();

        Ok(DeviceMetrics {
            timestamp: Utc::now(),
            cpu_percent,
            memory_mb,
            storage_percent,
            host: None,
        })
    }

    /// Copy a host file into the guest's download directory.
    ///
    /// Returns the path on the device.
    pub async fn push_file(
        &self,
        instance: &Instance,
        local_path: &Path,
        file_name: &str,
    ) -> PhoneResult<String> {
        instance.require_running()?;
        validate_file_name(file_name)?;
        if !tokio::fs::try_exists(local_path).await.unwrap_or(false) {
            return Err(PhoneError::Validation(format!(
                "local file {} does not exist",
                local_path.display()
            )));
        }

        let device_path = format!("{}/{}", DEVICE_DOWNLOAD_DIR, file_name);
        self.adb(
            &instance.ports().adb_serial(),
            vec![
                "push".into(),
                local_path.to_string_lossy().into_owned(),
                device_path.clone(),
            ],
        )
        .await?;
        info!("Pushed {:?} to {} on {}", local_path, device_path, instance.id());
        Ok(device_path)
    }

    /// Whether the guest reports `sys.boot_completed=1`
    pub async fn boot_completed(&self, serial: &str) -> PhoneResult<bool> {
        let out = self
            .shell(serial, &["getprop", "sys.boot_completed"])
            .await?;
        Ok(out.trim() == "1")
    }

    /// Run a guest shell command and return its stdout
    async fn shell(&self, serial: &str, words: &[&str]) -> PhoneResult<String> {
        let mut args = Vec::with_capacity(words.len() + 1);
        args.push("shell".to_string());
        args.extend(words.iter().map(|w| shell_quote(w)));
        let output = self.adb(serial, args).await?;
        Ok(output.stdout_text())
    }

    async fn adb(&self, serial: &str, args: Vec<String>) -> PhoneResult<CommandOutput> {
        let mut full = Vec::with_capacity(args.len() + 2);
        full.push("-s".to_string());
        full.push(serial.to_string());
        full.extend(args);

        let command = full.join(" ");
        let output = self
            .runner
            .run(&self.adb, &full)
            .await
            .map_err(|e| PhoneError::ShellCommand {
                command: command.clone(),
                code: None,
                stderr: e.to_string(),
            })?;
        if !output.success() {
            return Err(PhoneError::ShellCommand {
                command,
                code: output.code,
                stderr: output.stderr_text(),
            });
        }
        Ok(output)
    }
}

/// Quote one word for a POSIX shell. Safe words pass through unchanged;
/// everything else becomes a single-quoted string.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r#"'\''"#))
}

/// `input text` reads `%s` as a space
fn encode_input_text(text: &str) -> String {
    text.replace(' ', "%s")
}

fn validate_file_name(name: &str) -> PhoneResult<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.chars().any(|c| c.is_control());
    if bad {
        return Err(PhoneError::Validation(format!(
            "'{}' is not a plain file name",
            name.escape_debug()
        )));
    }
    Ok(())
}

/// Overall load from `dumpsys cpuinfo`; prefers the TOTAL line
pub fn parse_cpu_percent(output: &str) -> Option<f32> {
    let line = output
        .lines()
        .find(|l| l.contains("TOTAL"))
        .or_else(|| output.lines().find(|l| l.contains('%')))?;
    let end = line.find('%')?;
    let start = line[..end]
        .char_indices()
        .rev()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    line[start..end].parse().ok()
}

/// `Total RAM: 2,003,812K (status normal)` -> MB
pub fn parse_total_ram_mb(output: &str) -> Option<u64> {
    let line = output.lines().find(|l| l.contains("Total RAM"))?;
    let value = line.split(':').nth(1)?.trim_start();
    let digits: String = value
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',')
        .filter(|c| c.is_ascii_digit())
        .collect();
    let kb: u64 = digits.parse().ok()?;
    Some(kb / 1024)
}

/// Used percentage from `df /data` (1K-blocks columns)
pub fn parse_storage_percent(output: &str) -> Option<u32> {
    let line = output.lines().nth(1)?;
    let columns: Vec<&str> = line.split_whitespace().collect();
    if columns.len() < 4 {
        return None;
    }
    let total: u64 = columns[1].parse().ok()?;
    let used: u64 = columns[2].parse().ok()?;
    if total == 0 {
        return None;
    }
    Some(((used as f64 / total as f64) * 100.0).round() as u32)
}
