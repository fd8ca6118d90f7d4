//! Provisioning - Make sure a bootable AVD exists for an instance

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::bridge::CommandRunner;
use super::error::{PhoneError, PhoneResult};
use super::instance::PhoneConfig;
use super::settings::Settings;

/// Guarantees a guest image exists before the display is started
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Prepare the image for `slot` and return the AVD name to boot.
    /// Must be idempotent.
    async fn ensure_image(&self, slot: u32, config: &PhoneConfig) -> PhoneResult<String>;
}

/// Creates one AVD per slot with `avdmanager` and keeps its hardware config in
/// sync with the instance's [`PhoneConfig`]
pub struct AvdProvisioner {
    runner: Arc<dyn CommandRunner>,
    avdmanager: String,
    avd_home: PathBuf,
    image_tag: String,
    image_abi: String,
    device_profile: String,
}

impl AvdProvisioner {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: &Settings) -> Self {
        Self {
            runner,
            avdmanager: settings.tools.avdmanager.clone(),
            avd_home: settings.get_avd_home(),
            image_tag: settings.system_image_tag.clone(),
            image_abi: settings.system_image_abi.clone(),
            device_profile: settings.device_profile.clone(),
        }
    }

    pub fn avd_name(slot: u32) -> String {
        format!("openphone_{}", slot)
    }

    fn system_image(&self, config: &PhoneConfig) -> String {
        format!(
            "system-images;{};{};{}",
            config.platform_version, self.image_tag, self.image_abi
        )
    }

    async fn create_avd(&self, name: &str, avd_dir: &Path, config: &PhoneConfig) -> PhoneResult<()> {
        let package = self.system_image(config);
        info!("Creating AVD {} from {}", name, package);

        let args: Vec<String> = vec![
            "create".into(),
            "avd".into(),
            "--force".into(),
            "--name".into(),
            name.into(),
            "--package".into(),
            package,
            "--device".into(),
            self.device_profile.clone(),
            "--path".into(),
            avd_dir.to_string_lossy().into_owned(),
        ];
        let output = self
            .runner
            .run(&self.avdmanager, &args)
            .await
            .map_err(|e| PhoneError::Provisioning(format!("{}: {}", self.avdmanager, e)))?;
        if !output.success() {
            return Err(PhoneError::Provisioning(format!(
                "avdmanager exited with {:?}: {}",
                output.code,
                output.stderr_text()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for AvdProvisioner {
    async fn ensure_image(&self, slot: u32, config: &PhoneConfig) -> PhoneResult<String> {
        let name = Self::avd_name(slot);
        let ini = self.avd_home.join(format!("{}.ini", name));
        let avd_dir = self.avd_home.join(format!("{}.avd", name));

        tokio::fs::create_dir_all(&self.avd_home)
            .await
            .map_err(|e| PhoneError::Provisioning(format!("cannot create AVD home: {}", e)))?;

        if tokio::fs::try_exists(&ini).await.unwrap_or(false) {
            debug!("AVD {} already provisioned", name);
        } else {
            self.create_avd(&name, &avd_dir, config).await?;
        }

        let config_path = avd_dir.join("config.ini");
        let existing = tokio::fs::read_to_string(&config_path)
            .await
            .unwrap_or_default();
        let merged = merge_ini(&existing, &hardware_overrides(config));
        if merged != existing {
            tokio::fs::create_dir_all(&avd_dir).await?;
            tokio::fs::write(&config_path, merged)
                .await
                .map_err(|e| PhoneError::Provisioning(format!("cannot write {:?}: {}", config_path, e)))?;
            debug!("Updated hardware config of AVD {}", name);
        }

        Ok(name)
    }
}

/// AVD `config.ini` keys derived from the phone's configuration
pub fn hardware_overrides(config: &PhoneConfig) -> Vec<(String, String)> {
    vec![
        ("hw.ramSize".into(), config.ram_mb.to_string()),
        ("disk.dataPartition.size".into(), format!("{}M", config.storage_mb)),
        ("hw.lcd.width".into(), config.screen_width.to_string()),
        ("hw.lcd.height".into(), config.screen_height.to_string()),
        ("hw.lcd.density".into(), config.density_dpi.to_string()),
        ("hw.cpu.ncore".into(), config.cpu_cores.to_string()),
        ("hw.keyboard".into(), "yes".into()),
    ]
}

/// Set `key=value` pairs in an ini body, replacing existing keys in place and
/// appending the rest
pub fn merge_ini(existing: &str, overrides: &[(String, String)]) -> String {
    let mut pending: Vec<&(String, String)> = overrides.iter().collect();
    let mut lines: Vec<String> = existing
        .lines()
        .map(|line| {
            let key = line.split('=').next().unwrap_or("").trim();
            match pending.iter().position(|(k, _)| k == key) {
                Some(index) => {
                    let (k, v) = pending.remove(index);
                    format!("{}={}", k, v)
                }
                None => line.to_string(),
            }
        })
        .collect();
    lines.extend(pending.into_iter().map(|(k, v)| format!("{}={}", k, v)));

    let mut body = lines.join("\n");
    body.push('\n');
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bridge::CommandOutput;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, _program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
            self.calls.lock().unwrap().push(args.to_vec());
            Ok(CommandOutput {
                code: Some(if self.fail { 1 } else { 0 }),
                stdout: Vec::new(),
                stderr: b"package not installed".to_vec(),
            })
        }
    }

    fn settings(dir: &tempfile::TempDir) -> Settings {
        Settings {
            avd_home: Some(dir.path().to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn merge_replaces_and_appends() {
        let existing = "hw.ramSize=2048\nimage.sysdir.1=system-images/android-34/\n";
        let merged = merge_ini(
            existing,
            &[
                ("hw.ramSize".to_string(), "4096".to_string()),
                ("hw.lcd.density".to_string(), "420".to_string()),
            ],
        );
        assert_eq!(
            merged,
            "hw.ramSize=4096\nimage.sysdir.1=system-images/android-34/\nhw.lcd.density=420\n"
        );
        // Idempotent
        assert_eq!(merge_ini(&merged, &[("hw.ramSize".into(), "4096".into())]), merged);
    }

    #[tokio::test]
    async fn creates_missing_avd_once() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let provisioner = AvdProvisioner::new(runner.clone(), &settings(&dir));
        let config = PhoneConfig::default();

        let name = provisioner.ensure_image(3, &config).await.unwrap();
        assert_eq!(name, "openphone_3");
        {
            let calls = runner.calls.lock().unwrap();
            assert_eq!(calls.len(), 1);
            assert!(calls[0].contains(&"system-images;android-34;google_apis;x86_64".to_string()));
        }

        let config_ini =
            std::fs::read_to_string(dir.path().join("openphone_3.avd").join("config.ini")).unwrap();
        assert!(config_ini.contains("hw.lcd.width=1080"));
        assert!(config_ini.contains("disk.dataPartition.size=8192M"));

        // avdmanager would have written the .ini; once present, no second create
        std::fs::write(dir.path().join("openphone_3.ini"), "path=x\n").unwrap();
        provisioner.ensure_image(3, &config).await.unwrap();
        assert_eq!(runner.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn avdmanager_failure_is_a_provisioning_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner {
            fail: true,
            ..Default::default()
        });
        let provisioner = AvdProvisioner::new(runner, &settings(&dir));

        let err = provisioner
            .ensure_image(0, &PhoneConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PhoneError::Provisioning(ref m) if m.contains("package not installed")));
    }
}
