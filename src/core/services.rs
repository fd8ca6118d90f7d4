//! Collaborators shared by every instance

use std::sync::Arc;

use super::boot::BootMonitor;
use super::bridge::{CommandRunner, DeviceBridge};
use super::commands::StageCommands;
use super::process::ProcessLauncher;
use super::provision::Provisioner;
use super::settings::Settings;

/// Everything an instance needs to run its lifecycle
pub struct Services {
    pub settings: Settings,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub provisioner: Arc<dyn Provisioner>,
    pub bridge: DeviceBridge,
    pub boot: BootMonitor,
    pub commands: StageCommands,
}

impl Services {
    pub fn new(
        settings: Settings,
        launcher: Arc<dyn ProcessLauncher>,
        provisioner: Arc<dyn Provisioner>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let bridge = DeviceBridge::new(
            runner,
            settings.tools.adb.clone(),
            settings.get_screenshots_directory(),
        );
        Self {
            boot: BootMonitor::from_settings(&settings),
            commands: StageCommands::from_settings(&settings),
            settings,
            launcher,
            provisioner,
            bridge,
        }
    }
}
