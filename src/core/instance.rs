//! Instance management - One phone and its lifecycle state machine

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::boot::{cancelled, BootOutcome};
use super::error::{PhoneError, PhoneResult};
use super::ports::PortAssignment;
use super::process::{ProcessHandle, ProcessKind};
use super::services::Services;

/// Unique identifier for an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for InstanceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    Created,
    Provisioning,
    DisplayStarting,
    Booting,
    FramebufferStarting,
    BridgeStarting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl InstanceState {
    /// A start or stop is in flight
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            Self::Provisioning
                | Self::DisplayStarting
                | Self::Booting
                | Self::FramebufferStarting
                | Self::BridgeStarting
                | Self::Stopping
        )
    }

    /// States in which the instance may own live child processes
    pub fn may_hold_processes(&self) -> bool {
        matches!(
            self,
            Self::DisplayStarting
                | Self::Booting
                | Self::FramebufferStarting
                | Self::BridgeStarting
                | Self::Running
                | Self::Stopping
        )
    }

    /// Whether `next` is an edge of the lifecycle graph
    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        use InstanceState::*;
        match (*self, next) {
            (Provisioning, DisplayStarting)
            | (DisplayStarting, Booting)
            | (Booting, FramebufferStarting)
            | (FramebufferStarting, BridgeStarting)
            | (BridgeStarting, Running) => true,
            (Stopping, Stopped) => true,
            (Stopping, _) => false,
            (Stopped, Provisioning) => true,
            (Stopped, _) => false,
            (Failed, Provisioning | Stopping) => true,
            (Failed, _) => false,
            (Created, Provisioning) => true,
            (_, Stopping | Failed) => true,
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Provisioning => "Provisioning",
            Self::DisplayStarting => "DisplayStarting",
            Self::Booting => "Booting",
            Self::FramebufferStarting => "FramebufferStarting",
            Self::BridgeStarting => "BridgeStarting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Hardware configuration of a phone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhoneConfig {
    /// Platform identifier, e.g. `android-34`
    pub platform_version: String,
    pub ram_mb: u32,
    pub storage_mb: u32,
    pub screen_width: u32,
    pub screen_height: u32,
    pub density_dpi: u32,
    pub cpu_cores: u32,
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self {
            platform_version: "android-34".to_string(),
            ram_mb: 4096,
            storage_mb: 8192,
            screen_width: 1080,
            screen_height: 2400,
            density_dpi: 420,
            cpu_cores: 4,
        }
    }
}

impl PhoneConfig {
    pub const RAM_RANGE_MB: (u32, u32) = (1024, 65_536);
    pub const STORAGE_RANGE_MB: (u32, u32) = (2048, 1_048_576);
    pub const SCREEN_RANGE: (u32, u32) = (240, 4320);
    pub const DENSITY_RANGE: (u32, u32) = (120, 640);
    pub const MIN_API_LEVEL: u32 = 21;

    /// Numeric API level of `platform_version`
    pub fn api_level(&self) -> Option<u32> {
        self.platform_version
            .strip_prefix("android-")
            .and_then(|level| level.parse().ok())
    }

    /// Check ranges and clamp `cpu_cores` to `max_cpu_cores`
    pub fn validated(mut self, max_cpu_cores: u32) -> PhoneResult<Self> {
        match self.api_level() {
            Some(level) if level >= Self::MIN_API_LEVEL => {}
            _ => {
                return Err(PhoneError::Validation(format!(
                    "platform_version must look like android-<level> with level >= {}, got '{}'",
                    Self::MIN_API_LEVEL,
                    self.platform_version
                )))
            }
        }

        check_range("ram_mb", self.ram_mb, Self::RAM_RANGE_MB)?;
        check_range("storage_mb", self.storage_mb, Self::STORAGE_RANGE_MB)?;
        check_range("screen_width", self.screen_width, Self::SCREEN_RANGE)?;
        check_range("screen_height", self.screen_height, Self::SCREEN_RANGE)?;
        check_range("density_dpi", self.density_dpi, Self::DENSITY_RANGE)?;

        if self.cpu_cores == 0 {
            return Err(PhoneError::Validation(
                "cpu_cores must be at least 1".to_string(),
            ));
        }
        let cap = max_cpu_cores.max(1);
        if self.cpu_cores > cap {
            warn!(
                "Requested {} CPU cores, capping at host-safe maximum {}",
                self.cpu_cores, cap
            );
            self.cpu_cores = cap;
        }

        Ok(self)
    }
}

fn check_range(field: &str, value: u32, (min, max): (u32, u32)) -> PhoneResult<()> {
    if value < min || value > max {
        return Err(PhoneError::Validation(format!(
            "{} must be between {} and {}, got {}",
            field, min, max, value
        )));
    }
    Ok(())
}

/// Error recorded when an instance fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    /// The stage that was running when the failure happened
    pub stage: InstanceState,
    pub message: String,
}

/// Read-only snapshot of an instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub id: InstanceId,
    pub slot: u32,
    pub name: String,
    pub state: InstanceState,
    pub config: PhoneConfig,
    pub ports: PortAssignment,
    pub last_error: Option<LastError>,
    /// Child processes tracked at snapshot time
    pub processes: Vec<ProcessKind>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl InstanceStatus {
    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running
    }
}

/// Persistent description of an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub slot: u32,
    pub name: String,
    pub config: PhoneConfig,
    pub ports: PortAssignment,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Lifecycle {
    state: InstanceState,
    last_error: Option<LastError>,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
}

/// Child processes owned by one instance
#[derive(Debug, Default)]
struct ProcessSet {
    handles: Vec<ProcessHandle>,
}

impl ProcessSet {
    fn insert(&mut self, handle: ProcessHandle) {
        self.handles.retain(|h| h.kind() != handle.kind());
        self.handles.push(handle);
    }

    fn take(&mut self, kind: ProcessKind) -> Option<ProcessHandle> {
        let index = self.handles.iter().position(|h| h.kind() == kind)?;
        Some(self.handles.remove(index))
    }

    fn kinds(&self) -> Vec<ProcessKind> {
        self.handles.iter().map(|h| h.kind()).collect()
    }

    fn pid(&self, kind: ProcessKind) -> Option<u32> {
        self.handles
            .iter()
            .find(|h| h.kind() == kind)
            .and_then(|h| h.pid())
    }
}

/// A managed phone: configuration, resources and lifecycle state
#[derive(Debug)]
pub struct Instance {
    id: InstanceId,
    slot: u32,
    name: String,
    config: PhoneConfig,
    ports: PortAssignment,
    created_at: DateTime<Utc>,
    lifecycle: RwLock<Lifecycle>,
    processes: Mutex<ProcessSet>,
    /// Held for the whole duration of a start or stop
    op_lock: tokio::sync::Mutex<()>,
    /// Set by stop to abort an in-flight start
    cancel: watch::Sender<bool>,
    /// Set once the registry has begun deleting the instance
    retired: AtomicBool,
}

impl Instance {
    pub fn new(slot: u32, name: String, config: PhoneConfig, ports: PortAssignment) -> Self {
        Self::with_state(
            InstanceRecord {
                id: InstanceId::new(),
                slot,
                name,
                config,
                ports,
                created_at: Utc::now(),
            },
            InstanceState::Created,
        )
    }

    /// Rebuild an instance from a stored record. Nothing is running for it yet,
    /// so it comes back as Stopped.
    pub fn restore(record: InstanceRecord) -> Self {
        Self::with_state(record, InstanceState::Stopped)
    }

    fn with_state(record: InstanceRecord, state: InstanceState) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            id: record.id,
            slot: record.slot,
            name: record.name,
            config: record.config,
            ports: record.ports,
            created_at: record.created_at,
            lifecycle: RwLock::new(Lifecycle {
                state,
                last_error: None,
                started_at: None,
                stopped_at: None,
            }),
            processes: Mutex::new(ProcessSet::default()),
            op_lock: tokio::sync::Mutex::new(()),
            cancel,
            retired: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PhoneConfig {
        &self.config
    }

    pub fn ports(&self) -> &PortAssignment {
        &self.ports
    }

    pub fn state(&self) -> InstanceState {
        self.read_lifecycle().state
    }

    pub fn record(&self) -> InstanceRecord {
        InstanceRecord {
            id: self.id,
            slot: self.slot,
            name: self.name.clone(),
            config: self.config.clone(),
            ports: self.ports,
            created_at: self.created_at,
        }
    }

    /// Snapshot of the instance; never touches I/O
    pub fn status(&self) -> InstanceStatus {
        let processes = self.live_processes();
        let lifecycle = self.read_lifecycle();
        InstanceStatus {
            id: self.id,
            slot: self.slot,
            name: self.name.clone(),
            state: lifecycle.state,
            config: self.config.clone(),
            ports: self.ports,
            last_error: lifecycle.last_error.clone(),
            processes,
            created_at: self.created_at,
            started_at: lifecycle.started_at,
            stopped_at: lifecycle.stopped_at,
        }
    }

    /// Kinds of child processes currently tracked
    pub fn live_processes(&self) -> Vec<ProcessKind> {
        self.lock_processes().kinds()
    }

    /// PID of the emulator process, if tracked
    pub fn emulator_pid(&self) -> Option<u32> {
        self.lock_processes().pid(ProcessKind::Emulator)
    }

    /// Fail with `NotRunning` unless the instance is Running
    pub fn require_running(&self) -> PhoneResult<()> {
        let state = self.state();
        if state != InstanceState::Running {
            return Err(PhoneError::NotRunning { id: self.id, state });
        }
        Ok(())
    }

    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Bring the phone up: provision, display, emulator, boot wait,
    /// framebuffer, bridge.
    pub async fn start(&self, services: &Services) -> PhoneResult<()> {
        if self.is_retired() {
            return Err(PhoneError::NotFound(self.id));
        }
        match self.state() {
            InstanceState::Running => {
                debug!("Instance {} already running", self.id);
                return Ok(());
            }
            state if state.is_transitional() => {
                return Err(PhoneError::Busy { id: self.id, state });
            }
            _ => {}
        }

        let _guard = self.op_lock.try_lock().map_err(|_| PhoneError::Busy {
            id: self.id,
            state: self.state(),
        })?;

        // Re-check under the lock; a stop may have queued in between
        if self.is_retired() {
            return Err(PhoneError::NotFound(self.id));
        }
        let state = self.state();
        if state == InstanceState::Running {
            return Ok(());
        }
        if state.is_transitional() || *self.cancel.borrow() {
            return Err(PhoneError::Busy { id: self.id, state });
        }

        info!("Starting instance '{}' ({})", self.name, self.id);
        let mut cancel = self.cancel.subscribe();

        match self.bring_up(services, &mut cancel).await {
            Ok(()) => {
                info!(
                    "Instance '{}' running (vnc port {}, web port {})",
                    self.name, self.ports.framebuffer_port, self.ports.bridge_port
                );
                Ok(())
            }
            Err(PhoneError::Aborted(_)) => {
                if self.state().is_transitional() {
                    info!("Start of instance {} aborted, tearing down", self.id);
                    self.teardown(services).await;
                } else {
                    info!("Start of instance {} aborted before provisioning", self.id);
                }
                Err(PhoneError::Aborted(self.id))
            }
            Err(e) => {
                let stage = self.state();
                error!("Instance {} failed during {}: {}", self.id, stage, e);
                self.release_processes(services).await;
                self.fail(stage, &e);
                Err(e)
            }
        }
    }

    /// Tear the phone down. Aborts an in-flight start and waits for it to
    /// finish its own teardown. Returns whether this call tore anything down;
    /// `false` means the instance was already Stopped.
    ///
    /// The no-op decision is only made under the operation lock: a start that
    /// holds the lock may still be about to leave Stopped.
    pub async fn stop(&self, services: &Services) -> PhoneResult<bool> {
        self.cancel.send_replace(true);
        let _guard = self.op_lock.lock().await;

        let tore_down = if self.state() == InstanceState::Stopped {
            debug!("Instance {} already stopped", self.id);
            false
        } else {
            info!("Stopping instance '{}' ({})", self.name, self.id);
            self.teardown(services).await;
            true
        };

        self.cancel.send_replace(false);
        Ok(tore_down)
    }

    async fn bring_up(
        &self,
        services: &Services,
        cancel: &mut watch::Receiver<bool>,
    ) -> PhoneResult<()> {
        self.checkpoint(cancel)?;
        self.transition(InstanceState::Provisioning)?;
        {
            let mut lifecycle = self.write_lifecycle();
            lifecycle.started_at = None;
            lifecycle.stopped_at = None;
        }
        let avd_name = services
            .provisioner
            .ensure_image(self.slot, &self.config)
            .await?;
        self.checkpoint(cancel)?;

        self.transition(InstanceState::DisplayStarting)?;
        self.spawn_stage(services, ProcessKind::Display, &avd_name)
            .await?;
        self.settle(services, cancel).await?;

        self.transition(InstanceState::Booting)?;
        self.spawn_stage(services, ProcessKind::Emulator, &avd_name)
            .await?;
        match services
            .boot
            .wait(&services.bridge, &self.ports.adb_serial(), cancel)
            .await
        {
            BootOutcome::Completed(elapsed) => {
                info!("Instance {} booted in {:?}", self.id, elapsed);
            }
            BootOutcome::TimedOut(elapsed) => {
                let notice = PhoneError::BootTimeout {
                    secs: elapsed.as_secs(),
                };
                warn!("Instance {}: {}; assuming ready", self.id, notice);
            }
            BootOutcome::Cancelled => return Err(PhoneError::Aborted(self.id)),
        }

        self.transition(InstanceState::FramebufferStarting)?;
        self.spawn_stage(services, ProcessKind::Framebuffer, &avd_name)
            .await?;
        self.settle(services, cancel).await?;

        self.transition(InstanceState::BridgeStarting)?;
        self.spawn_stage(services, ProcessKind::Bridge, &avd_name)
            .await?;
        self.settle(services, cancel).await?;
        self.checkpoint(cancel)?;

        self.transition(InstanceState::Running)?;
        self.write_lifecycle().started_at = Some(Utc::now());
        Ok(())
    }

    async fn spawn_stage(
        &self,
        services: &Services,
        kind: ProcessKind,
        avd_name: &str,
    ) -> PhoneResult<()> {
        let spec = services.commands.spec(kind, self, avd_name);
        let handle = services.launcher.spawn(&spec).await?;
        debug!(
            "Instance {} spawned {} process (pid {:?})",
            self.id,
            kind,
            handle.pid()
        );
        self.lock_processes().insert(handle);
        Ok(())
    }

    fn checkpoint(&self, cancel: &watch::Receiver<bool>) -> PhoneResult<()> {
        if *cancel.borrow() {
            return Err(PhoneError::Aborted(self.id));
        }
        Ok(())
    }

    async fn settle(
        &self,
        services: &Services,
        cancel: &mut watch::Receiver<bool>,
    ) -> PhoneResult<()> {
        let delay = services.settings.stage_settle();
        if delay.is_zero() {
            return self.checkpoint(cancel);
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancelled(cancel) => Err(PhoneError::Aborted(self.id)),
        }
    }

    /// Stopping -> kill everything -> Stopped
    async fn teardown(&self, services: &Services) {
        if let Err(e) = self.transition(InstanceState::Stopping) {
            error!("Instance {}: {}", self.id, e);
        }
        self.release_processes(services).await;
        if let Err(e) = self.transition(InstanceState::Stopped) {
            error!("Instance {}: {}", self.id, e);
        }
        self.write_lifecycle().stopped_at = Some(Utc::now());
        info!("Instance '{}' stopped", self.name);
    }

    /// Kill every stage in reverse start order. Each handle kill is followed by
    /// a pattern kill for processes whose handle was lost.
    async fn release_processes(&self, services: &Services) {
        for kind in ProcessKind::TEARDOWN_ORDER {
            let handle = self.lock_processes().take(kind);
            if let Some(handle) = handle {
                if let Err(e) = services.launcher.kill(handle).await {
                    warn!("Instance {}: failed to kill {} process: {}", self.id, kind, e);
                }
            }

            let pattern = services.commands.pattern(kind, &self.ports);
            let swept = services.launcher.force_kill_matching(&pattern).await;
            if swept > 0 {
                warn!(
                    "Instance {}: force-killed {} leftover {} process(es)",
                    self.id, swept, kind
                );
            }
        }
    }

    fn transition(&self, next: InstanceState) -> PhoneResult<()> {
        let mut lifecycle = self.write_lifecycle();
        let from = lifecycle.state;
        if !from.can_transition_to(next) {
            return Err(PhoneError::InvalidTransition { from, to: next });
        }
        debug!("Instance {}: {} -> {}", self.id, from, next);
        lifecycle.state = next;
        lifecycle.last_error = None;
        Ok(())
    }

    fn fail(&self, stage: InstanceState, err: &PhoneError) {
        let mut lifecycle = self.write_lifecycle();
        if !lifecycle.state.can_transition_to(InstanceState::Failed) {
            error!(
                "Instance {}: cannot mark failed from {}",
                self.id, lifecycle.state
            );
            return;
        }
        lifecycle.state = InstanceState::Failed;
        lifecycle.stopped_at = Some(Utc::now());
        lifecycle.last_error = Some(LastError {
            stage,
            message: err.to_string(),
        });
    }

    fn read_lifecycle(&self) -> std::sync::RwLockReadGuard<'_, Lifecycle> {
        self.lifecycle.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lifecycle(&self) -> std::sync::RwLockWriteGuard<'_, Lifecycle> {
        self.lifecycle.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_processes(&self) -> MutexGuard<'_, ProcessSet> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bridge::{CommandRunner, SystemRunner};
    use crate::core::ports::PortLayout;
    use crate::core::process::{ProcessLauncher, ProcessPattern, ProcessSpec};
    use crate::core::provision::AvdProvisioner;
    use crate::core::settings::Settings;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    fn instance() -> Instance {
        Instance::new(
            0,
            "Phone 1".to_string(),
            PhoneConfig::default(),
            PortLayout::default().allocate(0),
        )
    }

    #[test]
    fn forward_chain_is_the_only_way_to_running() {
        use InstanceState::*;
        let chain = [
            Created,
            Provisioning,
            DisplayStarting,
            Booting,
            FramebufferStarting,
            BridgeStarting,
            Running,
        ];
        for pair in chain.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(!Created.can_transition_to(DisplayStarting));
        assert!(!Provisioning.can_transition_to(Booting));
        assert!(!Booting.can_transition_to(Running));
    }

    #[test]
    fn nothing_re_enters_created() {
        use InstanceState::*;
        for state in [
            Created,
            Provisioning,
            DisplayStarting,
            Booting,
            FramebufferStarting,
            BridgeStarting,
            Running,
            Stopping,
            Stopped,
            Failed,
        ] {
            assert!(!state.can_transition_to(Created));
        }
    }

    #[test]
    fn terminal_states_only_restart_or_stop() {
        use InstanceState::*;
        assert!(Stopped.can_transition_to(Provisioning));
        assert!(!Stopped.can_transition_to(Stopping));
        assert!(!Stopped.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Provisioning));
        assert!(Failed.can_transition_to(Stopping));
        assert!(!Failed.can_transition_to(Running));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(!Stopping.can_transition_to(Failed));
    }

    #[test]
    fn every_active_stage_can_stop_or_fail() {
        use InstanceState::*;
        for state in [
            Created,
            Provisioning,
            DisplayStarting,
            Booting,
            FramebufferStarting,
            BridgeStarting,
            Running,
        ] {
            assert!(state.can_transition_to(Stopping), "{}", state);
            assert!(state.can_transition_to(Failed), "{}", state);
        }
    }

    #[test]
    fn config_validation_clamps_cores() {
        let config = PhoneConfig {
            cpu_cores: 32,
            ..Default::default()
        };
        let config = config.validated(4).unwrap();
        assert_eq!(config.cpu_cores, 4);
    }

    #[test]
    fn config_validation_rejects_out_of_range_values() {
        let cases = [
            PhoneConfig {
                ram_mb: 128,
                ..Default::default()
            },
            PhoneConfig {
                screen_width: 10_000,
                ..Default::default()
            },
            PhoneConfig {
                platform_version: "ios-17".to_string(),
                ..Default::default()
            },
            PhoneConfig {
                platform_version: "android-19".to_string(),
                ..Default::default()
            },
            PhoneConfig {
                cpu_cores: 0,
                ..Default::default()
            },
        ];
        for config in cases {
            let err = config.clone().validated(8).unwrap_err();
            assert!(matches!(err, PhoneError::Validation(_)), "{:?}", config);
        }
    }

    #[test]
    fn fresh_instance_is_created_and_not_running() {
        let instance = instance();
        assert_eq!(instance.state(), InstanceState::Created);
        assert!(instance.live_processes().is_empty());
        assert!(matches!(
            instance.require_running(),
            Err(PhoneError::NotRunning {
                state: InstanceState::Created,
                ..
            })
        ));
    }

    #[test]
    fn restored_instance_keeps_identity_and_is_stopped() {
        let original = instance();
        let restored = Instance::restore(original.record());
        assert_eq!(restored.id(), original.id());
        assert_eq!(restored.ports(), original.ports());
        assert_eq!(restored.state(), InstanceState::Stopped);
    }

    /// Launcher for instances that never spawn anything
    struct NullLauncher;

    #[async_trait]
    impl ProcessLauncher for NullLauncher {
        async fn spawn(&self, spec: &ProcessSpec) -> PhoneResult<ProcessHandle> {
            Err(PhoneError::ProcessSpawn {
                kind: spec.kind,
                message: "spawning is disabled".to_string(),
            })
        }

        async fn kill(&self, _handle: ProcessHandle) -> PhoneResult<()> {
            Ok(())
        }

        async fn force_kill_matching(&self, _pattern: &ProcessPattern) -> usize {
            0
        }
    }

    fn idle_services() -> Services {
        let settings = Settings::default();
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        Services::new(
            settings.clone(),
            Arc::new(NullLauncher),
            Arc::new(AvdProvisioner::new(runner.clone(), &settings)),
            runner,
        )
    }

    #[tokio::test]
    async fn stop_of_stopped_instance_waits_for_a_start_holding_the_lock() {
        let instance = Arc::new(Instance::restore(instance().record()));
        let services = Arc::new(idle_services());

        // A start that has taken the lock but not yet left Stopped
        let guard = instance.op_lock.lock().await;
        let stopper = {
            let instance = instance.clone();
            let services = services.clone();
            tokio::spawn(async move { instance.stop(&services).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stopper.is_finished());
        assert!(*instance.cancel.borrow());

        // The start sees the flag at its first checkpoint
        let mut cancel = instance.cancel.subscribe();
        let err = instance.bring_up(&services, &mut cancel).await.unwrap_err();
        assert!(matches!(err, PhoneError::Aborted(_)));
        assert_eq!(instance.state(), InstanceState::Stopped);
        drop(guard);

        assert!(!stopper.await.unwrap().unwrap());
        assert!(!*instance.cancel.borrow());
        assert!(instance.live_processes().is_empty());
    }

    #[tokio::test]
    async fn stop_of_created_instance_tears_down_to_stopped() {
        let instance = instance();
        let services = idle_services();

        assert!(instance.stop(&services).await.unwrap());
        assert_eq!(instance.state(), InstanceState::Stopped);
        assert!(instance.live_processes().is_empty());
        assert!(instance.status().stopped_at.is_some());

        assert!(!instance.stop(&services).await.unwrap());
    }

    #[test]
    fn invalid_transition_is_reported() {
        let instance = instance();
        let err = instance.transition(InstanceState::Running).unwrap_err();
        assert!(matches!(err, PhoneError::InvalidTransition { .. }));
        assert_eq!(instance.state(), InstanceState::Created);
    }
}
