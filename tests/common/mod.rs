//! Shared fakes for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use openphone::core::{
    CommandOutput, CommandRunner, InstanceId, InstanceRegistry, InstanceState, PhoneConfig,
    PhoneError, PhoneResult, ProcessHandle, ProcessKind, ProcessLauncher, ProcessPattern,
    ProcessSpec, Provisioner, Services, Settings, SharedHostMonitor,
};
use openphone::persistence::Database;

/// Records spawns and kills instead of touching the OS
#[derive(Default)]
pub struct FakeLauncher {
    pub spawned: Mutex<Vec<ProcessSpec>>,
    pub killed: Mutex<Vec<ProcessKind>>,
    pub swept: Mutex<Vec<ProcessPattern>>,
    pub fail_on: Mutex<Option<ProcessKind>>,
    pub pause_on: Mutex<Option<ProcessKind>>,
    pub resume: Notify,
    next_pid: AtomicU32,
}

impl FakeLauncher {
    pub fn spawned_kinds(&self) -> Vec<ProcessKind> {
        self.spawned.lock().unwrap().iter().map(|s| s.kind).collect()
    }

    pub fn killed_kinds(&self) -> Vec<ProcessKind> {
        self.killed.lock().unwrap().clone()
    }

    pub fn fail_on(&self, kind: Option<ProcessKind>) {
        *self.fail_on.lock().unwrap() = kind;
    }

    /// Hold spawns of `kind` until `resume` is notified
    pub fn pause_on(&self, kind: Option<ProcessKind>) {
        *self.pause_on.lock().unwrap() = kind;
    }

    /// Spawned processes that were never killed
    pub fn leaked(&self) -> usize {
        self.spawned.lock().unwrap().len() - self.killed.lock().unwrap().len()
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn spawn(&self, spec: &ProcessSpec) -> PhoneResult<ProcessHandle> {
        let pause = *self.pause_on.lock().unwrap() == Some(spec.kind);
        if pause {
            self.resume.notified().await;
        }
        if *self.fail_on.lock().unwrap() == Some(spec.kind) {
            return Err(PhoneError::ProcessSpawn {
                kind: spec.kind,
                message: "simulated spawn failure".to_string(),
            });
        }
        self.spawned.lock().unwrap().push(spec.clone());
        // Far above any real PID so host lookups find nothing
        let pid = 3_000_000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(ProcessHandle::detached(spec.kind, Some(pid)))
    }

    async fn kill(&self, handle: ProcessHandle) -> PhoneResult<()> {
        self.killed.lock().unwrap().push(handle.kind());
        Ok(())
    }

    async fn force_kill_matching(&self, pattern: &ProcessPattern) -> usize {
        self.swept.lock().unwrap().push(pattern.clone());
        0
    }
}

/// Answers adb commands with canned output
pub struct FakeRunner {
    pub calls: Mutex<Vec<Vec<String>>>,
    pub booted: AtomicBool,
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            booted: AtomicBool::new(true),
        }
    }
}

impl FakeRunner {
    /// Recorded invocations other than boot probes
    pub fn device_calls(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|args| !args.iter().any(|a| a == "getprop"))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, _program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        self.calls.lock().unwrap().push(args.to_vec());

        let has = |word: &str| args.iter().any(|a| a == word);
        let stdout: Vec<u8> = if has("getprop") {
            if self.booted.load(Ordering::SeqCst) {
                b"1\n".to_vec()
            } else {
                b"\n".to_vec()
            }
        } else if has("screencap") {
            b"\x89PNG\r\n\x1a\nfake".to_vec()
        } else if has("cpuinfo") {
            b"Load: 1.0 / 1.0 / 1.0\n37% TOTAL: 30% user + 7% kernel\n".to_vec()
        } else if has("meminfo") {
            b" Total RAM: 4,194,304K (status normal)\n".to_vec()
        } else if has("df") {
            b"Filesystem 1K-blocks Used Available Use% Mounted on\n/dev/block/dm-5 1000 250 750 25% /data\n"
                .to_vec()
        } else {
            Vec::new()
        };

        Ok(CommandOutput {
            code: Some(0),
            stdout,
            stderr: Vec::new(),
        })
    }
}

/// Pretends every image already exists
#[derive(Default)]
pub struct FakeProvisioner {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
    /// Hold each call until `resume` is notified
    pub hold: AtomicBool,
    pub resume: Notify,
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn ensure_image(&self, slot: u32, _config: &PhoneConfig) -> PhoneResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hold.load(Ordering::SeqCst) {
            self.resume.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(PhoneError::Provisioning("no system image".to_string()));
        }
        Ok(format!("openphone_{}", slot))
    }
}

pub struct Harness {
    pub registry: Arc<InstanceRegistry>,
    pub launcher: Arc<FakeLauncher>,
    pub runner: Arc<FakeRunner>,
    pub provisioner: Arc<FakeProvisioner>,
    pub dir: TempDir,
}

/// Settings with no waiting between stages and fast boot probes
pub fn fast_settings(dir: &TempDir) -> Settings {
    Settings {
        data_directory: Some(dir.path().join("data")),
        avd_home: Some(dir.path().join("avd")),
        boot_initial_delay_ms: 0,
        boot_poll_interval_ms: 10,
        boot_timeout_secs: 30,
        stage_settle_ms: 0,
        kill_grace_ms: 10,
        ..Default::default()
    }
}

pub fn harness() -> Harness {
    harness_with(|_| {}, None)
}

pub fn harness_with(tweak: impl FnOnce(&mut Settings), database: Option<Arc<Database>>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = fast_settings(&dir);
    tweak(&mut settings);

    let launcher = Arc::new(FakeLauncher::default());
    let runner = Arc::new(FakeRunner::default());
    let provisioner = Arc::new(FakeProvisioner::default());
    let services = Services::new(
        settings,
        launcher.clone(),
        provisioner.clone(),
        runner.clone(),
    );

    let monitor = SharedHostMonitor::new();
    let registry = match database {
        Some(db) => InstanceRegistry::restore(services, monitor, db).unwrap(),
        None => InstanceRegistry::new(services, monitor),
    };

    Harness {
        registry: Arc::new(registry),
        launcher,
        runner,
        provisioner,
        dir,
    }
}

pub fn memory_database() -> Arc<Database> {
    let db = Database::open_in_memory().unwrap();
    db.initialize().unwrap();
    Arc::new(db)
}

/// Poll until the instance reaches `state`
pub async fn wait_for_state(registry: &InstanceRegistry, id: InstanceId, state: InstanceState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if registry.get_status(id).unwrap().state == state {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "instance never reached {}",
            state
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
