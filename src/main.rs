//! OpenPhone - Run multiple isolated Android phones on one host
//!
//! Usage: `openphone [COUNT]`. Restores the phones from the previous run,
//! tops them up to COUNT, starts them and keeps them up until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use single_instance::SingleInstance;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use openphone::core::{
    AvdProvisioner, InstanceId, InstanceRegistry, PhoneConfig, PhoneResult, Services,
    SharedHostMonitor, SystemLauncher, SystemRunner,
};
use openphone::persistence::Database;
use openphone::{APP_NAME, APP_VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    let count = parse_count()?;

    // Initialize database first so the log level can come from settings
    let db = Database::new()?;
    db.initialize()?;
    let settings = db.load_settings()?.unwrap_or_default();
    init_logging(settings.debug_logging);

    info!("{} v{} starting...", APP_NAME, APP_VERSION);

    // Two orchestrators on one host would fight over the same ports
    let lock = SingleInstance::new(APP_NAME).context("Failed to create single instance lock")?;
    if !lock.is_single() {
        error!("Another instance of {} is already running!", APP_NAME);
        anyhow::bail!("{} is already running", APP_NAME);
    }

    // Persist defaults on first run so they can be edited
    db.save_settings(&settings)?;
    std::fs::create_dir_all(settings.get_data_directory())?;

    let monitor = SharedHostMonitor::new();
    let runner = Arc::new(SystemRunner);
    let services = Services::new(
        settings.clone(),
        Arc::new(SystemLauncher::new(settings.kill_grace(), monitor.clone())),
        Arc::new(AvdProvisioner::new(runner.clone(), &settings)),
        runner,
    );
    let registry = Arc::new(InstanceRegistry::restore(services, monitor, Arc::new(db))?);

    match registry.cleanup_history() {
        Ok(removed) if removed > 0 => info!("Pruned {} old history event(s)", removed),
        Ok(_) => {}
        Err(e) => warn!("History cleanup failed: {}", e),
    }

    let swept = registry.sweep_orphans().await;
    if swept > 0 {
        info!("Cleaned up {} process(es) from a previous run", swept);
    }

    let existing = registry.list_instances().len();
    for _ in existing..count {
        registry.create_instance(None, PhoneConfig::default())?;
    }

    // Ctrl-C is honoured while phones are still starting
    let mut starts = spawn_starts(&registry);
    let interrupted = tokio::select! {
        _ = report_starts(&registry, &mut starts) => false,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            true
        }
    };

    if interrupted {
        info!("Interrupted during startup");
    } else {
        info!("{} running, press Ctrl-C to stop", APP_NAME);
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
    }

    info!("Shutting down...");
    // No start may begin after stop_all; half-started phones are torn down by it
    starts.abort_all();
    while starts.join_next().await.is_some() {}
    registry.stop_all().await;
    info!("{} shut down", APP_NAME);
    Ok(())
}

/// Optional first argument: number of phones to keep
fn parse_count() -> Result<usize> {
    match std::env::args().nth(1) {
        Some(arg) => arg
            .parse()
            .with_context(|| format!("COUNT must be a number, got '{}'", arg)),
        None => Ok(1),
    }
}

type StartResult = (InstanceId, PhoneResult<()>);

/// Start every idle phone concurrently
fn spawn_starts(registry: &Arc<InstanceRegistry>) -> JoinSet<StartResult> {
    let mut tasks = JoinSet::new();
    for status in registry.list_instances() {
        if status.is_running() {
            continue;
        }
        let registry = Arc::clone(registry);
        tasks.spawn(async move { (status.id, registry.start(status.id).await) });
    }
    tasks
}

/// Wait for the starts and print where to reach each phone
async fn report_starts(registry: &InstanceRegistry, tasks: &mut JoinSet<StartResult>) {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((id, Ok(()))) => {
                if let Ok(status) = registry.get_status(id) {
                    info!(
                        "'{}' ready at {}",
                        status.name,
                        status.ports.vnc_url(&registry.settings().public_host)
                    );
                }
            }
            Ok((id, Err(e))) => warn!("Instance {} did not start: {}", id, e),
            Err(e) => error!("Start task panicked: {}", e),
        }
    }
}

/// Initialize the logging system
fn init_logging(debug: bool) {
    let default_filter = if debug {
        "openphone=debug"
    } else {
        "openphone=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
