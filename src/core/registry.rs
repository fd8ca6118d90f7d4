//! Instance registry - Creates phones, hands out ports and routes operations

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::bridge::{DeviceMetrics, ScreenshotRef};
use super::error::{PhoneError, PhoneResult};
use super::instance::{Instance, InstanceId, InstanceStatus, PhoneConfig};
use super::monitor::SharedHostMonitor;
use super::ports::PortAssignment;
use super::process::ProcessKind;
use super::services::Services;
use super::settings::Settings;
use crate::persistence::{Database, InstanceEvent};

struct RegistryInner {
    /// Insertion order is listing order
    instances: Vec<Arc<Instance>>,
    /// Next slot to hand out; never decreases
    next_slot: u32,
}

/// Owns every managed phone
pub struct InstanceRegistry {
    services: Arc<Services>,
    monitor: SharedHostMonitor,
    database: Option<Arc<Database>>,
    inner: Mutex<RegistryInner>,
    /// Host-safe maximum of emulator cores
    cpu_cap: u32,
    max_instances: u32,
}

impl InstanceRegistry {
    /// Empty registry without persistence
    pub fn new(services: Services, monitor: SharedHostMonitor) -> Self {
        Self::build(services, monitor, None, Vec::new(), 0)
    }

    /// Registry backed by `database`; stored instances come back Stopped
    pub fn restore(
        services: Services,
        monitor: SharedHostMonitor,
        database: Arc<Database>,
    ) -> PhoneResult<Self> {
        let records = database.load_instances().map_err(storage_error)?;
        let stored_slot = database.load_next_slot().map_err(storage_error)?;
        let next_slot = records
            .iter()
            .map(|r| r.slot + 1)
            .max()
            .unwrap_or(0)
            .max(stored_slot);

        let instances: Vec<Arc<Instance>> = records
            .into_iter()
            .map(|record| Arc::new(Instance::restore(record)))
            .collect();
        info!(
            "Restored {} instance(s), next slot {}",
            instances.len(),
            next_slot
        );

        Ok(Self::build(
            services,
            monitor,
            Some(database),
            instances,
            next_slot,
        ))
    }

    fn build(
        services: Services,
        monitor: SharedHostMonitor,
        database: Option<Arc<Database>>,
        instances: Vec<Arc<Instance>>,
        next_slot: u32,
    ) -> Self {
        let host_cores = u32::try_from(monitor.cpu_count()).unwrap_or(u32::MAX);
        let cpu_cap = services.settings.max_cpu_cores.min(host_cores).max(1);
        let max_instances = services.settings.effective_max_instances();
        debug!(
            "Registry limits: {} instance(s), {} core(s) per phone",
            max_instances, cpu_cap
        );

        Self {
            services: Arc::new(services),
            monitor,
            database,
            inner: Mutex::new(RegistryInner {
                instances,
                next_slot,
            }),
            cpu_cap,
            max_instances,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.services.settings
    }

    /// Register a new phone. Nothing is started.
    pub fn create_instance(
        &self,
        name: Option<String>,
        config: PhoneConfig,
    ) -> PhoneResult<InstanceId> {
        let config = config.validated(self.cpu_cap)?;

        let mut inner = self.lock_inner();
        let slot = inner.next_slot;
        if slot >= self.max_instances {
            return Err(PhoneError::Validation(format!(
                "instance limit of {} reached",
                self.max_instances
            )));
        }

        let ports = self.services.settings.port_layout.allocate(slot);
        check_conflicts(&inner.instances, &ports)?;

        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("Phone {}", slot + 1));
        let instance = Arc::new(Instance::new(slot, name, config, ports));

        if let Some(db) = &self.database {
            db.save_instance(&instance.record()).map_err(storage_error)?;
            db.save_next_slot(slot + 1).map_err(storage_error)?;
        }
        inner.next_slot = slot + 1;
        inner.instances.push(Arc::clone(&instance));
        drop(inner);

        let id = instance.id();
        info!(
            "Created instance '{}' ({}) in slot {}: control port {}, display {}",
            instance.name(),
            id,
            slot,
            ports.control_port,
            ports.display_name()
        );
        self.record_event(id, "created", None);
        Ok(id)
    }

    pub fn list_instances(&self) -> Vec<InstanceStatus> {
        self.lock_inner()
            .instances
            .iter()
            .map(|i| i.status())
            .collect()
    }

    pub fn get_status(&self, id: InstanceId) -> PhoneResult<InstanceStatus> {
        Ok(self.get(id)?.status())
    }

    pub async fn start(&self, id: InstanceId) -> PhoneResult<()> {
        let instance = self.get(id)?;
        let result = instance.start(&self.services).await;
        if instance.is_retired() {
            // Deleted meanwhile; its history is gone with it
            return result;
        }
        match &result {
            Ok(()) => self.record_event(id, "started", None),
            Err(PhoneError::Busy { .. } | PhoneError::NotFound(_)) => {}
            Err(PhoneError::Aborted(_)) => self.record_event(id, "aborted", None),
            Err(e) => self.record_event(id, "failed", Some(e.to_string().as_str())),
        }
        result
    }

    pub async fn stop(&self, id: InstanceId) -> PhoneResult<()> {
        let instance = self.get(id)?;
        if instance.stop(&self.services).await? && !instance.is_retired() {
            self.record_event(id, "stopped", None);
        }
        Ok(())
    }

    /// Stop then start
    pub async fn restart(&self, id: InstanceId) -> PhoneResult<()> {
        info!("Restarting instance {}", id);
        self.stop(id).await?;
        self.start(id).await
    }

    /// Stop the instance if needed, then forget it along with its history.
    /// Its slot is not reused.
    pub async fn delete_instance(&self, id: InstanceId) -> PhoneResult<()> {
        let instance = self.get(id)?;
        instance.retire();
        instance.stop(&self.services).await?;

        {
            let mut inner = self.lock_inner();
            let before = inner.instances.len();
            inner.instances.retain(|i| i.id() != id);
            if inner.instances.len() == before {
                // A concurrent delete got here first
                return Err(PhoneError::NotFound(id));
            }
        }

        if let Some(db) = &self.database {
            db.delete_instance(id).map_err(storage_error)?;
        }
        info!("Deleted instance '{}' ({})", instance.name(), id);
        Ok(())
    }

    pub async fn send_text(&self, id: InstanceId, text: &str) -> PhoneResult<()> {
        let instance = self.get(id)?;
        self.services.bridge.send_text(&instance, text).await
    }

    pub async fn send_tap(&self, id: InstanceId, x: u32, y: u32) -> PhoneResult<()> {
        let instance = self.get(id)?;
        self.services.bridge.send_tap(&instance, x, y).await
    }

    pub async fn send_key(&self, id: InstanceId, keycode: u32) -> PhoneResult<()> {
        let instance = self.get(id)?;
        self.services.bridge.send_key(&instance, keycode).await
    }

    pub async fn screenshot(&self, id: InstanceId) -> PhoneResult<ScreenshotRef> {
        let instance = self.get(id)?;
        self.services.bridge.screenshot(&instance).await
    }

    /// Guest metrics plus host usage of the emulator process
    pub async fn metrics(&self, id: InstanceId) -> PhoneResult<DeviceMetrics> {
        let instance = self.get(id)?;
        let mut metrics = self.services.bridge.metrics(&instance).await?;

        if let Some(pid) = instance.emulator_pid() {
            let monitor = self.monitor.clone();
            metrics.host = tokio::task::spawn_blocking(move || monitor.process_usage(pid))
                .await
                .unwrap_or_else(|e| {
                    warn!("Host usage probe failed: {}", e);
                    None
                });
        }
        Ok(metrics)
    }

    pub async fn push_file(
        &self,
        id: InstanceId,
        local_path: &Path,
        file_name: &str,
    ) -> PhoneResult<String> {
        let instance = self.get(id)?;
        self.services
            .bridge
            .push_file(&instance, local_path, file_name)
            .await
    }

    /// Lifecycle events of an instance, newest first. Empty without a database.
    pub fn history(&self, id: InstanceId) -> PhoneResult<Vec<InstanceEvent>> {
        match &self.database {
            Some(db) => db.get_instance_history(id).map_err(storage_error),
            None => Ok(Vec::new()),
        }
    }

    /// Apply the configured history retention. Returns the number of events
    /// removed.
    pub fn cleanup_history(&self) -> PhoneResult<usize> {
        match &self.database {
            Some(db) => db
                .cleanup_history(self.services.settings.history_retention_days)
                .map_err(storage_error),
            None => Ok(0),
        }
    }

    /// Stop every instance concurrently
    pub async fn stop_all(&self) {
        let instances = self.lock_inner().instances.clone();
        info!("Stopping {} instance(s)", instances.len());

        let mut tasks = JoinSet::new();
        for instance in instances {
            let services = Arc::clone(&self.services);
            tasks.spawn(async move {
                let id = instance.id();
                (id, instance.stop(&services).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(true))) => self.record_event(id, "stopped", None),
                Ok((_, Ok(false))) => {}
                Ok((id, Err(e))) => error!("Failed to stop instance {}: {}", id, e),
                Err(e) => error!("Stop task panicked: {}", e),
            }
        }
    }

    /// Kill leftover stage processes of idle instances, e.g. from a previous
    /// orchestrator run. Returns how many processes were killed.
    pub async fn sweep_orphans(&self) -> usize {
        let idle: Vec<PortAssignment> = self
            .lock_inner()
            .instances
            .iter()
            .filter(|i| !i.state().may_hold_processes() && !i.state().is_transitional())
            .map(|i| *i.ports())
            .collect();

        let mut killed = 0;
        for ports in idle {
            for kind in ProcessKind::TEARDOWN_ORDER {
                let pattern = self.services.commands.pattern(kind, &ports);
                killed += self.services.launcher.force_kill_matching(&pattern).await;
            }
        }
        if killed > 0 {
            warn!("Killed {} orphaned process(es)", killed);
        }
        killed
    }

    fn get(&self, id: InstanceId) -> PhoneResult<Arc<Instance>> {
        self.lock_inner()
            .instances
            .iter()
            .find(|i| i.id() == id)
            .cloned()
            .ok_or(PhoneError::NotFound(id))
    }

    fn record_event(&self, id: InstanceId, event: &str, details: Option<&str>) {
        if let Some(db) = &self.database {
            if let Err(e) = db.record_instance_event(id, event, details) {
                warn!("Failed to record '{}' event for {}: {}", event, id, e);
            }
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn check_conflicts(instances: &[Arc<Instance>], ports: &PortAssignment) -> PhoneResult<()> {
    for other in instances {
        let held = other.ports();
        let clash = if held.control_port == ports.control_port {
            Some(("control port", u32::from(ports.control_port)))
        } else if held.framebuffer_port == ports.framebuffer_port {
            Some(("framebuffer port", u32::from(ports.framebuffer_port)))
        } else if held.bridge_port == ports.bridge_port {
            Some(("bridge port", u32::from(ports.bridge_port)))
        } else if held.display_number == ports.display_number {
            Some(("display", ports.display_number))
        } else {
            None
        };
        if let Some((resource, value)) = clash {
            return Err(PhoneError::PortConflict {
                resource,
                value,
                holder: other.id(),
            });
        }
    }
    Ok(())
}

fn storage_error(e: anyhow::Error) -> PhoneError {
    PhoneError::Persistence(format!("{:#}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ports::PortLayout;

    fn instance_at(slot: u32) -> Arc<Instance> {
        Arc::new(Instance::new(
            slot,
            format!("Phone {}", slot + 1),
            PhoneConfig::default(),
            PortLayout::default().allocate(slot),
        ))
    }

    #[test]
    fn conflicts_name_the_clashing_resource() {
        let existing = vec![instance_at(0), instance_at(1)];
        assert!(check_conflicts(&existing, &PortLayout::default().allocate(2)).is_ok());

        let mut ports = PortLayout::default().allocate(2);
        ports.display_number = 100;
        match check_conflicts(&existing, &ports) {
            Err(PhoneError::PortConflict {
                resource, holder, ..
            }) => {
                assert_eq!(resource, "display");
                assert_eq!(holder, existing[1].id());
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }
}
