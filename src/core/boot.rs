//! Boot monitoring - Wait for the guest to report boot completion

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, trace};

use super::bridge::DeviceBridge;
use super::settings::Settings;

/// Stand-in deadline for ceilings too large to add to the clock
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// How a boot wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    /// The guest reported `sys.boot_completed=1`
    Completed(Duration),
    /// The ceiling elapsed first; the guest is assumed ready
    TimedOut(Duration),
    /// A stop was requested while waiting
    Cancelled,
}

/// Polls the device bridge until the guest has booted
#[derive(Debug, Clone)]
pub struct BootMonitor {
    initial_delay: Duration,
    interval: Duration,
    ceiling: Duration,
}

impl BootMonitor {
    pub fn new(initial_delay: Duration, interval: Duration, ceiling: Duration) -> Self {
        Self {
            initial_delay,
            interval,
            ceiling,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.boot_initial_delay(),
            settings.boot_poll_interval(),
            settings.boot_timeout(),
        )
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Poll `serial` until boot completes, the ceiling elapses, or `cancel`
    /// becomes true.
    pub async fn wait(
        &self,
        bridge: &DeviceBridge,
        serial: &str,
        cancel: &mut watch::Receiver<bool>,
    ) -> BootOutcome {
        let started = Instant::now();
        let deadline = started
            .checked_add(self.ceiling)
            .unwrap_or_else(|| started + FAR_FUTURE);
        let mut delay = self.initial_delay;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return BootOutcome::TimedOut(started.elapsed());
            }

            tokio::select! {
                _ = sleep(delay.min(deadline - now)) => {}
                _ = cancelled(cancel) => return BootOutcome::Cancelled,
            }

            tokio::select! {
                probe = timeout_at(deadline, bridge.boot_completed(serial)) => match probe {
                    Ok(Ok(true)) => return BootOutcome::Completed(started.elapsed()),
                    Ok(Ok(false)) => trace!("{} still booting", serial),
                    Ok(Err(e)) => debug!("Boot probe for {} failed: {}", serial, e),
                    Err(_) => {}
                },
                _ = cancelled(cancel) => return BootOutcome::Cancelled,
            }

            delay = self.interval;
        }
    }
}

/// Resolves once the cancellation flag is true
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|flag| *flag).await.is_err() {
        // Sender gone: nobody can cancel any more
        std::future::pending::<()>().await;
    }
}
