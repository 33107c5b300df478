//! Power actions: shutdown, reboot, gateway restart.
//!
//! None of these are awaited. The request that triggers them gets its
//! answer while the command runs on its own.

use power_common::{CommandRunner, PowerError, SystemCommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub const GATEWAY_SERVICE: &str = "webthings-gateway.service";

#[derive(Clone)]
pub struct PowerControl {
    runner: Arc<dyn CommandRunner>,
}

impl PowerControl {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub fn shutdown(&self) -> Result<(), PowerError> {
        info!("Shutting down");
        self.runner
            .spawn_detached(&SystemCommand::privileged("shutdown").arg("now"))
    }

    pub fn reboot(&self) -> Result<(), PowerError> {
        info!("Rebooting");
        self.runner.spawn_detached(&SystemCommand::privileged("reboot"))
    }

    /// Restart the gateway service (and with it, this add-on)
    pub fn restart_gateway(&self) -> Result<(), PowerError> {
        info!("Restarting {}", GATEWAY_SERVICE);
        self.runner.spawn_detached(
            &SystemCommand::privileged("systemctl").args(["restart", GATEWAY_SERVICE]),
        )
    }

    /// Reboot after `delay`, without anyone waiting for it.
    pub fn schedule_reboot(&self, delay: Duration) -> JoinHandle<()> {
        info!("Reboot scheduled in {}s", delay.as_secs());
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = this.reboot() {
                error!("Scheduled reboot failed: {}", e);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use power_common::FakeCommandRunner;

    #[tokio::test]
    async fn test_power_actions_are_detached() {
        let fake = FakeCommandRunner::new();
        let power = PowerControl::new(Arc::new(fake.clone()));

        power.shutdown().unwrap();
        power.restart_gateway().unwrap();

        assert!(fake.calls().is_empty());
        assert!(fake.ran("shutdown", &["now"]));
        assert!(fake.ran("systemctl", &["restart", GATEWAY_SERVICE]));
        assert!(fake.detached().iter().all(|c| c.privileged));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_reboot_waits_for_grace() {
        let fake = FakeCommandRunner::new();
        let power = PowerControl::new(Arc::new(fake.clone()));

        let handle = power.schedule_reboot(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!fake.ran("reboot", &[]));

        handle.await.unwrap();
        assert!(fake.ran("reboot", &[]));
    }
}
