//! Update Orchestrator - reboot updates, live updates, and the other
//! boot-action operations (factory reset, manual update).
//!
//! An update attempt goes Idle -> Staging -> Running -> Succeeded | Failed.
//! Staging takes the lease and fetches the script; nothing touches the boot
//! partition until the fetch has succeeded. Running either arms the boot
//! action and reboots, or launches the live script detached.

use crate::power::PowerControl;
use crate::registry::{Lease, OperationRegistry};
use async_trait::async_trait;
use power_common::markers::remove_if_present;
use power_common::{CommandRunner, Layout, Marker, Operation, Outcome, PowerError, SystemCommand};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Kernel command line fragment of the raspi-config overlay
const OLD_OVERLAY_FLAG: &str = "boot=overlay";

/// Downloads an update script
#[async_trait]
pub trait ScriptFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, PowerError>;
}

/// Fetches scripts over HTTPS
pub struct HttpScriptFetcher {
    client: reqwest::Client,
}

impl HttpScriptFetcher {
    pub fn new(timeout: Duration) -> Result<Self, PowerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PowerError::FetchFailure(format!("could not build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ScriptFetcher for HttpScriptFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, PowerError> {
        info!("Fetching {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PowerError::FetchFailure(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(PowerError::FetchFailure(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| PowerError::FetchFailure(format!("failed to read body: {}", e)))?;
        if body.is_empty() {
            return Err(PowerError::FetchFailure(format!("empty script from {}", url)));
        }
        Ok(body.to_vec())
    }
}

/// Serves a canned script, or fails, and records what was asked for
#[derive(Debug, Default, Clone)]
pub struct FakeScriptFetcher {
    body: Arc<Mutex<Option<Vec<u8>>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeScriptFetcher {
    pub fn serving(body: &[u8]) -> Self {
        let fetcher = Self::default();
        fetcher.serve(Some(body));
        fetcher
    }

    pub fn failing() -> Self {
        Self::default()
    }

    /// `None` makes every fetch fail
    pub fn serve(&self, body: Option<&[u8]>) {
        *self.body.lock().unwrap_or_else(|e| e.into_inner()) = body.map(<[u8]>::to_vec);
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ScriptFetcher for FakeScriptFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, PowerError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(url.to_string());
        self.body
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| PowerError::FetchFailure(format!("no route to {}", url)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    Idle,
    Staging,
    Running,
    Succeeded,
    Failed,
}

/// Body of `start_system_update`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateRequest {
    /// `Some(true)` sets the cutting-edge marker, `Some(false)` clears it
    #[serde(default)]
    pub cutting_edge: Option<bool>,
    #[serde(default)]
    pub live_update: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub state: bool,
    pub live_update: bool,
    pub phase: UpdatePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One update attempt, logging every phase change
struct Attempt {
    op: Operation,
    phase: UpdatePhase,
}

impl Attempt {
    fn new(op: Operation) -> Self {
        Self {
            op,
            phase: UpdatePhase::Idle,
        }
    }

    fn advance(&mut self, phase: UpdatePhase) {
        debug!("{}: {:?} -> {:?}", self.op, self.phase, phase);
        self.phase = phase;
    }

    fn report(mut self, reason: Option<String>) -> UpdateReport {
        let state = reason.is_none();
        self.advance(if state {
            UpdatePhase::Succeeded
        } else {
            UpdatePhase::Failed
        });
        UpdateReport {
            state,
            live_update: self.op == Operation::LiveUpdate,
            phase: self.phase,
            reason,
        }
    }
}

/// Where the update scripts come from
#[derive(Debug, Clone)]
pub struct UpdateSources {
    pub system_update_url: String,
    pub live_update_url: String,
}

#[derive(Clone)]
pub struct UpdateOrchestrator {
    registry: OperationRegistry,
    runner: Arc<dyn CommandRunner>,
    fetcher: Arc<dyn ScriptFetcher>,
    layout: Layout,
    sources: UpdateSources,
    power: PowerControl,
    reboot_grace: Duration,
}

impl UpdateOrchestrator {
    pub fn new(
        registry: OperationRegistry,
        runner: Arc<dyn CommandRunner>,
        fetcher: Arc<dyn ScriptFetcher>,
        layout: Layout,
        sources: UpdateSources,
        reboot_grace: Duration,
    ) -> Self {
        let power = PowerControl::new(Arc::clone(&runner));
        Self {
            registry,
            runner,
            fetcher,
            layout,
            sources,
            power,
            reboot_grace,
        }
    }

    /// Fetch and start a system update.
    ///
    /// Busy and fetch failures come back as a report with `state: false`;
    /// anything else is an error.
    pub async fn start_system_update(
        &self,
        request: UpdateRequest,
    ) -> Result<UpdateReport, PowerError> {
        let op = if request.live_update {
            Operation::LiveUpdate
        } else {
            Operation::RebootUpdate
        };
        let mut attempt = Attempt::new(op);
        attempt.advance(UpdatePhase::Staging);

        let mut lease = match self.registry.try_begin(op).await {
            Ok(lease) => lease,
            Err(reason) => {
                info!("{} refused: {}", op, reason);
                return Ok(attempt.report(Some(reason.to_string())));
            }
        };

        let (url, script) = match op {
            Operation::LiveUpdate => (
                &self.sources.live_update_url,
                self.layout.live_update_script(),
            ),
            _ => (
                &self.sources.system_update_url,
                self.layout.system_update_script(),
            ),
        };

        if let Err(e) = self.fetch_script(url, &script).await {
            self.registry.complete(lease, Outcome::failed(e.to_string()))?;
            return match e {
                PowerError::FetchFailure(reason) => Ok(attempt.report(Some(reason))),
                other => Err(other),
            };
        }

        let staged = match request.cutting_edge {
            Some(true) => self.registry.stage_marker(&mut lease, Marker::CuttingEdge),
            Some(false) => self.registry.clear_marker(&mut lease, Marker::CuttingEdge),
            None => Ok(()),
        };
        if let Err(e) = staged {
            return self.registry.settle(lease, Err(e));
        }

        attempt.advance(UpdatePhase::Running);
        let result = match op {
            Operation::LiveUpdate => self.launch_live_update(&mut lease, &script),
            _ => self.arm_reboot_update(&mut lease, &script).await,
        };
        self.registry.settle(lease, result)?;

        if op == Operation::RebootUpdate {
            self.power.schedule_reboot(self.reboot_grace);
        }
        Ok(attempt.report(None))
    }

    async fn fetch_script(&self, url: &str, dest: &Path) -> Result<(), PowerError> {
        remove_if_present(dest)?;
        let body = self.fetcher.fetch(url).await?;
        write_file(dest, &body)?;
        info!("Fetched {} ({} bytes)", dest.display(), body.len());
        Ok(())
    }

    async fn arm_reboot_update(&self, lease: &mut Lease, script: &Path) -> Result<(), PowerError> {
        self.registry.stage_boot_action(lease, script)?;
        remove_if_present(script)?;

        if self.old_overlay_active() {
            info!("Disabling the old raspi-config overlay");
            for step in ["disable_bootro", "disable_overlayfs"] {
                self.run_checked(
                    SystemCommand::privileged("raspi-config").args(["nonint", step]),
                )
                .await?;
            }
        }

        self.registry.stage_marker(lease, Marker::ReadWriteOnce)
    }

    fn launch_live_update(&self, lease: &mut Lease, script: &Path) -> Result<(), PowerError> {
        let cmd = SystemCommand::privileged("bash")
            .arg(script.to_string_lossy())
            .env("REBOOT_WHEN_DONE", "yes");
        self.runner.spawn_detached(&cmd)?;
        lease.mark_launched();
        info!("Live update launched");
        Ok(())
    }

    /// Arm a factory reset for the next boot.
    pub async fn factory_reset(&self, keep_z2m: bool, keep_bluetooth: bool) -> Result<(), PowerError> {
        let mut lease = self.registry.try_begin(Operation::FactoryReset).await?;
        let result = self.stage_factory_reset(&mut lease, keep_z2m, keep_bluetooth);
        self.registry.settle(lease, result)
    }

    fn stage_factory_reset(
        &self,
        lease: &mut Lease,
        keep_z2m: bool,
        keep_bluetooth: bool,
    ) -> Result<(), PowerError> {
        for (marker, keep) in [(Marker::KeepZ2m, keep_z2m), (Marker::KeepBluetooth, keep_bluetooth)] {
            if keep {
                self.registry.stage_marker(lease, marker)?;
            } else {
                self.registry.clear_marker(lease, marker)?;
            }
        }
        self.registry
            .stage_boot_action(lease, &self.layout.factory_reset_script())
    }

    /// Arm the bundled manual update for the next boot.
    pub async fn manual_update(&self) -> Result<(), PowerError> {
        let mut lease = self.registry.try_begin(Operation::ManualUpdate).await?;
        let result = self
            .registry
            .stage_marker(&mut lease, Marker::ReadWriteOnce)
            .and_then(|()| {
                self.registry
                    .stage_boot_action(&mut lease, &self.layout.manual_update_script())
            });
        self.registry.settle(lease, result)
    }

    pub fn old_overlay_active(&self) -> bool {
        old_overlay_active(&self.layout.cmdline_file())
    }

    async fn run_checked(&self, cmd: SystemCommand) -> Result<(), PowerError> {
        let output = self.runner.run(&cmd).await?;
        if output.success() {
            return Ok(());
        }
        warn!("{} exited {}", cmd.display(), output.exit_code);
        Err(PowerError::Command {
            program: cmd.program,
            message: format!("exit code {}: {}", output.exit_code, output.stderr.trim()),
        })
    }
}

/// Whether the kernel command line enables the raspi-config overlay
pub fn old_overlay_active(cmdline: &Path) -> bool {
    fs::read_to_string(cmdline)
        .map(|line| line.contains(OLD_OVERLAY_FLAG))
        .unwrap_or(false)
}

fn write_file(dest: &Path, body: &[u8]) -> Result<(), PowerError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| PowerError::io(parent, e))?;
    }
    let mut file = fs::File::create(dest).map_err(|e| PowerError::io(dest, e))?;
    file.write_all(body).map_err(|e| PowerError::io(dest, e))?;
    file.sync_all().map_err(|e| PowerError::io(dest, e))
}
