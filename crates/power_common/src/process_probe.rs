//! Process Probe - is a long-running operation already active?
//!
//! The boot scripts and the live updater run outside this daemon, and the
//! daemon may have restarted while they were running. The only reliable way
//! to know is to look at the process table and match command lines against
//! known signatures.
//!
//! The listing runs on the blocking pool under a deadline. A listing that
//! does not come back in time reads as "not running".

use crate::error::PowerError;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::System;
use tracing::{debug, warn};

/// Command-line fragment of any boot-action script run
pub const BOOT_ACTION_SIGNATURE: &str = "bootup_actions.sh";
/// Command-line fragment of the live update script
pub const LIVE_UPDATE_SIGNATURE: &str = "live_system_update";
/// Phrase the live updater puts on its chroot sub-update
pub const CHROOT_UPDATE_SIGNATURE: &str = "live update in chroot";

/// Every signature that means "the system is being updated".
pub const UPDATE_SIGNATURES: [&str; 3] = [
    BOOT_ACTION_SIGNATURE,
    LIVE_UPDATE_SIGNATURE,
    CHROOT_UPDATE_SIGNATURE,
];

/// Source of process command lines
pub trait ProcessTable: Send + Sync + 'static {
    /// One entry per live process: its full command line.
    fn command_lines(&self) -> Vec<String>;
}

/// Process table read through sysinfo
#[derive(Debug, Default)]
pub struct SysinfoProcessTable;

impl ProcessTable for SysinfoProcessTable {
    fn command_lines(&self) -> Vec<String> {
        let own_pid = std::process::id();
        let mut system = System::new();
        system.refresh_processes();

        system
            .processes()
            .iter()
            .filter(|(pid, _)| pid.as_u32() != own_pid)
            .map(|(_, process)| {
                let cmd = process.cmd();
                if cmd.is_empty() {
                    process.name().to_string()
                } else {
                    cmd.join(" ")
                }
            })
            .collect()
    }
}

/// Fixed process table for tests and dry runs
#[derive(Debug, Default)]
pub struct FakeProcessTable {
    lines: Mutex<Vec<String>>,
}

impl FakeProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lines(lines: &[&str]) -> Self {
        let table = Self::new();
        table.set(lines);
        table
    }

    pub fn set(&self, lines: &[&str]) {
        let mut guard = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        *guard = lines.iter().map(|s| s.to_string()).collect();
    }

    pub fn clear(&self) {
        self.set(&[]);
    }
}

impl ProcessTable for FakeProcessTable {
    fn command_lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Signature matcher over a [`ProcessTable`] with a deadline
#[derive(Clone)]
pub struct ProcessProbe {
    table: Arc<dyn ProcessTable>,
    timeout: Duration,
}

impl ProcessProbe {
    pub fn new(table: Arc<dyn ProcessTable>, timeout: Duration) -> Self {
        Self { table, timeout }
    }

    /// Whether any process command line contains `signature`.
    pub async fn is_running(&self, signature: &str) -> bool {
        self.first_running(&[signature]).await.is_some()
    }

    /// The first of `signatures` found in the process table, if any.
    ///
    /// Takes a single listing for all signatures.
    pub async fn first_running(&self, signatures: &[&str]) -> Option<String> {
        let lines = match self.list().await {
            Ok(lines) => lines,
            Err(e) => {
                warn!("process probe gave no answer, assuming nothing is running: {}", e);
                return None;
            }
        };

        signatures
            .iter()
            .find(|sig| lines.iter().any(|line| line.contains(**sig)))
            .map(|sig| {
                debug!("process probe: '{}' is running", sig);
                sig.to_string()
            })
    }

    async fn list(&self) -> Result<Vec<String>, PowerError> {
        let table = Arc::clone(&self.table);
        let listing = tokio::task::spawn_blocking(move || table.command_lines());

        match tokio::time::timeout(self.timeout, listing).await {
            Ok(Ok(lines)) => Ok(lines),
            Ok(Err(join_err)) => Err(PowerError::Command {
                program: "process listing".to_string(),
                message: join_err.to_string(),
            }),
            Err(_) => Err(PowerError::ProbeTimeout(self.timeout.as_millis() as u64)),
        }
    }
}
