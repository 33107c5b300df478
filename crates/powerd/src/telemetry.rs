//! Telemetry - memory, supply voltage, kernel log lines, files check
//!
//! Rules:
//! - Read-only; nothing here touches markers or leases
//! - An unavailable source degrades to a default, never an error
//! - "Low voltage ever observed" is latched in the registry once seen

use crate::registry::OperationRegistry;
use power_common::{CommandRunner, SystemCommand, VoltageState};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::System;
use tracing::{debug, warn};

const VCGENCMD_PATHS: [&str; 2] = ["/usr/bin/vcgencmd", "/opt/vc/bin/vcgencmd"];

/// Tag the boot scripts put on their kernel log lines
const DMESG_TAG: &str = "Candle";

const LIVE_UPDATE_START: &str = "starting live update";

pub const FILES_CHECK_UNSUPPORTED: &str = "Not supported by this older Candle version.";

/// Memory figures in MB
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub total_memory: u64,
    pub available_memory: u64,
    pub free_memory: u64,
}

#[derive(Clone)]
pub struct Telemetry {
    runner: Arc<dyn CommandRunner>,
    registry: OperationRegistry,
    files_check_script: PathBuf,
}

impl Telemetry {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        registry: OperationRegistry,
        files_check_script: PathBuf,
    ) -> Self {
        Self {
            runner,
            registry,
            files_check_script,
        }
    }

    pub fn memory(&self) -> MemoryStats {
        let mut sys = System::new();
        sys.refresh_memory();
        MemoryStats {
            total_memory: sys.total_memory() / 1_000_000,
            available_memory: sys.available_memory() / 1_000_000,
            free_memory: sys.free_memory() / 1_000_000,
        }
    }

    /// Current throttle flags, with "ever observed" latched.
    pub async fn voltage(&self) -> VoltageState {
        let reading = self.read_throttled().await.unwrap_or_default();
        self.registry.observe_voltage(reading)
    }

    async fn read_throttled(&self) -> Option<VoltageState> {
        let program = vcgencmd_path(&VCGENCMD_PATHS);
        let output = match self
            .runner
            .run(&SystemCommand::new(program).arg("get_throttled"))
            .await
        {
            Ok(output) if output.success() => output,
            Ok(output) => {
                debug!("vcgencmd exited {}", output.exit_code);
                return None;
            }
            Err(e) => {
                debug!("vcgencmd unavailable: {}", e);
                return None;
            }
        };

        let state = VoltageState::parse(&output.stdout);
        match state {
            Some(state) if state.any() => warn!("Low voltage flags: {}", output.stdout.trim()),
            Some(_) => {}
            None => warn!("Unexpected vcgencmd output: '{}'", output.stdout.trim()),
        }
        state
    }

    /// Kernel warnings and errors from the boot scripts
    pub async fn poll_dmesg(&self) -> String {
        let cmd = SystemCommand::new("dmesg").arg("--level=err,warn");
        match self.runner.run(&cmd).await {
            Ok(output) => filter_candle_lines(&output.stdout),
            Err(e) => {
                warn!("dmesg unavailable: {}", e);
                String::new()
            }
        }
    }

    pub fn files_check_exists(&self) -> bool {
        self.files_check_script.is_file()
    }

    pub async fn files_check(&self) -> String {
        if !self.files_check_exists() {
            return FILES_CHECK_UNSUPPORTED.to_string();
        }
        let cmd = SystemCommand::new(self.files_check_script.to_string_lossy());
        match self.runner.run(&cmd).await {
            Ok(output) => output.stdout,
            Err(e) => {
                warn!("files check failed: {}", e);
                format!("Files check failed: {}", e)
            }
        }
    }
}

/// First vcgencmd found on disk, else the first candidate
fn vcgencmd_path(candidates: &[&str]) -> String {
    candidates
        .iter()
        .find(|p| Path::new(p).is_file())
        .or_else(|| candidates.first())
        .map(|p| p.to_string())
        .unwrap_or_else(|| "vcgencmd".to_string())
}

/// Keep the tagged lines of `dmesg` output.
///
/// A live update start drops everything before it. Other lines lose the
/// timestamp up to its `]` and the `Candle:` prefix.
pub fn filter_candle_lines(output: &str) -> String {
    let mut collected = String::new();
    for line in output.lines().filter(|l| l.contains(DMESG_TAG)) {
        if line.contains(LIVE_UPDATE_START) {
            collected.clear();
            collected.push_str(LIVE_UPDATE_START);
        } else {
            let from_bracket = line.find(']').map(|i| &line[i..]).unwrap_or(line);
            collected.push_str(&from_bracket.replace("Candle:", ""));
        }
        collected.push('\n');
    }
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use power_common::{CommandOutput, FakeCommandRunner, FakeProcessTable, MarkerStore, ProcessProbe};
    use std::time::Duration;
    use tempfile::TempDir;

    fn telemetry(dir: &TempDir) -> (Telemetry, FakeCommandRunner) {
        let probe = ProcessProbe::new(Arc::new(FakeProcessTable::new()), Duration::from_secs(1));
        let registry = OperationRegistry::new(MarkerStore::new(dir.path()), probe);
        let runner = FakeCommandRunner::new();
        let telemetry = Telemetry::new(
            Arc::new(runner.clone()),
            registry,
            dir.path().join("files_check.sh"),
        );
        (telemetry, runner)
    }

    #[test]
    fn test_filter_candle_lines() {
        let dmesg = "\
[    2.100000] usb 1-1: device descriptor read error
[   12.345678] Candle: early boot: overlay ready
[   13.000000] Candle: could not mount /boot
";
        assert_eq!(
            filter_candle_lines(dmesg),
            "]  early boot: overlay ready\n]  could not mount /boot\n"
        );
    }

    #[test]
    fn test_filter_resets_on_live_update_start() {
        let dmesg = "\
[    1.0] Candle: old message
[   50.0] Candle: starting live update
[   51.0] Candle: downloading
";
        assert_eq!(
            filter_candle_lines(dmesg),
            "starting live update\n]  downloading\n"
        );
        assert_eq!(filter_candle_lines(""), "");
    }

    #[test]
    fn test_vcgencmd_path_falls_back() {
        assert_eq!(vcgencmd_path(&["/nonexistent/vcgencmd"]), "/nonexistent/vcgencmd");
        assert_eq!(vcgencmd_path(&[]), "vcgencmd");
    }

    #[tokio::test]
    async fn test_voltage_latches_ever_observed() {
        let dir = TempDir::new().unwrap();
        let (telemetry, runner) = telemetry(&dir);

        runner.respond(&vcgencmd_path(&VCGENCMD_PATHS), CommandOutput::ok("throttled=0x50005\n"));
        let first = telemetry.voltage().await;
        assert!(first.low_voltage_now);
        assert!(first.low_voltage_ever_observed);

        runner.respond(&vcgencmd_path(&VCGENCMD_PATHS), CommandOutput::ok("throttled=0x0\n"));
        let later = telemetry.voltage().await;
        assert!(!later.low_voltage_now);
        assert!(later.low_voltage_ever_observed);
    }

    #[tokio::test]
    async fn test_voltage_unavailable_is_default() {
        let dir = TempDir::new().unwrap();
        let (telemetry, runner) = telemetry(&dir);
        runner.respond(
            &vcgencmd_path(&VCGENCMD_PATHS),
            CommandOutput::failed(127, "not found"),
        );
        assert_eq!(telemetry.voltage().await, VoltageState::default());
    }

    #[tokio::test]
    async fn test_files_check_without_script() {
        let dir = TempDir::new().unwrap();
        let (telemetry, runner) = telemetry(&dir);
        assert!(!telemetry.files_check_exists());
        assert_eq!(telemetry.files_check().await, FILES_CHECK_UNSUPPORTED);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_files_check_runs_script() {
        let dir = TempDir::new().unwrap();
        let (telemetry, runner) = telemetry(&dir);
        let script = dir.path().join("files_check.sh");
        std::fs::write(&script, "#!/bin/bash\n").unwrap();
        runner.respond(&script.to_string_lossy(), CommandOutput::ok("All files present\n"));

        assert_eq!(telemetry.files_check().await, "All files present\n");
    }

    #[test]
    fn test_memory_is_reported() {
        let dir = TempDir::new().unwrap();
        let (telemetry, _) = telemetry(&dir);
        let memory = telemetry.memory();
        assert!(memory.total_memory > 0);
        assert!(memory.free_memory <= memory.total_memory);
    }
}
