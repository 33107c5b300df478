//! One-time pass over the boot surface before the server starts.
//!
//! The boot phase has run by the time the daemon starts, so anything it
//! should have consumed is cleaned up here. A failing step is logged and the
//! pass moves on.

use crate::server::AppState;
use power_common::{Marker, PowerError};
use std::fs;
use tracing::{debug, error, info, warn};

/// What the pass found and did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub leftover_boot_action_removed: bool,
    pub bootup_actions_failed: bool,
    pub download_link_removed: bool,
    pub stale_restore_removed: bool,
    pub hardware_clock_detected: bool,
    pub update_in_progress: bool,
}

fn step<T>(name: &str, result: Result<T, PowerError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("startup: {} failed: {}", name, e);
            None
        }
    }
}

pub async fn run(state: &AppState) -> StartupReport {
    let markers = state.registry.markers();
    let mut report = StartupReport::default();

    if markers.boot_action_staged() {
        error!("Boot action script survived a boot, removing it");
        report.leftover_boot_action_removed =
            step("boot action removal", markers.clear_boot_action()).is_some();
    }

    if markers.exists(Marker::ReadWriteOnce) {
        info!("Removing read-write-once marker, next boot is read-only again");
        step("rw-once removal", markers.clear(Marker::ReadWriteOnce));
    }

    // Reported until acknowledged, never cleared here
    report.bootup_actions_failed = markers.exists(Marker::BootupActionsFailed);
    if report.bootup_actions_failed {
        warn!("Boot actions reported a failure");
    }

    if markers.exists(Marker::StayReadWrite) {
        debug!("Permanent read-write mode");
    }

    report.download_link_removed =
        step("download link removal", state.backups.unlink_download_dir()).unwrap_or(false);

    report.stale_restore_removed =
        step("stale restore removal", state.backups.discard_restore()).unwrap_or(false);

    let backup_dir = state.layout.backup_dir();
    step(
        "backup dir creation",
        fs::create_dir_all(&backup_dir).map_err(|e| PowerError::io(&backup_dir, e)),
    );

    let disabled = state.config.daemon.do_not_use_hardware_clock;
    step(
        "hardware clock check",
        state.clock.check_hardware_clock(disabled).await,
    );
    report.hardware_clock_detected = state.registry.hardware_clock_detected();

    report.update_in_progress = state.registry.recover().await.is_some();

    info!("Startup pass done: {:?}", report);
    report
}
