//! Status snapshot assembly.
//!
//! Every field is read fresh: markers and files from disk, flags from the
//! registry, update activity from the process table.

use crate::server::AppState;
use chrono::{Local, Timelike};
use power_common::{Marker, SystemStatus};
use std::fs;
use std::path::Path;

const UNKNOWN_VERSION: &str = "unknown";

/// First line of a version file, or "unknown"
pub fn read_version(path: &Path) -> String {
    fs::read_to_string(path)
        .ok()
        .map(|text| text.trim().to_string())
        .filter(|version| !version.is_empty())
        .unwrap_or_else(|| UNKNOWN_VERSION.to_string())
}

pub async fn snapshot(state: &AppState) -> SystemStatus {
    let layout = &state.layout;
    let registry = state.registry.current_status();
    let voltage = state.telemetry.voltage().await;
    let backup = state.backups.record();
    let now = Local::now();

    SystemStatus {
        hours: now.hour(),
        minutes: now.minute(),
        ntp_enabled: state.clock.ntp_enabled().await,
        hardware_clock_detected: registry.hardware_clock_detected,
        low_voltage_ever_observed: voltage.low_voltage_ever_observed,
        low_voltage_now: voltage.low_voltage_now,
        system_update_in_progress: state.registry.update_in_progress().await,
        live_update_attempted: registry.live_update_attempted,
        bootup_actions_failed: state.registry.markers().exists(Marker::BootupActionsFailed),
        overlay_fs_present: layout.overlay_lower_dir.is_dir(),
        old_overlay_active: state.updates.old_overlay_active(),
        backup_exists: backup.exists,
        restore_file_exists: state.backups.restore_exists(),
        backup,
        disk_usage: state.backups.disk_usage(),
        candle_version: read_version(&layout.version_file()),
        original_version: read_version(&layout.original_version_file()),
        allow_anonymous_mqtt: state.mqtt.anonymous_allowed(),
        files_check_exists: state.telemetry.files_check_exists(),
        debug: state.config.debug(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("candle_version.txt");
        assert_eq!(read_version(&path), "unknown");

        fs::write(&path, "2.0.2\n").unwrap();
        assert_eq!(read_version(&path), "2.0.2");

        fs::write(&path, "  \n").unwrap();
        assert_eq!(read_version(&path), "unknown");
    }
}
