//! System status snapshot
//!
//! Rebuilt for every request from markers, files and probes. Field names
//! on the wire follow what the settings UI already reads.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem usage in bytes; serialized as `[total, used, free]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "[u64; 3]", from = "[u64; 3]")]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

impl From<DiskUsage> for [u64; 3] {
    fn from(d: DiskUsage) -> Self {
        [d.total, d.used, d.free]
    }
}

impl From<[u64; 3]> for DiskUsage {
    fn from([total, used, free]: [u64; 3]) -> Self {
        Self { total, used, free }
    }
}

/// Backup archive as currently found on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub path: PathBuf,
    pub exists: bool,
    pub size_bytes: u64,
}

impl BackupRecord {
    /// Stat `path` now.
    pub fn probe(path: PathBuf) -> Self {
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Self {
                path,
                exists: true,
                size_bytes: meta.len(),
            },
            _ => Self {
                path,
                exists: false,
                size_bytes: 0,
            },
        }
    }
}

/// Everything `/init` reports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub hours: u32,
    pub minutes: u32,
    #[serde(rename = "ntp")]
    pub ntp_enabled: bool,
    pub hardware_clock_detected: bool,
    #[serde(rename = "low_voltage")]
    pub low_voltage_ever_observed: bool,
    pub low_voltage_now: bool,
    pub system_update_in_progress: bool,
    pub live_update_attempted: bool,
    pub bootup_actions_failed: bool,
    #[serde(rename = "ro_exists")]
    pub overlay_fs_present: bool,
    pub old_overlay_active: bool,
    pub backup_exists: bool,
    #[serde(rename = "restore_exists")]
    pub restore_file_exists: bool,
    pub backup: BackupRecord,
    pub disk_usage: DiskUsage,
    pub candle_version: String,
    #[serde(rename = "candle_original_version")]
    pub original_version: String,
    pub allow_anonymous_mqtt: bool,
    pub files_check_exists: bool,
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_disk_usage_serializes_as_triple() {
        let usage = DiskUsage {
            total: 100,
            used: 40,
            free: 60,
        };
        assert_eq!(serde_json::to_string(&usage).unwrap(), "[100,40,60]");
        let back: DiskUsage = serde_json::from_str("[100,40,60]").unwrap();
        assert_eq!(back, usage);
    }

    #[test]
    fn test_backup_record_probe() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("candle_backup.tar");

        let missing = BackupRecord::probe(path.clone());
        assert!(!missing.exists);
        assert_eq!(missing.size_bytes, 0);

        std::fs::write(&path, vec![0u8; 1024]).unwrap();
        let present = BackupRecord::probe(path);
        assert!(present.exists);
        assert_eq!(present.size_bytes, 1024);
    }

    #[test]
    fn test_backup_record_ignores_directories() {
        let dir = TempDir::new().unwrap();
        let record = BackupRecord::probe(dir.path().to_path_buf());
        assert!(!record.exists);
    }
}
