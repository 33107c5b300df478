//! Filesystem layout of the controller
//!
//! Every path the daemon reads or writes is derived from the handful of
//! roots in [`Layout`]. The boot dir is shared with the privileged boot
//! phase, so file names under it are fixed by the boot scripts.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const BOOT_ACTION_FILE: &str = "bootup_actions.sh";
pub const VERSION_FILE: &str = "candle_version.txt";
pub const ORIGINAL_VERSION_FILE: &str = "candle_original_version.txt";
pub const CMDLINE_FILE: &str = "cmdline.txt";

pub const BACKUP_FILE_NAME: &str = "candle_backup.tar";
pub const RESTORE_FILE_NAME: &str = "candle_restore.tar";

/// Root directories; everything else is derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Layout {
    /// Boot partition, readable by the boot phase
    pub boot_dir: PathBuf,
    /// Gateway home (holds ./config and ./data)
    pub base_dir: PathBuf,
    /// This add-on's install dir (scripts, published download dir)
    pub addon_dir: PathBuf,
    /// This add-on's data dir (backups, scratch scripts)
    pub data_dir: PathBuf,
    pub mosquitto_conf: PathBuf,
    pub files_check_script: PathBuf,
    /// Lower dir of the read-only overlay
    pub overlay_lower_dir: PathBuf,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            boot_dir: PathBuf::from("/boot"),
            base_dir: PathBuf::from("/home/pi/.webthings"),
            addon_dir: PathBuf::from("/home/pi/.webthings/addons/power-settings"),
            data_dir: PathBuf::from("/home/pi/.webthings/data/power-settings"),
            mosquitto_conf: PathBuf::from("/home/pi/.webthings/etc/mosquitto/mosquitto.conf"),
            files_check_script: PathBuf::from("/home/pi/candle/files_check.sh"),
            overlay_lower_dir: PathBuf::from("/ro"),
        }
    }
}

impl Layout {
    /// Layout with every root placed under `root` (used by tests and dry runs).
    pub fn rooted(root: &Path) -> Self {
        Self {
            boot_dir: root.join("boot"),
            base_dir: root.join("webthings"),
            addon_dir: root.join("webthings/addons/power-settings"),
            data_dir: root.join("webthings/data/power-settings"),
            mosquitto_conf: root.join("webthings/etc/mosquitto/mosquitto.conf"),
            files_check_script: root.join("candle/files_check.sh"),
            overlay_lower_dir: root.join("ro"),
        }
    }

    pub fn version_file(&self) -> PathBuf {
        self.boot_dir.join(VERSION_FILE)
    }

    pub fn original_version_file(&self) -> PathBuf {
        self.boot_dir.join(ORIGINAL_VERSION_FILE)
    }

    pub fn cmdline_file(&self) -> PathBuf {
        self.boot_dir.join(CMDLINE_FILE)
    }

    pub fn factory_reset_script(&self) -> PathBuf {
        self.addon_dir.join("factory_reset.sh")
    }

    pub fn manual_update_script(&self) -> PathBuf {
        self.addon_dir.join("manual_update.sh")
    }

    pub fn restore_backup_script(&self) -> PathBuf {
        self.addon_dir.join("restore_backup.sh")
    }

    /// Scratch path for the fetched reboot-update script
    pub fn system_update_script(&self) -> PathBuf {
        self.data_dir.join("create_latest_candle.sh")
    }

    /// Scratch path for the fetched live-update script
    pub fn live_update_script(&self) -> PathBuf {
        self.data_dir.join("live_system_update.sh")
    }

    /// Symlink published so the gateway serves the backup for download
    pub fn backup_download_dir(&self) -> PathBuf {
        self.addon_dir.join("backup")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir.join("backup")
    }

    pub fn backup_file(&self) -> PathBuf {
        self.backup_dir().join(BACKUP_FILE_NAME)
    }

    pub fn restore_file(&self) -> PathBuf {
        self.data_dir.join(RESTORE_FILE_NAME)
    }
}
