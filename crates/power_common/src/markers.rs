//! Durable markers in the boot partition
//!
//! A marker is a file whose presence is the whole signal. The privileged
//! boot phase reads and deletes these between runs of the daemon, so callers
//! must ask [`MarkerStore::exists`] at every decision point instead of
//! remembering an earlier answer.
//!
//! The store also owns the boot-action slot: the single script the boot
//! phase executes once and then removes.

use crate::error::{PowerError, Result};
use crate::paths::BOOT_ACTION_FILE;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Named durable flags understood by the boot scripts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Marker {
    /// Keep Zigbee2MQTT data across a factory reset
    KeepZ2m,
    /// Keep Bluetooth pairings across a factory reset
    KeepBluetooth,
    /// Root filesystem stays writable on every boot
    StayReadWrite,
    /// Root filesystem is writable for the next boot only
    ReadWriteOnce,
    /// Updates pull from the cutting-edge channel
    CuttingEdge,
    HardwareClockInitialized,
    /// Written by the boot phase when its action script failed
    BootupActionsFailed,
}

impl Marker {
    pub const ALL: [Marker; 7] = [
        Marker::KeepZ2m,
        Marker::KeepBluetooth,
        Marker::StayReadWrite,
        Marker::ReadWriteOnce,
        Marker::CuttingEdge,
        Marker::HardwareClockInitialized,
        Marker::BootupActionsFailed,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            Self::KeepZ2m => "keep_z2m.txt",
            Self::KeepBluetooth => "keep_bluetooth.txt",
            Self::StayReadWrite => "candle_stay_rw.txt",
            Self::ReadWriteOnce => "candle_rw_once.txt",
            Self::CuttingEdge => "candle_cutting_edge.txt",
            Self::HardwareClockInitialized => "candle_hardware_clock.txt",
            Self::BootupActionsFailed => "bootup_actions_failed.sh",
        }
    }
}

/// Something a lease put on disk that must be undone if the lease fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staged {
    Marker(Marker),
    BootAction,
}

/// File-presence store rooted at the boot dir
#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, marker: Marker) -> PathBuf {
        self.dir.join(marker.file_name())
    }

    pub fn exists(&self, marker: Marker) -> bool {
        self.path(marker).is_file()
    }

    /// Create the marker and flush it to disk.
    pub fn set(&self, marker: Marker) -> Result<()> {
        let path = self.path(marker);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|e| PowerError::io(&path, e))?;
        file.sync_all().map_err(|e| PowerError::io(&path, e))?;
        debug!("marker set: {}", path.display());
        Ok(())
    }

    /// Remove the marker. Absent is fine; anything else is an error.
    pub fn clear(&self, marker: Marker) -> Result<()> {
        let path = self.path(marker);
        remove_if_present(&path)?;
        debug!("marker cleared: {}", path.display());
        Ok(())
    }

    /// Snapshot of every known marker, read fresh.
    pub fn snapshot(&self) -> Vec<(Marker, bool)> {
        Marker::ALL.iter().map(|m| (*m, self.exists(*m))).collect()
    }

    pub fn boot_action_path(&self) -> PathBuf {
        self.dir.join(BOOT_ACTION_FILE)
    }

    pub fn boot_action_staged(&self) -> bool {
        self.boot_action_path().is_file()
    }

    /// Copy `script` into the boot-action slot.
    ///
    /// The copy lands under a temporary name first and is renamed into
    /// place, so the boot phase never runs a half-written script.
    pub fn install_boot_action(&self, script: &Path) -> Result<()> {
        let body = fs::read(script).map_err(|e| PowerError::io(script, e))?;
        self.write_boot_action(&body)
    }

    pub fn write_boot_action(&self, body: &[u8]) -> Result<()> {
        let slot = self.boot_action_path();
        let tmp = self.dir.join(format!(".{}.tmp", BOOT_ACTION_FILE));

        let write = || -> io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(body)?;
            file.sync_all()?;
            Ok(())
        };
        write().map_err(|e| PowerError::io(&tmp, e))?;

        // vfat boot partitions reject chmod; the boot phase runs the slot through bash anyway
        if let Err(e) = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o755)) {
            warn!("could not mark {} executable: {}", tmp.display(), e);
        }

        fs::rename(&tmp, &slot).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            PowerError::io(&slot, e)
        })?;
        debug!("boot action staged: {}", slot.display());
        Ok(())
    }

    pub fn clear_boot_action(&self) -> Result<()> {
        remove_if_present(&self.boot_action_path())
    }

    /// Undo one staged item.
    pub fn unstage(&self, staged: Staged) -> Result<()> {
        match staged {
            Staged::Marker(marker) => self.clear(marker),
            Staged::BootAction => self.clear_boot_action(),
        }
    }
}

/// `rm -f` with errors other than NotFound reported.
pub fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PowerError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_then_exists() {
        let dir = TempDir::new().unwrap();
        let store = MarkerStore::new(dir.path());

        assert!(!store.exists(Marker::ReadWriteOnce));
        store.set(Marker::ReadWriteOnce).unwrap();
        assert!(store.exists(Marker::ReadWriteOnce));
        assert!(dir.path().join("candle_rw_once.txt").is_file());
    }

    #[test]
    fn test_clear_then_not_exists() {
        let dir = TempDir::new().unwrap();
        let store = MarkerStore::new(dir.path());

        store.set(Marker::CuttingEdge).unwrap();
        store.clear(Marker::CuttingEdge).unwrap();
        assert!(!store.exists(Marker::CuttingEdge));
    }

    #[test]
    fn test_clear_absent_is_ok() {
        let dir = TempDir::new().unwrap();
        let store = MarkerStore::new(dir.path());
        store.clear(Marker::KeepZ2m).unwrap();
        store.clear(Marker::KeepZ2m).unwrap();
    }

    #[test]
    fn test_marker_survives_new_store() {
        let dir = TempDir::new().unwrap();
        MarkerStore::new(dir.path()).set(Marker::StayReadWrite).unwrap();

        // A fresh store over the same dir stands in for a restarted process
        let restarted = MarkerStore::new(dir.path());
        assert!(restarted.exists(Marker::StayReadWrite));
    }

    #[test]
    fn test_set_in_missing_dir_reports_error() {
        let dir = TempDir::new().unwrap();
        let store = MarkerStore::new(dir.path().join("not-mounted"));
        let err = store.set(Marker::KeepBluetooth).unwrap_err();
        assert!(matches!(err, PowerError::Io { .. }));
    }

    #[test]
    fn test_external_removal_is_seen() {
        let dir = TempDir::new().unwrap();
        let store = MarkerStore::new(dir.path());
        store.set(Marker::BootupActionsFailed).unwrap();
        fs::remove_file(dir.path().join("bootup_actions_failed.sh")).unwrap();
        assert!(!store.exists(Marker::BootupActionsFailed));
    }

    #[test]
    fn test_install_boot_action_copies_script() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("factory_reset.sh");
        fs::write(&script, "#!/bin/bash\necho reset\n").unwrap();
        let store = MarkerStore::new(dir.path());

        assert!(!store.boot_action_staged());
        store.install_boot_action(&script).unwrap();
        assert!(store.boot_action_staged());
        assert_eq!(
            fs::read_to_string(store.boot_action_path()).unwrap(),
            "#!/bin/bash\necho reset\n"
        );
        assert!(!dir.path().join(".bootup_actions.sh.tmp").exists());

        store.unstage(Staged::BootAction).unwrap();
        assert!(!store.boot_action_staged());
    }

    #[test]
    fn test_install_missing_script_leaves_slot_empty() {
        let dir = TempDir::new().unwrap();
        let store = MarkerStore::new(dir.path());
        let err = store
            .install_boot_action(&dir.path().join("missing.sh"))
            .unwrap_err();
        assert!(matches!(err, PowerError::Io { .. }));
        assert!(!store.boot_action_staged());
    }
}
