//! Backup Manager - archive the gateway's settings, stage a restore.
//!
//! A backup is a plain tar of the structured-data files under the gateway's
//! `config` and `data` dirs. It is published for download by symlinking the
//! add-on's `backup` dir to the backup dir in the data dir.
//!
//! A restore is only staged here: the uploaded archive is written next to
//! the backups and the restore script goes into the boot-action slot. The
//! boot phase does the actual restore.

use crate::registry::OperationRegistry;
use base64::Engine;
use nix::sys::statvfs::statvfs;
use power_common::markers::remove_if_present;
use power_common::{BackupRecord, DiskUsage, Layout, Operation, PowerError};
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Dirs under the gateway base dir that get archived
const BACKUP_ROOTS: [&str; 2] = ["config", "data"];

/// Depth below each root, counting the root as 0
const BACKUP_MAX_DEPTH: usize = 2;

const BACKUP_EXTENSIONS: [&str; 3] = ["json", "yaml", "sqlite3"];

#[derive(Clone)]
pub struct BackupManager {
    layout: Layout,
    registry: OperationRegistry,
}

impl BackupManager {
    pub fn new(layout: Layout, registry: OperationRegistry) -> Self {
        Self { layout, registry }
    }

    /// Archive the whitelist and publish the download link.
    pub async fn backup(&self) -> Result<BackupRecord, PowerError> {
        let lease = self.registry.try_begin(Operation::Backup).await?;
        let this = self.clone();
        let result = run_blocking("backup", move || this.write_backup()).await;
        self.registry.settle(lease, result)
    }

    fn write_backup(&self) -> Result<BackupRecord, PowerError> {
        let backup_dir = self.layout.backup_dir();
        fs::create_dir_all(&backup_dir).map_err(|e| PowerError::io(&backup_dir, e))?;

        let archive = self.layout.backup_file();
        remove_if_present(&archive)?;

        let files = collect_backup_files(&self.layout.base_dir);
        info!("Backing up {} files to {}", files.len(), archive.display());

        let partial = archive.with_extension("tar.partial");
        write_tar(&partial, &self.layout.base_dir, &files).map_err(|e| {
            let _ = fs::remove_file(&partial);
            PowerError::io(&partial, e)
        })?;
        fs::rename(&partial, &archive).map_err(|e| PowerError::io(&archive, e))?;

        self.publish_download_dir()?;
        Ok(self.record())
    }

    /// Symlink the backup dir into the add-on dir, unless something is there.
    fn publish_download_dir(&self) -> Result<(), PowerError> {
        let link = self.layout.backup_download_dir();
        if fs::symlink_metadata(&link).is_ok() {
            debug!("download dir already present: {}", link.display());
            return Ok(());
        }
        symlink(self.layout.backup_dir(), &link).map_err(|e| PowerError::io(&link, e))?;
        info!("Backup downloadable via {}", link.display());
        Ok(())
    }

    /// Remove the download link. `Ok(false)` when there was none.
    ///
    /// Only ever removes a symlink; a real dir in its place is left alone.
    pub fn unlink_download_dir(&self) -> Result<bool, PowerError> {
        let link = self.layout.backup_download_dir();
        match fs::symlink_metadata(&link) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PowerError::io(&link, e)),
            Ok(meta) if meta.file_type().is_symlink() => {
                fs::remove_file(&link).map_err(|e| PowerError::io(&link, e))?;
                info!("Backup download link removed");
                Ok(true)
            }
            Ok(_) => {
                warn!("{} is not a symlink, leaving it", link.display());
                Ok(false)
            }
        }
    }

    /// Validate and write an uploaded restore archive, then arm the restore.
    ///
    /// `filedata` is base64, optionally behind a data-URI prefix
    /// (`data:application/x-tar;base64,`). Nothing is written unless the
    /// name and payload are valid.
    pub async fn stage_restore(&self, filename: &str, filedata: String) -> Result<(), PowerError> {
        if !filename.ends_with(".tar") {
            return Err(PowerError::validation(format!(
                "only .tar files can be restored, got '{}'",
                filename
            )));
        }
        let payload = run_blocking("restore decode", move || decode_upload(&filedata)).await?;
        let size = payload.len();

        let mut lease = self.registry.try_begin(Operation::Restore).await?;
        let restore_file = self.layout.restore_file();
        let dest = restore_file.clone();
        let result = run_blocking("restore write", move || write_restore(&dest, &payload))
            .await
            .and_then(|()| {
                self.registry
                    .stage_boot_action(&mut lease, &self.layout.restore_backup_script())
            });
        if result.is_err() {
            let _ = remove_if_present(&restore_file);
        }
        self.registry.settle(lease, result)?;

        info!("Restore of {} staged for next boot ({} bytes)", filename, size);
        Ok(())
    }

    pub fn record(&self) -> BackupRecord {
        BackupRecord::probe(self.layout.backup_file())
    }

    pub fn restore_exists(&self) -> bool {
        self.layout.restore_file().is_file()
    }

    /// Remove a staged restore left over from an earlier run.
    pub fn discard_restore(&self) -> Result<bool, PowerError> {
        let path = self.layout.restore_file();
        let existed = path.is_file();
        remove_if_present(&path)?;
        Ok(existed)
    }

    /// Usage of the filesystem holding the gateway dir
    pub fn disk_usage(&self) -> DiskUsage {
        disk_usage(&self.layout.base_dir).unwrap_or_else(|e| {
            warn!("disk usage unavailable for {}: {}", self.layout.base_dir.display(), e);
            DiskUsage::default()
        })
    }
}

/// Files to archive, relative to `base`, sorted.
pub fn collect_backup_files(base: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = BACKUP_ROOTS
        .iter()
        .map(|root| base.join(root))
        .filter(|root| root.is_dir())
        .flat_map(|root| {
            WalkDir::new(root)
                .max_depth(BACKUP_MAX_DEPTH)
                .into_iter()
                .filter_map(|entry| entry.ok())
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| BACKUP_EXTENSIONS.contains(&ext))
                .unwrap_or(false)
        })
        .filter_map(|entry| entry.path().strip_prefix(base).ok().map(Path::to_path_buf))
        .collect();
    files.sort();
    files
}

fn write_tar(dest: &Path, base: &Path, files: &[PathBuf]) -> io::Result<()> {
    let file = fs::File::create(dest)?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    for rel in files {
        builder.append_path_with_name(base.join(rel), rel)?;
    }
    let file = builder.into_inner()?;
    file.sync_all()
}

/// Run file-heavy work on the blocking pool.
async fn run_blocking<T, F>(what: &str, work: F) -> Result<T, PowerError>
where
    F: FnOnce() -> Result<T, PowerError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| PowerError::Command {
            program: what.to_string(),
            message: format!("worker task failed: {}", e),
        })?
}

fn write_restore(path: &Path, payload: &[u8]) -> Result<(), PowerError> {
    remove_if_present(path)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PowerError::io(parent, e))?;
    }
    let write = || -> io::Result<()> {
        let mut file = fs::File::create(path)?;
        file.write_all(payload)?;
        file.sync_all()
    };
    write().map_err(|e| PowerError::io(path, e))
}

/// Strip an optional data-URI prefix and decode base64.
pub fn decode_upload(filedata: &str) -> Result<Vec<u8>, PowerError> {
    let encoded = match filedata.split_once(',') {
        Some((_, data)) => data,
        None => filedata,
    };
    let payload = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| PowerError::validation(format!("restore payload is not base64: {}", e)))?;
    if payload.is_empty() {
        return Err(PowerError::validation("restore payload is empty"));
    }
    Ok(payload)
}

fn disk_usage(path: &Path) -> nix::Result<DiskUsage> {
    let stat = statvfs(path)?;
    let frsize = stat.fragment_size() as u64;
    let blocks = stat.blocks() as u64;
    Ok(DiskUsage {
        total: blocks * frsize,
        used: blocks.saturating_sub(stat.blocks_free() as u64) * frsize,
        free: stat.blocks_available() as u64 * frsize,
    })
}
