//! Crash-safe JSON file writes.
//!
//! A write serializes into a temp file in the target's directory, fsyncs
//! it and renames it over the target, so readers only ever see the old or
//! the new complete file. An optional [`BackupPolicy`] keeps hard links to
//! the versions being replaced; a failed backup is logged and the write
//! goes ahead without it.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tempfile::Builder;

use super::StoreError;

/// Backups of replaced versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPolicy {
    /// Directory holding the backups.
    pub dir: PathBuf,
    /// Number of most recent backups kept. Never less than one.
    pub retention: usize,
}

/// Atomically replaces `path` with `value` serialized as pretty JSON.
///
/// The temp file is named `<tmp_prefix>*.json` and lives next to `path`.
/// The parent directory must exist.
pub fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
    tmp_prefix: &str,
    backups: Option<&BackupPolicy>,
) -> Result<(), StoreError> {
    let dir = parent_dir(path)?;

    let tmp = Builder::new()
        .prefix(tmp_prefix)
        .suffix(".json")
        .tempfile_in(dir)?;

    {
        let mut writer = BufWriter::new(tmp.as_file());
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;

    if let Some(policy) = backups {
        if path.exists() {
            if let Err(e) = backup_file(path, policy) {
                tracing::warn!(
                    path = %path.display(),
                    backup_dir = %policy.dir.display(),
                    error = %e,
                    "Backup failed, writing without one"
                );
            }
        }
    }

    tmp.persist(path).map_err(|e| StoreError::Persist {
        path: path.to_path_buf(),
        message: e.error.to_string(),
    })?;

    sync_dir(dir);
    Ok(())
}

/// Removes temp files matching `<tmp_prefix>*` left behind by a crash.
pub fn remove_stale_temp_files(dir: &Path, tmp_prefix: &str) -> Result<usize, StoreError> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let is_stale = entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with(tmp_prefix))
            .unwrap_or(false);
        if is_stale && entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
            tracing::warn!(path = %entry.path().display(), "Removed stale temp file");
            removed += 1;
        }
    }
    Ok(removed)
}

/// Keeps a hard link (or a copy, where links are unsupported) of the
/// current version of `path`, then prunes backups beyond the retention.
pub fn backup_file(path: &Path, policy: &BackupPolicy) -> Result<PathBuf, StoreError> {
    fs::create_dir_all(&policy.dir)?;

    let stem = file_stem(path)?;
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%6f");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let backup = policy
        .dir
        .join(format!("{}.{}-{}.json", stem, stamp, &suffix[..8]));

    if fs::hard_link(path, &backup).is_err() {
        fs::copy(path, &backup)?;
    }

    prune_backups(&policy.dir, &stem, policy.retention)?;
    Ok(backup)
}

/// Lists the backups of files named `<stem>.json`, oldest first.
pub fn list_backups(dir: &Path, stem: &str) -> Result<Vec<PathBuf>, StoreError> {
    let prefix = format!("{}.", stem);
    let mut backups: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .map(|n| n.starts_with(&prefix) && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .map(|e| e.path())
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    backups.sort();
    Ok(backups)
}

fn prune_backups(dir: &Path, stem: &str, retention: usize) -> Result<(), StoreError> {
    let backups = list_backups(dir, stem)?;
    let excess = backups.len().saturating_sub(retention.max(1));
    for old in backups.into_iter().take(excess) {
        fs::remove_file(&old)?;
        tracing::debug!(path = %old.display(), "Pruned backup");
    }
    Ok(())
}

fn parent_dir(path: &Path) -> Result<&Path, StoreError> {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| StoreError::Persist {
            path: path.to_path_buf(),
            message: "path has no parent directory".to_string(),
        })
}

fn file_stem(path: &Path) -> Result<String, StoreError> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| StoreError::Persist {
            path: path.to_path_buf(),
            message: "path has no file name".to_string(),
        })
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        if let Err(e) = handle.sync_all() {
            tracing::debug!(path = %dir.display(), error = %e, "Directory fsync failed");
        }
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
