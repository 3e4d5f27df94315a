//! The per-run consolidated lead list.
//!
//! Appends for one run are serialized through a per-run mutex; each append
//! is a read-merge-atomic-write of `outputs/lead_list_consolidated.json`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::atomic::{remove_stale_temp_files, write_json_atomic, BackupPolicy};
use super::StoreError;
use crate::run::RunId;
use crate::validation::LeadRecord;
use crate::workspace::outputs_dir;

/// File name of the consolidated lead list inside `outputs/`.
pub const CONSOLIDATED_FILE: &str = "lead_list_consolidated.json";
/// Directory for superseded versions, inside `outputs/`.
pub const BACKUP_DIR: &str = "backups";
/// Prefix of in-progress temp files.
pub const TMP_PREFIX: &str = ".tmp_leads_";

/// On-disk shape of the consolidated file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidatedFile {
    pub leads: Vec<LeadRecord>,
}

/// Append-only store of validated lead records, one file per run.
pub struct ConsolidationStore {
    runs_dir: PathBuf,
    retention: usize,
    locks: Mutex<HashMap<RunId, Arc<Mutex<()>>>>,
}

impl ConsolidationStore {
    pub fn new(runs_dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            runs_dir: runs_dir.into(),
            retention,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Path of the consolidated file for `run_id`.
    pub fn path(&self, run_id: &RunId) -> PathBuf {
        outputs_dir(&self.runs_dir, run_id).join(CONSOLIDATED_FILE)
    }

    /// Appends `records` to the run's consolidated file.
    ///
    /// Returns the total number of records in the file afterwards. On error
    /// the previous complete version is still in place.
    pub async fn append(&self, run_id: &RunId, records: &[LeadRecord]) -> Result<usize, StoreError> {
        let lock = self.lock_for(run_id).await;
        let _guard = lock.lock().await;

        let path = self.path(run_id);
        let backups = BackupPolicy {
            dir: outputs_dir(&self.runs_dir, run_id).join(BACKUP_DIR),
            retention: self.retention,
        };
        let records = records.to_vec();

        let total = tokio::task::spawn_blocking(move || append_blocking(&path, records, &backups))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))??;

        tracing::debug!(run_id = %run_id, total, "Consolidated file updated");
        Ok(total)
    }

    /// Reads the run's consolidated records. A missing file reads as empty.
    pub async fn read(&self, run_id: &RunId) -> Result<Vec<LeadRecord>, StoreError> {
        let path = self.path(run_id);
        tokio::task::spawn_blocking(move || read_file(&path))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
            .map(|file| file.leads)
    }

    /// Drops the per-run lock once a run is finished.
    pub async fn forget(&self, run_id: &RunId) {
        self.locks.lock().await.remove(run_id);
    }

    async fn lock_for(&self, run_id: &RunId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(run_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn append_blocking(
    path: &Path,
    records: Vec<LeadRecord>,
    backups: &BackupPolicy,
) -> Result<usize, StoreError> {
    let dir = path.parent().ok_or_else(|| StoreError::Persist {
        path: path.to_path_buf(),
        message: "path has no parent directory".to_string(),
    })?;
    remove_stale_temp_files(dir, TMP_PREFIX)?;

    let mut file = match read_file(path) {
        Ok(file) => file,
        Err(StoreError::Corrupt { path, message }) => {
            let quarantined = quarantine(&path)?;
            tracing::error!(
                path = %path.display(),
                moved_to = %quarantined.display(),
                error = %message,
                "Consolidated file was corrupt, starting a new one"
            );
            ConsolidatedFile::default()
        }
        Err(e) => return Err(e),
    };

    file.leads.extend(records);
    write_json_atomic(path, &file, TMP_PREFIX, Some(backups))?;
    Ok(file.leads.len())
}

fn read_file(path: &Path) -> Result<ConsolidatedFile, StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ConsolidatedFile::default());
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn quarantine(path: &Path) -> Result<PathBuf, StoreError> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%6f");
    let target = path.with_extension(format!("json.corrupt-{}", stamp));
    fs::rename(path, &target)?;
    Ok(target)
}
