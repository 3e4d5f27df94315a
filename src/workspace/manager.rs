//! Run workspace allocation, release and purging.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::error::ErrorKind;
use crate::run::RunId;

/// Name of the exclusive lock marker inside a run directory.
pub const LOCK_FILE: &str = ".pipeline.lock";
/// Write-once inputs directory.
pub const INPUTS_DIR: &str = "inputs";
/// Append-only outputs directory.
pub const OUTPUTS_DIR: &str = "outputs";

/// Errors that can occur during workspace operations.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// Another run owns this run ID's directory.
    #[error("Workspace for run '{0}' already exists")]
    AlreadyExists(RunId),

    /// An input file was already written.
    #[error("Input '{0}' already exists")]
    InputExists(String),

    /// Input names must be plain file names.
    #[error("Invalid input name '{0}'")]
    InvalidInputName(String),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkspaceError {
    /// Run-level error kind for this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkspaceError::AlreadyExists(_) | WorkspaceError::InputExists(_) => {
                ErrorKind::AlreadyExists
            }
            _ => ErrorKind::IoFailure,
        }
    }
}

/// Directory of `run_id` under `runs_dir`.
pub fn run_dir(runs_dir: &Path, run_id: &RunId) -> PathBuf {
    runs_dir.join(run_id.as_str())
}

/// Outputs directory of `run_id` under `runs_dir`.
pub fn outputs_dir(runs_dir: &Path, run_id: &RunId) -> PathBuf {
    run_dir(runs_dir, run_id).join(OUTPUTS_DIR)
}

/// An acquired run workspace. Holding one means holding the lock marker.
#[derive(Debug)]
pub struct Workspace {
    run_id: RunId,
    root: PathBuf,
}

impl Workspace {
    /// Run owning this workspace.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Run directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write-once inputs area.
    pub fn inputs_dir(&self) -> PathBuf {
        self.root.join(INPUTS_DIR)
    }

    /// Append-only outputs area.
    pub fn outputs_dir(&self) -> PathBuf {
        self.root.join(OUTPUTS_DIR)
    }

    /// Lock marker path.
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    /// Writes `value` as pretty JSON to `inputs/<name>`.
    ///
    /// Fails with [`WorkspaceError::InputExists`] if the input was already
    /// written.
    pub async fn write_input<T: Serialize + ?Sized>(
        &self,
        name: &str,
        value: &T,
    ) -> Result<PathBuf, WorkspaceError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(WorkspaceError::InvalidInputName(name.to_string()));
        }

        let path = self.inputs_dir().join(name);
        let bytes = serde_json::to_vec_pretty(value)?;

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(WorkspaceError::InputExists(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        file.write_all(&bytes).await?;
        file.sync_all().await?;
        Ok(path)
    }
}

/// Writes the lock marker and creates the inputs and outputs areas.
async fn populate(root: &Path) -> Result<(), WorkspaceError> {
    let mut lock = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(root.join(LOCK_FILE))
        .await?;
    lock.write_all(std::process::id().to_string().as_bytes())
        .await?;
    lock.sync_all().await?;

    tokio::fs::create_dir(root.join(INPUTS_DIR)).await?;
    tokio::fs::create_dir(root.join(OUTPUTS_DIR)).await?;
    Ok(())
}

/// Allocates one isolated directory tree per run.
///
/// Layout: `<runs_dir>/<run_id>/{.pipeline.lock, inputs/, outputs/}`.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    runs_dir: PathBuf,
}

impl WorkspaceManager {
    /// Creates a manager rooted at `runs_dir`.
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    /// Directory holding all runs.
    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    /// Creates the run directory and takes its lock marker.
    ///
    /// Both the directory and the marker are created exclusively, so of two
    /// concurrent callers with the same run ID exactly one succeeds and the
    /// other gets [`WorkspaceError::AlreadyExists`] without blocking.
    pub async fn acquire(&self, run_id: &RunId) -> Result<Workspace, WorkspaceError> {
        tokio::fs::create_dir_all(&self.runs_dir).await?;

        let root = run_dir(&self.runs_dir, run_id);
        match tokio::fs::create_dir(&root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(WorkspaceError::AlreadyExists(run_id.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        self.initialize(run_id, root).await
    }

    /// Populates a freshly created run directory. On failure the directory
    /// is removed again so the run ID stays available.
    async fn initialize(&self, run_id: &RunId, root: PathBuf) -> Result<Workspace, WorkspaceError> {
        if let Err(e) = populate(&root).await {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&root).await {
                tracing::warn!(
                    run_id = %run_id,
                    path = %root.display(),
                    error = %cleanup,
                    "Failed to remove half-created workspace"
                );
            }
            tracing::error!(run_id = %run_id, error = %e, "Workspace setup failed");
            return Err(e);
        }

        tracing::debug!(run_id = %run_id, path = %root.display(), "Workspace acquired");
        Ok(Workspace {
            run_id: run_id.clone(),
            root,
        })
    }

    /// Removes the lock marker. The directory and its outputs stay.
    pub async fn release(&self, workspace: Workspace) -> Result<(), WorkspaceError> {
        match tokio::fs::remove_file(workspace.lock_path()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(run_id = %workspace.run_id, "Workspace lock already gone");
            }
            Err(e) => return Err(e.into()),
        }
        tracing::debug!(run_id = %workspace.run_id, "Workspace released");
        Ok(())
    }

    /// Deletes unlocked run directories older than `older_than`.
    ///
    /// With `run_id` set only that run is considered. Returns the number of
    /// workspaces removed.
    pub async fn purge(
        &self,
        run_id: Option<&RunId>,
        older_than: Duration,
    ) -> Result<usize, WorkspaceError> {
        let candidates: Vec<PathBuf> = match run_id {
            Some(id) => vec![run_dir(&self.runs_dir, id)],
            None => {
                let mut dirs = Vec::new();
                let mut entries = match tokio::fs::read_dir(&self.runs_dir).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
                    Err(e) => return Err(e.into()),
                };
                while let Some(entry) = entries.next_entry().await? {
                    let name = entry.file_name();
                    let is_run = name
                        .to_str()
                        .map(|n| RunId::parse(n).is_ok())
                        .unwrap_or(false);
                    if is_run && entry.file_type().await?.is_dir() {
                        dirs.push(entry.path());
                    }
                }
                dirs
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;

        for dir in candidates {
            let metadata = match tokio::fs::metadata(&dir).await {
                Ok(m) if m.is_dir() => m,
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            if tokio::fs::try_exists(dir.join(LOCK_FILE)).await? {
                tracing::debug!(path = %dir.display(), "Skipping locked workspace");
                continue;
            }

            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < older_than {
                continue;
            }

            tokio::fs::remove_dir_all(&dir).await?;
            tracing::info!(path = %dir.display(), age_secs = age.as_secs(), "Purged workspace");
            removed += 1;
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn run_id(s: &str) -> RunId {
        RunId::parse(s).expect("valid run id")
    }

    #[tokio::test]
    async fn test_acquire_creates_layout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = WorkspaceManager::new(dir.path());

        let ws = manager.acquire(&run_id("run_a")).await.expect("acquire");

        assert!(ws.inputs_dir().is_dir());
        assert!(ws.outputs_dir().is_dir());
        let pid = std::fs::read_to_string(ws.lock_path()).expect("lock");
        assert_eq!(pid, std::process::id().to_string());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_exactly_one_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = Arc::new(WorkspaceManager::new(dir.path()));
        let id = run_id("run_contended");

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let id = id.clone();
                tokio::spawn(async move { manager.acquire(&id).await })
            })
            .collect();

        let mut won = 0;
        let mut rejected = 0;
        for attempt in attempts {
            match attempt.await.expect("join") {
                Ok(_) => won += 1,
                Err(WorkspaceError::AlreadyExists(_)) => rejected += 1,
                Err(other) => panic!("unexpected error: {}", other),
            }
        }

        assert_eq!(won, 1);
        assert_eq!(rejected, 7);
    }

    #[tokio::test]
    async fn test_release_removes_lock_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = WorkspaceManager::new(dir.path());
        let ws = manager.acquire(&run_id("run_b")).await.expect("acquire");
        let lock = ws.lock_path();
        let outputs = ws.outputs_dir();

        manager.release(ws).await.expect("release");

        assert!(!lock.exists());
        assert!(outputs.is_dir());
    }

    #[tokio::test]
    async fn test_inputs_are_write_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = WorkspaceManager::new(dir.path());
        let ws = manager.acquire(&run_id("run_c")).await.expect("acquire");

        ws.write_input("queries.json", &vec!["a b c"])
            .await
            .expect("first write");
        let err = ws
            .write_input("queries.json", &vec!["d e f"])
            .await
            .expect_err("second write");

        assert!(matches!(err, WorkspaceError::InputExists(_)));
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        let content = std::fs::read_to_string(ws.inputs_dir().join("queries.json")).expect("read");
        assert!(content.contains("a b c"));

        let err = ws.write_input("../escape.json", &1).await.expect_err("bad name");
        assert!(matches!(err, WorkspaceError::InvalidInputName(_)));
    }

    #[tokio::test]
    async fn test_purge_skips_locked_workspaces() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = WorkspaceManager::new(dir.path());

        let locked = manager.acquire(&run_id("run_locked")).await.expect("acquire");
        let done = manager.acquire(&run_id("run_done")).await.expect("acquire");
        manager.release(done).await.expect("release");
        std::fs::write(dir.path().join("notes.txt"), "keep").expect("write");

        let removed = manager.purge(None, Duration::ZERO).await.expect("purge");

        assert_eq!(removed, 1);
        assert!(locked.root().is_dir());
        assert!(!dir.path().join("run_done").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_purge_respects_age_and_run_filter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = WorkspaceManager::new(dir.path());
        for name in ["run_x", "run_y"] {
            let ws = manager.acquire(&run_id(name)).await.expect("acquire");
            manager.release(ws).await.expect("release");
        }

        let removed = manager
            .purge(None, Duration::from_secs(3600))
            .await
            .expect("purge");
        assert_eq!(removed, 0);

        let removed = manager
            .purge(Some(&run_id("run_x")), Duration::ZERO)
            .await
            .expect("purge");
        assert_eq!(removed, 1);
        assert!(dir.path().join("run_y").is_dir());
    }

    #[tokio::test]
    async fn test_failed_setup_removes_run_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = WorkspaceManager::new(dir.path());
        let id = run_id("run_half");

        // A file squatting on `inputs` makes directory setup fail after the
        // lock marker was written.
        let root = run_dir(dir.path(), &id);
        std::fs::create_dir(&root).expect("root");
        std::fs::write(root.join(INPUTS_DIR), "not a directory").expect("squat");

        let err = manager
            .initialize(&id, root.clone())
            .await
            .expect_err("setup should fail");
        assert!(matches!(err, WorkspaceError::Io(_)));
        assert!(!root.exists());

        let ws = manager.acquire(&id).await.expect("run id is reusable");
        assert!(ws.inputs_dir().is_dir());
        assert_eq!(manager.purge(None, Duration::ZERO).await.expect("purge"), 0);
    }

    #[tokio::test]
    async fn test_acquire_after_release_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = WorkspaceManager::new(dir.path());
        let ws = manager.acquire(&run_id("run_once")).await.expect("acquire");
        manager.release(ws).await.expect("release");

        let err = manager
            .acquire(&run_id("run_once"))
            .await
            .expect_err("path reuse");
        assert!(matches!(err, WorkspaceError::AlreadyExists(_)));
    }
}
