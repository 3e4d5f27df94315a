//! In-memory registry of runs and their cancellation tokens.
//!
//! Owned by the run controller and shared by reference; there is no
//! process-wide run map.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::types::{Run, RunError, RunId, RunStatus};

#[derive(Debug)]
struct RunEntry {
    run: Run,
    cancel: CancellationToken,
}

/// Registry of submitted runs.
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    runs: Arc<RwLock<HashMap<RunId, RunEntry>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending run and returns its cancellation token.
    pub async fn insert(&self, id: RunId, workspace: PathBuf) -> Result<CancellationToken, RunError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&id) {
            return Err(RunError::AlreadyExists(id));
        }
        let cancel = CancellationToken::new();
        runs.insert(
            id.clone(),
            RunEntry {
                run: Run::pending(id, workspace),
                cancel: cancel.clone(),
            },
        );
        Ok(cancel)
    }

    /// Moves a run to `status`. Terminal states stamp `finished_at`.
    pub async fn set_status(&self, id: &RunId, status: RunStatus) -> Result<(), RunError> {
        let mut runs = self.runs.write().await;
        let entry = runs
            .get_mut(id)
            .ok_or_else(|| RunError::NotFound(id.clone()))?;
        entry.run.status = status;
        if status.is_terminal() {
            entry.run.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Requests cancellation. Idempotent; a finished run is left as is.
    pub async fn cancel(&self, id: &RunId) -> Result<Run, RunError> {
        let mut runs = self.runs.write().await;
        let entry = runs
            .get_mut(id)
            .ok_or_else(|| RunError::NotFound(id.clone()))?;
        if !entry.run.status.is_terminal() {
            entry.run.cancel_requested = true;
            entry.cancel.cancel();
        }
        Ok(entry.run.clone())
    }

    /// Current view of a run.
    pub async fn get(&self, id: &RunId) -> Option<Run> {
        self.runs.read().await.get(id).map(|e| e.run.clone())
    }

    /// Removes a run unconditionally.
    pub async fn remove(&self, id: &RunId) -> Option<Run> {
        self.runs.write().await.remove(id).map(|e| e.run)
    }

    /// Removes a run that reached a terminal state.
    pub async fn cleanup(&self, id: &RunId) -> Result<Run, RunError> {
        let mut runs = self.runs.write().await;
        let status = runs
            .get(id)
            .map(|e| e.run.status)
            .ok_or_else(|| RunError::NotFound(id.clone()))?;
        if !status.is_terminal() {
            return Err(RunError::NotTerminal(id.clone(), status));
        }
        runs.remove(id)
            .map(|e| e.run)
            .ok_or_else(|| RunError::NotFound(id.clone()))
    }

    /// All registered runs, oldest first.
    pub async fn list(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self.runs.read().await.values().map(|e| e.run.clone()).collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        runs
    }
}
