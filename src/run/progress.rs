//! Background progress reporting for runs.
//!
//! Workers bump shared atomic counters; a monitor task periodically turns
//! them into a [`ProgressSnapshot`], logs it and writes it atomically to
//! `outputs/progress.json`. Snapshots are advisory only.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::RunId;
use crate::store::write_json_atomic;

/// File name of the progress snapshot inside `outputs/`.
pub const PROGRESS_FILE: &str = "progress.json";
const TMP_PREFIX: &str = ".tmp_progress_";
/// `tokio::time::interval` rejects a zero period.
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Point-in-time summary of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub run_id: RunId,
    pub queries: usize,
    /// Stage tasks in the fan-out.
    pub tasks_total: usize,
    /// Tasks that acquired a concurrency permit.
    pub admitted: usize,
    /// Tasks currently executing.
    pub in_flight: usize,
    /// Tasks with a terminal result.
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Lead records consolidated so far.
    pub records: usize,
    pub elapsed_secs: f64,
    pub updated_at: DateTime<Utc>,
}

/// Shared atomic counters for run progress.
///
/// Cloned into the coordinator and controller and incremented with
/// `fetch_add`.
#[derive(Debug, Clone, Default)]
pub struct ProgressCounters {
    pub queries: Arc<AtomicUsize>,
    pub tasks_total: Arc<AtomicUsize>,
    pub admitted: Arc<AtomicUsize>,
    pub in_flight: Arc<AtomicUsize>,
    pub completed: Arc<AtomicUsize>,
    pub succeeded: Arc<AtomicUsize>,
    pub failed: Arc<AtomicUsize>,
    pub records: Arc<AtomicUsize>,
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a snapshot of the current counter values.
    pub fn snapshot(&self, run_id: &RunId, start: Instant) -> ProgressSnapshot {
        ProgressSnapshot {
            run_id: run_id.clone(),
            queries: self.queries.load(Ordering::Relaxed),
            tasks_total: self.tasks_total.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            elapsed_secs: start.elapsed().as_secs_f64(),
            updated_at: Utc::now(),
        }
    }
}

/// A background task that periodically logs and persists run progress.
///
/// Call [`ProgressMonitor::stop`] to end it and write a final snapshot.
pub struct ProgressMonitor {
    run_id: RunId,
    counters: ProgressCounters,
    path: PathBuf,
    start: Instant,
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Start a monitor writing to `<outputs_dir>/progress.json` every
    /// `interval` (at least 10 ms).
    pub fn start(
        run_id: RunId,
        counters: ProgressCounters,
        outputs_dir: PathBuf,
        interval: Duration,
    ) -> Self {
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let start = Instant::now();
        let path = outputs_dir.join(PROGRESS_FILE);

        let task_run_id = run_id.clone();
        let task_counters = counters.clone();
        let task_path = path.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval.max(MIN_INTERVAL));
            tick.tick().await; // skip the immediate first tick

            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = tick.tick() => {}
                }

                let snap = task_counters.snapshot(&task_run_id, start);
                tracing::info!(
                    run_id = %snap.run_id,
                    tasks_total = snap.tasks_total,
                    in_flight = snap.in_flight,
                    completed = snap.completed,
                    succeeded = snap.succeeded,
                    failed = snap.failed,
                    records = snap.records,
                    elapsed_secs = format!("{:.1}", snap.elapsed_secs),
                    "Run progress"
                );
                persist(task_path.clone(), snap).await;
            }
        });

        Self {
            run_id,
            counters,
            path,
            start,
            stop,
            handle: Some(handle),
        }
    }

    /// Stop the monitor, wait for it and write the final snapshot.
    pub async fn stop(mut self) -> ProgressSnapshot {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        let snap = self.counters.snapshot(&self.run_id, self.start);
        persist(self.path.clone(), snap.clone()).await;
        snap
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn persist(path: PathBuf, snap: ProgressSnapshot) {
    let written =
        tokio::task::spawn_blocking(move || write_json_atomic(&path, &snap, TMP_PREFIX, None))
            .await;
    match written {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "Failed to write progress snapshot"),
        Err(e) => tracing::warn!(error = %e, "Progress writer task failed"),
    }
}

/// Reads a persisted snapshot, if any.
pub async fn read_snapshot(outputs_dir: PathBuf) -> Option<ProgressSnapshot> {
    let content = tokio::fs::read_to_string(outputs_dir.join(PROGRESS_FILE))
        .await
        .ok()?;
    serde_json::from_str(&content).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_id() -> RunId {
        RunId::parse("run_progress").expect("run id")
    }

    #[test]
    fn test_progress_counters_default() {
        let counters = ProgressCounters::new();
        let snap = counters.snapshot(&run_id(), Instant::now());
        assert_eq!(snap.tasks_total, 0);
        assert_eq!(snap.completed, 0);
        assert_eq!(snap.records, 0);
    }

    #[test]
    fn test_progress_counters_clone_shares_state() {
        let counters = ProgressCounters::new();
        let clone = counters.clone();

        counters.succeeded.fetch_add(2, Ordering::Relaxed);
        counters.records.fetch_add(5, Ordering::Relaxed);

        let snap = clone.snapshot(&run_id(), Instant::now());
        assert_eq!(snap.succeeded, 2);
        assert_eq!(snap.records, 5);
    }

    #[tokio::test]
    async fn test_zero_interval_is_clamped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let counters = ProgressCounters::new();

        let monitor = ProgressMonitor::start(
            run_id(),
            counters.clone(),
            dir.path().to_path_buf(),
            Duration::ZERO,
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(read_snapshot(dir.path().to_path_buf()).await.is_some());

        counters.records.fetch_add(3, Ordering::Relaxed);
        assert_eq!(monitor.stop().await.records, 3);
    }

    #[tokio::test]
    async fn test_monitor_writes_snapshots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let counters = ProgressCounters::new();
        counters.tasks_total.fetch_add(8, Ordering::Relaxed);

        let monitor = ProgressMonitor::start(
            run_id(),
            counters.clone(),
            dir.path().to_path_buf(),
            Duration::from_millis(20),
        );
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(read_snapshot(dir.path().to_path_buf()).await.is_some());

        counters.completed.fetch_add(8, Ordering::Relaxed);
        let last = monitor.stop().await;

        assert_eq!(last.completed, 8);
        let persisted = read_snapshot(dir.path().to_path_buf())
            .await
            .expect("snapshot");
        assert_eq!(persisted.completed, 8);
        assert_eq!(persisted.tasks_total, 8);
    }
}
