//! Run controller: drives one run from submission to a terminal state.
//!
//! A run moves `pending → running → {completed, partially_failed,
//! cancelled, failed}`. The controller acquires the workspace, plans the
//! queries, fans them out across agent kinds, routes every stage result
//! through the validation gate and appends accepted records to the
//! consolidated file. Task-local failures are logged and the run goes on;
//! an I/O failure of the workspace or the store ends the run as `failed`.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::progress::{ProgressCounters, ProgressMonitor};
use super::registry::RunRegistry;
use super::types::{
    ErrorLogEntry, QuerySource, Run, RunError, RunId, RunReport, RunRequest, RunStatus,
    RunSummary,
};
use crate::agents::{ResearchAgent, Structurer};
use crate::config::ForgeConfig;
use crate::error::ErrorKind;
use crate::intake::{IntakeError, Query, QueryPlanner};
use crate::metrics::LeadMetrics;
use crate::pool::AgentPoolCoordinator;
use crate::stage::StageExecutor;
use crate::store::{write_json_atomic, ConsolidationStore};
use crate::validation::{Rejected, Validated, ValidationGate};
use crate::workspace::{run_dir, Workspace, WorkspaceError, WorkspaceManager};

/// Error log file inside `outputs/`.
pub const ERRORS_FILE: &str = "errors.json";
/// Run summary file inside `outputs/`.
pub const METRICS_FILE: &str = "pipeline_metrics.json";
/// Constraints input inside `inputs/`.
pub const INTAKE_INPUT: &str = "intake.json";
/// Query list input inside `inputs/`.
pub const QUERIES_INPUT: &str = "queries.json";

const TMP_PREFIX: &str = ".tmp_report_";

/// Handle to a run spawned with [`RunController::submit`].
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    registry: RunRegistry,
    join: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Requests cancellation through the controller's registry.
    pub async fn cancel(&self) -> Result<Run, RunError> {
        self.registry.cancel(&self.run_id).await
    }

    /// Waits for the run to reach a terminal state.
    pub async fn wait(self) -> Result<RunReport, RunError> {
        self.join
            .await
            .map_err(|e| RunError::Aborted(e.to_string()))
    }
}

/// A registered run that owns (or failed to acquire) its workspace.
struct PreparedRun {
    run_id: RunId,
    source: QuerySource,
    cancel: CancellationToken,
    workspace: Result<Workspace, WorkspaceError>,
    started: Instant,
}

/// Drives runs end to end.
pub struct RunController {
    config: ForgeConfig,
    executor: Arc<StageExecutor>,
    gate: Arc<ValidationGate>,
    planner: Arc<dyn QueryPlanner>,
    workspaces: WorkspaceManager,
    store: Arc<ConsolidationStore>,
    registry: RunRegistry,
    run_slots: Arc<Semaphore>,
    metrics: Option<Arc<LeadMetrics>>,
}

impl std::fmt::Debug for RunController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunController")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RunController {
    /// Creates a controller over the given collaborators.
    pub fn new(
        config: ForgeConfig,
        agent: Arc<dyn ResearchAgent>,
        structurer: Arc<dyn Structurer>,
        planner: Arc<dyn QueryPlanner>,
    ) -> Self {
        let gate = ValidationGate::new(structurer, config.structuring_retry_delay);
        Self {
            executor: Arc::new(StageExecutor::new(agent)),
            gate: Arc::new(gate),
            planner,
            workspaces: WorkspaceManager::new(config.runs_dir.clone()),
            store: Arc::new(ConsolidationStore::new(
                config.runs_dir.clone(),
                config.backup_retention,
            )),
            registry: RunRegistry::new(),
            run_slots: Arc::new(Semaphore::new(config.max_concurrent_runs.max(1))),
            metrics: None,
            config,
        }
    }

    /// Records run, stage and structuring metrics into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<LeadMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    pub fn store(&self) -> &ConsolidationStore {
        &self.store
    }

    /// Starts a run in the background.
    ///
    /// Fails with [`RunError::AlreadyExists`] if the run ID is registered or
    /// its workspace exists; the run is then not registered.
    pub async fn submit(self: &Arc<Self>, request: RunRequest) -> Result<RunHandle, RunError> {
        let prepared = self.prepare(request).await?;
        let run_id = prepared.run_id.clone();

        let controller = Arc::clone(self);
        let join = tokio::spawn(async move { controller.drive(prepared).await });

        Ok(RunHandle {
            run_id,
            registry: self.registry.clone(),
            join,
        })
    }

    /// Runs to completion on the current task.
    ///
    /// Only a submission-time collision is returned as an error; every
    /// other failure is folded into the report.
    pub async fn execute(&self, request: RunRequest) -> Result<RunReport, RunError> {
        let prepared = self.prepare(request).await?;
        Ok(self.drive(prepared).await)
    }

    /// Requests cancellation of a run. Idempotent.
    pub async fn cancel(&self, run_id: &RunId) -> Result<Run, RunError> {
        let run = self.registry.cancel(run_id).await?;
        tracing::info!(run_id = %run_id, status = %run.status, "Run cancellation requested");
        Ok(run)
    }

    /// Current state of a run.
    pub async fn status(&self, run_id: &RunId) -> Result<Run, RunError> {
        self.registry
            .get(run_id)
            .await
            .ok_or_else(|| RunError::NotFound(run_id.clone()))
    }

    /// Forgets a finished run. Its workspace stays on disk until purged.
    pub async fn cleanup(&self, run_id: &RunId) -> Result<Run, RunError> {
        let run = self.registry.cleanup(run_id).await?;
        self.store.forget(run_id).await;
        Ok(run)
    }

    /// Purges unlocked workspaces older than the configured purge age.
    pub async fn purge(&self, run_id: Option<&RunId>) -> Result<usize, WorkspaceError> {
        self.workspaces.purge(run_id, self.config.purge_age).await
    }

    async fn prepare(&self, request: RunRequest) -> Result<PreparedRun, RunError> {
        let run_id = request.run_id.unwrap_or_else(RunId::generate);
        let cancel = self
            .registry
            .insert(run_id.clone(), run_dir(&self.config.runs_dir, &run_id))
            .await?;

        let workspace = match self.workspaces.acquire(&run_id).await {
            Ok(workspace) => {
                self.registry.set_status(&run_id, RunStatus::Running).await?;
                Ok(workspace)
            }
            Err(WorkspaceError::AlreadyExists(_)) => {
                self.registry.remove(&run_id).await;
                tracing::warn!(run_id = %run_id, "Run workspace already exists");
                return Err(RunError::AlreadyExists(run_id));
            }
            Err(e) => Err(e),
        };

        tracing::info!(run_id = %run_id, "Run submitted");
        Ok(PreparedRun {
            run_id,
            source: request.source,
            cancel,
            workspace,
            started: Instant::now(),
        })
    }

    async fn drive(&self, prepared: PreparedRun) -> RunReport {
        let PreparedRun {
            run_id,
            source,
            cancel,
            workspace,
            started,
        } = prepared;

        let workspace = match workspace {
            Ok(workspace) => workspace,
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Workspace acquisition failed");
                let errors = vec![ErrorLogEntry::run_level(
                    ErrorKind::IoFailure,
                    format!("workspace acquisition failed: {}", e),
                )];
                let summary = RunSummary {
                    elapsed_secs: started.elapsed().as_secs_f64(),
                    ..Default::default()
                };
                return self.finish(&run_id, RunStatus::Failed, summary, errors).await;
            }
        };

        let counters = ProgressCounters::new();
        let mut summary = RunSummary::default();
        let mut errors: Vec<ErrorLogEntry> = Vec::new();
        let mut fatal = false;

        // Held until the run is finished; `None` means cancelled while queued.
        let slot = self.wait_for_slot(&run_id, &cancel).await;

        let mut queries = Vec::new();
        if slot.is_some() {
            match self.plan(&workspace, source).await {
                Ok(planned) => queries = planned,
                Err(entry) => {
                    tracing::error!(run_id = %run_id, kind = %entry.kind, error = %entry.message, "Query planning failed");
                    errors.push(entry);
                    fatal = true;
                }
            }
        }
        summary.total_queries = queries.len();
        counters.queries.store(queries.len(), Ordering::Relaxed);

        let monitor = ProgressMonitor::start(
            run_id.clone(),
            counters.clone(),
            workspace.outputs_dir(),
            self.config.progress_interval,
        );

        if slot.is_some() && !fatal {
            tracing::info!(
                run_id = %run_id,
                queries = queries.len(),
                agents = self.config.agent_kinds.len(),
                max_concurrency = self.config.max_concurrency,
                "Run started"
            );
            fatal = self
                .fan_out(&run_id, &queries, &cancel, &counters, &mut summary, &mut errors)
                .await;
        }

        let cancelled = !fatal && cancel.is_cancelled();
        summary.elapsed_secs = started.elapsed().as_secs_f64();

        let outputs = workspace.outputs_dir();
        if let Err(e) = write_report_file(&outputs.join(ERRORS_FILE), &errors).await {
            tracing::error!(run_id = %run_id, error = %e, "Failed to write error log");
            fatal = true;
        }
        if let Err(e) = write_report_file(&outputs.join(METRICS_FILE), &summary).await {
            tracing::error!(run_id = %run_id, error = %e, "Failed to write run summary");
            fatal = true;
        }

        let status = final_status(fatal, cancelled, summary.records_consolidated, errors.len());

        monitor.stop().await;
        if let Err(e) = self.workspaces.release(workspace).await {
            tracing::error!(run_id = %run_id, error = %e, "Failed to release workspace lock");
        }

        drop(slot);
        self.finish(&run_id, status, summary, errors).await
    }

    /// Waits for one of the `max_concurrent_runs` slots.
    ///
    /// Returns `None` if the run is cancelled first.
    async fn wait_for_slot(
        &self,
        run_id: &RunId,
        cancel: &CancellationToken,
    ) -> Option<OwnedSemaphorePermit> {
        if self.run_slots.available_permits() == 0 {
            tracing::info!(
                run_id = %run_id,
                max_concurrent_runs = self.config.max_concurrent_runs,
                "Run queued, waiting for a free slot"
            );
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(run_id = %run_id, "Run cancelled while queued");
                None
            }
            permit = self.run_slots.clone().acquire_owned() => permit.ok(),
        }
    }

    /// Writes the inputs and resolves the run's queries.
    async fn plan(
        &self,
        workspace: &Workspace,
        source: QuerySource,
    ) -> Result<Vec<Query>, ErrorLogEntry> {
        let io_entry = |e: WorkspaceError| {
            ErrorLogEntry::run_level(e.kind(), format!("failed to write inputs: {}", e))
        };

        let queries = match source {
            QuerySource::Queries(texts) => Query::from_texts(texts),
            QuerySource::Constraints(constraints) => {
                workspace
                    .write_input(INTAKE_INPUT, &constraints)
                    .await
                    .map_err(io_entry)?;
                self.planner.plan(&constraints).await.map_err(|e| {
                    let kind = match e {
                        IntakeError::Provider(_) => ErrorKind::ProviderError,
                        _ => ErrorKind::Invalid,
                    };
                    ErrorLogEntry::run_level(kind, format!("query planning failed: {}", e))
                })?
            }
        };

        if queries.is_empty() {
            return Err(ErrorLogEntry::run_level(
                ErrorKind::Invalid,
                "no search queries to run",
            ));
        }

        workspace
            .write_input(QUERIES_INPUT, &queries)
            .await
            .map_err(io_entry)?;
        Ok(queries)
    }

    /// Runs the fan-out and persists accepted records.
    ///
    /// Returns true if the store failed.
    async fn fan_out(
        &self,
        run_id: &RunId,
        queries: &[Query],
        cancel: &CancellationToken,
        counters: &ProgressCounters,
        summary: &mut RunSummary,
        errors: &mut Vec<ErrorLogEntry>,
    ) -> bool {
        let max_concurrency = self.config.max_concurrency.max(1);
        let pool = AgentPoolCoordinator::new(
            self.executor.clone(),
            self.config.stage_timeout,
            self.config.cancel_grace,
            self.config.structuring_attempts,
        )
        .with_counters(counters.clone());

        let gate = self.gate.clone();
        let metrics = self.metrics.clone();
        let mut validated = pool
            .fan_out(
                queries,
                &self.config.agent_kinds,
                max_concurrency,
                cancel.clone(),
            )
            .map(move |result| {
                let gate = gate.clone();
                let metrics = metrics.clone();
                async move {
                    if let Some(m) = &metrics {
                        m.record_stage(&result);
                    }
                    let verdict = gate.validate(&result).await;
                    (result, verdict)
                }
            })
            .buffer_unordered(max_concurrency)
            .boxed();

        let mut store_failed = false;
        while let Some((result, verdict)) = validated.next().await {
            summary.total_tasks += 1;
            match verdict {
                Ok(Validated { records, attempts }) => {
                    summary.successful_tasks += 1;
                    if let Some(m) = &self.metrics {
                        m.record_structuring(attempts, true);
                    }
                    if records.is_empty() || store_failed {
                        continue;
                    }

                    match self.store.append(run_id, &records).await {
                        Ok(total) => {
                            let with_contact = records.iter().filter(|r| r.has_contact()).count();
                            summary.records_consolidated += records.len();
                            summary.records_with_contact += with_contact;
                            counters.records.fetch_add(records.len(), Ordering::Relaxed);
                            if let Some(m) = &self.metrics {
                                m.record_leads(records.len());
                            }
                            tracing::info!(
                                run_id = %run_id,
                                task_id = %result.task.id,
                                agent = %result.task.agent,
                                records = records.len(),
                                total,
                                "Lead records consolidated"
                            );
                        }
                        Err(e) => {
                            tracing::error!(
                                run_id = %run_id,
                                task_id = %result.task.id,
                                error = %e,
                                "Consolidated file write failed, cancelling run"
                            );
                            errors.push(ErrorLogEntry {
                                task_id: Some(result.task.id),
                                agent: Some(result.task.agent),
                                query: Some(result.task.query.text.clone()),
                                kind: ErrorKind::IoFailure,
                                message: format!("consolidated file write failed: {}", e),
                                attempts,
                                at: chrono::Utc::now(),
                            });
                            store_failed = true;
                            cancel.cancel();
                        }
                    }
                }
                Err(Rejected { error, attempts }) => {
                    summary.failed_tasks += 1;
                    if attempts > 0 {
                        if let Some(m) = &self.metrics {
                            m.record_structuring(attempts, false);
                        }
                    }
                    errors.push(ErrorLogEntry::for_task(&result.task, &error, attempts));
                }
            }
        }

        store_failed
    }

    async fn finish(
        &self,
        run_id: &RunId,
        status: RunStatus,
        summary: RunSummary,
        errors: Vec<ErrorLogEntry>,
    ) -> RunReport {
        if let Err(e) = self.registry.set_status(run_id, status).await {
            tracing::warn!(run_id = %run_id, error = %e, "Run vanished from registry");
        }
        let run = self
            .registry
            .get(run_id)
            .await
            .unwrap_or_else(|| {
                let mut run = Run::pending(run_id.clone(), run_dir(&self.config.runs_dir, run_id));
                run.status = status;
                run
            });

        if let Some(m) = &self.metrics {
            m.record_run(status, summary.elapsed_secs, summary.records_with_contact);
        }

        let report = RunReport {
            run,
            summary,
            errors,
            consolidated_path: self.store.path(run_id),
        };

        tracing::info!(
            run_id = %run_id,
            status = %status,
            tasks = report.summary.total_tasks,
            failed_tasks = report.summary.failed_tasks,
            records = report.summary.records_consolidated,
            elapsed_secs = format!("{:.1}", report.summary.elapsed_secs),
            "Run finished"
        );
        report
    }
}

/// Terminal status from the run's outcome.
fn final_status(fatal: bool, cancelled: bool, records: usize, errors: usize) -> RunStatus {
    if fatal {
        RunStatus::Failed
    } else if cancelled {
        RunStatus::Cancelled
    } else if records > 0 && errors == 0 {
        RunStatus::Completed
    } else if records > 0 {
        RunStatus::PartiallyFailed
    } else {
        RunStatus::Failed
    }
}

async fn write_report_file<T>(path: &Path, value: &T) -> Result<(), crate::store::StoreError>
where
    T: Serialize + Clone + Send + 'static,
{
    let path: PathBuf = path.to_path_buf();
    let value = value.clone();
    tokio::task::spawn_blocking(move || write_json_atomic(&path, &value, TMP_PREFIX, None))
        .await
        .map_err(|e| crate::store::StoreError::Join(e.to_string()))?
}
