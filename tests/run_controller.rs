//! End-to-end tests for the run controller with in-memory collaborators.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use lead_forge::agents::{
    AgentError, AgentKind, AgentResult, PassthroughStructurer, RawPayload, ResearchAgent,
    StructuringError, Structurer,
};
use lead_forge::config::ForgeConfig;
use lead_forge::error::ErrorKind;
use lead_forge::intake::{IntakeConstraints, KeywordQueryPlanner, Query};
use lead_forge::metrics::LeadMetrics;
use lead_forge::run::{
    ErrorLogEntry, RunController, RunError, RunId, RunRequest, RunStatus, RunSummary,
    ERRORS_FILE, METRICS_FILE, PROGRESS_FILE,
};
use lead_forge::stage::Attempt;
use lead_forge::store::CONSOLIDATED_FILE;
use lead_forge::workspace::{outputs_dir, run_dir, INPUTS_DIR, LOCK_FILE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Leads,
    Empty,
    Fail,
    Malformed,
    Hang,
}

type Hook = Box<dyn FnOnce() + Send>;

struct FakeAgent {
    behavior: HashMap<AgentKind, Behavior>,
    fixed: Option<Value>,
    delay: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
    first_call: Mutex<Option<Hook>>,
}

impl FakeAgent {
    fn new() -> Self {
        Self {
            behavior: HashMap::new(),
            fixed: None,
            delay: Duration::from_millis(5),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            first_call: Mutex::new(None),
        }
    }

    fn with(mut self, kind: AgentKind, behavior: Behavior) -> Self {
        self.behavior.insert(kind, behavior);
        self
    }

    fn returning(mut self, value: Value) -> Self {
        self.fixed = Some(value);
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn on_first_call(self, hook: impl FnOnce() + Send + 'static) -> Self {
        *self.first_call.lock().expect("hook lock") = Some(Box::new(hook));
        self
    }
}

#[async_trait]
impl ResearchAgent for FakeAgent {
    async fn research(&self, kind: AgentKind, query: &Query) -> AgentResult<RawPayload> {
        if let Some(hook) = self.first_call.lock().expect("hook lock").take() {
            hook();
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let behavior = self
            .behavior
            .get(&kind)
            .copied()
            .unwrap_or(Behavior::Leads);
        let delay = if behavior == Behavior::Hang {
            Duration::from_secs(3600)
        } else {
            self.delay
        };
        tokio::time::sleep(delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        match behavior {
            Behavior::Fail => Err(AgentError::Provider(format!("{} search failed", kind))),
            Behavior::Malformed => Ok(RawPayload::SingleItem(Value::String(
                "Sorry, I could not find anything useful.".to_string(),
            ))),
            Behavior::Empty => Ok(RawPayload::from_value(json!({"leads": []}))),
            Behavior::Leads | Behavior::Hang => {
                if let Some(fixed) = &self.fixed {
                    return Ok(RawPayload::from_value(fixed.clone()));
                }
                Ok(RawPayload::from_value(json!({
                    "leads": [{
                        "name": format!("{} lead {}", kind, query.index),
                        "site": format!("{}{}.example.com", kind, query.index),
                        "email": format!("info@{}{}.example.com", kind, query.index),
                    }]
                })))
            }
        }
    }
}

#[derive(Default)]
struct CountingStructurer {
    inner: PassthroughStructurer,
    calls: AtomicUsize,
}

#[async_trait]
impl Structurer for CountingStructurer {
    async fn structure(
        &self,
        payload: &RawPayload,
        attempt: &Attempt,
        feedback: Option<&str>,
    ) -> Result<Vec<Map<String, Value>>, StructuringError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.structure(payload, attempt, feedback).await
    }
}

fn config(runs_dir: &Path) -> ForgeConfig {
    ForgeConfig::default()
        .with_runs_dir(runs_dir)
        .with_max_concurrency(4)
        .with_stage_timeout(Duration::from_secs(5))
        .with_cancel_grace(Duration::from_millis(500))
        .with_structuring_retry_delay(Duration::from_millis(1))
        .with_progress_interval(Duration::from_millis(20))
}

fn controller(
    config: ForgeConfig,
    agent: Arc<FakeAgent>,
    structurer: Arc<CountingStructurer>,
) -> RunController {
    RunController::new(config, agent, structurer, Arc::new(KeywordQueryPlanner::new()))
}

fn run_id(s: &str) -> RunId {
    RunId::parse(s).expect("run id")
}

fn queries(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("dental clinic city{}", i)).collect()
}

fn read_json<T: serde::de::DeserializeOwned>(path: PathBuf) -> T {
    let content = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("read {}: {}", path.display(), e));
    serde_json::from_str(&content).expect("parse json")
}

fn consolidated(runs_dir: &Path, id: &RunId) -> Vec<Value> {
    let file: Value = read_json(outputs_dir(runs_dir, id).join(CONSOLIDATED_FILE));
    file["leads"].as_array().cloned().unwrap_or_default()
}

#[tokio::test]
async fn test_all_tasks_succeed_completes_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let agent = Arc::new(FakeAgent::new());
    let structurer = Arc::new(CountingStructurer::default());
    let controller = controller(config(dir.path()), agent, structurer);

    let report = controller
        .execute(RunRequest::from_queries(queries(2)).with_run_id(run_id("run_ok")))
        .await
        .expect("execute");

    assert_eq!(report.run.status, RunStatus::Completed);
    assert!(report.run.finished_at.is_some());
    assert_eq!(report.summary.total_queries, 2);
    assert_eq!(report.summary.total_tasks, 8);
    assert_eq!(report.summary.records_consolidated, 8);
    assert_eq!(report.summary.records_with_contact, 8);
    assert!(report.errors.is_empty());

    let id = run_id("run_ok");
    assert_eq!(consolidated(dir.path(), &id).len(), 8);
    assert!(!run_dir(dir.path(), &id).join(LOCK_FILE).exists());
    assert!(run_dir(dir.path(), &id)
        .join(INPUTS_DIR)
        .join("queries.json")
        .exists());
    assert!(outputs_dir(dir.path(), &id).join(PROGRESS_FILE).exists());

    let summary: RunSummary = read_json(outputs_dir(dir.path(), &id).join(METRICS_FILE));
    assert_eq!(summary.records_consolidated, 8);
}

#[tokio::test]
async fn test_partial_failure_counts_match() {
    let dir = tempfile::tempdir().expect("tempdir");
    let agent = Arc::new(
        FakeAgent::new()
            .with(AgentKind::Facebook, Behavior::Fail)
            .with(AgentKind::Gmap, Behavior::Malformed),
    );
    let structurer = Arc::new(CountingStructurer::default());
    let controller = controller(config(dir.path()), agent, structurer);

    let report = controller
        .execute(RunRequest::from_queries(queries(2)).with_run_id(run_id("run_partial")))
        .await
        .expect("execute");

    assert_eq!(report.run.status, RunStatus::PartiallyFailed);
    assert_eq!(report.summary.total_tasks, 8);
    assert_eq!(report.summary.successful_tasks, 4);
    assert_eq!(report.summary.failed_tasks, 4);
    assert_eq!(report.summary.records_consolidated, 4);
    assert_eq!(report.count_errors(ErrorKind::ProviderError), 2);
    assert_eq!(report.count_errors(ErrorKind::Invalid), 2);
    assert!(report
        .errors
        .iter()
        .filter(|e| e.kind == ErrorKind::Invalid)
        .all(|e| e.attempts == 3 && e.agent == Some(AgentKind::Gmap)));

    let id = run_id("run_partial");
    let logged: Vec<ErrorLogEntry> = read_json(outputs_dir(dir.path(), &id).join(ERRORS_FILE));
    assert_eq!(logged.len(), 4);
    let sources: Vec<String> = consolidated(dir.path(), &id)
        .iter()
        .map(|lead| lead["source"].as_str().unwrap_or_default().to_string())
        .collect();
    assert!(sources.iter().all(|s| s == "linkedin" || s == "website"));
}

#[tokio::test]
async fn test_malformed_payload_retries_are_bounded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let agent = Arc::new(FakeAgent::new().with(AgentKind::Website, Behavior::Malformed));
    let structurer = Arc::new(CountingStructurer::default());
    let config = config(dir.path()).with_agent_kinds(vec![AgentKind::Website]);
    let controller = controller(config, agent, structurer.clone());

    let report = controller
        .execute(RunRequest::from_queries(queries(1)))
        .await
        .expect("execute");

    assert_eq!(structurer.calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].kind, ErrorKind::Invalid);
    assert_eq!(report.run.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_concurrency_limit_holds_for_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let agent = Arc::new(FakeAgent::new().with_delay(Duration::from_millis(20)));
    let structurer = Arc::new(CountingStructurer::default());
    let controller = controller(
        config(dir.path()).with_max_concurrency(2),
        agent.clone(),
        structurer,
    );

    let report = controller
        .execute(RunRequest::from_queries(queries(3)))
        .await
        .expect("execute");

    assert_eq!(report.summary.total_tasks, 12);
    assert_eq!(agent.calls.load(Ordering::SeqCst), 12);
    assert!(agent.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_cancel_ends_run_as_cancelled() {
    let dir = tempfile::tempdir().expect("tempdir");
    let agent = Arc::new(
        FakeAgent::new()
            .with(AgentKind::Linkedin, Behavior::Hang)
            .with(AgentKind::Facebook, Behavior::Hang)
            .with(AgentKind::Website, Behavior::Hang)
            .with(AgentKind::Gmap, Behavior::Hang),
    );
    let structurer = Arc::new(CountingStructurer::default());
    let controller = Arc::new(controller(
        config(dir.path()).with_max_concurrency(2),
        agent.clone(),
        structurer,
    ));

    let handle = controller
        .submit(RunRequest::from_queries(queries(2)))
        .await
        .expect("submit");
    let id = handle.run_id().clone();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let started = Instant::now();
    controller.cancel(&id).await.expect("cancel");
    let report = handle.wait().await.expect("wait");

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.run.status, RunStatus::Cancelled);
    assert!(report.run.cancel_requested);
    assert_eq!(report.summary.total_tasks, 8);
    assert_eq!(report.count_errors(ErrorKind::Cancelled), 8);
    assert_eq!(agent.calls.load(Ordering::SeqCst), 2);
    assert!(!run_dir(dir.path(), &id).join(LOCK_FILE).exists());

    let status = controller.status(&id).await.expect("status");
    assert_eq!(status.status, RunStatus::Cancelled);
    controller.cleanup(&id).await.expect("cleanup");
    assert!(matches!(
        controller.status(&id).await,
        Err(RunError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_same_payload_yields_same_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let agent = Arc::new(FakeAgent::new().returning(json!({"name": "Acme", "site": "acme.com"})));
    let structurer = Arc::new(CountingStructurer::default());
    let config = config(dir.path()).with_agent_kinds(vec![AgentKind::Website]);
    let controller = controller(config, agent, structurer);

    for id in ["run_det_a", "run_det_b"] {
        controller
            .execute(RunRequest::from_queries(queries(1)).with_run_id(run_id(id)))
            .await
            .expect("execute");
    }

    let first = consolidated(dir.path(), &run_id("run_det_a"));
    let second = consolidated(dir.path(), &run_id("run_det_b"));
    assert_eq!(first, second);
    assert_eq!(
        first,
        vec![json!({
            "company": "Acme",
            "website": "acme.com",
            "email": "unknown",
            "phone": "unknown",
            "location": "unknown",
            "description": "unknown",
            "source": "website",
            "source_urls": []
        })]
    );
}

#[tokio::test]
async fn test_duplicate_run_id_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let agent = Arc::new(FakeAgent::new());
    let structurer = Arc::new(CountingStructurer::default());
    let first = controller(config(dir.path()), agent.clone(), structurer.clone());

    first
        .execute(RunRequest::from_queries(queries(1)).with_run_id(run_id("run_dup")))
        .await
        .expect("first run");
    let before = consolidated(dir.path(), &run_id("run_dup"));

    let again = first
        .execute(RunRequest::from_queries(queries(1)).with_run_id(run_id("run_dup")))
        .await;
    assert!(matches!(again, Err(RunError::AlreadyExists(_))));

    // A fresh controller has an empty registry; the workspace still collides.
    let second = controller(config(dir.path()), agent, structurer);
    let collided = second
        .execute(RunRequest::from_queries(queries(1)).with_run_id(run_id("run_dup")))
        .await;
    assert!(matches!(collided, Err(RunError::AlreadyExists(_))));
    assert!(second.registry().list().await.is_empty());
    assert_eq!(consolidated(dir.path(), &run_id("run_dup")), before);
}

#[tokio::test]
async fn test_zero_records_fails_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let agent = Arc::new(
        FakeAgent::new()
            .with(AgentKind::Linkedin, Behavior::Empty)
            .with(AgentKind::Facebook, Behavior::Empty)
            .with(AgentKind::Website, Behavior::Empty)
            .with(AgentKind::Gmap, Behavior::Empty),
    );
    let structurer = Arc::new(CountingStructurer::default());
    let controller = controller(config(dir.path()), agent, structurer);

    let report = controller
        .execute(RunRequest::from_queries(queries(1)))
        .await
        .expect("execute");

    assert_eq!(report.summary.successful_tasks, 4);
    assert_eq!(report.summary.records_consolidated, 0);
    assert!(report.errors.is_empty());
    assert_eq!(report.run.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_store_failure_fails_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let id = run_id("run_store_fail");

    // Occupy the consolidated file path with a directory once the run is live.
    let blocker = outputs_dir(dir.path(), &id).join(CONSOLIDATED_FILE);
    let agent = Arc::new(FakeAgent::new().on_first_call(move || {
        std::fs::create_dir_all(&blocker).expect("blocker");
    }));
    let structurer = Arc::new(CountingStructurer::default());
    let controller = controller(
        config(dir.path()).with_max_concurrency(1),
        agent,
        structurer,
    );

    let report = controller
        .execute(RunRequest::from_queries(queries(2)).with_run_id(id.clone()))
        .await
        .expect("execute");

    assert_eq!(report.run.status, RunStatus::Failed);
    assert_eq!(report.count_errors(ErrorKind::IoFailure), 1);
    assert_eq!(report.summary.records_consolidated, 0);
    assert!(report.summary.total_tasks <= 8);
    assert!(!run_dir(dir.path(), &id).join(LOCK_FILE).exists());
}

#[tokio::test]
async fn test_interrupted_write_keeps_consolidated_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let agent = Arc::new(FakeAgent::new());
    let structurer = Arc::new(CountingStructurer::default());
    let controller = controller(config(dir.path()), agent, structurer);
    let id = run_id("run_crash");

    controller
        .execute(RunRequest::from_queries(queries(1)).with_run_id(id.clone()))
        .await
        .expect("execute");
    let target = outputs_dir(dir.path(), &id).join(CONSOLIDATED_FILE);
    let before = std::fs::read(&target).expect("read");

    // A writer killed between temp write and rename leaves only the temp file.
    let partial = outputs_dir(dir.path(), &id).join(".tmp_leads_killed.json");
    std::fs::write(&partial, b"{\n  \"leads\": [\n    {\"company\": \"Trunc").expect("write");

    assert_eq!(std::fs::read(&target).expect("read"), before);
    let leads = controller.store().read(&id).await.expect("read store");
    assert_eq!(leads.len(), 4);
}

#[tokio::test]
async fn test_constraints_are_planned_and_recorded() {
    let dir = tempfile::tempdir().expect("tempdir");
    let agent = Arc::new(FakeAgent::new());
    let structurer = Arc::new(CountingStructurer::default());
    let metrics = Arc::new(LeadMetrics::new().expect("metrics"));
    let controller = controller(
        config(dir.path()).with_agent_kinds(vec![AgentKind::Website]),
        agent,
        structurer,
    )
    .with_metrics(metrics.clone());

    let constraints: IntakeConstraints = serde_json::from_value(json!({
        "project": "dental",
        "entity_type": "company",
        "targets": {
            "entity_subtype": ["dental clinic"],
            "locations": ["Austin, TX"],
            "keywords": ["family dentist", "orthodontics"]
        }
    }))
    .expect("constraints");
    let id = run_id("run_planned");

    let report = controller
        .execute(RunRequest::from_constraints(constraints).with_run_id(id.clone()))
        .await
        .expect("execute");

    assert!((3..=5).contains(&report.summary.total_queries));
    assert_eq!(report.run.status, RunStatus::Completed);
    let inputs = run_dir(dir.path(), &id).join(INPUTS_DIR);
    assert!(inputs.join("intake.json").exists());
    let planned: Vec<Query> = read_json(inputs.join("queries.json"));
    assert_eq!(planned.len(), report.summary.total_queries);

    let exported = metrics.export();
    assert!(exported.contains(r#"lead_forge_runs_total{status="completed"} 1"#));
}

#[tokio::test]
async fn test_unusable_constraints_fail_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let agent = Arc::new(FakeAgent::new());
    let structurer = Arc::new(CountingStructurer::default());
    let controller = controller(config(dir.path()), agent.clone(), structurer);

    let report = controller
        .execute(RunRequest::from_constraints(IntakeConstraints::default()))
        .await
        .expect("execute");

    assert_eq!(report.run.status, RunStatus::Failed);
    assert_eq!(report.count_errors(ErrorKind::Invalid), 1);
    assert_eq!(agent.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_concurrent_runs_are_capped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let agent = Arc::new(FakeAgent::new().with_delay(Duration::from_millis(20)));
    let structurer = Arc::new(CountingStructurer::default());
    let config = config(dir.path())
        .with_max_concurrent_runs(2)
        .with_max_concurrency(1)
        .with_agent_kinds(vec![AgentKind::Website, AgentKind::Gmap]);
    let controller = Arc::new(controller(config, agent.clone(), structurer));

    let mut handles = Vec::new();
    for _ in 0..6 {
        let handle = controller
            .submit(RunRequest::from_queries(queries(1)))
            .await
            .expect("submit");
        handles.push(handle);
    }
    for handle in handles {
        let report = handle.wait().await.expect("wait");
        assert_eq!(report.run.status, RunStatus::Completed);
    }

    assert_eq!(agent.calls.load(Ordering::SeqCst), 12);
    assert!(agent.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_queued_run_cancelled_through_handle() {
    let dir = tempfile::tempdir().expect("tempdir");
    let agent = Arc::new(
        FakeAgent::new()
            .with(AgentKind::Linkedin, Behavior::Hang)
            .with(AgentKind::Facebook, Behavior::Hang)
            .with(AgentKind::Website, Behavior::Hang)
            .with(AgentKind::Gmap, Behavior::Hang),
    );
    let structurer = Arc::new(CountingStructurer::default());
    let config = config(dir.path())
        .with_max_concurrent_runs(1)
        .with_max_concurrency(1);
    let controller = Arc::new(controller(config, agent.clone(), structurer));

    let running = controller
        .submit(RunRequest::from_queries(queries(1)))
        .await
        .expect("submit running");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let queued = controller
        .submit(RunRequest::from_queries(queries(1)))
        .await
        .expect("submit queued");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let requested = queued.cancel().await.expect("cancel queued");
    assert!(requested.cancel_requested);
    let report = queued.wait().await.expect("wait queued");

    assert_eq!(report.run.status, RunStatus::Cancelled);
    assert!(report.run.cancel_requested);
    assert_eq!(report.summary.total_tasks, 0);
    assert_eq!(agent.calls.load(Ordering::SeqCst), 1);

    running.cancel().await.expect("cancel running");
    let report = running.wait().await.expect("wait running");
    assert_eq!(report.run.status, RunStatus::Cancelled);
    assert!(report.run.cancel_requested);
}
