//! Prometheus metrics registration and export.
//!
//! All metrics live in a [`LeadMetrics`] value that owns its own
//! [`Registry`]; there is no global registry.

use prometheus::{
    CounterVec, Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};

use crate::run::RunStatus;
use crate::stage::StageResult;

/// Metrics for lead-forge runs.
#[derive(Clone)]
pub struct LeadMetrics {
    registry: Registry,
    stage_results: IntCounterVec,
    stage_duration: HistogramVec,
    structuring_attempts: IntCounter,
    structuring_outcomes: IntCounterVec,
    lead_records: IntCounter,
    runs: IntCounterVec,
    run_duration: Histogram,
    run_records: CounterVec,
}

impl std::fmt::Debug for LeadMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeadMetrics").finish_non_exhaustive()
    }
}

impl LeadMetrics {
    /// Creates all metrics and registers them with a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns a `prometheus::Error` if a metric definition is invalid.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Stage metrics
        let stage_results = IntCounterVec::new(
            Opts::new(
                "lead_forge_stage_results_total",
                "Stage task results by agent kind and outcome",
            ),
            &["agent", "outcome"],
        )?;

        let stage_duration = HistogramVec::new(
            HistogramOpts::new(
                "lead_forge_stage_duration_seconds",
                "Stage task duration in seconds",
            )
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
            &["agent"],
        )?;

        // Structuring metrics
        let structuring_attempts = IntCounter::new(
            "lead_forge_structuring_attempts_total",
            "Structuring calls made by the validation gate",
        )?;

        let structuring_outcomes = IntCounterVec::new(
            Opts::new(
                "lead_forge_structuring_outcomes_total",
                "Validation gate outcomes per stage task",
            ),
            &["outcome"],
        )?;

        let lead_records = IntCounter::new(
            "lead_forge_lead_records_total",
            "Lead records appended to consolidated files",
        )?;

        // Run metrics
        let runs = IntCounterVec::new(
            Opts::new("lead_forge_runs_total", "Finished runs by terminal status"),
            &["status"],
        )?;

        let run_duration = Histogram::with_opts(
            HistogramOpts::new("lead_forge_run_duration_seconds", "Run wall-clock duration")
                .buckets(vec![10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]),
        )?;

        let run_records = CounterVec::new(
            Opts::new(
                "lead_forge_run_records_with_contact_total",
                "Consolidated records carrying an email or phone",
            ),
            &["status"],
        )?;

        registry.register(Box::new(stage_results.clone()))?;
        registry.register(Box::new(stage_duration.clone()))?;
        registry.register(Box::new(structuring_attempts.clone()))?;
        registry.register(Box::new(structuring_outcomes.clone()))?;
        registry.register(Box::new(lead_records.clone()))?;
        registry.register(Box::new(runs.clone()))?;
        registry.register(Box::new(run_duration.clone()))?;
        registry.register(Box::new(run_records.clone()))?;

        Ok(Self {
            registry,
            stage_results,
            stage_duration,
            structuring_attempts,
            structuring_outcomes,
            lead_records,
            runs,
            run_duration,
            run_records,
        })
    }

    /// Records one terminal stage result.
    pub fn record_stage(&self, result: &StageResult) {
        let agent = result.task.agent.as_str();
        self.stage_results
            .with_label_values(&[agent, result.outcome_label()])
            .inc();
        self.stage_duration
            .with_label_values(&[agent])
            .observe(result.elapsed.as_secs_f64());
    }

    /// Records the gate's verdict for one stage task.
    pub fn record_structuring(&self, attempts: u32, accepted: bool) {
        self.structuring_attempts.inc_by(u64::from(attempts));
        let outcome = if accepted { "accepted" } else { "invalid" };
        self.structuring_outcomes.with_label_values(&[outcome]).inc();
    }

    /// Records lead records appended to a consolidated file.
    pub fn record_leads(&self, count: usize) {
        self.lead_records.inc_by(count as u64);
    }

    /// Records a finished run.
    pub fn record_run(&self, status: RunStatus, elapsed_secs: f64, records_with_contact: usize) {
        self.runs.with_label_values(&[status.as_str()]).inc();
        self.run_duration.observe(elapsed_secs);
        self.run_records
            .with_label_values(&[status.as_str()])
            .inc_by(records_with_contact as f64);
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export all registered metrics in Prometheus text format.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# Error encoding metrics: {}\n", e);
        }

        String::from_utf8(buffer)
            .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentKind, RawPayload};
    use crate::intake::Query;
    use crate::stage::{StageError, StageTask, TaskId};
    use crate::error::ErrorKind;
    use std::time::Duration;

    fn task(agent: AgentKind) -> StageTask {
        StageTask::new(TaskId(0), agent, Query::new(0, "dental clinic austin"), 3)
    }

    #[test]
    fn test_registries_are_independent() {
        let first = LeadMetrics::new().expect("metrics");
        let second = LeadMetrics::new().expect("metrics");

        first.record_leads(4);

        assert!(first.export().contains("lead_forge_lead_records_total 4"));
        assert!(second.export().contains("lead_forge_lead_records_total 0"));
    }

    #[test]
    fn test_stage_outcomes_are_labelled() {
        let metrics = LeadMetrics::new().expect("metrics");
        metrics.record_stage(&StageResult::payload(
            task(AgentKind::Website),
            RawPayload::ItemList(Vec::new()),
            Duration::from_millis(1500),
        ));
        metrics.record_stage(&StageResult::failed(
            task(AgentKind::Gmap),
            StageError::new(ErrorKind::Timeout, "slow"),
            Duration::from_secs(300),
        ));
        metrics.record_run(RunStatus::PartiallyFailed, 12.0, 3);

        let text = metrics.export();
        assert!(text.contains(r#"lead_forge_stage_results_total{agent="website",outcome="success"} 1"#));
        assert!(text.contains(r#"lead_forge_stage_results_total{agent="gmap",outcome="timeout"} 1"#));
        assert!(text.contains(r#"lead_forge_runs_total{status="partially_failed"} 1"#));
        assert!(!text.starts_with("# Error"));
    }
}
