//! Stage executor: runs one research call under a deadline and a
//! cancellation token.
//!
//! Every outcome is converted into a [`StageResult`]. Agent errors and
//! panics become `provider_error`, an elapsed deadline becomes `timeout`
//! and an observed cancellation becomes `cancelled`. The executor never
//! persists anything.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use super::types::{StageError, StageResult, StageTask};
use crate::agents::ResearchAgent;
use crate::error::ErrorKind;

/// Executes stage tasks against a research agent.
pub struct StageExecutor {
    agent: Arc<dyn ResearchAgent>,
}

impl std::fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutor").finish_non_exhaustive()
    }
}

impl StageExecutor {
    /// Creates an executor for `agent`.
    pub fn new(agent: Arc<dyn ResearchAgent>) -> Self {
        Self { agent }
    }

    /// Runs `task` once.
    ///
    /// Returns no later than `timeout` after the call, or as soon as
    /// `cancel` fires. A task whose token is already cancelled never
    /// reaches the agent.
    pub async fn run(
        &self,
        task: StageTask,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> StageResult {
        let started = Instant::now();

        if cancel.is_cancelled() {
            tracing::debug!(task_id = %task.id, agent = %task.agent, "Stage skipped, run cancelled");
            return StageResult::cancelled(task, started.elapsed());
        }

        tracing::debug!(
            task_id = %task.id,
            agent = %task.agent,
            query = %task.query,
            "Stage started"
        );

        let outcome = {
            let research = AssertUnwindSafe(self.agent.research(task.agent, &task.query))
                .catch_unwind();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(StageError::cancelled()),
                res = tokio::time::timeout(timeout, research) => match res {
                    Err(_) => Err(StageError::new(
                        ErrorKind::Timeout,
                        format!("stage exceeded {}s deadline", timeout.as_secs_f64()),
                    )),
                    Ok(Err(panic)) => Err(StageError::new(
                        ErrorKind::ProviderError,
                        format!("agent panicked: {}", panic_message(panic.as_ref())),
                    )),
                    Ok(Ok(Err(e))) => Err(StageError::new(ErrorKind::ProviderError, e.to_string())),
                    Ok(Ok(Ok(payload))) => Ok(payload),
                },
            }
        };

        let elapsed = started.elapsed();
        match outcome {
            Ok(_) if cancel.is_cancelled() => StageResult::cancelled(task, elapsed),
            Ok(payload) => {
                tracing::debug!(
                    task_id = %task.id,
                    agent = %task.agent,
                    items = payload.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Stage completed"
                );
                StageResult::payload(task, payload, elapsed)
            }
            Err(error) => {
                if error.kind != ErrorKind::Cancelled {
                    tracing::warn!(
                        task_id = %task.id,
                        agent = %task.agent,
                        query = %task.query,
                        kind = %error.kind,
                        error = %error.message,
                        "Stage failed"
                    );
                }
                StageResult::failed(task, error, elapsed)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
