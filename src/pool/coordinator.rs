//! Agent pool coordinator: fans queries out across agent kinds.
//!
//! One stage task is created per (query, agent kind) pair, query-major.
//! A semaphore bounds how many tasks execute at once across the whole
//! fan-out. Results are yielded in completion order as a lazy stream that
//! ends once every task has produced exactly one terminal result.
//!
//! On cancellation no further task is admitted and every task still
//! waiting for a permit is reported `cancelled` immediately. In-flight
//! tasks get `cancel_grace` to observe the token; whatever is still
//! running after that is aborted and reported `cancelled`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinError};
use tokio_util::sync::CancellationToken;

use crate::agents::AgentKind;
use crate::error::ErrorKind;
use crate::intake::Query;
use crate::run::ProgressCounters;
use crate::stage::{StageError, StageExecutor, StageResult, StageTask, TaskId};

type Running = FuturesUnordered<BoxFuture<'static, (TaskId, Result<StageResult, JoinError>)>>;

enum Event {
    Done(TaskId, Result<StageResult, JoinError>),
    CancelObserved,
    Admit(OwnedSemaphorePermit),
    GraceExpired,
}

/// Fans stage tasks out under a concurrency limit.
#[derive(Clone)]
pub struct AgentPoolCoordinator {
    executor: Arc<StageExecutor>,
    stage_timeout: Duration,
    cancel_grace: Duration,
    max_attempts: u32,
    counters: Option<ProgressCounters>,
}

impl AgentPoolCoordinator {
    /// Creates a coordinator.
    ///
    /// `max_attempts` is the structuring attempt cap stamped on every task.
    pub fn new(
        executor: Arc<StageExecutor>,
        stage_timeout: Duration,
        cancel_grace: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            executor,
            stage_timeout,
            cancel_grace,
            max_attempts,
            counters: None,
        }
    }

    /// Tracks admissions and completions in `counters`.
    pub fn with_counters(mut self, counters: ProgressCounters) -> Self {
        self.counters = Some(counters);
        self
    }

    /// Runs every (query, kind) task and streams the results.
    ///
    /// The stream is lazy: nothing is admitted until it is polled.
    pub fn fan_out(
        &self,
        queries: &[Query],
        kinds: &[AgentKind],
        max_concurrency: usize,
        cancel: CancellationToken,
    ) -> impl Stream<Item = StageResult> + Send + 'static {
        let mut pending: VecDeque<StageTask> =
            plan_tasks(queries, kinds, self.max_attempts).into();
        let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
        let executor = self.executor.clone();
        let stage_timeout = self.stage_timeout;
        let cancel_grace = self.cancel_grace;
        let counters = self.counters.clone();

        if let Some(c) = &counters {
            c.tasks_total.fetch_add(pending.len(), Ordering::Relaxed);
        }
        tracing::debug!(
            tasks = pending.len(),
            max_concurrency,
            "Fan-out planned"
        );

        async_stream::stream! {
            let mut running: Running = FuturesUnordered::new();
            let mut outstanding: HashMap<TaskId, (StageTask, AbortHandle)> = HashMap::new();
            let mut grace_deadline: Option<tokio::time::Instant> = None;

            loop {
                if grace_deadline.is_none() && cancel.is_cancelled() {
                    if !pending.is_empty() {
                        tracing::info!(
                            skipped = pending.len(),
                            in_flight = outstanding.len(),
                            "Fan-out cancelled, skipping unadmitted tasks"
                        );
                    }
                    while let Some(task) = pending.pop_front() {
                        record_completion(counters.as_ref(), false, false);
                        yield StageResult::cancelled(task, Duration::ZERO);
                    }
                    grace_deadline = Some(tokio::time::Instant::now() + cancel_grace);
                }

                if pending.is_empty() && running.is_empty() {
                    break;
                }

                let deadline = grace_deadline.unwrap_or_else(tokio::time::Instant::now);
                let event = tokio::select! {
                    biased;
                    Some((id, joined)) = running.next(), if !running.is_empty() => {
                        Event::Done(id, joined)
                    }
                    _ = cancel.cancelled(), if grace_deadline.is_none() => Event::CancelObserved,
                    permit = semaphore.clone().acquire_owned(),
                        if grace_deadline.is_none() && !pending.is_empty() =>
                    {
                        match permit {
                            Ok(permit) => Event::Admit(permit),
                            Err(_) => Event::CancelObserved,
                        }
                    }
                    _ = tokio::time::sleep_until(deadline), if grace_deadline.is_some() => {
                        Event::GraceExpired
                    }
                };

                match event {
                    Event::Done(id, joined) => {
                        let Some((task, _)) = outstanding.remove(&id) else {
                            continue;
                        };
                        let result = match joined {
                            Ok(result) => result,
                            Err(e) if e.is_cancelled() => StageResult::cancelled(task, Duration::ZERO),
                            Err(e) => StageResult::failed(
                                task,
                                StageError::new(ErrorKind::ProviderError, format!("stage task failed: {}", e)),
                                Duration::ZERO,
                            ),
                        };
                        record_completion(counters.as_ref(), true, result.is_success());
                        yield result;
                    }
                    Event::CancelObserved => continue,
                    Event::Admit(permit) => {
                        let Some(task) = pending.pop_front() else {
                            continue;
                        };
                        if let Some(c) = &counters {
                            c.admitted.fetch_add(1, Ordering::Relaxed);
                            c.in_flight.fetch_add(1, Ordering::Relaxed);
                        }

                        let id = task.id;
                        let executor = executor.clone();
                        let token = cancel.clone();
                        let spawned = task.clone();
                        let handle = tokio::spawn(async move {
                            let _permit = permit;
                            executor.run(spawned, stage_timeout, &token).await
                        });
                        outstanding.insert(id, (task, handle.abort_handle()));
                        running.push(async move { (id, handle.await) }.boxed());
                    }
                    Event::GraceExpired => {
                        let mut stuck: Vec<(TaskId, (StageTask, AbortHandle))> =
                            outstanding.drain().collect();
                        stuck.sort_by_key(|(id, _)| *id);
                        if !stuck.is_empty() {
                            tracing::warn!(
                                aborted = stuck.len(),
                                grace_ms = cancel_grace.as_millis() as u64,
                                "Grace period expired, aborting in-flight stages"
                            );
                        }
                        for (_, (task, abort)) in stuck {
                            abort.abort();
                            record_completion(counters.as_ref(), true, false);
                            yield StageResult::cancelled(task, cancel_grace);
                        }
                        break;
                    }
                }
            }
        }
    }
}

/// Builds the task list, query-major: `q0×k0, q0×k1, …, q1×k0, …`.
pub fn plan_tasks(queries: &[Query], kinds: &[AgentKind], max_attempts: u32) -> Vec<StageTask> {
    queries
        .iter()
        .flat_map(|query| kinds.iter().map(move |kind| (query, *kind)))
        .enumerate()
        .map(|(i, (query, kind))| StageTask::new(TaskId(i as u64), kind, query.clone(), max_attempts))
        .collect()
}

fn record_completion(counters: Option<&ProgressCounters>, was_running: bool, success: bool) {
    let Some(c) = counters else {
        return;
    };
    if was_running {
        c.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
    c.completed.fetch_add(1, Ordering::Relaxed);
    if success {
        c.succeeded.fetch_add(1, Ordering::Relaxed);
    } else {
        c.failed.fetch_add(1, Ordering::Relaxed);
    }
}
