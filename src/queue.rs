//! Bounded-concurrency FIFO render queue
//!
//! Jobs wait in an ordered backlog and are dispatched oldest-first while
//! fewer than `max_concurrency` are running. Every dispatch decision is made
//! under one mutex so the running count and backlog never disagree. A job
//! that finishes frees its slot and immediately dispatches the next one.

use crate::{JobState, RenderError, RenderJob, RenderMetrics, RenderResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Executes one render job to completion.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, job: &RenderJob) -> Result<RenderResult, RenderError>;
}

#[async_trait]
impl<R: JobRunner + ?Sized> JobRunner for Arc<R> {
    async fn run(&self, job: &RenderJob) -> Result<RenderResult, RenderError> {
        (**self).run(job).await
    }
}

type Reply = oneshot::Sender<Result<RenderResult, RenderError>>;

struct QueuedJob {
    job: RenderJob,
    reply: Reply,
}

#[derive(Default)]
struct QueueState {
    backlog: VecDeque<QueuedJob>,
    running: usize,
    succeeded: u64,
    failed: u64,
}

struct Inner {
    state: Mutex<QueueState>,
    runner: Arc<dyn JobRunner>,
    max_concurrency: usize,
    max_backlog: Option<usize>,
    metrics: RenderMetrics,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub max_concurrency: usize,
}

#[derive(Clone)]
pub struct ConcurrencyQueue {
    inner: Arc<Inner>,
}

impl ConcurrencyQueue {
    pub fn new(runner: Arc<dyn JobRunner>, max_concurrency: usize) -> Self {
        Self::with_limits(runner, max_concurrency, None, RenderMetrics::noop())
    }

    pub fn with_limits(
        runner: Arc<dyn JobRunner>,
        max_concurrency: usize,
        max_backlog: Option<usize>,
        metrics: RenderMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                runner,
                max_concurrency: max_concurrency.max(1),
                max_backlog,
                metrics,
            }),
        }
    }

    /// Appends the job to the backlog and returns a handle resolving to
    /// its result. Admission order is the order of `submit` calls.
    pub fn submit(&self, job: RenderJob) -> Result<JobHandle, RenderError> {
        let (reply, receiver) = oneshot::channel();
        let id = job.id.clone();

        {
            let mut state = self.inner.state();
            if let Some(limit) = self.inner.max_backlog {
                if state.backlog.len() >= limit {
                    warn!(job_id = %id, url = %job.url, limit, "Render queue full, rejecting job");
                    return Err(RenderError::QueueFull { limit });
                }
            }
            state.backlog.push_back(QueuedJob { job, reply });
            self.inner.metrics.set_queue_depth(state.backlog.len());
        }

        debug!(job_id = %id, "Render job queued");
        dispatch(&self.inner);

        Ok(JobHandle { id, receiver })
    }

    /// Submits and waits for the result.
    pub async fn run(&self, job: RenderJob) -> Result<RenderResult, RenderError> {
        self.submit(job)?.await
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state();
        QueueStats {
            queued: state.backlog.len(),
            running: state.running,
            succeeded: state.succeeded,
            failed: state.failed,
            max_concurrency: self.inner.max_concurrency,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }
}

/// Starts queued jobs while slots are free.
fn dispatch(inner: &Arc<Inner>) {
    loop {
        let next = {
            let mut state = inner.state();
            if state.running >= inner.max_concurrency {
                return;
            }
            let Some(next) = state.backlog.pop_front() else {
                return;
            };
            state.running += 1;
            inner.metrics.set_queue_depth(state.backlog.len());
            next
        };

        let QueuedJob { mut job, reply } = next;
        job.transition(JobState::Running);
        debug!(
            job_id = %job.id,
            queued_ms = job.queued_for().as_millis() as u64,
            "Render job started"
        );

        let slot = SlotGuard {
            inner: Arc::clone(inner),
            outcome: None,
        };

        tokio::spawn(async move {
            let mut slot = slot;
            let result = slot.inner.runner.run(&job).await;

            let terminal = if result.is_ok() {
                JobState::Succeeded
            } else {
                JobState::Failed
            };
            job.transition(terminal);
            slot.outcome = Some(terminal);
            drop(slot);

            debug!(job_id = %job.id, state = ?job.state(), "Render job completed");
            if reply.send(result).is_err() {
                debug!(job_id = %job.id, "Caller stopped waiting for render result");
            }
        });
    }
}

/// Frees the slot on every exit path of a job task, including panics,
/// then dispatches the next queued job.
struct SlotGuard {
    inner: Arc<Inner>,
    outcome: Option<JobState>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state();
            state.running = state.running.saturating_sub(1);
            match self.outcome {
                Some(JobState::Succeeded) => state.succeeded += 1,
                _ => state.failed += 1,
            }
        }
        dispatch(&self.inner);
    }
}

/// Pending result of a submitted job
pub struct JobHandle {
    id: String,
    receiver: oneshot::Receiver<Result<RenderResult, RenderError>>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for JobHandle {
    type Output = Result<RenderResult, RenderError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(RenderError::Internal(
                    "render task stopped before replying".to_string(),
                ))
            })
        })
    }
}
