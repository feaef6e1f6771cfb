//! Provides an in memory implementation of [`QueueHandle`].
//!
//! Jobs are delivered in FIFO order. Failed jobs are redelivered as new instances with an
//! incremented attempt counter after the queue's backoff, until `max_attempts` is reached, at
//! which point they are discarded.
//!
//! Nothing is persisted. It is intended for tests, demos and single process deployments.
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

use super::QueueHandle;
use crate::{
    backoff::{BackoffStrategy, Exponential, Jitter, Strategy},
    job::Job,
    worker::JobError,
    WorkerError,
};

/// The default number of deliveries of a job, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// The default backoff before redelivering a failed job:
///  - exponential backoff starting at 1 second,
///  - capped at 30 seconds,
///  - with a 10% jitter margin.
pub const DEFAULT_JOB_BACKOFF: BackoffStrategy<Exponential> =
    BackoffStrategy::exponential(Duration::from_secs(1))
        .with_max(Duration::from_secs(30))
        .with_jitter(Jitter::Relative(0.1));

#[derive(Default)]
struct State {
    pending: VecDeque<Job>,
    completed: Vec<(Job, Value)>,
    discarded: Vec<(Job, JobError)>,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
    next_id: AtomicU64,
}

/// An in process FIFO queue.
///
/// Cloning is cheap, all clones refer to the same queue.
#[derive(Clone)]
pub struct MemoryQueue {
    name: Arc<str>,
    max_attempts: u32,
    backoff: Arc<dyn Strategy + Send + Sync>,
    shared: Arc<Shared>,
}

impl fmt::Debug for MemoryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryQueue")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .field("pending", &self.len())
            .finish_non_exhaustive()
    }
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Arc::new(DEFAULT_JOB_BACKOFF),
            shared: Default::default(),
        }
    }

    /// Total number of deliveries of a job, at least one.
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }

    pub fn with_backoff(self, backoff: impl Strategy + Send + Sync + 'static) -> Self {
        Self {
            backoff: Arc::new(backoff),
            ..self
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a job to the back of the queue as is.
    pub fn push(&self, job: Job) -> Result<(), WorkerError> {
        {
            let mut state = self.state();
            if state.closed {
                return Err(WorkerError::QueueClosed(self.name.to_string()));
            }
            state.pending.push_back(job);
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Enqueues a new job with the given data, returning its generated id.
    pub fn enqueue(&self, data: Value) -> Result<String, WorkerError> {
        let id = (self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        self.push(Job::new(data).with_id(id.clone()))?;
        tracing::debug!(queue = %self.name, job_id = %id, "Enqueued job {id}");
        Ok(id)
    }

    /// Stops delivering jobs. Pending jobs are dropped and consumers waiting for a job see the
    /// queue as closed.
    pub fn close(&self) {
        {
            let mut state = self.state();
            state.closed = true;
            state.pending.clear();
        }
        self.shared.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Jobs that were processed successfully, with their results.
    pub fn completed(&self) -> Vec<(Job, Value)> {
        self.state().completed.clone()
    }

    /// Jobs that failed their final attempt, with the error of that attempt.
    pub fn discarded(&self) -> Vec<(Job, JobError)> {
        self.state().discarded.clone()
    }
}

#[async_trait]
impl QueueHandle for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_job(&self) -> Option<Job> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.state();
                if let Some(job) = state.pending.pop_front() {
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    async fn complete(&self, job: Job, result: Value) {
        self.state().completed.push((job, result));
    }

    async fn fail(&self, job: Job, error: &JobError) {
        let job_id = job.job_id().to_owned();
        let attempt = job.attempts_made.saturating_add(1);
        if attempt >= self.max_attempts {
            tracing::error!(
                %job_id,
                ?error,
                "Job {job_id} failed and will be discarded after {attempt} attempts: {error}",
            );
            self.state().discarded.push((job, error.clone()));
            return;
        }

        let delay = self.backoff.backoff(attempt);
        tracing::warn!(
            %job_id,
            ?error,
            "Job {job_id} failed and will be retried in {delay:?}: {error}",
        );
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = queue.push(job.redelivered()).inspect_err(|err| {
                tracing::error!(?err, %job_id, "Failed to redeliver job {job_id}: {err}")
            });
        });
    }
}
