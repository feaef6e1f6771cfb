//! The seam between workers and the queue delivering their jobs.
//!
//! A [`crate::worker::BaseWorker`] never talks to a queue library directly. It hands its job
//! processor to a [`RuntimeFactory`], which binds it to a [`QueueHandle`] and returns a
//! [`WorkerRuntime`] controlling the running consumer. The default, [`InProcessRuntimeFactory`],
//! pulls jobs from the queue in a tokio task and processes up to `concurrency` of them at once.
//!
//! The queue owns job level retries: a failed job is reported back through
//! [`QueueHandle::fail`] and the queue decides whether to redeliver it.
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Instant,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{sync::Semaphore, task::JoinError, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{job::Job, worker::JobError, WorkerError};

pub mod memory;

/// A queue jobs are consumed from.
#[async_trait]
pub trait QueueHandle: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Waits for the next job. Returns `None` once the queue is closed.
    async fn next_job(&self) -> Option<Job>;

    async fn complete(&self, job: Job, result: Value);

    /// Reports a failed job. The queue decides whether to redeliver it.
    async fn fail(&self, job: Job, error: &JobError);
}

/// Processes a single delivered job.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job) -> Result<Value, JobError>;
}

/// A running consumer of a queue.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    fn is_running(&self) -> bool;

    /// Stops taking new jobs and waits for in-flight jobs to finish.
    async fn close(&self) -> Result<(), WorkerError>;
}

/// Binds a job processor to a queue.
#[async_trait]
pub trait RuntimeFactory: Send + Sync {
    async fn start(
        &self,
        queue: Arc<dyn QueueHandle>,
        processor: Arc<dyn JobHandler>,
        concurrency: usize,
    ) -> Result<Box<dyn WorkerRuntime>, WorkerError>;
}

/// [`RuntimeFactory`] running consumers as tokio tasks in the current process.
#[derive(Debug, Clone, Copy, Default)]
pub struct InProcessRuntimeFactory;

#[async_trait]
impl RuntimeFactory for InProcessRuntimeFactory {
    async fn start(
        &self,
        queue: Arc<dyn QueueHandle>,
        processor: Arc<dyn JobHandler>,
        concurrency: usize,
    ) -> Result<Box<dyn WorkerRuntime>, WorkerError> {
        if concurrency == 0 {
            return Err(WorkerError::RuntimeStart(format!(
                "concurrency for queue {} must be at least 1",
                queue.name()
            )));
        }
        Ok(Box::new(InProcessRuntime::start(
            queue,
            processor,
            concurrency,
        )))
    }
}

/// A tokio task pulling jobs from a queue, processing at most `concurrency` at a time.
pub struct InProcessRuntime {
    cancellation_token: CancellationToken,
    tracker: TaskTracker,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl InProcessRuntime {
    pub fn start(
        queue: Arc<dyn QueueHandle>,
        processor: Arc<dyn JobHandler>,
        concurrency: usize,
    ) -> Self {
        let cancellation_token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let semaphore = Arc::new(Semaphore::new(concurrency));

        tracing::debug!(queue = queue.name(), concurrency, "Starting runtime for {}", queue.name());

        let handle = tokio::spawn({
            let token = cancellation_token.clone();
            let tracker = tracker.clone();
            async move {
                loop {
                    let permit = tokio::select! {
                        _ = token.cancelled() => break,
                        permit = semaphore.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    let job = tokio::select! {
                        _ = token.cancelled() => break,
                        job = queue.next_job() => job,
                    };
                    let Some(job) = job else {
                        tracing::debug!(queue = queue.name(), "Queue {} closed", queue.name());
                        break;
                    };
                    let queue = queue.clone();
                    let processor = processor.clone();
                    tracker.spawn(async move {
                        run_job(queue.as_ref(), processor, job).await;
                        drop(permit);
                    });
                }
                tracing::debug!("Shutting down runtime for {}", queue.name());
            }
        });

        Self {
            cancellation_token,
            tracker,
            handle: Mutex::new(Some(handle)),
        }
    }
}

async fn run_job(queue: &dyn QueueHandle, processor: Arc<dyn JobHandler>, job: Job) {
    let job_id = job.job_id().to_owned();
    let start = Instant::now();
    let processed = tokio::spawn({
        let job = job.clone();
        async move { processor.handle(job).await }.in_current_span()
    });

    match processed.await.unwrap_or_else(|error| Err(error.into())) {
        Ok(result) => {
            tracing::debug!(%job_id, duration = ?start.elapsed(), "Job complete {job_id}");
            queue.complete(job, result).await;
        }
        Err(error) => {
            tracing::debug!(%job_id, ?error, "Job {job_id} failed: {error}");
            queue.fail(job, &error).await;
        }
    }
}

#[async_trait]
impl WorkerRuntime for InProcessRuntime {
    fn is_running(&self) -> bool {
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        !self.cancellation_token.is_cancelled()
            && handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    async fn close(&self) -> Result<(), WorkerError> {
        self.cancellation_token.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.await.map_err(|error| {
                tracing::error!(?error, "Failed to join runtime task: {error}");
                WorkerError::GracefulShutdownFailed
            })?;
        }
        self.tracker.close();
        self.tracker.wait().await;
        Ok(())
    }
}

impl From<JoinError> for JobError {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self::Panicked { message }
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::runtime::memory::MemoryQueue;

    struct Handler<F>(F);

    fn handler<F>(f: F) -> Arc<dyn JobHandler>
    where
        F: Fn(Job) -> Result<Value, JobError> + Send + Sync + 'static,
    {
        Arc::new(Handler(f))
    }

    #[async_trait]
    impl<F> JobHandler for Handler<F>
    where
        F: Fn(Job) -> Result<Value, JobError> + Send + Sync + 'static,
    {
        async fn handle(&self, job: Job) -> Result<Value, JobError> {
            (self.0)(job)
        }
    }

    struct Slow {
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for Slow {
        async fn handle(&self, job: Job) -> Result<Value, JobError> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(job.data)
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn processes_and_completes_jobs() {
        let queue = MemoryQueue::new("runtime");
        queue.enqueue(json!({"n": 1})).unwrap();
        queue.enqueue(json!({"n": 2})).unwrap();
        let runtime = InProcessRuntimeFactory
            .start(Arc::new(queue.clone()), handler(|job| Ok(job.data)), 2)
            .await
            .unwrap();

        wait_for(|| queue.completed().len() == 2).await;
        assert!(runtime.is_running());

        runtime.close().await.unwrap();
        assert!(!runtime.is_running());
    }

    #[tokio::test]
    async fn bounds_concurrency() {
        let queue = MemoryQueue::new("runtime");
        for n in 0..6 {
            queue.enqueue(json!(n)).unwrap();
        }
        let peak = Arc::new(AtomicUsize::new(0));
        let handler = Slow {
            running: Default::default(),
            peak: peak.clone(),
        };
        let runtime = InProcessRuntime::start(Arc::new(queue.clone()), Arc::new(handler), 2);

        wait_for(|| queue.completed().len() == 6).await;
        runtime.close().await.unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn panics_are_reported_as_failures() {
        let queue = MemoryQueue::new("runtime").with_max_attempts(1);
        queue.enqueue(json!(null)).unwrap();
        let runtime = InProcessRuntime::start(
            Arc::new(queue.clone()),
            handler(|_job| panic!("exploded")),
            1,
        );

        wait_for(|| queue.discarded().len() == 1).await;
        runtime.close().await.unwrap();

        assert_matches!(
            &queue.discarded()[0].1,
            JobError::Panicked { message } if message == "exploded"
        );
    }

    #[tokio::test]
    async fn zero_concurrency_is_rejected() {
        let queue = MemoryQueue::new("runtime");
        let result = InProcessRuntimeFactory
            .start(Arc::new(queue), handler(|job| Ok(job.data)), 0)
            .await;

        assert_matches!(result.err(), Some(WorkerError::RuntimeStart(_)));
    }
}
