//! Workers: binding a queue to a pipeline of actions.
//!
//! A [`Worker`] describes a kind of job: its operation name, the actions it registers and how a
//! job's pipeline is assembled from them. [`BaseWorker::start`] turns it into a running consumer
//! of a queue.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    action::{
        error::{ActionExecutionError, ActionNotRegisteredError},
        factory::ActionFactory,
        status, BoxAction, Pipeline,
    },
    cache::{ActionResultCache, DEFAULT_CLEANUP_INTERVAL},
    deps::{BaseDependencies, Dependencies, FromContainer, ServiceContainer},
    job::{ActionContext, Job},
    metrics::{MetricsRecorder, WorkerMetrics},
    runtime::{InProcessRuntimeFactory, QueueHandle, RuntimeFactory, WorkerRuntime},
    WorkerError,
};

mod processor;
pub mod registry;

use processor::JobProcessor;

/// What processing a job fails with.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// An action in the pipeline failed.
    #[error(transparent)]
    Execution(#[from] ActionExecutionError),
    /// The pipeline referenced an action that is not registered.
    #[error("Failed to create action pipeline: {0}")]
    Pipeline(#[from] ActionNotRegisteredError),
    #[error("Job panicked: {message}")]
    Panicked { message: String },
}

impl JobError {
    /// The name of the action that failed, if an action failed.
    pub fn failed_action(&self) -> Option<&str> {
        match self {
            Self::Execution(error) => Some(&error.action),
            Self::Pipeline(_) | Self::Panicked { .. } => None,
        }
    }
}

/// A kind of job, processed as a pipeline of actions.
///
/// Only [`Worker::operation_name`] and [`Worker::register_actions`] are required. A worker doing
/// meaningful work also overrides [`Worker::create_action_pipeline`], which by default produces
/// an empty pipeline returning the job data unchanged.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// The dependencies handed to this worker's actions.
    type Deps: Dependencies;

    /// Identifies the worker type in logs, metrics and action contexts.
    fn operation_name(&self) -> &'static str;

    /// Registers the worker's actions. Called once, before any job is processed.
    fn register_actions(&self, factory: &mut ActionFactory<Self::Deps>);

    /// The ordered actions to run for a job.
    fn create_action_pipeline(
        &self,
        _data: &Value,
        _context: &ActionContext,
        _factory: &ActionFactory<Self::Deps>,
        _deps: &Self::Deps,
    ) -> Result<Pipeline<Self::Deps>, ActionNotRegisteredError> {
        Ok(Vec::new())
    }

    /// Overrides the configured concurrency.
    fn concurrency(&self) -> Option<usize> {
        None
    }

    /// Checks the dependencies before the worker starts.
    fn validate_dependencies(&self, _deps: &Self::Deps) -> Result<(), WorkerError> {
        Ok(())
    }

    /// Adds the standard processing and completed status broadcasts around a pipeline.
    ///
    /// Meant to be called from [`Worker::create_action_pipeline`]. Workers whose progress is not
    /// of interest to anyone watching a job override this to do nothing.
    fn inject_standard_status_actions(&self, actions: &mut Pipeline<Self::Deps>, data: &Value) {
        status::inject_standard_status_actions(actions, data);
    }

    async fn on_before_job(&self, _data: &Value, _context: &ActionContext) {}

    async fn on_after_job(&self, _data: &Value, _context: &ActionContext, _result: &Value) {}

    async fn on_job_error(&self, _error: &JobError, _data: &Value, _context: &ActionContext) {}
}

/// Worker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// The maximum number of jobs processed at once.
    pub concurrency: usize,
}

impl WorkerConfig {
    pub const DEFAULT_CONCURRENCY: usize = 5;

    pub const fn new() -> Self {
        Self {
            concurrency: Self::DEFAULT_CONCURRENCY,
        }
    }

    pub const fn with_concurrency(self, concurrency: usize) -> Self {
        Self { concurrency }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Optional collaborators of a [`BaseWorker`].
pub struct WorkerOptions<D: Dependencies> {
    /// The factory the worker registers its actions into.
    pub factory: ActionFactory<D>,
    pub config: WorkerConfig,
    pub metrics: Arc<dyn MetricsRecorder>,
    pub runtime: Arc<dyn RuntimeFactory>,
    pub cache: Arc<ActionResultCache>,
    /// How often expired entries are swept from `cache` while the worker runs.
    pub cache_cleanup_interval: Duration,
    pub container: Option<ServiceContainer>,
}

impl<D: Dependencies> Default for WorkerOptions<D> {
    fn default() -> Self {
        Self {
            factory: ActionFactory::new(),
            config: WorkerConfig::default(),
            metrics: Arc::new(WorkerMetrics::new()),
            runtime: Arc::new(InProcessRuntimeFactory),
            cache: Arc::new(ActionResultCache::new()),
            cache_cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            container: None,
        }
    }
}

impl<D: Dependencies> WorkerOptions<D> {
    pub fn with_factory(self, factory: ActionFactory<D>) -> Self {
        Self { factory, ..self }
    }

    pub fn with_config(self, config: WorkerConfig) -> Self {
        Self { config, ..self }
    }

    pub fn with_metrics(self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self { metrics, ..self }
    }

    pub fn with_runtime(self, runtime: Arc<dyn RuntimeFactory>) -> Self {
        Self { runtime, ..self }
    }

    pub fn with_cache(self, cache: Arc<ActionResultCache>) -> Self {
        Self { cache, ..self }
    }

    pub fn with_cache_cleanup_interval(self, cache_cleanup_interval: Duration) -> Self {
        Self {
            cache_cleanup_interval,
            ..self
        }
    }

    pub fn with_container(self, container: ServiceContainer) -> Self {
        Self {
            container: Some(container),
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub is_running: bool,
    pub name: String,
}

/// A [`Worker`] bound to a queue.
///
/// Jobs delivered by the queue are processed by the worker's pipeline, at most
/// [`BaseWorker::concurrency`] at a time.
pub struct BaseWorker<W: Worker> {
    processor: Arc<JobProcessor<W>>,
    runtime: Box<dyn WorkerRuntime>,
    concurrency: usize,
    metrics: Arc<dyn MetricsRecorder>,
    container: Option<ServiceContainer>,
    cache_cleanup: CancellationToken,
}

impl<W: Worker> BaseWorker<W> {
    /// Registers the worker's actions and starts consuming the queue.
    ///
    /// Fails if the worker rejects its dependencies or the runtime cannot be started.
    pub async fn start(
        queue: impl QueueHandle,
        worker: W,
        deps: W::Deps,
        options: WorkerOptions<W::Deps>,
    ) -> Result<Self, WorkerError> {
        let operation = worker.operation_name();
        worker.validate_dependencies(&deps).inspect_err(|error| {
            tracing::error!(?error, operation, "Invalid dependencies for {operation}: {error}")
        })?;

        let WorkerOptions {
            mut factory,
            config,
            metrics,
            runtime,
            cache,
            cache_cleanup_interval,
            container,
        } = options;
        worker.register_actions(&mut factory);

        let concurrency = worker.concurrency().unwrap_or(config.concurrency);
        let queue_name = queue.name().to_owned();
        let processor = Arc::new(JobProcessor::new(
            worker,
            deps,
            factory,
            cache.clone(),
            metrics.clone(),
            queue_name.clone(),
        ));
        let runtime = runtime
            .start(Arc::new(queue), processor.clone(), concurrency)
            .await?;
        let cache_cleanup = CancellationToken::new();
        cache.spawn_cleanup(cache_cleanup_interval, cache_cleanup.clone());

        tracing::info!(
            operation,
            queue = %queue_name,
            concurrency,
            "Started worker {operation} on queue {queue_name}"
        );
        Ok(Self {
            processor,
            runtime,
            concurrency,
            metrics,
            container,
            cache_cleanup,
        })
    }

    /// Processes a single job through the worker's pipeline.
    pub async fn process_job(&self, job: Job) -> Result<Value, JobError> {
        self.processor.process_job(job).await
    }

    pub fn operation_name(&self) -> &'static str {
        self.processor.worker().operation_name()
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Whether the runtime is consuming the queue. Also recorded in the worker's metrics.
    pub fn status(&self) -> WorkerStatus {
        let name = self.operation_name();
        let is_running = self.runtime.is_running();
        self.metrics.record_worker_status(name, is_running);
        WorkerStatus {
            is_running,
            name: name.to_owned(),
        }
    }

    /// Stops consuming the queue, waiting for in-flight jobs.
    pub async fn close(&self) -> Result<(), WorkerError> {
        let operation = self.operation_name();
        tracing::debug!(operation, "Closing worker {operation}");
        let closed = self.runtime.close().await;
        self.cache_cleanup.cancel();
        closed
    }

    pub fn worker(&self) -> &W {
        self.processor.worker()
    }

    pub fn deps(&self) -> &W::Deps {
        self.processor.deps()
    }

    pub fn factory(&self) -> &ActionFactory<W::Deps> {
        self.processor.factory()
    }

    pub fn cache(&self) -> &ActionResultCache {
        self.processor.cache()
    }

    /// Assembles the minimal dependency bundle from the worker's service container.
    ///
    /// Fails only when the worker was started without a container.
    pub fn build_base_worker_dependencies(&self) -> Result<BaseDependencies, WorkerError> {
        BaseDependencies::from_container(self.container.as_ref())
    }

    /// Creates a registered action wrapped for retries, with error handling outermost.
    pub fn create_retryable_error_handled_action(
        &self,
        name: &str,
    ) -> Result<BoxAction<W::Deps>, ActionNotRegisteredError> {
        self.factory()
            .create_retryable_error_handled(name, self.deps())
    }

    /// Creates a registered action wrapped for error handling only.
    pub fn create_error_handled_action_only(
        &self,
        name: &str,
    ) -> Result<BoxAction<W::Deps>, ActionNotRegisteredError> {
        self.factory().create_error_handled(name, self.deps())
    }
}

impl<W: Worker> Drop for BaseWorker<W> {
    fn drop(&mut self) {
        self.cache_cleanup.cancel();
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use assert_matches::assert_matches;
    use mockall::predicate::{always, eq};
    use serde_json::json;

    use super::*;
    use crate::{
        action::{
            builtin::{NoOpAction, ValidationAction, NO_OP, VALIDATION},
            error::{ActionError, ActionValidationError},
            status::{STATUS_COMPLETED, STATUS_PROCESSING},
            wrapper::with_status_broadcast,
            Action, ActionConfig, ActionResult,
        },
        cache::DEFAULT_TTL,
        metrics::MockMetricsRecorder,
        runtime::memory::MemoryQueue,
        testing::{IdleRuntimeFactory, RecordingBroadcaster, ScriptedAction, TestDependencies},
    };

    type BuildResult = Result<Pipeline<TestDependencies>, ActionNotRegisteredError>;
    type Build =
        Box<dyn Fn(&ActionFactory<TestDependencies>, &TestDependencies) -> BuildResult + Send + Sync>;

    /// A worker whose pipeline is built by a closure and whose hooks are recorded.
    #[derive(Default)]
    struct TestWorker {
        build: Option<Build>,
        contexts: Mutex<Vec<ActionContext>>,
        results: Mutex<Vec<Value>>,
        errors: Mutex<Vec<String>>,
        concurrency: Option<usize>,
        reject_deps: bool,
        broadcast_status: bool,
    }

    impl TestWorker {
        fn with_pipeline<F>(build: F) -> Self
        where
            F: Fn(&ActionFactory<TestDependencies>, &TestDependencies) -> BuildResult
                + Send
                + Sync
                + 'static,
        {
            Self {
                build: Some(Box::new(build)),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Worker for TestWorker {
        type Deps = TestDependencies;

        fn operation_name(&self) -> &'static str {
            "test_worker"
        }

        fn register_actions(&self, factory: &mut ActionFactory<Self::Deps>) {
            factory.register(NO_OP, |_| Box::new(NoOpAction::default()));
        }

        fn create_action_pipeline(
            &self,
            data: &Value,
            _context: &ActionContext,
            factory: &ActionFactory<Self::Deps>,
            deps: &Self::Deps,
        ) -> Result<Pipeline<Self::Deps>, ActionNotRegisteredError> {
            let mut pipeline = match &self.build {
                Some(build) => build(factory, deps)?,
                None => Vec::new(),
            };
            if self.broadcast_status {
                self.inject_standard_status_actions(&mut pipeline, data);
            }
            Ok(pipeline)
        }

        fn concurrency(&self) -> Option<usize> {
            self.concurrency
        }

        fn validate_dependencies(&self, _deps: &Self::Deps) -> Result<(), WorkerError> {
            if self.reject_deps {
                return Err(WorkerError::MissingDependency("database".to_owned()));
            }
            Ok(())
        }

        async fn on_before_job(&self, _data: &Value, context: &ActionContext) {
            self.contexts.lock().unwrap().push(context.clone());
        }

        async fn on_after_job(&self, _data: &Value, _context: &ActionContext, result: &Value) {
            self.results.lock().unwrap().push(result.clone());
        }

        async fn on_job_error(&self, error: &JobError, _data: &Value, _context: &ActionContext) {
            self.errors.lock().unwrap().push(error.to_string());
        }
    }

    fn idle_options() -> WorkerOptions<TestDependencies> {
        WorkerOptions::default().with_runtime(Arc::new(IdleRuntimeFactory))
    }

    async fn start(worker: TestWorker) -> BaseWorker<TestWorker> {
        start_with(worker, TestDependencies::default(), idle_options()).await
    }

    async fn start_with(
        worker: TestWorker,
        deps: TestDependencies,
        options: WorkerOptions<TestDependencies>,
    ) -> BaseWorker<TestWorker> {
        BaseWorker::start(MemoryQueue::new("test_queue"), worker, deps, options)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn no_op_pipeline_returns_input_unchanged() {
        let worker = start(TestWorker::with_pipeline(|factory, deps| {
            Ok(vec![factory.create(NO_OP, deps)?])
        }))
        .await;
        let input = json!({"jobId": "j1", "someData": "x"});

        let result = worker
            .process_job(Job::new(input.clone()).with_id("j1"))
            .await;

        assert_matches!(result, Ok(value) if value == input);
        assert_eq!(worker.worker().results.lock().unwrap().clone(), vec![input]);
    }

    #[tokio::test]
    async fn empty_pipeline_passes_data_through() {
        let worker = start(TestWorker::default()).await;

        let result = worker.process_job(Job::new(json!({"a": 1}))).await;

        assert_matches!(result, Ok(value) if value == json!({"a": 1}));
    }

    #[tokio::test]
    async fn validation_failure_is_not_retried() {
        let worker = start(TestWorker::with_pipeline(|_, _| {
            let validation = ValidationAction::new(|_| Some(ActionValidationError::new("bad")));
            let pipeline: Pipeline<TestDependencies> = vec![Box::new(validation)];
            Ok(pipeline)
        }))
        .await;

        let result = worker.process_job(Job::new(json!({})).with_id("j1")).await;

        let error = result.unwrap_err();
        assert_eq!(error.failed_action(), Some(VALIDATION));
        assert_matches!(
            error,
            JobError::Execution(ActionExecutionError {
                original_error: ActionError::Validation(error),
                ..
            }) if error.message == "bad"
        );
    }

    #[tokio::test]
    async fn context_reflects_redeliveries() {
        let worker = start(TestWorker::default()).await;

        worker
            .process_job(Job::new(json!({})).with_id("j1").with_attempts_made(3))
            .await
            .unwrap();

        let contexts = worker.worker().contexts.lock().unwrap().clone();
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].retry_count, 3);
        assert_eq!(contexts[0].attempt_number, 4);
        assert_eq!(contexts[0].job_id, "j1");
        assert_eq!(contexts[0].queue_name, "test_queue");
        assert_eq!(contexts[0].operation, "test_worker");
    }

    #[tokio::test]
    async fn first_failure_stops_the_pipeline() {
        let second = ScriptedAction::new("second");
        let second_calls = second.calls();
        let second = Mutex::new(Some(second));
        let worker = start(TestWorker::with_pipeline(move |_, _| {
            let first = ScriptedAction::new("first").then_fail("exploded");
            let mut pipeline: Pipeline<TestDependencies> = vec![Box::new(first)];
            if let Some(second) = second.lock().unwrap().take() {
                pipeline.push(Box::new(second));
            }
            Ok(pipeline)
        }))
        .await;

        let result = worker.process_job(Job::new(json!({})).with_id("j1")).await;

        let error = result.unwrap_err();
        assert_eq!(error.failed_action(), Some("first"));
        assert_eq!(error.to_string(), "Action first failed: exploded");
        assert_matches!(
            &error,
            JobError::Execution(ActionExecutionError {
                operation,
                job_id,
                original_error: ActionError::Message(message),
                ..
            }) if operation == "test_worker" && job_id == "j1" && message == "exploded"
        );
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            worker.worker().errors.lock().unwrap().clone(),
            vec!["Action first failed: exploded".to_owned()]
        );
    }

    #[tokio::test]
    async fn actions_are_threaded_in_order() {
        let worker = start(TestWorker::with_pipeline(|_, _| {
            let pipeline: Pipeline<TestDependencies> = vec![
                Box::new(ScriptedAction::new("one").then_succeed(json!(1))),
                Box::new(ScriptedAction::new("two").then_succeed(json!(2))),
            ];
            Ok(pipeline)
        }))
        .await;

        let result = worker.process_job(Job::new(json!(0))).await;

        assert_matches!(result, Ok(value) if value == json!(2));
    }

    #[tokio::test]
    async fn unregistered_actions_fail_the_job() {
        let worker = start(TestWorker::with_pipeline(|factory, deps| {
            Ok(vec![factory.create("missing_action", deps)?])
        }))
        .await;

        let result = worker.process_job(Job::new(json!({}))).await;

        assert_matches!(result, Err(JobError::Pipeline(error)) if error.name == "missing_action");
        assert_eq!(worker.worker().errors.lock().unwrap().len(), 1);
    }

    /// A cacheable action counting how often it actually runs.
    struct CountingFetch(Arc<AtomicUsize>);

    #[async_trait]
    impl Action<TestDependencies> for CountingFetch {
        fn name(&self) -> &str {
            "fetch_page"
        }

        fn config(&self) -> ActionConfig {
            ActionConfig::DEFAULT.cacheable(true)
        }

        async fn execute(
            &self,
            data: &Value,
            _deps: &TestDependencies,
            _context: &ActionContext,
        ) -> ActionResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"fetched": data}))
        }
    }

    #[tokio::test]
    async fn cacheable_actions_are_served_from_the_cache_per_job() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let worker = start(TestWorker::with_pipeline({
            let fetches = fetches.clone();
            move |_, _| {
                let pipeline: Pipeline<TestDependencies> =
                    vec![Box::new(CountingFetch(fetches.clone()))];
                Ok(pipeline)
            }
        }))
        .await;
        let job = |id: &str, url: &str| Job::new(json!({"url": url})).with_id(id);

        let first = worker.process_job(job("j1", "x")).await.unwrap();
        let second = worker.process_job(job("j1", "x")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        worker.process_job(job("j2", "x")).await.unwrap();
        worker.process_job(job("j1", "y")).await.unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 3);
        assert_eq!(worker.cache().stats().size, 3);
    }

    #[tokio::test]
    async fn records_job_and_action_metrics() {
        let mut metrics = MockMetricsRecorder::new();
        metrics
            .expect_record_action_execution_time()
            .with(eq("first"), always(), eq(true))
            .times(1)
            .return_const(());
        metrics
            .expect_record_action_execution_time()
            .with(eq("second"), always(), eq(false))
            .times(1)
            .return_const(());
        metrics
            .expect_record_job_processing_time()
            .with(eq("test_worker"), always(), eq(false))
            .times(1)
            .return_const(());
        metrics
            .expect_record_worker_status()
            .with(eq("test_worker"), eq(true))
            .times(1)
            .return_const(());
        let options = idle_options().with_metrics(Arc::new(metrics));
        let worker = start_with(
            TestWorker::with_pipeline(|_, _| {
                let pipeline: Pipeline<TestDependencies> = vec![
                    Box::new(ScriptedAction::new("first")),
                    Box::new(ScriptedAction::new("second").then_fail("no")),
                ];
                Ok(pipeline)
            }),
            TestDependencies::default(),
            options,
        )
        .await;

        let result = worker.process_job(Job::new(json!({}))).await;
        let status = worker.status();

        assert_matches!(result, Err(_));
        assert_eq!(
            status,
            WorkerStatus {
                is_running: true,
                name: "test_worker".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn standard_status_actions_broadcast_around_the_pipeline() {
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let deps = TestDependencies::default().with_broadcaster(broadcaster.clone());
        let worker = start_with(
            TestWorker {
                broadcast_status: true,
                ..TestWorker::with_pipeline(|factory, deps| Ok(vec![factory.create(NO_OP, deps)?]))
            },
            deps,
            idle_options(),
        )
        .await;

        worker.process_job(Job::new(json!({"noteId": "n1"}))).await.unwrap();

        let statuses: Vec<_> = broadcaster
            .events()
            .into_iter()
            .map(|event| (event.status, event.note_id))
            .collect();
        assert_eq!(
            statuses,
            vec![
                (STATUS_PROCESSING.to_owned(), Some("n1".to_owned())),
                (STATUS_COMPLETED.to_owned(), Some("n1".to_owned())),
            ]
        );
    }

    /// A worker whose progress nobody watches.
    struct BackgroundWorker;

    impl Worker for BackgroundWorker {
        type Deps = TestDependencies;

        fn operation_name(&self) -> &'static str {
            "background"
        }

        fn register_actions(&self, factory: &mut ActionFactory<Self::Deps>) {
            factory.register(NO_OP, |_| Box::new(NoOpAction::default()));
        }

        fn create_action_pipeline(
            &self,
            data: &Value,
            _context: &ActionContext,
            factory: &ActionFactory<Self::Deps>,
            deps: &Self::Deps,
        ) -> Result<Pipeline<Self::Deps>, ActionNotRegisteredError> {
            let mut pipeline = vec![factory.create(NO_OP, deps)?];
            self.inject_standard_status_actions(&mut pipeline, data);
            Ok(pipeline)
        }

        fn inject_standard_status_actions(
            &self,
            _actions: &mut Pipeline<Self::Deps>,
            _data: &Value,
        ) {
        }
    }

    #[tokio::test]
    async fn workers_can_opt_out_of_status_actions() {
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let deps = TestDependencies::default().with_broadcaster(broadcaster.clone());
        let worker = BaseWorker::start(
            MemoryQueue::new("background"),
            BackgroundWorker,
            deps,
            idle_options(),
        )
        .await
        .unwrap();
        let input = json!({"noteId": "n1"});

        let result = worker.process_job(Job::new(input.clone())).await.unwrap();

        assert_eq!(result, input);
        assert!(broadcaster.events().is_empty());
    }

    #[tokio::test]
    async fn cache_hits_skip_the_wrapped_action() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let deps = TestDependencies::default().with_broadcaster(broadcaster.clone());
        let worker = start_with(
            TestWorker::with_pipeline({
                let fetches = fetches.clone();
                move |_, _| {
                    let fetch: BoxAction<TestDependencies> =
                        Box::new(CountingFetch(fetches.clone()));
                    Ok(vec![with_status_broadcast::<TestDependencies>()(fetch)])
                }
            }),
            deps,
            idle_options(),
        )
        .await;
        let job = || Job::new(json!({"url": "x"})).with_id("j1");

        worker.process_job(job()).await.unwrap();
        worker.process_job(job()).await.unwrap();

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(broadcaster.events().len(), 2);
    }

    /// Rejects input without a `noteId`, counting executions.
    struct RequiresNote(Arc<AtomicUsize>);

    #[async_trait]
    impl Action<TestDependencies> for RequiresNote {
        fn name(&self) -> &str {
            "save_note"
        }

        fn validate_input(&self, data: &Value) -> Option<ActionValidationError> {
            data.get("noteId")
                .is_none()
                .then(|| ActionValidationError::new("noteId is required"))
        }

        async fn execute(
            &self,
            data: &Value,
            _deps: &TestDependencies,
            _context: &ActionContext,
        ) -> ActionResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(data.clone())
        }
    }

    #[tokio::test]
    async fn rejected_input_fails_without_executing() {
        let executions = Arc::new(AtomicUsize::new(0));
        let worker = start(TestWorker::with_pipeline({
            let executions = executions.clone();
            move |_, _| {
                let pipeline: Pipeline<TestDependencies> =
                    vec![Box::new(RequiresNote(executions.clone()))];
                Ok(pipeline)
            }
        }))
        .await;

        let result = worker.process_job(Job::new(json!({})).with_id("j1")).await;

        assert_matches!(
            result,
            Err(JobError::Execution(ActionExecutionError {
                action,
                original_error: ActionError::Validation(error),
                ..
            })) if action == "save_note" && error.message == "noteId is required"
        );
        assert_eq!(executions.load(Ordering::SeqCst), 0);

        let result = worker
            .process_job(Job::new(json!({"noteId": "n1"})).with_id("j2"))
            .await;
        assert_matches!(result, Ok(_));
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_results_of_finished_jobs_are_swept() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let worker = start_with(
            TestWorker::with_pipeline({
                let fetches = fetches.clone();
                move |_, _| {
                    let pipeline: Pipeline<TestDependencies> =
                        vec![Box::new(CountingFetch(fetches.clone()))];
                    Ok(pipeline)
                }
            }),
            TestDependencies::default(),
            idle_options().with_cache_cleanup_interval(Duration::from_secs(30)),
        )
        .await;
        for id in 0..50 {
            let job = Job::new(json!({"url": "x"})).with_id(id.to_string());
            worker.process_job(job).await.unwrap();
        }
        assert_eq!(worker.cache().stats().size, 50);

        tokio::time::sleep(DEFAULT_TTL + Duration::from_secs(60)).await;

        assert_eq!(worker.cache().stats().size, 0);
        worker.close().await.unwrap();
    }

    #[tokio::test]
    async fn rejected_dependencies_prevent_start() {
        let worker = TestWorker {
            reject_deps: true,
            ..Default::default()
        };

        let result = BaseWorker::start(
            MemoryQueue::new("test_queue"),
            worker,
            TestDependencies::default(),
            idle_options(),
        )
        .await;

        assert_matches!(result.err(), Some(WorkerError::MissingDependency(name)) if name == "database");
    }

    #[tokio::test]
    async fn concurrency_defaults_and_overrides() {
        let worker = start(TestWorker::default()).await;
        assert_eq!(worker.concurrency(), 5);

        let worker = start_with(
            TestWorker::default(),
            TestDependencies::default(),
            idle_options().with_config(WorkerConfig::new().with_concurrency(2)),
        )
        .await;
        assert_eq!(worker.concurrency(), 2);

        let worker = start(TestWorker {
            concurrency: Some(9),
            ..Default::default()
        })
        .await;
        assert_eq!(worker.concurrency(), 9);
    }

    #[tokio::test]
    async fn base_dependencies_require_a_container() {
        let worker = start(TestWorker::default()).await;
        assert_matches!(
            worker.build_base_worker_dependencies(),
            Err(WorkerError::ContainerUnavailable(_))
        );

        let worker = start_with(
            TestWorker::default(),
            TestDependencies::default(),
            idle_options().with_container(ServiceContainer::new()),
        )
        .await;
        assert_matches!(worker.build_base_worker_dependencies(), Ok(_));
    }

    #[tokio::test]
    async fn convenience_compositions_use_the_worker_factory() {
        let worker = start(TestWorker::default()).await;

        let action = worker.create_retryable_error_handled_action(NO_OP).unwrap();
        assert_eq!(action.name(), "error_handling_wrapper(retry_wrapper(no_op))");

        let action = worker.create_error_handled_action_only(NO_OP).unwrap();
        assert_eq!(action.name(), "error_handling_wrapper(no_op)");

        assert!(worker.create_error_handled_action_only("other").is_err());
    }

    #[tokio::test]
    async fn consumes_the_queue_until_closed() {
        let queue = MemoryQueue::new("test_queue");
        let worker = BaseWorker::start(
            queue.clone(),
            TestWorker::default(),
            TestDependencies::default(),
            WorkerOptions::default(),
        )
        .await
        .unwrap();

        queue.enqueue(json!({"n": 1})).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while queue.completed().is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(worker.status().is_running);
        worker.close().await.unwrap();
        assert!(!worker.status().is_running);
        assert_eq!(queue.completed()[0].1, json!({"n": 1}));
    }
}
