use std::{any::type_name, sync::Arc, time::Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::instrument;

use super::{JobError, Worker};
use crate::{
    action::{
        error::{ActionError, ActionExecutionError},
        factory::ActionFactory,
        Action, ActionResult,
    },
    cache::{action_cache_key, ActionResultCache},
    job::{ActionContext, Job},
    metrics::MetricsRecorder,
    runtime::JobHandler,
};

/// Strings longer than this are cut short when logging action inputs.
pub(crate) const MAX_LOG_STRING_LENGTH: usize = 200;
/// Logged action inputs are cut short beyond this length.
pub(crate) const MAX_LOG_PAYLOAD_LENGTH: usize = 2000;

const TRUNCATED: &str = "...[truncated]";

/// Runs jobs through a worker's pipeline.
pub(crate) struct JobProcessor<W: Worker> {
    worker: W,
    deps: W::Deps,
    factory: ActionFactory<W::Deps>,
    cache: Arc<ActionResultCache>,
    metrics: Arc<dyn MetricsRecorder>,
    queue_name: String,
}

impl<W: Worker> JobProcessor<W> {
    pub(crate) fn new(
        worker: W,
        deps: W::Deps,
        factory: ActionFactory<W::Deps>,
        cache: Arc<ActionResultCache>,
        metrics: Arc<dyn MetricsRecorder>,
        queue_name: String,
    ) -> Self {
        Self {
            worker,
            deps,
            factory,
            cache,
            metrics,
            queue_name,
        }
    }

    pub(crate) fn worker(&self) -> &W {
        &self.worker
    }

    pub(crate) fn deps(&self) -> &W::Deps {
        &self.deps
    }

    pub(crate) fn factory(&self) -> &ActionFactory<W::Deps> {
        &self.factory
    }

    pub(crate) fn cache(&self) -> &ActionResultCache {
        &self.cache
    }

    #[instrument(skip(self, job), fields(job_id, operation = self.worker.operation_name()))]
    pub(crate) async fn process_job(&self, job: Job) -> Result<Value, JobError> {
        let start = Instant::now();
        let operation = self.worker.operation_name();
        let context = ActionContext::for_job(&job, self.queue_name.as_str(), operation);
        let job_id = context.job_id.clone();
        tracing::Span::current().record("job_id", job_id.as_str());
        let data = job.data;

        self.worker.on_before_job(&data, &context).await;
        tracing::info!(
            %job_id,
            attempt = context.attempt_number,
            "Starting job {job_id} for {operation}, attempt {}",
            context.attempt_number
        );

        let result = self.run_pipeline(&data, &context).await;
        let duration = start.elapsed();
        let duration_ms = duration.as_millis();

        match result {
            Ok(result) => {
                self.metrics
                    .record_job_processing_time(operation, duration, true);
                tracing::info!(%job_id, duration_ms, "Completed job {job_id} in {duration_ms}ms");
                self.worker.on_after_job(&data, &context, &result).await;
                Ok(result)
            }
            Err(error) => {
                self.metrics
                    .record_job_processing_time(operation, duration, false);
                tracing::error!(
                    %job_id,
                    duration_ms,
                    ?error,
                    "Job {job_id} failed after {duration_ms}ms: {error}"
                );
                self.worker.on_job_error(&error, &data, &context).await;
                Err(error)
            }
        }
    }

    async fn run_pipeline(&self, data: &Value, context: &ActionContext) -> Result<Value, JobError> {
        let pipeline =
            self.worker
                .create_action_pipeline(data, context, &self.factory, &self.deps)?;

        let mut current = data.clone();
        for action in &pipeline {
            let display_name = action.display_name();
            tracing::debug!(
                action = display_name,
                input = %truncate_for_log(&current),
                "Executing action {display_name}"
            );

            let start = Instant::now();
            let result = match action.validate_input(&current) {
                Some(error) => {
                    tracing::debug!(action = display_name, %error, "Rejected input: {error}");
                    Err(ActionError::Validation(error))
                }
                None if action.cacheable() => {
                    self.execute_cached(action.as_ref(), &current, context).await
                }
                None => action.execute(&current, &self.deps, context).await,
            };
            self.metrics
                .record_action_execution_time(action.name(), start.elapsed(), result.is_ok());

            current = result.map_err(|error| {
                ActionExecutionError::new(
                    context.operation.as_str(),
                    action.name(),
                    error,
                    context.job_id.as_str(),
                )
            })?;
        }
        Ok(current)
    }

    async fn execute_cached(
        &self,
        action: &dyn Action<W::Deps>,
        input: &Value,
        context: &ActionContext,
    ) -> ActionResult {
        let key = action_cache_key(action.name(), &context.job_id, input);
        if let Some(cached) = self.cache.get(&key) {
            tracing::debug!(action = action.name(), "Using cached result for {}", action.name());
            return Ok(cached);
        }
        let result = action.execute(input, &self.deps, context).await?;
        self.cache.set(key, result.clone());
        Ok(result)
    }
}

#[async_trait]
impl<W: Worker> JobHandler for JobProcessor<W> {
    async fn handle(&self, job: Job) -> Result<Value, JobError> {
        self.process_job(job).await
    }
}

/// A bounded rendering of a value for logs.
///
/// Long strings anywhere in the value are shortened to [`MAX_LOG_STRING_LENGTH`] characters and
/// the whole rendering to [`MAX_LOG_PAYLOAD_LENGTH`]. Values that cannot be serialized render as
/// `[Object - <type>]`.
pub(crate) fn truncate_for_log<T: Serialize + ?Sized>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(value) => truncate(&truncate_strings(value).to_string(), MAX_LOG_PAYLOAD_LENGTH),
        Err(_) => format!("[Object - {}]", type_name::<T>()),
    }
}

fn truncate_strings(value: Value) -> Value {
    match value {
        Value::String(text) => Value::String(truncate(&text, MAX_LOG_STRING_LENGTH)),
        Value::Array(values) => values.into_iter().map(truncate_strings).collect(),
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(key, value)| (key, truncate_strings(value)))
                .collect(),
        ),
        value => value,
    }
}

fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((end, _)) => format!("{}{TRUNCATED}", &text[..end]),
        None => text.to_owned(),
    }
}
