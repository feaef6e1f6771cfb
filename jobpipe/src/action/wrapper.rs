//! Decorators layering cross-cutting behaviour onto actions.
//!
//! A wrapper takes an action and is itself an action with the same contract. Wrappers never turn
//! a failure into a success: every failure they observe is returned to the caller.
//!
//! Wrappers compose by nesting, the outermost wrapper being the first to see both the call and
//! its failure:
//!
//! ```
//! # use jobpipe::prelude::*;
//! let action: BoxAction<()> = Box::new(NoOpAction::default());
//! let action = ErrorHandlingWrapper::wrap(RetryWrapper::wrap(action));
//!
//! assert_eq!(action.name(), "error_handling_wrapper(retry_wrapper(no_op))");
//! assert_eq!(action.display_name(), "no_op");
//! ```
use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;

use super::{
    error::{ActionError, ActionValidationError},
    log_action_failure,
    status::{broadcast_status, STATUS_COMPLETED, STATUS_PROCESSING},
    Action, ActionConfig, ActionResult, BoxAction, ErrorHook,
};
use crate::{
    backoff::{BackoffStrategy, Exponential, Jitter, Strategy},
    deps::{Dependencies, StatusEvent},
    job::ActionContext,
};

/// Wraps an action into another action. Used to register wrapper chains with the
/// [`ActionFactory`](super::factory::ActionFactory).
pub type ActionWrapper<D> = Arc<dyn Fn(BoxAction<D>) -> BoxAction<D> + Send + Sync>;

/// The default backoff between action attempts:
///  - exponential backoff starting at 200 milliseconds,
///  - capped at 5 seconds,
///  - with a 10% jitter margin.
pub const DEFAULT_RETRY_BACKOFF: BackoffStrategy<Exponential> =
    BackoffStrategy::exponential(Duration::from_millis(200))
        .with_max(Duration::from_secs(5))
        .with_jitter(Jitter::Relative(0.1));

/// The default number of attempts, including the first, made by a [`RetryWrapper`].
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// How many times and how patiently a [`RetryWrapper`] retries.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Arc<dyn Strategy + Send + Sync>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Arc::new(DEFAULT_RETRY_BACKOFF),
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Total number of attempts, at least one.
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

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff.backoff(attempt)
    }
}

/// Re-invokes the wrapped action on failure, waiting between attempts.
///
/// Actions that are not [retryable](Action::retryable), and validation failures, are not
/// retried. Once all attempts are exhausted the last failure is returned.
pub struct RetryWrapper<D: Dependencies> {
    name: String,
    inner: BoxAction<D>,
    policy: RetryPolicy,
}

impl<D: Dependencies> RetryWrapper<D> {
    pub fn new(inner: BoxAction<D>, policy: RetryPolicy) -> Self {
        Self {
            name: format!("retry_wrapper({})", inner.name()),
            inner,
            policy,
        }
    }

    /// Wraps with the default [`RetryPolicy`].
    pub fn wrap(inner: BoxAction<D>) -> BoxAction<D> {
        Box::new(Self::new(inner, RetryPolicy::default()))
    }

    fn should_retry(&self, error: &ActionError, attempt: u32) -> bool {
        attempt < self.policy.max_attempts && self.inner.retryable() && !error.is_validation()
    }
}

#[async_trait]
impl<D: Dependencies> Action<D> for RetryWrapper<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> ActionConfig {
        self.inner.config()
    }

    fn retryable(&self) -> bool {
        self.inner.retryable()
    }

    fn priority(&self) -> i32 {
        self.inner.priority()
    }

    fn cacheable(&self) -> bool {
        self.inner.cacheable()
    }

    fn display_name(&self) -> &str {
        self.inner.display_name()
    }

    fn validate_input(&self, data: &Value) -> Option<ActionValidationError> {
        self.inner.validate_input(data)
    }

    async fn execute(&self, data: &Value, deps: &D, context: &ActionContext) -> ActionResult {
        let mut attempt = 1;
        loop {
            match self.inner.execute(data, deps, context).await {
                Ok(result) => return Ok(result),
                Err(error) if self.should_retry(&error, attempt) => {
                    let delay = self.policy.backoff(attempt);
                    tracing::warn!(
                        action = self.inner.name(),
                        job_id = %context.job_id,
                        attempt,
                        ?delay,
                        "Action {} failed on attempt {attempt}, retrying in {delay:?}: {error}",
                        self.inner.name(),
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn on_error(
        &self,
        error: &ActionError,
        data: &Value,
        deps: &D,
        context: &ActionContext,
    ) -> ErrorHook {
        self.inner.on_error(error, data, deps, context).await
    }
}

/// Reports failures of the wrapped action before returning them.
///
/// Uses the wrapped action's [`Action::on_error`] hook, falling back to logging
/// `"Action {name} failed for job {job_id}: {error}"`.
pub struct ErrorHandlingWrapper<D: Dependencies> {
    name: String,
    inner: BoxAction<D>,
}

impl<D: Dependencies> ErrorHandlingWrapper<D> {
    pub fn new(inner: BoxAction<D>) -> Self {
        Self {
            name: format!("error_handling_wrapper({})", inner.name()),
            inner,
        }
    }

    pub fn wrap(inner: BoxAction<D>) -> BoxAction<D> {
        Box::new(Self::new(inner))
    }
}

#[async_trait]
impl<D: Dependencies> Action<D> for ErrorHandlingWrapper<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> ActionConfig {
        self.inner.config()
    }

    fn retryable(&self) -> bool {
        self.inner.retryable()
    }

    fn priority(&self) -> i32 {
        self.inner.priority()
    }

    fn cacheable(&self) -> bool {
        self.inner.cacheable()
    }

    fn display_name(&self) -> &str {
        self.inner.display_name()
    }

    fn validate_input(&self, data: &Value) -> Option<ActionValidationError> {
        self.inner.validate_input(data)
    }

    async fn execute(&self, data: &Value, deps: &D, context: &ActionContext) -> ActionResult {
        let result = self.inner.execute(data, deps, context).await;
        if let Err(error) = &result {
            if self.inner.on_error(error, data, deps, context).await == ErrorHook::Unhandled {
                log_action_failure(self.inner.name(), error, deps, context);
            }
        }
        result
    }

    async fn on_error(
        &self,
        error: &ActionError,
        data: &Value,
        deps: &D,
        context: &ActionContext,
    ) -> ErrorHook {
        self.inner.on_error(error, data, deps, context).await
    }
}

/// Broadcasts a processing event before and a completed event after the wrapped action.
///
/// Broadcast failures are logged and otherwise ignored.
pub struct StatusBroadcastWrapper<D: Dependencies> {
    name: String,
    inner: BoxAction<D>,
}

impl<D: Dependencies> StatusBroadcastWrapper<D> {
    pub fn new(inner: BoxAction<D>) -> Self {
        Self {
            name: format!("status_broadcast_wrapper({})", inner.name()),
            inner,
        }
    }

    pub fn wrap(inner: BoxAction<D>) -> BoxAction<D> {
        Box::new(Self::new(inner))
    }

    fn event(&self, data: &Value, context: &ActionContext, status: &str, verb: &str) -> StatusEvent {
        StatusEvent::for_job_data(data, status)
            .with_message(format!("{verb} {}", self.inner.display_name()))
            .with_context(context.operation.clone())
    }
}

#[async_trait]
impl<D: Dependencies> Action<D> for StatusBroadcastWrapper<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> ActionConfig {
        self.inner.config()
    }

    fn retryable(&self) -> bool {
        self.inner.retryable()
    }

    fn priority(&self) -> i32 {
        self.inner.priority()
    }

    fn cacheable(&self) -> bool {
        self.inner.cacheable()
    }

    fn display_name(&self) -> &str {
        self.inner.display_name()
    }

    fn validate_input(&self, data: &Value) -> Option<ActionValidationError> {
        self.inner.validate_input(data)
    }

    async fn execute(&self, data: &Value, deps: &D, context: &ActionContext) -> ActionResult {
        let processing = self.event(data, context, STATUS_PROCESSING, "Running");
        broadcast_status(deps, processing).await;

        let result = self.inner.execute(data, deps, context).await?;

        let completed = self.event(data, context, STATUS_COMPLETED, "Completed");
        broadcast_status(deps, completed).await;
        Ok(result)
    }

    async fn on_error(
        &self,
        error: &ActionError,
        data: &Value,
        deps: &D,
        context: &ActionContext,
    ) -> ErrorHook {
        self.inner.on_error(error, data, deps, context).await
    }
}

/// Marks the wrapped action as cacheable, leaving everything else, including its name, as is.
pub struct CacheableAction<D: Dependencies> {
    inner: BoxAction<D>,
}

impl<D: Dependencies> CacheableAction<D> {
    pub fn wrap(inner: BoxAction<D>) -> BoxAction<D> {
        Box::new(Self { inner })
    }
}

#[async_trait]
impl<D: Dependencies> Action<D> for CacheableAction<D> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn config(&self) -> ActionConfig {
        self.inner.config().cacheable(true)
    }

    fn retryable(&self) -> bool {
        self.inner.retryable()
    }

    fn priority(&self) -> i32 {
        self.inner.priority()
    }

    fn cacheable(&self) -> bool {
        true
    }

    fn display_name(&self) -> &str {
        self.inner.display_name()
    }

    fn validate_input(&self, data: &Value) -> Option<ActionValidationError> {
        self.inner.validate_input(data)
    }

    async fn execute(&self, data: &Value, deps: &D, context: &ActionContext) -> ActionResult {
        self.inner.execute(data, deps, context).await
    }

    async fn on_error(
        &self,
        error: &ActionError,
        data: &Value,
        deps: &D,
        context: &ActionContext,
    ) -> ErrorHook {
        self.inner.on_error(error, data, deps, context).await
    }
}

/// [`ActionWrapper`] applying a [`RetryWrapper`] with the given policy.
pub fn with_retry<D: Dependencies>(policy: RetryPolicy) -> ActionWrapper<D> {
    Arc::new(move |inner: BoxAction<D>| -> BoxAction<D> {
        Box::new(RetryWrapper::new(inner, policy.clone()))
    })
}

/// [`ActionWrapper`] applying an [`ErrorHandlingWrapper`].
pub fn with_error_handling<D: Dependencies>() -> ActionWrapper<D> {
    Arc::new(ErrorHandlingWrapper::<D>::wrap)
}

/// [`ActionWrapper`] applying a [`StatusBroadcastWrapper`].
pub fn with_status_broadcast<D: Dependencies>() -> ActionWrapper<D> {
    Arc::new(StatusBroadcastWrapper::<D>::wrap)
}

#[cfg(test)]
mod test {
    use std::sync::{atomic::Ordering, Arc};

    use assert_matches::assert_matches;
    use mockall::predicate::function;
    use serde_json::json;

    use super::*;
    use crate::{
        action::{builtin::NoOpAction, test::context},
        deps::{BroadcastError, MockStatusBroadcaster},
        testing::{RecordingLogger, ScriptedAction, TestDependencies},
    };

    fn fast_retries(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_backoff(BackoffStrategy::constant(Duration::ZERO))
    }

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let action = ScriptedAction::new("fetch_page")
            .then_fail("timeout")
            .then_fail("timeout")
            .then_succeed(json!("page"));
        let calls = action.calls();
        let retry = RetryWrapper::<()>::new(Box::new(action), fast_retries(3));

        let result = retry.execute(&json!({}), &(), &context()).await;

        assert_matches!(result, Ok(value) if value == json!("page"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_returns_last_failure_when_exhausted() {
        let action = ScriptedAction::new("fetch_page")
            .then_fail("first")
            .then_fail("second")
            .then_fail("third");
        let calls = action.calls();
        let retry = RetryWrapper::<()>::new(Box::new(action), fast_retries(2));

        let result = retry.execute(&json!({}), &(), &context()).await;

        assert_matches!(result, Err(ActionError::Message(message)) if message == "second");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_between_attempts() {
        let action = ScriptedAction::new("fetch_page")
            .then_fail("timeout")
            .then_succeed(json!(1));
        let policy = RetryPolicy::default()
            .with_backoff(BackoffStrategy::constant(Duration::from_secs(3)));
        let retry = RetryWrapper::<()>::new(Box::new(action), policy);
        let start = tokio::time::Instant::now();

        let result = retry.execute(&json!({}), &(), &context()).await;

        assert_matches!(result, Ok(_));
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn retry_does_not_repeat_non_retryable_actions() {
        let action = ScriptedAction::new("save")
            .non_retryable()
            .then_fail("constraint violated");
        let calls = action.calls();
        let retry = RetryWrapper::<()>::new(Box::new(action), fast_retries(3));

        let result = retry.execute(&json!({}), &(), &context()).await;

        assert_matches!(result, Err(_));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_does_not_repeat_validation_failures() {
        let action = ScriptedAction::new("parse")
            .then_fail(ActionValidationError::new("missing field"));
        let calls = action.calls();
        let retry = RetryWrapper::<()>::new(Box::new(action), fast_retries(3));

        let result = retry.execute(&json!({}), &(), &context()).await;

        assert_matches!(result, Err(ActionError::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_handling_logs_and_rethrows() {
        let logger = Arc::new(RecordingLogger::default());
        let deps = TestDependencies::with_logger(logger.clone());
        let action = ScriptedAction::new("save_note").then_fail("disk full");
        let wrapped = ErrorHandlingWrapper::<TestDependencies>::new(Box::new(action));

        let result = wrapped.execute(&json!({}), &deps, &context()).await;

        assert_matches!(result, Err(ActionError::Message(message)) if message == "disk full");
        assert_eq!(
            logger.messages(),
            vec!["Action save_note failed for job job-1: disk full".to_owned()]
        );
    }

    #[tokio::test]
    async fn error_handling_defers_to_custom_hook() {
        let logger = Arc::new(RecordingLogger::default());
        let deps = TestDependencies::with_logger(logger.clone());
        let action = ScriptedAction::new("save_note")
            .handles_errors()
            .then_fail(json!(null));
        let hooks = action.hook_calls();
        let wrapped = ErrorHandlingWrapper::<TestDependencies>::new(Box::new(action));

        let result = wrapped.execute(&json!({}), &deps, &context()).await;

        assert_matches!(result, Err(ActionError::Value(Value::Null)));
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
        assert!(logger.messages().is_empty());
    }

    #[tokio::test]
    async fn error_handling_passes_success_through() {
        let wrapped = ErrorHandlingWrapper::<()>::new(Box::new(NoOpAction::default()));

        let result = wrapped.execute(&json!({"a": 1}), &(), &context()).await;

        assert_matches!(result, Ok(value) if value == json!({"a": 1}));
    }

    #[tokio::test]
    async fn status_broadcast_emits_processing_then_completed() {
        let mut broadcaster = MockStatusBroadcaster::new();
        let mut sequence = mockall::Sequence::new();
        broadcaster
            .expect_add_status_event_and_broadcast()
            .with(function(|event: &StatusEvent| {
                event.status == STATUS_PROCESSING && event.note_id.as_deref() == Some("n1")
            }))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(()));
        broadcaster
            .expect_add_status_event_and_broadcast()
            .with(function(|event: &StatusEvent| event.status == STATUS_COMPLETED))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Err(BroadcastError("socket closed".to_owned())));
        let deps = TestDependencies::default().with_broadcaster(Arc::new(broadcaster));
        let wrapped =
            StatusBroadcastWrapper::<TestDependencies>::new(Box::new(NoOpAction::default()));

        let result = wrapped
            .execute(&json!({"noteId": "n1"}), &deps, &context())
            .await;

        assert_matches!(result, Ok(_));
    }

    #[test]
    fn last_wrapper_is_outermost() {
        let action: BoxAction<()> = Box::new(NoOpAction::named("parse_html"));
        let wrapped = with_error_handling()(with_retry(RetryPolicy::default())(action));

        assert_eq!(
            wrapped.name(),
            "error_handling_wrapper(retry_wrapper(parse_html))"
        );
        assert_eq!(wrapped.display_name(), "parse_html");
    }

    #[test]
    fn cacheable_marker_keeps_name() {
        let action = CacheableAction::<()>::wrap(Box::new(NoOpAction::named("fetch_page")));

        assert_eq!(action.name(), "fetch_page");
        assert!(action.cacheable());
        assert!(action.retryable());
    }
}
