//! Actions: the units of work a job's pipeline is made of.
//!
//! An [`Action`] has a stable name, metadata ([`ActionConfig`]) and an `execute` function taking
//! the previous action's output, the worker's dependencies and the [`ActionContext`].
//!
//! Cross-cutting behaviour is layered on by wrapping actions, see [`wrapper`]. Actions are
//! normally created through an [`factory::ActionFactory`].
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    deps::{Dependencies, LogLevel},
    job::ActionContext,
};

pub mod builtin;
pub mod error;
pub mod factory;
pub mod status;
pub mod wrapper;

use error::{ActionError, ActionValidationError};

/// The result of executing an action.
pub type ActionResult = Result<Value, ActionError>;

/// A boxed action, as stored in pipelines and produced by factories and wrappers.
pub type BoxAction<D> = Box<dyn Action<D>>;

/// The ordered actions to run for a single job.
pub type Pipeline<D> = Vec<BoxAction<D>>;

/// Metadata every action declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionConfig {
    /// Whether a [`wrapper::RetryWrapper`] may re-invoke the action after a failure.
    pub retryable: bool,
    pub priority: i32,
    /// Whether results may be served from the worker's
    /// [`crate::cache::ActionResultCache`].
    pub cacheable: bool,
}

impl ActionConfig {
    pub const DEFAULT: Self = Self {
        retryable: true,
        priority: 0,
        cacheable: false,
    };

    pub const fn retryable(self, retryable: bool) -> Self {
        Self { retryable, ..self }
    }

    pub const fn priority(self, priority: i32) -> Self {
        Self { priority, ..self }
    }

    pub const fn cacheable(self, cacheable: bool) -> Self {
        Self { cacheable, ..self }
    }
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Partial overrides of an [`ActionConfig`], see [`Configurable::with_config`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub retryable: Option<bool>,
    pub priority: Option<i32>,
    pub cacheable: Option<bool>,
}

impl ConfigOverrides {
    pub fn apply(self, config: ActionConfig) -> ActionConfig {
        ActionConfig {
            retryable: self.retryable.unwrap_or(config.retryable),
            priority: self.priority.unwrap_or(config.priority),
            cacheable: self.cacheable.unwrap_or(config.cacheable),
        }
    }
}

/// Whether an action's [`Action::on_error`] hook took care of reporting a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHook {
    Handled,
    Unhandled,
}

/// A named unit of work.
///
/// Actions should not keep state between calls. When wrapped in a [`wrapper::RetryWrapper`],
/// `execute` may be invoked several times with the same input, so it must be safe to re-invoke.
#[async_trait]
pub trait Action<D: Dependencies>: Send + Sync {
    /// The name of the action.
    ///
    /// Used for logging, metrics, cache keys and the names of wrappers built around the action.
    fn name(&self) -> &str;

    fn config(&self) -> ActionConfig {
        ActionConfig::DEFAULT
    }

    fn retryable(&self) -> bool {
        self.config().retryable
    }

    fn priority(&self) -> i32 {
        self.config().priority
    }

    fn cacheable(&self) -> bool {
        self.config().cacheable
    }

    /// The name of the innermost action, ignoring any wrappers.
    fn display_name(&self) -> &str {
        self.name()
    }

    /// Rejects malformed input before `execute` runs. By default accepts everything.
    fn validate_input(&self, _data: &Value) -> Option<ActionValidationError> {
        None
    }

    async fn execute(&self, data: &Value, deps: &D, context: &ActionContext) -> ActionResult;

    /// Custom error reporting.
    ///
    /// Returning [`ErrorHook::Unhandled`], the default, lets the caller fall back to logging the
    /// failure itself. The hook only observes the failure, it never recovers from it.
    async fn on_error(
        &self,
        _error: &ActionError,
        _data: &Value,
        _deps: &D,
        _context: &ActionContext,
    ) -> ErrorHook {
        ErrorHook::Unhandled
    }
}

/// Actions whose metadata can be overridden, producing a new instance.
pub trait Configurable: Clone {
    fn config_mut(&mut self) -> &mut ActionConfig;

    /// Returns a copy of the action with the given overrides applied, leaving `self` untouched.
    fn with_config(&self, overrides: ConfigOverrides) -> Self {
        let mut action = self.clone();
        let config = action.config_mut();
        *config = overrides.apply(*config);
        action
    }
}

/// The outcome of [`execute_with_timing`].
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<ActionError>,
    pub duration: Duration,
}

/// Executes an action measuring its wall-clock duration.
///
/// Never fails: failures are reported through the action's [`Action::on_error`] hook, or logged,
/// and returned in the [`ActionOutcome`].
pub async fn execute_with_timing<D, A>(
    action: &A,
    data: &Value,
    deps: &D,
    context: &ActionContext,
) -> ActionOutcome
where
    D: Dependencies,
    A: Action<D> + ?Sized,
{
    let start = Instant::now();
    let result = action.execute(data, deps, context).await;
    let duration = start.elapsed();

    match result {
        Ok(data) => ActionOutcome {
            success: true,
            data: Some(data),
            error: None,
            duration,
        },
        Err(error) => {
            if action.on_error(&error, data, deps, context).await == ErrorHook::Unhandled {
                log_action_failure(action.name(), &error, deps, context);
            }
            ActionOutcome {
                success: false,
                data: None,
                error: Some(error),
                duration,
            }
        }
    }
}

pub(crate) fn log_action_failure<D: Dependencies>(
    name: &str,
    error: &ActionError,
    deps: &D,
    context: &ActionContext,
) {
    let job_id = &context.job_id;
    let message = format!("Action {name} failed for job {job_id}: {error}");
    match deps.logger() {
        Some(logger) => logger.log(&message, LogLevel::Error, None),
        None => tracing::error!(action = name, %job_id, ?error, "{message}"),
    }
}
