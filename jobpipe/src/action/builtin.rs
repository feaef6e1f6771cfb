//! General purpose actions.
use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;

use super::{
    error::ActionValidationError, Action, ActionConfig, ActionResult, Configurable,
};
use crate::{
    deps::{Dependencies, LogLevel},
    job::ActionContext,
};

pub const NO_OP: &str = "no_op";
pub const VALIDATION: &str = "validation";
pub const LOGGING: &str = "logging";

/// Passes its input through unchanged.
#[derive(Debug, Clone)]
pub struct NoOpAction {
    name: String,
    config: ActionConfig,
}

impl Default for NoOpAction {
    fn default() -> Self {
        Self::named(NO_OP)
    }
}

impl NoOpAction {
    /// A pass-through action registered under a different name, e.g. as a placeholder.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: ActionConfig::DEFAULT,
        }
    }
}

impl Configurable for NoOpAction {
    fn config_mut(&mut self) -> &mut ActionConfig {
        &mut self.config
    }
}

#[async_trait]
impl<D: Dependencies> Action<D> for NoOpAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> ActionConfig {
        self.config
    }

    async fn execute(&self, data: &Value, _deps: &D, _context: &ActionContext) -> ActionResult {
        Ok(data.clone())
    }
}

type Validator = Arc<dyn Fn(&Value) -> Option<ActionValidationError> + Send + Sync>;

/// Runs a validator over its input, failing with the validator's error or passing the data
/// through.
///
/// Validation failures are not retryable.
#[derive(Clone)]
pub struct ValidationAction {
    validator: Validator,
    config: ActionConfig,
}

impl ValidationAction {
    pub fn new<F>(validator: F) -> Self
    where
        F: Fn(&Value) -> Option<ActionValidationError> + Send + Sync + 'static,
    {
        Self {
            validator: Arc::new(validator),
            config: ActionConfig::DEFAULT.retryable(false),
        }
    }
}

impl fmt::Debug for ValidationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationAction")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Configurable for ValidationAction {
    fn config_mut(&mut self) -> &mut ActionConfig {
        &mut self.config
    }
}

#[async_trait]
impl<D: Dependencies> Action<D> for ValidationAction {
    fn name(&self) -> &str {
        VALIDATION
    }

    fn config(&self) -> ActionConfig {
        self.config
    }

    fn validate_input(&self, data: &Value) -> Option<ActionValidationError> {
        (self.validator)(data)
    }

    async fn execute(&self, data: &Value, _deps: &D, _context: &ActionContext) -> ActionResult {
        match Action::<D>::validate_input(self, data) {
            Some(error) => Err(error.into()),
            None => Ok(data.clone()),
        }
    }
}

type MessageFn = Arc<dyn Fn(&Value, &ActionContext) -> String + Send + Sync>;

#[derive(Clone)]
enum LogMessage {
    Static(String),
    Dynamic(MessageFn),
}

/// Logs a message prefixed with the job id and passes its input through unchanged.
#[derive(Clone)]
pub struct LoggingAction {
    message: LogMessage,
    level: LogLevel,
    config: ActionConfig,
}

impl LoggingAction {
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_message(LogMessage::Static(message.into()))
    }

    /// Computes the message from the action's input when executed.
    pub fn dynamic<F>(message: F) -> Self
    where
        F: Fn(&Value, &ActionContext) -> String + Send + Sync + 'static,
    {
        Self::with_message(LogMessage::Dynamic(Arc::new(message)))
    }

    fn with_message(message: LogMessage) -> Self {
        Self {
            message,
            level: LogLevel::Info,
            config: ActionConfig::DEFAULT.retryable(false),
        }
    }

    pub fn with_level(self, level: LogLevel) -> Self {
        Self { level, ..self }
    }

    fn render(&self, data: &Value, context: &ActionContext) -> String {
        let message = match &self.message {
            LogMessage::Static(message) => message.clone(),
            LogMessage::Dynamic(message) => message(data, context),
        };
        format!("[{}] {message}", context.job_id)
    }
}

impl fmt::Debug for LoggingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggingAction")
            .field("level", &self.level)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Configurable for LoggingAction {
    fn config_mut(&mut self) -> &mut ActionConfig {
        &mut self.config
    }
}

#[async_trait]
impl<D: Dependencies> Action<D> for LoggingAction {
    fn name(&self) -> &str {
        LOGGING
    }

    fn config(&self) -> ActionConfig {
        self.config
    }

    async fn execute(&self, data: &Value, deps: &D, context: &ActionContext) -> ActionResult {
        let message = self.render(data, context);
        match deps.logger() {
            Some(logger) => logger.log(&message, self.level, None),
            None => tracing::info!(job_id = %context.job_id, "{message}"),
        }
        Ok(data.clone())
    }
}
