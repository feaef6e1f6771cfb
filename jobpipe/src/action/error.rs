use std::{error::Error, fmt, sync::Arc};

use serde_json::Value;
use thiserror::Error;

/// Rendering used for failures whose cause carries no readable message.
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// The cause of an action failure.
///
/// Actions may fail with structured errors, plain messages or arbitrary values. All of them are
/// kept intact through wrapping layers so that whoever ends up handling the failure can inspect
/// the original cause.
#[derive(Debug, Clone)]
pub enum ActionError {
    /// The action rejected its input.
    Validation(ActionValidationError),
    /// A structured error.
    Failed(Arc<dyn Error + Send + Sync>),
    /// A plain message.
    Message(String),
    /// Any other value, e.g. a number or `null`.
    Value(Value),
}

impl ActionError {
    pub fn failed(error: impl Error + Send + Sync + 'static) -> Self {
        Self::Failed(Arc::new(error))
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Wraps an arbitrary value. String values are kept as [`ActionError::Message`].
    pub fn value(value: Value) -> Self {
        match value {
            Value::String(message) => Self::Message(message),
            value => Self::Value(value),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns the underlying structured error, if any.
    pub fn as_error(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        match self {
            Self::Validation(error) => Some(error),
            Self::Failed(error) => Some(error.as_ref()),
            Self::Message(_) | Self::Value(_) => None,
        }
    }

    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        self.as_error().and_then(|error| error.downcast_ref::<E>())
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(error) => write!(f, "{error}"),
            Self::Failed(error) => write!(f, "{error}"),
            Self::Message(message) => write!(f, "{message}"),
            Self::Value(_) => write!(f, "{UNKNOWN_ERROR}"),
        }
    }
}

impl From<ActionValidationError> for ActionError {
    fn from(value: ActionValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<String> for ActionError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

impl From<&str> for ActionError {
    fn from(value: &str) -> Self {
        Self::Message(value.to_owned())
    }
}

impl From<Value> for ActionError {
    fn from(value: Value) -> Self {
        Self::value(value)
    }
}

impl From<serde_json::Error> for ActionError {
    fn from(value: serde_json::Error) -> Self {
        Self::failed(value)
    }
}

/// An action's input validation rejected the data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ActionValidationError {
    pub message: String,
}

impl ActionValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The factory has no registration for the requested action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Action '{name}' is not registered")]
pub struct ActionNotRegisteredError {
    pub name: String,
}

impl ActionNotRegisteredError {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// An action in a job's pipeline failed.
///
/// Carries the identity of the failing action together with the original cause.
#[derive(Debug, Clone, Error)]
#[error("Action {action} failed: {original_error}")]
pub struct ActionExecutionError {
    pub operation: String,
    pub action: String,
    pub original_error: ActionError,
    pub job_id: String,
}

impl ActionExecutionError {
    pub fn new(
        operation: impl Into<String>,
        action: impl Into<String>,
        original_error: ActionError,
        job_id: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            action: action.into(),
            original_error,
            job_id: job_id.into(),
        }
    }
}
