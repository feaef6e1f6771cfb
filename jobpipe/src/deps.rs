//! Collaborators made available to actions while a job is processed.
//!
//! Every worker declares the dependency type its actions receive via
//! [`crate::worker::Worker::Deps`]. The only requirement is the [`Dependencies`] trait, through
//! which the framework finds the optional logger and status broadcaster.
//!
//! [`BaseDependencies`] is the minimal bundle most workers start from. It is assembled from a
//! [`ServiceContainer`], substituting no-op fallbacks for facilities the container does not
//! provide.
use std::{fmt, sync::Arc};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{action::error::ActionError, WorkerError};

/// Access to the optional collaborators the framework itself makes use of.
pub trait Dependencies: Send + Sync + 'static {
    fn logger(&self) -> Option<&dyn Logger> {
        None
    }

    fn status_broadcaster(&self) -> Option<&dyn StatusBroadcaster> {
        None
    }

    fn error_handler(&self) -> Option<&dyn ErrorHandler> {
        None
    }
}

impl Dependencies for () {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(level)
    }
}

/// An injectable log sink.
pub trait Logger: Send + Sync {
    fn log(&self, message: &str, level: LogLevel, meta: Option<&Value>);
}

/// [`Logger`] forwarding to `tracing` at the matching level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, message: &str, level: LogLevel, meta: Option<&Value>) {
        match level {
            LogLevel::Debug => tracing::debug!(?meta, "{message}"),
            LogLevel::Info => tracing::info!(?meta, "{message}"),
            LogLevel::Warn => tracing::warn!(?meta, "{message}"),
            LogLevel::Error => tracing::error!(?meta, "{message}"),
        }
    }
}

/// A status update about the progress of a job, as consumed by status broadcasting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note_id: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indent_level: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl StatusEvent {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Default::default()
        }
    }

    /// Creates an event correlated with a job through the `importId` and `noteId` fields of its
    /// data, when present.
    pub fn for_job_data(data: &Value, status: impl Into<String>) -> Self {
        let field = |name: &str| data.get(name).and_then(Value::as_str).map(ToOwned::to_owned);
        Self {
            import_id: field("importId"),
            note_id: field("noteId"),
            ..Self::new(status)
        }
    }

    pub fn with_message(self, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..self
        }
    }

    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self {
            context: Some(context.into()),
            ..self
        }
    }

    pub fn with_progress(self, current_count: u64, total_count: u64) -> Self {
        Self {
            current_count: Some(current_count),
            total_count: Some(total_count),
            ..self
        }
    }

    pub fn with_indent_level(self, indent_level: u32) -> Self {
        Self {
            indent_level: Some(indent_level),
            ..self
        }
    }

    pub fn with_metadata(self, metadata: Value) -> Self {
        Self {
            metadata: Some(metadata),
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Failed to broadcast status event: {0}")]
pub struct BroadcastError(pub String);

/// Publishes [`StatusEvent`]s to whoever is watching the job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusBroadcaster: Send + Sync {
    async fn add_status_event_and_broadcast(&self, event: StatusEvent)
        -> Result<(), BroadcastError>;
}

/// [`StatusBroadcaster`] that resolves immediately without publishing anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStatusBroadcaster;

#[async_trait]
impl StatusBroadcaster for NoopStatusBroadcaster {
    async fn add_status_event_and_broadcast(
        &self,
        _event: StatusEvent,
    ) -> Result<(), BroadcastError> {
        Ok(())
    }
}

/// Runs an operation under some shared error handling policy, e.g. reporting to an error
/// tracker.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn with_error_handling(
        &self,
        operation: BoxFuture<'_, Result<Value, ActionError>>,
    ) -> Result<Value, ActionError>;
}

/// [`ErrorHandler`] that simply awaits the operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughErrorHandler;

#[async_trait]
impl ErrorHandler for PassThroughErrorHandler {
    async fn with_error_handling(
        &self,
        operation: BoxFuture<'_, Result<Value, ActionError>>,
    ) -> Result<Value, ActionError> {
        operation.await
    }
}

/// The shared services workers are assembled from.
///
/// Every facility is optional.
#[derive(Clone, Default)]
pub struct ServiceContainer {
    logger: Option<Arc<dyn Logger>>,
    status_broadcaster: Option<Arc<dyn StatusBroadcaster>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContainer")
            .field("logger", &self.logger.is_some())
            .field("status_broadcaster", &self.status_broadcaster.is_some())
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

impl ServiceContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_logger(self, logger: Arc<dyn Logger>) -> Self {
        Self {
            logger: Some(logger),
            ..self
        }
    }

    pub fn with_status_broadcaster(self, status_broadcaster: Arc<dyn StatusBroadcaster>) -> Self {
        Self {
            status_broadcaster: Some(status_broadcaster),
            ..self
        }
    }

    pub fn with_error_handler(self, error_handler: Arc<dyn ErrorHandler>) -> Self {
        Self {
            error_handler: Some(error_handler),
            ..self
        }
    }

    pub fn logger(&self) -> Option<&Arc<dyn Logger>> {
        self.logger.as_ref()
    }

    pub fn status_broadcaster(&self) -> Option<&Arc<dyn StatusBroadcaster>> {
        self.status_broadcaster.as_ref()
    }

    pub fn error_handler(&self) -> Option<&Arc<dyn ErrorHandler>> {
        self.error_handler.as_ref()
    }
}

/// Dependency types that can be assembled from a [`ServiceContainer`].
pub trait FromContainer: Sized {
    fn from_container(container: Option<&ServiceContainer>) -> Result<Self, WorkerError>;
}

/// The minimal dependency bundle: a logger, a status broadcaster and an error handler.
#[derive(Clone)]
pub struct BaseDependencies {
    pub logger: Arc<dyn Logger>,
    pub status_broadcaster: Arc<dyn StatusBroadcaster>,
    pub error_handler: Arc<dyn ErrorHandler>,
}

impl Default for BaseDependencies {
    fn default() -> Self {
        Self {
            logger: Arc::new(TracingLogger),
            status_broadcaster: Arc::new(NoopStatusBroadcaster),
            error_handler: Arc::new(PassThroughErrorHandler),
        }
    }
}

impl fmt::Debug for BaseDependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseDependencies").finish_non_exhaustive()
    }
}

impl BaseDependencies {
    /// The container's logger, falling back to [`TracingLogger`].
    pub fn logger_from(container: Option<&ServiceContainer>) -> Result<Arc<dyn Logger>, WorkerError> {
        let container = container.ok_or(WorkerError::ContainerUnavailable("logger"))?;
        Ok(container
            .logger()
            .cloned()
            .unwrap_or_else(|| Arc::new(TracingLogger)))
    }

    /// The container's status broadcaster, falling back to one that resolves immediately.
    pub fn status_broadcaster_from(
        container: Option<&ServiceContainer>,
    ) -> Result<Arc<dyn StatusBroadcaster>, WorkerError> {
        let container =
            container.ok_or(WorkerError::ContainerUnavailable("addStatusEventAndBroadcast"))?;
        Ok(container
            .status_broadcaster()
            .cloned()
            .unwrap_or_else(|| Arc::new(NoopStatusBroadcaster)))
    }

    /// The container's error handler, falling back to pass-through execution.
    pub fn error_handler_from(
        container: Option<&ServiceContainer>,
    ) -> Result<Arc<dyn ErrorHandler>, WorkerError> {
        let container = container.ok_or(WorkerError::ContainerUnavailable("withErrorHandling"))?;
        Ok(container
            .error_handler()
            .cloned()
            .unwrap_or_else(|| Arc::new(PassThroughErrorHandler)))
    }
}

impl FromContainer for BaseDependencies {
    fn from_container(container: Option<&ServiceContainer>) -> Result<Self, WorkerError> {
        Ok(Self {
            logger: Self::logger_from(container)?,
            status_broadcaster: Self::status_broadcaster_from(container)?,
            error_handler: Self::error_handler_from(container)?,
        })
    }
}

impl Dependencies for BaseDependencies {
    fn logger(&self) -> Option<&dyn Logger> {
        Some(self.logger.as_ref())
    }

    fn status_broadcaster(&self) -> Option<&dyn StatusBroadcaster> {
        Some(self.status_broadcaster.as_ref())
    }

    fn error_handler(&self) -> Option<&dyn ErrorHandler> {
        Some(self.error_handler.as_ref())
    }
}
