//! The purpose of this module is to alleviate the need to import many of the `[jobpipe]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use jobpipe::prelude::*;
//! ```
pub use crate::action::builtin::{
    LoggingAction, NoOpAction, ValidationAction, LOGGING, NO_OP, VALIDATION,
};
pub use crate::action::error::{
    ActionError, ActionExecutionError, ActionNotRegisteredError, ActionValidationError,
};
pub use crate::action::factory::ActionFactory;
pub use crate::action::status::{BroadcastCompletedAction, BroadcastProcessingAction};
pub use crate::action::wrapper::{
    with_error_handling, with_retry, with_status_broadcast, ActionWrapper, ErrorHandlingWrapper,
    RetryPolicy, RetryWrapper, StatusBroadcastWrapper,
};
pub use crate::action::{
    Action, ActionConfig, ActionResult, BoxAction, ConfigOverrides, Configurable, ErrorHook,
    Pipeline,
};
pub use crate::backoff::{BackoffStrategy, Jitter, Strategy};
pub use crate::cache::ActionResultCache;
pub use crate::deps::{
    BaseDependencies, Dependencies, LogLevel, Logger, ServiceContainer, StatusBroadcaster,
    StatusEvent,
};
pub use crate::job::{ActionContext, Job};
pub use crate::metrics::{MetricsRecorder, WorkerMetrics};
pub use crate::runtime::memory::MemoryQueue;
pub use crate::runtime::QueueHandle;
pub use crate::worker::registry::WorkerRegistry;
pub use crate::worker::{BaseWorker, JobError, Worker, WorkerConfig, WorkerOptions};
pub use crate::WorkerError;
