//! Helpers for testing workers and actions.
//!
//! ```
//! # use jobpipe::prelude::*;
//! # use jobpipe::testing::{ScriptedAction, TestDependencies};
//! # use serde_json::json;
//! # use std::sync::atomic::Ordering;
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let action = ScriptedAction::new("fetch_page")
//!     .then_fail("timeout")
//!     .then_succeed(json!("<html/>"));
//! let calls = action.calls();
//! let action = RetryWrapper::<TestDependencies>::new(
//!     Box::new(action),
//!     RetryPolicy::default().with_backoff(BackoffStrategy::constant(std::time::Duration::ZERO)),
//! );
//! let context = ActionContext::for_job(&Job::new(json!({})), "pages", "fetch");
//!
//! let result = action
//!     .execute(&json!({}), &TestDependencies::default(), &context)
//!     .await;
//!
//! assert_eq!(result.unwrap(), json!("<html/>"));
//! assert_eq!(calls.load(Ordering::SeqCst), 2);
//! # });
//! ```
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    action::{error::ActionError, Action, ActionConfig, ActionResult, ErrorHook},
    deps::{
        BroadcastError, Dependencies, FromContainer, LogLevel, Logger, ServiceContainer,
        StatusBroadcaster, StatusEvent,
    },
    job::ActionContext,
    runtime::{JobHandler, QueueHandle, RuntimeFactory, WorkerRuntime},
    WorkerError,
};

/// A single call to a [`RecordingLogger`].
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub message: String,
    pub level: LogLevel,
    pub meta: Option<Value>,
}

/// [`Logger`] keeping everything logged in memory.
#[derive(Debug, Default)]
pub struct RecordingLogger {
    records: Mutex<Vec<LogRecord>>,
}

impl RecordingLogger {
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.records()
            .into_iter()
            .map(|record| record.message)
            .collect()
    }
}

impl Logger for RecordingLogger {
    fn log(&self, message: &str, level: LogLevel, meta: Option<&Value>) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LogRecord {
                message: message.to_owned(),
                level,
                meta: meta.cloned(),
            });
    }
}

/// [`StatusBroadcaster`] keeping every event in memory.
#[derive(Debug, Default)]
pub struct RecordingBroadcaster {
    events: Mutex<Vec<StatusEvent>>,
}

impl RecordingBroadcaster {
    pub fn events(&self) -> Vec<StatusEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl StatusBroadcaster for RecordingBroadcaster {
    async fn add_status_event_and_broadcast(
        &self,
        event: StatusEvent,
    ) -> Result<(), BroadcastError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }
}

/// Dependencies with an optional logger and status broadcaster.
#[derive(Clone, Default)]
pub struct TestDependencies {
    logger: Option<Arc<dyn Logger>>,
    status_broadcaster: Option<Arc<dyn StatusBroadcaster>>,
}

impl TestDependencies {
    pub fn with_logger(logger: Arc<dyn Logger>) -> Self {
        Self {
            logger: Some(logger),
            status_broadcaster: None,
        }
    }

    pub fn with_broadcaster(self, status_broadcaster: Arc<dyn StatusBroadcaster>) -> Self {
        Self {
            status_broadcaster: Some(status_broadcaster),
            ..self
        }
    }
}

impl Dependencies for TestDependencies {
    fn logger(&self) -> Option<&dyn Logger> {
        self.logger.as_deref()
    }

    fn status_broadcaster(&self) -> Option<&dyn StatusBroadcaster> {
        self.status_broadcaster.as_deref()
    }
}

impl FromContainer for TestDependencies {
    fn from_container(container: Option<&ServiceContainer>) -> Result<Self, WorkerError> {
        Ok(Self {
            logger: container.and_then(|container| container.logger().cloned()),
            status_broadcaster: container
                .and_then(|container| container.status_broadcaster().cloned()),
        })
    }
}

/// An action returning scripted results, counting its invocations.
///
/// Once the script is exhausted the action passes its input through.
pub struct ScriptedAction {
    name: String,
    config: ActionConfig,
    script: Mutex<VecDeque<ActionResult>>,
    handles_errors: bool,
    calls: Arc<AtomicUsize>,
    hook_calls: Arc<AtomicUsize>,
    inputs: Arc<Mutex<Vec<Value>>>,
}

impl ScriptedAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: ActionConfig::DEFAULT,
            script: Default::default(),
            handles_errors: false,
            calls: Default::default(),
            hook_calls: Default::default(),
            inputs: Default::default(),
        }
    }

    pub fn then_fail(self, error: impl Into<ActionError>) -> Self {
        self.then(Err(error.into()))
    }

    pub fn then_succeed(self, value: Value) -> Self {
        self.then(Ok(value))
    }

    fn then(self, result: ActionResult) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(result);
        self
    }

    pub fn non_retryable(self) -> Self {
        Self {
            config: self.config.retryable(false),
            ..self
        }
    }

    /// Makes the action's error hook report failures as handled.
    pub fn handles_errors(self) -> Self {
        Self {
            handles_errors: true,
            ..self
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    pub fn hook_calls(&self) -> Arc<AtomicUsize> {
        self.hook_calls.clone()
    }

    /// The inputs of all invocations so far.
    pub fn inputs(&self) -> Arc<Mutex<Vec<Value>>> {
        self.inputs.clone()
    }
}

#[async_trait]
impl<D: Dependencies> Action<D> for ScriptedAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> ActionConfig {
        self.config
    }

    async fn execute(&self, data: &Value, _deps: &D, _context: &ActionContext) -> ActionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(data.clone());
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        next.unwrap_or_else(|| Ok(data.clone()))
    }

    async fn on_error(
        &self,
        _error: &ActionError,
        _data: &Value,
        _deps: &D,
        _context: &ActionContext,
    ) -> ErrorHook {
        self.hook_calls.fetch_add(1, Ordering::SeqCst);
        if self.handles_errors {
            ErrorHook::Handled
        } else {
            ErrorHook::Unhandled
        }
    }
}

/// [`RuntimeFactory`] whose runtimes never consume their queue.
///
/// Useful when jobs are fed to [`crate::worker::BaseWorker::process_job`] directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdleRuntimeFactory;

#[derive(Debug)]
struct IdleRuntime {
    running: AtomicBool,
}

#[async_trait]
impl WorkerRuntime for IdleRuntime {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), WorkerError> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl RuntimeFactory for IdleRuntimeFactory {
    async fn start(
        &self,
        _queue: Arc<dyn QueueHandle>,
        _processor: Arc<dyn JobHandler>,
        _concurrency: usize,
    ) -> Result<Box<dyn WorkerRuntime>, WorkerError> {
        Ok(Box::new(IdleRuntime {
            running: AtomicBool::new(true),
        }))
    }
}
