//! Composable action pipelines for queue backed job workers.
//!
//! A job delivered by a queue is processed by a [`worker::BaseWorker`] as an ordered pipeline of
//! [`action::Action`]s. Actions are registered by name in an [`action::factory::ActionFactory`],
//! optionally decorated with wrappers (retry, error handling, status broadcasting) and executed
//! strictly in sequence, each receiving the previous action's output as its input.
//!
//! ```
//! # use jobpipe::prelude::*;
//! # use serde_json::{json, Value};
//! struct EchoWorker;
//!
//! #[async_trait::async_trait]
//! impl Worker for EchoWorker {
//!     type Deps = BaseDependencies;
//!
//!     fn operation_name(&self) -> &'static str {
//!         "echo"
//!     }
//!
//!     fn register_actions(&self, factory: &mut ActionFactory<Self::Deps>) {
//!         factory.register(NO_OP, |_deps| Box::new(NoOpAction::default()));
//!     }
//!
//!     fn create_action_pipeline(
//!         &self,
//!         _data: &Value,
//!         _context: &ActionContext,
//!         factory: &ActionFactory<Self::Deps>,
//!         deps: &Self::Deps,
//!     ) -> Result<Pipeline<Self::Deps>, ActionNotRegisteredError> {
//!         Ok(vec![factory.create(NO_OP, deps)?])
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let queue = MemoryQueue::new("echo");
//! let worker = BaseWorker::start(
//!     queue.clone(),
//!     EchoWorker,
//!     BaseDependencies::default(),
//!     WorkerOptions::default(),
//! )
//! .await
//! .unwrap();
//!
//! let result = worker
//!     .process_job(Job::new(json!({"someData": "x"})).with_id("j1"))
//!     .await
//!     .unwrap();
//! assert_eq!(result, json!({"someData": "x"}));
//!
//! worker.close().await.unwrap();
//! # });
//! ```
pub mod action;
pub mod backoff;
pub mod cache;
pub mod deps;
pub mod job;
pub mod metrics;
pub mod prelude;
pub mod runtime;
pub mod testing;
pub mod worker;

use thiserror::Error;

/// Errors raised while assembling, starting or stopping workers.
///
/// These are distinct from [`worker::JobError`], which is what processing a single job fails
/// with.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Container not available for {0}")]
    ContainerUnavailable(&'static str),
    #[error("Missing required dependency: {0}")]
    MissingDependency(String),
    #[error("Failed to start worker runtime: {0}")]
    RuntimeStart(String),
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("Workers not running: {}", .0.join(", "))]
    NotRunning(Vec<String>),
    #[error("Worker {0} is already registered")]
    DuplicateWorker(String),
    #[error("Queue {0} is closed")]
    QueueClosed(String),
}
