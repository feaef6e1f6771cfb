//! Running several named workers off one service container.
use async_trait::async_trait;

use super::{BaseWorker, Worker, WorkerOptions, WorkerStatus};
use crate::{
    deps::{FromContainer, ServiceContainer},
    runtime::QueueHandle,
    WorkerError,
};

/// A started worker, as far as a [`WorkerRegistry`] is concerned.
#[async_trait]
pub trait ManagedWorker: Send + Sync {
    fn status(&self) -> WorkerStatus;

    async fn close(&self) -> Result<(), WorkerError>;
}

#[async_trait]
impl<W: Worker> ManagedWorker for BaseWorker<W> {
    fn status(&self) -> WorkerStatus {
        BaseWorker::status(self)
    }

    async fn close(&self) -> Result<(), WorkerError> {
        BaseWorker::close(self).await
    }
}

/// Named workers sharing one [`ServiceContainer`].
///
/// ```
/// # use jobpipe::prelude::*;
/// struct Imports;
///
/// #[async_trait::async_trait]
/// impl Worker for Imports {
///     type Deps = BaseDependencies;
///
///     fn operation_name(&self) -> &'static str {
///         "imports"
///     }
///
///     fn register_actions(&self, _factory: &mut ActionFactory<Self::Deps>) {}
/// }
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let mut registry = WorkerRegistry::new(ServiceContainer::new());
/// registry
///     .spawn("imports", MemoryQueue::new("imports"), Imports)
///     .await
///     .unwrap();
///
/// assert!(registry.validate().is_ok());
/// registry.graceful_shutdown().await.unwrap();
/// # });
/// ```
pub struct WorkerRegistry {
    container: ServiceContainer,
    workers: Vec<(String, Box<dyn ManagedWorker>)>,
}

impl WorkerRegistry {
    pub fn new(container: ServiceContainer) -> Self {
        Self {
            container,
            workers: Vec::new(),
        }
    }

    pub fn container(&self) -> &ServiceContainer {
        &self.container
    }

    /// Starts a worker with dependencies assembled from the container and stores it under
    /// `name`.
    pub async fn spawn<W>(
        &mut self,
        name: impl Into<String>,
        queue: impl QueueHandle,
        worker: W,
    ) -> Result<&mut Self, WorkerError>
    where
        W: Worker,
        W::Deps: FromContainer,
    {
        self.spawn_with_options(name, queue, worker, WorkerOptions::default())
            .await
    }

    /// Like [`WorkerRegistry::spawn`], with the container added to the given options.
    pub async fn spawn_with_options<W>(
        &mut self,
        name: impl Into<String>,
        queue: impl QueueHandle,
        worker: W,
        options: WorkerOptions<W::Deps>,
    ) -> Result<&mut Self, WorkerError>
    where
        W: Worker,
        W::Deps: FromContainer,
    {
        let name = name.into();
        if self.contains(&name) {
            return Err(WorkerError::DuplicateWorker(name));
        }
        let deps = <W::Deps as FromContainer>::from_container(Some(&self.container))?;
        let options = options.with_container(self.container.clone());
        let worker = BaseWorker::start(queue, worker, deps, options).await?;
        self.insert(name, worker)?;
        Ok(self)
    }

    /// Stores an already started worker.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        worker: impl ManagedWorker + 'static,
    ) -> Result<(), WorkerError> {
        let name = name.into();
        if self.contains(&name) {
            return Err(WorkerError::DuplicateWorker(name));
        }
        tracing::debug!(worker = %name, "Registered worker {name}");
        self.workers.push((name, Box::new(worker)));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.iter().any(|(existing, _)| existing == name)
    }

    pub fn get(&self, name: &str) -> Option<&dyn ManagedWorker> {
        self.workers
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, worker)| worker.as_ref())
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.workers.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn statuses(&self) -> Vec<(&str, WorkerStatus)> {
        self.workers
            .iter()
            .map(|(name, worker)| (name.as_str(), worker.status()))
            .collect()
    }

    /// Fails with the names of all workers that are not running.
    pub fn validate(&self) -> Result<(), WorkerError> {
        let stopped: Vec<String> = self
            .statuses()
            .into_iter()
            .filter(|(_, status)| !status.is_running)
            .map(|(name, _)| name.to_owned())
            .collect();
        if stopped.is_empty() {
            Ok(())
        } else {
            Err(WorkerError::NotRunning(stopped))
        }
    }

    /// Closes all workers concurrently.
    ///
    /// Every worker is asked to close even if some fail to; the first failure is returned.
    pub async fn graceful_shutdown(self) -> Result<(), WorkerError> {
        tracing::debug!("Shutting down {} workers", self.workers.len());
        futures::future::join_all(self.workers.iter().map(|(name, worker)| async move {
            worker.close().await.inspect_err(|error| {
                tracing::error!(?error, worker = %name, "Failed to close worker {name}: {error}")
            })
        }))
        .await
        .into_iter()
        .collect()
    }
}
