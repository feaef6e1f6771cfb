//! Status broadcasting at the edges of a pipeline.
use async_trait::async_trait;
use serde_json::Value;

use super::{Action, ActionConfig, ActionResult, BoxAction, Configurable, Pipeline};
use crate::{
    deps::{Dependencies, StatusEvent},
    job::ActionContext,
};

pub const STATUS_PROCESSING: &str = "PROCESSING";
pub const STATUS_COMPLETED: &str = "COMPLETED";

pub const BROADCAST_PROCESSING: &str = "broadcast_processing";
pub const BROADCAST_COMPLETED: &str = "broadcast_completed";

/// Publishes an event through the dependencies' status broadcaster.
///
/// Does nothing without a broadcaster. Broadcast failures are logged and never reach the caller.
pub async fn broadcast_status<D: Dependencies>(deps: &D, event: StatusEvent) {
    let Some(broadcaster) = deps.status_broadcaster() else {
        return;
    };
    let status = event.status.clone();
    if let Err(error) = broadcaster.add_status_event_and_broadcast(event).await {
        tracing::warn!(?error, status = %status, "Failed to broadcast status event: {error}");
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Correlation {
    import_id: Option<String>,
    note_id: Option<String>,
}

impl Correlation {
    fn from_data(data: &Value) -> Self {
        let event = StatusEvent::for_job_data(data, "");
        Self {
            import_id: event.import_id,
            note_id: event.note_id,
        }
    }

    fn event(&self, status: &str, message: String, context: &ActionContext) -> StatusEvent {
        StatusEvent {
            import_id: self.import_id.clone(),
            note_id: self.note_id.clone(),
            ..StatusEvent::new(status)
        }
        .with_message(message)
        .with_context(context.operation.clone())
    }
}

/// Broadcasts that a job's pipeline has started, then passes its input through.
///
/// The job's `importId` and `noteId` are captured when the action is created, since by the time
/// it runs the data may already be transformed by earlier actions.
#[derive(Debug, Clone)]
pub struct BroadcastProcessingAction {
    correlation: Correlation,
    config: ActionConfig,
}

impl BroadcastProcessingAction {
    pub fn for_job_data(data: &Value) -> Self {
        Self {
            correlation: Correlation::from_data(data),
            config: ActionConfig::DEFAULT.retryable(false),
        }
    }
}

impl Configurable for BroadcastProcessingAction {
    fn config_mut(&mut self) -> &mut ActionConfig {
        &mut self.config
    }
}

#[async_trait]
impl<D: Dependencies> Action<D> for BroadcastProcessingAction {
    fn name(&self) -> &str {
        BROADCAST_PROCESSING
    }

    fn config(&self) -> ActionConfig {
        self.config
    }

    async fn execute(&self, data: &Value, deps: &D, context: &ActionContext) -> ActionResult {
        let message = format!("Processing {}", context.operation);
        let event = self.correlation.event(STATUS_PROCESSING, message, context);
        broadcast_status(deps, event).await;
        Ok(data.clone())
    }
}

/// Broadcasts that a job's pipeline has completed, then passes its input through.
#[derive(Debug, Clone)]
pub struct BroadcastCompletedAction {
    correlation: Correlation,
    config: ActionConfig,
}

impl BroadcastCompletedAction {
    pub fn for_job_data(data: &Value) -> Self {
        Self {
            correlation: Correlation::from_data(data),
            config: ActionConfig::DEFAULT.retryable(false),
        }
    }
}

impl Configurable for BroadcastCompletedAction {
    fn config_mut(&mut self) -> &mut ActionConfig {
        &mut self.config
    }
}

#[async_trait]
impl<D: Dependencies> Action<D> for BroadcastCompletedAction {
    fn name(&self) -> &str {
        BROADCAST_COMPLETED
    }

    fn config(&self) -> ActionConfig {
        self.config
    }

    async fn execute(&self, data: &Value, deps: &D, context: &ActionContext) -> ActionResult {
        let message = format!("Completed {}", context.operation);
        let event = self.correlation.event(STATUS_COMPLETED, message, context);
        broadcast_status(deps, event).await;
        Ok(data.clone())
    }
}

/// Puts a [`BroadcastProcessingAction`] first and a [`BroadcastCompletedAction`] last in the
/// pipeline.
pub fn inject_standard_status_actions<D: Dependencies>(actions: &mut Pipeline<D>, data: &Value) {
    let processing: BoxAction<D> = Box::new(BroadcastProcessingAction::for_job_data(data));
    let completed: BoxAction<D> = Box::new(BroadcastCompletedAction::for_job_data(data));
    actions.insert(0, processing);
    actions.push(completed);
}
