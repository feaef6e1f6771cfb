use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Job id used when the queue delivers a job without one.
pub const UNKNOWN_JOB_ID: &str = "unknown";

/// A unit of work as delivered by the queue.
///
/// The queue owns jobs; workers only ever see a delivered instance. A redelivery is a new
/// instance with an incremented [`Job::attempts_made`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Option<String>,
    #[serde(default)]
    pub attempts_made: u32,
    pub data: Value,
}

impl Job {
    pub fn new(data: Value) -> Self {
        Self {
            id: None,
            attempts_made: 0,
            data,
        }
    }

    pub fn with_id(self, id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..self
        }
    }

    pub fn with_attempts_made(self, attempts_made: u32) -> Self {
        Self {
            attempts_made,
            ..self
        }
    }

    /// The job id, or [`UNKNOWN_JOB_ID`] when absent.
    pub fn job_id(&self) -> &str {
        self.id.as_deref().unwrap_or(UNKNOWN_JOB_ID)
    }

    pub(crate) fn redelivered(self) -> Self {
        Self {
            attempts_made: self.attempts_made.saturating_add(1),
            ..self
        }
    }
}

/// Metadata about the current processing of a job.
///
/// Created fresh each time a job is processed and passed read-only to every action in the
/// pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionContext {
    pub job_id: String,
    pub retry_count: u32,
    pub queue_name: String,
    /// Identifies the worker type processing the job.
    pub operation: String,
    pub start_time: DateTime<Utc>,
    /// Always `retry_count + 1`.
    pub attempt_number: u32,
}

impl ActionContext {
    pub fn for_job(job: &Job, queue_name: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            job_id: job.job_id().to_owned(),
            retry_count: job.attempts_made,
            queue_name: queue_name.into(),
            operation: operation.into(),
            start_time: Utc::now(),
            attempt_number: job.attempts_made.saturating_add(1),
        }
    }

    pub fn worker_name(&self) -> &str {
        &self.operation
    }
}
