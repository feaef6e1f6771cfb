//! Recording of job and action timings.
use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use fxhash::FxHashMap;

/// Receives timings and running state from workers. Recording is fire and forget.
#[cfg_attr(test, mockall::automock)]
pub trait MetricsRecorder: Send + Sync {
    fn record_job_processing_time(&self, operation: &str, duration: Duration, success: bool);
    fn record_action_execution_time(&self, action: &str, duration: Duration, success: bool);
    fn record_worker_status(&self, operation: &str, is_running: bool);
}

/// Aggregated timings for a single job operation or action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingStats {
    pub count: u64,
    pub failures: u64,
    pub total: Duration,
    pub max: Duration,
}

impl TimingStats {
    fn record(&mut self, duration: Duration, success: bool) {
        self.count += 1;
        if !success {
            self.failures += 1;
        }
        self.total += duration;
        self.max = self.max.max(duration);
    }

    pub fn mean(&self) -> Option<Duration> {
        let count = u32::try_from(self.count).ok().filter(|count| *count > 0)?;
        Some(self.total / count)
    }
}

#[derive(Debug, Default)]
struct Recorded {
    jobs: FxHashMap<String, TimingStats>,
    actions: FxHashMap<String, TimingStats>,
    workers: FxHashMap<String, bool>,
}

/// In memory [`MetricsRecorder`] keeping per-name aggregates.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    recorded: Mutex<Recorded>,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn recorded(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn job_stats(&self, operation: &str) -> Option<TimingStats> {
        self.recorded().jobs.get(operation).copied()
    }

    pub fn action_stats(&self, action: &str) -> Option<TimingStats> {
        self.recorded().actions.get(action).copied()
    }

    /// The last recorded running state of a worker.
    pub fn is_running(&self, operation: &str) -> Option<bool> {
        self.recorded().workers.get(operation).copied()
    }
}

impl MetricsRecorder for WorkerMetrics {
    fn record_job_processing_time(&self, operation: &str, duration: Duration, success: bool) {
        tracing::debug!(operation, ?duration, success, "Recording job processing time");
        self.recorded()
            .jobs
            .entry(operation.to_owned())
            .or_default()
            .record(duration, success);
    }

    fn record_action_execution_time(&self, action: &str, duration: Duration, success: bool) {
        tracing::debug!(action, ?duration, success, "Recording action execution time");
        self.recorded()
            .actions
            .entry(action.to_owned())
            .or_default()
            .record(duration, success);
    }

    fn record_worker_status(&self, operation: &str, is_running: bool) {
        self.recorded()
            .workers
            .insert(operation.to_owned(), is_running);
    }
}
