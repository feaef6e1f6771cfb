//! A small TTL cache for action results.
//!
//! Only actions declaring themselves [cacheable](crate::action::Action::cacheable) go through the
//! cache. Results are keyed by action name, job id and the serialized input, so identical
//! invocations within one job collapse onto a single result for the lifetime of the entry.
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use fxhash::FxHashMap;
use serde_json::Value;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// Default lifetime of a cached action result.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// How often a running worker sweeps expired entries from its cache.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Prefix for cache keys of action results.
pub const ACTION_KEY_PREFIX: &str = "action";

const CACHEABLE_NAME_MARKERS: [&str; 2] = ["parse", "fetch"];

/// Whether an action with the given name is cacheable by naming convention.
///
/// Names containing `parse` or `fetch` are considered cacheable. The
/// [`ActionFactory`](crate::action::factory::ActionFactory) applies this convention when actions
/// are registered.
pub fn is_conventionally_cacheable(name: &str) -> bool {
    CACHEABLE_NAME_MARKERS
        .iter()
        .any(|marker| name.contains(marker))
}

/// Joins a prefix and parts with `:`.
pub fn create_cache_key(prefix: &str, parts: &[&str]) -> String {
    std::iter::once(prefix)
        .chain(parts.iter().copied())
        .collect::<Vec<_>>()
        .join(":")
}

/// The cache key for an action result.
pub fn action_cache_key(action: &str, job_id: &str, input: &Value) -> String {
    create_cache_key(ACTION_KEY_PREFIX, &[action, job_id, &input.to_string()])
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.inserted_at + self.ttl
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub keys: Vec<String>,
}

/// In memory TTL cache shared by all jobs of a worker.
///
/// Each operation takes the lock once, so concurrent jobs writing the same key resolve to the
/// last write.
#[derive(Debug, Default)]
pub struct ActionResultCache {
    entries: Mutex<FxHashMap<String, CacheEntry>>,
}

impl ActionResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, FxHashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached value, evicting it if it has expired.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries();
        let entry = entries.get(key)?;
        if entry.is_expired(Instant::now()) {
            entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Inserts a value with the [`DEFAULT_TTL`].
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.set_with_ttl(key, value, DEFAULT_TTL);
    }

    pub fn set_with_ttl(&self, key: impl Into<String>, value: Value, ttl: Duration) {
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
            ttl,
        };
        self.entries().insert(key.into(), entry);
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Removes all expired entries, returning how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(removed, "Removed {removed} expired action results from the cache");
        }
        removed
    }

    /// Calls [`ActionResultCache::cleanup`] every `period` until `cancellation_token` is
    /// cancelled.
    ///
    /// Keys contain the job id, so entries of finished jobs are never read again and only a
    /// sweep removes them.
    pub fn spawn_cleanup(
        self: Arc<Self>,
        period: Duration,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<()> {
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.cleanup();
                    }
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the action result cache cleanup");
                        break;
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries();
        CacheStats {
            size: entries.len(),
            keys: entries.keys().cloned().collect(),
        }
    }
}
