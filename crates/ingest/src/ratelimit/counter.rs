//! Counter store abstraction and in-memory backend

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Errors raised by counter store backends
///
/// The rate limiter never propagates these; it logs them and fails open.
#[derive(Debug, thiserror::Error)]
pub enum CounterStoreError {
    #[error("counter backend unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),
}

/// Event counts held by a counter store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterStats {
    /// Distinct keys with at least one event
    pub keys: u64,
    /// Total events held
    pub events: u64,
}

/// Time-stamped event log keyed by arbitrary strings
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// Short backend name for stats and logs
    fn backend_name(&self) -> &'static str;

    /// Number of events for `key` recorded at or after `since`
    async fn count_since(&self, key: &str, since: DateTime<Utc>) -> Result<u64, CounterStoreError>;

    /// Timestamp of the oldest event for `key` at or after `since`
    async fn oldest_since(
        &self,
        key: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, CounterStoreError>;

    /// Append an event for `key`
    async fn record(&self, key: &str, at: DateTime<Utc>) -> Result<(), CounterStoreError>;

    /// Drop every event older than `cutoff`; returns how many were removed
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, CounterStoreError>;

    async fn stats(&self) -> Result<CounterStats, CounterStoreError>;
}

/// In-process counter store
///
/// Each key holds its events in timestamp order so window queries are a
/// binary search.
#[derive(Default)]
pub struct InMemoryCounterStore {
    events: DashMap<String, VecDeque<DateTime<Utc>>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shift every event of `key` into the past (for testing window expiry)
    pub fn age_events(&self, key: &str, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        if let Some(mut events) = self.events.get_mut(key) {
            for at in events.iter_mut() {
                *at -= by;
            }
        }
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.events.clear();
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn count_since(&self, key: &str, since: DateTime<Utc>) -> Result<u64, CounterStoreError> {
        Ok(self
            .events
            .get(key)
            .map(|events| (events.len() - events.partition_point(|at| *at < since)) as u64)
            .unwrap_or(0))
    }

    async fn oldest_since(
        &self,
        key: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, CounterStoreError> {
        Ok(self.events.get(key).and_then(|events| {
            let idx = events.partition_point(|at| *at < since);
            events.get(idx).copied()
        }))
    }

    async fn record(&self, key: &str, at: DateTime<Utc>) -> Result<(), CounterStoreError> {
        let mut events = self.events.entry(key.to_string()).or_default();
        if events.back().is_some_and(|last| *last > at) {
            let idx = events.partition_point(|existing| *existing <= at);
            events.insert(idx, at);
        } else {
            events.push_back(at);
        }
        Ok(())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, CounterStoreError> {
        let mut removed = 0u64;
        self.events.retain(|_, events| {
            while events.front().is_some_and(|at| *at < cutoff) {
                events.pop_front();
                removed += 1;
            }
            !events.is_empty()
        });
        Ok(removed)
    }

    async fn stats(&self) -> Result<CounterStats, CounterStoreError> {
        let mut stats = CounterStats::default();
        for entry in self.events.iter() {
            stats.keys += 1;
            stats.events += entry.value().len() as u64;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_count_within_window() {
        let store = InMemoryCounterStore::new();
        let now = Utc::now();

        store.record("k", now - chrono::Duration::minutes(90)).await.unwrap();
        store.record("k", now - chrono::Duration::minutes(30)).await.unwrap();
        store.record("k", now).await.unwrap();

        let hour_ago = now - chrono::Duration::hours(1);
        assert_eq!(store.count_since("k", hour_ago).await.unwrap(), 2);
        assert_eq!(
            store.oldest_since("k", hour_ago).await.unwrap(),
            Some(now - chrono::Duration::minutes(30))
        );
        assert_eq!(store.count_since("other", hour_ago).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_record_keeps_order() {
        let store = InMemoryCounterStore::new();
        let now = Utc::now();

        store.record("k", now).await.unwrap();
        store.record("k", now - chrono::Duration::minutes(10)).await.unwrap();

        let since = now - chrono::Duration::minutes(20);
        assert_eq!(
            store.oldest_since("k", since).await.unwrap(),
            Some(now - chrono::Duration::minutes(10))
        );
    }

    #[tokio::test]
    async fn test_purge_before() {
        let store = InMemoryCounterStore::new();
        let now = Utc::now();

        store.record("a", now - chrono::Duration::hours(30)).await.unwrap();
        store.record("b", now - chrono::Duration::hours(30)).await.unwrap();
        store.record("b", now).await.unwrap();

        let removed = store.purge_before(now - chrono::Duration::hours(24)).await.unwrap();
        assert_eq!(removed, 2);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats, CounterStats { keys: 1, events: 1 });
    }

    #[tokio::test]
    async fn test_age_events() {
        let store = InMemoryCounterStore::new();
        let now = Utc::now();
        store.record("k", now).await.unwrap();

        store.age_events("k", Duration::from_secs(3601));
        assert_eq!(
            store.count_since("k", now - chrono::Duration::hours(1)).await.unwrap(),
            0
        );
    }
}
