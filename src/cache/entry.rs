// Cache entry model.
// Freshness, retention and fetch status for a single cached query result.

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::config::{DEFAULT_EVICT_AFTER, DEFAULT_STALE_AFTER};
use crate::error::SyncError;

use super::key::QueryKey;

/// Fetch status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchStatus {
    #[default]
    Idle,
    Fetching,
    Error,
}

/// Freshness and retention windows for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPolicy {
    /// Data younger than this is served without a refetch.
    pub stale_after: Duration,
    /// Unobserved entries are dropped after this long.
    pub evict_after: Duration,
}

impl Default for EntryPolicy {
    fn default() -> Self {
        Self {
            stale_after: DEFAULT_STALE_AFTER,
            evict_after: DEFAULT_EVICT_AFTER,
        }
    }
}

/// Read-only view of a cached query result.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: QueryKey,
    /// Last known data. Absent until the first load or write lands.
    pub data: Option<Value>,
    pub fetched_at: Option<Instant>,
    pub stale_after: Duration,
    pub evict_after: Duration,
    pub status: FetchStatus,
    pub last_error: Option<SyncError>,
    /// Marked stale by invalidation regardless of age.
    pub invalidated: bool,
}

impl CacheEntry {
    pub(crate) fn empty(key: QueryKey, policy: EntryPolicy) -> Self {
        Self {
            key,
            data: None,
            fetched_at: None,
            stale_after: policy.stale_after,
            evict_after: policy.evict_after,
            status: FetchStatus::Idle,
            last_error: None,
            invalidated: false,
        }
    }

    pub fn is_stale_at(&self, now: Instant) -> bool {
        if self.invalidated {
            return true;
        }
        match self.fetched_at {
            Some(fetched_at) => now.saturating_duration_since(fetched_at) >= self.stale_after,
            None => true,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Instant::now())
    }

    pub fn is_fetching(&self) -> bool {
        self.status == FetchStatus::Fetching
    }

    /// Typed view of the data.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        self.data
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::Scope;

    fn entry(stale_after: Duration) -> CacheEntry {
        CacheEntry::empty(
            QueryKey::new(Scope::Contacts),
            EntryPolicy {
                stale_after,
                evict_after: Duration::from_secs(60),
            },
        )
    }

    #[test]
    fn test_never_fetched_is_stale() {
        assert!(entry(Duration::from_secs(10)).is_stale());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_after_window() {
        let mut e = entry(Duration::from_secs(10));
        e.fetched_at = Some(Instant::now());
        assert!(!e.is_stale());

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!e.is_stale());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(e.is_stale());
    }

    #[test]
    fn test_invalidated_is_stale_even_when_young() {
        let mut e = entry(Duration::from_secs(3600));
        e.fetched_at = Some(Instant::now());
        e.invalidated = true;
        assert!(e.is_stale());
    }
}
