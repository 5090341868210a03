//! Snapshot types handed out by the cache directory.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::key::QueryKey;
use crate::error::ApiError;

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
  /// Younger than its TTL and not invalidated.
  Fresh,
  /// Past its TTL or invalidated; still served while a refetch runs.
  Stale,
  /// A fetch is in flight.
  Fetching,
  /// The last fetch failed.
  Error(ApiError),
}

/// Read-only view of one cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  pub key: QueryKey,
  /// Last successfully fetched value, if any.
  pub data: Option<T>,
  pub fetched_at: Option<DateTime<Utc>>,
  pub ttl: Duration,
  pub state: EntryState,
}

impl<T> CacheEntry<T> {
  pub fn is_fresh(&self) -> bool {
    self.state == EntryState::Fresh
  }

  pub fn is_stale(&self) -> bool {
    self.state == EntryState::Stale
  }
}
