//! In-memory cache entry and freshness policy

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::data::Payload;

use super::store::Snapshot;

/// Current value of one feed
#[derive(Debug, Clone, Default)]
pub struct CacheEntry<T> {
    /// Last successfully fetched payload, empty until the first success
    pub payload: T,
    /// When `payload` was fetched; `None` if it never was
    pub last_updated: Option<DateTime<Utc>>,
}

impl<T: Payload> CacheEntry<T> {
    /// Rebuilds an entry from a persisted snapshot
    ///
    /// A zero timestamp means the feed was never populated.
    pub fn from_snapshot(snapshot: Snapshot<T>) -> Self {
        let last_updated = match snapshot.last_updated {
            0 => None,
            secs => Utc.timestamp_opt(secs, 0).single(),
        };
        Self {
            payload: snapshot.data,
            last_updated,
        }
    }

    /// Epoch seconds as written to the persisted store
    pub fn last_updated_secs(&self) -> i64 {
        self.last_updated.map(|t| t.timestamp()).unwrap_or(0)
    }

    /// Replaces the payload after a successful fetch
    ///
    /// Timestamps are kept at whole-second granularity so that an entry
    /// reloaded from disk compares equal to the one that was saved.
    pub fn commit(&mut self, payload: T, now: DateTime<Utc>) {
        self.payload = payload;
        self.last_updated = Utc.timestamp_opt(now.timestamp(), 0).single();
    }

    /// Seconds since the last successful fetch
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_updated.map(|t| now - t)
    }
}

/// Whether a cached entry can be served without a re-fetch
///
/// True iff the payload is non-empty and it was fetched less than `ttl` ago.
/// An entry that was never fetched is never fresh.
pub fn is_fresh<T: Payload>(entry: &CacheEntry<T>, now: DateTime<Utc>, ttl: Duration) -> bool {
    if entry.payload.is_empty() {
        return false;
    }
    match entry.last_updated {
        Some(updated) => now - updated < ttl,
        None => false,
    }
}
