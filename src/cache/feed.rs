//! Per-feed fetch orchestration
//!
//! [`FeedCache`] owns one feed's entry and its ordered sources. `get` serves
//! fresh data straight from memory, otherwise tries each source in priority
//! order and falls back to whatever was cached before when they all fail.
//!
//! Concurrency: readers share an `RwLock` around the entry, and a separate
//! fetch gate admits one refresh at a time. A caller that waited on the gate
//! re-checks the entry first, so concurrent callers on an expired feed
//! trigger a single upstream fetch whether it succeeds or fails.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::config::ConfigError;
use crate::data::{Feed, Payload};
use crate::source::{Source, SourceError};

use super::entry::{is_fresh, CacheEntry};
use super::store::Store;

/// Payload plus the metadata callers report alongside it
#[derive(Debug, Clone, Serialize)]
pub struct FeedSnapshot<T> {
    pub data: T,
    /// When `data` was fetched; `None` if it never was
    pub last_updated: Option<DateTime<Utc>>,
    /// Whether `data` is within its TTL
    pub fresh: bool,
}

/// How a `get` call was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Served from a fresh entry
    Cached,
    /// A source produced new data
    Fetched,
    /// Another caller's concurrent fetch produced new data
    Joined,
    /// Every source failed; the previous payload was served
    Fallback,
}

impl FetchOutcome {
    /// Whether the returned payload was fetched by this call or the one it joined
    pub fn is_refreshed(&self) -> bool {
        matches!(self, FetchOutcome::Fetched | FetchOutcome::Joined)
    }
}

struct State<T> {
    entry: CacheEntry<T>,
    /// Bumped on every successful commit
    generation: u64,
    /// Bumped after every pass over the sources, successful or not
    attempts: u64,
}

/// One cached feed with stale-fallback semantics
pub struct FeedCache<T: Payload> {
    feed: Feed,
    ttl: Duration,
    attempt_timeout: StdDuration,
    sources: Vec<Arc<dyn Source<T>>>,
    store: Option<Store>,
    state: RwLock<State<T>>,
    fetch_gate: Mutex<()>,
}

impl<T: Payload> FeedCache<T> {
    /// Creates the feed, hydrating it from `store` when a snapshot exists
    ///
    /// Fails when `sources` is empty.
    pub fn new(
        feed: Feed,
        ttl: Duration,
        sources: Vec<Arc<dyn Source<T>>>,
        store: Option<Store>,
        attempt_timeout: StdDuration,
    ) -> Result<Self, ConfigError> {
        if sources.is_empty() {
            return Err(ConfigError::NoSources(feed.key()));
        }

        let entry = store
            .as_ref()
            .and_then(|s| s.load::<T>(&feed.key()))
            .map(CacheEntry::from_snapshot)
            .unwrap_or_default();

        if let Some(updated) = entry.last_updated {
            tracing::debug!(
                feed = %feed,
                records = entry.payload.record_count(),
                last_updated = %updated,
                "Hydrated feed from disk"
            );
        }

        Ok(Self {
            feed,
            ttl,
            attempt_timeout,
            sources,
            store,
            state: RwLock::new(State {
                entry,
                generation: 0,
                attempts: 0,
            }),
            fetch_gate: Mutex::new(()),
        })
    }

    /// Returns the feed's payload, refreshing it when stale or when forced
    ///
    /// Never fails: when every source fails or returns nothing, the previously
    /// cached payload is returned unchanged (empty if nothing was ever fetched).
    pub async fn get(&self, force_refresh: bool) -> T {
        self.get_with_outcome(force_refresh).await.0
    }

    /// Like [`get`](Self::get), also reporting where the payload came from
    pub async fn get_with_outcome(&self, force_refresh: bool) -> (T, FetchOutcome) {
        let (observed_generation, observed_attempts) = {
            let state = self.state.read().await;
            if !force_refresh && is_fresh(&state.entry, Utc::now(), self.ttl) {
                return (state.entry.payload.clone(), FetchOutcome::Cached);
            }
            (state.generation, state.attempts)
        };

        let _gate = self.fetch_gate.lock().await;

        {
            let state = self.state.read().await;
            if state.generation != observed_generation {
                tracing::debug!(feed = %self.feed, "Joined refresh completed by another caller");
                return (state.entry.payload.clone(), FetchOutcome::Joined);
            }
            if state.attempts != observed_attempts {
                tracing::debug!(feed = %self.feed, "Concurrent refresh failed, serving cached data");
                return (state.entry.payload.clone(), FetchOutcome::Fallback);
            }
            if !force_refresh && is_fresh(&state.entry, Utc::now(), self.ttl) {
                return (state.entry.payload.clone(), FetchOutcome::Cached);
            }
        }

        match self.fetch_from_sources().await {
            Some(payload) => (self.commit(payload).await, FetchOutcome::Fetched),
            None => (self.fallback().await, FetchOutcome::Fallback),
        }
    }

    /// Current entry and freshness, without touching any source
    pub async fn peek(&self) -> FeedSnapshot<T> {
        let state = self.state.read().await;
        FeedSnapshot {
            data: state.entry.payload.clone(),
            last_updated: state.entry.last_updated,
            fresh: is_fresh(&state.entry, Utc::now(), self.ttl),
        }
    }

    /// `get` followed by the metadata of the resulting entry
    pub async fn snapshot(&self, force_refresh: bool) -> FeedSnapshot<T> {
        self.get(force_refresh).await;
        self.peek().await
    }

    /// Tries each source in order; the first non-empty payload wins
    async fn fetch_from_sources(&self) -> Option<T> {
        for source in &self.sources {
            let result = match tokio::time::timeout(self.attempt_timeout, source.fetch(&self.feed)).await {
                Ok(result) => result,
                Err(_) => Err(SourceError::Timeout(self.attempt_timeout)),
            };

            match result {
                Ok(payload) if !payload.is_empty() => {
                    tracing::info!(
                        feed = %self.feed,
                        source = source.name(),
                        records = payload.record_count(),
                        "Fetched fresh data"
                    );
                    return Some(payload);
                }
                Ok(_) => {
                    tracing::warn!(feed = %self.feed, source = source.name(), "Source returned no records");
                }
                Err(e) => {
                    tracing::warn!(feed = %self.feed, source = source.name(), error = %e, "Source attempt failed");
                }
            }
        }
        None
    }

    /// Stores a fresh payload in memory, then mirrors it to disk
    async fn commit(&self, payload: T) -> T {
        let (snapshot, secs) = {
            let mut state = self.state.write().await;
            state.entry.commit(payload, Utc::now());
            state.generation += 1;
            state.attempts += 1;
            (state.entry.payload.clone(), state.entry.last_updated_secs())
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.feed.key(), &snapshot, secs) {
                tracing::error!(feed = %self.feed, error = %e, "Failed to persist feed snapshot");
            }
        }

        snapshot
    }

    /// Best available payload after every source failed
    async fn fallback(&self) -> T {
        let mut state = self.state.write().await;
        state.attempts += 1;
        if state.entry.payload.is_empty() {
            tracing::warn!(feed = %self.feed, "All sources failed and no cached data is available");
        } else {
            tracing::warn!(
                feed = %self.feed,
                age_secs = state.entry.age(Utc::now()).map(|age| age.num_seconds()),
                "All sources failed, serving stale data"
            );
        }
        state.entry.payload.clone()
    }
}
