//! Feed cache with persisted snapshots
//!
//! Each feed keeps its last good payload in memory and mirrors it to disk.
//! Reads within the feed's TTL never touch the network; expired reads try the
//! configured sources in order and fall back to the stale payload when all of
//! them fail, so callers always get the best data available.

mod entry;
mod feed;
mod store;

pub use entry::{is_fresh, CacheEntry};
pub use feed::{FeedCache, FeedSnapshot, FetchOutcome};
pub use store::{Snapshot, Store, StoreError};
