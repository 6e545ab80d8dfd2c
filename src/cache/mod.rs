//! Cache Module
//!
//! Sharded in-process cache with aliases, refresh-ahead, missing-record
//! caching and expiry-based eviction.

mod client;
mod clock;
mod entry;
mod fetch;
mod shard;
pub(crate) mod stats;


// Re-export public types
pub use client::{CacheItem, Client};
pub use clock::{Clock, SystemClock, TestClock};
pub use entry::Entry;
pub use shard::{Lookup, Shard, MAX_BACKOFF_EXPONENT};
pub use stats::{CacheStats, MetricsRecorder};
