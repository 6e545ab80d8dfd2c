//! Refresh Cache - a sharded in-process cache
//!
//! Bounds memory through per-shard capacity and expiry-ordered eviction,
//! resolves secondary keys (aliases) to the same entry, and elects a single
//! caller to refresh hot entries before they expire.

pub mod cache;
pub mod config;
pub mod error;
pub mod tasks;

pub use cache::{CacheItem, CacheStats, Client, Lookup, MetricsRecorder};
pub use config::{Config, RefreshConfig};
pub use error::{CacheError, Result};
