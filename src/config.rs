//! Configuration Module
//!
//! Construction parameters for the cache, loadable from environment variables.

use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{Clock, MetricsRecorder, SystemClock};
use crate::error::{CacheError, Result};

/// Timing window for refresh-ahead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshConfig {
    /// Earliest point after a write at which the entry becomes due
    pub min_refresh_time: Duration,
    /// Latest point after a write at which the entry becomes due
    pub max_refresh_time: Duration,
    /// Base delay of the exponential backoff between refresh signals
    pub retry_base_delay: Duration,
}

/// Cache configuration parameters.
#[derive(Clone)]
pub struct Config {
    /// Maximum number of entries across all shards
    pub capacity: usize,
    /// Number of independently locked shards
    pub num_shards: usize,
    /// Time to live of every entry
    pub ttl: Duration,
    /// Percentage of a full shard removed by a forced eviction, 0 disables it
    pub eviction_percentage: u8,
    /// Delay between two sweep ticks; defaults to `ttl / num_shards`
    pub eviction_interval: Duration,
    /// Whether a background task sweeps expired entries
    pub continuous_evictions: bool,
    /// Refresh-ahead window, `None` disables refresh-ahead
    pub refresh: Option<RefreshConfig>,
    /// Whether `NotFound` fetch outcomes are cached as missing records
    pub store_missing_records: bool,
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// Optional external metrics sink
    pub metrics: Option<Arc<dyn MetricsRecorder>>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("capacity", &self.capacity)
            .field("num_shards", &self.num_shards)
            .field("ttl", &self.ttl)
            .field("eviction_percentage", &self.eviction_percentage)
            .field("eviction_interval", &self.eviction_interval)
            .field("continuous_evictions", &self.continuous_evictions)
            .field("refresh", &self.refresh)
            .field("store_missing_records", &self.store_missing_records)
            .field("clock", &self.clock)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

impl Config {
    /// Creates a configuration with the four required parameters.
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of entries, split evenly across shards
    /// * `num_shards` - Number of shards, must be greater than 0
    /// * `ttl` - Time to live for each entry, must be greater than 0
    /// * `eviction_percentage` - Share of a full shard to evict (0-100)
    pub fn new(capacity: usize, num_shards: usize, ttl: Duration, eviction_percentage: u8) -> Self {
        let eviction_interval = if num_shards > 0 {
            ttl / num_shards as u32
        } else {
            ttl
        };
        Self {
            capacity,
            num_shards,
            ttl,
            eviction_percentage,
            eviction_interval,
            continuous_evictions: true,
            refresh: None,
            store_missing_records: false,
            clock: Arc::new(SystemClock),
            metrics: None,
        }
    }

    /// Enables refresh-ahead. Entries become due somewhere in
    /// `[min_refresh_time, max_refresh_time)` after being written.
    pub fn with_refresh_in_background(
        mut self,
        min_refresh_time: Duration,
        max_refresh_time: Duration,
        retry_base_delay: Duration,
    ) -> Self {
        self.refresh = Some(RefreshConfig {
            min_refresh_time,
            max_refresh_time,
            retry_base_delay,
        });
        self
    }

    pub fn with_missing_record_storage(mut self) -> Self {
        self.store_missing_records = true;
        self
    }

    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    /// Disables the background sweep. Expired entries are then only removed
    /// by forced evictions, overwrites and deletes.
    pub fn without_continuous_evictions(mut self) -> Self {
        self.continuous_evictions = false;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, recorder: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(recorder);
        self
    }

    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_CAPACITY` - Maximum cache entries (default: 10000)
    /// - `CACHE_SHARDS` - Number of shards (default: 10)
    /// - `CACHE_TTL_SECS` - TTL in seconds (default: 300)
    /// - `CACHE_EVICTION_PERCENTAGE` - Forced eviction share (default: 10)
    /// - `CACHE_MIN_REFRESH_MS` / `CACHE_MAX_REFRESH_MS` / `CACHE_RETRY_BASE_MS` -
    ///   enable refresh-ahead when all three are set
    /// - `CACHE_STORE_MISSING` - cache missing records when `true` (default: false)
    pub fn from_env() -> Self {
        let mut config = Self::new(
            env_or("CACHE_CAPACITY", 10_000),
            env_or("CACHE_SHARDS", 10),
            Duration::from_secs(env_or("CACHE_TTL_SECS", 300)),
            env_or("CACHE_EVICTION_PERCENTAGE", 10),
        );

        let min = env_parse::<u64>("CACHE_MIN_REFRESH_MS");
        let max = env_parse::<u64>("CACHE_MAX_REFRESH_MS");
        let retry = env_parse::<u64>("CACHE_RETRY_BASE_MS");
        if let (Some(min), Some(max), Some(retry)) = (min, max, retry) {
            config = config.with_refresh_in_background(
                Duration::from_millis(min),
                Duration::from_millis(max),
                Duration::from_millis(retry),
            );
        }

        if env_or("CACHE_STORE_MISSING", false) {
            config = config.with_missing_record_storage();
        }
        config
    }

    /// Checks the configuration for values the cache cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return invalid("capacity must be greater than 0");
        }
        if self.num_shards == 0 {
            return invalid("number of shards must be greater than 0");
        }
        if self.capacity < self.num_shards {
            return invalid("capacity must be at least the number of shards");
        }
        if self.ttl.is_zero() {
            return invalid("ttl must be greater than 0");
        }
        if self.eviction_percentage > 100 {
            return invalid("eviction percentage must be between 0 and 100");
        }
        if self.continuous_evictions && self.eviction_interval.is_zero() {
            return invalid("eviction interval must be greater than 0");
        }
        if let Some(refresh) = &self.refresh {
            if refresh.min_refresh_time > refresh.max_refresh_time {
                return invalid("min refresh time cannot exceed max refresh time");
            }
            if refresh.max_refresh_time > self.ttl {
                return invalid("max refresh time cannot exceed the ttl");
            }
            if refresh.retry_base_delay.is_zero() {
                return invalid("retry base delay must be greater than 0");
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(10_000, 10, Duration::from_secs(300), 10)
    }
}

fn invalid(msg: &str) -> Result<()> {
    Err(CacheError::InvalidConfig(msg.to_string()))
}

fn env_parse<V: std::str::FromStr>(name: &str) -> Option<V> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_or<V: std::str::FromStr>(name: &str, default: V) -> V {
    env_parse(name).unwrap_or(default)
}
