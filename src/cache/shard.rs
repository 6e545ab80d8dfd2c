//! Shard Module
//!
//! An independently locked partition of the cache. A shard owns its entries,
//! the alias indices pointing at them, and the eviction and refresh logic that
//! operates on that subset. Shards never call back into the client or into
//! each other.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, warn};

use crate::cache::stats::Metrics;
use crate::cache::entry::deadline;
use crate::cache::{Clock, Entry};
use crate::config::{Config, RefreshConfig};

// == Public Constants ==
/// Largest exponent used for the refresh backoff. Caps the delay between two
/// refresh signals for the same entry at `1024 * retry_base_delay`.
pub const MAX_BACKOFF_EXPONENT: u32 = 10;

// == Lookup ==
/// Result of reading a key from a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    /// No live entry under that key or alias. Expired entries read as absent.
    Absent,
    /// A live value. `refresh` is true for exactly one reader per refresh window.
    Found { value: T, refresh: bool },
    /// A cached "not found" marker.
    MissingRecord { refresh: bool },
}

impl<T> Lookup<T> {
    pub fn exists(&self) -> bool {
        !matches!(self, Lookup::Absent)
    }

    pub fn is_missing_record(&self) -> bool {
        matches!(self, Lookup::MissingRecord { .. })
    }

    /// True when the caller has been elected to refresh the entry.
    pub fn should_refresh(&self) -> bool {
        match self {
            Lookup::Absent => false,
            Lookup::Found { refresh, .. } | Lookup::MissingRecord { refresh } => *refresh,
        }
    }

    /// Returns the value of a live, non-missing entry.
    pub fn into_value(self) -> Option<T> {
        match self {
            Lookup::Found { value, .. } => Some(value),
            _ => None,
        }
    }

    fn from_entry(entry: &Entry<T>, refresh: bool) -> Self
    where
        T: Clone,
    {
        match &entry.value {
            Some(value) => Lookup::Found {
                value: value.clone(),
                refresh,
            },
            None => Lookup::MissingRecord { refresh },
        }
    }
}

// == Shard State ==
/// Everything guarded by the shard lock. The two alias maps are inverses of
/// each other and are only mutated together.
struct ShardState<T> {
    entries: HashMap<String, Entry<T>>,
    entry_keys_by_alias: HashMap<String, String>,
    aliases_by_entry_key: HashMap<String, Vec<String>>,
}

impl<T> ShardState<T> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            entry_keys_by_alias: HashMap::new(),
            aliases_by_entry_key: HashMap::new(),
        }
    }

    /// Looks up an entry by primary key first, then by alias.
    fn resolve(&self, key_or_alias: &str) -> Option<&Entry<T>> {
        if let Some(entry) = self.entries.get(key_or_alias) {
            return Some(entry);
        }
        let key = self.entry_keys_by_alias.get(key_or_alias)?;
        self.entries.get(key)
    }

    fn resolve_mut(&mut self, key_or_alias: &str) -> Option<&mut Entry<T>> {
        if self.entries.contains_key(key_or_alias) {
            return self.entries.get_mut(key_or_alias);
        }
        let key = self.entry_keys_by_alias.get(key_or_alias)?;
        self.entries.get_mut(key)
    }

    /// Removes the entry stored under the primary `key` together with its
    /// aliases.
    fn remove(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_none() {
            return false;
        }
        if let Some(aliases) = self.aliases_by_entry_key.remove(key) {
            for alias in aliases {
                self.entry_keys_by_alias.remove(&alias);
            }
        }
        true
    }

    /// # Panics
    /// If any alias is already bound to a key other than `key`.
    fn check_aliases(&self, key: &str, aliases: &[String]) {
        for alias in aliases.iter().filter(|alias| alias.as_str() != key) {
            if let Some(owner) = self.entry_keys_by_alias.get(alias) {
                if owner != key {
                    panic!("alias '{alias}' already exists on key '{owner}'");
                }
            }
        }
    }

    /// Replaces whatever is stored under `entry.key` and binds `aliases` to
    /// it. Aliases must have passed `check_aliases`.
    fn upsert(&mut self, entry: Entry<T>, mut aliases: Vec<String>) {
        aliases.retain(|alias| *alias != entry.key);
        aliases.sort_unstable();
        aliases.dedup();

        self.remove(&entry.key);

        for alias in &aliases {
            self.entry_keys_by_alias
                .insert(alias.clone(), entry.key.clone());
        }
        if !aliases.is_empty() {
            self.aliases_by_entry_key.insert(entry.key.clone(), aliases);
        }
        self.entries.insert(entry.key.clone(), entry);
    }
}

// == Shard ==
/// A thread-safe partition holding a subset of the cache entries.
pub struct Shard<T> {
    state: RwLock<ShardState<T>>,
    capacity: usize,
    ttl: Duration,
    eviction_percentage: u8,
    refresh: Option<RefreshConfig>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl<T> fmt::Debug for Shard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard")
            .field("capacity", &self.capacity)
            .field("size", &self.state.read().entries.len())
            .field("eviction_percentage", &self.eviction_percentage)
            .finish()
    }
}

impl<T: Clone> Shard<T> {
    // == Constructor ==
    /// Creates an empty shard.
    ///
    /// # Arguments
    /// * `capacity` - Entry count at which writes force an eviction
    /// * `config` - Cache configuration shared by all shards
    /// * `metrics` - Counters shared with the client
    pub(crate) fn new(capacity: usize, config: &Config, metrics: Arc<Metrics>) -> Self {
        Self {
            state: RwLock::new(ShardState::new()),
            capacity,
            ttl: config.ttl,
            eviction_percentage: config.eviction_percentage,
            refresh: config.refresh,
            clock: Arc::clone(&config.clock),
            metrics,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // == Get ==
    /// Reads `key`, which may be a primary key or an alias.
    ///
    /// The common path only takes the read lock. When the entry is due for a
    /// refresh the read lock is released and the write lock taken, the
    /// condition is checked again, and only then is `refresh_at` pushed back.
    /// This elects a single caller per refresh window without holding any
    /// lock during the refresh itself.
    pub fn get(&self, key: &str) -> Lookup<T> {
        {
            let state = self.state.read();
            let now = self.clock.now();
            let Some(entry) = state.resolve(key) else {
                return Lookup::Absent;
            };
            if entry.is_expired(now) {
                return Lookup::Absent;
            }
            if !entry.is_due_for_refresh(now) {
                return Lookup::from_entry(entry, false);
            }
        }

        let mut state = self.state.write();
        let now = self.clock.now();
        let Some(entry) = state.resolve_mut(key) else {
            return Lookup::Absent;
        };
        if entry.is_expired(now) {
            return Lookup::Absent;
        }
        // Another reader may have moved refresh_at while we waited for the lock.
        if !entry.is_due_for_refresh(now) {
            return Lookup::from_entry(entry, false);
        }
        let Some(refresh) = &self.refresh else {
            return Lookup::from_entry(entry, false);
        };

        let delay = refresh_backoff(refresh.retry_base_delay, entry.num_of_refresh_retries);
        entry.refresh_at = Some(deadline(now, delay));
        entry.num_of_refresh_retries = entry.num_of_refresh_retries.saturating_add(1);
        let lookup = Lookup::from_entry(entry, true);
        drop(state);

        debug!(key, next_refresh_in = ?delay, "entry due for refresh");
        lookup
    }

    /// Reads `key` without taking part in the refresh election. Due entries
    /// stay due for the next [`Shard::get`].
    pub(crate) fn peek(&self, key: &str) -> Lookup<T> {
        let state = self.state.read();
        match state.resolve(key) {
            Some(entry) if !entry.is_expired(self.clock.now()) => Lookup::from_entry(entry, false),
            _ => Lookup::Absent,
        }
    }

    // == Set ==
    /// Writes `key` with `value` (`None` for a missing record) and binds
    /// `aliases` to it.
    ///
    /// Returns true if the write triggered a forced eviction. When the shard
    /// is full and eviction is disabled the write is dropped and false is
    /// returned. Overwriting an existing key never counts against capacity.
    ///
    /// # Panics
    /// If an alias is already bound to a different key in this shard.
    pub(crate) fn set(&self, key: String, value: Option<T>, aliases: Vec<String>) -> bool {
        let mut state = self.state.write();
        state.check_aliases(&key, &aliases);

        let at_capacity =
            !state.entries.contains_key(&key) && state.entries.len() >= self.capacity;
        if at_capacity && self.eviction_percentage < 1 {
            drop(state);
            warn!(key = %key, capacity = self.capacity, "shard full, write dropped");
            return false;
        }

        let evicted = if at_capacity {
            self.force_evict(&mut state)
        } else {
            0
        };

        let now = self.clock.now();
        let refresh_at = self
            .refresh
            .as_ref()
            .map(|refresh| deadline(now, refresh.min_refresh_time + refresh_jitter(refresh)));
        let entry = Entry::new(key, value, deadline(now, self.ttl), refresh_at);
        state.upsert(entry, aliases);
        drop(state);

        if at_capacity {
            debug!(evicted, capacity = self.capacity, "forced eviction");
            self.metrics.record_forced_eviction();
            self.metrics.record_evictions(evicted);
        }
        at_capacity
    }

    // == Force Evict ==
    /// Removes `eviction_percentage`% of the entries (at least one), picking
    /// those that expire soonest. Must be called with the write lock held.
    fn force_evict(&self, state: &mut ShardState<T>) -> usize {
        let count = eviction_count(state.entries.len(), self.eviction_percentage);
        let victims = soonest_expiring(
            state.entries.values().map(|e| (e.expires_at, e.key.as_str())),
            count,
        );
        for key in &victims {
            state.remove(key);
        }
        victims.len()
    }

    // == Evict Expired ==
    /// Removes every entry whose expiry has passed. Returns the number removed.
    pub(crate) fn evict_expired(&self) -> usize {
        let mut state = self.state.write();
        let now = self.clock.now();
        let expired: Vec<String> = state
            .entries
            .values()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        drop(state);

        self.metrics.record_evictions(expired.len());
        expired.len()
    }

    // == Delete ==
    /// Removes the entry reachable through `key` (primary key or alias) along
    /// with all of its aliases.
    pub(crate) fn delete(&self, key: &str) -> bool {
        let mut state = self.state.write();
        let primary = match state.entry_keys_by_alias.get(key) {
            Some(primary) if !state.entries.contains_key(key) => primary.clone(),
            _ => key.to_string(),
        };
        state.remove(&primary)
    }

    // == Keys ==
    /// Snapshot of the primary keys of all non-expired entries. Expired
    /// entries are skipped but not removed.
    pub fn keys(&self) -> Vec<String> {
        let state = self.state.read();
        let now = self.clock.now();
        state
            .entries
            .values()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.key.clone())
            .collect()
    }

    /// Primary key and aliases of the entry reachable through `key_or_alias`,
    /// expired or not.
    pub fn binding(&self, key_or_alias: &str) -> Option<(String, Vec<String>)> {
        let state = self.state.read();
        let entry = state.resolve(key_or_alias)?;
        let aliases = state
            .aliases_by_entry_key
            .get(&entry.key)
            .cloned()
            .unwrap_or_default();
        Some((entry.key.clone(), aliases))
    }

    /// Primary key the alias is bound to in this shard, if any.
    pub fn key_for_alias(&self, alias: &str) -> Option<String> {
        self.state.read().entry_keys_by_alias.get(alias).cloned()
    }

    /// Number of stored entries, expired ones included.
    pub fn size(&self) -> usize {
        self.state.read().entries.len()
    }
}

/// Number of entries a forced eviction removes from a shard of `len` entries.
fn eviction_count(len: usize, percentage: u8) -> usize {
    if len == 0 {
        return 0;
    }
    let count = (len * percentage as usize).div_ceil(100);
    count.clamp(1, len)
}

/// Selects the `count` keys with the earliest expiry.
///
/// Quickselect over the expiry instants; ties are broken by key so the result
/// does not depend on map iteration order.
fn soonest_expiring<'a>(
    candidates: impl Iterator<Item = (Instant, &'a str)>,
    count: usize,
) -> Vec<String> {
    let mut candidates: Vec<(Instant, &str)> = candidates.collect();
    if count == 0 {
        return Vec::new();
    }
    if count < candidates.len() {
        candidates.select_nth_unstable(count - 1);
        candidates.truncate(count);
    }
    candidates
        .into_iter()
        .map(|(_, key)| key.to_string())
        .collect()
}

fn refresh_backoff(base: Duration, retries: u32) -> Duration {
    base.saturating_mul(1u32 << retries.min(MAX_BACKOFF_EXPONENT))
}

/// Random padding that spreads the refreshes of entries written together.
fn refresh_jitter(refresh: &RefreshConfig) -> Duration {
    let spread = refresh.max_refresh_time.saturating_sub(refresh.min_refresh_time);
    if spread.is_zero() {
        return Duration::ZERO;
    }
    rand::thread_rng().gen_range(Duration::ZERO..spread)
}
