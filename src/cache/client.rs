//! Cache Client Module
//!
//! Routes every key to exactly one shard, owns the global alias routing map
//! and the background sweep task.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry as AliasSlot;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::info;
use xxhash_rust::xxh3::xxh3_64;

use crate::cache::stats::Metrics;
use crate::cache::{CacheStats, Lookup, Shard};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::tasks::spawn_sweep_task;

// == Cache Item ==
/// Values that know their own cache key and aliases.
///
/// Written through [`Client::set_item`], the key and aliases returned here
/// replace any caller supplied key.
pub trait CacheItem {
    /// Primary key of the item.
    fn cache_key(&self) -> String;
    /// Secondary keys that resolve to the same entry.
    fn cache_alias_keys(&self) -> Vec<String>;
}

pub(super) type InFlightCall<T> = Arc<OnceCell<Result<T>>>;

pub(super) struct ClientInner<T> {
    pub(super) config: Config,
    pub(super) shards: Arc<[Shard<T>]>,
    pub(super) shard_index_by_alias: DashMap<String, usize>,
    pub(super) metrics: Arc<Metrics>,
    pub(super) in_flight: Mutex<HashMap<String, InFlightCall<T>>>,
    sweeper: Option<JoinHandle<()>>,
}

impl<T> Drop for ClientInner<T> {
    fn drop(&mut self) {
        if let Some(sweeper) = &self.sweeper {
            sweeper.abort();
        }
    }
}

// == Client ==
/// A sharded cache of `T` values keyed by strings.
///
/// Cheap to clone; every clone shares the same shards. The background sweep
/// stops once the last clone is dropped.
pub struct Client<T> {
    pub(super) inner: Arc<ClientInner<T>>,
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("aliases", &self.inner.shard_index_by_alias.len())
            .finish()
    }
}

impl<T> Client<T>
where
    T: Clone + Send + Sync + 'static,
{
    // == Constructor ==
    /// Creates a client with `config.num_shards` shards of
    /// `config.capacity / config.num_shards` entries each.
    ///
    /// When continuous evictions are enabled the sweep task is spawned on the
    /// current Tokio runtime.
    ///
    /// # Errors
    /// * `InvalidConfig` when `config` fails validation
    /// * `RuntimeUnavailable` when a sweep is requested outside a runtime
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(Metrics::new(config.metrics.clone()));
        let shard_capacity = config.capacity / config.num_shards;
        let shards: Arc<[Shard<T>]> = (0..config.num_shards)
            .map(|_| Shard::new(shard_capacity, &config, Arc::clone(&metrics)))
            .collect::<Vec<_>>()
            .into();

        let sweeper = if config.continuous_evictions {
            if tokio::runtime::Handle::try_current().is_err() {
                return Err(CacheError::RuntimeUnavailable);
            }
            Some(spawn_sweep_task(Arc::clone(&shards), config.eviction_interval))
        } else {
            None
        };

        info!(
            capacity = config.capacity,
            shards = config.num_shards,
            ttl = ?config.ttl,
            refresh_in_background = config.refresh.is_some(),
            "Cache client initialized"
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                shards,
                shard_index_by_alias: DashMap::new(),
                metrics,
                in_flight: Mutex::new(HashMap::new()),
                sweeper,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The shards, in routing order.
    ///
    /// Shards are exposed for inspection only. Writes have to go through the
    /// client so that aliases are registered in the routing map:
    ///
    /// ```compile_fail
    /// use std::time::Duration;
    /// use refresh_cache::{Client, Config};
    ///
    /// let config = Config::new(10, 2, Duration::from_secs(60), 10).without_continuous_evictions();
    /// let client: Client<u32> = Client::new(config).unwrap();
    /// client.shards()[0].set("k".to_string(), Some(1), vec!["alias".to_string()]);
    /// ```
    pub fn shards(&self) -> &[Shard<T>] {
        &self.inner.shards
    }

    // == Routing ==
    /// Index of the shard responsible for `key`.
    ///
    /// A known alias always routes to the shard it was registered on. Any
    /// other key is hashed.
    pub fn shard_index(&self, key: &str) -> usize {
        let index = match self.inner.shard_index_by_alias.get(key) {
            Some(bound) => *bound,
            None => (xxh3_64(key.as_bytes()) % self.inner.shards.len() as u64) as usize,
        };
        self.inner.metrics.record_shard_index(index);
        index
    }

    fn shard(&self, key: &str) -> &Shard<T> {
        &self.inner.shards[self.shard_index(key)]
    }

    /// Registers `aliases` on `shard_index`.
    ///
    /// # Panics
    /// If an alias is already bound to another shard, or to another key on
    /// the same shard. Either means the caller's key scheme is inconsistent.
    fn alias_guard(&self, key: &str, aliases: &[String], shard_index: usize) {
        for alias in aliases.iter().filter(|alias| alias.as_str() != key) {
            match self.inner.shard_index_by_alias.entry(alias.clone()) {
                AliasSlot::Occupied(bound) => {
                    if *bound.get() != shard_index {
                        panic!("alias '{alias}' already exists in a different shard");
                    }
                }
                AliasSlot::Vacant(slot) => {
                    slot.insert(shard_index);
                }
            }

            if let Some(owner) = self.inner.shards[shard_index].key_for_alias(alias) {
                if owner != key {
                    panic!("alias '{alias}' already exists for a different key");
                }
            }
        }
    }

    // == Get ==
    /// Reads `key` and reports the full entry state, including whether the
    /// caller should refresh it.
    pub fn get_with_state(&self, key: &str) -> Lookup<T> {
        let lookup = self.shard(key).get(key);
        self.inner.metrics.record_read(
            lookup.exists(),
            lookup.is_missing_record(),
            lookup.should_refresh(),
        );
        lookup
    }

    /// Returns the value stored under `key` (primary key or alias). Missing
    /// records read as `None`.
    pub fn get(&self, key: &str) -> Option<T> {
        self.get_with_state(key).into_value()
    }

    /// Reads each key independently. Keys without a value are left out.
    pub fn get_many<I>(&self, keys: I) -> HashMap<String, T>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        keys.into_iter()
            .filter_map(|key| {
                let key = key.as_ref();
                self.get(key).map(|value| (key.to_string(), value))
            })
            .collect()
    }

    /// Reads every id through the cache key `key_fn` derives from it. The
    /// returned map is keyed by id; ids without a value are left out.
    pub fn get_many_key_fn<K>(&self, ids: &[String], key_fn: K) -> HashMap<String, T>
    where
        K: Fn(&str) -> String,
    {
        ids.iter()
            .filter_map(|id| {
                self.get(&key_fn(id.as_str()))
                    .map(|value| (id.clone(), value))
            })
            .collect()
    }

    // == Set ==
    /// Writes `value` under `key`. Returns true if the write forced an eviction.
    pub fn set(&self, key: impl Into<String>, value: T) -> bool {
        self.write(key.into(), Some(value), Vec::new())
    }

    /// Writes `value` under `key` and makes it reachable through `aliases`.
    ///
    /// # Panics
    /// If an alias is already bound to a different key or shard.
    pub fn set_with_aliases(&self, key: impl Into<String>, value: T, aliases: Vec<String>) -> bool {
        self.write(key.into(), Some(value), aliases)
    }

    /// Writes `value` under the key and aliases it reports itself.
    ///
    /// # Panics
    /// If an alias is already bound to a different key or shard.
    pub fn set_item(&self, value: T) -> bool
    where
        T: CacheItem,
    {
        let key = value.cache_key();
        let aliases = value.cache_alias_keys();
        self.write(key, Some(value), aliases)
    }

    /// Caches `key` as a known-missing record.
    pub fn store_missing_record(&self, key: impl Into<String>) -> bool {
        self.write(key.into(), None, Vec::new())
    }

    /// Writes every record. Not atomic: earlier writes stay if a later one
    /// is dropped. Returns true if any write forced an eviction.
    pub fn set_many<I>(&self, records: I) -> bool
    where
        I: IntoIterator<Item = (String, T)>,
    {
        records
            .into_iter()
            .fold(false, |evicted, (key, value)| self.set(key, value) || evicted)
    }

    /// Writes every record under the cache key `key_fn` derives from its id.
    /// Returns true if any write forced an eviction.
    pub fn set_many_key_fn<I, K>(&self, records: I, key_fn: K) -> bool
    where
        I: IntoIterator<Item = (String, T)>,
        K: Fn(&str) -> String,
    {
        records.into_iter().fold(false, |evicted, (id, value)| {
            self.set(key_fn(id.as_str()), value) || evicted
        })
    }

    /// Writes every item under the key and aliases it reports itself.
    /// Returns true if any write forced an eviction.
    ///
    /// # Panics
    /// If an alias is already bound to a different key or shard.
    pub fn set_many_items<I>(&self, items: I) -> bool
    where
        I: IntoIterator<Item = T>,
        T: CacheItem,
    {
        items
            .into_iter()
            .fold(false, |evicted, item| self.set_item(item) || evicted)
    }

    pub(super) fn write(&self, key: String, value: Option<T>, aliases: Vec<String>) -> bool {
        let index = self.shard_index(&key);
        self.alias_guard(&key, &aliases, index);
        self.inner.shards[index].set(key, value, aliases)
    }

    // == Delete ==
    /// Removes the entry reachable through `key`. Returns true if one existed.
    pub fn delete(&self, key: &str) -> bool {
        self.shard(key).delete(key)
    }

    // == Inspection ==
    /// Primary keys of every non-expired entry.
    pub fn scan_keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.size());
        for shard in self.inner.shards.iter() {
            keys.extend(shard.keys());
        }
        keys
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn size(&self) -> usize {
        self.inner.shards.iter().map(Shard::size).sum()
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        self.inner.metrics.snapshot(self.size())
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MetricsRecorder, TestClock};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_client(
        capacity: usize,
        shards: usize,
        eviction_percentage: u8,
    ) -> (Client<String>, Arc<TestClock>) {
        let clock = Arc::new(TestClock::new());
        let config = Config::new(capacity, shards, Duration::from_secs(1), eviction_percentage)
            .without_continuous_evictions()
            .with_clock(clock.clone());
        (Client::new(config).unwrap(), clock)
    }

    /// First generated key that routes to `shard`.
    fn key_on_shard(client: &Client<String>, shard: usize, prefix: &str) -> String {
        (0..)
            .map(|i| format!("{prefix}-{i}"))
            .find(|key| client.shard_index(key) == shard)
            .unwrap()
    }

    #[derive(Clone, Debug, PartialEq)]
    struct User {
        id: u32,
        email: String,
    }

    impl CacheItem for User {
        fn cache_key(&self) -> String {
            format!("user:{}", self.id)
        }
        fn cache_alias_keys(&self) -> Vec<String> {
            vec![format!("email:{}", self.email)]
        }
    }

    #[test]
    fn test_client_requires_runtime_for_sweeps() {
        let result = Client::<String>::new(Config::new(10, 2, Duration::from_secs(1), 10));
        assert!(matches!(result, Err(CacheError::RuntimeUnavailable)));
    }

    #[test]
    fn test_client_rejects_invalid_config() {
        let config = Config::new(10, 0, Duration::from_secs(1), 10).without_continuous_evictions();
        assert!(matches!(
            Client::<String>::new(config),
            Err(CacheError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_set_and_get() {
        let (client, _) = test_client(100, 4, 10);
        client.set("key1", "value1".to_string());

        assert_eq!(client.get("key1"), Some("value1".to_string()));
        assert_eq!(client.get("missing"), None);
        assert_eq!(client.size(), 1);
    }

    #[test]
    fn test_entries_expire_after_ttl() {
        let (client, clock) = test_client(100, 4, 10);
        client.set("key1", "value1".to_string());

        clock.advance(Duration::from_millis(1001));
        assert_eq!(client.get("key1"), None);
        assert!(client.scan_keys().is_empty());
        assert_eq!(client.size(), 1);
    }

    #[test]
    fn test_shard_capacity_is_split_evenly() {
        let (client, _) = test_client(100, 10, 10);
        assert_eq!(client.shards().len(), 10);
        assert!(client.shards().iter().all(|shard| shard.capacity() == 10));
    }

    #[test]
    fn test_aliases_route_to_primary_shard() {
        let (client, _) = test_client(100, 8, 10);
        client.set_with_aliases(
            "primary",
            "v".to_string(),
            vec!["a1".to_string(), "a2".to_string()],
        );

        let primary_shard = client.shard_index("primary");
        for alias in ["a1", "a2"] {
            assert_eq!(client.get(alias), Some("v".to_string()));
            assert_eq!(client.shard_index(alias), primary_shard);
        }
    }

    #[test]
    fn test_set_item_uses_item_keys() {
        let config = Config::new(100, 8, Duration::from_secs(1), 10).without_continuous_evictions();
        let items = Client::<User>::new(config).unwrap();

        let user = User {
            id: 7,
            email: "ada@example.com".to_string(),
        };
        items.set_item(user.clone());

        assert_eq!(items.get("user:7"), Some(user.clone()));
        assert_eq!(items.get("email:ada@example.com"), Some(user));
    }

    #[test]
    fn test_repeated_set_keeps_one_entry() {
        let (client, _) = test_client(100, 4, 10);
        let aliases = vec!["a1".to_string()];
        client.set_with_aliases("k", "v".to_string(), aliases.clone());
        client.set_with_aliases("k", "v".to_string(), aliases);

        assert_eq!(client.size(), 1);
        assert_eq!(client.scan_keys(), vec!["k".to_string()]);
        assert_eq!(client.get("a1"), Some("v".to_string()));
    }

    #[test]
    #[should_panic(expected = "already exists in a different shard")]
    fn test_alias_on_different_shard_panics() {
        let (client, _) = test_client(100, 8, 10);
        let first = key_on_shard(&client, 0, "k");
        let second = key_on_shard(&client, 1, "k");

        client.set_with_aliases(first, "v".to_string(), vec!["shared".to_string()]);
        client.set_with_aliases(second, "v".to_string(), vec!["shared".to_string()]);
    }

    #[test]
    #[should_panic(expected = "already exists for a different key")]
    fn test_alias_on_different_key_same_shard_panics() {
        let (client, _) = test_client(100, 8, 10);
        let first = key_on_shard(&client, 2, "a");
        let second = key_on_shard(&client, 2, "b");

        client.set_with_aliases(first, "v".to_string(), vec!["shared".to_string()]);
        client.set_with_aliases(second, "v".to_string(), vec!["shared".to_string()]);
    }

    #[test]
    fn test_deleted_alias_keeps_its_shard() {
        let (client, _) = test_client(100, 8, 10);
        let key = key_on_shard(&client, 3, "k");
        client.set_with_aliases(key.clone(), "v".to_string(), vec!["alias".to_string()]);

        assert!(client.delete("alias"));
        assert_eq!(client.get(&key), None);
        assert_eq!(client.shard_index("alias"), 3);

        // Another key on the same shard may now claim the alias
        let other = key_on_shard(&client, 3, "other");
        client.set_with_aliases(other.clone(), "w".to_string(), vec!["alias".to_string()]);
        assert_eq!(client.get("alias"), Some("w".to_string()));
    }

    #[test]
    fn test_missing_records() {
        let (client, _) = test_client(100, 4, 10);
        client.store_missing_record("ghost");

        assert_eq!(client.get("ghost"), None);
        let state = client.get_with_state("ghost");
        assert!(state.exists());
        assert!(state.is_missing_record());

        let stats = client.stats();
        assert_eq!(stats.missing_record_hits, 2);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_get_many_and_set_many() {
        let (client, _) = test_client(100, 4, 10);
        let records = vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ];
        assert!(!client.set_many(records));
        client.store_missing_record("c");

        let found = client.get_many(["a", "b", "c", "d"]);
        assert_eq!(found.len(), 2);
        assert_eq!(found["a"], "1");
        assert_eq!(found["b"], "2");
    }

    #[test]
    fn test_key_fn_variants_are_keyed_by_id() {
        let (client, _) = test_client(100, 4, 10);
        let records: HashMap<String, String> = [("1", "one"), ("2", "two")]
            .iter()
            .map(|(id, value)| (id.to_string(), value.to_string()))
            .collect();

        assert!(!client.set_many_key_fn(records.clone(), |id| format!("movie-{id}")));
        assert_eq!(client.get("movie-1"), Some("one".to_string()));
        assert_eq!(client.get("1"), None);

        let ids = vec!["1".to_string(), "2".to_string(), "3".to_string()];
        let found = client.get_many_key_fn(&ids, |id| format!("movie-{id}"));
        assert_eq!(found, records);
    }

    #[test]
    fn test_set_many_items_uses_item_keys() {
        let config = Config::new(100, 4, Duration::from_secs(1), 10).without_continuous_evictions();
        let client: Client<User> = Client::new(config).unwrap();
        let users: Vec<User> = (1..=3)
            .map(|id| User {
                id,
                email: format!("u{id}@example.com"),
            })
            .collect();

        assert!(!client.set_many_items(users.clone()));

        assert_eq!(client.size(), 3);
        for user in users {
            assert_eq!(client.get(&format!("user:{}", user.id)), Some(user.clone()));
            assert_eq!(client.get(&format!("email:{}", user.email)), Some(user));
        }
    }

    #[test]
    fn test_forced_eviction_is_local_to_one_shard() {
        let (client, clock) = test_client(100, 10, 10);

        let mut next = 0;
        for shard in 0..10 {
            while client.shards()[shard].size() < 10 {
                let key = format!("key-{next}");
                next += 1;
                if client.shard_index(&key) == shard {
                    assert!(!client.set(key, "v".to_string()));
                    clock.advance(Duration::from_millis(1));
                }
            }
        }
        assert_eq!(client.size(), 100);

        let overflow = key_on_shard(&client, 3, "overflow");
        assert!(client.set(overflow.clone(), "v".to_string()));

        assert!(client.shards()[3].size() <= 10);
        assert_eq!(client.get(&overflow), Some("v".to_string()));
        for (index, shard) in client.shards().iter().enumerate() {
            if index != 3 {
                assert_eq!(shard.size(), 10, "shard {index} should be untouched");
            }
        }
        let stats = client.stats();
        assert_eq!(stats.forced_evictions, 1);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn test_metrics_recorder_sees_shard_selection() {
        #[derive(Default)]
        struct ShardCounter(AtomicUsize);
        impl MetricsRecorder for ShardCounter {
            fn shard_index(&self, _index: usize) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let recorder = Arc::new(ShardCounter::default());
        let config = Config::new(10, 2, Duration::from_secs(1), 10)
            .without_continuous_evictions()
            .with_metrics(recorder.clone());
        let client = Client::<u32>::new(config).unwrap();

        client.set("a", 1);
        client.get("a");
        assert_eq!(recorder.0.load(Ordering::Relaxed), 2);
    }
}
