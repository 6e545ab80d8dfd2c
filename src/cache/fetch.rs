//! Fetch Orchestration Module
//!
//! Read-through helpers on top of the store: cache misses call the supplied
//! fetch function (once per key, however many callers are waiting), and hits
//! that are due for a refresh are refreshed on a background task while the
//! cached value is returned immediately.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::{CacheItem, Client, Lookup};
use crate::error::{CacheError, Result};

/// Writes a fetched value back under the key it was requested with.
type StoreFn<T> = fn(&Client<T>, &str, T);

impl<T> Client<T>
where
    T: Clone + Send + Sync + 'static,
{
    // == Get Or Fetch ==
    /// Returns the cached value for `key`, or fetches and caches it.
    ///
    /// * Hit: returns the cached value. If the entry is due for a refresh,
    ///   `fetch` runs on a background task and its outcome replaces the entry.
    /// * Missing-record hit: `Err(MissingRecord)`.
    /// * Miss: `fetch` runs once across all concurrent callers for `key`. A
    ///   `NotFound` outcome is cached as a missing record when missing-record
    ///   storage is enabled. Other errors are returned and not cached.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.fetch_through(key, fetch, Self::store_fetched).await
    }

    async fn fetch_through<F, Fut>(&self, key: &str, fetch: F, store: StoreFn<T>) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        match self.get_with_state(key) {
            Lookup::Found { value, refresh } => {
                if refresh {
                    self.refresh_in_background(key.to_string(), fetch(), store);
                }
                Ok(value)
            }
            Lookup::MissingRecord { refresh } => {
                if refresh {
                    self.refresh_in_background(key.to_string(), fetch(), store);
                }
                Err(CacheError::MissingRecord(key.to_string()))
            }
            Lookup::Absent => self.fetch_deduplicated(key, fetch, store).await,
        }
    }

    async fn fetch_deduplicated<F, Fut>(&self, key: &str, fetch: F, store: StoreFn<T>) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let call = Arc::clone(
            self.inner
                .in_flight
                .lock()
                .entry(key.to_string())
                .or_default(),
        );

        let result = call
            .get_or_init(|| async {
                // A previous leader may have stored the value after our miss.
                // Peek so a due entry stays due for the next regular read.
                match self.inner.shards[self.shard_index(key)].peek(key) {
                    Lookup::Found { value, .. } => Ok(value),
                    Lookup::MissingRecord { .. } => {
                        Err(CacheError::MissingRecord(key.to_string()))
                    }
                    Lookup::Absent => {
                        let outcome = fetch().await;
                        self.store_outcome(key, outcome, store)
                    }
                }
            })
            .await
            .clone();

        let mut in_flight = self.inner.in_flight.lock();
        if in_flight
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, &call))
        {
            in_flight.remove(key);
        }
        result
    }

    /// Number of keys with a fetch currently in progress.
    pub fn num_keys_in_flight(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Caches a foreground fetch outcome and converts it into the caller's
    /// result.
    fn store_outcome(&self, key: &str, outcome: Result<T>, store: StoreFn<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                store(self, key, value.clone());
                Ok(value)
            }
            Err(CacheError::NotFound(_)) if self.inner.config.store_missing_records => {
                self.store_missing_record(key);
                Err(CacheError::MissingRecord(key.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    /// Writes a fetched value, keeping any aliases already bound to the entry
    /// that `key` resolves to.
    fn store_fetched(&self, key: &str, value: T) {
        let shard = &self.inner.shards[self.shard_index(key)];
        let (primary, aliases) = shard
            .binding(key)
            .unwrap_or_else(|| (key.to_string(), Vec::new()));
        self.write(primary, Some(value), aliases);
    }

    /// Records that `key` no longer exists at the source.
    fn store_absence(&self, key: &str) {
        if self.inner.config.store_missing_records {
            self.store_missing_record(key);
        } else {
            self.delete(key);
        }
    }

    fn refresh_in_background<Fut>(&self, key: String, refresh: Fut, store: StoreFn<T>)
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        debug!(key = %key, "Refreshing entry in background");
        let client = self.clone();
        tokio::spawn(async move {
            match refresh.await {
                Ok(value) => store(&client, &key, value),
                Err(CacheError::NotFound(_)) => client.store_absence(&key),
                Err(err) => warn!(key = %key, error = %err, "Background refresh failed"),
            }
        });
    }

    // == Get Or Fetch Batch ==
    /// Batch variant of [`Client::get_or_fetch`].
    ///
    /// Each id is mapped to its cache key with `key_fn`. Cached ids are served
    /// directly; all missing ids are fetched with a single `fetch` call, and
    /// ids due for a refresh are refreshed with one background `fetch` call.
    /// Requested ids absent from a fetch response are cached as missing
    /// records when that is enabled. The returned map is keyed by id.
    pub async fn get_or_fetch_batch<K, F, Fut>(
        &self,
        ids: &[String],
        key_fn: K,
        fetch: F,
    ) -> Result<HashMap<String, T>>
    where
        K: Fn(&str) -> String,
        F: Fn(Vec<String>) -> Fut,
        Fut: Future<Output = Result<HashMap<String, T>>> + Send + 'static,
    {
        self.fetch_batch_through(ids, key_fn, fetch, Self::store_fetched)
            .await
    }

    async fn fetch_batch_through<K, F, Fut>(
        &self,
        ids: &[String],
        key_fn: K,
        fetch: F,
        store: StoreFn<T>,
    ) -> Result<HashMap<String, T>>
    where
        K: Fn(&str) -> String,
        F: Fn(Vec<String>) -> Fut,
        Fut: Future<Output = Result<HashMap<String, T>>> + Send + 'static,
    {
        let mut found = HashMap::with_capacity(ids.len());
        let mut misses = Vec::new();
        let mut refreshes = Vec::new();

        for id in ids {
            let key = key_fn(id.as_str());
            let pending = (id.clone(), key);
            match self.get_with_state(&pending.1) {
                Lookup::Found { value, refresh } => {
                    found.insert(id.clone(), value);
                    if refresh {
                        refreshes.push(pending);
                    }
                }
                Lookup::MissingRecord { refresh } => {
                    if refresh {
                        refreshes.push(pending);
                    }
                }
                Lookup::Absent => misses.push(pending),
            }
        }

        if !refreshes.is_empty() {
            let refresh = fetch(refreshes.iter().map(|(id, _)| id.clone()).collect());
            let client = self.clone();
            tokio::spawn(async move {
                match refresh.await {
                    Ok(response) => {
                        client.store_batch(refreshes, response, true, store);
                    }
                    Err(err) => warn!(error = %err, "Background batch refresh failed"),
                }
            });
        }

        if misses.is_empty() {
            return Ok(found);
        }

        let response = fetch(misses.iter().map(|(id, _)| id.clone()).collect()).await?;
        found.extend(self.store_batch(misses, response, false, store));
        Ok(found)
    }

    /// Writes a batch response for the `(id, key)` pairs that were requested.
    /// Returns the fetched values keyed by id.
    fn store_batch(
        &self,
        requested: Vec<(String, String)>,
        mut response: HashMap<String, T>,
        refreshing: bool,
        store: StoreFn<T>,
    ) -> HashMap<String, T> {
        let mut fetched = HashMap::with_capacity(response.len());
        for (id, key) in requested {
            match response.remove(&id) {
                Some(value) => {
                    store(self, &key, value.clone());
                    fetched.insert(id, value);
                }
                None if refreshing => self.store_absence(&key),
                None if self.inner.config.store_missing_records => {
                    self.store_missing_record(key);
                }
                None => {}
            }
        }
        fetched
    }
}

// == Item Fetching ==
impl<T> Client<T>
where
    T: CacheItem + Clone + Send + Sync + 'static,
{
    /// [`Client::get_or_fetch`] for values that know their own cache key.
    ///
    /// Fetched items are stored under [`CacheItem::cache_key`] with their
    /// [`CacheItem::cache_alias_keys`]. When `key` differs from the item's
    /// own key it is bound as an extra alias, so later reads of `key` hit.
    ///
    /// # Panics
    /// If an alias of a fetched item is already bound to a different key or
    /// shard.
    pub async fn get_or_fetch_item<F, Fut>(&self, key: &str, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.fetch_through(key, fetch, Self::store_fetched_item).await
    }

    /// [`Client::get_or_fetch_batch`] for values that know their own cache
    /// key. Fetched items are stored as in [`Client::get_or_fetch_item`].
    pub async fn get_or_fetch_batch_items<K, F, Fut>(
        &self,
        ids: &[String],
        key_fn: K,
        fetch: F,
    ) -> Result<HashMap<String, T>>
    where
        K: Fn(&str) -> String,
        F: Fn(Vec<String>) -> Fut,
        Fut: Future<Output = Result<HashMap<String, T>>> + Send + 'static,
    {
        self.fetch_batch_through(ids, key_fn, fetch, Self::store_fetched_item)
            .await
    }

    fn store_fetched_item(&self, key: &str, item: T) {
        let primary = item.cache_key();
        let mut aliases = item.cache_alias_keys();
        if key != primary && !aliases.iter().any(|alias| alias == key) {
            aliases.push(key.to_string());
        }
        self.write(primary, Some(item), aliases);
    }
}
