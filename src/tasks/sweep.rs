//! Expiry Sweep Task
//!
//! Background task that removes expired entries, one shard per tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::Shard;

/// Spawns a background task that sweeps expired entries out of the shards.
///
/// Each tick sweeps exactly one shard and then moves on to the next one,
/// round-robin. With the default interval of `ttl / shards.len()` the whole
/// cache is swept once per ttl, and a single tick never pays for more than
/// one shard.
///
/// # Arguments
/// * `shards` - The client's shard list
/// * `interval` - Delay between two ticks
///
/// # Returns
/// A JoinHandle for the spawned task. The task never finishes on its own;
/// abort the handle to stop it.
///
/// # Panics
/// When called outside of a Tokio runtime.
pub fn spawn_sweep_task<T>(shards: Arc<[Shard<T>]>, interval: Duration) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        info!(
            shards = shards.len(),
            ?interval,
            "Starting expiry sweep task"
        );

        let mut next_shard = 0;
        loop {
            tokio::time::sleep(interval).await;

            let removed = shards[next_shard].evict_expired();
            if removed > 0 {
                info!(shard = next_shard, removed, "Expiry sweep removed entries");
            } else {
                debug!(shard = next_shard, "Expiry sweep found no expired entries");
            }

            next_shard = (next_shard + 1) % shards.len();
        }
    })
}
