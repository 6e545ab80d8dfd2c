//! Refresh Cache demo
//!
//! Drives the cache with a read-heavy workload against a simulated slow data
//! source and periodically logs the cache statistics as JSON.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use refresh_cache::{CacheError, Client, Config};

/// Number of distinct records the simulated source knows about.
const KNOWN_RECORDS: u64 = 5_000;
/// Ids above `KNOWN_RECORDS` and below this bound do not exist at the source.
const ID_SPACE: u64 = 6_000;
const READERS: usize = 8;
const READS_PER_ROUND: usize = 500;

/// Main entry point for the demo.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Create the cache client (starts the expiry sweep)
/// 4. Run rounds of concurrent reads until Ctrl+C
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "refresh_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Refresh Cache demo");

    let config = Config::from_env();
    info!(?config, "Configuration loaded");

    let client: Client<String> = Client::new(config).context("creating cache client")?;
    let source_calls = Arc::new(AtomicU64::new(0));

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_round(&client, &source_calls).await?;
                let stats = serde_json::to_string(&client.stats())?;
                info!(
                    stats = %stats,
                    source_calls = source_calls.load(Ordering::Relaxed),
                    "Round complete"
                );
            }
            result = signal::ctrl_c() => {
                result.context("installing Ctrl+C handler")?;
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    info!("Demo shutdown complete");
    Ok(())
}

/// Runs `READERS` concurrent readers, each reading `READS_PER_ROUND` random ids.
async fn run_round(client: &Client<String>, source_calls: &Arc<AtomicU64>) -> anyhow::Result<()> {
    let mut readers = JoinSet::new();
    for _ in 0..READERS {
        let client = client.clone();
        let source_calls = Arc::clone(source_calls);
        readers.spawn(async move {
            for _ in 0..READS_PER_ROUND {
                let id = rand::thread_rng().gen_range(0..ID_SPACE);
                let key = format!("record:{id}");
                let calls = Arc::clone(&source_calls);
                match client.get_or_fetch(&key, move || load_record(id, calls)).await {
                    Ok(_) | Err(CacheError::MissingRecord(_)) | Err(CacheError::NotFound(_)) => {}
                    Err(err) => warn!(key = %key, error = %err, "Read failed"),
                }
            }
        });
    }
    while let Some(joined) = readers.join_next().await {
        joined.context("reader task panicked")?;
    }
    Ok(())
}

/// Simulated data source: a few milliseconds of latency per call.
async fn load_record(id: u64, calls: Arc<AtomicU64>) -> refresh_cache::Result<String> {
    calls.fetch_add(1, Ordering::Relaxed);
    tokio::time::sleep(Duration::from_millis(2)).await;
    if id < KNOWN_RECORDS {
        Ok(format!("payload for record {id}"))
    } else {
        Err(CacheError::NotFound(format!("record:{id}")))
    }
}
