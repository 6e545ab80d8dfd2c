//! Background Tasks Module
//!
//! Contains background tasks that run for the lifetime of a cache client.
//!
//! # Tasks
//! - Expiry sweep: removes expired entries from one shard per tick

mod sweep;

pub use sweep::spawn_sweep_task;
