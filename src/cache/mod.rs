//! Interception cache: partitions, eviction and serving strategies.
//!
//! This module is independent of where requests come from. It provides:
//! - Versioned partitions with an install/activate lifecycle
//! - FIFO size bounds per partition
//! - Serve-from-store-first, fetch-first and serve-stale-then-refresh
//! - Pluggable partition stores (SQLite, memory) and network fetchers

pub mod eviction;
mod namespace;
mod request;
mod storage;
mod strategy;
mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use namespace::{Lifecycle, NamespaceManager, PartitionKind};
pub use request::{Request, RequestKey, RequestMode, Response, ResponseKind};
pub use storage::{MemoryStore, SqliteStore};
pub use strategy::StrategyEngine;
pub use traits::{Fetcher, PartitionStore, Served, ServedFrom};
