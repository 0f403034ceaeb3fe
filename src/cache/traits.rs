//! Core traits and types for the caching system.

use async_trait::async_trait;
use color_eyre::Result;

use super::request::{Request, RequestKey, Response};

/// Trait for partition store backends.
///
/// A partition is a named, ordered bucket of request/response pairs. Every
/// operation is atomic per entry; there are no multi-entry transactions.
#[async_trait]
pub trait PartitionStore: Send + Sync {
  /// Create the partition if it does not exist yet.
  async fn open(&self, partition: &str) -> Result<()>;

  /// Look up a single entry.
  async fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<Response>>;

  /// Store an entry, creating the partition if needed.
  ///
  /// Overwriting an existing key moves it to the tail of the insertion order.
  async fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Remove an entry. Returns whether it existed.
  async fn delete(&self, partition: &str, key: &RequestKey) -> Result<bool>;

  /// All keys of a partition, oldest first.
  async fn keys(&self, partition: &str) -> Result<Vec<RequestKey>>;

  /// Remove a whole partition. Returns whether it existed.
  async fn delete_partition(&self, partition: &str) -> Result<bool>;

  /// Names of all partitions, in creation order.
  async fn partition_names(&self) -> Result<Vec<String>>;
}

/// Network access capability.
///
/// `Err` means the request could not complete at all (offline, DNS,
/// timeout). Any HTTP status, including errors, is an `Ok` response.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// A response produced by a serving strategy, with where it came from.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: ServedFrom,
}

impl Served {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ServedFrom::Network,
    }
  }

  pub fn from_cache(response: Response) -> Self {
    Self {
      response,
      source: ServedFrom::Cache,
    }
  }

  /// Network failed and a fallback document stood in for the request.
  pub fn fallback(response: Response) -> Self {
    Self {
      response,
      source: ServedFrom::Fallback,
    }
  }

  pub fn unavailable() -> Self {
    Self {
      response: Response::unavailable(),
      source: ServedFrom::Unavailable,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
  /// Fresh data from network
  Network,
  /// Exact match from a partition
  Cache,
  /// Fallback document for a failed navigation
  Fallback,
  /// Synthetic 503
  Unavailable,
}

impl ServedFrom {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Fallback => "fallback",
      Self::Unavailable => "unavailable",
    }
  }
}
