//! Serving strategies that combine partitions with live network fetches.

use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::Url;

use super::eviction;
use super::namespace::NamespaceManager;
use super::request::{Request, RequestKey, Response};
use super::traits::{Fetcher, Served};

/// Strategy engine that decides how partitions and the network answer a
/// request.
///
/// Partition reads that fail are treated as misses and failed writes are
/// dropped, so a broken store only ever degrades to the network path.
pub struct StrategyEngine {
  manager: Arc<NamespaceManager>,
  fetcher: Arc<dyn Fetcher>,
  /// Cached page returned when a navigation fails with no exact match
  fallback_key: RequestKey,
  /// Background refreshes started by stale-while-revalidate
  refreshes: Mutex<JoinSet<()>>,
}

impl StrategyEngine {
  pub fn new(manager: Arc<NamespaceManager>, fetcher: Arc<dyn Fetcher>, fallback_document: &Url) -> Self {
    Self {
      manager,
      fetcher,
      fallback_key: RequestKey::new("GET", fallback_document),
      refreshes: Mutex::new(JoinSet::new()),
    }
  }

  /// Serve from the partition first.
  ///
  /// 1. Hit - return immediately, no network call
  /// 2. Miss - fetch once, store a copy when cacheable
  /// 3. Network failure - synthetic 503
  pub async fn cache_first(&self, request: &Request, partition: &str) -> Served {
    let key = request.key();

    if let Some(cached) = self.manager.lookup(partition, &key).await {
      debug!(%key, %partition, "Cache hit");
      return Served::from_cache(cached);
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_cacheable() {
          store_copy(&self.manager, partition, &key, &response, None).await;
        }
        Served::from_network(response)
      }
      Err(e) => {
        warn!(%key, "Fetch failed on cache miss: {:#}", e);
        Served::unavailable()
      }
    }
  }

  /// Fetch first, fall back to partitions only when the network fails.
  ///
  /// Only ok responses are stored; HTTP error statuses are passed through
  /// uncached. On network failure: exact stored match, then the fallback
  /// document for page loads, then a synthetic 503.
  pub async fn network_first(&self, request: &Request, partition: &str, max_entries: usize) -> Served {
    let key = request.key();

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        if response.is_ok() {
          store_copy(&self.manager, partition, &key, &response, Some(max_entries)).await;
        }
        Served::from_network(response)
      }
      Err(e) => {
        debug!(%key, "Network failed, trying partitions: {:#}", e);

        if let Some(cached) = self.manager.match_any(&key).await {
          return Served::from_cache(cached);
        }

        if request.expects_document() {
          if let Some(document) = self.manager.match_any(&self.fallback_key).await {
            debug!(%key, fallback = %self.fallback_key, "Serving fallback document");
            return Served::fallback(document);
          }
        }

        Served::unavailable()
      }
    }
  }

  /// Serve whatever is stored now and refresh the partition in the
  /// background.
  ///
  /// The refresh result is only visible to later requests. When nothing is
  /// stored yet the caller waits for the refresh instead.
  pub async fn stale_while_revalidate(&self, request: &Request, partition: &str, max_entries: usize) -> Served {
    let key = request.key();
    let immediate = self.manager.lookup(partition, &key).await;

    let (tx, rx) = oneshot::channel();
    let manager = Arc::clone(&self.manager);
    let fetcher = Arc::clone(&self.fetcher);
    let request = request.clone();
    let partition_name = partition.to_string();
    self.spawn_refresh(async move {
      let outcome = refresh(&manager, fetcher.as_ref(), &request, &partition_name, max_entries).await;
      // Receiver is gone when the caller was already served from the partition
      let _ = tx.send(outcome);
    });

    if let Some(cached) = immediate {
      debug!(%key, %partition, "Serving stale copy, refresh started");
      return Served::from_cache(cached);
    }

    match rx.await {
      Ok(Some(response)) => Served::from_network(response),
      _ => Served::unavailable(),
    }
  }

  fn spawn_refresh<F>(&self, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    match self.refreshes.lock() {
      Ok(mut set) => {
        // Reap finished refreshes
        while set.try_join_next().is_some() {}
        set.spawn(task);
      }
      Err(_) => {
        tokio::spawn(task);
      }
    }
  }

  /// Wait for every outstanding background refresh.
  pub async fn drain(&self) {
    let mut set = match self.refreshes.lock() {
      Ok(mut set) => std::mem::take(&mut *set),
      Err(_) => return,
    };
    while set.join_next().await.is_some() {}
  }
}

async fn refresh(
  manager: &NamespaceManager,
  fetcher: &dyn Fetcher,
  request: &Request,
  partition: &str,
  max_entries: usize,
) -> Option<Response> {
  let key = request.key();
  match fetcher.fetch(request).await {
    Ok(response) => {
      if response.is_cacheable() {
        store_copy(manager, partition, &key, &response, Some(max_entries)).await;
      }
      Some(response)
    }
    Err(e) => {
      debug!(%key, "Background refresh failed: {:#}", e);
      None
    }
  }
}

/// Write a response, then trim the partition if it is bounded.
async fn store_copy(
  manager: &NamespaceManager,
  partition: &str,
  key: &RequestKey,
  response: &Response,
  max_entries: Option<usize>,
) {
  if let Err(e) = manager.put(partition, key, response).await {
    warn!(%key, %partition, "Failed to store response: {:#}", e);
    return;
  }
  if let Some(max_entries) = max_entries {
    eviction::enforce_limit(manager, partition, max_entries).await;
  }
}
