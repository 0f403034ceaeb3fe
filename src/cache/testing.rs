//! In-memory fakes shared by the unit tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::request::{Request, RequestKey, Response};
use super::storage::MemoryStore;
use super::traits::{Fetcher, PartitionStore};

#[derive(Clone)]
enum Script {
  Respond(Response),
  Fail,
}

/// Fetcher answering from a URL → response script and counting every call.
/// Unknown URLs fail like an unreachable network.
#[derive(Default)]
pub struct ScriptedFetcher {
  scripts: Mutex<HashMap<String, Script>>,
  hits: Mutex<HashMap<String, usize>>,
  calls: AtomicUsize,
  offline: AtomicBool,
}

impl ScriptedFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, response: Response) {
    self
      .scripts
      .lock()
      .unwrap()
      .insert(url.to_string(), Script::Respond(response));
  }

  pub fn fail(&self, url: &str) {
    self
      .scripts
      .lock()
      .unwrap()
      .insert(url.to_string(), Script::Fail);
  }

  /// Make every fetch fail until switched back.
  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  /// Total number of fetches attempted.
  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn calls_for(&self, url: &str) -> usize {
    self.hits.lock().unwrap().get(url).copied().unwrap_or(0)
  }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let url = request.url.to_string();
    self.calls.fetch_add(1, Ordering::SeqCst);
    *self.hits.lock().unwrap().entry(url.clone()).or_default() += 1;

    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("network unreachable: {}", url));
    }
    let script = self.scripts.lock().unwrap().get(&url).cloned();
    match script {
      Some(Script::Respond(response)) => Ok(response),
      Some(Script::Fail) | None => Err(eyre!("network unreachable: {}", url)),
    }
  }
}

/// Store whose every operation fails.
pub struct BrokenStore;

#[async_trait]
impl PartitionStore for BrokenStore {
  async fn open(&self, _partition: &str) -> Result<()> {
    Err(eyre!("store offline"))
  }

  async fn get(&self, _partition: &str, _key: &RequestKey) -> Result<Option<Response>> {
    Err(eyre!("store offline"))
  }

  async fn put(&self, _partition: &str, _key: &RequestKey, _response: &Response) -> Result<()> {
    Err(eyre!("store offline"))
  }

  async fn delete(&self, _partition: &str, _key: &RequestKey) -> Result<bool> {
    Err(eyre!("store offline"))
  }

  async fn keys(&self, _partition: &str) -> Result<Vec<RequestKey>> {
    Err(eyre!("store offline"))
  }

  async fn delete_partition(&self, _partition: &str) -> Result<bool> {
    Err(eyre!("store offline"))
  }

  async fn partition_names(&self) -> Result<Vec<String>> {
    Err(eyre!("store offline"))
  }
}

/// Memory store with failures injected per partition.
#[derive(Default)]
pub struct FlakyStore {
  inner: MemoryStore,
  undeletable: Mutex<Vec<String>>,
  /// Writes accepted before `put` starts failing
  puts_left: Mutex<Option<usize>>,
}

impl FlakyStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Make `delete_partition` fail for `partition`.
  pub fn refuse_delete(&self, partition: &str) {
    self.undeletable.lock().unwrap().push(partition.to_string());
  }

  /// Accept `count` more writes, then fail every `put`.
  pub fn fail_puts_after(&self, count: usize) {
    *self.puts_left.lock().unwrap() = Some(count);
  }
}

#[async_trait]
impl PartitionStore for FlakyStore {
  async fn open(&self, partition: &str) -> Result<()> {
    self.inner.open(partition).await
  }

  async fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<Response>> {
    self.inner.get(partition, key).await
  }

  async fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()> {
    {
      let mut left = self.puts_left.lock().unwrap();
      match *left {
        Some(0) => return Err(eyre!("disk full")),
        Some(n) => *left = Some(n - 1),
        None => {}
      }
    }
    self.inner.put(partition, key, response).await
  }

  async fn delete(&self, partition: &str, key: &RequestKey) -> Result<bool> {
    self.inner.delete(partition, key).await
  }

  async fn keys(&self, partition: &str) -> Result<Vec<RequestKey>> {
    self.inner.keys(partition).await
  }

  async fn delete_partition(&self, partition: &str) -> Result<bool> {
    if self.undeletable.lock().unwrap().iter().any(|p| p == partition) {
      return Err(eyre!("{} is locked", partition));
    }
    self.inner.delete_partition(partition).await
  }

  async fn partition_names(&self) -> Result<Vec<String>> {
    self.inner.partition_names().await
  }
}
