//! Versioned partition namespace and its install/activate lifecycle.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use super::request::{Request, RequestKey, Response};
use super::traits::{Fetcher, PartitionStore};
use crate::config::Config;

/// The logical partitions of one version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
  /// Application shell, unbounded
  Static,
  /// Fetch-first responses, bounded
  Dynamic,
  /// CDN assets, bounded
  Remote,
}

impl PartitionKind {
  /// Lookup order used when any partition may answer.
  pub const ALL: [PartitionKind; 3] = [Self::Dynamic, Self::Static, Self::Remote];

  fn label(&self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
      Self::Remote => "cdn",
    }
  }
}

/// Lifecycle of the current version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
  Uninitialized,
  /// Static partition populated, waiting to take over
  Installed,
  /// Serving requests
  Active,
}

/// Sole owner of the partitions of this namespace.
pub struct NamespaceManager {
  store: Arc<dyn PartitionStore>,
  fetcher: Arc<dyn Fetcher>,
  namespace: String,
  version: String,
  static_assets: Vec<Url>,
  state: RwLock<Lifecycle>,
}

impl NamespaceManager {
  pub fn new(
    config: &Config,
    store: Arc<dyn PartitionStore>,
    fetcher: Arc<dyn Fetcher>,
  ) -> Result<Self> {
    let static_assets = config
      .static_assets
      .iter()
      .map(|path| config.resolve(path))
      .collect::<Result<Vec<_>>>()?;

    Ok(Self {
      store,
      fetcher,
      namespace: config.namespace.clone(),
      version: config.version.clone(),
      static_assets,
      state: RwLock::new(Lifecycle::Uninitialized),
    })
  }

  /// Physical name of a partition in the current version.
  pub fn partition_name(&self, kind: PartitionKind) -> String {
    format!("{}-{}-{}", self.namespace, kind.label(), self.version)
  }

  fn current_names(&self) -> Vec<String> {
    PartitionKind::ALL
      .iter()
      .map(|kind| self.partition_name(*kind))
      .collect()
  }

  fn is_current(&self, partition: &str) -> bool {
    PartitionKind::ALL
      .iter()
      .any(|kind| self.partition_name(*kind) == partition)
  }

  fn in_namespace(&self, partition: &str) -> bool {
    partition.starts_with(&format!("{}-", self.namespace))
  }

  pub fn lifecycle(&self) -> Lifecycle {
    match self.state.read() {
      Ok(state) => *state,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }

  fn set_lifecycle(&self, next: Lifecycle) {
    match self.state.write() {
      Ok(mut state) => *state = next,
      Err(poisoned) => *poisoned.into_inner() = next,
    }
  }

  pub fn is_active(&self) -> bool {
    self.lifecycle() == Lifecycle::Active
  }

  /// Fetch and store the application shell.
  ///
  /// All-or-nothing: if any asset fails to fetch, nothing is written. If a
  /// write fails, a fresh install removes the partition again. Either way
  /// the lifecycle does not advance.
  pub async fn install(&self) -> Result<()> {
    let partition = self.partition_name(PartitionKind::Static);
    info!(%partition, assets = self.static_assets.len(), "Installing");

    let entries = self
      .fetch_all(&self.static_assets)
      .await
      .map_err(|e| e.wrap_err(format!("Install of {} failed", partition)))?;

    if let Err(e) = self.write_all(&partition, &entries).await {
      // A fresh install must not leave a half-filled shell behind
      if self.lifecycle() == Lifecycle::Uninitialized {
        if let Err(cleanup) = self.store.delete_partition(&partition).await {
          warn!(%partition, "Failed to remove partial install: {:#}", cleanup);
        }
      }
      return Err(e.wrap_err(format!("Install of {} failed", partition)));
    }

    if self.lifecycle() == Lifecycle::Uninitialized {
      self.set_lifecycle(Lifecycle::Installed);
    }
    info!(%partition, "Installed");
    Ok(())
  }

  /// Remove every namespaced partition that is not one of the current
  /// three, then start serving. Returns the deleted partition names.
  pub async fn activate(&self) -> Result<Vec<String>> {
    if self.lifecycle() == Lifecycle::Uninitialized {
      return Err(eyre!("Cannot activate {} before install", self.version));
    }

    let current = self.current_names();
    let mut deleted = Vec::new();
    for name in self.store.partition_names().await? {
      if !self.in_namespace(&name) || current.contains(&name) {
        continue;
      }
      match self.store.delete_partition(&name).await {
        Ok(_) => {
          info!(partition = %name, "Deleted stale partition");
          deleted.push(name);
        }
        Err(e) => warn!(partition = %name, "Failed to delete stale partition: {:#}", e),
      }
    }

    self.set_lifecycle(Lifecycle::Active);
    info!(version = %self.version, "Activated");
    Ok(deleted)
  }

  pub async fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<Response>> {
    self.store.get(partition, key).await
  }

  /// Read that treats store failures as a miss.
  pub async fn lookup(&self, partition: &str, key: &RequestKey) -> Option<Response> {
    match self.get(partition, key).await {
      Ok(found) => found,
      Err(e) => {
        warn!(%partition, %key, "Partition read failed: {:#}", e);
        None
      }
    }
  }

  /// First match for `key` across the current partitions.
  pub async fn match_any(&self, key: &RequestKey) -> Option<Response> {
    for kind in PartitionKind::ALL {
      if let Some(found) = self.lookup(&self.partition_name(kind), key).await {
        return Some(found);
      }
    }
    None
  }

  /// Store an entry. Writes aimed at a partition outside the current
  /// version are discarded.
  pub async fn put(&self, partition: &str, key: &RequestKey, response: &Response) -> Result<()> {
    if !self.is_current(partition) {
      debug!(%partition, %key, "Discarding write to superseded partition");
      return Ok(());
    }
    self.store.put(partition, key, response).await
  }

  pub async fn delete(&self, partition: &str, key: &RequestKey) -> Result<bool> {
    self.store.delete(partition, key).await
  }

  /// Keys of a partition, oldest first.
  pub async fn keys(&self, partition: &str) -> Result<Vec<RequestKey>> {
    self.store.keys(partition).await
  }

  pub async fn list_partitions(&self) -> Result<Vec<String>> {
    self.store.partition_names().await
  }

  /// Delete every partition of the namespace, whatever its version.
  pub async fn delete_all_partitions(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for name in self.store.partition_names().await? {
      if !self.in_namespace(&name) {
        continue;
      }
      match self.store.delete_partition(&name).await {
        Ok(_) => deleted.push(name),
        Err(e) => warn!(partition = %name, "Failed to delete partition: {:#}", e),
      }
    }
    info!(count = deleted.len(), "Cleared namespace");
    Ok(deleted)
  }

  /// Pre-warm a partition with the given URLs. All-or-nothing like install.
  pub async fn add_entries(&self, partition: &str, urls: &[Url]) -> Result<usize> {
    let entries = self.fetch_all(urls).await?;
    for (key, response) in &entries {
      self.put(partition, key, response).await?;
    }
    debug!(%partition, count = entries.len(), "Added entries");
    Ok(entries.len())
  }

  async fn write_all(&self, partition: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    self.store.open(partition).await?;
    for (key, response) in entries {
      self.store.put(partition, key, response).await?;
    }
    Ok(())
  }

  async fn fetch_all(&self, urls: &[Url]) -> Result<Vec<(RequestKey, Response)>> {
    try_join_all(urls.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let response = self
        .fetcher
        .fetch(&request)
        .await
        .map_err(|e| e.wrap_err(format!("Failed to fetch {}", url)))?;
      if !response.is_ok() {
        return Err(eyre!("{} returned status {}", url, response.status));
      }
      Ok((request.key(), response))
    }))
    .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::MemoryStore;
  use crate::cache::testing::{FlakyStore, ScriptedFetcher};

  fn manager(config: &Config, store: Arc<MemoryStore>, fetcher: Arc<ScriptedFetcher>) -> NamespaceManager {
    NamespaceManager::new(config, store, fetcher).unwrap()
  }

  fn shell_fetcher(content: &str) -> Arc<ScriptedFetcher> {
    let fetcher = ScriptedFetcher::new();
    for path in ["/", "/index.html", "/manifest.json"] {
      fetcher.respond(&format!("http://localhost:5173{}", path), Response::new(200, content));
    }
    Arc::new(fetcher)
  }

  #[test]
  fn test_partition_names() {
    let ns = manager(&Config::default(), Arc::new(MemoryStore::new()), Arc::new(ScriptedFetcher::new()));
    assert_eq!(ns.partition_name(PartitionKind::Static), "inventory-static-v1");
    assert_eq!(ns.partition_name(PartitionKind::Dynamic), "inventory-dynamic-v1");
    assert_eq!(ns.partition_name(PartitionKind::Remote), "inventory-cdn-v1");
  }

  #[tokio::test]
  async fn test_install_populates_static_partition() {
    let store = Arc::new(MemoryStore::new());
    let ns = manager(&Config::default(), store.clone(), shell_fetcher("v1"));

    ns.install().await.unwrap();

    assert_eq!(ns.lifecycle(), Lifecycle::Installed);
    let keys = ns.keys("inventory-static-v1").await.unwrap();
    assert_eq!(keys.len(), 3);
  }

  #[tokio::test]
  async fn test_install_is_all_or_nothing() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = ScriptedFetcher::new();
    fetcher.respond("http://localhost:5173/", Response::new(200, "root"));
    fetcher.respond("http://localhost:5173/index.html", Response::new(200, "index"));
    fetcher.fail("http://localhost:5173/manifest.json");
    let ns = manager(&Config::default(), store.clone(), Arc::new(fetcher));

    assert!(ns.install().await.is_err());

    assert_eq!(ns.lifecycle(), Lifecycle::Uninitialized);
    assert!(ns.list_partitions().await.unwrap().is_empty());
    assert!(ns.activate().await.is_err());
  }

  #[tokio::test]
  async fn test_install_rejects_http_error_status() {
    let fetcher = shell_fetcher("v1");
    fetcher.respond("http://localhost:5173/manifest.json", Response::new(404, "missing"));
    let ns = manager(&Config::default(), Arc::new(MemoryStore::new()), fetcher);

    assert!(ns.install().await.is_err());
    assert_eq!(ns.lifecycle(), Lifecycle::Uninitialized);
  }

  #[tokio::test]
  async fn test_activate_removes_previous_version() {
    let store = Arc::new(MemoryStore::new());

    let v1 = manager(&Config::default(), store.clone(), shell_fetcher("v1"));
    v1.install().await.unwrap();
    v1.activate().await.unwrap();
    store
      .put("inventory-dynamic-v1", &RequestKey::new("GET", &Url::parse("http://localhost:5173/api").unwrap()), &Response::new(200, "x"))
      .await
      .unwrap();
    store.open("unrelated-cache").await.unwrap();

    let config = Config {
      version: "v2".to_string(),
      ..Config::default()
    };
    let v2 = manager(&config, store.clone(), shell_fetcher("v2"));
    v2.install().await.unwrap();
    assert_eq!(v2.lifecycle(), Lifecycle::Installed);

    let mut deleted = v2.activate().await.unwrap();
    deleted.sort();
    assert_eq!(deleted, vec!["inventory-dynamic-v1", "inventory-static-v1"]);
    assert!(v2.is_active());

    let names = store.partition_names().await.unwrap();
    assert!(names.iter().all(|n| !n.ends_with("-v1")));
    assert!(names.contains(&"unrelated-cache".to_string()));

    let key = RequestKey::new("GET", &Url::parse("http://localhost:5173/index.html").unwrap());
    let stored = v2.match_any(&key).await.unwrap();
    assert_eq!(stored.body, b"v2".to_vec());
  }

  #[tokio::test]
  async fn test_install_write_failure_leaves_no_partition() {
    let store = Arc::new(FlakyStore::new());
    store.fail_puts_after(1);
    let ns = NamespaceManager::new(&Config::default(), store.clone(), shell_fetcher("v1")).unwrap();

    assert!(ns.install().await.is_err());

    assert_eq!(ns.lifecycle(), Lifecycle::Uninitialized);
    assert!(store.partition_names().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_activate_survives_failed_partition_delete() {
    let store = Arc::new(FlakyStore::new());
    let v1 = NamespaceManager::new(&Config::default(), store.clone(), shell_fetcher("v1")).unwrap();
    v1.install().await.unwrap();
    v1.activate().await.unwrap();
    store.open("inventory-dynamic-v1").await.unwrap();
    store.open("inventory-cdn-v1").await.unwrap();
    store.refuse_delete("inventory-dynamic-v1");

    let config = Config {
      version: "v2".to_string(),
      ..Config::default()
    };
    let v2 = NamespaceManager::new(&config, store.clone(), shell_fetcher("v2")).unwrap();
    v2.install().await.unwrap();

    let mut deleted = v2.activate().await.unwrap();
    deleted.sort();
    assert_eq!(deleted, vec!["inventory-cdn-v1", "inventory-static-v1"]);
    assert_eq!(v2.lifecycle(), Lifecycle::Active);

    let names = store.partition_names().await.unwrap();
    assert!(names.contains(&"inventory-dynamic-v1".to_string()));
    assert!(names.contains(&"inventory-static-v2".to_string()));
  }

  #[tokio::test]
  async fn test_activate_deletes_other_naming_schemes_in_namespace() {
    let store = Arc::new(MemoryStore::new());
    store.open("inventory-images").await.unwrap();
    let ns = manager(&Config::default(), store.clone(), shell_fetcher("v1"));
    ns.install().await.unwrap();

    let deleted = ns.activate().await.unwrap();
    assert_eq!(deleted, vec!["inventory-images"]);
  }

  #[tokio::test]
  async fn test_delete_all_partitions_spans_versions() {
    let store = Arc::new(MemoryStore::new());
    store.open("inventory-static-v0").await.unwrap();
    store.open("other-app").await.unwrap();
    let ns = manager(&Config::default(), store.clone(), shell_fetcher("v1"));
    ns.install().await.unwrap();

    let deleted = ns.delete_all_partitions().await.unwrap();
    assert_eq!(deleted.len(), 2);
    assert_eq!(store.partition_names().await.unwrap(), vec!["other-app"]);
  }

  #[tokio::test]
  async fn test_put_discards_superseded_partition() {
    let store = Arc::new(MemoryStore::new());
    let ns = manager(&Config::default(), store.clone(), shell_fetcher("v1"));
    let key = RequestKey::new("GET", &Url::parse("http://localhost:5173/a").unwrap());

    ns.put("inventory-dynamic-v0", &key, &Response::new(200, "late")).await.unwrap();
    assert!(store.partition_names().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_add_entries_all_or_nothing() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = ScriptedFetcher::new();
    fetcher.respond("http://localhost:5173/a", Response::new(200, "a"));
    fetcher.fail("http://localhost:5173/b");
    let ns = manager(&Config::default(), store.clone(), Arc::new(fetcher));
    let dynamic = ns.partition_name(PartitionKind::Dynamic);

    let urls = vec![
      Url::parse("http://localhost:5173/a").unwrap(),
      Url::parse("http://localhost:5173/b").unwrap(),
    ];
    assert!(ns.add_entries(&dynamic, &urls).await.is_err());
    assert!(ns.keys(&dynamic).await.unwrap().is_empty());

    assert_eq!(ns.add_entries(&dynamic, &urls[..1]).await.unwrap(), 1);
    assert_eq!(ns.keys(&dynamic).await.unwrap().len(), 1);
  }
}
