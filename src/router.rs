//! Entry point for intercepted requests: filter, classify, dispatch.

use color_eyre::Result;
use reqwest::Method;
use std::sync::Arc;
use tracing::debug;
use url::Origin;

use crate::cache::{Fetcher, NamespaceManager, PartitionKind, Request, Served, StrategyEngine};
use crate::config::Config;

/// Derived category of a request, driving strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// One of the configured application shell entries
  StaticAsset,
  /// Files served by an allow-listed CDN
  RemoteAsset,
  /// Auth / live-data backend traffic
  PassthroughExcluded,
  DefaultDynamic,
}

/// Partition and strategy an intercepted request is served with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Serve-from-store-first on the static partition
  Static,
  /// Serve-stale-then-refresh on the cdn partition
  Remote,
  /// Fetch-first on the dynamic partition
  Dynamic,
}

/// Whether a request is intercepted at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
  /// Goes to the network untouched
  Passthrough,
  Intercept(Route),
}

/// Interception router.
///
/// Holds no state of its own; every cache effect happens inside the
/// strategy engine.
pub struct Router {
  manager: Arc<NamespaceManager>,
  engine: Arc<StrategyEngine>,
  fetcher: Arc<dyn Fetcher>,
  origin: Origin,
  static_paths: Vec<String>,
  remote_hosts: Vec<String>,
  excluded_hosts: Vec<String>,
  dynamic_limit: usize,
  remote_limit: usize,
}

/// Exact host or any subdomain of it.
fn host_matches(host: &str, patterns: &[String]) -> bool {
  patterns.iter().any(|pattern| {
    host.eq_ignore_ascii_case(pattern)
      || host
        .to_ascii_lowercase()
        .ends_with(&format!(".{}", pattern.to_ascii_lowercase()))
  })
}

impl Router {
  pub fn new(
    config: &Config,
    manager: Arc<NamespaceManager>,
    engine: Arc<StrategyEngine>,
    fetcher: Arc<dyn Fetcher>,
  ) -> Result<Self> {
    Ok(Self {
      manager,
      engine,
      fetcher,
      origin: config.origin_url()?.origin(),
      static_paths: config.static_assets.clone(),
      remote_hosts: config.remote_hosts.clone(),
      excluded_hosts: config.excluded_hosts.clone(),
      dynamic_limit: config.limits.dynamic,
      remote_limit: config.limits.remote,
    })
  }

  /// Classify a request by URL shape and the configured host lists.
  pub fn classify(&self, request: &Request) -> RequestClass {
    let url = &request.url;
    let host = url.host_str().unwrap_or_default();

    if host_matches(host, &self.excluded_hosts) {
      return RequestClass::PassthroughExcluded;
    }
    if host_matches(host, &self.remote_hosts) {
      return RequestClass::RemoteAsset;
    }
    // Only the shell is static; other same-origin files stay in the
    // bounded dynamic partition
    if url.origin() == self.origin && self.static_paths.iter().any(|p| p == url.path()) {
      return RequestClass::StaticAsset;
    }
    RequestClass::DefaultDynamic
  }

  /// Decide synchronously whether to intercept.
  pub fn decide(&self, request: &Request) -> Decision {
    if request.method != Method::GET {
      return Decision::Passthrough;
    }
    if !matches!(request.url.scheme(), "http" | "https") {
      return Decision::Passthrough;
    }
    if !self.manager.is_active() {
      return Decision::Passthrough;
    }
    match self.classify(request) {
      RequestClass::PassthroughExcluded => Decision::Passthrough,
      RequestClass::StaticAsset => Decision::Intercept(Route::Static),
      RequestClass::RemoteAsset => Decision::Intercept(Route::Remote),
      RequestClass::DefaultDynamic => Decision::Intercept(Route::Dynamic),
    }
  }

  /// Produce the response for a request the application made.
  ///
  /// Passthrough requests hit the network exactly as if nothing were
  /// intercepting them, including their network errors. Intercepted ones
  /// always resolve to a response, tagged with where it came from.
  pub async fn respond(&self, request: &Request) -> Result<Served> {
    let route = match self.decide(request) {
      Decision::Passthrough => {
        debug!(method = %request.method, url = %request.url, "Passthrough");
        return Ok(Served::from_network(self.fetcher.fetch(request).await?));
      }
      Decision::Intercept(route) => route,
    };

    let served = match route {
      Route::Static => {
        let partition = self.manager.partition_name(PartitionKind::Static);
        self.engine.cache_first(request, &partition).await
      }
      Route::Remote => {
        let partition = self.manager.partition_name(PartitionKind::Remote);
        self
          .engine
          .stale_while_revalidate(request, &partition, self.remote_limit)
          .await
      }
      Route::Dynamic => {
        let partition = self.manager.partition_name(PartitionKind::Dynamic);
        self
          .engine
          .network_first(request, &partition, self.dynamic_limit)
          .await
      }
    };

    debug!(
      url = %request.url,
      ?route,
      source = served.source.as_str(),
      status = served.response.status,
      "Served"
    );
    Ok(served)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::testing::ScriptedFetcher;
  use crate::cache::{MemoryStore, Response, ServedFrom};
  use url::Url;

  struct Harness {
    router: Router,
    manager: Arc<NamespaceManager>,
    fetcher: Arc<ScriptedFetcher>,
  }

  fn harness() -> Harness {
    let config = Config::default();
    let fetcher = Arc::new(ScriptedFetcher::new());
    for path in ["/", "/index.html", "/manifest.json"] {
      fetcher.respond(&format!("http://localhost:5173{}", path), Response::new(200, "shell"));
    }
    let manager = Arc::new(
      NamespaceManager::new(&config, Arc::new(MemoryStore::new()), fetcher.clone()).unwrap(),
    );
    let engine = Arc::new(StrategyEngine::new(
      manager.clone(),
      fetcher.clone(),
      &config.resolve("/").unwrap(),
    ));
    let router = Router::new(&config, manager.clone(), engine, fetcher.clone()).unwrap();
    Harness {
      router,
      manager,
      fetcher,
    }
  }

  async fn active_harness() -> Harness {
    let h = harness();
    h.manager.install().await.unwrap();
    h.manager.activate().await.unwrap();
    h
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  #[test]
  fn test_classify() {
    let h = harness();
    let cases = [
      ("http://localhost:5173/", RequestClass::StaticAsset),
      ("http://localhost:5173/manifest.json", RequestClass::StaticAsset),
      ("http://localhost:5173/assets/index-4f2a.js", RequestClass::DefaultDynamic),
      ("http://localhost:5173/icons/icon.PNG", RequestClass::DefaultDynamic),
      ("http://localhost:5173/api/products", RequestClass::DefaultDynamic),
      ("http://localhost:5173/sales", RequestClass::DefaultDynamic),
      ("https://other.test/app.js", RequestClass::DefaultDynamic),
      ("https://cdn.jsdelivr.net/npm/x.js", RequestClass::RemoteAsset),
      ("https://fonts.gstatic.com/s/a.woff2", RequestClass::RemoteAsset),
      ("https://firestore.googleapis.com/v1/doc", RequestClass::PassthroughExcluded),
      ("https://eu.firestore.googleapis.com/v1/doc", RequestClass::PassthroughExcluded),
    ];
    for (url, expected) in cases {
      assert_eq!(h.router.classify(&get(url)), expected, "{}", url);
    }
  }

  #[test]
  fn test_host_matching_is_suffix_on_label_boundary() {
    let patterns = vec!["unpkg.com".to_string()];
    assert!(host_matches("unpkg.com", &patterns));
    assert!(host_matches("eu.unpkg.com", &patterns));
    assert!(!host_matches("notunpkg.com", &patterns));
  }

  #[tokio::test]
  async fn test_decide_filters() {
    let h = active_harness().await;

    let post = get("http://localhost:5173/api/sales").with_method(Method::POST);
    assert_eq!(h.router.decide(&post), Decision::Passthrough);

    let ext = get("chrome-extension://abcdef/script.js");
    assert_eq!(h.router.decide(&ext), Decision::Passthrough);

    let auth = get("https://identitytoolkit.googleapis.com/v1/accounts:lookup");
    assert_eq!(h.router.decide(&auth), Decision::Passthrough);

    let page = get("http://localhost:5173/inventory");
    assert_eq!(
      h.router.decide(&page),
      Decision::Intercept(Route::Dynamic)
    );

    let shell = get("http://localhost:5173/index.html");
    assert_eq!(h.router.decide(&shell), Decision::Intercept(Route::Static));

    let font = get("https://fonts.gstatic.com/s/a.woff2");
    assert_eq!(h.router.decide(&font), Decision::Intercept(Route::Remote));
  }

  #[tokio::test]
  async fn test_not_intercepting_before_activation() {
    let h = harness();
    h.manager.install().await.unwrap();
    assert_eq!(
      h.router.decide(&get("http://localhost:5173/index.html")),
      Decision::Passthrough
    );
  }

  #[tokio::test]
  async fn test_static_hit_never_reaches_network() {
    let h = active_harness().await;
    let before = h.fetcher.calls();

    for path in ["/", "/index.html", "/manifest.json"] {
      let served = h
        .router
        .respond(&get(&format!("http://localhost:5173{}", path)))
        .await
        .unwrap();
      assert_eq!(served.source, ServedFrom::Cache);
    }
    assert_eq!(h.fetcher.calls(), before);
  }

  #[tokio::test]
  async fn test_same_origin_files_stay_within_dynamic_limit() {
    let h = active_harness().await;
    let limit = Config::default().limits.dynamic;
    let static_partition = h.manager.partition_name(PartitionKind::Static);
    let shell_entries = h.manager.keys(&static_partition).await.unwrap().len();

    for i in 0..limit + 20 {
      let url = format!("http://localhost:5173/uploads/product-{}.png", i);
      h.fetcher.respond(&url, Response::new(200, "png"));
      let served = h.router.respond(&get(&url)).await.unwrap();
      assert_eq!(served.source, ServedFrom::Network);
    }

    assert_eq!(
      h.manager.keys(&static_partition).await.unwrap().len(),
      shell_entries
    );
    let dynamic = h.manager.partition_name(PartitionKind::Dynamic);
    let kept = h.manager.keys(&dynamic).await.unwrap();
    assert_eq!(kept.len(), limit);
    // Oldest uploads went first
    assert!(kept
      .iter()
      .all(|key| key.url.as_str() != "http://localhost:5173/uploads/product-0.png"));
  }

  #[tokio::test]
  async fn test_excluded_host_always_hits_network() {
    let h = active_harness().await;
    let url = "https://firestore.googleapis.com/v1/projects/p/documents/stock";
    let req = get(url);

    // Even a populated partition entry must not be used
    h.manager
      .put(
        &h.manager.partition_name(PartitionKind::Dynamic),
        &req.key(),
        &Response::new(200, "stale"),
      )
      .await
      .unwrap();
    h.fetcher.respond(url, Response::new(200, "live"));

    let served = h.router.respond(&req).await.unwrap();
    assert_eq!(served.source, ServedFrom::Network);
    assert_eq!(served.response.body, b"live".to_vec());
    assert_eq!(h.fetcher.calls_for(url), 1);

    h.fetcher.set_offline(true);
    assert!(h.router.respond(&req).await.is_err());
  }

  #[tokio::test]
  async fn test_dynamic_request_round_trip() {
    let h = active_harness().await;
    let url = "http://localhost:5173/api/inventory";
    h.fetcher.respond(url, Response::new(200, "[1,2,3]"));

    let live = h.router.respond(&get(url)).await.unwrap();
    h.fetcher.set_offline(true);
    let offline = h.router.respond(&get(url)).await.unwrap();

    assert_eq!(live.source, ServedFrom::Network);
    assert_eq!(offline.source, ServedFrom::Cache);
    assert_eq!(live.response, offline.response);
  }

  #[tokio::test]
  async fn test_offline_navigation_gets_shell() {
    let h = active_harness().await;
    h.fetcher.set_offline(true);

    let nav = Request::navigate(Url::parse("http://localhost:5173/reports/monthly").unwrap());
    let served = h.router.respond(&nav).await.unwrap();
    assert_eq!(served.source, ServedFrom::Fallback);
    assert_eq!(served.response.body, b"shell".to_vec());
  }
}
