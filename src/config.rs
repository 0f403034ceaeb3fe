use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

/// Runtime configuration. Every field has a documented default, so running
/// without a config file is valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the application is served from; static asset paths resolve against it
  pub origin: String,
  /// Prefix shared by every partition this system owns
  pub namespace: String,
  /// Version tag of the current partitions
  pub version: String,
  /// Application shell, pre-populated on install
  pub static_assets: Vec<String>,
  /// CDN hosts served stale-then-refresh
  pub remote_hosts: Vec<String>,
  /// Auth / live-data backends that must always reach the network
  pub excluded_hosts: Vec<String>,
  pub limits: LimitsConfig,
  /// Document served when a navigation fails and nothing else matches
  pub fallback_document: String,
  /// Background sync tag that triggers SYNC_BACKGROUND
  pub sync_tag: String,
  /// Periodic sync tag that triggers CHECK_INVENTORY_EXPIRY
  pub periodic_tag: String,
  pub notifications: NotificationConfig,
  pub store: StoreConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
  pub dynamic: usize,
  pub remote: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub default_title: String,
  pub default_body: String,
  pub icon: Option<String>,
  pub badge: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  /// SQLite file (default: $XDG_DATA_HOME/shelfguard/partitions.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Log directory (default: $XDG_DATA_HOME/shelfguard/logs)
  pub dir: Option<PathBuf>,
  /// Filter directive, overridden by RUST_LOG
  pub filter: String,
}

fn strings(items: &[&str]) -> Vec<String> {
  items.iter().map(|s| s.to_string()).collect()
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:5173".to_string(),
      namespace: "inventory".to_string(),
      version: "v1".to_string(),
      static_assets: strings(&["/", "/index.html", "/manifest.json"]),
      remote_hosts: strings(&[
        "cdn.jsdelivr.net",
        "cdnjs.cloudflare.com",
        "unpkg.com",
        "fonts.googleapis.com",
        "fonts.gstatic.com",
      ]),
      excluded_hosts: strings(&[
        "firestore.googleapis.com",
        "identitytoolkit.googleapis.com",
        "securetoken.googleapis.com",
        "firebaseinstallations.googleapis.com",
      ]),
      limits: LimitsConfig::default(),
      fallback_document: "/".to_string(),
      sync_tag: "sync-data".to_string(),
      periodic_tag: "check-inventory-expiry".to_string(),
      notifications: NotificationConfig::default(),
      store: StoreConfig::default(),
      log: LogConfig::default(),
    }
  }
}

impl Default for LimitsConfig {
  fn default() -> Self {
    Self {
      dynamic: 50,
      remote: 30,
    }
  }
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      default_title: "Inventory".to_string(),
      default_body: "You have a new notification".to_string(),
      icon: Some("/icons/icon-192x192.png".to_string()),
      badge: Some("/icons/badge-72x72.png".to_string()),
    }
  }
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      dir: None,
      filter: "info".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shelfguard.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shelfguard/config.yaml
  ///
  /// Falls back to the built-in defaults when no file exists.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shelfguard.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shelfguard").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    self.origin_url()?;
    if self.namespace.is_empty() {
      return Err(eyre!("namespace must not be empty"));
    }
    if self.limits.dynamic == 0 || self.limits.remote == 0 {
      return Err(eyre!("partition limits must be greater than zero"));
    }
    Ok(())
  }

  /// Parsed application origin.
  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve an application path (e.g. "/index.html") against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid path '{}': {}", path, e))
  }
}
