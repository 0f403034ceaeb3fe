//! Out-of-band commands from clients and background triggers from the host.

use async_trait::async_trait;
use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{eviction, Lifecycle, NamespaceManager, PartitionKind};
use crate::clients::{ClientId, ClientRegistry};
use crate::config::{Config, NotificationConfig};

/// Commands a foreground client can send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
  /// Activate the installed version without waiting for pages to close
  SkipWaiting,
  /// Delete every partition of the namespace
  ClearCache,
  /// Pre-warm the dynamic partition
  CacheUrls { urls: Vec<String> },
}

#[derive(Deserialize)]
struct Envelope {
  #[serde(rename = "type")]
  kind: String,
  #[serde(default)]
  payload: Value,
}

#[derive(Deserialize)]
struct CacheUrlsPayload {
  urls: Vec<String>,
}

impl ControlMessage {
  /// Parse the `{type, payload?}` wire shape.
  pub fn parse(value: Value) -> Result<Self> {
    let envelope: Envelope =
      serde_json::from_value(value).map_err(|e| eyre!("Malformed control message: {}", e))?;

    match envelope.kind.as_str() {
      "SKIP_WAITING" => Ok(Self::SkipWaiting),
      "CLEAR_CACHE" => Ok(Self::ClearCache),
      "CACHE_URLS" => {
        let payload: CacheUrlsPayload = serde_json::from_value(envelope.payload)
          .map_err(|e| eyre!("Malformed CACHE_URLS payload: {}", e))?;
        Ok(Self::CacheUrls { urls: payload.urls })
      }
      other => Err(eyre!("Unknown control message type '{}'", other)),
    }
  }
}

/// Messages sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundMessage {
  SyncBackground(SyncOutcome),
  CheckInventoryExpiry { timestamp: i64 },
}

/// Result of asking clients to reconcile their data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub timestamp: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

/// A user-visible notification built from a push payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  #[serde(default)]
  pub icon: Option<String>,
  #[serde(default)]
  pub badge: Option<String>,
  #[serde(default)]
  pub tag: Option<String>,
  /// Page to open when clicked
  #[serde(default)]
  pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PushPayload {
  title: Option<String>,
  body: Option<String>,
  icon: Option<String>,
  tag: Option<String>,
  url: Option<String>,
}

/// Displays notifications on behalf of the handler.
#[async_trait]
pub trait Notifier: Send + Sync {
  async fn show(&self, notification: &Notification) -> Result<()>;
  async fn close(&self, notification: &Notification) -> Result<()>;
}

/// Notifier that only records notifications in the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
  async fn show(&self, notification: &Notification) -> Result<()> {
    info!(title = %notification.title, body = %notification.body, tag = ?notification.tag, "Notification");
    Ok(())
  }

  async fn close(&self, notification: &Notification) -> Result<()> {
    debug!(title = %notification.title, "Notification closed");
    Ok(())
  }
}

/// What a notification click resulted in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
  Focused(ClientId),
  Opened(String),
}

/// Control-message handler.
///
/// Every operation is idempotent and independent of the others. Sync and
/// periodic triggers only signal clients; no business data is touched here.
pub struct ControlHandler {
  manager: Arc<NamespaceManager>,
  clients: Arc<ClientRegistry>,
  notifier: Arc<dyn Notifier>,
  origin: Url,
  root_url: Url,
  dynamic_limit: usize,
  sync_tag: String,
  periodic_tag: String,
  notifications: NotificationConfig,
}

impl ControlHandler {
  pub fn new(
    config: &Config,
    manager: Arc<NamespaceManager>,
    clients: Arc<ClientRegistry>,
    notifier: Arc<dyn Notifier>,
  ) -> Result<Self> {
    Ok(Self {
      manager,
      clients,
      notifier,
      origin: config.origin_url()?,
      root_url: config.resolve("/")?,
      dynamic_limit: config.limits.dynamic,
      sync_tag: config.sync_tag.clone(),
      periodic_tag: config.periodic_tag.clone(),
      notifications: config.notifications.clone(),
    })
  }

  pub async fn handle_message(&self, message: ControlMessage) -> Result<()> {
    match message {
      ControlMessage::SkipWaiting => self.force_activate().await,
      ControlMessage::ClearCache => {
        self.manager.delete_all_partitions().await?;
        Ok(())
      }
      ControlMessage::CacheUrls { urls } => self.prewarm(&urls).await,
    }
  }

  /// Activate the installed version and take over open pages at once.
  pub async fn activate(&self) -> Result<()> {
    self.manager.activate().await?;
    self.clients.claim()?;
    Ok(())
  }

  async fn force_activate(&self) -> Result<()> {
    match self.manager.lifecycle() {
      Lifecycle::Installed => self.activate().await,
      Lifecycle::Active => {
        debug!("Already active, nothing to skip");
        Ok(())
      }
      Lifecycle::Uninitialized => Err(eyre!("No installed version to activate")),
    }
  }

  async fn prewarm(&self, urls: &[String]) -> Result<()> {
    let urls = urls
      .iter()
      .map(|u| {
        self
          .origin
          .join(u)
          .map_err(|e| eyre!("Invalid URL '{}': {}", u, e))
      })
      .collect::<Result<Vec<_>>>()?;

    let partition = self.manager.partition_name(PartitionKind::Dynamic);
    let added = self.manager.add_entries(&partition, &urls).await?;
    eviction::enforce_limit(&self.manager, &partition, self.dynamic_limit).await;
    info!(added, "Pre-warmed dynamic partition");
    Ok(())
  }

  /// Send `message` to every client. Fails if any client could not be reached.
  fn broadcast(&self, message: &OutboundMessage) -> Result<usize> {
    let clients = self.clients.match_all()?;
    let mut failed = 0;
    for client in &clients {
      if let Err(e) = self.clients.post(client.id, message.clone()) {
        warn!(client = client.id, "Failed to post message: {:#}", e);
        failed += 1;
      }
    }
    if failed > 0 {
      return Err(eyre!("{} of {} clients unreachable", failed, clients.len()));
    }
    Ok(clients.len())
  }

  /// Ask clients to reconcile their data.
  ///
  /// On failure the clients still reachable get a `success: false` payload
  /// and the error is returned so the host can retry the sync later.
  pub async fn background_sync(&self, tag: &str) -> Result<()> {
    if tag != self.sync_tag {
      debug!(tag, "Ignoring sync tag");
      return Ok(());
    }

    let success = OutboundMessage::SyncBackground(SyncOutcome {
      success: true,
      timestamp: Some(Utc::now().timestamp_millis()),
      error: None,
    });

    match self.broadcast(&success) {
      Ok(count) => {
        info!(clients = count, "Background sync signalled");
        Ok(())
      }
      Err(e) => {
        let failure = OutboundMessage::SyncBackground(SyncOutcome {
          success: false,
          timestamp: None,
          error: Some(e.to_string()),
        });
        if let Err(report) = self.broadcast(&failure) {
          warn!("Could not report sync failure: {:#}", report);
        }
        Err(e.wrap_err("Background sync failed"))
      }
    }
  }

  /// Tell clients to re-check business data freshness.
  pub async fn periodic_check(&self, tag: &str) -> Result<()> {
    if tag != self.periodic_tag {
      debug!(tag, "Ignoring periodic tag");
      return Ok(());
    }

    let message = OutboundMessage::CheckInventoryExpiry {
      timestamp: Utc::now().timestamp_millis(),
    };
    let count = self.broadcast(&message)?;
    debug!(clients = count, "Expiry check signalled");
    Ok(())
  }

  /// Build a notification from a push payload and show it.
  ///
  /// JSON payloads may set any field; plain text becomes the body.
  pub async fn push_received(&self, data: Option<&[u8]>) -> Result<Notification> {
    let payload = match data {
      None => PushPayload::default(),
      Some(bytes) => serde_json::from_slice::<PushPayload>(bytes).unwrap_or_else(|_| {
        let text = String::from_utf8_lossy(bytes).trim().to_string();
        PushPayload {
          body: (!text.is_empty()).then_some(text),
          ..PushPayload::default()
        }
      }),
    };

    let notification = Notification {
      title: payload
        .title
        .unwrap_or_else(|| self.notifications.default_title.clone()),
      body: payload
        .body
        .unwrap_or_else(|| self.notifications.default_body.clone()),
      icon: payload.icon.or_else(|| self.notifications.icon.clone()),
      badge: self.notifications.badge.clone(),
      tag: payload.tag,
      url: payload.url,
    };

    self.notifier.show(&notification).await?;
    Ok(notification)
  }

  /// Focus an open application window, or open one.
  pub async fn notification_clicked(&self, notification: &Notification) -> Result<ClickOutcome> {
    if let Err(e) = self.notifier.close(notification).await {
      warn!("Failed to close notification: {:#}", e);
    }

    let clients = self.clients.match_all()?;
    if let Some(client) = clients
      .iter()
      .find(|c| c.url.starts_with(self.root_url.as_str()))
    {
      self.clients.focus(client.id)?;
      return Ok(ClickOutcome::Focused(client.id));
    }

    let target = match notification.url.as_deref() {
      Some(url) => self
        .origin
        .join(url)
        .map_err(|e| eyre!("Invalid notification URL '{}': {}", url, e))?,
      None => self.root_url.clone(),
    };
    self.clients.open_window(target.as_str())?;
    Ok(ClickOutcome::Opened(target.to_string()))
  }
}
