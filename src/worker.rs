//! Wires the cache components together and dispatches host events.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::cache::{Fetcher, NamespaceManager, PartitionStore, StrategyEngine};
use crate::clients::ClientRegistry;
use crate::config::Config;
use crate::control::{ControlHandler, ControlMessage, Notifier};
use crate::event::Event;
use crate::router::Router;

/// The interception worker: one per process, built once at start-up.
pub struct Worker {
  manager: Arc<NamespaceManager>,
  engine: Arc<StrategyEngine>,
  router: Router,
  control: ControlHandler,
}

impl Worker {
  pub fn new(
    config: &Config,
    store: Arc<dyn PartitionStore>,
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<ClientRegistry>,
    notifier: Arc<dyn Notifier>,
  ) -> Result<Self> {
    let manager = Arc::new(NamespaceManager::new(config, store, Arc::clone(&fetcher))?);
    let engine = Arc::new(StrategyEngine::new(
      Arc::clone(&manager),
      Arc::clone(&fetcher),
      &config.resolve(&config.fallback_document)?,
    ));
    let router = Router::new(config, Arc::clone(&manager), Arc::clone(&engine), fetcher)?;
    let control = ControlHandler::new(config, Arc::clone(&manager), clients, notifier)?;

    Ok(Self {
      manager,
      engine,
      router,
      control,
    })
  }

  pub fn manager(&self) -> &NamespaceManager {
    &self.manager
  }

  /// Handle one event, containing any failure at this boundary.
  pub async fn dispatch(&self, event: Event) {
    let name = event.name();
    if let Err(e) = self.handle(event).await {
      error!(event = name, "Event handler failed: {:#}", e);
    }
  }

  /// Handle one event and report its outcome.
  pub async fn handle(&self, event: Event) -> Result<()> {
    match event {
      Event::Install => self.manager.install().await,
      Event::Activate => self.control.activate().await,
      Event::Fetch { request, reply } => {
        let served = self.router.respond(&request).await;
        reply
          .send(served)
          .map_err(|_| eyre!("Requester went away before {} was answered", request.url))
      }
      Event::Message { client, data } => {
        let message = match ControlMessage::parse(data) {
          Ok(message) => message,
          Err(e) => {
            warn!(?client, "Ignoring control message: {:#}", e);
            return Ok(());
          }
        };
        info!(?client, ?message, "Control message");
        self.control.handle_message(message).await
      }
      Event::Sync { tag } => self.control.background_sync(&tag).await,
      Event::PeriodicSync { tag } => self.control.periodic_check(&tag).await,
      Event::Push { data } => {
        self.control.push_received(data.as_deref()).await?;
        Ok(())
      }
      Event::NotificationClick { notification } => {
        let outcome = self.control.notification_clicked(&notification).await?;
        info!(?outcome, "Notification click handled");
        Ok(())
      }
    }
  }

  /// Wait for background work so no refresh is cut off mid-write.
  pub async fn shutdown(&self) {
    self.engine.drain().await;
    info!("Worker stopped");
  }
}
