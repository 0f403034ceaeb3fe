//! Connected foreground clients and the channels used to message them.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::control::OutboundMessage;

pub type ClientId = u64;

/// Snapshot of a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
  pub id: ClientId,
  pub url: String,
  pub focused: bool,
  /// Whether the current version controls this client
  pub controlled: bool,
}

struct Client {
  info: ClientInfo,
  tx: mpsc::UnboundedSender<OutboundMessage>,
}

/// Registry of connected clients.
#[derive(Default)]
pub struct ClientRegistry {
  clients: Mutex<Vec<Client>>,
  next_id: AtomicU64,
  opened: Mutex<Vec<String>>,
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  fn clients(&self) -> Result<MutexGuard<'_, Vec<Client>>> {
    self.clients.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Register a client and get the receiving end of its message channel.
  pub fn connect(&self, url: &str) -> Result<(ClientId, mpsc::UnboundedReceiver<OutboundMessage>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    self.clients()?.push(Client {
      info: ClientInfo {
        id,
        url: url.to_string(),
        focused: false,
        controlled: false,
      },
      tx,
    });
    debug!(id, url, "Client connected");
    Ok((id, rx))
  }

  pub fn disconnect(&self, id: ClientId) -> Result<bool> {
    let mut clients = self.clients()?;
    let before = clients.len();
    clients.retain(|c| c.info.id != id);
    Ok(clients.len() < before)
  }

  /// All clients whose channel is still open.
  pub fn match_all(&self) -> Result<Vec<ClientInfo>> {
    let mut clients = self.clients()?;
    clients.retain(|c| !c.tx.is_closed());
    Ok(clients.iter().map(|c| c.info.clone()).collect())
  }

  /// Send a message to one client.
  pub fn post(&self, id: ClientId, message: OutboundMessage) -> Result<()> {
    let clients = self.clients()?;
    let client = clients
      .iter()
      .find(|c| c.info.id == id)
      .ok_or_else(|| eyre!("Unknown client {}", id))?;
    client
      .tx
      .send(message)
      .map_err(|_| eyre!("Client {} is no longer listening", id))
  }

  /// Take control of every connected client. Returns how many were claimed.
  pub fn claim(&self) -> Result<usize> {
    let mut clients = self.clients()?;
    for client in clients.iter_mut() {
      client.info.controlled = true;
    }
    info!(count = clients.len(), "Claimed clients");
    Ok(clients.len())
  }

  /// Give focus to one client, removing it from the others.
  pub fn focus(&self, id: ClientId) -> Result<ClientInfo> {
    let mut clients = self.clients()?;
    if !clients.iter().any(|c| c.info.id == id) {
      return Err(eyre!("Unknown client {}", id));
    }
    let mut focused = None;
    for client in clients.iter_mut() {
      client.info.focused = client.info.id == id;
      if client.info.focused {
        focused = Some(client.info.clone());
      }
    }
    focused.ok_or_else(|| eyre!("Unknown client {}", id))
  }

  /// Ask the host to open a new window. The page connects itself once loaded.
  pub fn open_window(&self, url: &str) -> Result<()> {
    info!(url, "Opening window");
    self
      .opened
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .push(url.to_string());
    Ok(())
  }

  /// Windows requested through [`ClientRegistry::open_window`].
  #[cfg(test)]
  pub fn opened_windows(&self) -> Vec<String> {
    self
      .opened
      .lock()
      .map(|opened| opened.clone())
      .unwrap_or_default()
  }
}
