//! JSON-lines host driver.
//!
//! Plays the part of the host environment: every stdin line is one host
//! event, every stdout line is a fetch result or a message delivered to a
//! connected client.
//!
//! ```text
//! {"event":"install"}
//! {"event":"activate"}
//! {"event":"connect","url":"/"}
//! {"event":"fetch","url":"/api/products"}
//! {"event":"fetch","url":"/sales","navigate":true}
//! {"event":"message","client":1,"data":{"type":"CACHE_URLS","payload":{"urls":["/api/stock"]}}}
//! {"event":"sync","tag":"sync-data"}
//! {"event":"push","payload":{"title":"Low stock"}}
//! ```

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};
use url::Url;

use crate::cache::{Request, RequestMode};
use crate::clients::{ClientId, ClientRegistry};
use crate::config::Config;
use crate::control::{Notification, OutboundMessage};
use crate::event::{Event, EventLoop};
use crate::worker::Worker;

/// One line of host input.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostCommand {
  Install,
  Activate,
  Fetch {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    navigate: bool,
    #[serde(default)]
    mode: Option<RequestMode>,
  },
  Connect {
    url: String,
  },
  Disconnect {
    client: ClientId,
  },
  Message {
    #[serde(default)]
    client: Option<ClientId>,
    data: Value,
  },
  Sync {
    tag: String,
  },
  PeriodicSync {
    tag: String,
  },
  Push {
    #[serde(default)]
    payload: Option<Value>,
  },
  NotificationClick {
    notification: Notification,
  },
}

/// One line of host output.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Output {
  Response {
    url: String,
    status: u16,
    source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    body: String,
  },
  Error {
    url: String,
    error: String,
  },
  Connected {
    client: ClientId,
    url: String,
  },
  ClientMessage {
    client: ClientId,
    message: OutboundMessage,
  },
}

fn emit(output: &mpsc::UnboundedSender<String>, line: &Output) {
  match serde_json::to_string(line) {
    Ok(json) => {
      // Writer only stops once the host is gone
      let _ = output.send(json);
    }
    Err(e) => warn!("Failed to serialize output: {}", e),
  }
}

pub struct Host {
  origin: Url,
  clients: Arc<ClientRegistry>,
  events: mpsc::UnboundedSender<Event>,
  output: mpsc::UnboundedSender<String>,
  connected: Vec<ClientId>,
  /// Fetch replies and client message forwarders
  tasks: JoinSet<()>,
}

impl Host {
  pub fn new(
    config: &Config,
    clients: Arc<ClientRegistry>,
    events: mpsc::UnboundedSender<Event>,
    output: mpsc::UnboundedSender<String>,
  ) -> Result<Self> {
    Ok(Self {
      origin: config.origin_url()?,
      clients,
      events,
      output,
      connected: Vec::new(),
      tasks: JoinSet::new(),
    })
  }

  fn send(&self, event: Event) -> Result<()> {
    self
      .events
      .send(event)
      .map_err(|_| eyre!("Event loop has stopped"))
  }

  fn resolve(&self, url: &str) -> Result<Url> {
    self
      .origin
      .join(url)
      .map_err(|e| eyre!("Invalid URL '{}': {}", url, e))
  }

  /// Parse one input line and forward it.
  pub fn handle_line(&mut self, line: &str) -> Result<()> {
    let command: HostCommand =
      serde_json::from_str(line).map_err(|e| eyre!("Invalid host command: {}", e))?;
    self.handle(command)
  }

  pub fn handle(&mut self, command: HostCommand) -> Result<()> {
    match command {
      HostCommand::Install => self.send(Event::Install),
      HostCommand::Activate => self.send(Event::Activate),
      HostCommand::Fetch {
        url,
        method,
        navigate,
        mode,
      } => {
        let url = self.resolve(&url)?;
        let mut request = if navigate {
          Request::navigate(url)
        } else {
          Request::get(url)
        };
        if let Some(method) = method {
          let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
          request = request.with_method(method);
        }
        if let Some(mode) = mode {
          request = request.with_mode(mode);
        }

        let shown = request.url.to_string();
        let (reply, rx) = oneshot::channel();
        self.send(Event::Fetch { request, reply })?;

        let output = self.output.clone();
        self.tasks.spawn(async move {
          let line = match rx.await {
            Ok(Ok(served)) => Output::Response {
              url: shown,
              status: served.response.status,
              source: served.source.as_str(),
              content_type: served.response.header("content-type").map(str::to_string),
              body: String::from_utf8_lossy(&served.response.body).into_owned(),
            },
            Ok(Err(e)) => Output::Error {
              url: shown,
              error: format!("{:#}", e),
            },
            Err(_) => Output::Error {
              url: shown,
              error: "request dropped".to_string(),
            },
          };
          emit(&output, &line);
        });
        Ok(())
      }
      HostCommand::Connect { url } => {
        let url = self.resolve(&url)?;
        let (client, mut rx) = self.clients.connect(url.as_str())?;
        self.connected.push(client);
        emit(
          &self.output,
          &Output::Connected {
            client,
            url: url.to_string(),
          },
        );

        let output = self.output.clone();
        self.tasks.spawn(async move {
          while let Some(message) = rx.recv().await {
            emit(&output, &Output::ClientMessage { client, message });
          }
        });
        Ok(())
      }
      HostCommand::Disconnect { client } => {
        self.connected.retain(|id| *id != client);
        if !self.clients.disconnect(client)? {
          return Err(eyre!("Unknown client {}", client));
        }
        Ok(())
      }
      HostCommand::Message { client, data } => self.send(Event::Message { client, data }),
      HostCommand::Sync { tag } => self.send(Event::Sync { tag }),
      HostCommand::PeriodicSync { tag } => self.send(Event::PeriodicSync { tag }),
      HostCommand::Push { payload } => {
        let data = match payload {
          None => None,
          Some(Value::String(text)) => Some(text.into_bytes()),
          Some(other) => Some(serde_json::to_vec(&other)?),
        };
        self.send(Event::Push { data })
      }
      HostCommand::NotificationClick { notification } => {
        self.send(Event::NotificationClick { notification })
      }
    }
  }

  /// Stop accepting events, let the event loop finish, then wait for
  /// pending output.
  async fn finish(self, runner: JoinHandle<()>) -> Result<()> {
    let Host {
      clients,
      events,
      connected,
      mut tasks,
      ..
    } = self;

    drop(events);
    runner
      .await
      .map_err(|e| eyre!("Event loop panicked: {}", e))?;

    // Dropping the registry's senders ends the forwarders once drained
    for client in connected {
      if let Err(e) = clients.disconnect(client) {
        warn!(client, "Failed to disconnect client: {:#}", e);
      }
    }
    while tasks.join_next().await.is_some() {}
    Ok(())
  }
}

/// Drive the worker from stdin until EOF.
pub async fn run(config: &Config, worker: Arc<Worker>, clients: Arc<ClientRegistry>) -> Result<()> {
  let (events, event_loop) = EventLoop::channel();
  let runner = tokio::spawn(event_loop.run(worker));

  let (output, mut lines_out) = mpsc::unbounded_channel::<String>();
  let writer = tokio::spawn(async move {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines_out.recv().await {
      let written = async {
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await
      };
      if let Err(e) = written.await {
        warn!("Failed to write output: {}", e);
        break;
      }
    }
  });

  let mut host = Host::new(config, clients, events, output.clone())?;
  info!("Host started, reading events from stdin");

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  while let Some(line) = lines.next_line().await? {
    if line.trim().is_empty() {
      continue;
    }
    if let Err(e) = host.handle_line(&line) {
      warn!("Rejected input line: {:#}", e);
      emit(
        &output,
        &Output::Error {
          url: String::new(),
          error: format!("{:#}", e),
        },
      );
    }
  }

  host.finish(runner).await?;
  drop(output);
  writer
    .await
    .map_err(|e| eyre!("Output writer panicked: {}", e))?;

  info!("Host stopped");
  Ok(())
}
