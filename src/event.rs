use color_eyre::Result;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use crate::cache::{Request, Served};
use crate::clients::ClientId;
use crate::control::Notification;
use crate::worker::Worker;

/// Host events
#[derive(Debug)]
pub enum Event {
  /// A new version was registered
  Install,
  /// Old pages are gone; the installed version may take over
  Activate,
  /// The application issued a request
  Fetch {
    request: Request,
    reply: oneshot::Sender<Result<Served>>,
  },
  /// A client posted a control message
  Message {
    client: Option<ClientId>,
    data: Value,
  },
  /// One-off background sync fired
  Sync { tag: String },
  /// Periodic background sync fired
  PeriodicSync { tag: String },
  /// Push message arrived
  Push { data: Option<Vec<u8>> },
  /// The user clicked a notification
  NotificationClick { notification: Notification },
}

impl Event {
  /// Lifecycle events run to completion before the next event is taken,
  /// everything else runs as its own task.
  fn is_lifecycle(&self) -> bool {
    matches!(self, Event::Install | Event::Activate)
  }

  pub fn name(&self) -> &'static str {
    match self {
      Event::Install => "install",
      Event::Activate => "activate",
      Event::Fetch { .. } => "fetch",
      Event::Message { .. } => "message",
      Event::Sync { .. } => "sync",
      Event::PeriodicSync { .. } => "periodic_sync",
      Event::Push { .. } => "push",
      Event::NotificationClick { .. } => "notification_click",
    }
  }
}

/// Event loop that feeds host events to a worker
pub struct EventLoop {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventLoop {
  /// Create the loop and the sender the host pushes events into
  pub fn channel() -> (mpsc::UnboundedSender<Event>, Self) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Self { rx })
  }

  /// Dispatch events until every sender is dropped, then wait for
  /// in-flight tasks and background refreshes.
  pub async fn run(mut self, worker: Arc<Worker>) {
    let mut tasks = JoinSet::new();

    while let Some(event) = self.rx.recv().await {
      if event.is_lifecycle() {
        worker.dispatch(event).await;
        continue;
      }

      while tasks.try_join_next().is_some() {}
      let worker = Arc::clone(&worker);
      tasks.spawn(async move { worker.dispatch(event).await });
    }

    while tasks.join_next().await.is_some() {}
    worker.shutdown().await;
  }
}
