mod cache;
mod clients;
mod config;
mod control;
mod event;
mod host;
mod net;
mod router;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use cache::{MemoryStore, PartitionStore, SqliteStore};
use clients::ClientRegistry;
use control::LogNotifier;
use net::HttpFetcher;
use worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "shelfguard")]
#[command(about = "Offline-first request interception cache for an inventory app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shelfguard/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Keep partitions in memory instead of SQLite
  #[arg(long)]
  memory: bool,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read host events from stdin as JSON lines (default)
  Run,
  /// List stored partitions and their entry counts
  Partitions,
  /// Delete every partition of the configured namespace
  Clear,
}

/// Log to a daily file; stdout carries the host protocol.
fn init_logging(config: &config::Config) -> Result<WorkerGuard> {
  let dir = match &config.log.dir {
    Some(dir) => dir.clone(),
    None => dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?
      .join("shelfguard")
      .join("logs"),
  };
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
    &dir,
    "shelfguard.log",
  ));
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;
  let _guard = init_logging(&config)?;

  let store: Arc<dyn PartitionStore> = if args.memory {
    Arc::new(MemoryStore::new())
  } else {
    match &config.store.path {
      Some(path) => Arc::new(SqliteStore::open_at(path)?),
      None => Arc::new(SqliteStore::open()?),
    }
  };
  let fetcher = Arc::new(HttpFetcher::new(&config)?);
  let clients = Arc::new(ClientRegistry::new());
  let worker = Arc::new(Worker::new(
    &config,
    store,
    fetcher,
    Arc::clone(&clients),
    Arc::new(LogNotifier),
  )?);

  info!(
    namespace = %config.namespace,
    version = %config.version,
    "Starting shelfguard"
  );

  match args.command.unwrap_or(Command::Run) {
    Command::Run => host::run(&config, worker, clients).await?,
    Command::Partitions => {
      let manager = worker.manager();
      for name in manager.list_partitions().await? {
        let count = manager.keys(&name).await?.len();
        println!("{}\t{}", name, count);
      }
    }
    Command::Clear => {
      let deleted = worker.manager().delete_all_partitions().await?;
      for name in &deleted {
        println!("deleted {}", name);
      }
    }
  }

  Ok(())
}
