use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use tether::cache::QueryCache;
use tether::config::{self, Config};
use tether::logging;
use tether::offline::{ActionQueue, HttpReplayer, OfflineStore, SyncTrigger};
use tether::stream::{EventKind, StreamManager, WsConnector};

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Live stream, query cache and offline action queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tether/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Connect to the stream and log events until Ctrl-C
  Watch {
    /// Symbols to subscribe to, comma separated
    #[arg(short, long, value_delimiter = ',', required = true)]
    symbols: Vec<String>,

    /// Stream URL (overrides stream.url in the config)
    #[arg(short, long)]
    url: Option<String>,
  },
  /// Queue a mutating request for later replay
  Enqueue {
    endpoint: String,
    method: String,
    /// JSON request body
    payload: String,
  },
  /// List queued and rejected actions
  Pending,
  /// Replay queued actions now
  Drain,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config::data_dir()?.join("logs"), args.verbose)?;

  match args.command {
    Command::Watch { symbols, url } => watch(&config, symbols, url).await,
    Command::Enqueue {
      endpoint,
      method,
      payload,
    } => {
      let payload: serde_json::Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
      let action = open_queue(&config)?.enqueue(&endpoint, &method, &payload)?;
      println!("queued #{} {} {}", action.id, action.method, action.endpoint);
      Ok(())
    }
    Command::Pending => {
      let queue = open_queue(&config)?;
      for action in queue.pending()? {
        println!(
          "#{} {} {} {} {}",
          action.id,
          action.enqueued_at.to_rfc3339(),
          action.method,
          action.endpoint,
          action.payload
        );
      }
      for rejected in queue.rejected()? {
        println!(
          "rejected #{} {} {}: {}",
          rejected.action.id, rejected.action.method, rejected.action.endpoint, rejected.reason
        );
      }
      Ok(())
    }
    Command::Drain => {
      let queue = Arc::new(open_queue(&config)?);
      let cache = QueryCache::new(config.cache.options(), config.cache.gc_interval())?;
      let trigger = SyncTrigger::new(cache, queue, config.offline.sync_options());
      let report = trigger.sync_now().await?;
      println!(
        "replayed {}, rejected {}, remaining {}",
        report.replayed, report.rejected, report.remaining
      );
      Ok(())
    }
  }
}

fn open_queue(config: &Config) -> Result<ActionQueue> {
  let base_url = config
    .offline
    .replay_base_url
    .as_deref()
    .ok_or_else(|| eyre!("offline.replay_base_url is not set in the config"))?;

  let mut replayer = HttpReplayer::new(base_url)?;
  if let Some(token) = Config::api_token() {
    replayer = replayer.with_bearer_token(token);
  }

  let path = config.offline.database_path()?;
  let store = OfflineStore::open(&path)?.with_cached_data_max_age(config.offline.cached_data_max_age());
  Ok(ActionQueue::new(Arc::new(store), Arc::new(replayer)))
}

async fn watch(config: &Config, symbols: Vec<String>, url: Option<String>) -> Result<()> {
  let url = url
    .or_else(|| config.stream.url.clone())
    .ok_or_else(|| eyre!("No stream URL; pass --url or set stream.url in the config"))?;

  let cache = QueryCache::new(config.cache.options(), config.cache.gc_interval())?;
  cache.start()?;

  let manager = StreamManager::new(WsConnector::new(url), config.stream.options());

  let _state = manager.on_state_change(|state| info!(%state, "Stream state"));
  let _prices = {
    let cache = cache.clone();
    manager.on_price(move |msg| {
      let Some(symbol) = msg.symbol() else {
        return;
      };
      if let Err(e) = cache.set(&format!("price:{}", symbol), &msg.payload) {
        warn!(symbol, error = %e, "Failed to cache price");
      }
      println!("{} {}", EventKind::Price, msg.payload);
    })
  };
  let _volume = manager.on_volume(|msg| println!("{} {}", EventKind::Volume, msg.payload));
  let _depth = manager.on_depth(|msg| println!("{} {}", EventKind::Depth, msg.payload));
  let _heartbeat = manager.on_heartbeat(|_| debug!("Heartbeat"));

  manager.subscribe(symbols);
  manager.connect();

  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;

  info!("Shutting down");
  manager.disconnect();
  cache.dispose()?;
  Ok(())
}
