use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use fieldlink::app::OfflineRuntime;
use fieldlink::config::Config;
use fieldlink::interceptor::{HttpFetcher, Request, ResponseSource};
use fieldlink::notifications::{
  handle_push, resolve_click, sample_notifications, AlertEvent, ClientWindow, Notification,
  Severity,
};
use fieldlink::storage::{
  clear_offline_data, Collection, NoopStorage, OfflineData, SqliteStorage, Storage,
};
use fieldlink::sync::{ChangeKind, SyncOutcome};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "fieldlink")]
#[command(about = "Offline cache, sync queue and notifications for Field Smart Link")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./fieldlink.yaml, then $XDG_CONFIG_HOME/fieldlink/config.yaml)
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
  /// Prefetch the app shell into the static cache
  Install,
  /// Delete caches from older versions
  Activate,
  /// Fetch a URL through the interceptor
  Fetch {
    /// Path relative to the origin, or an absolute URL
    url: String,
    /// Send as a page navigation
    #[arg(long)]
    navigate: bool,
    /// Pretend the network is down
    #[arg(long)]
    offline: bool,
  },
  /// Inspect or extend the pending-change queue
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },
  /// Replay pending changes
  Sync {
    #[arg(long)]
    offline: bool,
  },
  /// Show sync status, unread count and cache names
  Status,
  /// Manage notifications
  Notify {
    #[command(subcommand)]
    action: NotifyAction,
  },
  /// Render a push payload and resolve its click target
  Push {
    /// JSON push payload
    payload: Option<String>,
  },
  /// Inspect or clear offline record collections
  Store {
    #[command(subcommand)]
    action: StoreAction,
  },
  /// Clear all offline data and the last sync time
  Reset,
}

#[derive(Subcommand, Debug)]
enum QueueAction {
  /// Record a change for later replay
  Add {
    /// create, update or delete
    kind: ChangeKind,
    table: String,
    /// JSON payload
    #[arg(default_value = "{}")]
    data: String,
  },
  List,
  /// Drop every pending change without replaying it
  Clear,
}

#[derive(Subcommand, Debug)]
enum NotifyAction {
  List,
  Add {
    title: String,
    message: String,
    #[arg(short, long, default_value = "info")]
    severity: Severity,
    #[arg(long)]
    action_url: Option<String>,
    #[arg(long)]
    action_label: Option<String>,
    #[arg(long)]
    persistent: bool,
  },
  /// Map a realtime weather_alerts payload to a notification
  Alert { payload: String },
  Read { id: String },
  ReadAll,
  Remove { id: String },
  Clear,
  /// Add the demo notifications
  Seed,
}

#[derive(Subcommand, Debug)]
enum StoreAction {
  /// Records of one collection, or every display collection
  List { collection: Option<Collection> },
  /// Replace a collection with a JSON array of records
  Load { collection: Collection, records: String },
  Clear { collection: Collection },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = fieldlink::logging::init(&config.log_dir()?, args.verbose)?;

  let online = match &args.command {
    Command::Fetch { offline, .. } | Command::Sync { offline } => !offline,
    _ => true,
  };
  let fetcher = HttpFetcher::new(
    config.network.timeout(),
    Config::get_api_key(),
    config.cache.api_hosts.clone(),
  )?;

  if config.features.offline_mode {
    let path = config.database_path()?;
    info!(path = %path.display(), "opening offline store");
    let storage = Arc::new(SqliteStorage::open(&path)?);
    run(&config, storage, fetcher, online, args.command).await
  } else {
    run(&config, Arc::new(NoopStorage), fetcher, online, args.command).await
  }
}

async fn run<S: Storage>(
  config: &Config,
  storage: Arc<S>,
  fetcher: HttpFetcher,
  online: bool,
  command: Command,
) -> Result<()> {
  let runtime = OfflineRuntime::start(config, storage, fetcher, online)?;
  let result = execute(config, &runtime, command).await;
  runtime.shutdown().await;
  result
}

async fn execute<S: Storage>(
  config: &Config,
  runtime: &OfflineRuntime<S, HttpFetcher>,
  command: Command,
) -> Result<()> {
  match command {
    Command::Install => {
      let count = runtime.interceptor.install().await?;
      println!(
        "Cached {} files in {}",
        count,
        runtime.interceptor.cache_names().static_name
      );
    }
    Command::Activate => {
      let deleted = runtime.interceptor.activate()?;
      if deleted.is_empty() {
        println!("No old caches");
      }
      for name in deleted {
        println!("Deleted {}", name);
      }
    }
    Command::Fetch { url, navigate, .. } => {
      let url = runtime.interceptor.resolve(&url)?;
      let request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      };
      let response = runtime.interceptor.respond(&request).await?;
      let source = match response.source {
        ResponseSource::Network => "network",
        ResponseSource::Cache => "cache",
        ResponseSource::Synthetic => "synthetic",
      };
      eprintln!(
        "{} ({}, {})",
        response.status,
        source,
        response.content_type.as_deref().unwrap_or("-")
      );
      println!("{}", response.text());
    }
    Command::Queue { action } => match action {
      QueueAction::Add { kind, table, data } => {
        let data = parse_json(&data)?;
        let change = runtime.sync.enqueue(kind, &table, data)?;
        print_json(&change)?;
      }
      QueueAction::List => print_json(&runtime.sync.queue().load()?)?,
      QueueAction::Clear => {
        runtime.sync.queue().clear()?;
        runtime.sync.refresh();
        println!("Pending changes cleared");
      }
    },
    Command::Sync { .. } => match runtime.sync.force_sync().await {
      SyncOutcome::Completed { replayed } => println!("Synced {} changes", replayed),
      SyncOutcome::Skipped(reason) => println!("Skipped: {:?}", reason),
      SyncOutcome::Failed { error } => return Err(eyre!("Sync failed: {}", error)),
    },
    Command::Status => {
      #[derive(Serialize)]
      #[serde(rename_all = "camelCase")]
      struct StatusReport<'a> {
        sync: fieldlink::sync::SyncStatus,
        unread_notifications: usize,
        static_cache: &'a str,
        dynamic_cache: &'a str,
        caches: Vec<String>,
      }

      let names = runtime.interceptor.cache_names();
      print_json(&StatusReport {
        sync: runtime.sync.status(),
        unread_notifications: runtime.notifications.unread_count(),
        static_cache: &names.static_name,
        dynamic_cache: &names.dynamic_name,
        caches: runtime.storage.cache_names()?,
      })?;
    }
    Command::Notify { action } => notify(runtime, action)?,
    Command::Push { payload } => {
      let Some(notification) = handle_push(payload.as_deref().map(str::as_bytes)) else {
        println!("Nothing to show");
        return Ok(());
      };
      print_json(&notification)?;
      let click = resolve_click(&notification.data, &[] as &[ClientWindow], &config.origin);
      println!("On click: {:?}", click);
    }
    Command::Store { action } => match action {
      StoreAction::List { collection: Some(collection) } => {
        let records: Vec<_> = runtime
          .storage
          .get_all(collection)?
          .into_iter()
          .map(|r| r.data)
          .collect();
        print_json(&records)?;
      }
      StoreAction::List { collection: None } => {
        print_json(&OfflineData::load(runtime.storage.as_ref())?)?
      }
      StoreAction::Load { collection, records } => {
        let records = match parse_json(&records)? {
          serde_json::Value::Array(items) => items,
          _ => return Err(eyre!("Expected a JSON array of records")),
        };
        runtime.storage.replace_all(collection, &records)?;
        println!("Stored {} records in {}", records.len(), collection);
      }
      StoreAction::Clear { collection } => {
        runtime.storage.clear(collection)?;
        runtime.sync.refresh();
        println!("Cleared {}", collection);
      }
    },
    Command::Reset => {
      clear_offline_data(runtime.storage.as_ref())?;
      println!("Offline data cleared");
    }
  }

  Ok(())
}

fn notify<S: Storage>(runtime: &OfflineRuntime<S, HttpFetcher>, action: NotifyAction) -> Result<()> {
  let store = &runtime.notifications;

  match action {
    NotifyAction::List => {
      let now = chrono::Utc::now();
      for n in store.load() {
        println!(
          "{} {:<7} {:<10} {}: {}",
          if n.read { " " } else { "*" },
          n.severity.as_str(),
          fieldlink::notifications::format_relative(n.created_at, now),
          n.title,
          n.message
        );
      }
      println!("{} unread", store.unread_count());
    }
    NotifyAction::Add {
      title,
      message,
      severity,
      action_url,
      action_label,
      persistent,
    } => {
      let id = chrono::Utc::now().timestamp_millis().to_string();
      let mut notification = Notification::new(id, title, message, severity);
      if let Some(url) = action_url {
        notification = notification.with_action(url, action_label);
      }
      notification.persistent = persistent;
      store.add(notification)?;
    }
    NotifyAction::Alert { payload } => {
      let event = AlertEvent::from_change_payload(&parse_json(&payload)?)?;
      store.add(event.into_notification())?;
    }
    NotifyAction::Read { id } => store.mark_read(&id)?,
    NotifyAction::ReadAll => store.mark_all_read()?,
    NotifyAction::Remove { id } => {
      if !store.remove(&id)? {
        return Err(eyre!("No notification with id {}", id));
      }
    }
    NotifyAction::Clear => store.clear()?,
    NotifyAction::Seed => {
      for notification in sample_notifications(chrono::Utc::now()) {
        store.add(notification)?;
      }
    }
  }

  Ok(())
}

fn parse_json(input: &str) -> Result<serde_json::Value> {
  serde_json::from_str(input).map_err(|e| eyre!("Invalid JSON: {}", e))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let out = serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to encode output: {}", e))?;
  println!("{}", out);
  Ok(())
}
