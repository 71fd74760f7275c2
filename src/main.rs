use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

use sanur_offline::backend::{Backend, RestBackend};
use sanur_offline::buffer::{OperationKind, PendingMutation};
use sanur_offline::config::Config;
use sanur_offline::entity::CacheSource;
use sanur_offline::location::{Coords, FixedGeolocator, LocationService, ReverseGeocoder};
use sanur_offline::logging;
use sanur_offline::offline::{OfflineSync, Stores};
use sanur_offline::profile::WriteOutcome;
use sanur_offline::reconciler::SyncOutcome;
use sanur_offline::scans::ScanHistory;
use sanur_offline::store::LOCATIONS;
use sanur_offline::worker::{
  CacheSet, HttpCache, HttpNetwork, Method, Network, Request, ServiceWorker, WorkerHandle,
  SYNC_TAG,
};

#[derive(Parser, Debug)]
#[command(name = "sanur")]
#[command(about = "Offline cache and sync core for The Sanur app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/sanur/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Start with connectivity reported as offline
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show connectivity, queue sizes and caches
  Status,
  /// Precache app and map assets and activate the current cache generation
  Install,
  /// List mutations waiting for sync
  Pending,
  /// List mutations given up on
  Failed,
  /// Buffer a mutation for the next sync
  Enqueue {
    /// Backend table, e.g. user_profiles
    resource: String,
    /// insert, update or delete
    operation: OperationKind,
    /// JSON payload
    payload: String,
  },
  /// Replay buffered mutations now
  Sync {
    /// Deliver a background-sync event to the worker instead
    #[arg(long)]
    background: bool,
  },
  /// Show a cached entity snapshot
  Get { partition: String, key: String },
  #[command(subcommand)]
  Profile(ProfileCommand),
  /// Fetch a URL through the interception worker
  Fetch {
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: Method,
    /// Treat the request as a top-level navigation
    #[arg(long)]
    navigate: bool,
    /// JSON request body
    #[arg(long)]
    body: Option<String>,
  },
  /// Resolve and record the current location
  Locate {
    #[arg(long, allow_hyphen_values = true)]
    lat: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    lng: Option<f64>,
    /// Print the recorded history instead
    #[arg(long)]
    history: bool,
  },
  #[command(subcommand)]
  Scans(ScanCommand),
}

#[derive(Subcommand, Debug)]
enum ProfileCommand {
  Show { user_id: String },
  /// Apply JSON updates to a profile
  Set { user_id: String, updates: String },
}

#[derive(Subcommand, Debug)]
enum ScanCommand {
  List,
  Add { result: String },
  Mark { id: i64 },
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  let text =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format output: {}", e))?;
  println!("{}", text);
  Ok(())
}

fn parse_json(text: &str) -> Result<Value> {
  serde_json::from_str(text).map_err(|e| eyre!("Invalid JSON '{}': {}", text, e))
}

fn print_mutations(mutations: &[PendingMutation]) -> Result<()> {
  if mutations.is_empty() {
    println!("(none)");
    return Ok(());
  }
  for m in mutations {
    println!(
      "#{} {} {} attempts={} enqueued={}{}",
      m.id,
      m.operation_kind,
      m.target_resource,
      m.attempts,
      m.enqueued_at.to_rfc3339(),
      m.last_error
        .as_deref()
        .map(|e| format!(" last_error={}", e))
        .unwrap_or_default()
    );
    print_json(&m.payload)?;
  }
  Ok(())
}

fn source_label(source: CacheSource) -> &'static str {
  match source {
    CacheSource::Network => "network",
    CacheSource::Cache => "cache (pending edits)",
    CacheSource::Offline => "offline cache",
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let data_dir = config.app.data_dir()?;
  let _log_guard = logging::init(&data_dir)?;

  let stores = Stores::open(&data_dir);
  let scans = ScanHistory::new(stores.history.clone());
  let backend: Arc<dyn Backend> = Arc::new(RestBackend::new(&config)?);
  let sync = Arc::new(OfflineSync::new(&config, stores, backend, !args.offline));

  let (messages, inbox) = mpsc::unbounded_channel();
  let listener = sync.listen(inbox);

  let network = Arc::new(HttpNetwork::new(
    &config.app.origin,
    Duration::from_secs(config.backend.timeout_secs),
  )?);
  let http_cache = Arc::new(HttpCache::open(&data_dir)?);
  let worker = ServiceWorker::new(&config, network, http_cache.clone(), messages)?.spawn();

  if !matches!(args.command, Command::Install) {
    worker.activate().await?;
  }

  let result = run(args.command, &config, &sync, &worker, &http_cache, &scans).await;

  // Closing the worker closes its message channel, which ends the listener
  // once queued messages are handled.
  drop(worker);
  listener
    .await
    .map_err(|e| eyre!("Message listener failed: {}", e))?;

  result
}

async fn run(
  command: Command,
  config: &Config,
  sync: &Arc<OfflineSync>,
  worker: &WorkerHandle,
  http_cache: &HttpCache,
  scans: &ScanHistory,
) -> Result<()> {
  match command {
    Command::Status => {
      let status = sync.status();
      println!("online:  {}", status.is_online);
      println!("syncing: {}", status.is_syncing);
      println!("pending: {}", sync.pending_mutations()?.len());
      println!("failed:  {}", sync.failed_mutations()?.len());

      let current = CacheSet::new(config.cache.generation);
      for name in http_cache.cache_names()? {
        let marker = if current.is_current(&name) { "" } else { " (stale)" };
        println!(
          "cache {}: {} responses{}",
          name,
          http_cache.entries(&name)?.len(),
          marker
        );
      }
    }

    Command::Install => {
      let stored = worker.install().await?;
      println!("Precached {} assets", stored);
      if !config.cache.auto_activate {
        println!("Worker is waiting; run any other command to activate it");
      }
    }

    Command::Pending => print_mutations(&sync.pending_mutations()?)?,
    Command::Failed => print_mutations(&sync.failed_mutations()?)?,

    Command::Enqueue {
      resource,
      operation,
      payload,
    } => {
      let mutation = sync.save_offline_data(&resource, parse_json(&payload)?, operation)?;
      println!("Queued mutation #{}", mutation.id);
    }

    Command::Sync { background } => {
      if background {
        worker.background_sync(SYNC_TAG).await?;
        println!("Background sync requested");
        return Ok(());
      }
      match sync.request_sync().await? {
        SyncOutcome::Completed(report) => println!(
          "Synced {}/{} (failed {}, discarded {}, dead-lettered {})",
          report.synced, report.attempted, report.failed, report.discarded, report.dead_lettered
        ),
        SyncOutcome::AlreadyRunning => println!("A sync is already running"),
        SyncOutcome::Offline => println!("Offline; nothing was sent"),
      }
    }

    Command::Get { partition, key } => match sync.get_cached_entity(&partition, &key)? {
      Some(entity) => print_json(&entity)?,
      None => println!("(not cached)"),
    },

    Command::Profile(ProfileCommand::Show { user_id }) => {
      let result = sync.request_profile_read(&user_id).await?;
      println!("source: {}", source_label(result.source));
      match result.data {
        Some(profile) => print_json(&profile)?,
        None => println!("(no profile)"),
      }
    }

    Command::Profile(ProfileCommand::Set { user_id, updates }) => {
      match sync
        .request_profile_write(&user_id, &parse_json(&updates)?)
        .await?
      {
        WriteOutcome::Saved(profile) => {
          println!("Saved");
          print_json(&profile)?;
        }
        WriteOutcome::Queued(mutation) => {
          println!("Offline; queued as mutation #{}", mutation.id)
        }
      }
    }

    Command::Fetch {
      url,
      method,
      navigate,
      body,
    } => {
      let url = Url::parse(&url).map_err(|e| eyre!("Invalid URL {}: {}", url, e))?;
      let mut request = if navigate {
        Request::navigate(url)
      } else {
        Request::new(method, url)
      };
      if let Some(body) = body {
        request = request.with_json(&parse_json(&body)?);
      }

      let response = worker
        .fetch(request)
        .await
        .map_err(|e| eyre!("Fetch failed: {}", e))?;
      println!("HTTP {} ({})", response.status, response.kind.as_str());
      for (name, value) in &response.headers {
        println!("{}: {}", name, value);
      }
      println!();
      println!("{}", response.body_text());
    }

    Command::Locate { lat, lng, history } => {
      let geocoder = ReverseGeocoder::new(Arc::new(worker.clone()), &config.location)?;
      let coords = match (lat, lng) {
        (Some(lat), Some(lng)) => Some(Coords { lat, lng }),
        (None, None) => None,
        _ => return Err(eyre!("Pass both --lat and --lng")),
      };
      let service = LocationService::new(
        Arc::new(FixedGeolocator(coords)),
        geocoder,
        sync.entities().require(LOCATIONS)?.clone(),
        sync.connectivity(),
        &config.location,
      );

      if history {
        print_json(&service.history()?)?;
      } else {
        let result = service.current_location().await?;
        println!("source: {}", source_label(result.source));
        print_json(&result.data)?;
      }
    }

    Command::Scans(command) => match command {
      ScanCommand::List => print_json(&scans.saved_scans()?)?,
      ScanCommand::Add { result } => {
        let scan = scans.save_scan(&result)?;
        println!("Saved scan #{}", scan.id);
      }
      ScanCommand::Mark { id } => {
        scans.mark_as_synced(id)?;
        println!("Scan #{} marked as synced", id);
      }
    },
  }

  Ok(())
}
