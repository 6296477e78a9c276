mod cache;
mod config;
mod logging;
mod net;
mod tasks;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use cache::{
  CachePolicy, CacheSource, NoopStorage, Request, ResourceStore, ResponseKind, SqliteStorage,
};
use config::Config;
use net::{Fetcher, HttpFetcher, OfflineFetcher};
use worker::{Registration, UpdateReport, WorkerContext};

#[derive(Parser, Debug)]
#[command(name = "innerorder")]
#[command(about = "Offline cache for the InnerOrder planner")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/innerorder/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install and activate the configured generation
  Install,
  /// Request a URL through the offline cache and write the body to stdout
  Fetch {
    url: String,
    /// Request method; anything but GET bypasses the cache
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Simulate having no network connection
    #[arg(long)]
    offline: bool,
    /// Treat the request as a top-level document
    #[arg(long)]
    document: bool,
  },
  /// List cached generations
  Generations,
  /// List entries stored under a generation (default: configured one)
  Entries { generation: Option<String> },
  /// Task snapshot files
  #[command(subcommand)]
  Tasks(TasksCommand),
}

#[derive(Subcommand, Debug)]
enum TasksCommand {
  /// Validate a backup file and summarize it
  Check { file: PathBuf },
  /// Re-export a backup file under today's backup name
  Export {
    file: PathBuf,
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
  },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = logging::init();

  let args = Args::parse();
  let load = || -> Result<(Config, Arc<dyn ResourceStore>)> {
    let config = Config::load(args.config.as_deref())?;
    let store = open_store(&config);
    Ok((config, store))
  };

  match args.command {
    Command::Install => {
      let (config, store) = load()?;
      install(&config, store).await
    }
    Command::Fetch {
      ref url,
      ref method,
      offline,
      document,
    } => {
      let (config, store) = load()?;
      let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let mut request = Request::get(url)?.with_method(method);
      if document {
        request = request.as_document();
      }
      if offline {
        fetch(&config, store, OfflineFetcher, request).await
      } else {
        let network = HttpFetcher::new(policy(&config))?;
        fetch(&config, store, network, request).await
      }
    }
    Command::Generations => {
      let (config, store) = load()?;
      list_generations(&config, store.as_ref())
    }
    Command::Entries { ref generation } => {
      let (config, store) = load()?;
      let generation = generation
        .as_deref()
        .map(cache::Generation::new)
        .unwrap_or_else(|| config.generation());
      list_entries(&generation, store.as_ref())
    }
    Command::Tasks(ref command) => run_tasks(command),
  }
}

fn policy(config: &Config) -> CachePolicy {
  CachePolicy::new(&config.base_url, &config.trusted_hosts)
}

/// Open the cache database, degrading to network-only if it is unusable.
fn open_store(config: &Config) -> Arc<dyn ResourceStore> {
  let opened = match &config.database {
    Some(path) => SqliteStorage::open_at(path),
    None => SqliteStorage::open(),
  };

  match opened {
    Ok(storage) => Arc::new(storage),
    Err(e) => {
      warn!(error = %e, "cache store unavailable, running network-only");
      eprintln!("warning: {} (running without offline cache)", e);
      Arc::new(NoopStorage)
    }
  }
}

/// Build a registration and put the newest activated generation in control.
///
/// Returns whether the configured generation still has to be installed.
fn prepare<N: Fetcher>(
  config: &Config,
  store: Arc<dyn ResourceStore>,
  network: N,
) -> Result<(Registration<N>, bool)> {
  let context = WorkerContext {
    store,
    network: Arc::new(network),
    policy: policy(config),
    offline_fallback: config.offline_fallback_url()?,
  };
  let registration = Registration::new(context);
  let active = registration.restore(&config.generation())?;

  Ok((registration, !active))
}

async fn install(config: &Config, store: Arc<dyn ResourceStore>) -> Result<()> {
  let network = HttpFetcher::new(policy(config))?;
  let (registration, pending) = prepare(config, store, network)?;

  if !pending {
    println!("Generation {} is already active", config.generation());
    return Ok(());
  }

  let manifest = config.manifest()?;
  if manifest.is_empty() {
    warn!("manifest is empty, nothing will be available offline");
  }

  match registration.update(config.generation(), &manifest).await? {
    UpdateReport::AlreadyActive(generation) => {
      println!("Generation {} is already active", generation);
    }
    UpdateReport::Activated { install, purge } => {
      println!(
        "Activated {}: {}/{} resources cached",
        install.generation,
        install.stored(),
        install.outcomes.len()
      );
      for (url, reason) in install.failures() {
        println!("  missed {} ({})", url, reason);
      }
      for generation in &purge.deleted {
        println!("  purged {}", generation);
      }
      for generation in &purge.failed {
        println!("  could not purge {}", generation);
      }
    }
  }

  Ok(())
}

async fn fetch<N: Fetcher>(
  config: &Config,
  store: Arc<dyn ResourceStore>,
  network: N,
  request: Request,
) -> Result<()> {
  let (registration, pending) = prepare(config, store, network)?;

  // Install on first load after a bump; on failure the previous generation
  // (if any) keeps serving and install is retried next time
  if pending {
    if let Err(e) = registration
      .update(config.generation(), &config.manifest()?)
      .await
    {
      warn!(error = %e, "install failed");
      eprintln!("warning: {}", e);
    }
  }

  let result = registration.handle(&request).await;
  registration.settle().await;
  let result = result?;

  if result.source == CacheSource::Fallback {
    warn!(url = %request.url, "offline, served fallback page");
  }

  eprintln!(
    "{} {} {} ({})",
    result.data.status,
    result.data.header("content-type").unwrap_or("-"),
    result.data.url,
    result.source
  );
  std::io::stdout()
    .write_all(&result.data.body)
    .map_err(|e| eyre!("Failed to write response body: {}", e))?;

  Ok(())
}

fn list_generations(config: &Config, store: &dyn ResourceStore) -> Result<()> {
  let current = config.generation();

  for generation in store.list_generations()? {
    let marker = if generation == current { "*" } else { " " };
    let count = store.entries(&generation)?.len();
    println!("{} {} ({} entries)", marker, generation, count);
  }

  Ok(())
}

fn list_entries(generation: &cache::Generation, store: &dyn ResourceStore) -> Result<()> {
  let entries = store.entries(generation)?;
  let opaque = entries
    .iter()
    .filter(|e| e.kind == ResponseKind::Opaque)
    .count();

  for entry in entries {
    println!(
      "{} {} {} {} {}B {}",
      entry.stored_at.format("%Y-%m-%d %H:%M:%S"),
      entry.method,
      entry.status,
      entry.kind.as_str(),
      entry.size,
      entry.url
    );
  }

  if opaque > 0 {
    println!("{} opaque entries (relayed without inspection)", opaque);
  }

  Ok(())
}

fn run_tasks(command: &TasksCommand) -> Result<()> {
  match command {
    TasksCommand::Check { file } => {
      let tasks = tasks::import_tasks(file)?;
      let done = tasks.iter().filter(|t| t.completed).count();
      println!(
        "{}: {} tasks ({} completed)",
        file.display(),
        tasks.len(),
        done
      );
    }
    TasksCommand::Export { file, out_dir } => {
      let tasks = tasks::import_tasks(file)?;
      let today = tasks::backup_date(chrono::Utc::now());
      let path = tasks::export_tasks(&tasks, out_dir, today)?;
      println!("Exported {} tasks to {}", tasks.len(), path.display());
    }
  }

  Ok(())
}
