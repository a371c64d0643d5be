mod cache;
mod config;
mod db;
mod network;
mod queue;
mod worker;

#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use cache::{Request, SqliteStorage};
use network::HttpClient;
use queue::SqliteSubmissionStore;
use worker::{Event, Message, Outcome, ServiceWorker, SubmitOutcome};

#[derive(Parser, Debug)]
#[command(name = "swcache")]
#[command(about = "Offline caching layer for a landing page")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/swcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Increase log verbosity (-v info, -vv debug)
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-populate the static partition with the app shell
  Install,
  /// Delete partitions from previous versions
  Activate,
  /// Fetch a URL through the caching layer
  Fetch {
    /// Absolute URL or path relative to the configured origin
    url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Submit a form payload (JSON), queueing it if offline
  Submit { payload: String },
  /// Replay queued submissions
  Sync {
    /// Background sync tag (default: the configured one)
    #[arg(long)]
    tag: Option<String>,
  },
  /// Show partitions and pending submissions
  Status,
  /// Delete every cache partition this application owns
  Clear,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.verbose, args.log_file.as_deref())?;

  let config = config::Config::load(args.config.as_deref())?;

  let db_path = config.data_dir()?.join(db::DB_FILE);
  let storage = Arc::new(SqliteStorage::open_at(&db_path)?);
  let submissions = Arc::new(SqliteSubmissionStore::open_at(&db_path)?);
  let network = Arc::new(HttpClient::new()?);
  let worker = ServiceWorker::new(&config, storage, submissions, network)?;

  match args.command {
    Command::Install => {
      worker.dispatch(Event::Install).await?;
      println!("Installed {}", worker_version(&config));
    }
    Command::Activate => {
      worker.dispatch(Event::Activate).await?;
      println!("Activated {}", worker_version(&config));
    }
    Command::Fetch {
      url,
      navigate,
      output,
    } => {
      let url = config.resolve(&url)?;
      let request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      };

      if let Outcome::Response(result) = worker.dispatch(Event::Fetch(request)).await? {
        eprintln!("{} ({})", result.data.status, result.source);
        match output {
          Some(path) => std::fs::write(&path, &result.data.body)
            .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
          None => std::io::stdout().write_all(&result.data.body)?,
        }
      }
    }
    Command::Submit { payload } => {
      let payload: serde_json::Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
      match worker.submit(&payload).await? {
        SubmitOutcome::Sent => println!("Submitted"),
        SubmitOutcome::Queued(id) => println!("Offline: queued as #{}", id),
      }
    }
    Command::Sync { tag } => {
      let tag = tag.unwrap_or_else(|| config.sync.tag.clone());
      match worker.dispatch(Event::Sync { tag }).await? {
        Outcome::Drained(report) => println!(
          "Replayed {} of {}, {} still pending",
          report.replayed.len(),
          report.attempted(),
          report.failed.len()
        ),
        _ => println!("Nothing to do for this tag"),
      }
    }
    Command::Status => {
      let status = worker.status()?;
      for (name, count) in &status.partitions {
        println!("{:<32} {:>6} entries", name, count);
      }
      match status.oldest_pending {
        Some(oldest) => println!(
          "pending submissions: {} (oldest from {})",
          status.pending_submissions,
          oldest.to_rfc3339()
        ),
        None => println!("pending submissions: 0"),
      }
    }
    Command::Clear => {
      if let Outcome::Cleared(deleted) = worker.dispatch(Event::Message(Message::ClearCache)).await? {
        for name in deleted {
          println!("deleted {}", name);
        }
      }
    }
  }

  worker.shutdown().await;
  Ok(())
}

fn worker_version(config: &config::Config) -> String {
  format!("{}-{}", config.cache.prefix, config.cache.version)
}

/// Log to stderr, or to a file when requested. `RUST_LOG` overrides `-v`.
fn init_tracing(verbose: u8, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
    0 => EnvFilter::new("swcache=warn"),
    1 => EnvFilter::new("swcache=info"),
    _ => EnvFilter::new("swcache=debug"),
  });

  match log_file {
    Some(path) => {
      let dir = path.parent().unwrap_or_else(|| Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      let appender = tracing_appender::rolling::never(dir, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);

      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
      Ok(None)
    }
  }
}
