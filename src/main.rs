use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use skysync::app::App;
use skysync::config::Config;
use skysync::net::Request;

#[derive(Parser, Debug)]
#[command(name = "skysync")]
#[command(about = "Offline-first sync engine for chart data")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/skysync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log to stderr instead of the rolling log file
  #[arg(long)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show network, queue, storage and notification status
  Status,
  /// Drain the background sync queue
  Sync {
    /// Only this tag (default: every registered tag)
    #[arg(short, long)]
    tag: Option<String>,
    /// Sync dirty charts through their tasks instead of draining by tag
    #[arg(long)]
    charts: bool,
  },
  /// Save a chart from a JSON file
  Save {
    data: PathBuf,
    #[arg(short, long)]
    params: Option<PathBuf>,
  },
  /// Write every chart to a JSON document
  Export {
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Add charts from an exported document
  Import { file: PathBuf },
  /// Resolve a URL through the worker's cache routing
  Fetch { url: String },
  /// Delete unreferenced caches and, optionally, permanently failed tasks
  Prune {
    #[arg(long)]
    failed: bool,
  },
  /// Give a failed sync task a fresh retry budget
  Retry { id: String },
  /// Subscribe a user for push notifications
  Subscribe {
    user: String,
    /// JSON file with notification preferences
    #[arg(short, long)]
    preferences: Option<PathBuf>,
  },
  /// Run until interrupted, syncing whenever the network allows
  Watch {
    #[arg(short, long)]
    user: Option<String>,
  },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let out = serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to encode output: {}", e))?;
  println!("{}", out);
  Ok(())
}

fn read_json(path: &Path) -> Result<Value> {
  let contents = std::fs::read_to_string(path)
    .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?;
  serde_json::from_str(&contents).map_err(|e| eyre!("Invalid JSON in {}: {}", path.display(), e))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = skysync::logging::init(&config.data_dir().join("logs"), args.log_stderr)?;

  let app = App::new(config).await?;

  match args.command {
    Command::Status => print_json(&app.status().await)?,
    Command::Sync { tag, charts } => {
      if charts {
        print_json(&app.facade.sync_charts().await?)?;
      } else {
        let reports = app.sync(tag.as_deref()).await?;
        let summary: Vec<Value> = reports
          .iter()
          .map(|r| {
            json!({
              "tag": r.tag,
              "succeeded": r.succeeded.len(),
              "failed": r.failed.iter().map(|(t, e)| json!({"id": t.id, "error": e})).collect::<Vec<_>>(),
              "skipped": r.skipped,
            })
          })
          .collect();
        print_json(&summary)?;
      }
    }
    Command::Save { data, params } => {
      let data = read_json(&data)?;
      let params = match params {
        Some(p) => read_json(&p)?,
        None => json!({}),
      };
      print_json(&app.facade.save_chart(data, params).await?)?;
    }
    Command::Export { output } => {
      let document = app.facade.export_charts()?;
      match output {
        Some(path) => std::fs::write(&path, document)
          .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
        None => println!("{}", document),
      }
    }
    Command::Import { file } => {
      let contents = std::fs::read_to_string(&file)
        .map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;
      print_json(&app.facade.import_charts(&contents)?)?;
    }
    Command::Fetch { url } => {
      let request = Request::get(&url)?;
      let resp = app
        .worker
        .fetch(&request)
        .await
        .ok_or_else(|| eyre!("No response for {} (offline and not cached)", url))?;
      print_json(&json!({
        "status": resp.status,
        "contentType": resp.header("content-type"),
        "bytes": resp.body.len(),
      }))?;
    }
    Command::Prune { failed } => {
      let activated = app.worker.activate()?;
      let mut removed = 0;
      if failed {
        for task in app.queue.failed()? {
          if app.queue.remove(&task.id)? {
            removed += 1;
          }
        }
      }
      print_json(&json!({ "deletedCaches": activated.deleted, "removedTasks": removed }))?;
    }
    Command::Retry { id } => {
      if !app.queue.retry_failed(&id)? {
        return Err(eyre!("No failed task with id {}", id));
      }
      let tag = app.queue.get(&id)?.map(|t| t.tag);
      let reports = app.sync(tag.as_deref()).await?;
      print_json(&json!({ "id": id, "succeeded": reports.iter().any(|r| !r.succeeded.is_empty()) }))?;
    }
    Command::Subscribe { user, preferences } => {
      let prefs = preferences.as_deref().map(read_json).transpose()?;
      let applied = app.dispatcher.subscribe(&user, prefs.as_ref()).await?;
      print_json(&applied)?;
    }
    Command::Watch { user } => app.watch(user.as_deref()).await?,
  }

  app.cache.settle().await;
  Ok(())
}
