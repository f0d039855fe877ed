mod app;
mod cache;
mod config;
mod db;
mod event;
mod logging;
mod net;
mod queue;
mod server;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

use crate::queue::{FormField, FormSubmission, SubmitOutcome, CSRF_FIELD};

#[derive(Parser, Debug)]
#[command(name = "pos-offline")]
#[command(about = "Offline action queue and caching proxy for the POS web app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/pos-offline/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the caching proxy and replay queued actions when connectivity returns
  Serve,

  /// Submit a form; queued for later when the origin is unreachable
  Capture(CaptureArgs),

  /// Replay queued actions now
  Drain,

  /// Inspect or clear the offline queue
  Queue {
    #[command(subcommand)]
    action: QueueAction,
  },

  /// Show queue length and cache generations
  Status,
}

#[derive(clap::Args, Debug)]
struct CaptureArgs {
  /// Form `action` attribute (defaults to --page)
  #[arg(long)]
  action: Option<String>,

  /// Form `method` attribute (defaults to POST)
  #[arg(long)]
  method: Option<String>,

  /// `data-offline-type` tag, e.g. "sale"
  #[arg(long = "type")]
  kind: Option<String>,

  /// Anti-forgery token
  #[arg(long)]
  csrf_token: Option<String>,

  /// Form field as name=value (repeatable, order kept)
  #[arg(long = "field", value_parser = parse_pair)]
  fields: Vec<(String, String)>,

  /// File field as name=filename (never queued)
  #[arg(long = "file", value_parser = parse_pair)]
  files: Vec<(String, String)>,

  /// Path of the page the form lives on
  #[arg(long, default_value = "/")]
  page: String,

  /// Treat the origin as unreachable instead of probing it
  #[arg(long)]
  offline: bool,
}

impl CaptureArgs {
  fn into_form(self) -> FormSubmission {
    let mut fields = Vec::new();
    if let Some(token) = self.csrf_token {
      fields.push(FormField::text(CSRF_FIELD, token));
    }
    fields.extend(self.fields.into_iter().map(|(k, v)| FormField::text(k, v)));
    fields.extend(self.files.into_iter().map(|(k, v)| FormField::file(k, v)));

    FormSubmission {
      action: self.action,
      method: self.method,
      offline: Some("true".to_string()),
      offline_type: self.kind,
      fields,
    }
  }
}

#[derive(Subcommand, Debug)]
enum QueueAction {
  /// Print pending actions as JSON
  List {
    /// Show dead-lettered actions instead
    #[arg(long)]
    dead: bool,
  },
  /// Drop every pending action
  Clear,
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
  let (name, value) = s
    .split_once('=')
    .ok_or_else(|| format!("expected name=value, got '{}'", s))?;
  Ok((name.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log_dir()?)?;

  match args.command {
    Command::Serve => {
      let app = app::App::new(config, false)?;
      app.serve().await?;
    }
    Command::Capture(capture) => {
      let app = app::App::new(config, capture.offline)?;
      let page = capture.page.clone();
      match app.capture(&capture.into_form(), &page).await? {
        SubmitOutcome::Queued(action) => println!("{}", serde_json::to_string_pretty(&action)?),
        SubmitOutcome::Submitted => {
          println!("Online: submit the form normally; nothing was queued.")
        }
        SubmitOutcome::NotOfflineCapable => println!("Form is not offline-capable."),
      }
    }
    Command::Drain => {
      let app = app::App::new(config, false)?;
      let report = app.drain().await?;
      match report.skipped {
        Some(reason) => println!("Nothing drained ({:?})", reason),
        None => println!(
          "Synced {} of {}; {} retained, {} dead-lettered, {} arrived meanwhile",
          report.synced,
          report.attempted,
          report.retained,
          report.dead_lettered,
          report.arrived_during_drain
        ),
      }
    }
    Command::Queue { action } => {
      let app = app::App::new(config, true)?;
      match action {
        QueueAction::List { dead } => {
          let actions = if dead {
            app.dead_lettered()?
          } else {
            app.pending()?
          };
          println!("{}", serde_json::to_string_pretty(&actions)?);
        }
        QueueAction::Clear => {
          app.clear_queue();
          match app.pending()?.len() {
            0 => println!("Offline queue cleared."),
            n => println!("Offline queue not cleared; {} actions still pending.", n),
          }
        }
      }
    }
    Command::Status => {
      let app = app::App::new(config, true)?;
      let status = app.status()?;
      println!("pending actions:  {}", status.pending);
      println!("dead-lettered:    {}", status.dead_lettered);
      for (name, entries) in status.generations {
        println!("cache generation: {} ({} entries)", name, entries);
      }
    }
  }

  Ok(())
}
