mod app;
mod cache;
mod commands;
mod config;
mod db;
mod directory;
mod event;
mod logging;
mod net;
mod sync;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "restocache")]
#[command(about = "An offline-capable client for the restaurant reviews API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/restocache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Write logs to a daily rolling file in this directory instead of stderr
  #[arg(long, global = true)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Keep the guard alive so file logs are flushed on exit
  let _log_guard = logging::init(args.log_dir.as_deref())?;
  info!(api = %config.api_url, "restocache starting");

  let mut app = app::App::new(config)?;
  let mut stdout = std::io::stdout().lock();
  app.execute(args.command, &mut stdout).await?;

  Ok(())
}
