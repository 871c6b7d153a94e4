use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use dwatch_directory_watcher::{
    ChangeMask, DeliveryMode, DirectoryChangeHandler, DirectoryChangeWatcher, Handler,
    MonitorPrivileges, WatchOptions, WatcherConfig,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Print changes in one or more directories until interrupted.
#[derive(Parser, Debug)]
#[command(name = "dwatch", version, about, long_about = None)]
struct Cli {
    /// Directories to watch
    #[arg(required = true)]
    directories: Vec<PathBuf>,

    /// Watch subdirectories too
    #[arg(short, long)]
    subtree: bool,

    /// Only report paths matching these patterns, separated by `;`
    #[arg(short, long, default_value = "")]
    include: String,

    /// Never report paths matching these patterns, separated by `;`
    #[arg(short, long, default_value = "")]
    exclude: String,

    /// Kinds of change to report, e.g. `name,dir-name,last-write`
    #[arg(short, long, default_value = "all")]
    mask: ChangeMask,

    /// Run callbacks on the main thread instead of the dispatch thread
    #[arg(long)]
    creator_thread: bool,

    /// JSON watcher configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Writes each change to stdout with a timestamp.
struct PrintHandler;

impl PrintHandler {
    fn print(&self, what: &str, detail: String) {
        println!("{} {what:<9} {detail}", Local::now().format("%H:%M:%S%.3f"));
    }
}

impl DirectoryChangeHandler for PrintHandler {
    fn on_file_added(&self, path: &Path) {
        self.print("added", path.display().to_string());
    }

    fn on_file_removed(&self, path: &Path) {
        self.print("removed", path.display().to_string());
    }

    fn on_file_modified(&self, path: &Path) {
        self.print("modified", path.display().to_string());
    }

    fn on_file_name_changed(&self, old_path: &Path, new_path: &Path) {
        self.print(
            "renamed",
            format!("{} -> {}", old_path.display(), new_path.display()),
        );
    }

    fn on_read_directory_changes_error(&self, err: &io::Error, directory: &Path) {
        warn!("Stopped watching {}: {err}", directory.display());
    }

    fn on_watch_stopped(&self, directory: &Path) {
        info!("No longer watching {}", directory.display());
    }
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let mut config = match &cli.config {
        Some(path) => WatcherConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => WatcherConfig::default(),
    };
    if cli.creator_thread {
        config = config.with_delivery(DeliveryMode::CreatorThread);
    }

    let watcher = DirectoryChangeWatcher::new(config, MonitorPrivileges::ensure())?;
    let handler = Handler::new(PrintHandler);

    for directory in &cli.directories {
        let mut options = WatchOptions::new()
            .include(cli.include.as_str())
            .exclude(cli.exclude.as_str());
        if cli.subtree {
            options = options.subtree();
        }
        watcher
            .watch_directory(directory, cli.mask, &handler, options)
            .with_context(|| format!("Failed to watch {}", directory.display()))?;
    }
    info!(
        "Watching {} directories, press Ctrl-C to stop",
        watcher.num_watched_directories()
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut pump = watcher.take_notification_pump();
    match pump.as_mut() {
        Some(pump) => loop {
            tokio::select! {
                _ = &mut ctrl_c => break,
                more = pump.dispatch_next() => {
                    if !more {
                        break;
                    }
                }
            }
        },
        None => {
            ctrl_c.await.context("Failed to listen for Ctrl-C")?;
        }
    }

    info!("Shutting down");
    if !watcher.unwatch_all_directories() {
        warn!("Dispatch thread did not shut down cleanly");
    }
    // Stop notifications posted during the unwatch still run here.
    if let Some(pump) = pump.as_mut() {
        pump.dispatch_pending();
    }
    Ok(())
}
