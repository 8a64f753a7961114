mod config;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use serde::Serialize;
use treewatch::{Approximation, NotifyBackend, WatchEvent, WatchScope, WatchService, Watcher};

use crate::config::CliConfig;

#[derive(Parser, Debug)]
#[command(name = "treewatch", version, about = "Watch a path and print change events")]
struct Cli {
    /// File or directory to watch (relative paths resolve against the current directory)
    path: PathBuf,
    /// What to watch: `path`, `children` or `descendants`
    #[arg(long, default_value = "descendants")]
    scope: WatchScope,
    /// Overflow recovery: `none`, `all` or `diff` (defaults to the configured policy)
    #[arg(long)]
    overflow: Option<Approximation>,
    /// TOML config file with `[watch]` and `[logging]` sections
    #[arg(long)]
    config: Option<PathBuf>,
    /// Print one JSON object per event
    #[arg(long)]
    json: bool,
    /// Log level or `EnvFilter` directives; overrides the config file
    #[arg(long)]
    log_level: Option<String>,
    /// Stop after this many seconds instead of running until interrupted
    #[arg(long)]
    duration_secs: Option<u64>,
}

#[derive(Serialize, Debug, PartialEq, Eq)]
struct EventRecord {
    kind: &'static str,
    root: String,
    path: String,
    full_path: String,
}

impl From<&WatchEvent> for EventRecord {
    fn from(event: &WatchEvent) -> Self {
        Self {
            kind: event.kind().as_str(),
            root: event.root().display().to_string(),
            path: event.relative().display().to_string(),
            full_path: event.full_path().display().to_string(),
        }
    }
}

fn format_event(event: &WatchEvent, json: bool) -> Result<String> {
    if json {
        Ok(serde_json::to_string(&EventRecord::from(event))?)
    } else {
        Ok(format!("{:<8} {}", event.kind(), event.full_path().display()))
    }
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            2
        }
    };

    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = match &cli.config {
        Some(path) => CliConfig::load_from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CliConfig::default(),
    };
    config.watch = config.watch.with_env_overrides()?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    logging::init_tracing(&config.logging);

    let path = if cli.path.is_absolute() {
        cli.path
    } else {
        std::env::current_dir()
            .context("resolving the current directory")?
            .join(cli.path)
    };

    let backend = NotifyBackend::with_settings(&config.watch).context("starting the notify backend")?;
    let service = WatchService::new(Arc::new(backend), config.watch.clone())?;
    let approximation = cli.overflow.unwrap_or(config.watch.default_overflow);

    let (tx, rx) = crossbeam_channel::unbounded::<WatchEvent>();
    let watch = Watcher::watch(&path, cli.scope)?
        .on(move |event| {
            // The receiver only goes away on shutdown.
            let _ = tx.send(event.clone());
        })?
        .on_overflow(approximation)
        .with_service(service)
        .start()
        .with_context(|| format!("watching {}", path.display()))?;

    tracing::info!(
        target: "treewatch.cli",
        path = %path.display(),
        scope = %cli.scope,
        overflow = %approximation,
        native_recursive = watch.is_native_recursive(),
        "watching"
    );

    let deadline = cli
        .duration_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    loop {
        let received = match deadline {
            Some(deadline) => rx.recv_deadline(deadline),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(event) => println!("{}", format_event(&event, cli.json)?),
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    watch.close()?;
    Ok(0)
}
