//! # cnat - run a command at a given time
//!
//! ## Commands
//!
//! - `run` - reconcile the tasks of a manifest, executing units as local
//!   processes, until interrupted (or until every task is DONE)
//! - `schedule` - print how long until a timestamp elapses
//! - `render` - print the execution units a manifest would create
//!
//! ## Configuration
//!
//! Controller settings come from an optional TOML file, then from
//! `CNAT_WORKERS`, `CNAT_IMAGE` and `CNAT_RESYNC_SECS`. Log verbosity follows
//! `RUST_LOG` (default `info`).

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use cnat::cli::{Cli, Commands};
use cnat::{RunnerConfig, SessionOptions, load_manifest, run_session, summarize};
use cnat_reconciler::{ControllerConfig, SystemClock, build_unit, time_until_schedule};
use itertools::Itertools;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            manifest,
            config,
            exit_when_done,
            max_restarts,
        } => run(&manifest, config.as_deref(), exit_when_done, max_restarts).await,
        Commands::Schedule { timestamp } => schedule(&timestamp),
        Commands::Render { manifest, config } => render(&manifest, config.as_deref()),
    }
}

/// Initialize tracing with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Load controller configuration: file (if any), then environment.
fn load_config(path: Option<&Path>) -> Result<ControllerConfig> {
    let config = match path {
        Some(path) => ControllerConfig::from_file(path)
            .with_context(|| format!("Failed to load config '{}'", path.display()))?,
        None => ControllerConfig::default(),
    }
    .with_env_overrides();
    config.validate()?;
    Ok(config)
}

async fn run(
    manifest: &Path,
    config: Option<&Path>,
    exit_when_done: bool,
    max_restarts: u32,
) -> Result<()> {
    let tasks = load_manifest(manifest)?;
    let options = SessionOptions {
        controller: load_config(config)?,
        runner: RunnerConfig { max_restarts },
        exit_when_done,
    };
    info!(tasks = tasks.len(), manifest = %manifest.display(), "cnat starting");

    let finished = run_session(tasks, options, async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    })
    .await?;

    println!("{}", summarize(&finished));
    Ok(())
}

fn schedule(timestamp: &str) -> Result<()> {
    let remaining = time_until_schedule(timestamp, &SystemClock)?;
    if remaining > chrono::Duration::zero() {
        println!("due in {}s", remaining.num_seconds());
    } else {
        println!("elapsed {}s ago", remaining.num_seconds().unsigned_abs());
    }
    Ok(())
}

fn render(manifest: &Path, config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    let units = load_manifest(manifest)?
        .iter()
        .map(|task| build_unit(task, &config.unit))
        .collect_vec();
    let yaml = serde_yaml::to_string(&units).context("Failed to render units")?;
    print!("{yaml}");
    Ok(())
}
