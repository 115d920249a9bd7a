//! coredog: cluster core-dump capture agent and admission webhook.
//!
//! Usage:
//!   coredog watcher    Run the node agent until killed.
//!   coredog webhook    Run the mutating admission webhook server.
//!
//! Configuration comes from the YAML file at `CONFIG_PATH` (default
//! `/etc/config/coredog.yaml`).

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use coredog_agent::{FileWatcher, Pipeline};
use coredog_common::Config;

/// Channel depth between the watcher and the pipeline.
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "coredog")]
#[command(about = "Cluster core-dump capture: node agent and admission webhook")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the node agent: watch for core files and run the capture
    /// pipeline until killed.
    Watcher,
    /// Start the mutating admission webhook server that injects core-dump
    /// volumes into opted-in pods.
    Webhook,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // Load environment variables from .env file (if present).
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: failed to load .env file: {}", e);
        }
    }

    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global tracing subscriber")?;

    let config = Config::load().context("failed to load configuration")?;

    match cli.command {
        Command::Watcher => run_watcher(config).await,
        Command::Webhook => coredog_agent::webhook::run(config).await,
    }
}

/// Wire watcher → pipeline and run until a signal arrives or the watcher
/// subscription fails (which is fatal).
async fn run_watcher(config: Config) -> Result<()> {
    config.validate().context("configuration validation failed")?;

    info!(
        corefile_dir = %config.corefile_dir.display(),
        protocol = %config.storage.protocol,
        "starting coredog agent"
    );

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let watcher = FileWatcher::new(tx).context("failed to create file watcher")?;
    let pipeline = Pipeline::new(config.clone()).context("failed to create pipeline")?;

    let root = config.corefile_dir.clone();
    let watcher_task = tokio::spawn(async move { watcher.watch(&root).await });
    let pipeline_task = tokio::spawn(async move { pipeline.run(rx).await });

    tokio::select! {
        res = watcher_task => {
            // Watcher termination closes the channel; let the pipeline
            // drain whatever it already received.
            let _ = pipeline_task.await;
            res.context("watcher task panicked")?
                .context("file watcher failed")
        }
        _ = wait_for_shutdown() => {
            info!("shutdown requested");
            Ok(())
        }
    }
}

/// Wait for SIGINT or SIGTERM.
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
    Ok(())
}
