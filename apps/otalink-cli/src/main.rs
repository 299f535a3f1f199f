//! # otalink
//!
//! Command-line console for an embedded device on the local network.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            otalink CLI                                  │
//! │                                                                         │
//! │  config (TOML + env + flags) ───► LinkManager ───► events ───► stdout  │
//! │                                       ▲                                 │
//! │                                       │ RSSI                            │
//! │                                  StatusPoller                           │
//! │                                                                         │
//! │  upload: resolved(failed) ─► exit 1                                    │
//! │          device_ready     ─► exit 0 (or keep watching)                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod render;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use otalink_core::{LinkEvent, UploadTarget};
use otalink_sync::{
    HttpUploader, LinkConfig, LinkError, LinkHandle, LinkManager, ManagerSettings, StatusPoller,
    WsConnector,
};

use crate::render::{render, Format};

#[derive(Debug, Parser)]
#[command(name = "otalink")]
#[command(about = "Device link console: live logs, OTA uploads and reboot tracking")]
struct Cli {
    /// Config file (defaults to the platform config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Device host, overriding the config file.
    #[arg(long, global = true)]
    host: Option<String>,

    /// Print one JSON object per event.
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging.
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Do not poll the device status endpoint.
    #[arg(long, global = true)]
    no_status_poll: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Stream device events until interrupted.
    Watch,
    /// Upload an image and follow the device through its reboot.
    Upload(UploadArgs),
}

#[derive(Debug, Args)]
struct UploadArgs {
    /// `firmware` or `filesystem`.
    target: UploadTarget,

    /// Image file.
    file: PathBuf,

    /// Keep streaming after the device is ready.
    #[arg(long)]
    keep_watching: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "otalink failed");
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = LinkConfig::load(cli.config.clone()).context("failed to load link config")?;
    if let Some(host) = &cli.host {
        config.device.host = host.clone();
        config.validate()?;
    }
    info!(host = %config.device.host, tls = config.device.use_tls, "Configuration loaded");

    // Read the image first so a bad path fails before anything connects.
    let upload = match &cli.command {
        Commands::Upload(args) => Some((args.target, read_image(&args.file).await?)),
        Commands::Watch => None,
    };

    let (handle, mut events, task) = LinkManager::spawn(
        Arc::new(WsConnector::from_config(&config)?),
        Arc::new(HttpUploader::from_config(&config)?),
        ManagerSettings::from_config(&config)?,
    );

    if config.status.enabled && !cli.no_status_poll {
        let poller = StatusPoller::from_config(&config, handle.clone())?;
        tokio::spawn(poller.run());
    }

    let mode = match &cli.command {
        Commands::Watch => Mode::Watch,
        Commands::Upload(args) => Mode::Upload {
            keep_watching: args.keep_watching,
        },
    };

    if let Some((target, (file_name, bytes))) = upload {
        info!(%target, %file_name, size = bytes.len(), "Starting upload");
        handle.upload(target, file_name, bytes).await?;
    }

    let format = if cli.json {
        Format::JsonLines
    } else {
        Format::Human
    };
    let code = follow(&mut events, mode, format).await;

    shutdown(&handle).await;
    if let Err(e) = task.await {
        warn!(error = %e, "Link manager task failed");
    }
    Ok(code)
}

async fn read_image(path: &Path) -> Result<(String, Vec<u8>)> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| LinkError::ReadPayload(format!("{}: {}", path.display(), e)))?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image.bin".to_string());
    Ok((file_name, bytes))
}

// =============================================================================
// Event Loop
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Watch,
    Upload { keep_watching: bool },
}

/// What the loop does after printing an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Continue,
    /// Process exit status.
    Exit(u8),
}

fn next_step(event: &LinkEvent, mode: Mode) -> Next {
    let Mode::Upload { keep_watching } = mode else {
        return Next::Continue;
    };

    match event {
        LinkEvent::UploadResolved { outcome, .. } if !outcome.is_success() => {
            Next::Exit(1)
        }
        LinkEvent::DeviceReady { .. } if !keep_watching => Next::Exit(0),
        _ => Next::Continue,
    }
}

async fn follow(
    events: &mut mpsc::UnboundedReceiver<LinkEvent>,
    mode: Mode,
    format: Format,
) -> ExitCode {
    let signal = shutdown_signal();
    tokio::pin!(signal);

    loop {
        let event = tokio::select! {
            _ = &mut signal => return ExitCode::SUCCESS,
            event = events.recv() => event,
        };

        let Some(event) = event else {
            debug!("Event stream closed");
            return ExitCode::FAILURE;
        };

        match render(&event, format) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "Failed to render event"),
        }

        if let Next::Exit(code) = next_step(&event, mode) {
            return ExitCode::from(code);
        }
    }
}

async fn shutdown(handle: &LinkHandle) {
    if let Err(e) = handle.shutdown().await {
        debug!(error = %e, "Link manager already stopped");
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
