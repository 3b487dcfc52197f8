#![forbid(unsafe_code)]

//! `pipe-relay` — broadcast relay server binary.
//!
//! Loads configuration, binds the well-known pipe, runs the relay until a
//! shutdown signal arrives, and reports joins, leaves and chat lines.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use pipe_relay::channel::LocalSocketFacility;
use pipe_relay::relay::{spawn_relay_server, RelayEvent, RelayState};
use pipe_relay::{AppError, RelayConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum EventFormat {
    /// Report events through the log.
    Text,
    /// Print one JSON object per event on stdout.
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "pipe-relay", about = "Named-pipe broadcast relay", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file; built-in defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the well-known pipe name.
    #[arg(long)]
    pipe_name: Option<String>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// How relay events are reported.
    #[arg(long, value_enum, default_value_t = EventFormat::Text)]
    events: EventFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("pipe-relay bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match args.config {
        Some(ref path) => RelayConfig::load_from_path(path)?,
        None => RelayConfig::default(),
    };
    if let Some(name) = args.pipe_name {
        config.server_pipe = name;
        config.validate()?;
    }
    let config = Arc::new(config);
    info!(pipe = %config.server_pipe, "configuration loaded");

    // ── Start relay ─────────────────────────────────────
    let ct = CancellationToken::new();
    let state = Arc::new(RelayState::new(
        Arc::clone(&config),
        Arc::new(LocalSocketFacility::new()),
        &ct,
    )?);

    let display_handle = tokio::spawn(report_events(state.subscribe(), args.events, ct.clone()));
    let server = spawn_relay_server(Arc::clone(&state), ct.clone())?;
    info!("relay ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");

    let drained = server.shutdown().await;
    let _ = display_handle.await;
    info!(drained, "pipe-relay shut down");

    Ok(())
}

/// Stand-in for a user interface: tracks who is online and reports traffic.
async fn report_events(
    mut events: broadcast::Receiver<RelayEvent>,
    format: EventFormat,
    ct: CancellationToken,
) {
    let mut online = BTreeSet::new();

    loop {
        let event = tokio::select! {
            () = ct.cancelled() => break,
            event = events.recv() => event,
        };

        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event reporter fell behind");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match &event {
            RelayEvent::Join { identifier, .. } => {
                online.insert(identifier.clone());
            }
            RelayEvent::Leave { identifier, .. } | RelayEvent::Evicted { identifier, .. } => {
                online.remove(identifier);
            }
            RelayEvent::Message { .. } => {}
        }

        match format {
            EventFormat::Json => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!(%err, "failed to serialise event"),
            },
            EventFormat::Text => match &event {
                RelayEvent::Message { text, .. } => info!(online = online.len(), "{text}"),
                other => info!(online = ?online, event = ?other, "membership changed"),
            },
        }
    }
}

/// Resolve on Ctrl-C, or on SIGTERM where the platform has it.
async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(%err, "SIGTERM unavailable; only ctrl-c stops the relay");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(%err, "ctrl-c handler failed");
            }
        }
        () = terminate => {}
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter);
    let installed = match log_format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|err| AppError::Config(format!("tracing subscriber: {err}")))
}
