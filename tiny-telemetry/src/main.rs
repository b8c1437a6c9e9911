//! Entry point for `tiny-telemetry`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client** mode.
//! All actual protocol work is delegated to library modules; `main.rs` owns only
//! process setup (logging, signal handling, argument parsing, config loading).

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use tiny_telemetry::client::SensorClient;
use tiny_telemetry::config::TelemetryConfig;
use tiny_telemetry::server::{cancel_on_signal, Server, Sinks};

/// UDP sensor telemetry ingestion.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// TOML configuration file; flags below override its values.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run the ingestion server.
    Server {
        /// Local address to bind (e.g. 0.0.0.0:5555).
        #[arg(short, long)]
        bind: Option<SocketAddr>,
        /// Seconds without a heartbeat before a device is offline.
        #[arg(long)]
        heartbeat_timeout: Option<u64>,
        /// Reorder flush period in milliseconds.
        #[arg(long)]
        flush_interval_ms: Option<u64>,
        /// Metrics dump period in milliseconds.
        #[arg(long)]
        metrics_interval_ms: Option<u64>,
        /// Recent sequence numbers remembered per device.
        #[arg(long)]
        window: Option<usize>,
        /// Per-packet tasks allowed in flight.
        #[arg(long)]
        max_in_flight: Option<usize>,
        #[arg(long)]
        log_path: Option<PathBuf>,
        #[arg(long)]
        ordered_path: Option<PathBuf>,
        #[arg(long)]
        metrics_path: Option<PathBuf>,
    },
    /// Run a sensor client against a server.
    Client {
        /// Remote server address (e.g. 127.0.0.1:5555).
        #[arg(short, long)]
        server: Option<SocketAddr>,
        /// Device id; random in 1000..=9999 when omitted.
        #[arg(short, long)]
        device_id: Option<u16>,
        /// DATA period in milliseconds.
        #[arg(long)]
        interval_ms: Option<u64>,
        /// HEARTBEAT period in milliseconds.
        #[arg(long)]
        heartbeat_ms: Option<u64>,
        /// Readings per DATA packet.
        #[arg(long)]
        batch: Option<usize>,
        /// Stop after this many seconds.
        #[arg(long)]
        duration: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => TelemetryConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TelemetryConfig::default(),
    };

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone()).context("installing signal handlers")?;

    match cli.mode {
        Mode::Server {
            bind,
            heartbeat_timeout,
            flush_interval_ms,
            metrics_interval_ms,
            window,
            max_in_flight,
            log_path,
            ordered_path,
            metrics_path,
        } => {
            let cfg = &mut config.server;
            if let Some(v) = bind {
                cfg.bind = v;
            }
            if let Some(v) = heartbeat_timeout {
                cfg.heartbeat_timeout_secs = v;
            }
            if let Some(v) = flush_interval_ms {
                cfg.flush_interval_ms = v;
            }
            if metrics_interval_ms.is_some() {
                cfg.metrics_interval_ms = metrics_interval_ms;
            }
            if let Some(v) = window {
                cfg.window_capacity = v;
            }
            if let Some(v) = max_in_flight {
                cfg.max_in_flight = v;
            }
            if let Some(v) = log_path {
                cfg.log_path = v;
            }
            if let Some(v) = ordered_path {
                cfg.ordered_path = v;
            }
            if let Some(v) = metrics_path {
                cfg.metrics_path = v;
            }

            let server_cfg = config.server;
            let bind_addr = server_cfg.bind;
            let sinks = Sinks::from_config(&server_cfg).context("opening output files")?;
            let server = Server::bind(server_cfg, sinks)
                .await
                .with_context(|| format!("starting server on {bind_addr}"))?;

            let token = server.shutdown_token();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                token.cancel();
            });

            let report = server.run().await;
            log::info!(
                "Server stopped: {} packets, {} flushed at exit, {} abandoned",
                report.metrics.packets_received,
                report.flushed,
                report.abandoned
            );
        }
        Mode::Client {
            server,
            device_id,
            interval_ms,
            heartbeat_ms,
            batch,
            duration,
        } => {
            let cfg = &mut config.client;
            if let Some(v) = server {
                cfg.server = v;
            }
            if device_id.is_some() {
                cfg.device_id = device_id;
            }
            if let Some(v) = interval_ms {
                cfg.reporting_interval_ms = v;
            }
            if let Some(v) = heartbeat_ms {
                cfg.heartbeat_interval_ms = v;
            }
            if let Some(v) = batch {
                cfg.batch_size = v;
            }
            if duration.is_some() {
                cfg.duration_secs = duration;
            }

            let client = SensorClient::connect(&config.client)
                .await
                .with_context(|| format!("connecting to {}", config.client.server))?;
            let report = client.run(shutdown).await;
            log::info!(
                "Client stopped: {} data, {} heartbeats",
                report.data_sent,
                report.heartbeats_sent
            );
        }
    }
    Ok(())
}
