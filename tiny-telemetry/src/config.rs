//! Server and client configuration.
//!
//! Every field has a default, so an empty TOML file (or none at all) is a
//! valid configuration.  CLI flags in `main.rs` override individual values
//! after loading.
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:5555"
//! heartbeat_timeout_secs = 10
//! flush_interval_ms = 5000
//!
//! [client]
//! server = "127.0.0.1:5555"
//! device_id = 42
//! batch_size = 4
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::device::DEFAULT_WINDOW_CAPACITY;
use crate::error::{Error, Result};

/// Default UDP port of the telemetry server.
pub const DEFAULT_PORT: u16 = 5555;

/// Upper bound on `max_in_flight`; the drain wait acquires all permits at once.
const MAX_IN_FLIGHT_LIMIT: usize = 1 << 20;

/// Top-level file layout: one optional table per mode.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl TelemetryConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// A device is offline once its last heartbeat is older than this.
    pub heartbeat_timeout_secs: u64,
    pub liveness_tick_ms: u64,
    /// Reorder flush period, which is also the reorder horizon.
    pub flush_interval_ms: u64,
    /// Metrics dump period; shares the flush timer when unset.
    pub metrics_interval_ms: Option<u64>,
    /// Recent DATA seqs remembered per device for duplicate detection.
    pub window_capacity: usize,
    /// Per-packet tasks allowed in flight before datagrams are dropped.
    pub max_in_flight: usize,
    /// How long shutdown waits for in-flight packets before flushing.
    pub drain_timeout_ms: u64,
    pub log_path: PathBuf,
    pub ordered_path: PathBuf,
    pub metrics_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            heartbeat_timeout_secs: 10,
            liveness_tick_ms: 1_000,
            flush_interval_ms: 5_000,
            metrics_interval_ms: None,
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            max_in_flight: 1_024,
            drain_timeout_ms: 2_000,
            log_path: PathBuf::from("telemetry_log.csv"),
            ordered_path: PathBuf::from("telemetry_reordered.csv"),
            metrics_path: PathBuf::from("metrics.json"),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_capacity == 0 {
            return Err(Error::Config("window_capacity must be at least 1".into()));
        }
        if self.max_in_flight == 0 || self.max_in_flight > MAX_IN_FLIGHT_LIMIT {
            return Err(Error::Config(format!(
                "max_in_flight must be in 1..={MAX_IN_FLIGHT_LIMIT}"
            )));
        }
        if self.liveness_tick_ms == 0 || self.flush_interval_ms == 0 {
            return Err(Error::Config("periodic intervals must be non-zero".into()));
        }
        if self.metrics_interval_ms == Some(0) {
            return Err(Error::Config("metrics_interval_ms must be non-zero".into()));
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn liveness_tick(&self) -> Duration {
        Duration::from_millis(self.liveness_tick_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms.unwrap_or(self.flush_interval_ms))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub server: SocketAddr,
    /// Chosen at random in 1000..=9999 when unset.
    pub device_id: Option<u16>,
    pub reporting_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Readings per DATA packet.
    pub batch_size: usize,
    /// Stop after this many seconds; run until cancelled when unset.
    pub duration_secs: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            device_id: None,
            reporting_interval_ms: 1_000,
            heartbeat_interval_ms: 5_000,
            batch_size: 1,
            duration_secs: None,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=u8::MAX as usize).contains(&self.batch_size) {
            return Err(Error::Config("batch_size must be in 1..=255".into()));
        }
        if self.reporting_interval_ms == 0 || self.heartbeat_interval_ms == 0 {
            return Err(Error::Config("client intervals must be non-zero".into()));
        }
        Ok(())
    }

    pub fn reporting_interval(&self) -> Duration {
        Duration::from_millis(self.reporting_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_secs.map(Duration::from_secs)
    }
}
