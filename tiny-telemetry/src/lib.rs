//! `tiny-telemetry`: UDP sensor telemetry ingestion.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐   DATA / HEARTBEAT   ┌────────────────────────────┐
//!  │ SensorClient │─────────────────────▶│          Server            │
//!  └──────────────┘    UDP datagrams     │  recv loop + permit pool   │
//!                                        └─────────────┬──────────────┘
//!                                                      │ one blocking task per datagram
//!                                        ┌─────────────▼──────────────┐
//!                                        │          Pipeline          │
//!                                        │ decode → classify → log    │
//!                                        │   → reorder → metrics      │
//!                                        └──┬──────────┬──────────┬───┘
//!                                           │          │          │
//!                                     DeviceTable  ReorderBuffer  Metrics
//!                                     (liveness)   (flush timer)  (dump timer)
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]: wire format (serialise / deserialise)
//! - [`device`]: per-device sequence tracking, duplicate and gap detection
//! - [`liveness`]: heartbeat-derived offline flag, swept on a tick
//! - [`reorder`]: time-ordered re-emission of DATA packets
//! - [`metrics`]: cumulative counters and derived rates
//! - [`sink`]: log / ordered / metrics output streams
//! - [`server`]: ingestion loop, per-packet pipeline, shutdown
//! - [`client`]: sensor packet generator
//! - [`config`]: TOML-loadable server and client settings
//! - [`socket`]: async UDP socket abstraction
//! - [`error`]: crate error type

pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod liveness;
pub mod metrics;
pub mod packet;
pub mod reorder;
pub mod server;
pub mod sink;
pub mod socket;

pub use error::{Error, Result};
