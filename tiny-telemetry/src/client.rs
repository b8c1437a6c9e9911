//! Sensor client: emits DATA on a cadence and HEARTBEAT on its own timer.
//!
//! DATA packets carry a sequence number that increments (wrapping) after
//! every send attempt.  HEARTBEATs reuse the current value and never advance
//! it.  Send failures are logged and counted; nothing is retried.

use std::future;
use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::packet::{MsgType, Packet};
use crate::socket::Socket;

/// Sensor readings are drawn uniformly from this range.
const READING_RANGE: std::ops::Range<f32> = 20.0..30.0;

/// Counters returned when [`SensorClient::run`] stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientReport {
    pub data_sent: u64,
    pub heartbeats_sent: u64,
    pub send_errors: u64,
}

pub struct SensorClient {
    socket: Socket,
    server: SocketAddr,
    device_id: u16,
    seq: u32,
    batch_size: usize,
    reporting_interval: Duration,
    heartbeat_interval: Duration,
    duration: Option<Duration>,
}

impl SensorClient {
    /// Bind an ephemeral socket for talking to `config.server`.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let socket = Socket::bind_for(config.server).await?;
        let device_id = config
            .device_id
            .unwrap_or_else(|| rand::rng().random_range(1000..=9999));
        log::info!(
            "[client {device_id}] sending to {} from {}",
            config.server,
            socket.local_addr
        );
        Ok(Self {
            socket,
            server: config.server,
            device_id,
            seq: 0,
            batch_size: config.batch_size,
            reporting_interval: config.reporting_interval(),
            heartbeat_interval: config.heartbeat_interval(),
            duration: config.duration(),
        })
    }

    pub fn device_id(&self) -> u16 {
        self.device_id
    }

    /// Sequence number the next DATA packet will carry.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Send one DATA packet.  The sequence number advances even if the send
    /// fails, so the server sees the loss as a gap.
    pub async fn send_data(&mut self, readings: Vec<f32>) -> std::io::Result<()> {
        let packet = Packet::new(self.device_id, self.seq, MsgType::Data, readings);
        self.seq = self.seq.wrapping_add(1);
        self.socket.send_to(&packet, self.server).await
    }

    pub async fn send_heartbeat(&self) -> std::io::Result<()> {
        let packet = Packet::new(self.device_id, self.seq, MsgType::Heartbeat, Vec::new());
        self.socket.send_to(&packet, self.server).await
    }

    /// Emit packets until `shutdown` is cancelled or the configured duration
    /// elapses.
    pub async fn run(mut self, shutdown: CancellationToken) -> ClientReport {
        let mut report = ClientReport::default();

        let mut data_tick = tokio::time::interval(self.reporting_interval);
        let mut heartbeat_tick = tokio::time::interval(self.heartbeat_interval);
        data_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let limit = self.duration;
        let deadline = async move {
            match limit {
                Some(d) => tokio::time::sleep(d).await,
                None => future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = &mut deadline => break,
                _ = data_tick.tick() => {
                    let seq = self.seq;
                    let readings = sample_readings(self.batch_size);
                    match self.send_data(readings).await {
                        Ok(()) => {
                            report.data_sent += 1;
                            log::debug!("[client {}] sent DATA seq={seq}", self.device_id);
                        }
                        Err(e) => {
                            report.send_errors += 1;
                            log::warn!("[client {}] DATA seq={seq} not sent: {e}", self.device_id);
                        }
                    }
                }
                _ = heartbeat_tick.tick() => {
                    match self.send_heartbeat().await {
                        Ok(()) => {
                            report.heartbeats_sent += 1;
                            log::debug!("[client {}] sent HEARTBEAT seq={}", self.device_id, self.seq);
                        }
                        Err(e) => {
                            report.send_errors += 1;
                            log::warn!("[client {}] HEARTBEAT not sent: {e}", self.device_id);
                        }
                    }
                }
            }
        }

        log::info!(
            "[client {}] stopped: {} data, {} heartbeats, {} send errors",
            self.device_id,
            report.data_sent,
            report.heartbeats_sent,
            report.send_errors
        );
        report
    }
}

/// `count` readings rounded to two decimals.
fn sample_readings(count: usize) -> Vec<f32> {
    let mut rng = rand::rng();
    (0..count)
        .map(|_| (rng.random_range(READING_RANGE) * 100.0).round() / 100.0)
        .collect()
}
