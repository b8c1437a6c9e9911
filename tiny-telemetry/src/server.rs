//! Ingestion loop, per-packet pipeline and background tasks.
//!
//! # Architecture
//!
//! ```text
//!   UDP socket ──recv──▶ Server::run ──try_acquire──▶ spawn_blocking(Pipeline::process)
//!                            │  (permit pool full → drop + count)
//!                            │
//!        ┌───────────────────┼──────────────────────┐
//!        ▼                   ▼                      ▼
//!   liveness sweep     reorder flush          metrics dump
//!   (every tick)       (flush interval)       (metrics interval)
//!        └──────── stopped by one CancellationToken ─┘
//! ```
//!
//! [`Pipeline`] owns the shared state.  The device table, reorder buffer and
//! metrics each sit behind their own lock, so a packet's device update and
//! metrics update are not atomic together; nothing depends on that.
//!
//! # Shutdown
//!
//! Cancelling the token returned by [`Server::shutdown_token`] stops intake,
//! waits up to the drain timeout for in-flight packets, then performs one
//! final reorder flush and metrics dump.  Packets still in flight after the
//! timeout are abandoned and reported in [`ShutdownReport`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::device::DeviceTable;
use crate::error::Result;
use crate::liveness::LivenessMonitor;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::packet::{decode_header, decode_readings, unix_seconds, MsgType, HEADER_LEN};
use crate::reorder::{ReorderBuffer, ReorderEntry};
use crate::sink::{
    CsvLogSink, CsvOrderedSink, JsonMetricsSink, LogRecord, LogSink, MetricsSink, OrderedSink,
};
use crate::socket::Socket;

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// The three output streams a [`Pipeline`] writes to.
pub struct Sinks {
    pub log: Box<dyn LogSink>,
    pub ordered: Box<dyn OrderedSink>,
    pub metrics: Box<dyn MetricsSink>,
}

impl Sinks {
    /// File-backed sinks at the configured paths.  Existing files are truncated.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        Ok(Self {
            log: Box::new(CsvLogSink::create(&config.log_path)?),
            ordered: Box::new(CsvOrderedSink::create(&config.ordered_path)?),
            metrics: Box::new(JsonMetricsSink::new(config.metrics_path.clone())),
        })
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Shared ingestion state, handed to every task by `Arc`.
pub struct Pipeline {
    devices: Arc<DeviceTable>,
    reorder: ReorderBuffer,
    metrics: Metrics,
    log_sink: Mutex<Box<dyn LogSink>>,
    ordered_sink: Mutex<Box<dyn OrderedSink>>,
    metrics_sink: Mutex<Box<dyn MetricsSink>>,
}

impl Pipeline {
    pub fn new(window_capacity: usize, sinks: Sinks) -> Self {
        Self {
            devices: Arc::new(DeviceTable::with_window_capacity(window_capacity)),
            reorder: ReorderBuffer::new(),
            metrics: Metrics::new(),
            log_sink: Mutex::new(sinks.log),
            ordered_sink: Mutex::new(sinks.ordered),
            metrics_sink: Mutex::new(sinks.metrics),
        }
    }

    pub fn devices(&self) -> &Arc<DeviceTable> {
        &self.devices
    }

    pub fn reorder(&self) -> &ReorderBuffer {
        &self.reorder
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Run one datagram through decode, classification, logging, reorder
    /// buffering and metrics.
    ///
    /// Returns the log record, or `None` when the header did not parse (the
    /// datagram is then counted as received but otherwise dropped).
    pub fn process(&self, datagram: &[u8], arrival_time: u64) -> Option<LogRecord> {
        let started = Instant::now();
        self.metrics.record_datagram(datagram.len());

        let header = match decode_header(datagram) {
            Ok(h) => h,
            Err(e) => {
                log::warn!("[server] dropping malformed datagram: {e}");
                self.metrics.record_format_error(started.elapsed());
                return None;
            }
        };

        let readings = if header.msg_type == MsgType::Data && header.batch_count > 0 {
            decode_readings(&datagram[HEADER_LEN..], header.batch_count as usize)
                .unwrap_or_else(|e| {
                    log::warn!(
                        "[server] dev={} seq={}: {e}; logging without readings",
                        header.device_id,
                        header.seq
                    );
                    Vec::new()
                })
        } else {
            Vec::new()
        };

        let outcome = self.devices.ingest(
            header.device_id,
            header.seq,
            header.msg_type,
            arrival_time,
        );

        let record = LogRecord {
            device_id: header.device_id,
            seq: header.seq,
            packet_timestamp: header.timestamp,
            arrival_time,
            duplicate: outcome.duplicate,
            gap: outcome.gap,
            heartbeat: header.msg_type == MsgType::Heartbeat,
            offline: outcome.offline,
        };
        if let Err(e) = self.log_sink.lock().append(&record) {
            log::warn!("[server] log sink write failed: {e}");
        }

        let reading_count = readings.len();
        if header.msg_type == MsgType::Data {
            self.reorder.push(ReorderEntry {
                packet_timestamp: header.timestamp,
                device_id: header.device_id,
                seq: header.seq,
                readings,
                arrival_time,
            });
        }

        self.metrics
            .record_processed(&outcome, reading_count, started.elapsed());

        log::debug!(
            "[server] dev={} seq={} type={} dup={} gap={} offline={}",
            header.device_id,
            header.seq,
            header.msg_type,
            u8::from(outcome.duplicate),
            u8::from(outcome.gap),
            u8::from(outcome.offline),
        );
        Some(record)
    }

    /// Flush the reorder buffer to the ordered sink and flush the log sink.
    /// Returns the number of ordered rows written.
    ///
    /// The log sink is skipped while a worker holds it, so a stuck sink
    /// cannot stall the flush timer or shutdown.
    pub fn flush(&self) -> usize {
        let written = {
            let mut sink = self.ordered_sink.lock();
            self.reorder.flush(&mut **sink)
        };
        match self.log_sink.try_lock() {
            Some(mut sink) => {
                if let Err(e) = sink.flush() {
                    log::warn!("[server] log sink flush failed: {e}");
                }
            }
            None => log::debug!("[server] log sink busy; flush deferred"),
        }
        written
    }

    /// Current derived metrics, stamped with the wall clock.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.state().snapshot(
            self.devices.len(),
            self.devices.offline_count(),
            unix_seconds(),
        )
    }

    /// Compute a snapshot and write it to the metrics sink.
    pub fn dump_metrics(&self) -> MetricsSnapshot {
        let snapshot = self.snapshot();
        if let Err(e) = self.metrics_sink.lock().dump(&snapshot) {
            log::warn!("[server] metrics dump failed: {e}");
        }
        log::info!(
            "[metrics] packets={} reads={} dup_rate={:.4} gaps={} bytes/report={:.2} cpu_ms/report={:.4}",
            snapshot.packets_received,
            snapshot.reads_processed,
            snapshot.duplicate_rate,
            snapshot.gaps,
            snapshot.bytes_per_report,
            snapshot.cpu_ms_per_report,
        );
        snapshot
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Outcome of a graceful shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    /// Per-packet tasks still running when the drain timeout expired.
    pub abandoned: usize,
    /// Ordered rows written by the final flush.
    pub flushed: usize,
    /// The final metrics dump.
    pub metrics: MetricsSnapshot,
}

/// A bound telemetry server.  Nothing is received until [`Server::run`].
pub struct Server {
    socket: Socket,
    pipeline: Arc<Pipeline>,
    config: ServerConfig,
    shutdown: CancellationToken,
}

impl Server {
    /// Validate `config` and bind the receiving socket.
    ///
    /// A bind failure is the only fatal error the server has.
    pub async fn bind(config: ServerConfig, sinks: Sinks) -> Result<Self> {
        config.validate()?;
        let socket = Socket::bind(config.bind).await?;
        log::info!("[server] listening on {}", socket.local_addr);
        Ok(Self {
            socket,
            pipeline: Arc::new(Pipeline::new(config.window_capacity, sinks)),
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        Arc::clone(&self.pipeline)
    }

    /// Cancelling this token starts graceful shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Receive and dispatch datagrams until shutdown, then drain and flush.
    pub async fn run(self) -> ShutdownReport {
        let permits = Arc::new(Semaphore::new(self.config.max_in_flight));

        let liveness = LivenessMonitor::new(
            self.config.heartbeat_timeout(),
            self.config.liveness_tick(),
        );
        let liveness_task = tokio::spawn(
            liveness.run(Arc::clone(self.pipeline.devices()), self.shutdown.clone()),
        );
        let periodic_task = tokio::spawn(periodic_flush(
            Arc::clone(&self.pipeline),
            self.config.flush_interval(),
            self.config.metrics_interval(),
            self.shutdown.clone(),
        ));

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.socket.recv_from() => match result {
                    Ok((datagram, from)) => self.dispatch(&permits, datagram, from),
                    Err(e) => log::warn!("[server] recv failed: {e}"),
                },
            }
        }
        log::info!("[server] shutting down; intake stopped");

        let abandoned = drain(
            &permits,
            self.config.max_in_flight,
            self.config.drain_timeout(),
        )
        .await;
        if abandoned > 0 {
            log::warn!("[server] abandoning {abandoned} in-flight packet(s)");
        }

        if let Err(e) = liveness_task.await {
            log::warn!("[server] liveness task ended abnormally: {e}");
        }
        if let Err(e) = periodic_task.await {
            log::warn!("[server] flush task ended abnormally: {e}");
        }

        let flushed = off_runtime(&self.pipeline, |p| p.flush())
            .await
            .unwrap_or(0);
        let metrics = match off_runtime(&self.pipeline, |p| p.dump_metrics()).await {
            Some(snapshot) => snapshot,
            None => self.pipeline.snapshot(),
        };
        log::info!("[server] stopped; final flush wrote {flushed} row(s)");

        ShutdownReport {
            abandoned,
            flushed,
            metrics,
        }
    }

    /// Hand one datagram to a blocking worker, or drop it if every permit
    /// is taken.
    fn dispatch(&self, permits: &Arc<Semaphore>, datagram: Vec<u8>, from: SocketAddr) {
        let Ok(permit) = Arc::clone(permits).try_acquire_owned() else {
            self.pipeline.metrics().record_overload_drop();
            log::warn!(
                "[server] {} packet(s) in flight; dropping {} bytes from {from}",
                self.config.max_in_flight,
                datagram.len()
            );
            return;
        };

        let pipeline = Arc::clone(&self.pipeline);
        let arrival_time = unix_seconds();
        tokio::task::spawn_blocking(move || {
            pipeline.process(&datagram, arrival_time);
            drop(permit);
        });
    }
}

/// Wait until every permit is back or `limit` elapses.  Returns how many
/// tasks were still running.
async fn drain(permits: &Semaphore, total: usize, limit: Duration) -> usize {
    // `ServerConfig::validate` caps `max_in_flight` well below u32::MAX.
    let wanted = u32::try_from(total).unwrap_or(u32::MAX);
    match tokio::time::timeout(limit, permits.acquire_many(wanted)).await {
        Ok(Ok(_all)) => 0,
        _ => total.saturating_sub(permits.available_permits()),
    }
}

/// Periodic reorder flush and metrics dump, until `shutdown` is cancelled.
///
/// The final flush and dump are the caller's job, after in-flight packets
/// have drained.
async fn periodic_flush(
    pipeline: Arc<Pipeline>,
    flush_every: Duration,
    dump_every: Duration,
    shutdown: CancellationToken,
) {
    let mut flush_tick = tokio::time::interval_at(tok_now() + flush_every, flush_every);
    let mut dump_tick = tokio::time::interval_at(tok_now() + dump_every, dump_every);
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    dump_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = flush_tick.tick() => {
                off_runtime(&pipeline, |p| p.flush()).await;
            }
            _ = dump_tick.tick() => {
                off_runtime(&pipeline, |p| p.dump_metrics()).await;
            }
        }
    }
    log::debug!("[server] periodic flush stopped");
}

/// Run sink work on the blocking pool.  `None` if the task panicked.
async fn off_runtime<T, F>(pipeline: &Arc<Pipeline>, work: F) -> Option<T>
where
    F: FnOnce(&Pipeline) -> T + Send + 'static,
    T: Send + 'static,
{
    let pipeline = Arc::clone(pipeline);
    match tokio::task::spawn_blocking(move || work(&pipeline)).await {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("[server] sink task failed: {e}");
            None
        }
    }
}

/// Cancel `shutdown` on SIGINT (Ctrl-C) or, on Unix, SIGTERM.
///
/// The SIGTERM handler is installed before this returns, so a `kill` sent
/// afterwards always reaches the graceful shutdown path.
pub fn cancel_on_signal(shutdown: CancellationToken) -> std::io::Result<()> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::spawn(async move {
        let interrupt = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => "SIGINT",
                Err(e) => {
                    log::warn!("[server] cannot listen for Ctrl-C: {e}");
                    std::future::pending().await
                }
            }
        };
        #[cfg(unix)]
        let terminate = async {
            terminate.recv().await;
            "SIGTERM"
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<&str>();

        let name = tokio::select! {
            name = interrupt => name,
            name = terminate => name,
        };
        log::info!("[server] {name} received; shutting down");
        shutdown.cancel();
    });
    Ok(())
}

/// Shorthand for `tokio::time::Instant::now()`.
#[inline]
fn tok_now() -> tokio::time::Instant {
    tokio::time::Instant::now()
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
