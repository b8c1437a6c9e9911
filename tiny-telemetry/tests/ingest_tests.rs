//! End-to-end ingestion tests.
//!
//! Each test binds a server on loopback with in-memory sinks, sends raw
//! datagrams from a second socket and inspects the pipeline state.  Per-packet
//! work runs on the blocking pool, so tests that depend on arrival order wait
//! for each packet to be processed before sending the next.

use std::future::Future;
use std::sync::mpsc;
use std::time::Duration;

use tiny_telemetry::{
    client::SensorClient,
    config::{ClientConfig, ServerConfig},
    metrics::MetricsSnapshot,
    packet::{MsgType, Packet},
    reorder::ReorderEntry,
    server::{Server, Sinks},
    sink::{LogRecord, LogSink, MemorySink, SinkError},
    socket::Socket,
};

const WAIT: Duration = Duration::from_secs(5);

struct Handles {
    log: MemorySink<LogRecord>,
    ordered: MemorySink<ReorderEntry>,
    metrics: MemorySink<MetricsSnapshot>,
}

fn memory_sinks() -> (Sinks, Handles) {
    let handles = Handles {
        log: MemorySink::new(),
        ordered: MemorySink::new(),
        metrics: MemorySink::new(),
    };
    let sinks = Sinks {
        log: Box::new(handles.log.clone()),
        ordered: Box::new(handles.ordered.clone()),
        metrics: Box::new(handles.metrics.clone()),
    };
    (sinks, handles)
}

/// Loopback config with periodic work pushed far out, so only the final
/// flush and dump run during a test.
fn test_config() -> ServerConfig {
    ServerConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        liveness_tick_ms: 50,
        flush_interval_ms: 60_000,
        drain_timeout_ms: 1_000,
        ..Default::default()
    }
}

async fn ephemeral() -> Socket {
    Socket::bind("127.0.0.1:0".parse().unwrap())
        .await
        .expect("bind failed")
}

/// Poll `cond` until it holds, panicking after [`WAIT`].
async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn bounded<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, fut).await.expect("timed out")
}

fn data(device_id: u16, seq: u32, ts: u32, readings: &[f32]) -> Packet {
    Packet::with_timestamp(device_id, seq, ts, MsgType::Data, readings.to_vec())
}

fn heartbeat(device_id: u16, seq: u32) -> Packet {
    Packet::with_timestamp(device_id, seq, 0, MsgType::Heartbeat, vec![])
}

// ---------------------------------------------------------------------------
// Classification over the wire
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_duplicate_and_gap_detection() {
    let (sinks, h) = memory_sinks();
    let server = Server::bind(test_config(), sinks).await.unwrap();
    let addr = server.local_addr();
    let pipeline = server.pipeline();
    let token = server.shutdown_token();
    let task = tokio::spawn(server.run());

    let sender = ephemeral().await;
    for (i, seq) in [1u32, 2, 3, 5, 3].into_iter().enumerate() {
        sender.send_to(&data(7, seq, seq, &[21.0]), addr).await.unwrap();
        wait_until(|| h.log.len() == i + 1).await;
    }

    let flags: Vec<(u32, bool, bool)> = h
        .log
        .records()
        .iter()
        .map(|r| (r.seq, r.duplicate, r.gap))
        .collect();
    assert_eq!(
        flags,
        vec![
            (1, false, false),
            (2, false, false),
            (3, false, false),
            (5, false, true),
            (3, true, false),
        ]
    );

    let device = pipeline.devices().get(7).unwrap();
    assert_eq!(device.last_seq, Some(5));
    assert_eq!(device.window_len, 5);

    token.cancel();
    let report = bounded(task).await.unwrap();
    assert_eq!(report.abandoned, 0);
    assert_eq!(report.metrics.duplicates, 1);
    assert_eq!(report.metrics.gaps, 1);
    assert_eq!(report.metrics.packets_received, 5);
    assert!((report.metrics.duplicate_rate - 0.2).abs() < 1e-9);
}

#[tokio::test]
async fn test_malformed_datagram_is_counted_not_logged() {
    let (sinks, h) = memory_sinks();
    let server = Server::bind(test_config(), sinks).await.unwrap();
    let addr = server.local_addr();
    let pipeline = server.pipeline();
    let token = server.shutdown_token();
    let task = tokio::spawn(server.run());

    let sender = ephemeral().await;
    sender.send_raw(&[1, 2, 3, 4, 5], addr).await.unwrap();
    wait_until(|| pipeline.metrics().state().format_errors == 1).await;

    sender.send_to(&data(1, 0, 0, &[25.0]), addr).await.unwrap();
    wait_until(|| h.log.len() == 1).await;

    token.cancel();
    let report = bounded(task).await.unwrap();
    assert_eq!(report.metrics.packets_received, 2);
    assert_eq!(report.metrics.bytes_received, 5 + 16);
    assert_eq!(report.metrics.reads_processed, 1);
    assert_eq!(report.metrics.devices_tracked, 1);
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_heartbeat_then_timeout_goes_offline() {
    let (sinks, h) = memory_sinks();
    let config = ServerConfig {
        heartbeat_timeout_secs: 0,
        ..test_config()
    };
    let server = Server::bind(config, sinks).await.unwrap();
    let addr = server.local_addr();
    let pipeline = server.pipeline();
    let token = server.shutdown_token();
    let task = tokio::spawn(server.run());

    let sender = ephemeral().await;
    sender.send_to(&data(3, 0, 0, &[22.0]), addr).await.unwrap();
    wait_until(|| h.log.len() == 1).await;
    assert!(h.log.records()[0].offline, "no heartbeat yet");

    sender.send_to(&heartbeat(3, 1), addr).await.unwrap();
    wait_until(|| h.log.len() == 2).await;
    let hb = h.log.records()[1];
    assert!(hb.heartbeat);
    assert!(!hb.offline);
    assert_eq!(pipeline.devices().get(3).unwrap().last_seq, Some(0));

    // Timeout of zero: offline again once the wall clock ticks past the
    // heartbeat's second.
    wait_until(|| pipeline.devices().get(3).is_some_and(|d| d.offline)).await;

    token.cancel();
    let report = bounded(task).await.unwrap();
    assert_eq!(report.metrics.devices_offline, 1);
    assert_eq!(report.metrics.reads_processed, 2);
}

// ---------------------------------------------------------------------------
// Reordering and shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_final_flush_orders_by_timestamp() {
    let (sinks, h) = memory_sinks();
    let server = Server::bind(test_config(), sinks).await.unwrap();
    let addr = server.local_addr();
    let token = server.shutdown_token();
    let task = tokio::spawn(server.run());

    let sender = ephemeral().await;
    sender.send_to(&data(1, 0, 300, &[3.0]), addr).await.unwrap();
    sender.send_to(&data(2, 0, 100, &[1.0, 1.5]), addr).await.unwrap();
    sender.send_to(&heartbeat(1, 1), addr).await.unwrap();
    sender.send_to(&data(1, 1, 200, &[2.0]), addr).await.unwrap();
    wait_until(|| h.log.len() == 4).await;
    assert!(h.ordered.is_empty(), "flush interval has not elapsed");

    token.cancel();
    let report = bounded(task).await.unwrap();
    assert_eq!(report.flushed, 3);

    let ts: Vec<u32> = h.ordered.records().iter().map(|e| e.packet_timestamp).collect();
    assert_eq!(ts, vec![100, 200, 300]);
    assert_eq!(h.ordered.records()[0].readings, vec![1.0, 1.5]);

    let dumps = h.metrics.records();
    assert_eq!(dumps.last(), Some(&report.metrics));
    assert_eq!(report.metrics.reads_processed, 5);
}

#[tokio::test]
async fn test_periodic_flush_runs_while_receiving() {
    let (sinks, h) = memory_sinks();
    let config = ServerConfig {
        flush_interval_ms: 50,
        ..test_config()
    };
    let server = Server::bind(config, sinks).await.unwrap();
    let addr = server.local_addr();
    let token = server.shutdown_token();
    let task = tokio::spawn(server.run());

    let sender = ephemeral().await;
    sender.send_to(&data(5, 0, 10, &[20.5]), addr).await.unwrap();
    wait_until(|| h.ordered.len() == 1).await;
    wait_until(|| !h.metrics.is_empty()).await;

    token.cancel();
    let report = bounded(task).await.unwrap();
    assert_eq!(report.flushed, 0);
    assert_eq!(h.ordered.len(), 1);
}

// ---------------------------------------------------------------------------
// Backpressure
// ---------------------------------------------------------------------------

/// A log sink that blocks each append until the test sends a token or drops
/// the sender.
struct GatedLog {
    gate: mpsc::Receiver<()>,
    inner: MemorySink<LogRecord>,
}

impl LogSink for GatedLog {
    fn append(&mut self, record: &LogRecord) -> Result<(), SinkError> {
        let _ = self.gate.recv();
        self.inner.append(record)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

fn gated_sinks() -> (Sinks, mpsc::Sender<()>, MemorySink<LogRecord>) {
    let (open, gate) = mpsc::channel();
    let log = MemorySink::new();
    let sinks = Sinks {
        log: Box::new(GatedLog {
            gate,
            inner: log.clone(),
        }),
        ordered: Box::new(MemorySink::<ReorderEntry>::new()),
        metrics: Box::new(MemorySink::<MetricsSnapshot>::new()),
    };
    (sinks, open, log)
}

#[tokio::test]
async fn test_overload_drops_and_counts() {
    let (sinks, open, log) = gated_sinks();
    let config = ServerConfig {
        max_in_flight: 1,
        ..test_config()
    };
    let server = Server::bind(config, sinks).await.unwrap();
    let addr = server.local_addr();
    let pipeline = server.pipeline();
    let token = server.shutdown_token();
    let task = tokio::spawn(server.run());

    let sender = ephemeral().await;
    sender.send_to(&data(1, 0, 0, &[1.0]), addr).await.unwrap();
    // The first packet holds the only permit while it waits on the gate.
    wait_until(|| pipeline.metrics().state().packets_received == 1).await;

    sender.send_to(&data(1, 1, 1, &[1.0]), addr).await.unwrap();
    sender.send_to(&data(1, 2, 2, &[1.0]), addr).await.unwrap();
    wait_until(|| pipeline.metrics().state().dropped_overload == 2).await;

    open.send(()).unwrap();
    wait_until(|| log.len() == 1).await;

    token.cancel();
    let report = bounded(task).await.unwrap();
    assert_eq!(report.abandoned, 0);
    assert_eq!(report.metrics.dropped_overload, 2);
    assert_eq!(report.metrics.packets_received, 1);
    assert_eq!(report.flushed, 1);
}

#[tokio::test]
async fn test_drain_timeout_abandons_stuck_packet() {
    let (sinks, open, log) = gated_sinks();
    let config = ServerConfig {
        drain_timeout_ms: 50,
        ..test_config()
    };
    let server = Server::bind(config, sinks).await.unwrap();
    let addr = server.local_addr();
    let pipeline = server.pipeline();
    let token = server.shutdown_token();
    let task = tokio::spawn(server.run());

    let sender = ephemeral().await;
    sender.send_to(&data(1, 0, 0, &[1.0]), addr).await.unwrap();
    wait_until(|| pipeline.metrics().state().packets_received == 1).await;

    token.cancel();
    let report = bounded(task).await.unwrap();
    assert_eq!(report.abandoned, 1);
    assert!(log.is_empty());

    // Release the stuck worker so the runtime can shut down.
    drop(open);
}

// ---------------------------------------------------------------------------
// File sinks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_file_sinks_written_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        log_path: dir.path().join("log.csv"),
        ordered_path: dir.path().join("ordered.csv"),
        metrics_path: dir.path().join("metrics.json"),
        ..test_config()
    };
    let sinks = Sinks::from_config(&config).unwrap();
    let server = Server::bind(config.clone(), sinks).await.unwrap();
    let addr = server.local_addr();
    let pipeline = server.pipeline();
    let token = server.shutdown_token();
    let task = tokio::spawn(server.run());

    let sender = ephemeral().await;
    sender.send_to(&data(9, 4, 40, &[20.25, 29.5]), addr).await.unwrap();
    wait_until(|| pipeline.metrics().state().reads_processed == 2).await;

    token.cancel();
    bounded(task).await.unwrap();

    let log = std::fs::read_to_string(&config.log_path).unwrap();
    let rows: Vec<&str> = log.lines().collect();
    assert_eq!(rows.len(), 2);
    assert!(rows[1].starts_with("9,4,40,"));
    assert!(rows[1].ends_with(",0,0,0,1"));

    let ordered = std::fs::read_to_string(&config.ordered_path).unwrap();
    assert!(ordered.lines().nth(1).unwrap().ends_with(",2,20.25;29.5"));

    let raw = std::fs::read_to_string(&config.metrics_path).unwrap();
    let snap: MetricsSnapshot = serde_json::from_str(&raw).unwrap();
    assert_eq!(snap.packets_received, 1);
    assert_eq!(snap.bytes_received, 20);
    assert!((snap.bytes_per_report - 10.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_bind_conflict_is_error() {
    let taken = ephemeral().await;
    let (sinks, _h) = memory_sinks();
    let config = ServerConfig {
        bind: taken.local_addr,
        ..test_config()
    };
    assert!(matches!(
        Server::bind(config, sinks).await,
        Err(tiny_telemetry::Error::Bind { .. })
    ));
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_client_heartbeat_does_not_advance_seq() {
    let receiver = ephemeral().await;
    let config = ClientConfig {
        server: receiver.local_addr,
        device_id: Some(4242),
        batch_size: 3,
        ..Default::default()
    };
    let mut client = SensorClient::connect(&config).await.unwrap();

    client.send_data(vec![20.0, 21.0, 22.0]).await.unwrap();
    client.send_heartbeat().await.unwrap();
    client.send_data(vec![23.0]).await.unwrap();
    assert_eq!(client.seq(), 2);

    let mut got = Vec::new();
    for _ in 0..3 {
        let (bytes, _) = bounded(receiver.recv_from()).await.unwrap();
        got.push(Packet::decode(&bytes).unwrap());
    }

    assert_eq!(got[0].header.msg_type, MsgType::Data);
    assert_eq!(got[0].header.seq, 0);
    assert_eq!(got[0].readings, vec![20.0, 21.0, 22.0]);
    assert_eq!(got[1].header.msg_type, MsgType::Heartbeat);
    assert_eq!(got[1].header.seq, 1);
    assert_eq!(got[1].header.batch_count, 0);
    assert_eq!(got[2].header.seq, 1);
    assert!(got.iter().all(|p| p.header.device_id == 4242));
}

#[tokio::test]
async fn test_client_against_server() {
    let (sinks, h) = memory_sinks();
    let server = Server::bind(test_config(), sinks).await.unwrap();
    let addr = server.local_addr();
    let pipeline = server.pipeline();
    let server_token = server.shutdown_token();
    let server_task = tokio::spawn(server.run());

    let config = ClientConfig {
        server: addr,
        device_id: Some(77),
        reporting_interval_ms: 20,
        heartbeat_interval_ms: 1_000,
        batch_size: 2,
        ..Default::default()
    };
    let client = SensorClient::connect(&config).await.unwrap();
    let client_token = tokio_util::sync::CancellationToken::new();
    let client_task = tokio::spawn(client.run(client_token.clone()));

    wait_until(|| h.log.records().iter().filter(|r| !r.heartbeat).count() >= 3).await;
    client_token.cancel();
    let sent = bounded(client_task).await.unwrap();
    assert!(sent.data_sent >= 3);
    assert!(sent.heartbeats_sent >= 1);
    assert_eq!(sent.send_errors, 0);

    let total = (sent.data_sent + sent.heartbeats_sent) as usize;
    wait_until(|| h.log.len() == total).await;
    assert!(!pipeline.devices().get(77).unwrap().offline);

    server_token.cancel();
    let report = bounded(server_task).await.unwrap();
    assert_eq!(report.metrics.duplicates, 0);
    assert_eq!(report.flushed as u64, sent.data_sent);
}
