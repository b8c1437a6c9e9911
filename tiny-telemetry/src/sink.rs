//! Output sinks.
//!
//! The server writes three append-only streams:
//! - [`LogSink`]: one [`LogRecord`] per processed packet.
//! - [`OrderedSink`]: one row per DATA entry flushed from the reorder buffer.
//! - [`MetricsSink`]: periodic [`MetricsSnapshot`] dumps.
//!
//! File-backed implementations write CSV (log, ordered) and pretty JSON
//! (metrics).  [`MemorySink`] keeps everything in memory behind a shared
//! handle, for tests and embedding.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::metrics::MetricsSnapshot;
use crate::reorder::ReorderEntry;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("metrics serialisation failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Per-packet log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRecord {
    pub device_id: u16,
    pub seq: u32,
    pub packet_timestamp: u32,
    pub arrival_time: u64,
    pub duplicate: bool,
    pub gap: bool,
    pub heartbeat: bool,
    pub offline: bool,
}

pub trait LogSink: Send {
    fn append(&mut self, record: &LogRecord) -> Result<(), SinkError>;
    fn flush(&mut self) -> Result<(), SinkError>;
}

pub trait OrderedSink: Send {
    fn append(&mut self, entry: &ReorderEntry) -> Result<(), SinkError>;
    fn flush(&mut self) -> Result<(), SinkError>;
}

pub trait MetricsSink: Send {
    fn dump(&mut self, snapshot: &MetricsSnapshot) -> Result<(), SinkError>;
}

// ---------------------------------------------------------------------------
// CSV sinks
// ---------------------------------------------------------------------------

const LOG_HEADER: &str =
    "device_id,seq,timestamp,arrival_time,duplicate_flag,gap_flag,heartbeat_flag,offline_flag";
const ORDERED_HEADER: &str = "device_id,seq,timestamp,arrival_time,readings_count,readings";

/// CSV writer for [`LogRecord`]s.  The header row is written on creation.
pub struct CsvLogSink<W: Write> {
    out: W,
}

impl CsvLogSink<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        Self::new(BufWriter::new(File::create(path)?))
    }
}

impl<W: Write> CsvLogSink<W> {
    pub fn new(mut out: W) -> Result<Self, SinkError> {
        writeln!(out, "{LOG_HEADER}")?;
        Ok(Self { out })
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> LogSink for CsvLogSink<W> {
    fn append(&mut self, r: &LogRecord) -> Result<(), SinkError> {
        writeln!(
            self.out,
            "{},{},{},{},{},{},{},{}",
            r.device_id,
            r.seq,
            r.packet_timestamp,
            r.arrival_time,
            u8::from(r.duplicate),
            u8::from(r.gap),
            u8::from(r.heartbeat),
            u8::from(r.offline),
        )?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.out.flush()?;
        Ok(())
    }
}

/// CSV writer for flushed [`ReorderEntry`]s; readings are `;`-joined.
pub struct CsvOrderedSink<W: Write> {
    out: W,
}

impl CsvOrderedSink<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        Self::new(BufWriter::new(File::create(path)?))
    }
}

impl<W: Write> CsvOrderedSink<W> {
    pub fn new(mut out: W) -> Result<Self, SinkError> {
        writeln!(out, "{ORDERED_HEADER}")?;
        Ok(Self { out })
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> OrderedSink for CsvOrderedSink<W> {
    fn append(&mut self, e: &ReorderEntry) -> Result<(), SinkError> {
        let readings = e
            .readings
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(";");
        writeln!(
            self.out,
            "{},{},{},{},{},{}",
            e.device_id,
            e.seq,
            e.packet_timestamp,
            e.arrival_time,
            e.readings.len(),
            readings
        )?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.out.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON metrics sink
// ---------------------------------------------------------------------------

/// Overwrites `path` with the latest snapshot on every dump.
pub struct JsonMetricsSink {
    path: PathBuf,
}

impl JsonMetricsSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricsSink for JsonMetricsSink {
    fn dump(&mut self, snapshot: &MetricsSnapshot) -> Result<(), SinkError> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory sink
// ---------------------------------------------------------------------------

/// Collects records in a shared vector.  Clones share the same storage, so
/// a test can keep one handle while the server owns another.
#[derive(Debug)]
pub struct MemorySink<T> {
    records: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for MemorySink<T> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
        }
    }
}

impl<T> Default for MemorySink<T> {
    fn default() -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> MemorySink<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<T> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn push(&self, record: T) {
        self.records.lock().push(record);
    }
}

impl LogSink for MemorySink<LogRecord> {
    fn append(&mut self, record: &LogRecord) -> Result<(), SinkError> {
        self.push(*record);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl OrderedSink for MemorySink<ReorderEntry> {
    fn append(&mut self, entry: &ReorderEntry) -> Result<(), SinkError> {
        self.push(entry.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl MetricsSink for MemorySink<MetricsSnapshot> {
    fn dump(&mut self, snapshot: &MetricsSnapshot) -> Result<(), SinkError> {
        self.push(snapshot.clone());
        Ok(())
    }
}
