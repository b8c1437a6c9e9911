//! Cumulative ingestion counters and the rates derived from them.

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::device::Classification;

/// Cumulative counters, never reset during the process lifetime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsState {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub duplicates: u64,
    pub gaps: u64,
    /// Readings processed, with a reading-less packet counting as one.
    pub reads_processed: u64,
    /// Wall time spent inside the per-packet routine.
    pub processing_time_seconds: f64,
    /// Datagrams dropped because the header did not parse.
    pub format_errors: u64,
    /// Datagrams dropped because every worker permit was in use.
    pub dropped_overload: u64,
}

/// Point-in-time view serialised to the metrics sink.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub packets_received: u64,
    pub reads_processed: u64,
    pub bytes_received: u64,
    pub bytes_per_report: f64,
    pub duplicates: u64,
    pub duplicate_rate: f64,
    pub gaps: u64,
    pub cpu_ms_per_report: f64,
    pub format_errors: u64,
    pub dropped_overload: u64,
    pub devices_tracked: usize,
    pub devices_offline: usize,
    /// Wall clock at snapshot time, unix seconds.
    pub timestamp: u64,
}

fn ratio(num: f64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num / den as f64
    }
}

impl MetricsState {
    pub fn bytes_per_report(&self) -> f64 {
        ratio(self.bytes_received as f64, self.reads_processed)
    }

    pub fn duplicate_rate(&self) -> f64 {
        ratio(self.duplicates as f64, self.packets_received)
    }

    pub fn cpu_ms_per_report(&self) -> f64 {
        ratio(self.processing_time_seconds, self.reads_processed) * 1000.0
    }

    pub fn snapshot(&self, devices_tracked: usize, devices_offline: usize, timestamp: u64) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_received: self.packets_received,
            reads_processed: self.reads_processed,
            bytes_received: self.bytes_received,
            bytes_per_report: self.bytes_per_report(),
            duplicates: self.duplicates,
            duplicate_rate: self.duplicate_rate(),
            gaps: self.gaps,
            cpu_ms_per_report: self.cpu_ms_per_report(),
            format_errors: self.format_errors,
            dropped_overload: self.dropped_overload,
            devices_tracked,
            devices_offline,
            timestamp,
        }
    }
}

/// Thread-safe aggregator; the lock is held only across counter updates.
#[derive(Debug, Default)]
pub struct Metrics {
    state: Mutex<MetricsState>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw receive accounting, done before any parsing.
    pub fn record_datagram(&self, len: usize) {
        let mut s = self.state.lock();
        s.packets_received += 1;
        s.bytes_received += len as u64;
    }

    pub fn record_format_error(&self, elapsed: Duration) {
        let mut s = self.state.lock();
        s.format_errors += 1;
        s.processing_time_seconds += elapsed.as_secs_f64();
    }

    pub fn record_overload_drop(&self) {
        self.state.lock().dropped_overload += 1;
    }

    /// Accounting for a packet that made it through classification.
    pub fn record_processed(&self, outcome: &Classification, readings: usize, elapsed: Duration) {
        let mut s = self.state.lock();
        s.duplicates += u64::from(outcome.duplicate);
        s.gaps += u64::from(outcome.gap);
        s.reads_processed += readings.max(1) as u64;
        s.processing_time_seconds += elapsed.as_secs_f64();
    }

    /// Copy of the cumulative counters.
    pub fn state(&self) -> MetricsState {
        self.state.lock().clone()
    }
}
