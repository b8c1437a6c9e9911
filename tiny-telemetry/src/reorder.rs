//! Time-ordered re-emission of DATA packets.
//!
//! The [`ReorderBuffer`] collects one [`ReorderEntry`] per accepted DATA
//! packet.  A flush drains everything collected so far, stable-sorts it by
//! sender timestamp (ties keep arrival order) and writes it to an
//! [`OrderedSink`].  Ordering never crosses a flush boundary, so the flush
//! interval is the reorder horizon.

use parking_lot::Mutex;

use crate::sink::OrderedSink;

/// One DATA packet waiting to be written in timestamp order.
#[derive(Debug, Clone, PartialEq)]
pub struct ReorderEntry {
    /// Sender clock from the packet header.
    pub packet_timestamp: u32,
    pub device_id: u16,
    pub seq: u32,
    pub readings: Vec<f32>,
    /// Server clock at receipt, unix seconds.
    pub arrival_time: u64,
}

#[derive(Debug, Default)]
pub struct ReorderBuffer {
    entries: Mutex<Vec<ReorderEntry>>,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: ReorderEntry) {
        self.entries.lock().push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Take every buffered entry, ordered by packet timestamp.
    ///
    /// The lock is held only for the swap; sorting happens outside it.
    pub fn drain_sorted(&self) -> Vec<ReorderEntry> {
        let mut drained = std::mem::take(&mut *self.entries.lock());
        // `sort_by_key` is stable: equal timestamps keep insertion order.
        drained.sort_by_key(|e| e.packet_timestamp);
        drained
    }

    /// Drain, sort and write to `sink`.  Returns the number of entries
    /// written; write failures are logged and skipped.
    pub fn flush(&self, sink: &mut dyn OrderedSink) -> usize {
        let entries = self.drain_sorted();
        let mut written = 0;
        for entry in &entries {
            match sink.append(entry) {
                Ok(()) => written += 1,
                Err(e) => log::warn!(
                    "[reorder] dropping dev={} seq={}: {e}",
                    entry.device_id,
                    entry.seq
                ),
            }
        }
        if let Err(e) = sink.flush() {
            log::warn!("[reorder] ordered sink flush failed: {e}");
        }
        if !entries.is_empty() {
            log::debug!("[reorder] flushed {written}/{} entries", entries.len());
        }
        written
    }
}
