//! Per-device sequence bookkeeping.
//!
//! [`DeviceTable`] owns one [`DeviceState`] per sensor and classifies every
//! inbound packet:
//!
//! - A DATA packet whose seq is still in the device's [`RecencyWindow`] is a
//!   **duplicate**.
//! - Otherwise, a DATA packet whose seq exceeds `last_seq + 1` is a **gap**
//!   (at least one presumed-lost packet).
//! - A HEARTBEAT only refreshes liveness; it never touches sequence state.
//!
//! `last_seq` follows the most recently arrived non-duplicate DATA seq, not
//! the highest seen, so a late lower-numbered arrival lowers the gap
//! baseline.  A duplicate leaves it where it was.
//!
//! Sequence wraparound at 2³² is not special-cased: a wrapped seq looks like
//! an ordinary backward jump and is classified neither duplicate nor gap.
//!
//! All mutation happens under one table-wide lock held only for the duration
//! of a single call.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::packet::MsgType;

/// Default number of recent DATA seqs remembered per device.
pub const DEFAULT_WINDOW_CAPACITY: usize = 500;

// ---------------------------------------------------------------------------
// RecencyWindow
// ---------------------------------------------------------------------------

/// Fixed-capacity FIFO of recently observed sequence numbers.
///
/// Every insertion occupies a new slot at the back, including a seq that is
/// already present; the oldest slot is evicted once `capacity` is exceeded.
/// A seq stays a member while at least one of its slots remains.
#[derive(Debug, Clone)]
pub struct RecencyWindow {
    order: VecDeque<u32>,
    counts: HashMap<u32, u32>,
    capacity: usize,
}

impl RecencyWindow {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            counts: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    pub fn contains(&self, seq: u32) -> bool {
        self.counts.contains_key(&seq)
    }

    /// Append `seq`, evicting the oldest slot when the window is full.
    pub fn insert(&mut self, seq: u32) {
        if self.capacity == 0 {
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.release(oldest);
            }
        }
        self.order.push_back(seq);
        *self.counts.entry(seq).or_insert(0) += 1;
    }

    /// Number of occupied slots (duplicates counted separately).
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn release(&mut self, seq: u32) {
        if let Some(n) = self.counts.get_mut(&seq) {
            *n -= 1;
            if *n == 0 {
                self.counts.remove(&seq);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// DeviceState
// ---------------------------------------------------------------------------

/// Sequence and liveness state for one device.
#[derive(Debug, Clone)]
pub struct DeviceState {
    /// Seq of the most recently arrived non-duplicate DATA packet; `None`
    /// until the first DATA packet (a device can be created by a HEARTBEAT).
    pub last_seq: Option<u32>,
    pub window: RecencyWindow,
    /// Arrival time (unix seconds) of the most recent HEARTBEAT.
    pub last_heartbeat: Option<u64>,
    /// Derived by the liveness sweep; set false on every HEARTBEAT.
    pub offline: bool,
}

impl DeviceState {
    fn new(window_capacity: usize) -> Self {
        Self {
            last_seq: None,
            window: RecencyWindow::with_capacity(window_capacity),
            last_heartbeat: None,
            offline: true,
        }
    }

    /// Record a DATA seq and return `(is_duplicate, is_gap)`.
    fn observe_data(&mut self, seq: u32) -> (bool, bool) {
        let (duplicate, gap) = match self.last_seq {
            None => (false, false),
            Some(_) if self.window.contains(seq) => (true, false),
            Some(last) => (false, u64::from(seq) > u64::from(last) + 1),
        };
        self.window.insert(seq);
        if !duplicate {
            self.last_seq = Some(seq);
        }
        (duplicate, gap)
    }

    fn observe_heartbeat(&mut self, arrival_time: u64) {
        self.last_heartbeat = Some(arrival_time);
        self.offline = false;
    }
}

/// Outcome of [`DeviceTable::ingest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Classification {
    pub duplicate: bool,
    pub gap: bool,
    /// Offline flag of the device as observed after this packet.
    pub offline: bool,
}

/// Read-only copy of one device's state, for inspection and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub device_id: u16,
    pub last_seq: Option<u32>,
    pub last_heartbeat: Option<u64>,
    pub offline: bool,
    pub window_len: usize,
}

// ---------------------------------------------------------------------------
// DeviceTable
// ---------------------------------------------------------------------------

/// Thread-safe table of every device seen since startup.
#[derive(Debug)]
pub struct DeviceTable {
    devices: Mutex<HashMap<u16, DeviceState>>,
    window_capacity: usize,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::with_window_capacity(DEFAULT_WINDOW_CAPACITY)
    }

    pub fn with_window_capacity(window_capacity: usize) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            window_capacity,
        }
    }

    /// Classify one packet and update the device's state.
    ///
    /// Devices are created lazily by DATA or HEARTBEAT.  Packets of an
    /// unknown type create nothing and mutate nothing.
    pub fn ingest(
        &self,
        device_id: u16,
        seq: u32,
        msg_type: MsgType,
        arrival_time: u64,
    ) -> Classification {
        let mut devices = self.devices.lock();

        if let MsgType::Unknown(_) = msg_type {
            let offline = devices.get(&device_id).is_none_or(|st| st.offline);
            return Classification {
                offline,
                ..Classification::default()
            };
        }

        let capacity = self.window_capacity;
        let state = devices
            .entry(device_id)
            .or_insert_with(|| DeviceState::new(capacity));

        let (duplicate, gap) = match msg_type {
            MsgType::Data => state.observe_data(seq),
            _ => {
                state.observe_heartbeat(arrival_time);
                (false, false)
            }
        };

        Classification {
            duplicate,
            gap,
            offline: state.offline,
        }
    }

    /// Recompute every device's offline flag from its last heartbeat.
    ///
    /// Returns the number of devices now offline.
    pub fn refresh_offline<F>(&self, mut is_offline: F) -> usize
    where
        F: FnMut(Option<u64>) -> bool,
    {
        let mut devices = self.devices.lock();
        let mut offline = 0;
        for state in devices.values_mut() {
            state.offline = is_offline(state.last_heartbeat);
            if state.offline {
                offline += 1;
            }
        }
        offline
    }

    pub fn get(&self, device_id: u16) -> Option<DeviceSnapshot> {
        self.devices.lock().get(&device_id).map(|st| DeviceSnapshot {
            device_id,
            last_seq: st.last_seq,
            last_heartbeat: st.last_heartbeat,
            offline: st.offline,
            window_len: st.window.len(),
        })
    }

    /// Number of devices tracked.
    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    pub fn offline_count(&self) -> usize {
        self.devices.lock().values().filter(|st| st.offline).count()
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
