//! Heartbeat-driven liveness.
//!
//! [`LivenessMonitor`] periodically sweeps the [`DeviceTable`] and derives
//! each device's offline flag from the recency of its last HEARTBEAT.  The
//! flag is recomputed from scratch every tick; there is no hysteresis.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::device::DeviceTable;
use crate::packet::unix_seconds;

/// Seconds without a heartbeat after which a device is declared offline.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Period of the liveness sweep.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct LivenessMonitor {
    pub heartbeat_timeout: Duration,
    pub tick: Duration,
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        Self {
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            tick: DEFAULT_TICK,
        }
    }
}

impl LivenessMonitor {
    pub fn new(heartbeat_timeout: Duration, tick: Duration) -> Self {
        Self {
            heartbeat_timeout,
            tick,
        }
    }

    /// Offline rule: never heard a heartbeat, or the last one is older than
    /// the timeout.  A heartbeat stamped after `now` counts as fresh.
    pub fn is_offline(&self, last_heartbeat: Option<u64>, now: u64) -> bool {
        match last_heartbeat {
            None => true,
            Some(hb) => now.saturating_sub(hb) > self.heartbeat_timeout.as_secs(),
        }
    }

    /// One sweep at time `now` (unix seconds).  Returns the offline count.
    pub fn sweep(&self, devices: &DeviceTable, now: u64) -> usize {
        devices.refresh_offline(|hb| self.is_offline(hb, now))
    }

    /// Sweep every `tick` until `shutdown` is cancelled.
    pub async fn run(self, devices: Arc<DeviceTable>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick);
        // The first tick of an interval completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let offline = self.sweep(&devices, unix_seconds());
                    log::debug!("[liveness] {} device(s), {} offline", devices.len(), offline);
                }
            }
        }
        log::debug!("[liveness] stopped");
    }
}
