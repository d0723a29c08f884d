/*! Interval statistics.

An optional thread that wakes up every interval, samples and clears the
shared transfer counter, and logs the throughput. When the link speed is
known it also reports utilisation, and it calls out blocks the ring had
to drop plus clients the fan-out side lost (too slow, or their writes
failed).
*/
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::info;

use crate::daemon::CancelToken;
use crate::fanout::FanoutServer;
use crate::ring::BlockRing;

/// The reporter thread body and its knobs.
pub struct Reporter {
    interval: Duration,
    bytes: Arc<AtomicU64>,
    ring: Arc<BlockRing>,
    sinks: Vec<Arc<FanoutServer>>,
    data_speed: Option<u64>,
}

impl Reporter {
    /// Create a reporter sampling `bytes` every `interval_ms`. The
    /// `sinks` are polled for client and error counts.
    #[must_use]
    pub fn new(
        interval_ms: u64,
        bytes: Arc<AtomicU64>,
        ring: Arc<BlockRing>,
        sinks: Vec<Arc<FanoutServer>>,
        data_speed: Option<u64>,
    ) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            bytes,
            ring,
            sinks,
            data_speed,
        }
    }

    /// Log one line per interval until cancelled.
    pub fn run(&self, cancel: &CancelToken) {
        let mut last_drops = 0;
        let mut last_slow = 0;
        let mut last_send_errors = 0;
        while !cancel.is_canceled() {
            cancel.sleep(self.interval);
            if cancel.is_canceled() {
                break;
            }
            let n = self.bytes.swap(0, Ordering::Relaxed);
            let ms = self.interval.as_millis().max(1) as u64;
            let bps = n.saturating_mul(8).saturating_mul(1000) / ms;
            let mut line = format!("{} rx", human_rate(bps));
            if let Some(cap) = self.data_speed
                && cap > 0
            {
                line += &format!(
                    " ({:.0}% of {})",
                    100.0 * bps as f64 / cap as f64,
                    human_rate(cap)
                );
            }
            let clients: usize =
                self.sinks.iter().map(|s| s.client_count()).sum();
            line += &format!(", {clients} clients");
            let drops = self.ring.dropped();
            if drops > last_drops {
                line += &format!(", {} blocks dropped", drops - last_drops);
                last_drops = drops;
            }
            let slow: u64 = self.sinks.iter().map(|s| s.dropped_slow()).sum();
            if slow > last_slow {
                line += &format!(", {} slow clients dropped", slow - last_slow);
                last_slow = slow;
            }
            let send_errors: u64 =
                self.sinks.iter().map(|s| s.send_errors()).sum();
            if send_errors > last_send_errors {
                line += &format!(
                    ", {} client write errors",
                    send_errors - last_send_errors
                );
                last_send_errors = send_errors;
            }
            info!("{line}");
        }
    }
}

/// Render a bit rate the way humans read them.
#[must_use]
pub fn human_rate(bps: u64) -> String {
    if bps >= 1_000_000 {
        format!("{:.1} MBits/s", bps as f64 / 1e6)
    } else if bps >= 1_000 {
        format!("{:.1} KBits/s", bps as f64 / 1e3)
    } else {
        format!("{bps} Bits/s")
    }
}
