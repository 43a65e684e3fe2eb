//! Packet and byte counters for periodic throughput reports.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Counts read and reset since the previous report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub packets: u64,
    pub bytes: u64,
}

impl Snapshot {
    /// Throughput in megabytes per second over `interval`.
    pub fn megabytes_per_sec(&self, interval: Duration) -> f64 {
        let secs = interval.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes as f64 / secs / 1_000_000.0
    }
}

/// Lock-free packet/byte counter.
#[derive(Debug, Default)]
pub struct Counter {
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl Counter {
    pub fn count(&self, packets: usize, bytes: usize) {
        self.packets.fetch_add(packets as u64, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Read the counts and reset them to zero.
    pub fn take(&self) -> Snapshot {
        Snapshot {
            packets: self.packets.swap(0, Ordering::Relaxed),
            bytes: self.bytes.swap(0, Ordering::Relaxed),
        }
    }
}

/// Traffic entering and leaving one scatterer or gatherer.
#[derive(Debug, Default)]
pub struct FlowStats {
    pub input: Counter,
    pub output: Counter,
}

impl FlowStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Log the counters of every `(label, stats)` pair once per `interval` until
/// `shutdown` fires. A zero interval disables reporting.
pub async fn report_loop<F>(
    interval: Duration,
    sources: Vec<(&'static str, Arc<FlowStats>)>,
    shutdown: CancellationToken,
    log: F,
) where
    F: Fn(String) + Send + Sync,
{
    if interval.is_zero() {
        return;
    }

    let mut tick = tokio::time::interval(interval);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => {
                for (label, stats) in &sources {
                    for (direction, counter) in [("in", &stats.input), ("out", &stats.output)] {
                        let snap = counter.take();
                        log(format!(
                            "{label} {direction}: {} packets, {} bytes in {:?}, {:.2} MB/s",
                            snap.packets,
                            snap.bytes,
                            interval,
                            snap.megabytes_per_sec(interval)
                        ));
                    }
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}
