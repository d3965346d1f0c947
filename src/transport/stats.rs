//! Tunnel traffic counters
//!
//! "Sent" is traffic read from the interface and forwarded to a peer,
//! "received" is traffic from a peer injected into the interface. Sizes
//! are plaintext IP packet lengths.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Interval between traffic reports in verbose mode
pub const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Packet and byte counters shared by every tunnel task
#[derive(Debug, Default)]
pub struct TrafficStats {
    sent_bytes: AtomicU64,
    sent_packets: AtomicU64,
    received_bytes: AtomicU64,
    received_packets: AtomicU64,
}

/// Point-in-time copy of [`TrafficStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sent_bytes: u64,
    pub sent_packets: u64,
    pub received_bytes: u64,
    pub received_packets: u64,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one packet forwarded from the interface to a peer
    pub fn record_sent(&self, len: usize) {
        self.sent_bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.sent_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one packet delivered from a peer to the interface
    pub fn record_received(&self, len: usize) {
        self.received_bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.received_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            sent_packets: self.sent_packets.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            received_packets: self.received_packets.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Traffic accumulated since `earlier`
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            sent_bytes: self.sent_bytes.saturating_sub(earlier.sent_bytes),
            sent_packets: self.sent_packets.saturating_sub(earlier.sent_packets),
            received_bytes: self.received_bytes.saturating_sub(earlier.received_bytes),
            received_packets: self.received_packets.saturating_sub(earlier.received_packets),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent {} ({} packets), received {} ({} packets)",
            format_bytes(self.sent_bytes),
            self.sent_packets,
            format_bytes(self.received_bytes),
            self.received_packets
        )
    }
}

/// Human-readable byte count (binary units)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

/// Log totals and per-interval traffic until cancelled
pub async fn report(stats: Arc<TrafficStats>, interval: Duration, server_mode: bool) {
    let role = if server_mode { "server" } else { "client" };
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    let mut last = stats.snapshot();
    loop {
        ticker.tick().await;
        let now = stats.snapshot();
        info!(role, "traffic total: {}; last {:?}: {}", now, interval, now.since(&last));
        last = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = TrafficStats::new();
        stats.record_sent(100);
        stats.record_sent(50);
        stats.record_received(1400);

        let snap = stats.snapshot();
        assert_eq!(snap.sent_bytes, 150);
        assert_eq!(snap.sent_packets, 2);
        assert_eq!(snap.received_bytes, 1400);
        assert_eq!(snap.received_packets, 1);

        stats.record_received(600);
        let delta = stats.snapshot().since(&snap);
        assert_eq!(
            delta,
            StatsSnapshot {
                received_bytes: 600,
                received_packets: 1,
                ..StatsSnapshot::default()
            }
        );
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.50 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MiB");
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_runs_until_cancelled() {
        let stats = Arc::new(TrafficStats::new());
        stats.record_sent(10);

        let reported = tokio::time::timeout(
            Duration::from_secs(95),
            report(stats.clone(), Duration::from_secs(30), true),
        )
        .await;
        assert!(reported.is_err());
        assert_eq!(stats.snapshot().sent_packets, 1);
    }
}
