//! Relay metrics collection.
//!
//! Aggregate connection counters only; nothing about individual peers or
//! targets is stored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Relay metrics collector shared by distributors and forwards.
pub struct RelayMetrics {
    /// Collector creation time
    start_time: Instant,
    /// Total connections dispatched
    total_connections: AtomicU64,
    /// Connections currently being handled
    active_connections: AtomicU64,
    /// Connections with no processor for their leading byte
    rejected_connections: AtomicU64,
    /// Connections whose handler returned an error
    failed_connections: AtomicU64,
    /// Handler panics caught at the task boundary
    panics: AtomicU64,
}

impl RelayMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            rejected_connections: AtomicU64::new(0),
            failed_connections: AtomicU64::new(0),
            panics: AtomicU64::new(0),
        }
    }

    /// Increment total and active connections.
    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections.
    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Increment rejected connection count.
    pub fn increment_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment failed connection count.
    pub fn increment_failed(&self) {
        self.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment caught panic count.
    pub fn increment_panics(&self) {
        self.panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get total connections.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Get active connections.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get rejected connections.
    pub fn rejected_connections(&self) -> u64 {
        self.rejected_connections.load(Ordering::Relaxed)
    }

    /// Get failed connections.
    pub fn failed_connections(&self) -> u64 {
        self.failed_connections.load(Ordering::Relaxed)
    }

    /// Get caught panics.
    pub fn panics(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            rejected_connections: self.rejected_connections(),
            failed_connections: self.failed_connections(),
            panics: self.panics(),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        let snapshot = self.snapshot();

        format!(
            r#"portmux Metrics
===============
Uptime: {} seconds

Connections:
  Total:    {}
  Active:   {}
  Rejected: {}
  Failed:   {}

Errors:
  Panics: {}
"#,
            snapshot.uptime_secs,
            snapshot.total_connections,
            snapshot.active_connections,
            snapshot.rejected_connections,
            snapshot.failed_connections,
            snapshot.panics,
        )
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Seconds since the collector was created
    pub uptime_secs: u64,
    /// Connections dispatched
    pub total_connections: u64,
    /// Connections being handled
    pub active_connections: u64,
    /// Connections with no matching processor
    pub rejected_connections: u64,
    /// Connections whose handler failed
    pub failed_connections: u64,
    /// Caught handler panics
    pub panics: u64,
}

impl MetricsSnapshot {
    /// Fraction of dispatched connections that were rejected or failed.
    pub fn failure_rate(&self) -> f64 {
        if self.total_connections == 0 {
            0.0
        } else {
            (self.rejected_connections + self.failed_connections) as f64
                / self.total_connections as f64
        }
    }

    /// Calculate connections per second.
    pub fn connections_per_second(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            self.total_connections as f64 / self.uptime_secs as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_counting() {
        let metrics = RelayMetrics::new();

        metrics.increment_connections();
        metrics.increment_connections();
        assert_eq!(metrics.total_connections(), 2);
        assert_eq!(metrics.active_connections(), 2);

        metrics.decrement_connections();
        assert_eq!(metrics.total_connections(), 2);
        assert_eq!(metrics.active_connections(), 1);
    }

    #[test]
    fn test_snapshot() {
        let metrics = RelayMetrics::new();

        metrics.increment_connections();
        metrics.increment_rejected();
        metrics.increment_panics();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_connections, 1);
        assert_eq!(snapshot.rejected_connections, 1);
        assert_eq!(snapshot.panics, 1);
    }

    #[test]
    fn test_snapshot_rates() {
        let snapshot = MetricsSnapshot {
            uptime_secs: 100,
            total_connections: 200,
            active_connections: 10,
            rejected_connections: 30,
            failed_connections: 20,
            panics: 0,
        };

        assert!((snapshot.failure_rate() - 0.25).abs() < 0.01);
        assert!((snapshot.connections_per_second() - 2.0).abs() < 0.01);
    }

    #[test]
    fn test_format_report() {
        let metrics = RelayMetrics::new();
        metrics.increment_connections();

        let report = metrics.format_report();
        assert!(report.contains("portmux Metrics"));
        assert!(report.contains("Total:    1"));
    }
}
