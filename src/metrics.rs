//! Basic Metrics
//!
//! Dispatch counters, fan-out outcomes and latency tracking.

use hashbrown::HashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Metrics collector
#[derive(Debug)]
pub struct Metrics {
    /// Total dispatched actions
    total_ops: AtomicU64,

    /// Actions per command name
    ops_by_command: RwLock<HashMap<String, u64>>,

    /// Actions that returned an error
    failed_ops: AtomicU64,
    auth_failures: AtomicU64,

    key_changes: AtomicU64,
    deliveries: AtomicU64,
    delivery_timeouts: AtomicU64,
    peer_events: AtomicU64,

    /// Latency tracking (simplified)
    latency_sum_us: AtomicU64,
    latency_count: AtomicU64,
    latency_min_us: AtomicU64,
    latency_max_us: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            total_ops: AtomicU64::new(0),
            ops_by_command: RwLock::new(HashMap::new()),
            failed_ops: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            key_changes: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            delivery_timeouts: AtomicU64::new(0),
            peer_events: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            latency_min_us: AtomicU64::new(u64::MAX),
            latency_max_us: AtomicU64::new(0),
        }
    }

    /// Record one dispatched action
    pub fn record_operation(&self, command: &str, latency: Duration, failed: bool) {
        self.total_ops.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failed_ops.fetch_add(1, Ordering::Relaxed);
        }

        *self
            .ops_by_command
            .write()
            .entry(command.to_string())
            .or_insert(0) += 1;

        let latency_us = latency.as_micros() as u64;
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        self.latency_min_us.fetch_min(latency_us, Ordering::Relaxed);
        self.latency_max_us.fetch_max(latency_us, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_key_change(&self) {
        self.key_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deliveries(&self, delivered: u64, timed_out: u64) {
        self.deliveries.fetch_add(delivered, Ordering::Relaxed);
        self.delivery_timeouts.fetch_add(timed_out, Ordering::Relaxed);
    }

    pub fn record_peer_event(&self) {
        self.peer_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_ops(&self) -> u64 {
        self.total_ops.load(Ordering::Relaxed)
    }

    pub fn failed_ops(&self) -> u64 {
        self.failed_ops.load(Ordering::Relaxed)
    }

    pub fn auth_failures(&self) -> u64 {
        self.auth_failures.load(Ordering::Relaxed)
    }

    pub fn key_changes(&self) -> u64 {
        self.key_changes.load(Ordering::Relaxed)
    }

    pub fn deliveries(&self) -> u64 {
        self.deliveries.load(Ordering::Relaxed)
    }

    pub fn delivery_timeouts(&self) -> u64 {
        self.delivery_timeouts.load(Ordering::Relaxed)
    }

    pub fn peer_events(&self) -> u64 {
        self.peer_events.load(Ordering::Relaxed)
    }

    pub fn ops_by_command(&self) -> HashMap<String, u64> {
        self.ops_by_command.read().clone()
    }

    /// Average latency in microseconds
    pub fn avg_latency_us(&self) -> f64 {
        let count = self.latency_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let sum = self.latency_sum_us.load(Ordering::Relaxed);
        sum as f64 / count as f64
    }

    pub fn min_latency_us(&self) -> u64 {
        let min = self.latency_min_us.load(Ordering::Relaxed);
        if min == u64::MAX {
            0
        } else {
            min
        }
    }

    pub fn max_latency_us(&self) -> u64 {
        self.latency_max_us.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> String {
        format!(
            "Operations: {} (failed {}, auth {}) | Changes: {} | Deliveries: {} (timeouts {}) | Peer events: {} | Latency (µs): avg={:.1}, min={}, max={}",
            self.total_ops(),
            self.failed_ops(),
            self.auth_failures(),
            self.key_changes(),
            self.deliveries(),
            self.delivery_timeouts(),
            self.peer_events(),
            self.avg_latency_us(),
            self.min_latency_us(),
            self.max_latency_us()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_operations() {
        let metrics = Metrics::new();
        metrics.record_operation("SET", Duration::from_micros(100), false);
        metrics.record_operation("SET", Duration::from_micros(300), true);
        metrics.record_operation("GET", Duration::from_micros(200), false);

        assert_eq!(metrics.total_ops(), 3);
        assert_eq!(metrics.failed_ops(), 1);
        assert_eq!(metrics.ops_by_command().get("SET"), Some(&2));
        assert_eq!(metrics.min_latency_us(), 100);
        assert_eq!(metrics.max_latency_us(), 300);
        assert!((metrics.avg_latency_us() - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_latency() {
        let metrics = Metrics::new();
        assert_eq!(metrics.min_latency_us(), 0);
        assert_eq!(metrics.avg_latency_us(), 0.0);
        assert!(metrics.summary().starts_with("Operations: 0"));
    }
}
