//! Delivery metrics
//!
//! The collector is shared by the router, request coordinator, state store
//! and sync manager via `Arc`; `snapshot()` produces a plain struct that the
//! broker augments with live registry sizes.

use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::lock_unpoisoned;

/// Point-in-time broker metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct BrokerMetrics {
    /// Messages accepted for routing (send/broadcast/request envelopes)
    pub messages_sent: u64,
    /// Handler invocations that completed successfully
    pub messages_delivered: u64,
    /// Handler invocations that returned an error
    pub handler_errors: u64,
    /// Requests that settled by timeout
    pub request_timeouts: u64,
    /// Rolling average dispatch latency in milliseconds
    pub avg_latency_ms: f64,
    /// Currently registered widgets
    pub registered_widgets: usize,
    /// Currently existing channels
    pub channels: usize,
    /// Requests awaiting a response
    pub pending_requests: usize,
    /// Currently existing sync groups
    pub sync_groups: usize,
}

#[derive(Debug, Default)]
struct Counters {
    sent: u64,
    delivered: u64,
    errors: u64,
    timeouts: u64,
    avg_latency_ms: f64,
    latency_samples: u64,
}

/// Shared counter set with a rolling average latency
#[derive(Debug, Default)]
pub struct MetricsCollector {
    inner: Mutex<Counters>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        lock_unpoisoned(&self.inner).sent += 1;
    }

    pub fn record_delivered(&self) {
        lock_unpoisoned(&self.inner).delivered += 1;
    }

    pub fn record_handler_error(&self) {
        lock_unpoisoned(&self.inner).errors += 1;
    }

    pub fn record_timeout(&self) {
        lock_unpoisoned(&self.inner).timeouts += 1;
    }

    /// Fold one dispatch duration into the running average (incremental mean)
    pub fn record_latency(&self, elapsed: Duration) {
        let mut inner = lock_unpoisoned(&self.inner);
        inner.latency_samples += 1;
        let sample = elapsed.as_secs_f64() * 1000.0;
        inner.avg_latency_ms += (sample - inner.avg_latency_ms) / inner.latency_samples as f64;
    }

    /// Snapshot the counters; registry sizes are filled in by the broker
    pub fn snapshot(&self) -> BrokerMetrics {
        let inner = lock_unpoisoned(&self.inner);
        BrokerMetrics {
            messages_sent: inner.sent,
            messages_delivered: inner.delivered,
            handler_errors: inner.errors,
            request_timeouts: inner.timeouts,
            avg_latency_ms: inner.avg_latency_ms,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = MetricsCollector::new();
        metrics.record_sent();
        metrics.record_sent();
        metrics.record_delivered();
        metrics.record_handler_error();
        metrics.record_timeout();

        let snap = metrics.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.messages_delivered, 1);
        assert_eq!(snap.handler_errors, 1);
        assert_eq!(snap.request_timeouts, 1);
    }

    #[test]
    fn test_rolling_average_latency() {
        let metrics = MetricsCollector::new();
        metrics.record_latency(Duration::from_millis(10));
        metrics.record_latency(Duration::from_millis(20));
        metrics.record_latency(Duration::from_millis(30));

        let snap = metrics.snapshot();
        assert!((snap.avg_latency_ms - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = MetricsCollector::new().snapshot();
        assert_eq!(snap.messages_sent, 0);
        assert_eq!(snap.avg_latency_ms, 0.0);
    }
}
