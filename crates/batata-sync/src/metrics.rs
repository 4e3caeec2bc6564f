//! Prometheus metrics for coordination primitives
//!
//! Each [`crate::Sync`] owns a [`SyncMetrics`] with its own registry, so
//! several clients can live in one process without name clashes.
//! - Acquire attempts and latency, by primitive kind (histogram, counter)
//! - Holders that lost their key (counter)
//! - Session heartbeat failures and lease renewals (counter)

use std::time::Instant;

use prometheus::{
    Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Primitive label value for elections.
pub const KIND_LEADER: &str = "leader";
/// Primitive label value for mutexes.
pub const KIND_LOCK: &str = "lock";

/// Prometheus metrics collector
pub struct SyncMetrics {
    registry: Registry,

    /// Acquire attempts by kind and result
    pub acquire_total: CounterVec,

    /// Time from campaign/lock start to holding, by kind
    pub acquire_latency: HistogramVec,

    /// Holders that lost their key without resigning
    pub holder_lost_total: CounterVec,

    pub heartbeat_failures_total: Counter,

    pub session_renewed_total: Counter,
}

impl SyncMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let acquire_total = CounterVec::new(
            Opts::new(
                "batata_sync_acquire_total",
                "Total number of leader campaigns and lock acquisitions",
            ),
            &["kind", "result"],
        )?;
        registry.register(Box::new(acquire_total.clone()))?;

        let acquire_latency = HistogramVec::new(
            HistogramOpts::new(
                "batata_sync_acquire_latency_seconds",
                "Time spent waiting to become leader or lock owner",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0,
            ]),
            &["kind"],
        )?;
        registry.register(Box::new(acquire_latency.clone()))?;

        let holder_lost_total = CounterVec::new(
            Opts::new(
                "batata_sync_holder_lost_total",
                "Total number of leaders or lock owners that lost their status",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(holder_lost_total.clone()))?;

        let heartbeat_failures_total = Counter::new(
            "batata_sync_heartbeat_failures_total",
            "Total number of failed session heartbeats",
        )?;
        registry.register(Box::new(heartbeat_failures_total.clone()))?;

        let session_renewed_total = Counter::new(
            "batata_sync_session_renewed_total",
            "Total number of sessions re-established after lease expiry",
        )?;
        registry.register(Box::new(session_renewed_total.clone()))?;

        Ok(Self {
            registry,
            acquire_total,
            acquire_latency,
            holder_lost_total,
            heartbeat_failures_total,
            session_renewed_total,
        })
    }

    /// Record the outcome of one acquire attempt
    pub fn record_acquire(&self, kind: &str, result: &str, started: Instant) {
        self.acquire_total.with_label_values(&[kind, result]).inc();
        if result == "success" {
            self.acquire_latency
                .with_label_values(&[kind])
                .observe(started.elapsed().as_secs_f64());
        }
    }

    pub fn record_holder_lost(&self, kind: &str) {
        self.holder_lost_total.with_label_values(&[kind]).inc();
    }

    pub fn record_heartbeat_failure(&self) {
        self.heartbeat_failures_total.inc();
    }

    pub fn record_session_renewed(&self) {
        self.session_renewed_total.inc();
    }

    /// Get metrics in Prometheus text format
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Result label for an acquire error.
pub fn result_label(err: &crate::SyncError) -> &'static str {
    use crate::SyncError;

    match err {
        SyncError::Cancelled(_) => "cancelled",
        SyncError::Locked(_) => "locked",
        SyncError::Closed => "closed",
        _ => "error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelReason;

    #[test]
    fn test_metrics_are_per_instance() {
        let a = SyncMetrics::new().unwrap();
        let b = SyncMetrics::new().unwrap();

        a.record_acquire(KIND_LOCK, "success", Instant::now());
        a.record_holder_lost(KIND_LEADER);

        let text = a.gather();
        assert!(text.contains("batata_sync_acquire_total{kind=\"lock\",result=\"success\"} 1"));
        assert!(text.contains("batata_sync_holder_lost_total{kind=\"leader\"} 1"));
        assert!(!b.gather().contains("kind=\"lock\""));
    }

    #[test]
    fn test_session_counters() {
        let metrics = SyncMetrics::new().unwrap();
        metrics.record_heartbeat_failure();
        metrics.record_heartbeat_failure();
        metrics.record_session_renewed();

        assert_eq!(metrics.heartbeat_failures_total.get(), 2.0);
        assert_eq!(metrics.session_renewed_total.get(), 1.0);
    }

    #[test]
    fn test_result_label() {
        assert_eq!(
            result_label(&crate::SyncError::Cancelled(CancelReason::Cancelled)),
            "cancelled"
        );
        assert_eq!(result_label(&crate::SyncError::Closed), "closed");
        assert_eq!(
            result_label(&crate::SyncError::Transport("x".to_string())),
            "error"
        );
    }
}
