//! Observability for the notifier.
//!
//! Structured logging setup lives in [`logging`]; delivery counters live here
//! and are shared by the session, connection and delivery layers.

mod logging;

pub use logging::{LogFormat, LoggingConfig};

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Delivery metrics collector.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    emails_sent: AtomicU64,
    emails_failed: AtomicU64,
    connection_attempts: AtomicU64,
    connections_failed: AtomicU64,
    probe_failures: AtomicU64,
    invalidations: AtomicU64,
    retries: AtomicU64,
    tls_upgrades: AtomicU64,
    auth_successes: AtomicU64,
    auth_failures: AtomicU64,
    bytes_sent: AtomicU64,
}

impl DeliveryMetrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful email send.
    pub fn record_send_success(&self) {
        self.emails_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed email send.
    pub fn record_send_failure(&self) {
        self.emails_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a connection attempt.
    pub fn record_connect(&self, success: bool) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.connections_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a failed liveness probe on a cached session.
    pub fn record_probe_failure(&self) {
        self.probe_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a session being dropped after a failure.
    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a retry.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a TLS upgrade.
    pub fn record_tls_upgrade(&self) {
        self.tls_upgrades.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an authentication attempt.
    pub fn record_auth_attempt(&self, success: bool) {
        if success {
            self.auth_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.auth_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records message bytes accepted by the relay.
    pub fn record_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Returns a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            emails_sent: self.emails_sent.load(Ordering::Relaxed),
            emails_failed: self.emails_failed.load(Ordering::Relaxed),
            connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            probe_failures: self.probe_failures.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            tls_upgrades: self.tls_upgrades.load(Ordering::Relaxed),
            auth_successes: self.auth_successes.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Emails accepted by the relay.
    pub emails_sent: u64,
    /// Emails given up on.
    pub emails_failed: u64,
    /// Connection attempts.
    pub connection_attempts: u64,
    /// Connection attempts that failed.
    pub connections_failed: u64,
    /// Cached sessions that failed the NOOP probe.
    pub probe_failures: u64,
    /// Sessions dropped after a failure.
    pub invalidations: u64,
    /// Retries.
    pub retries: u64,
    /// STARTTLS upgrades.
    pub tls_upgrades: u64,
    /// Successful authentications.
    pub auth_successes: u64,
    /// Failed authentications.
    pub auth_failures: u64,
    /// Message bytes accepted by the relay.
    pub bytes_sent: u64,
}

impl MetricsSnapshot {
    /// Returns the email success rate.
    pub fn success_rate(&self) -> f64 {
        let total = self.emails_sent + self.emails_failed;
        if total == 0 {
            1.0
        } else {
            self.emails_sent as f64 / total as f64
        }
    }

    /// Returns the connection success rate.
    pub fn connection_success_rate(&self) -> f64 {
        if self.connection_attempts == 0 {
            1.0
        } else {
            (self.connection_attempts - self.connections_failed) as f64
                / self.connection_attempts as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics() {
        let metrics = DeliveryMetrics::new();

        metrics.record_send_success();
        metrics.record_send_success();
        metrics.record_send_failure();
        metrics.record_bytes_sent(120);
        metrics.record_bytes_sent(30);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.emails_sent, 2);
        assert_eq!(snapshot.emails_failed, 1);
        assert_eq!(snapshot.bytes_sent, 150);
        assert!((snapshot.success_rate() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_connection_rates() {
        let metrics = DeliveryMetrics::new();
        assert_eq!(metrics.snapshot().connection_success_rate(), 1.0);

        metrics.record_connect(true);
        metrics.record_connect(false);
        metrics.record_connect(true);
        metrics.record_connect(true);
        metrics.record_auth_attempt(true);
        metrics.record_auth_attempt(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connection_attempts, 4);
        assert_eq!(snapshot.connections_failed, 1);
        assert_eq!(snapshot.connection_success_rate(), 0.75);
        assert_eq!(snapshot.auth_successes, 1);
        assert_eq!(snapshot.auth_failures, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = DeliveryMetrics::new();
        metrics.record_retry();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["retries"], 1);
        assert_eq!(json["emails_sent"], 0);
    }
}
