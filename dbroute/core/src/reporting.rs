//! Failure Reporting
//!
//! Slave failures are handed to a [`FailureSink`] before the router retries.
//! Sinks are best effort: whatever they return, and even a panic, is
//! swallowed by the router and only counted in [`RoutingMetrics`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::RouterError;

/// Receiver of slave failure notifications
pub trait FailureSink: Send + Sync {
    /// Called once per failed slave attempt
    fn notify_failure(&self, error: &RouterError, entity: &str, connection: &str)
        -> anyhow::Result<()>;
}

/// Sink that drops every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl FailureSink for NoopSink {
    fn notify_failure(&self, _: &RouterError, _: &str, _: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Sink that logs every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl FailureSink for TracingSink {
    fn notify_failure(
        &self,
        error: &RouterError,
        entity: &str,
        connection: &str,
    ) -> anyhow::Result<()> {
        tracing::warn!(
            entity = entity,
            connection = connection,
            error = %error,
            "Slave query failed"
        );
        Ok(())
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// A monotonically increasing counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a zeroed counter
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Routing counters shared by every execution unit
#[derive(Debug, Default)]
pub struct RoutingMetrics {
    /// Routing blocks entered
    pub connection_switches: Counter,
    /// Attempts made against a slave
    pub slave_attempts: Counter,
    /// Slave attempts that failed with a data-access error
    pub slave_failures: Counter,
    /// Slave calls that ended up on the master
    pub master_fallbacks: Counter,
    /// Sink notifications that errored or panicked
    pub sink_errors: Counter,
}

/// Point-in-time copy of [`RoutingMetrics`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RoutingMetricsSnapshot {
    /// See [`RoutingMetrics::connection_switches`]
    pub connection_switches: u64,
    /// See [`RoutingMetrics::slave_attempts`]
    pub slave_attempts: u64,
    /// See [`RoutingMetrics::slave_failures`]
    pub slave_failures: u64,
    /// See [`RoutingMetrics::master_fallbacks`]
    pub master_fallbacks: u64,
    /// See [`RoutingMetrics::sink_errors`]
    pub sink_errors: u64,
}

impl RoutingMetrics {
    /// Create zeroed metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the current values
    #[must_use]
    pub fn snapshot(&self) -> RoutingMetricsSnapshot {
        RoutingMetricsSnapshot {
            connection_switches: self.connection_switches.get(),
            slave_attempts: self.slave_attempts.get(),
            slave_failures: self.slave_failures.get(),
            master_fallbacks: self.master_fallbacks.get(),
            sink_errors: self.sink_errors.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        counter.inc();
        counter.inc();
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn test_snapshot() {
        let metrics = RoutingMetrics::new();
        metrics.slave_attempts.inc();
        metrics.slave_failures.inc();
        metrics.master_fallbacks.inc();

        let snap = metrics.snapshot();
        assert_eq!(
            snap,
            RoutingMetricsSnapshot {
                slave_attempts: 1,
                slave_failures: 1,
                master_fallbacks: 1,
                ..Default::default()
            }
        );
        assert_eq!(
            serde_json::to_value(snap).unwrap()["master_fallbacks"],
            serde_json::json!(1)
        );
    }

    #[test]
    fn test_builtin_sinks_never_fail() {
        let err = RouterError::data_access("S1", "reset");
        assert!(NoopSink.notify_failure(&err, "Order", "S1").is_ok());
        assert!(TracingSink.notify_failure(&err, "Order", "S1").is_ok());
    }
}
