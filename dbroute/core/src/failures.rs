//! Failure Tracker
//!
//! Remembers when each slave last failed so that every caller steers away
//! from it for the eligibility window. This is not a health check: nothing
//! probes the replica, the tracker only records failures reported by the
//! router's retry loop. Records are never deleted, a new failure overwrites
//! the previous timestamp and an old one simply stops mattering.

use std::collections::HashMap;

use dashmap::DashMap;

use crate::connection::ConnectionDescriptor;
use crate::routing::selection;

/// Seconds a failed slave stays out of rotation
pub const DEFAULT_ELIGIBILITY_WINDOW_SECS: u64 = 15;

/// Last-failure timestamps per entity and connection name
#[derive(Debug)]
pub struct FailureTracker {
    window_secs: u64,
    failures: DashMap<String, HashMap<String, u64>>,
}

impl Default for FailureTracker {
    fn default() -> Self {
        Self::new(DEFAULT_ELIGIBILITY_WINDOW_SECS)
    }
}

impl FailureTracker {
    /// Create a tracker with the given eligibility window
    #[must_use]
    pub fn new(window_secs: u64) -> Self {
        Self {
            window_secs,
            failures: DashMap::new(),
        }
    }

    /// Eligibility window in seconds
    #[must_use]
    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    /// Record a failure of `connection` at `at` (epoch seconds)
    pub fn record_failure(&self, entity: &str, connection: &str, at: u64) {
        self.failures
            .entry(entity.to_string())
            .or_default()
            .insert(connection.to_string(), at);
    }

    /// Last recorded failure of `connection`
    #[must_use]
    pub fn last_failure(&self, entity: &str, connection: &str) -> Option<u64> {
        self.failures
            .get(entity)
            .and_then(|m| m.get(connection).copied())
    }

    /// Whether `connection` may be selected at `at`
    ///
    /// A failure at `T` excludes the connection for `[T, T + window)`.
    #[must_use]
    pub fn is_eligible(&self, entity: &str, connection: &str, at: u64) -> bool {
        match self.last_failure(entity, connection) {
            None => true,
            Some(failed_at) => self.expired(failed_at, at),
        }
    }

    fn expired(&self, failed_at: u64, at: u64) -> bool {
        at >= failed_at && at - failed_at >= self.window_secs
    }

    /// The subset of `slaves` eligible at `at`, in configuration order
    #[must_use]
    pub fn eligible_slaves(
        &self,
        entity: &str,
        slaves: &[ConnectionDescriptor],
        at: u64,
    ) -> Vec<ConnectionDescriptor> {
        let Some(failures) = self.failures.get(entity) else {
            return slaves.to_vec();
        };
        slaves
            .iter()
            .filter(|s| match failures.get(s.name()) {
                None => true,
                Some(&failed_at) => self.expired(failed_at, at),
            })
            .cloned()
            .collect()
    }

    /// A uniformly random eligible slave
    #[must_use]
    pub fn random_live_slave(
        &self,
        entity: &str,
        slaves: &[ConnectionDescriptor],
        at: u64,
    ) -> Option<ConnectionDescriptor> {
        selection::pick_random(&self.eligible_slaves(entity, slaves, at)).cloned()
    }
}
