//! Connections and the Connection Factory
//!
//! The router never owns database connections. It names them with a
//! [`ConnectionDescriptor`], asks a [`ConnectionFactory`] to resolve the
//! descriptor into a live [`ConnectionHandle`], and borrows that handle for
//! the duration of one routing block.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{RouterError, RouterResult};

/// Name of the symbolic master connection used for remapping lookups
pub const MASTER_CONNECTION_NAME: &str = "master";

// ============================================================================
// Connection Descriptor
// ============================================================================

/// Opaque reference to a physical connection
///
/// `name` identifies the connection for failure tracking and remapping;
/// `target` is whatever the connection factory needs to reach it (a config
/// key, a DSN). Two descriptors are equal when both fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    name: String,
    target: String,
}

impl ConnectionDescriptor {
    /// Descriptor whose factory target is its own name
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            target: name.clone(),
            name,
        }
    }

    /// Descriptor with a distinct factory target
    pub fn with_target(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
        }
    }

    /// Connection name (failure tracker key)
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Factory target
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&str> for ConnectionDescriptor {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

// ============================================================================
// Connection Handle
// ============================================================================

/// A live connection as seen by the router
pub trait Connection: Send + Sync + fmt::Debug {
    /// Connection name, matching the descriptor it was resolved from
    fn name(&self) -> &str;

    /// Number of transactions currently open on this connection
    fn open_transactions(&self) -> usize {
        0
    }
}

/// Shared handle to a live connection
pub type ConnectionHandle = Arc<dyn Connection>;

/// Resolves descriptors into live connections
pub trait ConnectionFactory: Send + Sync {
    /// Resolve `descriptor` into a connection handle
    ///
    /// With `must_exist` set the factory must not establish a new
    /// connection and fails with [`RouterError::ConnectionNotAvailable`]
    /// instead.
    fn resolve(
        &self,
        descriptor: &ConnectionDescriptor,
        must_exist: bool,
    ) -> RouterResult<ConnectionHandle>;
}

// ============================================================================
// Lazy Connection Factory
// ============================================================================

type Connector = dyn Fn(&ConnectionDescriptor) -> RouterResult<ConnectionHandle> + Send + Sync;

/// Factory that caches one handle per connection name
///
/// Handles are created on first use through the connector closure unless
/// the caller requires the connection to exist already.
pub struct LazyConnectionFactory {
    connections: DashMap<String, ConnectionHandle>,
    connector: Box<Connector>,
}

impl LazyConnectionFactory {
    /// Create a factory around a connector
    pub fn new<F>(connector: F) -> Self
    where
        F: Fn(&ConnectionDescriptor) -> RouterResult<ConnectionHandle> + Send + Sync + 'static,
    {
        Self {
            connections: DashMap::new(),
            connector: Box::new(connector),
        }
    }

    /// Establish a connection ahead of first use
    pub fn establish(&self, descriptor: &ConnectionDescriptor) -> RouterResult<ConnectionHandle> {
        self.resolve(descriptor, false)
    }

    /// Drop the cached handle for `name`
    pub fn disconnect(&self, name: &str) -> Option<ConnectionHandle> {
        let removed = self.connections.remove(name).map(|(_, handle)| handle);
        if removed.is_some() {
            tracing::debug!(connection = name, "Connection dropped from factory");
        }
        removed
    }

    /// Whether a connection named `name` is established
    #[must_use]
    pub fn is_established(&self, name: &str) -> bool {
        self.connections.contains_key(name)
    }

    /// Number of established connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is established
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl ConnectionFactory for LazyConnectionFactory {
    fn resolve(
        &self,
        descriptor: &ConnectionDescriptor,
        must_exist: bool,
    ) -> RouterResult<ConnectionHandle> {
        if let Some(handle) = self.connections.get(descriptor.name()) {
            return Ok(Arc::clone(handle.value()));
        }
        if must_exist {
            return Err(RouterError::connection_not_available(descriptor.name()));
        }

        // connect without holding a shard lock; the first insert wins a race
        let handle = (self.connector)(descriptor)?;
        let cached = self
            .connections
            .entry(descriptor.name().to_string())
            .or_insert_with(|| {
                tracing::debug!(
                    connection = %descriptor,
                    target = descriptor.target(),
                    "Connection established"
                );
                handle
            });
        Ok(Arc::clone(cached.value()))
    }
}

impl fmt::Debug for LazyConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyConnectionFactory")
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}
