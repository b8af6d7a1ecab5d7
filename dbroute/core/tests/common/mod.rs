//! Shared fakes for the routing integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use dbroute_core::{
    Clock, Connection, ConnectionDescriptor, ConnectionFactory, ConnectionHandle, EntityConfig,
    ManualClock, NoopSink, Router, RouterConfig, RouterError, RouterResult,
};

// =============================================================================
// Connections
// =============================================================================

/// Connection with a settable open-transaction count
#[derive(Debug)]
pub struct FakeConnection {
    name: String,
    open_transactions: AtomicUsize,
}

impl FakeConnection {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            open_transactions: AtomicUsize::new(0),
        }
    }

    pub fn begin(&self) {
        self.open_transactions.fetch_add(1, Ordering::SeqCst);
    }

    pub fn commit(&self) {
        self.open_transactions.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Connection for FakeConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn open_transactions(&self) -> usize {
        self.open_transactions.load(Ordering::SeqCst)
    }
}

/// Factory that creates connections on demand and records every resolve
#[derive(Default)]
pub struct RecordingFactory {
    connections: DashMap<String, Arc<FakeConnection>>,
    resolves: Mutex<Vec<String>>,
}

impl RecordingFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Establish `name` ahead of use
    pub fn establish(&self, name: &str) -> Arc<FakeConnection> {
        Arc::clone(
            &self
                .connections
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(FakeConnection::new(name))),
        )
    }

    pub fn resolves(&self) -> Vec<String> {
        self.resolves.lock().clone()
    }

    pub fn resolve_count(&self) -> usize {
        self.resolves.lock().len()
    }
}

impl ConnectionFactory for RecordingFactory {
    fn resolve(
        &self,
        descriptor: &ConnectionDescriptor,
        must_exist: bool,
    ) -> RouterResult<ConnectionHandle> {
        self.resolves.lock().push(descriptor.name().to_string());
        if must_exist && !self.connections.contains_key(descriptor.name()) {
            return Err(RouterError::connection_not_available(descriptor.name()));
        }
        let connection: ConnectionHandle = self.establish(descriptor.name());
        Ok(connection)
    }
}

// =============================================================================
// Routers
// =============================================================================

/// Router over a recording factory, a manual clock at t=0, and a silent sink
pub struct Harness {
    pub router: Router,
    pub factory: Arc<RecordingFactory>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    pub fn with_config(config: RouterConfig) -> Self {
        let factory = RecordingFactory::new();
        let clock = Arc::new(ManualClock::new(0));
        let router = Router::builder(factory.clone())
            .with_clock(clock.clone() as Arc<dyn Clock>)
            .with_sink(Arc::new(NoopSink))
            .with_config(config)
            .build();
        Self {
            router,
            factory,
            clock,
        }
    }

    /// Configure `Order` with master `M` and the given slaves
    pub fn order(self, slaves: &[&str]) -> Self {
        self.router
            .configure(
                "Order",
                EntityConfig::new("M").with_slaves(slaves.iter().copied()),
            )
            .unwrap();
        self
    }
}

/// Name of the connection a unit of work ran on
pub fn ran_on(conn: &ConnectionHandle) -> RouterResult<String> {
    Ok(conn.name().to_string())
}

/// Unit of work failing with a data-access error on the listed connections
pub fn failing_on(
    failing: &[&str],
) -> impl FnMut(&ConnectionHandle) -> RouterResult<String> {
    let failing: HashSet<String> = failing.iter().map(|s| (*s).to_string()).collect();
    move |conn| {
        if failing.contains(conn.name()) {
            Err(RouterError::data_access(conn.name(), "connection reset"))
        } else {
            Ok(conn.name().to_string())
        }
    }
}
