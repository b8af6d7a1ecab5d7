//! Router
//!
//! Runs units of work on the master or on a slave of an entity. Every routing
//! block pushes the chosen connection onto the caller's execution context and
//! restores the previous one on exit, whatever the exit path.
//!
//! # Slave failover
//!
//! ```text
//! candidate = preferred | random eligible slave | (none -> master)
//! loop:
//!     run on candidate
//!     ok                  -> return
//!     non data-access err -> propagate
//!     data-access err     -> notify sink, record failure,
//!                            candidate = random eligible untried slave
//!                            (none left -> master, no further retries)
//! ```
//!
//! Each failed slave leaves the candidate set, so a call makes at most
//! `slaves + 1` attempts.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::{RouterConfig, RoutingFile};
use crate::connection::{
    ConnectionDescriptor, ConnectionFactory, ConnectionHandle, MASTER_CONNECTION_NAME,
};
use crate::context::{self, ContextGuard};
use crate::error::{RouterError, RouterResult};
use crate::failures::FailureTracker;
use crate::registry::{EntityConfig, EntityRegistry};
use crate::reporting::{FailureSink, RoutingMetrics, TracingSink};

use super::proxy::DeferredCall;
use super::selection;

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Router`]
pub struct RouterBuilder {
    factory: Arc<dyn ConnectionFactory>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn FailureSink>,
    config: RouterConfig,
}

impl RouterBuilder {
    /// Use `clock` for failure timestamps
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Send slave failures to `sink`
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Router-wide settings
    #[must_use]
    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the router
    #[must_use]
    pub fn build(self) -> Router {
        Router {
            inner: Arc::new(RouterInner {
                registry: EntityRegistry::new(),
                failures: FailureTracker::new(self.config.eligibility_window_secs),
                factory: self.factory,
                clock: self.clock,
                sink: self.sink,
                metrics: RoutingMetrics::new(),
                connections_should_exist: self.config.connections_should_exist,
                force_slave_reads: AtomicBool::new(self.config.force_slave_reads),
            }),
        }
    }
}

// ============================================================================
// Router
// ============================================================================

struct RouterInner {
    registry: EntityRegistry,
    failures: FailureTracker,
    factory: Arc<dyn ConnectionFactory>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn FailureSink>,
    metrics: RoutingMetrics,
    connections_should_exist: bool,
    force_slave_reads: AtomicBool,
}

/// Connection router
///
/// Cheap to clone; clones share the registry, failure history, and metrics.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("entities", &self.inner.registry.entities())
            .field("window_secs", &self.inner.failures.window_secs())
            .field("connections_should_exist", &self.inner.connections_should_exist)
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Start building a router around a connection factory
    #[must_use]
    pub fn builder(factory: Arc<dyn ConnectionFactory>) -> RouterBuilder {
        RouterBuilder {
            factory,
            clock: Arc::new(SystemClock),
            sink: Arc::new(TracingSink),
            config: RouterConfig::default(),
        }
    }

    /// Router with default settings
    #[must_use]
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self::builder(factory).build()
    }

    /// Router configured from a routing file
    pub fn from_config(factory: Arc<dyn ConnectionFactory>, file: &RoutingFile) -> RouterResult<Self> {
        let router = Self::builder(factory)
            .with_config(file.router.clone())
            .build();
        router.apply_config(file)?;
        Ok(router)
    }

    /// Configure every entity of `file` and adopt its forcing default
    ///
    /// Nothing is applied when any entity fails validation. The eligibility
    /// window and `connections_should_exist` are fixed when the router is
    /// built.
    pub fn apply_config(&self, file: &RoutingFile) -> RouterResult<()> {
        let configs = file.entity_configs()?;
        for (entity, config) in configs {
            self.configure(&entity, config)?;
        }
        self.set_force_slave_reads(file.router.force_slave_reads);
        Ok(())
    }

    /// Entity registry
    #[must_use]
    pub fn registry(&self) -> &EntityRegistry {
        &self.inner.registry
    }

    /// Failure tracker
    #[must_use]
    pub fn failures(&self) -> &FailureTracker {
        &self.inner.failures
    }

    /// Routing counters
    #[must_use]
    pub fn metrics(&self) -> &RoutingMetrics {
        &self.inner.metrics
    }

    /// Replace the configuration of `entity`
    pub fn configure(&self, entity: &str, config: EntityConfig) -> RouterResult<()> {
        Ok(self.inner.registry.configure(entity, config)?)
    }

    /// Slaves of `entity` eligible right now
    #[must_use]
    pub fn eligible_slaves(&self, entity: &str) -> Vec<ConnectionDescriptor> {
        let slaves = self.inner.registry.slaves(entity);
        self.inner
            .failures
            .eligible_slaves(entity, &slaves, self.inner.clock.now())
    }

    // ------------------------------------------------------------------------
    // Slave-read forcing
    // ------------------------------------------------------------------------

    /// Set the process-wide slave-read forcing default
    pub fn set_force_slave_reads(&self, force: bool) {
        self.inner.force_slave_reads.store(force, Ordering::SeqCst);
    }

    /// Process-wide slave-read forcing default
    #[must_use]
    pub fn force_slave_reads_default(&self) -> bool {
        self.inner.force_slave_reads.load(Ordering::SeqCst)
    }

    /// Effective slave-read forcing for `entity` in the caller's context
    ///
    /// A context override wins; otherwise the entity flag or the
    /// process-wide default enables forcing.
    #[must_use]
    pub fn force_slave_reads(&self, entity: &str) -> bool {
        context::force_slave_reads_override(entity).unwrap_or_else(|| {
            self.inner.registry.force_slave_reads(entity) || self.force_slave_reads_default()
        })
    }

    /// Run `f` with the caller's forcing override for `entity` set to `force`
    pub fn with_forced_slave_reads<R>(&self, entity: &str, force: bool, f: impl FnOnce() -> R) -> R {
        let _restore = OverrideRestore {
            previous: context::set_force_slave_reads_override(entity, Some(force)),
            entity: entity.to_string(),
        };
        f()
    }

    /// Run `f` with `table` as the caller's remapping table
    pub fn with_remappings<R>(
        &self,
        table: HashMap<String, ConnectionDescriptor>,
        f: impl FnOnce() -> RouterResult<R>,
    ) -> RouterResult<R> {
        let _restore = RemappingRestore {
            previous: Some(context::set_remappings(table)?),
        };
        f()
    }

    // ------------------------------------------------------------------------
    // Routing blocks
    // ------------------------------------------------------------------------

    /// Resolve `connection` and make it the active connection of `entity`
    fn enter(
        &self,
        entity: &str,
        connection: &ConnectionDescriptor,
        must_exist: bool,
    ) -> RouterResult<(ContextGuard, ConnectionHandle)> {
        let handle = self.inner.factory.resolve(connection, must_exist)?;
        let guard = ContextGuard::push(entity, Arc::clone(&handle));
        self.inner.metrics.connection_switches.inc();
        tracing::debug!(
            entity = entity,
            connection = %connection,
            depth = guard.previous_depth() + 1,
            "Switched connection"
        );
        Ok((guard, handle))
    }

    /// Run `f` on `connection`
    ///
    /// The previous active connection and depth of `entity` are restored
    /// before this returns, including when `f` fails or panics.
    pub fn with_connection<T, F>(
        &self,
        entity: &str,
        connection: &ConnectionDescriptor,
        f: F,
    ) -> RouterResult<T>
    where
        F: FnOnce(&ConnectionHandle) -> RouterResult<T>,
    {
        self.with_connection_checked(entity, connection, self.inner.connections_should_exist, f)
    }

    fn with_connection_checked<T, F>(
        &self,
        entity: &str,
        connection: &ConnectionDescriptor,
        must_exist: bool,
        f: F,
    ) -> RouterResult<T>
    where
        F: FnOnce(&ConnectionHandle) -> RouterResult<T>,
    {
        let (_guard, handle) = self.enter(entity, connection, must_exist)?;
        f(&handle)
    }

    /// Master descriptor to use, and whether it must already exist
    ///
    /// Only the outermost block of an entity consults the remapping table.
    fn master_target(&self, entity: &str) -> RouterResult<(ConnectionDescriptor, bool)> {
        if context::is_top_level(entity) {
            let name = context::active_connection(entity)
                .map_or_else(|| MASTER_CONNECTION_NAME.to_string(), |c| c.name().to_string());
            if let Some(remapped) = context::remapping_for(&name) {
                tracing::debug!(entity = entity, from = %name, to = %remapped, "Master remapped");
                return Ok((remapped, true));
            }
        }
        let master = self
            .inner
            .registry
            .master(entity)
            .ok_or_else(|| RouterError::unknown_entity(entity))?;
        Ok((master, self.inner.connections_should_exist))
    }

    /// Run `f` on the master of `entity`
    pub fn with_master<T, F>(&self, entity: &str, f: F) -> RouterResult<T>
    where
        F: FnOnce(&ConnectionHandle) -> RouterResult<T>,
    {
        let (master, must_exist) = self.master_target(entity)?;
        self.with_connection_checked(entity, &master, must_exist, f)
    }

    /// Run `f` on a random eligible slave, failing over on data-access errors
    ///
    /// `f` is called again for every retry.
    pub fn with_slave<T, F>(&self, entity: &str, f: F) -> RouterResult<T>
    where
        F: FnMut(&ConnectionHandle) -> RouterResult<T>,
    {
        self.with_slave_on(entity, None, f)
    }

    /// [`with_slave`](Self::with_slave) starting from `preferred` when given
    pub fn with_slave_on<T, F>(
        &self,
        entity: &str,
        preferred: Option<&ConnectionDescriptor>,
        mut f: F,
    ) -> RouterResult<T>
    where
        F: FnMut(&ConnectionHandle) -> RouterResult<T>,
    {
        let mut attempts = SlaveAttempts::start(self, entity, preferred)?;
        loop {
            let Some(slave) = attempts.next.take() else {
                self.note_master_fallback(entity);
                return self.with_master(entity, f);
            };
            self.inner.metrics.slave_attempts.inc();
            match self.with_connection(entity, &slave, &mut f) {
                Err(error) if error.is_retryable() => attempts.failed(self, &slave, &error),
                result => return result,
            }
        }
    }

    /// Route to a slave only for outermost, non-transactional, forced reads
    ///
    /// Otherwise `f` runs on the connection already active for `entity`
    /// (the master when none is).
    pub fn first_level_on_slave<T, F>(&self, entity: &str, mut f: F) -> RouterResult<T>
    where
        F: FnMut(&ConnectionHandle) -> RouterResult<T>,
    {
        match self.first_level_decision(entity)? {
            FirstLevel::Slave => self.with_slave(entity, f),
            FirstLevel::Current(handle) => f(&handle),
        }
    }

    fn first_level_decision(&self, entity: &str) -> RouterResult<FirstLevel> {
        if let Some(active) = context::active_connection(entity) {
            return Ok(FirstLevel::Current(active));
        }
        // the same connection with_master would run on, remapping included
        let (master, must_exist) = self.master_target(entity)?;
        let master = self.inner.factory.resolve(&master, must_exist)?;

        let route = context::is_top_level(entity)
            && master.open_transactions() == 0
            && self.force_slave_reads(entity)
            && !self.inner.registry.slaves(entity).is_empty();
        Ok(if route {
            FirstLevel::Slave
        } else {
            FirstLevel::Current(master)
        })
    }

    // ------------------------------------------------------------------------
    // Async routing blocks
    // ------------------------------------------------------------------------

    /// Async [`with_connection`](Self::with_connection)
    ///
    /// Runs in its own child of the caller's context, so blocks polled
    /// concurrently in one task do not interleave their nesting. Dropping the
    /// returned future restores the previous connection as well.
    pub async fn with_connection_async<T, F, Fut>(
        &self,
        entity: &str,
        connection: &ConnectionDescriptor,
        f: F,
    ) -> RouterResult<T>
    where
        F: FnOnce(ConnectionHandle) -> Fut,
        Fut: Future<Output = RouterResult<T>>,
    {
        let must_exist = self.inner.connections_should_exist;
        context::fork(self.run_async(entity, connection, must_exist, f)).await
    }

    async fn run_async<T, F, Fut>(
        &self,
        entity: &str,
        connection: &ConnectionDescriptor,
        must_exist: bool,
        f: F,
    ) -> RouterResult<T>
    where
        F: FnOnce(ConnectionHandle) -> Fut,
        Fut: Future<Output = RouterResult<T>>,
    {
        let (_guard, handle) = self.enter(entity, connection, must_exist)?;
        f(handle).await
    }

    /// Async [`with_master`](Self::with_master)
    pub async fn with_master_async<T, F, Fut>(&self, entity: &str, f: F) -> RouterResult<T>
    where
        F: FnOnce(ConnectionHandle) -> Fut,
        Fut: Future<Output = RouterResult<T>>,
    {
        context::fork(async move {
            let (master, must_exist) = self.master_target(entity)?;
            self.run_async(entity, &master, must_exist, f).await
        })
        .await
    }

    /// Async [`with_slave`](Self::with_slave)
    pub async fn with_slave_async<T, F, Fut>(&self, entity: &str, f: F) -> RouterResult<T>
    where
        F: FnMut(ConnectionHandle) -> Fut,
        Fut: Future<Output = RouterResult<T>>,
    {
        self.with_slave_on_async(entity, None, f).await
    }

    /// Async [`with_slave_on`](Self::with_slave_on)
    pub async fn with_slave_on_async<T, F, Fut>(
        &self,
        entity: &str,
        preferred: Option<&ConnectionDescriptor>,
        mut f: F,
    ) -> RouterResult<T>
    where
        F: FnMut(ConnectionHandle) -> Fut,
        Fut: Future<Output = RouterResult<T>>,
    {
        context::fork(async move {
            let mut attempts = SlaveAttempts::start(self, entity, preferred)?;
            loop {
                let Some(slave) = attempts.next.take() else {
                    self.note_master_fallback(entity);
                    let (master, must_exist) = self.master_target(entity)?;
                    return self.run_async(entity, &master, must_exist, &mut f).await;
                };
                self.inner.metrics.slave_attempts.inc();
                let must_exist = self.inner.connections_should_exist;
                match self.run_async(entity, &slave, must_exist, &mut f).await {
                    Err(error) if error.is_retryable() => attempts.failed(self, &slave, &error),
                    result => return result,
                }
            }
        })
        .await
    }

    /// Async [`first_level_on_slave`](Self::first_level_on_slave)
    pub async fn first_level_on_slave_async<T, F, Fut>(&self, entity: &str, mut f: F) -> RouterResult<T>
    where
        F: FnMut(ConnectionHandle) -> Fut,
        Fut: Future<Output = RouterResult<T>>,
    {
        context::fork(async move {
            match self.first_level_decision(entity)? {
                FirstLevel::Slave => self.with_slave_on_async(entity, None, f).await,
                FirstLevel::Current(handle) => f(handle).await,
            }
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Deferred calls
    // ------------------------------------------------------------------------

    /// Defer calls on `target` to run on `connection`
    pub fn on_db<T: Send + 'static>(&self, entity: &str, connection: ConnectionDescriptor, target: T) -> DeferredCall<T> {
        DeferredCall::new(self.clone(), entity, connection, target)
    }

    /// Defer calls on `target` to run on the master of `entity`
    pub fn on_master<T: Send + 'static>(&self, entity: &str, target: T) -> RouterResult<DeferredCall<T>> {
        let master = self
            .inner
            .registry
            .master(entity)
            .ok_or_else(|| RouterError::unknown_entity(entity))?;
        Ok(self.on_db(entity, master, target))
    }

    /// Defer calls on `target` to run on one eligible slave of `entity`
    ///
    /// The slave is chosen now, falling back to the master when none is
    /// eligible. Deferred calls do not fail over.
    pub fn on_slave<T: Send + 'static>(&self, entity: &str, target: T) -> RouterResult<DeferredCall<T>> {
        let slaves = self.inner.registry.slaves(entity);
        if slaves.is_empty() {
            return Err(RouterError::no_slaves(entity));
        }
        match self
            .inner
            .failures
            .random_live_slave(entity, &slaves, self.inner.clock.now())
        {
            Some(slave) => Ok(self.on_db(entity, slave, target)),
            None => self.on_master(entity, target),
        }
    }

    // ------------------------------------------------------------------------
    // Failure handling
    // ------------------------------------------------------------------------

    fn note_master_fallback(&self, entity: &str) {
        self.inner.metrics.master_fallbacks.inc();
        tracing::warn!(entity = entity, "No eligible slave, falling back to master");
    }

    /// Hand a failure to the sink; nothing it does may escape
    fn report_failure(&self, error: &RouterError, entity: &str, connection: &str) {
        self.inner.metrics.slave_failures.inc();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.inner.sink.notify_failure(error, entity, connection)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(sink_error)) => {
                self.inner.metrics.sink_errors.inc();
                tracing::warn!(error = %sink_error, "Failure sink error ignored");
            }
            Err(_) => {
                self.inner.metrics.sink_errors.inc();
                tracing::warn!("Failure sink panicked");
            }
        }
    }
}

enum FirstLevel {
    Slave,
    Current(ConnectionHandle),
}

/// Candidate bookkeeping for one slave-routed call
struct SlaveAttempts<'a> {
    entity: &'a str,
    slaves: Vec<ConnectionDescriptor>,
    tried: HashSet<String>,
    next: Option<ConnectionDescriptor>,
}

impl<'a> SlaveAttempts<'a> {
    fn start(
        router: &Router,
        entity: &'a str,
        preferred: Option<&ConnectionDescriptor>,
    ) -> RouterResult<Self> {
        let slaves = router.inner.registry.slaves(entity);
        if slaves.is_empty() && preferred.is_none() {
            return Err(RouterError::no_slaves(entity));
        }
        let mut attempts = Self {
            entity,
            slaves,
            tried: HashSet::new(),
            next: preferred.cloned(),
        };
        if attempts.next.is_none() {
            attempts.next = attempts.pick(router);
        }
        Ok(attempts)
    }

    fn pick(&self, router: &Router) -> Option<ConnectionDescriptor> {
        let eligible: Vec<ConnectionDescriptor> = router
            .inner
            .failures
            .eligible_slaves(self.entity, &self.slaves, router.inner.clock.now())
            .into_iter()
            .filter(|s| !self.tried.contains(s.name()))
            .collect();
        selection::pick_random(&eligible).cloned()
    }

    fn failed(&mut self, router: &Router, slave: &ConnectionDescriptor, error: &RouterError) {
        router.report_failure(error, self.entity, slave.name());
        router
            .inner
            .failures
            .record_failure(self.entity, slave.name(), router.inner.clock.now());
        self.tried.insert(slave.name().to_string());
        self.next = self.pick(router);
        tracing::warn!(
            entity = self.entity,
            connection = %slave,
            error = %error,
            retry_on = ?self.next.as_ref().map(ConnectionDescriptor::name),
            "Slave failed, retrying"
        );
    }
}

struct OverrideRestore {
    entity: String,
    previous: Option<bool>,
}

impl Drop for OverrideRestore {
    fn drop(&mut self) {
        context::set_force_slave_reads_override(&self.entity, self.previous);
    }
}

struct RemappingRestore {
    previous: Option<HashMap<String, ConnectionDescriptor>>,
}

impl Drop for RemappingRestore {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            context::restore_remappings(previous);
        }
    }
}
