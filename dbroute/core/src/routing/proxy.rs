//! Deferred calls
//!
//! A [`DeferredCall`] binds a target value to a connection without switching
//! to it. Chained calls ([`DeferredCall::then`]) are only composed; the
//! connection switch happens once, when a terminal call
//! ([`DeferredCall::call`] or [`DeferredCall::execute`]) runs the whole chain
//! inside a single routing block.
//!
//! ```text
//! router.on_slave("Order", orders)?        bind, no switch
//!     .then(|q, _| Ok(q.filter(..)))       compose
//!     .then(|q, _| Ok(q.order_by(..)))     compose
//!     .call(|q, conn| q.first(conn))       one switch, run everything
//! ```

use std::fmt;

use crate::connection::{ConnectionDescriptor, ConnectionHandle};
use crate::error::RouterResult;

use super::router::Router;

/// Values that accept further deferred operations before execution
///
/// Implemented by composable query builders. Only chainable results may be
/// re-wrapped by [`DeferredCall::then`]; concrete results come out of a
/// terminal call instead.
pub trait Chainable {}

type Pending<T> = Box<dyn FnOnce(&ConnectionHandle) -> RouterResult<T> + Send>;

/// A chain of calls bound to a connection, not yet executed
pub struct DeferredCall<T> {
    router: Router,
    entity: String,
    connection: ConnectionDescriptor,
    pending: Pending<T>,
}

impl<T: Send + 'static> DeferredCall<T> {
    pub(crate) fn new(router: Router, entity: &str, connection: ConnectionDescriptor, target: T) -> Self {
        Self {
            router,
            entity: entity.to_string(),
            connection,
            pending: Box::new(move |_| Ok(target)),
        }
    }

    /// Connection the chain will run on
    #[must_use]
    pub fn connection(&self) -> &ConnectionDescriptor {
        &self.connection
    }

    /// Entity the chain routes for
    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Add a call whose chainable result stays deferred on the same connection
    #[must_use]
    pub fn then<U, F>(self, f: F) -> DeferredCall<U>
    where
        U: Chainable,
        F: FnOnce(T, &ConnectionHandle) -> RouterResult<U> + Send + 'static,
    {
        let pending = self.pending;
        DeferredCall {
            router: self.router,
            entity: self.entity,
            connection: self.connection,
            pending: Box::new(move |conn| f(pending(conn)?, conn)),
        }
    }

    /// Run the chain followed by `f` under one connection switch
    pub fn call<R, F>(self, f: F) -> RouterResult<R>
    where
        F: FnOnce(T, &ConnectionHandle) -> RouterResult<R>,
    {
        let Self {
            router,
            entity,
            connection,
            pending,
        } = self;
        tracing::trace!(entity = %entity, connection = %connection, "Executing deferred call");
        router.with_connection(&entity, &connection, |conn| f(pending(conn)?, conn))
    }

    /// Run the chain and return its final value
    pub fn execute(self) -> RouterResult<T> {
        self.call(|value, _| Ok(value))
    }
}

impl<T> fmt::Debug for DeferredCall<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredCall")
            .field("entity", &self.entity)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}
