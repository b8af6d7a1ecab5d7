//! dbroute Core - Master/Slave Connection Routing
//!
//! This crate routes units of work for a logical entity (a table or model
//! type) to its master connection or to one of its slaves, without call sites
//! knowing which physical connection is active. It sits in front of a
//! data-access layer and only asks a [`ConnectionFactory`] to resolve names
//! into live handles.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Call sites                            │
//! │   with_master / with_slave / first_level_on_slave / on_slave │
//! └───────────────────────────────┬──────────────────────────────┘
//!                                 │
//! ┌───────────────────────────────┼──────────────────────────────┐
//! │                            ROUTER                             │
//! │  ┌──────────────┐  ┌──────────┴─────┐  ┌──────────────────┐  │
//! │  │    Entity    │  │   Execution    │  │     Failure      │  │
//! │  │   Registry   │  │    Context     │  │     Tracker      │  │
//! │  │   (shared)   │  │ (per thread or │  │ (shared, 15s     │  │
//! │  │              │  │   per task)    │  │  window)         │  │
//! │  └──────────────┘  └────────────────┘  └──────────────────┘  │
//! └───────────────────────────────┬──────────────────────────────┘
//!                                 │ resolve(name, must_exist)
//!                       ┌─────────┴─────────┐
//!                       │ ConnectionFactory │
//!                       └───────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Router`]: Runs units of work on the master or a slave, with failover
//! - [`EntityRegistry`]: Master and slaves per entity
//! - [`FailureTracker`]: Recent slave failures and eligibility
//! - [`ContextGuard`]: Scoped switch of the active connection
//! - [`DeferredCall`]: Chain of calls bound to a connection, executed later
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use dbroute_core::{EntityConfig, LazyConnectionFactory, Router};
//!
//! let factory = LazyConnectionFactory::new(|descriptor| open_connection(descriptor));
//! let router = Router::new(Arc::new(factory));
//!
//! router.configure("Order", EntityConfig::new("orders_master").with_slaves(["s1", "s2"]))?;
//!
//! // Reads on a slave; data-access errors fail over to another slave, then the master
//! let total = router.with_slave("Order", |conn| count_orders(conn))?;
//!
//! // Writes on the master
//! router.with_master("Order", |conn| insert_order(conn, &order))?;
//! ```
//!
//! # Module Overview
//!
//! - [`clock`]: Time source for failure timestamps
//! - [`config`]: TOML routing file and environment overrides
//! - [`connection`]: Descriptors, handles, and the connection factory
//! - [`context`]: Per-thread / per-task routing state
//! - [`error`]: Error types
//! - [`failures`]: Failure tracker
//! - [`registry`]: Entity registry
//! - [`reporting`]: Failure sinks and routing metrics
//! - [`routing`]: Router, deferred calls, and candidate selection

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod failures;
pub mod registry;
pub mod reporting;
pub mod routing;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use connection::{
    Connection, ConnectionDescriptor, ConnectionFactory, ConnectionHandle, LazyConnectionFactory,
    MASTER_CONNECTION_NAME,
};
pub use context::{ContextGuard, ExecutionContext, PreviousState};
pub use error::{ConfigError, RouterError, RouterResult};
pub use failures::{FailureTracker, DEFAULT_ELIGIBILITY_WINDOW_SECS};
pub use registry::{EntityConfig, EntityRegistry};
pub use reporting::{FailureSink, NoopSink, RoutingMetrics, RoutingMetricsSnapshot, TracingSink};
pub use routing::{Chainable, DeferredCall, Router, RouterBuilder};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigSource, DescriptorSpec,
    EntitySection, RouterConfig, RoutingFile,
};
