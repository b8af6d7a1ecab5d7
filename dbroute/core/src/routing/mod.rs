//! Routing
//!
//! The [`Router`] picks a connection per routing block, [`DeferredCall`]
//! postpones the switch until a chain of calls executes, and [`selection`]
//! draws slave candidates.

pub mod proxy;
pub mod router;
pub mod selection;

pub use proxy::{Chainable, DeferredCall};
pub use router::{Router, RouterBuilder};
