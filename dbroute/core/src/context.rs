//! Execution Context
//!
//! Routing state that belongs to one unit of execution: per entity the
//! nesting depth and the active connection, plus the remapping table and the
//! per-entity slave-read forcing overrides. The state is confined to its
//! owner, so none of it is locked.
//!
//! # Storage
//!
//! ```text
//! inside context::scope(..)   ->  tokio task-local   (follows the task across workers)
//! inside context::fork(..)    ->  tokio task-local   (child of the caller's context)
//! anywhere else               ->  thread-local       (one context per OS thread)
//! ```
//!
//! Routing blocks nest strictly. [`ContextGuard`] pushes a connection when it
//! is created and restores the exact previous `(depth, active)` pair when it
//! is dropped, which covers normal return, `?` propagation, panics, and a
//! cancelled future being dropped mid-flight.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use crate::connection::{ConnectionDescriptor, ConnectionHandle};
use crate::error::ConfigError;

thread_local! {
    static THREAD_CONTEXT: RefCell<ExecutionContext> = RefCell::new(ExecutionContext::default());
}

tokio::task_local! {
    static TASK_CONTEXT: RefCell<ExecutionContext>;
}

/// Nesting state of one entity
#[derive(Clone, Default)]
struct Frame {
    depth: usize,
    active: Option<ConnectionHandle>,
}

/// State restored when a routing block exits
#[derive(Clone, Default)]
pub struct PreviousState {
    /// Depth before the push
    pub depth: usize,
    /// Active connection before the push
    pub active: Option<ConnectionHandle>,
}

impl fmt::Debug for PreviousState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreviousState")
            .field("depth", &self.depth)
            .field("active", &self.active.as_ref().map(|c| c.name().to_string()))
            .finish()
    }
}

/// Routing state of one execution unit
#[derive(Default)]
pub struct ExecutionContext {
    frames: HashMap<String, Frame>,
    remappings: HashMap<String, ConnectionDescriptor>,
    force_slave_reads: HashMap<String, bool>,
}

impl ExecutionContext {
    /// Copy of the settings a child task starts from; nesting is not inherited
    fn inherit(&self) -> Self {
        Self {
            frames: HashMap::new(),
            remappings: self.remappings.clone(),
            force_slave_reads: self.force_slave_reads.clone(),
        }
    }

    /// Full copy, nesting included, for a block that runs beside its siblings
    fn fork(&self) -> Self {
        Self {
            frames: self.frames.clone(),
            remappings: self.remappings.clone(),
            force_slave_reads: self.force_slave_reads.clone(),
        }
    }

    fn push(&mut self, entity: &str, handle: ConnectionHandle) -> PreviousState {
        let frame = self.frames.entry(entity.to_string()).or_default();
        let previous = PreviousState {
            depth: frame.depth,
            active: frame.active.take(),
        };
        frame.depth = previous.depth + 1;
        frame.active = Some(handle);
        previous
    }

    fn pop(&mut self, entity: &str, previous: PreviousState) {
        if previous.depth == 0 && previous.active.is_none() {
            self.frames.remove(entity);
            return;
        }
        let frame = self.frames.entry(entity.to_string()).or_default();
        frame.depth = previous.depth;
        frame.active = previous.active;
    }

    fn depth(&self, entity: &str) -> usize {
        self.frames.get(entity).map_or(0, |f| f.depth)
    }

    fn active(&self, entity: &str) -> Option<ConnectionHandle> {
        self.frames.get(entity).and_then(|f| f.active.clone())
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("entities", &self.frames.len())
            .field("remappings", &self.remappings)
            .field("force_slave_reads", &self.force_slave_reads)
            .finish()
    }
}

// ============================================================================
// Storage access
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Storage {
    Task,
    Thread,
}

/// Whether the caller runs inside a task-scoped context
#[must_use]
pub fn in_task_scope() -> bool {
    TASK_CONTEXT.try_with(|_| ()).is_ok()
}

fn current_storage() -> Storage {
    if in_task_scope() {
        Storage::Task
    } else {
        Storage::Thread
    }
}

/// Run `f` against the caller's context
///
/// `f` must not re-enter this module.
fn with<R>(f: impl FnOnce(&mut ExecutionContext) -> R) -> R {
    match current_storage() {
        Storage::Task => TASK_CONTEXT.with(|cell| f(&mut cell.borrow_mut())),
        Storage::Thread => THREAD_CONTEXT.with(|cell| f(&mut cell.borrow_mut())),
    }
}

/// Like [`with`] against a fixed storage, tolerating teardown
fn try_with_storage<R>(storage: Storage, f: impl FnOnce(&mut ExecutionContext) -> R) -> Option<R> {
    match storage {
        Storage::Task => TASK_CONTEXT.try_with(|cell| f(&mut cell.borrow_mut())).ok(),
        Storage::Thread => THREAD_CONTEXT
            .try_with(|cell| f(&mut cell.borrow_mut()))
            .ok(),
    }
}

/// Run `fut` inside a fresh task-scoped context
///
/// The new context starts at depth zero and inherits the caller's remapping
/// table and forcing overrides.
pub async fn scope<F: Future>(fut: F) -> F::Output {
    let seed = with(|ctx| ctx.inherit());
    TASK_CONTEXT.scope(RefCell::new(seed), fut).await
}

/// Run `fut` in a child of the caller's context
///
/// Unlike [`scope`] the child keeps the caller's nesting, so a block inside
/// a routing block still sees itself nested. Pushes and pops made by `fut`
/// never reach the caller, which keeps futures polled together in one task
/// (`tokio::join!`, `select!`) from restoring each other's state.
pub async fn fork<F: Future>(fut: F) -> F::Output {
    let seed = with(|ctx| ctx.fork());
    TASK_CONTEXT.scope(RefCell::new(seed), fut).await
}

/// Run `fut` in the current task scope, creating one when absent
pub async fn ensure_scope<F: Future>(fut: F) -> F::Output {
    if in_task_scope() {
        fut.await
    } else {
        scope(fut).await
    }
}

// ============================================================================
// Nesting
// ============================================================================

/// Make `handle` the active connection of `entity` and increment its depth
///
/// Prefer [`ContextGuard`]; a bare push must be paired with [`pop`] on every
/// exit path.
pub fn push_connection(entity: &str, handle: ConnectionHandle) -> PreviousState {
    with(|ctx| ctx.push(entity, handle))
}

/// Restore the state returned by the matching [`push_connection`]
pub fn pop(entity: &str, previous: PreviousState) {
    with(|ctx| ctx.pop(entity, previous));
}

/// Nesting depth of `entity`
#[must_use]
pub fn current_depth(entity: &str) -> usize {
    with(|ctx| ctx.depth(entity))
}

/// Active connection of `entity`
#[must_use]
pub fn active_connection(entity: &str) -> Option<ConnectionHandle> {
    with(|ctx| ctx.active(entity))
}

/// Whether no routing block for `entity` is open
#[must_use]
pub fn is_top_level(entity: &str) -> bool {
    current_depth(entity) == 0
}

/// Scoped routing block
///
/// Restores the previous state of its entity on drop.
#[must_use = "the connection is restored as soon as the guard is dropped"]
pub struct ContextGuard {
    entity: String,
    storage: Storage,
    previous: Option<PreviousState>,
}

impl ContextGuard {
    /// Push `handle` for `entity`
    pub fn push(entity: &str, handle: ConnectionHandle) -> Self {
        let storage = current_storage();
        let previous = try_with_storage(storage, |ctx| ctx.push(entity, handle));
        Self {
            entity: entity.to_string(),
            storage,
            previous,
        }
    }

    /// Depth the entity had before this guard
    #[must_use]
    pub fn previous_depth(&self) -> usize {
        self.previous.as_ref().map_or(0, |p| p.depth)
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            let depth = previous.depth;
            match try_with_storage(self.storage, |ctx| ctx.pop(&self.entity, previous)) {
                Some(()) => tracing::debug!(entity = %self.entity, depth, "Restored connection"),
                None => tracing::debug!(entity = %self.entity, "Context gone before routing block restore"),
            }
        }
    }
}

impl fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGuard")
            .field("entity", &self.entity)
            .field("storage", &self.storage)
            .field("previous", &self.previous)
            .finish()
    }
}

// ============================================================================
// Remappings
// ============================================================================

/// The caller's remapping table
#[must_use]
pub fn remappings() -> HashMap<String, ConnectionDescriptor> {
    with(|ctx| ctx.remappings.clone())
}

/// Replace the caller's remapping table, returning the previous one
///
/// Keys are symbolic connection names such as `master`; empty keys are
/// rejected.
pub fn set_remappings(
    table: HashMap<String, ConnectionDescriptor>,
) -> Result<HashMap<String, ConnectionDescriptor>, ConfigError> {
    if let Some(key) = table.keys().find(|k| k.trim().is_empty()) {
        return Err(ConfigError::InvalidRemapping(format!(
            "remapping key {key:?} is not a connection name"
        )));
    }
    Ok(with(|ctx| std::mem::replace(&mut ctx.remappings, table)))
}

/// Put back a table previously returned by [`set_remappings`]
pub(crate) fn restore_remappings(table: HashMap<String, ConnectionDescriptor>) {
    with(|ctx| ctx.remappings = table);
}

/// Remapping for the symbolic connection `name`
#[must_use]
pub fn remapping_for(name: &str) -> Option<ConnectionDescriptor> {
    with(|ctx| ctx.remappings.get(name).cloned())
}

// ============================================================================
// Slave-read forcing
// ============================================================================

/// Per-entity forcing override of the caller
#[must_use]
pub fn force_slave_reads_override(entity: &str) -> Option<bool> {
    with(|ctx| ctx.force_slave_reads.get(entity).copied())
}

/// Set or clear the per-entity forcing override, returning the previous one
pub fn set_force_slave_reads_override(entity: &str, force: Option<bool>) -> Option<bool> {
    with(|ctx| match force {
        Some(value) => ctx.force_slave_reads.insert(entity.to_string(), value),
        None => ctx.force_slave_reads.remove(entity),
    })
}

/// Clear the caller's context
///
/// For execution units that get recycled, such as pooled worker threads.
pub fn reset() {
    with(|ctx| *ctx = ExecutionContext::default());
}
