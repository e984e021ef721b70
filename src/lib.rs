// SPDX-License-Identifier: Apache-2.0

//! A version-list software transactional memory core.
//!
//! Cells implement the five-method [`Cell`] capability and hand the core nothing but
//! their identity, their validation predicate, and their commit/rollback/trim
//! actions; the core never looks inside a cell. Transactions are run through
//! [`Stm::in_transaction`], which retries automatically on conflict. Inside a
//! transaction, code reaches the thread-local attempt through the free functions in
//! this module: [`rollback`], [`conditional`], [`side_effect`], [`pre_commit`],
//! [`enlist_commute`] and [`enlist_strict_commute`].
//!
//! ```ignore
//! let stm = Stm::new();
//! stm.in_transaction(|| {
//!     let before = account.get();
//!     account.set(before - amount)?;
//!     Ok(())
//! })?;
//! ```

mod breaker;
mod cell;
mod commit;
mod commute;
mod config;
mod context;
mod error;
mod subscription;
mod version;

pub use cell::{Cell, CellId, CellRef};
pub use commit::Stm;
pub use config::{RetryStrategy, RuntimeConfig};
pub use error::{Result, StmError};
pub use subscription::{PostCommitHooks, PreCommitHooks};
pub use version::WriteTicket;

use std::collections::HashSet;

/// Builds the value the commit loop treats as a retry request. Intended to be
/// returned, not invoked for effect: `return Err(stm::rollback())`.
pub fn rollback() -> StmError {
    StmError::RetryRequested
}

/// Requests a retry unless `predicate` holds, for transactions that must wait on a
/// condition over other cells' state rather than react to a conflict.
pub fn conditional(predicate: bool) -> Result<()> {
    if predicate {
        Ok(())
    } else {
        Err(StmError::RetryRequested)
    }
}

/// `true` if the calling thread is currently inside a transaction attempt.
pub fn is_in_transaction() -> bool {
    context::is_active()
}

/// The read stamp the active transaction is pinned to.
pub fn current_start_stamp() -> Result<u64> {
    context::start_stamp()
}

/// Registers `cell` with the active transaction, running the commute degeneration
/// check for it on first enlist. `has_locals` reports whether the cell already has
/// locally buffered writes for this attempt. Returns `Err(NotInTransaction)` outside
/// of a transaction.
pub fn enlist(cell: &CellRef, has_locals: bool) -> Result<bool> {
    context::enlist(cell, has_locals)
}

/// Queues `on_commit` and `on_rollback` for dispatch once the active transaction
/// settles, or runs `on_commit` immediately if no transaction is active.
pub fn side_effect(on_commit: Box<dyn FnOnce() + Send>, on_rollback: Box<dyn FnOnce() + Send>) {
    context::side_effect(on_commit, on_rollback)
}

/// Queues `action` to run once, synchronously, right before the active transaction's
/// commit validation begins.
pub fn pre_commit(action: Box<dyn FnOnce() + Send>) -> Result<()> {
    context::pre_commit(action)
}

/// Queues `perform` as a commute over `affecting`. Degenerates to an immediate call
/// if the active context has commutes blocked, or if `affecting` overlaps the
/// transaction's already-enlisted cells.
pub fn enlist_commute(perform: impl FnOnce() -> Result<()> + Send + 'static, affecting: HashSet<CellId>) -> Result<()> {
    commute::enlist_commute(perform, affecting)
}

/// Like [`enlist_commute`], restricted to a single cell: for as long as `perform`
/// runs, whether inline or deferred, only `cell` may enlist.
pub fn enlist_strict_commute(perform: impl FnOnce() -> Result<()> + Send + 'static, cell: CellId) -> Result<()> {
    commute::enlist_strict_commute(perform, cell)
}
