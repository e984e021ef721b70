// SPDX-License-Identifier: Apache-2.0

//! The [`Cell`] capability: the only interface the core requires of a shielded cell.
//!
//! The core never inspects cell contents. It enlists, validates, commits, rolls back
//! and trims purely through this trait, dispatched as `Arc<dyn Cell>`.

use crate::version::WriteTicket;
use std::sync::Arc;

/// Address-stable identity of a cell, used as the key in every enlisted-set the core
/// keeps. Derived from the pointee address of the cell's backing `Arc`, not from the
/// handle a caller happens to hold, so clones of the same cell compare equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CellId(pub(crate) usize);

impl CellId {
    /// Builds a [`CellId`] from the address of an `Arc`-backed value. Any two `Arc`
    /// clones pointing at the same allocation produce the same id.
    pub fn of<T: ?Sized>(arc: &Arc<T>) -> Self {
        CellId(Arc::as_ptr(arc) as *const () as usize)
    }
}

/// A shared, type-erased handle to a cell, as stored in enlisted sets and change
/// lists.
pub type CellRef = Arc<dyn Cell>;

/// The capability every shielded cell must expose to the core.
///
/// Implementations are expected to hold their own buffered-write state privately and
/// key it off the identity of the currently active [`crate::context::TransactionContext`];
/// the core only ever calls these five methods.
pub trait Cell: Send + Sync {
    /// Stable identity of this cell, used as a set key.
    fn id(&self) -> CellId;

    /// Does this cell have buffered writes in the calling thread's transaction?
    fn has_changes(&self) -> bool;

    /// Validate at commit time: succeed iff no concurrent committer has installed a
    /// newer version of this cell since the calling transaction's read stamp, and the
    /// cell accepts the proposed write stamp. Must be side-effect-free on failure.
    ///
    /// Called while the calling thread's transaction context is still active, so an
    /// implementation may call [`crate::current_start_stamp`] to compare against its
    /// own last-modified stamp.
    fn can_commit(&self, ticket: &WriteTicket) -> bool;

    /// Install buffered writes as the new current version, tagged with `stamp`.
    fn commit(&self, stamp: u64);

    /// Discard buffered writes for the calling thread's transaction.
    fn rollback(&self);

    /// Drop historical versions whose validity ends at or before `up_to_stamp`.
    fn trim_copies(&self, up_to_stamp: u64);
}
