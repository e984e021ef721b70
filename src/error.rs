// SPDX-License-Identifier: Apache-2.0

//! Error types raised by the transaction core.

use thiserror::Error as DeriveError;

/// Global result type used throughout the crate.
pub type Result<T> = core::result::Result<T, StmError>;

/// Errors raised by the transaction core.
///
/// [`StmError::RetryRequested`] is the only variant the commit loop swallows on its
/// own; every other variant propagates to the caller of [`crate::in_transaction`]
/// after the attempt has been rolled back.
#[derive(Debug, DeriveError)]
pub enum StmError {
    /// Raised when enlisting, rolling back, or reading the start stamp outside of a
    /// transaction.
    #[error("not inside a transaction")]
    NotInTransaction,

    /// Raised when a cell other than the one named by `block_enlist` tries to enlist.
    #[error("cell access forbidden in this context")]
    ForbiddenAccess,

    /// Raised when a commute's enlisted set overlaps the enclosing transaction's
    /// enlisted set after the commute has run. This is a programming error: a commute
    /// is only supposed to touch its declared `affecting` set.
    #[error("commute touched a cell outside its affecting set")]
    InvalidCommute,

    /// Raised by [`crate::rollback`] or by a failed commit validation. Swallowed by
    /// the outer retry loop.
    #[error("transaction must retry")]
    RetryRequested,

    /// A user closure failed for reasons outside the transaction machinery itself.
    #[error("transaction aborted: {0}")]
    Aborted(String),
}

impl StmError {
    /// `true` for the one variant the commit loop retries on its own.
    pub fn is_retry(&self) -> bool {
        matches!(self, StmError::RetryRequested)
    }
}
