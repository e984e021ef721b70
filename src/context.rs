// SPDX-License-Identifier: Apache-2.0

//! Thread-local transaction state: the enlisted cell map, the deferred commute
//! queue, queued side effects, and the blocking/tracking flags the commute engine
//! and commit pipeline consult.

use crate::{
    cell::{CellId, CellRef},
    commute::Commute,
    error::{Result, StmError},
};
use std::{cell::RefCell, collections::HashMap, collections::HashSet};

pub(crate) type Effect = Box<dyn FnOnce() + Send>;

/// Per-thread state for one transaction attempt.
pub(crate) struct TransactionContext {
    pub(crate) start_stamp: u64,
    /// Keyed by `CellId` so the commit pipeline can recover the `CellRef` to
    /// dispatch against; set-algebra over `enlisted` reads the key set only.
    pub(crate) enlisted: HashMap<CellId, CellRef>,
    pub(crate) commutes: Vec<Commute>,
    pub(crate) side_effects: Vec<(Effect, Effect)>,
    pub(crate) pre_commit_actions: Vec<Box<dyn FnOnce() + Send>>,
    pub(crate) block_enlist: Option<CellId>,
    pub(crate) block_commute: bool,
    pub(crate) enforce_tracking: bool,
    pub(crate) commute_time: Option<usize>,
}

impl TransactionContext {
    fn new(start_stamp: u64) -> Self {
        Self {
            start_stamp,
            enlisted: HashMap::new(),
            commutes: Vec::new(),
            side_effects: Vec::new(),
            pre_commit_actions: Vec::new(),
            block_enlist: None,
            block_commute: false,
            enforce_tracking: false,
            commute_time: None,
        }
    }

    pub(crate) fn enlisted_ids(&self) -> HashSet<CellId> {
        self.enlisted.keys().copied().collect()
    }
}

thread_local! {
    static CONTEXT: RefCell<Option<TransactionContext>> = RefCell::new(None);
}

/// Starts a fresh outermost context. Panics (in debug builds) if one is already
/// active; callers must check [`is_active`] first, matching invariant 7.
pub(crate) fn enter(start_stamp: u64) {
    CONTEXT.with(|c| {
        let mut guard = c.borrow_mut();
        debug_assert!(guard.is_none(), "nested in_transaction must join the outer context");
        *guard = Some(TransactionContext::new(start_stamp));
    });
}

/// Tears down the active context and returns it, for the commit pipeline to drain.
pub(crate) fn exit() -> TransactionContext {
    CONTEXT
        .with(|c| c.borrow_mut().take())
        .expect("context::exit called without an active transaction")
}

pub(crate) fn is_active() -> bool {
    CONTEXT.with(|c| c.borrow().is_some())
}

/// Runs `f` against the active context, or fails with [`StmError::NotInTransaction`].
pub(crate) fn with_context<R>(f: impl FnOnce(&mut TransactionContext) -> R) -> Result<R> {
    CONTEXT.with(|c| {
        let mut guard = c.borrow_mut();
        match guard.as_mut() {
            Some(ctx) => Ok(f(ctx)),
            None => Err(StmError::NotInTransaction),
        }
    })
}

pub(crate) fn start_stamp() -> Result<u64> {
    with_context(|ctx| ctx.start_stamp)
}

pub(crate) fn set_start_stamp(stamp: u64) -> Result<()> {
    with_context(|ctx| ctx.start_stamp = stamp)
}

/// Registers `cell` in the active transaction's enlisted map and runs the commute
/// degeneration check on first touch.
///
/// `has_locals` reports whether the cell already has buffered local writes for this
/// transaction; when it does and the context is not enforcing precise tracking (i.e.
/// we are not nested inside [`isolated_run`]), re-enlisting is skipped as a pure
/// optimization — the cell was already accounted for the first time it enlisted.
pub(crate) fn enlist(cell: &CellRef, has_locals: bool) -> Result<bool> {
    let newly = CONTEXT.with(|c| {
        let mut guard = c.borrow_mut();
        let ctx = guard.as_mut().ok_or(StmError::NotInTransaction)?;
        if let Some(blocked) = ctx.block_enlist {
            if blocked != cell.id() {
                return Err(StmError::ForbiddenAccess);
            }
        }
        if has_locals && !ctx.enforce_tracking {
            return Ok(false);
        }
        let newly = !ctx.enlisted.contains_key(&cell.id());
        ctx.enlisted.insert(cell.id(), cell.clone());
        Ok(newly)
    })?;
    if newly {
        crate::commute::check(cell)?;
    }
    Ok(newly)
}

/// Executes `on_commit` inline if no transaction is active; otherwise queues both
/// closures for dispatch at commit or rollback time.
pub(crate) fn side_effect(on_commit: Effect, on_rollback: Effect) {
    let leftover = CONTEXT.with(|c| {
        let mut guard = c.borrow_mut();
        match guard.as_mut() {
            Some(ctx) => {
                ctx.side_effects.push((on_commit, on_rollback));
                None
            }
            None => Some(on_commit),
        }
    });
    if let Some(on_commit) = leftover {
        on_commit();
    }
}

pub(crate) fn take_side_effects() -> Result<Vec<(Effect, Effect)>> {
    with_context(|ctx| std::mem::take(&mut ctx.side_effects))
}

/// Queues `action` to run once, synchronously, right before this attempt's commit
/// validation begins.
pub(crate) fn pre_commit(action: Box<dyn FnOnce() + Send>) -> Result<()> {
    with_context(|ctx| ctx.pre_commit_actions.push(action))
}

/// Swaps in a fresh sub-context that takes over the commute queue, forces precise
/// enlist tracking, and runs `f`. Restores the outer context afterward regardless of
/// whether `f` succeeded, folding the sub-context's commute queue and enlisted ids
/// back in, and returns the set the sub-context touched.
pub(crate) fn isolated_run(block_commute: bool, f: impl FnOnce() -> Result<()>) -> Result<HashSet<CellId>> {
    let mut outer = CONTEXT
        .with(|c| c.borrow_mut().take())
        .ok_or(StmError::NotInTransaction)?;

    let mut inner = TransactionContext::new(outer.start_stamp);
    inner.commutes = std::mem::take(&mut outer.commutes);
    inner.enforce_tracking = true;
    inner.block_commute = block_commute;
    inner.commute_time = outer.commute_time;

    CONTEXT.with(|c| *c.borrow_mut() = Some(inner));
    let outcome = f();
    let inner = CONTEXT
        .with(|c| c.borrow_mut().take())
        .expect("sub-context must still be active after an isolated run");

    outer.commutes = inner.commutes;
    let touched = inner.enlisted_ids();
    outer.enlisted.extend(inner.enlisted);
    CONTEXT.with(|c| *c.borrow_mut() = Some(outer));

    outcome?;
    Ok(touched)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_effect_runs_inline_outside_a_transaction() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        assert!(!is_active());
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        side_effect(Box::new(move || flag.store(true, Ordering::SeqCst)), Box::new(|| {}));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn enlist_requires_an_active_transaction() {
        assert!(!is_active());
        struct Dummy;
        impl crate::cell::Cell for Dummy {
            fn id(&self) -> CellId {
                CellId(42)
            }
            fn has_changes(&self) -> bool {
                false
            }
            fn can_commit(&self, _ticket: &crate::version::WriteTicket) -> bool {
                true
            }
            fn commit(&self, _stamp: u64) {}
            fn rollback(&self) {}
            fn trim_copies(&self, _up_to_stamp: u64) {}
        }
        let cell: CellRef = std::sync::Arc::new(Dummy);
        let err = enlist(&cell, false).unwrap_err();
        assert!(matches!(err, StmError::NotInTransaction));
    }

    #[test]
    fn enter_exit_round_trip() {
        enter(7);
        assert!(is_active());
        assert_eq!(start_stamp().unwrap(), 7);
        let ctx = exit();
        assert_eq!(ctx.start_stamp, 7);
        assert!(!is_active());
    }
}
