// SPDX-License-Identifier: Apache-2.0

//! Deferred, reorderable updates ("commutes") and their degeneration rules.
//!
//! A commute is a closure queued against the set of cells it touches instead of
//! running immediately. It only actually runs — "degenerates" — once something
//! forces ordering: another transaction enlisting one of its cells, the commute
//! queue itself being blocked, or the commit pipeline running the queue out at
//! commit time. A commute's `perform` returns `Result<()>` so a degenerate or
//! forced execution can request a retry the same way any other transactional code
//! does, by propagating [`crate::error::StmError::RetryRequested`].

use crate::{
    cell::{CellId, CellRef},
    context,
    error::Result,
};
use std::collections::HashSet;

#[derive(PartialEq, Eq, Clone, Copy)]
enum CommuteState {
    Ok,
    Broken,
    Executed,
}

pub(crate) struct Commute {
    perform: Option<Box<dyn FnOnce() -> Result<()> + Send>>,
    affecting: HashSet<CellId>,
    state: CommuteState,
}

impl Commute {
    /// The cells this commute touches, for the pre-commit hook dispatch set.
    pub(crate) fn affecting(&self) -> &HashSet<CellId> {
        &self.affecting
    }
}

/// Queues `perform` as a commute over `affecting`, or runs it immediately if the
/// active context has commutes blocked or already enlisted one of `affecting`.
pub(crate) fn enlist_commute(
    perform: impl FnOnce() -> Result<()> + Send + 'static,
    affecting: HashSet<CellId>,
) -> Result<()> {
    let degenerate = context::with_context(|ctx| ctx.block_commute || !ctx.enlisted_ids().is_disjoint(&affecting))?;
    if degenerate {
        return perform();
    }
    context::with_context(|ctx| {
        ctx.commutes.push(Commute {
            perform: Some(Box::new(perform)),
            affecting,
            state: CommuteState::Ok,
        });
    })
}

/// Like [`enlist_commute`], but wraps `perform` so that only `cell` may enlist for
/// its entire execution — whether it runs deferred or degenerates inline. The guard
/// is installed around `perform` itself rather than only the deferred-execution
/// branch, so the strict guarantee is path-independent.
pub(crate) fn enlist_strict_commute(perform: impl FnOnce() -> Result<()> + Send + 'static, cell: CellId) -> Result<()> {
    let wrapped = move || -> Result<()> {
        let prev = context::with_context(|ctx| ctx.block_enlist.replace(cell)).unwrap_or(None);

        struct RestoreBlockEnlist(Option<CellId>);
        impl Drop for RestoreBlockEnlist {
            fn drop(&mut self) {
                let _ = context::with_context(|ctx| ctx.block_enlist = self.0);
            }
        }
        let _restore = RestoreBlockEnlist(prev);

        perform()
    };
    let mut affecting = HashSet::new();
    affecting.insert(cell);
    enlist_commute(wrapped, affecting)
}

/// Runs the degeneration check triggered by `cell` newly enlisting: any queued
/// commute touching `cell` is broken and, if still within the execution limit for
/// this call, executed right away.
pub(crate) fn check(cell: &CellRef) -> Result<()> {
    let cell_id = cell.id();

    let (is_outermost, execution_limit) = context::with_context(|ctx| match ctx.commute_time {
        Some(floor) => (false, floor),
        None => (true, ctx.commutes.len()),
    })?;

    context::with_context(|ctx| {
        for commute in ctx.commutes.iter_mut() {
            if commute.state == CommuteState::Ok && commute.affecting.contains(&cell_id) {
                commute.state = CommuteState::Broken;
            }
        }
    })?;

    struct RemoveAffectingOnPanic {
        cell_id: CellId,
    }
    impl Drop for RemoveAffectingOnPanic {
        fn drop(&mut self) {
            if std::thread::panicking() {
                let _ = context::with_context(|ctx| {
                    ctx.commutes.retain(|c| !c.affecting.contains(&self.cell_id));
                });
            }
        }
    }

    let mut index = 0;
    loop {
        let next = context::with_context(|ctx| {
            while index < ctx.commutes.len() && index < execution_limit {
                if ctx.commutes[index].state == CommuteState::Broken {
                    let perform = ctx.commutes[index].perform.take();
                    ctx.commutes[index].state = CommuteState::Executed;
                    let saved_commute_time = ctx.commute_time;
                    ctx.commute_time = Some(index);
                    index += 1;
                    return Some((perform, saved_commute_time));
                }
                index += 1;
            }
            None
        })?;

        let Some((perform, saved_commute_time)) = next else {
            break;
        };

        {
            let _guard = RemoveAffectingOnPanic { cell_id };
            if let Some(perform) = perform {
                perform()?;
            }
        }

        context::with_context(|ctx| ctx.commute_time = saved_commute_time)?;
    }

    if is_outermost {
        context::with_context(|ctx| ctx.commutes.retain(|c| c.state == CommuteState::Ok))?;
    }

    Ok(())
}

/// Drains every commute still queued in the active context and runs whichever of
/// them have not already executed. Used by the commit pipeline to flush commutes
/// that no conflicting enlist ever broke.
pub(crate) fn run_all_queued() -> Result<()> {
    let commutes = context::with_context(|ctx| std::mem::take(&mut ctx.commutes))?;
    for mut commute in commutes {
        if let Some(perform) = commute.perform.take() {
            perform()?;
        }
    }
    Ok(())
}
