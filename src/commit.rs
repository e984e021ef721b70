// SPDX-License-Identifier: Apache-2.0

//! The two-phase commit pipeline: `in_transaction`'s retry loop, validation against
//! the version list, rollback, and hook dispatch.

use crate::{
    cell::CellId,
    commute,
    config::{RetryStrategy, RuntimeConfig},
    context,
    error::{Result, StmError},
    subscription::{PostCommitHooks, PreCommitHooks},
    version::{VersionList, WriteTicket},
};
use log::{debug, trace, warn};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

/// The transactional runtime: one version list, one retry/trim configuration, and
/// an optional pair of pre-/post-commit hook registries.
pub struct Stm {
    versions: VersionList,
    config: RuntimeConfig,
    pre_hooks: Option<Arc<dyn PreCommitHooks>>,
    post_hooks: Option<Arc<dyn PostCommitHooks>>,
    stamp_lock: Mutex<()>,
    trim_counter: AtomicU32,
}

impl Default for Stm {
    fn default() -> Self {
        Self::with_config(RuntimeConfig::default())
    }
}

impl Stm {
    /// A runtime with the default [`RuntimeConfig`] and no hook registries.
    pub fn new() -> Self {
        Self::default()
    }

    /// A runtime with a caller-supplied retry strategy and trim cadence.
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            versions: VersionList::new(),
            config,
            pre_hooks: None,
            post_hooks: None,
            stamp_lock: Mutex::new(()),
            trim_counter: AtomicU32::new(0),
        }
    }

    /// Attaches hook registries, returning `self` for chained construction.
    pub fn with_hooks(
        mut self,
        pre: Option<Arc<dyn PreCommitHooks>>,
        post: Option<Arc<dyn PostCommitHooks>>,
    ) -> Self {
        self.pre_hooks = pre;
        self.post_hooks = post;
        self
    }

    /// Runs `act` to completion inside a transaction, retrying on conflict or on an
    /// explicit [`StmError::RetryRequested`] per the configured [`RetryStrategy`].
    /// A nested call (one already running inside a transaction on this thread) just
    /// invokes `act` directly, joining the outer attempt (invariant 7).
    pub fn in_transaction<F, R>(&self, act: F) -> Result<R>
    where
        F: Fn() -> Result<R>,
    {
        if context::is_active() {
            return act();
        }

        loop {
            let reader = self.versions.get_reader_ticket();
            context::enter(reader.stamp());
            trace!("transaction started at stamp {}", reader.stamp());

            struct RollbackOnUnwind<'a> {
                stm: &'a Stm,
                armed: bool,
            }
            impl Drop for RollbackOnUnwind<'_> {
                fn drop(&mut self) {
                    if self.armed {
                        self.stm.do_rollback();
                    }
                }
            }
            let mut guard = RollbackOnUnwind { stm: self, armed: true };

            let outcome = act();
            guard.armed = false;

            let settled = match outcome {
                Ok(value) => match self.do_commit() {
                    Ok(true) => Some(Ok(value)),
                    Ok(false) => None,
                    Err(StmError::RetryRequested) => None,
                    Err(err) => Some(Err(err)),
                },
                Err(StmError::RetryRequested) => {
                    self.do_rollback();
                    None
                }
                Err(other) => {
                    self.do_rollback();
                    Some(Err(other))
                }
            };
            drop(guard);
            drop(reader);

            match settled {
                Some(result) => return result,
                None => {
                    self.retry_wait()?;
                    continue;
                }
            }
        }
    }

    /// `true` if this thread is currently inside a transaction attempt.
    pub fn is_in_transaction(&self) -> bool {
        context::is_active()
    }

    /// The read stamp the active transaction is pinned to.
    pub fn current_start_stamp(&self) -> Result<u64> {
        context::start_stamp()
    }

    fn retry_wait(&self) -> Result<()> {
        match &self.config.retry_strategy {
            RetryStrategy::Retry => Ok(()),
            RetryStrategy::RetryWithBreaker(breaker) => {
                breaker.spin().map_err(|e| StmError::Aborted(e.to_string()))
            }
            RetryStrategy::Abort => Err(StmError::RetryRequested),
        }
    }

    /// Validates and installs the active transaction's writes, or rolls it back.
    /// Returns `Ok(true)` on a successful commit, `Ok(false)` on a validation
    /// failure the outer retry loop should retry, and `Err` for a fatal
    /// [`StmError::InvalidCommute`]. A transaction with pending commutes or any
    /// enlisted cell carrying a buffered write goes through full validation; a
    /// transaction that only enlisted cells for read validation (no commutes, and no
    /// enlisted cell reports `has_changes`) always succeeds without touching the
    /// version list.
    fn do_commit(&self) -> Result<bool> {
        let has_changes = context::with_context(|ctx| {
            !ctx.commutes.is_empty() || ctx.enlisted.values().any(|cell| cell.has_changes())
        })
        .unwrap_or(false);

        if !has_changes {
            let ctx = context::exit();
            for cell in ctx.enlisted.values() {
                cell.commit(ctx.start_stamp);
            }
            self.dispatch_side_effects(ctx.side_effects, true);
            self.pace_trim();
            return Ok(true);
        }

        match self.commit_check() {
            Ok((true, ticket)) => {
                let ticket = ticket.expect("commit_check returns a write ticket on success");
                let changed = context::with_context(|ctx| {
                    let mut changed = Vec::new();
                    for cell in ctx.enlisted.values() {
                        if cell.has_changes() {
                            cell.commit(ticket.stamp());
                            changed.push(cell.clone());
                        }
                    }
                    changed
                })
                .unwrap_or_default();

                ticket.set_changes(changed.clone());
                self.versions.commit_write(&ticket);
                debug!("committed at stamp {}", ticket.stamp());

                if let Some(hooks) = &self.post_hooks {
                    let ids: HashSet<CellId> = changed.iter().map(|c| c.id()).collect();
                    for effect in hooks.trigger(&ids) {
                        effect();
                    }
                }

                let ctx = context::exit();
                self.dispatch_side_effects(ctx.side_effects, true);
                self.pace_trim();
                Ok(true)
            }
            Ok((false, _)) => {
                warn!("commit validation failed, rolling back");
                let _ = context::with_context(|ctx| {
                    for cell in ctx.enlisted.values() {
                        cell.rollback();
                    }
                });
                let ctx = context::exit();
                self.dispatch_side_effects(ctx.side_effects, false);
                self.pace_trim();
                Ok(false)
            }
            Err(err) => {
                let _ = context::with_context(|ctx| {
                    for cell in ctx.enlisted.values() {
                        cell.rollback();
                    }
                });
                let ctx = context::exit();
                self.dispatch_side_effects(ctx.side_effects, false);
                self.pace_trim();
                Err(err)
            }
        }
    }

    /// Rolls back the active transaction, if one is still active. A no-op if
    /// `do_commit` already tore the context down; this is what the
    /// unwind-safety guard in `in_transaction` falls back to on panic.
    fn do_rollback(&self) {
        if !context::is_active() {
            return;
        }
        let ctx = context::exit();
        for cell in ctx.enlisted.values() {
            cell.rollback();
        }
        self.dispatch_side_effects(ctx.side_effects, false);
        self.pace_trim();
    }

    /// Runs this attempt's queued pre-commit actions and the registry-level
    /// [`PreCommitHooks`], flushes any commutes still queued (refreshing the read
    /// stamp only for that case), then validates the originally-enlisted cells and
    /// the commuted cells against a freshly allocated write ticket under
    /// `stamp_lock`. Fails fatally with [`StmError::InvalidCommute`] if a commute
    /// touched a cell the surrounding transaction had already enlisted directly —
    /// that is always a programming error, never a retryable conflict.
    fn commit_check(&self) -> Result<(bool, Option<WriteTicket>)> {
        let _ = context::with_context(|ctx| {
            for action in std::mem::take(&mut ctx.pre_commit_actions) {
                action();
            }
        });

        // snapshot before running commutes: commutes merge their enlisted cells
        // back into this same map, and we need the pre-merge set to tell the two
        // apart for the overlap check below.
        let items_enlisted = context::with_context(|ctx| ctx.enlisted_ids())?;
        let had_commutes = context::with_context(|ctx| !ctx.commutes.is_empty())?;

        if let Some(hooks) = &self.pre_hooks {
            // the directly-enlisted cells that actually carry a buffered write, union
            // the cells still-pending commutes affect — not every enlisted cell, since
            // a cell enlisted only for read validation never changes.
            let pre_trigger_ids = context::with_context(|ctx| {
                let mut ids: HashSet<CellId> = ctx
                    .enlisted
                    .iter()
                    .filter(|(_, cell)| cell.has_changes())
                    .map(|(id, _)| *id)
                    .collect();
                for commute in &ctx.commutes {
                    ids.extend(commute.affecting().iter().copied());
                }
                ids
            })?;
            hooks.trigger(&pre_trigger_ids);
        }

        // Held across both running the commutes and validating against them: a
        // commute re-reads the live committed value of its cells, so nothing else
        // may commit against those cells between the refreshed read and validation,
        // or the refresh would be stale by the time we check it. This widens
        // `stamp_lock`'s already-documented bottleneck rather than adding a second
        // one; it trades off concurrency across commute-bearing commits for never
        // having to re-run an already-consumed commute closure.
        let _guard = self.stamp_lock.lock().expect("stamp_lock poisoned");

        let commuted_ids = if had_commutes { self.run_commutes()? } else { HashSet::new() };

        if !items_enlisted.is_disjoint(&commuted_ids) {
            return Err(StmError::InvalidCommute);
        }

        let all_ids: HashSet<CellId> = items_enlisted.union(&commuted_ids).copied().collect();

        let write_ticket = self
            .versions
            .new_version(all_ids, if had_commutes { Some(commuted_ids.clone()) } else { None });

        // commuted cells validate first, matching the distilled ordering.
        let valid = context::with_context(|ctx| {
            commuted_ids
                .iter()
                .chain(items_enlisted.iter())
                .all(|id| ctx.enlisted.get(id).map(|cell| cell.can_commit(&write_ticket)).unwrap_or(true))
        })?;

        if valid {
            Ok((true, Some(write_ticket)))
        } else {
            self.versions.rollback_write(&write_ticket);
            Ok((false, None))
        }
    }

    /// Refreshes the attempt's read stamp to the current version, then runs every
    /// still-queued commute in an isolated sub-context with `block_commute` set, so
    /// none of them can defer further. Returns the cells the commutes touched. Only
    /// called when the transaction actually has commutes queued.
    fn run_commutes(&self) -> Result<HashSet<CellId>> {
        context::set_start_stamp(self.versions.current_stamp())?;
        context::isolated_run(true, commute::run_all_queued)
    }

    fn dispatch_side_effects(&self, side_effects: Vec<(context::Effect, context::Effect)>, committed: bool) {
        for (on_commit, on_rollback) in side_effects {
            if committed {
                on_commit();
            } else {
                on_rollback();
            }
        }
    }

    fn pace_trim(&self) {
        if self.config.trim_every == 0 {
            return;
        }
        let count = self.trim_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.config.trim_every == 0 {
            self.versions.trim_copies();
        }
    }
}
