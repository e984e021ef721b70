// SPDX-License-Identifier: Apache-2.0

//! The global version list: monotonic stamp allocation, reader tickets,
//! writer-writer conflict detection and bounded trimming of stale cell copies.
//!
//! Entries are allocated once via `Box::into_raw` and linked forward through a
//! single-writer-wins `later` pointer, in the same leak-and-walk style as this
//! crate's lock-free stack and queue. Entries are never freed: they are small,
//! fixed-size bookkeeping records, and the memory trimming is actually meant to
//! bound — historical cell copies — is released through [`Cell::trim_copies`]
//! instead. See [`VersionList::trim_copies`] for the reasoning.

use crate::cell::{CellId, CellRef};
use std::{
    collections::HashSet,
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicU8, Ordering},
        Mutex,
    },
};

const CHECKING: u8 = 0;
const COMMIT: u8 = 1;
const ROLLBACK: u8 = 2;

/// Sentinel written into `reader_count` once an entry has been trimmed: no further
/// reader may register against it.
const TOMBSTONE: i64 = i64::MIN;

struct VersionEntry {
    stamp: u64,
    state: AtomicU8,
    enlisted: Mutex<Option<HashSet<CellId>>>,
    comm_enlisted: Mutex<Option<HashSet<CellId>>>,
    changes: Mutex<Option<Vec<CellRef>>>,
    reader_count: AtomicI64,
    later: AtomicPtr<VersionEntry>,
}

impl VersionEntry {
    fn base() -> Self {
        Self {
            stamp: 0,
            state: AtomicU8::new(COMMIT),
            enlisted: Mutex::new(None),
            comm_enlisted: Mutex::new(None),
            changes: Mutex::new(None),
            reader_count: AtomicI64::new(0),
            later: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn checking(stamp: u64, enlisted: HashSet<CellId>, comm_enlisted: Option<HashSet<CellId>>) -> Self {
        Self {
            stamp,
            state: AtomicU8::new(CHECKING),
            enlisted: Mutex::new(Some(enlisted)),
            comm_enlisted: Mutex::new(comm_enlisted),
            changes: Mutex::new(None),
            reader_count: AtomicI64::new(0),
            later: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// A handle pinning the minimum reachable version. While held, no version it covers
/// may be trimmed. Releases its registration on drop.
pub struct ReadTicket {
    stamp: u64,
    entry: *const VersionEntry,
}

// SAFETY: `entry` points at a `VersionEntry` that is never freed (see module docs)
// and whose fields are all independently synchronized; sending the ticket across
// threads just moves which thread eventually decrements `reader_count`.
unsafe impl Send for ReadTicket {}

impl ReadTicket {
    /// The stamp this ticket pins.
    pub fn stamp(&self) -> u64 {
        self.stamp
    }
}

impl Drop for ReadTicket {
    fn drop(&mut self) {
        unsafe { &*self.entry }.reader_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A handle referencing the version-list entry a writer is finalizing. Extends the
/// read stamp with the bookkeeping the commit pipeline needs to validate and install
/// the writer's changes.
#[derive(Clone, Copy)]
pub struct WriteTicket {
    entry: *const VersionEntry,
    stamp: u64,
}

// SAFETY: see `ReadTicket`.
unsafe impl Send for WriteTicket {}
unsafe impl Sync for WriteTicket {}

impl WriteTicket {
    /// The stamp this write is provisionally assigned.
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    fn entry(&self) -> &VersionEntry {
        unsafe { &*self.entry }
    }

    pub(crate) fn enlisted_cells(&self) -> HashSet<CellId> {
        self.entry()
            .enlisted
            .lock()
            .expect("version entry poisoned")
            .clone()
            .unwrap_or_default()
    }

    pub(crate) fn commute_cells(&self) -> Option<HashSet<CellId>> {
        self.entry().comm_enlisted.lock().expect("version entry poisoned").clone()
    }

    /// Records the cells this write ticket actually installed. May be called exactly
    /// once, after which the ticket becomes eligible for trimming.
    pub(crate) fn set_changes(&self, changes: Vec<CellRef>) {
        let mut guard = self.entry().changes.lock().expect("version entry poisoned");
        debug_assert!(guard.is_none(), "WriteTicket.changes must be set exactly once");
        *guard = Some(changes);
    }
}

/// The global, singly-linked version list.
pub struct VersionList {
    current: AtomicPtr<VersionEntry>,
    oldest_read: AtomicPtr<VersionEntry>,
    trimming: AtomicBool,
}

impl Default for VersionList {
    fn default() -> Self {
        let base = Box::into_raw(Box::new(VersionEntry::base()));
        Self {
            current: AtomicPtr::new(base),
            oldest_read: AtomicPtr::new(base),
            trimming: AtomicBool::new(false),
        }
    }
}

// SAFETY: every field is an atomic, and the `VersionEntry` nodes reached through them
// are immutable after construction except through their own inner synchronization.
unsafe impl Send for VersionList {}
unsafe impl Sync for VersionList {}

impl VersionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the latest committed-or-checking version and returns a ticket for it.
    pub fn get_reader_ticket(&self) -> ReadTicket {
        loop {
            let cur_ptr = self.current.load(Ordering::Acquire);
            let cur = unsafe { &*cur_ptr };
            let prev = cur.reader_count.fetch_add(1, Ordering::AcqRel);
            if prev < 0 {
                // raced a trim that tombstoned this entry out from under us; undo and
                // retry against whatever `current` has since become.
                cur.reader_count.fetch_sub(1, Ordering::AcqRel);
                continue;
            }
            return ReadTicket { stamp: cur.stamp, entry: cur_ptr };
        }
    }

    /// For code nested inside an already-held transaction: the outer ticket already
    /// pins the floor, so this samples the current stamp without registering a reader.
    pub fn current_stamp(&self) -> u64 {
        unsafe { &*self.current.load(Ordering::Acquire) }.stamp
    }

    /// Allocates a write ticket for `enlisted` (and, if commutes are in play,
    /// `comm_enlisted`), waiting out any conflicting in-flight writer first.
    pub fn new_version(&self, enlisted: HashSet<CellId>, comm_enlisted: Option<HashSet<CellId>>) -> WriteTicket {
        loop {
            let mut cur_ptr = self.current.load(Ordering::Acquire);
            loop {
                let cur = unsafe { &*cur_ptr };
                let later_ptr = cur.later.load(Ordering::Acquire);
                if later_ptr.is_null() {
                    break;
                }
                let later = unsafe { &*later_ptr };
                if later.state.load(Ordering::Acquire) == CHECKING && is_conflict(&enlisted, &comm_enlisted, later) {
                    while later.state.load(Ordering::Acquire) == CHECKING {
                        std::hint::spin_loop();
                    }
                }
                cur_ptr = later_ptr;
            }

            let cur = unsafe { &*cur_ptr };
            let new_stamp = cur.stamp + 1;
            let new_entry = Box::into_raw(Box::new(VersionEntry::checking(
                new_stamp,
                enlisted.clone(),
                comm_enlisted.clone(),
            )));

            match cur
                .later
                .compare_exchange(ptr::null_mut(), new_entry, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    return WriteTicket {
                        entry: new_entry,
                        stamp: new_stamp,
                    }
                }
                Err(_) => {
                    // someone else reached the tail first; drop our speculative node
                    // and restart the walk.
                    drop(unsafe { Box::from_raw(new_entry) });
                }
            }
        }
    }

    /// Finalizes `ticket` as committed and advances `current` past it if possible.
    pub(crate) fn commit_write(&self, ticket: &WriteTicket) {
        self.finalize(ticket, COMMIT);
    }

    /// Finalizes `ticket` as rolled back and advances `current` past it if possible.
    pub(crate) fn rollback_write(&self, ticket: &WriteTicket) {
        self.finalize(ticket, ROLLBACK);
    }

    fn finalize(&self, ticket: &WriteTicket, state: u8) {
        let entry = ticket.entry();
        *entry.enlisted.lock().expect("version entry poisoned") = None;
        *entry.comm_enlisted.lock().expect("version entry poisoned") = None;
        entry.state.store(state, Ordering::Release);
        if state == ROLLBACK {
            // a rolled-back entry installed nothing, but it must still carry a `Some`
            // changes list so `trim_copies` can walk past it instead of stalling there
            // forever waiting for a commit that will never set one.
            let mut changes = entry.changes.lock().expect("version entry poisoned");
            if changes.is_none() {
                *changes = Some(Vec::new());
            }
        }
        self.move_current();
    }

    fn move_current(&self) {
        loop {
            let cur_ptr = self.current.load(Ordering::Acquire);
            let cur = unsafe { &*cur_ptr };
            let later_ptr = cur.later.load(Ordering::Acquire);
            if later_ptr.is_null() {
                return;
            }
            let later = unsafe { &*later_ptr };
            if later.state.load(Ordering::Acquire) == CHECKING {
                return;
            }
            if self
                .current
                .compare_exchange(cur_ptr, later_ptr, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // another thread already advanced past us; `current` only ever moves
                // forward so there is nothing left to do.
                return;
            }
        }
    }

    /// Advances the oldest-reachable marker past every contiguous finalized entry
    /// that has installed changes and no live readers, dispatching
    /// [`crate::cell::Cell::trim_copies`] on the union of cells touched along the way.
    ///
    /// Guarded by a CAS flag so only one thread runs a trim pass at a time; other
    /// callers return immediately rather than blocking.
    pub fn trim_copies(&self) {
        if self
            .trimming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        struct ResetOnDrop<'a>(&'a AtomicBool);
        impl Drop for ResetOnDrop<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::Release);
            }
        }
        let _guard = ResetOnDrop(&self.trimming);

        let mut to_trim: Vec<CellRef> = Vec::new();
        let mut walker = self.oldest_read.load(Ordering::Acquire);

        loop {
            if walker == self.current.load(Ordering::Acquire) {
                break;
            }
            let w = unsafe { &*walker };
            let later_ptr = w.later.load(Ordering::Acquire);
            if later_ptr.is_null() {
                break;
            }
            let later = unsafe { &*later_ptr };
            let later_has_changes = later.changes.lock().expect("version entry poisoned").is_some();
            if !later_has_changes {
                break;
            }
            match w
                .reader_count
                .compare_exchange(0, TOMBSTONE, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if let Some(changes) = later.changes.lock().expect("version entry poisoned").clone() {
                        to_trim.extend(changes);
                    }
                    walker = later_ptr;
                }
                Err(_) => break,
            }
        }

        let w = unsafe { &*walker };
        *w.changes.lock().expect("version entry poisoned") = None;
        let up_to_stamp = w.stamp;
        self.oldest_read.store(walker, Ordering::Release);

        let mut seen = HashSet::new();
        for cell in to_trim {
            if seen.insert(cell.id()) {
                cell.trim_copies(up_to_stamp);
            }
        }
    }
}

fn is_conflict(new_enlisted: &HashSet<CellId>, new_comm: &Option<HashSet<CellId>>, old: &VersionEntry) -> bool {
    if old.state.load(Ordering::Acquire) != CHECKING {
        return false;
    }
    let old_enlisted_guard = old.enlisted.lock().expect("version entry poisoned");
    let old_enlisted = match old_enlisted_guard.as_ref() {
        Some(set) => set,
        None => return false,
    };
    let old_comm_guard = old.comm_enlisted.lock().expect("version entry poisoned");
    let old_comm = old_comm_guard.as_ref();

    if !new_enlisted.is_disjoint(old_enlisted) {
        return true;
    }
    if let Some(oc) = old_comm {
        if !new_enlisted.is_disjoint(oc) {
            return true;
        }
    }
    if let Some(nc) = new_comm {
        if !nc.is_disjoint(old_enlisted) {
            return true;
        }
        if let Some(oc) = old_comm {
            if !nc.is_disjoint(oc) {
                return true;
            }
        }
    }
    false
}
