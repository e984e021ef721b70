// SPDX-License-Identifier: Apache-2.0

//! A reference [`Cell`] implementation for the integration tests: an MVCC-ish cell
//! that keeps one committed version per stamp it was written at, plus whatever
//! locally buffered value the calling thread's transaction has pending.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    thread::{self, ThreadId},
};
use vstm::{Cell, CellId, CellRef, Result, WriteTicket};

#[ctor::ctor]
/// Runs before any test in the binary.
fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

pub struct Shielded<T: Clone + Send + Sync + 'static> {
    marker: Arc<()>,
    versions: Mutex<Vec<(u64, Arc<T>)>>,
    local: Mutex<HashMap<ThreadId, T>>,
}

impl<T: Clone + Send + Sync + 'static> Shielded<T> {
    pub fn new(initial: T) -> Arc<Self> {
        Arc::new(Self {
            marker: Arc::new(()),
            versions: Mutex::new(vec![(0, Arc::new(initial))]),
            local: Mutex::new(HashMap::new()),
        })
    }

    /// Reads the value visible at the calling transaction's start stamp, or this
    /// thread's own pending write if it already has one buffered.
    pub fn get(self: &Arc<Self>) -> T {
        let tid = thread::current().id();
        if let Some(pending) = self.local.lock().expect("local poisoned").get(&tid) {
            return pending.clone();
        }
        let stamp = vstm::current_start_stamp().unwrap_or(u64::MAX);
        let versions = self.versions.lock().expect("versions poisoned");
        versions
            .iter()
            .rev()
            .find(|(s, _)| *s <= stamp)
            .or_else(|| versions.first())
            .map(|(_, v)| (**v).clone())
            .expect("a cell always has at least its initial version")
    }

    /// Buffers `value` locally and enlists this cell with the active transaction.
    pub fn set(self: &Arc<Self>, value: T) -> Result<()> {
        let tid = thread::current().id();
        let has_locals = self.local.lock().expect("local poisoned").contains_key(&tid);
        vstm::enlist(&(self.clone() as CellRef), has_locals)?;
        self.local.lock().expect("local poisoned").insert(tid, value);
        Ok(())
    }

    /// Number of historical versions currently retained, for trim-bound assertions.
    pub fn version_count(&self) -> usize {
        self.versions.lock().expect("versions poisoned").len()
    }

    /// The latest committed value, bypassing any active transaction's pinned start
    /// stamp. For post-commit observers, which run after a cell's new version is
    /// installed but while the committing thread's own stamp is still the old one.
    pub fn committed_value(&self) -> T {
        let versions = self.versions.lock().expect("versions poisoned");
        versions
            .last()
            .map(|(_, v)| (**v).clone())
            .expect("a cell always has at least its initial version")
    }

    /// Enlists this cell with the active transaction without buffering a write.
    /// `get` alone only validates against the pinned start stamp and never joins the
    /// enlisted set, so the commute degeneration check never sees a plain read; this
    /// gives tests a way to put a cell "in play" the way a read-tracking cell would.
    pub fn touch(self: &Arc<Self>) -> Result<()> {
        let has_locals = self
            .local
            .lock()
            .expect("local poisoned")
            .contains_key(&thread::current().id());
        vstm::enlist(&(self.clone() as CellRef), has_locals)?;
        Ok(())
    }
}

impl<T: Clone + Send + Sync + 'static> Cell for Shielded<T> {
    fn id(&self) -> CellId {
        CellId::of(&self.marker)
    }

    fn has_changes(&self) -> bool {
        self.local
            .lock()
            .expect("local poisoned")
            .contains_key(&thread::current().id())
    }

    fn can_commit(&self, _ticket: &WriteTicket) -> bool {
        let start_stamp = vstm::current_start_stamp().unwrap_or(0);
        let versions = self.versions.lock().expect("versions poisoned");
        versions.last().map(|(s, _)| *s <= start_stamp).unwrap_or(true)
    }

    fn commit(&self, stamp: u64) {
        let tid = thread::current().id();
        if let Some(value) = self.local.lock().expect("local poisoned").remove(&tid) {
            self.versions.lock().expect("versions poisoned").push((stamp, Arc::new(value)));
        }
    }

    fn rollback(&self) {
        let tid = thread::current().id();
        self.local.lock().expect("local poisoned").remove(&tid);
    }

    fn trim_copies(&self, up_to_stamp: u64) {
        let mut versions = self.versions.lock().expect("versions poisoned");
        if let Some(keep_from) = versions.iter().rposition(|(s, _)| *s <= up_to_stamp) {
            if keep_from > 0 {
                versions.drain(0..keep_from);
            }
        }
    }
}

/// Records every cell set passed to its hooks, for assertions on hook-firing order
/// and membership. Both hook traits are implemented on the same type since tests
/// usually want to observe both phases of one commit together.
#[derive(Default)]
pub struct RecordingHooks {
    pub pre_fired: Mutex<Vec<std::collections::HashSet<CellId>>>,
    pub post_fired: Mutex<Vec<std::collections::HashSet<CellId>>>,
}

impl RecordingHooks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl vstm::PreCommitHooks for RecordingHooks {
    fn trigger(&self, cells: &std::collections::HashSet<CellId>) {
        self.pre_fired.lock().expect("pre_fired poisoned").push(cells.clone());
    }
}

impl vstm::PostCommitHooks for RecordingHooks {
    fn trigger(&self, cells: &std::collections::HashSet<CellId>) -> Vec<Box<dyn FnOnce() + Send>> {
        self.post_fired.lock().expect("post_fired poisoned").push(cells.clone());
        Vec::new()
    }
}
