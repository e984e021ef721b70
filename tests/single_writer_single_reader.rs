// SPDX-License-Identifier: Apache-2.0

mod support;

use std::sync::{Arc, Barrier};
use std::thread;
use support::Shielded;
use vstm::Stm;

#[test]
fn reader_started_before_a_commit_never_sees_it() {
    let stm = Arc::new(Stm::new());
    let cell = Shielded::new(0i64);

    let read_done = Arc::new(Barrier::new(2));
    let commit_done = Arc::new(Barrier::new(2));

    let reader = {
        let stm = stm.clone();
        let cell = cell.clone();
        let read_done = read_done.clone();
        let commit_done = commit_done.clone();
        thread::spawn(move || {
            stm.in_transaction(|| {
                let seen = cell.get();
                read_done.wait();
                commit_done.wait();
                Ok(seen)
            })
            .unwrap()
        })
    };

    let writer = {
        let stm = stm.clone();
        let cell = cell.clone();
        thread::spawn(move || {
            read_done.wait();
            stm.in_transaction(|| cell.set(1)).unwrap();
            commit_done.wait();
        })
    };

    let seen_by_reader = reader.join().unwrap();
    writer.join().unwrap();

    assert_eq!(seen_by_reader, 0, "reader pinned before the commit must not observe it");

    let seen_after = stm.in_transaction(|| Ok(cell.get())).unwrap();
    assert_eq!(seen_after, 1, "a transaction started after the commit must observe it");
}
