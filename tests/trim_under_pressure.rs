// SPDX-License-Identifier: Apache-2.0

mod support;

use rand::Rng;
use std::sync::Arc;
use std::thread;
use support::Shielded;
use vstm::Stm;

const WRITERS: usize = 8;
const TRANSACTIONS_PER_WRITER: usize = 10_000;
const CELL_COUNT: usize = 1_000;

/// A historical-copy count this far above the writer count is never legitimate: with
/// `trim_every = 16`, at most a handful of commits can be in flight past the oldest
/// live reader at once, regardless of how many transactions have run in total.
const MAX_PLAUSIBLE_VERSIONS_PER_CELL: usize = WRITERS * 4;

#[test]
fn historical_copies_stay_bounded_across_many_transactions() {
    let stm = Arc::new(Stm::new());
    let cells: Vec<Arc<Shielded<i64>>> = (0..CELL_COUNT).map(|_| Shielded::new(0i64)).collect();

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let stm = stm.clone();
            let cells = cells.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..TRANSACTIONS_PER_WRITER {
                    let index = rng.gen_range(0..CELL_COUNT);
                    let cell = cells[index].clone();
                    stm.in_transaction(move || {
                        let v = cell.get();
                        cell.set(v + 1)
                    })
                    .unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    // a final manual pass in case the last commits landed between pacing intervals.
    for _ in 0..4 {
        stm.in_transaction(|| Ok(())).unwrap();
    }

    let total: i64 = cells.iter().map(|c| stm.in_transaction(|| Ok(c.get())).unwrap()).sum();
    assert_eq!(
        total,
        (WRITERS * TRANSACTIONS_PER_WRITER) as i64,
        "every increment across every writer must land exactly once"
    );

    let max_versions = cells.iter().map(|c| c.version_count()).max().unwrap();
    assert!(
        max_versions <= MAX_PLAUSIBLE_VERSIONS_PER_CELL,
        "historical copies must stay bounded by live-reader pressure, not by the {} transactions executed (saw {} versions on the worst cell)",
        WRITERS * TRANSACTIONS_PER_WRITER,
        max_versions,
    );
}
