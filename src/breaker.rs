// SPDX-License-Identifier: Apache-2.0

use std::{
    error::Error,
    sync::atomic::{AtomicUsize, Ordering},
};

const MAX_WAIT_UNITS: usize = 7;

/// A busy-spin circuit breaker: each call doubles the number of spin-loop hints it
/// burns, up to [`MAX_WAIT_UNITS`], after which it refuses to spin further.
#[derive(Default)]
pub struct BusyBreaker {
    unit: AtomicUsize,
}

impl BusyBreaker {
    /// Keeps the CPU busy for a short, exponentially increasing delay.
    pub fn spin(&self) -> Result<(), Box<dyn Error>> {
        match self.unit.load(Ordering::Acquire) {
            unit if unit <= MAX_WAIT_UNITS => {
                for _ in 0..(1 << unit) {
                    core::hint::spin_loop();
                }
                self.unit.store(unit + 1, Ordering::Release);
                Ok(())
            }
            _ => Err("reached maximum backoff units".into()),
        }
    }

    /// Resets the breaker to its initial, least-patient state.
    pub fn reset(&self) {
        self.unit.store(0, Ordering::Release);
    }
}
