// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration surface: what to do when a commit needs to retry, and how
//! often to pace the trimmer.

use crate::breaker::BusyBreaker;

/// How a failed commit validation is handled before the transaction is retried.
pub enum RetryStrategy {
    /// Retry immediately, with no backoff. Matches the behavior of the distilled
    /// commit loop.
    Retry,

    /// Retry after a short, exponentially increasing busy-spin. Trades a small
    /// amount of latency for less contention on `stamp_lock` and the cells under
    /// high conflict rates.
    RetryWithBreaker(BusyBreaker),

    /// Do not retry: propagate [`crate::error::StmError::RetryRequested`] to the
    /// caller of [`crate::Stm::in_transaction`] instead.
    Abort,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::Retry
    }
}

/// Tunables for one [`crate::Stm`] instance.
pub struct RuntimeConfig {
    pub retry_strategy: RetryStrategy,
    /// Run a trim pass every `trim_every`-th commit or rollback. Zero disables
    /// automatic trimming entirely (callers must invoke trimming manually).
    pub trim_every: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            retry_strategy: RetryStrategy::default(),
            trim_every: 16,
        }
    }
}
