//! Bounded-concurrency execution of a batch of async units.

use std::future::Future;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

/// Runs a batch of futures with at most `limit` in flight.
///
/// Completion order is unspecified. A unit that fails (returns an `Err`
/// output) does not affect its siblings; only `token` stops the batch.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyLimiter {
    limit: usize,
}

impl ConcurrencyLimiter {
    /// A limit of zero is treated as one.
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Drive `units` to completion and collect the outputs of those that ran.
    ///
    /// Once `token` is cancelled, units that have not started are skipped and
    /// in-flight units are dropped at their next suspension point, so their
    /// outputs never reach the caller.
    pub async fn run<I, F, T>(&self, units: I, token: &CancellationToken) -> Vec<T>
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = T>,
    {
        let token = token.clone();
        let mut pending = units.into_iter().collect::<Vec<_>>().into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut outputs = Vec::new();

        loop {
            while in_flight.len() < self.limit && !token.is_cancelled() {
                match pending.next() {
                    Some(unit) => in_flight.push(unit),
                    None => break,
                }
            }
            if in_flight.is_empty() {
                break;
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(output) = in_flight.next() => outputs.push(output),
            }
        }
        outputs
    }
}
