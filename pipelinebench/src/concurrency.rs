//! Concurrency limiter for in-flight trials.
//!
//! [`ConcurrencyLimiter`] caps the number of trials with an outstanding upload or poll using a
//! tokio semaphore. A trial holds its [`ConcurrencyPermit`] for its whole lifetime, so the permit
//! count is the number of trials in flight. The limiter also records the highest count observed,
//! which the orchestrator reports after the run.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Limits concurrent trials and tracks the in-flight count.
#[derive(Clone, Debug)]
pub(crate) struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max: usize,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyLimiter {
    /// Creates a new limiter with the given maximum number of permits.
    ///
    /// A `max` of zero is treated as one, so that trials can always make progress.
    pub(crate) fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Waits for a free slot and acquires it.
    ///
    /// Waiters are served in the order they called `acquire`.
    pub(crate) async fn acquire(&self) -> ConcurrencyPermit {
        // The semaphore is owned by the limiter and never closed.
        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("limiter semaphore closed"),
        };

        self.peak.fetch_max(self.used_permits(), Ordering::Relaxed);
        ConcurrencyPermit { _permit: permit }
    }

    /// Returns the number of permits currently held.
    pub(crate) fn used_permits(&self) -> usize {
        self.max - self.semaphore.available_permits()
    }

    /// Returns the highest number of permits held at the same time so far.
    pub(crate) fn peak_permits(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

/// RAII guard for a concurrency permit. Dropping it frees the slot.
#[derive(Debug)]
pub(crate) struct ConcurrencyPermit {
    _permit: OwnedSemaphorePermit,
}
