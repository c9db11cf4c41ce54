use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::Result;
use tokio::sync::Semaphore;

use crate::error::SyncError;

/// Caps the number of simultaneously running backend requests.
///
/// Waiters are admitted in FIFO order because the tokio semaphore is fair.
#[derive(Debug)]
pub struct ConcurrencyThrottler {
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    in_flight: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
}

struct CounterGuard(Arc<AtomicUsize>);

impl CounterGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyThrottler {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            in_flight: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Runs `operation` once a slot is free. The closure is not invoked
    /// until then, and the slot is released however the future ends.
    pub async fn throttle<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = {
            let _waiting = CounterGuard::enter(&self.queued);
            self.slots
                .acquire()
                .await
                .map_err(|_| SyncError::ThrottlerClosed)?
        };
        let running = CounterGuard::enter(&self.in_flight);
        let result = operation().await;
        drop(running);
        drop(permit);
        result
    }
}

#[cfg(test)]
#[path = "tests/throttle_tests.rs"]
mod tests;
