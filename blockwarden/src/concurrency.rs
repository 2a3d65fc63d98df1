use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use futures::{stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

use crate::error::Error;

/// Runs work keyed by a token with bounded concurrency, at most once per token
/// at a time. A token that is already in flight is skipped, not queued.
#[derive(Debug)]
pub struct LimitedConcurrencySingleFlight {
    in_flight: Arc<Mutex<HashSet<String>>>,
    drained: Arc<Notify>,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
}

struct InFlightGuard {
    token: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
    drained: Arc<Notify>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock();
        in_flight.remove(&self.token);
        if in_flight.is_empty() {
            self.drained.notify_waiters();
        }
    }
}

impl LimitedConcurrencySingleFlight {
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            drained: Arc::new(Notify::new()),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    /// Calls `f` for every token not already in flight and waits for all of
    /// them. Every call runs to completion; the first error is returned.
    pub async fn for_each_not_in_flight<F, Fut>(&self, tokens: Vec<String>, f: F) -> Result<(), Error>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        let guards: Vec<InFlightGuard> = {
            let mut in_flight = self.in_flight.lock();
            tokens
                .into_iter()
                .filter(|token| in_flight.insert(token.clone()))
                .map(|token| InFlightGuard {
                    token,
                    in_flight: self.in_flight.clone(),
                    drained: self.drained.clone(),
                })
                .collect()
        };

        let f = &f;
        let results: Vec<Result<(), Error>> = stream::iter(guards)
            .map(|guard| async move {
                let _permit = self
                    .semaphore
                    .acquire()
                    .await
                    .map_err(|_| Error::internal("single flight semaphore closed".to_string()))?;
                let result = f(guard.token.clone()).await;
                drop(guard);
                result
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        results.into_iter().collect()
    }

    /// Waits until no token is in flight.
    pub async fn wait(&self) {
        loop {
            let drained = self.drained.notified();
            if self.in_flight.lock().is_empty() {
                return;
            }
            drained.await;
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}
