//! Bounded worker pool shared by the scheduler and collector loops.

use std::collections::HashSet;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("worker pool saturated ({capacity} units queued or running)")]
pub struct PoolSaturated {
    pub capacity: usize,
}

/// Runs at most `workers` units at once and accepts at most
/// `workers * queue_factor` units in total.
///
/// When full, [`WorkerPool::spawn`] refuses the unit so the caller can skip
/// it until the next cycle instead of queuing without bound.
#[derive(Clone)]
pub struct WorkerPool {
    name: &'static str,
    permits: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    capacity: usize,
}

/// Decrements the pending count when a unit finishes or is dropped.
struct Slot(Arc<AtomicUsize>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A unit's hold on its worker permit and queue slot. Work the unit hands
/// off to another task keeps counting against the pool while it holds this.
pub struct Lease {
    _permit: Option<OwnedSemaphorePermit>,
    _slot: Slot,
}

impl WorkerPool {
    pub fn new(name: &'static str, workers: usize, queue_factor: usize) -> Self {
        let workers = workers.max(1);
        Self {
            name,
            permits: Arc::new(Semaphore::new(workers)),
            pending: Arc::new(AtomicUsize::new(0)),
            capacity: workers * queue_factor.max(1),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Units queued or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Queue `fut`; it starts once a worker permit is free.
    pub fn spawn<F>(&self, fut: F) -> Result<JoinHandle<F::Output>, PoolSaturated>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawn_leased(move |lease| async move {
            let _lease = lease;
            fut.await
        })
    }

    /// Like [`WorkerPool::spawn`], but the unit receives its [`Lease`] and
    /// decides how long to hold it.
    pub fn spawn_leased<U, F>(&self, unit: U) -> Result<JoinHandle<F::Output>, PoolSaturated>
    where
        U: FnOnce(Lease) -> F + Send + 'static,
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let claimed = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            });
        if claimed.is_err() {
            return Err(PoolSaturated {
                capacity: self.capacity,
            });
        }

        let slot = Slot(self.pending.clone());
        let permits = self.permits.clone();
        Ok(tokio::spawn(async move {
            // The semaphore is never closed.
            let permit = permits.acquire_owned().await.ok();
            unit(Lease {
                _permit: permit,
                _slot: slot,
            })
            .await
        }))
    }
}

/// Keys of units currently queued or running, so a unit is never claimed
/// twice across overlapping cycles.
pub struct ClaimSet<K> {
    keys: Arc<Mutex<HashSet<K>>>,
}

impl<K> Default for ClaimSet<K> {
    fn default() -> Self {
        Self {
            keys: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl<K: Eq + Hash + Clone> ClaimSet<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` if `key` is already claimed.
    pub fn claim(&self, key: K) -> Option<Claim<K>> {
        let mut keys = self.keys.lock().ok()?;
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(Claim {
            key,
            keys: self.keys.clone(),
        })
    }

    #[cfg(test)]
    pub fn is_claimed(&self, key: &K) -> bool {
        self.keys.lock().map(|k| k.contains(key)).unwrap_or(false)
    }
}

/// Releases its key when dropped.
pub struct Claim<K: Eq + Hash> {
    key: K,
    keys: Arc<Mutex<HashSet<K>>>,
}

impl<K: Eq + Hash> Drop for Claim<K> {
    fn drop(&mut self) {
        if let Ok(mut keys) = self.keys.lock() {
            keys.remove(&self.key);
        }
    }
}
