//! Per-key in-flight operation cache.
//!
//! Concurrent callers asking for the same key while an operation is running
//! all await that one operation instead of starting their own. The operation
//! runs on its own task, so it completes (including any cleanup on timeout)
//! even if every caller goes away.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::error::{RuntimeError, RuntimeResult};

type PendingOp<T> = Shared<BoxFuture<'static, RuntimeResult<T>>>;

struct Slot<T> {
    generation: u64,
    op: PendingOp<T>,
}

type Arena<T> = Arc<Mutex<HashMap<String, Slot<T>>>>;

fn lock_arena<T>(arena: &Arena<T>) -> MutexGuard<'_, HashMap<String, Slot<T>>> {
    arena.lock().unwrap_or_else(|e| e.into_inner())
}

/// Clears a key once its operation settles, unless a newer run owns it.
struct Settle<T> {
    arena: Arena<T>,
    key: String,
    generation: u64,
}

impl<T> Drop for Settle<T> {
    fn drop(&mut self) {
        let mut pending = lock_arena(&self.arena);
        if pending
            .get(&self.key)
            .is_some_and(|slot| slot.generation == self.generation)
        {
            pending.remove(&self.key);
        }
    }
}

/// Arena of pending operations keyed by name.
pub struct InFlight<T: Clone> {
    pending: Arena<T>,
    generation: Arc<AtomicU64>,
}

impl<T: Clone> Clone for InFlight<T> {
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
            generation: Arc::clone(&self.generation),
        }
    }
}

impl<T: Clone> Default for InFlight<T> {
    fn default() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<T> InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot<T>>> {
        lock_arena(&self.pending)
    }

    /// Run `make()` for `key`, or join the run already in progress.
    ///
    /// `make` is only called by the caller that starts a new run. The key is
    /// cleared by the operation's own task, so it never outlives the run even
    /// if every caller is dropped first.
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> RuntimeResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RuntimeResult<T>> + Send + 'static,
    {
        let op = {
            let mut pending = self.lock();
            match pending.get(key) {
                Some(slot) => slot.op.clone(),
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let settle = Settle {
                        arena: Arc::clone(&self.pending),
                        key: key.to_string(),
                        generation,
                    };
                    let fut = make();
                    // The arena lock is held until the slot is inserted, so
                    // `settle` cannot run first.
                    let task = tokio::spawn(async move {
                        let _settle = settle;
                        fut.await
                    });
                    let owned_key = key.to_string();
                    let op = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => Err(RuntimeError::Io(format!(
                                "in-flight operation for {owned_key} failed: {e}"
                            ))),
                        }
                    }
                    .boxed()
                    .shared();
                    pending.insert(
                        key.to_string(),
                        Slot {
                            generation,
                            op: op.clone(),
                        },
                    );
                    op
                }
            }
        };
        op.await
    }

    /// Whether an operation for `key` is currently running.
    pub fn is_pending(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
