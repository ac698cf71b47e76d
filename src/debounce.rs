//! Per-key write coalescing.
//!
//! Each key has at most one pending timer. Scheduling again for the same key
//! cancels the previous timer through its [`CancellationToken`], so only the
//! last task scheduled within the window runs.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct Pending {
    seq: u64,
    cancel: CancellationToken,
    fire_now: CancellationToken,
    handle: JoinHandle<()>,
}

type PendingMap<K> = Arc<Mutex<HashMap<K, Pending>>>;

pub struct Debouncer<K> {
    delay: Duration,
    pending: PendingMap<K>,
    seq: AtomicU64,
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + std::fmt::Debug + 'static,
{
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Arc::new(Mutex::new(HashMap::new())),
            seq: AtomicU64::new(0),
        }
    }

    /// Run `task` after the delay unless another task is scheduled for `key`
    /// first. Must be called inside a tokio runtime.
    pub fn schedule<F, Fut>(&self, key: K, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            warn!(?key, "no async runtime, debounced write dropped");
            return;
        };

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let fire_now = CancellationToken::new();
        let delay = self.delay;

        let mut map = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = map.remove(&key) {
            previous.cancel.cancel();
            debug!(?key, "superseded pending write");
        }

        let pending = Arc::clone(&self.pending);
        let task_key = key.clone();
        let task_cancel = cancel.clone();
        let task_fire_now = fire_now.clone();
        let handle = rt.spawn(async move {
            let run = tokio::select! {
                biased;
                _ = task_cancel.cancelled() => false,
                _ = task_fire_now.cancelled() => true,
                _ = tokio::time::sleep(delay) => {
                    claim(&pending, &task_key, seq) || task_fire_now.is_cancelled()
                }
            };
            if run {
                task().await;
            }
        });

        map.insert(
            key,
            Pending {
                seq,
                cancel,
                fire_now,
                handle,
            },
        );
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run every pending task now and wait for them to finish.
    pub async fn flush(&self) {
        // Fire under the lock so a timer elapsing concurrently still runs.
        let handles: Vec<JoinHandle<()>> = {
            let mut map = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            map.drain()
                .map(|(_, p)| {
                    p.fire_now.cancel();
                    p.handle
                })
                .collect()
        };
        if handles.is_empty() {
            return;
        }
        debug!(count = handles.len(), "flushing pending writes");
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "pending write task failed");
            }
        }
    }

    /// Drop every pending task without running it.
    pub fn cancel_all(&self) {
        let mut map = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, pending) in map.drain() {
            pending.cancel.cancel();
        }
    }
}

/// Remove the entry for `key` if it still belongs to timer `seq`.
fn claim<K: Eq + Hash>(pending: &Mutex<HashMap<K, Pending>>, key: &K, seq: u64) -> bool {
    let mut map = pending.lock().unwrap_or_else(PoisonError::into_inner);
    match map.get(key) {
        Some(entry) if entry.seq == seq => {
            map.remove(key);
            true
        }
        _ => false,
    }
}
