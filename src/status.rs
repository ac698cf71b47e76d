//! Shared sync-status indicator.
//!
//! `ready → syncing → {saved | ready | offline | conflict}`. `saved` falls
//! back to `ready` after [`SAVED_DISPLAY_WINDOW`] unless another transition
//! happened in between.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::models::SyncStatus;

/// How long `saved` stays visible after a successful write.
pub const SAVED_DISPLAY_WINDOW: Duration = Duration::from_secs(2);

struct Inner {
    tx: watch::Sender<SyncStatus>,
    /// Bumped on every transition; the delayed revert only fires if it is
    /// unchanged.
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct SyncStatusHandle {
    inner: Arc<Inner>,
}

impl Default for SyncStatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStatusHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncStatus::Ready);
        Self {
            inner: Arc::new(Inner {
                tx,
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn get(&self) -> SyncStatus {
        *self.inner.tx.borrow()
    }

    pub fn set(&self, status: SyncStatus) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let previous = self.inner.tx.send_replace(status);
        if previous != status {
            debug!(from = previous.as_str(), to = status.as_str(), "sync status");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.inner.tx.subscribe()
    }

    /// Show `saved`, then revert to `ready` after the display window.
    pub fn mark_saved(&self) {
        self.set(SyncStatus::Saved);
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let handle = self.clone();
        rt.spawn(async move {
            tokio::time::sleep(SAVED_DISPLAY_WINDOW).await;
            handle.revert_saved(generation);
        });
    }

    fn revert_saved(&self, generation: u64) {
        if self.inner.generation.load(Ordering::SeqCst) == generation
            && self.get() == SyncStatus::Saved
        {
            self.set(SyncStatus::Ready);
        }
    }
}
