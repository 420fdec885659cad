//! Cancelable async mutex.
//!
//! Batch loading and reorg handling run under one exclusive lock. `reset`
//! and `kill` cancel it: every waiter (and every later acquire attempt)
//! fails with the [`EngineError::Canceled`] sentinel, which callers must
//! treat as "not an error" — it only means the engine is tearing state down.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify};

use crate::EngineError;

pub struct CancelableMutex {
    inner: Mutex<()>,
    canceled: AtomicBool,
    notify: Notify,
}

impl CancelableMutex {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(()),
            canceled: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Run `fut` while holding the lock. A future already running when the
    /// mutex is canceled completes normally; waiters get the sentinel.
    pub async fn run_exclusive<T, F>(&self, fut: F) -> Result<T, EngineError>
    where
        F: Future<Output = T>,
    {
        if self.canceled.load(Ordering::SeqCst) {
            return Err(EngineError::Canceled);
        }
        tokio::select! {
            guard = self.inner.lock() => {
                if self.canceled.load(Ordering::SeqCst) {
                    return Err(EngineError::Canceled);
                }
                let out = fut.await;
                drop(guard);
                Ok(out)
            }
            _ = self.notify.notified() => Err(EngineError::Canceled),
        }
    }

    /// Reject all waiters and future acquires until [`CancelableMutex::clear`].
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Make the mutex usable again after a cancel.
    pub fn clear(&self) {
        self.canceled.store(false, Ordering::SeqCst);
    }
}

impl Default for CancelableMutex {
    fn default() -> Self {
        Self::new()
    }
}
