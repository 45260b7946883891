//! Completion primitives shared by pipeline stages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::Notify;

/// Idempotent completion flag.
///
/// `complete` succeeds exactly once, no matter how many call sites race on
/// it. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

#[derive(Debug, Default)]
struct CompletionInner {
    done: AtomicBool,
    notify: Notify,
}

impl Completion {
    /// Create an incomplete flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark as complete. Returns `true` only for the call that flipped the flag.
    pub fn complete(&self) -> bool {
        let first = self
            .inner
            .done
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// Check if complete.
    pub fn is_completed(&self) -> bool {
        self.inner.done.load(Ordering::SeqCst)
    }

    /// Wait until complete.
    pub async fn completed(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_completed() {
            return;
        }
        notified.await;
    }
}

/// Single-assignment cell: written once, awaited by many.
#[derive(Debug)]
pub struct WriteOnce<T> {
    value: OnceLock<T>,
    notify: Notify,
}

impl<T> WriteOnce<T> {
    /// Create an empty cell.
    pub fn new() -> Self {
        Self {
            value: OnceLock::new(),
            notify: Notify::new(),
        }
    }

    /// Store `value` if the cell is empty. Returns `false` if it was already set.
    pub fn set(&self, value: T) -> bool {
        let stored = self.value.set(value).is_ok();
        if stored {
            self.notify.notify_waiters();
        }
        stored
    }

    /// Current value, if written.
    pub fn get(&self) -> Option<&T> {
        self.value.get()
    }

    /// Wait for the value.
    pub async fn wait(&self) -> &T {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(value) = self.value.get() {
                return value;
            }
            notified.await;
        }
    }
}

impl<T> Default for WriteOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}
