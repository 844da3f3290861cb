//! Hierarchical cancellation scopes.
//!
//! A [`CancelScope`] can be cloned and shared across tasks. Cancelling a scope
//! cancels every child created from it, so cancelling the client's main scope
//! also ends whatever per-session scope is active at that moment, while
//! cancelling one session scope leaves the parent (and the next session) alone.

use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{ClientError, ClientResult};

#[derive(Debug)]
struct Inner {
    state: watch::Sender<bool>,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn new() -> Self {
        let (state, _) = watch::channel(false);
        Inner {
            state,
            children: Mutex::new(Vec::new()),
        }
    }

    fn cancel(&self) {
        self.state.send_replace(true);
        let children = {
            let mut guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

/// A cancellation scope for cooperative cancellation of async operations.
#[derive(Debug, Clone)]
pub struct CancelScope {
    inner: Arc<Inner>,
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelScope {
    pub fn new() -> Self {
        CancelScope {
            inner: Arc::new(Inner::new()),
        }
    }

    /// Creates a scope that is cancelled together with this one.
    ///
    /// Cancelling the child does not affect the parent.
    pub fn child(&self) -> CancelScope {
        let child = Arc::new(Inner::new());
        {
            let mut children = self.inner.children.lock().unwrap_or_else(|e| e.into_inner());
            if *self.inner.state.borrow() {
                child.state.send_replace(true);
            } else {
                children.retain(|c| c.strong_count() > 0);
                children.push(Arc::downgrade(&child));
            }
        }
        CancelScope { inner: child }
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.state.borrow()
    }

    /// Returns `Err(ClientError::Cancelled)` once cancelled.
    pub fn check(&self) -> ClientResult<()> {
        if self.is_cancelled() {
            Err(ClientError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Completes when the scope is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Sleeps for `duration` unless cancelled first.
    pub async fn sleep(&self, duration: Duration) -> ClientResult<()> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(ClientError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Runs `future` unless cancelled first.
    pub async fn run<T, F>(&self, future: F) -> ClientResult<T>
    where
        F: Future<Output = ClientResult<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(ClientError::Cancelled),
            result = future => result,
        }
    }
}
