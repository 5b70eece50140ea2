//! Fire-and-forget task spawning
//!
//! Public entry points hand their remote writes to [`BackgroundTasks`] and
//! return immediately. The runtime handle is captured at construction so
//! writes can also be launched from threads outside the runtime (signal
//! handlers, UI threads).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;

use crate::error::Error;
use crate::observer::{ErrorObserver, FailureSource};

pub(crate) struct BackgroundTasks {
    handle: Option<Handle>,
    tracker: TaskTracker,
    observer: Arc<dyn ErrorObserver>,
}

impl BackgroundTasks {
    pub(crate) fn new(observer: Arc<dyn ErrorObserver>) -> Self {
        Self {
            handle: Handle::try_current().ok(),
            tracker: TaskTracker::new(),
            observer,
        }
    }

    fn handle(&self) -> Option<Handle> {
        self.handle.clone().or_else(|| Handle::try_current().ok())
    }

    /// Whether writes can be launched from the calling thread
    pub(crate) fn has_runtime(&self) -> bool {
        let available = self.handle.is_some() || Handle::try_current().is_ok();
        if !available {
            self.observer.observe(
                FailureSource::Runtime,
                &Error::Transport("no async runtime available".to_string()),
            );
        }
        available
    }

    /// Launch a tracked write; returns false when no runtime is reachable
    ///
    /// A panic inside `task` is contained and reported instead of unwinding
    /// into the caller.
    pub(crate) fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(handle) = self.handle() else {
            self.observer.observe(
                FailureSource::Runtime,
                &Error::Transport("no async runtime available".to_string()),
            );
            return false;
        };

        let observer = self.observer.clone();
        let inner = handle.spawn(task);
        self.tracker.spawn_on(
            async move {
                if let Err(e) = inner.await {
                    if e.is_panic() {
                        observer.observe(
                            FailureSource::Runtime,
                            &Error::Transport("background write panicked".to_string()),
                        );
                    }
                }
            },
            &handle,
        );
        true
    }

    /// Launch an untracked task (timers that may be cancelled)
    pub(crate) fn spawn_untracked<F>(&self, task: F) -> Option<tokio::task::JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.handle() {
            Some(handle) => Some(handle.spawn(task)),
            None => {
                self.observer.observe(
                    FailureSource::Runtime,
                    &Error::Transport("no async runtime available".to_string()),
                );
                None
            }
        }
    }

    /// Wait for tracked writes to finish, up to `limit`
    ///
    /// Returns true when nothing was left in flight.
    pub(crate) async fn settle(&self, limit: Duration) -> bool {
        self.tracker.close();
        let drained = tokio::time::timeout(limit, self.tracker.wait()).await.is_ok();
        self.tracker.reopen();
        drained
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}
