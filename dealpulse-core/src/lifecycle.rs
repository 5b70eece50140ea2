//! Page lifecycle signals
//!
//! The host reports when the page becomes visible and when it is being hidden
//! or unloaded. Components register listeners here: the autosave manager
//! flushes on hide, the time-on-page measurement records its final duration.
//!
//! Listeners run synchronously on the notifying thread and must only launch
//! work, never wait for it.

use std::sync::{Arc, Mutex};

/// Lifecycle transition reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSignal {
    Visible,
    Hidden,
}

/// Handle returned by [`PageLifecycle::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(PageSignal) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<(ListenerId, Listener)>,
}

/// Dispatches page lifecycle signals to registered listeners
#[derive(Default)]
pub struct PageLifecycle {
    registry: Mutex<Registry>,
}

impl PageLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(PageSignal) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.next_id += 1;
        let id = ListenerId(registry.next_id);
        registry.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener; unknown ids are ignored
    pub fn unsubscribe(&self, id: ListenerId) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.listeners.retain(|(existing, _)| *existing != id);
    }

    pub fn listener_count(&self) -> usize {
        self.registry
            .lock()
            .map(|r| r.listeners.len())
            .unwrap_or(0)
    }

    pub fn notify(&self, signal: PageSignal) {
        // Snapshot so listeners may (un)subscribe while being called
        let listeners: Vec<Listener> = {
            let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.listeners.iter().map(|(_, l)| l.clone()).collect()
        };
        tracing::debug!(?signal, listeners = listeners.len(), "page lifecycle signal");
        for listener in listeners {
            listener(signal);
        }
    }

    pub fn notify_hidden(&self) {
        self.notify(PageSignal::Hidden);
    }

    pub fn notify_visible(&self) {
        self.notify(PageSignal::Visible);
    }
}
