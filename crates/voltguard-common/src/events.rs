//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the power-integrity runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Callback registered in an engine's single event slot.
pub type EventCallback<E> = Arc<dyn Fn(&E) + Send + Sync + 'static>;

const DEFAULT_CAPACITY: usize = 64;

/// Fan-out point for engine events.
///
/// Holds one replaceable callback (last registration wins) and a broadcast channel
/// for any number of subscribers. Events are dispatched by the caller of
/// [`EventHub::emit`], which must not hold engine locks while doing so.
pub struct EventHub<E> {
    callback: Mutex<Option<EventCallback<E>>>,
    sender: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> Default for EventHub<E> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl<E: Clone + Send + 'static> EventHub<E> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            callback: Mutex::new(None),
            sender,
        }
    }

    /// Install `callback`, discarding any previous registration.
    pub fn register<F>(&self, callback: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        *self.callback.lock() = Some(Arc::new(callback));
    }

    /// Remove the registered callback. Calling it with no registration is a no-op.
    pub fn unregister(&self) {
        self.callback.lock().take();
    }

    pub fn has_callback(&self) -> bool {
        self.callback.lock().is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: E) {
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(&event);
        }
        // No receivers is the common case.
        let _ = self.sender.send(event);
    }
}

impl<E> std::fmt::Debug for EventHub<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("callback", &self.callback.lock().is_some())
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}
