//! Listener registration and the gateway event channel.
//!
//! Two mechanisms live here:
//! - [`ListenerSet`] holds synchronous callbacks for inbound data and
//!   delivery status. Listeners run in registration order and a failing
//!   (or panicking) listener never stops the ones after it.
//! - [`EventDispatcher`] broadcasts lifecycle changes and isolated
//!   per-message failures to any number of async subscribers.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::transport::LinkState;

/// Error type listeners may return.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

type Listener<T> = Arc<dyn Fn(&T) -> Result<(), ListenerError> + Send + Sync>;

/// Handle returned by registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A listener that returned an error or panicked.
#[derive(Debug, Clone)]
pub struct ListenerFailure {
    /// Which listener failed.
    pub listener: ListenerId,
    /// Error or panic message.
    pub error: String,
}

/// Ordered set of listeners for one kind of value.
pub struct ListenerSet<T> {
    kind: &'static str,
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Listener<T>)>>,
}

impl<T> ListenerSet<T> {
    /// Creates an empty set; `kind` names it in logs.
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Adds a listener after all existing ones.
    pub fn register<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Returns the number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Returns true if no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Calls every listener with `value`, in registration order.
    ///
    /// Works on a snapshot, so listeners may register or unregister others
    /// without deadlocking. Failures are logged and returned.
    pub fn dispatch(&self, value: &T) -> Vec<ListenerFailure> {
        let snapshot: Vec<(ListenerId, Listener<T>)> = self.listeners.read().clone();
        let mut failures = Vec::new();

        for (id, listener) in snapshot {
            let error = match catch_unwind(AssertUnwindSafe(|| listener(value))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };
            tracing::warn!("{} listener {:?} failed: {}", self.kind, id, error);
            failures.push(ListenerFailure {
                listener: id,
                error,
            });
        }

        failures
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_owned()
    }
}

/// Events published on the gateway event channel.
#[derive(Debug, Clone)]
pub enum Event {
    /// The link changed state.
    StateChanged(LinkState),
    /// The module reported a modem status code.
    ModemStatus(u8),
    /// A listener failed while handling one message.
    ListenerFailed {
        kind: &'static str,
        failure: ListenerFailure,
    },
    /// An inbound message could not be logged and was not forwarded.
    LogFailed { sender: String, error: String },
    /// A status frame arrived for a request nobody waits for anymore.
    LateStatus { frame_id: u8 },
}

/// A subscription to events.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Receives the next event, skipping over any lag.
    ///
    /// Returns `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("event subscriber lagged by {}", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Dispatches events to subscribers.
#[derive(Clone)]
pub struct EventDispatcher {
    sender: broadcast::Sender<Event>,
}

impl EventDispatcher {
    /// Creates a new event dispatcher.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Dispatches an event to all subscribers.
    pub fn dispatch(&self, event: Event) {
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    /// Publishes listener failures returned by [`ListenerSet::dispatch`].
    pub fn report(&self, kind: &'static str, failures: Vec<ListenerFailure>) {
        for failure in failures {
            self.dispatch(Event::ListenerFailed { kind, failure });
        }
    }

    /// Subscribes to all future events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }
}
