//! Named event dispatch shared by both channels
//!
//! Each channel owns an [`EventSink`]. Consumers either register handlers for
//! a specific event name with [`EventSink::on`] or take a stream of every event
//! with [`EventSink::listen`].

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Capacity of the broadcast stream before slow listeners start lagging
const EVENT_BUFFER: usize = 256;

/// A delivered notification
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Event name (`bits.44322889`, `stream_up_down`, ...)
    pub name: String,
    /// Target id for PubSub events, subscription id for hub events
    pub source_id: String,
    /// Notification payload
    pub payload: Value,
}

impl Event {
    /// Create a new event
    pub fn new(name: impl Into<String>, source_id: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            source_id: source_id.into(),
            payload,
        }
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handler registry plus broadcast stream
pub struct EventSink {
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
    tx: broadcast::Sender<Event>,
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("listeners", &self.tx.receiver_count())
            .finish_non_exhaustive()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink {
    /// Create an empty sink
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            handlers: RwLock::new(HashMap::new()),
            tx,
        }
    }

    /// Register a handler for events named `name`
    pub async fn on<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().await;
        handlers
            .entry(name.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Remove every handler registered for `name`
    pub async fn off(&self, name: &str) -> bool {
        self.handlers.write().await.remove(name).is_some()
    }

    /// Receive every event emitted from now on
    pub fn listen(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Deliver an event to its handlers and to all listeners.
    ///
    /// Returns the number of handlers invoked.
    pub async fn emit(&self, event: Event) -> usize {
        let handlers = {
            let registry = self.handlers.read().await;
            registry.get(&event.name).cloned().unwrap_or_default()
        };
        for handler in &handlers {
            handler(&event);
        }

        // No listeners is fine.
        let _ = self.tx.send(event);
        handlers.len()
    }
}
