//! The message bus seam between the facades and the transport.
//!
//! Facades never see frames or sockets.  They publish JSON commands and
//! subscribe to JSON events through [`MessageBus`].  The real implementation
//! is [`Transport`](crate::infrastructure::transport::Transport);
//! [`LoopbackBus`] is an in-memory stand-in that records every command and
//! lets tests (or a demo) inject events by hand.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use super::listeners::{ListenerSet, Subscription};

/// Callback invoked with each parsed message body on a topic.
pub type MessageHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Publish/subscribe over JSON bodies.
#[cfg_attr(test, mockall::automock)]
pub trait MessageBus: Send + Sync {
    /// Queues `body` for `destination`.  Never fails synchronously.
    fn send(&self, destination: &str, body: Value);

    /// Registers `handler` for every message arriving on `topic`.
    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Subscription;
}

// ── LoopbackBus ───────────────────────────────────────────────────────────────

/// In-memory [`MessageBus`].
///
/// `send` appends to a log; [`deliver`](Self::deliver) plays the bridge's part
/// by handing a body to every handler on a topic.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use peripheral_client::infrastructure::bus::{LoopbackBus, MessageBus};
/// use serde_json::json;
///
/// let bus = LoopbackBus::new();
/// let sub = bus.subscribe("/topic/scanner/events", Arc::new(|body: &serde_json::Value| {
///     assert_eq!(body["barcode"], "123");
/// }));
/// bus.deliver("/topic/scanner/events", &json!({ "event": "scan", "barcode": "123" }));
/// sub.unsubscribe();
/// ```
#[derive(Default)]
pub struct LoopbackBus {
    topics: Mutex<HashMap<String, Arc<ListenerSet<dyn Fn(&Value) + Send + Sync>>>>,
    sent: Mutex<Vec<(String, Value)>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `body` to every handler subscribed to `topic`.
    pub fn deliver(&self, topic: &str, body: &Value) {
        let set = self.topics.lock().get(topic).cloned();
        if let Some(set) = set {
            set.emit(body);
        }
    }

    /// Every `(destination, body)` sent so far, oldest first.
    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().clone()
    }

    /// Bodies sent to `destination`, oldest first.
    pub fn sent_to(&self, destination: &str) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter(|(d, _)| d == destination)
            .map(|(_, b)| b.clone())
            .collect()
    }

    /// Number of handlers currently registered on `topic`.
    pub fn handler_count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, |s| s.len())
    }
}

impl MessageBus for LoopbackBus {
    fn send(&self, destination: &str, body: Value) {
        self.sent.lock().push((destination.to_string(), body));
    }

    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Subscription {
        let set = Arc::clone(
            self.topics
                .lock()
                .entry(topic.to_string())
                .or_insert_with(|| Arc::new(ListenerSet::new())),
        );
        set.add(handler)
    }
}
