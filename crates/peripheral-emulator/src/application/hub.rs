//! Session registry and topic fan-out.
//!
//! Every WebSocket session registers an outbound channel here.  Its
//! subscriptions are tracked per session as `subscription id → destination`,
//! the same way a STOMP broker does: a MESSAGE frame must carry the id the
//! client chose, so one body published on a destination becomes one frame
//! per matching subscription.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use peripheral_core::{Command, Frame, SequenceCounter};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub type SessionId = u64;

/// What a session's writer task is told to do.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Frame(Frame),
    /// Close the WebSocket.
    Close,
}

struct SessionEntry {
    tx: mpsc::UnboundedSender<SessionCommand>,
    subscriptions: HashMap<String, String>,
}

/// Registry of live sessions.
pub struct Hub {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    next_session: AtomicU64,
    message_ids: SequenceCounter,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            message_ids: SequenceCounter::new(),
        }
    }

    pub fn register(&self, tx: mpsc::UnboundedSender<SessionCommand>) -> SessionId {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().insert(
            id,
            SessionEntry {
                tx,
                subscriptions: HashMap::new(),
            },
        );
        id
    }

    pub fn remove(&self, session: SessionId) {
        self.sessions.lock().remove(&session);
    }

    pub fn subscribe(&self, session: SessionId, subscription: &str, destination: &str) {
        if let Some(entry) = self.sessions.lock().get_mut(&session) {
            entry
                .subscriptions
                .insert(subscription.to_string(), destination.to_string());
            debug!(session, subscription, destination, "subscribed");
        }
    }

    /// Returns `false` if the session had no such subscription.
    pub fn unsubscribe(&self, session: SessionId, subscription: &str) -> bool {
        self.sessions
            .lock()
            .get_mut(&session)
            .is_some_and(|entry| entry.subscriptions.remove(subscription).is_some())
    }

    /// Queues `frame` for one session.
    pub fn reply(&self, session: SessionId, frame: Frame) {
        if let Some(entry) = self.sessions.lock().get(&session) {
            let _ = entry.tx.send(SessionCommand::Frame(frame));
        }
    }

    /// Asks one session's writer to close the socket.
    pub fn close(&self, session: SessionId) {
        if let Some(entry) = self.sessions.lock().get(&session) {
            let _ = entry.tx.send(SessionCommand::Close);
        }
    }

    /// Delivers `body` on a single subscription of a single session.
    pub fn send_to(&self, session: SessionId, subscription: &str, destination: &str, body: &Value) {
        let frame = self.message_frame(subscription, destination, body);
        self.reply(session, frame);
    }

    /// Delivers `body` to one session's subscriptions on `destination`.
    /// Returns how many frames were queued.
    pub fn publish_to(&self, session: SessionId, destination: &str, body: &Value) -> usize {
        let sessions = self.sessions.lock();
        let Some(entry) = sessions.get(&session) else {
            return 0;
        };
        let mut delivered = 0;
        for (subscription, subscribed) in &entry.subscriptions {
            if subscribed == destination {
                let frame = self.message_frame(subscription, destination, body);
                if entry.tx.send(SessionCommand::Frame(frame)).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Delivers `body` to every subscription on `destination`.  Returns how
    /// many frames were queued.
    pub fn publish(&self, destination: &str, body: &Value) -> usize {
        let sessions = self.sessions.lock();
        let mut delivered = 0;
        for entry in sessions.values() {
            for (subscription, subscribed) in &entry.subscriptions {
                if subscribed == destination {
                    let frame = self.message_frame(subscription, destination, body);
                    if entry.tx.send(SessionCommand::Frame(frame)).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }
        trace!(destination, delivered, "published");
        delivered
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Number of subscriptions, across all sessions, on `destination`.
    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.sessions
            .lock()
            .values()
            .flat_map(|entry| entry.subscriptions.values())
            .filter(|d| *d == destination)
            .count()
    }

    /// Closes every session.  The server keeps accepting new ones.
    pub fn close_all(&self) {
        for entry in self.sessions.lock().values() {
            let _ = entry.tx.send(SessionCommand::Close);
        }
    }

    fn message_frame(&self, subscription: &str, destination: &str, body: &Value) -> Frame {
        Frame::new(Command::Message)
            .header("subscription", subscription)
            .header("message-id", self.message_ids.next_id("msg"))
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(body.to_string())
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionCommand>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(SessionCommand::Frame(frame)) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_publish_reaches_matching_subscriptions_only() {
        // Arrange
        let hub = Hub::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = hub.register(tx_a);
        let b = hub.register(tx_b);
        hub.subscribe(a, "sub-0", "/topic/scanner/events");
        hub.subscribe(b, "sub-7", "/topic/payment/events");

        // Act
        let delivered = hub.publish("/topic/scanner/events", &json!({ "barcode": "1" }));

        // Assert
        assert_eq!(delivered, 1);
        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].get("subscription"), Some("sub-0"));
        assert_eq!(frames[0].get("content-type"), Some("application/json"));
        assert!(frames[0].get("message-id").is_some());
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn test_publish_to_skips_other_sessions() {
        let hub = Hub::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = hub.register(tx_a);
        let b = hub.register(tx_b);
        hub.subscribe(a, "sub-1", "/topic/payment/events");
        hub.subscribe(b, "sub-2", "/topic/payment/events");

        let delivered = hub.publish_to(b, "/topic/payment/events", &json!({ "state": "error" }));

        assert_eq!(delivered, 1);
        assert!(drain(&mut rx_a).is_empty());
        let frames = drain(&mut rx_b);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].get("subscription"), Some("sub-2"));
        assert_eq!(hub.publish_to(99, "/topic/payment/events", &json!({})), 0);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = hub.register(tx);
        hub.subscribe(session, "sub-0", "/topic/x");

        assert!(hub.unsubscribe(session, "sub-0"));
        assert!(!hub.unsubscribe(session, "sub-0"));
        hub.publish("/topic/x", &json!({}));

        assert!(drain(&mut rx).is_empty());
        assert_eq!(hub.subscriber_count("/topic/x"), 0);
    }

    #[test]
    fn test_message_ids_are_unique() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = hub.register(tx);
        hub.subscribe(session, "sub-0", "/topic/x");

        hub.publish("/topic/x", &json!(1));
        hub.publish("/topic/x", &json!(2));

        let frames = drain(&mut rx);
        assert_ne!(frames[0].get("message-id"), frames[1].get("message-id"));
    }

    #[test]
    fn test_close_all_and_remove() {
        let hub = Hub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = hub.register(tx);

        hub.close_all();
        assert_eq!(rx.try_recv().ok(), Some(SessionCommand::Close));

        hub.remove(session);
        assert_eq!(hub.session_count(), 0);
    }
}
