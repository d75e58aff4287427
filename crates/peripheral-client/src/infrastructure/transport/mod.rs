//! STOMP-over-WebSocket transport with automatic reconnection.
//!
//! # Lifecycle (for beginners)
//!
//! ```text
//!   Disconnected ──connect()──▶ Connecting ──handshake ok──▶ Connected
//!        ▲                          │                           │
//!        │                    attempts exhausted          connection lost
//!        │                          │                           ▼
//!        └──────────────────────────┴───── gave up ◀──── Reconnecting
//! ```
//!
//! [`Transport::connect`] runs the first handshake itself, retrying with
//! exponential backoff.  Once connected, a background *supervisor* task owns
//! the socket.  If the socket dies without `disconnect()` having been called,
//! the supervisor reports a [`TransportError::ConnectionLost`], moves to
//! `Reconnecting`, and retries with the same policy.  After a successful
//! reconnect every topic that still has handlers is subscribed again, so
//! handlers registered through [`MessageBus::subscribe`] keep receiving
//! messages without doing anything.
//!
//! Sending while not connected never panics and never blocks: the message is
//! dropped, a warning is logged, and every `on_error` handler is told.

pub mod backoff;
mod session;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use peripheral_core::{Command, Frame, FrameError, HeartBeat, NegotiatedHeartBeat, SequenceCounter};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use self::backoff::ReconnectPolicy;
use self::session::{Outbound, SessionEnd, WsStream};
use super::bus::{MessageBus, MessageHandler};
use super::listeners::{ListenerSet, Subscription};

/// How long `disconnect` waits for the session task to finish closing.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

// ── Configuration ─────────────────────────────────────────────────────────────

/// Everything the transport needs to reach the bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// `ws://` or `wss://` URL of the bridge's STOMP endpoint.
    pub endpoint: String,
    /// Value of the CONNECT frame's `host` header.
    pub host: String,
    /// Upper bound for one connection attempt, handshake included.
    pub connect_timeout: Duration,
    /// Heart-beat intervals announced in CONNECT.
    pub heart_beat: HeartBeat,
    pub reconnect: ReconnectPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:9100/stomp".to_string(),
            host: "localhost".to_string(),
            connect_timeout: Duration::from_secs(10),
            heart_beat: HeartBeat::new(10_000, 10_000),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

// ── State and errors ──────────────────────────────────────────────────────────

/// Connection state as seen by `on_state_change` handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why `connect` failed.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[source] Box<WsError>),

    #[error("no CONNECTED frame within {0:?}")]
    Timeout(Duration),

    #[error("bridge rejected the connection: {0}")]
    Rejected(String),

    #[error("socket closed during the STOMP handshake")]
    ClosedDuringHandshake,

    #[error("malformed frame during handshake: {0}")]
    Frame(#[from] FrameError),

    #[error("connect aborted by disconnect()")]
    Aborted,

    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<ConnectionError>,
    },

    #[error("automatic reconnection gave up")]
    ReconnectFailed,
}

impl From<WsError> for ConnectionError {
    fn from(e: WsError) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

/// Problems reported to `on_error` handlers.  None of them is fatal to the
/// caller; the transport keeps running (or keeps reconnecting).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("not connected; dropped message for {destination}")]
    NotConnected { destination: String },

    #[error("could not serialise message for {destination}: {reason}")]
    Serialize { destination: String, reason: String },

    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

// ── Transport ─────────────────────────────────────────────────────────────────

type Handlers = ListenerSet<dyn Fn(&Value) + Send + Sync>;

struct Topic {
    id: String,
    handlers: Arc<Handlers>,
}

struct Inner {
    config: TransportConfig,
    client_id: Uuid,
    state: watch::Sender<ConnectionState>,
    state_listeners: ListenerSet<dyn Fn(&ConnectionState) + Send + Sync>,
    error_listeners: ListenerSet<dyn Fn(&TransportError) + Send + Sync>,
    /// Destination → subscription.  Lock order: `topics` before `link`.
    topics: Mutex<HashMap<String, Topic>>,
    ids: SequenceCounter,
    /// Sender half of the live session's command channel.
    link: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    /// Serialises `connect` and `disconnect`.
    lifecycle: tokio::sync::Mutex<()>,
}

/// The STOMP client.  One per bridge connection.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use peripheral_client::infrastructure::bus::MessageBus;
/// use peripheral_client::infrastructure::transport::{Transport, TransportConfig};
///
/// # async fn run() -> anyhow::Result<()> {
/// let transport = Transport::new(TransportConfig::default());
/// let sub = transport.subscribe(
///     "/topic/scanner/events",
///     Arc::new(|body: &serde_json::Value| println!("{body}")),
/// );
/// transport.connect().await?;
/// // ...
/// sub.unsubscribe();
/// transport.disconnect().await;
/// # Ok(())
/// # }
/// ```
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                client_id: Uuid::new_v4(),
                state,
                state_listeners: ListenerSet::new(),
                error_listeners: ListenerSet::new(),
                topics: Mutex::new(HashMap::new()),
                ids: SequenceCounter::new(),
                link: Mutex::new(None),
                shutdown,
                supervisor: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Random id identifying this client in logs.
    pub fn client_id(&self) -> Uuid {
        self.inner.client_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Registers `handler` for every state transition.
    pub fn on_state_change(
        &self,
        handler: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.state_listeners.add(Arc::new(handler))
    }

    /// Registers `handler` for non-fatal transport errors.
    pub fn on_error(&self, handler: impl Fn(&TransportError) + Send + Sync + 'static) -> Subscription {
        self.inner.error_listeners.add(Arc::new(handler))
    }

    /// Connects to the bridge, retrying per the reconnect policy.
    ///
    /// Returns immediately when already connected.  While the supervisor is
    /// reconnecting, waits for it to either succeed or give up.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::Exhausted`] when every attempt failed.
    /// - [`ConnectionError::Aborted`] when `disconnect` ran meanwhile.
    /// - [`ConnectionError::ReconnectFailed`] when an ongoing reconnect gave up.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let _guard = self.inner.lifecycle.lock().await;

        match self.state() {
            ConnectionState::Connected => {
                debug!(client = %self.inner.client_id, "connect() while connected; nothing to do");
                return Ok(());
            }
            ConnectionState::Reconnecting => {
                debug!(client = %self.inner.client_id, "connect() while reconnecting; waiting");
                let mut state = self.inner.state.subscribe();
                let settled = state
                    .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Disconnected))
                    .await
                    .map(|s| *s);
                return match settled {
                    Ok(ConnectionState::Connected) => Ok(()),
                    _ => Err(ConnectionError::ReconnectFailed),
                };
            }
            ConnectionState::Disconnected | ConnectionState::Connecting => {}
        }

        self.inner.shutdown.send_replace(false);
        let mut shutdown = self.inner.shutdown.subscribe();
        self.inner.set_state(ConnectionState::Connecting);
        info!(
            client = %self.inner.client_id,
            endpoint = %self.inner.config.endpoint,
            "connecting to bridge"
        );

        let (ws, heart_beat) = match self.inner.establish(&mut shutdown).await {
            Ok(established) => established,
            Err(e) => {
                self.inner.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let outbound = self.inner.install_link();
        self.inner.set_state(ConnectionState::Connected);

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(supervise(inner, ws, heart_beat, outbound, shutdown));
        if let Some(previous) = self.inner.supervisor.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Closes the connection and forgets every subscription.
    ///
    /// Sends DISCONNECT and waits briefly for the RECEIPT.  Cancels any
    /// pending reconnect.  Safe to call when not connected.
    pub async fn disconnect(&self) {
        // Set before taking the lock so an in-flight connect() can bail out.
        self.inner.shutdown.send_replace(true);
        let _guard = self.inner.lifecycle.lock().await;

        let link = self.inner.link.lock().clone();
        if let Some(link) = link {
            let (done_tx, done_rx) = oneshot::channel();
            let receipt = format!("disconnect-{}", self.inner.ids.next());
            let queued = link
                .send(Outbound::Disconnect {
                    receipt,
                    done: done_tx,
                })
                .is_ok();
            if queued && timeout(DISCONNECT_TIMEOUT, done_rx).await.is_err() {
                warn!(client = %self.inner.client_id, "session did not close in time");
            }
        }

        let handle = self.inner.supervisor.lock().take();
        if let Some(mut handle) = handle {
            if timeout(DISCONNECT_TIMEOUT, &mut handle).await.is_err() {
                warn!(client = %self.inner.client_id, "supervisor did not stop in time; aborting it");
                handle.abort();
            }
        }

        self.inner.clear_link();
        self.inner.topics.lock().clear();
        self.inner.set_state(ConnectionState::Disconnected);
        info!(client = %self.inner.client_id, "disconnected from bridge");
    }

    /// Number of destinations with at least one handler.
    pub fn topic_count(&self) -> usize {
        self.inner.topics.lock().len()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.inner.shutdown.send_replace(true);
        if let Some(handle) = self.inner.supervisor.lock().take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("client_id", &self.inner.client_id)
            .field("endpoint", &self.inner.config.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl MessageBus for Transport {
    fn send(&self, destination: &str, body: Value) {
        let text = match serde_json::to_string(&body) {
            Ok(text) => text,
            Err(e) => {
                self.inner.report(TransportError::Serialize {
                    destination: destination.to_string(),
                    reason: e.to_string(),
                });
                return;
            }
        };
        let frame = Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(text);

        let queued = {
            let link = self.inner.link.lock();
            link.as_ref()
                .is_some_and(|tx| tx.send(Outbound::Frame(frame)).is_ok())
        };
        if !queued {
            self.inner.report(TransportError::NotConnected {
                destination: destination.to_string(),
            });
        }
    }

    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Subscription {
        let handler_sub = {
            let mut topics = self.inner.topics.lock();
            let is_new = !topics.contains_key(topic);
            let entry = topics.entry(topic.to_string()).or_insert_with(|| Topic {
                id: self.inner.ids.next_id("sub"),
                handlers: Arc::new(ListenerSet::new()),
            });
            let handler_sub = entry.handlers.add(handler);
            if is_new {
                debug!(topic, id = %entry.id, "new topic subscription");
                self.inner.queue(subscribe_frame(&entry.id, topic));
            }
            handler_sub
        };

        let inner = Arc::downgrade(&self.inner);
        let topic = topic.to_string();
        Subscription::new(move || {
            handler_sub.unsubscribe();
            if let Some(inner) = inner.upgrade() {
                inner.release_topic_if_idle(&topic);
            }
        })
    }
}

fn subscribe_frame(id: &str, destination: &str) -> Frame {
    Frame::new(Command::Subscribe)
        .header("id", id)
        .header("destination", destination)
        .header("ack", "auto")
}

// ── Inner helpers ─────────────────────────────────────────────────────────────

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(client = %self.client_id, state = %next, "connection state changed");
            self.state_listeners.emit(&next);
        }
    }

    fn report(&self, err: TransportError) {
        warn!(client = %self.client_id, "{err}");
        self.error_listeners.emit(&err);
    }

    /// Queues `frame` on the live session, if there is one.
    fn queue(&self, frame: Frame) {
        if let Some(link) = self.link.lock().as_ref() {
            let _ = link.send(Outbound::Frame(frame));
        }
    }

    /// Opens a fresh command channel and queues SUBSCRIBE for every known
    /// topic on it before anything else can be sent.
    fn install_link(&self) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        let topics = self.topics.lock();
        for (destination, topic) in topics.iter() {
            let _ = tx.send(Outbound::Frame(subscribe_frame(&topic.id, destination)));
        }
        *self.link.lock() = Some(tx);
        if !topics.is_empty() {
            debug!(client = %self.client_id, count = topics.len(), "subscriptions restored");
        }
        rx
    }

    fn clear_link(&self) {
        self.link.lock().take();
    }

    fn release_topic_if_idle(&self, destination: &str) {
        let mut topics = self.topics.lock();
        let idle = topics
            .get(destination)
            .is_some_and(|topic| topic.handlers.is_empty());
        if !idle {
            return;
        }
        if let Some(topic) = topics.remove(destination) {
            debug!(topic = destination, id = %topic.id, "last handler gone; unsubscribing");
            self.queue(Frame::new(Command::Unsubscribe).header("id", topic.id));
        }
    }

    /// Routes an inbound MESSAGE to the handlers of its destination.
    fn dispatch(&self, frame: Frame) {
        let Some(destination) = frame.destination() else {
            warn!("MESSAGE frame without destination");
            return;
        };
        let handlers = match self.topics.lock().get(destination) {
            Some(topic) => Arc::clone(&topic.handlers),
            None => {
                debug!(destination, "no handlers for destination; dropping message");
                return;
            }
        };
        let body: Value = match serde_json::from_str(&frame.body) {
            Ok(body) => body,
            Err(e) => {
                warn!(destination, "dropping message with non-JSON body: {e}");
                return;
            }
        };
        handlers.emit(&body);
    }

    /// One handshake attempt, bounded by `connect_timeout` and interruptible
    /// by `disconnect`.
    async fn attempt(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(WsStream, NegotiatedHeartBeat), ConnectionError> {
        let limit = self.config.connect_timeout;
        tokio::select! {
            outcome = timeout(limit, session::handshake(&self.config)) => match outcome {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::Timeout(limit)),
            },
            _ = shutdown.wait_for(|stop| *stop) => Err(ConnectionError::Aborted),
        }
    }

    /// Sleeps for `delay` unless `disconnect` runs first.  Returns `false`
    /// when interrupted.
    async fn backoff(&self, delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = sleep(delay) => true,
            _ = shutdown.wait_for(|stop| *stop) => false,
        }
    }

    /// The initial connect: try, back off, try again.
    async fn establish(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(WsStream, NegotiatedHeartBeat), ConnectionError> {
        let policy = &self.config.reconnect;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.attempt(shutdown).await {
                Ok(established) => return Ok(established),
                Err(ConnectionError::Aborted) => return Err(ConnectionError::Aborted),
                Err(e) => e,
            };
            if !policy.should_retry(attempt) {
                error!(client = %self.client_id, attempt, "giving up: {err}");
                return Err(ConnectionError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            let delay = policy.delay_for_attempt(attempt);
            warn!(client = %self.client_id, attempt, ?delay, "connect attempt failed: {err}");
            if !self.backoff(delay, shutdown).await {
                return Err(ConnectionError::Aborted);
            }
        }
    }

    /// Reconnect after a lost session: back off first, then try.
    async fn reconnect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<(WsStream, NegotiatedHeartBeat)> {
        let policy = &self.config.reconnect;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let delay = policy.delay_for_attempt(attempt);
            info!(client = %self.client_id, attempt, ?delay, "reconnecting");
            if !self.backoff(delay, shutdown).await {
                return None;
            }
            match self.attempt(shutdown).await {
                Ok(established) => return Some(established),
                Err(ConnectionError::Aborted) => return None,
                Err(e) => {
                    if !policy.should_retry(attempt) {
                        error!(client = %self.client_id, attempt, "reconnect gave up: {e}");
                        return None;
                    }
                    warn!(client = %self.client_id, attempt, "reconnect attempt failed: {e}");
                }
            }
        }
    }
}

/// Owns the socket for the lifetime of the connection, across reconnects.
async fn supervise(
    inner: Arc<Inner>,
    mut ws: WsStream,
    mut heart_beat: NegotiatedHeartBeat,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let dispatcher = Arc::clone(&inner);
        let end = session::run_session(ws, &mut outbound, heart_beat, move |frame| {
            dispatcher.dispatch(frame);
        })
        .await;
        inner.clear_link();

        let reason = match end {
            SessionEnd::Closed => {
                inner.set_state(ConnectionState::Disconnected);
                return;
            }
            SessionEnd::Lost(_) if *shutdown.borrow() => {
                inner.set_state(ConnectionState::Disconnected);
                return;
            }
            SessionEnd::Lost(reason) => reason,
        };

        inner.report(TransportError::ConnectionLost(reason));
        inner.set_state(ConnectionState::Reconnecting);

        match inner.reconnect(&mut shutdown).await {
            Some((next_ws, next_heart_beat)) => {
                ws = next_ws;
                heart_beat = next_heart_beat;
                outbound = inner.install_link();
                inner.set_state(ConnectionState::Connected);
            }
            None => {
                inner.set_state(ConnectionState::Disconnected);
                return;
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
