//! WebSocket server: accept loop and per-session STOMP handling.
//!
//! This module is responsible for:
//!
//! 1. Accepting TCP connections on the bound listener.
//! 2. Upgrading each one to a WebSocket session.
//! 3. Speaking the server side of STOMP 1.2 on it: CONNECTED, SUBSCRIBE,
//!    UNSUBSCRIBE, SEND, DISCONNECT with RECEIPT, and ERROR for anything it
//!    cannot handle.
//! 4. Stopping when the `running` flag is cleared.
//!
//! # Session layout
//!
//! Each session runs as one Tokio task with two halves:
//!
//! - a **writer** task that owns the WebSocket sink and drains the session's
//!   channel in the [`Hub`], so the device can publish from any thread;
//! - a **reader** loop that decodes frames and acts on them.
//!
//! The session ends when either half finishes.  A [`SessionCommand::Close`]
//! makes the writer send a WebSocket Close and stop, which is how the server
//! drops a client.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message as WsMessage},
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

use peripheral_core::protocol::STOMP_VERSION;
use peripheral_core::{decode_frames, encode_frame, Command, Frame, Inbound};

use crate::application::device::Device;
use crate::application::hub::{Hub, SessionCommand, SessionId};

/// `server` header on CONNECTED.
const SERVER_NAME: &str = concat!("peripheral-emulator/", env!("CARGO_PKG_VERSION"));

// ── Public API ────────────────────────────────────────────────────────────────

/// Binds the WebSocket listener.
///
/// # Errors
///
/// Returns an error if the address is in use or cannot be bound.
pub async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind WebSocket listener on {addr}"))
}

/// Runs the accept loop until `running` is set to `false`.
///
/// Each accepted connection gets its own task so one slow client never
/// blocks the others.
pub async fn run_server(
    listener: TcpListener,
    hub: Arc<Hub>,
    device: Arc<Device>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("peripheral emulator listening on ws://{addr}/stomp");
    }

    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        // Short timeout so the flag is checked even when nobody connects.
        match timeout(Duration::from_millis(200), listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                info!("new connection from {peer_addr}");
                let hub = Arc::clone(&hub);
                let device = Arc::clone(&device);
                tokio::spawn(async move {
                    handle_session(stream, peer_addr, hub, device).await;
                });
            }
            Ok(Err(e)) => {
                error!("accept error: {e}");
            }
            Err(_) => {}
        }
    }

    hub.close_all();
    Ok(())
}

// ── Per-session handler ───────────────────────────────────────────────────────

async fn handle_session(stream: TcpStream, peer_addr: SocketAddr, hub: Arc<Hub>, device: Arc<Device>) {
    match run_session(stream, peer_addr, hub, device).await {
        Ok(()) => info!("session {peer_addr} closed normally"),
        Err(e) => warn!("session {peer_addr} closed with error: {e:#}"),
    }
}

async fn run_session(
    stream: TcpStream,
    peer_addr: SocketAddr,
    hub: Arc<Hub>,
    device: Arc<Device>,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .with_context(|| format!("WebSocket handshake failed with {peer_addr}"))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = hub.register(tx);
    debug!(session, "session {peer_addr} registered");

    let mut writer = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                SessionCommand::Frame(frame) => {
                    if ws_tx.send(WsMessage::Text(encode_frame(&frame))).await.is_err() {
                        break;
                    }
                }
                SessionCommand::Close => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });

    let mut reader = SessionReader {
        session,
        peer_addr,
        hub: &hub,
        device: &device,
        connected: false,
    };

    let (outcome, writer_done) = tokio::select! {
        result = reader.read_frames(&mut ws_rx) => (result, false),
        _ = &mut writer => (Ok(()), true),
    };

    // Removing the session drops the channel sender, so the writer drains
    // whatever is still queued (a RECEIPT, an ERROR) and then exits.
    hub.remove(session);
    if !writer_done {
        let _ = writer.await;
    }
    outcome
}

// ── Frame handling ────────────────────────────────────────────────────────────

struct SessionReader<'a> {
    session: SessionId,
    peer_addr: SocketAddr,
    hub: &'a Hub,
    device: &'a Arc<Device>,
    connected: bool,
}

impl SessionReader<'_> {
    async fn read_frames(
        &mut self,
        ws_rx: &mut SplitStream<WebSocketStream<TcpStream>>,
    ) -> anyhow::Result<()> {
        let peer = self.peer_addr;
        loop {
            let text = match ws_rx.next().await {
                Some(Ok(WsMessage::Text(text))) => text,
                Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        self.fail("binary frame is not UTF-8");
                        continue;
                    }
                },
                Some(Ok(WsMessage::Close(_))) => {
                    debug!("session {peer}: WebSocket Close frame received");
                    return Ok(());
                }
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::Protocol(_))) | None => {
                    debug!("session {peer}: stream ended");
                    return Ok(());
                }
                Some(Err(e)) => {
                    return Err(e).with_context(|| format!("session {peer}: read failed"));
                }
            };

            let units = match decode_frames(&text) {
                Ok(units) => units,
                Err(e) => {
                    self.fail(&format!("malformed frame: {e}"));
                    continue;
                }
            };
            for unit in units {
                if let Inbound::Frame(frame) = unit {
                    self.handle(frame);
                }
            }
        }
    }

    fn handle(&mut self, frame: Frame) {
        if !self.connected && !matches!(frame.command, Command::Connect | Command::Stomp) {
            self.fail("CONNECT expected");
            return;
        }

        match frame.command {
            Command::Connect | Command::Stomp => {
                self.connected = true;
                self.hub.reply(
                    self.session,
                    Frame::new(Command::Connected)
                        .header("version", STOMP_VERSION)
                        .header("heart-beat", "0,0")
                        .header("server", SERVER_NAME)
                        .header("session", self.session.to_string()),
                );
            }
            Command::Subscribe => {
                let (Some(id), Some(destination)) = (frame.get("id"), frame.destination()) else {
                    self.fail("SUBSCRIBE needs id and destination");
                    return;
                };
                self.hub.subscribe(self.session, id, destination);
                self.receipt(&frame);
                self.device.on_subscribe(self.session, id, destination);
            }
            Command::Unsubscribe => {
                let Some(id) = frame.get("id") else {
                    self.fail("UNSUBSCRIBE needs id");
                    return;
                };
                if !self.hub.unsubscribe(self.session, id) {
                    debug!(id, "unsubscribe for unknown subscription");
                }
                self.receipt(&frame);
            }
            Command::Send => {
                let Some(destination) = frame.destination() else {
                    self.fail("SEND needs destination");
                    return;
                };
                if let Err(e) = self.device.handle_send(self.session, destination, &frame.body) {
                    warn!(destination, "command rejected: {e}");
                }
                self.receipt(&frame);
            }
            Command::Disconnect => {
                self.receipt(&frame);
                self.hub.close(self.session);
            }
            other => self.fail(&format!("unexpected {} frame", other.as_str())),
        }
    }

    fn receipt(&self, frame: &Frame) {
        if let Some(receipt) = frame.get("receipt") {
            self.hub.reply(
                self.session,
                Frame::new(Command::Receipt).header("receipt-id", receipt),
            );
        }
    }

    /// Sends an ERROR frame and closes the session.
    fn fail(&self, message: &str) {
        warn!("session {}: {message}", self.peer_addr);
        self.hub.reply(self.session, error_frame(message));
        self.hub.close(self.session);
    }
}

fn error_frame(message: &str) -> Frame {
    Frame::new(Command::Error)
        .header("message", message)
        .header("content-type", "text/plain")
        .with_body(message)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_frame_carries_message_header_and_body() {
        let frame = error_frame("CONNECT expected");

        assert_eq!(frame.command, Command::Error);
        assert_eq!(frame.get("message"), Some("CONNECT expected"));
        assert_eq!(frame.body, "CONNECT expected");
    }

    #[test]
    fn test_server_name_includes_version() {
        assert!(SERVER_NAME.starts_with("peripheral-emulator/"));
    }
}
