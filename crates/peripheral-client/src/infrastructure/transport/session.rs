//! One STOMP session over one WebSocket: the handshake and the session loop.
//!
//! # Who owns the socket? (for beginners)
//!
//! Exactly one Tokio task owns the WebSocket at a time.  Everything else
//! talks to it through an unbounded `mpsc` channel of [`Outbound`] commands.
//! That keeps `send` synchronous for callers (pushing onto an unbounded
//! channel never waits) and means reads, writes and heart-beats are all
//! driven from a single `tokio::select!` loop with no lock around the socket.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use peripheral_core::protocol::STOMP_VERSION;
use peripheral_core::{
    decode_frames, encode_frame, Command, Frame, HeartBeat, Inbound, NegotiatedHeartBeat,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use super::{ConnectionError, TransportConfig};

/// How long a graceful close waits for the bridge's RECEIPT.
pub(crate) const RECEIPT_WAIT: Duration = Duration::from_secs(1);

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Commands for the task that owns the socket.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Encode and write a frame.
    Frame(Frame),
    /// Send DISCONNECT with `receipt`, wait briefly for the RECEIPT, close the
    /// socket, then signal `done`.
    Disconnect {
        receipt: String,
        done: oneshot::Sender<()>,
    },
}

/// Why a session loop returned.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// Closed on request.  Do not reconnect.
    Closed,
    /// Closed unexpectedly.  The reason is for logs.
    Lost(String),
}

enum WsInput {
    Text(String),
    Closed,
    Ignored,
}

fn classify(msg: WsMessage) -> WsInput {
    match msg {
        WsMessage::Text(text) => WsInput::Text(text),
        WsMessage::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => WsInput::Text(text),
            Err(_) => {
                warn!("dropping non-UTF-8 binary WebSocket message");
                WsInput::Ignored
            }
        },
        WsMessage::Close(_) => WsInput::Closed,
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => WsInput::Ignored,
    }
}

/// Describes an ERROR frame for logs and errors.
fn error_frame_reason(frame: &Frame) -> String {
    match frame.get("message") {
        Some(message) if !frame.body.is_empty() => format!("{message}: {}", frame.body.trim()),
        Some(message) => message.to_string(),
        None => frame.body.trim().to_string(),
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Opens the socket and exchanges CONNECT / CONNECTED.
///
/// Not bounded in time; the caller wraps it in `tokio::time::timeout`.
///
/// # Errors
///
/// Returns [`ConnectionError`] if the socket cannot be opened, the bridge
/// answers with ERROR, or the socket closes before CONNECTED arrives.
pub(crate) async fn handshake(
    config: &TransportConfig,
) -> Result<(WsStream, NegotiatedHeartBeat), ConnectionError> {
    let (mut ws, _response) = connect_async(config.endpoint.as_str()).await?;

    let connect = Frame::new(Command::Connect)
        .header("accept-version", STOMP_VERSION)
        .header("host", config.host.as_str())
        .header("heart-beat", config.heart_beat.to_header_value());
    ws.send(WsMessage::Text(encode_frame(&connect))).await?;

    loop {
        let msg = match ws.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ConnectionError::ClosedDuringHandshake),
        };
        let text = match classify(msg) {
            WsInput::Text(text) => text,
            WsInput::Closed => return Err(ConnectionError::ClosedDuringHandshake),
            WsInput::Ignored => continue,
        };

        for unit in decode_frames(&text)? {
            let Inbound::Frame(frame) = unit else {
                continue;
            };
            match frame.command {
                Command::Connected => {
                    let server = match frame.get("heart-beat") {
                        Some(value) => HeartBeat::parse(value).unwrap_or_else(|e| {
                            warn!("ignoring bad heart-beat header from bridge: {e}");
                            HeartBeat::default()
                        }),
                        None => HeartBeat::default(),
                    };
                    let negotiated = config.heart_beat.negotiate(server);
                    debug!(
                        version = frame.get("version").unwrap_or("?"),
                        ?negotiated,
                        "STOMP session established"
                    );
                    return Ok((ws, negotiated));
                }
                Command::Error => {
                    return Err(ConnectionError::Rejected(error_frame_reason(&frame)));
                }
                other => debug!("ignoring {other} frame before CONNECTED"),
            }
        }
    }
}

// ── Session loop ──────────────────────────────────────────────────────────────

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn close_socket(ws: &mut WsStream) {
    if let Err(e) = ws.close(None).await {
        debug!("error while closing WebSocket: {e}");
    }
}

/// Drives one established session until it closes.
///
/// Every inbound MESSAGE frame is passed to `on_message` on this task, in
/// receive order.  Heart-beats are sent every `heartbeat.send_every`; silence
/// longer than `heartbeat.read_timeout()` ends the session as lost.
pub(crate) async fn run_session<F>(
    mut ws: WsStream,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    heartbeat: NegotiatedHeartBeat,
    on_message: F,
) -> SessionEnd
where
    F: Fn(Frame),
{
    let mut ticker = heartbeat.send_every.map(|every| {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let read_timeout = heartbeat.read_timeout();
    let mut last_inbound = Instant::now();
    let mut closing: Option<(String, oneshot::Sender<()>, Instant)> = None;

    loop {
        let read_deadline = read_timeout.map(|t| last_inbound + t);
        let close_deadline = closing.as_ref().map(|(_, _, deadline)| *deadline);

        tokio::select! {
            inbound = ws.next() => {
                let msg = match inbound {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        return finish_closing(closing, SessionEnd::Lost(format!("read error: {e}")));
                    }
                    None => {
                        return finish_closing(closing, SessionEnd::Lost("socket closed".to_string()));
                    }
                };
                last_inbound = Instant::now();

                let text = match classify(msg) {
                    WsInput::Text(text) => text,
                    WsInput::Closed => {
                        return finish_closing(closing, SessionEnd::Lost("closed by bridge".to_string()));
                    }
                    WsInput::Ignored => continue,
                };

                let units = match decode_frames(&text) {
                    Ok(units) => units,
                    Err(e) => {
                        warn!("dropping malformed STOMP message: {e}");
                        continue;
                    }
                };

                for unit in units {
                    let frame = match unit {
                        Inbound::Heartbeat => {
                            trace!("heart-beat received");
                            continue;
                        }
                        Inbound::Frame(frame) => frame,
                    };
                    match frame.command {
                        Command::Message => on_message(frame),
                        Command::Receipt => {
                            let matches = closing
                                .as_ref()
                                .is_some_and(|(id, _, _)| frame.get("receipt-id") == Some(id.as_str()));
                            if matches {
                                debug!("DISCONNECT acknowledged");
                                close_socket(&mut ws).await;
                                return finish_closing(closing, SessionEnd::Closed);
                            }
                            debug!("ignoring unexpected RECEIPT");
                        }
                        Command::Error => {
                            let reason = error_frame_reason(&frame);
                            warn!("bridge sent ERROR: {reason}");
                            close_socket(&mut ws).await;
                            return finish_closing(closing, SessionEnd::Lost(format!("ERROR frame: {reason}")));
                        }
                        other => debug!("ignoring {other} frame"),
                    }
                }
            }

            command = outbound.recv() => {
                match command {
                    Some(Outbound::Frame(frame)) => {
                        debug!(command = %frame.command, destination = frame.destination().unwrap_or("-"), "sending frame");
                        if let Err(e) = ws.send(WsMessage::Text(encode_frame(&frame))).await {
                            return finish_closing(closing, SessionEnd::Lost(format!("write error: {e}")));
                        }
                    }
                    Some(Outbound::Disconnect { receipt, done }) => {
                        let frame = Frame::new(Command::Disconnect).header("receipt", receipt.as_str());
                        if let Err(e) = ws.send(WsMessage::Text(encode_frame(&frame))).await {
                            debug!("could not send DISCONNECT: {e}");
                            let _ = done.send(());
                            return SessionEnd::Closed;
                        }
                        closing = Some((receipt, done, Instant::now() + RECEIPT_WAIT));
                    }
                    None => {
                        close_socket(&mut ws).await;
                        return finish_closing(closing, SessionEnd::Closed);
                    }
                }
            }

            _ = next_tick(&mut ticker) => {
                trace!("sending heart-beat");
                if let Err(e) = ws.send(WsMessage::Text("\n".to_string())).await {
                    return finish_closing(closing, SessionEnd::Lost(format!("heart-beat write error: {e}")));
                }
            }

            _ = sleep_until_opt(read_deadline) => {
                warn!("no traffic from bridge within {:?}", read_timeout.unwrap_or_default());
                close_socket(&mut ws).await;
                return finish_closing(closing, SessionEnd::Lost("heart-beat timeout".to_string()));
            }

            _ = sleep_until_opt(close_deadline) => {
                debug!("no RECEIPT for DISCONNECT; closing anyway");
                close_socket(&mut ws).await;
                return finish_closing(closing, SessionEnd::Closed);
            }
        }
    }
}

/// A session that was already closing on request always ends as `Closed`.
fn finish_closing(
    closing: Option<(String, oneshot::Sender<()>, Instant)>,
    otherwise: SessionEnd,
) -> SessionEnd {
    match closing {
        Some((_, done, _)) => {
            let _ = done.send(());
            SessionEnd::Closed
        }
        None => otherwise,
    }
}
