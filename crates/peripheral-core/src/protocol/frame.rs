//! Text codec for encoding and decoding STOMP 1.2 frames.
//!
//! Wire format:
//! ```text
//! COMMAND\n
//! header1:value1\n
//! header2:value2\n
//! \n
//! body^@
//! ```
//! `^@` is the NUL byte.  A line may also end in `\r\n`.  Bare end-of-line
//! characters between frames are heart-beats.
//!
//! # Header escaping (for beginners)
//!
//! Header lines use `:` as the separator and `\n` as the terminator, so those
//! characters cannot appear raw inside a header name or value.  STOMP 1.2
//! escapes them with a backslash:
//!
//! | raw  | escaped |
//! |------|---------|
//! | `\r` | `\r`    |
//! | `\n` | `\n`    |
//! | `:`  | `\c`    |
//! | `\`  | `\\`    |
//!
//! CONNECT and CONNECTED frames are exempt so that 1.0 peers can still read
//! the handshake.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors that can occur while decoding a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The first line of the frame was empty.
    #[error("frame has an empty command line")]
    EmptyCommand,

    /// The command line is not a STOMP command this codec understands.
    #[error("unknown STOMP command: {0}")]
    UnknownCommand(String),

    /// A header line has no `:` separator.
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    /// A header contains a backslash sequence that STOMP 1.2 does not define.
    #[error("invalid header escape sequence: {0:?}")]
    InvalidEscape(String),

    /// The `content-length` header is not a valid byte count for the body.
    #[error("invalid content-length: {0:?}")]
    InvalidContentLength(String),

    /// The `heart-beat` header is not of the form `cx,cy`.
    #[error("invalid heart-beat header: {0:?}")]
    InvalidHeartBeat(String),

    /// The input ended before the header block or the NUL terminator.
    #[error("frame is not terminated")]
    MissingTerminator,
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// STOMP frame commands used by the peripheral bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Client → bridge handshake.
    Connect,
    /// Client → bridge handshake (STOMP 1.2 spelling).
    Stomp,
    /// Bridge → client handshake reply.
    Connected,
    /// Client registers interest in a destination.
    Subscribe,
    /// Client withdraws a subscription.
    Unsubscribe,
    /// Client publishes a command to a destination.
    Send,
    /// Bridge delivers a message for a subscription.
    Message,
    /// Bridge acknowledges a frame that carried a `receipt` header.
    Receipt,
    /// Bridge reports a protocol error; the connection closes afterwards.
    Error,
    /// Client announces a graceful disconnect.
    Disconnect,
}

impl Command {
    /// Returns the command as it appears on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
        }
    }

    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err(FrameError::EmptyCommand),
            "CONNECT" => Ok(Command::Connect),
            "STOMP" => Ok(Command::Stomp),
            "CONNECTED" => Ok(Command::Connected),
            "SUBSCRIBE" => Ok(Command::Subscribe),
            "UNSUBSCRIBE" => Ok(Command::Unsubscribe),
            "SEND" => Ok(Command::Send),
            "MESSAGE" => Ok(Command::Message),
            "RECEIPT" => Ok(Command::Receipt),
            "ERROR" => Ok(Command::Error),
            "DISCONNECT" => Ok(Command::Disconnect),
            other => Err(FrameError::UnknownCommand(other.to_string())),
        }
    }
}

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One STOMP frame: a command, ordered headers, and a text body.
///
/// Headers keep their wire order.  Lookups return the first occurrence, which
/// is the STOMP 1.2 rule for repeated header names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    /// Creates a frame with no headers and an empty body.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Appends a header and returns the frame (builder style).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use peripheral_core::{Command, Frame};
    ///
    /// let frame = Frame::new(Command::Subscribe)
    ///     .header("id", "sub-0")
    ///     .header("destination", "/topic/scanner/events");
    /// assert_eq!(frame.destination(), Some("/topic/scanner/events"));
    /// ```
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replaces the body and returns the frame (builder style).
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the value of the first header called `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Shorthand for the `destination` header.
    pub fn destination(&self) -> Option<&str> {
        self.get("destination")
    }
}

/// One unit decoded from a WebSocket text message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A complete frame.
    Frame(Frame),
    /// A bare end-of-line keep-alive.
    Heartbeat,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`Frame`] into its wire text, including the NUL terminator.
///
/// A `content-length` header is computed from the body; any caller-supplied
/// `content-length` is ignored so the two can never disagree.
///
/// # Examples
///
/// ```rust
/// use peripheral_core::{encode_frame, Command, Frame};
///
/// let text = encode_frame(&Frame::new(Command::Disconnect).header("receipt", "r-1"));
/// assert_eq!(text, "DISCONNECT\nreceipt:r-1\n\n\0");
/// ```
pub fn encode_frame(frame: &Frame) -> String {
    let escape = frame.command.escapes_headers();
    let mut out = String::with_capacity(32 + frame.body.len());

    out.push_str(frame.command.as_str());
    out.push('\n');

    for (name, value) in &frame.headers {
        if name == "content-length" {
            continue;
        }
        push_header_part(&mut out, name, escape);
        out.push(':');
        push_header_part(&mut out, value, escape);
        out.push('\n');
    }

    if !frame.body.is_empty() {
        out.push_str("content-length:");
        out.push_str(&frame.body.len().to_string());
        out.push('\n');
    }

    out.push('\n');
    out.push_str(&frame.body);
    out.push('\0');
    out
}

/// Decodes every frame and heart-beat contained in one WebSocket message.
///
/// # Errors
///
/// Returns [`FrameError`] for the first malformed frame.  Frames before it
/// are discarded as well; callers drop the whole message.
///
/// # Examples
///
/// ```rust
/// use peripheral_core::{decode_frames, Command, Inbound};
///
/// let units = decode_frames("\nCONNECTED\nversion:1.2\n\n\0").unwrap();
/// assert_eq!(units[0], Inbound::Heartbeat);
/// assert!(matches!(&units[1], Inbound::Frame(f) if f.command == Command::Connected));
/// ```
pub fn decode_frames(input: &str) -> Result<Vec<Inbound>, FrameError> {
    let mut units = Vec::new();
    let mut rest = input;

    loop {
        // Leading end-of-line characters are heart-beats.
        while let Some(stripped) = rest.strip_prefix("\r\n").or_else(|| rest.strip_prefix('\n')) {
            units.push(Inbound::Heartbeat);
            rest = stripped;
        }
        if rest.is_empty() {
            break;
        }

        let (frame, consumed) = decode_frame(rest)?;
        units.push(Inbound::Frame(frame));
        rest = &rest[consumed..];
    }

    Ok(units)
}

/// Decodes one frame from the start of `input`.
///
/// Returns the frame and the number of bytes consumed, including the NUL.
///
/// # Errors
///
/// Returns [`FrameError`] if the frame is malformed or incomplete.
pub fn decode_frame(input: &str) -> Result<(Frame, usize), FrameError> {
    let (command_line, mut pos) = read_line(input, 0).ok_or(FrameError::MissingTerminator)?;
    let command: Command = command_line.parse()?;
    let escape = command.escapes_headers();

    let mut headers: Vec<(String, String)> = Vec::new();
    loop {
        let (line, next) = read_line(input, pos).ok_or(FrameError::MissingTerminator)?;
        pos = next;
        if line.is_empty() {
            break;
        }

        let (raw_name, raw_value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        let (name, value) = if escape {
            (unescape(raw_name)?, unescape(raw_value)?)
        } else {
            (raw_name.to_string(), raw_value.to_string())
        };

        if !headers.iter().any(|(existing, _)| *existing == name) {
            headers.push((name, value));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| FrameError::InvalidContentLength(v.clone()))
        })
        .transpose()?;

    let body_start = pos;
    let (body, end) = match content_length {
        Some(len) => {
            let body_end = body_start
                .checked_add(len)
                .ok_or_else(|| FrameError::InvalidContentLength(len.to_string()))?;
            if input.len() <= body_end {
                return Err(FrameError::MissingTerminator);
            }
            if !input.is_char_boundary(body_end) {
                return Err(FrameError::InvalidContentLength(len.to_string()));
            }
            if input.as_bytes()[body_end] != 0 {
                return Err(FrameError::MissingTerminator);
            }
            (&input[body_start..body_end], body_end + 1)
        }
        None => {
            let nul = input[body_start..]
                .find('\0')
                .ok_or(FrameError::MissingTerminator)?;
            (&input[body_start..body_start + nul], body_start + nul + 1)
        }
    };

    Ok((
        Frame {
            command,
            headers,
            body: body.to_string(),
        },
        end,
    ))
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Returns the line starting at `pos` (without its EOL) and the offset of the
/// next line, or `None` if no `\n` follows.
fn read_line(input: &str, pos: usize) -> Option<(&str, usize)> {
    let rel = input[pos..].find('\n')?;
    let line = &input[pos..pos + rel];
    let line = line.strip_suffix('\r').unwrap_or(line);
    Some((line, pos + rel + 1))
}

fn push_header_part(out: &mut String, raw: &str, escape: bool) {
    if !escape {
        out.push_str(raw);
        return;
    }
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
}

fn unescape(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some(other) => return Err(FrameError::InvalidEscape(format!("\\{other}"))),
            None => return Err(FrameError::InvalidEscape("\\".to_string())),
        }
    }
    Ok(out)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
