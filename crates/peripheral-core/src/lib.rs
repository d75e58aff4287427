//! # peripheral-core
//!
//! Shared library for the peripheral bridge containing the STOMP frame codec,
//! the bus destinations, and the typed messages exchanged with the bridge.
//!
//! This crate is used by both the client SDK and the bridge emulator.
//! It has zero dependencies on sockets, async runtimes, or UI frameworks.
//!
//! # Architecture overview (for beginners)
//!
//! A point-of-sale lane has peripherals attached to it: a barcode scanner and
//! a card payment terminal.  A small process called the *bridge* drives the
//! hardware and exposes it over a message bus (STOMP frames carried on a
//! WebSocket).  Client applications subscribe to event topics and publish
//! command frames; they never talk to the devices directly.
//!
//! This crate (`peripheral-core`) is the shared foundation.  It defines:
//!
//! - **`protocol`** – How bytes travel over the bus.  STOMP frames are text:
//!   a command line, `key:value` header lines, a blank line, a body, and a NUL
//!   terminator.  The codec turns them into typed [`Frame`] values and back.
//!
//! - **`domain`** – The JSON bodies carried inside those frames: capability
//!   announcements, scan events, payment commands and payment events, plus the
//!   payment state machine rules.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `peripheral_core::Frame` instead of `peripheral_core::protocol::frame::Frame`.
pub use domain::capabilities::{
    Capabilities, CapabilitiesMessage, CapabilitySnapshot, PaymentCapability, ScannerCapability,
};
pub use domain::payment::{
    PaymentAction, PaymentCommand, PaymentEvent, PaymentRequest, PaymentRequestWire, PaymentResult,
    PaymentState, RequestError, DEFAULT_PAYMENT_TIMEOUT,
};
pub use domain::scan::{ScanEvent, ScannerMessage, Symbology};
pub use domain::MessageError;
pub use protocol::frame::{decode_frames, encode_frame, Command, Frame, FrameError, Inbound};
pub use protocol::heartbeat::{HeartBeat, NegotiatedHeartBeat};
pub use protocol::sequence::SequenceCounter;
