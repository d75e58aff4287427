//! peripheral-client library crate.
//!
//! Client SDK for a local peripheral bridge: a process on the point-of-sale
//! machine that owns a barcode scanner and a card terminal and exposes them
//! over STOMP on a WebSocket.
//!
//! # Architecture
//!
//! ```text
//! PeripheralClient (application/client.rs)
//!   ├── CapabilityRegistry   /topic/capabilities
//!   ├── ScannerFacade        /topic/scanner/events, /app/scanner/*
//!   └── PaymentFacade        /topic/payment/events, /app/payment/*
//!             │  MessageBus (send / subscribe, JSON bodies)
//!             ▼
//!        Transport            STOMP 1.2 over WebSocket, heart-beats,
//!                             reconnect with backoff, re-subscribe
//! ```
//!
//! # For beginners: where do I start?
//!
//! Build a [`PeripheralClient`] from a [`ClientConfig`], call `connect()`,
//! then use `scanner()`, `payment()` and `capabilities()`.  Every `on_*`
//! method returns a [`Subscription`]; call `unsubscribe()` on it when you no
//! longer want the callbacks.

/// Application layer: the capability registry and the device facades.
pub mod application;

/// Domain layer: client configuration.
pub mod domain;

/// Infrastructure layer: transport, message bus, listeners, config storage.
pub mod infrastructure;

pub use application::capability_registry::CapabilityRegistry;
pub use application::client::PeripheralClient;
pub use application::payment::{PaymentError, PaymentFacade};
pub use application::scanner::ScannerFacade;
pub use domain::config::{ClientConfig, ConfigError};
pub use infrastructure::bus::{LoopbackBus, MessageBus};
pub use infrastructure::listeners::Subscription;
pub use infrastructure::transport::{
    ConnectionError, ConnectionState, Transport, TransportConfig, TransportError,
};
