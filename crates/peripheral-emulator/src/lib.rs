//! peripheral-emulator library crate.
//!
//! A stand-in for the peripheral bridge: a STOMP 1.2 server over WebSocket
//! with a simulated barcode scanner and card terminal.  It speaks the same
//! topics and commands as the real bridge, so the client can be exercised
//! end to end without hardware.
//!
//! # Architecture
//!
//! ```text
//! [peripheral-emulator]
//!   ├── domain/           EmulatorConfig, step delays, command errors
//!   ├── application/
//!   │     ├── hub/        sessions and their subscriptions, MESSAGE fan-out
//!   │     └── device/     scanner flag, payment flow task
//!   └── infrastructure/
//!         ├── ws_server/  accept loop, per-session STOMP handling
//!         └── handle/     EmulatorHandle for tests and the binary
//! ```
//!
//! # For beginners: using it in a test
//!
//! ```rust,no_run
//! use peripheral_emulator::{EmulatorConfig, EmulatorHandle};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let emulator = EmulatorHandle::spawn(EmulatorConfig::for_tests()).await?;
//! println!("connect to {}", emulator.endpoint());
//! emulator.shutdown().await
//! # }
//! ```

/// Domain layer: configuration and error types.
pub mod domain;

/// Application layer: session hub and simulated device.
pub mod application;

/// Infrastructure layer: WebSocket server.
pub mod infrastructure;

pub use domain::{CommandError, EmulatorConfig, StepDelays};
pub use infrastructure::EmulatorHandle;
