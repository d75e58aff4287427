//! Infrastructure layer for the peripheral client.
//!
//! # Sub-modules
//!
//! - **`bus`** – the [`MessageBus`](bus::MessageBus) trait the facades talk
//!   through, plus `LoopbackBus`, an in-memory implementation for tests and
//!   demos.
//!
//! - **`listeners`** – per-instance listener sets and the `Subscription`
//!   handle returned by every `on_*` call.
//!
//! - **`storage`** – loads and saves `client.toml` in the platform config
//!   directory.
//!
//! - **`transport`** – the STOMP-over-WebSocket client: handshake,
//!   heart-beats, topic subscriptions, and automatic reconnection.

pub mod bus;
pub mod listeners;
pub mod storage;
pub mod transport;
