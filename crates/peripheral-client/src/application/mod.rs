//! Application layer: the facades callers actually use.
//!
//! # What lives here?
//!
//! - **`capability_registry`** – caches the device's capability
//!   announcement and answers "is the scanner there?" style queries.
//!
//! - **`scanner`** – enable/disable commands and scan fan-out, gated on the
//!   scanner's requested and confirmed state.
//!
//! - **`payment`** – collect/cancel commands and the payment state machine.
//!   One payment at a time.
//!
//! - **`client`** – `PeripheralClient`, which owns the transport and wires
//!   the three facades onto it.
//!
//! Facades only see the [`MessageBus`](crate::infrastructure::bus::MessageBus)
//! trait, so each can be tested against `LoopbackBus` or a mock without a
//! socket.

pub mod capability_registry;
pub mod client;
pub mod payment;
pub mod scanner;
