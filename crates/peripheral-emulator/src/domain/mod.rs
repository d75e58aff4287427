//! Domain layer for the emulator.
//!
//! Only configuration and the command errors live here.  The message types
//! the emulator speaks come from `peripheral_core`, the same crate the client
//! uses, so both sides agree on the wire shapes by construction.

pub mod config;
pub mod error;

pub use config::{EmulatorConfig, StepDelays};
pub use error::CommandError;
