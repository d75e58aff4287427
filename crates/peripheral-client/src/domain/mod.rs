//! Domain layer for the client: configuration schema and validation.
//!
//! The message types the client exchanges with the bridge live in
//! `peripheral_core`; this module only holds what is specific to running a
//! client process.

pub mod config;
