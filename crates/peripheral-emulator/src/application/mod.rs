//! Application layer: the session hub and the simulated device.

pub mod device;
pub mod hub;
