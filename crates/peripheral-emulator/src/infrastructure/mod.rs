//! Infrastructure layer: the WebSocket server and the in-process handle.

pub mod handle;
pub mod ws_server;

pub use handle::EmulatorHandle;
pub use ws_server::run_server;
