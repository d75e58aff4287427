//! In-process emulator handle.
//!
//! [`EmulatorHandle::spawn`] binds the listener, starts the accept loop on
//! the current Tokio runtime and hands back a handle that tests (and the
//! binary) use to drive the simulated hardware.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use peripheral_core::{PaymentState, Symbology};
use tokio::task::JoinHandle;
use tracing::info;

use crate::application::device::Device;
use crate::application::hub::Hub;
use crate::domain::EmulatorConfig;
use crate::infrastructure::ws_server;

/// A running emulator.
///
/// Dropping the handle stops the accept loop on its next check; call
/// [`shutdown`](Self::shutdown) to wait for it.
pub struct EmulatorHandle {
    local_addr: SocketAddr,
    hub: Arc<Hub>,
    device: Arc<Device>,
    running: Arc<AtomicBool>,
    server: Option<JoinHandle<anyhow::Result<()>>>,
}

impl EmulatorHandle {
    /// Binds `config.ws_bind_addr` and starts serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn spawn(config: EmulatorConfig) -> anyhow::Result<Self> {
        let listener = ws_server::bind(config.ws_bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let hub = Arc::new(Hub::new());
        let device = Arc::new(Device::new(config, Arc::clone(&hub)));
        let running = Arc::new(AtomicBool::new(true));

        let server = tokio::spawn(ws_server::run_server(
            listener,
            Arc::clone(&hub),
            Arc::clone(&device),
            Arc::clone(&running),
        ));

        Ok(Self {
            local_addr,
            hub,
            device,
            running,
            server: Some(server),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The URL a client connects to, e.g. `ws://127.0.0.1:9100/stomp`.
    pub fn endpoint(&self) -> String {
        format!("ws://{}/stomp", self.local_addr)
    }

    /// Simulates a barcode read.  Returns `false` if the scanner is disabled.
    pub fn trigger_scan(&self, barcode: &str, symbology: Symbology) -> bool {
        self.device.trigger_scan(barcode, symbology)
    }

    /// Re-sends the capabilities announcement to every subscriber.
    pub fn announce(&self) -> usize {
        self.device.announce()
    }

    pub fn scanner_enabled(&self) -> bool {
        self.device.scanner_enabled()
    }

    pub fn payment_state(&self) -> PaymentState {
        self.device.payment_state()
    }

    pub fn session_count(&self) -> usize {
        self.hub.session_count()
    }

    pub fn subscriber_count(&self, destination: &str) -> usize {
        self.hub.subscriber_count(destination)
    }

    /// Closes every open session without stopping the server, as if the
    /// bridge restarted.
    pub fn drop_sessions(&self) {
        info!(sessions = self.hub.session_count(), "dropping all sessions");
        self.hub.close_all();
    }

    /// Stops accepting, closes every session and waits for the accept loop.
    ///
    /// # Errors
    ///
    /// Returns the accept loop's error, if it failed.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::Relaxed);
        self.hub.close_all();
        match self.server.take() {
            Some(server) => server.await?,
            None => Ok(()),
        }
    }
}

impl Drop for EmulatorHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for EmulatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatorHandle")
            .field("local_addr", &self.local_addr)
            .field("sessions", &self.hub.session_count())
            .finish()
    }
}
