//! The peripheral client: one transport plus the facades wired onto it.
//!
//! This is the only place that drives the transport lifecycle.  Facades get
//! a shared handle to the transport for sending and subscribing, but never
//! call `connect` or `disconnect` themselves.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use super::capability_registry::CapabilityRegistry;
use super::payment::PaymentFacade;
use super::scanner::ScannerFacade;
use crate::domain::config::ClientConfig;
use crate::infrastructure::bus::MessageBus;
use crate::infrastructure::listeners::Subscription;
use crate::infrastructure::transport::{
    ConnectionError, ConnectionState, Transport, TransportError,
};

/// Connection to one peripheral bridge.
///
/// # Examples
///
/// ```rust,no_run
/// use peripheral_client::application::client::PeripheralClient;
/// use peripheral_client::domain::config::ClientConfig;
///
/// # async fn run() -> anyhow::Result<()> {
/// let client = PeripheralClient::new(&ClientConfig::default());
/// client.connect().await?;
/// let _sub = client.scanner().on_scan(|scan| println!("{}", scan.barcode));
/// client.scanner().enable();
/// // ...
/// client.disconnect().await;
/// # Ok(())
/// # }
/// ```
pub struct PeripheralClient {
    transport: Arc<Transport>,
    registry: CapabilityRegistry,
    scanner: ScannerFacade,
    payment: PaymentFacade,
    state_forwarding: Mutex<Option<Subscription>>,
}

impl PeripheralClient {
    pub fn new(config: &ClientConfig) -> Self {
        let transport = Arc::new(Transport::new(config.transport_config()));
        let bus: Arc<dyn MessageBus> = transport.clone();
        let registry = CapabilityRegistry::new();
        Self {
            scanner: ScannerFacade::new(Arc::clone(&bus), registry.clone()),
            payment: PaymentFacade::with_cancel_grace(bus, config.cancel_grace()),
            registry,
            transport,
            state_forwarding: Mutex::new(None),
        }
    }

    /// Connects and subscribes every facade.
    ///
    /// Facades are attached before the handshake, so their topics are
    /// subscribed as part of it.
    ///
    /// # Errors
    ///
    /// Whatever [`Transport::connect`] returns.  The facades stay attached
    /// and will subscribe on the next successful connect.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.attach();
        self.transport.connect().await
    }

    /// Disconnects, resolves a pending collect with `Closed`, and drops every
    /// facade handler.  Idempotent.
    pub async fn disconnect(&self) {
        self.payment.detach();
        self.scanner.detach();
        self.registry.detach();
        let forwarding = self.state_forwarding.lock().take();
        if let Some(subscription) = forwarding {
            subscription.unsubscribe();
        }
        self.transport.disconnect().await;
        info!("peripheral client disconnected");
    }

    fn attach(&self) {
        self.registry.attach(self.transport.as_ref());
        self.scanner.attach();
        self.payment.attach();

        let mut forwarding = self.state_forwarding.lock();
        if forwarding.is_none() {
            let scanner = self.scanner.clone();
            *forwarding = Some(
                self.transport
                    .on_state_change(move |state| scanner.on_transport_state(*state)),
            );
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn on_state_change(
        &self,
        handler: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> Subscription {
        self.transport.on_state_change(handler)
    }

    pub fn on_error(&self, handler: impl Fn(&TransportError) + Send + Sync + 'static) -> Subscription {
        self.transport.on_error(handler)
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn scanner(&self) -> &ScannerFacade {
        &self.scanner
    }

    pub fn payment(&self) -> &PaymentFacade {
        &self.payment
    }
}

impl Drop for PeripheralClient {
    fn drop(&mut self) {
        // The forwarding closure holds the scanner, which holds the transport.
        if let Some(subscription) = self.state_forwarding.lock().take() {
            subscription.unsubscribe();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
