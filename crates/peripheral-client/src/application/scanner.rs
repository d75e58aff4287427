//! Scanner facade: enable/disable commands and scan fan-out.
//!
//! # Requested vs confirmed (for beginners)
//!
//! `enable()` only *asks* the bridge to turn the scanner on.  The bridge may
//! answer with a status event (`{"event":"enabled"}` or
//! `{"type":"status","enabled":true}`), or it may say nothing at all.  The
//! facade therefore keeps two fields:
//!
//! - `requested`: what this client last asked for.
//! - `confirmed`: what the bridge last reported, if it reported anything
//!   since the last request.
//!
//! The flag that gates scan delivery is `confirmed` when present and
//! `requested` otherwise.  A new request, or the transport dropping out of
//! `connected`, clears the confirmation.

use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use peripheral_core::protocol::destinations;
use peripheral_core::{ScanEvent, ScannerMessage};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::capability_registry::CapabilityRegistry;
use crate::infrastructure::bus::MessageBus;
use crate::infrastructure::listeners::{ListenerSet, Subscription};
use crate::infrastructure::transport::ConnectionState;

#[derive(Debug, Clone, Default)]
struct ScannerState {
    requested: bool,
    confirmed: Option<bool>,
    last_scan: Option<ScanEvent>,
}

impl ScannerState {
    fn effective(&self) -> bool {
        self.confirmed.unwrap_or(self.requested)
    }
}

struct ScannerInner {
    bus: Arc<dyn MessageBus>,
    registry: CapabilityRegistry,
    state: Mutex<ScannerState>,
    listeners: ListenerSet<dyn Fn(&ScanEvent) + Send + Sync>,
    attachment: Mutex<Option<Subscription>>,
}

impl ScannerInner {
    fn handle(&self, body: &Value) {
        let message = match ScannerMessage::from_json(body, Utc::now()) {
            Ok(message) => message,
            Err(e) => {
                warn!("dropping malformed scanner event: {e}");
                return;
            }
        };

        match message {
            ScannerMessage::Status { enabled } => {
                self.state.lock().confirmed = Some(enabled);
                info!(enabled, "scanner status confirmed by bridge");
            }
            ScannerMessage::Scan(scan) => self.deliver(scan),
        }
    }

    fn deliver(&self, scan: ScanEvent) {
        let capabilities = self.registry.capabilities();
        if capabilities.announced && !capabilities.scanner_available() {
            debug!(barcode = %scan.barcode, "scanner announced unavailable; dropping scan");
            return;
        }
        {
            let mut state = self.state.lock();
            if !state.effective() {
                debug!(barcode = %scan.barcode, "scanner disabled; dropping scan");
                return;
            }
            state.last_scan = Some(scan.clone());
        }
        debug!(barcode = %scan.barcode, symbology = %scan.symbology.as_str(), "scan");
        self.listeners.emit(&scan);
    }

    fn request(&self, enabled: bool) {
        {
            let mut state = self.state.lock();
            state.requested = enabled;
            state.confirmed = None;
        }
        let (destination, action) = if enabled {
            (destinations::SCANNER_ENABLE, "enable")
        } else {
            (destinations::SCANNER_DISABLE, "disable")
        };
        info!(action, "scanner command");
        self.bus.send(destination, json!({ "action": action }));
    }
}

/// Barcode scanner behind the bridge.  Cheap to clone.
#[derive(Clone)]
pub struct ScannerFacade {
    inner: Arc<ScannerInner>,
}

impl ScannerFacade {
    pub fn new(bus: Arc<dyn MessageBus>, registry: CapabilityRegistry) -> Self {
        Self {
            inner: Arc::new(ScannerInner {
                bus,
                registry,
                state: Mutex::new(ScannerState::default()),
                listeners: ListenerSet::new(),
                attachment: Mutex::new(None),
            }),
        }
    }

    /// Subscribes to the scanner events topic.  Idempotent.
    pub fn attach(&self) {
        let mut attachment = self.inner.attachment.lock();
        if attachment.is_some() {
            return;
        }
        let inner: Weak<ScannerInner> = Arc::downgrade(&self.inner);
        let handler = Arc::new(move |body: &Value| {
            if let Some(inner) = inner.upgrade() {
                inner.handle(body);
            }
        });
        *attachment = Some(self.inner.bus.subscribe(destinations::SCANNER_EVENTS, handler));
    }

    /// Unsubscribes from the bus, drops every scan handler and forgets the
    /// bridge's confirmation.
    pub fn detach(&self) {
        let attachment = self.inner.attachment.lock().take();
        if let Some(subscription) = attachment {
            subscription.unsubscribe();
        }
        self.inner.listeners.clear();
        self.inner.state.lock().confirmed = None;
    }

    /// Asks the bridge to start scanning.
    pub fn enable(&self) {
        self.inner.request(true);
    }

    /// Asks the bridge to stop scanning.
    pub fn disable(&self) {
        self.inner.request(false);
    }

    /// The flag that gates scan delivery.
    pub fn is_enabled(&self) -> bool {
        self.inner.state.lock().effective()
    }

    /// What this client last asked for.
    pub fn requested(&self) -> bool {
        self.inner.state.lock().requested
    }

    /// What the bridge last reported since the last request, if anything.
    pub fn confirmed(&self) -> Option<bool> {
        self.inner.state.lock().confirmed
    }

    pub fn last_scan(&self) -> Option<ScanEvent> {
        self.inner.state.lock().last_scan.clone()
    }

    /// Registers `handler` for every delivered scan.
    pub fn on_scan(&self, handler: impl Fn(&ScanEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.listeners.add(Arc::new(handler))
    }

    /// Feeds a transport state change.  Anything but `connected` makes the
    /// bridge's last confirmation stale.
    pub fn on_transport_state(&self, state: ConnectionState) {
        if state != ConnectionState::Connected {
            let mut scanner = self.inner.state.lock();
            if scanner.confirmed.take().is_some() {
                debug!(%state, "scanner confirmation cleared");
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
