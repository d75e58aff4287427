//! Capability registry: what the device behind the bridge can do.
//!
//! # How capabilities arrive (for beginners)
//!
//! The bridge publishes one announcement on `/topic/capabilities` when a
//! client subscribes, and again whenever the hardware changes (a scanner is
//! unplugged, a card reader comes online).  Each announcement replaces the
//! previous one completely; nothing is merged.  Until the first one arrives
//! the registry reports everything as unavailable with `announced == false`,
//! so callers can tell "not announced yet" from "announced as missing".

use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use peripheral_core::protocol::destinations;
use peripheral_core::{CapabilitiesMessage, CapabilitySnapshot, Symbology};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::infrastructure::bus::MessageBus;
use crate::infrastructure::listeners::{ListenerSet, Subscription};

struct RegistryInner {
    snapshot: RwLock<Arc<CapabilitySnapshot>>,
    listeners: ListenerSet<dyn Fn(&CapabilitySnapshot) + Send + Sync>,
    attachment: Mutex<Option<Subscription>>,
}

impl RegistryInner {
    fn apply_json(&self, body: &Value) {
        match CapabilitiesMessage::from_json(body) {
            Ok(message) => self.replace(message),
            Err(e) => warn!("dropping malformed capabilities announcement: {e}"),
        }
    }

    fn replace(&self, message: CapabilitiesMessage) {
        let snapshot = Arc::new(CapabilitySnapshot::from_message(message, Utc::now()));
        info!(
            device_id = %snapshot.device_id,
            scanner = snapshot.scanner_available(),
            payment = snapshot.payment_available(),
            "capabilities announced"
        );
        *self.snapshot.write() = Arc::clone(&snapshot);
        self.listeners.emit(&snapshot);
    }
}

/// Caches the latest capability announcement.  Cheap to clone; clones share
/// the same snapshot and listeners.
#[derive(Clone)]
pub struct CapabilityRegistry {
    inner: Arc<RegistryInner>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                snapshot: RwLock::new(Arc::new(CapabilitySnapshot::unannounced())),
                listeners: ListenerSet::new(),
                attachment: Mutex::new(None),
            }),
        }
    }

    /// Subscribes to the capabilities topic on `bus`.  Calling it again while
    /// attached does nothing.
    pub fn attach(&self, bus: &dyn MessageBus) {
        let mut attachment = self.inner.attachment.lock();
        if attachment.is_some() {
            debug!("capability registry already attached");
            return;
        }
        let inner: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let handler = Arc::new(move |body: &Value| {
            if let Some(inner) = inner.upgrade() {
                inner.apply_json(body);
            }
        });
        *attachment = Some(bus.subscribe(destinations::CAPABILITIES, handler));
    }

    /// Unsubscribes from the bus and drops every `on_capabilities` handler.
    /// The last snapshot is kept.
    pub fn detach(&self) {
        let attachment = self.inner.attachment.lock().take();
        if let Some(subscription) = attachment {
            subscription.unsubscribe();
        }
        self.inner.listeners.clear();
    }

    /// Replaces the snapshot with `message`, as if it had arrived on the bus.
    pub fn update(&self, message: CapabilitiesMessage) {
        self.inner.replace(message);
    }

    /// The current snapshot.
    pub fn capabilities(&self) -> Arc<CapabilitySnapshot> {
        Arc::clone(&self.inner.snapshot.read())
    }

    /// Registers `handler` for every replacement, identical ones included.
    pub fn on_capabilities(
        &self,
        handler: impl Fn(&CapabilitySnapshot) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.listeners.add(Arc::new(handler))
    }

    pub fn is_announced(&self) -> bool {
        self.inner.snapshot.read().announced
    }

    pub fn scanner_available(&self) -> bool {
        self.inner.snapshot.read().scanner_available()
    }

    pub fn payment_available(&self) -> bool {
        self.inner.snapshot.read().payment_available()
    }

    pub fn supports_symbology(&self, symbology: &Symbology) -> bool {
        self.inner.snapshot.read().supports_symbology(symbology)
    }

    pub fn supports_method(&self, method: &str) -> bool {
        self.inner.snapshot.read().supports_method(method)
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
