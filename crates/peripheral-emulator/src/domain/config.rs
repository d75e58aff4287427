//! Emulator configuration.
//!
//! [`EmulatorConfig`] is a plain struct built from CLI arguments in
//! `main.rs` or from defaults in tests.  Nothing in here reads the
//! environment.

use std::net::SocketAddr;
use std::time::Duration;

use peripheral_core::{Capabilities, PaymentCapability, ScannerCapability, Symbology};

/// Default WebSocket port of a real bridge on a lane PC.
pub const DEFAULT_WS_PORT: u16 = 9100;

/// Card methods the simulated terminal accepts.
pub const SUPPORTED_METHODS: [&str; 3] = ["chip", "contactless", "swipe"];

/// How long each simulated payment step takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDelays {
    /// `card_presented` → `reading_card`.
    pub card: Duration,
    /// `reading_card` → next step.
    pub reading: Duration,
    /// `pin_required` → `pin_entry` → `authorizing`, per step.  Chip only.
    pub pin: Duration,
    /// `authorizing` → outcome.
    pub authorizing: Duration,
}

impl Default for StepDelays {
    fn default() -> Self {
        Self {
            card: Duration::from_millis(100),
            reading: Duration::from_millis(500),
            pin: Duration::from_secs(2),
            authorizing: Duration::from_secs(1),
        }
    }
}

impl StepDelays {
    /// Every step at `delay`.  Tests use a few milliseconds.
    pub fn uniform(delay: Duration) -> Self {
        Self {
            card: delay,
            reading: delay,
            pin: delay,
            authorizing: delay,
        }
    }
}

/// All runtime settings for the emulator.
///
/// # Example
///
/// ```rust
/// use peripheral_emulator::domain::config::EmulatorConfig;
///
/// let cfg = EmulatorConfig::default();
/// assert_eq!(cfg.ws_bind_addr.port(), 9100);
/// assert_eq!(cfg.method, "chip");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatorConfig {
    /// Address the WebSocket server binds to.  Port 0 picks a free port.
    pub ws_bind_addr: SocketAddr,
    /// `deviceId` in the capabilities announcement.
    pub device_id: String,
    /// Decline every payment instead of approving it.
    pub decline: bool,
    /// Card method reported on results.  `chip` walks through the PIN steps.
    pub method: String,
    pub steps: StepDelays,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            ws_bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_WS_PORT)),
            device_id: "emulator-001".to_string(),
            decline: false,
            method: "chip".to_string(),
            steps: StepDelays::default(),
        }
    }
}

impl EmulatorConfig {
    /// Loopback on an OS-assigned port with short step delays.
    pub fn for_tests() -> Self {
        Self {
            ws_bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            steps: StepDelays::uniform(Duration::from_millis(10)),
            ..Self::default()
        }
    }

    /// Whether the configured method goes through the PIN steps.
    pub fn requires_pin(&self) -> bool {
        self.method.eq_ignore_ascii_case("chip")
    }

    /// What the emulated device announces on `/topic/capabilities`.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            scanner: ScannerCapability {
                available: true,
                mode: Some("bridge".to_string()),
                symbologies: vec![
                    Symbology::Ean13,
                    Symbology::UpcA,
                    Symbology::Qr,
                    Symbology::Pdf417,
                ],
            },
            payment: PaymentCapability {
                available: true,
                methods: SUPPORTED_METHODS.iter().map(|m| m.to_string()).collect(),
                cashback: true,
            },
        }
    }
}
