//! Device capability announcements.
//!
//! The bridge publishes one announcement on `/topic/capabilities` whenever a
//! client subscribes, and again when its hardware changes.  Each announcement
//! replaces the previous one wholesale; fields are never merged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::scan::Symbology;
use super::{lenient_timestamp, MessageError};

/// Scanner section of an announcement.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScannerCapability {
    #[serde(default)]
    pub available: bool,
    /// Free-form mode string such as `"bridge"` or `"keyboard"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default)]
    pub symbologies: Vec<Symbology>,
}

/// Payment terminal section of an announcement.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PaymentCapability {
    #[serde(default)]
    pub available: bool,
    /// Card presentation methods such as `"chip"` or `"contactless"`.
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub cashback: bool,
}

/// The peripherals this client understands.  Other sections (printer,
/// lights) are ignored on deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub scanner: ScannerCapability,
    #[serde(default)]
    pub payment: PaymentCapability,
}

/// The wire body published on `/topic/capabilities`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    pub device_id: String,
    pub capabilities: Capabilities,
}

impl CapabilitiesMessage {
    /// Builds an announcement stamped with the current time.
    pub fn new(device_id: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            kind: "capabilities".to_string(),
            timestamp: Some(Utc::now()),
            device_id: device_id.into(),
            capabilities,
        }
    }

    /// Parses a body from the capabilities topic.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError`] if the body is not an object, has a `type`
    /// other than `capabilities`, or lacks `deviceId` / `capabilities`.
    pub fn from_json(value: &Value) -> Result<Self, MessageError> {
        let obj = value.as_object().ok_or(MessageError::NotAnObject)?;
        match obj.get("type").and_then(Value::as_str) {
            Some("capabilities") | None => {}
            Some(other) => return Err(MessageError::UnknownShape(other.to_string())),
        }
        if !obj.contains_key("deviceId") {
            return Err(MessageError::MissingField("deviceId"));
        }
        if !obj.contains_key("capabilities") {
            return Err(MessageError::MissingField("capabilities"));
        }

        let mut message: CapabilitiesMessage = serde_json::from_value(value.clone())?;
        message.kind = "capabilities".to_string();
        Ok(message)
    }
}

/// What the client currently believes about the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    /// Empty until the first announcement.
    pub device_id: String,
    /// The time the bridge put on the announcement, if it sent one.
    pub timestamp: Option<DateTime<Utc>>,
    /// When this client stored the snapshot.
    pub received_at: DateTime<Utc>,
    /// `false` for the placeholder used before any announcement arrives.
    pub announced: bool,
    pub capabilities: Capabilities,
}

impl CapabilitySnapshot {
    /// The all-unavailable placeholder used before the first announcement.
    pub fn unannounced() -> Self {
        Self {
            device_id: String::new(),
            timestamp: None,
            received_at: Utc::now(),
            announced: false,
            capabilities: Capabilities::default(),
        }
    }

    pub fn from_message(message: CapabilitiesMessage, received_at: DateTime<Utc>) -> Self {
        Self {
            device_id: message.device_id,
            timestamp: message.timestamp,
            received_at,
            announced: true,
            capabilities: message.capabilities,
        }
    }

    pub fn scanner_available(&self) -> bool {
        self.capabilities.scanner.available
    }

    pub fn payment_available(&self) -> bool {
        self.capabilities.payment.available
    }

    pub fn supports_symbology(&self, symbology: &Symbology) -> bool {
        self.capabilities.scanner.available
            && self.capabilities.scanner.symbologies.contains(symbology)
    }

    /// Method names compare case-insensitively.
    pub fn supports_method(&self, method: &str) -> bool {
        self.capabilities.payment.available
            && self
                .capabilities
                .payment
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method))
    }
}

impl Default for CapabilitySnapshot {
    fn default() -> Self {
        Self::unannounced()
    }
}
