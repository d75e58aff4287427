//! Barcode symbologies, scan events, and scanner topic parsing.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::{timestamp_from_value, MessageError};

// ── Symbology ─────────────────────────────────────────────────────────────────

/// Barcode symbology as named on the wire.
///
/// Unknown names are kept verbatim in [`Symbology::Other`] so a new bridge
/// symbology never turns into a parse failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Symbology {
    Ean13,
    Ean8,
    UpcA,
    UpcE,
    Code128,
    Code39,
    Qr,
    Pdf417,
    DataMatrix,
    Other(String),
}

impl Symbology {
    /// Returns the wire name.
    pub fn as_str(&self) -> &str {
        match self {
            Symbology::Ean13 => "ean13",
            Symbology::Ean8 => "ean8",
            Symbology::UpcA => "upc-a",
            Symbology::UpcE => "upc-e",
            Symbology::Code128 => "code128",
            Symbology::Code39 => "code39",
            Symbology::Qr => "qr",
            Symbology::Pdf417 => "pdf417",
            Symbology::DataMatrix => "datamatrix",
            Symbology::Other(name) => name,
        }
    }

    /// Parses a wire name, case-insensitively.  Never fails.
    pub fn from_wire(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "ean13" | "ean-13" => Symbology::Ean13,
            "ean8" | "ean-8" => Symbology::Ean8,
            "upc-a" | "upca" => Symbology::UpcA,
            "upc-e" | "upce" => Symbology::UpcE,
            "code128" => Symbology::Code128,
            "code39" => Symbology::Code39,
            "qr" => Symbology::Qr,
            "pdf417" => Symbology::Pdf417,
            "datamatrix" => Symbology::DataMatrix,
            _ => Symbology::Other(name.to_string()),
        }
    }
}

impl fmt::Display for Symbology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Symbology {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Symbology {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Symbology::from_wire(&name))
    }
}

// ── Scan event ────────────────────────────────────────────────────────────────

/// One barcode read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanEvent {
    pub barcode: String,
    pub symbology: Symbology,
    pub timestamp: DateTime<Utc>,
}

/// A parsed body from the scanner events topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannerMessage {
    /// A barcode was read.
    Scan(ScanEvent),
    /// The bridge reports whether the scanner is enabled.
    Status { enabled: bool },
}

impl ScannerMessage {
    /// Normalizes every accepted scanner body shape.
    ///
    /// Accepted shapes:
    /// - `{"event":"scan", "barcode", "symbology", "timestamp"?}`
    /// - `{"type":"scan", "event":{"barcode", "symbology", "timestamp"?}}`
    /// - `{"event":"enabled"}` / `{"event":"disabled"}`
    /// - `{"type":"status", "enabled": bool}`
    ///
    /// A missing or unreadable timestamp becomes `received_at`.  A missing
    /// symbology becomes `ean13`, the bridge's default.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError`] for any other shape.
    pub fn from_json(value: &Value, received_at: DateTime<Utc>) -> Result<Self, MessageError> {
        let obj = value.as_object().ok_or(MessageError::NotAnObject)?;
        let event = obj.get("event");
        let kind = obj.get("type").and_then(Value::as_str);

        match (kind, event) {
            (Some("scan"), Some(nested @ Value::Object(_))) => {
                scan_from_fields(nested, received_at).map(ScannerMessage::Scan)
            }
            (_, Some(Value::String(e))) if e == "scan" => {
                scan_from_fields(value, received_at).map(ScannerMessage::Scan)
            }
            (_, Some(Value::String(e))) if e == "enabled" || e == "disabled" => {
                Ok(ScannerMessage::Status {
                    enabled: e == "enabled",
                })
            }
            (Some("status"), _) => obj
                .get("enabled")
                .and_then(Value::as_bool)
                .map(|enabled| ScannerMessage::Status { enabled })
                .ok_or(MessageError::MissingField("enabled")),
            _ => Err(MessageError::UnknownShape(value.to_string())),
        }
    }
}

fn scan_from_fields(fields: &Value, received_at: DateTime<Utc>) -> Result<ScanEvent, MessageError> {
    let barcode = fields
        .get("barcode")
        .and_then(Value::as_str)
        .filter(|b| !b.is_empty())
        .ok_or(MessageError::MissingField("barcode"))?;
    let symbology = fields
        .get("symbology")
        .and_then(Value::as_str)
        .map(Symbology::from_wire)
        .unwrap_or(Symbology::Ean13);
    let timestamp = fields
        .get("timestamp")
        .and_then(timestamp_from_value)
        .unwrap_or(received_at);

    Ok(ScanEvent {
        barcode: barcode.to_string(),
        symbology,
        timestamp,
    })
}
