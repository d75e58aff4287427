//! Typed JSON bodies carried inside STOMP frames.
//!
//! # Why a separate domain layer? (for beginners)
//!
//! The bridge speaks JSON, and different bridge builds do not agree on every
//! field name.  Rather than let each facade poke at raw `serde_json::Value`
//! trees, every inbound body is turned into one of the typed enums in this
//! module exactly once, at the edge.  The facades only ever see
//! [`capabilities::CapabilitySnapshot`], [`scan::ScannerMessage`] and
//! [`payment::PaymentEvent`], so a wire-format change touches one parser
//! instead of every consumer.
//!
//! Nothing here touches sockets or async code, so all of it is unit-testable
//! with plain `#[test]` functions.

pub mod capabilities;
pub mod payment;
pub mod scan;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while turning a JSON body into a domain message.
#[derive(Debug, Error)]
pub enum MessageError {
    /// The body is valid JSON but not an object.
    #[error("message body is not a JSON object")]
    NotAnObject,

    /// The object does not match any accepted shape for its topic.
    #[error("unrecognised message shape: {0}")]
    UnknownShape(String),

    /// A required field is absent or has the wrong JSON type.
    #[error("missing or invalid field `{0}`")]
    MissingField(&'static str),

    /// serde rejected the object.
    #[error("invalid message body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Accepts an RFC 3339 string or epoch milliseconds.  Anything else becomes
/// `None` rather than failing the whole message.
pub(crate) fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(timestamp_from_value))
}

pub(crate) fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}
