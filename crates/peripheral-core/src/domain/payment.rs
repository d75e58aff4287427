//! Payment terminal messages and the payment state machine rules.
//!
//! # The payment flow (for beginners)
//!
//! A card payment moves through a fixed set of states:
//!
//! ```text
//! idle → card_presented → reading_card → pin_required → pin_entry → authorizing
//!                                                                   ↓
//!                                          approved | declined | error
//! ```
//!
//! Any non-terminal state can also jump to `cancelled` or `error`.  A
//! contactless tap skips the PIN states, so the bridge may skip *forward*,
//! but it never moves backwards.  After a terminal state the client resets
//! to `idle`, ready for the next payment.
//!
//! This module only encodes those rules and the JSON shapes; the facade that
//! drives them lives in the client crate.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use super::MessageError;

/// Timeout used when the caller does not pick one.
pub const DEFAULT_PAYMENT_TIMEOUT: Duration = Duration::from_secs(60);

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    #[default]
    Idle,
    CardPresented,
    ReadingCard,
    PinRequired,
    PinEntry,
    Authorizing,
    Approved,
    Declined,
    Cancelled,
    Error,
}

impl PaymentState {
    /// Position along the forward path.  All terminal states share the top
    /// rank.
    pub fn rank(self) -> u8 {
        match self {
            PaymentState::Idle => 0,
            PaymentState::CardPresented => 1,
            PaymentState::ReadingCard => 2,
            PaymentState::PinRequired => 3,
            PaymentState::PinEntry => 4,
            PaymentState::Authorizing => 5,
            PaymentState::Approved
            | PaymentState::Declined
            | PaymentState::Cancelled
            | PaymentState::Error => 6,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PaymentState::Approved
                | PaymentState::Declined
                | PaymentState::Cancelled
                | PaymentState::Error
        )
    }

    /// Returns `true` if moving from `self` to `next` is a legal transition.
    ///
    /// - `idle` only leaves via `card_presented` (a new collect).
    /// - Terminal states only reset to `idle`.
    /// - In-progress states may move forward, possibly skipping states, or
    ///   jump to `cancelled` / `error`.
    pub fn can_transition_to(self, next: PaymentState) -> bool {
        match self {
            PaymentState::Idle => next == PaymentState::CardPresented,
            s if s.is_terminal() => next == PaymentState::Idle,
            _ => match next {
                PaymentState::Cancelled | PaymentState::Error => true,
                PaymentState::Idle => false,
                other => other.rank() > self.rank(),
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentState::Idle => "idle",
            PaymentState::CardPresented => "card_presented",
            PaymentState::ReadingCard => "reading_card",
            PaymentState::PinRequired => "pin_required",
            PaymentState::PinEntry => "pin_entry",
            PaymentState::Authorizing => "authorizing",
            PaymentState::Approved => "approved",
            PaymentState::Declined => "declined",
            PaymentState::Cancelled => "cancelled",
            PaymentState::Error => "error",
        }
    }
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Request ───────────────────────────────────────────────────────────────────

/// Reasons a [`PaymentRequest`] cannot be built.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("payment amount must be greater than zero")]
    NonPositiveAmount,

    #[error("currency must be a three-letter ISO 4217 code, got {0:?}")]
    InvalidCurrency(String),

    #[error("payment timeout must be non-zero")]
    ZeroTimeout,
}

/// A validated request to collect one payment.
///
/// Built once and submitted once.  The fields are private so an invalid
/// request cannot be constructed.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use peripheral_core::PaymentRequest;
///
/// let request = PaymentRequest::new(500, "usd")
///     .unwrap()
///     .with_timeout(Duration::from_secs(30))
///     .unwrap();
/// assert_eq!(request.currency(), "USD");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    amount_minor_units: u64,
    currency: String,
    allow_cashback: bool,
    timeout: Duration,
}

impl PaymentRequest {
    /// Creates a request with no cashback and the default 60 s timeout.
    ///
    /// The currency is upper-cased.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] if the amount is zero or the currency is not
    /// three ASCII letters.
    pub fn new(amount_minor_units: u64, currency: &str) -> Result<Self, RequestError> {
        if amount_minor_units == 0 {
            return Err(RequestError::NonPositiveAmount);
        }
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(RequestError::InvalidCurrency(currency.to_string()));
        }
        Ok(Self {
            amount_minor_units,
            currency: currency.to_ascii_uppercase(),
            allow_cashback: false,
            timeout: DEFAULT_PAYMENT_TIMEOUT,
        })
    }

    pub fn with_cashback(mut self, allow: bool) -> Self {
        self.allow_cashback = allow;
        self
    }

    /// # Errors
    ///
    /// Returns [`RequestError::ZeroTimeout`] for a zero duration.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, RequestError> {
        if timeout.is_zero() {
            return Err(RequestError::ZeroTimeout);
        }
        self.timeout = timeout;
        Ok(self)
    }

    pub fn amount_minor_units(&self) -> u64 {
        self.amount_minor_units
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn allow_cashback(&self) -> bool {
        self.allow_cashback
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn to_wire(&self) -> PaymentRequestWire {
        PaymentRequestWire {
            amount: self.amount_minor_units,
            currency: self.currency.clone(),
            allow_cashback: self.allow_cashback,
            timeout: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl TryFrom<PaymentRequestWire> for PaymentRequest {
    type Error = RequestError;

    /// A zero wire timeout means "not specified" and maps to the default.
    fn try_from(wire: PaymentRequestWire) -> Result<Self, Self::Error> {
        let request = PaymentRequest::new(wire.amount, &wire.currency)?.with_cashback(wire.allow_cashback);
        if wire.timeout == 0 {
            Ok(request)
        } else {
            request.with_timeout(Duration::from_millis(wire.timeout))
        }
    }
}

/// The request object as it appears inside a collect command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequestWire {
    pub amount: u64,
    pub currency: String,
    #[serde(default)]
    pub allow_cashback: bool,
    /// Milliseconds.
    #[serde(default)]
    pub timeout: u64,
}

// ── Commands ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentAction {
    Collect,
    Cancel,
}

/// Body of a SEND to `/app/payment/collect` or `/app/payment/cancel`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCommand {
    pub action: PaymentAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<PaymentRequestWire>,
}

impl PaymentCommand {
    pub fn collect(request: &PaymentRequest) -> Self {
        Self {
            action: PaymentAction::Collect,
            request: Some(request.to_wire()),
        }
    }

    pub fn cancel() -> Self {
        Self {
            action: PaymentAction::Cancel,
            request: None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self.request {
            Some(ref request) => json!({ "action": self.action, "request": request }),
            None => json!({ "action": self.action }),
        }
    }
}

// ── Result ────────────────────────────────────────────────────────────────────

/// The outcome of one payment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResult {
    #[serde(default)]
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_brand: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decline_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PaymentResult {
    /// Marker stored in `error` for a cancelled attempt.
    pub const CANCELLED: &'static str = "cancelled";

    pub fn cancelled() -> Self {
        Self::failed(Self::CANCELLED)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            approved: false,
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.error.as_deref() == Some(Self::CANCELLED)
    }

    /// The terminal state this result represents.
    pub fn outcome_state(&self) -> PaymentState {
        match (&self.error, self.approved) {
            (Some(_), _) if self.is_cancelled() => PaymentState::Cancelled,
            (Some(_), _) => PaymentState::Error,
            (None, true) => PaymentState::Approved,
            (None, false) => PaymentState::Declined,
        }
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

/// A normalized body from `/topic/payment/events`.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentEvent {
    /// The terminal moved to a new state.
    StateChange { state: PaymentState, data: Option<Value> },
    /// The attempt finished.
    Result(PaymentResult),
}

impl PaymentEvent {
    /// Normalizes every payment event shape seen on the wire.
    ///
    /// The discriminator is read from `type`, then `event`, then `status`:
    ///
    /// - `state_change` with `state` and optional `data`
    /// - `result` with a nested `result` object
    /// - `approved` / `declined` / `error` / `cancelled` with the result
    ///   fields flattened into the top-level object
    ///
    /// # Errors
    ///
    /// Returns [`MessageError`] for anything else.
    pub fn from_json(value: &Value) -> Result<Self, MessageError> {
        let obj = value.as_object().ok_or(MessageError::NotAnObject)?;
        let tag = ["type", "event", "status"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_str))
            .ok_or_else(|| MessageError::UnknownShape(value.to_string()))?;

        match tag {
            "state_change" => {
                let raw = obj.get("state").ok_or(MessageError::MissingField("state"))?;
                let state: PaymentState = serde_json::from_value(raw.clone())?;
                let data = obj.get("data").filter(|d| !d.is_null()).cloned();
                Ok(PaymentEvent::StateChange { state, data })
            }
            "result" => {
                let raw = obj.get("result").ok_or(MessageError::MissingField("result"))?;
                Ok(PaymentEvent::Result(serde_json::from_value(raw.clone())?))
            }
            "approved" | "declined" | "error" | "cancelled" => {
                Ok(PaymentEvent::Result(flat_result(tag, obj)?))
            }
            other => Err(MessageError::UnknownShape(other.to_string())),
        }
    }

    /// Serializes the event in the `type`-tagged shape.
    pub fn to_json(&self) -> Value {
        match self {
            PaymentEvent::StateChange { state, data: Some(data) } => {
                json!({ "type": "state_change", "state": state, "data": data })
            }
            PaymentEvent::StateChange { state, data: None } => {
                json!({ "type": "state_change", "state": state })
            }
            PaymentEvent::Result(result) => json!({ "type": "result", "result": result }),
        }
    }

    /// Extracts the message for an `error` state change: `data.error`, then
    /// `data.message`, else `"error"`.
    pub fn error_message(data: Option<&Value>) -> String {
        data.and_then(|d| {
            d.get("error")
                .and_then(Value::as_str)
                .or_else(|| d.get("message").and_then(Value::as_str))
        })
        .unwrap_or("error")
        .to_string()
    }
}

fn flat_result(tag: &str, obj: &Map<String, Value>) -> Result<PaymentResult, MessageError> {
    let mut result: PaymentResult = serde_json::from_value(Value::Object(obj.clone()))?;
    match tag {
        "approved" => {
            result.approved = true;
            result.error = None;
        }
        "declined" => {
            result.approved = false;
            if result.decline_reason.is_none() {
                result.decline_reason = string_field(obj, "reason");
            }
        }
        "cancelled" => {
            result.approved = false;
            result.error = Some(PaymentResult::CANCELLED.to_string());
        }
        _ => {
            result.approved = false;
            if result.error.is_none() {
                result.error = Some(
                    string_field(obj, "reason")
                        .or_else(|| string_field(obj, "message"))
                        .unwrap_or_else(|| "error".to_string()),
                );
            }
        }
    }
    Ok(result)
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── State machine ─────────────────────────────────────────────────────────

    #[test]
    fn test_forward_skips_are_allowed() {
        // Contactless goes straight from reading to authorizing.
        assert!(PaymentState::ReadingCard.can_transition_to(PaymentState::Authorizing));
        assert!(PaymentState::Authorizing.can_transition_to(PaymentState::Approved));
    }

    #[test]
    fn test_backward_and_repeated_states_are_rejected() {
        assert!(!PaymentState::Authorizing.can_transition_to(PaymentState::ReadingCard));
        assert!(!PaymentState::PinEntry.can_transition_to(PaymentState::PinEntry));
        assert!(!PaymentState::CardPresented.can_transition_to(PaymentState::Idle));
    }

    #[test]
    fn test_cancel_and_error_reachable_from_every_in_progress_state() {
        let in_progress = [
            PaymentState::CardPresented,
            PaymentState::ReadingCard,
            PaymentState::PinRequired,
            PaymentState::PinEntry,
            PaymentState::Authorizing,
        ];
        for state in in_progress {
            assert!(state.can_transition_to(PaymentState::Cancelled), "{state}");
            assert!(state.can_transition_to(PaymentState::Error), "{state}");
        }
    }

    #[test]
    fn test_terminal_states_only_reset_to_idle() {
        for state in [
            PaymentState::Approved,
            PaymentState::Declined,
            PaymentState::Cancelled,
            PaymentState::Error,
        ] {
            assert!(state.is_terminal());
            assert!(state.can_transition_to(PaymentState::Idle));
            assert!(!state.can_transition_to(PaymentState::Cancelled));
        }
    }

    #[test]
    fn test_idle_only_leaves_via_card_presented() {
        assert!(PaymentState::Idle.can_transition_to(PaymentState::CardPresented));
        assert!(!PaymentState::Idle.can_transition_to(PaymentState::Approved));
        assert!(!PaymentState::Idle.can_transition_to(PaymentState::Cancelled));
    }

    #[test]
    fn test_state_serializes_snake_case() {
        assert_eq!(serde_json::to_value(PaymentState::PinRequired).unwrap(), json!("pin_required"));
    }

    // ── Request ───────────────────────────────────────────────────────────────

    #[test]
    fn test_request_validation() {
        assert_eq!(PaymentRequest::new(0, "USD"), Err(RequestError::NonPositiveAmount));
        assert_eq!(
            PaymentRequest::new(100, "US"),
            Err(RequestError::InvalidCurrency("US".to_string()))
        );
        assert_eq!(
            PaymentRequest::new(100, "U$D"),
            Err(RequestError::InvalidCurrency("U$D".to_string()))
        );
        let request = PaymentRequest::new(100, "eur").unwrap();
        assert_eq!(request.with_timeout(Duration::ZERO), Err(RequestError::ZeroTimeout));
    }

    #[test]
    fn test_collect_command_wire_shape() {
        // Arrange
        let request = PaymentRequest::new(500, "USD")
            .unwrap()
            .with_cashback(true)
            .with_timeout(Duration::from_millis(1_000))
            .unwrap();

        // Act
        let body = PaymentCommand::collect(&request).to_json();

        // Assert
        assert_eq!(
            body,
            json!({
                "action": "collect",
                "request": { "amount": 500, "currency": "USD", "allowCashback": true, "timeout": 1000 }
            })
        );
    }

    #[test]
    fn test_cancel_command_has_no_request() {
        assert_eq!(PaymentCommand::cancel().to_json(), json!({ "action": "cancel" }));
    }

    #[test]
    fn test_wire_request_with_zero_timeout_uses_default() {
        let wire = PaymentRequestWire {
            amount: 250,
            currency: "GBP".to_string(),
            allow_cashback: false,
            timeout: 0,
        };
        let request = PaymentRequest::try_from(wire).unwrap();
        assert_eq!(request.timeout(), DEFAULT_PAYMENT_TIMEOUT);
    }

    // ── Events ────────────────────────────────────────────────────────────────

    #[test]
    fn test_state_change_with_type_tag() {
        let event = PaymentEvent::from_json(&json!({ "type": "state_change", "state": "reading_card" }));
        assert_eq!(
            event.unwrap(),
            PaymentEvent::StateChange {
                state: PaymentState::ReadingCard,
                data: None
            }
        );
    }

    #[test]
    fn test_state_change_with_event_tag_and_data() {
        let body = json!({ "event": "state_change", "state": "error", "data": { "message": "reader fault" } });

        let PaymentEvent::StateChange { state, data } = PaymentEvent::from_json(&body).unwrap() else {
            panic!("expected a state change");
        };

        assert_eq!(state, PaymentState::Error);
        assert_eq!(PaymentEvent::error_message(data.as_ref()), "reader fault");
    }

    #[test]
    fn test_error_message_prefers_error_then_message() {
        let both = json!({ "error": "e", "message": "m" });
        assert_eq!(PaymentEvent::error_message(Some(&both)), "e");
        assert_eq!(PaymentEvent::error_message(Some(&json!({ "code": 5 }))), "error");
        assert_eq!(PaymentEvent::error_message(None), "error");
    }

    #[test]
    fn test_nested_result_shape() {
        // Arrange: the shape the bridge emulator publishes
        let body = json!({
            "type": "result",
            "result": {
                "approved": true,
                "transactionId": "txn-1",
                "method": "chip",
                "cardBrand": "visa",
                "last4": "4242",
                "authCode": "AUTH123"
            }
        });

        // Act
        let event = PaymentEvent::from_json(&body).unwrap();

        // Assert
        let PaymentEvent::Result(result) = event else {
            panic!("expected a result");
        };
        assert!(result.approved);
        assert_eq!(result.transaction_id.as_deref(), Some("txn-1"));
        assert_eq!(result.outcome_state(), PaymentState::Approved);
    }

    #[test]
    fn test_flat_approved_shape() {
        let body = json!({
            "event": "approved",
            "status": "approved",
            "transactionId": "txn-9",
            "method": "contactless",
            "cardBrand": "visa",
            "last4": "4242",
            "authCode": "A1"
        });

        let PaymentEvent::Result(result) = PaymentEvent::from_json(&body).unwrap() else {
            panic!("expected a result");
        };

        assert!(result.approved);
        assert_eq!(result.method.as_deref(), Some("contactless"));
    }

    #[test]
    fn test_flat_declined_reads_reason() {
        let body = json!({ "event": "declined", "reason": "insufficient_funds" });
        let PaymentEvent::Result(result) = PaymentEvent::from_json(&body).unwrap() else {
            panic!("expected a result");
        };
        assert!(!result.approved);
        assert_eq!(result.decline_reason.as_deref(), Some("insufficient_funds"));
        assert_eq!(result.outcome_state(), PaymentState::Declined);
    }

    #[test]
    fn test_status_only_error_shape() {
        let body = json!({ "status": "error", "reason": "terminal offline" });
        let PaymentEvent::Result(result) = PaymentEvent::from_json(&body).unwrap() else {
            panic!("expected a result");
        };
        assert_eq!(result.error.as_deref(), Some("terminal offline"));
        assert_eq!(result.outcome_state(), PaymentState::Error);
    }

    #[test]
    fn test_flat_cancelled_shape() {
        let PaymentEvent::Result(result) = PaymentEvent::from_json(&json!({ "event": "cancelled" })).unwrap() else {
            panic!("expected a result");
        };
        assert!(result.is_cancelled());
        assert_eq!(result.outcome_state(), PaymentState::Cancelled);
    }

    #[test]
    fn test_unknown_state_is_rejected() {
        let result = PaymentEvent::from_json(&json!({ "type": "state_change", "state": "teleporting" }));
        assert!(matches!(result, Err(MessageError::Json(_))));
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let result = PaymentEvent::from_json(&json!({ "type": "refund" }));
        assert!(matches!(result, Err(MessageError::UnknownShape(_))));
    }

    #[test]
    fn test_to_json_parses_back() {
        let event = PaymentEvent::StateChange {
            state: PaymentState::Authorizing,
            data: None,
        };
        assert_eq!(PaymentEvent::from_json(&event.to_json()).unwrap(), event);
    }
}
