//! The simulated peripherals behind the emulator.
//!
//! [`Device`] owns the scanner's enabled flag and a payment terminal that
//! walks through the same states a real terminal reports.  Everything it
//! says goes out through the [`Hub`] as a JSON body on one of the event
//! topics.
//!
//! # Payment flow
//!
//! ```text
//! collect ─► card_presented ─► reading_card ─┬─► pin_required ─► pin_entry ─┐
//!                                            │        (chip only)           │
//!                                            └──────────────────────────────┴─► authorizing ─► approved | declined
//!                                                                                                 │
//!                                                                                 result event ◄──┘ then idle
//! ```
//!
//! A cancel at any point aborts the flow, publishes `cancelled` and returns
//! the terminal to idle.
//!
//! # For beginners: why a generation counter?
//!
//! The flow runs in its own Tokio task that sleeps between steps.  Aborting
//! the task stops it at its next `.await`, but a step that already woke up
//! could still be about to publish.  Every attempt gets a fresh generation
//! number and each step checks it under the lock, so a stale step never
//! publishes after a cancel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use peripheral_core::protocol::destinations;
use peripheral_core::{
    CapabilitiesMessage, PaymentCommand, PaymentEvent, PaymentRequest, PaymentRequestWire,
    PaymentResult, PaymentState, ScanEvent, Symbology,
};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::hub::{Hub, SessionId};
use crate::domain::{CommandError, EmulatorConfig};

struct PaymentSim {
    state: PaymentState,
    generation: u64,
    flow: Option<JoinHandle<()>>,
}

/// Simulated scanner and card terminal.
pub struct Device {
    config: EmulatorConfig,
    hub: Arc<Hub>,
    scanner_enabled: AtomicBool,
    payment: Mutex<PaymentSim>,
}

impl Device {
    pub fn new(config: EmulatorConfig, hub: Arc<Hub>) -> Self {
        Self {
            config,
            hub,
            scanner_enabled: AtomicBool::new(false),
            payment: Mutex::new(PaymentSim {
                state: PaymentState::Idle,
                generation: 0,
                flow: None,
            }),
        }
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    pub fn scanner_enabled(&self) -> bool {
        self.scanner_enabled.load(Ordering::SeqCst)
    }

    pub fn payment_state(&self) -> PaymentState {
        self.payment.lock().state
    }

    // ── Commands from clients ─────────────────────────────────────────────────

    /// Acts on the body of a SEND frame.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] for an unknown destination, a body that is not
    /// a valid command, or a collect while the terminal is busy.  A busy
    /// terminal also sends an `error` state change, to the requesting
    /// session only, so other sessions' payments are left alone.
    pub fn handle_send(
        self: &Arc<Self>,
        session: SessionId,
        destination: &str,
        body: &str,
    ) -> Result<(), CommandError> {
        match destination {
            destinations::SCANNER_ENABLE => {
                self.set_scanner_enabled(true);
                Ok(())
            }
            destinations::SCANNER_DISABLE => {
                self.set_scanner_enabled(false);
                Ok(())
            }
            destinations::PAYMENT_COLLECT => {
                let request = parse_collect(body)?;
                self.start_payment(session, request)
            }
            destinations::PAYMENT_CANCEL => {
                self.cancel_payment();
                Ok(())
            }
            other => Err(CommandError::UnknownDestination(other.to_string())),
        }
    }

    /// Called after a session subscribes.  A capabilities subscriber gets
    /// the current announcement straight away.
    pub fn on_subscribe(&self, session: SessionId, subscription: &str, destination: &str) {
        if destination == destinations::CAPABILITIES {
            let body = self.capabilities_body();
            self.hub
                .send_to(session, subscription, destinations::CAPABILITIES, &body);
        }
    }

    /// Publishes the announcement to every capabilities subscriber.
    pub fn announce(&self) -> usize {
        self.hub
            .publish(destinations::CAPABILITIES, &self.capabilities_body())
    }

    // ── Scanner ───────────────────────────────────────────────────────────────

    fn set_scanner_enabled(&self, enabled: bool) {
        self.scanner_enabled.store(enabled, Ordering::SeqCst);
        info!(enabled, "scanner toggled");
        self.hub.publish(
            destinations::SCANNER_EVENTS,
            &json!({ "type": "status", "enabled": enabled }),
        );
    }

    /// Publishes a scan if the scanner is enabled.  Returns whether it was
    /// published.
    pub fn trigger_scan(&self, barcode: &str, symbology: Symbology) -> bool {
        if !self.scanner_enabled() {
            debug!(barcode, "scanner disabled; scan ignored");
            return false;
        }
        let event = ScanEvent {
            barcode: barcode.to_string(),
            symbology,
            timestamp: Utc::now(),
        };
        self.hub.publish(
            destinations::SCANNER_EVENTS,
            &json!({ "type": "scan", "event": event }),
        );
        true
    }

    // ── Payment ───────────────────────────────────────────────────────────────

    fn start_payment(
        self: &Arc<Self>,
        session: SessionId,
        request: PaymentRequest,
    ) -> Result<(), CommandError> {
        let mut sim = self.payment.lock();
        if sim.state != PaymentState::Idle {
            let busy = PaymentEvent::StateChange {
                state: PaymentState::Error,
                data: Some(json!({ "message": "terminal busy" })),
            };
            self.hub
                .publish_to(session, destinations::PAYMENT_EVENTS, &busy.to_json());
            return Err(CommandError::Busy(sim.state));
        }
        sim.generation += 1;
        let generation = sim.generation;
        sim.state = PaymentState::CardPresented;
        info!(
            amount = request.amount_minor_units(),
            currency = request.currency(),
            "payment started"
        );
        self.publish_state(
            PaymentState::CardPresented,
            Some(json!({
                "amount": request.amount_minor_units(),
                "currency": request.currency(),
            })),
        );
        sim.flow = Some(tokio::spawn(Arc::clone(self).run_flow(generation)));
        Ok(())
    }

    fn cancel_payment(&self) {
        let mut sim = self.payment.lock();
        if sim.state == PaymentState::Idle {
            debug!("cancel with no payment in flight");
            return;
        }
        if let Some(flow) = sim.flow.take() {
            flow.abort();
        }
        sim.generation += 1;
        sim.state = PaymentState::Idle;
        info!("payment cancelled");
        self.publish_state(PaymentState::Cancelled, None);
    }

    async fn run_flow(self: Arc<Self>, generation: u64) {
        let steps = self.config.steps;

        tokio::time::sleep(steps.card).await;
        if !self.advance(generation, PaymentState::ReadingCard) {
            return;
        }
        tokio::time::sleep(steps.reading).await;

        if self.config.requires_pin() {
            if !self.advance(generation, PaymentState::PinRequired) {
                return;
            }
            tokio::time::sleep(steps.pin).await;
            if !self.advance(generation, PaymentState::PinEntry) {
                return;
            }
            tokio::time::sleep(steps.pin).await;
        }

        if !self.advance(generation, PaymentState::Authorizing) {
            return;
        }
        tokio::time::sleep(steps.authorizing).await;
        self.finish(generation);
    }

    /// Moves to `state` if the attempt is still current.
    fn advance(&self, generation: u64, state: PaymentState) -> bool {
        let mut sim = self.payment.lock();
        if sim.generation != generation {
            return false;
        }
        sim.state = state;
        self.publish_state(state, None);
        true
    }

    fn finish(&self, generation: u64) {
        let mut sim = self.payment.lock();
        if sim.generation != generation {
            return;
        }
        let result = self.outcome();
        let state = result.outcome_state();
        self.publish_state(state, None);
        self.hub.publish(
            destinations::PAYMENT_EVENTS,
            &PaymentEvent::Result(result).to_json(),
        );
        info!(%state, "payment finished");
        sim.state = PaymentState::Idle;
        sim.flow = None;
    }

    fn outcome(&self) -> PaymentResult {
        let transaction_id = format!("txn-{}", Uuid::new_v4());
        let mut result = PaymentResult {
            approved: !self.config.decline,
            transaction_id: Some(transaction_id),
            method: Some(self.config.method.clone()),
            card_brand: Some("visa".to_string()),
            last4: Some("4242".to_string()),
            ..PaymentResult::default()
        };
        if self.config.decline {
            result.decline_reason = Some("insufficient_funds".to_string());
        } else {
            let code = Uuid::new_v4().simple().to_string();
            result.auth_code = Some(code[..6].to_ascii_uppercase());
        }
        result
    }

    fn publish_state(&self, state: PaymentState, data: Option<Value>) {
        self.hub.publish(
            destinations::PAYMENT_EVENTS,
            &PaymentEvent::StateChange { state, data }.to_json(),
        );
    }

    fn capabilities_body(&self) -> Value {
        let message =
            CapabilitiesMessage::new(self.config.device_id.clone(), self.config.capabilities());
        serde_json::to_value(message).unwrap_or_else(|e| {
            warn!("could not serialize capabilities: {e}");
            Value::Null
        })
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Some(flow) = self.payment.get_mut().flow.take() {
            flow.abort();
        }
    }
}

/// Accepts `{"action":"collect","request":{..}}` or a bare request object.
fn parse_collect(body: &str) -> Result<PaymentRequest, CommandError> {
    let value: Value = serde_json::from_str(body)?;
    let wire: PaymentRequestWire = if value.get("action").is_some() {
        let command: PaymentCommand = serde_json::from_value(value)?;
        command.request.ok_or(CommandError::MissingRequest)?
    } else {
        serde_json::from_value(value)?
    };
    Ok(PaymentRequest::try_from(wire)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::hub::SessionCommand;
    use std::time::Duration;
    use tokio::sync::mpsc;

    use crate::domain::StepDelays;

    /// The first session a fresh hub hands out.
    const SESSION: SessionId = 1;

    fn device(config: EmulatorConfig) -> (Arc<Device>, mpsc::UnboundedReceiver<SessionCommand>) {
        let hub = Arc::new(Hub::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let session = hub.register(tx);
        assert_eq!(session, SESSION);
        hub.subscribe(session, "sub-s", destinations::SCANNER_EVENTS);
        hub.subscribe(session, "sub-p", destinations::PAYMENT_EVENTS);
        (Arc::new(Device::new(config, hub)), rx)
    }

    fn fast(method: &str, decline: bool) -> EmulatorConfig {
        EmulatorConfig {
            method: method.to_string(),
            decline,
            steps: StepDelays::uniform(Duration::from_millis(50)),
            ..EmulatorConfig::for_tests()
        }
    }

    async fn next_body(rx: &mut mpsc::UnboundedReceiver<SessionCommand>) -> Value {
        match rx.recv().await {
            Some(SessionCommand::Frame(frame)) => serde_json::from_str(&frame.body).unwrap(),
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    async fn states_until_result(rx: &mut mpsc::UnboundedReceiver<SessionCommand>) -> (Vec<String>, Value) {
        let mut states = Vec::new();
        loop {
            let body = next_body(rx).await;
            match body["type"].as_str() {
                Some("state_change") => states.push(body["state"].as_str().unwrap().to_string()),
                Some("result") => return (states, body["result"].clone()),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    const COLLECT: &str = r#"{"action":"collect","request":{"amount":1250,"currency":"EUR"}}"#;

    // ── Scanner ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_scan_is_dropped_while_disabled() {
        let (device, mut rx) = device(fast("chip", false));

        assert!(!device.trigger_scan("4006381333931", Symbology::Ean13));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_enable_publishes_status_then_scans_flow() {
        // Arrange
        let (device, mut rx) = device(fast("chip", false));

        // Act
        device.handle_send(SESSION, destinations::SCANNER_ENABLE, "").unwrap();
        let published = device.trigger_scan("012345678905", Symbology::UpcA);

        // Assert
        assert!(published);
        assert!(device.scanner_enabled());
        assert_eq!(
            next_body(&mut rx).await,
            json!({ "type": "status", "enabled": true })
        );
        let scan = next_body(&mut rx).await;
        assert_eq!(scan["type"], "scan");
        assert_eq!(scan["event"]["barcode"], "012345678905");
        assert_eq!(scan["event"]["symbology"], "upc-a");
        assert!(scan["event"]["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_destination_is_an_error() {
        let (device, _rx) = device(fast("chip", false));
        let err = device.handle_send(SESSION, "/app/printer/print", "{}").unwrap_err();
        assert!(matches!(err, CommandError::UnknownDestination(_)));
    }

    // ── Payment ───────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_chip_payment_walks_pin_steps_and_approves() {
        // Arrange
        let (device, mut rx) = device(fast("chip", false));

        // Act
        device.handle_send(SESSION, destinations::PAYMENT_COLLECT, COLLECT).unwrap();
        let (states, result) = states_until_result(&mut rx).await;

        // Assert
        assert_eq!(
            states,
            [
                "card_presented",
                "reading_card",
                "pin_required",
                "pin_entry",
                "authorizing",
                "approved"
            ]
        );
        assert_eq!(result["approved"], true);
        assert_eq!(result["method"], "chip");
        assert_eq!(result["last4"], "4242");
        assert!(result["transactionId"].as_str().unwrap().starts_with("txn-"));
        assert_eq!(result["authCode"].as_str().unwrap().len(), 6);
        assert_eq!(device.payment_state(), PaymentState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_contactless_decline_skips_pin() {
        let (device, mut rx) = device(fast("contactless", true));

        device
            .handle_send(
                SESSION,
                destinations::PAYMENT_COLLECT,
                r#"{"amount":500,"currency":"usd"}"#,
            )
            .unwrap();
        let (states, result) = states_until_result(&mut rx).await;

        assert_eq!(
            states,
            ["card_presented", "reading_card", "authorizing", "declined"]
        );
        assert_eq!(result["approved"], false);
        assert_eq!(result["declineReason"], "insufficient_funds");
        assert!(result.get("authCode").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_while_busy_is_rejected() {
        let (device, mut rx) = device(fast("chip", false));
        device.handle_send(SESSION, destinations::PAYMENT_COLLECT, COLLECT).unwrap();
        assert_eq!(next_body(&mut rx).await["state"], "card_presented");

        let err = device
            .handle_send(SESSION, destinations::PAYMENT_COLLECT, COLLECT)
            .unwrap_err();

        assert!(matches!(err, CommandError::Busy(PaymentState::CardPresented)));
        let busy = next_body(&mut rx).await;
        assert_eq!(busy["state"], "error");
        assert_eq!(busy["data"]["message"], "terminal busy");
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_error_goes_only_to_the_requesting_session() {
        // Arrange: session 1 owns the running payment, session 2 also listens
        let (device, mut first) = device(fast("chip", false));
        let (tx, mut second) = mpsc::unbounded_channel();
        let other = device.hub.register(tx);
        device.hub.subscribe(other, "sub-p2", destinations::PAYMENT_EVENTS);
        device.handle_send(SESSION, destinations::PAYMENT_COLLECT, COLLECT).unwrap();
        assert_eq!(next_body(&mut first).await["state"], "card_presented");
        assert_eq!(next_body(&mut second).await["state"], "card_presented");

        // Act
        let err = device
            .handle_send(other, destinations::PAYMENT_COLLECT, COLLECT)
            .unwrap_err();

        // Assert
        assert!(matches!(err, CommandError::Busy(_)));
        let busy = next_body(&mut second).await;
        assert_eq!(busy["state"], "error");
        assert_eq!(busy["data"]["message"], "terminal busy");
        assert_eq!(next_body(&mut first).await["state"], "reading_card");
        assert_eq!(device.payment_state(), PaymentState::ReadingCard);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_flow_and_returns_to_idle() {
        // Arrange
        let (device, mut rx) = device(fast("chip", false));
        device.handle_send(SESSION, destinations::PAYMENT_COLLECT, COLLECT).unwrap();
        assert_eq!(next_body(&mut rx).await["state"], "card_presented");

        // Act
        device
            .handle_send(SESSION, destinations::PAYMENT_CANCEL, r#"{"action":"cancel"}"#)
            .unwrap();

        // Assert: cancelled is the last thing published
        assert_eq!(next_body(&mut rx).await["state"], "cancelled");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(device.payment_state(), PaymentState::Idle);
    }

    #[tokio::test]
    async fn test_cancel_when_idle_publishes_nothing() {
        let (device, mut rx) = device(fast("chip", false));

        device.handle_send(SESSION, destinations::PAYMENT_CANCEL, "").unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected() {
        let (device, _rx) = device(fast("chip", false));

        let zero = device.handle_send(
            SESSION,
            destinations::PAYMENT_COLLECT,
            r#"{"amount":0,"currency":"EUR"}"#,
        );
        let garbage = device.handle_send(SESSION, destinations::PAYMENT_COLLECT, "not json");

        assert!(matches!(zero, Err(CommandError::InvalidRequest(_))));
        assert!(matches!(garbage, Err(CommandError::Malformed(_))));
        assert_eq!(device.payment_state(), PaymentState::Idle);
    }

    #[tokio::test]
    async fn test_capabilities_sent_on_subscribe() {
        // Arrange
        let hub = Arc::new(Hub::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = hub.register(tx);
        hub.subscribe(session, "sub-c", destinations::CAPABILITIES);
        let device = Device::new(EmulatorConfig::for_tests(), Arc::clone(&hub));

        // Act
        device.on_subscribe(session, "sub-c", destinations::CAPABILITIES);

        // Assert
        let Some(SessionCommand::Frame(frame)) = rx.recv().await else {
            panic!("expected a frame");
        };
        assert_eq!(frame.get("subscription"), Some("sub-c"));
        let body: Value = serde_json::from_str(&frame.body).unwrap();
        let message = CapabilitiesMessage::from_json(&body).unwrap();
        assert_eq!(message.device_id, "emulator-001");
        assert!(message.capabilities.payment.available);
    }
}
