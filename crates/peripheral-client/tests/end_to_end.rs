//! End-to-end tests against the in-process emulator over a real socket.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use peripheral_client::domain::config::ReconnectConfig;
use peripheral_client::{ClientConfig, ConnectionState, PaymentError, PeripheralClient};
use peripheral_core::protocol::destinations;
use peripheral_core::{PaymentRequest, PaymentState, Symbology};
use peripheral_emulator::{EmulatorConfig, EmulatorHandle, StepDelays};

// ── Helpers ───────────────────────────────────────────────────────────────────

fn client_config(emulator: &EmulatorHandle) -> ClientConfig {
    ClientConfig {
        endpoint: emulator.endpoint(),
        connect_timeout_ms: 2_000,
        reconnect: ReconnectConfig {
            initial_delay_ms: 20,
            max_delay_ms: 100,
            multiplier: 2.0,
            max_attempts: 20,
        },
        ..ClientConfig::default()
    }
}

fn emulator_config(method: &str, decline: bool, step: Duration) -> EmulatorConfig {
    EmulatorConfig {
        method: method.to_string(),
        decline,
        steps: StepDelays::uniform(step),
        ..EmulatorConfig::for_tests()
    }
}

/// Polls `condition` every 10 ms for up to 5 s.
async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn connected_pair(config: EmulatorConfig) -> (EmulatorHandle, PeripheralClient) {
    let emulator = EmulatorHandle::spawn(config).await.unwrap();
    let client = PeripheralClient::new(&client_config(&emulator));
    client.connect().await.unwrap();
    (emulator, client)
}

// ── Connection and capabilities ───────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_receives_capabilities() {
    // Arrange + Act
    let (emulator, client) = connected_pair(EmulatorConfig::for_tests()).await;

    // Assert
    assert_eq!(client.state(), ConnectionState::Connected);
    let registry = client.capabilities();
    eventually("capabilities", || registry.is_announced()).await;
    assert!(registry.scanner_available());
    assert!(registry.payment_available());
    assert!(registry.supports_symbology(&Symbology::UpcA));
    assert!(registry.supports_method("contactless"));
    assert_eq!(registry.capabilities().device_id, "emulator-001");
    eventually("payment subscription", || {
        emulator.subscriber_count(destinations::PAYMENT_EVENTS) == 1
    })
    .await;

    client.disconnect().await;
    emulator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disconnect_is_idempotent_and_closes_session() {
    // Arrange
    let (emulator, client) = connected_pair(EmulatorConfig::for_tests()).await;
    eventually("session", || emulator.session_count() == 1).await;

    // Act
    client.disconnect().await;
    client.disconnect().await;

    // Assert
    assert_eq!(client.state(), ConnectionState::Disconnected);
    eventually("session closed", || emulator.session_count() == 0).await;
    emulator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnects_and_resubscribes_after_bridge_drop() {
    // Arrange
    let (emulator, client) = connected_pair(EmulatorConfig::for_tests()).await;
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    let _sub = client.on_state_change(move |state| sink.lock().push(*state));
    eventually("subscriptions", || {
        emulator.subscriber_count(destinations::SCANNER_EVENTS) == 1
    })
    .await;

    // Act
    emulator.drop_sessions();

    // Assert
    eventually("reconnect", || {
        let seen = states.lock();
        seen.contains(&ConnectionState::Reconnecting)
            && seen.last() == Some(&ConnectionState::Connected)
    })
    .await;
    eventually("resubscribe", || {
        emulator.session_count() == 1
            && emulator.subscriber_count(destinations::CAPABILITIES) == 1
            && emulator.subscriber_count(destinations::SCANNER_EVENTS) == 1
            && emulator.subscriber_count(destinations::PAYMENT_EVENTS) == 1
    })
    .await;

    client.disconnect().await;
    emulator.shutdown().await.unwrap();
}

// ── Scanner ───────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_enabled_scanner_delivers_scans() {
    // Arrange
    let (emulator, client) = connected_pair(EmulatorConfig::for_tests()).await;
    let scans = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&scans);
    let _sub = client.scanner().on_scan(move |scan| sink.lock().push(scan.clone()));

    // Act
    client.scanner().enable();
    eventually("bridge confirms", || client.scanner().confirmed() == Some(true)).await;
    assert!(emulator.scanner_enabled());
    assert!(emulator.trigger_scan("012345678905", Symbology::UpcA));

    // Assert
    eventually("scan", || scans.lock().len() == 1).await;
    let scan = scans.lock()[0].clone();
    assert_eq!(scan.barcode, "012345678905");
    assert_eq!(scan.symbology, Symbology::UpcA);
    assert_eq!(client.scanner().last_scan(), Some(scan));

    client.disconnect().await;
    emulator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disabled_scanner_stops_scans() {
    let (emulator, client) = connected_pair(EmulatorConfig::for_tests()).await;
    client.scanner().enable();
    eventually("enabled", || emulator.scanner_enabled()).await;

    client.scanner().disable();
    eventually("disabled", || !emulator.scanner_enabled()).await;

    assert!(!emulator.trigger_scan("4006381333931", Symbology::Ean13));
    assert!(!client.scanner().is_enabled());
    client.disconnect().await;
    emulator.shutdown().await.unwrap();
}

// ── Payment ───────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_chip_payment_is_approved() {
    // Arrange
    let (emulator, client) =
        connected_pair(emulator_config("chip", false, Duration::from_millis(10))).await;
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    let _sub = client.payment().on_state_change(move |state| sink.lock().push(*state));

    // Act
    let result = client.payment().collect_amount(1250, "EUR").await.unwrap();

    // Assert
    assert!(result.approved);
    assert_eq!(result.method.as_deref(), Some("chip"));
    assert!(result.transaction_id.is_some());
    assert_eq!(client.payment().state(), PaymentState::Idle);
    let seen = states.lock().clone();
    assert_eq!(seen.first(), Some(&PaymentState::CardPresented));
    assert!(seen.contains(&PaymentState::PinEntry));
    assert!(seen.contains(&PaymentState::Approved));
    assert_eq!(seen.last(), Some(&PaymentState::Idle));

    client.disconnect().await;
    emulator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_declined_payment_carries_reason() {
    let (emulator, client) =
        connected_pair(emulator_config("contactless", true, Duration::from_millis(10))).await;

    let result = client.payment().collect_amount(990, "usd").await.unwrap();

    assert!(!result.approved);
    assert_eq!(result.decline_reason.as_deref(), Some("insufficient_funds"));
    assert_eq!(result.error, None);
    client.disconnect().await;
    emulator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_in_flight_payment() {
    // Arrange: slow steps so the attempt is still running when we cancel
    let (emulator, client) =
        connected_pair(emulator_config("chip", false, Duration::from_millis(500))).await;
    let payment = client.payment().clone();
    let request = PaymentRequest::new(5000, "EUR").unwrap();
    let pending = tokio::spawn(async move { payment.collect(request).await });
    eventually("terminal busy", || emulator.payment_state() != PaymentState::Idle).await;

    // Act
    client.payment().cancel().await.unwrap();
    let result = pending.await.unwrap().unwrap();

    // Assert
    assert!(result.is_cancelled());
    assert_eq!(client.payment().state(), PaymentState::Idle);
    eventually("emulator idle", || emulator.payment_state() == PaymentState::Idle).await;

    client.disconnect().await;
    emulator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_collect_while_busy_is_rejected() {
    let (emulator, client) =
        connected_pair(emulator_config("chip", false, Duration::from_millis(500))).await;
    let payment = client.payment().clone();
    let first = tokio::spawn(async move { payment.collect_amount(100, "EUR").await });
    eventually("busy", || client.payment().is_busy()).await;

    let second = client.payment().collect_amount(200, "EUR").await;

    assert!(matches!(second, Err(PaymentError::InvalidState { .. })));
    client.disconnect().await;
    assert_eq!(first.await.unwrap(), Err(PaymentError::Closed));
    emulator.shutdown().await.unwrap();
}
