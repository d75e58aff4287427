//! Integration tests for peripheral-core.
//!
//! These tests push real bridge traffic through the public API: wire text is
//! decoded into frames, frame bodies are parsed as JSON, and the JSON is
//! normalized into the typed domain messages.

use chrono::Utc;
use peripheral_core::protocol::destinations;
use peripheral_core::{
    decode_frames, encode_frame, CapabilitiesMessage, CapabilitySnapshot, Command, Frame,
    HeartBeat, Inbound, PaymentEvent, PaymentState, ScannerMessage, SequenceCounter, Symbology,
};
use serde_json::Value;

/// Decodes wire text that must contain exactly one frame.
fn only_frame(text: &str) -> Frame {
    let units = decode_frames(text).expect("decode must succeed");
    let frames: Vec<Frame> = units
        .into_iter()
        .filter_map(|u| match u {
            Inbound::Frame(f) => Some(f),
            Inbound::Heartbeat => None,
        })
        .collect();
    assert_eq!(frames.len(), 1, "expected one frame");
    frames.into_iter().next().expect("one frame")
}

fn body_json(frame: &Frame) -> Value {
    serde_json::from_str(&frame.body).expect("body must be JSON")
}

#[test]
fn test_handshake_frames_negotiate_heartbeats() {
    // Arrange: the client CONNECT and the bridge CONNECTED
    let client_hb = HeartBeat::new(10_000, 10_000);
    let connect = Frame::new(Command::Connect)
        .header("accept-version", "1.2")
        .header("host", "localhost")
        .header("heart-beat", client_hb.to_header_value());
    let connected = only_frame("CONNECTED\nversion:1.2\nheart-beat:0,0\n\n\0");

    // Act
    let sent = only_frame(&encode_frame(&connect));
    let server_hb = HeartBeat::parse(connected.get("heart-beat").unwrap()).unwrap();
    let negotiated = client_hb.negotiate(server_hb);

    // Assert
    assert_eq!(sent.get("accept-version"), Some("1.2"));
    assert_eq!(negotiated.send_every, None);
    assert_eq!(negotiated.expect_within, None);
}

#[test]
fn test_capabilities_message_frame_to_snapshot() {
    let text = concat!(
        "MESSAGE\n",
        "subscription:sub-0\n",
        "message-id:msg-1\n",
        "destination:/topic/capabilities\n",
        "content-type:application/json\n",
        "\n",
        r#"{"type":"capabilities","timestamp":"2024-03-01T10:00:00Z","deviceId":"emulator-001","capabilities":{"scanner":{"available":true,"mode":"bridge","symbologies":["ean13","upc-a","qr","pdf417"]},"payment":{"available":true,"methods":["chip","contactless","swipe"],"cashback":true}}}"#,
        "\0"
    );

    let frame = only_frame(text);
    let message = CapabilitiesMessage::from_json(&body_json(&frame)).unwrap();
    let snapshot = CapabilitySnapshot::from_message(message, Utc::now());

    assert_eq!(frame.destination(), Some(destinations::CAPABILITIES));
    assert_eq!(snapshot.device_id, "emulator-001");
    assert!(snapshot.supports_symbology(&Symbology::Pdf417));
    assert!(snapshot.supports_method("swipe"));
}

#[test]
fn test_batched_scan_messages_keep_order() {
    // Arrange: two scans and a heart-beat in one WebSocket message
    let scan = |code: &str| {
        encode_frame(
            &Frame::new(Command::Message)
                .header("destination", destinations::SCANNER_EVENTS)
                .with_body(format!(r#"{{"event":"scan","barcode":"{code}","symbology":"qr"}}"#)),
        )
    };
    let text = format!("{}\n{}", scan("first"), scan("second"));

    // Act
    let barcodes: Vec<String> = decode_frames(&text)
        .unwrap()
        .into_iter()
        .filter_map(|u| match u {
            Inbound::Frame(f) => Some(f),
            Inbound::Heartbeat => None,
        })
        .map(|f| match ScannerMessage::from_json(&body_json(&f), Utc::now()).unwrap() {
            ScannerMessage::Scan(s) => s.barcode,
            ScannerMessage::Status { .. } => panic!("expected scans"),
        })
        .collect();

    // Assert
    assert_eq!(barcodes, vec!["first", "second"]);
}

#[test]
fn test_payment_flow_events_follow_state_rules() {
    let states = ["card_presented", "reading_card", "pin_required", "pin_entry", "authorizing", "approved"];
    let mut current = PaymentState::Idle;

    for name in states {
        let frame = only_frame(&encode_frame(
            &Frame::new(Command::Message)
                .header("destination", destinations::PAYMENT_EVENTS)
                .with_body(format!(r#"{{"type":"state_change","state":"{name}"}}"#)),
        ));
        let PaymentEvent::StateChange { state, .. } = PaymentEvent::from_json(&body_json(&frame)).unwrap() else {
            panic!("expected a state change");
        };
        assert!(current.can_transition_to(state), "{current} -> {state}");
        current = state;
    }

    assert!(current.is_terminal());
}

#[test]
fn test_subscription_ids_are_distinct_per_topic() {
    let counter = SequenceCounter::new();
    let frames: Vec<Frame> = destinations::EVENT_TOPICS
        .iter()
        .map(|topic| {
            Frame::new(Command::Subscribe)
                .header("id", counter.next_id("sub"))
                .header("destination", *topic)
        })
        .collect();

    let ids: Vec<&str> = frames.iter().filter_map(|f| f.get("id")).collect();
    assert_eq!(ids, vec!["sub-0", "sub-1", "sub-2"]);
}
