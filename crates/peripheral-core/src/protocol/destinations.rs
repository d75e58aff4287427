//! Bus destinations shared by the client and the bridge.
//!
//! Inbound event topics live under `/topic/`; outbound command destinations
//! live under `/app/<domain>/<action>`.

/// Device capability announcements.
pub const CAPABILITIES: &str = "/topic/capabilities";
/// Scanner events: scans and enable/disable confirmations.
pub const SCANNER_EVENTS: &str = "/topic/scanner/events";
/// Payment terminal state changes and results.
pub const PAYMENT_EVENTS: &str = "/topic/payment/events";

pub const SCANNER_ENABLE: &str = "/app/scanner/enable";
pub const SCANNER_DISABLE: &str = "/app/scanner/disable";
pub const PAYMENT_COLLECT: &str = "/app/payment/collect";
pub const PAYMENT_CANCEL: &str = "/app/payment/cancel";

/// Every topic a full client subscribes to.
pub const EVENT_TOPICS: [&str; 3] = [CAPABILITIES, SCANNER_EVENTS, PAYMENT_EVENTS];
