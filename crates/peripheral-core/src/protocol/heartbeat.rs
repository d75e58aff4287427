//! Heart-beat header parsing and interval negotiation.
//!
//! # How STOMP heart-beats work (for beginners)
//!
//! Each side announces two numbers in its handshake frame, `heart-beat:cx,cy`:
//!
//! - `cx` – the smallest interval (ms) at which *it* can send heart-beats,
//!   or 0 if it cannot send any.
//! - `cy` – the interval (ms) at which it *wants* to receive heart-beats,
//!   or 0 if it does not want any.
//!
//! The client sends heart-beats every `max(client.cx, server.cy)` ms, unless
//! either value is 0.  The client expects something from the server at least
//! every `max(client.cy, server.cx)` ms, unless either value is 0.  A
//! heart-beat is a single end-of-line on the socket.

use std::time::Duration;

use super::frame::FrameError;

/// Multiplier applied to the negotiated receive interval before the peer is
/// considered gone.  Covers scheduling jitter on both ends.
pub const TIMEOUT_TOLERANCE: u32 = 2;

/// One side's `heart-beat` announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    /// `cx`: how often this side can send, in milliseconds.
    pub outgoing_ms: u64,
    /// `cy`: how often this side wants to receive, in milliseconds.
    pub incoming_ms: u64,
}

/// Intervals the client runs with after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NegotiatedHeartBeat {
    /// Send a heart-beat this often, or never when `None`.
    pub send_every: Option<Duration>,
    /// Expect inbound traffic at least this often, or never when `None`.
    pub expect_within: Option<Duration>,
}

impl HeartBeat {
    pub fn new(outgoing_ms: u64, incoming_ms: u64) -> Self {
        Self {
            outgoing_ms,
            incoming_ms,
        }
    }

    /// Parses a `cx,cy` header value.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidHeartBeat`] if the value is not two
    /// comma-separated non-negative integers.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use peripheral_core::HeartBeat;
    ///
    /// let hb = HeartBeat::parse("10000,5000").unwrap();
    /// assert_eq!(hb, HeartBeat::new(10_000, 5_000));
    /// ```
    pub fn parse(value: &str) -> Result<Self, FrameError> {
        let invalid = || FrameError::InvalidHeartBeat(value.to_string());
        let (cx, cy) = value.split_once(',').ok_or_else(invalid)?;
        let outgoing_ms = cx.trim().parse().map_err(|_| invalid())?;
        let incoming_ms = cy.trim().parse().map_err(|_| invalid())?;
        Ok(Self {
            outgoing_ms,
            incoming_ms,
        })
    }

    /// Formats the announcement as a header value.
    pub fn to_header_value(self) -> String {
        format!("{},{}", self.outgoing_ms, self.incoming_ms)
    }

    /// Negotiates the client's intervals against the server's announcement.
    ///
    /// `self` is the client side.
    pub fn negotiate(self, server: HeartBeat) -> NegotiatedHeartBeat {
        NegotiatedHeartBeat {
            send_every: pick(self.outgoing_ms, server.incoming_ms),
            expect_within: pick(self.incoming_ms, server.outgoing_ms),
        }
    }
}

impl NegotiatedHeartBeat {
    /// How long to wait for inbound traffic before treating the connection
    /// as closed.
    pub fn read_timeout(&self) -> Option<Duration> {
        self.expect_within.map(|d| d * TIMEOUT_TOLERANCE)
    }
}

fn pick(ours: u64, theirs: u64) -> Option<Duration> {
    if ours == 0 || theirs == 0 {
        None
    } else {
        Some(Duration::from_millis(ours.max(theirs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_spaces_around_numbers() {
        assert_eq!(HeartBeat::parse(" 0 , 250 ").unwrap(), HeartBeat::new(0, 250));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(HeartBeat::parse("10000").is_err());
        assert!(HeartBeat::parse("a,b").is_err());
        assert!(HeartBeat::parse("-1,0").is_err());
    }

    #[test]
    fn test_to_header_value_formats_cx_cy() {
        assert_eq!(HeartBeat::new(10_000, 0).to_header_value(), "10000,0");
    }

    #[test]
    fn test_negotiate_takes_the_larger_interval_in_each_direction() {
        // Arrange
        let client = HeartBeat::new(10_000, 10_000);
        let server = HeartBeat::new(5_000, 20_000);

        // Act
        let negotiated = client.negotiate(server);

        // Assert
        assert_eq!(negotiated.send_every, Some(Duration::from_millis(20_000)));
        assert_eq!(negotiated.expect_within, Some(Duration::from_millis(10_000)));
    }

    #[test]
    fn test_negotiate_zero_on_either_side_disables_that_direction() {
        let client = HeartBeat::new(10_000, 10_000);

        let negotiated = client.negotiate(HeartBeat::new(0, 0));

        assert_eq!(negotiated, NegotiatedHeartBeat::default());
    }

    #[test]
    fn test_negotiate_client_that_cannot_send_never_sends() {
        let negotiated = HeartBeat::new(0, 1_000).negotiate(HeartBeat::new(1_000, 1_000));
        assert_eq!(negotiated.send_every, None);
        assert_eq!(negotiated.expect_within, Some(Duration::from_millis(1_000)));
    }

    #[test]
    fn test_read_timeout_applies_tolerance() {
        let negotiated = NegotiatedHeartBeat {
            send_every: None,
            expect_within: Some(Duration::from_millis(1_500)),
        };
        assert_eq!(negotiated.read_timeout(), Some(Duration::from_millis(3_000)));
    }
}
