//! Protocol module containing the STOMP frame codec, heart-beat negotiation,
//! bus destinations, and the id counter.

pub mod destinations;
pub mod frame;
pub mod heartbeat;
pub mod sequence;

pub use frame::{decode_frames, encode_frame, Command, Frame, FrameError, Inbound};
pub use heartbeat::{HeartBeat, NegotiatedHeartBeat};
pub use sequence::SequenceCounter;

/// STOMP protocol version spoken by both ends.
pub const STOMP_VERSION: &str = "1.2";
