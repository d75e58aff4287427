//! Errors raised while handling a client command.

use peripheral_core::{PaymentState, RequestError};
use thiserror::Error;

/// Why a SEND could not be acted on.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no handler for destination {0}")]
    UnknownDestination(String),

    #[error("malformed command body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid payment request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error("collect command without a request")]
    MissingRequest,

    #[error("terminal busy in state {0}")]
    Busy(PaymentState),
}
