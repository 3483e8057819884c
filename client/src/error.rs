//! Error types for the connection manager and transports.
//!
//! ERROR HANDLING
//! ==============
//! Lifecycle failures reject the pending `connect()` future. Payload parse
//! failures are logged and the raw body is still delivered. Publish and
//! subscribe while not connected are fail-soft (`false` / `None`) and never
//! surface as errors. Both enums are `Clone + PartialEq` so one outcome can
//! be fanned out to every caller waiting on the same attempt.

use crate::state::connection::ConnectionState;

/// Failure of the underlying socket.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The broker URL could not be turned into a socket endpoint.
    #[error("invalid broker url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    /// The socket could not be opened.
    #[error("failed to open {url}: {reason}")]
    Open { url: String, reason: String },
    /// The socket closed.
    #[error("connection closed ({code}): {reason}")]
    Closed { code: u16, reason: String },
    /// Read/write failure on an open socket.
    #[error("transport i/o error: {0}")]
    Io(String),
}

/// Error surfaced by [`crate::ConnectionManager`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// No handshake within the configured connect timeout.
    #[error("connection timeout after {0}ms")]
    ConnectionTimeout(u64),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The broker rejected the session or sent an ERROR frame.
    #[error("broker error: {message}")]
    Protocol { message: String, detail: String },
    /// A message body was not the JSON its destination expects.
    #[error("unparsable message on {destination}: {reason}")]
    MessageParse { destination: String, reason: String },
    /// An operation was attempted in a state that does not allow it.
    #[error("{operation} rejected while {state}")]
    OperationRejected {
        operation: &'static str,
        state: ConnectionState,
    },
    /// The attempt was cancelled locally by `disconnect()`.
    #[error("connection attempt cancelled")]
    Cancelled,
}

impl From<frames::CodecError> for ClientError {
    fn from(err: frames::CodecError) -> Self {
        Self::Protocol {
            message: "malformed frame".to_owned(),
            detail: err.to_string(),
        }
    }
}
