//! Connection lifecycle state and its UI projection.

#[cfg(test)]
#[path = "connection_test.rs"]
mod connection_test;

use std::fmt;

/// Broker session lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No session and no attempt in flight.
    #[default]
    Disconnected,
    /// A transport is open (or opening) and the handshake has not finished.
    Connecting,
    /// The broker accepted the session.
    Connected,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a view needs to render connection status.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionView {
    pub connected: bool,
    pub connecting: bool,
    /// Message of the last failed attempt; cleared on success.
    pub error: Option<String>,
}

impl ConnectionView {
    /// Status line shown by status bars and the CLI.
    #[must_use]
    pub fn label(&self) -> String {
        match (&self.error, self.connected, self.connecting) {
            (_, true, _) => "Connected".to_owned(),
            (_, false, true) => "Connecting...".to_owned(),
            (Some(err), false, false) => format!("Disconnected: {err}"),
            (None, false, false) => "Disconnected".to_owned(),
        }
    }
}
