//! Socket factory seam between the connection manager and the network.
//!
//! A [`Socket`] is a pair of channels: text frames go out through
//! `outgoing`, lifecycle events and text frames come back on `incoming`.
//! Dropping every clone of `outgoing` closes the socket.
//!
//! SYSTEM CONTEXT
//! ==============
//! `websocket` implements this trait on real sockets, `FallbackTransport`
//! chains several implementations, and the test broker implements it in
//! memory.

#[cfg(test)]
#[path = "transport_test.rs"]
mod transport_test;

use std::sync::Arc;

use futures::channel::mpsc;
use futures::{FutureExt, StreamExt, future, pin_mut};
use url::Url;

use super::runtime;
use crate::error::TransportError;

/// Event reported by an open socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketEvent {
    /// The socket is usable. Always the first event on success.
    Open,
    /// One text message.
    Text(String),
    /// The peer or the network closed the socket.
    Closed { code: u16, reason: String },
    /// The socket failed to open or errored while open.
    Error(String),
}

/// Channel pair for one socket.
pub struct Socket {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<SocketEvent>,
}

/// Opens sockets to a broker endpoint.
pub trait Transport: Send + Sync {
    /// Start opening a socket to `url`.
    ///
    /// Returns immediately; the outcome arrives as the first event on
    /// `incoming`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when `url` cannot be mapped to an endpoint.
    fn open(&self, url: &Url) -> Result<Socket, TransportError>;

    /// Short name for logs.
    fn name(&self) -> &'static str {
        "transport"
    }
}

/// Tries each candidate transport in order until one opens.
///
/// Dropping the returned socket's `outgoing` while a candidate is still
/// opening closes that candidate and stops the search.
#[derive(Clone)]
pub struct FallbackTransport {
    candidates: Vec<Arc<dyn Transport>>,
}

impl FallbackTransport {
    #[must_use]
    pub fn new(candidates: Vec<Arc<dyn Transport>>) -> Self {
        Self { candidates }
    }
}

impl Transport for FallbackTransport {
    fn open(&self, url: &Url) -> Result<Socket, TransportError> {
        let (out_tx, out_rx) = mpsc::unbounded::<String>();
        let (in_tx, in_rx) = mpsc::unbounded::<SocketEvent>();
        runtime::spawn(run_fallback(self.candidates.clone(), url.clone(), out_rx, in_tx));
        Ok(Socket { outgoing: out_tx, incoming: in_rx })
    }

    fn name(&self) -> &'static str {
        "fallback"
    }
}

async fn run_fallback(
    candidates: Vec<Arc<dyn Transport>>,
    url: Url,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    in_tx: mpsc::UnboundedSender<SocketEvent>,
) {
    let mut last_error = "no transports configured".to_owned();
    let mut pending = Vec::new();

    for candidate in candidates {
        let mut socket = match candidate.open(&url) {
            Ok(socket) => socket,
            Err(err) => {
                tracing::debug!(transport = candidate.name(), %err, "fallback candidate rejected url");
                last_error = err.to_string();
                continue;
            }
        };

        // The caller may give up on the attempt while a candidate is still opening.
        let first = {
            let opened = socket.incoming.next().fuse();
            pin_mut!(opened);
            loop {
                futures::select! {
                    event = opened => break Some(event),
                    outgoing = out_rx.next() => match outgoing {
                        Some(text) => pending.push(text),
                        None => break None,
                    },
                }
            }
        };
        let Some(first) = first else {
            tracing::debug!(transport = candidate.name(), "fallback attempt abandoned before open");
            return;
        };

        match first {
            Some(SocketEvent::Open) => {
                tracing::debug!(transport = candidate.name(), "fallback candidate opened");
                if in_tx.unbounded_send(SocketEvent::Open).is_err() {
                    return;
                }
                for text in pending.drain(..) {
                    if socket.outgoing.unbounded_send(text).is_err() {
                        break;
                    }
                }
                let upstream = out_rx.map(Ok::<_, mpsc::SendError>).forward(socket.outgoing);
                let downstream = socket.incoming.map(Ok::<_, mpsc::SendError>).forward(in_tx);
                future::select(Box::pin(upstream), Box::pin(downstream)).await;
                return;
            }
            Some(SocketEvent::Error(reason) | SocketEvent::Closed { reason, .. }) => {
                tracing::debug!(transport = candidate.name(), %reason, "fallback candidate failed");
                last_error = reason;
            }
            Some(SocketEvent::Text(_)) => {
                last_error = format!("{} sent data before opening", candidate.name());
            }
            None => {
                last_error = format!("{} closed before opening", candidate.name());
            }
        }
    }

    let _ = in_tx.unbounded_send(SocketEvent::Error(last_error));
}
