//! WebSocket transport.
//!
//! Two endpoint modes share one pump:
//!
//! - SockJS: the broker URL is an `http(s)` SockJS endpoint. The raw
//!   websocket lives at `<endpoint>/websocket`, so `http://host/ws` maps to
//!   `ws://host/ws/websocket`.
//! - Direct: the URL already names the websocket endpoint; only the scheme
//!   is normalised.
//!
//! The query string (the `user` identity) is carried over unchanged.
//!
//! Natively the pump runs on `tokio-tungstenite`; in the browser on
//! `gloo-net`.

#[cfg(test)]
#[path = "websocket_test.rs"]
mod websocket_test;

use futures::channel::mpsc;
use url::Url;

use super::runtime;
use super::transport::{Socket, SocketEvent, Transport};
use crate::error::TransportError;

/// How the broker URL maps to a websocket endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointMode {
    SockJs,
    Direct,
}

/// Transport over a real websocket.
#[derive(Clone, Copy, Debug)]
pub struct WebSocketTransport {
    mode: EndpointMode,
}

impl WebSocketTransport {
    /// Raw websocket behind a SockJS endpoint.
    #[must_use]
    pub fn sockjs() -> Self {
        Self { mode: EndpointMode::SockJs }
    }

    /// Plain websocket endpoint.
    #[must_use]
    pub fn direct() -> Self {
        Self { mode: EndpointMode::Direct }
    }

    #[must_use]
    pub fn mode(&self) -> EndpointMode {
        self.mode
    }
}

impl Transport for WebSocketTransport {
    fn open(&self, url: &Url) -> Result<Socket, TransportError> {
        let endpoint = websocket_endpoint(url, self.mode)?;
        let (out_tx, out_rx) = mpsc::unbounded::<String>();
        let (in_tx, in_rx) = mpsc::unbounded::<SocketEvent>();
        tracing::debug!(endpoint = %endpoint, "opening websocket");
        runtime::spawn(pump(endpoint, out_rx, in_tx));
        Ok(Socket { outgoing: out_tx, incoming: in_rx })
    }

    fn name(&self) -> &'static str {
        match self.mode {
            EndpointMode::SockJs => "sockjs-websocket",
            EndpointMode::Direct => "websocket",
        }
    }
}

/// Map a broker URL to the websocket URL for `mode`.
///
/// # Errors
///
/// Returns [`TransportError::InvalidUrl`] for schemes other than
/// `http`, `https`, `ws`, `wss`.
pub fn websocket_endpoint(url: &Url, mode: EndpointMode) -> Result<Url, TransportError> {
    let invalid = |reason: &str| TransportError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_owned(),
    };
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(invalid("unsupported scheme")),
    };

    let mut endpoint = url.clone();
    endpoint
        .set_scheme(scheme)
        .map_err(|()| invalid("scheme cannot be changed"))?;
    if mode == EndpointMode::SockJs {
        let path = endpoint.path().trim_end_matches('/').to_owned();
        endpoint.set_path(&format!("{path}/websocket"));
    }
    Ok(endpoint)
}

#[cfg(not(target_arch = "wasm32"))]
async fn pump(
    endpoint: Url,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    in_tx: mpsc::UnboundedSender<SocketEvent>,
) {
    use futures::{FutureExt, SinkExt, StreamExt, pin_mut};
    use tokio_tungstenite::tungstenite::Message;

    let connecting = tokio_tungstenite::connect_async(endpoint.as_str()).fuse();
    pin_mut!(connecting);
    let mut pending = Vec::new();
    let ws = loop {
        futures::select! {
            connected = connecting => match connected {
                Ok((ws, _response)) => break ws,
                Err(err) => {
                    let _ = in_tx.unbounded_send(SocketEvent::Error(err.to_string()));
                    return;
                }
            },
            outgoing = out_rx.next() => match outgoing {
                Some(text) => pending.push(text),
                None => {
                    tracing::debug!(%endpoint, "websocket open abandoned");
                    return;
                }
            },
        }
    };
    if in_tx.unbounded_send(SocketEvent::Open).is_err() {
        return;
    }

    let (mut write, read) = ws.split();
    let mut read = read.fuse();
    for text in pending {
        if let Err(err) = write.send(Message::Text(text.into())).await {
            let _ = in_tx.unbounded_send(SocketEvent::Error(err.to_string()));
            return;
        }
    }

    loop {
        futures::select! {
            outgoing = out_rx.next() => match outgoing {
                Some(text) => {
                    if let Err(err) = write.send(Message::Text(text.into())).await {
                        let _ = in_tx.unbounded_send(SocketEvent::Error(err.to_string()));
                        break;
                    }
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    let _ = write.close().await;
                    break;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = in_tx.unbounded_send(SocketEvent::Text(text.as_str().to_owned()));
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => {
                        let _ = in_tx.unbounded_send(SocketEvent::Text(text));
                    }
                    Err(_) => tracing::warn!("dropping non-utf8 binary websocket message"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame.map_or((1005, String::new()), |frame| {
                        (u16::from(frame.code), frame.reason.as_str().to_owned())
                    });
                    let _ = in_tx.unbounded_send(SocketEvent::Closed { code, reason });
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let _ = in_tx.unbounded_send(SocketEvent::Error(err.to_string()));
                    break;
                }
                None => {
                    let _ = in_tx.unbounded_send(SocketEvent::Closed {
                        code: 1006,
                        reason: "connection lost".to_owned(),
                    });
                    break;
                }
            },
        }
    }
}

#[cfg(target_arch = "wasm32")]
async fn pump(
    endpoint: Url,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    in_tx: mpsc::UnboundedSender<SocketEvent>,
) {
    use futures::{SinkExt, StreamExt};
    use gloo_net::websocket::futures::WebSocket;
    use gloo_net::websocket::{Message, WebSocketError};

    let ws = match WebSocket::open(endpoint.as_str()) {
        Ok(ws) => ws,
        Err(err) => {
            let _ = in_tx.unbounded_send(SocketEvent::Error(err.to_string()));
            return;
        }
    };
    // gloo-net holds writes until the socket is open; a failed open shows up on the read side.
    if in_tx.unbounded_send(SocketEvent::Open).is_err() {
        return;
    }

    let (mut write, read) = ws.split();
    let mut read = read.fuse();

    loop {
        futures::select! {
            outgoing = out_rx.next() => match outgoing {
                Some(text) => {
                    if let Err(err) = write.send(Message::Text(text)).await {
                        let _ = in_tx.unbounded_send(SocketEvent::Error(err.to_string()));
                        break;
                    }
                }
                None => {
                    let _ = write.close().await;
                    break;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = in_tx.unbounded_send(SocketEvent::Text(text));
                }
                Some(Ok(Message::Bytes(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        let _ = in_tx.unbounded_send(SocketEvent::Text(text));
                    }
                    Err(_) => tracing::warn!("dropping non-utf8 binary websocket message"),
                },
                Some(Err(WebSocketError::ConnectionClose(event))) => {
                    let _ = in_tx.unbounded_send(SocketEvent::Closed {
                        code: event.code,
                        reason: event.reason,
                    });
                    break;
                }
                Some(Err(err)) => {
                    let _ = in_tx.unbounded_send(SocketEvent::Error(err.to_string()));
                    break;
                }
                None => {
                    let _ = in_tx.unbounded_send(SocketEvent::Closed {
                        code: 1006,
                        reason: "connection lost".to_owned(),
                    });
                    break;
                }
            },
        }
    }
}
