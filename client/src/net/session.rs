//! Driver task for one connection attempt and, if it succeeds, its session.
//!
//! The driver owns the read side of the socket. It waits for the socket to
//! open, sends `CONNECT`, and races the handshake against the connect timeout
//! and the manager's shutdown switch. Once connected it dispatches `MESSAGE`
//! frames, emits heart-beats, and watches for broker silence until the
//! socket ends or the manager shuts it down.

use std::collections::VecDeque;
use std::time::Duration;

use frames::{Command, Frame, FrameDecoder, HeartBeat, Inbound, encode_frame, encode_heart_beat, header};
use futures::channel::mpsc;
use futures::{FutureExt, StreamExt, future, pin_mut, select};

use super::connection::{self, Launch};
use super::runtime;
use super::transport::SocketEvent;
use super::types::{Handshake, Payload};
use crate::error::{ClientError, TransportError};

/// Socket events decoded into frames.
struct FrameReader {
    incoming: mpsc::UnboundedReceiver<SocketEvent>,
    decoder: FrameDecoder,
    pending: VecDeque<Inbound>,
    url: String,
    opened: bool,
}

enum ReadEvent {
    Open,
    Inbound(Inbound),
    Failed(ClientError),
}

impl FrameReader {
    fn new(incoming: mpsc::UnboundedReceiver<SocketEvent>, url: String) -> Self {
        Self {
            incoming,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
            url,
            opened: false,
        }
    }

    async fn next(&mut self) -> ReadEvent {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return ReadEvent::Inbound(item);
            }
            let error = match self.incoming.next().await {
                Some(SocketEvent::Open) => {
                    self.opened = true;
                    return ReadEvent::Open;
                }
                Some(SocketEvent::Text(text)) => match self.decoder.push(&text) {
                    Ok(items) => {
                        self.pending.extend(items);
                        continue;
                    }
                    Err(err) => ClientError::from(err),
                },
                Some(SocketEvent::Closed { code, reason }) => {
                    TransportError::Closed { code, reason }.into()
                }
                Some(SocketEvent::Error(reason)) if !self.opened => TransportError::Open {
                    url: self.url.clone(),
                    reason,
                }
                .into(),
                Some(SocketEvent::Error(reason)) => TransportError::Io(reason).into(),
                None => TransportError::Closed {
                    code: 1006,
                    reason: "transport ended".to_owned(),
                }
                .into(),
            };
            return ReadEvent::Failed(error);
        }
    }
}

enum HandshakeOutcome {
    Connected(Handshake),
    Failed(ClientError),
    Shutdown,
}

/// Run one attempt to completion.
pub(crate) async fn drive(launch: Launch) {
    let Launch { shared, id, host, url, socket, shutdown } = launch;
    let outgoing = socket.outgoing;
    let mut reader = FrameReader::new(socket.incoming, url.to_string());
    let mut shutdown = shutdown.fuse();
    let client_heart_beat = shared.config.heart_beat();

    let outcome = {
        let handshaking = handshake(
            &mut reader,
            &outgoing,
            &host,
            client_heart_beat,
            shared.config.connect_timeout(),
        )
        .fuse();
        pin_mut!(handshaking);
        select! {
            outcome = handshaking => outcome,
            _ = shutdown => HandshakeOutcome::Shutdown,
        }
    };

    let handshake = match outcome {
        HandshakeOutcome::Connected(handshake) => handshake,
        HandshakeOutcome::Failed(error) => {
            connection::fail_attempt(&shared, id, error);
            return;
        }
        HandshakeOutcome::Shutdown => {
            tracing::debug!(attempt = id, "attempt shut down before handshake");
            return;
        }
    };
    if !connection::complete_attempt(&shared, id, &handshake) {
        return;
    }

    let (send_every, expect_every) = HeartBeat::negotiate(client_heart_beat, handshake.heart_beat);
    tracing::debug!(session = id, ?send_every, ?expect_every, "heart-beats negotiated");
    let silence_limit = expect_every.map(|every| every * 2);

    let mut ping = Box::pin(idle(send_every).fuse());
    let mut watchdog = Box::pin(idle(silence_limit).fuse());

    let error = loop {
        let next = reader.next().fuse();
        pin_mut!(next);
        select! {
            event = next => {
                watchdog.set(idle(silence_limit).fuse());
                match event {
                    ReadEvent::Inbound(Inbound::Frame(frame)) => {
                        if let Some(error) = dispatch(&shared, id, frame) {
                            break error;
                        }
                    }
                    ReadEvent::Inbound(Inbound::HeartBeat) => {
                        tracing::trace!(session = id, "heart-beat received");
                    }
                    ReadEvent::Open => {}
                    ReadEvent::Failed(error) => break error,
                }
            },
            () = ping => {
                if outgoing.unbounded_send(encode_heart_beat()).is_err() {
                    break TransportError::Io("socket writer closed".to_owned()).into();
                }
                tracing::trace!(session = id, "heart-beat sent");
                ping.set(idle(send_every).fuse());
            },
            () = watchdog => {
                let limit_ms = silence_limit.map_or(0, |limit| limit.as_millis());
                break TransportError::Io(format!("no data from broker for {limit_ms}ms")).into();
            },
            _ = shutdown => {
                tracing::debug!(session = id, "session shut down");
                return;
            },
        }
    };

    drop(outgoing);
    connection::session_dropped(&shared, id, &error);
}

/// Wait for the socket, send `CONNECT`, and read until `CONNECTED` or `ERROR`.
async fn handshake(
    reader: &mut FrameReader,
    outgoing: &mpsc::UnboundedSender<String>,
    host: &str,
    heart_beat: HeartBeat,
    timeout: Duration,
) -> HandshakeOutcome {
    let timer = runtime::sleep(timeout).fuse();
    pin_mut!(timer);

    loop {
        let next = reader.next().fuse();
        pin_mut!(next);
        let event = select! {
            event = next => event,
            () = timer => {
                let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                return HandshakeOutcome::Failed(ClientError::ConnectionTimeout(ms));
            },
        };

        match event {
            ReadEvent::Open => {
                let connect = encode_frame(&Frame::connect(host, heart_beat));
                if outgoing.unbounded_send(connect).is_err() {
                    return HandshakeOutcome::Failed(
                        TransportError::Io("socket writer closed".to_owned()).into(),
                    );
                }
            }
            ReadEvent::Inbound(Inbound::Frame(frame)) => match frame.command {
                Command::Connected => return HandshakeOutcome::Connected(Handshake::from_frame(&frame)),
                Command::Error => return HandshakeOutcome::Failed(protocol_error(&frame)),
                other => tracing::debug!(command = %other, "ignoring frame before CONNECTED"),
            },
            ReadEvent::Inbound(Inbound::HeartBeat) => {}
            ReadEvent::Failed(error) => return HandshakeOutcome::Failed(error),
        }
    }
}

/// Handle one frame on an established session. Returns the error that ends it, if any.
fn dispatch(shared: &connection::Shared, id: u64, frame: Frame) -> Option<ClientError> {
    match frame.command {
        Command::Message => {
            let Some(subscription) = frame.header(header::SUBSCRIPTION) else {
                tracing::warn!(session = id, "MESSAGE without subscription header");
                return None;
            };
            let Some((destination, handler)) = connection::route_message(shared, subscription) else {
                tracing::debug!(session = id, subscription, "MESSAGE for inactive subscription");
                return None;
            };
            let destination = frame
                .header(header::DESTINATION)
                .map_or(destination, str::to_owned);
            tracing::debug!(session = id, %destination, bytes = frame.body.len(), "message");
            handler(Payload::decode(&destination, &frame.body));
            None
        }
        Command::Error => {
            let error = protocol_error(&frame);
            tracing::warn!(session = id, %error, detail = %frame.body, "broker error");
            Some(error)
        }
        Command::Receipt => {
            tracing::debug!(session = id, receipt = frame.header(header::RECEIPT_ID).unwrap_or_default(), "receipt");
            None
        }
        other => {
            tracing::debug!(session = id, command = %other, "ignoring frame");
            None
        }
    }
}

fn protocol_error(frame: &Frame) -> ClientError {
    ClientError::Protocol {
        message: frame
            .header(header::MESSAGE)
            .unwrap_or("broker error")
            .to_owned(),
        detail: frame.body.clone(),
    }
}

/// Sleep for `duration`, or forever when `None`.
async fn idle(duration: Option<Duration>) {
    match duration {
        Some(duration) => runtime::sleep(duration).await,
        None => future::pending::<()>().await,
    }
}
