//! In-memory STOMP broker implementing [`Transport`] for tests.
//!
//! Routes the dashboard's `/app/...` destinations the way the real broker
//! does (private queue by `user`, rooms, presence, service updates) and
//! records every frame it receives.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use frames::{Command, Frame, FrameDecoder, HeartBeat, Inbound, encode_frame, header};
use futures::StreamExt;
use futures::channel::mpsc;
use serde_json::{Value, json};
use url::Url;

use super::transport::{Socket, SocketEvent, Transport};
use super::types::destinations;
use crate::error::TransportError;

pub(crate) const TIMESTAMP: i64 = 1_700_000_000_000;

/// How the broker answers `CONNECT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BrokerMode {
    Accept,
    /// `ERROR` with `message:Access denied`, then close.
    Reject,
    /// Socket opens, `CONNECT` is never answered.
    Silent,
    /// Socket never opens.
    Refuse,
}

#[derive(Clone)]
pub(crate) struct TestBroker {
    state: Arc<Mutex<BrokerState>>,
}

struct BrokerState {
    mode: BrokerMode,
    heart_beat: HeartBeat,
    sessions: Vec<BrokerSession>,
    urls: Vec<Url>,
    received: Vec<Frame>,
    heart_beats: usize,
    next_message_id: u64,
}

struct BrokerSession {
    user: String,
    to_client: Option<mpsc::UnboundedSender<SocketEvent>>,
    subscriptions: Vec<(String, String)>,
}

/// Let spawned tasks run until they are all waiting.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Transport whose sockets never open on their own.
///
/// Keeps the far end of every socket so a test can fail it later and check
/// whether the client side hung up.
#[derive(Clone, Default)]
pub(crate) struct StalledTransport {
    ends: Arc<Mutex<Vec<mpsc::UnboundedSender<SocketEvent>>>>,
}

impl StalledTransport {
    pub fn opens(&self) -> usize {
        self.ends.lock().expect("stalled lock").len()
    }

    /// Whether the client dropped socket `index`.
    pub fn is_closed(&self, index: usize) -> bool {
        self.ends
            .lock()
            .expect("stalled lock")
            .get(index)
            .is_some_and(mpsc::UnboundedSender::is_closed)
    }

    /// Report a late open failure on socket `index`.
    pub fn fail(&self, index: usize, reason: &str) {
        if let Some(to_client) = self.ends.lock().expect("stalled lock").get(index) {
            let _ = to_client.unbounded_send(SocketEvent::Error(reason.to_owned()));
        }
    }
}

impl Transport for StalledTransport {
    fn open(&self, _url: &Url) -> Result<Socket, TransportError> {
        let (out_tx, _out_rx) = mpsc::unbounded::<String>();
        let (in_tx, in_rx) = mpsc::unbounded::<SocketEvent>();
        self.ends.lock().expect("stalled lock").push(in_tx);
        Ok(Socket { outgoing: out_tx, incoming: in_rx })
    }

    fn name(&self) -> &'static str {
        "stalled"
    }
}

impl TestBroker {
    pub fn new() -> Self {
        Self::with_mode(BrokerMode::Accept)
    }

    pub fn with_mode(mode: BrokerMode) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                mode,
                heart_beat: HeartBeat::DISABLED,
                sessions: Vec::new(),
                urls: Vec::new(),
                received: Vec::new(),
                heart_beats: 0,
                next_message_id: 0,
            })),
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    pub fn set_mode(&self, mode: BrokerMode) {
        self.lock().mode = mode;
    }

    /// `heart-beat` header advertised in `CONNECTED`.
    pub fn set_heart_beat(&self, heart_beat: HeartBeat) {
        self.lock().heart_beat = heart_beat;
    }

    pub fn opens(&self) -> usize {
        self.lock().urls.len()
    }

    pub fn last_url(&self) -> Option<Url> {
        self.lock().urls.last().cloned()
    }

    /// Sessions whose client side has not closed its socket.
    pub fn live_sessions(&self) -> usize {
        self.lock()
            .sessions
            .iter()
            .filter(|session| session.to_client.is_some())
            .count()
    }

    pub fn received(&self, command: Command) -> Vec<Frame> {
        self.lock()
            .received
            .iter()
            .filter(|frame| frame.command == command)
            .cloned()
            .collect()
    }

    pub fn heart_beats(&self) -> usize {
        self.lock().heart_beats
    }

    /// Deliver `body` verbatim to every subscriber of `destination`.
    pub fn publish_raw(&self, destination: &str, body: &str) {
        self.lock().deliver(|_| true, destination, body);
    }

    pub fn send_error(&self, message: &str) {
        let frame = Frame::new(Command::Error)
            .with_header(header::MESSAGE, message)
            .with_body("broker shutting down session");
        let state = self.lock();
        for session in &state.sessions {
            if let Some(to_client) = &session.to_client {
                let _ = to_client.unbounded_send(SocketEvent::Text(encode_frame(&frame)));
            }
        }
    }

    pub fn send_heart_beat(&self) {
        let state = self.lock();
        for session in &state.sessions {
            if let Some(to_client) = &session.to_client {
                let _ = to_client.unbounded_send(SocketEvent::Text("\n".to_owned()));
            }
        }
    }

    /// Close every socket from the broker side.
    pub fn drop_sessions(&self) {
        let mut state = self.lock();
        for session in &mut state.sessions {
            if let Some(to_client) = session.to_client.take() {
                let _ = to_client.unbounded_send(SocketEvent::Closed {
                    code: 1006,
                    reason: "broker restarted".to_owned(),
                });
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().expect("broker lock")
    }
}

impl Transport for TestBroker {
    fn open(&self, url: &Url) -> Result<Socket, TransportError> {
        let (out_tx, out_rx) = mpsc::unbounded::<String>();
        let (in_tx, in_rx) = mpsc::unbounded::<SocketEvent>();
        let mut state = self.lock();
        state.urls.push(url.clone());

        if state.mode == BrokerMode::Refuse {
            let _ = in_tx.unbounded_send(SocketEvent::Error("connection refused".to_owned()));
            return Ok(Socket { outgoing: out_tx, incoming: in_rx });
        }

        let user = url
            .query_pairs()
            .find(|(key, _)| key == "user")
            .map(|(_, value)| value.into_owned())
            .unwrap_or_default();
        let _ = in_tx.unbounded_send(SocketEvent::Open);
        let index = state.sessions.len();
        state.sessions.push(BrokerSession {
            user,
            to_client: Some(in_tx),
            subscriptions: Vec::new(),
        });
        drop(state);

        tokio::spawn(serve(Arc::clone(&self.state), index, out_rx));
        Ok(Socket { outgoing: out_tx, incoming: in_rx })
    }

    fn name(&self) -> &'static str {
        "test-broker"
    }
}

async fn serve(
    state: Arc<Mutex<BrokerState>>,
    index: usize,
    mut from_client: mpsc::UnboundedReceiver<String>,
) {
    let mut decoder = FrameDecoder::new();
    while let Some(text) = from_client.next().await {
        let items = decoder.push(&text).expect("client sent a valid frame");
        let mut state = state.lock().expect("broker lock");
        for item in items {
            match item {
                Inbound::HeartBeat => state.heart_beats += 1,
                Inbound::Frame(frame) => state.handle(index, frame),
            }
        }
    }
    state.lock().expect("broker lock").sessions[index].to_client = None;
}

impl BrokerState {
    fn handle(&mut self, index: usize, frame: Frame) {
        self.received.push(frame.clone());
        match frame.command {
            Command::Connect | Command::Stomp => self.answer_connect(index),
            Command::Subscribe => {
                let id = frame.header(header::ID).unwrap_or_default().to_owned();
                let destination = frame.header(header::DESTINATION).unwrap_or_default().to_owned();
                self.sessions[index].subscriptions.push((id, destination));
            }
            Command::Unsubscribe => {
                let id = frame.header(header::ID).unwrap_or_default();
                self.sessions[index].subscriptions.retain(|(sub_id, _)| sub_id != id);
            }
            Command::Send => self.route(index, &frame),
            _ => {}
        }
    }

    fn answer_connect(&mut self, index: usize) {
        let session = &mut self.sessions[index];
        let reply = match self.mode {
            BrokerMode::Accept => Frame::new(Command::Connected)
                .with_header(header::VERSION, "1.2")
                .with_header(header::SERVER, "test-broker/1.0")
                .with_header(header::SESSION, format!("session-{index}"))
                .with_header(header::USER_NAME, session.user.clone())
                .with_header(header::HEART_BEAT, self.heart_beat.to_string()),
            BrokerMode::Reject => Frame::new(Command::Error)
                .with_header(header::MESSAGE, "Access denied")
                .with_body("bad credentials"),
            BrokerMode::Silent | BrokerMode::Refuse => return,
        };
        let Some(to_client) = &session.to_client else {
            return;
        };
        let _ = to_client.unbounded_send(SocketEvent::Text(encode_frame(&reply)));
        if self.mode == BrokerMode::Reject {
            let _ = to_client.unbounded_send(SocketEvent::Closed {
                code: 1002,
                reason: "Access denied".to_owned(),
            });
            session.to_client = None;
        }
    }

    fn route(&mut self, index: usize, frame: &Frame) {
        let destination = frame.header(header::DESTINATION).unwrap_or_default().to_owned();
        let sender = self.sessions[index].user.clone();
        let Ok(mut body) = serde_json::from_str::<Value>(&frame.body) else {
            self.deliver(|_| true, &destination, &frame.body);
            return;
        };

        if destination == destinations::PRIVATE_SEND {
            body["timestamp"] = json!(TIMESTAMP);
            let receiver = body["receiver"].as_str().unwrap_or_default().to_owned();
            self.deliver(|session| session.user == receiver, destinations::PRIVATE_QUEUE, &body.to_string());
        } else if let Some(room) = destination.strip_prefix("/app/chat.room.") {
            body["timestamp"] = json!(TIMESTAMP);
            body["room"] = json!(room);
            self.deliver(|_| true, &destinations::room_topic(room), &body.to_string());
        } else if let Some(room) = destination.strip_prefix("/app/chat.join.") {
            let announcement = json!({
                "sender": sender,
                "message": format!("{sender} joined the room"),
                "room": room,
                "timestamp": TIMESTAMP,
            });
            self.deliver(|_| true, &destinations::room_topic(room), &announcement.to_string());
        } else if destination == destinations::PRESENCE_UPDATE {
            body["lastSeen"] = json!(TIMESTAMP);
            self.deliver(|_| true, destinations::PRESENCE, &body.to_string());
        } else if destination == destinations::SERVICE_UPDATE_SEND {
            body["timestamp"] = json!(TIMESTAMP);
            self.deliver(|_| true, destinations::SERVICE_UPDATES, &body.to_string());
        } else {
            self.deliver(|_| true, &destination, &frame.body);
        }
    }

    fn deliver(&mut self, target: impl Fn(&BrokerSession) -> bool, destination: &str, body: &str) {
        let mut next_id = self.next_message_id;
        for session in self.sessions.iter().filter(|session| target(session)) {
            let Some(to_client) = &session.to_client else {
                continue;
            };
            for (id, _) in session.subscriptions.iter().filter(|(_, dest)| dest == destination) {
                next_id += 1;
                let message = Frame::new(Command::Message)
                    .with_header(header::SUBSCRIPTION, id.as_str())
                    .with_header(header::MESSAGE_ID, format!("m-{next_id}"))
                    .with_header(header::DESTINATION, destination)
                    .with_body(body);
                let _ = to_client.unbounded_send(SocketEvent::Text(encode_frame(&message)));
            }
        }
        self.next_message_id = next_id;
    }
}
