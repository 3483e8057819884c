//! Wire payloads for the broker destinations and REST endpoints.
//!
//! DESIGN
//! ======
//! Subscribers always receive a [`Payload`]: parsed JSON when the body is
//! JSON, the raw text otherwise. Typed views are layered on top through
//! [`InboundMessage::decode`], which falls back to `Opaque` instead of
//! failing, so a schema change on the broker degrades to untyped rendering.

#[cfg(test)]
#[path = "types_test.rs"]
mod types_test;

use std::fmt;

use frames::{Frame, HeartBeat, header};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::ClientError;

/// Destination names used by the dashboard.
pub mod destinations {
    /// Publish: `{sender, receiver, message}`.
    pub const PRIVATE_SEND: &str = "/app/chat.private";
    /// Publish: `{userId, status}`.
    pub const PRESENCE_UPDATE: &str = "/app/presence.update";
    /// Publish: `{carId, sender, message}`.
    pub const SERVICE_UPDATE_SEND: &str = "/app/update";

    pub const NOTIFICATIONS: &str = "/topic/notifications";
    pub const LIVE_DATA: &str = "/topic/live-data";
    pub const PRESENCE: &str = "/topic/presence";
    pub const SERVICE_UPDATES: &str = "/topic/service-updates";
    pub const DEMO_CHAT: &str = "/topic/demo-chat";
    /// Per-user queue; the broker routes it by the session's `user` identity.
    pub const PRIVATE_QUEUE: &str = "/user/queue/messages";

    /// Rooms offered by the dashboard.
    pub const ROOMS: [&str; 3] = ["general", "tech-support", "announcements"];

    const ROOM_TOPIC_PREFIX: &str = "/topic/room.";

    #[must_use]
    pub fn room_send(room: &str) -> String {
        format!("/app/chat.room.{room}")
    }

    #[must_use]
    pub fn room_join(room: &str) -> String {
        format!("/app/chat.join.{room}")
    }

    #[must_use]
    pub fn room_topic(room: &str) -> String {
        format!("{ROOM_TOPIC_PREFIX}{room}")
    }

    /// Room name of a `/topic/room.{room}` destination.
    #[must_use]
    pub fn room_of_topic(destination: &str) -> Option<&str> {
        destination
            .strip_prefix(ROOM_TOPIC_PREFIX)
            .filter(|room| !room.is_empty())
    }
}

// =============================================================
// Payloads
// =============================================================

/// Message body as delivered to a subscription handler.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Json(Value),
    /// Body that is not valid JSON, passed through untouched.
    Raw(String),
}

impl Payload {
    /// Parse a `MESSAGE` body received on `destination`.
    ///
    /// Parse failures are logged as [`ClientError::MessageParse`] and the raw
    /// text is returned instead.
    #[must_use]
    pub fn decode(destination: &str, body: &str) -> Self {
        match serde_json::from_str::<Value>(body) {
            Ok(value) => Self::Json(value),
            Err(err) => {
                let error = ClientError::MessageParse {
                    destination: destination.to_owned(),
                    reason: err.to_string(),
                };
                tracing::warn!(%destination, %error, "delivering raw message body");
                Self::Raw(body.to_owned())
            }
        }
    }

    #[must_use]
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Raw(_) => None,
        }
    }

    /// Deserialize a JSON payload into `T`.
    ///
    /// # Errors
    ///
    /// Fails for raw payloads and for JSON that does not match `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            Self::Json(value) => T::deserialize(value),
            Self::Raw(_) => Err(serde_json::Error::custom("payload is not JSON")),
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(value) => write!(f, "{value}"),
            Self::Raw(text) => f.write_str(text),
        }
    }
}

/// Outbound body. Text goes out verbatim; JSON is serialized.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Text(String),
    Json(Value),
}

impl Body {
    #[must_use]
    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Json(value) => value.to_string(),
        }
    }

    #[must_use]
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Text(_) => "text/plain",
            Self::Json(_) => "application/json",
        }
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// Session details from the broker's `CONNECTED` frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Handshake {
    pub version: String,
    pub server: Option<String>,
    pub session: Option<String>,
    /// Principal the broker attached to the session.
    pub user_name: Option<String>,
    pub heart_beat: HeartBeat,
}

impl Handshake {
    /// Read the handshake headers. Missing `version` means STOMP 1.0.
    #[must_use]
    pub fn from_frame(frame: &Frame) -> Self {
        let heart_beat = frame
            .header(header::HEART_BEAT)
            .and_then(|value| match HeartBeat::parse(value) {
                Ok(hb) => Some(hb),
                Err(err) => {
                    tracing::warn!(%err, "ignoring broker heart-beat header");
                    None
                }
            })
            .unwrap_or_default();
        Self {
            version: frame.header(header::VERSION).unwrap_or("1.0").to_owned(),
            server: frame.header(header::SERVER).map(str::to_owned),
            session: frame.header(header::SESSION).map(str::to_owned),
            user_name: frame.header(header::USER_NAME).map(str::to_owned),
            heart_beat,
        }
    }
}

// =============================================================
// Typed inbound messages
// =============================================================

/// Broker timestamp: epoch millis or an ISO-8601 string.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(i64),
    Text(String),
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Millis(ms) => write!(f, "{ms}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Success,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

/// `/topic/notifications`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    pub title: String,
    pub content: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

/// `/topic/live-data`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveDataMessage {
    /// Stream kind, e.g. `METRICS`.
    pub data_type: String,
    pub source: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

/// `/topic/presence`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    #[serde(alias = "username")]
    pub user_id: String,
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<Timestamp>,
}

/// `/topic/room.{room}` and `/topic/demo-chat`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMessage {
    pub sender: String,
    /// Empty for join announcements that carry only a sender.
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

/// `/user/queue/messages`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateMessage {
    pub sender: String,
    pub receiver: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

/// `/topic/service-updates`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceUpdateMessage {
    #[serde(deserialize_with = "deserialize_string_from_scalar")]
    pub car_id: String,
    pub sender: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

/// A payload interpreted according to the destination it arrived on.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundMessage {
    Notification(NotificationMessage),
    LiveData(LiveDataMessage),
    Presence(PresenceMessage),
    Room(RoomMessage),
    DemoChat(RoomMessage),
    Private(PrivateMessage),
    ServiceUpdate(ServiceUpdateMessage),
    /// Unknown destination, raw body, or a body that does not match the schema.
    Opaque(Payload),
}

impl InboundMessage {
    #[must_use]
    pub fn decode(destination: &str, payload: Payload) -> Self {
        let typed = match destination {
            destinations::NOTIFICATIONS => payload.parse().map(Self::Notification),
            destinations::LIVE_DATA => payload.parse().map(Self::LiveData),
            destinations::PRESENCE => payload.parse().map(Self::Presence),
            destinations::SERVICE_UPDATES => payload.parse().map(Self::ServiceUpdate),
            destinations::DEMO_CHAT => payload.parse().map(Self::DemoChat),
            destinations::PRIVATE_QUEUE => payload.parse().map(Self::Private),
            other if destinations::room_of_topic(other).is_some() => {
                payload.parse().map(Self::Room)
            }
            _ => return Self::Opaque(payload),
        };
        match typed {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(%destination, %err, "payload does not match destination schema");
                Self::Opaque(payload)
            }
        }
    }
}

// =============================================================
// Outbound messages
// =============================================================

/// A message addressed to a broker destination.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundMessage {
    pub destination: String,
    pub body: Body,
    pub headers: Vec<(String, String)>,
}

impl OutboundMessage {
    #[must_use]
    pub fn new(destination: impl Into<String>, body: impl Into<Body>) -> Self {
        Self {
            destination: destination.into(),
            body: body.into(),
            headers: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn private_message(sender: &str, receiver: &str, message: &str) -> Self {
        Self::new(
            destinations::PRIVATE_SEND,
            serde_json::json!({ "sender": sender, "receiver": receiver, "message": message }),
        )
    }

    #[must_use]
    pub fn room_message(room: &str, sender: &str, message: &str) -> Self {
        Self::new(
            destinations::room_send(room),
            serde_json::json!({ "sender": sender, "message": message }),
        )
    }

    #[must_use]
    pub fn join_room(room: &str, sender: &str) -> Self {
        Self::new(destinations::room_join(room), serde_json::json!({ "sender": sender }))
    }

    #[must_use]
    pub fn presence_update(user_id: &str, status: PresenceStatus) -> Self {
        Self::new(
            destinations::PRESENCE_UPDATE,
            serde_json::json!({ "userId": user_id, "status": status }),
        )
    }

    /// Service update for one car, sent as `system`.
    #[must_use]
    pub fn service_update(car_id: &str, message: &str) -> Self {
        Self::new(
            destinations::SERVICE_UPDATE_SEND,
            serde_json::json!({ "carId": car_id, "sender": "system", "message": message }),
        )
    }
}

// =============================================================
// REST requests
// =============================================================

/// Body of `POST /api/broadcast/notification`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    pub title: String,
    pub content: String,
    pub severity: Severity,
}

/// Body of `POST /api/broadcast/data`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveDataRequest {
    pub data_type: String,
    pub source: String,
    pub data: Value,
}

fn deserialize_string_from_scalar<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => Ok(text),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(D::Error::custom(format!("expected string or number, got {other}"))),
    }
}
