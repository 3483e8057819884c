//! STOMP 1.2 frame model and text codec for the broker session.
//!
//! This crate owns the wire representation used by `client` and the `pulse`
//! CLI. A frame is a command line, `name:value` header lines, a blank line,
//! the body, and a NUL terminator. Bare EOLs between frames are heart-beats.
//!
//! DESIGN
//! ======
//! Bodies stay as `String`: every destination this project talks to carries
//! UTF-8 JSON or plain text, and the websocket transports deliver text
//! messages. Decoding is streaming because one websocket message may hold
//! several frames, half a frame, or only heart-beat EOLs.

use std::fmt;
use std::time::Duration;

/// Well-known header names.
pub mod header {
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const DESTINATION: &str = "destination";
    pub const HEART_BEAT: &str = "heart-beat";
    pub const HOST: &str = "host";
    pub const ID: &str = "id";
    pub const MESSAGE: &str = "message";
    pub const MESSAGE_ID: &str = "message-id";
    pub const RECEIPT: &str = "receipt";
    pub const RECEIPT_ID: &str = "receipt-id";
    pub const SERVER: &str = "server";
    pub const SESSION: &str = "session";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const USER_NAME: &str = "user-name";
    pub const VERSION: &str = "version";
}

/// Protocol versions offered in the `CONNECT` frame, most preferred first.
pub const ACCEPTED_VERSIONS: &str = "1.2,1.1,1.0";

/// Largest frame the decoder will buffer, in bytes, headers included.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Error returned by [`FrameDecoder::push`] and [`decode_frame`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The command line is not a STOMP command.
    #[error("unknown frame command: {0:?}")]
    UnknownCommand(String),
    /// A header line has no `:` separator.
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),
    /// A header contains an escape sequence STOMP 1.2 does not define.
    #[error("invalid header escape in {0:?}")]
    InvalidEscape(String),
    /// `content-length` is not a byte count that fits the frame.
    #[error("invalid content-length: {0:?}")]
    InvalidContentLength(String),
    /// A `content-length` body is not followed by NUL.
    #[error("frame body is not NUL-terminated")]
    MissingTerminator,
    /// The input ended before a complete frame.
    #[error("incomplete frame")]
    Incomplete,
    /// The `heart-beat` header is not `<ms>,<ms>`.
    #[error("invalid heart-beat header: {0:?}")]
    InvalidHeartBeat(String),
    /// A frame, or the unterminated tail of one, exceeds [`MAX_FRAME_BYTES`].
    #[error("frame of {0} bytes exceeds the 1 MiB limit")]
    FrameTooLarge(usize),
}

/// Frame command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    /// Wire spelling of the command.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    /// Parse a command line.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownCommand`] for anything that is not a STOMP command.
    pub fn parse(line: &str) -> Result<Self, CodecError> {
        let command = match line {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            "BEGIN" => Self::Begin,
            "COMMIT" => Self::Commit,
            "ABORT" => Self::Abort,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            other => return Err(CodecError::UnknownCommand(other.to_owned())),
        };
        Ok(command)
    }

    /// `CONNECT` and `CONNECTED` headers are exempt from escaping (STOMP 1.2 compatibility rule).
    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }

    /// Commands whose body gets an automatic `content-length`.
    fn carries_body(self) -> bool {
        matches!(self, Self::Send | Self::Message | Self::Error)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    /// Headers in wire order. Repeats are kept; lookups use the first.
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self { command, headers: Vec::new(), body: String::new() }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of header `name`, if present.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Session handshake frame.
    #[must_use]
    pub fn connect(host: &str, heart_beat: HeartBeat) -> Self {
        Self::new(Command::Connect)
            .with_header(header::ACCEPT_VERSION, ACCEPTED_VERSIONS)
            .with_header(header::HOST, host)
            .with_header(header::HEART_BEAT, heart_beat.to_string())
    }

    #[must_use]
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .with_header(header::ID, id)
            .with_header(header::DESTINATION, destination)
    }

    #[must_use]
    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).with_header(header::ID, id)
    }

    #[must_use]
    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        Self::new(Command::Send)
            .with_header(header::DESTINATION, destination)
            .with_body(body)
    }

    #[must_use]
    pub fn disconnect(receipt: Option<&str>) -> Self {
        let frame = Self::new(Command::Disconnect);
        match receipt {
            Some(id) => frame.with_header(header::RECEIPT, id),
            None => frame,
        }
    }
}

/// Something read off the wire: a frame or a heart-beat EOL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Frame(Frame),
    HeartBeat,
}

/// Encode a frame into its wire text, NUL terminator included.
#[must_use]
pub fn encode_frame(frame: &Frame) -> String {
    let escape = frame.command.escapes_headers();
    let mut out = String::with_capacity(frame.body.len() + 64);
    out.push_str(frame.command.as_str());
    out.push('\n');
    for (name, value) in &frame.headers {
        push_header_text(&mut out, name, escape);
        out.push(':');
        push_header_text(&mut out, value, escape);
        out.push('\n');
    }
    if frame.command.carries_body()
        && !frame.body.is_empty()
        && frame.header(header::CONTENT_LENGTH).is_none()
    {
        out.push_str(header::CONTENT_LENGTH);
        out.push(':');
        out.push_str(&frame.body.len().to_string());
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&frame.body);
    out.push('\0');
    out
}

/// Encode a heart-beat (a single EOL).
#[must_use]
pub fn encode_heart_beat() -> String {
    "\n".to_owned()
}

/// Decode exactly one complete frame from `text`.
///
/// # Errors
///
/// Returns [`CodecError::Incomplete`] when `text` holds no complete frame, or
/// any error the streaming decoder reports.
pub fn decode_frame(text: &str) -> Result<Frame, CodecError> {
    let mut decoder = FrameDecoder::new();
    decoder
        .push(text)?
        .into_iter()
        .find_map(|item| match item {
            Inbound::Frame(frame) => Some(frame),
            Inbound::HeartBeat => None,
        })
        .ok_or(CodecError::Incomplete)
}

/// Streaming frame decoder.
///
/// Feed it each text message from the transport; it returns every complete
/// frame and heart-beat and buffers the remainder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: String,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back waiting for the rest of a frame.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append `chunk` and drain every complete item.
    ///
    /// # Errors
    ///
    /// Returns the first [`CodecError`] hit. The buffer is discarded on error
    /// because the stream position is no longer trustworthy.
    pub fn push(&mut self, chunk: &str) -> Result<Vec<Inbound>, CodecError> {
        self.buf.push_str(chunk);
        let mut out = Vec::new();
        loop {
            let (beats, skipped) = leading_eols(&self.buf);
            if skipped > 0 {
                self.buf.drain(..skipped);
                out.extend(std::iter::repeat_n(Inbound::HeartBeat, beats));
            }
            if self.buf.is_empty() {
                break;
            }
            match parse_frame(&self.buf) {
                Ok(Some((frame, consumed))) => {
                    self.buf.drain(..consumed);
                    out.push(Inbound::Frame(frame));
                }
                Ok(None) if self.buf.len() > MAX_FRAME_BYTES => {
                    let size = self.buf.len();
                    self.buf.clear();
                    return Err(CodecError::FrameTooLarge(size));
                }
                Ok(None) => break,
                Err(err) => {
                    self.buf.clear();
                    return Err(err);
                }
            }
        }
        Ok(out)
    }
}

/// Heart-beat intervals from a `heart-beat` header (`<outgoing>,<incoming>` in ms).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeartBeat {
    /// Smallest interval at which the sender can emit heart-beats; 0 means never.
    pub outgoing_ms: u64,
    /// Desired interval between heart-beats from the peer; 0 means none wanted.
    pub incoming_ms: u64,
}

impl HeartBeat {
    pub const DISABLED: Self = Self { outgoing_ms: 0, incoming_ms: 0 };

    #[must_use]
    pub fn new(outgoing_ms: u64, incoming_ms: u64) -> Self {
        Self { outgoing_ms, incoming_ms }
    }

    /// Parse a `heart-beat` header value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidHeartBeat`] unless the value is two
    /// comma-separated integers.
    pub fn parse(value: &str) -> Result<Self, CodecError> {
        let invalid = || CodecError::InvalidHeartBeat(value.to_owned());
        let (outgoing, incoming) = value.split_once(',').ok_or_else(invalid)?;
        let outgoing_ms = outgoing.trim().parse::<u64>().map_err(|_| invalid())?;
        let incoming_ms = incoming.trim().parse::<u64>().map_err(|_| invalid())?;
        Ok(Self { outgoing_ms, incoming_ms })
    }

    /// Negotiate effective intervals from the client's point of view.
    ///
    /// Returns `(send_every, expect_every)`: how often the client must emit a
    /// heart-beat and how often it should hear from the server. Either side
    /// is `None` when one of the peers declines it.
    #[must_use]
    pub fn negotiate(client: Self, server: Self) -> (Option<Duration>, Option<Duration>) {
        let send_every = (client.outgoing_ms > 0 && server.incoming_ms > 0)
            .then(|| Duration::from_millis(client.outgoing_ms.max(server.incoming_ms)));
        let expect_every = (client.incoming_ms > 0 && server.outgoing_ms > 0)
            .then(|| Duration::from_millis(client.incoming_ms.max(server.outgoing_ms)));
        (send_every, expect_every)
    }
}

impl fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.outgoing_ms, self.incoming_ms)
    }
}

fn push_header_text(out: &mut String, text: &str, escape: bool) {
    if !escape {
        out.push_str(text);
        return;
    }
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
}

fn unescape_header_text(raw: &str) -> Result<String, CodecError> {
    if !raw.contains('\\') {
        return Ok(raw.to_owned());
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            _ => return Err(CodecError::InvalidEscape(raw.to_owned())),
        }
    }
    Ok(out)
}

/// Count leading EOLs. Returns `(heart_beats, bytes)`.
fn leading_eols(buf: &str) -> (usize, usize) {
    let bytes = buf.as_bytes();
    let mut beats = 0;
    let mut pos = 0;
    loop {
        match bytes.get(pos..) {
            Some([b'\n', ..]) => pos += 1,
            Some([b'\r', b'\n', ..]) => pos += 2,
            _ => break,
        }
        beats += 1;
    }
    (beats, pos)
}

/// Locate the blank line that ends the header block.
///
/// Returns `(head_end, body_start)`: the head is `buf[..head_end]` and the
/// body begins at `body_start`.
fn find_head_end(buf: &str) -> Option<(usize, usize)> {
    let bytes = buf.as_bytes();
    let mut line_start = 0;
    while let Some(offset) = bytes[line_start..].iter().position(|&b| b == b'\n') {
        let newline = line_start + offset;
        let line = &bytes[line_start..newline];
        if line.is_empty() || line == b"\r" {
            return Some((line_start.saturating_sub(1), newline + 1));
        }
        line_start = newline + 1;
    }
    None
}

fn parse_frame(buf: &str) -> Result<Option<(Frame, usize)>, CodecError> {
    let Some((head_end, body_start)) = find_head_end(buf) else {
        return Ok(None);
    };

    let mut lines = buf[..head_end]
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line));
    let command = Command::parse(lines.next().unwrap_or_default())?;
    let escape = command.escapes_headers();

    let mut headers = Vec::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            return Err(CodecError::MalformedHeader(line.to_owned()));
        };
        if escape {
            headers.push((unescape_header_text(name)?, unescape_header_text(value)?));
        } else {
            headers.push((name.to_owned(), value.to_owned()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(name, _)| name == header::CONTENT_LENGTH)
        .map(|(_, value)| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| CodecError::InvalidContentLength(value.clone()))
        })
        .transpose()?;

    let rest = &buf[body_start..];
    let (body, consumed) = match content_length {
        Some(len) => {
            if len > MAX_FRAME_BYTES.saturating_sub(body_start) {
                return Err(CodecError::FrameTooLarge(body_start.saturating_add(len)));
            }
            if rest.len() <= len {
                return Ok(None);
            }
            if !rest.is_char_boundary(len) {
                return Err(CodecError::InvalidContentLength(len.to_string()));
            }
            if rest.as_bytes()[len] != 0 {
                return Err(CodecError::MissingTerminator);
            }
            (rest[..len].to_owned(), body_start + len + 1)
        }
        None => match rest.find('\0') {
            Some(end) => (rest[..end].to_owned(), body_start + end + 1),
            None => return Ok(None),
        },
    };

    Ok(Some((Frame { command, headers, body }, consumed)))
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
