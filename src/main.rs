//! `pulse`: terminal client for the realtime broker.
//!
//! Every command goes through the public `client` API: realtime commands
//! connect a [`ConnectionManager`] as `--user`, and the REST commands use the
//! manager's fallback endpoints without opening a socket.


use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use client::config::{
    DEFAULT_API_BASE_URL, DEFAULT_BROKER_URL, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_HEARTBEAT_MS,
    DEFAULT_RECONNECT_DELAY_MS,
};
use client::net::types::{
    LiveDataRequest, NotificationRequest, PresenceStatus, Severity, destinations,
};
use client::{ClientConfig, ClientError, ConnectionManager, Handshake, InboundMessage, OutboundMessage, Payload};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

/// Time given to the socket writer to flush before the process exits.
const FLUSH_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("connection failed: {0}")]
    Connect(#[from] ClientError),
    #[error("broker session rejected message to {0}")]
    NotSent(String),
    #[error("{0} request failed")]
    Rest(&'static str),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("failed to listen for ctrl-c: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "pulse", about = "Realtime dashboard broker client")]
struct Cli {
    #[arg(long, env = "PULSE_BROKER_URL", default_value = DEFAULT_BROKER_URL)]
    broker_url: String,

    #[arg(long, env = "PULSE_API_BASE_URL", default_value = DEFAULT_API_BASE_URL)]
    api_base_url: String,

    #[arg(long, env = "PULSE_HEARTBEAT_MS", default_value_t = DEFAULT_HEARTBEAT_MS)]
    heartbeat_ms: u64,

    #[arg(long, env = "PULSE_RECONNECT_DELAY_MS", default_value_t = DEFAULT_RECONNECT_DELAY_MS)]
    reconnect_delay_ms: u64,

    #[arg(long, env = "PULSE_CONNECT_TIMEOUT_MS", default_value_t = DEFAULT_CONNECT_TIMEOUT_MS)]
    connect_timeout_ms: u64,

    /// Identity sent as the `user` query parameter.
    #[arg(long, short, env = "PULSE_USER", default_value = "anonymous")]
    user: String,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn config(&self) -> ClientConfig {
        ClientConfig {
            broker_url: self.broker_url.clone(),
            api_base_url: self.api_base_url.clone(),
            heartbeat_ms: self.heartbeat_ms,
            reconnect_delay_ms: self.reconnect_delay_ms,
            connect_timeout_ms: self.connect_timeout_ms,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print messages until Ctrl-C. Defaults to every dashboard topic.
    Listen(ListenArgs),
    /// Publish one message over the broker session.
    Send(SendCommand),
    /// Broadcast a notification through the REST fallback.
    Notify {
        title: String,
        content: String,
        #[arg(long, value_parser = parse_severity, default_value = "INFO")]
        severity: Severity,
    },
    /// Broadcast a live-data sample through the REST fallback.
    LiveData {
        /// JSON value for the `data` field.
        data: String,
        #[arg(long, default_value = "METRICS")]
        data_type: String,
        #[arg(long, default_value = "pulse-cli")]
        source: String,
    },
    /// Trigger the broker's demo endpoints.
    Demo(DemoCommand),
}

#[derive(Args, Debug)]
struct ListenArgs {
    /// Explicit destinations; replaces the default topic set.
    destinations: Vec<String>,

    /// Chat rooms to follow with the default topic set.
    #[arg(long = "room")]
    rooms: Vec<String>,
}

#[derive(Args, Debug)]
struct SendCommand {
    #[command(subcommand)]
    command: SendSubcommand,
}

#[derive(Subcommand, Debug)]
enum SendSubcommand {
    Private {
        receiver: String,
        message: String,
    },
    Room {
        room: String,
        message: String,
    },
    Join {
        room: String,
    },
    Presence {
        #[arg(value_parser = parse_presence)]
        status: PresenceStatus,
    },
    Service {
        car_id: String,
        message: String,
    },
}

#[derive(Args, Debug)]
struct DemoCommand {
    #[command(subcommand)]
    command: DemoSubcommand,
}

#[derive(Subcommand, Debug)]
enum DemoSubcommand {
    Chat { message: String },
    Notification { message: String },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let manager = ConnectionManager::new(cli.config());

    match cli.command {
        Command::Listen(args) => run_listen(&manager, &cli.user, listen_destinations(args)).await,
        Command::Send(send) => run_send(&manager, &cli.user, send.command).await,
        Command::Notify {
            title,
            content,
            severity,
        } => {
            let request = NotificationRequest { title, content, severity };
            rest_outcome("notification", manager.send_notification(&request).await)
        }
        Command::LiveData {
            data,
            data_type,
            source,
        } => {
            let request = LiveDataRequest {
                data_type,
                source,
                data: serde_json::from_str::<Value>(&data)?,
            };
            rest_outcome("live-data", manager.send_live_data(&request).await)
        }
        Command::Demo(demo) => match demo.command {
            DemoSubcommand::Chat { message } => {
                rest_outcome("demo chat", manager.test_demo(&message).await)
            }
            DemoSubcommand::Notification { message } => rest_outcome(
                "demo notification",
                manager.test_demo_notification(&message).await,
            ),
        },
    }
}

// =============================================================
// Realtime commands
// =============================================================

async fn run_listen(
    manager: &ConnectionManager,
    user: &str,
    destinations: Vec<String>,
) -> Result<(), CliError> {
    // Subscriptions do not survive a reconnect; re-subscribe on every session.
    let (connected_tx, mut connected_rx) = tokio::sync::mpsc::unbounded_channel::<Handshake>();
    manager.on_connect(move |handshake| {
        let _ = connected_tx.send(handshake.clone());
    });
    manager.on_disconnect(|| tracing::warn!("session lost; waiting for reconnect"));

    manager.connect(user).await?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }
            Some(handshake) = connected_rx.recv() => {
                tracing::info!(
                    session = handshake.session.as_deref().unwrap_or_default(),
                    destinations = destinations.len(),
                    "subscribing"
                );
                for destination in &destinations {
                    let topic = destination.clone();
                    let subscribed = manager.subscribe(destination, move |payload| {
                        println!("{}", describe(&topic, payload));
                    });
                    if subscribed.is_none() {
                        tracing::warn!(%destination, "subscribe failed");
                    }
                }
            }
        }
    }

    manager.disconnect();
    Ok(())
}

async fn run_send(
    manager: &ConnectionManager,
    user: &str,
    command: SendSubcommand,
) -> Result<(), CliError> {
    let handshake = manager.connect(user).await?;
    let sender = handshake.user_name.as_deref().unwrap_or(user);
    let message = outbound_for(sender, command);

    let sent = manager.send(&message);
    tokio::time::sleep(FLUSH_GRACE).await;
    manager.disconnect();
    tokio::time::sleep(FLUSH_GRACE).await;

    if sent {
        println!("sent to {}", message.destination);
        Ok(())
    } else {
        Err(CliError::NotSent(message.destination))
    }
}

fn outbound_for(sender: &str, command: SendSubcommand) -> OutboundMessage {
    match command {
        SendSubcommand::Private { receiver, message } => {
            OutboundMessage::private_message(sender, &receiver, &message)
        }
        SendSubcommand::Room { room, message } => {
            OutboundMessage::room_message(&room, sender, &message)
        }
        SendSubcommand::Join { room } => OutboundMessage::join_room(&room, sender),
        SendSubcommand::Presence { status } => OutboundMessage::presence_update(sender, status),
        SendSubcommand::Service { car_id, message } => {
            OutboundMessage::service_update(&car_id, &message)
        }
    }
}

fn listen_destinations(args: ListenArgs) -> Vec<String> {
    if !args.destinations.is_empty() {
        return args.destinations;
    }
    let rooms = if args.rooms.is_empty() {
        destinations::ROOMS.iter().map(|room| (*room).to_owned()).collect()
    } else {
        args.rooms
    };
    [
        destinations::NOTIFICATIONS,
        destinations::LIVE_DATA,
        destinations::PRESENCE,
        destinations::SERVICE_UPDATES,
        destinations::DEMO_CHAT,
        destinations::PRIVATE_QUEUE,
    ]
    .into_iter()
    .map(str::to_owned)
    .chain(rooms.iter().map(|room| destinations::room_topic(room)))
    .collect()
}

/// One output line for a received message.
fn describe(destination: &str, payload: Payload) -> String {
    match InboundMessage::decode(destination, payload) {
        InboundMessage::Notification(note) => {
            format!("[notification] {:?} {}: {}", note.severity, note.title, note.content)
        }
        InboundMessage::LiveData(sample) => {
            format!("[live-data] {} from {}: {}", sample.data_type, sample.source, sample.data)
        }
        InboundMessage::Presence(presence) => {
            format!("[presence] {} is {:?}", presence.user_id, presence.status)
        }
        InboundMessage::Room(chat) => format!(
            "[room {}] {}: {}",
            chat.room
                .as_deref()
                .or_else(|| destinations::room_of_topic(destination))
                .unwrap_or("?"),
            chat.sender,
            chat.message
        ),
        InboundMessage::DemoChat(chat) => format!("[demo-chat] {}: {}", chat.sender, chat.message),
        InboundMessage::Private(private) => {
            format!("[private] {} -> {}: {}", private.sender, private.receiver, private.message)
        }
        InboundMessage::ServiceUpdate(update) => format!(
            "[service] car {} ({}): {}",
            update.car_id, update.sender, update.message
        ),
        InboundMessage::Opaque(payload) => format!("[{destination}] {payload}"),
    }
}

// =============================================================
// REST commands
// =============================================================

fn rest_outcome(endpoint: &'static str, ok: bool) -> Result<(), CliError> {
    if ok {
        println!("ok");
        Ok(())
    } else {
        Err(CliError::Rest(endpoint))
    }
}

fn parse_severity(raw: &str) -> Result<Severity, String> {
    serde_json::from_value(Value::String(raw.to_ascii_uppercase()))
        .map_err(|_| format!("unknown severity `{raw}` (info, warning, error, success)"))
}

fn parse_presence(raw: &str) -> Result<PresenceStatus, String> {
    serde_json::from_value(Value::String(raw.to_ascii_uppercase()))
        .map_err(|_| format!("unknown status `{raw}` (online, away, busy, offline)"))
}
