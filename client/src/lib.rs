//! Pulse client: a STOMP-over-websocket pub/sub client for realtime dashboards.
//!
//! One [`ConnectionManager`] owns one broker session. It opens the socket,
//! runs the STOMP handshake, keeps a registry of destination subscriptions,
//! and fans session transitions out to observers. The binding layer in
//! [`hooks`] projects that state into UI-observable form and ties
//! subscription lifetimes to component lifetimes.
//!
//! ## Module layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`net`] | Connection manager, session driver, transports, REST fallback, payload types |
//! | [`hooks`] | Framework-agnostic bindings and the Leptos hooks built on them |
//! | [`state`] | Connection lifecycle state and its view projection |
//! | [`config`] | Broker endpoints and timing knobs |
//! | [`error`] | Transport and client error enums |
//!
//! Natively everything runs on tokio; compiled to `wasm32` the same code runs
//! on the browser's event loop.

pub mod config;
pub mod error;
pub mod hooks;
pub mod net;
pub mod state;

pub use config::ClientConfig;
pub use error::{ClientError, TransportError};
pub use hooks::connection::ConnectionBinding;
pub use hooks::subscription::SubscriptionBinding;
pub use net::connection::{ConnectionManager, Subscription};
pub use net::registry::{Handler, ObserverId};
pub use net::types::{Body, Handshake, InboundMessage, OutboundMessage, Payload};
pub use state::connection::{ConnectionState, ConnectionView};
