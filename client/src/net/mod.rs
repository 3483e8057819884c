//! Broker networking: STOMP session management, transports, and REST.
//!
//! SYSTEM CONTEXT
//! ==============
//! `connection` owns the session state machine and is the only public entry
//! point for realtime traffic. `session` drives one socket, `transport` and
//! `websocket` open sockets, `api` handles the REST fallback, and `types`
//! defines the destination schema.

pub mod api;
pub mod connection;
pub mod registry;
pub mod runtime;
mod session;
#[cfg(test)]
pub(crate) mod test_broker;
pub mod transport;
pub mod types;
pub mod websocket;
