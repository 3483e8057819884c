//! Reactive binding layer between the connection manager and UI code.
//!
//! SYSTEM CONTEXT
//! ==============
//! `ConnectionBinding` and `SubscriptionBinding` are framework-agnostic and
//! carry all lifecycle rules. The `use_*` hooks wrap them for Leptos: state
//! lands in signals, activation runs in an `Effect`, and teardown runs in
//! `on_cleanup`. The manager itself is injected through context with
//! [`provide_connection_manager`].

pub mod connection;
pub mod subscription;

pub use connection::{ConnectionHandle, use_connection};
pub use subscription::use_subscription;

use leptos::prelude::*;

use crate::net::connection::ConnectionManager;

/// Make `manager` available to every hook below the current owner.
pub fn provide_connection_manager(manager: ConnectionManager) {
    provide_context(manager);
}

/// The manager provided by an ancestor.
///
/// # Panics
///
/// Panics when no ancestor called [`provide_connection_manager`].
pub fn use_connection_manager() -> ConnectionManager {
    expect_context::<ConnectionManager>()
}
