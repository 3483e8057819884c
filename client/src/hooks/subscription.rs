//! Subscription binding: one destination and handler tied to a lifetime.
//!
//! A binding subscribes only while the manager is connected. Re-binding the
//! same destination with the same handler (by pointer) keeps the live
//! subscription; any other change cancels it first. `release()` and `Drop`
//! cancel it.
//!
//! There is no automatic resubscription after a reconnect: the session
//! clears its registry when it drops, and the owner re-binds once
//! connected. The Leptos hook does that by tracking the connection signal.

#[cfg(test)]
#[path = "subscription_test.rs"]
mod subscription_test;

use std::sync::{Arc, Mutex, PoisonError};

use leptos::prelude::*;

use super::connection::ConnectionHandle;
use super::use_connection_manager;
use crate::net::connection::{ConnectionManager, Subscription};
use crate::net::registry::Handler;
use crate::net::types::Payload;

pub struct SubscriptionBinding {
    manager: ConnectionManager,
    bound: Option<Bound>,
}

struct Bound {
    destination: String,
    handler: Handler,
    subscription: Option<Subscription>,
}

impl SubscriptionBinding {
    #[must_use]
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager, bound: None }
    }

    /// Point the binding at `destination` / `handler`.
    ///
    /// Returns `true` when a live subscription backs the binding afterwards.
    pub fn bind(&mut self, destination: &str, handler: Handler) -> bool {
        if let Some(bound) = self.bound.as_mut() {
            if bound.destination == destination && Arc::ptr_eq(&bound.handler, &handler) {
                if bound.subscription.as_ref().is_some_and(Subscription::is_active) {
                    return true;
                }
                bound.subscription = subscribe_if_connected(&self.manager, destination, &handler);
                return bound.subscription.is_some();
            }
        }

        self.release();
        let subscription = subscribe_if_connected(&self.manager, destination, &handler);
        let live = subscription.is_some();
        self.bound = Some(Bound {
            destination: destination.to_owned(),
            handler,
            subscription,
        });
        live
    }

    /// Cancel the subscription and forget the destination.
    pub fn release(&mut self) {
        let Some(bound) = self.bound.take() else {
            return;
        };
        if let Some(subscription) = bound.subscription {
            subscription.unsubscribe();
        }
    }

    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.bound.as_ref().map(|bound| bound.destination.as_str())
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.bound
            .as_ref()
            .and_then(|bound| bound.subscription.as_ref())
            .is_some_and(Subscription::is_active)
    }
}

impl Drop for SubscriptionBinding {
    fn drop(&mut self) {
        self.release();
    }
}

fn subscribe_if_connected(
    manager: &ConnectionManager,
    destination: &str,
    handler: &Handler,
) -> Option<Subscription> {
    if !manager.is_connected() {
        tracing::debug!(%destination, "not connected; subscription deferred");
        return None;
    }
    manager.subscribe_with(destination, Arc::clone(handler), &[])
}

// =============================================================
// Leptos hook
// =============================================================

/// Subscribe `handler` to `destination` while the calling component is mounted.
///
/// Re-binds when `destination` changes and, below a [`use_connection`]
/// caller, whenever the session connects again.
///
/// [`use_connection`]: super::connection::use_connection
pub fn use_subscription<F>(destination: impl Into<Signal<String>>, handler: F)
where
    F: Fn(Payload) + Send + Sync + 'static,
{
    let destination = destination.into();
    let handler: Handler = Arc::new(handler);
    let connection = use_context::<ConnectionHandle>();
    let binding = Arc::new(Mutex::new(SubscriptionBinding::new(use_connection_manager())));

    {
        let binding = Arc::clone(&binding);
        Effect::new(move || {
            let destination = destination.get();
            if let Some(connection) = &connection {
                // Tracked so a reconnect re-runs the effect.
                connection.connected();
            }
            binding
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .bind(&destination, Arc::clone(&handler));
        });
    }
    on_cleanup(move || {
        binding.lock().unwrap_or_else(PoisonError::into_inner).release();
    });
}
