//! Connection binding: `{connected, connecting, error}` plus connect/disconnect.
//!
//! DESIGN
//! ======
//! A binding registers exactly one connect observer and one disconnect
//! observer for as long as it is active, however many times `activate()` is
//! called. Observers hold a weak reference, so a dropped binding stops
//! receiving updates even if it was never deactivated.
//!
//! Every view change is pushed to the sink supplied at construction. The
//! Leptos hook points the sink at a signal; tests point it at a vector.

#[cfg(test)]
#[path = "connection_test.rs"]
mod connection_test;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use leptos::prelude::*;

use super::use_connection_manager;
use crate::error::ClientError;
use crate::net::connection::ConnectionManager;
use crate::net::registry::ObserverId;
use crate::net::runtime;
use crate::state::connection::ConnectionView;

/// Receives every new [`ConnectionView`].
pub type ViewSink = Arc<dyn Fn(ConnectionView) + Send + Sync>;

/// Projects one manager's lifecycle into a [`ConnectionView`].
#[derive(Clone)]
pub struct ConnectionBinding {
    inner: Arc<BindingInner>,
}

struct BindingInner {
    manager: ConnectionManager,
    identity: String,
    sink: ViewSink,
    state: Mutex<BindingState>,
}

#[derive(Default)]
struct BindingState {
    view: ConnectionView,
    observers: Option<(ObserverId, ObserverId)>,
}

impl ConnectionBinding {
    pub fn new<F>(manager: ConnectionManager, identity: impl Into<String>, sink: F) -> Self
    where
        F: Fn(ConnectionView) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(BindingInner {
                manager,
                identity: identity.into(),
                sink: Arc::new(sink),
                state: Mutex::new(BindingState::default()),
            }),
        }
    }

    /// Register observers and start connecting. Idempotent while active.
    pub fn activate(&self) {
        {
            let mut state = lock(&self.inner);
            if state.observers.is_some() {
                return;
            }
            let weak = Arc::downgrade(&self.inner);
            let on_connect = self.inner.manager.on_connect(move |_| {
                update_weak(&weak, |view| {
                    view.connected = true;
                    view.connecting = false;
                    view.error = None;
                });
            });
            let weak = Arc::downgrade(&self.inner);
            let on_disconnect = self.inner.manager.on_disconnect(move || {
                update_weak(&weak, |view| {
                    view.connected = false;
                    view.connecting = false;
                });
            });
            state.observers = Some((on_connect, on_disconnect));
        }
        tracing::debug!(identity = %self.inner.identity, "connection binding activated");
        self.connect();
    }

    /// Remove the observers and disconnect. No-op when not active.
    pub fn deactivate(&self) {
        let Some((on_connect, on_disconnect)) = lock(&self.inner).observers.take() else {
            return;
        };
        self.inner.manager.remove_observer(on_connect);
        self.inner.manager.remove_observer(on_disconnect);
        tracing::debug!(identity = %self.inner.identity, "connection binding deactivated");
        self.disconnect();
    }

    /// Connect as the binding's identity. No-op while connected.
    ///
    /// Failures land in `view.error`; a local cancellation does not.
    pub fn connect(&self) {
        if self.inner.manager.is_connected() {
            update(&self.inner, |view| {
                view.connected = true;
                view.connecting = false;
            });
            return;
        }

        update(&self.inner, |view| {
            view.connecting = true;
            view.error = None;
        });
        let pending = self.inner.manager.connect(&self.inner.identity);
        let weak = Arc::downgrade(&self.inner);
        runtime::spawn(async move {
            let outcome = pending.await;
            update_weak(&weak, |view| {
                view.connecting = false;
                match outcome {
                    Ok(_) => {
                        view.connected = true;
                        view.error = None;
                    }
                    Err(ClientError::Cancelled) => view.connected = false,
                    Err(err) => {
                        view.connected = false;
                        view.error = Some(err.to_string());
                    }
                }
            });
        });
    }

    pub fn disconnect(&self) {
        self.inner.manager.disconnect();
        update(&self.inner, |view| {
            view.connected = false;
            view.connecting = false;
        });
    }

    #[must_use]
    pub fn view(&self) -> ConnectionView {
        lock(&self.inner).view.clone()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        lock(&self.inner).observers.is_some()
    }

    #[must_use]
    pub fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }
}

fn lock(inner: &BindingInner) -> MutexGuard<'_, BindingState> {
    inner.state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Apply `change` and push the result to the sink if anything changed.
fn update(inner: &BindingInner, change: impl FnOnce(&mut ConnectionView)) {
    let next = {
        let mut state = lock(inner);
        let before = state.view.clone();
        change(&mut state.view);
        (state.view != before).then(|| state.view.clone())
    };
    if let Some(view) = next {
        (inner.sink)(view);
    }
}

fn update_weak(inner: &Weak<BindingInner>, change: impl FnOnce(&mut ConnectionView)) {
    if let Some(inner) = inner.upgrade() {
        update(&inner, change);
    }
}

// =============================================================
// Leptos hook
// =============================================================

/// Reactive connection state for the component that calls [`use_connection`].
#[derive(Clone)]
pub struct ConnectionHandle {
    pub view: ReadSignal<ConnectionView>,
    binding: ConnectionBinding,
}

impl ConnectionHandle {
    /// Tracked read of `view.connected`.
    pub fn connected(&self) -> bool {
        self.view.with(|view| view.connected)
    }

    pub fn connect(&self) {
        self.binding.connect();
    }

    pub fn disconnect(&self) {
        self.binding.disconnect();
    }
}

/// Connect as `identity` while the calling component is mounted.
///
/// The handle is also provided as context so `use_subscription` in
/// descendants re-binds when the session comes back.
pub fn use_connection(identity: impl Into<String>) -> ConnectionHandle {
    let view = RwSignal::new(ConnectionView::default());
    let binding = ConnectionBinding::new(use_connection_manager(), identity, move |next| {
        view.try_set(next);
    });
    let handle = ConnectionHandle {
        view: view.read_only(),
        binding: binding.clone(),
    };
    provide_context(handle.clone());

    {
        let binding = binding.clone();
        Effect::new(move || binding.activate());
    }
    on_cleanup(move || binding.deactivate());

    handle
}
