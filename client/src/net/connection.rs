//! Connection manager: one broker session, its subscriptions, and observers.
//!
//! A `ConnectionManager` is a cheap cloneable handle. Every clone drives the
//! same session; create separate managers for separate identities.
//!
//! DESIGN
//! ======
//! All mutable state sits behind one mutex. The lock is never held across an
//! `.await` or while user callbacks run: handlers and observers are cloned
//! out first and invoked after the guard is dropped. Frames go out through
//! the socket's unbounded sender, so publishing never blocks.
//!
//! Each attempt gets a fresh id. The driver task (`session`) reports back
//! with that id, and reports for an attempt that is no longer current are
//! ignored. That makes timeout, handshake, transport failure, and local
//! cancellation race safely: the first to claim the attempt wins.
//!
//! An explicit `connect()` or `disconnect()` bumps `epoch`, which voids any
//! pending automatic reconnect.
//!
//! ERROR HANDLING
//! ==============
//! `connect()` rejects with the [`ClientError`] of the failed attempt.
//! `subscribe` and `publish` are fail-soft: they log and return `None` /
//! `false` when no session is up.

#[cfg(test)]
#[path = "connection_test.rs"]
mod connection_test;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use frames::{Frame, encode_frame, header};
use futures::channel::{mpsc, oneshot};
use serde::Serialize;
use url::Url;

use super::api::RestClient;
use super::registry::{Handler, ObserverId, ObserverRegistry, SubscriptionEntry, SubscriptionRegistry};
use super::runtime;
use super::session;
use super::transport::{FallbackTransport, Socket, Transport};
use super::types::{Body, Handshake, LiveDataRequest, NotificationRequest, OutboundMessage, Payload};
use super::websocket::WebSocketTransport;
use crate::config::ClientConfig;
use crate::error::{ClientError, TransportError};
use crate::state::connection::ConnectionState;

/// Identity used when `connect` is given an empty one.
pub const ANONYMOUS: &str = "anonymous";

pub(crate) type ConnectObserver = dyn Fn(&Handshake) + Send + Sync;
pub(crate) type DisconnectObserver = dyn Fn() + Send + Sync;
type Waiter = oneshot::Sender<Result<Handshake, ClientError>>;

/// Handle to a broker session.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    transport: Arc<dyn Transport>,
    rest: RestClient,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    identity: Option<String>,
    handshake: Option<Handshake>,
    attempt: Option<Attempt>,
    link: Option<Link>,
    subscriptions: SubscriptionRegistry,
    on_connect: ObserverRegistry<ConnectObserver>,
    on_disconnect: ObserverRegistry<DisconnectObserver>,
    next_attempt_id: u64,
    next_subscription_id: u64,
    next_observer_id: u64,
    epoch: u64,
}

/// Pending handshake. Present only while `Connecting`.
struct Attempt {
    id: u64,
    started_ms: u64,
    /// Automatic reconnects are retried on failure; explicit attempts are not.
    auto: bool,
    waiters: Vec<Waiter>,
}

/// Write side of the current socket plus the driver's shutdown switch.
struct Link {
    id: u64,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: oneshot::Sender<()>,
}

/// Everything the driver task needs for one attempt.
pub(crate) struct Launch {
    pub shared: Arc<Shared>,
    pub id: u64,
    pub host: String,
    pub url: Url,
    pub socket: Socket,
    pub shutdown: oneshot::Receiver<()>,
}

impl Launch {
    fn spawn(self) {
        runtime::spawn(session::drive(self));
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl ConnectionManager {
    /// Manager using websocket transports chosen from the broker URL scheme.
    ///
    /// `http(s)` URLs try the SockJS raw-websocket endpoint first and then
    /// the URL itself; `ws(s)` URLs are used directly.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let transport: Arc<dyn Transport> = if config.broker_url.starts_with("http") {
            Arc::new(FallbackTransport::new(vec![
                Arc::new(WebSocketTransport::sockjs()),
                Arc::new(WebSocketTransport::direct()),
            ]))
        } else {
            Arc::new(WebSocketTransport::direct())
        };
        Self::with_transport(config, transport)
    }

    #[must_use]
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let rest = RestClient::new(config.api_base_url.clone());
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                rest,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    // =========================================================
    // Lifecycle
    // =========================================================

    /// Establish a session as `identity` (empty means [`ANONYMOUS`]).
    ///
    /// The attempt starts immediately; the returned future only reports its
    /// outcome. While connected this resolves at once with the cached
    /// handshake. While connecting it joins the attempt in flight.
    pub fn connect(
        &self,
        identity: &str,
    ) -> impl Future<Output = Result<Handshake, ClientError>> + Send + 'static {
        let identity = if identity.is_empty() { ANONYMOUS } else { identity };
        let (tx, rx) = oneshot::channel();

        let launch = {
            let mut guard = lock(&self.shared);
            let inner = &mut *guard;
            match inner.state {
                ConnectionState::Connected => {
                    tracing::debug!(identity, "already connected");
                    let handshake = inner.handshake.clone().unwrap_or_default();
                    let _ = tx.send(Ok(handshake));
                    None
                }
                ConnectionState::Connecting => {
                    if let Some(attempt) = inner.attempt.as_mut() {
                        if inner.identity.as_deref() != Some(identity) {
                            tracing::warn!(identity, attempt = attempt.id, "joining attempt made for another identity");
                        }
                        attempt.auto = false;
                        attempt.waiters.push(tx);
                    }
                    None
                }
                ConnectionState::Disconnected => {
                    inner.epoch += 1;
                    match begin_attempt(&self.shared, inner, identity, false) {
                        Ok(launch) => {
                            if let Some(attempt) = inner.attempt.as_mut() {
                                attempt.waiters.push(tx);
                            }
                            Some(launch)
                        }
                        Err(err) => {
                            tracing::warn!(identity, %err, "connection attempt could not start");
                            let _ = tx.send(Err(err));
                            None
                        }
                    }
                }
            }
        };

        if let Some(launch) = launch {
            launch.spawn();
        }
        async move { rx.await.unwrap_or(Err(ClientError::Cancelled)) }
    }

    /// Tear down the session. Idempotent.
    ///
    /// Sends a best-effort `DISCONNECT`, clears the subscription registry,
    /// cancels a pending attempt (its callers get [`ClientError::Cancelled`])
    /// and any scheduled reconnect. Disconnect observers fire when a session
    /// was established.
    pub fn disconnect(&self) {
        let (attempt, link, observers, was_connected) = {
            let mut inner = lock(&self.shared);
            inner.epoch += 1;
            let was_connected = inner.state == ConnectionState::Connected;
            let observers = if was_connected {
                inner.on_disconnect.snapshot()
            } else {
                Vec::new()
            };
            inner.state = ConnectionState::Disconnected;
            inner.handshake = None;
            inner.subscriptions.clear();
            (inner.attempt.take(), inner.link.take(), observers, was_connected)
        };

        if let Some(link) = link {
            if was_connected {
                let _ = link.outbound.unbounded_send(encode_frame(&Frame::disconnect(None)));
            }
            let _ = link.shutdown.send(());
        }
        if let Some(attempt) = attempt {
            tracing::info!(attempt = attempt.id, "connection attempt cancelled");
            for waiter in attempt.waiters {
                let _ = waiter.send(Err(ClientError::Cancelled));
            }
        }
        if was_connected {
            tracing::info!("disconnected");
            for observer in observers {
                observer();
            }
        }
    }

    // =========================================================
    // Subscriptions
    // =========================================================

    /// Subscribe `handler` to `destination`.
    ///
    /// Returns `None` when not connected. A second subscription to the same
    /// destination replaces the first.
    pub fn subscribe<F>(&self, destination: &str, handler: F) -> Option<Subscription>
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        self.subscribe_with(destination, Arc::new(handler), &[])
    }

    /// [`Self::subscribe`] with a shared handler and extra `SUBSCRIBE` headers.
    pub fn subscribe_with(
        &self,
        destination: &str,
        handler: Handler,
        headers: &[(String, String)],
    ) -> Option<Subscription> {
        let mut inner = lock(&self.shared);
        let Some(outbound) = connected_outbound(&inner, "subscribe", destination) else {
            return None;
        };

        inner.next_subscription_id += 1;
        let id = format!("sub-{}", inner.next_subscription_id);
        let mut frame = Frame::subscribe(&id, destination);
        for (name, value) in headers {
            frame = frame.with_header(name.as_str(), value.as_str());
        }

        let previous = inner
            .subscriptions
            .insert(destination, SubscriptionEntry { id: id.clone(), handler });
        if let Some(previous) = previous {
            tracing::debug!(%destination, replaced = %previous.id, "replacing subscription");
            let _ = outbound.unbounded_send(encode_frame(&Frame::unsubscribe(&previous.id)));
        }
        if outbound.unbounded_send(encode_frame(&frame)).is_err() {
            inner.subscriptions.remove(destination);
            tracing::warn!(%destination, "subscribe failed: socket is closing");
            return None;
        }

        tracing::debug!(%destination, subscription = %id, "subscribed");
        Some(Subscription {
            destination: destination.to_owned(),
            id,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Cancel the subscription for `destination`, if any.
    pub fn unsubscribe(&self, destination: &str) {
        unsubscribe_entry(&self.shared, destination, None);
    }

    // =========================================================
    // Publishing
    // =========================================================

    /// Send one message. Returns `false`, with no side effect, when not connected.
    pub fn publish(&self, destination: &str, body: impl Into<Body>, headers: &[(String, String)]) -> bool {
        let inner = lock(&self.shared);
        let Some(outbound) = connected_outbound(&inner, "publish", destination) else {
            return false;
        };

        let body = body.into();
        let content_type = matches!(body, Body::Json(_)).then(|| body.content_type());
        let mut frame = Frame::send(destination, body.into_text());
        for (name, value) in headers {
            frame = frame.with_header(name.as_str(), value.as_str());
        }
        if let Some(content_type) = content_type {
            if frame.header(header::CONTENT_TYPE).is_none() {
                frame = frame.with_header(header::CONTENT_TYPE, content_type);
            }
        }

        let sent = outbound.unbounded_send(encode_frame(&frame)).is_ok();
        tracing::debug!(%destination, sent, "publish");
        sent
    }

    /// Serialize `value` as JSON and publish it.
    pub fn publish_json<T: Serialize + ?Sized>(&self, destination: &str, value: &T) -> bool {
        match serde_json::to_value(value) {
            Ok(json) => self.publish(destination, json, &[]),
            Err(err) => {
                tracing::warn!(%destination, %err, "publish failed: body is not serializable");
                false
            }
        }
    }

    pub fn send(&self, message: &OutboundMessage) -> bool {
        self.publish(&message.destination, message.body.clone(), &message.headers)
    }

    // =========================================================
    // REST fallback
    // =========================================================

    pub async fn send_notification(&self, notification: &NotificationRequest) -> bool {
        self.shared.rest.send_notification(notification).await
    }

    pub async fn send_live_data(&self, data: &LiveDataRequest) -> bool {
        self.shared.rest.send_live_data(data).await
    }

    pub async fn test_demo(&self, message: &str) -> bool {
        self.shared.rest.test_demo(message).await
    }

    pub async fn test_demo_notification(&self, message: &str) -> bool {
        self.shared.rest.test_demo_notification(message).await
    }

    // =========================================================
    // Observers
    // =========================================================

    /// Call `observer` every time a session is established.
    pub fn on_connect<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&Handshake) + Send + Sync + 'static,
    {
        let mut inner = lock(&self.shared);
        let id = next_observer_id(&mut inner);
        inner.on_connect.add(id, Arc::new(observer));
        id
    }

    /// Call `observer` every time an established session ends.
    pub fn on_disconnect<F>(&self, observer: F) -> ObserverId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut inner = lock(&self.shared);
        let id = next_observer_id(&mut inner);
        inner.on_disconnect.add(id, Arc::new(observer));
        id
    }

    /// Returns `false` if `id` was not registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut inner = lock(&self.shared);
        inner.on_connect.remove(id) || inner.on_disconnect.remove(id)
    }

    // =========================================================
    // Introspection
    // =========================================================

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        lock(&self.shared).state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Identity of the current or most recent session.
    #[must_use]
    pub fn identity(&self) -> Option<String> {
        lock(&self.shared).identity.clone()
    }

    #[must_use]
    pub fn handshake(&self) -> Option<Handshake> {
        lock(&self.shared).handshake.clone()
    }

    /// Subscribed destinations, sorted.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.shared).subscriptions.destinations()
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        lock(&self.shared).subscriptions.len()
    }

    /// `(connect observers, disconnect observers)`.
    #[must_use]
    pub fn observer_counts(&self) -> (usize, usize) {
        let inner = lock(&self.shared);
        (inner.on_connect.len(), inner.on_disconnect.len())
    }
}

/// Transport handle for one subscription.
///
/// Dropping it leaves the subscription active.
#[derive(Clone, Debug)]
pub struct Subscription {
    destination: String,
    id: String,
    shared: Weak<Shared>,
}

impl Subscription {
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// STOMP subscription id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// `true` while this is the live subscription for its destination.
    ///
    /// Turns `false` once it is replaced, cancelled, or its session ends.
    pub fn is_active(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| lock(&shared).subscriptions.is_current(&self.destination, &self.id))
    }

    /// Cancel this subscription if it is still the live one for its destination.
    ///
    /// Returns `false` when it was already replaced or removed.
    pub fn unsubscribe(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| unsubscribe_entry(&shared, &self.destination, Some(&self.id)))
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("broker_url", &self.config.broker_url)
            .field("transport", &self.transport.name())
            .finish_non_exhaustive()
    }
}

// =============================================================
// Driver callbacks
// =============================================================

/// Handshake succeeded. Returns `false` if the attempt was superseded.
pub(crate) fn complete_attempt(shared: &Shared, id: u64, handshake: &Handshake) -> bool {
    let (attempt, observers, identity) = {
        let mut inner = lock(shared);
        let Some(attempt) = inner.attempt.take_if(|attempt| attempt.id == id) else {
            return false;
        };
        inner.state = ConnectionState::Connected;
        inner.handshake = Some(handshake.clone());
        (attempt, inner.on_connect.snapshot(), inner.identity.clone().unwrap_or_default())
    };

    let elapsed_ms = runtime::now_ms().saturating_sub(attempt.started_ms);
    tracing::info!(
        attempt = id,
        %identity,
        version = %handshake.version,
        elapsed_ms,
        reconnect = attempt.auto,
        "connected"
    );
    for observer in observers {
        observer(handshake);
    }
    for waiter in attempt.waiters {
        let _ = waiter.send(Ok(handshake.clone()));
    }
    true
}

/// Handshake failed, timed out, or the socket never opened.
pub(crate) fn fail_attempt(shared: &Arc<Shared>, id: u64, error: ClientError) {
    let (attempt, identity, epoch) = {
        let mut inner = lock(shared);
        let Some(attempt) = inner.attempt.take_if(|attempt| attempt.id == id) else {
            return;
        };
        drop(inner.link.take_if(|link| link.id == id));
        inner.state = ConnectionState::Disconnected;
        inner.handshake = None;
        (attempt, inner.identity.clone().unwrap_or_default(), inner.epoch)
    };

    tracing::warn!(attempt = id, %identity, %error, "connection attempt failed");
    for waiter in attempt.waiters {
        let _ = waiter.send(Err(error.clone()));
    }
    if attempt.auto {
        schedule_reconnect(shared, identity, epoch);
    }
}

/// An established session ended without `disconnect()`.
pub(crate) fn session_dropped(shared: &Arc<Shared>, id: u64, error: &ClientError) {
    let (observers, identity, epoch) = {
        let mut inner = lock(shared);
        if inner.link.take_if(|link| link.id == id).is_none() {
            return;
        }
        inner.state = ConnectionState::Disconnected;
        inner.handshake = None;
        inner.subscriptions.clear();
        (
            inner.on_disconnect.snapshot(),
            inner.identity.clone().unwrap_or_default(),
            inner.epoch,
        )
    };

    tracing::warn!(session = id, %identity, %error, "session dropped");
    for observer in observers {
        observer();
    }
    schedule_reconnect(shared, identity, epoch);
}

/// Handler for a `MESSAGE` frame's subscription id.
pub(crate) fn route_message(shared: &Shared, subscription: &str) -> Option<(String, Handler)> {
    lock(shared).subscriptions.route(subscription)
}

fn schedule_reconnect(shared: &Arc<Shared>, identity: String, epoch: u64) {
    let Some(delay) = shared.config.reconnect_delay() else {
        return;
    };
    tracing::info!(%identity, delay_ms = shared.config.reconnect_delay_ms, "reconnect scheduled");

    let shared = Arc::clone(shared);
    runtime::spawn(async move {
        runtime::sleep(delay).await;
        let launch = {
            let mut inner = lock(&shared);
            if inner.epoch != epoch || inner.state != ConnectionState::Disconnected {
                tracing::debug!(%identity, "reconnect superseded");
                return;
            }
            begin_attempt(&shared, &mut inner, &identity, true)
        };
        match launch {
            Ok(launch) => launch.spawn(),
            Err(err @ ClientError::Transport(TransportError::InvalidUrl { .. })) => {
                tracing::warn!(%identity, %err, "reconnect abandoned");
            }
            Err(err) => {
                tracing::warn!(%identity, %err, "reconnect could not start");
                schedule_reconnect(&shared, identity, epoch);
            }
        }
    });
}

// =============================================================
// Helpers
// =============================================================

fn lock(shared: &Shared) -> MutexGuard<'_, Inner> {
    shared
        .inner
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn next_observer_id(inner: &mut Inner) -> ObserverId {
    inner.next_observer_id += 1;
    ObserverId(inner.next_observer_id)
}

/// Broker URL with the `user` query parameter.
pub(crate) fn connect_url(broker_url: &str, identity: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(broker_url).map_err(|err| TransportError::InvalidUrl {
        url: broker_url.to_owned(),
        reason: err.to_string(),
    })?;
    url.query_pairs_mut().append_pair("user", identity);
    Ok(url)
}

/// Open a socket and record a new attempt. Caller holds the lock and spawns the launch.
fn begin_attempt(
    shared: &Arc<Shared>,
    inner: &mut Inner,
    identity: &str,
    auto: bool,
) -> Result<Launch, ClientError> {
    let url = connect_url(&shared.config.broker_url, identity)?;
    let socket = shared.transport.open(&url)?;
    let host = url.host_str().unwrap_or("localhost").to_owned();

    inner.next_attempt_id += 1;
    let id = inner.next_attempt_id;
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    inner.state = ConnectionState::Connecting;
    inner.identity = Some(identity.to_owned());
    inner.handshake = None;
    inner.attempt = Some(Attempt {
        id,
        started_ms: runtime::now_ms(),
        auto,
        waiters: Vec::new(),
    });
    inner.link = Some(Link {
        id,
        outbound: socket.outgoing.clone(),
        shutdown: shutdown_tx,
    });

    tracing::info!(attempt = id, identity, transport = shared.transport.name(), auto, "connecting");
    Ok(Launch {
        shared: Arc::clone(shared),
        id,
        host,
        url,
        socket,
        shutdown: shutdown_rx,
    })
}

fn connected_outbound(
    inner: &Inner,
    operation: &'static str,
    destination: &str,
) -> Option<mpsc::UnboundedSender<String>> {
    let outbound = inner
        .link
        .as_ref()
        .filter(|_| inner.state == ConnectionState::Connected)
        .map(|link| link.outbound.clone());
    if outbound.is_none() {
        let error = ClientError::OperationRejected {
            operation,
            state: inner.state,
        };
        tracing::warn!(%destination, %error, "not connected");
    }
    outbound
}

fn unsubscribe_entry(shared: &Shared, destination: &str, id: Option<&str>) -> bool {
    let mut inner = lock(shared);
    let removed = match id {
        Some(id) => inner.subscriptions.remove_if_current(destination, id),
        None => inner.subscriptions.remove(destination),
    };
    let Some(entry) = removed else {
        return false;
    };
    if let Some(link) = inner.link.as_ref().filter(|_| inner.state == ConnectionState::Connected) {
        let _ = link.outbound.unbounded_send(encode_frame(&Frame::unsubscribe(&entry.id)));
    }
    tracing::debug!(%destination, subscription = %entry.id, "unsubscribed");
    true
}
