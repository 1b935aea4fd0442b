//! Real-time relay channel.
//!
//! One logical connection to the relay, shared by every consumer in the
//! client. The channel manages:
//!
//! - identity: resolved before connecting so outgoing frames are attributable,
//! - scope: the active battle key tags outgoing frames and filters inbound
//!   ones,
//! - delivery: inbound frames are decoded once and handed to every subscriber
//!   synchronously, in registration order,
//! - liveness: a heartbeat while connected, and a single delayed reconnect
//!   attempt after an unexpected close.
//!
//! ## Reconnection
//!
//! Exactly one reconnect attempt is scheduled per unexpected close, after
//! [`ChannelConfig::reconnect_delay`]. A failed attempt is not retried; the
//! consumer decides when to call [`Channel::connect`] again. An explicit
//! [`Channel::disconnect`] never schedules a reconnect.

mod envelope;
mod local;
mod transport;

pub use envelope::{Envelope, MessageKind, OutboundMessage};
pub use local::LocalRelay;
pub use transport::{Connection, Connector, WebSocketConnector};

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::ChannelError;
use crate::identity::IdentityProvider;
use crate::key::BattleKey;

/// Receives every inbound message in scope. Errors are logged, not propagated.
pub type MessageHandler = Arc<dyn Fn(&Envelope) -> anyhow::Result<()> + Send + Sync>;
/// Receives `true` on connect and `false` on disconnect.
pub type ConnectionListener = Arc<dyn Fn(bool) + Send + Sync>;

/// Connection settings for a [`Channel`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
}

impl From<&ClientConfig> for ChannelConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            url: config.relay_url.clone(),
            connect_timeout: config.connect_timeout,
            heartbeat_interval: config.heartbeat_interval,
            reconnect_delay: config.reconnect_delay,
        }
    }
}

/// Callbacks in registration order, addressable by id for removal.
struct Registry<T> {
    next_id: u64,
    entries: Vec<(u64, T)>,
}

impl<T: Clone> Registry<T> {
    fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    fn add(&mut self, entry: T) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, entry));
        id
    }

    fn remove(&mut self, id: u64) {
        self.entries.retain(|(entry_id, _)| *entry_id != id);
    }

    fn snapshot(&self) -> Vec<T> {
        self.entries.iter().map(|(_, entry)| entry.clone()).collect()
    }
}

/// The live connection and the tasks bound to it.
#[derive(Default)]
struct Link {
    /// Present iff connected.
    outbound: Option<mpsc::UnboundedSender<String>>,
    /// Bumped on every attach and explicit disconnect; tasks of an older
    /// generation are ignored when they report back.
    generation: u64,
    pump: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    last_error: Option<String>,
}

impl Link {
    fn abort_tasks(&mut self) {
        for task in [self.pump.take(), self.heartbeat.take(), self.reconnect.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

struct Inner {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    identity: Arc<dyn IdentityProvider>,
    user_id: Mutex<Option<String>>,
    battle_id: Mutex<Option<BattleKey>>,
    link: Mutex<Link>,
    handlers: Mutex<Registry<MessageHandler>>,
    listeners: Mutex<Registry<ConnectionListener>>,
}

/// Handle to the relay channel. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

/// Non-owning reference to a [`Channel`], for callbacks the channel itself
/// holds on to.
#[derive(Clone)]
pub struct WeakChannel(Weak<Inner>);

impl WeakChannel {
    pub fn upgrade(&self) -> Option<Channel> {
        self.0.upgrade().map(|inner| Channel { inner })
    }
}

impl Channel {
    pub fn new(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                identity,
                user_id: Mutex::new(None),
                battle_id: Mutex::new(None),
                link: Mutex::new(Link::default()),
                handlers: Mutex::new(Registry::new()),
                listeners: Mutex::new(Registry::new()),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakChannel {
        WeakChannel(Arc::downgrade(&self.inner))
    }

    pub fn is_connected(&self) -> bool {
        self.inner.link.lock().outbound.is_some()
    }

    /// The identity frames are sent under, once resolved.
    pub fn user_id(&self) -> Option<String> {
        self.inner.user_id.lock().clone()
    }

    pub fn battle_id(&self) -> Option<BattleKey> {
        self.inner.battle_id.lock().clone()
    }

    /// Last connection or send failure, cleared on a successful connect.
    pub fn connection_error(&self) -> Option<String> {
        self.inner.link.lock().last_error.clone()
    }

    /// Resolve identity and open the relay connection.
    ///
    /// A no-op when already connected. Fails after
    /// [`ChannelConfig::connect_timeout`].
    pub async fn connect(&self) -> Result<(), ChannelError> {
        if self.is_connected() {
            return Ok(());
        }
        let conn = self.inner.open().await?;
        self.inner.attach(conn, None);
        Ok(())
    }

    /// Close the connection and cancel heartbeat and reconnect timers.
    pub fn disconnect(&self) {
        let was_connected = {
            let mut link = self.inner.link.lock();
            link.generation += 1;
            link.abort_tasks();
            link.outbound.take().is_some()
        };
        if was_connected {
            tracing::info!(url = %self.inner.config.url, "Disconnected from voting relay");
            self.inner.notify_listeners(false);
        }
    }

    /// Send a message scoped to the current battle.
    ///
    /// When not connected this only logs a warning. Transmission failures are
    /// recorded in [`Channel::connection_error`].
    pub fn send(&self, message: OutboundMessage) {
        self.inner.send(&message);
    }

    /// Scope the channel to `key`: outgoing frames carry it, and inbound
    /// frames scoped to any other battle are dropped.
    pub fn set_battle_id(&self, key: BattleKey) {
        let changed = {
            let mut current = self.inner.battle_id.lock();
            let changed = current.as_ref() != Some(&key);
            *current = Some(key.clone());
            changed
        };
        if changed && !key.is_empty() && self.is_connected() {
            self.inner.send(&OutboundMessage::JoinBattle { battle_id: key });
        }
    }

    /// Register a handler for every inbound message in scope.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.handlers.lock().add(Arc::new(handler));
        Subscription {
            inner: Arc::downgrade(&self.inner),
            id,
            target: Target::Messages,
        }
    }

    /// Register a listener for connected/disconnected transitions.
    pub fn on_connection_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = self.inner.listeners.lock().add(Arc::new(listener));
        Subscription {
            inner: Arc::downgrade(&self.inner),
            id,
            target: Target::Connection,
        }
    }
}

impl Inner {
    async fn resolve_identity(&self) -> Result<String, ChannelError> {
        if let Some(id) = self.user_id.lock().clone() {
            return Ok(id);
        }
        let id = self.identity.resolve().await?;
        *self.user_id.lock() = Some(id.clone());
        Ok(id)
    }

    async fn open(&self) -> Result<Connection, ChannelError> {
        self.resolve_identity().await?;
        let url = self.config.url.clone();
        let timeout = self.config.connect_timeout;
        let result = tokio::time::timeout(timeout, self.connector.connect(&url)).await;
        let err = match result {
            Ok(Ok(conn)) => return Ok(conn),
            Ok(Err(e)) => ChannelError::ConnectionFailed {
                url,
                reason: format!("{e:#}"),
            },
            Err(_) => ChannelError::Timeout {
                url,
                secs: timeout.as_secs(),
            },
        };
        tracing::warn!("{err}");
        self.link.lock().last_error = Some(err.to_string());
        Err(err)
    }

    /// Install `conn` as the live link. With `expected`, the attach only
    /// happens if nothing connected or disconnected since that generation.
    fn attach(self: &Arc<Self>, conn: Connection, expected: Option<u64>) -> bool {
        let Connection { outbound, inbound } = conn;
        let was_connected = {
            let mut link = self.link.lock();
            if expected.is_some_and(|generation| generation != link.generation) {
                return false;
            }
            link.abort_tasks();
            link.generation += 1;
            let weak = Arc::downgrade(self);
            link.pump = Some(spawn_pump(weak.clone(), inbound, link.generation));
            link.heartbeat = Some(spawn_heartbeat(weak, self.config.heartbeat_interval));
            link.last_error = None;
            link.outbound.replace(outbound).is_some()
        };

        tracing::info!(url = %self.config.url, "Connected to voting relay");
        if !was_connected {
            self.notify_listeners(true);
        }
        let battle = self.battle_id.lock().clone();
        if let Some(key) = battle.filter(|k| !k.is_empty()) {
            self.send(&OutboundMessage::JoinBattle { battle_id: key });
        }
        true
    }

    fn on_closed(self: &Arc<Self>, generation: u64) {
        let delay = self.config.reconnect_delay;
        {
            let mut link = self.link.lock();
            if link.generation != generation {
                return;
            }
            link.outbound = None;
            link.pump = None;
            if let Some(heartbeat) = link.heartbeat.take() {
                heartbeat.abort();
            }
            link.last_error = Some("Connection lost".to_string());
            if link.reconnect.is_none() {
                link.reconnect = Some(spawn_reconnect(Arc::downgrade(self), delay));
            }
        }
        tracing::warn!(url = %self.config.url, "Connection to voting relay lost; reconnecting in {delay:?}");
        self.notify_listeners(false);
    }

    fn send(&self, message: &OutboundMessage) {
        let Some(outbound) = self.link.lock().outbound.clone() else {
            tracing::warn!(kind = message.kind().as_str(), "Relay not connected; message not sent");
            return;
        };
        let user_id = self.user_id.lock().clone().unwrap_or_default();
        let scope = match message {
            OutboundMessage::Heartbeat => None,
            _ => self.battle_id.lock().clone(),
        };
        let frame = Envelope::wrap(message, scope.as_ref(), &user_id, now_ms())
            .and_then(|envelope| serde_json::to_string(&envelope));
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(kind = message.kind().as_str(), "Failed to encode relay message: {e}");
                self.link.lock().last_error = Some(format!("Send failed: {e}"));
                return;
            }
        };
        if outbound.send(frame).is_err() {
            tracing::warn!(kind = message.kind().as_str(), "Relay connection closed while sending");
            self.link.lock().last_error = Some("Send failed: connection closed".to_string());
        }
    }

    fn dispatch(&self, frame: &str) {
        let envelope: Envelope = match serde_json::from_str(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Dropping malformed relay message: {e}");
                return;
            }
        };
        if envelope.kind == MessageKind::Heartbeat {
            return;
        }
        if let Some(scope) = envelope.scope() {
            let in_scope = self
                .battle_id
                .lock()
                .as_ref()
                .is_some_and(|current| current.as_str() == scope);
            if !in_scope {
                tracing::debug!(scope, kind = envelope.kind.as_str(), "Dropping message for another battle");
                return;
            }
        }

        let handlers = self.handlers.lock().snapshot();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&envelope))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(kind = envelope.kind.as_str(), "Message handler failed: {e:#}");
                }
                Err(_) => {
                    tracing::error!(kind = envelope.kind.as_str(), "Message handler panicked");
                }
            }
        }
    }

    fn notify_listeners(&self, connected: bool) {
        let listeners = self.listeners.lock().snapshot();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(connected))).is_err() {
                tracing::error!(connected, "Connection listener panicked");
            }
        }
    }
}

fn spawn_pump(
    inner: Weak<Inner>,
    mut inbound: mpsc::UnboundedReceiver<String>,
    generation: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = inbound.recv().await {
            let Some(inner) = inner.upgrade() else { return };
            inner.dispatch(&frame);
        }
        if let Some(inner) = inner.upgrade() {
            inner.on_closed(generation);
        }
    })
}

fn spawn_heartbeat(inner: Weak<Inner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut ticker = tokio::time::interval_at(start, period);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else { return };
            inner.send(&OutboundMessage::Heartbeat);
        }
    })
}

fn spawn_reconnect(inner: Weak<Inner>, delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let Some(inner) = inner.upgrade() else { return };
        let generation = {
            let mut link = inner.link.lock();
            // Detach our own handle so a successful attach doesn't abort us.
            link.reconnect = None;
            link.generation
        };
        tracing::info!(url = %inner.config.url, "Reconnecting to voting relay");
        match inner.open().await {
            Ok(conn) => {
                if !inner.attach(conn, Some(generation)) {
                    tracing::debug!("Channel changed during reconnect; dropping new connection");
                }
            }
            Err(e) => tracing::warn!("Reconnect failed: {e}"),
        }
    })
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

enum Target {
    Messages,
    Connection,
}

/// Registration returned by [`Channel::subscribe`] and
/// [`Channel::on_connection_change`]. Dropping it unregisters.
#[must_use = "dropping a Subscription unregisters it immediately"]
pub struct Subscription {
    inner: Weak<Inner>,
    id: u64,
    target: Target,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else { return };
        match self.target {
            Target::Messages => inner.handlers.lock().remove(self.id),
            Target::Connection => inner.listeners.lock().remove(self.id),
        }
    }
}
