//! Broker connection manager.
//!
//! A [`BusClient`] owns one logical connection and channel. A supervisor
//! task opens the channel, declares the shared topic exchange, announces the
//! channel to listeners and waits for it to close; on failure it waits for
//! the delay chosen by the [`ReconnectStrategy`] and starts over. A channel
//! found closed by the periodic health check counts as closed.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::{Channel, Transport};
use super::policy::{FixedInterval, ReconnectStrategy};
use crate::error::BusError;

/// Name of the platform's shared topic exchange.
pub const DEFAULT_EXCHANGE_NAME: &str = "vibra_events";
/// How often a connected supervisor checks that its channel is still open.
pub const DEFAULT_HEALTH_CHECK: Duration = Duration::from_secs(1);

/// Lifecycle of a [`BusClient`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and no attempt in progress (before `open`, or while
    /// waiting to retry).
    Disconnected,
    Connecting,
    /// A channel is open and every listener has seen it.
    Connected,
    /// The reconnect strategy gave up; call [`BusClient::reconnect`].
    CircuitOpen,
    /// [`BusClient::close`] was called. Terminal.
    Closed,
}

/// Notified with every newly established channel.
#[async_trait]
pub trait ChannelListener: Send + Sync {
    async fn on_channel(&self, channel: Arc<dyn Channel>);
}

/// Options for [`BusClient`].
#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub exchange: String,
    pub reconnect: Arc<dyn ReconnectStrategy>,
    pub health_check: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE_NAME.to_string(),
            reconnect: Arc::new(FixedInterval::default()),
            health_check: DEFAULT_HEALTH_CHECK,
        }
    }
}

impl ClientOptions {
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_reconnect(mut self, strategy: impl ReconnectStrategy + 'static) -> Self {
        self.reconnect = Arc::new(strategy);
        self
    }

    pub fn with_health_check(mut self, interval: Duration) -> Self {
        self.health_check = interval;
        self
    }
}

/// Handle to the broker connection. Clones share the same connection.
///
/// ```ignore
/// let client = BusClient::new(AmqpTransport::new(url), ClientOptions::default());
/// client.open();
/// let publisher = EventPublisher::new(client.clone());
/// let consumer = EventConsumer::new(client.clone(), ConsumerOptions::default());
/// // ...
/// client.close().await;
/// ```
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    exchange: String,
    reconnect: Arc<dyn ReconnectStrategy>,
    health_check: Duration,
    channel: RwLock<Option<Arc<dyn Channel>>>,
    state: watch::Sender<ConnectionState>,
    listeners: Mutex<Vec<Weak<dyn ChannelListener>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for BusClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusClient")
            .field("broker", &self.inner.transport.describe())
            .field("exchange", &self.inner.exchange)
            .field("state", &self.state())
            .finish()
    }
}

impl BusClient {
    /// Build a client. Nothing connects until [`open`](Self::open).
    pub fn new(transport: impl Transport, options: ClientOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                transport: Arc::new(transport),
                exchange: options.exchange,
                reconnect: options.reconnect,
                health_check: options.health_check,
                channel: RwLock::new(None),
                state,
                listeners: Mutex::new(Vec::new()),
                supervisor: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Start connecting in the background. Never fails: connection errors are
    /// logged and retried by the supervisor. Calling it again while the
    /// supervisor runs does nothing.
    pub fn open(&self) {
        if self.inner.shutdown.is_cancelled() {
            warn!(broker = %self.inner.transport.describe(), "open called on a closed bus client");
            return;
        }
        let mut supervisor = lock(&self.inner.supervisor);
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *supervisor = Some(tokio::spawn(supervise(inner)));
    }

    /// Restart the supervisor after the circuit opened. No-op while it runs.
    pub fn reconnect(&self) {
        if self.state() == ConnectionState::CircuitOpen {
            info!(broker = %self.inner.transport.describe(), "circuit reset, reconnecting");
        }
        self.open();
    }

    /// The active channel, if connected.
    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.inner
            .channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|c| c.is_open())
            .cloned()
    }

    pub fn is_connected(&self) -> bool {
        self.channel().is_some()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Wait until connected. Returns `false` on timeout.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.watch_state();
        let connected = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == ConnectionState::Connected)).await,
            Ok(Ok(_))
        );
        connected
    }

    /// Name of the shared topic exchange.
    pub fn exchange(&self) -> &str {
        &self.inner.exchange
    }

    /// Register a listener for new channels. The client holds it weakly.
    pub fn add_listener(&self, listener: Weak<dyn ChannelListener>) {
        let mut listeners = lock(&self.inner.listeners);
        listeners.retain(|l| l.strong_count() > 0);
        listeners.push(listener);
    }

    /// Stop the supervisor and close the channel.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let supervisor = lock(&self.inner.supervisor).take();
        if let Some(handle) = supervisor {
            if let Err(err) = handle.await {
                warn!(error = %err, "bus supervisor ended abnormally");
            }
        }
        if let Some(channel) = self.inner.take_channel() {
            if let Err(err) = channel.close().await {
                warn!(error = %err, "closing broker channel failed");
            }
        }
        self.inner.set_state(ConnectionState::Closed);
        info!(broker = %self.inner.transport.describe(), "bus client closed");
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn take_channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn connect(&self) -> Result<Arc<dyn Channel>, BusError> {
        let channel = self.transport.open().await?;
        if let Err(err) = channel.declare_topic_exchange(&self.exchange, true).await {
            let _ = channel.close().await;
            return Err(err);
        }
        Ok(channel)
    }

    async fn notify_listeners(&self, channel: &Arc<dyn Channel>) {
        let listeners: Vec<Arc<dyn ChannelListener>> = {
            let mut listeners = lock(&self.listeners);
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.on_channel(Arc::clone(channel)).await;
        }
    }
}

async fn supervise(inner: Arc<Inner>) {
    let broker = inner.transport.describe();
    let mut failures: u32 = 0;

    loop {
        if inner.shutdown.is_cancelled() {
            return;
        }
        inner.set_state(ConnectionState::Connecting);
        debug!(%broker, "connecting to broker");

        match inner.connect().await {
            Ok(channel) => {
                failures = 0;
                *inner.channel.write().unwrap_or_else(PoisonError::into_inner) =
                    Some(Arc::clone(&channel));
                info!(%broker, exchange = %inner.exchange, "connected to broker");
                // Connected is only reported once subscriptions are replayed.
                inner.notify_listeners(&channel).await;
                inner.set_state(ConnectionState::Connected);

                let closed = channel.closed();
                let mut health = tokio::time::interval(inner.health_check.max(Duration::from_millis(1)));
                health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => return,
                        _ = closed.cancelled() => {
                            warn!(%broker, "broker connection closed");
                            break;
                        }
                        _ = health.tick() => {
                            // A channel can die without its close being signalled.
                            if !channel.is_open() {
                                warn!(%broker, "broker channel no longer open");
                                break;
                            }
                        }
                    }
                }
                inner.take_channel();
                if let Err(err) = channel.close().await {
                    debug!(%broker, error = %err, "releasing dead channel failed");
                }
                inner.set_state(ConnectionState::Disconnected);
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                error!(%broker, error = %err, failures, "broker connection failed");
                inner.set_state(ConnectionState::Disconnected);
            }
        }

        let Some(delay) = inner.reconnect.next_delay(failures) else {
            error!(%broker, failures, "reconnect attempts exhausted, circuit open");
            inner.set_state(ConnectionState::CircuitOpen);
            return;
        };
        info!(%broker, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
