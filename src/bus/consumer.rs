//! Event consumer: one durable queue per subscription, handler dispatch,
//! bounded redelivery and dead-lettering.
//!
//! Subscriptions are registry state. Whenever the [`BusClient`] establishes
//! a channel, every registered subscription is declared, bound and consumed
//! again, so callers subscribe once for the lifetime of the consumer.
//!
//! ```text
//!   delivery ──▶ decode envelope ──▶ handler
//!                     │ fails           │
//!                     ▼                 ├─ Ok ──────────────────────▶ ack
//!                dead-letter            └─ Err ─▶ RedeliveryPolicy
//!                                                   ├─ Requeue ────▶ nack(requeue)
//!                                                   ├─ Retry ──────▶ republish(attempts + 1), ack
//!                                                   └─ DeadLetter ─▶ <queue>.dead-letter, ack
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel::{Channel, Delivery, DeliveryStream, DEFAULT_EXCHANGE};
use super::client::{BusClient, ChannelListener};
use super::handler::{EventContext, EventHandler, FnHandler, HandlerError, TypedHandler};
use super::message::{ATTEMPTS_HEADER, DEAD_LETTER_REASON_HEADER, ORIGINAL_ROUTING_KEY_HEADER};
use super::policy::{Redelivery, RedeliveryPolicy};
use crate::envelope::{validate_binding_pattern, Envelope};
use crate::error::BusError;
use crate::events::{DomainEventKind, EventRegistry};

/// Prefix of every queue this consumer declares.
pub const DEFAULT_SERVICE_PREFIX: &str = "functions";
/// Suffix appended to a queue name to form its dead-letter queue.
pub const DEAD_LETTER_SUFFIX: &str = "dead-letter";

/// Options for [`EventConsumer`].
#[derive(Clone, Debug)]
pub struct ConsumerOptions {
    /// Queues are named `<service_prefix>.<event_type>`.
    pub service_prefix: String,
    /// Maximum unacked deliveries (and concurrent handler calls) per
    /// subscription. `0` means unlimited.
    pub prefetch: u16,
    pub redelivery: RedeliveryPolicy,
    pub registry: Arc<EventRegistry>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            service_prefix: DEFAULT_SERVICE_PREFIX.to_string(),
            prefetch: 10,
            redelivery: RedeliveryPolicy::default(),
            registry: Arc::new(EventRegistry::standard()),
        }
    }
}

impl ConsumerOptions {
    pub fn with_service_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.service_prefix = prefix.into();
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_redelivery(mut self, redelivery: RedeliveryPolicy) -> Self {
        self.redelivery = redelivery;
        self
    }

    pub fn with_registry(mut self, registry: EventRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }
}

/// Counters since the consumer was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Deliveries taken from the broker.
    pub received: u64,
    /// Deliveries handled successfully and acked.
    pub handled: u64,
    /// Handler invocations that returned an error.
    pub failed: u64,
    /// Failed deliveries requeued or republished for another attempt.
    pub retried: u64,
    /// Deliveries moved to a dead-letter queue.
    pub dead_lettered: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    handled: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            received: self.received.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

struct Subscription {
    queue: String,
    dead_letter_queue: String,
    handler: Arc<dyn EventHandler>,
}

/// A consumer task bound to one channel.
struct Runner {
    channel: usize,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// Subscribes handlers to event types.
///
/// Each subscription gets a durable queue `<prefix>.<event_type>` bound to the
/// shared exchange with the event type as binding pattern (which may use the
/// `*` / `#` wildcards), plus a durable dead-letter queue. Consumers with the
/// same prefix share queues and split the messages between them.
#[derive(Clone)]
pub struct EventConsumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    me: Weak<ConsumerInner>,
    client: BusClient,
    options: ConsumerOptions,
    subscriptions: RwLock<HashMap<String, Subscription>>,
    runners: Mutex<HashMap<String, Runner>>,
    starting: tokio::sync::Mutex<()>,
    counters: Counters,
    shutdown: CancellationToken,
}

impl EventConsumer {
    /// Create a consumer and register it for channel announcements.
    pub fn new(client: BusClient, options: ConsumerOptions) -> Self {
        let inner = Arc::new_cyclic(|me| ConsumerInner {
            me: me.clone(),
            client: client.clone(),
            options,
            subscriptions: RwLock::new(HashMap::new()),
            runners: Mutex::new(HashMap::new()),
            starting: tokio::sync::Mutex::new(()),
            counters: Counters::default(),
            shutdown: CancellationToken::new(),
        });
        let listener: Weak<dyn ChannelListener> = Arc::downgrade(&inner) as Weak<dyn ChannelListener>;
        client.add_listener(listener);
        Self { inner }
    }

    /// Register `handler` for `event_type`, replacing any previous handler.
    ///
    /// With an active channel the queue is declared, bound and consumed
    /// now; otherwise that happens as soon as the client connects. Returns
    /// an error for a malformed pattern, after shutdown, or when the broker
    /// rejects the declarations (the subscription stays registered and is
    /// retried on the next channel).
    pub async fn subscribe(
        &self,
        event_type: &str,
        handler: impl EventHandler,
    ) -> Result<(), BusError> {
        validate_binding_pattern(event_type)?;
        if self.inner.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }

        let subscription = Subscription {
            queue: self.queue_name(event_type),
            dead_letter_queue: self.dead_letter_queue_name(event_type),
            handler: Arc::new(handler),
        };
        let replaced = write(&self.inner.subscriptions)
            .insert(event_type.to_string(), subscription)
            .is_some();
        if replaced {
            info!(event_type, "handler replaced");
        }

        match self.inner.client.channel() {
            Some(channel) => self.inner.start(event_type, channel).await,
            None => {
                warn!(event_type, "not connected, subscription starts once connected");
                Ok(())
            }
        }
    }

    /// Subscribe an async closure.
    pub async fn subscribe_fn<F, Fut>(&self, event_type: &str, f: F) -> Result<(), BusError>
    where
        F: Fn(EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.subscribe(event_type, FnHandler(f)).await
    }

    /// Subscribe to `E::EVENT_TYPE` with a handler taking the decoded payload.
    pub async fn subscribe_typed<E, F, Fut>(&self, f: F) -> Result<(), BusError>
    where
        E: DomainEventKind,
        F: Fn(E, EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.subscribe(E::EVENT_TYPE, TypedHandler::<E, F>::new(f))
            .await
    }

    /// Remove a subscription and stop its consumer. The queue stays.
    pub fn unsubscribe(&self, event_type: &str) -> bool {
        let removed = write(&self.inner.subscriptions).remove(event_type).is_some();
        if let Some(runner) = lock(&self.inner.runners).remove(event_type) {
            runner.stop.cancel();
        }
        if removed {
            info!(event_type, "unsubscribed");
        }
        removed
    }

    /// Event types with a registered handler.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut types: Vec<String> = read(&self.inner.subscriptions).keys().cloned().collect();
        types.sort();
        types
    }

    pub fn queue_name(&self, event_type: &str) -> String {
        format!("{}.{}", self.inner.options.service_prefix, event_type)
    }

    pub fn dead_letter_queue_name(&self, event_type: &str) -> String {
        format!("{}.{}", self.queue_name(event_type), DEAD_LETTER_SUFFIX)
    }

    pub fn stats(&self) -> ConsumerStats {
        self.inner.counters.snapshot()
    }

    /// Stop taking deliveries and wait up to `grace` for in-flight handlers.
    ///
    /// Handlers still running after `grace` are aborted. Their deliveries
    /// are never acked and return to the queue when the channel closes.
    /// A delivery waiting out a retry delay is nacked back onto its queue.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutdown.cancel();
        let runners: Vec<(String, Runner)> = lock(&self.inner.runners).drain().collect();
        let deadline = tokio::time::Instant::now() + grace;

        for (event_type, mut runner) in runners {
            if tokio::time::timeout_at(deadline, &mut runner.handle)
                .await
                .is_err()
            {
                warn!(event_type = %event_type, "handlers still running after grace period, aborting");
                runner.handle.abort();
            }
        }
        info!(stats = ?self.stats(), "consumer stopped");
    }
}

impl ConsumerInner {
    fn subscription(&self, event_type: &str) -> Option<(String, String, Arc<dyn EventHandler>)> {
        read(&self.subscriptions).get(event_type).map(|s| {
            (
                s.queue.clone(),
                s.dead_letter_queue.clone(),
                Arc::clone(&s.handler),
            )
        })
    }

    /// Declare, bind and consume `event_type` on `channel`, unless a consumer
    /// for it already runs there.
    async fn start(&self, event_type: &str, channel: Arc<dyn Channel>) -> Result<(), BusError> {
        let Some(me) = self.me.upgrade() else {
            return Err(BusError::Closed);
        };
        let _starting = self.starting.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }
        let key = channel_key(&channel);
        {
            let runners = lock(&self.runners);
            if let Some(runner) = runners.get(event_type) {
                if runner.channel == key && !runner.handle.is_finished() {
                    return Ok(());
                }
            }
        }
        let Some((queue, dead_letter_queue, _)) = self.subscription(event_type) else {
            return Ok(());
        };

        channel.declare_queue(&queue, true).await?;
        channel.declare_queue(&dead_letter_queue, true).await?;
        channel
            .bind_queue(&queue, self.client.exchange(), event_type)
            .await?;
        let consumer_tag = format!("{}-{}", self.options.service_prefix, Uuid::new_v4());
        let deliveries = channel
            .consume(&queue, &consumer_tag, self.options.prefetch)
            .await?;

        let stop = self.shutdown.child_token();
        let handle = tokio::spawn(run(
            me,
            event_type.to_string(),
            Arc::clone(&channel),
            deliveries,
            stop.clone(),
        ));
        let previous = lock(&self.runners).insert(
            event_type.to_string(),
            Runner {
                channel: key,
                stop,
                handle,
            },
        );
        if let Some(previous) = previous {
            previous.stop.cancel();
        }
        info!(event_type, queue = %queue, prefetch = self.options.prefetch, "subscribed");
        Ok(())
    }

    async fn dispatch(
        &self,
        event_type: &str,
        channel: &Arc<dyn Channel>,
        delivery: Delivery,
        stop: &CancellationToken,
    ) {
        Counters::bump(&self.counters.received);

        let Some((queue, dead_letter_queue, handler)) = self.subscription(event_type) else {
            debug!(event_type, "no handler registered, requeueing");
            settle(delivery.nack(true).await, event_type);
            return;
        };

        let envelope = match Envelope::decode(&delivery.message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(queue = %queue, message_id = %delivery.message.id, error = %err, "undecodable message");
                self.dead_letter(channel, &dead_letter_queue, delivery, &format!("malformed envelope: {err}"))
                    .await;
                return;
            }
        };

        let failures = delivery.message.attempts();
        let event_id = envelope.event_id.clone();
        debug!(event_type = %envelope.event_type, event_id = %event_id, attempt = failures + 1, "event received");

        let ctx = EventContext::new(
            envelope,
            queue.clone(),
            failures + 1,
            delivery.redelivered,
            Arc::clone(&self.options.registry),
        );

        let err = match handler.handle(ctx).await {
            Ok(()) => {
                match delivery.ack().await {
                    Ok(()) => {
                        Counters::bump(&self.counters.handled);
                        info!(event_type, event_id = %event_id, "event processed");
                    }
                    Err(err) => warn!(event_id = %event_id, error = %err, "ack failed, event will be redelivered"),
                }
                return;
            }
            Err(err) => err,
        };

        Counters::bump(&self.counters.failed);
        let failures = failures.saturating_add(1);

        match self.options.redelivery.decide(failures, err.is_retryable()) {
            Redelivery::Requeue => {
                warn!(event_id = %event_id, error = %err, "handler failed, requeueing");
                Counters::bump(&self.counters.retried);
                settle(delivery.nack(true).await, &event_id);
            }
            Redelivery::Retry { delay } => {
                warn!(
                    event_id = %event_id,
                    error = %err,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    "handler failed, retrying"
                );
                tokio::select! {
                    _ = stop.cancelled() => {
                        settle(delivery.nack(true).await, &event_id);
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                let mut retry = delivery.message.clone();
                retry.set_metadata(ATTEMPTS_HEADER, failures.to_string());
                if retry.metadata(ORIGINAL_ROUTING_KEY_HEADER).is_none() {
                    retry.set_metadata(ORIGINAL_ROUTING_KEY_HEADER, delivery.routing_key.clone());
                }
                match channel.publish(DEFAULT_EXCHANGE, &queue, retry).await {
                    Ok(()) => {
                        Counters::bump(&self.counters.retried);
                        settle(delivery.ack().await, &event_id);
                    }
                    Err(publish_err) => {
                        warn!(event_id = %event_id, error = %publish_err, "retry publish failed, requeueing");
                        settle(delivery.nack(true).await, &event_id);
                    }
                }
            }
            Redelivery::DeadLetter => {
                error!(event_id = %event_id, error = %err, attempts = failures, "handler failed, dead-lettering");
                self.dead_letter(channel, &dead_letter_queue, delivery, &err.to_string())
                    .await;
            }
        }
    }

    async fn dead_letter(
        &self,
        channel: &Arc<dyn Channel>,
        dead_letter_queue: &str,
        delivery: Delivery,
        reason: &str,
    ) {
        let mut message = delivery.message.clone();
        message.set_metadata(DEAD_LETTER_REASON_HEADER, reason);
        if message.metadata(ORIGINAL_ROUTING_KEY_HEADER).is_none() {
            message.set_metadata(ORIGINAL_ROUTING_KEY_HEADER, delivery.routing_key.clone());
        }
        let message_id = message.id.clone();

        match channel
            .publish(DEFAULT_EXCHANGE, dead_letter_queue, message)
            .await
        {
            Ok(()) => {
                Counters::bump(&self.counters.dead_lettered);
                error!(message_id = %message_id, queue = %dead_letter_queue, reason, "message dead-lettered");
                settle(delivery.ack().await, &message_id);
            }
            Err(err) => {
                error!(message_id = %message_id, error = %err, "dead-letter publish failed, requeueing");
                settle(delivery.nack(true).await, &message_id);
            }
        }
    }
}

#[async_trait]
impl ChannelListener for ConsumerInner {
    async fn on_channel(&self, channel: Arc<dyn Channel>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let event_types: Vec<String> = read(&self.subscriptions).keys().cloned().collect();
        for event_type in event_types {
            if let Err(err) = self.start(&event_type, Arc::clone(&channel)).await {
                error!(event_type = %event_type, error = %err, "failed to resubscribe");
            }
        }
    }
}

async fn run(
    inner: Arc<ConsumerInner>,
    event_type: String,
    channel: Arc<dyn Channel>,
    deliveries: DeliveryStream,
    stop: CancellationToken,
) {
    let limit = match inner.options.prefetch {
        0 => None,
        n => Some(usize::from(n)),
    };
    let intake = stop.clone();

    deliveries
        .take_until(async move { intake.cancelled().await })
        .for_each_concurrent(limit, |item| {
            let inner = Arc::clone(&inner);
            let channel = Arc::clone(&channel);
            let event_type = event_type.as_str();
            let stop = &stop;
            async move {
                match item {
                    Ok(delivery) => inner.dispatch(event_type, &channel, delivery, stop).await,
                    Err(err) => warn!(event_type, error = %err, "delivery stream error"),
                }
            }
        })
        .await;

    debug!(event_type = %event_type, "consumer stopped");
}

fn settle(result: Result<(), BusError>, id: &str) {
    if let Err(err) = result {
        warn!(id, error = %err, "failed to settle delivery");
    }
}

fn channel_key(channel: &Arc<dyn Channel>) -> usize {
    Arc::as_ptr(channel) as *const () as usize
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
