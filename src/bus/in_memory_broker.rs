//! In-memory broker for testing and single-process scenarios.
//!
//! This module provides a topic broker that implements both [`Transport`]
//! and [`Channel`], useful for:
//! - Unit and integration testing without a running RabbitMQ
//! - Single-process deployments where publisher and consumer share a process
//! - Rehearsing failure modes (broker down, connection severed)

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::channel::{Acker, Channel, Delivery, DeliveryStream, Transport, DEFAULT_EXCHANGE};
use super::message::Message;
use super::topic::topic_matches;
use crate::error::BusError;

/// Consumers re-check their queue at least this often while idle.
const IDLE_RECHECK: Duration = Duration::from_millis(25);

/// In-memory topic broker.
///
/// Features:
/// - Topic exchanges with `*` / `#` binding patterns, plus the default exchange
/// - Queues shared by any number of consumers (competing consumers)
/// - Ack, nack with or without requeue, prefetch limits
/// - Unacked deliveries return to the head of their queue when the channel closes
/// - Clone-friendly: every clone is the same broker
///
/// ## Example
///
/// ```
/// # tokio_test_block(async {
/// use futures::StreamExt;
/// use vibra_bus::bus::{Channel, MemoryBroker, Message, Transport};
///
/// let broker = MemoryBroker::new();
/// let channel = broker.open().await.unwrap();
/// channel.declare_topic_exchange("vibra_events", true).await.unwrap();
/// channel.declare_queue("functions.review.created", true).await.unwrap();
/// channel
///     .bind_queue("functions.review.created", "vibra_events", "review.created")
///     .await
///     .unwrap();
///
/// channel
///     .publish("vibra_events", "review.created", Message::json("evt-1", b"{}".to_vec()))
///     .await
///     .unwrap();
/// assert_eq!(broker.queue_depth("functions.review.created"), 1);
///
/// let mut deliveries = channel.consume("functions.review.created", "c1", 1).await.unwrap();
/// let delivery = deliveries.next().await.unwrap().unwrap();
/// delivery.ack().await.unwrap();
/// assert_eq!(broker.acknowledged(), vec!["evt-1".to_string()]);
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f);
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    unavailable: bool,
    exchanges: HashSet<String>,
    bindings: Vec<Binding>,
    queues: HashMap<String, QueueState>,
    channels: HashMap<u64, ChannelEntry>,
    next_channel_id: u64,
    next_delivery_tag: u64,
    connections_opened: usize,
    /// Message ids in ack order
    acknowledged: Vec<String>,
}

struct ChannelEntry {
    closed: CancellationToken,
    failed: Arc<AtomicBool>,
}

#[derive(Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    pattern: String,
    queue: String,
}

struct QueueState {
    durable: bool,
    ready: VecDeque<Queued>,
    unacked: HashMap<u64, Unacked>,
    notify: Arc<Notify>,
}

struct Queued {
    message: Message,
    routing_key: String,
    redelivered: bool,
}

struct Unacked {
    queued: Queued,
    channel_id: u64,
    consumer_tag: String,
}

impl QueueState {
    fn new(durable: bool) -> Self {
        Self {
            durable,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn in_flight(&self, channel_id: u64, consumer_tag: &str) -> usize {
        self.unacked
            .values()
            .filter(|u| u.channel_id == channel_id && u.consumer_tag == consumer_tag)
            .count()
    }
}

impl MemoryBroker {
    /// Create a new, empty, available broker.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `open()` fail (as if the broker were unreachable) or succeed again.
    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    /// Close every open channel from the broker side. Returns how many were closed.
    pub fn sever_connections(&self) -> usize {
        let mut state = self.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in &ids {
            state.close_channel(*id);
        }
        ids.len()
    }

    /// Close every open channel from the broker side without signalling it,
    /// the way a channel-level close can go unnoticed by a client whose
    /// connection stays up. Unacked deliveries return to their queues and
    /// the channels report `is_open() == false`, but their `closed()` tokens
    /// are left uncancelled. Returns how many channels were failed.
    pub fn fail_channels_silently(&self) -> usize {
        let mut state = self.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in &ids {
            if let Some(entry) = state.detach_channel(*id) {
                entry.failed.store(true, Ordering::SeqCst);
            }
        }
        ids.len()
    }

    /// Number of channels opened over the broker's lifetime.
    pub fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    /// Number of channels currently open.
    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    /// Messages ready for delivery on `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from `queue` but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Snapshot of the ready messages on `queue`, head first.
    pub fn messages(&self, queue: &str) -> Vec<Message> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.message.clone()).collect())
            .unwrap_or_default()
    }

    /// Declared queue names, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_durable(&self, queue: &str) -> bool {
        self.lock().queues.get(queue).is_some_and(|q| q.durable)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains(exchange)
    }

    pub fn has_binding(&self, queue: &str, exchange: &str, pattern: &str) -> bool {
        self.lock()
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == pattern)
    }

    /// Ids of acknowledged messages, in ack order.
    pub fn acknowledged(&self) -> Vec<String> {
        self.lock().acknowledged.clone()
    }

    /// Route a message as if published on a channel. Returns the number of
    /// queues it landed on.
    pub fn route(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<usize, BusError> {
        self.lock().route(exchange, routing_key, message)
    }

    fn take_next(&self, queue: &str, channel_id: u64, consumer_tag: &str, prefetch: u16) -> Option<Delivery> {
        let mut state = self.lock();
        if !state.channels.contains_key(&channel_id) {
            return None;
        }
        state.next_delivery_tag += 1;
        let tag = state.next_delivery_tag;

        let q = state.queues.get_mut(queue)?;
        if prefetch > 0 && q.in_flight(channel_id, consumer_tag) >= usize::from(prefetch) {
            return None;
        }
        let queued = q.ready.pop_front()?;

        let delivery = Delivery::new(
            queued.message.clone(),
            queued.routing_key.clone(),
            queued.redelivered,
            Box::new(MemoryAcker {
                broker: self.clone(),
                queue: queue.to_string(),
                tag,
            }),
        );
        q.unacked.insert(
            tag,
            Unacked {
                queued,
                channel_id,
                consumer_tag: consumer_tag.to_string(),
            },
        );
        Some(delivery)
    }
}

impl BrokerState {
    fn route(&mut self, exchange: &str, routing_key: &str, message: Message) -> Result<usize, BusError> {
        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            self.queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect()
        } else {
            if !self.exchanges.contains(exchange) {
                return Err(BusError::UnknownExchange(exchange.to_string()));
            }
            let mut targets: Vec<String> = Vec::new();
            for binding in &self.bindings {
                if binding.exchange == exchange
                    && topic_matches(&binding.pattern, routing_key)
                    && !targets.contains(&binding.queue)
                {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(Queued {
                    message: message.clone(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                });
                queue.notify.notify_one();
            }
        }
        Ok(targets.len())
    }

    fn close_channel(&mut self, channel_id: u64) {
        if let Some(entry) = self.detach_channel(channel_id) {
            entry.closed.cancel();
        }
    }

    /// Forget a channel and requeue its unacked deliveries.
    fn detach_channel(&mut self, channel_id: u64) -> Option<ChannelEntry> {
        let entry = self.channels.remove(&channel_id);
        for queue in self.queues.values_mut() {
            let mut tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| u.channel_id == channel_id)
                .map(|(tag, _)| *tag)
                .collect();
            // Highest tag first so push_front restores delivery order.
            tags.sort_unstable_by(|a, b| b.cmp(a));
            for tag in tags {
                if let Some(unacked) = queue.unacked.remove(&tag) {
                    let mut queued = unacked.queued;
                    queued.redelivered = true;
                    queue.ready.push_front(queued);
                    queue.notify.notify_one();
                }
            }
        }
        entry
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn open(&self) -> Result<Arc<dyn Channel>, BusError> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(BusError::Connection("memory broker unavailable".into()));
        }
        state.next_channel_id += 1;
        state.connections_opened += 1;
        let id = state.next_channel_id;
        let closed = CancellationToken::new();
        let failed = Arc::new(AtomicBool::new(false));
        state.channels.insert(
            id,
            ChannelEntry {
                closed: closed.clone(),
                failed: Arc::clone(&failed),
            },
        );

        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.clone(),
            closed,
            failed,
        }))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

/// A channel on a [`MemoryBroker`].
pub struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
    closed: CancellationToken,
    failed: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BusError> {
        if !self.is_open() {
            return Err(BusError::Channel(format!("channel {} is closed", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.failed.load(Ordering::SeqCst)
    }

    async fn declare_topic_exchange(&self, name: &str, _durable: bool) -> Result<(), BusError> {
        self.ensure_open()?;
        self.broker.lock().exchanges.insert(name.to_string());
        Ok(())
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BusError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        match state.queues.get(name) {
            Some(existing) if existing.durable != durable => Err(BusError::Channel(format!(
                "queue {} already declared with durable={}",
                name, existing.durable
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(name.to_string(), QueueState::new(durable));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BusError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.exchanges.contains(exchange) {
            return Err(BusError::UnknownExchange(exchange.to_string()));
        }
        if !state.queues.contains_key(queue) {
            return Err(BusError::UnknownQueue(queue.to_string()));
        }
        let binding = Binding {
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
            queue: queue.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        self.broker.route(exchange, routing_key, message).map(|_| ())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, BusError> {
        self.ensure_open()?;
        let notify = self
            .broker
            .lock()
            .queues
            .get(queue)
            .map(|q| Arc::clone(&q.notify))
            .ok_or_else(|| BusError::UnknownQueue(queue.to_string()))?;

        let cursor = Cursor {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            channel_id: self.id,
            consumer_tag: consumer_tag.to_string(),
            prefetch,
            closed: self.closed.clone(),
            failed: Arc::clone(&self.failed),
            notify,
        };

        let stream = futures::stream::unfold(cursor, |cursor| async move {
            loop {
                if cursor.closed.is_cancelled() || cursor.failed.load(Ordering::SeqCst) {
                    return None;
                }
                if let Some(delivery) = cursor.broker.take_next(
                    &cursor.queue,
                    cursor.channel_id,
                    &cursor.consumer_tag,
                    cursor.prefetch,
                ) {
                    return Some((Ok(delivery), cursor));
                }
                tokio::select! {
                    _ = cursor.notify.notified() => {}
                    _ = cursor.closed.cancelled() => return None,
                    _ = tokio::time::sleep(IDLE_RECHECK) => {}
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

struct Cursor {
    broker: MemoryBroker,
    queue: String,
    channel_id: u64,
    consumer_tag: String,
    prefetch: u16,
    closed: CancellationToken,
    failed: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self) -> Result<(BrokerGuard<'_>, Unacked), BusError> {
        let mut state = self.broker.lock();
        let unacked = state
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.unacked.remove(&self.tag))
            .ok_or_else(|| BusError::Channel(format!("unknown delivery tag {}", self.tag)))?;
        Ok((state, unacked))
    }
}

type BrokerGuard<'a> = MutexGuard<'a, BrokerState>;

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BusError> {
        let (mut state, unacked) = self.settle()?;
        state.acknowledged.push(unacked.queued.message.id);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BusError> {
        let (mut state, unacked) = self.settle()?;
        if requeue {
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                let mut queued = unacked.queued;
                queued.redelivered = true;
                queue.ready.push_front(queued);
                queue.notify.notify_one();
            }
        }
        Ok(())
    }
}
