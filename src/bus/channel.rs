//! Broker seam: transports open channels, channels move messages.
//!
//! ```text
//! ┌──────────────┐  open()   ┌─────────────────────────────────────────┐
//! │  Transport   │ ────────▶ │ Channel                                 │
//! │ (AMQP / mem) │           │  declare_topic_exchange / declare_queue │
//! └──────────────┘           │  bind_queue / publish / consume         │
//!                            │  close / closed()                       │
//!                            └─────────────────────────────────────────┘
//!                                             │ consume()
//!                                             ▼
//!                                  Stream<Item = Delivery>
//!                                  Delivery::ack() / nack(requeue)
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use super::message::Message;
use crate::error::BusError;

/// The broker's nameless exchange: routing key = queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Opens channels to a broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a fresh connection and channel.
    async fn open(&self) -> Result<Arc<dyn Channel>, BusError>;

    /// Human-readable target for logs (credentials redacted).
    fn describe(&self) -> String;
}

/// One open channel to the broker.
///
/// All declarations are idempotent: repeating one with identical
/// parameters is a no-op.
#[async_trait]
pub trait Channel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn declare_topic_exchange(&self, name: &str, durable: bool) -> Result<(), BusError>;

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BusError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BusError>;

    /// Hand a message to the broker. Returns once the client has written it;
    /// no broker confirmation is awaited.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), BusError>;

    /// Start consuming `queue`. At most `prefetch` deliveries are in flight
    /// (delivered but not yet acked) on this consumer.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, BusError>;

    /// Close the channel. Unacked deliveries return to their queues.
    async fn close(&self) -> Result<(), BusError>;

    /// Token cancelled once the channel is closed, by either side.
    fn closed(&self) -> CancellationToken;
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BusError>>;

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BusError>;

    async fn nack(&self, requeue: bool) -> Result<(), BusError>;
}

/// A message received from a queue, awaiting ack or nack.
pub struct Delivery {
    pub message: Message,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// The broker has delivered this message before.
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

impl Delivery {
    pub fn new(
        message: Message,
        routing_key: impl Into<String>,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            message,
            routing_key: routing_key.into(),
            redelivered,
            acker,
        }
    }

    /// Remove the message from its queue.
    pub async fn ack(&self) -> Result<(), BusError> {
        self.acker.ack().await
    }

    /// Reject the message, optionally putting it back on its queue.
    pub async fn nack(&self, requeue: bool) -> Result<(), BusError> {
        self.acker.nack(requeue).await
    }
}
