//! Event bus - broker connection, publishing and consuming of domain events
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 BusClient (per process)                      │
//! │  - supervisor: open → declare exchange → wait for close      │
//! │  - ReconnectStrategy: FixedInterval / ExponentialBackoff     │
//! │  - announces each new channel to ChannelListeners            │
//! └──────────────────────────────────────────────────────────────┘
//!          │ channel()                         │ on_channel()
//!          ▼                                   ▼
//! ┌──────────────────────┐          ┌───────────────────────────┐
//! │   EventPublisher     │          │      EventConsumer        │
//! │  publish(type, data) │          │  subscribe(type, handler) │
//! │  → exchange, key =   │          │  queue <prefix>.<type>    │
//! │    event type        │          │  RedeliveryPolicy + DLQ   │
//! └──────────────────────┘          └───────────────────────────┘
//!          │                                   │
//!          ▼                                   ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │               Transport / Channel traits                     │
//! └──────────────────────────────────────────────────────────────┘
//!          │                                   │
//!          ▼                                   ▼
//! ┌──────────────────────┐          ┌───────────────────────────┐
//! │ AmqpTransport (lapin)│          │ MemoryBroker (in-process) │
//! └──────────────────────┘          └───────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let client = BusClient::new(MemoryBroker::new(), ClientOptions::default());
//! client.open();
//!
//! let consumer = EventConsumer::new(client.clone(), ConsumerOptions::default());
//! consumer
//!     .subscribe_typed(|review: ReviewCreated, _ctx| async move {
//!         println!("review {} rated {}", review.review_id, review.rating);
//!         Ok(())
//!     })
//!     .await?;
//!
//! let publisher = EventPublisher::new(client.clone());
//! publisher.publish("review.created", &json!({ "reviewId": 1, "eventId": 42, "userId": "u1", "rating": 5 })).await;
//! ```

#[cfg(feature = "amqp")]
mod amqp;
mod channel;
mod client;
mod consumer;
mod handler;
mod in_memory_broker;
mod message;
pub mod policy;
mod publisher;
mod topic;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpChannel, AmqpTransport};
pub use channel::{Acker, Channel, Delivery, DeliveryStream, Transport, DEFAULT_EXCHANGE};
pub use client::{
    BusClient, ChannelListener, ClientOptions, ConnectionState, DEFAULT_EXCHANGE_NAME,
    DEFAULT_HEALTH_CHECK,
};
pub use consumer::{
    ConsumerOptions, ConsumerStats, EventConsumer, DEAD_LETTER_SUFFIX, DEFAULT_SERVICE_PREFIX,
};
pub use handler::{EventContext, EventHandler, FnHandler, HandlerError, TypedHandler};
pub use in_memory_broker::{MemoryBroker, MemoryChannel};
pub use message::{
    Message, ATTEMPTS_HEADER, DEAD_LETTER_REASON_HEADER, JSON_CONTENT_TYPE,
    ORIGINAL_ROUTING_KEY_HEADER,
};
pub use policy::{
    BackoffPolicy, ExponentialBackoff, FixedInterval, JitterPolicy, ReconnectStrategy,
    Redelivery, RedeliveryPolicy,
};
pub use publisher::EventPublisher;
pub use topic::topic_matches;
