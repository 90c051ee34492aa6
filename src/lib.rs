//! Domain event bus of the VIBRA platform.
//!
//! - [`bus`]: broker connection manager, publisher, consumer, transports
//! - [`events`]: typed payloads of the platform's event types
//! - [`functions`]: the functions service handlers
//! - [`config`] / [`logging`]: ambient setup for binaries

pub mod bus;
pub mod config;
mod envelope;
mod error;
pub mod events;
pub mod functions;
pub mod logging;

pub use bus::{
    BusClient, ClientOptions, ConnectionState, ConsumerOptions, ConsumerStats, EventConsumer,
    EventContext, EventHandler, EventPublisher, HandlerError, MemoryBroker, RedeliveryPolicy,
};
#[cfg(feature = "amqp")]
pub use bus::AmqpTransport;
pub use config::{BusConfig, ConfigError};
pub use envelope::{validate_binding_pattern, validate_event_type, Envelope};
pub use error::{BusError, Result};
pub use events::{DomainEvent, DomainEventKind, EventRegistry};
