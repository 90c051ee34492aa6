//! Event handlers and the context they receive.

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::envelope::Envelope;
use crate::events::{DecodeError, DomainEvent, DomainEventKind, EventRegistry};

/// Error returned by an event handler.
///
/// Any error means the message was not processed. The consumer's redelivery
/// policy retries retryable errors and dead-letters the rest.
#[derive(Debug)]
pub enum HandlerError {
    /// Payload decode / deserialization failed.
    DecodeFailed(String),
    /// Business logic rejected the event (validation, invariant violation).
    Rejected(String),
    /// A record the event refers to does not exist (yet).
    NotFound(String),
    /// A dependency is temporarily unavailable.
    Unavailable(String),
    /// Other error.
    Other(Box<dyn Error + Send + Sync>),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::DecodeFailed(msg) => write!(f, "decode failed: {}", msg),
            HandlerError::Rejected(msg) => write!(f, "rejected: {}", msg),
            HandlerError::NotFound(id) => write!(f, "not found: {}", id),
            HandlerError::Unavailable(msg) => write!(f, "unavailable: {}", msg),
            HandlerError::Other(e) => write!(f, "handler error: {}", e),
        }
    }
}

impl Error for HandlerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            HandlerError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::DecodeFailed(err.to_string())
    }
}

impl From<DecodeError> for HandlerError {
    fn from(err: DecodeError) -> Self {
        HandlerError::DecodeFailed(err.to_string())
    }
}

impl HandlerError {
    pub fn other(err: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        HandlerError::Other(err.into())
    }

    /// Whether trying the same message again can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, HandlerError::DecodeFailed(_) | HandlerError::Rejected(_))
    }
}

/// Everything a handler knows about the delivery it is processing.
#[derive(Debug, Clone)]
pub struct EventContext {
    envelope: Envelope,
    queue: String,
    attempt: u32,
    redelivered: bool,
    registry: Arc<EventRegistry>,
}

impl EventContext {
    pub(crate) fn new(
        envelope: Envelope,
        queue: String,
        attempt: u32,
        redelivered: bool,
        registry: Arc<EventRegistry>,
    ) -> Self {
        Self {
            envelope,
            queue,
            attempt,
            redelivered,
            registry,
        }
    }

    /// Deserialize the payload into a typed struct.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        T::deserialize(&self.envelope.data).map_err(HandlerError::from)
    }

    pub fn raw_data(&self) -> &Value {
        &self.envelope.data
    }

    /// Decode the payload through the consumer's registry.
    pub fn domain_event(&self) -> Result<DomainEvent, HandlerError> {
        Ok(self
            .registry
            .decode(&self.envelope.event_type, &self.envelope.data)?)
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn event_id(&self) -> &str {
        &self.envelope.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.envelope.event_type
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.envelope.timestamp
    }

    /// Queue the message was consumed from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// 1 on the first delivery, incremented by every failed attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The broker flagged this delivery as a redelivery.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }
}

/// Processes events of one subscription.
///
/// Handlers must be idempotent: delivery is at-least-once.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: EventContext) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: EventHandler + ?Sized> EventHandler for Arc<H> {
    async fn handle(&self, ctx: EventContext) -> Result<(), HandlerError> {
        (**self).handle(ctx).await
    }
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: EventContext) -> Result<(), HandlerError> {
        (self.0)(ctx).await
    }
}

/// Decodes the payload as `E` before calling the closure.
pub struct TypedHandler<E, F> {
    f: F,
    _kind: PhantomData<fn() -> E>,
}

impl<E, F> TypedHandler<E, F> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<E, F, Fut> EventHandler for TypedHandler<E, F>
where
    E: DomainEventKind,
    F: Fn(E, EventContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: EventContext) -> Result<(), HandlerError> {
        let payload = ctx.data::<E>()?;
        (self.f)(payload, ctx).await
    }
}
