//! Event publisher: wraps payloads in envelopes and hands them to the exchange.

use serde::Serialize;
use tracing::{error, info, warn};

use super::client::BusClient;
use super::message::Message;
use crate::envelope::{validate_event_type, Envelope};
use crate::error::BusError;
use crate::events::{
    DomainEvent, Event, EventCreated, Interest, InterestMarked, Review, ReviewCreated,
    EVENT_CREATED, INTEREST_MARKED, REVIEW_CREATED,
};

/// Publishes domain events to the shared topic exchange.
///
/// Routing key = event type. Messages are persistent JSON; no broker
/// confirmation is awaited, so a successful publish means the channel
/// accepted the bytes, nothing more. With no active channel the event is
/// dropped.
#[derive(Clone, Debug)]
pub struct EventPublisher {
    client: BusClient,
}

impl EventPublisher {
    pub fn new(client: BusClient) -> Self {
        Self { client }
    }

    /// Publish `data` under `event_type`. Returns `false` if the event was
    /// not handed to the broker; the reason is logged.
    pub async fn publish<T: Serialize + ?Sized>(&self, event_type: &str, data: &T) -> bool {
        match self.try_publish(event_type, data).await {
            Ok(envelope) => {
                info!(event_type, event_id = %envelope.event_id, "event published");
                true
            }
            Err(BusError::NotConnected) => {
                warn!(event_type, "no broker channel, event dropped");
                false
            }
            Err(err) => {
                error!(event_type, error = %err, "failed to publish event");
                false
            }
        }
    }

    /// Like [`publish`](Self::publish), but returns the published envelope
    /// or the reason it was not published.
    pub async fn try_publish<T: Serialize + ?Sized>(
        &self,
        event_type: &str,
        data: &T,
    ) -> Result<Envelope, BusError> {
        validate_event_type(event_type)?;
        let channel = self.client.channel().ok_or(BusError::NotConnected)?;

        let envelope = Envelope::new(event_type, serde_json::to_value(data)?);
        let message = Message::json(envelope.event_id.clone(), envelope.encode()?);
        channel
            .publish(self.client.exchange(), event_type, message)
            .await?;
        Ok(envelope)
    }

    pub async fn publish_domain(&self, event: &DomainEvent) -> bool {
        match event.to_data() {
            Ok(data) => self.publish(event.event_type(), &data).await,
            Err(err) => {
                error!(event_type = event.event_type(), error = %err, "failed to serialize event");
                false
            }
        }
    }

    pub async fn publish_event_created(&self, event: &Event) -> bool {
        self.publish(EVENT_CREATED, &EventCreated::from(event)).await
    }

    pub async fn publish_review_created(&self, review: &Review) -> bool {
        self.publish(REVIEW_CREATED, &ReviewCreated::from(review))
            .await
    }

    pub async fn publish_interest_marked(&self, interest: &Interest) -> bool {
        self.publish(INTEREST_MARKED, &InterestMarked::from(interest))
            .await
    }
}
