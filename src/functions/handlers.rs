//! Handlers of the functions service.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use super::notifications::{notification_id, Notification, NotificationKind, NotificationSink, BROADCAST};
use super::stats::StatsStore;
use crate::bus::{EventConsumer, EventContext, HandlerError};
use crate::error::BusError;
use crate::events::{EventCreated, InterestMarked, ReviewCreated};

/// Reacts to platform events: keeps the stats read model current and
/// notifies organizers.
#[derive(Clone)]
pub struct FunctionHandlers {
    stats: Arc<dyn StatsStore>,
    notifications: Arc<dyn NotificationSink>,
}

impl FunctionHandlers {
    pub fn new(stats: impl StatsStore + 'static, notifications: impl NotificationSink + 'static) -> Self {
        Self {
            stats: Arc::new(stats),
            notifications: Arc::new(notifications),
        }
    }

    /// Subscribe all three handlers on `consumer`.
    pub async fn register(&self, consumer: &EventConsumer) -> Result<(), BusError> {
        let handlers = self.clone();
        consumer
            .subscribe_typed(move |event: EventCreated, ctx: EventContext| {
                let handlers = handlers.clone();
                async move { handlers.on_event_created(event, &ctx).await }
            })
            .await?;

        let handlers = self.clone();
        consumer
            .subscribe_typed(move |review: ReviewCreated, ctx: EventContext| {
                let handlers = handlers.clone();
                async move { handlers.on_review_created(review, &ctx).await }
            })
            .await?;

        let handlers = self.clone();
        consumer
            .subscribe_typed(move |interest: InterestMarked, ctx: EventContext| {
                let handlers = handlers.clone();
                async move { handlers.on_interest_marked(interest, &ctx).await }
            })
            .await?;
        Ok(())
    }

    pub async fn on_event_created(&self, event: EventCreated, ctx: &EventContext) -> Result<(), HandlerError> {
        info!(event_id = event.event_id, name = %event.name, "processing event.created");
        self.stats.record_event(event.event_id, &event.organizer_id)?;

        let message = match &event.location {
            Some(location) => format!("New event: {} in {}", event.name, location),
            None => format!("New event: {}", event.name),
        };
        let notification = Notification::new(
            notification_id(ctx.event_id(), BROADCAST),
            NotificationKind::NewEvent,
            BROADCAST,
            "New event",
            message,
        )
        .with_event_id(event.event_id)
        .with_data(json!({ "eventId": event.event_id, "category": event.category }));
        self.notify(notification)
    }

    pub async fn on_review_created(&self, review: ReviewCreated, ctx: &EventContext) -> Result<(), HandlerError> {
        info!(event_id = review.event_id, review_id = review.review_id, "processing review.created");
        if !(1..=5).contains(&review.rating) {
            return Err(HandlerError::Rejected(format!(
                "rating {} outside 1..=5",
                review.rating
            )));
        }

        let stats = self
            .stats
            .upsert_review(review.event_id, review.review_id, review.rating)?;
        info!(
            event_id = review.event_id,
            average_rating = stats.average_rating.unwrap_or_default(),
            total_reviews = stats.total_reviews,
            "event rating updated"
        );

        let Some(organizer) = self.stats.organizer(review.event_id)? else {
            debug!(event_id = review.event_id, "organizer unknown, no notification");
            return Ok(());
        };
        let notification = Notification::new(
            notification_id(ctx.event_id(), &organizer),
            NotificationKind::NewReview,
            organizer,
            "New review",
            format!("Your event received a {}-star review!", review.rating),
        )
        .with_event_id(review.event_id)
        .with_data(json!({
            "eventId": review.event_id,
            "reviewId": review.review_id,
            "rating": review.rating,
        }));
        self.notify(notification)
    }

    pub async fn on_interest_marked(&self, interest: InterestMarked, ctx: &EventContext) -> Result<(), HandlerError> {
        info!(event_id = interest.event_id, status = interest.status.as_str(), "processing interest.marked");
        let totals = self
            .stats
            .upsert_interest(interest.event_id, &interest.user_id, interest.status)?;
        info!(
            event_id = interest.event_id,
            total_interested = totals.total_interested,
            total_going = totals.total_going,
            "event interest updated"
        );

        let Some(organizer) = self.stats.organizer(interest.event_id)? else {
            debug!(event_id = interest.event_id, "organizer unknown, no notification");
            return Ok(());
        };
        let notification = Notification::new(
            notification_id(ctx.event_id(), &organizer),
            NotificationKind::NewInterest,
            organizer,
            "New interest",
            format!("Someone marked \"{}\" for your event!", interest.status.as_str()),
        )
        .with_event_id(interest.event_id)
        .with_data(json!({
            "eventId": interest.event_id,
            "status": interest.status,
            "totalInterested": totals.total_interested,
            "totalGoing": totals.total_going,
        }));
        self.notify(notification)
    }

    fn notify(&self, notification: Notification) -> Result<(), HandlerError> {
        let id = notification.id.clone();
        let user_id = notification.user_id.clone();
        if self.notifications.send(notification)? {
            info!(notification_id = %id, user_id = %user_id, "notification sent");
        } else {
            debug!(notification_id = %id, "notification already sent");
        }
        Ok(())
    }
}
