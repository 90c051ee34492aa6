//! Consumer tests: routing, dispatch, subscription management.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use vibra_bus::events::{ReviewCreated, REVIEW_CREATED};
use vibra_bus::MemoryBroker;

use crate::support::{consumer_options, eventually, settle, Node, Recorder};

#[tokio::test]
async fn review_created_scenario() {
    let broker = MemoryBroker::new();
    let node = Node::start(&broker, consumer_options(3)).await;
    let recorder = Recorder::new();
    node.consumer
        .subscribe_fn("review.created", recorder.handler())
        .await
        .unwrap();

    let data = json!({ "reviewId": 1, "eventId": 42, "userId": "u1", "rating": 5 });
    assert!(node.publisher.publish("review.created", &data).await);

    assert!(eventually(|| node.consumer.stats().handled == 1).await);
    settle().await;
    assert_eq!(recorder.seen(), vec![data]);
    assert_eq!(broker.queue_depth("functions.review.created"), 0);
    assert_eq!(broker.unacked_count("functions.review.created"), 0);
    node.stop().await;
}

#[tokio::test]
async fn routing_is_by_exact_event_type() {
    let broker = MemoryBroker::new();
    let node = Node::start(&broker, consumer_options(3)).await;
    let reviews = Recorder::new();
    let interests = Recorder::new();
    node.consumer
        .subscribe_fn("review.created", reviews.handler())
        .await
        .unwrap();
    node.consumer
        .subscribe_fn("interest.marked", interests.handler())
        .await
        .unwrap();

    node.publisher
        .publish("review.created", &json!({ "reviewId": 1 }))
        .await;
    node.publisher
        .publish("review.created.v2", &json!({ "reviewId": 2 }))
        .await;

    assert!(eventually(|| reviews.count() == 1).await);
    settle().await;
    assert_eq!(reviews.count(), 1);
    assert_eq!(interests.count(), 0);
    node.stop().await;
}

#[tokio::test]
async fn wildcard_patterns_match_topic_words() {
    let broker = MemoryBroker::new();
    let node = Node::start(&broker, consumer_options(3)).await;
    let one_word = Recorder::new();
    let everything = Recorder::new();
    node.consumer
        .subscribe_fn("review.*", one_word.handler())
        .await
        .unwrap();
    node.consumer
        .subscribe_fn("#", everything.handler())
        .await
        .unwrap();

    for event_type in ["review.created", "review.deleted", "review.created.v2", "event.created"] {
        assert!(node.publisher.publish(event_type, &json!({ "type": event_type })).await);
    }

    assert!(eventually(|| everything.count() == 4).await);
    assert!(eventually(|| one_word.count() == 2).await);
    settle().await;
    assert_eq!(one_word.count(), 2);
    node.stop().await;
}

#[tokio::test]
async fn resubscribing_replaces_the_handler() {
    let broker = MemoryBroker::new();
    let node = Node::start(&broker, consumer_options(3)).await;
    let first = Recorder::new();
    let second = Recorder::new();
    node.consumer
        .subscribe_fn("event.created", first.handler())
        .await
        .unwrap();
    node.consumer
        .subscribe_fn("event.created", second.handler())
        .await
        .unwrap();

    node.publisher
        .publish("event.created", &json!({ "eventId": 1 }))
        .await;

    assert!(eventually(|| second.count() == 1).await);
    settle().await;
    assert_eq!(first.count(), 0);
    assert_eq!(node.consumer.subscriptions(), vec!["event.created".to_string()]);
    node.stop().await;
}

#[tokio::test]
async fn typed_subscription_decodes_payload() {
    let broker = MemoryBroker::new();
    let node = Node::start(&broker, consumer_options(3)).await;
    let ratings = Arc::new(AtomicUsize::new(0));
    let sum = ratings.clone();
    node.consumer
        .subscribe_typed(move |review: ReviewCreated, _ctx| {
            sum.fetch_add(usize::from(review.rating), Ordering::SeqCst);
            async { Ok(()) }
        })
        .await
        .unwrap();

    for rating in [3, 4] {
        node.publisher
            .publish(
                REVIEW_CREATED,
                &json!({ "reviewId": rating, "eventId": 42, "userId": "u1", "rating": rating }),
            )
            .await;
    }

    assert!(eventually(|| node.consumer.stats().handled == 2).await);
    assert_eq!(ratings.load(Ordering::SeqCst), 7);
    node.stop().await;
}

#[tokio::test]
async fn unsubscribed_events_wait_in_the_queue() {
    let broker = MemoryBroker::new();
    let node = Node::start(&broker, consumer_options(3)).await;
    let recorder = Recorder::new();
    node.consumer
        .subscribe_fn("interest.marked", recorder.handler())
        .await
        .unwrap();
    assert!(node.consumer.unsubscribe("interest.marked"));
    settle().await;

    node.publisher
        .publish("interest.marked", &json!({ "eventId": 1 }))
        .await;

    settle().await;
    assert_eq!(recorder.count(), 0);
    assert_eq!(broker.queue_depth("functions.interest.marked"), 1);
    node.stop().await;
}

#[tokio::test]
async fn context_reports_first_attempt() {
    let broker = MemoryBroker::new();
    let node = Node::start(&broker, consumer_options(3)).await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = attempts.clone();
    node.consumer
        .subscribe_fn("event.created", move |ctx| {
            seen.store(ctx.attempt() as usize, Ordering::SeqCst);
            let ok = !ctx.redelivered() && ctx.queue() == "functions.event.created";
            async move {
                if ok {
                    Ok(())
                } else {
                    Err(vibra_bus::HandlerError::Rejected("unexpected context".into()))
                }
            }
        })
        .await
        .unwrap();

    node.publisher
        .publish("event.created", &json!({ "eventId": 1 }))
        .await;

    assert!(eventually(|| node.consumer.stats().handled == 1).await);
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    node.stop().await;
}
