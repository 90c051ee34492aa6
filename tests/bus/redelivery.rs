//! Failure handling: retries, the attempts header, dead-letter queues.

use std::sync::{Arc, Mutex};

use serde_json::json;
use vibra_bus::bus::{
    Message, ATTEMPTS_HEADER, DEAD_LETTER_REASON_HEADER, ORIGINAL_ROUTING_KEY_HEADER,
};
use vibra_bus::{ConsumerOptions, EventConsumer, EventContext, HandlerError, MemoryBroker, RedeliveryPolicy};

use crate::support::{consumer_options, eventually, settle, Node};

const QUEUE: &str = "functions.review.created";
const DEAD_LETTERS: &str = "functions.review.created.dead-letter";

/// Fails the first `failures` calls with `error`, then succeeds.
/// Returns the (attempt, redelivered) pairs it was called with.
async fn flaky(
    consumer: &EventConsumer,
    failures: usize,
    error: fn() -> HandlerError,
) -> Arc<Mutex<Vec<(u32, bool)>>> {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let log = calls.clone();
    consumer
        .subscribe_fn("review.created", move |ctx: EventContext| {
            let n = {
                let mut log = log.lock().unwrap();
                log.push((ctx.attempt(), ctx.redelivered()));
                log.len()
            };
            async move {
                if n <= failures {
                    Err(error())
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();
    calls
}

fn unavailable() -> HandlerError {
    HandlerError::Unavailable("database down".into())
}

fn rejected() -> HandlerError {
    HandlerError::Rejected("rating out of range".into())
}

#[tokio::test]
async fn reject_then_succeed_is_handled_once() {
    let broker = MemoryBroker::new();
    let node = Node::start(&broker, consumer_options(5)).await;
    let calls = flaky(&node.consumer, 1, unavailable).await;

    let envelope = node
        .publisher
        .try_publish("review.created", &json!({ "reviewId": 1 }))
        .await
        .unwrap();

    assert!(eventually(|| node.consumer.stats().handled == 1).await);
    settle().await;
    assert_eq!(*calls.lock().unwrap(), vec![(1, false), (2, false)]);
    // Two broker messages carry the event: the failed original is acked once
    // its retry copy is queued, and the copy is acked after it is handled.
    let acks = broker
        .acknowledged()
        .into_iter()
        .filter(|id| *id == envelope.event_id)
        .count();
    assert_eq!(acks, 2);

    let stats = node.consumer.stats();
    assert_eq!(stats.handled, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.dead_lettered, 0);
    assert_eq!(broker.queue_depth(QUEUE), 0);
    assert_eq!(broker.unacked_count(QUEUE), 0);
    assert_eq!(broker.queue_depth(DEAD_LETTERS), 0);
    node.stop().await;
}

#[tokio::test]
async fn requeue_policy_redelivers_same_message() {
    let broker = MemoryBroker::new();
    let options = ConsumerOptions::default().with_redelivery(RedeliveryPolicy::Requeue);
    let node = Node::start(&broker, options).await;
    let calls = flaky(&node.consumer, 1, unavailable).await;

    let envelope = node
        .publisher
        .try_publish("review.created", &json!({ "reviewId": 1 }))
        .await
        .unwrap();

    assert!(eventually(|| node.consumer.stats().handled == 1).await);
    settle().await;
    // Requeued copies keep no counter; the broker flags the redelivery.
    assert_eq!(*calls.lock().unwrap(), vec![(1, false), (1, true)]);
    let acked: Vec<String> = broker
        .acknowledged()
        .into_iter()
        .filter(|id| *id == envelope.event_id)
        .collect();
    assert_eq!(acked.len(), 1);
    node.stop().await;
}

#[tokio::test]
async fn persistent_failure_is_dead_lettered_after_max_attempts() {
    let broker = MemoryBroker::new();
    let node = Node::start(&broker, consumer_options(3)).await;
    let calls = flaky(&node.consumer, usize::MAX, unavailable).await;

    let envelope = node
        .publisher
        .try_publish("review.created", &json!({ "reviewId": 1 }))
        .await
        .unwrap();

    assert!(eventually(|| broker.queue_depth(DEAD_LETTERS) == 1).await);
    settle().await;
    let attempts: Vec<u32> = calls.lock().unwrap().iter().map(|(a, _)| *a).collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let dead = &broker.messages(DEAD_LETTERS)[0];
    assert_eq!(dead.id, envelope.event_id);
    assert_eq!(dead.metadata(ATTEMPTS_HEADER), Some("2"));
    assert_eq!(dead.metadata(ORIGINAL_ROUTING_KEY_HEADER), Some("review.created"));
    assert_eq!(
        dead.metadata(DEAD_LETTER_REASON_HEADER),
        Some("unavailable: database down")
    );
    assert_eq!(vibra_bus::Envelope::decode(&dead.payload).unwrap(), envelope);

    let stats = node.consumer.stats();
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.handled, 0);
    assert_eq!(broker.queue_depth(QUEUE), 0);
    node.stop().await;
}

#[tokio::test]
async fn rejected_events_skip_retries() {
    let broker = MemoryBroker::new();
    let node = Node::start(&broker, consumer_options(5)).await;
    let calls = flaky(&node.consumer, usize::MAX, rejected).await;

    node.publisher
        .publish("review.created", &json!({ "reviewId": 1 }))
        .await;

    assert!(eventually(|| broker.queue_depth(DEAD_LETTERS) == 1).await);
    settle().await;
    assert_eq!(calls.lock().unwrap().len(), 1);
    assert_eq!(
        broker.messages(DEAD_LETTERS)[0].metadata(DEAD_LETTER_REASON_HEADER),
        Some("rejected: rating out of range")
    );
    node.stop().await;
}

#[tokio::test]
async fn poison_message_goes_straight_to_dead_letters() {
    let broker = MemoryBroker::new();
    let node = Node::start(&broker, consumer_options(5)).await;
    let calls = flaky(&node.consumer, 0, unavailable).await;

    let channel = node.client.channel().unwrap();
    channel
        .publish(
            "vibra_events",
            "review.created",
            Message::json("poison-1", b"{ not json".to_vec()),
        )
        .await
        .unwrap();

    assert!(eventually(|| broker.queue_depth(DEAD_LETTERS) == 1).await);
    settle().await;
    assert!(calls.lock().unwrap().is_empty());
    let dead = &broker.messages(DEAD_LETTERS)[0];
    assert_eq!(dead.id, "poison-1");
    assert!(dead
        .metadata(DEAD_LETTER_REASON_HEADER)
        .is_some_and(|reason| reason.starts_with("malformed envelope")));
    assert_eq!(broker.queue_depth(QUEUE), 0);
    assert_eq!(node.consumer.stats().dead_lettered, 1);
    node.stop().await;
}

#[tokio::test]
async fn other_messages_keep_flowing_around_a_failing_one() {
    let broker = MemoryBroker::new();
    let node = Node::start(&broker, consumer_options(3)).await;
    let handled = Arc::new(Mutex::new(Vec::new()));
    let log = handled.clone();
    node.consumer
        .subscribe_fn("review.created", move |ctx: EventContext| {
            let review_id = ctx.raw_data()["reviewId"].as_i64().unwrap_or_default();
            let log = log.clone();
            async move {
                if review_id == 1 {
                    return Err(HandlerError::Unavailable("flaky".into()));
                }
                log.lock().unwrap().push(review_id);
                Ok(())
            }
        })
        .await
        .unwrap();

    for review_id in 1..=3 {
        node.publisher
            .publish("review.created", &json!({ "reviewId": review_id }))
            .await;
    }

    assert!(eventually(|| broker.queue_depth(DEAD_LETTERS) == 1).await);
    assert!(eventually(|| handled.lock().unwrap().len() == 2).await);
    let mut ok = handled.lock().unwrap().clone();
    ok.sort_unstable();
    assert_eq!(ok, vec![2, 3]);
    node.stop().await;
}
