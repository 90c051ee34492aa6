//! Publisher tests: envelopes, ids, disconnected behaviour.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde_json::json;
use vibra_bus::bus::JSON_CONTENT_TYPE;
use vibra_bus::events::{Event, Interest, InterestStatus};
use vibra_bus::{Envelope, EventPublisher, MemoryBroker};

use crate::support::{self, consumer_options, eventually, settle, Node, Recorder};

#[tokio::test]
async fn event_ids_are_pairwise_distinct() {
    let broker = MemoryBroker::new();
    let client = support::connected(&broker).await;
    let publisher = EventPublisher::new(client.clone());

    let mut ids = HashSet::new();
    for n in 0..500 {
        let envelope = publisher
            .try_publish("event.created", &json!({ "n": n }))
            .await
            .unwrap();
        assert!(ids.insert(envelope.event_id), "duplicate event id");
    }
    assert_eq!(ids.len(), 500);
    client.close().await;
}

#[tokio::test]
async fn delivered_envelope_round_trips() {
    let broker = MemoryBroker::new();
    let node = Node::start(&broker, consumer_options(3)).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    node.consumer
        .subscribe_fn("event.created", move |ctx| {
            sink.lock().unwrap().push(ctx.envelope().clone());
            async { Ok(()) }
        })
        .await
        .unwrap();

    let data = json!({ "eventId": 1, "name": "Jazz", "nested": { "tags": ["a", "b"], "n": 1.5 } });
    let published = node.publisher.try_publish("event.created", &data).await.unwrap();

    assert!(eventually(|| seen.lock().unwrap().len() == 1).await);
    let received = seen.lock().unwrap()[0].clone();
    assert_eq!(received, published);
    assert_eq!(received.data, data);
    node.stop().await;
}

#[tokio::test]
async fn messages_are_persistent_json() {
    let broker = MemoryBroker::new();
    let client = support::connected(&broker).await;
    let channel = client.channel().unwrap();
    channel.declare_queue("tap", true).await.unwrap();
    channel.bind_queue("tap", "vibra_events", "#").await.unwrap();

    let publisher = EventPublisher::new(client.clone());
    let envelope = publisher
        .try_publish("interest.marked", &json!({ "eventId": 3 }))
        .await
        .unwrap();

    let message = &broker.messages("tap")[0];
    assert!(message.persistent);
    assert_eq!(message.content_type.as_deref(), Some(JSON_CONTENT_TYPE));
    assert_eq!(message.id, envelope.event_id);
    let wire: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
    assert_eq!(wire["eventType"], "interest.marked");
    assert!(wire["timestamp"].is_string());
    assert_eq!(Envelope::decode(&message.payload).unwrap(), envelope);
    client.close().await;
}

#[tokio::test]
async fn publish_while_disconnected_reaches_no_queue() {
    let broker = MemoryBroker::new();
    let node = Node::start(&broker, consumer_options(3)).await;
    let recorder = Recorder::new();
    node.consumer
        .subscribe_fn("event.created", recorder.handler())
        .await
        .unwrap();

    // Never opened, so never connected.
    let offline = EventPublisher::new(support::client(&broker));
    assert!(!offline.publish("event.created", &json!({ "eventId": 1 })).await);

    settle().await;
    assert_eq!(recorder.count(), 0);
    assert_eq!(broker.queue_depth("functions.event.created"), 0);
    node.stop().await;
}

#[tokio::test]
async fn projections_use_canonical_payloads() {
    let broker = MemoryBroker::new();
    let node = Node::start(&broker, consumer_options(3)).await;
    let recorder = Recorder::new();
    node.consumer
        .subscribe_fn("#", recorder.handler())
        .await
        .unwrap();

    let event = Event {
        id: 42,
        name: "Jazz Night".into(),
        description: Some("not projected".into()),
        organizer_id: "org-1".into(),
        category: Some("music".into()),
        location: Some("Lisbon".into()),
        start_date: Some("2026-11-01T20:00:00Z".into()),
    };
    assert!(node.publisher.publish_event_created(&event).await);
    let interest = Interest {
        event_id: 42,
        user_id: "u2".into(),
        status: InterestStatus::Going,
    };
    assert!(node.publisher.publish_interest_marked(&interest).await);

    assert!(eventually(|| recorder.count() == 2).await);
    let seen = recorder.seen();
    assert_eq!(
        seen[0],
        json!({
            "eventId": 42,
            "name": "Jazz Night",
            "organizerId": "org-1",
            "category": "music",
            "location": "Lisbon",
            "startDate": "2026-11-01T20:00:00Z"
        })
    );
    assert_eq!(seen[1], json!({ "eventId": 42, "userId": "u2", "status": "going" }));
    node.stop().await;
}
