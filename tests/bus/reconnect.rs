//! Connection loss, resubscription and the reconnect circuit.

use std::time::Duration;

use serde_json::json;
use vibra_bus::bus::FixedInterval;
use vibra_bus::{BusClient, ClientOptions, ConnectionState, EventConsumer, EventPublisher, MemoryBroker};

use crate::support::{self, consumer_options, eventually, Node, Recorder, TIMEOUT};

#[tokio::test]
async fn subscriptions_are_replayed_after_connection_loss() {
    let broker = MemoryBroker::new();
    let node = Node::start(&broker, consumer_options(3)).await;
    let recorder = Recorder::new();
    node.consumer
        .subscribe_fn("review.created", recorder.handler())
        .await
        .unwrap();

    assert_eq!(broker.sever_connections(), 1);
    assert!(!node.publisher.publish("review.created", &json!({ "reviewId": 0 })).await);

    assert!(eventually(|| broker.connections_opened() == 2 && node.client.is_connected()).await);
    assert!(node.client.wait_connected(TIMEOUT).await);
    assert!(node.publisher.publish("review.created", &json!({ "reviewId": 1 })).await);

    assert!(eventually(|| recorder.count() == 1).await);
    assert_eq!(recorder.seen(), vec![json!({ "reviewId": 1 })]);
    node.stop().await;
}

#[tokio::test]
async fn channel_closed_without_signal_is_replaced() {
    let broker = MemoryBroker::new();
    let client = BusClient::new(
        broker.clone(),
        ClientOptions::default()
            .with_reconnect(FixedInterval::new(Duration::from_millis(10)))
            .with_health_check(Duration::from_millis(10)),
    );
    client.open();
    assert!(client.wait_connected(TIMEOUT).await);
    let consumer = EventConsumer::new(client.clone(), consumer_options(3));
    let recorder = Recorder::new();
    consumer
        .subscribe_fn("review.created", recorder.handler())
        .await
        .unwrap();
    let publisher = EventPublisher::new(client.clone());

    assert_eq!(broker.fail_channels_silently(), 1);
    assert!(!publisher.publish("review.created", &json!({ "reviewId": 0 })).await);

    assert!(eventually(|| broker.connections_opened() == 2 && client.is_connected()).await);
    assert!(client.wait_connected(TIMEOUT).await);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert!(publisher.publish("review.created", &json!({ "reviewId": 1 })).await);

    assert!(eventually(|| recorder.count() == 1).await);
    assert_eq!(recorder.seen(), vec![json!({ "reviewId": 1 })]);
    consumer.shutdown(Duration::from_millis(100)).await;
    client.close().await;
}

#[tokio::test]
async fn unacked_deliveries_survive_connection_loss() {
    let broker = MemoryBroker::new();
    let node = Node::start(&broker, consumer_options(3)).await;
    let release = std::sync::Arc::new(tokio::sync::Notify::new());
    let gate = release.clone();
    let recorder = Recorder::new();
    let seen = recorder.clone();
    node.consumer
        .subscribe_fn("event.created", move |ctx| {
            seen.record(&ctx);
            let gate = gate.clone();
            let first = seen.count() == 1;
            async move {
                if first {
                    // Hold the first delivery until the connection is gone.
                    gate.notified().await;
                }
                Ok(())
            }
        })
        .await
        .unwrap();

    node.publisher
        .publish("event.created", &json!({ "eventId": 1 }))
        .await;
    assert!(eventually(|| recorder.count() == 1).await);

    broker.sever_connections();
    release.notify_one();

    // The ack on the dead channel fails; the broker redelivers on the new one.
    assert!(eventually(|| recorder.count() == 2).await);
    assert!(eventually(|| node.consumer.stats().handled == 1).await);
    assert_eq!(recorder.seen()[1], json!({ "eventId": 1 }));
    node.stop().await;
}

#[tokio::test]
async fn subscribe_before_broker_is_up() {
    let broker = MemoryBroker::new();
    broker.set_available(false);
    let client = support::client(&broker);
    let consumer = EventConsumer::new(client.clone(), consumer_options(3));
    let recorder = Recorder::new();
    consumer
        .subscribe_fn("interest.marked", recorder.handler())
        .await
        .unwrap();

    client.open();
    assert!(!client.wait_connected(Duration::from_millis(50)).await);
    broker.set_available(true);
    assert!(client.wait_connected(TIMEOUT).await);

    let publisher = EventPublisher::new(client.clone());
    assert!(publisher.publish("interest.marked", &json!({ "eventId": 9 })).await);
    assert!(eventually(|| recorder.count() == 1).await);

    consumer.shutdown(Duration::from_millis(100)).await;
    client.close().await;
}

#[tokio::test]
async fn circuit_opens_and_resets() {
    let broker = MemoryBroker::new();
    let client = BusClient::new(
        broker.clone(),
        ClientOptions::default()
            .with_reconnect(FixedInterval::new(Duration::from_millis(5)).with_max_attempts(2)),
    );
    let consumer = EventConsumer::new(client.clone(), consumer_options(3));
    let recorder = Recorder::new();
    consumer
        .subscribe_fn("event.created", recorder.handler())
        .await
        .unwrap();
    client.open();
    assert!(client.wait_connected(TIMEOUT).await);

    broker.set_available(false);
    broker.sever_connections();
    let mut state = client.watch_state();
    tokio::time::timeout(TIMEOUT, state.wait_for(|s| *s == ConnectionState::CircuitOpen))
        .await
        .unwrap()
        .unwrap();

    let publisher = EventPublisher::new(client.clone());
    assert!(!publisher.publish("event.created", &json!({ "eventId": 1 })).await);

    broker.set_available(true);
    client.reconnect();
    assert!(client.wait_connected(TIMEOUT).await);
    assert!(publisher.publish("event.created", &json!({ "eventId": 2 })).await);
    assert!(eventually(|| recorder.count() == 1).await);
    assert_eq!(recorder.seen(), vec![json!({ "eventId": 2 })]);

    consumer.shutdown(Duration::from_millis(100)).await;
    client.close().await;
}

#[tokio::test]
async fn state_transitions_are_observable() {
    let broker = MemoryBroker::new();
    let client = support::client(&broker);
    let mut state = client.watch_state();
    assert_eq!(*state.borrow(), ConnectionState::Disconnected);

    client.open();
    tokio::time::timeout(TIMEOUT, state.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();

    broker.sever_connections();
    assert!(!client.is_connected());
    assert!(eventually(|| broker.connections_opened() == 2).await);
    assert!(client.wait_connected(TIMEOUT).await);

    client.close().await;
    assert_eq!(*state.borrow_and_update(), ConnectionState::Closed);
}
