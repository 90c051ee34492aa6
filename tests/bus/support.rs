//! Shared fixtures for bus integration tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use vibra_bus::bus::{BackoffPolicy, FixedInterval};
use vibra_bus::{
    BusClient, ClientOptions, ConsumerOptions, EventConsumer, EventContext, EventPublisher,
    HandlerError, MemoryBroker, RedeliveryPolicy,
};

pub const TIMEOUT: Duration = Duration::from_secs(2);

/// Client on `broker` reconnecting every 10ms.
pub fn client(broker: &MemoryBroker) -> BusClient {
    BusClient::new(
        broker.clone(),
        ClientOptions::default().with_reconnect(FixedInterval::new(Duration::from_millis(10))),
    )
}

pub async fn connected(broker: &MemoryBroker) -> BusClient {
    let client = client(broker);
    client.open();
    assert!(client.wait_connected(TIMEOUT).await, "client did not connect");
    client
}

/// Bounded redelivery with a 1ms constant backoff.
pub fn consumer_options(max_attempts: u32) -> ConsumerOptions {
    ConsumerOptions::default().with_redelivery(
        RedeliveryPolicy::bounded(max_attempts)
            .with_backoff(BackoffPolicy::constant(Duration::from_millis(1))),
    )
}

pub struct Node {
    pub client: BusClient,
    pub publisher: EventPublisher,
    pub consumer: EventConsumer,
}

impl Node {
    pub async fn start(broker: &MemoryBroker, options: ConsumerOptions) -> Self {
        let client = connected(broker).await;
        Self {
            publisher: EventPublisher::new(client.clone()),
            consumer: EventConsumer::new(client.clone(), options),
            client,
        }
    }

    pub async fn stop(self) {
        self.consumer.shutdown(Duration::from_millis(200)).await;
        self.client.close().await;
    }
}

/// Collects the payloads a handler sees.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<Value>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, ctx: &EventContext) {
        self.seen.lock().unwrap().push(ctx.raw_data().clone());
    }

    pub fn seen(&self) -> Vec<Value> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    /// Handler that records and succeeds.
    pub fn handler(
        &self,
    ) -> impl Fn(EventContext) -> std::future::Ready<Result<(), HandlerError>> + Send + Sync + 'static
    {
        let recorder = self.clone();
        move |ctx| {
            recorder.record(&ctx);
            std::future::ready(Ok(()))
        }
    }
}

/// Poll `condition` every 5ms until it holds or `TIMEOUT` passes.
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Let in-flight work settle, for asserting that something did NOT happen.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
