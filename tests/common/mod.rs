#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use typed_kafka::auth::ClientOptions;
use typed_kafka::broker::memory::{MemoryBroker, MemoryGroupConnection};
use typed_kafka::config::resolve;
use typed_kafka::{AuthNegotiator, InitialOffset, TopicConfig};

pub const USERNAME: &str = "svc-orders";
pub const PASSWORD: &str = "s3cret";
pub const TOPIC: &str = "orders";
pub const GROUP: &str = "billing";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub amount_cents: i64,
}

impl Order {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            amount_cents: id as i64 * 100,
        }
    }
}

/// Broker with the test user and an `orders` topic.
pub fn broker(partitions: usize) -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker.add_user(USERNAME, PASSWORD);
    broker.create_topic(TOPIC, partitions);
    broker
}

/// Resolves a single-topic document the way applications do.
pub fn topic_config(
    topic: &str,
    group: Option<&str>,
    auth_type: &str,
    password: &str,
) -> TopicConfig {
    let group = group
        .map(|g| format!(r#","consumerGroup":"{}""#, g))
        .unwrap_or_default();
    let doc = format!(
        r#"{{"t": {{"topic":"{}","brokers":["memory:9093"],"username":"{}","passwordEnvVar":"TEST_TOPIC_PW","authType":"{}"{}}}}}"#,
        topic, USERNAME, auth_type, group
    );
    let password = password.to_string();
    let mut topics = resolve(&doc, move |name: &str| {
        if name == "TEST_TOPIC_PW" {
            password.clone()
        } else {
            String::new()
        }
    })
    .unwrap();
    topics.remove("t").unwrap()
}

pub fn orders_config() -> TopicConfig {
    topic_config(TOPIC, Some(GROUP), "scram-sha-256", PASSWORD)
}

pub fn client_options(cfg: &TopicConfig) -> ClientOptions {
    AuthNegotiator::default().build_client_options(cfg).unwrap()
}

pub fn join(broker: &MemoryBroker, cfg: &TopicConfig) -> MemoryGroupConnection {
    broker
        .connect_group(
            &client_options(cfg),
            cfg.physical_topic(),
            cfg.require_group().unwrap(),
            InitialOffset::Earliest,
            16,
        )
        .unwrap()
}

pub fn publish_orders(broker: &MemoryBroker, partition: i32, ids: impl IntoIterator<Item = u64>) {
    for id in ids {
        let payload = serde_json::to_vec(&Order::new(id)).unwrap();
        let key = format!("order-{}", id);
        broker
            .publish(TOPIC, partition, Some(key.as_bytes()), Some(&payload))
            .unwrap();
    }
}

/// Polls `condition` until it holds, panicking after `timeout`.
pub async fn wait_until<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Brokers for tests against a real cluster, from `TEST_KAFKA_BROKERS`.
pub fn live_brokers() -> Vec<String> {
    env::var("TEST_KAFKA_BROKERS")
        .unwrap_or_else(|_| "localhost:9092".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .collect()
}

pub fn live_topic_config(topic: &str, group: &str) -> TopicConfig {
    let brokers = serde_json::to_string(&live_brokers()).unwrap();
    let auth_type = env::var("TEST_KAFKA_AUTH_TYPE").unwrap_or_else(|_| "plain".to_string());
    let username = env::var("TEST_KAFKA_USERNAME").unwrap_or_else(|_| "admin".to_string());
    let doc = format!(
        r#"{{"live": {{"topic":"{}","brokers":{},"username":"{}","passwordEnvVar":"TEST_KAFKA_PASSWORD","consumerGroup":"{}","authType":"{}"}}}}"#,
        topic, brokers, username, group, auth_type
    );
    let mut topics = resolve(&doc, |name: &str| {
        env::var(name).unwrap_or_else(|_| "admin-secret".to_string())
    })
    .unwrap();
    topics.remove("live").unwrap()
}
