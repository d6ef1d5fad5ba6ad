mod common;

use anyhow::Context;
use chrono::{DateTime, Utc};
use common::{Order, GROUP, PASSWORD, TOPIC};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use typed_kafka::broker::memory::MemoryBroker;
use typed_kafka::{
    AuthError, AuthNegotiator, ConfigError, ConsumerGroupRunner, DecodeError, DecodeFailurePolicy,
    Error, JsonCodec, MessageCodec, Producer, RecordContext, RunnerOptions, RunnerState,
};

const WAIT: Duration = Duration::from_secs(5);

fn fast_options() -> RunnerOptions {
    RunnerOptions {
        redelivery_backoff_ms: 10,
        reconnect_backoff_ms: 10,
        shutdown_timeout_ms: 2000,
        ..RunnerOptions::default()
    }
}

fn committed(broker: &MemoryBroker, partition: i32) -> Option<i64> {
    broker.committed_offset(GROUP, TOPIC, partition)
}

#[tokio::test]
async fn test_failed_record_is_redelivered_and_others_commit_once() {
    let broker = common::broker(1);
    common::publish_orders(&broker, 0, 1..=3);

    let calls = Arc::new(Mutex::new(Vec::new()));
    let failed_once = Arc::new(AtomicBool::new(false));
    let handler = {
        let calls = calls.clone();
        let failed_once = failed_once.clone();
        move |_ctx: RecordContext, _key: String, order: Option<Order>, _ts: DateTime<Utc>| {
            let calls = calls.clone();
            let failed_once = failed_once.clone();
            async move {
                let order = order.context("order payload missing")?;
                calls.lock().unwrap().push(order.id);
                if order.id == 2 && !failed_once.swap(true, Ordering::SeqCst) {
                    anyhow::bail!("downstream unavailable");
                }
                anyhow::Ok(())
            }
        }
    };

    let handle = ConsumerGroupRunner::new(JsonCodec::<Order>::new(), handler)
        .with_options(fast_options())
        .start_on(common::join(&broker, &common::orders_config()));

    common::wait_until(WAIT, || committed(&broker, 0) == Some(3)).await;
    handle.stop().await.unwrap();

    assert_eq!(*calls.lock().unwrap(), vec![1, 2, 2, 3]);

    // Every offset is committed exactly once, in order.
    let offsets: Vec<i64> = broker.commits(GROUP).iter().map(|c| c.offset).collect();
    assert_eq!(offsets, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_panicking_callback_is_redelivered() {
    let broker = common::broker(1);
    common::publish_orders(&broker, 0, 1..=2);

    let panicked = Arc::new(AtomicBool::new(false));
    let handler = {
        let panicked = panicked.clone();
        move |_ctx: RecordContext, _key: String, order: Option<Order>, _ts: DateTime<Utc>| {
            let panicked = panicked.clone();
            async move {
                if order.map(|o| o.id) == Some(1) && !panicked.swap(true, Ordering::SeqCst) {
                    panic!("handler bug");
                }
                anyhow::Ok(())
            }
        }
    };

    let handle = ConsumerGroupRunner::new(JsonCodec::<Order>::new(), handler)
        .with_options(fast_options())
        .start_on(common::join(&broker, &common::orders_config()));

    common::wait_until(WAIT, || committed(&broker, 0) == Some(2)).await;
    assert_eq!(handle.state(), RunnerState::Consuming);
    handle.stop().await.unwrap();
    assert!(panicked.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_partition_order_is_preserved() {
    let broker = common::broker(3);
    for partition in 0..3 {
        let start = partition as u64 * 100;
        common::publish_orders(&broker, partition, start..start + 20);
    }

    let seen: Arc<Mutex<HashMap<i32, Vec<i64>>>> = Arc::new(Mutex::new(HashMap::new()));
    let handler = {
        let seen = seen.clone();
        move |ctx: RecordContext, key: String, order: Option<Order>, _ts: DateTime<Utc>| {
            let seen = seen.clone();
            async move {
                let order = order.context("order payload missing")?;
                assert_eq!(key, format!("order-{}", order.id));
                seen.lock()
                    .unwrap()
                    .entry(ctx.partition)
                    .or_default()
                    .push(ctx.offset);
                anyhow::Ok(())
            }
        }
    };

    let handle = ConsumerGroupRunner::new(JsonCodec::<Order>::new(), handler)
        .with_options(fast_options())
        .start_on(common::join(&broker, &common::orders_config()));

    common::wait_until(WAIT, || (0..3).all(|p| committed(&broker, p) == Some(20))).await;
    handle.stop().await.unwrap();

    let seen = seen.lock().unwrap();
    for partition in 0..3 {
        let offsets = &seen[&partition];
        assert_eq!(*offsets, (0..20).collect::<Vec<i64>>(), "partition {}", partition);
    }

    let mut by_partition: HashMap<i32, Vec<i64>> = HashMap::new();
    for commit in broker.commits(GROUP) {
        by_partition
            .entry(commit.partition)
            .or_default()
            .push(commit.offset);
    }
    for offsets in by_partition.values() {
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    }
}

#[tokio::test]
async fn test_rebalance_resumes_from_committed_offset() {
    let broker = common::broker(1);
    common::publish_orders(&broker, 0, 1..=3);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = seen.clone();
        move |ctx: RecordContext, _key: String, order: Option<Order>, _ts: DateTime<Utc>| {
            let seen = seen.clone();
            async move {
                let order = order.context("order payload missing")?;
                seen.lock().unwrap().push((order.id, ctx.generation));
                anyhow::Ok(())
            }
        }
    };

    let handle = ConsumerGroupRunner::new(JsonCodec::<Order>::new(), handler)
        .with_options(fast_options())
        .start_on(common::join(&broker, &common::orders_config()));

    common::wait_until(WAIT, || committed(&broker, 0) == Some(3)).await;
    let first_generation = broker.generation(GROUP).unwrap();

    broker.rebalance(GROUP);
    common::publish_orders(&broker, 0, 4..=5);
    common::wait_until(WAIT, || committed(&broker, 0) == Some(5)).await;
    assert_eq!(handle.wait_for(RunnerState::Consuming).await, RunnerState::Consuming);
    handle.stop().await.unwrap();

    let seen = seen.lock().unwrap();
    let ids: Vec<u64> = seen.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert!(seen[..3].iter().all(|(_, g)| *g == first_generation));
    assert!(seen[3..].iter().all(|(_, g)| *g > first_generation));
}

#[tokio::test]
async fn test_two_members_share_partitions() {
    let broker = common::broker(2);
    let cfg = common::orders_config();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let make_handler = |member: usize| {
        let seen = seen.clone();
        move |ctx: RecordContext, _key: String, _order: Option<Order>, _ts: DateTime<Utc>| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push((member, ctx.partition));
                anyhow::Ok(())
            }
        }
    };

    let first = ConsumerGroupRunner::new(JsonCodec::<Order>::new(), make_handler(0))
        .with_options(fast_options())
        .start_on(common::join(&broker, &cfg));
    let second = ConsumerGroupRunner::new(JsonCodec::<Order>::new(), make_handler(1))
        .with_options(fast_options())
        .start_on(common::join(&broker, &cfg));
    first.wait_for(RunnerState::Consuming).await;
    second.wait_for(RunnerState::Consuming).await;

    common::publish_orders(&broker, 0, 1..=5);
    common::publish_orders(&broker, 1, 6..=10);
    common::wait_until(WAIT, || {
        committed(&broker, 0) == Some(5) && committed(&broker, 1) == Some(5)
    })
    .await;

    first.stop().await.unwrap();
    second.stop().await.unwrap();

    // Each partition was consumed by exactly one member.
    let seen = seen.lock().unwrap();
    for partition in 0..2 {
        let members: Vec<usize> = seen
            .iter()
            .filter(|(_, p)| *p == partition)
            .map(|(m, _)| *m)
            .collect();
        assert_eq!(members.len(), 5);
        assert!(members.iter().all(|m| *m == members[0]));
    }
}

#[tokio::test]
async fn test_stop_interrupts_waiting_callback() {
    let broker = common::broker(1);
    common::publish_orders(&broker, 0, 1..=1);

    let started = Arc::new(AtomicBool::new(false));
    let handler = {
        let started = started.clone();
        move |ctx: RecordContext, _key: String, _order: Option<Order>, _ts: DateTime<Utc>| {
            let started = started.clone();
            async move {
                started.store(true, Ordering::SeqCst);
                ctx.cancellation.cancelled().await;
                Err::<(), _>(anyhow::anyhow!("cancelled before completion"))
            }
        }
    };

    let handle = ConsumerGroupRunner::new(JsonCodec::<Order>::new(), handler)
        .with_options(fast_options())
        .start_on(common::join(&broker, &common::orders_config()));

    common::wait_until(WAIT, || started.load(Ordering::SeqCst)).await;
    handle.stop().await.unwrap();

    assert_eq!(committed(&broker, 0), None);
    assert!(broker.commits(GROUP).is_empty());
}

#[tokio::test]
async fn test_stop_leaves_group() {
    let broker = common::broker(1);
    let handler =
        |_ctx: RecordContext, _key: String, _order: Option<Order>, _ts: DateTime<Utc>| async {
            anyhow::Ok(())
        };
    let handle = ConsumerGroupRunner::new(JsonCodec::<Order>::new(), handler)
        .with_options(fast_options())
        .start_on(common::join(&broker, &common::orders_config()));

    assert_eq!(handle.wait_for(RunnerState::Consuming).await, RunnerState::Consuming);
    let generation = broker.generation(GROUP).unwrap();

    handle.stop().await.unwrap();
    assert!(broker.generation(GROUP).unwrap() > generation);
}

#[tokio::test]
async fn test_missing_group_fails_fast() {
    let cfg = common::topic_config(TOPIC, None, "plain", PASSWORD);
    let handler =
        |_ctx: RecordContext, _key: String, _order: Option<Order>, _ts: DateTime<Utc>| async {
            anyhow::Ok(())
        };

    let result = ConsumerGroupRunner::new(JsonCodec::<Order>::new(), handler)
        .start(&cfg, &AuthNegotiator::default())
        .await;
    match result {
        Err(Error::Config(ConfigError::MissingGroup { topic_key })) => assert_eq!(topic_key, "t"),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("runner started without a consumer group"),
    }
}

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    let broker = common::broker(1);
    for auth_type in ["plain", "scram-sha-256", "scram-sha-512"] {
        let cfg = common::topic_config(TOPIC, Some(GROUP), auth_type, "not-the-password");
        let result = broker.connect_group(
            &common::client_options(&cfg),
            TOPIC,
            GROUP,
            Default::default(),
            16,
        );
        assert!(
            matches!(result, Err(Error::Auth(AuthError::Rejected(_)))),
            "{} accepted a wrong password",
            auth_type
        );
    }
    // Rejected connections never joined the group.
    assert_eq!(broker.generation(GROUP), None);
}

#[tokio::test]
async fn test_undecodable_record_is_dead_lettered() {
    let broker = common::broker(1);
    broker.create_topic("orders.dlq", 1);
    common::publish_orders(&broker, 0, 1..=1);
    broker
        .publish(TOPIC, 0, Some(b"order-x"), Some(b"{not json"))
        .unwrap();
    common::publish_orders(&broker, 0, 3..=3);

    let cfg = common::orders_config();
    let dead_letters = Producer::<Order>::with_transport(
        broker.connect_producer(&common::client_options(&cfg)).unwrap(),
        "orders.dlq",
        JsonCodec::new(),
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = seen.clone();
        move |_ctx: RecordContext, _key: String, order: Option<Order>, _ts: DateTime<Utc>| {
            let seen = seen.clone();
            async move {
                let order = order.context("order payload missing")?;
                seen.lock().unwrap().push(order.id);
                anyhow::Ok(())
            }
        }
    };

    let options = RunnerOptions {
        decode_failure: DecodeFailurePolicy::DeadLetter(Arc::new(dead_letters)),
        ..fast_options()
    };
    let handle = ConsumerGroupRunner::new(JsonCodec::<Order>::new(), handler)
        .with_options(options)
        .start_on(common::join(&broker, &cfg));

    common::wait_until(WAIT, || committed(&broker, 0) == Some(3)).await;
    handle.stop().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
    let dead = broker.records("orders.dlq", 0);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].key.as_deref(), Some(&b"order-x"[..]));
    assert_eq!(dead[0].payload.as_deref(), Some(&b"{not json"[..]));
}

#[tokio::test]
async fn test_undecodable_record_is_dropped_by_default() {
    let broker = common::broker(1);
    broker.publish(TOPIC, 0, None, Some(b"[1, 2")).unwrap();
    common::publish_orders(&broker, 0, 2..=2);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = seen.clone();
        move |ctx: RecordContext, _key: String, _order: Option<Order>, _ts: DateTime<Utc>| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(ctx.offset);
                anyhow::Ok(())
            }
        }
    };

    let handle = ConsumerGroupRunner::new(JsonCodec::<Order>::new(), handler)
        .with_options(fast_options())
        .start_on(common::join(&broker, &common::orders_config()));

    common::wait_until(WAIT, || committed(&broker, 0) == Some(2)).await;
    handle.stop().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![1]);
    let offsets: Vec<i64> = broker.commits(GROUP).iter().map(|c| c.offset).collect();
    assert_eq!(offsets, vec![1]);
}

/// JSON codec that panics the first time it sees the payload `boom`.
struct PanicOnceCodec {
    panicked: AtomicBool,
    json: JsonCodec<Order>,
}

impl MessageCodec<Order> for PanicOnceCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Order, DecodeError> {
        if bytes == b"boom" && !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("codec bug");
        }
        self.json.decode(bytes)
    }

    fn encode(&self, value: &Order) -> Result<Vec<u8>, serde_json::Error> {
        self.json.encode(value)
    }
}

#[tokio::test]
async fn test_panicking_codec_does_not_stall_partition() {
    let broker = common::broker(1);
    common::publish_orders(&broker, 0, 1..=1);
    broker.publish(TOPIC, 0, Some(b"order-2"), Some(b"boom")).unwrap();
    common::publish_orders(&broker, 0, 3..=3);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = seen.clone();
        move |_ctx: RecordContext, _key: String, order: Option<Order>, _ts: DateTime<Utc>| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(order.map(|o| o.id));
                anyhow::Ok(())
            }
        }
    };

    let codec = PanicOnceCodec {
        panicked: AtomicBool::new(false),
        json: JsonCodec::new(),
    };
    let handle = ConsumerGroupRunner::new(codec, handler)
        .with_options(fast_options())
        .start_on(common::join(&broker, &common::orders_config()));

    // The panic redelivers `boom`; the second decode fails and the record
    // is dropped, so consumption carries on to order 3.
    common::wait_until(WAIT, || committed(&broker, 0) == Some(3)).await;
    assert_eq!(handle.state(), RunnerState::Consuming);
    handle.stop().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![Some(1), Some(3)]);
    let offsets: Vec<i64> = broker.commits(GROUP).iter().map(|c| c.offset).collect();
    assert_eq!(offsets, vec![0, 2]);
}
