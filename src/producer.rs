//! Typed producers.
//!
//! [`Producer`] waits for the broker acknowledgement of every send.
//! [`AsyncProducer`] returns as soon as the value is serialized and reports
//! the outcome to a [`PostSendCallback`], with the number of sends in flight
//! bounded by a semaphore.

use crate::auth::AuthNegotiator;
use crate::broker::kafka::KafkaProducer;
use crate::broker::{Ack, ProduceTransport, Record};
use crate::codec::{decode_key, JsonCodec, MessageCodec};
use crate::config::TopicConfig;
use crate::consumer::DeadLetterSink;
use crate::error::DecodeError;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Publishes typed values to one topic.
pub struct Producer<V, C = JsonCodec<V>> {
    transport: Arc<dyn ProduceTransport>,
    topic: String,
    codec: C,
    _value: PhantomData<fn(&V)>,
}

impl<V, C> Producer<V, C>
where
    C: MessageCodec<V>,
{
    /// Connects to the topic's brokers with the negotiated credentials.
    pub async fn connect(
        cfg: &TopicConfig,
        negotiator: &AuthNegotiator,
        codec: C,
    ) -> Result<Self> {
        let options = negotiator.build_client_options(cfg)?;
        let transport = KafkaProducer::connect(&options, cfg.physical_topic()).await?;
        info!(
            topic_key = %cfg.topic_key(),
            topic = %cfg.physical_topic(),
            "Producer connected"
        );
        Ok(Self::with_transport(transport, cfg.physical_topic(), codec))
    }

    pub fn with_transport<T: ProduceTransport>(
        transport: T,
        topic: impl Into<String>,
        codec: C,
    ) -> Self {
        Self {
            transport: Arc::new(transport),
            topic: topic.into(),
            codec,
            _value: PhantomData,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Serializes `value` and waits for the broker to acknowledge it.
    ///
    /// An absent value is sent as an empty payload (tombstone). Failures are
    /// returned as is; there is no retry.
    pub async fn send(&self, key: Option<&[u8]>, value: Option<&V>) -> Result<Ack> {
        let payload = value.map(|v| self.codec.encode(v)).transpose()?;
        self.send_raw(key, payload.as_deref()).await
    }

    /// Sends an already encoded payload.
    pub async fn send_raw(&self, key: Option<&[u8]>, payload: Option<&[u8]>) -> Result<Ack> {
        let ack = self.transport.produce(&self.topic, key, payload).await?;
        debug!(
            topic = %self.topic,
            partition = ack.partition,
            offset = ack.offset,
            "Record acknowledged"
        );
        Ok(ack)
    }

    /// Flushes outstanding writes.
    pub async fn close(&self) -> Result<()> {
        match self.transport.flush(FLUSH_TIMEOUT).await {
            Ok(()) => {
                info!(topic = %self.topic, "Producer closed");
                Ok(())
            }
            Err(e) => {
                warn!(topic = %self.topic, error = %e, "Failed to flush producer on close");
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<V, C> DeadLetterSink for Producer<V, C>
where
    V: 'static,
    C: MessageCodec<V>,
{
    async fn dead_letter(&self, record: &Record, error: &DecodeError) -> Result<()> {
        let ack = self
            .send_raw(record.key.as_deref(), record.payload.as_deref())
            .await?;
        info!(
            source_topic = %record.topic,
            source_partition = record.partition,
            source_offset = record.offset,
            topic = %self.topic,
            partition = ack.partition,
            offset = ack.offset,
            reason = %error,
            "Record forwarded to dead-letter topic"
        );
        Ok(())
    }
}

/// Completion hook of an [`AsyncProducer`] send. Consumed by the call, so
/// it runs exactly once.
pub trait PostSendCallback<V>: Send + 'static {
    fn on_complete(self, key: Option<&[u8]>, value: Option<&V>, result: &Result<Ack>);
}

impl<V, F> PostSendCallback<V> for F
where
    F: FnOnce(Option<&[u8]>, Option<&V>, &Result<Ack>) + Send + 'static,
{
    fn on_complete(self, key: Option<&[u8]>, value: Option<&V>, result: &Result<Ack>) {
        self(key, value, result)
    }
}

/// Ignores the outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallback;

impl<V> PostSendCallback<V> for NoopCallback {
    fn on_complete(self, _key: Option<&[u8]>, _value: Option<&V>, _result: &Result<Ack>) {}
}

/// Logs failed sends.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogErrorCallback;

impl<V> PostSendCallback<V> for LogErrorCallback {
    fn on_complete(self, key: Option<&[u8]>, _value: Option<&V>, result: &Result<Ack>) {
        if let Err(e) = result {
            error!(key = %decode_key(key), error = %e, "Asynchronous send failed");
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncProducerOptions {
    /// Sends allowed in flight before `send` waits.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_max_in_flight() -> usize {
    1024
}

impl Default for AsyncProducerOptions {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
        }
    }
}

/// Fire-and-forget publication with a completion callback.
pub struct AsyncProducer<V, C = JsonCodec<V>> {
    producer: Arc<Producer<V, C>>,
    permits: Arc<Semaphore>,
    max_in_flight: u32,
}

impl<V, C> AsyncProducer<V, C>
where
    V: Send + 'static,
    C: MessageCodec<V>,
{
    pub fn new(producer: Producer<V, C>, options: AsyncProducerOptions) -> Self {
        let limit = Semaphore::MAX_PERMITS.min(u32::MAX as usize);
        let max_in_flight = options.max_in_flight.clamp(1, limit);
        Self {
            producer: Arc::new(producer),
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight: max_in_flight as u32,
        }
    }

    /// Serializes `value` on the calling task, then sends on a background
    /// task and hands the outcome to `callback`.
    ///
    /// Serialization errors are returned directly and the callback is not
    /// called. Waits for a free slot when `max_in_flight` sends are pending.
    pub async fn send<F>(&self, key: Option<&[u8]>, value: Option<V>, callback: F) -> Result<()>
    where
        F: PostSendCallback<V>,
    {
        let payload = value
            .as_ref()
            .map(|v| self.producer.codec.encode(v))
            .transpose()?;
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Closed)?;

        let producer = self.producer.clone();
        let key = key.map(Bytes::copy_from_slice);
        tokio::spawn(async move {
            let result = producer.send_raw(key.as_deref(), payload.as_deref()).await;
            callback.on_complete(key.as_deref(), value.as_ref(), &result);
            drop(permit);
        });
        Ok(())
    }

    /// Sends currently in flight.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight as usize - self.permits.available_permits()
    }

    /// Waits for pending sends, refuses new ones, then flushes.
    pub async fn close(&self) -> Result<()> {
        let drained = self
            .permits
            .acquire_many(self.max_in_flight)
            .await
            .map_err(|_| Error::Closed)?;
        self.permits.close();
        drop(drained);
        self.producer.close().await
    }
}
