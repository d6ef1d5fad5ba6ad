//! rdkafka-backed transport.
//!
//! The consumer is a `StreamConsumer` whose context reacts to rebalances:
//! a revocation cancels the current generation inside the callback, before
//! librdkafka gives the partitions away, and an assignment splits one
//! partition queue per claim and hands the runner a new [`Session`].
//! Processed offsets are stored explicitly and committed by the client's
//! auto-commit, which also commits them on revocation.

use crate::auth::ClientOptions;
use crate::broker::{
    Ack, Claim, GroupConnection, InitialOffset, OffsetControl, ProduceTransport, Record, Session,
};
use crate::error::AuthError;
use crate::logging::forward_client_log;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

type GroupConsumer = StreamConsumer<GroupContext>;

/// Forwards client logs and errors into `tracing` under a client key.
pub struct ClientLogContext {
    client_key: String,
}

impl ClientLogContext {
    pub fn new(client_key: impl Into<String>) -> Self {
        Self {
            client_key: client_key.into(),
        }
    }
}

impl ClientContext for ClientLogContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        forward_client_log(&self.client_key, level, fac, log_message);
    }

    fn error(&self, error: KafkaError, reason: &str) {
        error!(client = %self.client_key, error = %error, "Kafka client error: {}", reason);
    }
}

/// Consumer context turning rebalance callbacks into sessions.
struct GroupContext {
    log: ClientLogContext,
    runtime: Handle,
    claim_buffer: usize,
    consumer: OnceLock<Weak<GroupConsumer>>,
    sessions: mpsc::UnboundedSender<Session>,
    current: Mutex<Option<CancellationToken>>,
    generation: AtomicI32,
    closed: CancellationToken,
}

impl GroupContext {
    fn end_generation(&self) {
        let current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = current {
            token.cancel();
        }
    }

    fn open_generation(&self, assigned: &TopicPartitionList) {
        let Some(consumer) = self.consumer.get().and_then(Weak::upgrade) else {
            error!(client = %self.log.client_key, "Assignment received without a live consumer");
            return;
        };

        let token = self.closed.child_token();
        let mut claims = Vec::new();
        for element in assigned.elements() {
            let (topic, partition) = (element.topic(), element.partition());
            match consumer.split_partition_queue(topic, partition) {
                Some(queue) => {
                    let (tx, rx) = mpsc::channel(self.claim_buffer);
                    self.runtime
                        .spawn(forward_partition(queue, tx, token.clone()));
                    claims.push(Claim::new(topic, partition, rx));
                }
                None => warn!(
                    topic = %topic,
                    partition,
                    "Could not split partition queue; partition stays unclaimed"
                ),
            }
        }

        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            client = %self.log.client_key,
            generation,
            claims = claims.len(),
            "Partitions assigned"
        );

        let control = Arc::new(KafkaOffsetControl {
            consumer: Arc::downgrade(&consumer),
        });
        if self
            .sessions
            .send(Session::new(generation, claims, token, control))
            .is_err()
        {
            debug!(client = %self.log.client_key, "Session dropped, connection is closing");
        }
    }
}

impl ClientContext for GroupContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        self.log.log(level, fac, log_message);
    }

    fn error(&self, error: KafkaError, reason: &str) {
        self.log.error(error, reason);
    }
}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                if partitions.count() == 0 {
                    return;
                }
                info!(
                    client = %self.log.client_key,
                    partitions = partitions.count(),
                    "Partitions revoked, ending generation"
                );
                self.end_generation();
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => {
                error!(client = %self.log.client_key, error = %e, "Rebalance error")
            }
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(partitions) = rebalance {
            if partitions.count() > 0 {
                self.open_generation(partitions);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(
                client = %self.log.client_key,
                partitions = offsets.count(),
                "Offsets committed"
            ),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => warn!(client = %self.log.client_key, error = %e, "Offset commit failed"),
        }
    }
}

struct KafkaOffsetControl {
    consumer: Weak<GroupConsumer>,
}

impl KafkaOffsetControl {
    fn consumer(&self) -> Result<Arc<GroupConsumer>> {
        self.consumer.upgrade().ok_or(Error::Closed)
    }
}

impl OffsetControl for KafkaOffsetControl {
    fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(offset + 1))?;
        self.consumer()?.store_offsets(&tpl)?;
        Ok(())
    }

    fn rewind(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.consumer()?
            .seek(topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)?;
        Ok(())
    }
}

fn to_record(message: &BorrowedMessage<'_>) -> Record {
    let timestamp = message
        .timestamp()
        .to_millis()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);
    Record {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        payload: message.payload().map(Bytes::copy_from_slice),
        timestamp,
    }
}

/// Moves one partition queue into its claim channel until the generation
/// ends.
async fn forward_partition(
    queue: StreamPartitionQueue<GroupContext>,
    tx: mpsc::Sender<Record>,
    token: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            message = queue.recv() => match message {
                Ok(message) => to_record(&message),
                Err(e) => {
                    warn!(error = %e, "Error reading partition queue");
                    continue;
                }
            },
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            sent = tx.send(record) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

/// Polls the main queue so rebalance callbacks run. Records only show up
/// here for partitions whose queue could not be split.
async fn drive_consumer(consumer: Arc<GroupConsumer>, closed: CancellationToken) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            message = consumer.recv() => match message {
                Ok(message) => warn!(
                    topic = %message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    "Dropping record delivered outside a claim"
                ),
                Err(e) => error!(error = %e, "Kafka consumer error"),
            },
        }
    }
    debug!("Consumer driver stopped");
}

/// Auth failures reported by the client become [`AuthError`]s.
fn classify(error: KafkaError) -> Error {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::SaslAuthenticationFailed)
        | Some(RDKafkaErrorCode::Authentication) => AuthError::Rejected(error.to_string()).into(),
        _ => Error::Kafka(error),
    }
}

/// Consumer-group membership over an rdkafka connection.
pub struct KafkaGroupConnection {
    consumer: Arc<GroupConsumer>,
    topic: String,
    sessions: tokio::sync::Mutex<mpsc::UnboundedReceiver<Session>>,
    closed: CancellationToken,
}

impl KafkaGroupConnection {
    /// Creates the consumer, checks the broker accepts the credentials by
    /// fetching the topic's metadata, then subscribes.
    #[instrument(skip_all, fields(topic = %topic, group = %group_id))]
    pub async fn connect(
        options: &ClientOptions,
        topic: &str,
        group_id: &str,
        initial_offset: InitialOffset,
        claim_buffer: usize,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| Error::Connection(e.to_string()))?;
        let (sessions_tx, sessions_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        let context = GroupContext {
            log: ClientLogContext::new(format!("{} consumer", topic)),
            runtime,
            claim_buffer: claim_buffer.max(1),
            consumer: OnceLock::new(),
            sessions: sessions_tx,
            current: Mutex::new(None),
            generation: AtomicI32::new(0),
            closed: closed.clone(),
        };
        let consumer: GroupConsumer = options
            .consumer_config(group_id, initial_offset.as_str())
            .create_with_context(context)
            .map_err(classify)?;
        let consumer = Arc::new(consumer);
        let _ = consumer.context().consumer.set(Arc::downgrade(&consumer));

        let probe = consumer.clone();
        let probe_topic = topic.to_string();
        let timeout = options.dial_timeout();
        tokio::task::spawn_blocking(move || {
            probe.fetch_metadata(Some(probe_topic.as_str()), timeout)
        })
        .await
        .map_err(|e| Error::Connection(e.to_string()))?
        .map_err(classify)?;

        consumer.subscribe(&[topic]).map_err(classify)?;
        tokio::spawn(drive_consumer(consumer.clone(), closed.clone()));
        info!("Kafka consumer connected");

        Ok(Self {
            consumer,
            topic: topic.to_string(),
            sessions: tokio::sync::Mutex::new(sessions_rx),
            closed,
        })
    }
}

#[async_trait]
impl GroupConnection for KafkaGroupConnection {
    async fn next_session(&self) -> Result<Session> {
        let mut sessions = self.sessions.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(Error::Closed),
            session = sessions.recv() => session.ok_or(Error::Closed),
        }
    }

    fn rejoin(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.consumer.context().end_generation();
        self.consumer.unsubscribe();
        match self.consumer.subscribe(&[self.topic.as_str()]) {
            Ok(()) => info!(topic = %self.topic, "Resubscribed to rejoin the group"),
            Err(e) => error!(topic = %self.topic, error = %e, "Failed to resubscribe"),
        }
    }

    fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.consumer.unsubscribe();
        info!("Kafka consumer closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for KafkaGroupConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Record publication over an rdkafka `FutureProducer`.
pub struct KafkaProducer {
    producer: FutureProducer<ClientLogContext>,
}

impl KafkaProducer {
    #[instrument(skip_all, fields(topic = %topic))]
    pub async fn connect(options: &ClientOptions, topic: &str) -> Result<Self> {
        let producer: FutureProducer<ClientLogContext> = options
            .producer_config()
            .create_with_context(ClientLogContext::new(format!("{} producer", topic)))
            .map_err(classify)?;

        let probe = producer.clone();
        let probe_topic = topic.to_string();
        let timeout = options.dial_timeout();
        tokio::task::spawn_blocking(move || {
            probe.client().fetch_metadata(Some(probe_topic.as_str()), timeout)
        })
        .await
        .map_err(|e| Error::Connection(e.to_string()))?
        .map_err(classify)?;

        info!("Kafka producer connected");
        Ok(Self { producer })
    }
}

#[async_trait]
impl ProduceTransport for KafkaProducer {
    async fn produce(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: Option<&[u8]>,
    ) -> Result<Ack> {
        let mut record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(topic);
        if let Some(key) = key {
            record = record.key(key);
        }
        if let Some(payload) = payload {
            record = record.payload(payload);
        }

        let (partition, offset) = self
            .producer
            .send(record, Timeout::Never)
            .await
            .map_err(|(e, _)| classify(e))?;
        Ok(Ack { partition, offset })
    }

    async fn flush(&self, timeout: Duration) -> Result<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| Error::Connection(e.to_string()))??;
        Ok(())
    }
}
