//! Consumer-group runner.
//!
//! A runner owns one group connection and moves through
//! `Created -> Joining -> Consuming <-> Rebalancing -> Closed`. Every claim of
//! a generation is consumed by its own task; offsets are committed only after
//! the callback succeeded, in offset order.
//!
//! # Example
//!
//! ```rust,no_run
//! use chrono::{DateTime, Utc};
//! use serde::{Deserialize, Serialize};
//! use typed_kafka::auth::AuthNegotiator;
//! use typed_kafka::codec::JsonCodec;
//! use typed_kafka::config::KafkaTopicsConfig;
//! use typed_kafka::consumer::{ConsumerGroupRunner, RecordContext};
//!
//! #[derive(Serialize, Deserialize)]
//! struct OrderPlaced {
//!     id: u64,
//! }
//!
//! # async fn run() -> typed_kafka::Result<()> {
//! let topics = KafkaTopicsConfig::from_env()?;
//! let handle = ConsumerGroupRunner::new(
//!     JsonCodec::<OrderPlaced>::new(),
//!     |ctx: RecordContext, key: String, order: Option<OrderPlaced>, _ts: DateTime<Utc>| async move {
//!         if let Some(order) = order {
//!             println!("{} {} at offset {}", key, order.id, ctx.offset);
//!         }
//!         anyhow::Ok(())
//!     },
//! )
//! .start(&*topics.topic("orders")?, &AuthNegotiator::default())
//! .await?;
//!
//! tokio::signal::ctrl_c().await?;
//! handle.stop().await
//! # }
//! ```

mod claim;
pub mod handler;

pub use handler::{DeadLetterSink, DecodeFailurePolicy, RecordContext, RecordHandler};

use crate::auth::AuthNegotiator;
use crate::broker::kafka::KafkaGroupConnection;
use crate::broker::{GroupConnection, InitialOffset};
use crate::codec::MessageCodec;
use crate::config::TopicConfig;
use crate::{Error, Result};
use claim::{panic_message, ClaimWorker, Pipeline};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Lifecycle of a [`ConsumerGroupRunner`]. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Created,
    Joining,
    Consuming,
    Rebalancing,
    Closed,
}

/// Operational knobs of a runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerOptions {
    /// Wait before a failed record is delivered again.
    #[serde(default = "default_redelivery_backoff_ms")]
    pub redelivery_backoff_ms: u64,

    /// Wait before joining again after a failed join or a crashed loop.
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    /// Upper bound for [`RunnerHandle::stop`].
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Records buffered per claim ahead of the callback.
    #[serde(default = "default_claim_buffer")]
    pub claim_buffer: usize,

    #[serde(default)]
    pub initial_offset: InitialOffset,

    #[serde(skip)]
    pub decode_failure: DecodeFailurePolicy,
}

fn default_redelivery_backoff_ms() -> u64 {
    1000
}

fn default_reconnect_backoff_ms() -> u64 {
    2000
}

fn default_shutdown_timeout_ms() -> u64 {
    30000
}

fn default_claim_buffer() -> usize {
    256
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            redelivery_backoff_ms: default_redelivery_backoff_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            claim_buffer: default_claim_buffer(),
            initial_offset: InitialOffset::default(),
            decode_failure: DecodeFailurePolicy::default(),
        }
    }
}

impl RunnerOptions {
    pub fn redelivery_backoff(&self) -> Duration {
        Duration::from_millis(self.redelivery_backoff_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Consumes one topic as a member of a consumer group, handing every record
/// to a typed callback.
pub struct ConsumerGroupRunner<E, C, H> {
    codec: C,
    handler: H,
    options: RunnerOptions,
    _payload: PhantomData<fn() -> E>,
}

impl<E, C, H> ConsumerGroupRunner<E, C, H>
where
    E: Send + 'static,
    C: MessageCodec<E>,
    H: RecordHandler<E>,
{
    pub fn new(codec: C, handler: H) -> Self {
        Self {
            codec,
            handler,
            options: RunnerOptions::default(),
            _payload: PhantomData,
        }
    }

    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// Validates the consumer group, connects to the topic's brokers and
    /// starts consuming in the background.
    ///
    /// Configuration, authentication and initial connection failures are
    /// returned here; nothing is spawned in that case.
    pub async fn start(
        self,
        cfg: &TopicConfig,
        negotiator: &AuthNegotiator,
    ) -> Result<RunnerHandle> {
        let group_id = cfg.require_group()?;
        let options = negotiator.build_client_options(cfg)?;
        let connection = KafkaGroupConnection::connect(
            &options,
            cfg.physical_topic(),
            group_id,
            self.options.initial_offset,
            self.options.claim_buffer,
        )
        .await?;
        info!(
            topic_key = %cfg.topic_key(),
            topic = %cfg.physical_topic(),
            group = %group_id,
            "Consumer group runner starting"
        );
        Ok(self.start_on(connection))
    }

    /// Starts consuming over an already established connection.
    pub fn start_on<G: GroupConnection>(self, connection: G) -> RunnerHandle {
        let connection: Arc<dyn GroupConnection> = Arc::new(connection);
        let shutdown_timeout = self.options.shutdown_timeout();
        let (state_tx, state_rx) = watch::channel(RunnerState::Created);
        let pipeline = Arc::new(Pipeline {
            codec: self.codec,
            handler: self.handler,
            options: self.options,
            _payload: PhantomData,
        });

        let task = tokio::spawn(supervise(connection.clone(), pipeline, Arc::new(state_tx)));
        RunnerHandle {
            connection,
            state: state_rx,
            task,
            shutdown_timeout,
        }
    }
}

/// Handle to a running consumer. Dropping it leaves the runner running.
pub struct RunnerHandle {
    connection: Arc<dyn GroupConnection>,
    state: watch::Receiver<RunnerState>,
    task: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl RunnerHandle {
    pub fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    /// Waits until the runner reaches `state`, or is closed.
    pub async fn wait_for(&self, state: RunnerState) -> RunnerState {
        let mut rx = self.state.clone();
        let reached = rx
            .wait_for(|current| *current == state || *current == RunnerState::Closed)
            .await
            .map(|current| *current);
        reached.unwrap_or(RunnerState::Closed)
    }

    /// Resolves once the runner is closed.
    pub async fn closed(&self) {
        self.wait_for(RunnerState::Closed).await;
    }

    /// Closes the connection and waits for every task to unwind, at most
    /// the configured shutdown timeout.
    pub async fn stop(self) -> Result<()> {
        info!("Stopping consumer group runner");
        self.connection.close();
        match tokio::time::timeout(self.shutdown_timeout, self.task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Connection(format!("consumer task failed: {}", e))),
            Err(_) => Err(Error::Timeout {
                message: format!(
                    "consumer did not stop within {}ms",
                    self.shutdown_timeout.as_millis()
                ),
            }),
        }
    }
}

fn set_state(state: &watch::Sender<RunnerState>, next: RunnerState) {
    state.send_if_modified(|current| {
        if *current == RunnerState::Closed || *current == next {
            return false;
        }
        *current = next;
        true
    });
}

/// Runs the consume loop, restarting it after a panic until the connection
/// is closed.
async fn supervise<E, C, H>(
    connection: Arc<dyn GroupConnection>,
    pipeline: Arc<Pipeline<E, C, H>>,
    state: Arc<watch::Sender<RunnerState>>,
) where
    E: Send + 'static,
    C: MessageCodec<E>,
    H: RecordHandler<E>,
{
    loop {
        let run = tokio::spawn(consume(connection.clone(), pipeline.clone(), state.clone()));
        match run.await {
            Ok(()) => break,
            Err(e) if e.is_panic() => {
                if connection.is_closed() {
                    break;
                }
                error!(
                    panic = %panic_message(e.into_panic().as_ref()),
                    "Consumer loop panicked, restarting"
                );
                tokio::time::sleep(pipeline.options.reconnect_backoff()).await;
            }
            Err(e) => {
                error!(error = %e, "Consumer loop was cancelled");
                break;
            }
        }
    }

    connection.close();
    state.send_replace(RunnerState::Closed);
    info!("Consumer group runner closed");
}

async fn consume<E, C, H>(
    connection: Arc<dyn GroupConnection>,
    pipeline: Arc<Pipeline<E, C, H>>,
    state: Arc<watch::Sender<RunnerState>>,
) where
    E: Send + 'static,
    C: MessageCodec<E>,
    H: RecordHandler<E>,
{
    loop {
        set_state(&state, RunnerState::Joining);
        let session = match connection.next_session().await {
            Ok(session) => session,
            Err(Error::Closed) => {
                debug!("Connection closed, leaving consume loop");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to join consumer group, retrying");
                tokio::time::sleep(pipeline.options.reconnect_backoff()).await;
                continue;
            }
        };

        let generation = session.generation();
        let token = session.token().clone();
        let control = session.control();
        let claims = session.into_claims();
        info!(generation, claims = claims.len(), "Consuming generation");
        set_state(&state, RunnerState::Consuming);

        let mut tasks = JoinSet::new();
        for claim in claims {
            let worker = ClaimWorker::new(
                claim,
                control.clone(),
                token.clone(),
                generation,
                pipeline.clone(),
            );
            tasks.spawn(worker.run());
        }
        while let Some(joined) = tasks.join_next().await {
            let Err(e) = joined else { continue };
            if token.is_cancelled() || connection.is_closed() {
                error!(generation, error = %e, "Claim task failed");
                continue;
            }
            // The dead claim's partition stays assigned to us until the
            // group hands the claims out again.
            error!(generation, error = %e, "Claim task failed, rejoining group");
            token.cancel();
            connection.rejoin();
        }

        if connection.is_closed() {
            return;
        }
        info!(generation, "Generation ended, rejoining");
        set_state(&state, RunnerState::Rebalancing);
    }
}
