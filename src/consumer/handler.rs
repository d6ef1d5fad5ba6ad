use crate::broker::Record;
use crate::error::DecodeError;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Where a record came from, handed to the callback with every record.
#[derive(Debug, Clone)]
pub struct RecordContext {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub generation: i32,
    /// Cancelled when the generation ends or the runner stops. Long-running
    /// callbacks should watch it.
    pub cancellation: CancellationToken,
}

/// Application callback invoked once per decoded record.
///
/// Returning an error (or panicking) leaves the record uncommitted; it is
/// delivered again, so implementations must be idempotent.
#[async_trait]
pub trait RecordHandler<E>: Send + Sync + 'static {
    async fn handle(
        &self,
        ctx: RecordContext,
        key: String,
        payload: Option<E>,
        timestamp: DateTime<Utc>,
    ) -> anyhow::Result<()>;
}

#[async_trait]
impl<E, F, Fut> RecordHandler<E> for F
where
    E: Send + 'static,
    F: Fn(RecordContext, String, Option<E>, DateTime<Utc>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: RecordContext,
        key: String,
        payload: Option<E>,
        timestamp: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        (self)(ctx, key, payload, timestamp).await
    }
}

/// Destination for records whose payload could not be decoded.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, record: &Record, error: &DecodeError) -> Result<()>;
}

/// What happens to a record whose payload does not decode.
#[derive(Clone, Default)]
pub enum DecodeFailurePolicy {
    /// Log and skip without calling back or committing. A later commit on
    /// the same partition moves past the record, so it is lost.
    #[default]
    Drop,
    /// Treat like a failed callback: rewind and retry after the backoff.
    Redeliver,
    /// Forward the raw record to the sink, then commit it.
    DeadLetter(Arc<dyn DeadLetterSink>),
}

impl fmt::Debug for DecodeFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeFailurePolicy::Drop => f.write_str("Drop"),
            DecodeFailurePolicy::Redeliver => f.write_str("Redeliver"),
            DecodeFailurePolicy::DeadLetter(_) => f.write_str("DeadLetter"),
        }
    }
}
