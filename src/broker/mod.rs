//! The broker client seen as a black box: group membership handing out
//! claims, offset commits, and produce.
//!
//! [`kafka`] implements it on top of rdkafka; [`memory`] is an in-process
//! broker with the same semantics, used by tests.

pub mod kafka;
pub mod memory;

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Where a group starts reading a partition it has never committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialOffset {
    #[default]
    Earliest,
    Latest,
}

impl InitialOffset {
    /// Value of the client's `auto.offset.reset` property.
    pub fn as_str(self) -> &'static str {
        match self {
            InitialOffset::Earliest => "earliest",
            InitialOffset::Latest => "latest",
        }
    }
}

/// One record pulled from a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub payload: Option<Bytes>,
    pub timestamp: DateTime<Utc>,
}

/// Broker acknowledgement of a produced record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub partition: i32,
    pub offset: i64,
}

/// Offset bookkeeping for one group generation.
pub trait OffsetControl: Send + Sync {
    /// Marks the record at `offset` as processed; the committed position
    /// becomes `offset + 1`.
    fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;

    /// Asks the broker to deliver the partition again starting at `offset`.
    fn rewind(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;
}

/// The right to read one partition for the lifetime of a generation.
///
/// The record stream ends when the broker ends the generation.
pub struct Claim {
    topic: String,
    partition: i32,
    records: mpsc::Receiver<Record>,
}

impl Claim {
    pub fn new(topic: impl Into<String>, partition: i32, records: mpsc::Receiver<Record>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            records,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Next record in offset order, `None` once the stream is closed.
    pub async fn next(&mut self) -> Option<Record> {
        self.records.recv().await
    }
}

impl fmt::Debug for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claim")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .finish()
    }
}

/// One generation of group membership.
pub struct Session {
    generation: i32,
    claims: Vec<Claim>,
    token: CancellationToken,
    control: Arc<dyn OffsetControl>,
}

impl Session {
    pub fn new(
        generation: i32,
        claims: Vec<Claim>,
        token: CancellationToken,
        control: Arc<dyn OffsetControl>,
    ) -> Self {
        Self {
            generation,
            claims,
            token,
            control,
        }
    }

    pub fn generation(&self) -> i32 {
        self.generation
    }

    /// Cancelled when the generation ends (rebalance) or the client closes.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn control(&self) -> Arc<dyn OffsetControl> {
        self.control.clone()
    }

    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }

    pub fn into_claims(self) -> Vec<Claim> {
        self.claims
    }
}

/// Consumer-group membership over one connection.
#[async_trait]
pub trait GroupConnection: Send + Sync + 'static {
    /// Blocks until the broker assigns the next generation's claims.
    /// Returns [`crate::Error::Closed`] once the connection is closed.
    async fn next_session(&self) -> Result<Session>;

    /// Ends the current generation and asks the group for a new one, so
    /// every claim is handed out again.
    fn rejoin(&self);

    /// Closes the connection. Every session token is cancelled.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Record publication over one connection.
#[async_trait]
pub trait ProduceTransport: Send + Sync + 'static {
    /// Resolves once the broker acknowledged the write.
    async fn produce(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: Option<&[u8]>,
    ) -> Result<Ack>;

    /// Waits for outstanding writes, at most `timeout`.
    async fn flush(&self, timeout: Duration) -> Result<()>;
}
