//! In-process broker with consumer groups, committed offsets and SASL
//! verification.
//!
//! Every connection authenticates through the mechanism selected by its
//! [`ClientOptions`], against users registered with
//! [`MemoryBroker::add_user`]. Partitions of a topic are spread over the
//! members of a group; every membership change or explicit
//! [`MemoryBroker::rebalance`] ends the current generation.

use crate::auth::{negotiate, ClientOptions, PlainServer, SaslServer, ScramHash, ScramServer};
use crate::broker::{
    Ack, Claim, GroupConnection, InitialOffset, OffsetControl, ProduceTransport, Record, Session,
};
use crate::config::AuthType;
use crate::error::AuthError;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const SCRAM_SALT: &[u8] = b"typed-kafka-memory-broker";
const SCRAM_ITERATIONS: u32 = 4096;

/// One entry of the commit journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEntry {
    pub group: String,
    pub topic: String,
    pub partition: i32,
    /// Offset of the processed record (the stored position is `offset + 1`).
    pub offset: i64,
    pub generation: i32,
}

#[derive(Default)]
struct GroupState {
    generation: i32,
    members: Vec<u64>,
    active: Vec<CancellationToken>,
}

impl GroupState {
    fn end_generation(&mut self) {
        self.generation += 1;
        for token in self.active.drain(..) {
            token.cancel();
        }
    }
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<Record>>>,
    users: HashMap<String, String>,
    committed: HashMap<(String, String, i32), i64>,
    journal: Vec<CommitEntry>,
    groups: HashMap<String, GroupState>,
    next_member: u64,
}

struct Inner {
    state: Mutex<BrokerState>,
    changed: watch::Sender<u64>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changed.send_modify(|version| *version = version.wrapping_add(1));
    }

    fn append(
        &self,
        topic: &str,
        partition: Option<i32>,
        key: Option<&[u8]>,
        payload: Option<&[u8]>,
    ) -> Result<Ack> {
        let ack = {
            let mut state = self.lock();
            let logs = state
                .topics
                .get_mut(topic)
                .ok_or_else(|| Error::Connection(format!("unknown topic {}", topic)))?;
            let partition = match partition {
                Some(partition) => partition,
                None => select_partition(key, logs.len()),
            };
            let log = usize::try_from(partition)
                .ok()
                .and_then(|index| logs.get_mut(index))
                .ok_or_else(|| {
                    Error::Connection(format!("topic {} has no partition {}", topic, partition))
                })?;
            let offset = log.len() as i64;
            log.push(Record {
                topic: topic.to_string(),
                partition,
                offset,
                key: key.map(Bytes::copy_from_slice),
                payload: payload.map(Bytes::copy_from_slice),
                timestamp: Utc::now(),
            });
            Ack { partition, offset }
        };
        self.notify();
        Ok(ack)
    }

    fn record_at(&self, topic: &str, partition: i32, offset: i64) -> Option<Record> {
        let state = self.lock();
        let log = state.topics.get(topic)?.get(usize::try_from(partition).ok()?)?;
        log.get(usize::try_from(offset).ok()?).cloned()
    }
}

/// Shared handle to an in-process broker. Clones refer to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                changed,
            }),
        }
    }

    /// Creates `name` with `partitions` empty partitions. Existing topics are
    /// left untouched.
    pub fn create_topic(&self, name: &str, partitions: usize) {
        let mut state = self.inner.lock();
        state
            .topics
            .entry(name.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1)]);
    }

    pub fn add_user(&self, username: &str, password: &str) {
        let mut state = self.inner.lock();
        state.users.insert(username.to_string(), password.to_string());
    }

    /// Appends a record to an explicit partition.
    pub fn publish(
        &self,
        topic: &str,
        partition: i32,
        key: Option<&[u8]>,
        payload: Option<&[u8]>,
    ) -> Result<i64> {
        self.inner
            .append(topic, Some(partition), key, payload)
            .map(|ack| ack.offset)
    }

    /// Snapshot of one partition's log.
    pub fn records(&self, topic: &str, partition: i32) -> Vec<Record> {
        let state = self.inner.lock();
        usize::try_from(partition)
            .ok()
            .and_then(|index| state.topics.get(topic)?.get(index).cloned())
            .unwrap_or_default()
    }

    /// Next offset the group will read from the partition, if it committed.
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        let state = self.inner.lock();
        state
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Every commit the group made, in order.
    pub fn commits(&self, group: &str) -> Vec<CommitEntry> {
        let state = self.inner.lock();
        state
            .journal
            .iter()
            .filter(|entry| entry.group == group)
            .cloned()
            .collect()
    }

    /// Current generation of the group, `None` if nobody ever joined.
    pub fn generation(&self, group: &str) -> Option<i32> {
        self.inner.lock().groups.get(group).map(|g| g.generation)
    }

    /// Ends the group's current generation; members rejoin and receive new
    /// claims.
    pub fn rebalance(&self, group: &str) {
        {
            let mut state = self.inner.lock();
            if let Some(group_state) = state.groups.get_mut(group) {
                group_state.end_generation();
                info!(
                    group = %group,
                    generation = group_state.generation,
                    "Forced group rebalance"
                );
            }
        }
        self.inner.notify();
    }

    /// Authenticates and joins `group` as a new member consuming `topic`.
    pub fn connect_group(
        &self,
        options: &ClientOptions,
        topic: &str,
        group: &str,
        initial_offset: InitialOffset,
        claim_buffer: usize,
    ) -> Result<MemoryGroupConnection> {
        self.authenticate(options)?;

        let member_id = {
            let mut state = self.inner.lock();
            if !state.topics.contains_key(topic) {
                return Err(Error::Connection(format!("unknown topic {}", topic)));
            }
            state.next_member += 1;
            let member_id = state.next_member;
            let group_state = state.groups.entry(group.to_string()).or_default();
            group_state.members.push(member_id);
            group_state.end_generation();
            member_id
        };
        self.inner.notify();
        debug!(topic = %topic, group = %group, member_id, "Member joined group");

        Ok(MemoryGroupConnection {
            inner: self.inner.clone(),
            member_id,
            group: group.to_string(),
            topic: topic.to_string(),
            initial_offset,
            claim_buffer: claim_buffer.max(1),
            seen_generation: AtomicI32::new(0),
            closed: CancellationToken::new(),
        })
    }

    /// Authenticates a producer connection.
    pub fn connect_producer(&self, options: &ClientOptions) -> Result<MemoryProducer> {
        self.authenticate(options)?;
        Ok(MemoryProducer {
            inner: self.inner.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn authenticate(&self, options: &ClientOptions) -> Result<()> {
        let username = options.username();
        let stored = self
            .inner
            .lock()
            .users
            .get(username)
            .cloned()
            .ok_or_else(|| AuthError::Rejected(format!("unknown user {}", username)))?;

        let mut server: Box<dyn SaslServer> = match options.auth_type() {
            AuthType::Plain => Box::new(PlainServer::new(username, stored)),
            AuthType::ScramSha256 => Box::new(ScramServer::new(
                ScramHash::Sha256,
                username,
                &stored,
                SCRAM_SALT,
                SCRAM_ITERATIONS,
            )?),
            AuthType::ScramSha512 => Box::new(ScramServer::new(
                ScramHash::Sha512,
                username,
                &stored,
                SCRAM_SALT,
                SCRAM_ITERATIONS,
            )?),
        };
        let mut mechanism = options.authenticator();
        negotiate(mechanism.as_mut(), server.as_mut(), username, options.password())?;

        debug!(
            username = %username,
            mechanism = options.mechanism_name(),
            "Client authenticated"
        );
        Ok(())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// One group member's connection to a [`MemoryBroker`].
pub struct MemoryGroupConnection {
    inner: Arc<Inner>,
    member_id: u64,
    group: String,
    topic: String,
    initial_offset: InitialOffset,
    claim_buffer: usize,
    seen_generation: AtomicI32,
    closed: CancellationToken,
}

impl MemoryGroupConnection {
    fn try_join(&self) -> Result<Option<Session>> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        let partitions = state
            .topics
            .get(&self.topic)
            .map(|logs| logs.iter().map(|log| log.len() as i64).collect::<Vec<_>>())
            .ok_or_else(|| Error::Connection(format!("unknown topic {}", self.topic)))?;
        let group = state.groups.get_mut(&self.group).ok_or(Error::Closed)?;
        if group.generation <= self.seen_generation.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let index = group
            .members
            .iter()
            .position(|member| *member == self.member_id)
            .ok_or(Error::Closed)?;
        let members = group.members.len();
        let generation = group.generation;
        let token = self.closed.child_token();
        group.active.push(token.clone());

        let mut feeds = Vec::new();
        for (partition, high_watermark) in partitions.into_iter().enumerate() {
            if partition % members != index {
                continue;
            }
            let partition = partition as i32;
            let start = state
                .committed
                .get(&(self.group.clone(), self.topic.clone(), partition))
                .copied()
                .unwrap_or(match self.initial_offset {
                    InitialOffset::Earliest => 0,
                    InitialOffset::Latest => high_watermark,
                });
            feeds.push((partition, Arc::new(AtomicI64::new(start))));
        }
        drop(guard);
        self.seen_generation.store(generation, Ordering::SeqCst);

        let mut claims = Vec::with_capacity(feeds.len());
        let mut positions = HashMap::with_capacity(feeds.len());
        for (partition, position) in feeds {
            let (tx, rx) = mpsc::channel(self.claim_buffer);
            tokio::spawn(feed_partition(
                self.inner.clone(),
                self.topic.clone(),
                partition,
                position.clone(),
                tx,
                token.clone(),
            ));
            positions.insert(partition, position);
            claims.push(Claim::new(self.topic.clone(), partition, rx));
        }

        info!(
            topic = %self.topic,
            group = %self.group,
            generation,
            claims = claims.len(),
            "Joined group generation"
        );

        let control = Arc::new(MemoryOffsetControl {
            inner: self.inner.clone(),
            group: self.group.clone(),
            generation,
            positions,
            token: token.clone(),
        });
        Ok(Some(Session::new(generation, claims, token, control)))
    }
}

#[async_trait]
impl GroupConnection for MemoryGroupConnection {
    async fn next_session(&self) -> Result<Session> {
        let mut changed = self.inner.changed.subscribe();
        loop {
            if self.closed.is_cancelled() {
                return Err(Error::Closed);
            }
            if let Some(session) = self.try_join()? {
                return Ok(session);
            }
            tokio::select! {
                _ = self.closed.cancelled() => return Err(Error::Closed),
                changed = changed.changed() => {
                    if changed.is_err() {
                        return Err(Error::Closed);
                    }
                }
            }
        }
    }

    fn rejoin(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        {
            let mut state = self.inner.lock();
            if let Some(group) = state.groups.get_mut(&self.group) {
                group.end_generation();
            }
        }
        self.inner.notify();
        debug!(
            group = %self.group,
            member_id = self.member_id,
            "Member asked for a new generation"
        );
    }

    fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        {
            let mut state = self.inner.lock();
            if let Some(group) = state.groups.get_mut(&self.group) {
                group.members.retain(|member| *member != self.member_id);
                group.end_generation();
            }
        }
        self.inner.notify();
        debug!(group = %self.group, member_id = self.member_id, "Member left group");
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl Drop for MemoryGroupConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Streams one partition from `position` until the generation ends.
async fn feed_partition(
    inner: Arc<Inner>,
    topic: String,
    partition: i32,
    position: Arc<AtomicI64>,
    tx: mpsc::Sender<Record>,
    token: CancellationToken,
) {
    let mut changed = inner.changed.subscribe();
    loop {
        let offset = position.load(Ordering::SeqCst);
        match inner.record_at(&topic, partition, offset) {
            Some(record) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    sent = tx.send(record) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
                // A rewind during the send wins over the increment.
                let _ = position.compare_exchange(
                    offset,
                    offset + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
            None => {
                tokio::select! {
                    _ = token.cancelled() => return,
                    changed = changed.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

struct MemoryOffsetControl {
    inner: Arc<Inner>,
    group: String,
    generation: i32,
    positions: HashMap<i32, Arc<AtomicI64>>,
    token: CancellationToken,
}

impl MemoryOffsetControl {
    fn ensure_active(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Connection(format!(
                "generation {} of group {} has ended",
                self.generation, self.group
            )));
        }
        Ok(())
    }
}

impl OffsetControl for MemoryOffsetControl {
    fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.ensure_active()?;
        let mut state = self.inner.lock();
        state
            .committed
            .insert((self.group.clone(), topic.to_string(), partition), offset + 1);
        state.journal.push(CommitEntry {
            group: self.group.clone(),
            topic: topic.to_string(),
            partition,
            offset,
            generation: self.generation,
        });
        Ok(())
    }

    fn rewind(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.ensure_active()?;
        let position = self.positions.get(&partition).ok_or_else(|| {
            Error::Connection(format!("partition {}/{} is not claimed", topic, partition))
        })?;
        position.store(offset, Ordering::SeqCst);
        self.inner.notify();
        Ok(())
    }
}

/// Producer connection to a [`MemoryBroker`].
pub struct MemoryProducer {
    inner: Arc<Inner>,
    closed: AtomicBool,
}

impl MemoryProducer {
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProduceTransport for MemoryProducer {
    async fn produce(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: Option<&[u8]>,
    ) -> Result<Ack> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.inner.append(topic, None, key, payload)
    }

    async fn flush(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

/// Keyed records go to `murmur2(key) % partitions`, the broker default
/// partitioner; unkeyed records go to partition 0.
fn select_partition(key: Option<&[u8]>, partitions: usize) -> i32 {
    match key {
        Some(key) if partitions > 0 => ((murmur2(key) & 0x7fff_ffff) as usize % partitions) as i32,
        _ => 0,
    }
}

fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let mut h = SEED ^ data.len() as u32;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}
