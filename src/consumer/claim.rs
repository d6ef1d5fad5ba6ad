//! Per-claim consumption: decode, call back, commit or rewind.

use crate::broker::{Claim, OffsetControl, Record};
use crate::codec::{decode_key, MessageCodec};
use crate::consumer::handler::{DecodeFailurePolicy, RecordContext, RecordHandler};
use crate::consumer::RunnerOptions;
use crate::error::DecodeError;
use futures::FutureExt;
use std::any::Any;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Tracks which offsets of a claim may still be processed.
///
/// After a failure the claim is rewound: records already buffered past the
/// failed offset are discarded until the broker replays from it, so commits
/// never move past a record that has not succeeded.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct ClaimCursor {
    next: Option<i64>,
    rewind_target: Option<i64>,
}

impl ClaimCursor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Whether the record at `offset` is the one to process next.
    pub(crate) fn accept(&mut self, offset: i64) -> bool {
        if let Some(target) = self.rewind_target {
            if offset > target {
                return false;
            }
            self.rewind_target = None;
            return true;
        }
        self.next.map_or(true, |next| offset >= next)
    }

    pub(crate) fn advance(&mut self, offset: i64) {
        self.next = Some(offset + 1);
    }

    pub(crate) fn rewind(&mut self, offset: i64) {
        self.next = Some(offset);
        self.rewind_target = Some(offset);
    }
}

/// Result of handling one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Commit,
    Skip,
    Redeliver,
}

/// Everything the claim tasks of a runner share.
pub(crate) struct Pipeline<E, C, H> {
    pub(crate) codec: C,
    pub(crate) handler: H,
    pub(crate) options: RunnerOptions,
    pub(crate) _payload: PhantomData<fn() -> E>,
}

pub(crate) struct ClaimWorker<E, C, H> {
    claim: Claim,
    control: Arc<dyn OffsetControl>,
    token: CancellationToken,
    generation: i32,
    pipeline: Arc<Pipeline<E, C, H>>,
}

impl<E, C, H> ClaimWorker<E, C, H>
where
    E: Send + 'static,
    C: MessageCodec<E>,
    H: RecordHandler<E>,
{
    pub(crate) fn new(
        claim: Claim,
        control: Arc<dyn OffsetControl>,
        token: CancellationToken,
        generation: i32,
        pipeline: Arc<Pipeline<E, C, H>>,
    ) -> Self {
        Self {
            claim,
            control,
            token,
            generation,
            pipeline,
        }
    }

    /// Consumes the claim until its stream closes or the generation is
    /// cancelled.
    pub(crate) async fn run(mut self) {
        let topic = self.claim.topic().to_string();
        let partition = self.claim.partition();
        let mut cursor = ClaimCursor::new();
        debug!(topic = %topic, partition, generation = self.generation, "Claim started");

        loop {
            let record = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    debug!(topic = %topic, partition, "Claim cancelled");
                    return;
                }
                record = self.claim.next() => match record {
                    Some(record) => record,
                    None => {
                        debug!(topic = %topic, partition, "message channel was closed");
                        return;
                    }
                },
            };

            if !cursor.accept(record.offset) {
                trace!(topic = %topic, partition, offset = record.offset, "Skipping stale record");
                continue;
            }

            match self.process(&record).await {
                Outcome::Commit => {
                    cursor.advance(record.offset);
                    if let Err(e) = self.control.commit(&topic, partition, record.offset) {
                        warn!(
                            topic = %topic,
                            partition,
                            offset = record.offset,
                            error = %e,
                            "Failed to commit offset"
                        );
                    }
                }
                Outcome::Skip => cursor.advance(record.offset),
                Outcome::Redeliver => {
                    cursor.rewind(record.offset);
                    if !self.rewind(&topic, partition, record.offset).await {
                        return;
                    }
                }
            }
        }
    }

    /// Waits out the redelivery backoff and asks the broker to replay from
    /// `offset`, retrying until the broker accepts. Returns `false` once the
    /// generation is cancelled.
    async fn rewind(&self, topic: &str, partition: i32, offset: i64) -> bool {
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return false,
                _ = tokio::time::sleep(self.pipeline.options.redelivery_backoff()) => {}
            }
            match self.control.rewind(topic, partition, offset) {
                Ok(()) => return true,
                Err(e) => warn!(
                    topic = %topic,
                    partition,
                    offset,
                    error = %e,
                    "Failed to rewind claim, retrying"
                ),
            }
        }
    }

    /// Decodes and hands one record to the callback. A panic anywhere in
    /// the codec, the dead-letter sink or the callback redelivers the record.
    async fn process(&self, record: &Record) -> Outcome {
        match AssertUnwindSafe(self.handle(record)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                error!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    panic = %panic_message(panic.as_ref()),
                    "Record processing panicked, record will be redelivered"
                );
                Outcome::Redeliver
            }
        }
    }

    async fn handle(&self, record: &Record) -> Outcome {
        let key = decode_key(record.key.as_deref());
        let payload = match record.payload.as_deref().filter(|bytes| !bytes.is_empty()) {
            None => None,
            Some(bytes) => match self.pipeline.codec.decode(bytes) {
                Ok(payload) => Some(payload),
                Err(e) => return self.on_decode_failure(record, e).await,
            },
        };

        let ctx = RecordContext {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            generation: self.generation,
            cancellation: self.token.clone(),
        };
        let result = self
            .pipeline
            .handler
            .handle(ctx, key, payload, record.timestamp)
            .await;

        match result {
            Ok(()) => Outcome::Commit,
            Err(e) => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %format!("{:#}", e),
                    "Callback failed, record will be redelivered"
                );
                Outcome::Redeliver
            }
        }
    }

    async fn on_decode_failure(&self, record: &Record, e: DecodeError) -> Outcome {
        match &self.pipeline.options.decode_failure {
            DecodeFailurePolicy::Drop => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Dropping record with undecodable payload"
                );
                Outcome::Skip
            }
            DecodeFailurePolicy::Redeliver => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Undecodable payload, record will be redelivered"
                );
                Outcome::Redeliver
            }
            DecodeFailurePolicy::DeadLetter(sink) => match sink.dead_letter(record, &e).await {
                Ok(()) => {
                    info!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        error = %e,
                        "Undecodable record dead-lettered"
                    );
                    Outcome::Commit
                }
                Err(sink_error) => {
                    error!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        error = %sink_error,
                        "Failed to dead-letter record, it will be redelivered"
                    );
                    Outcome::Redeliver
                }
            },
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::consumer::handler::DeadLetterSink;
    use crate::Result;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[test]
    fn test_cursor_in_order() {
        let mut cursor = ClaimCursor::new();
        assert!(cursor.accept(5));
        cursor.advance(5);
        assert!(!cursor.accept(5));
        assert!(cursor.accept(6));
    }

    #[test]
    fn test_cursor_discards_buffered_records_after_rewind() {
        let mut cursor = ClaimCursor::new();
        assert!(cursor.accept(0));
        cursor.advance(0);
        assert!(cursor.accept(1));
        cursor.rewind(1);

        // 2 and 3 were buffered before the rewind took effect.
        assert!(!cursor.accept(2));
        assert!(!cursor.accept(3));
        assert!(cursor.accept(1));
        cursor.advance(1);
        assert!(cursor.accept(2));
    }

    #[derive(Default)]
    struct RecordingControl {
        commits: Mutex<Vec<i64>>,
        rewinds: Mutex<Vec<i64>>,
    }

    impl OffsetControl for RecordingControl {
        fn commit(&self, _topic: &str, _partition: i32, offset: i64) -> Result<()> {
            self.commits.lock().unwrap().push(offset);
            Ok(())
        }

        fn rewind(&self, _topic: &str, _partition: i32, offset: i64) -> Result<()> {
            self.rewinds.lock().unwrap().push(offset);
            Ok(())
        }
    }

    fn record(offset: i64, payload: &str) -> Record {
        Record {
            topic: "orders".to_string(),
            partition: 0,
            offset,
            key: Some(Bytes::from_static(b"k")),
            payload: Some(Bytes::copy_from_slice(payload.as_bytes())),
            timestamp: Utc::now(),
        }
    }

    fn options(decode_failure: DecodeFailurePolicy) -> RunnerOptions {
        RunnerOptions {
            redelivery_backoff_ms: 1,
            decode_failure,
            ..RunnerOptions::default()
        }
    }

    async fn accept_all(
        _ctx: RecordContext,
        _key: String,
        _payload: Option<u32>,
        _ts: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn run_worker<H>(
        records: Vec<Record>,
        handler: H,
        options: RunnerOptions,
    ) -> Arc<RecordingControl>
    where
        H: RecordHandler<u32>,
    {
        let (tx, rx) = mpsc::channel(records.len().max(1));
        for record in records {
            tx.send(record).await.unwrap();
        }
        drop(tx);

        let control = Arc::new(RecordingControl::default());
        let pipeline = Arc::new(Pipeline {
            codec: JsonCodec::<u32>::new(),
            handler,
            options,
            _payload: PhantomData,
        });
        let worker = ClaimWorker::new(
            Claim::new("orders", 0, rx),
            control.clone(),
            CancellationToken::new(),
            1,
            pipeline,
        );
        worker.run().await;
        control
    }

    #[tokio::test]
    async fn test_commits_in_offset_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let seen = seen.clone();
            move |ctx: RecordContext, key: String, payload: Option<u32>, _ts: DateTime<Utc>| {
                let seen = seen.clone();
                async move {
                    assert_eq!(key, "k");
                    seen.lock().unwrap().push((ctx.offset, payload));
                    anyhow::Ok(())
                }
            }
        };

        let records = (0..4).map(|i| record(i, &i.to_string())).collect();
        let control = run_worker(records, handler, options(DecodeFailurePolicy::Drop)).await;

        assert_eq!(*control.commits.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(0, Some(0)), (1, Some(1)), (2, Some(2)), (3, Some(3))]
        );
    }

    #[tokio::test]
    async fn test_failure_rewinds_and_skips_buffered_records() {
        let handler =
            |ctx: RecordContext, _key: String, _: Option<u32>, _ts: DateTime<Utc>| async move {
                if ctx.offset == 1 {
                    anyhow::bail!("downstream unavailable");
                }
                anyhow::Ok(())
            };

        let records = vec![record(0, "0"), record(1, "1"), record(2, "2")];
        let control = run_worker(records, handler, options(DecodeFailurePolicy::Drop)).await;

        // Record 2 was buffered past the failure and must not be committed
        // before record 1 is replayed.
        assert_eq!(*control.commits.lock().unwrap(), vec![0]);
        assert_eq!(*control.rewinds.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_panicking_callback_is_contained() {
        let handler =
            |ctx: RecordContext, _key: String, _: Option<u32>, _ts: DateTime<Utc>| async move {
                if ctx.offset == 0 {
                    panic!("boom");
                }
                anyhow::Ok(())
            };

        let control =
            run_worker(vec![record(0, "0")], handler, options(DecodeFailurePolicy::Drop)).await;
        assert!(control.commits.lock().unwrap().is_empty());
        assert_eq!(*control.rewinds.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_decode_failure_drop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = {
            let calls = calls.clone();
            move |_ctx: RecordContext, _key: String, _payload: Option<u32>, _ts: DateTime<Utc>| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { anyhow::Ok(()) }
            }
        };

        let records = vec![record(0, "not json"), record(1, "7")];
        let control = run_worker(records, handler, options(DecodeFailurePolicy::Drop)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*control.commits.lock().unwrap(), vec![1]);
        assert!(control.rewinds.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_decode_failure_redeliver() {
        let handler = accept_all;

        let control = run_worker(
            vec![record(0, "{"), record(1, "1")],
            handler,
            options(DecodeFailurePolicy::Redeliver),
        )
        .await;
        assert!(control.commits.lock().unwrap().is_empty());
        assert_eq!(*control.rewinds.lock().unwrap(), vec![0]);
    }

    #[derive(Default)]
    struct CollectingSink {
        offsets: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl DeadLetterSink for CollectingSink {
        async fn dead_letter(&self, record: &Record, _error: &DecodeError) -> Result<()> {
            self.offsets.lock().unwrap().push(record.offset);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_decode_failure_dead_letter_commits() {
        let sink = Arc::new(CollectingSink::default());
        let handler = accept_all;

        let control = run_worker(
            vec![record(0, "[]"), record(1, "1")],
            handler,
            options(DecodeFailurePolicy::DeadLetter(sink.clone())),
        )
        .await;
        assert_eq!(*sink.offsets.lock().unwrap(), vec![0]);
        assert_eq!(*control.commits.lock().unwrap(), vec![0, 1]);
    }

    struct PanickingSink;

    #[async_trait]
    impl DeadLetterSink for PanickingSink {
        async fn dead_letter(&self, _record: &Record, _error: &DecodeError) -> Result<()> {
            panic!("sink bug");
        }
    }

    #[tokio::test]
    async fn test_panicking_dead_letter_sink_is_contained() {
        let control = run_worker(
            vec![record(0, "[]")],
            accept_all,
            options(DecodeFailurePolicy::DeadLetter(Arc::new(PanickingSink))),
        )
        .await;
        assert!(control.commits.lock().unwrap().is_empty());
        assert_eq!(*control.rewinds.lock().unwrap(), vec![0]);
    }

    /// Replays the log on rewind, rejecting the first rewind. Cancels
    /// `done` once the last record is committed.
    struct ReplayingControl {
        log: Vec<Record>,
        tx: mpsc::Sender<Record>,
        rewind_attempts: AtomicUsize,
        commits: Mutex<Vec<i64>>,
        done: CancellationToken,
    }

    impl OffsetControl for ReplayingControl {
        fn commit(&self, _topic: &str, _partition: i32, offset: i64) -> Result<()> {
            self.commits.lock().unwrap().push(offset);
            if offset == self.log.len() as i64 - 1 {
                self.done.cancel();
            }
            Ok(())
        }

        fn rewind(&self, _topic: &str, _partition: i32, offset: i64) -> Result<()> {
            if self.rewind_attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(crate::Error::Connection("seek timed out".to_string()));
            }
            for record in self.log.iter().filter(|r| r.offset >= offset) {
                self.tx.try_send(record.clone()).unwrap();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_rewind_is_retried() {
        let log: Vec<Record> = (0..4).map(|i| record(i, &i.to_string())).collect();
        let (tx, rx) = mpsc::channel(16);
        for record in &log {
            tx.send(record.clone()).await.unwrap();
        }
        let done = CancellationToken::new();
        let control = Arc::new(ReplayingControl {
            log,
            tx,
            rewind_attempts: AtomicUsize::new(0),
            commits: Mutex::new(Vec::new()),
            done: done.clone(),
        });

        let calls = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let calls = calls.clone();
            move |ctx: RecordContext, _key: String, _: Option<u32>, _ts: DateTime<Utc>| {
                let calls = calls.clone();
                async move {
                    let mut calls = calls.lock().unwrap();
                    calls.push(ctx.offset);
                    if ctx.offset == 1 && calls.iter().filter(|o| **o == 1).count() == 1 {
                        anyhow::bail!("downstream unavailable");
                    }
                    anyhow::Ok(())
                }
            }
        };
        let pipeline = Arc::new(Pipeline {
            codec: JsonCodec::<u32>::new(),
            handler,
            options: options(DecodeFailurePolicy::Drop),
            _payload: PhantomData,
        });

        let worker = ClaimWorker::new(
            Claim::new("orders", 0, rx),
            control.clone(),
            done,
            1,
            pipeline,
        );
        tokio::time::timeout(std::time::Duration::from_secs(5), worker.run())
            .await
            .unwrap();

        assert_eq!(control.rewind_attempts.load(Ordering::SeqCst), 2);
        assert_eq!(*control.commits.lock().unwrap(), vec![0, 1, 2, 3]);
        // 2 and 3 were discarded while waiting for the replay of 1.
        assert_eq!(*calls.lock().unwrap(), vec![0, 1, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_tombstone_is_none() {
        let handler =
            |_ctx: RecordContext, key: String, body: Option<u32>, _ts: DateTime<Utc>| async move {
                assert_eq!(key, "");
                assert_eq!(body, None);
                anyhow::Ok(())
            };
        let mut tombstone = record(0, "");
        tombstone.key = None;
        tombstone.payload = None;

        let control =
            run_worker(vec![tombstone], handler, options(DecodeFailurePolicy::Drop)).await;
        assert_eq!(*control.commits.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_cancelled_claim_stops_without_processing() {
        let (_tx, rx) = mpsc::channel::<Record>(1);
        let token = CancellationToken::new();
        token.cancel();
        let pipeline = Arc::new(Pipeline {
            codec: JsonCodec::<u32>::new(),
            handler: accept_all,
            options: RunnerOptions::default(),
            _payload: PhantomData,
        });
        let control = Arc::new(RecordingControl::default());
        ClaimWorker::new(Claim::new("orders", 0, rx), control.clone(), token, 1, pipeline)
            .run()
            .await;
        assert!(control.commits.lock().unwrap().is_empty());
    }

    #[test]
    fn test_panic_message() {
        let owned: Box<dyn Any + Send> = Box::new("boom".to_string());
        assert_eq!(panic_message(owned.as_ref()), "boom");
        let borrowed: Box<dyn Any + Send> = Box::new("bang");
        assert_eq!(panic_message(borrowed.as_ref()), "bang");
    }
}
