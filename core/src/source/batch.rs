//! Per-claim batching: messages accumulate until the batch is full, the
//! second-of-time boundary moves, or the flush ticker fires. A batch is handed
//! to the sink first and only then marked, so a crash between the two replays
//! the batch instead of losing it.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{ConsumerError, SinkError};
use crate::record::{Record, Tag};
use crate::sink::Sink;
use crate::source::QueueMessage;
use crate::source::consumer::{ConsumerSession, GroupSession};
use crate::source::resolver::SourceResolver;
use crate::source::timestamp::TimestampExtractor;

const DEFAULT_BATCH_SIZE: usize = 512;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(1);
// tokio's interval rejects a zero period
const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Stamp every record with the local clock.
    pub ignore_timestamps: bool,
    /// Sync the sink after each batch, before marking.
    pub sync_per_batch: bool,
    pub sync_timeout: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            ignore_timestamps: false,
            sync_per_batch: false,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
        }
    }
}

/// Pending messages of one claim.
#[derive(Debug)]
pub struct Batch {
    messages: Vec<QueueMessage>,
    capacity: usize,
    boundary: Option<i64>,
}

impl Batch {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: Vec::with_capacity(capacity),
            capacity,
            boundary: None,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.messages.len() >= self.capacity
    }

    /// Second of the last accepted message, cleared when the batch is taken.
    pub fn boundary(&self) -> Option<i64> {
        self.boundary
    }

    /// True when `message` belongs to a different second than the pending ones.
    pub fn crosses_boundary(&self, message: &QueueMessage) -> bool {
        !self.is_empty() && self.boundary.is_some_and(|second| second != message.second())
    }

    pub fn push(&mut self, message: QueueMessage) {
        self.boundary = Some(message.second());
        self.messages.push(message);
    }

    pub fn take(&mut self) -> Vec<QueueMessage> {
        self.boundary = None;
        std::mem::replace(&mut self.messages, Vec::with_capacity(self.capacity))
    }
}

/// What one flush handed to the sink.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    pub records: u64,
    pub bytes: u64,
}

pub struct BatchingEngine<S> {
    sink: Arc<S>,
    tag: Tag,
    settings: BatchSettings,
    resolver: SourceResolver,
    extractor: Option<Arc<dyn TimestampExtractor>>,
    cancel: CancellationToken,
}

impl<S: Sink> BatchingEngine<S> {
    pub fn new(
        sink: Arc<S>,
        tag: Tag,
        settings: BatchSettings,
        resolver: SourceResolver,
        extractor: Option<Arc<dyn TimestampExtractor>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sink,
            tag,
            settings,
            resolver,
            extractor,
            cancel,
        }
    }

    /// Runs one claim to completion. The remaining partial batch is flushed
    /// when the message channel closes. A failed flush ends the claim with
    /// nothing marked from that batch.
    pub async fn run<G: GroupSession>(
        &self,
        session: &G,
        mut messages: mpsc::Receiver<QueueMessage>,
        fallback: Option<IpAddr>,
        counters: &Mutex<ConsumerSession>,
    ) -> Result<(), ConsumerError> {
        let period = self.settings.flush_interval.max(MIN_FLUSH_INTERVAL);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut batch = Batch::new(self.settings.batch_size);

        loop {
            tokio::select! {
                next = messages.recv() => {
                    let Some(message) = next else { break };
                    if batch.crosses_boundary(&message) {
                        self.flush(session, batch.take(), fallback, counters).await?;
                    }
                    batch.push(message);
                    if batch.is_full() {
                        self.flush(session, batch.take(), fallback, counters).await?;
                    }
                }
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.flush(session, batch.take(), fallback, counters).await?;
                    }
                }
            }
        }

        if !batch.is_empty() {
            self.flush(session, batch.take(), fallback, counters).await?;
        }
        Ok(())
    }

    async fn flush<G: GroupSession>(
        &self,
        session: &G,
        messages: Vec<QueueMessage>,
        fallback: Option<IpAddr>,
        counters: &Mutex<ConsumerSession>,
    ) -> Result<(), ConsumerError> {
        let count = messages.len();
        let outcome = self
            .write(&messages, fallback)
            .await
            .map_err(|source| ConsumerError::Flush { count, source })?;

        for message in &messages {
            session.mark_message(message);
        }
        counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(&outcome);
        debug!("Flushed {} entries {} bytes", outcome.records, outcome.bytes);
        Ok(())
    }

    async fn write(
        &self,
        messages: &[QueueMessage],
        fallback: Option<IpAddr>,
    ) -> Result<FlushOutcome, SinkError> {
        let mut outcome = FlushOutcome::default();
        for message in messages {
            let record = Record::new(
                self.tag,
                self.timestamp(message),
                self.resolver.resolve(message, fallback),
                message.payload.clone(),
            );
            let size = record.size();
            self.sink.submit(record).await?;
            outcome.records += 1;
            outcome.bytes += size;
        }

        if self.settings.sync_per_batch {
            self.sink
                .sync(&self.cancel, self.settings.sync_timeout)
                .await?;
        }
        Ok(outcome)
    }

    fn timestamp(&self, message: &QueueMessage) -> DateTime<Utc> {
        if self.settings.ignore_timestamps {
            return Utc::now();
        }
        let Some(extractor) = &self.extractor else {
            return message.timestamp;
        };
        match extractor.extract(&message.payload) {
            Ok(Some(ts)) => ts,
            Ok(None) => message.timestamp,
            Err(e) => {
                warn!("Timestamp extraction failed at offset {}: {}", message.offset, e);
                message.timestamp
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BoxError;
    use crate::sink::MemorySink;
    use crate::source::consumer::testing::{RecordingSession, message};
    use crate::source::timestamp::Rfc3339Extractor;

    fn engine(sink: &Arc<MemorySink>, settings: BatchSettings) -> BatchingEngine<MemorySink> {
        let tag = sink.register_tag("events").unwrap();
        BatchingEngine::new(
            Arc::clone(sink),
            tag,
            settings,
            SourceResolver::default(),
            None,
            CancellationToken::new(),
        )
    }

    fn size(batch_size: usize) -> BatchSettings {
        BatchSettings {
            batch_size,
            ..BatchSettings::default()
        }
    }

    async fn feed(messages: Vec<QueueMessage>) -> mpsc::Receiver<QueueMessage> {
        let (tx, rx) = mpsc::channel(messages.len().max(1));
        for m in messages {
            tx.send(m).await.unwrap();
        }
        rx
    }

    #[test]
    fn batch_tracks_boundary() {
        let mut batch = Batch::new(2);
        assert!(!batch.crosses_boundary(&message(10, 0)));
        batch.push(message(10, 0));
        assert_eq!(batch.boundary(), Some(10));
        assert!(!batch.crosses_boundary(&message(10, 1)));
        assert!(batch.crosses_boundary(&message(11, 1)));

        batch.push(message(10, 1));
        assert!(batch.is_full());
        assert_eq!(batch.take().len(), 2);
        assert_eq!(batch.boundary(), None);
        assert!(batch.is_empty());
    }

    #[test]
    fn zero_capacity_still_batches() {
        let mut batch = Batch::new(0);
        batch.push(message(1, 0));
        assert!(batch.is_full());
    }

    #[tokio::test]
    async fn capacity_and_boundary_flushes_mark_in_order() {
        let sink = Arc::new(MemorySink::new());
        let engine = engine(
            &sink,
            BatchSettings {
                batch_size: 3,
                sync_per_batch: true,
                ..BatchSettings::default()
            },
        );
        let session = RecordingSession::new("m");
        let counters = Mutex::new(ConsumerSession::default());

        let mut input = Vec::new();
        for (offset, second) in [10, 10, 10, 10, 11].into_iter().enumerate() {
            input.push(message(second, offset as i64));
        }
        engine
            .run(&session, feed(input).await, None, &counters)
            .await
            .unwrap();

        let seconds: Vec<i64> = sink.records().iter().map(|r| r.timestamp().timestamp()).collect();
        assert_eq!(seconds, vec![10, 10, 10, 10, 11]);
        assert_eq!(session.marked(), vec![0, 1, 2, 3, 4]);
        // [0,1,2] on capacity, [3] on the second change, [4] at the tail
        assert_eq!(sink.sync_count(), 3);
        let counters = counters.lock().unwrap();
        assert_eq!(counters.record_count, 5);
        assert_eq!(
            counters.byte_count,
            sink.records().iter().map(|r| r.size()).sum::<u64>()
        );
    }

    #[tokio::test]
    async fn failed_submit_marks_nothing() {
        let sink = Arc::new(MemorySink::new().with_limit(2));
        let engine = engine(&sink, size(3));
        let session = RecordingSession::new("m");
        let counters = Mutex::new(ConsumerSession::default());

        let input = (0..3).map(|offset| message(10, offset)).collect();
        let err = engine
            .run(&session, feed(input).await, None, &counters)
            .await
            .unwrap_err();

        assert!(matches!(err, ConsumerError::Flush { count: 3, .. }));
        assert!(session.marked().is_empty());
        assert_eq!(counters.lock().unwrap().record_count, 0);
    }

    #[tokio::test]
    async fn earlier_batches_stay_marked_after_a_failure() {
        let sink = Arc::new(MemorySink::new().with_limit(2));
        let engine = engine(&sink, size(2));
        let session = RecordingSession::new("m");
        let counters = Mutex::new(ConsumerSession::default());

        let input = (0..4).map(|offset| message(10, offset)).collect();
        assert!(engine
            .run(&session, feed(input).await, None, &counters)
            .await
            .is_err());
        assert_eq!(session.marked(), vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_flushes_partial_batch() {
        let sink = Arc::new(MemorySink::new());
        let engine = Arc::new(engine(&sink, size(100)));
        let session = Arc::new(RecordingSession::new("m"));
        let counters = Arc::new(Mutex::new(ConsumerSession::default()));
        let (tx, rx) = mpsc::channel(8);

        let claim = {
            let (engine, session, counters) =
                (Arc::clone(&engine), Arc::clone(&session), Arc::clone(&counters));
            tokio::spawn(async move { engine.run(&*session, rx, None, &counters).await })
        };

        tx.send(message(10, 0)).await.unwrap();
        tx.send(message(10, 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(sink.records().len(), 2);
        assert_eq!(session.marked(), vec![0, 1]);

        drop(tx);
        claim.await.unwrap().unwrap();
        assert_eq!(sink.records().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_flush_interval_still_runs() {
        let sink = Arc::new(MemorySink::new());
        let engine = engine(
            &sink,
            BatchSettings {
                batch_size: 10,
                flush_interval: Duration::ZERO,
                ..BatchSettings::default()
            },
        );
        let session = RecordingSession::new("m");
        let counters = Mutex::new(ConsumerSession::default());

        let input = (0..3).map(|offset| message(10, offset)).collect();
        engine
            .run(&session, feed(input).await, None, &counters)
            .await
            .unwrap();
        assert_eq!(sink.records().len(), 3);
        assert_eq!(session.marked(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn sync_per_batch_runs_before_marking() {
        let sink = Arc::new(MemorySink::new());
        let engine = engine(
            &sink,
            BatchSettings {
                batch_size: 2,
                sync_per_batch: true,
                ..BatchSettings::default()
            },
        );
        let session = RecordingSession::new("m");
        let counters = Mutex::new(ConsumerSession::default());

        let input = (0..4).map(|offset| message(10, offset)).collect();
        engine
            .run(&session, feed(input).await, None, &counters)
            .await
            .unwrap();
        assert_eq!(sink.sync_count(), 2);
        assert_eq!(session.marked(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn failed_sync_marks_nothing() {
        let sink = Arc::new(MemorySink::new());
        let tag = sink.register_tag("events").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let engine = BatchingEngine::new(
            Arc::clone(&sink),
            tag,
            BatchSettings {
                batch_size: 1,
                sync_per_batch: true,
                ..BatchSettings::default()
            },
            SourceResolver::default(),
            None,
            cancel,
        );
        let session = RecordingSession::new("m");
        let counters = Mutex::new(ConsumerSession::default());

        let err = engine
            .run(&session, feed(vec![message(10, 0)]).await, None, &counters)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConsumerError::Flush { source: SinkError::Cancelled, .. }
        ));
        assert!(session.marked().is_empty());
    }

    struct Broken;

    impl TimestampExtractor for Broken {
        fn extract(&self, _payload: &[u8]) -> Result<Option<DateTime<Utc>>, BoxError> {
            Err("unparseable".into())
        }
    }

    #[tokio::test]
    async fn timestamp_policy() {
        let sink = Arc::new(MemorySink::new());
        let tag = sink.register_tag("events").unwrap();
        let with = |extractor: Option<Arc<dyn TimestampExtractor>>, ignore: bool| {
            BatchingEngine::new(
                Arc::clone(&sink),
                tag,
                BatchSettings {
                    ignore_timestamps: ignore,
                    ..BatchSettings::default()
                },
                SourceResolver::default(),
                extractor,
                CancellationToken::new(),
            )
        };

        let mut stamped = message(10, 0);
        stamped.payload = b"at 2024-03-01T12:30:45Z done".to_vec();
        let native = stamped.timestamp;

        let extracted = with(Some(Arc::new(Rfc3339Extractor)), false).timestamp(&stamped);
        assert_eq!(extracted.to_rfc3339(), "2024-03-01T12:30:45+00:00");

        assert_eq!(with(Some(Arc::new(Broken)), false).timestamp(&stamped), native);
        assert_eq!(with(None, false).timestamp(&stamped), native);

        let before = Utc::now();
        assert!(with(Some(Arc::new(Rfc3339Extractor)), true).timestamp(&stamped) >= before);
    }

    #[tokio::test]
    async fn fallback_source_applies_when_unresolved() {
        let sink = Arc::new(MemorySink::new());
        let engine = engine(&sink, size(4));
        let session = RecordingSession::new("m");
        let counters = Mutex::new(ConsumerSession::default());
        let fallback: IpAddr = "10.0.0.254".parse().unwrap();

        engine
            .run(&session, feed(vec![message(1, 0)]).await, Some(fallback), &counters)
            .await
            .unwrap();
        assert_eq!(sink.records()[0].source(), Some(fallback));
    }
}
