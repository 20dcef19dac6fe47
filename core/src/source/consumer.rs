//! Consumer-group side of the queue adapter.
//!
//! The queue client owns group membership and rebalancing; it calls back into a
//! [`GroupHandler`] once per session (`setup`, `cleanup`) and once per claimed
//! partition (`consume_claim`). [`ConsumerCoordinator`] is that handler plus the
//! start/close discipline shared with the flow listeners.

use std::future::Future;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, error, info, warn};

use crate::errors::{BoxError, ConsumerError};
use crate::record::Tag;
use crate::shutdown::Closer;
use crate::sink::Sink;
use crate::source::QueueMessage;
use crate::source::batch::{BatchSettings, BatchingEngine, FlushOutcome};
use crate::source::resolver::SourceResolver;
use crate::source::timestamp::TimestampExtractor;

const CLEANUP_SYNC_TIMEOUT: Duration = Duration::from_secs(10);
const REJOIN_BACKOFF: Duration = Duration::from_secs(1);

/// One rebalance epoch as seen by the handler.
pub trait GroupSession: Send + Sync {
    fn member_id(&self) -> &str;

    /// Marks `message` as consumed so its offset is committed.
    fn mark_message(&self, message: &QueueMessage);
}

/// The messages of one partition assigned to this member for a session.
/// The client closes the channel when the claim ends.
pub struct Claim {
    topic: String,
    partition: i32,
    messages: mpsc::Receiver<QueueMessage>,
}

impl Claim {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        messages: mpsc::Receiver<QueueMessage>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            messages,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub(crate) fn into_messages(self) -> mpsc::Receiver<QueueMessage> {
        self.messages
    }
}

/// Session hooks invoked by the queue client.
pub trait GroupHandler: Send + Sync {
    fn setup<G: GroupSession>(
        &self,
        session: &G,
    ) -> impl Future<Output = Result<(), ConsumerError>> + Send;

    fn consume_claim<G: GroupSession>(
        &self,
        session: &G,
        claim: Claim,
    ) -> impl Future<Output = Result<(), ConsumerError>> + Send;

    fn cleanup<G: GroupSession>(
        &self,
        session: &G,
    ) -> impl Future<Output = Result<(), ConsumerError>> + Send;
}

/// The queue client. It stays a black box that drives a [`GroupHandler`].
pub trait ConsumerGroupClient: Send + 'static {
    /// Joins the group and drives one session through `handler`, returning when
    /// the session ends. Must return promptly once `cancel` fires.
    fn consume<H: GroupHandler>(
        &mut self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: &H,
    ) -> impl Future<Output = Result<(), ConsumerError>> + Send;
}

/// Counters for the current session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerSession {
    pub member_id: String,
    pub record_count: u64,
    pub byte_count: u64,
}

impl ConsumerSession {
    fn reset(&mut self, member_id: &str) {
        self.member_id = member_id.to_string();
        self.record_count = 0;
        self.byte_count = 0;
    }

    pub(crate) fn record(&mut self, outcome: &FlushOutcome) {
        self.record_count += outcome.records;
        self.byte_count += outcome.bytes;
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub name: String,
    pub topic: String,
    pub group: String,
    pub tag: String,
    pub batch: BatchSettings,
    pub resolver: SourceResolver,
}

pub struct ConsumerHandler<S> {
    topic: String,
    group: String,
    sink: Arc<S>,
    engine: BatchingEngine<S>,
    cancel: CancellationToken,
    session: Mutex<ConsumerSession>,
    fallback: Mutex<Option<IpAddr>>,
}

impl<S: Sink> ConsumerHandler<S> {
    pub fn session(&self) -> ConsumerSession {
        lock(&self.session).clone()
    }
}

impl<S: Sink> GroupHandler for ConsumerHandler<S> {
    async fn setup<G: GroupSession>(&self, session: &G) -> Result<(), ConsumerError> {
        let member = session.member_id();
        info!("Kafka consumer {} starting", member);
        lock(&self.session).reset(member);

        info!("Kafka consumer {} waiting for ready sink", member);
        tokio::select! {
            res = self.sink.wait_until_ready(&self.cancel, None) => res?,
            _ = self.cancel.cancelled() => return Err(ConsumerError::Cancelled),
        }

        let src = self.sink.local_source_address()?;
        *lock(&self.fallback) = Some(src);
        info!("Consumer setup complete, got source {}", src);
        Ok(())
    }

    async fn consume_claim<G: GroupSession>(
        &self,
        session: &G,
        claim: Claim,
    ) -> Result<(), ConsumerError> {
        if claim.topic() != self.topic {
            return Err(ConsumerError::TopicMismatch {
                expected: self.topic.clone(),
                found: claim.topic().to_string(),
            });
        }

        let partition = claim.partition();
        info!(
            "Consumer {} group {} partition {} started",
            session.member_id(),
            self.group,
            partition
        );
        let fallback = *lock(&self.fallback);
        if let Err(e) = self
            .engine
            .run(session, claim.into_messages(), fallback, &self.session)
            .await
        {
            error!("{}", e);
            return Err(e);
        }
        info!(
            "Consumer {} group {} partition {} exited",
            session.member_id(),
            self.group,
            partition
        );
        Ok(())
    }

    async fn cleanup<G: GroupSession>(&self, session: &G) -> Result<(), ConsumerError> {
        info!("Kafka consumer {} cleaning up", session.member_id());
        let counters = self.session();
        self.sink.report_info(&format!(
            "Kafka group {} ({}) wrote {} entries {} bytes",
            self.group, counters.member_id, counters.record_count, counters.byte_count
        ));

        // not tied to the adapter token: a shutdown still gets its final sync
        match self
            .sink
            .sync(&CancellationToken::new(), CLEANUP_SYNC_TIMEOUT)
            .await
        {
            Ok(()) => info!("Consumer cleanup complete"),
            Err(e) => warn!("Consumer cleanup failed: {}", e),
        }
        Ok(())
    }
}

struct CoordinatorState {
    started: bool,
    // taken by the first close
    cancel: Option<CancellationToken>,
}

pub struct ConsumerCoordinator<S> {
    name: String,
    topic: String,
    handler: Arc<ConsumerHandler<S>>,
    state: Mutex<CoordinatorState>,
}

impl<S: Sink> ConsumerCoordinator<S> {
    pub fn new(
        settings: ConsumerSettings,
        sink: Arc<S>,
        extractor: Option<Arc<dyn TimestampExtractor>>,
    ) -> Result<Self, ConsumerError> {
        if settings.batch.batch_size == 0 {
            return Err(ConsumerError::InvalidSettings {
                reason: format!("{}: batch size must be positive", settings.name),
            });
        }
        if settings.batch.flush_interval.is_zero() {
            return Err(ConsumerError::InvalidSettings {
                reason: format!("{}: flush interval must be positive", settings.name),
            });
        }
        let tag: Tag = sink.register_tag(&settings.tag)?;
        let cancel = CancellationToken::new();
        let engine = BatchingEngine::new(
            Arc::clone(&sink),
            tag,
            settings.batch,
            settings.resolver,
            extractor,
            cancel.clone(),
        );

        let handler = ConsumerHandler {
            topic: settings.topic.clone(),
            group: settings.group,
            sink,
            engine,
            cancel: cancel.clone(),
            session: Mutex::new(ConsumerSession::default()),
            fallback: Mutex::new(None),
        };

        Ok(Self {
            name: settings.name,
            topic: settings.topic,
            handler: Arc::new(handler),
            state: Mutex::new(CoordinatorState {
                started: false,
                cancel: Some(cancel),
            }),
        })
    }

    pub fn handler(&self) -> Arc<ConsumerHandler<S>> {
        Arc::clone(&self.handler)
    }

    pub fn session(&self) -> ConsumerSession {
        self.handler.session()
    }

    /// Spawns the consume routine on `tracker`.
    pub fn start<C: ConsumerGroupClient>(
        &self,
        client: C,
        tracker: &TaskTracker,
    ) -> Result<(), ConsumerError> {
        let mut state = lock(&self.state);
        if state.started {
            return Err(ConsumerError::AlreadyStarted);
        }
        let Some(cancel) = state.cancel.clone() else {
            return Err(ConsumerError::AlreadyClosed);
        };

        state.started = true;
        tracker.spawn(
            routine(
                client,
                Arc::clone(&self.handler),
                cancel,
                vec![self.topic.clone()],
            )
            .in_current_span(),
        );
        info!("{} started", self.name);
        Ok(())
    }

    /// Cancels the shared token. Safe while a session is active; in-flight
    /// flushes finish before the session observes it.
    pub fn close(&self) -> Result<(), ConsumerError> {
        let cancel = lock(&self.state)
            .cancel
            .take()
            .ok_or(ConsumerError::AlreadyClosed)?;
        cancel.cancel();
        info!("{} closed", self.name);
        Ok(())
    }
}

impl<S: Sink> Closer for ConsumerCoordinator<S> {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn close(&self) -> Result<(), BoxError> {
        ConsumerCoordinator::close(self).map_err(Into::into)
    }
}

/// Re-joins after every session end. A failed flush or an unready sink only
/// ends the session, so the routine backs off and re-joins to get the
/// unmarked messages redelivered. Any other client error stops it.
async fn routine<C, H>(mut client: C, handler: Arc<H>, cancel: CancellationToken, topics: Vec<String>)
where
    C: ConsumerGroupClient,
    H: GroupHandler,
{
    let mut attempt = 0u64;
    loop {
        attempt += 1;
        info!("Consumer start attempt {}", attempt);
        let result = client.consume(&cancel, &topics, handler.as_ref()).await;
        if cancel.is_cancelled() {
            break;
        }
        match result {
            Ok(()) => {}
            Err(e) if e.is_session_scoped() => {
                warn!("Consumer session ended: {}, re-joining in {:?}", e, REJOIN_BACKOFF);
                tokio::select! {
                    _ = tokio::time::sleep(REJOIN_BACKOFF) => {}
                    _ = cancel.cancelled() => break,
                }
            }
            Err(e) => {
                error!("Consumer error: {}", e);
                break;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
