//! rdkafka consumer-group client.
//!
//! A session lasts one assignment epoch: it opens when the group hands this
//! member partitions and ends when they are revoked, a claim fails, or the
//! adapter is cancelled. Each assigned partition gets its own claim.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::StreamExt;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::{Headers, Message};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConsumerConfig;
use crate::errors::ConsumerError;
use crate::source::QueueMessage;
use crate::source::consumer::{Claim, ConsumerGroupClient, GroupHandler, GroupSession};

const CLAIM_BUFFER: usize = 1024;

pub type TopicPartition = (String, i32);

/// Partition ownership changes reported by the group protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    Assigned(Vec<TopicPartition>),
    Revoked(Vec<TopicPartition>),
}

/// Forwards rebalance callbacks from librdkafka's poll into the session loop.
pub struct RebalanceContext {
    events: mpsc::UnboundedSender<RebalanceEvent>,
}

impl RebalanceContext {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RebalanceEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        let event = match rebalance {
            Rebalance::Assign(tpl) => RebalanceEvent::Assigned(partitions(tpl)),
            Rebalance::Revoke(tpl) => {
                // the first join reports an empty revoke
                if tpl.count() == 0 {
                    return;
                }
                RebalanceEvent::Revoked(partitions(tpl))
            }
            Rebalance::Error(message) => {
                error!("Error during Kafka consumer group rebalance: {}", message);
                return;
            }
        };
        // the receiver only goes away with the client
        let _ = self.events.send(event);
    }
}

fn partitions(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|tp| (tp.topic().to_string(), tp.partition()))
        .collect()
}

/// Partitions this member owns, kept current from the rebalance events.
struct Assignment {
    events: mpsc::UnboundedReceiver<RebalanceEvent>,
    partitions: Vec<TopicPartition>,
}

impl Assignment {
    fn drain(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            apply(&mut self.partitions, event);
        }
    }
}

/// Folds one rebalance event into the current assignment.
fn apply(assigned: &mut Vec<TopicPartition>, event: RebalanceEvent) {
    match event {
        RebalanceEvent::Assigned(added) => {
            for tp in added {
                if !assigned.contains(&tp) {
                    assigned.push(tp);
                }
            }
        }
        RebalanceEvent::Revoked(removed) => assigned.retain(|tp| !removed.contains(tp)),
    }
}

/// First and last offsets a session pulled from the stream, per partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SeenRange {
    first: i64,
    last: i64,
}

fn note_seen(seen: &mut HashMap<TopicPartition, SeenRange>, message: &QueueMessage) {
    seen.entry((message.topic.clone(), message.partition))
        .and_modify(|range| range.last = range.last.max(message.offset))
        .or_insert(SeenRange {
            first: message.offset,
            last: message.offset,
        });
}

/// Where each still-assigned partition must restart so that messages pulled
/// but never marked are delivered again. `marked` holds next-to-read offsets.
fn rewind_targets(
    seen: &HashMap<TopicPartition, SeenRange>,
    marked: &HashMap<TopicPartition, i64>,
    assigned: &[TopicPartition],
) -> Vec<(TopicPartition, i64)> {
    let mut targets: Vec<_> = seen
        .iter()
        .filter(|(tp, _)| assigned.contains(tp))
        .filter_map(|(tp, range)| {
            let resume = marked.get(tp).copied().unwrap_or(range.first);
            (resume <= range.last).then(|| (tp.clone(), resume))
        })
        .collect();
    targets.sort();
    targets
}

/// Consumer-group client over rdkafka's `StreamConsumer`.
///
/// Offsets are stored only when the handler marks a message and are committed
/// in the background by librdkafka's auto-commit of stored offsets.
pub struct KafkaGroupClient {
    consumer: Arc<StreamConsumer<RebalanceContext>>,
    assignment: Assignment,
    subscribed: bool,
    group: String,
    sessions: u64,
}

impl KafkaGroupClient {
    pub fn new(config: &KafkaConsumerConfig) -> Result<Self, ConsumerError> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.consumer_group)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.commit.interval.ms", "1000")
            .set(
                "auto.offset.reset",
                config.auto_offset_reset.as_deref().unwrap_or("earliest"),
            );

        if let Some(timeout) = config.session_timeout_ms {
            client_config.set("session.timeout.ms", timeout.to_string());
        }

        if let Some(heartbeat) = config.heartbeat_interval_ms {
            client_config.set("heartbeat.interval.ms", heartbeat.to_string());
        }

        if let Some(security_protocol) = &config.security_protocol {
            client_config.set("security.protocol", security_protocol);
        }

        if let Some(sasl_mechanisms) = &config.sasl_mechanisms {
            client_config.set("sasl.mechanisms", sasl_mechanisms);
        }

        if let Some(sasl_username) = &config.sasl_username {
            client_config.set("sasl.username", sasl_username);
        }

        if let Some(sasl_password) = &config.sasl_password {
            client_config.set("sasl.password", sasl_password);
        }

        if let Some(ssl_ca_location) = &config.ssl_ca_location {
            client_config.set("ssl.ca.location", ssl_ca_location);
        }

        let (context, events) = RebalanceContext::new();
        let consumer: StreamConsumer<RebalanceContext> = client_config
            .create_with_context(context)
            .map_err(client_error)?;

        Ok(Self {
            consumer: Arc::new(consumer),
            assignment: Assignment {
                events,
                partitions: Vec::new(),
            },
            subscribed: false,
            group: config.consumer_group.clone(),
            sessions: 0,
        })
    }

    fn rewind(&self, seen: &HashMap<TopicPartition, SeenRange>, session: &KafkaSession) {
        let marked = session
            .marked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for ((topic, partition), offset) in rewind_targets(seen, &marked, &self.assignment.partitions) {
            match self
                .consumer
                .seek(&topic, partition, Offset::Offset(offset), Duration::ZERO)
            {
                Ok(()) => info!("Rewound {}/{} to offset {}", topic, partition, offset),
                Err(e) => warn!("Failed to rewind {}/{} to {}: {}", topic, partition, offset, e),
            }
        }
    }
}

impl ConsumerGroupClient for KafkaGroupClient {
    async fn consume<H: GroupHandler>(
        &mut self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: &H,
    ) -> Result<(), ConsumerError> {
        if !self.subscribed {
            let names: Vec<&str> = topics.iter().map(String::as_str).collect();
            self.consumer.subscribe(&names).map_err(client_error)?;
            self.subscribed = true;
            info!("Subscribed to Kafka topics: {}", topics.join(","));
        }

        let consumer = Arc::clone(&self.consumer);
        let mut stream = consumer
            .stream()
            .map(|next| next.map(|borrowed| to_queue_message(&borrowed)));
        let mut seen = HashMap::new();
        let mut early = Vec::new();

        // librdkafka raises rebalance callbacks while the stream is polled
        let assignment = &mut self.assignment;
        assignment.drain();
        if assignment.partitions.is_empty() {
            if let Ok(tpl) = consumer.assignment() {
                assignment.partitions = partitions(&tpl);
            }
        }
        while assignment.partitions.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    consumer.unsubscribe();
                    self.subscribed = false;
                    return Ok(());
                }
                Some(event) = assignment.events.recv() => apply(&mut assignment.partitions, event),
                next = stream.next() => match next {
                    Some(Ok(message)) => {
                        note_seen(&mut seen, &message);
                        early.push(message);
                    }
                    Some(Err(e)) => return Err(client_error(e)),
                    None => return Ok(()),
                },
            }
        }

        self.sessions += 1;
        let session = KafkaSession {
            consumer: Arc::clone(&self.consumer),
            member_id: format!("{}-{}", self.group, self.sessions),
            marked: Mutex::new(HashMap::new()),
        };
        info!(
            "Kafka session {} assigned {} partitions",
            session.member_id,
            self.assignment.partitions.len()
        );

        let outcome = match handler.setup(&session).await {
            Ok(()) => {
                let claimed = run_claims(
                    cancel,
                    handler,
                    &session,
                    &mut stream,
                    &mut self.assignment,
                    &mut seen,
                    early,
                )
                .await;
                let cleaned = handler.cleanup(&session).await;
                claimed.and(cleaned)
            }
            Err(e) => Err(e),
        };

        if cancel.is_cancelled() {
            self.consumer.unsubscribe();
            self.subscribed = false;
        } else {
            self.assignment.drain();
            self.rewind(&seen, &session);
        }
        outcome
    }
}

/// Pumps the stream into one claim per assigned partition until the
/// assignment changes, a claim fails, or `cancel` fires. Claim errors take
/// precedence over stream errors.
async fn run_claims<H, S>(
    cancel: &CancellationToken,
    handler: &H,
    session: &KafkaSession,
    stream: &mut S,
    assignment: &mut Assignment,
    seen: &mut HashMap<TopicPartition, SeenRange>,
    early: Vec<QueueMessage>,
) -> Result<(), ConsumerError>
where
    H: GroupHandler,
    S: futures::Stream<Item = Result<QueueMessage, rdkafka::error::KafkaError>> + Unpin,
{
    let stop = cancel.child_token();
    let mut senders = HashMap::new();
    let mut claims = Vec::with_capacity(assignment.partitions.len());
    for (topic, partition) in &assignment.partitions {
        let (tx, rx) = mpsc::channel(CLAIM_BUFFER);
        senders.insert((topic.clone(), *partition), tx);
        let claim = handler.consume_claim(session, Claim::new(topic.clone(), *partition, rx));
        let stop = stop.clone();
        claims.push(async move {
            let result = claim.await;
            if result.is_err() {
                stop.cancel();
            }
            result
        });
    }

    let pump = async {
        let senders = senders;
        let mut backlog = early.into_iter();
        let pumped = loop {
            let message = match backlog.next() {
                Some(message) => message,
                None => tokio::select! {
                    _ = stop.cancelled() => break Ok(()),
                    Some(event) = assignment.events.recv() => {
                        debug!("Assignment changed: {:?}", event);
                        apply(&mut assignment.partitions, event);
                        break Ok(());
                    }
                    next = stream.next() => match next {
                        Some(Ok(message)) => {
                            note_seen(seen, &message);
                            message
                        }
                        Some(Err(e)) => break Err(client_error(e)),
                        None => break Ok(()),
                    },
                },
            };
            let tp = (message.topic.clone(), message.partition);
            let Some(tx) = senders.get(&tp) else {
                warn!(
                    "Message for unassigned partition {}/{}, ending session",
                    tp.0, tp.1
                );
                break Ok(());
            };
            let sent = tokio::select! {
                _ = stop.cancelled() => break Ok(()),
                sent = tx.send(message) => sent,
            };
            if sent.is_err() {
                // the claim ended early; its error is reported below
                break Ok(());
            }
        };
        // closes every claim
        drop(senders);
        pumped
    };

    let (pumped, claimed) = tokio::join!(pump, join_all(claims));
    claimed.into_iter().collect::<Result<Vec<()>, _>>()?;
    pumped
}

pub struct KafkaSession {
    consumer: Arc<StreamConsumer<RebalanceContext>>,
    member_id: String,
    marked: Mutex<HashMap<TopicPartition, i64>>,
}

impl GroupSession for KafkaSession {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    fn mark_message(&self, message: &QueueMessage) {
        // the committed offset is the next one to read
        let next = message.offset + 1;
        self.marked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((message.topic.clone(), message.partition), next);
        match self
            .consumer
            .store_offset(&message.topic, message.partition, next)
        {
            Ok(()) => debug!(
                "Stored offset {} for {}/{}",
                next, message.topic, message.partition
            ),
            Err(e) => warn!(
                "Failed to store offset {} for {}/{}: {}",
                next, message.topic, message.partition, e
            ),
        }
    }
}

fn to_queue_message<M: Message>(message: &M) -> QueueMessage {
    let mut headers = Vec::new();
    if let Some(header_map) = message.headers() {
        for header in header_map.iter() {
            if let Some(value) = header.value {
                headers.push((header.key.to_string(), value.to_vec()));
            }
        }
    }

    QueueMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now),
        headers,
    }
}

fn client_error(e: rdkafka::error::KafkaError) -> ConsumerError {
    ConsumerError::Client {
        reason: e.to_string(),
    }
}
