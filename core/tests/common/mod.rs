use std::sync::{Arc, Mutex};

use chrono::DateTime;
use ingest_edge::errors::ConsumerError;
use ingest_edge::source::QueueMessage;
use ingest_edge::source::consumer::{Claim, ConsumerGroupClient, GroupHandler, GroupSession};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// NetFlow v5 export with `count` zeroed flow records.
pub fn netflow_v5(count: u16, secs: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(24 + 48 * count as usize);
    packet.extend_from_slice(&5u16.to_be_bytes());
    packet.extend_from_slice(&count.to_be_bytes());
    packet.extend_from_slice(&1000u32.to_be_bytes()); // sys uptime
    packet.extend_from_slice(&secs.to_be_bytes());
    packet.extend_from_slice(&0u32.to_be_bytes()); // nsecs
    packet.extend_from_slice(&7u32.to_be_bytes()); // sequence
    packet.extend_from_slice(&[0, 0, 0, 0]); // engine + sampling
    packet.resize(24 + 48 * count as usize, 0);
    packet
}

pub fn message(topic: &str, second: i64, offset: i64) -> QueueMessage {
    QueueMessage {
        topic: topic.to_string(),
        partition: 0,
        offset,
        key: None,
        payload: format!("line {offset}").into_bytes(),
        timestamp: DateTime::from_timestamp(second, 0).unwrap(),
        headers: Vec::new(),
    }
}

pub struct MemberSession {
    member: String,
    marked: Arc<Mutex<Vec<i64>>>,
}

impl GroupSession for MemberSession {
    fn member_id(&self) -> &str {
        &self.member
    }

    fn mark_message(&self, message: &QueueMessage) {
        self.marked.lock().unwrap().push(message.offset);
    }
}

/// Delivers its messages in one session that lasts until cancellation, then
/// idles on later calls.
pub struct InMemoryGroup {
    pub messages: Vec<QueueMessage>,
    pub marked: Arc<Mutex<Vec<i64>>>,
    delivered: bool,
}

impl InMemoryGroup {
    pub fn new(messages: Vec<QueueMessage>) -> Self {
        Self {
            messages,
            marked: Arc::new(Mutex::new(Vec::new())),
            delivered: false,
        }
    }
}

impl ConsumerGroupClient for InMemoryGroup {
    async fn consume<H: GroupHandler>(
        &mut self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: &H,
    ) -> Result<(), ConsumerError> {
        if self.delivered {
            cancel.cancelled().await;
            return Ok(());
        }
        self.delivered = true;

        let session = MemberSession {
            member: "member-1".to_string(),
            marked: Arc::clone(&self.marked),
        };
        handler.setup(&session).await?;

        let (tx, rx) = mpsc::channel(16);
        let messages = std::mem::take(&mut self.messages);
        let feed = async move {
            for message in messages {
                if tx.send(message).await.is_err() {
                    return;
                }
            }
            cancel.cancelled().await;
        };
        let claim = handler.consume_claim(&session, Claim::new(topics[0].clone(), 0, rx));
        let (claimed, ()) = tokio::join!(claim, feed);

        handler.cleanup(&session).await?;
        claimed
    }
}
