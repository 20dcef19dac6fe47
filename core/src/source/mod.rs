pub mod batch;
pub mod capture;
pub mod consumer;
pub mod flow;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod listener;
pub mod resolver;
pub mod timestamp;

use chrono::{DateTime, Utc};

/// A message received from the queue, detached from the client that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Topic or stream name of this message
    pub topic: String,
    /// partition or shard ID
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    /// raw payload of message e.g. kafka message body
    pub payload: Vec<u8>,
    /// Timestamp assigned by the producer or the broker.
    pub timestamp: DateTime<Utc>,
    /// Key/value headers in arrival order; keys may repeat.
    pub headers: Vec<(String, Vec<u8>)>,
}

impl QueueMessage {
    /// The whole second the message belongs to for batching.
    pub fn second(&self) -> i64 {
        self.timestamp.timestamp()
    }
}
