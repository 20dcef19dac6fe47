use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::errors::SinkError;
use crate::record::{Record, Tag};
use crate::sink::Sink;

/// In-process sink that keeps every accepted record.
///
/// Starts ready. An optional limit turns it into a bounded buffer that rejects
/// records once full.
pub struct MemorySink {
    records: Mutex<Vec<Record>>,
    tags: Mutex<HashMap<String, Tag>>,
    info: Mutex<Vec<String>>,
    ready: watch::Sender<bool>,
    limit: Option<usize>,
    syncs: AtomicUsize,
    failing: AtomicUsize,
    source: IpAddr,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            tags: Mutex::new(HashMap::new()),
            info: Mutex::new(Vec::new()),
            ready: watch::Sender::new(true),
            limit: None,
            syncs: AtomicUsize::new(0),
            failing: AtomicUsize::new(0),
            source: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_source(mut self, source: IpAddr) -> Self {
        self.source = source;
        self
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.send_replace(ready);
    }

    /// Rejects the next `count` submissions, then accepts again.
    pub fn fail_next_submits(&self, count: usize) {
        self.failing.store(count, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<Record> {
        lock(&self.records).clone()
    }

    pub fn info_messages(&self) -> Vec<String> {
        lock(&self.info).clone()
    }

    pub fn sync_count(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }
}

impl Sink for MemorySink {
    fn register_tag(&self, name: &str) -> Result<Tag, SinkError> {
        let mut tags = lock(&self.tags);
        let next = Tag(tags.len() as u16);
        Ok(*tags.entry(name.to_string()).or_insert(next))
    }

    async fn wait_until_ready(
        &self,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<(), SinkError> {
        let mut ready = self.ready.subscribe();
        let wait = async {
            tokio::select! {
                res = ready.wait_for(|r| *r) => res.map(|_| ()).map_err(|_| SinkError::NotReady),
                _ = cancel.cancelled() => Err(SinkError::Cancelled),
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| SinkError::Timeout(limit))?,
            None => wait.await,
        }
    }

    async fn submit(&self, record: Record) -> Result<(), SinkError> {
        let failing = self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(SinkError::Rejected {
                reason: "memory sink unavailable".to_string(),
            });
        }
        let mut records = lock(&self.records);
        if self.limit.is_some_and(|limit| records.len() >= limit) {
            return Err(SinkError::Rejected {
                reason: "memory sink full".to_string(),
            });
        }
        records.push(record);
        Ok(())
    }

    async fn sync(&self, cancel: &CancellationToken, _timeout: Duration) -> Result<(), SinkError> {
        if cancel.is_cancelled() {
            return Err(SinkError::Cancelled);
        }
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn local_source_address(&self) -> Result<IpAddr, SinkError> {
        Ok(self.source)
    }

    fn report_info(&self, message: &str) {
        lock(&self.info).push(message.to_string());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
