pub mod json_lines;
pub mod memory;

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::SinkError;
use crate::record::{Record, Tag};

pub use json_lines::JsonLinesSink;
pub use memory::MemorySink;

/// The `Sink` trait is the narrow contract adapters hold on the storage side.
/// Connection pooling, health gating and durability live behind it.
pub trait Sink: Send + Sync + 'static {
    /// Resolves a human-readable tag name to its numeric id.
    fn register_tag(&self, name: &str) -> Result<Tag, SinkError>;

    /// Blocks until the sink can take records. Gives up with
    /// [`SinkError::Cancelled`] when `cancel` fires, or with a timeout if a hint
    /// is given.
    fn wait_until_ready(
        &self,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;

    fn submit(&self, record: Record) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Flushes everything submitted so far and confirms it within `timeout`.
    fn sync(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// The address this process is known by on the sink side.
    fn local_source_address(&self) -> Result<IpAddr, SinkError>;

    /// Informational message routed to the sink's own log stream.
    fn report_info(&self, message: &str);
}

/// Drains the flow output channel into `sink` until every sender is gone.
/// Returns the number of records the sink accepted.
pub async fn forward_records<S: Sink>(mut rx: mpsc::Receiver<Record>, sink: Arc<S>) -> u64 {
    let mut accepted = 0;
    while let Some(record) = rx.recv().await {
        let tag = record.tag();
        match sink.submit(record).await {
            Ok(()) => accepted += 1,
            Err(e) => warn!("Sink rejected record for tag {}: {}", tag, e),
        }
    }
    debug!("Record forwarder exiting after {} records", accepted);
    accepted
}
