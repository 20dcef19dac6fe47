use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::{SerializationError, SinkError};
use crate::record::{Record, Tag};
use crate::sink::Sink;

type Writer = BufWriter<Box<dyn AsyncWrite + Send + Unpin>>;

/// Writes every record as one JSON object per line.
pub struct JsonLinesSink {
    writer: AsyncMutex<Writer>,
    tags: Mutex<HashMap<String, Tag>>,
    source: IpAddr,
}

#[derive(Serialize)]
struct RecordLine<'a> {
    tag: Tag,
    timestamp: DateTime<Utc>,
    source: Option<IpAddr>,
    payload: Payload<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Payload<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
}

impl<'a> From<&'a Record> for RecordLine<'a> {
    fn from(record: &'a Record) -> Self {
        let payload = match std::str::from_utf8(record.payload()) {
            Ok(text) => Payload::Text(text),
            Err(_) => Payload::Binary(record.payload()),
        };
        Self {
            tag: record.tag(),
            timestamp: record.timestamp(),
            source: record.source(),
            payload,
        }
    }
}

impl JsonLinesSink {
    pub fn stdout() -> Self {
        Self::with_writer(Box::new(tokio::io::stdout()))
    }

    pub async fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self::with_writer(Box::new(file)))
    }

    pub fn with_writer(writer: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self {
            writer: AsyncMutex::new(BufWriter::new(writer)),
            tags: Mutex::new(HashMap::new()),
            source: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    pub fn with_source(mut self, source: IpAddr) -> Self {
        self.source = source;
        self
    }
}

impl Sink for JsonLinesSink {
    fn register_tag(&self, name: &str) -> Result<Tag, SinkError> {
        let mut tags = self.tags.lock().unwrap_or_else(|e| e.into_inner());
        let next = u16::try_from(tags.len()).map_err(|_| SinkError::Rejected {
            reason: format!("too many tags to register {name}"),
        })?;
        Ok(*tags.entry(name.to_string()).or_insert(Tag(next)))
    }

    async fn wait_until_ready(
        &self,
        cancel: &CancellationToken,
        _timeout: Option<Duration>,
    ) -> Result<(), SinkError> {
        if cancel.is_cancelled() {
            return Err(SinkError::Cancelled);
        }
        Ok(())
    }

    async fn submit(&self, record: Record) -> Result<(), SinkError> {
        let mut line =
            serde_json::to_vec(&RecordLine::from(&record)).map_err(SerializationError::from)?;
        line.push(b'\n');
        self.writer.lock().await.write_all(&line).await?;
        Ok(())
    }

    async fn sync(&self, cancel: &CancellationToken, timeout: Duration) -> Result<(), SinkError> {
        let flush = async {
            let mut writer = self.writer.lock().await;
            writer.flush().await
        };
        tokio::select! {
            res = tokio::time::timeout(timeout, flush) => {
                res.map_err(|_| SinkError::Timeout(timeout))??;
                Ok(())
            }
            _ = cancel.cancelled() => Err(SinkError::Cancelled),
        }
    }

    fn local_source_address(&self) -> Result<IpAddr, SinkError> {
        Ok(self.source)
    }

    fn report_info(&self, message: &str) {
        info!(target: "ingest_edge::sink", "{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        let sink = JsonLinesSink::create(&path).await.unwrap();
        let tag = sink.register_tag("syslog").unwrap();
        let ts = DateTime::from_timestamp(1_700_000_000, 0).unwrap();

        sink.submit(Record::new(tag, ts, None, b"hello".to_vec()))
            .await
            .unwrap();
        sink.submit(Record::new(
            tag,
            ts,
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
            vec![0xff, 0x00],
        ))
        .await
        .unwrap();
        sink.sync(&CancellationToken::new(), Duration::from_secs(1))
            .await
            .unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = written
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["payload"], "hello");
        assert_eq!(lines[0]["tag"], 0);
        assert_eq!(lines[1]["source"], "10.0.0.1");
        assert_eq!(lines[1]["payload"], serde_json::json!([255, 0]));
    }
}
