//! The uniform unit handed to a sink.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Numeric stream identifier handed out by a sink for a tag name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Tag(pub u16);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One ingested event. The payload is fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    tag: Tag,
    timestamp: DateTime<Utc>,
    source: Option<IpAddr>,
    payload: Vec<u8>,
}

impl Record {
    pub fn new(
        tag: Tag,
        timestamp: DateTime<Utc>,
        source: Option<IpAddr>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            tag,
            timestamp,
            source,
            payload,
        }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn source(&self) -> Option<IpAddr> {
        self.source
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Bytes accounted against a consumer session: payload plus a fixed header.
    pub fn size(&self) -> u64 {
        RECORD_HEADER_SIZE + self.payload.len() as u64
    }
}

/// tag (2) + timestamp (12) + source (16) + payload length (4)
const RECORD_HEADER_SIZE: u64 = 34;
