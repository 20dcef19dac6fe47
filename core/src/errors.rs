use std::fmt;
use std::time::Duration;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Lifecycle errors for a UDP flow listener.
#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Already listening")]
    AlreadyListening,

    #[error("Already closed")]
    AlreadyClosed,

    #[error("Not ready")]
    NotReady,

    #[error("No Tokio runtime to run the capture task on")]
    NoRuntime,

    #[error("Invalid listener id {0}")]
    InvalidArgument(i64),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// A datagram the flow decoder refused. Never leaves the capture loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Datagram truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("Unsupported version {found}, expected {expected}")]
    Version { expected: u16, found: u16 },

    #[error("Malformed datagram: {reason}")]
    Malformed { reason: &'static str },
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink is not ready")]
    NotReady,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Record rejected: {reason}")]
    Rejected { reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Claim routine got the wrong topic: expected {expected}, got {found}")]
    TopicMismatch { expected: String, found: String },

    #[error("Consumer already started")]
    AlreadyStarted,

    #[error("Consumer already closed")]
    AlreadyClosed,

    #[error("Consumer cancelled")]
    Cancelled,

    #[error("Invalid consumer settings: {reason}")]
    InvalidSettings { reason: String },

    #[error("Failed to write {count} entries: {source}")]
    Flush {
        count: usize,
        #[source]
        source: SinkError,
    },

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Client error: {reason}")]
    Client { reason: String },
}

#[derive(Error, Debug)]
pub enum ShutdownError {
    #[error("Shutdown aggregator already closed")]
    AlreadyClosed,

    #[error(transparent)]
    Close(#[from] CloseErrors),
}

/// Every failure observed while closing registered resources, in registration order.
#[derive(Debug, Default)]
pub struct CloseErrors {
    errors: Vec<BoxError>,
}

impl CloseErrors {
    pub fn push(&mut self, error: BoxError) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[BoxError] {
        &self.errors
    }

    pub fn into_result(self) -> Result<(), CloseErrors> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for CloseErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} resource(s) failed to close", self.errors.len())?;
        for (i, error) in self.errors.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseErrors {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.errors
            .first()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: BoxError,
    },
}

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {reason}")]
    Json { reason: String },
}

impl From<serde_json::Error> for SerializationError {
    fn from(err: serde_json::Error) -> Self {
        SerializationError::Json {
            reason: err.to_string(),
        }
    }
}

impl ConsumerError {
    /// Errors that end one session but leave the group membership usable.
    /// The consume routine re-joins after these so unmarked messages are
    /// delivered again.
    pub fn is_session_scoped(&self) -> bool {
        matches!(self, ConsumerError::Flush { .. } | ConsumerError::Sink(_))
    }
}
