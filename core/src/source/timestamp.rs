use chrono::{DateTime, Utc};

use crate::errors::BoxError;

/// Pulls an event time out of a payload.
///
/// `Ok(None)` means the payload carries no recognisable timestamp and the
/// caller keeps the message's own time.
pub trait TimestampExtractor: Send + Sync {
    fn extract(&self, payload: &[u8]) -> Result<Option<DateTime<Utc>>, BoxError>;
}

/// Finds the first RFC 3339 token in a UTF-8 payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct Rfc3339Extractor;

const SEPARATORS: &[char] = &['"', '\'', ',', '[', ']', '{', '}', '(', ')', '<', '>', '|'];

impl TimestampExtractor for Rfc3339Extractor {
    fn extract(&self, payload: &[u8]) -> Result<Option<DateTime<Utc>>, BoxError> {
        let Ok(text) = std::str::from_utf8(payload) else {
            return Ok(None);
        };
        let found = text
            .split(|c: char| c.is_whitespace() || SEPARATORS.contains(&c))
            .filter(|token| token.len() >= 20)
            .find_map(|token| DateTime::parse_from_rfc3339(token).ok())
            .map(|ts| ts.with_timezone(&Utc));
        Ok(found)
    }
}
