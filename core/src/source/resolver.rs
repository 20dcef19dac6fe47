//! Picks the source address recorded for a queue message.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::source::QueueMessage;

const IPV4_LEN: usize = 4;
const IPV6_LEN: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceResolver {
    /// Header whose value carries the source address.
    pub header_key: Option<String>,
    /// Fall back to the message key when the header yields nothing.
    pub key_as_source: bool,
    /// Parse addresses as text ("10.1.2.3") rather than raw 4/16-byte values.
    pub source_as_text: bool,
}

impl SourceResolver {
    /// Header first, then message key, then `fallback`. The last occurrence of a
    /// repeated header is the one considered.
    pub fn resolve(&self, message: &QueueMessage, fallback: Option<IpAddr>) -> Option<IpAddr> {
        self.from_header(message)
            .or_else(|| {
                self.key_as_source
                    .then(|| message.key.as_deref().and_then(|k| self.parse(k)))
                    .flatten()
            })
            .or(fallback)
    }

    fn from_header(&self, message: &QueueMessage) -> Option<IpAddr> {
        let key = self.header_key.as_deref()?;
        let (_, value) = message.headers.iter().rev().find(|(k, _)| k == key)?;
        self.parse(value)
    }

    fn parse(&self, value: &[u8]) -> Option<IpAddr> {
        if self.source_as_text {
            return std::str::from_utf8(value).ok()?.parse().ok();
        }
        match value.len() {
            IPV4_LEN => <[u8; IPV4_LEN]>::try_from(value)
                .ok()
                .map(|b| IpAddr::V4(Ipv4Addr::from(b))),
            IPV6_LEN => <[u8; IPV6_LEN]>::try_from(value)
                .ok()
                .map(|b| IpAddr::V6(Ipv6Addr::from(b))),
            _ => None,
        }
    }
}
