//! Header validation for the UDP flow-export protocols.
//!
//! Decoders only check what the capture loop needs: how many bytes of the
//! datagram form a well-framed export packet, and the exporter's clock.

use chrono::{DateTime, Utc};
use nom::IResult;
use nom::bytes::complete::take;
use nom::number::complete::{be_u16, be_u32};

use crate::errors::DecodeError;

/// What a decoder reports for an accepted datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowHeader {
    /// Bytes of the datagram that belong to the export packet.
    pub length: usize,
    pub export_time: DateTime<Utc>,
}

pub trait FlowDecoder: Send + 'static {
    fn protocol(&self) -> &'static str;

    /// Size of the reusable read buffer.
    fn max_datagram(&self) -> usize;

    fn decode(&mut self, datagram: &[u8]) -> Result<FlowHeader, DecodeError>;
}

const NETFLOW_V5_VERSION: u16 = 5;
const NETFLOW_V5_HEADER_SIZE: usize = 24;
const NETFLOW_V5_RECORD_SIZE: usize = 48;
const NETFLOW_V5_MAX_RECORDS: usize = 30;
const NANOS_PER_SEC: u32 = 1_000_000_000;

#[derive(Debug, Clone, Copy)]
struct NetflowV5Header {
    version: u16,
    count: u16,
    unix_secs: u32,
    unix_nsecs: u32,
}

fn netflow_v5_header(input: &[u8]) -> IResult<&[u8], NetflowV5Header> {
    let (input, version) = field_u16(input)?;
    let (input, count) = field_u16(input)?;
    let (input, _sys_uptime) = field_u32(input)?;
    let (input, unix_secs) = field_u32(input)?;
    let (input, unix_nsecs) = field_u32(input)?;
    // flow sequence, engine type and id, sampling interval
    let (input, _) = skip(input, 8)?;
    Ok((
        input,
        NetflowV5Header {
            version,
            count,
            unix_secs,
            unix_nsecs,
        },
    ))
}

#[derive(Debug, Default)]
pub struct NetflowV5Decoder;

impl FlowDecoder for NetflowV5Decoder {
    fn protocol(&self) -> &'static str {
        "NetflowV5"
    }

    fn max_datagram(&self) -> usize {
        NETFLOW_V5_HEADER_SIZE + NETFLOW_V5_MAX_RECORDS * NETFLOW_V5_RECORD_SIZE
    }

    fn decode(&mut self, datagram: &[u8]) -> Result<FlowHeader, DecodeError> {
        let (records, header) = netflow_v5_header(datagram)
            .map_err(|_| truncated(datagram, NETFLOW_V5_HEADER_SIZE))?;

        if header.version != NETFLOW_V5_VERSION {
            return Err(DecodeError::Version {
                expected: NETFLOW_V5_VERSION,
                found: header.version,
            });
        }

        let count = usize::from(header.count);
        if count == 0 || count > NETFLOW_V5_MAX_RECORDS {
            return Err(DecodeError::Malformed {
                reason: "record count out of range",
            });
        }

        let length = NETFLOW_V5_HEADER_SIZE + count * NETFLOW_V5_RECORD_SIZE;
        skip(records, count * NETFLOW_V5_RECORD_SIZE).map_err(|_| truncated(datagram, length))?;

        // exporters that overflow the nanosecond field carry whole seconds in it
        let secs = i64::from(header.unix_secs) + i64::from(header.unix_nsecs / NANOS_PER_SEC);
        let export_time = DateTime::from_timestamp(secs, header.unix_nsecs % NANOS_PER_SEC)
            .ok_or(DecodeError::Malformed {
                reason: "export time out of range",
            })?;

        Ok(FlowHeader {
            length,
            export_time,
        })
    }
}

const IPFIX_VERSION: u16 = 10;
const IPFIX_HEADER_SIZE: usize = 16;
const IPFIX_SET_HEADER_SIZE: usize = 4;
const IPFIX_TEMPLATE_SET: u16 = 2;
const IPFIX_OPTIONS_TEMPLATE_SET: u16 = 3;
const IPFIX_MIN_DATA_SET: u16 = 256;
// largest UDP payload over IPv4
const MAX_UDP_PAYLOAD: usize = 65_507;

#[derive(Debug, Clone, Copy)]
struct IpfixHeader {
    version: u16,
    length: u16,
    export_time: u32,
}

fn ipfix_header(input: &[u8]) -> IResult<&[u8], IpfixHeader> {
    let (input, version) = field_u16(input)?;
    let (input, length) = field_u16(input)?;
    let (input, export_time) = field_u32(input)?;
    // sequence number, observation domain
    let (input, _) = skip(input, 8)?;
    Ok((
        input,
        IpfixHeader {
            version,
            length,
            export_time,
        },
    ))
}

fn ipfix_set_header(input: &[u8]) -> IResult<&[u8], (u16, u16)> {
    let (input, set_id) = field_u16(input)?;
    let (input, set_len) = field_u16(input)?;
    Ok((input, (set_id, set_len)))
}

#[derive(Debug, Default)]
pub struct IpfixDecoder {
    messages: u64,
}

impl FlowDecoder for IpfixDecoder {
    fn protocol(&self) -> &'static str {
        "Ipfix"
    }

    fn max_datagram(&self) -> usize {
        MAX_UDP_PAYLOAD
    }

    fn decode(&mut self, datagram: &[u8]) -> Result<FlowHeader, DecodeError> {
        let (_, header) =
            ipfix_header(datagram).map_err(|_| truncated(datagram, IPFIX_HEADER_SIZE))?;

        if header.version != IPFIX_VERSION {
            return Err(DecodeError::Version {
                expected: IPFIX_VERSION,
                found: header.version,
            });
        }

        let length = usize::from(header.length);
        if length < IPFIX_HEADER_SIZE {
            return Err(DecodeError::Malformed {
                reason: "message length shorter than header",
            });
        }
        let Some(message) = datagram.get(..length) else {
            return Err(truncated(datagram, length));
        };

        let mut sets = &message[IPFIX_HEADER_SIZE..];
        while !sets.is_empty() {
            let (body, (set_id, set_len)) =
                ipfix_set_header(sets).map_err(|_| DecodeError::Malformed {
                    reason: "trailing bytes after last set",
                })?;
            let known = matches!(set_id, IPFIX_TEMPLATE_SET | IPFIX_OPTIONS_TEMPLATE_SET)
                || set_id >= IPFIX_MIN_DATA_SET;
            if !known {
                return Err(DecodeError::Malformed {
                    reason: "reserved set id",
                });
            }
            let out_of_bounds = DecodeError::Malformed {
                reason: "set length out of bounds",
            };
            let records = usize::from(set_len)
                .checked_sub(IPFIX_SET_HEADER_SIZE)
                .ok_or(out_of_bounds.clone())?;
            let (rest, _) = skip(body, records).map_err(|_| out_of_bounds)?;
            sets = rest;
        }

        let export_time = DateTime::from_timestamp(i64::from(header.export_time), 0).ok_or(
            DecodeError::Malformed {
                reason: "export time out of range",
            },
        )?;

        self.messages += 1;
        Ok(FlowHeader {
            length,
            export_time,
        })
    }
}

fn field_u16(input: &[u8]) -> IResult<&[u8], u16> {
    be_u16(input)
}

fn field_u32(input: &[u8]) -> IResult<&[u8], u32> {
    be_u32(input)
}

fn skip(input: &[u8], count: usize) -> IResult<&[u8], &[u8]> {
    take(count)(input)
}

fn truncated(datagram: &[u8], needed: usize) -> DecodeError {
    DecodeError::Truncated {
        needed,
        got: datagram.len(),
    }
}
