//! Reconstructed message model
//!
//! Byte-level request/response material rebuilt from observations. Packet
//! lists are append-only; arrival order is logical byte order.

use crate::capture::observation::TrafficStreamKey;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One contiguous run of captured bytes with its capture timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPacket {
    pub data: Bytes,
    pub timestamp: DateTime<Utc>,
}

impl RawPacket {
    pub fn new(data: Bytes, timestamp: DateTime<Utc>) -> Self {
        Self { data, timestamp }
    }
}

/// Ordered packets of one direction of one transaction
pub type RawPacketList = Vec<RawPacket>;

/// An in-progress or frozen HTTP message: append-only packets plus the
/// first/last capture timestamps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpMessageAndTimestamp {
    packets: RawPacketList,
}

impl HttpMessageAndTimestamp {
    pub fn new() -> Self {
        Self {
            packets: Vec::new(),
        }
    }

    /// Append one packet; arrival order is preserved as logical byte order
    pub fn append(&mut self, data: Bytes, timestamp: DateTime<Utc>) {
        self.packets.push(RawPacket::new(data, timestamp));
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn packets(&self) -> &RawPacketList {
        &self.packets
    }

    pub fn into_packets(self) -> RawPacketList {
        self.packets
    }

    /// Timestamp of the first packet, if any
    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.packets.first().map(|p| p.timestamp)
    }

    /// Timestamp of the last packet, if any
    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.packets.last().map(|p| p.timestamp)
    }

    /// Total payload size in bytes
    pub fn byte_len(&self) -> usize {
        self.packets.iter().map(|p| p.data.len()).sum()
    }

    /// Concatenated payload of all packets
    pub fn assemble(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.byte_len());
        for packet in &self.packets {
            buf.extend_from_slice(&packet.data);
        }
        buf.freeze()
    }
}

/// Deterministic identity of one request within its connection.
///
/// `source_request_index` counts requests per connection-generation; together
/// with the stream key it is the dedup and ordering key used by downstream
/// consumers across at-least-once delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplayerRequestKey {
    pub stream_key: TrafficStreamKey,
    pub source_request_index: u32,
}

impl ReplayerRequestKey {
    pub fn new(stream_key: TrafficStreamKey, source_request_index: u32) -> Self {
        Self {
            stream_key,
            source_request_index,
        }
    }
}

impl fmt::Display for ReplayerRequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.stream_key, self.source_request_index)
    }
}

/// How a reconstructed pair was finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// The next request started (or the stream ended cleanly) after the
    /// response bytes; the pair is complete
    Successful,
    /// The connection closed mid-transaction
    ClosedPrematurely,
    /// The connection idled past the expiration window mid-transaction
    Expired,
}

/// A reconstructed request paired with its reconstructed response.
///
/// Produced exactly once per logically-distinct request per run, but may be
/// produced again across process restarts (at-least-once); consumers dedup
/// by [`ReplayerRequestKey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestResponsePair {
    pub key: ReplayerRequestKey,
    pub request_data: RawPacketList,
    pub response_data: RawPacketList,
    pub completion_status: CompletionStatus,
    /// Connection exception observed while this transaction was in flight
    pub error: Option<String>,
}

impl RequestResponsePair {
    /// Capture timestamp of the first request packet (replay anchor)
    pub fn first_request_timestamp(&self) -> Option<DateTime<Utc>> {
        self.request_data.first().map(|p| p.timestamp)
    }

    /// Concatenated request payload
    pub fn request_bytes(&self) -> Bytes {
        assemble(&self.request_data)
    }

    /// Concatenated response payload
    pub fn response_bytes(&self) -> Bytes {
        assemble(&self.response_data)
    }
}

fn assemble(packets: &RawPacketList) -> Bytes {
    let mut buf = BytesMut::with_capacity(packets.iter().map(|p| p.data.len()).sum());
    for packet in packets {
        buf.extend_from_slice(&packet.data);
    }
    buf.freeze()
}
