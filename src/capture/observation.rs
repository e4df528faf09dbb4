//! Capture observation model
//!
//! One observation describes bytes read, bytes written, a message or segment
//! boundary, or a connection lifecycle event, tagged with its capture
//! timestamp. The closed enum keeps each payload in a field typed for its
//! variant, so a segment observation can never be confused with a plain
//! read and silently yield an empty buffer.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one chunk of a connection's observation log.
///
/// Connections may be re-seen after a close with a new generation to support
/// replay restarts; generation monotonically increases per (node, connection).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrafficStreamKey {
    /// Capturing node identifier
    pub node_id: String,
    /// Raw connection identifier, unique per node only
    pub connection_id: String,
    /// Monotonic index of this chunk within the connection's log
    pub stream_index: u32,
    /// Logical use counter of this connection identity
    pub generation: u32,
}

impl TrafficStreamKey {
    pub fn new(
        node_id: impl Into<String>,
        connection_id: impl Into<String>,
        stream_index: u32,
        generation: u32,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            connection_id: connection_id.into(),
            stream_index,
            generation,
        }
    }

    /// Connection identity shared by all chunks of one connection
    pub fn connection(&self) -> ConnectionId {
        ConnectionId {
            node_id: self.node_id.clone(),
            connection_id: self.connection_id.clone(),
        }
    }
}

impl fmt::Display for TrafficStreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}[{}]g{}",
            self.node_id, self.connection_id, self.stream_index, self.generation
        )
    }
}

/// Connection identity: a raw connection id is only unique per node, so the
/// two always travel together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId {
    pub node_id: String,
    pub connection_id: String,
}

impl ConnectionId {
    pub fn new(node_id: impl Into<String>, connection_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            connection_id: connection_id.into(),
        }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_id, self.connection_id)
    }
}

/// A single capture record.
///
/// Segment observations must be concatenated in arrival order until an
/// `EndOfSegment` marks the logical read/write boundary; the assembled bytes
/// are semantically equivalent to a single `Read`/`Write`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Observation {
    /// Bytes read from the client (request direction), one complete read
    Read {
        data: Bytes,
        timestamp: DateTime<Utc>,
    },
    /// Part of a segmented read; terminated by `EndOfSegment`
    ReadSegment {
        data: Bytes,
        timestamp: DateTime<Utc>,
    },
    /// Terminates the current segment run on either side
    EndOfSegment { timestamp: DateTime<Utc> },
    /// Boundary between request accumulation and response accumulation
    EndOfMessage {
        first_line_len: u32,
        headers_len: u32,
        timestamp: DateTime<Utc>,
    },
    /// Bytes written to the client (response direction), one complete write
    Write {
        data: Bytes,
        timestamp: DateTime<Utc>,
    },
    /// Part of a segmented write; terminated by `EndOfSegment`
    WriteSegment {
        data: Bytes,
        timestamp: DateTime<Utc>,
    },
    /// Connection closed
    Close { timestamp: DateTime<Utc> },
    /// Error observed on the connection; recorded, not terminal
    ConnectionException {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl Observation {
    /// Capture timestamp of this observation
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Observation::Read { timestamp, .. }
            | Observation::ReadSegment { timestamp, .. }
            | Observation::EndOfSegment { timestamp }
            | Observation::EndOfMessage { timestamp, .. }
            | Observation::Write { timestamp, .. }
            | Observation::WriteSegment { timestamp, .. }
            | Observation::Close { timestamp }
            | Observation::ConnectionException { timestamp, .. } => *timestamp,
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Observation::Read { .. } => "read",
            Observation::ReadSegment { .. } => "read_segment",
            Observation::EndOfSegment { .. } => "end_of_segment",
            Observation::EndOfMessage { .. } => "end_of_message",
            Observation::Write { .. } => "write",
            Observation::WriteSegment { .. } => "write_segment",
            Observation::Close { .. } => "close",
            Observation::ConnectionException { .. } => "connection_exception",
        }
    }
}

/// One framed delivery unit from the capture source: a stream key plus the
/// observations recorded for that chunk, in capture order.
///
/// `prior_requests_received` is the capture side's count of requests already
/// completed on this connection before this chunk. It seeds the request
/// index counter when a replay run starts mid-connection, so a rewound
/// re-run assigns the same `ReplayerRequestKey`s as an unsplit run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficChunk {
    pub key: TrafficStreamKey,
    pub observations: Vec<Observation>,
    #[serde(default)]
    pub prior_requests_received: u32,
}

impl TrafficChunk {
    pub fn new(key: TrafficStreamKey, observations: Vec<Observation>) -> Self {
        Self {
            key,
            observations,
            prior_requests_received: 0,
        }
    }

    pub fn with_priors(
        key: TrafficStreamKey,
        observations: Vec<Observation>,
        prior_requests_received: u32,
    ) -> Self {
        Self {
            key,
            observations,
            prior_requests_received,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_key_display() {
        let key = TrafficStreamKey::new("node-a", "conn-1", 3, 2);
        assert_eq!(key.to_string(), "node-a.conn-1[3]g2");
    }

    #[test]
    fn test_connection_identity_includes_node() {
        let a = TrafficStreamKey::new("node-a", "conn-1", 0, 0).connection();
        let b = TrafficStreamKey::new("node-b", "conn-1", 0, 0).connection();
        assert_ne!(a, b);
    }

    #[test]
    fn test_observation_timestamp_accessor() {
        let obs = Observation::EndOfMessage {
            first_line_len: 16,
            headers_len: 48,
            timestamp: ts(42),
        };
        assert_eq!(obs.timestamp(), ts(42));
        assert_eq!(obs.kind(), "end_of_message");
    }

    #[test]
    fn test_chunk_roundtrips_through_json() {
        let chunk = TrafficChunk::new(
            TrafficStreamKey::new("n", "c", 0, 0),
            vec![
                Observation::Read {
                    data: Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"),
                    timestamp: ts(1),
                },
                Observation::EndOfMessage {
                    first_line_len: 16,
                    headers_len: 2,
                    timestamp: ts(1),
                },
                Observation::Close { timestamp: ts(2) },
            ],
        );

        let json = serde_json::to_string(&chunk).unwrap();
        let back: TrafficChunk = serde_json::from_str(&json).unwrap();
        assert_eq!(chunk, back);
    }
}
