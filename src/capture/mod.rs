//! Capture model: observations, reconstructed messages, and sources
//!
//! Everything the accumulator consumes and produces lives here: the typed
//! observation records, the connection/stream/request keys, the reconstructed
//! request/response pair model, and the pull interface over capture sources.

mod message;
mod observation;
mod source;

pub use message::{
    CompletionStatus, HttpMessageAndTimestamp, RawPacket, RawPacketList, ReplayerRequestKey,
    RequestResponsePair,
};
pub use observation::{ConnectionId, Observation, TrafficChunk, TrafficStreamKey};
pub use source::{FileTrafficSource, InMemoryTrafficSource, TrafficSource};
