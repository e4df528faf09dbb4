//! Reverb - HTTP Traffic Capture Replay Core
//!
//! Reconstructs ordered, complete HTTP request/response pairs from a stream
//! of out-of-order, segmented, possibly-truncated capture observations, and
//! replays each request against a target cluster at the same relative timing
//! it originally occurred:
//!
//! - **Accumulation**: a per-connection state machine turns raw observations
//!   into request/response pairs, with time-windowed expiration of abandoned
//!   connections bounding memory
//! - **At-least-once**: restarted runs re-process overlapping capture ranges
//!   safely; consumers dedup by [`ReplayerRequestKey`](capture::ReplayerRequestKey)
//! - **Timed replay**: a lazily-anchored time shifter preserves original
//!   request pacing under a configurable speed multiplier
//! - **Connection affinity**: generation-versioned pooled sessions serialize
//!   each source connection's requests on one target connection, safely
//!   under concurrent retries
//!
//! # Quick Start
//!
//! ```no_run
//! use reverb::{ReplayEngine, ReverbConfig};
//! use reverb::capture::FileTrafficSource;
//! # use std::sync::Arc;
//! # use reverb::replay::ChannelFactory;
//!
//! # async fn run(factory: Arc<dyn ChannelFactory>) -> reverb::Result<()> {
//! let config = ReverbConfig::default();
//! let engine = ReplayEngine::new(config, factory);
//! let mut source = FileTrafficSource::open("capture.jsonl", 0, 64)?;
//! let summary = engine.run(&mut source).await?;
//! println!("replayed {}/{}", summary.replayed, summary.pairs_reconstructed);
//! # Ok(())
//! # }
//! ```
//!
//! The byte-level rewrite pipeline, the wire source binding (e.g. Kafka),
//! and the concrete socket transport are external collaborators: the replay
//! side consumes an injected [`ChannelFactory`](replay::ChannelFactory)
//! capability, and capture ingestion happens through the
//! [`TrafficSource`](capture::TrafficSource) pull interface.

pub mod accumulate;
pub mod capture;
pub mod config;
pub mod error;
pub mod replay;

pub use config::{load_config, validate_config, ReverbConfig};
pub use error::{Result, ReverbError};
pub use replay::{ReplayEngine, ReplaySummary};

/// Reverb version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Reverb name
pub const NAME: &str = env!("CARGO_PKG_NAME");
