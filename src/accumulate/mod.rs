//! Traffic-to-transaction accumulation
//!
//! Consumes keyed observation chunks in capture order, drives each
//! connection's accumulation state machine, and emits completed
//! request/response pairs to a caller-supplied callback. Abandoned
//! connections are expired on a time window so memory stays bounded even
//! when Close observations are lost.
//!
//! The accumulator is safe to run twice over overlapping ranges of the same
//! connection's observations: it never drops a transaction and never dedups
//! internally; consumers dedup by [`ReplayerRequestKey`].
//!
//! [`ReplayerRequestKey`]: crate::capture::ReplayerRequestKey

mod accumulation;
mod expiring_map;

pub use accumulation::{Accumulation, AccumulationState};
pub use expiring_map::ExpiringConnectionMap;

use crate::capture::{CompletionStatus, Observation, RequestResponsePair, TrafficChunk, TrafficStreamKey};
use crate::config::AccumulationConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Accumulator statistics
#[derive(Debug, Default)]
pub struct AccumulatorStats {
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
    pub connections_expired: AtomicU64,
    pub requests_started: AtomicU64,
    pub pairs_completed: AtomicU64,
    pub pairs_closed_prematurely: AtomicU64,
    pub pairs_expired: AtomicU64,
    pub orphaned_writes_dropped: AtomicU64,
    pub exceptions_recorded: AtomicU64,
}

impl AccumulatorStats {
    /// Total pairs emitted regardless of completion status
    pub fn pairs_emitted(&self) -> u64 {
        self.pairs_completed.load(Ordering::Relaxed)
            + self.pairs_closed_prematurely.load(Ordering::Relaxed)
            + self.pairs_expired.load(Ordering::Relaxed)
    }
}

/// Callback receiving each finalized pair
pub type PairSink = Box<dyn Fn(RequestResponsePair) + Send + Sync>;

/// Converts per-connection observation streams into completed
/// request/response pairs.
///
/// Observations for one connection must arrive in capture order (the
/// partitioning layer's responsibility); connections are independent and may
/// be fed concurrently.
pub struct TrafficAccumulator {
    live: ExpiringConnectionMap,
    stats: Arc<AccumulatorStats>,
    sink: PairSink,
}

impl TrafficAccumulator {
    pub fn new(
        config: &AccumulationConfig,
        sink: impl Fn(RequestResponsePair) + Send + Sync + 'static,
    ) -> Self {
        Self {
            live: ExpiringConnectionMap::new(config.window, config.granularity),
            stats: Arc::new(AccumulatorStats::default()),
            sink: Box::new(sink),
        }
    }

    pub fn stats(&self) -> Arc<AccumulatorStats> {
        self.stats.clone()
    }

    /// Number of connections currently being reconstructed
    pub fn live_connections(&self) -> usize {
        self.live.len()
    }

    /// Consume one chunk: apply each observation in order, then run the
    /// expiration sweep up to the chunk's newest timestamp.
    pub fn accept(&self, chunk: &TrafficChunk) {
        for observation in &chunk.observations {
            self.apply(&chunk.key, observation, chunk.prior_requests_received);
        }
    }

    /// Apply a single observation for the given stream key.
    pub fn accept_observation(&self, key: &TrafficStreamKey, observation: &Observation) {
        self.apply(key, observation, 0);
    }

    fn apply(&self, key: &TrafficStreamKey, observation: &Observation, prior_requests: u32) {
        let stats = &self.stats;
        let connection = key.connection();

        let (pairs, closed) = self.live.get_or_create_without_expiration(
            key,
            || {
                stats.connections_created.fetch_add(1, Ordering::Relaxed);
                debug!("Tracking new connection {}", connection);
                Accumulation::with_priors(key, prior_requests)
            },
            |acc| {
                let mut pairs = Vec::new();

                if key.generation < acc.generation() {
                    warn!(
                        "Dropping stale generation {} observation for {} (live generation {})",
                        key.generation,
                        acc.connection(),
                        acc.generation()
                    );
                    return (pairs, false);
                }

                // Connection re-seen after a close the capture never
                // delivered: flush the old life and start the new one.
                if key.generation > acc.generation() {
                    debug!(
                        "Generation bump {} -> {} on {}, restarting accumulation",
                        acc.generation(),
                        key.generation,
                        acc.connection()
                    );
                    pairs.extend(acc.flush(CompletionStatus::ClosedPrematurely, stats));
                    *acc = Accumulation::with_priors(key, prior_requests);
                    stats.connections_created.fetch_add(1, Ordering::Relaxed);
                    stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                }

                pairs.extend(acc.accept(key, observation, stats));
                (pairs, acc.is_closed())
            },
        );

        // Entry guard is released above; map mutations below are safe.
        if closed {
            self.live.remove(&connection);
            self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.live.touch(&connection, observation.timestamp());
        }

        for pair in pairs {
            (self.sink)(pair);
        }

        self.expire_up_to(observation.timestamp());
    }

    /// Drive the expiration sweep to the given capture time, flushing every
    /// evicted accumulation as `Expired`.
    pub fn expire_up_to(&self, now: chrono::DateTime<chrono::Utc>) {
        for mut acc in self.live.expire_old_entries(now) {
            self.stats.connections_expired.fetch_add(1, Ordering::Relaxed);
            for pair in acc.flush(CompletionStatus::Expired, &self.stats) {
                (self.sink)(pair);
            }
        }
    }

    /// End of input: drain every still-open accumulation as
    /// `ClosedPrematurely` (the stream was cut, not idle).
    pub fn finish(&self) {
        for mut acc in self.live.drain_all() {
            self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
            for pair in acc.flush(CompletionStatus::ClosedPrematurely, &self.stats) {
                (self.sink)(pair);
            }
        }
    }
}
