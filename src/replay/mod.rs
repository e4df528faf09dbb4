//! Timed replay against a target cluster
//!
//! Takes reconstructed request/response pairs, maps their source-capture
//! timestamps to wall-clock send times, and dispatches each request over a
//! pooled, generation-versioned session with connection affinity: every
//! request from one source connection replays on the same target session.

mod orchestrator;
mod pool;
mod timeshift;

pub use orchestrator::{
    ExponentialBackoff, ReplayStats, RequestSenderOrchestrator, RetryDirective, RetryPolicy,
};
pub use pool::{
    AggregatedRawResponse, ChannelFactory, ClientConnectionPool, ClientSession, PacketChannel,
    SessionKey,
};
pub use timeshift::TimeShifter;

use crate::accumulate::TrafficAccumulator;
use crate::capture::{RequestResponsePair, TrafficSource};
use crate::config::ReverbConfig;
use crate::error::{Result, ReverbError};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outcome counts for one replay run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Pairs reconstructed from the capture
    pub pairs_reconstructed: u64,
    /// Requests replayed successfully
    pub replayed: u64,
    /// Requests that failed terminally
    pub failed: u64,
    /// Pairs skipped (no request bytes to send)
    pub skipped: u64,
}

/// End-to-end replay driver: capture source -> accumulator -> orchestrator.
///
/// The engine owns the time shifter, connection pool, and orchestrator;
/// embedders that run their own accumulation loop can use
/// [`replay_pair`](Self::replay_pair) directly.
pub struct ReplayEngine {
    config: ReverbConfig,
    shifter: TimeShifter,
    orchestrator: Arc<RequestSenderOrchestrator>,
    policy: Arc<dyn RetryPolicy>,
}

impl ReplayEngine {
    pub fn new(config: ReverbConfig, factory: Arc<dyn ChannelFactory>) -> Self {
        let pool = Arc::new(ClientConnectionPool::new(
            factory,
            config.replay.max_sessions,
        ));
        let policy = Arc::new(ExponentialBackoff::from_settings(&config.replay));
        Self::with_retry_policy(config, pool, policy)
    }

    pub fn with_retry_policy(
        config: ReverbConfig,
        pool: Arc<ClientConnectionPool>,
        policy: Arc<dyn RetryPolicy>,
    ) -> Self {
        let shifter = TimeShifter::new(config.replay.speed_multiplier);
        Self {
            config,
            shifter,
            orchestrator: Arc::new(RequestSenderOrchestrator::new(pool)),
            policy,
        }
    }

    pub fn stats(&self) -> Arc<ReplayStats> {
        self.orchestrator.stats()
    }

    pub fn orchestrator(&self) -> &RequestSenderOrchestrator {
        &self.orchestrator
    }

    pub fn time_shifter(&self) -> &TimeShifter {
        &self.shifter
    }

    /// Replay one reconstructed pair at its shifted start time.
    ///
    /// Connection affinity: the session key is derived from the pair's
    /// source connection, so requests from one connection serialize on one
    /// target session in source order.
    pub async fn replay_pair(&self, pair: &RequestResponsePair) -> Result<AggregatedRawResponse> {
        let Some(anchor_ts) = pair.first_request_timestamp() else {
            return Err(ReverbError::Source(format!(
                "Pair {} carries no request bytes",
                pair.key
            )));
        };
        let start = self.shifter.transform_source_time_to_real_time(anchor_ts);
        let stream_key = &pair.key.stream_key;
        let session_key = SessionKey::new(&*stream_key.node_id, &*stream_key.connection_id, 0);
        let packets = pair.request_data.iter().map(|p| p.data.clone()).collect();

        self.orchestrator
            .schedule_request(
                pair.key.clone(),
                session_key,
                stream_key.generation,
                start,
                self.config.replay.inter_packet_delay,
                packets,
                self.config.replay.request_timeout,
                self.policy.as_ref(),
            )
            .await
    }

    /// Drive a complete run: read chunks until the source is exhausted,
    /// accumulate, replay every reconstructed pair, and drain in-flight
    /// sends before returning. Chunks are committed back to the source as
    /// they are consumed.
    pub async fn run(&self, source: &mut dyn TrafficSource) -> Result<ReplaySummary> {
        let (tx, mut rx) = mpsc::unbounded_channel::<RequestResponsePair>();
        let accumulator = TrafficAccumulator::new(&self.config.accumulation, move |pair| {
            // Receiver outlives the accumulator; a send only fails if the
            // run itself is gone.
            let _ = tx.send(pair);
        });

        let mut summary = ReplaySummary::default();
        let mut in_flight = Vec::new();

        loop {
            let chunks = source.read_next_chunk().await?;
            if chunks.is_empty() {
                break;
            }
            for chunk in &chunks {
                accumulator.accept(chunk);
                self.drain_ready(&mut rx, &mut summary, &mut in_flight);
                source.commit(&chunk.key).await?;
            }
        }

        accumulator.finish();
        self.drain_ready(&mut rx, &mut summary, &mut in_flight);
        debug!(
            "Capture exhausted: {} pairs reconstructed, awaiting {} in-flight sends",
            summary.pairs_reconstructed,
            in_flight.len()
        );

        for task in in_flight {
            match task.await {
                Ok(Ok(_)) => summary.replayed += 1,
                Ok(Err(e)) => {
                    warn!("Replay failed: {}", e);
                    summary.failed += 1;
                }
                Err(e) => {
                    warn!("Replay task panicked: {}", e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Replay run complete: {}/{} replayed, {} failed, {} skipped",
            summary.replayed, summary.pairs_reconstructed, summary.failed, summary.skipped
        );
        Ok(summary)
    }

    /// Shut the target pool down, completing once every session has torn down
    pub async fn shutdown(&self) {
        self.orchestrator.pool().shutdown_now().await;
    }

    fn drain_ready(
        &self,
        rx: &mut mpsc::UnboundedReceiver<RequestResponsePair>,
        summary: &mut ReplaySummary,
        in_flight: &mut Vec<tokio::task::JoinHandle<Result<AggregatedRawResponse>>>,
    ) {
        while let Ok(pair) = rx.try_recv() {
            summary.pairs_reconstructed += 1;
            let Some(anchor_ts) = pair.first_request_timestamp() else {
                summary.skipped += 1;
                continue;
            };
            // The time mapping must anchor in emission order, not in
            // whatever order the spawned tasks first get polled.
            let start = self.shifter.transform_source_time_to_real_time(anchor_ts);
            in_flight.push(self.spawn_replay(pair, start));
        }
    }

    fn spawn_replay(
        &self,
        pair: RequestResponsePair,
        start: tokio::time::Instant,
    ) -> tokio::task::JoinHandle<Result<AggregatedRawResponse>> {
        let orchestrator = self.orchestrator.clone();
        let policy = self.policy.clone();
        let settings = self.config.replay.clone();

        tokio::spawn(async move {
            let stream_key = &pair.key.stream_key;
            let session_key =
                SessionKey::new(&*stream_key.node_id, &*stream_key.connection_id, 0);
            let packets = pair.request_data.iter().map(|p| p.data.clone()).collect();
            orchestrator
                .schedule_request(
                    pair.key.clone(),
                    session_key,
                    stream_key.generation,
                    start,
                    settings.inter_packet_delay,
                    packets,
                    settings.request_timeout,
                    policy.as_ref(),
                )
                .await
        })
    }
}
