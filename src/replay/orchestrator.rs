//! Request sender orchestration
//!
//! Schedules reconstructed requests onto pooled sessions at specific
//! wall-clock times and drives the retry loop around each request. The
//! per-session work queue (see [`pool`](crate::replay::pool)) guarantees
//! packets and requests on one connection serialize correctly; this layer
//! owns attempt accounting and supersession.
//!
//! Counting is per request, never per attempt: a request that fails twice
//! and then succeeds increments the success counter once and the error
//! counter not at all.

use crate::capture::ReplayerRequestKey;
use crate::config::ReplaySettings;
use crate::error::{Result, ReverbError};
use crate::replay::pool::{AggregatedRawResponse, ClientConnectionPool, SessionKey};
use bytes::Bytes;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDirective {
    /// Try again on the same session after the delay
    Retry { after: Duration },
    /// Invalidate the session, bump the generation, and try on a fresh one
    RetryOnNewSession { after: Duration },
    /// Give up; the error is terminal for this request
    Abort,
}

/// Pluggable retry decision point, consulted once per failed attempt
pub trait RetryPolicy: Send + Sync {
    fn on_failure(
        &self,
        key: &ReplayerRequestKey,
        attempt: u32,
        error: &ReverbError,
    ) -> RetryDirective;
}

/// Exponential backoff with jitter; session-level failures move to a fresh
/// session, transport-level failures retry in place.
pub struct ExponentialBackoff {
    max_attempts: u32,
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            max,
        }
    }

    pub fn from_settings(settings: &ReplaySettings) -> Self {
        Self::new(settings.max_attempts, settings.backoff_base, settings.backoff_max)
    }

    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << (attempt - 1).min(16));
        let capped = exp.min(self.max);
        capped.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn on_failure(
        &self,
        key: &ReplayerRequestKey,
        attempt: u32,
        error: &ReverbError,
    ) -> RetryDirective {
        if !error.is_retryable() || attempt >= self.max_attempts {
            return RetryDirective::Abort;
        }
        let after = self.delay(attempt);
        match error {
            // The session is gone or no longer ours; in-place retry would
            // fail the same way.
            ReverbError::SessionSuperseded { .. }
            | ReverbError::SessionClosed
            | ReverbError::Connect(_) => RetryDirective::RetryOnNewSession { after },
            _ => {
                trace!("Retrying {} after {:?} (attempt {})", key, after, attempt);
                RetryDirective::Retry { after }
            }
        }
    }
}

/// Replay statistics, counted once per request
#[derive(Debug, Default)]
pub struct ReplayStats {
    pub requests_scheduled: AtomicU64,
    pub requests_succeeded: AtomicU64,
    pub requests_failed: AtomicU64,
    pub attempts: AtomicU64,
    pub retries: AtomicU64,
    pub sessions_recreated: AtomicU64,
    pub connections_closed: AtomicU64,
}

impl ReplayStats {
    pub fn success_rate(&self) -> f64 {
        let scheduled = self.requests_scheduled.load(Ordering::Relaxed);
        if scheduled == 0 {
            return 100.0;
        }
        let succeeded = self.requests_succeeded.load(Ordering::Relaxed);
        (succeeded as f64 / scheduled as f64) * 100.0
    }
}

/// Schedules requests and closes onto pooled sessions, serializing work per
/// connection and retrying per the configured policy.
pub struct RequestSenderOrchestrator {
    pool: Arc<ClientConnectionPool>,
    stats: Arc<ReplayStats>,
}

impl RequestSenderOrchestrator {
    pub fn new(pool: Arc<ClientConnectionPool>) -> Self {
        Self {
            pool,
            stats: Arc::new(ReplayStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ReplayStats> {
        self.stats.clone()
    }

    pub fn pool(&self) -> &Arc<ClientConnectionPool> {
        &self.pool
    }

    /// Send one reconstructed request's packets on the keyed session,
    /// starting no earlier than `start`, retrying per `policy`.
    ///
    /// Every attempt reuses the same [`ReplayerRequestKey`], so downstream
    /// counting stays per-request.
    #[allow(clippy::too_many_arguments)]
    pub async fn schedule_request(
        &self,
        key: ReplayerRequestKey,
        session_key: SessionKey,
        generation: u32,
        start: Instant,
        inter_packet_delay: Duration,
        packets: Vec<Bytes>,
        timeout: Duration,
        policy: &dyn RetryPolicy,
    ) -> Result<AggregatedRawResponse> {
        self.stats.requests_scheduled.fetch_add(1, Ordering::Relaxed);
        let mut generation = generation;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);

            let outcome = self
                .attempt_send(
                    &key,
                    &session_key,
                    generation,
                    start,
                    inter_packet_delay,
                    &packets,
                    timeout,
                )
                .await;

            let error = match outcome {
                Ok(response) => {
                    self.stats.requests_succeeded.fetch_add(1, Ordering::Relaxed);
                    return Ok(response);
                }
                Err(error) => error,
            };

            match policy.on_failure(&key, attempt, &error) {
                RetryDirective::Retry { after } => {
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(after).await;
                }
                RetryDirective::RetryOnNewSession { after } => {
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    self.stats.sessions_recreated.fetch_add(1, Ordering::Relaxed);
                    self.supersede_session(&session_key);
                    generation += 1;
                    debug!(
                        "Retrying {} on a fresh session at generation {}",
                        key, generation
                    );
                    tokio::time::sleep(after).await;
                }
                RetryDirective::Abort => {
                    self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                    warn!("Request {} failed terminally: {}", key, error);
                    return Err(error);
                }
            }
        }
    }

    /// Schedule connection teardown at `close_time`, after all previously
    /// scheduled work on that session. A close tagged with an older
    /// generation than the live session is stale and is ignored.
    pub async fn schedule_close(
        &self,
        session_key: &SessionKey,
        generation: u32,
        close_time: Instant,
    ) -> Result<()> {
        let Some(session) = self.pool.peek_session(session_key) else {
            return Ok(());
        };
        if session.generation() > generation {
            trace!(
                "Ignoring stale close for {} (generation {} < live {})",
                session_key,
                generation,
                session.generation()
            );
            return Ok(());
        }

        let done = session.schedule_close(close_time)?;
        done.await.map_err(|_| ReverbError::Cancelled)??;
        self.pool.invalidate_session(session_key);
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_send(
        &self,
        key: &ReplayerRequestKey,
        session_key: &SessionKey,
        generation: u32,
        start: Instant,
        inter_packet_delay: Duration,
        packets: &[Bytes],
        timeout: Duration,
    ) -> Result<AggregatedRawResponse> {
        let session = self.pool.get_cached_session(session_key, generation)?;
        let rx = session.enqueue_request(
            key.clone(),
            generation,
            start,
            inter_packet_delay,
            packets.to_vec(),
            timeout,
        )?;
        rx.await.map_err(|_| ReverbError::Cancelled)?
    }

    /// Synthetic-close path for a superseded session: evict it so the next
    /// lookup builds a fresh one, and let the old session close behind any
    /// work it still holds.
    fn supersede_session(&self, session_key: &SessionKey) {
        if let Some(old) = self.pool.invalidate_session(session_key) {
            let _ = old.schedule_close(Instant::now());
        }
    }
}
