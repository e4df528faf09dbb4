//! Per-connection accumulation state machine
//!
//! One `Accumulation` reconstructs the transactions of a single
//! connection-generation from its observation stream. Transitions are pure
//! and synchronous; the accumulator drives one observation at a time and
//! collects finalized pairs from the return value.
//!
//! The machine never waits for an explicit "response complete" marker, since
//! none is guaranteed to exist. A read observation arriving while a response
//! is accumulating finalizes the in-flight pair and begins the next request.

use crate::accumulate::AccumulatorStats;
use crate::capture::{
    CompletionStatus, ConnectionId, HttpMessageAndTimestamp, Observation, ReplayerRequestKey,
    RequestResponsePair, TrafficStreamKey,
};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::sync::atomic::Ordering;
use tracing::{debug, trace, warn};

/// Lifecycle state of one accumulation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulationState {
    /// Initial: reads append to the request buffer
    AccumulatingRequest,
    /// After EndOfMessage: writes append to the response buffer
    AccumulatingResponse,
    /// After Close or expiration; the accumulation is awaiting removal
    Closed,
}

/// An open segment run: segment payloads concatenated in arrival order until
/// EndOfSegment folds them into the active buffer as one packet.
struct SegmentRun {
    buf: BytesMut,
    first_timestamp: DateTime<Utc>,
}

/// A request frozen by EndOfMessage whose response is still accumulating
struct InFlightPair {
    key: ReplayerRequestKey,
    request: HttpMessageAndTimestamp,
    response: HttpMessageAndTimestamp,
}

/// Live reconstruction state for one connection-generation
pub struct Accumulation {
    connection: ConnectionId,
    generation: u32,
    state: AccumulationState,
    /// Request bytes not yet frozen by EndOfMessage
    request: HttpMessageAndTimestamp,
    /// The pair whose response is currently accumulating, if any
    in_flight: Option<InFlightPair>,
    /// Open segment run on the side implied by `state`
    segment: Option<SegmentRun>,
    /// Stream key of the most recent chunk, kept for request-key assignment
    stream_key: TrafficStreamKey,
    /// Capture timestamp of the most recent observation
    last_activity: Option<DateTime<Utc>>,
    /// Exception recorded while the current transaction is in flight
    pending_error: Option<String>,
    /// Requests begun on this connection (assigns source_request_index)
    requests_started: u32,
    /// Requests finalized as successful
    requests_completed: u32,
}

impl Accumulation {
    pub fn new(key: &TrafficStreamKey) -> Self {
        Self::with_priors(key, 0)
    }

    /// Start an accumulation whose connection already completed
    /// `prior_requests` requests before the replay window opened, so request
    /// indices continue where the capture side's counter left off.
    pub fn with_priors(key: &TrafficStreamKey, prior_requests: u32) -> Self {
        Self {
            connection: key.connection(),
            generation: key.generation,
            state: AccumulationState::AccumulatingRequest,
            request: HttpMessageAndTimestamp::new(),
            in_flight: None,
            segment: None,
            stream_key: key.clone(),
            last_activity: None,
            pending_error: None,
            requests_started: prior_requests,
            requests_completed: 0,
        }
    }

    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn state(&self) -> AccumulationState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == AccumulationState::Closed
    }

    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.last_activity
    }

    pub fn requests_started(&self) -> u32 {
        self.requests_started
    }

    pub fn requests_completed(&self) -> u32 {
        self.requests_completed
    }

    /// Apply one observation in capture order.
    ///
    /// Returns the pairs finalized by this observation (at most one, except
    /// on close). After a `Close` the accumulation reports `is_closed` and
    /// must be removed from the live map by the caller.
    pub fn accept(
        &mut self,
        key: &TrafficStreamKey,
        observation: &Observation,
        stats: &AccumulatorStats,
    ) -> Vec<RequestResponsePair> {
        if self.state == AccumulationState::Closed {
            warn!(
                "Dropping {} observation for closed connection {}",
                observation.kind(),
                self.connection
            );
            return Vec::new();
        }

        self.stream_key = key.clone();
        self.last_activity = Some(observation.timestamp());

        match observation {
            Observation::Read { data, timestamp } => {
                self.on_read(data.clone(), *timestamp, stats).into_iter().collect()
            }
            Observation::ReadSegment { data, timestamp } => {
                let finished = match self.state {
                    // Start of the next request while a response accumulates
                    AccumulationState::AccumulatingResponse => {
                        self.flush_segment();
                        self.finalize_in_flight(CompletionStatus::Successful, stats)
                    }
                    _ => None,
                };
                self.append_segment(data.clone(), *timestamp);
                finished.into_iter().collect()
            }
            Observation::EndOfSegment { .. } => {
                self.flush_segment();
                Vec::new()
            }
            Observation::EndOfMessage { .. } => self.on_end_of_message(stats).into_iter().collect(),
            Observation::Write { data, timestamp } => {
                self.on_write(data.clone(), *timestamp, stats);
                Vec::new()
            }
            Observation::WriteSegment { data, timestamp } => {
                match self.state {
                    AccumulationState::AccumulatingResponse => {
                        self.append_segment(data.clone(), *timestamp);
                    }
                    _ => self.drop_orphaned_write(stats),
                }
                Vec::new()
            }
            Observation::Close { .. } => self.flush(CompletionStatus::ClosedPrematurely, stats),
            Observation::ConnectionException { message, .. } => {
                debug!(
                    "Connection exception on {}: {}",
                    self.connection, message
                );
                stats.exceptions_recorded.fetch_add(1, Ordering::Relaxed);
                if self.transaction_in_flight() {
                    self.pending_error = Some(message.clone());
                }
                Vec::new()
            }
        }
    }

    /// Flush any in-flight transaction with the given status and close.
    ///
    /// Shared by the explicit-close path (`ClosedPrematurely`), the
    /// expiration sweep (`Expired`), and end-of-input draining. Truncated
    /// segment runs are folded into the emission rather than discarded.
    pub fn flush(
        &mut self,
        status: CompletionStatus,
        stats: &AccumulatorStats,
    ) -> Vec<RequestResponsePair> {
        self.flush_segment();

        let mut finished = Vec::new();

        if let Some(pair) = self.finalize_in_flight(status, stats) {
            finished.push(pair);
        }

        // A request truncated before its EndOfMessage still gets emitted so
        // no captured data is silently lost.
        if !self.request.is_empty() {
            let request = std::mem::take(&mut self.request);
            let key = self.next_request_key(stats);
            finished.push(self.build_pair(
                key,
                request,
                HttpMessageAndTimestamp::new(),
                status,
                stats,
            ));
        }

        self.state = AccumulationState::Closed;
        trace!("Closed accumulation for {} ({:?})", self.connection, status);
        finished
    }

    fn on_read(
        &mut self,
        data: Bytes,
        timestamp: DateTime<Utc>,
        stats: &AccumulatorStats,
    ) -> Option<RequestResponsePair> {
        self.flush_segment();
        let finished = match self.state {
            AccumulationState::AccumulatingResponse => {
                // Start of the next request implicitly finalizes the pair
                self.finalize_in_flight(CompletionStatus::Successful, stats)
            }
            _ => None,
        };
        self.request.append(data, timestamp);
        finished
    }

    fn on_write(&mut self, data: Bytes, timestamp: DateTime<Utc>, stats: &AccumulatorStats) {
        match self.state {
            AccumulationState::AccumulatingResponse => {
                self.flush_segment();
                if let Some(pair) = self.in_flight.as_mut() {
                    pair.response.append(data, timestamp);
                }
            }
            // Response bytes for a request captured before this replay
            // window opened; there is nothing to attach them to.
            _ => self.drop_orphaned_write(stats),
        }
    }

    fn on_end_of_message(&mut self, stats: &AccumulatorStats) -> Option<RequestResponsePair> {
        self.flush_segment();

        if self.state == AccumulationState::AccumulatingResponse {
            warn!(
                "EndOfMessage with no request bytes on {}, ignoring",
                self.connection
            );
            return None;
        }

        if self.request.is_empty() {
            warn!(
                "EndOfMessage with empty request buffer on {}, ignoring",
                self.connection
            );
            return None;
        }

        let request = std::mem::take(&mut self.request);
        let key = self.next_request_key(stats);
        debug!("Request {} frozen, accumulating response", key);

        self.in_flight = Some(InFlightPair {
            key,
            request,
            response: HttpMessageAndTimestamp::new(),
        });
        self.state = AccumulationState::AccumulatingResponse;
        None
    }

    fn finalize_in_flight(
        &mut self,
        status: CompletionStatus,
        stats: &AccumulatorStats,
    ) -> Option<RequestResponsePair> {
        let pair = self.in_flight.take()?;
        if status == CompletionStatus::Successful {
            self.requests_completed += 1;
        }
        self.state = AccumulationState::AccumulatingRequest;
        Some(self.build_pair(pair.key, pair.request, pair.response, status, stats))
    }

    fn build_pair(
        &mut self,
        key: ReplayerRequestKey,
        request: HttpMessageAndTimestamp,
        response: HttpMessageAndTimestamp,
        status: CompletionStatus,
        stats: &AccumulatorStats,
    ) -> RequestResponsePair {
        match status {
            CompletionStatus::Successful => {
                stats.pairs_completed.fetch_add(1, Ordering::Relaxed);
            }
            CompletionStatus::ClosedPrematurely => {
                stats.pairs_closed_prematurely.fetch_add(1, Ordering::Relaxed);
            }
            CompletionStatus::Expired => {
                stats.pairs_expired.fetch_add(1, Ordering::Relaxed);
            }
        }

        RequestResponsePair {
            key,
            request_data: request.into_packets(),
            response_data: response.into_packets(),
            completion_status: status,
            error: self.pending_error.take(),
        }
    }

    fn next_request_key(&mut self, stats: &AccumulatorStats) -> ReplayerRequestKey {
        let index = self.requests_started;
        self.requests_started += 1;
        stats.requests_started.fetch_add(1, Ordering::Relaxed);
        ReplayerRequestKey::new(self.stream_key.clone(), index)
    }

    fn append_segment(&mut self, data: Bytes, timestamp: DateTime<Utc>) {
        match self.segment.as_mut() {
            Some(run) => run.buf.extend_from_slice(&data),
            None => {
                self.segment = Some(SegmentRun {
                    buf: BytesMut::from(&data[..]),
                    first_timestamp: timestamp,
                });
            }
        }
    }

    /// Fold an open segment run into the buffer for the current side as one
    /// packet. Called on EndOfSegment and whenever a run is interrupted, so
    /// truncated runs survive into the premature-close emission.
    fn flush_segment(&mut self) {
        if let Some(run) = self.segment.take() {
            let data = run.buf.freeze();
            match self.state {
                AccumulationState::AccumulatingResponse => {
                    if let Some(pair) = self.in_flight.as_mut() {
                        pair.response.append(data, run.first_timestamp);
                    }
                }
                _ => self.request.append(data, run.first_timestamp),
            }
        }
    }

    fn drop_orphaned_write(&mut self, stats: &AccumulatorStats) {
        trace!(
            "Dropping response bytes with no request in progress on {}",
            self.connection
        );
        stats.orphaned_writes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn transaction_in_flight(&self) -> bool {
        self.in_flight.is_some() || !self.request.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn key() -> TrafficStreamKey {
        TrafficStreamKey::new("n", "c", 0, 0)
    }

    fn read(data: &'static [u8], secs: i64) -> Observation {
        Observation::Read {
            data: Bytes::from_static(data),
            timestamp: ts(secs),
        }
    }

    fn write(data: &'static [u8], secs: i64) -> Observation {
        Observation::Write {
            data: Bytes::from_static(data),
            timestamp: ts(secs),
        }
    }

    fn eom(secs: i64) -> Observation {
        Observation::EndOfMessage {
            first_line_len: 0,
            headers_len: 0,
            timestamp: ts(secs),
        }
    }

    fn apply(
        acc: &mut Accumulation,
        stats: &AccumulatorStats,
        observations: &[Observation],
    ) -> Vec<RequestResponsePair> {
        observations
            .iter()
            .flat_map(|o| acc.accept(&key(), o, stats))
            .collect()
    }

    #[test]
    fn test_simple_transaction() {
        let mut acc = Accumulation::new(&key());
        let stats = AccumulatorStats::default();

        let pairs = apply(
            &mut acc,
            &stats,
            &[
                read(b"GET / HTTP/1.1\r\n\r\n", 1),
                eom(1),
                write(b"HTTP/1.1 200 OK\r\n\r\n", 2),
                Observation::Close { timestamp: ts(3) },
            ],
        );

        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].key.source_request_index, 0);
        assert_eq!(pairs[0].completion_status, CompletionStatus::ClosedPrematurely);
        assert_eq!(
            pairs[0].request_bytes(),
            Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n")
        );
        assert_eq!(
            pairs[0].response_bytes(),
            Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\n")
        );
        assert!(acc.is_closed());
    }

    #[test]
    fn test_next_read_finalizes_as_successful() {
        let mut acc = Accumulation::new(&key());
        let stats = AccumulatorStats::default();

        let pairs = apply(
            &mut acc,
            &stats,
            &[
                read(b"GET /a HTTP/1.1\r\n\r\n", 1),
                eom(1),
                write(b"HTTP/1.1 200 OK\r\n\r\n", 2),
                read(b"GET /b HTTP/1.1\r\n\r\n", 3),
            ],
        );

        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].completion_status, CompletionStatus::Successful);
        assert_eq!(acc.requests_completed(), 1);
        assert_eq!(acc.state(), AccumulationState::AccumulatingRequest);
        assert_eq!(acc.requests_started(), 1);
    }

    #[test]
    fn test_segmented_request_concatenates_payloads() {
        let mut acc = Accumulation::new(&key());
        let stats = AccumulatorStats::default();

        let pairs = apply(
            &mut acc,
            &stats,
            &[
                Observation::ReadSegment {
                    data: Bytes::from_static(b"GET / HTTP/1.1\r\n"),
                    timestamp: ts(1),
                },
                Observation::ReadSegment {
                    data: Bytes::from_static(b"Host: localhost\r\n\r\n"),
                    timestamp: ts(1),
                },
                Observation::EndOfSegment { timestamp: ts(1) },
                eom(1),
                Observation::Close { timestamp: ts(2) },
            ],
        );

        assert_eq!(pairs.len(), 1);
        assert_eq!(
            pairs[0].request_bytes(),
            Bytes::from_static(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        );
        // One assembled packet, not two, and never an empty buffer
        assert_eq!(pairs[0].request_data.len(), 1);
        assert!(!pairs[0].request_data[0].data.is_empty());
    }

    #[test]
    fn test_truncated_segment_run_folds_into_close() {
        let mut acc = Accumulation::new(&key());
        let stats = AccumulatorStats::default();

        let pairs = apply(
            &mut acc,
            &stats,
            &[
                Observation::ReadSegment {
                    data: Bytes::from_static(b"GET /partial"),
                    timestamp: ts(1),
                },
                // No EndOfSegment before close
                Observation::Close { timestamp: ts(2) },
            ],
        );

        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].completion_status, CompletionStatus::ClosedPrematurely);
        assert_eq!(pairs[0].request_bytes(), Bytes::from_static(b"GET /partial"));
    }

    #[test]
    fn test_exception_surfaces_on_in_flight_pair() {
        let mut acc = Accumulation::new(&key());
        let stats = AccumulatorStats::default();

        let pairs = apply(
            &mut acc,
            &stats,
            &[
                read(b"GET / HTTP/1.1\r\n\r\n", 1),
                eom(1),
                Observation::ConnectionException {
                    message: "connection reset by peer".into(),
                    timestamp: ts(2),
                },
                write(b"HTTP/1.1 500\r\n\r\n", 3),
                read(b"GET /next HTTP/1.1\r\n\r\n", 4),
            ],
        );

        assert_eq!(pairs.len(), 1);
        assert_eq!(
            pairs[0].error.as_deref(),
            Some("connection reset by peer")
        );
        // The machine did not terminate
        assert!(!acc.is_closed());
    }

    #[test]
    fn test_orphaned_writes_dropped_not_emitted() {
        let mut acc = Accumulation::new(&key());
        let stats = AccumulatorStats::default();

        let pairs = apply(
            &mut acc,
            &stats,
            &[
                write(b"HTTP/1.1 200 OK\r\n\r\nleftover", 1),
                read(b"GET / HTTP/1.1\r\n\r\n", 2),
                eom(2),
                Observation::Close { timestamp: ts(3) },
            ],
        );

        assert_eq!(stats.orphaned_writes_dropped.load(Ordering::Relaxed), 1);
        assert_eq!(pairs.len(), 1);
        assert!(pairs[0].response_data.is_empty());
    }

    #[test]
    fn test_duplicate_end_of_message_ignored() {
        let mut acc = Accumulation::new(&key());
        let stats = AccumulatorStats::default();

        let pairs = apply(
            &mut acc,
            &stats,
            &[read(b"GET / HTTP/1.1\r\n\r\n", 1), eom(1), eom(1)],
        );

        assert!(pairs.is_empty());
        assert_eq!(acc.requests_started(), 1);
    }

    #[test]
    fn test_request_indices_increment_per_connection() {
        let mut acc = Accumulation::new(&key());
        let stats = AccumulatorStats::default();

        let pairs = apply(
            &mut acc,
            &stats,
            &[
                read(b"GET /a HTTP/1.1\r\n\r\n", 1),
                eom(1),
                write(b"HTTP/1.1 200 OK\r\n\r\n", 2),
                read(b"GET /b HTTP/1.1\r\n\r\n", 3),
                eom(3),
                write(b"HTTP/1.1 404\r\n\r\n", 4),
                Observation::Close { timestamp: ts(5) },
            ],
        );

        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].key.source_request_index, 0);
        assert_eq!(pairs[1].key.source_request_index, 1);
    }

    #[test]
    fn test_observations_after_close_dropped() {
        let mut acc = Accumulation::new(&key());
        let stats = AccumulatorStats::default();

        apply(&mut acc, &stats, &[Observation::Close { timestamp: ts(1) }]);
        let pairs = apply(&mut acc, &stats, &[read(b"GET / HTTP/1.1\r\n\r\n", 2)]);

        assert!(pairs.is_empty());
        assert!(acc.is_closed());
    }
}
