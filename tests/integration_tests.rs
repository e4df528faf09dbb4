//! Integration tests for the accumulation pipeline

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use reverb::accumulate::TrafficAccumulator;
use reverb::capture::{
    CompletionStatus, Observation, ReplayerRequestKey, RequestResponsePair, TrafficChunk,
    TrafficStreamKey,
};
use reverb::config::AccumulationConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn collecting_accumulator(
    window: Duration,
) -> (TrafficAccumulator, Arc<Mutex<Vec<RequestResponsePair>>>) {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = collected.clone();
    let config = AccumulationConfig {
        window,
        granularity: Duration::from_secs(1),
    };
    let accumulator = TrafficAccumulator::new(&config, move |pair| sink.lock().push(pair));
    (accumulator, collected)
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
        first_line_len: 16,
        headers_len: 2,
        timestamp: ts(secs),
    }
}

/// A connection's observation log with `n` complete transactions followed by
/// a close, one second apart.
fn transactions(n: u32) -> Vec<Observation> {
    let mut observations = Vec::new();
    for i in 0..n {
        let t = (i as i64) * 2;
        observations.push(read(b"GET /path HTTP/1.1\r\n\r\n", t));
        observations.push(eom(t));
        observations.push(write(b"HTTP/1.1 200 OK\r\n\r\n", t + 1));
    }
    observations.push(Observation::Close {
        timestamp: ts(n as i64 * 2),
    });
    observations
}

/// Re-chunk one connection's observations into delivery batches of the given
/// sizes, with consecutive stream indices and per-chunk prior-request counts
/// the way a capture proxy writes them.
fn chunked(observations: &[Observation], sizes: &[usize]) -> Vec<TrafficChunk> {
    let mut chunks = Vec::new();
    let mut offset = 0;
    let mut priors = 0u32;
    let mut index = 0u32;
    for &size in sizes {
        let slice = &observations[offset..(offset + size).min(observations.len())];
        if slice.is_empty() {
            break;
        }
        chunks.push(TrafficChunk::with_priors(
            TrafficStreamKey::new("n", "c", index, 0),
            slice.to_vec(),
            priors,
        ));
        priors += slice
            .iter()
            .filter(|o| matches!(o, Observation::EndOfMessage { .. }))
            .count() as u32;
        offset += size;
        index += 1;
        if offset >= observations.len() {
            break;
        }
    }
    chunks
}

fn dedup_by_key(pairs: &[RequestResponsePair]) -> HashMap<ReplayerRequestKey, RequestResponsePair> {
    let mut map = HashMap::new();
    for pair in pairs {
        map.entry(pair.key.clone()).or_insert_with(|| pair.clone());
    }
    map
}

// ============================================================================
// No-drop property
// ============================================================================

#[test]
fn no_drop_regardless_of_chunking() {
    let observations = transactions(5);

    for sizes in [
        vec![observations.len()],
        vec![1; observations.len()],
        vec![2, 3, 5, 2, 4],
        vec![7, 9],
    ] {
        let (accumulator, collected) = collecting_accumulator(Duration::from_secs(60));
        for chunk in chunked(&observations, &sizes) {
            accumulator.accept(&chunk);
        }
        accumulator.finish();

        let pairs = collected.lock();
        assert_eq!(
            pairs.len(),
            5,
            "expected exactly 5 pairs for chunk sizes {:?}",
            sizes
        );
    }
}

// ============================================================================
// Split-resume idempotence
// ============================================================================

#[test]
fn split_resume_dedup_matches_single_run() {
    let observations = transactions(4);
    // Two observations per chunk so transactions straddle chunk boundaries
    let chunks = chunked(&observations, &vec![2; observations.len() / 2 + 1]);

    // Reference: one run over everything
    let (reference, reference_pairs) = collecting_accumulator(Duration::from_secs(60));
    for chunk in &chunks {
        reference.accept(chunk);
    }
    reference.finish();
    let reference_map = dedup_by_key(&reference_pairs.lock());

    for cut in 1..chunks.len() {
        // First run dies after `cut` chunks
        let (first, first_pairs) = collecting_accumulator(Duration::from_secs(60));
        for chunk in &chunks[..cut] {
            first.accept(chunk);
        }
        // No finish(): the process was interrupted, not drained

        // The restarted run rewinds to the chunk where the last *not fully
        // committed* transaction began (not merely the cut point), exactly
        // as the host's offset tracking would.
        let resume = {
            let mut current_start: Option<usize> = None;
            let mut awaiting_response = false;
            for (ci, chunk) in chunks[..cut].iter().enumerate() {
                for o in &chunk.observations {
                    match o {
                        Observation::Read { .. } | Observation::ReadSegment { .. } => {
                            if awaiting_response || current_start.is_none() {
                                current_start = Some(ci);
                                awaiting_response = false;
                            }
                        }
                        Observation::EndOfMessage { .. } => awaiting_response = true,
                        Observation::Close { .. } => {
                            current_start = None;
                            awaiting_response = false;
                        }
                        _ => {}
                    }
                }
            }
            current_start.unwrap_or(cut)
        };

        let (second, second_pairs) = collecting_accumulator(Duration::from_secs(60));
        for chunk in &chunks[resume..] {
            second.accept(chunk);
        }
        second.finish();

        // Union of both runs, deduped by request key, equals the single run
        let mut all = first_pairs.lock().clone();
        all.extend(second_pairs.lock().iter().cloned());
        let deduped = dedup_by_key(&all);

        assert_eq!(
            deduped.len(),
            reference_map.len(),
            "cut at chunk {} lost or duplicated transactions",
            cut
        );
        for key in reference_map.keys() {
            let got = deduped
                .get(key)
                .unwrap_or_else(|| panic!("missing pair {} after cut {}", key, cut));
            assert_eq!(
                got.request_bytes(),
                reference_map[key].request_bytes(),
                "request bytes differ for {} after cut {}",
                key,
                cut
            );
        }
    }
}

// ============================================================================
// Expiration timing
// ============================================================================

#[test]
fn sustained_activity_never_expires_idle_peer_expires_once() {
    let (accumulator, collected) = collecting_accumulator(Duration::from_secs(5));

    // Connection "idle" sends one request at second 0 and goes quiet with a
    // response pending.
    accumulator.accept(&TrafficChunk::new(
        TrafficStreamKey::new("n", "idle", 0, 0),
        vec![read(b"GET /idle HTTP/1.1\r\n\r\n", 0), eom(0)],
    ));

    // Connection "busy" touches once per second for ten seconds.
    for second in 0..=10 {
        accumulator.accept(&TrafficChunk::new(
            TrafficStreamKey::new("n", "busy", second as u32, 0),
            vec![read(b"GET /busy HTTP/1.1\r\n\r\n", second)],
        ));
    }

    let pairs = collected.lock();
    let expired: Vec<_> = pairs
        .iter()
        .filter(|p| p.completion_status == CompletionStatus::Expired)
        .collect();
    assert_eq!(expired.len(), 1, "idle connection expires exactly once");
    assert_eq!(expired[0].key.stream_key.connection_id, "idle");
    assert!(
        !pairs
            .iter()
            .any(|p| p.key.stream_key.connection_id == "busy"),
        "busy connection must never be expired while continuously touched"
    );

    // Busy is still live after ten seconds of sustained traffic
    assert_eq!(accumulator.live_connections(), 1);
}

// ============================================================================
// Segment reconstruction
// ============================================================================

#[test]
fn segmented_request_reconstructs_concatenation() {
    let (accumulator, collected) = collecting_accumulator(Duration::from_secs(60));

    accumulator.accept(&TrafficChunk::new(
        TrafficStreamKey::new("n", "c", 0, 0),
        vec![
            Observation::ReadSegment {
                data: Bytes::from_static(b"GET / HTTP/1.1\r\n"),
                timestamp: ts(0),
            },
            Observation::ReadSegment {
                data: Bytes::from_static(b"Host: localhost\r\n\r\n"),
                timestamp: ts(0),
            },
            Observation::EndOfSegment { timestamp: ts(0) },
            eom(0),
            write(b"HTTP/1.1 200 OK\r\n\r\n", 1),
            Observation::Close { timestamp: ts(1) },
        ],
    ));

    let pairs = collected.lock();
    assert_eq!(pairs.len(), 1);
    assert_eq!(
        pairs[0].request_bytes(),
        Bytes::from_static(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n"),
        "segment payloads must concatenate, never collapse to empty"
    );
}

// ============================================================================
// Restart with prior-request seeding
// ============================================================================

#[test]
fn mid_connection_restart_continues_request_indices() {
    let (accumulator, collected) = collecting_accumulator(Duration::from_secs(60));

    // The capture side already saw 3 completed requests on this connection
    // before the replay window opened.
    accumulator.accept(&TrafficChunk::with_priors(
        TrafficStreamKey::new("n", "c", 9, 0),
        vec![
            read(b"GET /fourth HTTP/1.1\r\n\r\n", 0),
            eom(0),
            write(b"HTTP/1.1 200 OK\r\n\r\n", 1),
            Observation::Close { timestamp: ts(2) },
        ],
        3,
    ));

    let pairs = collected.lock();
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].key.source_request_index, 3);
}

// ============================================================================
// Error surfacing
// ============================================================================

#[test]
fn connection_exception_rides_on_pair_not_machine() {
    let (accumulator, collected) = collecting_accumulator(Duration::from_secs(60));

    accumulator.accept(&TrafficChunk::new(
        TrafficStreamKey::new("n", "c", 0, 0),
        vec![
            read(b"GET / HTTP/1.1\r\n\r\n", 0),
            eom(0),
            Observation::ConnectionException {
                message: "broken pipe".into(),
                timestamp: ts(1),
            },
            write(b"HTTP/1.1 502\r\n\r\n", 2),
            read(b"GET /again HTTP/1.1\r\n\r\n", 3),
            eom(3),
            Observation::Close { timestamp: ts(4) },
        ],
    ));

    let pairs = collected.lock();
    assert_eq!(pairs.len(), 2, "exception must not terminate the machine");
    assert_eq!(pairs[0].error.as_deref(), Some("broken pipe"));
    assert_eq!(pairs[1].error, None);
}
