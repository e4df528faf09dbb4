//! Source-time to wall-clock mapping
//!
//! Replay preserves the original pacing of the capture: the first timestamp
//! seen anchors a fixed affine mapping from source-capture time to replay
//! wall-clock time, and every later timestamp is shifted by the same offset,
//! scaled by the configured speed multiplier relative to that anchor.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Anchor {
    source: DateTime<Utc>,
    real: Instant,
}

/// Lazily-anchored affine mapping between source-capture time and replay
/// wall-clock time.
///
/// Returned times are monotonically increasing iff the input source
/// timestamps are monotonically increasing.
pub struct TimeShifter {
    anchor: RwLock<Option<Anchor>>,
    /// Replay speed: 2.0 halves every source delay
    speed_multiplier: f64,
}

impl TimeShifter {
    pub fn new(speed_multiplier: f64) -> Self {
        Self {
            anchor: RwLock::new(None),
            speed_multiplier,
        }
    }

    /// Whether the anchor has been established
    pub fn is_anchored(&self) -> bool {
        self.anchor.read().is_some()
    }

    /// Map a source-capture timestamp to the wall-clock instant at which it
    /// should be replayed. The very first call anchors the mapping at `now`.
    pub fn transform_source_time_to_real_time(&self, source_ts: DateTime<Utc>) -> Instant {
        let anchor = self.anchor_or_init(source_ts);
        let delta_ns = (source_ts - anchor.source)
            .num_nanoseconds()
            .unwrap_or(i64::MAX);
        let shifted_ns = (delta_ns as f64 / self.speed_multiplier) as i64;
        shift(anchor.real, shifted_ns)
    }

    /// Inverse mapping. Returns `None` if called before any anchor has been
    /// established.
    pub fn transform_real_time_to_source_time(&self, real_ts: Instant) -> Option<DateTime<Utc>> {
        let anchor = (*self.anchor.read())?;
        let delta_ns = if real_ts >= anchor.real {
            (real_ts - anchor.real).as_nanos() as i64
        } else {
            -((anchor.real - real_ts).as_nanos() as i64)
        };
        let source_ns = (delta_ns as f64 * self.speed_multiplier) as i64;
        Some(anchor.source + chrono::Duration::nanoseconds(source_ns))
    }

    fn anchor_or_init(&self, source_ts: DateTime<Utc>) -> Anchor {
        if let Some(anchor) = *self.anchor.read() {
            return anchor;
        }
        let mut guard = self.anchor.write();
        *guard.get_or_insert(Anchor {
            source: source_ts,
            real: Instant::now(),
        })
    }
}

fn shift(base: Instant, delta_ns: i64) -> Instant {
    if delta_ns >= 0 {
        base + std::time::Duration::from_nanos(delta_ns as u64)
    } else {
        base.checked_sub(std::time::Duration::from_nanos(delta_ns.unsigned_abs()))
            .unwrap_or(base)
    }
}
