//! Bounded-memory registry of live accumulations
//!
//! Connections with no recent activity are evicted after an idle window,
//! independent of explicit Close delivery (which may be lost or delayed).
//! Active keys are organized into time buckets of `granularity` width so an
//! eviction sweep only inspects buckets older than `now - window`, bounding
//! sweep cost to the number of active buckets rather than the number of
//! connections.
//!
//! Lookup and eviction are deliberately decoupled: `get_or_create_without_expiration`
//! never sweeps, keeping lookup latency predictable.

use crate::accumulate::accumulation::Accumulation;
use crate::capture::{ConnectionId, TrafficStreamKey};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, trace};

/// Bucket index: which connections last saw activity in which time bucket
#[derive(Default)]
struct BucketIndex {
    /// bucket id -> keys whose last activity falls in that bucket
    buckets: BTreeMap<i64, HashSet<ConnectionId>>,
    /// key -> its current bucket, for O(1) re-bucketing on touch
    positions: HashMap<ConnectionId, i64>,
    /// Monotonic time cursor in millis; sweeps never rewind
    cursor_ms: i64,
}

impl BucketIndex {
    fn move_to(&mut self, key: &ConnectionId, bucket: i64) {
        // Out-of-order timestamps must never move a key backwards into an
        // older bucket.
        if let Some(&current) = self.positions.get(key) {
            if current >= bucket {
                return;
            }
        }
        if let Some(old) = self.positions.insert(key.clone(), bucket) {
            if let Some(set) = self.buckets.get_mut(&old) {
                set.remove(key);
                if set.is_empty() {
                    self.buckets.remove(&old);
                }
            }
        }
        self.buckets.entry(bucket).or_default().insert(key.clone());
    }

    fn forget(&mut self, key: &ConnectionId) {
        if let Some(bucket) = self.positions.remove(key) {
            if let Some(set) = self.buckets.get_mut(&bucket) {
                set.remove(key);
                if set.is_empty() {
                    self.buckets.remove(&bucket);
                }
            }
        }
    }
}

/// Registry of active accumulations with time-windowed idle eviction
pub struct ExpiringConnectionMap {
    window_ms: i64,
    granularity_ms: i64,
    entries: DashMap<ConnectionId, Accumulation>,
    index: Mutex<BucketIndex>,
}

impl ExpiringConnectionMap {
    pub fn new(window: Duration, granularity: Duration) -> Self {
        Self {
            window_ms: window.as_millis() as i64,
            granularity_ms: (granularity.as_millis() as i64).max(1),
            entries: DashMap::new(),
            index: Mutex::new(BucketIndex::default()),
        }
    }

    fn bucket_of(&self, ts: DateTime<Utc>) -> i64 {
        ts.timestamp_millis().div_euclid(self.granularity_ms)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up or create (via `factory`) the accumulation for `key`'s
    /// connection and run `f` under its entry guard. Never triggers eviction.
    pub fn get_or_create_without_expiration<R>(
        &self,
        key: &TrafficStreamKey,
        factory: impl FnOnce() -> Accumulation,
        f: impl FnOnce(&mut Accumulation) -> R,
    ) -> R {
        let mut entry = self.entries.entry(key.connection()).or_insert_with(factory);
        f(entry.value_mut())
    }

    /// Record activity for a connection at the given capture timestamp,
    /// re-bucketing it so the sweep sees it as fresh.
    pub fn touch(&self, key: &ConnectionId, ts: DateTime<Utc>) {
        let bucket = self.bucket_of(ts);
        self.index.lock().move_to(key, bucket);
    }

    /// Remove a connection explicitly (Close path). Clears its bucket entry.
    pub fn remove(&self, key: &ConnectionId) -> Option<Accumulation> {
        self.index.lock().forget(key);
        self.entries.remove(key).map(|(_, acc)| acc)
    }

    /// Advance the time cursor to `now` and evict every connection whose
    /// last-activity bucket lies entirely outside the window. Returns the
    /// evicted accumulations; the caller drives their expired-pair emission.
    pub fn expire_old_entries(&self, now: DateTime<Utc>) -> Vec<Accumulation> {
        let stale: Vec<ConnectionId> = {
            let mut index = self.index.lock();
            index.cursor_ms = index.cursor_ms.max(now.timestamp_millis());

            // A bucket is stale once its newest possible activity is older
            // than the window.
            let cutoff_ms = index.cursor_ms - self.window_ms;
            let mut stale = Vec::new();
            let mut emptied = Vec::new();
            for (&bucket, keys) in index.buckets.iter() {
                if (bucket + 1) * self.granularity_ms > cutoff_ms {
                    break;
                }
                stale.extend(keys.iter().cloned());
                emptied.push(bucket);
            }
            for bucket in emptied {
                index.buckets.remove(&bucket);
            }
            for key in &stale {
                index.positions.remove(key);
            }
            stale
        };

        let mut evicted = Vec::with_capacity(stale.len());
        for key in stale {
            if let Some((_, acc)) = self.entries.remove(&key) {
                trace!("Expiring idle connection {}", key);
                evicted.push(acc);
            }
        }
        if !evicted.is_empty() {
            debug!("Expired {} idle connections", evicted.len());
        }
        evicted
    }

    /// Remove and return every live accumulation (end-of-input drain)
    pub fn drain_all(&self) -> Vec<Accumulation> {
        let keys: Vec<ConnectionId> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut index = self.index.lock();
        keys.iter().for_each(|k| index.forget(k));
        drop(index);
        keys.iter()
            .filter_map(|k| self.entries.remove(k).map(|(_, acc)| acc))
            .collect()
    }
}
