//! Time-windowed deduplication of inbound event ids.
//!
//! Injected as `Arc<dyn DedupCache>` so a sharded deployment can back it with
//! a shared store; [`InMemoryDedup`] serves a single process.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

/// Dedup key for a demand-response event. Aggregators reuse event ids across
/// the facilities they dispatch, so the facility is part of the key.
pub fn event_key(facility_id: &str, event_id: &str) -> String {
    format!("{facility_id}/{event_id}")
}

pub trait DedupCache: Send + Sync {
    /// Records `key` as seen at `now`. Returns `false` if it was already
    /// recorded within the window (i.e. the caller holds a duplicate).
    fn check_and_insert(&self, key: &str, now: DateTime<Utc>) -> bool;

    /// Drops entries older than the window. Returns how many were evicted.
    fn evict_expired(&self, now: DateTime<Utc>) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded in-process dedup set with FIFO eviction.
#[derive(Debug)]
pub struct InMemoryDedup {
    window: TimeDelta,
    capacity: usize,
    inner: Mutex<DedupState>,
}

#[derive(Debug, Default)]
struct DedupState {
    seen: HashMap<String, DateTime<Utc>>,
    order: VecDeque<(DateTime<Utc>, String)>,
}

impl InMemoryDedup {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(window: TimeDelta, capacity: usize) -> Self {
        assert!(capacity > 0, "dedup capacity must be > 0");
        Self {
            window,
            capacity,
            inner: Mutex::new(DedupState::default()),
        }
    }
}

impl DedupState {
    fn evict_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        while let Some((at, _)) = self.order.front() {
            if *at >= cutoff {
                break;
            }
            if let Some((at, key)) = self.order.pop_front() {
                // Only drop the map entry if it wasn't refreshed since.
                if self.seen.get(&key) == Some(&at) {
                    self.seen.remove(&key);
                }
                evicted += 1;
            }
        }
        evicted
    }
}

impl DedupCache for InMemoryDedup {
    fn check_and_insert(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut state = self.inner.lock();
        state.evict_before(now - self.window);

        if state.seen.contains_key(key) {
            return false;
        }
        while state.seen.len() >= self.capacity {
            let Some((at, oldest)) = state.order.pop_front() else {
                break;
            };
            if state.seen.get(&oldest) == Some(&at) {
                state.seen.remove(&oldest);
            }
        }
        state.seen.insert(key.to_string(), now);
        state.order.push_back((now, key.to_string()));
        true
    }

    fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        self.inner.lock().evict_before(now - self.window)
    }

    fn len(&self) -> usize {
        self.inner.lock().seen.len()
    }
}
