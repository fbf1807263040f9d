use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// In-memory front of the processed-id ledger.
///
/// Entries expire after `ttl`. When the cache is full the oldest entries are
/// dropped first. A miss says nothing; the ledger decides.
pub struct DedupCache {
    entries: DashMap<String, Instant>,
    /// Insertion order, oldest first. Inserts take this lock so the size check
    /// and the eviction it triggers happen as one step.
    order: Mutex<VecDeque<(String, Instant)>>,
    capacity: usize,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DedupCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn contains(&self, message_id: &str) -> bool {
        let fresh = match self.entries.get(message_id) {
            Some(inserted_at) => inserted_at.elapsed() < self.ttl,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        if fresh {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            let ttl = self.ttl;
            self.entries
                .remove_if(message_id, |_, inserted_at| inserted_at.elapsed() >= ttl);
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        fresh
    }

    /// Records `message_id`. A fresh entry keeps its original timestamp.
    pub fn insert(&self, message_id: impl Into<String>) {
        let message_id = message_id.into();
        let mut order = self.order();
        let now = Instant::now();

        let fresh = self
            .entries
            .get(&message_id)
            .map_or(false, |inserted_at| now.duration_since(*inserted_at) < self.ttl);
        if fresh {
            return;
        }

        self.entries.insert(message_id.clone(), now);
        order.push_back((message_id, now));
        self.evict(&mut order, now);
    }

    /// Pops from the old end while the front is expired, superseded, or the
    /// cache is over capacity. Each pop is O(1).
    fn evict(&self, order: &mut VecDeque<(String, Instant)>, now: Instant) {
        while let Some((message_id, inserted_at)) = order.front() {
            let expired = now.duration_since(*inserted_at) >= self.ttl;
            let superseded = self
                .entries
                .get(message_id)
                .map_or(true, |current| *current != *inserted_at);
            if !expired && !superseded && self.entries.len() <= self.capacity {
                break;
            }

            if let Some((message_id, inserted_at)) = order.pop_front() {
                self.entries
                    .remove_if(&message_id, |_, current| *current == inserted_at);
            }
        }
    }

    fn order(&self) -> MutexGuard<'_, VecDeque<(String, Instant)>> {
        self.order.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        let mut order = self.order();
        order.clear();
        self.entries.clear();
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
