use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::model::StorageBreakdown;

#[derive(Debug)]
struct CacheEntry {
    breakdown: Arc<StorageBreakdown>,
    cached_at: Instant,
    last_access: u64,
}

#[derive(Debug, Default)]
struct LruState {
    entries: HashMap<String, CacheEntry>,
    tick: u64,
}

impl LruState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn oldest_key(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(key, _)| key.clone())
    }
}

#[derive(Debug)]
pub struct RequestCache {
    state: Mutex<LruState>,
    ttl: Duration,
    capacity: usize,
}

impl RequestCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            state: Mutex::new(LruState::default()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<StorageBreakdown>> {
        self.get_at(key, Instant::now())
    }

    pub fn put(&self, key: &str, breakdown: Arc<StorageBreakdown>) {
        self.put_at(key, breakdown, Instant::now());
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.tick = 0;
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub(crate) fn get_at(&self, key: &str, now: Instant) -> Option<Arc<StorageBreakdown>> {
        let mut state = self.lock();
        let expired = match state.entries.get(key) {
            Some(entry) => now.saturating_duration_since(entry.cached_at) >= self.ttl,
            None => return None,
        };
        if expired {
            debug!(key, "cache entry expired");
            state.entries.remove(key);
            return None;
        }

        let tick = state.next_tick();
        state.entries.get_mut(key).map(|entry| {
            entry.last_access = tick;
            Arc::clone(&entry.breakdown)
        })
    }

    pub(crate) fn put_at(&self, key: &str, breakdown: Arc<StorageBreakdown>, now: Instant) {
        let mut state = self.lock();
        let tick = state.next_tick();
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                breakdown,
                cached_at: now,
                last_access: tick,
            },
        );

        while state.entries.len() > self.capacity {
            let Some(oldest) = state.oldest_key() else {
                break;
            };
            debug!(key = %oldest, "evicting least recently used cache entry");
            state.entries.remove(&oldest);
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
