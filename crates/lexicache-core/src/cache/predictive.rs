use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tracing::debug;

use crate::models::Record;

pub const DEFAULT_CAPACITY: usize = 500;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub record: Record,
    /// Retention need in [0, 1]
    pub priority_score: f64,
    /// Logical clock value of the last get/set
    pub last_access: u64,
    /// Logical clock value at first insertion
    pub inserted: u64,
}

impl CacheEntry {
    /// Eviction order: lowest score, then oldest access, then oldest insertion.
    fn eviction_cmp(&self, other: &Self) -> Ordering {
        self.priority_score
            .total_cmp(&other.priority_score)
            .then(self.last_access.cmp(&other.last_access))
            .then(self.inserted.cmp(&other.inserted))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn evict_lowest(&mut self) -> Option<String> {
        let victim = self
            .entries
            .values()
            .min_by(|a, b| a.eviction_cmp(b))
            .map(|e| e.key.clone())?;
        self.entries.remove(&victim);
        self.evictions += 1;
        Some(victim)
    }
}

pub struct PredictiveCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

fn normalize(hint: f64) -> f64 {
    if hint.is_nan() {
        0.0
    } else {
        hint.clamp(0.0, 1.0)
    }
}

impl PredictiveCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(CacheState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or update `key`.
    ///
    /// A new key at capacity first evicts the weakest resident entry and is
    /// then always admitted. Returns the evicted key, if any.
    pub fn set(&self, key: &str, record: Record, priority_hint: f64) -> Option<String> {
        if self.capacity == 0 {
            return None;
        }
        let score = normalize(priority_hint);
        let mut state = self.lock();
        let now = state.tick();

        if let Some(entry) = state.entries.get_mut(key) {
            entry.record = record;
            entry.priority_score = score;
            entry.last_access = now;
            return None;
        }

        let mut evicted = None;
        while state.entries.len() >= self.capacity {
            evicted = state.evict_lowest();
            if evicted.is_none() {
                break;
            }
        }
        if let Some(ref victim) = evicted {
            debug!(evicted = %victim, inserted = key, "Predictive cache eviction");
        }

        state.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                record,
                priority_score: score,
                last_access: now,
                inserted: now,
            },
        );
        evicted
    }

    pub fn get(&self, key: &str) -> Option<Record> {
        let mut state = self.lock();
        let now = state.tick();
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = now;
                let record = entry.record.clone();
                state.hits += 1;
                Some(record)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Presence check that does not touch recency or counters.
    pub fn contains(&self, key: &str) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn priority_of(&self, key: &str) -> Option<f64> {
        self.lock().entries.get(key).map(|e| e.priority_score)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        let lookups = state.hits + state.misses;
        CacheStats {
            size: state.entries.len(),
            capacity: self.capacity,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }
}

impl Default for PredictiveCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
