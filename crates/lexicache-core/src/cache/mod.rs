//! In-memory record cache with mastery-aware eviction.
//!
//! Entries carry a retention score (higher = the learner needs this record
//! more). When full, the lowest-scoring entry goes first, so under pressure
//! the cache keeps what the learner is weakest at.

pub mod predictive;

pub use predictive::{CacheEntry, CacheStats, PredictiveCache, DEFAULT_CAPACITY};
