//! Data models for the vocabulary cache.
//!
//! - `Record`, `Chunk`: the cached data itself
//! - `UserSettings`, `ProficiencyLevel`: learner configuration
//! - `ErrorCombo`, `MasteryRecord`: learner statistics fed into preload

pub mod learner;
pub mod record;

pub use learner::{ErrorCombo, MasteryRecord, ProficiencyLevel, UserSettings};
pub use record::{Chunk, ChunkPayload, Record};
