//! Persisted key/value storage shared by every process on the machine.
//!
//! This is what the cross-process mutex, the chunk failure counter and the
//! degraded user settings live in. Access is synchronous and values are
//! JSON strings.

pub mod shared;

pub use shared::{get_json, set_json, FileStorage, MemoryStorage, SharedStorage};
