//! Chunk registry and key index.
//!
//! The registry is the static description of which chunks exist and what
//! they contain. The index answers "which chunk holds this key?" for any
//! key at all, falling back to a heuristic bucket for unregistered keys.

pub mod index;
pub mod metadata;

pub use index::{ChunkHeuristic, IndexEntry, IndexProvenance, KeyIndex, SuffixHeuristic};
pub use metadata::{ChunkMetadata, ChunkProvenance, ChunkRegistry};
