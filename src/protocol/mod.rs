//! Wire protocol: operation codec and chunk snapshots
//!
//! Everything that crosses the replica boundary lives here: the JSON
//! operation contract consumed by the reconciliation engine and the chunk
//! format used to bootstrap new replicas.

pub mod chunk;
pub mod ops;

pub use chunk::{MergeTreeChunk, PropertyString};
pub use ops::{decode, encode, InsertContent, MarkerDef, Operation};
