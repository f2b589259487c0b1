//! Error types shared across the merge tree and reconciliation engine
//!
//! Every failure is recovered at the operation boundary: the offending
//! operation (or whole group) is rejected without mutating tree state and
//! reconciliation continues with the next operation in sequence.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, MergeError>;

/// Errors produced while decoding or applying operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MergeError {
    /// Absolute position outside the current visible bounds
    #[error("position {position} out of range (visible length: {length})")]
    PositionOutOfRange { position: usize, length: usize },

    /// Relative position references a pruned or nonexistent segment id
    /// and the anchor is not slide-eligible
    #[error("unknown anchor segment: {0}")]
    UnknownAnchor(String),

    /// Structurally invalid operation (e.g. both `text` and `marker` set)
    #[error("malformed operation: {0}")]
    MalformedOperation(String),

    /// A member of a group failed resolution; the whole group is rejected
    #[error("group member {index} failed: {source}")]
    GroupPartialFailure {
        index: usize,
        #[source]
        source: Box<MergeError>,
    },

    /// Sequenced operation delivered out of order
    #[error("out-of-order sequence number: expected {expected}, got {got}")]
    OutOfOrderSequence { expected: u64, got: u64 },

    /// Insert references a register that was never filled
    #[error("unknown register: {0}")]
    UnknownRegister(String),
}
