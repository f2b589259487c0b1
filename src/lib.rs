//! MergeTree Core - collaborative sequence engine
//!
//! This crate implements the merge tree underlying a real-time multi-user
//! document editor:
//! - Segment model (text runs and structural markers) with tombstone lifecycle
//! - Balanced merge tree with per-subtree summaries and O(log n) lookup
//! - Position resolution against a client's reference sequence number
//! - Reconciliation of globally sequenced insert/remove/annotate/group ops
//! - JSON wire codec and chunk snapshots for replica bootstrap
//!
//! Every replica that applies the same globally ordered stream of operations
//! converges to an identical visible sequence, while each client may apply
//! its own operations optimistically before they are acknowledged.
//!
//! # Examples
//!
//! ```rust
//! use mergetree_core::{Replica, Operation};
//!
//! let mut replica = Replica::new("client-a".to_string());
//! let wire = replica
//!     .submit_local(Operation::insert_text(0, "Hello"))
//!     .unwrap();
//! assert_eq!(replica.text(), "Hello");
//! // `wire` now goes to the sequencing channel and comes back stamped
//! // with a global sequence number.
//! # let _ = wire;
//! ```

pub mod engine;
pub mod error;
pub mod mergetree;
pub mod protocol;

// Re-exports for convenience
pub use engine::{Replica, SequencedOp};
pub use error::{MergeError, Result};
pub use mergetree::position::{Perspective, RelativePosition};
pub use mergetree::properties::{Combiner, CombiningOp, PropertyMap, PropertySet, PropertyValue};
pub use mergetree::segment::{ReferenceType, Segment, SegmentContent};
pub use mergetree::tree::MergeTree;
pub use protocol::chunk::MergeTreeChunk;
pub use protocol::ops::{InsertContent, MarkerDef, Operation};

/// Client identifier type
pub type ClientId = String;

/// Global sequence number assigned by the delivery pipeline
pub type SeqNumber = u64;

/// Stable anchor identifier of a segment
pub type SegmentId = String;
