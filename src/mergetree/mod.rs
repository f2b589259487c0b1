//! Merge tree: the ordered segment structure behind the collaboration engine
//!
//! This module contains the pieces the reconciliation engine is built on:
//!
//! - **Segment Store:** text runs and structural markers with lifecycle stamps
//! - **Property Table:** per-segment annotations with deterministic merging
//! - **Merge Tree:** balanced container with per-subtree cached summaries
//! - **Position Resolver:** absolute and anchor-relative position translation

pub mod position;
pub mod properties;
pub mod segment;
pub mod tree;

pub use position::{Perspective, RelativePosition};
pub use properties::{Combiner, CombiningOp, PropertyMap, PropertySet, PropertyValue};
pub use segment::{ReferenceType, Segment, SegmentContent};
pub use tree::MergeTree;
