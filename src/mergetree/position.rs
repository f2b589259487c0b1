//! Position Resolver: translating operation positions into tree locations
//!
//! An operation names positions either as absolute offsets valid at the
//! sequence number its author had last observed, or as descriptors relative
//! to an anchor segment. Both forms resolve against the current tree through
//! a [`Perspective`]: the pair of reference sequence number and submitting
//! client that decides which segments the operation could see. Segments
//! inserted by other clients after the reference point are skipped while
//! counting, so a resolved location falls into its correct relative slot no
//! matter how many concurrent edits landed first.

use crate::error::{MergeError, Result};
use crate::mergetree::tree::MergeTree;
use crate::{ClientId, SegmentId, SeqNumber};
use serde::{Deserialize, Serialize};

/// The view an operation was authored against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Perspective {
    /// Global sequence number the submitting client had last observed
    pub ref_seq: SeqNumber,
    /// Submitting client; its own unacknowledged edits are always visible
    pub client: ClientId,
}

impl Perspective {
    /// Perspective of an operation sequenced against `ref_seq`
    pub fn new(ref_seq: SeqNumber, client: ClientId) -> Self {
        Self { ref_seq, client }
    }

    /// The up-to-date view of a replica owned by `client`
    pub fn current(client: ClientId) -> Self {
        Self {
            ref_seq: SeqNumber::MAX,
            client,
        }
    }
}

/// A position anchored to a segment id rather than an absolute offset
///
/// Resolves to "immediately before/after segment `id`", shifted by `offset`
/// characters in the indicated direction. It stays valid even when absolute
/// offsets elsewhere in the document have shifted under concurrent edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelativePosition {
    /// Anchor segment identifier
    pub id: SegmentId,

    /// If true, resolve before the anchor and subtract `offset`;
    /// otherwise resolve after it and add `offset`
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub before: bool,

    /// Character shift away from the anchor boundary
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl RelativePosition {
    /// Position immediately after the segment `id`
    pub fn after(id: impl Into<SegmentId>) -> Self {
        Self {
            id: id.into(),
            before: false,
            offset: 0,
        }
    }

    /// Position immediately before the segment `id`
    pub fn before(id: impl Into<SegmentId>) -> Self {
        Self {
            id: id.into(),
            before: true,
            offset: 0,
        }
    }
}

/// What an omitted endpoint means for a given operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointDefault {
    /// Resolve to position 0
    Start,
    /// Resolve to the perspective-visible end of the sequence
    End,
    /// The endpoint may not be omitted
    Required,
}

/// Resolve a relative position to an offset in `perspective`'s coordinates
///
/// Fails with `UnknownAnchor` when the anchor id does not exist (for example
/// after garbage collection pruned it) or when the anchor is a tombstone
/// without the slide-on-remove flag. A slide-eligible tombstone resolves to
/// the boundary between its surviving neighbors.
pub fn resolve_relative(
    tree: &MergeTree,
    rel: &RelativePosition,
    perspective: &Perspective,
) -> Result<usize> {
    let anchor = tree
        .locate_anchor(&rel.id, perspective)
        .ok_or_else(|| MergeError::UnknownAnchor(rel.id.clone()))?;

    if anchor.tombstoned && !anchor.slides {
        return Err(MergeError::UnknownAnchor(rel.id.clone()));
    }

    let base = if rel.before {
        anchor.start
    } else {
        anchor.start + anchor.visible_len
    };

    if rel.before {
        base.checked_sub(rel.offset)
            .ok_or(MergeError::PositionOutOfRange {
                position: 0,
                length: tree.visible_len_for(perspective),
            })
    } else {
        Ok(base + rel.offset)
    }
}

/// Resolve one endpoint of an operation (absolute, relative, or omitted)
pub fn resolve_endpoint(
    tree: &MergeTree,
    pos: Option<usize>,
    rel: Option<&RelativePosition>,
    perspective: &Perspective,
    default: EndpointDefault,
) -> Result<usize> {
    match (pos, rel) {
        (Some(_), Some(_)) => Err(MergeError::MalformedOperation(
            "both absolute and relative position set".to_string(),
        )),
        (Some(pos), None) => Ok(pos),
        (None, Some(rel)) => resolve_relative(tree, rel, perspective),
        (None, None) => match default {
            EndpointDefault::Start => Ok(0),
            EndpointDefault::End => Ok(tree.visible_len_for(perspective)),
            EndpointDefault::Required => Err(MergeError::MalformedOperation(
                "missing required position".to_string(),
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_position_wire_shape() {
        let rel = RelativePosition {
            id: "a@3".to_string(),
            before: false,
            offset: 0,
        };
        assert_eq!(serde_json::to_string(&rel).unwrap(), r#"{"id":"a@3"}"#);

        let rel = RelativePosition {
            id: "a@3".to_string(),
            before: true,
            offset: 2,
        };
        assert_eq!(
            serde_json::to_string(&rel).unwrap(),
            r#"{"id":"a@3","before":true,"offset":2}"#
        );

        let parsed: RelativePosition = serde_json::from_str(r#"{"id":"x"}"#).unwrap();
        assert!(!parsed.before);
        assert_eq!(parsed.offset, 0);
    }

    #[test]
    fn test_perspective_current_sees_everything_sequenced() {
        let p = Perspective::current("a".to_string());
        assert_eq!(p.ref_seq, SeqNumber::MAX);
    }
}
