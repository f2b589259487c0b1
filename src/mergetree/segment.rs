//! Segment Store: the atomic units of the collaborative sequence
//!
//! A segment is either a text run or a zero-length structural marker. Segments
//! carry lifecycle stamps: an insertion stamp identifying when and by whom
//! they were created, and an optional removal stamp that turns them into
//! tombstones. Tombstones stay in the tree (contributing nothing to visible
//! length) until the collaboration window allows them to be pruned, because
//! concurrent in-flight operations may still resolve positions through them.

use crate::mergetree::position::Perspective;
use crate::mergetree::properties::PropertyMap;
use crate::{ClientId, SegmentId, SeqNumber};
use serde::{Deserialize, Serialize};

/// Structural behavior flags of a marker
///
/// The flag values are the historical wire constants: tiles are addressable
/// anchors, nest begin/end delimit nested regions, range begin/end mark
/// interval endpoints, and `SLIDE_ON_REMOVE` makes a removed marker reattach
/// to an adjacent surviving segment instead of vanishing as an anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceType(pub u32);

impl ReferenceType {
    pub const SIMPLE: ReferenceType = ReferenceType(0x0);
    pub const TILE: ReferenceType = ReferenceType(0x1);
    pub const NEST_BEGIN: ReferenceType = ReferenceType(0x2);
    pub const NEST_END: ReferenceType = ReferenceType(0x4);
    pub const RANGE_BEGIN: ReferenceType = ReferenceType(0x10);
    pub const RANGE_END: ReferenceType = ReferenceType(0x20);
    pub const SLIDE_ON_REMOVE: ReferenceType = ReferenceType(0x40);

    /// Check whether all bits of `flag` are set
    pub fn contains(self, flag: ReferenceType) -> bool {
        self.0 & flag.0 == flag.0 && flag.0 != 0
    }
}

impl std::ops::BitOr for ReferenceType {
    type Output = ReferenceType;

    fn bitor(self, rhs: ReferenceType) -> ReferenceType {
        ReferenceType(self.0 | rhs.0)
    }
}

/// Interval classification used by range endpoint markers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalType {
    Simple = 0x0,
    Nest = 0x1,
    SlideOnRemove = 0x2,
}

impl TryFrom<u32> for IntervalType {
    type Error = u32;

    fn try_from(value: u32) -> std::result::Result<Self, u32> {
        match value {
            0x0 => Ok(IntervalType::Simple),
            0x1 => Ok(IntervalType::Nest),
            0x2 => Ok(IntervalType::SlideOnRemove),
            other => Err(other),
        }
    }
}

/// Content of a segment: a text run or a structural marker
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentContent {
    /// Ordered run of characters
    Text(String),
    /// Zero-length structural anchor
    Marker(ReferenceType),
}

impl SegmentContent {
    /// Character length of this content (0 for markers)
    pub fn len(&self) -> usize {
        match self {
            SegmentContent::Text(text) => text.chars().count(),
            SegmentContent::Marker(_) => 0,
        }
    }

    /// Whether this content is a marker
    pub fn is_marker(&self) -> bool {
        matches!(self, SegmentContent::Marker(_))
    }
}

/// Identifies when and by whom a segment was created
///
/// `seq` is assigned by the delivery pipeline and is the total-order key; it
/// is `None` while the insert is optimistic (submitted locally but not yet
/// acknowledged). `local_seq` disambiguates a client's own unacknowledged
/// operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertionStamp {
    pub client: ClientId,
    pub seq: Option<SeqNumber>,
    pub local_seq: u64,
}

/// Present once a remove has been applied; the segment becomes a tombstone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalStamp {
    pub client: ClientId,
    pub seq: Option<SeqNumber>,
    pub local_seq: u64,
}

/// Smallest mutable unit of the sequence
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Stable anchor identifier, assigned when the insert is sequenced
    /// (or earlier, from an explicit `"id"` property). Split parts keep the
    /// id on the leftmost part only.
    pub id: Option<SegmentId>,

    /// Text run or marker
    pub content: SegmentContent,

    /// Resolved annotation state
    pub properties: PropertyMap,

    /// Creation stamp
    pub insertion: InsertionStamp,

    /// Removal stamp; present means this segment is a tombstone
    pub removal: Option<RemovalStamp>,
}

impl Segment {
    /// Create a text run segment
    pub fn text(text: impl Into<String>, insertion: InsertionStamp) -> Self {
        Self {
            id: None,
            content: SegmentContent::Text(text.into()),
            properties: PropertyMap::new(),
            insertion,
            removal: None,
        }
    }

    /// Create a marker segment
    pub fn marker(ref_type: ReferenceType, insertion: InsertionStamp) -> Self {
        Self {
            id: None,
            content: SegmentContent::Marker(ref_type),
            properties: PropertyMap::new(),
            insertion,
            removal: None,
        }
    }

    /// Full character length, ignoring tombstone state
    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// Whether this segment holds no content (never true for markers)
    pub fn is_empty(&self) -> bool {
        !self.content.is_marker() && self.len() == 0
    }

    /// Whether this segment has been removed
    pub fn is_tombstone(&self) -> bool {
        self.removal.is_some()
    }

    /// Structural flags (SIMPLE for text runs)
    pub fn reference_type(&self) -> ReferenceType {
        match self.content {
            SegmentContent::Text(_) => ReferenceType::SIMPLE,
            SegmentContent::Marker(flags) => flags,
        }
    }

    /// Whether a removed anchor slides to a surviving neighbor
    pub fn slides_on_remove(&self) -> bool {
        self.reference_type().contains(ReferenceType::SLIDE_ON_REMOVE)
    }

    /// Whether the insertion of this segment is visible to `perspective`
    ///
    /// A client always sees its own not-yet-acknowledged edits; everything
    /// else must have been sequenced at or before the reference point.
    pub fn insert_visible_to(&self, perspective: &Perspective) -> bool {
        self.insertion.client == perspective.client
            || matches!(self.insertion.seq, Some(seq) if seq <= perspective.ref_seq)
    }

    /// Whether the removal of this segment (if any) is visible to `perspective`
    pub fn removed_for(&self, perspective: &Perspective) -> bool {
        match &self.removal {
            None => false,
            Some(removal) => {
                removal.client == perspective.client
                    || matches!(removal.seq, Some(seq) if seq <= perspective.ref_seq)
            }
        }
    }

    /// Character length contributed to the sequence seen by `perspective`
    pub fn visible_len(&self, perspective: &Perspective) -> usize {
        if self.insert_visible_to(perspective) && !self.removed_for(perspective) {
            self.len()
        } else {
            0
        }
    }

    /// Whether this marker sits visibly in the sequence seen by `perspective`
    ///
    /// Used by range walks, where zero-length markers never accumulate
    /// character counts but are still covered by a range.
    pub fn marker_visible_to(&self, perspective: &Perspective) -> bool {
        self.content.is_marker()
            && self.insert_visible_to(perspective)
            && !self.removed_for(perspective)
    }

    /// Split this segment at a character offset, returning the right part
    ///
    /// Both parts share the insertion and removal stamps and the properties;
    /// the id stays on the left part. Offset must be strictly inside the run.
    pub fn split_at(&mut self, offset: usize) -> Segment {
        debug_assert!(offset > 0 && offset < self.len(), "split offset inside run");
        let SegmentContent::Text(text) = &mut self.content else {
            unreachable!("markers are never split");
        };
        let byte = text
            .char_indices()
            .nth(offset)
            .map(|(byte, _)| byte)
            .unwrap_or(text.len());
        let right_text = text.split_off(byte);
        Segment {
            id: None,
            content: SegmentContent::Text(right_text),
            properties: self.properties.clone(),
            insertion: self.insertion.clone(),
            removal: self.removal.clone(),
        }
    }

    /// Whether `other` can be merged into this segment during compaction
    ///
    /// Only adjacent parts of the same sequenced insert, with identical
    /// lifecycle and annotation state, coalesce. The right part must not be
    /// an anchor in its own right.
    pub fn can_coalesce(&self, other: &Segment) -> bool {
        matches!(
            (&self.content, &other.content),
            (SegmentContent::Text(_), SegmentContent::Text(_))
        ) && other.id.is_none()
            && self.insertion == other.insertion
            && self.insertion.seq.is_some()
            && self.removal.is_none()
            && other.removal.is_none()
            && self.properties == other.properties
    }

    /// Merge `other` into this segment; caller must check `can_coalesce`
    pub fn coalesce(&mut self, other: Segment) {
        debug_assert!(self.can_coalesce(&other));
        if let (SegmentContent::Text(left), SegmentContent::Text(right)) =
            (&mut self.content, other.content)
        {
            left.push_str(&right);
        }
    }
}
