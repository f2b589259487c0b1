//! Merge Tree: balanced, ordered container of segments
//!
//! The tree is a B-tree (branching factor 8) whose leaves hold segments and
//! whose nodes cache a summary of their subtree: visible length, full length
//! including tombstones, the highest sequence number stamped anywhere below,
//! and whether any stamp is still unacknowledged. Summaries let position
//! walks under an older reference sequence number trust a whole subtree's
//! cached length whenever nothing in it changed after that reference point.
//!
//! Removal never deletes nodes. Covered segments are stamped as tombstones
//! and keep their tree slots (contributing 0 to visible length) until the
//! collaboration window floor passes their removal and [`MergeTree::prune`]
//! reclaims them. In-order traversal order is stable: concurrent inserts are
//! placed deterministically and never retroactively reordered.

use crate::error::{MergeError, Result};
use crate::mergetree::position::Perspective;
use crate::mergetree::properties::{apply_annotation, CombiningOp, PropertySet};
use crate::mergetree::segment::{RemovalStamp, Segment, SegmentContent};
use crate::{SegmentId, SeqNumber};
use std::collections::HashMap;

/// Maximum children per internal node and segments per leaf
const MAX_CHILDREN: usize = 8;

/// Cached aggregate of a subtree
#[derive(Debug, Clone, Default)]
struct Summary {
    /// Total length of non-tombstoned content below
    visible_len: usize,
    /// Total length including tombstones
    full_len: usize,
    /// Highest sequenced stamp (insertion or removal) below; 0 if none
    max_seq: SeqNumber,
    /// Whether any stamp below is not yet sequenced
    has_unacked: bool,
    /// Number of segments below, tombstones included
    segment_count: usize,
}

impl Summary {
    fn of_segment(seg: &Segment) -> Summary {
        let mut max_seq = seg.insertion.seq.unwrap_or(0);
        let mut has_unacked = seg.insertion.seq.is_none();
        if let Some(removal) = &seg.removal {
            match removal.seq {
                Some(seq) => max_seq = max_seq.max(seq),
                None => has_unacked = true,
            }
        }
        Summary {
            visible_len: if seg.removal.is_none() { seg.len() } else { 0 },
            full_len: seg.len(),
            max_seq,
            has_unacked,
            segment_count: 1,
        }
    }

    fn add(&mut self, other: &Summary) {
        self.visible_len += other.visible_len;
        self.full_len += other.full_len;
        self.max_seq = self.max_seq.max(other.max_seq);
        self.has_unacked |= other.has_unacked;
        self.segment_count += other.segment_count;
    }
}

#[derive(Debug, Clone)]
enum NodeKind {
    Leaf(Vec<Segment>),
    Internal(Vec<Node>),
}

#[derive(Debug, Clone)]
struct Node {
    summary: Summary,
    kind: NodeKind,
}

impl Node {
    fn leaf(segments: Vec<Segment>) -> Node {
        let mut node = Node {
            summary: Summary::default(),
            kind: NodeKind::Leaf(segments),
        };
        node.recompute();
        node
    }

    fn internal(children: Vec<Node>) -> Node {
        let mut node = Node {
            summary: Summary::default(),
            kind: NodeKind::Internal(children),
        };
        node.recompute();
        node
    }

    /// Rebuild this node's summary from its immediate children
    fn recompute(&mut self) {
        let mut summary = Summary::default();
        match &self.kind {
            NodeKind::Leaf(segments) => {
                for seg in segments {
                    summary.add(&Summary::of_segment(seg));
                }
            }
            NodeKind::Internal(children) => {
                for child in children {
                    summary.add(&child.summary);
                }
            }
        }
        self.summary = summary;
    }

    /// Visible length of this subtree as seen by `perspective`
    ///
    /// The cached summary is exact whenever the perspective is current, or
    /// when nothing below was stamped after the reference point.
    fn visible_len_for(&self, perspective: &Perspective) -> usize {
        let summary = &self.summary;
        if perspective.ref_seq == SeqNumber::MAX
            || (!summary.has_unacked && summary.max_seq <= perspective.ref_seq)
        {
            return summary.visible_len;
        }
        match &self.kind {
            NodeKind::Leaf(segments) => segments
                .iter()
                .map(|seg| seg.visible_len(perspective))
                .sum(),
            NodeKind::Internal(children) => children
                .iter()
                .map(|child| child.visible_len_for(perspective))
                .sum(),
        }
    }

    /// Split an overfull node in half, returning the right sibling
    fn split_if_overfull(&mut self) -> Option<Node> {
        match &mut self.kind {
            NodeKind::Leaf(segments) => {
                if segments.len() <= MAX_CHILDREN {
                    return None;
                }
                let right = segments.split_off(segments.len() / 2);
                self.recompute();
                Some(Node::leaf(right))
            }
            NodeKind::Internal(children) => {
                if children.len() <= MAX_CHILDREN {
                    return None;
                }
                let right = children.split_off(children.len() / 2);
                self.recompute();
                Some(Node::internal(right))
            }
        }
    }
}

/// Where the insert walk currently stands
#[derive(Debug, Clone, Copy)]
enum InsertPlace {
    /// Still consuming visible characters toward the slot
    Before(usize),
    /// At the slot boundary, moving right past not-yet-sequenced segments
    Sliding,
}

/// Outcome of one subtree's share of the insert walk
enum InsertStep {
    /// Inserted, with an overflow sibling to splice in if present
    Done(Option<Node>),
    /// The slot boundary extends past this subtree; carry the segment on
    Pending(Segment),
}

/// What a relative-position anchor resolves to
#[derive(Debug, Clone)]
pub(crate) struct AnchorInfo {
    /// Perspective-visible offset of the anchor's start
    pub start: usize,
    /// Perspective-visible length of the anchor (0 for markers/tombstones)
    pub visible_len: usize,
    /// Whether the anchor currently carries a removal stamp
    pub tombstoned: bool,
    /// Whether the anchor reattaches to a surviving neighbor when removed
    pub slides: bool,
}

/// Ordered forest of segments with aggregated per-subtree summaries
#[derive(Debug, Clone)]
pub struct MergeTree {
    root: Node,
}

impl Default for MergeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeTree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self {
            root: Node::leaf(Vec::new()),
        }
    }

    /// Current visible length (tombstones contribute nothing)
    pub fn visible_len(&self) -> usize {
        self.root.summary.visible_len
    }

    /// Visible length as seen by `perspective`
    pub fn visible_len_for(&self, perspective: &Perspective) -> usize {
        self.root.visible_len_for(perspective)
    }

    /// Number of segments currently held, tombstones included
    pub fn segment_count(&self) -> usize {
        self.root.summary.segment_count
    }

    /// Insert a segment at `pos` counted in `perspective`'s coordinates
    ///
    /// Within the resolved slot the segment lands after any adjacent
    /// segments that are not yet sequenced (they will carry a later sequence
    /// number than this insert) and before any sequenced segments the
    /// perspective could not see (they carry an earlier one). Later-sequenced
    /// concurrent inserts therefore sit further left, and since promotion
    /// never repositions, every replica converges on the same order.
    pub fn insert_segment(
        &mut self,
        pos: usize,
        perspective: &Perspective,
        segment: Segment,
    ) -> Result<()> {
        let total = self.root.visible_len_for(perspective);
        if pos > total {
            return Err(MergeError::PositionOutOfRange {
                position: pos,
                length: total,
            });
        }
        match Self::insert_rec(&mut self.root, InsertPlace::Before(pos), perspective, segment) {
            InsertStep::Done(Some(sibling)) => self.grow_root(sibling),
            InsertStep::Done(None) => {}
            InsertStep::Pending(segment) => {
                // The slot turned out to be the very end of the tree
                if let Some(sibling) = Self::append_rec(&mut self.root, segment) {
                    self.grow_root(sibling);
                }
            }
        }
        Ok(())
    }

    fn grow_root(&mut self, sibling: Node) {
        let old_root = std::mem::replace(&mut self.root, Node::leaf(Vec::new()));
        self.root = Node::internal(vec![old_root, sibling]);
    }

    fn insert_rec(
        node: &mut Node,
        place: InsertPlace,
        perspective: &Perspective,
        segment: Segment,
    ) -> InsertStep {
        match &mut node.kind {
            NodeKind::Leaf(segments) => {
                let mut i = 0;
                let mut slot = None;
                if let InsertPlace::Before(mut pos) = place {
                    while i < segments.len() {
                        if pos == 0 {
                            break;
                        }
                        let vis = segments[i].visible_len(perspective);
                        if vis > pos {
                            // Insertion point is inside this run: split first
                            let right = segments[i].split_at(pos);
                            segments.insert(i + 1, right);
                            slot = Some(i + 1);
                            break;
                        }
                        pos -= vis;
                        i += 1;
                    }
                }
                if slot.is_none() {
                    // At a slot boundary: anything unacked here will be
                    // sequenced after this insert, so slide right past it.
                    while i < segments.len()
                        && segments[i].insertion.seq.is_none()
                        && !segments[i].insert_visible_to(perspective)
                    {
                        i += 1;
                    }
                    if i < segments.len() {
                        slot = Some(i);
                    }
                }
                match slot {
                    Some(idx) => segments.insert(idx, segment),
                    // The slide may continue into the next leaf
                    None => return InsertStep::Pending(segment),
                }
            }
            NodeKind::Internal(children) => {
                let mut place = place;
                let mut segment = segment;
                let mut idx = 0;
                loop {
                    if idx == children.len() {
                        // Slot boundary runs past this subtree
                        return InsertStep::Pending(segment);
                    }
                    if let InsertPlace::Before(pos) = place {
                        let vis = children[idx].visible_len_for(perspective);
                        if pos > vis {
                            place = InsertPlace::Before(pos - vis);
                            idx += 1;
                            continue;
                        }
                    }
                    match Self::insert_rec(&mut children[idx], place, perspective, segment) {
                        InsertStep::Done(sibling) => {
                            if let Some(sibling) = sibling {
                                children.insert(idx + 1, sibling);
                            }
                            break;
                        }
                        InsertStep::Pending(carried) => {
                            segment = carried;
                            place = InsertPlace::Sliding;
                            idx += 1;
                        }
                    }
                }
            }
        }
        node.recompute();
        InsertStep::Done(node.split_if_overfull())
    }

    fn append_rec(node: &mut Node, segment: Segment) -> Option<Node> {
        match &mut node.kind {
            NodeKind::Leaf(segments) => segments.push(segment),
            NodeKind::Internal(children) => {
                let last = children.len() - 1;
                if let Some(sibling) = Self::append_rec(&mut children[last], segment) {
                    children.push(sibling);
                }
            }
        }
        node.recompute();
        node.split_if_overfull()
    }

    /// Stamp every segment covered by `[start, end)` as tombstoned
    ///
    /// Partially covered runs are split first so the removal stamp applies
    /// only to the covered sub-segment. Re-removal of an already-tombstoned
    /// segment is a no-op that keeps the earlier stamp. When `captured` is
    /// given, the visible text of newly tombstoned runs is appended to it.
    pub fn remove_range(
        &mut self,
        start: usize,
        end: usize,
        perspective: &Perspective,
        stamp: RemovalStamp,
        mut captured: Option<&mut String>,
    ) -> Result<()> {
        self.check_range(start, end, perspective)?;
        self.walk_range_mut(start, end, perspective, &mut |seg| {
            if seg.removal.is_none() {
                if let (Some(buffer), SegmentContent::Text(text)) =
                    (captured.as_deref_mut(), &seg.content)
                {
                    buffer.push_str(text);
                }
                seg.removal = Some(stamp.clone());
            }
            Ok(())
        })
    }

    /// Apply an annotation to every segment covered by `[start, end)`
    ///
    /// May fail partway through (non-numeric combining); callers that need
    /// atomicity run this against a scratch clone and commit on success.
    pub fn annotate_range(
        &mut self,
        start: usize,
        end: usize,
        perspective: &Perspective,
        props: &PropertySet,
        combining: Option<&CombiningOp>,
    ) -> Result<()> {
        self.check_range(start, end, perspective)?;
        self.walk_range_mut(start, end, perspective, &mut |seg| {
            apply_annotation(&mut seg.properties, props, combining)
        })
    }

    fn check_range(&self, start: usize, end: usize, perspective: &Perspective) -> Result<()> {
        if start > end {
            return Err(MergeError::MalformedOperation(format!(
                "inverted range {start}..{end}"
            )));
        }
        let total = self.root.visible_len_for(perspective);
        if end > total {
            return Err(MergeError::PositionOutOfRange {
                position: end,
                length: total,
            });
        }
        Ok(())
    }

    fn walk_range_mut(
        &mut self,
        start: usize,
        end: usize,
        perspective: &Perspective,
        visit: &mut dyn FnMut(&mut Segment) -> Result<()>,
    ) -> Result<()> {
        if let Some(sibling) =
            Self::range_rec(&mut self.root, start, end, perspective, visit)?
        {
            let old_root = std::mem::replace(&mut self.root, Node::leaf(Vec::new()));
            self.root = Node::internal(vec![old_root, sibling]);
        }
        Ok(())
    }

    fn range_rec(
        node: &mut Node,
        start: usize,
        end: usize,
        perspective: &Perspective,
        visit: &mut dyn FnMut(&mut Segment) -> Result<()>,
    ) -> Result<Option<Node>> {
        match &mut node.kind {
            NodeKind::Leaf(segments) => {
                let mut off = 0;
                let mut i = 0;
                while i < segments.len() {
                    if off >= end {
                        break;
                    }
                    if segments[i].content.is_marker() {
                        // Markers occupy no characters but are covered when
                        // their boundary position falls inside the range.
                        if segments[i].marker_visible_to(perspective) && off >= start {
                            visit(&mut segments[i])?;
                        }
                        i += 1;
                        continue;
                    }
                    let vis = segments[i].visible_len(perspective);
                    if vis == 0 || off + vis <= start {
                        off += vis;
                        i += 1;
                        continue;
                    }
                    let cover_start = start.saturating_sub(off);
                    let cover_end = (end - off).min(vis);
                    if cover_start > 0 {
                        let right = segments[i].split_at(cover_start);
                        segments.insert(i + 1, right);
                        off += cover_start;
                        i += 1;
                        continue; // revisit the covered right part
                    }
                    if cover_end < vis {
                        let right = segments[i].split_at(cover_end);
                        segments.insert(i + 1, right);
                    }
                    visit(&mut segments[i])?;
                    off += cover_end;
                    i += 1;
                }
            }
            NodeKind::Internal(children) => {
                let mut off = 0;
                let mut pending = Vec::new();
                for idx in 0..children.len() {
                    if off >= end {
                        break;
                    }
                    let vis = children[idx].visible_len_for(perspective);
                    // Descend when the child overlaps the range; equality at
                    // the start boundary matters for zero-width markers.
                    if off + vis >= start {
                        let child_start = start.saturating_sub(off);
                        let child_end = end - off;
                        if let Some(sibling) = Self::range_rec(
                            &mut children[idx],
                            child_start,
                            child_end,
                            perspective,
                            visit,
                        )? {
                            pending.push((idx + 1, sibling));
                        }
                    }
                    off += vis;
                }
                for (idx, sibling) in pending.into_iter().rev() {
                    children.insert(idx, sibling);
                }
            }
        }
        node.recompute();
        Ok(node.split_if_overfull())
    }

    /// Segment containing visible position `pos`, with the offset inside it
    pub fn segment_at(
        &self,
        pos: usize,
        perspective: &Perspective,
    ) -> Result<(&Segment, usize)> {
        let total = self.root.visible_len_for(perspective);
        if pos >= total {
            return Err(MergeError::PositionOutOfRange {
                position: pos,
                length: total,
            });
        }
        let mut node = &self.root;
        let mut pos = pos;
        loop {
            match &node.kind {
                NodeKind::Leaf(segments) => {
                    for seg in segments {
                        let vis = seg.visible_len(perspective);
                        if pos < vis {
                            return Ok((seg, pos));
                        }
                        pos -= vis;
                    }
                    unreachable!("position inside subtree bounds");
                }
                NodeKind::Internal(children) => {
                    let mut next = None;
                    for child in children {
                        let vis = child.visible_len_for(perspective);
                        if pos < vis {
                            next = Some(child);
                            break;
                        }
                        pos -= vis;
                    }
                    node = next.unwrap_or_else(|| unreachable!("position inside subtree bounds"));
                }
            }
        }
    }

    /// Find the anchor segment with the given id
    ///
    /// Linear in the number of segments; anchors are looked up once per
    /// relative-position operation against a window-bounded tree.
    pub(crate) fn locate_anchor(
        &self,
        id: &str,
        perspective: &Perspective,
    ) -> Option<AnchorInfo> {
        fn rec(
            node: &Node,
            id: &str,
            perspective: &Perspective,
            off: &mut usize,
        ) -> Option<AnchorInfo> {
            match &node.kind {
                NodeKind::Leaf(segments) => {
                    for seg in segments {
                        if seg.id.as_deref() == Some(id) {
                            return Some(AnchorInfo {
                                start: *off,
                                visible_len: seg.visible_len(perspective),
                                tombstoned: seg.is_tombstone(),
                                slides: seg.slides_on_remove(),
                            });
                        }
                        *off += seg.visible_len(perspective);
                    }
                    None
                }
                NodeKind::Internal(children) => {
                    for child in children {
                        if let Some(info) = rec(child, id, perspective, off) {
                            return Some(info);
                        }
                    }
                    None
                }
            }
        }
        let mut off = 0;
        rec(&self.root, id, perspective, &mut off)
    }

    /// Promote unacknowledged stamps in `local_seqs` to global sequence `seq`
    ///
    /// Used when the replica's own operation comes back sequenced: the
    /// optimistic state becomes the confirmed state without re-application.
    /// `ids` maps each insert's local sequence number to the anchor id every
    /// replica derives for it; the first (leftmost) part of a split insert
    /// receives the id.
    pub fn promote(
        &mut self,
        local_seqs: std::ops::RangeInclusive<u64>,
        seq: SeqNumber,
        ids: &mut HashMap<u64, SegmentId>,
    ) {
        fn rec(
            node: &mut Node,
            local_seqs: &std::ops::RangeInclusive<u64>,
            seq: SeqNumber,
            ids: &mut HashMap<u64, SegmentId>,
        ) {
            match &mut node.kind {
                NodeKind::Leaf(segments) => {
                    for seg in segments {
                        if seg.insertion.seq.is_none()
                            && local_seqs.contains(&seg.insertion.local_seq)
                        {
                            seg.insertion.seq = Some(seq);
                            if seg.id.is_none() {
                                if let Some(id) = ids.remove(&seg.insertion.local_seq) {
                                    seg.id = Some(id);
                                }
                            }
                        }
                        if let Some(removal) = &mut seg.removal {
                            if removal.seq.is_none() && local_seqs.contains(&removal.local_seq) {
                                removal.seq = Some(seq);
                            }
                        }
                    }
                }
                NodeKind::Internal(children) => {
                    for child in children {
                        rec(child, local_seqs, seq, ids);
                    }
                }
            }
            node.recompute();
        }
        rec(&mut self.root, &local_seqs, seq, ids);
    }

    /// Physically prune tombstones whose removal is at or below `floor`
    ///
    /// Also coalesces adjacent surviving parts of the same sequenced insert.
    /// Pruning never changes visible content, only reclaims tombstone
    /// storage. Returns the number of segments pruned.
    pub fn prune(&mut self, floor: SeqNumber) -> usize {
        fn rec(node: &mut Node, floor: SeqNumber) -> usize {
            let mut pruned = 0;
            match &mut node.kind {
                NodeKind::Leaf(segments) => {
                    segments.retain(|seg| {
                        let expired = matches!(
                            &seg.removal,
                            Some(removal) if matches!(removal.seq, Some(seq) if seq <= floor)
                        );
                        if expired {
                            pruned += 1;
                        }
                        !expired
                    });
                    let mut i = 0;
                    while i + 1 < segments.len() {
                        if segments[i].can_coalesce(&segments[i + 1]) {
                            let right = segments.remove(i + 1);
                            segments[i].coalesce(right);
                        } else {
                            i += 1;
                        }
                    }
                }
                NodeKind::Internal(children) => {
                    for child in children.iter_mut() {
                        pruned += rec(child, floor);
                    }
                    children.retain(|child| child.summary.segment_count > 0);
                }
            }
            node.recompute();
            pruned
        }
        let pruned = rec(&mut self.root, floor);
        // Collapse trivial internal chains left behind by emptied children
        loop {
            match &mut self.root.kind {
                NodeKind::Internal(children) if children.len() == 1 => {
                    let child = children.pop().unwrap_or_else(|| unreachable!());
                    self.root = child;
                }
                NodeKind::Internal(children) if children.is_empty() => {
                    self.root = Node::leaf(Vec::new());
                    break;
                }
                _ => break,
            }
        }
        pruned
    }

    /// Visit every segment in order, tombstones included
    pub fn for_each_segment(&self, f: &mut dyn FnMut(&Segment)) {
        fn rec(node: &Node, f: &mut dyn FnMut(&Segment)) {
            match &node.kind {
                NodeKind::Leaf(segments) => {
                    for seg in segments {
                        f(seg);
                    }
                }
                NodeKind::Internal(children) => {
                    for child in children {
                        rec(child, f);
                    }
                }
            }
        }
        rec(&self.root, f);
    }

    /// Append a segment at the visible end (used when loading snapshots)
    pub fn append(&mut self, segment: Segment) -> Result<()> {
        let perspective = Perspective::current(segment.insertion.client.clone());
        self.insert_segment(self.visible_len(), &perspective, segment)
    }

    /// Concatenated visible text (markers contribute nothing)
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.for_each_segment(&mut |seg| {
            if seg.removal.is_none() {
                if let SegmentContent::Text(text) = &seg.content {
                    out.push_str(text);
                }
            }
        });
        out
    }

    /// Verify cached summaries against the segments (test support)
    ///
    /// An inconsistent aggregate is a fatal invariant violation, never to be
    /// silently tolerated.
    #[doc(hidden)]
    pub fn assert_consistent(&self) {
        fn rec(node: &Node) -> (usize, usize, usize) {
            let (mut vis, mut full, mut count) = (0, 0, 0);
            match &node.kind {
                NodeKind::Leaf(segments) => {
                    for seg in segments {
                        if seg.removal.is_none() {
                            vis += seg.len();
                        }
                        full += seg.len();
                        count += 1;
                    }
                }
                NodeKind::Internal(children) => {
                    for child in children {
                        let (v, f, c) = rec(child);
                        vis += v;
                        full += f;
                        count += c;
                    }
                }
            }
            assert_eq!(node.summary.visible_len, vis, "visible length summary drift");
            assert_eq!(node.summary.full_len, full, "full length summary drift");
            assert_eq!(node.summary.segment_count, count, "segment count drift");
            (vis, full, count)
        }
        rec(&self.root);
    }
}
