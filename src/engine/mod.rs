//! Reconciliation Engine: applying operations in globally agreed order
//!
//! A [`Replica`] owns one document's merge tree and consumes the sequenced
//! operation stream for it. Operations arrive tagged with a monotonically
//! increasing global sequence number and the submitter's reference sequence
//! number; each is resolved under the submitter's perspective and applied
//! exactly once, in order, by a single writer.
//!
//! The replica's own operations take a second path: they are applied
//! optimistically at submit time with unacknowledged stamps, and when the
//! sequenced echo arrives the pending stamps are promoted to the assigned
//! global sequence number instead of being re-applied. Optimistic and
//! confirmed states therefore coincide by construction.
//!
//! The engine also tracks the collaboration window: the highest sequence
//! number each known client has acknowledged. The minimum across clients is
//! the window floor, below which no in-flight operation can still reference
//! a tombstone, making it safe for [`Replica::collect_garbage`] to prune.

use crate::error::{MergeError, Result};
use crate::mergetree::position::{resolve_endpoint, EndpointDefault, Perspective};
use crate::mergetree::segment::{InsertionStamp, RemovalStamp, Segment};
use crate::mergetree::tree::MergeTree;
use crate::protocol::chunk::MergeTreeChunk;
use crate::protocol::ops::{insert_properties, InsertContent, Operation};
use crate::{ClientId, SegmentId, SeqNumber};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// An operation stamped by the sequencing channel
///
/// The channel delivers these to every replica of a document, including the
/// submitter, in identical order with strictly increasing sequence numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedOp {
    /// Global total-order position assigned by the channel
    #[serde(rename = "sequenceNumber")]
    pub seq: SeqNumber,

    /// Submitting client
    #[serde(rename = "clientId")]
    pub client: ClientId,

    /// Sequence number the submitter had last observed
    #[serde(rename = "referenceSequenceNumber")]
    pub ref_seq: SeqNumber,

    /// The operation itself
    #[serde(rename = "contents")]
    pub op: Operation,
}

impl SequencedOp {
    pub fn new(seq: SeqNumber, client: impl Into<ClientId>, ref_seq: SeqNumber, op: Operation) -> Self {
        Self {
            seq,
            client: client.into(),
            ref_seq,
            op,
        }
    }
}

/// Bookkeeping for one locally submitted, not yet acknowledged operation
#[derive(Debug, Clone)]
struct PendingOp {
    /// Local sequence numbers stamped by this op, if it stamped any
    stamp_range: Option<(u64, u64)>,
    /// Local sequence numbers of its inserts, in listed order
    insert_local_seqs: Vec<u64>,
}

/// Mutable context threaded through one operation application
struct ApplyCtx {
    client: ClientId,
    /// Global seq for sequenced application; `None` for optimistic local
    seq: Option<SeqNumber>,
    next_local_seq: u64,
    insert_ordinal: usize,
    insert_local_seqs: Vec<u64>,
    /// Register captures gathered during a local remove
    captures: Vec<(String, String)>,
    capture_registers: bool,
}

impl ApplyCtx {
    fn alloc_local_seq(&mut self) -> u64 {
        let n = self.next_local_seq;
        self.next_local_seq += 1;
        n
    }

    /// Derived anchor id for the next insert, when already sequenced
    fn derive_insert_id(&mut self) -> Option<SegmentId> {
        let ordinal = self.insert_ordinal;
        self.insert_ordinal += 1;
        self.seq
            .map(|seq| derive_segment_id(&self.client, seq, ordinal))
    }
}

/// The anchor id every replica derives for a sequenced insert
///
/// The nth insert inside one sequenced operation (groups contain several)
/// gets a `.n` suffix; the first gets none.
fn derive_segment_id(client: &str, seq: SeqNumber, ordinal: usize) -> SegmentId {
    if ordinal == 0 {
        format!("{client}@{seq}")
    } else {
        format!("{client}@{seq}.{ordinal}")
    }
}

/// One document replica: the tree plus reconciliation state
#[derive(Debug, Clone)]
pub struct Replica {
    client: ClientId,
    session: Uuid,
    tree: MergeTree,
    last_applied_seq: SeqNumber,
    /// Highest sequence number each known client has acknowledged
    acks: HashMap<ClientId, SeqNumber>,
    /// Outbound local operations awaiting their sequenced echo, oldest first
    pending: VecDeque<PendingOp>,
    next_local_seq: u64,
    /// Client-local cut/paste buffers; never shared across replicas
    registers: HashMap<String, String>,
}

impl Replica {
    /// Fresh, empty replica for `client`
    pub fn new(client: ClientId) -> Self {
        Self {
            client,
            session: Uuid::new_v4(),
            tree: MergeTree::new(),
            last_applied_seq: 0,
            acks: HashMap::new(),
            pending: VecDeque::new(),
            next_local_seq: 0,
            registers: HashMap::new(),
        }
    }

    /// Bootstrap a replica from a chunk snapshot
    ///
    /// The replica starts at the chunk's sequence number and expects the
    /// sequenced stream to resume right after it.
    pub fn from_chunk(client: ClientId, chunk: &MergeTreeChunk) -> Result<Self> {
        let tree = chunk.build_tree()?;
        Ok(Self {
            client,
            session: Uuid::new_v4(),
            tree,
            last_applied_seq: chunk.chunk_sequence_number,
            acks: HashMap::new(),
            pending: VecDeque::new(),
            next_local_seq: 0,
            registers: HashMap::new(),
        })
    }

    /// Apply the next operation from the sequenced stream
    ///
    /// Sequence numbers must be strictly increasing by one. A rejected
    /// operation still consumes its sequence number (every replica rejects
    /// it identically) and never mutates the tree.
    pub fn apply(&mut self, msg: &SequencedOp) -> Result<()> {
        let expected = self.last_applied_seq + 1;
        if msg.seq != expected {
            return Err(MergeError::OutOfOrderSequence {
                expected,
                got: msg.seq,
            });
        }
        self.last_applied_seq = msg.seq;
        // Submitting an op at ref_seq acknowledges everything up to it
        self.observe_ack(msg.client.clone(), msg.ref_seq);

        if msg.client == self.client {
            if let Some(pending) = self.pending.pop_front() {
                self.promote_pending(pending, msg.seq);
                return Ok(());
            }
            // No optimistic state for our own op (e.g. replica rebuilt from
            // a chunk after submitting): fall through and apply it fresh.
        }

        let perspective = Perspective::new(msg.ref_seq, msg.client.clone());
        let result = self.apply_sequenced(&msg.op, &perspective, msg.seq);
        match &result {
            Ok(()) => trace!(
                session = %self.session,
                seq = msg.seq,
                client = %msg.client,
                "applied sequenced operation"
            ),
            Err(err) => warn!(
                session = %self.session,
                seq = msg.seq,
                client = %msg.client,
                %err,
                "rejected sequenced operation"
            ),
        }
        result
    }

    /// Confirm the oldest outbound op: promote its stamps to `seq`
    fn promote_pending(&mut self, pending: PendingOp, seq: SeqNumber) {
        let mut ids = HashMap::new();
        for (ordinal, local_seq) in pending.insert_local_seqs.iter().enumerate() {
            ids.insert(*local_seq, derive_segment_id(&self.client, seq, ordinal));
        }
        if let Some((first, last)) = pending.stamp_range {
            self.tree.promote(first..=last, seq, &mut ids);
        }
        debug!(
            session = %self.session,
            seq,
            outstanding = self.pending.len(),
            "own operation acknowledged"
        );
    }

    fn apply_sequenced(
        &mut self,
        op: &Operation,
        perspective: &Perspective,
        seq: SeqNumber,
    ) -> Result<()> {
        let mut ctx = ApplyCtx {
            client: perspective.client.clone(),
            seq: Some(seq),
            next_local_seq: 0,
            insert_ordinal: 0,
            insert_local_seqs: Vec::new(),
            captures: Vec::new(),
            // Registers are client-local; a remote remove captures into the
            // remote client's buffer, not ours.
            capture_registers: false,
        };
        match op {
            // Inserts and removes fail only before their first mutation, so
            // they run directly against the tree.
            Operation::Insert { .. } | Operation::Remove { .. } => {
                exec(&mut self.tree, op, perspective, &mut ctx)
            }
            // Annotates and groups can fail partway through; run against a
            // scratch clone and commit only on full success.
            Operation::Annotate { .. } | Operation::Group { .. } => {
                let mut scratch = self.tree.clone();
                exec(&mut scratch, op, perspective, &mut ctx)?;
                self.tree = scratch;
                Ok(())
            }
        }
    }

    /// Apply a local operation optimistically and return the wire form
    ///
    /// Register indirection is expanded before anything leaves the replica:
    /// `Insert{register}` becomes a literal text insert, and a remove with a
    /// register captures the removed text into the named local buffer. The
    /// returned operation goes to the sequencing channel with
    /// [`Replica::last_applied_seq`] as its reference sequence number.
    pub fn submit_local(&mut self, op: Operation) -> Result<Operation> {
        let op = self.expand_registers(op)?;
        let perspective = Perspective::current(self.client.clone());
        let first = self.next_local_seq;
        let mut ctx = ApplyCtx {
            client: self.client.clone(),
            seq: None,
            next_local_seq: first,
            insert_ordinal: 0,
            insert_local_seqs: Vec::new(),
            captures: Vec::new(),
            capture_registers: true,
        };
        let mut scratch = self.tree.clone();
        exec(&mut scratch, &op, &perspective, &mut ctx)?;
        self.tree = scratch;

        let stamp_range = (ctx.next_local_seq > first).then(|| (first, ctx.next_local_seq - 1));
        self.pending.push_back(PendingOp {
            stamp_range,
            insert_local_seqs: ctx.insert_local_seqs,
        });
        self.next_local_seq = ctx.next_local_seq;
        for (name, text) in ctx.captures {
            self.registers.insert(name, text);
        }
        debug!(
            session = %self.session,
            outstanding = self.pending.len(),
            "submitted local operation"
        );
        Ok(op)
    }

    /// Rewrite register-sourced inserts to literal text
    fn expand_registers(&self, op: Operation) -> Result<Operation> {
        match op {
            Operation::Insert {
                pos1,
                relative_pos1,
                pos2,
                relative_pos2,
                content: InsertContent::Register(name),
                props,
            } => {
                let text = self
                    .registers
                    .get(&name)
                    .ok_or(MergeError::UnknownRegister(name))?;
                Ok(Operation::Insert {
                    pos1,
                    relative_pos1,
                    pos2,
                    relative_pos2,
                    content: InsertContent::Text(text.clone()),
                    props,
                })
            }
            Operation::Group { ops } => {
                let ops = ops
                    .into_iter()
                    .map(|member| self.expand_registers(member))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Operation::Group { ops })
            }
            other => Ok(other),
        }
    }

    /// Record that `client` has acknowledged everything up to `seq`
    pub fn observe_ack(&mut self, client: ClientId, seq: SeqNumber) {
        let entry = self.acks.entry(client).or_insert(0);
        *entry = (*entry).max(seq);
    }

    /// Start tracking a client in the collaboration window
    pub fn add_client(&mut self, client: ClientId) {
        self.acks.entry(client).or_insert(0);
    }

    /// Stop tracking a departed client (its acks no longer hold the floor)
    pub fn remove_client(&mut self, client: &str) {
        self.acks.remove(client);
    }

    /// Minimum acknowledged sequence number across all tracked clients
    pub fn window_floor(&self) -> SeqNumber {
        self.acks
            .values()
            .copied()
            .min()
            .unwrap_or(self.last_applied_seq)
            .min(self.last_applied_seq)
    }

    /// Prune tombstones no in-flight operation can still reference
    ///
    /// Returns the number of segments reclaimed. Never changes visible
    /// content. Anchor ids held by pruned segments stop resolving.
    pub fn collect_garbage(&mut self) -> usize {
        let floor = self.window_floor();
        let pruned = self.tree.prune(floor);
        debug!(session = %self.session, floor, pruned, "collected tombstones");
        pruned
    }

    /// Snapshot the current visible content as a chunk
    pub fn snapshot(&self) -> MergeTreeChunk {
        MergeTreeChunk::snapshot(&self.tree, self.last_applied_seq)
    }

    /// Current visible text
    pub fn text(&self) -> String {
        self.tree.text()
    }

    /// Current visible length in characters
    pub fn visible_len(&self) -> usize {
        self.tree.visible_len()
    }

    /// Owning client id
    pub fn client(&self) -> &str {
        &self.client
    }

    /// Random id of this replica session, used in log fields
    pub fn session_id(&self) -> Uuid {
        self.session
    }

    /// Highest sequence number applied so far
    pub fn last_applied_seq(&self) -> SeqNumber {
        self.last_applied_seq
    }

    /// Whether local operations are still awaiting their sequenced echo
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Contents of a named cut/paste buffer
    pub fn register(&self, name: &str) -> Option<&str> {
        self.registers.get(name).map(String::as_str)
    }

    /// Read access to the underlying tree
    pub fn tree(&self) -> &MergeTree {
        &self.tree
    }
}

/// Apply one operation (recursively for groups) against a tree
fn exec(
    tree: &mut MergeTree,
    op: &Operation,
    perspective: &Perspective,
    ctx: &mut ApplyCtx,
) -> Result<()> {
    match op {
        Operation::Insert {
            pos1,
            relative_pos1,
            content,
            props,
            ..
        } => {
            let pos = resolve_endpoint(
                tree,
                *pos1,
                relative_pos1.as_ref(),
                perspective,
                EndpointDefault::End,
            )?;
            let (explicit_id, properties) = insert_properties(props.as_ref())?;
            let local_seq = ctx.alloc_local_seq();
            ctx.insert_local_seqs.push(local_seq);
            let derived_id = ctx.derive_insert_id();
            let stamp = InsertionStamp {
                client: ctx.client.clone(),
                seq: ctx.seq,
                local_seq,
            };
            let mut segment = match content {
                InsertContent::Text(text) => {
                    if text.is_empty() {
                        return Err(MergeError::MalformedOperation(
                            "empty text insert".to_string(),
                        ));
                    }
                    Segment::text(text.clone(), stamp)
                }
                InsertContent::Marker(def) => Segment::marker(def.flags(), stamp),
                InsertContent::Register(_) => {
                    return Err(MergeError::MalformedOperation(
                        "register insert reached application unexpanded".to_string(),
                    ))
                }
            };
            segment.properties = properties;
            segment.id = explicit_id.or(derived_id);
            tree.insert_segment(pos, perspective, segment)
        }
        Operation::Remove {
            pos1,
            relative_pos1,
            pos2,
            relative_pos2,
            register,
        } => {
            let start = resolve_endpoint(
                tree,
                *pos1,
                relative_pos1.as_ref(),
                perspective,
                EndpointDefault::Start,
            )?;
            let end = resolve_endpoint(
                tree,
                *pos2,
                relative_pos2.as_ref(),
                perspective,
                EndpointDefault::End,
            )?;
            let stamp = RemovalStamp {
                client: ctx.client.clone(),
                seq: ctx.seq,
                local_seq: ctx.alloc_local_seq(),
            };
            match register {
                Some(name) if ctx.capture_registers => {
                    let mut captured = String::new();
                    tree.remove_range(start, end, perspective, stamp, Some(&mut captured))?;
                    ctx.captures.push((name.clone(), captured));
                    Ok(())
                }
                _ => tree.remove_range(start, end, perspective, stamp, None),
            }
        }
        Operation::Annotate {
            pos1,
            relative_pos1,
            pos2,
            relative_pos2,
            props,
            combining,
        } => {
            let start = resolve_endpoint(
                tree,
                *pos1,
                relative_pos1.as_ref(),
                perspective,
                EndpointDefault::Start,
            )?;
            let end = resolve_endpoint(
                tree,
                *pos2,
                relative_pos2.as_ref(),
                perspective,
                EndpointDefault::End,
            )?;
            tree.annotate_range(start, end, perspective, props, combining.as_ref())
        }
        Operation::Group { ops } => {
            for (index, member) in ops.iter().enumerate() {
                exec(tree, member, perspective, ctx).map_err(|source| {
                    MergeError::GroupPartialFailure {
                        index,
                        source: Box::new(source),
                    }
                })?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mergetree::position::RelativePosition;
    use crate::mergetree::properties::{Combiner, CombiningOp, PropertySet, PropertyValue};
    use crate::mergetree::segment::ReferenceType;
    use proptest::prelude::*;

    fn replica(client: &str) -> Replica {
        Replica::new(client.to_string())
    }

    fn msg(seq: SeqNumber, client: &str, ref_seq: SeqNumber, op: Operation) -> SequencedOp {
        SequencedOp::new(seq, client, ref_seq, op)
    }

    #[test]
    fn test_concurrent_inserts_converge_to_world_hello() {
        // A inserts "Hello"@0 (seq 1); B, still at refSeq 0, inserts
        // "World"@0 (seq 2). Every replica must end at "WorldHello".
        let ops = [
            msg(1, "a", 0, Operation::insert_text(0, "Hello")),
            msg(2, "b", 0, Operation::insert_text(0, "World")),
        ];
        let mut observer = replica("c");
        for op in &ops {
            observer.apply(op).unwrap();
        }
        assert_eq!(observer.text(), "WorldHello");

        // The submitter of "Hello" converges identically through its own
        // optimistic path.
        let mut a = replica("a");
        a.submit_local(Operation::insert_text(0, "Hello")).unwrap();
        assert_eq!(a.text(), "Hello");
        for op in &ops {
            a.apply(op).unwrap();
        }
        assert_eq!(a.text(), "WorldHello");
        assert!(!a.has_pending());
    }

    #[test]
    fn test_author_with_pending_insert_matches_observer() {
        // The author's "Hello" is still unacked when B's concurrent
        // "World" is sequenced first. "Hello" then gets the later sequence
        // number, so on every replica it sits left: "HelloWorld".
        let mut author = replica("a");
        let wire = author
            .submit_local(Operation::insert_text(0, "Hello"))
            .unwrap();
        let stream = [
            msg(1, "b", 0, Operation::insert_text(0, "World")),
            msg(2, "a", 0, wire),
        ];

        let mut observer = replica("c");
        for op in &stream {
            author.apply(op).unwrap();
            observer.apply(op).unwrap();
        }

        assert_eq!(observer.text(), "HelloWorld");
        assert_eq!(author.text(), observer.text());
        assert!(!author.has_pending());
    }

    #[test]
    fn test_optimistic_ack_promotes_instead_of_reapplying() {
        let mut a = replica("a");
        let wire = a.submit_local(Operation::insert_text(0, "Hi")).unwrap();
        assert_eq!(a.text(), "Hi");

        a.apply(&msg(1, "a", 0, wire.clone())).unwrap();
        assert_eq!(a.text(), "Hi");
        assert!(!a.has_pending());

        // The promoted insert is now addressable by its derived id on the
        // submitter just as on any other replica.
        let mut b = replica("b");
        b.apply(&msg(1, "a", 0, wire)).unwrap();
        for r in [&a, &b] {
            let p = Perspective::current("x".to_string());
            let info = r.tree().locate_anchor("a@1", &p).unwrap();
            assert_eq!(info.start, 0);
            assert_eq!(info.visible_len, 2);
        }
    }

    #[test]
    fn test_out_of_order_sequence_rejected() {
        let mut r = replica("a");
        let err = r
            .apply(&msg(5, "b", 0, Operation::insert_text(0, "x")))
            .unwrap_err();
        assert_eq!(err, MergeError::OutOfOrderSequence { expected: 1, got: 5 });
        assert_eq!(r.last_applied_seq(), 0);
    }

    #[test]
    fn test_rejected_op_consumes_its_seq() {
        let mut r = replica("a");
        // Out-of-range insert: rejected, but seq 1 is consumed
        let err = r
            .apply(&msg(1, "b", 0, Operation::insert_text(9, "x")))
            .unwrap_err();
        assert!(matches!(err, MergeError::PositionOutOfRange { .. }));
        assert_eq!(r.last_applied_seq(), 1);
        r.apply(&msg(2, "b", 0, Operation::insert_text(0, "ok")))
            .unwrap();
        assert_eq!(r.text(), "ok");
    }

    #[test]
    fn test_group_applies_atomically() {
        let mut r = replica("a");
        r.apply(&msg(1, "b", 0, Operation::insert_text(0, "abcdef")))
            .unwrap();

        let group = Operation::group(vec![
            Operation::insert_text(6, "!"),
            Operation::remove(0, 3),
        ]);
        r.apply(&msg(2, "b", 1, group)).unwrap();
        assert_eq!(r.text(), "def!");

        // A group whose second member fails must leave no trace of the first
        let bad = Operation::group(vec![
            Operation::insert_text(0, "xxx"),
            Operation::remove(0, 100),
        ]);
        let err = r.apply(&msg(3, "b", 2, bad)).unwrap_err();
        match err {
            MergeError::GroupPartialFailure { index, source } => {
                assert_eq!(index, 1);
                assert!(matches!(*source, MergeError::PositionOutOfRange { .. }));
            }
            other => unreachable!("unexpected error {other}"),
        }
        assert_eq!(r.text(), "def!");
        r.tree().assert_consistent();
    }

    #[test]
    fn test_group_inserts_get_ordinal_suffixed_ids() {
        let mut r = replica("a");
        let group = Operation::group(vec![
            Operation::insert_text(0, "one"),
            Operation::insert_text(3, "two"),
        ]);
        r.apply(&msg(1, "b", 0, group)).unwrap();
        let p = Perspective::current("x".to_string());
        assert_eq!(r.tree().locate_anchor("b@1", &p).unwrap().start, 0);
        assert_eq!(r.tree().locate_anchor("b@1.1", &p).unwrap().start, 3);
    }

    #[test]
    fn test_concurrent_annotate_converges_by_combiner() {
        let combiner = CombiningOp {
            name: Combiner::Max,
            default_value: Some(0.0),
            min_value: Some(0.0),
            max_value: Some(100.0),
        };
        let mut props40 = PropertySet::new();
        props40.insert("weight".to_string(), Some(40.0.into()));
        let mut props70 = PropertySet::new();
        props70.insert("weight".to_string(), Some(70.0.into()));

        let annotate = |props: &PropertySet| {
            Operation::annotate(0, 4, props.clone(), Some(combiner.clone()))
        };

        // Same global order on both replicas, but the combiner makes the
        // outcome independent of which proposal was sequenced first.
        let mut forward = replica("x");
        forward
            .apply(&msg(1, "a", 0, Operation::insert_text(0, "text")))
            .unwrap();
        forward.apply(&msg(2, "a", 1, annotate(&props40))).unwrap();
        forward.apply(&msg(3, "b", 1, annotate(&props70))).unwrap();

        let mut backward = replica("y");
        backward
            .apply(&msg(1, "a", 0, Operation::insert_text(0, "text")))
            .unwrap();
        backward.apply(&msg(2, "b", 1, annotate(&props70))).unwrap();
        backward.apply(&msg(3, "a", 1, annotate(&props40))).unwrap();

        let p = Perspective::current("z".to_string());
        for r in [&forward, &backward] {
            let (seg, _) = r.tree().segment_at(0, &p).unwrap();
            assert_eq!(seg.properties.get("weight"), Some(&PropertyValue::Number(70.0)));
        }
    }

    #[test]
    fn test_relative_position_stable_under_concurrent_inserts() {
        let mut r = replica("a");
        r.apply(&msg(1, "b", 0, Operation::insert_text(0, "anchor")))
            .unwrap();

        let after_anchor = Operation::Insert {
            pos1: None,
            relative_pos1: Some(RelativePosition::after("b@1")),
            pos2: None,
            relative_pos2: None,
            content: InsertContent::Text("!".to_string()),
            props: None,
        };
        // Concurrent insert at the front shifts absolute offsets first
        r.apply(&msg(2, "c", 1, Operation::insert_text(0, ">>> ")))
            .unwrap();
        r.apply(&msg(3, "b", 1, after_anchor)).unwrap();
        assert_eq!(r.text(), ">>> anchor!");
    }

    #[test]
    fn test_explicit_marker_id_addressable_before_ack() {
        let mut props = PropertySet::new();
        props.insert("id".to_string(), Some("sect".into()));
        let marker = Operation::Insert {
            pos1: Some(0),
            relative_pos1: None,
            pos2: None,
            relative_pos2: None,
            content: InsertContent::Marker(crate::protocol::ops::MarkerDef::new(
                ReferenceType::TILE,
            )),
            props: Some(props),
        };

        let mut a = replica("a");
        a.submit_local(marker).unwrap();
        // Not yet sequenced, but the explicit id already resolves locally
        let rel_insert = Operation::Insert {
            pos1: None,
            relative_pos1: Some(RelativePosition::after("sect")),
            pos2: None,
            relative_pos2: None,
            content: InsertContent::Text("body".to_string()),
            props: None,
        };
        a.submit_local(rel_insert).unwrap();
        assert_eq!(a.text(), "body");
    }

    #[test]
    fn test_slide_on_remove_anchor_survives_removal() {
        let mut r = replica("a");
        r.apply(&msg(1, "b", 0, Operation::insert_text(0, "ab")))
            .unwrap();
        let mut props = PropertySet::new();
        props.insert("id".to_string(), Some("pin".into()));
        let marker = Operation::Insert {
            pos1: Some(1),
            relative_pos1: None,
            pos2: None,
            relative_pos2: None,
            content: InsertContent::Marker(crate::protocol::ops::MarkerDef::new(
                ReferenceType::TILE | ReferenceType::SLIDE_ON_REMOVE,
            )),
            props: Some(props),
        };
        r.apply(&msg(2, "b", 1, marker)).unwrap();
        // Remove the range containing the marker; it slides rather than dies
        r.apply(&msg(3, "b", 2, Operation::remove(0, 2))).unwrap();

        let paste = Operation::Insert {
            pos1: None,
            relative_pos1: Some(RelativePosition::after("pin")),
            pos2: None,
            relative_pos2: None,
            content: InsertContent::Text("x".to_string()),
            props: None,
        };
        r.apply(&msg(4, "b", 3, paste)).unwrap();
        assert_eq!(r.text(), "x");
    }

    #[test]
    fn test_tombstoned_anchor_without_slide_fails() {
        let mut r = replica("a");
        r.apply(&msg(1, "b", 0, Operation::insert_text(0, "gone")))
            .unwrap();
        r.apply(&msg(2, "b", 1, Operation::remove(0, 4))).unwrap();

        let rel = Operation::Insert {
            pos1: None,
            relative_pos1: Some(RelativePosition::after("b@1")),
            pos2: None,
            relative_pos2: None,
            content: InsertContent::Text("x".to_string()),
            props: None,
        };
        let err = r.apply(&msg(3, "c", 2, rel)).unwrap_err();
        assert_eq!(err, MergeError::UnknownAnchor("b@1".to_string()));
    }

    #[test]
    fn test_register_cut_and_paste() {
        let mut a = replica("a");
        let mut seq = 0;
        let mut sequence = |r: &mut Replica, op: Operation| {
            let ref_seq = r.last_applied_seq();
            let wire = r.submit_local(op).unwrap();
            seq += 1;
            r.apply(&msg(seq, "a", ref_seq, wire.clone())).unwrap();
            wire
        };

        sequence(&mut a, Operation::insert_text(0, "Hello World"));
        sequence(&mut a, Operation::cut(0, 6, "clip"));
        assert_eq!(a.text(), "World");
        assert_eq!(a.register("clip"), Some("Hello "));

        // Paste expands to literal text before it leaves the replica
        let wire = sequence(&mut a, Operation::insert_register(5, "clip"));
        assert_eq!(a.text(), "WorldHello ");
        match wire {
            Operation::Insert { content, .. } => {
                assert_eq!(content, InsertContent::Text("Hello ".to_string()));
            }
            other => unreachable!("unexpected wire op {other:?}"),
        }
    }

    #[test]
    fn test_unknown_register_rejected_before_mutation() {
        let mut a = replica("a");
        let err = a
            .submit_local(Operation::insert_register(0, "nope"))
            .unwrap_err();
        assert_eq!(err, MergeError::UnknownRegister("nope".to_string()));
        assert!(!a.has_pending());
    }

    #[test]
    fn test_collect_garbage_preserves_visible_content() {
        let mut r = replica("a");
        r.apply(&msg(1, "b", 0, Operation::insert_text(0, "keep")))
            .unwrap();
        r.apply(&msg(2, "b", 1, Operation::insert_text(4, "drop")))
            .unwrap();
        r.apply(&msg(3, "b", 2, Operation::remove(4, 8))).unwrap();
        r.add_client("b".to_string());
        r.add_client("c".to_string());

        // c lags behind the removal: nothing may be pruned yet
        r.observe_ack("b".to_string(), 3);
        r.observe_ack("c".to_string(), 2);
        assert_eq!(r.collect_garbage(), 0);

        r.observe_ack("c".to_string(), 3);
        let before = r.text();
        assert_eq!(r.collect_garbage(), 1);
        assert_eq!(r.text(), before);
        r.tree().assert_consistent();

        // The pruned segment's anchor no longer resolves
        let rel = Operation::Insert {
            pos1: None,
            relative_pos1: Some(RelativePosition::after("b@2")),
            pos2: None,
            relative_pos2: None,
            content: InsertContent::Text("x".to_string()),
            props: None,
        };
        assert!(r.apply(&msg(4, "c", 3, rel)).is_err());
    }

    #[test]
    fn test_departed_client_releases_window_floor() {
        let mut r = replica("a");
        r.apply(&msg(1, "b", 0, Operation::insert_text(0, "ab")))
            .unwrap();
        r.apply(&msg(2, "b", 1, Operation::remove(0, 2))).unwrap();
        r.add_client("laggard".to_string());
        r.observe_ack("b".to_string(), 2);
        assert_eq!(r.collect_garbage(), 0);

        r.remove_client("laggard");
        assert_eq!(r.collect_garbage(), 1);
    }

    #[test]
    fn test_chunk_bootstrap_resumes_stream() {
        let mut source = replica("a");
        source
            .apply(&msg(1, "b", 0, Operation::insert_text(0, "Hello ")))
            .unwrap();
        source
            .apply(&msg(2, "b", 1, Operation::insert_text(6, "World")))
            .unwrap();

        let chunk = source.snapshot();
        let mut fresh = Replica::from_chunk("c".to_string(), &chunk).unwrap();
        assert_eq!(fresh.text(), "Hello World");
        assert_eq!(fresh.last_applied_seq(), 2);

        let next = msg(3, "b", 2, Operation::insert_text(11, "!"));
        source.apply(&next).unwrap();
        fresh.apply(&next).unwrap();
        assert_eq!(fresh.text(), source.text());
    }

    #[test]
    fn test_sequenced_op_wire_shape() {
        let op = msg(7, "a", 5, Operation::insert_text(0, "x"));
        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(
            json,
            r#"{"sequenceNumber":7,"clientId":"a","referenceSequenceNumber":5,"contents":{"type":0,"pos1":0,"text":"x"}}"#
        );
        assert_eq!(serde_json::from_str::<SequencedOp>(&json).unwrap(), op);
    }

    proptest! {
        /// The submitter's optimistic path and a remote replica's sequenced
        /// path must land on identical text for any stream of valid edits.
        #[test]
        fn prop_optimistic_and_remote_replicas_converge(
            steps in proptest::collection::vec(
                (0u8..3, any::<u16>(), "[a-z]{1,8}"),
                1..32,
            )
        ) {
            let mut author = Replica::new("author".to_string());
            let mut observer = Replica::new("observer".to_string());
            let mut seq = 0u64;

            for (kind, at, text) in steps {
                let len = author.visible_len();
                let at = at as usize;
                let op = match kind {
                    0 => Operation::insert_text(at % (len + 1), text),
                    1 if len > 0 => {
                        let start = at % len;
                        let end = (start + 1 + at % 4).min(len);
                        Operation::remove(start, end)
                    }
                    _ => Operation::insert_marker(at % (len + 1), ReferenceType::TILE),
                };
                let ref_seq = author.last_applied_seq();
                let wire = author.submit_local(op).unwrap();
                seq += 1;
                let sequenced = msg(seq, "author", ref_seq, wire);
                author.apply(&sequenced).unwrap();
                observer.apply(&sequenced).unwrap();
            }

            prop_assert_eq!(author.text(), observer.text());
            prop_assert!(!author.has_pending());
            author.tree().assert_consistent();
            observer.tree().assert_consistent();
        }

        /// Two authors edit optimistically at the same time and the
        /// sequencer interleaves their submissions arbitrarily. Both
        /// authors and a pure observer must land on identical text.
        #[test]
        fn prop_two_authors_converge_under_any_interleaving(
            a_steps in proptest::collection::vec((0u8..2, any::<u16>(), "[a-m]{1,6}"), 1..10),
            b_steps in proptest::collection::vec((0u8..2, any::<u16>(), "[n-z]{1,6}"), 1..10),
            order in proptest::collection::vec(any::<bool>(), 0..20),
        ) {
            let mut alice = Replica::new("alice".to_string());
            let mut bob = Replica::new("bob".to_string());
            let mut observer = Replica::new("observer".to_string());

            let submit_all = |author: &mut Replica, steps: Vec<(u8, u16, String)>| {
                let mut queue = VecDeque::new();
                for (kind, at, text) in steps {
                    let len = author.visible_len();
                    let at = at as usize;
                    let op = match kind {
                        1 if len > 0 => {
                            let start = at % len;
                            let end = (start + 1 + at % 4).min(len);
                            Operation::remove(start, end)
                        }
                        _ => Operation::insert_text(at % (len + 1), text),
                    };
                    let ref_seq = author.last_applied_seq();
                    queue.push_back((ref_seq, author.submit_local(op).unwrap()));
                }
                queue
            };
            let mut from_alice = submit_all(&mut alice, a_steps);
            let mut from_bob = submit_all(&mut bob, b_steps);

            let mut picks = order.into_iter();
            let mut seq = 0u64;
            while !from_alice.is_empty() || !from_bob.is_empty() {
                let take_alice = if from_bob.is_empty() {
                    true
                } else if from_alice.is_empty() {
                    false
                } else {
                    picks.next().unwrap_or(true)
                };
                let (client, (ref_seq, wire)) = if take_alice {
                    ("alice", from_alice.pop_front().unwrap())
                } else {
                    ("bob", from_bob.pop_front().unwrap())
                };
                seq += 1;
                let sequenced = msg(seq, client, ref_seq, wire);
                alice.apply(&sequenced).unwrap();
                bob.apply(&sequenced).unwrap();
                observer.apply(&sequenced).unwrap();
            }

            prop_assert_eq!(alice.text(), bob.text());
            prop_assert_eq!(alice.text(), observer.text());
            prop_assert!(!alice.has_pending());
            prop_assert!(!bob.has_pending());
            alice.tree().assert_consistent();
            bob.tree().assert_consistent();
            observer.tree().assert_consistent();
        }
    }
}
