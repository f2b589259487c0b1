//! Chunk snapshots: bootstrap a replica without replaying full history
//!
//! A chunk is the visible content of the tree at one sequence number,
//! flattened to an ordered list of property/text/marker descriptors with the
//! historical camelCase field names. Tombstones are not captured: a replica
//! loaded from a chunk starts at the chunk's sequence number and only needs
//! operations sequenced after it.

use crate::error::{MergeError, Result};
use crate::mergetree::properties::{PropertyMap, PropertyValue};
use crate::mergetree::segment::{InsertionStamp, Segment, SegmentContent};
use crate::mergetree::tree::MergeTree;
use crate::protocol::ops::{MarkerDef, ID_PROPERTY};
use crate::SeqNumber;
use serde::{Deserialize, Serialize};

/// One snapshot entry: a text run or a marker, with its properties
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyString {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub props: Option<PropertyMap>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub text: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub marker: Option<MarkerDef>,
}

/// Serialized form of the tree's visible content at one sequence number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeTreeChunk {
    /// Index of the first segment in this chunk within the whole snapshot
    pub chunk_start_segment_index: usize,
    /// Number of segments carried by this chunk
    pub chunk_segment_count: usize,
    /// Character length of this chunk's content
    pub chunk_length_chars: usize,
    /// Character length of the whole snapshot
    pub total_length_chars: usize,
    /// Segment count of the whole snapshot
    pub total_segment_count: usize,
    /// Sequence number the snapshot reflects
    pub chunk_sequence_number: SeqNumber,
    /// Ordered visible segments
    pub segment_texts: Vec<PropertyString>,
}

impl MergeTreeChunk {
    /// Capture the visible content of `tree` as a single chunk
    ///
    /// Segment ids are preserved through the reserved `"id"` property so
    /// anchors stay addressable after a bootstrap.
    pub fn snapshot(tree: &MergeTree, seq: SeqNumber) -> Self {
        let mut entries = Vec::new();
        let mut length = 0;
        tree.for_each_segment(&mut |seg| {
            if seg.is_tombstone() {
                return;
            }
            let mut props = seg.properties.clone();
            if let Some(id) = &seg.id {
                props.insert(ID_PROPERTY.to_string(), PropertyValue::Str(id.clone()));
            }
            let props = (!props.is_empty()).then_some(props);
            let entry = match &seg.content {
                SegmentContent::Text(text) => {
                    length += seg.len();
                    PropertyString {
                        props,
                        text: Some(text.clone()),
                        marker: None,
                    }
                }
                SegmentContent::Marker(flags) => PropertyString {
                    props,
                    text: None,
                    marker: Some(MarkerDef::new(*flags)),
                },
            };
            entries.push(entry);
        });
        MergeTreeChunk {
            chunk_start_segment_index: 0,
            chunk_segment_count: entries.len(),
            chunk_length_chars: length,
            total_length_chars: length,
            total_segment_count: entries.len(),
            chunk_sequence_number: seq,
            segment_texts: entries,
        }
    }

    /// Rebuild a tree with the chunk's visible content
    ///
    /// Loaded segments are stamped as sequenced at the chunk's sequence
    /// number; the originating client is not recorded in a snapshot.
    pub fn build_tree(&self) -> Result<MergeTree> {
        if self.segment_texts.len() != self.chunk_segment_count {
            return Err(MergeError::MalformedOperation(format!(
                "chunk claims {} segments but carries {}",
                self.chunk_segment_count,
                self.segment_texts.len()
            )));
        }
        let mut tree = MergeTree::new();
        let mut length = 0;
        for entry in &self.segment_texts {
            let stamp = InsertionStamp {
                client: String::new(),
                seq: Some(self.chunk_sequence_number),
                local_seq: 0,
            };
            let mut seg = match (&entry.text, &entry.marker) {
                (Some(text), None) => {
                    let seg = Segment::text(text.clone(), stamp);
                    length += seg.len();
                    seg
                }
                (None, Some(marker)) => Segment::marker(marker.flags(), stamp),
                _ => {
                    return Err(MergeError::MalformedOperation(
                        "chunk segment requires exactly one of text, marker".to_string(),
                    ))
                }
            };
            if let Some(props) = &entry.props {
                for (key, value) in props {
                    if key == ID_PROPERTY {
                        match value {
                            PropertyValue::Str(id) => seg.id = Some(id.clone()),
                            _ => {
                                return Err(MergeError::MalformedOperation(
                                    "id property must be a string".to_string(),
                                ))
                            }
                        }
                    } else {
                        seg.properties.insert(key.clone(), value.clone());
                    }
                }
            }
            tree.append(seg)?;
        }
        if length != self.chunk_length_chars {
            return Err(MergeError::MalformedOperation(format!(
                "chunk claims {} chars but carries {}",
                self.chunk_length_chars, length
            )));
        }
        Ok(tree)
    }

    /// Encode to snapshot JSON
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|err| MergeError::MalformedOperation(err.to_string()))
    }

    /// Decode from snapshot JSON
    pub fn decode(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|err| MergeError::MalformedOperation(err.to_string()))
    }
}
