//! Operation Codec: the JSON wire contract for sequence edits
//!
//! Operations travel as flat JSON objects tagged with a small integer
//! `type` (0 insert, 1 remove, 2 annotate, 3 group) and camelCase field
//! names, the historical protocol shape. Decoding validates structure into
//! the typed [`Operation`] enum; a raw message with contradictory fields
//! (both `text` and `marker`, a group with no members) is rejected as
//! [`MergeError::MalformedOperation`] before it ever reaches the tree.

use crate::error::{MergeError, Result};
use crate::mergetree::position::RelativePosition;
use crate::mergetree::properties::{CombiningOp, PropertySet, PropertyValue};
use crate::mergetree::segment::ReferenceType;
use serde::{Deserialize, Serialize};

/// Integer type tags used on the wire
pub const INSERT: u8 = 0;
pub const REMOVE: u8 = 1;
pub const ANNOTATE: u8 = 2;
pub const GROUP: u8 = 3;

/// Wire description of a marker to insert
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerDef {
    /// Structural behavior flags; absent means a simple marker
    #[serde(rename = "refType", skip_serializing_if = "Option::is_none", default)]
    pub ref_type: Option<ReferenceType>,
}

impl MarkerDef {
    /// Marker with the given flags
    pub fn new(ref_type: ReferenceType) -> Self {
        Self {
            ref_type: Some(ref_type),
        }
    }

    /// Flags to stamp on the created segment
    pub fn flags(&self) -> ReferenceType {
        self.ref_type.unwrap_or(ReferenceType::SIMPLE)
    }
}

/// What an insert operation puts into the sequence
///
/// Exactly one source is populated on the wire: literal `text`, a `marker`
/// definition, or the name of a `register` holding previously captured text.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertContent {
    Text(String),
    Marker(MarkerDef),
    Register(String),
}

/// A decoded, structurally valid sequence operation
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Insert {
        pos1: Option<usize>,
        relative_pos1: Option<RelativePosition>,
        /// Carried for protocol fidelity; inserts ignore the second endpoint
        pos2: Option<usize>,
        relative_pos2: Option<RelativePosition>,
        content: InsertContent,
        /// Initial properties; a reserved `"id"` key names the segment
        props: Option<PropertySet>,
    },
    Remove {
        pos1: Option<usize>,
        relative_pos1: Option<RelativePosition>,
        pos2: Option<usize>,
        relative_pos2: Option<RelativePosition>,
        /// Capture the removed text into this client-local buffer
        register: Option<String>,
    },
    Annotate {
        pos1: Option<usize>,
        relative_pos1: Option<RelativePosition>,
        pos2: Option<usize>,
        relative_pos2: Option<RelativePosition>,
        props: PropertySet,
        combining: Option<CombiningOp>,
    },
    /// Atomic batch: either every member lands or none do
    Group { ops: Vec<Operation> },
}

impl Operation {
    /// Insert literal text at an absolute position
    pub fn insert_text(pos: usize, text: impl Into<String>) -> Self {
        Operation::Insert {
            pos1: Some(pos),
            relative_pos1: None,
            pos2: None,
            relative_pos2: None,
            content: InsertContent::Text(text.into()),
            props: None,
        }
    }

    /// Insert a marker at an absolute position
    pub fn insert_marker(pos: usize, ref_type: ReferenceType) -> Self {
        Operation::Insert {
            pos1: Some(pos),
            relative_pos1: None,
            pos2: None,
            relative_pos2: None,
            content: InsertContent::Marker(MarkerDef::new(ref_type)),
            props: None,
        }
    }

    /// Insert the contents of a named register at an absolute position
    pub fn insert_register(pos: usize, register: impl Into<String>) -> Self {
        Operation::Insert {
            pos1: Some(pos),
            relative_pos1: None,
            pos2: None,
            relative_pos2: None,
            content: InsertContent::Register(register.into()),
            props: None,
        }
    }

    /// Remove the absolute range `[start, end)`
    pub fn remove(start: usize, end: usize) -> Self {
        Operation::Remove {
            pos1: Some(start),
            relative_pos1: None,
            pos2: Some(end),
            relative_pos2: None,
            register: None,
        }
    }

    /// Remove `[start, end)`, capturing the text into a register
    pub fn cut(start: usize, end: usize, register: impl Into<String>) -> Self {
        Operation::Remove {
            pos1: Some(start),
            relative_pos1: None,
            pos2: Some(end),
            relative_pos2: None,
            register: Some(register.into()),
        }
    }

    /// Annotate the absolute range `[start, end)`
    pub fn annotate(
        start: usize,
        end: usize,
        props: PropertySet,
        combining: Option<CombiningOp>,
    ) -> Self {
        Operation::Annotate {
            pos1: Some(start),
            relative_pos1: None,
            pos2: Some(end),
            relative_pos2: None,
            props,
            combining,
        }
    }

    /// Atomic batch of operations
    pub fn group(ops: Vec<Operation>) -> Self {
        Operation::Group { ops }
    }
}

/// Raw wire shape before structural validation
///
/// All fields optional; which combination is legal depends on `type`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawOp {
    #[serde(rename = "type")]
    kind: u8,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pos1: Option<usize>,

    #[serde(rename = "relativePos1", skip_serializing_if = "Option::is_none", default)]
    relative_pos1: Option<RelativePosition>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pos2: Option<usize>,

    #[serde(rename = "relativePos2", skip_serializing_if = "Option::is_none", default)]
    relative_pos2: Option<RelativePosition>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    text: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    marker: Option<MarkerDef>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    register: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    props: Option<PropertySet>,

    #[serde(rename = "combiningOp", skip_serializing_if = "Option::is_none", default)]
    combining_op: Option<CombiningOp>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    ops: Option<Vec<RawOp>>,
}

impl RawOp {
    fn validate(self) -> Result<Operation> {
        match self.kind {
            INSERT => {
                if self.combining_op.is_some() || self.ops.is_some() {
                    return Err(MergeError::MalformedOperation(
                        "insert carries annotate/group fields".to_string(),
                    ));
                }
                let content = match (self.text, self.marker, self.register) {
                    (Some(text), None, None) => InsertContent::Text(text),
                    (None, Some(marker), None) => InsertContent::Marker(marker),
                    (None, None, Some(register)) => InsertContent::Register(register),
                    _ => {
                        return Err(MergeError::MalformedOperation(
                            "insert requires exactly one of text, marker, register"
                                .to_string(),
                        ))
                    }
                };
                Ok(Operation::Insert {
                    pos1: self.pos1,
                    relative_pos1: self.relative_pos1,
                    pos2: self.pos2,
                    relative_pos2: self.relative_pos2,
                    content,
                    props: self.props,
                })
            }
            REMOVE => {
                if self.text.is_some()
                    || self.marker.is_some()
                    || self.props.is_some()
                    || self.combining_op.is_some()
                    || self.ops.is_some()
                {
                    return Err(MergeError::MalformedOperation(
                        "remove carries content/annotate/group fields".to_string(),
                    ));
                }
                Ok(Operation::Remove {
                    pos1: self.pos1,
                    relative_pos1: self.relative_pos1,
                    pos2: self.pos2,
                    relative_pos2: self.relative_pos2,
                    register: self.register,
                })
            }
            ANNOTATE => {
                if self.text.is_some()
                    || self.marker.is_some()
                    || self.register.is_some()
                    || self.ops.is_some()
                {
                    return Err(MergeError::MalformedOperation(
                        "annotate carries content/group fields".to_string(),
                    ));
                }
                let props = self.props.ok_or_else(|| {
                    MergeError::MalformedOperation("annotate requires props".to_string())
                })?;
                Ok(Operation::Annotate {
                    pos1: self.pos1,
                    relative_pos1: self.relative_pos1,
                    pos2: self.pos2,
                    relative_pos2: self.relative_pos2,
                    props,
                    combining: self.combining_op,
                })
            }
            GROUP => {
                let members = self.ops.ok_or_else(|| {
                    MergeError::MalformedOperation("group requires ops".to_string())
                })?;
                if members.is_empty() {
                    return Err(MergeError::MalformedOperation(
                        "group must not be empty".to_string(),
                    ));
                }
                let ops = members
                    .into_iter()
                    .map(RawOp::validate)
                    .collect::<Result<Vec<_>>>()?;
                Ok(Operation::Group { ops })
            }
            other => Err(MergeError::MalformedOperation(format!(
                "unknown operation type tag {other}"
            ))),
        }
    }
}

impl From<&Operation> for RawOp {
    fn from(op: &Operation) -> RawOp {
        match op {
            Operation::Insert {
                pos1,
                relative_pos1,
                pos2,
                relative_pos2,
                content,
                props,
            } => {
                let mut raw = RawOp {
                    kind: INSERT,
                    pos1: *pos1,
                    relative_pos1: relative_pos1.clone(),
                    pos2: *pos2,
                    relative_pos2: relative_pos2.clone(),
                    props: props.clone(),
                    ..RawOp::default()
                };
                match content {
                    InsertContent::Text(text) => raw.text = Some(text.clone()),
                    InsertContent::Marker(marker) => raw.marker = Some(marker.clone()),
                    InsertContent::Register(name) => raw.register = Some(name.clone()),
                }
                raw
            }
            Operation::Remove {
                pos1,
                relative_pos1,
                pos2,
                relative_pos2,
                register,
            } => RawOp {
                kind: REMOVE,
                pos1: *pos1,
                relative_pos1: relative_pos1.clone(),
                pos2: *pos2,
                relative_pos2: relative_pos2.clone(),
                register: register.clone(),
                ..RawOp::default()
            },
            Operation::Annotate {
                pos1,
                relative_pos1,
                pos2,
                relative_pos2,
                props,
                combining,
            } => RawOp {
                kind: ANNOTATE,
                pos1: *pos1,
                relative_pos1: relative_pos1.clone(),
                pos2: *pos2,
                relative_pos2: relative_pos2.clone(),
                props: Some(props.clone()),
                combining_op: combining.clone(),
                ..RawOp::default()
            },
            Operation::Group { ops } => RawOp {
                kind: GROUP,
                ops: Some(ops.iter().map(RawOp::from).collect()),
                ..RawOp::default()
            },
        }
    }
}

impl Serialize for Operation {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        RawOp::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = RawOp::deserialize(deserializer)?;
        raw.validate().map_err(serde::de::Error::custom)
    }
}

/// Encode an operation to its wire JSON
pub fn encode(op: &Operation) -> Result<String> {
    serde_json::to_string(&RawOp::from(op))
        .map_err(|err| MergeError::MalformedOperation(err.to_string()))
}

/// Decode and validate an operation from wire JSON
pub fn decode(json: &str) -> Result<Operation> {
    let raw: RawOp = serde_json::from_str(json)
        .map_err(|err| MergeError::MalformedOperation(err.to_string()))?;
    raw.validate()
}

/// Reserved property key naming a segment explicitly at insert time
pub const ID_PROPERTY: &str = "id";

/// Split an insert's property payload into (segment id, resolved properties)
///
/// Wire nulls are invalid in an insert payload; properties there are initial
/// values, not deltas.
pub fn insert_properties(
    props: Option<&PropertySet>,
) -> Result<(Option<String>, crate::mergetree::properties::PropertyMap)> {
    let mut id = None;
    let mut map = crate::mergetree::properties::PropertyMap::new();
    if let Some(props) = props {
        for (key, value) in props {
            let value = value.clone().ok_or_else(|| {
                MergeError::MalformedOperation(format!(
                    "null value for insert property \"{key}\""
                ))
            })?;
            if key == ID_PROPERTY {
                match value {
                    PropertyValue::Str(name) => id = Some(name),
                    _ => {
                        return Err(MergeError::MalformedOperation(
                            "id property must be a string".to_string(),
                        ))
                    }
                }
            } else {
                map.insert(key.clone(), value);
            }
        }
    }
    Ok((id, map))
}
