//! Property Table: per-segment annotations with deterministic merging
//!
//! Property values are a closed tagged variant (number, string, boolean)
//! rather than free-form JSON, and combining operators are restricted to the
//! numeric variant. Two replicas that apply the same pair of concurrent
//! annotations in either order converge to the same value because every
//! combiner is commutative and associative over its clamped range.

use crate::error::{MergeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single annotation value
///
/// The wire representation is the plain JSON scalar (untagged), so
/// `{"fontSize": 11, "bold": true, "font": "serif"}` decodes directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Boolean flag
    Bool(bool),
    /// Numeric value; the only variant combining operators accept
    Number(f64),
    /// String value
    Str(String),
}

impl PropertyValue {
    /// Numeric view of this value, if it is a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<f64> for PropertyValue {
    fn from(n: f64) -> Self {
        PropertyValue::Number(n)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Str(s.to_string())
    }
}

/// Resolved annotation state of a segment
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// Proposed annotation payload of an operation
///
/// `None` is the wire `null` and deletes the key.
pub type PropertySet = BTreeMap<String, Option<PropertyValue>>;

/// Merge function applied when two replicas annotate the same key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combiner {
    /// Keep the smaller value
    Min,
    /// Keep the larger value
    Max,
    /// Add the proposed value to the existing one
    Sum,
    /// Explicit last-writer overwrite
    Replace,
}

/// Combining operator attached to an annotate operation
///
/// Defines how two concurrent annotations of the same key merge
/// deterministically regardless of application order. `default_value` seeds
/// the merge when no prior value exists; results are clamped to
/// `[min_value, max_value]` when those bounds are present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombiningOp {
    /// Which merge function to apply
    pub name: Combiner,

    /// Seed value when the key has no prior value
    #[serde(rename = "defaultValue", skip_serializing_if = "Option::is_none", default)]
    pub default_value: Option<f64>,

    /// Lower clamp bound
    #[serde(rename = "minValue", skip_serializing_if = "Option::is_none", default)]
    pub min_value: Option<f64>,

    /// Upper clamp bound
    #[serde(rename = "maxValue", skip_serializing_if = "Option::is_none", default)]
    pub max_value: Option<f64>,
}

impl CombiningOp {
    /// Merge a proposed value into the existing one
    ///
    /// Non-numeric values are rejected for every combiner except `Replace`;
    /// they are never silently coerced.
    pub fn combine(
        &self,
        existing: Option<&PropertyValue>,
        proposed: &PropertyValue,
    ) -> Result<PropertyValue> {
        if self.name == Combiner::Replace {
            return Ok(proposed.clone());
        }

        let proposed = proposed.as_number().ok_or_else(|| {
            MergeError::MalformedOperation(
                "combining operator applied to non-numeric value".to_string(),
            )
        })?;

        let prior = match existing {
            Some(value) => Some(value.as_number().ok_or_else(|| {
                MergeError::MalformedOperation(
                    "combining operator over non-numeric prior value".to_string(),
                )
            })?),
            None => self.default_value,
        };

        let merged = match (self.name, prior) {
            (_, None) => proposed,
            (Combiner::Min, Some(prior)) => prior.min(proposed),
            (Combiner::Max, Some(prior)) => prior.max(proposed),
            (Combiner::Sum, Some(prior)) => prior + proposed,
            (Combiner::Replace, _) => unreachable!("handled above"),
        };

        Ok(PropertyValue::Number(self.clamp(merged)))
    }

    fn clamp(&self, value: f64) -> f64 {
        let mut value = value;
        if let Some(min) = self.min_value {
            value = value.max(min);
        }
        if let Some(max) = self.max_value {
            value = value.min(max);
        }
        value
    }
}

/// Apply an annotation payload to a segment's property map
///
/// Without a combining operator (or with `Replace`) the proposed values
/// overwrite; a wire `null` deletes the key. With a numeric combiner the
/// final value is the operator applied to the existing and proposed values,
/// independent of arrival order.
pub fn apply_annotation(
    map: &mut PropertyMap,
    props: &PropertySet,
    combining: Option<&CombiningOp>,
) -> Result<()> {
    for (key, proposed) in props {
        match proposed {
            None => {
                if matches!(combining, Some(op) if op.name != Combiner::Replace) {
                    return Err(MergeError::MalformedOperation(format!(
                        "null value for combined key \"{key}\""
                    )));
                }
                map.remove(key);
            }
            Some(value) => {
                let merged = match combining {
                    Some(op) => op.combine(map.get(key), value)?,
                    None => value.clone(),
                };
                map.insert(key.clone(), merged);
            }
        }
    }
    Ok(())
}
