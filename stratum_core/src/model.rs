use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Deserializer, Serialize};

use crate::bucketer::TOTAL_BUCKETS;
use crate::error::LoadError;

#[allow(missing_docs)]
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Declared type of a context attribute. Defines which rule values are legal for a field and how
/// comparisons are performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Semver,
}

/// Mapping from attribute name to its declared [`FieldType`].
pub type FieldTypes = HashMap<String, FieldType>;

/// Comparison operator of a `field` rule node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Eq,
    Neq,
    /// Greater than. Numeric or semver comparison; semver compares the three-component tuple
    /// with integer semantics (10 > 2).
    Gt,
    Gte,
    Lt,
    Lte,
    /// Set membership over the condition values. Match is under the declared field type.
    In,
    NotIn,
    /// Wildcard match for `string` fields. `*` matches any run of characters, no other
    /// metacharacters; the whole value must match, not a substring.
    Like,
    NotLike,
}

impl Op {
    /// Operators that take exactly one condition value.
    pub(crate) fn is_unary(self) -> bool {
        !matches!(self, Op::In | Op::NotIn)
    }

    /// Operators that compare by order rather than equality.
    pub(crate) fn is_ordering(self) -> bool {
        matches!(self, Op::Gt | Op::Gte | Op::Lt | Op::Lte)
    }
}

/// A scalar appearing in a rule condition.
///
/// Untagged, so we don't know the exact kind until it is combined with the field's declared
/// [`FieldType`] during validation and evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From)]
#[serde(untagged)]
pub enum RuleValue {
    Boolean(bool),
    Number(f64),
    String(String),
}

impl From<&str> for RuleValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for RuleValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

/// A node of a targeting rule: a typed boolean tree evaluated against the request context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleNode {
    And {
        children: Vec<RuleNode>,
    },
    Or {
        children: Vec<RuleNode>,
    },
    Not {
        child: Box<RuleNode>,
    },
    /// Leaf: compare a context field against condition values.
    Field {
        field: String,
        op: Op,
        values: Vec<RuleValue>,
    },
}

impl RuleNode {
    /// Validate the tree against the field-type map.
    ///
    /// Called at snapshot build time; an invalid rule rejects the experiment that carries it.
    pub fn validate(&self, field_types: &FieldTypes) -> Result<(), LoadError> {
        match self {
            RuleNode::And { children } => {
                if children.is_empty() {
                    return Err(LoadError::EmptyChildren { node: "and" });
                }
                children.iter().try_for_each(|c| c.validate(field_types))
            }
            RuleNode::Or { children } => {
                if children.is_empty() {
                    return Err(LoadError::EmptyChildren { node: "or" });
                }
                children.iter().try_for_each(|c| c.validate(field_types))
            }
            RuleNode::Not { child } => child.validate(field_types),
            RuleNode::Field { field, op, values } => {
                let Some(&field_type) = field_types.get(field) else {
                    return Err(LoadError::UndeclaredField {
                        field: field.clone(),
                    });
                };

                if values.is_empty() {
                    return Err(LoadError::EmptyValues {
                        field: field.clone(),
                    });
                }
                if op.is_unary() && values.len() != 1 {
                    return Err(LoadError::ValueArity {
                        field: field.clone(),
                        op: *op,
                        count: values.len(),
                    });
                }

                let op_supported = match field_type {
                    FieldType::String => !op.is_ordering(),
                    FieldType::Int | FieldType::Float | FieldType::Semver => {
                        !matches!(op, Op::Like | Op::NotLike)
                    }
                    FieldType::Bool => matches!(op, Op::Eq | Op::Neq | Op::In | Op::NotIn),
                };
                if !op_supported {
                    return Err(LoadError::UnsupportedOperator {
                        field: field.clone(),
                        op: *op,
                    });
                }

                for value in values {
                    if !value.matches_type(field_type) {
                        return Err(LoadError::ValueType {
                            field: field.clone(),
                        });
                    }
                }

                Ok(())
            }
        }
    }
}

impl RuleValue {
    fn matches_type(&self, field_type: FieldType) -> bool {
        match (field_type, self) {
            (FieldType::String, RuleValue::String(_)) => true,
            (FieldType::Int, RuleValue::Number(n)) => n.fract() == 0.0,
            (FieldType::Float, RuleValue::Number(_)) => true,
            (FieldType::Bool, RuleValue::Boolean(_)) => true,
            (FieldType::Semver, RuleValue::String(s)) => semver::Version::parse(s).is_ok(),
            _ => false,
        }
    }
}

/// Contiguous bucket interval bound to a variant id. Half-open: `start <= bucket < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRange {
    pub start: u32,
    pub end: u32,
    pub vid: i64,
}

impl BucketRange {
    pub(crate) fn contains(&self, bucket: u32) -> bool {
        self.start <= bucket && bucket < self.end
    }
}

/// An independent experimentation stratum with its own traffic split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub layer_id: String,
    pub version: String,
    /// Larger priority wins during parameter merge; ties are broken by lexicographic `layer_id`.
    pub priority: i32,
    /// Name of the identifying key (in `request.keys`) hashed to pick a bucket.
    pub hash_key: String,
    /// Salt mixed into the hash. If absent, `{layer_id}_{version}` is used.
    #[serde(default)]
    pub salt: Option<String>,
    /// Services this layer applies to. When empty, services are inferred from the catalog via
    /// the layer's vids.
    #[serde(default, alias = "service", deserialize_with = "one_or_many")]
    pub services: Vec<String>,
    /// Slot ranges, non-overlapping within the layer.
    #[serde(default)]
    pub ranges: Vec<BucketRange>,
    #[serde(default)]
    pub enabled: bool,
}

impl Layer {
    /// The effective salt for this layer.
    pub fn salt(&self) -> String {
        self.salt
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.layer_id, self.version))
    }

    /// The vid assigned to a bucket, or `None` when the bucket falls in a hole.
    ///
    /// Binary search; ranges are sorted by `start` after [`Layer::normalize`].
    pub fn vid_for_bucket(&self, bucket: u32) -> Option<i64> {
        if bucket >= TOTAL_BUCKETS {
            return None;
        }

        let pos = self.ranges.partition_point(|r| r.start <= bucket);
        if pos > 0 {
            let candidate = &self.ranges[pos - 1];
            if candidate.contains(bucket) {
                return Some(candidate.vid);
            }
        }

        None
    }

    /// Sort ranges and check bounds and overlap. Called once at snapshot build time.
    pub fn normalize(&mut self) -> Result<(), LoadError> {
        for r in &self.ranges {
            if r.start >= r.end {
                return Err(LoadError::InvalidRange {
                    start: r.start,
                    end: r.end,
                });
            }
            if r.end > TOTAL_BUCKETS {
                return Err(LoadError::RangeOutOfBounds {
                    end: r.end,
                    total: TOTAL_BUCKETS,
                });
            }
        }

        self.ranges
            .sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.end.cmp(&b.end)));

        for w in self.ranges.windows(2) {
            if w[1].start < w[0].end {
                return Err(LoadError::OverlappingRanges {
                    first_start: w[0].start,
                    first_end: w[0].end,
                    second_start: w[1].start,
                    second_end: w[1].end,
                });
            }
        }

        Ok(())
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(service) => vec![service],
        OneOrMany::Many(services) => services,
    })
}

/// One arm of an experiment, carrying the parameters delivered on assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    /// Globally unique, immutable variant id.
    pub vid: i64,
    /// JSON-shaped parameter tree. Must be an object at the top level.
    pub params: serde_json::Value,
}

/// A set of variants under a common service and targeting rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    /// Globally unique, immutable experiment id.
    pub eid: i64,
    pub service: String,
    /// Targeting rule shared by all variants. Absent rule always matches.
    #[serde(default)]
    pub rule: Option<RuleNode>,
    pub variants: Vec<Variant>,
}
