use std::cmp::Ordering;

use semver::Version;

use crate::error::RuleError;
use crate::model::{FieldType, FieldTypes, Op, RuleNode, RuleValue};
use crate::{AttributeValue, Attributes};

impl RuleNode {
    /// Evaluate the rule tree against a request context.
    ///
    /// `Ok(true)` is a match, `Ok(false)` is a non-match. Any [`RuleError`] is treated by callers
    /// as a non-match for the affected experiment and recorded in telemetry; it never fails the
    /// request or other layers.
    pub fn evaluate(
        &self,
        context: &Attributes,
        field_types: &FieldTypes,
    ) -> Result<bool, RuleError> {
        match self {
            RuleNode::And { children } => {
                for child in children {
                    if !child.evaluate(context, field_types)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            RuleNode::Or { children } => {
                for child in children {
                    if child.evaluate(context, field_types)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            RuleNode::Not { child } => Ok(!child.evaluate(context, field_types)?),
            RuleNode::Field { field, op, values } => {
                eval_field(field, *op, values, context, field_types)
            }
        }
    }
}

fn eval_field(
    field: &str,
    op: Op,
    values: &[RuleValue],
    context: &Attributes,
    field_types: &FieldTypes,
) -> Result<bool, RuleError> {
    let attribute = match context.get(field) {
        Some(AttributeValue::Null) | None => {
            return Err(RuleError::MissingField(field.to_owned()))
        }
        Some(value) => value,
    };
    let &field_type = field_types
        .get(field)
        .ok_or_else(|| RuleError::UndeclaredField(field.to_owned()))?;

    let single = || {
        if values.len() == 1 {
            Ok(&values[0])
        } else {
            Err(RuleError::MalformedOperator {
                field: field.to_owned(),
                op,
            })
        }
    };

    match op {
        Op::Eq => Ok(compare(field, field_type, attribute, single()?)? == Ordering::Equal),
        Op::Neq => Ok(compare(field, field_type, attribute, single()?)? != Ordering::Equal),

        Op::Gt | Op::Gte | Op::Lt | Op::Lte => {
            if !matches!(
                field_type,
                FieldType::Int | FieldType::Float | FieldType::Semver
            ) {
                return Err(RuleError::MalformedOperator {
                    field: field.to_owned(),
                    op,
                });
            }
            let ordering = compare(field, field_type, attribute, single()?)?;
            Ok(match op {
                Op::Gt => ordering == Ordering::Greater,
                Op::Gte => ordering != Ordering::Less,
                Op::Lt => ordering == Ordering::Less,
                Op::Lte => ordering != Ordering::Greater,
                _ => unreachable!(),
            })
        }

        Op::In | Op::NotIn => {
            if values.is_empty() {
                return Err(RuleError::MalformedOperator {
                    field: field.to_owned(),
                    op,
                });
            }
            let mut found = false;
            for value in values {
                if compare(field, field_type, attribute, value)? == Ordering::Equal {
                    found = true;
                    break;
                }
            }
            Ok(found == (op == Op::In))
        }

        Op::Like | Op::NotLike => {
            if field_type != FieldType::String {
                return Err(RuleError::MalformedOperator {
                    field: field.to_owned(),
                    op,
                });
            }
            let text = attribute
                .as_str()
                .ok_or_else(|| RuleError::TypeMismatch(field.to_owned()))?;
            let RuleValue::String(pattern) = single()? else {
                return Err(RuleError::TypeMismatch(field.to_owned()));
            };
            let matched = wildcard_match(text, pattern);
            Ok(matched == (op == Op::Like))
        }
    }
}

/// Compare a context attribute against a rule value under the field's declared type.
fn compare(
    field: &str,
    field_type: FieldType,
    attribute: &AttributeValue,
    value: &RuleValue,
) -> Result<Ordering, RuleError> {
    let mismatch = || RuleError::TypeMismatch(field.to_owned());

    match field_type {
        FieldType::String => match (attribute, value) {
            (AttributeValue::String(l), RuleValue::String(r)) => Ok(l.as_ref().cmp(r.as_str())),
            _ => Err(mismatch()),
        },
        FieldType::Int => {
            let l = as_int(attribute).ok_or_else(mismatch)?;
            let r = match value {
                RuleValue::Number(n) if n.fract() == 0.0 => *n as i64,
                _ => return Err(mismatch()),
            };
            Ok(l.cmp(&r))
        }
        FieldType::Float => match (attribute, value) {
            (AttributeValue::Number(l), RuleValue::Number(r)) => {
                l.partial_cmp(r).ok_or_else(mismatch)
            }
            _ => Err(mismatch()),
        },
        FieldType::Bool => match (attribute, value) {
            (AttributeValue::Boolean(l), RuleValue::Boolean(r)) => Ok(l.cmp(r)),
            _ => Err(mismatch()),
        },
        FieldType::Semver => {
            let l = attribute
                .as_str()
                .and_then(|s| Version::parse(s).ok())
                .ok_or_else(mismatch)?;
            let r = match value {
                RuleValue::String(s) => Version::parse(s).map_err(|_| mismatch())?,
                _ => return Err(mismatch()),
            };
            Ok(l.cmp(&r))
        }
    }
}

fn as_int(attribute: &AttributeValue) -> Option<i64> {
    match attribute {
        AttributeValue::Number(n) if n.fract() == 0.0 => Some(*n as i64),
        _ => None,
    }
}

/// Whole-string wildcard match where `*` matches any run of characters. No other metacharacters.
fn wildcard_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();

    let mut t = 0;
    let mut p = 0;
    // Position to backtrack to: pattern index after the last `*` and the text index it consumed.
    let mut restart: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == '*' {
            restart = Some((p + 1, t));
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            t += 1;
            p += 1;
        } else if let Some((rp, rt)) = restart {
            p = rp;
            t = rt + 1;
            restart = Some((rp, rt + 1));
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}
