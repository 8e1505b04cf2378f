use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::Str;

/// Type alias for a HashMap representing the request context: attribute name to scalar value.
///
/// # Examples
/// ```
/// # use stratum_core::{Attributes, AttributeValue};
/// let context = [
///     ("age".to_owned(), 25.0.into()),
///     ("country".to_owned(), "US".into()),
///     ("premium".to_owned(), true.into()),
/// ].into_iter().collect::<Attributes>();
/// ```
pub type Attributes = HashMap<String, AttributeValue>;

/// Enum representing possible values of a context attribute.
///
/// Conveniently implements `From` conversions for `String`, `&str`, `f64`, and `bool` types.
#[derive(Debug, Serialize, Deserialize, PartialEq, PartialOrd, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    #[from(ignore)]
    String(Str),
    /// A numerical value. Integer fields are numbers without a fractional part.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A null value or absence of value.
    Null,
}

impl From<String> for AttributeValue {
    fn from(value: String) -> AttributeValue {
        AttributeValue::String(value.into())
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> AttributeValue {
        AttributeValue::String(value.into())
    }
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        if let AttributeValue::String(s) = self {
            Some(s.as_ref())
        } else {
            None
        }
    }
}
