//! Field keys and values shared by every store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

/// Write policy of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    /// Never written by the sync engine.
    ReadOnly,
    /// Settable only while the owning object has no identifier.
    CreateOnly,
    /// New values must extend the loaded value.
    AppendOnly,
    /// No restriction.
    Free,
}

/// The closed set of fields of one object type on one side.
///
/// Implemented by a plain `enum` per object type, so field access is
/// checked at compile time instead of by name.
pub trait FieldKey:
    Copy + Eq + Ord + Hash + fmt::Debug + Send + Sync + 'static
{
    /// All fields, in declaration order.
    fn all() -> &'static [Self];

    /// Wire/column name of the field.
    fn name(&self) -> &'static str;

    /// Write policy.
    fn access(&self) -> Access {
        Access::Free
    }

    /// Reserved value the store needs to actually clear this field.
    ///
    /// Some remote APIs ignore empty values on update; for those fields a
    /// sentinel is sent instead and hidden again on read.
    fn clear_sentinel(&self) -> Option<FieldValue> {
        None
    }

    /// Whether the store computes this field itself (totals, counters).
    /// Such fields are ignored when verifying a write.
    fn server_generated(&self) -> bool {
        false
    }

    /// Look a field up by its name.
    fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|key| key.name() == name)
    }
}

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum FieldValue {
    /// No value.
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Time(DateTime<Utc>),
    /// Unordered set of strings (tags, groups).
    List(Vec<String>),
}

impl FieldValue {
    /// Create a text value.
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    /// Shared `Null` for lookups that need a reference.
    pub fn null_ref() -> &'static FieldValue {
        static NULL: FieldValue = FieldValue::Null;
        &NULL
    }

    /// `Null`, empty text and empty lists are all empty.
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Text(s) => s.is_empty(),
            FieldValue::List(items) => items.is_empty(),
            _ => false,
        }
    }

    /// Text content, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Loose equality used for change detection.
    ///
    /// Two empty values are equal regardless of representation, numbers
    /// compare numerically and timestamps compare with their RFC 3339 text.
    pub fn equivalent(&self, other: &FieldValue) -> bool {
        if self.is_empty() && other.is_empty() {
            return true;
        }
        match (self, other) {
            (FieldValue::Int(a), FieldValue::Float(b))
            | (FieldValue::Float(b), FieldValue::Int(a)) => (*a as f64) == *b,
            (FieldValue::Time(t), FieldValue::Text(s))
            | (FieldValue::Text(s), FieldValue::Time(t)) => DateTime::parse_from_rfc3339(s)
                .map(|parsed| parsed.with_timezone(&Utc) == *t)
                .unwrap_or(false),
            (FieldValue::List(a), FieldValue::List(b)) => {
                a.len() == b.len() && a.iter().all(|item| b.contains(item))
            }
            (a, b) => a == b,
        }
    }

    /// Whether this persisted value contains everything `intended` asked for.
    pub fn covers(&self, intended: &FieldValue) -> bool {
        match (self, intended) {
            (FieldValue::List(have), FieldValue::List(want)) => {
                want.iter().all(|item| have.contains(item))
            }
            _ => self.equivalent(intended),
        }
    }

    /// Convert to a JSON value for HTTP payloads.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Int(i) => Value::from(*i),
            FieldValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::Time(t) => Value::String(t.to_rfc3339()),
            FieldValue::List(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
        }
    }

    /// Convert from a JSON value found in an HTTP payload.
    pub fn from_json(value: &serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => FieldValue::Null,
            Value::Bool(b) => FieldValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => FieldValue::Int(i),
                None => n.as_f64().map(FieldValue::Float).unwrap_or_default(),
            },
            Value::String(s) => FieldValue::Text(s.clone()),
            Value::Array(items) => FieldValue::List(
                items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
            ),
            Value::Object(_) => FieldValue::Text(value.to_string()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("(null)"),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Int(i) => write!(f, "{}", i),
            FieldValue::Float(x) => write!(f, "{}", x),
            FieldValue::Text(s) => write!(f, "{:?}", s),
            FieldValue::Time(t) => f.write_str(&t.to_rfc3339()),
            FieldValue::List(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}
