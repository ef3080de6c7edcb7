//! Host scripting value model.
//!
//! The host hands every argument over as text and expects every result back as
//! text. [`Value`] is the typed form in between: the five shapes the host's
//! scripting language can round-trip through the codec.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A host scripting value.
///
/// Sequences nest arbitrarily. Serializes through `serde` as the matching JSON
/// shape (number, bool, string, null, array) so values can be carried in
/// configuration and tooling without going through the wire codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// 64-bit IEEE 754 number. The host has no integer type.
    Number(f64),
    /// Boolean literal.
    Boolean(bool),
    /// UTF-8 text.
    Text(String),
    /// Absence of a value (`nil`, `objNull`, `any`, ...).
    Null,
    /// Ordered, possibly nested, list of values.
    Sequence(Vec<Value>),
}

impl Value {
    /// Returns the runtime shape of this value.
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Number(_) => ValueKind::Number,
            Self::Boolean(_) => ValueKind::Boolean,
            Self::Text(_) => ValueKind::Text,
            Self::Null => ValueKind::Null,
            Self::Sequence(_) => ValueKind::Sequence,
        }
    }

    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Self::Sequence(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Self::Null, Into::into)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::Sequence(items.into_iter().map(Into::into).collect())
    }
}

/// Converts a JSON document into a host value.
///
/// Objects have no host counterpart and are carried as their JSON text.
impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Boolean(b),
            serde_json::Value::Number(n) => n.as_f64().map_or(Self::Null, Self::Number),
            serde_json::Value::String(s) => Self::Text(s),
            serde_json::Value::Array(items) => {
                Self::Sequence(items.into_iter().map(Self::from).collect())
            }
            obj @ serde_json::Value::Object(_) => Self::Text(obj.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// ValueKind / ParamType
// ---------------------------------------------------------------------------

/// Runtime shape of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Number,
    Boolean,
    Text,
    Null,
    Sequence,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Text => "text",
            Self::Null => "null",
            Self::Sequence => "sequence",
        };
        f.write_str(name)
    }
}

/// Declared shape of an operation parameter.
///
/// Compatibility is strict: [`ParamType::Any`] accepts every value, every
/// other variant accepts exactly the matching [`ValueKind`]. `Null` is only
/// accepted by `Any`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Number,
    Boolean,
    Text,
    Sequence,
    Any,
}

impl ParamType {
    /// Returns `true` if `value` may be bound to a parameter of this type.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value.kind()),
            (Self::Any, _)
                | (Self::Number, ValueKind::Number)
                | (Self::Boolean, ValueKind::Boolean)
                | (Self::Text, ValueKind::Text)
                | (Self::Sequence, ValueKind::Sequence)
        )
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Text => "text",
            Self::Sequence => "sequence",
            Self::Any => "any",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
