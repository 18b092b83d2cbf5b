//! Typed key contracts.
//!
//! Every stage declares the keys it reads and writes together with the JSON
//! type it expects for each key. Producers and consumers are matched by key
//! at build time and their types are checked against each other.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Declared key-to-type mapping of a stage's inputs or outputs.
pub type Contract = BTreeMap<String, ValueType>;

/// The JSON type a contract expects for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// Any JSON value.
    #[default]
    Any,
    /// `null`.
    Null,
    /// `true` or `false`.
    Bool,
    /// A number without a fractional part.
    Integer,
    /// Any number.
    Number,
    /// A string.
    String,
    /// An array.
    Array,
    /// An object.
    Object,
}

impl ValueType {
    /// Returns the most specific type of a value.
    #[must_use]
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Bool,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Integer,
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }

    /// Checks whether a runtime value satisfies this type.
    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::Number => value.is_number(),
            other => other == Self::of(value),
        }
    }

    /// Checks at build time whether a declared `provided` type can feed an
    /// input declared as `self`.
    ///
    /// An `Any` producer is accepted here; its values are checked against the
    /// consumer contract when the consumer is dispatched.
    #[must_use]
    pub fn accepts(self, provided: Self) -> bool {
        match (self, provided) {
            (Self::Any, _) | (_, Self::Any) | (Self::Number, Self::Integer) => true,
            (expected, provided) => expected == provided,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Any => "any",
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        };
        f.write_str(name)
    }
}

impl FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" => Ok(Self::Any),
            "null" => Ok(Self::Null),
            "bool" | "boolean" => Ok(Self::Bool),
            "integer" | "int" => Ok(Self::Integer),
            "number" | "float" => Ok(Self::Number),
            "string" | "str" => Ok(Self::String),
            "array" | "list" => Ok(Self::Array),
            "object" | "map" => Ok(Self::Object),
            other => Err(format!("unknown value type '{other}'")),
        }
    }
}
