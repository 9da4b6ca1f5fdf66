use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// All data types a schema can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// A `true` or `false` value.
    Boolean,
    /// A whole number.
    Integer,
    /// A floating point number.
    Number,
    /// A text value.
    String,
    /// A map of named values.
    Object,
    /// A sequence of values.
    Array,
    /// The `null` value.
    Null,
}

impl DataType {
    const fn name(self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::String => "string",
            Self::Object => "object",
            Self::Array => "array",
            Self::Null => "null",
        }
    }
}

impl core::fmt::Display for DataType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.name().fmt(f)
    }
}

// A term list is written either as a single string or as an array.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

/// A list of `JSON-LD` terms.
///
/// Fields such as `@type` or `op` accept both a single string and an array of
/// strings. Both forms decode into the same list, and a list with a single
/// term encodes back into a plain string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "OneOrMany", into = "OneOrMany")]
pub struct Terms(Vec<String>);

impl From<OneOrMany> for Terms {
    fn from(value: OneOrMany) -> Self {
        match value {
            OneOrMany::One(term) => Self(vec![term]),
            OneOrMany::Many(terms) => Self(terms),
        }
    }
}

impl From<Terms> for OneOrMany {
    fn from(mut value: Terms) -> Self {
        if value.0.len() == 1 {
            Self::One(value.0.remove(0))
        } else {
            Self::Many(value.0)
        }
    }
}

impl Terms {
    /// Creates an empty [`Terms`].
    #[must_use]
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    /// Creates [`Terms`] from a sequence of terms.
    #[must_use]
    pub const fn new(terms: Vec<String>) -> Self {
        Self(terms)
    }

    /// Checks whether the given term is present.
    #[must_use]
    pub fn contains(&self, term: &str) -> bool {
        self.0.iter().any(|t| t == term)
    }

    /// Checks whether there are no terms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the terms as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        self.0.as_slice()
    }

    /// Returns an iterator over the terms.
    pub fn iter(&self) -> core::slice::Iter<'_, String> {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a Terms {
    type Item = &'a String;
    type IntoIter = core::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// The description of a value exchanged with a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSchema {
    /// Semantic annotations.
    #[serde(rename = "@type", default, skip_serializing_if = "Terms::is_empty")]
    pub semantic_types: Terms,
    /// Human-readable title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Data type of the value.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
    /// Unit of measure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Lower bound of a numeric value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    /// Upper bound of a numeric value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    /// The only values allowed.
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enumeration: Option<Vec<Value>>,
    /// Whether the value can only be read.
    #[serde(default, skip_serializing_if = "core::ops::Not::not")]
    pub read_only: bool,
    /// Whether the value can only be written.
    #[serde(default, skip_serializing_if = "core::ops::Not::not")]
    pub write_only: bool,
}

impl DataSchema {
    /// Creates a [`DataSchema`] of the given [`DataType`].
    #[must_use]
    pub fn of(data_type: DataType) -> Self {
        Self {
            data_type: Some(data_type),
            ..Self::default()
        }
    }
}
