use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::data::{DataSchema, Terms};
use crate::link::Form;

/// A property exposed by a Thing.
///
/// A property is a piece of state which can be read, written and, when
/// declared observable, pushed by the device whenever it changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyAffordance {
    /// The schema of the property value.
    #[serde(flatten)]
    pub schema: DataSchema,
    /// Whether the device notifies property changes on its own.
    #[serde(default, skip_serializing_if = "core::ops::Not::not")]
    pub observable: bool,
    /// Operations available on the property.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forms: Vec<Form>,
}

impl PropertyAffordance {
    /// Creates a [`PropertyAffordance`] from a [`DataSchema`].
    #[must_use]
    pub const fn new(schema: DataSchema) -> Self {
        Self {
            schema,
            observable: false,
            forms: Vec::new(),
        }
    }

    /// Marks the property as observable.
    #[must_use]
    pub const fn observable(mut self) -> Self {
        self.observable = true;
        self
    }

    /// Whether the property can only be read.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        self.schema.read_only
    }
}

/// An action a Thing can perform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionAffordance {
    /// Semantic annotations.
    #[serde(rename = "@type", default, skip_serializing_if = "Terms::is_empty")]
    pub semantic_types: Terms,
    /// Human-readable title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Schema of the action input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<DataSchema>,
    /// Schema of the action output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<DataSchema>,
    /// Whether the action leaves the device state untouched.
    #[serde(default, skip_serializing_if = "core::ops::Not::not")]
    pub safe: bool,
    /// Whether repeating the action yields the same result.
    #[serde(default, skip_serializing_if = "core::ops::Not::not")]
    pub idempotent: bool,
    /// Operations available on the action.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forms: Vec<Form>,
}

/// An event a Thing emits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventAffordance {
    /// Semantic annotations.
    #[serde(rename = "@type", default, skip_serializing_if = "Terms::is_empty")]
    pub semantic_types: Terms,
    /// Human-readable title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Schema of the data carried by each event occurrence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<DataSchema>,
    /// Operations available on the event.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forms: Vec<Form>,
}
