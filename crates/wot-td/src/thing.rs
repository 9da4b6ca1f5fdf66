use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Map;
use crate::affordance::{ActionAffordance, EventAffordance, PropertyAffordance};
use crate::data::Terms;
use crate::link::{Link, deserialize_links};

/// A Thing Description.
///
/// It describes a device identity together with all the properties,
/// actions and events exposed by the device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThingDescription {
    /// The `JSON-LD` context.
    #[serde(rename = "@context", skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    /// Thing identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Human-readable title.
    #[serde(default)]
    pub title: String,
    /// Semantic annotations.
    #[serde(rename = "@type", default, skip_serializing_if = "Terms::is_empty")]
    pub semantic_types: Terms,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Base address used to resolve relative form targets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    /// Related resources. Entries which are not links are skipped.
    #[serde(
        default,
        deserialize_with = "deserialize_links",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub links: Vec<Link>,
    /// All properties, in declaration order.
    #[serde(default, skip_serializing_if = "indexmap::IndexMap::is_empty")]
    pub properties: Map<PropertyAffordance>,
    /// All actions, in declaration order.
    #[serde(default, skip_serializing_if = "indexmap::IndexMap::is_empty")]
    pub actions: Map<ActionAffordance>,
    /// All events, in declaration order.
    #[serde(default, skip_serializing_if = "indexmap::IndexMap::is_empty")]
    pub events: Map<EventAffordance>,
    /// Names of the security definitions in force.
    #[serde(default, skip_serializing_if = "Terms::is_empty")]
    pub security: Terms,
}

impl ThingDescription {
    /// Creates a [`ThingDescription`] with the given title.
    #[must_use]
    #[inline]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    /// Sets the Thing identifier.
    #[must_use]
    #[inline]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Adds a property.
    #[must_use]
    #[inline]
    pub fn property(mut self, name: impl Into<String>, property: PropertyAffordance) -> Self {
        let _ = self.properties.insert(name.into(), property);
        self
    }

    /// Adds an action.
    #[must_use]
    #[inline]
    pub fn action(mut self, name: impl Into<String>, action: ActionAffordance) -> Self {
        let _ = self.actions.insert(name.into(), action);
        self
    }

    /// Adds an event.
    #[must_use]
    #[inline]
    pub fn event(mut self, name: impl Into<String>, event: EventAffordance) -> Self {
        let _ = self.events.insert(name.into(), event);
        self
    }

    /// Decodes a [`ThingDescription`] from a `JSON` value.
    ///
    /// # Errors
    ///
    /// An error is returned when the value is not an object or when one of
    /// the interpreted fields has an invalid shape.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(value)
    }

    /// Returns the Thing identifier when present and not empty.
    #[must_use]
    pub fn identifier(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}
