use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::Map;
use crate::data::Terms;

/// A link to a resource related to a Thing.
///
/// Members other than the interpreted ones are kept as they are, so a link
/// is encoded back with its original content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Target of the link.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    /// Relation type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rel: Option<String>,
    /// Media type of the target resource.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Overrides the link context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor: Option<String>,
    /// Any other member, such as `hreflang` or `sizes`.
    #[serde(flatten)]
    pub members: Map<Value>,
}

impl Link {
    /// Creates a [`Link`] to the given target.
    #[must_use]
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            href: Some(href.into()),
            ..Self::default()
        }
    }

    /// Sets the relation type.
    #[must_use]
    #[inline]
    pub fn rel(mut self, rel: impl Into<String>) -> Self {
        self.rel = Some(rel.into());
        self
    }
}

// Decodes a list of links, skipping the entries which are not links.
pub(crate) fn deserialize_links<'de, D>(deserializer: D) -> Result<Vec<Link>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries = Vec::<Value>::deserialize(deserializer)?;
    Ok(entries
        .into_iter()
        .filter_map(|entry| Link::deserialize(entry).ok())
        .collect())
}

/// A form describing how to perform an operation on an affordance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Form {
    /// Target of the operation.
    pub href: String,
    /// Media type of the exchanged payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Operation types, such as `readproperty` or `invokeaction`.
    #[serde(default, skip_serializing_if = "Terms::is_empty")]
    pub op: Terms,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::{deserialize, serialize};

    use super::{Form, Link};

    #[test]
    fn link() {
        let link: Link = deserialize(json!({
            "href": "http://h/lamp/manual",
            "rel": "help",
            "type": "text/html",
        }));

        assert_eq!(
            link,
            Link {
                media_type: Some("text/html".into()),
                ..Link::new("http://h/lamp/manual").rel("help")
            }
        );
        assert_eq!(deserialize::<Link>(serialize(&link)), link);
    }

    #[test]
    fn link_keeps_every_member() {
        let value = json!({
            "href": "/m",
            "rel": "help",
            "hreflang": "en",
            "sizes": "16x16",
        });

        let link: Link = deserialize(value.clone());
        assert_eq!(link.members["hreflang"], json!("en"));
        assert_eq!(serialize(&link), value);

        // A link without target is still a link.
        let link: Link = deserialize(json!({ "rel": "alternate" }));
        assert_eq!(link.href, None);
        assert_eq!(link.rel.as_deref(), Some("alternate"));
    }

    #[test]
    fn form_with_single_operation() {
        let form: Form = deserialize(json!({
            "href": "http://h/lamp/properties/on",
            "contentType": "application/json",
            "op": "readproperty",
        }));

        assert!(form.op.contains("readproperty"));
        assert_eq!(form.content_type.as_deref(), Some("application/json"));
    }
}
