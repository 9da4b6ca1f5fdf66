//! The description interface among a Web of Things device and its consumers.
//!
//! This crate provides APIs to decode and encode a Thing Description (TD),
//! the self-describing document a device exposes to announce:
//!
//! - Its identity, title, semantic annotations and links.
//! - The properties it exposes. A property is a piece of state that can be
//!   read, written or observed.
//! - The actions it can perform. An action may carry an input and produce an
//!   output.
//! - The events it emits. An event is pushed by the device whenever the
//!   associated condition occurs.
//!
//! Only the fields needed to mirror a device into a host model are
//! interpreted. Unknown fields are ignored during decoding, so any valid TD
//! can be read without failing.
//!
//! This crate can be compiled for both `std` and `no_std` environments.
//! The default `preserve_order` feature keeps affordances in declaration
//! order and requires `std`. Without it, decoded objects are sorted by
//! name.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![no_std]

extern crate alloc;

/// Interaction affordances of a Thing.
pub mod affordance;
/// Data schemas and semantic annotations.
pub mod data;
/// Links and forms.
pub mod link;
/// The Thing Description document.
pub mod thing;

/// The `JSON-LD` context of a version 1.0 Thing Description.
pub const TD_CONTEXT: &str = "https://www.w3.org/2019/wot/td/v1";

/// An ordered map from affordance names to their definitions.
///
/// Declaration order is preserved, so affordances are mirrored in the same
/// order they appear in the document.
pub type Map<V> = indexmap::IndexMap<alloc::string::String, V, hashbrown::DefaultHashBuilder>;

#[cfg(test)]
pub(crate) fn serialize<T: serde::Serialize>(value: T) -> serde_json::Value {
    serde_json::to_value(value).unwrap()
}

#[cfg(test)]
pub(crate) fn deserialize<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> T {
    serde_json::from_value(value).unwrap()
}
