//! The `wot-adapter` library crate mirrors Web of Things devices into a
//! host application.
//!
//! A device is considered a Web of Things device if it publishes a Thing
//! Description, a `JSON` document listing its properties, actions and
//! events, at an `HTTP` address.
//!
//! Core functionalities of this crate include:
//!
//! - Fetching Thing Descriptions, with retries and a content fingerprint
//!   cache which spares the re-registration of unchanged devices
//! - Discovering devices announced through `mDNS-SD` on the local network,
//!   either continuously or within a pairing window
//! - Materializing every described Thing as a device, keeping its
//!   properties synchronized by observation or polling
//! - Persisting the endpoints of loaded devices so they are reloaded at
//!   the next start
//!
//! `wot-adapter` relies on `tokio` as asynchronous executor. Descriptions
//! are fetched concurrently, and each synchronized property runs in its
//! own task.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// Actions requested to a device along with their statuses.
pub mod action;
/// An adapter orchestrating devices, discovery and configuration.
pub mod adapter;
/// Network service browsing.
pub mod browser;
/// A cache of fetched descriptions identified by their content digest.
pub mod cache;
/// Adapter configuration and its storage.
pub mod config;
/// Device data along with its synchronization.
pub mod device;
/// A listener for devices announced on the local network.
pub mod discovery;
/// Error management.
pub mod error;
/// All events notified to the host.
pub mod events;
/// Description fetching.
pub mod fetch;
/// Discovery lifecycle driven by pairing and continuous demands.
pub mod lifecycle;
/// The interface to consumed Things.
pub mod thing;
