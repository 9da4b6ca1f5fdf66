use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

use tokio::sync::Mutex;

use tracing::{debug, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::fetch::FetchOptions;

// Default time between two consecutive reads of a polled property, in seconds.
const DEFAULT_POLL_INTERVAL: u64 = 5;
// Default number of retries for an unreachable endpoint.
const DEFAULT_RETRIES: u32 = 5;
// Default time between two retries, in seconds.
const DEFAULT_RETRY_INTERVAL: u64 = 2;

const fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL
}

const fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

const fn default_retry_interval() -> u64 {
    DEFAULT_RETRY_INTERVAL
}

/// Authentication data used to reach a device endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "schema", rename_all = "lowercase")]
pub enum Authentication {
    /// No authentication.
    #[default]
    #[serde(rename = "nosec")]
    NoSecurity,
    /// A `JSON Web Token` sent as a bearer token.
    Jwt {
        /// The token.
        token: String,
    },
    /// Basic authentication.
    Basic {
        /// User name.
        user: String,
        /// User password.
        password: String,
    },
    /// Digest authentication.
    Digest {
        /// Digest data.
        digest: String,
    },
}

/// A stored device endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Endpoint address, without a trailing slash.
    pub url: String,
    /// Authentication data, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<Authentication>,
}

impl EndpointConfig {
    /// Creates an [`EndpointConfig`].
    #[must_use]
    pub fn new(url: &str, authentication: Option<Authentication>) -> Self {
        Self {
            url: crate::fetch::normalize_url(url).into(),
            authentication,
        }
    }
}

/// The persisted adapter configuration.
///
/// Intervals are expressed in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterConfig {
    /// All known device endpoints.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    /// Time between two consecutive reads of a polled property.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Number of retries for an unreachable endpoint.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Time between two retries.
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,
    /// Whether discovery keeps running outside pairing mode.
    #[serde(default)]
    pub continuous_discovery: bool,
    /// Whether observable properties are observed instead of polled.
    #[serde(default)]
    pub use_observable: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            retries: DEFAULT_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            continuous_discovery: false,
            use_observable: false,
        }
    }
}

impl AdapterConfig {
    /// Returns the property polling interval.
    ///
    /// A zero interval is replaced by the default one.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        if self.poll_interval == 0 {
            warn!("Poll interval cannot be zero, using {DEFAULT_POLL_INTERVAL}s");
            return Duration::from_secs(DEFAULT_POLL_INTERVAL);
        }
        Duration::from_secs(self.poll_interval)
    }

    /// Builds the [`FetchOptions`] for an endpoint from the retry policy.
    #[must_use]
    pub fn fetch_options(&self, authentication: Option<Authentication>) -> FetchOptions {
        FetchOptions::new()
            .retries(self.retries)
            .retry_interval(Duration::from_secs(self.retry_interval))
            .authentication(authentication.unwrap_or_default())
    }

    /// Adds an endpoint, replacing the stored one with the same address.
    pub fn add_endpoint(&mut self, endpoint: EndpointConfig) {
        if let Some(stored) = self.endpoints.iter_mut().find(|e| e.url == endpoint.url) {
            *stored = endpoint;
        } else {
            self.endpoints.push(endpoint);
        }
    }

    /// Removes the endpoint with the given address.
    ///
    /// Returns `false` when the endpoint was not stored.
    pub fn remove_endpoint(&mut self, url: &str) -> bool {
        let url = crate::fetch::normalize_url(url);
        let length = self.endpoints.len();
        self.endpoints.retain(|e| e.url != url);
        length != self.endpoints.len()
    }

    /// Checks whether an endpoint is stored.
    #[must_use]
    pub fn contains(&self, url: &str) -> bool {
        self.endpoint(url).is_some()
    }

    /// Returns the stored endpoint with the given address.
    #[must_use]
    pub fn endpoint(&self, url: &str) -> Option<&EndpointConfig> {
        let url = crate::fetch::normalize_url(url);
        self.endpoints.iter().find(|e| e.url == url)
    }
}

/// A configuration storage.
///
/// A storage must be opened before loading or saving a configuration.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Opens the storage.
    async fn open(&mut self) -> Result<()>;

    /// Closes the storage.
    async fn close(&mut self) -> Result<()>;

    /// Loads the stored [`AdapterConfig`].
    ///
    /// An empty storage yields the default configuration.
    async fn load_config(&self) -> Result<AdapterConfig>;

    /// Saves an [`AdapterConfig`], replacing the stored one.
    async fn save_config(&mut self, config: &AdapterConfig) -> Result<()>;
}

fn closed_error() -> Error {
    Error::new(ErrorKind::Storage, "The configuration storage is not open.")
}

/// A configuration storage backed by a `JSON` file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    opened: bool,
}

impl JsonFileStore {
    /// Creates a [`JsonFileStore`] for the file at the given path.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            opened: false,
        }
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConfigStore for JsonFileStore {
    async fn open(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.opened = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.opened = false;
        Ok(())
    }

    async fn load_config(&self) -> Result<AdapterConfig> {
        if !self.opened {
            return Err(closed_error());
        }

        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No configuration at {}, using defaults", self.path.display());
                return Ok(AdapterConfig::default());
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&data).map_err(|e| {
            Error::new(
                ErrorKind::Storage,
                format!("Invalid configuration at {}: {e}", self.path.display()),
            )
        })
    }

    async fn save_config(&mut self, config: &AdapterConfig) -> Result<()> {
        if !self.opened {
            return Err(closed_error());
        }

        let data = serde_json::to_vec_pretty(config)?;

        // Write aside and rename, so a crash never leaves a truncated file.
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    config: Option<AdapterConfig>,
    opened: bool,
    fail_saves: bool,
}

/// An in-memory configuration storage.
///
/// Clones share the same state, so a clone kept aside can inspect what an
/// adapter has persisted.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// Creates an empty [`MemoryStore`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a [`MemoryStore`] holding the given configuration.
    #[must_use]
    pub fn with_config(config: AdapterConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                config: Some(config),
                ..MemoryState::default()
            })),
        }
    }

    /// Returns the stored configuration.
    pub async fn config(&self) -> Option<AdapterConfig> {
        self.state.lock().await.config.clone()
    }

    /// Makes every following save fail.
    pub async fn fail_saves(&self, fail: bool) {
        self.state.lock().await.fail_saves = fail;
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn open(&mut self) -> Result<()> {
        self.state.lock().await.opened = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.state.lock().await.opened = false;
        Ok(())
    }

    async fn load_config(&self) -> Result<AdapterConfig> {
        let state = self.state.lock().await;
        if !state.opened {
            return Err(closed_error());
        }
        Ok(state.config.clone().unwrap_or_default())
    }

    async fn save_config(&mut self, config: &AdapterConfig) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.opened {
            return Err(closed_error());
        }
        if state.fail_saves {
            return Err(Error::new(ErrorKind::Storage, "Saves are disabled."));
        }
        state.config = Some(config.clone());
        Ok(())
    }
}
