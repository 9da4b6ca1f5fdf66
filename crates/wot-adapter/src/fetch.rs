use std::sync::Arc;

use bytes::Bytes;

use reqwest::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};

use serde_json::Value;

use tokio::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cache::{CacheEntry, FingerprintCache, digest};
use crate::config::Authentication;
use crate::error::{Error, ErrorKind, Result};

/// Default window during which a cached description is served without
/// contacting its endpoint.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(5);

// Default number of retries for an unreachable endpoint.
const RETRIES: u32 = 5;
// Default time between two retries.
const RETRY_INTERVAL: Duration = Duration::from_millis(2000);

/// Removes a single trailing slash from an endpoint address.
#[must_use]
pub fn normalize_url(url: &str) -> &str {
    url.strip_suffix('/').unwrap_or(url)
}

/// Options for fetching a description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    /// Number of retries after the first failed attempt.
    pub retries: u32,
    /// Time between two attempts.
    pub retry_interval: Duration,
    /// Authentication data.
    pub authentication: Authentication,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchOptions {
    /// Creates [`FetchOptions`] with five retries, two seconds apart, and
    /// no authentication.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            retries: RETRIES,
            retry_interval: RETRY_INTERVAL,
            authentication: Authentication::NoSecurity,
        }
    }

    /// Sets the number of retries.
    #[must_use]
    pub const fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Sets the time between two attempts.
    #[must_use]
    pub const fn retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Sets the authentication data.
    #[must_use]
    pub fn authentication(mut self, authentication: Authentication) -> Self {
        self.authentication = authentication;
        self
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let _ = headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        match &self.authentication {
            Authentication::Jwt { token } => {
                let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
                    Error::new(
                        ErrorKind::InvalidRequest,
                        format!("Invalid bearer token: {e}"),
                    )
                })?;
                let _ = headers.insert(AUTHORIZATION, value);
            }
            // TODO: send credentials once basic and digest schemas are negotiated.
            Authentication::Basic { .. } | Authentication::Digest { .. } => {
                debug!("Authentication schema not supported yet, sending no credentials");
            }
            Authentication::NoSecurity => {}
        }

        Ok(headers)
    }
}

/// A fetched description.
#[derive(Debug, Clone)]
pub struct Fetched {
    /// The parsed description.
    pub description: Arc<Value>,
    /// Whether the description is the one already cached for the endpoint.
    pub from_cache: bool,
}

impl Fetched {
    fn cached(entry: &CacheEntry) -> Self {
        Self {
            description: Arc::clone(entry.description()),
            from_cache: true,
        }
    }
}

/// A description fetcher.
///
/// Every successful fetch is fingerprinted in a [`FingerprintCache`]: within
/// the freshness window an endpoint is not contacted at all, while a body
/// with the same digest as the cached one is neither parsed nor reported as
/// new.
///
/// Fetches to the same endpoint are serialized, fetches to distinct
/// endpoints run concurrently.
#[derive(Debug)]
pub struct Fetcher {
    client: Client,
    cache: FingerprintCache,
    freshness: Duration,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new(FingerprintCache::new())
    }
}

impl Fetcher {
    /// Creates a [`Fetcher`] on top of a [`FingerprintCache`].
    #[must_use]
    pub fn new(cache: FingerprintCache) -> Self {
        Self {
            client: Client::new(),
            cache,
            freshness: FRESHNESS_WINDOW,
        }
    }

    /// Sets the freshness window.
    #[must_use]
    pub const fn freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    /// Returns the [`FingerprintCache`].
    #[must_use]
    pub const fn cache(&self) -> &FingerprintCache {
        &self.cache
    }

    /// Fetches the description exposed at an endpoint.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::Connection`] when the endpoint is unreachable after all
    ///   retries or answers with an error status
    /// - [`ErrorKind::DescriptionParse`] when the body is not valid `JSON`,
    ///   in which case the cache is left untouched
    pub async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<Fetched> {
        let url = normalize_url(url);

        let slot = self.cache.slot(url).await;
        let mut entry = slot.lock().await;

        if let Some(cached) = entry.as_ref()
            && cached.is_fresh(self.freshness, Instant::now())
        {
            debug!("Description at {url} is fresh, serving it from cache");
            return Ok(Fetched::cached(cached));
        }

        let body = self.fetch_with_retries(url, options).await?;
        let digest = digest(&body);

        if let Some(cached) = entry.as_mut()
            && *cached.digest() == digest
        {
            debug!("Description at {url} did not change");
            cached.touch(Instant::now());
            return Ok(Fetched::cached(cached));
        }

        let description: Value = serde_json::from_slice(&body).map_err(|e| {
            Error::new(
                ErrorKind::DescriptionParse,
                format!("Invalid description at {url}: {e}"),
            )
        })?;
        let description = Arc::new(description);

        *entry = Some(CacheEntry::new(
            digest,
            Arc::clone(&description),
            Instant::now(),
        ));

        Ok(Fetched {
            description,
            from_cache: false,
        })
    }

    async fn fetch_with_retries(&self, url: &str, options: &FetchOptions) -> Result<Bytes> {
        let headers = options.headers()?;

        let mut attempt = 0;
        loop {
            match self.client.get(url).headers(headers.clone()).send().await {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        return Err(Error::new(
                            ErrorKind::Connection,
                            format!("Endpoint {url} answered with status {status}"),
                        ));
                    }
                    return response.bytes().await.map_err(|e| {
                        Error::new(
                            ErrorKind::Connection,
                            format!("Failed to read the body from {url}: {e}"),
                        )
                    });
                }
                Err(e) if attempt < options.retries => {
                    attempt += 1;
                    warn!(
                        "Failed to reach {url} ({e}), retry {attempt}/{} in {:?}",
                        options.retries, options.retry_interval
                    );
                    tokio::time::sleep(options.retry_interval).await;
                }
                Err(e) => {
                    return Err(Error::new(
                        ErrorKind::Connection,
                        format!("Unreachable endpoint {url}: {e}"),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::Value;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::time::Duration;

    use crate::config::Authentication;
    use crate::error::ErrorKind;
    use crate::tests::{LAMP, TdServer};

    use super::{FetchOptions, Fetcher, normalize_url};

    fn lamp() -> Value {
        serde_json::from_str(LAMP).unwrap()
    }

    fn options() -> FetchOptions {
        FetchOptions::new()
            .retries(0)
            .retry_interval(Duration::from_millis(10))
    }

    #[test]
    fn normalized_urls() {
        assert_eq!(normalize_url("http://h/lamp/"), "http://h/lamp");
        assert_eq!(normalize_url("http://h/lamp"), "http://h/lamp");
        assert_eq!(normalize_url("http://h//"), "http://h/");
    }

    #[tokio::test]
    async fn cached_within_window() {
        let server = TdServer::start(LAMP).await;
        let fetcher = Fetcher::default();
        let url = server.url("/lamp");

        let first = fetcher.fetch(&url, &options()).await.unwrap();
        assert!(!first.from_cache);
        assert_eq!(*first.description, lamp());

        // A trailing slash names the same endpoint.
        let second = fetcher.fetch(&format!("{url}/"), &options()).await.unwrap();
        assert!(second.from_cache);
        assert!(Arc::ptr_eq(&first.description, &second.description));

        assert_eq!(server.hits(), 1);
        assert_eq!(fetcher.cache().len().await, 1);
    }

    #[tokio::test]
    async fn unchanged_after_window() {
        let server = TdServer::start(LAMP).await;
        let fetcher = Fetcher::default().freshness(Duration::from_millis(50));
        let url = server.url("/lamp");

        let first = fetcher.fetch(&url, &options()).await.unwrap();
        let fetched_at = fetcher.cache().entry(&url).await.unwrap().fetched_at();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = fetcher.fetch(&url, &options()).await.unwrap();
        assert!(second.from_cache);
        assert!(Arc::ptr_eq(&first.description, &second.description));
        assert_eq!(server.hits(), 2);

        // The identical fetch restarts the window.
        assert!(fetcher.cache().entry(&url).await.unwrap().fetched_at() > fetched_at);
    }

    #[tokio::test]
    async fn changed_after_window() {
        let server = TdServer::start(LAMP).await;
        let fetcher = Fetcher::default().freshness(Duration::from_millis(50));
        let url = server.url("/lamp");

        let first = fetcher.fetch(&url, &options()).await.unwrap();

        server.set_body(r#"{ "title": "lamp", "id": "t2" }"#);

        // Still inside the window.
        assert!(fetcher.fetch(&url, &options()).await.unwrap().from_cache);

        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = fetcher.fetch(&url, &options()).await.unwrap();
        assert!(!second.from_cache);
        assert!(!Arc::ptr_eq(&first.description, &second.description));
        assert_eq!(second.description["id"], "t2");
    }

    #[tokio::test]
    async fn parse_error_keeps_cache() {
        let server = TdServer::start(LAMP).await;
        let fetcher = Fetcher::default().freshness(Duration::ZERO);
        let url = server.url("/lamp");

        let first = fetcher.fetch(&url, &options()).await.unwrap();

        server.set_body("{ not json");
        let error = fetcher.fetch(&url, &options()).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::DescriptionParse);

        let entry = fetcher.cache().entry(&url).await.unwrap();
        assert!(Arc::ptr_eq(entry.description(), &first.description));

        server.set_body(LAMP);
        assert!(fetcher.fetch(&url, &options()).await.unwrap().from_cache);
    }

    #[tokio::test]
    async fn parse_error_on_first_fetch() {
        let server = TdServer::start("<html></html>").await;
        let fetcher = Fetcher::default();
        let url = server.url("/lamp");

        let error = fetcher.fetch(&url, &options()).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::DescriptionParse);
        assert!(fetcher.cache().is_empty().await);
    }

    #[tokio::test]
    async fn error_status_is_not_retried() {
        let server = TdServer::start(LAMP).await;
        server.set_status(404);
        let fetcher = Fetcher::default();

        let error = fetcher
            .fetch(&server.url("/missing"), &FetchOptions::new().retries(3))
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Connection);
        assert_eq!(server.hits(), 1);
    }

    #[tokio::test]
    async fn retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));

        // Accepts every connection and closes it without answering.
        let counter = Arc::clone(&attempts);
        let _server = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let _ = counter.fetch_add(1, Ordering::SeqCst);
                let mut buffer = [0u8; 1024];
                let _ = stream.read(&mut buffer).await;
            }
        });

        let fetcher = Fetcher::default();
        let error = fetcher
            .fetch(
                &format!("http://{address}/lamp"),
                &FetchOptions::new()
                    .retries(3)
                    .retry_interval(Duration::from_millis(10)),
            )
            .await
            .unwrap_err();

        assert_eq!(error.kind(), ErrorKind::Connection);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert!(fetcher.cache().is_empty().await);
    }

    #[tokio::test]
    async fn authentication_headers() {
        let server = TdServer::start(LAMP).await;
        let fetcher = Fetcher::default().freshness(Duration::ZERO);

        let _ = fetcher
            .fetch(
                &server.url("/lamp"),
                &options().authentication(Authentication::Jwt {
                    token: "secret".into(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(server.authorization().as_deref(), Some("Bearer secret"));
        assert_eq!(server.accept().as_deref(), Some("application/json"));

        let _ = fetcher.fetch(&server.url("/lamp"), &options()).await.unwrap();
        assert_eq!(server.authorization(), None);
    }

    #[tokio::test]
    async fn same_endpoint_fetches_are_serialized() {
        let server = TdServer::start(LAMP).await;
        let fetcher = Fetcher::default();
        let url = server.url("/lamp");
        let options = options();

        let (first, second) = tokio::join!(
            fetcher.fetch(&url, &options),
            fetcher.fetch(&url, &options)
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(server.hits(), 1);
        assert!(first.from_cache != second.from_cache);
        assert!(Arc::ptr_eq(&first.description, &second.description));
    }

    #[tokio::test]
    async fn distinct_endpoints() {
        let server = TdServer::start(LAMP).await;
        let fetcher = Fetcher::default();
        let (lamp, door) = (server.url("/lamp"), server.url("/door"));
        let options = options();

        let (lamp, door) = tokio::join!(
            fetcher.fetch(&lamp, &options),
            fetcher.fetch(&door, &options)
        );

        assert!(!lamp.unwrap().from_cache);
        assert!(!door.unwrap().from_cache);
        assert_eq!(server.hits(), 2);
        assert_eq!(fetcher.cache().len().await, 2);
    }
}
