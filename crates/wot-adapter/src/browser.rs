use hashbrown::HashMap;

use mdns_sd::{ResolvedService, ServiceDaemon, ServiceEvent};

use tokio::task::JoinHandle;

use tracing::{debug, info, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::fetch::normalize_url;

/// The service type announced by Web of Things devices.
pub const SERVICE_TYPE: &str = "_wot._tcp.local.";

// The `TXT` key carrying the description path.
const PATH_KEY: &str = "path";
// The `TXT` key announcing a secure endpoint.
const TLS_KEY: &str = "tls";

/// A resolved network service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Host name.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Whether the endpoint is served over `TLS`.
    pub tls: bool,
    /// Path of the description on the host.
    pub path: String,
}

impl ServiceRecord {
    /// Creates a plain [`ServiceRecord`] serving its description at the root
    /// path.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
            path: String::new(),
        }
    }

    /// Marks the service as secure.
    #[must_use]
    pub const fn tls(mut self) -> Self {
        self.tls = true;
        self
    }

    /// Sets the description path.
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Returns the address of the description.
    ///
    /// The scheme follows the `TLS` flag, the trailing dot of a fully
    /// qualified host name is dropped and the address never ends with a
    /// slash.
    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        let host = self.host.strip_suffix('.').unwrap_or(&self.host);
        let separator = if self.path.is_empty() || self.path.starts_with('/') {
            ""
        } else {
            "/"
        };

        let url = format!("{scheme}://{host}:{}{separator}{}", self.port, self.path);
        normalize_url(&url).to_string()
    }

    fn from_resolved(service: &ResolvedService) -> Self {
        let properties = &service.txt_properties;
        Self {
            host: service.host.clone(),
            port: service.port,
            tls: properties.get_property_val_str(TLS_KEY) == Some("1"),
            path: properties
                .get_property_val_str(PATH_KEY)
                .unwrap_or_default()
                .to_string(),
        }
    }
}

/// A notification about a network service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceNotification {
    /// A service has been resolved.
    Up(ServiceRecord),
    /// A service has been withdrawn.
    Down(ServiceRecord),
}

/// A browser of network services.
pub trait ServiceBrowser: Send {
    /// Starts browsing, returning the receiver of [`ServiceNotification`]s.
    ///
    /// The receiver is closed once browsing stops.
    ///
    /// # Errors
    ///
    /// An error is returned when the browsing cannot start.
    fn start(&mut self) -> Result<flume::Receiver<ServiceNotification>>;

    /// Stops browsing. Stopping an idle browser has no effect.
    ///
    /// # Errors
    ///
    /// An error is returned when the browsing cannot be stopped.
    fn stop(&mut self) -> Result<()>;
}

/// A [`ServiceBrowser`] relying on `mDNS-SD`.
pub struct MdnsBrowser {
    daemon: ServiceDaemon,
    service_type: String,
    forwarder: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for MdnsBrowser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MdnsBrowser")
            .field("service_type", &self.service_type)
            .field("browsing", &self.forwarder.is_some())
            .finish_non_exhaustive()
    }
}

impl MdnsBrowser {
    /// Creates a [`MdnsBrowser`] for Web of Things devices.
    ///
    /// # Errors
    ///
    /// An error is returned when the `mDNS` daemon cannot be created.
    pub fn new() -> Result<Self> {
        Ok(Self {
            daemon: ServiceDaemon::new()?,
            service_type: SERVICE_TYPE.into(),
            forwarder: None,
        })
    }

    /// Sets the browsed service type.
    #[must_use]
    pub fn service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = service_type.into();
        self
    }
}

impl ServiceBrowser for MdnsBrowser {
    fn start(&mut self) -> Result<flume::Receiver<ServiceNotification>> {
        if self.forwarder.is_some() {
            return Err(Error::new(
                ErrorKind::Discovery,
                format!("Already browsing `{}`", self.service_type),
            ));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            Error::new(
                ErrorKind::Discovery,
                format!("No asynchronous runtime to browse services: {e}"),
            )
        })?;

        let events = self.daemon.browse(&self.service_type)?;
        let (sender, receiver) = flume::unbounded();

        self.forwarder = Some(runtime.spawn(forward_mdns_events(events, sender)));
        info!("Browsing `{}` services", self.service_type);

        Ok(receiver)
    }

    fn stop(&mut self) -> Result<()> {
        let Some(forwarder) = self.forwarder.take() else {
            return Ok(());
        };
        forwarder.abort();

        self.daemon.stop_browse(&self.service_type)?;
        info!("Stopped browsing `{}` services", self.service_type);
        Ok(())
    }
}

impl Drop for MdnsBrowser {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop browsing: {e}");
        }
        if let Err(e) = self.daemon.shutdown() {
            debug!("Failed to shut down the mDNS daemon: {e}");
        }
    }
}

async fn forward_mdns_events(
    events: mdns_sd::Receiver<ServiceEvent>,
    sender: flume::Sender<ServiceNotification>,
) {
    // Removals only carry the full name of the withdrawn service.
    let mut resolved: HashMap<String, ServiceRecord> = HashMap::new();

    while let Ok(event) = events.recv_async().await {
        let notification = match event {
            ServiceEvent::ServiceResolved(service) => {
                let record = ServiceRecord::from_resolved(&service);
                debug!("Resolved `{}` at {}", service.fullname, record.url());
                let _ = resolved.insert(service.fullname.clone(), record.clone());
                ServiceNotification::Up(record)
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                let Some(record) = resolved.remove(&fullname) else {
                    debug!("Unknown service `{fullname}` removed");
                    continue;
                };
                ServiceNotification::Down(record)
            }
            ServiceEvent::SearchStopped(service_type) => {
                debug!("Search for `{service_type}` stopped");
                break;
            }
            _ => continue,
        };

        if sender.send_async(notification).await.is_err() {
            debug!("Notification receiver dropped, stop forwarding");
            break;
        }
    }
}
