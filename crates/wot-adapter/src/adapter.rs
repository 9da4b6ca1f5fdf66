use std::sync::Arc;

use hashbrown::HashSet;

use serde_json::Value;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Duration;

use tracing::{debug, error, info, warn};

use wot_td::thing::ThingDescription;

use crate::browser::ServiceBrowser;
use crate::config::{AdapterConfig, Authentication, ConfigStore, EndpointConfig};
use crate::device::{Device, Devices, SyncSettings};
use crate::discovery::{DiscoveryEvent, MulticastListener};
use crate::error::{Error, ErrorKind, Result};
use crate::events::{HostEvent, Notifier};
use crate::fetch::{Fetcher, normalize_url};
use crate::lifecycle::DiscoveryController;
use crate::thing::ThingConsumer;

// Derives a device identifier from the address of its description.
fn device_id_from_url(url: &str) -> String {
    url.replace([':', '/'], "-")
}

/// An adapter mirroring Web of Things devices into a host.
///
/// The main functionalities include:
///
/// - Loading devices from their description addresses, either stored in
///   the configuration or discovered on the local network.
/// - Keeping the mirrored devices synchronized once the host saves them.
/// - Running discovery continuously or for a pairing window.
/// - Notifying the host about devices, property changes, events and action
///   statuses through a single receiver.
pub struct Adapter {
    store: Box<dyn ConfigStore>,
    config: AdapterConfig,
    fetcher: Arc<Fetcher>,
    discovery: DiscoveryController,
    consumer: Option<Arc<dyn ThingConsumer>>,
    devices: Devices,
    // Devices saved by the host before being materialized.
    pending: HashSet<String>,
    notifier: Notifier,
    receiver: Option<UnboundedReceiver<HostEvent>>,
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("config", &self.config)
            .field("discovery", &self.discovery)
            .field("started", &self.consumer.is_some())
            .field("devices", &self.devices)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl Adapter {
    /// Creates an [`Adapter`] from a [`ConfigStore`] and a
    /// [`ServiceBrowser`].
    #[must_use]
    pub fn new(
        store: impl ConfigStore + 'static,
        browser: impl ServiceBrowser + 'static,
    ) -> Self {
        Self::with_fetcher(store, browser, Arc::new(Fetcher::default()))
    }

    /// Creates an [`Adapter`] sharing an existing [`Fetcher`].
    #[must_use]
    pub fn with_fetcher(
        store: impl ConfigStore + 'static,
        browser: impl ServiceBrowser + 'static,
        fetcher: Arc<Fetcher>,
    ) -> Self {
        let listener = MulticastListener::new(Box::new(browser), Arc::clone(&fetcher));
        let (notifier, receiver) = Notifier::channel();

        Self {
            store: Box::new(store),
            config: AdapterConfig::default(),
            fetcher,
            discovery: DiscoveryController::new(listener),
            consumer: None,
            devices: Devices::new(),
            pending: HashSet::new(),
            notifier,
            receiver: Some(receiver),
        }
    }

    /// Returns the receiver of [`HostEvent`]s.
    ///
    /// The receiver can be taken only once.
    pub fn host_events(&mut self) -> Option<UnboundedReceiver<HostEvent>> {
        self.receiver.take()
    }

    /// Returns the current [`AdapterConfig`].
    #[must_use]
    pub const fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Returns the [`Fetcher`].
    #[must_use]
    pub fn fetcher(&self) -> &Fetcher {
        &self.fetcher
    }

    /// Returns the [`DiscoveryController`].
    #[must_use]
    pub const fn discovery(&self) -> &DiscoveryController {
        &self.discovery
    }

    /// Returns all registered [`Devices`].
    #[must_use]
    pub const fn devices(&self) -> &Devices {
        &self.devices
    }

    /// Returns the [`Device`] with the given identifier.
    #[must_use]
    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    /// Returns the mutable [`Device`] with the given identifier.
    #[must_use]
    pub fn device_mut(&mut self, id: &str) -> Option<&mut Device> {
        self.devices.get_mut(id)
    }

    /// Checks whether the adapter is started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.consumer.is_some()
    }

    /// Starts the adapter.
    ///
    /// The configuration is loaded, every stored endpoint is loaded and,
    /// when configured, continuous discovery starts. An endpoint which
    /// cannot be loaded is logged and skipped.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::InvalidRequest`] when the adapter is already started
    /// - [`ErrorKind::Storage`] when the configuration cannot be loaded
    /// - [`ErrorKind::Discovery`] when continuous discovery cannot start
    pub async fn start(&mut self, consumer: Arc<dyn ThingConsumer>) -> Result<()> {
        if self.consumer.is_some() {
            return Err(Error::new(
                ErrorKind::InvalidRequest,
                "The adapter is already started.",
            ));
        }

        self.store.open().await?;
        self.config = self.store.load_config().await?;
        self.consumer = Some(consumer);

        self.discovery
            .listener_mut()
            .set_fetch_options(self.config.fetch_options(None));

        info!(
            "Adapter started with {} stored endpoints",
            self.config.endpoints.len()
        );

        for endpoint in self.config.endpoints.clone() {
            if let Err(e) = self
                .load_thing(&endpoint.url, endpoint.authentication)
                .await
            {
                error!("Failed to load the Thing at {}: {e}", endpoint.url);
            }
        }

        if self.config.continuous_discovery {
            self.discovery.set_continuous(true)?;
        }

        Ok(())
    }

    /// Loads the devices described at an address.
    ///
    /// The description is either a single Thing or a collection of Things.
    /// Within a collection, Things without an identifier are skipped. A
    /// registered device whose description did not change is left untouched,
    /// while a changed one is replaced.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::Connection`] or [`ErrorKind::DescriptionParse`] when
    ///   the description cannot be fetched
    /// - [`ErrorKind::InvalidDescription`] when a single description cannot
    ///   be interpreted
    /// - [`ErrorKind::Uninitialized`] when the adapter is not started
    pub async fn load_thing(
        &mut self,
        url: &str,
        authentication: Option<Authentication>,
    ) -> Result<()> {
        let url = normalize_url(url);
        let options = self.config.fetch_options(authentication.clone());
        let fetched = self.fetcher.fetch(url, &options).await?;

        self.register(url, &fetched.description, fetched.from_cache, authentication)
            .await
    }

    /// Adds a device from a single description.
    ///
    /// A description without an identifier is registered under an
    /// identifier derived from its address. Returns the device identifier.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::InvalidDescription`] when the description cannot be
    ///   interpreted
    /// - [`ErrorKind::DuplicateDevice`] when the identifier is registered
    /// - [`ErrorKind::Uninitialized`] when the adapter is not started
    /// - Any error returned while consuming the description
    pub async fn add_device(
        &mut self,
        url: &str,
        description: &Value,
        authentication: Option<Authentication>,
    ) -> Result<String> {
        let url = normalize_url(url);
        let td = interpret(url, description)?;
        let id = td
            .identifier()
            .map_or_else(|| device_id_from_url(url), str::to_string);

        self.add(id.clone(), url, description, &td, authentication)
            .await?;
        Ok(id)
    }

    /// Removes a device.
    ///
    /// Its endpoint is removed from the configuration when no other device
    /// shares it. A failure to persist the configuration is logged, but the
    /// device is removed anyway.
    ///
    /// # Errors
    ///
    /// An error is returned when no device has the given identifier.
    pub async fn remove_device(&mut self, id: &str) -> Result<()> {
        let Some(device) = self.unregister(id).await else {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("Device `{id}` not found"),
            ));
        };
        let _ = self.pending.remove(id);

        let url = device.url();
        if self.devices.ids_at(url).is_empty() && self.config.remove_endpoint(url) {
            self.save_config().await;
        }

        info!("Device `{id}` removed");
        Ok(())
    }

    /// Removes every device loaded from an address.
    ///
    /// An address with no devices is ignored.
    ///
    /// # Errors
    ///
    /// An error is returned when a device cannot be removed.
    pub async fn unload_thing(&mut self, url: &str) -> Result<()> {
        let url = normalize_url(url);
        let ids = self.devices.ids_at(url);

        if ids.is_empty() {
            debug!("No device loaded from {url}");
            return Ok(());
        }

        for id in ids {
            self.remove_device(&id).await?;
        }
        Ok(())
    }

    /// Notifies that the host saved a device, starting its synchronization.
    ///
    /// A device saved before being materialized starts as soon as it is
    /// added.
    pub async fn handle_device_saved(&mut self, id: &str) {
        match self.devices.get_mut(id) {
            Some(device) => device.start().await,
            None => {
                debug!("Device `{id}` saved before being added, deferring its start");
                let _ = self.pending.insert(id.to_string());
            }
        }
    }

    /// Starts pairing for the given time.
    ///
    /// # Errors
    ///
    /// An error is returned when discovery cannot start.
    pub fn start_pairing(&mut self, timeout: Duration) -> Result<()> {
        self.discovery.start_pairing(timeout)
    }

    /// Cancels pairing.
    ///
    /// # Errors
    ///
    /// An error is returned when discovery cannot stop.
    pub fn cancel_pairing(&mut self) -> Result<()> {
        self.discovery.cancel_pairing()
    }

    /// Enables or disables continuous discovery, persisting the choice.
    ///
    /// # Errors
    ///
    /// An error is returned when discovery cannot be started or stopped.
    pub async fn set_continuous_discovery(&mut self, enabled: bool) -> Result<()> {
        self.discovery.set_continuous(enabled)?;

        if self.config.continuous_discovery != enabled {
            self.config.continuous_discovery = enabled;
            self.save_config().await;
        }
        Ok(())
    }

    /// Waits for the next [`DiscoveryEvent`].
    ///
    /// Returns [`None`] when discovery is not running.
    pub async fn next_discovery_event(&mut self) -> Option<DiscoveryEvent> {
        self.discovery.next_event().await
    }

    /// Handles a [`DiscoveryEvent`].
    ///
    /// Found descriptions are registered with the authentication stored for
    /// their address, lost addresses are unloaded and errors are logged.
    ///
    /// # Errors
    ///
    /// An error is returned when a found description cannot be registered
    /// or a lost device cannot be removed.
    pub async fn handle_discovery_event(&mut self, event: DiscoveryEvent) -> Result<()> {
        match event {
            DiscoveryEvent::Found {
                url,
                description,
                from_cache,
            } => {
                let authentication = self
                    .config
                    .endpoint(&url)
                    .and_then(|endpoint| endpoint.authentication.clone());
                self.register(&url, &description, from_cache, authentication)
                    .await
            }
            DiscoveryEvent::Lost { url } => self.unload_thing(&url).await,
            DiscoveryEvent::Error(e) => {
                warn!("Discovery error: {e}");
                Ok(())
            }
        }
    }

    /// Handles [`DiscoveryEvent`]s until discovery stops.
    pub async fn run_discovery(&mut self) {
        while let Some(event) = self.next_discovery_event().await {
            if let Err(e) = self.handle_discovery_event(event).await {
                error!("Failed to handle a discovery event: {e}");
            }
        }
    }

    /// Unloads the adapter.
    ///
    /// Discovery stops, every device is destroyed and the configuration
    /// storage is closed.
    ///
    /// # Errors
    ///
    /// An error is returned when the configuration storage cannot be closed.
    pub async fn unload(&mut self) -> Result<()> {
        if let Err(e) = self.discovery.shutdown() {
            warn!("Failed to stop discovery: {e}");
        }

        let devices: Vec<Device> = self.devices.drain().collect();
        for mut device in devices {
            device.destroy().await;
        }

        self.pending.clear();
        self.consumer = None;
        info!("Adapter unloaded");

        self.store.close().await
    }

    async fn register(
        &mut self,
        url: &str,
        description: &Value,
        from_cache: bool,
        authentication: Option<Authentication>,
    ) -> Result<()> {
        let (things, collection) = match description {
            Value::Array(things) => (things.iter().collect::<Vec<_>>(), true),
            thing => (vec![thing], false),
        };
        // A lone Thing may borrow the identifier of its address.
        let shared = things.len() > 1;

        for thing in things {
            let td = match interpret(url, thing) {
                Ok(td) => td,
                Err(e) if collection => {
                    warn!("Skip an invalid Thing in the collection at {url}: {e}");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let id = match td.identifier() {
                Some(id) => id.to_string(),
                None if shared => {
                    warn!(
                        "Skip Thing `{}` in the collection at {url}: it has no identifier",
                        td.title
                    );
                    continue;
                }
                None => device_id_from_url(url),
            };

            if self.devices.contains(&id) {
                if from_cache {
                    debug!("Device `{id}` did not change, skip it");
                    continue;
                }

                info!("Device `{id}` changed, replacing it");
                let restart = self.devices.get(&id).is_some_and(Device::is_started);
                let _ = self.unregister(&id).await;
                if restart {
                    let _ = self.pending.insert(id.clone());
                }
            }

            self.add(id, url, thing, &td, authentication.clone())
                .await?;
        }

        Ok(())
    }

    async fn add(
        &mut self,
        id: String,
        url: &str,
        description: &Value,
        td: &ThingDescription,
        authentication: Option<Authentication>,
    ) -> Result<()> {
        if self.devices.contains(&id) {
            return Err(Error::new(
                ErrorKind::DuplicateDevice,
                format!("Device `{id}` already exists"),
            ));
        }

        let Some(consumer) = self.consumer.as_ref() else {
            return Err(Error::new(
                ErrorKind::Uninitialized,
                "The adapter is not started.",
            ));
        };
        let thing = consumer.consume(description).await?;

        let endpoint = EndpointConfig::new(url, authentication);
        if self.config.endpoint(url) != Some(&endpoint) {
            self.config.add_endpoint(endpoint);
            self.save_config().await;
        }

        let mut device = Device::materialize(
            id.clone(),
            url.to_string(),
            td,
            thing,
            self.notifier.clone(),
            self.sync_settings(),
        );

        if self.pending.remove(&id) {
            device.start().await;
        }

        self.devices.insert(device);
        self.notifier.notify(HostEvent::DeviceAdded {
            device_id: id.clone(),
        });
        info!("Device `{id}` added from {url}");

        Ok(())
    }

    async fn unregister(&mut self, id: &str) -> Option<Device> {
        let mut device = self.devices.remove(id)?;
        device.destroy().await;

        self.notifier.notify(HostEvent::DeviceRemoved {
            device_id: id.to_string(),
        });
        Some(device)
    }

    async fn save_config(&mut self) {
        if let Err(e) = self.store.save_config(&self.config).await {
            error!("Failed to save the configuration: {e}");
        }
    }

    fn sync_settings(&self) -> SyncSettings {
        SyncSettings::new()
            .poll_interval(self.config.poll_interval())
            .use_observable(self.config.use_observable)
    }
}

fn interpret(url: &str, description: &Value) -> Result<ThingDescription> {
    ThingDescription::from_value(description).map_err(|e| {
        Error::new(
            ErrorKind::InvalidDescription,
            format!("Invalid Thing description at {url}: {e}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::Duration;

    use crate::browser::ServiceRecord;
    use crate::config::{AdapterConfig, Authentication, ConfigStore, EndpointConfig, MemoryStore};
    use crate::device::SyncMode;
    use crate::discovery::DiscoveryEvent;
    use crate::error::ErrorKind;
    use crate::events::HostEvent;
    use crate::fetch::Fetcher;
    use crate::tests::{FakeBrowser, FakeConsumer, LAMP, TdServer, init_logs};

    use super::{Adapter, device_id_from_url};

    struct Harness {
        adapter: Adapter,
        store: MemoryStore,
        browser: FakeBrowser,
        consumer: Arc<FakeConsumer>,
        events: UnboundedReceiver<HostEvent>,
    }

    fn config() -> AdapterConfig {
        AdapterConfig {
            retries: 0,
            ..AdapterConfig::default()
        }
    }

    fn harness(config: AdapterConfig, fetcher: Fetcher) -> Harness {
        init_logs();

        let store = MemoryStore::with_config(config);
        let browser = FakeBrowser::new();
        let mut adapter = Adapter::with_fetcher(store.clone(), browser.clone(), Arc::new(fetcher));
        let events = adapter.host_events().unwrap();

        Harness {
            adapter,
            store,
            browser,
            consumer: FakeConsumer::new(),
            events,
        }
    }

    async fn started(config: AdapterConfig) -> Harness {
        let mut harness = harness(config, Fetcher::default());
        harness
            .adapter
            .start(harness.consumer.clone())
            .await
            .unwrap();
        harness
    }

    #[test]
    fn derived_identifiers() {
        assert_eq!(device_id_from_url("http://h/lamp"), "http---h-lamp");
        assert_eq!(
            device_id_from_url("https://dev.local:80/t"),
            "https---dev.local-80-t"
        );
    }

    #[tokio::test]
    async fn lamp() {
        let server = TdServer::start(LAMP).await;
        let mut harness = started(config()).await;
        let url = server.url("/lamp");

        harness.adapter.load_thing(&url, None).await.unwrap();

        let device = harness.adapter.device("t1").unwrap();
        assert_eq!(device.title(), "lamp");
        assert_eq!(device.url(), url);
        assert_eq!(
            device.property("on").unwrap().sync_mode(device.settings()),
            SyncMode::Poll
        );
        assert_eq!(device.settings().poll_interval, Duration::from_secs(5));
        assert!(!device.is_started());

        assert_eq!(
            harness.events.recv().await.unwrap(),
            HostEvent::DeviceAdded {
                device_id: "t1".into()
            }
        );

        let stored = harness.store.config().await.unwrap();
        assert!(stored.contains(&url));
        assert_eq!(stored.endpoint(&url).unwrap().authentication, None);
    }

    #[tokio::test]
    async fn not_started() {
        let mut harness = harness(config(), Fetcher::default());

        let error = harness
            .adapter
            .add_device("http://h/lamp", &json!({ "id": "t1", "title": "lamp" }), None)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Uninitialized);
        assert!(harness.adapter.devices().is_empty());
    }

    #[tokio::test]
    async fn start_twice() {
        let mut harness = started(config()).await;

        let error = harness
            .adapter
            .start(harness.consumer.clone())
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn duplicate_and_missing_devices() {
        let mut harness = started(config()).await;
        let description = json!({ "id": "t1", "title": "lamp" });

        let id = harness
            .adapter
            .add_device("http://h/lamp", &description, None)
            .await
            .unwrap();
        assert_eq!(id, "t1");

        let error = harness
            .adapter
            .add_device("http://h/other", &description, None)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::DuplicateDevice);
        assert_eq!(harness.consumer.consumed(), 1);

        let error = harness.adapter.remove_device("t2").await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NotFound);

        let error = harness
            .adapter
            .add_device("http://h/lamp", &json!([1, 2]), None)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidDescription);
    }

    #[tokio::test]
    async fn collection_without_identifiers() {
        let server = TdServer::start(r#"[{ "title": "a" }, { "title": "b" }]"#).await;
        let mut harness = started(config()).await;

        harness
            .adapter
            .load_thing(&server.url("/things"), None)
            .await
            .unwrap();

        assert!(harness.adapter.devices().is_empty());
        assert_eq!(harness.consumer.consumed(), 0);
    }

    #[tokio::test]
    async fn single_thing_without_identifier() {
        let server = TdServer::start(r#"{ "title": "a" }"#).await;
        let mut harness = started(config()).await;
        let url = server.url("/things/a");

        harness.adapter.load_thing(&url, None).await.unwrap();

        let id = device_id_from_url(&url);
        assert!(harness.adapter.device(&id).is_some());
    }

    #[tokio::test]
    async fn lone_thing_in_collection() {
        let server = TdServer::start(r#"[{ "title": "a" }]"#).await;
        let mut harness = started(config()).await;
        let url = server.url("/things");

        harness.adapter.load_thing(&url, None).await.unwrap();

        assert_eq!(harness.adapter.devices().len(), 1);
        assert!(harness.adapter.device(&device_id_from_url(&url)).is_some());
    }

    #[tokio::test]
    async fn collection_sharing_an_endpoint() {
        let server = TdServer::start(
            r#"[{ "id": "a", "title": "a" }, { "title": "x" }, { "id": "b", "title": "b" }]"#,
        )
        .await;
        let mut harness = started(config()).await;
        let url = server.url("/things");

        harness.adapter.load_thing(&url, None).await.unwrap();
        let ids: Vec<&str> = harness.adapter.devices().iter().map(|d| d.id()).collect();
        assert_eq!(ids, ["a", "b"]);

        // The endpoint stays stored while a device still uses it.
        harness.adapter.remove_device("a").await.unwrap();
        assert!(harness.store.config().await.unwrap().contains(&url));

        harness.adapter.remove_device("b").await.unwrap();
        assert!(!harness.store.config().await.unwrap().contains(&url));
    }

    #[tokio::test]
    async fn unchanged_reload() {
        let server = TdServer::start(LAMP).await;
        let mut harness = started(config()).await;
        let url = server.url("/lamp");

        harness.adapter.load_thing(&url, None).await.unwrap();
        harness.adapter.load_thing(&url, None).await.unwrap();

        assert_eq!(harness.adapter.devices().len(), 1);
        assert_eq!(harness.consumer.consumed(), 1);
        assert_eq!(server.hits(), 1);
    }

    #[tokio::test]
    async fn changed_reload() {
        let server = TdServer::start(LAMP).await;
        let mut harness = harness(config(), Fetcher::default().freshness(Duration::ZERO));
        harness
            .adapter
            .start(harness.consumer.clone())
            .await
            .unwrap();
        let url = server.url("/lamp");

        harness.adapter.load_thing(&url, None).await.unwrap();
        harness.adapter.handle_device_saved("t1").await;
        assert!(harness.adapter.device("t1").unwrap().is_started());

        // Same content, no churn.
        harness.adapter.load_thing(&url, None).await.unwrap();
        assert_eq!(harness.consumer.consumed(), 1);

        server.set_body(&LAMP.replace(r#""title": "lamp""#, r#""title": "dimmable lamp""#));
        harness.adapter.load_thing(&url, None).await.unwrap();

        let device = harness.adapter.device("t1").unwrap();
        assert_eq!(device.title(), "dimmable lamp");
        // The replacement resumes synchronization.
        assert!(device.is_started());
        assert!(!device.sync_handles().is_empty());
        assert_eq!(harness.consumer.consumed(), 2);

        let events: Vec<HostEvent> = std::iter::from_fn(|| harness.events.try_recv().ok())
            .filter(|event| !matches!(event, HostEvent::PropertyChanged { .. }))
            .collect();
        assert_eq!(
            events,
            [
                HostEvent::DeviceAdded {
                    device_id: "t1".into()
                },
                HostEvent::DeviceRemoved {
                    device_id: "t1".into()
                },
                HostEvent::DeviceAdded {
                    device_id: "t1".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint() {
        let mut harness = started(config()).await;

        let error = harness
            .adapter
            .load_thing("http://127.0.0.1:9/lamp", None)
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Connection);
        assert!(harness.adapter.devices().is_empty());
    }

    #[tokio::test]
    async fn removal_survives_storage_failures() {
        let mut harness = started(config()).await;
        let _ = harness
            .adapter
            .add_device("http://h/lamp", &json!({ "id": "t1" }), None)
            .await
            .unwrap();

        harness.store.fail_saves(true).await;
        harness.adapter.remove_device("t1").await.unwrap();

        assert!(harness.adapter.devices().is_empty());
        assert!(!harness.adapter.config().contains("http://h/lamp"));
    }

    #[tokio::test]
    async fn saved_before_added() {
        let server = TdServer::start(LAMP).await;
        let mut harness = started(config()).await;

        harness.adapter.handle_device_saved("t1").await;
        harness
            .adapter
            .load_thing(&server.url("/lamp"), None)
            .await
            .unwrap();

        let device = harness.adapter.device("t1").unwrap();
        assert!(device.is_started());
        assert!(!device.sync_handles().is_empty());
    }

    #[tokio::test]
    async fn stored_endpoints_are_loaded() {
        let server = TdServer::start(LAMP).await;
        let url = server.url("/lamp");

        let mut config = config();
        config.add_endpoint(EndpointConfig::new(
            &url,
            Some(Authentication::Jwt {
                token: "secret".into(),
            }),
        ));
        config.add_endpoint(EndpointConfig::new("http://127.0.0.1:9/gone", None));
        config.poll_interval = 2;

        let harness = started(config).await;

        let device = harness.adapter.device("t1").unwrap();
        assert_eq!(device.settings().poll_interval, Duration::from_secs(2));
        assert_eq!(server.authorization().as_deref(), Some("Bearer secret"));
        assert_eq!(harness.adapter.devices().len(), 1);
    }

    #[tokio::test]
    async fn discovered_devices() {
        let server = TdServer::start(LAMP).await;
        let config = AdapterConfig {
            continuous_discovery: true,
            ..config()
        };
        let mut harness = started(config).await;
        assert!(harness.browser.is_browsing());

        let record = ServiceRecord::new("127.0.0.1.", server.port()).path("/lamp");
        harness.browser.up(record.clone());

        let event = harness.adapter.next_discovery_event().await.unwrap();
        harness.adapter.handle_discovery_event(event).await.unwrap();
        assert_eq!(harness.adapter.device("t1").unwrap().url(), server.url("/lamp"));

        harness.browser.down(record);
        let event = harness.adapter.next_discovery_event().await.unwrap();
        assert_eq!(
            event,
            DiscoveryEvent::Lost {
                url: server.url("/lamp")
            }
        );
        harness.adapter.handle_discovery_event(event).await.unwrap();
        assert!(harness.adapter.devices().is_empty());

        // Losing an unknown device is a no-op.
        harness
            .adapter
            .handle_discovery_event(DiscoveryEvent::Lost {
                url: "http://dev.local:80/t".into(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rediscovered_device_is_kept() {
        let server = TdServer::start(LAMP).await;
        let config = AdapterConfig {
            continuous_discovery: true,
            ..config()
        };
        let mut harness = started(config).await;

        let record = ServiceRecord::new("127.0.0.1.", server.port()).path("/lamp");
        harness.browser.up(record.clone());
        let event = harness.adapter.next_discovery_event().await.unwrap();
        harness.adapter.handle_discovery_event(event).await.unwrap();
        assert_eq!(harness.consumer.consumed(), 1);
        while harness.events.try_recv().is_ok() {}

        // Announced again within the freshness window.
        harness.browser.up(record);
        let event = harness.adapter.next_discovery_event().await.unwrap();
        assert!(matches!(
            event,
            DiscoveryEvent::Found {
                from_cache: true,
                ..
            }
        ));
        harness.adapter.handle_discovery_event(event).await.unwrap();

        assert_eq!(harness.consumer.consumed(), 1);
        assert_eq!(server.hits(), 1);
        assert!(harness.adapter.device("t1").is_some());
        let churn = std::iter::from_fn(|| harness.events.try_recv().ok()).any(|event| {
            matches!(
                event,
                HostEvent::DeviceAdded { .. } | HostEvent::DeviceRemoved { .. }
            )
        });
        assert!(!churn);
    }

    #[tokio::test]
    async fn continuous_discovery_is_persisted() {
        let mut harness = started(config()).await;
        assert!(!harness.browser.is_browsing());

        harness.adapter.set_continuous_discovery(true).await.unwrap();
        assert!(harness.browser.is_browsing());
        assert!(harness.store.config().await.unwrap().continuous_discovery);

        // Pairing while discovering continuously leaves discovery running.
        harness.adapter.start_pairing(Duration::from_secs(60)).unwrap();
        harness.adapter.cancel_pairing().unwrap();
        harness.adapter.cancel_pairing().unwrap();
        assert!(harness.browser.is_browsing());

        harness.adapter.set_continuous_discovery(false).await.unwrap();
        assert!(!harness.browser.is_browsing());
        assert!(!harness.store.config().await.unwrap().continuous_discovery);
    }

    #[tokio::test(start_paused = true)]
    async fn run_discovery_until_pairing_ends() {
        let mut harness = started(config()).await;

        harness.adapter.start_pairing(Duration::from_secs(30)).unwrap();
        assert!(harness.browser.is_browsing());

        harness.adapter.run_discovery().await;
        assert!(!harness.browser.is_browsing());
        assert!(!harness.adapter.discovery().is_pairing());
    }

    #[tokio::test]
    async fn unload() {
        let mut harness = started(AdapterConfig {
            continuous_discovery: true,
            ..config()
        })
        .await;
        let _ = harness
            .adapter
            .add_device("http://h/lamp", &json!({ "id": "t1" }), None)
            .await
            .unwrap();
        harness.adapter.handle_device_saved("t1").await;

        harness.adapter.unload().await.unwrap();

        assert!(harness.adapter.devices().is_empty());
        assert!(!harness.adapter.is_started());
        assert!(!harness.browser.is_browsing());
        assert!(harness.store.load_config().await.is_err());
    }
}
