use std::sync::Arc;

use serde_json::Value;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};

use tokio_util::sync::CancellationToken;

use tracing::{debug, error, warn};

use wot_td::affordance::{ActionAffordance, EventAffordance, PropertyAffordance};
use wot_td::data::Terms;
use wot_td::link::Link;
use wot_td::thing::ThingDescription;
use wot_td::{Map, TD_CONTEXT};

use crate::action::ActionRequest;
use crate::error::{Error, ErrorKind, Result};
use crate::events::{HostEvent, Notifier};
use crate::lifecycle::deadline;
use crate::thing::ConsumedThing;

/// Default time between two consecutive reads of a polled property.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How device properties are kept synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Time between two consecutive reads of a polled property.
    pub poll_interval: Duration,
    /// Whether observable properties are observed instead of polled.
    pub use_observable: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncSettings {
    /// Creates [`SyncSettings`] polling every property every five seconds.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            use_observable: false,
        }
    }

    /// Sets the polling interval.
    #[must_use]
    pub const fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets whether observable properties are observed.
    #[must_use]
    pub const fn use_observable(mut self, use_observable: bool) -> Self {
        self.use_observable = use_observable;
        self
    }
}

/// Synchronization mode of a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// The device pushes every change.
    Observe,
    /// The property is read periodically.
    Poll,
}

/// A device property together with its cached value.
#[derive(Debug)]
pub struct Property {
    name: String,
    affordance: PropertyAffordance,
    value: Arc<watch::Sender<Option<Value>>>,
}

impl Property {
    fn new(name: String, affordance: PropertyAffordance) -> Self {
        let (value, _) = watch::channel(None);
        Self {
            name,
            affordance,
            value: Arc::new(value),
        }
    }

    /// Returns the property name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the [`PropertyAffordance`].
    #[must_use]
    pub const fn affordance(&self) -> &PropertyAffordance {
        &self.affordance
    }

    /// Returns the cached value, if any.
    #[must_use]
    pub fn value(&self) -> Option<Value> {
        self.value.borrow().clone()
    }

    /// Returns a receiver notified on every change of the cached value.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Option<Value>> {
        self.value.subscribe()
    }

    /// Returns the [`SyncMode`] of the property under the given settings.
    #[must_use]
    pub const fn sync_mode(&self, settings: &SyncSettings) -> SyncMode {
        if self.affordance.observable && settings.use_observable {
            SyncMode::Observe
        } else {
            SyncMode::Poll
        }
    }
}

/// Ownership of a running synchronization mechanism.
#[derive(Debug)]
pub enum SyncHandle {
    /// A task reading a property periodically.
    Timer {
        /// Property name.
        property: String,
        /// Polling task.
        task: JoinHandle<()>,
    },
    /// A task forwarding the observed values of a property.
    Subscription {
        /// Property name.
        property: String,
        /// Forwarding task.
        task: JoinHandle<()>,
    },
    /// A task forwarding the data of an event.
    EventSubscription {
        /// Event name.
        event: String,
        /// Forwarding task.
        task: JoinHandle<()>,
    },
}

#[derive(Debug, Default)]
struct SyncHandles(Vec<SyncHandle>);

impl SyncHandles {
    fn extend(&mut self, handles: Vec<SyncHandle>) {
        self.0.extend(handles);
    }

    // Releases handles in acquisition order. Every task has ended once this
    // returns.
    async fn release_all(&mut self, thing: &dyn ConsumedThing) {
        for handle in self.0.drain(..) {
            match handle {
                SyncHandle::Timer { property, task } => {
                    stop(task).await;
                    debug!("Stopped polling property `{property}`");
                }
                SyncHandle::Subscription { property, task } => {
                    stop(task).await;
                    if let Err(e) = thing.unobserve_property(&property).await {
                        warn!("Failed to unobserve property `{property}`: {e}");
                    }
                }
                SyncHandle::EventSubscription { event, task } => {
                    // Dropping the forwarding task closes the listener.
                    stop(task).await;
                    debug!("Stopped forwarding event `{event}`");
                }
            }
        }
    }
}

// Aborts a task and waits for it, so a value being pushed on another worker
// lands before the task is reported as stopped.
async fn stop(task: JoinHandle<()>) {
    task.abort();
    if let Err(e) = task.await
        && !e.is_cancelled()
    {
        error!("A synchronization task failed: {e}");
    }
}

// Writes values into a property cache on behalf of a device.
#[derive(Clone)]
struct PropertySink {
    device_id: String,
    property: String,
    value: Arc<watch::Sender<Option<Value>>>,
    notifier: Notifier,
    cancellation_token: CancellationToken,
}

impl PropertySink {
    fn push(&self, value: Value) {
        if self.cancellation_token.is_cancelled() {
            debug!(
                "Device `{}` destroyed, discard the value of `{}`",
                self.device_id, self.property
            );
            return;
        }

        let previous = self.value.send_replace(Some(value.clone()));
        if previous.as_ref() != Some(&value) {
            self.notifier.notify(HostEvent::PropertyChanged {
                device_id: self.device_id.clone(),
                property: self.property.clone(),
                value,
            });
        }
    }
}

fn poll_property(
    thing: Arc<dyn ConsumedThing>,
    sink: PropertySink,
    poll_interval: Duration,
) -> SyncHandle {
    let property = sink.property.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(deadline(poll_interval), poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = sink.cancellation_token.cancelled() => { break; }
                _ = ticker.tick() => {
                    match thing.read_property(&sink.property).await {
                        Ok(value) => sink.push(value),
                        Err(e) => warn!(
                            "Failed to poll property `{}` of device `{}`: {e}",
                            sink.property, sink.device_id
                        ),
                    }
                }
            }
        }
    });

    SyncHandle::Timer { property, task }
}

async fn observe_property(thing: &dyn ConsumedThing, sink: PropertySink) -> Result<SyncHandle> {
    let property = sink.property.clone();

    let (listener, mut values) = mpsc::unbounded_channel();
    thing.observe_property(&property, listener).await?;

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = sink.cancellation_token.cancelled() => { break; }
                value = values.recv() => {
                    let Some(value) = value else {
                        break;
                    };
                    sink.push(value);
                }
            }
        }
    });

    Ok(SyncHandle::Subscription { property, task })
}

async fn subscribe_event(
    thing: &dyn ConsumedThing,
    device_id: String,
    event: String,
    notifier: Notifier,
    cancellation_token: CancellationToken,
) -> Result<SyncHandle> {
    let (listener, mut data) = mpsc::unbounded_channel();
    thing.subscribe_event(&event, listener).await?;

    let name = event.clone();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancellation_token.cancelled() => { break; }
                data = data.recv() => {
                    let Some(data) = data else {
                        break;
                    };
                    notifier.notify(HostEvent::Event {
                        device_id: device_id.clone(),
                        event: name.clone(),
                        data,
                    });
                }
            }
        }
    });

    Ok(SyncHandle::EventSubscription { event, task })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceState {
    Idle,
    Started,
    Destroyed,
}

// Finishes an action request when dropped, even when the invocation is
// abandoned halfway.
struct ActionGuard<'a> {
    device: &'a Device,
    action: &'a mut ActionRequest,
}

impl<'a> ActionGuard<'a> {
    fn start(device: &'a Device, action: &'a mut ActionRequest) -> Self {
        action.start();
        device.notify_action(action);
        Self { device, action }
    }

    fn fail(&mut self) {
        self.action.fail();
        self.device.notify_action(self.action);
    }
}

impl Drop for ActionGuard<'_> {
    fn drop(&mut self) {
        self.action.finish();
        self.device.notify_action(self.action);
    }
}

/// A device mirroring a consumed Thing.
///
/// A device is materialized from a [`ThingDescription`] and keeps its
/// property values synchronized once started, either by observing them or
/// by polling them. When a device is destroyed, every synchronization
/// mechanism is released and no further update reaches its model.
pub struct Device {
    id: String,
    url: String,
    title: String,
    semantic_types: Terms,
    description: Option<String>,
    links: Vec<Link>,
    properties: Map<Property>,
    actions: Map<ActionAffordance>,
    events: Map<EventAffordance>,
    thing: Arc<dyn ConsumedThing>,
    notifier: Notifier,
    settings: SyncSettings,
    handles: SyncHandles,
    cancellation_token: CancellationToken,
    state: DeviceState,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("title", &self.title)
            .field("properties", &self.properties)
            .field("actions", &self.actions.keys())
            .field("events", &self.events.keys())
            .field("handles", &self.handles)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Device {
    pub(crate) fn materialize(
        id: String,
        url: String,
        description: &ThingDescription,
        thing: Arc<dyn ConsumedThing>,
        notifier: Notifier,
        settings: SyncSettings,
    ) -> Self {
        let properties = description
            .properties
            .iter()
            .map(|(name, affordance)| {
                (
                    name.clone(),
                    Property::new(name.clone(), affordance.clone()),
                )
            })
            .collect();

        Self {
            id,
            url,
            title: description.title.clone(),
            semantic_types: description.semantic_types.clone(),
            description: description.description.clone(),
            links: description.links.clone(),
            properties,
            actions: description.actions.clone(),
            events: description.events.clone(),
            thing,
            notifier,
            settings,
            handles: SyncHandles::default(),
            cancellation_token: CancellationToken::new(),
            state: DeviceState::Idle,
        }
    }

    /// Returns the device identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the endpoint the device description was fetched from.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the device title.
    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Returns the semantic types.
    #[must_use]
    pub const fn semantic_types(&self) -> &Terms {
        &self.semantic_types
    }

    /// Returns the human-readable description, if any.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Returns the `JSON-LD` context of the device model.
    #[must_use]
    pub const fn context(&self) -> &'static str {
        TD_CONTEXT
    }

    /// Returns the links.
    #[must_use]
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Returns all properties, in declaration order.
    #[must_use]
    pub const fn properties(&self) -> &Map<Property> {
        &self.properties
    }

    /// Returns the property with the given name.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    /// Returns all actions, in declaration order.
    #[must_use]
    pub const fn actions(&self) -> &Map<ActionAffordance> {
        &self.actions
    }

    /// Returns all events, in declaration order.
    #[must_use]
    pub const fn events(&self) -> &Map<EventAffordance> {
        &self.events
    }

    /// Returns the [`SyncSettings`].
    #[must_use]
    pub const fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Returns the running synchronization mechanisms, in acquisition order.
    #[must_use]
    pub fn sync_handles(&self) -> &[SyncHandle] {
        &self.handles.0
    }

    /// Checks whether the device has been started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state == DeviceState::Started
    }

    /// Checks whether the device has been destroyed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state == DeviceState::Destroyed
    }

    /// Starts synchronizing properties and forwarding events.
    ///
    /// Observable properties are observed when the settings allow it, and
    /// polled otherwise. A property whose observation is refused falls back
    /// to polling. A device starts at most once.
    pub async fn start(&mut self) {
        if self.state != DeviceState::Idle {
            debug!("Device `{}` already started or destroyed", self.id);
            return;
        }
        self.state = DeviceState::Started;

        let mut handles = Vec::with_capacity(self.properties.len() + self.events.len());

        for (name, property) in &self.properties {
            let sink = self.sink(property);
            let handle = match property.sync_mode(&self.settings) {
                SyncMode::Observe => match observe_property(self.thing.as_ref(), sink.clone()).await
                {
                    Ok(handle) => handle,
                    Err(e) => {
                        warn!(
                            "Failed to observe property `{name}` of device `{}`, polling it: {e}",
                            self.id
                        );
                        poll_property(Arc::clone(&self.thing), sink, self.settings.poll_interval)
                    }
                },
                SyncMode::Poll => {
                    poll_property(Arc::clone(&self.thing), sink, self.settings.poll_interval)
                }
            };
            handles.push(handle);
        }

        for name in self.events.keys() {
            match subscribe_event(
                self.thing.as_ref(),
                self.id.clone(),
                name.clone(),
                self.notifier.clone(),
                self.cancellation_token.clone(),
            )
            .await
            {
                Ok(handle) => handles.push(handle),
                Err(e) => warn!(
                    "Failed to subscribe to event `{name}` of device `{}`: {e}",
                    self.id
                ),
            }
        }

        self.handles.extend(handles);
    }

    /// Writes a property value, then updates its cached value.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::NotFound`] for an unknown property
    /// - [`ErrorKind::InvalidRequest`] for a read-only property
    /// - Any error returned by the consumed Thing
    pub async fn set_property(&self, name: &str, value: Value) -> Result<()> {
        let property = self.find_property(name)?;

        if property.affordance.is_read_only() {
            return Err(Error::new(
                ErrorKind::InvalidRequest,
                format!("Property `{name}` of device `{}` is read-only", self.id),
            ));
        }

        self.thing.write_property(name, value.clone()).await?;
        self.sink(property).push(value);
        Ok(())
    }

    /// Reads a property value, then updates its cached value.
    ///
    /// # Errors
    ///
    /// - [`ErrorKind::NotFound`] for an unknown property
    /// - Any error returned by the consumed Thing
    pub async fn get_property(&self, name: &str) -> Result<Value> {
        let property = self.find_property(name)?;

        let value = self.thing.read_property(name).await?;
        self.sink(property).push(value.clone());
        Ok(value)
    }

    /// Performs an action request.
    ///
    /// The request becomes pending, then completed. A failed invocation
    /// marks the request as errored. In every case the request is finished
    /// and each status change is notified to the host.
    pub async fn perform_action(&self, action: &mut ActionRequest) {
        let name = action.name.clone();
        let input = action.input.clone();

        let mut guard = ActionGuard::start(self, action);
        match self.thing.invoke_action(&name, input).await {
            Ok(output) => guard.action.output = output,
            Err(e) => {
                error!("Action `{name}` of device `{}` failed: {e}", self.id);
                guard.fail();
            }
        }
    }

    /// Creates an action request with a fresh identifier, then performs it.
    ///
    /// # Errors
    ///
    /// An error is returned when the device has no action with the given
    /// name.
    pub async fn request_action(&self, name: &str, input: Option<Value>) -> Result<ActionRequest> {
        if !self.actions.contains_key(name) {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("Device `{}` has no action `{name}`", self.id),
            ));
        }

        let mut action = ActionRequest::fresh(name, input);
        self.perform_action(&mut action).await;
        Ok(action)
    }

    /// Destroys the device.
    ///
    /// Pending updates are discarded before any synchronization mechanism
    /// is released. Destroying a device twice has no effect.
    pub async fn destroy(&mut self) {
        if self.state == DeviceState::Destroyed {
            return;
        }
        self.state = DeviceState::Destroyed;

        self.cancellation_token.cancel();
        self.handles.release_all(self.thing.as_ref()).await;

        debug!("Device `{}` destroyed", self.id);
    }

    fn find_property(&self, name: &str) -> Result<&Property> {
        self.properties.get(name).ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!("Device `{}` has no property `{name}`", self.id),
            )
        })
    }

    fn sink(&self, property: &Property) -> PropertySink {
        PropertySink {
            device_id: self.id.clone(),
            property: property.name.clone(),
            value: Arc::clone(&property.value),
            notifier: self.notifier.clone(),
            cancellation_token: self.cancellation_token.clone(),
        }
    }

    fn notify_action(&self, action: &ActionRequest) {
        self.notifier.notify(HostEvent::ActionStatus {
            device_id: self.id.clone(),
            action: action.clone(),
        });
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Stops every task of a device dropped without being destroyed.
        self.cancellation_token.cancel();
    }
}

/// A collection of [`Device`]s, in registration order.
#[derive(Debug, Default)]
pub struct Devices(Map<Device>);

impl Devices {
    /// Creates an empty [`Devices`] collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the [`Device`] with the given identifier.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Device> {
        self.0.get(id)
    }

    /// Returns the mutable [`Device`] with the given identifier.
    #[must_use]
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Device> {
        self.0.get_mut(id)
    }

    /// Checks whether a [`Device`] is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    /// Returns the number of [`Device`]s.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Checks whether the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns an iterator over the [`Device`]s.
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.0.values()
    }

    /// Returns the identifiers of the [`Device`]s fetched from an endpoint.
    #[must_use]
    pub fn ids_at(&self, url: &str) -> Vec<String> {
        self.iter()
            .filter(|device| device.url == url)
            .map(|device| device.id.clone())
            .collect()
    }

    pub(crate) fn insert(&mut self, device: Device) {
        let _ = self.0.insert(device.id.clone(), device);
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<Device> {
        self.0.shift_remove(id)
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Device> + '_ {
        self.0.drain(..).map(|(_, device)| device)
    }
}

impl<'a> IntoIterator for &'a Devices {
    type Item = &'a Device;
    type IntoIter = indexmap::map::Values<'a, String, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.values()
    }
}
