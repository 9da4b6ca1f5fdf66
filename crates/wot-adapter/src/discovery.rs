use std::sync::Arc;

use serde_json::Value;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{JoinHandle, JoinSet};

use tokio_util::sync::CancellationToken;

use tracing::{debug, info, warn};

use crate::browser::{ServiceBrowser, ServiceNotification};
use crate::error::{Error, ErrorKind, Result};
use crate::fetch::{FetchOptions, Fetcher};

/// A discovery event.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// A device description has been found.
    Found {
        /// Description address.
        url: String,
        /// The fetched description.
        description: Arc<Value>,
        /// Whether the description is the one already cached for the address.
        from_cache: bool,
    },
    /// A device is no longer announced.
    Lost {
        /// Description address.
        url: String,
    },
    /// A description could not be fetched.
    Error(Error),
}

/// The receiver of [`DiscoveryEvent`]s.
///
/// It yields no more events once its listener stops.
#[derive(Debug)]
pub struct DiscoveryEvents(UnboundedReceiver<DiscoveryEvent>);

impl DiscoveryEvents {
    /// Receives the next [`DiscoveryEvent`].
    pub async fn next(&mut self) -> Option<DiscoveryEvent> {
        self.0.recv().await
    }
}

#[cfg(feature = "stream")]
impl futures_util::Stream for DiscoveryEvents {
    type Item = DiscoveryEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.0.poll_recv(cx)
    }
}

#[derive(Debug)]
struct Running {
    cancellation_token: CancellationToken,
    task: JoinHandle<()>,
}

/// A listener for devices announced on the local network.
///
/// Every resolved service has its description fetched, then reported as a
/// [`DiscoveryEvent::Found`] event. Every withdrawn service is reported as a
/// [`DiscoveryEvent::Lost`] event. Descriptions are fetched concurrently, so
/// an unreachable device does not delay the others.
pub struct MulticastListener {
    browser: Box<dyn ServiceBrowser>,
    fetcher: Arc<Fetcher>,
    options: FetchOptions,
    running: Option<Running>,
}

impl std::fmt::Debug for MulticastListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MulticastListener")
            .field("options", &self.options)
            .field("running", &self.running.is_some())
            .finish_non_exhaustive()
    }
}

impl MulticastListener {
    /// Creates a [`MulticastListener`].
    #[must_use]
    pub fn new(browser: Box<dyn ServiceBrowser>, fetcher: Arc<Fetcher>) -> Self {
        Self {
            browser,
            fetcher,
            options: FetchOptions::new(),
            running: None,
        }
    }

    /// Sets the [`FetchOptions`] used for discovered descriptions.
    pub fn set_fetch_options(&mut self, options: FetchOptions) {
        self.options = options;
    }

    /// Checks whether the listener is running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Starts listening.
    ///
    /// # Errors
    ///
    /// An error is returned when the listener is already running or when the
    /// service browser cannot start.
    pub fn start(&mut self) -> Result<DiscoveryEvents> {
        if self.running.is_some() {
            return Err(Error::new(
                ErrorKind::Discovery,
                "The discovery listener is already running.",
            ));
        }

        let notifications = self.browser.start()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancellation_token = CancellationToken::new();

        let task = tokio::spawn(run_listener(
            notifications,
            Arc::clone(&self.fetcher),
            self.options.clone(),
            cancellation_token.clone(),
            sender,
        ));

        self.running = Some(Running {
            cancellation_token,
            task,
        });
        info!("Discovery listener started");

        Ok(DiscoveryEvents(receiver))
    }

    /// Stops listening, closing the [`DiscoveryEvents`] receiver.
    ///
    /// Stopping an idle listener has no effect.
    ///
    /// # Errors
    ///
    /// An error is returned when the service browser cannot be stopped.
    pub fn stop(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        running.cancellation_token.cancel();
        running.task.abort();
        info!("Discovery listener stopped");

        self.browser.stop()
    }
}

impl Drop for MulticastListener {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop the discovery listener: {e}");
        }
    }
}

async fn run_listener(
    notifications: flume::Receiver<ServiceNotification>,
    fetcher: Arc<Fetcher>,
    options: FetchOptions,
    cancellation_token: CancellationToken,
    sender: UnboundedSender<DiscoveryEvent>,
) {
    // Dropping the set aborts the fetches still in flight.
    let mut fetches = JoinSet::new();

    loop {
        tokio::select! {
            () = cancellation_token.cancelled() => { break; }
            Some(_) = fetches.join_next(), if !fetches.is_empty() => {}
            notification = notifications.recv_async() => {
                let Ok(notification) = notification else {
                    debug!("Service browser closed, stop listening");
                    break;
                };

                match notification {
                    ServiceNotification::Up(record) => {
                        let _ = fetches.spawn(resolve(
                            record.url(),
                            Arc::clone(&fetcher),
                            options.clone(),
                            sender.clone(),
                        ));
                    }
                    ServiceNotification::Down(record) => {
                        if sender.send(DiscoveryEvent::Lost { url: record.url() }).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}

async fn resolve(
    url: String,
    fetcher: Arc<Fetcher>,
    options: FetchOptions,
    sender: UnboundedSender<DiscoveryEvent>,
) {
    let event = match fetcher.fetch(&url, &options).await {
        Ok(fetched) => DiscoveryEvent::Found {
            url,
            description: fetched.description,
            from_cache: fetched.from_cache,
        },
        Err(e) => {
            warn!("Failed to fetch the description of a discovered device: {e}");
            DiscoveryEvent::Error(e)
        }
    };

    if sender.send(event).is_err() {
        debug!("Discovery receiver dropped, discard the event");
    }
}
