use hashbrown::HashMap;

use tokio::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::discovery::{DiscoveryEvent, DiscoveryEvents, MulticastListener};
use crate::error::{Error, ErrorKind, Result};

/// A reason for keeping discovery running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    /// Discovery runs continuously.
    Continuous,
    /// The host is pairing new devices.
    Pairing,
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continuous => "continuous",
            Self::Pairing => "pairing",
        }
        .fmt(f)
    }
}

/// The effect of a change of demand on the discovery listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The listener must start.
    Start,
    /// The listener must stop.
    Stop,
    /// The listener stays as it is.
    Unchanged,
}

/// The demand for discovery.
///
/// Every request for a [`Reason`] must be matched by a release. Discovery is
/// running as long as at least one request is outstanding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DiscoveryState {
    /// No outstanding request.
    #[default]
    Idle,
    /// At least one outstanding request.
    Running {
        /// Outstanding requests for each reason. Counts are never zero.
        reasons: HashMap<Reason, usize>,
    },
}

impl DiscoveryState {
    /// Records a request.
    pub fn request(&mut self, reason: Reason) -> Transition {
        match self {
            Self::Idle => {
                let mut reasons = HashMap::new();
                let _ = reasons.insert(reason, 1);
                *self = Self::Running { reasons };
                Transition::Start
            }
            Self::Running { reasons } => {
                *reasons.entry(reason).or_default() += 1;
                Transition::Unchanged
            }
        }
    }

    /// Records a release.
    ///
    /// # Errors
    ///
    /// An error is returned when no request for the reason is outstanding,
    /// leaving the state untouched.
    pub fn release(&mut self, reason: Reason) -> Result<Transition> {
        let Self::Running { reasons } = self else {
            return Err(unmatched_release(reason));
        };

        let Some(count) = reasons.get_mut(&reason) else {
            return Err(unmatched_release(reason));
        };
        *count -= 1;
        if *count == 0 {
            let _ = reasons.remove(&reason);
        }

        if reasons.is_empty() {
            *self = Self::Idle;
            return Ok(Transition::Stop);
        }
        Ok(Transition::Unchanged)
    }

    /// Returns the number of outstanding requests.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        match self {
            Self::Idle => 0,
            Self::Running { reasons } => reasons.values().sum(),
        }
    }

    /// Returns the number of outstanding requests for a reason.
    #[must_use]
    pub fn count(&self, reason: Reason) -> usize {
        match self {
            Self::Idle => 0,
            Self::Running { reasons } => reasons.get(&reason).copied().unwrap_or_default(),
        }
    }

    /// Checks whether discovery is demanded.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }
}

// About thirty years.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

// Returns the instant after the given time from now, saturating far in the
// future.
pub(crate) fn deadline(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after).unwrap_or_else(|| now + FAR_FUTURE)
}

fn unmatched_release(reason: Reason) -> Error {
    Error::new(
        ErrorKind::Discovery,
        format!("No outstanding {reason} discovery request to release"),
    )
}

#[derive(Debug, Clone, Copy)]
struct Pairing {
    deadline: Instant,
    // Whether pairing holds its own discovery request.
    requested: bool,
}

enum Wake {
    Event(Option<DiscoveryEvent>),
    PairingExpired,
}

/// The controller of the discovery lifecycle.
///
/// It starts the [`MulticastListener`] on the first discovery request and
/// stops it on the last release, whether requests come from continuous
/// discovery or from pairing.
#[derive(Debug)]
pub struct DiscoveryController {
    listener: MulticastListener,
    state: DiscoveryState,
    events: Option<DiscoveryEvents>,
    continuous: bool,
    pairing: Option<Pairing>,
}

impl DiscoveryController {
    /// Creates a [`DiscoveryController`].
    #[must_use]
    pub fn new(listener: MulticastListener) -> Self {
        Self {
            listener,
            state: DiscoveryState::Idle,
            events: None,
            continuous: false,
            pairing: None,
        }
    }

    /// Returns the [`DiscoveryState`].
    #[must_use]
    pub const fn state(&self) -> &DiscoveryState {
        &self.state
    }

    /// Returns the [`MulticastListener`].
    #[must_use]
    pub const fn listener(&self) -> &MulticastListener {
        &self.listener
    }

    /// Returns the mutable [`MulticastListener`].
    #[must_use]
    pub const fn listener_mut(&mut self) -> &mut MulticastListener {
        &mut self.listener
    }

    /// Checks whether the listener is running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.listener.is_running()
    }

    /// Checks whether continuous discovery is enabled.
    #[must_use]
    pub const fn is_continuous(&self) -> bool {
        self.continuous
    }

    /// Checks whether pairing is active.
    #[must_use]
    pub const fn is_pairing(&self) -> bool {
        self.pairing.is_some()
    }

    /// Requests discovery for a reason, starting the listener when idle.
    ///
    /// # Errors
    ///
    /// An error is returned when the listener cannot start, in which case
    /// the request is not recorded.
    pub fn request(&mut self, reason: Reason) -> Result<()> {
        if self.state.request(reason) == Transition::Start {
            match self.listener.start() {
                Ok(events) => self.events = Some(events),
                Err(e) => {
                    self.state = DiscoveryState::Idle;
                    return Err(e);
                }
            }
        }
        debug!(
            "Discovery requested for {reason}, {} outstanding",
            self.state.ref_count()
        );
        Ok(())
    }

    /// Releases a discovery request, stopping the listener on the last one.
    ///
    /// # Errors
    ///
    /// An error is returned when no request for the reason is outstanding
    /// or when the listener cannot be stopped.
    pub fn release(&mut self, reason: Reason) -> Result<()> {
        if self.state.release(reason)? == Transition::Stop {
            self.events = None;
            self.listener.stop()?;
        }
        debug!(
            "Discovery released for {reason}, {} outstanding",
            self.state.ref_count()
        );
        Ok(())
    }

    /// Enables or disables continuous discovery.
    ///
    /// # Errors
    ///
    /// An error is returned when the listener cannot be started or stopped.
    pub fn set_continuous(&mut self, enabled: bool) -> Result<()> {
        if enabled == self.continuous {
            return Ok(());
        }

        if enabled {
            self.request(Reason::Continuous)?;
        } else {
            // An active pairing takes over before continuous discovery leaves.
            if let Some(pairing) = self.pairing
                && !pairing.requested
            {
                self.request(Reason::Pairing)?;
                self.pairing = Some(Pairing {
                    requested: true,
                    ..pairing
                });
            }
            self.release(Reason::Continuous)?;
        }
        self.continuous = enabled;
        info!(
            "Continuous discovery {}",
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    /// Starts pairing for the given time.
    ///
    /// Discovery is requested on behalf of pairing only when continuous
    /// discovery is disabled. Starting pairing again extends the deadline.
    ///
    /// # Errors
    ///
    /// An error is returned when the listener cannot start.
    pub fn start_pairing(&mut self, timeout: Duration) -> Result<()> {
        let deadline = deadline(timeout);

        if let Some(pairing) = self.pairing.as_mut() {
            pairing.deadline = deadline;
            debug!("Pairing extended by {timeout:?}");
            return Ok(());
        }

        let requested = !self.continuous;
        if requested {
            self.request(Reason::Pairing)?;
        }
        self.pairing = Some(Pairing {
            deadline,
            requested,
        });
        info!("Pairing started for {timeout:?}");
        Ok(())
    }

    /// Cancels pairing.
    ///
    /// Cancelling an inactive pairing has no effect.
    ///
    /// # Errors
    ///
    /// An error is returned when the listener cannot be stopped.
    pub fn cancel_pairing(&mut self) -> Result<()> {
        let Some(pairing) = self.pairing.take() else {
            debug!("Pairing is not active, nothing to cancel");
            return Ok(());
        };

        if pairing.requested {
            self.release(Reason::Pairing)?;
        }
        info!("Pairing cancelled");
        Ok(())
    }

    /// Waits for the next [`DiscoveryEvent`].
    ///
    /// Pairing is cancelled once its deadline expires. Returns [`None`] when
    /// the listener is stopped and pairing is inactive.
    pub async fn next_event(&mut self) -> Option<DiscoveryEvent> {
        loop {
            let deadline = self.pairing.map(|pairing| pairing.deadline);

            let wake = match (self.events.as_mut(), deadline) {
                (None, None) => return None,
                (None, Some(deadline)) => {
                    tokio::time::sleep_until(deadline).await;
                    Wake::PairingExpired
                }
                (Some(events), None) => Wake::Event(events.next().await),
                (Some(events), Some(deadline)) => {
                    tokio::select! {
                        event = events.next() => Wake::Event(event),
                        () = tokio::time::sleep_until(deadline) => Wake::PairingExpired,
                    }
                }
            };

            match wake {
                Wake::Event(None) => {
                    debug!("Discovery events closed");
                    self.events = None;
                }
                Wake::Event(event) => return event,
                Wake::PairingExpired => {
                    info!("Pairing timed out");
                    if let Err(e) = self.cancel_pairing() {
                        error!("Failed to stop pairing: {e}");
                    }
                }
            }
        }
    }

    /// Stops discovery, whatever the outstanding requests.
    ///
    /// # Errors
    ///
    /// An error is returned when the listener cannot be stopped.
    pub fn shutdown(&mut self) -> Result<()> {
        self.pairing = None;
        self.continuous = false;
        self.state = DiscoveryState::Idle;
        self.events = None;
        self.listener.stop()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::time::Duration;

    use crate::browser::ServiceRecord;
    use crate::discovery::{DiscoveryEvent, MulticastListener};
    use crate::error::ErrorKind;
    use crate::fetch::Fetcher;
    use crate::tests::FakeBrowser;

    use super::{DiscoveryController, DiscoveryState, Reason, Transition};

    fn controller(browser: &FakeBrowser) -> DiscoveryController {
        DiscoveryController::new(MulticastListener::new(
            Box::new(browser.clone()),
            Arc::new(Fetcher::default()),
        ))
    }

    #[test]
    fn state_machine() {
        let mut state = DiscoveryState::default();
        assert_eq!(state.ref_count(), 0);

        assert_eq!(state.request(Reason::Pairing), Transition::Start);
        assert_eq!(state.request(Reason::Continuous), Transition::Unchanged);
        assert_eq!(state.request(Reason::Pairing), Transition::Unchanged);
        assert_eq!(state.ref_count(), 3);
        assert_eq!(state.count(Reason::Pairing), 2);

        assert_eq!(state.release(Reason::Pairing), Ok(Transition::Unchanged));
        assert_eq!(state.release(Reason::Continuous), Ok(Transition::Unchanged));
        assert_eq!(state.count(Reason::Continuous), 0);

        // Releasing a reason with no outstanding request is refused.
        let before = state.clone();
        assert_eq!(
            state.release(Reason::Continuous).unwrap_err().kind(),
            ErrorKind::Discovery
        );
        assert_eq!(state, before);

        assert_eq!(state.release(Reason::Pairing), Ok(Transition::Stop));
        assert_eq!(state, DiscoveryState::Idle);
        assert!(state.release(Reason::Pairing).is_err());
    }

    #[tokio::test]
    async fn pairing_without_continuous() {
        let browser = FakeBrowser::new();
        let mut controller = controller(&browser);

        controller.start_pairing(Duration::from_secs(60)).unwrap();
        assert!(controller.is_running());
        assert!(controller.is_pairing());
        assert_eq!(controller.state().count(Reason::Pairing), 1);

        controller.cancel_pairing().unwrap();
        assert!(!controller.is_running());
        assert_eq!(controller.state().ref_count(), 0);
        assert_eq!(browser.stops(), 1);
    }

    #[tokio::test]
    async fn pairing_with_continuous() {
        let browser = FakeBrowser::new();
        let mut controller = controller(&browser);

        controller.set_continuous(true).unwrap();
        assert!(controller.is_running());

        // Pairing rides on continuous discovery.
        controller.start_pairing(Duration::from_secs(60)).unwrap();
        assert_eq!(controller.state().ref_count(), 1);

        controller.cancel_pairing().unwrap();
        assert!(controller.is_running());
        assert_eq!(controller.state().ref_count(), 1);

        controller.set_continuous(false).unwrap();
        assert!(!controller.is_running());
        assert_eq!(browser.starts(), 1);
        assert_eq!(browser.stops(), 1);
    }

    #[tokio::test]
    async fn pairing_outlives_continuous() {
        let browser = FakeBrowser::new();
        let mut controller = controller(&browser);

        controller.set_continuous(true).unwrap();
        controller.start_pairing(Duration::from_secs(60)).unwrap();

        controller.set_continuous(false).unwrap();
        assert!(controller.is_running());
        assert_eq!(controller.state().count(Reason::Pairing), 1);
        assert_eq!(controller.state().count(Reason::Continuous), 0);
        assert_eq!(browser.stops(), 0);

        controller.cancel_pairing().unwrap();
        assert!(!controller.is_running());
        assert_eq!(browser.stops(), 1);
    }

    #[tokio::test]
    async fn endless_pairing() {
        let browser = FakeBrowser::new();
        let mut controller = controller(&browser);

        controller.start_pairing(Duration::MAX).unwrap();
        assert!(controller.is_pairing());

        // Extending an endless pairing is fine too.
        controller.start_pairing(Duration::MAX).unwrap();
        assert_eq!(controller.state().count(Reason::Pairing), 1);

        controller.cancel_pairing().unwrap();
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn cancel_inactive_pairing() {
        let browser = FakeBrowser::new();
        let mut controller = controller(&browser);

        controller.set_continuous(true).unwrap();
        controller.cancel_pairing().unwrap();

        assert!(controller.is_running());
        assert_eq!(controller.state().ref_count(), 1);
        assert_eq!(browser.stops(), 0);
    }

    #[tokio::test]
    async fn continuous_outlives_pairing() {
        let browser = FakeBrowser::new();
        let mut controller = controller(&browser);

        controller.start_pairing(Duration::from_secs(60)).unwrap();
        controller.set_continuous(true).unwrap();
        assert_eq!(controller.state().ref_count(), 2);

        controller.cancel_pairing().unwrap();
        assert!(controller.is_running());

        // Enabling twice does not stack requests.
        controller.set_continuous(true).unwrap();
        assert_eq!(controller.state().ref_count(), 1);

        controller.set_continuous(false).unwrap();
        controller.set_continuous(false).unwrap();
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn failed_start_is_not_recorded() {
        let browser = FakeBrowser::new();
        browser.fail_starts();
        let mut controller = controller(&browser);

        assert_eq!(
            controller.set_continuous(true).unwrap_err().kind(),
            ErrorKind::Discovery
        );
        assert!(!controller.is_continuous());
        assert_eq!(controller.state(), &DiscoveryState::Idle);

        assert!(controller.start_pairing(Duration::from_secs(1)).is_err());
        assert!(!controller.is_pairing());
    }

    #[tokio::test(start_paused = true)]
    async fn pairing_timeout() {
        let browser = FakeBrowser::new();
        let mut controller = controller(&browser);

        controller.start_pairing(Duration::from_secs(60)).unwrap();

        // No device shows up, so the deadline expires.
        assert_eq!(controller.next_event().await, None);
        assert!(!controller.is_pairing());
        assert!(!controller.is_running());
        assert_eq!(browser.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn events_while_pairing() {
        let browser = FakeBrowser::new();
        let mut controller = controller(&browser);

        controller.start_pairing(Duration::from_secs(60)).unwrap();
        browser.down(ServiceRecord::new("dev.local.", 80).path("/t"));

        assert_eq!(
            controller.next_event().await,
            Some(DiscoveryEvent::Lost {
                url: "http://dev.local:80/t".into()
            })
        );
        assert!(controller.is_pairing());

        // Extending pairing moves the deadline.
        tokio::time::sleep(Duration::from_secs(50)).await;
        controller.start_pairing(Duration::from_secs(60)).unwrap();
        assert!(
            tokio::time::timeout(Duration::from_secs(55), controller.next_event())
                .await
                .is_err()
        );
        assert!(controller.is_pairing());
        assert_eq!(controller.state().ref_count(), 1);

        assert_eq!(controller.next_event().await, None);
        assert!(!controller.is_pairing());
        assert_eq!(browser.starts(), 1);
        assert_eq!(browser.stops(), 1);
    }

    #[tokio::test]
    async fn shutdown() {
        let browser = FakeBrowser::new();
        let mut controller = controller(&browser);

        controller.set_continuous(true).unwrap();
        controller.start_pairing(Duration::from_secs(60)).unwrap();

        controller.shutdown().unwrap();
        assert!(!controller.is_running());
        assert!(!controller.is_continuous());
        assert!(!controller.is_pairing());
        assert_eq!(controller.state().ref_count(), 0);
        assert_eq!(controller.next_event().await, None);

        // Shutting down twice is harmless.
        controller.shutdown().unwrap();
        assert_eq!(browser.stops(), 1);
    }
}
