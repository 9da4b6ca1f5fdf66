use serde_json::Value;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use tracing::debug;

use crate::action::ActionRequest;

/// A notification for the host.
///
/// Notifications are delivered through the [`UnboundedReceiver`] returned
/// by the [`Adapter`](crate::adapter::Adapter).
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// A device has been registered.
    DeviceAdded {
        /// Device identifier.
        device_id: String,
    },
    /// A device has been unregistered.
    DeviceRemoved {
        /// Device identifier.
        device_id: String,
    },
    /// The cached value of a property changed.
    PropertyChanged {
        /// Device identifier.
        device_id: String,
        /// Property name.
        property: String,
        /// New value.
        value: Value,
    },
    /// A device emitted an event.
    Event {
        /// Device identifier.
        device_id: String,
        /// Event name.
        event: String,
        /// Event data.
        data: Value,
    },
    /// The status of an action request changed.
    ActionStatus {
        /// Device identifier.
        device_id: String,
        /// The request, with its new status.
        action: ActionRequest,
    },
}

impl std::fmt::Display for HostEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeviceAdded { device_id } => write!(f, "Device `{device_id}` added"),
            Self::DeviceRemoved { device_id } => write!(f, "Device `{device_id}` removed"),
            Self::PropertyChanged {
                device_id,
                property,
                value,
            } => write!(f, "Device `{device_id}`: property `{property}` is {value}"),
            Self::Event {
                device_id,
                event,
                data,
            } => write!(f, "Device `{device_id}`: event `{event}` with {data}"),
            Self::ActionStatus { device_id, action } => write!(
                f,
                "Device `{device_id}`: action `{}` ({}) is {}",
                action.name, action.id, action.status
            ),
        }
    }
}

// Sends notifications to the host, ignoring a dropped receiver.
#[derive(Debug, Clone)]
pub(crate) struct Notifier(UnboundedSender<HostEvent>);

impl Notifier {
    pub(crate) fn channel() -> (Self, UnboundedReceiver<HostEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self(sender), receiver)
    }

    pub(crate) fn notify(&self, event: HostEvent) {
        if let Err(e) = self.0.send(event) {
            debug!("Host receiver dropped, discard the notification: {}", e.0);
        }
    }
}
