use std::sync::Arc;

use async_trait::async_trait;

use serde_json::Value;

use tokio::sync::mpsc::UnboundedSender;

use crate::error::Result;

/// The sender through which a [`ConsumedThing`] pushes observed property
/// values and emitted event data.
///
/// A [`ConsumedThing`] stops pushing values once the sender is closed.
pub type Listener = UnboundedSender<Value>;

/// A Thing consumed from its description.
///
/// It performs the protocol interactions on behalf of a device.
#[async_trait]
pub trait ConsumedThing: Send + Sync {
    /// Reads the current value of a property.
    async fn read_property(&self, name: &str) -> Result<Value>;

    /// Writes a property value.
    async fn write_property(&self, name: &str, value: Value) -> Result<()>;

    /// Starts pushing the changes of a property to a [`Listener`].
    async fn observe_property(&self, name: &str, listener: Listener) -> Result<()>;

    /// Stops pushing the changes of a property.
    async fn unobserve_property(&self, name: &str) -> Result<()>;

    /// Invokes an action, returning its output, if any.
    async fn invoke_action(&self, name: &str, input: Option<Value>) -> Result<Option<Value>>;

    /// Starts pushing the data of an event to a [`Listener`].
    async fn subscribe_event(&self, name: &str, listener: Listener) -> Result<()>;
}

/// A consumer turning descriptions into [`ConsumedThing`]s.
#[async_trait]
pub trait ThingConsumer: Send + Sync {
    /// Consumes a description.
    async fn consume(&self, description: &Value) -> Result<Arc<dyn ConsumedThing>>;
}
