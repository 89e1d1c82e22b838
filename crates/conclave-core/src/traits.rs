use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{DataMap, Event, EventKind};

/// Agent-process handler shape.
///
/// Implementations should watch `cancel` and return early once it fires;
/// nothing preempts a processor that ignores it.
pub trait Processor: Send + Sync + 'static {
    fn process(&self, cancel: CancellationToken, inputs: DataMap) -> BoxFuture<'_, Result<DataMap>>;
}

/// A named, callable capability an agent can carry.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (registry key).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    /// Execute the tool with the given input.
    fn execute(
        &self,
        input: serde_json::Value,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Callback invoked synchronously for every event of a subscribed kind.
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by [`EventSink::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct SubscriptionId(pub u64);

/// External pub/sub bus receiving audit events.
pub trait EventSink: Send + Sync + 'static {
    /// Publish an event to every subscriber of its kind.
    fn add_event(&self, event: Event);

    /// Register a callback for one event kind.
    fn subscribe(&self, kind: EventKind, callback: EventCallback) -> SubscriptionId;

    /// Remove a callback. Returns false if it was not registered.
    fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool;
}

/// External key/value store for agent and system state.
pub trait StateProvider: Send + Sync + 'static {
    /// Read a key. `None` when absent.
    fn get_state(&self, key: &str) -> BoxFuture<'_, Result<Option<serde_json::Value>>>;

    /// Overwrite a key.
    fn set_state(&self, key: &str, value: serde_json::Value) -> BoxFuture<'_, Result<()>>;

    /// Shallow-merge `patch` into the stored object and return the result.
    fn update_state(
        &self,
        key: &str,
        patch: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Delete a key. Returns true if it existed.
    fn delete_state(&self, key: &str) -> BoxFuture<'_, Result<bool>>;

    /// Watch a key. The receiver observes every subsequent write or delete.
    fn watch_state(
        &self,
        key: &str,
    ) -> BoxFuture<'_, Result<watch::Receiver<Option<serde_json::Value>>>>;
}
