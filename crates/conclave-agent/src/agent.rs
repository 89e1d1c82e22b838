use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use conclave_core::error::Result;
use conclave_core::event::emit;
use conclave_core::handler::Handler;
use conclave_core::traits::{EventSink, Processor, Tool};
use conclave_core::types::{AgentId, DataMap, Event, EventKind};

use crate::registry::ToolRegistry;
use crate::role::{AgentRole, Capability};

/// A role-tagged actor wrapping a handler, a tool registry and private state.
///
/// State is only reachable through the accessors below, each of which takes
/// the agent's own lock for the duration of a single read or write.
pub struct Agent {
    id: AgentId,
    name: String,
    role: AgentRole,
    capabilities: Vec<Capability>,
    handler: Handler,
    tools: ToolRegistry,
    state: RwLock<DataMap>,
    events: Option<Arc<dyn EventSink>>,
    created_at: DateTime<Utc>,
}

impl Agent {
    /// Create an agent carrying its role's default capabilities.
    pub fn new(name: impl Into<String>, role: AgentRole, handler: Handler) -> Self {
        Self {
            id: AgentId::new(),
            name: name.into(),
            role,
            capabilities: role.default_capabilities(),
            handler,
            tools: ToolRegistry::new(),
            state: RwLock::new(DataMap::new()),
            events: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<AgentId>) -> Self {
        self.id = id.into();
        self
    }

    /// Replace the role's default capabilities.
    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_tool(mut self, tool: impl Tool) -> Self {
        self.tools.register(tool);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Run the agent's handler on `inputs`.
    ///
    /// Emits `agent_processed` or `agent_failed`. The state lock is not
    /// held while the handler runs.
    pub async fn process(&self, cancel: CancellationToken, inputs: DataMap) -> Result<DataMap> {
        let started = Instant::now();
        debug!(
            agent = %self.name,
            agent_id = %self.id,
            shape = self.handler.shape(),
            "Agent processing"
        );

        match self.handler.run(cancel, inputs).await {
            Ok(outputs) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                emit(
                    &self.events,
                    Event::new(EventKind::AgentProcessed)
                        .with_agent(&self.id)
                        .with_data(serde_json::json!({
                            "role": self.role,
                            "elapsed_ms": elapsed_ms,
                            "output_keys": outputs.keys().collect::<Vec<_>>(),
                        })),
                );
                Ok(outputs)
            }
            Err(e) => {
                warn!(agent = %self.name, agent_id = %self.id, error = %e, "Agent handler failed");
                emit(
                    &self.events,
                    Event::new(EventKind::AgentFailed)
                        .with_agent(&self.id)
                        .with_data(serde_json::json!({
                            "role": self.role,
                            "error": e.to_string(),
                        })),
                );
                Err(e)
            }
        }
    }

    /// Call one of the agent's tools by name.
    pub async fn call_tool(
        &self,
        name: &str,
        input: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value> {
        debug!(agent = %self.name, tool = name, "Agent calling tool");
        self.tools.execute(name, input, cancel).await
    }

    // ── State ──────────────────────────────────────────────────

    pub fn get_state(&self, key: &str) -> Option<serde_json::Value> {
        self.state.read().get(key).cloned()
    }

    /// Write one state entry and emit `agent_state_changed`.
    pub fn set_state(&self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        self.state.write().insert(key.clone(), value.clone());
        emit(
            &self.events,
            Event::new(EventKind::AgentStateChanged)
                .with_agent(&self.id)
                .with_data(serde_json::json!({ "key": key, "value": value })),
        );
    }

    pub fn delete_state(&self, key: &str) -> Option<serde_json::Value> {
        let removed = self.state.write().remove(key);
        if removed.is_some() {
            emit(
                &self.events,
                Event::new(EventKind::AgentStateChanged)
                    .with_agent(&self.id)
                    .with_data(serde_json::json!({ "key": key, "deleted": true })),
            );
        }
        removed
    }

    /// Copy of the whole state map.
    pub fn state_snapshot(&self) -> DataMap {
        self.state.read().clone()
    }

    /// Replace the whole state map, e.g. when restoring from a state store.
    pub fn replace_state(&self, state: DataMap) {
        let keys: Vec<String> = state.keys().cloned().collect();
        let data = serde_json::json!({ "restored_keys": keys, "state": state });
        *self.state.write() = state;
        emit(
            &self.events,
            Event::new(EventKind::AgentStateChanged)
                .with_agent(&self.id)
                .with_data(data),
        );
    }

    /// JSON summary of the agent and its state, as published to state stores.
    pub fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "role": self.role,
            "capabilities": self.capabilities,
            "tools": self.tools.list(),
            "state": self.state_snapshot(),
            "created_at": self.created_at,
        })
    }
}

impl Processor for Agent {
    fn process(
        &self,
        cancel: CancellationToken,
        inputs: DataMap,
    ) -> BoxFuture<'_, Result<DataMap>> {
        Box::pin(Agent::process(self, cancel, inputs))
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("role", &self.role)
            .field("handler", &self.handler)
            .field("tools", &self.tools)
            .finish()
    }
}
