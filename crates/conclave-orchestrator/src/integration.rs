//! Adapters publishing agent, task and system state to a [`StateProvider`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use conclave_agent::Agent;
use conclave_core::error::Result;
use conclave_core::state::StateKey;
use conclave_core::traits::{EventSink, StateProvider, SubscriptionId};
use conclave_core::types::{AgentId, Event, EventKind, SystemId};

use crate::orchestrator::Orchestrator;

/// Snapshots agents under `agent:{id}` and restores them from there.
pub struct AgentStateAdapter {
    store: Arc<dyn StateProvider>,
}

impl AgentStateAdapter {
    pub fn new(store: Arc<dyn StateProvider>) -> Self {
        Self { store }
    }

    /// Write the agent's description and state to the store.
    pub async fn snapshot(&self, agent: &Agent) -> Result<()> {
        let key = StateKey::agent(agent.id());
        debug!(key = %key, "Snapshotting agent state");
        self.store.set_state(&key, agent.describe()).await
    }

    /// Replace the agent's state with the stored one.
    ///
    /// Returns false, leaving the agent untouched, if nothing is stored.
    pub async fn restore(&self, agent: &Agent) -> Result<bool> {
        let key = StateKey::agent(agent.id());
        let Some(stored) = self.store.get_state(&key).await? else {
            return Ok(false);
        };
        match stored.get("state").and_then(|s| s.as_object()) {
            Some(state) => {
                agent.replace_state(state.clone().into_iter().collect());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn watch(&self, id: &AgentId) -> Result<watch::Receiver<Option<serde_json::Value>>> {
        self.store.watch_state(&StateKey::agent(id)).await
    }

    pub async fn remove(&self, id: &AgentId) -> Result<bool> {
        self.store.delete_state(&StateKey::agent(id)).await
    }
}

/// Publishes an orchestrator summary under `system:{id}`.
pub struct SystemStateAdapter {
    store: Arc<dyn StateProvider>,
    system_id: SystemId,
}

impl SystemStateAdapter {
    pub fn new(store: Arc<dyn StateProvider>, system_id: SystemId) -> Self {
        Self { store, system_id }
    }

    pub fn key(&self) -> String {
        StateKey::system(&self.system_id)
    }

    /// Build the summary: task counts by status, slot usage and agents.
    pub fn summarize(&self, orchestrator: &Orchestrator) -> serde_json::Value {
        let tasks: serde_json::Map<String, serde_json::Value> = orchestrator
            .task_counts()
            .into_iter()
            .map(|(status, count)| (status.to_string(), serde_json::json!(count)))
            .collect();
        let agents: Vec<serde_json::Value> = orchestrator
            .agents()
            .iter()
            .map(|a| {
                serde_json::json!({
                    "id": a.id(),
                    "name": a.name(),
                    "role": a.role(),
                })
            })
            .collect();

        serde_json::json!({
            "system_id": self.system_id,
            "tasks": tasks,
            "running_tasks": orchestrator.running_tasks(),
            "queued_tasks": orchestrator.queued_tasks(),
            "max_concurrent_tasks": orchestrator.max_concurrent_tasks(),
            "agents": agents,
            "updated_at": Utc::now(),
        })
    }

    /// Write the current summary and return it.
    pub async fn snapshot(&self, orchestrator: &Orchestrator) -> Result<serde_json::Value> {
        let summary = self.summarize(orchestrator);
        self.store.set_state(&self.key(), summary.clone()).await?;
        Ok(summary)
    }

    pub async fn watch(&self) -> Result<watch::Receiver<Option<serde_json::Value>>> {
        self.store.watch_state(&self.key()).await
    }
}

/// Event kinds mirrored into the store by [`StateSync`].
const MIRRORED: [EventKind; 12] = [
    EventKind::AgentRegistered,
    EventKind::AgentStateChanged,
    EventKind::AgentProcessed,
    EventKind::AgentFailed,
    EventKind::TaskCreated,
    EventKind::TaskQueued,
    EventKind::TaskAssigned,
    EventKind::TaskStarted,
    EventKind::TaskCompleted,
    EventKind::TaskFailed,
    EventKind::TaskRetrying,
    EventKind::TaskCancelled,
];

/// Mirrors agent and task transitions from an event sink into a state store.
///
/// Event callbacks only enqueue; a background writer applies the updates
/// in order, so a slow store never blocks the component that emitted.
pub struct StateSync {
    sink: Arc<dyn EventSink>,
    subscriptions: Vec<(EventKind, SubscriptionId)>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl StateSync {
    /// Subscribe to `sink` and start the writer. Must be called within a
    /// tokio runtime.
    pub fn start(sink: Arc<dyn EventSink>, store: Arc<dyn StateProvider>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Event>();

        let subscriptions = MIRRORED
            .iter()
            .map(|kind| {
                let tx = tx.clone();
                let id = sink.subscribe(
                    *kind,
                    Arc::new(move |event: &Event| {
                        // Closed once the writer stops.
                        let _ = tx.send(event.clone());
                    }),
                );
                (*kind, id)
            })
            .collect();

        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        tracker.spawn(run_writer(rx, store, cancel.clone()));
        tracker.close();

        info!(kinds = MIRRORED.len(), "State sync started");
        Self {
            sink,
            subscriptions,
            tracker,
            cancel,
        }
    }

    /// Unsubscribe, apply every event already received, then stop.
    pub async fn stop(self) {
        for (kind, id) in &self.subscriptions {
            self.sink.unsubscribe(*kind, *id);
        }
        self.cancel.cancel();
        self.tracker.wait().await;
        info!("State sync stopped");
    }
}

async fn run_writer(
    mut rx: mpsc::UnboundedReceiver<Event>,
    store: Arc<dyn StateProvider>,
    cancel: CancellationToken,
) {
    let mut writer = Writer {
        store,
        agent_state: HashMap::new(),
    };
    loop {
        tokio::select! {
            biased;
            event = rx.recv() => match event {
                Some(event) => writer.apply(&event).await,
                None => return,
            },
            _ = cancel.cancelled() => {
                while let Ok(event) = rx.try_recv() {
                    writer.apply(&event).await;
                }
                return;
            }
        }
    }
}

struct Writer {
    store: Arc<dyn StateProvider>,
    /// Last known state map per agent, rebuilt from change events.
    agent_state: HashMap<AgentId, serde_json::Map<String, serde_json::Value>>,
}

impl Writer {
    async fn apply(&mut self, event: &Event) {
        let result = if event.kind.is_task() {
            self.apply_task(event).await
        } else {
            self.apply_agent(event).await
        };
        if let Err(e) = result {
            warn!(kind = %event.kind, error = %e, "State sync write failed");
        }
    }

    async fn apply_task(&self, event: &Event) -> Result<()> {
        let Some(ref task_id) = event.task_id else {
            return Ok(());
        };
        let mut patch = serde_json::json!({
            "task_id": task_id,
            "last_event": event.kind,
            "updated_at": event.timestamp,
        });
        if let (Some(fields), Some(target)) = (event.data.as_object(), patch.as_object_mut()) {
            for (k, v) in fields {
                target.insert(k.clone(), v.clone());
            }
        }
        if let Some(ref agent) = event.agent_id {
            patch["assigned_agent"] = serde_json::json!(agent);
        }
        self.store.update_state(&StateKey::task(task_id), patch).await?;
        Ok(())
    }

    async fn apply_agent(&mut self, event: &Event) -> Result<()> {
        let Some(ref agent_id) = event.agent_id else {
            return Ok(());
        };
        let mut patch = serde_json::json!({
            "agent_id": agent_id,
            "last_event": event.kind,
            "updated_at": event.timestamp,
        });

        match event.kind {
            EventKind::AgentRegistered => {
                for field in ["name", "role", "capabilities"] {
                    if let Some(v) = event.data.get(field) {
                        patch[field] = v.clone();
                    }
                }
            }
            EventKind::AgentStateChanged => {
                let state = self.agent_state.entry(agent_id.clone()).or_default();
                if let Some(key) = event.data.get("key").and_then(|k| k.as_str()) {
                    if event.data.get("deleted").is_some() {
                        state.remove(key);
                    } else if let Some(value) = event.data.get("value") {
                        state.insert(key.to_string(), value.clone());
                    }
                } else if let Some(restored) = event.data.get("state").and_then(|s| s.as_object())
                {
                    *state = restored.clone();
                }
                patch["state"] = serde_json::Value::Object(state.clone());
            }
            EventKind::AgentFailed => {
                patch["last_error"] = event.data.get("error").cloned().unwrap_or_default();
            }
            _ => {}
        }

        self.store
            .update_state(&StateKey::agent(agent_id), patch)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use conclave_agent::AgentRole;
    use conclave_core::config::ConclaveConfig;
    use conclave_core::handler::Handler;
    use conclave_core::{EventBus, MemoryStateStore};
    use conclave_test_utils::{CallLog, RecordingProcessor};

    use crate::task::TaskSpec;

    #[tokio::test]
    async fn test_agent_snapshot_and_restore() {
        let store = Arc::new(MemoryStateStore::new());
        let adapter = AgentStateAdapter::new(store.clone());
        let agent = Agent::new("p", AgentRole::Planner, Handler::Passthrough);
        agent.set_state("phase", json!("draft"));

        adapter.snapshot(&agent).await.unwrap();
        let stored = store.get_state(&StateKey::agent(agent.id())).await.unwrap().unwrap();
        assert_eq!(stored["role"], json!("planner"));
        assert_eq!(stored["state"]["phase"], json!("draft"));

        agent.set_state("phase", json!("final"));
        assert!(adapter.restore(&agent).await.unwrap());
        assert_eq!(agent.get_state("phase"), Some(json!("draft")));

        assert!(adapter.remove(agent.id()).await.unwrap());
        assert!(!adapter.restore(&agent).await.unwrap());
    }

    #[tokio::test]
    async fn test_agent_watch_sees_snapshot() {
        let store = Arc::new(MemoryStateStore::new());
        let adapter = AgentStateAdapter::new(store);
        let agent = Agent::new("v", AgentRole::Verifier, Handler::Passthrough);

        let mut rx = adapter.watch(agent.id()).await.unwrap();
        adapter.snapshot(&agent).await.unwrap();
        rx.changed().await.unwrap();
        let seen = rx.borrow_and_update().clone().unwrap();
        assert_eq!(seen["name"], json!("v"));
    }

    #[tokio::test]
    async fn test_restore_keeps_store_in_step_with_state_sync() {
        let bus = Arc::new(EventBus::default());
        let store = Arc::new(MemoryStateStore::new());
        let sync = StateSync::start(bus.clone(), store.clone());
        let adapter = AgentStateAdapter::new(store.clone());
        let agent =
            Agent::new("p", AgentRole::Planner, Handler::Passthrough).with_event_sink(bus.clone());

        agent.set_state("phase", json!("draft"));
        adapter.snapshot(&agent).await.unwrap();
        agent.set_state("phase", json!("final"));
        assert!(adapter.restore(&agent).await.unwrap());
        assert_eq!(agent.get_state("phase"), Some(json!("draft")));

        // Changes after a restore build on the restored map.
        agent.set_state("step", json!(2));
        sync.stop().await;

        let stored = store.get_state(&StateKey::agent(agent.id())).await.unwrap().unwrap();
        assert_eq!(stored["state"]["phase"], json!("draft"));
        assert_eq!(stored["state"]["step"], json!(2));
    }

    #[tokio::test]
    async fn test_system_snapshot_summarizes_orchestrator() {
        let store = Arc::new(MemoryStateStore::new());
        let orch = Orchestrator::new(ConclaveConfig::default(), None);
        let log = CallLog::new();
        orch.register_agent(Arc::new(Agent::new(
            "p",
            AgentRole::Planner,
            Handler::processor(RecordingProcessor::new("p", log)),
        )))
        .unwrap();
        let done = orch.create_task(TaskSpec::new("a", AgentRole::Planner)).unwrap();
        orch.wait_for_task(&done.id, Duration::from_secs(5)).await.unwrap();
        orch.create_task(TaskSpec::new("b", AgentRole::UiBuilder)).unwrap();

        let adapter = SystemStateAdapter::new(store.clone(), SystemId::from("main"));
        adapter.snapshot(&orch).await.unwrap();

        let stored = store.get_state("system:main").await.unwrap().unwrap();
        assert_eq!(stored["tasks"]["completed"], json!(1));
        assert_eq!(stored["tasks"]["pending"], json!(1));
        assert_eq!(stored["tasks"]["failed"], json!(0));
        assert_eq!(stored["max_concurrent_tasks"], json!(4));
        assert_eq!(stored["agents"][0]["role"], json!("planner"));
    }

    #[tokio::test]
    async fn test_state_sync_mirrors_task_and_agent_transitions() {
        let bus = Arc::new(EventBus::default());
        let store = Arc::new(MemoryStateStore::new());
        let sync = StateSync::start(bus.clone(), store.clone());

        let orch = Orchestrator::new(ConclaveConfig::default(), Some(bus.clone()));
        let log = CallLog::new();
        let agent = Arc::new(
            Agent::new(
                "gen",
                AgentRole::CodeGenerator,
                Handler::processor(RecordingProcessor::new("gen", log)),
            )
            .with_event_sink(bus.clone()),
        );
        orch.register_agent(agent.clone()).unwrap();
        agent.set_state("phase", json!("building"));

        let task = orch
            .create_task(TaskSpec::new("build", AgentRole::CodeGenerator))
            .unwrap();
        orch.wait_for_task(&task.id, Duration::from_secs(5)).await.unwrap();
        sync.stop().await;

        let task_state = store.get_state(&StateKey::task(&task.id)).await.unwrap().unwrap();
        assert_eq!(task_state["status"], json!("completed"));
        assert_eq!(task_state["last_event"], json!("task_completed"));
        assert_eq!(task_state["assigned_agent"], json!(agent.id()));

        let agent_state = store.get_state(&StateKey::agent(agent.id())).await.unwrap().unwrap();
        assert_eq!(agent_state["name"], json!("gen"));
        assert_eq!(agent_state["state"]["phase"], json!("building"));
        assert_eq!(agent_state["last_event"], json!("agent_processed"));

        assert_eq!(bus.subscriber_count(EventKind::TaskCompleted), 0);
    }
}
