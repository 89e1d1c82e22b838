use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use conclave_core::config::{ExecutorConfig, TraversalMode};
use conclave_core::error::{ConclaveError, Result};
use conclave_core::event::emit;
use conclave_core::traits::EventSink;
use conclave_core::types::{DataMap, Event, EventKind, ExecutionId, NodeId};

use crate::execution::{Execution, ExecutionStatus};
use crate::graph::{Graph, ResultObserver};

struct ExecutionEntry {
    record: RwLock<Execution>,
    cancel: CancellationToken,
}

/// Runs graph traversals in the background and tracks them by id.
///
/// `execute` returns as soon as the run is registered; callers poll with
/// `get_execution` or block with `wait_for_execution`. Every run is spawned
/// on a task tracker, so `shutdown` can cancel and join all of them.
///
/// Records are kept until `prune_finished` drops them.
pub struct Executor {
    graph: Arc<Graph>,
    config: ExecutorConfig,
    executions: RwLock<HashMap<ExecutionId, Arc<ExecutionEntry>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    events: Option<Arc<dyn EventSink>>,
}

impl Executor {
    pub fn new(graph: Arc<Graph>, config: ExecutorConfig) -> Self {
        Self {
            graph,
            config,
            executions: RwLock::new(HashMap::new()),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Register a new run from `start` and launch it in the background.
    ///
    /// Returns the `pending` snapshot immediately.
    pub fn execute(
        &self,
        start: &NodeId,
        inputs: DataMap,
        metadata: DataMap,
    ) -> Result<Execution> {
        if !self.graph.contains_node(start) {
            return Err(ConclaveError::not_found("node", start));
        }

        let execution = Execution::new(self.graph.id().clone(), start.clone(), inputs, metadata);
        let entry = Arc::new(ExecutionEntry {
            record: RwLock::new(execution.clone()),
            cancel: self.shutdown.child_token(),
        });
        self.executions
            .write()
            .insert(execution.id.clone(), entry.clone());

        info!(
            execution_id = %execution.id,
            start_node = %start,
            mode = ?self.config.mode,
            "Execution registered"
        );

        self.tracker.spawn(run_execution(
            self.graph.clone(),
            entry,
            self.config.mode,
            self.events.clone(),
        ));

        Ok(execution)
    }

    pub fn get_execution(&self, id: &ExecutionId) -> Result<Execution> {
        Ok(self.entry(id)?.record.read().clone())
    }

    /// All runs, oldest first.
    pub fn list_executions(&self) -> Vec<Execution> {
        let mut all: Vec<Execution> = self
            .executions
            .read()
            .values()
            .map(|e| e.record.read().clone())
            .collect();
        all.sort_by_key(|e| e.created_at);
        all
    }

    /// Poll until the run reaches a terminal state or `cancel` fires.
    pub async fn wait_for_execution(
        &self,
        id: &ExecutionId,
        cancel: &CancellationToken,
    ) -> Result<Execution> {
        let interval = self.config.poll_interval();
        loop {
            let snapshot = self.get_execution(id)?;
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return Err(ConclaveError::Cancelled),
            }
        }
    }

    /// Mark a `pending` or `running` execution cancelled and signal its token.
    ///
    /// Handlers already running are not interrupted; they see the token.
    pub fn cancel_execution(&self, id: &ExecutionId) -> Result<Execution> {
        let entry = self.entry(id)?;
        let snapshot = {
            let mut record = entry.record.write();
            let from = record.status;
            if !record.finish(ExecutionStatus::Cancelled, None) {
                return Err(ConclaveError::InvalidTransition {
                    entity: "execution",
                    from: from.to_string(),
                    to: ExecutionStatus::Cancelled.to_string(),
                });
            }
            record.clone()
        };
        entry.cancel.cancel();

        info!(execution_id = %id, "Execution cancelled");
        emit(&self.events, execution_event(EventKind::ExecutionCancelled, &snapshot));
        Ok(snapshot)
    }

    /// Outputs of `node` within a run, once that node has finished.
    pub fn get_execution_result(
        &self,
        execution_id: &ExecutionId,
        node: &NodeId,
    ) -> Result<DataMap> {
        let entry = self.entry(execution_id)?;
        let record = entry.record.read();
        record.results.get(node).cloned().ok_or_else(|| {
            ConclaveError::not_found("node result", format!("{}/{}", execution_id, node))
        })
    }

    /// Drop terminal records that finished at least `older_than` ago.
    ///
    /// Returns the number removed. Pending and running records are kept.
    pub fn prune_finished(&self, older_than: Duration) -> usize {
        let now = Utc::now();
        let mut executions = self.executions.write();
        let before = executions.len();
        executions.retain(|_, entry| {
            let record = entry.record.read();
            let expired = record.status.is_terminal()
                && record
                    .completed_at
                    .and_then(|at| (now - at).to_std().ok())
                    .map_or(false, |age| age >= older_than);
            !expired
        });
        let removed = before - executions.len();
        if removed > 0 {
            debug!(removed, "Pruned finished executions");
        }
        removed
    }

    /// Number of background runs still alive.
    pub fn active_runs(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel every run and wait for background work to finish.
    pub async fn shutdown(&self) {
        info!(active = self.tracker.len(), "Executor shutting down");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn entry(&self, id: &ExecutionId) -> Result<Arc<ExecutionEntry>> {
        self.executions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ConclaveError::not_found("execution", id))
    }
}

fn execution_event(kind: EventKind, execution: &Execution) -> Event {
    Event::new(kind)
        .with_system(&execution.graph_id)
        .with_data(serde_json::json!({
            "execution_id": execution.id,
            "start_node": execution.start_node,
            "status": execution.status,
            "error": execution.error,
        }))
}

async fn run_execution(
    graph: Arc<Graph>,
    entry: Arc<ExecutionEntry>,
    mode: TraversalMode,
    events: Option<Arc<dyn EventSink>>,
) {
    let (start, inputs, snapshot) = {
        let mut record = entry.record.write();
        if !record.start() {
            debug!(execution_id = %record.id, status = %record.status, "Execution not started");
            return;
        }
        (record.start_node.clone(), record.inputs.clone(), record.clone())
    };
    emit(&events, execution_event(EventKind::ExecutionStarted, &snapshot));

    let recorder = entry.clone();
    let observer: ResultObserver = Arc::new(move |node: &NodeId, outputs: &DataMap| {
        let mut record = recorder.record.write();
        if !record.status.is_terminal() {
            record.results.insert(node.clone(), outputs.clone());
        }
    });

    let cancel = entry.cancel.clone();
    let result = match mode {
        TraversalMode::Sequential => {
            graph
                .traverse_observed(cancel, &start, inputs, Some(observer))
                .await
        }
        TraversalMode::Concurrent => {
            graph
                .traverse_async_observed(cancel, &start, inputs, Some(observer))
                .await
        }
    };

    let (status, error) = match result {
        Ok(_) => (ExecutionStatus::Completed, None),
        Err(ConclaveError::Cancelled) => (ExecutionStatus::Cancelled, None),
        Err(e) => (ExecutionStatus::Failed, Some(e.to_string())),
    };

    let finished = {
        let mut record = entry.record.write();
        record.finish(status, error).then(|| record.clone())
    };

    match finished {
        Some(snapshot) => {
            let kind = match snapshot.status {
                ExecutionStatus::Completed => EventKind::ExecutionCompleted,
                ExecutionStatus::Cancelled => EventKind::ExecutionCancelled,
                _ => EventKind::ExecutionFailed,
            };
            match snapshot.error {
                Some(ref e) => warn!(execution_id = %snapshot.id, error = %e, "Execution failed"),
                None => info!(
                    execution_id = %snapshot.id,
                    status = %snapshot.status,
                    nodes = snapshot.results.len(),
                    "Execution finished"
                ),
            }
            emit(&events, execution_event(kind, &snapshot));
        }
        None => debug!("Execution already terminal, discarding traversal outcome"),
    }
}
