use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use conclave_agent::{Agent, AgentRole};
use conclave_channels::CommunicationManager;
use conclave_core::config::{ConclaveConfig, OrchestratorConfig};
use conclave_core::error::{ConclaveError, Result};
use conclave_core::event::emit;
use conclave_core::handler::Handler;
use conclave_core::traits::{EventSink, Processor};
use conclave_core::types::{AgentId, DataMap, Event, EventKind, NodeId, TaskId};
use conclave_graph::{Edge, Execution, Executor, Graph, Node, NodeType};

use crate::queue::{ReadyQueue, Slot, SlotPool};
use crate::task::{Task, TaskSpec, TaskStatus};

#[derive(Default)]
struct TaskTable {
    by_id: HashMap<TaskId, Task>,
    /// Creation order.
    order: Vec<TaskId>,
}

#[derive(Default)]
struct AgentTable {
    by_id: HashMap<AgentId, Arc<Agent>>,
    /// Agent ids per role, in registration order.
    by_role: HashMap<AgentRole, Vec<AgentId>>,
}

impl AgentTable {
    /// The first agent registered for `role`.
    fn first_for(&self, role: AgentRole) -> Option<Arc<Agent>> {
        self.by_role
            .get(&role)
            .and_then(|ids| ids.first())
            .and_then(|id| self.by_id.get(id))
            .cloned()
    }
}

/// Turns task specs into scheduled, agent-assigned runs under a
/// concurrency bound.
///
/// A task is queued once every dependency has completed and an agent for
/// its role is registered. A slot is taken from the pool before the task
/// is assigned, and released when the run ends. Completing a task
/// re-schedules the pending tasks that depend on it.
pub struct Orchestrator {
    config: OrchestratorConfig,
    tasks: RwLock<TaskTable>,
    agents: RwLock<AgentTable>,
    /// Cancellation tokens of tasks currently running.
    tokens: RwLock<HashMap<TaskId, CancellationToken>>,
    queue: ReadyQueue,
    slots: SlotPool,
    comm: Arc<CommunicationManager>,
    workflow: Arc<Graph>,
    executor: Executor,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    events: Option<Arc<dyn EventSink>>,
}

impl Orchestrator {
    pub fn new(config: ConclaveConfig, events: Option<Arc<dyn EventSink>>) -> Arc<Self> {
        let mut workflow = Graph::new("workflow");
        let mut comm = CommunicationManager::new(config.communication.clone());
        if let Some(ref sink) = events {
            workflow = workflow.with_event_sink(sink.clone());
            comm = comm.with_event_sink(sink.clone());
        }
        let workflow = Arc::new(workflow);
        let mut executor = Executor::new(workflow.clone(), config.executor.clone());
        if let Some(ref sink) = events {
            executor = executor.with_event_sink(sink.clone());
        }

        info!(
            max_concurrent_tasks = config.orchestrator.max_concurrent_tasks,
            default_timeout_secs = config.orchestrator.default_task_timeout_secs,
            "Orchestrator created"
        );

        Arc::new(Self {
            slots: SlotPool::new(config.orchestrator.max_concurrent_tasks),
            config: config.orchestrator,
            tasks: RwLock::new(TaskTable::default()),
            agents: RwLock::new(AgentTable::default()),
            tokens: RwLock::new(HashMap::new()),
            queue: ReadyQueue::new(),
            comm: Arc::new(comm),
            workflow,
            executor,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            events,
        })
    }

    pub fn communication(&self) -> &Arc<CommunicationManager> {
        &self.comm
    }

    /// Graph mirroring every registered agent, used by `execute_workflow`.
    pub fn workflow(&self) -> &Arc<Graph> {
        &self.workflow
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn event_sink(&self) -> Option<&Arc<dyn EventSink>> {
        self.events.as_ref()
    }

    // ── Agents ─────────────────────────────────────────────────

    /// Register an agent for task assignment, messaging and workflows.
    ///
    /// Pending tasks waiting for the agent's role are scheduled again.
    pub fn register_agent(self: &Arc<Self>, agent: Arc<Agent>) -> Result<()> {
        {
            let mut agents = self.agents.write();
            if agents.by_id.contains_key(agent.id()) {
                return Err(ConclaveError::Precondition(format!(
                    "agent {} is already registered",
                    agent.id()
                )));
            }
            agents.by_id.insert(agent.id().clone(), agent.clone());
            agents
                .by_role
                .entry(agent.role())
                .or_default()
                .push(agent.id().clone());
        }

        self.comm.register_agent(agent.clone());
        let processor: Arc<dyn Processor> = agent.clone();
        self.workflow.insert_node(
            Node::new(NodeType::Agent, agent.name(), Handler::Process(processor))
                .with_id(agent.id().as_str())
                .with_metadata("role", serde_json::json!(agent.role())),
        );

        info!(
            agent = %agent.name(),
            agent_id = %agent.id(),
            role = %agent.role(),
            "Agent registered"
        );
        emit(
            &self.events,
            Event::new(EventKind::AgentRegistered)
                .with_agent(agent.id())
                .with_data(serde_json::json!({
                    "name": agent.name(),
                    "role": agent.role(),
                    "capabilities": agent.capabilities(),
                })),
        );

        let waiting: Vec<TaskId> = {
            let tasks = self.tasks.read();
            tasks
                .order
                .iter()
                .filter_map(|id| tasks.by_id.get(id))
                .filter(|t| t.status == TaskStatus::Pending && t.agent_role == agent.role())
                .map(|t| t.id.clone())
                .collect()
        };
        for id in waiting {
            self.schedule_task(&id)?;
        }
        Ok(())
    }

    pub fn get_agent(&self, id: &AgentId) -> Result<Arc<Agent>> {
        self.agents
            .read()
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| ConclaveError::not_found("agent", id))
    }

    /// Agents registered for `role`, in registration order.
    pub fn get_agents_by_role(&self, role: AgentRole) -> Vec<Arc<Agent>> {
        let agents = self.agents.read();
        agents
            .by_role
            .get(&role)
            .map(|ids| ids.iter().filter_map(|id| agents.by_id.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn agents(&self) -> Vec<Arc<Agent>> {
        let mut all: Vec<Arc<Agent>> = self.agents.read().by_id.values().cloned().collect();
        all.sort_by_key(|a| a.created_at());
        all
    }

    /// Add a workflow edge from one agent to another.
    pub fn link_agents(
        &self,
        from: &AgentId,
        to: &AgentId,
        name: impl Into<String>,
    ) -> Result<Edge> {
        self.workflow.add_edge(&agent_node(from), &agent_node(to), name)
    }

    /// Run the agent workflow graph from `start`, bypassing task semantics.
    pub fn execute_workflow(
        &self,
        start: &AgentId,
        inputs: DataMap,
        metadata: DataMap,
    ) -> Result<Execution> {
        self.get_agent(start)?;
        self.executor.execute(&agent_node(start), inputs, metadata)
    }

    // ── Tasks ──────────────────────────────────────────────────

    /// Store a new `pending` task and hand it to the scheduler.
    pub fn create_task(self: &Arc<Self>, spec: TaskSpec) -> Result<Task> {
        let task = Task::from_spec(spec, self.config.default_task_timeout(), &self.config.retry);
        {
            let mut tasks = self.tasks.write();
            tasks.order.push(task.id.clone());
            tasks.by_id.insert(task.id.clone(), task.clone());
        }

        info!(
            task_id = %task.id,
            name = %task.name,
            role = %task.agent_role,
            priority = ?task.priority,
            dependencies = task.dependencies.len(),
            "Task created"
        );
        emit(&self.events, task_event(EventKind::TaskCreated, &task));

        self.schedule_task(&task.id)?;
        Ok(task)
    }

    /// Queue a pending task if it is ready.
    ///
    /// A task with an unfinished dependency, or whose role has no agent,
    /// stays pending; it is retried when the dependency completes or an
    /// agent for the role registers. Anything but `pending` is a no-op.
    pub fn schedule_task(self: &Arc<Self>, id: &TaskId) -> Result<()> {
        let (priority, role) = {
            let tasks = self.tasks.read();
            let task = tasks
                .by_id
                .get(id)
                .ok_or_else(|| ConclaveError::not_found("task", id))?;
            if task.status != TaskStatus::Pending {
                return Ok(());
            }
            let blocker = task.dependencies.iter().find(|dep| {
                tasks
                    .by_id
                    .get(*dep)
                    .map(|d| d.status != TaskStatus::Completed)
                    .unwrap_or(true)
            });
            if let Some(dep) = blocker {
                debug!(task_id = %id, dependency = %dep, "Task deferred on dependency");
                return Ok(());
            }
            (task.priority, task.agent_role)
        };

        if self.agents.read().first_for(role).is_none() {
            debug!(task_id = %id, role = %role, "Task deferred, no agent for role");
            return Ok(());
        }

        if !self.queue.contains(id) {
            // Announced before the push; once queued, a concurrent pump may
            // assign and start the task at any moment.
            let queued = self.tasks.read().by_id.get(id).cloned();
            if let Some(task) = queued {
                emit(&self.events, task_event(EventKind::TaskQueued, &task));
            }
            if self.queue.push(id.clone(), priority) {
                debug!(task_id = %id, priority = ?priority, "Task queued");
            }
        }
        self.pump();
        Ok(())
    }

    /// Force a queued or pending task to run now, bypassing the queue order.
    ///
    /// Dependencies must be complete and a slot must be free.
    pub fn execute_task(self: &Arc<Self>, id: &TaskId) -> Result<()> {
        let task = self.get_task(id)?;
        if task.status != TaskStatus::Pending {
            return Err(ConclaveError::InvalidTransition {
                entity: "task",
                from: task.status.to_string(),
                to: TaskStatus::Assigned.to_string(),
            });
        }
        {
            let tasks = self.tasks.read();
            for dep in &task.dependencies {
                let done = tasks
                    .by_id
                    .get(dep)
                    .map(|d| d.status == TaskStatus::Completed)
                    .unwrap_or(false);
                if !done {
                    return Err(ConclaveError::Precondition(format!(
                        "task {} depends on unfinished task {}",
                        id, dep
                    )));
                }
            }
        }
        let slot = self.slots.try_acquire().ok_or_else(|| {
            ConclaveError::Precondition(format!(
                "all {} task slots are busy",
                self.slots.capacity()
            ))
        })?;
        self.queue.remove(id);
        match self.assign(id) {
            Some(agent) => {
                self.launch(id.clone(), agent, slot);
                Ok(())
            }
            None => Err(ConclaveError::Precondition(format!(
                "no agent registered for role {}",
                task.agent_role
            ))),
        }
    }

    /// Cancel a task that has not finished.
    ///
    /// A running handler sees its token cancelled; the task is marked
    /// `cancelled` immediately and never transitions again.
    pub fn cancel_task(&self, id: &TaskId) -> Result<Task> {
        let task = {
            let mut tasks = self.tasks.write();
            let task = tasks
                .by_id
                .get_mut(id)
                .ok_or_else(|| ConclaveError::not_found("task", id))?;
            if task.status.is_terminal() {
                return Err(ConclaveError::InvalidTransition {
                    entity: "task",
                    from: task.status.to_string(),
                    to: TaskStatus::Cancelled.to_string(),
                });
            }
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(Utc::now());
            task.clone()
        };

        self.queue.remove(id);
        if let Some(token) = self.tokens.write().remove(id) {
            token.cancel();
        }

        info!(task_id = %id, name = %task.name, "Task cancelled");
        emit(&self.events, task_event(EventKind::TaskCancelled, &task));
        Ok(task)
    }

    pub fn get_task(&self, id: &TaskId) -> Result<Task> {
        self.tasks
            .read()
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| ConclaveError::not_found("task", id))
    }

    /// Every task, in creation order.
    pub fn list_tasks(&self) -> Vec<Task> {
        let tasks = self.tasks.read();
        tasks
            .order
            .iter()
            .filter_map(|id| tasks.by_id.get(id).cloned())
            .collect()
    }

    pub fn list_tasks_by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.list_tasks()
            .into_iter()
            .filter(|t| t.status == status)
            .collect()
    }

    /// Number of tasks in each status.
    pub fn task_counts(&self) -> HashMap<TaskStatus, usize> {
        let mut counts: HashMap<TaskStatus, usize> =
            TaskStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        for task in self.tasks.read().by_id.values() {
            *counts.entry(task.status).or_default() += 1;
        }
        counts
    }

    /// Tasks currently holding an execution slot.
    pub fn running_tasks(&self) -> usize {
        self.slots.running()
    }

    pub fn max_concurrent_tasks(&self) -> usize {
        self.slots.capacity()
    }

    pub fn queued_tasks(&self) -> usize {
        self.queue.len()
    }

    /// Poll until the task is terminal, for at most `wait`.
    pub async fn wait_for_task(&self, id: &TaskId, wait: Duration) -> Result<Task> {
        let deadline = tokio::time::Instant::now() + wait;
        let interval = self.config.poll_interval();
        loop {
            let task = self.get_task(id)?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ConclaveError::Timeout {
                    target: format!("wait for task {}", id),
                    timeout_ms: wait.as_millis() as u64,
                });
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Cancel running work and wait for every background task to finish.
    pub async fn shutdown(&self) {
        info!(
            running = self.running_tasks(),
            queued = self.queue.len(),
            "Orchestrator shutting down"
        );
        self.shutdown.cancel();
        self.slots.close();
        self.tracker.close();
        self.tracker.wait().await;
        self.executor.shutdown().await;
        self.comm.shutdown().await;
    }

    // ── Scheduling internals ───────────────────────────────────

    /// Start queued tasks while slots are free.
    fn pump(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        loop {
            let Some(slot) = self.slots.try_acquire() else {
                return;
            };

            let mut launched = false;
            while let Some(id) = self.queue.pop() {
                if let Some(agent) = self.assign(&id) {
                    self.launch(id, agent, slot);
                    launched = true;
                    break;
                }
            }

            if !launched {
                // The slot was dropped unused. A push that raced with this
                // pump may have found no free slot, so look once more.
                if self.queue.is_empty() {
                    return;
                }
            }
        }
    }

    /// Move a pending task to `assigned`, picking the first agent for its role.
    fn assign(&self, id: &TaskId) -> Option<Arc<Agent>> {
        let role = self.tasks.read().by_id.get(id).map(|t| t.agent_role)?;
        let agent = self.agents.read().first_for(role)?;

        let task = {
            let mut tasks = self.tasks.write();
            let task = tasks.by_id.get_mut(id)?;
            if task.status != TaskStatus::Pending {
                return None;
            }
            task.status = TaskStatus::Assigned;
            task.assigned_agent = Some(agent.id().clone());
            task.clone()
        };

        debug!(task_id = %id, agent_id = %agent.id(), "Task assigned");
        emit(
            &self.events,
            task_event(EventKind::TaskAssigned, &task).with_agent(agent.id()),
        );
        Some(agent)
    }

    fn launch(self: &Arc<Self>, id: TaskId, agent: Arc<Agent>, slot: Slot) {
        let orchestrator = self.clone();
        self.tracker
            .spawn(async move { orchestrator.run_task(id, agent, slot).await });
    }

    async fn run_task(self: Arc<Self>, id: TaskId, agent: Arc<Agent>, slot: Slot) {
        let token = self.shutdown.child_token();
        let started = {
            let mut tasks = self.tasks.write();
            match tasks.by_id.get_mut(&id) {
                Some(task) if task.status == TaskStatus::Assigned => {
                    task.status = TaskStatus::InProgress;
                    task.started_at.get_or_insert_with(Utc::now);
                    task.attempts += 1;
                    // Registered before the status lock drops, so a concurrent
                    // cancel always finds the token.
                    self.tokens.write().insert(id.clone(), token.clone());
                    Some(task.clone())
                }
                _ => None,
            }
        };
        let Some(task) = started else {
            debug!(task_id = %id, "Task left assigned state before start");
            drop(slot);
            self.pump();
            return;
        };

        info!(
            task_id = %id,
            name = %task.name,
            agent = %agent.name(),
            attempt = task.attempts,
            "Task started"
        );
        emit(
            &self.events,
            task_event(EventKind::TaskStarted, &task).with_agent(agent.id()),
        );

        let timeout = task.timeout();
        let work = agent.process(token.clone(), task.inputs.clone());
        let result = tokio::select! {
            outcome = tokio::time::timeout(timeout, work) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        token.cancel();
                        Err(ConclaveError::Timeout {
                            target: format!("task {}", task.name),
                            timeout_ms: timeout.as_millis() as u64,
                        })
                    }
                }
            }
            _ = token.cancelled() => Err(ConclaveError::Cancelled),
        };

        self.tokens.write().remove(&id);
        let completed = self.finish(&id, result);
        drop(slot);

        if completed {
            self.schedule_dependents(&id);
        }
        self.pump();
    }

    /// Record the outcome of one run. Returns true if the task completed.
    fn finish(self: &Arc<Self>, id: &TaskId, result: Result<DataMap>) -> bool {
        let mut retry_after = None;
        let (task, kind) = {
            let mut tasks = self.tasks.write();
            let Some(task) = tasks.by_id.get_mut(id) else {
                return false;
            };
            if task.status != TaskStatus::InProgress {
                // Cancelled while running; the outcome is dropped.
                debug!(task_id = %id, status = %task.status, "Discarding outcome of finished task");
                return false;
            }
            let kind = match result {
                Ok(outputs) => {
                    task.status = TaskStatus::Completed;
                    task.outputs = outputs;
                    task.error = None;
                    task.completed_at = Some(Utc::now());
                    EventKind::TaskCompleted
                }
                Err(e) if task.can_retry() => {
                    task.status = TaskStatus::Pending;
                    task.assigned_agent = None;
                    task.error = Some(e.to_string());
                    retry_after = Some(task.retry.backoff(task.attempts));
                    EventKind::TaskRetrying
                }
                Err(e) => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(e.to_string());
                    task.completed_at = Some(Utc::now());
                    EventKind::TaskFailed
                }
            };
            (task.clone(), kind)
        };

        match kind {
            EventKind::TaskCompleted => info!(
                task_id = %id,
                name = %task.name,
                elapsed_ms = task.elapsed_ms().unwrap_or_default(),
                "Task completed"
            ),
            EventKind::TaskRetrying => warn!(
                task_id = %id,
                attempt = task.attempts,
                error = task.error.as_deref().unwrap_or_default(),
                "Task failed, retrying"
            ),
            _ => warn!(
                task_id = %id,
                name = %task.name,
                error = task.error.as_deref().unwrap_or_default(),
                "Task failed"
            ),
        }

        let mut event = task_event(kind, &task);
        if let Some(backoff) = retry_after {
            event.data["backoff_ms"] = serde_json::json!(backoff.as_millis() as u64);
        }
        emit(&self.events, event);
        if let Some(backoff) = retry_after {
            self.schedule_retry(id.clone(), backoff);
        }

        kind == EventKind::TaskCompleted
    }

    fn schedule_retry(self: &Arc<Self>, id: TaskId, backoff: Duration) {
        let orchestrator = self.clone();
        let shutdown = self.shutdown.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {
                    if let Err(e) = orchestrator.schedule_task(&id) {
                        warn!(task_id = %id, error = %e, "Retry scheduling failed");
                    }
                }
                _ = shutdown.cancelled() => {}
            }
        });
    }

    /// Re-schedule pending tasks that depend on `completed`.
    fn schedule_dependents(self: &Arc<Self>, completed: &TaskId) {
        let dependents: Vec<TaskId> = {
            let tasks = self.tasks.read();
            tasks
                .order
                .iter()
                .filter_map(|id| tasks.by_id.get(id))
                .filter(|t| t.status == TaskStatus::Pending && t.depends_on(completed))
                .map(|t| t.id.clone())
                .collect()
        };
        for id in dependents {
            if let Err(e) = self.schedule_task(&id) {
                warn!(task_id = %id, error = %e, "Dependent scheduling failed");
            }
        }
    }
}

fn agent_node(id: &AgentId) -> NodeId {
    NodeId::from(id.as_str())
}

fn task_event(kind: EventKind, task: &Task) -> Event {
    let mut event = Event::new(kind)
        .with_task(&task.id)
        .with_data(serde_json::json!({
            "name": task.name,
            "status": task.status,
            "agent_role": task.agent_role,
            "priority": task.priority,
            "attempts": task.attempts,
            "error": task.error,
        }));
    if let Some(ref agent) = task.assigned_agent {
        event = event.with_agent(agent);
    }
    event
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("tasks", &self.tasks.read().by_id.len())
            .field("agents", &self.agents.read().by_id.len())
            .field("running", &self.running_tasks())
            .field("queued", &self.queue.len())
            .finish()
    }
}
