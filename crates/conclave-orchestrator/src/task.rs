use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conclave_agent::AgentRole;
use conclave_core::config::RetryConfig;
use conclave_core::types::{AgentId, DataMap, TaskId};

/// Task lifecycle.
///
/// `pending → assigned → in_progress → completed | failed`, and
/// `pending | assigned | in_progress → cancelled` from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        Self::Pending,
        Self::Assigned,
        Self::InProgress,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ready-queue ordering. Higher runs first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Declarative description of a task, handed to `create_task`.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub description: String,
    pub agent_role: AgentRole,
    pub inputs: DataMap,
    pub priority: TaskPriority,
    pub dependencies: Vec<TaskId>,
    /// Falls back to the orchestrator's default timeout.
    pub timeout: Option<Duration>,
    pub metadata: DataMap,
    /// Falls back to the orchestrator's default retry policy.
    pub retry: Option<RetryConfig>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, agent_role: AgentRole) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            agent_role,
            inputs: DataMap::new(),
            priority: TaskPriority::default(),
            dependencies: vec![],
            timeout: None,
            metadata: DataMap::new(),
            retry: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_inputs(mut self, inputs: DataMap) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, task: &TaskId) -> Self {
        self.dependencies.push(task.clone());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// A unit of work whose lifecycle is driven by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    pub agent_role: AgentRole,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub inputs: DataMap,
    pub outputs: DataMap,
    pub dependencies: Vec<TaskId>,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub assigned_agent: Option<AgentId>,
    /// Handler runs so far, including the current one.
    pub attempts: u32,
    pub retry: RetryConfig,
    pub metadata: DataMap,
}

impl Task {
    pub(crate) fn from_spec(
        spec: TaskSpec,
        default_timeout: Duration,
        default_retry: &RetryConfig,
    ) -> Self {
        Self {
            id: TaskId::new(),
            name: spec.name,
            description: spec.description,
            agent_role: spec.agent_role,
            status: TaskStatus::Pending,
            priority: spec.priority,
            inputs: spec.inputs,
            outputs: DataMap::new(),
            dependencies: spec.dependencies,
            timeout_ms: spec.timeout.unwrap_or(default_timeout).as_millis() as u64,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            assigned_agent: None,
            attempts: 0,
            retry: spec.retry.unwrap_or_else(|| default_retry.clone()),
            metadata: spec.metadata,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn depends_on(&self, other: &TaskId) -> bool {
        self.dependencies.contains(other)
    }

    /// Whether a failed attempt may be retried.
    pub fn can_retry(&self) -> bool {
        self.attempts <= self.retry.max_retries
    }

    pub fn elapsed_ms(&self) -> Option<i64> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        Some((completed - started).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_spec_applies_defaults() {
        let spec = TaskSpec::new("plan", AgentRole::Planner);
        let task = Task::from_spec(spec, Duration::from_secs(300), &RetryConfig::default());

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, TaskPriority::Normal);
        assert_eq!(task.timeout(), Duration::from_secs(300));
        assert_eq!(task.retry.max_retries, 0);
        assert!(task.assigned_agent.is_none());
    }

    #[test]
    fn test_from_spec_keeps_overrides() {
        let dep = TaskId::from("dep");
        let retry = RetryConfig {
            max_retries: 2,
            ..RetryConfig::default()
        };
        let spec = TaskSpec::new("build", AgentRole::CodeGenerator)
            .with_priority(TaskPriority::High)
            .with_timeout(Duration::from_millis(250))
            .with_retry(retry)
            .depends_on(&dep);
        let task = Task::from_spec(spec, Duration::from_secs(300), &RetryConfig::default());

        assert_eq!(task.timeout_ms, 250);
        assert!(task.depends_on(&dep));
        assert_eq!(task.retry.max_retries, 2);
    }

    #[test]
    fn test_can_retry_counts_attempts() {
        let mut task = Task::from_spec(
            TaskSpec::new("t", AgentRole::Verifier).with_retry(RetryConfig {
                max_retries: 1,
                ..RetryConfig::default()
            }),
            Duration::from_secs(1),
            &RetryConfig::default(),
        );
        task.attempts = 1;
        assert!(task.can_retry());
        task.attempts = 2;
        assert!(!task.can_retry());
    }

    #[test]
    fn test_priority_order_and_names() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::Low < TaskPriority::Normal);
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Assigned.is_terminal());
    }
}
