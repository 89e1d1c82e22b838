use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conclave_core::types::{DataMap, ExecutionId, GraphId, NodeId};

/// Lifecycle of one graph traversal run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal states are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one traversal run started by the [`Executor`](crate::Executor).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub graph_id: GraphId,
    pub start_node: NodeId,
    pub status: ExecutionStatus,
    /// Outputs per node, filled in as nodes finish.
    pub results: HashMap<NodeId, DataMap>,
    pub inputs: DataMap,
    pub metadata: DataMap,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Execution {
    pub fn new(graph_id: GraphId, start_node: NodeId, inputs: DataMap, metadata: DataMap) -> Self {
        Self {
            id: ExecutionId::new(),
            graph_id,
            start_node,
            status: ExecutionStatus::Pending,
            results: HashMap::new(),
            inputs,
            metadata,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Move `pending` to `running`. Returns false if the run was already
    /// cancelled or started.
    pub(crate) fn start(&mut self) -> bool {
        if self.status != ExecutionStatus::Pending {
            return false;
        }
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// Move to a terminal state. Returns false, changing nothing, if the run
    /// is already terminal.
    pub(crate) fn finish(&mut self, status: ExecutionStatus, error: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.error = error;
        self.completed_at = Some(Utc::now());
        true
    }

    /// Wall-clock run time, once finished.
    pub fn elapsed_ms(&self) -> Option<i64> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        Some((completed - started).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution() -> Execution {
        Execution::new(GraphId::new(), NodeId::from("start"), DataMap::new(), DataMap::new())
    }

    #[test]
    fn test_new_is_pending() {
        let exec = execution();
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert!(exec.started_at.is_none());
        assert!(exec.elapsed_ms().is_none());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut exec = execution();
        assert!(exec.start());
        assert!(!exec.start());
        assert!(exec.finish(ExecutionStatus::Cancelled, None));
        assert!(!exec.finish(ExecutionStatus::Completed, None));
        assert_eq!(exec.status, ExecutionStatus::Cancelled);
        assert!(exec.elapsed_ms().is_some());
    }

    #[test]
    fn test_cancelled_before_start_never_runs() {
        let mut exec = execution();
        assert!(exec.finish(ExecutionStatus::Cancelled, None));
        assert!(!exec.start());
    }
}
