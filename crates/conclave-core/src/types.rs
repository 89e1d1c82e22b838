use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Keyed JSON payload used for handler inputs, outputs, state and metadata.
pub type DataMap = HashMap<String, serde_json::Value>;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_type!(
    /// Unique identifier of a graph node.
    NodeId
);
id_type!(
    /// Unique identifier of a graph edge.
    EdgeId
);
id_type!(
    /// Unique identifier of a graph.
    GraphId
);
id_type!(
    /// Unique identifier of one graph traversal run.
    ExecutionId
);
id_type!(
    /// Unique agent identifier.
    AgentId
);
id_type!(
    /// Unique task identifier.
    TaskId
);
id_type!(
    /// Unique communication channel identifier.
    ChannelId
);
id_type!(
    /// Unique message identifier.
    MessageId
);
id_type!(
    /// Identifier of an orchestrated system (one orchestrator instance).
    SystemId
);

/// Kind of event published to an event sink.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // Graph
    NodeAdded,
    NodeRemoved,
    EdgeAdded,
    EdgeRemoved,
    // Executions
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
    // Agents
    AgentRegistered,
    AgentStateChanged,
    AgentProcessed,
    AgentFailed,
    // Tasks
    TaskCreated,
    TaskQueued,
    TaskAssigned,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskRetrying,
    TaskCancelled,
    // Channels and messages
    ChannelCreated,
    ChannelStateChanged,
    ChannelClosed,
    MessageSent,
    MessageProcessed,
    MessageFailed,
    ReplySent,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NodeAdded => "node_added",
            Self::NodeRemoved => "node_removed",
            Self::EdgeAdded => "edge_added",
            Self::EdgeRemoved => "edge_removed",
            Self::ExecutionStarted => "execution_started",
            Self::ExecutionCompleted => "execution_completed",
            Self::ExecutionFailed => "execution_failed",
            Self::ExecutionCancelled => "execution_cancelled",
            Self::AgentRegistered => "agent_registered",
            Self::AgentStateChanged => "agent_state_changed",
            Self::AgentProcessed => "agent_processed",
            Self::AgentFailed => "agent_failed",
            Self::TaskCreated => "task_created",
            Self::TaskQueued => "task_queued",
            Self::TaskAssigned => "task_assigned",
            Self::TaskStarted => "task_started",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::TaskRetrying => "task_retrying",
            Self::TaskCancelled => "task_cancelled",
            Self::ChannelCreated => "channel_created",
            Self::ChannelStateChanged => "channel_state_changed",
            Self::ChannelClosed => "channel_closed",
            Self::MessageSent => "message_sent",
            Self::MessageProcessed => "message_processed",
            Self::MessageFailed => "message_failed",
            Self::ReplySent => "reply_sent",
        }
    }

    /// Whether this event reports a task lifecycle transition.
    pub fn is_task(&self) -> bool {
        matches!(
            self,
            Self::TaskCreated
                | Self::TaskQueued
                | Self::TaskAssigned
                | Self::TaskStarted
                | Self::TaskCompleted
                | Self::TaskFailed
                | Self::TaskRetrying
                | Self::TaskCancelled
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit event delivered to an [`EventSink`](crate::traits::EventSink).
///
/// Events carry the ids of every entity they concern so subscribers can
/// filter without parsing `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            timestamp: Utc::now(),
            agent_id: None,
            task_id: None,
            channel_id: None,
            system_id: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_agent(mut self, id: &AgentId) -> Self {
        self.agent_id = Some(id.clone());
        self
    }

    pub fn with_task(mut self, id: &TaskId) -> Self {
        self.task_id = Some(id.clone());
        self
    }

    pub fn with_channel(mut self, id: &ChannelId) -> Self {
        self.channel_id = Some(id.clone());
        self
    }

    pub fn with_system(mut self, id: impl std::fmt::Display) -> Self {
        self.system_id = Some(id.to_string());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}
