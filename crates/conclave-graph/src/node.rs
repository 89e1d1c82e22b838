use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conclave_core::handler::Handler;
use conclave_core::types::{DataMap, NodeId};

/// What a node stands for in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Agent,
    Task,
    Data,
    Service,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Agent => "agent",
            Self::Task => "task",
            Self::Data => "data",
            Self::Service => "service",
        };
        f.write_str(s)
    }
}

/// A node in the task graph.
///
/// `inputs`, `outputs` and `state` belong to the owning [`Graph`](crate::Graph)
/// and are only written through its accessors; a `Node` handed out by the
/// graph is a snapshot.
#[derive(Debug, Clone)]
pub struct Node {
    /// Unique identifier for this node.
    pub id: NodeId,
    pub node_type: NodeType,
    /// Human-readable name.
    pub name: String,
    pub handler: Handler,
    /// Inputs of the most recent run.
    pub inputs: DataMap,
    /// Outputs of the most recent successful run.
    pub outputs: DataMap,
    pub state: DataMap,
    pub metadata: DataMap,
    pub created_at: DateTime<Utc>,
}

impl Node {
    /// Create a new node with a generated id.
    pub fn new(node_type: NodeType, name: impl Into<String>, handler: Handler) -> Self {
        Self {
            id: NodeId::new(),
            node_type,
            name: name.into(),
            handler,
            inputs: DataMap::new(),
            outputs: DataMap::new(),
            state: DataMap::new(),
            metadata: DataMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Use a caller-chosen id instead of a generated one.
    pub fn with_id(mut self, id: impl Into<NodeId>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_builder() {
        let node = Node::new(NodeType::Service, "Indexer", Handler::Passthrough)
            .with_id("idx")
            .with_metadata("owner", serde_json::json!("search"));

        assert_eq!(node.id.as_str(), "idx");
        assert_eq!(node.name, "Indexer");
        assert_eq!(node.node_type, NodeType::Service);
        assert_eq!(node.metadata["owner"], serde_json::json!("search"));
        assert!(node.inputs.is_empty());
        assert_eq!(node.handler.shape(), "passthrough");
    }

    #[test]
    fn test_node_type_display() {
        assert_eq!(NodeType::Agent.to_string(), "agent");
        assert_eq!(
            serde_json::to_string(&NodeType::Data).unwrap(),
            "\"data\""
        );
    }
}
