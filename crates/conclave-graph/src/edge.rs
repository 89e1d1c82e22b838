use serde::{Deserialize, Serialize};

use conclave_core::types::{EdgeId, NodeId};

fn default_weight() -> f64 {
    1.0
}

/// A directed edge connecting two nodes in the graph.
///
/// Several edges may share the same endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    /// Source node id.
    pub source: NodeId,
    /// Target node id.
    pub target: NodeId,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

impl Edge {
    /// Create an edge of weight 1.0 with a generated id.
    pub fn new(source: NodeId, target: NodeId, name: impl Into<String>) -> Self {
        Self {
            id: EdgeId::new(),
            source,
            target,
            name: name.into(),
            weight: default_weight(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Whether this edge touches `node` at either end.
    pub fn references(&self, node: &NodeId) -> bool {
        &self.source == node || &self.target == node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_builder() {
        let e = Edge::new(NodeId::from("a"), NodeId::from("b"), "feeds").with_weight(2.5);
        assert_eq!(e.source.as_str(), "a");
        assert_eq!(e.target.as_str(), "b");
        assert_eq!(e.name, "feeds");
        assert_eq!(e.weight, 2.5);
        assert!(e.references(&NodeId::from("b")));
        assert!(!e.references(&NodeId::from("c")));
    }

    #[test]
    fn test_weight_defaults_when_missing() {
        let json = r#"{"id": "e1", "source": "a", "target": "b"}"#;
        let edge: Edge = serde_json::from_str(json).unwrap();
        assert_eq!(edge.weight, 1.0);
        assert!(edge.name.is_empty());
    }
}
