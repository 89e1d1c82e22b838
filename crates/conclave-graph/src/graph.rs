use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use conclave_core::error::{ConclaveError, Result};
use conclave_core::event::emit;
use conclave_core::handler::Handler;
use conclave_core::traits::EventSink;
use conclave_core::types::{DataMap, EdgeId, Event, EventKind, GraphId, NodeId};

use crate::edge::Edge;
use crate::node::{Node, NodeType};

/// Callback fed each node's outputs as soon as the node finishes.
pub type ResultObserver = Arc<dyn Fn(&NodeId, &DataMap) + Send + Sync>;

/// In-memory directed graph of executable nodes.
///
/// Nodes and edges sit behind independent locks. Writers always take the
/// node lock before the edge lock, so an edge can never outlive one of its
/// endpoints.
pub struct Graph {
    id: GraphId,
    name: String,
    nodes: RwLock<HashMap<NodeId, Node>>,
    edges: RwLock<Vec<Edge>>,
    events: Option<Arc<dyn EventSink>>,
}

/// Shared bookkeeping for one `traverse_async` run.
struct AsyncRun {
    visited: Mutex<HashSet<NodeId>>,
    results: Mutex<HashMap<NodeId, DataMap>>,
    tracker: TaskTracker,
    observer: Option<ResultObserver>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: GraphId::new(),
            name: name.into(),
            nodes: RwLock::new(HashMap::new()),
            edges: RwLock::new(Vec::new()),
            events: None,
        }
    }

    /// Publish node and edge mutations to `sink`.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn id(&self) -> &GraphId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ── Nodes ──────────────────────────────────────────────────

    /// Create a node with a generated id and add it to the graph.
    pub fn add_node(&self, node_type: NodeType, name: impl Into<String>, handler: Handler) -> Node {
        self.insert_node(Node::new(node_type, name, handler))
    }

    /// Add a prebuilt node. A node with the same id is replaced.
    pub fn insert_node(&self, node: Node) -> Node {
        debug!(graph = %self.name, node_id = %node.id, name = %node.name, "Adding node");
        self.nodes.write().insert(node.id.clone(), node.clone());
        emit(
            &self.events,
            Event::new(EventKind::NodeAdded)
                .with_system(&self.id)
                .with_data(serde_json::json!({
                    "node_id": node.id,
                    "name": node.name,
                    "node_type": node.node_type,
                })),
        );
        node
    }

    /// Remove a node and every edge that references it.
    pub fn remove_node(&self, id: &NodeId) -> Result<Node> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .remove(id)
            .ok_or_else(|| ConclaveError::not_found("node", id))?;

        let removed_edges = {
            let mut edges = self.edges.write();
            let before = edges.len();
            edges.retain(|e| !e.references(id));
            before - edges.len()
        };
        drop(nodes);

        debug!(graph = %self.name, node_id = %id, removed_edges, "Removed node");
        emit(
            &self.events,
            Event::new(EventKind::NodeRemoved)
                .with_system(&self.id)
                .with_data(serde_json::json!({
                    "node_id": id,
                    "removed_edges": removed_edges,
                })),
        );
        Ok(node)
    }

    pub fn get_node(&self, id: &NodeId) -> Result<Node> {
        self.nodes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ConclaveError::not_found("node", id))
    }

    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.nodes.read().contains_key(id)
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.read().values().cloned().collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// Write one entry of a node's state.
    pub fn set_node_state(
        &self,
        id: &NodeId,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<()> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| ConclaveError::not_found("node", id))?;
        node.state.insert(key.into(), value);
        Ok(())
    }

    /// Snapshot of a node's state.
    pub fn node_state(&self, id: &NodeId) -> Result<DataMap> {
        self.nodes
            .read()
            .get(id)
            .map(|n| n.state.clone())
            .ok_or_else(|| ConclaveError::not_found("node", id))
    }

    // ── Edges ──────────────────────────────────────────────────

    /// Connect two existing nodes with a weight-1.0 edge.
    pub fn add_edge(
        &self,
        source: &NodeId,
        target: &NodeId,
        name: impl Into<String>,
    ) -> Result<Edge> {
        self.add_weighted_edge(source, target, name, 1.0)
    }

    pub fn add_weighted_edge(
        &self,
        source: &NodeId,
        target: &NodeId,
        name: impl Into<String>,
        weight: f64,
    ) -> Result<Edge> {
        // Hold the node lock so neither endpoint can vanish before the edge lands.
        let nodes = self.nodes.read();
        for endpoint in [source, target] {
            if !nodes.contains_key(endpoint) {
                return Err(ConclaveError::not_found("node", endpoint));
            }
        }

        let edge = Edge::new(source.clone(), target.clone(), name).with_weight(weight);
        self.edges.write().push(edge.clone());
        drop(nodes);

        debug!(graph = %self.name, source = %source, target = %target, "Added edge");
        emit(
            &self.events,
            Event::new(EventKind::EdgeAdded)
                .with_system(&self.id)
                .with_data(serde_json::json!({
                    "edge_id": edge.id,
                    "source": edge.source,
                    "target": edge.target,
                    "name": edge.name,
                })),
        );
        Ok(edge)
    }

    pub fn remove_edge(&self, id: &EdgeId) -> Result<Edge> {
        let edge = {
            let mut edges = self.edges.write();
            let pos = edges
                .iter()
                .position(|e| &e.id == id)
                .ok_or_else(|| ConclaveError::not_found("edge", id))?;
            edges.remove(pos)
        };
        emit(
            &self.events,
            Event::new(EventKind::EdgeRemoved)
                .with_system(&self.id)
                .with_data(serde_json::json!({ "edge_id": edge.id })),
        );
        Ok(edge)
    }

    pub fn edges(&self) -> Vec<Edge> {
        self.edges.read().clone()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.read().len()
    }

    /// Edges leaving `id`, in insertion order.
    pub fn get_outgoing_edges(&self, id: &NodeId) -> Vec<Edge> {
        self.edges
            .read()
            .iter()
            .filter(|e| &e.source == id)
            .cloned()
            .collect()
    }

    /// Edges arriving at `id`, in insertion order.
    pub fn get_incoming_edges(&self, id: &NodeId) -> Vec<Edge> {
        self.edges
            .read()
            .iter()
            .filter(|e| &e.target == id)
            .cloned()
            .collect()
    }

    /// Targets of the outgoing edges of `id`.
    pub fn successors(&self, id: &NodeId) -> Vec<NodeId> {
        self.edges
            .read()
            .iter()
            .filter(|e| &e.source == id)
            .map(|e| e.target.clone())
            .collect()
    }

    // ── Execution ──────────────────────────────────────────────

    /// Run one node's handler, recording its inputs and outputs.
    ///
    /// No lock is held while the handler runs.
    pub async fn process_node(
        &self,
        cancel: CancellationToken,
        id: &NodeId,
        inputs: DataMap,
    ) -> Result<DataMap> {
        let (handler, name) = {
            let mut nodes = self.nodes.write();
            let node = nodes
                .get_mut(id)
                .ok_or_else(|| ConclaveError::not_found("node", id))?;
            node.inputs = inputs.clone();
            (node.handler.clone(), node.name.clone())
        };

        debug!(node_id = %id, node_name = %name, shape = handler.shape(), "Processing node");
        let outputs = handler.run(cancel, inputs).await?;

        if let Some(node) = self.nodes.write().get_mut(id) {
            node.outputs = outputs.clone();
        }
        Ok(outputs)
    }

    /// Depth-first traversal, one node at a time.
    ///
    /// Each reachable node runs at most once and receives its predecessor's
    /// outputs. The first handler error aborts the whole traversal.
    pub async fn traverse(
        &self,
        cancel: CancellationToken,
        start: &NodeId,
        inputs: DataMap,
    ) -> Result<HashMap<NodeId, DataMap>> {
        self.traverse_observed(cancel, start, inputs, None).await
    }

    pub async fn traverse_observed(
        &self,
        cancel: CancellationToken,
        start: &NodeId,
        inputs: DataMap,
        observer: Option<ResultObserver>,
    ) -> Result<HashMap<NodeId, DataMap>> {
        if !self.contains_node(start) {
            return Err(ConclaveError::not_found("node", start));
        }

        let mut visited = HashSet::new();
        let mut results = HashMap::new();
        let mut stack = vec![(start.clone(), inputs)];

        while let Some((node_id, node_inputs)) = stack.pop() {
            if !visited.insert(node_id.clone()) {
                continue;
            }
            if cancel.is_cancelled() {
                info!(graph = %self.name, node_id = %node_id, "Traversal cancelled");
                return Err(ConclaveError::Cancelled);
            }

            let outputs = match self.process_node(cancel.clone(), &node_id, node_inputs).await {
                Ok(outputs) => outputs,
                Err(e) => {
                    warn!(
                        graph = %self.name,
                        node_id = %node_id,
                        error = %e,
                        "Node failed, aborting traversal"
                    );
                    return Err(e);
                }
            };
            if let Some(ref observer) = observer {
                observer(&node_id, &outputs);
            }

            // Reverse so the first outgoing edge is visited first.
            for next in self.successors(&node_id).into_iter().rev() {
                if !visited.contains(&next) {
                    stack.push((next, outputs.clone()));
                }
            }
            results.insert(node_id, outputs);
        }

        Ok(results)
    }

    /// Concurrent traversal: every node's successors run as separate tasks.
    ///
    /// A shared visited set keeps each node to a single run. A failing
    /// handler ends only its own branch; the error is logged and the rest
    /// of the graph keeps going.
    pub async fn traverse_async(
        self: &Arc<Self>,
        cancel: CancellationToken,
        start: &NodeId,
        inputs: DataMap,
    ) -> Result<HashMap<NodeId, DataMap>> {
        self.traverse_async_observed(cancel, start, inputs, None).await
    }

    pub async fn traverse_async_observed(
        self: &Arc<Self>,
        cancel: CancellationToken,
        start: &NodeId,
        inputs: DataMap,
        observer: Option<ResultObserver>,
    ) -> Result<HashMap<NodeId, DataMap>> {
        if !self.contains_node(start) {
            return Err(ConclaveError::not_found("node", start));
        }

        let run = Arc::new(AsyncRun {
            visited: Mutex::new(HashSet::new()),
            results: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            observer,
        });

        Self::spawn_branch(self.clone(), run.clone(), cancel, start.clone(), inputs);

        // Branches spawn their successors while running, so the tracker
        // only drains once every reachable branch has finished.
        run.tracker.close();
        run.tracker.wait().await;

        let results = std::mem::take(&mut *run.results.lock());
        Ok(results)
    }

    fn spawn_branch(
        graph: Arc<Graph>,
        run: Arc<AsyncRun>,
        cancel: CancellationToken,
        node_id: NodeId,
        inputs: DataMap,
    ) {
        if !run.visited.lock().insert(node_id.clone()) {
            return;
        }

        let tracker = run.tracker.clone();
        tracker.spawn(async move {
            if cancel.is_cancelled() {
                debug!(node_id = %node_id, "Skipping branch, traversal cancelled");
                return;
            }

            match graph.process_node(cancel.clone(), &node_id, inputs).await {
                Ok(outputs) => {
                    if let Some(ref observer) = run.observer {
                        observer(&node_id, &outputs);
                    }
                    run.results.lock().insert(node_id.clone(), outputs.clone());
                    for next in graph.successors(&node_id) {
                        Self::spawn_branch(
                            graph.clone(),
                            run.clone(),
                            cancel.clone(),
                            next,
                            outputs.clone(),
                        );
                    }
                }
                Err(e) => {
                    warn!(node_id = %node_id, error = %e, "Branch failed, stopping this branch");
                }
            }
        });
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("nodes", &self.node_count())
            .field("edges", &self.edge_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use conclave_core::EventBus;
    use conclave_test_utils::{data, CallLog, EventCollector, FailingProcessor, RecordingProcessor};

    fn recording(graph: &Graph, label: &str, log: &CallLog) -> NodeId {
        graph
            .insert_node(
                Node::new(
                    NodeType::Task,
                    label,
                    Handler::processor(RecordingProcessor::new(label, log.clone())),
                )
                .with_id(label),
            )
            .id
    }

    /// a → b → d, a → c → d
    fn diamond(log: &CallLog) -> (Graph, NodeId) {
        let graph = Graph::new("diamond");
        let a = recording(&graph, "a", log);
        let b = recording(&graph, "b", log);
        let c = recording(&graph, "c", log);
        let d = recording(&graph, "d", log);
        graph.add_edge(&a, &b, "ab").unwrap();
        graph.add_edge(&a, &c, "ac").unwrap();
        graph.add_edge(&b, &d, "bd").unwrap();
        graph.add_edge(&c, &d, "cd").unwrap();
        (graph, a)
    }

    #[test]
    fn test_add_edge_requires_endpoints() {
        let graph = Graph::new("g");
        let a = graph.add_node(NodeType::Data, "a", Handler::Passthrough);
        let err = graph
            .add_edge(&a.id, &NodeId::from("missing"), "x")
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_parallel_edges_allowed() {
        let graph = Graph::new("g");
        let a = graph.add_node(NodeType::Data, "a", Handler::Passthrough);
        let b = graph.add_node(NodeType::Data, "b", Handler::Passthrough);
        graph.add_edge(&a.id, &b.id, "one").unwrap();
        graph.add_weighted_edge(&a.id, &b.id, "two", 3.0).unwrap();

        assert_eq!(graph.get_outgoing_edges(&a.id).len(), 2);
        assert_eq!(graph.get_incoming_edges(&b.id).len(), 2);
        assert_eq!(graph.get_outgoing_edges(&a.id)[1].weight, 3.0);
    }

    #[test]
    fn test_remove_node_cascades_edges() {
        let log = CallLog::new();
        let (graph, _) = diamond(&log);
        assert_eq!(graph.edge_count(), 4);

        graph.remove_node(&NodeId::from("b")).unwrap();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);
        assert!(graph
            .edges()
            .iter()
            .all(|e| !e.references(&NodeId::from("b"))));

        let err = graph.remove_node(&NodeId::from("b")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_remove_edge() {
        let graph = Graph::new("g");
        let a = graph.add_node(NodeType::Data, "a", Handler::Passthrough);
        let b = graph.add_node(NodeType::Data, "b", Handler::Passthrough);
        let edge = graph.add_edge(&a.id, &b.id, "ab").unwrap();

        graph.remove_edge(&edge.id).unwrap();
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.remove_edge(&edge.id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_node_state_accessors() {
        let graph = Graph::new("g");
        let n = graph.add_node(NodeType::Service, "svc", Handler::Passthrough);
        graph
            .set_node_state(&n.id, "healthy", serde_json::json!(true))
            .unwrap();
        assert_eq!(graph.node_state(&n.id).unwrap()["healthy"], serde_json::json!(true));
        assert!(graph
            .set_node_state(&NodeId::from("nope"), "k", serde_json::json!(1))
            .is_err());
    }

    #[test]
    fn test_mutations_emit_events() {
        let bus = Arc::new(EventBus::default());
        let collector = EventCollector::attach(
            bus.as_ref(),
            &[EventKind::NodeAdded, EventKind::EdgeAdded, EventKind::NodeRemoved],
        );
        let graph = Graph::new("g").with_event_sink(bus.clone());
        let a = graph.add_node(NodeType::Data, "a", Handler::Passthrough);
        let b = graph.add_node(NodeType::Data, "b", Handler::Passthrough);
        graph.add_edge(&a.id, &b.id, "ab").unwrap();
        graph.remove_node(&a.id).unwrap();

        assert_eq!(
            collector.kinds(),
            vec![
                EventKind::NodeAdded,
                EventKind::NodeAdded,
                EventKind::EdgeAdded,
                EventKind::NodeRemoved
            ]
        );
        assert_eq!(
            collector.events()[0].system_id.as_deref(),
            Some(graph.id().as_str())
        );
    }

    #[tokio::test]
    async fn test_process_node_records_io() {
        let graph = Graph::new("g");
        let log = CallLog::new();
        let id = recording(&graph, "worker", &log);

        let out = graph
            .process_node(CancellationToken::new(), &id, data([("x", serde_json::json!(1))]))
            .await
            .unwrap();

        assert_eq!(out["worker"], serde_json::json!(true));
        let node = graph.get_node(&id).unwrap();
        assert_eq!(node.inputs["x"], serde_json::json!(1));
        assert_eq!(node.outputs["worker"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn test_traverse_visits_each_node_once() {
        let log = CallLog::new();
        let (graph, start) = diamond(&log);

        let results = graph
            .traverse(CancellationToken::new(), &start, DataMap::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 4);
        for label in ["a", "b", "c", "d"] {
            assert_eq!(log.count(label), 1, "{label} ran more than once");
        }
        // Depth-first along the first edge: a, b, d, then c.
        assert_eq!(log.entries(), vec!["a", "b", "d", "c"]);
        // d received b's outputs, which carry a's marker.
        assert_eq!(results[&NodeId::from("d")]["a"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn test_traverse_aborts_on_first_error() {
        let log = CallLog::new();
        let graph = Graph::new("g");
        let a = recording(&graph, "a", &log);
        let bad = graph
            .insert_node(
                Node::new(
                    NodeType::Task,
                    "bad",
                    Handler::processor(FailingProcessor::new("boom")),
                )
                .with_id("bad"),
            )
            .id;
        let c = recording(&graph, "c", &log);
        graph.add_edge(&a, &bad, "1").unwrap();
        graph.add_edge(&a, &c, "2").unwrap();

        let err = graph
            .traverse(CancellationToken::new(), &a, DataMap::new())
            .await
            .unwrap_err();

        assert!(err.is_handler_failure());
        assert_eq!(log.entries(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_traverse_unknown_start() {
        let graph = Graph::new("g");
        let err = graph
            .traverse(CancellationToken::new(), &NodeId::from("x"), DataMap::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_traverse_honours_cancellation() {
        let log = CallLog::new();
        let (graph, start) = diamond(&log);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = graph.traverse(cancel, &start, DataMap::new()).await.unwrap_err();
        assert!(matches!(err, ConclaveError::Cancelled));
        assert!(log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_traverse_async_visits_each_node_once() {
        let log = CallLog::new();
        let graph = Arc::new(Graph::new("async"));
        let slow = |label: &str| {
            graph
                .insert_node(
                    Node::new(
                        NodeType::Task,
                        label,
                        Handler::processor(
                            RecordingProcessor::new(label, log.clone())
                                .with_delay(Duration::from_millis(5)),
                        ),
                    )
                    .with_id(label),
                )
                .id
        };
        let a = slow("a");
        let b = slow("b");
        let c = slow("c");
        let d = slow("d");
        graph.add_edge(&a, &b, "").unwrap();
        graph.add_edge(&a, &c, "").unwrap();
        graph.add_edge(&b, &d, "").unwrap();
        graph.add_edge(&c, &d, "").unwrap();

        let results = graph
            .traverse_async(CancellationToken::new(), &a, DataMap::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 4);
        for label in ["a", "b", "c", "d"] {
            assert_eq!(log.count(label), 1);
        }
        assert_eq!(log.position("a"), Some(0));
    }

    #[tokio::test]
    async fn test_traverse_async_contains_branch_failure() {
        let log = CallLog::new();
        let graph = Arc::new(Graph::new("g"));
        let a = recording(&graph, "a", &log);
        let bad = graph
            .add_node(
                NodeType::Task,
                "bad",
                Handler::processor(FailingProcessor::new("boom")),
            )
            .id;
        let after_bad = recording(&graph, "after_bad", &log);
        let c = recording(&graph, "c", &log);
        graph.add_edge(&a, &bad, "").unwrap();
        graph.add_edge(&bad, &after_bad, "").unwrap();
        graph.add_edge(&a, &c, "").unwrap();

        let results = graph
            .traverse_async(CancellationToken::new(), &a, DataMap::new())
            .await
            .unwrap();

        assert!(results.contains_key(&a));
        assert!(results.contains_key(&c));
        assert!(!results.contains_key(&bad));
        assert_eq!(log.count("after_bad"), 0);
    }

    #[tokio::test]
    async fn test_traverse_observed_reports_each_node() {
        let log = CallLog::new();
        let (graph, start) = diamond(&log);
        let seen = CallLog::new();
        let s = seen.clone();
        let observer: ResultObserver =
            Arc::new(move |id: &NodeId, _: &DataMap| s.push(id.to_string()));

        graph
            .traverse_observed(CancellationToken::new(), &start, DataMap::new(), Some(observer))
            .await
            .unwrap();
        assert_eq!(seen.entries(), log.entries());
    }
}
