/// Petgraph-based process graph
///
/// Compiles a `ProcessModel` into an arena graph: nodes live in a petgraph
/// `DiGraph`, flows are edges, and every lookup goes through node ids mapped to
/// `NodeIndex`. Cycles are allowed (loops back to a task are legal BPMN); the
/// engine bounds traversal instead. All structural validation happens here, so a
/// `ProcessGraph` that exists is safe to execute.

use crate::error::{EngineError, EngineResult};
use crate::process::types::{Node, NodeKind, ProcessModel, SequenceFlow};
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

/// Upper bound for user task due dates (100 years)
const MAX_DUE_IN_HOURS: i64 = 100 * 366 * 24;

/// Executable form of a process model
#[derive(Debug, Clone)]
pub struct ProcessGraph {
    /// Node arena; edge weights are the model flows
    graph: DiGraph<Node, SequenceFlow>,
    /// Mapping from node ID to graph node index
    node_id_to_index: HashMap<String, NodeIndex>,
    /// The single start event
    start_index: NodeIndex,
}

impl ProcessGraph {
    /// Build and validate the graph for a parsed process
    pub fn build(model: &ProcessModel) -> EngineResult<Self> {
        tracing::debug!("🏗️ Building process graph for '{}'", model.key);

        if model.key.trim().is_empty() {
            return Err(EngineError::Parse("process key must not be empty".to_string()));
        }

        let mut graph = DiGraph::new();
        let mut node_id_to_index = HashMap::new();

        for node in &model.nodes {
            if node.id.trim().is_empty() {
                return Err(EngineError::Parse(format!(
                    "process '{}' contains a node without id",
                    model.key
                )));
            }
            if node_id_to_index.contains_key(&node.id) {
                return Err(EngineError::Parse(format!("duplicate node id '{}'", node.id)));
            }
            let index = graph.add_node(node.clone());
            node_id_to_index.insert(node.id.clone(), index);
        }

        let mut flow_ids = HashSet::new();
        for flow in &model.flows {
            if !flow_ids.insert(flow.id.as_str()) {
                return Err(EngineError::Parse(format!("duplicate sequence flow id '{}'", flow.id)));
            }
            let from = node_id_to_index.get(&flow.source).ok_or_else(|| {
                EngineError::Parse(format!(
                    "sequence flow '{}' references unknown source node '{}'",
                    flow.id, flow.source
                ))
            })?;
            let to = node_id_to_index.get(&flow.target).ok_or_else(|| {
                EngineError::Parse(format!(
                    "sequence flow '{}' references unknown target node '{}'",
                    flow.id, flow.target
                ))
            })?;
            // Edge indices follow insertion order, which keeps declaration order recoverable
            graph.add_edge(*from, *to, flow.clone());
        }

        let starts: Vec<NodeIndex> = graph
            .node_indices()
            .filter(|&idx| matches!(graph[idx].kind, NodeKind::StartEvent))
            .collect();
        let start_index = match starts.as_slice() {
            [single] => *single,
            [] => return Err(EngineError::Parse(format!("process '{}' has no start event", model.key))),
            _ => {
                return Err(EngineError::Parse(format!(
                    "process '{}' has {} start events, expected exactly one",
                    model.key,
                    starts.len()
                )))
            }
        };

        let ends: Vec<NodeIndex> = graph
            .node_indices()
            .filter(|&idx| matches!(graph[idx].kind, NodeKind::EndEvent))
            .collect();
        if ends.is_empty() {
            return Err(EngineError::Parse(format!("process '{}' has no end event", model.key)));
        }

        let compiled = Self {
            graph,
            node_id_to_index,
            start_index,
        };
        compiled.validate_nodes()?;

        if !ends
            .iter()
            .any(|&end| has_path_connecting(&compiled.graph, start_index, end, None))
        {
            return Err(EngineError::Parse(format!(
                "no end event of process '{}' is reachable from its start event",
                model.key
            )));
        }

        tracing::debug!(
            "✅ Process graph '{}' valid: {} nodes, {} flows",
            model.key,
            compiled.graph.node_count(),
            compiled.graph.edge_count()
        );
        Ok(compiled)
    }

    /// Per-node structural checks
    fn validate_nodes(&self) -> EngineResult<()> {
        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            let outgoing = self.outgoing_at(index);

            match &node.kind {
                NodeKind::EndEvent => {
                    if !outgoing.is_empty() {
                        return Err(EngineError::Parse(format!(
                            "end event '{}' must not have outgoing flows",
                            node.id
                        )));
                    }
                }
                _ if outgoing.is_empty() => {
                    return Err(EngineError::Parse(format!(
                        "{} '{}' has no outgoing sequence flow",
                        node.kind.label(),
                        node.id
                    )));
                }
                NodeKind::UserTask {
                    due_in_hours: Some(hours),
                    ..
                } if !(0..=MAX_DUE_IN_HOURS).contains(hours) => {
                    return Err(EngineError::Parse(format!(
                        "due date of user task '{}' must be between 0 and {} hours, got {}",
                        node.id, MAX_DUE_IN_HOURS, hours
                    )));
                }
                NodeKind::ServiceTask { delegate } if delegate.trim().is_empty() => {
                    return Err(EngineError::Parse(format!(
                        "service task '{}' does not name a delegate",
                        node.id
                    )));
                }
                NodeKind::ExclusiveGateway {
                    default_flow: Some(default_flow),
                } => {
                    if !outgoing.iter().any(|flow| &flow.id == default_flow) {
                        return Err(EngineError::Parse(format!(
                            "default flow '{}' of gateway '{}' is not one of its outgoing flows",
                            default_flow, node.id
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.node_id_to_index
            .get(node_id)
            .map(|&index| &self.graph[index])
    }

    pub fn start_node(&self) -> &Node {
        &self.graph[self.start_index]
    }

    /// Outgoing flows of a node in declaration order
    pub fn outgoing(&self, node_id: &str) -> Vec<&SequenceFlow> {
        match self.node_id_to_index.get(node_id) {
            Some(&index) => self.outgoing_at(index),
            None => Vec::new(),
        }
    }

    fn outgoing_at(&self, index: NodeIndex) -> Vec<&SequenceFlow> {
        // petgraph walks adjacency lists newest-first, so restore insertion order
        let mut edges: Vec<_> = self.graph.edges_directed(index, Direction::Outgoing).collect();
        edges.sort_by_key(|edge| edge.id());
        edges.into_iter().map(|edge| edge.weight()).collect()
    }

    /// All nodes in declaration order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_indices().map(move |index| &self.graph[index])
    }

    /// All flows in declaration order
    pub fn flows(&self) -> impl Iterator<Item = &SequenceFlow> {
        self.graph.edge_indices().map(move |index| &self.graph[index])
    }

    /// Group nodes by BFS distance from the start event
    ///
    /// Used for diagram layout. Nodes unreachable from the start end up in a
    /// trailing layer so every node is drawn.
    pub fn layers(&self) -> Vec<Vec<&Node>> {
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        let mut queue = VecDeque::new();

        depth.insert(self.start_index, 0);
        queue.push_back(self.start_index);

        while let Some(current) = queue.pop_front() {
            let next_depth = depth[&current] + 1;
            let mut neighbors = self.graph.neighbors(current).detach();
            while let Some(target) = neighbors.next_node(&self.graph) {
                if !depth.contains_key(&target) {
                    depth.insert(target, next_depth);
                    queue.push_back(target);
                }
            }
        }

        let max_depth = depth.values().copied().max().unwrap_or(0);
        let mut layers: Vec<Vec<&Node>> = vec![Vec::new(); max_depth + 1];
        let mut unreachable = Vec::new();

        for index in self.graph.node_indices() {
            match depth.get(&index) {
                Some(&d) => layers[d].push(&self.graph[index]),
                None => unreachable.push(&self.graph[index]),
            }
        }
        if !unreachable.is_empty() {
            layers.push(unreachable);
        }
        layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn model(value: serde_json::Value) -> ProcessModel {
        serde_json::from_value(value).unwrap()
    }

    fn approval_model() -> ProcessModel {
        model(json!({
            "key": "approval",
            "name": "Approval",
            "nodes": [
                {"id": "start", "type": "startEvent"},
                {"id": "approve", "type": "userTask", "assignee": "${startUserId}"},
                {"id": "gw", "type": "exclusiveGateway", "defaultFlow": "f_reject"},
                {"id": "ok", "type": "serviceTask", "delegate": "approvalSuccessDelegate"},
                {"id": "ko", "type": "serviceTask", "delegate": "approvalRejectDelegate"},
                {"id": "end", "type": "endEvent"}
            ],
            "flows": [
                {"id": "f1", "source": "start", "target": "approve"},
                {"id": "f2", "source": "approve", "target": "gw"},
                {"id": "f_ok", "source": "gw", "target": "ok", "condition": "${approved == true}"},
                {"id": "f_reject", "source": "gw", "target": "ko"},
                {"id": "f3", "source": "ok", "target": "end"},
                {"id": "f4", "source": "ko", "target": "end"}
            ]
        }))
    }

    #[test]
    fn outgoing_flows_keep_declaration_order() {
        let graph = ProcessGraph::build(&approval_model()).unwrap();
        let ids: Vec<&str> = graph.outgoing("gw").iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["f_ok", "f_reject"]);
        assert_eq!(graph.start_node().id, "start");
    }

    #[test]
    fn dangling_flow_is_a_parse_error() {
        let mut broken = approval_model();
        broken.flows.push(SequenceFlow {
            id: "dangling".to_string(),
            source: "approve".to_string(),
            target: "nowhere".to_string(),
            condition: None,
        });
        let err = ProcessGraph::build(&broken).unwrap_err();
        assert!(matches!(err, EngineError::Parse(msg) if msg.contains("nowhere")));
    }

    #[test]
    fn missing_start_or_end_is_rejected() {
        let no_end = model(json!({
            "key": "p",
            "nodes": [
                {"id": "start", "type": "startEvent"},
                {"id": "t", "type": "userTask"}
            ],
            "flows": [{"id": "f1", "source": "start", "target": "t"}]
        }));
        assert!(matches!(ProcessGraph::build(&no_end), Err(EngineError::Parse(_))));

        let no_start = model(json!({
            "key": "p",
            "nodes": [{"id": "end", "type": "endEvent"}]
        }));
        assert!(matches!(ProcessGraph::build(&no_start), Err(EngineError::Parse(_))));
    }

    #[test]
    fn gateway_default_must_be_outgoing() {
        let mut broken = approval_model();
        if let NodeKind::ExclusiveGateway { default_flow } = &mut broken.nodes[2].kind {
            *default_flow = Some("f1".to_string());
        }
        assert!(matches!(ProcessGraph::build(&broken), Err(EngineError::Parse(_))));
    }

    #[test]
    fn due_dates_must_be_in_range() {
        for hours in [-1, 9_000_000_000i64] {
            let mut broken = approval_model();
            if let NodeKind::UserTask { due_in_hours, .. } = &mut broken.nodes[1].kind {
                *due_in_hours = Some(hours);
            }
            assert!(matches!(ProcessGraph::build(&broken), Err(EngineError::Parse(_))));
        }

        let mut ok = approval_model();
        if let NodeKind::UserTask { due_in_hours, .. } = &mut ok.nodes[1].kind {
            *due_in_hours = Some(72);
        }
        assert!(ProcessGraph::build(&ok).is_ok());
    }

    #[test]
    fn cycles_are_allowed() {
        let looping = model(json!({
            "key": "loop",
            "nodes": [
                {"id": "start", "type": "startEvent"},
                {"id": "review", "type": "userTask"},
                {"id": "gw", "type": "exclusiveGateway"},
                {"id": "end", "type": "endEvent"}
            ],
            "flows": [
                {"id": "f1", "source": "start", "target": "review"},
                {"id": "f2", "source": "review", "target": "gw"},
                {"id": "again", "source": "gw", "target": "review", "condition": "${retry}"},
                {"id": "done", "source": "gw", "target": "end", "condition": "${not retry}"}
            ]
        }));
        assert!(ProcessGraph::build(&looping).is_ok());
    }

    #[test]
    fn layers_follow_bfs_depth() {
        let graph = ProcessGraph::build(&approval_model()).unwrap();
        let layers = graph.layers();
        let first: Vec<&str> = layers[0].iter().map(|n| n.id.as_str()).collect();
        let third: Vec<&str> = layers[2].iter().map(|n| n.id.as_str()).collect();
        assert_eq!(first, vec!["start"]);
        assert_eq!(third, vec!["gw"]);
        assert_eq!(layers.iter().map(Vec::len).sum::<usize>(), 6);
    }
}
