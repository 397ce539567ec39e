//! JSON export of compiled graphs for visualization and authoring tools.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use dialflow_core::flow::{NodeKind, ScopeId, EXIT};
use dialflow_core::types::{AnswerKey, FlowId, NodeId, Version};

use crate::compiler::{CompiledGraph, CompiledScope, EdgeTarget};
use crate::guard::EdgeGuard;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportedFlow {
    pub version: Version,
    pub id: FlowId,
    #[serde(flatten)]
    pub graph: ExportedGraph,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportedGraph {
    pub entry: NodeId,
    pub nodes: Vec<ExportedNode>,
    pub edges: Vec<ExportedEdge>,
    pub subgraphs: BTreeMap<String, ExportedGraph>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportedNode {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<AnswerKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Effective eligibility guard in canonical form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ui: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportedEdge {
    pub from: NodeId,
    pub to: NodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
}

/// Build the export document for a compiled graph.
pub fn export(graph: &CompiledGraph) -> ExportedFlow {
    ExportedFlow {
        version: graph.version(),
        id: graph.id().clone(),
        graph: export_scope(graph, &ScopeId::root()),
    }
}

/// Pretty-printed JSON export.
pub fn export_json(graph: &CompiledGraph) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&export(graph))
}

fn export_scope(graph: &CompiledGraph, scope_id: &ScopeId) -> ExportedGraph {
    let Some(scope) = graph.scope(scope_id) else {
        return ExportedGraph {
            entry: NodeId::default(),
            nodes: vec![],
            edges: vec![],
            subgraphs: BTreeMap::new(),
        };
    };

    let subgraphs = graph
        .scope_ids()
        .iter()
        .filter(|id| id.parent().as_ref() == Some(scope_id))
        .filter_map(|id| {
            let name = id.segments().last()?.to_string();
            Some((name, export_scope(graph, id)))
        })
        .collect();

    ExportedGraph {
        entry: scope.entry().clone(),
        nodes: export_nodes(scope),
        edges: export_edges(scope),
        subgraphs,
    }
}

fn export_nodes(scope: &CompiledScope) -> Vec<ExportedNode> {
    scope
        .nodes()
        .map(|compiled| ExportedNode {
            id: compiled.node.id.clone(),
            kind: compiled.node.kind,
            key: compiled.node.key.clone(),
            prompt: compiled.node.prompt.clone(),
            guard: compiled.eligibility.as_ref().map(|e| e.to_string()),
            ui: compiled.node.ui.clone(),
        })
        .collect()
}

fn export_edges(scope: &CompiledScope) -> Vec<ExportedEdge> {
    let mut edges: Vec<_> = scope
        .nodes()
        .flat_map(|n| scope.outgoing(n.id().as_str()))
        .collect();
    edges.sort_by_key(|e| e.index);
    edges
        .into_iter()
        .map(|edge| ExportedEdge {
            from: edge.from.clone(),
            to: match &edge.target {
                EdgeTarget::Node(id) => id.clone(),
                EdgeTarget::Exit => NodeId::new(EXIT),
            },
            guard: match &edge.guard {
                EdgeGuard::Always => None,
                other => Some(other.to_string()),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use dialflow_core::flow::{Edge, FlowDefinition, Node};
    use serde_json::json;

    #[test]
    fn export_matches_document_shape() {
        let def = FlowDefinition::new("lead")
            .with_node(Node::question("ask", "x", "Pick a number"))
            .with_node(Node::subgraph_ref("detail", "more"))
            .with_node(Node::terminal("done").with_guard("x present"))
            .with_edge(Edge::when("ask", "detail", "x==1"))
            .with_edge(Edge::otherwise("ask", "done"))
            .with_edge(Edge::always("detail", "done"))
            .with_subgraph(
                "more",
                FlowDefinition::default()
                    .with_node(Node::question("why", "why", "Why?"))
                    .with_edge(Edge::exit("why")),
            );
        let graph = compile(&def).unwrap();
        let value = serde_json::to_value(export(&graph)).unwrap();
        assert_eq!(
            value,
            json!({
                "version": 1,
                "id": "lead",
                "entry": "ask",
                "nodes": [
                    {"id": "ask", "type": "question", "key": "x", "prompt": "Pick a number"},
                    {"id": "detail", "type": "subgraphRef"},
                    {"id": "done", "type": "terminal", "guard": "x present"}
                ],
                "edges": [
                    {"from": "ask", "to": "detail", "guard": "x == 1"},
                    {"from": "ask", "to": "done", "guard": "else"},
                    {"from": "detail", "to": "done"}
                ],
                "subgraphs": {
                    "more": {
                        "entry": "why",
                        "nodes": [{"id": "why", "type": "question", "key": "why", "prompt": "Why?"}],
                        "edges": [{"from": "why", "to": "__exit__"}],
                        "subgraphs": {}
                    }
                }
            })
        );
    }
}
