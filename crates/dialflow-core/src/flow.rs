use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AnswerKey, FlowId, NodeId, PathId, Version};

/// Edge target meaning "return to the caller". Only valid inside a subgraph.
pub const EXIT: &str = "__exit__";

/// Guard text that matches only when no sibling guard on the same node is true.
pub const ELSE: &str = "else";

/// A versioned conversation graph.
///
/// Immutable once published: every successful mutation produces a new
/// definition with the next version and a pointer to its predecessor.
/// Subgraphs are nested definitions addressed by their key in `subgraphs`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    #[serde(default)]
    pub id: FlowId,
    #[serde(default = "Version::initial")]
    pub version: Version,
    /// Entry node. Defaults to the first declared node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<NodeId>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subgraphs: BTreeMap<String, FlowDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<VersionMeta>,
}

impl FlowDefinition {
    pub fn new(id: impl Into<FlowId>) -> Self {
        Self {
            id: id.into(),
            version: Version::initial(),
            ..Default::default()
        }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_subgraph(mut self, name: impl Into<String>, subgraph: FlowDefinition) -> Self {
        self.subgraphs.insert(name.into(), subgraph);
        self
    }

    /// The configured entry node, or the first declared node.
    pub fn entry_node(&self) -> Option<&NodeId> {
        self.entry.as_ref().or_else(|| self.nodes.first().map(|n| &n.id))
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id.as_str() == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id.as_str() == id)
    }

    /// Resolve a nested definition by scope path. The root scope resolves to `self`.
    pub fn scope(&self, scope: &ScopeId) -> Option<&FlowDefinition> {
        let mut current = self;
        for segment in scope.segments() {
            current = current.subgraphs.get(segment)?;
        }
        Some(current)
    }

    pub fn scope_mut(&mut self, scope: &ScopeId) -> Option<&mut FlowDefinition> {
        let mut current = self;
        for segment in scope.segments() {
            current = current.subgraphs.get_mut(segment)?;
        }
        Some(current)
    }
}

/// Address of a (sub)graph inside a flow: `""` is the root, `"a/b"` is
/// subgraph `b` declared inside subgraph `a`.
#[derive(Debug, Clone, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(pub String);

impl ScopeId {
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, name: &str) -> Self {
        if self.is_root() {
            Self(name.to_string())
        } else {
            Self(format!("{}/{}", self.0, name))
        }
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(match self.0.rsplit_once('/') {
            Some((parent, _)) => Self(parent.to_string()),
            None => Self::root(),
        })
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_root() {
            f.write_str("<root>")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<&str> for ScopeId {
    fn from(s: &str) -> Self {
        Self(s.trim_matches('/').to_string())
    }
}

/// Kind of conversational step a node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    /// Collects one answer slot.
    Question,
    /// Routes on guards without asking anything.
    Decision,
    /// Asks the surrounding service to perform an action, then moves on.
    Action,
    /// Enters a subgraph (fixed, or chosen by the path policy).
    SubgraphRef,
    Terminal,
    /// Suspends automated advancement until an operator clears it.
    Escalation,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeKind::Question => "question",
            NodeKind::Decision => "decision",
            NodeKind::Action => "action",
            NodeKind::SubgraphRef => "subgraphRef",
            NodeKind::Terminal => "terminal",
            NodeKind::Escalation => "escalation",
        };
        f.write_str(s)
    }
}

/// A unit of conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Answer slot. Required for questions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<AnswerKey>,
    /// Presentation only; never used to resolve answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Eligibility guard. A node whose guard is false is skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    /// Legacy dependency expression, folded into the eligibility guard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Keys that must be answered before this node is eligible.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<AnswerKey>,
    /// Additional guards, AND-ed with `guard`. Appended when layers merge.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_guards: Vec<String>,
    /// Validator spec in call syntax, e.g. `range(1, 10)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<String>,
    /// Fixed subgraph for `subgraphRef` nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subgraph: Option<String>,
    /// Candidate paths for a `subgraphRef` path fork. Each names a subgraph.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<PathId>,
    /// Allows the node to be revisited through a cycle.
    #[serde(default, skip_serializing_if = "is_false")]
    pub reentrant: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<serde_json::Map<String, serde_json::Value>>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Node {
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            key: None,
            prompt: None,
            guard: None,
            when: None,
            depends_on: vec![],
            extra_guards: vec![],
            validator: None,
            subgraph: None,
            paths: vec![],
            reentrant: false,
            priority: None,
            ui: None,
        }
    }

    pub fn question(
        id: impl Into<NodeId>,
        key: impl Into<AnswerKey>,
        prompt: impl Into<String>,
    ) -> Self {
        let mut node = Self::new(id, NodeKind::Question);
        node.key = Some(key.into());
        node.prompt = Some(prompt.into());
        node
    }

    pub fn decision(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Decision)
    }

    pub fn action(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Action)
    }

    pub fn terminal(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Terminal)
    }

    pub fn escalation(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Escalation)
    }

    pub fn subgraph_ref(id: impl Into<NodeId>, subgraph: impl Into<String>) -> Self {
        let mut node = Self::new(id, NodeKind::SubgraphRef);
        node.subgraph = Some(subgraph.into());
        node
    }

    /// A `subgraphRef` that enters whichever candidate path the policy locks.
    pub fn path_fork(id: impl Into<NodeId>, paths: Vec<PathId>, prompt: impl Into<String>) -> Self {
        let mut node = Self::new(id, NodeKind::SubgraphRef);
        node.paths = paths;
        node.prompt = Some(prompt.into());
        node
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_guard(mut self, guard: impl Into<String>) -> Self {
        self.guard = Some(guard.into());
        self
    }

    pub fn with_validator(mut self, validator: impl Into<String>) -> Self {
        self.validator = Some(validator.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn reentrant(mut self) -> Self {
        self.reentrant = true;
        self
    }

    pub fn is_path_fork(&self) -> bool {
        self.kind == NodeKind::SubgraphRef && !self.paths.is_empty()
    }
}

/// A directed transition, optionally guarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Stable id for merging. Defaults to `from->to`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub from: NodeId,
    /// Target node, or [`EXIT`] inside a subgraph.
    pub to: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    /// Validation-error edge: its target's prompt is used as the clarification
    /// when an answer for `from` fails validation. Never traversed.
    #[serde(default, skip_serializing_if = "is_false")]
    pub on_invalid: bool,
    /// Allows this edge to close a cycle.
    #[serde(default, skip_serializing_if = "is_false")]
    pub reentrant: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

impl Edge {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        Self {
            id: None,
            from: from.into(),
            to: to.into(),
            guard: None,
            on_invalid: false,
            reentrant: false,
            priority: None,
        }
    }

    /// Create a guarded edge.
    pub fn when(from: impl Into<NodeId>, to: impl Into<NodeId>, guard: impl Into<String>) -> Self {
        let mut edge = Self::always(from, to);
        edge.guard = Some(guard.into());
        edge
    }

    /// Create the `else` edge of a decision.
    pub fn otherwise(from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        Self::when(from, to, ELSE)
    }

    /// Create an edge that returns from a subgraph to its caller.
    pub fn exit(from: impl Into<NodeId>) -> Self {
        Self::always(from, EXIT)
    }

    /// Create a validation-error edge.
    pub fn on_invalid(from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        let mut edge = Self::always(from, to);
        edge.on_invalid = true;
        edge
    }

    pub fn reentrant(mut self) -> Self {
        self.reentrant = true;
        self
    }

    /// Stable identity used by the merge engine and the mutation service.
    pub fn key(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}->{}", self.from, self.to))
    }

    pub fn targets_exit(&self) -> bool {
        self.to.as_str() == EXIT
    }

    pub fn is_else(&self) -> bool {
        self.guard
            .as_deref()
            .is_some_and(|g| g.trim().eq_ignore_ascii_case(ELSE))
    }
}

/// Audit record attached to each published version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMeta {
    pub version: Version,
    #[serde(default)]
    pub predecessor: Option<Version>,
    pub description: String,
    #[serde(default)]
    pub author: Option<String>,
    pub change_id: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_paths() {
        let root = ScopeId::root();
        let child = root.child("enterprise");
        let nested = child.child("legal");
        assert_eq!(child.as_str(), "enterprise");
        assert_eq!(nested.as_str(), "enterprise/legal");
        assert_eq!(nested.parent(), Some(child.clone()));
        assert_eq!(child.parent(), Some(ScopeId::root()));
        assert_eq!(root.parent(), None);
        assert_eq!(nested.segments().collect::<Vec<_>>(), vec!["enterprise", "legal"]);
    }

    #[test]
    fn node_serializes_with_type_tag() {
        let node = Node::question("q1", "budget", "What is your budget?");
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["type"], "question");
        assert_eq!(json["key"], "budget");
        assert!(json.get("guard").is_none());
        assert!(json.get("reentrant").is_none());

        let fork = Node::path_fork("fork", vec!["smb".into()], "Which team?");
        let json = serde_json::to_value(&fork).unwrap();
        assert_eq!(json["type"], "subgraphRef");
    }

    #[test]
    fn edge_keys_and_else() {
        let e = Edge::otherwise("route", "fallback");
        assert!(e.is_else());
        assert_eq!(e.key(), "route->fallback");
        assert!(Edge::exit("done").targets_exit());
        assert!(!Edge::when("a", "b", "x == 1").is_else());
    }

    #[test]
    fn scope_lookup() {
        let flow = FlowDefinition::new("f")
            .with_node(Node::decision("start"))
            .with_subgraph(
                "smb",
                FlowDefinition::default().with_node(Node::question("seats", "seats", "How many seats?")),
            );
        assert_eq!(flow.entry_node().map(|n| n.as_str()), Some("start"));
        let smb = flow.scope(&ScopeId::from("smb")).unwrap();
        assert!(smb.node("seats").is_some());
        assert!(flow.scope(&ScopeId::from("missing")).is_none());
    }
}
