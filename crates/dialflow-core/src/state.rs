use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::flow::ScopeId;
use crate::types::{Answers, FlowId, NodeId, PathId, Version};

/// Stable conversation status between turns.
///
/// `Validating` and `Advancing` are transient phases inside a single turn and
/// are never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConversationStatus {
    AwaitingInput,
    Escalated { reason: EscalationReason },
    Terminal { node: NodeId },
}

/// Why a conversation left automated handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationReason {
    /// The extractor asked for a human.
    ExtractorSignal,
    /// Traversal reached an escalation node.
    Node { node: NodeId },
    /// No outgoing edge applied at runtime.
    DeadEnd { node: NodeId },
}

/// One subgraph activation on the call stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Scope being executed.
    pub scope: ScopeId,
    /// The `subgraphRef` node in the enclosing scope that entered it.
    pub caller: NodeId,
}

/// Vote accumulation for the path selection policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathState {
    #[serde(default)]
    pub active_path: Option<PathId>,
    #[serde(default)]
    pub path_locked: bool,
    #[serde(default)]
    pub path_votes: BTreeMap<PathId, f64>,
    /// Number of times the tentative path changed while unlocked.
    #[serde(default)]
    pub path_switches: u32,
}

impl PathState {
    pub fn votes_for(&self, path: &str) -> f64 {
        self.path_votes.get(path).copied().unwrap_or(0.0)
    }

    /// The locked path, if any.
    pub fn locked_path(&self) -> Option<&PathId> {
        if self.path_locked {
            self.active_path.as_ref()
        } else {
            None
        }
    }
}

/// Per-conversation traversal position. Serializable so it can be restored
/// between turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraversalState {
    pub flow_id: FlowId,
    /// Flow version this conversation is pinned to.
    pub version: Version,
    pub status: ConversationStatus,
    pub current_node_id: NodeId,
    #[serde(default)]
    pub call_stack: Vec<Frame>,
    #[serde(flatten)]
    pub path: PathState,
    /// Number of turns processed so far.
    #[serde(default)]
    pub turn: u64,
}

impl TraversalState {
    pub fn new(flow_id: FlowId, version: Version, entry: NodeId) -> Self {
        Self {
            flow_id,
            version,
            status: ConversationStatus::AwaitingInput,
            current_node_id: entry,
            call_stack: vec![],
            path: PathState::default(),
            turn: 0,
        }
    }

    /// Scope of the current node: the innermost frame, or the root.
    pub fn current_scope(&self) -> ScopeId {
        self.call_stack
            .last()
            .map(|f| f.scope.clone())
            .unwrap_or_else(ScopeId::root)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, ConversationStatus::Terminal { .. })
    }

    pub fn is_escalated(&self) -> bool {
        matches!(self.status, ConversationStatus::Escalated { .. })
    }
}

/// Everything persisted for one conversation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub state: TraversalState,
    #[serde(default)]
    pub answers: Answers,
    /// Host-supplied values readable from guards as `ctx.<name>`.
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_flat_path_fields() {
        let mut state = TraversalState::new(FlowId::new("f"), Version(3), NodeId::new("start"));
        state.path.active_path = Some(PathId::new("smb"));
        state.path.path_votes.insert(PathId::new("smb"), 1.0);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["active_path"], "smb");
        assert_eq!(json["path_locked"], false);
        assert_eq!(json["path_votes"]["smb"], 1.0);
        assert_eq!(json["status"]["status"], "awaiting_input");

        let back: TraversalState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn current_scope_follows_call_stack() {
        let mut state = TraversalState::new(FlowId::new("f"), Version(1), NodeId::new("a"));
        assert!(state.current_scope().is_root());
        state.call_stack.push(Frame {
            scope: ScopeId::from("smb"),
            caller: NodeId::new("fork"),
        });
        assert_eq!(state.current_scope().as_str(), "smb");
    }

    #[test]
    fn locked_path_only_when_locked() {
        let mut path = PathState {
            active_path: Some(PathId::new("enterprise")),
            ..Default::default()
        };
        assert!(path.locked_path().is_none());
        path.path_locked = true;
        assert_eq!(path.locked_path().map(|p| p.as_str()), Some("enterprise"));
    }
}
