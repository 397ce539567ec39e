use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use dialflow_core::config::{EngineConfig, TraversalConfig};
use dialflow_core::error::{DialflowError, Result, ValidationError};
use dialflow_core::flow::{NodeKind, ScopeId};
use dialflow_core::state::{
    ConversationSnapshot, ConversationStatus, EscalationReason, Frame, TraversalState,
};
use dialflow_core::types::{
    Answer, AnswerKey, Answers, ExtractionInput, NodeId, PathId, ProposedAnswer,
};
use dialflow_graph::guard::{evaluate, evaluate_edge, EdgeGuard, GuardScope};
use dialflow_graph::{CompiledEdge, CompiledGraph, CompiledNode, CompiledScope, EdgeTarget};

use crate::path_policy::{PathDecision, PathPolicy};

/// Why a proposal was dropped without validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    LowConfidence,
    UnknownKey,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IgnoredProposal {
    pub key: AnswerKey,
    pub reason: IgnoreReason,
}

/// Everything that happened during one turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnOutcome {
    pub turn: u64,
    pub status: ConversationStatus,
    /// Node the conversation rests on after the turn.
    pub node: NodeId,
    pub scope: ScopeId,
    /// Prompt of the resting node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Set when an answer was rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification: Option<String>,
    pub committed: Vec<AnswerKey>,
    pub rejected: Vec<ValidationError>,
    pub ignored: Vec<IgnoredProposal>,
    /// Action nodes passed this turn, in order. The caller runs them.
    pub actions: Vec<NodeId>,
    pub visited: Vec<NodeId>,
    pub path: PathDecision,
}

impl TurnOutcome {
    fn new(turn: u64) -> Self {
        Self {
            turn,
            status: ConversationStatus::AwaitingInput,
            node: NodeId::default(),
            scope: ScopeId::root(),
            prompt: None,
            clarification: None,
            committed: vec![],
            rejected: vec![],
            ignored: vec![],
            actions: vec![],
            visited: vec![],
            path: PathDecision::NoSignal,
        }
    }

    /// Text for the user: the clarification if an answer was rejected,
    /// otherwise the resting node's prompt.
    pub fn reply(&self) -> Option<&str> {
        self.clarification.as_deref().or(self.prompt.as_deref())
    }
}

/// One move of the advancement loop.
enum Step {
    Wait,
    Goto(NodeId),
    Enter { scope: ScopeId, caller: NodeId },
    Exit,
    Terminal(NodeId),
    Escalate(NodeId),
    DeadEnd(NodeId),
}

/// Per-conversation state machine over a compiled graph.
///
/// Stateless itself: every call takes the conversation snapshot explicitly
/// and reads one immutable graph version, so identical inputs always
/// produce identical snapshots.
#[derive(Debug, Clone)]
pub struct TraversalEngine {
    config: TraversalConfig,
    policy: PathPolicy,
}

impl TraversalEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            config: config.traversal.clone(),
            policy: PathPolicy::new(config.path_policy.clone()),
        }
    }

    pub fn policy(&self) -> &PathPolicy {
        &self.policy
    }

    /// Open a conversation at the graph's entry and advance to the first
    /// node that needs input.
    pub fn start(
        &self,
        graph: &CompiledGraph,
        context: BTreeMap<String, Value>,
    ) -> Result<(ConversationSnapshot, TurnOutcome)> {
        let mut snapshot = ConversationSnapshot {
            state: TraversalState::new(
                graph.id().clone(),
                graph.version(),
                graph.root().entry().clone(),
            ),
            answers: Answers::new(),
            context,
        };
        let mut outcome = TurnOutcome::new(0);
        self.advance(graph, &mut snapshot, &mut outcome, false)?;
        finish(graph, &snapshot, &mut outcome);
        Ok((snapshot, outcome))
    }

    /// Apply one turn of extractor output.
    ///
    /// Terminal and escalated conversations are left untouched.
    pub fn apply_turn(
        &self,
        graph: &CompiledGraph,
        snapshot: &mut ConversationSnapshot,
        input: &ExtractionInput,
    ) -> Result<TurnOutcome> {
        check_pinned(graph, &snapshot.state)?;
        if snapshot.state.status != ConversationStatus::AwaitingInput {
            debug!(
                flow = %snapshot.state.flow_id,
                status = ?snapshot.state.status,
                "Turn ignored, conversation is not awaiting input"
            );
            return Ok(self.position(graph, snapshot));
        }

        snapshot.state.turn += 1;
        let mut outcome = TurnOutcome::new(snapshot.state.turn);
        outcome.path = self
            .policy
            .observe(&mut snapshot.state.path, input.proposed_path.as_ref());

        let mut hold = false;
        for proposal in &input.proposed_answers {
            hold |= self.commit(graph, snapshot, proposal, &mut outcome);
        }

        if input.escalate {
            info!(
                flow = %snapshot.state.flow_id,
                turn = snapshot.state.turn,
                node_id = %snapshot.state.current_node_id,
                "Extractor requested escalation"
            );
            snapshot.state.status = ConversationStatus::Escalated {
                reason: EscalationReason::ExtractorSignal,
            };
        } else if hold {
            debug!(node_id = %snapshot.state.current_node_id, "Answer rejected, staying on node");
        } else {
            self.advance(graph, snapshot, &mut outcome, false)?;
        }

        finish(graph, snapshot, &mut outcome);
        Ok(outcome)
    }

    /// Report where a conversation rests without changing it.
    pub fn position(&self, graph: &CompiledGraph, snapshot: &ConversationSnapshot) -> TurnOutcome {
        let mut outcome = TurnOutcome::new(snapshot.state.turn);
        outcome.path = match snapshot.state.path.locked_path() {
            Some(path) => PathDecision::Locked { path: path.clone() },
            None => PathDecision::NoSignal,
        };
        finish(graph, snapshot, &mut outcome);
        outcome
    }

    /// Clear an escalation. With a `target` the conversation moves to that
    /// node of the current scope; otherwise an escalation node is passed
    /// and any other position is retried.
    pub fn resume(
        &self,
        graph: &CompiledGraph,
        snapshot: &mut ConversationSnapshot,
        target: Option<&NodeId>,
    ) -> Result<TurnOutcome> {
        check_pinned(graph, &snapshot.state)?;
        let ConversationStatus::Escalated { reason } = &snapshot.state.status else {
            return Err(DialflowError::InvalidState(
                "conversation is not escalated".into(),
            ));
        };
        let pass_current = target.is_none() && matches!(reason, EscalationReason::Node { .. });

        if let Some(target) = target {
            let scope_id = snapshot.state.current_scope();
            let scope = scope_of(graph, &scope_id)?;
            if !scope.contains(target.as_str()) {
                return Err(DialflowError::InvalidState(format!(
                    "node '{}' is not in scope {}",
                    target, scope_id
                )));
            }
            snapshot.state.current_node_id = target.clone();
        }

        info!(
            flow = %snapshot.state.flow_id,
            node_id = %snapshot.state.current_node_id,
            "Escalation cleared"
        );
        snapshot.state.status = ConversationStatus::AwaitingInput;
        let mut outcome = TurnOutcome::new(snapshot.state.turn);
        self.advance(graph, snapshot, &mut outcome, pass_current)?;
        finish(graph, snapshot, &mut outcome);
        Ok(outcome)
    }

    /// Lock a path by operator decision and enter it if a fork is waiting.
    pub fn override_path(
        &self,
        graph: &CompiledGraph,
        snapshot: &mut ConversationSnapshot,
        path: PathId,
    ) -> Result<TurnOutcome> {
        check_pinned(graph, &snapshot.state)?;
        if path_scopes(graph, &path).is_empty() {
            return Err(DialflowError::InvalidState(format!(
                "path '{}' is not offered by flow {}",
                path,
                graph.id()
            )));
        }

        let mut outcome = TurnOutcome::new(snapshot.state.turn);
        outcome.path = self.policy.override_path(&mut snapshot.state.path, path);
        if snapshot.state.status == ConversationStatus::AwaitingInput {
            self.advance(graph, snapshot, &mut outcome, false)?;
        }
        finish(graph, snapshot, &mut outcome);
        Ok(outcome)
    }

    /// Move a conversation to a newer version of its flow. Fails, leaving
    /// the snapshot untouched, when its position does not exist there.
    pub fn repin(&self, next: &CompiledGraph, snapshot: &mut ConversationSnapshot) -> Result<()> {
        let state = &snapshot.state;
        if next.id() != &state.flow_id {
            return Err(DialflowError::InvalidState(format!(
                "cannot re-pin {} onto flow {}",
                state.flow_id,
                next.id()
            )));
        }
        if next.version() <= state.version {
            return Err(DialflowError::InvalidState(format!(
                "cannot re-pin: v{} is not newer than v{}",
                next.version(),
                state.version
            )));
        }

        let mut parent = ScopeId::root();
        for frame in &state.call_stack {
            let resolves = next
                .scope(&parent)
                .is_some_and(|scope| scope.contains(frame.caller.as_str()))
                && next.scope(&frame.scope).is_some();
            if !resolves {
                return Err(DialflowError::InvalidState(format!(
                    "cannot re-pin: subgraph {} entered from '{}' is gone in v{}",
                    frame.scope,
                    frame.caller,
                    next.version()
                )));
            }
            parent = frame.scope.clone();
        }
        let scope_id = state.current_scope();
        if !next
            .scope(&scope_id)
            .is_some_and(|scope| scope.contains(state.current_node_id.as_str()))
        {
            return Err(DialflowError::InvalidState(format!(
                "cannot re-pin: node '{}' is gone in v{}",
                state.current_node_id,
                next.version()
            )));
        }

        info!(
            flow = %state.flow_id,
            from = %state.version,
            to = %next.version(),
            "Conversation re-pinned"
        );
        snapshot.state.version = next.version();
        Ok(())
    }

    /// Validate and commit one proposal. Returns true when the rejected
    /// answer belonged to the current node.
    fn commit(
        &self,
        graph: &CompiledGraph,
        snapshot: &mut ConversationSnapshot,
        proposal: &ProposedAnswer,
        outcome: &mut TurnOutcome,
    ) -> bool {
        if proposal.confidence < self.config.min_confidence {
            debug!(key = %proposal.key, confidence = proposal.confidence, "Low-confidence proposal ignored");
            outcome.ignored.push(IgnoredProposal {
                key: proposal.key.clone(),
                reason: IgnoreReason::LowConfidence,
            });
            return false;
        }

        let Some((scope, owner)) = resolve_owner(graph, &snapshot.state, proposal.key.as_str())
        else {
            debug!(key = %proposal.key, "Proposal for unknown key ignored");
            outcome.ignored.push(IgnoredProposal {
                key: proposal.key.clone(),
                reason: IgnoreReason::UnknownKey,
            });
            return false;
        };

        let verdict = match &owner.validator {
            Some(validator) => validator.validate(&proposal.value),
            None => Ok(proposal.value.clone()),
        };

        match verdict {
            Ok(value) => {
                snapshot.answers.insert(
                    proposal.key.clone(),
                    Answer {
                        value,
                        turn: snapshot.state.turn,
                        confidence: proposal.confidence,
                    },
                );
                outcome.committed.push(proposal.key.clone());
                false
            }
            Err(reason) => {
                debug!(key = %proposal.key, node_id = %owner.id(), reason = %reason, "Answer rejected");
                if outcome.clarification.is_none() {
                    let clarification = scope
                        .invalid_target(owner.id().as_str())
                        .and_then(|target| scope.node(target.as_str()))
                        .and_then(|node| node.node.prompt.clone())
                        .unwrap_or_else(|| self.config.retry_prompt.clone());
                    outcome.clarification = Some(clarification);
                }
                outcome.rejected.push(ValidationError {
                    key: proposal.key.to_string(),
                    node: owner.id().to_string(),
                    reason,
                });
                scope.id() == &snapshot.state.current_scope()
                    && owner.id() == &snapshot.state.current_node_id
            }
        }
    }

    /// Move forward until a node needs input or the conversation leaves
    /// automated handling. With `pass_current` the current node is not
    /// re-run; its outgoing edges are evaluated directly.
    fn advance(
        &self,
        graph: &CompiledGraph,
        snapshot: &mut ConversationSnapshot,
        outcome: &mut TurnOutcome,
        mut pass_current: bool,
    ) -> Result<()> {
        for _ in 0..self.config.max_auto_steps {
            let step = {
                let state = &snapshot.state;
                let scope = scope_of(graph, &state.current_scope())?;
                let node = scope.node(state.current_node_id.as_str()).ok_or_else(|| {
                    DialflowError::InvalidState(format!(
                        "node '{}' not found in scope {}",
                        state.current_node_id,
                        scope.id()
                    ))
                })?;
                let guards = GuardScope::new(&snapshot.answers, &snapshot.context, graph.predicates());

                if std::mem::take(&mut pass_current) {
                    choose_edge(scope, node.id(), &guards)
                } else {
                    outcome.visited.push(node.id().clone());
                    if !eligible(node, &guards) {
                        debug!(node_id = %node.id(), "Node not eligible, skipped");
                        choose_edge(scope, node.id(), &guards)
                    } else {
                        match node.kind() {
                            NodeKind::Question => {
                                let answered = node
                                    .node
                                    .key
                                    .as_ref()
                                    .is_some_and(|key| snapshot.answers.contains(key.as_str()));
                                if answered {
                                    choose_edge(scope, node.id(), &guards)
                                } else {
                                    Step::Wait
                                }
                            }
                            NodeKind::Decision => choose_edge(scope, node.id(), &guards),
                            NodeKind::Action => {
                                outcome.actions.push(node.id().clone());
                                choose_edge(scope, node.id(), &guards)
                            }
                            NodeKind::SubgraphRef => enter(node, state),
                            NodeKind::Terminal => Step::Terminal(node.id().clone()),
                            NodeKind::Escalation => Step::Escalate(node.id().clone()),
                        }
                    }
                }
            };

            let state = &mut snapshot.state;
            match step {
                Step::Wait => {
                    state.status = ConversationStatus::AwaitingInput;
                    return Ok(());
                }
                Step::Goto(next) => {
                    debug!(from = %state.current_node_id, to = %next, "Edge followed");
                    state.current_node_id = next;
                }
                Step::Enter { scope, caller } => {
                    let entry = scope_of(graph, &scope)?.entry().clone();
                    debug!(caller = %caller, scope = %scope, entry = %entry, "Entering subgraph");
                    state.call_stack.push(Frame { scope, caller });
                    state.current_node_id = entry;
                }
                Step::Exit => {
                    let frame = state.call_stack.pop().ok_or_else(|| {
                        DialflowError::InvalidState(format!(
                            "exit from '{}' outside a subgraph",
                            state.current_node_id
                        ))
                    })?;
                    debug!(scope = %frame.scope, caller = %frame.caller, "Returning from subgraph");
                    state.current_node_id = frame.caller;
                    pass_current = true;
                }
                Step::Terminal(node) => {
                    info!(flow = %state.flow_id, node_id = %node, turn = state.turn, "Conversation reached terminal node");
                    state.status = ConversationStatus::Terminal { node };
                    return Ok(());
                }
                Step::Escalate(node) => {
                    info!(flow = %state.flow_id, node_id = %node, turn = state.turn, "Conversation escalated");
                    state.status = ConversationStatus::Escalated {
                        reason: EscalationReason::Node { node },
                    };
                    return Ok(());
                }
                Step::DeadEnd(node) => {
                    warn!(flow = %state.flow_id, node_id = %node, "No outgoing edge applies, escalating");
                    state.status = ConversationStatus::Escalated {
                        reason: EscalationReason::DeadEnd { node },
                    };
                    return Ok(());
                }
            }
        }

        warn!(
            node_id = %snapshot.state.current_node_id,
            max_auto_steps = self.config.max_auto_steps,
            "Automatic advancement limit reached"
        );
        snapshot.state.status = ConversationStatus::AwaitingInput;
        Ok(())
    }
}

fn check_pinned(graph: &CompiledGraph, state: &TraversalState) -> Result<()> {
    if graph.id() != &state.flow_id || graph.version() != state.version {
        return Err(DialflowError::InvalidState(format!(
            "conversation is pinned to {} v{}, got {} v{}",
            state.flow_id,
            state.version,
            graph.id(),
            graph.version()
        )));
    }
    Ok(())
}

fn scope_of<'g>(graph: &'g CompiledGraph, id: &ScopeId) -> Result<&'g CompiledScope> {
    graph
        .scope(id)
        .ok_or_else(|| DialflowError::InvalidState(format!("scope {} not found", id)))
}

fn finish(graph: &CompiledGraph, snapshot: &ConversationSnapshot, outcome: &mut TurnOutcome) {
    let state = &snapshot.state;
    outcome.turn = state.turn;
    outcome.status = state.status.clone();
    outcome.node = state.current_node_id.clone();
    outcome.scope = state.current_scope();
    outcome.prompt = graph
        .scope(&outcome.scope)
        .and_then(|scope| scope.node(state.current_node_id.as_str()))
        .and_then(|node| node.node.prompt.clone());
}

fn eligible(node: &CompiledNode, guards: &GuardScope<'_>) -> bool {
    let Some(expr) = &node.eligibility else {
        return true;
    };
    evaluate(expr, guards).unwrap_or_else(|e| {
        warn!(node_id = %node.id(), error = %e, "Eligibility guard failed, treating as false");
        false
    })
}

/// First edge whose guard holds, in declaration order, else the `else` edge.
fn choose_edge(scope: &CompiledScope, from: &NodeId, guards: &GuardScope<'_>) -> Step {
    let mut chosen: Option<&CompiledEdge> = None;
    let mut fallback: Option<&CompiledEdge> = None;

    for edge in scope.outgoing(from.as_str()) {
        if edge.guard == EdgeGuard::Else {
            fallback.get_or_insert(edge);
            continue;
        }
        let matched = evaluate_edge(&edge.guard, guards).unwrap_or_else(|e| {
            warn!(node_id = %from, edge = edge.index, error = %e, "Edge guard failed, treating as false");
            false
        });
        if !matched {
            continue;
        }
        match chosen {
            None => chosen = Some(edge),
            Some(first) => {
                if first.guard == EdgeGuard::Always && edge.guard == EdgeGuard::Always {
                    warn!(
                        node_id = %from,
                        taken = first.index,
                        shadowed = edge.index,
                        "Several unconditional edges apply, taking the first declared"
                    );
                }
            }
        }
    }

    match chosen.or(fallback) {
        Some(edge) => match &edge.target {
            EdgeTarget::Node(id) => Step::Goto(id.clone()),
            EdgeTarget::Exit => Step::Exit,
        },
        None => Step::DeadEnd(from.clone()),
    }
}

/// Enter a fixed subgraph, or the locked path of a path fork.
fn enter(node: &CompiledNode, state: &TraversalState) -> Step {
    if let Some(scope) = &node.subgraph {
        return Step::Enter {
            scope: scope.clone(),
            caller: node.id().clone(),
        };
    }
    match state.path.locked_path() {
        None => Step::Wait,
        Some(path) => match node.path_scope(path.as_str()) {
            Some(scope) => Step::Enter {
                scope: scope.clone(),
                caller: node.id().clone(),
            },
            None => {
                warn!(node_id = %node.id(), path = %path, "Locked path is not offered by this fork");
                Step::DeadEnd(node.id().clone())
            }
        },
    }
}

/// Find the node owning `key`: current scope, enclosing frames, root, then
/// the locked path's scopes, then every other scope in lexical order.
fn resolve_owner<'g>(
    graph: &'g CompiledGraph,
    state: &TraversalState,
    key: &str,
) -> Option<(&'g CompiledScope, &'g CompiledNode)> {
    search_order(graph, state).into_iter().find_map(|scope_id| {
        let scope = graph.scope(&scope_id)?;
        let owner = scope.owner_of(key)?;
        Some((scope, scope.node(owner.as_str())?))
    })
}

fn search_order(graph: &CompiledGraph, state: &TraversalState) -> Vec<ScopeId> {
    let mut order = Vec::new();
    push_unique(&mut order, state.current_scope());
    for frame in state.call_stack.iter().rev() {
        push_unique(&mut order, frame.scope.clone());
    }
    push_unique(&mut order, ScopeId::root());
    if let Some(path) = state.path.locked_path() {
        for scope in path_scopes(graph, path) {
            push_unique(&mut order, scope);
        }
    }
    let mut rest = graph.scope_ids().to_vec();
    rest.sort();
    for scope in rest {
        push_unique(&mut order, scope);
    }
    order
}

fn push_unique(order: &mut Vec<ScopeId>, scope: ScopeId) {
    if !order.contains(&scope) {
        order.push(scope);
    }
}

/// Scopes entered when `path` is chosen at any fork of the graph.
fn path_scopes(graph: &CompiledGraph, path: &PathId) -> Vec<ScopeId> {
    let mut scopes = Vec::new();
    for scope_id in graph.scope_ids() {
        let Some(scope) = graph.scope(scope_id) else {
            continue;
        };
        for node in scope.nodes() {
            if let Some(target) = node.path_scope(path.as_str()) {
                push_unique(&mut scopes, target.clone());
            }
        }
    }
    scopes
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialflow_core::flow::{Edge, FlowDefinition, Node};
    use dialflow_core::types::Version;
    use dialflow_graph::compile;
    use dialflow_test_utils::{fixtures, TurnScript};
    use serde_json::json;

    fn engine() -> TraversalEngine {
        TraversalEngine::new(&EngineConfig::default())
    }

    fn started(flow: &FlowDefinition) -> (CompiledGraph, ConversationSnapshot) {
        let graph = compile(flow).unwrap();
        let (snapshot, _) = engine().start(&graph, BTreeMap::new()).unwrap();
        (graph, snapshot)
    }

    fn say(
        graph: &CompiledGraph,
        snapshot: &mut ConversationSnapshot,
        key: &str,
        value: Value,
    ) -> TurnOutcome {
        engine()
            .apply_turn(graph, snapshot, &ExtractionInput::new().answer(key, value))
            .unwrap()
    }

    fn signal(graph: &CompiledGraph, snapshot: &mut ConversationSnapshot, path: &str) -> TurnOutcome {
        engine()
            .apply_turn(graph, snapshot, &ExtractionInput::new().path(path))
            .unwrap()
    }

    #[test]
    fn start_waits_on_entry_question() {
        let graph = compile(&fixtures::qualification_flow()).unwrap();
        let (snapshot, outcome) = engine().start(&graph, BTreeMap::new()).unwrap();
        assert_eq!(snapshot.state.current_node_id.as_str(), "name");
        assert_eq!(outcome.status, ConversationStatus::AwaitingInput);
        assert_eq!(outcome.reply(), Some("What's your name?"));
        assert_eq!(outcome.turn, 0);
    }

    #[test]
    fn answer_advances_to_next_question() {
        let (graph, mut snapshot) = started(&fixtures::qualification_flow());
        let outcome = say(&graph, &mut snapshot, "name", json!("Ada"));
        assert_eq!(outcome.committed, vec![AnswerKey::new("name")]);
        assert_eq!(outcome.node.as_str(), "budget");
        assert_eq!(outcome.visited, vec![NodeId::new("name"), NodeId::new("budget")]);
        assert_eq!(snapshot.answers.get("name").unwrap().turn, 1);
    }

    #[test]
    fn invalid_answer_never_advances_or_commits() {
        let (graph, mut snapshot) = started(&fixtures::qualification_flow());
        say(&graph, &mut snapshot, "name", json!("Ada"));
        let outcome = say(&graph, &mut snapshot, "budget", json!(15));

        assert_eq!(snapshot.state.current_node_id.as_str(), "budget");
        assert!(!snapshot.answers.contains("budget"));
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].reason, "must be between 1 and 10");
        assert_eq!(
            outcome.clarification.as_deref(),
            Some(TraversalConfig::default().retry_prompt.as_str())
        );
        assert!(outcome.visited.is_empty());
    }

    #[test]
    fn validation_edge_supplies_clarification() {
        let (graph, mut snapshot) = started(&fixtures::validated_flow());
        let outcome = say(&graph, &mut snapshot, "score", json!("eleven"));
        assert_eq!(outcome.reply(), Some("Please pick a whole number from 1 to 10."));
        assert_eq!(outcome.node.as_str(), "score");

        let outcome = say(&graph, &mut snapshot, "score", json!("9"));
        assert_eq!(
            outcome.status,
            ConversationStatus::Terminal {
                node: NodeId::new("thanks")
            }
        );
        assert_eq!(snapshot.answers.value("score"), Some(&json!(9)));
    }

    #[test]
    fn guard_selection_routes_by_value() {
        for (x, expected) in [(json!(1), "a"), (json!(2), "b"), (json!("1"), "a")] {
            let (graph, mut snapshot) = started(&fixtures::guard_selection_flow(true));
            let outcome = say(&graph, &mut snapshot, "x", x);
            assert_eq!(
                outcome.status,
                ConversationStatus::Terminal {
                    node: NodeId::new(expected)
                }
            );
        }
    }

    #[test]
    fn path_fork_waits_then_enters_locked_path() {
        let (graph, mut snapshot) = started(&fixtures::qualification_flow());
        say(&graph, &mut snapshot, "name", json!("Ada"));
        let outcome = say(&graph, &mut snapshot, "budget", json!("7"));
        assert_eq!(outcome.node.as_str(), "fork");
        assert_eq!(outcome.prompt.as_deref(), Some("Tell me a little about your team."));

        let outcome = signal(&graph, &mut snapshot, "smb");
        assert_eq!(outcome.node.as_str(), "fork");
        let outcome = signal(&graph, &mut snapshot, "smb");
        assert_eq!(outcome.path.locked().map(|p| p.as_str()), Some("smb"));
        assert_eq!(outcome.node.as_str(), "seats");
        assert_eq!(outcome.scope.as_str(), "smb");

        let outcome = say(&graph, &mut snapshot, "seats", json!("12"));
        assert_eq!(
            outcome.status,
            ConversationStatus::Terminal {
                node: NodeId::new("done")
            }
        );
        assert!(snapshot.state.call_stack.is_empty());
    }

    #[test]
    fn noisy_signals_keep_fork_waiting() {
        let (graph, mut snapshot) = started(&fixtures::qualification_flow());
        say(&graph, &mut snapshot, "name", json!("Ada"));
        say(&graph, &mut snapshot, "budget", json!(6));
        for path in ["smb", "enterprise", "smb", "smb"] {
            signal(&graph, &mut snapshot, path);
        }
        assert_eq!(snapshot.state.current_node_id.as_str(), "fork");
        assert!(!snapshot.state.path.path_locked);
    }

    #[test]
    fn answers_for_other_scopes_resolve_by_key() {
        let (graph, mut snapshot) = started(&fixtures::qualification_flow());
        say(&graph, &mut snapshot, "name", json!("Ada"));
        say(&graph, &mut snapshot, "budget", json!(8));
        let outcome = say(&graph, &mut snapshot, "legal_contact", json!("Grace"));
        assert_eq!(outcome.committed, vec![AnswerKey::new("legal_contact")]);
        assert_eq!(outcome.node.as_str(), "fork");

        let outcome = engine()
            .override_path(&graph, &mut snapshot, PathId::new("enterprise"))
            .unwrap();
        assert_eq!(
            outcome.status,
            ConversationStatus::Terminal {
                node: NodeId::new("done")
            }
        );
        assert!(outcome.visited.contains(&NodeId::new("legal")));
    }

    #[test]
    fn unknown_and_low_confidence_proposals_are_ignored() {
        let mut config = EngineConfig::default();
        config.traversal.min_confidence = 0.5;
        let engine = TraversalEngine::new(&config);
        let graph = compile(&fixtures::qualification_flow()).unwrap();
        let (mut snapshot, _) = engine.start(&graph, BTreeMap::new()).unwrap();

        let input = ExtractionInput {
            proposed_answers: vec![
                ProposedAnswer::new("name", json!("Ada")).with_confidence(0.2),
                ProposedAnswer::new("favourite_colour", json!("blue")),
            ],
            ..Default::default()
        };
        let outcome = engine.apply_turn(&graph, &mut snapshot, &input).unwrap();
        assert!(outcome.committed.is_empty());
        assert_eq!(
            outcome.ignored,
            vec![
                IgnoredProposal {
                    key: AnswerKey::new("name"),
                    reason: IgnoreReason::LowConfidence
                },
                IgnoredProposal {
                    key: AnswerKey::new("favourite_colour"),
                    reason: IgnoreReason::UnknownKey
                },
            ]
        );
        assert_eq!(outcome.node.as_str(), "name");
    }

    #[test]
    fn escalation_signal_suspends_until_resumed() {
        let (graph, mut snapshot) = started(&fixtures::qualification_flow());
        let outcome = engine()
            .apply_turn(&graph, &mut snapshot, &ExtractionInput::new().escalate())
            .unwrap();
        assert_eq!(
            outcome.status,
            ConversationStatus::Escalated {
                reason: EscalationReason::ExtractorSignal
            }
        );

        let before = snapshot.clone();
        let outcome = say(&graph, &mut snapshot, "name", json!("Ada"));
        assert!(outcome.committed.is_empty());
        assert_eq!(snapshot, before);

        let outcome = engine().resume(&graph, &mut snapshot, None).unwrap();
        assert_eq!(outcome.status, ConversationStatus::AwaitingInput);
        assert_eq!(outcome.node.as_str(), "name");
    }

    #[test]
    fn escalation_node_and_targeted_resume() {
        let (graph, mut snapshot) = started(&fixtures::qualification_flow());
        say(&graph, &mut snapshot, "name", json!("Ada"));
        let outcome = say(&graph, &mut snapshot, "budget", json!(10));
        assert_eq!(
            outcome.status,
            ConversationStatus::Escalated {
                reason: EscalationReason::Node {
                    node: NodeId::new("handoff")
                }
            }
        );
        assert!(engine()
            .resume(&graph, &mut snapshot.clone(), Some(&NodeId::new("seats")))
            .is_err());

        let outcome = engine()
            .resume(&graph, &mut snapshot, Some(&NodeId::new("fork")))
            .unwrap();
        assert_eq!(outcome.node.as_str(), "fork");
        assert!(engine().resume(&graph, &mut snapshot, None).is_err());
    }

    #[test]
    fn ineligible_terminal_escalates_as_dead_end() {
        let flow = FlowDefinition::new("strict")
            .with_node(Node::question("ask", "x", "Pick a number"))
            .with_node(Node::terminal("end").with_guard("x == 1"))
            .with_edge(Edge::always("ask", "end"));
        let (graph, mut snapshot) = started(&flow);
        let outcome = say(&graph, &mut snapshot, "x", json!(2));
        assert_eq!(
            outcome.status,
            ConversationStatus::Escalated {
                reason: EscalationReason::DeadEnd {
                    node: NodeId::new("end")
                }
            }
        );
    }

    #[test]
    fn action_nodes_are_reported() {
        let flow = FlowDefinition::new("notify")
            .with_node(Node::question("ask", "email", "Your email?"))
            .with_node(Node::action("send_welcome"))
            .with_node(Node::terminal("end"))
            .with_edge(Edge::always("ask", "send_welcome"))
            .with_edge(Edge::always("send_welcome", "end"));
        let (graph, mut snapshot) = started(&flow);
        let outcome = say(&graph, &mut snapshot, "email", json!("ada@example.com"));
        assert_eq!(outcome.actions, vec![NodeId::new("send_welcome")]);
    }

    #[test]
    fn replay_is_deterministic() {
        let script = TurnScript::new()
            .answer("name", json!("Ada"))
            .answer("budget", json!("9"))
            .signals(&["enterprise", "smb", "enterprise", "enterprise", "enterprise"])
            .answer("legal_contact", json!("Grace"));

        let run = || {
            let (graph, mut snapshot) = started(&fixtures::qualification_flow());
            let outcomes: Vec<_> = script
                .iter()
                .map(|input| engine().apply_turn(&graph, &mut snapshot, input).unwrap())
                .collect();
            (snapshot, outcomes)
        };
        let (first, first_outcomes) = run();
        let (second, second_outcomes) = run();
        assert_eq!(first, second);
        assert_eq!(first_outcomes, second_outcomes);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        assert_eq!(first.state.turn, script.len() as u64);
    }

    #[test]
    fn repin_requires_position_in_new_version() {
        let base = fixtures::qualification_flow();
        let (graph, mut snapshot) = started(&base);
        say(&graph, &mut snapshot, "name", json!("Ada"));

        let mut reworded = base.clone();
        reworded.version = Version(2);
        reworded.node_mut("budget").unwrap().prompt = Some("Budget, 1 to 10?".into());
        let next = compile(&reworded).unwrap();
        engine().repin(&next, &mut snapshot).unwrap();
        assert_eq!(snapshot.state.version, Version(2));
        let outcome = say(&next, &mut snapshot, "budget", json!(2));
        assert_eq!(
            outcome.status,
            ConversationStatus::Terminal {
                node: NodeId::new("nurture")
            }
        );

        let (graph, mut snapshot) = started(&base);
        say(&graph, &mut snapshot, "name", json!("Ada"));
        let mut removed = base.clone();
        removed.version = Version(2);
        removed.nodes.retain(|n| n.id.as_str() != "budget");
        removed.edges.retain(|e| e.from.as_str() != "budget" && e.to.as_str() != "budget");
        removed.edges.push(Edge::always("name", "route"));
        let next = compile(&removed).unwrap();
        let before = snapshot.clone();
        assert!(engine().repin(&next, &mut snapshot).is_err());
        assert_eq!(snapshot, before);
    }

    #[test]
    fn turn_against_wrong_version_is_rejected() {
        let (graph, mut snapshot) = started(&fixtures::qualification_flow());
        snapshot.state.version = Version(5);
        let err = engine()
            .apply_turn(&graph, &mut snapshot, &ExtractionInput::new())
            .unwrap_err();
        assert!(matches!(err, DialflowError::InvalidState(_)));
    }
}
