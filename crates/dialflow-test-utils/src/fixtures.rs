use std::collections::BTreeMap;

use dialflow_core::flow::{Edge, FlowDefinition, Node};
use dialflow_core::state::{ConversationSnapshot, TraversalState};
use dialflow_core::types::{Answers, NodeId, PathId};

/// Lead qualification flow used across the test suites.
///
/// ```text
/// name -> budget -> route --budget == 10--> handoff (escalation)
///                         --budget >= 5---> fork [smb | enterprise] -> done
///                         --else----------> nurture
/// ```
pub fn qualification_flow() -> FlowDefinition {
    FlowDefinition::new("qualification")
        .with_node(Node::question("name", "name", "What's your name?"))
        .with_node(
            Node::question("budget", "budget", "On a scale of 1 to 10, how big is your budget?")
                .with_validator("range(1, 10)"),
        )
        .with_node(Node::decision("route"))
        .with_node(Node::escalation("handoff").with_prompt("Connecting you with our team."))
        .with_node(Node::path_fork(
            "fork",
            vec![PathId::new("smb"), PathId::new("enterprise")],
            "Tell me a little about your team.",
        ))
        .with_node(Node::terminal("nurture").with_prompt("Thanks, we'll stay in touch."))
        .with_node(Node::terminal("done").with_prompt("Great, a specialist will follow up."))
        .with_edge(Edge::always("name", "budget"))
        .with_edge(Edge::always("budget", "route"))
        .with_edge(Edge::when("route", "handoff", "budget == 10"))
        .with_edge(Edge::when("route", "fork", "budget >= 5"))
        .with_edge(Edge::otherwise("route", "nurture"))
        .with_edge(Edge::always("fork", "done"))
        .with_subgraph(
            "smb",
            FlowDefinition::default()
                .with_node(
                    Node::question("seats", "seats", "How many seats do you need?")
                        .with_validator("integer"),
                )
                .with_edge(Edge::exit("seats")),
        )
        .with_subgraph(
            "enterprise",
            FlowDefinition::default()
                .with_node(Node::question(
                    "legal",
                    "legal_contact",
                    "Who handles procurement on your side?",
                ))
                .with_edge(Edge::exit("legal")),
        )
}

/// `ask(x) -> route`, with `x == 1 -> a` and optionally `else -> b`.
pub fn guard_selection_flow(with_else: bool) -> FlowDefinition {
    let mut flow = FlowDefinition::new("guards")
        .with_node(Node::question("ask", "x", "Pick a number"))
        .with_node(Node::decision("route"))
        .with_node(Node::terminal("a"))
        .with_node(Node::terminal("b"))
        .with_edge(Edge::always("ask", "route"))
        .with_edge(Edge::when("route", "a", "x == 1"));
    if with_else {
        flow = flow.with_edge(Edge::otherwise("route", "b"));
    }
    flow
}

/// A validated question with a validation-error edge.
pub fn validated_flow() -> FlowDefinition {
    FlowDefinition::new("survey")
        .with_node(
            Node::question("score", "score", "How likely are you to recommend us?")
                .with_validator("range(1, 10)"),
        )
        .with_node(Node::terminal("score_help").with_prompt("Please pick a whole number from 1 to 10."))
        .with_node(Node::terminal("thanks"))
        .with_edge(Edge::on_invalid("score", "score_help"))
        .with_edge(Edge::always("score", "thanks"))
}

/// A fresh snapshot positioned at `node` of the given flow.
pub fn snapshot_at(flow: &FlowDefinition, node: &str) -> ConversationSnapshot {
    ConversationSnapshot {
        state: TraversalState::new(flow.id.clone(), flow.version, NodeId::new(node)),
        answers: Answers::new(),
        context: BTreeMap::new(),
    }
}
