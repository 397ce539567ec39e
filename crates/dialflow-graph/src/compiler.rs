use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use tracing::{debug, warn};

use dialflow_core::error::CompileError;
use dialflow_core::flow::{FlowDefinition, Node, NodeKind, ScopeId, EXIT};
use dialflow_core::types::{AnswerKey, FlowId, NodeId, PathId, Version};

use crate::guard::{compile_edge_guard, compile_expr, EdgeGuard, Expr, Operand, PredicateRegistry};
use crate::validate::{CompiledValidator, ValidatorRegistry};

/// Where a traversal edge leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeTarget {
    Node(NodeId),
    /// Return to the caller's `subgraphRef` node.
    Exit,
}

#[derive(Debug, Clone)]
pub struct CompiledEdge {
    /// Position in the scope's declared edge list.
    pub index: usize,
    pub from: NodeId,
    pub target: EdgeTarget,
    pub guard: EdgeGuard,
    pub reentrant: bool,
}

#[derive(Debug, Clone)]
pub struct CompiledNode {
    pub node: Node,
    /// `guard`, `when`, `depends_on` and `extra_guards` AND-ed together.
    pub eligibility: Option<Expr>,
    pub validator: Option<CompiledValidator>,
    /// Scope entered by a fixed `subgraphRef`.
    pub subgraph: Option<ScopeId>,
    /// Scope entered for each candidate path of a path fork.
    pub paths: Vec<(PathId, ScopeId)>,
}

impl CompiledNode {
    pub fn id(&self) -> &NodeId {
        &self.node.id
    }

    pub fn kind(&self) -> NodeKind {
        self.node.kind
    }

    pub fn path_scope(&self, path: &str) -> Option<&ScopeId> {
        self.paths
            .iter()
            .find(|(p, _)| p.as_str() == path)
            .map(|(_, scope)| scope)
    }
}

/// One compiled (sub)graph with constant-time lookups.
#[derive(Debug, Clone)]
pub struct CompiledScope {
    id: ScopeId,
    entry: NodeId,
    order: Vec<NodeId>,
    nodes: HashMap<NodeId, CompiledNode>,
    outgoing: HashMap<NodeId, Vec<CompiledEdge>>,
    invalid_targets: HashMap<NodeId, NodeId>,
    keys: HashMap<AnswerKey, NodeId>,
}

impl CompiledScope {
    pub fn id(&self) -> &ScopeId {
        &self.id
    }

    pub fn entry(&self) -> &NodeId {
        &self.entry
    }

    pub fn node(&self, id: &str) -> Option<&CompiledNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Traversal edges from a node, in declaration order.
    pub fn outgoing(&self, id: &str) -> &[CompiledEdge] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Target of the node's validation-error edge.
    pub fn invalid_target(&self, id: &str) -> Option<&NodeId> {
        self.invalid_targets.get(id)
    }

    /// The node that owns an answer key in this scope.
    pub fn owner_of(&self, key: &str) -> Option<&NodeId> {
        self.keys.get(key)
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &CompiledNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }
}

/// Non-fatal findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompileWarning {
    UnreachableNode { scope: ScopeId, node: NodeId },
    /// An edge declared after an unconditional edge from the same node.
    ShadowedEdge {
        scope: ScopeId,
        from: NodeId,
        edge: String,
    },
}

impl std::fmt::Display for CompileWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileWarning::UnreachableNode { scope, node } => {
                write!(f, "node '{}' in {} is unreachable from the entry", node, scope)
            }
            CompileWarning::ShadowedEdge { scope, from, edge } => write!(
                f,
                "edge {} in {} is shadowed by an earlier unconditional edge from '{}'",
                edge, scope, from
            ),
        }
    }
}

/// A validated flow, ready for traversal.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    definition: FlowDefinition,
    scope_order: Vec<ScopeId>,
    scopes: HashMap<ScopeId, CompiledScope>,
    warnings: Vec<CompileWarning>,
    predicates: PredicateRegistry,
}

impl CompiledGraph {
    pub fn id(&self) -> &FlowId {
        &self.definition.id
    }

    pub fn version(&self) -> Version {
        self.definition.version
    }

    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }

    pub fn into_definition(self) -> FlowDefinition {
        self.definition
    }

    pub fn root(&self) -> &CompiledScope {
        // The root scope is always compiled first.
        &self.scopes[&ScopeId::root()]
    }

    pub fn scope(&self, id: &ScopeId) -> Option<&CompiledScope> {
        self.scopes.get(id)
    }

    /// Scope ids: root first, then subgraphs depth-first in name order.
    pub fn scope_ids(&self) -> &[ScopeId] {
        &self.scope_order
    }

    pub fn warnings(&self) -> &[CompileWarning] {
        &self.warnings
    }

    /// Predicates the guards were checked against.
    pub fn predicates(&self) -> &PredicateRegistry {
        &self.predicates
    }
}

/// Graph compiler, configured with the predicate and validator registries
/// that flows may reference.
#[derive(Debug, Clone)]
pub struct Compiler {
    predicates: PredicateRegistry,
    validators: ValidatorRegistry,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

/// Compile with the built-in predicates and validators.
pub fn compile(definition: &FlowDefinition) -> Result<CompiledGraph, CompileError> {
    Compiler::new().compile(definition)
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            predicates: PredicateRegistry::with_builtins(),
            validators: ValidatorRegistry::with_builtins(),
        }
    }

    pub fn with_predicates(mut self, predicates: PredicateRegistry) -> Self {
        self.predicates = predicates;
        self
    }

    pub fn with_validators(mut self, validators: ValidatorRegistry) -> Self {
        self.validators = validators;
        self
    }

    pub fn predicates(&self) -> &PredicateRegistry {
        &self.predicates
    }

    /// Parse a raw JSON flow document and compile it.
    pub fn compile_json(&self, raw: &str) -> Result<CompiledGraph, CompileError> {
        let definition: FlowDefinition =
            serde_json::from_str(raw).map_err(|e| CompileError::Schema {
                element: format!("line {} column {}", e.line(), e.column()),
                detail: e.to_string(),
            })?;
        self.compile(&definition)
    }

    pub fn compile(&self, definition: &FlowDefinition) -> Result<CompiledGraph, CompileError> {
        if definition.id.as_str().trim().is_empty() {
            return Err(schema("flow", "missing flow id"));
        }

        let mut scope_defs = Vec::new();
        collect_scopes(definition, ScopeId::root(), &mut scope_defs);
        let known: HashSet<ScopeId> = scope_defs.iter().map(|(id, _)| id.clone()).collect();

        let mut compiled = Vec::with_capacity(scope_defs.len());
        for (scope_id, def) in &scope_defs {
            compiled.push(self.build_scope(scope_id, def, &known)?);
        }

        check_subgraph_recursion(&compiled)?;

        let mut warnings = Vec::new();
        for scope in &compiled {
            check_cycles(scope)?;
            check_dead_ends(scope)?;
            warnings.extend(scope_warnings(scope));
        }

        for warning in &warnings {
            warn!(flow = %definition.id, version = %definition.version, "{}", warning);
        }
        debug!(
            flow = %definition.id,
            version = %definition.version,
            scopes = compiled.len(),
            "Flow compiled"
        );

        let scope_order = compiled.iter().map(|s| s.id.clone()).collect();
        let scopes = compiled.into_iter().map(|s| (s.id.clone(), s)).collect();
        Ok(CompiledGraph {
            definition: definition.clone(),
            scope_order,
            scopes,
            warnings,
            predicates: self.predicates.clone(),
        })
    }

    fn build_scope(
        &self,
        scope_id: &ScopeId,
        def: &FlowDefinition,
        known: &HashSet<ScopeId>,
    ) -> Result<CompiledScope, CompileError> {
        let scope_label = scope_id.to_string();
        if def.nodes.is_empty() {
            return Err(schema(&scope_label, "graph has no nodes"));
        }
        for name in def.subgraphs.keys() {
            if name.trim().is_empty() || name.contains('/') {
                return Err(schema(
                    &scope_label,
                    format!("invalid subgraph name '{}'", name),
                ));
            }
        }

        let mut order = Vec::with_capacity(def.nodes.len());
        let mut nodes = HashMap::with_capacity(def.nodes.len());
        let mut keys = HashMap::new();
        for node in &def.nodes {
            let compiled = self.compile_node(scope_id, node, known)?;
            if nodes.contains_key(&node.id) {
                return Err(CompileError::DuplicateId {
                    scope: scope_label,
                    id: node.id.to_string(),
                });
            }
            if let Some(key) = &node.key {
                if keys.insert(key.clone(), node.id.clone()).is_some() {
                    return Err(CompileError::DuplicateId {
                        scope: scope_label,
                        id: key.to_string(),
                    });
                }
            }
            order.push(node.id.clone());
            nodes.insert(node.id.clone(), compiled);
        }

        let entry = match &def.entry {
            Some(entry) if !nodes.contains_key(entry) => {
                return Err(CompileError::Reference {
                    element: qualified(scope_id, "entry"),
                    missing: entry.to_string(),
                });
            }
            Some(entry) => entry.clone(),
            None => order[0].clone(),
        };

        let mut outgoing: HashMap<NodeId, Vec<CompiledEdge>> = HashMap::new();
        let mut invalid_targets = HashMap::new();
        for (index, edge) in def.edges.iter().enumerate() {
            let element = qualified(scope_id, &edge.key());
            if edge.from.as_str().is_empty() || edge.to.as_str().is_empty() {
                return Err(schema(&element, "edges require both from and to"));
            }
            if !nodes.contains_key(&edge.from) {
                return Err(CompileError::Reference {
                    element,
                    missing: edge.from.to_string(),
                });
            }

            if edge.on_invalid {
                if !nodes.contains_key(&edge.to) {
                    return Err(CompileError::Reference {
                        element,
                        missing: edge.to.to_string(),
                    });
                }
                if invalid_targets
                    .insert(edge.from.clone(), edge.to.clone())
                    .is_some()
                {
                    return Err(schema(
                        &element,
                        format!("'{}' already has a validation-error edge", edge.from),
                    ));
                }
                continue;
            }

            let target = if edge.targets_exit() {
                if scope_id.is_root() {
                    return Err(CompileError::Reference {
                        element,
                        missing: format!("{} (only valid inside a subgraph)", EXIT),
                    });
                }
                EdgeTarget::Exit
            } else if nodes.contains_key(&edge.to) {
                EdgeTarget::Node(edge.to.clone())
            } else {
                return Err(CompileError::Reference {
                    element,
                    missing: edge.to.to_string(),
                });
            };

            let guard = compile_edge_guard(edge.guard.as_deref(), &self.predicates).map_err(
                |source| CompileError::Guard {
                    element: element.clone(),
                    source,
                },
            )?;

            let list = outgoing.entry(edge.from.clone()).or_default();
            if guard == EdgeGuard::Else && list.iter().any(|e| e.guard == EdgeGuard::Else) {
                return Err(schema(
                    &element,
                    format!("'{}' already has an else edge", edge.from),
                ));
            }
            list.push(CompiledEdge {
                index,
                from: edge.from.clone(),
                target,
                guard,
                reentrant: edge.reentrant,
            });
        }

        Ok(CompiledScope {
            id: scope_id.clone(),
            entry,
            order,
            nodes,
            outgoing,
            invalid_targets,
            keys,
        })
    }

    fn compile_node(
        &self,
        scope_id: &ScopeId,
        node: &Node,
        known: &HashSet<ScopeId>,
    ) -> Result<CompiledNode, CompileError> {
        if node.id.as_str().trim().is_empty() {
            return Err(schema(&scope_id.to_string(), "node without an id"));
        }
        let element = qualified(scope_id, node.id.as_str());
        if node.id.as_str() == EXIT {
            return Err(schema(&element, format!("'{}' is reserved", EXIT)));
        }

        match node.kind {
            NodeKind::Question if node.key.is_none() => {
                return Err(schema(&element, "question nodes require a key"));
            }
            NodeKind::SubgraphRef => match (&node.subgraph, node.paths.is_empty()) {
                (None, true) => {
                    return Err(schema(
                        &element,
                        "subgraphRef nodes require a subgraph or candidate paths",
                    ))
                }
                (Some(_), false) => {
                    return Err(schema(
                        &element,
                        "subgraphRef nodes take either a subgraph or paths, not both",
                    ))
                }
                _ => {}
            },
            _ => {}
        }

        let mut clauses = Vec::new();
        let texts = node
            .guard
            .iter()
            .chain(node.when.iter())
            .chain(node.extra_guards.iter());
        for text in texts {
            let expr = compile_expr(text, &self.predicates).map_err(|source| {
                CompileError::Guard {
                    element: element.clone(),
                    source,
                }
            })?;
            clauses.push(expr);
        }
        for key in &node.depends_on {
            clauses.push(Expr::Present(Operand::Answer(key.to_string())));
        }

        let validator = match node.validator.as_deref() {
            Some(spec) => Some(self.validators.compile(spec).map_err(|detail| {
                schema(&element, format!("validator '{}': {}", spec, detail))
            })?),
            None => None,
        };

        let subgraph = match &node.subgraph {
            Some(name) => Some(resolve_subgraph(scope_id, name, known).ok_or_else(|| {
                CompileError::Reference {
                    element: element.clone(),
                    missing: name.clone(),
                }
            })?),
            None => None,
        };

        let mut paths = Vec::with_capacity(node.paths.len());
        for path in &node.paths {
            let scope = resolve_subgraph(scope_id, path.as_str(), known).ok_or_else(|| {
                CompileError::Reference {
                    element: element.clone(),
                    missing: path.to_string(),
                }
            })?;
            paths.push((path.clone(), scope));
        }

        Ok(CompiledNode {
            node: node.clone(),
            eligibility: Expr::all(clauses),
            validator,
            subgraph,
            paths,
        })
    }
}

fn schema(element: &str, detail: impl Into<String>) -> CompileError {
    CompileError::Schema {
        element: element.to_string(),
        detail: detail.into(),
    }
}

/// Element name qualified by its scope, e.g. `smb/budget`.
fn qualified(scope: &ScopeId, element: &str) -> String {
    if scope.is_root() {
        element.to_string()
    } else {
        format!("{}/{}", scope.as_str(), element)
    }
}

fn collect_scopes<'a>(
    def: &'a FlowDefinition,
    scope: ScopeId,
    out: &mut Vec<(ScopeId, &'a FlowDefinition)>,
) {
    out.push((scope.clone(), def));
    for (name, sub) in &def.subgraphs {
        collect_scopes(sub, scope.child(name), out);
    }
}

/// Look a subgraph name up in the current scope, then in enclosing scopes.
fn resolve_subgraph(scope: &ScopeId, name: &str, known: &HashSet<ScopeId>) -> Option<ScopeId> {
    let mut current = Some(scope.clone());
    while let Some(s) = current {
        let candidate = s.child(name);
        if known.contains(&candidate) {
            return Some(candidate);
        }
        current = s.parent();
    }
    None
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Cycles are allowed only through a re-entrant edge or into a re-entrant node.
fn check_cycles(scope: &CompiledScope) -> Result<(), CompileError> {
    let mut marks: HashMap<&NodeId, Mark> = HashMap::new();
    let mut stack: Vec<&NodeId> = Vec::new();
    for start in &scope.order {
        if !marks.contains_key(start) {
            visit_node(scope, start, &mut marks, &mut stack)?;
        }
    }
    Ok(())
}

fn visit_node<'a>(
    scope: &'a CompiledScope,
    node: &'a NodeId,
    marks: &mut HashMap<&'a NodeId, Mark>,
    stack: &mut Vec<&'a NodeId>,
) -> Result<(), CompileError> {
    marks.insert(node, Mark::Visiting);
    stack.push(node);
    for edge in scope.outgoing(node.as_str()) {
        let EdgeTarget::Node(next) = &edge.target else {
            continue;
        };
        let target_reentrant = scope.node(next.as_str()).is_some_and(|n| n.node.reentrant);
        if edge.reentrant || target_reentrant {
            continue;
        }
        match marks.get(next) {
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|n| *n == next).unwrap_or(0);
                let mut path: Vec<&str> = stack[start..].iter().map(|n| n.as_str()).collect();
                path.push(next.as_str());
                return Err(CompileError::Cycle {
                    node: qualified(&scope.id, next.as_str()),
                    path: path.join(" -> "),
                });
            }
            Some(Mark::Done) => {}
            None => visit_node(scope, next, marks, stack)?,
        }
    }
    stack.pop();
    marks.insert(node, Mark::Done);
    Ok(())
}

/// Subgraphs may not (transitively) enter themselves unless the entering
/// node is re-entrant.
fn check_subgraph_recursion(scopes: &[CompiledScope]) -> Result<(), CompileError> {
    let mut calls: HashMap<&ScopeId, Vec<(&NodeId, &ScopeId)>> = HashMap::new();
    for scope in scopes {
        let list = calls.entry(&scope.id).or_default();
        for node in scope.nodes() {
            if node.node.reentrant {
                continue;
            }
            for target in node.subgraph.iter().chain(node.paths.iter().map(|(_, s)| s)) {
                list.push((node.id(), target));
            }
        }
    }

    let mut marks: HashMap<&ScopeId, Mark> = HashMap::new();
    let mut stack: Vec<&ScopeId> = Vec::new();
    for scope in scopes {
        if !marks.contains_key(&scope.id) {
            visit_scope(&scope.id, &calls, &mut marks, &mut stack)?;
        }
    }
    Ok(())
}

fn visit_scope<'a>(
    scope: &'a ScopeId,
    calls: &HashMap<&'a ScopeId, Vec<(&'a NodeId, &'a ScopeId)>>,
    marks: &mut HashMap<&'a ScopeId, Mark>,
    stack: &mut Vec<&'a ScopeId>,
) -> Result<(), CompileError> {
    marks.insert(scope, Mark::Visiting);
    stack.push(scope);
    for &(caller, target) in calls.get(scope).map(Vec::as_slice).unwrap_or(&[]) {
        match marks.get(target) {
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|s| *s == target).unwrap_or(0);
                let mut path: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                path.push(target.to_string());
                return Err(CompileError::Cycle {
                    node: qualified(scope, caller.as_str()),
                    path: path.join(" -> "),
                });
            }
            Some(Mark::Done) => {}
            None => visit_scope(target, calls, marks, stack)?,
        }
    }
    stack.pop();
    marks.insert(scope, Mark::Done);
    Ok(())
}

/// Every non-final node needs an edge that applies regardless of answers.
fn check_dead_ends(scope: &CompiledScope) -> Result<(), CompileError> {
    for node in scope.nodes() {
        if matches!(node.kind(), NodeKind::Terminal | NodeKind::Escalation) {
            continue;
        }
        let has_fallback = scope
            .outgoing(node.id().as_str())
            .iter()
            .any(|e| e.guard.is_fallback());
        if !has_fallback {
            return Err(CompileError::DeadEnd {
                node: qualified(&scope.id, node.id().as_str()),
            });
        }
    }
    Ok(())
}

fn scope_warnings(scope: &CompiledScope) -> Vec<CompileWarning> {
    let mut warnings = Vec::new();

    let mut reachable: HashSet<&NodeId> = HashSet::new();
    let mut queue = VecDeque::from([&scope.entry]);
    while let Some(id) = queue.pop_front() {
        if !reachable.insert(id) {
            continue;
        }
        for edge in scope.outgoing(id.as_str()) {
            if let EdgeTarget::Node(next) = &edge.target {
                queue.push_back(next);
            }
        }
        if let Some(target) = scope.invalid_targets.get(id) {
            queue.push_back(target);
        }
    }
    for id in &scope.order {
        if !reachable.contains(id) {
            warnings.push(CompileWarning::UnreachableNode {
                scope: scope.id.clone(),
                node: id.clone(),
            });
        }
    }

    for id in &scope.order {
        let edges = scope.outgoing(id.as_str());
        let first_unconditional = edges.iter().position(|e| match &e.guard {
            EdgeGuard::Always => true,
            EdgeGuard::When(expr) => expr.is_always_true(),
            EdgeGuard::Else => false,
        });
        if let Some(pos) = first_unconditional {
            for edge in &edges[pos + 1..] {
                let to = match &edge.target {
                    EdgeTarget::Node(n) => n.as_str(),
                    EdgeTarget::Exit => EXIT,
                };
                warnings.push(CompileWarning::ShadowedEdge {
                    scope: scope.id.clone(),
                    from: id.clone(),
                    edge: format!("{}->{}", edge.from, to),
                });
            }
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialflow_core::flow::Edge;

    fn linear() -> FlowDefinition {
        FlowDefinition::new("lead")
            .with_node(Node::question("name", "name", "What's your name?"))
            .with_node(Node::question("budget", "budget", "Budget?").with_validator("range(1, 10)"))
            .with_node(Node::terminal("done"))
            .with_edge(Edge::always("name", "budget"))
            .with_edge(Edge::always("budget", "done"))
    }

    #[test]
    fn compiles_with_constant_time_lookups() {
        let graph = compile(&linear()).unwrap();
        let root = graph.root();
        assert_eq!(root.entry().as_str(), "name");
        assert_eq!(root.owner_of("budget").unwrap().as_str(), "budget");
        assert_eq!(root.outgoing("name").len(), 1);
        assert!(root.node("budget").unwrap().validator.is_some());
        assert!(graph.warnings().is_empty());
    }

    #[test]
    fn duplicate_node_id() {
        let def = linear().with_node(Node::terminal("done"));
        assert!(matches!(
            compile(&def),
            Err(CompileError::DuplicateId { id, .. }) if id == "done"
        ));
    }

    #[test]
    fn duplicate_answer_key() {
        let def = linear()
            .with_node(Node::question("name2", "name", "Name again?"))
            .with_edge(Edge::always("name2", "done"));
        assert!(matches!(
            compile(&def),
            Err(CompileError::DuplicateId { id, .. }) if id == "name"
        ));
    }

    #[test]
    fn question_without_key_is_schema_error() {
        let mut def = linear();
        def.nodes[0].key = None;
        assert_eq!(
            compile(&def).unwrap_err(),
            CompileError::Schema {
                element: "name".into(),
                detail: "question nodes require a key".into(),
            }
        );
    }

    #[test]
    fn dangling_edge_target() {
        let def = linear().with_edge(Edge::when("name", "ghost", "name present"));
        assert_eq!(
            compile(&def).unwrap_err(),
            CompileError::Reference {
                element: "name->ghost".into(),
                missing: "ghost".into(),
            }
        );
    }

    #[test]
    fn exit_is_rejected_in_root_scope() {
        let mut def = linear();
        def.edges[1] = Edge::exit("budget");
        assert!(matches!(
            compile(&def),
            Err(CompileError::Reference { element, .. }) if element == "budget->__exit__"
        ));
    }

    #[test]
    fn unexpected_cycle_is_rejected() {
        let def = linear().with_edge(Edge::when("budget", "name", "budget < 3"));
        let err = compile(&def).unwrap_err();
        assert_eq!(
            err,
            CompileError::Cycle {
                node: "name".into(),
                path: "name -> budget -> name".into(),
            }
        );
    }

    #[test]
    fn reentrant_cycle_is_allowed() {
        let def = linear().with_edge(Edge::when("budget", "name", "budget < 3").reentrant());
        assert!(compile(&def).is_ok());

        let mut def = linear().with_edge(Edge::when("budget", "name", "budget < 3"));
        def.nodes[0].reentrant = true;
        assert!(compile(&def).is_ok());
    }

    #[test]
    fn guarded_only_node_is_a_dead_end() {
        let def = FlowDefinition::new("route")
            .with_node(Node::decision("check"))
            .with_node(Node::terminal("a"))
            .with_node(Node::terminal("b"))
            .with_edge(Edge::when("check", "a", "x == 1"))
            .with_edge(Edge::otherwise("check", "b"));
        assert!(compile(&def).is_ok());

        let mut without_else = def.clone();
        without_else.edges.pop();
        assert_eq!(
            compile(&without_else).unwrap_err(),
            CompileError::DeadEnd { node: "check".into() }
        );
    }

    #[test]
    fn two_else_edges_are_rejected() {
        let def = FlowDefinition::new("route")
            .with_node(Node::decision("check"))
            .with_node(Node::terminal("a"))
            .with_node(Node::terminal("b"))
            .with_edge(Edge::otherwise("check", "a"))
            .with_edge(Edge::otherwise("check", "b"));
        assert!(matches!(compile(&def), Err(CompileError::Schema { .. })));
    }

    #[test]
    fn unknown_predicate_is_caught_at_compile_time() {
        let def = FlowDefinition::new("route")
            .with_node(Node::decision("check"))
            .with_node(Node::terminal("a"))
            .with_edge(Edge::when("check", "a", "is_vip(tier)"))
            .with_edge(Edge::otherwise("check", "a"));
        match compile(&def).unwrap_err() {
            CompileError::Guard { element, source } => {
                assert_eq!(element, "check->a");
                assert_eq!(source, dialflow_core::EvalError::UnknownPredicate("is_vip".into()));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn runaway_guard_nesting_is_a_guard_error() {
        let deep = format!("{}tier present", "NOT ".repeat(200_000));
        let def = FlowDefinition::new("route")
            .with_node(Node::decision("check"))
            .with_node(Node::terminal("a"))
            .with_edge(Edge::when("check", "a", &deep))
            .with_edge(Edge::otherwise("check", "a"));
        assert!(matches!(
            compile(&def),
            Err(CompileError::Guard {
                source: dialflow_core::EvalError::Parse { .. },
                ..
            })
        ));

        let mut def = linear();
        def.nodes[1].when = Some(format!("{}name present{}", "(".repeat(80), ")".repeat(80)));
        assert!(matches!(
            compile(&def),
            Err(CompileError::Guard { element, .. }) if element == "budget"
        ));
    }

    #[test]
    fn unknown_validator_is_schema_error() {
        let mut def = linear();
        def.nodes[1].validator = Some("shoe_size".into());
        assert!(matches!(
            compile(&def),
            Err(CompileError::Schema { element, .. }) if element == "budget"
        ));
    }

    #[test]
    fn eligibility_folds_when_and_dependencies() {
        let mut node = Node::question("company", "company", "Company?");
        node.when = Some("name present".into());
        node.depends_on = vec!["budget".into()];
        node.extra_guards = vec!["ctx.channel != 'sms'".into()];
        let def = FlowDefinition::new("lead")
            .with_node(node)
            .with_node(Node::terminal("done"))
            .with_edge(Edge::always("company", "done"));
        let graph = compile(&def).unwrap();
        let eligibility = graph.root().node("company").unwrap().eligibility.clone().unwrap();
        assert_eq!(eligibility.answer_keys(), vec!["name", "budget"]);
    }

    #[test]
    fn warnings_for_unreachable_and_shadowed() {
        let def = linear()
            .with_node(Node::terminal("orphan"))
            .with_edge(Edge::when("name", "done", "name == 'x'"));
        let graph = compile(&def).unwrap();
        assert_eq!(
            graph.warnings(),
            &[
                CompileWarning::UnreachableNode {
                    scope: ScopeId::root(),
                    node: "orphan".into(),
                },
                CompileWarning::ShadowedEdge {
                    scope: ScopeId::root(),
                    from: "name".into(),
                    edge: "name->done".into(),
                },
            ]
        );
    }

    fn sub(entry_prompt: &str) -> FlowDefinition {
        FlowDefinition::default()
            .with_node(Node::question("seats", "seats", entry_prompt))
            .with_edge(Edge::exit("seats"))
    }

    #[test]
    fn subgraphs_resolve_and_exit() {
        let def = FlowDefinition::new("lead")
            .with_node(Node::path_fork(
                "segment",
                vec![PathId::new("smb"), PathId::new("enterprise")],
                "Tell me about your team",
            ))
            .with_node(Node::terminal("done"))
            .with_edge(Edge::always("segment", "done"))
            .with_subgraph("smb", sub("How many seats?"))
            .with_subgraph("enterprise", {
                let mut s = sub("How many regions?");
                s.nodes[0].id = "regions".into();
                s.nodes[0].key = Some("regions".into());
                s.edges[0] = Edge::exit("regions");
                s
            });
        let graph = compile(&def).unwrap();
        let fork = graph.root().node("segment").unwrap();
        assert_eq!(fork.path_scope("smb"), Some(&ScopeId::from("smb")));
        let smb = graph.scope(&ScopeId::from("smb")).unwrap();
        assert_eq!(smb.outgoing("seats")[0].target, EdgeTarget::Exit);
        assert_eq!(
            graph.scope_ids(),
            &[ScopeId::root(), ScopeId::from("enterprise"), ScopeId::from("smb")]
        );
    }

    #[test]
    fn missing_subgraph_is_reference_error() {
        let def = FlowDefinition::new("lead")
            .with_node(Node::subgraph_ref("enter", "nowhere"))
            .with_node(Node::terminal("done"))
            .with_edge(Edge::always("enter", "done"));
        assert_eq!(
            compile(&def).unwrap_err(),
            CompileError::Reference {
                element: "enter".into(),
                missing: "nowhere".into(),
            }
        );
    }

    #[test]
    fn recursive_subgraph_needs_reentrant_node() {
        let inner = FlowDefinition::default()
            .with_node(Node::subgraph_ref("again", "loop"))
            .with_edge(Edge::exit("again"));
        let def = FlowDefinition::new("lead")
            .with_node(Node::subgraph_ref("enter", "loop"))
            .with_node(Node::terminal("done"))
            .with_edge(Edge::always("enter", "done"))
            .with_subgraph("loop", inner.clone());
        assert!(matches!(
            compile(&def),
            Err(CompileError::Cycle { node, .. }) if node == "loop/again"
        ));

        let mut allowed = inner;
        allowed.nodes[0].reentrant = true;
        let def = FlowDefinition::new("lead")
            .with_node(Node::subgraph_ref("enter", "loop"))
            .with_node(Node::terminal("done"))
            .with_edge(Edge::always("enter", "done"))
            .with_subgraph("loop", allowed);
        assert!(compile(&def).is_ok());
    }

    #[test]
    fn compile_json_reports_schema_errors() {
        let err = Compiler::new()
            .compile_json(r#"{"id": "x", "nodes": [{"id": "a"}]}"#)
            .unwrap_err();
        assert!(matches!(err, CompileError::Schema { .. }));

        let graph = Compiler::new()
            .compile_json(
                r#"{"id": "x", "nodes": [{"id": "a", "type": "terminal"}], "edges": []}"#,
            )
            .unwrap();
        assert_eq!(graph.id().as_str(), "x");
    }
}
