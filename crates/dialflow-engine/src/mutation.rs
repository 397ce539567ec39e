//! Atomic, versioned edits to published flows.
//!
//! Edits run against a working copy. The copy is published as the next
//! version only if every edit applies and the result compiles; otherwise
//! nothing is written and the stored version stays byte-identical.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use dialflow_core::error::{DialflowError, MutationError};
use dialflow_core::event::{EventBus, FlowEvent};
use dialflow_core::flow::{Edge, FlowDefinition, Node, ScopeId, VersionMeta};
use dialflow_core::traits::{FlowStore, PublishOutcome};
use dialflow_core::types::{FlowId, NodeId, TenantId, Version};
use dialflow_graph::{merge_with, Compiler, FlowLayer, MergeConflict, NodePatch};

/// One edit in a batch. `scope` addresses a subgraph; omitted means root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BatchEdit {
    AddNode {
        #[serde(default, skip_serializing_if = "ScopeId::is_root")]
        scope: ScopeId,
        node: Node,
    },
    RemoveNode {
        #[serde(default, skip_serializing_if = "ScopeId::is_root")]
        scope: ScopeId,
        id: NodeId,
    },
    UpdateNode {
        #[serde(default, skip_serializing_if = "ScopeId::is_root")]
        scope: ScopeId,
        patch: NodePatch,
    },
    AddEdge {
        #[serde(default, skip_serializing_if = "ScopeId::is_root")]
        scope: ScopeId,
        edge: Edge,
    },
    RemoveEdge {
        #[serde(default, skip_serializing_if = "ScopeId::is_root")]
        scope: ScopeId,
        from: NodeId,
        to: NodeId,
    },
    SetEntry {
        #[serde(default, skip_serializing_if = "ScopeId::is_root")]
        scope: ScopeId,
        node: NodeId,
    },
}

impl BatchEdit {
    pub fn add_node(node: Node) -> Self {
        BatchEdit::AddNode {
            scope: ScopeId::root(),
            node,
        }
    }

    pub fn remove_node(id: impl Into<NodeId>) -> Self {
        BatchEdit::RemoveNode {
            scope: ScopeId::root(),
            id: id.into(),
        }
    }

    pub fn update_node(patch: NodePatch) -> Self {
        BatchEdit::UpdateNode {
            scope: ScopeId::root(),
            patch,
        }
    }

    pub fn add_edge(edge: Edge) -> Self {
        BatchEdit::AddEdge {
            scope: ScopeId::root(),
            edge,
        }
    }

    pub fn remove_edge(from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        BatchEdit::RemoveEdge {
            scope: ScopeId::root(),
            from: from.into(),
            to: to.into(),
        }
    }

    /// Move this edit into a subgraph.
    pub fn in_scope(mut self, target: impl Into<ScopeId>) -> Self {
        let target = target.into();
        match &mut self {
            BatchEdit::AddNode { scope, .. }
            | BatchEdit::RemoveNode { scope, .. }
            | BatchEdit::UpdateNode { scope, .. }
            | BatchEdit::AddEdge { scope, .. }
            | BatchEdit::RemoveEdge { scope, .. }
            | BatchEdit::SetEntry { scope, .. } => *scope = target,
        }
        self
    }

    fn scope(&self) -> &ScopeId {
        match self {
            BatchEdit::AddNode { scope, .. }
            | BatchEdit::RemoveNode { scope, .. }
            | BatchEdit::UpdateNode { scope, .. }
            | BatchEdit::AddEdge { scope, .. }
            | BatchEdit::RemoveEdge { scope, .. }
            | BatchEdit::SetEntry { scope, .. } => scope,
        }
    }

    /// Short human-readable summary.
    pub fn describe(&self) -> String {
        let summary = match self {
            BatchEdit::AddNode { node, .. } => format!("add {} node '{}'", node.kind, node.id),
            BatchEdit::RemoveNode { id, .. } => format!("remove node '{}'", id),
            BatchEdit::UpdateNode { patch, .. } => format!("update node '{}'", patch.id),
            BatchEdit::AddEdge { edge, .. } => format!("add edge {} -> {}", edge.from, edge.to),
            BatchEdit::RemoveEdge { from, to, .. } => format!("remove edge {} -> {}", from, to),
            BatchEdit::SetEntry { node, .. } => format!("set entry to '{}'", node),
        };
        let scope = self.scope();
        if scope.is_root() {
            summary
        } else {
            format!("{} in {}", summary, scope)
        }
    }
}

/// Apply edits, in order, to a copy of `base`. The base is never touched.
pub fn apply_edits(
    base: &FlowDefinition,
    edits: &[BatchEdit],
) -> Result<FlowDefinition, MutationError> {
    let mut working = base.clone();
    for (index, edit) in edits.iter().enumerate() {
        let scope = working
            .scope_mut(edit.scope())
            .ok_or_else(|| MutationError::UnknownScope {
                index,
                scope: edit.scope().to_string(),
            })?;
        apply_edit(scope, index, edit)?;
    }
    Ok(working)
}

fn apply_edit(
    graph: &mut FlowDefinition,
    index: usize,
    edit: &BatchEdit,
) -> Result<(), MutationError> {
    let unknown = |node: &NodeId| MutationError::UnknownNode {
        index,
        node: node.to_string(),
    };

    match edit {
        BatchEdit::AddNode { node, .. } => {
            if graph.node(node.id.as_str()).is_some() {
                return Err(MutationError::DuplicateNode {
                    index,
                    node: node.id.to_string(),
                });
            }
            graph.nodes.push(node.clone());
        }
        BatchEdit::RemoveNode { id, .. } => {
            if graph.node(id.as_str()).is_none() {
                return Err(unknown(id));
            }
            if let Some(edge) = graph.edges.iter().find(|e| &e.from == id || &e.to == id) {
                return Err(MutationError::DanglingReference {
                    index,
                    node: id.to_string(),
                    from: edge.from.to_string(),
                    to: edge.to.to_string(),
                });
            }
            if graph.entry.as_ref() == Some(id) {
                return Err(MutationError::InvalidEdit {
                    index,
                    detail: format!("'{}' is the entry node", id),
                });
            }
            graph.nodes.retain(|n| &n.id != id);
        }
        BatchEdit::UpdateNode { patch, .. } => {
            if patch.remove {
                return Err(MutationError::InvalidEdit {
                    index,
                    detail: "use remove_node to delete a node".into(),
                });
            }
            let node = graph
                .node_mut(patch.id.as_str())
                .ok_or_else(|| unknown(&patch.id))?;
            patch
                .apply_to(node)
                .map_err(|detail| MutationError::InvalidEdit { index, detail })?;
        }
        BatchEdit::AddEdge { edge, .. } => {
            if graph.node(edge.from.as_str()).is_none() {
                return Err(unknown(&edge.from));
            }
            if !edge.targets_exit() && graph.node(edge.to.as_str()).is_none() {
                return Err(unknown(&edge.to));
            }
            let key = edge.key();
            if graph.edges.iter().any(|e| e.key() == key) {
                return Err(MutationError::InvalidEdit {
                    index,
                    detail: format!("edge {} already exists", key),
                });
            }
            graph.edges.push(edge.clone());
        }
        BatchEdit::RemoveEdge { from, to, .. } => {
            let before = graph.edges.len();
            graph.edges.retain(|e| !(&e.from == from && &e.to == to));
            if graph.edges.len() == before {
                return Err(MutationError::UnknownEdge {
                    index,
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
        }
        BatchEdit::SetEntry { node, .. } => {
            if graph.node(node.as_str()).is_none() {
                return Err(unknown(node));
            }
            graph.entry = Some(node.clone());
        }
    }
    Ok(())
}

/// Batch edit request from an authoring client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub tenant: TenantId,
    pub flow: FlowId,
    /// Version the edits were computed against.
    pub base_version: Version,
    pub edits: Vec<BatchEdit>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
}

/// External response shape for a batch edit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_version: Option<Version>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<MergeConflict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MutationResponse {
    pub fn from_result(result: &Result<FlowDefinition, MutationError>) -> Self {
        match result {
            Ok(definition) => Self::published(definition.version, vec![]),
            Err(e) => Self {
                success: false,
                new_version: None,
                conflicts: vec![],
                error: Some(e.to_string()),
            },
        }
    }

    fn published(version: Version, conflicts: Vec<MergeConflict>) -> Self {
        Self {
            success: true,
            new_version: Some(version),
            conflicts,
            error: None,
        }
    }
}

fn store_err(e: DialflowError) -> MutationError {
    match e {
        DialflowError::Timeout(what) => MutationError::Timeout(what),
        other => MutationError::Store(other.to_string()),
    }
}

/// Publishes new flow versions through compare-and-swap on the store.
pub struct MutationService {
    store: Arc<dyn FlowStore>,
    compiler: Compiler,
    event_bus: Arc<EventBus>,
}

impl MutationService {
    pub fn new(store: Arc<dyn FlowStore>, event_bus: Arc<EventBus>) -> Self {
        Self {
            store,
            compiler: Compiler::new(),
            event_bus,
        }
    }

    /// Use custom predicate/validator registries.
    pub fn with_compiler(mut self, compiler: Compiler) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    /// Publish the first version of a new flow.
    pub fn create(
        &self,
        tenant: &TenantId,
        definition: FlowDefinition,
        author: Option<String>,
    ) -> Result<FlowDefinition, MutationError> {
        let flow = definition.id.clone();
        let result = self.publish_next(
            tenant,
            definition,
            None,
            "initial version".into(),
            author,
        );
        self.report(tenant, &flow, Version::default(), result)
    }

    /// Apply a batch of edits atomically and publish the next version.
    pub fn apply(&self, request: &MutationRequest) -> Result<FlowDefinition, MutationError> {
        let result = self.try_apply(request);
        self.report(&request.tenant, &request.flow, request.base_version, result)
    }

    /// [`apply`](Self::apply), shaped for the authoring client.
    pub fn respond(&self, request: &MutationRequest) -> MutationResponse {
        MutationResponse::from_result(&self.apply(request))
    }

    /// Republish an earlier version's content as a new version.
    pub fn rollback(
        &self,
        tenant: &TenantId,
        flow: &FlowId,
        to: Version,
        author: Option<String>,
    ) -> Result<FlowDefinition, MutationError> {
        let result = self.try_rollback(tenant, flow, to, author);
        let base = result
            .as_ref()
            .ok()
            .and_then(|d| d.meta.as_ref())
            .and_then(|m| m.predecessor)
            .unwrap_or_default();
        self.report(tenant, flow, base, result)
    }

    /// Merge layers and publish the result as the next version of its flow.
    pub fn publish_layers(
        &self,
        tenant: &TenantId,
        layers: &[FlowLayer],
        base_version: Option<Version>,
        author: Option<String>,
    ) -> Result<(FlowDefinition, Vec<MergeConflict>), MutationError> {
        let outcome = merge_with(&self.compiler, layers)?;
        let flow = outcome.definition.id.clone();
        let description = format!(
            "merge of {} layer(s), {} conflict(s)",
            layers.len(),
            outcome.conflicts.len()
        );
        let result = self.publish_next(tenant, outcome.definition, base_version, description, author);
        let published = self.report(tenant, &flow, base_version.unwrap_or_default(), result)?;
        Ok((published, outcome.conflicts))
    }

    /// [`publish_layers`](Self::publish_layers), shaped for the authoring client.
    pub fn respond_layers(
        &self,
        tenant: &TenantId,
        layers: &[FlowLayer],
        base_version: Option<Version>,
        author: Option<String>,
    ) -> MutationResponse {
        match self.publish_layers(tenant, layers, base_version, author) {
            Ok((definition, conflicts)) => MutationResponse::published(definition.version, conflicts),
            Err(e) => MutationResponse::from_result(&Err(e)),
        }
    }

    pub fn history(&self, tenant: &TenantId, flow: &FlowId) -> Result<Vec<VersionMeta>, MutationError> {
        self.store.history(tenant, flow).map_err(store_err)
    }

    fn try_apply(&self, request: &MutationRequest) -> Result<FlowDefinition, MutationError> {
        let current = self
            .store
            .latest(&request.tenant, &request.flow)
            .map_err(store_err)?
            .ok_or_else(|| MutationError::UnknownFlow(request.flow.to_string()))?;
        if current.version != request.base_version {
            return Err(MutationError::StaleVersion {
                base: request.base_version,
                current: current.version,
            });
        }

        let next = apply_edits(&current, &request.edits)?;
        let description = request.description.clone().unwrap_or_else(|| {
            request
                .edits
                .iter()
                .map(BatchEdit::describe)
                .collect::<Vec<_>>()
                .join("; ")
        });
        self.publish_next(
            &request.tenant,
            next,
            Some(current.version),
            description,
            request.author.clone(),
        )
    }

    fn try_rollback(
        &self,
        tenant: &TenantId,
        flow: &FlowId,
        to: Version,
        author: Option<String>,
    ) -> Result<FlowDefinition, MutationError> {
        let current = self
            .store
            .latest(tenant, flow)
            .map_err(store_err)?
            .ok_or_else(|| MutationError::UnknownFlow(flow.to_string()))?;
        let target = self
            .store
            .load(tenant, flow, to)
            .map_err(store_err)?
            .ok_or_else(|| MutationError::UnknownFlow(format!("{} v{}", flow, to)))?;
        self.publish_next(
            tenant,
            target,
            Some(current.version),
            format!("rollback to v{}", to),
            author,
        )
    }

    /// Compile, stamp and CAS-publish `definition` as the successor of `base`.
    fn publish_next(
        &self,
        tenant: &TenantId,
        mut definition: FlowDefinition,
        base: Option<Version>,
        description: String,
        author: Option<String>,
    ) -> Result<FlowDefinition, MutationError> {
        self.compiler.compile(&definition)?;

        let version = base.map(Version::next).unwrap_or_else(Version::initial);
        definition.version = version;
        definition.meta = Some(VersionMeta {
            version,
            predecessor: base,
            description,
            author,
            change_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
        });

        match self
            .store
            .publish(tenant, &definition, base)
            .map_err(store_err)?
        {
            PublishOutcome::Published => Ok(definition),
            PublishOutcome::Stale { current } => Err(MutationError::StaleVersion {
                base: base.unwrap_or_default(),
                current,
            }),
        }
    }

    fn report(
        &self,
        tenant: &TenantId,
        flow: &FlowId,
        base_version: Version,
        result: Result<FlowDefinition, MutationError>,
    ) -> Result<FlowDefinition, MutationError> {
        match &result {
            Ok(definition) => {
                let description = definition
                    .meta
                    .as_ref()
                    .map(|m| m.description.clone())
                    .unwrap_or_default();
                info!(
                    tenant = %tenant,
                    flow = %flow,
                    version = %definition.version,
                    description = %description,
                    "Flow version published"
                );
                self.event_bus.publish(FlowEvent::VersionPublished {
                    tenant: tenant.clone(),
                    flow: flow.clone(),
                    version: definition.version,
                    description,
                });
            }
            Err(e) => {
                warn!(
                    tenant = %tenant,
                    flow = %flow,
                    base_version = %base_version,
                    error = %e,
                    "Mutation rejected"
                );
                self.event_bus.publish(FlowEvent::MutationRejected {
                    tenant: tenant.clone(),
                    flow: flow.clone(),
                    base_version,
                    error: e.to_string(),
                });
            }
        }
        result
    }
}
