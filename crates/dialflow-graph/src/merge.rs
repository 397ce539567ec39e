//! Layered flow configuration.
//!
//! Layers are partial flows applied from the lowest tier (global) to the
//! highest (instance). Merging is a pure function of the ordered layers: no
//! state survives between calls and ties never depend on iteration order.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use dialflow_core::error::CompileError;
use dialflow_core::flow::{Edge, FlowDefinition, Node, NodeKind};
use dialflow_core::types::{AnswerKey, FlowId, NodeId, PathId, Version};

use crate::compiler::{CompiledGraph, Compiler};

/// Precedence tier of a layer, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerTier {
    Global,
    Category,
    Tenant,
    Instance,
}

impl std::fmt::Display for LayerTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LayerTier::Global => "global",
            LayerTier::Category => "category",
            LayerTier::Tenant => "tenant",
            LayerTier::Instance => "instance",
        };
        f.write_str(s)
    }
}

/// Fields whose values accumulate across layers instead of overriding.
const LIST_FIELDS: &[&str] = &["depends_on", "extra_guards"];

/// Partial node. Unset fields leave the lower layer's value alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePatch {
    pub id: NodeId,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<NodeKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<AnswerKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<AnswerKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_guards: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subgraph: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<PathId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reentrant: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<Map<String, Value>>,
    /// Drop the node (and its edges) from the effective graph.
    #[serde(default, skip_serializing)]
    pub remove: bool,
}

impl NodePatch {
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn kind(mut self, kind: NodeKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn guard(mut self, guard: impl Into<String>) -> Self {
        self.guard = Some(guard.into());
        self
    }

    pub fn extra_guard(mut self, guard: impl Into<String>) -> Self {
        self.extra_guards.push(guard.into());
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn removed(mut self) -> Self {
        self.remove = true;
        self
    }

    /// Whether the patch changes anything besides the id.
    pub fn is_empty(&self) -> bool {
        patch_fields(self).map(|m| m.is_empty()).unwrap_or(true)
    }

    /// Apply this patch to an existing node with merge semantics: scalar
    /// fields override, list fields append, `ui` deep-merges. The node id is
    /// never changed.
    pub fn apply_to(&self, node: &mut Node) -> Result<(), String> {
        let mut target = match serde_json::to_value(&*node).map_err(|e| e.to_string())? {
            Value::Object(map) => map,
            _ => return Err("node did not serialize to an object".into()),
        };
        let fields = patch_fields(self).map_err(|e| e.to_string())?;
        let mut origins = HashMap::new();
        let mut ignored = Vec::new();
        merge_fields(
            node.id.as_str(),
            &mut target,
            &mut origins,
            fields,
            "patch",
            &mut ignored,
        );
        *node = serde_json::from_value(Value::Object(target)).map_err(|e| e.to_string())?;
        Ok(())
    }
}

impl From<&Node> for NodePatch {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id.clone(),
            kind: Some(node.kind),
            key: node.key.clone(),
            prompt: node.prompt.clone(),
            guard: node.guard.clone(),
            when: node.when.clone(),
            depends_on: node.depends_on.clone(),
            extra_guards: node.extra_guards.clone(),
            validator: node.validator.clone(),
            subgraph: node.subgraph.clone(),
            paths: (!node.paths.is_empty()).then(|| node.paths.clone()),
            reentrant: node.reentrant.then_some(true),
            priority: node.priority,
            ui: node.ui.clone(),
            remove: false,
        }
    }
}

/// Partial edge, keyed by `id` or `from->to`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub from: NodeId,
    pub to: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_invalid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reentrant: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing)]
    pub remove: bool,
}

impl EdgePatch {
    pub fn new(from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            ..Default::default()
        }
    }

    pub fn guard(mut self, guard: impl Into<String>) -> Self {
        self.guard = Some(guard.into());
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn removed(mut self) -> Self {
        self.remove = true;
        self
    }

    pub fn key(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{}->{}", self.from, self.to))
    }
}

impl From<&Edge> for EdgePatch {
    fn from(edge: &Edge) -> Self {
        Self {
            id: edge.id.clone(),
            from: edge.from.clone(),
            to: edge.to.clone(),
            guard: edge.guard.clone(),
            on_invalid: edge.on_invalid.then_some(true),
            reentrant: edge.reentrant.then_some(true),
            priority: edge.priority,
            remove: false,
        }
    }
}

/// The graph part of a layer. Subgraph overlays nest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerGraph {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<NodeId>,
    #[serde(default)]
    pub nodes: Vec<NodePatch>,
    #[serde(default)]
    pub edges: Vec<EdgePatch>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subgraphs: BTreeMap<String, LayerGraph>,
}

impl From<&FlowDefinition> for LayerGraph {
    fn from(def: &FlowDefinition) -> Self {
        Self {
            entry: def.entry.clone(),
            nodes: def.nodes.iter().map(NodePatch::from).collect(),
            edges: def.edges.iter().map(EdgePatch::from).collect(),
            subgraphs: def
                .subgraphs
                .iter()
                .map(|(name, sub)| (name.clone(), LayerGraph::from(sub)))
                .collect(),
        }
    }
}

/// One overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowLayer {
    pub tier: LayerTier,
    /// Name used in conflict reports. Defaults to the tier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<FlowId>,
    #[serde(flatten)]
    pub graph: LayerGraph,
}

impl FlowLayer {
    pub fn new(tier: LayerTier) -> Self {
        Self {
            tier,
            label: None,
            id: None,
            graph: LayerGraph::default(),
        }
    }

    /// A layer carrying a complete flow.
    pub fn from_definition(tier: LayerTier, def: &FlowDefinition) -> Self {
        Self {
            tier,
            label: None,
            id: Some(def.id.clone()),
            graph: LayerGraph::from(def),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<FlowId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_entry(mut self, entry: impl Into<NodeId>) -> Self {
        self.graph.entry = Some(entry.into());
        self
    }

    pub fn with_node(mut self, patch: NodePatch) -> Self {
        self.graph.nodes.push(patch);
        self
    }

    pub fn with_edge(mut self, patch: EdgePatch) -> Self {
        self.graph.edges.push(patch);
        self
    }

    pub fn with_subgraph(mut self, name: impl Into<String>, graph: LayerGraph) -> Self {
        self.graph.subgraphs.insert(name.into(), graph);
        self
    }

    pub fn name(&self) -> String {
        self.label.clone().unwrap_or_else(|| self.tier.to_string())
    }
}

/// Two layers disagreed on a field. Informational; the higher layer wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConflict {
    /// Node id, edge key, or `flow`, qualified by subgraph.
    pub element: String,
    pub field: String,
    pub layer_a: String,
    pub value_a: Value,
    pub layer_b: String,
    pub value_b: Value,
    pub resolution: String,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub definition: FlowDefinition,
    pub graph: CompiledGraph,
    pub conflicts: Vec<MergeConflict>,
}

/// Merge layers and compile the result with the built-in registries.
pub fn merge(layers: &[FlowLayer]) -> Result<MergeOutcome, CompileError> {
    merge_with(&Compiler::new(), layers)
}

/// Merge layers and compile the result with `compiler`.
pub fn merge_with(compiler: &Compiler, layers: &[FlowLayer]) -> Result<MergeOutcome, CompileError> {
    let mut ordered: Vec<&FlowLayer> = layers.iter().collect();
    // Stable: layers of the same tier keep their given order.
    ordered.sort_by_key(|l| l.tier);

    let mut conflicts = Vec::new();
    let id = ordered
        .iter()
        .rev()
        .find_map(|l| l.id.clone())
        .unwrap_or_default();

    let named: Vec<(String, &LayerGraph)> = ordered.iter().map(|l| (l.name(), &l.graph)).collect();
    let mut definition = merge_graph("", &named, &mut conflicts)?;
    definition.id = id;
    definition.version = Version::initial();

    let graph = compiler.compile(&definition)?;
    debug!(
        flow = %definition.id,
        layers = layers.len(),
        conflicts = conflicts.len(),
        "Layers merged"
    );
    Ok(MergeOutcome {
        definition,
        graph,
        conflicts,
    })
}

struct Pending {
    fields: Map<String, Value>,
    origins: HashMap<String, String>,
}

fn merge_graph(
    prefix: &str,
    layers: &[(String, &LayerGraph)],
    conflicts: &mut Vec<MergeConflict>,
) -> Result<FlowDefinition, CompileError> {
    let flow_element = if prefix.is_empty() {
        "flow".to_string()
    } else {
        prefix.trim_end_matches('/').to_string()
    };

    let mut entry: Option<(String, NodeId)> = None;
    let mut first_declared: Vec<NodeId> = Vec::new();
    let mut nodes: BTreeMap<NodeId, Pending> = BTreeMap::new();
    let mut removed_nodes: BTreeSet<NodeId> = BTreeSet::new();
    let mut edge_order: Vec<String> = Vec::new();
    let mut edges: HashMap<String, Pending> = HashMap::new();

    for (layer, graph) in layers {
        if let Some(new_entry) = &graph.entry {
            if let Some((prev_layer, prev)) = &entry {
                if prev != new_entry {
                    conflicts.push(MergeConflict {
                        element: flow_element.clone(),
                        field: "entry".into(),
                        layer_a: prev_layer.clone(),
                        value_a: Value::String(prev.to_string()),
                        layer_b: layer.clone(),
                        value_b: Value::String(new_entry.to_string()),
                        resolution: format!("{} wins", layer),
                    });
                }
            }
            entry = Some((layer.clone(), new_entry.clone()));
        }

        for patch in &graph.nodes {
            let element = format!("{}{}", prefix, patch.id);
            if patch.remove {
                nodes.remove(&patch.id);
                removed_nodes.insert(patch.id.clone());
                continue;
            }
            removed_nodes.remove(&patch.id);
            if !first_declared.contains(&patch.id) {
                first_declared.push(patch.id.clone());
            }
            let fields = patch_fields(patch).map_err(|e| schema(&element, e.to_string()))?;
            let pending = nodes.entry(patch.id.clone()).or_insert_with(|| Pending {
                fields: Map::new(),
                origins: HashMap::new(),
            });
            merge_fields(
                &element,
                &mut pending.fields,
                &mut pending.origins,
                fields,
                layer,
                conflicts,
            );
        }

        for patch in &graph.edges {
            let key = patch.key();
            if patch.remove {
                edges.remove(&key);
                edge_order.retain(|k| k != &key);
                continue;
            }
            let element = format!("{}{}", prefix, key);
            let mut fields = match serde_json::to_value(patch) {
                Ok(Value::Object(map)) => map,
                Ok(_) => return Err(schema(&element, "edge did not serialize to an object")),
                Err(e) => return Err(schema(&element, e.to_string())),
            };
            fields.remove("id");
            let pending = edges.entry(key.clone()).or_insert_with(|| {
                edge_order.push(key.clone());
                Pending {
                    fields: Map::new(),
                    origins: HashMap::new(),
                }
            });
            if let Some(id) = &patch.id {
                pending.fields.insert("id".into(), Value::String(id.clone()));
            }
            merge_fields(
                &element,
                &mut pending.fields,
                &mut pending.origins,
                fields,
                layer,
                conflicts,
            );
        }
    }

    let mut merged_nodes = Vec::with_capacity(nodes.len());
    for (id, mut pending) in nodes {
        pending
            .fields
            .insert("id".into(), Value::String(id.to_string()));
        let element = format!("{}{}", prefix, id);
        if !pending.fields.contains_key("type") {
            return Err(schema(&element, "no layer declares the node type"));
        }
        let node: Node = serde_json::from_value(Value::Object(pending.fields))
            .map_err(|e| schema(&element, e.to_string()))?;
        merged_nodes.push(node);
    }
    // BTreeMap iteration already gives id order; the stable sort keeps it for ties.
    merged_nodes.sort_by_key(|n| std::cmp::Reverse(n.priority.unwrap_or(0)));

    let mut merged_edges = Vec::with_capacity(edge_order.len());
    for key in &edge_order {
        let Some(pending) = edges.remove(key) else {
            continue;
        };
        let element = format!("{}{}", prefix, key);
        let edge: Edge = serde_json::from_value(Value::Object(pending.fields))
            .map_err(|e| schema(&element, e.to_string()))?;
        if removed_nodes.contains(&edge.from) || removed_nodes.contains(&edge.to) {
            continue;
        }
        merged_edges.push(edge);
    }
    merged_edges.sort_by_key(|e| std::cmp::Reverse(e.priority.unwrap_or(0)));

    // Node order is by priority, so pin the entry to what the layers declared.
    let entry = entry
        .map(|(_, id)| id)
        .or_else(|| {
            first_declared
                .iter()
                .find(|id| merged_nodes.iter().any(|n| &n.id == *id))
                .cloned()
        });

    let mut names: BTreeSet<&String> = BTreeSet::new();
    for (_, graph) in layers {
        names.extend(graph.subgraphs.keys());
    }
    let mut subgraphs = BTreeMap::new();
    for name in names {
        let sub_layers: Vec<(String, &LayerGraph)> = layers
            .iter()
            .filter_map(|(layer, graph)| graph.subgraphs.get(name).map(|g| (layer.clone(), g)))
            .collect();
        let sub_prefix = format!("{}{}/", prefix, name);
        subgraphs.insert(name.clone(), merge_graph(&sub_prefix, &sub_layers, conflicts)?);
    }

    Ok(FlowDefinition {
        id: FlowId::default(),
        version: Version::initial(),
        entry,
        nodes: merged_nodes,
        edges: merged_edges,
        subgraphs,
        meta: None,
    })
}

fn schema(element: &str, detail: impl Into<String>) -> CompileError {
    CompileError::Schema {
        element: element.to_string(),
        detail: detail.into(),
    }
}

/// The fields a node patch sets, without its id.
fn patch_fields(patch: &NodePatch) -> Result<Map<String, Value>, serde_json::Error> {
    let mut map = match serde_json::to_value(patch)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    map.remove("id");
    Ok(map)
}

/// Null, false, zero, and empty strings/lists/objects.
fn is_default(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

fn merge_fields(
    element: &str,
    target: &mut Map<String, Value>,
    origins: &mut HashMap<String, String>,
    patch: Map<String, Value>,
    layer: &str,
    conflicts: &mut Vec<MergeConflict>,
) {
    for (field, value) in patch {
        if LIST_FIELDS.contains(&field.as_str()) {
            let Value::Array(items) = value else {
                continue;
            };
            let slot = target
                .entry(field.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(existing) = slot {
                for item in items {
                    if !existing.contains(&item) {
                        existing.push(item);
                    }
                }
            }
            continue;
        }

        if field == "ui" {
            if let (Some(Value::Object(existing)), Value::Object(incoming)) =
                (target.get_mut("ui"), &value)
            {
                merge_objects(element, "ui", existing, origins, incoming, layer, conflicts);
                continue;
            }
        }

        override_field(element, &field, target, origins, value, layer, conflicts);
    }
}

fn merge_objects(
    element: &str,
    path: &str,
    existing: &mut Map<String, Value>,
    origins: &mut HashMap<String, String>,
    incoming: &Map<String, Value>,
    layer: &str,
    conflicts: &mut Vec<MergeConflict>,
) {
    for (key, value) in incoming {
        let field = format!("{}.{}", path, key);
        if let (Some(Value::Object(inner)), Value::Object(inner_incoming)) =
            (existing.get_mut(key), value)
        {
            merge_objects(element, &field, inner, origins, inner_incoming, layer, conflicts);
            continue;
        }
        let previous = existing.insert(key.clone(), value.clone());
        record_override(element, &field, previous, value, origins, layer, conflicts);
    }
}

fn override_field(
    element: &str,
    field: &str,
    target: &mut Map<String, Value>,
    origins: &mut HashMap<String, String>,
    value: Value,
    layer: &str,
    conflicts: &mut Vec<MergeConflict>,
) {
    let previous = target.insert(field.to_string(), value.clone());
    record_override(element, field, previous, &value, origins, layer, conflicts);
}

/// Layer that last set `field` or, for nested `ui` keys, its closest parent.
fn origin_of(origins: &HashMap<String, String>, field: &str) -> Option<String> {
    let mut path = field;
    loop {
        if let Some(layer) = origins.get(path) {
            return Some(layer.clone());
        }
        path = path.rsplit_once('.')?.0;
    }
}

fn record_override(
    element: &str,
    field: &str,
    previous: Option<Value>,
    value: &Value,
    origins: &mut HashMap<String, String>,
    layer: &str,
    conflicts: &mut Vec<MergeConflict>,
) {
    let prior_layer = origin_of(origins, field);
    origins.insert(field.to_string(), layer.to_string());
    let Some(previous) = previous else {
        return;
    };
    if is_default(&previous) || &previous == value {
        return;
    }
    let layer_a = prior_layer.unwrap_or_else(|| "base".to_string());
    conflicts.push(MergeConflict {
        element: element.to_string(),
        field: field.to_string(),
        layer_a,
        value_a: previous,
        layer_b: layer.to_string(),
        value_b: value.clone(),
        resolution: format!("{} wins", layer),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> FlowLayer {
        FlowLayer::new(LayerTier::Global)
            .with_id("lead")
            .with_node(
                NodePatch::new("ask")
                    .kind(NodeKind::Question)
                    .prompt("What's your budget?")
                    .priority(5),
            )
            .with_node(NodePatch::new("done").kind(NodeKind::Terminal))
            .with_edge(EdgePatch::new("ask", "done"))
    }

    fn with_key(mut layer: FlowLayer) -> FlowLayer {
        layer.graph.nodes[0].key = Some("budget".into());
        layer
    }

    #[test]
    fn higher_layer_wins_with_conflict() {
        let tenant = FlowLayer::new(LayerTier::Tenant).with_node(NodePatch::new("ask").priority(9));
        let outcome = merge(&[with_key(base()), tenant]).unwrap();
        let ask = outcome.definition.node("ask").unwrap();
        assert_eq!(ask.priority, Some(9));
        assert_eq!(
            outcome.conflicts,
            vec![MergeConflict {
                element: "ask".into(),
                field: "priority".into(),
                layer_a: "global".into(),
                value_a: json!(5),
                layer_b: "tenant".into(),
                value_b: json!(9),
                resolution: "tenant wins".into(),
            }]
        );
    }

    #[test]
    fn identical_layers_produce_no_conflicts() {
        let outcome = merge(&[with_key(base()), with_key(base())]).unwrap();
        assert!(outcome.conflicts.is_empty());
        assert_eq!(outcome.definition.nodes.len(), 2);
        assert_eq!(outcome.definition.edges.len(), 1);
    }

    #[test]
    fn layer_order_is_by_tier_not_input_position() {
        let tenant = FlowLayer::new(LayerTier::Tenant).with_node(NodePatch::new("ask").priority(9));
        let outcome = merge(&[tenant, with_key(base())]).unwrap();
        assert_eq!(outcome.definition.node("ask").unwrap().priority, Some(9));
    }

    #[test]
    fn overriding_a_default_is_not_a_conflict() {
        let category = FlowLayer::new(LayerTier::Category)
            .with_node(NodePatch::new("done").prompt("Thanks!"));
        let outcome = merge(&[with_key(base()), category]).unwrap();
        assert!(outcome.conflicts.is_empty());
        assert_eq!(
            outcome.definition.node("done").unwrap().prompt.as_deref(),
            Some("Thanks!")
        );
    }

    #[test]
    fn list_fields_append_and_dedupe() {
        let tenant = FlowLayer::new(LayerTier::Tenant)
            .with_node(NodePatch::new("ask").extra_guard("ctx.channel != 'sms'"));
        let instance = FlowLayer::new(LayerTier::Instance)
            .with_node(NodePatch::new("ask").extra_guard("ctx.channel != 'sms'"));
        let mut global = with_key(base());
        global.graph.nodes[0].extra_guards = vec!["ctx.region present".into()];
        let outcome = merge(&[global, tenant, instance]).unwrap();
        assert_eq!(
            outcome.definition.node("ask").unwrap().extra_guards,
            vec!["ctx.region present".to_string(), "ctx.channel != 'sms'".to_string()]
        );
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn ui_metadata_deep_merges() {
        let mut global = with_key(base());
        global.graph.nodes[0].ui = Some(
            json!({"widget": "slider", "style": {"color": "blue", "size": 2}})
                .as_object()
                .cloned()
                .unwrap(),
        );
        let mut tenant = FlowLayer::new(LayerTier::Tenant).with_node(NodePatch::new("ask"));
        tenant.graph.nodes[0].ui = Some(json!({"style": {"color": "red"}}).as_object().cloned().unwrap());

        let outcome = merge(&[global, tenant]).unwrap();
        let ui = outcome.definition.node("ask").unwrap().ui.clone().unwrap();
        assert_eq!(
            Value::Object(ui),
            json!({"widget": "slider", "style": {"color": "red", "size": 2}})
        );
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].field, "ui.style.color");
        assert_eq!(outcome.conflicts[0].layer_a, "global");
    }

    #[test]
    fn nodes_order_by_priority_then_id_and_entry_is_kept() {
        let extra = FlowLayer::new(LayerTier::Tenant)
            .with_node(NodePatch::new("b_note").kind(NodeKind::Terminal).priority(7))
            .with_node(NodePatch::new("a_note").kind(NodeKind::Terminal).priority(7));
        let outcome = merge(&[with_key(base()), extra]).unwrap();
        let ids: Vec<&str> = outcome.definition.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a_note", "b_note", "ask", "done"]);
        assert_eq!(outcome.definition.entry.as_ref().unwrap().as_str(), "ask");
        assert_eq!(outcome.graph.root().entry().as_str(), "ask");
    }

    #[test]
    fn merge_is_deterministic() {
        let layers = vec![
            with_key(base()),
            FlowLayer::new(LayerTier::Instance)
                .with_node(NodePatch::new("ask").prompt("Budget, roughly?"))
                .with_node(NodePatch::new("z").kind(NodeKind::Terminal))
                .with_node(NodePatch::new("y").kind(NodeKind::Terminal)),
        ];
        let first = merge(&layers).unwrap();
        let second = merge(&layers).unwrap();
        assert_eq!(first.definition, second.definition);
        assert_eq!(first.conflicts, second.conflicts);
    }

    #[test]
    fn removing_a_node_drops_its_edges() {
        let tenant = FlowLayer::new(LayerTier::Tenant)
            .with_node(NodePatch::new("review").kind(NodeKind::Terminal))
            .with_edge(EdgePatch::new("ask", "review").guard("budget > 100"));
        let instance = FlowLayer::new(LayerTier::Instance).with_node(NodePatch::new("review").removed());
        let outcome = merge(&[with_key(base()), tenant, instance]).unwrap();
        assert!(outcome.definition.node("review").is_none());
        assert_eq!(outcome.definition.edges.len(), 1);
    }

    #[test]
    fn node_without_type_is_schema_error() {
        let tenant = FlowLayer::new(LayerTier::Tenant).with_node(NodePatch::new("ghost"));
        assert!(matches!(
            merge(&[with_key(base()), tenant]),
            Err(CompileError::Schema { element, .. }) if element == "ghost"
        ));
    }

    #[test]
    fn layers_parse_from_json() {
        let raw = r#"{
            "tier": "tenant",
            "label": "acme",
            "nodes": [{"id": "ask", "prompt": "How much can you spend?"}],
            "edges": [{"from": "ask", "to": "done", "guard": "budget > 10"}]
        }"#;
        let layer: FlowLayer = serde_json::from_str(raw).unwrap();
        assert_eq!(layer.tier, LayerTier::Tenant);
        assert_eq!(layer.name(), "acme");
        assert_eq!(layer.graph.nodes[0].prompt.as_deref(), Some("How much can you spend?"));
    }

    #[test]
    fn apply_to_updates_fields_in_place() {
        let mut node = Node::question("ask", "budget", "Budget?");
        let patch = NodePatch::new("ask").prompt("What's the budget?").extra_guard("name present");
        patch.apply_to(&mut node).unwrap();
        assert_eq!(node.prompt.as_deref(), Some("What's the budget?"));
        assert_eq!(node.extra_guards, vec!["name present".to_string()]);
        assert_eq!(node.key.as_ref().unwrap().as_str(), "budget");
        assert!(!NodePatch::new("ask").prompt("x").is_empty());
        assert!(NodePatch::new("ask").is_empty());
    }
}
