//! Conversation service: stores, graph cache and one lane per thread.
//!
//! Turns for one `(tenant, thread)` run strictly in arrival order on that
//! thread's lane. Different threads run in parallel. A snapshot is saved
//! only after a command succeeds. A lane that sits idle is retired and
//! respawned on the thread's next command.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use dialflow_core::config::EngineConfig;
use dialflow_core::error::{DialflowError, Result};
use dialflow_core::event::{EventBus, FlowEvent};
use dialflow_core::state::{ConversationSnapshot, ConversationStatus};
use dialflow_core::traits::{ConversationStore, FlowStore};
use dialflow_core::types::{ExtractionInput, FlowId, NodeId, PathId, TenantId, ThreadId, Version};
use dialflow_graph::{CompiledGraph, Compiler};

use crate::lane::{self, LaneCommand, LaneItem, LaneQueue, LaneReply};
use crate::traversal::{TraversalEngine, TurnOutcome};

type GraphKey = (TenantId, FlowId, Version);
type ThreadKey = (TenantId, ThreadId);
type Lanes = Arc<tokio::sync::Mutex<HashMap<ThreadKey, LaneQueue>>>;

struct Inner {
    flows: Arc<dyn FlowStore>,
    conversations: Arc<dyn ConversationStore>,
    engine: TraversalEngine,
    compiler: Compiler,
    graphs: Mutex<HashMap<GraphKey, Arc<CompiledGraph>>>,
    graph_cache: usize,
    event_bus: Arc<EventBus>,
}

pub struct ConversationService {
    inner: Arc<Inner>,
    lanes: Lanes,
    lane_buffer: usize,
    lane_idle: Duration,
}

impl ConversationService {
    pub fn new(
        config: &EngineConfig,
        flows: Arc<dyn FlowStore>,
        conversations: Arc<dyn ConversationStore>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self::with_compiler(config, flows, conversations, event_bus, Compiler::new())
    }

    /// Like `new`, with host-registered predicates and validators.
    pub fn with_compiler(
        config: &EngineConfig,
        flows: Arc<dyn FlowStore>,
        conversations: Arc<dyn ConversationStore>,
        event_bus: Arc<EventBus>,
        compiler: Compiler,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                flows,
                conversations,
                engine: TraversalEngine::new(config),
                compiler,
                graphs: Mutex::new(HashMap::new()),
                graph_cache: config.lanes.graph_cache,
                event_bus,
            }),
            lanes: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            lane_buffer: config.lanes.buffer,
            lane_idle: Duration::from_millis(config.lanes.idle_timeout_ms),
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.inner.event_bus
    }

    /// Open a conversation on the latest version of `flow`.
    pub async fn start(
        &self,
        tenant: &TenantId,
        flow: &FlowId,
        thread: &ThreadId,
        context: BTreeMap<String, Value>,
    ) -> Result<TurnOutcome> {
        let command = LaneCommand::Start {
            flow: flow.clone(),
            context,
        };
        self.outcome(tenant, thread, command).await
    }

    pub async fn submit_turn(
        &self,
        tenant: &TenantId,
        thread: &ThreadId,
        input: ExtractionInput,
    ) -> Result<TurnOutcome> {
        self.outcome(tenant, thread, LaneCommand::Turn(input)).await
    }

    pub async fn resume(
        &self,
        tenant: &TenantId,
        thread: &ThreadId,
        target: Option<NodeId>,
    ) -> Result<TurnOutcome> {
        self.outcome(tenant, thread, LaneCommand::Resume(target)).await
    }

    pub async fn override_path(
        &self,
        tenant: &TenantId,
        thread: &ThreadId,
        path: PathId,
    ) -> Result<TurnOutcome> {
        self.outcome(tenant, thread, LaneCommand::OverridePath(path))
            .await
    }

    /// Move a conversation to `version`, or to the latest version.
    pub async fn repin(
        &self,
        tenant: &TenantId,
        thread: &ThreadId,
        version: Option<Version>,
    ) -> Result<TurnOutcome> {
        self.outcome(tenant, thread, LaneCommand::Repin(version)).await
    }

    /// Current persisted state of a conversation.
    pub fn snapshot(&self, tenant: &TenantId, thread: &ThreadId) -> Result<Option<ConversationSnapshot>> {
        self.inner.conversations.load(tenant, thread)
    }

    /// Threads that currently have a live lane.
    pub async fn active_lanes(&self) -> usize {
        self.lanes.lock().await.len()
    }

    /// Delete a conversation once queued turns have run. Returns whether
    /// anything was stored.
    pub async fn close(&self, tenant: &TenantId, thread: &ThreadId) -> Result<bool> {
        let reply = self.dispatch(tenant, thread, LaneCommand::Close).await;
        self.lanes
            .lock()
            .await
            .remove(&(tenant.clone(), thread.clone()));
        match reply? {
            LaneReply::Closed { removed } => Ok(removed),
            LaneReply::Outcome(_) => Err(DialflowError::InvalidState(
                "lane answered close with a turn".into(),
            )),
        }
    }

    async fn outcome(
        &self,
        tenant: &TenantId,
        thread: &ThreadId,
        command: LaneCommand,
    ) -> Result<TurnOutcome> {
        match self.dispatch(tenant, thread, command).await? {
            LaneReply::Outcome(outcome) => Ok(outcome),
            LaneReply::Closed { .. } => Err(DialflowError::InvalidState(
                "lane answered a turn with close".into(),
            )),
        }
    }

    async fn dispatch(
        &self,
        tenant: &TenantId,
        thread: &ThreadId,
        mut command: LaneCommand,
    ) -> Result<LaneReply> {
        loop {
            match self.lane(tenant, thread).await.enqueue(command).await {
                Ok(reply) => return lane::wait(reply).await,
                // Retired between lookup and send; the next lookup respawns it.
                Err(returned) => command = returned,
            }
        }
    }

    /// The thread's lane, spawning its worker on first use.
    async fn lane(&self, tenant: &TenantId, thread: &ThreadId) -> LaneQueue {
        let mut lanes = self.lanes.lock().await;
        let key = (tenant.clone(), thread.clone());
        if let Some(lane) = lanes.get(&key).filter(|lane| !lane.is_closed()) {
            return lane.clone();
        }

        let (lane, mut lane_rx) = LaneQueue::new(self.lane_buffer);
        let inner = self.inner.clone();
        let registry = self.lanes.clone();
        let idle = self.lane_idle;
        let lane_key = key.clone();
        tokio::spawn(async move {
            let (tenant, thread) = &lane_key;
            loop {
                match tokio::time::timeout(idle, lane_rx.recv()).await {
                    Ok(Some(item)) => inner.run(tenant, thread, item),
                    Ok(None) => break,
                    Err(_) => {
                        lane_rx.close();
                        while let Some(item) = lane_rx.recv().await {
                            inner.run(tenant, thread, item);
                        }
                        let mut lanes = registry.lock().await;
                        if lanes.get(&lane_key).is_some_and(LaneQueue::is_closed) {
                            lanes.remove(&lane_key);
                        }
                        break;
                    }
                }
            }
            debug!(tenant = %tenant, thread = %thread, "Lane closed");
        });
        lanes.insert(key, lane.clone());
        lane
    }
}

impl Inner {
    fn run(&self, tenant: &TenantId, thread: &ThreadId, item: LaneItem) {
        let result = self.execute(tenant, thread, item.command);
        let _ = item.respond.send(result);
    }

    fn execute(&self, tenant: &TenantId, thread: &ThreadId, command: LaneCommand) -> Result<LaneReply> {
        if let LaneCommand::Close = command {
            let removed = self.conversations.delete(tenant, thread)?;
            info!(tenant = %tenant, thread = %thread, removed, "Conversation closed");
            return Ok(LaneReply::Closed { removed });
        }

        if let LaneCommand::Start { flow, context } = command {
            if self.conversations.load(tenant, thread)?.is_some() {
                return Err(DialflowError::InvalidState(format!(
                    "thread {} already has a conversation",
                    thread
                )));
            }
            let definition = self
                .flows
                .latest(tenant, &flow)?
                .ok_or_else(|| DialflowError::FlowNotFound(format!("{}/{}", tenant, flow)))?;
            let graph = self.graph(tenant, &flow, definition.version)?;
            let (snapshot, outcome) = self.engine.start(&graph, context)?;
            self.conversations.save(tenant, thread, &snapshot)?;
            info!(
                tenant = %tenant,
                thread = %thread,
                flow = %flow,
                version = %definition.version,
                node_id = %outcome.node,
                "Conversation started"
            );
            self.announce(tenant, thread, None, &snapshot, &outcome);
            return Ok(LaneReply::Outcome(outcome));
        }

        let mut snapshot = self
            .conversations
            .load(tenant, thread)?
            .ok_or_else(|| DialflowError::ConversationNotFound(format!("{}/{}", tenant, thread)))?;
        let before = snapshot.clone();
        let flow = snapshot.state.flow_id.clone();

        let outcome = match command {
            LaneCommand::Turn(input) => {
                let graph = self.graph(tenant, &flow, snapshot.state.version)?;
                let outcome = self.engine.apply_turn(&graph, &mut snapshot, &input)?;
                if outcome.turn != before.state.turn {
                    self.event_bus.publish(FlowEvent::TurnProcessed {
                        tenant: tenant.clone(),
                        thread: thread.clone(),
                        turn: outcome.turn,
                        node: outcome.node.clone(),
                    });
                }
                outcome
            }
            LaneCommand::Resume(target) => {
                let graph = self.graph(tenant, &flow, snapshot.state.version)?;
                self.engine.resume(&graph, &mut snapshot, target.as_ref())?
            }
            LaneCommand::OverridePath(path) => {
                let graph = self.graph(tenant, &flow, snapshot.state.version)?;
                self.engine.override_path(&graph, &mut snapshot, path)?
            }
            LaneCommand::Repin(version) => {
                let version = match version {
                    Some(version) => version,
                    None => {
                        self.flows
                            .latest(tenant, &flow)?
                            .ok_or_else(|| {
                                DialflowError::FlowNotFound(format!("{}/{}", tenant, flow))
                            })?
                            .version
                    }
                };
                let graph = self.graph(tenant, &flow, version)?;
                self.engine.repin(&graph, &mut snapshot)?;
                info!(
                    tenant = %tenant,
                    thread = %thread,
                    from = %before.state.version,
                    to = %version,
                    "Conversation re-pinned"
                );
                self.engine.position(&graph, &snapshot)
            }
            LaneCommand::Start { .. } | LaneCommand::Close => {
                return Err(DialflowError::InvalidState("command already handled".into()));
            }
        };

        self.conversations.save(tenant, thread, &snapshot)?;
        self.announce(tenant, thread, Some(&before), &snapshot, &outcome);
        Ok(LaneReply::Outcome(outcome))
    }

    /// Compiled graph for a pinned version, compiled once per process.
    fn graph(&self, tenant: &TenantId, flow: &FlowId, version: Version) -> Result<Arc<CompiledGraph>> {
        let key = (tenant.clone(), flow.clone(), version);
        {
            let graphs = self
                .graphs
                .lock()
                .map_err(|_| DialflowError::InvalidState("graph cache lock poisoned".into()))?;
            if let Some(graph) = graphs.get(&key) {
                return Ok(graph.clone());
            }
        }

        let definition = self.flows.load(tenant, flow, version)?.ok_or_else(|| {
            DialflowError::FlowNotFound(format!("{}/{} v{}", tenant, flow, version))
        })?;
        let graph = Arc::new(self.compiler.compile(&definition)?);
        debug!(tenant = %tenant, flow = %flow, version = %version, "Flow version compiled");

        let mut graphs = self
            .graphs
            .lock()
            .map_err(|_| DialflowError::InvalidState("graph cache lock poisoned".into()))?;
        if graphs.len() >= self.graph_cache && !graphs.contains_key(&key) {
            debug!(cached = graphs.len(), "Graph cache full, emptying");
            graphs.clear();
        }
        Ok(graphs.entry(key).or_insert(graph).clone())
    }

    fn announce(
        &self,
        tenant: &TenantId,
        thread: &ThreadId,
        before: Option<&ConversationSnapshot>,
        after: &ConversationSnapshot,
        outcome: &TurnOutcome,
    ) {
        let was_locked = before.is_some_and(|b| b.state.path.path_locked);
        if let (false, Some(path)) = (was_locked, after.state.path.locked_path()) {
            info!(tenant = %tenant, thread = %thread, path = %path, "Path locked");
            self.event_bus.publish(FlowEvent::PathLocked {
                tenant: tenant.clone(),
                thread: thread.clone(),
                path: path.clone(),
            });
        }

        if before.is_some_and(|b| b.state.status == outcome.status) {
            return;
        }
        match &outcome.status {
            ConversationStatus::Escalated { reason } => {
                warn!(tenant = %tenant, thread = %thread, reason = ?reason, "Conversation escalated");
                self.event_bus.publish(FlowEvent::Escalated {
                    tenant: tenant.clone(),
                    thread: thread.clone(),
                    reason: reason.clone(),
                });
            }
            ConversationStatus::Terminal { node } => {
                info!(tenant = %tenant, thread = %thread, node_id = %node, "Conversation reached a terminal node");
                self.event_bus.publish(FlowEvent::ConversationTerminal {
                    tenant: tenant.clone(),
                    thread: thread.clone(),
                    node: node.clone(),
                });
            }
            ConversationStatus::AwaitingInput => {}
        }
    }
}
