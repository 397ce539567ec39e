use crate::error::Result;
use crate::flow::{FlowDefinition, VersionMeta};
use crate::state::ConversationSnapshot;
use crate::types::{FlowId, TenantId, ThreadId, Version};

/// Result of a compare-and-swap publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// Another writer advanced the flow first.
    Stale { current: Version },
}

/// Flow version storage, keyed by `(tenant_id, flow_id, version)`.
///
/// Versions are append-only: publishing never overwrites or deletes an
/// earlier version.
pub trait FlowStore: Send + Sync + 'static {
    /// Latest published version of a flow.
    fn latest(&self, tenant: &TenantId, flow: &FlowId) -> Result<Option<FlowDefinition>>;

    /// A specific version of a flow.
    fn load(
        &self,
        tenant: &TenantId,
        flow: &FlowId,
        version: Version,
    ) -> Result<Option<FlowDefinition>>;

    /// Publish `definition` if the current latest version equals `expected`
    /// (`None` means the flow must not exist yet).
    fn publish(
        &self,
        tenant: &TenantId,
        definition: &FlowDefinition,
        expected: Option<Version>,
    ) -> Result<PublishOutcome>;

    /// Version metadata, oldest first.
    fn history(&self, tenant: &TenantId, flow: &FlowId) -> Result<Vec<VersionMeta>>;
}

/// Conversation state storage, keyed by `(tenant_id, thread_id)`.
pub trait ConversationStore: Send + Sync + 'static {
    fn load(&self, tenant: &TenantId, thread: &ThreadId) -> Result<Option<ConversationSnapshot>>;

    fn save(
        &self,
        tenant: &TenantId,
        thread: &ThreadId,
        snapshot: &ConversationSnapshot,
    ) -> Result<()>;

    /// Remove a thread's state. Returns whether anything was deleted.
    fn delete(&self, tenant: &TenantId, thread: &ThreadId) -> Result<bool>;
}
