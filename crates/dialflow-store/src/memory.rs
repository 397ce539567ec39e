use std::collections::HashMap;
use std::sync::Mutex;

use dialflow_core::error::{DialflowError, Result};
use dialflow_core::flow::{FlowDefinition, VersionMeta};
use dialflow_core::state::ConversationSnapshot;
use dialflow_core::traits::{ConversationStore, FlowStore, PublishOutcome};
use dialflow_core::types::{FlowId, TenantId, ThreadId, Version};

use crate::check_successor;

type FlowKey = (TenantId, FlowId);
type ThreadKey = (TenantId, ThreadId);

/// Process-local store. Used by tests and the CLI's dry runs.
#[derive(Default)]
pub struct MemoryStore {
    flows: Mutex<HashMap<FlowKey, Vec<FlowDefinition>>>,
    conversations: Mutex<HashMap<ThreadKey, ConversationSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> DialflowError {
    DialflowError::Database("store lock poisoned".into())
}

impl FlowStore for MemoryStore {
    fn latest(&self, tenant: &TenantId, flow: &FlowId) -> Result<Option<FlowDefinition>> {
        let flows = self.flows.lock().map_err(poisoned)?;
        Ok(flows
            .get(&(tenant.clone(), flow.clone()))
            .and_then(|versions| versions.last().cloned()))
    }

    fn load(
        &self,
        tenant: &TenantId,
        flow: &FlowId,
        version: Version,
    ) -> Result<Option<FlowDefinition>> {
        let flows = self.flows.lock().map_err(poisoned)?;
        Ok(flows
            .get(&(tenant.clone(), flow.clone()))
            .and_then(|versions| versions.iter().find(|d| d.version == version).cloned()))
    }

    fn publish(
        &self,
        tenant: &TenantId,
        definition: &FlowDefinition,
        expected: Option<Version>,
    ) -> Result<PublishOutcome> {
        let mut flows = self.flows.lock().map_err(poisoned)?;
        let versions = flows
            .entry((tenant.clone(), definition.id.clone()))
            .or_default();
        let current = versions.last().map(|d| d.version);
        if current != expected {
            return Ok(PublishOutcome::Stale {
                current: current.unwrap_or_default(),
            });
        }
        check_successor(definition, current)?;
        versions.push(definition.clone());
        Ok(PublishOutcome::Published)
    }

    fn history(&self, tenant: &TenantId, flow: &FlowId) -> Result<Vec<VersionMeta>> {
        let flows = self.flows.lock().map_err(poisoned)?;
        Ok(flows
            .get(&(tenant.clone(), flow.clone()))
            .map(|versions| versions.iter().filter_map(|d| d.meta.clone()).collect())
            .unwrap_or_default())
    }
}

impl ConversationStore for MemoryStore {
    fn load(&self, tenant: &TenantId, thread: &ThreadId) -> Result<Option<ConversationSnapshot>> {
        let conversations = self.conversations.lock().map_err(poisoned)?;
        Ok(conversations
            .get(&(tenant.clone(), thread.clone()))
            .cloned())
    }

    fn save(
        &self,
        tenant: &TenantId,
        thread: &ThreadId,
        snapshot: &ConversationSnapshot,
    ) -> Result<()> {
        let mut conversations = self.conversations.lock().map_err(poisoned)?;
        conversations.insert((tenant.clone(), thread.clone()), snapshot.clone());
        Ok(())
    }

    fn delete(&self, tenant: &TenantId, thread: &ThreadId) -> Result<bool> {
        let mut conversations = self.conversations.lock().map_err(poisoned)?;
        Ok(conversations
            .remove(&(tenant.clone(), thread.clone()))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dialflow_test_utils::fixtures;

    #[test]
    fn publish_requires_expected_version() {
        let store = MemoryStore::new();
        let tenant = TenantId::new("acme");
        let v1 = fixtures::qualification_flow();

        assert_eq!(store.publish(&tenant, &v1, None).unwrap(), PublishOutcome::Published);
        assert_eq!(
            store.publish(&tenant, &v1, None).unwrap(),
            PublishOutcome::Stale { current: Version(1) }
        );

        let mut v2 = v1.clone();
        v2.version = Version(2);
        assert_eq!(
            store.publish(&tenant, &v2, Some(Version(1))).unwrap(),
            PublishOutcome::Published
        );
        assert_eq!(store.latest(&tenant, &v1.id).unwrap().unwrap().version, Version(2));
        assert_eq!(FlowStore::load(&store, &tenant, &v1.id, Version(1)).unwrap().unwrap(), v1);
    }

    #[test]
    fn tenants_are_isolated() {
        let store = MemoryStore::new();
        let flow = fixtures::qualification_flow();
        store.publish(&TenantId::new("a"), &flow, None).unwrap();
        assert!(store.latest(&TenantId::new("b"), &flow.id).unwrap().is_none());
    }

    #[test]
    fn conversation_round_trip_and_delete() {
        let store = MemoryStore::new();
        let tenant = TenantId::new("acme");
        let thread = ThreadId::new("t-1");
        let snapshot = fixtures::snapshot_at(&fixtures::qualification_flow(), "name");

        store.save(&tenant, &thread, &snapshot).unwrap();
        assert_eq!(
            ConversationStore::load(&store, &tenant, &thread).unwrap(),
            Some(snapshot)
        );
        assert!(store.delete(&tenant, &thread).unwrap());
        assert!(!store.delete(&tenant, &thread).unwrap());
    }
}
