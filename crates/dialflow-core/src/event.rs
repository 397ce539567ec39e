use serde::Serialize;

use crate::state::EscalationReason;
use crate::types::{FlowId, NodeId, PathId, TenantId, ThreadId, Version};

/// Notifications published by the conversation service and mutation service.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FlowEvent {
    TurnProcessed {
        tenant: TenantId,
        thread: ThreadId,
        turn: u64,
        node: NodeId,
    },
    PathLocked {
        tenant: TenantId,
        thread: ThreadId,
        path: PathId,
    },
    Escalated {
        tenant: TenantId,
        thread: ThreadId,
        reason: EscalationReason,
    },
    ConversationTerminal {
        tenant: TenantId,
        thread: ThreadId,
        node: NodeId,
    },
    VersionPublished {
        tenant: TenantId,
        flow: FlowId,
        version: Version,
        description: String,
    },
    MutationRejected {
        tenant: TenantId,
        flow: FlowId,
        base_version: Version,
        error: String,
    },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: FlowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(FlowEvent::PathLocked {
            tenant: TenantId::new("acme"),
            thread: ThreadId::new("t1"),
            path: PathId::new("smb"),
        });
        match rx.try_recv().unwrap() {
            FlowEvent::PathLocked { path, .. } => assert_eq!(path.as_str(), "smb"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.publish(FlowEvent::TurnProcessed {
            tenant: TenantId::new("acme"),
            thread: ThreadId::new("t1"),
            turn: 1,
            node: NodeId::new("start"),
        });
    }
}
