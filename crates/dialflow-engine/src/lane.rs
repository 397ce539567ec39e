use std::collections::BTreeMap;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use dialflow_core::error::{DialflowError, Result};
use dialflow_core::types::{ExtractionInput, FlowId, NodeId, PathId, Version};

use crate::traversal::TurnOutcome;

/// Work queued for one conversation thread.
#[derive(Debug, Clone)]
pub enum LaneCommand {
    Start {
        flow: FlowId,
        context: BTreeMap<String, Value>,
    },
    Turn(ExtractionInput),
    Resume(Option<NodeId>),
    /// Move to the given version, or the latest when `None`.
    Repin(Option<Version>),
    OverridePath(PathId),
    Close,
}

/// What a lane hands back for a command.
#[derive(Debug, Clone)]
pub enum LaneReply {
    Outcome(TurnOutcome),
    Closed { removed: bool },
}

/// A command queued in a thread lane.
pub struct LaneItem {
    pub command: LaneCommand,
    pub respond: oneshot::Sender<Result<LaneReply>>,
}

/// Per-thread FIFO queue ensuring serial execution of turns.
#[derive(Clone)]
pub struct LaneQueue {
    tx: mpsc::Sender<LaneItem>,
}

impl LaneQueue {
    /// Create a new lane and return (queue_handle, receiver).
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<LaneItem>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }

    /// Enqueue a command without waiting for it to run. A retired lane hands
    /// the command back untouched.
    pub async fn enqueue(
        &self,
        command: LaneCommand,
    ) -> std::result::Result<oneshot::Receiver<Result<LaneReply>>, LaneCommand> {
        let (respond, rx) = oneshot::channel();
        self.tx
            .send(LaneItem { command, respond })
            .await
            .map_err(|rejected| rejected.0.command)?;
        Ok(rx)
    }

    /// Enqueue a command and wait for its result.
    pub async fn send(&self, command: LaneCommand) -> Result<LaneReply> {
        let rx = self
            .enqueue(command)
            .await
            .map_err(|_| DialflowError::InvalidState("conversation lane is closed".into()))?;
        wait(rx).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Wait for a queued command's reply.
pub async fn wait(rx: oneshot::Receiver<Result<LaneReply>>) -> Result<LaneReply> {
    rx.await
        .map_err(|_| DialflowError::InvalidState("conversation lane dropped the turn".into()))?
}
