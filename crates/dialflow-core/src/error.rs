use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Version;

/// Guard evaluation failures.
///
/// Raised at compile time when a guard names an unknown predicate or cannot be
/// parsed. If one escapes to runtime the traversal engine treats the guard as
/// false and logs it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("Unknown predicate: {0}")]
    UnknownPredicate(String),

    #[error("Predicate {name} expects {expected} arguments, got {got}")]
    Arity {
        name: String,
        expected: String,
        got: usize,
    },

    #[error("Type mismatch in '{op}': cannot compare {left} with {right}")]
    TypeMismatch {
        op: String,
        left: String,
        right: String,
    },

    #[error("Parse error at offset {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("Invalid argument for {name}: {message}")]
    InvalidArgument { name: String, message: String },
}

/// Structural problems found while compiling a flow definition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("Schema error at {element}: {detail}")]
    Schema { element: String, detail: String },

    #[error("Duplicate id '{id}' in scope {scope}")]
    DuplicateId { scope: String, id: String },

    #[error("Reference error at {element}: '{missing}' does not resolve")]
    Reference { element: String, missing: String },

    #[error("Unexpected cycle through node '{node}': {path}")]
    Cycle { node: String, path: String },

    #[error("Node '{node}' can dead-end: every outgoing edge is guarded and there is no else edge")]
    DeadEnd { node: String },

    #[error("Invalid guard at {element}: {source}")]
    Guard {
        element: String,
        #[source]
        source: EvalError,
    },
}

impl CompileError {
    /// The node or edge id the error was reported against.
    pub fn element(&self) -> &str {
        match self {
            CompileError::Schema { element, .. }
            | CompileError::Reference { element, .. }
            | CompileError::Guard { element, .. } => element,
            CompileError::DuplicateId { id, .. } => id,
            CompileError::Cycle { node, .. } | CompileError::DeadEnd { node } => node,
        }
    }
}

/// An answer rejected by its node's validator. Recoverable: the conversation
/// stays on the same node.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("Answer for '{key}' at node '{node}' rejected: {reason}")]
pub struct ValidationError {
    pub key: String,
    pub node: String,
    pub reason: String,
}

/// A batch mutation that was rejected in full.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MutationError {
    #[error("Stale version: edits were computed against v{base} but the flow is at v{current}")]
    StaleVersion { base: Version, current: Version },

    #[error("Edit #{index}: unknown node '{node}'")]
    UnknownNode { index: usize, node: String },

    #[error("Edit #{index}: unknown edge {from} -> {to}")]
    UnknownEdge {
        index: usize,
        from: String,
        to: String,
    },

    #[error("Edit #{index}: node '{node}' already exists")]
    DuplicateNode { index: usize, node: String },

    #[error("Edit #{index}: removing '{node}' would leave edge {from} -> {to} dangling")]
    DanglingReference {
        index: usize,
        node: String,
        from: String,
        to: String,
    },

    #[error("Edit #{index}: unknown scope '{scope}'")]
    UnknownScope { index: usize, scope: String },

    #[error("Edit #{index}: {detail}")]
    InvalidEdit { index: usize, detail: String },

    #[error("Flow not found: {0}")]
    UnknownFlow(String),

    #[error("Edited flow does not compile: {0}")]
    Compile(#[from] CompileError),

    #[error("Storage failure: {0}")]
    Store(String),

    #[error("Storage timed out: {0}")]
    Timeout(String),
}

#[derive(Debug, Error)]
pub enum DialflowError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Mutation(#[from] MutationError),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    // Runtime errors
    #[error("Collaborator failure: {0}")]
    Collaborator(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Collaborator timed out: {0}")]
    Timeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DialflowError>;
