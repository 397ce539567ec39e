pub mod config;
pub mod error;
pub mod event;
pub mod flow;
pub mod state;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use error::{CompileError, DialflowError, EvalError, MutationError, Result, ValidationError};
pub use event::{EventBus, FlowEvent};
pub use flow::{Edge, FlowDefinition, Node, NodeKind, ScopeId, VersionMeta, ELSE, EXIT};
pub use state::{ConversationSnapshot, ConversationStatus, EscalationReason, Frame, PathState, TraversalState};
pub use types::*;
