pub mod feedback;
pub mod lane;
pub mod mutation;
pub mod path_policy;
pub mod service;
pub mod traversal;

pub use feedback::{ActionResult, FailureKind, FeedbackGate};
pub use lane::{LaneCommand, LaneQueue, LaneReply};
pub use mutation::{apply_edits, BatchEdit, MutationRequest, MutationResponse, MutationService};
pub use path_policy::{PathDecision, PathPolicy};
pub use service::ConversationService;
pub use traversal::{IgnoreReason, IgnoredProposal, TraversalEngine, TurnOutcome};
