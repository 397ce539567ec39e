pub mod compiler;
pub mod export;
pub mod guard;
pub mod merge;
pub mod validate;

pub use compiler::{
    compile, CompileWarning, CompiledEdge, CompiledGraph, CompiledNode, CompiledScope, Compiler,
    EdgeTarget,
};
pub use export::{export, export_json, ExportedFlow};
pub use guard::{EdgeGuard, Expr, GuardScope, Predicate, PredicateRegistry};
pub use merge::{
    merge, merge_with, EdgePatch, FlowLayer, LayerGraph, LayerTier, MergeConflict, MergeOutcome,
    NodePatch,
};
pub use validate::{AnswerValidator, CompiledValidator, ValidatorRegistry};
