//! Restricted guard language.
//!
//! Guards are parsed into a small AST and evaluated against answers and
//! context. Named predicates come from a closed [`PredicateRegistry`]; nothing
//! authored into a flow can execute arbitrary code.

pub mod ast;
pub mod eval;
mod lexer;
pub mod parser;
pub mod registry;

pub use ast::{CmpOp, EdgeGuard, Expr, Operand};
pub use eval::{evaluate, evaluate_edge, GuardScope};
pub use parser::{parse_call, parse_edge_guard, parse_expr};
pub use registry::{Arity, Predicate, PredicateRegistry};

use dialflow_core::error::EvalError;

/// Parse an expression and check every predicate call against the registry.
pub fn compile_expr(text: &str, registry: &PredicateRegistry) -> Result<Expr, EvalError> {
    let expr = parse_expr(text)?;
    check_calls(&expr, registry)?;
    Ok(expr)
}

/// Parse an edge guard and check its predicate calls.
pub fn compile_edge_guard(
    text: Option<&str>,
    registry: &PredicateRegistry,
) -> Result<EdgeGuard, EvalError> {
    let guard = parse_edge_guard(text)?;
    if let EdgeGuard::When(expr) = &guard {
        check_calls(expr, registry)?;
    }
    Ok(guard)
}

fn check_calls(expr: &Expr, registry: &PredicateRegistry) -> Result<(), EvalError> {
    for (name, args) in expr.calls() {
        registry.check_call(name, args)?;
    }
    Ok(())
}
