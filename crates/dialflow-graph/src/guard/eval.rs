use std::cmp::Ordering;
use std::collections::BTreeMap;

use dialflow_core::error::EvalError;
use dialflow_core::types::Answers;
use serde_json::Value;

use super::ast::{CmpOp, EdgeGuard, Expr, Operand};
use super::registry::PredicateRegistry;

/// Everything a guard can read.
#[derive(Clone, Copy)]
pub struct GuardScope<'a> {
    pub answers: &'a Answers,
    pub context: &'a BTreeMap<String, Value>,
    pub registry: &'a PredicateRegistry,
}

impl<'a> GuardScope<'a> {
    pub fn new(
        answers: &'a Answers,
        context: &'a BTreeMap<String, Value>,
        registry: &'a PredicateRegistry,
    ) -> Self {
        Self {
            answers,
            context,
            registry,
        }
    }

    /// Resolve an operand. `null` answers count as missing.
    pub fn resolve<'b>(&'b self, operand: &'b Operand) -> Option<&'b Value> {
        let value = match operand {
            Operand::Answer(key) => self.answers.value(key)?,
            Operand::Context(name) => self.context.get(name)?,
            Operand::Literal(v) => return Some(v),
        };
        (!value.is_null()).then_some(value)
    }
}

/// Evaluate an expression against answers and context.
pub fn evaluate(expr: &Expr, scope: &GuardScope<'_>) -> Result<bool, EvalError> {
    match expr {
        Expr::Literal(b) => Ok(*b),
        Expr::Present(operand) => Ok(scope.resolve(operand).is_some()),
        Expr::Compare { left, op, right } => {
            match (scope.resolve(left), scope.resolve(right)) {
                (Some(l), Some(r)) => compare(l, *op, r),
                // Either side missing: the comparison does not hold.
                _ => Ok(false),
            }
        }
        Expr::Call { name, args } => {
            let predicate = scope
                .registry
                .get(name)
                .ok_or_else(|| EvalError::UnknownPredicate(name.clone()))?;
            let arity = predicate.arity();
            if !arity.accepts(args.len()) {
                return Err(EvalError::Arity {
                    name: name.clone(),
                    expected: arity.to_string(),
                    got: args.len(),
                });
            }
            let values: Vec<Option<&Value>> = args.iter().map(|a| scope.resolve(a)).collect();
            predicate.call(&values)
        }
        Expr::Not(inner) => Ok(!evaluate(inner, scope)?),
        Expr::And(terms) => {
            for term in terms {
                if !evaluate(term, scope)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Expr::Or(terms) => {
            for term in terms {
                if evaluate(term, scope)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

/// Evaluate an edge guard. `Else` evaluates false here; the caller decides
/// when the fallback applies.
pub fn evaluate_edge(guard: &EdgeGuard, scope: &GuardScope<'_>) -> Result<bool, EvalError> {
    match guard {
        EdgeGuard::Always => Ok(true),
        EdgeGuard::When(expr) => evaluate(expr, scope),
        EdgeGuard::Else => Ok(false),
    }
}

/// Numeric view of a value. Numeric strings coerce.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

/// Equality with numeric coercion, so `1 == 1.0` and `"5" == 5` both hold.
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            match (as_number(left), as_number(right)) {
                (Some(l), Some(r)) => l == r,
                _ => false,
            }
        }
        _ => left == right,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> Result<bool, EvalError> {
    match op {
        CmpOp::Eq => return Ok(values_equal(left, right)),
        CmpOp::Ne => return Ok(!values_equal(left, right)),
        _ => {}
    }

    let ordering = match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => l.partial_cmp(&r),
        _ => match (left, right) {
            (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
            _ => None,
        },
    };
    let Some(ordering) = ordering else {
        return Err(EvalError::TypeMismatch {
            op: op.symbol().to_string(),
            left: type_name(left).to_string(),
            right: type_name(right).to_string(),
        });
    };

    Ok(match op {
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
    })
}
