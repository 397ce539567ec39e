use std::collections::HashMap;
use std::sync::Arc;

use dialflow_core::error::EvalError;
use regex::Regex;
use serde_json::Value;

use super::ast::Operand;
use super::eval::{as_number, values_equal};

/// Accepted argument count for a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub min: usize,
    /// `None` means variadic.
    pub max: Option<usize>,
}

impl Arity {
    pub const fn exactly(n: usize) -> Self {
        Self { min: n, max: Some(n) }
    }

    pub const fn at_least(n: usize) -> Self {
        Self { min: n, max: None }
    }

    pub fn accepts(&self, n: usize) -> bool {
        n >= self.min && self.max.map_or(true, |max| n <= max)
    }
}

impl std::fmt::Display for Arity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.max {
            Some(max) if max == self.min => write!(f, "{}", max),
            Some(max) => write!(f, "{}..={}", self.min, max),
            None => write!(f, "at least {}", self.min),
        }
    }
}

/// A named boolean function callable from guards.
///
/// Arguments arrive resolved; `None` is a missing answer or context value.
pub trait Predicate: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn arity(&self) -> Arity;

    /// Compile-time argument check, run once per call site.
    fn check_args(&self, _args: &[Operand]) -> Result<(), EvalError> {
        Ok(())
    }

    fn call(&self, args: &[Option<&Value>]) -> Result<bool, EvalError>;
}

/// Closed set of predicates guards may call.
#[derive(Clone, Default)]
pub struct PredicateRegistry {
    predicates: HashMap<String, Arc<dyn Predicate>>,
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Contains);
        registry.register(OneOf);
        registry.register(Matches);
        registry.register(Between);
        registry.register(NonEmpty);
        registry.register(IsNumber);
        registry
    }

    /// Register a predicate, replacing any existing one with the same name.
    pub fn register(&mut self, predicate: impl Predicate) {
        self.predicates
            .insert(predicate.name().to_string(), Arc::new(predicate));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Predicate>> {
        self.predicates.get(name)
    }

    /// Sorted predicate names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.predicates.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Check that a call site names a known predicate with acceptable arguments.
    pub fn check_call(&self, name: &str, args: &[Operand]) -> Result<(), EvalError> {
        let predicate = self
            .get(name)
            .ok_or_else(|| EvalError::UnknownPredicate(name.to_string()))?;
        let arity = predicate.arity();
        if !arity.accepts(args.len()) {
            return Err(EvalError::Arity {
                name: name.to_string(),
                expected: arity.to_string(),
                got: args.len(),
            });
        }
        predicate.check_args(args)
    }
}

impl std::fmt::Debug for PredicateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateRegistry")
            .field("predicates", &self.names())
            .finish()
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// `contains(haystack, needle)`: substring (case-insensitive) or array membership.
struct Contains;

impl Predicate for Contains {
    fn name(&self) -> &str {
        "contains"
    }

    fn arity(&self) -> Arity {
        Arity::exactly(2)
    }

    fn call(&self, args: &[Option<&Value>]) -> Result<bool, EvalError> {
        let (Some(haystack), Some(needle)) = (args[0], args[1]) else {
            return Ok(false);
        };
        Ok(match haystack {
            Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
            other => match (text_of(other), text_of(needle)) {
                (Some(h), Some(n)) => h.to_lowercase().contains(&n.to_lowercase()),
                _ => false,
            },
        })
    }
}

/// `one_of(value, option, ...)`.
struct OneOf;

impl Predicate for OneOf {
    fn name(&self) -> &str {
        "one_of"
    }

    fn arity(&self) -> Arity {
        Arity::at_least(2)
    }

    fn call(&self, args: &[Option<&Value>]) -> Result<bool, EvalError> {
        let Some(value) = args[0] else {
            return Ok(false);
        };
        Ok(args[1..]
            .iter()
            .flatten()
            .any(|option| values_equal(value, option)))
    }
}

/// `matches(value, "regex")`.
struct Matches;

impl Matches {
    fn compile(pattern: &str) -> Result<Regex, EvalError> {
        Regex::new(pattern).map_err(|e| EvalError::InvalidArgument {
            name: "matches".into(),
            message: e.to_string(),
        })
    }
}

impl Predicate for Matches {
    fn name(&self) -> &str {
        "matches"
    }

    fn arity(&self) -> Arity {
        Arity::exactly(2)
    }

    fn check_args(&self, args: &[Operand]) -> Result<(), EvalError> {
        match args[1].as_literal() {
            Some(Value::String(pattern)) => Self::compile(pattern).map(|_| ()),
            Some(_) => Err(EvalError::InvalidArgument {
                name: "matches".into(),
                message: "pattern must be a string".into(),
            }),
            None => Ok(()),
        }
    }

    fn call(&self, args: &[Option<&Value>]) -> Result<bool, EvalError> {
        let (Some(value), Some(Value::String(pattern))) = (args[0], args[1]) else {
            return Ok(false);
        };
        let Some(text) = text_of(value) else {
            return Ok(false);
        };
        Ok(Self::compile(pattern)?.is_match(&text))
    }
}

/// `between(value, lo, hi)`, inclusive, numeric.
struct Between;

impl Predicate for Between {
    fn name(&self) -> &str {
        "between"
    }

    fn arity(&self) -> Arity {
        Arity::exactly(3)
    }

    fn call(&self, args: &[Option<&Value>]) -> Result<bool, EvalError> {
        let nums: Vec<Option<f64>> = args.iter().map(|a| a.and_then(as_number)).collect();
        Ok(match (nums[0], nums[1], nums[2]) {
            (Some(v), Some(lo), Some(hi)) => lo <= v && v <= hi,
            _ => false,
        })
    }
}

/// `non_empty(value)`: present and not an empty string, array or object.
struct NonEmpty;

impl Predicate for NonEmpty {
    fn name(&self) -> &str {
        "non_empty"
    }

    fn arity(&self) -> Arity {
        Arity::exactly(1)
    }

    fn call(&self, args: &[Option<&Value>]) -> Result<bool, EvalError> {
        Ok(match args[0] {
            None => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
            Some(_) => true,
        })
    }
}

struct IsNumber;

impl Predicate for IsNumber {
    fn name(&self) -> &str {
        "is_number"
    }

    fn arity(&self) -> Arity {
        Arity::exactly(1)
    }

    fn call(&self, args: &[Option<&Value>]) -> Result<bool, EvalError> {
        Ok(args[0].and_then(as_number).is_some())
    }
}
