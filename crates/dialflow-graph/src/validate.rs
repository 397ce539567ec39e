//! Answer validators.
//!
//! A question node may name a validator in call syntax (`range(1, 10)`,
//! `pattern("^[0-9]+$")`, `email`). The validator runs before an answer is
//! committed and may normalize the value it accepts.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;

use crate::guard::eval::{as_number, values_equal};
use crate::guard::parse_call;

/// Result of validating one answer.
pub type Verdict = Result<Value, String>;

/// A named answer check.
pub trait AnswerValidator: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Check arguments once, when the flow compiles.
    fn prepare(&self, args: &[Value]) -> Result<(), String>;

    /// Accept (possibly normalized) or reject with a reason.
    fn validate(&self, value: &Value, args: &[Value]) -> Verdict;
}

/// A validator bound to its arguments.
#[derive(Clone)]
pub struct CompiledValidator {
    spec: String,
    validator: Arc<dyn AnswerValidator>,
    args: Vec<Value>,
}

impl CompiledValidator {
    pub fn spec(&self) -> &str {
        &self.spec
    }

    pub fn validate(&self, value: &Value) -> Verdict {
        self.validator.validate(value, &self.args)
    }
}

impl std::fmt::Debug for CompiledValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledValidator")
            .field("spec", &self.spec)
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    validators: HashMap<String, Arc<dyn AnswerValidator>>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Range);
        registry.register(Length);
        registry.register(Pattern);
        registry.register(OneOf);
        registry.register(NumberValidator { integer: false });
        registry.register(NumberValidator { integer: true });
        registry.register(BooleanValidator);
        registry.register(Email);
        registry
    }

    pub fn register(&mut self, validator: impl AnswerValidator) {
        self.validators
            .insert(validator.name().to_string(), Arc::new(validator));
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.validators.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Parse a validator spec and bind it to a registered validator.
    pub fn compile(&self, spec: &str) -> Result<CompiledValidator, String> {
        let (name, args) = parse_call(spec).map_err(|e| e.to_string())?;
        let validator = self
            .validators
            .get(&name)
            .cloned()
            .ok_or_else(|| format!("unknown validator '{}'", name))?;
        validator.prepare(&args)?;
        Ok(CompiledValidator {
            spec: spec.trim().to_string(),
            validator,
            args,
        })
    }
}

impl std::fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatorRegistry")
            .field("validators", &self.names())
            .finish()
    }
}

fn expect_args(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), String> {
    if args.len() < min || args.len() > max {
        if min == max {
            return Err(format!("{} takes {} argument(s), got {}", name, min, args.len()));
        }
        return Err(format!(
            "{} takes {} to {} arguments, got {}",
            name,
            min,
            max,
            args.len()
        ));
    }
    Ok(())
}

fn numeric_args(name: &str, args: &[Value]) -> Result<Vec<f64>, String> {
    args.iter()
        .map(|a| {
            a.as_f64()
                .ok_or_else(|| format!("{} expects numeric arguments, got {}", name, a))
        })
        .collect()
}

/// Whole numbers normalize to integers.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn format_bound(n: f64) -> String {
    number_value(n).to_string()
}

/// `range(min, max)`, inclusive. Numeric strings are normalized to numbers.
struct Range;

impl AnswerValidator for Range {
    fn name(&self) -> &str {
        "range"
    }

    fn prepare(&self, args: &[Value]) -> Result<(), String> {
        expect_args("range", args, 2, 2)?;
        let bounds = numeric_args("range", args)?;
        if bounds[0] > bounds[1] {
            return Err("range minimum exceeds maximum".into());
        }
        Ok(())
    }

    fn validate(&self, value: &Value, args: &[Value]) -> Verdict {
        let bounds = numeric_args("range", args)?;
        let n = as_number(value).ok_or_else(|| "expected a number".to_string())?;
        if n < bounds[0] || n > bounds[1] {
            return Err(format!(
                "must be between {} and {}",
                format_bound(bounds[0]),
                format_bound(bounds[1])
            ));
        }
        Ok(number_value(n))
    }
}

/// `length(min)` or `length(min, max)` in characters.
struct Length;

impl AnswerValidator for Length {
    fn name(&self) -> &str {
        "length"
    }

    fn prepare(&self, args: &[Value]) -> Result<(), String> {
        expect_args("length", args, 1, 2)?;
        numeric_args("length", args).map(|_| ())
    }

    fn validate(&self, value: &Value, args: &[Value]) -> Verdict {
        let bounds = numeric_args("length", args)?;
        let Value::String(s) = value else {
            return Err("expected text".into());
        };
        let trimmed = s.trim();
        let len = trimmed.chars().count() as f64;
        if len < bounds[0] {
            return Err(format!("must be at least {} characters", format_bound(bounds[0])));
        }
        if let Some(max) = bounds.get(1) {
            if len > *max {
                return Err(format!("must be at most {} characters", format_bound(*max)));
            }
        }
        Ok(Value::String(trimmed.to_string()))
    }
}

/// `pattern("regex")` over the textual value.
struct Pattern;

impl Pattern {
    fn regex(args: &[Value]) -> Result<Regex, String> {
        match args.first() {
            Some(Value::String(p)) => Regex::new(p).map_err(|e| e.to_string()),
            _ => Err("pattern expects a string argument".into()),
        }
    }
}

impl AnswerValidator for Pattern {
    fn name(&self) -> &str {
        "pattern"
    }

    fn prepare(&self, args: &[Value]) -> Result<(), String> {
        expect_args("pattern", args, 1, 1)?;
        Self::regex(args).map(|_| ())
    }

    fn validate(&self, value: &Value, args: &[Value]) -> Verdict {
        let text = match value {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return Err("expected text".into()),
        };
        if Self::regex(args)?.is_match(&text) {
            Ok(Value::String(text))
        } else {
            Err("is not in the expected format".into())
        }
    }
}

/// `one_of(option, ...)`. Text matches case-insensitively and normalizes to
/// the declared option.
struct OneOf;

impl AnswerValidator for OneOf {
    fn name(&self) -> &str {
        "one_of"
    }

    fn prepare(&self, args: &[Value]) -> Result<(), String> {
        if args.is_empty() {
            return Err("one_of needs at least one option".into());
        }
        Ok(())
    }

    fn validate(&self, value: &Value, args: &[Value]) -> Verdict {
        for option in args {
            let matched = match (value, option) {
                (Value::String(v), Value::String(o)) => v.trim().eq_ignore_ascii_case(o),
                _ => values_equal(value, option),
            };
            if matched {
                return Ok(option.clone());
            }
        }
        let options: Vec<String> = args
            .iter()
            .map(|o| match o {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        Err(format!("must be one of: {}", options.join(", ")))
    }
}

/// `number` and `integer`.
struct NumberValidator {
    integer: bool,
}

impl AnswerValidator for NumberValidator {
    fn name(&self) -> &str {
        if self.integer {
            "integer"
        } else {
            "number"
        }
    }

    fn prepare(&self, args: &[Value]) -> Result<(), String> {
        expect_args(self.name(), args, 0, 0)
    }

    fn validate(&self, value: &Value, _args: &[Value]) -> Verdict {
        let n = as_number(value).ok_or_else(|| "expected a number".to_string())?;
        if self.integer && n.fract() != 0.0 {
            return Err("expected a whole number".into());
        }
        Ok(number_value(n))
    }
}

/// `boolean`: accepts booleans and common yes/no words.
struct BooleanValidator;

impl AnswerValidator for BooleanValidator {
    fn name(&self) -> &str {
        "boolean"
    }

    fn prepare(&self, args: &[Value]) -> Result<(), String> {
        expect_args("boolean", args, 0, 0)
    }

    fn validate(&self, value: &Value, _args: &[Value]) -> Verdict {
        match value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "yes" | "y" | "true" | "1" => Ok(Value::Bool(true)),
                "no" | "n" | "false" | "0" => Ok(Value::Bool(false)),
                _ => Err("expected yes or no".into()),
            },
            _ => Err("expected yes or no".into()),
        }
    }
}

struct Email;

impl AnswerValidator for Email {
    fn name(&self) -> &str {
        "email"
    }

    fn prepare(&self, args: &[Value]) -> Result<(), String> {
        expect_args("email", args, 0, 0)
    }

    fn validate(&self, value: &Value, _args: &[Value]) -> Verdict {
        let Value::String(s) = value else {
            return Err("expected an email address".into());
        };
        let address = s.trim();
        let valid = match address.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && !domain.contains('@')
                    && domain.contains('.')
                    && !domain.starts_with('.')
                    && !domain.ends_with('.')
                    && !address.chars().any(char::is_whitespace)
            }
            None => false,
        };
        if valid {
            Ok(Value::String(address.to_ascii_lowercase()))
        } else {
            Err("expected an email address".into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(spec: &str, value: Value) -> Verdict {
        ValidatorRegistry::with_builtins()
            .compile(spec)
            .unwrap()
            .validate(&value)
    }

    #[test]
    fn range_accepts_and_normalizes() {
        assert_eq!(check("range(1, 10)", json!("7")), Ok(json!(7)));
        assert_eq!(check("range(1, 10)", json!(10)), Ok(json!(10)));
        assert_eq!(
            check("range(1, 10)", json!(15)),
            Err("must be between 1 and 10".to_string())
        );
        assert!(check("range(1, 10)", json!("lots")).is_err());
    }

    #[test]
    fn length_and_pattern() {
        assert_eq!(check("length(2, 5)", json!("  abc ")), Ok(json!("abc")));
        assert!(check("length(2, 5)", json!("abcdef")).is_err());
        assert_eq!(check(r#"pattern("^[0-9]{4}$")"#, json!(2024)), Ok(json!("2024")));
        assert!(check(r#"pattern("^[0-9]{4}$")"#, json!("20x4")).is_err());
    }

    #[test]
    fn one_of_normalizes_case() {
        assert_eq!(check("one_of('SMB', 'Enterprise')", json!("smb")), Ok(json!("SMB")));
        assert!(check("one_of('SMB', 'Enterprise')", json!("consumer")).is_err());
    }

    #[test]
    fn scalar_validators() {
        assert_eq!(check("integer", json!("42")), Ok(json!(42)));
        assert!(check("integer", json!(4.5)).is_err());
        assert_eq!(check("number", json!("4.5")), Ok(json!(4.5)));
        assert_eq!(check("boolean", json!("Yes")), Ok(json!(true)));
        assert_eq!(check("email", json!(" Ada@Example.com ")), Ok(json!("ada@example.com")));
        assert!(check("email", json!("ada@example")).is_err());
    }

    #[test]
    fn compile_rejects_bad_specs() {
        let registry = ValidatorRegistry::with_builtins();
        assert!(registry.compile("range(10, 1)").is_err());
        assert!(registry.compile("range(1)").is_err());
        assert!(registry.compile("pattern('(')").is_err());
        assert!(registry.compile("shoe_size").is_err());
        assert!(registry.compile("email(1)").is_err());
    }
}
