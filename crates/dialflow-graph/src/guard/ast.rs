use std::fmt;

use serde_json::Value;

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }

    pub fn is_ordering(&self) -> bool {
        !matches!(self, CmpOp::Eq | CmpOp::Ne)
    }
}

/// A value a guard reads: an answer slot, a context entry, or a literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Answer(String),
    Context(String),
    Literal(Value),
}

impl Operand {
    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            Operand::Literal(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Answer(key) => f.write_str(key),
            Operand::Context(name) => write!(f, "ctx.{}", name),
            Operand::Literal(Value::String(s)) => {
                write!(f, "'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
            }
            Operand::Literal(v) => write!(f, "{}", v),
        }
    }
}

/// Restricted boolean expression. There is no way to express anything other
/// than comparisons, presence checks and calls into the predicate registry.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(bool),
    Present(Operand),
    Compare {
        left: Operand,
        op: CmpOp,
        right: Operand,
    },
    Call {
        name: String,
        args: Vec<Operand>,
    },
    Not(Box<Expr>),
    /// Flat conjunction, at least two terms.
    And(Vec<Expr>),
    /// Flat disjunction, at least two terms.
    Or(Vec<Expr>),
}

impl Expr {
    /// AND together a list of expressions. Returns `None` for an empty list.
    pub fn all(exprs: Vec<Expr>) -> Option<Expr> {
        let mut terms = Vec::with_capacity(exprs.len());
        for expr in exprs {
            match expr {
                Expr::And(inner) => terms.extend(inner),
                other => terms.push(other),
            }
        }
        connect(terms, Expr::And)
    }

    /// OR together a list of expressions. Returns `None` for an empty list.
    pub fn any(exprs: Vec<Expr>) -> Option<Expr> {
        let mut terms = Vec::with_capacity(exprs.len());
        for expr in exprs {
            match expr {
                Expr::Or(inner) => terms.extend(inner),
                other => terms.push(other),
            }
        }
        connect(terms, Expr::Or)
    }

    /// Whether the expression is the constant `true`.
    pub fn is_always_true(&self) -> bool {
        matches!(self, Expr::Literal(true))
    }

    /// Every predicate call in the expression, as `(name, args)`.
    pub fn calls(&self) -> Vec<(&str, &[Operand])> {
        let mut out = Vec::new();
        self.collect_calls(&mut out);
        out
    }

    fn collect_calls<'a>(&'a self, out: &mut Vec<(&'a str, &'a [Operand])>) {
        match self {
            Expr::Call { name, args } => out.push((name.as_str(), args.as_slice())),
            Expr::Not(inner) => inner.collect_calls(out),
            Expr::And(terms) | Expr::Or(terms) => {
                for term in terms {
                    term.collect_calls(out);
                }
            }
            Expr::Literal(_) | Expr::Present(_) | Expr::Compare { .. } => {}
        }
    }

    /// Answer keys the expression reads, in first-appearance order.
    pub fn answer_keys(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_keys(&mut out);
        out
    }

    fn collect_keys<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Present(op) => push_key(op, out),
            Expr::Compare { left, right, .. } => {
                push_key(left, out);
                push_key(right, out);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    push_key(arg, out);
                }
            }
            Expr::Not(inner) => inner.collect_keys(out),
            Expr::And(terms) | Expr::Or(terms) => {
                for term in terms {
                    term.collect_keys(out);
                }
            }
            Expr::Literal(_) => {}
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Or(..) => 1,
            Expr::And(..) => 2,
            _ => 3,
        }
    }

    fn fmt_terms(&self, terms: &[Expr], sep: &str, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, term) in terms.iter().enumerate() {
            if i > 0 {
                f.write_str(sep)?;
            }
            if term.precedence() <= self.precedence() {
                write!(f, "({})", term)?;
            } else {
                write!(f, "{}", term)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(b) => write!(f, "{}", b),
            Expr::Present(op) => write!(f, "{} present", op),
            Expr::Compare { left, op, right } => write!(f, "{} {} {}", left, op.symbol(), right),
            Expr::Call { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
            Expr::Not(inner) => match inner.as_ref() {
                Expr::Present(op) => write!(f, "{} missing", op),
                other if other.precedence() < 3 => write!(f, "NOT ({})", other),
                other => write!(f, "NOT {}", other),
            },
            Expr::And(terms) => self.fmt_terms(terms, " AND ", f),
            Expr::Or(terms) => self.fmt_terms(terms, " OR ", f),
        }
    }
}

fn connect(mut terms: Vec<Expr>, build: fn(Vec<Expr>) -> Expr) -> Option<Expr> {
    match terms.len() {
        0 => None,
        1 => terms.pop(),
        _ => Some(build(terms)),
    }
}

fn push_key<'a>(op: &'a Operand, out: &mut Vec<&'a str>) {
    if let Operand::Answer(key) = op {
        if !out.contains(&key.as_str()) {
            out.push(key.as_str());
        }
    }
}

/// How an edge participates in selection.
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeGuard {
    /// No guard.
    Always,
    When(Expr),
    /// Matches only when no sibling guard is true.
    Else,
}

impl EdgeGuard {
    /// True for edges that can always be taken once reached: no guard, a
    /// constant-true guard, or `else`.
    pub fn is_fallback(&self) -> bool {
        match self {
            EdgeGuard::Always | EdgeGuard::Else => true,
            EdgeGuard::When(expr) => expr.is_always_true(),
        }
    }
}

impl fmt::Display for EdgeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeGuard::Always => f.write_str("true"),
            EdgeGuard::When(expr) => write!(f, "{}", expr),
            EdgeGuard::Else => f.write_str("else"),
        }
    }
}
