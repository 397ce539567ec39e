use dialflow_core::error::EvalError;
use serde_json::Value;

use super::ast::{EdgeGuard, Expr, Operand};
use super::lexer::{tokenize, Token};

/// Longest guard or validator text accepted, in bytes.
pub const MAX_GUARD_LEN: usize = 4096;
/// Most tokens a single guard may contain.
pub const MAX_TOKENS: usize = 1024;
/// Deepest nesting of parentheses and `NOT` accepted.
pub const MAX_DEPTH: usize = 64;

/// Parse an edge guard. Empty text and `None` mean "always"; `else` is the
/// fallback marker.
pub fn parse_edge_guard(text: Option<&str>) -> Result<EdgeGuard, EvalError> {
    let Some(text) = text.map(str::trim).filter(|t| !t.is_empty()) else {
        return Ok(EdgeGuard::Always);
    };
    let tokens = lex(text)?;
    if let [(_, Token::Else)] = tokens.as_slice() {
        return Ok(EdgeGuard::Else);
    }
    Parser::new(tokens, text.len()).parse_all().map(EdgeGuard::When)
}

/// Parse a boolean expression.
pub fn parse_expr(text: &str) -> Result<Expr, EvalError> {
    let tokens = lex(text)?;
    Parser::new(tokens, text.len()).parse_all()
}

/// Parse call syntax such as `range(1, 10)` or a bare name such as `email`.
/// Arguments must be literals.
pub fn parse_call(text: &str) -> Result<(String, Vec<Value>), EvalError> {
    let tokens = lex(text)?;
    let mut parser = Parser::new(tokens, text.len());
    let name = match parser.next() {
        Some((_, Token::Ident(name))) => name,
        Some((pos, other)) => return Err(parse_err(pos, format!("expected a name, found {:?}", other))),
        None => return Err(parse_err(0, "empty call")),
    };
    let mut args = Vec::new();
    if parser.peek().is_some() {
        for arg in parser.call_args()? {
            match arg {
                Operand::Literal(value) => args.push(value),
                other => {
                    return Err(EvalError::InvalidArgument {
                        name: name.clone(),
                        message: format!("'{}' is not a literal", other),
                    })
                }
            }
        }
    }
    parser.expect_end()?;
    Ok((name, args))
}

fn lex(text: &str) -> Result<Vec<(usize, Token)>, EvalError> {
    if text.len() > MAX_GUARD_LEN {
        return Err(parse_err(
            MAX_GUARD_LEN,
            format!("guard is longer than {} bytes", MAX_GUARD_LEN),
        ));
    }
    let tokens = tokenize(text)?;
    if let Some((pos, _)) = tokens.get(MAX_TOKENS) {
        return Err(parse_err(
            *pos,
            format!("guard has more than {} tokens", MAX_TOKENS),
        ));
    }
    Ok(tokens)
}

fn parse_err(position: usize, message: impl Into<String>) -> EvalError {
    EvalError::Parse {
        position,
        message: message.into(),
    }
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<(usize, Token)>, end: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            end,
            depth: 0,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(p, _)| *p).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let item = self.tokens.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }

    fn expect(&mut self, want: Token, what: &str) -> Result<(), EvalError> {
        match self.next() {
            Some((_, t)) if t == want => Ok(()),
            Some((pos, t)) => Err(parse_err(pos, format!("expected {}, found {:?}", what, t))),
            None => Err(parse_err(self.end, format!("expected {}, found end of input", what))),
        }
    }

    fn descend(&mut self, at: usize) -> Result<(), EvalError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(parse_err(
                at,
                format!("guard nests deeper than {} levels", MAX_DEPTH),
            ));
        }
        Ok(())
    }

    fn expect_end(&self) -> Result<(), EvalError> {
        match self.tokens.get(self.pos) {
            None => Ok(()),
            Some((pos, t)) => Err(parse_err(*pos, format!("unexpected {:?}", t))),
        }
    }

    fn parse_all(&mut self) -> Result<Expr, EvalError> {
        if self.tokens.is_empty() {
            return Err(parse_err(0, "empty expression"));
        }
        let expr = self.parse_or()?;
        self.expect_end()?;
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let at = self.offset();
        let mut terms = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.next();
            terms.push(self.parse_and()?);
        }
        Expr::any(terms).ok_or_else(|| parse_err(at, "expected an expression"))
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let at = self.offset();
        let mut terms = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::And) {
            self.next();
            terms.push(self.parse_unary()?);
        }
        Expr::all(terms).ok_or_else(|| parse_err(at, "expected an expression"))
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        if self.peek() == Some(&Token::Not) {
            let at = self.offset();
            self.next();
            self.descend(at)?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Expr, EvalError> {
        let at = self.offset();
        match self.peek() {
            None => return Err(parse_err(at, "expected an expression, found end of input")),
            Some(Token::LParen) => {
                self.next();
                self.descend(at)?;
                let inner = self.parse_or()?;
                self.expect(Token::RParen, "')'")?;
                self.depth -= 1;
                return Ok(inner);
            }
            Some(Token::Else) => {
                return Err(parse_err(at, "'else' must be the whole guard"));
            }
            Some(Token::True | Token::False)
                if !matches!(self.peek_at(1), Some(Token::Cmp(_))) =>
            {
                let value = self.peek() == Some(&Token::True);
                self.next();
                return Ok(Expr::Literal(value));
            }
            Some(Token::Ident(_)) if self.peek_at(1) == Some(&Token::LParen) => {
                let Some((_, Token::Ident(name))) = self.next() else {
                    return Err(parse_err(at, "expected a predicate name"));
                };
                let args = self.call_args()?;
                return Ok(Expr::Call { name, args });
            }
            _ => {}
        }

        let left = self.operand()?;
        match self.next() {
            Some((_, Token::Present)) => Ok(Expr::Present(left)),
            Some((_, Token::Missing)) => Ok(Expr::Not(Box::new(Expr::Present(left)))),
            Some((_, Token::Cmp(op))) => {
                let right = self.operand()?;
                Ok(Expr::Compare { left, op, right })
            }
            Some((pos, t)) => Err(parse_err(
                pos,
                format!("expected a comparison or 'present'/'missing', found {:?}", t),
            )),
            None => Err(parse_err(
                self.end,
                "expected a comparison or 'present'/'missing', found end of input",
            )),
        }
    }

    fn call_args(&mut self) -> Result<Vec<Operand>, EvalError> {
        self.expect(Token::LParen, "'('")?;
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.next();
            return Ok(args);
        }
        loop {
            args.push(self.operand()?);
            match self.next() {
                Some((_, Token::Comma)) => continue,
                Some((_, Token::RParen)) => break,
                Some((pos, t)) => {
                    return Err(parse_err(pos, format!("expected ',' or ')', found {:?}", t)))
                }
                None => return Err(parse_err(self.end, "unclosed argument list")),
            }
        }
        Ok(args)
    }

    fn operand(&mut self) -> Result<Operand, EvalError> {
        match self.next() {
            Some((pos, Token::Ident(name))) => match name.strip_prefix("ctx.") {
                Some("") => Err(parse_err(pos, "empty context name")),
                Some(rest) => Ok(Operand::Context(rest.to_string())),
                None => Ok(Operand::Answer(name)),
            },
            Some((_, Token::Str(s))) => Ok(Operand::Literal(Value::String(s))),
            Some((pos, Token::Num(n))) => number_literal(n)
                .map(Operand::Literal)
                .ok_or_else(|| parse_err(pos, "number out of range")),
            Some((_, Token::True)) => Ok(Operand::Literal(Value::Bool(true))),
            Some((_, Token::False)) => Ok(Operand::Literal(Value::Bool(false))),
            Some((_, Token::Null)) => Ok(Operand::Literal(Value::Null)),
            Some((pos, t)) => Err(parse_err(pos, format!("expected a value, found {:?}", t))),
            None => Err(parse_err(self.end, "expected a value, found end of input")),
        }
    }
}

/// Integral numbers stay integers so exported guards read the way they were written.
fn number_literal(n: f64) -> Option<Value> {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Some(Value::from(n as i64))
    } else {
        serde_json::Number::from_f64(n).map(Value::Number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::ast::CmpOp;
    use serde_json::json;

    fn answer(key: &str) -> Operand {
        Operand::Answer(key.into())
    }

    #[test]
    fn precedence_and_binds_tighter_than_or() {
        let expr = parse_expr("a present OR b present AND c present").unwrap();
        match expr {
            Expr::Or(terms) => {
                assert_eq!(terms.len(), 2);
                assert_eq!(terms[0], Expr::Present(answer("a")));
                assert!(matches!(&terms[1], Expr::And(inner) if inner.len() == 2));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn comparison_with_literals() {
        let expr = parse_expr("budget >= 1000").unwrap();
        assert_eq!(
            expr,
            Expr::Compare {
                left: answer("budget"),
                op: CmpOp::Ge,
                right: Operand::Literal(json!(1000)),
            }
        );
    }

    #[test]
    fn missing_is_negated_presence() {
        let expr = parse_expr("NOT email missing").unwrap();
        assert_eq!(
            expr,
            Expr::Not(Box::new(Expr::Not(Box::new(Expr::Present(answer("email"))))))
        );
    }

    #[test]
    fn context_and_calls() {
        let expr = parse_expr("one_of(ctx.channel, 'sms', 'whatsapp')").unwrap();
        assert_eq!(
            expr,
            Expr::Call {
                name: "one_of".into(),
                args: vec![
                    Operand::Context("channel".into()),
                    Operand::Literal(json!("sms")),
                    Operand::Literal(json!("whatsapp")),
                ],
            }
        );
    }

    #[test]
    fn bool_literal_vs_comparison() {
        assert_eq!(parse_expr("true").unwrap(), Expr::Literal(true));
        assert!(matches!(parse_expr("true == opted_in").unwrap(), Expr::Compare { .. }));
    }

    #[test]
    fn edge_guard_forms() {
        assert_eq!(parse_edge_guard(None).unwrap(), EdgeGuard::Always);
        assert_eq!(parse_edge_guard(Some("  ")).unwrap(), EdgeGuard::Always);
        assert_eq!(parse_edge_guard(Some("ELSE")).unwrap(), EdgeGuard::Else);
        assert!(matches!(parse_edge_guard(Some("x == 1")).unwrap(), EdgeGuard::When(_)));
    }

    #[test]
    fn else_inside_expression_is_rejected() {
        assert!(matches!(
            parse_edge_guard(Some("x == 1 OR else")),
            Err(EvalError::Parse { .. })
        ));
    }

    #[test]
    fn trailing_tokens_are_rejected() {
        assert!(matches!(parse_expr("a present b"), Err(EvalError::Parse { .. })));
        assert!(matches!(parse_expr("(a present"), Err(EvalError::Parse { .. })));
        assert!(matches!(parse_expr("a =="), Err(EvalError::Parse { .. })));
    }

    #[test]
    fn display_round_trips_through_parser() {
        let text = "(a == 1 OR b present) AND NOT c missing AND contains(notes, 'vip')";
        let expr = parse_expr(text).unwrap();
        let again = parse_expr(&expr.to_string()).unwrap();
        assert_eq!(expr, again);
    }

    #[test]
    fn call_syntax() {
        assert_eq!(parse_call("email").unwrap(), ("email".to_string(), vec![]));
        assert_eq!(
            parse_call("range(1, 10)").unwrap(),
            ("range".to_string(), vec![json!(1), json!(10)])
        );
        assert!(matches!(
            parse_call("range(budget, 10)"),
            Err(EvalError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn chains_are_flat() {
        let text = (0..200)
            .map(|i| format!("k{} present", i))
            .collect::<Vec<_>>()
            .join(" AND ");
        match parse_expr(&text).unwrap() {
            Expr::And(terms) => assert_eq!(terms.len(), 200),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(
            parse_expr("(a present OR b present) OR c present").unwrap(),
            Expr::Or(vec![
                Expr::Present(answer("a")),
                Expr::Present(answer("b")),
                Expr::Present(answer("c")),
            ])
        );
    }

    #[test]
    fn nesting_is_bounded() {
        let ok = format!("{}x present", "NOT ".repeat(MAX_DEPTH));
        assert!(parse_expr(&ok).is_ok());

        let too_deep = format!("{}x present", "NOT ".repeat(MAX_DEPTH + 1));
        assert!(matches!(parse_expr(&too_deep), Err(EvalError::Parse { .. })));

        let parens = format!("{}x present{}", "(".repeat(100), ")".repeat(100));
        assert!(matches!(parse_expr(&parens), Err(EvalError::Parse { .. })));
    }

    #[test]
    fn oversized_guards_are_rejected() {
        let long = format!("{}x present", "NOT ".repeat(200_000));
        assert!(matches!(parse_expr(&long), Err(EvalError::Parse { .. })));

        let many = vec!["x == 1"; 400].join(" OR ");
        assert!(many.len() <= MAX_GUARD_LEN);
        assert!(matches!(parse_expr(&many), Err(EvalError::Parse { .. })));
    }
}
