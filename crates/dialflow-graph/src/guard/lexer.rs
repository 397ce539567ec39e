use dialflow_core::error::EvalError;

use super::ast::CmpOp;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Not,
    Cmp(CmpOp),
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    Present,
    Missing,
    Else,
}

/// Split guard or validator text into `(offset, token)` pairs.
pub(crate) fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, EvalError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        match c {
            c if c.is_whitespace() => {
                i += 1;
            }
            '(' => {
                tokens.push((pos, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((pos, Token::RParen));
                i += 1;
            }
            ',' => {
                tokens.push((pos, Token::Comma));
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push((pos, Token::And));
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push((pos, Token::Or));
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push((pos, Token::Cmp(CmpOp::Eq)));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push((pos, Token::Cmp(CmpOp::Ne)));
                i += 2;
            }
            '!' => {
                tokens.push((pos, Token::Not));
                i += 1;
            }
            '<' | '>' => {
                let op = match (c, next == Some('=')) {
                    ('<', true) => CmpOp::Le,
                    ('<', false) => CmpOp::Lt,
                    ('>', true) => CmpOp::Ge,
                    _ => CmpOp::Gt,
                };
                tokens.push((pos, Token::Cmp(op)));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < chars.len() {
                    let (_, ch) = chars[j];
                    if ch == '\\' {
                        if let Some((_, escaped)) = chars.get(j + 1) {
                            value.push(*escaped);
                            j += 2;
                            continue;
                        }
                    }
                    if ch == quote {
                        closed = true;
                        break;
                    }
                    value.push(ch);
                    j += 1;
                }
                if !closed {
                    return Err(EvalError::Parse {
                        position: pos,
                        message: "unterminated string literal".into(),
                    });
                }
                tokens.push((pos, Token::Str(value)));
                i = j + 1;
            }
            c if c.is_ascii_digit()
                || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) =>
            {
                let mut j = i + 1;
                while j < chars.len() && (chars[j].1.is_ascii_digit() || chars[j].1 == '.') {
                    j += 1;
                }
                let end = chars.get(j).map(|(p, _)| *p).unwrap_or(input.len());
                let text = &input[pos..end];
                let value = text.parse::<f64>().map_err(|_| EvalError::Parse {
                    position: pos,
                    message: format!("invalid number '{}'", text),
                })?;
                tokens.push((pos, Token::Num(value)));
                i = j;
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut j = i + 1;
                while j < chars.len() {
                    let ch = chars[j].1;
                    if ch.is_alphanumeric() || ch == '_' || ch == '.' || ch == '-' {
                        j += 1;
                    } else {
                        break;
                    }
                }
                let end = chars.get(j).map(|(p, _)| *p).unwrap_or(input.len());
                let word = &input[pos..end];
                let token = match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "present" => Token::Present,
                    "missing" => Token::Missing,
                    "else" => Token::Else,
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push((pos, token));
                i = j;
            }
            other => {
                return Err(EvalError::Parse {
                    position: pos,
                    message: format!("unexpected character '{}'", other),
                });
            }
        }
    }

    Ok(tokens)
}
