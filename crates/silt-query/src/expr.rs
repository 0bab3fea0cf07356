//! Primary-key expressions for query and delete.
//!
//! Grammar:
//!
//! ```text
//! expr    := field "in" "[" int ("," int)* ","? "]"
//!          | field op int
//! op      := "==" | "<" | "<=" | ">" | ">="
//! ```
//!
//! `field` must name the collection's primary key. `field in []` is allowed
//! and matches nothing.

use std::collections::BTreeSet;
use std::fmt;

use silt_core::{CoreError, CoreResult};

/// Upper bound on the number of keys in an `in` list.
const MAX_IN_LIST: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn apply(self, pk: i64, value: i64) -> bool {
        match self {
            Self::Eq => pk == value,
            Self::Lt => pk < value,
            Self::Le => pk <= value,
            Self::Gt => pk > value,
            Self::Ge => pk >= value,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

/// A parsed primary-key predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PkExpr {
    In(BTreeSet<i64>),
    Compare(CompareOp, i64),
}

impl PkExpr {
    /// Parses `input` against the primary key field `primary_field`.
    ///
    /// # Errors
    ///
    /// `ValidationError` describing the first token that does not fit.
    pub fn parse(input: &str, primary_field: &str) -> CoreResult<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            input,
        };

        let field = parser.ident()?;
        if field != primary_field {
            return Err(CoreError::ValidationError(format!(
                "expression field `{field}` is not the primary key `{primary_field}`"
            )));
        }

        let expr = match parser.next()? {
            Token::In => PkExpr::In(parser.int_list()?),
            Token::Op(op) => PkExpr::Compare(op, parser.int()?),
            other => return Err(parser.unexpected(&other)),
        };
        parser.end()?;
        Ok(expr)
    }

    /// True when `pk` satisfies the predicate.
    pub fn matches(&self, pk: i64) -> bool {
        match self {
            Self::In(keys) => keys.contains(&pk),
            Self::Compare(op, value) => op.apply(pk, *value),
        }
    }
}

impl fmt::Display for PkExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::In(keys) => {
                let list: Vec<String> = keys.iter().map(i64::to_string).collect();
                write!(f, "pk in [{}]", list.join(", "))
            }
            Self::Compare(op, value) => write!(f, "pk {} {value}", op.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Int(i64),
    In,
    Op(CompareOp),
    LBracket,
    RBracket,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(name) => write!(f, "`{name}`"),
            Self::Int(v) => write!(f, "{v}"),
            Self::In => f.write_str("`in`"),
            Self::Op(op) => write!(f, "`{}`", op.as_str()),
            Self::LBracket => f.write_str("`[`"),
            Self::RBracket => f.write_str("`]`"),
            Self::Comma => f.write_str("`,`"),
        }
    }
}

fn tokenize(input: &str) -> CoreResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' | '<' | '>' => {
                chars.next();
                let eq = matches!(chars.peek(), Some((_, '=')));
                if eq {
                    chars.next();
                }
                let op = match (c, eq) {
                    ('=', true) => CompareOp::Eq,
                    ('<', false) => CompareOp::Lt,
                    ('<', true) => CompareOp::Le,
                    ('>', false) => CompareOp::Gt,
                    ('>', true) => CompareOp::Ge,
                    _ => {
                        return Err(CoreError::ValidationError(format!(
                            "invalid operator at offset {start} in `{input}`"
                        )))
                    }
                };
                tokens.push(Token::Op(op));
            }
            c if c == '-' || c.is_ascii_digit() => {
                let mut end = start + c.len_utf8();
                chars.next();
                while let Some(&(i, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = i + d.len_utf8();
                    chars.next();
                }
                let literal = &input[start..end];
                let value = literal.parse::<i64>().map_err(|e| {
                    CoreError::ValidationError(format!("invalid integer `{literal}`: {e}"))
                })?;
                tokens.push(Token::Int(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = start;
                while let Some(&(i, d)) = chars.peek() {
                    if !(d.is_ascii_alphanumeric() || d == '_') {
                        break;
                    }
                    end = i + d.len_utf8();
                    chars.next();
                }
                let word = &input[start..end];
                tokens.push(if word == "in" {
                    Token::In
                } else {
                    Token::Ident(word.to_string())
                });
            }
            other => {
                return Err(CoreError::ValidationError(format!(
                    "unexpected character `{other}` at offset {start} in `{input}`"
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    input: &'a str,
}

impl Parser<'_> {
    fn next(&mut self) -> CoreResult<Token> {
        let token = self.tokens.get(self.pos).cloned().ok_or_else(|| {
            CoreError::ValidationError(format!("unexpected end of expression `{}`", self.input))
        })?;
        self.pos += 1;
        Ok(token)
    }

    fn unexpected(&self, token: &Token) -> CoreError {
        CoreError::ValidationError(format!(
            "unexpected token {token} in expression `{}`",
            self.input
        ))
    }

    fn ident(&mut self) -> CoreResult<String> {
        match self.next()? {
            Token::Ident(name) => Ok(name),
            other => Err(self.unexpected(&other)),
        }
    }

    fn int(&mut self) -> CoreResult<i64> {
        match self.next()? {
            Token::Int(v) => Ok(v),
            other => Err(self.unexpected(&other)),
        }
    }

    fn int_list(&mut self) -> CoreResult<BTreeSet<i64>> {
        match self.next()? {
            Token::LBracket => {}
            other => return Err(self.unexpected(&other)),
        }
        let mut keys = BTreeSet::new();
        loop {
            match self.next()? {
                Token::RBracket => return Ok(keys),
                Token::Int(v) => {
                    keys.insert(v);
                    if keys.len() > MAX_IN_LIST {
                        return Err(CoreError::ValidationError(format!(
                            "`in` list exceeds {MAX_IN_LIST} keys"
                        )));
                    }
                    match self.next()? {
                        Token::Comma => {}
                        Token::RBracket => return Ok(keys),
                        other => return Err(self.unexpected(&other)),
                    }
                }
                other => return Err(self.unexpected(&other)),
            }
        }
    }

    fn end(&mut self) -> CoreResult<()> {
        match self.tokens.get(self.pos) {
            None => Ok(()),
            Some(token) => Err(self.unexpected(token)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_in_list() {
        let expr = PkExpr::parse("int64 in [3, 1, 2, 2]", "int64").unwrap();
        assert_eq!(expr, PkExpr::In(BTreeSet::from([1, 2, 3])));
        assert!(expr.matches(2));
        assert!(!expr.matches(4));
    }

    #[test]
    fn test_parse_comparisons() {
        let cases = [
            ("int64 == 5", 5, true),
            ("int64 < 5", 5, false),
            ("int64 <= 5", 5, true),
            ("int64 > -1", 0, true),
            ("int64>=10", 9, false),
        ];
        for (input, pk, expected) in cases {
            let expr = PkExpr::parse(input, "int64").unwrap();
            assert_eq!(expr.matches(pk), expected, "{input} on {pk}");
        }
    }

    #[test]
    fn test_empty_list_and_trailing_comma() {
        assert!(!PkExpr::parse("int64 in []", "int64").unwrap().matches(0));
        assert!(PkExpr::parse("int64 in [7,]", "int64").unwrap().matches(7));
    }

    #[test]
    fn test_rejects_other_fields_and_garbage() {
        let err = PkExpr::parse("float in [1]", "int64").unwrap_err();
        assert!(err.to_string().contains("not the primary key"));
        assert!(PkExpr::parse("int64 = 3", "int64").is_err());
        assert!(PkExpr::parse("int64 in [1 2]", "int64").is_err());
        assert!(PkExpr::parse("int64 == 3 extra", "int64").is_err());
        assert!(PkExpr::parse("int64 in [1", "int64").is_err());
        assert!(PkExpr::parse("int64 == 99999999999999999999", "int64").is_err());
        assert!(PkExpr::parse("", "int64").is_err());
    }
}
