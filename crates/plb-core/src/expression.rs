//! Placement-constraint expressions.
//!
//! A service may restrict the nodes it runs on with a boolean expression
//! over node properties, e.g. `NodeType == Front && (Rack != r1 || Zone >= 3)`.
//!
//! Grammar (lowest precedence first):
//!
//! ```text
//! expr       := and ( "||" and )*
//! and        := unary ( "&&" unary )*
//! unary      := "!" unary | "(" expr ")" | comparison
//! comparison := WORD op ( WORD | STRING )
//! op         := "==" | "!=" | "<" | "<=" | ">" | ">="
//! ```
//!
//! Values that parse as numbers on both sides compare numerically, all
//! others compare as strings. A comparison against a property the node
//! does not have is false.

use std::borrow::Cow;
use std::fmt;

use crate::error::{CoreError, CoreResult};

/// Read access to the properties of a node for expression evaluation.
pub trait NodeView {
    fn property(&self, name: &str) -> Option<Cow<'_, str>>;
}

impl NodeView for std::collections::BTreeMap<String, String> {
    fn property(&self, name: &str) -> Option<Cow<'_, str>> {
        self.get(name).map(|v| Cow::Borrowed(v.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        f.write_str(s)
    }
}

/// A parsed placement-constraint expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// The empty expression; matches every node.
    Always,
    Or(Box<Expression>, Box<Expression>),
    And(Box<Expression>, Box<Expression>),
    Not(Box<Expression>),
    Compare {
        property: String,
        op: CompareOp,
        value: String,
    },
}

impl Expression {
    pub fn parse(input: &str) -> CoreResult<Self> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Ok(Expression::Always);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some((offset, token)) = parser.tokens.get(parser.pos) {
            return Err(CoreError::Expression {
                offset: *offset,
                message: format!("unexpected {token:?}"),
            });
        }
        Ok(expr)
    }

    pub fn is_always(&self) -> bool {
        matches!(self, Expression::Always)
    }

    pub fn matches(&self, node: &dyn NodeView) -> bool {
        match self {
            Expression::Always => true,
            Expression::Or(a, b) => a.matches(node) || b.matches(node),
            Expression::And(a, b) => a.matches(node) && b.matches(node),
            Expression::Not(inner) => !inner.matches(node),
            Expression::Compare {
                property,
                op,
                value,
            } => match node.property(property) {
                Some(actual) => compare(&actual, *op, value),
                None => false,
            },
        }
    }
}

fn compare(actual: &str, op: CompareOp, expected: &str) -> bool {
    let ordering = match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b),
        _ => Some(actual.cmp(expected)),
    };
    let Some(ordering) = ordering else {
        return false;
    };
    match op {
        CompareOp::Eq => ordering.is_eq(),
        CompareOp::Ne => ordering.is_ne(),
        CompareOp::Lt => ordering.is_lt(),
        CompareOp::Le => ordering.is_le(),
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::Ge => ordering.is_ge(),
    }
}

// ── Lexer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Op(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '/' | ':' | '-')
}

fn tokenize(input: &str) -> CoreResult<Vec<(usize, Token)>> {
    let mut tokens = Vec::new();
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut i = 0;

    let err = |offset: usize, message: &str| CoreError::Expression {
        offset,
        message: message.to_string(),
    };

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((offset, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((offset, Token::RParen));
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push((offset, Token::And));
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push((offset, Token::Or));
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push((offset, Token::Op(CompareOp::Eq)));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push((offset, Token::Op(CompareOp::Ne)));
                i += 2;
            }
            '!' => {
                tokens.push((offset, Token::Not));
                i += 1;
            }
            '<' | '>' => {
                let op = match (c, next) {
                    ('<', Some('=')) => CompareOp::Le,
                    ('<', _) => CompareOp::Lt,
                    ('>', Some('=')) => CompareOp::Ge,
                    _ => CompareOp::Gt,
                };
                i += if next == Some('=') { 2 } else { 1 };
                tokens.push((offset, Token::Op(op)));
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some((_, ch)) if *ch == quote => break,
                        Some((_, ch)) => {
                            value.push(*ch);
                            i += 1;
                        }
                        None => return Err(err(offset, "unterminated string literal")),
                    }
                }
                i += 1;
                tokens.push((offset, Token::Str(value)));
            }
            c if is_word_char(c) => {
                let mut word = String::new();
                while let Some((_, ch)) = chars.get(i) {
                    if !is_word_char(*ch) {
                        break;
                    }
                    word.push(*ch);
                    i += 1;
                }
                tokens.push((offset, Token::Word(word)));
            }
            other => return Err(err(offset, &format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

// ── Parser ─────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(o, _)| *o)
            .unwrap_or(0)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn error(&self, message: &str) -> CoreError {
        CoreError::Expression {
            offset: self.offset(),
            message: message.to_string(),
        }
    }

    fn parse_or(&mut self) -> CoreResult<Expression> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expression::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> CoreResult<Expression> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expression::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> CoreResult<Expression> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Expression::Not(Box::new(self.parse_unary()?)))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("expected ')'")),
                }
            }
            _ => self.parse_comparison(),
        }
    }

    fn parse_comparison(&mut self) -> CoreResult<Expression> {
        let property = match self.next() {
            Some(Token::Word(w)) => w,
            _ => return Err(self.error("expected property name")),
        };
        let op = match self.next() {
            Some(Token::Op(op)) => op,
            _ => return Err(self.error("expected comparison operator")),
        };
        let value = match self.next() {
            Some(Token::Word(w)) | Some(Token::Str(w)) => w,
            _ => return Err(self.error("expected value")),
        };
        Ok(Expression::Compare {
            property,
            op,
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_expression_matches_everything() {
        let expr = Expression::parse("   ").unwrap();
        assert!(expr.is_always());
        assert!(expr.matches(&props(&[])));
    }

    #[test]
    fn equality_and_precedence() {
        let expr = Expression::parse("NodeType == Front || NodeType == Back && Zone == 2").unwrap();
        assert!(expr.matches(&props(&[("NodeType", "Front")])));
        assert!(!expr.matches(&props(&[("NodeType", "Back"), ("Zone", "1")])));
        assert!(expr.matches(&props(&[("NodeType", "Back"), ("Zone", "2")])));
    }

    #[test]
    fn numeric_comparison() {
        let expr = Expression::parse("Rack >= 10").unwrap();
        assert!(expr.matches(&props(&[("Rack", "12")])));
        // "9" < "10" numerically even though it sorts after lexically.
        assert!(!expr.matches(&props(&[("Rack", "9")])));
    }

    #[test]
    fn missing_property_is_false_even_for_not_equal() {
        let expr = Expression::parse("Color != red").unwrap();
        assert!(!expr.matches(&props(&[])));
        let negated = Expression::parse("!(Color == red)").unwrap();
        assert!(negated.matches(&props(&[])));
    }

    #[test]
    fn quoted_values_and_paths() {
        let expr = Expression::parse("FaultDomain == \"fd:/dc 1/r2\" && (Zone < 'b')").unwrap();
        assert!(expr.matches(&props(&[("FaultDomain", "fd:/dc 1/r2"), ("Zone", "a")])));
    }

    #[test]
    fn syntax_errors_report_offset() {
        assert!(matches!(
            Expression::parse("NodeType =="),
            Err(CoreError::Expression { .. })
        ));
        assert!(Expression::parse("(A == 1").is_err());
        assert!(Expression::parse("A == 1 B").is_err());
        assert!(Expression::parse("A = 1").is_err());
        assert!(Expression::parse("A == \"open").is_err());
    }
}
