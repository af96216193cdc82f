//! Edge conditions.
//!
//! A condition is a pure function of the run's `ExecutionState`. It is either a small textual
//! expression, parsed once when the edge is declared, or an arbitrary Rust predicate.
//!
//! Expression grammar:
//!
//! ```text
//! expr    := or
//! or      := and ( ("or" | "||") and )*
//! and     := unary ( ("and" | "&&") unary )*
//! unary   := ("not" | "!") unary | "(" expr ")" | compare
//! compare := operand op literal
//! operand := NODE | NODE ".output" ( "." FIELD )* | NODE ".status"
//! op      := "==" | "!=" | "contains" | "starts_with" | "ends_with"
//! literal := "quoted string" | bare word
//! ```
//!
//! A bare `NODE` means the node's latest output rendered as text. Referencing a node that has
//! no result yet is a routing error, not `false`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use maestro_core::error::{MaestroError, Result};
use maestro_core::state::ExecutionState;
use maestro_core::types::{value_text, NodeId, NodeStatus};

/// Closure form of a condition.
pub type PredicateFn = dyn Fn(&ExecutionState) -> bool + Send + Sync;

/// A guard on a graph edge.
#[derive(Clone)]
pub enum Condition {
    Expr(Expression),
    Predicate(Arc<PredicateFn>),
}

impl Condition {
    /// Parse a textual expression.
    pub fn expr(source: &str) -> Result<Self> {
        Ok(Self::Expr(Expression::parse(source)?))
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&ExecutionState) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    /// True when the latest output of `node` contains `needle`.
    pub fn output_contains(node: impl Into<NodeId>, needle: impl Into<String>) -> Self {
        let node = node.into();
        let needle = needle.into();
        let source = format!("{} contains {:?}", node, needle);
        Self::Expr(Expression {
            source,
            ast: Ast::Compare {
                operand: Operand {
                    node,
                    field: Field::Output(Vec::new()),
                },
                op: Op::Contains,
                literal: needle,
            },
        })
    }

    /// True when the latest result of `node` has `status`.
    pub fn status_is(node: impl Into<NodeId>, status: NodeStatus) -> Self {
        let node = node.into();
        let source = format!("{}.status == {:?}", node, status.as_str());
        Self::Expr(Expression {
            source,
            ast: Ast::Compare {
                operand: Operand {
                    node,
                    field: Field::Status,
                },
                op: Op::Eq,
                literal: status.as_str().to_string(),
            },
        })
    }

    pub fn evaluate(&self, state: &ExecutionState) -> Result<bool> {
        match self {
            Self::Expr(expr) => expr.evaluate(state),
            Self::Predicate(f) => Ok(f(state)),
        }
    }

    /// Node ids an expression reads. Predicates are opaque and report none.
    pub fn referenced_nodes(&self) -> Vec<&NodeId> {
        match self {
            Self::Expr(expr) => expr.referenced_nodes(),
            Self::Predicate(_) => Vec::new(),
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expr(expr) => write!(f, "Condition({})", expr.source),
            Self::Predicate(_) => f.write_str("Condition(<predicate>)"),
        }
    }
}

/// A parsed textual condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Ast,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            source,
        };
        let ast = parser.parse_or()?;
        if parser.pos != tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self {
            source: source.trim().to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, state: &ExecutionState) -> Result<bool> {
        self.ast.eval(state)
    }

    pub fn referenced_nodes(&self) -> Vec<&NodeId> {
        let mut out = Vec::new();
        self.ast.collect_nodes(&mut out);
        out
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Ast {
    Or(Box<Ast>, Box<Ast>),
    And(Box<Ast>, Box<Ast>),
    Not(Box<Ast>),
    Compare {
        operand: Operand,
        op: Op,
        literal: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct Operand {
    node: NodeId,
    field: Field,
}

#[derive(Debug, Clone, PartialEq)]
enum Field {
    /// Output, optionally drilled into JSON object keys.
    Output(Vec<String>),
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Eq,
    Ne,
    Contains,
    StartsWith,
    EndsWith,
}

impl Ast {
    fn eval(&self, state: &ExecutionState) -> Result<bool> {
        match self {
            Self::Or(a, b) => Ok(a.eval(state)? || b.eval(state)?),
            Self::And(a, b) => Ok(a.eval(state)? && b.eval(state)?),
            Self::Not(a) => Ok(!a.eval(state)?),
            Self::Compare {
                operand,
                op,
                literal,
            } => {
                let actual = operand.resolve(state)?;
                Ok(match op {
                    Op::Eq => actual == *literal,
                    Op::Ne => actual != *literal,
                    Op::Contains => actual.contains(literal.as_str()),
                    Op::StartsWith => actual.starts_with(literal.as_str()),
                    Op::EndsWith => actual.ends_with(literal.as_str()),
                })
            }
        }
    }

    fn collect_nodes<'a>(&'a self, out: &mut Vec<&'a NodeId>) {
        match self {
            Self::Or(a, b) | Self::And(a, b) => {
                a.collect_nodes(out);
                b.collect_nodes(out);
            }
            Self::Not(a) => a.collect_nodes(out),
            Self::Compare { operand, .. } => {
                if !out.contains(&&operand.node) {
                    out.push(&operand.node);
                }
            }
        }
    }
}

impl Operand {
    fn resolve(&self, state: &ExecutionState) -> Result<String> {
        let result = state.latest(self.node.as_str()).ok_or_else(|| {
            MaestroError::Routing(format!(
                "condition reads node '{}' which has no result yet",
                self.node
            ))
        })?;
        Ok(match &self.field {
            Field::Status => result.status.as_str().to_string(),
            Field::Output(path) => path
                .iter()
                .try_fold(&result.output, |value, key| value.get(key.as_str()))
                .map(value_text)
                .unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Dot,
    LParen,
    RParen,
    EqEq,
    NotEq,
    Bang,
    AndAnd,
    OrOr,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(syntax_error(source, "expected '=='"));
                }
                tokens.push(Token::EqEq);
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    tokens.push(Token::Bang);
                }
            }
            '&' | '|' => {
                chars.next();
                if chars.next() != Some(c) {
                    return Err(syntax_error(source, "expected '&&' or '||'"));
                }
                tokens.push(if c == '&' { Token::AndAnd } else { Token::OrOr });
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some(ch) = chars.next() {
                    match ch {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                s.push(escaped);
                            }
                        }
                        ch if ch == quote => {
                            closed = true;
                            break;
                        }
                        ch => s.push(ch),
                    }
                }
                if !closed {
                    return Err(syntax_error(source, "unterminated string literal"));
                }
                tokens.push(Token::Str(s));
            }
            c if is_ident_char(c) => {
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if !is_ident_char(ch) {
                        break;
                    }
                    ident.push(ch);
                    chars.next();
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(syntax_error(
                    source,
                    &format!("unexpected character '{}'", other),
                ))
            }
        }
    }
    Ok(tokens)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

fn syntax_error(source: &str, msg: &str) -> MaestroError {
    MaestroError::Validation(format!("bad condition `{}`: {}", source.trim(), msg))
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, msg: &str) -> MaestroError {
        syntax_error(self.source, msg)
    }

    fn eat_keyword(&mut self, keyword: &str, symbol: &Token) -> bool {
        match self.peek() {
            Some(Token::Ident(word)) if word == keyword => {
                self.pos += 1;
                true
            }
            Some(tok) if tok == symbol => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn parse_or(&mut self) -> Result<Ast> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("or", &Token::OrOr) {
            let right = self.parse_and()?;
            left = Ast::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Ast> {
        let mut left = self.parse_unary()?;
        while self.eat_keyword("and", &Token::AndAnd) {
            let right = self.parse_unary()?;
            left = Ast::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Ast> {
        if self.eat_keyword("not", &Token::Bang) {
            return Ok(Ast::Not(Box::new(self.parse_unary()?)));
        }
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            if self.next() != Some(&Token::RParen) {
                return Err(self.error("expected ')'"));
            }
            return Ok(inner);
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Ast> {
        let operand = self.parse_operand()?;
        let op = match self.next() {
            Some(Token::EqEq) => Op::Eq,
            Some(Token::NotEq) => Op::Ne,
            Some(Token::Ident(word)) => match word.as_str() {
                "contains" => Op::Contains,
                "starts_with" => Op::StartsWith,
                "ends_with" => Op::EndsWith,
                _ => return Err(self.error(&format!("unknown operator '{}'", word))),
            },
            _ => return Err(self.error("expected an operator")),
        };
        let literal = match self.next() {
            Some(Token::Str(s)) | Some(Token::Ident(s)) => s.clone(),
            _ => return Err(self.error("expected a literal")),
        };
        Ok(Ast::Compare {
            operand,
            op,
            literal,
        })
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        let node = match self.next() {
            Some(Token::Ident(id)) => NodeId::from(id.as_str()),
            _ => return Err(self.error("expected a node id")),
        };
        if self.peek() != Some(&Token::Dot) {
            return Ok(Operand {
                node,
                field: Field::Output(Vec::new()),
            });
        }
        self.pos += 1;
        let field = match self.next() {
            Some(Token::Ident(f)) if f == "status" => Field::Status,
            Some(Token::Ident(f)) if f == "output" => {
                let mut path = Vec::new();
                while self.peek() == Some(&Token::Dot) {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(key)) | Some(Token::Str(key)) => path.push(key.clone()),
                        _ => return Err(self.error("expected a field name after '.'")),
                    }
                }
                Field::Output(path)
            }
            _ => return Err(self.error("expected 'output' or 'status' after '.'")),
        };
        Ok(Operand { node, field })
    }
}

/// Caches condition results per (edge, state version).
///
/// The graph executor evaluates conditions only while resolving a finished node's outgoing
/// edges, so a hit means the same edge was resolved again against an unchanged state. Readiness
/// checks never evaluate conditions. A write to the state bumps its version and invalidates every
/// entry. Errors are never cached.
#[derive(Debug, Default)]
pub struct ConditionMemo {
    entries: HashMap<usize, (u64, bool)>,
}

impl ConditionMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(
        &mut self,
        edge: usize,
        condition: &Condition,
        state: &ExecutionState,
    ) -> Result<bool> {
        let version = state.version();
        if let Some((cached_version, value)) = self.entries.get(&edge) {
            if *cached_version == version {
                return Ok(*value);
            }
        }
        let value = condition.evaluate(state)?;
        self.entries.insert(edge, (version, value));
        Ok(value)
    }
}
