//! Restricted arithmetic over loop iterations.
//!
//! Step fields nested inside loops may be written as small expressions that
//! depend on the current iteration, e.g. `2*i[0] + 1` or `(i[1] - 1) * 10`.
//! The grammar is deliberately tiny:
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := ('-' | '+') unary | primary
//! primary := number | '(' expr ')' | 'i' '[' digits ']'
//! ```
//!
//! `i[0]` is the iteration of the innermost enclosing loop, `i[1]` the loop
//! around it, and so on. Iterations are 1-based. Expressions are parsed once
//! into an [`Expr`] and evaluated by a pure interpreter with no access to
//! anything but the iteration context.
//!
//! Integer arithmetic stays integral until it overflows; `/` always produces
//! a float.

use std::fmt;
use thiserror::Error;

/// Maximum nesting of parentheses and unary operators.
const MAX_DEPTH: usize = 64;

/// Errors produced while parsing or evaluating an expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    /// Nothing to evaluate.
    #[error("empty expression")]
    Empty,
    /// A character outside the grammar.
    #[error("unexpected character '{ch}' at column {column}")]
    UnexpectedChar {
        /// Offending character
        ch: char,
        /// 1-based column
        column: usize,
    },
    /// Input ended in the middle of an expression.
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    /// A token in the wrong place.
    #[error("unexpected '{found}' at column {column}")]
    UnexpectedToken {
        /// Token text
        found: String,
        /// 1-based column
        column: usize,
    },
    /// A numeric literal that does not parse.
    #[error("'{0}' is not a valid number")]
    InvalidNumber(String),
    /// `i[n]` with `n` at or beyond the loop nesting depth.
    #[error("i[{index}] is out of range: only {depth} enclosing loop(s)")]
    IndexOutOfRange {
        /// Requested index
        index: usize,
        /// Number of enclosing loops
        depth: usize,
    },
    /// `i` used without an index.
    #[error(
        "'i' must be indexed: use i[0] for the current loop's iteration, \
         i[1] for the loop above it, etc."
    )]
    BareIteration,
    /// Any identifier other than `i`.
    #[error("unknown name '{0}': only i[n] may be referenced")]
    UnknownIdentifier(String),
    /// Division by zero.
    #[error("division by zero")]
    DivisionByZero,
    /// The result is infinite or NaN.
    #[error("expression does not evaluate to a finite number")]
    NotFinite,
    /// Too many nested parentheses or signs.
    #[error("expression is nested too deeply")]
    TooDeep,
}

/// A numeric value: integers stay exact until an operation needs a float.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    /// Exact integer
    Int(i64),
    /// Floating point
    Float(f64),
}

impl Number {
    /// Value as a float.
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(v) => v as f64,
            Number::Float(v) => v,
        }
    }

    /// Value as an integer; floats qualify only when they have no fractional part.
    pub fn as_integer(self) -> Option<i64> {
        match self {
            Number::Int(v) => Some(v),
            Number::Float(v) => {
                if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
                    Some(v as i64)
                } else {
                    None
                }
            }
        }
    }

    /// Parse a bare numeric literal such as `12`, `-1` or `0.5`.
    pub fn parse_literal(text: &str) -> Option<Number> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        if let Ok(v) = text.parse::<i64>() {
            return Some(Number::Int(v));
        }
        // Reject things f64 accepts but nobody types into a step field.
        if !text
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
        {
            return None;
        }
        text.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Number::Float)
    }

    fn checked(self) -> Result<Number, ExpressionError> {
        match self {
            Number::Float(v) if !v.is_finite() => Err(ExpressionError::NotFinite),
            other => Ok(other),
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int(v) => write!(f, "{v}"),
            Number::Float(v) => write!(f, "{v}"),
        }
    }
}

/// Binary arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
}

impl BinaryOp {
    fn apply(self, lhs: Number, rhs: Number) -> Result<Number, ExpressionError> {
        use Number::{Float, Int};
        let result = match (self, lhs, rhs) {
            (BinaryOp::Div, _, rhs) if rhs.as_f64() == 0.0 => {
                return Err(ExpressionError::DivisionByZero)
            }
            (BinaryOp::Div, lhs, rhs) => Float(lhs.as_f64() / rhs.as_f64()),
            (BinaryOp::Add, Int(a), Int(b)) => a
                .checked_add(b)
                .map_or(Float(a as f64 + b as f64), Int),
            (BinaryOp::Sub, Int(a), Int(b)) => a
                .checked_sub(b)
                .map_or(Float(a as f64 - b as f64), Int),
            (BinaryOp::Mul, Int(a), Int(b)) => a
                .checked_mul(b)
                .map_or(Float(a as f64 * b as f64), Int),
            (BinaryOp::Add, a, b) => Float(a.as_f64() + b.as_f64()),
            (BinaryOp::Sub, a, b) => Float(a.as_f64() - b.as_f64()),
            (BinaryOp::Mul, a, b) => Float(a.as_f64() * b.as_f64()),
        };
        result.checked()
    }

    fn symbol(self) -> char {
        match self {
            BinaryOp::Add => '+',
            BinaryOp::Sub => '-',
            BinaryOp::Mul => '*',
            BinaryOp::Div => '/',
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Numeric literal
    Literal(Number),
    /// `i[n]`
    Iteration(usize),
    /// Unary minus
    Neg(Box<Expr>),
    /// `lhs op rhs`
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        lhs: Box<Expr>,
        /// Right operand
        rhs: Box<Expr>,
    },
}

impl Expr {
    /// Parse expression text.
    pub fn parse(text: &str) -> Result<Expr, ExpressionError> {
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return Err(ExpressionError::Empty);
        }
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.expr()?;
        match parser.peek() {
            None => Ok(expr),
            Some(token) => Err(token.unexpected()),
        }
    }

    /// Evaluate against an iteration context (index 0 = innermost loop).
    pub fn eval(&self, context: &[u32]) -> Result<Number, ExpressionError> {
        match self {
            Expr::Literal(n) => Ok(*n),
            Expr::Iteration(index) => context
                .get(*index)
                .map(|v| Number::Int(i64::from(*v)))
                .ok_or(ExpressionError::IndexOutOfRange {
                    index: *index,
                    depth: context.len(),
                }),
            Expr::Neg(inner) => match inner.eval(context)? {
                Number::Int(v) => Ok(v.checked_neg().map_or(Number::Float(-(v as f64)), Number::Int)),
                Number::Float(v) => Ok(Number::Float(-v)),
            },
            Expr::Binary { op, lhs, rhs } => op.apply(lhs.eval(context)?, rhs.eval(context)?),
        }
    }

    /// Highest `i[n]` index referenced, if any.
    pub fn max_index(&self) -> Option<usize> {
        match self {
            Expr::Literal(_) => None,
            Expr::Iteration(index) => Some(*index),
            Expr::Neg(inner) => inner.max_index(),
            Expr::Binary { lhs, rhs, .. } => match (lhs.max_index(), rhs.max_index()) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
        }
    }

    /// Fail early if the expression reaches past `depth` enclosing loops.
    pub fn check_depth(&self, depth: usize) -> Result<(), ExpressionError> {
        match self.max_index() {
            Some(index) if index >= depth => {
                Err(ExpressionError::IndexOutOfRange { index, depth })
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(n) => write!(f, "{n}"),
            Expr::Iteration(index) => write!(f, "i[{index}]"),
            Expr::Neg(inner) => write!(f, "-({inner})"),
            Expr::Binary { op, lhs, rhs } => write!(f, "({lhs} {} {rhs})", op.symbol()),
        }
    }
}

/// Parse and evaluate in one go.
pub fn evaluate(text: &str, context: &[u32]) -> Result<Number, ExpressionError> {
    Expr::parse(text)?.eval(context)
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(Number),
    Ident(String),
    Op(BinaryOp),
    LParen,
    RParen,
    LBracket,
    RBracket,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    text: String,
    column: usize,
}

impl Token {
    fn unexpected(&self) -> ExpressionError {
        ExpressionError::UnexpectedToken {
            found: self.text.clone(),
            column: self.column,
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let ch = chars[pos];
        let column = pos + 1;
        if ch.is_whitespace() {
            pos += 1;
            continue;
        }

        if ch.is_ascii_digit() || ch == '.' {
            let start = pos;
            while pos < chars.len() && (chars[pos].is_ascii_digit() || chars[pos] == '.') {
                pos += 1;
            }
            let literal: String = chars[start..pos].iter().collect();
            let value = if literal.contains('.') {
                literal
                    .parse::<f64>()
                    .map(Number::Float)
                    .map_err(|_| ExpressionError::InvalidNumber(literal.clone()))?
            } else {
                literal
                    .parse::<i64>()
                    .map(Number::Int)
                    .map_err(|_| ExpressionError::InvalidNumber(literal.clone()))?
            };
            tokens.push(Token {
                kind: TokenKind::Number(value),
                text: literal,
                column,
            });
            continue;
        }

        if ch.is_ascii_alphabetic() || ch == '_' {
            let start = pos;
            while pos < chars.len() && (chars[pos].is_ascii_alphanumeric() || chars[pos] == '_') {
                pos += 1;
            }
            let name: String = chars[start..pos].iter().collect();
            tokens.push(Token {
                kind: TokenKind::Ident(name.clone()),
                text: name,
                column,
            });
            continue;
        }

        let kind = match ch {
            '+' => TokenKind::Op(BinaryOp::Add),
            '-' => TokenKind::Op(BinaryOp::Sub),
            '*' => TokenKind::Op(BinaryOp::Mul),
            '/' => TokenKind::Op(BinaryOp::Div),
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            _ => return Err(ExpressionError::UnexpectedChar { ch, column }),
        };
        tokens.push(Token {
            kind,
            text: ch.to_string(),
            column,
        });
        pos += 1;
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<&'a Token, ExpressionError> {
        let token = self.tokens.get(self.pos).ok_or(ExpressionError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<(), ExpressionError> {
        let token = self.next()?;
        if &token.kind == kind {
            Ok(())
        } else {
            Err(token.unexpected())
        }
    }

    fn descend(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            Err(ExpressionError::TooDeep)
        } else {
            Ok(())
        }
    }

    fn expr(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.term()?;
        while let Some(Token {
            kind: TokenKind::Op(op @ (BinaryOp::Add | BinaryOp::Sub)),
            ..
        }) = self.peek()
        {
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op: *op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.unary()?;
        while let Some(Token {
            kind: TokenKind::Op(op @ (BinaryOp::Mul | BinaryOp::Div)),
            ..
        }) = self.peek()
        {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op: *op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Op(BinaryOp::Sub)) => {
                self.pos += 1;
                self.descend()?;
                let inner = self.unary()?;
                self.depth -= 1;
                Ok(match inner {
                    Expr::Literal(Number::Int(v)) => Expr::Literal(Number::Int(-v)),
                    Expr::Literal(Number::Float(v)) => Expr::Literal(Number::Float(-v)),
                    other => Expr::Neg(Box::new(other)),
                })
            }
            Some(TokenKind::Op(BinaryOp::Add)) => {
                self.pos += 1;
                self.descend()?;
                let inner = self.unary()?;
                self.depth -= 1;
                Ok(inner)
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let token = self.next()?;
        match &token.kind {
            TokenKind::Number(n) => Ok(Expr::Literal(*n)),
            TokenKind::LParen => {
                self.descend()?;
                let inner = self.expr()?;
                self.expect(&TokenKind::RParen)?;
                self.depth -= 1;
                Ok(inner)
            }
            TokenKind::Ident(name) if name == "i" => {
                match self.peek() {
                    Some(Token {
                        kind: TokenKind::LBracket,
                        ..
                    }) => self.pos += 1,
                    _ => return Err(ExpressionError::BareIteration),
                }
                let index_token = self.next()?;
                let index = match &index_token.kind {
                    TokenKind::Number(Number::Int(v)) => usize::try_from(*v)
                        .map_err(|_| ExpressionError::InvalidNumber(index_token.text.clone()))?,
                    _ => return Err(index_token.unexpected()),
                };
                self.expect(&TokenKind::RBracket)?;
                Ok(Expr::Iteration(index))
            }
            TokenKind::Ident(name) => Err(ExpressionError::UnknownIdentifier(name.clone())),
            _ => Err(token.unexpected()),
        }
    }
}

/// A check that failed for one particular iteration tuple.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}", describe_failure(.message, .iteration))]
pub struct IterationFailure {
    /// Iteration tuple, innermost first.
    pub iteration: Vec<u32>,
    /// What went wrong.
    pub message: String,
}

fn describe_failure(message: &str, iteration: &[u32]) -> String {
    if iteration.is_empty() {
        message.to_string()
    } else {
        format!("{message} (at {})", format_iteration(iteration))
    }
}

/// Render an iteration tuple as `i[0] = 1, i[1] = 2`.
pub fn format_iteration(iteration: &[u32]) -> String {
    iteration
        .iter()
        .enumerate()
        .map(|(index, value)| format!("i[{index}] = {value}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Most iteration tuples a single check will enumerate.
pub const MAX_ITERATION_TUPLES: u64 = 1_000_000;

/// Visit every iteration tuple implied by nested loop counts.
///
/// `counts[0]` is the innermost loop; index 0 varies fastest. Stops at the
/// first tuple for which `visit` fails. Nests with more than
/// [`MAX_ITERATION_TUPLES`] tuples fail up front without visiting any.
pub fn for_each_iteration<F>(counts: &[u32], mut visit: F) -> Result<(), IterationFailure>
where
    F: FnMut(&[u32]) -> Result<(), String>,
{
    if counts.iter().any(|&c| c == 0) {
        return Ok(());
    }
    let total = counts
        .iter()
        .try_fold(1u64, |acc, &c| acc.checked_mul(u64::from(c)))
        .filter(|&total| total <= MAX_ITERATION_TUPLES);
    if total.is_none() {
        return Err(IterationFailure {
            iteration: Vec::new(),
            message: format!(
                "The enclosing loops repeat this step more than {MAX_ITERATION_TUPLES} times, \
                 too many to check. Use fewer iterations or a fixed value."
            ),
        });
    }
    let mut current = vec![1u32; counts.len()];
    loop {
        visit(&current).map_err(|message| IterationFailure {
            iteration: current.clone(),
            message,
        })?;

        let mut level = 0;
        loop {
            if level == counts.len() {
                return Ok(());
            }
            if current[level] < counts[level] {
                current[level] += 1;
                break;
            }
            current[level] = 1;
            level += 1;
        }
    }
}

/// Evaluate `expr` at every iteration tuple and apply `checker` to each value.
pub fn validate_for_all_iterations<F>(
    expr: &Expr,
    counts: &[u32],
    mut checker: F,
) -> Result<(), IterationFailure>
where
    F: FnMut(Number) -> Result<(), String>,
{
    for_each_iteration(counts, |iteration| {
        let value = expr.eval(iteration).map_err(|e| e.to_string())?;
        checker(value)
    })
}
