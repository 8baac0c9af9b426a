//! A single step field: literal value or expression over loop iterations.

use crate::expression::{Expr, ExpressionError, Number};

/// How expressions may reference loop iterations; appended to expression errors.
pub const NESTING_RULE: &str = "Expressions may refer to the iteration of the local loop as i[0], \
     i[1] for the iteration of the loop it is nested inside, or i[n] for the nth outer loop.";

/// Compiled form of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// Known before the run starts.
    Literal(Number),
    /// Evaluated at every invocation against the iteration context.
    Expression(Expr),
}

/// A field with its raw text and compiled value.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    raw: String,
    value: ParamValue,
}

impl Parameter {
    /// Compile `raw` for a step nested inside `depth` loops.
    ///
    /// Outside any loop only literals are accepted.
    pub fn compile(raw: &str, depth: usize) -> Result<Self, String> {
        let text = raw.trim();
        if text.is_empty() {
            return Err("Entry unfilled.".to_string());
        }
        if let Some(number) = Number::parse_literal(text) {
            return Ok(Self {
                raw: text.to_string(),
                value: ParamValue::Literal(number),
            });
        }
        if depth == 0 {
            let hint = match Expr::parse(text) {
                Err(ExpressionError::BareIteration) => {
                    format!(" {}", ExpressionError::BareIteration)
                }
                _ => String::new(),
            };
            return Err(format!(
                "'{text}' is not a number. Expressions are only allowed inside a loop.{hint}"
            ));
        }

        let expr = Expr::parse(text)
            .and_then(|expr| expr.check_depth(depth).map(|()| expr))
            .map_err(|e| format!("'{text}' is not a valid expression: {e}. {NESTING_RULE}"))?;
        Ok(Self {
            raw: text.to_string(),
            value: ParamValue::Expression(expr),
        })
    }

    /// Text as entered (trimmed).
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Compiled value.
    pub fn value(&self) -> &ParamValue {
        &self.value
    }

    /// True when the value depends on the iteration context.
    pub fn is_expression(&self) -> bool {
        matches!(self.value, ParamValue::Expression(_))
    }

    /// Literal value, if this is one.
    pub fn literal(&self) -> Option<Number> {
        match self.value {
            ParamValue::Literal(n) => Some(n),
            ParamValue::Expression(_) => None,
        }
    }

    /// Value for one invocation.
    pub fn resolve(&self, context: &[u32]) -> Result<Number, ExpressionError> {
        match &self.value {
            ParamValue::Literal(n) => Ok(*n),
            ParamValue::Expression(expr) => expr.eval(context),
        }
    }
}
