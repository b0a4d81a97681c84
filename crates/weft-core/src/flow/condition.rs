//! Comparison-only condition evaluator.
//!
//! Grammar:
//!
//! ```text
//! condition := path op value
//! path      := "$" | "$." key ("." key)*
//! op        := "==" | "!=" | ">=" | "<=" | ">" | "<"
//! value     := 'quoted' | "quoted" | number | true | false | null | bare-word
//! ```
//!
//! Missing paths read as `null`. Ordering operators compare numbers
//! numerically and strings lexicographically; any other pairing is false.

use std::cmp::Ordering;

use serde_json::Value;
use thiserror::Error;

use super::path::get_path;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConditionError {
    #[error("empty condition")]
    Empty,

    #[error("no comparison operator in '{0}'")]
    MissingOperator(String),

    #[error("left side of '{0}' must be a '$' path")]
    InvalidPath(String),

    #[error("missing right-hand value in '{0}'")]
    MissingValue(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

/// A parsed `$.path <op> value` condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub path: String,
    pub op: CompareOp,
    pub value: Value,
}

impl Condition {
    pub fn parse(expr: &str) -> Result<Self, ConditionError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(ConditionError::Empty);
        }

        let (pos, op, op_len) =
            find_operator(expr).ok_or_else(|| ConditionError::MissingOperator(expr.to_string()))?;

        let path = expr[..pos].trim();
        if !(path == "$" || path.starts_with("$.")) {
            return Err(ConditionError::InvalidPath(expr.to_string()));
        }

        let raw = expr[pos + op_len..].trim();
        if raw.is_empty() {
            return Err(ConditionError::MissingValue(expr.to_string()));
        }

        Ok(Self {
            path: path.to_string(),
            op,
            value: parse_literal(raw),
        })
    }

    pub fn evaluate(&self, context: &Value) -> bool {
        let actual = get_path(context, &self.path).unwrap_or(&Value::Null);
        compare(actual, self.op, &self.value)
    }
}

/// Parse and evaluate in one go.
pub fn evaluate(expr: &str, context: &Value) -> Result<bool, ConditionError> {
    Ok(Condition::parse(expr)?.evaluate(context))
}

fn find_operator(expr: &str) -> Option<(usize, CompareOp, usize)> {
    let bytes = expr.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        let next = bytes.get(i + 1).copied();
        let found = match (b, next) {
            (b'=', Some(b'=')) => Some((CompareOp::Eq, 2)),
            (b'!', Some(b'=')) => Some((CompareOp::Ne, 2)),
            (b'>', Some(b'=')) => Some((CompareOp::Ge, 2)),
            (b'<', Some(b'=')) => Some((CompareOp::Le, 2)),
            (b'>', _) => Some((CompareOp::Gt, 1)),
            (b'<', _) => Some((CompareOp::Lt, 1)),
            _ => None,
        };
        if let Some((op, len)) = found {
            return Some((i, op, len));
        }
    }
    None
}

fn parse_literal(raw: &str) -> Value {
    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return Value::String(raw[1..raw.len() - 1].to_string());
        }
    }
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}

fn compare(actual: &Value, op: CompareOp, expected: &Value) -> bool {
    match op {
        CompareOp::Eq => loosely_equal(actual, expected),
        CompareOp::Ne => !loosely_equal(actual, expected),
        _ => match ordering(actual, expected) {
            Some(ord) => match op {
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Ge => ord != Ordering::Less,
                CompareOp::Le => ord != Ordering::Greater,
                CompareOp::Eq | CompareOp::Ne => false,
            },
            None => false,
        },
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn ordering(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
