//! Condition Evaluation
//!
//! Pre/post conditions are small predicates over a JSON subject:
//!
//! ```text
//! $.promotion.enabled                  truthy
//! $.promotion.id exists
//! $.promotion.id not exists
//! $.items is empty
//! $.items is not empty
//! $.totalItems == 0
//! $.promotion.name contains "Summer"
//! ```
//!
//! Comparison literals are JSON (`"text"`, `3`, `true`, `null`, `[1]`).

use std::cmp::Ordering;

use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use super::model::Condition;
use super::path::JsonPath;

static COMPARISON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([^\s=!<>]+)\s*(==|!=|>=|<=|>|<)\s*(.+)$").expect("comparison pattern is valid")
});

static CONTAINS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\S+)\s+contains\s+(.+)$").expect("contains pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("invalid check '{check}': {reason}")]
    Syntax { check: String, reason: String },

    #[error("path '{path}' not found in condition subject")]
    PathNotFound { path: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Truthy,
    Exists,
    NotExists,
    Empty,
    NotEmpty,
    Compare(CompareOp, Value),
}

/// A parsed check expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Check {
    pub path: JsonPath,
    pub predicate: Predicate,
}

impl Check {
    pub fn parse(text: &str) -> Result<Self, ConditionError> {
        let text = text.trim();
        let syntax = |reason: String| ConditionError::Syntax {
            check: text.to_string(),
            reason,
        };
        let path = |raw: &str| JsonPath::parse(raw).map_err(|e| syntax(e.to_string()));

        if text.is_empty() {
            return Err(syntax("check is empty".into()));
        }

        let keyword_forms = [
            (" is not empty", Predicate::NotEmpty),
            (" is empty", Predicate::Empty),
            (" not exists", Predicate::NotExists),
            (" exists", Predicate::Exists),
        ];
        for (suffix, predicate) in keyword_forms {
            if let Some(head) = text.strip_suffix(suffix) {
                return Ok(Self {
                    path: path(head)?,
                    predicate,
                });
            }
        }

        let (raw_path, op, literal) = if let Some(caps) = CONTAINS.captures(text) {
            (caps[1].to_string(), CompareOp::Contains, caps[2].to_string())
        } else if let Some(caps) = COMPARISON.captures(text) {
            let op = match &caps[2] {
                "==" => CompareOp::Eq,
                "!=" => CompareOp::Ne,
                ">=" => CompareOp::Ge,
                "<=" => CompareOp::Le,
                ">" => CompareOp::Gt,
                _ => CompareOp::Lt,
            };
            (caps[1].to_string(), op, caps[3].to_string())
        } else {
            if text.contains(char::is_whitespace) {
                return Err(syntax("expected '<path> <op> <literal>' or a keyword form".into()));
            }
            return Ok(Self {
                path: path(text)?,
                predicate: Predicate::Truthy,
            });
        };

        let value: Value = serde_json::from_str(literal.trim())
            .map_err(|_| syntax(format!("'{}' is not a JSON literal", literal.trim())))?;

        Ok(Self {
            path: path(&raw_path)?,
            predicate: Predicate::Compare(op, value),
        })
    }

    /// Evaluates against a subject, failing when a required path is absent.
    ///
    /// `exists` and `not exists` never fail.
    pub fn evaluate(&self, subject: &Value) -> Result<bool, ConditionError> {
        let found = self.path.lookup(subject);

        match (&self.predicate, found) {
            (Predicate::Exists, found) => Ok(found.is_some()),
            (Predicate::NotExists, found) => Ok(found.is_none()),
            (_, None) => Err(ConditionError::PathNotFound {
                path: self.path.to_string(),
            }),
            (Predicate::Truthy, Some(v)) => Ok(is_truthy(v)),
            (Predicate::Empty, Some(v)) => Ok(is_empty(v)),
            (Predicate::NotEmpty, Some(v)) => Ok(!is_empty(v)),
            (Predicate::Compare(op, literal), Some(v)) => Ok(compare(*op, v, literal)),
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        other => !is_empty(other),
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
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

fn compare(op: CompareOp, actual: &Value, literal: &Value) -> bool {
    match op {
        CompareOp::Eq => loosely_equal(actual, literal),
        CompareOp::Ne => !loosely_equal(actual, literal),
        CompareOp::Gt => ordering(actual, literal) == Some(Ordering::Greater),
        CompareOp::Ge => matches!(ordering(actual, literal), Some(Ordering::Greater | Ordering::Equal)),
        CompareOp::Lt => ordering(actual, literal) == Some(Ordering::Less),
        CompareOp::Le => matches!(ordering(actual, literal), Some(Ordering::Less | Ordering::Equal)),
        CompareOp::Contains => match (actual, literal) {
            (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|item| loosely_equal(item, needle)),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        },
    }
}

/// Evaluates a condition against its subject.
///
/// A missing path fails a critical condition with an error; a non-critical
/// one evaluates to false with a warning.
pub fn evaluate(condition: &Condition, subject: &Value) -> Result<bool, ConditionError> {
    let check = Check::parse(&condition.check)?;

    match check.evaluate(subject) {
        Err(ConditionError::PathNotFound { path }) if !condition.critical => {
            warn!(
                "Condition '{}': path '{}' not found, treating as false",
                condition.id, path
            );
            Ok(false)
        }
        other => other,
    }
}
