//! Template Resolution
//!
//! Resolves `{{...}}` placeholders inside step payloads against a run's
//! data. The grammar is closed:
//!
//! ```text
//! template   := "{{" reference [ arith number ] ( "|" filter )* "}}"
//! reference  := "inputs." name ( "." key )*
//!             | "steps." id ".outputs." name ( "." key )*
//!             | "env." NAME
//! arith      := "*" | "/" | "+" | "-"
//! filter     := "string" | "number" | "upper" | "lower" | "trim" | "json"
//! ```
//!
//! A string that is exactly one template resolves to the referenced JSON
//! value (type preserved). Templates embedded in longer text are
//! stringified.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Number, Value};
use thiserror::Error;

use super::path::JsonPath;

/// Reference plus optional arithmetic, captured from the part before any `|`.
static HEAD_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*(?:([*/+\-])\s*(-?\d+(?:\.\d+)?))?\s*$",
    )
    .expect("template head pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TemplateError {
    #[error("unresolved reference '{reference}'")]
    Unresolved { reference: String },

    #[error("invalid template '{template}': {reason}")]
    Syntax { template: String, reason: String },

    #[error("cannot apply '{operation}' to '{reference}': {reason}")]
    Type {
        reference: String,
        operation: String,
        reason: String,
    },
}

fn syntax(template: &str, reason: impl Into<String>) -> TemplateError {
    TemplateError::Syntax {
        template: template.to_string(),
        reason: reason.into(),
    }
}

/// What a template points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    Input { name: String, path: Vec<String> },
    StepOutput { step: String, name: String, path: Vec<String> },
    Env(String),
}

impl Reference {
    fn parse(dotted: &str, template: &str) -> Result<Self, TemplateError> {
        let parts: Vec<&str> = dotted.split('.').collect();
        let rest = |from: usize| parts[from..].iter().map(|s| s.to_string()).collect();

        match parts[0] {
            "inputs" if parts.len() >= 2 => Ok(Self::Input {
                name: parts[1].to_string(),
                path: rest(2),
            }),
            "steps" if parts.len() >= 4 && parts[2] == "outputs" => Ok(Self::StepOutput {
                step: parts[1].to_string(),
                name: parts[3].to_string(),
                path: rest(4),
            }),
            "env" if parts.len() == 2 => Ok(Self::Env(parts[1].to_string())),
            "inputs" => Err(syntax(template, "expected inputs.<name>")),
            "steps" => Err(syntax(template, "expected steps.<id>.outputs.<name>")),
            "env" => Err(syntax(template, "expected env.<NAME>")),
            other => Err(syntax(
                template,
                format!("unknown reference root '{}' (use inputs, steps or env)", other),
            )),
        }
    }

    /// Step id this reference depends on, if any.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::StepOutput { step, .. } => Some(step),
            _ => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = |path: &[String]| {
            path.iter().map(|p| format!(".{}", p)).collect::<String>()
        };
        match self {
            Self::Input { name, path } => write!(f, "inputs.{}{}", name, suffix(path)),
            Self::StepOutput { step, name, path } => {
                write!(f, "steps.{}.outputs.{}{}", step, name, suffix(path))
            }
            Self::Env(name) => write!(f, "env.{}", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Arith {
    Mul,
    Div,
    Add,
    Sub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    String,
    Number,
    Upper,
    Lower,
    Trim,
    Json,
}

impl Filter {
    fn parse(name: &str, template: &str) -> Result<Self, TemplateError> {
        match name {
            "string" => Ok(Self::String),
            "number" => Ok(Self::Number),
            "upper" => Ok(Self::Upper),
            "lower" => Ok(Self::Lower),
            "trim" => Ok(Self::Trim),
            "json" => Ok(Self::Json),
            other => Err(syntax(template, format!("unsupported filter '{}'", other))),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Upper => "upper",
            Self::Lower => "lower",
            Self::Trim => "trim",
            Self::Json => "json",
        }
    }
}

/// One parsed `{{...}}` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub reference: Reference,
    pub arith: Option<(Arith, f64)>,
    pub filters: Vec<Filter>,
}

impl Expression {
    fn parse(inner: &str) -> Result<Self, TemplateError> {
        let template = format!("{{{{{}}}}}", inner);
        let mut pieces = inner.split('|');
        let head = pieces.next().unwrap_or_default();

        let caps = HEAD_PATTERN
            .captures(head)
            .ok_or_else(|| syntax(&template, "expected a reference with an optional arithmetic operator"))?;

        let reference = Reference::parse(&caps[1], &template)?;
        let arith = match (caps.get(2), caps.get(3)) {
            (Some(op), Some(num)) => {
                let op = match op.as_str() {
                    "*" => Arith::Mul,
                    "/" => Arith::Div,
                    "+" => Arith::Add,
                    _ => Arith::Sub,
                };
                let operand = num
                    .as_str()
                    .parse::<f64>()
                    .map_err(|_| syntax(&template, "invalid numeric operand"))?;
                Some((op, operand))
            }
            _ => None,
        };

        let filters = pieces
            .map(|f| Filter::parse(f.trim(), &template))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            reference,
            arith,
            filters,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Literal(String),
    Expr(Expression),
}

fn split_parts(text: &str) -> Result<Vec<Part>, TemplateError> {
    let mut parts = Vec::new();
    let mut rest = text;

    loop {
        let Some(start) = rest.find("{{") else {
            if rest.contains("}}") {
                return Err(syntax(text, "unmatched '}}'"));
            }
            if !rest.is_empty() {
                parts.push(Part::Literal(rest.to_string()));
            }
            return Ok(parts);
        };

        let literal = &rest[..start];
        if literal.contains("}}") {
            return Err(syntax(text, "unmatched '}}'"));
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal.to_string()));
        }

        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| syntax(text, "unclosed '{{'"))?;
        let inner = &after[..end];
        if inner.contains("{{") {
            return Err(syntax(text, "nested templates are not supported"));
        }
        parts.push(Part::Expr(Expression::parse(inner)?));
        rest = &after[end + 2..];
    }
}

/// Data a template can be resolved against.
///
/// Implemented by the execution context; values are returned owned so
/// implementations may sit behind concurrent maps.
pub trait ReferenceSource {
    fn input(&self, name: &str) -> Option<Value>;
    fn step_output(&self, step_id: &str, name: &str) -> Option<Value>;
    fn env(&self, name: &str) -> Option<String>;
}

fn lookup(reference: &Reference, source: &dyn ReferenceSource) -> Option<Value> {
    let (base, path) = match reference {
        Reference::Input { name, path } => (source.input(name)?, path),
        Reference::StepOutput { step, name, path } => (source.step_output(step, name)?, path),
        Reference::Env(name) => return source.env(name).map(Value::String),
    };
    if path.is_empty() {
        return Some(base);
    }
    JsonPath::from_keys(path.iter().cloned()).lookup(&base).cloned()
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn number_value(n: f64) -> Option<Value> {
    // Trim binary float noise so 0.15 * 100 yields 15
    let n = if n.abs() < 1e9 { (n * 1e9).round() / 1e9 } else { n };
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Some(Value::Number(Number::from(n as i64)))
    } else {
        Number::from_f64(n).map(Value::Number)
    }
}

/// Exact `+`, `-` and `*` when both sides are integers that fit in `i64`.
fn integer_arith(value: &Value, op: Arith, operand: f64) -> Option<Value> {
    if operand.fract() != 0.0 || operand.abs() >= 9_007_199_254_740_992.0 {
        return None;
    }
    let base = value.as_i64()?;
    let operand = operand as i64;
    let result = match op {
        Arith::Add => base.checked_add(operand),
        Arith::Sub => base.checked_sub(operand),
        Arith::Mul => base.checked_mul(operand),
        Arith::Div => None,
    }?;
    Some(Value::Number(Number::from(result)))
}

fn evaluate(expr: &Expression, source: &dyn ReferenceSource) -> Result<Value, TemplateError> {
    let reference = expr.reference.to_string();
    let type_error = |operation: &str, reason: &str| TemplateError::Type {
        reference: reference.clone(),
        operation: operation.to_string(),
        reason: reason.to_string(),
    };

    let mut value = lookup(&expr.reference, source).ok_or_else(|| TemplateError::Unresolved {
        reference: reference.clone(),
    })?;

    if let Some((op, operand)) = expr.arith {
        value = match integer_arith(&value, op, operand) {
            Some(exact) => exact,
            None => {
                let base = as_number(&value).ok_or_else(|| type_error("arithmetic", "value is not numeric"))?;
                let result = match op {
                    Arith::Mul => base * operand,
                    Arith::Add => base + operand,
                    Arith::Sub => base - operand,
                    Arith::Div if operand == 0.0 => return Err(type_error("/", "division by zero")),
                    Arith::Div => base / operand,
                };
                number_value(result).ok_or_else(|| type_error("arithmetic", "result is not finite"))?
            }
        };
    }

    for filter in &expr.filters {
        value = match filter {
            Filter::String => Value::String(stringify(&value)),
            Filter::Number if value.is_i64() || value.is_u64() => value,
            Filter::Number => {
                let n = as_number(&value).ok_or_else(|| type_error("number", "value is not numeric"))?;
                number_value(n).ok_or_else(|| type_error("number", "value is not finite"))?
            }
            Filter::Upper => Value::String(stringify(&value).to_uppercase()),
            Filter::Lower => Value::String(stringify(&value).to_lowercase()),
            Filter::Trim => Value::String(stringify(&value).trim().to_string()),
            Filter::Json => Value::String(value.to_string()),
        };
        log::trace!("applied filter '{}' to {}", filter.name(), reference);
    }

    Ok(value)
}

/// Resolves every template in a string.
pub fn resolve_str(text: &str, source: &dyn ReferenceSource) -> Result<Value, TemplateError> {
    let parts = split_parts(text)?;

    if let [Part::Expr(expr)] = parts.as_slice() {
        return evaluate(expr, source);
    }

    let mut out = String::with_capacity(text.len());
    for part in &parts {
        match part {
            Part::Literal(s) => out.push_str(s),
            Part::Expr(expr) => out.push_str(&stringify(&evaluate(expr, source)?)),
        }
    }
    Ok(Value::String(out))
}

/// Resolves templates anywhere inside a JSON value.
///
/// # Example
///
/// ```
/// use std::collections::HashMap;
/// use opflow::workflow::template::{resolve, ReferenceSource};
/// use serde_json::{json, Value};
///
/// struct Inputs(HashMap<String, Value>);
///
/// impl ReferenceSource for Inputs {
///     fn input(&self, name: &str) -> Option<Value> { self.0.get(name).cloned() }
///     fn step_output(&self, _: &str, _: &str) -> Option<Value> { None }
///     fn env(&self, _: &str) -> Option<String> { None }
/// }
///
/// let source = Inputs(HashMap::from([("x".to_string(), json!("V"))]));
/// assert_eq!(resolve(&json!("{{inputs.x}}"), &source).unwrap(), json!("V"));
/// ```
pub fn resolve(value: &Value, source: &dyn ReferenceSource) -> Result<Value, TemplateError> {
    match value {
        Value::String(s) if s.contains("{{") || s.contains("}}") => resolve_str(s, source),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve(item, source))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                resolved.insert(key.clone(), resolve(item, source)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

/// Collects every reference in a JSON value without resolving anything.
///
/// Used by static validation; syntax outside the grammar is an error.
pub fn references(value: &Value) -> Result<Vec<Reference>, TemplateError> {
    let mut found = Vec::new();
    collect_references(value, &mut found)?;
    Ok(found)
}

fn collect_references(value: &Value, found: &mut Vec<Reference>) -> Result<(), TemplateError> {
    match value {
        Value::String(s) => {
            for part in split_parts(s)? {
                if let Part::Expr(expr) = part {
                    found.push(expr.reference);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_references(item, found)?;
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_references(item, found)?;
            }
        }
        _ => {}
    }
    Ok(())
}
