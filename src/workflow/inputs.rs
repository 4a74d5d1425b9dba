//! Runtime input checking.
//!
//! Matches the inputs supplied for a run against the declared parameter
//! specs, applies defaults and reports every violation at once.

use std::collections::HashMap;

use log::debug;
use regex::Regex;
use serde_json::{Map, Value};

use super::model::{InputRule, InputSpec, ParamSpec};

/// Checks provided inputs and returns the resolved input map.
///
/// Undeclared inputs are passed through untouched.
pub fn resolve_inputs(spec: &InputSpec, provided: &Map<String, Value>) -> Result<Map<String, Value>, Vec<String>> {
    let mut resolved = provided.clone();
    let mut problems = Vec::new();

    for (name, param) in &spec.required {
        match provided.get(name) {
            Some(Value::Null) | None => match &param.default {
                Some(default) => {
                    resolved.insert(name.clone(), default.clone());
                }
                None => problems.push(format!("missing required input '{}'", name)),
            },
            Some(value) => check_value(name, param, value, &mut problems),
        }
    }

    for (name, param) in &spec.optional {
        match provided.get(name) {
            Some(Value::Null) | None => {
                if let Some(default) = &param.default {
                    debug!("Input '{}' defaulted to {}", name, default);
                    resolved.insert(name.clone(), default.clone());
                }
            }
            Some(value) => check_value(name, param, value, &mut problems),
        }
    }

    if problems.is_empty() {
        Ok(resolved)
    } else {
        Err(problems)
    }
}

fn check_value(name: &str, param: &ParamSpec, value: &Value, problems: &mut Vec<String>) {
    if let Some(expected) = param.param_type {
        if !expected.accepts(value) {
            problems.push(format!(
                "input '{}' must be of type {:?}, got {}",
                name,
                expected,
                type_name(value)
            ));
            return;
        }
    }

    if let Some(rule) = &param.validation {
        check_rule(name, rule, value, problems);
    }
}

fn check_rule(name: &str, rule: &InputRule, value: &Value, problems: &mut Vec<String>) {
    if let Some(text) = value.as_str() {
        let length = text.chars().count();
        if let Some(min) = rule.min_length.filter(|&min| length < min) {
            problems.push(format!("input '{}' must be at least {} characters", name, min));
        }
        if let Some(max) = rule.max_length.filter(|&max| length > max) {
            problems.push(format!("input '{}' must be at most {} characters", name, max));
        }
        if let Some(pattern) = &rule.pattern {
            match compiled(pattern) {
                Ok(re) if !re.is_match(text) => {
                    problems.push(format!("input '{}' does not match pattern '{}'", name, pattern))
                }
                Ok(_) => {}
                Err(e) => problems.push(format!("input '{}' has an invalid pattern: {}", name, e)),
            }
        }
    }

    if let Some(items) = value.as_array() {
        if let Some(min) = rule.min_length.filter(|&min| items.len() < min) {
            problems.push(format!("input '{}' must have at least {} items", name, min));
        }
        if let Some(max) = rule.max_length.filter(|&max| items.len() > max) {
            problems.push(format!("input '{}' must have at most {} items", name, max));
        }
    }

    if let Some(number) = value.as_f64() {
        if let Some(min) = rule.minimum.filter(|&min| number < min) {
            problems.push(format!("input '{}' must be >= {}", name, min));
        }
        if let Some(max) = rule.maximum.filter(|&max| number > max) {
            problems.push(format!("input '{}' must be <= {}", name, max));
        }
    }

    if let Some(allowed) = &rule.allowed {
        if !allowed.contains(value) {
            problems.push(format!("input '{}' must be one of {}", name, Value::Array(allowed.clone())));
        }
    }
}

/// Compiles an input pattern, anchoring it to the whole value.
pub fn compiled(pattern: &str) -> Result<Regex, regex::Error> {
    thread_local! {
        static CACHE: std::cell::RefCell<HashMap<String, Regex>> = std::cell::RefCell::new(HashMap::new());
    }

    CACHE.with(|cache| {
        if let Some(re) = cache.borrow().get(pattern) {
            return Ok(re.clone());
        }
        let re = Regex::new(&format!("^(?:{})$", pattern))?;
        cache.borrow_mut().insert(pattern.to_string(), re.clone());
        Ok(re)
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::ParamType;
    use serde_json::json;

    fn spec() -> InputSpec {
        let mut spec = InputSpec::default();
        spec.required.insert(
            "promotion_name".into(),
            ParamSpec::new(ParamType::String).with_rule(InputRule {
                min_length: Some(3),
                max_length: Some(40),
                ..InputRule::default()
            }),
        );
        spec.required.insert(
            "discount".into(),
            ParamSpec::new(ParamType::Number).with_rule(InputRule {
                minimum: Some(0.0),
                maximum: Some(1.0),
                ..InputRule::default()
            }),
        );
        spec.optional.insert(
            "coupon_code".into(),
            ParamSpec::new(ParamType::String).with_rule(InputRule {
                pattern: Some("[A-Z0-9]+".into()),
                ..InputRule::default()
            }),
        );
        spec.optional.insert(
            "enabled".into(),
            ParamSpec::new(ParamType::Boolean).with_default(json!(true)),
        );
        spec
    }

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_valid_inputs_get_defaults() {
        let resolved = resolve_inputs(
            &spec(),
            &map(json!({ "promotion_name": "Summer", "discount": 0.15 })),
        )
        .unwrap();

        assert_eq!(resolved["enabled"], json!(true));
        assert_eq!(resolved["promotion_name"], json!("Summer"));
        assert!(!resolved.contains_key("coupon_code"));
    }

    #[test]
    fn test_every_problem_is_reported() {
        let problems = resolve_inputs(
            &spec(),
            &map(json!({ "discount": 2, "coupon_code": "lower-case" })),
        )
        .unwrap_err();

        assert_eq!(problems.len(), 3);
        assert!(problems.iter().any(|p| p.contains("missing required input 'promotion_name'")));
        assert!(problems.iter().any(|p| p.contains("<= 1")));
        assert!(problems.iter().any(|p| p.contains("pattern")));
    }

    #[test]
    fn test_type_mismatch() {
        let problems = resolve_inputs(
            &spec(),
            &map(json!({ "promotion_name": 12, "discount": 0.1 })),
        )
        .unwrap_err();
        assert_eq!(problems, vec!["input 'promotion_name' must be of type String, got number"]);
    }

    #[test]
    fn test_enum_rule() {
        let mut spec = InputSpec::default();
        spec.required.insert(
            "kind".into(),
            ParamSpec::new(ParamType::String).with_rule(InputRule {
                allowed: Some(vec![json!("percentage"), json!("fixed")]),
                ..InputRule::default()
            }),
        );

        assert!(resolve_inputs(&spec, &map(json!({ "kind": "fixed" }))).is_ok());
        assert!(resolve_inputs(&spec, &map(json!({ "kind": "other" }))).is_err());
    }

    #[test]
    fn test_pattern_is_anchored() {
        let re = compiled("[a-z]+").unwrap();
        assert!(re.is_match("abc"));
        assert!(!re.is_match("abc1"));
    }
}
