//! `${expr}` interpolation for action parameters.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

use crate::programs::expressions::{Environment, ExpressionError, ExpressionEvaluator};

fn placeholder() -> Result<&'static Regex, ExpressionError> {
    static PLACEHOLDER: OnceLock<Result<Regex, String>> = OnceLock::new();
    PLACEHOLDER
        .get_or_init(|| Regex::new(r"\$\{([^}]*)\}").map_err(|err| err.to_string()))
        .as_ref()
        .map_err(|err| ExpressionError::Parse(format!("invalid placeholder pattern: {err}")))
}

pub fn has_placeholders(text: &str) -> bool {
    placeholder().map(|re| re.is_match(text)).unwrap_or(false)
}

/// Expressions referenced by placeholders in `text`.
pub fn placeholders(text: &str) -> Vec<&str> {
    let Ok(regex) = placeholder() else {
        return Vec::new();
    };
    regex
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .collect()
}

/// Renders every string inside `value`. A string made of exactly one
/// placeholder takes the typed value of its expression.
pub fn render_value(
    value: &Value,
    evaluator: &ExpressionEvaluator,
    env: &Environment<'_>,
) -> Result<Value, ExpressionError> {
    match value {
        Value::String(text) => render_string(text, evaluator, env),
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(item, evaluator, env))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut rendered = Map::with_capacity(map.len());
            for (key, item) in map {
                rendered.insert(key.clone(), render_value(item, evaluator, env)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

fn render_string(
    text: &str,
    evaluator: &ExpressionEvaluator,
    env: &Environment<'_>,
) -> Result<Value, ExpressionError> {
    let regex = placeholder()?;
    if !regex.is_match(text) {
        return Ok(Value::String(text.to_owned()));
    }

    if let Some(caps) = regex.captures(text) {
        if let Some(whole) = caps.get(0) {
            if whole.start() == 0 && whole.end() == text.len() {
                let expression = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                return evaluator.evaluate(expression, env);
            }
        }
    }

    let mut rendered = String::with_capacity(text.len());
    let mut last = 0;
    for caps in regex.captures_iter(text) {
        let (Some(whole), Some(expression)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        rendered.push_str(&text[last..whole.start()]);
        let value = evaluator.evaluate(expression.as_str(), env)?;
        rendered.push_str(&value_to_string(&value));
        last = whole.end();
    }
    rendered.push_str(&text[last..]);
    Ok(Value::String(rendered))
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
