use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-\[\]]+)\s*\}\}").expect("placeholder pattern is valid")
});

/// Replaces every `{{path}}` in `input` with the value at `path` in `vars`.
/// Missing values render as the empty string.
pub fn substitute(input: &str, vars: &Map<String, Value>) -> String {
    if !input.contains("{{") {
        return input.to_string();
    }
    PLACEHOLDER
        .replace_all(input, |caps: &Captures| {
            lookup(vars, &caps[1]).map(render).unwrap_or_default()
        })
        .into_owned()
}

/// Substitutes placeholders in every string leaf of a JSON template.
///
/// Values are spliced into strings rather than into the serialized document, so
/// a substituted quote or brace never breaks the structure.
pub fn substitute_value(template: &Value, vars: &Map<String, Value>) -> Value {
    match template {
        Value::String(s) => Value::String(substitute(s, vars)),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute_value(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub fn has_placeholders(input: &str) -> bool {
    PLACEHOLDER.is_match(input)
}

/// Resolves a dotted path (`a.b.0.c`, `a.b[0]`) in the variable bag.
pub fn lookup<'a>(vars: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    if let Some(v) = vars.get(path) {
        return Some(v);
    }
    let normalized = path.replace('[', ".").replace(']', "");
    let mut segments = normalized.split('.').filter(|s| !s.is_empty());
    let mut current = vars.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Text form of a variable as it appears inside a rendered string.
pub fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}
