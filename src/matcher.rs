use std::collections::HashMap;

use regex::RegexBuilder;
use serde_json::{Map, Value};
use tracing::debug;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use crate::error::FlowError;
use crate::models::flow::{Action, Block, Condition, ConditionOp};
use crate::template::{lookup, render};

/// Separator between alternatives inside a condition value.
pub const VALUE_SEPARATOR: char = '|';

/// Lowercases, trims and strips diacritics.
pub fn normalize(input: &str) -> String {
    input
        .trim()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
}

/// Evaluates a condition list as a conjunction. Empty lists pass; a list with an
/// unrecognized operator fails as a whole.
pub fn evaluate(conditions: &[Condition], vars: &Map<String, Value>) -> bool {
    if let Some(c) = conditions.iter().find(|c| c.op == ConditionOp::Unknown) {
        let e = FlowError::ConditionEvaluation {
            variable: c.variable.clone(),
            reason: "unknown operator".into(),
        };
        debug!(error = %e, "Condition list fails as a whole");
        return false;
    }
    conditions.iter().all(|c| evaluate_one(c, vars))
}

fn evaluate_one(condition: &Condition, vars: &Map<String, Value>) -> bool {
    let actual = lookup(vars, &condition.variable).filter(|v| !is_blank(v));

    match condition.op {
        ConditionOp::Exists => actual.is_some(),
        ConditionOp::NotExists => actual.is_none(),
        ConditionOp::GreaterThan | ConditionOp::LessThan => {
            let (Some(lhs), Some(rhs)) = (actual.and_then(as_number), as_number(&condition.value))
            else {
                return false;
            };
            if condition.op == ConditionOp::GreaterThan {
                lhs > rhs
            } else {
                lhs < rhs
            }
        }
        ConditionOp::Regex => {
            let actual = actual.map(render).unwrap_or_default();
            matches_regex(&condition.variable, &render(&condition.value), &actual)
        }
        ConditionOp::Unknown => false,
        op => {
            let actual = normalize(&actual.map(render).unwrap_or_default());
            let alternatives = alternatives(&condition.value);
            if alternatives.is_empty() {
                return op.is_negated();
            }
            let hit = |expected: &String| match op {
                ConditionOp::Equals | ConditionOp::NotEquals => actual == *expected,
                ConditionOp::Contains | ConditionOp::NotContains => actual.contains(expected.as_str()),
                ConditionOp::StartsWith => actual.starts_with(expected.as_str()),
                ConditionOp::EndsWith => actual.ends_with(expected.as_str()),
                _ => false,
            };
            if op.is_negated() {
                !alternatives.iter().any(hit)
            } else {
                alternatives.iter().any(hit)
            }
        }
    }
}

/// Normalized alternatives of a condition value. Arrays list alternatives
/// directly; strings split on `|`.
fn alternatives(value: &Value) -> Vec<String> {
    let raw: Vec<String> = match value {
        Value::Array(items) => items.iter().map(render).collect(),
        Value::Null => Vec::new(),
        other => render(other)
            .split(VALUE_SEPARATOR)
            .map(str::to_string)
            .collect(),
    };
    raw.iter()
        .map(|s| normalize(s))
        .filter(|s| !s.is_empty())
        .collect()
}

/// Case-insensitive match against the raw text and its diacritic-free form.
/// The pattern keeps its own `|` alternation. Invalid patterns never match.
fn matches_regex(variable: &str, pattern: &str, actual: &str) -> bool {
    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(re) => re.is_match(actual) || re.is_match(&normalize(actual)),
        Err(e) => {
            let e = FlowError::ConditionEvaluation {
                variable: variable.to_string(),
                reason: e.to_string(),
            };
            debug!(pattern, error = %e, "Invalid regex in condition");
            false
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// First action whose conditions hold, in declared order.
pub fn find_action<'a>(actions: &'a [Action], vars: &Map<String, Value>) -> Option<&'a Action> {
    actions.iter().find(|a| evaluate(&a.conditions, vars))
}

/// Option id <-> title aliases declared by an interactive block.
#[derive(Debug, Default)]
pub struct ReplyAliases {
    id_to_title: HashMap<String, String>,
    title_to_id: HashMap<String, String>,
}

impl ReplyAliases {
    /// Collects buttons and list rows from WhatsApp-style interactive content.
    pub fn from_block(block: &Block) -> Self {
        let mut aliases = ReplyAliases::default();
        let action = block.content.get("action");

        let buttons = action
            .and_then(|a| a.get("buttons"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .map(|b| b.get("reply").unwrap_or(b));

        let rows = action
            .and_then(|a| a.get("sections"))
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|s| s.get("rows").and_then(Value::as_array))
            .flatten();

        for option in buttons.chain(rows) {
            let id = option.get("id").and_then(Value::as_str);
            let title = option.get("title").and_then(Value::as_str);
            if let (Some(id), Some(title)) = (id, title) {
                aliases.insert(id, title);
            }
        }
        aliases
    }

    fn insert(&mut self, id: &str, title: &str) {
        self.id_to_title.insert(normalize(id), title.to_string());
        self.title_to_id.insert(normalize(title), id.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_title.is_empty()
    }

    pub fn title_for(&self, id: &str) -> Option<&str> {
        self.id_to_title.get(&normalize(id)).map(String::as_str)
    }

    pub fn id_for(&self, title: &str) -> Option<&str> {
        self.title_to_id.get(&normalize(title)).map(String::as_str)
    }
}

/// Candidate texts tried in order for a reply to an interactive block: raw
/// text, reply id, reply title, their normalized forms, then alias lookups.
pub fn reply_candidates(
    text: Option<&str>,
    reply_id: Option<&str>,
    reply_title: Option<&str>,
    aliases: &ReplyAliases,
) -> Vec<String> {
    let primary: Vec<&str> = [text, reply_id, reply_title]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let mut candidates: Vec<String> = Vec::new();
    let mut push = |c: String| {
        if !c.is_empty() && !candidates.contains(&c) {
            candidates.push(c);
        }
    };
    for c in &primary {
        push(c.to_string());
    }
    for c in &primary {
        push(normalize(c));
    }
    for c in &primary {
        if let Some(title) = aliases.title_for(c) {
            push(title.to_string());
        }
        if let Some(id) = aliases.id_for(c) {
            push(id.to_string());
        }
    }
    candidates
}

/// Tries each candidate as `lastUserMessage` and returns the first action that
/// matches along with the candidate that matched it.
pub fn find_action_fuzzy<'a>(
    actions: &'a [Action],
    vars: &Map<String, Value>,
    candidates: &[String],
) -> Option<(&'a Action, String)> {
    for candidate in candidates {
        let mut bag = vars.clone();
        bag.insert("lastUserMessage".into(), Value::String(candidate.clone()));
        if let Some(action) = find_action(actions, &bag) {
            return Some((action, candidate.clone()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::flow::Block;
    use serde_json::json;

    fn cond(op: &str, variable: &str, value: Value) -> Condition {
        serde_json::from_value(json!({"type": op, "variable": variable, "value": value})).unwrap()
    }

    fn bag(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn empty_conditions_pass() {
        assert!(evaluate(&[], &bag(json!({}))));
    }

    #[test]
    fn equals_is_case_and_accent_insensitive() {
        let c = cond("equals", "x", json!("Sí"));
        assert!(evaluate(&[c.clone()], &bag(json!({"x": "SI"}))));
        assert!(!evaluate(&[c], &bag(json!({"x": "no"}))));
    }

    #[test]
    fn multi_value_or_and_negated_and() {
        let eq = cond("equals", "x", json!("a|b"));
        let ne = cond("not_equals", "x", json!("a|b"));
        for (x, expect_eq) in [("a", true), ("B", true), ("c", false)] {
            let vars = bag(json!({ "x": x }));
            assert_eq!(evaluate(&[eq.clone()], &vars), expect_eq, "equals {x}");
            assert_eq!(evaluate(&[ne.clone()], &vars), !expect_eq, "not_equals {x}");
        }
    }

    #[test]
    fn contains_and_affixes() {
        let vars = bag(json!({"msg": "Quero saber o Preço"}));
        assert!(evaluate(&[cond("contains", "msg", json!("preco|valor"))], &vars));
        assert!(evaluate(&[cond("not_contains", "msg", json!("cancelar|sair"))], &vars));
        assert!(!evaluate(&[cond("not_contains", "msg", json!("sair|preço"))], &vars));
        assert!(evaluate(&[cond("starts_with", "msg", json!("quero"))], &vars));
        assert!(evaluate(&[cond("ends_with", "msg", json!("preco"))], &vars));
    }

    #[test]
    fn exists_and_not_exists() {
        let vars = bag(json!({"a": "x", "blank": "  ", "nested": {"b": 1}}));
        assert!(evaluate(&[cond("exists", "a", Value::Null)], &vars));
        assert!(evaluate(&[cond("exists", "nested.b", Value::Null)], &vars));
        assert!(evaluate(&[cond("not_exists", "blank", Value::Null)], &vars));
        assert!(evaluate(&[cond("not_exists", "missing", Value::Null)], &vars));
    }

    #[test]
    fn numeric_comparisons_never_throw() {
        let vars = bag(json!({"age": "21", "score": 3.5, "name": "abc"}));
        assert!(evaluate(&[cond("greater_than", "age", json!("18"))], &vars));
        assert!(evaluate(&[cond("less_than", "score", json!(4))], &vars));
        assert!(!evaluate(&[cond("greater_than", "name", json!(1))], &vars));
        assert!(!evaluate(&[cond("less_than", "missing", json!(1))], &vars));
        assert!(!evaluate(&[cond("less_than", "age", json!("abc"))], &vars));
    }

    #[test]
    fn regex_matching() {
        let vars = bag(json!({"cpf": "123.456.789-00", "msg": "Olá"}));
        assert!(evaluate(&[cond("regex", "cpf", json!(r"^\d{3}\.\d{3}\.\d{3}-\d{2}$"))], &vars));
        assert!(evaluate(&[cond("regex", "msg", json!("^(oi|ola)$"))], &vars));
        assert!(!evaluate(&[cond("regex", "msg", json!("(unclosed"))], &vars));
    }

    #[test]
    fn unknown_operator_fails_whole_list() {
        let vars = bag(json!({"x": "1"}));
        let list = vec![cond("equals", "x", json!("1")), cond("fuzzy", "x", json!("1"))];
        assert!(!evaluate(&list, &vars));
    }

    #[test]
    fn first_matching_action_wins() {
        let actions: Vec<Action> = serde_json::from_value(json!([
            {"conditions": [{"type": "equals", "variable": "x", "value": "2"}], "next": "pricing"},
            {"conditions": [], "next": "catch_all"}
        ]))
        .unwrap();
        assert_eq!(find_action(&actions, &bag(json!({"x": "2"}))).unwrap().next, "pricing");
        assert_eq!(find_action(&actions, &bag(json!({"x": "9"}))).unwrap().next, "catch_all");
    }

    #[test]
    fn interactive_aliases_resolve_titles_and_ids() {
        let block: Block = serde_json::from_value(json!({
            "type": "interactive",
            "content": {
                "type": "button",
                "body": {"text": "Pick one"},
                "action": {"buttons": [
                    {"type": "reply", "reply": {"id": "opt_price", "title": "Preços"}},
                    {"type": "reply", "reply": {"id": "opt_human", "title": "Atendente"}}
                ]}
            },
            "awaitResponse": true
        }))
        .unwrap();
        let aliases = ReplyAliases::from_block(&block);
        assert_eq!(aliases.title_for("OPT_PRICE"), Some("Preços"));
        assert_eq!(aliases.id_for("precos"), Some("opt_price"));

        let actions: Vec<Action> = serde_json::from_value(json!([
            {"conditions": [{"type": "equals", "variable": "lastUserMessage", "value": "opt_human"}], "next": "human"}
        ]))
        .unwrap();

        // Client echoed the label instead of the id.
        let candidates = reply_candidates(Some("Atendente"), None, None, &aliases);
        let (action, matched) = find_action_fuzzy(&actions, &bag(json!({})), &candidates).unwrap();
        assert_eq!(action.next, "human");
        assert_eq!(matched, "opt_human");
    }

    #[test]
    fn list_rows_are_aliased() {
        let block: Block = serde_json::from_value(json!({
            "type": "interactive",
            "content": {"type": "list", "action": {"button": "Menu", "sections": [
                {"title": "Main", "rows": [{"id": "r1", "title": "Billing"}]}
            ]}}
        }))
        .unwrap();
        let aliases = ReplyAliases::from_block(&block);
        assert!(!aliases.is_empty());
        assert_eq!(aliases.title_for("r1"), Some("Billing"));
    }
}
