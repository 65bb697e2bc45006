//! Broker-side filter policy evaluation.
//!
//! A filter policy maps attribute names to rule lists. A message matches
//! when every named attribute satisfies at least one of its rules. An empty
//! policy matches everything.

use super::{NUMBER_TYPE, STRING_ARRAY_TYPE, STRING_TYPE, WireAttribute};
use serde_json::Value;
use std::collections::BTreeMap;

/// Does a message carrying `attributes` pass `policy`?
pub fn matches(policy: &Value, attributes: &BTreeMap<String, WireAttribute>) -> bool {
    let Some(rules_by_name) = policy.as_object() else {
        return true;
    };
    rules_by_name.iter().all(|(name, rules)| {
        let attribute = attributes.get(name);
        match rules.as_array() {
            Some(rules) => rules.iter().any(|rule| rule_matches(rule, attribute)),
            None => rule_matches(rules, attribute),
        }
    })
}

fn rule_matches(rule: &Value, attribute: Option<&WireAttribute>) -> bool {
    let values = candidates(attribute);
    match rule {
        Value::String(expected) => values.iter().any(|v| v.as_str() == Some(expected)),
        Value::Number(expected) => values
            .iter()
            .any(|v| v.as_f64().is_some() && v.as_f64() == expected.as_f64()),
        Value::Object(op) => {
            if let Some(exists) = op.get("exists").and_then(Value::as_bool) {
                return attribute.is_some() == exists;
            }
            if let Some(prefix) = op.get("prefix").and_then(Value::as_str) {
                return values
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|v| v.starts_with(prefix));
            }
            if let Some(excluded) = op.get("anything-but") {
                let excluded = match excluded {
                    Value::Array(items) => items.clone(),
                    other => vec![other.clone()],
                };
                return !values.is_empty()
                    && values
                        .iter()
                        .all(|v| !excluded.iter().any(|e| same_value(v, e)));
            }
            if let Some(conditions) = op.get("numeric").and_then(Value::as_array) {
                return values
                    .iter()
                    .filter_map(Value::as_f64)
                    .any(|v| numeric_matches(conditions, v));
            }
            false
        }
        _ => false,
    }
}

/// Candidate values an attribute offers for matching. Arrays match
/// element-wise.
fn candidates(attribute: Option<&WireAttribute>) -> Vec<Value> {
    let Some(attribute) = attribute else {
        return Vec::new();
    };
    match attribute.data_type.as_str() {
        STRING_TYPE => vec![Value::String(attribute.string_value.clone())],
        NUMBER_TYPE => attribute
            .string_value
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .into_iter()
            .collect(),
        STRING_ARRAY_TYPE => match serde_json::from_str::<Value>(&attribute.string_value) {
            Ok(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn same_value(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// `conditions` is a flat list of `op, operand` pairs, all of which must hold.
fn numeric_matches(conditions: &[Value], value: f64) -> bool {
    if conditions.is_empty() || conditions.len() % 2 != 0 {
        return false;
    }
    conditions.chunks(2).all(|pair| {
        let (Some(op), Some(operand)) = (pair[0].as_str(), pair[1].as_f64()) else {
            return false;
        };
        match op {
            "=" => value == operand,
            ">" => value > operand,
            ">=" => value >= operand,
            "<" => value < operand,
            "<=" => value <= operand,
            _ => false,
        }
    })
}
