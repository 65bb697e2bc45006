//! Subscription filter policies.
//!
//! Rules are grouped per attribute; the broker delivers a message when
//! every named attribute satisfies at least one of its rules.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::BTreeMap;

/// A match rule for a `String` or `String.Array` attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringFilter {
    Exact(String),
    Exists {
        exists: bool,
    },
    AnythingBut {
        #[serde(rename = "anything-but")]
        anything_but: Vec<String>,
    },
    Prefix {
        prefix: String,
    },
}

impl StringFilter {
    pub fn exact(value: impl Into<String>) -> Self {
        StringFilter::Exact(value.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        StringFilter::Prefix {
            prefix: prefix.into(),
        }
    }
}

/// Comparison operator in a numeric rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparison {
    pub fn as_str(self) -> &'static str {
        match self {
            Comparison::Eq => "=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
        }
    }
}

/// A match rule for a `Number` attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumberFilter {
    Exact(Number),
    /// Flat `[op, operand, op, operand, ...]` list; every pair must hold.
    Numeric {
        numeric: Vec<Value>,
    },
    Exists {
        exists: bool,
    },
    AnythingBut {
        #[serde(rename = "anything-but")]
        anything_but: Vec<Number>,
    },
}

impl NumberFilter {
    pub fn exact(value: impl Into<Number>) -> Self {
        NumberFilter::Exact(value.into())
    }

    pub fn compare(op: Comparison, operand: impl Into<Number>) -> Self {
        NumberFilter::Numeric {
            numeric: vec![Value::from(op.as_str()), Value::Number(operand.into())],
        }
    }

    /// `low_op low` and `high_op high`, e.g. `> 0` and `<= 100`.
    pub fn between(
        low_op: Comparison,
        low: impl Into<Number>,
        high_op: Comparison,
        high: impl Into<Number>,
    ) -> Self {
        NumberFilter::Numeric {
            numeric: vec![
                Value::from(low_op.as_str()),
                Value::Number(low.into()),
                Value::from(high_op.as_str()),
                Value::Number(high.into()),
            ],
        }
    }
}

/// Filter applied by the broker when delivering into a subscribed queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFilter {
    #[serde(default)]
    pub string_filters: BTreeMap<String, Vec<StringFilter>>,
    #[serde(default)]
    pub number_filters: BTreeMap<String, Vec<NumberFilter>>,
}

impl MessageFilter {
    /// A filter that lets every message through.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn string(mut self, attribute: impl Into<String>, rules: Vec<StringFilter>) -> Self {
        self.string_filters.insert(attribute.into(), rules);
        self
    }

    pub fn number(mut self, attribute: impl Into<String>, rules: Vec<NumberFilter>) -> Self {
        self.number_filters.insert(attribute.into(), rules);
        self
    }

    /// Merge both rule sets into one policy document. A number rule set
    /// replaces a string rule set for the same attribute.
    pub fn to_policy(&self) -> Result<Value> {
        let mut policy = serde_json::Map::new();
        for (name, rules) in &self.string_filters {
            policy.insert(name.clone(), serde_json::to_value(rules)?);
        }
        for (name, rules) in &self.number_filters {
            policy.insert(name.clone(), serde_json::to_value(rules)?);
        }
        Ok(Value::Object(policy))
    }

    pub fn policy_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_policy()?)?)
    }
}
