//! Queue access policy documents and the topic-subscription merge.
//!
//! A queue subscribed to several topics carries one `Allow` statement per
//! topic, each keyed by a deterministic Sid. Statements this crate did not
//! write are carried through untouched, including fields it does not model.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};

pub const POLICY_VERSION: &str = "2008-10-17";

/// Service principal the broker publishes to queues as.
pub const PUBLISH_PRINCIPAL: &str = "sns.amazonaws.com";

pub const SEND_MESSAGE_ACTION: &str = "SQS:SendMessage";

const SOURCE_ARN_KEY: &str = "aws:SourceArn";

/// Sid of the statement that lets `topic_arn` deliver into a queue.
pub fn subscription_sid(topic_arn: &str) -> String {
    format!("topic-subscription-{topic_arn}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub statement: Vec<Statement>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `Statement` may hold a single object rather than a list.
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<Statement>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<Statement>),
        One(Box<Statement>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(statements) => statements,
        OneOrMany::One(statement) => vec![*statement],
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    pub effect: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub principal: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub action: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub resource: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub condition: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Statement {
    /// Allow `topic_arn` to send into the queue at `queue_arn`.
    pub fn topic_subscription(queue_arn: &str, topic_arn: &str) -> Self {
        Self {
            sid: Some(subscription_sid(topic_arn)),
            effect: "Allow".to_string(),
            principal: json!({ "Service": PUBLISH_PRINCIPAL }),
            action: json!([SEND_MESSAGE_ACTION]),
            resource: Value::String(queue_arn.to_string()),
            condition: json!({ "ArnEquals": { "aws:SourceArn": topic_arn } }),
            extra: Map::new(),
        }
    }

    fn grants_send_from(&self, topic_arn: &str) -> bool {
        if self.effect != "Allow" {
            return false;
        }
        let allows_send = match &self.action {
            Value::String(action) => is_send_action(action),
            Value::Array(actions) => actions
                .iter()
                .filter_map(Value::as_str)
                .any(is_send_action),
            _ => false,
        };
        let source = self
            .condition
            .get("ArnEquals")
            .or_else(|| self.condition.get("ArnLike"))
            .and_then(|c| c.get(SOURCE_ARN_KEY))
            .and_then(Value::as_str);
        allows_send && source == Some(topic_arn)
    }
}

fn is_send_action(action: &str) -> bool {
    action.eq_ignore_ascii_case(SEND_MESSAGE_ACTION) || action == "*" || action == "SQS:*"
}

impl PolicyDocument {
    /// An empty document for the queue at `queue_arn`.
    pub fn empty_for(queue_arn: &str) -> Self {
        Self {
            version: POLICY_VERSION.to_string(),
            id: Some(format!("{queue_arn}/SQSPOLICY")),
            statement: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Parse a queue's stored policy, or start from an empty document when
    /// the queue has none.
    pub fn parse_or_default(raw: Option<&str>, queue_arn: &str) -> Result<Self> {
        match raw {
            Some(raw) if !raw.trim().is_empty() => {
                serde_json::from_str(raw).map_err(|e| Error::Policy(format!("{queue_arn}: {e}")))
            }
            _ => Ok(Self::empty_for(queue_arn)),
        }
    }

    pub fn has_statement(&self, sid: &str) -> bool {
        self.statement.iter().any(|s| s.sid.as_deref() == Some(sid))
    }

    /// Append the subscription statement for `topic_arn` unless one with
    /// the same Sid already exists. Returns whether the document changed.
    pub fn grant_topic(&mut self, queue_arn: &str, topic_arn: &str) -> bool {
        if self.has_statement(&subscription_sid(topic_arn)) {
            return false;
        }
        self.statement
            .push(Statement::topic_subscription(queue_arn, topic_arn));
        true
    }

    /// Whether any statement lets `topic_arn` send into this queue.
    pub fn allows_topic(&self, topic_arn: &str) -> bool {
        self.statement.iter().any(|s| s.grants_send_from(topic_arn))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
