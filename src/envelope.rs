//! Message envelope decoding.
//!
//! A queue receives two shapes of body: a payload enqueued directly, and a
//! topic notification wrapping the payload with topic metadata. Both are
//! normalized into a [`MessageEnvelope`] here, with typed attributes and a
//! staleness check for notifications.

use crate::broker::{NUMBER_TYPE, ReceivedMessage, STRING_ARRAY_TYPE, STRING_TYPE};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A decoded attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Number(i64),
    StringArray(Vec<String>),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match self {
            AttributeValue::StringArray(v) => Some(v),
            _ => None,
        }
    }
}

pub type Attributes = BTreeMap<String, AttributeValue>;

/// A received message, normalized.
#[derive(Debug, Clone)]
pub struct MessageEnvelope<T> {
    pub body: T,
    pub attributes: Attributes,
    /// Token needed to delete (ack) this receipt.
    pub receipt_token: String,
    /// Publish time, for messages fanned out from a topic.
    pub published_at: Option<DateTime<Utc>>,
    /// Originating topic, for messages fanned out from a topic.
    pub source_topic_arn: Option<String>,
}

/// Outcome of decoding one received message.
#[derive(Debug, Clone)]
pub enum Decoded<T> {
    /// Notification older than the allowed age. Skip it, but still delete.
    Stale { topic_arn: String, age_ms: i64 },
    Fresh(MessageEnvelope<T>),
}

/// The two body shapes a queue can receive.
#[derive(Debug, Clone)]
pub enum Envelope {
    /// Enqueued directly (or delivered raw); the body is the payload.
    Direct(Value),
    /// Delivered from a topic and wrapped with topic metadata.
    Fanout(FanoutNotification),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FanoutNotification {
    pub topic_arn: String,
    /// Payload, itself JSON-encoded.
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub message_attributes: BTreeMap<String, NotificationAttribute>,
}

/// Attribute as embedded in a notification body.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationAttribute {
    #[serde(rename = "Type")]
    pub data_type: String,
    #[serde(rename = "Value")]
    pub value: String,
}

impl Envelope {
    /// Parse a raw body. Only a JSON object carrying `TopicArn` is treated
    /// as a notification.
    pub fn parse(body: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| Error::MalformedMessage(format!("body is not JSON: {e}")))?;
        if value.get("TopicArn").is_some() {
            let notification = serde_json::from_value(value)
                .map_err(|e| Error::MalformedMessage(format!("bad notification: {e}")))?;
            Ok(Envelope::Fanout(notification))
        } else {
            Ok(Envelope::Direct(value))
        }
    }
}

/// Decode a received message against the current time.
pub fn decode<T: DeserializeOwned>(raw: &ReceivedMessage, max_age_ms: u64) -> Result<Decoded<T>> {
    decode_at(raw, max_age_ms, Utc::now())
}

/// Decode a received message as of `now`. A `max_age_ms` of zero disables
/// the staleness check.
pub fn decode_at<T: DeserializeOwned>(
    raw: &ReceivedMessage,
    max_age_ms: u64,
    now: DateTime<Utc>,
) -> Result<Decoded<T>> {
    match Envelope::parse(&raw.body)? {
        Envelope::Direct(value) => {
            let body = serde_json::from_value(value)
                .map_err(|e| Error::MalformedMessage(format!("unexpected payload shape: {e}")))?;
            let attributes = decode_attributes(
                raw.attributes
                    .iter()
                    .map(|(name, a)| (name.as_str(), a.data_type.as_str(), a.string_value.as_str())),
            );
            Ok(Decoded::Fresh(MessageEnvelope {
                body,
                attributes,
                receipt_token: raw.receipt_token.clone(),
                published_at: None,
                source_topic_arn: None,
            }))
        }
        Envelope::Fanout(notification) => {
            let age_ms = (now - notification.timestamp).num_milliseconds();
            if is_stale(age_ms, max_age_ms) {
                return Ok(Decoded::Stale {
                    topic_arn: notification.topic_arn,
                    age_ms,
                });
            }
            let body = serde_json::from_str(&notification.message)
                .map_err(|e| Error::MalformedMessage(format!("bad notification payload: {e}")))?;
            let attributes = decode_attributes(
                notification
                    .message_attributes
                    .iter()
                    .map(|(name, a)| (name.as_str(), a.data_type.as_str(), a.value.as_str())),
            );
            Ok(Decoded::Fresh(MessageEnvelope {
                body,
                attributes,
                receipt_token: raw.receipt_token.clone(),
                published_at: Some(notification.timestamp),
                source_topic_arn: Some(notification.topic_arn),
            }))
        }
    }
}

/// Zero disables the check; a limit beyond `i64::MAX` can never be exceeded.
fn is_stale(age_ms: i64, max_age_ms: u64) -> bool {
    max_age_ms > 0 && i64::try_from(max_age_ms).is_ok_and(|max| age_ms > max)
}

/// Coerce `(name, type tag, value)` triples. Triples that fail to coerce,
/// or carry a tag we do not know, are left out.
pub fn decode_attributes<'a>(triples: impl IntoIterator<Item = (&'a str, &'a str, &'a str)>) -> Attributes {
    triples
        .into_iter()
        .filter_map(|(name, data_type, value)| {
            coerce_attribute(data_type, value).map(|v| (name.to_string(), v))
        })
        .collect()
}

fn coerce_attribute(data_type: &str, value: &str) -> Option<AttributeValue> {
    match data_type {
        STRING_TYPE => Some(AttributeValue::String(value.to_string())),
        NUMBER_TYPE => parse_leading_int(value).map(AttributeValue::Number),
        STRING_ARRAY_TYPE => serde_json::from_str(value)
            .ok()
            .map(AttributeValue::StringArray),
        _ => None,
    }
}

/// Integer prefix of `value`: `"42"` and `"42.9"` give 42, `"x"` gives None.
fn parse_leading_int(value: &str) -> Option<i64> {
    let trimmed = value.trim_start();
    let digits_start = usize::from(trimmed.starts_with(['-', '+']));
    let digits_len = trimmed[digits_start..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits_len == 0 {
        return None;
    }
    trimmed[..digits_start + digits_len].parse().ok()
}
