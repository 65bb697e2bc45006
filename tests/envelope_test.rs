//! Integration tests for envelope decoding.

use brokerq::broker::{ReceivedMessage, WireAttribute};
use brokerq::envelope::{Decoded, decode, decode_at};
use brokerq::{AttributeValue, Error};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize, PartialEq)]
struct Order {
    id: u32,
    item: String,
}

fn received(body: impl Into<String>) -> ReceivedMessage {
    ReceivedMessage {
        message_id: "m-1".to_string(),
        body: body.into(),
        receipt_token: "r-1".to_string(),
        attributes: BTreeMap::new(),
        receive_count: 1,
    }
}

fn notification(published_at: DateTime<Utc>) -> String {
    json!({
        "Type": "Notification",
        "MessageId": "n-1",
        "TopicArn": "arn:memory:sns:local:000000000000:orders",
        "Message": r#"{"id":7,"item":"lamp"}"#,
        "Timestamp": published_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        "MessageAttributes": {
            "store": { "Type": "String", "Value": "amazon" },
            "price": { "Type": "Number", "Value": "42" },
            "tags": { "Type": "String.Array", "Value": "[\"a\",\"b\"]" },
        },
    })
    .to_string()
}

fn fresh<T: std::fmt::Debug>(decoded: Decoded<T>) -> brokerq::MessageEnvelope<T> {
    match decoded {
        Decoded::Fresh(envelope) => envelope,
        other => panic!("expected a fresh message, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Direct messages
// ---------------------------------------------------------------------------

#[test]
fn direct_body_decodes_with_no_attributes() {
    let raw = received(r#"{"id":1,"item":"desk"}"#);
    let envelope = fresh(decode::<Order>(&raw, 0).unwrap());

    assert_eq!(
        envelope.body,
        Order {
            id: 1,
            item: "desk".to_string()
        }
    );
    assert!(envelope.attributes.is_empty());
    assert_eq!(envelope.receipt_token, "r-1");
    assert!(envelope.published_at.is_none());
    assert!(envelope.source_topic_arn.is_none());
}

#[test]
fn raw_delivery_carries_broker_attributes() {
    let mut raw = received(r#"{"id":2,"item":"chair"}"#);
    raw.attributes
        .insert("store".to_string(), WireAttribute::string("ebay"));
    raw.attributes.insert(
        "price".to_string(),
        WireAttribute::number(&serde_json::Number::from(15)),
    );

    let envelope = fresh(decode::<Order>(&raw, 0).unwrap());
    assert_eq!(envelope.attributes["store"].as_str(), Some("ebay"));
    assert_eq!(envelope.attributes["price"].as_i64(), Some(15));
}

// ---------------------------------------------------------------------------
// Topic notifications
// ---------------------------------------------------------------------------

#[test]
fn notification_unwraps_payload_and_coerces_attributes() {
    let now = Utc::now();
    let raw = received(notification(now - Duration::milliseconds(50)));
    let envelope = fresh(decode_at::<Order>(&raw, 60_000, now).unwrap());

    assert_eq!(envelope.body.id, 7);
    assert_eq!(envelope.body.item, "lamp");
    assert_eq!(
        envelope.attributes["store"],
        AttributeValue::String("amazon".to_string())
    );
    assert_eq!(envelope.attributes["price"], AttributeValue::Number(42));
    assert_eq!(
        envelope.attributes["tags"].as_strings(),
        Some(&["a".to_string(), "b".to_string()][..])
    );
    assert_eq!(
        envelope.source_topic_arn.as_deref(),
        Some("arn:memory:sns:local:000000000000:orders")
    );
    assert!(envelope.published_at.is_some());
}

#[test]
fn old_notification_is_stale() {
    let now = Utc::now();
    let raw = received(notification(now - Duration::minutes(10)));

    match decode_at::<Order>(&raw, 1_000, now).unwrap() {
        Decoded::Stale { topic_arn, age_ms } => {
            assert_eq!(topic_arn, "arn:memory:sns:local:000000000000:orders");
            assert!(age_ms >= 600_000, "age was {age_ms}");
        }
        Decoded::Fresh(_) => panic!("ten minute old notification should be stale"),
    }
}

#[test]
fn zero_max_age_disables_staleness() {
    let now = Utc::now();
    let raw = received(notification(now - Duration::days(3)));
    let envelope = fresh(decode_at::<Order>(&raw, 0, now).unwrap());
    assert_eq!(envelope.body.id, 7);
}

#[test]
fn notification_attributes_with_unknown_types_are_skipped() {
    let body = json!({
        "TopicArn": "arn:memory:sns:local:000000000000:orders",
        "Message": r#"{"id":3,"item":"rug"}"#,
        "Timestamp": "2026-01-01T00:00:00.000Z",
        "MessageAttributes": {
            "blob": { "Type": "Binary", "Value": "AAEC" },
            "weight": { "Type": "Number", "Value": "12.75" },
        },
    });
    let envelope = fresh(decode::<Order>(&received(body.to_string()), 0).unwrap());
    assert!(!envelope.attributes.contains_key("blob"));
    assert_eq!(envelope.attributes["weight"].as_i64(), Some(12));
}

// ---------------------------------------------------------------------------
// Malformed input
// ---------------------------------------------------------------------------

#[test]
fn invalid_json_is_malformed() {
    let result = decode::<Order>(&received("{not json"), 0);
    assert!(matches!(result, Err(Error::MalformedMessage(_))));
}

#[test]
fn wrong_payload_shape_is_malformed() {
    let result = decode::<Order>(&received(r#"{"id":"seven"}"#), 0);
    assert!(matches!(result, Err(Error::MalformedMessage(_))));
}

#[test]
fn notification_with_undecodable_payload_is_malformed() {
    let body = json!({
        "TopicArn": "arn:memory:sns:local:000000000000:orders",
        "Message": "plain text",
        "Timestamp": Utc::now().to_rfc3339(),
    });
    let result = decode::<Order>(&received(body.to_string()), 0);
    assert!(matches!(result, Err(Error::MalformedMessage(_))));
}
