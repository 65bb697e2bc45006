//! Integration tests for topic subscription and publishing.

use brokerq::broker::memory::{MemoryBroker, queue_arn, topic_arn};
use brokerq::broker::{QueueBroker, SubscribeRequest, TopicBroker};
use brokerq::topic::policy::{PolicyDocument, subscription_sid};
use brokerq::topic::{Comparison, NumberFilter, StringFilter};
use brokerq::{
    AttributeValue, Attributes, ConsumeOptions, Disposition, MessageFilter, OutgoingMessage,
    Queue, Topic,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Event {
    name: String,
}

fn event(name: &str) -> Event {
    Event {
        name: name.to_string(),
    }
}

fn topic(broker: &Arc<MemoryBroker>, name: &str) -> Topic<Event> {
    Topic::new(broker.clone(), broker.clone(), topic_arn(name))
}

/// Receive whatever is on `queue_name` once, returning bodies and
/// attributes.
async fn drain_once(broker: &Arc<MemoryBroker>, queue_name: &str) -> Vec<(Event, Attributes)> {
    let queue = Queue::<Event>::connect(broker.clone(), queue_name, 10)
        .await
        .unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let handler = Arc::new(move |event: Event, attributes: Attributes| {
        sink.lock().unwrap().push((event, attributes));
        async { anyhow::Ok(()) }
    });
    let dispositions = queue
        .consume(handler, ConsumeOptions::default().wait_seconds(0))
        .await;
    assert!(dispositions.iter().all(|d| *d == Disposition::Handled));
    let mut received = received.lock().unwrap().clone();
    received.sort_by(|a, b| a.0.name.cmp(&b.0.name));
    received
}

// ---------------------------------------------------------------------------
// Subscribe
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscribe_creates_missing_queue() {
    let broker = Arc::new(MemoryBroker::new());
    topic(&broker, "events")
        .subscribe("audit", &MessageFilter::all())
        .await
        .unwrap();

    let info = broker.resolve_queue("audit").await.unwrap();
    assert_eq!(info.arn, queue_arn("audit"));
    let subscriptions = broker.subscriptions(&topic_arn("events"));
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].endpoint, queue_arn("audit"));
    assert!(subscriptions[0].raw_message_delivery);
    assert_eq!(subscriptions[0].filter_policy, json!({}));
}

#[tokio::test]
async fn repeated_subscribe_merges_policy_once() {
    let broker = Arc::new(MemoryBroker::new());
    let events = topic(&broker, "events");
    let filter = MessageFilter::all().string("store", vec![StringFilter::exact("amazon")]);

    events.subscribe("orders", &filter).await.unwrap();
    events.subscribe("orders", &filter).await.unwrap();

    assert_eq!(broker.policy_writes(), 1);
    assert_eq!(broker.subscribe_calls(), 2);
    assert_eq!(broker.subscriptions(&topic_arn("events")).len(), 1);

    let policy = broker.queue_policy("orders").unwrap();
    let document = PolicyDocument::parse_or_default(Some(&policy), &queue_arn("orders")).unwrap();
    assert_eq!(document.statement.len(), 1);
    assert!(document.has_statement(&subscription_sid(&topic_arn("events"))));
    assert!(document.allows_topic(&topic_arn("events")));
}

#[tokio::test]
async fn second_topic_adds_its_own_statement() {
    let broker = Arc::new(MemoryBroker::new());
    topic(&broker, "events")
        .subscribe("orders", &MessageFilter::all())
        .await
        .unwrap();
    topic(&broker, "refunds")
        .subscribe("orders", &MessageFilter::all())
        .await
        .unwrap();

    let policy = broker.queue_policy("orders").unwrap();
    let document = PolicyDocument::parse_or_default(Some(&policy), &queue_arn("orders")).unwrap();
    assert_eq!(document.statement.len(), 2);
    assert!(document.allows_topic(&topic_arn("events")));
    assert!(document.allows_topic(&topic_arn("refunds")));
    assert_eq!(broker.policy_writes(), 2);
}

#[tokio::test]
async fn foreign_policy_statements_are_preserved() {
    let broker = Arc::new(MemoryBroker::new());
    broker.create_queue("orders").await.unwrap();
    let url = broker.resolve_queue("orders").await.unwrap().url;
    let existing = json!({
        "Version": "2012-10-17",
        "Id": "ops-managed",
        "Statement": [{
            "Sid": "ops-read",
            "Effect": "Allow",
            "Principal": { "AWS": "arn:memory:iam::000000000000:role/ops" },
            "Action": "SQS:ReceiveMessage",
            "Resource": queue_arn("orders"),
        }],
    });
    broker
        .set_queue_policy(&url, &existing.to_string())
        .await
        .unwrap();

    topic(&broker, "events")
        .subscribe("orders", &MessageFilter::all())
        .await
        .unwrap();

    let stored: serde_json::Value =
        serde_json::from_str(&broker.queue_policy("orders").unwrap()).unwrap();
    assert_eq!(stored["Version"], "2012-10-17");
    assert_eq!(stored["Id"], "ops-managed");
    let statements = stored["Statement"].as_array().unwrap();
    assert_eq!(statements.len(), 2);
    assert_eq!(statements[0], existing["Statement"][0]);
    assert_eq!(
        statements[1]["Sid"],
        subscription_sid(&topic_arn("events")).as_str()
    );
}

#[tokio::test]
async fn single_statement_policy_is_merged_without_losing_keys() {
    let broker = Arc::new(MemoryBroker::new());
    broker.create_queue("orders").await.unwrap();
    let url = broker.resolve_queue("orders").await.unwrap().url;
    let existing = json!({
        "Version": "2012-10-17",
        "Comment": "managed by ops",
        "Statement": {
            "Sid": "ops-read",
            "Effect": "Allow",
            "Principal": "*",
            "Action": "SQS:ReceiveMessage",
            "Resource": queue_arn("orders"),
        },
    });
    broker
        .set_queue_policy(&url, &existing.to_string())
        .await
        .unwrap();

    topic(&broker, "events")
        .subscribe("orders", &MessageFilter::all())
        .await
        .unwrap();

    let stored: serde_json::Value =
        serde_json::from_str(&broker.queue_policy("orders").unwrap()).unwrap();
    assert_eq!(stored["Comment"], "managed by ops");
    let statements = stored["Statement"].as_array().unwrap();
    assert_eq!(statements.len(), 2);
    assert_eq!(statements[0], existing["Statement"]);
}

// ---------------------------------------------------------------------------
// Publish
// ---------------------------------------------------------------------------

#[tokio::test]
async fn publish_reaches_raw_subscriber_with_attributes() {
    let broker = Arc::new(MemoryBroker::new());
    let events = topic(&broker, "events");
    events
        .subscribe("orders", &MessageFilter::all())
        .await
        .unwrap();

    events
        .publish(
            OutgoingMessage::new(event("created"))
                .string_attribute("store", "amazon")
                .number_attribute("price", 42)
                .array_attribute("tags", vec!["a".to_string(), "b".to_string()]),
        )
        .await
        .unwrap();

    let received = drain_once(&broker, "orders").await;
    assert_eq!(received.len(), 1);
    let (body, attributes) = &received[0];
    assert_eq!(*body, event("created"));
    assert_eq!(attributes["store"].as_str(), Some("amazon"));
    assert_eq!(attributes["price"], AttributeValue::Number(42));
    assert_eq!(
        attributes["tags"],
        AttributeValue::StringArray(vec!["a".to_string(), "b".to_string()])
    );
}

#[tokio::test]
async fn filter_excludes_non_matching_messages() {
    let broker = Arc::new(MemoryBroker::new());
    let events = topic(&broker, "events");
    let filter = MessageFilter::all()
        .string("store", vec![StringFilter::exact("amazon")])
        .number(
            "price",
            vec![NumberFilter::compare(Comparison::Ge, 10)],
        );
    events.subscribe("orders", &filter).await.unwrap();

    for (name, store, price) in [
        ("cheap", "amazon", 5),
        ("elsewhere", "ebay", 50),
        ("match", "amazon", 50),
    ] {
        events
            .publish(
                OutgoingMessage::new(event(name))
                    .string_attribute("store", store)
                    .number_attribute("price", price),
            )
            .await
            .unwrap();
    }

    let received = drain_once(&broker, "orders").await;
    let names: Vec<_> = received.iter().map(|(e, _)| e.name.as_str()).collect();
    assert_eq!(names, vec!["match"]);
}

#[tokio::test]
async fn wrapped_delivery_decodes_like_raw_delivery() {
    let broker = Arc::new(MemoryBroker::new());
    let events = topic(&broker, "events");
    events
        .subscribe("orders", &MessageFilter::all())
        .await
        .unwrap();
    // Switch the same binding to wrapped delivery.
    broker
        .subscribe(SubscribeRequest {
            topic_arn: topic_arn("events"),
            protocol: "sqs".to_string(),
            endpoint: queue_arn("orders"),
            filter_policy: "{}".to_string(),
            raw_message_delivery: false,
        })
        .await
        .unwrap();

    events
        .publish(
            OutgoingMessage::new(event("wrapped"))
                .number_attribute("price", 42)
                .array_attribute("tags", vec!["a".to_string(), "b".to_string()]),
        )
        .await
        .unwrap();

    let received = drain_once(&broker, "orders").await;
    assert_eq!(received.len(), 1);
    let (body, attributes) = &received[0];
    assert_eq!(*body, event("wrapped"));
    assert_eq!(attributes["price"].as_i64(), Some(42));
    assert_eq!(
        attributes["tags"].as_strings(),
        Some(&["a".to_string(), "b".to_string()][..])
    );
}

#[tokio::test]
async fn queue_without_grant_receives_nothing() {
    let broker = Arc::new(MemoryBroker::new());
    broker.create_queue("orders").await.unwrap();
    broker
        .subscribe(SubscribeRequest {
            topic_arn: topic_arn("events"),
            protocol: "sqs".to_string(),
            endpoint: queue_arn("orders"),
            filter_policy: String::new(),
            raw_message_delivery: true,
        })
        .await
        .unwrap();

    topic(&broker, "events")
        .publish(OutgoingMessage::new(event("dropped")))
        .await
        .unwrap();

    assert_eq!(broker.message_count("orders"), 0);
}
