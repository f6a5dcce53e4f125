use std::time::Duration;

use nsqueue::{Queue, QueueConfig, QueueError, TransportError};
use serde_json::json;

use crate::support::{Call, Flaky, Order, RecordingTransport};

fn started(transport: &RecordingTransport) -> Queue<RecordingTransport> {
    let mut queue = Queue::new(transport.clone(), QueueConfig::new("127.0.0.1:4150"));
    queue.init().unwrap();
    queue
}

fn publishes(transport: &RecordingTransport) -> Vec<Call> {
    transport
        .calls()
        .into_iter()
        .filter(|call| !matches!(call, Call::NewProducer(_)))
        .collect()
}

#[test]
fn publish_sends_json_body() {
    let transport = RecordingTransport::new();
    let queue = started(&transport);

    queue.publish("orders", &Order::new("x")).unwrap();

    assert_eq!(
        publishes(&transport),
        vec![Call::Publish {
            topic: "orders".into(),
            body: br#"{"title":"x"}"#.to_vec(),
        }]
    );
}

#[test]
fn publish_before_init_makes_no_transport_calls() {
    let transport = RecordingTransport::new();
    let queue = Queue::new(transport.clone(), QueueConfig::new("127.0.0.1:4150"));

    let err = queue.publish("orders", &Order::new("x")).unwrap_err();
    assert!(matches!(err, QueueError::NotInitialized));

    let err = queue.bulk_publish("orders", &[Order::new("x")]).unwrap_err();
    assert!(matches!(err, QueueError::NotInitialized));

    assert!(transport.calls().is_empty());
}

#[test]
fn publish_serialization_failure_sends_nothing() {
    let transport = RecordingTransport::new();
    let queue = started(&transport);

    let err = queue.publish("orders", &Flaky(false)).unwrap_err();

    assert!(matches!(err, QueueError::Serialization(_)));
    assert!(publishes(&transport).is_empty());
}

#[test]
fn deferred_publish_carries_delay() {
    let transport = RecordingTransport::new();
    let queue = started(&transport);

    queue
        .deferred_publish("orders", &json!({ "title": "later" }), Duration::from_secs(30))
        .unwrap();

    assert_eq!(
        publishes(&transport),
        vec![Call::DeferredPublish {
            topic: "orders".into(),
            delay: Duration::from_secs(30),
            body: br#"{"title":"later"}"#.to_vec(),
        }]
    );
}

#[test]
fn bulk_publish_is_one_round_trip() {
    let transport = RecordingTransport::new();
    let queue = started(&transport);

    queue
        .bulk_publish("orders", &[Order::new("a"), Order::new("b"), Order::new("c")])
        .unwrap();

    assert_eq!(
        publishes(&transport),
        vec![Call::MultiPublish {
            topic: "orders".into(),
            bodies: vec![
                br#"{"title":"a"}"#.to_vec(),
                br#"{"title":"b"}"#.to_vec(),
                br#"{"title":"c"}"#.to_vec(),
            ],
        }]
    );
}

#[test]
fn bulk_publish_serializes_everything_first() {
    let transport = RecordingTransport::new();
    let queue = started(&transport);

    let err = queue
        .bulk_publish("orders", &[Flaky(true), Flaky(false), Flaky(true)])
        .unwrap_err();

    assert!(matches!(err, QueueError::Serialization(_)));
    assert!(publishes(&transport).is_empty());
}

#[test]
fn publish_bytes_is_verbatim() {
    let transport = RecordingTransport::new();
    let queue = started(&transport);

    queue.publish_bytes("raw", b"not json at all".to_vec()).unwrap();

    assert_eq!(
        publishes(&transport),
        vec![Call::Publish {
            topic: "raw".into(),
            body: b"not json at all".to_vec(),
        }]
    );
}

#[test]
fn transport_failure_is_a_publish_error() {
    let transport = RecordingTransport::new();
    transport.fail_publishes("E_PUB_FAILED");
    let queue = started(&transport);

    let err = queue.publish("orders", &Order::new("x")).unwrap_err();

    assert!(matches!(err, QueueError::Publish(TransportError::Rejected(ref reason)) if reason == "E_PUB_FAILED"));
}
