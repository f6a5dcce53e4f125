//! End-to-end delivery through the in-memory broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nsqueue::metrics::Metrics;
use nsqueue::middleware::{Metered, Notification, Notifier, Stack, Timer};
use nsqueue::transport::InMemoryTransport;
use nsqueue::{Handler, HandlerError, Queue, QueueConfig, QueueError, Subscriber, TransportError};
use serde::Deserialize;
use serde_json::json;

use crate::support::Order;

const TIMEOUT: Duration = Duration::from_secs(5);

fn fast_queue(transport: &InMemoryTransport) -> Queue<InMemoryTransport> {
    Queue::new(
        transport.clone(),
        QueueConfig::new("in-memory")
            .option("default_requeue_delay", "10ms")
            .option("backoff_multiplier", 0),
    )
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn typed_payload_reaches_handler() {
    let transport = InMemoryTransport::new();
    let mut queue = fast_queue(&transport);
    let (done_tx, done_rx) = mpsc::channel();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    let handler = Handler::from_payload(move |order: &Order| {
        sink.lock().unwrap().push(order.title.clone());
        Ok(())
    })
    .middleware(Notifier::new(done_tx))
    .middleware(Timer::named("billing"));

    queue.start(vec![Subscriber::new("orders", "billing", 2, handler)]).unwrap();
    queue.publish("orders", &Order::new("x")).unwrap();

    let notification = done_rx.recv_timeout(TIMEOUT).unwrap();
    assert!(notification.succeeded);
    assert_eq!(notification.attempts, 1);
    assert_eq!(*seen.lock().unwrap(), vec!["x".to_string()]);

    queue.stop();
}

#[test]
fn malformed_body_never_reaches_chain() {
    let transport = InMemoryTransport::new();
    let mut queue = Queue::new(transport.clone(), QueueConfig::new("in-memory"));
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let handler = Handler::<Order>::new(move |_env| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    queue.start(vec![Subscriber::new("orders", "billing", 1, handler)]).unwrap();

    queue.publish_bytes("orders", b"{ not json".to_vec()).unwrap();

    assert!(wait_for(|| queue.consumers()[0].stats().failed == 1));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    queue.stop();
}

#[test]
fn failed_message_is_redelivered() {
    let transport = InMemoryTransport::new();
    let mut queue = fast_queue(&transport);
    let (done_tx, done_rx) = mpsc::channel();

    let handler = Handler::<Order>::new(|env| {
        if env.attempts() < 2 {
            return Err(HandlerError::rejected("not yet"));
        }
        Ok(())
    })
    .middleware(Notifier::new(done_tx));

    queue.start(vec![Subscriber::new("orders", "billing", 1, handler)]).unwrap();
    queue.publish("orders", &Order::new("x")).unwrap();

    let first = done_rx.recv_timeout(TIMEOUT).unwrap();
    let second = done_rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!((first.attempts, first.succeeded), (1, false));
    assert_eq!((second.attempts, second.succeeded), (2, true));
    assert_eq!(first.id, second.id);

    queue.stop();
}

#[test]
fn message_dropped_after_max_attempts() {
    let transport = InMemoryTransport::new();
    let mut queue = Queue::new(
        transport.clone(),
        QueueConfig::new("in-memory")
            .option("default_requeue_delay", 0)
            .option("backoff_multiplier", 0)
            .option("max_attempts", 2),
    );
    let handler = Handler::<Order>::new(|_env| Err(HandlerError::rejected("never")));
    queue.start(vec![Subscriber::new("orders", "billing", 1, handler)]).unwrap();

    queue.publish("orders", &Order::new("x")).unwrap();

    assert!(wait_for(|| queue.consumers()[0].stats().dropped == 1));
    let stats = queue.consumers()[0].stats();
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.handled, 0);

    queue.stop();
}

#[test]
fn explicit_requeue_overrides_result() {
    let transport = InMemoryTransport::new();
    let mut queue = fast_queue(&transport);
    let (done_tx, done_rx) = mpsc::channel();

    let handler = Handler::<Order>::new(|env| {
        if env.attempts() == 1 {
            env.requeue_without_backoff(Duration::from_millis(10));
        }
        Ok(())
    })
    .middleware(Notifier::new(done_tx));

    queue.start(vec![Subscriber::new("orders", "billing", 1, handler)]).unwrap();
    queue.publish("orders", &Order::new("x")).unwrap();

    assert_eq!(done_rx.recv_timeout(TIMEOUT).unwrap().attempts, 1);
    assert_eq!(done_rx.recv_timeout(TIMEOUT).unwrap().attempts, 2);
    assert!(wait_for(|| queue.consumers()[0].stats().handled == 1));
    assert_eq!(queue.consumers()[0].stats().requeued, 1);

    queue.stop();
}

#[test]
fn panicking_handler_does_not_kill_worker() {
    let transport = InMemoryTransport::new();
    let mut queue = fast_queue(&transport);
    let (done_tx, done_rx) = mpsc::channel();

    let handler = Handler::from_payload(|order: &Order| {
        if order.title == "boom" {
            panic!("cannot process boom");
        }
        Ok(())
    })
    .middleware(Notifier::new(done_tx));

    queue.start(vec![Subscriber::new("orders", "billing", 1, handler)]).unwrap();
    queue.publish("orders", &Order::new("boom")).unwrap();
    queue.publish("orders", &Order::new("fine")).unwrap();

    let (mut failed, mut succeeded) = (0, 0);
    while succeeded == 0 || failed == 0 {
        if done_rx.recv_timeout(TIMEOUT).unwrap().succeeded {
            succeeded += 1;
        } else {
            failed += 1;
        }
    }
    assert_eq!(succeeded, 1);
    assert!(wait_for(|| queue.consumers()[0].stats().failed >= 1));
    assert_eq!(queue.consumers()[0].workers(), 1);

    queue.stop();
}

#[test]
fn concurrency_spawns_workers_and_sets_in_flight() {
    let transport = InMemoryTransport::new();
    let mut queue = fast_queue(&transport);

    queue
        .start(vec![Subscriber::new("orders", "billing", 4, Handler::<Order>::new(|_env| Ok(())))])
        .unwrap();

    let consumer = &queue.consumers()[0];
    assert_eq!(consumer.workers(), 4);
    assert_eq!(consumer.max_in_flight(), 40);

    queue.stop();
}

#[test]
fn bulk_publish_delivers_every_message() {
    let transport = InMemoryTransport::new();
    let mut queue = fast_queue(&transport);
    let (done_tx, done_rx) = mpsc::channel::<Notification>();

    let handler = Handler::<Order>::new(|_env| Ok(())).middleware(Notifier::new(done_tx));
    queue.start(vec![Subscriber::new("orders", "billing", 3, handler)]).unwrap();

    let orders: Vec<Order> = (0..10).map(|i| Order::new(&format!("order-{}", i))).collect();
    queue.bulk_publish("orders", &orders).unwrap();

    for _ in 0..10 {
        assert!(done_rx.recv_timeout(TIMEOUT).unwrap().succeeded);
    }
    assert!(wait_for(|| queue.consumers()[0].stats().handled == 10));

    queue.stop();
}

#[test]
fn channels_each_receive_a_copy() {
    let transport = InMemoryTransport::new();
    let mut queue = fast_queue(&transport);
    let (done_tx, done_rx) = mpsc::channel();

    let billing = Handler::<Order>::new(|_env| Ok(())).middleware(Notifier::new(done_tx.clone()));
    let audit = Handler::<Order>::new(|_env| Ok(())).middleware(Notifier::new(done_tx));
    queue
        .start(vec![
            Subscriber::new("orders", "billing", 1, billing),
            Subscriber::new("orders", "audit", 1, audit),
        ])
        .unwrap();

    queue.publish("orders", &Order::new("x")).unwrap();

    let a = done_rx.recv_timeout(TIMEOUT).unwrap();
    let b = done_rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(a.id, b.id);
    assert_eq!(transport.channels("orders"), vec!["audit".to_string(), "billing".to_string()]);

    queue.stop();
}

#[derive(Debug, Deserialize)]
struct Shipment {
    tracking: String,
}

#[test]
fn subscribers_with_different_payloads_share_a_queue() {
    let transport = InMemoryTransport::new();
    let mut queue = fast_queue(&transport);
    let (tx, rx) = mpsc::channel();

    let order_tx = tx.clone();
    let orders = Handler::from_payload(move |order: &Order| {
        order_tx.send(format!("order:{}", order.title)).unwrap();
        Ok(())
    });
    let shipments = Handler::from_payload(move |shipment: &Shipment| {
        tx.send(format!("shipment:{}", shipment.tracking)).unwrap();
        Ok(())
    });

    queue
        .start(vec![
            Subscriber::new("orders", "billing", 1, orders),
            Subscriber::new("shipments", "tracking", 1, shipments),
        ])
        .unwrap();
    queue.publish("orders", &Order::new("x")).unwrap();
    queue.publish("shipments", &json!({ "tracking": "1Z999" })).unwrap();

    let mut got = vec![rx.recv_timeout(TIMEOUT).unwrap(), rx.recv_timeout(TIMEOUT).unwrap()];
    got.sort();
    assert_eq!(got, vec!["order:x".to_string(), "shipment:1Z999".to_string()]);

    queue.stop();
}

#[test]
fn deferred_message_waits_for_delay() {
    let transport = InMemoryTransport::new();
    let mut queue = fast_queue(&transport);
    let (done_tx, done_rx) = mpsc::channel();

    let handler = Handler::<Order>::new(|_env| Ok(())).middleware(Notifier::new(done_tx));
    queue.start(vec![Subscriber::new("orders", "billing", 1, handler)]).unwrap();

    let published = Instant::now();
    queue
        .deferred_publish("orders", &Order::new("later"), Duration::from_millis(100))
        .unwrap();

    done_rx.recv_timeout(TIMEOUT).unwrap();
    assert!(published.elapsed() >= Duration::from_millis(100));

    queue.stop();
}

#[test]
fn oversized_defer_delay_is_a_publish_error() {
    let transport = InMemoryTransport::new();
    let mut queue = fast_queue(&transport);
    queue.init().unwrap();

    let err = queue
        .deferred_publish("orders", &Order::new("never"), Duration::MAX)
        .unwrap_err();

    assert!(matches!(err, QueueError::Publish(TransportError::Rejected(_))), "{err}");
    assert_eq!(transport.backlog("orders"), 0);

    queue.stop();
}

#[test]
fn metered_stack_counts_deliveries() {
    let transport = InMemoryTransport::new();
    let mut queue = fast_queue(&transport);
    let metrics = Arc::new(Metrics::new().unwrap());
    let (done_tx, done_rx) = mpsc::channel();

    let handler = Stack::new()
        .layer(Timer::named("billing"))
        .layer(Notifier::new(done_tx))
        .layer(Metered::new(Arc::clone(&metrics), "orders"))
        .apply(Handler::from_payload(|order: &Order| {
            if order.title == "bad" {
                return Err(HandlerError::rejected("bad order"));
            }
            Ok(())
        }));

    queue
        .start(vec![Subscriber::new("orders", "billing", 1, handler)])
        .unwrap();
    queue.publish("orders", &Order::new("good")).unwrap();
    queue.publish("orders", &Order::new("bad")).unwrap();

    done_rx.recv_timeout(TIMEOUT).unwrap();
    done_rx.recv_timeout(TIMEOUT).unwrap();
    queue.stop();

    assert_eq!(metrics.messages("orders", "ok"), 1);
    assert!(metrics.messages("orders", "error") >= 1);
    assert_eq!(metrics.in_flight("orders"), 0);
}

#[test]
fn unregister_removes_channel() {
    let transport = InMemoryTransport::new();
    let mut queue = fast_queue(&transport);
    queue
        .start(vec![Subscriber::new("orders", "billing", 1, Handler::<Order>::new(|_env| Ok(())))])
        .unwrap();
    queue.stop();

    queue.unregister("orders", "billing").unwrap();

    assert!(transport.topics().is_empty());
}
