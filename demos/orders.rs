//! Order pipeline over the in-memory broker.
//!
//! Run with `RUST_LOG=info cargo run --example orders`.

use std::sync::mpsc;
use std::time::Duration;

use nsqueue::middleware::{Notifier, Stack, Timer};
use nsqueue::transport::InMemoryTransport;
use nsqueue::{Handler, HandlerError, Queue, QueueConfig, QueueError, Subscriber};
use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct Order {
    id: u32,
    title: String,
    amount_cents: u64,
}

fn main() -> Result<(), QueueError> {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .init();

    let (done_tx, done_rx) = mpsc::channel();

    let billing = Handler::from_payload(|order: &Order| {
        if order.amount_cents == 0 {
            return Err(HandlerError::rejected(format!("order {} has no amount", order.id)));
        }
        tracing::info!(id = order.id, amount_cents = order.amount_cents, "charged");
        Ok(())
    })
    .middleware(Notifier::new(done_tx.clone()))
    .middleware(Timer::named("billing"));

    let audit = Stack::new()
        .layer(Timer::named("audit"))
        .layer(Notifier::new(done_tx))
        .apply(Handler::<Order>::new(|envelope| {
            let order = envelope.bind()?;
            tracing::info!(id = order.id, title = %order.title, "audited");
            Ok(())
        }));

    let mut queue = Queue::new(
        InMemoryTransport::new(),
        QueueConfig::new("in-memory")
            .option("max_attempts", 2)
            .option("default_requeue_delay", "100ms")
            .option("backoff_multiplier", "10ms"),
    );
    queue.start(vec![
        Subscriber::new("orders", "billing", 2, billing),
        Subscriber::new("orders", "audit", 1, audit),
    ])?;

    let orders = vec![
        Order { id: 1, title: "keyboard".into(), amount_cents: 4_999 },
        Order { id: 2, title: "mouse".into(), amount_cents: 1_999 },
        Order { id: 3, title: "gift card".into(), amount_cents: 0 },
    ];
    queue.bulk_publish("orders", &orders)?;
    queue.deferred_publish(
        "orders",
        &Order { id: 4, title: "monitor".into(), amount_cents: 19_999 },
        Duration::from_millis(250),
    )?;

    // 4 orders on 2 channels, plus one retry of the free order on billing
    for _ in 0..9 {
        match done_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(n) => tracing::info!(id = %n.id, attempts = n.attempts, succeeded = n.succeeded, "processed"),
            Err(_) => break,
        }
    }

    queue.stop();
    Ok(())
}
