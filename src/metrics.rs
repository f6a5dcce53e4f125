//! Per-topic message metrics.
//!
//! A [`Metrics`] value owns its own `prometheus::Registry`; nothing is
//! registered globally. Share it with `Arc` between the
//! [`Metered`](crate::middleware::Metered) middleware and whatever exposes
//! it (see `proxy` with the `http` feature).

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Message counter and in-flight gauge, labelled by topic.
pub struct Metrics {
    registry: Registry,
    messages: IntCounterVec,
    in_flight: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_namespace("nsqueue")
    }

    pub fn with_namespace(namespace: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let messages = IntCounterVec::new(
            Opts::new("messages_total", "Messages processed, by topic and outcome").namespace(namespace),
            &["topic", "outcome"],
        )?;
        let in_flight = IntGaugeVec::new(
            Opts::new("in_flight", "Messages currently being processed, by topic").namespace(namespace),
            &["topic"],
        )?;

        registry.register(Box::new(messages.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;

        Ok(Self {
            registry,
            messages,
            in_flight,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Raise the in-flight gauge for `topic` until the guard is dropped.
    pub fn track_in_flight(&self, topic: &str) -> InFlightGuard {
        let gauge = self.in_flight.with_label_values(&[topic]);
        gauge.inc();
        InFlightGuard { gauge }
    }

    pub fn record(&self, topic: &str, succeeded: bool) {
        let outcome = if succeeded { "ok" } else { "error" };
        self.messages.with_label_values(&[topic, outcome]).inc();
    }

    pub fn messages(&self, topic: &str, outcome: &str) -> u64 {
        self.messages.with_label_values(&[topic, outcome]).get()
    }

    pub fn in_flight(&self, topic: &str) -> i64 {
        self.in_flight.with_label_values(&[topic]).get()
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Decrements the in-flight gauge on drop.
pub struct InFlightGuard {
    gauge: prometheus::IntGauge,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
