//! Queue integration tests.

mod publish;

#[cfg(all(feature = "in-memory", feature = "metrics"))]
mod consume;
