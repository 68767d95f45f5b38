//! Broker seam.
//!
//! The engine never talks to a broker directly: published messages leave
//! through a [`Transport`] and inbound messages arrive through
//! [`ConsumerClient`]s created per group by a [`ConsumerClientFactory`].
//! [`memory::InMemoryBroker`] implements both sides for tests and demos.

use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{error::Result, message::TransportMessage};

pub mod memory;

/// Broker-specific acknowledgement handle.
pub type DeliveryTag = u64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperateResult {
    Succeeded,
    Failed { reason: String },
}

impl OperateResult {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

pub trait Transport: Send + Sync + 'static {
    /// Broker address, for logs.
    fn address(&self) -> &str;

    fn send(&self, message: TransportMessage) -> BoxFuture<'_, OperateResult>;
}

#[derive(Clone, Debug)]
pub struct Delivery {
    pub message: TransportMessage,
    pub tag: DeliveryTag,
}

pub trait ConsumerClient: Send + Sync {
    /// Binds the client to `topics`, which may contain `*` and `#` patterns.
    fn subscribe(&self, topics: Vec<String>) -> BoxFuture<'_, Result<()>>;

    /// Pushes deliveries into `sink` until `cancellation` fires, the sink is
    /// closed, or the broker connection fails. `timeout` bounds each poll.
    fn listen(
        &self,
        timeout: Duration,
        sink: mpsc::Sender<Delivery>,
        cancellation: CancellationToken,
    ) -> BoxFuture<'_, Result<()>>;

    fn commit(&self, tag: DeliveryTag) -> BoxFuture<'_, Result<()>>;

    /// Hands the delivery back to the broker for redelivery.
    fn reject(&self, tag: DeliveryTag) -> BoxFuture<'_, Result<()>>;
}

pub trait ConsumerClientFactory: Send + Sync + 'static {
    fn create(&self, group: &str) -> BoxFuture<'_, Result<Box<dyn ConsumerClient>>>;
}

/// Topic pattern match: segments are separated by `.`, `*` matches exactly
/// one segment and `#` matches any number of segments, including none.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    fn go(pattern: &[&str], topic: &[&str]) -> bool {
        match (pattern.split_first(), topic.split_first()) {
            (None, None) => true,
            (Some((&"#", rest)), _) => {
                go(rest, topic) || topic.split_first().is_some_and(|(_, t)| go(pattern, t))
            }
            (Some((&"*", rest)), Some((_, t))) => go(rest, t),
            (Some((p, rest)), Some((s, t))) => p == s && go(rest, t),
            _ => false,
        }
    }

    let pattern = pattern.split('.').collect::<Vec<_>>();
    let topic = topic.split('.').collect::<Vec<_>>();
    go(&pattern, &topic)
}

pub fn is_pattern(topic: &str) -> bool {
    topic.split('.').any(|segment| segment == "*" || segment == "#")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("order.created", "order.created"));
        assert!(!topic_matches("order.created", "order.updated"));

        assert!(topic_matches("order.*", "order.created"));
        assert!(!topic_matches("order.*", "order.created.eu"));
        assert!(!topic_matches("order.*", "order"));

        assert!(topic_matches("order.#", "order"));
        assert!(topic_matches("order.#", "order.created.eu"));
        assert!(topic_matches("#.eu", "order.created.eu"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("invoice.#", "order.created"));

        assert!(is_pattern("order.*"));
        assert!(!is_pattern("order.created"));
    }
}
