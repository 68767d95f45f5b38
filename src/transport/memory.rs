//! In-process broker.
//!
//! Every group has one queue. A sent message is copied into the queue of
//! each group subscribed to its name, so groups see every message while the
//! clients inside one group compete for it. Rejected deliveries go back to
//! the front of their queue.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    message::TransportMessage,
};

use super::{
    topic_matches, ConsumerClient, ConsumerClientFactory, Delivery, DeliveryTag, OperateResult,
    Transport,
};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct GroupQueue {
    topics: Mutex<HashSet<String>>,
    pending: Mutex<VecDeque<(DeliveryTag, TransportMessage)>>,
    unacked: Mutex<HashMap<DeliveryTag, TransportMessage>>,
    notify: Notify,
}

impl GroupQueue {
    fn accepts(&self, name: &str) -> bool {
        guard(&self.topics)
            .iter()
            .any(|pattern| topic_matches(pattern, name))
    }

    fn push(&self, tag: DeliveryTag, message: TransportMessage) {
        guard(&self.pending).push_back((tag, message));
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Delivery> {
        let (tag, message) = guard(&self.pending).pop_front()?;
        guard(&self.unacked).insert(tag, message.clone());
        Some(Delivery { message, tag })
    }
}

struct BrokerInner {
    groups: papaya::HashMap<String, Arc<GroupQueue>>,
    next_tag: AtomicU64,
    sent: Mutex<Vec<TransportMessage>>,
}

impl Default for BrokerInner {
    fn default() -> Self {
        Self {
            groups: papaya::HashMap::new(),
            next_tag: AtomicU64::new(1),
            sent: Mutex::new(Vec::new()),
        }
    }
}

/// Transport and consumer factory backed by in-process queues.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message accepted by [`Transport::send`] so far.
    pub fn sent(&self) -> Vec<TransportMessage> {
        guard(&self.inner.sent).clone()
    }

    /// Deliveries waiting in `group`, excluding unacknowledged ones.
    pub fn pending(&self, group: &str) -> usize {
        self.inner
            .groups
            .pin()
            .get(group)
            .map_or(0, |queue| guard(&queue.pending).len())
    }

    /// Deliveries handed out to `group` and not yet committed or rejected.
    pub fn unacked(&self, group: &str) -> usize {
        self.inner
            .groups
            .pin()
            .get(group)
            .map_or(0, |queue| guard(&queue.unacked).len())
    }

    fn group(&self, group: &str) -> Arc<GroupQueue> {
        self.inner
            .groups
            .pin()
            .get_or_insert_with(group.to_owned(), || Arc::new(GroupQueue::default()))
            .clone()
    }
}

impl Transport for InMemoryBroker {
    fn address(&self) -> &str {
        "memory://"
    }

    fn send(&self, message: TransportMessage) -> BoxFuture<'_, OperateResult> {
        Box::pin(async move {
            let Some(name) = message.name() else {
                return OperateResult::failed("message has no name header");
            };

            let targets = self
                .inner
                .groups
                .pin()
                .iter()
                .filter(|(_, queue)| queue.accepts(name))
                .map(|(_, queue)| queue.clone())
                .collect::<Vec<_>>();

            for queue in targets {
                let tag = self.inner.next_tag.fetch_add(1, Ordering::Relaxed);
                queue.push(tag, message.clone());
            }

            guard(&self.inner.sent).push(message);
            OperateResult::Succeeded
        })
    }
}

impl ConsumerClientFactory for InMemoryBroker {
    fn create(&self, group: &str) -> BoxFuture<'_, Result<Box<dyn ConsumerClient>>> {
        let queue = self.group(group);
        Box::pin(async move { Ok(Box::new(InMemoryConsumer { queue }) as Box<dyn ConsumerClient>) })
    }
}

/// One competing consumer of a group queue.
pub struct InMemoryConsumer {
    queue: Arc<GroupQueue>,
}

impl ConsumerClient for InMemoryConsumer {
    fn subscribe(&self, topics: Vec<String>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            guard(&self.queue.topics).extend(topics);
            Ok(())
        })
    }

    fn listen(
        &self,
        timeout: Duration,
        sink: mpsc::Sender<Delivery>,
        cancellation: CancellationToken,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            loop {
                while let Some(delivery) = self.queue.pop() {
                    let tag = delivery.tag;
                    if sink.send(delivery).await.is_err() {
                        // Receiver gone: give the delivery back.
                        self.reject(tag).await?;
                        return Ok(());
                    }
                }

                tokio::select! {
                    _ = cancellation.cancelled() => return Ok(()),
                    _ = self.queue.notify.notified() => {}
                    _ = tokio::time::sleep(timeout) => {}
                }
            }
        })
    }

    fn commit(&self, tag: DeliveryTag) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            guard(&self.queue.unacked)
                .remove(&tag)
                .map(|_| ())
                .ok_or_else(|| Error::not_found(format!("delivery {tag}")))
        })
    }

    fn reject(&self, tag: DeliveryTag) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let message = guard(&self.queue.unacked)
                .remove(&tag)
                .ok_or_else(|| Error::not_found(format!("delivery {tag}")))?;
            guard(&self.queue.pending).push_front((tag, message));
            self.queue.notify.notify_one();
            Ok(())
        })
    }
}
