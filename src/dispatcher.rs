//! In-process message dispatch.
//!
//! [`Dispatcher`] is a cheap, cloneable handle to the channels feeding the
//! worker pools: one publish channel drained by `producer_thread_count`
//! send workers, and one execute channel (or one per consumer group with
//! `use_dispatching_per_group`) drained by `subscriber_execute_thread_count`
//! execute workers each. Messages that are not due yet wait in the local
//! [`DelayScheduler`].
//!
//! Nothing here guarantees exclusivity. Workers claim each row in storage
//! before acting on it, so a message that reaches two workers (or two
//! processes) is still processed once.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    error::{Error, Result},
    message::{MediumMessage, MessageKind},
};

pub mod scheduler;

pub use scheduler::DelayScheduler;

/// Work performed by a dispatch worker for one message.
pub trait DispatchTarget: Send + Sync + 'static {
    fn dispatch(&self, message: MediumMessage) -> BoxFuture<'_, ()>;
}

struct DispatcherInner {
    publish: mpsc::Sender<MediumMessage>,
    execute: mpsc::Sender<MediumMessage>,
    per_group: HashMap<String, mpsc::Sender<MediumMessage>>,
    scheduler: DelayScheduler,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

/// Receiving ends of the dispatcher channels, consumed by
/// [`DispatchQueues::start`].
pub struct DispatchQueues {
    dispatcher: Dispatcher,
    publish: mpsc::Receiver<MediumMessage>,
    execute: mpsc::Receiver<MediumMessage>,
    per_group: Vec<(String, mpsc::Receiver<MediumMessage>)>,
    producer_threads: usize,
    execute_threads: usize,
}

impl Dispatcher {
    /// Creates the channels. `groups` only matters with
    /// `use_dispatching_per_group`: each gets a dedicated channel and pool.
    pub fn new<I>(config: &Config, groups: I) -> (Self, DispatchQueues)
    where
        I: IntoIterator<Item = String>,
    {
        let capacity = config.channel_capacity.max(1);
        let (publish_tx, publish_rx) = mpsc::channel(capacity);
        let (execute_tx, execute_rx) = mpsc::channel(capacity);

        let mut per_group = HashMap::new();
        let mut per_group_rx = Vec::new();
        if config.use_dispatching_per_group {
            for group in groups {
                if per_group.contains_key(&group) {
                    continue;
                }
                let (tx, rx) = mpsc::channel(capacity);
                per_group.insert(group.clone(), tx);
                per_group_rx.push((group, rx));
            }
        }

        let dispatcher = Self {
            inner: Arc::new(DispatcherInner {
                publish: publish_tx,
                execute: execute_tx,
                per_group,
                scheduler: DelayScheduler::new(),
            }),
        };

        let queues = DispatchQueues {
            dispatcher: dispatcher.clone(),
            publish: publish_rx,
            execute: execute_rx,
            per_group: per_group_rx,
            producer_threads: config.producer_thread_count.max(1),
            execute_threads: config.subscriber_execute_thread_count.max(1),
        };

        (dispatcher, queues)
    }

    fn execute_channel(&self, message: &MediumMessage) -> &mpsc::Sender<MediumMessage> {
        message
            .group()
            .and_then(|group| self.inner.per_group.get(group))
            .unwrap_or(&self.inner.execute)
    }

    /// Hands a stored published message to the send workers without
    /// waiting. When the channel is full the message is parked in the local
    /// scheduler instead, which forwards it as soon as there is room.
    pub fn enqueue_to_publish(&self, message: MediumMessage) -> Result<()> {
        match self.inner.publish.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(message)) => {
                tracing::debug!(message_id = %message.id, "Publish channel full, parking message");
                self.inner
                    .scheduler
                    .schedule(MessageKind::Published, message, Utc::now());
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::DispatcherClosed),
        }
    }

    /// Like [`enqueue_to_publish`](Self::enqueue_to_publish) for received
    /// messages, routed by group.
    pub fn enqueue_to_execute(&self, message: MediumMessage) -> Result<()> {
        match self.execute_channel(&message).try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(message)) => {
                tracing::debug!(message_id = %message.id, "Execute channel full, parking message");
                self.inner
                    .scheduler
                    .schedule(MessageKind::Received, message, Utc::now());
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::DispatcherClosed),
        }
    }

    /// Keeps `message` on this node until `due_at`, then dispatches it.
    pub fn enqueue_to_scheduler(&self, kind: MessageKind, message: MediumMessage, due_at: DateTime<Utc>) {
        self.inner.scheduler.schedule(kind, message, due_at);
    }

    /// Dispatches through the matching channel, waiting for room.
    pub async fn dispatch(&self, kind: MessageKind, message: MediumMessage) -> Result<()> {
        let channel = match kind {
            MessageKind::Published => &self.inner.publish,
            MessageKind::Received => self.execute_channel(&message),
        };
        channel
            .send(message)
            .await
            .map_err(|_| Error::DispatcherClosed)
    }

    pub fn scheduled(&self) -> usize {
        self.inner.scheduler.len()
    }

    async fn run_scheduler(self, cancellation: CancellationToken) {
        let scheduler = &self.inner.scheduler;

        loop {
            let (due, wait) = scheduler.take_due(Utc::now());

            for entry in due {
                let id = entry.message.id;
                if let Err(e) = self.dispatch(entry.kind, entry.message).await {
                    tracing::debug!(message_id = %id, error = %e, "Dropping scheduled message");
                }
            }

            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = scheduler.changed() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        tracing::debug!(pending = scheduler.len(), "Delay scheduler stopped");
    }
}

impl DispatchQueues {
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Spawns the worker pools and the delay scheduler. Every task stops
    /// taking work once `cancellation` fires; a message already taken is
    /// processed to completion.
    pub fn start(
        self,
        sender: Arc<dyn DispatchTarget>,
        executor: Arc<dyn DispatchTarget>,
        cancellation: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = spawn_pool(
            "publish",
            self.publish,
            self.producer_threads,
            sender,
            &cancellation,
        );

        handles.extend(spawn_pool(
            "execute",
            self.execute,
            self.execute_threads,
            executor.clone(),
            &cancellation,
        ));

        for (group, rx) in self.per_group {
            tracing::debug!(%group, "Starting dedicated execute pool");
            handles.extend(spawn_pool(
                "execute",
                rx,
                self.execute_threads,
                executor.clone(),
                &cancellation,
            ));
        }

        handles.push(tokio::spawn(self.dispatcher.run_scheduler(cancellation)));

        handles
    }
}

fn spawn_pool(
    pool: &'static str,
    rx: mpsc::Receiver<MediumMessage>,
    workers: usize,
    target: Arc<dyn DispatchTarget>,
    cancellation: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));

    (0..workers)
        .map(|worker| {
            let rx = rx.clone();
            let target = target.clone();
            let cancellation = cancellation.clone();

            tokio::spawn(async move {
                loop {
                    let next = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            biased;
                            _ = cancellation.cancelled() => None,
                            message = rx.recv() => message,
                        }
                    };

                    let Some(message) = next else {
                        break;
                    };
                    target.dispatch(message).await;
                }

                tracing::trace!(pool, worker, "Dispatch worker stopped");
            })
        })
        .collect()
}
