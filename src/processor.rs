//! Periodic background work.
//!
//! The in-process fast path handles the common case; these loops make the
//! engine correct when it is not taken: the retry sweep re-dispatches rows
//! that were never finished, the delayed sweep promotes timed sends and the
//! collector deletes expired terminal rows. With `use_storage_lock` only one
//! process runs each sweep at a time.

use std::{
    collections::HashSet,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::Utc;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    dispatcher::Dispatcher,
    error::Result,
    message::{MediumMessage, MessageKind, Status},
    state::to_chrono,
    storage::{
        DataStorage, DelayedQuery, RetryQuery, DELAYED_LOCK, PUBLISH_RETRY_LOCK,
        RECEIVE_RETRY_LOCK,
    },
};

/// A `Queued` row this long past due has lost its scheduler.
const QUEUED_STALE_AFTER: Duration = Duration::from_secs(60);

pub struct ProcessingServer<S> {
    storage: Arc<S>,
    dispatcher: Dispatcher,
    config: Arc<Config>,
    instance: String,
    held: Mutex<HashSet<&'static str>>,
}

impl<S: DataStorage> ProcessingServer<S> {
    pub fn new(storage: Arc<S>, dispatcher: Dispatcher, config: Arc<Config>, instance: String) -> Self {
        Self {
            storage,
            dispatcher,
            config,
            instance,
            held: Mutex::new(HashSet::new()),
        }
    }

    /// Spawns the retry sweep, the delayed sweep (when delayed publishing
    /// is enabled) and the collector.
    pub fn start(self: Arc<Self>, cancellation: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let this = self.clone();
        handles.push(tokio::spawn(every(
            "retry",
            self.config.failed_retry_interval(),
            cancellation.clone(),
            move || {
                let this = this.clone();
                async move { this.retry_sweep().await.map(|_| ()) }
            },
        )));

        if self.config.enable_delayed_publish {
            let this = self.clone();
            handles.push(tokio::spawn(every(
                "delayed",
                self.config.delayed_poll_interval(),
                cancellation.clone(),
                move || {
                    let this = this.clone();
                    async move { this.delayed_sweep().await.map(|_| ()) }
                },
            )));
        }

        let this = self.clone();
        handles.push(tokio::spawn(every(
            "collector",
            self.config.collector_interval(),
            cancellation.clone(),
            move || {
                let this = this.clone();
                async move { this.collect().await.map(|_| ()) }
            },
        )));

        let this = self;
        handles.push(tokio::spawn(async move {
            cancellation.cancelled().await;
            this.release_all().await;
        }));

        handles
    }

    /// Hands due unfinished rows of both kinds back to the dispatcher.
    /// Returns how many were dispatched.
    pub async fn retry_sweep(&self) -> Result<usize> {
        let mut dispatched = 0;

        for (kind, key) in [
            (MessageKind::Published, PUBLISH_RETRY_LOCK),
            (MessageKind::Received, RECEIVE_RETRY_LOCK),
        ] {
            if !self.lock(key, self.config.failed_retry_interval()).await? {
                continue;
            }

            let now = Utc::now();
            let query = RetryQuery {
                now,
                max_retries: self.config.failed_retry_count,
                added_before: now - to_chrono(self.config.fallback_window_lookback()),
                limit: self.config.scheduler_batch_size,
            };

            let messages = self.storage.get_messages_of_need_retry(kind, query).await?;
            if !messages.is_empty() {
                tracing::debug!(%kind, count = messages.len(), "Retrying messages");
            }

            for message in messages {
                let id = message.id;
                if let Err(e) = self.dispatcher.dispatch(kind, message).await {
                    tracing::warn!(message_id = %id, error = %e, "Could not dispatch retry");
                    break;
                }
                dispatched += 1;
            }
        }

        Ok(dispatched)
    }

    /// Promotes delayed published rows and hands them to the dispatcher.
    pub async fn delayed_sweep(&self) -> Result<usize> {
        if !self.lock(DELAYED_LOCK, self.config.delayed_poll_interval()).await? {
            return Ok(0);
        }

        let now = Utc::now();
        let query = DelayedQuery {
            now,
            lookahead_until: now + to_chrono(self.config.delayed_lookahead()),
            queued_stale_before: now - to_chrono(QUEUED_STALE_AFTER),
            limit: self.config.scheduler_batch_size,
        };

        let dispatcher = &self.dispatcher;
        let promote = |message: MediumMessage| match message.status {
            Status::Queued => {
                let due_at = message.due_at;
                dispatcher.enqueue_to_scheduler(MessageKind::Published, message, due_at);
            }
            _ => {
                let id = message.id;
                if let Err(e) = dispatcher.enqueue_to_publish(message) {
                    tracing::warn!(message_id = %id, error = %e, "Could not dispatch delayed message");
                }
            }
        };

        let promoted = self
            .storage
            .schedule_messages_of_delayed(query, &promote)
            .await?;
        if promoted > 0 {
            tracing::debug!(promoted, "Delayed messages promoted");
        }
        Ok(promoted)
    }

    /// Deletes expired terminal rows of both kinds, batch by batch.
    pub async fn collect(&self) -> Result<u64> {
        let batch = self.config.collector_batch_size.max(1);
        let mut total = 0;

        for kind in [MessageKind::Published, MessageKind::Received] {
            loop {
                let deleted = self.storage.delete_expires(kind, Utc::now(), batch).await?;
                total += deleted;
                if deleted < batch as u64 {
                    break;
                }
            }
        }

        if total > 0 {
            tracing::debug!(deleted = total, "Expired messages collected");
        }
        Ok(total)
    }

    /// Takes or renews the storage lock for `key`. Always true without
    /// `use_storage_lock`.
    /// Takes or renews `key` for a sweep that runs every `period`.
    async fn lock(&self, key: &'static str, period: Duration) -> Result<bool> {
        if !self.config.use_storage_lock {
            return Ok(true);
        }

        let ttl = self.config.lock_ttl_for(period);
        let holding = self.held().contains(key);

        let mut acquired = holding && self.storage.renew_lock(key, &self.instance, ttl).await?;
        if !acquired {
            acquired = self.storage.acquire_lock(key, &self.instance, ttl).await?;
        }

        if acquired {
            if !holding {
                tracing::debug!(key, instance = %self.instance, "Storage lock acquired");
            }
            self.held().insert(key);
        } else {
            if holding {
                tracing::warn!(key, instance = %self.instance, "Storage lock lost");
            }
            self.held().remove(key);
            tracing::trace!(key, "Storage lock held elsewhere, skipping");
        }
        Ok(acquired)
    }

    async fn release_all(&self) {
        let keys = self.held().drain().collect::<Vec<_>>();
        for key in keys {
            if let Err(e) = self.storage.release_lock(key, &self.instance).await {
                tracing::warn!(key, error = %e, "Failed to release storage lock");
            }
        }
    }

    fn held(&self) -> std::sync::MutexGuard<'_, HashSet<&'static str>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs `tick` every `period` until cancelled. Errors are logged and the
/// loop carries on with the next tick.
async fn every<F, Fut>(name: &'static str, period: Duration, cancellation: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => break,
            _ = interval.tick() => {}
        }

        if let Err(e) = tick().await {
            tracing::error!(task = name, error = %e, "Background task failed");
        }
    }

    tracing::debug!(task = name, "Background task stopped");
}
