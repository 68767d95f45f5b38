//! In-memory storage backend.
//!
//! Rows live in concurrent maps; each row sits behind its own mutex so that
//! claims and state changes are compare-and-set per message. Useful for tests
//! and for single-process deployments that can afford to lose messages on
//! restart.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;

use crate::{
    error::Result,
    message::{MediumMessage, MessageId, MessageKind, Status},
    state::to_chrono,
};

use super::{
    is_claimable, is_expired, needs_retry, DataStorage, DelayedQuery, MessageQuery, RetryQuery,
    ScheduleCallback, StateGuard, Statistics, StoreOutcome,
};

type Row = Arc<Mutex<MediumMessage>>;

#[derive(Clone, Debug)]
struct Lease {
    instance: String,
    expires_at: DateTime<Utc>,
}

/// Writes staged by an open transaction. Nothing is visible until commit.
#[derive(Debug, Default)]
pub struct MemoryTransaction {
    staged: Vec<MediumMessage>,
}

impl MemoryTransaction {
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }
}

#[derive(Clone)]
pub struct InMemoryStorage {
    published: Arc<papaya::HashMap<MessageId, Row>>,
    received: Arc<papaya::HashMap<MessageId, Row>>,
    /// (origin id, group) -> received row id
    received_keys: Arc<papaya::HashMap<(MessageId, String), MessageId>>,
    locks: Arc<papaya::HashMap<String, Arc<Mutex<Option<Lease>>>>>,
}

fn lock(row: &Row) -> std::sync::MutexGuard<'_, MediumMessage> {
    row.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            published: Arc::new(papaya::HashMap::new()),
            received: Arc::new(papaya::HashMap::new()),
            received_keys: Arc::new(papaya::HashMap::new()),
            locks: Arc::new(papaya::HashMap::new()),
        }
    }

    fn table(&self, kind: MessageKind) -> &papaya::HashMap<MessageId, Row> {
        match kind {
            MessageKind::Published => &self.published,
            MessageKind::Received => &self.received,
        }
    }

    fn row(&self, kind: MessageKind, id: MessageId) -> Option<Row> {
        self.table(kind).pin().get(&id).cloned()
    }

    fn insert(&self, kind: MessageKind, message: MediumMessage) {
        self.table(kind)
            .pin()
            .insert(message.id, Arc::new(Mutex::new(message)));
    }

    fn snapshot(&self, kind: MessageKind) -> Vec<MediumMessage> {
        let table = self.table(kind).pin();
        let mut rows = table
            .iter()
            .map(|(_, row)| lock(row).clone())
            .collect::<Vec<_>>();
        rows.sort_by_key(|m| m.id);
        rows
    }

    fn lease_slot(&self, key: &str) -> Arc<Mutex<Option<Lease>>> {
        self.locks
            .pin()
            .get_or_insert(key.to_owned(), Arc::new(Mutex::new(None)))
            .clone()
    }
}

impl DataStorage for InMemoryStorage {
    type Transaction = MemoryTransaction;

    fn begin(&self) -> BoxFuture<'_, Result<Self::Transaction>> {
        Box::pin(async move { Ok(MemoryTransaction::default()) })
    }

    fn commit(&self, tx: Self::Transaction) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            for message in tx.staged {
                self.insert(MessageKind::Published, message);
            }
            Ok(())
        })
    }

    fn rollback(&self, tx: Self::Transaction) -> BoxFuture<'_, Result<()>> {
        drop(tx);
        Box::pin(async move { Ok(()) })
    }

    fn store_message<'a>(
        &'a self,
        message: &'a MediumMessage,
        tx: Option<&'a mut Self::Transaction>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match tx {
                Some(tx) => tx.staged.push(message.clone()),
                None => self.insert(MessageKind::Published, message.clone()),
            }
            Ok(())
        })
    }

    fn store_received_message<'a>(
        &'a self,
        message: &'a MediumMessage,
    ) -> BoxFuture<'a, Result<StoreOutcome>> {
        Box::pin(async move {
            let key = (
                message.origin.id()?,
                message.group().unwrap_or_default().to_owned(),
            );

            let owner = *self.received_keys.pin().get_or_insert(key, message.id);
            if owner != message.id {
                return Ok(StoreOutcome::Duplicate);
            }

            self.insert(MessageKind::Received, message.clone());
            Ok(StoreOutcome::Stored)
        })
    }

    fn store_received_exception_message<'a>(
        &'a self,
        message: &'a MediumMessage,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.insert(MessageKind::Received, message.clone());
            Ok(())
        })
    }

    fn claim<'a>(
        &'a self,
        kind: MessageKind,
        id: MessageId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Option<MediumMessage>>> {
        Box::pin(async move {
            let Some(row) = self.row(kind, id) else {
                return Ok(None);
            };

            let mut message = lock(&row);
            if !is_claimable(&message, now) {
                return Ok(None);
            }

            message.status = Status::Processing;
            message.due_at = lease_until;
            message.expires_at = None;
            Ok(Some(message.clone()))
        })
    }

    fn change_state<'a>(
        &'a self,
        kind: MessageKind,
        message: &'a MediumMessage,
        guard: StateGuard,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let Some(row) = self.row(kind, message.id) else {
                return Ok(false);
            };

            let mut stored = lock(&row);
            if stored.status.is_terminal() || StateGuard::of(&stored) != guard {
                return Ok(false);
            }

            stored.status = message.status;
            stored.retries = stored.retries.max(message.retries);
            stored.expires_at = message.expires_at;
            stored.due_at = message.due_at;
            stored.exception = message.exception.clone();
            Ok(true)
        })
    }

    fn get_messages_of_need_retry(
        &self,
        kind: MessageKind,
        query: RetryQuery,
    ) -> BoxFuture<'_, Result<Vec<MediumMessage>>> {
        Box::pin(async move {
            Ok(self
                .snapshot(kind)
                .into_iter()
                .filter(|m| needs_retry(m, &query))
                .take(query.limit)
                .collect())
        })
    }

    fn delete_expires(
        &self,
        kind: MessageKind,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let expired = self
                .snapshot(kind)
                .into_iter()
                .filter(|m| is_expired(m, now))
                .take(batch_size)
                .collect::<Vec<_>>();

            let table = self.table(kind).pin();
            let keys = self.received_keys.pin();
            let mut deleted = 0;
            for message in expired {
                if table.remove(&message.id).is_none() {
                    continue;
                }
                deleted += 1;

                if kind == MessageKind::Received {
                    if let Ok(origin) = message.origin.id() {
                        let key = (origin, message.group().unwrap_or_default().to_owned());
                        if keys.get(&key) == Some(&message.id) {
                            keys.remove(&key);
                        }
                    }
                }
            }
            Ok(deleted)
        })
    }

    fn schedule_messages_of_delayed<'a>(
        &'a self,
        query: DelayedQuery,
        callback: ScheduleCallback<'a>,
    ) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let rows = {
                let table = self.published.pin();
                let mut rows = table
                    .iter()
                    .map(|(id, row)| (*id, row.clone()))
                    .collect::<Vec<_>>();
                rows.sort_by_key(|(id, _)| *id);
                rows
            };

            let mut promoted = Vec::new();
            for (_, row) in rows {
                if promoted.len() >= query.limit {
                    break;
                }

                let mut message = lock(&row);
                let next = match message.status {
                    Status::Delayed if message.due_at <= query.lookahead_until => {
                        if message.due_at <= query.now {
                            Status::Scheduled
                        } else {
                            Status::Queued
                        }
                    }
                    Status::Queued if message.due_at < query.queued_stale_before => {
                        Status::Scheduled
                    }
                    _ => continue,
                };

                message.status = next;
                message.expires_at = None;
                promoted.push(message.clone());
            }

            let count = promoted.len();
            for message in promoted {
                callback(message);
            }
            Ok(count)
        })
    }

    fn acquire_lock<'a>(
        &'a self,
        key: &'a str,
        instance: &'a str,
        ttl: std::time::Duration,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let slot = self.lease_slot(key);
            let mut lease = slot.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Utc::now();

            let free = match lease.as_ref() {
                None => true,
                Some(held) => held.instance == instance || held.expires_at <= now,
            };
            if free {
                *lease = Some(Lease {
                    instance: instance.to_owned(),
                    expires_at: now + to_chrono(ttl),
                });
            }
            Ok(free)
        })
    }

    fn renew_lock<'a>(
        &'a self,
        key: &'a str,
        instance: &'a str,
        ttl: std::time::Duration,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let slot = self.lease_slot(key);
            let mut lease = slot.lock().unwrap_or_else(PoisonError::into_inner);

            match lease.as_mut() {
                Some(held) if held.instance == instance => {
                    held.expires_at = Utc::now() + to_chrono(ttl);
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn release_lock<'a>(&'a self, key: &'a str, instance: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let slot = self.lease_slot(key);
            let mut lease = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if lease.as_ref().is_some_and(|held| held.instance == instance) {
                *lease = None;
            }
            Ok(())
        })
    }

    fn get_message(
        &self,
        kind: MessageKind,
        id: MessageId,
    ) -> BoxFuture<'_, Result<Option<MediumMessage>>> {
        Box::pin(async move { Ok(self.row(kind, id).map(|row| lock(&row).clone())) })
    }

    fn query_messages(
        &self,
        kind: MessageKind,
        query: MessageQuery,
    ) -> BoxFuture<'_, Result<Vec<MediumMessage>>> {
        Box::pin(async move {
            let mut rows = self
                .snapshot(kind)
                .into_iter()
                .filter(|m| query.status.map_or(true, |s| m.status == s))
                .filter(|m| query.name.as_deref().map_or(true, |n| m.name() == n))
                .filter(|m| query.group.as_deref().map_or(true, |g| m.group() == Some(g)))
                .collect::<Vec<_>>();
            rows.reverse();
            if let Some(limit) = query.limit {
                rows.truncate(limit);
            }
            Ok(rows)
        })
    }

    fn statistics(&self) -> BoxFuture<'_, Result<Statistics>> {
        Box::pin(async move {
            let mut stats = Statistics::default();
            for (kind, counts) in [
                (MessageKind::Published, &mut stats.published),
                (MessageKind::Received, &mut stats.received),
            ] {
                for message in self.snapshot(kind) {
                    *counts.entry(message.status).or_default() += 1;
                }
            }
            Ok(stats)
        })
    }
}
