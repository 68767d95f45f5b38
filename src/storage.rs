//! Storage abstraction for published and received messages.
//!
//! Storage is the source of truth for who owns a message: claims are
//! conditional updates on the row, never in-memory locks, so several
//! processes can share one database without delivering a message twice.
//!
//! Two backends ship with the crate: [`memory::InMemoryStorage`] for tests
//! and single-process setups, and [`sqlite::SqliteStorage`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::Serialize;

use crate::{
    error::Result,
    message::{MediumMessage, MessageId, MessageKind, Status},
};

pub mod memory;
pub mod sqlite;

/// Lock key guarding the published-message retry sweep.
pub const PUBLISH_RETRY_LOCK: &str = "publish_retry";
/// Lock key guarding the received-message retry sweep.
pub const RECEIVE_RETRY_LOCK: &str = "received_retry";
/// Lock key guarding delayed-message promotion.
pub const DELAYED_LOCK: &str = "publish_delayed";

/// Status and due time a row must still carry for a state write to land.
///
/// A claim stores the lease deadline in `due_at`, so a worker whose lease
/// was taken over no longer matches and its write is dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateGuard {
    pub status: Status,
    pub due_at: DateTime<Utc>,
}

impl StateGuard {
    pub fn of(message: &MediumMessage) -> Self {
        Self {
            status: message.status,
            due_at: message.due_at,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// A row for the same (message id, group) already exists.
    Duplicate,
}

/// Selects rows the retry sweep should hand back to the dispatcher.
#[derive(Clone, Copy, Debug)]
pub struct RetryQuery {
    pub now: DateTime<Utc>,
    /// Only rows with fewer failed attempts than this.
    pub max_retries: u32,
    /// Only rows added at or before this instant.
    pub added_before: DateTime<Utc>,
    pub limit: usize,
}

/// Selects delayed published rows to promote.
#[derive(Clone, Copy, Debug)]
pub struct DelayedQuery {
    pub now: DateTime<Utc>,
    /// `Delayed` rows due at or before this instant are promoted.
    pub lookahead_until: DateTime<Utc>,
    /// `Queued` rows due before this instant were orphaned by a node that
    /// went away and are handed out again.
    pub queued_stale_before: DateTime<Utc>,
    pub limit: usize,
}

#[derive(Clone, Debug, Default)]
pub struct MessageQuery {
    pub status: Option<Status>,
    pub name: Option<String>,
    pub group: Option<String>,
    pub limit: Option<usize>,
}

impl MessageQuery {
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub published: HashMap<Status, u64>,
    pub received: HashMap<Status, u64>,
}

impl Statistics {
    pub fn count(&self, kind: MessageKind, status: Status) -> u64 {
        let counts = match kind {
            MessageKind::Published => &self.published,
            MessageKind::Received => &self.received,
        };
        counts.get(&status).copied().unwrap_or_default()
    }
}

/// Receives every message promoted by
/// [`DataStorage::schedule_messages_of_delayed`].
pub type ScheduleCallback<'a> = &'a (dyn Fn(MediumMessage) + Send + Sync);

/// Persistence contract the engine runs on.
///
/// Implementations must make [`claim`](DataStorage::claim) and
/// [`change_state`](DataStorage::change_state) atomic per row.
pub trait DataStorage: Send + Sync + 'static {
    /// Backend transaction that application code can share with
    /// [`store_message`](DataStorage::store_message).
    type Transaction: Send + 'static;

    fn begin(&self) -> BoxFuture<'_, Result<Self::Transaction>>;

    fn commit(&self, tx: Self::Transaction) -> BoxFuture<'_, Result<()>>;

    fn rollback(&self, tx: Self::Transaction) -> BoxFuture<'_, Result<()>>;

    /// Writes a published message, through `tx` when given.
    fn store_message<'a>(
        &'a self,
        message: &'a MediumMessage,
        tx: Option<&'a mut Self::Transaction>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Writes a received message unless one with the same origin id and
    /// group is already stored.
    fn store_received_message<'a>(
        &'a self,
        message: &'a MediumMessage,
    ) -> BoxFuture<'a, Result<StoreOutcome>>;

    /// Writes an inbound message that cannot be handled, as given (the
    /// caller marks it `Failed`).
    fn store_received_exception_message<'a>(
        &'a self,
        message: &'a MediumMessage,
    ) -> BoxFuture<'a, Result<()>>;

    /// Moves a row to `Processing` with lease deadline `lease_until`, if it
    /// is `Scheduled`, `Queued` or `Delayed` and due, or `Processing` with an
    /// expired lease. Returns the claimed row, or `None` when somebody else
    /// owns it or it is not due.
    fn claim<'a>(
        &'a self,
        kind: MessageKind,
        id: MessageId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Option<MediumMessage>>>;

    /// Persists status, retries, expiry, due time and exception of
    /// `message` if the row still matches `guard`. Terminal rows are never
    /// rewritten. Returns whether the row changed.
    fn change_state<'a>(
        &'a self,
        kind: MessageKind,
        message: &'a MediumMessage,
        guard: StateGuard,
    ) -> BoxFuture<'a, Result<bool>>;

    /// Due `Scheduled` rows and `Processing` rows whose lease expired.
    fn get_messages_of_need_retry(
        &self,
        kind: MessageKind,
        query: RetryQuery,
    ) -> BoxFuture<'_, Result<Vec<MediumMessage>>>;

    /// Deletes at most `batch_size` terminal rows that expired before `now`.
    fn delete_expires(
        &self,
        kind: MessageKind,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> BoxFuture<'_, Result<u64>>;

    /// Promotes due `Delayed` published rows (to `Scheduled` when already
    /// due, `Queued` otherwise), re-selects orphaned `Queued` rows, and
    /// passes each to `callback`. Returns how many were handed out.
    fn schedule_messages_of_delayed<'a>(
        &'a self,
        query: DelayedQuery,
        callback: ScheduleCallback<'a>,
    ) -> BoxFuture<'a, Result<usize>>;

    /// Takes `key` for `instance` until `now + ttl` if it is free, expired or
    /// already held by `instance`.
    fn acquire_lock<'a>(
        &'a self,
        key: &'a str,
        instance: &'a str,
        ttl: std::time::Duration,
    ) -> BoxFuture<'a, Result<bool>>;

    fn renew_lock<'a>(
        &'a self,
        key: &'a str,
        instance: &'a str,
        ttl: std::time::Duration,
    ) -> BoxFuture<'a, Result<bool>>;

    fn release_lock<'a>(&'a self, key: &'a str, instance: &'a str) -> BoxFuture<'a, Result<()>>;

    fn get_message(
        &self,
        kind: MessageKind,
        id: MessageId,
    ) -> BoxFuture<'_, Result<Option<MediumMessage>>>;

    fn query_messages(
        &self,
        kind: MessageKind,
        query: MessageQuery,
    ) -> BoxFuture<'_, Result<Vec<MediumMessage>>>;

    fn statistics(&self) -> BoxFuture<'_, Result<Statistics>>;

    fn claim_published(
        &self,
        id: MessageId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<MediumMessage>>> {
        self.claim(MessageKind::Published, id, now, lease_until)
    }

    fn claim_received(
        &self,
        id: MessageId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<MediumMessage>>> {
        self.claim(MessageKind::Received, id, now, lease_until)
    }

    fn change_publish_state<'a>(
        &'a self,
        message: &'a MediumMessage,
        guard: StateGuard,
    ) -> BoxFuture<'a, Result<bool>> {
        self.change_state(MessageKind::Published, message, guard)
    }

    fn change_receive_state<'a>(
        &'a self,
        message: &'a MediumMessage,
        guard: StateGuard,
    ) -> BoxFuture<'a, Result<bool>> {
        self.change_state(MessageKind::Received, message, guard)
    }

    fn get_published_messages_of_need_retry(
        &self,
        query: RetryQuery,
    ) -> BoxFuture<'_, Result<Vec<MediumMessage>>> {
        self.get_messages_of_need_retry(MessageKind::Published, query)
    }

    fn get_received_messages_of_need_retry(
        &self,
        query: RetryQuery,
    ) -> BoxFuture<'_, Result<Vec<MediumMessage>>> {
        self.get_messages_of_need_retry(MessageKind::Received, query)
    }
}

/// Claim eligibility shared by the backends.
pub(crate) fn is_claimable(message: &MediumMessage, now: DateTime<Utc>) -> bool {
    match message.status {
        Status::Scheduled | Status::Queued | Status::Delayed | Status::Processing => {
            message.due_at <= now
        }
        Status::Succeeded | Status::Failed => false,
    }
}

/// Retry-sweep eligibility shared by the backends.
pub(crate) fn needs_retry(message: &MediumMessage, query: &RetryQuery) -> bool {
    matches!(message.status, Status::Scheduled | Status::Processing)
        && message.due_at <= query.now
        && message.retries < query.max_retries
        && message.added <= query.added_before
}

pub(crate) fn is_expired(message: &MediumMessage, now: DateTime<Utc>) -> bool {
    message.status.is_terminal() && message.expires_at.is_some_and(|at| at < now)
}
