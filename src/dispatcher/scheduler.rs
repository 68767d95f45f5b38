//! Node-local delay queue.
//!
//! Holds messages whose `due_at` lies in the future (timed publishes inside
//! the look-ahead window, retries waiting out their backoff) and releases
//! them in due order. Losing its contents is harmless: storage still has the
//! rows and the sweeps pick them up.

use std::{
    cmp::{Ordering as CmpOrdering, Reverse},
    collections::BinaryHeap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::message::{MediumMessage, MessageKind};

/// Upper bound on a single idle wait, so clock jumps are noticed.
const MAX_IDLE: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct Entry {
    pub due_at: DateTime<Utc>,
    pub kind: MessageKind,
    pub message: MediumMessage,
    seq: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.due_at, self.seq).cmp(&(other.due_at, other.seq))
    }
}

#[derive(Default)]
pub struct DelayScheduler {
    queue: Mutex<BinaryHeap<Reverse<Entry>>>,
    seq: AtomicU64,
    notify: Notify,
}

impl DelayScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, kind: MessageKind, message: MediumMessage, due_at: DateTime<Utc>) {
        let entry = Entry {
            due_at,
            kind,
            message,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Reverse(entry));
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry due at `now`, in due order, and reports how long
    /// to wait for the next one.
    pub fn take_due(&self, now: DateTime<Utc>) -> (Vec<Entry>, Duration) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);

        let mut due = Vec::new();
        while queue.peek().is_some_and(|Reverse(next)| next.due_at <= now) {
            if let Some(Reverse(entry)) = queue.pop() {
                due.push(entry);
            }
        }

        let wait = queue
            .peek()
            .and_then(|Reverse(next)| (next.due_at - now).to_std().ok())
            .map_or(MAX_IDLE, |wait| wait.min(MAX_IDLE));

        (due, wait)
    }

    /// Resolves when an entry is added. A notification that arrives while
    /// nobody waits is kept for the next call.
    pub async fn changed(&self) {
        self.notify.notified().await
    }
}
