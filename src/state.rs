//! Status transitions and the policies attached to them.
//!
//! [`StateMachine::apply`] is the only place that moves a message between
//! statuses. It stamps expiry and due times; [`StateChanger`] persists the
//! result and runs the retry policy when an attempt fails.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};

use crate::{
    config::Config,
    error::{Error, Result},
    message::{FailedInfo, MediumMessage, MessageKind, Status},
    storage::{DataStorage, StateGuard},
};

/// Invoked once per message when its retry budget runs out.
pub type FailedThresholdCallback = Arc<dyn Fn(FailedInfo) + Send + Sync>;

/// Whether `from -> to` is a legal move.
///
/// Re-applying a terminal status is legal and has no effect.
pub fn can_transition(from: Status, to: Status) -> bool {
    use Status::*;

    match (from, to) {
        (a, b) if a == b && a.is_terminal() => true,
        (Delayed, Queued | Scheduled | Processing) => true,
        (Queued, Scheduled | Processing) => true,
        (Scheduled, Queued | Processing | Failed) => true,
        // Processing -> Processing is a reclaim after an expired lease.
        (Processing, Processing | Scheduled | Succeeded | Failed) => true,
        _ => false,
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[derive(Clone, Debug)]
pub struct StateMachine {
    succeeded_ttl: Duration,
    failed_ttl: Duration,
    lease: Duration,
}

impl StateMachine {
    pub fn new(config: &Config) -> Self {
        Self {
            succeeded_ttl: config.succeed_message_expired_after(),
            failed_ttl: config.failed_message_expired_after(),
            lease: config.claim_lease(),
        }
    }

    /// Moves `message` to `to`.
    ///
    /// Returns `Ok(false)` when the message already sits in terminal status
    /// `to`; nothing was changed and nothing needs persisting.
    pub fn apply(&self, message: &mut MediumMessage, to: Status, now: DateTime<Utc>) -> Result<bool> {
        if message.status == to && to.is_terminal() {
            return Ok(false);
        }

        if !can_transition(message.status, to) {
            return Err(Error::InvalidTransition {
                from: message.status,
                to,
            });
        }

        match to {
            Status::Succeeded => message.expires_at = Some(now + to_chrono(self.succeeded_ttl)),
            Status::Failed => message.expires_at = Some(now + to_chrono(self.failed_ttl)),
            Status::Processing => {
                message.expires_at = None;
                message.due_at = now + to_chrono(self.lease);
            }
            Status::Scheduled | Status::Queued | Status::Delayed => message.expires_at = None,
        }

        message.status = to;
        Ok(true)
    }
}

/// Exponential backoff bounded by a retry budget.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { due_at: DateTime<Utc> },
    Exhausted,
    /// The claim expired and the row moved on; the failure was not recorded.
    Superseded,
}

impl RetryPolicy {
    pub fn new(config: &Config) -> Self {
        Self {
            max_attempts: config.failed_retry_count.max(1),
            base: config.retry_backoff_base(),
            max: config.retry_backoff_max(),
        }
    }

    /// Delay before the next attempt, given the number of failures so far.
    /// Non-decreasing in `retries` and never above `max`.
    pub fn backoff(&self, retries: u32) -> Duration {
        let exponent = retries.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Counts one failed attempt against `message`.
    pub fn on_failure(
        &self,
        message: &mut MediumMessage,
        error: &str,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        message.retries = message.retries.saturating_add(1);
        message.exception = Some(error.to_owned());

        if message.retries >= self.max_attempts {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry {
                due_at: now + to_chrono(self.backoff(message.retries)),
            }
        }
    }
}

/// Applies transitions and persists them.
pub struct StateChanger<S> {
    storage: Arc<S>,
    machine: StateMachine,
    policy: RetryPolicy,
    failed_threshold_callback: Option<FailedThresholdCallback>,
}

impl<S: DataStorage> StateChanger<S> {
    pub fn new(
        storage: Arc<S>,
        config: &Config,
        failed_threshold_callback: Option<FailedThresholdCallback>,
    ) -> Self {
        Self {
            storage,
            machine: StateMachine::new(config),
            policy: RetryPolicy::new(config),
            failed_threshold_callback,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns whether storage changed. A row that moved on since `message`
    /// was read is left alone.
    pub async fn apply(&self, kind: MessageKind, message: &mut MediumMessage, to: Status) -> Result<bool> {
        let guard = StateGuard::of(message);
        self.transition(kind, message, to, guard).await
    }

    async fn transition(
        &self,
        kind: MessageKind,
        message: &mut MediumMessage,
        to: Status,
        guard: StateGuard,
    ) -> Result<bool> {
        if !self.machine.apply(message, to, Utc::now())? {
            return Ok(false);
        }

        let changed = self.storage.change_state(kind, message, guard).await?;
        if !changed {
            tracing::debug!(
                message_id = %message.id,
                status = %to,
                "Row changed since it was claimed, state not written"
            );
        }
        Ok(changed)
    }

    /// Records a failed attempt: reschedules with backoff, or marks the
    /// message `Failed` and notifies the threshold callback. Nothing happens
    /// when the claim on `message` is no longer current.
    pub async fn fail(
        &self,
        kind: MessageKind,
        message: &mut MediumMessage,
        error: &Error,
    ) -> Result<RetryDecision> {
        let guard = StateGuard::of(message);
        let decision = self.policy.on_failure(message, &error.to_string(), Utc::now());

        match decision {
            RetryDecision::Retry { due_at } => {
                message.due_at = due_at;
                if !self.transition(kind, message, Status::Scheduled, guard).await? {
                    return Ok(RetryDecision::Superseded);
                }

                tracing::warn!(
                    message_id = %message.id,
                    name = message.name(),
                    retries = message.retries,
                    %due_at,
                    error = %error,
                    "Attempt failed, rescheduled"
                );
            }
            RetryDecision::Exhausted => {
                if !self.transition(kind, message, Status::Failed, guard).await? {
                    return Ok(RetryDecision::Superseded);
                }

                tracing::error!(
                    message_id = %message.id,
                    name = message.name(),
                    retries = message.retries,
                    error = %error,
                    "Retry budget exhausted, message failed"
                );

                if let Some(callback) = &self.failed_threshold_callback {
                    callback(FailedInfo {
                        kind,
                        message: message.clone(),
                    });
                }
            }
            RetryDecision::Superseded => {}
        }

        Ok(decision)
    }
}
