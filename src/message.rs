//! Message types and status management for the dispatch engine.
//!
//! A [`Message`] is what the application publishes or a subscriber receives:
//! a header map plus an opaque body. Once it is persisted it travels through
//! the engine wrapped in a [`MediumMessage`], which adds the bookkeeping the
//! dispatcher and the sweepers act on.
//!
//! # Message Lifecycle
//!
//! 1. Messages are stored as `Scheduled` (or `Delayed` for timed sends)
//! 2. A dispatch worker claims the row, moving it to `Processing`
//! 3. Delivery succeeds and the row becomes `Succeeded`, or it fails and goes
//!    back to `Scheduled` with a later due time
//! 4. Once the retry budget is spent the row becomes `Failed`
//!
//! Terminal rows carry an expiry and are eventually removed by the collector.

use std::{collections::BTreeMap, fmt, str::FromStr};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result};

/// Well-known header names.
pub mod headers {
    pub const MESSAGE_ID: &str = "courier-msg-id";
    pub const MESSAGE_NAME: &str = "courier-msg-name";
    pub const GROUP: &str = "courier-msg-group";
    pub const TYPE: &str = "courier-msg-type";
    pub const CORRELATION_ID: &str = "courier-corr-id";
    pub const CORRELATION_SEQUENCE: &str = "courier-corr-seq";
    pub const CALLBACK_NAME: &str = "courier-callback-name";
    pub const SENT_TIME: &str = "courier-senttime";
    pub const DELAY_TIME: &str = "courier-delaytime";
    pub const EXCEPTION: &str = "courier-exception";
}

pub type Headers = BTreeMap<String, String>;

/// Globally unique, time-ordered message identifier.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct MessageId(i64);

impl MessageId {
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MessageId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Current status of a stored message.
///
/// `Succeeded` and `Failed` are terminal; every other status is actionable.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Status {
    /// Ready to be claimed once `due_at` has passed
    Scheduled,
    /// Handed to a node-local scheduler, waiting for `due_at`
    Queued,
    /// Claimed by a worker; `due_at` holds the claim lease deadline
    Processing,
    /// Delivered or handled successfully
    Succeeded,
    /// Retry budget exhausted
    Failed,
    /// Timed send that has not been promoted yet
    Delayed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Which table a message lives in. Published and received rows never share
/// an id space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageKind {
    Published,
    Received,
}

/// Application-level message: headers plus an opaque body.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Message {
    pub headers: Headers,
    pub body: Bytes,
}

impl Message {
    pub fn new(headers: Headers, body: impl Into<Bytes>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn id(&self) -> Result<MessageId> {
        self.header(headers::MESSAGE_ID)
            .ok_or_else(|| Error::missing_header(headers::MESSAGE_ID))?
            .parse()
            .map_err(|_| Error::invalid_header(headers::MESSAGE_ID))
    }

    pub fn name(&self) -> Option<&str> {
        self.header(headers::MESSAGE_NAME)
    }

    pub fn group(&self) -> Option<&str> {
        self.header(headers::GROUP)
    }

    pub fn callback_name(&self) -> Option<&str> {
        self.header(headers::CALLBACK_NAME)
            .filter(|name| !name.is_empty())
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header(headers::CORRELATION_ID)
    }

    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// A message as tracked by storage and the dispatcher.
#[derive(Clone, Debug, PartialEq)]
pub struct MediumMessage {
    pub id: MessageId,
    pub origin: Message,
    /// Serialized `origin` as written to storage. Never rewritten.
    pub content: Bytes,
    pub added: DateTime<Utc>,
    /// `None` while the message is actionable.
    pub expires_at: Option<DateTime<Utc>>,
    /// Earliest time the message may be claimed.
    pub due_at: DateTime<Utc>,
    /// Failed attempts so far.
    pub retries: u32,
    pub status: Status,
    /// Description of the most recent failure.
    pub exception: Option<String>,
}

impl MediumMessage {
    pub fn name(&self) -> &str {
        self.origin.name().unwrap_or_default()
    }

    pub fn group(&self) -> Option<&str> {
        self.origin.group()
    }
}

/// Wire envelope exchanged with broker adapters.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct TransportMessage {
    pub headers: Headers,
    pub body: Bytes,
}

impl TransportMessage {
    pub fn new(headers: Headers, body: impl Into<Bytes>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.headers.get(headers::MESSAGE_NAME).map(String::as_str)
    }

    pub fn group(&self) -> Option<&str> {
        self.headers.get(headers::GROUP).map(String::as_str)
    }
}

/// Passed to the failed-threshold callback when a message runs out of
/// retries.
#[derive(Clone, Debug)]
pub struct FailedInfo {
    pub kind: MessageKind,
    pub message: MediumMessage,
}
