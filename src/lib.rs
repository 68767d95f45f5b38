//! Transactional outbox and inbox.
//!
//! Messages are written to storage together with the application's own data,
//! then delivered to a broker by background workers with retries, backoff and
//! optional delay. Inbound messages are persisted per consumer group before
//! their handler runs, so every handler sees each message at least once and
//! duplicates of a (message id, group) pair are dropped.
//!
//! Start with [`Service::launch`].

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod id;
pub mod message;
pub mod processor;
pub mod publisher;
pub mod sender;
pub mod serializer;
pub mod service;
pub mod state;
pub mod storage;
pub mod subscriber;
pub mod transport;
pub mod utils;

pub use config::Config;
pub use error::{Error, Result};
pub use message::{Headers, MediumMessage, Message, MessageId, MessageKind, Status};
pub use publisher::{OutboxTransaction, Publisher};
pub use service::Service;

/// Installs the global `tracing` subscriber, filtered by `COURIER_LOG`
/// (default `info`). Pretty output in debug builds, JSON otherwise.
pub fn init_tracing() -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_env_var("COURIER_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    Ok(())
}
