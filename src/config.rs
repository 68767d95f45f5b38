use std::time::Duration;

use serde::Deserialize;

/// Engine configuration.
///
/// Every field has a default, so `Config::default()` is a usable single-node
/// setup. [`Config::load`] overlays `COURIER_*` environment variables, e.g.
/// `COURIER_FAILED_RETRY_COUNT=5`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: Option<String>,

    /// Appended to group names so incompatible deployments don't share queues.
    pub version: String,
    pub default_group_name: String,
    pub group_name_prefix: Option<String>,
    pub topic_name_prefix: Option<String>,

    /// Attempts before a message is marked `Failed`.
    pub failed_retry_count: u32,
    /// Period of the retry sweep.
    pub failed_retry_interval_ms: u64,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    /// The retry sweep ignores messages younger than this, leaving them to
    /// the in-process fast path.
    pub fallback_window_lookback_secs: u64,

    pub succeed_message_expired_after_secs: u64,
    pub failed_message_expired_after_secs: u64,

    /// Consumer clients per group.
    pub consumer_thread_count: usize,
    /// Workers sending published messages.
    pub producer_thread_count: usize,
    /// Workers executing received messages, per channel.
    pub subscriber_execute_thread_count: usize,
    pub channel_capacity: usize,
    pub use_dispatching_per_group: bool,
    pub use_storage_lock: bool,
    pub enable_delayed_publish: bool,

    pub scheduler_batch_size: usize,
    pub delayed_poll_interval_ms: u64,
    pub delayed_lookahead_secs: u64,
    pub collector_interval_ms: u64,
    pub collector_batch_size: usize,

    pub claim_lease_secs: u64,
    pub lock_ttl_secs: u64,
    pub listen_timeout_ms: u64,
    pub shutdown_grace_ms: u64,

    /// Snowflake worker id (0..=1023). Random when unset.
    pub worker_id: Option<u16>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("COURIER_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path.as_deref().unwrap_or("courier.db")
    }

    /// Fully qualified topic name for `name`.
    pub fn topic_name(&self, name: &str) -> String {
        match &self.topic_name_prefix {
            Some(prefix) if !name.starts_with(&format!("{prefix}.")) => format!("{prefix}.{name}"),
            _ => name.to_owned(),
        }
    }

    /// Fully qualified group name; `None` resolves to the default group.
    pub fn group_name(&self, group: Option<&str>) -> String {
        let group = group.unwrap_or(&self.default_group_name);
        match &self.group_name_prefix {
            Some(prefix) => format!("{prefix}.{group}.{}", self.version),
            None => format!("{group}.{}", self.version),
        }
    }

    pub fn failed_retry_interval(&self) -> Duration {
        Duration::from_millis(self.failed_retry_interval_ms)
    }

    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms)
    }

    pub fn fallback_window_lookback(&self) -> Duration {
        Duration::from_secs(self.fallback_window_lookback_secs)
    }

    pub fn succeed_message_expired_after(&self) -> Duration {
        Duration::from_secs(self.succeed_message_expired_after_secs)
    }

    pub fn failed_message_expired_after(&self) -> Duration {
        Duration::from_secs(self.failed_message_expired_after_secs)
    }

    pub fn delayed_poll_interval(&self) -> Duration {
        Duration::from_millis(self.delayed_poll_interval_ms)
    }

    pub fn delayed_lookahead(&self) -> Duration {
        Duration::from_secs(self.delayed_lookahead_secs)
    }

    pub fn collector_interval(&self) -> Duration {
        Duration::from_millis(self.collector_interval_ms)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    /// TTL for a storage lock renewed every `period`. Spans several
    /// periods so a late tick does not hand the lock to another node.
    pub fn lock_ttl_for(&self, period: Duration) -> Duration {
        self.lock_ttl().max(period.saturating_mul(3))
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::from_millis(self.listen_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            version: "v1".to_owned(),
            default_group_name: "courier.queue".to_owned(),
            group_name_prefix: None,
            topic_name_prefix: None,
            failed_retry_count: 50,
            failed_retry_interval_ms: 60_000,
            retry_backoff_base_ms: 1_000,
            retry_backoff_max_ms: 300_000,
            fallback_window_lookback_secs: 240,
            succeed_message_expired_after_secs: 60 * 60,
            failed_message_expired_after_secs: 15 * 24 * 60 * 60,
            consumer_thread_count: 1,
            producer_thread_count: 1,
            subscriber_execute_thread_count: 1,
            channel_capacity: 1_000,
            use_dispatching_per_group: false,
            use_storage_lock: false,
            enable_delayed_publish: true,
            scheduler_batch_size: 1_000,
            delayed_poll_interval_ms: 1_000,
            delayed_lookahead_secs: 120,
            collector_interval_ms: 300_000,
            collector_batch_size: 1_000,
            claim_lease_secs: 300,
            lock_ttl_secs: 60,
            listen_timeout_ms: 1_000,
            shutdown_grace_ms: 10_000,
            worker_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_and_topic_naming() {
        let mut config = Config::default();
        assert_eq!(config.group_name(None), "courier.queue.v1");
        assert_eq!(config.group_name(Some("billing")), "billing.v1");
        assert_eq!(config.topic_name("order.created"), "order.created");

        config.group_name_prefix = Some("shop".to_owned());
        config.topic_name_prefix = Some("shop".to_owned());
        assert_eq!(config.group_name(Some("billing")), "shop.billing.v1");
        assert_eq!(config.topic_name("order.created"), "shop.order.created");
        assert_eq!(config.topic_name("shop.order.created"), "shop.order.created");
        assert_eq!(config.topic_name("shopping.cart"), "shop.shopping.cart");
    }

    #[test]
    fn lock_outlives_several_sweeps() {
        let config = Config::default();
        assert_eq!(config.lock_ttl_for(config.failed_retry_interval()), Duration::from_secs(180));
        assert_eq!(config.lock_ttl_for(config.delayed_poll_interval()), config.lock_ttl());
        assert!(config.lock_ttl_for(config.failed_retry_interval()) > config.failed_retry_interval());
    }

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.succeed_message_expired_after(), Duration::from_secs(3600));
        assert!(config.retry_backoff_base() <= config.retry_backoff_max());
        assert!(config.enable_delayed_publish);
        assert_eq!(config.db_path(), "courier.db");
    }
}
