//! Engine configuration.
//!
//! [`Options`] deserializes from any serde source (missing fields fall back
//! to their defaults) and can also be assembled with the `with_*` builder
//! methods.

use std::{collections::HashMap, sync::OnceLock, time::Duration};

use serde::Deserialize;

use crate::{
    outbox::lifecycle::{ExponentialBackoff, RetryPolicy},
    topic,
};

/// Configuration shared by the outbox, the producer and the consumer side.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Group used by handlers that do not name one.
    pub default_group_name: String,
    /// Prepended to every group name.
    pub group_name_prefix: Option<String>,
    /// Prepended to every topic, on both the publish and the consume side.
    pub topic_name_prefix: Option<String>,
    /// Appended to every group name, so that two versions of a service get
    /// their own copies of each message.
    pub version: Option<String>,
    /// Concurrent handler invocations per group; `0` means sequential.
    pub group_concurrency: usize,
    /// Per-group overrides of `group_concurrency`.
    pub group_concurrency_overrides: HashMap<String, usize>,
    /// Attempts after which a message is terminally failed.
    pub failed_retry_count: u32,
    /// Base interval of the exponential backoff, in milliseconds.
    pub failed_retry_interval_ms: u64,
    /// Cap of the exponential backoff, in milliseconds.
    pub max_retry_interval_ms: u64,
    /// How long a record may stay `Sending` before another attempt may take
    /// it over, in milliseconds.
    pub in_flight_lease_ms: u64,
    /// How long succeeded records are kept, in seconds.
    pub succeed_message_expired_after_secs: u64,
    /// How long failed records are kept, in seconds.
    pub failed_message_expired_after_secs: u64,
    /// Interval between two sweeps for due records, in milliseconds.
    pub polling_interval_ms: u64,
    /// Records fetched per sweep.
    pub batch_size: usize,
    /// Capacity of each group's in-memory delivery queue.
    pub queue_capacity: usize,
    /// How long a consumer client waits for a message before polling its
    /// cancellation signal again, in milliseconds.
    pub listen_timeout_ms: u64,
    /// Written into the instance-id header of every published message.
    /// When unset, an id generated once per process is used.
    pub instance_id: Option<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            default_group_name: "courier.queue".to_owned(),
            group_name_prefix: None,
            topic_name_prefix: None,
            version: None,
            group_concurrency: 0,
            group_concurrency_overrides: HashMap::new(),
            failed_retry_count: 50,
            failed_retry_interval_ms: 60 * 1000,
            max_retry_interval_ms: 60 * 60 * 1000,
            in_flight_lease_ms: 4 * 60 * 1000,
            succeed_message_expired_after_secs: 24 * 3600,
            failed_message_expired_after_secs: 15 * 24 * 3600,
            polling_interval_ms: 1000,
            batch_size: 1000,
            queue_capacity: 1000,
            listen_timeout_ms: 1000,
            instance_id: None,
        }
    }
}

impl Options {
    pub fn with_default_group_name(mut self, name: impl Into<String>) -> Self {
        self.default_group_name = name.into();
        self
    }

    pub fn with_group_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.group_name_prefix = Some(prefix.into());
        self
    }

    pub fn with_topic_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_name_prefix = Some(prefix.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_group_concurrency(mut self, concurrency: usize) -> Self {
        self.group_concurrency = concurrency;
        self
    }

    /// Override the concurrency of a single, fully resolved group name.
    pub fn with_group_concurrency_for(mut self, group: impl Into<String>, concurrency: usize) -> Self {
        self.group_concurrency_overrides
            .insert(group.into(), concurrency);
        self
    }

    pub fn with_failed_retry_count(mut self, count: u32) -> Self {
        self.failed_retry_count = count;
        self
    }

    pub fn with_failed_retry_interval(mut self, interval: Duration) -> Self {
        self.failed_retry_interval_ms = millis(interval);
        self
    }

    pub fn with_max_retry_interval(mut self, interval: Duration) -> Self {
        self.max_retry_interval_ms = millis(interval);
        self
    }

    pub fn with_in_flight_lease(mut self, lease: Duration) -> Self {
        self.in_flight_lease_ms = millis(lease);
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval_ms = millis(interval);
        self
    }

    pub fn with_listen_timeout(mut self, timeout: Duration) -> Self {
        self.listen_timeout_ms = millis(timeout);
        self
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Concurrency of a resolved group name.
    pub fn group_concurrency(&self, group: &str) -> usize {
        self.group_concurrency_overrides
            .get(group)
            .copied()
            .unwrap_or(self.group_concurrency)
    }

    /// Resolve the full group name of a handler.
    ///
    /// `explicit` falls back to the default group; the group prefix and the
    /// version are then applied.
    pub fn group_name(&self, explicit: Option<&str>) -> String {
        let group = explicit.unwrap_or(&self.default_group_name);
        let group = topic::apply_prefix(self.group_name_prefix.as_deref(), group);
        match self.version.as_deref() {
            Some(version) if !version.is_empty() => format!("{group}.{version}"),
            _ => group,
        }
    }

    /// Topic under which a message named `name` is published.
    pub fn topic_name(&self, name: &str) -> String {
        topic::apply_prefix(self.topic_name_prefix.as_deref(), name)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::from_millis(self.listen_timeout_ms)
    }

    /// Id stamped on published messages: the configured one, or the id of
    /// this process.
    pub fn instance_id(&self) -> &str {
        self.instance_id.as_deref().unwrap_or_else(|| process_instance_id())
    }

    /// Retry policy described by these options, with exponential backoff.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(ExponentialBackoff::new(
            Duration::from_millis(self.failed_retry_interval_ms),
            Duration::from_millis(self.max_retry_interval_ms),
        ))
        .with_failed_retry_count(self.failed_retry_count)
        .with_succeed_expiration(Duration::from_secs(self.succeed_message_expired_after_secs))
        .with_failed_expiration(Duration::from_secs(self.failed_message_expired_after_secs))
        .with_in_flight_lease(Duration::from_millis(self.in_flight_lease_ms))
    }
}

/// Saturates instead of truncating durations past `u64::MAX` milliseconds.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn process_instance_id() -> &'static str {
    static ID: OnceLock<String> = OnceLock::new();
    ID.get_or_init(|| uuid::Uuid::new_v4().to_string())
}
