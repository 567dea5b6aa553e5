//! Queue configuration.
//!
//! `QueueConfigLayer` is the partial, serde-facing form read from each
//! configuration source; layers are merged in precedence order and then
//! finalized into a fully-populated `QueueConfig`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

/// Identifier of the low-water-mark named value.
pub const MIN_VALID_REVISION: &str = "MIN-VALID-REVISION";

/// Upper bound on every configured period, in days.
pub const MAX_PERIOD_DAYS: u32 = 36_500;

const MAX_PERIOD_SECONDS: u64 = MAX_PERIOD_DAYS as u64 * 86_400;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfigLayer {
    pub poll_interval_seconds: Option<f64>,
    pub error_backoff_seconds: Option<f64>,
    pub retry_count: Option<u32>,
    pub lock_timeout_seconds: Option<f64>,
    pub lock_retry_interval_seconds: Option<f64>,
    pub lock_expire_seconds: Option<u64>,
    pub cleanup_period_days: Option<u32>,
    pub sync_token_lifetime_days: Option<u32>,
    pub cleanup_batch_size: Option<u32>,
    pub heartbeat_interval_seconds: Option<u64>,
    pub node_freshness_seconds: Option<u64>,
    pub group_cacher_update_seconds: Option<u64>,
}

impl QueueConfigLayer {
    pub fn merge(&mut self, other: Self) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field;
                })*
            };
        }

        take!(
            poll_interval_seconds,
            error_backoff_seconds,
            retry_count,
            lock_timeout_seconds,
            lock_retry_interval_seconds,
            lock_expire_seconds,
            cleanup_period_days,
            sync_token_lifetime_days,
            cleanup_batch_size,
            heartbeat_interval_seconds,
            node_freshness_seconds,
            group_cacher_update_seconds,
        );
    }

    pub fn finalize(self) -> QueueResult<QueueConfig> {
        let defaults = QueueConfig::default();

        let config = QueueConfig {
            poll_interval: seconds("poll_interval_seconds", self.poll_interval_seconds)?
                .unwrap_or(defaults.poll_interval),
            error_backoff: seconds("error_backoff_seconds", self.error_backoff_seconds)?
                .unwrap_or(defaults.error_backoff),
            retry_count: self.retry_count.unwrap_or(defaults.retry_count),
            lock_timeout: seconds("lock_timeout_seconds", self.lock_timeout_seconds)?
                .unwrap_or(defaults.lock_timeout),
            lock_retry_interval: seconds(
                "lock_retry_interval_seconds",
                self.lock_retry_interval_seconds,
            )?
            .unwrap_or(defaults.lock_retry_interval),
            lock_expire: match whole_seconds("lock_expire_seconds", self.lock_expire_seconds)? {
                Some(expire) if expire.is_zero() => None,
                Some(expire) => Some(expire),
                None => defaults.lock_expire,
            },
            cleanup_period_days: days("cleanup_period_days", self.cleanup_period_days)?
                .unwrap_or(defaults.cleanup_period_days),
            sync_token_lifetime_days: days(
                "sync_token_lifetime_days",
                self.sync_token_lifetime_days,
            )?
            .unwrap_or(defaults.sync_token_lifetime_days),
            cleanup_batch_size: self
                .cleanup_batch_size
                .unwrap_or(defaults.cleanup_batch_size),
            heartbeat_interval: whole_seconds(
                "heartbeat_interval_seconds",
                self.heartbeat_interval_seconds,
            )?
            .unwrap_or(defaults.heartbeat_interval),
            node_freshness: whole_seconds("node_freshness_seconds", self.node_freshness_seconds)?
                .unwrap_or(defaults.node_freshness),
            group_cacher_update: whole_seconds(
                "group_cacher_update_seconds",
                self.group_cacher_update_seconds,
            )?
            .unwrap_or(defaults.group_cacher_update),
        };

        if config.poll_interval.is_zero() {
            return Err(QueueError::Config(
                "poll_interval_seconds must be greater than zero".to_string(),
            ));
        }
        if config.cleanup_batch_size == 0 {
            return Err(QueueError::Config(
                "cleanup_batch_size must be greater than zero".to_string(),
            ));
        }

        Ok(config)
    }
}

fn seconds(key: &str, value: Option<f64>) -> QueueResult<Option<Duration>> {
    let Some(v) = value else {
        return Ok(None);
    };
    let duration = Duration::try_from_secs_f64(v)
        .map_err(|e| QueueError::Config(format!("{key}: {v} is not a valid duration ({e})")))?;
    within_period(key, duration).map(Some)
}

fn whole_seconds(key: &str, value: Option<u64>) -> QueueResult<Option<Duration>> {
    value
        .map(|secs| within_period(key, Duration::from_secs(secs)))
        .transpose()
}

fn within_period(key: &str, duration: Duration) -> QueueResult<Duration> {
    if duration.as_secs() > MAX_PERIOD_SECONDS {
        return Err(QueueError::Config(format!(
            "{key}: {duration:?} exceeds {MAX_PERIOD_DAYS} days"
        )));
    }
    Ok(duration)
}

fn days(key: &str, value: Option<u32>) -> QueueResult<Option<u32>> {
    match value {
        Some(d) if d > MAX_PERIOD_DAYS => Err(QueueError::Config(format!(
            "{key}: {d} exceeds {MAX_PERIOD_DAYS} days"
        ))),
        other => Ok(other),
    }
}

/// Finalized queue configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// How often an idle dispatch loop checks for eligible work.
    pub poll_interval: Duration,
    /// Back-off after a claim/polling failure (e.g. lost connection).
    pub error_backoff: Duration,
    /// Default bound on additional attempts for `subtransaction`.
    pub retry_count: u32,
    pub lock_timeout: Duration,
    pub lock_retry_interval: Duration,
    /// TTL for lock keys; `None` keeps them until released.
    pub lock_expire: Option<Duration>,
    /// Period of the revision cleanup loop.
    pub cleanup_period_days: u32,
    /// How long sync tokens (and so revisions) must remain valid.
    pub sync_token_lifetime_days: u32,
    /// Upper bound on rows removed by one cleanup pass.
    pub cleanup_batch_size: u32,
    pub heartbeat_interval: Duration,
    /// Nodes seen within this window count as alive.
    pub node_freshness: Duration,
    pub group_cacher_update: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            error_backoff: Duration::from_secs(5),
            retry_count: 3,
            lock_timeout: Duration::from_secs(60),
            lock_retry_interval: Duration::from_millis(100),
            lock_expire: Some(Duration::from_secs(300)),
            cleanup_period_days: 1,
            sync_token_lifetime_days: 14,
            cleanup_batch_size: 1000,
            heartbeat_interval: Duration::from_secs(30),
            node_freshness: Duration::from_secs(120),
            group_cacher_update: Duration::from_secs(300),
        }
    }
}

impl QueueConfig {
    pub fn cleanup_period(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.cleanup_period_days))
    }

    pub fn sync_token_lifetime(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.sync_token_lifetime_days))
    }
}
