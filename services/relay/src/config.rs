use std::time::Duration;

use serde::Deserialize;

use tracelink_core::config::Config;

/// Relay service configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Redis connection URL.
    pub redis_url: String,
    /// TCP port for the operator HTTP API. Env var: `RELAY_PORT`.
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,
    /// Key of the event stream all outbox rows are published to.
    #[serde(default = "default_stream_key")]
    pub stream_key: String,
    /// Approximate stream length cap (`MAXLEN ~`). Unset keeps every entry.
    ///
    /// Trimming ignores consumer groups: an entry a group has not acknowledged
    /// yet can be dropped and is then never redelivered. Size the cap well
    /// above the worst consumer backlog, or leave it unset.
    #[serde(default)]
    pub stream_max_len: Option<usize>,
    /// Consumer groups provisioned at startup (comma-separated).
    #[serde(default = "default_consumer_groups")]
    pub consumer_groups: Vec<String>,
    /// Cursor new consumer groups start from: `0` replays the whole stream,
    /// `$` only sees entries published after creation.
    #[serde(default = "default_consumer_group_start_id")]
    pub consumer_group_start_id: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    /// Lease on claimed rows; a claim older than this is considered abandoned.
    #[serde(default = "default_claim_ttl_ms")]
    pub claim_ttl_ms: u64,
    /// Failed publish attempts after which a row is dead-lettered.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// PENDING rows older than this count as propagation lag.
    #[serde(default = "default_lag_threshold_secs")]
    pub lag_threshold_secs: u64,
    /// Age after which PUBLISHED rows are purged. `0` disables the purge.
    #[serde(default = "default_published_retention_days")]
    pub published_retention_days: u32,
    #[serde(default = "default_housekeeping_interval_ms")]
    pub housekeeping_interval_ms: u64,
}

impl Config for RelayConfig {}

fn default_relay_port() -> u16 {
    3120
}

fn default_stream_key() -> String {
    "tracelink:events".to_owned()
}

fn default_consumer_groups() -> Vec<String> {
    vec![
        "lineage-projector".to_owned(),
        "audit-trail".to_owned(),
        "search-index".to_owned(),
    ]
}

fn default_consumer_group_start_id() -> String {
    "0".to_owned()
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_batch_size() -> u64 {
    100
}

fn default_publish_timeout_ms() -> u64 {
    5_000
}

fn default_claim_ttl_ms() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_sweep_interval_ms() -> u64 {
    30_000
}

fn default_lag_threshold_secs() -> u64 {
    300
}

fn default_published_retention_days() -> u32 {
    30
}

fn default_housekeeping_interval_ms() -> u64 {
    3_600_000
}

impl RelayConfig {
    /// Reject settings the relay cannot run safely with.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("BATCH_SIZE must be at least 1".to_owned());
        }
        if self.max_retries == 0 {
            return Err("MAX_RETRIES must be at least 1".to_owned());
        }
        if self.publish_timeout_ms == 0 {
            return Err("PUBLISH_TIMEOUT_MS must be at least 1".to_owned());
        }
        if self.claim_ttl_ms <= self.publish_timeout_ms {
            return Err("CLAIM_TTL_MS must exceed PUBLISH_TIMEOUT_MS".to_owned());
        }
        if self.consumer_groups.iter().any(|g| g.trim().is_empty()) {
            return Err("CONSUMER_GROUPS must not contain empty names".to_owned());
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_millis(self.claim_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn lag_threshold(&self) -> Duration {
        Duration::from_secs(self.lag_threshold_secs)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }

    /// `None` when the purge is disabled.
    pub fn published_retention(&self) -> Option<Duration> {
        (self.published_retention_days > 0)
            .then(|| Duration::from_secs(u64::from(self.published_retention_days) * 86_400))
    }
}
