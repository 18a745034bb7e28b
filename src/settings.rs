use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub run_mode: RunMode,
    #[serde(default = "default_shards")]
    pub shards: Vec<ShardConfig>,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetricsConfig {
    /// e.g. 127.0.0.1:9090; metrics are served only when set
    pub addr: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ShardConfig {
    pub name: String,
    /// `redis` for a shared server, `memory` for an in-process keyspace
    #[serde(default = "default_shard_kind")]
    pub kind: String,
    /// Key prefix for every key this shard writes. Defaults to the shard name.
    pub prefix: Option<String>,
    /// Server url for `redis` shards.
    pub url: Option<String>,
}

impl ShardConfig {
    pub fn key_prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or(&self.name)
    }

    pub fn redis_url(&self) -> &str {
        self.url.as_deref().unwrap_or(DEFAULT_REDIS_URL)
    }
}

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

pub const DEFAULT_SHARD_NAME: &str = "default";

fn default_shard_kind() -> String {
    "redis".to_string()
}

fn default_shards() -> Vec<ShardConfig> {
    vec![ShardConfig {
        name: DEFAULT_SHARD_NAME.to_string(),
        kind: default_shard_kind(),
        prefix: None,
        url: None,
    }]
}

/// Tunables for the scheduling engine. All durations are in milliseconds.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueSettings {
    pub num_workers: usize,
    pub num_shadow_workers: usize,
    pub num_normalization_workers: usize,

    pub partition_lease_ms: u64,
    pub item_lease_ms: u64,
    pub shadow_partition_lease_ms: u64,
    pub backlog_normalize_lease_ms: u64,
    pub config_lease_ms: u64,

    pub poll_tick_ms: u64,
    pub shadow_poll_tick_ms: u64,
    pub normalize_poll_tick_ms: u64,
    pub active_check_tick_ms: u64,
    pub instrument_interval_ms: u64,
    pub scavenge_tick_ms: u64,

    pub partition_requeue_extension_ms: u64,
    pub partition_concurrency_requeue_ms: u64,
    pub partition_throttle_requeue_ms: u64,
    pub partition_paused_requeue_ms: u64,
    pub partition_lookahead_ms: u64,
    pub shadow_partition_lookahead_ms: u64,

    pub peek_min: usize,
    pub peek_max: usize,
    pub use_peek_ewma: bool,
    pub peek_size_for_functions: HashMap<String, usize>,

    pub continuation_limit: u32,
    pub continuation_skip_probability: f64,
    pub shadow_continuation_limit: u32,

    pub backlog_refill_limit: usize,
    pub backlog_normalize_concurrency: usize,
    pub idempotency_ttl_ms: u64,

    pub disable_fifo_for_functions: Vec<String>,
    pub disable_fifo_for_accounts: Vec<String>,
    pub queue_kind_mapping: HashMap<String, String>,
    pub allow_queues: Vec<String>,
    pub deny_queues: Vec<String>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            num_workers: 100,
            num_shadow_workers: 100,
            num_normalization_workers: 10,

            partition_lease_ms: 4_000,
            item_lease_ms: 30_000,
            shadow_partition_lease_ms: 4_000,
            backlog_normalize_lease_ms: 4_000,
            config_lease_ms: 10_000,

            poll_tick_ms: 10,
            shadow_poll_tick_ms: 100,
            normalize_poll_tick_ms: 250,
            active_check_tick_ms: 10_000,
            instrument_interval_ms: 10_000,
            scavenge_tick_ms: 5_000,

            partition_requeue_extension_ms: 30_000,
            partition_concurrency_requeue_ms: 5_000,
            partition_throttle_requeue_ms: 1_000,
            partition_paused_requeue_ms: 5 * 60_000,
            partition_lookahead_ms: 1_000,
            shadow_partition_lookahead_ms: 2_000,

            peek_min: 300,
            peek_max: 5_000,
            use_peek_ewma: false,
            peek_size_for_functions: HashMap::new(),

            continuation_limit: 5,
            continuation_skip_probability: 0.2,
            shadow_continuation_limit: 5,

            backlog_refill_limit: 1_000,
            backlog_normalize_concurrency: 10,
            idempotency_ttl_ms: 12 * 60 * 60 * 1_000,

            disable_fifo_for_functions: Vec::new(),
            disable_fifo_for_accounts: Vec::new(),
            queue_kind_mapping: HashMap::new(),
            allow_queues: Vec::new(),
            deny_queues: Vec::new(),
        }
    }
}

impl QueueSettings {
    pub fn item_lease(&self) -> Duration {
        Duration::from_millis(self.item_lease_ms)
    }

    pub fn partition_lease(&self) -> Duration {
        Duration::from_millis(self.partition_lease_ms)
    }

    pub fn shadow_partition_lease(&self) -> Duration {
        Duration::from_millis(self.shadow_partition_lease_ms)
    }

    pub fn backlog_normalize_lease(&self) -> Duration {
        Duration::from_millis(self.backlog_normalize_lease_ms)
    }

    pub fn config_lease(&self) -> Duration {
        Duration::from_millis(self.config_lease_ms)
    }

    pub fn poll_tick(&self) -> Duration {
        Duration::from_millis(self.poll_tick_ms)
    }

    pub fn shadow_poll_tick(&self) -> Duration {
        Duration::from_millis(self.shadow_poll_tick_ms)
    }

    pub fn normalize_poll_tick(&self) -> Duration {
        Duration::from_millis(self.normalize_poll_tick_ms)
    }

    pub fn active_check_tick(&self) -> Duration {
        Duration::from_millis(self.active_check_tick_ms)
    }

    pub fn instrument_interval(&self) -> Duration {
        Duration::from_millis(self.instrument_interval_ms)
    }

    pub fn scavenge_tick(&self) -> Duration {
        Duration::from_millis(self.scavenge_tick_ms)
    }

    /// Refill limit clamped to (0, 1000].
    pub fn effective_refill_limit(&self) -> usize {
        match self.backlog_refill_limit {
            0 => crate::backlog::BACKLOG_REFILL_HARD_LIMIT,
            n => n.min(crate::backlog::BACKLOG_REFILL_HARD_LIMIT),
        }
    }
}

/// Which loops this replica runs.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RunMode {
    pub sequential: bool,
    pub scavenger: bool,
    pub partition: bool,
    pub account: bool,
    /// 0-100; probability of scanning accounts instead of the global partition set
    pub account_weight: u32,
    pub continuations: bool,
    pub shadow_partition: bool,
    pub account_shadow_partition: bool,
    pub account_shadow_partition_weight: u32,
    pub shadow_continuations: bool,
    pub shadow_continuation_skip_probability: f64,
    pub normalize_partition: bool,
    pub active_checker: bool,
    pub instrumentation: bool,
    pub exclusive_accounts: Vec<uuid::Uuid>,
}

impl Default for RunMode {
    fn default() -> Self {
        Self {
            sequential: true,
            scavenger: true,
            partition: true,
            account: true,
            account_weight: 85,
            continuations: true,
            shadow_partition: true,
            account_shadow_partition: true,
            account_shadow_partition_weight: 85,
            shadow_continuations: true,
            shadow_continuation_skip_probability: 0.2,
            normalize_partition: true,
            active_checker: true,
            instrumentation: true,
            exclusive_accounts: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                if cfg.shards.is_empty() {
                    anyhow::bail!("config must declare at least one shard");
                }
                Ok(cfg)
            }
            None => Ok(Self {
                shards: default_shards(),
                ..Default::default()
            }),
        }
    }
}
