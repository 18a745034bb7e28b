//! Runnable partitions and the constraint configuration attached to them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::item::{ConcurrencyMode, ConcurrencyScope, QueueItem};
use crate::ulid::LeaseId;

pub const PRIORITY_MAX: u32 = 0;
pub const PRIORITY_DEFAULT: u32 = 5;
pub const PRIORITY_MIN: u32 = 9;

/// Concurrency used when nothing is configured.
pub const DEFAULT_CONCURRENCY_LIMIT: i64 = 1_000;

/// Returns true when `limit` leaves a scope unbounded.
pub fn is_unbounded(limit: i64) -> bool {
    limit <= 0
}

/// A runnable scheduling unit: one per function, one per system queue.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueuePartition {
    /// Function id, or the system queue name
    pub id: String,
    #[serde(rename = "queue", default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    #[serde(rename = "wid", default, skip_serializing_if = "Option::is_none")]
    pub function_id: Option<Uuid>,
    #[serde(rename = "aid", default)]
    pub account_id: Uuid,
    #[serde(rename = "eid", default)]
    pub env_id: Uuid,
    /// Last lease time in ms
    #[serde(default)]
    pub last: i64,
    /// Pointer may not move earlier than this while it is in the future
    #[serde(rename = "forceAtMS", default)]
    pub force_at_ms: i64,
    #[serde(rename = "leaseID", default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<LeaseId>,
}

impl QueuePartition {
    pub fn for_item(item: &QueueItem) -> Self {
        let system = item.queue_name.clone();
        Self {
            id: item.partition_id(),
            function_id: if system.is_some() {
                None
            } else {
                Some(item.function_id)
            },
            queue_name: system,
            account_id: item.data.identifier.account_id,
            env_id: item.data.identifier.env_id,
            ..Default::default()
        }
    }

    pub fn is_system(&self) -> bool {
        self.queue_name.is_some()
    }

    pub fn is_leased(&self, now_ms: i64) -> bool {
        self.lease_id
            .map(|l| l.timestamp_ms() > now_ms)
            .unwrap_or(false)
    }
}

/// A custom concurrency limit configured on a function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomConcurrencyLimit {
    #[serde(rename = "m", default)]
    pub mode: ConcurrencyMode,
    #[serde(rename = "s")]
    pub scope: ConcurrencyScope,
    /// Hash of the key expression
    #[serde(rename = "k")]
    pub hashed_key_expression: String,
    #[serde(rename = "l")]
    pub limit: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShadowPartitionThrottle {
    #[serde(rename = "tkh", default, skip_serializing_if = "String::is_empty")]
    pub key_expression_hash: String,
    #[serde(rename = "l")]
    pub limit: i64,
    #[serde(rename = "b", default)]
    pub burst: i64,
    #[serde(rename = "p")]
    pub period_s: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShadowPartitionConcurrency {
    /// Limit on system partitions; unset on function partitions
    #[serde(rename = "sc", default)]
    pub system_concurrency: i64,
    #[serde(rename = "ac", default)]
    pub account_concurrency: i64,
    #[serde(rename = "fc", default)]
    pub function_concurrency: i64,
    /// How many runs of the function may be active
    #[serde(rename = "frc", default)]
    pub function_run_concurrency: i64,
    /// At most two
    #[serde(rename = "cck", default, skip_serializing_if = "Vec::is_empty")]
    pub custom_concurrency_keys: Vec<CustomConcurrencyLimit>,
}

/// Current constraints for a partition.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartitionConstraintConfig {
    #[serde(rename = "fv", default)]
    pub function_version: i64,
    #[serde(rename = "c", default)]
    pub concurrency: ShadowPartitionConcurrency,
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<ShadowPartitionThrottle>,
}

impl PartitionConstraintConfig {
    /// Limit that applies to the partition scope.
    pub fn partition_limit(&self, system: bool) -> i64 {
        if system {
            return self.concurrency.system_concurrency;
        }
        self.concurrency.function_concurrency
    }

    pub fn custom_limit(&self, scope: ConcurrencyScope, expr_hash: &str) -> Option<i64> {
        self.concurrency
            .custom_concurrency_keys
            .iter()
            .find(|k| k.scope == scope && k.hashed_key_expression == expr_hash)
            .map(|k| k.limit)
    }
}

/// Pause state returned by the pause getter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PausedInfo {
    pub paused: bool,
    /// The cached answer is too old to trust
    pub stale: bool,
}

impl PausedInfo {
    pub fn is_effective(&self) -> bool {
        self.paused && !self.stale
    }
}

/// Matches `name` against allow/deny entries; `prefix*` entries match by prefix.
pub fn queue_name_matches(entries: &[String], name: &str) -> bool {
    entries.iter().any(|e| match e.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => e == name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_entries_match() {
        let entries = vec!["pause:*".to_string(), "cron".to_string()];
        assert!(queue_name_matches(&entries, "pause:env-1"));
        assert!(queue_name_matches(&entries, "cron"));
        assert!(!queue_name_matches(&entries, "cron-sync"));
    }

    #[test]
    fn stale_pause_is_ignored() {
        let info = PausedInfo {
            paused: true,
            stale: true,
        };
        assert!(!info.is_effective());
    }
}
