//! Deterministic key names for everything a shard writes to its store.

use uuid::Uuid;

/// Builds every key for one shard under a fixed prefix.
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    prefix: String,
}

/// Scope of an in-progress or active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetScope {
    Account,
    Partition,
    Custom,
}

impl SetScope {
    fn tag(&self) -> &'static str {
        match self {
            SetScope::Account => "account",
            SetScope::Partition => "p",
            SetScope::Custom => "custom",
        }
    }
}

impl KeyGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Hash of item id -> serialized queue item
    pub fn queue_item(&self) -> String {
        format!("{}:queue:item", self.prefix)
    }

    /// Hash of partition id -> serialized partition metadata
    pub fn partition_item(&self) -> String {
        format!("{}:partition:item", self.prefix)
    }

    /// Global partition pointer zset, scored by earliest ready time
    pub fn global_partition_index(&self) -> String {
        format!("{}:partition:sorted", self.prefix)
    }

    /// Per-account partition pointer zset
    pub fn account_partition_index(&self, account_id: Uuid) -> String {
        format!("{}:accounts:{}:partition:sorted", self.prefix, account_id)
    }

    /// Global account pointer zset, scored by the account's earliest partition
    pub fn global_account_index(&self) -> String {
        format!("{}:accounts:sorted", self.prefix)
    }

    /// Ready zset of items in a runnable partition
    pub fn partition_queue_set(&self, partition_id: &str) -> String {
        format!("{}:queue:sorted:{}", self.prefix, partition_id)
    }

    /// Hash of shadow partition id -> serialized shadow partition
    pub fn shadow_partition_meta(&self) -> String {
        format!("{}:shadows", self.prefix)
    }

    /// Global shadow partition pointer zset
    pub fn global_shadow_partition_set(&self) -> String {
        format!("{}:shadows:sorted", self.prefix)
    }

    /// Accounts that own at least one shadow partition with backlogs
    pub fn global_account_shadow_partitions(&self) -> String {
        format!("{}:accounts:shadows:sorted", self.prefix)
    }

    pub fn account_shadow_partitions(&self, account_id: Uuid) -> String {
        format!("{}:accounts:{}:shadows:sorted", self.prefix, account_id)
    }

    /// Zset of backlog ids within a shadow partition, scored by earliest item
    pub fn shadow_partition_set(&self, shadow_partition_id: &str) -> String {
        format!("{}:shadows:{}", self.prefix, shadow_partition_id)
    }

    /// Hash of backlog id -> serialized backlog
    pub fn backlog_meta(&self) -> String {
        format!("{}:backlogs", self.prefix)
    }

    /// Items waiting in a backlog
    pub fn backlog_set(&self, backlog_id: &str) -> String {
        format!("{}:backlog:sorted:{}", self.prefix, backlog_id)
    }

    /// Accounts with backlogs waiting for normalization
    pub fn global_account_normalize_set(&self) -> String {
        format!("{}:accounts:normalize:sorted", self.prefix)
    }

    pub fn account_normalize_set(&self, account_id: Uuid) -> String {
        format!("{}:accounts:{}:normalize:sorted", self.prefix, account_id)
    }

    /// Outdated backlogs of one shadow partition
    pub fn shadow_partition_normalize_set(&self, shadow_partition_id: &str) -> String {
        format!("{}:shadows:normalize:{}", self.prefix, shadow_partition_id)
    }

    /// In-progress zset for a scope, scored by lease expiry
    pub fn in_progress(&self, scope: SetScope, id: &str) -> String {
        format!("{}:concurrency:{}:{}", self.prefix, scope.tag(), id)
    }

    /// Active zset for a scope: refilled or leased items
    pub fn active_set(&self, scope: SetScope, id: &str) -> String {
        format!("{}:active:{}:{}", self.prefix, scope.tag(), id)
    }

    /// Partitions with leased items, scored by their earliest lease expiry
    pub fn in_progress_index(&self) -> String {
        format!("{}:concurrency:sorted", self.prefix)
    }

    /// Backlogs flagged for an active check, scored by flag time
    pub fn active_check_backlogs(&self) -> String {
        format!("{}:active-checks:backlogs:sorted", self.prefix)
    }

    /// Present while a backlog is cooling down after an active check
    pub fn active_check_cooldown(&self, backlog_id: &str) -> String {
        format!("{}:active-checks:cooldown:{}", self.prefix, backlog_id)
    }

    /// Named singleton lease
    pub fn config_lease(&self, name: &str) -> String {
        format!("{}:queue:config:{}", self.prefix, name)
    }

    /// Leftover idempotency marker of a dequeued item
    pub fn idempotency(&self, item_id: &str) -> String {
        format!("{}:idempotency:{}", self.prefix, item_id)
    }

    pub fn singleton(&self, singleton_key: &str) -> String {
        format!("{}:singleton:{}", self.prefix, singleton_key)
    }

    /// GCRA theoretical arrival time for a throttle key
    pub fn throttle(&self, throttle_key: &str) -> String {
        format!("{}:throttle:{}", self.prefix, throttle_key)
    }

    /// Hash of function id -> next scheduled cron item
    pub fn cron_schedule(&self) -> String {
        format!("{}:cron:schedule", self.prefix)
    }

    pub fn migration_lock(&self, function_id: Uuid) -> String {
        format!("{}:migrate:{}", self.prefix, function_id)
    }

    /// Item ids per unhashed job id, for dequeue by job id
    pub fn job_index(&self) -> String {
        format!("{}:queue:jobs", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed() {
        let kg = KeyGenerator::new("q");
        assert_eq!(kg.queue_item(), "q:queue:item");
        assert_eq!(kg.partition_queue_set("fn-a"), "q:queue:sorted:fn-a");
        assert_eq!(
            kg.in_progress(SetScope::Partition, "fn-a"),
            "q:concurrency:p:fn-a"
        );
        assert_eq!(kg.active_set(SetScope::Custom, "f:x:y"), "q:active:custom:f:x:y");
    }

    #[test]
    fn distinct_prefixes_do_not_collide() {
        let a = KeyGenerator::new("a");
        let b = KeyGenerator::new("b");
        assert_ne!(a.global_partition_index(), b.global_partition_index());
    }
}
