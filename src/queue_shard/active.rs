//! Active and in-progress set repair.

use tracing::debug;
use uuid::Uuid;

use crate::error::QueueError;
use crate::keys::{KeyGenerator, SetScope};
use crate::queue_shard::helpers::{load_backlog, load_item};
use crate::queue_shard::{QueueShard, ACTIVE_CHECK_SCAN_BATCH_SIZE};
use crate::store::Keyspace;

/// A backlog is checked at most once per cooldown.
pub const ACTIVE_CHECK_COOLDOWN_MS: i64 = 5 * 60_000;

/// Drop members of `key` that no longer count: the item is gone, or it holds
/// no lease and was not refilled. Expired leases are left to the scavenger.
fn check_set(ks: &mut Keyspace, kg: &KeyGenerator, key: &str) -> Result<usize, QueueError> {
    let members = ks.zrange(key, 0, ACTIVE_CHECK_SCAN_BATCH_SIZE as isize - 1)?;
    let mut removed = 0;
    for (id, _) in members {
        let stale = match load_item(ks, kg, &id)? {
            None => true,
            Some(item) => item.lease_id.is_none() && item.refilled_from.is_none(),
        };
        if stale && ks.zrem(key, &id)? {
            removed += 1;
        }
    }
    Ok(removed)
}

impl QueueShard {
    /// Repair one set. Returns the number of members removed.
    pub async fn active_check_set(&self, key: &str, now_ms: i64) -> Result<usize, QueueError> {
        let kg = &self.kg;
        self.store
            .eval("active_check_set", now_ms, |ks| check_set(ks, kg, key))
            .await
    }

    /// Repair an account's active and in-progress sets.
    pub async fn active_check_account(&self, account_id: Uuid, now_ms: i64) -> Result<usize, QueueError> {
        let kg = &self.kg;
        let id = account_id.to_string();
        let removed = self
            .store
            .eval("active_check_account", now_ms, |ks| {
                let mut removed = check_set(ks, kg, &kg.active_set(SetScope::Account, &id))?;
                removed += check_set(ks, kg, &kg.in_progress(SetScope::Account, &id))?;
                Ok::<_, QueueError>(removed)
            })
            .await?;
        debug!(shard = %self.name, account_id = %account_id, removed, "checked account active sets");
        Ok(removed)
    }

    /// Repair the partition and custom key sets a backlog counts against, then
    /// arm its cooldown.
    pub async fn active_check_backlog(
        &self,
        backlog_id: &str,
        shadow_partition_id: &str,
        now_ms: i64,
    ) -> Result<usize, QueueError> {
        let kg = &self.kg;
        let removed = self
            .store
            .eval("active_check_backlog", now_ms, |ks| {
                let mut keys = vec![
                    kg.active_set(SetScope::Partition, shadow_partition_id),
                    kg.in_progress(SetScope::Partition, shadow_partition_id),
                ];
                if let Some(backlog) = load_backlog(ks, kg, backlog_id)? {
                    for key in &backlog.concurrency_keys {
                        keys.push(key.active_key(kg));
                        keys.push(key.in_progress_key(kg));
                    }
                }
                let mut removed = 0;
                for key in &keys {
                    removed += check_set(ks, kg, key)?;
                }
                ks.zrem(&kg.active_check_backlogs(), backlog_id)?;
                ks.set_px(
                    &kg.active_check_cooldown(backlog_id),
                    now_ms.to_string(),
                    ACTIVE_CHECK_COOLDOWN_MS,
                );
                Ok::<_, QueueError>(removed)
            })
            .await?;
        debug!(shard = %self.name, backlog_id, removed, "checked backlog active sets");
        Ok(removed)
    }

    /// Backlogs flagged for an active check, as `(backlog_id, shadow_partition_id)`.
    pub async fn peek_active_check_backlogs(
        &self,
        limit: usize,
        now_ms: i64,
    ) -> Result<Vec<(String, String)>, QueueError> {
        let kg = &self.kg;
        self.store
            .eval("peek_active_check_backlogs", now_ms, |ks| {
                let key = kg.active_check_backlogs();
                let ids = ks.zrange_by_score(&key, i64::MIN, now_ms, 0, limit)?;
                let mut out = Vec::with_capacity(ids.len());
                for (id, _) in ids {
                    match load_backlog(ks, kg, &id)? {
                        Some(b) => out.push((id, b.shadow_partition_id)),
                        None => {
                            ks.zrem(&key, &id)?;
                        }
                    }
                }
                Ok(out)
            })
            .await
    }
}
