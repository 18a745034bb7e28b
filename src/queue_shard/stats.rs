//! Read-only lookups used by instrumentation, migration and tests.

use uuid::Uuid;

use crate::backlog::{QueueBacklog, QueueShadowPartition};
use crate::error::QueueError;
use crate::item::QueueItem;
use crate::keys::SetScope;
use crate::partition::QueuePartition;
use crate::queue_shard::helpers::{load_backlog, load_item, load_partition, load_shadow};
use crate::queue_shard::QueueShard;

/// Shard-wide totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardCounts {
    pub items: usize,
    pub partitions: usize,
    pub accounts: usize,
    pub shadow_partitions: usize,
}

impl QueueShard {
    pub async fn item_by_id(&self, item_id: &str, now_ms: i64) -> Result<Option<QueueItem>, QueueError> {
        let kg = &self.kg;
        self.store
            .eval("item_by_id", now_ms, |ks| load_item(ks, kg, item_id))
            .await
    }

    pub async fn partition_by_id(&self, partition_id: &str, now_ms: i64) -> Result<Option<QueuePartition>, QueueError> {
        let kg = &self.kg;
        self.store
            .eval("partition_by_id", now_ms, |ks| load_partition(ks, kg, partition_id))
            .await
    }

    pub async fn shadow_partition_by_id(
        &self,
        shadow_partition_id: &str,
        now_ms: i64,
    ) -> Result<Option<QueueShadowPartition>, QueueError> {
        let kg = &self.kg;
        self.store
            .eval("shadow_partition_by_id", now_ms, |ks| load_shadow(ks, kg, shadow_partition_id))
            .await
    }

    pub async fn backlog_by_id(&self, backlog_id: &str, now_ms: i64) -> Result<Option<QueueBacklog>, QueueError> {
        let kg = &self.kg;
        self.store
            .eval("backlog_by_id", now_ms, |ks| load_backlog(ks, kg, backlog_id))
            .await
    }

    /// Current pointer score of a partition in the global index.
    pub async fn partition_pointer(&self, partition_id: &str, now_ms: i64) -> Result<Option<i64>, QueueError> {
        let key = self.kg.global_partition_index();
        self.store
            .eval("partition_pointer", now_ms, |ks| Ok(ks.zscore(&key, partition_id)?))
            .await
    }

    pub async fn shadow_partition_pointer(
        &self,
        shadow_partition_id: &str,
        now_ms: i64,
    ) -> Result<Option<i64>, QueueError> {
        let key = self.kg.global_shadow_partition_set();
        self.store
            .eval("shadow_partition_pointer", now_ms, |ks| {
                Ok(ks.zscore(&key, shadow_partition_id)?)
            })
            .await
    }

    /// Ready items in a partition scored at or before `until_ms`.
    pub async fn partition_size(&self, partition_id: &str, until_ms: i64, now_ms: i64) -> Result<usize, QueueError> {
        let key = self.kg.partition_queue_set(partition_id);
        self.store
            .eval("partition_size", now_ms, |ks| Ok(ks.zcount(&key, i64::MIN, until_ms)?))
            .await
    }

    /// Live leases counted in a scope's in-progress set.
    pub async fn in_progress_count(&self, scope: SetScope, id: &str, now_ms: i64) -> Result<usize, QueueError> {
        let key = self.kg.in_progress(scope, id);
        self.store
            .eval("in_progress_count", now_ms, |ks| {
                Ok(ks.zcount(&key, now_ms + 1, i64::MAX)?)
            })
            .await
    }

    /// Members of a scope's active set.
    pub async fn active_count(&self, scope: SetScope, id: &str, now_ms: i64) -> Result<usize, QueueError> {
        let key = self.kg.active_set(scope, id);
        self.store
            .eval("active_count", now_ms, |ks| Ok(ks.zcard(&key)?))
            .await
    }

    pub async fn backlog_size(&self, backlog_id: &str, now_ms: i64) -> Result<usize, QueueError> {
        let key = self.kg.backlog_set(backlog_id);
        self.store
            .eval("backlog_size", now_ms, |ks| Ok(ks.zcard(&key)?))
            .await
    }

    /// Backlog ids of a shadow partition with their sizes, including
    /// backlogs parked for normalization.
    pub async fn backlog_sizes(
        &self,
        shadow_partition_id: &str,
        now_ms: i64,
    ) -> Result<Vec<(String, usize)>, QueueError> {
        let kg = &self.kg;
        self.store
            .eval("backlog_sizes", now_ms, |ks| {
                let mut ids: Vec<String> = Vec::new();
                for set in [
                    kg.shadow_partition_set(shadow_partition_id),
                    kg.shadow_partition_normalize_set(shadow_partition_id),
                ] {
                    for (id, _) in ks.zrange(&set, 0, -1)? {
                        if !ids.contains(&id) {
                            ids.push(id);
                        }
                    }
                }
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    let size = ks.zcard(&kg.backlog_set(&id))?;
                    out.push((id, size));
                }
                Ok(out)
            })
            .await
    }

    pub async fn counts(&self, now_ms: i64) -> Result<ShardCounts, QueueError> {
        let kg = &self.kg;
        self.store
            .eval("counts", now_ms, |ks| {
                Ok(ShardCounts {
                    items: ks.hlen(&kg.queue_item())?,
                    partitions: ks.zcard(&kg.global_partition_index())?,
                    accounts: ks.zcard(&kg.global_account_index())?,
                    shadow_partitions: ks.zcard(&kg.global_shadow_partition_set())?,
                })
            })
            .await
    }

    /// Ready partition ids scored at or before `until_ms`.
    pub async fn partition_ids(&self, until_ms: i64, limit: usize, now_ms: i64) -> Result<Vec<String>, QueueError> {
        let key = self.kg.global_partition_index();
        self.store
            .eval("partition_ids", now_ms, |ks| {
                Ok(ks
                    .zrange_by_score(&key, i64::MIN, until_ms, 0, limit)?
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect())
            })
            .await
    }

    /// Expiry of the oldest live-or-expired item lease on the shard.
    pub async fn earliest_lease_expiry(&self, now_ms: i64) -> Result<Option<i64>, QueueError> {
        let key = self.kg.in_progress_index();
        self.store
            .eval("earliest_lease_expiry", now_ms, |ks| {
                Ok(ks.zmin(&key)?.map(|(_, score)| score))
            })
            .await
    }

    /// Every item id of a function, from its partition and all its backlogs.
    pub async fn function_item_ids(&self, function_id: Uuid, now_ms: i64) -> Result<Vec<String>, QueueError> {
        let kg = &self.kg;
        let pid = function_id.to_string();
        self.store
            .eval("function_item_ids", now_ms, |ks| {
                let mut ids: Vec<String> = ks
                    .zrange(&kg.partition_queue_set(&pid), 0, -1)?
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect();
                for set in [kg.shadow_partition_set(&pid), kg.shadow_partition_normalize_set(&pid)] {
                    for (backlog_id, _) in ks.zrange(&set, 0, -1)? {
                        for (id, _) in ks.zrange(&kg.backlog_set(&backlog_id), 0, -1)? {
                            ids.push(id);
                        }
                    }
                }
                ids.sort();
                ids.dedup();
                Ok(ids)
            })
            .await
    }
}
