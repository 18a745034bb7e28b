//! Runnable partition peeks, leases and requeues.

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;
use uuid::Uuid;

use crate::backlog::item_backlog;
use crate::error::QueueError;
use crate::item::QueueItem;
use crate::keys::SetScope;
use crate::partition::{is_unbounded, PartitionConstraintConfig, QueuePartition};
use crate::queue_shard::helpers::{
    bump_partition_pointer, bump_shadow_pointer, load_item, load_partition, remove_partition, set_partition_pointer,
    shadow_for_item, store_item, store_partition,
};
use crate::queue_shard::{QueueShard, ABSOLUTE_PEEK_MAX};
use crate::ulid::{LeaseId, Ulid};

/// Which pointer zset to peek partitions from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionIndex {
    Global,
    Account(Uuid),
}

impl QueueShard {
    fn partition_index_key(&self, index: PartitionIndex) -> String {
        match index {
            PartitionIndex::Global => self.kg.global_partition_index(),
            PartitionIndex::Account(id) => self.kg.account_partition_index(id),
        }
    }

    /// Partitions whose pointer is at or before `until_ms`.
    ///
    /// Sequential peeks return the earliest partitions in order; other peeks
    /// sample the ready candidates at random.
    pub async fn peek_partitions(
        &self,
        index: PartitionIndex,
        until_ms: i64,
        limit: usize,
        sequential: bool,
        now_ms: i64,
    ) -> Result<Vec<QueuePartition>, QueueError> {
        if limit > ABSOLUTE_PEEK_MAX {
            return Err(QueueError::PeekMaxExceedsLimits(limit));
        }
        let key = self.partition_index_key(index);
        let kg = &self.kg;
        self.store
            .eval("peek_partitions", now_ms, |ks| {
                let window = if sequential { limit } else { ABSOLUTE_PEEK_MAX };
                let mut ids = ks.zrange_by_score(&key, i64::MIN, until_ms, 0, window)?;
                if !sequential {
                    ids.shuffle(&mut rand::rng());
                    ids.truncate(limit);
                }
                let mut out = Vec::with_capacity(ids.len());
                for (id, _) in ids {
                    match load_partition(ks, kg, &id)? {
                        Some(p) => out.push(p),
                        None => {
                            // pointer without metadata
                            ks.zrem(&key, &id)?;
                        }
                    }
                }
                Ok(out)
            })
            .await
    }

    /// Accounts with a partition ready at or before `until_ms`.
    pub async fn peek_accounts(
        &self,
        until_ms: i64,
        limit: usize,
        sequential: bool,
        now_ms: i64,
    ) -> Result<Vec<Uuid>, QueueError> {
        if limit > ABSOLUTE_PEEK_MAX {
            return Err(QueueError::PeekMaxExceedsLimits(limit));
        }
        let key = self.kg.global_account_index();
        self.store
            .eval("peek_accounts", now_ms, |ks| {
                let window = if sequential { limit } else { ABSOLUTE_PEEK_MAX };
                let mut ids = ks.zrange_by_score(&key, i64::MIN, until_ms, 0, window)?;
                if !sequential {
                    ids.shuffle(&mut rand::rng());
                    ids.truncate(limit);
                }
                Ok(ids
                    .into_iter()
                    .filter_map(|(id, _)| Uuid::parse_str(&id).ok())
                    .collect())
            })
            .await
    }

    /// Lease a partition for scanning. The pointer moves to the lease expiry so
    /// other scanners skip it. Empty partitions are garbage collected.
    ///
    /// With `constraints` set, the partition and account in-progress counts are
    /// checked first.
    pub async fn partition_lease(
        &self,
        partition_id: &str,
        duration_ms: i64,
        now_ms: i64,
        constraints: Option<&PartitionConstraintConfig>,
    ) -> Result<(LeaseId, QueuePartition), QueueError> {
        let kg = &self.kg;
        self.store
            .eval("partition_lease", now_ms, |ks| {
                let mut p = load_partition(ks, kg, partition_id)?.ok_or(QueueError::PartitionNotFound)?;
                if p.is_leased(now_ms) {
                    return Err(QueueError::PartitionAlreadyLeased);
                }
                if let Some(fid) = p.function_id {
                    if ks.exists(&kg.migration_lock(fid)) {
                        return Err(QueueError::PartitionPaused);
                    }
                }

                let ready = ks.zcard(&kg.partition_queue_set(&p.id))?;
                let in_progress_key = kg.in_progress(SetScope::Partition, &p.id);
                if ready == 0 && ks.zcard(&in_progress_key)? == 0 {
                    remove_partition(ks, kg, &p)?;
                    return Err(QueueError::PartitionGarbageCollected);
                }

                if let Some(c) = constraints {
                    if !p.is_system() {
                        let limit = c.concurrency.account_concurrency;
                        let key = kg.in_progress(SetScope::Account, &p.account_id.to_string());
                        if !is_unbounded(limit) && ks.zcount(&key, now_ms + 1, i64::MAX)? as i64 >= limit {
                            return Err(QueueError::AccountConcurrencyLimit);
                        }
                    }
                    let limit = c.partition_limit(p.is_system());
                    if !is_unbounded(limit)
                        && ks.zcount(&in_progress_key, now_ms + 1, i64::MAX)? as i64 >= limit
                    {
                        return Err(if p.is_system() {
                            QueueError::SystemConcurrencyLimit
                        } else {
                            QueueError::PartitionConcurrencyLimit
                        });
                    }
                }

                let lease_id = Ulid::new(now_ms + duration_ms);
                p.lease_id = Some(lease_id);
                p.last = now_ms;
                store_partition(ks, kg, &p)?;
                set_partition_pointer(ks, kg, &p, lease_id.timestamp_ms())?;
                Ok((lease_id, p))
            })
            .await
    }

    /// Release the partition lease and move its pointer.
    ///
    /// A forced requeue pins the pointer at `at_ms` and stops enqueues from
    /// pulling it earlier. Otherwise the pointer moves to the earliest ready
    /// item, or `at_ms` when that is sooner. Empty partitions are garbage
    /// collected.
    pub async fn partition_requeue(
        &self,
        partition_id: &str,
        at_ms: i64,
        force: bool,
        now_ms: i64,
    ) -> Result<(), QueueError> {
        let kg = &self.kg;
        self.store
            .eval("partition_requeue", now_ms, |ks| {
                let mut p = load_partition(ks, kg, partition_id)?.ok_or(QueueError::PartitionNotFound)?;
                let ready_key = kg.partition_queue_set(&p.id);
                let in_progress = ks.zcard(&kg.in_progress(SetScope::Partition, &p.id))?;
                if ks.zcard(&ready_key)? == 0 && in_progress == 0 {
                    remove_partition(ks, kg, &p)?;
                    return Err(QueueError::PartitionGarbageCollected);
                }

                p.lease_id = None;
                let score = if force {
                    p.force_at_ms = at_ms;
                    at_ms
                } else {
                    p.force_at_ms = 0;
                    match ks.zmin(&ready_key)? {
                        Some((_, earliest)) => earliest.min(at_ms),
                        None => at_ms,
                    }
                };
                store_partition(ks, kg, &p)?;
                set_partition_pointer(ks, kg, &p, score)
            })
            .await?;
        debug!(shard = %self.name, partition_id, at_ms, force, "requeued partition");
        Ok(())
    }

    /// Ready items scored at or before `until_ms`, in score order. A random
    /// offset starts the page somewhere inside the ready window.
    pub async fn peek_items(
        &self,
        partition_id: &str,
        until_ms: i64,
        limit: usize,
        random_offset: bool,
        now_ms: i64,
    ) -> Result<Vec<QueueItem>, QueueError> {
        if limit > ABSOLUTE_PEEK_MAX {
            return Err(QueueError::PeekMaxExceedsLimits(limit));
        }
        let kg = &self.kg;
        let key = kg.partition_queue_set(partition_id);
        self.store
            .eval("peek_items", now_ms, |ks| {
                let offset = if random_offset {
                    let total = ks.zcount(&key, i64::MIN, until_ms)?;
                    if total > limit {
                        rand::rng().random_range(0..=total - limit)
                    } else {
                        0
                    }
                } else {
                    0
                };
                let ids = ks.zrange_by_score(&key, i64::MIN, until_ms, offset, limit)?;
                let mut out = Vec::with_capacity(ids.len());
                for (id, _) in ids {
                    match load_item(ks, kg, &id)? {
                        Some(item) if !item.is_leased(now_ms) => out.push(item),
                        Some(_) => {}
                        None => {
                            ks.zrem(&key, &id)?;
                        }
                    }
                }
                Ok(out)
            })
            .await
    }

    /// Rescore a far-future item now that its time is close. Returns false
    /// when the item is gone or leased.
    pub async fn promote_item(&self, item_id: &str, now_ms: i64) -> Result<bool, QueueError> {
        let kg = &self.kg;
        self.store
            .eval("promote_item", now_ms, |ks| {
                let Some(item) = load_item(ks, kg, item_id)? else {
                    return Ok(false);
                };
                if item.is_leased(now_ms) {
                    return Ok(false);
                }
                let score = item.score(now_ms);
                let ready_key = kg.partition_queue_set(&item.partition_id());
                if ks.zscore(&ready_key, &item.id)?.is_some() {
                    ks.zadd(&ready_key, score, &item.id)?;
                    if let Some(p) = load_partition(ks, kg, &item.partition_id())? {
                        bump_partition_pointer(ks, kg, &p, score)?;
                    }
                    return Ok(true);
                }
                let backlog_id = item_backlog(&item).backlog_id;
                let backlog_key = kg.backlog_set(&backlog_id);
                if ks.zscore(&backlog_key, &item.id)?.is_some() {
                    ks.zadd(&backlog_key, score, &item.id)?;
                    let sp = shadow_for_item(ks, kg, &item)?;
                    ks.zadd_lt(&kg.shadow_partition_set(&sp.partition_id), score, &backlog_id)?;
                    bump_shadow_pointer(ks, kg, &sp, score)?;
                    return Ok(true);
                }
                Ok(false)
            })
            .await
    }

    /// Record that an item was peeked but could not run yet.
    pub async fn mark_peeked(&self, item_id: &str, now_ms: i64) -> Result<(), QueueError> {
        let kg = &self.kg;
        self.store
            .eval("mark_peeked", now_ms, |ks| {
                if let Some(mut item) = load_item(ks, kg, item_id)? {
                    if item.earliest_peek_time_ms == 0 {
                        item.earliest_peek_time_ms = now_ms;
                        store_item(ks, kg, &item)?;
                    }
                }
                Ok(())
            })
            .await
    }

    /// Lock a function's partitions until `until_ms`. Returns false when
    /// another migration holds the lock.
    pub async fn lock_function_for_migration(
        &self,
        function_id: Uuid,
        until_ms: i64,
        now_ms: i64,
    ) -> Result<bool, QueueError> {
        let key = self.kg.migration_lock(function_id);
        self.store
            .eval("migration_lock", now_ms, |ks| {
                Ok(ks.set_nx_px(&key, until_ms.to_string(), until_ms - now_ms))
            })
            .await
    }

    /// Expiry of a live migration lock.
    pub async fn migration_lock_until(&self, function_id: Uuid, now_ms: i64) -> Result<Option<i64>, QueueError> {
        let key = self.kg.migration_lock(function_id);
        self.store
            .eval("migration_lock_get", now_ms, |ks| {
                Ok(ks.get(&key)?.and_then(|v| v.parse().ok()))
            })
            .await
    }

    pub async fn unlock_function_for_migration(&self, function_id: Uuid, now_ms: i64) -> Result<(), QueueError> {
        let key = self.kg.migration_lock(function_id);
        self.store
            .eval("migration_unlock", now_ms, |ks| {
                ks.del(&key);
                Ok(())
            })
            .await
    }
}
