//! Shadow partitions, backlog peeks and refills.

use rand::seq::SliceRandom;
use tracing::debug;
use uuid::Uuid;

use crate::backlog::{QueueBacklog, QueueShadowPartition};
use crate::constraints::{
    refill_capacity, throttle_commit, throttle_peek, CapacityGrant, QueueConstraint,
};
use crate::error::QueueError;
use crate::item::CapacityLease;
use crate::partition::{PartitionConstraintConfig, QueuePartition};
use crate::queue_shard::helpers::{
    bump_partition_pointer, load_backlog, load_item, load_shadow, refresh_backlog_pointer,
    refresh_shadow_pointer, set_shadow_pointer, store_backlog, store_item, store_shadow,
    upsert_partition,
};
use crate::queue_shard::{QueueShard, ABSOLUTE_PEEK_MAX};
use crate::ulid::{LeaseId, Ulid};

/// Which pointer zset to peek shadow partitions from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowIndex {
    Global,
    Account(Uuid),
}

#[derive(Debug, Clone, Default)]
pub struct BacklogRefillParams {
    pub now_ms: i64,
    /// Only items scored at or before this move
    pub until_ms: i64,
    pub limit: usize,
    pub constraints: PartitionConstraintConfig,
    /// Evaluate constraints; when off every peeked item moves
    pub check_constraints: bool,
    /// Capacity granted by an external provider. Only these items move, and
    /// local counters are left alone.
    pub capacity_grants: Option<Vec<CapacityGrant>>,
    /// Constraint reported by the external provider when it granted less
    pub external_constraint: QueueConstraint,
    pub external_retry_at_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct BacklogRefillResult {
    pub constraint: QueueConstraint,
    /// Items left in the backlog before the refill
    pub total: usize,
    pub until_ms: i64,
    pub refilled: Vec<String>,
    pub retry_at_ms: i64,
    /// Backlog after counter updates
    pub backlog: QueueBacklog,
}

impl BacklogRefillResult {
    pub fn refilled_count(&self) -> usize {
        self.refilled.len()
    }
}

impl QueueShard {
    fn shadow_index_key(&self, index: ShadowIndex) -> String {
        match index {
            ShadowIndex::Global => self.kg.global_shadow_partition_set(),
            ShadowIndex::Account(id) => self.kg.account_shadow_partitions(id),
        }
    }

    pub async fn peek_shadow_accounts(
        &self,
        until_ms: i64,
        limit: usize,
        sequential: bool,
        now_ms: i64,
    ) -> Result<Vec<Uuid>, QueueError> {
        if limit > ABSOLUTE_PEEK_MAX {
            return Err(QueueError::PeekMaxExceedsLimits(limit));
        }
        let key = self.kg.global_account_shadow_partitions();
        self.store
            .eval("peek_shadow_accounts", now_ms, |ks| {
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

    pub async fn peek_shadow_partitions(
        &self,
        index: ShadowIndex,
        until_ms: i64,
        limit: usize,
        sequential: bool,
        now_ms: i64,
    ) -> Result<Vec<QueueShadowPartition>, QueueError> {
        if limit > ABSOLUTE_PEEK_MAX {
            return Err(QueueError::PeekMaxExceedsLimits(limit));
        }
        let key = self.shadow_index_key(index);
        let kg = &self.kg;
        self.store
            .eval("peek_shadow_partitions", now_ms, |ks| {
                let window = if sequential { limit } else { ABSOLUTE_PEEK_MAX };
                let mut ids = ks.zrange_by_score(&key, i64::MIN, until_ms, 0, window)?;
                if !sequential {
                    ids.shuffle(&mut rand::rng());
                    ids.truncate(limit);
                }
                let mut out = Vec::with_capacity(ids.len());
                for (id, _) in ids {
                    match load_shadow(ks, kg, &id)? {
                        Some(sp) => out.push(sp),
                        None => {
                            ks.zrem(&key, &id)?;
                        }
                    }
                }
                Ok(out)
            })
            .await
    }

    /// Lease a shadow partition for refilling.
    pub async fn shadow_partition_lease(
        &self,
        shadow_partition_id: &str,
        duration_ms: i64,
        now_ms: i64,
    ) -> Result<LeaseId, QueueError> {
        let kg = &self.kg;
        self.store
            .eval("shadow_partition_lease", now_ms, |ks| {
                let mut sp = load_shadow(ks, kg, shadow_partition_id)?
                    .ok_or(QueueError::ShadowPartitionNotFound)?;
                if let Some(l) = sp.lease_id {
                    if !l.is_expired(now_ms) {
                        return Err(QueueError::ShadowPartitionAlreadyLeased);
                    }
                }
                let lease_id = Ulid::new(now_ms + duration_ms);
                sp.lease_id = Some(lease_id);
                store_shadow(ks, kg, &sp)?;
                if ks.zcard(&kg.shadow_partition_set(&sp.partition_id))? > 0 {
                    set_shadow_pointer(ks, kg, &sp, Some(lease_id.timestamp_ms()))?;
                }
                Ok(lease_id)
            })
            .await
    }

    pub async fn extend_shadow_partition_lease(
        &self,
        shadow_partition_id: &str,
        lease_id: LeaseId,
        duration_ms: i64,
        now_ms: i64,
    ) -> Result<LeaseId, QueueError> {
        let kg = &self.kg;
        self.store
            .eval("shadow_partition_extend_lease", now_ms, |ks| {
                let mut sp = load_shadow(ks, kg, shadow_partition_id)?
                    .ok_or(QueueError::ShadowPartitionNotFound)?;
                match sp.lease_id {
                    Some(current) if current == lease_id && !current.is_expired(now_ms) => {}
                    _ => return Err(QueueError::ShadowPartitionLeaseExpired),
                }
                let next = Ulid::new(now_ms + duration_ms);
                sp.lease_id = Some(next);
                store_shadow(ks, kg, &sp)?;
                if ks.zcard(&kg.shadow_partition_set(&sp.partition_id))? > 0 {
                    set_shadow_pointer(ks, kg, &sp, Some(next.timestamp_ms()))?;
                }
                Ok(next)
            })
            .await
    }

    /// Release a shadow partition lease. The pointer moves to `requeue_at`, or
    /// to the earliest backlog. Shadow partitions without backlogs drop out of
    /// the pointer sets until the next enqueue.
    pub async fn shadow_partition_requeue(
        &self,
        shadow_partition_id: &str,
        lease_id: Option<LeaseId>,
        requeue_at: Option<i64>,
        now_ms: i64,
    ) -> Result<(), QueueError> {
        let kg = &self.kg;
        self.store
            .eval("shadow_partition_requeue", now_ms, |ks| {
                let mut sp = load_shadow(ks, kg, shadow_partition_id)?
                    .ok_or(QueueError::ShadowPartitionNotFound)?;
                if let (Some(held), Some(current)) = (lease_id, sp.lease_id) {
                    if held != current {
                        return Err(QueueError::ShadowPartitionLeaseExpired);
                    }
                }
                sp.lease_id = None;
                store_shadow(ks, kg, &sp)?;
                let earliest = ks.zmin(&kg.shadow_partition_set(&sp.partition_id))?;
                let score = match (requeue_at, earliest) {
                    (_, None) => None,
                    (Some(at), Some(_)) => Some(at),
                    (None, Some((_, s))) => Some(s),
                };
                set_shadow_pointer(ks, kg, &sp, score)
            })
            .await
    }

    /// Backlogs of a shadow partition scored at or before `until_ms`.
    pub async fn peek_backlogs(
        &self,
        shadow_partition_id: &str,
        until_ms: i64,
        limit: usize,
        now_ms: i64,
    ) -> Result<Vec<QueueBacklog>, QueueError> {
        let kg = &self.kg;
        let key = kg.shadow_partition_set(shadow_partition_id);
        self.store
            .eval("peek_backlogs", now_ms, |ks| {
                let ids = ks.zrange_by_score(&key, i64::MIN, until_ms, 0, limit)?;
                let mut out = Vec::with_capacity(ids.len());
                for (id, _) in ids {
                    match load_backlog(ks, kg, &id)? {
                        Some(b) => out.push(b),
                        None => {
                            ks.zrem(&key, &id)?;
                        }
                    }
                }
                Ok(out)
            })
            .await
    }

    /// Ids of the items a refill would consider, for external capacity checks.
    pub async fn peek_backlog_item_ids(
        &self,
        backlog_id: &str,
        until_ms: i64,
        limit: usize,
        now_ms: i64,
    ) -> Result<Vec<String>, QueueError> {
        let key = self.kg.backlog_set(backlog_id);
        self.store
            .eval("peek_backlog_item_ids", now_ms, |ks| {
                Ok(ks
                    .zrange_by_score(&key, i64::MIN, until_ms, 0, limit)?
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect())
            })
            .await
    }

    /// Move ready items from a backlog into the runnable partition, as many as
    /// the constraints allow.
    pub async fn backlog_refill(
        &self,
        backlog_id: &str,
        shadow_partition_id: &str,
        params: &BacklogRefillParams,
    ) -> Result<BacklogRefillResult, QueueError> {
        let kg = &self.kg;
        let now = params.now_ms;
        let result = self
            .store
            .eval("backlog_refill", now, |ks| {
                let backlog_key = kg.backlog_set(backlog_id);
                let Some(mut backlog) = load_backlog(ks, kg, backlog_id)? else {
                    if ks.zcard(&backlog_key)? == 0 {
                        ks.zrem(&kg.shadow_partition_set(shadow_partition_id), backlog_id)?;
                        return Err(QueueError::BacklogGarbageCollected);
                    }
                    return Err(QueueError::BacklogNotFound);
                };
                let sp = load_shadow(ks, kg, shadow_partition_id)?
                    .ok_or(QueueError::ShadowPartitionNotFound)?;

                let limit = params.limit.min(ABSOLUTE_PEEK_MAX);
                let peeked: Vec<String> = ks
                    .zrange_by_score(&backlog_key, i64::MIN, params.until_ms, 0, limit)?
                    .into_iter()
                    .map(|(id, _)| id)
                    .collect();
                let mut result = BacklogRefillResult {
                    total: ks.zcard(&backlog_key)?,
                    until_ms: params.until_ms,
                    ..Default::default()
                };

                let mut admitted = Vec::with_capacity(peeked.len());
                let external = params.capacity_grants.is_some();
                if let Some(grants) = &params.capacity_grants {
                    admitted.extend(
                        peeked
                            .iter()
                            .filter(|id| grants.iter().any(|g| &g.item_id == *id))
                            .cloned(),
                    );
                    if admitted.len() < peeked.len() {
                        result.constraint = params.external_constraint;
                        result.retry_at_ms = params.external_retry_at_ms;
                    }
                } else if !params.check_constraints {
                    admitted = peeked;
                } else {
                    let (capacity, limiting) =
                        refill_capacity(ks, kg, &sp, &backlog, &params.constraints)?;
                    let n = capacity
                        .map(|c| (c as usize).min(peeked.len()))
                        .unwrap_or(peeked.len());
                    if n < peeked.len() {
                        result.constraint = limiting;
                    }
                    let throttle = match (&backlog.throttle, &params.constraints.throttle) {
                        (Some(bt), Some(cfg)) => Some((bt.throttle_key.clone(), cfg.clone())),
                        _ => None,
                    };
                    for id in peeked.into_iter().take(n) {
                        if let Some((key, cfg)) = &throttle {
                            let decision = throttle_peek(ks, kg, key, cfg.limit, cfg.burst, cfg.period_s)?;
                            if !decision.allowed {
                                result.constraint = QueueConstraint::Throttle;
                                result.retry_at_ms = decision.retry_at_ms;
                                break;
                            }
                            throttle_commit(ks, kg, key, &decision);
                        }
                        admitted.push(id);
                    }
                }

                let partition = upsert_partition(
                    ks,
                    kg,
                    QueuePartition {
                        id: sp.partition_id.clone(),
                        queue_name: sp.system_queue_name.clone(),
                        function_id: sp.function_id,
                        account_id: sp.account_id(),
                        env_id: sp.env_id.unwrap_or_default(),
                        ..Default::default()
                    },
                )?;
                let ready_key = kg.partition_queue_set(&partition.id);
                let account_active = sp.account_active_key(kg);
                let mut earliest: Option<i64> = None;
                for id in admitted {
                    ks.zrem(&backlog_key, &id)?;
                    let Some(mut item) = load_item(ks, kg, &id)? else {
                        continue;
                    };
                    item.refilled_from = Some(backlog.backlog_id.clone());
                    item.refilled_at_ms = now;
                    if let Some(grants) = &params.capacity_grants {
                        item.capacity_lease = grants
                            .iter()
                            .find(|g| g.item_id == item.id)
                            .map(|g| CapacityLease { lease_id: g.lease_id });
                    }
                    store_item(ks, kg, &item)?;
                    ks.zadd(&ready_key, item.at_ms, &item.id)?;
                    if !external {
                        ks.zadd(&sp.active_key(kg), now, &item.id)?;
                        if let Some(key) = &account_active {
                            ks.zadd(key, now, &item.id)?;
                        }
                        for key in &backlog.concurrency_keys {
                            ks.zadd(&key.active_key(kg), now, &item.id)?;
                        }
                    }
                    earliest = Some(earliest.map_or(item.at_ms, |e| e.min(item.at_ms)));
                    result.refilled.push(item.id);
                }
                if let Some(score) = earliest {
                    bump_partition_pointer(ks, kg, &partition, score)?;
                }

                match result.constraint {
                    QueueConstraint::NotLimited => {
                        backlog.successive_throttle_constrained = 0;
                        backlog.successive_custom_concurrency_constrained = 0;
                    }
                    QueueConstraint::Throttle => backlog.successive_throttle_constrained += 1,
                    QueueConstraint::CustomConcurrencyKey1 | QueueConstraint::CustomConcurrencyKey2 => {
                        backlog.successive_custom_concurrency_constrained += 1
                    }
                    _ => {}
                }
                if result.constraint != QueueConstraint::NotLimited
                    && result.constraint != QueueConstraint::Throttle
                    && !ks.exists(&kg.active_check_cooldown(backlog_id))
                {
                    ks.zadd_nx(&kg.active_check_backlogs(), now, backlog_id)?;
                }
                store_backlog(ks, kg, &backlog)?;
                refresh_backlog_pointer(ks, kg, backlog_id, &sp)?;
                result.backlog = backlog;
                Ok::<_, QueueError>(result)
            })
            .await?;

        debug!(
            shard = %self.name,
            backlog_id,
            refilled = result.refilled_count(),
            total = result.total,
            constraint = result.constraint.as_str(),
            "refilled backlog"
        );
        Ok(result)
    }

    /// Move a backlog's score in its shadow partition to `at_ms`. Empty
    /// backlogs are garbage collected.
    pub async fn backlog_requeue(
        &self,
        backlog_id: &str,
        shadow_partition_id: &str,
        at_ms: i64,
        now_ms: i64,
    ) -> Result<(), QueueError> {
        let kg = &self.kg;
        self.store
            .eval("backlog_requeue", now_ms, |ks| {
                let sp = load_shadow(ks, kg, shadow_partition_id)?
                    .ok_or(QueueError::ShadowPartitionNotFound)?;
                let set = kg.shadow_partition_set(shadow_partition_id);
                if ks.zcard(&kg.backlog_set(backlog_id))? == 0 {
                    ks.zrem(&set, backlog_id)?;
                    ks.hdel(&kg.backlog_meta(), backlog_id)?;
                } else if ks.zscore(&set, backlog_id)?.is_some() {
                    ks.zadd(&set, at_ms, backlog_id)?;
                }
                refresh_shadow_pointer(ks, kg, &sp)
            })
            .await
    }

    /// Park an outdated backlog for the normalizer: it leaves the shadow
    /// partition's backlog set and joins the normalize sets.
    pub async fn backlog_prepare_normalize(
        &self,
        backlog_id: &str,
        shadow_partition_id: &str,
        now_ms: i64,
    ) -> Result<(), QueueError> {
        let kg = &self.kg;
        self.store
            .eval("backlog_prepare_normalize", now_ms, |ks| {
                let sp = load_shadow(ks, kg, shadow_partition_id)?
                    .ok_or(QueueError::ShadowPartitionNotFound)?;
                let backlog = load_backlog(ks, kg, backlog_id)?.ok_or(QueueError::BacklogNotFound)?;
                let set = kg.shadow_partition_set(shadow_partition_id);
                if ks.zcard(&kg.backlog_set(backlog_id))? == 0 {
                    ks.zrem(&set, backlog_id)?;
                    ks.hdel(&kg.backlog_meta(), backlog_id)?;
                    refresh_shadow_pointer(ks, kg, &sp)?;
                    return Err(QueueError::BacklogGarbageCollected);
                }
                if let Some(l) = backlog.normalize_lease_id {
                    if !l.is_expired(now_ms) {
                        return Err(QueueError::BacklogAlreadyLeasedForNormalization);
                    }
                }

                ks.zrem(&set, backlog_id)?;
                ks.zadd_nx(&kg.shadow_partition_normalize_set(shadow_partition_id), now_ms, backlog_id)?;
                let account = sp.account_id();
                ks.zadd_nx(&kg.account_normalize_set(account), now_ms, shadow_partition_id)?;
                ks.zadd_nx(&kg.global_account_normalize_set(), now_ms, &account.to_string())?;
                refresh_shadow_pointer(ks, kg, &sp)
            })
            .await?;
        debug!(shard = %self.name, backlog_id, "backlog parked for normalization");
        Ok(())
    }

    /// Pause or resume refills for a shadow partition.
    pub async fn set_shadow_partition_paused(
        &self,
        shadow_partition_id: &str,
        pause_refill: bool,
        now_ms: i64,
    ) -> Result<(), QueueError> {
        let kg = &self.kg;
        self.store
            .eval("shadow_partition_pause", now_ms, |ks| {
                let mut sp = load_shadow(ks, kg, shadow_partition_id)?
                    .ok_or(QueueError::ShadowPartitionNotFound)?;
                sp.pause_refill = pause_refill;
                store_shadow(ks, kg, &sp)
            })
            .await
    }
}
