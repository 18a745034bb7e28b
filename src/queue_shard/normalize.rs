//! Bookkeeping for backlogs whose fingerprint no longer matches the
//! function's constraints.

use tracing::debug;
use uuid::Uuid;

use crate::backlog::{QueueBacklog, QueueShadowPartition};
use crate::error::QueueError;
use crate::item::QueueItem;
use crate::queue_shard::helpers::{load_backlog, load_item, load_shadow, store_backlog};
use crate::queue_shard::{QueueShard, ABSOLUTE_PEEK_MAX};
use crate::ulid::{LeaseId, Ulid};

impl QueueShard {
    /// Accounts with backlogs waiting for normalization.
    pub async fn peek_normalize_accounts(
        &self,
        until_ms: i64,
        limit: usize,
        now_ms: i64,
    ) -> Result<Vec<Uuid>, QueueError> {
        let key = self.kg.global_account_normalize_set();
        self.store
            .eval("peek_normalize_accounts", now_ms, |ks| {
                Ok(ks
                    .zrange_by_score(&key, i64::MIN, until_ms, 0, limit.min(ABSOLUTE_PEEK_MAX))?
                    .into_iter()
                    .filter_map(|(id, _)| Uuid::parse_str(&id).ok())
                    .collect())
            })
            .await
    }

    pub async fn peek_normalize_shadow_partitions(
        &self,
        account_id: Uuid,
        limit: usize,
        now_ms: i64,
    ) -> Result<Vec<QueueShadowPartition>, QueueError> {
        let kg = &self.kg;
        let key = kg.account_normalize_set(account_id);
        self.store
            .eval("peek_normalize_shadow_partitions", now_ms, |ks| {
                let ids = ks.zrange_by_score(&key, i64::MIN, i64::MAX, 0, limit.min(ABSOLUTE_PEEK_MAX))?;
                let mut out = Vec::with_capacity(ids.len());
                for (id, _) in ids {
                    match load_shadow(ks, kg, &id)? {
                        Some(sp) => out.push(sp),
                        None => {
                            ks.zrem(&key, &id)?;
                        }
                    }
                }
                if ks.zcard(&key)? == 0 {
                    ks.zrem(&kg.global_account_normalize_set(), &account_id.to_string())?;
                }
                Ok(out)
            })
            .await
    }

    pub async fn peek_normalize_backlogs(
        &self,
        shadow_partition_id: &str,
        limit: usize,
        now_ms: i64,
    ) -> Result<Vec<QueueBacklog>, QueueError> {
        let kg = &self.kg;
        let key = kg.shadow_partition_normalize_set(shadow_partition_id);
        self.store
            .eval("peek_normalize_backlogs", now_ms, |ks| {
                let ids = ks.zrange_by_score(&key, i64::MIN, i64::MAX, 0, limit.min(ABSOLUTE_PEEK_MAX))?;
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

    /// Take the normalization lease on a backlog.
    pub async fn lease_backlog_for_normalization(
        &self,
        backlog_id: &str,
        duration_ms: i64,
        now_ms: i64,
    ) -> Result<LeaseId, QueueError> {
        let kg = &self.kg;
        self.store
            .eval("backlog_normalize_lease", now_ms, |ks| {
                let mut backlog = load_backlog(ks, kg, backlog_id)?.ok_or(QueueError::BacklogNotFound)?;
                if let Some(l) = backlog.normalize_lease_id {
                    if !l.is_expired(now_ms) {
                        return Err(QueueError::BacklogAlreadyLeasedForNormalization);
                    }
                }
                let lease_id = Ulid::new(now_ms + duration_ms);
                backlog.normalize_lease_id = Some(lease_id);
                store_backlog(ks, kg, &backlog)?;
                Ok(lease_id)
            })
            .await
    }

    pub async fn extend_backlog_normalization_lease(
        &self,
        backlog_id: &str,
        lease_id: LeaseId,
        duration_ms: i64,
        now_ms: i64,
    ) -> Result<LeaseId, QueueError> {
        let kg = &self.kg;
        self.store
            .eval("backlog_normalize_extend_lease", now_ms, |ks| {
                let mut backlog = load_backlog(ks, kg, backlog_id)?.ok_or(QueueError::BacklogNotFound)?;
                match backlog.normalize_lease_id {
                    Some(current) if current == lease_id && !current.is_expired(now_ms) => {}
                    _ => return Err(QueueError::BacklogNormalizationLeaseExpired),
                }
                let next = Ulid::new(now_ms + duration_ms);
                backlog.normalize_lease_id = Some(next);
                store_backlog(ks, kg, &backlog)?;
                Ok(next)
            })
            .await
    }

    /// Items still sitting in a backlog, regardless of score.
    pub async fn peek_backlog_items(
        &self,
        backlog_id: &str,
        limit: usize,
        now_ms: i64,
    ) -> Result<Vec<QueueItem>, QueueError> {
        let kg = &self.kg;
        let key = kg.backlog_set(backlog_id);
        self.store
            .eval("peek_backlog_items", now_ms, |ks| {
                let ids = ks.zrange_by_score(&key, i64::MIN, i64::MAX, 0, limit.min(ABSOLUTE_PEEK_MAX))?;
                let mut out = Vec::with_capacity(ids.len());
                for (id, _) in ids {
                    match load_item(ks, kg, &id)? {
                        Some(item) => out.push(item),
                        None => {
                            ks.zrem(&key, &id)?;
                        }
                    }
                }
                Ok(out)
            })
            .await
    }

    /// Release the normalization lease held as `lease_id`. An emptied backlog
    /// is removed along with any normalize set that it leaves empty. Returns
    /// true when the backlog is gone. Fails when someone else holds the lease.
    pub async fn finish_backlog_normalization(
        &self,
        backlog_id: &str,
        shadow_partition_id: &str,
        lease_id: LeaseId,
        now_ms: i64,
    ) -> Result<bool, QueueError> {
        let kg = &self.kg;
        let done = self
            .store
            .eval("backlog_normalize_finish", now_ms, |ks| {
                let backlog = load_backlog(ks, kg, backlog_id)?;
                if let Some(b) = &backlog {
                    if b.normalize_lease_id != Some(lease_id) {
                        return Err(QueueError::BacklogNormalizationLeaseExpired);
                    }
                }
                if ks.zcard(&kg.backlog_set(backlog_id))? > 0 {
                    if let Some(mut backlog) = backlog {
                        backlog.normalize_lease_id = None;
                        store_backlog(ks, kg, &backlog)?;
                    }
                    return Ok(false);
                }

                ks.hdel(&kg.backlog_meta(), backlog_id)?;
                let sp_set = kg.shadow_partition_normalize_set(shadow_partition_id);
                ks.zrem(&sp_set, backlog_id)?;
                if ks.zcard(&sp_set)? == 0 {
                    if let Some(sp) = load_shadow(ks, kg, shadow_partition_id)? {
                        let account = sp.account_id();
                        let account_set = kg.account_normalize_set(account);
                        ks.zrem(&account_set, shadow_partition_id)?;
                        if ks.zcard(&account_set)? == 0 {
                            ks.zrem(&kg.global_account_normalize_set(), &account.to_string())?;
                        }
                    }
                }
                Ok::<_, QueueError>(true)
            })
            .await?;
        if done {
            debug!(shard = %self.name, backlog_id, "backlog normalized");
        }
        Ok(done)
    }
}
