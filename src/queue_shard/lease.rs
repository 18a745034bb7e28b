//! Item lease and lease extension.

use tracing::trace;

use crate::backlog::{QueueBacklog, QueueShadowPartition};
use crate::constraints::{throttle_commit, LeaseCheck};
use crate::error::QueueError;
use crate::item::{CapacityLease, QueueItem};
use crate::partition::PartitionConstraintConfig;
use crate::queue_shard::helpers::{accounting_keys, load_item, store_item};
use crate::queue_shard::QueueShard;
use crate::ulid::{LeaseId, Ulid};

/// Inputs for leasing one item.
#[derive(Debug, Clone)]
pub struct LeaseParams {
    pub now_ms: i64,
    pub duration_ms: i64,
    pub backlog: QueueBacklog,
    pub shadow: QueueShadowPartition,
    pub constraints: PartitionConstraintConfig,
    /// Capacity was already granted elsewhere; skip checks and counter updates
    pub disable_constraint_checks: bool,
    pub capacity_lease: Option<CapacityLease>,
}

impl QueueShard {
    /// Lease `item` for `duration_ms`. The returned id embeds the lease expiry.
    pub async fn lease(&self, item: &QueueItem, params: &LeaseParams) -> Result<LeaseId, QueueError> {
        let kg = &self.kg;
        let now = params.now_ms;
        self.store
            .eval("lease", now, |ks| {
                let mut stored = load_item(ks, kg, &item.id)?.ok_or(QueueError::QueueItemNotFound)?;
                if stored.is_leased(now) {
                    return Err(QueueError::QueueItemAlreadyLeased);
                }

                let throttle = if params.disable_constraint_checks {
                    None
                } else {
                    let check = LeaseCheck {
                        kg,
                        item: &stored,
                        shadow: &params.shadow,
                        backlog: &params.backlog,
                        constraints: &params.constraints,
                    };
                    match check.check(ks) {
                        Ok(t) => t,
                        Err(e) => {
                            // first peek that could not run the item starts its sojourn
                            if e.is_limit() && stored.earliest_peek_time_ms == 0 {
                                stored.earliest_peek_time_ms = now;
                                store_item(ks, kg, &stored)?;
                            }
                            return Err(e);
                        }
                    }
                };

                let lease_id = Ulid::new(now + params.duration_ms);
                let expiry = lease_id.timestamp_ms();
                stored.lease_id = Some(lease_id);
                stored.capacity_lease = params.capacity_lease.clone();
                store_item(ks, kg, &stored)?;

                let pid = stored.partition_id();
                ks.zrem(&kg.partition_queue_set(&pid), &stored.id)?;

                let (in_progress, active) = accounting_keys(kg, &stored);
                if params.disable_constraint_checks {
                    // the partition set still feeds the scavenger
                    ks.zadd(&in_progress[0], expiry, &stored.id)?;
                } else {
                    for key in &in_progress {
                        ks.zadd(key, expiry, &stored.id)?;
                    }
                    for key in &active {
                        ks.zadd(key, now, &stored.id)?;
                    }
                }
                ks.zadd_lt(&kg.in_progress_index(), expiry, &pid)?;

                if let Some((key, decision)) = throttle {
                    throttle_commit(ks, kg, &key, &decision);
                }
                trace!(item_id = %stored.id, lease_id = %lease_id, "leased item");
                Ok(lease_id)
            })
            .await
    }

    /// Extend a held lease. Fails when `lease_id` is no longer the current lease.
    pub async fn extend_lease(
        &self,
        item: &QueueItem,
        lease_id: LeaseId,
        duration_ms: i64,
        now_ms: i64,
        disable_constraint_updates: bool,
    ) -> Result<LeaseId, QueueError> {
        let kg = &self.kg;
        self.store
            .eval("extend_lease", now_ms, |ks| {
                let mut stored = load_item(ks, kg, &item.id)?.ok_or(QueueError::QueueItemNotFound)?;
                match stored.lease_id {
                    None => return Err(QueueError::QueueItemNotLeased),
                    Some(current) if current != lease_id => {
                        return Err(QueueError::QueueItemLeaseMismatch)
                    }
                    Some(_) => {}
                }

                let next = Ulid::new(now_ms + duration_ms);
                stored.lease_id = Some(next);
                store_item(ks, kg, &stored)?;

                let (in_progress, _) = accounting_keys(kg, &stored);
                let keys = if disable_constraint_updates {
                    &in_progress[..1]
                } else {
                    &in_progress[..]
                };
                for key in keys {
                    ks.zadd(key, next.timestamp_ms(), &stored.id)?;
                }
                Ok(next)
            })
            .await
    }
}
