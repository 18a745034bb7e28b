//! Returning leased items to their partition or backlog.

use tracing::debug;

use crate::backlog::item_shadow_partition;
use crate::error::QueueError;
use crate::item::QueueItem;
use crate::partition::PartitionConstraintConfig;
use crate::queue_shard::helpers::{
    load_item, ready_in_backlog, ready_in_partition, release_accounting, store_item, upsert_shadow,
};
use crate::queue_shard::QueueShard;

#[derive(Debug, Clone, Default)]
pub struct RequeueParams {
    pub now_ms: i64,
    pub at_ms: i64,
    /// Send the item back through its backlog
    pub key_queues: bool,
    pub constraints: PartitionConstraintConfig,
}

impl QueueShard {
    /// Clear the lease on `item` and make it ready again at `at_ms`.
    ///
    /// The caller's copy wins over the stored one, so attempt bumps made by
    /// the worker are persisted.
    pub async fn requeue(&self, item: &QueueItem, params: &RequeueParams) -> Result<(), QueueError> {
        let kg = &self.kg;
        let now = params.now_ms;
        self.store
            .eval("requeue", now, |ks| {
                let stored = load_item(ks, kg, &item.id)?.ok_or(QueueError::QueueItemNotFound)?;
                release_accounting(ks, kg, &stored)?;
                ks.zrem(&kg.partition_queue_set(&stored.partition_id()), &stored.id)?;

                let mut next = item.clone();
                next.lease_id = None;
                next.capacity_lease = None;
                next.at_ms = params.at_ms;
                next.wall_time_ms = params.at_ms;
                next.earliest_peek_time_ms = 0;
                next.refilled_from = None;
                next.refilled_at_ms = 0;

                let score = next.score(now);
                store_item(ks, kg, &next)?;
                if params.key_queues {
                    let sp = upsert_shadow(ks, kg, item_shadow_partition(&next, &params.constraints))?;
                    ready_in_backlog(ks, kg, &next, &sp, score)?;
                } else {
                    ready_in_partition(ks, kg, &next, score)?;
                }
                Ok::<_, QueueError>(())
            })
            .await?;
        debug!(shard = %self.name, item_id = %item.id, at_ms = params.at_ms, "requeued item");
        Ok(())
    }
}
