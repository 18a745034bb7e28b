//! Item enqueue.

use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::backlog::item_shadow_partition;
use crate::error::QueueError;
use crate::item::{
    hash_id, Identifier, Item, PromotePayload, QueueItem, FUTURE_AT_LIMIT_MS, KIND_JOB_PROMOTE,
};
use crate::keys::KeyGenerator;
use crate::partition::{PartitionConstraintConfig, QueuePartition};
use crate::queue_shard::helpers::{
    load_item, ready_in_backlog, ready_in_partition, store_item, upsert_partition, upsert_shadow,
};
use crate::queue_shard::{QueueShard, PROMOTE_QUEUE_NAME};
use crate::store::Keyspace;

/// Everything an enqueue needs beyond the item itself.
#[derive(Debug, Clone, Default)]
pub struct EnqueueParams {
    pub now_ms: i64,
    /// Write into the shadow backlog instead of the runnable partition
    pub key_queues: bool,
    /// Latest constraints, stamped on the shadow partition
    pub constraints: PartitionConstraintConfig,
    /// Re-enqueue an existing item out of this outdated backlog
    pub normalize_from_backlog_id: Option<String>,
}

impl QueueShard {
    /// Write `item` due at `at_ms` together with every index that points at it.
    ///
    /// The item id must already be set. Returns the stored item.
    pub async fn enqueue(
        &self,
        mut item: QueueItem,
        at_ms: i64,
        params: EnqueueParams,
    ) -> Result<QueueItem, QueueError> {
        if item.id.is_empty() {
            return Err(QueueError::InvalidItem("missing id".into()));
        }
        if item.queue_name.is_none() && item.function_id.is_nil() {
            return Err(QueueError::InvalidItem(
                "item needs a function id or a queue name".into(),
            ));
        }

        let kg = &self.kg;
        let now = params.now_ms;
        let stored = self
            .store
            .eval("enqueue", now, |ks| {
                match params.normalize_from_backlog_id.as_deref() {
                    Some(old_backlog) => {
                        let existing =
                            load_item(ks, kg, &item.id)?.ok_or(QueueError::QueueItemNotFound)?;
                        if existing.is_leased(now) {
                            return Err(QueueError::QueueItemAlreadyLeased);
                        }
                        ks.zrem(&kg.backlog_set(old_backlog), &item.id)?;
                        item.refilled_from = None;
                        item.refilled_at_ms = 0;
                    }
                    None => check_new_item(ks, kg, &item)?,
                }

                item.at_ms = at_ms;
                item.lease_id = None;
                if item.enqueued_at_ms == 0 {
                    item.enqueued_at_ms = now;
                }
                if item.wall_time_ms == 0 {
                    item.wall_time_ms = at_ms;
                }

                if let Some(s) = &item.data.singleton {
                    ks.set(&kg.singleton(&s.key), item.id.clone());
                }
                if let Some(job_id) = &item.data.job_id {
                    ks.hset(&kg.job_index(), job_id, item.id.clone())?;
                }

                let score = item.score(now);
                upsert_partition(ks, kg, QueuePartition::for_item(&item))?;
                store_item(ks, kg, &item)?;
                if params.key_queues {
                    let sp = upsert_shadow(ks, kg, item_shadow_partition(&item, &params.constraints))?;
                    ready_in_backlog(ks, kg, &item, &sp, score)?;
                } else {
                    ready_in_partition(ks, kg, &item, score)?;
                }

                if params.normalize_from_backlog_id.is_none()
                    && item.requires_promotion_job(now)
                {
                    enqueue_promotion(ks, kg, &item)?;
                }
                Ok::<_, QueueError>(item)
            })
            .await?;

        debug!(
            shard = %self.name,
            item_id = %stored.id,
            partition_id = %stored.partition_id(),
            at_ms = stored.at_ms,
            "enqueued item"
        );
        Ok(stored)
    }
}

fn check_new_item(ks: &mut Keyspace, kg: &KeyGenerator, item: &QueueItem) -> Result<(), QueueError> {
    if ks.hexists(&kg.queue_item(), &item.id)? || ks.exists(&kg.idempotency(&item.id)) {
        return Err(QueueError::QueueItemExists);
    }
    if let Some(s) = &item.data.singleton {
        if let Some(holder) = ks.get(&kg.singleton(&s.key))? {
            if holder != item.id && ks.hexists(&kg.queue_item(), &holder)? {
                return Err(QueueError::QueueItemSingletonExists);
            }
        }
    }
    Ok(())
}

/// Schedule a job that rescores `item` shortly before it is due.
fn enqueue_promotion(ks: &mut Keyspace, kg: &KeyGenerator, item: &QueueItem) -> Result<(), QueueError> {
    let id = hash_id(&format!("{}:promote", item.id));
    if ks.hexists(&kg.queue_item(), &id)? {
        return Ok(());
    }
    let at = item.at_ms - FUTURE_AT_LIMIT_MS;
    let payload = PromotePayload {
        promote_job_id: item.id.clone(),
        scheduled_at_ms: item.at_ms,
    };
    let promote = QueueItem {
        id,
        at_ms: at,
        wall_time_ms: at,
        enqueued_at_ms: ks.now_ms(),
        function_id: Uuid::nil(),
        workspace_id: item.workspace_id,
        queue_name: Some(PROMOTE_QUEUE_NAME.to_string()),
        data: Item {
            kind: KIND_JOB_PROMOTE.to_string(),
            workspace_id: item.workspace_id,
            identifier: Identifier {
                workflow_id: item.data.identifier.workflow_id,
                account_id: item.data.identifier.account_id,
                env_id: item.data.identifier.env_id,
                ..Default::default()
            },
            queue_name: Some(PROMOTE_QUEUE_NAME.to_string()),
            payload: json!(payload),
            ..Default::default()
        },
        ..Default::default()
    };
    upsert_partition(ks, kg, QueuePartition::for_item(&promote))?;
    store_item(ks, kg, &promote)?;
    ready_in_partition(ks, kg, &promote, at)
}
