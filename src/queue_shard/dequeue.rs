//! Removing finished items.

use tracing::debug;

use crate::backlog::item_backlog;
use crate::error::QueueError;
use crate::item::QueueItem;
use crate::keys::KeyGenerator;
use crate::queue_shard::helpers::{load_item, refresh_backlog_pointer, release_accounting, shadow_for_item};
use crate::queue_shard::QueueShard;
use crate::store::Keyspace;

impl QueueShard {
    /// Delete `item` and every index entry for it, leaving an idempotency key
    /// behind for `idempotency_ttl_ms` unless the item carries its own period.
    pub async fn dequeue(
        &self,
        item: &QueueItem,
        now_ms: i64,
        idempotency_ttl_ms: i64,
    ) -> Result<(), QueueError> {
        let kg = &self.kg;
        self.store
            .eval("dequeue", now_ms, |ks| {
                let stored = load_item(ks, kg, &item.id)?.ok_or(QueueError::QueueItemNotFound)?;
                remove_item(ks, kg, &stored, idempotency_ttl_ms)
            })
            .await?;
        debug!(shard = %self.name, item_id = %item.id, "dequeued item");
        Ok(())
    }

    /// Dequeue the item enqueued with the unhashed `job_id`. Leased items are left alone.
    pub async fn dequeue_by_job_id(
        &self,
        job_id: &str,
        now_ms: i64,
        idempotency_ttl_ms: i64,
    ) -> Result<QueueItem, QueueError> {
        let kg = &self.kg;
        self.store
            .eval("dequeue_by_job_id", now_ms, |ks| {
                let id = ks
                    .hget(&kg.job_index(), job_id)?
                    .ok_or(QueueError::QueueItemNotFound)?;
                let Some(stored) = load_item(ks, kg, &id)? else {
                    ks.hdel(&kg.job_index(), job_id)?;
                    return Err(QueueError::QueueItemNotFound);
                };
                if stored.is_leased(now_ms) {
                    return Err(QueueError::QueueItemAlreadyLeased);
                }
                remove_item(ks, kg, &stored, idempotency_ttl_ms)?;
                Ok(stored)
            })
            .await
    }

    /// Dequeue an item by id unless it is leased.
    pub async fn dequeue_by_id(
        &self,
        item_id: &str,
        now_ms: i64,
        idempotency_ttl_ms: i64,
    ) -> Result<QueueItem, QueueError> {
        let kg = &self.kg;
        self.store
            .eval("dequeue_by_id", now_ms, |ks| {
                let stored = load_item(ks, kg, item_id)?.ok_or(QueueError::QueueItemNotFound)?;
                if stored.is_leased(now_ms) {
                    return Err(QueueError::QueueItemAlreadyLeased);
                }
                remove_item(ks, kg, &stored, idempotency_ttl_ms)?;
                Ok(stored)
            })
            .await
    }
}

pub(crate) fn remove_item(
    ks: &mut Keyspace,
    kg: &KeyGenerator,
    stored: &QueueItem,
    idempotency_ttl_ms: i64,
) -> Result<(), QueueError> {
    ks.hdel(&kg.queue_item(), &stored.id)?;
    ks.zrem(&kg.partition_queue_set(&stored.partition_id()), &stored.id)?;

    let backlog = item_backlog(stored);
    if ks.zrem(&kg.backlog_set(&backlog.backlog_id), &stored.id)? {
        let sp = shadow_for_item(ks, kg, stored)?;
        refresh_backlog_pointer(ks, kg, &backlog.backlog_id, &sp)?;
    }
    release_accounting(ks, kg, stored)?;

    let ttl = stored.idempotency_period_ms.unwrap_or(idempotency_ttl_ms);
    if ttl > 0 {
        let now = ks.now_ms();
        ks.set_px(&kg.idempotency(&stored.id), now.to_string(), ttl);
    }
    if let Some(s) = &stored.data.singleton {
        let key = kg.singleton(&s.key);
        if ks.get(&key)?.as_deref() == Some(stored.id.as_str()) {
            ks.del(&key);
        }
    }
    if let Some(job_id) = &stored.data.job_id {
        if ks.hget(&kg.job_index(), job_id)?.as_deref() == Some(stored.id.as_str()) {
            ks.hdel(&kg.job_index(), job_id)?;
        }
    }
    Ok(())
}
