//! Reclaiming items whose lease expired without an extension.

use tracing::debug;

use crate::error::QueueError;
use crate::keys::SetScope;
use crate::queue_shard::helpers::{load_item, ready_in_partition, release_accounting, store_item};
use crate::queue_shard::QueueShard;

impl QueueShard {
    /// Requeue up to `limit` items per partition whose lease expired at or
    /// before `now_ms`. Reclaimed items are ready immediately and keep their
    /// attempt count. Returns the reclaimed item ids.
    pub async fn scavenge(&self, limit: usize, now_ms: i64) -> Result<Vec<String>, QueueError> {
        let kg = &self.kg;
        let reclaimed = self
            .store
            .eval("scavenge", now_ms, |ks| {
                let index = kg.in_progress_index();
                let partitions = ks.zrange_by_score(&index, i64::MIN, now_ms, 0, limit)?;
                let mut reclaimed = Vec::new();
                for (pid, _) in partitions {
                    let key = kg.in_progress(SetScope::Partition, &pid);
                    for (id, _) in ks.zrange_by_score(&key, i64::MIN, now_ms, 0, limit)? {
                        let Some(mut item) = load_item(ks, kg, &id)? else {
                            ks.zrem(&key, &id)?;
                            continue;
                        };
                        if let Some(lease) = item.lease_id.filter(|_| item.is_leased(now_ms)) {
                            // extended since the set was written
                            ks.zadd(&key, lease.timestamp_ms(), &id)?;
                            continue;
                        }
                        release_accounting(ks, kg, &item)?;
                        item.lease_id = None;
                        item.capacity_lease = None;
                        store_item(ks, kg, &item)?;
                        ready_in_partition(ks, kg, &item, now_ms)?;
                        reclaimed.push(id);
                    }
                    match ks.zmin(&key)? {
                        Some((_, earliest)) => {
                            ks.zadd(&index, earliest, &pid)?;
                        }
                        None => {
                            ks.zrem(&index, &pid)?;
                        }
                    }
                }
                Ok::<_, QueueError>(reclaimed)
            })
            .await?;

        debug!(shard = %self.name, count = reclaimed.len(), "scavenge pass");
        Ok(reclaimed)
    }
}
