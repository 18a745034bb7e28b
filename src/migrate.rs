//! Moving a function's items off a shard.

use std::future::Future;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::QueueError;
use crate::item::QueueItem;
use crate::queue_shard::QueueShard;

/// The function stays locked for at most this long per pass.
pub const MIGRATION_LOCK_MS: i64 = 10 * 60_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrateResult {
    pub migrated: usize,
    /// Handler failures and items that were leased; they stay on the source
    pub failed: usize,
}

/// Hand every item of `function_id` on `source` to `handler`, at most
/// `concurrency` at a time, and dequeue the ones it accepted.
///
/// The function is migration-locked for the pass, so no scanner leases its
/// partitions meanwhile.
pub async fn migrate<F, Fut>(
    source: &QueueShard,
    clock: &SharedClock,
    function_id: Uuid,
    concurrency: usize,
    handler: F,
) -> Result<MigrateResult, QueueError>
where
    F: Fn(QueueItem) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let now = clock.now_ms();
    if !source
        .lock_function_for_migration(function_id, now + MIGRATION_LOCK_MS, now)
        .await?
    {
        return Err(QueueError::PartitionPaused);
    }

    let result = migrate_locked(source, clock, function_id, concurrency, &handler).await;
    source
        .unlock_function_for_migration(function_id, clock.now_ms())
        .await?;
    let result = result?;
    info!(
        shard = %source.name(),
        function_id = %function_id,
        migrated = result.migrated,
        failed = result.failed,
        "migration pass finished"
    );
    Ok(result)
}

async fn migrate_locked<F, Fut>(
    source: &QueueShard,
    clock: &SharedClock,
    function_id: Uuid,
    concurrency: usize,
    handler: &F,
) -> Result<MigrateResult, QueueError>
where
    F: Fn(QueueItem) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let ids = source.function_item_ids(function_id, clock.now_ms()).await?;
    let outcomes: Vec<Result<bool, QueueError>> = stream::iter(ids)
        .map(|id| async move {
            let Some(item) = source.item_by_id(&id, clock.now_ms()).await? else {
                return Ok(false);
            };
            if item.is_leased(clock.now_ms()) {
                debug!(item_id = %id, "item in progress, not migrated");
                return Ok(false);
            }
            if let Err(e) = handler(item).await {
                warn!(item_id = %id, error = %e, "migration handler failed");
                return Ok(false);
            }
            match source.dequeue_by_id(&id, clock.now_ms(), 0).await {
                Ok(_) => Ok(true),
                Err(e) if e.is_not_found() => Ok(true),
                Err(QueueError::QueueItemAlreadyLeased) => Ok(false),
                Err(e) => Err(e),
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut result = MigrateResult::default();
    for o in outcomes {
        if o? {
            result.migrated += 1;
        } else {
            result.failed += 1;
        }
    }
    Ok(result)
}
