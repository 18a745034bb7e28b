//! The normalization scan: move items out of backlogs whose keys no longer
//! match their function's constraints.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backlog::{item_backlog, NormalizeReason, QueueBacklog, QueueShadowPartition};
use crate::error::QueueError;
use crate::item::QueueItem;
use crate::partition::PartitionConstraintConfig;
use crate::processor::QueueProcessor;
use crate::queue_shard::{EnqueueParams, QueueShard, NORMALIZE_BACKLOG_PEEK_MAX, PARTITION_PEEK_MAX, SHADOW_PARTITION_PEEK_MAX_BACKLOGS};
use crate::ulid::LeaseId;

impl QueueProcessor {
    pub(crate) async fn normalize_loop(self: Arc<Self>, stop: CancellationToken) {
        let mut tick = tokio::time::interval(self.opts.settings.normalize_poll_tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tick.tick() => {}
            }
            if let Err(e) = self.normalize_once().await {
                warn!(shard = %self.primary().name(), error = %e, "normalize scan failed");
            }
        }
        debug!("normalize scan stopped");
    }

    /// One normalization pass over every parked backlog. Returns the number
    /// of items moved.
    pub async fn normalize_once(&self) -> Result<usize, QueueError> {
        let shard = self.primary();
        let now = self.now_ms();

        let mut work: Vec<(QueueShadowPartition, QueueBacklog)> = Vec::new();
        for account in shard.peek_normalize_accounts(now, PARTITION_PEEK_MAX, now).await? {
            for sp in shard
                .peek_normalize_shadow_partitions(account, PARTITION_PEEK_MAX, now)
                .await?
            {
                for b in shard
                    .peek_normalize_backlogs(&sp.partition_id, SHADOW_PARTITION_PEEK_MAX_BACKLOGS, now)
                    .await?
                {
                    work.push((sp.clone(), b));
                }
            }
        }
        if work.is_empty() {
            return Ok(0);
        }

        let limit = self.opts.settings.num_normalization_workers.max(1);
        let moved: Vec<usize> = stream::iter(work)
            .map(|(sp, b)| async move {
                match self.normalize_backlog(&sp, &b).await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(backlog_id = %b.backlog_id, error = %e, "error normalizing backlog");
                        0
                    }
                }
            })
            .buffer_unordered(limit)
            .collect()
            .await;
        Ok(moved.into_iter().sum())
    }

    /// Move every item of `backlog` into the backlog its refreshed keys
    /// belong to. Returns the number of items moved or dropped.
    pub async fn normalize_backlog(&self, sp: &QueueShadowPartition, backlog: &QueueBacklog) -> Result<usize, QueueError> {
        let shard = self.primary();
        let settings = &self.opts.settings;
        let bid = backlog.backlog_id.as_str();
        let lease_ms = settings.backlog_normalize_lease_ms as i64;

        let lease = match shard.lease_backlog_for_normalization(bid, lease_ms, self.now_ms()).await {
            Ok(l) => l,
            Err(e) if e.is_contention() || e.is_not_found() => {
                debug!(backlog_id = %bid, error = %e, "backlog skipped for normalization");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };
        let held = Arc::new(Mutex::new(lease));
        let done = CancellationToken::new();
        let _stop_renewal = done.clone().drop_guard();
        let renewal = self.spawn_normalize_lease_renewal(shard, bid, &held, &done);

        let constraints = match (sp.function_id, sp.is_system()) {
            (Some(fid), false) => self
                .opts
                .constraints_for(sp.account_id(), sp.env_id.unwrap_or_default(), fid),
            _ => sp.constraints(),
        };
        let concurrency = settings.backlog_normalize_concurrency.max(1);

        let mut moved = 0;
        loop {
            if done.is_cancelled() {
                break;
            }
            let items = shard.peek_backlog_items(bid, NORMALIZE_BACKLOG_PEEK_MAX, self.now_ms()).await?;
            if items.is_empty() {
                break;
            }
            let results: Vec<Result<(), QueueError>> = stream::iter(items)
                .map(|item| self.normalize_item(shard, bid, item, &constraints))
                .buffer_unordered(concurrency)
                .collect()
                .await;
            let mut progressed = 0;
            for r in results {
                match r {
                    Ok(()) => progressed += 1,
                    Err(e) => warn!(backlog_id = %bid, error = %e, "could not normalize item"),
                }
            }
            if progressed == 0 {
                // leased items stay put until they settle
                break;
            }
            moved += progressed;
        }
        done.cancel();
        let _ = renewal.await;

        let lease = *held.lock().unwrap();
        let finished = match shard
            .finish_backlog_normalization(bid, &sp.partition_id, lease, self.now_ms())
            .await
        {
            Ok(finished) => finished,
            Err(QueueError::BacklogNormalizationLeaseExpired) => {
                debug!(backlog_id = %bid, "normalization lease taken over, leaving the backlog");
                false
            }
            Err(e) => return Err(e),
        };
        if let Some(m) = &self.opts.metrics {
            m.record_backlog_normalized(shard.name(), moved as u64);
        }
        debug!(backlog_id = %bid, moved, finished, "backlog normalization pass done");
        Ok(moved)
    }

    async fn normalize_item(
        &self,
        shard: &QueueShard,
        backlog_id: &str,
        item: QueueItem,
        constraints: &PartitionConstraintConfig,
    ) -> Result<(), QueueError> {
        let now = self.now_ms();
        let refresher = &self.opts.normalize_refresher;
        let refreshed = refresher
            .custom_concurrency_keys(&item, constraints)
            .zip(refresher.throttle(&item, constraints));
        let Some((keys, throttle)) = refreshed else {
            debug!(item_id = %item.id, "source gone, dropping item");
            return match shard.dequeue(&item, now, self.opts.idempotency_ttl_ms(&item)).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e),
            };
        };

        let mut next = item;
        next.data.custom_concurrency_keys = keys;
        next.data.throttle = throttle;
        let target = item_backlog(&next);
        let reason = target.is_outdated(constraints);
        if reason != NormalizeReason::Unchanged {
            warn!(
                item_id = %next.id,
                backlog_id = %target.backlog_id,
                reason = reason.as_str(),
                "normalized item lands in an outdated backlog"
            );
        }

        let at = next.at_ms;
        let params = EnqueueParams {
            now_ms: now,
            key_queues: true,
            constraints: constraints.clone(),
            normalize_from_backlog_id: Some(backlog_id.to_string()),
        };
        match shard.enqueue(next, at, params).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn spawn_normalize_lease_renewal(
        &self,
        shard: &QueueShard,
        backlog_id: &str,
        held: &Arc<Mutex<LeaseId>>,
        done: &CancellationToken,
    ) -> JoinHandle<()> {
        let shard = shard.clone();
        let backlog_id = backlog_id.to_string();
        let held = Arc::clone(held);
        let done = done.clone();
        let clock = self.opts.clock.clone();
        let lease_ms = self.opts.settings.backlog_normalize_lease_ms;
        let period = Duration::from_millis((lease_ms / 2).max(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = done.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let current = *held.lock().unwrap();
                match shard
                    .extend_backlog_normalization_lease(&backlog_id, current, lease_ms as i64, clock.now_ms())
                    .await
                {
                    Ok(next) => *held.lock().unwrap() = next,
                    Err(e) => {
                        warn!(backlog_id = %backlog_id, error = %e, "lost backlog normalization lease");
                        // stops the pass at the next page
                        done.cancel();
                        return;
                    }
                }
            }
        })
    }
}
