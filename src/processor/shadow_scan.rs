//! The shadow scan: refill runnable partitions from their backlogs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rand::Rng;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, warn, Instrument};

use crate::backlog::{backlog_refill_multiplier, shuffle_backlogs, NormalizeReason, QueueBacklog, QueueShadowPartition};
use crate::constraints::{CapacityRequest, QueueConstraint};
use crate::error::QueueError;
use crate::partition::PartitionConstraintConfig;
use crate::processor::QueueProcessor;
use crate::queue_shard::{BacklogRefillParams, BacklogRefillResult, QueueShard, ShadowIndex, PARTITION_PEEK_MAX, SHADOW_PARTITION_PEEK_MAX_BACKLOGS};
use crate::ulid::LeaseId;

/// Horizon used when items skip key queues: drain everything.
const DRAIN_HORIZON_MS: i64 = 365 * 24 * 60 * 60 * 1_000;

/// What one shadow partition pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShadowPassStats {
    pub refilled: usize,
    pub backlogs: usize,
    pub normalizing: usize,
    /// An account or function limit stopped the pass
    pub partition_constrained: bool,
}

impl QueueProcessor {
    pub(crate) async fn shadow_scan_loop(self: Arc<Self>, stop: CancellationToken) {
        let mut tick = tokio::time::interval(self.opts.settings.shadow_poll_tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tick.tick() => {}
            }
            if let Err(e) = self.shadow_scan_once().await {
                warn!(shard = %self.primary().name(), error = %e, "shadow scan failed");
            }
        }
        debug!("shadow scan stopped");
    }

    /// One shadow scan pass. Returns the number of shadow partitions processed.
    pub async fn shadow_scan_once(&self) -> Result<usize, QueueError> {
        let shard = self.primary();
        let mode = &self.opts.run_mode;
        let mut processed = 0;

        if mode.shadow_continuations {
            let skip = mode.shadow_continuation_skip_probability;
            for (spid, c) in self.shadow_continuations.snapshot() {
                if skip > 0.0 && rand::rng().random::<f64>() < skip {
                    continue;
                }
                let now = self.now_ms();
                if self.shadow_continuations.remove(&spid, false, now) {
                    if let Some(m) = &self.opts.metrics {
                        m.record_continuation_removed("shadow");
                    }
                }
                let Some(sp) = shard.shadow_partition_by_id(&spid, now).await? else {
                    continue;
                };
                if let Err(e) = self.process_shadow_partition(&sp, c.count).await {
                    warn!(shadow_partition_id = %spid, error = %e, "error processing continued shadow partition");
                }
                processed += 1;
            }
        }

        let now = self.now_ms();
        let by_account = mode.account_shadow_partition
            && rand::rng().random_range(0..100) < mode.account_shadow_partition_weight;
        let partitions = if by_account {
            let accounts = shard.peek_shadow_accounts(now, PARTITION_PEEK_MAX, false, now).await?;
            let per_account = (PARTITION_PEEK_MAX / accounts.len().max(1)).max(1);
            let mut out = Vec::new();
            for account in accounts {
                out.extend(
                    shard
                        .peek_shadow_partitions(ShadowIndex::Account(account), now, per_account, false, now)
                        .await?,
                );
            }
            out
        } else {
            shard
                .peek_shadow_partitions(ShadowIndex::Global, now, PARTITION_PEEK_MAX, false, now)
                .await?
        };
        processed += partitions.len();

        let limit = self.opts.settings.num_shadow_workers.max(1);
        stream::iter(partitions)
            .for_each_concurrent(Some(limit), |sp| async move {
                if let Err(e) = self.process_shadow_partition(&sp, 0).await {
                    warn!(shadow_partition_id = %sp.partition_id, error = %e, "error processing shadow partition");
                }
            })
            .await;
        Ok(processed)
    }

    fn drop_shadow_continuation(&self, spid: &str) {
        if self.shadow_continuations.remove(spid, false, self.now_ms()) {
            if let Some(m) = &self.opts.metrics {
                m.record_continuation_removed("shadow");
            }
        }
    }

    /// Lease a shadow partition and refill its runnable partition from its
    /// backlogs. `None` when the partition was skipped.
    pub async fn process_shadow_partition(
        &self,
        sp: &QueueShadowPartition,
        continuation_count: u32,
    ) -> Result<Option<ShadowPassStats>, QueueError> {
        let span = debug_span!("process_shadow_partition", shadow_partition_id = %sp.partition_id, continuation_count);
        self.process_shadow_partition_inner(sp, continuation_count)
            .instrument(span)
            .await
    }

    async fn process_shadow_partition_inner(
        &self,
        sp: &QueueShadowPartition,
        continuation_count: u32,
    ) -> Result<Option<ShadowPassStats>, QueueError> {
        let shard = self.primary();
        let settings = &self.opts.settings;
        let spid = sp.partition_id.as_str();
        let now = self.now_ms();

        if let Some(fid) = sp.function_id {
            if let Some(until) = shard.migration_lock_until(fid, now).await? {
                trace!(shadow_partition_id = %spid, until, "function locked for migration");
                self.requeue_shadow(shard, spid, None, Some(until), now).await?;
                self.drop_shadow_continuation(spid);
                return Ok(None);
            }
            if sp.pause_refill || self.opts.paused(fid).is_effective() {
                let at = now + settings.partition_paused_requeue_ms as i64;
                self.requeue_shadow(shard, spid, None, Some(at), now).await?;
                self.drop_shadow_continuation(spid);
                return Ok(None);
            }
        }

        let lease_ms = settings.shadow_partition_lease_ms as i64;
        let lease = match shard.shadow_partition_lease(spid, lease_ms, now).await {
            Ok(l) => l,
            Err(QueueError::ShadowPartitionAlreadyLeased) => {
                if let Some(m) = &self.opts.metrics {
                    m.record_partition_contention(shard.name());
                }
                self.drop_shadow_continuation(spid);
                return Ok(None);
            }
            Err(e) if e.is_not_found() => {
                self.drop_shadow_continuation(spid);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let held = Arc::new(Mutex::new(lease));
        let done = CancellationToken::new();
        let _stop_renewal = done.clone().drop_guard();
        self.spawn_shadow_lease_renewal(shard, spid, &held, &done);

        let pass = self.refill_shadow_partition(shard, sp).await;
        done.cancel();
        let current = *held.lock().unwrap();

        let stats = match pass {
            Ok(stats) => stats,
            Err(e) => {
                // let the partition be picked up again
                if let Err(re) = self.requeue_shadow(shard, spid, Some(current), None, self.now_ms()).await {
                    debug!(shadow_partition_id = %spid, error = %re, "could not requeue shadow partition");
                }
                return Err(e);
            }
        };

        let now = self.now_ms();
        let requeue_at = stats
            .partition_constrained
            .then(|| now + settings.partition_concurrency_requeue_ms as i64);
        self.requeue_shadow(shard, spid, Some(current), requeue_at, now).await?;

        if stats.partition_constrained {
            self.drop_shadow_continuation(spid);
            return Ok(Some(stats));
        }
        if stats.refilled > 0 {
            if self.continuations.add(spid, 1, now) {
                if let Some(m) = &self.opts.metrics {
                    m.record_continuation_added("partition");
                }
            }
            let more = stats.backlogs >= SHADOW_PARTITION_PEEK_MAX_BACKLOGS;
            if more && continuation_count < self.opts.shadow_processing_limit(sp) {
                if self.shadow_continuations.add(spid, continuation_count + 1, now) {
                    if let Some(m) = &self.opts.metrics {
                        m.record_continuation_added("shadow");
                    }
                }
                return Ok(Some(stats));
            }
        }
        self.drop_shadow_continuation(spid);
        Ok(Some(stats))
    }

    async fn requeue_shadow(
        &self,
        shard: &QueueShard,
        spid: &str,
        lease: Option<LeaseId>,
        at: Option<i64>,
        now: i64,
    ) -> Result<(), QueueError> {
        match shard.shadow_partition_requeue(spid, lease, at, now).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() || matches!(e, QueueError::ShadowPartitionLeaseExpired) => {
                trace!(shadow_partition_id = %spid, error = %e, "shadow partition requeue skipped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn spawn_shadow_lease_renewal(
        &self,
        shard: &QueueShard,
        spid: &str,
        held: &Arc<Mutex<LeaseId>>,
        done: &CancellationToken,
    ) {
        let shard = shard.clone();
        let spid = spid.to_string();
        let held = Arc::clone(held);
        let done = done.clone();
        let clock = self.opts.clock.clone();
        let lease_ms = self.opts.settings.shadow_partition_lease_ms;
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
                    .extend_shadow_partition_lease(&spid, current, lease_ms as i64, clock.now_ms())
                    .await
                {
                    Ok(next) => *held.lock().unwrap() = next,
                    Err(e) => {
                        debug!(shadow_partition_id = %spid, error = %e, "could not renew shadow partition lease");
                        return;
                    }
                }
            }
        });
    }

    async fn refill_shadow_partition(
        &self,
        shard: &QueueShard,
        sp: &QueueShadowPartition,
    ) -> Result<ShadowPassStats, QueueError> {
        let settings = &self.opts.settings;
        let spid = sp.partition_id.as_str();
        let now = self.now_ms();
        let constraints = match (sp.function_id, sp.is_system()) {
            (Some(fid), false) => {
                self.opts
                    .constraints_for(sp.account_id(), sp.env_id.unwrap_or_default(), fid)
            }
            _ => sp.constraints(),
        };
        let key_queues = match sp.function_id {
            Some(fid) if !sp.is_system() => self.opts.key_queues_enabled(sp.account_id(), fid),
            _ => false,
        };
        let until = if key_queues {
            now + settings.shadow_partition_lookahead_ms as i64
        } else {
            now + DRAIN_HORIZON_MS
        };

        let peeked = shard
            .peek_backlogs(spid, until, SHADOW_PARTITION_PEEK_MAX_BACKLOGS, now)
            .await?;
        let mut stats = ShadowPassStats {
            backlogs: peeked.len(),
            ..Default::default()
        };

        let mut backlogs = Vec::with_capacity(peeked.len());
        for b in peeked {
            let reason = b.is_outdated(&constraints);
            if key_queues && reason != NormalizeReason::Unchanged {
                if let Some(m) = &self.opts.metrics {
                    m.record_backlog_outdated(shard.name(), reason.as_str());
                }
                match shard.backlog_prepare_normalize(&b.backlog_id, spid, now).await {
                    Ok(()) => stats.normalizing += 1,
                    Err(e) if e.is_not_found() || e.is_contention() => {}
                    Err(e) => return Err(e),
                }
                continue;
            }
            backlogs.push(b);
        }

        let mut ordered = shuffle_backlogs(backlogs, &mut rand::rng());
        if constraints.throttle.is_some() && constraints.concurrency.custom_concurrency_keys.is_empty() {
            if let Some(default) = sp.default_backlog(false) {
                match ordered.iter().position(|b| b.backlog_id == default.backlog_id) {
                    Some(i) => {
                        let b = ordered.remove(i);
                        ordered.insert(0, b);
                    }
                    None => ordered.insert(0, default),
                }
            }
        }

        for backlog in &ordered {
            let passes = backlog_refill_multiplier(&ordered, backlog, &constraints);
            for _ in 0..passes {
                let result = match self.refill_backlog(shard, sp, backlog, &constraints, until).await {
                    Ok(r) => r,
                    Err(e) if e.is_not_found() => break,
                    Err(e) => return Err(e),
                };
                stats.refilled += result.refilled_count();
                self.report_refill(shard, sp, backlog, &result);

                if result.constraint.is_partition_wide() {
                    stats.partition_constrained = true;
                    return Ok(stats);
                }
                if result.constraint != QueueConstraint::NotLimited {
                    let at = result.backlog.requeue_backoff_ms(self.now_ms(), result.constraint, result.retry_at_ms);
                    match shard.backlog_requeue(&backlog.backlog_id, spid, at, self.now_ms()).await {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                    break;
                }
                if result.refilled_count() == 0 || result.refilled_count() >= result.total {
                    break;
                }
            }
        }
        Ok(stats)
    }

    async fn refill_backlog(
        &self,
        shard: &QueueShard,
        sp: &QueueShadowPartition,
        backlog: &QueueBacklog,
        constraints: &PartitionConstraintConfig,
        until: i64,
    ) -> Result<BacklogRefillResult, QueueError> {
        let settings = &self.opts.settings;
        let now = self.now_ms();
        let limit = settings.effective_refill_limit();
        let mut params = BacklogRefillParams {
            now_ms: now,
            until_ms: until,
            limit,
            constraints: constraints.clone(),
            check_constraints: true,
            ..Default::default()
        };

        if let Some(api) = self.opts.constraint_api.as_deref().filter(|_| !sp.is_system()) {
            let item_ids = shard.peek_backlog_item_ids(&backlog.backlog_id, until, limit, now).await?;
            if item_ids.is_empty() {
                return Ok(BacklogRefillResult {
                    until_ms: until,
                    backlog: backlog.clone(),
                    ..Default::default()
                });
            }
            let req = CapacityRequest {
                account_id: sp.account_id(),
                env_id: sp.env_id.unwrap_or_default(),
                function_id: sp.function_id,
                constraints: constraints.clone(),
                item_ids,
                throttle_key: backlog.throttle.as_ref().map(|t| t.throttle_key.clone()),
                custom_keys: backlog
                    .concurrency_keys
                    .iter()
                    .map(|k| k.canonical_key_id.clone())
                    .collect(),
                now_ms: now,
                lease_duration_ms: settings.item_lease_ms as i64,
            };
            let resp = api.backlog_refill_constraint_check(&req).await?;
            params.external_constraint = resp
                .limiting_constraints
                .first()
                .copied()
                .unwrap_or(QueueConstraint::NotLimited);
            params.external_retry_at_ms = now + resp.retry_after_ms;
            params.capacity_grants = Some(resp.granted_leases);
        }

        shard.backlog_refill(&backlog.backlog_id, &sp.partition_id, &params).await
    }

    fn report_refill(
        &self,
        shard: &QueueShard,
        sp: &QueueShadowPartition,
        backlog: &QueueBacklog,
        result: &BacklogRefillResult,
    ) {
        if let Some(m) = &self.opts.metrics {
            m.record_backlog_refill(shard.name(), result.refilled_count() as u64, result.constraint.as_str());
        }
        for l in &self.opts.listeners {
            if result.constraint != QueueConstraint::NotLimited {
                l.on_backlog_refill_constraint_hit(sp, backlog, result);
            }
            if result.refilled_count() > 0 {
                l.on_backlog_refilled(sp, backlog, result);
            }
        }
    }
}
