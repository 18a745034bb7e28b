//! Running leased items and settling the result.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{ProcessorError, QueueError, RunError};
use crate::item::{CapacityLease, QueueItem, KIND_JOB_PROMOTE};
use crate::partition::QueuePartition;
use crate::processor::{QueueProcessor, RunFn, RunInfo, RunResult};
use crate::queue_shard::{QueueShard, RequeueParams};
use crate::retry::should_retry;
use crate::ulid::LeaseId;

/// Long jobs log progress this often.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A leased item on its way to a worker. The permit is held until the item
/// is settled.
pub(crate) struct WorkMessage {
    pub shard: QueueShard,
    pub partition: QueuePartition,
    pub item: QueueItem,
    pub lease_id: LeaseId,
    pub continuation_count: u32,
    pub capacity_lease: Option<CapacityLease>,
    pub disable_constraint_updates: bool,
    pub priority: u32,
    pub permit: OwnedSemaphorePermit,
}

impl QueueProcessor {
    pub(crate) async fn worker_loop(
        self: Arc<Self>,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkMessage>>>,
        run_fn: RunFn,
        quit: mpsc::UnboundedSender<ProcessorError>,
        closing: CancellationToken,
    ) {
        loop {
            let msg = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    biased;
                    msg = rx.recv() => msg,
                    // drain what the scanners already leased
                    _ = closing.cancelled() => rx.try_recv().ok(),
                }
            };
            let Some(msg) = msg else {
                break;
            };
            if let Err(e) = self.process(msg, &run_fn).await {
                match e {
                    ProcessorError::Quit(_) => Self::report_quit(&quit, e),
                    ProcessorError::Queue(e) => warn!(error = %e, "error settling item"),
                }
            }
        }
        trace!("worker stopped");
    }

    /// Process one already-dispatched item, if any. Returns whether an item
    /// was processed.
    pub async fn work_once(&self, run_fn: &RunFn) -> Result<bool, ProcessorError> {
        let msg = self.work_rx.lock().await.try_recv().ok();
        match msg {
            Some(msg) => self.process(msg, run_fn).await.map(|_| true),
            None => Ok(false),
        }
    }

    /// Take every dispatched item without running it. Their leases stay held.
    pub async fn drain_dispatched(&self) -> Vec<QueueItem> {
        let mut rx = self.work_rx.lock().await;
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg.item);
        }
        out
    }

    async fn process(&self, msg: WorkMessage, run_fn: &RunFn) -> Result<(), ProcessorError> {
        let WorkMessage {
            shard,
            partition,
            mut item,
            lease_id,
            continuation_count,
            capacity_lease,
            disable_constraint_updates,
            priority,
            permit,
        } = msg;
        let started = Instant::now();

        // fires when a lease can no longer be held
        let lost = CancellationToken::new();
        let done = CancellationToken::new();
        let _stop_extenders = done.clone().drop_guard();

        self.spawn_lease_extender(&shard, &item, lease_id, disable_constraint_updates, &lost, &done);
        if let Some(lease) = &capacity_lease {
            self.spawn_capacity_extender(&item, lease.lease_id, &lost, &done);
        }

        // near-future items are leased early; never run before `at`
        let now = self.now_ms();
        let wait = (item.at_ms - now).max(0);
        if wait > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(wait as u64)) => {}
                _ = lost.cancelled() => {}
            }
        }
        if lost.is_cancelled() {
            debug!(item_id = %item.id, "lease lost before run");
            self.finish(permit, &item, capacity_lease);
            return Ok(());
        }

        let now = self.now_ms();
        let latency_ms = item.latency_ms(now);
        let sojourn_ms = item.sojourn_latency_ms(now);
        if let Some(m) = &self.opts.metrics {
            m.record_latency(shard.name(), latency_ms as f64 / 1_000.0, sojourn_ms as f64 / 1_000.0);
        }

        let outcome = if item.data.kind == KIND_JOB_PROMOTE {
            self.promote(&shard, &item).await
        } else {
            let info = RunInfo {
                latency_ms,
                sojourn_delay_ms: sojourn_ms,
                priority,
                queue_shard_name: shard.name().to_string(),
                continue_count: continuation_count,
                refilled_from_backlog: item.refilled_from.clone(),
                capacity_lease: capacity_lease.clone(),
                job_id: item.data.job_id.clone().unwrap_or_else(|| item.id.clone()),
                group_id: item.data.group_id.clone(),
            };
            match self.invoke(run_fn, info, &item, &lost).await {
                Some(outcome) => outcome,
                None => {
                    warn!(item_id = %item.id, partition_id = %partition.id, "lease lost while running, result dropped");
                    self.finish(permit, &item, capacity_lease);
                    return Ok(());
                }
            }
        };
        done.cancel();

        let now = self.now_ms();
        let settled = match outcome {
            Ok(res) => {
                if res.scheduled_immediate_job
                    && self.continuations.add(&partition.id, continuation_count + 1, now)
                {
                    if let Some(m) = &self.opts.metrics {
                        m.record_continuation_added("partition");
                    }
                }
                self.settle_dequeue(&shard, &item, now).await.map(|_| "success")
            }
            Err(err) if err.quit => {
                // hand the item back untouched before stopping
                let params = self.requeue_params(&item, now, now);
                if let Err(e) = shard.requeue(&item, &params).await {
                    debug!(item_id = %item.id, error = %e, "could not requeue before quit");
                }
                self.finish(permit, &item, capacity_lease);
                return Err(ProcessorError::Quit(err));
            }
            Err(err) if should_retry(&err, item.data.attempt, item.data.max_attempts()) => {
                let at = err
                    .retry_at_ms
                    .unwrap_or_else(|| (self.opts.backoff)(item.data.attempt, now));
                if !err.always_retryable {
                    item.data.attempt += 1;
                }
                debug!(item_id = %item.id, attempt = item.data.attempt, at_ms = at, error = %err, "retrying item");
                let params = self.requeue_params(&item, now, at);
                match shard.requeue(&item, &params).await {
                    Ok(()) => {
                        if let Some(m) = &self.opts.metrics {
                            m.record_requeue(shard.name(), "retry");
                        }
                        Ok("retry")
                    }
                    Err(QueueError::QueueItemNotFound) => Ok("retry"),
                    Err(e) => Err(e),
                }
            }
            Err(err) => {
                debug!(item_id = %item.id, attempt = item.data.attempt, error = %err, "item failed permanently");
                self.settle_dequeue(&shard, &item, now).await.map(|_| "failed")
            }
        };

        let result = match settled {
            Ok(status) => {
                if let Some(m) = &self.opts.metrics {
                    m.record_processed(shard.name(), status, started.elapsed().as_secs_f64());
                }
                Ok(())
            }
            Err(e) => Err(ProcessorError::Queue(e)),
        };
        self.finish(permit, &item, capacity_lease);
        result
    }

    /// Run `run_fn` on its own task. `None` when the lease was lost first, in
    /// which case the task is aborted before the worker slot is returned.
    async fn invoke(
        &self,
        run_fn: &RunFn,
        info: RunInfo,
        item: &QueueItem,
        lost: &CancellationToken,
    ) -> Option<Result<RunResult, RunError>> {
        let mut handle = tokio::spawn((run_fn.as_ref())(info, item.clone()));
        let started = Instant::now();
        let mut progress = tokio::time::interval_at(
            tokio::time::Instant::now() + PROGRESS_LOG_INTERVAL,
            PROGRESS_LOG_INTERVAL,
        );
        loop {
            tokio::select! {
                res = &mut handle => {
                    return Some(match res {
                        Ok(outcome) => outcome,
                        Err(e) => Err(RunError::always_retryable(format!("run function panicked: {e}"))),
                    });
                }
                _ = lost.cancelled() => {
                    handle.abort();
                    let _ = (&mut handle).await;
                    return None;
                }
                _ = progress.tick() => {
                    info!(
                        item_id = %item.id,
                        kind = %item.data.kind,
                        elapsed_s = started.elapsed().as_secs(),
                        "item still running"
                    );
                }
            }
        }
    }

    async fn promote(&self, shard: &QueueShard, item: &QueueItem) -> Result<RunResult, RunError> {
        let Some(payload) = item.data.promote_payload() else {
            return Err(RunError::permanent("invalid promote payload"));
        };
        match shard.promote_item(&payload.promote_job_id, self.now_ms()).await {
            Ok(promoted) => {
                trace!(target_id = %payload.promote_job_id, promoted, "promote job ran");
                Ok(RunResult::default())
            }
            Err(e) => Err(RunError::retryable(format!("could not promote item: {e}"))),
        }
    }

    fn requeue_params(&self, item: &QueueItem, now: i64, at: i64) -> RequeueParams {
        let key_queues = !item.is_system()
            && self
                .opts
                .key_queues_enabled(item.data.identifier.account_id, item.function_id);
        RequeueParams {
            now_ms: now,
            at_ms: at,
            key_queues,
            constraints: self.opts.constraints_for_item(item),
        }
    }

    async fn settle_dequeue(&self, shard: &QueueShard, item: &QueueItem, now: i64) -> Result<(), QueueError> {
        match shard.dequeue(item, now, self.opts.idempotency_ttl_ms(item)).await {
            Ok(()) => {
                if let Some(m) = &self.opts.metrics {
                    m.record_dequeue(shard.name());
                }
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Return the worker slot and let go of the capacity lease.
    fn finish(&self, permit: OwnedSemaphorePermit, item: &QueueItem, capacity_lease: Option<CapacityLease>) {
        drop(permit);
        let (Some(api), Some(lease)) = (self.opts.constraint_api.clone(), capacity_lease) else {
            return;
        };
        let account_id = item.data.identifier.account_id;
        let item_id = item.id.clone();
        tokio::spawn(async move {
            if let Err(e) = api.release(account_id, lease.lease_id).await {
                debug!(item_id = %item_id, error = %e, "could not release capacity lease");
            }
        });
    }

    fn spawn_lease_extender(
        &self,
        shard: &QueueShard,
        item: &QueueItem,
        lease_id: LeaseId,
        disable_constraint_updates: bool,
        lost: &CancellationToken,
        done: &CancellationToken,
    ) {
        let shard = shard.clone();
        let item = item.clone();
        let clock = self.opts.clock.clone();
        let lease_ms = self.opts.settings.item_lease_ms as i64;
        let period = Duration::from_millis((self.opts.settings.item_lease_ms / 2).max(1));
        let (lost, done) = (lost.clone(), done.clone());
        tokio::spawn(async move {
            let mut current = lease_id;
            let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = done.cancelled() => return,
                    _ = tick.tick() => {}
                }
                match shard
                    .extend_lease(&item, current, lease_ms, clock.now_ms(), disable_constraint_updates)
                    .await
                {
                    Ok(next) => current = next,
                    // settled elsewhere
                    Err(e) if e.is_not_found() => return,
                    Err(e) => {
                        warn!(item_id = %item.id, error = %e, "could not extend item lease");
                        lost.cancel();
                        return;
                    }
                }
            }
        });
    }

    fn spawn_capacity_extender(&self, item: &QueueItem, lease_id: LeaseId, lost: &CancellationToken, done: &CancellationToken) {
        let Some(api) = self.opts.constraint_api.clone() else {
            return;
        };
        let clock = self.opts.clock.clone();
        let account_id = item.data.identifier.account_id;
        let item_id = item.id.clone();
        let interval_ms = self.opts.capacity_lease_extend_interval_ms.max(1);
        let lease_ms = self.opts.settings.item_lease_ms as i64;
        let period = Duration::from_millis(interval_ms as u64);
        let (lost, done) = (lost.clone(), done.clone());
        tokio::spawn(async move {
            let mut current = lease_id;
            let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = done.cancelled() => return,
                    _ = tick.tick() => {}
                }
                match api.extend_lease(account_id, current, lease_ms, clock.now_ms()).await {
                    Ok(Some(next)) => current = next,
                    Ok(None) => {
                        warn!(item_id = %item_id, "capacity lease gone");
                        lost.cancel();
                        return;
                    }
                    Err(e) => {
                        warn!(item_id = %item_id, error = %e, "could not extend capacity lease");
                        lost.cancel();
                        return;
                    }
                }
            }
        });
    }
}
