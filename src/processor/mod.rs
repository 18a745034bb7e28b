//! In-process scheduling: the loops that pull work out of a queue shard and
//! hand it to a run function.
//!
//! - `scan`: the partition scan and per-partition processing
//! - `iterator`: leasing the items of one partition
//! - `worker`: running leased items and settling them
//! - `shadow_scan`: refilling partitions from shadow backlogs
//! - `normalize_scan`: moving items out of outdated backlogs
//! - `singletons`: sequential, scavenger, instrumentation, active-check and cron loops
//! - `continuation`: in-memory continuation hints
//! - `semaphore`: worker capacity

mod continuation;
mod iterator;
mod normalize_scan;
mod options;
mod scan;
mod semaphore;
mod shadow_scan;
mod singletons;
mod worker;

pub use continuation::{Continuation, ContinuationMap, CONTINUATION_COOLDOWN_MS, CONTINUATION_MAX_PARTITIONS};
pub use iterator::{IteratorCounters, IteratorStats};
pub use options::{
    run_fn, AllowKeyQueues, ConstraintConfigGetter, IdempotencyTtl, NormalizeRefresher, PartitionPriorityFinder,
    PausedGetter, QueueLifecycleListener, QueueOptions, RetainConfiguredKeys, RunFn, RunInfo, RunResult,
    ShadowProcessingCount, ShardSelector, TenantInstrumentor, DEFAULT_CAPACITY_LEASE_EXTEND_INTERVAL_MS,
    DEFAULT_SHADOW_PROCESSING_COUNT,
};
pub use scan::ewma;
pub use semaphore::TrackingSemaphore;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cron::CronManager;
use crate::error::{ProcessorError, QueueError};
use crate::factory::ShardRegistry;
use crate::item::{hash_id, Item, QueueItem, SYSTEM_QUEUE_KINDS};
use crate::queue_shard::{EnqueueParams, QueueShard};
use crate::ulid::LeaseId;
use worker::WorkMessage;

/// Producer options for a single enqueue.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOpts {
    /// Skip the shard selector
    pub force_queue_shard: Option<String>,
    /// The item's job id is already the final item id
    pub passthrough_job_id: bool,
    pub idempotency_period_ms: Option<i64>,
    /// Move the item out of this outdated backlog in the same write
    pub normalize_from_backlog_id: Option<String>,
}

/// Pulls work from the primary shard and runs it.
pub struct QueueProcessor {
    pub(crate) opts: QueueOptions,
    pub(crate) shards: ShardRegistry,
    pub(crate) sem: TrackingSemaphore,
    pub(crate) continuations: ContinuationMap,
    pub(crate) shadow_continuations: ContinuationMap,
    /// Recent concurrency hits per partition, newest last
    pub(crate) peek_hits: Mutex<HashMap<String, VecDeque<f64>>>,
    /// Config leases currently held by this replica, by singleton name
    pub(crate) singleton_leases: Mutex<HashMap<&'static str, LeaseId>>,
    pub(crate) cron: CronManager,
    work_tx: mpsc::Sender<WorkMessage>,
    work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkMessage>>>,
}

impl QueueProcessor {
    pub fn new(shards: ShardRegistry, opts: QueueOptions) -> Arc<Self> {
        let workers = opts.settings.num_workers.max(1);
        let (work_tx, work_rx) = mpsc::channel(workers);
        let cron = CronManager::new(shards.primary().clone(), opts.clock.clone());
        Arc::new(Self {
            sem: TrackingSemaphore::new(workers),
            continuations: ContinuationMap::new(opts.settings.continuation_limit),
            shadow_continuations: ContinuationMap::new(opts.settings.shadow_continuation_limit),
            peek_hits: Mutex::new(HashMap::new()),
            singleton_leases: Mutex::new(HashMap::new()),
            cron,
            work_tx,
            work_rx: Arc::new(tokio::sync::Mutex::new(work_rx)),
            opts,
            shards,
        })
    }

    pub fn primary(&self) -> &QueueShard {
        self.shards.primary()
    }

    pub fn shards(&self) -> &ShardRegistry {
        &self.shards
    }

    pub fn options(&self) -> &QueueOptions {
        &self.opts
    }

    pub fn semaphore(&self) -> &TrackingSemaphore {
        &self.sem
    }

    pub fn continuations(&self) -> &ContinuationMap {
        &self.continuations
    }

    pub fn shadow_continuations(&self) -> &ContinuationMap {
        &self.shadow_continuations
    }

    pub fn cron(&self) -> &CronManager {
        &self.cron
    }

    pub(crate) fn now_ms(&self) -> i64 {
        self.opts.clock.now_ms()
    }

    /// Shard for new work: forced name, then the selector, then the primary.
    pub fn select_shard(&self, account_id: Uuid, queue_name: Option<&str>, force: Option<&str>) -> Result<&QueueShard, QueueError> {
        if let Some(name) = force {
            return self.shards.require(name);
        }
        if let Some(sel) = &self.opts.shard_selector {
            if let Some(name) = sel.select(account_id, queue_name) {
                return self.shards.require(&name);
            }
        }
        Ok(self.shards.primary())
    }

    /// Enqueue `item` to run at `at_ms`.
    pub async fn enqueue(&self, item: Item, at_ms: i64, opts: EnqueueOpts) -> Result<QueueItem, QueueError> {
        let mut item = item;
        if item.queue_name.is_none() {
            if let Some(q) = self.opts.settings.queue_kind_mapping.get(&item.kind) {
                item.queue_name = Some(q.clone());
            } else if SYSTEM_QUEUE_KINDS.contains(&item.kind.as_str()) {
                item.queue_name = Some(item.kind.clone());
            }
        }

        let account_id = item.identifier.account_id;
        let shard = self.select_shard(account_id, item.queue_name.as_deref(), opts.force_queue_shard.as_deref())?;

        let id = match &item.job_id {
            Some(job_id) if opts.passthrough_job_id => job_id.clone(),
            Some(job_id) => hash_id(job_id),
            None => hash_id(&Uuid::new_v4().to_string()),
        };
        let function_id = if item.queue_name.is_some() {
            Uuid::nil()
        } else {
            item.identifier.workflow_id
        };
        let qi = QueueItem {
            id,
            function_id,
            workspace_id: item.workspace_id,
            queue_name: item.queue_name.clone(),
            idempotency_period_ms: opts.idempotency_period_ms,
            data: item,
            ..Default::default()
        };

        let key_queues = !qi.is_system() && self.opts.key_queues_enabled(account_id, function_id);
        let params = EnqueueParams {
            now_ms: self.now_ms(),
            key_queues,
            constraints: self.opts.constraints_for_item(&qi),
            normalize_from_backlog_id: opts.normalize_from_backlog_id,
        };
        let stored = shard.enqueue(qi, at_ms, params).await?;
        if let Some(m) = &self.opts.metrics {
            m.record_enqueue(shard.name(), &stored.data.kind);
        }
        Ok(stored)
    }

    /// Run every loop the run mode enables until `cancel` fires or a loop
    /// asks to quit. In-flight jobs are drained before returning.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken, run_fn: RunFn) -> Result<(), ProcessorError> {
        let (quit_tx, mut quit_rx) = mpsc::unbounded_channel::<ProcessorError>();
        let stop = cancel.child_token();
        let closing = CancellationToken::new();
        let mode = self.opts.run_mode.clone();

        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        for _ in 0..self.sem.capacity() {
            let p = Arc::clone(self);
            let rx = Arc::clone(&self.work_rx);
            let run_fn = run_fn.clone();
            let quit = quit_tx.clone();
            let closing = closing.clone();
            workers.push(tokio::spawn(async move { p.worker_loop(rx, run_fn, quit, closing).await }));
        }

        let mut loops: Vec<JoinHandle<()>> = Vec::new();
        {
            let p = Arc::clone(self);
            let stop = stop.clone();
            loops.push(tokio::spawn(async move { p.scan_loop(stop).await }));
        }
        if mode.shadow_partition {
            let p = Arc::clone(self);
            let stop = stop.clone();
            loops.push(tokio::spawn(async move { p.shadow_scan_loop(stop).await }));
        }
        if mode.normalize_partition {
            let p = Arc::clone(self);
            let stop = stop.clone();
            loops.push(tokio::spawn(async move { p.normalize_loop(stop).await }));
        }
        loops.extend(self.spawn_singletons(&stop, &quit_tx));
        drop(quit_tx);

        info!(shard = %self.primary().name(), workers = self.sem.capacity(), "queue processor started");

        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            Some(err) = quit_rx.recv() => Err(err),
        };
        stop.cancel();

        for l in loops {
            if let Err(e) = l.await {
                warn!(error = %e, "scheduling loop ended abnormally");
            }
        }
        closing.cancel();
        for w in workers {
            if let Err(e) = w.await {
                warn!(error = %e, "worker ended abnormally");
            }
        }
        self.release_singletons().await;

        match &result {
            Ok(()) => info!("queue processor stopped"),
            Err(e) => warn!(error = %e, "queue processor quit"),
        }
        result
    }

    /// Queue a leased item for the worker pool.
    pub(crate) async fn dispatch(&self, msg: WorkMessage) -> Result<(), QueueError> {
        self.work_tx
            .send(msg)
            .await
            .map_err(|_| QueueError::ProcessStopIterator)
    }

    /// Items waiting for a worker.
    pub fn pending_work(&self) -> usize {
        self.work_tx.max_capacity() - self.work_tx.capacity()
    }

    /// Whether this replica holds the named config lease.
    pub fn holds_singleton(&self, name: &str) -> bool {
        let now = self.now_ms();
        self.singleton_leases
            .lock()
            .unwrap()
            .get(name)
            .map(|l| !l.is_expired(now))
            .unwrap_or(false)
    }

    fn report_quit(quit: &mpsc::UnboundedSender<ProcessorError>, err: ProcessorError) {
        debug!(error = %err, "reporting quit");
        let _ = quit.send(err);
    }
}
