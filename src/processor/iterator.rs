//! Leasing the peeked items of one partition.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::join_all;
use tracing::{debug, trace, warn};

use crate::backlog::{item_backlog, item_shadow_partition};
use crate::constraints::{CapacityRequest, ConstraintApi, QueueConstraint};
use crate::error::QueueError;
use crate::item::{CapacityLease, QueueItem};
use crate::partition::{PartitionConstraintConfig, QueuePartition};
use crate::processor::worker::WorkMessage;
use crate::processor::QueueProcessor;
use crate::queue_shard::{LeaseParams, QueueShard};

/// Outcome counters of one iterator run. Updated from parallel tasks.
#[derive(Debug)]
pub struct IteratorCounters {
    success: AtomicUsize,
    concurrency: AtomicUsize,
    rate_limit: AtomicUsize,
    custom_key: AtomicUsize,
    custom_key_only: AtomicBool,
}

impl Default for IteratorCounters {
    fn default() -> Self {
        Self {
            success: AtomicUsize::new(0),
            concurrency: AtomicUsize::new(0),
            rate_limit: AtomicUsize::new(0),
            custom_key: AtomicUsize::new(0),
            custom_key_only: AtomicBool::new(true),
        }
    }
}

impl IteratorCounters {
    pub fn success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
    }

    /// A function, account or system limit.
    pub fn scope_limit(&self) {
        self.concurrency.fetch_add(1, Ordering::Relaxed);
        self.custom_key_only.store(false, Ordering::Relaxed);
    }

    pub fn custom_key_limit(&self) {
        self.concurrency.fetch_add(1, Ordering::Relaxed);
        self.custom_key.fetch_add(1, Ordering::Relaxed);
    }

    pub fn throttled(&self) {
        self.rate_limit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IteratorStats {
        IteratorStats {
            success: self.success.load(Ordering::Relaxed),
            concurrency: self.concurrency.load(Ordering::Relaxed),
            rate_limit: self.rate_limit.load(Ordering::Relaxed),
            custom_key: self.custom_key.load(Ordering::Relaxed),
            custom_key_only: self.custom_key_only.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IteratorStats {
    pub success: usize,
    /// Includes custom key hits
    pub concurrency: usize,
    pub rate_limit: usize,
    pub custom_key: usize,
    custom_key_only: bool,
}

impl IteratorStats {
    /// Items that reached a verdict.
    pub fn considered(&self) -> usize {
        self.success + self.concurrency + self.rate_limit
    }

    /// Only custom keys limited this run.
    pub fn custom_key_limit_only(&self) -> bool {
        self.custom_key > 0 && self.custom_key_only
    }
}

pub(crate) struct ProcessorIterator<'a> {
    pub processor: &'a QueueProcessor,
    pub shard: &'a QueueShard,
    pub partition: &'a QueuePartition,
    pub constraints: PartitionConstraintConfig,
    /// One time for every check in the run
    pub static_time: i64,
    pub parallel: bool,
    pub continuation_count: u32,
    pub priority: u32,
    pub counters: IteratorCounters,
    denied: Mutex<HashSet<String>>,
}

impl<'a> ProcessorIterator<'a> {
    pub fn new(
        processor: &'a QueueProcessor,
        shard: &'a QueueShard,
        partition: &'a QueuePartition,
        constraints: PartitionConstraintConfig,
        static_time: i64,
    ) -> Self {
        Self {
            processor,
            shard,
            partition,
            constraints,
            static_time,
            parallel: false,
            continuation_count: 0,
            priority: 0,
            counters: IteratorCounters::default(),
            denied: Mutex::new(HashSet::new()),
        }
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn continuation_count(mut self, count: u32) -> Self {
        self.continuation_count = count;
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    fn is_denied(&self, key: &str) -> bool {
        self.denied.lock().unwrap().contains(key)
    }

    fn deny(&self, key: String) {
        self.denied.lock().unwrap().insert(key);
    }

    /// Lease `items` in order, stopping at the first scope limit or when
    /// workers run out. Parallel runs visit every item.
    pub async fn run(&self, items: &[QueueItem]) -> IteratorStats {
        if self.parallel {
            let results = join_all(items.iter().map(|item| self.process(item))).await;
            for r in results {
                if let Err(e) = r {
                    trace!(error = %e, "parallel item stopped");
                }
            }
        } else {
            for item in items {
                match self.process(item).await {
                    Ok(()) => {}
                    Err(QueueError::ProcessNoCapacity) => {
                        debug!(partition_id = %self.partition.id, "no worker capacity left");
                        break;
                    }
                    Err(e) => {
                        trace!(partition_id = %self.partition.id, error = %e, "iterator stopped");
                        break;
                    }
                }
            }
        }
        self.counters.snapshot()
    }

    async fn process(&self, item: &QueueItem) -> Result<(), QueueError> {
        let now = self.static_time;
        if item.is_leased(now) {
            self.counters.success();
            return Ok(());
        }
        if let Some(t) = &item.data.throttle {
            if self.is_denied(&t.key) {
                self.counters.throttled();
                return Ok(());
            }
        }
        if item.data.concurrency_keys().iter().any(|k| self.is_denied(&k.key)) {
            self.counters.custom_key_limit();
            return Ok(());
        }

        let Some(permit) = self.processor.sem.try_acquire() else {
            return Err(QueueError::ProcessNoCapacity);
        };

        let opts = &self.processor.opts;
        let mut capacity_lease = None;
        let mut disable_constraint_updates = false;
        if let Some(granted) = item.capacity_lease.clone() {
            // granted during the backlog refill
            capacity_lease = Some(granted);
            disable_constraint_updates = true;
        } else if let Some(api) = opts.constraint_api.as_deref().filter(|_| !item.is_system()) {
            match self.capacity_check(api, item).await {
                Ok((lease, skip)) => {
                    capacity_lease = Some(lease);
                    disable_constraint_updates = skip;
                }
                Err(e) => return self.handle_error(e, item),
            }
        }

        let params = LeaseParams {
            now_ms: now,
            duration_ms: opts.settings.item_lease_ms as i64,
            backlog: item_backlog(item),
            shadow: item_shadow_partition(item, &self.constraints),
            constraints: self.constraints.clone(),
            disable_constraint_checks: disable_constraint_updates,
            capacity_lease: capacity_lease.clone(),
        };
        match self.shard.lease(item, &params).await {
            Ok(lease_id) => {
                if let Some(m) = &opts.metrics {
                    m.record_lease(self.shard.name(), &self.partition.id);
                }
                let mut leased = item.clone();
                leased.lease_id = Some(lease_id);
                leased.capacity_lease = capacity_lease.clone();
                self.processor
                    .dispatch(WorkMessage {
                        shard: self.shard.clone(),
                        partition: self.partition.clone(),
                        item: leased,
                        lease_id,
                        continuation_count: self.continuation_count,
                        capacity_lease,
                        disable_constraint_updates,
                        priority: self.priority,
                        permit,
                    })
                    .await?;
                self.counters.success();
                Ok(())
            }
            Err(e) => {
                if let (Some(api), Some(lease)) = (opts.constraint_api.as_deref(), capacity_lease) {
                    if let Err(re) = api.release(item.data.identifier.account_id, lease.lease_id).await {
                        debug!(item_id = %item.id, error = %re, "could not release capacity lease");
                    }
                }
                self.handle_error(e, item)
            }
        }
    }

    /// Ask the constraint service for capacity. A refusal is mapped onto the
    /// local limit errors.
    async fn capacity_check(&self, api: &dyn ConstraintApi, item: &QueueItem) -> Result<(CapacityLease, bool), QueueError> {
        let id = &item.data.identifier;
        let keys = item.data.concurrency_keys();
        let req = CapacityRequest {
            account_id: id.account_id,
            env_id: id.env_id,
            function_id: Some(item.function_id),
            constraints: self.constraints.clone(),
            item_ids: vec![item.id.clone()],
            throttle_key: item.data.throttle.as_ref().map(|t| t.key.clone()),
            custom_keys: keys.iter().map(|k| k.key.clone()).collect(),
            now_ms: self.static_time,
            lease_duration_ms: self.processor.opts.settings.item_lease_ms as i64,
        };
        let resp = api.item_lease_constraint_check(&req).await?;
        if let Some(lease_id) = resp.lease_for(&item.id) {
            return Ok((CapacityLease { lease_id }, resp.skip_constraint_checks));
        }

        let custom = |n: usize| {
            let key = keys.get(n).map(|k| k.key.clone()).unwrap_or_default();
            QueueError::CustomKeyConcurrencyLimit(key)
        };
        Err(match resp.limiting_constraints.first() {
            Some(QueueConstraint::AccountConcurrency) => QueueError::AccountConcurrencyLimit,
            Some(QueueConstraint::CustomConcurrencyKey1) => custom(0),
            Some(QueueConstraint::CustomConcurrencyKey2) => custom(1),
            Some(QueueConstraint::Throttle) => QueueError::Throttled {
                key: item.data.throttle.as_ref().map(|t| t.key.clone()).unwrap_or_default(),
                retry_at_ms: self.static_time + resp.retry_after_ms,
            },
            _ => QueueError::PartitionConcurrencyLimit,
        })
    }

    fn handle_error(&self, err: QueueError, item: &QueueItem) -> Result<(), QueueError> {
        let listeners = &self.processor.opts.listeners;
        match err {
            QueueError::Throttled { key, retry_at_ms } => {
                trace!(item_id = %item.id, key = %key, retry_at_ms, "item throttled");
                self.deny(key);
                self.counters.throttled();
                Ok(())
            }
            e if e.is_scope_concurrency_limit() => {
                self.counters.scope_limit();
                match e {
                    QueueError::PartitionConcurrencyLimit => {
                        if let Some(fid) = self.partition.function_id {
                            listeners.iter().for_each(|l| l.on_fn_concurrency_limit_reached(fid));
                        }
                    }
                    QueueError::AccountConcurrencyLimit => {
                        let env = Some(self.partition.env_id).filter(|e| !e.is_nil());
                        listeners
                            .iter()
                            .for_each(|l| l.on_account_concurrency_limit_reached(self.partition.account_id, env));
                    }
                    _ => {}
                }
                if self.parallel {
                    Ok(())
                } else {
                    Err(QueueError::ProcessStopIterator)
                }
            }
            QueueError::CustomKeyConcurrencyLimit(key) => {
                listeners.iter().for_each(|l| l.on_custom_key_concurrency_limit_reached(&key));
                self.deny(key);
                self.counters.custom_key_limit();
                Ok(())
            }
            QueueError::QueueItemAlreadyLeased => {
                self.counters.success();
                Ok(())
            }
            e if e.is_not_found() => {
                self.counters.success();
                Ok(())
            }
            e => {
                warn!(partition_id = %self.partition.id, item_id = %item.id, error = %e, "error leasing item");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_limit_clears_custom_key_only() {
        let c = IteratorCounters::default();
        c.custom_key_limit();
        assert!(c.snapshot().custom_key_limit_only());
        c.scope_limit();
        let s = c.snapshot();
        assert!(!s.custom_key_limit_only());
        assert_eq!(s.concurrency, 2);
        assert_eq!(s.custom_key, 1);
    }

    #[test]
    fn no_hits_is_not_custom_key_only() {
        let c = IteratorCounters::default();
        c.success();
        assert!(!c.snapshot().custom_key_limit_only());
    }

    #[test]
    fn counters_add_up_across_threads() {
        let c = std::sync::Arc::new(IteratorCounters::default());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let c = c.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        match i % 3 {
                            0 => c.success(),
                            1 => c.throttled(),
                            _ => c.custom_key_limit(),
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(c.snapshot().considered(), 800);
    }
}
