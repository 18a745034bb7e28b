//! The partition scan: pick ready partitions, lease them, and lease their items.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use rand::Rng;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, warn, Instrument};

use crate::error::QueueError;
use crate::metrics::SINGLETON_SEQUENTIAL;
use crate::partition::{queue_name_matches, PartitionConstraintConfig, QueuePartition, PRIORITY_MIN};
use crate::processor::iterator::{IteratorStats, ProcessorIterator};
use crate::processor::QueueProcessor;
use crate::queue_shard::{PartitionIndex, ABSOLUTE_PEEK_MAX, PARTITION_PEEK_MAX};

/// Recent hit counts kept per partition.
const PEEK_EWMA_LEN: usize = 10;

/// EWMA value is scaled by this before clamping to the peek range.
const PEEK_EWMA_MULTIPLIER: f64 = 4.0;

/// Matches a moving average over roughly 30 samples.
const EWMA_DECAY: f64 = 2.0 / 31.0;

/// Exponentially weighted moving average of `values`, oldest first.
pub fn ewma(values: &[f64]) -> f64 {
    let mut avg = 0.0;
    for &v in values {
        if avg == 0.0 {
            avg = v;
        } else {
            avg = v * EWMA_DECAY + avg * (1.0 - EWMA_DECAY);
        }
    }
    avg
}

impl QueueProcessor {
    pub(crate) async fn scan_loop(self: Arc<Self>, stop: CancellationToken) {
        let mut tick = tokio::time::interval(self.opts.settings.poll_tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tick.tick() => {}
            }
            if let Err(e) = self.scan_once().await {
                warn!(shard = %self.primary().name(), error = %e, "partition scan failed");
            }
        }
        debug!("partition scan stopped");
    }

    /// One scan pass: continued partitions first, then peeked ones. Returns
    /// the number of partitions processed.
    pub async fn scan_once(&self) -> Result<usize, QueueError> {
        if self.sem.available() < 1 {
            trace!("skipping scan, no free workers");
            return Ok(0);
        }

        let mut processed = self.process_continuations().await?;

        let partitions = self.peek_ready_partitions().await?;
        if partitions.is_empty() {
            return Ok(processed);
        }
        processed += partitions.len();

        if self.holds_singleton(SINGLETON_SEQUENTIAL) {
            for (p, priority) in partitions {
                if let Err(e) = self.process_partition(&p, 0, priority).await {
                    warn!(partition_id = %p.id, error = %e, "error processing partition");
                }
            }
        } else {
            stream::iter(partitions)
                .for_each_concurrent(None, |(p, priority)| async move {
                    if let Err(e) = self.process_partition(&p, 0, priority).await {
                        warn!(partition_id = %p.id, error = %e, "error processing partition");
                    }
                })
                .await;
        }
        Ok(processed)
    }

    async fn process_continuations(&self) -> Result<usize, QueueError> {
        if !self.opts.run_mode.continuations || self.continuations.is_empty() {
            return Ok(0);
        }
        let shard = self.primary();
        let skip = self.opts.settings.continuation_skip_probability;
        let mut processed = 0;
        for (pid, c) in self.continuations.snapshot() {
            if skip > 0.0 && rand::rng().random::<f64>() < skip {
                continue;
            }
            let now = self.now_ms();
            if self.continuations.remove(&pid, false, now) {
                if let Some(m) = &self.opts.metrics {
                    m.record_continuation_removed("partition");
                }
            }
            let Some(p) = shard.partition_by_id(&pid, now).await? else {
                continue;
            };
            let Some(priority) = self.checked_priority(&p) else {
                continue;
            };
            if let Err(e) = self.process_partition(&p, c.count, priority).await {
                warn!(partition_id = %pid, error = %e, "error processing continued partition");
            }
            processed += 1;
        }
        Ok(processed)
    }

    fn checked_priority(&self, p: &QueuePartition) -> Option<u32> {
        let priority = self.opts.priority(p);
        if priority > PRIORITY_MIN {
            let err = QueueError::PriorityTooLow(priority);
            warn!(partition_id = %p.id, error = %err, "skipping partition");
            return None;
        }
        Some(priority)
    }

    /// Partitions ready now, filtered by the allow and deny lists and ordered
    /// by priority.
    async fn peek_ready_partitions(&self) -> Result<Vec<(QueuePartition, u32)>, QueueError> {
        let shard = self.primary();
        let mode = &self.opts.run_mode;
        let now = self.now_ms();
        let sequential = self.holds_singleton(SINGLETON_SEQUENTIAL);

        let by_account = mode.account && (!mode.partition || rand::rng().random_range(0..100) < mode.account_weight);
        let mut partitions = if by_account {
            let accounts = if mode.exclusive_accounts.is_empty() {
                shard.peek_accounts(now, PARTITION_PEEK_MAX, sequential, now).await?
            } else {
                mode.exclusive_accounts.clone()
            };
            let per_account = (PARTITION_PEEK_MAX / accounts.len().max(1)).max(1);
            let mut out = Vec::new();
            for account in accounts {
                out.extend(
                    shard
                        .peek_partitions(PartitionIndex::Account(account), now, per_account, sequential, now)
                        .await?,
                );
            }
            out
        } else if mode.partition {
            shard
                .peek_partitions(PartitionIndex::Global, now, PARTITION_PEEK_MAX, sequential, now)
                .await?
        } else {
            Vec::new()
        };

        let settings = &self.opts.settings;
        if !settings.allow_queues.is_empty() {
            partitions.retain(|p| queue_name_matches(&settings.allow_queues, &p.id));
        }
        if !settings.deny_queues.is_empty() {
            partitions.retain(|p| !queue_name_matches(&settings.deny_queues, &p.id));
        }

        let mut ordered: Vec<(QueuePartition, u32)> = partitions
            .into_iter()
            .filter_map(|p| self.checked_priority(&p).map(|prio| (p, prio)))
            .collect();
        ordered.sort_by_key(|(_, prio)| *prio);
        Ok(ordered)
    }

    /// How many items to peek from `p`.
    pub(crate) fn peek_size(&self, p: &QueuePartition) -> usize {
        let s = &self.opts.settings;
        let (min, max) = (s.peek_min.min(s.peek_max), s.peek_max.max(s.peek_min));
        let size = if let Some(n) = s.peek_size_for_functions.get(&p.id) {
            *n
        } else if s.use_peek_ewma {
            let avg = {
                let hits = self.peek_hits.lock().unwrap();
                hits.get(&p.id)
                    .map(|v| ewma(&v.iter().copied().collect::<Vec<_>>()))
                    .unwrap_or(0.0)
            };
            ((avg * PEEK_EWMA_MULTIPLIER).round() as usize).clamp(min, max)
        } else if max > min {
            rand::rng().random_range(min..=max)
        } else {
            min
        };
        let cap = (self.sem.available() as f64 * 1.1).ceil() as usize;
        size.min(cap).min(ABSOLUTE_PEEK_MAX)
    }

    fn record_peek_hits(&self, partition_id: &str, hits: usize) {
        let avg = {
            let mut all = self.peek_hits.lock().unwrap();
            let window = all.entry(partition_id.to_string()).or_insert_with(VecDeque::new);
            window.push_back(hits as f64);
            while window.len() > PEEK_EWMA_LEN {
                window.pop_front();
            }
            ewma(&window.iter().copied().collect::<Vec<_>>())
        };
        if let Some(m) = &self.opts.metrics {
            m.set_peek_ewma(partition_id, avg);
        }
    }

    fn drop_continuation(&self, partition_id: &str) {
        if self.continuations.remove(partition_id, false, self.now_ms()) {
            if let Some(m) = &self.opts.metrics {
                m.record_continuation_removed("partition");
            }
        }
    }

    /// Lease `p`, lease its ready items and requeue it. Returns the iterator
    /// outcome, or `None` when the partition was skipped.
    pub(crate) async fn process_partition(
        &self,
        p: &QueuePartition,
        continuation_count: u32,
        priority: u32,
    ) -> Result<Option<IteratorStats>, QueueError> {
        let span = debug_span!("process_partition", partition_id = %p.id, continuation_count);
        self.process_partition_inner(p, continuation_count, priority)
            .instrument(span)
            .await
    }

    async fn process_partition_inner(
        &self,
        p: &QueuePartition,
        continuation_count: u32,
        priority: u32,
    ) -> Result<Option<IteratorStats>, QueueError> {
        let shard = self.primary();
        let settings = &self.opts.settings;
        let now = self.now_ms();

        if let Some(fid) = p.function_id {
            if self.opts.paused(fid).is_effective() {
                let at = now + settings.partition_paused_requeue_ms as i64;
                match shard.partition_requeue(&p.id, at, true, now).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
                self.drop_continuation(&p.id);
                debug!(partition_id = %p.id, "partition paused");
                return Ok(None);
            }
        }

        let constraints = match p.function_id {
            Some(fid) if !p.is_system() => self.opts.constraints_for(p.account_id, p.env_id, fid),
            _ => PartitionConstraintConfig::default(),
        };
        // with a constraint service, capacity is checked per item instead
        let lease_constraints = self.opts.constraint_api.is_none().then_some(&constraints);

        let partition = match shard
            .partition_lease(&p.id, settings.partition_lease_ms as i64, now, lease_constraints)
            .await
        {
            Ok((_, leased)) => leased,
            Err(QueueError::PartitionAlreadyLeased) => {
                if let Some(m) = &self.opts.metrics {
                    m.record_partition_contention(shard.name());
                }
                self.drop_continuation(&p.id);
                return Ok(None);
            }
            Err(e) if e.is_not_found() || matches!(e, QueueError::PartitionPaused) => {
                trace!(partition_id = %p.id, error = %e, "partition skipped");
                self.drop_continuation(&p.id);
                return Ok(None);
            }
            Err(e) if e.is_scope_concurrency_limit() => {
                let at = now + settings.partition_concurrency_requeue_ms as i64;
                match shard.partition_requeue(&p.id, at, true, now).await {
                    Ok(()) => {}
                    Err(re) if re.is_not_found() => {}
                    Err(re) => return Err(re),
                }
                self.notify_scope_limit(p, &e);
                if let Some(m) = &self.opts.metrics {
                    m.record_partition_constraint(shard.name(), concurrency_label(&e));
                }
                self.drop_continuation(&p.id);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let until = now - now.rem_euclid(1_000) + settings.partition_lookahead_ms as i64;
        let peek = self.peek_size(&partition);
        let parallel = self.opts.fifo_disabled(&partition);

        let mut random_offset = false;
        let stats = loop {
            let items = shard.peek_items(&partition.id, until, peek, random_offset, now).await?;
            let iter = ProcessorIterator::new(self, shard, &partition, constraints.clone(), now)
                .parallel(parallel)
                .continuation_count(continuation_count)
                .priority(priority);
            let stats = iter.run(&items).await;
            trace!(
                partition_id = %partition.id,
                peeked = items.len(),
                success = stats.success,
                concurrency = stats.concurrency,
                rate_limit = stats.rate_limit,
                "partition items processed"
            );
            // a random page may find keys with room left
            if stats.custom_key_limit_only() && parallel && !random_offset {
                random_offset = true;
                continue;
            }
            break stats;
        };

        if let Some(m) = &self.opts.metrics {
            m.record_iterator_leased(shard.name(), stats.success as u64);
            m.record_iterator_hits(shard.name(), "concurrency", stats.concurrency as u64);
            m.record_iterator_hits(shard.name(), "throttle", stats.rate_limit as u64);
            m.record_iterator_hits(shard.name(), "custom_key", stats.custom_key as u64);
        }

        let (at, force, reason) = if stats.concurrency > 0 {
            (now + settings.partition_concurrency_requeue_ms as i64, true, "concurrency")
        } else if stats.rate_limit > 0 {
            (now + settings.partition_throttle_requeue_ms as i64, true, "throttle")
        } else {
            (now + settings.partition_requeue_extension_ms as i64, false, "default")
        };
        match shard.partition_requeue(&partition.id, at, force, now).await {
            Ok(()) => {
                if let Some(m) = &self.opts.metrics {
                    m.record_requeue(shard.name(), reason);
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        if settings.use_peek_ewma {
            self.record_peek_hits(&partition.id, stats.concurrency + stats.rate_limit);
        }
        Ok(Some(stats))
    }

    fn notify_scope_limit(&self, p: &QueuePartition, err: &QueueError) {
        for l in &self.opts.listeners {
            match err {
                QueueError::PartitionConcurrencyLimit => {
                    if let Some(fid) = p.function_id {
                        l.on_fn_concurrency_limit_reached(fid);
                    }
                }
                QueueError::AccountConcurrencyLimit => {
                    l.on_account_concurrency_limit_reached(p.account_id, Some(p.env_id).filter(|e| !e.is_nil()));
                }
                _ => {}
            }
        }
    }
}

fn concurrency_label(err: &QueueError) -> &'static str {
    match err {
        QueueError::AccountConcurrencyLimit => "account_concurrency",
        QueueError::SystemConcurrencyLimit => "system_concurrency",
        _ => "function_concurrency",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_of_nothing_is_zero() {
        assert_eq!(ewma(&[]), 0.0);
        assert_eq!(ewma(&[0.0, 0.0]), 0.0);
    }

    #[test]
    fn ewma_starts_at_first_value_and_moves_slowly() {
        assert_eq!(ewma(&[10.0]), 10.0);
        let v = ewma(&[10.0, 20.0]);
        assert!(v > 10.0 && v < 12.0, "{v}");
    }
}
