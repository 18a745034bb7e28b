//! Loops that run on one replica at a time, coordinated by config leases.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{ProcessorError, QueueError};
use crate::metrics::{
    SINGLETON_ACTIVE_CHECKER, SINGLETON_CRON, SINGLETON_INSTRUMENT, SINGLETON_SCAVENGER, SINGLETON_SEQUENTIAL,
};
use crate::processor::QueueProcessor;
use crate::queue_shard::{ACTIVE_CHECK_SCAN_BATCH_SIZE, PARTITION_PEEK_MAX};

/// Chance that an account is checked on an active check pass.
pub const ACTIVE_CHECK_ACCOUNT_PROBABILITY: f64 = 0.1;

/// Partitions scavenged per pass.
pub const SCAVENGE_LIMIT: usize = 100;

/// How often the cron holder makes sure a health check is queued.
const CRON_HEALTH_CHECK_TICK: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Singleton {
    Sequential,
    Scavenger,
    Instrument,
    ActiveChecker,
    Cron,
}

impl Singleton {
    const ALL: [Singleton; 5] = [
        Singleton::Sequential,
        Singleton::Scavenger,
        Singleton::Instrument,
        Singleton::ActiveChecker,
        Singleton::Cron,
    ];

    /// Metric label, also the key in the held lease map.
    fn label(self) -> &'static str {
        match self {
            Singleton::Sequential => SINGLETON_SEQUENTIAL,
            Singleton::Scavenger => SINGLETON_SCAVENGER,
            Singleton::Instrument => SINGLETON_INSTRUMENT,
            Singleton::ActiveChecker => SINGLETON_ACTIVE_CHECKER,
            Singleton::Cron => SINGLETON_CRON,
        }
    }

    /// Name of the config lease in the store.
    fn lease_name(self) -> &'static str {
        match self {
            Singleton::Sequential => "seq",
            Singleton::Scavenger => "scavenger",
            Singleton::Instrument => "instrument",
            Singleton::ActiveChecker => "active-checker",
            Singleton::Cron => "cron",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.label() == label)
    }
}

impl QueueProcessor {
    /// Start the singleton loops the run mode enables.
    pub(crate) fn spawn_singletons(
        self: &Arc<Self>,
        stop: &CancellationToken,
        quit: &mpsc::UnboundedSender<ProcessorError>,
    ) -> Vec<JoinHandle<()>> {
        let mode = &self.opts.run_mode;
        let settings = &self.opts.settings;
        let mut enabled: Vec<(Singleton, Option<Duration>)> = Vec::new();
        if mode.sequential {
            enabled.push((Singleton::Sequential, None));
        }
        if mode.scavenger {
            enabled.push((Singleton::Scavenger, Some(settings.scavenge_tick())));
        }
        if mode.instrumentation {
            enabled.push((Singleton::Instrument, Some(settings.instrument_interval())));
        }
        if mode.active_checker {
            enabled.push((Singleton::ActiveChecker, Some(settings.active_check_tick())));
        }
        if mode.partition {
            enabled.push((Singleton::Cron, Some(CRON_HEALTH_CHECK_TICK)));
        }

        enabled
            .into_iter()
            .map(|(kind, tick)| {
                let p = Arc::clone(self);
                let stop = stop.clone();
                let quit = quit.clone();
                tokio::spawn(async move { p.singleton_loop(kind, tick, stop, quit).await })
            })
            .collect()
    }

    async fn singleton_loop(
        self: Arc<Self>,
        kind: Singleton,
        work_tick: Option<Duration>,
        stop: CancellationToken,
        quit: mpsc::UnboundedSender<ProcessorError>,
    ) {
        let renew = Duration::from_millis((self.opts.settings.config_lease_ms / 3).max(1));
        let mut lease_tick = tokio::time::interval(renew);
        lease_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut work = work_tick.map(|t| {
            let mut i = tokio::time::interval(t);
            i.set_missed_tick_behavior(MissedTickBehavior::Skip);
            i
        });

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = lease_tick.tick() => {
                    if let Err(e) = self.claim_singleton(kind).await {
                        Self::report_quit(&quit, ProcessorError::Queue(e));
                        break;
                    }
                    continue;
                }
                _ = async {
                    match work.as_mut() {
                        Some(i) => { i.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {}
            }
            if !self.holds_singleton(kind.label()) {
                continue;
            }
            let res = match kind {
                Singleton::Sequential => Ok(()),
                Singleton::Scavenger => self.scavenge_once().await.map(|_| ()),
                Singleton::Instrument => self.instrument_once().await.map(|_| ()),
                Singleton::ActiveChecker => self.active_check_once().await.map(|_| ()),
                Singleton::Cron => self.cron.enqueue_next_health_check().await,
            };
            if let Err(e) = res {
                warn!(singleton = kind.label(), error = %e, "singleton pass failed");
            }
        }
        trace!(singleton = kind.label(), "singleton loop stopped");
    }

    /// Claim or renew the lease for `kind`. Contention is not an error.
    async fn claim_singleton(&self, kind: Singleton) -> Result<(), QueueError> {
        let label = kind.label();
        let held = self.singleton_leases.lock().unwrap().get(label).copied();
        let now = self.now_ms();
        let duration = self.opts.settings.config_lease_ms as i64;
        match self
            .primary()
            .config_lease(kind.lease_name(), duration, held, now)
            .await
        {
            Ok(lease) => {
                self.singleton_leases.lock().unwrap().insert(label, lease);
                if held.is_none() {
                    if let Some(m) = &self.opts.metrics {
                        m.record_singleton_claim(label);
                    }
                    debug!(singleton = label, "claimed singleton lease");
                }
                Ok(())
            }
            Err(QueueError::ConfigAlreadyLeased(_)) => {
                if self.singleton_leases.lock().unwrap().remove(label).is_some() {
                    info!(singleton = label, "lost singleton lease");
                }
                Ok(())
            }
            Err(e) => {
                self.singleton_leases.lock().unwrap().remove(label);
                Err(e)
            }
        }
    }

    /// Give every held lease back so another replica can take over at once.
    pub(crate) async fn release_singletons(&self) {
        let held: Vec<_> = self.singleton_leases.lock().unwrap().drain().collect();
        let now = self.now_ms();
        for (label, lease) in held {
            let Some(kind) = Singleton::from_label(label) else {
                continue;
            };
            if let Err(e) = self.primary().release_config_lease(kind.lease_name(), lease, now).await {
                debug!(singleton = label, error = %e, "could not release singleton lease");
            }
        }
    }

    /// Requeue items whose lease expired. Returns the number reclaimed.
    pub async fn scavenge_once(&self) -> Result<usize, QueueError> {
        let shard = self.primary();
        let reclaimed = shard.scavenge(SCAVENGE_LIMIT, self.now_ms()).await?;
        if !reclaimed.is_empty() {
            if let Some(m) = &self.opts.metrics {
                m.record_scavenged(shard.name(), reclaimed.len() as u64);
            }
            info!(shard = %shard.name(), count = reclaimed.len(), "scavenged expired leases");
        }
        Ok(reclaimed.len())
    }

    pub async fn active_check_once(&self) -> Result<usize, QueueError> {
        self.active_check(ACTIVE_CHECK_ACCOUNT_PROBABILITY).await
    }

    /// Remove stale members from active and in-progress sets. Each peeked
    /// account is checked with `account_probability`; flagged backlogs are
    /// always checked. Returns the number of members removed.
    pub async fn active_check(&self, account_probability: f64) -> Result<usize, QueueError> {
        let shard = self.primary();
        let now = self.now_ms();
        let mut removed = 0;

        let accounts = shard
            .peek_accounts(i64::MAX, ACTIVE_CHECK_SCAN_BATCH_SIZE, false, now)
            .await?;
        for account in accounts {
            if rand::rng().random::<f64>() >= account_probability {
                continue;
            }
            removed += shard.active_check_account(account, now).await?;
        }
        for (backlog_id, spid) in shard.peek_active_check_backlogs(ACTIVE_CHECK_SCAN_BATCH_SIZE, now).await? {
            match shard.active_check_backlog(&backlog_id, &spid, now).await {
                Ok(n) => removed += n,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        if removed > 0 {
            if let Some(m) = &self.opts.metrics {
                m.record_active_check_removed(shard.name(), removed as u64);
            }
            debug!(shard = %shard.name(), removed, "active check removed stale members");
        }
        Ok(removed)
    }

    /// Emit gauges for the shard and call the tenant instrumentor for each
    /// partition. Returns the number of partitions visited.
    pub async fn instrument_once(&self) -> Result<usize, QueueError> {
        let shard = self.primary();
        let now = self.now_ms();
        let metrics = self.opts.metrics.as_ref();

        if let Some(m) = metrics {
            let counts = shard.counts(now).await?;
            m.set_global_counts(counts.partitions, counts.accounts);
            m.set_worker_capacity_in_use("worker", self.sem.in_use());
            if let Some(expiry) = shard.earliest_lease_expiry(now).await? {
                let leased_at = expiry - self.opts.settings.item_lease_ms as i64;
                m.set_oldest_lease_age(shard.name(), (now - leased_at).max(0) as f64 / 1_000.0);
            }
        }

        let partitions = shard.partition_ids(i64::MAX, PARTITION_PEEK_MAX, now).await?;
        for pid in &partitions {
            if let Some(m) = metrics {
                let ready = shard.partition_size(pid, now, now).await?;
                m.set_partition_size(shard.name(), pid, ready);
                let backlogged: usize = shard
                    .backlog_sizes(pid, now)
                    .await?
                    .into_iter()
                    .map(|(_, n)| n)
                    .sum();
                m.set_shadow_partition_size(shard.name(), pid, backlogged);
            }
            if let Some(f) = &self.opts.tenant_instrumentor {
                f(pid);
            }
        }
        Ok(partitions.len())
    }
}
