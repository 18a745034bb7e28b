//! Processor configuration: tunables, callbacks and the run function contract.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::backlog::{QueueBacklog, QueueShadowPartition};
use crate::clock::{self, SharedClock};
use crate::constraints::ConstraintApi;
use crate::error::RunError;
use crate::item::{CapacityLease, CustomConcurrency, QueueItem, Throttle};
use crate::metrics::Metrics;
use crate::partition::{PartitionConstraintConfig, PausedInfo, QueuePartition, PRIORITY_DEFAULT};
use crate::queue_shard::BacklogRefillResult;
use crate::retry::{BackoffFn, RetryPolicy};
use crate::settings::{QueueSettings, RunMode};

/// Shadow partitions are continued at most this many times by default.
pub const DEFAULT_SHADOW_PROCESSING_COUNT: u32 = 5;

/// Capacity leases from the constraint service are extended this often.
pub const DEFAULT_CAPACITY_LEASE_EXTEND_INTERVAL_MS: i64 = 5_000;

/// Chooses the shard for new work. `None` means the primary shard.
pub trait ShardSelector: Send + Sync {
    fn select(&self, account_id: Uuid, queue_name: Option<&str>) -> Option<String>;
}

impl<F> ShardSelector for F
where
    F: Fn(Uuid, Option<&str>) -> Option<String> + Send + Sync,
{
    fn select(&self, account_id: Uuid, queue_name: Option<&str>) -> Option<String> {
        self(account_id, queue_name)
    }
}

/// Latest constraints of a function partition.
pub trait ConstraintConfigGetter: Send + Sync {
    fn constraints(&self, account_id: Uuid, env_id: Uuid, function_id: Uuid) -> PartitionConstraintConfig;
}

impl<F> ConstraintConfigGetter for F
where
    F: Fn(Uuid, Uuid, Uuid) -> PartitionConstraintConfig + Send + Sync,
{
    fn constraints(&self, account_id: Uuid, env_id: Uuid, function_id: Uuid) -> PartitionConstraintConfig {
        self(account_id, env_id, function_id)
    }
}

pub trait PausedGetter: Send + Sync {
    fn paused(&self, function_id: Uuid) -> PausedInfo;
}

impl<F> PausedGetter for F
where
    F: Fn(Uuid) -> PausedInfo + Send + Sync,
{
    fn paused(&self, function_id: Uuid) -> PausedInfo {
        self(function_id)
    }
}

/// Whether a function routes its items through shadow backlogs.
pub trait AllowKeyQueues: Send + Sync {
    fn allow(&self, account_id: Uuid, function_id: Uuid) -> bool;
}

impl<F> AllowKeyQueues for F
where
    F: Fn(Uuid, Uuid) -> bool + Send + Sync,
{
    fn allow(&self, account_id: Uuid, function_id: Uuid) -> bool {
        self(account_id, function_id)
    }
}

/// Recomputes an item's constraint keys during normalization. Returning
/// `None` means the source of the item is gone and it should be dropped.
pub trait NormalizeRefresher: Send + Sync {
    fn custom_concurrency_keys(
        &self,
        item: &QueueItem,
        constraints: &PartitionConstraintConfig,
    ) -> Option<Vec<CustomConcurrency>>;

    fn throttle(&self, item: &QueueItem, constraints: &PartitionConstraintConfig) -> Option<Option<Throttle>>;
}

/// Keeps the keys whose expressions are still configured.
pub struct RetainConfiguredKeys;

impl NormalizeRefresher for RetainConfiguredKeys {
    fn custom_concurrency_keys(
        &self,
        item: &QueueItem,
        constraints: &PartitionConstraintConfig,
    ) -> Option<Vec<CustomConcurrency>> {
        Some(
            item.data
                .concurrency_keys()
                .iter()
                .filter(|k| {
                    k.parse_key()
                        .map(|(scope, _, _)| constraints.custom_limit(scope, &k.hash).is_some())
                        .unwrap_or(false)
                })
                .cloned()
                .collect(),
        )
    }

    fn throttle(&self, item: &QueueItem, constraints: &PartitionConstraintConfig) -> Option<Option<Throttle>> {
        let kept = match (&item.data.throttle, &constraints.throttle) {
            (Some(t), Some(c)) if t.key_expression_hash == c.key_expression_hash => Some(t.clone()),
            _ => None,
        };
        Some(kept)
    }
}

/// Priority of a partition in [0, 9]; lower runs first.
pub trait PartitionPriorityFinder: Send + Sync {
    fn priority(&self, partition: &QueuePartition) -> u32;
}

impl<F> PartitionPriorityFinder for F
where
    F: Fn(&QueuePartition) -> u32 + Send + Sync,
{
    fn priority(&self, partition: &QueuePartition) -> u32 {
        self(partition)
    }
}

/// Hook invoked by instrumentation for each partition.
pub type TenantInstrumentor = Arc<dyn Fn(&str) + Send + Sync>;

/// Idempotency window for a dequeued item, in ms.
pub type IdempotencyTtl = Arc<dyn Fn(&QueueItem) -> i64 + Send + Sync>;

/// How many times a shadow partition may be continued.
pub type ShadowProcessingCount = Arc<dyn Fn(&QueueShadowPartition) -> u32 + Send + Sync>;

/// Observes scheduling decisions. Every method defaults to a no-op.
pub trait QueueLifecycleListener: Send + Sync {
    fn on_fn_concurrency_limit_reached(&self, _function_id: Uuid) {}

    fn on_account_concurrency_limit_reached(&self, _account_id: Uuid, _env_id: Option<Uuid>) {}

    fn on_custom_key_concurrency_limit_reached(&self, _key: &str) {}

    fn on_backlog_refill_constraint_hit(
        &self,
        _shadow: &QueueShadowPartition,
        _backlog: &QueueBacklog,
        _result: &BacklogRefillResult,
    ) {
    }

    fn on_backlog_refilled(
        &self,
        _shadow: &QueueShadowPartition,
        _backlog: &QueueBacklog,
        _result: &BacklogRefillResult,
    ) {
    }
}

/// Context handed to the run function.
#[derive(Debug, Clone, Default)]
pub struct RunInfo {
    pub latency_ms: i64,
    pub sojourn_delay_ms: i64,
    pub priority: u32,
    pub queue_shard_name: String,
    pub continue_count: u32,
    pub refilled_from_backlog: Option<String>,
    pub capacity_lease: Option<CapacityLease>,
    pub job_id: String,
    pub group_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunResult {
    /// The step enqueued follow-up work due now; continue the partition.
    pub scheduled_immediate_job: bool,
}

pub type RunFn = Arc<dyn Fn(RunInfo, QueueItem) -> BoxFuture<'static, Result<RunResult, RunError>> + Send + Sync>;

/// Wrap an async closure as a `RunFn`.
pub fn run_fn<F, Fut>(f: F) -> RunFn
where
    F: Fn(RunInfo, QueueItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RunResult, RunError>> + Send + 'static,
{
    Arc::new(move |info, item| Box::pin(f(info, item)))
}

/// Everything a `QueueProcessor` is built from.
#[derive(Clone)]
pub struct QueueOptions {
    pub settings: QueueSettings,
    pub run_mode: RunMode,
    pub clock: SharedClock,
    pub metrics: Option<Metrics>,
    pub backoff: BackoffFn,

    pub shard_selector: Option<Arc<dyn ShardSelector>>,
    pub constraint_getter: Option<Arc<dyn ConstraintConfigGetter>>,
    pub paused_getter: Option<Arc<dyn PausedGetter>>,
    pub allow_key_queues: Option<Arc<dyn AllowKeyQueues>>,
    pub normalize_refresher: Arc<dyn NormalizeRefresher>,
    pub priority_finder: Option<Arc<dyn PartitionPriorityFinder>>,
    pub tenant_instrumentor: Option<TenantInstrumentor>,
    pub idempotency_ttl: Option<IdempotencyTtl>,
    pub shadow_processing_count: Option<ShadowProcessingCount>,
    pub listeners: Vec<Arc<dyn QueueLifecycleListener>>,

    pub constraint_api: Option<Arc<dyn ConstraintApi>>,
    pub capacity_lease_extend_interval_ms: i64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

impl QueueOptions {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            run_mode: RunMode::default(),
            clock: clock::system(),
            metrics: None,
            backoff: RetryPolicy::default().into_backoff_fn(),
            shard_selector: None,
            constraint_getter: None,
            paused_getter: None,
            allow_key_queues: None,
            normalize_refresher: Arc::new(RetainConfiguredKeys),
            priority_finder: None,
            tenant_instrumentor: None,
            idempotency_ttl: None,
            shadow_processing_count: None,
            listeners: Vec::new(),
            constraint_api: None,
            capacity_lease_extend_interval_ms: DEFAULT_CAPACITY_LEASE_EXTEND_INTERVAL_MS,
        }
    }

    pub fn with_run_mode(mut self, run_mode: RunMode) -> Self {
        self.run_mode = run_mode;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffFn) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_shard_selector(mut self, s: impl ShardSelector + 'static) -> Self {
        self.shard_selector = Some(Arc::new(s));
        self
    }

    pub fn with_constraint_getter(mut self, g: impl ConstraintConfigGetter + 'static) -> Self {
        self.constraint_getter = Some(Arc::new(g));
        self
    }

    pub fn with_paused_getter(mut self, g: impl PausedGetter + 'static) -> Self {
        self.paused_getter = Some(Arc::new(g));
        self
    }

    pub fn with_allow_key_queues(mut self, a: impl AllowKeyQueues + 'static) -> Self {
        self.allow_key_queues = Some(Arc::new(a));
        self
    }

    pub fn with_normalize_refresher(mut self, r: impl NormalizeRefresher + 'static) -> Self {
        self.normalize_refresher = Arc::new(r);
        self
    }

    pub fn with_priority_finder(mut self, f: impl PartitionPriorityFinder + 'static) -> Self {
        self.priority_finder = Some(Arc::new(f));
        self
    }

    pub fn with_tenant_instrumentor(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.tenant_instrumentor = Some(Arc::new(f));
        self
    }

    pub fn with_idempotency_ttl(mut self, f: impl Fn(&QueueItem) -> i64 + Send + Sync + 'static) -> Self {
        self.idempotency_ttl = Some(Arc::new(f));
        self
    }

    pub fn with_shadow_processing_count(
        mut self,
        f: impl Fn(&QueueShadowPartition) -> u32 + Send + Sync + 'static,
    ) -> Self {
        self.shadow_processing_count = Some(Arc::new(f));
        self
    }

    pub fn with_listener(mut self, l: impl QueueLifecycleListener + 'static) -> Self {
        self.listeners.push(Arc::new(l));
        self
    }

    pub fn with_constraint_api(mut self, api: Arc<dyn ConstraintApi>) -> Self {
        self.constraint_api = Some(api);
        self
    }

    pub fn with_capacity_lease_extend_interval_ms(mut self, ms: i64) -> Self {
        self.capacity_lease_extend_interval_ms = ms;
        self
    }

    pub(crate) fn constraints_for(&self, account_id: Uuid, env_id: Uuid, function_id: Uuid) -> PartitionConstraintConfig {
        match &self.constraint_getter {
            Some(g) => g.constraints(account_id, env_id, function_id),
            None => PartitionConstraintConfig::default(),
        }
    }

    /// Constraints for the partition an item runs in.
    pub(crate) fn constraints_for_item(&self, item: &QueueItem) -> PartitionConstraintConfig {
        if item.is_system() {
            return PartitionConstraintConfig::default();
        }
        let id = &item.data.identifier;
        self.constraints_for(id.account_id, id.env_id, item.function_id)
    }

    pub(crate) fn key_queues_enabled(&self, account_id: Uuid, function_id: Uuid) -> bool {
        match &self.allow_key_queues {
            Some(a) => a.allow(account_id, function_id),
            None => false,
        }
    }

    pub(crate) fn paused(&self, function_id: Uuid) -> PausedInfo {
        match &self.paused_getter {
            Some(g) => g.paused(function_id),
            None => PausedInfo::default(),
        }
    }

    pub(crate) fn priority(&self, partition: &QueuePartition) -> u32 {
        match &self.priority_finder {
            Some(f) => f.priority(partition),
            None => PRIORITY_DEFAULT,
        }
    }

    pub(crate) fn idempotency_ttl_ms(&self, item: &QueueItem) -> i64 {
        match &self.idempotency_ttl {
            Some(f) => f(item),
            None => self.settings.idempotency_ttl_ms as i64,
        }
    }

    pub(crate) fn shadow_processing_limit(&self, sp: &QueueShadowPartition) -> u32 {
        match &self.shadow_processing_count {
            Some(f) => f(sp),
            None => DEFAULT_SHADOW_PROCESSING_COUNT,
        }
    }

    /// Whether FIFO ordering is switched off for this partition.
    pub(crate) fn fifo_disabled(&self, partition: &QueuePartition) -> bool {
        let s = &self.settings;
        if let Some(fid) = partition.function_id {
            if s.disable_fifo_for_functions.iter().any(|f| *f == fid.to_string()) {
                return true;
            }
        }
        s.disable_fifo_for_accounts
            .iter()
            .any(|a| *a == partition.account_id.to_string())
    }
}
