//! Prometheus metrics for runq.
//!
//! This module provides:
//! - a cloneable `Metrics` handle owning a Prometheus registry
//! - `record_*` helpers used by the shard scripts and processor loops
//! - an HTTP server for the `/metrics` endpoint
//!
//! Components take `Option<Metrics>`; `None` turns every recording into a no-op.
//!
//! ```ignore
//! let metrics = runq::metrics::init()?;
//! runq::metrics::run_metrics_server(addr, metrics.clone(), shutdown_rx).await;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{
    core::Collector, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use tokio::sync::broadcast;
use tracing::{debug, error};

/// Buckets for store round trips and job processing (seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Queue latencies span a much wider range
const WAIT_TIME_BUCKETS: &[f64] = &[
    0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0,
];

/// Names of the singleton loops that claim config leases.
pub const SINGLETON_SEQUENTIAL: &str = "sequential";
pub const SINGLETON_SCAVENGER: &str = "scavenger";
pub const SINGLETON_INSTRUMENT: &str = "instrument";
pub const SINGLETON_ACTIVE_CHECKER: &str = "active-checker";
pub const SINGLETON_CRON: &str = "cron";

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // items
    items_enqueued: CounterVec,
    items_leased: CounterVec,
    items_processed: CounterVec,
    items_requeued: CounterVec,
    items_dequeued: CounterVec,
    item_latency: HistogramVec,
    item_sojourn: HistogramVec,
    process_duration: HistogramVec,

    // partitions
    partition_lease_contention: CounterVec,
    partition_constraint_hits: CounterVec,
    iterator_hits: CounterVec,
    iterator_leased: CounterVec,

    // singletons
    scavenger_requeues: CounterVec,
    singleton_lease_claims: CounterVec,
    continuation_added: CounterVec,
    continuation_removed: CounterVec,

    // backlogs
    backlog_refills: CounterVec,
    backlog_refilled_items: CounterVec,
    backlog_constraint_hits: CounterVec,
    backlogs_outdated: CounterVec,
    backlogs_normalized: CounterVec,
    items_normalized: CounterVec,
    active_check_removed: CounterVec,

    // gauges
    worker_capacity_in_use: GaugeVec,
    partition_size: GaugeVec,
    shadow_partition_size: GaugeVec,
    peek_ewma: GaugeVec,
    oldest_lease_age: GaugeVec,
    global_partitions: Gauge,
    global_accounts: Gauge,
}

impl Metrics {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_enqueue(&self, shard: &str, kind: &str) {
        self.items_enqueued.with_label_values(&[shard, kind]).inc();
    }

    pub fn record_lease(&self, shard: &str, queue: &str) {
        self.items_leased.with_label_values(&[shard, queue]).inc();
    }

    /// `status` is one of success, retry, failed or panic.
    pub fn record_processed(&self, shard: &str, status: &str, duration_secs: f64) {
        self.items_processed.with_label_values(&[shard, status]).inc();
        self.process_duration
            .with_label_values(&[shard, status])
            .observe(duration_secs);
    }

    pub fn record_requeue(&self, shard: &str, reason: &str) {
        self.items_requeued.with_label_values(&[shard, reason]).inc();
    }

    pub fn record_dequeue(&self, shard: &str) {
        self.items_dequeued.with_label_values(&[shard]).inc();
    }

    /// Latency and sojourn latency of an item at the time it started.
    pub fn record_latency(&self, shard: &str, latency_secs: f64, sojourn_secs: f64) {
        self.item_latency
            .with_label_values(&[shard])
            .observe(latency_secs.max(0.0));
        self.item_sojourn
            .with_label_values(&[shard])
            .observe(sojourn_secs.max(0.0));
    }

    pub fn record_partition_contention(&self, shard: &str) {
        self.partition_lease_contention.with_label_values(&[shard]).inc();
    }

    /// `constraint` is concurrency, throttle or paused.
    pub fn record_partition_constraint(&self, shard: &str, constraint: &str) {
        self.partition_constraint_hits
            .with_label_values(&[shard, constraint])
            .inc();
    }

    /// `kind` is concurrency, throttle or custom_key.
    pub fn record_iterator_hits(&self, shard: &str, kind: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.iterator_hits
            .with_label_values(&[shard, kind])
            .inc_by(count as f64);
    }

    /// Items an iterator run leased, or found already leased.
    pub fn record_iterator_leased(&self, shard: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.iterator_leased.with_label_values(&[shard]).inc_by(count as f64);
    }

    pub fn record_scavenged(&self, shard: &str, count: u64) {
        self.scavenger_requeues
            .with_label_values(&[shard])
            .inc_by(count as f64);
    }

    pub fn record_singleton_claim(&self, singleton: &str) {
        self.singleton_lease_claims.with_label_values(&[singleton]).inc();
    }

    /// `kind` is partition or shadow.
    pub fn record_continuation_added(&self, kind: &str) {
        self.continuation_added.with_label_values(&[kind]).inc();
    }

    pub fn record_continuation_removed(&self, kind: &str) {
        self.continuation_removed.with_label_values(&[kind]).inc();
    }

    pub fn record_backlog_refill(&self, shard: &str, refilled: u64, constraint: &str) {
        self.backlog_refills.with_label_values(&[shard]).inc();
        self.backlog_refilled_items
            .with_label_values(&[shard])
            .inc_by(refilled as f64);
        if constraint != "not_limited" {
            self.backlog_constraint_hits
                .with_label_values(&[shard, constraint])
                .inc();
        }
    }

    pub fn record_backlog_outdated(&self, shard: &str, reason: &str) {
        self.backlogs_outdated.with_label_values(&[shard, reason]).inc();
    }

    pub fn record_backlog_normalized(&self, shard: &str, items: u64) {
        self.backlogs_normalized.with_label_values(&[shard]).inc();
        self.items_normalized
            .with_label_values(&[shard])
            .inc_by(items as f64);
    }

    pub fn record_active_check_removed(&self, shard: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.active_check_removed
            .with_label_values(&[shard])
            .inc_by(count as f64);
    }

    pub fn set_worker_capacity_in_use(&self, kind: &str, in_use: usize) {
        self.worker_capacity_in_use
            .with_label_values(&[kind])
            .set(in_use as f64);
    }

    pub fn set_partition_size(&self, shard: &str, partition_id: &str, size: usize) {
        self.partition_size
            .with_label_values(&[shard, partition_id])
            .set(size as f64);
    }

    pub fn set_shadow_partition_size(&self, shard: &str, partition_id: &str, size: usize) {
        self.shadow_partition_size
            .with_label_values(&[shard, partition_id])
            .set(size as f64);
    }

    pub fn set_peek_ewma(&self, partition_id: &str, value: f64) {
        self.peek_ewma.with_label_values(&[partition_id]).set(value);
    }

    pub fn set_oldest_lease_age(&self, shard: &str, age_secs: f64) {
        self.oldest_lease_age.with_label_values(&[shard]).set(age_secs);
    }

    pub fn set_global_counts(&self, partitions: usize, accounts: usize) {
        self.global_partitions.set(partitions as f64);
        self.global_accounts.set(accounts as f64);
    }
}

/// Register a metric, logging on failure.
fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        // already registered is fine
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> prometheus::Result<CounterVec> {
    Ok(register(registry, CounterVec::new(Opts::new(name, help), labels)?))
}

fn gauge(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> prometheus::Result<GaugeVec> {
    Ok(register(registry, GaugeVec::new(Opts::new(name, help), labels)?))
}

fn histogram(
    registry: &Registry,
    name: &str,
    help: &str,
    buckets: &[f64],
    labels: &[&str],
) -> prometheus::Result<HistogramVec> {
    Ok(register(
        registry,
        HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets.to_vec()), labels)?,
    ))
}

/// Build the registry and every instrument.
pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();
    let r = &registry;

    let items_enqueued = counter(r, "runq_queue_items_enqueued_total", "Items enqueued", &["shard", "kind"])?;
    let items_leased = counter(r, "runq_queue_items_leased_total", "Items leased for processing", &["shard", "queue"])?;
    let items_processed = counter(
        r,
        "runq_queue_items_processed_total",
        "Items processed by a run function, by outcome",
        &["shard", "status"],
    )?;
    let items_requeued = counter(r, "runq_queue_items_requeued_total", "Items requeued", &["shard", "reason"])?;
    let items_dequeued = counter(r, "runq_queue_items_dequeued_total", "Items removed after processing", &["shard"])?;
    let item_latency = histogram(
        r,
        "runq_queue_item_latency_seconds",
        "Delay between an item becoming runnable and starting, excluding sojourn",
        WAIT_TIME_BUCKETS,
        &["shard"],
    )?;
    let item_sojourn = histogram(
        r,
        "runq_queue_item_sojourn_seconds",
        "Delay attributable to concurrency back-pressure",
        WAIT_TIME_BUCKETS,
        &["shard"],
    )?;
    let process_duration = histogram(
        r,
        "runq_queue_process_duration_seconds",
        "Run function duration",
        LATENCY_BUCKETS,
        &["shard", "status"],
    )?;

    let partition_lease_contention = counter(
        r,
        "runq_queue_partition_lease_contention_total",
        "Partition leases lost to another scanner",
        &["shard"],
    )?;
    let partition_constraint_hits = counter(
        r,
        "runq_queue_partition_constraint_hits_total",
        "Partitions requeued because of a constraint",
        &["shard", "constraint"],
    )?;
    let iterator_hits = counter(
        r,
        "runq_queue_iterator_constraint_hits_total",
        "Items the iterator could not lease, by constraint",
        &["shard", "kind"],
    )?;
    let iterator_leased = counter(
        r,
        "runq_queue_iterator_leased_total",
        "Items the iterator leased or found already leased",
        &["shard"],
    )?;

    let scavenger_requeues = counter(
        r,
        "runq_queue_scavenger_requeued_total",
        "Items requeued by the scavenger after their lease expired",
        &["shard"],
    )?;
    let singleton_lease_claims = counter(
        r,
        "runq_queue_singleton_lease_claims_total",
        "Config leases claimed by a singleton loop",
        &["singleton"],
    )?;
    let continuation_added = counter(
        r,
        "runq_queue_continuation_added_total",
        "Continuations added",
        &["kind"],
    )?;
    let continuation_removed = counter(
        r,
        "runq_queue_continuation_removed_total",
        "Continuations removed",
        &["kind"],
    )?;

    let backlog_refills = counter(r, "runq_queue_backlog_refills_total", "Backlog refill passes", &["shard"])?;
    let backlog_refilled_items = counter(
        r,
        "runq_queue_backlog_refilled_items_total",
        "Items moved from backlogs into partitions",
        &["shard"],
    )?;
    let backlog_constraint_hits = counter(
        r,
        "runq_queue_backlog_constraint_hits_total",
        "Refill passes limited by a constraint",
        &["shard", "constraint"],
    )?;
    let backlogs_outdated = counter(
        r,
        "runq_queue_backlogs_outdated_total",
        "Backlogs found outdated against their function's constraints",
        &["shard", "reason"],
    )?;
    let backlogs_normalized = counter(
        r,
        "runq_queue_backlogs_normalized_total",
        "Backlogs fully normalized",
        &["shard"],
    )?;
    let items_normalized = counter(
        r,
        "runq_queue_items_normalized_total",
        "Items moved by normalization",
        &["shard"],
    )?;
    let active_check_removed = counter(
        r,
        "runq_queue_active_check_removed_total",
        "Stale members removed from active and in-progress sets",
        &["shard"],
    )?;

    let worker_capacity_in_use = gauge(
        r,
        "runq_queue_worker_capacity_in_use",
        "Worker permits currently held",
        &["pool"],
    )?;
    let partition_size = gauge(
        r,
        "runq_queue_partition_size",
        "Ready items per partition",
        &["shard", "partition"],
    )?;
    let shadow_partition_size = gauge(
        r,
        "runq_queue_shadow_partition_size",
        "Backlogged items per shadow partition",
        &["shard", "partition"],
    )?;
    let peek_ewma = gauge(r, "runq_queue_peek_ewma", "EWMA of concurrency hit ratio", &["partition"])?;
    let oldest_lease_age = gauge(
        r,
        "runq_queue_oldest_lease_age_seconds",
        "Age of the oldest in-progress lease past its expiry",
        &["shard"],
    )?;
    let global_partitions = register(
        r,
        Gauge::new("runq_queue_global_partitions", "Partitions in the global index")?,
    );
    let global_accounts = register(
        r,
        Gauge::new("runq_queue_global_accounts", "Accounts in the global index")?,
    );

    Ok(Metrics {
        registry: Arc::new(registry),
        items_enqueued,
        items_leased,
        items_processed,
        items_requeued,
        items_dequeued,
        item_latency,
        item_sojourn,
        process_duration,
        partition_lease_contention,
        partition_constraint_hits,
        iterator_hits,
        iterator_leased,
        scavenger_requeues,
        singleton_lease_claims,
        continuation_added,
        continuation_removed,
        backlog_refills,
        backlog_refilled_items,
        backlog_constraint_hits,
        backlogs_outdated,
        backlogs_normalized,
        items_normalized,
        active_check_removed,
        worker_capacity_in_use,
        partition_size,
        shadow_partition_size,
        peek_ewma,
        oldest_lease_age,
        global_partitions,
        global_accounts,
    })
}

/// Axum handler for the `/metrics` endpoint.
async fn metrics_handler(State(metrics): State<Metrics>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain; charset=utf-8")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

/// Serve `/metrics` on `addr` until the shutdown signal fires.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Metrics,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    debug!(addr = %addr, "metrics server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            debug!("metrics server shutting down");
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gathered(m: &Metrics, name: &str) -> Option<prometheus::proto::MetricFamily> {
        m.registry().gather().into_iter().find(|f| f.get_name() == name)
    }

    #[test]
    fn continuation_counters_are_distinct() {
        let m = init().unwrap();
        m.record_continuation_added("partition");
        m.record_continuation_added("partition");
        m.record_continuation_removed("partition");

        let added = gathered(&m, "runq_queue_continuation_added_total").unwrap();
        let removed = gathered(&m, "runq_queue_continuation_removed_total").unwrap();
        assert_eq!(added.get_metric()[0].get_counter().get_value(), 2.0);
        assert_eq!(removed.get_metric()[0].get_counter().get_value(), 1.0);
    }

    #[test]
    fn singleton_claims_are_labelled_per_loop() {
        let m = init().unwrap();
        m.record_singleton_claim(SINGLETON_SEQUENTIAL);
        m.record_singleton_claim(SINGLETON_SCAVENGER);
        m.record_singleton_claim(SINGLETON_SCAVENGER);

        let fam = gathered(&m, "runq_queue_singleton_lease_claims_total").unwrap();
        let scavenger = fam
            .get_metric()
            .iter()
            .find(|m| m.get_label().iter().any(|l| l.get_value() == SINGLETON_SCAVENGER))
            .unwrap();
        assert_eq!(scavenger.get_counter().get_value(), 2.0);
    }
}
