use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use runq::cron::{CronItem, CronManager};
use runq::error::RunError;
use runq::factory::ShardRegistry;
use runq::item::{QueueItem, KIND_CRON, KIND_CRON_HEALTH_CHECK, KIND_CRON_SYNC};
use runq::metrics::{self, run_metrics_server};
use runq::processor::{run_fn, QueueOptions, QueueProcessor, RunInfo, RunResult};
use runq::settings::AppConfig;
use runq::trace;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[clap(version, about)]
/// Application CLI arguments
struct Args {
    /// whether to be verbose
    #[arg(short = 'v')]
    verbose: bool,

    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = AppConfig::load(args.config.as_deref())?;
    trace::init(cfg.log_format)?;
    if args.verbose {
        info!(config = ?cfg, "loaded configuration");
    }

    let metrics = metrics::init()?;
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let metrics_task = match &cfg.metrics.addr {
        Some(addr) => {
            let addr: SocketAddr = addr.parse()?;
            let rx = shutdown_tx.subscribe();
            let m = metrics.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = run_metrics_server(addr, m, rx).await {
                    error!(error = %e, "metrics server failed");
                }
            }))
        }
        None => None,
    };

    let shards = ShardRegistry::open(&cfg.shards)?;
    for shard in shards.sorted() {
        info!(shard = %shard.name(), kind = %shard.kind(), "opened queue shard");
    }

    let opts = QueueOptions::new(cfg.queue.clone())
        .with_run_mode(cfg.run_mode.clone())
        .with_metrics(metrics);
    let processor = QueueProcessor::new(shards, opts);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    let cron = processor.cron().clone();
    let handler = run_fn(move |info, item| {
        let cron = cron.clone();
        async move { handle_item(&cron, info, item).await }
    });
    let result = processor.run(cancel, handler).await;

    let _ = shutdown_tx.send(());
    if let Some(task) = metrics_task {
        let _ = task.await;
    }
    trace::shutdown();
    result.map_err(Into::into)
}

/// Built-in handling for the cron system queues. Anything else has no
/// executor attached to this binary and is dropped after logging.
async fn handle_item(cron: &CronManager, info: RunInfo, item: QueueItem) -> Result<RunResult, RunError> {
    let kind = item.data.kind.as_str();
    match kind {
        KIND_CRON_SYNC => {
            let ci = cron_payload(&item)?;
            cron.update_schedule(&ci)
                .await
                .map_err(|e| RunError::retryable(e.to_string()))?;
        }
        KIND_CRON => {
            let ci = cron_payload(&item)?;
            let runnable = cron.can_run(&ci).await.map_err(|e| RunError::retryable(e.to_string()))?;
            if runnable {
                info!(function_id = %ci.function_id, expression = %ci.expression, "cron fired");
                cron.update_schedule(&ci)
                    .await
                    .map_err(|e| RunError::retryable(e.to_string()))?;
            } else {
                debug!(function_id = %ci.function_id, "stale cron item skipped");
            }
        }
        KIND_CRON_HEALTH_CHECK => {
            cron.enqueue_next_health_check()
                .await
                .map_err(|e| RunError::retryable(e.to_string()))?;
        }
        _ => {
            info!(job_id = %info.job_id, kind, latency_ms = info.latency_ms, "no handler for item, dropping");
        }
    }
    Ok(RunResult::default())
}

fn cron_payload(item: &QueueItem) -> Result<CronItem, RunError> {
    serde_json::from_value(item.data.payload.clone())
        .map_err(|e| RunError::permanent(format!("invalid cron payload: {e}")))
}
