use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use runq::error::RunError;
use runq::factory::ShardRegistry;
use runq::item::{Identifier, Item, KIND_EDGE};
use runq::processor::{run_fn, EnqueueOpts, QueueOptions, QueueProcessor, RunResult};
use runq::queue_shard::QueueShard;
use runq::settings::{QueueSettings, RunMode};
use runq::store::Store;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn open_processor(num_workers: usize) -> Arc<QueueProcessor> {
    let shard = QueueShard::new("bench", "memory", Store::memory(), "bench");
    let settings = QueueSettings {
        num_workers,
        ..Default::default()
    };
    let run_mode = RunMode {
        account: false,
        account_shadow_partition: false,
        ..Default::default()
    };
    let opts = QueueOptions::new(settings).with_run_mode(run_mode);
    QueueProcessor::new(ShardRegistry::single(shard), opts)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn item(function: usize, n: usize) -> Item {
    let account_id = Uuid::from_u128(0xacc);
    let env_id = Uuid::from_u128(0xe);
    Item {
        job_id: Some(format!("{function}-{n}")),
        group_id: format!("g-{n}"),
        workspace_id: env_id,
        kind: KIND_EDGE.to_string(),
        identifier: Identifier {
            workflow_id: Uuid::from_u128(0xf000 + function as u128),
            workflow_version: 1,
            account_id,
            env_id,
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn measure_enqueue_throughput(num_producers: usize, items_per_producer: usize, functions: usize) -> f64 {
    let processor = open_processor(10);
    let at = now_ms();
    let start = Instant::now();

    let mut handles = vec![];
    for producer in 0..num_producers {
        let processor = Arc::clone(&processor);
        handles.push(tokio::spawn(async move {
            for i in 0..items_per_producer {
                let n = producer * items_per_producer + i;
                processor
                    .enqueue(item(n % functions, n), at, EnqueueOpts::default())
                    .await
                    .expect("enqueue");
            }
        }));
    }
    for handle in handles {
        handle.await.expect("producer task");
    }

    (num_producers * items_per_producer) as f64 / start.elapsed().as_secs_f64()
}

async fn measure_process_throughput(num_workers: usize, total: usize, functions: usize) -> f64 {
    let processor = open_processor(num_workers);
    let at = now_ms();
    for n in 0..total {
        processor
            .enqueue(item(n % functions, n), at, EnqueueOpts::default())
            .await
            .expect("enqueue");
    }

    let processed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&processed);
    let f = run_fn(move |_info, _item| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok::<_, RunError>(RunResult::default())
        }
    });

    let cancel = CancellationToken::new();
    let start = Instant::now();
    let runner = {
        let processor = Arc::clone(&processor);
        let cancel = cancel.clone();
        tokio::spawn(async move { processor.run(cancel, f).await })
    };
    while processed.load(Ordering::Relaxed) < total {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let elapsed = start.elapsed();
    cancel.cancel();
    runner.await.expect("runner task").expect("processor");

    total as f64 / elapsed.as_secs_f64()
}

#[tokio::main]
async fn main() {
    println!("\n========================================");
    println!("Queue Throughput Benchmark");
    println!("========================================\n");

    println!("--- Enqueue Throughput ---");
    let enq_1p = measure_enqueue_throughput(1, 2_000, 10).await;
    println!("  1 producer  x 2000 items: {:.0} items/sec", enq_1p);

    let enq_8p = measure_enqueue_throughput(8, 500, 10).await;
    println!(
        "  8 producers x 500  items: {:.0} items/sec ({:.2}x)\n",
        enq_8p,
        enq_8p / enq_1p
    );

    println!("--- Process Throughput ---");
    let one_fn = measure_process_throughput(100, 2_000, 1).await;
    println!("  1 function,   100 workers: {:.0} items/sec", one_fn);

    let many_fns = measure_process_throughput(100, 2_000, 50).await;
    println!(
        "  50 functions, 100 workers: {:.0} items/sec ({:.2}x)\n",
        many_fns,
        many_fns / one_fn
    );
}
