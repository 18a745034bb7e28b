#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use runq::clock::FakeClock;
use runq::error::RunError;
use runq::factory::ShardRegistry;
use runq::item::{Identifier, Item, QueueItem, KIND_EDGE};
use runq::processor::{run_fn, QueueOptions, QueueProcessor, RunFn, RunResult};
use runq::queue_shard::QueueShard;
use runq::settings::{QueueSettings, RunMode};
use runq::store::Store;
use uuid::Uuid;

// Helper: enforce a tight timeout for async tests likely to hang
#[macro_export]
macro_rules! with_timeout {
    ($ms:expr, $body:block) => {{
        tokio::time::timeout(std::time::Duration::from_millis($ms), async move { $body })
            .await
            .expect("test timed out")
    }};
}

/// 2024-05-01T10:03:00Z, on a whole second.
pub const T0: i64 = 1_714_557_780_000;

pub const ACCOUNT: Uuid = Uuid::from_u128(0xa1);
pub const ENV: Uuid = Uuid::from_u128(0xe1);

/// A processor over one fresh shard, driven by a fake clock.
pub struct TestQueue {
    pub clock: FakeClock,
    pub store: Store,
    pub processor: Arc<QueueProcessor>,
}

impl TestQueue {
    pub fn shard(&self) -> &QueueShard {
        self.processor.primary()
    }

    pub fn now(&self) -> i64 {
        use runq::clock::Clock;
        self.clock.now_ms()
    }

    /// Run every dispatched item through `f`. Returns how many ran.
    pub async fn run_dispatched(&self, f: &RunFn) -> usize {
        let mut n = 0;
        while self.processor.work_once(f).await.expect("work_once") {
            n += 1;
        }
        n
    }
}

pub fn test_settings() -> QueueSettings {
    QueueSettings {
        num_workers: 10,
        num_shadow_workers: 2,
        num_normalization_workers: 2,
        ..Default::default()
    }
}

/// Run mode without random account sampling or continuation skips.
pub fn test_run_mode() -> RunMode {
    RunMode {
        account: false,
        account_shadow_partition: false,
        shadow_continuation_skip_probability: 0.0,
        ..Default::default()
    }
}

pub fn open_test_queue() -> TestQueue {
    open_test_queue_with(|o| o)
}

/// Like [`open_test_queue`], letting the caller adjust the options.
pub fn open_test_queue_with(f: impl FnOnce(QueueOptions) -> QueueOptions) -> TestQueue {
    let clock = FakeClock::new(T0);
    let store = Store::memory();
    let shard = QueueShard::new("test", "memory", store.clone(), "q");
    let mut settings = test_settings();
    settings.continuation_skip_probability = 0.0;
    let opts = QueueOptions::new(settings)
        .with_run_mode(test_run_mode())
        .with_clock(Arc::new(clock.clone()));
    let processor = QueueProcessor::new(ShardRegistry::single(shard), f(opts));
    TestQueue {
        clock,
        store,
        processor,
    }
}

pub fn function_id(n: u128) -> Uuid {
    Uuid::from_u128(0xf000 + n)
}

/// An edge item for `fid` with an idempotency job id.
pub fn edge_item(fid: Uuid, job_id: &str) -> Item {
    Item {
        job_id: Some(job_id.to_string()),
        group_id: format!("group-{job_id}"),
        workspace_id: ENV,
        kind: KIND_EDGE.to_string(),
        identifier: Identifier {
            workflow_id: fid,
            workflow_version: 1,
            account_id: ACCOUNT,
            env_id: ENV,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A run function that records job ids in call order and succeeds.
pub fn recording_run_fn() -> (RunFn, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let out = Arc::clone(&seen);
    let f = run_fn(move |info, _item: QueueItem| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().unwrap().push(info.job_id);
            Ok::<_, RunError>(RunResult::default())
        }
    });
    (f, out)
}

/// A run function that always fails with `err`.
pub fn failing_run_fn(err: RunError) -> RunFn {
    run_fn(move |_info, _item| {
        let err = err.clone();
        async move { Err::<RunResult, _>(err) }
    })
}
