mod test_helpers;

use std::sync::{Arc, Mutex};

use runq::clock::SharedClock;
use runq::error::QueueError;
use runq::migrate::{migrate, MigrateResult};
use runq::partition::PartitionConstraintConfig;
use runq::processor::EnqueueOpts;

use test_helpers::*;

fn shared_clock(q: &TestQueue) -> SharedClock {
    Arc::new(q.clock.clone())
}

#[runq::test]
async fn idle_items_move_to_the_handler() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let fid = function_id(1);
        for job in ["a", "b", "c"] {
            q.processor
                .enqueue(edge_item(fid, job), T0, EnqueueOpts::default())
                .await
                .unwrap();
        }
        q.processor
            .enqueue(edge_item(function_id(2), "other"), T0, EnqueueOpts::default())
            .await
            .unwrap();

        let moved = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&moved);
        let res = migrate(q.shard(), &shared_clock(&q), fid, 2, move |item| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(item.data.job_id.unwrap_or_default());
                Ok(())
            }
        })
        .await
        .expect("migrate");

        assert_eq!(res, MigrateResult { migrated: 3, failed: 0 });
        let mut jobs = moved.lock().unwrap().clone();
        jobs.sort();
        assert_eq!(jobs, vec!["a", "b", "c"]);
        assert_eq!(q.shard().counts(T0).await.unwrap().items, 1);
        // the lock is released afterwards
        assert_eq!(q.shard().migration_lock_until(fid, T0).await.unwrap(), None);
    });
}

#[runq::test]
async fn rejected_items_stay_on_the_source() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let fid = function_id(1);
        let keep = q
            .processor
            .enqueue(edge_item(fid, "keep"), T0, EnqueueOpts::default())
            .await
            .unwrap();
        q.processor
            .enqueue(edge_item(fid, "go"), T0, EnqueueOpts::default())
            .await
            .unwrap();

        let res = migrate(q.shard(), &shared_clock(&q), fid, 1, |item| async move {
            if item.data.job_id.as_deref() == Some("keep") {
                anyhow::bail!("target shard refused the item");
            }
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(res, MigrateResult { migrated: 1, failed: 1 });
        assert!(q.shard().item_by_id(&keep.id, T0).await.unwrap().is_some());
    });
}

#[runq::test]
async fn running_items_are_not_migrated() {
    with_timeout!(5000, {
        let q = open_test_queue_with(|o| {
            o.with_constraint_getter(|_, _, _| {
                let mut c = PartitionConstraintConfig::default();
                c.concurrency.function_concurrency = 1;
                c
            })
        });
        let fid = function_id(1);
        for (n, job) in ["running", "idle"].into_iter().enumerate() {
            q.processor
                .enqueue(edge_item(fid, job), T0 + n as i64, EnqueueOpts::default())
                .await
                .unwrap();
        }
        q.processor.scan_once().await.unwrap();
        let running = q.processor.drain_dispatched().await;
        assert_eq!(running.len(), 1);

        let res = migrate(q.shard(), &shared_clock(&q), fid, 4, |_item| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(res.migrated, 1);
        assert!(q.shard().item_by_id(&running[0].id, T0).await.unwrap().is_some());
    });
}

#[runq::test]
async fn locked_functions_are_neither_migrated_nor_scanned() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let fid = function_id(1);
        q.processor
            .enqueue(edge_item(fid, "a"), T0, EnqueueOpts::default())
            .await
            .unwrap();
        assert!(q
            .shard()
            .lock_function_for_migration(fid, T0 + 60_000, T0)
            .await
            .unwrap());

        let res = migrate(q.shard(), &shared_clock(&q), fid, 1, |_item| async { Ok(()) }).await;
        assert!(matches!(res, Err(QueueError::PartitionPaused)), "{res:?}");

        q.processor.scan_once().await.unwrap();
        assert_eq!(q.processor.pending_work(), 0);
        assert_eq!(q.shard().counts(T0).await.unwrap().items, 1);
    });
}
