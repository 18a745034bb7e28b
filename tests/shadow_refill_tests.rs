mod test_helpers;

use std::sync::{Arc, Mutex};

use runq::backlog::item_backlog;
use runq::error::QueueError;
use runq::item::{Item, Throttle, KIND_START};
use runq::partition::{PartitionConstraintConfig, ShadowPartitionThrottle};
use runq::processor::EnqueueOpts;
use runq::ulid::Ulid;

use test_helpers::*;

fn key_queue_test_queue() -> TestQueue {
    open_test_queue_with(|o| o.with_allow_key_queues(|_, _| true))
}

#[runq::test]
async fn key_queue_enqueue_lands_in_the_backlog() {
    with_timeout!(5000, {
        let q = key_queue_test_queue();
        let fid = function_id(1);
        let pid = fid.to_string();
        let qi = q
            .processor
            .enqueue(edge_item(fid, "a"), T0, EnqueueOpts::default())
            .await
            .unwrap();

        let backlog = item_backlog(&qi);
        assert_eq!(q.shard().backlog_size(&backlog.backlog_id, T0).await.unwrap(), 1);
        assert_eq!(q.shard().partition_size(&pid, i64::MAX, T0).await.unwrap(), 0);
        assert_eq!(q.shard().shadow_partition_pointer(&pid, T0).await.unwrap(), Some(T0));
        assert_eq!(q.shard().counts(T0).await.unwrap().shadow_partitions, 1);
    });
}

#[runq::test]
async fn shadow_scan_refills_the_runnable_partition() {
    with_timeout!(5000, {
        let q = key_queue_test_queue();
        let fid = function_id(1);
        let pid = fid.to_string();
        let qi = q
            .processor
            .enqueue(edge_item(fid, "a"), T0, EnqueueOpts::default())
            .await
            .unwrap();

        assert_eq!(q.processor.shadow_scan_once().await.unwrap(), 1);
        assert_eq!(q.shard().backlog_size(&item_backlog(&qi).backlog_id, T0).await.unwrap(), 0);
        assert_eq!(q.shard().partition_size(&pid, i64::MAX, T0).await.unwrap(), 1);
        let refilled = q.shard().item_by_id(&qi.id, T0).await.unwrap().unwrap();
        assert_eq!(refilled.refilled_from.as_deref(), Some(item_backlog(&qi).backlog_id.as_str()));

        q.processor.scan_once().await.unwrap();
        let (run, seen) = recording_run_fn();
        assert_eq!(q.run_dispatched(&run).await, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string()]);
    });
}

#[runq::test]
async fn paused_refills_leave_the_backlog_alone() {
    with_timeout!(5000, {
        let fid = function_id(2);
        let q = open_test_queue_with(move |o| {
            o.with_allow_key_queues(|_, _| true)
                .with_paused_getter(move |f| runq::partition::PausedInfo {
                    paused: f == fid,
                    stale: false,
                })
        });
        let pid = fid.to_string();
        q.processor
            .enqueue(edge_item(fid, "p"), T0, EnqueueOpts::default())
            .await
            .unwrap();

        q.processor.shadow_scan_once().await.unwrap();
        assert_eq!(q.shard().partition_size(&pid, i64::MAX, T0).await.unwrap(), 0);
        assert_eq!(
            q.shard().shadow_partition_pointer(&pid, T0).await.unwrap(),
            Some(T0 + 5 * 60_000)
        );
    });
}

fn throttled_start(fid: uuid::Uuid, throttle: &Throttle, job: &str) -> Item {
    Item {
        kind: KIND_START.to_string(),
        throttle: Some(throttle.clone()),
        ..edge_item(fid, job)
    }
}

#[runq::test]
async fn removed_throttle_normalizes_into_the_default_backlog() {
    with_timeout!(5000, {
        let fid = function_id(3);
        let pid = fid.to_string();
        let throttle = Throttle::new(fid, 1, 0, 60, Some(("event.data.customer", "c1")));
        let config = Arc::new(Mutex::new(PartitionConstraintConfig {
            throttle: Some(ShadowPartitionThrottle {
                key_expression_hash: throttle.key_expression_hash.clone(),
                limit: 1,
                burst: 0,
                period_s: 60,
            }),
            ..Default::default()
        }));
        let getter = Arc::clone(&config);
        let q = open_test_queue_with(move |o| {
            o.with_allow_key_queues(|_, _| true)
                .with_constraint_getter(move |_, _, _| getter.lock().unwrap().clone())
        });

        let mut enqueued = Vec::new();
        for n in 0..10 {
            let item = throttled_start(fid, &throttle, &format!("s{n}"));
            enqueued.push(q.processor.enqueue(item, T0, EnqueueOpts::default()).await.unwrap());
        }
        let old = item_backlog(&enqueued[0]);
        assert!(old.throttle.is_some());
        assert_eq!(q.shard().backlog_size(&old.backlog_id, T0).await.unwrap(), 10);

        // the function drops its throttle
        config.lock().unwrap().throttle = None;
        q.processor.shadow_scan_once().await.unwrap();
        assert_eq!(q.shard().partition_size(&pid, i64::MAX, T0).await.unwrap(), 0);

        assert_eq!(q.processor.normalize_once().await.unwrap(), 10);
        assert_eq!(q.shard().backlog_size(&old.backlog_id, T0).await.unwrap(), 0);
        assert!(q.shard().backlog_by_id(&old.backlog_id, T0).await.unwrap().is_none());

        let mut plain = enqueued[0].clone();
        plain.data.throttle = None;
        let default = item_backlog(&plain);
        assert!(default.is_default());
        assert_eq!(q.shard().backlog_size(&default.backlog_id, T0).await.unwrap(), 10);

        // nothing left to normalize
        assert_eq!(q.processor.normalize_once().await.unwrap(), 0);

        q.processor.shadow_scan_once().await.unwrap();
        assert_eq!(q.shard().partition_size(&pid, i64::MAX, T0).await.unwrap(), 10);
    });
}

#[runq::test]
async fn only_the_holder_releases_a_normalization_lease() {
    with_timeout!(5000, {
        let q = key_queue_test_queue();
        let fid = function_id(4);
        let pid = fid.to_string();
        let qi = q
            .processor
            .enqueue(edge_item(fid, "a"), T0, EnqueueOpts::default())
            .await
            .unwrap();
        let bid = item_backlog(&qi).backlog_id;
        let shard = q.shard();

        let held = shard.lease_backlog_for_normalization(&bid, 30_000, T0).await.unwrap();

        let stranger = Ulid::new(T0 + 30_000);
        let res = shard.finish_backlog_normalization(&bid, &pid, stranger, T0 + 1).await;
        assert!(matches!(res, Err(QueueError::BacklogNormalizationLeaseExpired)), "{res:?}");

        let second = shard.lease_backlog_for_normalization(&bid, 30_000, T0 + 2).await;
        assert!(
            matches!(second, Err(QueueError::BacklogAlreadyLeasedForNormalization)),
            "{second:?}"
        );

        // the holder's release frees it; the backlog still has work so it stays
        assert!(!shard.finish_backlog_normalization(&bid, &pid, held, T0 + 3).await.unwrap());
        shard
            .lease_backlog_for_normalization(&bid, 30_000, T0 + 4)
            .await
            .expect("free after release");
    });
}
