mod test_helpers;

use runq::error::QueueError;
use runq::item::{Item, KIND_CRON_SYNC};
use runq::processor::EnqueueOpts;
use runq::queue_shard::PROMOTE_QUEUE_NAME;

use test_helpers::*;

#[runq::test]
async fn enqueue_stores_item_and_points_partition_at_it() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let fid = function_id(1);
        let qi = q
            .processor
            .enqueue(edge_item(fid, "a"), T0, EnqueueOpts::default())
            .await
            .expect("enqueue");

        assert_eq!(qi.function_id, fid);
        assert_eq!(qi.at_ms, T0);
        assert_eq!(qi.enqueued_at_ms, T0);
        let stored = q.shard().item_by_id(&qi.id, T0).await.unwrap().expect("stored");
        assert_eq!(stored.data.job_id.as_deref(), Some("a"));

        let pid = fid.to_string();
        assert_eq!(q.shard().partition_pointer(&pid, T0).await.unwrap(), Some(T0));
        assert_eq!(q.shard().partition_size(&pid, T0, T0).await.unwrap(), 1);
        let p = q.shard().partition_by_id(&pid, T0).await.unwrap().expect("partition");
        assert_eq!(p.function_id, Some(fid));
        assert_eq!(p.account_id, ACCOUNT);
    });
}

#[runq::test]
async fn same_job_id_is_enqueued_once() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let fid = function_id(1);
        q.processor
            .enqueue(edge_item(fid, "dup"), T0, EnqueueOpts::default())
            .await
            .expect("first enqueue");
        let second = q
            .processor
            .enqueue(edge_item(fid, "dup"), T0 + 500, EnqueueOpts::default())
            .await;
        assert!(matches!(second, Err(QueueError::QueueItemExists)), "{second:?}");

        let pid = fid.to_string();
        assert_eq!(q.shard().partition_size(&pid, i64::MAX, T0).await.unwrap(), 1);
        assert_eq!(q.shard().counts(T0).await.unwrap().items, 1);
    });
}

#[runq::test]
async fn dequeued_item_id_stays_reserved_for_idempotency_window() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let fid = function_id(1);
        let qi = q
            .processor
            .enqueue(edge_item(fid, "once"), T0, EnqueueOpts::default())
            .await
            .unwrap();
        q.shard().dequeue(&qi, T0, 60_000).await.expect("dequeue");
        assert!(q.shard().item_by_id(&qi.id, T0).await.unwrap().is_none());

        let again = q
            .processor
            .enqueue(edge_item(fid, "once"), T0, EnqueueOpts::default())
            .await;
        assert!(matches!(again, Err(QueueError::QueueItemExists)));

        // the window is over
        q.clock.advance_ms(60_001);
        q.processor
            .enqueue(edge_item(fid, "once"), q.now(), EnqueueOpts::default())
            .await
            .expect("enqueue after idempotency window");
    });
}

#[runq::test]
async fn far_future_items_get_a_promotion_job() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let fid = function_id(2);
        let at = T0 + 60_000;
        q.processor
            .enqueue(edge_item(fid, "later"), at, EnqueueOpts::default())
            .await
            .unwrap();

        let promote = q
            .shard()
            .partition_by_id(PROMOTE_QUEUE_NAME, T0)
            .await
            .unwrap()
            .expect("promotion partition");
        assert!(promote.is_system());
        assert_eq!(
            q.shard().partition_pointer(PROMOTE_QUEUE_NAME, T0).await.unwrap(),
            Some(at - 2_000)
        );
        assert_eq!(q.shard().counts(T0).await.unwrap().items, 2);
    });
}

#[runq::test]
async fn near_term_items_need_no_promotion() {
    with_timeout!(5000, {
        let q = open_test_queue();
        q.processor
            .enqueue(edge_item(function_id(2), "soon"), T0 + 1_000, EnqueueOpts::default())
            .await
            .unwrap();
        assert!(q
            .shard()
            .partition_by_id(PROMOTE_QUEUE_NAME, T0)
            .await
            .unwrap()
            .is_none());
    });
}

#[runq::test]
async fn system_kinds_run_in_their_own_partition() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let item = Item {
            job_id: Some("sync-1".into()),
            kind: KIND_CRON_SYNC.to_string(),
            ..edge_item(function_id(3), "unused")
        };
        let qi = q.processor.enqueue(item, T0, EnqueueOpts::default()).await.unwrap();
        assert_eq!(qi.queue_name.as_deref(), Some(KIND_CRON_SYNC));
        assert!(qi.function_id.is_nil());
        assert_eq!(qi.partition_id(), KIND_CRON_SYNC);
        assert_eq!(q.shard().partition_size(KIND_CRON_SYNC, T0, T0).await.unwrap(), 1);
    });
}

#[runq::test]
async fn forced_shard_must_exist() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let opts = EnqueueOpts {
            force_queue_shard: Some("missing".into()),
            ..Default::default()
        };
        let res = q.processor.enqueue(edge_item(function_id(1), "x"), T0, opts).await;
        assert!(matches!(res, Err(QueueError::QueueShardNotFound(name)) if name == "missing"));
    });
}
