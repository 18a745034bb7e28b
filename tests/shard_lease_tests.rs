mod test_helpers;

use runq::backlog::{item_backlog, item_shadow_partition};
use runq::error::QueueError;
use runq::item::QueueItem;
use runq::partition::PartitionConstraintConfig;
use runq::processor::EnqueueOpts;
use runq::queue_shard::{LeaseParams, RequeueParams};

use test_helpers::*;

fn lease_params(item: &QueueItem, now_ms: i64) -> LeaseParams {
    let constraints = PartitionConstraintConfig::default();
    LeaseParams {
        now_ms,
        duration_ms: 30_000,
        backlog: item_backlog(item),
        shadow: item_shadow_partition(item, &constraints),
        constraints,
        disable_constraint_checks: false,
        capacity_lease: None,
    }
}

async fn enqueue_one(q: &TestQueue, job_id: &str) -> QueueItem {
    q.processor
        .enqueue(edge_item(function_id(1), job_id), T0, EnqueueOpts::default())
        .await
        .expect("enqueue")
}

#[runq::test]
async fn item_lease_is_exclusive_until_it_expires() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let qi = enqueue_one(&q, "a").await;

        let lease = q.shard().lease(&qi, &lease_params(&qi, T0)).await.expect("lease");
        assert_eq!(lease.timestamp_ms(), T0 + 30_000);
        let stored = q.shard().item_by_id(&qi.id, T0).await.unwrap().unwrap();
        assert_eq!(stored.lease_id, Some(lease));

        let again = q.shard().lease(&qi, &lease_params(&qi, T0 + 1)).await;
        assert!(matches!(again, Err(QueueError::QueueItemAlreadyLeased)));

        // leased items are not peeked
        let pid = qi.partition_id();
        let peeked = q.shard().peek_items(&pid, T0 + 1_000, 10, false, T0).await.unwrap();
        assert!(peeked.is_empty());

        let later = T0 + 30_001;
        q.shard()
            .lease(&qi, &lease_params(&qi, later))
            .await
            .expect("lease after expiry");
    });
}

#[runq::test]
async fn extend_requires_the_current_lease() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let qi = enqueue_one(&q, "a").await;

        let not_leased = q.shard().extend_lease(&qi, runq::ulid::Ulid::new(T0), 30_000, T0, false).await;
        assert!(matches!(not_leased, Err(QueueError::QueueItemNotLeased)), "{not_leased:?}");

        let lease = q.shard().lease(&qi, &lease_params(&qi, T0)).await.unwrap();
        let wrong = runq::ulid::Ulid::new(T0 + 30_000);
        let mismatch = q.shard().extend_lease(&qi, wrong, 30_000, T0 + 10, false).await;
        assert!(matches!(mismatch, Err(QueueError::QueueItemLeaseMismatch)), "{mismatch:?}");

        let next = q
            .shard()
            .extend_lease(&qi, lease, 30_000, T0 + 10_000, false)
            .await
            .expect("extend");
        assert_eq!(next.timestamp_ms(), T0 + 40_000);
        let stored = q.shard().item_by_id(&qi.id, T0 + 10_000).await.unwrap().unwrap();
        assert_eq!(stored.lease_id, Some(next));
    });
}

#[runq::test]
async fn requeue_clears_the_lease_and_moves_the_item() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let qi = enqueue_one(&q, "a").await;
        let lease = q.shard().lease(&qi, &lease_params(&qi, T0)).await.unwrap();
        let mut leased = qi.clone();
        leased.lease_id = Some(lease);

        let params = RequeueParams {
            now_ms: T0,
            at_ms: T0 + 10_000,
            key_queues: false,
            constraints: PartitionConstraintConfig::default(),
        };
        q.shard().requeue(&leased, &params).await.expect("requeue");

        let stored = q.shard().item_by_id(&qi.id, T0).await.unwrap().unwrap();
        assert_eq!(stored.lease_id, None);
        assert_eq!(stored.at_ms, T0 + 10_000);
        let pid = qi.partition_id();
        assert_eq!(q.shard().partition_size(&pid, T0 + 9_999, T0).await.unwrap(), 0);
        assert_eq!(q.shard().partition_size(&pid, T0 + 10_000, T0).await.unwrap(), 1);
    });
}

#[runq::test]
async fn dequeue_by_id_refuses_leased_items() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let qi = enqueue_one(&q, "a").await;
        q.shard().lease(&qi, &lease_params(&qi, T0)).await.unwrap();

        let res = q.shard().dequeue_by_id(&qi.id, T0, 0).await;
        assert!(matches!(res, Err(QueueError::QueueItemAlreadyLeased)));

        let removed = q.shard().dequeue_by_id(&qi.id, T0 + 30_001, 0).await.expect("dequeue");
        assert_eq!(removed.id, qi.id);
        let missing = q.shard().dequeue_by_id(&qi.id, T0 + 30_001, 0).await;
        assert!(matches!(missing, Err(QueueError::QueueItemNotFound)));
    });
}

#[runq::test]
async fn partition_lease_is_exclusive() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let qi = enqueue_one(&q, "a").await;
        let pid = qi.partition_id();

        let (lease, p) = q
            .shard()
            .partition_lease(&pid, 4_000, T0, None)
            .await
            .expect("partition lease");
        assert_eq!(p.lease_id, Some(lease));
        // scanners skip the partition until the lease runs out
        assert_eq!(q.shard().partition_pointer(&pid, T0).await.unwrap(), Some(T0 + 4_000));

        let again = q.shard().partition_lease(&pid, 4_000, T0 + 1, None).await;
        assert!(matches!(again, Err(QueueError::PartitionAlreadyLeased)));
    });
}

#[runq::test]
async fn empty_partitions_are_garbage_collected_on_lease() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let qi = enqueue_one(&q, "a").await;
        let pid = qi.partition_id();
        q.shard().dequeue(&qi, T0, 0).await.unwrap();

        let res = q.shard().partition_lease(&pid, 4_000, T0, None).await;
        assert!(matches!(res, Err(QueueError::PartitionGarbageCollected)));
        assert!(q.shard().partition_by_id(&pid, T0).await.unwrap().is_none());
        assert_eq!(q.shard().partition_pointer(&pid, T0).await.unwrap(), None);
    });
}

#[runq::test]
async fn forced_requeue_holds_against_new_enqueues() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let qi = enqueue_one(&q, "a").await;
        let pid = qi.partition_id();
        q.shard().partition_lease(&pid, 4_000, T0, None).await.unwrap();
        q.shard()
            .partition_requeue(&pid, T0 + 5_000, true, T0)
            .await
            .expect("forced requeue");

        enqueue_one(&q, "b").await;
        assert_eq!(q.shard().partition_pointer(&pid, T0).await.unwrap(), Some(T0 + 5_000));
    });
}

#[runq::test]
async fn unforced_requeue_follows_the_earliest_item() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let qi = enqueue_one(&q, "a").await;
        let pid = qi.partition_id();
        q.shard().partition_lease(&pid, 4_000, T0, None).await.unwrap();
        q.shard().partition_requeue(&pid, T0 + 30_000, false, T0).await.unwrap();
        assert_eq!(q.shard().partition_pointer(&pid, T0).await.unwrap(), Some(T0));
    });
}
