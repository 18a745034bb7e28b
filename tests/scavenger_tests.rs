mod test_helpers;

use runq::error::QueueError;
use runq::keys::SetScope;
use runq::processor::EnqueueOpts;

use test_helpers::*;

#[runq::test]
async fn expired_leases_are_reclaimed() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let fid = function_id(1);
        let pid = fid.to_string();
        let qi = q
            .processor
            .enqueue(edge_item(fid, "crashy"), T0, EnqueueOpts::default())
            .await
            .unwrap();

        q.processor.scan_once().await.unwrap();
        // the worker dies holding the lease
        assert_eq!(q.processor.drain_dispatched().await.len(), 1);
        assert_eq!(q.processor.scavenge_once().await.unwrap(), 0);

        q.clock.advance_ms(30_001);
        assert_eq!(q.processor.scavenge_once().await.unwrap(), 1);
        let stored = q.shard().item_by_id(&qi.id, q.now()).await.unwrap().unwrap();
        assert_eq!(stored.lease_id, None);
        assert_eq!(stored.data.attempt, 0);
        assert_eq!(stored.at_ms, q.now());
        assert_eq!(q.shard().partition_size(&pid, q.now(), q.now()).await.unwrap(), 1);

        q.processor.scan_once().await.unwrap();
        let (run, seen) = recording_run_fn();
        assert_eq!(q.run_dispatched(&run).await, 1);
        assert_eq!(*seen.lock().unwrap(), vec!["crashy".to_string()]);
    });
}

#[runq::test]
async fn live_leases_are_left_alone() {
    with_timeout!(5000, {
        let q = open_test_queue();
        q.processor
            .enqueue(edge_item(function_id(1), "busy"), T0, EnqueueOpts::default())
            .await
            .unwrap();
        q.processor.scan_once().await.unwrap();
        q.processor.drain_dispatched().await;

        q.clock.advance_ms(29_000);
        assert_eq!(q.processor.scavenge_once().await.unwrap(), 0);
    });
}

#[runq::test]
async fn active_check_drops_stale_members() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let qi = q
            .processor
            .enqueue(edge_item(function_id(1), "queued"), T0, EnqueueOpts::default())
            .await
            .unwrap();

        let account = ACCOUNT.to_string();
        let active = q.shard().keys().active_set(SetScope::Account, &account);
        let in_progress = q.shard().keys().in_progress(SetScope::Account, &account);
        q.store
            .eval("seed_stale_members", T0, |ks| {
                // an item that no longer exists, and one that was never leased
                ks.zadd(&active, T0, "ghost")?;
                ks.zadd(&in_progress, T0, &qi.id)?;
                Ok::<_, QueueError>(())
            })
            .await
            .unwrap();

        assert_eq!(q.processor.active_check(1.0).await.unwrap(), 2);
        let left = q
            .store
            .eval("count_members", T0, |ks| {
                Ok::<_, QueueError>(ks.zcard(&active)? + ks.zcard(&in_progress)?)
            })
            .await
            .unwrap();
        assert_eq!(left, 0);
        // the item itself is untouched
        assert!(q.shard().item_by_id(&qi.id, T0).await.unwrap().is_some());
    });
}
