mod test_helpers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use runq::error::{ProcessorError, RunError};
use runq::processor::{run_fn, Continuation, EnqueueOpts, RunResult};
use runq::ulid::Ulid;

use test_helpers::*;

async fn lease_one(q: &TestQueue, job: &str, attempt: u32) -> String {
    let mut item = edge_item(function_id(1), job);
    item.attempt = attempt;
    let qi = q.processor.enqueue(item, T0, EnqueueOpts::default()).await.unwrap();
    q.processor.scan_once().await.unwrap();
    assert_eq!(q.processor.pending_work(), 1);
    qi.id
}

#[runq::test]
async fn retryable_failure_requeues_with_backoff() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let id = lease_one(&q, "r", 0).await;

        let f = failing_run_fn(RunError::retryable("boom"));
        assert!(q.processor.work_once(&f).await.unwrap());

        let stored = q.shard().item_by_id(&id, T0).await.unwrap().expect("still queued");
        assert_eq!(stored.data.attempt, 1);
        assert_eq!(stored.at_ms, T0 + 10_000);
        assert_eq!(stored.lease_id, None);
        assert_eq!(q.processor.semaphore().in_use(), 0);
    });
}

#[runq::test]
async fn explicit_retry_time_wins_over_backoff() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let id = lease_one(&q, "r", 0).await;

        let f = failing_run_fn(RunError::retryable("later").with_retry_at(T0 + 42_000));
        q.processor.work_once(&f).await.unwrap();

        let stored = q.shard().item_by_id(&id, T0).await.unwrap().unwrap();
        assert_eq!(stored.at_ms, T0 + 42_000);
        assert_eq!(stored.data.attempt, 1);
    });
}

#[runq::test]
async fn always_retryable_failures_keep_the_attempt() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let id = lease_one(&q, "r", 3).await;

        let f = failing_run_fn(RunError::always_retryable("again"));
        q.processor.work_once(&f).await.unwrap();

        let stored = q.shard().item_by_id(&id, T0).await.unwrap().expect("retried past the limit");
        assert_eq!(stored.data.attempt, 3);
    });
}

#[runq::test]
async fn permanent_failure_dequeues() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let id = lease_one(&q, "p", 0).await;

        q.processor
            .work_once(&failing_run_fn(RunError::permanent("bad input")))
            .await
            .unwrap();
        assert!(q.shard().item_by_id(&id, T0).await.unwrap().is_none());
    });
}

#[runq::test]
async fn last_attempt_is_not_retried() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let id = lease_one(&q, "l", 3).await;

        q.processor
            .work_once(&failing_run_fn(RunError::retryable("boom")))
            .await
            .unwrap();
        assert!(q.shard().item_by_id(&id, T0).await.unwrap().is_none());
    });
}

#[runq::test]
async fn quit_hands_the_item_back_and_stops() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let id = lease_one(&q, "q", 0).await;

        let res = q.processor.work_once(&failing_run_fn(RunError::quit("shutting down"))).await;
        assert!(matches!(res, Err(ProcessorError::Quit(e)) if e.message == "shutting down"));

        let stored = q.shard().item_by_id(&id, T0).await.unwrap().unwrap();
        assert_eq!(stored.lease_id, None);
        assert_eq!(stored.data.attempt, 0);
        assert_eq!(stored.at_ms, T0);
    });
}

#[runq::test]
async fn panics_are_retried_without_consuming_an_attempt() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let id = lease_one(&q, "panic", 0).await;

        let f = run_fn(|_info, _item| async move {
            if true {
                panic!("user code exploded");
            }
            Ok::<_, RunError>(RunResult::default())
        });
        q.processor.work_once(&f).await.unwrap();

        let stored = q.shard().item_by_id(&id, T0).await.unwrap().unwrap();
        assert_eq!(stored.data.attempt, 0);
        assert_eq!(stored.lease_id, None);
    });
}

#[runq::test]
async fn immediate_follow_up_work_continues_the_partition() {
    with_timeout!(5000, {
        let q = open_test_queue();
        lease_one(&q, "c", 0).await;

        let f = run_fn(|_info, _item| async move {
            Ok::<_, RunError>(RunResult {
                scheduled_immediate_job: true,
            })
        });
        q.processor.work_once(&f).await.unwrap();

        let pid = function_id(1).to_string();
        assert_eq!(q.processor.continuations().get(&pid), Some(Continuation { count: 1 }));
    });
}

#[runq::test]
async fn run_info_describes_the_item() {
    with_timeout!(5000, {
        let q = open_test_queue();
        lease_one(&q, "info", 0).await;
        q.clock.advance_ms(250);

        let seen = Arc::new(std::sync::Mutex::new(None));
        let out = Arc::clone(&seen);
        let f = run_fn(move |info, _item| {
            let seen = Arc::clone(&seen);
            async move {
                *seen.lock().unwrap() = Some(info);
                Ok::<_, RunError>(RunResult::default())
            }
        });
        q.processor.work_once(&f).await.unwrap();

        let info = out.lock().unwrap().clone().expect("run function called");
        assert_eq!(info.job_id, "info");
        assert_eq!(info.group_id, "group-info");
        assert_eq!(info.queue_shard_name, "test");
        assert_eq!(info.latency_ms, 250);
        assert_eq!(info.continue_count, 0);
    });
}

#[runq::test(start_paused = true)]
async fn near_future_items_wait_for_their_time() {
    with_timeout!(10_000, {
        let q = open_test_queue();
        // a run that started a minute ago scores its near-future steps as ready now
        let mut item = edge_item(function_id(1), "soon");
        item.identifier.run_id = Some(Ulid::from_parts(T0 - 60_000, 1));
        let qi = q
            .processor
            .enqueue(item, T0 + 1_900, EnqueueOpts::default())
            .await
            .unwrap();
        q.processor.scan_once().await.unwrap();
        assert_eq!(q.processor.pending_work(), 1);

        let ran_at = Arc::new(std::sync::Mutex::new(None));
        let record = Arc::clone(&ran_at);
        let f = run_fn(move |_info, _item| {
            let record = Arc::clone(&record);
            async move {
                *record.lock().unwrap() = Some(tokio::time::Instant::now());
                Ok::<_, RunError>(RunResult::default())
            }
        });
        let started = tokio::time::Instant::now();
        assert!(q.processor.work_once(&f).await.unwrap());

        let ran_at = ran_at.lock().unwrap().expect("run function called");
        let waited = ran_at - started;
        assert!(waited >= Duration::from_millis(1_900), "ran after {waited:?}");
        assert!(q.shard().item_by_id(&qi.id, T0).await.unwrap().is_none());
    });
}

#[runq::test(start_paused = true)]
async fn lost_lease_aborts_the_running_function() {
    with_timeout!(600_000, {
        let q = open_test_queue();
        let id = lease_one(&q, "slow", 0).await;

        let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let f = run_fn(move |_info, _item| {
            let started_tx = started_tx.clone();
            let flag = Arc::clone(&flag);
            async move {
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_secs(60)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, RunError>(RunResult::default())
            }
        });

        let worker = {
            let p = Arc::clone(&q.processor);
            tokio::spawn(async move { p.work_once(&f).await })
        };
        started_rx.recv().await.expect("run started");

        // the lease lapses and the scavenger hands the item to someone else
        q.clock.advance_ms(31_000);
        assert_eq!(q.processor.scavenge_once().await.unwrap(), 1);

        assert!(worker.await.unwrap().unwrap());
        assert_eq!(q.processor.semaphore().in_use(), 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!finished.load(Ordering::SeqCst), "aborted run kept going");
        let stored = q.shard().item_by_id(&id, T0 + 31_000).await.unwrap().expect("still queued");
        assert_eq!(stored.lease_id, None);
    });
}

#[runq::test]
async fn retries_are_counted_as_requeues() {
    with_timeout!(5000, {
        let metrics = runq::metrics::init().unwrap();
        let m = metrics.clone();
        let q = open_test_queue_with(move |o| o.with_metrics(m));
        lease_one(&q, "r", 0).await;

        let f = failing_run_fn(RunError::retryable("boom"));
        q.processor.work_once(&f).await.unwrap();

        let family = metrics
            .registry()
            .gather()
            .into_iter()
            .find(|f| f.get_name() == "runq_queue_items_requeued_total")
            .expect("requeue metric");
        let retry = family
            .get_metric()
            .iter()
            .find(|m| m.get_label().iter().any(|l| l.get_value() == "retry"))
            .expect("retry label");
        assert_eq!(retry.get_counter().get_value(), 1.0);
    });
}
