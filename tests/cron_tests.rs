mod test_helpers;

use runq::cron::{health_check_job_id, schedule_job_id, CronItem, CronOp};
use runq::item::{hash_id, KIND_CRON, KIND_CRON_HEALTH_CHECK};
use runq::ulid::Ulid;
use uuid::Uuid;

use test_helpers::*;

const HOURLY: &str = "0 * * * *";
/// 11:00:00 on the day of T0.
const ELEVEN: i64 = T0 + 57 * 60_000;

fn cron_item(fid: Uuid, version: i64, op: CronOp, at_ms: i64) -> CronItem {
    CronItem {
        id: Ulid::new(at_ms),
        account_id: ACCOUNT,
        workspace_id: ENV,
        app_id: Uuid::from_u128(0xa99),
        function_id: fid,
        function_version: version,
        expression: HOURLY.to_string(),
        job_id: String::new(),
        op,
    }
}

#[runq::test]
async fn process_item_schedules_the_next_hour() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let fid = function_id(1);
        let ci = cron_item(fid, 1, CronOp::Process, T0);

        let next = q
            .processor
            .cron()
            .schedule_next(&ci)
            .await
            .unwrap()
            .expect("hourly cron fires again");
        let at = next.id.timestamp_ms();
        assert!(at <= ELEVEN && at >= ELEVEN - 20, "fire time {at} outside jitter window");
        assert_eq!(next.op, CronOp::Process);
        let job_id = hash_id(&schedule_job_id(ELEVEN, HOURLY, fid, 1));
        assert_eq!(next.job_id, job_id);

        let stored = q.shard().item_by_id(&job_id, T0).await.unwrap().expect("cron job queued");
        assert_eq!(stored.queue_name.as_deref(), Some(KIND_CRON));
        assert_eq!(stored.at_ms, at);
        let payload: CronItem = serde_json::from_value(stored.data.payload.clone()).unwrap();
        assert_eq!(payload, next);
    });
}

#[runq::test]
async fn scheduling_the_same_fire_twice_is_a_no_op() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let ci = cron_item(function_id(1), 1, CronOp::Process, T0);

        q.processor.cron().schedule_next(&ci).await.unwrap();
        let before = q.shard().counts(T0).await.unwrap().items;
        q.processor.cron().schedule_next(&ci).await.unwrap();
        assert_eq!(q.shard().counts(T0).await.unwrap().items, before);
    });
}

#[runq::test]
async fn new_schedule_is_mapped_and_may_run() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let fid = function_id(2);
        let cron = q.processor.cron();
        cron.update_schedule(&cron_item(fid, 2, CronOp::New, T0)).await.unwrap();

        let mapped = cron
            .next_scheduled_item_for_function(fid)
            .await
            .unwrap()
            .expect("schedule mapped");
        assert_eq!(mapped.op, CronOp::Process);
        assert!(cron.can_run(&mapped).await.unwrap());
        assert!(cron.health_check(fid, HOURLY, 2).await.unwrap());

        // an item from an older deploy does not fire
        let stale = CronItem {
            id: Ulid::new(T0 - 60_000),
            function_version: 1,
            ..mapped.clone()
        };
        assert!(!cron.can_run(&stale).await.unwrap());

        // unknown functions have nothing to run
        let other = cron_item(function_id(3), 1, CronOp::Process, T0);
        assert!(!cron.can_run(&other).await.unwrap());
    });
}

#[runq::test]
async fn pause_removes_the_schedule_and_its_job() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let fid = function_id(2);
        let cron = q.processor.cron();
        cron.update_schedule(&cron_item(fid, 1, CronOp::New, T0)).await.unwrap();
        let mapped = cron.next_scheduled_item_for_function(fid).await.unwrap().unwrap();

        cron.update_schedule(&cron_item(fid, 1, CronOp::Pause, T0 + 1))
            .await
            .unwrap();
        assert!(cron.next_scheduled_item_for_function(fid).await.unwrap().is_none());
        assert!(q.shard().item_by_id(&mapped.job_id, T0).await.unwrap().is_none());
        assert!(!cron.health_check(fid, HOURLY, 1).await.unwrap());
    });
}

#[runq::test]
async fn older_updates_do_not_replace_newer_schedules() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let fid = function_id(4);
        let cron = q.processor.cron();
        cron.update_schedule(&cron_item(fid, 3, CronOp::New, T0)).await.unwrap();
        let mapped = cron.next_scheduled_item_for_function(fid).await.unwrap().unwrap();

        cron.update_schedule(&cron_item(fid, 2, CronOp::Update, T0 + 1))
            .await
            .unwrap();
        let still = cron.next_scheduled_item_for_function(fid).await.unwrap().unwrap();
        assert_eq!(still, mapped);
        assert!(q.shard().item_by_id(&mapped.job_id, T0).await.unwrap().is_some());
    });
}

#[runq::test]
async fn health_checks_run_forty_seconds_into_the_minute() {
    with_timeout!(5000, {
        let q = open_test_queue();
        q.processor.cron().enqueue_next_health_check().await.unwrap();
        q.processor.cron().enqueue_next_health_check().await.unwrap();

        let at = T0 + 40_000;
        let id = hash_id(&health_check_job_id(at));
        let stored = q.shard().item_by_id(&id, T0).await.unwrap().expect("health check queued");
        assert_eq!(stored.at_ms, at);
        assert_eq!(stored.queue_name.as_deref(), Some(KIND_CRON_HEALTH_CHECK));
        assert_eq!(q.shard().counts(T0).await.unwrap().items, 1);
    });
}
