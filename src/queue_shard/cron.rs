//! Per-function "next scheduled" cron mapping.

use uuid::Uuid;

use crate::cron::CronItem;
use crate::error::QueueError;
use crate::queue_shard::helpers::{hget_json, hset_json};
use crate::queue_shard::QueueShard;

impl QueueShard {
    pub async fn cron_schedule_get(&self, function_id: Uuid, now_ms: i64) -> Result<Option<CronItem>, QueueError> {
        let key = self.kg.cron_schedule();
        self.store
            .eval("cron_schedule_get", now_ms, |ks| {
                hget_json(ks, &key, &function_id.to_string())
            })
            .await
    }

    pub async fn cron_schedule_set(&self, item: &CronItem, now_ms: i64) -> Result<(), QueueError> {
        let key = self.kg.cron_schedule();
        self.store
            .eval("cron_schedule_set", now_ms, |ks| {
                hset_json(ks, &key, &item.function_id.to_string(), item)
            })
            .await
    }

    pub async fn cron_schedule_delete(&self, function_id: Uuid, now_ms: i64) -> Result<bool, QueueError> {
        let key = self.kg.cron_schedule();
        self.store
            .eval("cron_schedule_delete", now_ms, |ks| {
                Ok(ks.hdel(&key, &function_id.to_string())?)
            })
            .await
    }
}
