//! Cron scheduling on top of the queue.
//!
//! Each cron function has exactly one "next scheduled" item in a per-shard
//! mapping. The scheduled `cron` system job carries that item as payload, and
//! its job id is derived from the fire time so the same schedule can never be
//! enqueued twice.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::QueueError;
use crate::item::{
    hash_id, Identifier, Item, QueueItem, DEFAULT_MAX_ATTEMPTS, KIND_CRON, KIND_CRON_HEALTH_CHECK,
    KIND_CRON_SYNC,
};
use crate::queue_shard::{EnqueueParams, QueueShard};
use crate::ulid::Ulid;

/// Process items look this far past their own fire time for the next one.
pub const DEFAULT_SCHEDULE_FORWARD_MS: i64 = 10_000;
pub const DEFAULT_JITTER_MIN_MS: i64 = 0;
pub const DEFAULT_JITTER_MAX_MS: i64 = 20;

/// Health checks fire this many seconds into each minute.
const HEALTH_CHECK_SECOND: i64 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CronOp {
    New,
    Update,
    Pause,
    Unpause,
    Archive,
    Init,
    Process,
    HealthCheck,
}

impl CronOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CronOp::New => "new",
            CronOp::Update => "update",
            CronOp::Pause => "pause",
            CronOp::Unpause => "unpause",
            CronOp::Archive => "archive",
            CronOp::Init => "init",
            CronOp::Process => "process",
            CronOp::HealthCheck => "health-check",
        }
    }
}

/// A schedule entry for one cron function. The id's timestamp is the time the
/// entry refers to: the fire time minus jitter for `process` items, the
/// request time otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronItem {
    pub id: Ulid,
    pub account_id: Uuid,
    pub workspace_id: Uuid,
    pub app_id: Uuid,
    pub function_id: Uuid,
    pub function_version: i64,
    pub expression: String,
    /// Queue item id of the scheduled job
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job_id: String,
    pub op: CronOp,
}

impl CronItem {
    /// Job id of the `cron-sync` job for this request.
    pub fn sync_id(&self) -> String {
        format!("{}:sync", self.id)
    }

    /// Unhashed job id of the schedule that follows this item. `None` when
    /// the expression never fires again.
    pub fn process_id(&self, schedule_forward_ms: i64) -> Result<Option<String>, QueueError> {
        let Some(next) = next_fire(&self.expression, self.schedule_from(schedule_forward_ms))? else {
            return Ok(None);
        };
        Ok(Some(schedule_job_id(
            next,
            &self.expression,
            self.function_id,
            self.function_version,
        )))
    }

    fn schedule_from(&self, schedule_forward_ms: i64) -> i64 {
        let from = self.id.timestamp_ms();
        if self.op == CronOp::Process {
            return from + schedule_forward_ms;
        }
        from
    }

    fn identifier(&self) -> Identifier {
        Identifier {
            workflow_id: self.function_id,
            workflow_version: self.function_version,
            account_id: self.account_id,
            env_id: self.workspace_id,
            ..Default::default()
        }
    }
}

fn rfc3339(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// `"{fire_time}:{expr}:{fn_id}:{version}:cron:schedule"`
pub fn schedule_job_id(fire_ms: i64, expression: &str, function_id: Uuid, version: i64) -> String {
    format!(
        "{}:{}:{}:{}:cron:schedule",
        rfc3339(fire_ms),
        expression,
        function_id,
        version
    )
}

/// Five-field expressions gain a leading seconds field.
pub fn normalize_expression(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        return format!("0 {}", expr);
    }
    expr.to_string()
}

/// First fire time strictly after `from_ms`, or `None` for an expression
/// that is valid but never matches.
pub fn next_fire(expr: &str, from_ms: i64) -> Result<Option<i64>, QueueError> {
    let schedule = cron::Schedule::from_str(&normalize_expression(expr)).map_err(|e| {
        QueueError::InvalidCron {
            expr: expr.to_string(),
            reason: e.to_string(),
        }
    })?;
    let from: DateTime<Utc> = Utc
        .timestamp_millis_opt(from_ms)
        .single()
        .ok_or_else(|| QueueError::InvalidCron {
            expr: expr.to_string(),
            reason: format!("time {from_ms} out of range"),
        })?;
    Ok(schedule.after(&from).next().map(|t| t.timestamp_millis()))
}

/// Next `hh:mm:40` strictly after `from_ms`.
pub fn next_health_check_time(from_ms: i64) -> i64 {
    let minute = from_ms - from_ms.rem_euclid(60_000);
    let candidate = minute + HEALTH_CHECK_SECOND * 1_000;
    if candidate > from_ms {
        candidate
    } else {
        candidate + 60_000
    }
}

pub fn health_check_job_id(at_ms: i64) -> String {
    format!("{}:cron:health-check", rfc3339(at_ms))
}

/// Manages cron schedules for one shard.
#[derive(Clone)]
pub struct CronManager {
    shard: QueueShard,
    clock: SharedClock,
    jitter_min_ms: i64,
    jitter_max_ms: i64,
    schedule_forward_ms: i64,
}

impl CronManager {
    pub fn new(shard: QueueShard, clock: SharedClock) -> Self {
        Self {
            shard,
            clock,
            jitter_min_ms: DEFAULT_JITTER_MIN_MS,
            jitter_max_ms: DEFAULT_JITTER_MAX_MS,
            schedule_forward_ms: DEFAULT_SCHEDULE_FORWARD_MS,
        }
    }

    /// Ignored when `min > max`.
    pub fn with_jitter_range(mut self, min_ms: i64, max_ms: i64) -> Self {
        if min_ms <= max_ms {
            self.jitter_min_ms = min_ms;
            self.jitter_max_ms = max_ms;
        }
        self
    }

    pub fn with_schedule_forward(mut self, forward_ms: i64) -> Self {
        if forward_ms > 0 {
            self.schedule_forward_ms = forward_ms;
        }
        self
    }

    fn jitter_ms(&self) -> i64 {
        if self.jitter_max_ms <= self.jitter_min_ms {
            return self.jitter_min_ms.max(0);
        }
        rand::rng().random_range(self.jitter_min_ms..=self.jitter_max_ms)
    }

    async fn enqueue_system_job(
        &self,
        kind: &str,
        job_id: &str,
        ci: &CronItem,
        payload: serde_json::Value,
        at_ms: i64,
    ) -> Result<(), QueueError> {
        let mut item = QueueItem {
            function_id: ci.function_id,
            workspace_id: ci.workspace_id,
            queue_name: Some(kind.to_string()),
            data: Item {
                job_id: Some(job_id.to_string()),
                group_id: Uuid::new_v4().to_string(),
                workspace_id: ci.workspace_id,
                kind: kind.to_string(),
                identifier: ci.identifier(),
                max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
                payload,
                queue_name: Some(kind.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        item.set_id(job_id);
        let params = EnqueueParams {
            now_ms: self.clock.now_ms(),
            ..Default::default()
        };
        match self.shard.enqueue(item, at_ms, params).await {
            Ok(_) | Err(QueueError::QueueItemExists) | Err(QueueError::QueueItemSingletonExists) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Enqueue a `cron-sync` job for a schedule change. Process items are
    /// not synced.
    pub async fn sync(&self, ci: &CronItem) -> Result<(), QueueError> {
        if ci.op == CronOp::Process {
            return Ok(());
        }
        let payload = serde_json::to_value(ci)?;
        self.enqueue_system_job(KIND_CRON_SYNC, &ci.sync_id(), ci, payload, ci.id.timestamp_ms())
            .await
    }

    /// Compute the item after `ci` and enqueue its `cron` job. Returns `None`
    /// when the expression never fires again.
    pub async fn schedule_next(&self, ci: &CronItem) -> Result<Option<CronItem>, QueueError> {
        let from = ci.schedule_from(self.schedule_forward_ms);
        let Some(fire) = next_fire(&ci.expression, from)? else {
            warn!(function_id = %ci.function_id, expression = %ci.expression, "cron expression has no next fire time");
            return Ok(None);
        };
        let at = fire - self.jitter_ms();
        let job_id = schedule_job_id(fire, &ci.expression, ci.function_id, ci.function_version);

        let next = CronItem {
            id: Ulid::new(at),
            job_id: hash_id(&job_id),
            op: CronOp::Process,
            ..ci.clone()
        };
        let payload = serde_json::to_value(&next)?;
        self.enqueue_system_job(KIND_CRON, &job_id, ci, payload, at).await?;
        debug!(function_id = %ci.function_id, op = ci.op.as_str(), at_ms = at, "scheduled next cron");
        Ok(Some(next))
    }

    /// Whether a fired `cron` item should run.
    pub async fn can_run(&self, ci: &CronItem) -> Result<bool, QueueError> {
        let Some(mapped) = self.next_scheduled_item_for_function(ci.function_id).await? else {
            return Ok(false);
        };
        if &mapped == ci {
            return Ok(true);
        }
        if mapped.op != CronOp::Process {
            return Ok(false);
        }
        warn!(function_id = %ci.function_id, "cron item differs from the scheduled one");
        Ok(mapped.function_version <= ci.function_version)
    }

    pub async fn update_schedule(&self, ci: &CronItem) -> Result<(), QueueError> {
        let now = self.clock.now_ms();
        match ci.op {
            CronOp::New | CronOp::Unpause | CronOp::Process => self.schedule_and_map(ci).await,
            CronOp::Update => {
                if let Some(existing) = self.next_scheduled_item_for_function(ci.function_id).await? {
                    if existing.function_version > ci.function_version {
                        return Ok(());
                    }
                    self.dequeue_scheduled(&existing, now).await?;
                }
                self.schedule_and_map(ci).await
            }
            CronOp::Pause | CronOp::Archive => {
                if let Some(existing) = self.next_scheduled_item_for_function(ci.function_id).await? {
                    self.dequeue_scheduled(&existing, now).await?;
                }
                self.shard.cron_schedule_delete(ci.function_id, now).await?;
                Ok(())
            }
            CronOp::Init => {
                if self
                    .next_scheduled_item_for_function(ci.function_id)
                    .await?
                    .is_some()
                {
                    return Ok(());
                }
                self.schedule_and_map(ci).await
            }
            CronOp::HealthCheck => Err(QueueError::InvalidItem(format!(
                "unknown cron operation {}",
                ci.op.as_str()
            ))),
        }
    }

    async fn schedule_and_map(&self, ci: &CronItem) -> Result<(), QueueError> {
        if let Some(next) = self.schedule_next(ci).await? {
            self.shard.cron_schedule_set(&next, self.clock.now_ms()).await?;
        }
        Ok(())
    }

    async fn dequeue_scheduled(&self, existing: &CronItem, now_ms: i64) -> Result<(), QueueError> {
        match self.shard.dequeue_by_id(&existing.job_id, now_ms, 0).await {
            Ok(_) | Err(QueueError::QueueItemNotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn next_scheduled_item_for_function(&self, function_id: Uuid) -> Result<Option<CronItem>, QueueError> {
        self.shard
            .cron_schedule_get(function_id, self.clock.now_ms())
            .await
    }

    /// Whether the job for the next fire of `(function, expression, version)`
    /// is in the queue.
    pub async fn health_check(&self, function_id: Uuid, expression: &str, version: i64) -> Result<bool, QueueError> {
        let now = self.clock.now_ms();
        let candidate = CronItem {
            id: Ulid::new(now),
            account_id: Uuid::nil(),
            workspace_id: Uuid::nil(),
            app_id: Uuid::nil(),
            function_id,
            function_version: version,
            expression: expression.to_string(),
            job_id: String::new(),
            op: CronOp::Init,
        };
        let Some(job_id) = candidate.process_id(self.schedule_forward_ms)? else {
            return Ok(false);
        };
        Ok(self.shard.item_by_id(&hash_id(&job_id), now).await?.is_some())
    }

    /// Enqueue the next `cron-health-check` job.
    pub async fn enqueue_next_health_check(&self) -> Result<(), QueueError> {
        let at = next_health_check_time(self.clock.now_ms());
        let ci = CronItem {
            id: Ulid::new(at),
            account_id: Uuid::nil(),
            workspace_id: Uuid::nil(),
            app_id: Uuid::nil(),
            function_id: Uuid::nil(),
            function_version: 0,
            expression: String::new(),
            job_id: String::new(),
            op: CronOp::HealthCheck,
        };
        let payload = serde_json::to_value(&ci)?;
        self.enqueue_system_job(KIND_CRON_HEALTH_CHECK, &health_check_job_id(at), &ci, payload, at)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(s: &str) -> i64 {
        DateTime::parse_from_rfc3339(s).unwrap().timestamp_millis()
    }

    #[test]
    fn five_field_expressions_get_seconds() {
        assert_eq!(normalize_expression("0 * * * *"), "0 0 * * * *");
        assert_eq!(normalize_expression("30 0 * * * *"), "30 0 * * * *");
    }

    #[test]
    fn next_fire_is_strictly_after() {
        let from = ms("2024-05-01T10:03:00Z");
        assert_eq!(next_fire("0 * * * *", from).unwrap(), Some(ms("2024-05-01T11:00:00Z")));
        let on_the_hour = ms("2024-05-01T11:00:00Z");
        assert_eq!(
            next_fire("0 * * * *", on_the_hour).unwrap(),
            Some(ms("2024-05-01T12:00:00Z"))
        );
    }

    #[test]
    fn never_matching_expression_has_no_fire() {
        assert_eq!(next_fire("0 0 30 2 *", ms("2024-05-01T10:03:00Z")).unwrap(), None);
    }

    #[test]
    fn invalid_expression_is_an_error() {
        assert!(matches!(
            next_fire("not a cron", 0),
            Err(QueueError::InvalidCron { .. })
        ));
    }

    #[test]
    fn process_items_look_past_their_own_fire() {
        let ci = CronItem {
            id: Ulid::new(ms("2024-05-01T10:59:59.990Z")),
            account_id: Uuid::nil(),
            workspace_id: Uuid::nil(),
            app_id: Uuid::nil(),
            function_id: Uuid::from_u128(7),
            function_version: 1,
            expression: "0 * * * *".into(),
            job_id: String::new(),
            op: CronOp::Process,
        };
        let id = ci.process_id(DEFAULT_SCHEDULE_FORWARD_MS).unwrap().unwrap();
        assert!(id.starts_with("2024-05-01T12:00:00Z:0 * * * *:"));
        assert!(id.ends_with(":1:cron:schedule"));
    }

    #[test]
    fn health_checks_land_on_second_forty() {
        let from = ms("2024-05-01T10:03:12Z");
        assert_eq!(next_health_check_time(from), ms("2024-05-01T10:03:40Z"));
        let at = ms("2024-05-01T10:03:40Z");
        assert_eq!(next_health_check_time(at), ms("2024-05-01T10:04:40Z"));
        assert_eq!(health_check_job_id(at), "2024-05-01T10:03:40Z:cron:health-check");
    }
}
