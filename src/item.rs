//! Queue items: the unit of work and everything derived from it alone.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::ulid::{LeaseId, Ulid};

pub const KIND_START: &str = "start";
pub const KIND_EDGE: &str = "edge";
pub const KIND_SLEEP: &str = "sleep";
pub const KIND_PAUSE: &str = "pause";
pub const KIND_DEBOUNCE: &str = "debounce";
pub const KIND_SCHEDULE_BATCH: &str = "schedule-batch";
pub const KIND_EDGE_ERROR: &str = "edge-error";
pub const KIND_QUEUE_MIGRATE: &str = "queue-migrate";
pub const KIND_CRON: &str = "cron";
pub const KIND_CRON_SYNC: &str = "cron-sync";
pub const KIND_CRON_HEALTH_CHECK: &str = "cron-health-check";
pub const KIND_JOB_PROMOTE: &str = "job-promote";
pub const KIND_PAUSE_BLOCK_FLUSH: &str = "pause-block-flush";

/// Kinds that run on a system queue of the same name unless mapped elsewhere.
pub const SYSTEM_QUEUE_KINDS: &[&str] = &[
    KIND_CRON,
    KIND_CRON_SYNC,
    KIND_CRON_HEALTH_CHECK,
    KIND_QUEUE_MIGRATE,
    KIND_JOB_PROMOTE,
    KIND_PAUSE_BLOCK_FLUSH,
];

/// Attempts allowed when an item does not set its own maximum.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Items further than this in the future keep their literal time as score.
pub const FUTURE_AT_LIMIT_MS: i64 = 2_000;

/// Priority factors are clamped to this many seconds either way.
pub const PRIORITY_FACTOR_MAX_S: i64 = 600;
pub const PRIORITY_FACTOR_MIN_S: i64 = -600;

/// Raw expression values kept for debugging are cut to this length.
const UNHASHED_VALUE_MAX: usize = 512;

/// Stable short fingerprint of an arbitrary string, base36 encoded.
pub fn hash_id(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    to_base36(u64::from_be_bytes(bytes))
}

fn to_base36(mut v: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if v == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while v > 0 {
        out.push(DIGITS[(v % 36) as usize]);
        v /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Hex digest of a key expression; the empty expression hashes too.
pub fn expression_hash(expr: &str) -> String {
    format!("{:x}", Sha256::digest(expr.as_bytes()))[..16].to_string()
}

/// Which entity a custom concurrency key is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyScope {
    #[serde(rename = "fn")]
    Function,
    Env,
    Account,
}

impl ConcurrencyScope {
    pub fn prefix(&self) -> &'static str {
        match self {
            ConcurrencyScope::Function => "f",
            ConcurrencyScope::Env => "e",
            ConcurrencyScope::Account => "a",
        }
    }

    pub fn from_prefix(p: &str) -> Option<Self> {
        match p {
            "f" => Some(ConcurrencyScope::Function),
            "e" => Some(ConcurrencyScope::Env),
            "a" => Some(ConcurrencyScope::Account),
            _ => None,
        }
    }
}

/// Whether a custom limit counts steps or whole runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyMode {
    #[default]
    Step,
    Run,
}

/// Canonical key for a custom concurrency value: `<scope>:<entity>:<hash(value)>`.
pub fn concurrency_key(scope: ConcurrencyScope, entity_id: Uuid, evaluated: &str) -> String {
    format!("{}:{}:{}", scope.prefix(), entity_id, hash_id(evaluated))
}

/// A custom concurrency key evaluated for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomConcurrency {
    /// Canonical key from [`concurrency_key`]
    #[serde(rename = "k")]
    pub key: String,
    /// Hash of the key expression that produced this value
    #[serde(rename = "h")]
    pub hash: String,
    #[serde(rename = "l")]
    pub limit: i64,
    #[serde(rename = "uv", default, skip_serializing_if = "String::is_empty")]
    pub unhashed_value: String,
}

impl CustomConcurrency {
    pub fn new(scope: ConcurrencyScope, entity_id: Uuid, expr: &str, value: &str, limit: i64) -> Self {
        let mut unhashed = value.to_string();
        unhashed.truncate(UNHASHED_VALUE_MAX);
        Self {
            key: concurrency_key(scope, entity_id, value),
            hash: expression_hash(expr),
            limit,
            unhashed_value: unhashed,
        }
    }

    /// Split the canonical key into scope, entity and value checksum.
    pub fn parse_key(&self) -> Option<(ConcurrencyScope, Uuid, String)> {
        let mut parts = self.key.splitn(3, ':');
        let scope = ConcurrencyScope::from_prefix(parts.next()?)?;
        let entity = Uuid::parse_str(parts.next()?).ok()?;
        let checksum = parts.next()?.to_string();
        Some((scope, entity, checksum))
    }
}

/// GCRA throttle parameters carried on start items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Throttle {
    /// Hashed throttle key; the hashed function id when no expression is set
    #[serde(rename = "k")]
    pub key: String,
    #[serde(rename = "l")]
    pub limit: i64,
    #[serde(rename = "b")]
    pub burst: i64,
    /// Period in seconds
    #[serde(rename = "p")]
    pub period_s: i64,
    #[serde(rename = "keh", default)]
    pub key_expression_hash: String,
    #[serde(skip)]
    pub unhashed_key: String,
}

impl Throttle {
    /// Throttle for `function_id`, optionally keyed by an evaluated expression.
    pub fn new(
        function_id: Uuid,
        limit: i64,
        burst: i64,
        period_s: i64,
        key: Option<(&str, &str)>,
    ) -> Self {
        let mut hashed = hash_id(&function_id.to_string());
        let mut unhashed = function_id.to_string();
        let mut expr = "";
        if let Some((expression, value)) = key {
            hashed = format!("{}-{}", hashed, hash_id(value));
            unhashed = value.to_string();
            expr = expression;
        }
        Self {
            key: hashed,
            limit,
            burst,
            period_s,
            key_expression_hash: expression_hash(expr),
            unhashed_key: unhashed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SingletonMode {
    #[default]
    Skip,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Singleton {
    #[serde(rename = "k")]
    pub key: String,
    #[serde(rename = "m", default)]
    pub mode: SingletonMode,
}

/// Identifies the run an item belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "wID")]
    pub workflow_id: Uuid,
    #[serde(rename = "wv", default)]
    pub workflow_version: i64,
    /// Time-sortable; its timestamp is the run's start time
    #[serde(rename = "runID", default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Ulid>,
    #[serde(rename = "aID")]
    pub account_id: Uuid,
    #[serde(rename = "eID")]
    pub env_id: Uuid,
    #[serde(rename = "pf", default, skip_serializing_if = "Option::is_none")]
    pub priority_factor: Option<i64>,
    #[serde(rename = "cck", default, skip_serializing_if = "Vec::is_empty")]
    pub custom_concurrency_keys: Vec<CustomConcurrency>,
}

/// Payload of a `job-promote` system item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotePayload {
    /// Item id to promote
    #[serde(rename = "sjid")]
    pub promote_job_id: String,
    /// Original time of the promoted item
    #[serde(rename = "su")]
    pub scheduled_at_ms: i64,
}

/// The enqueued work description.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Item {
    /// Unhashed job id used for idempotency when supplied
    #[serde(rename = "jid", default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(rename = "groupID", default, skip_serializing_if = "String::is_empty")]
    pub group_id: String,
    #[serde(rename = "wsID", default)]
    pub workspace_id: Uuid,
    pub kind: String,
    #[serde(default)]
    pub identifier: Identifier,
    /// Zero-indexed attempt counter
    #[serde(rename = "atts", default)]
    pub attempt: u32,
    #[serde(rename = "maxAtts", default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(rename = "qn", default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<Throttle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub singleton: Option<Singleton>,
    #[serde(rename = "cck", default, skip_serializing_if = "Vec::is_empty")]
    pub custom_concurrency_keys: Vec<CustomConcurrency>,
    /// Seconds to pull the item earlier, within [-600, 600]
    #[serde(rename = "pf", default, skip_serializing_if = "Option::is_none")]
    pub priority_factor: Option<i64>,
}

impl Item {
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }

    /// Identifier keys win over item keys when both are set.
    pub fn concurrency_keys(&self) -> &[CustomConcurrency] {
        if !self.identifier.custom_concurrency_keys.is_empty() {
            return &self.identifier.custom_concurrency_keys;
        }
        &self.custom_concurrency_keys
    }

    /// Priority factor in milliseconds; only start and edge kinds carry one.
    pub fn priority_factor_ms(&self) -> i64 {
        match self.kind.as_str() {
            KIND_START | KIND_EDGE | KIND_EDGE_ERROR => {
                let factor = self
                    .priority_factor
                    .or(self.identifier.priority_factor)
                    .unwrap_or(0);
                factor.clamp(PRIORITY_FACTOR_MIN_S, PRIORITY_FACTOR_MAX_S) * 1_000
            }
            _ => 0,
        }
    }

    pub fn is_step_kind(&self) -> bool {
        matches!(
            self.kind.as_str(),
            KIND_START | KIND_EDGE | KIND_SLEEP | KIND_EDGE_ERROR
        )
    }

    pub fn promote_payload(&self) -> Option<PromotePayload> {
        if self.kind != KIND_JOB_PROMOTE {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// Token from an external capacity provider authorizing one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityLease {
    #[serde(rename = "l")]
    pub lease_id: Ulid,
}

/// An item as stored in the queue, with scheduling bookkeeping.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    /// First peek that could not lease the item, for sojourn latency
    #[serde(rename = "pt", default, skip_serializing_if = "is_zero")]
    pub earliest_peek_time_ms: i64,
    #[serde(rename = "at")]
    pub at_ms: i64,
    /// Intended wall time, only for latency accounting
    #[serde(rename = "wt", default)]
    pub wall_time_ms: i64,
    #[serde(rename = "wfID", default)]
    pub function_id: Uuid,
    #[serde(rename = "wsID", default)]
    pub workspace_id: Uuid,
    /// Embeds the lease expiry; absent when not leased
    #[serde(rename = "leaseID", default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<LeaseId>,
    pub data: Item,
    #[serde(rename = "queueID", default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    #[serde(rename = "ip", default, skip_serializing_if = "Option::is_none")]
    pub idempotency_period_ms: Option<i64>,
    #[serde(rename = "rf", default, skip_serializing_if = "Option::is_none")]
    pub refilled_from: Option<String>,
    #[serde(rename = "rat", default, skip_serializing_if = "is_zero")]
    pub refilled_at_ms: i64,
    #[serde(rename = "eat", default)]
    pub enqueued_at_ms: i64,
    #[serde(rename = "cl", default, skip_serializing_if = "Option::is_none")]
    pub capacity_lease: Option<CapacityLease>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl QueueItem {
    pub fn set_id(&mut self, raw: &str) {
        self.id = hash_id(raw);
    }

    /// Partition this item runs in: the queue name for system items, else the function id.
    pub fn partition_id(&self) -> String {
        match &self.queue_name {
            Some(q) => q.clone(),
            None => self.function_id.to_string(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.queue_name.is_some()
    }

    pub fn is_leased(&self, now_ms: i64) -> bool {
        self.lease_id
            .map(|l| l.timestamp_ms() > now_ms)
            .unwrap_or(false)
    }

    pub fn is_promotable_score(&self) -> bool {
        matches!(
            self.data.kind.as_str(),
            KIND_START | KIND_SLEEP | KIND_EDGE | KIND_PAUSE | KIND_EDGE_ERROR
        )
    }

    /// True for user items far enough in the future to need a promotion job.
    pub fn requires_promotion_job(&self, now_ms: i64) -> bool {
        self.is_promotable_score() && self.at_ms > now_ms + FUTURE_AT_LIMIT_MS
    }

    /// Index score: run start minus priority factor for near-term user work.
    pub fn score(&self, now_ms: i64) -> i64 {
        if !self.is_promotable_score() || self.requires_promotion_job(now_ms) {
            return self.at_ms;
        }
        let start = self
            .data
            .identifier
            .run_id
            .map(|r| r.timestamp_ms())
            .unwrap_or(0);
        if start == 0 {
            return self.at_ms;
        }
        start - self.data.priority_factor_ms()
    }

    /// Delay the producer asked for, never negative.
    pub fn expected_delay_ms(&self) -> i64 {
        if self.enqueued_at_ms == 0 {
            return 0;
        }
        (self.at_ms - self.enqueued_at_ms).max(0)
    }

    /// Time from enqueue to refill, minus the expected delay.
    pub fn refill_delay_ms(&self) -> i64 {
        if self.refilled_at_ms == 0 || self.enqueued_at_ms == 0 {
            return 0;
        }
        self.refilled_at_ms - self.enqueued_at_ms - self.expected_delay_ms()
    }

    pub fn sojourn_latency_ms(&self, now_ms: i64) -> i64 {
        if self.refilled_at_ms == 0 {
            if self.earliest_peek_time_ms > 0 {
                return now_ms - self.earliest_peek_time_ms;
            }
            return 0;
        }
        self.refill_delay_ms() + self.expected_delay_ms()
    }

    /// Processing delay excluding sojourn.
    pub fn latency_ms(&self, now_ms: i64) -> i64 {
        if self.refilled_at_ms == 0 {
            return (now_ms - self.wall_time_ms) - self.sojourn_latency_ms(now_ms);
        }
        now_ms - self.refilled_at_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge_item(at_ms: i64, run_start_ms: i64, pf: Option<i64>) -> QueueItem {
        QueueItem {
            at_ms,
            data: Item {
                kind: KIND_EDGE.to_string(),
                identifier: Identifier {
                    run_id: Some(Ulid::from_parts(run_start_ms, 1)),
                    ..Default::default()
                },
                priority_factor: pf,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn hash_id_is_stable_and_short() {
        assert_eq!(hash_id("job-1"), hash_id("job-1"));
        assert_ne!(hash_id("job-1"), hash_id("job-2"));
        assert!(hash_id("job-1").len() <= 13);
    }

    #[test]
    fn score_uses_run_start_minus_priority() {
        let now = 100_000;
        let item = edge_item(now, 50_000, Some(10));
        assert_eq!(item.score(now), 50_000 - 10_000);
    }

    #[test]
    fn score_clamps_priority_factor() {
        let now = 10_000_000;
        let item = edge_item(now, 5_000_000, Some(10_000));
        assert_eq!(item.score(now), 5_000_000 - 600_000);
    }

    #[test]
    fn far_future_items_keep_their_time() {
        let now = 100_000;
        let item = edge_item(now + 10_000, 50_000, None);
        assert!(item.requires_promotion_job(now));
        assert_eq!(item.score(now), now + 10_000);
    }

    #[test]
    fn system_kinds_are_not_promotable() {
        let mut item = edge_item(5, 1, None);
        item.data.kind = KIND_CRON.to_string();
        assert!(!item.is_promotable_score());
        assert_eq!(item.score(0), 5);
    }

    #[test]
    fn latency_without_refill_subtracts_sojourn() {
        let item = QueueItem {
            wall_time_ms: 1_000,
            earliest_peek_time_ms: 1_500,
            ..Default::default()
        };
        assert_eq!(item.sojourn_latency_ms(2_000), 500);
        assert_eq!(item.latency_ms(2_000), 500);
    }

    #[test]
    fn latency_after_refill_counts_from_refill() {
        let item = QueueItem {
            enqueued_at_ms: 1_000,
            at_ms: 1_200,
            refilled_at_ms: 1_700,
            ..Default::default()
        };
        assert_eq!(item.expected_delay_ms(), 200);
        assert_eq!(item.refill_delay_ms(), 500);
        assert_eq!(item.sojourn_latency_ms(2_000), 700);
        assert_eq!(item.latency_ms(2_000), 300);
    }

    #[test]
    fn parse_custom_key() {
        let entity = Uuid::new_v4();
        let key = CustomConcurrency::new(ConcurrencyScope::Account, entity, "event.data.id", "c1", 3);
        let (scope, id, checksum) = key.parse_key().unwrap();
        assert_eq!(scope, ConcurrencyScope::Account);
        assert_eq!(id, entity);
        assert_eq!(checksum, hash_id("c1"));
    }
}
