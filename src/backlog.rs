//! Shadow partitions and their backlogs.
//!
//! A backlog id fingerprints the constraint keys of the items it holds, so the
//! same item always maps to the same backlog for as long as it lives:
//! - `fn:<function_id>` for plain function items
//! - `:start` is appended for run-start items
//! - `:t<expr_hash:key>` is appended for throttled start items
//! - `:c<n><expr_hash:value_hash>` is appended per custom concurrency key
//! - `system:<queue_name>` for system queues

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constraints::QueueConstraint;
use crate::item::{hash_id, ConcurrencyMode, ConcurrencyScope, QueueItem, KIND_START};
use crate::keys::{KeyGenerator, SetScope};
use crate::partition::{
    CustomConcurrencyLimit, PartitionConstraintConfig, ShadowPartitionConcurrency,
    ShadowPartitionThrottle,
};
use crate::ulid::LeaseId;

pub const BACKLOG_REFILL_HARD_LIMIT: usize = 1_000;
pub const BACKLOG_FORCE_REQUEUE_MAX_BACKOFF_MS: i64 = 5 * 60_000;
/// Requeue delay for a backlog hit by something other than a custom key or throttle.
pub const BACKLOG_DEFAULT_REQUEUE_EXTENSION_MS: i64 = 2_000;
/// Cap on the custom-key backoff.
pub const BACKLOG_CUSTOM_KEY_MAX_BACKOFF_MS: i64 = 5_000;

const RAW_VALUE_MAX: usize = 512;

/// One custom concurrency key of a backlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogConcurrencyKey {
    /// e.g. `a:<account>:<hash(value)>`
    #[serde(rename = "kid")]
    pub canonical_key_id: String,
    #[serde(rename = "cs")]
    pub scope: ConcurrencyScope,
    #[serde(rename = "cse")]
    pub entity_id: Uuid,
    #[serde(rename = "cke")]
    pub hashed_key_expression: String,
    #[serde(rename = "ckv")]
    pub hashed_value: String,
    #[serde(rename = "ckuv", default, skip_serializing_if = "String::is_empty")]
    pub unhashed_value: String,
    #[serde(rename = "mode", default)]
    pub mode: ConcurrencyMode,
}

impl BacklogConcurrencyKey {
    pub fn in_progress_key(&self, kg: &KeyGenerator) -> String {
        kg.in_progress(SetScope::Custom, &self.canonical_key_id)
    }

    pub fn active_key(&self, kg: &KeyGenerator) -> String {
        kg.active_set(SetScope::Custom, &self.canonical_key_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacklogThrottle {
    #[serde(rename = "tk")]
    pub throttle_key: String,
    #[serde(rename = "tkv", default, skip_serializing_if = "String::is_empty")]
    pub throttle_key_raw_value: String,
    #[serde(rename = "tkh", default, skip_serializing_if = "String::is_empty")]
    pub throttle_key_expression_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueBacklog {
    #[serde(rename = "id")]
    pub backlog_id: String,
    #[serde(rename = "sid")]
    pub shadow_partition_id: String,
    #[serde(rename = "fv", default)]
    pub earliest_function_version: i64,
    #[serde(default)]
    pub start: bool,
    #[serde(rename = "ck", default, skip_serializing_if = "Vec::is_empty")]
    pub concurrency_keys: Vec<BacklogConcurrencyKey>,
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<BacklogThrottle>,
    #[serde(rename = "stc", default)]
    pub successive_throttle_constrained: i64,
    #[serde(rename = "sccc", default)]
    pub successive_custom_concurrency_constrained: i64,
    /// Held while the backlog is being normalized
    #[serde(rename = "nl", default, skip_serializing_if = "Option::is_none")]
    pub normalize_lease_id: Option<LeaseId>,
}

/// Why a backlog no longer matches its function's constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeReason {
    Unchanged,
    ThrottleRemoved,
    ThrottleKeyChanged,
    CustomConcurrencyKeyCountMismatch,
    CustomConcurrencyKeyNotFound,
}

impl NormalizeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NormalizeReason::Unchanged => "unchanged",
            NormalizeReason::ThrottleRemoved => "throttle_removed",
            NormalizeReason::ThrottleKeyChanged => "throttle_key_changed",
            NormalizeReason::CustomConcurrencyKeyCountMismatch => "custom_key_count_mismatch",
            NormalizeReason::CustomConcurrencyKeyNotFound => "custom_key_not_found",
        }
    }
}

impl QueueBacklog {
    pub fn is_default(&self) -> bool {
        self.throttle.is_none() && self.concurrency_keys.is_empty()
    }

    pub fn is_outdated(&self, constraints: &PartitionConstraintConfig) -> NormalizeReason {
        // constraints must never be older than the items they judge
        if self.earliest_function_version > 0
            && constraints.function_version > 0
            && self.earliest_function_version > constraints.function_version
        {
            return NormalizeReason::Unchanged;
        }

        // default backlogs never carry keys, so added keys do not apply to them
        if self.is_default() {
            return NormalizeReason::Unchanged;
        }

        match (&self.throttle, &constraints.throttle) {
            (Some(_), None) => return NormalizeReason::ThrottleRemoved,
            (Some(b), Some(c)) if b.throttle_key_expression_hash != c.key_expression_hash => {
                return NormalizeReason::ThrottleKeyChanged
            }
            _ => {}
        }

        let configured = &constraints.concurrency.custom_concurrency_keys;
        if self.concurrency_keys.len() != configured.len() {
            return NormalizeReason::CustomConcurrencyKeyCountMismatch;
        }

        let all_found = self.concurrency_keys.iter().all(|bk| {
            configured.iter().any(|ck| {
                ck.mode == bk.mode
                    && ck.scope == bk.scope
                    && ck.hashed_key_expression == bk.hashed_key_expression
            })
        });
        if !all_found {
            return NormalizeReason::CustomConcurrencyKeyNotFound;
        }

        NormalizeReason::Unchanged
    }

    /// Latest limit for custom key `n` (1-based), matched by scope and expression.
    pub fn custom_key_limit(&self, n: usize, constraints: &PartitionConstraintConfig) -> Option<i64> {
        let key = self.concurrency_keys.get(n.checked_sub(1)?)?;
        constraints.custom_limit(key.scope, &key.hashed_key_expression)
    }

    /// When to look at this backlog again after a constrained refill.
    pub fn requeue_backoff_ms(&self, now_ms: i64, constraint: QueueConstraint, retry_at_ms: i64) -> i64 {
        match constraint {
            QueueConstraint::CustomConcurrencyKey1 | QueueConstraint::CustomConcurrencyKey2 => {
                let next = (self.successive_custom_concurrency_constrained * 1_000)
                    .clamp(0, BACKLOG_CUSTOM_KEY_MAX_BACKOFF_MS);
                now_ms + next
            }
            QueueConstraint::Throttle if retry_at_ms > now_ms => {
                retry_at_ms.min(now_ms + BACKLOG_FORCE_REQUEUE_MAX_BACKOFF_MS)
            }
            _ => now_ms + BACKLOG_DEFAULT_REQUEUE_EXTENSION_MS,
        }
    }
}

/// Derive the backlog of an item from the item alone.
pub fn item_backlog(item: &QueueItem) -> QueueBacklog {
    if let Some(queue_name) = &item.queue_name {
        return QueueBacklog {
            backlog_id: format!("system:{}", queue_name),
            shadow_partition_id: queue_name.clone(),
            ..Default::default()
        };
    }

    let start = item.data.kind == KIND_START;
    let mut b = QueueBacklog {
        backlog_id: format!("fn:{}", item.function_id),
        shadow_partition_id: item.function_id.to_string(),
        earliest_function_version: item.data.identifier.workflow_version,
        start,
        ..Default::default()
    };
    if start {
        b.backlog_id.push_str(":start");
    }

    if let (Some(t), true) = (&item.data.throttle, start) {
        let mut raw = t.unhashed_key.clone();
        raw.truncate(RAW_VALUE_MAX);
        b.backlog_id
            .push_str(&format!(":t<{}:{}>", t.key_expression_hash, t.key));
        b.throttle = Some(BacklogThrottle {
            throttle_key: t.key.clone(),
            throttle_key_raw_value: raw,
            throttle_key_expression_hash: t.key_expression_hash.clone(),
        });
    }

    for (i, key) in item.data.concurrency_keys().iter().enumerate() {
        b.backlog_id
            .push_str(&format!(":c{}<{}:{}>", i + 1, key.hash, hash_id(&key.key)));
        let (scope, entity_id, checksum) = key
            .parse_key()
            .unwrap_or((ConcurrencyScope::Function, item.function_id, String::new()));
        b.concurrency_keys.push(BacklogConcurrencyKey {
            canonical_key_id: key.key.clone(),
            scope,
            entity_id,
            hashed_key_expression: key.hash.clone(),
            hashed_value: checksum,
            unhashed_value: key.unhashed_value.clone(),
            mode: ConcurrencyMode::Step,
        });
    }

    b
}

/// Shadow twin of a partition, holding backlogs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueShadowPartition {
    /// Same id as the runnable partition
    #[serde(rename = "id")]
    pub partition_id: String,
    #[serde(rename = "fv", default)]
    pub function_version: i64,
    #[serde(rename = "leaseID", default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<LeaseId>,
    #[serde(rename = "fid", default, skip_serializing_if = "Option::is_none")]
    pub function_id: Option<Uuid>,
    #[serde(rename = "eid", default, skip_serializing_if = "Option::is_none")]
    pub env_id: Option<Uuid>,
    #[serde(rename = "aid", default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<Uuid>,
    #[serde(rename = "queueName", default, skip_serializing_if = "Option::is_none")]
    pub system_queue_name: Option<String>,
    #[serde(rename = "c", default)]
    pub concurrency: ShadowPartitionConcurrency,
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<ShadowPartitionThrottle>,
    #[serde(rename = "norefill", default)]
    pub pause_refill: bool,
    #[serde(rename = "noenqueue", default)]
    pub pause_enqueue: bool,
}

impl QueueShadowPartition {
    pub fn account_id(&self) -> Uuid {
        self.account_id.unwrap_or(Uuid::nil())
    }

    pub fn is_system(&self) -> bool {
        self.system_queue_name.is_some()
    }

    pub fn ready_queue_key(&self, kg: &KeyGenerator) -> String {
        kg.partition_queue_set(&self.partition_id)
    }

    pub fn in_progress_key(&self, kg: &KeyGenerator) -> String {
        kg.in_progress(SetScope::Partition, &self.partition_id)
    }

    pub fn active_key(&self, kg: &KeyGenerator) -> String {
        kg.active_set(SetScope::Partition, &self.partition_id)
    }

    /// None for system queues, which are not counted against an account.
    pub fn account_in_progress_key(&self, kg: &KeyGenerator) -> Option<String> {
        if self.is_system() {
            return None;
        }
        Some(kg.in_progress(SetScope::Account, &self.account_id().to_string()))
    }

    pub fn account_active_key(&self, kg: &KeyGenerator) -> Option<String> {
        if self.is_system() {
            return None;
        }
        Some(kg.active_set(SetScope::Account, &self.account_id().to_string()))
    }

    /// The constraints this shadow partition currently carries.
    pub fn constraints(&self) -> PartitionConstraintConfig {
        PartitionConstraintConfig {
            function_version: self.function_version,
            concurrency: self.concurrency.clone(),
            throttle: self.throttle.clone(),
        }
    }

    /// Default backlog for non-start function items.
    pub fn default_backlog(&self, start: bool) -> Option<QueueBacklog> {
        if self.is_system() {
            let queue = self.system_queue_name.as_ref()?;
            return Some(QueueBacklog {
                backlog_id: format!("system:{}", queue),
                shadow_partition_id: self.partition_id.clone(),
                ..Default::default()
            });
        }
        let fid = self.function_id?;
        let mut id = format!("fn:{}", fid);
        if start {
            id.push_str(":start");
        }
        Some(QueueBacklog {
            backlog_id: id,
            shadow_partition_id: self.partition_id.clone(),
            start,
            ..Default::default()
        })
    }
}

/// Derive the shadow partition of an item, stamped with the latest constraints.
pub fn item_shadow_partition(
    item: &QueueItem,
    constraints: &PartitionConstraintConfig,
) -> QueueShadowPartition {
    let account_id = item.data.identifier.account_id;
    if let Some(queue_name) = &item.queue_name {
        return QueueShadowPartition {
            partition_id: queue_name.clone(),
            system_queue_name: Some(queue_name.clone()),
            account_id: (!account_id.is_nil()).then_some(account_id),
            concurrency: ShadowPartitionConcurrency {
                system_concurrency: constraints.concurrency.system_concurrency,
                ..Default::default()
            },
            ..Default::default()
        };
    }

    // keep limits from the latest constraints but key shape from the item
    let custom: Vec<CustomConcurrencyLimit> = item
        .data
        .concurrency_keys()
        .iter()
        .map(|k| {
            let scope = k
                .parse_key()
                .map(|(s, _, _)| s)
                .unwrap_or(ConcurrencyScope::Function);
            CustomConcurrencyLimit {
                mode: ConcurrencyMode::Step,
                scope,
                hashed_key_expression: k.hash.clone(),
                limit: constraints.custom_limit(scope, &k.hash).unwrap_or(k.limit),
            }
        })
        .collect();

    let throttle = item
        .data
        .throttle
        .as_ref()
        .map(|t| ShadowPartitionThrottle {
            key_expression_hash: t.key_expression_hash.clone(),
            limit: t.limit,
            burst: t.burst,
            period_s: t.period_s,
        });

    QueueShadowPartition {
        partition_id: item.function_id.to_string(),
        function_version: item.data.identifier.workflow_version,
        function_id: Some(item.function_id),
        env_id: Some(item.data.identifier.env_id),
        account_id: Some(account_id),
        concurrency: ShadowPartitionConcurrency {
            account_concurrency: constraints.concurrency.account_concurrency,
            function_concurrency: constraints.concurrency.function_concurrency,
            function_run_concurrency: constraints.concurrency.function_run_concurrency,
            custom_concurrency_keys: custom,
            ..Default::default()
        },
        throttle,
        ..Default::default()
    }
}

/// Weighted shuffle without replacement: non-start backlogs weigh 10, start backlogs 1.
pub fn shuffle_backlogs<R: Rng + ?Sized>(backlogs: Vec<QueueBacklog>, rng: &mut R) -> Vec<QueueBacklog> {
    let mut pool: Vec<(f64, QueueBacklog)> = backlogs
        .into_iter()
        .map(|b| (if b.start { 1.0 } else { 10.0 }, b))
        .collect();
    let mut out = Vec::with_capacity(pool.len());
    while !pool.is_empty() {
        let total: f64 = pool.iter().map(|(w, _)| w).sum();
        let mut pick = rng.random::<f64>() * total;
        let mut idx = pool.len() - 1;
        for (i, (w, _)) in pool.iter().enumerate() {
            if pick < *w {
                idx = i;
                break;
            }
            pick -= w;
        }
        out.push(pool.swap_remove(idx).1);
    }
    out
}

/// How many refill passes a backlog gets in one shadow partition pass.
pub fn backlog_refill_multiplier(
    backlogs: &[QueueBacklog],
    backlog: &QueueBacklog,
    constraints: &PartitionConstraintConfig,
) -> usize {
    if backlog.is_default()
        && constraints.throttle.is_some()
        && constraints.concurrency.custom_concurrency_keys.is_empty()
    {
        return backlogs.len().max(1);
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{CustomConcurrency, Identifier, Item, Throttle, KIND_EDGE};

    fn fn_item(kind: &str) -> QueueItem {
        QueueItem {
            function_id: Uuid::from_u128(1),
            data: Item {
                kind: kind.to_string(),
                identifier: Identifier {
                    account_id: Uuid::from_u128(2),
                    env_id: Uuid::from_u128(3),
                    workflow_version: 1,
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn throttle() -> Throttle {
        Throttle::new(Uuid::from_u128(1), 2, 0, 60, Some(("event.data.k", "k1")))
    }

    fn custom_key(n: u128) -> CustomConcurrency {
        CustomConcurrency::new(ConcurrencyScope::Function, Uuid::from_u128(1), &format!("expr{n}"), "v", 1)
    }

    #[test]
    fn default_backlog_ids() {
        let edge = item_backlog(&fn_item(KIND_EDGE));
        assert_eq!(edge.backlog_id, format!("fn:{}", Uuid::from_u128(1)));
        assert!(edge.is_default());
        let start = item_backlog(&fn_item(KIND_START));
        assert_eq!(start.backlog_id, format!("fn:{}:start", Uuid::from_u128(1)));
        assert!(start.start);
    }

    #[test]
    fn throttle_applies_to_start_items_only() {
        let mut start = fn_item(KIND_START);
        start.data.throttle = Some(throttle());
        let mut edge = fn_item(KIND_EDGE);
        edge.data.throttle = Some(throttle());

        let t = throttle();
        let b = item_backlog(&start);
        assert!(b
            .backlog_id
            .ends_with(&format!(":start:t<{}:{}>", t.key_expression_hash, t.key)));
        assert!(item_backlog(&edge).is_default());
    }

    #[test]
    fn custom_keys_are_numbered() {
        let mut item = fn_item(KIND_EDGE);
        item.data.custom_concurrency_keys = vec![custom_key(1), custom_key(2)];
        let b = item_backlog(&item);
        let k1 = custom_key(1);
        let k2 = custom_key(2);
        let expected = format!(
            "fn:{}:c1<{}:{}>:c2<{}:{}>",
            Uuid::from_u128(1),
            k1.hash,
            hash_id(&k1.key),
            k2.hash,
            hash_id(&k2.key)
        );
        assert_eq!(b.backlog_id, expected);
        assert_eq!(b.concurrency_keys.len(), 2);
        assert_eq!(b.concurrency_keys[0].scope, ConcurrencyScope::Function);
    }

    #[test]
    fn backlog_id_is_stable() {
        let mut item = fn_item(KIND_START);
        item.data.throttle = Some(throttle());
        item.data.custom_concurrency_keys = vec![custom_key(1)];
        assert_eq!(item_backlog(&item), item_backlog(&item.clone()));
    }

    #[test]
    fn system_backlog() {
        let mut item = fn_item(KIND_EDGE);
        item.queue_name = Some("cron".into());
        let b = item_backlog(&item);
        assert_eq!(b.backlog_id, "system:cron");
        assert_eq!(b.shadow_partition_id, "cron");
    }

    #[test]
    fn outdated_reasons() {
        let mut item = fn_item(KIND_START);
        item.data.throttle = Some(throttle());
        let b = item_backlog(&item);

        let none = PartitionConstraintConfig {
            function_version: 2,
            ..Default::default()
        };
        assert_eq!(b.is_outdated(&none), NormalizeReason::ThrottleRemoved);

        let changed = PartitionConstraintConfig {
            function_version: 2,
            throttle: Some(ShadowPartitionThrottle {
                key_expression_hash: "other".into(),
                limit: 1,
                burst: 0,
                period_s: 60,
            }),
            ..Default::default()
        };
        assert_eq!(b.is_outdated(&changed), NormalizeReason::ThrottleKeyChanged);

        // constraints older than the backlog are never applied
        let older = PartitionConstraintConfig {
            function_version: 0,
            ..Default::default()
        };
        let mut newer = b.clone();
        newer.earliest_function_version = 3;
        let stale = PartitionConstraintConfig {
            function_version: 2,
            ..older
        };
        assert_eq!(newer.is_outdated(&stale), NormalizeReason::Unchanged);
    }

    #[test]
    fn custom_key_mismatch() {
        let mut item = fn_item(KIND_EDGE);
        item.data.custom_concurrency_keys = vec![custom_key(1)];
        let b = item_backlog(&item);

        let none = PartitionConstraintConfig::default();
        assert_eq!(
            b.is_outdated(&none),
            NormalizeReason::CustomConcurrencyKeyCountMismatch
        );

        let mut other = PartitionConstraintConfig::default();
        other.concurrency.custom_concurrency_keys = vec![CustomConcurrencyLimit {
            mode: ConcurrencyMode::Step,
            scope: ConcurrencyScope::Function,
            hashed_key_expression: custom_key(2).hash,
            limit: 1,
        }];
        assert_eq!(
            b.is_outdated(&other),
            NormalizeReason::CustomConcurrencyKeyNotFound
        );

        other.concurrency.custom_concurrency_keys[0].hashed_key_expression = custom_key(1).hash;
        assert_eq!(b.is_outdated(&other), NormalizeReason::Unchanged);
    }

    #[test]
    fn default_backlog_is_never_outdated() {
        let b = item_backlog(&fn_item(KIND_EDGE));
        let mut c = PartitionConstraintConfig::default();
        c.throttle = Some(ShadowPartitionThrottle::default());
        assert_eq!(b.is_outdated(&c), NormalizeReason::Unchanged);
    }

    #[test]
    fn custom_key_backoff_is_capped() {
        let mut b = QueueBacklog {
            successive_custom_concurrency_constrained: 2,
            ..Default::default()
        };
        assert_eq!(
            b.requeue_backoff_ms(0, QueueConstraint::CustomConcurrencyKey1, 0),
            2_000
        );
        b.successive_custom_concurrency_constrained = 60;
        assert_eq!(
            b.requeue_backoff_ms(0, QueueConstraint::CustomConcurrencyKey2, 0),
            5_000
        );
        assert_eq!(
            b.requeue_backoff_ms(0, QueueConstraint::Throttle, 10 * 60_000),
            BACKLOG_FORCE_REQUEUE_MAX_BACKOFF_MS
        );
    }

    #[test]
    fn shuffle_keeps_every_backlog() {
        let backlogs: Vec<QueueBacklog> = (0..6)
            .map(|i| QueueBacklog {
                backlog_id: format!("b{i}"),
                start: i % 2 == 0,
                ..Default::default()
            })
            .collect();
        let mut rng = rand::rng();
        let mut shuffled = shuffle_backlogs(backlogs.clone(), &mut rng);
        shuffled.sort_by(|a, b| a.backlog_id.cmp(&b.backlog_id));
        assert_eq!(shuffled, backlogs);
    }

    #[test]
    fn multiplier_boosts_default_backlog_under_throttle() {
        let default = QueueBacklog::default();
        let throttled = QueueBacklog {
            throttle: Some(BacklogThrottle {
                throttle_key: "k".into(),
                throttle_key_raw_value: String::new(),
                throttle_key_expression_hash: String::new(),
            }),
            ..Default::default()
        };
        let all = vec![default.clone(), throttled.clone(), throttled.clone()];
        let mut c = PartitionConstraintConfig::default();
        assert_eq!(backlog_refill_multiplier(&all, &default, &c), 1);
        c.throttle = Some(ShadowPartitionThrottle::default());
        assert_eq!(backlog_refill_multiplier(&all, &default, &c), 3);
        assert_eq!(backlog_refill_multiplier(&all, &throttled, &c), 1);
    }
}
