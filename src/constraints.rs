//! Constraint evaluation.
//!
//! Local checks run inside store scripts against the in-progress and active
//! sets. Leasing counts unexpired in-progress entries; refilling counts active
//! entries. Throttles use GCRA with the theoretical arrival time stored under
//! the throttle key. A [`ConstraintApi`] can take over check-and-reserve and
//! hand out capacity leases instead.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::backlog::{QueueBacklog, QueueShadowPartition};
use crate::error::QueueError;
use crate::item::QueueItem;
use crate::keys::KeyGenerator;
use crate::partition::{is_unbounded, PartitionConstraintConfig};
use crate::store::{Keyspace, StoreError};
use crate::ulid::Ulid;

/// Which constraint limited an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueueConstraint {
    #[default]
    NotLimited,
    AccountConcurrency,
    FunctionConcurrency,
    CustomConcurrencyKey1,
    CustomConcurrencyKey2,
    Throttle,
}

impl QueueConstraint {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueConstraint::NotLimited => "not_limited",
            QueueConstraint::AccountConcurrency => "account_concurrency",
            QueueConstraint::FunctionConcurrency => "function_concurrency",
            QueueConstraint::CustomConcurrencyKey1 => "custom_concurrency_key_1",
            QueueConstraint::CustomConcurrencyKey2 => "custom_concurrency_key_2",
            QueueConstraint::Throttle => "throttle",
        }
    }

    /// Account and function limits affect the whole shadow partition.
    pub fn is_partition_wide(&self) -> bool {
        matches!(
            self,
            QueueConstraint::AccountConcurrency | QueueConstraint::FunctionConcurrency
        )
    }

    pub fn is_custom_key(&self) -> bool {
        matches!(
            self,
            QueueConstraint::CustomConcurrencyKey1 | QueueConstraint::CustomConcurrencyKey2
        )
    }

    pub fn custom_key(n: usize) -> Self {
        if n == 1 {
            QueueConstraint::CustomConcurrencyKey1
        } else {
            QueueConstraint::CustomConcurrencyKey2
        }
    }
}

/// Outcome of one GCRA evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcraDecision {
    pub allowed: bool,
    /// Theoretical arrival time to store when allowed
    pub new_tat_ms: i64,
    /// Earliest time a request could pass when denied
    pub retry_at_ms: i64,
    /// How long the stored value must live
    pub ttl_ms: i64,
}

/// Generic cell rate algorithm. `limit` requests per `period_ms`, plus `burst`.
pub fn gcra(stored_tat_ms: Option<i64>, now_ms: i64, limit: i64, burst: i64, period_ms: i64) -> GcraDecision {
    let limit = limit.max(1);
    let emission = (period_ms / limit).max(1);
    let tolerance = emission * (limit + burst.max(0));
    let tat = stored_tat_ms.unwrap_or(now_ms).max(now_ms);
    let new_tat = tat + emission;
    let allow_at = new_tat - tolerance;
    if allow_at > now_ms {
        return GcraDecision {
            allowed: false,
            new_tat_ms: tat,
            retry_at_ms: allow_at,
            ttl_ms: tat - now_ms,
        };
    }
    GcraDecision {
        allowed: true,
        new_tat_ms: new_tat,
        retry_at_ms: now_ms,
        ttl_ms: new_tat - now_ms,
    }
}

fn read_tat(ks: &mut Keyspace, key: &str) -> Result<Option<i64>, StoreError> {
    Ok(ks.get(key)?.and_then(|v| v.parse().ok()))
}

/// Evaluate a throttle without consuming a token.
pub fn throttle_peek(
    ks: &mut Keyspace,
    kg: &KeyGenerator,
    throttle_key: &str,
    limit: i64,
    burst: i64,
    period_s: i64,
) -> Result<GcraDecision, StoreError> {
    let key = kg.throttle(throttle_key);
    let tat = read_tat(ks, &key)?;
    Ok(gcra(tat, ks.now_ms(), limit, burst, period_s * 1_000))
}

/// Persist an allowed decision.
pub fn throttle_commit(ks: &mut Keyspace, kg: &KeyGenerator, throttle_key: &str, decision: &GcraDecision) {
    if decision.allowed {
        ks.set_px(
            &kg.throttle(throttle_key),
            decision.new_tat_ms.to_string(),
            decision.ttl_ms.max(1),
        );
    }
}

/// Scope-level limits checked at lease time.
pub struct LeaseCheck<'a> {
    pub kg: &'a KeyGenerator,
    pub item: &'a QueueItem,
    pub shadow: &'a QueueShadowPartition,
    pub backlog: &'a QueueBacklog,
    pub constraints: &'a PartitionConstraintConfig,
}

impl LeaseCheck<'_> {
    fn in_progress(ks: &mut Keyspace, key: &str) -> Result<i64, StoreError> {
        let now = ks.now_ms();
        Ok(ks.zcount(key, now + 1, i64::MAX)? as i64)
    }

    /// Run every check. Returns the throttle decision to commit on success.
    pub fn check(&self, ks: &mut Keyspace) -> Result<Option<(String, GcraDecision)>, QueueError> {
        let mut throttle = None;
        // refilled items already passed the throttle when they left the backlog
        if self.item.refilled_from.is_none() {
            if let (Some(t), Some(cfg)) = (&self.item.data.throttle, &self.constraints.throttle) {
                let decision = throttle_peek(ks, self.kg, &t.key, cfg.limit, cfg.burst, cfg.period_s)?;
                if !decision.allowed {
                    return Err(QueueError::Throttled {
                        key: t.key.clone(),
                        retry_at_ms: decision.retry_at_ms,
                    });
                }
                throttle = Some((t.key.clone(), decision));
            }
        }

        let system = self.shadow.is_system();
        let account_limit = self.constraints.concurrency.account_concurrency;
        if let Some(key) = self.shadow.account_in_progress_key(self.kg) {
            if !is_unbounded(account_limit) && Self::in_progress(ks, &key)? >= account_limit {
                return Err(QueueError::AccountConcurrencyLimit);
            }
        }

        let partition_limit = self.constraints.partition_limit(system);
        if !is_unbounded(partition_limit)
            && Self::in_progress(ks, &self.shadow.in_progress_key(self.kg))? >= partition_limit
        {
            return Err(if system {
                QueueError::SystemConcurrencyLimit
            } else {
                QueueError::PartitionConcurrencyLimit
            });
        }

        for (i, key) in self.backlog.concurrency_keys.iter().enumerate() {
            let Some(limit) = self.backlog.custom_key_limit(i + 1, self.constraints) else {
                continue;
            };
            if !is_unbounded(limit) && Self::in_progress(ks, &key.in_progress_key(self.kg))? >= limit {
                return Err(QueueError::CustomKeyConcurrencyLimit(
                    key.canonical_key_id.clone(),
                ));
            }
        }

        Ok(throttle)
    }
}

/// Remaining room for refills, counted on active sets. `None` means unbounded.
pub fn refill_capacity(
    ks: &mut Keyspace,
    kg: &KeyGenerator,
    shadow: &QueueShadowPartition,
    backlog: &QueueBacklog,
    constraints: &PartitionConstraintConfig,
) -> Result<(Option<i64>, QueueConstraint), StoreError> {
    let mut capacity: Option<i64> = None;
    let mut limiting = QueueConstraint::NotLimited;
    let mut tighten = |room: i64, c: QueueConstraint| match capacity {
        Some(current) if current <= room => {}
        _ => {
            capacity = Some(room.max(0));
            limiting = c;
        }
    };

    if let Some(key) = shadow.account_active_key(kg) {
        let limit = constraints.concurrency.account_concurrency;
        if !is_unbounded(limit) {
            tighten(limit - ks.zcard(&key)? as i64, QueueConstraint::AccountConcurrency);
        }
    }

    let limit = constraints.partition_limit(shadow.is_system());
    if !is_unbounded(limit) {
        tighten(
            limit - ks.zcard(&shadow.active_key(kg))? as i64,
            QueueConstraint::FunctionConcurrency,
        );
    }

    for (i, key) in backlog.concurrency_keys.iter().enumerate() {
        if let Some(limit) = backlog.custom_key_limit(i + 1, constraints) {
            if !is_unbounded(limit) {
                tighten(
                    limit - ks.zcard(&key.active_key(kg))? as i64,
                    QueueConstraint::custom_key(i + 1),
                );
            }
        }
    }

    Ok((capacity, limiting))
}

/// Capacity request sent to an external constraint service.
#[derive(Debug, Clone)]
pub struct CapacityRequest {
    pub account_id: Uuid,
    pub env_id: Uuid,
    pub function_id: Option<Uuid>,
    pub constraints: PartitionConstraintConfig,
    pub item_ids: Vec<String>,
    pub throttle_key: Option<String>,
    pub custom_keys: Vec<String>,
    pub now_ms: i64,
    pub lease_duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityGrant {
    pub item_id: String,
    pub lease_id: Ulid,
}

#[derive(Debug, Clone, Default)]
pub struct CapacityResponse {
    pub granted_leases: Vec<CapacityGrant>,
    pub limiting_constraints: Vec<QueueConstraint>,
    pub retry_after_ms: i64,
    /// Capacity is tracked by the service; skip local checks and updates
    pub skip_constraint_checks: bool,
}

impl CapacityResponse {
    pub fn lease_for(&self, item_id: &str) -> Option<Ulid> {
        self.granted_leases
            .iter()
            .find(|g| g.item_id == item_id)
            .map(|g| g.lease_id)
    }
}

/// External capacity provider.
#[async_trait]
pub trait ConstraintApi: Send + Sync {
    async fn backlog_refill_constraint_check(
        &self,
        req: &CapacityRequest,
    ) -> Result<CapacityResponse, QueueError>;

    async fn item_lease_constraint_check(
        &self,
        req: &CapacityRequest,
    ) -> Result<CapacityResponse, QueueError>;

    /// Returns the new lease id, or None when the lease is gone.
    async fn extend_lease(
        &self,
        account_id: Uuid,
        lease_id: Ulid,
        duration_ms: i64,
        now_ms: i64,
    ) -> Result<Option<Ulid>, QueueError>;

    async fn release(&self, account_id: Uuid, lease_id: Ulid) -> Result<(), QueueError>;
}

/// Used when no constraint service is configured.
pub struct NullConstraintApi;

impl NullConstraintApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl ConstraintApi for NullConstraintApi {
    async fn backlog_refill_constraint_check(
        &self,
        _req: &CapacityRequest,
    ) -> Result<CapacityResponse, QueueError> {
        Err(QueueError::ConstraintApi("not configured".into()))
    }

    async fn item_lease_constraint_check(
        &self,
        _req: &CapacityRequest,
    ) -> Result<CapacityResponse, QueueError> {
        Err(QueueError::ConstraintApi("not configured".into()))
    }

    async fn extend_lease(
        &self,
        _account_id: Uuid,
        _lease_id: Ulid,
        _duration_ms: i64,
        _now_ms: i64,
    ) -> Result<Option<Ulid>, QueueError> {
        Err(QueueError::ConstraintApi("not configured".into()))
    }

    async fn release(&self, _account_id: Uuid, _lease_id: Ulid) -> Result<(), QueueError> {
        Err(QueueError::ConstraintApi("not configured".into()))
    }
}

/// In-memory provider with a fixed number of slots per function, for tests.
pub struct MockConstraintApi {
    slots_per_function: i64,
    held: Mutex<HashMap<Ulid, Option<Uuid>>>,
    released: Mutex<Vec<Ulid>>,
}

impl MockConstraintApi {
    pub fn new(slots_per_function: i64) -> Self {
        Self {
            slots_per_function,
            held: Mutex::new(HashMap::new()),
            released: Mutex::new(Vec::new()),
        }
    }

    pub fn new_arc(slots_per_function: i64) -> Arc<Self> {
        Arc::new(Self::new(slots_per_function))
    }

    pub async fn held(&self) -> usize {
        self.held.lock().await.len()
    }

    pub async fn released(&self) -> Vec<Ulid> {
        self.released.lock().await.clone()
    }

    async fn grant(&self, req: &CapacityRequest) -> CapacityResponse {
        let mut held = self.held.lock().await;
        let in_use = held.values().filter(|f| **f == req.function_id).count() as i64;
        let room = (self.slots_per_function - in_use).max(0) as usize;
        let mut resp = CapacityResponse {
            skip_constraint_checks: true,
            ..Default::default()
        };
        for id in req.item_ids.iter().take(room) {
            let lease = Ulid::new(req.now_ms + req.lease_duration_ms);
            held.insert(lease, req.function_id);
            resp.granted_leases.push(CapacityGrant {
                item_id: id.clone(),
                lease_id: lease,
            });
        }
        if resp.granted_leases.len() < req.item_ids.len() {
            resp.limiting_constraints
                .push(QueueConstraint::FunctionConcurrency);
            resp.retry_after_ms = 1_000;
        }
        resp
    }
}

#[async_trait]
impl ConstraintApi for MockConstraintApi {
    async fn backlog_refill_constraint_check(
        &self,
        req: &CapacityRequest,
    ) -> Result<CapacityResponse, QueueError> {
        Ok(self.grant(req).await)
    }

    async fn item_lease_constraint_check(
        &self,
        req: &CapacityRequest,
    ) -> Result<CapacityResponse, QueueError> {
        Ok(self.grant(req).await)
    }

    async fn extend_lease(
        &self,
        _account_id: Uuid,
        lease_id: Ulid,
        duration_ms: i64,
        now_ms: i64,
    ) -> Result<Option<Ulid>, QueueError> {
        let mut held = self.held.lock().await;
        let Some(function_id) = held.remove(&lease_id) else {
            return Ok(None);
        };
        let next = Ulid::new(now_ms + duration_ms);
        held.insert(next, function_id);
        Ok(Some(next))
    }

    async fn release(&self, _account_id: Uuid, lease_id: Ulid) -> Result<(), QueueError> {
        self.held.lock().await.remove(&lease_id);
        self.released.lock().await.push(lease_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcra_allows_limit_then_denies() {
        let now = 1_000_000;
        let period = 60_000;
        let first = gcra(None, now, 2, 0, period);
        assert!(first.allowed);
        let second = gcra(Some(first.new_tat_ms), now, 2, 0, period);
        assert!(second.allowed);
        let third = gcra(Some(second.new_tat_ms), now, 2, 0, period);
        assert!(!third.allowed);
        assert_eq!(third.retry_at_ms, now + 30_000);
    }

    #[test]
    fn gcra_refills_over_time() {
        let now = 0;
        let a = gcra(None, now, 1, 0, 10_000);
        assert!(a.allowed);
        assert!(!gcra(Some(a.new_tat_ms), now + 5_000, 1, 0, 10_000).allowed);
        assert!(gcra(Some(a.new_tat_ms), now + 10_000, 1, 0, 10_000).allowed);
    }

    #[test]
    fn gcra_burst_adds_capacity() {
        let mut tat = None;
        let mut allowed = 0;
        for _ in 0..10 {
            let d = gcra(tat, 0, 2, 3, 60_000);
            if d.allowed {
                allowed += 1;
                tat = Some(d.new_tat_ms);
            }
        }
        assert_eq!(allowed, 5);
    }

    #[tokio::test]
    async fn mock_api_grants_up_to_slots() {
        let api = MockConstraintApi::new(1);
        let req = CapacityRequest {
            account_id: Uuid::nil(),
            env_id: Uuid::nil(),
            function_id: Some(Uuid::from_u128(9)),
            constraints: PartitionConstraintConfig::default(),
            item_ids: vec!["a".into(), "b".into()],
            throttle_key: None,
            custom_keys: vec![],
            now_ms: 0,
            lease_duration_ms: 1_000,
        };
        let resp = api.item_lease_constraint_check(&req).await.unwrap();
        assert_eq!(resp.granted_leases.len(), 1);
        assert_eq!(resp.limiting_constraints, vec![QueueConstraint::FunctionConcurrency]);
        let lease = resp.lease_for("a").unwrap();
        api.release(Uuid::nil(), lease).await.unwrap();
        assert_eq!(api.held().await, 0);
    }
}
