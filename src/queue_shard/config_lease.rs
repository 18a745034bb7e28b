//! Named singleton leases shared by every replica.

use tracing::trace;

use crate::error::QueueError;
use crate::queue_shard::QueueShard;
use crate::ulid::{LeaseId, Ulid};

/// Longest duration a config lease may be taken for.
pub const CONFIG_LEASE_MAX_MS: i64 = 60_000;

impl QueueShard {
    /// Claim or renew the lease named `name`. Pass the currently held id to
    /// renew it; `None` claims a free or expired lease.
    pub async fn config_lease(
        &self,
        name: &str,
        duration_ms: i64,
        existing: Option<LeaseId>,
        now_ms: i64,
    ) -> Result<LeaseId, QueueError> {
        if duration_ms > CONFIG_LEASE_MAX_MS {
            return Err(QueueError::ConfigLeaseExceedsLimits);
        }
        let key = self.kg.config_lease(name);
        self.store
            .eval("config_lease", now_ms, |ks| {
                let current: Option<LeaseId> = ks.get(&key)?.and_then(|v| v.parse().ok());
                if let Some(current) = current.filter(|c| !c.is_expired(now_ms)) {
                    if existing != Some(current) {
                        return Err(QueueError::ConfigAlreadyLeased(name.to_string()));
                    }
                }
                let next = Ulid::new(now_ms + duration_ms);
                ks.set_px(&key, next.to_string(), duration_ms);
                trace!(name, lease_id = %next, "config lease claimed");
                Ok(next)
            })
            .await
    }

    /// Give up a held lease so another replica can take it right away.
    pub async fn release_config_lease(&self, name: &str, held: LeaseId, now_ms: i64) -> Result<(), QueueError> {
        let key = self.kg.config_lease(name);
        self.store
            .eval("config_lease_release", now_ms, |ks| {
                if ks.get(&key)?.as_deref() == Some(held.to_string().as_str()) {
                    ks.del(&key);
                }
                Ok(())
            })
            .await
    }
}
