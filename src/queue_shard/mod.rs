//! Queue shard - one store keyspace and every atomic script that mutates it.
//!
//! The shard type is split across submodules by operation family:
//!
//! - `helpers`: payload codecs and pointer maintenance shared by scripts
//! - `enqueue`: item writes, idempotency, singletons, promotion jobs
//! - `lease`: item lease and extension
//! - `requeue` / `dequeue`: returning and removing items
//! - `partition`: runnable partition peeks, leases, requeues and promotion
//! - `shadow`: shadow partitions, backlog peeks and refills
//! - `normalize`: outdated backlog bookkeeping
//! - `scavenge`: reclaiming expired item leases
//! - `active`: active set repair
//! - `config_lease`: named singleton leases
//! - `cron`: per-function cron schedule mapping
//! - `stats`: read-only lookups for instrumentation and tests

mod active;
mod config_lease;
mod cron;
mod dequeue;
mod enqueue;
pub(crate) mod helpers;
mod lease;
mod normalize;
mod partition;
mod requeue;
mod scavenge;
mod shadow;
mod stats;

pub use active::ACTIVE_CHECK_COOLDOWN_MS;
pub use config_lease::CONFIG_LEASE_MAX_MS;
pub use enqueue::EnqueueParams;
pub use lease::LeaseParams;
pub use partition::PartitionIndex;
pub use requeue::RequeueParams;
pub use shadow::{BacklogRefillParams, BacklogRefillResult, ShadowIndex};
pub use stats::ShardCounts;

use crate::keys::KeyGenerator;
use crate::store::Store;

/// Hard cap on any single peek.
pub const ABSOLUTE_PEEK_MAX: usize = 10_000;

/// Partition pointers are peeked in pages of this size.
pub const PARTITION_PEEK_MAX: usize = 300;

/// Default number of backlogs peeked per shadow partition.
pub const SHADOW_PARTITION_PEEK_MAX_BACKLOGS: usize = 100;

/// Items moved per normalization page.
pub const NORMALIZE_BACKLOG_PEEK_MAX: usize = 100;

/// Members visited per active set per check.
pub const ACTIVE_CHECK_SCAN_BATCH_SIZE: usize = 100;

/// Queue name of promotion jobs.
pub const PROMOTE_QUEUE_NAME: &str = "job-promote";

/// A named keyspace holding partitions, backlogs and items.
#[derive(Clone)]
pub struct QueueShard {
    pub(crate) name: String,
    pub(crate) kind: String,
    pub(crate) store: Store,
    pub(crate) kg: KeyGenerator,
}

impl std::fmt::Debug for QueueShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueShard")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("prefix", &self.kg.prefix())
            .finish()
    }
}

impl QueueShard {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, store: Store, prefix: &str) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            store,
            kg: KeyGenerator::new(prefix),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn keys(&self) -> &KeyGenerator {
        &self.kg
    }
}
