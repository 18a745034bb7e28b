//! Helpers shared across queue_shard scripts.
//!
//! Every function here runs inside a `Store::eval` closure and therefore sees
//! a consistent keyspace. Pointer helpers keep the partition, shadow partition
//! and account indexes in step with the sets they summarize.

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::backlog::{item_backlog, item_shadow_partition, QueueBacklog, QueueShadowPartition};
use crate::error::QueueError;
use crate::item::QueueItem;
use crate::keys::KeyGenerator;
use crate::partition::{PartitionConstraintConfig, QueuePartition};
use crate::store::Keyspace;

pub(crate) fn hget_json<T: DeserializeOwned>(
    ks: &mut Keyspace,
    key: &str,
    field: &str,
) -> Result<Option<T>, QueueError> {
    match ks.hget(key, field)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub(crate) fn hset_json<T: Serialize>(
    ks: &mut Keyspace,
    key: &str,
    field: &str,
    value: &T,
) -> Result<(), QueueError> {
    ks.hset(key, field, serde_json::to_string(value)?)?;
    Ok(())
}

pub(crate) fn load_item(ks: &mut Keyspace, kg: &KeyGenerator, id: &str) -> Result<Option<QueueItem>, QueueError> {
    hget_json(ks, &kg.queue_item(), id)
}

pub(crate) fn store_item(ks: &mut Keyspace, kg: &KeyGenerator, item: &QueueItem) -> Result<(), QueueError> {
    hset_json(ks, &kg.queue_item(), &item.id, item)
}

pub(crate) fn load_partition(
    ks: &mut Keyspace,
    kg: &KeyGenerator,
    id: &str,
) -> Result<Option<QueuePartition>, QueueError> {
    hget_json(ks, &kg.partition_item(), id)
}

pub(crate) fn store_partition(ks: &mut Keyspace, kg: &KeyGenerator, p: &QueuePartition) -> Result<(), QueueError> {
    hset_json(ks, &kg.partition_item(), &p.id, p)
}

pub(crate) fn load_shadow(
    ks: &mut Keyspace,
    kg: &KeyGenerator,
    id: &str,
) -> Result<Option<QueueShadowPartition>, QueueError> {
    hget_json(ks, &kg.shadow_partition_meta(), id)
}

pub(crate) fn store_shadow(
    ks: &mut Keyspace,
    kg: &KeyGenerator,
    sp: &QueueShadowPartition,
) -> Result<(), QueueError> {
    hset_json(ks, &kg.shadow_partition_meta(), &sp.partition_id, sp)
}

pub(crate) fn load_backlog(
    ks: &mut Keyspace,
    kg: &KeyGenerator,
    id: &str,
) -> Result<Option<QueueBacklog>, QueueError> {
    hget_json(ks, &kg.backlog_meta(), id)
}

pub(crate) fn store_backlog(ks: &mut Keyspace, kg: &KeyGenerator, b: &QueueBacklog) -> Result<(), QueueError> {
    hset_json(ks, &kg.backlog_meta(), &b.backlog_id, b)
}

/// Write partition metadata, keeping lease state of an existing record.
pub(crate) fn upsert_partition(
    ks: &mut Keyspace,
    kg: &KeyGenerator,
    mut p: QueuePartition,
) -> Result<QueuePartition, QueueError> {
    if let Some(existing) = load_partition(ks, kg, &p.id)? {
        p.lease_id = existing.lease_id;
        p.last = existing.last;
        p.force_at_ms = existing.force_at_ms;
    }
    store_partition(ks, kg, &p)?;
    Ok(p)
}

/// Write shadow partition metadata. A stored record with a newer function
/// version keeps its constraints.
pub(crate) fn upsert_shadow(
    ks: &mut Keyspace,
    kg: &KeyGenerator,
    mut sp: QueueShadowPartition,
) -> Result<QueueShadowPartition, QueueError> {
    if let Some(existing) = load_shadow(ks, kg, &sp.partition_id)? {
        if existing.function_version > sp.function_version {
            sp.function_version = existing.function_version;
            sp.concurrency = existing.concurrency;
            sp.throttle = existing.throttle;
        }
        sp.lease_id = existing.lease_id;
        sp.pause_refill = existing.pause_refill;
        sp.pause_enqueue = existing.pause_enqueue;
    }
    store_shadow(ks, kg, &sp)?;
    Ok(sp)
}

/// Write backlog metadata, keeping counters and the normalization lease.
pub(crate) fn upsert_backlog(
    ks: &mut Keyspace,
    kg: &KeyGenerator,
    mut b: QueueBacklog,
) -> Result<QueueBacklog, QueueError> {
    if let Some(existing) = load_backlog(ks, kg, &b.backlog_id)? {
        b.successive_throttle_constrained = existing.successive_throttle_constrained;
        b.successive_custom_concurrency_constrained =
            existing.successive_custom_concurrency_constrained;
        b.normalize_lease_id = existing.normalize_lease_id;
        if existing.earliest_function_version > 0 {
            b.earliest_function_version = b
                .earliest_function_version
                .min(existing.earliest_function_version);
        }
    }
    store_backlog(ks, kg, &b)?;
    Ok(b)
}

/// Recompute the global account pointer from the account's partitions.
pub(crate) fn update_account_pointer(
    ks: &mut Keyspace,
    kg: &KeyGenerator,
    account_id: Uuid,
) -> Result<(), QueueError> {
    let global = kg.global_account_index();
    let account = account_id.to_string();
    match ks.zmin(&kg.account_partition_index(account_id))? {
        Some((_, score)) => {
            ks.zadd(&global, score, &account)?;
        }
        None => {
            ks.zrem(&global, &account)?;
        }
    }
    Ok(())
}

/// Set the partition pointer unconditionally.
pub(crate) fn set_partition_pointer(
    ks: &mut Keyspace,
    kg: &KeyGenerator,
    p: &QueuePartition,
    score: i64,
) -> Result<(), QueueError> {
    ks.zadd(&kg.global_partition_index(), score, &p.id)?;
    if !p.is_system() {
        ks.zadd(&kg.account_partition_index(p.account_id), score, &p.id)?;
        update_account_pointer(ks, kg, p.account_id)?;
    }
    Ok(())
}

/// Move the partition pointer earlier for newly ready work. A live lease or a
/// future force time acts as a floor.
pub(crate) fn bump_partition_pointer(
    ks: &mut Keyspace,
    kg: &KeyGenerator,
    p: &QueuePartition,
    score: i64,
) -> Result<(), QueueError> {
    let now = ks.now_ms();
    let mut floor = i64::MIN;
    if let Some(lease) = p.lease_id {
        if !lease.is_expired(now) {
            floor = lease.timestamp_ms();
        }
    }
    if p.force_at_ms > now {
        floor = floor.max(p.force_at_ms);
    }
    let target = score.max(floor);
    let next = match ks.zscore(&kg.global_partition_index(), &p.id)? {
        Some(existing) if existing <= target => return Ok(()),
        _ => target,
    };
    set_partition_pointer(ks, kg, p, next)
}

/// Drop a partition and every pointer to it.
pub(crate) fn remove_partition(ks: &mut Keyspace, kg: &KeyGenerator, p: &QueuePartition) -> Result<(), QueueError> {
    ks.hdel(&kg.partition_item(), &p.id)?;
    ks.zrem(&kg.global_partition_index(), &p.id)?;
    ks.zrem(&kg.in_progress_index(), &p.id)?;
    if !p.is_system() {
        ks.zrem(&kg.account_partition_index(p.account_id), &p.id)?;
        update_account_pointer(ks, kg, p.account_id)?;
    }
    Ok(())
}

fn update_account_shadow_pointer(
    ks: &mut Keyspace,
    kg: &KeyGenerator,
    account_id: Uuid,
) -> Result<(), QueueError> {
    let global = kg.global_account_shadow_partitions();
    let account = account_id.to_string();
    match ks.zmin(&kg.account_shadow_partitions(account_id))? {
        Some((_, score)) => {
            ks.zadd(&global, score, &account)?;
        }
        None => {
            ks.zrem(&global, &account)?;
        }
    }
    Ok(())
}

/// Set or clear the shadow partition pointer.
pub(crate) fn set_shadow_pointer(
    ks: &mut Keyspace,
    kg: &KeyGenerator,
    sp: &QueueShadowPartition,
    score: Option<i64>,
) -> Result<(), QueueError> {
    let global = kg.global_shadow_partition_set();
    let account_set = (!sp.is_system()).then(|| kg.account_shadow_partitions(sp.account_id()));
    match score {
        Some(score) => {
            ks.zadd(&global, score, &sp.partition_id)?;
            if let Some(key) = &account_set {
                ks.zadd(key, score, &sp.partition_id)?;
            }
        }
        None => {
            ks.zrem(&global, &sp.partition_id)?;
            if let Some(key) = &account_set {
                ks.zrem(key, &sp.partition_id)?;
            }
        }
    }
    if account_set.is_some() {
        update_account_shadow_pointer(ks, kg, sp.account_id())?;
    }
    Ok(())
}

fn live_shadow_lease_floor(sp: &QueueShadowPartition, now: i64) -> i64 {
    match sp.lease_id {
        Some(l) if !l.is_expired(now) => l.timestamp_ms(),
        _ => i64::MIN,
    }
}

/// Move the shadow pointer earlier, never below a live lease.
pub(crate) fn bump_shadow_pointer(
    ks: &mut Keyspace,
    kg: &KeyGenerator,
    sp: &QueueShadowPartition,
    score: i64,
) -> Result<(), QueueError> {
    let target = score.max(live_shadow_lease_floor(sp, ks.now_ms()));
    if let Some(existing) = ks.zscore(&kg.global_shadow_partition_set(), &sp.partition_id)? {
        if existing <= target {
            return Ok(());
        }
    }
    set_shadow_pointer(ks, kg, sp, Some(target))
}

/// Recompute the shadow pointer from its earliest backlog.
pub(crate) fn refresh_shadow_pointer(
    ks: &mut Keyspace,
    kg: &KeyGenerator,
    sp: &QueueShadowPartition,
) -> Result<(), QueueError> {
    let earliest = ks.zmin(&kg.shadow_partition_set(&sp.partition_id))?;
    let floor = live_shadow_lease_floor(sp, ks.now_ms());
    set_shadow_pointer(ks, kg, sp, earliest.map(|(_, s)| s.max(floor)))
}

/// Recompute a backlog's score in its shadow partition after items left it.
/// Empty backlogs are garbage collected; returns true when that happened.
pub(crate) fn refresh_backlog_pointer(
    ks: &mut Keyspace,
    kg: &KeyGenerator,
    backlog_id: &str,
    sp: &QueueShadowPartition,
) -> Result<bool, QueueError> {
    let set = kg.shadow_partition_set(&sp.partition_id);
    let emptied = match ks.zmin(&kg.backlog_set(backlog_id))? {
        Some((_, score)) => {
            // backlogs parked for normalization are not in the shadow set
            if ks.zscore(&set, backlog_id)?.is_some() {
                ks.zadd(&set, score, backlog_id)?;
            }
            false
        }
        None => {
            ks.zrem(&set, backlog_id)?;
            ks.hdel(&kg.backlog_meta(), backlog_id)?;
            true
        }
    };
    refresh_shadow_pointer(ks, kg, sp)?;
    Ok(emptied)
}

/// Shadow partition record for an item, falling back to one derived from the item.
pub(crate) fn shadow_for_item(
    ks: &mut Keyspace,
    kg: &KeyGenerator,
    item: &QueueItem,
) -> Result<QueueShadowPartition, QueueError> {
    match load_shadow(ks, kg, &item.partition_id())? {
        Some(sp) => Ok(sp),
        None => Ok(item_shadow_partition(item, &PartitionConstraintConfig::default())),
    }
}

/// In-progress and active sets an item is counted in.
pub(crate) fn accounting_keys(kg: &KeyGenerator, item: &QueueItem) -> (Vec<String>, Vec<String>) {
    let sp = item_shadow_partition(item, &PartitionConstraintConfig::default());
    let backlog = item_backlog(item);
    let mut in_progress = vec![sp.in_progress_key(kg)];
    let mut active = vec![sp.active_key(kg)];
    if let Some(k) = sp.account_in_progress_key(kg) {
        in_progress.push(k);
    }
    if let Some(k) = sp.account_active_key(kg) {
        active.push(k);
    }
    for key in &backlog.concurrency_keys {
        in_progress.push(key.in_progress_key(kg));
        active.push(key.active_key(kg));
    }
    (in_progress, active)
}

/// Remove an item from every in-progress and active set.
pub(crate) fn release_accounting(ks: &mut Keyspace, kg: &KeyGenerator, item: &QueueItem) -> Result<(), QueueError> {
    let (in_progress, active) = accounting_keys(kg, item);
    for key in in_progress.iter().chain(active.iter()) {
        ks.zrem(key, &item.id)?;
    }
    Ok(())
}

/// Put an item back into its partition's ready set at `score`.
pub(crate) fn ready_in_partition(
    ks: &mut Keyspace,
    kg: &KeyGenerator,
    item: &QueueItem,
    score: i64,
) -> Result<(), QueueError> {
    let pid = item.partition_id();
    ks.zadd(&kg.partition_queue_set(&pid), score, &item.id)?;
    let partition = match load_partition(ks, kg, &pid)? {
        Some(p) => p,
        None => upsert_partition(ks, kg, QueuePartition::for_item(item))?,
    };
    bump_partition_pointer(ks, kg, &partition, score)
}

/// Put an item into its backlog at `score`, creating the backlog when needed.
pub(crate) fn ready_in_backlog(
    ks: &mut Keyspace,
    kg: &KeyGenerator,
    item: &QueueItem,
    sp: &QueueShadowPartition,
    score: i64,
) -> Result<QueueBacklog, QueueError> {
    let backlog = upsert_backlog(ks, kg, item_backlog(item))?;
    ks.zadd(&kg.backlog_set(&backlog.backlog_id), score, &item.id)?;
    let set = kg.shadow_partition_set(&sp.partition_id);
    // a backlog under normalization stays out of the shadow set
    let normalizing = ks
        .zscore(&kg.shadow_partition_normalize_set(&sp.partition_id), &backlog.backlog_id)?
        .is_some();
    if !normalizing {
        ks.zadd_lt(&set, score, &backlog.backlog_id)?;
    }
    bump_shadow_pointer(ks, kg, sp, score)?;
    Ok(backlog)
}
