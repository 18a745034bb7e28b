//! Redis-compatible keyspace behind every queue shard.
//!
//! Scripts are Rust closures over a [`Keyspace`]: strings with millisecond
//! expiry, hashes, and sorted sets with integer scores. [`Store::eval`] runs
//! one script atomically against one of two backends:
//!
//! - `redis`: a shared Redis server. The script holds the shard's script
//!   lock, reads keys lazily under `WATCH`, and its writes are applied in a
//!   single `MULTI`/`EXEC`, so every executor pointed at the same server sees
//!   one serialized history.
//! - `memory`: an in-process keyspace for tests and single-process runs.
//!
//! Scripts receive the caller's logical clock and expiry is evaluated against
//! that clock rather than wall time.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("WRONGTYPE operation against key {key} holding the wrong kind of value")]
    WrongType { key: String },
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("script {script} lost a race on a watched key")]
    Conflict { script: &'static str },
    #[error("timed out waiting for the script lock")]
    LockTimeout,
    #[error("unsupported store kind: {0}")]
    UnsupportedKind(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

type Result<T> = std::result::Result<T, StoreError>;

/// Script lock lifetime; a crashed holder blocks the shard for at most this long.
const SCRIPT_LOCK_TTL_MS: u64 = 5_000;
/// How long a script waits for the lock before giving up.
const SCRIPT_LOCK_WAIT: Duration = Duration::from_secs(10);
const REDIS_POOL_SIZE: u32 = 16;

/// Returns `{type, pttl, flattened value}` for one key.
const LOAD_KEY_LUA: &str = r#"
local t = redis.call('TYPE', KEYS[1])['ok']
local ttl = redis.call('PTTL', KEYS[1])
if t == 'string' then return {t, ttl, {redis.call('GET', KEYS[1])}} end
if t == 'hash' then return {t, ttl, redis.call('HGETALL', KEYS[1])} end
if t == 'zset' then return {t, ttl, redis.call('ZRANGE', KEYS[1], 0, -1, 'WITHSCORES')} end
return {t, ttl, {}}
"#;

const UNLOCK_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at_ms: Option<i64>,
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    ZSet(ZSet),
}

/// Sorted set with integer scores; ties are ordered by member.
#[derive(Debug, Clone, Default)]
pub struct ZSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl ZSet {
    fn insert(&mut self, member: &str, score: i64) -> bool {
        match self.scores.insert(member.to_string(), score) {
            Some(old) => {
                self.ordered.remove(&(old, member.to_string()));
                self.ordered.insert((score, member.to_string()));
                false
            }
            None => {
                self.ordered.insert((score, member.to_string()));
                true
            }
        }
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(old) => {
                self.ordered.remove(&(old, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.scores.len()
    }

    fn range(&self, min: i64, max: i64) -> impl Iterator<Item = &(i64, String)> {
        self.ordered.range((
            Bound::Included((min, String::new())),
            Bound::Unbounded,
        ))
        .take_while(move |(s, _)| *s <= max)
    }
}

/// Server side of a script running against Redis.
struct Remote {
    conn: r2d2::PooledConnection<redis::Client>,
    load: redis::Script,
    loaded: HashSet<String>,
    pending: redis::Pipeline,
    writes: usize,
    failed: Option<redis::RedisError>,
}

impl Remote {
    fn new(conn: r2d2::PooledConnection<redis::Client>, load: redis::Script) -> Self {
        let mut pending = redis::pipe();
        pending.atomic();
        Self {
            conn,
            load,
            loaded: HashSet::new(),
            pending,
            writes: 0,
            failed: None,
        }
    }

    /// WATCH the key, then read its type, ttl and value in one round trip.
    fn fetch(&mut self, key: &str) -> redis::RedisResult<Option<(Value, Option<i64>)>> {
        redis::cmd("WATCH").arg(key).query::<()>(&mut *self.conn)?;
        let (kind, ttl, raw): (String, i64, Vec<String>) =
            self.load.key(key).invoke(&mut *self.conn)?;
        let ttl = (ttl >= 0).then_some(ttl);
        let value = match kind.as_str() {
            "none" => return Ok(None),
            "string" => Value::Str(raw.into_iter().next().unwrap_or_default()),
            "hash" => Value::Hash(pairs(raw).collect()),
            "zset" => {
                let mut z = ZSet::default();
                for (member, score) in pairs(raw) {
                    z.insert(&member, parse_score(&score)?);
                }
                Value::ZSet(z)
            }
            other => {
                return Err(redis::RedisError::from((
                    redis::ErrorKind::TypeError,
                    "unsupported key type",
                    format!("{key} is a {other}"),
                )))
            }
        };
        Ok(Some((value, ttl)))
    }

    /// Every key matching `prefix*`.
    fn scan(&mut self, prefix: &str) -> redis::RedisResult<Vec<String>> {
        let mut pattern = String::with_capacity(prefix.len() + 1);
        for c in prefix.chars() {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('*');

        let mut keys = Vec::new();
        let mut cursor = 0u64;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(512)
                .query(&mut *self.conn)?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }

    fn record(&mut self, cmd: redis::Cmd) {
        self.pending.add_command(cmd);
        self.writes += 1;
    }

    fn unwatch(&mut self) {
        if let Err(e) = redis::cmd("UNWATCH").query::<()>(&mut *self.conn) {
            warn!(error = %e, "unwatch failed");
        }
    }

    /// Apply the buffered writes, or drop them when the script failed.
    fn commit(&mut self, script: &'static str, apply: bool) -> Result<()> {
        if let Some(e) = self.failed.take() {
            self.unwatch();
            return Err(e.into());
        }
        if !apply || self.writes == 0 {
            self.unwatch();
            return Ok(());
        }
        let applied: Option<redis::Value> = self.pending.query(&mut *self.conn)?;
        match applied {
            Some(_) => Ok(()),
            None => Err(StoreError::Conflict { script }),
        }
    }
}

fn pairs(raw: Vec<String>) -> impl Iterator<Item = (String, String)> {
    let mut it = raw.into_iter();
    std::iter::from_fn(move || Some((it.next()?, it.next()?)))
}

fn parse_score(raw: &str) -> redis::RedisResult<i64> {
    raw.parse::<f64>().map(|s| s as i64).map_err(|_| {
        redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "sorted set score is not a number",
            raw.to_string(),
        ))
    })
}

/// Mutable view handed to scripts.
#[derive(Default)]
pub struct Keyspace {
    data: HashMap<String, Entry>,
    now_ms: i64,
    remote: Option<Remote>,
}

impl Keyspace {
    /// Logical time of the running script.
    pub fn now_ms(&self) -> i64 {
        self.now_ms
    }

    /// Pull `key` into the script's view the first time it is touched.
    fn load(&mut self, key: &str) {
        let Some(remote) = self.remote.as_mut() else {
            return;
        };
        if !remote.loaded.insert(key.to_string()) {
            return;
        }
        match remote.fetch(key) {
            Ok(Some((value, ttl))) => {
                let expires_at_ms = ttl.map(|t| self.now_ms + t);
                self.data.insert(key.to_string(), Entry { value, expires_at_ms });
            }
            Ok(None) => {}
            Err(e) => {
                remote.failed.get_or_insert(e);
            }
        }
    }

    fn record(&mut self, cmd: redis::Cmd) {
        if let Some(remote) = self.remote.as_mut() {
            remote.record(cmd);
        }
    }

    fn purge(&mut self, key: &str) {
        self.load(key);
        let now = self.now_ms;
        let expired = matches!(
            self.data.get(key),
            Some(Entry { expires_at_ms: Some(at), .. }) if *at <= now
        );
        if expired {
            self.data.remove(key);
            self.record(redis::cmd("DEL").arg(key).clone());
        }
    }

    fn entry(&mut self, key: &str) -> Option<&Entry> {
        self.purge(key);
        self.data.get(key)
    }

    fn wrong_type(key: &str) -> StoreError {
        StoreError::WrongType {
            key: key.to_string(),
        }
    }

    // ---- generic ----

    pub fn exists(&mut self, key: &str) -> bool {
        self.entry(key).is_some()
    }

    pub fn del(&mut self, key: &str) -> bool {
        self.purge(key);
        let removed = self.data.remove(key).is_some();
        if removed {
            self.record(redis::cmd("DEL").arg(key).clone());
        }
        removed
    }

    /// Remaining time to live in ms, `None` when the key is missing or persistent.
    pub fn pttl(&mut self, key: &str) -> Option<i64> {
        let now = self.now_ms;
        self.entry(key)
            .and_then(|e| e.expires_at_ms)
            .map(|at| at - now)
    }

    pub fn pexpire_at(&mut self, key: &str, at_ms: i64) -> bool {
        self.purge(key);
        match self.data.get_mut(key) {
            Some(e) => {
                e.expires_at_ms = Some(at_ms);
                self.record(redis::cmd("PEXPIREAT").arg(key).arg(at_ms).clone());
                true
            }
            None => false,
        }
    }

    /// Every live key starting with `prefix`, sorted.
    pub fn keys_with_prefix(&mut self, prefix: &str) -> Vec<String> {
        let scanned = match self.remote.as_mut() {
            Some(remote) => match remote.scan(prefix) {
                Ok(keys) => keys,
                Err(e) => {
                    remote.failed.get_or_insert(e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        for key in &scanned {
            self.load(key);
        }
        let now = self.now_ms;
        let mut keys: Vec<String> = self
            .data
            .iter()
            .filter(|(k, e)| {
                k.starts_with(prefix) && e.expires_at_ms.map_or(true, |at| at > now)
            })
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Keys in the script's view.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    // ---- strings ----

    pub fn get(&mut self, key: &str) -> Result<Option<String>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        self.load(key);
        self.record(redis::cmd("SET").arg(key).arg(&value).clone());
        self.data.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value),
                expires_at_ms: None,
            },
        );
    }

    /// SET with PX.
    pub fn set_px(&mut self, key: &str, value: impl Into<String>, ttl_ms: i64) {
        let value = value.into();
        let at = self.now_ms + ttl_ms.max(1);
        self.load(key);
        self.record(redis::cmd("SET").arg(key).arg(&value).arg("PXAT").arg(at).clone());
        self.data.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value),
                expires_at_ms: Some(at),
            },
        );
    }

    /// SET NX PX; returns whether the key was written.
    pub fn set_nx_px(&mut self, key: &str, value: impl Into<String>, ttl_ms: i64) -> bool {
        if self.exists(key) {
            return false;
        }
        self.set_px(key, value, ttl_ms);
        true
    }

    // ---- hashes ----

    fn hash(&mut self, key: &str) -> Result<Option<&HashMap<String, String>>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(Some(h)),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    fn hash_mut(&mut self, key: &str) -> Result<&mut HashMap<String, String>> {
        self.purge(key);
        let entry = self.data.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at_ms: None,
        });
        match &mut entry.value {
            Value::Hash(h) => Ok(h),
            _ => Err(Self::wrong_type(key)),
        }
    }

    pub fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.hash(key)?.and_then(|h| h.get(field).cloned()))
    }

    pub fn hset(&mut self, key: &str, field: &str, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        self.hash_mut(key)?.insert(field.to_string(), value.clone());
        self.record(redis::cmd("HSET").arg(key).arg(field).arg(value).clone());
        Ok(())
    }

    pub fn hdel(&mut self, key: &str, field: &str) -> Result<bool> {
        if self.hash(key)?.is_none() {
            return Ok(false);
        }
        let h = self.hash_mut(key)?;
        let (removed, empty) = (h.remove(field).is_some(), h.is_empty());
        if empty {
            self.data.remove(key);
        }
        if removed {
            self.record(redis::cmd("HDEL").arg(key).arg(field).clone());
        }
        Ok(removed)
    }

    pub fn hexists(&mut self, key: &str, field: &str) -> Result<bool> {
        Ok(self.hash(key)?.is_some_and(|h| h.contains_key(field)))
    }

    pub fn hlen(&mut self, key: &str) -> Result<usize> {
        Ok(self.hash(key)?.map(|h| h.len()).unwrap_or(0))
    }

    /// All fields, sorted by field name.
    pub fn hgetall(&mut self, key: &str) -> Result<Vec<(String, String)>> {
        let mut out: Vec<(String, String)> = self
            .hash(key)?
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        out.sort();
        Ok(out)
    }

    // ---- sorted sets ----

    fn zset(&mut self, key: &str) -> Result<Option<&ZSet>> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => Ok(Some(z)),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    fn zset_mut(&mut self, key: &str) -> Result<&mut ZSet> {
        self.purge(key);
        let entry = self.data.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::ZSet(ZSet::default()),
            expires_at_ms: None,
        });
        match &mut entry.value {
            Value::ZSet(z) => Ok(z),
            _ => Err(Self::wrong_type(key)),
        }
    }

    /// ZADD; returns true when the member is new.
    pub fn zadd(&mut self, key: &str, score: i64, member: &str) -> Result<bool> {
        let added = self.zset_mut(key)?.insert(member, score);
        self.record(redis::cmd("ZADD").arg(key).arg(score).arg(member).clone());
        Ok(added)
    }

    /// ZADD NX; never updates an existing member.
    pub fn zadd_nx(&mut self, key: &str, score: i64, member: &str) -> Result<bool> {
        if self.zscore(key, member)?.is_some() {
            return Ok(false);
        }
        self.zadd(key, score, member)
    }

    /// ZADD LT; only lowers an existing member's score.
    pub fn zadd_lt(&mut self, key: &str, score: i64, member: &str) -> Result<bool> {
        match self.zscore(key, member)? {
            Some(existing) if existing <= score => Ok(false),
            _ => {
                self.zadd(key, score, member)?;
                Ok(true)
            }
        }
    }

    pub fn zscore(&mut self, key: &str, member: &str) -> Result<Option<i64>> {
        Ok(self.zset(key)?.and_then(|z| z.scores.get(member).copied()))
    }

    pub fn zrem(&mut self, key: &str, member: &str) -> Result<bool> {
        if self.zset(key)?.is_none() {
            return Ok(false);
        }
        let z = self.zset_mut(key)?;
        let (removed, empty) = (z.remove(member), z.len() == 0);
        if empty {
            self.data.remove(key);
        }
        if removed {
            self.record(redis::cmd("ZREM").arg(key).arg(member).clone());
        }
        Ok(removed)
    }

    pub fn zcard(&mut self, key: &str) -> Result<usize> {
        Ok(self.zset(key)?.map(|z| z.len()).unwrap_or(0))
    }

    /// Members with `min <= score <= max`.
    pub fn zcount(&mut self, key: &str, min: i64, max: i64) -> Result<usize> {
        Ok(self.zset(key)?.map(|z| z.range(min, max).count()).unwrap_or(0))
    }

    /// ZRANGEBYSCORE key min max LIMIT offset count.
    pub fn zrange_by_score(
        &mut self,
        key: &str,
        min: i64,
        max: i64,
        offset: usize,
        count: usize,
    ) -> Result<Vec<(String, i64)>> {
        Ok(self
            .zset(key)?
            .map(|z| {
                z.range(min, max)
                    .skip(offset)
                    .take(count)
                    .map(|(s, m)| (m.clone(), *s))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// ZRANGE by rank, inclusive of both ends. Negative `stop` counts from the end.
    pub fn zrange(&mut self, key: &str, start: usize, stop: isize) -> Result<Vec<(String, i64)>> {
        Ok(self
            .zset(key)?
            .map(|z| {
                let len = z.len() as isize;
                let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
                if stop < start as isize {
                    return Vec::new();
                }
                z.ordered
                    .iter()
                    .skip(start)
                    .take((stop - start as isize + 1) as usize)
                    .map(|(s, m)| (m.clone(), *s))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Lowest-scored member.
    pub fn zmin(&mut self, key: &str) -> Result<Option<(String, i64)>> {
        Ok(self
            .zset(key)?
            .and_then(|z| z.ordered.iter().next().map(|(s, m)| (m.clone(), *s))))
    }

    pub fn zrem_range_by_score(&mut self, key: &str, min: i64, max: i64) -> Result<usize> {
        let members: Vec<String> = self
            .zrange_by_score(key, min, max, 0, usize::MAX)?
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        for m in &members {
            self.zrem(key, m)?;
        }
        Ok(members.len())
    }
}

struct RedisBackend {
    pool: r2d2::Pool<redis::Client>,
    lock_key: String,
    load: redis::Script,
    unlock: redis::Script,
}

impl RedisBackend {
    fn lock(&self, conn: &mut redis::Connection, token: &str) -> Result<()> {
        let deadline = Instant::now() + SCRIPT_LOCK_WAIT;
        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&self.lock_key)
                .arg(token)
                .arg("NX")
                .arg("PX")
                .arg(SCRIPT_LOCK_TTL_MS)
                .query(conn)?;
            if acquired.is_some() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(StoreError::LockTimeout);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn unlock(&self, conn: &mut redis::Connection, token: &str) {
        let res: redis::RedisResult<i64> = self.unlock.key(&self.lock_key).arg(token).invoke(conn);
        if let Err(e) = res {
            warn!(lock = %self.lock_key, error = %e, "failed to release script lock");
        }
    }

    fn eval<T, E, F>(&self, script: &'static str, now_ms: i64, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Keyspace) -> std::result::Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self
            .pool
            .get()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let token = Uuid::new_v4().to_string();
        self.lock(&mut conn, &token)?;

        let mut ks = Keyspace {
            data: HashMap::new(),
            now_ms,
            remote: Some(Remote::new(conn, self.load.clone())),
        };
        let res = f(&mut ks);
        let committed = match ks.remote.as_mut() {
            Some(remote) => {
                let committed = remote.commit(script, res.is_ok());
                self.unlock(&mut remote.conn, &token);
                committed
            }
            None => Ok(()),
        };
        committed?;
        res
    }
}

#[derive(Clone)]
enum Backend {
    Memory(Arc<Mutex<Keyspace>>),
    Redis(Arc<RedisBackend>),
}

/// Shared handle to one keyspace.
#[derive(Clone)]
pub struct Store {
    backend: Backend,
    evals: Arc<AtomicU64>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.backend {
            Backend::Memory(_) => "memory",
            Backend::Redis(_) => "redis",
        };
        f.debug_struct("Store").field("kind", &kind).finish()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::memory()
    }
}

impl Store {
    /// An in-process keyspace visible only to this process.
    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(Mutex::new(Keyspace::default()))),
            evals: Arc::default(),
        }
    }

    /// A keyspace on the Redis server at `url`. Scripts against the same
    /// server and `lock_key` are serialized with each other.
    pub fn redis(url: &str, lock_key: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        // connections are made on first use
        let pool = r2d2::Pool::builder()
            .max_size(REDIS_POOL_SIZE)
            .build_unchecked(client);
        Ok(Self {
            backend: Backend::Redis(Arc::new(RedisBackend {
                pool,
                lock_key: lock_key.into(),
                load: redis::Script::new(LOAD_KEY_LUA),
                unlock: redis::Script::new(UNLOCK_LUA),
            })),
            evals: Arc::default(),
        })
    }

    /// Run a named script atomically at logical time `now_ms`.
    ///
    /// On Redis a failed script writes nothing. The memory keyspace does not
    /// roll back, so scripts must validate before writing.
    pub async fn eval<T, E, F>(&self, script: &'static str, now_ms: i64, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Keyspace) -> std::result::Result<T, E>,
        E: From<StoreError>,
    {
        self.evals.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(script, now_ms, "eval");
        match &self.backend {
            Backend::Memory(inner) => {
                let mut ks = inner.lock().await;
                ks.now_ms = now_ms;
                f(&mut ks)
            }
            Backend::Redis(redis) => blocking(|| redis.eval(script, now_ms, f)),
        }
    }

    /// Number of scripts run against this store.
    pub fn eval_count(&self) -> u64 {
        self.evals.load(Ordering::Relaxed)
    }
}

/// Run blocking Redis I/O without starving other tasks on a multi-threaded runtime.
fn blocking<R>(f: impl FnOnce() -> R) -> R {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn string_expiry_follows_script_clock() {
        let store = Store::memory();
        store
            .eval("set", 1_000, |ks| {
                ks.set_px("k", "v", 500);
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();
        let before = store.eval("get", 1_499, |ks| ks.get("k")).await.unwrap();
        let after = store.eval("get", 1_500, |ks| ks.get("k")).await.unwrap();
        assert_eq!(before.as_deref(), Some("v"));
        assert_eq!(after, None);
    }

    #[tokio::test]
    async fn zset_ranges_and_cleanup() {
        let store = Store::memory();
        store
            .eval("zset", 0, |ks| {
                ks.zadd("z", 30, "c")?;
                ks.zadd("z", 10, "a")?;
                ks.zadd("z", 20, "b")?;
                assert_eq!(ks.zcount("z", 10, 20)?, 2);
                let page = ks.zrange_by_score("z", 0, 100, 1, 1)?;
                assert_eq!(page, vec![("b".to_string(), 20)]);
                assert_eq!(ks.zmin("z")?, Some(("a".to_string(), 10)));
                assert!(ks.zadd_lt("z", 5, "c")?);
                assert!(!ks.zadd_lt("z", 50, "c")?);
                assert_eq!(ks.zrange("z", 0, -1)?[0].0, "c");
                for m in ["a", "b", "c"] {
                    ks.zrem("z", m)?;
                }
                assert!(!ks.exists("z"));
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wrong_type_is_reported() {
        let store = Store::memory();
        let err = store
            .eval("wrongtype", 0, |ks| {
                ks.set("k", "v");
                ks.zadd("k", 1, "m")
            })
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::WrongType { key: "k".into() });
    }

    #[test]
    fn redis_payloads_decode_into_pairs() {
        let raw = vec!["a".to_string(), "1700000000123".to_string(), "b".to_string(), "2".to_string()];
        let decoded: Vec<_> = pairs(raw).collect();
        assert_eq!(decoded[0], ("a".to_string(), "1700000000123".to_string()));
        assert_eq!(parse_score(&decoded[0].1).unwrap(), 1_700_000_000_123);
        assert!(parse_score("nan-ish").is_err());
    }

    #[test]
    fn bad_redis_url_is_a_backend_error() {
        assert!(matches!(
            Store::redis("not a url", "q:script-lock"),
            Err(StoreError::Backend(_))
        ));
    }

    /// Two handles on one server share leases. Needs a server at
    /// `RUNQ_TEST_REDIS_URL`; skipped otherwise.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn redis_handles_share_one_keyspace() {
        let Ok(url) = std::env::var("RUNQ_TEST_REDIS_URL") else {
            return;
        };
        let prefix = format!("runq-test-{}", Uuid::new_v4());
        let lock = format!("{prefix}:script-lock");
        let a = Store::redis(&url, lock.clone()).unwrap();
        let b = Store::redis(&url, lock).unwrap();
        let key = format!("{prefix}:lease");
        let now = chrono::Utc::now().timestamp_millis();

        let first = a
            .eval("claim", now, |ks| Ok::<_, StoreError>(ks.set_nx_px(&key, "a", 10_000)))
            .await
            .unwrap();
        let second = b
            .eval("claim", now, |ks| Ok::<_, StoreError>(ks.set_nx_px(&key, "b", 10_000)))
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
        let holder = b.eval("get", now, |ks| ks.get(&key)).await.unwrap();
        assert_eq!(holder.as_deref(), Some("a"));

        a.eval("cleanup", now, |ks| Ok::<_, StoreError>(ks.del(&key)))
            .await
            .unwrap();
    }
}
