use std::collections::HashMap;

use crate::error::QueueError;
use crate::queue_shard::QueueShard;
use crate::settings::ShardConfig;
use crate::store::{Store, StoreError};

/// Holds the configured queue shards by name. The first shard is the primary.
#[derive(Debug, Clone)]
pub struct ShardRegistry {
    instances: HashMap<String, QueueShard>,
    primary: String,
}

impl ShardRegistry {
    /// A registry with a single shard.
    pub fn single(shard: QueueShard) -> Self {
        let primary = shard.name().to_string();
        let mut instances = HashMap::new();
        instances.insert(primary.clone(), shard);
        Self { instances, primary }
    }

    /// Open every configured shard, each on its own store under its own key prefix.
    pub fn open(configs: &[ShardConfig]) -> Result<Self, QueueError> {
        let first = configs
            .first()
            .ok_or_else(|| QueueError::QueueShardNotFound("<none configured>".into()))?;
        let mut instances = HashMap::with_capacity(configs.len());
        for cfg in configs {
            let shard = QueueShard::new(&cfg.name, &cfg.kind, open_store(cfg)?, cfg.key_prefix());
            instances.insert(cfg.name.clone(), shard);
        }
        Ok(Self {
            instances,
            primary: first.name.clone(),
        })
    }

    pub fn get(&self, name: &str) -> Option<&QueueShard> {
        self.instances.get(name)
    }

    /// Like `get`, but an unknown name is an error.
    pub fn require(&self, name: &str) -> Result<&QueueShard, QueueError> {
        self.get(name)
            .ok_or_else(|| QueueError::QueueShardNotFound(name.to_string()))
    }

    pub fn primary(&self) -> &QueueShard {
        // `primary` is always inserted by the constructors
        &self.instances[&self.primary]
    }

    pub fn add(&mut self, shard: QueueShard) {
        self.instances.insert(shard.name().to_string(), shard);
    }

    pub fn instances(&self) -> &HashMap<String, QueueShard> {
        &self.instances
    }

    /// Shards in name order, so loops visit them deterministically.
    pub fn sorted(&self) -> Vec<&QueueShard> {
        let mut shards: Vec<&QueueShard> = self.instances.values().collect();
        shards.sort_by(|a, b| a.name().cmp(b.name()));
        shards
    }
}

/// Build the store backing one shard config.
pub fn open_store(cfg: &ShardConfig) -> Result<Store, StoreError> {
    match cfg.kind.as_str() {
        "redis" => Store::redis(cfg.redis_url(), format!("{}:script-lock", cfg.key_prefix())),
        "memory" => Ok(Store::memory()),
        other => Err(StoreError::UnsupportedKind(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(name: &str) -> ShardConfig {
        ShardConfig {
            name: name.into(),
            kind: "memory".into(),
            prefix: None,
            url: None,
        }
    }

    #[test]
    fn first_configured_shard_is_primary() {
        let reg = ShardRegistry::open(&[cfg("b"), cfg("a")]).unwrap();
        assert_eq!(reg.primary().name(), "b");
        assert_eq!(reg.sorted().iter().map(|s| s.name()).collect::<Vec<_>>(), ["a", "b"]);
        assert!(matches!(reg.require("c"), Err(QueueError::QueueShardNotFound(_))));
    }

    #[test]
    fn empty_config_is_rejected() {
        assert!(ShardRegistry::open(&[]).is_err());
    }

    #[test]
    fn shard_kinds_pick_their_store() {
        let mut redis = cfg("r");
        redis.kind = "redis".into();
        redis.url = Some("redis://127.0.0.1:6390".into());
        // opening a pool does not connect eagerly
        assert_eq!(format!("{:?}", open_store(&redis).unwrap()), r#"Store { kind: "redis" }"#);
        assert_eq!(format!("{:?}", open_store(&cfg("m")).unwrap()), r#"Store { kind: "memory" }"#);

        let mut bad = cfg("x");
        bad.kind = "etcd".into();
        assert_eq!(open_store(&bad).unwrap_err(), StoreError::UnsupportedKind("etcd".into()));
    }
}
