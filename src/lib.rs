pub mod backlog;
pub mod clock;
pub mod constraints;
pub mod cron;
pub mod error;
pub mod factory;
pub mod item;
pub mod keys;
pub mod metrics;
pub mod migrate;
pub mod partition;
pub mod processor;
pub mod queue_shard;
pub mod retry;
pub mod settings;
pub mod store;
pub mod trace;
pub mod ulid;

pub use runq_macros::test;
