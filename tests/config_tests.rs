mod test_helpers;

use std::io::Write;

use runq::error::QueueError;
use runq::settings::{AppConfig, LogFormat, DEFAULT_REDIS_URL, DEFAULT_SHARD_NAME};

use test_helpers::*;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().expect("tempfile");
    f.write_all(contents.as_bytes()).expect("write config");
    f
}

#[runq::test]
fn defaults_without_a_file() {
    let cfg = AppConfig::load(None).expect("defaults");
    assert_eq!(cfg.log_format, LogFormat::Text);
    assert!(cfg.metrics.addr.is_none());
    assert_eq!(cfg.shards.len(), 1);
    assert_eq!(cfg.shards[0].name, DEFAULT_SHARD_NAME);
    assert_eq!(cfg.shards[0].kind, "redis");
    assert_eq!(cfg.shards[0].key_prefix(), DEFAULT_SHARD_NAME);
    assert_eq!(cfg.shards[0].redis_url(), DEFAULT_REDIS_URL);
    assert_eq!(cfg.queue.num_workers, 100);
    assert_eq!(cfg.queue.item_lease_ms, 30_000);
    assert_eq!(cfg.queue.partition_lease_ms, 4_000);
    assert!(cfg.run_mode.sequential);
}

#[runq::test]
fn file_overrides_are_merged_with_defaults() {
    let f = write_config(
        r#"
log_format = "json"

[metrics]
addr = "127.0.0.1:9191"

[queue]
num_workers = 8
partition_lookahead_ms = 250

[queue.queue_kind_mapping]
pause = "pauses"

[run_mode]
account = false

[[shards]]
name = "a"
prefix = "qa"
url = "redis://queue-a:6379/2"

[[shards]]
name = "b"
kind = "memory"
"#,
    );
    let cfg = AppConfig::load(Some(f.path())).expect("load");
    assert_eq!(cfg.log_format, LogFormat::Json);
    assert_eq!(cfg.metrics.addr.as_deref(), Some("127.0.0.1:9191"));
    assert_eq!(cfg.queue.num_workers, 8);
    assert_eq!(cfg.queue.partition_lookahead_ms, 250);
    // untouched fields keep their defaults
    assert_eq!(cfg.queue.item_lease_ms, 30_000);
    assert_eq!(cfg.queue.queue_kind_mapping.get("pause").map(String::as_str), Some("pauses"));
    assert!(!cfg.run_mode.account);
    assert!(cfg.run_mode.partition);
    let names: Vec<_> = cfg.shards.iter().map(|s| (s.name.as_str(), s.key_prefix())).collect();
    assert_eq!(names, vec![("a", "qa"), ("b", "b")]);
    assert_eq!(cfg.shards[0].redis_url(), "redis://queue-a:6379/2");
    assert_eq!(cfg.shards[1].kind, "memory");
}

#[runq::test]
fn a_config_file_needs_a_shard() {
    let f = write_config("shards = []\n");
    let err = AppConfig::load(Some(f.path())).unwrap_err();
    assert!(err.to_string().contains("at least one shard"), "{err}");
}

#[runq::test]
fn unknown_log_formats_are_rejected() {
    let f = write_config("log_format = \"xml\"\n");
    assert!(AppConfig::load(Some(f.path())).is_err());
}

#[runq::test]
async fn config_lease_is_held_by_one_claimant() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let shard = q.shard();
        let held = shard.config_lease("scavenger", 10_000, None, T0).await.expect("claim");
        assert_eq!(held.timestamp_ms(), T0 + 10_000);

        let other = shard.config_lease("scavenger", 10_000, None, T0 + 1).await;
        assert!(matches!(other, Err(QueueError::ConfigAlreadyLeased(name)) if name == "scavenger"));

        let renewed = shard
            .config_lease("scavenger", 10_000, Some(held), T0 + 5_000)
            .await
            .expect("renew");
        assert_eq!(renewed.timestamp_ms(), T0 + 15_000);

        // another claimant takes over once it lapses
        shard
            .config_lease("scavenger", 10_000, None, T0 + 15_001)
            .await
            .expect("claim after expiry");
    });
}

#[runq::test]
async fn config_lease_release_frees_it_early() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let shard = q.shard();
        let held = shard.config_lease("instrument", 10_000, None, T0).await.unwrap();
        shard.release_config_lease("instrument", held, T0 + 1).await.unwrap();
        shard
            .config_lease("instrument", 10_000, None, T0 + 2)
            .await
            .expect("claim after release");
    });
}

#[runq::test]
async fn config_lease_duration_is_capped() {
    with_timeout!(5000, {
        let q = open_test_queue();
        let res = q.shard().config_lease("seq", 60_001, None, T0).await;
        assert!(matches!(res, Err(QueueError::ConfigLeaseExceedsLimits)));
    });
}
