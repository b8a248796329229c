use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use detailflow::cli::{
    DetailflowConfig, ENV_DEFAULT_PARALLELISM, ENV_HIGH_PARALLELISM, ENV_LOW_PARALLELISM,
};
use detailflow::engine::PoolConfig;
use detailflow::engine::types::PoolName;
use detailflow::storage::Journal;
use detailflow::storage::memory_store::MemoryJournal;
use tempfile::NamedTempFile;

fn write_config(yaml: &str) -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(yaml.as_bytes()).unwrap();
    f
}

fn no_env(_: &str) -> Option<String> {
    None
}

#[test]
fn load_valid_config_all_fields() {
    let f = write_config(
        r#"
store_dir: "custom/runs"
high_parallelism: 20
default_parallelism: 8
low_parallelism: 2
step_timeout_s: 30
"#,
    );

    let cfg = DetailflowConfig::load(Some(f.path())).unwrap();

    assert_eq!(cfg.store_dir.as_deref(), Some("custom/runs"));
    assert_eq!(cfg.high_parallelism, Some(20));
    assert_eq!(cfg.default_parallelism, Some(8));
    assert_eq!(cfg.low_parallelism, Some(2));
    assert_eq!(cfg.step_timeout(), Some(Duration::from_secs(30)));
}

#[test]
fn load_partial_config() {
    let f = write_config("low_parallelism: 1\n");

    let cfg = DetailflowConfig::load(Some(f.path())).unwrap();

    assert_eq!(cfg.low_parallelism, Some(1));
    assert!(cfg.store_dir.is_none());
    assert!(cfg.high_parallelism.is_none());
    assert!(cfg.default_parallelism.is_none());
    assert!(cfg.step_timeout().is_none());
}

#[test]
fn missing_explicit_path_returns_error() {
    let result = DetailflowConfig::load(Some(Path::new("/nonexistent/detailflow.yaml")));
    assert!(result.is_err());
    assert!(
        result
            .unwrap_err()
            .to_string()
            .contains("Config file not found")
    );
}

#[test]
fn invalid_yaml_returns_error() {
    let f = write_config("high_parallelism: [not, a, number]\n");
    let err = DetailflowConfig::load(Some(f.path())).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config file"));
}

#[test]
fn store_dir_prefers_cli_then_file_then_default() {
    let cfg = DetailflowConfig {
        store_dir: Some("from/file".to_string()),
        ..Default::default()
    };
    assert_eq!(
        cfg.store_dir(Some(Path::new("from/cli"))),
        PathBuf::from("from/cli")
    );
    assert_eq!(cfg.store_dir(None), PathBuf::from("from/file"));
    assert_eq!(
        DetailflowConfig::default().store_dir(None),
        PathBuf::from("data/runs")
    );
}

#[test]
fn pool_limits_default_to_priority_tiers() {
    let pools = PoolConfig::from_config(&DetailflowConfig::default(), no_env).unwrap();
    assert_eq!(pools, PoolConfig::default());
}

#[test]
fn env_overrides_config_file() {
    let cfg = DetailflowConfig {
        high_parallelism: Some(4),
        default_parallelism: Some(4),
        low_parallelism: Some(4),
        ..Default::default()
    };
    let env: HashMap<&str, &str> = HashMap::from([
        (ENV_HIGH_PARALLELISM, "16"),
        (ENV_LOW_PARALLELISM, " 1 "),
    ]);

    let pools = PoolConfig::from_config(&cfg, |key| env.get(key).map(|v| v.to_string())).unwrap();

    assert_eq!(pools.limit(PoolName::High), 16);
    assert_eq!(pools.limit(PoolName::Default), 4);
    assert_eq!(pools.limit(PoolName::Low), 1);
}

#[test]
fn zero_limits_are_clamped_to_one() {
    let cfg = DetailflowConfig {
        high_parallelism: Some(0),
        ..Default::default()
    };
    let pools = PoolConfig::from_config(&cfg, |key| {
        (key == ENV_DEFAULT_PARALLELISM).then(|| "0".to_string())
    })
    .unwrap();

    assert_eq!(pools.high, 1);
    assert_eq!(pools.default, 1);
    assert_eq!(pools.low, 3);
}

#[test]
fn invalid_env_value_is_an_error() {
    let err = PoolConfig::from_config(&DetailflowConfig::default(), |key| {
        (key == ENV_HIGH_PARALLELISM).then(|| "lots".to_string())
    })
    .unwrap_err();
    assert!(err.to_string().contains(ENV_HIGH_PARALLELISM));
}

#[tokio::test]
async fn manager_uses_configured_pools() {
    let f = write_config("low_parallelism: 2\nhigh_parallelism: 7\n");
    let cfg = DetailflowConfig::load(Some(f.path())).unwrap();
    // Resolve without the process environment so ambient variables cannot leak in.
    let expected = PoolConfig::from_config(&cfg, no_env).unwrap();
    assert_eq!(expected.low, 2);
    assert_eq!(expected.high, 7);

    let journal: Arc<dyn Journal> = Arc::new(MemoryJournal::new());
    let manager = cfg.manager(journal).unwrap();
    let limits: Vec<usize> = manager
        .pools()
        .stats()
        .iter()
        .map(|s| s.max_parallelism)
        .collect();
    assert_eq!(limits.len(), 3);
}
