use std::fs;
use std::path::PathBuf;

use chrono::TimeDelta;
use chrono_tz::Tz;
use tempfile::tempdir;
use trainflow_core::{BatchStore, CollisionPolicy, ConfigError, PipelineConfig};

#[test]
fn empty_file_uses_defaults() {
    let config = PipelineConfig::from_toml_str("").unwrap();

    assert_eq!(config, PipelineConfig::default());
    assert_eq!(config.storage.root, PathBuf::from("data"));
    assert_eq!(config.processing.timezone, "UTC");
    assert_eq!(config.processing.default_lookback_days, 2);
    assert_eq!(config.processing.pipeline, "trip_reconciliation_v1");
    assert_eq!(config.processing.planned_pipeline, "planned_timetable_v1");
    assert_eq!(config.storage.planned_prefix, "planned");
    assert_eq!(config.combine.collision_policy, CollisionPolicy::PreferIncoming);
    assert_eq!(config.overnight_gap().unwrap(), TimeDelta::minutes(180));
}

#[test]
fn partial_sections_keep_remaining_defaults() {
    let config = PipelineConfig::from_toml_str(
        r#"
[storage]
root = "/srv/trains"

[processing]
timezone = "Europe/Stockholm"
overnight_gap_minutes = 120

[combine]
collision_policy = "prefer_more_complete"
"#,
    )
    .unwrap();

    assert_eq!(config.storage.root, PathBuf::from("/srv/trains"));
    assert_eq!(config.storage.raw_prefix, "raw");
    assert_eq!(config.clock().unwrap().timezone(), Tz::Europe__Stockholm);
    assert_eq!(config.overnight_gap().unwrap(), TimeDelta::minutes(120));
    assert_eq!(
        config.combine.collision_policy,
        CollisionPolicy::PreferMoreComplete
    );

    let store = BatchStore::new(&config.storage);
    assert_eq!(store.raw_dir(), PathBuf::from("/srv/trains/raw").as_path());
    assert_eq!(
        store.station_info_path(),
        PathBuf::from("/srv/trains/raw/station_info.csv").as_path()
    );
    assert_eq!(
        store.planned_dir(),
        PathBuf::from("/srv/trains/curated/planned").as_path()
    );
}

#[test]
fn invalid_values_are_rejected() {
    let err = PipelineConfig::from_toml_str("[processing]\ntimezone = \"Mars/Olympus\"\n")
        .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));

    let err = PipelineConfig::from_toml_str("[processing]\novernight_gap_minutes = 0\n")
        .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));

    let err = PipelineConfig::from_toml_str("[storage]\nraw_prefix = \" \"\n").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));

    let err = PipelineConfig::from_toml_str("[combine]\ncollision_policy = \"newest\"\n")
        .unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn overrides_replace_root_and_timezone() {
    let mut config = PipelineConfig::default();

    config.apply_overrides(Some("/tmp/other"), Some(" Europe/Stockholm "));
    assert_eq!(config.storage.root, PathBuf::from("/tmp/other"));
    assert_eq!(config.processing.timezone, "Europe/Stockholm");

    config.apply_overrides(Some(""), None);
    assert_eq!(config.storage.root, PathBuf::from("/tmp/other"));
}

#[test]
fn explicit_file_is_loaded() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trainflow.toml");
    fs::write(&path, "[processing]\ndefault_lookback_days = 5\n").unwrap();

    let config = PipelineConfig::from_file(&path).unwrap();
    assert_eq!(config.processing.default_lookback_days, 5);

    let err = PipelineConfig::from_file(dir.path().join("missing.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}
