//! Pipeline configuration loaded from TOML.
//!
//! The config file is selected via:
//! 1. an explicit path (the CLI's `--config`)
//! 2. the `TRAINFLOW_CONFIG` environment variable
//! 3. built-in defaults
//!
//! `TRAINFLOW_DATA_DIR` and `TRAINFLOW_TIMEZONE` override the file afterwards.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use trainflow_parser::CanonicalClock;

use crate::combine::CollisionPolicy;
use crate::error::ConfigError;
use crate::matching::DEFAULT_OVERNIGHT_GAP_MINUTES;

pub const CONFIG_ENV: &str = "TRAINFLOW_CONFIG";
pub const DATA_DIR_ENV: &str = "TRAINFLOW_DATA_DIR";
pub const TIMEZONE_ENV: &str = "TRAINFLOW_TIMEZONE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_raw_prefix")]
    pub raw_prefix: String,
    #[serde(default = "default_curated_prefix")]
    pub curated_prefix: String,
    /// Subdirectory of both the raw and curated directories holding timetable data.
    #[serde(default = "default_planned_prefix")]
    pub planned_prefix: String,
    /// Station reference table, relative to the raw directory unless absolute.
    #[serde(default = "default_station_info")]
    pub station_info: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            raw_prefix: default_raw_prefix(),
            curated_prefix: default_curated_prefix(),
            planned_prefix: default_planned_prefix(),
            station_info: default_station_info(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from("data")
}

fn default_raw_prefix() -> String {
    "raw".to_string()
}

fn default_curated_prefix() -> String {
    "curated".to_string()
}

fn default_planned_prefix() -> String {
    "planned".to_string()
}

fn default_station_info() -> PathBuf {
    PathBuf::from("station_info.csv")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// IANA timezone every timestamp is converted into.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_overnight_gap")]
    pub overnight_gap_minutes: i64,
    #[serde(default = "default_lookback_days")]
    pub default_lookback_days: u32,
    #[serde(default = "default_pipeline")]
    pub pipeline: String,
    #[serde(default = "default_planned_pipeline")]
    pub planned_pipeline: String,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            overnight_gap_minutes: default_overnight_gap(),
            default_lookback_days: default_lookback_days(),
            pipeline: default_pipeline(),
            planned_pipeline: default_planned_pipeline(),
        }
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_overnight_gap() -> i64 {
    DEFAULT_OVERNIGHT_GAP_MINUTES
}

fn default_lookback_days() -> u32 {
    2
}

fn default_pipeline() -> String {
    crate::pipelines::DEFAULT_PIPELINE.to_string()
}

fn default_planned_pipeline() -> String {
    crate::pipelines::PLANNED_PIPELINE.to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CombineConfig {
    #[serde(default)]
    pub collision_policy: CollisionPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub combine: CombineConfig,
}

impl PipelineConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Resolves the config file, applies environment overrides, and validates the result.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let selected = explicit
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match selected {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(
            env::var(DATA_DIR_ENV).ok().as_deref(),
            env::var(TIMEZONE_ENV).ok().as_deref(),
        );
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, data_dir: Option<&str>, timezone: Option<&str>) {
        if let Some(dir) = data_dir.map(str::trim).filter(|dir| !dir.is_empty()) {
            self.storage.root = PathBuf::from(dir);
        }
        if let Some(tz) = timezone.map(str::trim).filter(|tz| !tz.is_empty()) {
            self.processing.timezone = tz.to_string();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.clock()?;
        self.overnight_gap()?;
        let storage = &self.storage;
        if [&storage.raw_prefix, &storage.curated_prefix, &storage.planned_prefix]
            .iter()
            .any(|prefix| prefix.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "storage prefixes must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn clock(&self) -> Result<CanonicalClock, ConfigError> {
        CanonicalClock::from_name(&self.processing.timezone)
            .map_err(|err| ConfigError::Invalid(err.to_string()))
    }

    pub fn overnight_gap(&self) -> Result<TimeDelta, ConfigError> {
        if self.processing.overnight_gap_minutes <= 0 {
            return Err(ConfigError::Invalid(format!(
                "overnight_gap_minutes must be positive, got {}",
                self.processing.overnight_gap_minutes
            )));
        }
        TimeDelta::try_minutes(self.processing.overnight_gap_minutes).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "overnight_gap_minutes {} is out of range",
                self.processing.overnight_gap_minutes
            ))
        })
    }
}
