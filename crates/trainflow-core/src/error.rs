use std::fmt;
use std::path::PathBuf;

use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;
use trainflow_parser::{ActivityKind, ParserError};

use crate::trip::TripKey;

/// A matched trip whose cancellation and actual-time combination is not covered by the
/// resolution table. The trip is excluded from both outputs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error(
        "trip {key}: unlisted combination (canceled={canceled}, departure actual={departure_actual}, arrival actual={arrival_actual})"
    )]
    UnlistedCombination {
        key: TripKey,
        canceled: bool,
        departure_actual: bool,
        arrival_actual: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StationRole {
    Departure,
    Arrival,
}

impl fmt::Display for StationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StationRole::Departure => f.write_str("departure"),
            StationRole::Arrival => f.write_str("arrival"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnresolvedStationError {
    #[error("trip {key}: {role} location {code} is not in the station table")]
    UnknownCode {
        key: TripKey,
        role: StationRole,
        code: String,
    },

    #[error("trip {key}: {role} station {code} has no coordinates")]
    MissingCoordinates {
        key: TripKey,
        role: StationRole,
        code: String,
    },
}

impl UnresolvedStationError {
    pub fn code(&self) -> &str {
        match self {
            UnresolvedStationError::UnknownCode { code, .. }
            | UnresolvedStationError::MissingCoordinates { code, .. } => code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "trip {key}: {candidates} {activity} events share advertised time {advertised}; kept sequence {chosen_sequence}"
)]
pub struct AmbiguousMatchError {
    pub key: TripKey,
    pub activity: ActivityKind,
    pub advertised: NaiveDateTime,
    pub candidates: usize,
    pub chosen_sequence: usize,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("polars operation failed: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("column {column} row {row}: {reason}")]
    InvalidValue {
        column: &'static str,
        row: usize,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Parser(#[from] ParserError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("no raw announcements for {date}")]
    MissingRaw { date: NaiveDate },

    #[error("curated batch {date} is incomplete: {reason}")]
    IncompleteBatch { date: NaiveDate, reason: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum CombineError {
    #[error(
        "{} colliding trips disagree on identity (first: {}); rebuild the total with `combine --all` to accept the reprocessed batches",
        .keys.len(),
        first_key(.keys)
    )]
    Conflict { keys: Vec<TripKey> },

    #[error("combine lock {path} is held by another run")]
    Locked { path: PathBuf },

    #[error("curated batch {date} is incomplete: {reason}")]
    IncompleteBatch { date: NaiveDate, reason: String },

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl From<StoreError> for CombineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::IncompleteBatch { date, reason } => {
                CombineError::IncompleteBatch { date, reason }
            }
            other => CombineError::Store(other),
        }
    }
}

fn first_key(keys: &[TripKey]) -> String {
    keys.first()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string())
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("processing pipeline '{0}' not found")]
    UnknownPipeline(String),

    #[error("no planned trips for {date}")]
    NoPlannedTrips { date: NaiveDate },

    #[error("processing task for {date} failed: {reason}")]
    Task { date: NaiveDate, reason: String },
}
