use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActivityKind {
    Departure,
    Arrival,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Departure => "departure",
            ActivityKind::Arrival => "arrival",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ActivityKind {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_lowercase().as_str() {
            "departure" | "avgang" | "avgång" | "avgångar" => Ok(ActivityKind::Departure),
            "arrival" | "ankomst" | "ankomster" => Ok(ActivityKind::Arrival),
            other => Err(other.to_string()),
        }
    }
}

/// One normalized train announcement. Every timestamp is wall-clock time in the canonical
/// timezone of the [`CanonicalClock`](crate::CanonicalClock) that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub activity_id: Option<String>,
    pub train_ident: String,
    pub service_date: NaiveDate,
    pub activity: ActivityKind,
    pub location: Option<String>,
    pub advertised: NaiveDateTime,
    pub actual: Option<NaiveDateTime>,
    pub canceled: bool,
    pub operator: Option<String>,
    pub train_owner: Option<String>,
    pub traffic_type: Option<String>,
    pub deviation: Option<String>,
    pub origin: Option<String>,
    pub destination: Option<String>,
}

impl RawEvent {
    pub fn is_departure(&self) -> bool {
        self.activity == ActivityKind::Departure
    }

    pub fn is_arrival(&self) -> bool {
        self.activity == ActivityKind::Arrival
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationInfo {
    pub code: String,
    pub name: Option<String>,
    pub county: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl StationInfo {
    /// `(latitude, longitude)` when both are known.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => Some((lat, lon)),
            _ => None,
        }
    }
}
