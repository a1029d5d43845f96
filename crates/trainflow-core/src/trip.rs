use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Identity of a trip. Ordering is by service date first, then train identifier, which is
/// also the sort order of every curated output and of the combined total.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TripKey {
    pub service_date: NaiveDate,
    pub train_ident: String,
}

impl TripKey {
    pub fn new(train_ident: impl Into<String>, service_date: NaiveDate) -> Self {
        Self {
            service_date,
            train_ident: train_ident.into(),
        }
    }
}

impl fmt::Display for TripKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.train_ident, self.service_date.format("%Y-%m-%d"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub train_ident: String,
    pub service_date: NaiveDate,
    pub departure_location: Option<String>,
    pub arrival_location: Option<String>,
    pub departure_station: Option<String>,
    pub arrival_station: Option<String>,
    pub arrival_county: Option<String>,
    pub departure_advertised: Option<NaiveDateTime>,
    pub departure_actual: Option<NaiveDateTime>,
    pub arrival_advertised: Option<NaiveDateTime>,
    pub arrival_actual: Option<NaiveDateTime>,
    pub departure_actual_filled: bool,
    pub arrival_actual_filled: bool,
    pub canceled: bool,
    pub operator: Option<String>,
    pub train_owner: Option<String>,
    pub traffic_type: Option<String>,
    pub deviation: Option<String>,
    pub duration_minutes: Option<i64>,
    pub delay_minutes: Option<f64>,
    pub distance_km: Option<f64>,
    pub is_delayed: u8,
    pub duration_inconsistent: bool,
    pub start_hour: Option<u32>,
    pub start_day_of_month: u32,
    pub start_month: u32,
    pub is_weekday: u8,
}

impl Trip {
    pub fn key(&self) -> TripKey {
        TripKey::new(self.train_ident.clone(), self.service_date)
    }

    /// Number of optional attributes with no value.
    pub fn absent_field_count(&self) -> usize {
        let text = [
            &self.departure_location,
            &self.arrival_location,
            &self.departure_station,
            &self.arrival_station,
            &self.arrival_county,
            &self.operator,
            &self.train_owner,
            &self.traffic_type,
            &self.deviation,
        ]
        .iter()
        .filter(|value| value.is_none())
        .count();

        let times = [
            self.departure_advertised,
            self.departure_actual,
            self.arrival_advertised,
            self.arrival_actual,
        ]
        .iter()
        .filter(|value| value.is_none())
        .count();

        let numeric = [
            self.duration_minutes.is_none(),
            self.delay_minutes.is_none(),
            self.distance_km.is_none(),
            self.start_hour.is_none(),
        ]
        .iter()
        .filter(|absent| **absent)
        .count();

        text + times + numeric
    }

    pub fn is_delayed(&self) -> bool {
        self.is_delayed == 1
    }
}
