//! Timetable trips for upcoming service dates.
//!
//! Planned announcements carry advertised times only, so nothing is matched against actuals
//! here: every train of a date becomes one row spanning its first departure to its last
//! arrival, with the stations it passes through.

use std::collections::{BTreeMap, HashSet};

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use trainflow_parser::{ActivityKind, RawEvent, StationInfo, StationTable};

use crate::enrichment::{haversine_km, lookup_station, round_to};
use crate::error::{StationRole, UnresolvedStationError};
use crate::grouping::SequencedEvent;
use crate::trip::TripKey;

/// Placeholder when neither the endpoint event nor the train's route names a station.
pub const UNKNOWN_STATION: &str = "<UNKNOWN>";

/// Timetable rows outside `0..=MAX_PLANNED_DURATION_MINUTES` are discarded as implausible.
pub const MAX_PLANNED_DURATION_MINUTES: f64 = 1500.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTrip {
    pub train_ident: String,
    pub service_date: NaiveDate,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub start_station: String,
    pub end_station: String,
    pub duration_minutes: f64,
    /// Distinct locations in timetable order, comma separated.
    pub through_stations: String,
    pub stops_count: u32,
    pub any_canceled: bool,
    pub operator: Option<String>,
    pub train_owner: Option<String>,
    pub origin: Option<String>,
    pub destination: Option<String>,
    pub start_operator: Option<String>,
    pub start_owner: Option<String>,
    pub start_traffic_type: Option<String>,
    pub start_deviation: Option<String>,
    pub start_hour: u32,
    /// Monday = 0.
    pub start_weekday: u32,
    pub start_month: u32,
    pub is_weekday: u8,
    pub distance_km: Option<f64>,
}

impl PlannedTrip {
    pub fn key(&self) -> TripKey {
        TripKey::new(self.train_ident.clone(), self.service_date)
    }
}

/// Drops repeated announcements, keeping the earliest advertised copy. Departures and arrivals
/// are deduplicated separately: first by activity id, then by (train, location, advertised
/// time). Returns the kept events and the number removed.
pub fn dedup_planned(mut events: Vec<RawEvent>) -> (Vec<RawEvent>, usize) {
    let before = events.len();
    events.sort_by_key(|event| event.advertised);

    let mut ids: HashSet<(ActivityKind, String)> = HashSet::new();
    let mut slots: HashSet<(ActivityKind, String, Option<String>, NaiveDateTime)> = HashSet::new();
    events.retain(|event| {
        if let Some(id) = &event.activity_id {
            if !ids.insert((event.activity, id.clone())) {
                return false;
            }
        }
        slots.insert((
            event.activity,
            event.train_ident.clone(),
            event.location.clone(),
            event.advertised,
        ))
    });

    let removed = before - events.len();
    (events, removed)
}

/// Most frequent present value; ties go to the smallest value.
fn most_common<'a>(values: impl Iterator<Item = Option<&'a String>>) -> Option<String> {
    let mut counts: BTreeMap<&String, usize> = BTreeMap::new();
    for value in values.flatten() {
        *counts.entry(value).or_default() += 1;
    }
    let mut best: Option<(&String, usize)> = None;
    for (value, count) in counts {
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value.clone())
}

fn endpoint<'a>(
    stations: &'a StationTable,
    key: &TripKey,
    role: StationRole,
    code: &str,
    unresolved: &mut Vec<UnresolvedStationError>,
) -> Option<&'a StationInfo> {
    if code == UNKNOWN_STATION {
        return None;
    }
    lookup_station(stations, key, role, Some(code), unresolved)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedBuild {
    pub trip: PlannedTrip,
    pub unresolved: Vec<UnresolvedStationError>,
}

/// Builds the timetable row of one (train, date) group.
///
/// The start is the first departure (else the first event), the end the last arrival (else
/// the last event). Returns `None` for an empty group.
pub fn build_planned_trip(
    key: &TripKey,
    group: &[SequencedEvent],
    stations: &StationTable,
) -> Option<PlannedBuild> {
    let ordered: Vec<&RawEvent> = {
        let mut sequenced: Vec<&SequencedEvent> = group.iter().collect();
        sequenced.sort_by_key(|item| (item.event.advertised, item.sequence));
        sequenced.into_iter().map(|item| &item.event).collect()
    };
    if ordered.is_empty() {
        return None;
    }

    let start = ordered
        .iter()
        .copied()
        .find(|event| event.is_departure())
        .unwrap_or(ordered[0]);
    let end = ordered
        .iter()
        .rev()
        .copied()
        .find(|event| event.is_arrival())
        .unwrap_or(ordered[ordered.len() - 1]);

    let start_station = start
        .location
        .clone()
        .or_else(|| ordered.iter().find_map(|event| event.origin.clone()))
        .unwrap_or_else(|| UNKNOWN_STATION.to_string());
    let end_station = end
        .location
        .clone()
        .or_else(|| ordered.iter().find_map(|event| event.destination.clone()))
        .unwrap_or_else(|| UNKNOWN_STATION.to_string());

    let mut seen = HashSet::new();
    let through: Vec<&str> = ordered
        .iter()
        .filter_map(|event| event.location.as_deref())
        .filter(|code| seen.insert(*code))
        .collect();

    let mut unresolved = Vec::new();
    let from = endpoint(stations, key, StationRole::Departure, &start_station, &mut unresolved)
        .and_then(StationInfo::coordinates);
    let to = endpoint(stations, key, StationRole::Arrival, &end_station, &mut unresolved)
        .and_then(StationInfo::coordinates);
    let distance_km = match (from, to) {
        (Some(from), Some(to)) => Some(round_to(haversine_km(from, to), 3)),
        _ => None,
    };

    let start_time = start.advertised;
    let end_time = end.advertised;
    let duration_seconds = (end_time - start_time).num_seconds();
    let weekday = start_time.weekday().num_days_from_monday();

    let trip = PlannedTrip {
        train_ident: key.train_ident.clone(),
        service_date: key.service_date,
        start_time,
        end_time,
        start_station,
        end_station,
        duration_minutes: round_to(duration_seconds as f64 / 60.0, 2),
        through_stations: through.join(","),
        stops_count: through.len() as u32,
        any_canceled: ordered.iter().any(|event| event.canceled),
        operator: most_common(ordered.iter().copied().map(|event| event.operator.as_ref())),
        train_owner: most_common(ordered.iter().copied().map(|event| event.train_owner.as_ref())),
        origin: most_common(ordered.iter().copied().map(|event| event.origin.as_ref())),
        destination: most_common(ordered.iter().copied().map(|event| event.destination.as_ref())),
        start_operator: start.operator.clone(),
        start_owner: start.train_owner.clone(),
        start_traffic_type: start.traffic_type.clone(),
        start_deviation: start.deviation.clone(),
        start_hour: start_time.hour(),
        start_weekday: weekday,
        start_month: start_time.month(),
        is_weekday: u8::from(weekday < 5),
        distance_km,
    };

    Some(PlannedBuild { trip, unresolved })
}

pub fn plausible_duration(trip: &PlannedTrip) -> bool {
    (0.0..=MAX_PLANNED_DURATION_MINUTES).contains(&trip.duration_minutes)
}
