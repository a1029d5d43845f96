use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};
use trainflow_parser::{StationInfo, StationTable};

use crate::error::{StationRole, UnresolvedStationError};
use crate::resolution::ResolvedTrip;
use crate::trip::{Trip, TripKey};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Arrival delays strictly above this many seconds mark a trip as delayed.
pub const DELAY_THRESHOLD_SECONDS: i64 = 359;

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedTrip {
    pub trip: Trip,
    pub unresolved: Vec<UnresolvedStationError>,
}

pub fn haversine_km(from: (f64, f64), to: (f64, f64)) -> f64 {
    let (lat1, lon1) = from;
    let (lat2, lon2) = to;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Whole minutes between two instants, rounded to the nearest minute.
pub fn duration_minutes(start: NaiveDateTime, end: NaiveDateTime) -> i64 {
    let seconds = (end - start).num_seconds();
    (seconds as f64 / 60.0).round() as i64
}

pub fn is_delayed(advertised: NaiveDateTime, actual: NaiveDateTime) -> bool {
    (actual - advertised).num_seconds() > DELAY_THRESHOLD_SECONDS
}

pub(crate) fn lookup_station<'a>(
    stations: &'a StationTable,
    key: &TripKey,
    role: StationRole,
    code: Option<&str>,
    unresolved: &mut Vec<UnresolvedStationError>,
) -> Option<&'a StationInfo> {
    let code = code?;
    match stations.lookup(code) {
        Some(station) => {
            if station.coordinates().is_none() {
                unresolved.push(UnresolvedStationError::MissingCoordinates {
                    key: key.clone(),
                    role,
                    code: code.to_string(),
                });
            }
            Some(station)
        }
        None => {
            unresolved.push(UnresolvedStationError::UnknownCode {
                key: key.clone(),
                role,
                code: code.to_string(),
            });
            None
        }
    }
}

/// Computes the derived trip features from a resolved skeleton.
///
/// Station misses never fail the trip; they leave the station attributes and distance
/// absent and are reported in [`EnrichedTrip::unresolved`].
pub fn enrich(resolved: ResolvedTrip, stations: &StationTable) -> EnrichedTrip {
    let ResolvedTrip {
        skeleton,
        departure_actual,
        arrival_actual,
        departure_actual_filled,
        arrival_actual_filled,
        ..
    } = resolved;

    let key = skeleton.key;
    let departure_location = skeleton.departure.as_ref().and_then(|leg| leg.location.clone());
    let arrival_location = skeleton.arrival.as_ref().and_then(|leg| leg.location.clone());
    let departure_advertised = skeleton.departure.as_ref().map(|leg| leg.advertised);
    let arrival_advertised = skeleton.arrival.as_ref().map(|leg| leg.advertised);

    let mut unresolved = Vec::new();
    let departure_station = lookup_station(
        stations,
        &key,
        StationRole::Departure,
        departure_location.as_deref(),
        &mut unresolved,
    );
    let arrival_station = lookup_station(
        stations,
        &key,
        StationRole::Arrival,
        arrival_location.as_deref(),
        &mut unresolved,
    );

    let distance_km = match (
        departure_station.and_then(StationInfo::coordinates),
        arrival_station.and_then(StationInfo::coordinates),
    ) {
        (Some(from), Some(to)) => Some(round_to(haversine_km(from, to), 3)),
        _ => None,
    };

    let duration = match (departure_actual, arrival_actual) {
        (Some(dep), Some(arr)) => Some(duration_minutes(dep, arr)),
        _ => None,
    };

    let (delay_minutes, delayed) = match (arrival_advertised, arrival_actual) {
        (Some(advertised), Some(actual)) => {
            let seconds = (actual - advertised).num_seconds();
            (
                Some(seconds as f64 / 60.0),
                u8::from(is_delayed(advertised, actual)),
            )
        }
        // No arrival actual: the trip never reached its destination late.
        _ => (None, 0),
    };

    let service_date = key.service_date;
    let weekday = !matches!(service_date.weekday(), Weekday::Sat | Weekday::Sun);

    let trip = Trip {
        train_ident: key.train_ident,
        service_date,
        departure_station: departure_station.and_then(|s| s.name.clone()),
        arrival_station: arrival_station.and_then(|s| s.name.clone()),
        arrival_county: arrival_station.and_then(|s| s.county.clone()),
        departure_location,
        arrival_location,
        departure_advertised,
        departure_actual,
        arrival_advertised,
        arrival_actual,
        departure_actual_filled,
        arrival_actual_filled,
        canceled: skeleton.canceled,
        operator: skeleton.operator,
        train_owner: skeleton.train_owner,
        traffic_type: skeleton.traffic_type,
        deviation: skeleton.deviation,
        duration_minutes: duration,
        delay_minutes,
        distance_km,
        is_delayed: delayed,
        duration_inconsistent: duration.is_some_and(|minutes| minutes < 0),
        start_hour: departure_advertised.map(|ts| ts.hour()),
        start_day_of_month: service_date.day(),
        start_month: service_date.month(),
        is_weekday: u8::from(weekday),
    };

    EnrichedTrip { trip, unresolved }
}
