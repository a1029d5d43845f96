use std::fs;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::{json, Value};
use tempfile::tempdir;
use trainflow_core::frames::planned_from_parquet;
use trainflow_core::grouping::group_events;
use trainflow_core::pipelines::{PlannedPipeline, PlannedTimetablePipeline, PLANNED_PIPELINE};
use trainflow_core::planned::{build_planned_trip, dedup_planned, UNKNOWN_STATION};
use trainflow_core::runner::process_planned_date;
use trainflow_core::{
    find_planned_pipeline, BatchStore, ExecutionContext, PipelineConfig, PipelineError,
    StoreError, TripKey,
};
use trainflow_parser::{ActivityKind, RawEvent, StationInfo, StationTable};

fn ts(raw: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M").unwrap()
}

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 10, day).unwrap()
}

fn planned(
    train: &str,
    activity: ActivityKind,
    location: Option<&str>,
    advertised: &str,
) -> RawEvent {
    let advertised = ts(advertised);
    RawEvent {
        activity_id: None,
        train_ident: train.to_string(),
        service_date: advertised.date(),
        activity,
        location: location.map(str::to_string),
        advertised,
        actual: None,
        canceled: false,
        operator: Some("SJ".to_string()),
        train_owner: Some("SJ".to_string()),
        traffic_type: Some("TB".to_string()),
        deviation: None,
        origin: Some("CST".to_string()),
        destination: Some("U".to_string()),
    }
}

fn departure(train: &str, location: &str, advertised: &str) -> RawEvent {
    planned(train, ActivityKind::Departure, Some(location), advertised)
}

fn arrival(train: &str, location: &str, advertised: &str) -> RawEvent {
    planned(train, ActivityKind::Arrival, Some(location), advertised)
}

fn stations() -> StationTable {
    StationTable::from_records([
        StationInfo {
            code: "CST".to_string(),
            name: Some("Stockholm Central".to_string()),
            county: Some("Stockholms län".to_string()),
            latitude: Some(59.3306),
            longitude: Some(18.0583),
        },
        StationInfo {
            code: "U".to_string(),
            name: Some("Uppsala Central".to_string()),
            county: Some("Uppsala län".to_string()),
            latitude: Some(59.8586),
            longitude: Some(17.6454),
        },
    ])
}

#[test]
fn repeated_announcements_are_dropped_once_per_activity() {
    let mut with_id = departure("1", "CST", "2024-10-22 08:00");
    with_id.activity_id = Some("a-1".to_string());
    let mut same_id_later = departure("1", "SOD", "2024-10-22 08:10");
    same_id_later.activity_id = Some("a-1".to_string());

    let events = vec![
        same_id_later,
        with_id,
        departure("1", "CST", "2024-10-22 08:00"),
        // Same slot as a departure, but an arrival: kept.
        arrival("1", "CST", "2024-10-22 08:00"),
        arrival("1", "U", "2024-10-22 08:40"),
    ];

    let (kept, removed) = dedup_planned(events);

    assert_eq!(removed, 2);
    assert_eq!(kept.len(), 3);
    assert_eq!(kept[0].activity_id.as_deref(), Some("a-1"));
    assert_eq!(kept[0].location.as_deref(), Some("CST"));
}

#[test]
fn timetable_row_spans_first_departure_to_last_arrival() {
    let mut first = arrival("10", "CST", "2024-10-22 07:55");
    first.operator = Some("Mälartåg".to_string());
    let mut leaving = departure("10", "CST", "2024-10-22 08:00");
    leaving.deviation = Some("Spårändrat".to_string());
    leaving.operator = Some("Mälartåg".to_string());
    let events = vec![
        first,
        leaving,
        departure("10", "KNV", "2024-10-22 08:20"),
        arrival("10", "KNV", "2024-10-22 08:19"),
        arrival("10", "U", "2024-10-22 08:37"),
        departure("10", "U", "2024-10-22 08:45"),
    ];
    let grouping = group_events(events);
    let key = TripKey::new("10", date(22));

    let built = build_planned_trip(&key, &grouping[&key], &stations()).unwrap();
    let trip = built.trip;

    assert!(built.unresolved.is_empty());
    assert_eq!(trip.start_time, ts("2024-10-22 08:00"));
    assert_eq!(trip.end_time, ts("2024-10-22 08:37"));
    assert_eq!(trip.start_station, "CST");
    assert_eq!(trip.end_station, "U");
    assert_eq!(trip.duration_minutes, 37.0);
    assert_eq!(trip.through_stations, "CST,KNV,U");
    assert_eq!(trip.stops_count, 3);
    // Two of six events name Mälartåg, four name SJ.
    assert_eq!(trip.operator.as_deref(), Some("SJ"));
    assert_eq!(trip.start_operator.as_deref(), Some("Mälartåg"));
    assert_eq!(trip.start_deviation.as_deref(), Some("Spårändrat"));
    assert_eq!(trip.start_hour, 8);
    // 2024-10-22 is a Tuesday.
    assert_eq!(trip.start_weekday, 1);
    assert_eq!(trip.is_weekday, 1);
    assert_eq!(trip.start_month, 10);

    let distance = trip.distance_km.unwrap();
    assert!((60.0..70.0).contains(&distance), "{distance}");
    assert_eq!((distance * 1000.0).round() / 1000.0, distance);
}

#[test]
fn missing_endpoint_locations_fall_back_to_the_route() {
    let events = vec![
        planned("20", ActivityKind::Departure, None, "2024-10-26 09:00"),
        planned("20", ActivityKind::Arrival, None, "2024-10-26 09:30"),
    ];
    let grouping = group_events(events);
    let key = TripKey::new("20", date(26));

    let trip = build_planned_trip(&key, &grouping[&key], &stations())
        .unwrap()
        .trip;

    assert_eq!(trip.start_station, "CST");
    assert_eq!(trip.end_station, "U");
    assert_eq!(trip.stops_count, 0);
    assert!(trip.through_stations.is_empty());
    assert_eq!(trip.is_weekday, 0);
    assert!(trip.distance_km.is_some());

    let mut bare = planned("21", ActivityKind::Departure, None, "2024-10-26 09:00");
    bare.origin = None;
    let grouping = group_events(vec![bare]);
    let key = TripKey::new("21", date(26));
    let built = build_planned_trip(&key, &grouping[&key], &stations()).unwrap();
    assert_eq!(built.trip.start_station, UNKNOWN_STATION);
    assert!(built.trip.distance_km.is_none());
    assert!(built.unresolved.is_empty());
}

#[test]
fn most_common_value_breaks_ties_by_smallest() {
    let mut a = departure("30", "CST", "2024-10-22 10:00");
    a.train_owner = Some("Transdev".to_string());
    let mut b = arrival("30", "U", "2024-10-22 10:40");
    b.train_owner = Some("Arriva".to_string());
    let grouping = group_events(vec![a, b]);
    let key = TripKey::new("30", date(22));

    let trip = build_planned_trip(&key, &grouping[&key], &stations())
        .unwrap()
        .trip;

    assert_eq!(trip.train_owner.as_deref(), Some("Arriva"));
    assert_eq!(trip.start_owner.as_deref(), Some("Transdev"));
}

#[test]
fn pipeline_discards_implausible_durations_and_other_dates() {
    let context = ExecutionContext {
        stations: Arc::new(stations()),
        ..ExecutionContext::default()
    };
    let events = vec![
        departure("1", "CST", "2024-10-22 08:00"),
        arrival("1", "U", "2024-10-22 08:40"),
        // Arrives before it leaves.
        departure("2", "CST", "2024-10-22 09:00"),
        arrival("2", "U", "2024-10-22 08:30"),
        departure("3", "CST", "2024-10-23 08:00"),
        arrival("4", "XYZ", "2024-10-22 11:00"),
    ];

    let output = PlannedTimetablePipeline
        .run_batch(&context, date(22), events)
        .unwrap();

    let idents: Vec<&str> = output.trips.iter().map(|t| t.train_ident.as_str()).collect();
    assert_eq!(idents, vec!["1", "4"]);
    assert_eq!(output.report.groups, 3);
    assert_eq!(output.report.implausible_duration, 1);
    assert_eq!(output.report.unresolved_stations, 2);
    assert_eq!(output.report.trips, 2);
}

fn announcement(activity: &str, train: &str, location: &str, advertised: &str) -> Value {
    json!({
        "ActivityId": format!("{train}-{activity}-{location}"),
        "ActivityType": activity,
        "AdvertisedTrainIdent": train,
        "AdvertisedTimeAtLocation": advertised,
        "LocationSignature": location,
        "Canceled": false,
        "Operator": "SJ",
        "FromLocation": [{"LocationName": "Cst", "Priority": 1, "Order": 0}],
        "ToLocation": [{"LocationName": "U", "Priority": 1, "Order": 0}]
    })
}

#[test]
fn planned_date_writes_dated_and_latest_timetables() {
    let dir = tempdir().unwrap();
    let store = BatchStore::at_root(dir.path());
    fs::create_dir_all(store.planned_raw_dir()).unwrap();
    let records = |values: Vec<Value>| serde_json::to_vec(&Value::Array(values)).unwrap();
    fs::write(
        store.planned_departures_path(date(22)),
        records(vec![
            announcement("Avgang", "1240", "Cst", "2024-10-22T08:00:00Z"),
            announcement("Avgang", "1240", "Cst", "2024-10-22T08:00:00Z"),
            json!({"ActivityType": "Avgang"}),
        ]),
    )
    .unwrap();
    fs::write(
        store.planned_arrivals_path(date(22)),
        records(vec![announcement("Ankomst", "1240", "U", "2024-10-22T09:00:00Z")]),
    )
    .unwrap();
    let context = ExecutionContext::new(&PipelineConfig::default(), Arc::new(stations())).unwrap();
    let pipeline = find_planned_pipeline(PLANNED_PIPELINE).unwrap();

    let report = process_planned_date(&store, &context, pipeline, date(22)).unwrap();

    assert_eq!(report.records, 4);
    assert_eq!(report.rejected_records, 1);
    assert_eq!(report.duplicates_removed, 1);
    assert_eq!(report.trips, 1);
    assert_eq!(store.planned_raw_dates().unwrap(), vec![date(22)]);

    let dated = fs::read(store.planned_path(date(22))).unwrap();
    assert_eq!(fs::read(store.planned_latest_path()).unwrap(), dated);
    let trips = planned_from_parquet(&dated).unwrap();
    assert_eq!(trips.len(), 1);
    assert_eq!(trips[0].train_ident, "1240");
    assert_eq!(trips[0].duration_minutes, 60.0);
    assert_eq!(trips[0].origin.as_deref(), Some("CST"));
    assert_eq!(trips[0].through_stations, "CST,U");

    // The planned files never count as announcements of an actual service date.
    assert!(store.raw_dates().unwrap().is_empty());
}

#[test]
fn planned_date_without_trips_writes_nothing() {
    let dir = tempdir().unwrap();
    let store = BatchStore::at_root(dir.path());
    fs::create_dir_all(store.planned_raw_dir()).unwrap();
    fs::write(store.planned_departures_path(date(22)), b"[]").unwrap();
    let context = ExecutionContext::default();
    let pipeline = find_planned_pipeline(PLANNED_PIPELINE).unwrap();

    let err = process_planned_date(&store, &context, pipeline, date(22)).unwrap_err();
    assert!(matches!(err, PipelineError::NoPlannedTrips { .. }));
    assert!(!store.planned_latest_path().exists());

    let err = process_planned_date(&store, &context, pipeline, date(23)).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Store(StoreError::MissingRaw { .. })
    ));
}

#[test]
fn unknown_planned_pipeline_is_reported() {
    assert!(matches!(
        find_planned_pipeline("timetable_v0"),
        Err(PipelineError::UnknownPipeline(_))
    ));
}
