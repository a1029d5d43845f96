use std::fs;
use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};
use trainflow_core::pipelines::DEFAULT_PIPELINE;
use trainflow_core::runner::{combine_all, combine_dates, process_date};
use trainflow_core::{
    find_pipeline, BatchStore, CollisionPolicy, CombineError, ExecutionContext, PipelineConfig,
    PipelineError, StoreError, TripKey,
};

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 10, day).unwrap()
}

fn announcement(
    activity: &str,
    train: &str,
    location: &str,
    advertised: &str,
    actual: Option<&str>,
    canceled: bool,
) -> Value {
    let mut record = json!({
        "ActivityId": format!("{train}-{activity}-{location}"),
        "ActivityType": activity,
        "AdvertisedTrainIdent": train,
        "AdvertisedTimeAtLocation": advertised,
        "LocationSignature": location,
        "Canceled": canceled,
        "Operator": "SJ",
        "TypeOfTraffic": [{"Code": "TB", "Description": "Tåg"}]
    });
    if let Some(actual) = actual {
        record["TimeAtLocationWithSeconds"] = json!(actual);
    }
    record
}

fn departure(train: &str, location: &str, advertised: &str, actual: Option<&str>, canceled: bool) -> Value {
    announcement("Avgang", train, location, advertised, actual, canceled)
}

fn arrival(train: &str, location: &str, advertised: &str, actual: Option<&str>, canceled: bool) -> Value {
    announcement("Ankomst", train, location, advertised, actual, canceled)
}

struct Fixture {
    _dir: TempDir,
    store: BatchStore,
    context: ExecutionContext,
}

fn write_json(path: std::path::PathBuf, records: Vec<Value>) {
    fs::write(path, serde_json::to_vec(&Value::Array(records)).unwrap()).unwrap();
}

fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    let store = BatchStore::at_root(dir.path());
    fs::create_dir_all(store.raw_dir()).unwrap();

    fs::write(
        store.station_info_path(),
        "LocationSignature,OfficialLocationName,CountyName,Latitude,Longitude\n\
         Cst,Stockholm Central,Stockholms län,59.3306,18.0583\n\
         U,Uppsala Central,Uppsala län,59.8586,17.6454\n\
         Lp,Linköping Central,Östergötlands län,58.4165,15.6253\n",
    )
    .unwrap();

    // 2024-10-20: an evening run that arrives after midnight.
    write_json(
        store.departures_path(date(20)),
        vec![departure("94", "Cst", "2024-10-20T23:30:00Z", Some("2024-10-20T23:31:00Z"), false)],
    );

    write_json(
        store.departures_path(date(21)),
        vec![
            departure("1240", "Cst", "2024-10-21T08:00:00Z", Some("2024-10-21T08:02:00Z"), false),
            departure("8182", "Cst", "2024-10-21T10:00:00Z", None, true),
            departure("500", "Cst", "2024-10-21T12:00:00Z", Some("2024-10-21T12:04:00Z"), false),
            departure("901", "Cst", "2024-10-21T14:00:00Z", None, false),
            json!({"ActivityType": "Avgang", "AdvertisedTrainIdent": "77"}),
        ],
    );
    write_json(
        store.arrivals_path(date(21)),
        vec![
            arrival("94", "Lp", "2024-10-21T01:10:00Z", Some("2024-10-21T01:15:00Z"), false),
            arrival("1240", "U", "2024-10-21T09:00:00Z", Some("2024-10-21T09:07:00Z"), false),
            arrival("8182", "U", "2024-10-21T10:40:00Z", None, true),
            arrival("500", "U", "2024-10-21T12:40:00Z", None, true),
            arrival("901", "U", "2024-10-21T14:40:00Z", Some("2024-10-21T14:42:00Z"), false),
        ],
    );

    let stations = Arc::new(store.load_stations().unwrap());
    let context = ExecutionContext::new(&PipelineConfig::default(), stations).unwrap();

    Fixture {
        _dir: dir,
        store,
        context,
    }
}

fn process(fixture: &Fixture, day: u32) -> Result<trainflow_core::BatchManifest, PipelineError> {
    let pipeline = find_pipeline(DEFAULT_PIPELINE)?;
    process_date(&fixture.store, &fixture.context, pipeline, date(day))
}

#[test]
fn processing_a_date_splits_main_and_cancelled_outputs() {
    let fixture = fixture();

    let manifest = process(&fixture, 21).unwrap();

    let trips = fixture.store.read_batch_main(date(21)).unwrap();
    let idents: Vec<&str> = trips.iter().map(|t| t.train_ident.as_str()).collect();
    assert_eq!(idents, vec!["1240", "500"]);

    let delayed = &trips[0];
    assert_eq!(delayed.departure_station.as_deref(), Some("Stockholm Central"));
    assert_eq!(delayed.arrival_county.as_deref(), Some("Uppsala län"));
    assert_eq!(delayed.duration_minutes, Some(65));
    assert_eq!(delayed.is_delayed, 1);
    assert!(delayed.distance_km.is_some());

    let filled = &trips[1];
    assert!(filled.canceled);
    assert!(filled.arrival_actual_filled);
    assert_eq!(filled.arrival_actual, filled.arrival_advertised);
    assert_eq!(filled.duration_minutes, Some(36));

    let canceled_bytes = fs::read(fixture.store.canceled_path(date(21))).unwrap();
    let canceled = trainflow_core::frames::trips_from_parquet(&canceled_bytes).unwrap();
    assert_eq!(canceled.len(), 1);
    assert_eq!(canceled[0].train_ident, "8182");
    assert!(canceled[0].departure_actual.is_none());
    assert_eq!(canceled[0].is_delayed, 0);
    assert!(canceled[0].delay_minutes.is_none());

    let report = &manifest.report;
    assert_eq!(report.main_rows, 2);
    assert_eq!(report.canceled_rows, 1);
    assert_eq!(report.rejected_records, 1);
    assert_eq!(report.dropped.get("missing_departure_actual"), Some(&1));
    assert_eq!(report.groups_outside_date, 1);
    assert_eq!(report.overnight_events_moved, 1);
}

#[test]
fn overnight_run_belongs_to_its_departure_date() {
    let fixture = fixture();

    process(&fixture, 20).unwrap();
    process(&fixture, 21).unwrap();

    let previous = fixture.store.read_batch_main(date(20)).unwrap();
    assert_eq!(previous.len(), 1);
    let overnight = &previous[0];
    assert_eq!(overnight.train_ident, "94");
    assert_eq!(overnight.service_date, date(20));
    assert_eq!(overnight.arrival_location.as_deref(), Some("LP"));
    assert_eq!(overnight.duration_minutes, Some(104));
    assert_eq!(overnight.start_hour, Some(23));

    let current = fixture.store.read_batch_main(date(21)).unwrap();
    assert!(current.iter().all(|t| t.train_ident != "94"));
}

#[test]
fn unreadable_neighbour_day_does_not_abort_processing() {
    let fixture = fixture();
    fs::write(fixture.store.departures_path(date(22)), b"{not json").unwrap();

    let manifest = process(&fixture, 21).unwrap();

    assert_eq!(manifest.report.main_rows, 2);
    assert_eq!(manifest.report.overnight_events_moved, 1);
    let trips = fixture.store.read_batch_main(date(21)).unwrap();
    assert_eq!(trips[0].train_ident, "1240");

    // The broken day itself still fails.
    assert!(process(&fixture, 22).is_err());
}

#[test]
fn missing_raw_date_is_an_error() {
    let fixture = fixture();

    let err = process(&fixture, 25).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Store(StoreError::MissingRaw { .. })
    ));
    assert!(!fixture.store.manifest_path(date(25)).exists());
}

#[test]
fn combine_is_idempotent_and_rebuildable() {
    let fixture = fixture();
    process(&fixture, 20).unwrap();
    process(&fixture, 21).unwrap();

    let first = combine_dates(
        &fixture.store,
        &[date(20), date(21)],
        CollisionPolicy::PreferIncoming,
    )
    .unwrap();
    assert_eq!(first.report.rows_before, 0);
    assert_eq!(first.report.rows_after, 3);
    assert_eq!(first.stats.delayed, 1);

    let total_bytes = fs::read(fixture.store.total_path()).unwrap();

    let second = combine_dates(
        &fixture.store,
        &[date(20), date(21)],
        CollisionPolicy::PreferIncoming,
    )
    .unwrap();
    assert_eq!(second.report.rows_before, 3);
    assert_eq!(second.report.rows_after, 3);
    assert_eq!(second.report.inserted, 0);

    let total = fixture.store.read_total().unwrap();
    assert!(total.get(&TripKey::new("94", date(20))).is_some());
    assert_eq!(
        trainflow_core::frames::trips_from_parquet(&total_bytes).unwrap(),
        total.to_trips()
    );

    let rebuilt = combine_all(&fixture.store, CollisionPolicy::PreferIncoming).unwrap();
    assert_eq!(rebuilt.batches, vec![date(20), date(21)]);
    assert_eq!(rebuilt.report.rows_after, 3);
    assert!(!fixture.store.lock_path().exists());
}

#[test]
fn incomplete_batch_leaves_total_untouched() {
    let fixture = fixture();
    process(&fixture, 20).unwrap();
    process(&fixture, 21).unwrap();
    combine_dates(&fixture.store, &[date(20)], CollisionPolicy::default()).unwrap();
    let before = fs::read(fixture.store.total_path()).unwrap();

    fs::remove_file(fixture.store.manifest_path(date(21))).unwrap();
    let err = combine_dates(
        &fixture.store,
        &[date(20), date(21)],
        CollisionPolicy::default(),
    )
    .unwrap_err();

    assert!(matches!(err, CombineError::IncompleteBatch { .. }));
    assert_eq!(fs::read(fixture.store.total_path()).unwrap(), before);
    assert!(!fixture.store.lock_path().exists());
}

#[test]
fn held_lock_blocks_combine() {
    let fixture = fixture();
    process(&fixture, 21).unwrap();
    let _held = fixture.store.lock_combine().unwrap();

    let err = combine_dates(&fixture.store, &[date(21)], CollisionPolicy::default()).unwrap_err();
    assert!(matches!(err, CombineError::Locked { .. }));
    assert!(!fixture.store.total_path().exists());
}

#[test]
fn unknown_pipeline_is_reported() {
    assert!(matches!(
        find_pipeline("nope"),
        Err(PipelineError::UnknownPipeline(_))
    ));
}
