use chrono::{NaiveDate, NaiveDateTime};
use trainflow_core::{combine, CollisionPolicy, CombineError, CombinedTotal, Trip, TripKey};

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 10, day).unwrap()
}

fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
    date(day).and_hms_opt(hour, minute, 0).unwrap()
}

fn trip(train: &str, day: u32, delay: i64) -> Trip {
    let departure = at(day, 8, 0);
    let arrival = at(day, 9, 0);
    let arrival_actual = arrival + chrono::TimeDelta::minutes(delay);
    Trip {
        train_ident: train.to_string(),
        service_date: date(day),
        departure_location: Some("CST".to_string()),
        arrival_location: Some("U".to_string()),
        departure_station: Some("Stockholm Central".to_string()),
        arrival_station: Some("Uppsala Central".to_string()),
        arrival_county: Some("Uppsala län".to_string()),
        departure_advertised: Some(departure),
        departure_actual: Some(departure),
        arrival_advertised: Some(arrival),
        arrival_actual: Some(arrival_actual),
        departure_actual_filled: false,
        arrival_actual_filled: false,
        canceled: false,
        operator: Some("SJ".to_string()),
        train_owner: Some("SJ".to_string()),
        traffic_type: Some("TB".to_string()),
        deviation: None,
        duration_minutes: Some(60 + delay),
        delay_minutes: Some(delay as f64),
        distance_km: Some(63.1),
        duration_inconsistent: false,
        start_hour: Some(8),
        start_day_of_month: day,
        start_month: 10,
        is_weekday: 1,
        is_delayed: u8::from(delay * 60 > 359),
    }
}

#[test]
fn merge_into_empty_total_inserts_everything_sorted() {
    let batch = vec![trip("900", 21, 0), trip("12", 21, 9), trip("5", 20, 0)];

    let (total, report) = combine(&CombinedTotal::new(), &batch, CollisionPolicy::default())
        .expect("combine");

    assert_eq!(report.rows_before, 0);
    assert_eq!(report.rows_after, 3);
    assert_eq!(report.inserted, 3);
    let order: Vec<(NaiveDate, String)> = total
        .trips()
        .map(|t| (t.service_date, t.train_ident.clone()))
        .collect();
    assert_eq!(
        order,
        vec![
            (date(20), "5".to_string()),
            (date(21), "12".to_string()),
            (date(21), "900".to_string()),
        ]
    );
}

#[test]
fn combining_the_same_batch_twice_is_idempotent() {
    let batch = vec![trip("1", 21, 0), trip("2", 21, 8)];
    let (once, _) = combine(&CombinedTotal::new(), &batch, CollisionPolicy::default()).unwrap();

    let (twice, report) = combine(&once, &batch, CollisionPolicy::default()).unwrap();

    assert_eq!(once, twice);
    assert_eq!(report.inserted, 0);
    assert_eq!(report.replaced, 2);
    assert_eq!(report.rows_before, report.rows_after);
}

#[test]
fn prefer_incoming_replaces_colliding_rows() {
    let (total, _) = combine(
        &CombinedTotal::new(),
        &[trip("1", 21, 0)],
        CollisionPolicy::PreferIncoming,
    )
    .unwrap();

    let (total, report) =
        combine(&total, &[trip("1", 21, 12)], CollisionPolicy::PreferIncoming).unwrap();

    let key = TripKey::new("1", date(21));
    assert_eq!(report.replaced, 1);
    assert_eq!(total.get(&key).unwrap().delay_minutes, Some(12.0));
}

#[test]
fn prefer_existing_keeps_the_stored_row() {
    let (total, _) = combine(
        &CombinedTotal::new(),
        &[trip("1", 21, 0)],
        CollisionPolicy::PreferExisting,
    )
    .unwrap();

    let (total, report) =
        combine(&total, &[trip("1", 21, 12)], CollisionPolicy::PreferExisting).unwrap();

    let key = TripKey::new("1", date(21));
    assert_eq!(report.kept_existing, 1);
    assert_eq!(total.get(&key).unwrap().delay_minutes, Some(0.0));
}

#[test]
fn prefer_more_complete_compares_absent_fields() {
    let mut sparse = trip("1", 21, 12);
    sparse.distance_km = None;
    sparse.arrival_county = None;
    let (total, _) = combine(
        &CombinedTotal::new(),
        &[trip("1", 21, 0)],
        CollisionPolicy::PreferMoreComplete,
    )
    .unwrap();

    let (kept, report) =
        combine(&total, &[sparse], CollisionPolicy::PreferMoreComplete).unwrap();
    assert_eq!(report.kept_existing, 1);
    assert_eq!(
        kept.get(&TripKey::new("1", date(21))).unwrap().delay_minutes,
        Some(0.0)
    );

    // equal completeness: incoming wins
    let (replaced, report) =
        combine(&kept, &[trip("1", 21, 4)], CollisionPolicy::PreferMoreComplete).unwrap();
    assert_eq!(report.replaced, 1);
    assert_eq!(
        replaced.get(&TripKey::new("1", date(21))).unwrap().delay_minutes,
        Some(4.0)
    );
}

#[test]
fn identity_mismatch_fails_without_touching_the_total() {
    let (total, _) = combine(
        &CombinedTotal::new(),
        &[trip("1", 21, 0), trip("2", 21, 0)],
        CollisionPolicy::default(),
    )
    .unwrap();
    let snapshot = total.clone();

    let mut moved = trip("2", 21, 0);
    moved.departure_location = Some("M".to_string());
    let err = combine(
        &total,
        &[trip("1", 21, 5), moved, trip("3", 21, 0)],
        CollisionPolicy::default(),
    )
    .unwrap_err();

    assert!(err.to_string().contains("combine --all"), "{err}");
    match err {
        CombineError::Conflict { keys } => {
            assert_eq!(keys, vec![TripKey::new("2", date(21))]);
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(total, snapshot);
}

#[test]
fn stats_summarize_the_total() {
    let total = CombinedTotal::from_trips(vec![
        trip("1", 20, 0),
        trip("1", 21, 10),
        trip("2", 21, 3),
        trip("3", 22, 7),
    ]);

    let stats = total.stats();

    assert_eq!(stats.rows, 4);
    assert_eq!(stats.first_date, Some(date(20)));
    assert_eq!(stats.last_date, Some(date(22)));
    assert_eq!(stats.distinct_dates, 3);
    assert_eq!(stats.distinct_trains, 3);
    assert_eq!(stats.delayed, 2);
    assert!((stats.delayed_percentage - 50.0).abs() < f64::EPSILON);
}

#[test]
fn persisted_duplicates_keep_the_later_row() {
    let total = CombinedTotal::from_trips(vec![trip("1", 21, 0), trip("1", 21, 9)]);

    assert_eq!(total.len(), 1);
    assert_eq!(
        total.get(&TripKey::new("1", date(21))).unwrap().delay_minutes,
        Some(9.0)
    );
}

#[test]
fn collision_policy_parses_config_spellings() {
    assert_eq!(
        "prefer-existing".parse::<CollisionPolicy>().unwrap(),
        CollisionPolicy::PreferExisting
    );
    assert_eq!(
        "PREFER_MORE_COMPLETE".parse::<CollisionPolicy>().unwrap(),
        CollisionPolicy::PreferMoreComplete
    );
    assert!("newest".parse::<CollisionPolicy>().is_err());
    assert_eq!(CollisionPolicy::default().to_string(), "prefer_incoming");
}
