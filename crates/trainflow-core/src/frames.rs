use std::io::Cursor;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use polars::io::parquet::write::{ParquetCompression, ParquetWriter, StatisticsOptions};
use polars::prelude::*;

use crate::error::FrameError;
use crate::planned::PlannedTrip;
use crate::trip::Trip;

pub const TRIP_COLUMNS: [&str; 27] = [
    "train_ident",
    "service_date",
    "departure_location",
    "arrival_location",
    "departure_station",
    "arrival_station",
    "arrival_county",
    "departure_advertised",
    "departure_actual",
    "arrival_advertised",
    "arrival_actual",
    "departure_actual_filled",
    "arrival_actual_filled",
    "canceled",
    "operator",
    "train_owner",
    "traffic_type",
    "deviation",
    "duration_minutes",
    "delay_minutes",
    "distance_km",
    "is_delayed",
    "duration_inconsistent",
    "start_hour",
    "start_day_of_month",
    "start_month",
    "is_weekday",
];

/// Days from 0001-01-01 (CE) to 1970-01-01.
const EPOCH_DAYS_FROM_CE: i32 = 719_163;

fn datetime_dtype() -> DataType {
    DataType::Datetime(TimeUnit::Microseconds, None)
}

fn to_micros(ts: Option<NaiveDateTime>) -> Option<i64> {
    ts.map(|ts| ts.and_utc().timestamp_micros())
}

fn to_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - EPOCH_DAYS_FROM_CE
}

fn text_column(name: &str, trips: &[Trip], field: impl Fn(&Trip) -> Option<&String>) -> Column {
    let values: Vec<Option<String>> = trips.iter().map(|t| field(t).cloned()).collect();
    Series::new(name.into(), values).into()
}

fn datetime_column(
    name: &str,
    trips: &[Trip],
    field: impl Fn(&Trip) -> Option<NaiveDateTime>,
) -> Result<Column, FrameError> {
    let values: Vec<Option<i64>> = trips.iter().map(|t| to_micros(field(t))).collect();
    Ok(Series::new(name.into(), values)
        .cast(&datetime_dtype())?
        .into())
}

/// Builds the curated trip frame; column order is [`TRIP_COLUMNS`].
pub fn trips_to_frame(trips: &[Trip]) -> Result<DataFrame, FrameError> {
    let service_dates: Vec<i32> = trips.iter().map(|t| to_days(t.service_date)).collect();
    let service_date = Series::new("service_date".into(), service_dates).cast(&DataType::Date)?;

    let columns: Vec<Column> = vec![
        Series::new(
            "train_ident".into(),
            trips.iter().map(|t| t.train_ident.clone()).collect::<Vec<_>>(),
        )
        .into(),
        service_date.into(),
        text_column("departure_location", trips, |t| t.departure_location.as_ref()),
        text_column("arrival_location", trips, |t| t.arrival_location.as_ref()),
        text_column("departure_station", trips, |t| t.departure_station.as_ref()),
        text_column("arrival_station", trips, |t| t.arrival_station.as_ref()),
        text_column("arrival_county", trips, |t| t.arrival_county.as_ref()),
        datetime_column("departure_advertised", trips, |t| t.departure_advertised)?,
        datetime_column("departure_actual", trips, |t| t.departure_actual)?,
        datetime_column("arrival_advertised", trips, |t| t.arrival_advertised)?,
        datetime_column("arrival_actual", trips, |t| t.arrival_actual)?,
        Series::new(
            "departure_actual_filled".into(),
            trips.iter().map(|t| t.departure_actual_filled).collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "arrival_actual_filled".into(),
            trips.iter().map(|t| t.arrival_actual_filled).collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "canceled".into(),
            trips.iter().map(|t| t.canceled).collect::<Vec<_>>(),
        )
        .into(),
        text_column("operator", trips, |t| t.operator.as_ref()),
        text_column("train_owner", trips, |t| t.train_owner.as_ref()),
        text_column("traffic_type", trips, |t| t.traffic_type.as_ref()),
        text_column("deviation", trips, |t| t.deviation.as_ref()),
        Series::new(
            "duration_minutes".into(),
            trips.iter().map(|t| t.duration_minutes).collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "delay_minutes".into(),
            trips.iter().map(|t| t.delay_minutes).collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "distance_km".into(),
            trips.iter().map(|t| t.distance_km).collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "is_delayed".into(),
            trips
                .iter()
                .map(|t| i32::from(t.is_delayed))
                .collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "duration_inconsistent".into(),
            trips.iter().map(|t| t.duration_inconsistent).collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "start_hour".into(),
            trips
                .iter()
                .map(|t| t.start_hour.map(|h| h as i32))
                .collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "start_day_of_month".into(),
            trips
                .iter()
                .map(|t| t.start_day_of_month as i32)
                .collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "start_month".into(),
            trips.iter().map(|t| t.start_month as i32).collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "is_weekday".into(),
            trips.iter().map(|t| i32::from(t.is_weekday)).collect::<Vec<_>>(),
        )
        .into(),
    ];

    Ok(DataFrame::new(columns)?)
}

fn read_text(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>, FrameError> {
    let column = df.column(name)?.cast(&DataType::String)?;
    let values = column
        .as_materialized_series()
        .str()?
        .into_iter()
        .map(|value| value.map(str::to_string))
        .collect();
    Ok(values)
}

fn read_i64(df: &DataFrame, name: &str) -> Result<Vec<Option<i64>>, FrameError> {
    let column = df.column(name)?.cast(&DataType::Int64)?;
    let values = column.as_materialized_series().i64()?.into_iter().collect();
    Ok(values)
}

fn read_f64(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, FrameError> {
    let column = df.column(name)?.cast(&DataType::Float64)?;
    let values = column.as_materialized_series().f64()?.into_iter().collect();
    Ok(values)
}

fn read_bool(df: &DataFrame, name: &str) -> Result<Vec<Option<bool>>, FrameError> {
    let column = df.column(name)?.cast(&DataType::Boolean)?;
    let values = column.as_materialized_series().bool()?.into_iter().collect();
    Ok(values)
}

fn read_datetime(df: &DataFrame, name: &str) -> Result<Vec<Option<NaiveDateTime>>, FrameError> {
    // Normalize to microseconds so frames written with another unit still read correctly.
    let column = df
        .column(name)?
        .cast(&datetime_dtype())?
        .cast(&DataType::Int64)?;
    let values = column
        .as_materialized_series()
        .i64()?
        .into_iter()
        .map(|micros| {
            micros
                .and_then(DateTime::from_timestamp_micros)
                .map(|dt| dt.naive_utc())
        })
        .collect();
    Ok(values)
}

fn read_dates(df: &DataFrame, name: &'static str) -> Result<Vec<NaiveDate>, FrameError> {
    let column = df
        .column(name)?
        .cast(&DataType::Date)?
        .cast(&DataType::Int32)?;
    let days = column.as_materialized_series().i32()?;

    days.into_iter()
        .enumerate()
        .map(|(row, value)| {
            value
                .and_then(|d| d.checked_add(EPOCH_DAYS_FROM_CE))
                .and_then(NaiveDate::from_num_days_from_ce_opt)
                .ok_or_else(|| FrameError::InvalidValue {
                    column: name,
                    row,
                    reason: "missing or out-of-range date".to_string(),
                })
        })
        .collect()
}

fn required<T>(value: Option<T>, column: &'static str, row: usize) -> Result<T, FrameError> {
    value.ok_or_else(|| FrameError::InvalidValue {
        column,
        row,
        reason: "null in required column".to_string(),
    })
}

fn small_unsigned(value: Option<i64>, column: &'static str, row: usize) -> Result<u32, FrameError> {
    let raw = required(value, column, row)?;
    u32::try_from(raw).map_err(|_| FrameError::InvalidValue {
        column,
        row,
        reason: format!("{raw} is not a valid unsigned value"),
    })
}

fn flag(value: Option<i64>, column: &'static str, row: usize) -> Result<u8, FrameError> {
    match value {
        Some(0) => Ok(0),
        Some(1) => Ok(1),
        other => Err(FrameError::InvalidValue {
            column,
            row,
            reason: format!("expected 0 or 1, found {other:?}"),
        }),
    }
}

/// Reads a frame produced by [`trips_to_frame`] back into trips.
pub fn frame_to_trips(df: &DataFrame) -> Result<Vec<Trip>, FrameError> {
    let train_ident = read_text(df, "train_ident")?;
    let service_date = read_dates(df, "service_date")?;
    let departure_location = read_text(df, "departure_location")?;
    let arrival_location = read_text(df, "arrival_location")?;
    let departure_station = read_text(df, "departure_station")?;
    let arrival_station = read_text(df, "arrival_station")?;
    let arrival_county = read_text(df, "arrival_county")?;
    let departure_advertised = read_datetime(df, "departure_advertised")?;
    let departure_actual = read_datetime(df, "departure_actual")?;
    let arrival_advertised = read_datetime(df, "arrival_advertised")?;
    let arrival_actual = read_datetime(df, "arrival_actual")?;
    let departure_filled = read_bool(df, "departure_actual_filled")?;
    let arrival_filled = read_bool(df, "arrival_actual_filled")?;
    let canceled = read_bool(df, "canceled")?;
    let operator = read_text(df, "operator")?;
    let train_owner = read_text(df, "train_owner")?;
    let traffic_type = read_text(df, "traffic_type")?;
    let deviation = read_text(df, "deviation")?;
    let duration_minutes = read_i64(df, "duration_minutes")?;
    let delay_minutes = read_f64(df, "delay_minutes")?;
    let distance_km = read_f64(df, "distance_km")?;
    let is_delayed = read_i64(df, "is_delayed")?;
    let duration_inconsistent = read_bool(df, "duration_inconsistent")?;
    let start_hour = read_i64(df, "start_hour")?;
    let start_day = read_i64(df, "start_day_of_month")?;
    let start_month = read_i64(df, "start_month")?;
    let is_weekday = read_i64(df, "is_weekday")?;

    let mut trips = Vec::with_capacity(df.height());
    for row in 0..df.height() {
        trips.push(Trip {
            train_ident: required(train_ident[row].clone(), "train_ident", row)?,
            service_date: service_date[row],
            departure_location: departure_location[row].clone(),
            arrival_location: arrival_location[row].clone(),
            departure_station: departure_station[row].clone(),
            arrival_station: arrival_station[row].clone(),
            arrival_county: arrival_county[row].clone(),
            departure_advertised: departure_advertised[row],
            departure_actual: departure_actual[row],
            arrival_advertised: arrival_advertised[row],
            arrival_actual: arrival_actual[row],
            departure_actual_filled: departure_filled[row].unwrap_or(false),
            arrival_actual_filled: arrival_filled[row].unwrap_or(false),
            canceled: required(canceled[row], "canceled", row)?,
            operator: operator[row].clone(),
            train_owner: train_owner[row].clone(),
            traffic_type: traffic_type[row].clone(),
            deviation: deviation[row].clone(),
            duration_minutes: duration_minutes[row],
            delay_minutes: delay_minutes[row],
            distance_km: distance_km[row],
            is_delayed: flag(is_delayed[row], "is_delayed", row)?,
            duration_inconsistent: duration_inconsistent[row].unwrap_or(false),
            start_hour: start_hour[row]
                .map(|value| small_unsigned(Some(value), "start_hour", row))
                .transpose()?,
            start_day_of_month: small_unsigned(start_day[row], "start_day_of_month", row)?,
            start_month: small_unsigned(start_month[row], "start_month", row)?,
            is_weekday: flag(is_weekday[row], "is_weekday", row)?,
        });
    }

    Ok(trips)
}

pub const PLANNED_COLUMNS: [&str; 23] = [
    "train_ident",
    "service_date",
    "start_time",
    "end_time",
    "start_station",
    "end_station",
    "duration_minutes",
    "through_stations",
    "stops_count",
    "any_canceled",
    "operator",
    "train_owner",
    "origin",
    "destination",
    "start_operator",
    "start_owner",
    "start_traffic_type",
    "start_deviation",
    "start_hour",
    "start_weekday",
    "start_month",
    "is_weekday",
    "distance_km",
];

fn planned_text(
    name: &str,
    trips: &[PlannedTrip],
    field: impl Fn(&PlannedTrip) -> Option<&String>,
) -> Column {
    let values: Vec<Option<String>> = trips.iter().map(|t| field(t).cloned()).collect();
    Series::new(name.into(), values).into()
}

fn planned_int(name: &str, trips: &[PlannedTrip], field: impl Fn(&PlannedTrip) -> u32) -> Column {
    let values: Vec<i32> = trips.iter().map(|t| field(t) as i32).collect();
    Series::new(name.into(), values).into()
}

fn planned_time(
    name: &str,
    trips: &[PlannedTrip],
    field: impl Fn(&PlannedTrip) -> NaiveDateTime,
) -> Result<Column, FrameError> {
    let values: Vec<i64> = trips
        .iter()
        .map(|t| field(t).and_utc().timestamp_micros())
        .collect();
    Ok(Series::new(name.into(), values)
        .cast(&datetime_dtype())?
        .into())
}

/// Builds the timetable frame; column order is [`PLANNED_COLUMNS`].
pub fn planned_to_frame(trips: &[PlannedTrip]) -> Result<DataFrame, FrameError> {
    let service_dates: Vec<i32> = trips.iter().map(|t| to_days(t.service_date)).collect();
    let service_date = Series::new("service_date".into(), service_dates).cast(&DataType::Date)?;

    let columns: Vec<Column> = vec![
        Series::new(
            "train_ident".into(),
            trips.iter().map(|t| t.train_ident.clone()).collect::<Vec<_>>(),
        )
        .into(),
        service_date.into(),
        planned_time("start_time", trips, |t| t.start_time)?,
        planned_time("end_time", trips, |t| t.end_time)?,
        Series::new(
            "start_station".into(),
            trips.iter().map(|t| t.start_station.clone()).collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "end_station".into(),
            trips.iter().map(|t| t.end_station.clone()).collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "duration_minutes".into(),
            trips.iter().map(|t| t.duration_minutes).collect::<Vec<_>>(),
        )
        .into(),
        Series::new(
            "through_stations".into(),
            trips.iter().map(|t| t.through_stations.clone()).collect::<Vec<_>>(),
        )
        .into(),
        planned_int("stops_count", trips, |t| t.stops_count),
        Series::new(
            "any_canceled".into(),
            trips.iter().map(|t| t.any_canceled).collect::<Vec<_>>(),
        )
        .into(),
        planned_text("operator", trips, |t| t.operator.as_ref()),
        planned_text("train_owner", trips, |t| t.train_owner.as_ref()),
        planned_text("origin", trips, |t| t.origin.as_ref()),
        planned_text("destination", trips, |t| t.destination.as_ref()),
        planned_text("start_operator", trips, |t| t.start_operator.as_ref()),
        planned_text("start_owner", trips, |t| t.start_owner.as_ref()),
        planned_text("start_traffic_type", trips, |t| t.start_traffic_type.as_ref()),
        planned_text("start_deviation", trips, |t| t.start_deviation.as_ref()),
        planned_int("start_hour", trips, |t| t.start_hour),
        planned_int("start_weekday", trips, |t| t.start_weekday),
        planned_int("start_month", trips, |t| t.start_month),
        planned_int("is_weekday", trips, |t| u32::from(t.is_weekday)),
        Series::new(
            "distance_km".into(),
            trips.iter().map(|t| t.distance_km).collect::<Vec<_>>(),
        )
        .into(),
    ];

    Ok(DataFrame::new(columns)?)
}

/// Reads a frame produced by [`planned_to_frame`] back into timetable rows.
pub fn frame_to_planned(df: &DataFrame) -> Result<Vec<PlannedTrip>, FrameError> {
    let train_ident = read_text(df, "train_ident")?;
    let service_date = read_dates(df, "service_date")?;
    let start_time = read_datetime(df, "start_time")?;
    let end_time = read_datetime(df, "end_time")?;
    let start_station = read_text(df, "start_station")?;
    let end_station = read_text(df, "end_station")?;
    let duration = read_f64(df, "duration_minutes")?;
    let through = read_text(df, "through_stations")?;
    let stops = read_i64(df, "stops_count")?;
    let any_canceled = read_bool(df, "any_canceled")?;
    let operator = read_text(df, "operator")?;
    let train_owner = read_text(df, "train_owner")?;
    let origin = read_text(df, "origin")?;
    let destination = read_text(df, "destination")?;
    let start_operator = read_text(df, "start_operator")?;
    let start_owner = read_text(df, "start_owner")?;
    let start_traffic_type = read_text(df, "start_traffic_type")?;
    let start_deviation = read_text(df, "start_deviation")?;
    let start_hour = read_i64(df, "start_hour")?;
    let start_weekday = read_i64(df, "start_weekday")?;
    let start_month = read_i64(df, "start_month")?;
    let is_weekday = read_i64(df, "is_weekday")?;
    let distance_km = read_f64(df, "distance_km")?;

    let mut trips = Vec::with_capacity(df.height());
    for row in 0..df.height() {
        trips.push(PlannedTrip {
            train_ident: required(train_ident[row].clone(), "train_ident", row)?,
            service_date: service_date[row],
            start_time: required(start_time[row], "start_time", row)?,
            end_time: required(end_time[row], "end_time", row)?,
            start_station: required(start_station[row].clone(), "start_station", row)?,
            end_station: required(end_station[row].clone(), "end_station", row)?,
            duration_minutes: required(duration[row], "duration_minutes", row)?,
            through_stations: through[row].clone().unwrap_or_default(),
            stops_count: small_unsigned(stops[row], "stops_count", row)?,
            any_canceled: any_canceled[row].unwrap_or(false),
            operator: operator[row].clone(),
            train_owner: train_owner[row].clone(),
            origin: origin[row].clone(),
            destination: destination[row].clone(),
            start_operator: start_operator[row].clone(),
            start_owner: start_owner[row].clone(),
            start_traffic_type: start_traffic_type[row].clone(),
            start_deviation: start_deviation[row].clone(),
            start_hour: small_unsigned(start_hour[row], "start_hour", row)?,
            start_weekday: small_unsigned(start_weekday[row], "start_weekday", row)?,
            start_month: small_unsigned(start_month[row], "start_month", row)?,
            is_weekday: flag(is_weekday[row], "is_weekday", row)?,
            distance_km: distance_km[row],
        });
    }

    Ok(trips)
}

pub fn write_parquet_bytes(df: &DataFrame) -> Result<Vec<u8>, FrameError> {
    let mut buffer = Vec::new();
    {
        let mut cursor = Cursor::new(&mut buffer);
        let mut clone = df.clone();
        ParquetWriter::new(&mut cursor)
            .with_compression(ParquetCompression::Zstd(None))
            .with_statistics(StatisticsOptions::default())
            .finish(&mut clone)?;
    }
    Ok(buffer)
}

pub fn read_parquet_bytes(bytes: &[u8]) -> Result<DataFrame, FrameError> {
    let cursor = Cursor::new(bytes.to_vec());
    Ok(ParquetReader::new(cursor).finish()?)
}

pub fn trips_to_parquet(trips: &[Trip]) -> Result<Vec<u8>, FrameError> {
    let df = trips_to_frame(trips)?;
    write_parquet_bytes(&df)
}

pub fn trips_from_parquet(bytes: &[u8]) -> Result<Vec<Trip>, FrameError> {
    let df = read_parquet_bytes(bytes)?;
    frame_to_trips(&df)
}

pub fn planned_to_parquet(trips: &[PlannedTrip]) -> Result<Vec<u8>, FrameError> {
    let df = planned_to_frame(trips)?;
    write_parquet_bytes(&df)
}

pub fn planned_from_parquet(bytes: &[u8]) -> Result<Vec<PlannedTrip>, FrameError> {
    let df = read_parquet_bytes(bytes)?;
    frame_to_planned(&df)
}
