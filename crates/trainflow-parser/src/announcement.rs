use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::clock::CanonicalClock;
use crate::errors::{ParserError, RejectedRecord, SchemaError};
use crate::model::{ActivityKind, RawEvent};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::One(item) => std::slice::from_ref(item),
            OneOrMany::Many(items) => items.as_slice(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IdentValue {
    Text(String),
    Number(i64),
}

impl IdentValue {
    fn into_string(self) -> String {
        match self {
            IdentValue::Text(text) => text.trim().to_string(),
            IdentValue::Number(number) => number.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CodedText {
    code: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LocationRef {
    location_name: Option<String>,
}

/// Announcement as delivered upstream. Nested blocks may arrive as one object or as a list,
/// and some exports are already flattened into `Block_Field` columns.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SourceAnnouncement {
    activity_id: Option<String>,
    activity_type: Option<String>,
    advertised_train_ident: Option<IdentValue>,
    advertised_time_at_location: Option<String>,
    time_at_location_with_seconds: Option<String>,
    time_at_location: Option<String>,
    canceled: Option<bool>,
    location_signature: Option<String>,
    operator: Option<String>,
    train_owner: Option<String>,
    type_of_traffic: Option<OneOrMany<CodedText>>,
    deviation: Option<OneOrMany<CodedText>>,
    from_location: Option<OneOrMany<LocationRef>>,
    to_location: Option<OneOrMany<LocationRef>>,
    #[serde(rename = "TypeOfTraffic_Code", alias = "trip_typeoftraffic")]
    type_of_traffic_code: Option<String>,
    #[serde(rename = "Deviation_Description")]
    deviation_description: Option<String>,
}

#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub events: Vec<RawEvent>,
    pub rejected: Vec<RejectedRecord>,
}

impl NormalizedBatch {
    pub fn total_records(&self) -> usize {
        self.events.len() + self.rejected.len()
    }

    pub fn extend(&mut self, other: NormalizedBatch) {
        self.events.extend(other.events);
        self.rejected.extend(other.rejected);
    }
}

/// Parses one serialized announcement batch. A batch that is not JSON, or whose shape is
/// neither a record array nor the upstream `RESPONSE.RESULT[].TrainAnnouncement` envelope,
/// fails as a whole; individual bad records are collected in [`NormalizedBatch::rejected`].
pub fn parse_announcement_batch(
    contents: &[u8],
    clock: &CanonicalClock,
) -> Result<NormalizedBatch, ParserError> {
    let document: Value =
        serde_json::from_slice(contents).map_err(|err| ParserError::MalformedBatch {
            reason: err.to_string(),
        })?;
    let records = extract_records(&document)?;

    let mut batch = NormalizedBatch {
        events: Vec::with_capacity(records.len()),
        rejected: Vec::new(),
    };

    for (index, record) in records.into_iter().enumerate() {
        match normalize_record(record, clock) {
            Ok(event) => batch.events.push(event),
            Err(error) => {
                let activity_id = record
                    .get("ActivityId")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let rejected = RejectedRecord::new(index, activity_id, error);
                warn!(%rejected, "rejected announcement record");
                batch.rejected.push(rejected);
            }
        }
    }

    debug!(
        events = batch.events.len(),
        rejected = batch.rejected.len(),
        "normalized announcement batch"
    );

    Ok(batch)
}

fn extract_records(document: &Value) -> Result<Vec<&Value>, ParserError> {
    match document {
        Value::Array(items) => Ok(items.iter().collect()),
        Value::Object(map) => {
            let results = map
                .get("RESPONSE")
                .and_then(|response| response.get("RESULT"))
                .and_then(Value::as_array)
                .ok_or_else(|| ParserError::MalformedBatch {
                    reason: "object batch lacks RESPONSE.RESULT".to_string(),
                })?;

            let mut records = Vec::new();
            for result in results {
                if let Some(Value::Array(items)) = result.get("TrainAnnouncement") {
                    records.extend(items.iter());
                }
            }
            Ok(records)
        }
        _ => Err(ParserError::MalformedBatch {
            reason: "expected a JSON array or response envelope".to_string(),
        }),
    }
}

/// Flattens one announcement into a [`RawEvent`].
pub fn normalize_record(record: &Value, clock: &CanonicalClock) -> Result<RawEvent, SchemaError> {
    if !record.is_object() {
        return Err(SchemaError::Shape {
            reason: "expected a JSON object".to_string(),
        });
    }

    let source = SourceAnnouncement::deserialize(record).map_err(|err| SchemaError::Shape {
        reason: err.to_string(),
    })?;

    let train_ident = source
        .advertised_train_ident
        .map(IdentValue::into_string)
        .filter(|ident| !ident.is_empty())
        .ok_or(SchemaError::MissingField {
            field: "AdvertisedTrainIdent",
        })?;

    let activity_raw = non_empty(source.activity_type).ok_or(SchemaError::MissingField {
        field: "ActivityType",
    })?;
    let activity = ActivityKind::try_from(activity_raw.as_str())
        .map_err(|value| SchemaError::UnknownActivity { value })?;

    let advertised_raw = non_empty(source.advertised_time_at_location).ok_or(
        SchemaError::MissingField {
            field: "AdvertisedTimeAtLocation",
        },
    )?;
    let advertised =
        clock
            .parse(&advertised_raw)
            .ok_or_else(|| SchemaError::InvalidTimestamp {
                field: "AdvertisedTimeAtLocation",
                value: advertised_raw.clone(),
            })?;

    let actual = match non_empty(source.time_at_location_with_seconds) {
        Some(raw) => Some(parse_actual(clock, "TimeAtLocationWithSeconds", raw)?),
        None => match non_empty(source.time_at_location) {
            Some(raw) => Some(parse_actual(clock, "TimeAtLocation", raw)?),
            None => None,
        },
    };

    let traffic_type = source
        .type_of_traffic
        .as_ref()
        .and_then(|blocks| first_text(blocks.as_slice(), |block| block.code.as_deref()))
        .or_else(|| non_empty(source.type_of_traffic_code));

    let deviation = source
        .deviation
        .as_ref()
        .and_then(|blocks| first_text(blocks.as_slice(), |block| block.description.as_deref()))
        .or_else(|| non_empty(source.deviation_description));

    let origin = source
        .from_location
        .as_ref()
        .and_then(|blocks| first_text(blocks.as_slice(), |loc| loc.location_name.as_deref()))
        .map(|code| code.to_uppercase());
    let destination = source
        .to_location
        .as_ref()
        .and_then(|blocks| first_text(blocks.as_slice(), |loc| loc.location_name.as_deref()))
        .map(|code| code.to_uppercase());

    Ok(RawEvent {
        activity_id: non_empty(source.activity_id),
        train_ident,
        service_date: advertised.date(),
        activity,
        location: non_empty(source.location_signature).map(|code| code.to_uppercase()),
        advertised,
        actual,
        canceled: source.canceled.unwrap_or(false),
        operator: non_empty(source.operator),
        train_owner: non_empty(source.train_owner),
        traffic_type,
        deviation,
        origin,
        destination,
    })
}

fn parse_actual(
    clock: &CanonicalClock,
    field: &'static str,
    raw: String,
) -> Result<chrono::NaiveDateTime, SchemaError> {
    clock
        .parse(&raw)
        .ok_or(SchemaError::InvalidTimestamp { field, value: raw })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn first_text<T>(items: &[T], pick: impl Fn(&T) -> Option<&str>) -> Option<String> {
    items
        .iter()
        .filter_map(|item| pick(item))
        .map(str::trim)
        .find(|text| !text.is_empty())
        .map(str::to_string)
}
