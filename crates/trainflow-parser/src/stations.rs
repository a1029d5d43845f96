use std::collections::HashMap;
use std::io::Read;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::errors::ParserError;
use crate::model::StationInfo;

#[derive(Debug, Deserialize)]
struct StationRow {
    #[serde(
        rename = "LocationSignature",
        alias = "PrimaryLocationCode",
        alias = "Signature",
        alias = "LocationCode"
    )]
    code: Option<String>,
    #[serde(rename = "OfficialLocationName", alias = "AdvertisedLocationName")]
    name: Option<String>,
    #[serde(rename = "CountyName", alias = "County")]
    county: Option<String>,
    #[serde(rename = "Latitude", alias = "lat")]
    latitude: Option<String>,
    #[serde(rename = "Longitude", alias = "lon")]
    longitude: Option<String>,
    #[serde(rename = "Geometry", alias = "Geometry_WGS84", alias = "Geometry.WGS84")]
    geometry: Option<String>,
}

/// Trims, removes inner whitespace, and upper-cases a location code.
pub fn normalize_code(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Parses a WGS84 `POINT (lon lat)` string into `(latitude, longitude)`.
pub fn parse_wgs84_point(raw: &str) -> Option<(f64, f64)> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("POINT")
        .or_else(|| trimmed.strip_prefix("point"))?
        .trim();
    let inner = body.strip_prefix('(')?.strip_suffix(')')?;

    let mut parts = inner.split_whitespace();
    let lon = parts.next()?.parse::<f64>().ok()?;
    let lat = parts.next()?.parse::<f64>().ok()?;
    if parts.next().is_some() || !lat.is_finite() || !lon.is_finite() {
        return None;
    }
    Some((lat, lon))
}

fn parse_coordinate(raw: Option<&str>) -> Option<f64> {
    raw.map(str::trim)
        .filter(|text| !text.is_empty())
        .and_then(|text| text.replace(',', ".").parse::<f64>().ok())
        .filter(|value| value.is_finite())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

/// Read-only lookup of station metadata keyed by normalized location code.
#[derive(Debug, Clone, Default)]
pub struct StationTable {
    stations: HashMap<String, StationInfo>,
}

impl StationTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a table from station records. The first record for a code wins.
    pub fn from_records(records: impl IntoIterator<Item = StationInfo>) -> Self {
        let mut stations = HashMap::new();
        for mut record in records {
            let code = normalize_code(&record.code);
            if code.is_empty() {
                continue;
            }
            record.code = code.clone();
            stations.entry(code).or_insert(record);
        }
        Self { stations }
    }

    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self, ParserError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = csv_reader.headers()?.clone();
        let has_code = headers.iter().any(|h| {
            matches!(
                h,
                "LocationSignature" | "PrimaryLocationCode" | "Signature" | "LocationCode"
            )
        });
        if !has_code {
            return Err(ParserError::StationTable {
                message: "no location code column in station table".to_string(),
            });
        }

        let mut records = Vec::new();
        let mut skipped = 0usize;
        for row in csv_reader.deserialize::<StationRow>() {
            let row = row?;
            let Some(code) = non_empty(row.code) else {
                skipped += 1;
                continue;
            };

            let point = row.geometry.as_deref().and_then(parse_wgs84_point);
            let latitude = parse_coordinate(row.latitude.as_deref()).or(point.map(|p| p.0));
            let longitude = parse_coordinate(row.longitude.as_deref()).or(point.map(|p| p.1));

            records.push(StationInfo {
                code,
                name: non_empty(row.name),
                county: non_empty(row.county),
                latitude,
                longitude,
            });
        }

        if skipped > 0 {
            warn!(skipped, "station rows without a location code were skipped");
        }

        let table = Self::from_records(records);
        debug!(stations = table.len(), "loaded station table");
        Ok(table)
    }

    pub fn lookup(&self, code: &str) -> Option<&StationInfo> {
        self.stations.get(&normalize_code(code))
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }
}
