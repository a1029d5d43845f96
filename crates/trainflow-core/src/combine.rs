use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::CombineError;
use crate::trip::{Trip, TripKey};

/// Which record survives when an incoming trip collides with one already in the total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    #[default]
    PreferIncoming,
    PreferExisting,
    /// Fewest absent fields wins; the incoming record wins ties.
    PreferMoreComplete,
}

impl CollisionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollisionPolicy::PreferIncoming => "prefer_incoming",
            CollisionPolicy::PreferExisting => "prefer_existing",
            CollisionPolicy::PreferMoreComplete => "prefer_more_complete",
        }
    }

    fn incoming_wins(&self, existing: &Trip, incoming: &Trip) -> bool {
        match self {
            CollisionPolicy::PreferIncoming => true,
            CollisionPolicy::PreferExisting => false,
            CollisionPolicy::PreferMoreComplete => {
                incoming.absent_field_count() <= existing.absent_field_count()
            }
        }
    }
}

impl fmt::Display for CollisionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollisionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "prefer_incoming" | "incoming" => Ok(CollisionPolicy::PreferIncoming),
            "prefer_existing" | "existing" => Ok(CollisionPolicy::PreferExisting),
            "prefer_more_complete" | "more_complete" => Ok(CollisionPolicy::PreferMoreComplete),
            other => Err(format!("unknown collision policy '{other}'")),
        }
    }
}

/// The deduplicated union of all curated batches, keyed and ordered by trip key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CombinedTotal {
    trips: BTreeMap<TripKey, Trip>,
}

impl CombinedTotal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a total from previously persisted rows. A repeated key keeps the later row.
    pub fn from_trips(trips: impl IntoIterator<Item = Trip>) -> Self {
        let mut map = BTreeMap::new();
        let mut duplicates = 0usize;
        for trip in trips {
            if map.insert(trip.key(), trip).is_some() {
                duplicates += 1;
            }
        }
        if duplicates > 0 {
            warn!(duplicates, "persisted total contained repeated trip keys");
        }
        Self { trips: map }
    }

    pub fn len(&self) -> usize {
        self.trips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trips.is_empty()
    }

    pub fn get(&self, key: &TripKey) -> Option<&Trip> {
        self.trips.get(key)
    }

    pub fn trips(&self) -> impl Iterator<Item = &Trip> {
        self.trips.values()
    }

    /// Rows sorted by (service date, train identifier).
    pub fn to_trips(&self) -> Vec<Trip> {
        self.trips.values().cloned().collect()
    }

    pub fn into_trips(self) -> Vec<Trip> {
        self.trips.into_values().collect()
    }

    pub fn stats(&self) -> TotalStats {
        TotalStats::from_trips(self.trips.values())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombineReport {
    pub rows_before: usize,
    pub rows_after: usize,
    pub inserted: usize,
    pub replaced: usize,
    pub kept_existing: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TotalStats {
    pub rows: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub distinct_dates: usize,
    pub distinct_trains: usize,
    pub delayed: usize,
    pub delayed_percentage: f64,
}

impl TotalStats {
    pub fn from_trips<'a>(trips: impl IntoIterator<Item = &'a Trip>) -> Self {
        let mut rows = 0usize;
        let mut dates = BTreeSet::new();
        let mut trains = BTreeSet::new();
        let mut delayed = 0usize;

        for trip in trips {
            rows += 1;
            dates.insert(trip.service_date);
            trains.insert(trip.train_ident.as_str());
            if trip.is_delayed() {
                delayed += 1;
            }
        }

        let delayed_percentage = if rows == 0 {
            0.0
        } else {
            delayed as f64 / rows as f64 * 100.0
        };

        Self {
            rows,
            first_date: dates.first().copied(),
            last_date: dates.last().copied(),
            distinct_dates: dates.len(),
            distinct_trains: trains.len(),
            delayed,
            delayed_percentage,
        }
    }
}

fn same_identity(existing: &Trip, incoming: &Trip) -> bool {
    existing.departure_location == incoming.departure_location
        && existing.departure_advertised == incoming.departure_advertised
}

/// Merges one batch into the total and returns the new total.
///
/// Every collision is checked first: if any colliding pair disagrees on departure location
/// or advertised departure time the whole merge fails with [`CombineError::Conflict`] and
/// `total` is left as it was.
pub fn combine(
    total: &CombinedTotal,
    incoming: &[Trip],
    policy: CollisionPolicy,
) -> Result<(CombinedTotal, CombineReport), CombineError> {
    let mut batch: BTreeMap<TripKey, &Trip> = BTreeMap::new();
    for trip in incoming {
        batch.insert(trip.key(), trip);
    }

    let conflicts: Vec<TripKey> = batch
        .iter()
        .filter_map(|(key, trip)| {
            total
                .trips
                .get(key)
                .filter(|existing| !same_identity(existing, trip))
                .map(|_| key.clone())
        })
        .collect();
    if !conflicts.is_empty() {
        warn!(
            conflicts = conflicts.len(),
            "incoming batch disagrees with combined total"
        );
        return Err(CombineError::Conflict { keys: conflicts });
    }

    let mut merged = total.trips.clone();
    let mut report = CombineReport {
        rows_before: total.len(),
        ..CombineReport::default()
    };

    for (key, trip) in batch {
        match merged.get_mut(&key) {
            Some(existing) => {
                if policy.incoming_wins(existing, trip) {
                    *existing = trip.clone();
                    report.replaced += 1;
                } else {
                    report.kept_existing += 1;
                }
            }
            None => {
                merged.insert(key, trip.clone());
                report.inserted += 1;
            }
        }
    }

    report.rows_after = merged.len();
    info!(
        rows_before = report.rows_before,
        rows_after = report.rows_after,
        inserted = report.inserted,
        replaced = report.replaced,
        policy = %policy,
        "combined batch into total"
    );

    Ok((CombinedTotal { trips: merged }, report))
}
