use std::cmp::Ordering;

use chrono::{NaiveDateTime, TimeDelta};
use tracing::{debug, warn};
use trainflow_parser::{ActivityKind, RawEvent};

use crate::error::AmbiguousMatchError;
use crate::grouping::{Grouping, SequencedEvent};
use crate::trip::TripKey;

pub const DEFAULT_OVERNIGHT_GAP_MINUTES: i64 = 180;

#[derive(Debug, Clone, PartialEq)]
pub struct Leg {
    pub sequence: usize,
    pub location: Option<String>,
    pub advertised: NaiveDateTime,
    pub actual: Option<NaiveDateTime>,
    pub canceled: bool,
}

impl Leg {
    fn from_event(sequenced: &SequencedEvent) -> Self {
        Self {
            sequence: sequenced.sequence,
            location: sequenced.event.location.clone(),
            advertised: sequenced.event.advertised,
            actual: sequenced.event.actual,
            canceled: sequenced.event.canceled,
        }
    }
}

/// One trip before resolution: the chosen departure and arrival legs plus descriptive
/// attributes (taken from the departure event, falling back to the arrival event).
#[derive(Debug, Clone, PartialEq)]
pub struct TripSkeleton {
    pub key: TripKey,
    pub departure: Option<Leg>,
    pub arrival: Option<Leg>,
    pub canceled: bool,
    pub operator: Option<String>,
    pub train_owner: Option<String>,
    pub traffic_type: Option<String>,
    pub deviation: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MatchOutcome {
    pub skeleton: Option<TripSkeleton>,
    pub ambiguities: Vec<AmbiguousMatchError>,
}

#[derive(Debug, Clone, Default)]
pub struct MatchReport {
    pub skeletons: Vec<TripSkeleton>,
    pub ambiguities: Vec<AmbiguousMatchError>,
    pub dropped_groups: Vec<TripKey>,
}

/// Moves the early events of a train's group into the previous day's group when they
/// continue that day's run. Returns the number of events moved.
///
/// For each `(T, D)` whose `(T, D-1)` group holds a departure, `D`'s events are walked in
/// advertised order starting from the latest event of `D-1`; leading events within
/// `max_gap` of their predecessor move into `(T, D-1)`. Emptied groups are removed.
pub fn reconcile_overnight(grouping: &mut Grouping, max_gap: TimeDelta) -> usize {
    let keys: Vec<TripKey> = grouping.keys().cloned().collect();
    let mut moved_total = 0;

    for key in keys {
        let Some(previous_date) = key.service_date.pred_opt() else {
            continue;
        };
        let previous_key = TripKey::new(key.train_ident.clone(), previous_date);

        let anchor = match grouping.get(&previous_key) {
            Some(previous) if previous.iter().any(|e| e.event.is_departure()) => previous
                .iter()
                .map(|e| e.event.advertised)
                .max(),
            _ => None,
        };
        let Some(mut last_seen) = anchor else {
            continue;
        };

        let Some(mut current) = grouping.remove(&key) else {
            continue;
        };
        current.sort_by(|a, b| {
            a.event
                .advertised
                .cmp(&b.event.advertised)
                .then(a.sequence.cmp(&b.sequence))
        });

        let mut split = 0;
        for sequenced in &current {
            if sequenced.event.advertised - last_seen > max_gap {
                break;
            }
            last_seen = last_seen.max(sequenced.event.advertised);
            split += 1;
        }

        let remaining = current.split_off(split);
        if split > 0 {
            debug!(
                from = %key,
                to = %previous_key,
                events = split,
                "attributed overnight events to previous service date"
            );
            grouping
                .entry(previous_key)
                .or_default()
                .extend(current);
            moved_total += split;
        }
        if !remaining.is_empty() {
            grouping.insert(key, remaining);
        }
    }

    moved_total
}

/// Picks the departure and arrival legs of one event group.
pub fn match_group(key: &TripKey, events: &[SequencedEvent]) -> MatchOutcome {
    let mut ambiguities = Vec::new();

    let departure = select_leg(key, events, ActivityKind::Departure, &mut ambiguities);
    let arrival = select_leg(key, events, ActivityKind::Arrival, &mut ambiguities);

    let skeleton = match (departure, arrival) {
        (None, None) => None,
        (Some(dep), Some(arr)) => Some(build_skeleton(key, Some(dep), Some(arr))),
        (Some(leg), None) | (None, Some(leg)) if leg.event.canceled => {
            let (dep, arr) = if leg.event.is_departure() {
                (Some(leg), None)
            } else {
                (None, Some(leg))
            };
            Some(build_skeleton(key, dep, arr))
        }
        _ => None,
    };

    MatchOutcome {
        skeleton,
        ambiguities,
    }
}

/// Matches every group of a grouping, in key order.
pub fn match_grouping(grouping: &Grouping) -> MatchReport {
    let mut report = MatchReport::default();

    for (key, events) in grouping {
        let outcome = match_group(key, events);
        for ambiguity in &outcome.ambiguities {
            warn!(%ambiguity, "ambiguous leg match resolved by ingestion order");
        }
        report.ambiguities.extend(outcome.ambiguities);

        match outcome.skeleton {
            Some(skeleton) => report.skeletons.push(skeleton),
            None => {
                debug!(trip = %key, events = events.len(), "group has no usable leg pair");
                report.dropped_groups.push(key.clone());
            }
        }
    }

    report
}

fn build_skeleton(
    key: &TripKey,
    departure: Option<&SequencedEvent>,
    arrival: Option<&SequencedEvent>,
) -> TripSkeleton {
    let canceled = departure.is_some_and(|e| e.event.canceled)
        || arrival.is_some_and(|e| e.event.canceled);

    TripSkeleton {
        key: key.clone(),
        departure: departure.map(Leg::from_event),
        arrival: arrival.map(Leg::from_event),
        canceled,
        operator: first_attribute(departure, arrival, |e| e.operator.as_ref()),
        train_owner: first_attribute(departure, arrival, |e| e.train_owner.as_ref()),
        traffic_type: first_attribute(departure, arrival, |e| e.traffic_type.as_ref()),
        deviation: first_attribute(departure, arrival, |e| e.deviation.as_ref()),
    }
}

fn first_attribute(
    departure: Option<&SequencedEvent>,
    arrival: Option<&SequencedEvent>,
    field: impl Fn(&RawEvent) -> Option<&String>,
) -> Option<String> {
    departure
        .and_then(|e| field(&e.event))
        .or_else(|| arrival.and_then(|e| field(&e.event)))
        .cloned()
}

fn select_leg<'a>(
    key: &TripKey,
    events: &'a [SequencedEvent],
    activity: ActivityKind,
    ambiguities: &mut Vec<AmbiguousMatchError>,
) -> Option<&'a SequencedEvent> {
    let candidates: Vec<&SequencedEvent> = events
        .iter()
        .filter(|e| e.event.activity == activity)
        .collect();

    let target = match activity {
        ActivityKind::Departure => candidates.iter().map(|e| e.event.advertised).min()?,
        ActivityKind::Arrival => candidates.iter().map(|e| e.event.advertised).max()?,
    };

    let mut tied: Vec<&SequencedEvent> = candidates
        .into_iter()
        .filter(|e| e.event.advertised == target)
        .collect();
    tied.sort_by(|a, b| prefer_reported(a, b).then(a.sequence.cmp(&b.sequence)));

    let chosen = *tied.first()?;
    let same_rank = tied
        .iter()
        .filter(|e| e.event.actual.is_some() == chosen.event.actual.is_some())
        .count();
    if same_rank > 1 {
        ambiguities.push(AmbiguousMatchError {
            key: key.clone(),
            activity,
            advertised: target,
            candidates: same_rank,
            chosen_sequence: chosen.sequence,
        });
    }

    Some(chosen)
}

fn prefer_reported(a: &SequencedEvent, b: &SequencedEvent) -> Ordering {
    b.event.actual.is_some().cmp(&a.event.actual.is_some())
}
