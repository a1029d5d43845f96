use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::ResolutionError;
use crate::matching::TripSkeleton;
use crate::trip::TripKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Main,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Not cancelled and no departure actual.
    MissingDepartureActual,
    /// Not cancelled and no arrival actual.
    MissingArrivalActual,
    /// Cancelled, one leg only, and that leg reported an actual time.
    UnfillableLeg,
    /// Not cancelled and one leg is absent entirely.
    IncompleteLegs,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DropReason::MissingDepartureActual => "missing_departure_actual",
            DropReason::MissingArrivalActual => "missing_arrival_actual",
            DropReason::UnfillableLeg => "unfillable_leg",
            DropReason::IncompleteLegs => "incomplete_legs",
        };
        f.write_str(label)
    }
}

/// A skeleton after the fill policy: which output it belongs to and the actual times to use
/// for feature computation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTrip {
    pub skeleton: TripSkeleton,
    pub disposition: Disposition,
    pub departure_actual: Option<NaiveDateTime>,
    pub arrival_actual: Option<NaiveDateTime>,
    pub departure_actual_filled: bool,
    pub arrival_actual_filled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(ResolvedTrip),
    Dropped { key: TripKey, reason: DropReason },
}

/// Applies the cancellation fill policy.
///
/// | cancelled | dep actual | arr actual | outcome |
/// |---|---|---|---|
/// | false | yes | yes | main |
/// | true | no | no | cancelled output |
/// | true | no | yes | dep actual := dep advertised, main |
/// | true | yes | no | arr actual := arr advertised, main |
/// | false | no | yes | drop |
/// | false | yes | no | drop |
///
/// Any other combination is an [`ResolutionError::UnlistedCombination`].
pub fn resolve(skeleton: TripSkeleton) -> Result<Resolution, ResolutionError> {
    let dep_actual = skeleton.departure.as_ref().and_then(|leg| leg.actual);
    let arr_actual = skeleton.arrival.as_ref().and_then(|leg| leg.actual);

    let dep_advertised = skeleton.departure.as_ref().map(|leg| leg.advertised);
    let arr_advertised = skeleton.arrival.as_ref().map(|leg| leg.advertised);

    match (dep_advertised, arr_advertised) {
        (Some(dep_advertised), Some(arr_advertised)) => {
            match (skeleton.canceled, dep_actual, arr_actual) {
                (false, Some(_), Some(_)) => Ok(resolved(
                    skeleton,
                    Disposition::Main,
                    dep_actual,
                    arr_actual,
                    (false, false),
                )),
                (true, None, None) => Ok(resolved(
                    skeleton,
                    Disposition::Canceled,
                    None,
                    None,
                    (false, false),
                )),
                (true, None, Some(_)) => Ok(resolved(
                    skeleton,
                    Disposition::Main,
                    Some(dep_advertised),
                    arr_actual,
                    (true, false),
                )),
                (true, Some(_), None) => Ok(resolved(
                    skeleton,
                    Disposition::Main,
                    dep_actual,
                    Some(arr_advertised),
                    (false, true),
                )),
                (false, None, Some(_)) => Ok(dropped(skeleton, DropReason::MissingDepartureActual)),
                (false, Some(_), None) => Ok(dropped(skeleton, DropReason::MissingArrivalActual)),
                (canceled, dep, arr) => Err(ResolutionError::UnlistedCombination {
                    key: skeleton.key,
                    canceled,
                    departure_actual: dep.is_some(),
                    arrival_actual: arr.is_some(),
                }),
            }
        }
        (None, None) => Ok(dropped(skeleton, DropReason::IncompleteLegs)),
        _ if !skeleton.canceled => Ok(dropped(skeleton, DropReason::IncompleteLegs)),
        _ if dep_actual.is_some() || arr_actual.is_some() => {
            Ok(dropped(skeleton, DropReason::UnfillableLeg))
        }
        _ => Ok(resolved(
            skeleton,
            Disposition::Canceled,
            None,
            None,
            (false, false),
        )),
    }
}

fn resolved(
    skeleton: TripSkeleton,
    disposition: Disposition,
    departure_actual: Option<NaiveDateTime>,
    arrival_actual: Option<NaiveDateTime>,
    (departure_actual_filled, arrival_actual_filled): (bool, bool),
) -> Resolution {
    Resolution::Resolved(ResolvedTrip {
        skeleton,
        disposition,
        departure_actual,
        arrival_actual,
        departure_actual_filled,
        arrival_actual_filled,
    })
}

fn dropped(skeleton: TripSkeleton, reason: DropReason) -> Resolution {
    Resolution::Dropped {
        key: skeleton.key,
        reason,
    }
}
