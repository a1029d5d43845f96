use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{NaiveDate, TimeDelta};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use trainflow_parser::{CanonicalClock, RawEvent, StationTable};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::enrichment::enrich;
use crate::error::{ConfigError, PipelineError};
use crate::grouping::{event_count, group_events};
use crate::matching::{match_grouping, reconcile_overnight, DEFAULT_OVERNIGHT_GAP_MINUTES};
use crate::planned::{build_planned_trip, dedup_planned, plausible_duration, PlannedTrip};
use crate::resolution::{resolve, Disposition, Resolution};
use crate::trip::Trip;

pub const DEFAULT_PIPELINE: &str = "trip_reconciliation_v1";
pub const PLANNED_PIPELINE: &str = "planned_timetable_v1";

/// Shared, read-only inputs of a processing run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub clock: CanonicalClock,
    pub stations: Arc<StationTable>,
    pub overnight_gap: TimeDelta,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            clock: CanonicalClock::default(),
            stations: Arc::new(StationTable::empty()),
            overnight_gap: TimeDelta::minutes(DEFAULT_OVERNIGHT_GAP_MINUTES),
        }
    }
}

impl ExecutionContext {
    pub fn new(
        config: &PipelineConfig,
        stations: Arc<StationTable>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            clock: config.clock()?,
            stations,
            overnight_gap: config.overnight_gap()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingReport {
    pub events_loaded: usize,
    pub rejected_records: usize,
    pub overnight_events_moved: usize,
    pub groups: usize,
    pub groups_outside_date: usize,
    pub unmatched_groups: usize,
    pub ambiguous_matches: usize,
    pub unlisted_combinations: usize,
    pub dropped: BTreeMap<String, usize>,
    pub unresolved_stations: usize,
    pub main_rows: usize,
    pub canceled_rows: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineBatchOutput {
    pub main: Vec<Trip>,
    pub canceled: Vec<Trip>,
    pub report: ProcessingReport,
}

/// One service date's curated output.
#[derive(Debug, Clone)]
pub struct CuratedBatch {
    pub service_date: NaiveDate,
    pub run_id: Uuid,
    pub pipeline: String,
    pub pipeline_version: String,
    pub main: Vec<Trip>,
    pub canceled: Vec<Trip>,
    pub report: ProcessingReport,
}

impl CuratedBatch {
    pub fn from_output(
        pipeline: &dyn ProcessingPipeline,
        service_date: NaiveDate,
        output: PipelineBatchOutput,
    ) -> Self {
        Self {
            service_date,
            run_id: Uuid::new_v4(),
            pipeline: pipeline.code_identifier().to_string(),
            pipeline_version: pipeline.version().to_string(),
            main: output.main,
            canceled: output.canceled,
            report: output.report,
        }
    }
}

pub trait ProcessingPipeline: Send + Sync {
    fn code_identifier(&self) -> &'static str;
    fn version(&self) -> &'static str;
    fn description(&self) -> &'static str;

    /// Turns the normalized events loaded for `service_date` (neighbour days included)
    /// into that date's trips.
    fn run_batch(
        &self,
        context: &ExecutionContext,
        service_date: NaiveDate,
        events: Vec<RawEvent>,
    ) -> Result<PipelineBatchOutput, PipelineError>;
}

static PIPELINE_IMPLEMENTATIONS: Lazy<Vec<&'static dyn ProcessingPipeline>> =
    Lazy::new(|| vec![&TripReconciliationPipeline as &dyn ProcessingPipeline]);

pub fn all_pipelines() -> &'static [&'static dyn ProcessingPipeline] {
    PIPELINE_IMPLEMENTATIONS.as_slice()
}

pub fn find_pipeline(code: &str) -> Result<&'static dyn ProcessingPipeline, PipelineError> {
    all_pipelines()
        .iter()
        .copied()
        .find(|pipeline| pipeline.code_identifier() == code)
        .ok_or_else(|| PipelineError::UnknownPipeline(code.to_string()))
}

/// Group, reconcile overnight runs, match legs, resolve cancellations, enrich.
pub struct TripReconciliationPipeline;

impl ProcessingPipeline for TripReconciliationPipeline {
    fn code_identifier(&self) -> &'static str {
        DEFAULT_PIPELINE
    }

    fn version(&self) -> &'static str {
        "0.1.0"
    }

    fn description(&self) -> &'static str {
        "Departure/arrival matching + cancellation fill + station and calendar features"
    }

    fn run_batch(
        &self,
        context: &ExecutionContext,
        service_date: NaiveDate,
        events: Vec<RawEvent>,
    ) -> Result<PipelineBatchOutput, PipelineError> {
        let mut report = ProcessingReport {
            events_loaded: events.len(),
            ..ProcessingReport::default()
        };

        let mut grouping = group_events(events);
        report.overnight_events_moved = reconcile_overnight(&mut grouping, context.overnight_gap);

        let before = grouping.len();
        grouping.retain(|key, _| key.service_date == service_date);
        report.groups = grouping.len();
        report.groups_outside_date = before - grouping.len();
        debug!(
            date = %service_date,
            groups = report.groups,
            events = event_count(&grouping),
            "grouped events"
        );

        let matched = match_grouping(&grouping);
        report.ambiguous_matches = matched.ambiguities.len();
        report.unmatched_groups = matched.dropped_groups.len();

        let mut main = Vec::new();
        let mut canceled = Vec::new();
        let mut unresolved_codes = BTreeSet::new();

        for skeleton in matched.skeletons {
            let resolved = match resolve(skeleton) {
                Ok(Resolution::Resolved(resolved)) => resolved,
                Ok(Resolution::Dropped { key, reason }) => {
                    debug!(trip = %key, %reason, "dropped trip");
                    *report.dropped.entry(reason.to_string()).or_default() += 1;
                    continue;
                }
                Err(err) => {
                    warn!(%err, "trip excluded by resolution policy");
                    report.unlisted_combinations += 1;
                    continue;
                }
            };

            let disposition = resolved.disposition;
            let enriched = enrich(resolved, &context.stations);
            report.unresolved_stations += enriched.unresolved.len();
            for unresolved in &enriched.unresolved {
                debug!(%unresolved, "station lookup missed");
                unresolved_codes.insert(unresolved.code().to_string());
            }

            match disposition {
                Disposition::Main => main.push(enriched.trip),
                Disposition::Canceled => canceled.push(enriched.trip),
            }
        }

        for code in &unresolved_codes {
            warn!(date = %service_date, code = %code, "unresolved station");
        }

        report.main_rows = main.len();
        report.canceled_rows = canceled.len();
        info!(
            date = %service_date,
            pipeline = self.code_identifier(),
            main_rows = report.main_rows,
            canceled_rows = report.canceled_rows,
            unlisted = report.unlisted_combinations,
            ambiguous = report.ambiguous_matches,
            "processed service date"
        );

        Ok(PipelineBatchOutput {
            main,
            canceled,
            report,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedReport {
    pub records: usize,
    pub rejected_records: usize,
    pub duplicates_removed: usize,
    pub groups: usize,
    pub implausible_duration: usize,
    pub unresolved_stations: usize,
    pub trips: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PlannedBatchOutput {
    pub trips: Vec<PlannedTrip>,
    pub report: PlannedReport,
}

/// Turns one date's planned announcements into timetable rows.
pub trait PlannedPipeline: Send + Sync {
    fn code_identifier(&self) -> &'static str;
    fn version(&self) -> &'static str;
    fn description(&self) -> &'static str;

    fn run_batch(
        &self,
        context: &ExecutionContext,
        service_date: NaiveDate,
        events: Vec<RawEvent>,
    ) -> Result<PlannedBatchOutput, PipelineError>;
}

static PLANNED_IMPLEMENTATIONS: Lazy<Vec<&'static dyn PlannedPipeline>> =
    Lazy::new(|| vec![&PlannedTimetablePipeline as &dyn PlannedPipeline]);

pub fn all_planned_pipelines() -> &'static [&'static dyn PlannedPipeline] {
    PLANNED_IMPLEMENTATIONS.as_slice()
}

pub fn find_planned_pipeline(code: &str) -> Result<&'static dyn PlannedPipeline, PipelineError> {
    all_planned_pipelines()
        .iter()
        .copied()
        .find(|pipeline| pipeline.code_identifier() == code)
        .ok_or_else(|| PipelineError::UnknownPipeline(code.to_string()))
}

/// Dedup, group by (train, advertised date), span first departure to last arrival.
pub struct PlannedTimetablePipeline;

impl PlannedPipeline for PlannedTimetablePipeline {
    fn code_identifier(&self) -> &'static str {
        PLANNED_PIPELINE
    }

    fn version(&self) -> &'static str {
        "0.1.0"
    }

    fn description(&self) -> &'static str {
        "Timetable trips with through stations, route distance and calendar features"
    }

    fn run_batch(
        &self,
        context: &ExecutionContext,
        service_date: NaiveDate,
        events: Vec<RawEvent>,
    ) -> Result<PlannedBatchOutput, PipelineError> {
        let mut report = PlannedReport::default();

        let (events, removed) = dedup_planned(events);
        report.duplicates_removed = removed;

        let mut grouping = group_events(events);
        grouping.retain(|key, _| key.service_date == service_date);
        report.groups = grouping.len();
        debug!(
            date = %service_date,
            groups = report.groups,
            events = event_count(&grouping),
            "grouped planned events"
        );

        let mut trips = Vec::new();
        let mut unresolved_codes = BTreeSet::new();
        for (key, group) in &grouping {
            let Some(built) = build_planned_trip(key, group, &context.stations) else {
                continue;
            };
            report.unresolved_stations += built.unresolved.len();
            for unresolved in &built.unresolved {
                unresolved_codes.insert(unresolved.code().to_string());
            }
            if !plausible_duration(&built.trip) {
                debug!(
                    trip = %built.trip.key(),
                    duration = built.trip.duration_minutes,
                    "discarded planned trip with implausible duration"
                );
                report.implausible_duration += 1;
                continue;
            }
            trips.push(built.trip);
        }

        for code in &unresolved_codes {
            warn!(date = %service_date, code = %code, "unresolved station in timetable");
        }

        report.trips = trips.len();
        info!(
            date = %service_date,
            pipeline = self.code_identifier(),
            trips = report.trips,
            duplicates = report.duplicates_removed,
            implausible = report.implausible_duration,
            "built planned timetable"
        );

        Ok(PlannedBatchOutput { trips, report })
    }
}
