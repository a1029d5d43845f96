use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use trainflow_parser::NormalizedBatch;

use crate::combine::{combine, CollisionPolicy, CombineReport, CombinedTotal, TotalStats};
use crate::error::{CombineError, PipelineError, StoreError};
use crate::pipelines::{
    CuratedBatch, ExecutionContext, PlannedPipeline, PlannedReport, ProcessingPipeline,
};
use crate::store::{BatchManifest, BatchStore};

/// Processes one service date end to end: loads the raw batches of the date and its
/// neighbours, runs the pipeline, and materializes the curated batch.
///
/// Fails with [`StoreError::MissingRaw`] when the date itself has no raw file. A neighbour
/// day that cannot be read only narrows overnight reconciliation.
pub fn process_date(
    store: &BatchStore,
    context: &ExecutionContext,
    pipeline: &dyn ProcessingPipeline,
    date: NaiveDate,
) -> Result<BatchManifest, PipelineError> {
    let target = store
        .read_raw(date, &context.clock)?
        .ok_or(StoreError::MissingRaw { date })?;

    let mut events = Vec::new();
    let mut rejected = 0usize;

    if let Some(batch) = date
        .pred_opt()
        .and_then(|previous| read_neighbour(store, context, previous))
    {
        rejected += batch.rejected.len();
        events.extend(batch.events);
    }

    rejected += target.rejected.len();
    events.extend(target.events);

    if let Some(batch) = date
        .succ_opt()
        .and_then(|next| read_neighbour(store, context, next))
    {
        rejected += batch.rejected.len();
        events.extend(batch.events);
    }

    let mut output = pipeline.run_batch(context, date, events)?;
    output.report.rejected_records = rejected;

    let batch = CuratedBatch::from_output(pipeline, date, output);
    Ok(store.write_batch(&batch)?)
}

/// Builds the timetable of one upcoming service date from `raw/planned/` and writes both the
/// dated and the `latest` parquet. A date without any planned trip is an error and writes
/// nothing.
pub fn process_planned_date(
    store: &BatchStore,
    context: &ExecutionContext,
    pipeline: &dyn PlannedPipeline,
    date: NaiveDate,
) -> Result<PlannedReport, PipelineError> {
    let batch = store
        .read_planned_raw(date, &context.clock)?
        .ok_or(StoreError::MissingRaw { date })?;
    let records = batch.total_records();
    let rejected = batch.rejected.len();

    let output = pipeline.run_batch(context, date, batch.events)?;
    if output.trips.is_empty() {
        return Err(PipelineError::NoPlannedTrips { date });
    }

    store.write_planned(date, &output.trips)?;
    Ok(PlannedReport {
        records,
        rejected_records: rejected,
        ..output.report
    })
}

fn read_neighbour(
    store: &BatchStore,
    context: &ExecutionContext,
    date: NaiveDate,
) -> Option<NormalizedBatch> {
    match store.read_raw(date, &context.clock) {
        Ok(batch) => batch,
        Err(err) => {
            warn!(date = %date, error = %err, "skipping unreadable neighbour day");
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CombineSummary {
    pub batches: Vec<NaiveDate>,
    pub report: CombineReport,
    pub stats: TotalStats,
}

fn fold_batches(
    store: &BatchStore,
    start: CombinedTotal,
    dates: &[NaiveDate],
    policy: CollisionPolicy,
    rows_before: usize,
) -> Result<(CombinedTotal, CombineSummary), CombineError> {
    let mut total = start;
    let mut summary = CombineSummary {
        report: CombineReport {
            rows_before,
            ..CombineReport::default()
        },
        ..CombineSummary::default()
    };

    for &date in dates {
        let trips = store.read_batch_main(date)?;
        let (next, report) = combine(&total, &trips, policy)?;
        total = next;
        summary.batches.push(date);
        summary.report.inserted += report.inserted;
        summary.report.replaced += report.replaced;
        summary.report.kept_existing += report.kept_existing;
    }

    summary.report.rows_after = total.len();
    summary.stats = total.stats();
    Ok((total, summary))
}

/// Merges the listed batches into the persisted total under the combine lock. The total is
/// only rewritten once every batch merged cleanly.
pub fn combine_dates(
    store: &BatchStore,
    dates: &[NaiveDate],
    policy: CollisionPolicy,
) -> Result<CombineSummary, CombineError> {
    let lock = store.lock_combine()?;

    let existing = store.read_total()?;
    let rows_before = existing.len();
    let (total, summary) = fold_batches(store, existing, dates, policy, rows_before)?;

    store.write_total(&total)?;
    lock.release()?;

    info!(
        batches = summary.batches.len(),
        rows_before = summary.report.rows_before,
        rows_after = summary.report.rows_after,
        "combine finished"
    );
    Ok(summary)
}

/// Rebuilds the total from every materialized batch, ascending by date.
pub fn combine_all(
    store: &BatchStore,
    policy: CollisionPolicy,
) -> Result<CombineSummary, CombineError> {
    let lock = store.lock_combine()?;

    let rows_before = store.read_total()?.len();
    let dates = store.curated_dates()?;
    if dates.is_empty() {
        warn!(dir = %store.curated_dir().display(), "no curated batches to combine");
    }

    let (total, summary) =
        fold_batches(store, CombinedTotal::new(), &dates, policy, rows_before)?;

    store.write_total(&total)?;
    lock.release()?;

    info!(
        batches = summary.batches.len(),
        rows_before = summary.report.rows_before,
        rows_after = summary.report.rows_after,
        "rebuilt combined total"
    );
    Ok(summary)
}
