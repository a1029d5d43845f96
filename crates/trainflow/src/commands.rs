use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use comfy_table::Table;
use futures::future::join_all;
use tracing::{error, info, warn};
use trainflow_core::runner::{
    combine_all, combine_dates, process_date, process_planned_date, CombineSummary,
};
use trainflow_core::{
    find_pipeline, find_planned_pipeline, BatchManifest, BatchStore, CollisionPolicy,
    ExecutionContext, PipelineConfig, PipelineError, PlannedPipeline, PlannedReport,
    ProcessingPipeline, TotalStats,
};

use crate::dates::{lookback_dates, normalize};

pub struct App {
    config: PipelineConfig,
    store: Arc<BatchStore>,
    context: Arc<ExecutionContext>,
    pipeline: &'static dyn ProcessingPipeline,
    planned: &'static dyn PlannedPipeline,
}

impl App {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let store = BatchStore::new(&config.storage);
        let stations = store
            .load_stations()
            .context("failed to load station table")?;
        let context = ExecutionContext::new(&config, Arc::new(stations))?;
        let pipeline = find_pipeline(&config.processing.pipeline)?;
        let planned = find_planned_pipeline(&config.processing.planned_pipeline)?;

        Ok(Self {
            config,
            store: Arc::new(store),
            context: Arc::new(context),
            pipeline,
            planned,
        })
    }

    pub fn collision_policy(&self) -> CollisionPolicy {
        self.config.combine.collision_policy
    }

    fn today(&self) -> NaiveDate {
        Utc::now()
            .with_timezone(&self.context.clock.timezone())
            .date_naive()
    }

    fn lookback(&self) -> Vec<NaiveDate> {
        lookback_dates(self.today(), self.config.processing.default_lookback_days)
    }

    /// Explicit dates, every raw date, or the lookback window.
    pub fn process_selection(&self, explicit: Vec<NaiveDate>, all: bool) -> Result<Vec<NaiveDate>> {
        if all {
            return self
                .store
                .raw_dates()
                .context("failed to list raw announcement files");
        }
        if !explicit.is_empty() {
            return Ok(normalize(explicit));
        }
        Ok(self.lookback())
    }

    /// Explicit dates are combined as given; the lookback window only covers dates that
    /// already have a curated batch.
    pub fn combine_selection(&self, explicit: Vec<NaiveDate>) -> Result<Vec<NaiveDate>> {
        if !explicit.is_empty() {
            return Ok(normalize(explicit));
        }
        let curated = self
            .store
            .curated_dates()
            .context("failed to list curated batches")?;
        let (present, absent): (Vec<_>, Vec<_>) = self
            .lookback()
            .into_iter()
            .partition(|date| curated.contains(date));
        for date in absent {
            warn!(date = %date, "no curated batch in lookback window; skipping");
        }
        Ok(present)
    }

    /// Explicit dates, every planned date, or tomorrow. Without tomorrow's timetable the most
    /// recent planned date is used instead.
    pub fn planned_selection(&self, explicit: Vec<NaiveDate>, all: bool) -> Result<Vec<NaiveDate>> {
        if !explicit.is_empty() {
            return Ok(normalize(explicit));
        }
        let available = self
            .store
            .planned_raw_dates()
            .context("failed to list planned announcement files")?;
        if all {
            return Ok(available);
        }

        let tomorrow = self.today().succ_opt().unwrap_or_else(|| self.today());
        if available.contains(&tomorrow) {
            return Ok(vec![tomorrow]);
        }
        match available.last() {
            Some(&latest) => {
                warn!(
                    tomorrow = %tomorrow,
                    latest = %latest,
                    "no timetable for tomorrow; using the latest"
                );
                Ok(vec![latest])
            }
            None => bail!(
                "no planned announcements under {}",
                self.store.planned_raw_dir().display()
            ),
        }
    }

    pub fn has_planned_raw(&self) -> Result<bool> {
        Ok(!self
            .store
            .planned_raw_dates()
            .context("failed to list planned announcement files")?
            .is_empty())
    }

    /// Builds the timetable of every date concurrently. Fails only when no date succeeded.
    pub async fn plan(&self, dates: Vec<NaiveDate>) -> Result<Vec<NaiveDate>> {
        if dates.is_empty() {
            bail!("no service dates selected for the timetable");
        }
        info!(
            dates = dates.len(),
            pipeline = self.planned.code_identifier(),
            version = self.planned.version(),
            "building planned timetables"
        );

        let tasks = dates.iter().copied().map(|date| {
            let store = Arc::clone(&self.store);
            let context = Arc::clone(&self.context);
            let pipeline = self.planned;
            let handle = tokio::task::spawn_blocking(move || {
                process_planned_date(&store, &context, pipeline, date)
            });
            async move {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(err) => Err(PipelineError::Task {
                        date,
                        reason: err.to_string(),
                    }),
                };
                (date, result)
            }
        });

        let mut succeeded = Vec::new();
        let mut reports = Vec::new();
        for (date, result) in join_all(tasks).await {
            match result {
                Ok(report) => {
                    succeeded.push(date);
                    reports.push((date, report));
                }
                Err(err) => error!(date = %date, error = %err, "timetable failed"),
            }
        }

        print_planned_table(&reports);

        if succeeded.is_empty() {
            bail!("none of the {} selected timetable dates succeeded", dates.len());
        }
        Ok(succeeded)
    }

    /// Processes every date concurrently and returns the dates that succeeded. Fails only
    /// when no date succeeded.
    pub async fn process(&self, dates: Vec<NaiveDate>) -> Result<Vec<NaiveDate>> {
        if dates.is_empty() {
            bail!("no service dates selected for processing");
        }
        info!(
            dates = dates.len(),
            pipeline = self.pipeline.code_identifier(),
            version = self.pipeline.version(),
            "processing service dates"
        );

        let tasks = dates.iter().copied().map(|date| {
            let store = Arc::clone(&self.store);
            let context = Arc::clone(&self.context);
            let pipeline = self.pipeline;
            let handle = tokio::task::spawn_blocking(move || {
                process_date(&store, &context, pipeline, date)
            });
            async move {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(err) => Err(PipelineError::Task {
                        date,
                        reason: err.to_string(),
                    }),
                };
                (date, result)
            }
        });

        let mut succeeded = Vec::new();
        let mut manifests: Vec<BatchManifest> = Vec::new();
        for (date, result) in join_all(tasks).await {
            match result {
                Ok(manifest) => {
                    succeeded.push(date);
                    manifests.push(manifest);
                }
                Err(err) => error!(date = %date, error = %err, "processing failed"),
            }
        }

        print_process_table(&manifests);

        if succeeded.is_empty() {
            bail!("none of the {} selected dates processed successfully", dates.len());
        }
        if succeeded.len() < dates.len() {
            warn!(
                succeeded = succeeded.len(),
                failed = dates.len() - succeeded.len(),
                "some dates failed to process"
            );
        }
        Ok(succeeded)
    }

    pub async fn combine(&self, dates: Vec<NaiveDate>, policy: CollisionPolicy) -> Result<()> {
        if dates.is_empty() {
            bail!("no curated batches selected for combine");
        }
        let store = Arc::clone(&self.store);
        let summary = tokio::task::spawn_blocking(move || combine_dates(&store, &dates, policy))
            .await
            .context("combine task failed")?
            .context("combine failed; the previous total was left untouched")?;
        print_combine_summary(&summary, policy);
        Ok(())
    }

    pub async fn combine_all(&self, policy: CollisionPolicy) -> Result<()> {
        let store = Arc::clone(&self.store);
        let summary = tokio::task::spawn_blocking(move || combine_all(&store, policy))
            .await
            .context("combine task failed")?
            .context("rebuilding the combined total failed; the previous total was left untouched")?;
        print_combine_summary(&summary, policy);
        Ok(())
    }

    pub fn stats(&self) -> Result<()> {
        let total = self
            .store
            .read_total()
            .context("failed to read combined total")?;
        if total.is_empty() {
            warn!(path = %self.store.total_path().display(), "combined total is empty");
        }
        println!("{}", stats_table(&total.stats()));
        Ok(())
    }
}

fn print_process_table(manifests: &[BatchManifest]) {
    if manifests.is_empty() {
        return;
    }
    let mut table = Table::new();
    table.set_header(vec![
        "Date", "Main", "Canceled", "Rejected", "Dropped", "Unlisted", "Ambiguous",
    ]);
    for manifest in manifests {
        let report = &manifest.report;
        let dropped: usize = report.dropped.values().sum();
        table.add_row(vec![
            manifest.service_date.to_string(),
            report.main_rows.to_string(),
            report.canceled_rows.to_string(),
            report.rejected_records.to_string(),
            dropped.to_string(),
            report.unlisted_combinations.to_string(),
            report.ambiguous_matches.to_string(),
        ]);
    }
    println!("{table}");
}

fn print_planned_table(reports: &[(NaiveDate, PlannedReport)]) {
    if reports.is_empty() {
        return;
    }
    let mut table = Table::new();
    table.set_header(vec![
        "Date", "Trips", "Records", "Rejected", "Duplicates", "Implausible",
    ]);
    for (date, report) in reports {
        table.add_row(vec![
            date.to_string(),
            report.trips.to_string(),
            report.records.to_string(),
            report.rejected_records.to_string(),
            report.duplicates_removed.to_string(),
            report.implausible_duration.to_string(),
        ]);
    }
    println!("{table}");
}

fn print_combine_summary(summary: &CombineSummary, policy: CollisionPolicy) {
    let report = &summary.report;
    let mut table = Table::new();
    table.set_header(vec!["Combine", "Value"]);
    table.add_row(vec!["Batches".to_string(), summary.batches.len().to_string()]);
    table.add_row(vec!["Policy".to_string(), policy.to_string()]);
    table.add_row(vec!["Rows before".to_string(), report.rows_before.to_string()]);
    table.add_row(vec!["Rows after".to_string(), report.rows_after.to_string()]);
    table.add_row(vec!["Inserted".to_string(), report.inserted.to_string()]);
    table.add_row(vec!["Replaced".to_string(), report.replaced.to_string()]);
    table.add_row(vec!["Kept existing".to_string(), report.kept_existing.to_string()]);
    println!("{table}");
    println!("{}", stats_table(&summary.stats));
}

fn stats_table(stats: &TotalStats) -> Table {
    let date_or_dash = |date: Option<NaiveDate>| {
        date.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string())
    };

    let mut table = Table::new();
    table.set_header(vec!["Total", "Value"]);
    table.add_row(vec!["Rows".to_string(), stats.rows.to_string()]);
    table.add_row(vec!["First date".to_string(), date_or_dash(stats.first_date)]);
    table.add_row(vec!["Last date".to_string(), date_or_dash(stats.last_date)]);
    table.add_row(vec!["Distinct dates".to_string(), stats.distinct_dates.to_string()]);
    table.add_row(vec!["Distinct trains".to_string(), stats.distinct_trains.to_string()]);
    table.add_row(vec!["Delayed trips".to_string(), stats.delayed.to_string()]);
    table.add_row(vec![
        "Delayed %".to_string(),
        format!("{:.2}", stats.delayed_percentage),
    ]);
    table
}
