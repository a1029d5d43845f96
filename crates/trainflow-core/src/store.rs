use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use blake3::Hasher;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use trainflow_parser::{parse_announcement_batch, CanonicalClock, NormalizedBatch, StationTable};
use uuid::Uuid;

use crate::combine::CombinedTotal;
use crate::config::StorageConfig;
use crate::error::{CombineError, StoreError};
use crate::frames::{planned_to_parquet, trips_from_parquet, trips_to_parquet};
use crate::pipelines::{CuratedBatch, ProcessingReport};
use crate::planned::PlannedTrip;
use crate::trip::Trip;

const CURATED_STEM: &str = "trips_combined";
const PLANNED_STEM: &str = "trips_planned";

/// A combine lock older than this is taken over even when its holder cannot be checked.
pub const STALE_LOCK_HOURS: i64 = 6;

/// Completion marker of a curated batch, written after both parquet files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchManifest {
    pub service_date: NaiveDate,
    pub run_id: Uuid,
    pub pipeline: String,
    pub pipeline_version: String,
    pub created_at: DateTime<Utc>,
    pub main_file: String,
    pub main_blake3: String,
    pub main_rows: usize,
    pub canceled_file: String,
    pub canceled_blake3: String,
    pub canceled_rows: usize,
    pub report: ProcessingReport,
}

pub fn date_tag(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

pub fn parse_date_tag(tag: &str) -> Option<NaiveDate> {
    if tag.len() != 8 || !tag.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(tag, "%Y%m%d").ok()
}

pub fn compute_hash(contents: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(contents);
    let hash = hasher.finalize();
    hash.to_hex().to_string()
}

/// Writes `contents` to a temporary sibling and renames it over `path`.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| StoreError::io(parent, err))?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    fs::write(&temp_path, contents).map_err(|err| StoreError::io(&temp_path, err))?;
    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(StoreError::io(path, err));
    }
    Ok(())
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

/// Normalizes and merges the announcement files that exist among `paths`. Returns `None`
/// when none of them exists.
fn read_announcements(
    paths: [PathBuf; 2],
    clock: &CanonicalClock,
) -> Result<Option<NormalizedBatch>, StoreError> {
    let mut combined: Option<NormalizedBatch> = None;

    for path in paths {
        let Some(bytes) = read_optional(&path)? else {
            debug!(path = %path.display(), "raw file not present");
            continue;
        };
        let batch = parse_announcement_batch(&bytes, clock)?;
        info!(
            path = %path.display(),
            records = batch.total_records(),
            events = batch.events.len(),
            rejected = batch.rejected.len(),
            "loaded raw announcements"
        );
        match combined.as_mut() {
            Some(existing) => existing.extend(batch),
            None => combined = Some(batch),
        }
    }

    Ok(combined)
}

fn announcement_dates(dir: &Path) -> Result<Vec<NaiveDate>, StoreError> {
    let mut dates = Vec::new();
    for prefix in ["departures_", "arrivals_"] {
        let pattern = dir.join(format!("{prefix}*.json"));
        for path in glob::glob(&pattern.to_string_lossy())?.flatten() {
            let date = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.strip_prefix(prefix))
                .and_then(parse_date_tag);
            if let Some(date) = date {
                dates.push(date);
            }
        }
    }
    dates.sort();
    dates.dedup();
    Ok(dates)
}

/// Local filesystem layout for raw announcements, curated batches, and the combined total.
#[derive(Debug, Clone)]
pub struct BatchStore {
    raw_dir: PathBuf,
    curated_dir: PathBuf,
    planned_raw_dir: PathBuf,
    planned_dir: PathBuf,
    station_info: PathBuf,
}

impl BatchStore {
    pub fn new(config: &StorageConfig) -> Self {
        let raw_dir = config.root.join(&config.raw_prefix);
        let curated_dir = config.root.join(&config.curated_prefix);
        let station_info = if config.station_info.is_absolute() {
            config.station_info.clone()
        } else {
            raw_dir.join(&config.station_info)
        };
        Self {
            planned_raw_dir: raw_dir.join(&config.planned_prefix),
            planned_dir: curated_dir.join(&config.planned_prefix),
            raw_dir,
            curated_dir,
            station_info,
        }
    }

    pub fn at_root(root: impl Into<PathBuf>) -> Self {
        Self::new(&StorageConfig {
            root: root.into(),
            ..StorageConfig::default()
        })
    }

    pub fn raw_dir(&self) -> &Path {
        &self.raw_dir
    }

    pub fn curated_dir(&self) -> &Path {
        &self.curated_dir
    }

    pub fn planned_raw_dir(&self) -> &Path {
        &self.planned_raw_dir
    }

    pub fn planned_dir(&self) -> &Path {
        &self.planned_dir
    }

    pub fn station_info_path(&self) -> &Path {
        &self.station_info
    }

    pub fn departures_path(&self, date: NaiveDate) -> PathBuf {
        self.raw_dir
            .join(format!("departures_{}.json", date_tag(date)))
    }

    pub fn arrivals_path(&self, date: NaiveDate) -> PathBuf {
        self.raw_dir.join(format!("arrivals_{}.json", date_tag(date)))
    }

    pub fn main_path(&self, date: NaiveDate) -> PathBuf {
        self.curated_dir
            .join(format!("{CURATED_STEM}_{}.parquet", date_tag(date)))
    }

    pub fn canceled_path(&self, date: NaiveDate) -> PathBuf {
        self.curated_dir
            .join(format!("{CURATED_STEM}_{}_canceled.parquet", date_tag(date)))
    }

    pub fn manifest_path(&self, date: NaiveDate) -> PathBuf {
        self.curated_dir
            .join(format!("{CURATED_STEM}_{}.manifest.json", date_tag(date)))
    }

    pub fn planned_departures_path(&self, date: NaiveDate) -> PathBuf {
        self.planned_raw_dir
            .join(format!("departures_{}.json", date_tag(date)))
    }

    pub fn planned_arrivals_path(&self, date: NaiveDate) -> PathBuf {
        self.planned_raw_dir
            .join(format!("arrivals_{}.json", date_tag(date)))
    }

    pub fn planned_path(&self, date: NaiveDate) -> PathBuf {
        self.planned_dir
            .join(format!("{PLANNED_STEM}_{}.parquet", date_tag(date)))
    }

    pub fn planned_latest_path(&self) -> PathBuf {
        self.planned_dir.join(format!("{PLANNED_STEM}_latest.parquet"))
    }

    pub fn total_path(&self) -> PathBuf {
        self.curated_dir
            .join(format!("{CURATED_STEM}_total.parquet"))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.curated_dir.join(format!("{CURATED_STEM}_total.lock"))
    }

    /// Normalizes the raw departure and arrival files of `date`. Returns `None` when neither
    /// file exists.
    pub fn read_raw(
        &self,
        date: NaiveDate,
        clock: &CanonicalClock,
    ) -> Result<Option<NormalizedBatch>, StoreError> {
        read_announcements([self.departures_path(date), self.arrivals_path(date)], clock)
    }

    /// Timetable counterpart of [`BatchStore::read_raw`], reading `raw/planned/`.
    pub fn read_planned_raw(
        &self,
        date: NaiveDate,
        clock: &CanonicalClock,
    ) -> Result<Option<NormalizedBatch>, StoreError> {
        read_announcements(
            [self.planned_departures_path(date), self.planned_arrivals_path(date)],
            clock,
        )
    }

    /// Dates with at least one raw departures or arrivals file, ascending.
    pub fn raw_dates(&self) -> Result<Vec<NaiveDate>, StoreError> {
        announcement_dates(&self.raw_dir)
    }

    /// Dates with at least one planned departures or arrivals file, ascending.
    pub fn planned_raw_dates(&self) -> Result<Vec<NaiveDate>, StoreError> {
        announcement_dates(&self.planned_raw_dir)
    }

    /// Dates with a main curated parquet file, ascending. Cancelled outputs and the total
    /// are not batches.
    pub fn curated_dates(&self) -> Result<Vec<NaiveDate>, StoreError> {
        let pattern = self
            .curated_dir
            .join(format!("{CURATED_STEM}_*.parquet"));
        let mut dates: Vec<NaiveDate> = glob::glob(&pattern.to_string_lossy())?
            .flatten()
            .filter_map(|path| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .and_then(|stem| stem.strip_prefix(CURATED_STEM))
                    .and_then(|rest| rest.strip_prefix('_'))
                    .and_then(parse_date_tag)
            })
            .collect();
        dates.sort();
        dates.dedup();
        Ok(dates)
    }

    /// Loads the station table. A missing file yields an empty table.
    pub fn load_stations(&self) -> Result<StationTable, StoreError> {
        match fs::File::open(&self.station_info) {
            Ok(file) => {
                let table = StationTable::from_csv_reader(file)?;
                info!(
                    path = %self.station_info.display(),
                    stations = table.len(),
                    "loaded station table"
                );
                Ok(table)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(
                    path = %self.station_info.display(),
                    "station table not found; station features will be absent"
                );
                Ok(StationTable::empty())
            }
            Err(err) => Err(StoreError::io(&self.station_info, err)),
        }
    }

    /// Materializes a curated batch: main parquet, cancelled parquet, then the manifest.
    pub fn write_batch(&self, batch: &CuratedBatch) -> Result<BatchManifest, StoreError> {
        let date = batch.service_date;
        let main_path = self.main_path(date);
        let canceled_path = self.canceled_path(date);
        let manifest_path = self.manifest_path(date);

        // A stale manifest must not vouch for the files about to be replaced.
        match fs::remove_file(&manifest_path) {
            Ok(()) => debug!(path = %manifest_path.display(), "removed previous manifest"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(StoreError::io(&manifest_path, err)),
        }

        let main_bytes = trips_to_parquet(&batch.main)?;
        let canceled_bytes = trips_to_parquet(&batch.canceled)?;
        write_atomic(&main_path, &main_bytes)?;
        write_atomic(&canceled_path, &canceled_bytes)?;

        let manifest = BatchManifest {
            service_date: date,
            run_id: batch.run_id,
            pipeline: batch.pipeline.clone(),
            pipeline_version: batch.pipeline_version.clone(),
            created_at: Utc::now(),
            main_file: file_name(&main_path),
            main_blake3: compute_hash(&main_bytes),
            main_rows: batch.main.len(),
            canceled_file: file_name(&canceled_path),
            canceled_blake3: compute_hash(&canceled_bytes),
            canceled_rows: batch.canceled.len(),
            report: batch.report.clone(),
        };
        let manifest_bytes =
            serde_json::to_vec_pretty(&manifest).map_err(|source| StoreError::Json {
                path: manifest_path.clone(),
                source,
            })?;
        write_atomic(&manifest_path, &manifest_bytes)?;

        info!(
            date = %date,
            main_rows = manifest.main_rows,
            canceled_rows = manifest.canceled_rows,
            run_id = %manifest.run_id,
            "wrote curated batch"
        );
        Ok(manifest)
    }

    pub fn read_manifest(&self, date: NaiveDate) -> Result<Option<BatchManifest>, StoreError> {
        let path = self.manifest_path(date);
        let Some(bytes) = read_optional(&path)? else {
            return Ok(None);
        };
        let manifest =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Json { path, source })?;
        Ok(Some(manifest))
    }

    /// Reads the main output of a complete batch. The manifest must exist and its hash and
    /// row count must match the parquet file.
    pub fn read_batch_main(&self, date: NaiveDate) -> Result<Vec<Trip>, StoreError> {
        let incomplete = |reason: &str| StoreError::IncompleteBatch {
            date,
            reason: reason.to_string(),
        };

        let manifest = self
            .read_manifest(date)?
            .ok_or_else(|| incomplete("manifest missing"))?;
        let bytes =
            read_optional(&self.main_path(date))?.ok_or_else(|| incomplete("main output missing"))?;

        if compute_hash(&bytes) != manifest.main_blake3 {
            return Err(incomplete("main output hash does not match manifest"));
        }

        let trips = trips_from_parquet(&bytes)?;
        if trips.len() != manifest.main_rows {
            return Err(incomplete("main output row count does not match manifest"));
        }
        Ok(trips)
    }

    pub fn read_total(&self) -> Result<CombinedTotal, StoreError> {
        let path = self.total_path();
        match read_optional(&path)? {
            Some(bytes) => Ok(CombinedTotal::from_trips(trips_from_parquet(&bytes)?)),
            None => Ok(CombinedTotal::new()),
        }
    }

    pub fn write_total(&self, total: &CombinedTotal) -> Result<(), StoreError> {
        let bytes = trips_to_parquet(&total.to_trips())?;
        write_atomic(&self.total_path(), &bytes)?;
        info!(rows = total.len(), path = %self.total_path().display(), "wrote combined total");
        Ok(())
    }

    /// Writes the timetable of `date` and refreshes the `latest` copy with the same bytes.
    pub fn write_planned(
        &self,
        date: NaiveDate,
        trips: &[PlannedTrip],
    ) -> Result<PathBuf, StoreError> {
        let bytes = planned_to_parquet(trips)?;
        let path = self.planned_path(date);
        write_atomic(&path, &bytes)?;
        write_atomic(&self.planned_latest_path(), &bytes)?;
        info!(date = %date, rows = trips.len(), path = %path.display(), "wrote planned trips");
        Ok(path)
    }

    pub fn lock_combine(&self) -> Result<CombineLock, CombineError> {
        CombineLock::acquire(self.lock_path())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Exclusive lock over the combined total, held as a lock file created with create-new
/// semantics. Released explicitly or on drop.
///
/// The file records `pid=<holder> acquired=<rfc3339>`. A lock whose holder is no longer
/// running, or which is older than [`STALE_LOCK_HOURS`], is removed and acquired again so a
/// crashed run cannot block every later combine.
#[derive(Debug)]
pub struct CombineLock {
    path: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct LockHolder {
    pid: Option<u32>,
    acquired: Option<DateTime<Utc>>,
}

impl LockHolder {
    fn parse(contents: &str) -> Self {
        let mut holder = Self::default();
        for field in contents.split_whitespace() {
            if let Some(pid) = field.strip_prefix("pid=") {
                holder.pid = pid.parse().ok();
            } else if let Some(acquired) = field.strip_prefix("acquired=") {
                holder.acquired = DateTime::parse_from_rfc3339(acquired)
                    .ok()
                    .map(|at| at.with_timezone(&Utc));
            }
        }
        holder
    }
}

#[cfg(target_os = "linux")]
fn process_running(pid: u32) -> Option<bool> {
    Some(Path::new("/proc").join(pid.to_string()).exists())
}

#[cfg(not(target_os = "linux"))]
fn process_running(_pid: u32) -> Option<bool> {
    None
}

fn read_lock(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

/// Why the lock at `path` holding `contents` no longer protects anything, or `None` while
/// it is live.
fn stale_lock_reason(
    path: &Path,
    contents: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<String>, StoreError> {
    let Some(contents) = contents else {
        return Ok(Some("lock file disappeared".to_string()));
    };
    let holder = LockHolder::parse(contents);
    let max_age = TimeDelta::hours(STALE_LOCK_HOURS);

    if let Some(pid) = holder.pid {
        if process_running(pid) == Some(false) {
            return Ok(Some(format!("holder pid {pid} is not running")));
        }
    }

    // The holder line is written right after creation; fall back to the file age meanwhile.
    let acquired = match holder.acquired {
        Some(acquired) => acquired,
        None => {
            let modified = fs::metadata(path)
                .and_then(|meta| meta.modified())
                .map_err(|err| StoreError::io(path, err))?;
            DateTime::<Utc>::from(modified)
        }
    };
    if now - acquired > max_age {
        return Ok(Some(format!(
            "held since {} (more than {STALE_LOCK_HOURS} hours)",
            acquired.to_rfc3339()
        )));
    }
    Ok(None)
}

fn create_lock_file(path: &Path) -> Result<Option<File>, StoreError> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(None),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

impl CombineLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, CombineError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| StoreError::io(parent, err))?;
        }

        let mut file = match create_lock_file(&path)? {
            Some(file) => file,
            None => {
                let observed = read_lock(&path)?;
                let Some(reason) = stale_lock_reason(&path, observed.as_deref(), Utc::now())?
                else {
                    return Err(CombineError::Locked { path });
                };
                // Only the holder that was judged stale may be removed.
                if observed.is_some() {
                    if read_lock(&path)? != observed {
                        return Err(CombineError::Locked { path });
                    }
                    warn!(path = %path.display(), %reason, "taking over stale combine lock");
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(err) if err.kind() == ErrorKind::NotFound => {}
                        Err(err) => return Err(StoreError::io(&path, err).into()),
                    }
                }
                // Another run may have taken the lock in between.
                create_lock_file(&path)?
                    .ok_or_else(|| CombineError::Locked { path: path.clone() })?
            }
        };

        let holder = format!("pid={} acquired={}\n", std::process::id(), Utc::now().to_rfc3339());
        if let Err(err) = file.write_all(holder.as_bytes()) {
            warn!(path = %path.display(), "failed to record lock holder: {err}");
        }

        debug!(path = %path.display(), "acquired combine lock");
        Ok(Self { path: Some(path) })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn release(mut self) -> Result<(), StoreError> {
        if let Some(path) = self.path.take() {
            fs::remove_file(&path).map_err(|err| StoreError::io(&path, err))?;
            debug!(path = %path.display(), "released combine lock");
        }
        Ok(())
    }
}

impl Drop for CombineLock {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(err) = fs::remove_file(&path) {
                warn!("failed to release combine lock in drop: {err}");
            }
        }
    }
}
