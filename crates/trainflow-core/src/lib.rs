pub mod combine;
pub mod config;
pub mod enrichment;
pub mod error;
pub mod frames;
pub mod grouping;
pub mod matching;
pub mod pipelines;
pub mod planned;
pub mod resolution;
pub mod runner;
pub mod store;
pub mod trip;

pub use combine::{combine, CollisionPolicy, CombineReport, CombinedTotal, TotalStats};
pub use config::PipelineConfig;
pub use error::{
    AmbiguousMatchError, CombineError, ConfigError, FrameError, PipelineError, ResolutionError,
    StoreError, UnresolvedStationError,
};
pub use pipelines::{
    all_pipelines, find_pipeline, find_planned_pipeline, ExecutionContext, PlannedPipeline,
    PlannedReport, ProcessingPipeline,
};
pub use planned::PlannedTrip;
pub use store::{BatchManifest, BatchStore, CombineLock};
pub use trip::{Trip, TripKey};
