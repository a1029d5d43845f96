pub mod announcement;
pub mod clock;
pub mod errors;
pub mod model;
pub mod stations;

pub use announcement::{normalize_record, parse_announcement_batch, NormalizedBatch};
pub use clock::CanonicalClock;
pub use errors::{ParserError, RejectedRecord, SchemaError};
pub use model::{ActivityKind, RawEvent, StationInfo};
pub use stations::{normalize_code, parse_wgs84_point, StationTable};
