use chrono::{DateTime, NaiveDateTime, TimeZone};
use chrono_tz::Tz;

use crate::errors::ParserError;

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Converts source timestamps into naive wall-clock time of one canonical timezone.
///
/// Timestamps carrying an offset are shifted into the canonical zone. Timestamps without
/// an offset are read as UTC before shifting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalClock {
    timezone: Tz,
}

impl Default for CanonicalClock {
    fn default() -> Self {
        Self { timezone: Tz::UTC }
    }
}

impl CanonicalClock {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    pub fn from_name(name: &str) -> Result<Self, ParserError> {
        name.trim()
            .parse::<Tz>()
            .map(Self::new)
            .map_err(|_| ParserError::UnknownTimezone(name.to_string()))
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Returns `None` for blank or unparseable input; callers decide whether that is an error.
    pub fn parse(&self, raw: &str) -> Option<NaiveDateTime> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
            return Some(self.localize(dt));
        }

        NAIVE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
            .map(|naive| self.shift_utc(naive))
    }

    pub fn localize<O: TimeZone>(&self, dt: DateTime<O>) -> NaiveDateTime {
        dt.with_timezone(&self.timezone).naive_local()
    }

    pub fn shift_utc(&self, naive_utc: NaiveDateTime) -> NaiveDateTime {
        self.localize(naive_utc.and_utc())
    }
}
